#![allow(unsafe_op_in_unsafe_fn)]

use crate::task::harness::Harness;
use crate::task::header::Header;
use crate::task::state::TaskState;
use crate::task::trailer::Trailer;
use std::cell::UnsafeCell;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::ptr::NonNull;
use std::task::{Context, Poll};

/// The task cell. Contains the components of the task.
///
/// It is critical for `Header` to be the first field as the task structure
/// will be referenced through both `*mut TaskLayout` and `*mut Header`.
///
/// Any changes to the layout of this struct _must_ also be reflected in the
/// offset computation below.
#[repr(C)]
pub(super) struct TaskLayout<F: Future> {
    /// Hot task state data.
    pub(super) header: Header,

    /// Either the future or its output, depending on the execution stage.
    pub(super) core: Core<F>,

    /// Cold data: the suspension records.
    pub(super) trailer: Trailer,
}

impl<F: Future> TaskLayout<F> {
    /// Allocates a new task cell, containing the header, core and trailer
    /// structures.
    pub(super) fn new(future: F) -> Box<TaskLayout<F>> {
        let result = Box::new(TaskLayout {
            header: Header::new(vtable::<F>()),
            core: Core {
                stage: CoreStage {
                    stage: UnsafeCell::new(Stage::Running(future)),
                },
            },
            trailer: Trailer::new(),
        });

        #[cfg(debug_assertions)]
        {
            // Using a separate function for this code avoids instantiating
            // it separately for every `F`.
            unsafe fn check(header: &Header, trailer: &Trailer) {
                let trailer_addr = trailer as *const Trailer as usize;
                let trailer_ptr = unsafe { Header::get_trailer(NonNull::from(header)) };
                assert_eq!(trailer_addr, trailer_ptr.as_ptr() as usize);
            }

            unsafe {
                check(&result.header, &result.trailer);
            }
        }

        result
    }
}

/// The core of the task.
///
/// Holds the future or the output, depending on the stage of execution.
#[repr(C)]
pub(super) struct Core<F: Future> {
    pub(super) stage: CoreStage<F>,
}

pub(super) struct CoreStage<F: Future> {
    stage: UnsafeCell<Stage<F>>,
}

/// Either the future or the output.
#[repr(C)]
pub(super) enum Stage<F: Future> {
    Running(F),
    Finished(super::Result<F::Output>),
    Consumed,
}

impl<F: Future> CoreStage<F> {
    pub(super) fn with_mut<R>(&self, f: impl FnOnce(*mut Stage<F>) -> R) -> R {
        f(self.stage.get())
    }
}

impl<F: Future> Core<F> {
    /// Polls the future once.
    ///
    /// # Safety
    ///
    /// The caller must ensure mutual exclusion on the `stage` field: only
    /// one thread processes a given ready-queue handle at a time, and a
    /// completed task is never resumed.
    ///
    /// `self` must also be pinned. This is handled by keeping the task on
    /// the heap.
    pub(super) fn poll(&self, mut cx: Context<'_>) -> Poll<F::Output> {
        let res = self.stage.with_mut(|ptr| {
            // Safety: the caller ensures mutual exclusion on the field.
            let future = match unsafe { &mut *ptr } {
                Stage::Running(future) => future,
                _ => unreachable!("unexpected stage"),
            };

            // Safety: the caller ensures the future is pinned.
            let future = unsafe { Pin::new_unchecked(future) };
            future.poll(&mut cx)
        });

        if res.is_ready() {
            self.drop_future_or_output();
        }

        res
    }

    /// Drops the future or an unread output.
    ///
    /// # Safety
    ///
    /// The caller must ensure it is safe to mutate the `stage` field.
    pub(super) fn drop_future_or_output(&self) {
        // Safety: the caller ensures mutual exclusion on the field.
        unsafe {
            self.set_stage(Stage::Consumed);
        }
    }

    /// Stores the task output.
    ///
    /// # Safety
    ///
    /// The caller must ensure it is safe to mutate the `stage` field.
    pub(super) fn store_output(&self, output: super::Result<F::Output>) {
        // Safety: the caller ensures mutual exclusion on the field.
        unsafe {
            self.set_stage(Stage::Finished(output));
        }
    }

    /// Takes the task output.
    ///
    /// # Safety
    ///
    /// The caller must ensure it is safe to mutate the `stage` field.
    pub(super) fn take_output(&self) -> super::Result<F::Output> {
        self.stage.with_mut(|ptr| {
            // Safety: the caller ensures mutual exclusion on the field.
            match mem::replace(unsafe { &mut *ptr }, Stage::Consumed) {
                Stage::Finished(output) => output,
                _ => panic!("task output already consumed"),
            }
        })
    }

    unsafe fn set_stage(&self, stage: Stage<F>) {
        self.stage.with_mut(|ptr| *ptr = stage);
    }
}

pub(crate) struct Vtable {
    /// Resumes the task once and reports the state it was left in.
    pub(super) run: unsafe fn(NonNull<Header>) -> TaskState,

    /// Deallocates the task cell.
    pub(super) dealloc: unsafe fn(NonNull<Header>),

    /// Destroys the frame: drops the future or an unread output.
    pub(super) destroy: unsafe fn(NonNull<Header>),

    /// Moves the output into `dst`, a `*mut Option<Result<F::Output>>`.
    pub(super) read_output: unsafe fn(NonNull<Header>, *mut ()),

    /// The number of bytes the `trailer` field is offset from the header.
    pub(super) trailer_offset: usize,
}

/// Get the vtable for the requested `F` generic.
pub(super) fn vtable<F: Future>() -> &'static Vtable {
    &Vtable {
        run: run::<F>,
        dealloc: dealloc::<F>,
        destroy: destroy::<F>,
        read_output: read_output::<F>,
        trailer_offset: OffsetHelper::<F>::TRAILER_OFFSET,
    }
}

/// Calling `get_trailer_offset` directly in the vtable literal would
/// prevent it from being promoted to a static reference, so the constant
/// lives on a helper type.
///
/// See this thread for more info:
/// <https://users.rust-lang.org/t/custom-vtables-with-integers/78508>
struct OffsetHelper<F>(F);

impl<F: Future> OffsetHelper<F> {
    const TRAILER_OFFSET: usize = get_trailer_offset(
        std::mem::size_of::<Header>(),
        std::mem::size_of::<Core<F>>(),
        std::mem::align_of::<Core<F>>(),
        std::mem::align_of::<Trailer>(),
    );
}

/// Compute the offset of the `Trailer` field in `TaskLayout<F>` using the
/// `#[repr(C)]` algorithm.
///
/// Pseudo-code for the `#[repr(C)]` algorithm can be found here:
/// <https://doc.rust-lang.org/reference/type-layout.html#reprc-structs>
const fn get_trailer_offset(
    header_size: usize,
    core_size: usize,
    core_align: usize,
    trailer_align: usize,
) -> usize {
    let mut offset = header_size;

    let core_misalign = offset % core_align;
    if core_misalign > 0 {
        offset += core_align - core_misalign;
    }
    offset += core_size;

    let trailer_misalign = offset % trailer_align;
    if trailer_misalign > 0 {
        offset += trailer_align - trailer_misalign;
    }

    offset
}

unsafe fn run<F: Future>(ptr: NonNull<Header>) -> TaskState {
    let harness = Harness::<F>::from_raw(ptr);
    harness.run()
}

unsafe fn dealloc<F: Future>(ptr: NonNull<Header>) {
    let harness = Harness::<F>::from_raw(ptr);
    harness.dealloc();
}

unsafe fn destroy<F: Future>(ptr: NonNull<Header>) {
    let harness = Harness::<F>::from_raw(ptr);
    harness.destroy();
}

unsafe fn read_output<F: Future>(ptr: NonNull<Header>, dst: *mut ()) {
    let out = &mut *(dst as *mut Option<super::Result<F::Output>>);

    let harness = Harness::<F>::from_raw(ptr);
    harness.read_output(out);
}
