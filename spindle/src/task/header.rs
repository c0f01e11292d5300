#![allow(unsafe_op_in_unsafe_fn)]

use crate::task::layout::Vtable;
use crate::task::raw::OwnedTask;
use crate::task::state::{AtomicState, TaskState};
use crate::task::trailer::Trailer;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

/// Hot per-task data. A `Header` is what every handle points at; the rest
/// of the cell (future, suspension records) is reached through the vtable
/// offset, so type-erased code only ever needs this struct.
pub(crate) struct Header {
    /// Task state machine.
    pub(super) state: AtomicState,

    /// Number of live handles to this cell. The cell is freed when the last
    /// handle drops; destroying the frame is a separate operation.
    refs: AtomicUsize,

    /// Set whenever the task is pushed to a ready queue, never cleared.
    /// Guards against a second enqueue when a spawned child is awaited.
    enqueued: AtomicBool,

    /// Fire-and-forget: the scheduler destroys the frame on completion.
    reclaim: AtomicBool,

    /// Parent task to re-enqueue when this task completes. Owns one handle
    /// while non-null. Written with release, consumed with an acquire swap
    /// so completion and callback wiring can race safely across workers.
    callback: AtomicPtr<Header>,

    /// Table of function pointers for operating on the task.
    pub(super) vtable: &'static Vtable,
}

unsafe impl Send for Header {}
unsafe impl Sync for Header {}

impl Header {
    pub(super) fn new(vtable: &'static Vtable) -> Header {
        Header {
            state: AtomicState::new(),
            refs: AtomicUsize::new(1),
            enqueued: AtomicBool::new(false),
            reclaim: AtomicBool::new(false),
            callback: AtomicPtr::new(ptr::null_mut()),
            vtable,
        }
    }

    pub(crate) fn state(&self) -> TaskState {
        self.state.load()
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.store(state);
    }

    pub(crate) fn ref_inc(&self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns true when the caller dropped the last handle and must free
    /// the cell.
    pub(crate) fn ref_dec(&self) -> bool {
        self.refs.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Mark the task as living in a ready queue. Returns whether it already
    /// was; the caller only pushes when this comes back false.
    pub(crate) fn mark_enqueued(&self) -> bool {
        self.enqueued.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_enqueued(&self) -> bool {
        self.enqueued.load(Ordering::Acquire)
    }

    pub(crate) fn set_reclaim_on_complete(&self) {
        self.reclaim.store(true, Ordering::Release);
    }

    pub(crate) fn reclaim_on_complete(&self) -> bool {
        self.reclaim.load(Ordering::Acquire)
    }

    /// Install the task to resume on completion. The slot owns the handle
    /// until completion consumes it.
    pub(crate) fn set_callback(&self, parent: OwnedTask) {
        let ptr = parent.into_raw().header_ptr().as_ptr();
        let prev = self.callback.swap(ptr, Ordering::AcqRel);
        if let Some(prev) = NonNull::new(prev) {
            // Two awaiters on one task violates the single-waiter contract.
            tracing::error!("task already had a completion callback; dropping the previous one");
            drop(unsafe { OwnedTask::from_header_ptr(prev) });
        }
    }

    /// One-shot consume of the callback slot.
    pub(crate) fn take_callback(&self) -> Option<OwnedTask> {
        let prev = self.callback.swap(ptr::null_mut(), Ordering::AcqRel);
        NonNull::new(prev).map(|ptr| unsafe { OwnedTask::from_header_ptr(ptr) })
    }

    /// Gets a pointer to the `Trailer` of the task containing this `Header`.
    pub(super) unsafe fn get_trailer(me: NonNull<Header>) -> NonNull<Trailer> {
        let offset = me.as_ref().vtable.trailer_offset;
        let trailer = me.as_ptr().cast::<u8>().add(offset).cast::<Trailer>();
        NonNull::new_unchecked(trailer)
    }
}

impl Drop for Header {
    fn drop(&mut self) {
        // Release a callback handle that was never consumed (a task leaked
        // at shutdown while a parent still awaited it).
        drop(self.take_callback());
    }
}
