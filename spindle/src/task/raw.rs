#![allow(unsafe_op_in_unsafe_fn)]

use crate::task::header::Header;
use crate::task::layout::TaskLayout;
use crate::task::state::TaskState;
use crate::task::trailer::Trailer;
use std::fmt;
use std::future::Future;
use std::mem;
use std::ptr::NonNull;

/// Raw task handle: a type-erased pointer into the task cell. Copying it
/// does not touch the reference count.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawTask {
    ptr: NonNull<Header>,
}

impl RawTask {
    pub(crate) fn new<F>(future: F) -> RawTask
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let ptr = Box::into_raw(TaskLayout::new(future));
        let ptr = unsafe { NonNull::new_unchecked(ptr.cast()) };
        RawTask { ptr }
    }

    pub(crate) unsafe fn from_header_ptr(ptr: NonNull<Header>) -> RawTask {
        RawTask { ptr }
    }

    pub(crate) fn header_ptr(&self) -> NonNull<Header> {
        self.ptr
    }

    /// Returns a reference to the task's header.
    pub(crate) fn header(&self) -> &Header {
        unsafe { self.ptr.as_ref() }
    }

    /// Returns a reference to the task's trailer.
    pub(crate) fn trailer(&self) -> &Trailer {
        unsafe { &*Header::get_trailer(self.ptr).as_ptr() }
    }

    pub(crate) fn state(&self) -> TaskState {
        self.header().state()
    }

    /// Resume the underlying frame once and report the state it left the
    /// task in. Precondition: state is not `Complete`, and the caller holds
    /// the only in-flight handle being processed.
    pub(crate) fn run(self) -> TaskState {
        let vtable = self.header().vtable;
        unsafe { (vtable.run)(self.ptr) }
    }

    pub(super) fn dealloc(self) {
        let vtable = self.header().vtable;
        unsafe {
            (vtable.dealloc)(self.ptr);
        }
    }

    /// Destroy the frame: drop the future or an unread output. Separate
    /// from handle deallocation; called exactly once per task.
    pub(crate) fn destroy(self) {
        let vtable = self.header().vtable;
        unsafe {
            (vtable.destroy)(self.ptr);
        }
    }

    /// Safety: `dst` must be a `*mut Option<Result<F::Output>>` where `F`
    /// is the future stored by the task, and the task must be `Complete`.
    pub(crate) unsafe fn read_output(self, dst: *mut ()) {
        let vtable = self.header().vtable;
        (vtable.read_output)(self.ptr, dst);
    }

    pub(crate) fn ref_inc(self) {
        self.header().ref_inc();
    }

    pub(crate) fn drop_reference(self) {
        if self.header().ref_dec() {
            self.dealloc();
        }
    }
}

/// An owned, reference-counted handle to a task. This is what lives in the
/// ready queues, in a parent's suspension record, in a child's callback
/// slot and inside the reactor's continuations.
pub(crate) struct OwnedTask {
    raw: RawTask,
}

// Safety: the cell is freed only when the last handle drops, and the frame
// is only ever touched by the thread currently processing the task.
unsafe impl Send for OwnedTask {}
unsafe impl Sync for OwnedTask {}

impl OwnedTask {
    /// Take over an existing reference (does not bump the count).
    pub(crate) fn adopt(raw: RawTask) -> OwnedTask {
        OwnedTask { raw }
    }

    /// New handle to the same frame.
    pub(crate) fn from_raw_ref(raw: RawTask) -> OwnedTask {
        raw.ref_inc();
        OwnedTask { raw }
    }

    /// Adopt the reference held behind a stored header pointer.
    pub(crate) unsafe fn from_header_ptr(ptr: NonNull<Header>) -> OwnedTask {
        OwnedTask {
            raw: RawTask::from_header_ptr(ptr),
        }
    }

    /// Give up ownership without releasing the reference.
    pub(crate) fn into_raw(self) -> RawTask {
        let raw = self.raw;
        mem::forget(self);
        raw
    }

    pub(crate) fn raw(&self) -> RawTask {
        self.raw
    }

    pub(crate) fn header(&self) -> &Header {
        self.raw.header()
    }

    pub(crate) fn state(&self) -> TaskState {
        self.raw.state()
    }

    pub(crate) fn run(&self) -> TaskState {
        self.raw.run()
    }

    #[cfg(test)]
    pub(crate) fn addr(&self) -> usize {
        self.raw.header_ptr().as_ptr() as usize
    }
}

impl Drop for OwnedTask {
    fn drop(&mut self) {
        self.raw.drop_reference();
    }
}

impl fmt::Debug for OwnedTask {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "OwnedTask({:p})", self.raw.header())
    }
}
