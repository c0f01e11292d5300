#![allow(unsafe_op_in_unsafe_fn)]

use crate::io::IoWaitable;
use crate::task::raw::{OwnedTask, RawTask};
use std::cell::UnsafeCell;

/// Cold per-task data: the records of the current suspension, stored after
/// the future. At most one of the two is populated at any stable point.
///
/// Access rule: only the thread currently polling or dispatching the task
/// may touch these cells. Handoff between workers is ordered by the ready
/// queues, so no locking is needed here.
pub(crate) struct Trailer {
    /// Child task this task is suspended on. Owned here from the moment the
    /// await records it until the scheduler consumes it on the next resume.
    awaiting_child: UnsafeCell<Option<OwnedTask>>,

    /// Descriptor of the I/O suspension behind a `BlockedOnIo` state.
    io_waitable: UnsafeCell<Option<IoWaitable>>,
}

impl Trailer {
    pub(super) fn new() -> Trailer {
        Trailer {
            awaiting_child: UnsafeCell::new(None),
            io_waitable: UnsafeCell::new(None),
        }
    }

    pub(crate) unsafe fn set_awaiting_child(&self, child: OwnedTask) {
        *self.awaiting_child.get() = Some(child);
    }

    pub(crate) unsafe fn take_awaiting_child(&self) -> Option<OwnedTask> {
        (*self.awaiting_child.get()).take()
    }

    /// Non-owning copy of the awaited child, if any.
    pub(crate) unsafe fn awaiting_child_raw(&self) -> Option<RawTask> {
        (*self.awaiting_child.get()).as_ref().map(OwnedTask::raw)
    }

    pub(crate) unsafe fn set_io_waitable(&self, waitable: IoWaitable) {
        *self.io_waitable.get() = Some(waitable);
    }

    pub(crate) unsafe fn take_io_waitable(&self) -> Option<IoWaitable> {
        (*self.io_waitable.get()).take()
    }
}
