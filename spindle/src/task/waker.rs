use std::ptr;
use std::task::{RawWaker, RawWakerVTable, Waker};

// Tasks are not woken through `Waker`s: a leaf future records the reason
// for its suspension on the current task, and the scheduler resolves it
// into the next enqueue. The waker handed to `poll` is therefore inert; a
// foreign future that relies on it will never be woken (suspending through
// anything but the runtime's own awaitables is outside the contract).

unsafe fn clone_waker(_: *const ()) -> RawWaker {
    raw_waker()
}

unsafe fn wake(_: *const ()) {}

unsafe fn wake_by_ref(_: *const ()) {}

unsafe fn drop_waker(_: *const ()) {}

static WAKER_VTABLE: RawWakerVTable =
    RawWakerVTable::new(clone_waker, wake, wake_by_ref, drop_waker);

fn raw_waker() -> RawWaker {
    RawWaker::new(ptr::null(), &WAKER_VTABLE)
}

pub(super) fn inert_waker() -> Waker {
    unsafe { Waker::from_raw(raw_waker()) }
}
