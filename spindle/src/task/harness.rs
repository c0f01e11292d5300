use crate::context;
use crate::task::error::panic_payload_as_str;
use crate::task::header::Header;
use crate::task::layout::{Core, TaskLayout};
use crate::task::state::TaskState;
use crate::task::waker::inert_waker;
use crate::task::TaskError;
use std::future::Future;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::task::{Context, Poll};

/// Typed raw task handle.
pub(super) struct Harness<F: Future> {
    layout: NonNull<TaskLayout<F>>,
}

impl<F: Future> Harness<F> {
    pub(super) unsafe fn from_raw(ptr: NonNull<Header>) -> Harness<F> {
        Harness {
            layout: ptr.cast::<TaskLayout<F>>(),
        }
    }

    fn header(&self) -> &Header {
        unsafe { &self.layout.as_ref().header }
    }

    fn core(&self) -> &Core<F> {
        unsafe { &self.layout.as_ref().core }
    }

    /// Resume the task once.
    ///
    /// The task becomes the thread's current task for the duration of the
    /// poll so leaf awaitables can record their suspension on it. A `Ready`
    /// poll stores the output and completes the task; a panic is converted
    /// into an `Err` output instead of unwinding into the worker.
    pub(super) fn run(self) -> TaskState {
        let _entered = context::enter_task(self.layout.cast::<Header>());

        match poll_future(self.core()) {
            Poll::Pending => {
                // The leaf that suspended us already set the state and the
                // matching suspension record.
            }
            Poll::Ready(output) => {
                self.core().store_output(output);
                self.header().set_state(TaskState::Complete);
            }
        }

        self.header().state()
    }

    pub(super) fn dealloc(self) {
        // Safety: the caller just dropped the last reference to the cell,
        // so releasing the allocation is its responsibility.
        unsafe {
            drop(Box::from_raw(self.layout.as_ptr()));
        }
    }

    pub(super) fn destroy(self) {
        self.core().drop_future_or_output();
    }

    pub(super) fn read_output(self, dst: &mut Option<super::Result<F::Output>>) {
        *dst = Some(self.core().take_output());
    }
}

/// Polls the future once, converting a panic into an `Err` output.
fn poll_future<F: Future>(core: &Core<F>) -> Poll<super::Result<F::Output>> {
    let waker = inert_waker();
    let cx = Context::from_waker(&waker);

    let res = panic::catch_unwind(AssertUnwindSafe(|| {
        // If the poll panics, the future is dropped from inside the guard.
        struct Guard<'a, F: Future> {
            core: &'a Core<F>,
        }
        impl<'a, F: Future> Drop for Guard<'a, F> {
            fn drop(&mut self) {
                self.core.drop_future_or_output();
            }
        }
        let guard = Guard { core };
        let res = guard.core.poll(cx);
        mem::forget(guard);
        res
    }));

    match res {
        Ok(Poll::Pending) => Poll::Pending,
        Ok(Poll::Ready(output)) => Poll::Ready(Ok(output)),
        Err(payload) => {
            let msg = panic_payload_as_str(&payload).unwrap_or("opaque panic payload");
            tracing::error!(msg, "task body panicked");
            Poll::Ready(Err(TaskError::Panicked(msg.to_owned())))
        }
    }
}
