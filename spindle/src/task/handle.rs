use crate::context;
use crate::task::raw::{OwnedTask, RawTask};
use crate::task::state::TaskState;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

/// An owned handle to a task producing a `T`.
///
/// Create one with [`Task::new`] or receive one from [`spawn`]. Awaiting
/// the handle suspends the current task until the child completes, then
/// yields the child's result; a child that was never spawned is enqueued
/// by the scheduler the first time it is awaited.
///
/// The handle shares the task's frame with the scheduler: dropping it
/// releases the handle, not the in-flight computation.
///
/// [`spawn`]: crate::runtime::spawn
pub struct Task<T> {
    raw: RawTask,
    awaited: bool,
    _p: PhantomData<fn() -> T>,
}

// Safety: the frame is only ever polled by one worker at a time; the
// handle itself only touches atomics until the output is read, which
// happens after the completed task was handed back through a queue.
unsafe impl<T: Send> Send for Task<T> {}
unsafe impl<T: Send> Sync for Task<T> {}

impl<T: Send + 'static> Task<T> {
    /// Package a future as a task without scheduling it. The task starts
    /// running once it is first awaited.
    pub fn new<F>(future: F) -> Task<T>
    where
        F: Future<Output = T> + Send + 'static,
    {
        Task::from_raw(RawTask::new(future))
    }
}

impl<T> Task<T> {
    /// Adopts the initial reference of `raw`.
    pub(crate) fn from_raw(raw: RawTask) -> Task<T> {
        Task {
            raw,
            awaited: false,
            _p: PhantomData,
        }
    }

    /// Current phase of the task.
    pub fn state(&self) -> TaskState {
        self.raw.state()
    }

    #[cfg(test)]
    pub(crate) fn addr(&self) -> usize {
        self.raw.header_ptr().as_ptr() as usize
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        self.raw.drop_reference();
    }
}

impl<T> Future for Task<T> {
    type Output = super::Result<T>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if !this.awaited {
            this.awaited = true;

            // First poll: record the suspension on the running task. The
            // scheduler wires the completion callback and enqueues the
            // child unless a `spawn` already did.
            context::with_current_task(|parent| {
                parent.header().set_state(TaskState::Awaiting);
                unsafe {
                    parent
                        .trailer()
                        .set_awaiting_child(OwnedTask::from_raw_ref(this.raw));
                }
            });

            return Poll::Pending;
        }

        // Resumed: the child completed and its completion re-enqueued us.
        debug_assert_eq!(this.raw.state(), TaskState::Complete);

        let mut out = None;
        unsafe { this.raw.read_output(&mut out as *mut _ as *mut ()) };
        Poll::Ready(out.expect("completed task had no output"))
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(fmt, "Task({:p}, {})", self.raw.header(), self.state())
    }
}
