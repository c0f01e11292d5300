use crate::reactor;
use crate::runtime::scheduler;
use crate::task::Header;
use crate::task::raw::RawTask;
use std::cell::{Cell, RefCell};
use std::ptr::NonNull;
use std::thread_local;

/// Per-thread view of the runtime: the shared scheduler and reactor
/// handles, plus the task currently being polled on this thread. Installed
/// on every runtime thread (workers, the reactor, the entry thread) so
/// task bodies can reach the runtime without passing it around.
pub(crate) struct Context {
    scheduler: scheduler::Handle,
    reactor: reactor::Handle,
    current_task: Cell<Option<NonNull<Header>>>,
}

thread_local! {
    static CONTEXT: RefCell<Option<Context>> = const { RefCell::new(None) };
}

/// Install the runtime handles on the calling thread. A second runtime on
/// the same thread replaces the previous handles.
pub(crate) fn init(scheduler: scheduler::Handle, reactor: reactor::Handle) {
    CONTEXT.with(|ctx| {
        *ctx.borrow_mut() = Some(Context {
            scheduler,
            reactor,
            current_task: Cell::new(None),
        });
    });
}

#[track_caller]
pub(crate) fn with_scheduler<F, R>(f: F) -> R
where
    F: FnOnce(&scheduler::Handle) -> R,
{
    CONTEXT.with(|ctx| {
        let ctx = ctx.borrow();
        let ctx = ctx
            .as_ref()
            .expect("runtime context not initialized on this thread");
        f(&ctx.scheduler)
    })
}

#[track_caller]
pub(crate) fn with_reactor<F, R>(f: F) -> R
where
    F: FnOnce(&reactor::Handle) -> R,
{
    CONTEXT.with(|ctx| {
        let ctx = ctx.borrow();
        let ctx = ctx
            .as_ref()
            .expect("runtime context not initialized on this thread");
        f(&ctx.reactor)
    })
}

/// Like [`with_reactor`], but tolerates threads without a runtime and
/// thread-local teardown (a leaked task's socket may be dropped while the
/// thread-local itself is being destroyed).
pub(crate) fn try_with_reactor<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&reactor::Handle) -> R,
{
    CONTEXT
        .try_with(|ctx| {
            let ctx = ctx.borrow();
            ctx.as_ref().map(|ctx| f(&ctx.reactor))
        })
        .ok()
        .flatten()
}

/// Run `f` against the task currently being polled on this thread. Only
/// meaningful inside a task body; awaitables use this to record their
/// suspension.
#[track_caller]
pub(crate) fn with_current_task<F, R>(f: F) -> R
where
    F: FnOnce(RawTask) -> R,
{
    CONTEXT.with(|ctx| {
        let ctx = ctx.borrow();
        let ctx = ctx
            .as_ref()
            .expect("runtime context not initialized on this thread");
        let header = ctx
            .current_task
            .get()
            .expect("no task is being polled on this thread");
        f(unsafe { RawTask::from_header_ptr(header) })
    })
}

/// Mark `task` as the one being polled; the previous value is restored
/// when the guard drops.
pub(crate) fn enter_task(task: NonNull<Header>) -> TaskGuard {
    let prev = CONTEXT.with(|ctx| {
        let ctx = ctx.borrow();
        let ctx = ctx
            .as_ref()
            .expect("runtime context not initialized on this thread");
        ctx.current_task.replace(Some(task))
    });
    TaskGuard { prev }
}

pub(crate) struct TaskGuard {
    prev: Option<NonNull<Header>>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        CONTEXT.with(|ctx| {
            let ctx = ctx.borrow();
            if let Some(ctx) = ctx.as_ref() {
                ctx.current_task.set(self.prev);
            }
        });
    }
}
