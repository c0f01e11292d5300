//! Runtime construction and entry points.

use crate::context;
use crate::reactor::{self, Reactor};
use crate::task::Task;
use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

pub(crate) mod scheduler;
pub(crate) mod worker;

#[cfg(test)]
mod tests;

/// Default bound on a worker's local ready queue; pushes beyond it go to
/// the global queue.
const LOCAL_QUEUE_LIMIT: usize = 256;

/// Default reactor poll timeout. Doubles as the interval at which the
/// reactor thread re-checks its stop flag.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn() -> String + Send + Sync + 'static>);

fn default_thread_name_fn() -> ThreadNameFn {
    let next_id = AtomicUsize::new(0);
    ThreadNameFn(Arc::new(move || {
        format!("spindle-worker-{}", next_id.fetch_add(1, Ordering::Relaxed))
    }))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The closure itself is not printable; show a placeholder.
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

/// Configures and creates a [`Runtime`].
///
/// ```no_run
/// let runtime = spindle::runtime::Builder::new()
///     .worker_threads(4)
///     .build()
///     .expect("failed to build the runtime");
///
/// runtime.run(async {
///     println!("Hello world");
/// });
/// ```
#[derive(Debug)]
pub struct Builder {
    /// The number of scheduler worker threads.
    ///
    /// Defaults to 1 worker per CPU core.
    worker_threads: Option<usize>,

    /// Bound on each worker's local ready queue.
    local_queue_limit: usize,

    /// Reactor poll timeout / stop-check interval.
    poll_interval: Duration,

    /// Name fn used for threads spawned by the runtime.
    thread_name: ThreadNameFn,

    /// Stack size used for threads spawned by the runtime.
    thread_stack_size: Option<usize>,
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            worker_threads: None,
            local_queue_limit: LOCAL_QUEUE_LIMIT,
            poll_interval: POLL_INTERVAL,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
        }
    }

    pub fn worker_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "Worker threads cannot be set to 0");
        self.worker_threads = Some(val);
        self
    }

    /// Sets the bound on each worker's local ready queue. Tasks pushed
    /// beyond it spill to the shared global queue.
    pub fn local_queue_limit(mut self, val: usize) -> Self {
        self.local_queue_limit = val;
        self
    }

    /// Sets the reactor poll timeout. Shorter intervals make `stop` (and
    /// therefore shutdown) more responsive at the cost of more wake-ups.
    pub fn poll_interval(mut self, val: Duration) -> Self {
        self.poll_interval = val;
        self
    }

    /// Sets the name of threads spawned by the runtime's worker pool.
    ///
    /// The default name fn yields worker names with a monotonically
    /// increasing id, `spindle-worker-{id}`.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move || val.clone()));
        self
    }

    /// Sets a function used to generate the name of threads spawned by the
    /// runtime's worker pool.
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Sets the stack size (in bytes) for worker threads.
    ///
    /// The actual stack size may be greater than this value if the
    /// platform specifies a minimal stack size.
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        self.thread_stack_size = Some(val);
        self
    }

    /// Creates the configured [`Runtime`].
    ///
    /// The returned runtime owns the kernel poller but no threads yet;
    /// they are spawned by [`Runtime::run`].
    pub fn build(self) -> Result<Runtime> {
        let cfg: RuntimeConfig = self.try_into()?;

        let reactor = Reactor::try_new(cfg.poll_interval)?.into_handle();
        let scheduler = scheduler::Scheduler::new(cfg).into_handle();

        Ok(Runtime { scheduler, reactor })
    }
}

impl Default for Builder {
    fn default() -> Self {
        Builder::new()
    }
}

/// Validated builder output, consumed by the scheduler and its workers.
#[derive(Debug, Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) worker_threads: usize,
    pub(crate) local_queue_limit: usize,
    pub(crate) poll_interval: Duration,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
}

impl RuntimeConfig {
    fn validate(&self) -> Result<()> {
        if self.local_queue_limit == 0 {
            return Err(anyhow!("local_queue_limit must be greater than 0"));
        }

        if self.poll_interval.is_zero() {
            return Err(anyhow!("poll_interval must be non-zero"));
        }

        Ok(())
    }
}

impl TryFrom<Builder> for RuntimeConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let worker_threads = builder
            .worker_threads
            .unwrap_or(thread::available_parallelism()?.get());

        let cfg = RuntimeConfig {
            worker_threads,
            local_queue_limit: builder.local_queue_limit,
            poll_interval: builder.poll_interval,
            thread_name: builder.thread_name,
            thread_stack_size: builder.thread_stack_size,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}

/// A scheduler plus the reactor it feeds from.
///
/// Created by a [`Builder`]; [`Runtime::run`] drives a root task to
/// completion and tears both down.
#[derive(Debug)]
pub struct Runtime {
    scheduler: scheduler::Handle,
    reactor: reactor::Handle,
}

impl Runtime {
    /// Drive `root` to completion and return its output.
    ///
    /// In order: starts the reactor thread, submits `root` fire-and-forget
    /// (wrapped so its completion stops the scheduler), runs the worker
    /// pool until it drains, then stops and joins the reactor.
    ///
    /// There is no cancellation: tasks still queued or suspended on I/O at
    /// that point are leaked.
    ///
    /// # Panics
    ///
    /// Panics when the root task fails to run to completion, e.g. when its
    /// body panicked.
    pub fn run<F>(self, root: F) -> F::Output
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let reactor_thread = {
            let scheduler = self.scheduler.clone();
            let handle = self.reactor.clone();
            thread::Builder::new()
                .name("spindle-reactor".into())
                .spawn(move || {
                    context::init(scheduler, handle.clone());
                    handle.run();
                })
                .expect("failed to spawn the reactor thread")
        };

        // The entry thread gets the runtime context too, so signal handlers
        // installed by the process can reach `shutdown_and_exit`.
        context::init(self.scheduler.clone(), self.reactor.clone());

        // Completion of the root task must stop the scheduler even if the
        // root body panics, or `start` below would never return; the stop
        // rides a drop guard inside the wrapper.
        struct StopGuard(scheduler::Handle);
        impl Drop for StopGuard {
            fn drop(&mut self) {
                self.0.stop();
            }
        }

        let output = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&output);
        let guard = StopGuard(self.scheduler.clone());

        self.scheduler.fire_and_forget(async move {
            let _stop_on_exit = guard;
            let out = root.await;
            *slot.lock() = Some(out);
        });

        self.scheduler.start(self.reactor.clone());

        self.reactor.stop();
        if reactor_thread.join().is_err() {
            tracing::error!("reactor thread panicked");
        }

        let out = output.lock().take();
        out.expect("root task did not run to completion")
    }

    #[cfg(test)]
    pub(crate) fn scheduler(&self) -> scheduler::Handle {
        self.scheduler.clone()
    }

    #[cfg(test)]
    pub(crate) fn reactor(&self) -> reactor::Handle {
        self.reactor.clone()
    }
}

/// Submit a task that starts executing immediately.
///
/// The returned [`Task`] should be awaited at some point before it goes
/// out of scope; if the result is not needed, use [`fire_and_forget`]
/// instead. Must be called from within the runtime.
pub fn spawn<F>(future: F) -> Task<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    context::with_scheduler(|s| s.spawn(future))
}

/// Submit a task that starts executing immediately and is reclaimed by the
/// scheduler when it completes. Must be called from within the runtime.
pub fn fire_and_forget<F>(future: F)
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    context::with_scheduler(|s| s.fire_and_forget(future))
}

/// Terminate the process cleanly from within the runtime: stop the
/// scheduler, stop the reactor, then exit with `code`.
pub fn shutdown_and_exit(code: i32) -> ! {
    context::with_scheduler(|s| s.stop());
    context::with_reactor(|r| r.stop());
    std::process::exit(code);
}
