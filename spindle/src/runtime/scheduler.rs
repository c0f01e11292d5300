use crate::context;
use crate::reactor;
use crate::runtime::RuntimeConfig;
use crate::runtime::worker::Worker;
use crate::task::Task;
use crate::task::raw::{OwnedTask, RawTask};
use crossbeam_deque::{Injector, Steal};
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

#[cfg(test)]
pub(crate) use self::track::{PushKind, Tracker};

/// Dispatches ready tasks across the worker pool.
///
/// New work and reactor wake-ups land on the shared injector queue; each
/// worker additionally keeps a bounded local queue that only it touches.
pub(crate) struct Scheduler {
    pub(crate) cfg: RuntimeConfig,

    /// The global MPMC ready queue.
    injector: Injector<OwnedTask>,

    running: AtomicBool,

    #[cfg(test)]
    pub(crate) tracker: Tracker,
}

impl Scheduler {
    pub(crate) fn new(cfg: RuntimeConfig) -> Scheduler {
        Scheduler {
            cfg,
            injector: Injector::new(),
            running: AtomicBool::new(true),

            #[cfg(test)]
            tracker: Tracker::default(),
        }
    }

    pub(crate) fn into_handle(self) -> Handle {
        Handle(Arc::new(self))
    }
}

/// Cloneable handle to the runtime's scheduler.
#[derive(Clone)]
pub(crate) struct Handle(Arc<Scheduler>);

#[doc(hidden)]
impl Deref for Handle {
    type Target = Arc<Scheduler>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Handle {
    /// Launch the worker pool and block until [`Handle::stop`] has been
    /// observed and every worker has drained out of its loop.
    pub(crate) fn start(&self, reactor: reactor::Handle) {
        let mut handles = Vec::with_capacity(self.cfg.worker_threads);

        for id in 0..self.cfg.worker_threads {
            let scheduler = self.clone();
            let reactor = reactor.clone();

            let mut builder = thread::Builder::new().name((self.cfg.thread_name.0)());
            if let Some(stack_size) = self.cfg.thread_stack_size {
                builder = builder.stack_size(stack_size);
            }

            let handle = builder
                .spawn(move || {
                    context::init(scheduler.clone(), reactor.clone());
                    Worker::new(id, scheduler, reactor).run();
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
    }

    /// Ask the workers to exit after their current step.
    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Submit a task that starts executing immediately. The returned handle
    /// should be awaited at some point; a completed task nobody awaits and
    /// nobody reclaims keeps its slot until the runtime shuts down. Use
    /// [`Handle::fire_and_forget`] when the result is not needed.
    pub(crate) fn spawn<F>(&self, future: F) -> Task<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let raw = RawTask::new(future);
        let task = Task::from_raw(raw);
        self.push_remote(OwnedTask::from_raw_ref(raw));
        task
    }

    /// Submit a task whose frame the scheduler destroys on completion.
    pub(crate) fn fire_and_forget<F>(&self, future: F)
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let raw = RawTask::new(future);
        raw.header().set_reclaim_on_complete();
        self.push_remote(OwnedTask::adopt(raw));
    }

    /// Enqueue from outside a worker (spawn callers, the reactor thread).
    /// Always goes through the global queue; local queues belong to their
    /// workers.
    pub(crate) fn push_remote(&self, task: OwnedTask) {
        task.header().mark_enqueued();

        #[cfg(test)]
        self.tracker.record_push(task.addr(), PushKind::Global);

        self.injector.push(task);
    }

    pub(crate) fn steal_global(&self) -> Steal<OwnedTask> {
        self.injector.steal()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.cfg.worker_threads)
            .field("queued", &self.injector.len())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// Small price to pay to get introspection on every enqueue during testing.
// Compiled out of release builds.
#[cfg(test)]
mod track {
    use parking_lot::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum PushKind {
        Local,
        Global,
    }

    #[derive(Debug, Clone, Copy)]
    pub(crate) struct PushRecord {
        pub(crate) task: usize,
        pub(crate) kind: PushKind,
    }

    #[derive(Debug, Default)]
    pub(crate) struct Tracker {
        pushes: Mutex<Vec<PushRecord>>,
    }

    impl Tracker {
        pub(crate) fn record_push(&self, task: usize, kind: PushKind) {
            self.pushes.lock().push(PushRecord { task, kind });
        }

        pub(crate) fn pushes(&self) -> Vec<PushRecord> {
            self.pushes.lock().clone()
        }
    }
}
