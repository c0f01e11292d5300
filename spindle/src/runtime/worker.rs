use crate::reactor;
use crate::runtime::scheduler::Handle;
use crate::task::TaskState;
use crate::task::raw::OwnedTask;
use crossbeam_deque::Steal;
use std::collections::VecDeque;

#[cfg(test)]
use crate::runtime::scheduler::PushKind;

/// One OS thread of the scheduler. Owns a bounded local ready queue and
/// shares the global injector with every other worker.
pub(crate) struct Worker {
    id: usize,
    scheduler: Handle,
    reactor: reactor::Handle,

    /// Local FIFO ready queue; no locking, only this worker touches it.
    local: VecDeque<OwnedTask>,
}

impl Worker {
    pub(crate) fn new(id: usize, scheduler: Handle, reactor: reactor::Handle) -> Worker {
        Worker {
            id,
            scheduler,
            reactor,
            local: VecDeque::new(),
        }
    }

    pub(crate) fn run(&mut self) {
        tracing::debug!(worker = self.id, "worker started");

        while self.scheduler.is_running() {
            let Some(task) = self.next_task() else { continue };
            self.step(task);
        }

        tracing::debug!(worker = self.id, "worker stopped");
    }

    /// Pop policy: prefer the local queue; once it is empty, spin-poll the
    /// global queue until a task arrives or the scheduler stops.
    fn next_task(&mut self) -> Option<OwnedTask> {
        if let Some(task) = self.local.pop_front() {
            return Some(task);
        }

        loop {
            match self.scheduler.steal_global() {
                Steal::Success(task) => return Some(task),
                Steal::Empty | Steal::Retry => {
                    if !self.scheduler.is_running() {
                        return None;
                    }
                    std::hint::spin_loop();
                    std::thread::yield_now();
                }
            }
        }
    }

    /// One pass over a ready task: resume it (unless already complete) and
    /// resolve the state it left behind into the next enqueue.
    fn step(&mut self, task: OwnedTask) {
        let mut state = task.state();

        if state != TaskState::Complete {
            // The records of the previous suspension die with this resume:
            // whatever the task was waiting for has delivered its result.
            let finished_child = unsafe { task.raw().trailer().take_awaiting_child() };
            let finished_io = unsafe { task.raw().trailer().take_io_waitable() };

            state = task.run();

            drop(finished_child);
            drop(finished_io);
        }

        match state {
            TaskState::Awaiting => self.resolve_await(task),
            TaskState::BlockedOnIo => self.resolve_io(task),
            TaskState::Complete => self.resolve_complete(task),
        }
    }

    /// The task suspended on a child: wire the child to resume us on
    /// completion and enqueue it unless a `spawn` already did. The parent
    /// is not re-enqueued; the child's completion brings it back.
    fn resolve_await(&mut self, task: OwnedTask) {
        let Some(child) = (unsafe { task.raw().trailer().awaiting_child_raw() }) else {
            // A foreign future returned `Pending` without recording a
            // suspension; nothing will ever resume this task.
            tracing::error!("task suspended without recording an awaitable; dropping it");
            return;
        };

        // Our handle moves into the child's callback slot. If the child has
        // already completed on another worker, its completion pass either
        // consumed the slot just now or will pick this up on its next
        // cycle; either way the wiring cannot deadlock.
        child.header().set_callback(task);

        if !child.header().mark_enqueued() {
            self.push(OwnedTask::from_raw_ref(child));
        }
    }

    /// The task blocked on fd readiness: move our handle into a one-shot
    /// reactor continuation that re-arms the task and feeds it back
    /// through the global queue. The worker keeps nothing.
    fn resolve_io(&mut self, task: OwnedTask) {
        let Some(waitable) = (unsafe { task.raw().trailer().take_io_waitable() }) else {
            tracing::error!("task blocked on I/O without recording an awaitable; dropping it");
            return;
        };

        let scheduler = self.scheduler.clone();
        waitable.register(
            &self.reactor,
            Box::new(move || {
                task.header().set_state(TaskState::Awaiting);
                scheduler.push_remote(task);
            }),
        );
    }

    /// The task completed: resume the waiter, or reclaim a fire-and-forget
    /// frame, or keep the task cycling until an owner collects it.
    fn resolve_complete(&mut self, task: OwnedTask) {
        if let Some(parent) = task.header().take_callback() {
            // The waiter runs next and reads our result.
            self.push(parent);
        } else if task.header().reclaim_on_complete() {
            // Fire-and-forget: nothing will ever read the result.
            task.raw().destroy();
        } else {
            // Completed top-level task whose owner has not awaited it yet.
            // Its next pass delivers a callback wired after completion.
            self.push(task);
        }
    }

    /// Push policy: below-threshold local queue, otherwise the global one.
    fn push(&mut self, task: OwnedTask) {
        if self.local.len() < self.scheduler.cfg.local_queue_limit {
            task.header().mark_enqueued();

            #[cfg(test)]
            self.scheduler.tracker.record_push(task.addr(), PushKind::Local);

            self.local.push_back(task);
        } else {
            self.scheduler.push_remote(task);
        }
    }
}
