use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Phase of a task's life cycle.
///
/// `Awaiting` covers both "ready to run" and "suspended on a child task";
/// the scheduler tells the two apart by looking at the suspension records.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Runnable, or suspended on a child task.
    Awaiting = 0,
    /// Suspended until a file descriptor becomes ready.
    BlockedOnIo = 1,
    /// The task ran to completion; its result may be read, never resumed.
    Complete = 2,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Awaiting => write!(f, "Awaiting"),
            TaskState::BlockedOnIo => write!(f, "BlockedOnIo"),
            TaskState::Complete => write!(f, "Complete"),
        }
    }
}

/// Task state published across worker threads with release/acquire pairing.
#[derive(Debug)]
pub(crate) struct AtomicState(AtomicU8);

impl AtomicState {
    pub(crate) fn new() -> AtomicState {
        AtomicState(AtomicU8::new(TaskState::Awaiting as u8))
    }

    pub(crate) fn load(&self) -> TaskState {
        match self.0.load(Ordering::Acquire) {
            0 => TaskState::Awaiting,
            1 => TaskState::BlockedOnIo,
            2 => TaskState::Complete,
            other => unreachable!("invalid task state {other}"),
        }
    }

    pub(crate) fn store(&self, state: TaskState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        let state = AtomicState::new();
        assert_eq!(state.load(), TaskState::Awaiting);

        state.store(TaskState::BlockedOnIo);
        assert_eq!(state.load(), TaskState::BlockedOnIo);

        state.store(TaskState::Complete);
        assert_eq!(state.load(), TaskState::Complete);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(TaskState::Awaiting.to_string(), "Awaiting");
        assert_eq!(TaskState::BlockedOnIo.to_string(), "BlockedOnIo");
        assert_eq!(TaskState::Complete.to_string(), "Complete");
    }
}
