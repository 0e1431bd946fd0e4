//! Run status, task status and transition priority.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Status of the tree, a frame, a state or a task.
///
/// Merging two statuses keeps the one with the higher priority:
/// `Failed > Succeeded > Stopped > Running > Unset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RunStatus {
    #[default]
    Unset,
    Running,
    Stopped,
    Succeeded,
    Failed,
}

impl RunStatus {
    /// Fixed merge priority. `Unset` is only ever an initial sentinel.
    pub const fn priority(self) -> u8 {
        match self {
            RunStatus::Unset => 0,
            RunStatus::Running => 1,
            RunStatus::Stopped => 2,
            RunStatus::Succeeded => 3,
            RunStatus::Failed => 4,
        }
    }

    /// Returns `other` when it strictly outranks `self`, else `self`.
    #[must_use]
    pub const fn merge(self, other: RunStatus) -> RunStatus {
        if other.priority() > self.priority() {
            other
        } else {
            self
        }
    }

    pub fn is_completed(self) -> bool {
        matches!(
            self,
            RunStatus::Stopped | RunStatus::Succeeded | RunStatus::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Unset => "unset",
            RunStatus::Running => "running",
            RunStatus::Stopped => "stopped",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status stored per task slot. There is no `Unset`: an empty slot is `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TaskStatus {
    #[default]
    Running,
    Stopped,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub const fn priority(self) -> u8 {
        match self {
            TaskStatus::Running => 1,
            TaskStatus::Stopped => 2,
            TaskStatus::Succeeded => 3,
            TaskStatus::Failed => 4,
        }
    }

    #[must_use]
    pub const fn merge(self, other: TaskStatus) -> TaskStatus {
        if other.priority() > self.priority() {
            other
        } else {
            self
        }
    }
}

impl From<RunStatus> for TaskStatus {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Unset | RunStatus::Running => TaskStatus::Running,
            RunStatus::Stopped => TaskStatus::Stopped,
            RunStatus::Succeeded => TaskStatus::Succeeded,
            RunStatus::Failed => TaskStatus::Failed,
        }
    }
}

impl From<TaskStatus> for RunStatus {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Running => RunStatus::Running,
            TaskStatus::Stopped => RunStatus::Stopped,
            TaskStatus::Succeeded => RunStatus::Succeeded,
            TaskStatus::Failed => RunStatus::Failed,
        }
    }
}

/// Ordered transition priority. A request only wins when it strictly
/// outranks the best request seen so far.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub enum TransitionPriority {
    #[default]
    None,
    Low,
    Normal,
    Medium,
    High,
    Critical,
}

/// What to try when a requested target fails to select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SelectionFallback {
    #[default]
    None,
    NextSelectableSibling,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn any_status() -> impl Strategy<Value = RunStatus> {
        prop_oneof![
            Just(RunStatus::Unset),
            Just(RunStatus::Running),
            Just(RunStatus::Stopped),
            Just(RunStatus::Succeeded),
            Just(RunStatus::Failed),
        ]
    }

    #[test]
    fn failed_outranks_everything() {
        for status in [
            RunStatus::Unset,
            RunStatus::Running,
            RunStatus::Stopped,
            RunStatus::Succeeded,
        ] {
            assert_eq!(status.merge(RunStatus::Failed), RunStatus::Failed);
            assert_eq!(RunStatus::Failed.merge(status), RunStatus::Failed);
        }
    }

    #[test]
    fn succeeded_outranks_stopped() {
        assert_eq!(
            RunStatus::Stopped.merge(RunStatus::Succeeded),
            RunStatus::Succeeded
        );
        assert_eq!(
            TaskStatus::Stopped.merge(TaskStatus::Succeeded),
            TaskStatus::Succeeded
        );
    }

    #[test]
    fn unset_casts_to_running_task() {
        assert_eq!(TaskStatus::from(RunStatus::Unset), TaskStatus::Running);
        assert_eq!(RunStatus::from(TaskStatus::Stopped), RunStatus::Stopped);
    }

    #[test]
    fn priority_ordering_is_total() {
        assert!(TransitionPriority::None < TransitionPriority::Low);
        assert!(TransitionPriority::Normal < TransitionPriority::Critical);
    }

    proptest! {
        #[test]
        fn merge_is_associative(a in any_status(), b in any_status(), c in any_status()) {
            prop_assert_eq!(a.merge(b).merge(c), a.merge(b.merge(c)));
        }

        #[test]
        fn merge_is_commutative(a in any_status(), b in any_status()) {
            prop_assert_eq!(a.merge(b), b.merge(a));
        }

        #[test]
        fn merge_is_idempotent(a in any_status()) {
            prop_assert_eq!(a.merge(a), a);
        }
    }
}
