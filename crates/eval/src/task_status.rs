//! Completion bookkeeping for a group of tasks: one group per active state,
//! plus one for the global tasks of a frame.

use statetree_core::{
    CompactFrame, CompactState, StateTree, TaskCompletion, TaskStatus, MAX_TASKS_PER_GROUP,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskGroupStatus {
    slots: [TaskStatus; MAX_TASKS_PER_GROUP],
    len: u8,
    /// Bit per slot that counts toward completion.
    considered: u32,
    completion: TaskCompletion,
    /// Completion imposed from outside the group, e.g. by a finished subtree.
    forced: Option<TaskStatus>,
}

impl Default for TaskGroupStatus {
    fn default() -> Self {
        TaskGroupStatus::new(0, 0, TaskCompletion::All)
    }
}

impl TaskGroupStatus {
    pub fn new(len: usize, considered: u32, completion: TaskCompletion) -> Self {
        TaskGroupStatus {
            slots: [TaskStatus::Running; MAX_TASKS_PER_GROUP],
            len: len.min(MAX_TASKS_PER_GROUP) as u8,
            considered,
            completion,
            forced: None,
        }
    }

    pub fn for_state(state: &CompactState) -> Self {
        TaskGroupStatus::new(
            state.tasks.len(),
            state.completion_mask,
            state.task_completion,
        )
    }

    /// The global task group of a frame. Frames that do not own the tree's
    /// global tasks get an empty group.
    pub fn for_frame(tree: &StateTree, frame: &CompactFrame) -> Self {
        if frame.owns_global_tasks {
            TaskGroupStatus::new(
                tree.global_task_count(),
                frame.global_completion_mask,
                tree.global_task_completion,
            )
        } else {
            TaskGroupStatus::default()
        }
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn status(&self, index: usize) -> TaskStatus {
        self.slots
            .get(index)
            .filter(|_| index < self.len())
            .copied()
            .unwrap_or_default()
    }

    pub fn is_running(&self, index: usize) -> bool {
        self.status(index) == TaskStatus::Running
    }

    pub fn is_considered_for_completion(&self, index: usize) -> bool {
        index < self.len() && self.considered & (1 << index) != 0
    }

    /// Merges `status` into the slot; a finished slot is never downgraded.
    /// Returns the resulting slot status.
    pub fn set_status_with_priority(&mut self, index: usize, status: TaskStatus) -> TaskStatus {
        if index >= self.len() {
            return status;
        }
        self.slots[index] = self.slots[index].merge(status);
        self.slots[index]
    }

    /// Forces the completion of the whole group.
    pub fn set_completion_status(&mut self, status: TaskStatus) {
        self.forced = Some(match self.forced {
            Some(current) => current.merge(status),
            None => status,
        });
    }

    pub fn has_any_failed(&self) -> bool {
        self.considered_slots().any(|s| s == TaskStatus::Failed)
    }

    pub fn completion_status(&self) -> TaskStatus {
        let computed = self.computed_status();
        match self.forced {
            Some(forced) => computed.merge(forced),
            None => computed,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completion_status() != TaskStatus::Running
    }

    fn considered_slots(&self) -> impl Iterator<Item = TaskStatus> + '_ {
        self.slots[..self.len()]
            .iter()
            .enumerate()
            .filter(|(i, _)| self.considered & (1 << i) != 0)
            .map(|(_, s)| *s)
    }

    fn computed_status(&self) -> TaskStatus {
        if self.considered_slots().next().is_none() {
            return TaskStatus::Running;
        }
        if self.has_any_failed() {
            return TaskStatus::Failed;
        }
        let finished = self
            .considered_slots()
            .filter(|s| *s != TaskStatus::Running)
            .fold(None, |acc: Option<TaskStatus>, s| {
                Some(acc.map_or(s, |a| a.merge(s)))
            });
        match (self.completion, finished) {
            (_, None) => TaskStatus::Running,
            (TaskCompletion::Any, Some(status)) => status,
            (TaskCompletion::All, Some(status)) => {
                if self.considered_slots().all(|s| s != TaskStatus::Running) {
                    status
                } else {
                    TaskStatus::Running
                }
            }
        }
    }
}

/// Task groups of one execution frame. `states` is aligned with the frame's
/// active states.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameTaskStatus {
    pub global: TaskGroupStatus,
    states: Vec<TaskGroupStatus>,
}

impl FrameTaskStatus {
    pub fn new(global: TaskGroupStatus) -> Self {
        FrameTaskStatus {
            global,
            states: Vec::new(),
        }
    }

    pub fn state(&self, index: usize) -> Option<&TaskGroupStatus> {
        self.states.get(index)
    }

    pub fn state_mut(&mut self, index: usize) -> Option<&mut TaskGroupStatus> {
        self.states.get_mut(index)
    }

    pub fn push_state(&mut self, group: TaskGroupStatus) {
        self.states.push(group);
    }

    pub fn pop_state(&mut self) {
        self.states.pop();
    }

    pub fn truncate_states(&mut self, len: usize) {
        self.states.truncate(len);
    }

    pub fn num_states(&self) -> usize {
        self.states.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_group_never_completes() {
        let group = TaskGroupStatus::new(0, 0, TaskCompletion::All);
        assert_eq!(group.completion_status(), TaskStatus::Running);
        assert!(!group.is_completed());
    }

    #[test]
    fn all_waits_for_every_considered_task() {
        let mut group = TaskGroupStatus::new(3, 0b011, TaskCompletion::All);
        group.set_status_with_priority(0, TaskStatus::Succeeded);
        assert!(!group.is_completed());
        // Slot 2 is not considered.
        group.set_status_with_priority(1, TaskStatus::Stopped);
        assert_eq!(group.completion_status(), TaskStatus::Succeeded);
    }

    #[test]
    fn any_completes_on_first_finished_task() {
        let mut group = TaskGroupStatus::new(2, 0b11, TaskCompletion::Any);
        group.set_status_with_priority(1, TaskStatus::Succeeded);
        assert_eq!(group.completion_status(), TaskStatus::Succeeded);
    }

    #[test]
    fn failure_wins_regardless_of_mode() {
        let mut group = TaskGroupStatus::new(2, 0b11, TaskCompletion::All);
        group.set_status_with_priority(0, TaskStatus::Failed);
        assert!(group.has_any_failed());
        assert_eq!(group.completion_status(), TaskStatus::Failed);
    }

    #[test]
    fn finished_slot_is_not_downgraded() {
        let mut group = TaskGroupStatus::new(1, 0b1, TaskCompletion::All);
        group.set_status_with_priority(0, TaskStatus::Succeeded);
        assert_eq!(
            group.set_status_with_priority(0, TaskStatus::Running),
            TaskStatus::Succeeded
        );
    }

    #[test]
    fn forced_completion_applies_to_empty_group() {
        let mut group = TaskGroupStatus::default();
        group.set_completion_status(TaskStatus::Failed);
        assert_eq!(group.completion_status(), TaskStatus::Failed);
    }

    #[test]
    fn out_of_range_slots_read_as_running() {
        let mut group = TaskGroupStatus::new(1, 0b1, TaskCompletion::All);
        assert_eq!(
            group.set_status_with_priority(5, TaskStatus::Failed),
            TaskStatus::Failed
        );
        assert!(group.is_running(5));
        assert!(!group.is_completed());
    }
}
