//! Mutable execution state: the program counter of a running tree.

use std::fmt;

use rand::rngs::StdRng;
use rand::SeedableRng;
use statetree_core::{RunStatus, SelectionFallback, StateHandle, TransitionPriority};

use crate::active_states::ActiveStateId;
use crate::events::{SelectionEvents, SharedEvent};
use crate::frame::{ExecutionFrame, FrameId};

/// Phase the context is currently executing. Anything but `Unset` means
/// the context is busy and Start/Stop must not run synchronously.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UpdatePhase {
    #[default]
    Unset,
    StartTree,
    StopTree,
    TickStateTree,
}

impl UpdatePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            UpdatePhase::Unset => "unset",
            UpdatePhase::StartTree => "start",
            UpdatePhase::StopTree => "stop",
            UpdatePhase::TickStateTree => "tick",
        }
    }
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a state relates to the previous active set during a transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChangeType {
    #[default]
    None,
    /// Newly entered, or an ancestor changed.
    Changed,
    /// Stays active across the transition.
    Sustained,
}

/// A transition timer started when a delayed transition's conditions passed.
#[derive(Debug, Clone)]
pub struct DelayedTransition {
    pub state_id: ActiveStateId,
    /// Absolute index into the owning tree's transition table.
    pub transition_index: u16,
    pub time_left: f32,
    pub captured_event: Option<SharedEvent>,
    /// Content hash of the captured event, 0 without one.
    pub event_hash: u64,
}

/// A transition requested from outside the transition pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionRequest {
    pub source_frame_id: FrameId,
    pub source_state_id: ActiveStateId,
    pub target: StateHandle,
    pub priority: TransitionPriority,
    pub fallback: SelectionFallback,
}

/// Outcome of a successful selection, applied by ExitState/EnterState.
#[derive(Debug, Clone, Default)]
pub struct TransitionResult {
    pub next_frames: Vec<ExecutionFrame>,
    /// Aligned with `next_frames`.
    pub next_frame_events: Vec<SelectionEvents>,
    pub source_frame_id: FrameId,
    pub source_state_id: ActiveStateId,
    pub target: StateHandle,
    pub current_run_status: RunStatus,
    pub change_type: ChangeType,
    pub priority: TransitionPriority,
}

impl TransitionResult {
    pub fn reset(&mut self) {
        *self = TransitionResult::default();
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionState {
    pub tree_run_status: RunStatus,
    pub last_tick_status: RunStatus,
    pub current_phase: UpdatePhase,
    /// Stop requested while busy; applied when the phase returns to `Unset`.
    pub requested_stop: RunStatus,
    pub active_frames: Vec<ExecutionFrame>,
    pub delayed_transitions: Vec<DelayedTransition>,
    pub state_change_count: u32,
    pub has_pending_completed_state: bool,
    /// Frame and task node where the last EnterState stopped on a failure.
    pub enter_state_failed_frame_index: Option<usize>,
    pub enter_state_failed_task_index: Option<usize>,
    pub random: StdRng,
}

impl Default for ExecutionState {
    fn default() -> Self {
        ExecutionState {
            tree_run_status: RunStatus::Unset,
            last_tick_status: RunStatus::Unset,
            current_phase: UpdatePhase::Unset,
            requested_stop: RunStatus::Unset,
            active_frames: Vec::new(),
            delayed_transitions: Vec::new(),
            state_change_count: 0,
            has_pending_completed_state: false,
            enter_state_failed_frame_index: None,
            enter_state_failed_task_index: None,
            random: StdRng::seed_from_u64(0),
        }
    }
}

impl ExecutionState {
    pub fn reset(&mut self) {
        *self = ExecutionState::default();
    }

    pub fn is_busy(&self) -> bool {
        self.current_phase != UpdatePhase::Unset
    }

    pub fn frame(&self, id: FrameId) -> Option<&ExecutionFrame> {
        self.active_frames.iter().find(|f| f.frame_id == id)
    }

    /// Whether a frame and task node were entered before the last EnterState
    /// failure. Frames above the failed one ran every task.
    pub fn was_task_entered(&self, frame_index: usize, node_index: usize) -> bool {
        match self.enter_state_failed_frame_index {
            None => true,
            Some(failed) if frame_index < failed => true,
            Some(failed) if frame_index == failed => self
                .enter_state_failed_task_index
                .map_or(true, |task| node_index <= task),
            Some(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entered_tasks_stop_at_failure_point() {
        let mut exec = ExecutionState::default();
        assert!(exec.was_task_entered(3, 100));
        exec.enter_state_failed_frame_index = Some(1);
        exec.enter_state_failed_task_index = Some(7);
        assert!(exec.was_task_entered(0, 50));
        assert!(exec.was_task_entered(1, 7));
        assert!(!exec.was_task_entered(1, 8));
        assert!(!exec.was_task_entered(2, 0));
    }

    #[test]
    fn phase_display() {
        assert_eq!(UpdatePhase::TickStateTree.to_string(), "tick");
        assert!(!ExecutionState::default().is_busy());
    }
}
