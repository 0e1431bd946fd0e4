//! Execution frames: one activation record per tree instance on the stack.

use std::fmt;

use serde::{Deserialize, Serialize};
use statetree_core::{AssetId, DataHandle, StateHandle, StateTree};

use crate::active_states::ActiveStates;
use crate::task_status::{FrameTaskStatus, TaskGroupStatus};

/// Most frames a selection can stack through linked states.
pub const MAX_EXECUTION_FRAMES: usize = 8;

/// Stable identity of a frame across ticks. Zero is never allocated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameId(pub u32);

impl FrameId {
    pub const INVALID: FrameId = FrameId(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame#{}", self.0)
    }
}

/// Where a frame reads a parameter block from. Parameters supplied by a
/// linking state are aliased, never copied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ParameterRef {
    #[default]
    None,
    /// The storage's global parameter block.
    Global,
    /// A state parameter block owned by the frame with id `frame`.
    Slot { frame: FrameId, handle: DataHandle },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionFrame {
    pub tree: AssetId,
    pub root_state: StateHandle,
    pub active_states: ActiveStates,
    /// Owns evaluators and global tasks: the root frame and every linked asset.
    pub is_global_frame: bool,
    pub frame_id: FrameId,
    pub external_data_base: Option<usize>,
    pub global_instance_base: Option<usize>,
    pub active_instance_base: Option<usize>,
    /// Block read through `GlobalParameterData` handles.
    pub global_parameters: ParameterRef,
    /// Block read through `SubtreeParameterData` handles.
    pub state_parameters: ParameterRef,
    pub tasks_status: FrameTaskStatus,
    /// Leading active states whose EnterState has run.
    pub num_currently_active_states: usize,
}

impl ExecutionFrame {
    pub fn new(
        tree_id: AssetId,
        tree: &StateTree,
        root_state: StateHandle,
        is_global_frame: bool,
    ) -> Self {
        let global = tree
            .frame_for_root(root_state)
            .map(|frame| TaskGroupStatus::for_frame(tree, frame))
            .unwrap_or_default();
        ExecutionFrame {
            tree: tree_id,
            root_state,
            active_states: ActiveStates::new(),
            is_global_frame,
            frame_id: FrameId::INVALID,
            external_data_base: None,
            global_instance_base: None,
            active_instance_base: None,
            global_parameters: ParameterRef::None,
            state_parameters: ParameterRef::None,
            tasks_status: FrameTaskStatus::new(global),
            num_currently_active_states: 0,
        }
    }

    /// Two frames are the same activation target when they run the same
    /// subtree of the same asset.
    pub fn is_same_frame(&self, other: &ExecutionFrame) -> bool {
        self.tree == other.tree && self.root_state == other.root_state
    }

    pub fn has_roots(&self) -> bool {
        !self.active_states.is_empty()
    }

    /// Shrinks the active path to `len` states, keeping task groups aligned.
    pub fn truncate_states(&mut self, len: usize) {
        self.active_states.truncate(len);
        self.tasks_status.truncate_states(len);
        self.num_currently_active_states = self.num_currently_active_states.min(len);
    }
}

pub fn find_frame_index(frames: &[ExecutionFrame], id: FrameId) -> Option<usize> {
    frames.iter().position(|f| f.frame_id == id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::active_states::ActiveStateId;
    use statetree_core::{
        LibraryDefinition, StateDefinition, TaskDefinition, TreeDefinition, TreeLibrary,
    };

    fn library() -> TreeLibrary {
        let def = TreeDefinition::new(
            "T",
            StateDefinition::new("Root").child(StateDefinition::new("A")),
        )
        .global_task(TaskDefinition::run_forever("g"))
        .subtree(StateDefinition::new("Sub"));
        TreeLibrary::compile(&LibraryDefinition::single(def)).unwrap()
    }

    #[test]
    fn root_frame_owns_global_task_group() {
        let lib = library();
        let frame = ExecutionFrame::new(AssetId(0), &lib[AssetId(0)], StateHandle::ROOT, true);
        assert_eq!(frame.tasks_status.global.len(), 1);

        let sub = lib[AssetId(0)].find_state("Sub").unwrap();
        let frame = ExecutionFrame::new(AssetId(0), &lib[AssetId(0)], sub, false);
        assert!(frame.tasks_status.global.is_empty());
    }

    #[test]
    fn truncate_keeps_entered_count_in_range() {
        let lib = library();
        let mut frame = ExecutionFrame::new(AssetId(0), &lib[AssetId(0)], StateHandle::ROOT, true);
        frame.active_states.push(StateHandle::ROOT, ActiveStateId(1));
        frame.active_states.push(StateHandle::new(1), ActiveStateId(2));
        frame.num_currently_active_states = 2;
        frame.truncate_states(1);
        assert_eq!(frame.num_currently_active_states, 1);
        assert_eq!(frame.active_states.len(), 1);
    }
}
