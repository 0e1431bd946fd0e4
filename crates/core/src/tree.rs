//! Compiled, immutable state tree assets and the library that owns them.

use std::ops::{Index, Range};

use serde::{Deserialize, Serialize};

use crate::binding::CopyBatch;
use crate::event::EventDesc;
use crate::handle::{AssetId, DataHandle, StateHandle};
use crate::node::{CompactNode, NodeKind};
use crate::status::{SelectionFallback, TransitionPriority};
use crate::value::InstanceStruct;

/// Deepest active-state path a single frame can hold.
pub const MAX_STATES: usize = 32;

/// Most tasks a single state (or a frame's global task group) can own.
pub const MAX_TASKS_PER_GROUP: usize = 32;

// ──────────────────────────────────────────────
// Ranges
// ──────────────────────────────────────────────

/// Contiguous run of items (nodes, transitions) inside a compiled tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRange {
    pub begin: u16,
    pub num: u16,
}

impl NodeRange {
    pub fn new(begin: usize, num: usize) -> Self {
        NodeRange {
            begin: begin as u16,
            num: num as u16,
        }
    }

    pub fn len(self) -> usize {
        self.num as usize
    }

    pub fn is_empty(self) -> bool {
        self.num == 0
    }

    pub fn range(self) -> Range<usize> {
        self.begin as usize..(self.begin as usize + self.num as usize)
    }
}

// ──────────────────────────────────────────────
// States
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StateType {
    #[default]
    State,
    Group,
    /// Enters another subtree of the same asset in a new frame.
    Linked,
    /// Enters the root of another asset in a new global frame.
    LinkedAsset,
    /// Root of a subtree; has no parent and owns its own frame.
    Subtree,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SelectionBehavior {
    None,
    TryEnterState,
    #[default]
    TrySelectChildrenInOrder,
    TrySelectChildrenAtRandom,
    TrySelectChildrenWithHighestUtility,
    TrySelectChildrenAtRandomWeightedByUtility,
    TryFollowTransitions,
}

impl SelectionBehavior {
    pub fn selects_children(self) -> bool {
        matches!(
            self,
            SelectionBehavior::TrySelectChildrenInOrder
                | SelectionBehavior::TrySelectChildrenAtRandom
                | SelectionBehavior::TrySelectChildrenWithHighestUtility
                | SelectionBehavior::TrySelectChildrenAtRandomWeightedByUtility
        )
    }
}

/// How the tasks of a state combine into the state's completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TaskCompletion {
    /// Completed once every considered task has finished.
    #[default]
    All,
    /// Completed as soon as one considered task has finished.
    Any,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactState {
    pub name: String,
    pub tag: Option<String>,
    pub parent: StateHandle,
    pub children_begin: u16,
    pub children_end: u16,
    /// Index one past this state's subtree; the next sibling when it shares the parent.
    pub next_sibling: u16,
    /// Depth below the frame root (the root is 0).
    pub depth: u8,
    pub state_type: StateType,
    pub selection_behavior: SelectionBehavior,
    pub enabled: bool,
    pub tasks: NodeRange,
    pub enter_conditions: NodeRange,
    pub considerations: NodeRange,
    pub transitions: NodeRange,
    pub weight: f32,
    pub linked_state: StateHandle,
    pub linked_asset: Option<AssetId>,
    pub parameter_template: InstanceStruct,
    pub parameter_handle: DataHandle,
    pub parameter_bindings: Option<u16>,
    pub event_handle: DataHandle,
    pub required_event: Option<EventDesc>,
    pub check_prerequisites_when_activating_child_directly: bool,
    /// Consume the captured selection event once a transition into this state is accepted.
    pub consume_event_on_select: bool,
    /// First instance slot, relative to the frame's active base.
    pub instance_begin: u16,
    pub instance_num: u16,
    pub custom_tick_rate: Option<f32>,
    pub task_completion: TaskCompletion,
    /// Bit per task slot that counts toward completion.
    pub completion_mask: u32,
    pub has_transition_tasks: bool,
    pub has_state_change_conditions: bool,
    pub has_tick_tasks: bool,
    pub has_tick_on_event_tasks: bool,
    pub has_tick_transitions: bool,
    pub has_event_transitions: bool,
    pub has_delegate_transitions: bool,
    pub has_succeeded_transitions: bool,
    pub has_failed_transitions: bool,
    pub has_completed_transitions: bool,
}

impl CompactState {
    pub fn has_children(&self) -> bool {
        self.children_begin < self.children_end
    }

    pub fn is_linked(&self) -> bool {
        matches!(self.state_type, StateType::Linked | StateType::LinkedAsset)
    }

    pub fn should_tick_transitions(&self, has_events: bool, has_broadcasted_delegates: bool) -> bool {
        self.has_tick_transitions
            || (has_events && self.has_event_transitions)
            || (has_broadcasted_delegates && self.has_delegate_transitions)
    }

    pub fn should_tick_completion_transitions(&self, succeeded: bool, failed: bool) -> bool {
        (succeeded && self.has_succeeded_transitions)
            || (failed && self.has_failed_transitions)
            || (!succeeded && !failed && self.has_completed_transitions)
    }

    pub fn requests_tick_tasks(&self, has_events: bool) -> bool {
        self.has_tick_tasks || (has_events && self.has_tick_on_event_tasks)
    }
}

// ──────────────────────────────────────────────
// Transitions
// ──────────────────────────────────────────────

/// Bit set of the conditions that fire a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TransitionTrigger(pub u8);

impl TransitionTrigger {
    pub const NONE: TransitionTrigger = TransitionTrigger(0);
    pub const ON_STATE_SUCCEEDED: TransitionTrigger = TransitionTrigger(0b1);
    pub const ON_STATE_FAILED: TransitionTrigger = TransitionTrigger(0b10);
    pub const ON_STATE_COMPLETED: TransitionTrigger = TransitionTrigger(0b11);
    pub const ON_TICK: TransitionTrigger = TransitionTrigger(0b100);
    pub const ON_EVENT: TransitionTrigger = TransitionTrigger(0b1000);
    pub const ON_DELEGATE: TransitionTrigger = TransitionTrigger(0b1_0000);

    pub fn contains(self, other: TransitionTrigger) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: TransitionTrigger) -> bool {
        self.0 & other.0 != 0
    }

    /// Any of the completion bits is set.
    pub fn is_completion(self) -> bool {
        self.intersects(Self::ON_STATE_COMPLETED)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransitionDelay {
    pub duration: f32,
    pub random_variance: f32,
}

impl TransitionDelay {
    pub fn is_delayed(&self) -> bool {
        self.duration > 0.0 || self.random_variance > 0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactTransition {
    pub trigger: TransitionTrigger,
    pub target: StateHandle,
    pub fallback: SelectionFallback,
    pub priority: TransitionPriority,
    pub delay: TransitionDelay,
    pub required_event: EventDesc,
    pub required_delegate: Option<u16>,
    pub conditions: NodeRange,
    pub consume_event_on_select: bool,
    pub enabled: bool,
}

// ──────────────────────────────────────────────
// Frames and data descriptors
// ──────────────────────────────────────────────

/// Frame metadata for one subtree root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactFrame {
    pub root_state: StateHandle,
    /// Global tasks belong to this frame's global group (the tree root only).
    pub owns_global_tasks: bool,
    /// Bit per global task slot that counts toward completion.
    pub global_completion_mask: u32,
}

/// Shape of a context or external data struct the tree reads from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataDesc {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub required: bool,
}

impl DataDesc {
    pub fn new(name: &str, fields: &[&str], required: bool) -> Self {
        DataDesc {
            name: name.to_owned(),
            fields: fields.iter().map(|f| (*f).to_owned()).collect(),
            required,
        }
    }
}

// ──────────────────────────────────────────────
// Compiled tree
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTree {
    pub name: String,
    pub schema: String,
    pub states: Vec<CompactState>,
    pub transitions: Vec<CompactTransition>,
    pub nodes: Vec<CompactNode>,
    pub batches: Vec<CopyBatch>,
    pub frames: Vec<CompactFrame>,
    pub evaluators: NodeRange,
    pub global_tasks: NodeRange,
    pub default_parameters: InstanceStruct,
    pub context_data: Vec<DataDesc>,
    pub external_data: Vec<DataDesc>,
    pub external_parameter_names: Vec<String>,
    pub delegate_names: Vec<String>,
    /// Evaluator plus global task instance slots.
    pub num_global_instances: u16,
    pub num_shared_instances: u16,
    pub scheduled_tick_allowed: bool,
    pub has_global_transition_tasks: bool,
    pub has_global_tick_tasks: bool,
    pub has_global_tick_on_event_tasks: bool,
    pub global_task_completion: TaskCompletion,
}

impl StateTree {
    pub fn state(&self, handle: StateHandle) -> Option<&CompactState> {
        if handle.is_state() {
            self.states.get(handle.index())
        } else {
            None
        }
    }

    pub fn find_state(&self, name: &str) -> Option<StateHandle> {
        self.states
            .iter()
            .position(|s| s.name == name)
            .map(|i| StateHandle::new(i as u16))
    }

    pub fn state_name(&self, handle: StateHandle) -> String {
        match self.state(handle) {
            Some(state) => state.name.clone(),
            None => format!("{:?}", handle),
        }
    }

    pub fn frame_for_root(&self, root: StateHandle) -> Option<&CompactFrame> {
        self.frames.iter().find(|f| f.root_state == root)
    }

    pub fn node(&self, index: usize) -> Option<&CompactNode> {
        self.nodes.get(index)
    }

    pub fn batch(&self, index: Option<u16>) -> Option<&CopyBatch> {
        index.and_then(|i| self.batches.get(i as usize))
    }

    pub fn task_nodes(&self, range: NodeRange) -> impl Iterator<Item = (usize, &CompactNode)> {
        range.range().filter_map(move |i| self.nodes.get(i).map(|n| (i, n)))
    }

    pub fn requests_global_tick(&self, has_events: bool) -> bool {
        !self.evaluators.is_empty()
            || self.has_global_tick_tasks
            || (has_events && self.has_global_tick_on_event_tasks)
    }

    /// Child states of `handle`, in document order.
    pub fn children(&self, handle: StateHandle) -> Vec<StateHandle> {
        let mut out = Vec::new();
        if let Some(state) = self.state(handle) {
            let mut child = state.children_begin;
            while child < state.children_end {
                out.push(StateHandle::new(child));
                child = match self.states.get(child as usize) {
                    Some(s) => s.next_sibling,
                    None => break,
                };
            }
        }
        out
    }

    /// A linked asset can run under this tree when it shares the schema and
    /// its context data lines up with ours.
    pub fn has_compatible_context_data(&self, other: &StateTree) -> bool {
        self.schema == other.schema
            && other.context_data.len() <= self.context_data.len()
            && other
                .context_data
                .iter()
                .zip(&self.context_data)
                .all(|(a, b)| a.name == b.name)
    }

    pub fn external_parameter_name(&self, index: u16) -> Option<&str> {
        self.external_parameter_names
            .get(index as usize)
            .map(String::as_str)
    }

    pub fn global_task_count(&self) -> usize {
        self.global_tasks.len()
    }

    pub fn is_task_enabled(&self, node_index: usize) -> bool {
        matches!(
            self.nodes.get(node_index).map(|n| &n.kind),
            Some(NodeKind::Task(task)) if task.flags.enabled
        )
    }
}

// ──────────────────────────────────────────────
// Library
// ──────────────────────────────────────────────

/// Arena owning every compiled tree; runtime structures refer to trees by [`AssetId`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TreeLibrary {
    pub trees: Vec<StateTree>,
}

impl TreeLibrary {
    pub fn get(&self, id: AssetId) -> Option<&StateTree> {
        self.trees.get(id.index())
    }

    pub fn find(&self, name: &str) -> Option<AssetId> {
        self.trees
            .iter()
            .position(|t| t.name == name)
            .map(|i| AssetId(i as u16))
    }

    pub fn len(&self) -> usize {
        self.trees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (AssetId, &StateTree)> {
        self.trees
            .iter()
            .enumerate()
            .map(|(i, t)| (AssetId(i as u16), t))
    }
}

impl Index<AssetId> for TreeLibrary {
    type Output = StateTree;

    fn index(&self, id: AssetId) -> &StateTree {
        &self.trees[id.index()]
    }
}
