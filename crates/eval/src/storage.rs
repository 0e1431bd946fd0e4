//! Instance storage: everything a running tree instance owns.
//!
//! The storage outlives any single [`crate::ExecutionContext`]. A context
//! borrows it mutably for one Start/Tick/Stop call, a
//! [`crate::ReadOnlyContext`] borrows it shared for inspection.

use std::collections::HashMap;

use statetree_core::{AssetId, DataHandle, DataSource, InstanceStruct, StateTree};

use crate::delegates::{DelegateDispatcher, DelegateListeners};
use crate::events::{EventQueue, SharedEvent};
use crate::frame::FrameId;
use crate::recording::RecordedTransitionResult;
use crate::schedule::ScheduledTickRequests;
use crate::state::{ExecutionState, TransitionRequest};

/// One entry of the instance data buffer.
#[derive(Debug, Clone)]
pub enum InstanceSlot {
    Data(InstanceStruct),
    /// Event captured when the owning state was selected.
    Event(Option<SharedEvent>),
}

impl InstanceSlot {
    pub fn as_struct(&self) -> Option<&InstanceStruct> {
        match self {
            InstanceSlot::Data(data) => Some(data),
            InstanceSlot::Event(_) => None,
        }
    }

    pub fn as_struct_mut(&mut self) -> Option<&mut InstanceStruct> {
        match self {
            InstanceSlot::Data(data) => Some(data),
            InstanceSlot::Event(_) => None,
        }
    }
}

/// Instance data created while selecting states that are not active yet.
/// Moved into the instance buffer when the selection is entered, dropped
/// otherwise.
#[derive(Debug, Clone)]
pub struct TemporaryInstance {
    pub frame_id: FrameId,
    pub handle: DataHandle,
    /// Node that owns the data, for evaluator and global task instances.
    pub owner_node: Option<u16>,
    pub data: InstanceSlot,
}

#[derive(Debug, Default)]
pub struct InstanceStorage {
    pub(crate) exec: ExecutionState,
    pub(crate) instances: Vec<InstanceSlot>,
    pub(crate) temporaries: Vec<TemporaryInstance>,
    /// Condition, consideration and property function scratch data per asset.
    pub(crate) shared: HashMap<AssetId, Vec<InstanceStruct>>,
    pub(crate) global_parameters: InstanceStruct,
    pub(crate) events: EventQueue,
    pub(crate) listeners: DelegateListeners,
    pub(crate) broadcasted: Vec<DelegateDispatcher>,
    pub(crate) transition_requests: Vec<TransitionRequest>,
    pub(crate) scheduled_ticks: ScheduledTickRequests,
    pub(crate) recorded: Vec<RecordedTransitionResult>,
    next_unique_id: u32,
}

impl InstanceStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn execution_state(&self) -> &ExecutionState {
        &self.exec
    }

    pub fn event_queue(&self) -> &EventQueue {
        &self.events
    }

    pub fn global_parameters(&self) -> &InstanceStruct {
        &self.global_parameters
    }

    pub fn recorded_transitions(&self) -> &[RecordedTransitionResult] {
        &self.recorded
    }

    pub fn take_recorded_transitions(&mut self) -> Vec<RecordedTransitionResult> {
        std::mem::take(&mut self.recorded)
    }

    pub fn has_broadcasted_delegates(&self) -> bool {
        !self.broadcasted.is_empty()
    }

    pub(crate) fn generate_unique_id(&mut self) -> u32 {
        self.next_unique_id = self.next_unique_id.wrapping_add(1).max(1);
        self.next_unique_id
    }

    /// Drops all runtime data. Recorded transitions and tick requests stay.
    pub(crate) fn reset(&mut self) {
        self.exec.reset();
        self.instances.clear();
        self.temporaries.clear();
        self.shared.clear();
        self.events.reset();
        self.listeners.clear();
        self.broadcasted.clear();
        self.transition_requests.clear();
    }

    pub(crate) fn shared_instances(&mut self, asset: AssetId, tree: &StateTree) -> &mut Vec<InstanceStruct> {
        self.shared.entry(asset).or_insert_with(|| {
            let mut templates = vec![InstanceStruct::new(); tree.num_shared_instances as usize];
            for node in &tree.nodes {
                if node.instance.source == DataSource::SharedInstanceData {
                    if let Some(slot) = templates.get_mut(node.instance.index as usize) {
                        *slot = node.template.clone();
                    }
                }
            }
            templates
        })
    }

    pub(crate) fn find_temporary(&self, frame_id: FrameId, handle: DataHandle) -> Option<usize> {
        self.temporaries
            .iter()
            .position(|t| t.frame_id == frame_id && t.handle == handle)
    }

    pub(crate) fn take_temporary(&mut self, frame_id: FrameId, handle: DataHandle) -> Option<InstanceSlot> {
        self.find_temporary(frame_id, handle)
            .map(|index| self.temporaries.remove(index).data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use statetree_core::{
        ConditionDefinition, LibraryDefinition, StateDefinition, TreeDefinition, TreeLibrary,
    };

    #[test]
    fn shared_instances_start_from_templates() {
        let def = TreeDefinition::new(
            "T",
            StateDefinition::new("Root")
                .enter_condition(ConditionDefinition::always(true))
                .enter_condition(ConditionDefinition::new(
                    statetree_core::node::ConditionKind::IsTrue,
                )),
        );
        let lib = TreeLibrary::compile(&LibraryDefinition::single(def)).unwrap();
        let mut storage = InstanceStorage::new();
        let shared = storage.shared_instances(AssetId(0), &lib[AssetId(0)]);
        assert_eq!(shared.len(), 2);
        assert!(shared[1].get_named("value").is_some());
    }

    #[test]
    fn unique_ids_are_never_zero() {
        let mut storage = InstanceStorage::new();
        assert_eq!(storage.generate_unique_id(), 1);
        assert_eq!(storage.generate_unique_id(), 2);
    }

    #[test]
    fn reset_keeps_recorded_transitions() {
        let mut storage = InstanceStorage::new();
        storage.recorded.push(RecordedTransitionResult::default());
        storage.instances.push(InstanceSlot::Event(None));
        storage.reset();
        assert!(storage.instances.is_empty());
        assert_eq!(storage.recorded_transitions().len(), 1);
    }
}
