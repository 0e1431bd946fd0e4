//! Serializable snapshots of committed transitions, used for replay.
//!
//! A recorded transition refers to trees by [`AssetId`] and to states by
//! handle only. Frame and state ids are runtime identities and are
//! re-derived against the active frames when the record is replayed.

use serde::{Deserialize, Serialize};
use statetree_core::{AssetId, StateHandle, StateTreeEvent, TransitionPriority};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedFrame {
    pub tree: AssetId,
    pub root_state: StateHandle,
    pub active_states: Vec<StateHandle>,
    pub is_global_frame: bool,
    /// Index into [`RecordedTransitionResult::events`] per active state.
    pub event_indices: Vec<Option<u8>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedTransitionResult {
    pub frames: Vec<RecordedFrame>,
    pub events: Vec<StateTreeEvent>,
    /// Tree and subtree root of the frame that requested the transition.
    pub source_tree: Option<AssetId>,
    pub source_root_state: StateHandle,
    pub source_state: StateHandle,
    pub target: StateHandle,
    pub priority: TransitionPriority,
}

impl Default for RecordedTransitionResult {
    fn default() -> Self {
        RecordedTransitionResult {
            frames: Vec::new(),
            events: Vec::new(),
            source_tree: None,
            source_root_state: StateHandle::INVALID,
            source_state: StateHandle::INVALID,
            target: StateHandle::INVALID,
            priority: TransitionPriority::None,
        }
    }
}

impl RecordedTransitionResult {
    /// Event captured for the state at `state_index` of frame `frame_index`.
    pub fn event(&self, frame_index: usize, state_index: usize) -> Option<&StateTreeEvent> {
        let index = self
            .frames
            .get(frame_index)?
            .event_indices
            .get(state_index)
            .copied()
            .flatten()?;
        self.events.get(index as usize)
    }

    /// Leaf state of the recorded selection.
    pub fn leaf(&self) -> Option<StateHandle> {
        self.frames.last()?.active_states.last().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_resolve_through_indices() {
        let recorded = RecordedTransitionResult {
            frames: vec![RecordedFrame {
                tree: AssetId(0),
                root_state: StateHandle::ROOT,
                active_states: vec![StateHandle::ROOT, StateHandle::new(2)],
                is_global_frame: true,
                event_indices: vec![None, Some(0)],
            }],
            events: vec![StateTreeEvent::new("door.open")],
            ..RecordedTransitionResult::default()
        };
        assert!(recorded.event(0, 0).is_none());
        assert_eq!(recorded.event(0, 1).map(|e| e.tag.as_str()), Some("door.open"));
        assert_eq!(recorded.leaf(), Some(StateHandle::new(2)));
    }

    #[test]
    fn serializes_to_json() {
        let recorded = RecordedTransitionResult {
            target: StateHandle::new(1),
            priority: TransitionPriority::High,
            ..RecordedTransitionResult::default()
        };
        let text = serde_json::to_string(&recorded).unwrap();
        let back: RecordedTransitionResult = serde_json::from_str(&text).unwrap();
        assert_eq!(back, recorded);
    }
}
