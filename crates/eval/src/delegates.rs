//! Delegate dispatchers and the listeners tasks bind to them.

use serde::{Deserialize, Serialize};
use statetree_core::AssetId;

use crate::active_states::ActiveStateId;
use crate::frame::FrameId;

/// A dispatcher declared by a tree, addressed by its interned name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DelegateDispatcher {
    pub tree: AssetId,
    pub id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenerId(pub u32);

/// A listener owned by one task of one active state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelegateListener {
    pub id: ListenerId,
    pub dispatcher: DelegateDispatcher,
    pub frame_id: FrameId,
    /// Invalid for listeners bound by global tasks.
    pub state_id: ActiveStateId,
    pub node_index: u16,
}

#[derive(Debug, Clone, Default)]
pub struct DelegateListeners {
    listeners: Vec<DelegateListener>,
    next_id: u32,
}

impl DelegateListeners {
    pub fn add(
        &mut self,
        dispatcher: DelegateDispatcher,
        frame_id: FrameId,
        state_id: ActiveStateId,
        node_index: u16,
    ) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.listeners.push(DelegateListener {
            id,
            dispatcher,
            frame_id,
            state_id,
            node_index,
        });
        id
    }

    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|l| l.id != id);
        self.listeners.len() != before
    }

    pub fn remove_for_state(&mut self, state_id: ActiveStateId) {
        self.listeners.retain(|l| l.state_id != state_id);
    }

    /// Drops the frame-scoped listeners, i.e. those bound by global tasks.
    pub fn remove_for_frame(&mut self, frame_id: FrameId) {
        self.listeners
            .retain(|l| !(l.frame_id == frame_id && !l.state_id.is_valid()));
    }

    pub fn bound_to(&self, dispatcher: DelegateDispatcher) -> Vec<DelegateListener> {
        self.listeners
            .iter()
            .filter(|l| l.dispatcher == dispatcher)
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn clear(&mut self) {
        self.listeners.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DISPATCHER: DelegateDispatcher = DelegateDispatcher {
        tree: AssetId(0),
        id: 0,
    };

    #[test]
    fn state_scoped_removal_keeps_other_listeners() {
        let mut listeners = DelegateListeners::default();
        listeners.add(DISPATCHER, FrameId(1), ActiveStateId(5), 3);
        listeners.add(DISPATCHER, FrameId(1), ActiveStateId(6), 4);
        listeners.add(DISPATCHER, FrameId(1), ActiveStateId::INVALID, 1);
        listeners.remove_for_state(ActiveStateId(5));
        assert_eq!(listeners.len(), 2);
        listeners.remove_for_frame(FrameId(1));
        assert_eq!(listeners.bound_to(DISPATCHER).len(), 1);
    }

    #[test]
    fn remove_reports_unknown_ids() {
        let mut listeners = DelegateListeners::default();
        let id = listeners.add(DISPATCHER, FrameId(1), ActiveStateId(1), 0);
        assert!(listeners.remove(id));
        assert!(!listeners.remove(id));
    }
}
