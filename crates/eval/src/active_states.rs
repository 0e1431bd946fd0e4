//! Bounded stack of active states for one execution frame.

use std::fmt;

use serde::{Deserialize, Serialize};
use statetree_core::{StateHandle, MAX_STATES};

/// Unique id of one activation of a state. Ids are allocated from a
/// per-storage counter and never reused while the owning frame is alive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActiveStateId(pub u32);

impl ActiveStateId {
    pub const INVALID: ActiveStateId = ActiveStateId(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for ActiveStateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Root-to-leaf path of active states, each paired with its activation id.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ActiveStates {
    states: [StateHandle; MAX_STATES],
    ids: [ActiveStateId; MAX_STATES],
    len: u8,
}

impl Default for ActiveStates {
    fn default() -> Self {
        ActiveStates {
            states: [StateHandle::INVALID; MAX_STATES],
            ids: [ActiveStateId::INVALID; MAX_STATES],
            len: 0,
        }
    }
}

impl ActiveStates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single-state path, used for transition targets.
    pub fn single(handle: StateHandle) -> Self {
        let mut states = Self::default();
        if handle.is_valid() {
            states.push(handle, ActiveStateId::INVALID);
        }
        states
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == MAX_STATES
    }

    /// Appends a state. Returns false and leaves the list unchanged when full.
    pub fn push(&mut self, handle: StateHandle, id: ActiveStateId) -> bool {
        if self.is_full() {
            return false;
        }
        self.states[self.len()] = handle;
        self.ids[self.len()] = id;
        self.len += 1;
        true
    }

    pub fn pop(&mut self) {
        if self.len > 0 {
            self.len -= 1;
            self.states[self.len()] = StateHandle::INVALID;
            self.ids[self.len()] = ActiveStateId::INVALID;
        }
    }

    pub fn truncate(&mut self, len: usize) {
        while self.len() > len {
            self.pop();
        }
    }

    /// Handle at `index`, or [`StateHandle::INVALID`] when out of range.
    pub fn get(&self, index: usize) -> StateHandle {
        if index < self.len() {
            self.states[index]
        } else {
            StateHandle::INVALID
        }
    }

    /// Activation id at `index`, or [`ActiveStateId::INVALID`] when out of range.
    pub fn id(&self, index: usize) -> ActiveStateId {
        if index < self.len() {
            self.ids[index]
        } else {
            ActiveStateId::INVALID
        }
    }

    pub fn last(&self) -> StateHandle {
        match self.len() {
            0 => StateHandle::INVALID,
            n => self.states[n - 1],
        }
    }

    pub fn contains(&self, handle: StateHandle) -> bool {
        self.handles().contains(&handle)
    }

    pub fn index_of(&self, handle: StateHandle) -> Option<usize> {
        self.handles().iter().position(|h| *h == handle)
    }

    /// Finds an activation by id, scanning from the leaf.
    pub fn index_of_reverse(&self, id: ActiveStateId) -> Option<usize> {
        self.ids[..self.len()].iter().rposition(|i| *i == id)
    }

    pub fn handles(&self) -> &[StateHandle] {
        &self.states[..self.len()]
    }

    pub fn ids(&self) -> &[ActiveStateId] {
        &self.ids[..self.len()]
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (StateHandle, ActiveStateId)> + '_ {
        self.handles().iter().copied().zip(self.ids().iter().copied())
    }
}

impl fmt::Debug for ActiveStates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(n: usize) -> ActiveStates {
        let mut states = ActiveStates::new();
        for i in 0..n {
            assert!(states.push(StateHandle::new(i as u16), ActiveStateId(i as u32 + 1)));
        }
        states
    }

    #[test]
    fn push_beyond_capacity_is_rejected() {
        let mut states = filled(MAX_STATES);
        let before = states;
        assert!(!states.push(StateHandle::new(99), ActiveStateId(99)));
        assert_eq!(states, before);
        assert_eq!(states.len(), MAX_STATES);
    }

    #[test]
    fn out_of_range_reads_are_invalid() {
        let states = filled(2);
        assert_eq!(states.get(5), StateHandle::INVALID);
        assert_eq!(states.id(5), ActiveStateId::INVALID);
        assert_eq!(ActiveStates::new().last(), StateHandle::INVALID);
    }

    #[test]
    fn index_of_reverse_finds_by_id() {
        let states = filled(4);
        assert_eq!(states.index_of_reverse(ActiveStateId(3)), Some(2));
        assert_eq!(states.index_of_reverse(ActiveStateId(42)), None);
    }

    #[test]
    fn truncate_clears_tail() {
        let mut states = filled(4);
        states.truncate(1);
        assert_eq!(states.len(), 1);
        assert!(!states.contains(StateHandle::new(2)));
        assert_eq!(states.get(1), StateHandle::INVALID);
    }

    #[test]
    fn single_skips_invalid_handle() {
        assert!(ActiveStates::single(StateHandle::INVALID).is_empty());
        assert_eq!(ActiveStates::single(StateHandle::FAILED).len(), 1);
    }
}
