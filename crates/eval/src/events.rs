//! Event queue and the shared event references states capture on selection.

use std::ops::Deref;
use std::sync::Arc;

use statetree_core::{StateTreeEvent, MAX_STATES};

use crate::error::ExecutionError;

/// Most events a queue holds between two transition passes.
pub const MAX_EVENTS: usize = 64;

/// Reference-counted event. Identity (not content) decides whether two
/// consumers hold the same event.
#[derive(Debug, Clone)]
pub struct SharedEvent(Arc<StateTreeEvent>);

impl SharedEvent {
    pub fn new(event: StateTreeEvent) -> Self {
        SharedEvent(Arc::new(event))
    }

    pub fn ptr_eq(&self, other: &SharedEvent) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// A new event with the same content and a distinct identity.
    pub fn deep_copy(&self) -> SharedEvent {
        SharedEvent::new(StateTreeEvent::clone(&self.0))
    }
}

impl Deref for SharedEvent {
    type Target = StateTreeEvent;

    fn deref(&self) -> &StateTreeEvent {
        &self.0
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventQueue {
    events: Vec<SharedEvent>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&mut self, event: StateTreeEvent) -> Result<(), ExecutionError> {
        if self.events.len() >= MAX_EVENTS {
            tracing::warn!(tag = %event.tag, max = MAX_EVENTS, "event queue full, dropping event");
            return Err(ExecutionError::EventQueueFull { max: MAX_EVENTS });
        }
        self.events.push(SharedEvent::new(event));
        Ok(())
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[SharedEvent] {
        &self.events
    }

    /// Removes `event` so later transitions in the same pass cannot use it.
    pub fn consume(&mut self, event: &SharedEvent) -> bool {
        match self.events.iter().position(|e| e.ptr_eq(event)) {
            Some(index) => {
                self.events.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn reset(&mut self) {
        self.events.clear();
    }
}

/// Events captured for a frame while selecting it, indexed by state depth.
#[derive(Debug, Clone, Default)]
pub struct SelectionEvents {
    events: [Option<SharedEvent>; MAX_STATES],
}

impl SelectionEvents {
    pub fn get(&self, depth: usize) -> Option<&SharedEvent> {
        self.events.get(depth).and_then(Option::as_ref)
    }

    pub fn set(&mut self, depth: usize, event: Option<SharedEvent>) {
        if let Some(slot) = self.events.get_mut(depth) {
            *slot = event;
        }
    }

    pub fn clear_from(&mut self, depth: usize) {
        for slot in self.events.iter_mut().skip(depth) {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_rejects_overflow() {
        let mut queue = EventQueue::new();
        for i in 0..MAX_EVENTS {
            queue.send(StateTreeEvent::new(format!("e{}", i))).unwrap();
        }
        let err = queue.send(StateTreeEvent::new("late")).unwrap_err();
        assert_eq!(err, ExecutionError::EventQueueFull { max: MAX_EVENTS });
        assert_eq!(queue.len(), MAX_EVENTS);
    }

    #[test]
    fn consume_matches_identity_not_content() {
        let mut queue = EventQueue::new();
        queue.send(StateTreeEvent::new("hit")).unwrap();
        queue.send(StateTreeEvent::new("hit")).unwrap();
        let second = queue.events()[1].clone();
        assert!(queue.consume(&second));
        assert_eq!(queue.len(), 1);
        assert!(!queue.events()[0].ptr_eq(&second));
        assert!(!queue.consume(&second.deep_copy()));
    }

    #[test]
    fn selection_events_ignore_out_of_range_depth() {
        let mut events = SelectionEvents::default();
        events.set(MAX_STATES, Some(SharedEvent::new(StateTreeEvent::new("x"))));
        assert!(events.get(MAX_STATES).is_none());
        events.set(1, Some(SharedEvent::new(StateTreeEvent::new("y"))));
        events.clear_from(1);
        assert!(events.get(1).is_none());
    }
}
