//! Events and the descriptors states and transitions use to require them.

use std::hash::{DefaultHasher, Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Property index of the event tag when an event is read as data.
pub const EVENT_TAG_PROPERTY: u16 = 0;
/// Property index of the event payload.
pub const EVENT_PAYLOAD_PROPERTY: u16 = 1;
/// Property index of the event origin.
pub const EVENT_ORIGIN_PROPERTY: u16 = 2;

/// An event sent to a running tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTreeEvent {
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl StateTreeEvent {
    pub fn new(tag: impl Into<String>) -> Self {
        StateTreeEvent {
            tag: tag.into(),
            payload: None,
            origin: None,
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Value>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Hierarchical tag match: `a.b` matches `a.b` and `a.b.c`, not `a.bc`.
    pub fn matches_tag(&self, required: &str) -> bool {
        tag_matches(&self.tag, required)
    }

    /// Content hash used to deduplicate delayed transitions per event.
    pub fn content_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.tag.hash(&mut hasher);
        self.origin.hash(&mut hasher);
        match &self.payload {
            Some(payload) => {
                1u8.hash(&mut hasher);
                payload.hash_into(&mut hasher);
            }
            None => 0u8.hash(&mut hasher),
        }
        hasher.finish()
    }

    /// Reads the event as a property bag: tag, payload, origin.
    pub fn property(&self, index: u16) -> Option<Value> {
        match index {
            EVENT_TAG_PROPERTY => Some(Value::Text(self.tag.clone())),
            EVENT_PAYLOAD_PROPERTY => self.payload.clone(),
            EVENT_ORIGIN_PROPERTY => self.origin.clone().map(Value::Text),
            _ => None,
        }
    }

    pub fn property_index(name: &str) -> Option<u16> {
        match name {
            "tag" => Some(EVENT_TAG_PROPERTY),
            "payload" => Some(EVENT_PAYLOAD_PROPERTY),
            "origin" => Some(EVENT_ORIGIN_PROPERTY),
            _ => None,
        }
    }
}

pub fn tag_matches(tag: &str, required: &str) -> bool {
    match tag.strip_prefix(required) {
        Some(rest) => rest.is_empty() || rest.starts_with('.'),
        None => false,
    }
}

/// Requirement on an event, used by states and event-triggered transitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDesc {
    /// Required tag; `None` accepts any event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Require the event to carry a payload.
    #[serde(default)]
    pub requires_payload: bool,
}

impl EventDesc {
    pub fn tag(tag: impl Into<String>) -> Self {
        EventDesc {
            tag: Some(tag.into()),
            requires_payload: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.tag.is_some() || self.requires_payload
    }

    pub fn matches(&self, event: &StateTreeEvent) -> bool {
        if self.requires_payload && event.payload.is_none() {
            return false;
        }
        match &self.tag {
            Some(tag) => event.matches_tag(tag),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hierarchical_tags() {
        assert!(tag_matches("door.open", "door"));
        assert!(tag_matches("door", "door"));
        assert!(!tag_matches("doorbell", "door"));
        assert!(!tag_matches("door", "door.open"));
    }

    #[test]
    fn content_hash_tracks_payload() {
        let a = StateTreeEvent::new("hit").with_payload(3i64);
        let b = StateTreeEvent::new("hit").with_payload(3i64);
        let c = StateTreeEvent::new("hit").with_payload(4i64);
        assert_eq!(a.content_hash(), b.content_hash());
        assert_ne!(a.content_hash(), c.content_hash());
    }

    #[test]
    fn desc_requires_payload() {
        let desc = EventDesc {
            tag: Some("hit".into()),
            requires_payload: true,
        };
        assert!(!desc.matches(&StateTreeEvent::new("hit")));
        assert!(desc.matches(&StateTreeEvent::new("hit.head").with_payload(1i64)));
    }
}
