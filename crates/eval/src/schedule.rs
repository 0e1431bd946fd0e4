//! Tick scheduling hints.

use serde::{Deserialize, Serialize};

/// When the owner should tick the tree next.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "rate", rename_all = "snake_case")]
pub enum ScheduledTick {
    Sleep,
    EveryFrame,
    NextFrame,
    /// Seconds between ticks.
    CustomTickRate(f32),
}

impl ScheduledTick {
    /// Most urgent of the two: every frame, then next frame, then the
    /// shorter custom rate, then sleep.
    #[must_use]
    pub fn merge(self, other: ScheduledTick) -> ScheduledTick {
        use ScheduledTick::*;
        match (self, other) {
            (EveryFrame, _) | (_, EveryFrame) => EveryFrame,
            (NextFrame, _) | (_, NextFrame) => NextFrame,
            (CustomTickRate(a), CustomTickRate(b)) => CustomTickRate(a.min(b)),
            (CustomTickRate(a), Sleep) | (Sleep, CustomTickRate(a)) => CustomTickRate(a),
            (Sleep, Sleep) => Sleep,
        }
    }

    pub fn should_tick_every_frame(self) -> bool {
        self == ScheduledTick::EveryFrame
    }

    pub fn should_tick_once_next_frame(self) -> bool {
        self == ScheduledTick::NextFrame
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScheduledTickHandle(pub u32);

/// Tick requests made by the owner, merged into the scheduled tick.
#[derive(Debug, Clone, Default)]
pub struct ScheduledTickRequests {
    requests: Vec<(ScheduledTickHandle, ScheduledTick)>,
    next_handle: u32,
}

impl ScheduledTickRequests {
    pub fn add(&mut self, tick: ScheduledTick) -> ScheduledTickHandle {
        self.next_handle += 1;
        let handle = ScheduledTickHandle(self.next_handle);
        self.requests.push((handle, tick));
        handle
    }

    pub fn update(&mut self, handle: ScheduledTickHandle, tick: ScheduledTick) -> bool {
        match self.requests.iter_mut().find(|(h, _)| *h == handle) {
            Some(entry) => {
                entry.1 = tick;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, handle: ScheduledTickHandle) -> bool {
        let before = self.requests.len();
        self.requests.retain(|(h, _)| *h != handle);
        self.requests.len() != before
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn merged(&self) -> Option<ScheduledTick> {
        self.requests
            .iter()
            .map(|(_, tick)| *tick)
            .reduce(ScheduledTick::merge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_prefers_most_urgent() {
        use ScheduledTick::*;
        assert_eq!(Sleep.merge(CustomTickRate(0.5)), CustomTickRate(0.5));
        assert_eq!(CustomTickRate(0.5).merge(CustomTickRate(0.2)), CustomTickRate(0.2));
        assert_eq!(CustomTickRate(0.1).merge(NextFrame), NextFrame);
        assert_eq!(NextFrame.merge(EveryFrame), EveryFrame);
    }

    #[test]
    fn requests_update_and_remove() {
        let mut requests = ScheduledTickRequests::default();
        assert_eq!(requests.merged(), None);
        let a = requests.add(ScheduledTick::CustomTickRate(1.0));
        let b = requests.add(ScheduledTick::Sleep);
        assert_eq!(requests.merged(), Some(ScheduledTick::CustomTickRate(1.0)));
        assert!(requests.update(b, ScheduledTick::NextFrame));
        assert_eq!(requests.merged(), Some(ScheduledTick::NextFrame));
        assert!(requests.remove(a));
        assert!(!requests.remove(a));
    }
}
