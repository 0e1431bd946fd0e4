//! Shared-borrow view of a running instance.

use statetree_core::{AssetId, RunStatus, StateTree, TreeLibrary};

use crate::events::EventQueue;
use crate::frame::ExecutionFrame;
use crate::recording::RecordedTransitionResult;
use crate::schedule::ScheduledTick;
use crate::storage::InstanceStorage;

/// Inspects an [`InstanceStorage`] without mutating it. Any number of
/// read-only contexts can coexist; none can while an
/// [`crate::ExecutionContext`] holds the storage.
#[derive(Clone, Copy)]
pub struct ReadOnlyContext<'s> {
    library: &'s TreeLibrary,
    root_tree: AssetId,
    storage: &'s InstanceStorage,
    events: &'s EventQueue,
    owns_event_queue: bool,
}

impl<'s> ReadOnlyContext<'s> {
    pub fn new(library: &'s TreeLibrary, root_tree: AssetId, storage: &'s InstanceStorage) -> Self {
        ReadOnlyContext {
            library,
            root_tree,
            storage,
            events: &storage.events,
            owns_event_queue: true,
        }
    }

    /// Reads events from a queue the caller owns.
    pub fn with_event_queue(mut self, queue: &'s EventQueue) -> Self {
        self.owns_event_queue = std::ptr::eq(queue, &self.storage.events);
        self.events = queue;
        self
    }

    pub fn is_valid(&self) -> bool {
        self.root().is_some_and(|tree| !tree.states.is_empty())
    }

    fn root(&self) -> Option<&'s StateTree> {
        self.library.get(self.root_tree)
    }

    pub fn run_status(&self) -> RunStatus {
        if !self.is_valid() {
            return RunStatus::Failed;
        }
        self.storage.exec.tree_run_status
    }

    pub fn last_tick_status(&self) -> RunStatus {
        if !self.is_valid() {
            return RunStatus::Failed;
        }
        self.storage.exec.last_tick_status
    }

    pub fn active_frames(&self) -> &'s [ExecutionFrame] {
        &self.storage.exec.active_frames
    }

    /// Names of the enabled active states, outermost frame first.
    pub fn active_state_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for frame in &self.storage.exec.active_frames {
            let Some(tree) = self.library.get(frame.tree) else {
                continue;
            };
            for handle in frame.active_states.handles() {
                if let Some(state) = tree.state(*handle).filter(|s| s.enabled) {
                    names.push(state.name.clone());
                }
            }
        }
        names
    }

    pub fn recorded_transitions(&self) -> &'s [RecordedTransitionResult] {
        &self.storage.recorded
    }

    /// When the owner should tick next: every frame while something ticks
    /// or waits on per-tick transitions, next frame for pending work, a
    /// custom rate from states, requests or delayed transitions, otherwise
    /// sleep.
    pub fn next_scheduled_tick(&self) -> ScheduledTick {
        if !self.is_valid() {
            tracing::warn!(asset = %self.root_tree, "context is not valid, nothing to schedule");
            return ScheduledTick::Sleep;
        }
        let exec = &self.storage.exec;
        if exec.tree_run_status != RunStatus::Running {
            return ScheduledTick::Sleep;
        }

        let trees: Vec<&StateTree> = exec
            .active_frames
            .iter()
            .filter_map(|frame| self.library.get(frame.tree))
            .collect();
        if trees.iter().any(|tree| !tree.scheduled_tick_allowed) {
            return ScheduledTick::EveryFrame;
        }

        let has_events = self.events.has_events();
        let has_broadcast = self.storage.has_broadcasted_delegates();
        let mut custom_rate: Option<f32> = None;
        let mut every_frame = false;
        for (frame, tree) in exec.active_frames.iter().zip(&trees) {
            if tree.requests_global_tick(has_events) {
                every_frame = true;
            }
            for handle in frame.active_states.handles() {
                let Some(state) = tree.state(*handle).filter(|s| s.enabled) else {
                    continue;
                };
                match state.custom_tick_rate {
                    Some(rate) => custom_rate = Some(custom_rate.map_or(rate, |r| r.min(rate))),
                    None if custom_rate.is_none() => {
                        if state.requests_tick_tasks(has_events)
                            || state.should_tick_transitions(has_events, has_broadcast)
                        {
                            every_frame = true;
                        }
                    }
                    None => {}
                }
            }
        }
        if custom_rate.is_none() && every_frame {
            return ScheduledTick::EveryFrame;
        }
        if custom_rate.is_some_and(|rate| rate <= 0.0) {
            return ScheduledTick::EveryFrame;
        }

        if let Some(requested) = self.storage.scheduled_ticks.merged() {
            match requested {
                ScheduledTick::EveryFrame | ScheduledTick::NextFrame => return requested,
                ScheduledTick::CustomTickRate(rate) => {
                    custom_rate = Some(custom_rate.map_or(rate, |r| r.min(rate)));
                }
                ScheduledTick::Sleep => {}
            }
        }

        if !self.storage.transition_requests.is_empty()
            || (has_events && self.owns_event_queue)
            || exec.has_pending_completed_state
            || exec.delayed_transitions.iter().any(|d| d.time_left <= 0.0)
        {
            return ScheduledTick::NextFrame;
        }

        for delayed in &exec.delayed_transitions {
            custom_rate = Some(custom_rate.map_or(delayed.time_left, |r| r.min(delayed.time_left)));
        }
        custom_rate.map_or(ScheduledTick::Sleep, ScheduledTick::CustomTickRate)
    }
}
