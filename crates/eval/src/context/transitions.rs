//! Transition evaluation: the trigger pass run after tasks tick, direct
//! transition requests, completion transitions, and replay of recorded
//! transition results.

use std::mem;

use rand::Rng;
use statetree_core::{
    CompactTransition, RunStatus, SelectionFallback, StateHandle, StateTreeEvent, TaskStatus,
    TransitionPriority, TransitionTrigger,
};

use super::data::CopyMode;
use super::nodes::TaskCall;
use super::selection::adopt_active_frame;
use super::{ExecutionContext, FrameSet, Scope, Selection};
use crate::active_states::ActiveStateId;
use crate::delegates::DelegateDispatcher;
use crate::events::{SelectionEvents, SharedEvent};
use crate::frame::{find_frame_index, ExecutionFrame, FrameId, ParameterRef, MAX_EXECUTION_FRAMES};
use crate::recording::{RecordedFrame, RecordedTransitionResult};
use crate::state::{ChangeType, DelayedTransition, TransitionResult, UpdatePhase};
use crate::trace::TraceEvent;

/// A state, or a task of a state, that gets to request transitions in this
/// pass. Handlers run in priority order; ties keep leaf-to-root order.
#[derive(Debug, Clone, Copy)]
struct TransitionHandler {
    frame_index: usize,
    state: StateHandle,
    state_id: ActiveStateId,
    task: Option<usize>,
    priority: TransitionPriority,
}

/// Whether a completion transition fires for a state that completed with
/// `status`. A stopped state only takes transitions that accept any
/// completion.
fn accepts_completion(trigger: TransitionTrigger, status: RunStatus) -> bool {
    match status {
        RunStatus::Succeeded => trigger.intersects(TransitionTrigger::ON_STATE_SUCCEEDED),
        RunStatus::Failed => trigger.intersects(TransitionTrigger::ON_STATE_FAILED),
        RunStatus::Stopped => trigger == TransitionTrigger::ON_STATE_COMPLETED,
        RunStatus::Unset | RunStatus::Running => false,
    }
}

impl<'a> ExecutionContext<'a> {
    // ──────────────────────────────────────────────
    // Trigger pass
    // ──────────────────────────────────────────────

    /// Evaluates queued requests, delayed transitions, task handlers and
    /// state transitions, then completion transitions. Returns true when a
    /// transition was accepted into `next_transition`.
    pub(crate) fn trigger_transitions(&mut self) -> bool {
        self.allow_direct_transitions = true;
        let triggered = self.trigger_transitions_inner();
        self.allow_direct_transitions = false;
        triggered
    }

    fn trigger_transitions_inner(&mut self) -> bool {
        self.next_transition.reset();

        let requests = mem::take(&mut self.storage.transition_requests);
        for request in requests {
            let Some(frame_index) = find_frame_index(&self.storage.exec.active_frames, request.source_frame_id)
            else {
                continue;
            };
            let frame = &self.storage.exec.active_frames[frame_index];
            let state = frame
                .active_states
                .index_of_reverse(request.source_state_id)
                .map_or(StateHandle::INVALID, |i| frame.active_states.get(i));
            let scope = Scope {
                set: FrameSet::Active,
                frame: Some(frame_index),
                state,
                node: None,
            };
            self.with_scope(scope, |ctx| {
                ctx.request_transition_internal(frame_index, request.target, request.priority, None, request.fallback)
            });
        }

        let (expired, pending): (Vec<DelayedTransition>, Vec<DelayedTransition>) =
            mem::take(&mut self.storage.exec.delayed_transitions)
                .into_iter()
                .partition(|d| d.time_left <= 0.0);
        self.storage.exec.delayed_transitions = pending;

        let handlers = self.collect_transition_handlers(&expired);
        for handler in handlers {
            let scope = Scope {
                set: FrameSet::Active,
                frame: Some(handler.frame_index),
                state: handler.state,
                node: handler.task,
            };
            match handler.task {
                Some(node_index) => {
                    self.copy_node_bindings(FrameSet::Active, handler.frame_index, node_index, CopyMode::Active);
                    self.call_task(
                        FrameSet::Active,
                        handler.frame_index,
                        handler.state,
                        node_index,
                        TaskCall::TriggerTransitions,
                    );
                }
                None => {
                    self.with_scope(scope, |ctx| ctx.trigger_state_transitions(&handler, &expired));
                }
            }
        }

        if self.owns_event_queue() {
            self.queue_mut().reset();
        }
        self.storage.broadcasted.clear();

        let mut process_subtree_completion = true;
        if self.next_transition.priority == TransitionPriority::None
            && (self.storage.exec.last_tick_status != RunStatus::Running
                || self.storage.exec.has_pending_completed_state)
        {
            process_subtree_completion = self.trigger_completion_transitions();
        }

        let target = self.next_transition.target;
        if target.is_completion_state() && process_subtree_completion {
            let source = find_frame_index(&self.storage.exec.active_frames, self.next_transition.source_frame_id);
            if let Some(source) = source.filter(|&i| i > 0) {
                let status = target.to_completion_status();
                let parent = source - 1;
                if let Some(frame) = self.storage.exec.active_frames.get_mut(parent) {
                    let last = frame.active_states.len().saturating_sub(1);
                    if let Some(group) = frame.tasks_status.state_mut(last) {
                        group.set_completion_status(TaskStatus::from(status));
                    }
                }
                tracing::debug!(status = %status, frame = source, "subtree completed, parent frame takes over");
                self.storage.exec.has_pending_completed_state = true;
                self.storage.exec.last_tick_status = status;
                self.trigger_from_frame_index = Some(parent);
                self.next_transition.reset();
                return false;
            }
        }

        self.next_transition.target.is_valid()
    }

    /// Handlers from the trigger frame down to the root frame, leaf states
    /// first, sorted by priority.
    fn collect_transition_handlers(&self, expired: &[DelayedTransition]) -> Vec<TransitionHandler> {
        let frames = &self.storage.exec.active_frames;
        let has_events = self.queue().has_events();
        let has_broadcast = self.storage.has_broadcasted_delegates();
        let end = self
            .trigger_from_frame_index
            .unwrap_or(frames.len().saturating_sub(1))
            .min(frames.len().saturating_sub(1));

        let mut handlers = Vec::new();
        for frame_index in (0..frames.len()).take(end + 1).rev() {
            let frame = &frames[frame_index];
            let Some(tree) = self.tree(frame.tree) else {
                continue;
            };
            let states: Vec<(StateHandle, ActiveStateId)> = frame.active_states.iter().collect();
            for (handle, state_id) in states.into_iter().rev() {
                let Some(state) = tree.state(handle) else {
                    continue;
                };
                if !state.enabled {
                    continue;
                }
                if state.has_transition_tasks {
                    let tasks: Vec<_> = tree.task_nodes(state.tasks).collect();
                    for (node_index, node) in tasks.into_iter().rev() {
                        let Some(task) = node.kind.as_task() else {
                            continue;
                        };
                        if task.flags.enabled && task.flags.affects_transitions {
                            handlers.push(TransitionHandler {
                                frame_index,
                                state: handle,
                                state_id,
                                task: Some(node_index),
                                priority: task.flags.transition_handling_priority,
                            });
                        }
                    }
                }
                let has_expired = expired.iter().any(|d| d.state_id == state_id);
                if state.should_tick_transitions(has_events, has_broadcast) || has_expired {
                    handlers.push(TransitionHandler {
                        frame_index,
                        state: handle,
                        state_id,
                        task: None,
                        priority: TransitionPriority::Normal,
                    });
                }
            }

            if frame.is_global_frame && tree.has_global_transition_tasks {
                let tasks: Vec<_> = tree.task_nodes(tree.global_tasks).collect();
                for (node_index, node) in tasks.into_iter().rev() {
                    let Some(task) = node.kind.as_task() else {
                        continue;
                    };
                    if task.flags.enabled && task.flags.affects_transitions {
                        handlers.push(TransitionHandler {
                            frame_index,
                            state: StateHandle::INVALID,
                            state_id: ActiveStateId::INVALID,
                            task: Some(node_index),
                            priority: task.flags.transition_handling_priority,
                        });
                    }
                }
            }
        }

        handlers.sort_by(|a, b| b.priority.cmp(&a.priority));
        handlers
    }

    /// Evaluates the tick, event and delegate transitions of one state.
    fn trigger_state_transitions(&mut self, handler: &TransitionHandler, expired: &[DelayedTransition]) {
        let frame_index = handler.frame_index;
        let Some(tree) = self.frame_tree(FrameSet::Active, frame_index) else {
            return;
        };
        let tree_id = self.storage.exec.active_frames[frame_index].tree;
        let Some(state) = tree.state(handler.state) else {
            return;
        };

        for transition_index in state.transitions.range() {
            let Some(transition) = tree.transitions.get(transition_index) else {
                continue;
            };
            if !transition.enabled
                || transition.priority <= self.next_transition.priority
                || transition.trigger.is_completion()
            {
                continue;
            }

            if transition.delay.is_delayed() {
                let fired = expired
                    .iter()
                    .find(|d| d.state_id == handler.state_id && d.transition_index as usize == transition_index);
                if let Some(fired) = fired {
                    let event = fired.captured_event.clone();
                    tracing::debug!(tree = %tree.name, state = %state.name, "delayed transition fired");
                    if self.request_transition_internal(
                        frame_index,
                        transition.target,
                        transition.priority,
                        event.clone(),
                        transition.fallback,
                    ) {
                        self.consume_transition_event(transition, event.as_ref());
                    }
                    continue;
                }
            }

            let candidates: Vec<Option<SharedEvent>> = if transition.trigger.contains(TransitionTrigger::ON_EVENT) {
                self.queue()
                    .events()
                    .iter()
                    .filter(|event| transition.required_event.matches(event))
                    .cloned()
                    .map(Some)
                    .collect()
            } else if transition.trigger.contains(TransitionTrigger::ON_TICK) {
                vec![None]
            } else if transition.trigger.contains(TransitionTrigger::ON_DELEGATE) {
                let broadcast = transition.required_delegate.is_some_and(|id| {
                    self.storage
                        .broadcasted
                        .contains(&DelegateDispatcher { tree: tree_id, id })
                });
                if broadcast {
                    vec![None]
                } else {
                    Vec::new()
                }
            } else {
                Vec::new()
            };

            for event in candidates {
                self.transition_event = event.clone();
                let passed = self.test_all_conditions(FrameSet::Active, frame_index, transition.conditions);
                self.transition_event = None;
                if !passed {
                    continue;
                }

                if transition.delay.is_delayed() {
                    self.start_delayed_transition(handler.state_id, transition_index, transition, event);
                    continue;
                }

                if self.request_transition_internal(
                    frame_index,
                    transition.target,
                    transition.priority,
                    event.clone(),
                    transition.fallback,
                ) {
                    self.consume_transition_event(transition, event.as_ref());
                    break;
                }
            }
        }
    }

    /// Starts the timer of a delayed transition unless one is already
    /// running for the same state, transition and event content.
    fn start_delayed_transition(
        &mut self,
        state_id: ActiveStateId,
        transition_index: usize,
        transition: &CompactTransition,
        event: Option<SharedEvent>,
    ) {
        let event_hash = event.as_ref().map_or(0, |e| e.content_hash());
        let running = self.storage.exec.delayed_transitions.iter().any(|d| {
            d.state_id == state_id && d.transition_index as usize == transition_index && d.event_hash == event_hash
        });
        if running {
            return;
        }

        let variance = transition.delay.random_variance.max(0.0);
        let jitter = if variance > 0.0 {
            self.storage.exec.random.gen_range(-variance..=variance)
        } else {
            0.0
        };
        let time_left = transition.delay.duration + jitter;
        if time_left <= 0.0 {
            return;
        }
        let time_left = time_left - self.tick_delta_time;
        tracing::debug!(transition = transition_index, time_left, "delayed transition started");
        self.storage.exec.delayed_transitions.push(DelayedTransition {
            state_id,
            transition_index: transition_index as u16,
            time_left,
            captured_event: event,
            event_hash,
        });
    }

    fn consume_transition_event(&mut self, transition: &CompactTransition, event: Option<&SharedEvent>) {
        if let Some(event) = event.filter(|_| transition.consume_event_on_select) {
            self.queue_mut().consume(event);
        }
    }

    /// Looks for completion transitions from the first completed state
    /// upwards. Without one, the tree restarts from its root, and fails when
    /// that is impossible. Returns false when the result must not be handed
    /// to a parent frame.
    fn trigger_completion_transitions(&mut self) -> bool {
        let owning_frame = self.config.global_tasks_complete_owning_frame;
        self.storage.exec.has_pending_completed_state = false;

        let mut start: Option<(usize, usize, RunStatus)> = None;
        'frames: for frame_index in 0..self.storage.exec.active_frames.len() {
            let frame = &self.storage.exec.active_frames[frame_index];
            if frame.is_global_frame {
                let status: RunStatus = frame.tasks_status.global.completion_status().into();
                if status != RunStatus::Running {
                    if frame_index == 0 {
                        self.storage.exec.requested_stop = self.storage.exec.requested_stop.merge(status);
                        return false;
                    }
                    if owning_frame {
                        let parent = frame_index - 1;
                        let Some(parent_frame) = self.storage.exec.active_frames.get_mut(parent) else {
                            break;
                        };
                        let last = parent_frame.active_states.len().saturating_sub(1);
                        if let Some(group) = parent_frame.tasks_status.state_mut(last) {
                            group.set_completion_status(TaskStatus::from(status));
                        }
                        self.storage.exec.has_pending_completed_state = true;
                        start = Some((parent, last, status));
                        break 'frames;
                    }
                }
            }
            for state_index in 0..frame.active_states.len() {
                let Some(group) = frame.tasks_status.state(state_index) else {
                    continue;
                };
                let status: RunStatus = group.completion_status().into();
                if status != RunStatus::Running {
                    start = Some((frame_index, state_index, status));
                    break 'frames;
                }
            }
        }

        let Some((start_frame, start_state, status)) = start else {
            return true;
        };
        let succeeded = status == RunStatus::Succeeded;
        let failed = status == RunStatus::Failed;

        for frame_index in (0..=start_frame).rev() {
            let Some(tree) = self.frame_tree(FrameSet::Active, frame_index) else {
                continue;
            };
            let frame = &self.storage.exec.active_frames[frame_index];
            let states = frame.active_states;
            let last = if frame_index == start_frame {
                start_state
            } else {
                states.len().saturating_sub(1)
            };
            for state_index in (0..states.len().min(last + 1)).rev() {
                let handle = states.get(state_index);
                let Some(state) = tree.state(handle) else {
                    continue;
                };
                if !state.should_tick_completion_transitions(succeeded, failed) {
                    continue;
                }
                let scope = Scope {
                    set: FrameSet::Active,
                    frame: Some(frame_index),
                    state: handle,
                    node: None,
                };
                let found = self.with_scope(scope, |ctx| {
                    for transition_index in state.transitions.range() {
                        let Some(transition) = tree.transitions.get(transition_index) else {
                            continue;
                        };
                        if !transition.enabled || !accepts_completion(transition.trigger, status) {
                            continue;
                        }
                        if !ctx.test_all_conditions(FrameSet::Active, frame_index, transition.conditions) {
                            continue;
                        }
                        if ctx.request_transition_internal(
                            frame_index,
                            transition.target,
                            transition.priority.max(TransitionPriority::Normal),
                            None,
                            transition.fallback,
                        ) {
                            return true;
                        }
                    }
                    false
                });
                if found {
                    return true;
                }
            }
        }

        let scope = Scope {
            set: FrameSet::Active,
            frame: Some(0),
            state: StateHandle::ROOT,
            node: None,
        };
        let restarted = self.with_scope(scope, |ctx| {
            ctx.request_transition_internal(
                0,
                StateHandle::ROOT,
                TransitionPriority::Normal,
                None,
                SelectionFallback::None,
            )
        });
        if !restarted || !self.next_transition.target.is_valid() {
            tracing::warn!(asset = %self.root_tree, "no completion transition and the root could not be selected again");
            self.next_transition.reset();
            self.setup_next_transition(0, StateHandle::FAILED, TransitionPriority::Critical);
            return false;
        }
        true
    }

    // ──────────────────────────────────────────────
    // Requests
    // ──────────────────────────────────────────────

    /// Accepts a transition from frame `frame_index` when it outranks the
    /// pending one. Completion targets and the invalid handle are taken as
    /// is; anything else must select.
    pub(crate) fn request_transition_internal(
        &mut self,
        frame_index: usize,
        target: StateHandle,
        priority: TransitionPriority,
        event: Option<SharedEvent>,
        fallback: SelectionFallback,
    ) -> bool {
        if self.next_transition.priority >= priority {
            return false;
        }
        if target.is_completion_state() || !target.is_valid() {
            self.setup_next_transition(frame_index, target, priority);
            return true;
        }

        let Some(frame) = self.storage.exec.active_frames.get(frame_index) else {
            return false;
        };
        let tree_id = frame.tree;
        if !self.select_state(tree_id, target, event, fallback) {
            self.selection = Selection::default();
            return false;
        }

        self.setup_next_transition(frame_index, target, priority);
        let selection = mem::take(&mut self.selection);
        self.consume_selection_events(&selection);
        self.next_transition.next_frames = selection.frames;
        self.next_transition.next_frame_events = selection.events;

        if let Some(tree) = self.tree(tree_id) {
            tracing::debug!(tree = %tree.name, target = %tree.state_name(target), priority = ?priority, "transition requested");
            self.record(TraceEvent::Transition {
                tree: tree_id,
                target: tree.state_name(target),
                priority,
            });
        }
        true
    }

    /// Removes the events captured by selected states that consume them.
    fn consume_selection_events(&mut self, selection: &Selection) {
        for (frame, events) in selection.frames.iter().zip(&selection.events) {
            let Some(tree) = self.tree(frame.tree) else {
                continue;
            };
            for (state_index, handle) in frame.active_states.handles().iter().enumerate() {
                let Some(event) = events.get(state_index) else {
                    continue;
                };
                if tree.state(*handle).is_some_and(|s| s.consume_event_on_select) {
                    self.queue_mut().consume(event);
                }
            }
        }
    }

    /// Points `next_transition` at `target` from the scoped state of frame
    /// `frame_index`. The next frames hold only that frame with `target`.
    pub(crate) fn setup_next_transition(
        &mut self,
        frame_index: usize,
        target: StateHandle,
        priority: TransitionPriority,
    ) {
        let Some(frame) = self.storage.exec.active_frames.get(frame_index) else {
            return;
        };
        let source_state_id = if self.scope.frame == Some(frame_index) && self.scope.set == FrameSet::Active {
            frame
                .active_states
                .index_of(self.scope.state)
                .map_or(ActiveStateId::INVALID, |i| frame.active_states.id(i))
        } else {
            ActiveStateId::INVALID
        };

        let mut next = frame.clone();
        next.active_states = crate::active_states::ActiveStates::single(target);
        next.tasks_status.truncate_states(0);
        next.num_currently_active_states = 0;

        self.next_transition = TransitionResult {
            next_frames: vec![next],
            next_frame_events: vec![SelectionEvents::default()],
            source_frame_id: frame.frame_id,
            source_state_id,
            target,
            current_run_status: self.storage.exec.last_tick_status,
            change_type: ChangeType::Changed,
            priority,
        };
    }

    // ──────────────────────────────────────────────
    // Recording and replay
    // ──────────────────────────────────────────────

    /// Serializable form of a selection about to be entered.
    pub(crate) fn make_recorded_transition_result(
        &self,
        frames: &[ExecutionFrame],
        events: &[SelectionEvents],
    ) -> RecordedTransitionResult {
        let mut recorded = RecordedTransitionResult {
            target: self.next_transition.target,
            priority: self.next_transition.priority,
            ..RecordedTransitionResult::default()
        };

        for (frame_index, frame) in frames.iter().enumerate() {
            let len = frame.active_states.len();
            let mut event_indices = vec![None; len];
            for (state_index, slot) in event_indices.iter_mut().enumerate() {
                if let Some(event) = events.get(frame_index).and_then(|e| e.get(state_index)) {
                    *slot = Some(recorded.events.len() as u8);
                    recorded.events.push(StateTreeEvent::clone(event));
                }
            }
            recorded.frames.push(RecordedFrame {
                tree: frame.tree,
                root_state: frame.root_state,
                active_states: frame.active_states.handles().to_vec(),
                is_global_frame: frame.is_global_frame,
                event_indices,
            });
        }

        let source = find_frame_index(&self.storage.exec.active_frames, self.next_transition.source_frame_id)
            .map(|i| &self.storage.exec.active_frames[i])
            .or_else(|| frames.iter().find(|f| f.frame_id == self.next_transition.source_frame_id));
        if let Some(source) = source {
            recorded.source_tree = Some(source.tree);
            recorded.source_root_state = source.root_state;
            recorded.source_state = source
                .active_states
                .index_of_reverse(self.next_transition.source_state_id)
                .map_or(StateHandle::INVALID, |i| source.active_states.get(i));
        }
        recorded
    }

    /// Rebuilds a transition result from a recording against the current
    /// active frames. Frames still running keep their identity and the ids
    /// of their unchanged leading states.
    pub(crate) fn make_transition_result(&mut self, recorded: &RecordedTransitionResult) -> Option<TransitionResult> {
        if recorded.frames.is_empty() || recorded.frames.len() > MAX_EXECUTION_FRAMES {
            tracing::warn!(frames = recorded.frames.len(), "recorded transition has an invalid number of frames");
            return None;
        }
        let first = &recorded.frames[0];
        if first.tree != self.root_tree || first.root_state != StateHandle::ROOT || !first.is_global_frame {
            tracing::warn!("recorded transition does not start at the root tree");
            return None;
        }

        self.selection = Selection::default();
        for (frame_index, recorded_frame) in recorded.frames.iter().enumerate() {
            let Some(tree) = self.tree(recorded_frame.tree) else {
                tracing::warn!(asset = %recorded_frame.tree, "recorded tree is missing from the library");
                return self.abort_replay();
            };
            if tree.frame_for_root(recorded_frame.root_state).is_none() {
                tracing::warn!(tree = %tree.name, "recorded frame root is not a subtree root");
                return self.abort_replay();
            }

            let mut frame = ExecutionFrame::new(
                recorded_frame.tree,
                tree,
                recorded_frame.root_state,
                recorded_frame.is_global_frame,
            );
            let existing = self
                .storage
                .exec
                .active_frames
                .iter()
                .position(|f| f.is_same_frame(&frame));
            match existing {
                Some(index) => adopt_active_frame(&mut frame, &self.storage.exec.active_frames[index]),
                None => {
                    let Some(previous) = self.selection.frames.last() else {
                        return self.abort_replay();
                    };
                    let Some(previous_tree) = self.tree(previous.tree) else {
                        return self.abort_replay();
                    };
                    let linking_state = previous_tree
                        .state(previous.active_states.last())
                        .map(|s| s.parameter_handle)
                        .unwrap_or_default();
                    let previous_id = previous.frame_id;
                    frame.frame_id = FrameId(self.storage.generate_unique_id());
                    if frame.is_global_frame {
                        frame.global_parameters = ParameterRef::Slot {
                            frame: previous_id,
                            handle: linking_state,
                        };
                        frame.state_parameters = ParameterRef::Slot {
                            frame: frame.frame_id,
                            handle: tree.states[0].parameter_handle,
                        };
                        let base = self
                            .external_data
                            .collect(frame.tree, tree, self.collector.as_deref_mut());
                        let Some(base) = base else {
                            tracing::warn!(tree = %tree.name, "failed to collect external data for recorded frame");
                            return self.abort_replay();
                        };
                        frame.external_data_base = Some(base);
                    } else {
                        let owner = self
                            .selection
                            .frames
                            .iter()
                            .rev()
                            .find(|f| f.tree == frame.tree);
                        frame.external_data_base = owner.and_then(|f| f.external_data_base);
                        frame.global_instance_base = owner.and_then(|f| f.global_instance_base);
                        frame.global_parameters = owner.map_or(ParameterRef::None, |f| f.global_parameters);
                        frame.state_parameters = ParameterRef::Slot {
                            frame: previous_id,
                            handle: linking_state,
                        };
                    }
                }
            }

            let active = existing.map(|i| self.storage.exec.active_frames[i].active_states);
            let mut events = SelectionEvents::default();
            let mut unchanged = true;
            for (state_index, &handle) in recorded_frame.active_states.iter().enumerate() {
                let Some(state) = tree.state(handle) else {
                    tracing::warn!(tree = %tree.name, "recorded state is not in the tree");
                    return self.abort_replay();
                };
                let expected_parent = if state_index == 0 {
                    handle == recorded_frame.root_state
                } else {
                    state.parent == recorded_frame.active_states[state_index - 1]
                };
                if !expected_parent {
                    tracing::warn!(tree = %tree.name, state = %state.name, "recorded path is not contiguous");
                    return self.abort_replay();
                }
                unchanged &= active.is_some_and(|a| a.get(state_index) == handle);
                let id = match active {
                    Some(a) if unchanged => a.id(state_index),
                    _ => ActiveStateId(self.storage.generate_unique_id()),
                };
                if !frame.active_states.push(handle, id) {
                    return self.abort_replay();
                }
                let event = recorded_frame
                    .event_indices
                    .get(state_index)
                    .copied()
                    .flatten()
                    .and_then(|i| recorded.events.get(i as usize));
                events.set(state_index, event.cloned().map(SharedEvent::new));
            }

            let is_new_global = existing.is_none() && frame.is_global_frame;
            let frame_id = frame.frame_id;
            self.selection.frames.push(frame);
            self.selection.events.push(events);
            if is_new_global && self.start_temporary_globals(frame_index) != RunStatus::Running {
                tracing::warn!(tree = %tree.name, "recorded linked asset completed while starting");
                self.stop_temporary_globals(frame_index);
                self.storage.listeners.remove_for_frame(frame_id);
                return self.abort_replay();
            }
        }

        let selection = mem::take(&mut self.selection);
        let source = selection.frames.iter().find(|f| {
            Some(f.tree) == recorded.source_tree && f.root_state == recorded.source_root_state
        });
        let source_frame_id = source.map_or(FrameId::INVALID, |f| f.frame_id);
        let source_state_id = source
            .and_then(|f| {
                f.active_states
                    .index_of(recorded.source_state)
                    .map(|i| f.active_states.id(i))
            })
            .unwrap_or(ActiveStateId::INVALID);

        Some(TransitionResult {
            next_frames: selection.frames,
            next_frame_events: selection.events,
            source_frame_id,
            source_state_id,
            target: recorded.target,
            current_run_status: self.storage.exec.last_tick_status,
            change_type: ChangeType::Changed,
            priority: recorded.priority,
        })
    }

    fn abort_replay(&mut self) -> Option<TransitionResult> {
        self.selection = Selection::default();
        self.storage.temporaries.clear();
        None
    }

    /// Replays a recorded transition: exits what the recording leaves and
    /// enters its frames. Returns `Unset` when the recording does not apply
    /// to the current tree.
    pub fn force_transition(&mut self, recorded: &RecordedTransitionResult) -> RunStatus {
        if !self.is_valid() {
            tracing::warn!(asset = %self.root_tree, "context is not valid, cannot force a transition");
            return RunStatus::Failed;
        }
        if self.storage.exec.is_busy() {
            tracing::error!(phase = %self.storage.exec.current_phase, "force_transition called while busy");
            return RunStatus::Unset;
        }
        if self.storage.exec.tree_run_status != RunStatus::Running {
            return RunStatus::Unset;
        }
        if !self.collect_active_external_data() {
            tracing::warn!(asset = %self.root_tree, "failed to collect external data");
            return RunStatus::Failed;
        }

        self.storage.exec.current_phase = UpdatePhase::TickStateTree;
        let Some(result) = self.make_transition_result(recorded) else {
            self.storage.exec.current_phase = UpdatePhase::Unset;
            return RunStatus::Unset;
        };

        self.next_transition = result;
        self.exit_state();
        let status = self.enter_state();
        self.next_transition.reset();
        self.storage.exec.last_tick_status = status;
        if status != RunStatus::Running {
            self.state_completed();
        }
        self.storage.temporaries.clear();

        self.storage.exec.current_phase = UpdatePhase::Unset;
        if self.storage.exec.requested_stop != RunStatus::Unset {
            return self.process_requested_stop();
        }
        status
    }
}
