//! State selection.
//!
//! Selection builds the frames and active paths a transition would enter,
//! in the context's selection, without entering anything. States that are not
//! active yet read and write temporary instance data; linked assets start
//! their evaluators and global tasks on temporaries so their enter
//! conditions can read them.

use rand::Rng;
use statetree_core::{
    AssetId, CompactState, RunStatus, SelectionBehavior, SelectionFallback, StateHandle,
    StateTree, StateType, TaskStatus, TransitionPriority, TransitionTrigger, MAX_STATES,
};

use super::data::{CopyMode, InstanceRef};
use super::nodes::{EvaluatorCall, TaskCall};
use super::{ExecutionContext, FrameSet, Scope, Selection};
use crate::active_states::ActiveStateId;
use crate::delegates::DelegateDispatcher;
use crate::events::{SelectionEvents, SharedEvent};
use crate::frame::{ExecutionFrame, FrameId, ParameterRef, MAX_EXECUTION_FRAMES};
use crate::task_status::{FrameTaskStatus, TaskGroupStatus};

/// Outcome of trying one linked frame.
enum Attempt {
    Selected,
    /// Try the next candidate event.
    NextCandidate,
    /// The state cannot be selected with any candidate.
    Abort,
}

/// Root-to-target path of `target` inside its subtree.
fn state_path(tree: &StateTree, target: StateHandle) -> Option<Vec<StateHandle>> {
    let mut path = Vec::new();
    let mut current = target;
    while current.is_valid() {
        if path.len() == MAX_STATES {
            return None;
        }
        path.push(current);
        current = tree.state(current)?.parent;
    }
    path.reverse();
    (!path.is_empty()).then_some(path)
}

/// Continues an active frame: the selection keeps its identity, instance
/// bases and global task status.
pub(super) fn adopt_active_frame(frame: &mut ExecutionFrame, active: &ExecutionFrame) {
    frame.frame_id = active.frame_id;
    frame.tasks_status = FrameTaskStatus::new(active.tasks_status.global.clone());
    frame.active_instance_base = active.active_instance_base;
    frame.global_instance_base = active.global_instance_base;
    frame.global_parameters = active.global_parameters;
    frame.state_parameters = active.state_parameters;
    frame.external_data_base = active.external_data_base;
}

impl<'a> ExecutionContext<'a> {
    /// Selects `target` of tree `tree_id`, starting from the active frames.
    /// On success the frames to enter are in `self.selection`.
    ///
    /// Active states on the common path are kept; the last common state is
    /// selected again so its children can change. With
    /// [`SelectionFallback::NextSelectableSibling`] a failed target is
    /// replaced by its following siblings in order.
    pub(crate) fn select_state(
        &mut self,
        tree_id: AssetId,
        target: StateHandle,
        event: Option<SharedEvent>,
        fallback: SelectionFallback,
    ) -> bool {
        if self.storage.exec.active_frames.is_empty() {
            tracing::error!("cannot select a state without an active frame");
            return false;
        }
        let Some(tree) = self.tree(tree_id) else {
            return false;
        };
        let Some(path) = state_path(tree, target) else {
            tracing::debug!(tree = %tree.name, target = target.raw(), "target is not a selectable state");
            return false;
        };

        let mut frame_match = None;
        let mut tree_match = None;
        for (index, frame) in self.storage.exec.active_frames.iter().enumerate().rev() {
            if frame.tree == tree_id {
                tree_match = Some(index);
                if frame.root_state == path[0] {
                    frame_match = Some(index);
                    break;
                }
            }
        }

        let (first_new, counterpart) = match (frame_match, tree_match) {
            (Some(index), _) => {
                let frames = self.storage.exec.active_frames[..=index].to_vec();
                let last = &frames[index].active_states;
                let shared = path.len().min(last.len());
                let first_new = (0..shared)
                    .find(|&i| last.get(i) != path[i])
                    .unwrap_or(shared.saturating_sub(1));
                self.selection = Selection {
                    events: vec![SelectionEvents::default(); frames.len()],
                    frames,
                };
                (first_new, Some(index))
            }
            (None, Some(index)) => {
                // The target's subtree has no frame yet: run it in a new frame
                // on top of the last frame of the same asset.
                if index + 1 >= MAX_EXECUTION_FRAMES {
                    tracing::error!(tree = %tree.name, "reached the maximum number of execution frames");
                    return false;
                }
                let mut frames = self.storage.exec.active_frames[..=index].to_vec();
                let owner = &frames[index];
                let mut frame = ExecutionFrame::new(tree_id, tree, path[0], false);
                frame.frame_id = FrameId(self.storage.generate_unique_id());
                frame.external_data_base = owner.external_data_base;
                frame.global_instance_base = owner.global_instance_base;
                frame.global_parameters = owner.global_parameters;
                frames.push(frame);
                self.selection = Selection {
                    events: vec![SelectionEvents::default(); frames.len()],
                    frames,
                };
                (0, None)
            }
            (None, None) => {
                tracing::error!(tree = %tree.name, "target tree is not running in any active frame");
                return false;
            }
        };

        let last = self.selection.frames.len() - 1;
        let frame = &mut self.selection.frames[last];
        frame.truncate_states(first_new);
        frame.num_currently_active_states = frame.active_states.len();

        let initial = (fallback == SelectionFallback::NextSelectableSibling).then(|| self.selection.clone());
        if self.select_internal(last, counterpart, &path[first_new..], event) {
            return true;
        }

        let Some(initial) = initial else {
            return false;
        };
        if path.len() < 2 {
            return false;
        }
        let Some(parent) = tree.state(path[path.len() - 2]) else {
            return false;
        };
        let prefix = &path[first_new.min(path.len() - 1)..path.len() - 1];
        let mut sibling = tree.state(target).map_or(parent.children_end, |s| s.next_sibling);
        while sibling < parent.children_end {
            self.selection = initial.clone();
            let mut sibling_path = prefix.to_vec();
            sibling_path.push(StateHandle::new(sibling));
            if self.select_internal(last, counterpart, &sibling_path, None) {
                tracing::debug!(tree = %tree.name, state = %tree.state_name(StateHandle::new(sibling)), "selected fallback sibling");
                return true;
            }
            sibling = match tree.states.get(sibling as usize) {
                Some(state) => state.next_sibling,
                None => break,
            };
        }
        false
    }

    /// Selects `path[0]` in selection frame `frame_index`, then the rest of
    /// `path`. `counterpart` is the active frame the selection frame
    /// continues, if any.
    fn select_internal(
        &mut self,
        frame_index: usize,
        counterpart: Option<usize>,
        path: &[StateHandle],
        event: Option<SharedEvent>,
    ) -> bool {
        let Some(&next) = path.first() else {
            return false;
        };
        let Some(tree) = self.frame_tree(FrameSet::Selection, frame_index) else {
            return false;
        };
        let Some(state) = tree.state(next) else {
            return false;
        };
        if !state.enabled {
            tracing::debug!(tree = %tree.name, state = %state.name, "skipping disabled state");
            return false;
        }
        if state.selection_behavior == SelectionBehavior::None {
            return false;
        }

        let scope = Scope {
            set: FrameSet::Selection,
            frame: Some(frame_index),
            state: next,
            node: None,
        };
        self.with_scope(scope, |ctx| {
            ctx.select_at(frame_index, counterpart, path, event, tree, state)
        })
    }

    fn select_at(
        &mut self,
        frame_index: usize,
        counterpart: Option<usize>,
        path: &[StateHandle],
        event: Option<SharedEvent>,
        tree: &'a StateTree,
        state: &'a CompactState,
    ) -> bool {
        let next = path[0];
        let linked_override = match (state.state_type, &state.tag) {
            (StateType::LinkedAsset, Some(tag)) => self.linked_overrides.get(tag).cloned(),
            _ => None,
        };

        if state.parameter_handle.is_valid() {
            if let Some(target) = self.resolve(FrameSet::Selection, frame_index, state.parameter_handle) {
                let overrides = linked_override.as_ref().and_then(|o| o.parameters.as_ref());
                if let (InstanceRef::Temporary(_), Some(overrides)) = (&target, overrides) {
                    if let Some(data) = self.instance_mut(&target) {
                        data.apply_named(overrides);
                    }
                }
                self.copy_batch(
                    FrameSet::Selection,
                    frame_index,
                    &target,
                    state.parameter_bindings,
                    CopyMode::Validated,
                );
            }
        }

        let is_destination = path.len() < 2;
        let check_prerequisites =
            is_destination || state.check_prerequisites_when_activating_child_directly;

        let candidates: Vec<Option<SharedEvent>> = match &state.required_event {
            Some(required) => {
                let mut candidates = Vec::new();
                match event.as_ref().filter(|_| is_destination) {
                    Some(event) => {
                        if required.matches(event) {
                            candidates.push(Some(event.clone()));
                        }
                    }
                    None => {
                        candidates.extend(
                            self.queue()
                                .events()
                                .iter()
                                .filter(|e| required.matches(e))
                                .cloned()
                                .map(Some),
                        );
                        if candidates.is_empty() && !check_prerequisites {
                            candidates.push(None);
                        }
                    }
                }
                candidates
            }
            None => vec![None],
        };
        if candidates.is_empty() {
            return false;
        }

        // A state already active at this depth of the counterpart frame keeps
        // its ActiveStateId. Newly selected states get a fresh one.
        let depth = self.selection.frames[frame_index].active_states.len();
        let active_id = counterpart
            .and_then(|i| self.storage.exec.active_frames.get(i))
            .filter(|active| active.active_states.get(depth) == next)
            .map(|active| active.active_states.id(depth));
        let state_id = match active_id {
            Some(id) => id,
            None => ActiveStateId(self.storage.generate_unique_id()),
        };
        let frame = &mut self.selection.frames[frame_index];
        if !frame.active_states.push(next, state_id) {
            tracing::error!(tree = %tree.name, state = %state.name, "reached the maximum number of active states");
            return false;
        }
        frame.tasks_status.push_state(TaskGroupStatus::for_state(state));
        let previous_entered = frame.num_currently_active_states;
        if frame.active_instance_base.is_some() && active_id.is_some() {
            frame.num_currently_active_states = depth + 1;
        }

        let mut selected = false;
        for candidate in candidates {
            if let Some(captured) = &candidate {
                self.selection.events[frame_index].set(depth, Some(captured.clone()));
            }
            if check_prerequisites
                && !self.test_all_conditions(FrameSet::Selection, frame_index, state.enter_conditions)
            {
                continue;
            }

            if !is_destination {
                if self.select_internal(frame_index, counterpart, &path[1..], event.clone()) {
                    selected = true;
                    break;
                }
                continue;
            }

            let attempt = match state.state_type {
                StateType::Linked => self.select_linked_state(frame_index, state),
                StateType::LinkedAsset => {
                    let asset = linked_override.as_ref().map(|o| o.tree).or(state.linked_asset);
                    self.select_linked_asset(frame_index, state, asset)
                }
                _ => {
                    let found = match state.selection_behavior {
                        SelectionBehavior::TryEnterState => true,
                        SelectionBehavior::TryFollowTransitions => {
                            let own_event = self.selection.events[frame_index].get(depth).cloned();
                            if self.select_by_transitions(frame_index, state, own_event) {
                                return true;
                            }
                            false
                        }
                        _ => self.select_children(frame_index, counterpart, next, state, tree),
                    };
                    if found {
                        Attempt::Selected
                    } else {
                        Attempt::NextCandidate
                    }
                }
            };
            match attempt {
                Attempt::Selected => {
                    selected = true;
                    break;
                }
                Attempt::NextCandidate => continue,
                Attempt::Abort => break,
            }
        }

        if !selected {
            let frame = &mut self.selection.frames[frame_index];
            frame.num_currently_active_states = previous_entered;
            frame.active_states.pop();
            frame.tasks_status.pop_state();
            self.selection.events[frame_index].set(depth, None);
        }
        selected
    }

    // ── Children ──────────────────────────────

    fn select_children(
        &mut self,
        frame_index: usize,
        counterpart: Option<usize>,
        parent: StateHandle,
        state: &CompactState,
        tree: &'a StateTree,
    ) -> bool {
        if !state.has_children() {
            return true;
        }
        let mut remaining = tree.children(parent);

        match state.selection_behavior {
            SelectionBehavior::TrySelectChildrenAtRandom => {
                while !remaining.is_empty() {
                    let pick = self.storage.exec.random.gen_range(0..remaining.len());
                    if self.select_internal(frame_index, counterpart, &[remaining[pick]], None) {
                        return true;
                    }
                    remaining.swap_remove(pick);
                }
                false
            }
            SelectionBehavior::TrySelectChildrenWithHighestUtility => {
                while !remaining.is_empty() {
                    let mut best = None;
                    let mut best_score = f32::NEG_INFINITY;
                    for (i, &child) in remaining.iter().enumerate() {
                        let Some(child_state) = tree.state(child) else {
                            continue;
                        };
                        let score = self.evaluate_utility(
                            FrameSet::Selection,
                            frame_index,
                            child_state.considerations,
                            child_state.weight,
                        );
                        if score > best_score {
                            best_score = score;
                            best = Some(i);
                        }
                    }
                    let Some(pick) = best else {
                        return false;
                    };
                    if self.select_internal(frame_index, counterpart, &[remaining[pick]], None) {
                        return true;
                    }
                    remaining.swap_remove(pick);
                }
                false
            }
            SelectionBehavior::TrySelectChildrenAtRandomWeightedByUtility => {
                let mut scored = Vec::with_capacity(remaining.len());
                for &child in &remaining {
                    let Some(child_state) = tree.state(child) else {
                        continue;
                    };
                    let score = self.evaluate_utility(
                        FrameSet::Selection,
                        frame_index,
                        child_state.considerations,
                        child_state.weight,
                    );
                    scored.push((child, score));
                }
                let mut total: f32 = scored.iter().map(|(_, score)| score).sum();
                while !scored.is_empty() {
                    let roll = self.storage.exec.random.gen::<f32>() * total;
                    let mut accumulated = 0.0;
                    let mut pick = scored.len() - 1;
                    for (i, (_, score)) in scored.iter().enumerate() {
                        accumulated += score;
                        if roll < accumulated {
                            pick = i;
                            break;
                        }
                    }
                    let (child, score) = scored.swap_remove(pick);
                    total -= score;
                    if score != 0.0 && self.select_internal(frame_index, counterpart, &[child], None) {
                        return true;
                    }
                }
                false
            }
            _ => remaining
                .iter()
                .any(|&child| self.select_internal(frame_index, counterpart, &[child], None)),
        }
    }

    // ── Transitions as selection ──────────────────────────────

    /// Selects through the state's own transitions, keeping the result of
    /// the highest priority transition that selects.
    fn select_by_transitions(
        &mut self,
        frame_index: usize,
        state: &CompactState,
        state_event: Option<SharedEvent>,
    ) -> bool {
        let tree_id = self.selection.frames[frame_index].tree;
        let Some(tree) = self.tree(tree_id) else {
            return false;
        };

        let mut best: Option<Selection> = None;
        let mut best_priority = TransitionPriority::None;
        for transition_index in state.transitions.range() {
            let Some(transition) = tree.transitions.get(transition_index) else {
                break;
            };
            if !transition.enabled
                || transition.priority <= best_priority
                || transition.trigger.is_completion()
                || transition.delay.is_delayed()
            {
                continue;
            }
            if self.selection.frames[frame_index].active_states.contains(transition.target) {
                tracing::error!(tree = %tree.name, state = %state.name, "transition would select an ancestor, skipping");
                continue;
            }

            let candidates: Vec<Option<SharedEvent>> = if transition.trigger == TransitionTrigger::ON_EVENT {
                match state_event.as_ref().filter(|e| transition.required_event.matches(e)) {
                    Some(event) => vec![Some(event.clone())],
                    None => self
                        .queue()
                        .events()
                        .iter()
                        .filter(|e| transition.required_event.matches(e))
                        .cloned()
                        .map(Some)
                        .collect(),
                }
            } else if transition.trigger.intersects(TransitionTrigger::ON_TICK) {
                vec![None]
            } else if transition.trigger.intersects(TransitionTrigger::ON_DELEGATE) {
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

            for candidate in candidates {
                let saved = std::mem::replace(&mut self.transition_event, candidate.clone());
                let passed = self.test_all_conditions(FrameSet::Selection, frame_index, transition.conditions);
                self.transition_event = saved;
                if !passed {
                    continue;
                }

                let outer = std::mem::take(&mut self.selection);
                let found = self.select_state(tree_id, transition.target, candidate, transition.fallback);
                let nested = std::mem::replace(&mut self.selection, outer);
                if found {
                    best = Some(nested);
                    best_priority = transition.priority;
                    break;
                }
            }
        }

        match best {
            Some(selection) => {
                self.selection = selection;
                true
            }
            None => false,
        }
    }

    // ── Linked frames ──────────────────────────────

    fn select_linked_state(&mut self, frame_index: usize, state: &CompactState) -> Attempt {
        let current = &self.selection.frames[frame_index];
        let tree_id = current.tree;
        let Some(tree) = self.tree(tree_id) else {
            return Attempt::Abort;
        };
        if !state.linked_state.is_valid() {
            tracing::warn!(tree = %tree.name, state = %state.name, "linked state has no target");
            return Attempt::NextCandidate;
        }
        if self.selection.frames.len() >= MAX_EXECUTION_FRAMES {
            tracing::error!(tree = %tree.name, "reached the maximum number of execution frames");
            return Attempt::Abort;
        }

        let current_id = current.frame_id;
        let current_parameters = current.global_parameters;
        let current_global_base = current.global_instance_base;
        let mut frame = ExecutionFrame::new(tree_id, tree, state.linked_state, false);
        frame.external_data_base = current.external_data_base;
        if self.selection.frames.iter().any(|f| f.is_same_frame(&frame)) {
            tracing::error!(tree = %tree.name, state = %state.name, "linked subtree is already running in this selection");
            return Attempt::Abort;
        }

        let existing = self
            .storage
            .exec
            .active_frames
            .iter()
            .position(|f| f.is_same_frame(&frame));
        match existing {
            Some(index) => adopt_active_frame(&mut frame, &self.storage.exec.active_frames[index]),
            None => {
                frame.frame_id = FrameId(self.storage.generate_unique_id());
                frame.global_parameters = current_parameters;
                frame.global_instance_base = current_global_base;
                frame.state_parameters = ParameterRef::Slot {
                    frame: current_id,
                    handle: state.parameter_handle,
                };
            }
        }

        let root = frame.root_state;
        self.selection.frames.push(frame);
        self.selection.events.push(SelectionEvents::default());
        let new_index = self.selection.frames.len() - 1;
        if self.select_internal(new_index, existing, &[root], None) {
            return Attempt::Selected;
        }
        self.selection.frames.pop();
        self.selection.events.pop();
        Attempt::NextCandidate
    }

    fn select_linked_asset(
        &mut self,
        frame_index: usize,
        state: &CompactState,
        asset: Option<AssetId>,
    ) -> Attempt {
        let Some(asset) = asset else {
            tracing::warn!(state = %state.name, "linked asset state has no asset");
            return Attempt::Abort;
        };
        let Some(linked) = self.tree(asset).filter(|t| !t.states.is_empty()) else {
            tracing::warn!(state = %state.name, asset = %asset, "linked asset is missing or empty");
            return Attempt::Abort;
        };
        if self.selection.frames.len() >= MAX_EXECUTION_FRAMES {
            tracing::error!(tree = %linked.name, "reached the maximum number of execution frames");
            return Attempt::Abort;
        }
        let compatible = self
            .root_tree()
            .is_some_and(|root| root.has_compatible_context_data(linked));
        if !compatible {
            tracing::error!(tree = %linked.name, "linked asset is not compatible with the root tree's schema or context data");
            return Attempt::Abort;
        }

        let mut frame = ExecutionFrame::new(asset, linked, StateHandle::ROOT, true);
        if self.selection.frames.iter().any(|f| f.is_same_frame(&frame)) {
            tracing::error!(tree = %linked.name, "linked asset is already running in this selection");
            return Attempt::Abort;
        }

        let current_id = self.selection.frames[frame_index].frame_id;
        let existing = self
            .storage
            .exec
            .active_frames
            .iter()
            .position(|f| f.is_same_frame(&frame));
        match existing {
            Some(index) => adopt_active_frame(&mut frame, &self.storage.exec.active_frames[index]),
            None => {
                frame.frame_id = FrameId(self.storage.generate_unique_id());
                frame.global_parameters = ParameterRef::Slot {
                    frame: current_id,
                    handle: state.parameter_handle,
                };
                let Some(base) = self
                    .external_data
                    .collect(asset, linked, self.collector.as_deref_mut())
                else {
                    tracing::warn!(tree = %linked.name, "failed to collect external data for linked asset");
                    return Attempt::Abort;
                };
                frame.external_data_base = Some(base);
                frame.state_parameters = ParameterRef::Slot {
                    frame: frame.frame_id,
                    handle: linked.states[0].parameter_handle,
                };
            }
        }

        let frame_id = frame.frame_id;
        self.selection.frames.push(frame);
        self.selection.events.push(SelectionEvents::default());
        let new_index = self.selection.frames.len() - 1;

        let started = existing.is_none();
        if started {
            let status = self.start_temporary_globals(new_index);
            if status != RunStatus::Running {
                tracing::debug!(tree = %linked.name, status = %status, "linked asset globals completed during selection");
                self.stop_temporary_globals(new_index);
                self.storage.listeners.remove_for_frame(frame_id);
                self.selection.frames.pop();
                self.selection.events.pop();
                return Attempt::Abort;
            }
        }

        if self.select_internal(new_index, existing, &[StateHandle::ROOT], None) {
            return Attempt::Selected;
        }
        if started {
            self.stop_temporary_globals(new_index);
            self.storage.listeners.remove_for_frame(frame_id);
        }
        self.selection.frames.pop();
        self.selection.events.pop();
        Attempt::NextCandidate
    }

    /// Starts the evaluators and global tasks of a selected linked asset on
    /// temporary instance data.
    pub(super) fn start_temporary_globals(&mut self, frame_index: usize) -> RunStatus {
        let set = FrameSet::Selection;
        let Some(tree) = self.frame_tree(set, frame_index) else {
            return RunStatus::Failed;
        };
        if !self.selection.frames[frame_index].is_global_frame {
            return RunStatus::Failed;
        }

        for node_index in tree.evaluators.range() {
            self.copy_node_bindings(set, frame_index, node_index, CopyMode::Validated);
            self.call_evaluator(set, frame_index, node_index, EvaluatorCall::TreeStart);
        }

        for (slot, node_index) in tree.global_tasks.range().enumerate() {
            if !tree.is_task_enabled(node_index) {
                continue;
            }
            self.copy_node_bindings(set, frame_index, node_index, CopyMode::Validated);
            let status = self.call_task(set, frame_index, StateHandle::INVALID, node_index, TaskCall::Enter);
            let group = &mut self.selection.frames[frame_index].tasks_status.global;
            let merged = group.set_status_with_priority(slot, status.into());
            if merged == TaskStatus::Failed && group.is_considered_for_completion(slot) {
                return RunStatus::Failed;
            }
        }
        self.selection.frames[frame_index]
            .tasks_status
            .global
            .completion_status()
            .into()
    }

    /// Stops the temporaries started by [`Self::start_temporary_globals`],
    /// most recent first.
    pub(super) fn stop_temporary_globals(&mut self, frame_index: usize) {
        let set = FrameSet::Selection;
        let Some(tree) = self.frame_tree(set, frame_index) else {
            return;
        };
        let frame_id = self.selection.frames[frame_index].frame_id;
        let owners: Vec<usize> = self
            .storage
            .temporaries
            .iter()
            .rev()
            .filter(|t| t.frame_id == frame_id)
            .filter_map(|t| t.owner_node.map(usize::from))
            .collect();
        for node_index in owners {
            if tree.global_tasks.range().contains(&node_index) {
                self.call_task(set, frame_index, StateHandle::INVALID, node_index, TaskCall::Exit);
            } else if tree.evaluators.range().contains(&node_index) {
                self.call_evaluator(set, frame_index, node_index, EvaluatorCall::TreeStop);
            }
        }
    }
}
