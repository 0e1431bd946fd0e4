//! Start, tick and stop, and the enter/exit/completion walks they drive.

use std::mem;

use rand::rngs::StdRng;
use rand::SeedableRng;
use statetree_core::{
    InstanceStruct, NodeRange, RunStatus, SelectionFallback, StateHandle, StateTree, TaskStatus,
    TransitionPriority,
};

use super::data::CopyMode;
use super::nodes::{EvaluatorCall, TaskCall};
use super::{ExecutionContext, FrameSet};
use crate::active_states::{ActiveStateId, ActiveStates};
use crate::frame::{ExecutionFrame, FrameId, ParameterRef};
use crate::state::{ChangeType, TransitionResult, UpdatePhase};
use crate::task_status::{FrameTaskStatus, TaskGroupStatus};
use crate::trace::{NodeCall, TraceEvent};

/// Transition passes per tick. A deep chain of completing subtrees that
/// needs more continues on the next tick.
const MAX_TRANSITION_ITERATIONS: usize = 5;

#[derive(Debug, Clone, Copy)]
struct ExitCall {
    change: ChangeType,
    should_call: bool,
}

#[derive(Debug)]
struct FrameExit {
    stop_globals: bool,
    states: Vec<ExitCall>,
}

impl<'a> ExecutionContext<'a> {
    // ──────────────────────────────────────────────
    // Start / tick / stop
    // ──────────────────────────────────────────────

    /// Starts the tree: initializes instance data, starts evaluators and
    /// global tasks, then selects and enters the initial states.
    ///
    /// `parameters` are applied over the tree's default parameters. Without
    /// them, parameters set earlier through
    /// [`ExecutionContext::set_global_parameters`] are kept. `seed` makes
    /// random selection reproducible.
    pub fn start(&mut self, parameters: Option<InstanceStruct>, seed: Option<u64>) -> RunStatus {
        let Some(tree) = self.root_tree() else {
            tracing::warn!(asset = %self.root_tree, "root tree is missing from the library");
            return RunStatus::Failed;
        };
        if !self.is_valid() {
            tracing::warn!(tree = %tree.name, "context is not valid, check states and required context data");
            return RunStatus::Failed;
        }
        if self.storage.exec.is_busy() {
            tracing::error!(tree = %tree.name, phase = %self.storage.exec.current_phase, "start called while busy");
            return RunStatus::Failed;
        }
        if self.storage.exec.tree_run_status == RunStatus::Running {
            self.stop(RunStatus::Stopped);
        }

        self.storage.reset();
        self.external_data.invalidate();
        self.next_transition.reset();
        match parameters {
            Some(parameters) => self.storage.global_parameters = self.merged_parameters(Some(&parameters)),
            None if self.storage.global_parameters.is_empty() => {
                self.storage.global_parameters = self.merged_parameters(None)
            }
            None => {}
        }

        let mut root = ExecutionFrame::new(self.root_tree, tree, StateHandle::ROOT, true);
        root.frame_id = FrameId(self.storage.generate_unique_id());
        root.global_parameters = ParameterRef::Global;
        root.state_parameters = ParameterRef::Global;
        let mut frames = vec![root];
        self.update_instance_data(&mut frames);
        self.storage.exec.active_frames = frames;
        self.storage.exec.random = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        if !self.collect_active_external_data() {
            tracing::warn!(tree = %tree.name, "failed to collect external data");
            self.storage.reset();
            return RunStatus::Failed;
        }

        tracing::debug!(tree = %tree.name, "starting tree");
        self.storage.exec.current_phase = UpdatePhase::StartTree;

        let (global_status, last_initialized) = self.start_evaluators_and_global_tasks();
        if global_status == RunStatus::Running {
            // Enter is treated as the first tick of tasks; only evaluators tick here.
            self.tick_evaluators_and_global_tasks(0.0, false);
            self.storage.exec.tree_run_status = RunStatus::Running;
            self.storage.exec.last_tick_status = RunStatus::Unset;

            if self.select_state(self.root_tree, StateHandle::ROOT, None, SelectionFallback::None) {
                let selection = mem::take(&mut self.selection);
                self.next_transition = TransitionResult {
                    next_frames: selection.frames,
                    next_frame_events: selection.events,
                    source_frame_id: self
                        .storage
                        .exec
                        .active_frames
                        .first()
                        .map_or(FrameId::INVALID, |f| f.frame_id),
                    target: StateHandle::ROOT,
                    current_run_status: RunStatus::Unset,
                    priority: TransitionPriority::Normal,
                    ..TransitionResult::default()
                };
                let status = self.enter_state();
                self.next_transition.reset();
                self.storage.exec.last_tick_status = status;
                if status != RunStatus::Running {
                    self.state_completed();
                }
            }
            self.storage.temporaries.clear();

            if self.storage.exec.last_tick_status == RunStatus::Unset {
                tracing::warn!(tree = %tree.name, "failed to select initial state");
                self.storage.exec.tree_run_status = RunStatus::Failed;
            }
        } else {
            tracing::debug!(tree = %tree.name, status = %global_status, "global tasks completed the tree on start");
            self.stop_evaluators_and_global_tasks(last_initialized);
            self.storage.exec.active_frames.clear();
            self.storage.listeners.clear();
            self.storage.exec.tree_run_status = global_status;
        }

        self.storage.exec.current_phase = UpdatePhase::Unset;
        self.process_requested_stop()
    }

    /// Stops the tree, exiting every active state. `Unset` and `Running`
    /// are treated as `Stopped`. While an update is running the stop is
    /// deferred to its end and `Running` is returned.
    pub fn stop(&mut self, status: RunStatus) -> RunStatus {
        let Some(tree) = self.root_tree() else {
            return RunStatus::Failed;
        };
        if !self.is_valid() {
            tracing::warn!(tree = %tree.name, "context is not valid, cannot stop");
            return RunStatus::Failed;
        }
        let status = match status {
            RunStatus::Unset | RunStatus::Running => RunStatus::Stopped,
            other => other,
        };
        if self.storage.exec.is_busy() {
            tracing::debug!(tree = %tree.name, status = %status, phase = %self.storage.exec.current_phase, "deferring stop");
            self.storage.exec.requested_stop = self.storage.exec.requested_stop.merge(status);
            return RunStatus::Running;
        }
        if !self.collect_active_external_data() {
            tracing::warn!(tree = %tree.name, "failed to collect external data, cannot stop");
            return RunStatus::Failed;
        }

        self.storage.exec.current_phase = UpdatePhase::StopTree;
        let mut result = self.storage.exec.tree_run_status;
        if result == RunStatus::Running {
            self.next_transition = TransitionResult {
                target: StateHandle::from_completion_status(status),
                current_run_status: status,
                ..TransitionResult::default()
            };
            self.exit_state();
            self.next_transition.reset();
            result = status;
        }

        self.storage.reset();
        self.external_data.invalidate();
        // The final status stays readable until the next start.
        self.storage.exec.tree_run_status = result;
        tracing::debug!(tree = %tree.name, status = %result, "tree stopped");
        result
    }

    /// Ticks tasks, then triggers transitions.
    pub fn tick(&mut self, delta_time: f32) -> RunStatus {
        let status = self.tick_prelude();
        if status != RunStatus::Running {
            return status;
        }
        self.tick_update_tasks_internal(delta_time);
        self.tick_trigger_transitions_internal();
        self.tick_postlude()
    }

    /// First half of [`ExecutionContext::tick`]: evaluators and tasks only.
    pub fn tick_update_tasks(&mut self, delta_time: f32) -> RunStatus {
        let status = self.tick_prelude();
        if status != RunStatus::Running {
            return status;
        }
        self.tick_update_tasks_internal(delta_time);
        self.tick_postlude()
    }

    /// Second half of [`ExecutionContext::tick`]: transitions only.
    pub fn tick_trigger_transitions(&mut self) -> RunStatus {
        let status = self.tick_prelude();
        if status != RunStatus::Running {
            return status;
        }
        self.tick_trigger_transitions_internal();
        self.tick_postlude()
    }

    fn tick_prelude(&mut self) -> RunStatus {
        if !self.is_valid() {
            tracing::warn!(asset = %self.root_tree, "context is not valid, cannot tick");
            return RunStatus::Failed;
        }
        if !self.collect_active_external_data() {
            tracing::warn!(asset = %self.root_tree, "failed to collect external data");
            return RunStatus::Failed;
        }
        if self.storage.exec.tree_run_status != RunStatus::Running {
            return self.storage.exec.tree_run_status;
        }
        if self.storage.exec.is_busy() {
            tracing::error!(phase = %self.storage.exec.current_phase, "tick called while busy");
            return RunStatus::Failed;
        }
        self.storage.exec.current_phase = UpdatePhase::TickStateTree;
        RunStatus::Running
    }

    fn tick_postlude(&mut self) -> RunStatus {
        self.storage.exec.current_phase = UpdatePhase::Unset;
        self.process_requested_stop()
    }

    /// Applies a stop deferred while the context was busy.
    pub(crate) fn process_requested_stop(&mut self) -> RunStatus {
        let requested = mem::take(&mut self.storage.exec.requested_stop);
        if requested == RunStatus::Unset {
            return self.storage.exec.tree_run_status;
        }
        tracing::debug!(status = %requested, "processing deferred stop");
        self.stop(requested)
    }

    fn tick_update_tasks_internal(&mut self, delta_time: f32) {
        if self.storage.exec.requested_stop != RunStatus::Unset {
            return;
        }
        let delta_time = delta_time.max(0.0);
        self.tick_delta_time = delta_time;
        for delayed in &mut self.storage.exec.delayed_transitions {
            delayed.time_left -= delta_time;
        }

        let previous = self.storage.exec.last_tick_status;
        if self.config.tick_global_nodes_following_tree_hierarchy {
            self.tick_states(delta_time, previous);
            return;
        }

        let global_status = self.tick_evaluators_and_global_tasks(delta_time, true);
        if global_status == RunStatus::Running {
            if previous == RunStatus::Running {
                self.tick_states(delta_time, previous);
            }
        } else if self.config.global_tasks_complete_owning_frame {
            let first = self
                .storage
                .exec
                .active_frames
                .first()
                .map_or(RunStatus::Running, |f| f.tasks_status.global.completion_status().into());
            if first != RunStatus::Running {
                self.storage.exec.requested_stop = self.storage.exec.requested_stop.merge(first);
            }
        } else {
            self.storage.exec.requested_stop = self.storage.exec.requested_stop.merge(global_status);
        }
    }

    fn tick_states(&mut self, delta_time: f32, previous: RunStatus) {
        let status = self.tick_tasks(delta_time);
        self.storage.exec.last_tick_status = status;
        if status != RunStatus::Running
            && self.storage.exec.requested_stop == RunStatus::Unset
            && previous == RunStatus::Running
        {
            self.state_completed();
        }
    }

    fn tick_trigger_transitions_internal(&mut self) {
        if self.storage.exec.requested_stop != RunStatus::Unset {
            return;
        }
        self.trigger_from_frame_index = None;

        for _ in 0..MAX_TRANSITION_ITERATIONS {
            self.storage.temporaries.clear();
            if self.trigger_transitions() {
                self.exit_state();
                let target = self.next_transition.target;
                if target.is_completion_state() {
                    let status = target.to_completion_status();
                    tracing::debug!(asset = %self.root_tree, status = %status, "tree completed");
                    self.storage.exec.tree_run_status = status;
                    if self.storage.exec.active_frames.first().is_some_and(|f| f.is_global_frame) {
                        self.stop_frame_globals(0, None);
                    }
                    self.storage.exec.active_frames.clear();
                    self.storage.listeners.clear();
                    self.next_transition.reset();
                    break;
                }

                let status = self.enter_state();
                self.next_transition.reset();
                self.storage.exec.last_tick_status = status;
                if status != RunStatus::Running {
                    self.state_completed();
                }
            }
            if self.storage.exec.last_tick_status == RunStatus::Running
                || self.storage.exec.requested_stop != RunStatus::Unset
            {
                break;
            }
        }
        self.storage.temporaries.clear();
    }

    // ──────────────────────────────────────────────
    // Enter / exit / completion
    // ──────────────────────────────────────────────

    /// Enters the frames of the pending transition. Active frames are
    /// rebuilt one state at a time so they only hold states whose enter has
    /// run.
    pub(crate) fn enter_state(&mut self) -> RunStatus {
        let mut next = mem::take(&mut self.next_transition.next_frames);
        let events = mem::take(&mut self.next_transition.next_frame_events);
        if next.is_empty() {
            return RunStatus::Failed;
        }

        if self.config.record_transitions {
            let recorded = self.make_recorded_transition_result(&next, &events);
            self.storage.recorded.push(recorded);
        }

        self.update_instance_data(&mut next);
        let previous = mem::take(&mut self.storage.exec.active_frames);
        self.capture_new_state_events(&previous, &next, &events);

        let exec = &mut self.storage.exec;
        exec.state_change_count += 1;
        exec.enter_state_failed_frame_index = None;
        exec.enter_state_failed_task_index = None;
        let count = exec.state_change_count;
        tracing::debug!(count, path = %self.describe_path(&next), "enter state");

        let target = self.next_transition.target;
        let source_frame_id = self.next_transition.source_frame_id;
        let mut on_target_branch = false;
        let mut any_parent_changed = false;
        let mut result = RunStatus::Running;

        for mut frame in next {
            if result == RunStatus::Failed {
                break;
            }
            let Some(tree) = self.tree(frame.tree) else {
                result = RunStatus::Failed;
                break;
            };
            let tree_id = frame.tree;
            let states = frame.active_states;
            frame.active_states = ActiveStates::new();
            frame.tasks_status = FrameTaskStatus::new(frame.tasks_status.global.clone());
            frame.num_currently_active_states = 0;
            let frame_index = self.storage.exec.active_frames.len();
            let previous_frame = previous
                .get(frame_index)
                .filter(|p| p.is_same_frame(&frame));
            let frame_id = frame.frame_id;
            self.storage.exec.active_frames.push(frame);

            for (state_index, (handle, state_id)) in states.iter().enumerate() {
                if result == RunStatus::Failed {
                    break;
                }
                let Some(state) = tree.state(handle) else {
                    continue;
                };
                let previous_handle = previous_frame.map_or(StateHandle::INVALID, |p| p.active_states.get(state_index));
                if frame_id == source_frame_id && handle == target {
                    on_target_branch = true;
                }
                let was_active = previous_handle == handle && !any_parent_changed;
                let change = if was_active {
                    ChangeType::Sustained
                } else {
                    any_parent_changed = true;
                    ChangeType::Changed
                };
                let entering = !was_active || on_target_branch;

                let group = match previous_frame.and_then(|p| p.tasks_status.state(state_index)) {
                    Some(group) if !entering => group.clone(),
                    _ => TaskGroupStatus::for_state(state),
                };
                let Some(active) = self.storage.exec.active_frames.get_mut(frame_index) else {
                    break;
                };
                let pushed = active.active_states.push(handle, state_id);
                debug_assert!(pushed, "selection produced a path deeper than the active state list");
                if !pushed {
                    tracing::error!(tree = %tree.name, state = %state.name, "reached the maximum number of active states");
                    break;
                }
                active.tasks_status.push_state(group);
                active.num_currently_active_states = active.active_states.len();

                if state.is_linked() {
                    self.copy_state_parameters(frame_index, state);
                }

                if entering {
                    tracing::debug!(tree = %tree.name, state = %state.name, change = ?change, "entering state");
                    self.record(TraceEvent::StateEntered {
                        tree: tree_id,
                        state: state.name.clone(),
                        change,
                    });
                    if state.has_state_change_conditions {
                        self.call_condition_hooks(FrameSet::Active, frame_index, state.enter_conditions, NodeCall::EnterState);
                    }
                }

                for (slot, (node_index, node)) in tree.task_nodes(state.tasks).enumerate() {
                    let Some(task) = node.kind.as_task() else {
                        continue;
                    };
                    self.copy_node_bindings(FrameSet::Active, frame_index, node_index, CopyMode::Active);
                    if !task.flags.enabled {
                        continue;
                    }
                    let should_call = change == ChangeType::Changed || task.flags.state_change_on_reselect;
                    if !entering || !should_call {
                        continue;
                    }

                    let status = self.call_task(FrameSet::Active, frame_index, handle, node_index, TaskCall::Enter);
                    let Some(group) = self.task_group_mut(frame_index, Some(state_index)) else {
                        continue;
                    };
                    let merged = group.set_status_with_priority(slot, status.into());
                    let considered = group.is_considered_for_completion(slot);
                    result = result.merge(merged.into());
                    if merged == TaskStatus::Failed && considered {
                        self.storage.exec.enter_state_failed_frame_index = Some(frame_index);
                        self.storage.exec.enter_state_failed_task_index = Some(node_index);
                        break;
                    }
                }
            }
        }

        self.storage.exec.has_pending_completed_state = result != RunStatus::Running;
        result
    }

    /// Exits the states the pending transition leaves, leaf first. A state
    /// that stays active is only exited when it is on the target branch.
    pub(crate) fn exit_state(&mut self) {
        if self.storage.exec.active_frames.is_empty() {
            return;
        }
        let next_frames = mem::take(&mut self.next_transition.next_frames);
        let target = self.next_transition.target;
        let source_frame_id = self.next_transition.source_frame_id;

        let mut exits: Vec<FrameExit> = Vec::new();
        let mut on_target_branch = false;
        let mut any_parent_changed = false;

        for frame_index in 0..self.storage.exec.active_frames.len() {
            let frame = self.storage.exec.active_frames[frame_index].clone();
            let Some(tree) = self.tree(frame.tree) else {
                exits.push(FrameExit {
                    stop_globals: false,
                    states: Vec::new(),
                });
                continue;
            };
            let next_frame = next_frames.get(frame_index).filter(|n| n.is_same_frame(&frame));
            let stop_globals = next_frame.is_none() && frame.is_global_frame;
            if stop_globals {
                for node_index in tree.evaluators.range() {
                    self.copy_node_bindings(FrameSet::Active, frame_index, node_index, CopyMode::Active);
                }
                self.copy_exit_bindings(frame_index, tree, tree.global_tasks);
            }

            let mut states = Vec::with_capacity(frame.active_states.len());
            for (state_index, handle) in frame.active_states.handles().iter().copied().enumerate() {
                let Some(state) = tree.state(handle) else {
                    states.push(ExitCall {
                        change: ChangeType::Changed,
                        should_call: false,
                    });
                    continue;
                };
                let next_handle = next_frame.map_or(StateHandle::INVALID, |n| n.active_states.get(state_index));
                if state.is_linked() {
                    self.copy_state_parameters(frame_index, state);
                }
                if frame.frame_id == source_frame_id && handle == target {
                    on_target_branch = true;
                }
                let remains = next_handle == handle && !any_parent_changed;
                let change = if remains {
                    ChangeType::Sustained
                } else {
                    any_parent_changed = true;
                    ChangeType::Changed
                };
                states.push(ExitCall {
                    change,
                    should_call: !remains || on_target_branch,
                });
                self.copy_exit_bindings(frame_index, tree, state.tasks);
            }
            exits.push(FrameExit { stop_globals, states });
        }

        for frame_index in (0..self.storage.exec.active_frames.len()).rev() {
            let frame = self.storage.exec.active_frames[frame_index].clone();
            let Some(tree) = self.tree(frame.tree) else {
                continue;
            };
            let Some(exit) = exits.get(frame_index) else {
                continue;
            };

            let states: Vec<(StateHandle, ActiveStateId)> = frame.active_states.iter().collect();
            for (state_index, (handle, state_id)) in states.into_iter().enumerate().rev() {
                let Some(call) = exit.states.get(state_index).copied() else {
                    continue;
                };
                if !call.should_call {
                    continue;
                }
                let Some(state) = tree.state(handle) else {
                    continue;
                };

                let transitions = state.transitions.range();
                self.storage
                    .exec
                    .delayed_transitions
                    .retain(|d| !(d.state_id == state_id && transitions.contains(&(d.transition_index as usize))));

                let tasks: Vec<(usize, bool)> = tree
                    .task_nodes(state.tasks)
                    .filter_map(|(i, node)| node.kind.as_task().map(|t| (i, t)))
                    .filter(|(_, t)| t.flags.enabled)
                    .map(|(i, t)| (i, t.flags.state_change_on_reselect))
                    .collect();
                for (node_index, on_reselect) in tasks.into_iter().rev() {
                    if !self.storage.exec.was_task_entered(frame_index, node_index) {
                        continue;
                    }
                    if call.change == ChangeType::Changed || on_reselect {
                        self.call_task(FrameSet::Active, frame_index, handle, node_index, TaskCall::Exit);
                    }
                }
                if state.has_state_change_conditions {
                    self.call_condition_hooks(FrameSet::Active, frame_index, state.enter_conditions, NodeCall::ExitState);
                }

                self.storage.listeners.remove_for_state(state_id);
                tracing::debug!(tree = %tree.name, state = %state.name, change = ?call.change, "exited state");
                self.record(TraceEvent::StateExited {
                    tree: frame.tree,
                    state: state.name.clone(),
                    change: call.change,
                });
            }

            if exit.stop_globals {
                self.call_stop_on_evaluators_and_global_tasks(frame_index, None);
                self.storage.listeners.remove_for_frame(frame.frame_id);
            }
        }

        self.next_transition.next_frames = next_frames;
    }

    /// Notifies every entered task, leaf first, that its state completed.
    pub(crate) fn state_completed(&mut self) {
        let failed_frame = self.storage.exec.enter_state_failed_frame_index;
        for frame_index in (0..self.storage.exec.active_frames.len()).rev() {
            if failed_frame.is_some_and(|failed| frame_index > failed) {
                continue;
            }
            let Some(frame) = self.storage.exec.active_frames.get(frame_index) else {
                continue;
            };
            let states = frame.active_states;
            let Some(tree) = self.tree(frame.tree) else {
                continue;
            };
            for handle in states.handles().iter().rev().copied() {
                let Some(state) = tree.state(handle) else {
                    continue;
                };
                let tasks: Vec<usize> = tree
                    .task_nodes(state.tasks)
                    .map(|(i, _)| i)
                    .filter(|&i| tree.is_task_enabled(i))
                    .collect();
                for node_index in tasks.into_iter().rev() {
                    if self.storage.exec.was_task_entered(frame_index, node_index) {
                        self.call_task(FrameSet::Active, frame_index, handle, node_index, TaskCall::StateCompleted);
                    }
                }
                if state.has_state_change_conditions {
                    self.call_condition_hooks(
                        FrameSet::Active,
                        frame_index,
                        state.enter_conditions,
                        NodeCall::StateCompleted,
                    );
                }
            }
        }
    }

    // ──────────────────────────────────────────────
    // Evaluators and global tasks
    // ──────────────────────────────────────────────

    /// Starts the globals of every active global frame. Returns the merged
    /// status and, when a task failed, the node index of that task: tasks up
    /// to it were entered and need an exit.
    fn start_evaluators_and_global_tasks(&mut self) -> (RunStatus, Option<usize>) {
        let mut result = RunStatus::Running;
        for frame_index in 0..self.storage.exec.active_frames.len() {
            if !self.storage.exec.active_frames[frame_index].is_global_frame {
                continue;
            }
            let Some(tree) = self.frame_tree(FrameSet::Active, frame_index) else {
                continue;
            };

            for node_index in tree.evaluators.range() {
                self.copy_node_bindings(FrameSet::Active, frame_index, node_index, CopyMode::Active);
                self.call_evaluator(FrameSet::Active, frame_index, node_index, EvaluatorCall::TreeStart);
            }

            for (slot, node_index) in tree.global_tasks.range().enumerate() {
                if !tree.is_task_enabled(node_index) {
                    continue;
                }
                self.copy_node_bindings(FrameSet::Active, frame_index, node_index, CopyMode::Active);
                let status = self.call_task(FrameSet::Active, frame_index, StateHandle::INVALID, node_index, TaskCall::Enter);
                let Some(group) = self.task_group_mut(frame_index, None) else {
                    return (RunStatus::Failed, Some(node_index));
                };
                let merged = group.set_status_with_priority(slot, status.into());
                if merged == TaskStatus::Failed && group.is_considered_for_completion(slot) {
                    return (RunStatus::Failed, Some(node_index));
                }
            }

            let completion = self.storage.exec.active_frames[frame_index]
                .tasks_status
                .global
                .completion_status();
            result = result.merge(completion.into());
        }
        (result, None)
    }

    /// Ticks evaluators of every global frame, and their global tasks when
    /// `tick_global_tasks` is set.
    fn tick_evaluators_and_global_tasks(&mut self, delta_time: f32, tick_global_tasks: bool) -> RunStatus {
        let mut result = RunStatus::Running;
        for frame_index in 0..self.storage.exec.active_frames.len() {
            if !self.storage.exec.active_frames[frame_index].is_global_frame {
                continue;
            }
            let status = self.tick_frame_globals(frame_index, delta_time, tick_global_tasks);
            self.storage.exec.has_pending_completed_state |= status != RunStatus::Running;
            result = result.merge(status);
            if result == RunStatus::Failed {
                break;
            }
        }
        result
    }

    fn tick_frame_globals(&mut self, frame_index: usize, delta_time: f32, tick_global_tasks: bool) -> RunStatus {
        let Some(tree) = self.frame_tree(FrameSet::Active, frame_index) else {
            return RunStatus::Failed;
        };
        for node_index in tree.evaluators.range() {
            self.copy_node_bindings(FrameSet::Active, frame_index, node_index, CopyMode::Active);
            self.call_evaluator(FrameSet::Active, frame_index, node_index, EvaluatorCall::Tick(delta_time));
        }

        if tick_global_tasks {
            let has_events = self.queue().has_events();
            let any_failed = self
                .task_group(frame_index, None)
                .map_or(true, TaskGroupStatus::has_any_failed);
            if !any_failed
                && (self.config.copy_bound_properties_on_non_ticked_task || tree.requests_global_tick(has_events))
            {
                self.tick_task_group(frame_index, StateHandle::INVALID, None, tree, tree.global_tasks, delta_time, true);
            }
        }

        self.task_group(frame_index, None)
            .map_or(RunStatus::Failed, |group| group.completion_status().into())
    }

    /// Stops the globals of every active global frame, last frame first.
    /// `last_initialized` limits the exited global tasks of the last frame.
    fn stop_evaluators_and_global_tasks(&mut self, last_initialized: Option<usize>) {
        let frames = &self.storage.exec.active_frames;
        let last_global = frames.iter().rposition(|f| f.is_global_frame);
        let globals: Vec<usize> = (0..frames.len()).filter(|&i| frames[i].is_global_frame).collect();
        for frame_index in globals.into_iter().rev() {
            let limit = if Some(frame_index) == last_global {
                last_initialized
            } else {
                None
            };
            self.stop_frame_globals(frame_index, limit);
        }
    }

    fn stop_frame_globals(&mut self, frame_index: usize, last_initialized: Option<usize>) {
        let Some(tree) = self.frame_tree(FrameSet::Active, frame_index) else {
            return;
        };
        for node_index in tree.evaluators.range() {
            self.copy_node_bindings(FrameSet::Active, frame_index, node_index, CopyMode::Active);
        }
        self.copy_exit_bindings(frame_index, tree, tree.global_tasks);
        self.call_stop_on_evaluators_and_global_tasks(frame_index, last_initialized);
    }

    /// Exits global tasks in reverse (only those up to `last_initialized`
    /// when given), then stops evaluators in reverse.
    fn call_stop_on_evaluators_and_global_tasks(&mut self, frame_index: usize, last_initialized: Option<usize>) {
        let Some(tree) = self.frame_tree(FrameSet::Active, frame_index) else {
            return;
        };
        for node_index in tree.global_tasks.range().rev() {
            if !tree.is_task_enabled(node_index) {
                continue;
            }
            if last_initialized.is_some_and(|last| node_index > last) {
                continue;
            }
            self.call_task(FrameSet::Active, frame_index, StateHandle::INVALID, node_index, TaskCall::Exit);
        }
        for node_index in tree.evaluators.range().rev() {
            self.call_evaluator(FrameSet::Active, frame_index, node_index, EvaluatorCall::TreeStop);
        }
    }

    // ──────────────────────────────────────────────
    // Task ticking
    // ──────────────────────────────────────────────

    /// Ticks the tasks of every active state, root to leaf, and returns the
    /// merged state completion. Global completion requests a stop.
    fn tick_tasks(&mut self, delta_time: f32) -> RunStatus {
        self.storage.exec.has_pending_completed_state = false;
        if self.storage.exec.active_frames.is_empty() {
            return RunStatus::Failed;
        }

        let follow_hierarchy = self.config.tick_global_nodes_following_tree_hierarchy;
        let owning_frame = self.config.global_tasks_complete_owning_frame;
        let copy_non_ticked = self.config.copy_bound_properties_on_non_ticked_task;
        let has_events = self.queue().has_events();

        let mut num_enabled_tasks = 0;
        let mut should_tick = true;
        'frames: for frame_index in 0..self.storage.exec.active_frames.len() {
            let frame = &self.storage.exec.active_frames[frame_index];
            let is_global = frame.is_global_frame;
            let states = frame.active_states;
            let Some(tree) = self.tree(frame.tree) else {
                continue;
            };

            if follow_hierarchy && is_global {
                let status = self.tick_frame_globals(frame_index, delta_time, true);
                if status != RunStatus::Running {
                    if !owning_frame || frame_index == 0 {
                        self.storage.exec.requested_stop = self.storage.exec.requested_stop.merge(status);
                    }
                    break 'frames;
                }
            }

            for (state_index, handle) in states.handles().iter().copied().enumerate() {
                let Some(state) = tree.state(handle) else {
                    continue;
                };
                if state.is_linked() {
                    self.copy_state_parameters(frame_index, state);
                }
                num_enabled_tasks += tree
                    .task_nodes(state.tasks)
                    .filter(|(i, _)| tree.is_task_enabled(*i))
                    .count();

                if copy_non_ticked || state.requests_tick_tasks(has_events) {
                    let ticked = self.tick_task_group(
                        frame_index,
                        handle,
                        Some(state_index),
                        tree,
                        state.tasks,
                        delta_time,
                        should_tick,
                    );
                    let any_failed = self
                        .task_group(frame_index, Some(state_index))
                        .is_some_and(TaskGroupStatus::has_any_failed);
                    should_tick = ticked && !any_failed;
                }
                if !copy_non_ticked && !should_tick {
                    break 'frames;
                }
            }
        }

        let frames = &self.storage.exec.active_frames;
        let first_frame_result: RunStatus = frames
            .first()
            .filter(|f| f.is_global_frame)
            .map_or(RunStatus::Running, |f| f.tasks_status.global.completion_status().into());
        let mut frame_result = RunStatus::Running;
        let mut state_result = RunStatus::Running;
        'aggregate: for frame in frames {
            if frame.is_global_frame {
                frame_result = frame_result.merge(frame.tasks_status.global.completion_status().into());
            }
            for state_index in 0..frame.active_states.len() {
                if let Some(group) = frame.tasks_status.state(state_index) {
                    state_result = state_result.merge(group.completion_status().into());
                }
                if state_result == RunStatus::Failed {
                    break 'aggregate;
                }
            }
        }

        if owning_frame && first_frame_result != RunStatus::Running {
            self.storage.exec.requested_stop = self.storage.exec.requested_stop.merge(frame_result);
        } else if !owning_frame && frame_result != RunStatus::Running {
            self.storage.exec.requested_stop = self.storage.exec.requested_stop.merge(frame_result);
        } else if num_enabled_tasks == 0 && state_result == RunStatus::Running && frame_result == RunStatus::Running {
            // A path without tasks completes at once.
            if let Some(frame) = self.storage.exec.active_frames.last_mut() {
                let last = frame.active_states.len().checked_sub(1);
                match last {
                    Some(index) if index < frame.tasks_status.num_states() => {
                        if let Some(group) = frame.tasks_status.state_mut(index) {
                            group.set_completion_status(TaskStatus::Succeeded);
                        }
                    }
                    _ => frame.tasks_status.global.set_completion_status(TaskStatus::Succeeded),
                }
            }
            state_result = RunStatus::Succeeded;
        }

        self.storage.exec.has_pending_completed_state =
            state_result != RunStatus::Running || frame_result != RunStatus::Running;
        state_result
    }

    /// Ticks one task group. Returns whether later groups should still tick:
    /// false once a considered task failed.
    #[allow(clippy::too_many_arguments)]
    fn tick_task_group(
        &mut self,
        frame_index: usize,
        state: StateHandle,
        state_index: Option<usize>,
        tree: &'a StateTree,
        tasks: NodeRange,
        delta_time: f32,
        mut should_tick: bool,
    ) -> bool {
        let has_events = self.queue().has_events();
        let copy_non_ticked = self.config.copy_bound_properties_on_non_ticked_task;

        for (slot, (node_index, node)) in tree.task_nodes(tasks).enumerate() {
            let Some(task) = node.kind.as_task() else {
                continue;
            };
            if !task.flags.enabled {
                continue;
            }
            let Some(group) = self.task_group(frame_index, state_index) else {
                return false;
            };
            let running = group.is_running(slot);
            let any_failed = group.has_any_failed();
            let needs_tick = should_tick && running && task.wants_tick(has_events);

            if (copy_non_ticked || needs_tick) && task.flags.copy_bound_properties_on_tick {
                self.copy_node_bindings(FrameSet::Active, frame_index, node_index, CopyMode::Active);
            }
            if !needs_tick {
                if !running && should_tick && any_failed {
                    should_tick = false;
                }
                continue;
            }

            let status = self.call_task(FrameSet::Active, frame_index, state, node_index, TaskCall::Tick(delta_time));
            let Some(group) = self.task_group_mut(frame_index, state_index) else {
                return false;
            };
            let merged = group.set_status_with_priority(slot, status.into());
            if merged == TaskStatus::Failed && group.is_considered_for_completion(slot) {
                should_tick = false;
            }
        }
        should_tick
    }

    // ──────────────────────────────────────────────
    // Helpers
    // ──────────────────────────────────────────────

    fn task_group(&self, frame_index: usize, state_index: Option<usize>) -> Option<&TaskGroupStatus> {
        let frame = self.storage.exec.active_frames.get(frame_index)?;
        match state_index {
            Some(index) => frame.tasks_status.state(index),
            None => Some(&frame.tasks_status.global),
        }
    }

    fn task_group_mut(&mut self, frame_index: usize, state_index: Option<usize>) -> Option<&mut TaskGroupStatus> {
        let frame = self.storage.exec.active_frames.get_mut(frame_index)?;
        match state_index {
            Some(index) => frame.tasks_status.state_mut(index),
            None => Some(&mut frame.tasks_status.global),
        }
    }

    /// Refreshes the parameters a linked state passes to its frame.
    fn copy_state_parameters(&mut self, frame_index: usize, state: &statetree_core::CompactState) {
        if !state.parameter_handle.is_valid() || state.parameter_bindings.is_none() {
            return;
        }
        if let Some(target) = self.resolve(FrameSet::Active, frame_index, state.parameter_handle) {
            self.copy_batch(FrameSet::Active, frame_index, &target, state.parameter_bindings, CopyMode::Active);
        }
    }

    fn copy_exit_bindings(&mut self, frame_index: usize, tree: &StateTree, tasks: NodeRange) {
        let nodes: Vec<usize> = tree
            .task_nodes(tasks)
            .filter(|(_, node)| {
                node.kind
                    .as_task()
                    .is_some_and(|t| t.flags.copy_bound_properties_on_exit)
            })
            .map(|(i, _)| i)
            .collect();
        for node_index in nodes {
            self.copy_node_bindings(FrameSet::Active, frame_index, node_index, CopyMode::Active);
        }
    }

    /// Collects external data for every active frame and records each
    /// frame's base index.
    pub(crate) fn collect_active_external_data(&mut self) -> bool {
        for frame_index in 0..self.storage.exec.active_frames.len() {
            let asset = self.storage.exec.active_frames[frame_index].tree;
            let Some(tree) = self.tree(asset) else {
                return false;
            };
            match self.external_data.collect(asset, tree, self.collector.as_deref_mut()) {
                Some(base) => self.storage.exec.active_frames[frame_index].external_data_base = Some(base),
                None => return false,
            }
        }
        true
    }

    /// `Tree:State/State` per frame, for logs.
    pub(crate) fn describe_path(&self, frames: &[ExecutionFrame]) -> String {
        let mut out = String::new();
        for frame in frames {
            let Some(tree) = self.tree(frame.tree) else {
                continue;
            };
            if !out.is_empty() {
                out.push_str(" > ");
            }
            out.push_str(&tree.name);
            out.push(':');
            let names: Vec<&str> = frame
                .active_states
                .handles()
                .iter()
                .filter_map(|h| tree.state(*h).map(|s| s.name.as_str()))
                .collect();
            out.push_str(&names.join("/"));
        }
        out
    }
}
