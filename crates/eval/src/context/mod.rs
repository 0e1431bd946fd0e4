//! The execution context: drives one instance of a tree through start, tick
//! and stop, against the [`InstanceStorage`] it borrows.
//!
//! A context is cheap to build and is meant to be created per update. All
//! persistent runtime state lives in the storage; the context only holds the
//! per-call inputs (context data, external parameters, collectors) and the
//! scratch state of an update (the frames being selected, the processing
//! scope, the pending transition).
//!
//! Re-entrancy: start, stop and tick set the storage's update phase. A stop
//! requested while busy is deferred to the end of the current update; the
//! setters that would invalidate the running update return
//! [`ExecutionError::Reentrant`].

mod conditions;
mod data;
mod instance_data;
mod lifecycle;
mod nodes;
mod read_only;
mod selection;
mod transitions;


pub use read_only::ReadOnlyContext;

use std::collections::HashMap;

use statetree_core::{
    AssetId, InstanceStruct, RunStatus, SelectionFallback, StateHandle, StateTree,
    StateTreeEvent, TaskStatus, TransitionPriority, TreeLibrary, Value,
};

use crate::active_states::ActiveStateId;
use crate::config::ExecutionConfig;
use crate::delegates::{DelegateDispatcher, ListenerId};
use crate::error::ExecutionError;
use crate::events::{EventQueue, SelectionEvents, SharedEvent};
use crate::external_data::{ExternalDataCache, ExternalDataCollector};
use crate::frame::ExecutionFrame;
use crate::schedule::{ScheduledTick, ScheduledTickHandle};
use crate::state::{TransitionRequest, TransitionResult};
use crate::storage::InstanceStorage;
use crate::trace::{ExecutionTrace, NodeCall, TraceEvent};

// ──────────────────────────────────────────────
// Inputs
// ──────────────────────────────────────────────

/// Replaces the asset a `LinkedAsset` state runs, looked up by the state's
/// tag. `parameters` are applied over the linked tree's defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkedOverride {
    pub tree: AssetId,
    pub parameters: Option<InstanceStruct>,
}

impl LinkedOverride {
    pub fn new(tree: AssetId) -> Self {
        LinkedOverride {
            tree,
            parameters: None,
        }
    }

    pub fn with_parameters(mut self, parameters: InstanceStruct) -> Self {
        self.parameters = Some(parameters);
        self
    }
}

// ──────────────────────────────────────────────
// Processing scope
// ──────────────────────────────────────────────

/// Which frame list a frame index refers to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum FrameSet {
    #[default]
    Active,
    /// Frames under construction by an ongoing selection.
    Selection,
}

/// The frame, state and node currently being processed. Node callbacks
/// (`finish_task`, `bind_delegate`, transition requests) resolve their
/// owner through it.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Scope {
    pub set: FrameSet,
    pub frame: Option<usize>,
    pub state: StateHandle,
    pub node: Option<usize>,
}

#[derive(Debug, Clone, Default)]
struct Selection {
    frames: Vec<ExecutionFrame>,
    events: Vec<SelectionEvents>,
}

// ──────────────────────────────────────────────
// Execution context
// ──────────────────────────────────────────────

pub struct ExecutionContext<'a> {
    library: &'a TreeLibrary,
    root_tree: AssetId,
    storage: &'a mut InstanceStorage,
    config: ExecutionConfig,

    context_data: Vec<Option<InstanceStruct>>,
    external_parameters: HashMap<String, Value>,
    linked_overrides: HashMap<String, LinkedOverride>,
    collector: Option<Box<dyn ExternalDataCollector + 'a>>,
    external_data: ExternalDataCache,
    trace: Option<&'a mut dyn ExecutionTrace>,
    shared_queue: Option<&'a mut EventQueue>,

    selection: Selection,
    scope: Scope,
    /// Event of the transition being evaluated, readable through bindings.
    transition_event: Option<SharedEvent>,
    next_transition: TransitionResult,
    /// Set while transitions are triggered: requests made by tasks are
    /// evaluated immediately instead of queued.
    allow_direct_transitions: bool,
    /// Frame from which global tasks handle transitions this pass; set when
    /// a completed subtree hands its result to the parent frame.
    trigger_from_frame_index: Option<usize>,
    /// Delta time of the tick in progress; delayed transitions started
    /// during the tick count it as already elapsed.
    tick_delta_time: f32,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(library: &'a TreeLibrary, root_tree: AssetId, storage: &'a mut InstanceStorage) -> Self {
        let num_context_data = library
            .get(root_tree)
            .map_or(0, |tree| tree.context_data.len());
        ExecutionContext {
            library,
            root_tree,
            storage,
            config: ExecutionConfig::default(),
            context_data: vec![None; num_context_data],
            external_parameters: HashMap::new(),
            linked_overrides: HashMap::new(),
            collector: None,
            external_data: ExternalDataCache::default(),
            trace: None,
            shared_queue: None,
            selection: Selection::default(),
            scope: Scope::default(),
            transition_event: None,
            next_transition: TransitionResult::default(),
            allow_direct_transitions: false,
            trigger_from_frame_index: None,
            tick_delta_time: 0.0,
        }
    }

    pub fn with_config(mut self, config: ExecutionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_trace(mut self, trace: &'a mut dyn ExecutionTrace) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Uses an event queue owned by the caller instead of the storage's.
    /// The context does not clear a borrowed queue after transitions.
    pub fn with_event_queue(mut self, queue: &'a mut EventQueue) -> Self {
        self.shared_queue = Some(queue);
        self
    }

    pub fn with_external_data_collector(mut self, collector: impl ExternalDataCollector + 'a) -> Self {
        self.collector = Some(Box::new(collector));
        self
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn storage(&self) -> &InstanceStorage {
        self.storage
    }

    pub fn root_tree(&self) -> Option<&'a StateTree> {
        self.tree(self.root_tree)
    }

    // ── Inputs ──────────────────────────────

    pub fn set_context_data(&mut self, name: &str, data: InstanceStruct) -> Result<(), ExecutionError> {
        let index = self
            .root_tree()
            .and_then(|tree| tree.context_data.iter().position(|d| d.name == name))
            .ok_or_else(|| ExecutionError::UnknownContextData(name.to_owned()))?;
        self.context_data[index] = Some(data);
        Ok(())
    }

    pub fn set_external_global_parameter(&mut self, name: &str, value: impl Into<Value>) {
        self.external_parameters.insert(name.to_owned(), value.into());
    }

    /// Replaces the global parameters, applied over the tree's defaults.
    pub fn set_global_parameters(&mut self, parameters: InstanceStruct) -> Result<(), ExecutionError> {
        self.ensure_not_busy("set_global_parameters")?;
        self.storage.global_parameters = self.merged_parameters(Some(&parameters));
        Ok(())
    }

    pub fn set_linked_overrides(
        &mut self,
        overrides: impl IntoIterator<Item = (String, LinkedOverride)>,
    ) -> Result<(), ExecutionError> {
        self.ensure_not_busy("set_linked_overrides")?;
        self.linked_overrides = overrides.into_iter().collect();
        Ok(())
    }

    /// True when the root tree exists, has states, and every required
    /// context data item was provided with the fields it declares.
    pub fn is_valid(&self) -> bool {
        let Some(tree) = self.root_tree() else {
            return false;
        };
        if tree.states.is_empty() {
            return false;
        }
        tree.context_data
            .iter()
            .zip(&self.context_data)
            .all(|(desc, data)| match data {
                Some(data) => desc.fields.iter().all(|f| data.index_of(f).is_some()),
                None => !desc.required,
            })
    }

    // ── Queries ──────────────────────────────

    pub fn read_only(&self) -> ReadOnlyContext<'_> {
        ReadOnlyContext::new(self.library, self.root_tree, self.storage).with_event_queue(self.queue())
    }

    pub fn run_status(&self) -> RunStatus {
        self.storage.exec.tree_run_status
    }

    pub fn last_tick_status(&self) -> RunStatus {
        self.storage.exec.last_tick_status
    }

    pub fn active_frames(&self) -> &[ExecutionFrame] {
        &self.storage.exec.active_frames
    }

    /// Names of the active states, outermost frame first.
    pub fn active_state_names(&self) -> Vec<String> {
        self.read_only().active_state_names()
    }

    pub fn next_scheduled_tick(&self) -> ScheduledTick {
        self.read_only().next_scheduled_tick()
    }

    // ── Events and transitions ──────────────────────────────

    pub fn send_event(&mut self, event: StateTreeEvent) -> Result<(), ExecutionError> {
        if self.storage.exec.current_phase == crate::state::UpdatePhase::StopTree {
            return Err(ExecutionError::Reentrant {
                operation: "send_event",
                phase: self.storage.exec.current_phase,
            });
        }
        tracing::debug!(tag = %event.tag, "event sent");
        self.queue_mut().send(event)
    }

    /// Requests a transition from the state in the current processing scope,
    /// or from the root frame when called from outside an update. While
    /// transitions are being triggered the request is evaluated at once;
    /// otherwise it is queued for the next transition pass.
    pub fn request_transition(
        &mut self,
        target: StateHandle,
        priority: TransitionPriority,
        fallback: SelectionFallback,
    ) {
        if self.allow_direct_transitions {
            if let Some(frame_index) = self.scope.frame {
                let event = self.transition_event.clone();
                if self.request_transition_internal(frame_index, target, priority, event, fallback) {
                    self.allow_direct_transitions = false;
                }
            }
            return;
        }

        let (source_frame_id, source_state_id) = self.scope_ids();
        self.storage.transition_requests.push(TransitionRequest {
            source_frame_id,
            source_state_id,
            target,
            priority,
            fallback,
        });
    }

    /// Queues a transition to the root tree's state named `state`.
    pub fn request_transition_to(
        &mut self,
        state: &str,
        priority: TransitionPriority,
    ) -> Result<(), ExecutionError> {
        let target = self
            .root_tree()
            .and_then(|tree| tree.find_state(state))
            .ok_or_else(|| ExecutionError::UnknownState(state.to_owned()))?;
        self.request_transition(target, priority, SelectionFallback::None);
        Ok(())
    }

    // ── Task callbacks ──────────────────────────────

    /// Finishes the task being processed with `status`.
    pub fn finish_task(&mut self, status: TaskStatus) -> Result<(), ExecutionError> {
        let (Some(frame_index), Some(node_index)) = (self.scope.frame, self.scope.node) else {
            return Err(ExecutionError::NoProcessingScope("finish_task"));
        };
        if self.scope.set == FrameSet::Active {
            self.finish_task_at(frame_index, self.scope.state, node_index, status);
        }
        Ok(())
    }

    /// Binds the task being processed to the dispatcher named `dispatcher`
    /// of its tree.
    pub fn bind_delegate(&mut self, dispatcher: &str) -> Result<ListenerId, ExecutionError> {
        let (Some(_), Some(node_index)) = (self.scope.frame, self.scope.node) else {
            return Err(ExecutionError::NoProcessingScope("bind_delegate"));
        };
        let dispatcher = self.find_dispatcher(dispatcher)?;
        self.bind_listener(dispatcher, node_index)
            .ok_or(ExecutionError::NoProcessingScope("bind_delegate"))
    }

    pub fn unbind_delegate(&mut self, listener: ListenerId) -> Result<(), ExecutionError> {
        if self.storage.listeners.remove(listener) {
            Ok(())
        } else {
            Err(ExecutionError::UnknownListener(listener.0))
        }
    }

    /// Notifies every listener of `dispatcher` and marks it broadcast, so
    /// delegate transitions waiting on it fire in the next transition pass.
    pub fn broadcast_delegate(&mut self, dispatcher: &str) -> Result<(), ExecutionError> {
        let dispatcher = self.find_dispatcher(dispatcher)?;
        self.broadcast(dispatcher);
        Ok(())
    }

    // ── Scheduled ticks ──────────────────────────────

    pub fn add_scheduled_tick_request(&mut self, tick: ScheduledTick) -> ScheduledTickHandle {
        self.storage.scheduled_ticks.add(tick)
    }

    pub fn update_scheduled_tick_request(
        &mut self,
        handle: ScheduledTickHandle,
        tick: ScheduledTick,
    ) -> Result<(), ExecutionError> {
        if self.storage.scheduled_ticks.update(handle, tick) {
            Ok(())
        } else {
            Err(ExecutionError::UnknownTickRequest(handle.0))
        }
    }

    pub fn remove_scheduled_tick_request(&mut self, handle: ScheduledTickHandle) -> Result<(), ExecutionError> {
        if self.storage.scheduled_ticks.remove(handle) {
            Ok(())
        } else {
            Err(ExecutionError::UnknownTickRequest(handle.0))
        }
    }

    // ──────────────────────────────────────────────
    // Internal helpers
    // ──────────────────────────────────────────────

    fn tree(&self, id: AssetId) -> Option<&'a StateTree> {
        let library: &'a TreeLibrary = self.library;
        library.get(id)
    }

    fn ensure_not_busy(&self, operation: &'static str) -> Result<(), ExecutionError> {
        if self.storage.exec.is_busy() {
            return Err(ExecutionError::Reentrant {
                operation,
                phase: self.storage.exec.current_phase,
            });
        }
        Ok(())
    }

    /// The root tree's default parameters with `overrides` applied.
    fn merged_parameters(&self, overrides: Option<&InstanceStruct>) -> InstanceStruct {
        let mut parameters = self
            .root_tree()
            .map(|tree| tree.default_parameters.clone())
            .unwrap_or_default();
        if let Some(overrides) = overrides {
            parameters.apply_overrides(overrides);
        }
        parameters
    }

    pub(crate) fn frames(&self, set: FrameSet) -> &[ExecutionFrame] {
        match set {
            FrameSet::Active => &self.storage.exec.active_frames,
            FrameSet::Selection => &self.selection.frames,
        }
    }

    pub(crate) fn frame_tree(&self, set: FrameSet, frame_index: usize) -> Option<&'a StateTree> {
        let id = self.frames(set).get(frame_index)?.tree;
        self.tree(id)
    }

    /// Runs `f` with `scope` as the processing scope, restoring the previous
    /// scope afterwards.
    pub(crate) fn with_scope<R>(&mut self, scope: Scope, f: impl FnOnce(&mut Self) -> R) -> R {
        let saved = std::mem::replace(&mut self.scope, scope);
        let result = f(self);
        self.scope = saved;
        result
    }

    fn scope_ids(&self) -> (crate::frame::FrameId, ActiveStateId) {
        let Some(frame) = self.scope.frame.and_then(|i| self.frames(self.scope.set).get(i)) else {
            return (crate::frame::FrameId::INVALID, ActiveStateId::INVALID);
        };
        let state_id = frame
            .active_states
            .index_of(self.scope.state)
            .map_or(ActiveStateId::INVALID, |i| frame.active_states.id(i));
        (frame.frame_id, state_id)
    }

    pub(crate) fn queue(&self) -> &EventQueue {
        match &self.shared_queue {
            Some(queue) => queue,
            None => &self.storage.events,
        }
    }

    pub(crate) fn queue_mut(&mut self) -> &mut EventQueue {
        match &mut self.shared_queue {
            Some(queue) => queue,
            None => &mut self.storage.events,
        }
    }

    pub(crate) fn owns_event_queue(&self) -> bool {
        self.shared_queue.is_none()
    }

    pub(crate) fn record(&mut self, event: TraceEvent) {
        if let Some(trace) = self.trace.as_deref_mut() {
            trace.record(event);
        }
    }

    pub(crate) fn record_node(&mut self, tree: AssetId, node: &str, call: NodeCall, status: Option<RunStatus>) {
        if self.trace.is_some() {
            self.record(TraceEvent::Node {
                tree,
                node: node.to_owned(),
                call,
                status,
            });
        }
    }

    // ── Delegates ──────────────────────────────

    fn find_dispatcher(&self, name: &str) -> Result<DelegateDispatcher, ExecutionError> {
        let tree_id = self
            .scope
            .frame
            .and_then(|i| self.frames(self.scope.set).get(i))
            .map_or(self.root_tree, |frame| frame.tree);
        self.tree(tree_id)
            .and_then(|tree| tree.delegate_names.iter().position(|n| n == name))
            .map(|id| DelegateDispatcher {
                tree: tree_id,
                id: id as u16,
            })
            .ok_or_else(|| ExecutionError::UnknownDispatcher(name.to_owned()))
    }

    /// Binds the node `node_index` of the scoped state to `dispatcher`.
    fn bind_listener(&mut self, dispatcher: DelegateDispatcher, node_index: usize) -> Option<ListenerId> {
        let (frame_id, state_id) = self.scope_ids();
        if !frame_id.is_valid() {
            return None;
        }
        Some(
            self.storage
                .listeners
                .add(dispatcher, frame_id, state_id, node_index as u16),
        )
    }

    fn broadcast(&mut self, dispatcher: DelegateDispatcher) {
        tracing::debug!(tree = %dispatcher.tree, dispatcher = dispatcher.id, "delegate broadcast");
        for listener in self.storage.listeners.bound_to(dispatcher) {
            self.notify_listener(listener);
        }
        if !self.storage.broadcasted.contains(&dispatcher) {
            self.storage.broadcasted.push(dispatcher);
        }
    }

    /// Marks a task finished from outside its own call. Completion is picked
    /// up by the next tick or transition pass.
    pub(crate) fn finish_task_at(
        &mut self,
        frame_index: usize,
        state: StateHandle,
        node_index: usize,
        status: TaskStatus,
    ) {
        let Some(tree) = self.frame_tree(FrameSet::Active, frame_index) else {
            return;
        };
        let Some(frame) = self.storage.exec.active_frames.get_mut(frame_index) else {
            return;
        };
        let finished = if state.is_valid() {
            let Some(compact) = tree.state(state) else {
                return;
            };
            let Some(state_index) = frame.active_states.index_of(state) else {
                return;
            };
            let slot = node_index.wrapping_sub(compact.tasks.begin as usize);
            frame
                .tasks_status
                .state_mut(state_index)
                .map(|group| group.set_status_with_priority(slot, status))
        } else {
            let slot = node_index.wrapping_sub(tree.global_tasks.begin as usize);
            Some(frame.tasks_status.global.set_status_with_priority(slot, status))
        };
        if finished.is_some_and(|s| s != TaskStatus::Running) {
            self.storage.exec.has_pending_completed_state = true;
        }
    }
}
