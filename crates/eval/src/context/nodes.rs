//! Built-in node behaviors and the calls that run them against instance data.
//!
//! Behaviors are plain functions over a node's instance struct. Anything a
//! node does to its context (sending events, requesting transitions,
//! stopping the tree, delegates) is returned as a [`NodeEffect`] and applied
//! by the context once the instance data has been written back.

use statetree_core::node::{
    CompareOp, ConditionKind, ConsiderationKind, EvaluatorKind, FunctionKind, TaskKind,
    TaskTrigger,
};
use statetree_core::{
    InstanceStruct, NodeKind, NodeRange, RunStatus, SelectionFallback, StateHandle,
    StateTreeEvent, TransitionPriority, Value,
};

use super::{ExecutionContext, FrameSet, Scope};
use crate::delegates::{DelegateDispatcher, DelegateListener};
use crate::frame::find_frame_index;
use crate::trace::NodeCall;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum NodeEffect {
    SendEvent(StateTreeEvent),
    RequestTransition {
        target: StateHandle,
        priority: TransitionPriority,
        fallback: SelectionFallback,
    },
    Stop(RunStatus),
    Broadcast(u16),
    Listen(u16),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum TaskCall {
    Enter,
    Tick(f32),
    Exit,
    StateCompleted,
    TriggerTransitions,
}

impl TaskCall {
    fn trace_call(self) -> NodeCall {
        match self {
            TaskCall::Enter => NodeCall::EnterState,
            TaskCall::Tick(_) => NodeCall::Tick,
            TaskCall::Exit => NodeCall::ExitState,
            TaskCall::StateCompleted => NodeCall::StateCompleted,
            TaskCall::TriggerTransitions => NodeCall::TriggerTransitions,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum EvaluatorCall {
    TreeStart,
    Tick(f32),
    TreeStop,
}

// ──────────────────────────────────────────────
// Behaviors
// ──────────────────────────────────────────────

fn increment(data: &mut InstanceStruct, field: &str) -> i64 {
    let value = data.i64_named(field).unwrap_or(0) + 1;
    data.set_named(field, Value::Int(value));
    value
}

/// One-shot actions shared by enter and tick.
fn fire(name: &str, kind: &TaskKind, data: &mut InstanceStruct, effects: &mut Vec<NodeEffect>) {
    match kind {
        TaskKind::SendEvent { tag, payload, .. } => {
            let mut event = StateTreeEvent::new(tag.as_str()).with_origin(name);
            event.payload = payload.clone();
            effects.push(NodeEffect::SendEvent(event));
            increment(data, "sent");
        }
        TaskKind::StopTree { status, .. } => effects.push(NodeEffect::Stop(*status)),
        TaskKind::BroadcastDelegate { dispatcher, .. } => {
            effects.push(NodeEffect::Broadcast(*dispatcher))
        }
        _ => {}
    }
}

fn trigger_of(kind: &TaskKind) -> Option<TaskTrigger> {
    match kind {
        TaskKind::SendEvent { on, .. }
        | TaskKind::StopTree { on, .. }
        | TaskKind::BroadcastDelegate { on, .. } => Some(*on),
        _ => None,
    }
}

pub(crate) fn enter_task(
    name: &str,
    kind: &TaskKind,
    data: &mut InstanceStruct,
    effects: &mut Vec<NodeEffect>,
) -> RunStatus {
    if trigger_of(kind) == Some(TaskTrigger::Enter) {
        fire(name, kind, data, effects);
    }
    match kind {
        TaskKind::Run { enter_status, .. } => {
            data.set_named("ticks", Value::Int(0));
            *enter_status
        }
        TaskKind::Delay { .. } => {
            data.set_named("elapsed", Value::Float(0.0));
            RunStatus::Running
        }
        TaskKind::ListenDelegate { dispatcher, .. } => {
            effects.push(NodeEffect::Listen(*dispatcher));
            RunStatus::Running
        }
        _ => RunStatus::Running,
    }
}

pub(crate) fn tick_task(
    name: &str,
    kind: &TaskKind,
    data: &mut InstanceStruct,
    delta_time: f32,
    effects: &mut Vec<NodeEffect>,
) -> RunStatus {
    if trigger_of(kind) == Some(TaskTrigger::Tick) {
        fire(name, kind, data, effects);
    }
    match kind {
        TaskKind::Run {
            ticks, complete_with, ..
        } => {
            let count = increment(data, "ticks");
            match ticks {
                Some(limit) if count >= i64::from(*limit) => RunStatus::from(*complete_with),
                _ => RunStatus::Running,
            }
        }
        TaskKind::Delay { duration } => {
            let elapsed = data.f64_named("elapsed").unwrap_or(0.0) + f64::from(delta_time);
            data.set_named("elapsed", Value::Float(elapsed));
            let duration = data.f64_named("duration").unwrap_or(f64::from(*duration));
            if elapsed >= duration {
                RunStatus::Succeeded
            } else {
                RunStatus::Running
            }
        }
        _ => RunStatus::Running,
    }
}

pub(crate) fn trigger_task_transitions(kind: &TaskKind, data: &InstanceStruct, effects: &mut Vec<NodeEffect>) {
    if let TaskKind::RequestTransition {
        target,
        priority,
        fallback,
    } = kind
    {
        if data.bool_named("active") {
            effects.push(NodeEffect::RequestTransition {
                target: *target,
                priority: *priority,
                fallback: *fallback,
            });
        }
    }
}

pub(crate) fn run_evaluator(kind: &EvaluatorKind, data: &mut InstanceStruct, call: EvaluatorCall) {
    match (kind, call) {
        (EvaluatorKind::Counter { step }, EvaluatorCall::Tick(_)) => {
            let step = data.i64_named("step").unwrap_or(*step);
            let value = data.i64_named("value").unwrap_or(0) + step;
            data.set_named("value", Value::Int(value));
        }
        (EvaluatorKind::Clock, EvaluatorCall::TreeStart) => {
            data.set_named("elapsed", Value::Float(0.0));
        }
        (EvaluatorKind::Clock, EvaluatorCall::Tick(delta_time)) => {
            let elapsed = data.f64_named("elapsed").unwrap_or(0.0) + f64::from(delta_time);
            data.set_named("elapsed", Value::Float(elapsed));
        }
        _ => {}
    }
}

pub(crate) fn test_condition(kind: &ConditionKind, data: &InstanceStruct) -> bool {
    match kind {
        ConditionKind::Compare { op } => {
            let (Some(left), Some(right)) = (data.get_named("left"), data.get_named("right")) else {
                return false;
            };
            let Some(ordering) = left.compare(right) else {
                return *op == CompareOp::NotEqual;
            };
            match op {
                CompareOp::Equal => ordering.is_eq(),
                CompareOp::NotEqual => ordering.is_ne(),
                CompareOp::Less => ordering.is_lt(),
                CompareOp::LessOrEqual => ordering.is_le(),
                CompareOp::Greater => ordering.is_gt(),
                CompareOp::GreaterOrEqual => ordering.is_ge(),
            }
        }
        ConditionKind::IsTrue => data.bool_named("value"),
        ConditionKind::ObjectValid => data.bool_named("object"),
        ConditionKind::Always { result } => *result,
    }
}

pub(crate) fn score(kind: &ConsiderationKind, data: &InstanceStruct) -> f32 {
    match kind {
        ConsiderationKind::Constant { value } => {
            data.f64_named("value").map_or(*value, |v| v as f32)
        }
        ConsiderationKind::Normalize { min, max } => {
            let input = data.f64_named("input").unwrap_or(0.0) as f32;
            if max <= min {
                return if input >= *max { 1.0 } else { 0.0 };
            }
            ((input - min) / (max - min)).clamp(0.0, 1.0)
        }
    }
}

pub(crate) fn compute_function(kind: &FunctionKind, data: &mut InstanceStruct) {
    match kind {
        FunctionKind::Scale { factor } => {
            let input = data.get(0).and_then(Value::as_f64).unwrap_or(0.0);
            data.set(1, Value::Float(input * factor));
        }
        FunctionKind::Not => {
            let input = data.get(0).is_some_and(Value::is_truthy);
            data.set(1, Value::Bool(!input));
        }
    }
}

// ──────────────────────────────────────────────
// Node calls
// ──────────────────────────────────────────────

impl<'a> ExecutionContext<'a> {
    /// Calls `call` on the task `node_index` owned by `state` (invalid for
    /// global tasks). Returns the task's status for enter and tick calls.
    pub(crate) fn call_task(
        &mut self,
        set: FrameSet,
        frame_index: usize,
        state: StateHandle,
        node_index: usize,
        call: TaskCall,
    ) -> RunStatus {
        let Some(tree) = self.frame_tree(set, frame_index) else {
            return RunStatus::Failed;
        };
        let Some(tree_id) = self.frames(set).get(frame_index).map(|f| f.tree) else {
            return RunStatus::Failed;
        };
        let Some(node) = tree.node(node_index) else {
            return RunStatus::Failed;
        };
        let Some(task) = node.kind.as_task() else {
            return RunStatus::Failed;
        };
        let Some(target) = self.resolve(set, frame_index, node.instance) else {
            tracing::warn!(tree = %tree.name, task = %node.name, "task instance data unavailable");
            return RunStatus::Failed;
        };
        let Some(mut data) = self.instance(&target).cloned() else {
            return RunStatus::Failed;
        };

        let mut effects = Vec::new();
        let status = match call {
            TaskCall::Enter => enter_task(&node.name, &task.kind, &mut data, &mut effects),
            TaskCall::Tick(delta_time) => {
                tick_task(&node.name, &task.kind, &mut data, delta_time, &mut effects)
            }
            TaskCall::TriggerTransitions => {
                trigger_task_transitions(&task.kind, &data, &mut effects);
                RunStatus::Running
            }
            TaskCall::Exit | TaskCall::StateCompleted => RunStatus::Running,
        };
        if let Some(slot) = self.instance_mut(&target) {
            *slot = data;
        }

        let traced = matches!(call, TaskCall::Enter | TaskCall::Tick(_)).then_some(status);
        self.record_node(tree_id, &node.name, call.trace_call(), traced);

        if !effects.is_empty() {
            let scope = Scope {
                set,
                frame: Some(frame_index),
                state,
                node: Some(node_index),
            };
            self.with_scope(scope, |ctx| ctx.apply_effects(tree_id, node_index, effects));
        }
        status
    }

    pub(crate) fn call_evaluator(
        &mut self,
        set: FrameSet,
        frame_index: usize,
        node_index: usize,
        call: EvaluatorCall,
    ) {
        let Some(tree) = self.frame_tree(set, frame_index) else {
            return;
        };
        let Some(tree_id) = self.frames(set).get(frame_index).map(|f| f.tree) else {
            return;
        };
        let Some(node) = tree.node(node_index) else {
            return;
        };
        let NodeKind::Evaluator(kind) = &node.kind else {
            return;
        };
        let Some(target) = self.resolve(set, frame_index, node.instance) else {
            return;
        };
        if let Some(data) = self.instance_mut(&target) {
            run_evaluator(kind, data, call);
        }
        let trace = match call {
            EvaluatorCall::TreeStart => NodeCall::TreeStart,
            EvaluatorCall::Tick(_) => NodeCall::Tick,
            EvaluatorCall::TreeStop => NodeCall::TreeStop,
        };
        self.record_node(tree_id, &node.name, trace, None);
    }

    /// Notifies the enter conditions of a state that subscribed to state
    /// changes. Built-in conditions keep no state, so this only traces.
    pub(crate) fn call_condition_hooks(
        &mut self,
        set: FrameSet,
        frame_index: usize,
        conditions: NodeRange,
        call: NodeCall,
    ) {
        let Some(tree) = self.frame_tree(set, frame_index) else {
            return;
        };
        let Some(tree_id) = self.frames(set).get(frame_index).map(|f| f.tree) else {
            return;
        };
        for node in &tree.nodes[conditions.range()] {
            if node.kind.as_condition().is_some_and(|c| c.state_change_events) {
                self.record_node(tree_id, &node.name, call, None);
            }
        }
    }

    fn apply_effects(&mut self, tree: statetree_core::AssetId, node_index: usize, effects: Vec<NodeEffect>) {
        for effect in effects {
            match effect {
                NodeEffect::SendEvent(event) => {
                    if let Err(err) = self.send_event(event) {
                        tracing::warn!(error = %err, "task could not send event");
                    }
                }
                NodeEffect::RequestTransition {
                    target,
                    priority,
                    fallback,
                } => self.request_transition(target, priority, fallback),
                NodeEffect::Stop(status) => {
                    self.stop(status);
                }
                NodeEffect::Broadcast(id) => self.broadcast(DelegateDispatcher { tree, id }),
                NodeEffect::Listen(id) => {
                    if self.scope.set == FrameSet::Active {
                        self.bind_listener(DelegateDispatcher { tree, id }, node_index);
                    }
                }
            }
        }
    }

    /// Delivers a broadcast to a listening task: the task counts the call
    /// and finishes with its configured status.
    pub(crate) fn notify_listener(&mut self, listener: DelegateListener) {
        let Some(frame_index) = find_frame_index(&self.storage.exec.active_frames, listener.frame_id) else {
            return;
        };
        let Some(tree) = self.frame_tree(FrameSet::Active, frame_index) else {
            return;
        };
        let frame = &self.storage.exec.active_frames[frame_index];
        let state = if listener.state_id.is_valid() {
            match frame.active_states.index_of_reverse(listener.state_id) {
                Some(index) => frame.active_states.get(index),
                None => return,
            }
        } else {
            StateHandle::INVALID
        };
        let node_index = listener.node_index as usize;
        let Some(node) = tree.node(node_index) else {
            return;
        };
        let Some(TaskKind::ListenDelegate { finish_with, .. }) = node.kind.as_task().map(|t| &t.kind) else {
            return;
        };
        if let Some(target) = self.resolve(FrameSet::Active, frame_index, node.instance) {
            if let Some(data) = self.instance_mut(&target) {
                increment(data, "heard");
            }
        }
        self.record_node(listener.dispatcher.tree, &node.name, NodeCall::Tick, None);
        self.finish_task_at(frame_index, state, node_index, *finish_with);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use statetree_core::TaskStatus;

    #[test]
    fn run_task_completes_after_tick_count() {
        let kind = TaskKind::Run {
            enter_status: RunStatus::Running,
            ticks: Some(2),
            complete_with: TaskStatus::Failed,
        };
        let mut data = kind.default_fields();
        let mut effects = Vec::new();
        assert_eq!(enter_task("t", &kind, &mut data, &mut effects), RunStatus::Running);
        assert_eq!(tick_task("t", &kind, &mut data, 0.1, &mut effects), RunStatus::Running);
        assert_eq!(tick_task("t", &kind, &mut data, 0.1, &mut effects), RunStatus::Failed);
        assert!(effects.is_empty());
    }

    #[test]
    fn delay_reads_bound_duration() {
        let kind = TaskKind::Delay { duration: 10.0 };
        let mut data = kind.default_fields();
        data.set_named("duration", Value::Float(0.5));
        let mut effects = Vec::new();
        enter_task("wait", &kind, &mut data, &mut effects);
        assert_eq!(tick_task("wait", &kind, &mut data, 0.25, &mut effects), RunStatus::Running);
        assert_eq!(tick_task("wait", &kind, &mut data, 0.25, &mut effects), RunStatus::Succeeded);
    }

    #[test]
    fn send_event_fires_on_its_trigger() {
        let kind = TaskKind::SendEvent {
            tag: "ping".into(),
            payload: Some(Value::Int(3)),
            on: TaskTrigger::Tick,
        };
        let mut data = kind.default_fields();
        let mut effects = Vec::new();
        enter_task("pinger", &kind, &mut data, &mut effects);
        assert!(effects.is_empty());
        tick_task("pinger", &kind, &mut data, 0.1, &mut effects);
        let expected = StateTreeEvent::new("ping")
            .with_payload(Value::Int(3))
            .with_origin("pinger");
        assert_eq!(effects, vec![NodeEffect::SendEvent(expected)]);
        assert_eq!(data.i64_named("sent"), Some(1));
    }

    #[test]
    fn request_transition_honors_active_flag() {
        let kind = TaskKind::RequestTransition {
            target: StateHandle::new(3),
            priority: TransitionPriority::High,
            fallback: SelectionFallback::None,
        };
        let mut data = kind.default_fields();
        let mut effects = Vec::new();
        trigger_task_transitions(&kind, &data, &mut effects);
        assert_eq!(effects.len(), 1);
        data.set_named("active", Value::Bool(false));
        trigger_task_transitions(&kind, &data, &mut effects);
        assert_eq!(effects.len(), 1);
    }

    #[test]
    fn evaluators_accumulate() {
        let mut counter = NodeKind::Evaluator(EvaluatorKind::Counter { step: 2 }).default_fields();
        run_evaluator(&EvaluatorKind::Counter { step: 2 }, &mut counter, EvaluatorCall::Tick(0.1));
        run_evaluator(&EvaluatorKind::Counter { step: 2 }, &mut counter, EvaluatorCall::Tick(0.1));
        assert_eq!(counter.i64_named("value"), Some(4));

        let mut clock = NodeKind::Evaluator(EvaluatorKind::Clock).default_fields();
        run_evaluator(&EvaluatorKind::Clock, &mut clock, EvaluatorCall::Tick(0.5));
        assert_eq!(clock.f64_named("elapsed"), Some(0.5));
    }

    #[test]
    fn compare_conditions() {
        let data = InstanceStruct::new().with("left", 3i64).with("right", 2.5);
        assert!(test_condition(&ConditionKind::Compare { op: CompareOp::Greater }, &data));
        assert!(!test_condition(&ConditionKind::Compare { op: CompareOp::Equal }, &data));
        let text = InstanceStruct::new().with("left", "a").with("right", 1i64);
        assert!(test_condition(&ConditionKind::Compare { op: CompareOp::NotEqual }, &text));
    }

    #[test]
    fn normalize_clamps_and_handles_empty_range() {
        let kind = ConsiderationKind::Normalize { min: 0.0, max: 10.0 };
        let data = InstanceStruct::new().with("input", 5.0);
        assert!((score(&kind, &data) - 0.5).abs() < 1e-6);
        let data = InstanceStruct::new().with("input", 20.0);
        assert_eq!(score(&kind, &data), 1.0);

        let flat = ConsiderationKind::Normalize { min: 4.0, max: 4.0 };
        assert_eq!(score(&flat, &InstanceStruct::new().with("input", 4.0)), 1.0);
        assert_eq!(score(&flat, &InstanceStruct::new().with("input", 3.0)), 0.0);
    }

    #[test]
    fn functions_write_output() {
        let mut data = NodeKind::Function(FunctionKind::Scale { factor: 2.0 }).default_fields();
        data.set(0, Value::Int(4));
        compute_function(&FunctionKind::Scale { factor: 2.0 }, &mut data);
        assert_eq!(data.get(1), Some(&Value::Float(8.0)));

        let mut data = NodeKind::Function(FunctionKind::Not).default_fields();
        data.set(0, Value::Bool(true));
        compute_function(&FunctionKind::Not, &mut data);
        assert_eq!(data.get(1), Some(&Value::Bool(false)));
    }
}
