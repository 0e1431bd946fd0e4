//! Compiled node catalogue.
//!
//! The node set is closed: every evaluator, task, condition, consideration
//! and property function is one variant of [`NodeKind`], and the runtime
//! dispatches over the variant tag.

use serde::{Deserialize, Serialize};

use crate::handle::{DataHandle, StateHandle};
use crate::status::{RunStatus, SelectionFallback, TaskStatus, TransitionPriority};
use crate::value::{InstanceStruct, Value};

/// Deepest parenthesis nesting allowed in a condition or consideration expression.
pub const MAX_EXPRESSION_INDENT: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactNode {
    pub name: String,
    pub kind: NodeKind,
    /// Where the node's instance struct lives at runtime.
    pub instance: DataHandle,
    /// Instance struct copied into the instance slot when the node is activated.
    pub template: InstanceStruct,
    /// Property-copy batch run before the node is called.
    pub bindings: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    Evaluator(EvaluatorKind),
    Task(TaskNode),
    Condition(ConditionNode),
    Consideration(ConsiderationNode),
    Function(FunctionKind),
}

impl NodeKind {
    pub fn as_task(&self) -> Option<&TaskNode> {
        match self {
            NodeKind::Task(task) => Some(task),
            _ => None,
        }
    }

    pub fn as_condition(&self) -> Option<&ConditionNode> {
        match self {
            NodeKind::Condition(condition) => Some(condition),
            _ => None,
        }
    }

    pub fn as_consideration(&self) -> Option<&ConsiderationNode> {
        match self {
            NodeKind::Consideration(consideration) => Some(consideration),
            _ => None,
        }
    }

    /// Fields every instance of this kind carries, with their defaults.
    /// Authored field values override these.
    pub fn default_fields(&self) -> InstanceStruct {
        match self {
            NodeKind::Evaluator(EvaluatorKind::Counter { step }) => InstanceStruct::new()
                .with("value", 0i64)
                .with("step", *step),
            NodeKind::Evaluator(EvaluatorKind::Clock) => {
                InstanceStruct::new().with("elapsed", 0.0f64)
            }
            NodeKind::Evaluator(EvaluatorKind::Constant) => InstanceStruct::new(),
            NodeKind::Task(task) => task.kind.default_fields(),
            NodeKind::Condition(condition) => condition.kind.default_fields(),
            NodeKind::Consideration(consideration) => match consideration.kind {
                ConsiderationKind::Constant { value } => {
                    InstanceStruct::new().with("value", value as f64)
                }
                ConsiderationKind::Normalize { .. } => {
                    InstanceStruct::new().with("input", 0.0f64)
                }
            },
            NodeKind::Function(FunctionKind::Scale { .. }) => InstanceStruct::new()
                .with("input", 0.0f64)
                .with("output", 0.0f64),
            NodeKind::Function(FunctionKind::Not) => InstanceStruct::new()
                .with("input", false)
                .with("output", true),
        }
    }
}

// ──────────────────────────────────────────────
// Evaluators
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EvaluatorKind {
    /// Adds `step` to `value` every tick.
    Counter { step: i64 },
    /// Accumulates delta time into `elapsed`.
    Clock,
    /// Exposes its authored fields to bindings unchanged.
    Constant,
}

// ──────────────────────────────────────────────
// Tasks
// ──────────────────────────────────────────────

/// When a one-shot task action fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TaskTrigger {
    #[default]
    Enter,
    Tick,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskKind {
    /// Returns `enter_status` from EnterState; while running, finishes with
    /// `complete_with` after `ticks` ticks (never, when `ticks` is `None`).
    Run {
        enter_status: RunStatus,
        ticks: Option<u32>,
        complete_with: TaskStatus,
    },
    /// Succeeds once `duration` seconds of tick time have elapsed.
    Delay { duration: f32 },
    /// Sends an event to the owning context.
    SendEvent {
        tag: String,
        payload: Option<Value>,
        on: TaskTrigger,
    },
    /// Requests a transition from TriggerTransitions while its `active` field is set.
    RequestTransition {
        target: StateHandle,
        priority: TransitionPriority,
        fallback: SelectionFallback,
    },
    /// Calls Stop on the owning context from inside a node call.
    StopTree { status: RunStatus, on: TaskTrigger },
    /// Broadcasts a delegate dispatcher.
    BroadcastDelegate { dispatcher: u16, on: TaskTrigger },
    /// Binds a listener on enter and finishes with `finish_with` when the
    /// dispatcher is broadcast.
    ListenDelegate {
        dispatcher: u16,
        finish_with: TaskStatus,
    },
}

impl TaskKind {
    pub fn default_fields(&self) -> InstanceStruct {
        match self {
            TaskKind::Run { .. } => InstanceStruct::new().with("ticks", 0i64),
            TaskKind::Delay { duration } => InstanceStruct::new()
                .with("duration", *duration as f64)
                .with("elapsed", 0.0f64),
            TaskKind::SendEvent { .. } => InstanceStruct::new().with("sent", 0i64),
            TaskKind::RequestTransition { .. } => InstanceStruct::new().with("active", true),
            TaskKind::StopTree { .. } | TaskKind::BroadcastDelegate { .. } => {
                InstanceStruct::new()
            }
            TaskKind::ListenDelegate { .. } => InstanceStruct::new().with("heard", 0i64),
        }
    }
}

/// Per-task behavior flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskFlags {
    pub enabled: bool,
    pub should_call_tick: bool,
    pub tick_only_on_events: bool,
    pub copy_bound_properties_on_tick: bool,
    pub copy_bound_properties_on_exit: bool,
    /// Call EnterState/ExitState again when the owning state is reselected.
    pub state_change_on_reselect: bool,
    pub affects_transitions: bool,
    pub transition_handling_priority: TransitionPriority,
    pub considered_for_completion: bool,
}

impl Default for TaskFlags {
    fn default() -> Self {
        TaskFlags {
            enabled: true,
            should_call_tick: true,
            tick_only_on_events: false,
            copy_bound_properties_on_tick: true,
            copy_bound_properties_on_exit: true,
            state_change_on_reselect: true,
            affects_transitions: false,
            transition_handling_priority: TransitionPriority::Normal,
            considered_for_completion: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    pub kind: TaskKind,
    pub flags: TaskFlags,
}

impl TaskNode {
    /// Whether the task wants a Tick call given the pending event state.
    pub fn wants_tick(&self, has_events: bool) -> bool {
        self.flags.should_call_tick || (self.flags.tick_only_on_events && has_events)
    }
}

// ──────────────────────────────────────────────
// Conditions and considerations
// ──────────────────────────────────────────────

/// How an expression item merges into its enclosing level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExpressionOperand {
    /// Start a new level value; used for the first item of an expression.
    Copy,
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConditionEvaluationMode {
    #[default]
    Evaluated,
    ForcedTrue,
    ForcedFalse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConditionKind {
    /// Compares the `left` and `right` fields.
    Compare { op: CompareOp },
    /// True when the `value` field is truthy.
    IsTrue,
    /// True when the `object` field holds a reference.
    ObjectValid,
    Always { result: bool },
}

impl ConditionKind {
    pub fn default_fields(&self) -> InstanceStruct {
        match self {
            ConditionKind::Compare { .. } => InstanceStruct::new()
                .with("left", 0i64)
                .with("right", 0i64),
            ConditionKind::IsTrue => InstanceStruct::new().with("value", false),
            ConditionKind::ObjectValid => {
                InstanceStruct::new().with("object", Value::NULL_OBJECT)
            }
            ConditionKind::Always { .. } => InstanceStruct::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionNode {
    pub kind: ConditionKind,
    pub operand: ExpressionOperand,
    /// Change in nesting after this item: positive opens, negative closes.
    pub delta_indent: i8,
    pub evaluation_mode: ConditionEvaluationMode,
    pub invert: bool,
    /// Receives EnterState/ExitState/StateCompleted notifications as an enter condition.
    pub state_change_events: bool,
    pub state_change_on_reselect: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ConsiderationKind {
    Constant { value: f32 },
    /// Maps the `input` field from `[min, max]` into `[0, 1]`, clamped.
    Normalize { min: f32, max: f32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsiderationNode {
    pub kind: ConsiderationKind,
    pub operand: ExpressionOperand,
    pub delta_indent: i8,
}

// ──────────────────────────────────────────────
// Property functions
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FunctionKind {
    /// `output = input * factor`.
    Scale { factor: f64 },
    /// `output = !input`.
    Not,
}
