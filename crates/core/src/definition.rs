//! Authoring definitions.
//!
//! A [`LibraryDefinition`] is the serde-facing description of one or more
//! state trees. [`crate::TreeLibrary::compile`] lowers it into compiled,
//! index-addressed trees.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::event::EventDesc;
use crate::node::{
    ConditionEvaluationMode, ConditionKind, ConsiderationKind, EvaluatorKind, ExpressionOperand,
    FunctionKind, TaskFlags, TaskTrigger,
};
use crate::status::{RunStatus, TaskStatus, TransitionPriority};
use crate::tree::{DataDesc, SelectionBehavior, StateType, TaskCompletion, TransitionDelay};
use crate::value::{InstanceStruct, Value};

/// Named field values. Fields are laid out in name order.
pub type FieldValues = BTreeMap<String, Value>;

pub(crate) fn to_instance(fields: &FieldValues) -> InstanceStruct {
    let mut out = InstanceStruct::new();
    for (name, value) in fields {
        out.set_named(name, value.clone());
    }
    out
}

fn default_true() -> bool {
    true
}

fn default_weight() -> f32 {
    1.0
}

fn default_schema() -> String {
    "default".to_owned()
}

fn default_priority() -> TransitionPriority {
    TransitionPriority::Normal
}

// ──────────────────────────────────────────────
// Library and trees
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LibraryDefinition {
    pub trees: Vec<TreeDefinition>,
}

impl LibraryDefinition {
    pub fn from_json_str(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn single(tree: TreeDefinition) -> Self {
        LibraryDefinition { trees: vec![tree] }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeDefinition {
    pub name: String,
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default)]
    pub parameters: FieldValues,
    #[serde(default)]
    pub context_data: Vec<DataDesc>,
    #[serde(default)]
    pub external_data: Vec<DataDesc>,
    #[serde(default)]
    pub evaluators: Vec<EvaluatorDefinition>,
    #[serde(default)]
    pub global_tasks: Vec<TaskDefinition>,
    #[serde(default)]
    pub global_task_completion: TaskCompletion,
    #[serde(default = "default_true")]
    pub scheduled_tick_allowed: bool,
    pub root: StateDefinition,
    /// Parentless subtree roots that `Linked` states can enter.
    #[serde(default)]
    pub subtrees: Vec<StateDefinition>,
}

impl TreeDefinition {
    pub fn new(name: &str, root: StateDefinition) -> Self {
        TreeDefinition {
            name: name.to_owned(),
            schema: default_schema(),
            parameters: FieldValues::new(),
            context_data: Vec::new(),
            external_data: Vec::new(),
            evaluators: Vec::new(),
            global_tasks: Vec::new(),
            global_task_completion: TaskCompletion::All,
            scheduled_tick_allowed: true,
            root,
            subtrees: Vec::new(),
        }
    }

    pub fn subtree(mut self, state: StateDefinition) -> Self {
        self.subtrees.push(state.kind(StateType::Subtree));
        self
    }

    pub fn evaluator(mut self, evaluator: EvaluatorDefinition) -> Self {
        self.evaluators.push(evaluator);
        self
    }

    pub fn global_task(mut self, task: TaskDefinition) -> Self {
        self.global_tasks.push(task);
        self
    }

    pub fn parameter(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.to_owned(), value.into());
        self
    }

    pub fn context(mut self, desc: DataDesc) -> Self {
        self.context_data.push(desc);
        self
    }

    pub fn external(mut self, desc: DataDesc) -> Self {
        self.external_data.push(desc);
        self
    }

    pub fn schema(mut self, schema: &str) -> Self {
        self.schema = schema.to_owned();
        self
    }
}

// ──────────────────────────────────────────────
// States
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDefinition {
    pub name: String,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub kind: StateType,
    #[serde(default)]
    pub selection: SelectionBehavior,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub linked_subtree: Option<String>,
    #[serde(default)]
    pub linked_asset: Option<String>,
    #[serde(default)]
    pub parameters: FieldValues,
    #[serde(default)]
    pub parameter_bindings: Vec<BindingDefinition>,
    #[serde(default)]
    pub required_event: Option<EventDesc>,
    #[serde(default = "default_true")]
    pub check_prerequisites_when_activating_child_directly: bool,
    #[serde(default = "default_true")]
    pub consume_event_on_select: bool,
    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,
    #[serde(default)]
    pub enter_conditions: Vec<ConditionDefinition>,
    #[serde(default)]
    pub considerations: Vec<ConsiderationDefinition>,
    #[serde(default = "default_weight")]
    pub weight: f32,
    #[serde(default)]
    pub transitions: Vec<TransitionDefinition>,
    #[serde(default)]
    pub children: Vec<StateDefinition>,
    #[serde(default)]
    pub custom_tick_rate: Option<f32>,
    #[serde(default)]
    pub task_completion: TaskCompletion,
}

impl StateDefinition {
    pub fn new(name: &str) -> Self {
        StateDefinition {
            name: name.to_owned(),
            tag: None,
            kind: StateType::State,
            selection: SelectionBehavior::TrySelectChildrenInOrder,
            enabled: true,
            linked_subtree: None,
            linked_asset: None,
            parameters: FieldValues::new(),
            parameter_bindings: Vec::new(),
            required_event: None,
            check_prerequisites_when_activating_child_directly: true,
            consume_event_on_select: true,
            tasks: Vec::new(),
            enter_conditions: Vec::new(),
            considerations: Vec::new(),
            weight: 1.0,
            transitions: Vec::new(),
            children: Vec::new(),
            custom_tick_rate: None,
            task_completion: TaskCompletion::All,
        }
    }

    /// A `Linked` state entering the named subtree of the same tree.
    pub fn linked(name: &str, subtree: &str) -> Self {
        let mut state = StateDefinition::new(name).kind(StateType::Linked);
        state.linked_subtree = Some(subtree.to_owned());
        state
    }

    /// A `LinkedAsset` state entering the root of another tree.
    pub fn linked_asset(name: &str, asset: &str) -> Self {
        let mut state = StateDefinition::new(name).kind(StateType::LinkedAsset);
        state.linked_asset = Some(asset.to_owned());
        state
    }

    pub fn kind(mut self, kind: StateType) -> Self {
        self.kind = kind;
        self
    }

    pub fn tag(mut self, tag: &str) -> Self {
        self.tag = Some(tag.to_owned());
        self
    }

    pub fn selection(mut self, selection: SelectionBehavior) -> Self {
        self.selection = selection;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn child(mut self, child: StateDefinition) -> Self {
        self.children.push(child);
        self
    }

    pub fn task(mut self, task: TaskDefinition) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn enter_condition(mut self, condition: ConditionDefinition) -> Self {
        self.enter_conditions.push(condition);
        self
    }

    pub fn consideration(mut self, consideration: ConsiderationDefinition) -> Self {
        self.considerations.push(consideration);
        self
    }

    pub fn transition(mut self, transition: TransitionDefinition) -> Self {
        self.transitions.push(transition);
        self
    }

    pub fn weight(mut self, weight: f32) -> Self {
        self.weight = weight;
        self
    }

    pub fn parameter(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.to_owned(), value.into());
        self
    }

    pub fn parameter_binding(mut self, binding: BindingDefinition) -> Self {
        self.parameter_bindings.push(binding);
        self
    }

    pub fn required_event(mut self, desc: EventDesc) -> Self {
        self.required_event = Some(desc);
        self
    }

    pub fn custom_tick_rate(mut self, rate: f32) -> Self {
        self.custom_tick_rate = Some(rate);
        self
    }

    pub fn task_completion(mut self, completion: TaskCompletion) -> Self {
        self.task_completion = completion;
        self
    }
}

// ──────────────────────────────────────────────
// Nodes
// ──────────────────────────────────────────────

/// Binds `target` (a field of the owning struct) to the value at `source`.
///
/// Source paths:
/// `Context.<Data>.<field>`, `External.<Data>.<field>`, `Params.<field>`,
/// `StateParams.<State>.<field>`, `Event.<tag|payload|origin>`,
/// `StateEvent.<State>.<tag|payload|origin>`, `ExternalParam.<name>`,
/// `Node.<name>.<field>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingDefinition {
    pub target: String,
    pub source: String,
    /// Property function applied to the source value before it is copied.
    #[serde(default)]
    pub function: Option<FunctionKind>,
}

impl BindingDefinition {
    pub fn new(target: &str, source: &str) -> Self {
        BindingDefinition {
            target: target.to_owned(),
            source: source.to_owned(),
            function: None,
        }
    }

    pub fn through(mut self, function: FunctionKind) -> Self {
        self.function = Some(function);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorDefinition {
    pub name: String,
    pub kind: EvaluatorKind,
    #[serde(default)]
    pub fields: FieldValues,
    #[serde(default)]
    pub bindings: Vec<BindingDefinition>,
}

impl EvaluatorDefinition {
    pub fn new(name: &str, kind: EvaluatorKind) -> Self {
        EvaluatorDefinition {
            name: name.to_owned(),
            kind,
            fields: FieldValues::new(),
            bindings: Vec::new(),
        }
    }

    pub fn field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_owned(), value.into());
        self
    }
}

fn default_complete_with() -> TaskStatus {
    TaskStatus::Succeeded
}

fn default_enter_status() -> RunStatus {
    RunStatus::Running
}

/// Task behaviors as authored. State and dispatcher references are names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskKindDefinition {
    Run {
        #[serde(default = "default_enter_status")]
        enter_status: RunStatus,
        #[serde(default)]
        ticks: Option<u32>,
        #[serde(default = "default_complete_with")]
        complete_with: TaskStatus,
    },
    Delay {
        duration: f32,
    },
    SendEvent {
        tag: String,
        #[serde(default)]
        payload: Option<Value>,
        #[serde(default)]
        on: TaskTrigger,
    },
    RequestTransition {
        target: TransitionTarget,
        #[serde(default = "default_priority")]
        priority: TransitionPriority,
    },
    StopTree {
        status: RunStatus,
        #[serde(default)]
        on: TaskTrigger,
    },
    BroadcastDelegate {
        dispatcher: String,
        #[serde(default)]
        on: TaskTrigger,
    },
    ListenDelegate {
        dispatcher: String,
        #[serde(default = "default_complete_with")]
        finish_with: TaskStatus,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub name: String,
    pub kind: TaskKindDefinition,
    #[serde(default)]
    pub flags: TaskFlags,
    #[serde(default)]
    pub fields: FieldValues,
    #[serde(default)]
    pub bindings: Vec<BindingDefinition>,
}

impl TaskDefinition {
    pub fn new(name: &str, kind: TaskKindDefinition) -> Self {
        TaskDefinition {
            name: name.to_owned(),
            kind,
            flags: TaskFlags::default(),
            fields: FieldValues::new(),
            bindings: Vec::new(),
        }
    }

    /// A task that keeps running until it has ticked `ticks` times, then
    /// finishes with `complete_with`.
    pub fn run_for(name: &str, ticks: u32, complete_with: TaskStatus) -> Self {
        TaskDefinition::new(
            name,
            TaskKindDefinition::Run {
                enter_status: RunStatus::Running,
                ticks: Some(ticks),
                complete_with,
            },
        )
    }

    /// A task that runs until something else ends its state.
    pub fn run_forever(name: &str) -> Self {
        TaskDefinition::new(
            name,
            TaskKindDefinition::Run {
                enter_status: RunStatus::Running,
                ticks: None,
                complete_with: TaskStatus::Succeeded,
            },
        )
    }

    /// A task whose EnterState returns `status`.
    pub fn enter_with(name: &str, status: RunStatus) -> Self {
        TaskDefinition::new(
            name,
            TaskKindDefinition::Run {
                enter_status: status,
                ticks: None,
                complete_with: TaskStatus::Succeeded,
            },
        )
    }

    pub fn flags(mut self, flags: TaskFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_owned(), value.into());
        self
    }

    pub fn binding(mut self, binding: BindingDefinition) -> Self {
        self.bindings.push(binding);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionDefinition {
    #[serde(default)]
    pub name: String,
    pub kind: ConditionKind,
    #[serde(default)]
    pub operand: ExpressionOperand,
    #[serde(default)]
    pub indent: u8,
    #[serde(default)]
    pub mode: ConditionEvaluationMode,
    #[serde(default)]
    pub invert: bool,
    #[serde(default)]
    pub state_change_events: bool,
    #[serde(default = "default_true")]
    pub state_change_on_reselect: bool,
    #[serde(default)]
    pub fields: FieldValues,
    #[serde(default)]
    pub bindings: Vec<BindingDefinition>,
}

impl ConditionDefinition {
    pub fn new(kind: ConditionKind) -> Self {
        ConditionDefinition {
            name: String::new(),
            kind,
            operand: ExpressionOperand::And,
            indent: 0,
            mode: ConditionEvaluationMode::Evaluated,
            invert: false,
            state_change_events: false,
            state_change_on_reselect: true,
            fields: FieldValues::new(),
            bindings: Vec::new(),
        }
    }

    pub fn always(result: bool) -> Self {
        ConditionDefinition::new(ConditionKind::Always { result })
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_owned();
        self
    }

    pub fn operand(mut self, operand: ExpressionOperand) -> Self {
        self.operand = operand;
        self
    }

    pub fn indent(mut self, indent: u8) -> Self {
        self.indent = indent;
        self
    }

    pub fn inverted(mut self) -> Self {
        self.invert = true;
        self
    }

    pub fn mode(mut self, mode: ConditionEvaluationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_state_change_events(mut self) -> Self {
        self.state_change_events = true;
        self
    }

    pub fn field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_owned(), value.into());
        self
    }

    pub fn binding(mut self, binding: BindingDefinition) -> Self {
        self.bindings.push(binding);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsiderationDefinition {
    #[serde(default)]
    pub name: String,
    pub kind: ConsiderationKind,
    #[serde(default)]
    pub operand: ExpressionOperand,
    #[serde(default)]
    pub indent: u8,
    #[serde(default)]
    pub fields: FieldValues,
    #[serde(default)]
    pub bindings: Vec<BindingDefinition>,
}

impl ConsiderationDefinition {
    pub fn new(kind: ConsiderationKind) -> Self {
        ConsiderationDefinition {
            name: String::new(),
            kind,
            operand: ExpressionOperand::And,
            indent: 0,
            fields: FieldValues::new(),
            bindings: Vec::new(),
        }
    }

    pub fn constant(value: f32) -> Self {
        ConsiderationDefinition::new(ConsiderationKind::Constant { value })
    }

    pub fn operand(mut self, operand: ExpressionOperand) -> Self {
        self.operand = operand;
        self
    }

    pub fn indent(mut self, indent: u8) -> Self {
        self.indent = indent;
        self
    }

    pub fn binding(mut self, binding: BindingDefinition) -> Self {
        self.bindings.push(binding);
        self
    }
}

// ──────────────────────────────────────────────
// Transitions
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerDefinition {
    OnStateSucceeded,
    OnStateFailed,
    OnStateCompleted,
    OnTick,
    OnEvent,
    OnDelegate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionTarget {
    GotoState(String),
    /// The next sibling of the owning state.
    NextState,
    /// The first next sibling that selects successfully.
    NextSelectableState,
    Succeeded,
    Failed,
    Stopped,
    None,
}

impl TransitionTarget {
    pub fn state(name: &str) -> Self {
        TransitionTarget::GotoState(name.to_owned())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionDefinition {
    pub trigger: TriggerDefinition,
    pub target: TransitionTarget,
    #[serde(default = "default_priority")]
    pub priority: TransitionPriority,
    #[serde(default)]
    pub delay: TransitionDelay,
    #[serde(default)]
    pub event: Option<EventDesc>,
    #[serde(default)]
    pub delegate: Option<String>,
    #[serde(default)]
    pub conditions: Vec<ConditionDefinition>,
    #[serde(default = "default_true")]
    pub consume_event: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl TransitionDefinition {
    pub fn new(trigger: TriggerDefinition, target: TransitionTarget) -> Self {
        TransitionDefinition {
            trigger,
            target,
            priority: TransitionPriority::Normal,
            delay: TransitionDelay::default(),
            event: None,
            delegate: None,
            conditions: Vec::new(),
            consume_event: true,
            enabled: true,
        }
    }

    pub fn on_tick(target: TransitionTarget) -> Self {
        TransitionDefinition::new(TriggerDefinition::OnTick, target)
    }

    pub fn on_event(tag: &str, target: TransitionTarget) -> Self {
        let mut transition = TransitionDefinition::new(TriggerDefinition::OnEvent, target);
        transition.event = Some(EventDesc::tag(tag));
        transition
    }

    pub fn on_delegate(dispatcher: &str, target: TransitionTarget) -> Self {
        let mut transition = TransitionDefinition::new(TriggerDefinition::OnDelegate, target);
        transition.delegate = Some(dispatcher.to_owned());
        transition
    }

    pub fn on_succeeded(target: TransitionTarget) -> Self {
        TransitionDefinition::new(TriggerDefinition::OnStateSucceeded, target)
    }

    pub fn on_failed(target: TransitionTarget) -> Self {
        TransitionDefinition::new(TriggerDefinition::OnStateFailed, target)
    }

    pub fn on_completed(target: TransitionTarget) -> Self {
        TransitionDefinition::new(TriggerDefinition::OnStateCompleted, target)
    }

    pub fn priority(mut self, priority: TransitionPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn delayed(mut self, duration: f32, random_variance: f32) -> Self {
        self.delay = TransitionDelay {
            duration,
            random_variance,
        };
        self
    }

    pub fn condition(mut self, condition: ConditionDefinition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn keep_event(mut self) -> Self {
        self.consume_event = false;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}
