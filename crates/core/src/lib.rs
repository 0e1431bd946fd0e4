//! statetree-core: compiled state tree model.
//!
//! Holds everything the execution engine treats as immutable: state and
//! data handles, run statuses, property values and events, the closed node
//! catalogue, compiled trees and the [`TreeLibrary`] arena that owns them.
//! Trees are authored as serde [`definition`] types and lowered by
//! [`TreeLibrary::compile`].
//!
//! # Public API
//!
//! - [`TreeLibrary`] / [`StateTree`] -- compiled assets, addressed by [`AssetId`]
//! - [`StateHandle`], [`DataHandle`] -- dense handles into a compiled tree
//! - [`RunStatus`], [`TaskStatus`] -- statuses with the fixed merge priority
//! - [`LibraryDefinition`] and friends -- authoring input
//! - [`CompileError`] -- compilation failures

pub mod binding;
pub mod compile;
pub mod definition;
pub mod error;
pub mod event;
pub mod handle;
pub mod node;
pub mod status;
pub mod tree;
pub mod value;

// ── Convenience re-exports: compiled model ───────────────────────────

pub use binding::{CopyBatch, PropertyCopy};
pub use handle::{AssetId, DataHandle, DataSource, StateHandle};
pub use node::{CompactNode, NodeKind, MAX_EXPRESSION_INDENT};
pub use status::{RunStatus, SelectionFallback, TaskStatus, TransitionPriority};
pub use tree::{
    CompactFrame, CompactState, CompactTransition, DataDesc, NodeRange, SelectionBehavior,
    StateTree, StateType, TaskCompletion, TransitionTrigger, TreeLibrary, MAX_STATES,
    MAX_TASKS_PER_GROUP,
};

// ── Convenience re-exports: data and authoring ───────────────────────

pub use definition::{
    BindingDefinition, ConditionDefinition, ConsiderationDefinition, EvaluatorDefinition,
    LibraryDefinition, StateDefinition, TaskDefinition, TaskKindDefinition, TransitionDefinition,
    TransitionTarget, TreeDefinition, TriggerDefinition,
};
pub use error::CompileError;
pub use event::{EventDesc, StateTreeEvent};
pub use value::{InstanceStruct, Value};
