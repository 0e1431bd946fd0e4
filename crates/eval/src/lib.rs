//! statetree-eval: runs compiled state trees.
//!
//! An [`ExecutionContext`] drives one tree instance through Start, Tick and
//! Stop against an [`InstanceStorage`] the caller owns. Selection walks the
//! tree from the root and enters the states whose enter conditions pass;
//! each tick updates evaluators and tasks, then evaluates transitions and
//! enters the resulting path. Linked subtrees and linked assets run in
//! additional execution frames.
//!
//! ```no_run
//! use statetree_core::{AssetId, LibraryDefinition, TreeLibrary};
//! use statetree_eval::{ExecutionContext, InstanceStorage};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let defs = LibraryDefinition::from_json_str(&std::fs::read_to_string("library.json")?)?;
//! let library = TreeLibrary::compile(&defs)?;
//! let mut storage = InstanceStorage::new();
//! let mut ctx = ExecutionContext::new(&library, AssetId(0), &mut storage);
//! ctx.start(None, None);
//! ctx.tick(0.1);
//! println!("{:?}", ctx.active_state_names());
//! # Ok(())
//! # }
//! ```

pub mod active_states;
pub mod config;
pub mod context;
pub mod delegates;
pub mod error;
pub mod events;
pub mod external_data;
pub mod frame;
pub mod recording;
pub mod schedule;
pub mod state;
pub mod storage;
pub mod task_status;
pub mod trace;

pub use active_states::{ActiveStateId, ActiveStates};
pub use config::ExecutionConfig;
pub use context::{ExecutionContext, LinkedOverride, ReadOnlyContext};
pub use delegates::{DelegateDispatcher, ListenerId};
pub use error::{ConfigError, ExecutionError};
pub use events::{EventQueue, SharedEvent};
pub use external_data::ExternalDataCollector;
pub use frame::{ExecutionFrame, FrameId};
pub use recording::{RecordedFrame, RecordedTransitionResult};
pub use schedule::{ScheduledTick, ScheduledTickHandle};
pub use state::{ChangeType, ExecutionState, UpdatePhase};
pub use storage::InstanceStorage;
pub use task_status::TaskGroupStatus;
pub use trace::{ExecutionTrace, NodeCall, TraceEvent};
