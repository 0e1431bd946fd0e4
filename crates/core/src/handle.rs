//! Dense handles into a compiled tree and the data handles used by bindings.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::status::RunStatus;

// ──────────────────────────────────────────────
// Asset identity
// ──────────────────────────────────────────────

/// Index of a compiled tree inside a [`crate::TreeLibrary`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetId(pub u16);

impl AssetId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "asset#{}", self.0)
    }
}

// ──────────────────────────────────────────────
// State handles
// ──────────────────────────────────────────────

/// Handle to a compiled state. Besides real states, three reserved values
/// stand for the terminal pseudo-states a transition can target.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateHandle(u16);

impl StateHandle {
    pub const INVALID_INDEX: u16 = u16::MAX;
    pub const SUCCEEDED_INDEX: u16 = u16::MAX - 1;
    pub const FAILED_INDEX: u16 = u16::MAX - 2;
    pub const STOPPED_INDEX: u16 = u16::MAX - 3;

    pub const INVALID: StateHandle = StateHandle(Self::INVALID_INDEX);
    pub const SUCCEEDED: StateHandle = StateHandle(Self::SUCCEEDED_INDEX);
    pub const FAILED: StateHandle = StateHandle(Self::FAILED_INDEX);
    pub const STOPPED: StateHandle = StateHandle(Self::STOPPED_INDEX);
    pub const ROOT: StateHandle = StateHandle(0);

    pub const fn new(index: u16) -> Self {
        StateHandle(index)
    }

    pub fn raw(self) -> u16 {
        self.0
    }

    /// Position in `StateTree::states`. Only meaningful when [`Self::is_state`] holds.
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// True for every handle except [`Self::INVALID`], including the
    /// completion pseudo-states.
    pub fn is_valid(self) -> bool {
        self.0 != Self::INVALID_INDEX
    }

    /// True when the handle addresses a real compiled state.
    pub fn is_state(self) -> bool {
        self.0 < Self::STOPPED_INDEX
    }

    pub fn is_valid_index(index: u16) -> bool {
        index != Self::INVALID_INDEX
    }

    pub fn is_completion_state(self) -> bool {
        matches!(
            self.0,
            Self::SUCCEEDED_INDEX | Self::FAILED_INDEX | Self::STOPPED_INDEX
        )
    }

    /// Run status a completion pseudo-state stands for; `Unset` otherwise.
    pub fn to_completion_status(self) -> RunStatus {
        match self.0 {
            Self::SUCCEEDED_INDEX => RunStatus::Succeeded,
            Self::FAILED_INDEX => RunStatus::Failed,
            Self::STOPPED_INDEX => RunStatus::Stopped,
            _ => RunStatus::Unset,
        }
    }

    pub fn from_completion_status(status: RunStatus) -> StateHandle {
        match status {
            RunStatus::Succeeded => Self::SUCCEEDED,
            RunStatus::Failed => Self::FAILED,
            RunStatus::Stopped => Self::STOPPED,
            RunStatus::Unset | RunStatus::Running => Self::INVALID,
        }
    }
}

impl Default for StateHandle {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Debug for StateHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Self::INVALID_INDEX => write!(f, "State(invalid)"),
            Self::SUCCEEDED_INDEX => write!(f, "State(succeeded)"),
            Self::FAILED_INDEX => write!(f, "State(failed)"),
            Self::STOPPED_INDEX => write!(f, "State(stopped)"),
            index => write!(f, "State({})", index),
        }
    }
}

// ──────────────────────────────────────────────
// Data handles
// ──────────────────────────────────────────────

/// Where the data behind a [`DataHandle`] lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DataSource {
    #[default]
    None,
    /// Caller supplied context data, indexed from the start of the view table.
    ContextData,
    /// Per-asset external data, indexed from the frame's external base.
    ExternalData,
    /// Evaluator and global task instances, indexed from the frame's global base.
    GlobalInstanceData,
    /// State task instances, indexed from the frame's active base.
    ActiveInstanceData,
    /// Condition, consideration and property function scratch instances, per asset.
    SharedInstanceData,
    /// The parameter block of the frame's global scope.
    GlobalParameterData,
    /// A state's own parameter slot, indexed from the frame's active base.
    StateParameterData,
    /// The parameters of the subtree root the frame starts at.
    SubtreeParameterData,
    /// The event captured when the state was selected.
    StateEvent,
    /// The event driving the transition currently being evaluated.
    TransitionEvent,
    /// Values supplied by the caller in a lookup table, keyed by parameter name.
    ExternalGlobalParameterData,
}

/// Compiled reference to a piece of instance or context data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DataHandle {
    pub source: DataSource,
    pub index: u16,
    /// Owning state, for the state-relative sources.
    pub state: StateHandle,
}

impl DataHandle {
    pub const NONE: DataHandle = DataHandle {
        source: DataSource::None,
        index: 0,
        state: StateHandle::INVALID,
    };

    pub const GLOBAL_PARAMETERS: DataHandle = DataHandle {
        source: DataSource::GlobalParameterData,
        index: 0,
        state: StateHandle::INVALID,
    };

    pub fn new(source: DataSource, index: u16) -> Self {
        DataHandle {
            source,
            index,
            state: StateHandle::INVALID,
        }
    }

    pub fn for_state(source: DataSource, index: u16, state: StateHandle) -> Self {
        DataHandle {
            source,
            index,
            state,
        }
    }

    pub fn is_valid(self) -> bool {
        self.source != DataSource::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_handles_round_trip_status() {
        for status in [RunStatus::Succeeded, RunStatus::Failed, RunStatus::Stopped] {
            let handle = StateHandle::from_completion_status(status);
            assert!(handle.is_completion_state());
            assert!(handle.is_valid());
            assert!(!handle.is_state());
            assert_eq!(handle.to_completion_status(), status);
        }
    }

    #[test]
    fn running_has_no_completion_handle() {
        assert_eq!(
            StateHandle::from_completion_status(RunStatus::Running),
            StateHandle::INVALID
        );
        assert!(!StateHandle::INVALID.is_valid());
        assert_eq!(StateHandle::ROOT.to_completion_status(), RunStatus::Unset);
    }
}
