use crate::state::UpdatePhase;

/// Errors returned by the setters and queue operations of an execution
/// context. Start, Stop and Tick never fail with an error: they report
/// failure through [`statetree_core::RunStatus::Failed`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecutionError {
    /// The operation cannot run while the context is inside an update phase.
    #[error("{operation} cannot be called during {phase}")]
    Reentrant {
        operation: &'static str,
        phase: UpdatePhase,
    },

    #[error("the execution context is not valid: {0}")]
    InvalidContext(String),

    #[error("event queue is full ({max} events)")]
    EventQueueFull { max: usize },

    #[error("unknown delegate listener {0}")]
    UnknownListener(u32),

    #[error("unknown delegate dispatcher '{0}'")]
    UnknownDispatcher(String),

    #[error("unknown context data '{0}'")]
    UnknownContextData(String),

    #[error("unknown state '{0}'")]
    UnknownState(String),

    #[error("unknown node '{0}'")]
    UnknownNode(String),

    /// `finish_task` or `bind_delegate` was called outside a task call.
    #[error("{0} requires a task to be processed")]
    NoProcessingScope(&'static str),

    #[error("unknown scheduled tick request {0}")]
    UnknownTickRequest(u32),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid execution config: {0}")]
    Parse(#[from] toml::de::Error),
}
