//! Per-context execution flags.
//!
//! These flags select between two documented behaviors of the runtime and
//! change which nodes get notified, so they live on the context rather than
//! in process-wide state.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Tick evaluators and global tasks interleaved with state tasks, frame
    /// by frame. When false, every frame's global nodes tick first and state
    /// tasks only tick while they are still running.
    pub tick_global_nodes_following_tree_hierarchy: bool,
    /// Completed global tasks complete only the frame that owns them. When
    /// false, any completed global task group stops the whole tree.
    pub global_tasks_complete_owning_frame: bool,
    /// Copy bound properties for tasks that are skipped this tick.
    pub copy_bound_properties_on_non_ticked_task: bool,
    /// Keep a [`crate::RecordedTransitionResult`] for every committed transition.
    pub record_transitions: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        ExecutionConfig {
            tick_global_nodes_following_tree_hierarchy: true,
            global_tasks_complete_owning_frame: true,
            copy_bound_properties_on_non_ticked_task: false,
            record_transitions: false,
        }
    }
}

impl ExecutionConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_hierarchy() {
        let config = ExecutionConfig::default();
        assert!(config.tick_global_nodes_following_tree_hierarchy);
        assert!(config.global_tasks_complete_owning_frame);
        assert!(!config.copy_bound_properties_on_non_ticked_task);
        assert!(!config.record_transitions);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = ExecutionConfig::from_toml_str("record_transitions = true\n").unwrap();
        assert!(config.record_transitions);
        assert!(config.global_tasks_complete_owning_frame);
    }

    #[test]
    fn bad_toml_is_a_config_error() {
        let err = ExecutionConfig::from_toml_str("record_transitions = \"yes\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
