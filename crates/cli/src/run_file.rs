//! TOML run file for `statetree run`.
//!
//! ```toml
//! tree = "Guard"
//! ticks = 20
//! dt = 0.1
//! seed = 7
//!
//! [execution]
//! record_transitions = true
//!
//! [parameters]
//! speed = 2.5
//!
//! [[events]]
//! tick = 3
//! tag = "door.open"
//! ```
//!
//! Command-line flags override the file; `--event` flags add to its events.

use std::collections::BTreeMap;

use serde::Deserialize;
use statetree_core::{InstanceStruct, StateTreeEvent, Value};
use statetree_eval::ExecutionConfig;

pub(crate) const DEFAULT_TICKS: u32 = 10;
pub(crate) const DEFAULT_DT: f32 = 0.1;

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct RunFile {
    pub tree: Option<String>,
    pub ticks: Option<u32>,
    pub dt: Option<f32>,
    pub seed: Option<u64>,
    pub execution: ExecutionConfig,
    pub parameters: BTreeMap<String, Value>,
    pub events: Vec<ScriptedEvent>,
}

/// An event sent right before tick `tick` (1-based).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub(crate) struct ScriptedEvent {
    pub tick: u32,
    pub tag: String,
    #[serde(default)]
    pub payload: Option<Value>,
}

impl ScriptedEvent {
    /// Parses `TICK:TAG`.
    pub(crate) fn parse(arg: &str) -> Result<Self, String> {
        let (tick, tag) = arg
            .split_once(':')
            .ok_or_else(|| format!("invalid event '{}': expected TICK:TAG", arg))?;
        let tick = tick
            .trim()
            .parse::<u32>()
            .map_err(|e| format!("invalid event tick in '{}': {}", arg, e))?;
        let tag = tag.trim();
        if tag.is_empty() {
            return Err(format!("invalid event '{}': empty tag", arg));
        }
        Ok(ScriptedEvent {
            tick,
            tag: tag.to_owned(),
            payload: None,
        })
    }

    pub(crate) fn to_event(&self) -> StateTreeEvent {
        let event = StateTreeEvent::new(&self.tag).with_origin("statetree-cli");
        match &self.payload {
            Some(payload) => event.with_payload(payload.clone()),
            None => event,
        }
    }
}

impl RunFile {
    pub(crate) fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub(crate) fn parameters(&self) -> Option<InstanceStruct> {
        if self.parameters.is_empty() {
            return None;
        }
        Some(
            self.parameters
                .iter()
                .fold(InstanceStruct::new(), |params, (name, value)| {
                    params.with(name, value.clone())
                }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_run_file() {
        let file = RunFile::from_toml_str(
            r#"
tree = "Guard"
ticks = 4
dt = 0.25
seed = 9

[execution]
record_transitions = true

[parameters]
speed = 2.5
armed = true

[[events]]
tick = 2
tag = "door.open"
payload = 3
"#,
        )
        .unwrap();
        assert_eq!(file.tree.as_deref(), Some("Guard"));
        assert_eq!(file.ticks, Some(4));
        assert!(file.execution.record_transitions);
        assert!(file.execution.tick_global_nodes_following_tree_hierarchy);
        assert_eq!(file.events.len(), 1);
        assert_eq!(file.events[0].payload, Some(Value::Int(3)));

        let params = file.parameters().unwrap();
        assert_eq!(params.get_named("speed"), Some(&Value::Float(2.5)));
        assert_eq!(params.get_named("armed"), Some(&Value::Bool(true)));
    }

    #[test]
    fn empty_file_uses_defaults() {
        let file = RunFile::from_toml_str("").unwrap();
        assert!(file.tree.is_none());
        assert!(file.parameters().is_none());
        assert_eq!(file.execution, ExecutionConfig::default());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(RunFile::from_toml_str("tick_count = 3").is_err());
    }

    #[test]
    fn event_argument_parsing() {
        let event = ScriptedEvent::parse("3:door.open").unwrap();
        assert_eq!(event.tick, 3);
        assert_eq!(event.tag, "door.open");
        assert!(ScriptedEvent::parse("door.open").is_err());
        assert!(ScriptedEvent::parse("x:door.open").is_err());
        assert!(ScriptedEvent::parse("2:").is_err());
    }
}
