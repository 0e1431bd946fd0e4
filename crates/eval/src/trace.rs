//! Narrow trace interface the engine reports node calls and state changes to.

use statetree_core::{AssetId, RunStatus, TransitionPriority};

use crate::state::ChangeType;

/// Lifecycle call made on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeCall {
    TreeStart,
    TreeStop,
    EnterState,
    ExitState,
    Tick,
    StateCompleted,
    TriggerTransitions,
    TestCondition,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TraceEvent {
    Node {
        tree: AssetId,
        node: String,
        call: NodeCall,
        /// Run status returned by tasks, or the condition result as
        /// Succeeded/Failed for condition tests.
        status: Option<RunStatus>,
    },
    StateEntered {
        tree: AssetId,
        state: String,
        change: ChangeType,
    },
    StateExited {
        tree: AssetId,
        state: String,
        change: ChangeType,
    },
    Transition {
        tree: AssetId,
        target: String,
        priority: TransitionPriority,
    },
}

pub trait ExecutionTrace {
    fn record(&mut self, event: TraceEvent);
}

impl ExecutionTrace for Vec<TraceEvent> {
    fn record(&mut self, event: TraceEvent) {
        self.push(event);
    }
}

/// Names of the nodes that received `call`, in call order.
pub fn node_calls(events: &[TraceEvent], call: NodeCall) -> Vec<&str> {
    events
        .iter()
        .filter_map(|e| match e {
            TraceEvent::Node { node, call: c, .. } if *c == call => Some(node.as_str()),
            _ => None,
        })
        .collect()
}

/// Names of the entered states, in enter order.
pub fn entered_states(events: &[TraceEvent]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|e| match e {
            TraceEvent::StateEntered { state, .. } => Some(state.as_str()),
            _ => None,
        })
        .collect()
}

pub fn exited_states(events: &[TraceEvent]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|e| match e {
            TraceEvent::StateExited { state, .. } => Some(state.as_str()),
            _ => None,
        })
        .collect()
}
