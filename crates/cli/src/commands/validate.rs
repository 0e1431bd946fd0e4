use std::path::Path;

use statetree_core::{NodeKind, StateTree};

use super::load_library;
use crate::OutputFormat;

pub(crate) fn cmd_validate(library_path: &Path, output: OutputFormat, quiet: bool) {
    let library = load_library(library_path, output, quiet);
    if quiet {
        return;
    }

    match output {
        OutputFormat::Text => {
            println!("valid: {} tree(s)", library.len());
            for (_, tree) in library.iter() {
                let summary = summarize(tree);
                println!(
                    "  {}: {} states, {} tasks, {} transitions, {} frames",
                    tree.name, summary.states, summary.tasks, summary.transitions, summary.frames
                );
            }
        }
        OutputFormat::Json => {
            let trees: Vec<serde_json::Value> = library
                .iter()
                .map(|(id, tree)| {
                    let summary = summarize(tree);
                    serde_json::json!({
                        "asset": id.0,
                        "name": tree.name,
                        "states": summary.states,
                        "tasks": summary.tasks,
                        "transitions": summary.transitions,
                        "frames": summary.frames,
                    })
                })
                .collect();
            let json = serde_json::json!({ "valid": true, "trees": trees });
            println!(
                "{}",
                serde_json::to_string_pretty(&json).unwrap_or_default()
            );
        }
    }
}

struct TreeSummary {
    states: usize,
    tasks: usize,
    transitions: usize,
    frames: usize,
}

fn summarize(tree: &StateTree) -> TreeSummary {
    TreeSummary {
        states: tree.states.len(),
        tasks: tree
            .nodes
            .iter()
            .filter(|node| matches!(node.kind, NodeKind::Task(_)))
            .count(),
        transitions: tree.transitions.len(),
        frames: tree.frames.len(),
    }
}
