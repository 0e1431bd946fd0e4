use std::path::Path;

use serde::Serialize;
use statetree_core::{AssetId, RunStatus};
use statetree_eval::{ExecutionContext, InstanceStorage, ScheduledTick};

use super::load_library;
use crate::run_file::{RunFile, ScriptedEvent, DEFAULT_DT, DEFAULT_TICKS};
use crate::{fail, report_error, OutputFormat};

pub(crate) struct RunOptions<'a> {
    pub library: &'a Path,
    pub tree: Option<&'a str>,
    pub config: Option<&'a Path>,
    pub ticks: Option<u32>,
    pub dt: Option<f32>,
    pub seed: Option<u64>,
    pub events: &'a [String],
    pub output: OutputFormat,
    pub quiet: bool,
}

#[derive(Serialize)]
struct TickReport {
    tick: u32,
    status: RunStatus,
    active: Vec<String>,
    next_tick: ScheduledTick,
}

pub(crate) fn cmd_run(options: RunOptions<'_>) {
    let RunOptions { output, quiet, .. } = options;
    let library = load_library(options.library, output, quiet);

    let run_file = match options.config {
        Some(path) => {
            let text = match std::fs::read_to_string(path) {
                Ok(s) => s,
                Err(e) => fail(
                    &format!("error reading file '{}': {}", path.display(), e),
                    output,
                    quiet,
                ),
            };
            match RunFile::from_toml_str(&text) {
                Ok(file) => file,
                Err(e) => fail(
                    &format!("invalid run file '{}': {}", path.display(), e),
                    output,
                    quiet,
                ),
            }
        }
        None => RunFile::default(),
    };

    let tree_name = options.tree.or(run_file.tree.as_deref());
    let asset = match tree_name {
        Some(name) => match library.find(name) {
            Some(asset) => asset,
            None => fail(&format!("unknown tree '{}'", name), output, quiet),
        },
        None => AssetId(0),
    };
    if library.get(asset).is_none() {
        fail("library contains no trees", output, quiet);
    }

    let ticks = options.ticks.or(run_file.ticks).unwrap_or(DEFAULT_TICKS);
    let dt = options.dt.or(run_file.dt).unwrap_or(DEFAULT_DT);
    let seed = options.seed.or(run_file.seed);
    let mut events = run_file.events.clone();
    for arg in options.events {
        match ScriptedEvent::parse(arg) {
            Ok(event) => events.push(event),
            Err(msg) => fail(&msg, output, quiet),
        }
    }

    let mut storage = InstanceStorage::new();
    let mut reports = Vec::new();
    let final_status = {
        let mut ctx = ExecutionContext::new(&library, asset, &mut storage).with_config(run_file.execution);
        let mut status = ctx.start(run_file.parameters(), seed);
        reports.push(report(&ctx, 0, status));

        for tick in 1..=ticks {
            if ctx.run_status() != RunStatus::Running {
                break;
            }
            for scripted in events.iter().filter(|e| e.tick == tick) {
                if let Err(e) = ctx.send_event(scripted.to_event()) {
                    report_error(&format!("tick {}: {}", tick, e), output, quiet);
                }
            }
            status = ctx.tick(dt);
            reports.push(report(&ctx, tick, status));
        }
        status
    };
    tracing::debug!(ticks = reports.len(), status = %final_status, "run finished");

    match output {
        OutputFormat::Text => {
            if !quiet {
                for r in &reports {
                    println!(
                        "tick {:>3}  {:<9}  {}",
                        r.tick,
                        r.status.to_string(),
                        r.active.join(" > ")
                    );
                }
            }
            println!("status: {}", final_status);
        }
        OutputFormat::Json => {
            let tree = library.get(asset).map(|t| t.name.clone()).unwrap_or_default();
            let json = serde_json::json!({
                "tree": tree,
                "status": final_status,
                "ticks": if quiet { Vec::new() } else { reports },
                "recorded_transitions": storage.recorded_transitions(),
            });
            println!(
                "{}",
                serde_json::to_string_pretty(&json).unwrap_or_default()
            );
        }
    }
}

fn report(ctx: &ExecutionContext<'_>, tick: u32, status: RunStatus) -> TickReport {
    TickReport {
        tick,
        status,
        active: ctx.active_state_names(),
        next_tick: ctx.next_scheduled_tick(),
    }
}
