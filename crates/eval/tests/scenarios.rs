//! End-to-end execution scenarios driven through the public API.
//!
//! Each test compiles a small library, runs it through Start/Tick/Stop
//! and checks the active path, run status and recorded trace.

use statetree_core::node::{ConditionKind, TaskTrigger};
use statetree_core::{
    AssetId, BindingDefinition, ConditionDefinition, ConsiderationDefinition, InstanceStruct,
    LibraryDefinition, RunStatus, SelectionBehavior, StateDefinition, StateHandle, StateTreeEvent,
    TaskDefinition, TaskKindDefinition, TaskStatus, TransitionDefinition, TransitionPriority,
    TransitionTarget, TreeDefinition, TreeLibrary, MAX_STATES,
};
use statetree_eval::trace::{entered_states, node_calls};
use statetree_eval::{
    ActiveStateId, ActiveStates, ExecutionConfig, ExecutionContext, InstanceStorage, NodeCall,
    ReadOnlyContext, ScheduledTick, TraceEvent,
};

// ──────────────────────────────────────────────
// Fixtures
// ──────────────────────────────────────────────

fn compile(def: TreeDefinition) -> TreeLibrary {
    TreeLibrary::compile(&LibraryDefinition::single(def)).unwrap()
}

/// Root with a gated state A and a fallback state B.
fn gated_library(gate: &str) -> TreeLibrary {
    compile(TreeDefinition::new(
        "Gated",
        StateDefinition::new("Root")
            .child(
                StateDefinition::new("A")
                    .task(TaskDefinition::run_forever("a"))
                    .enter_condition(
                        ConditionDefinition::new(ConditionKind::IsTrue)
                            .binding(BindingDefinition::new("value", gate)),
                    ),
            )
            .child(StateDefinition::new("B").task(TaskDefinition::run_forever("b"))),
    ))
}

// ──────────────────────────────────────────────
// 1. Linear success
// ──────────────────────────────────────────────

#[test]
fn linear_success_falls_back_to_root_completion() {
    let lib = compile(TreeDefinition::new(
        "Linear",
        StateDefinition::new("Root")
            .transition(TransitionDefinition::on_succeeded(TransitionTarget::Succeeded))
            .child(StateDefinition::new("Child").task(TaskDefinition::run_for("work", 1, TaskStatus::Succeeded))),
    ));
    let mut storage = InstanceStorage::new();
    let mut trace: Vec<TraceEvent> = Vec::new();
    {
        let mut ctx = ExecutionContext::new(&lib, AssetId(0), &mut storage).with_trace(&mut trace);
        assert_eq!(ctx.start(None, None), RunStatus::Running);
        assert_eq!(ctx.tick(0.1), RunStatus::Succeeded);
    }

    assert_eq!(node_calls(&trace, NodeCall::EnterState), vec!["work"]);
    assert_eq!(node_calls(&trace, NodeCall::StateCompleted), vec!["work"]);
    assert_eq!(entered_states(&trace), vec!["Root", "Child"]);
    let view = ReadOnlyContext::new(&lib, AssetId(0), &storage);
    assert_eq!(view.run_status(), RunStatus::Succeeded);
    assert!(view.active_state_names().is_empty());
}

// ──────────────────────────────────────────────
// 2. Delayed transition
// ──────────────────────────────────────────────

#[test]
fn delayed_transition_registers_then_fires() {
    let lib = compile(TreeDefinition::new(
        "Delayed",
        StateDefinition::new("Root")
            .child(
                StateDefinition::new("S")
                    .task(TaskDefinition::run_forever("wait"))
                    .transition(TransitionDefinition::on_tick(TransitionTarget::state("T")).delayed(1.0, 0.0)),
            )
            .child(StateDefinition::new("T").task(TaskDefinition::run_forever("after"))),
    ));
    let mut storage = InstanceStorage::new();
    let mut ctx = ExecutionContext::new(&lib, AssetId(0), &mut storage);
    ctx.start(None, None);

    ctx.tick(0.6);
    assert_eq!(ctx.active_state_names(), vec!["Root", "S"]);
    ctx.tick(0.6);
    assert_eq!(ctx.active_state_names(), vec!["Root", "T"]);
}

// ──────────────────────────────────────────────
// 3. Boundary behaviors
// ──────────────────────────────────────────────

#[test]
fn global_task_finishing_on_start_completes_without_entering_states() {
    let lib = compile(
        TreeDefinition::new("Instant", StateDefinition::new("Root").task(TaskDefinition::run_forever("never")))
            .global_task(TaskDefinition::enter_with("done", RunStatus::Succeeded)),
    );
    let mut storage = InstanceStorage::new();
    let mut trace: Vec<TraceEvent> = Vec::new();
    {
        let mut ctx = ExecutionContext::new(&lib, AssetId(0), &mut storage).with_trace(&mut trace);
        assert_eq!(ctx.start(None, None), RunStatus::Succeeded);
        assert_eq!(ctx.run_status(), RunStatus::Succeeded);
        assert!(ctx.active_frames().is_empty());
    }
    assert!(entered_states(&trace).is_empty());
    assert!(!node_calls(&trace, NodeCall::EnterState).contains(&"never"));
}

#[test]
fn root_that_cannot_be_selected_fails_the_start() {
    let lib = compile(TreeDefinition::new(
        "Blocked",
        StateDefinition::new("Root")
            .enter_condition(ConditionDefinition::always(false))
            .task(TaskDefinition::run_forever("never")),
    ));
    let mut storage = InstanceStorage::new();
    let mut trace: Vec<TraceEvent> = Vec::new();
    {
        let mut ctx = ExecutionContext::new(&lib, AssetId(0), &mut storage).with_trace(&mut trace);
        assert_eq!(ctx.start(None, None), RunStatus::Failed);
    }
    assert!(entered_states(&trace).is_empty());
}

#[test]
fn stop_from_task_tick_runs_teardown_once() {
    let lib = compile(TreeDefinition::new(
        "Halting",
        StateDefinition::new("Root").child(
            StateDefinition::new("A")
                .task(TaskDefinition::run_forever("worker"))
                .task(TaskDefinition::new(
                    "halt",
                    TaskKindDefinition::StopTree {
                        status: RunStatus::Failed,
                        on: TaskTrigger::Tick,
                    },
                )),
        ),
    ));
    let mut storage = InstanceStorage::new();
    let mut trace: Vec<TraceEvent> = Vec::new();
    {
        let mut ctx = ExecutionContext::new(&lib, AssetId(0), &mut storage).with_trace(&mut trace);
        ctx.start(None, None);
        assert_eq!(ctx.tick(0.1), RunStatus::Failed);
    }
    let mut exits = node_calls(&trace, NodeCall::ExitState);
    exits.sort_unstable();
    assert_eq!(exits, vec!["halt", "worker"]);
}

#[test]
fn disabled_state_is_skipped_on_the_selection_path() {
    let lib = compile(TreeDefinition::new(
        "Disabled",
        StateDefinition::new("Root")
            .child(
                StateDefinition::new("Off")
                    .disabled()
                    .child(StateDefinition::new("Inner").task(TaskDefinition::run_forever("inner"))),
            )
            .child(StateDefinition::new("On").task(TaskDefinition::run_forever("on"))),
    ));
    let mut storage = InstanceStorage::new();
    let mut ctx = ExecutionContext::new(&lib, AssetId(0), &mut storage);
    ctx.start(None, None);
    let names = ctx.active_state_names();
    assert_eq!(names, vec!["Root", "On"]);
    assert!(!names.iter().any(|n| n == "Off" || n == "Inner"));
}

#[test]
fn active_state_list_rejects_push_past_capacity() {
    let mut states = ActiveStates::new();
    for i in 0..MAX_STATES {
        assert!(states.push(StateHandle::new(i as u16), ActiveStateId(i as u32 + 1)));
    }
    assert!(!states.push(StateHandle::new(99), ActiveStateId(99)));
    assert_eq!(states.len(), MAX_STATES);
    assert_eq!(states.last(), StateHandle::new(MAX_STATES as u16 - 1));
}

// ──────────────────────────────────────────────
// 4. External parameters through validated copies
// ──────────────────────────────────────────────

#[test]
fn missing_external_parameter_closes_the_enter_condition() {
    let lib = gated_library("ExternalParam.armed");
    let mut storage = InstanceStorage::new();
    let mut ctx = ExecutionContext::new(&lib, AssetId(0), &mut storage);
    ctx.start(None, None);
    assert_eq!(ctx.active_state_names(), vec!["Root", "B"]);
}

#[test]
fn external_parameter_opens_the_enter_condition() {
    let lib = gated_library("ExternalParam.armed");
    let mut storage = InstanceStorage::new();
    let mut ctx = ExecutionContext::new(&lib, AssetId(0), &mut storage);
    ctx.set_external_global_parameter("armed", true);
    ctx.start(None, None);
    assert_eq!(ctx.active_state_names(), vec!["Root", "A"]);
}

// ──────────────────────────────────────────────
// 5. Events, scheduling and restarts
// ──────────────────────────────────────────────

#[test]
fn event_payload_transition_and_schedule() {
    let lib = compile(TreeDefinition::new(
        "Door",
        StateDefinition::new("Root")
            .child(
                StateDefinition::new("Closed")
                    .task(TaskDefinition::run_forever("idle"))
                    .transition(TransitionDefinition::on_event("door.open", TransitionTarget::state("Open"))),
            )
            .child(StateDefinition::new("Open").task(TaskDefinition::run_forever("swing"))),
    ));
    let mut storage = InstanceStorage::new();
    let mut ctx = ExecutionContext::new(&lib, AssetId(0), &mut storage);
    ctx.start(None, Some(7));
    assert_eq!(ctx.next_scheduled_tick(), ScheduledTick::EveryFrame);

    ctx.send_event(StateTreeEvent::new("door.close")).unwrap();
    ctx.tick(0.1);
    assert_eq!(ctx.active_state_names(), vec!["Root", "Closed"]);

    ctx.send_event(StateTreeEvent::new("door.open").with_payload(3i64)).unwrap();
    ctx.tick(0.1);
    assert_eq!(ctx.active_state_names(), vec!["Root", "Open"]);
}

#[test]
fn restart_with_parameters_selects_from_the_root_again() {
    let lib = compile(
        TreeDefinition::new(
            "Gated",
            StateDefinition::new("Root")
                .child(
                    StateDefinition::new("A")
                        .task(TaskDefinition::run_forever("a"))
                        .enter_condition(
                            ConditionDefinition::new(ConditionKind::IsTrue)
                                .binding(BindingDefinition::new("value", "Params.open")),
                        ),
                )
                .child(StateDefinition::new("B").task(TaskDefinition::run_forever("b"))),
        )
        .parameter("open", false),
    );
    let mut storage = InstanceStorage::new();
    let mut ctx = ExecutionContext::new(&lib, AssetId(0), &mut storage);
    ctx.start(None, None);
    assert_eq!(ctx.active_state_names(), vec!["Root", "B"]);

    ctx.stop(RunStatus::Stopped);
    assert_eq!(ctx.run_status(), RunStatus::Stopped);
    ctx.start(Some(InstanceStruct::new().with("open", true)), None);
    assert_eq!(ctx.active_state_names(), vec!["Root", "A"]);
    // Parameters persist into later restarts.
    ctx.stop(RunStatus::Stopped);
    ctx.start(None, None);
    assert_eq!(ctx.active_state_names(), vec!["Root", "A"]);
}

#[test]
fn config_from_toml_drives_recording() {
    let config = ExecutionConfig::from_toml_str("record_transitions = true\n").unwrap();
    let lib = compile(TreeDefinition::new(
        "Recorded",
        StateDefinition::new("Root").child(StateDefinition::new("A").task(TaskDefinition::run_forever("a"))),
    ));
    let mut storage = InstanceStorage::new();
    {
        let mut ctx = ExecutionContext::new(&lib, AssetId(0), &mut storage).with_config(config);
        ctx.start(None, None);
        ctx.stop(RunStatus::Stopped);
        assert_eq!(ctx.start(None, None), RunStatus::Running);
    }
    // Recordings survive restarts until taken.
    let recorded = storage.take_recorded_transitions();
    assert_eq!(recorded.len(), 2);
    assert!(recorded.iter().all(|r| r.leaf() == lib[AssetId(0)].find_state("A")));
    assert!(storage.recorded_transitions().is_empty());
}

// ──────────────────────────────────────────────
// 6. Child selection strategies
// ──────────────────────────────────────────────

/// A leaf scored by a constant consideration, optionally blocked by a
/// false enter condition.
fn scored(name: &str, score: f32, blocked: bool) -> StateDefinition {
    let state = StateDefinition::new(name)
        .task(TaskDefinition::run_forever(name))
        .consideration(ConsiderationDefinition::constant(score));
    if blocked {
        state.enter_condition(ConditionDefinition::always(false))
    } else {
        state
    }
}

fn selected_leaf(lib: &TreeLibrary, seed: u64) -> String {
    let mut storage = InstanceStorage::new();
    let mut ctx = ExecutionContext::new(lib, AssetId(0), &mut storage);
    assert_eq!(ctx.start(None, Some(seed)), RunStatus::Running);
    ctx.active_state_names().pop().unwrap_or_default()
}

#[test]
fn highest_utility_prefers_the_first_of_equal_scores() {
    let lib = compile(TreeDefinition::new(
        "Utility",
        StateDefinition::new("Root")
            .selection(SelectionBehavior::TrySelectChildrenWithHighestUtility)
            .child(scored("A", 0.2, false))
            .child(scored("B", 0.8, false))
            .child(scored("C", 0.8, false)),
    ));
    assert_eq!(selected_leaf(&lib, 1), "B");
}

#[test]
fn highest_utility_moves_to_the_next_best_when_blocked() {
    let lib = compile(TreeDefinition::new(
        "Utility",
        StateDefinition::new("Root")
            .selection(SelectionBehavior::TrySelectChildrenWithHighestUtility)
            .child(scored("A", 0.2, false))
            .child(scored("B", 0.9, true))
            .child(scored("C", 0.5, false)),
    ));
    assert_eq!(selected_leaf(&lib, 1), "C");
}

#[test]
fn weighted_random_follows_scores_and_never_picks_zero() {
    let lib = compile(TreeDefinition::new(
        "Weighted",
        StateDefinition::new("Root")
            .selection(SelectionBehavior::TrySelectChildrenAtRandomWeightedByUtility)
            .child(scored("A", 0.1, false))
            .child(scored("B", 0.9, false))
            .child(scored("Z", 0.0, false)),
    ));
    let (mut a, mut b) = (0, 0);
    for seed in 0..200 {
        match selected_leaf(&lib, seed).as_str() {
            "A" => a += 1,
            "B" => b += 1,
            other => panic!("seed {seed} selected {other}"),
        }
    }
    assert!(a > 0, "A never selected");
    assert!(b > 4 * a, "A: {a}, B: {b}");
}

#[test]
fn random_selection_skips_children_that_cannot_enter() {
    let lib = compile(TreeDefinition::new(
        "Random",
        StateDefinition::new("Root")
            .selection(SelectionBehavior::TrySelectChildrenAtRandom)
            .child(scored("A", 0.0, false))
            .child(scored("B", 0.0, true))
            .child(scored("C", 0.0, false)),
    ));
    let picks: Vec<String> = (0..100).map(|seed| selected_leaf(&lib, seed)).collect();
    assert!(!picks.iter().any(|p| p == "B"));
    assert!(picks.iter().any(|p| p == "A"));
    assert!(picks.iter().any(|p| p == "C"));
}

#[test]
fn follow_transitions_takes_the_highest_priority_target() {
    let lib = compile(TreeDefinition::new(
        "Follow",
        StateDefinition::new("Root")
            .child(
                StateDefinition::new("Chooser")
                    .selection(SelectionBehavior::TryFollowTransitions)
                    .transition(
                        TransitionDefinition::on_tick(TransitionTarget::state("X"))
                            .priority(TransitionPriority::Low),
                    )
                    .transition(
                        TransitionDefinition::on_tick(TransitionTarget::state("Y"))
                            .priority(TransitionPriority::High),
                    ),
            )
            .child(StateDefinition::new("X").task(TaskDefinition::run_forever("x")))
            .child(StateDefinition::new("Y").task(TaskDefinition::run_forever("y"))),
    ));
    let mut storage = InstanceStorage::new();
    let mut ctx = ExecutionContext::new(&lib, AssetId(0), &mut storage);
    assert_eq!(ctx.start(None, None), RunStatus::Running);
    let active = ctx.active_state_names();
    assert_eq!(active.last().map(String::as_str), Some("Y"));
    assert!(!active.iter().any(|s| s == "X"));
}

#[test]
fn next_selectable_state_skips_a_blocked_sibling() {
    let lib = compile(TreeDefinition::new(
        "Fallback",
        StateDefinition::new("Root")
            .child(
                StateDefinition::new("A")
                    .task(TaskDefinition::run_for("a", 1, TaskStatus::Succeeded))
                    .transition(TransitionDefinition::on_succeeded(TransitionTarget::NextSelectableState)),
            )
            .child(scored("B", 0.0, true))
            .child(scored("C", 0.0, false)),
    ));
    let mut storage = InstanceStorage::new();
    let mut ctx = ExecutionContext::new(&lib, AssetId(0), &mut storage);
    ctx.start(None, None);
    assert_eq!(ctx.active_state_names(), vec!["Root", "A"]);
    assert_eq!(ctx.tick(0.1), RunStatus::Running);
    assert_eq!(ctx.active_state_names(), vec!["Root", "C"]);
}
