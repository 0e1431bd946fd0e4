//! Linked subtrees and linked assets: frame stacking, overrides and
//! completion propagation into the linking state.

use statetree_core::{
    AssetId, InstanceStruct, LibraryDefinition, RunStatus, StateDefinition, TaskDefinition,
    TaskStatus, TransitionDefinition, TransitionTarget, TreeDefinition, TreeLibrary,
};
use statetree_eval::trace::node_calls;
use statetree_eval::{
    ExecutionConfig, ExecutionContext, InstanceStorage, LinkedOverride, NodeCall, TraceEvent,
};

fn library(trees: Vec<TreeDefinition>) -> TreeLibrary {
    TreeLibrary::compile(&LibraryDefinition { trees }).unwrap()
}

fn guard_library() -> TreeLibrary {
    let main = TreeDefinition::new(
        "Guard",
        StateDefinition::new("Root")
            .child(
                StateDefinition::linked_asset("Behavior", "Idle")
                    .tag("Slot.Behavior")
                    .transition(TransitionDefinition::on_completed(TransitionTarget::state("Rest"))),
            )
            .child(StateDefinition::new("Rest").task(TaskDefinition::run_forever("rest"))),
    );
    let idle = TreeDefinition::new(
        "Idle",
        StateDefinition::new("IdleRoot").task(TaskDefinition::run_forever("idle")),
    );
    let patrol = TreeDefinition::new(
        "Patrol",
        StateDefinition::new("PatrolRoot")
            .task(TaskDefinition::run_for("walk", 2, TaskStatus::Succeeded))
            .transition(TransitionDefinition::on_succeeded(TransitionTarget::Succeeded)),
    )
    .parameter("speed", 1.0);
    library(vec![main, idle, patrol])
}

// ──────────────────────────────────────────────
// Linked assets
// ──────────────────────────────────────────────

#[test]
fn override_by_tag_enters_the_replacement_asset() {
    let lib = guard_library();
    let patrol = lib.find("Patrol").unwrap();
    let mut storage = InstanceStorage::new();
    let mut ctx = ExecutionContext::new(&lib, AssetId(0), &mut storage);
    ctx.set_linked_overrides([(
        "Slot.Behavior".to_owned(),
        LinkedOverride::new(patrol).with_parameters(InstanceStruct::new().with("speed", 3.0)),
    )])
    .unwrap();

    assert_eq!(ctx.start(None, None), RunStatus::Running);
    assert_eq!(ctx.active_state_names(), vec!["Root", "Behavior", "PatrolRoot"]);
    let frames = ctx.active_frames();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[1].tree, patrol);
    assert!(frames[1].is_global_frame);
}

#[test]
fn asset_completion_feeds_the_linking_state_transitions() {
    let lib = guard_library();
    let patrol = lib.find("Patrol").unwrap();
    let mut storage = InstanceStorage::new();
    let mut ctx = ExecutionContext::new(&lib, AssetId(0), &mut storage);
    ctx.set_linked_overrides([("Slot.Behavior".to_owned(), LinkedOverride::new(patrol))])
        .unwrap();
    ctx.start(None, None);

    ctx.tick(0.1);
    assert_eq!(ctx.active_state_names(), vec!["Root", "Behavior", "PatrolRoot"]);
    ctx.tick(0.1);
    assert_eq!(ctx.run_status(), RunStatus::Running);
    assert_eq!(ctx.active_state_names(), vec!["Root", "Rest"]);
    assert_eq!(ctx.active_frames().len(), 1);
}

#[test]
fn without_override_the_default_asset_runs() {
    let lib = guard_library();
    let mut storage = InstanceStorage::new();
    let mut ctx = ExecutionContext::new(&lib, AssetId(0), &mut storage);
    ctx.start(None, None);
    assert_eq!(ctx.active_state_names(), vec!["Root", "Behavior", "IdleRoot"]);
    assert_eq!(Some(ctx.active_frames()[1].tree), lib.find("Idle"));
}

// ──────────────────────────────────────────────
// Linked subtrees
// ──────────────────────────────────────────────

fn subtree_library(sub_outcome: TaskStatus) -> TreeLibrary {
    library(vec![TreeDefinition::new(
        "Main",
        StateDefinition::new("Root")
            .child(
                StateDefinition::linked("L", "Sub")
                    .transition(TransitionDefinition::on_failed(TransitionTarget::state("F")))
                    .transition(TransitionDefinition::on_succeeded(TransitionTarget::state("S"))),
            )
            .child(StateDefinition::new("F").task(TaskDefinition::run_forever("recover")))
            .child(StateDefinition::new("S").task(TaskDefinition::run_forever("celebrate"))),
    )
    .subtree(StateDefinition::new("SR").task(TaskDefinition::run_for("attempt", 1, sub_outcome)))])
}

#[test]
fn subtree_failure_routes_to_the_failed_transition() {
    let lib = subtree_library(TaskStatus::Failed);
    let mut storage = InstanceStorage::new();
    let mut ctx = ExecutionContext::new(&lib, AssetId(0), &mut storage);
    ctx.start(None, None);
    assert_eq!(ctx.active_state_names(), vec!["Root", "L", "SR"]);
    assert!(!ctx.active_frames()[1].is_global_frame);

    assert_eq!(ctx.tick(0.1), RunStatus::Running);
    assert_eq!(ctx.active_state_names(), vec!["Root", "F"]);
    assert_eq!(ctx.run_status(), RunStatus::Running);
}

#[test]
fn subtree_success_routes_to_the_succeeded_transition() {
    let lib = subtree_library(TaskStatus::Succeeded);
    let mut storage = InstanceStorage::new();
    let mut ctx = ExecutionContext::new(&lib, AssetId(0), &mut storage);
    ctx.start(None, None);
    ctx.tick(0.1);
    assert_eq!(ctx.active_state_names(), vec!["Root", "S"]);
}

#[test]
fn subtree_frames_share_global_instances_in_either_tick_order() {
    for follow_hierarchy in [true, false] {
        let lib = subtree_library(TaskStatus::Failed);
        let config = ExecutionConfig {
            tick_global_nodes_following_tree_hierarchy: follow_hierarchy,
            ..ExecutionConfig::default()
        };
        let mut storage = InstanceStorage::new();
        let mut ctx = ExecutionContext::new(&lib, AssetId(0), &mut storage).with_config(config);
        ctx.start(None, None);
        ctx.tick(0.1);
        assert_eq!(ctx.active_state_names(), vec!["Root", "F"], "hierarchy: {follow_hierarchy}");
    }
}

// ──────────────────────────────────────────────
// Global tick order
// ──────────────────────────────────────────────

fn globals_library() -> TreeLibrary {
    let main = TreeDefinition::new(
        "Outer",
        StateDefinition::new("Root")
            .task(TaskDefinition::run_forever("root"))
            .child(StateDefinition::linked_asset("Use", "Inner")),
    )
    .global_task(TaskDefinition::run_forever("outer_global"));
    let inner = TreeDefinition::new(
        "Inner",
        StateDefinition::new("InnerRoot").task(TaskDefinition::run_forever("inner")),
    )
    .global_task(TaskDefinition::run_forever("inner_global"));
    library(vec![main, inner])
}

fn tick_order(follow_hierarchy: bool) -> Vec<String> {
    let lib = globals_library();
    let config = ExecutionConfig {
        tick_global_nodes_following_tree_hierarchy: follow_hierarchy,
        ..ExecutionConfig::default()
    };
    let mut storage = InstanceStorage::new();
    let mut trace: Vec<TraceEvent> = Vec::new();
    {
        let mut ctx = ExecutionContext::new(&lib, AssetId(0), &mut storage)
            .with_config(config)
            .with_trace(&mut trace);
        ctx.start(None, None);
        assert_eq!(ctx.active_state_names(), vec!["Root", "Use", "InnerRoot"]);
        assert_eq!(ctx.tick(0.1), RunStatus::Running);
    }
    node_calls(&trace, NodeCall::Tick)
        .into_iter()
        .map(str::to_owned)
        .collect()
}

#[test]
fn hierarchy_order_ticks_globals_with_their_frame() {
    assert_eq!(
        tick_order(true),
        vec!["outer_global", "root", "inner_global", "inner"]
    );
}

#[test]
fn flat_order_ticks_every_global_before_any_state() {
    assert_eq!(
        tick_order(false),
        vec!["outer_global", "inner_global", "root", "inner"]
    );
}
