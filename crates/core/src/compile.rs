//! Lowers authoring definitions into compiled, index-addressed trees.
//!
//! States are laid out depth-first. Subtree roots come after the main tree,
//! have no parent, and each gets its own frame entry. Every state owns a
//! frame-relative run of instance slots: `[parameters][event?][tasks...]`,
//! starting where its parent's run ends.

use std::collections::HashMap;

use crate::binding::{CopyBatch, PropertyCopy};
use crate::definition::{
    to_instance, BindingDefinition, ConditionDefinition, ConsiderationDefinition,
    LibraryDefinition, StateDefinition, TaskDefinition, TaskKindDefinition, TransitionDefinition,
    TransitionTarget, TreeDefinition, TriggerDefinition,
};
use crate::error::CompileError;
use crate::event::StateTreeEvent;
use crate::handle::{AssetId, DataHandle, DataSource, StateHandle};
use crate::node::{
    CompactNode, ConditionNode, ConsiderationNode, ExpressionOperand, FunctionKind, NodeKind,
    TaskKind, TaskNode, MAX_EXPRESSION_INDENT,
};
use crate::status::SelectionFallback;
use crate::tree::{
    CompactFrame, CompactState, CompactTransition, NodeRange, StateTree, StateType, TreeLibrary,
    TransitionTrigger, MAX_STATES, MAX_TASKS_PER_GROUP,
};
use crate::value::InstanceStruct;

impl TreeLibrary {
    /// Compiles every tree of `defs`. Trees may link each other by name;
    /// asset ids follow definition order.
    pub fn compile(defs: &LibraryDefinition) -> Result<TreeLibrary, CompileError> {
        let mut assets = HashMap::new();
        for (i, tree) in defs.trees.iter().enumerate() {
            if assets.insert(tree.name.as_str(), AssetId(i as u16)).is_some() {
                return Err(CompileError::DuplicateTree(tree.name.clone()));
            }
        }

        let mut trees = Vec::with_capacity(defs.trees.len());
        for tree in &defs.trees {
            trees.push(TreeCompiler::new(tree, defs, &assets).compile()?);
        }
        Ok(TreeLibrary { trees })
    }
}

// ──────────────────────────────────────────────
// Tree compiler
// ──────────────────────────────────────────────

struct FlatState<'d> {
    def: &'d StateDefinition,
    parent: StateHandle,
    depth: usize,
    state_type: StateType,
    /// One past the last state of this state's subtree.
    end: usize,
}

enum BindingOwner {
    Node(usize),
    StateParameters(usize),
}

struct TreeCompiler<'d> {
    def: &'d TreeDefinition,
    library: &'d LibraryDefinition,
    assets: &'d HashMap<&'d str, AssetId>,
    flat: Vec<FlatState<'d>>,
    state_names: HashMap<&'d str, StateHandle>,
    states: Vec<CompactState>,
    nodes: Vec<CompactNode>,
    node_names: HashMap<String, usize>,
    batches: Vec<CopyBatch>,
    transitions: Vec<CompactTransition>,
    delegate_names: Vec<String>,
    external_parameter_names: Vec<String>,
    num_shared: u16,
    pending: Vec<(BindingOwner, &'d [BindingDefinition])>,
}

impl<'d> TreeCompiler<'d> {
    fn new(
        def: &'d TreeDefinition,
        library: &'d LibraryDefinition,
        assets: &'d HashMap<&'d str, AssetId>,
    ) -> Self {
        TreeCompiler {
            def,
            library,
            assets,
            flat: Vec::new(),
            state_names: HashMap::new(),
            states: Vec::new(),
            nodes: Vec::new(),
            node_names: HashMap::new(),
            batches: Vec::new(),
            transitions: Vec::new(),
            delegate_names: Vec::new(),
            external_parameter_names: Vec::new(),
            num_shared: 0,
            pending: Vec::new(),
        }
    }

    fn compile(mut self) -> Result<StateTree, CompileError> {
        let def = self.def;
        self.flatten(&def.root, StateHandle::INVALID, 0, def.root.kind)?;
        for subtree in &def.subtrees {
            self.flatten(subtree, StateHandle::INVALID, 0, StateType::Subtree)?;
        }

        let evaluators = self.compile_evaluators()?;
        let global_tasks = self.compile_tasks(&def.name, &def.global_tasks, None, |i| {
            DataHandle::new(DataSource::GlobalInstanceData, (evaluators.len() + i) as u16)
        })?;

        for index in 0..self.flat.len() {
            let state = self.compile_state(index)?;
            self.states.push(state);
        }

        // Bindings last: property functions append nodes and must not split
        // the contiguous node ranges above.
        let pending = std::mem::take(&mut self.pending);
        for (owner, bindings) in pending {
            self.compile_bindings(owner, bindings)?;
        }

        let global_flags = self.task_flags(global_tasks);
        let frames = self
            .states
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.parent.is_valid())
            .map(|(i, _)| CompactFrame {
                root_state: StateHandle::new(i as u16),
                owns_global_tasks: i == 0,
                global_completion_mask: if i == 0 { global_flags.completion_mask } else { 0 },
            })
            .collect();

        Ok(StateTree {
            name: def.name.clone(),
            schema: def.schema.clone(),
            states: self.states,
            transitions: self.transitions,
            nodes: self.nodes,
            batches: self.batches,
            frames,
            evaluators,
            global_tasks,
            default_parameters: to_instance(&def.parameters),
            context_data: def.context_data.clone(),
            external_data: def.external_data.clone(),
            external_parameter_names: self.external_parameter_names,
            delegate_names: self.delegate_names,
            num_global_instances: (evaluators.len() + global_tasks.len()) as u16,
            num_shared_instances: self.num_shared,
            scheduled_tick_allowed: def.scheduled_tick_allowed,
            has_global_transition_tasks: global_flags.transition_tasks,
            has_global_tick_tasks: global_flags.tick_tasks,
            has_global_tick_on_event_tasks: global_flags.tick_on_event_tasks,
            global_task_completion: def.global_task_completion,
        })
    }

    fn flatten(
        &mut self,
        def: &'d StateDefinition,
        parent: StateHandle,
        depth: usize,
        state_type: StateType,
    ) -> Result<(), CompileError> {
        if depth >= MAX_STATES {
            return Err(CompileError::TooDeep {
                tree: self.def.name.clone(),
                state: def.name.clone(),
                max: MAX_STATES,
            });
        }
        if self.flat.len() >= StateHandle::STOPPED_INDEX as usize {
            return Err(CompileError::TooManyStates {
                tree: self.def.name.clone(),
            });
        }

        let index = self.flat.len();
        let handle = StateHandle::new(index as u16);
        if self.state_names.insert(def.name.as_str(), handle).is_some() {
            return Err(self.duplicate("state", &def.name));
        }

        // Only the subtree list produces parentless roots.
        let state_type = match state_type {
            StateType::Subtree if parent.is_valid() => StateType::Group,
            other => other,
        };
        self.flat.push(FlatState {
            def,
            parent,
            depth,
            state_type,
            end: index + 1,
        });
        for child in &def.children {
            self.flatten(child, handle, depth + 1, child.kind)?;
        }
        self.flat[index].end = self.flat.len();
        Ok(())
    }

    // ── Nodes ─────────────────────────────────

    fn register_node(&mut self, name: &str, node: CompactNode) -> Result<usize, CompileError> {
        let index = self.nodes.len();
        if !name.is_empty() && self.node_names.insert(name.to_owned(), index).is_some() {
            return Err(self.duplicate("node", name));
        }
        self.nodes.push(node);
        Ok(index)
    }

    fn shared_handle(&mut self) -> DataHandle {
        let handle = DataHandle::new(DataSource::SharedInstanceData, self.num_shared);
        self.num_shared += 1;
        handle
    }

    fn compile_evaluators(&mut self) -> Result<NodeRange, CompileError> {
        let begin = self.nodes.len();
        let defs = &self.def.evaluators;
        for (i, eval) in defs.iter().enumerate() {
            let kind = NodeKind::Evaluator(eval.kind.clone());
            let mut template = kind.default_fields();
            template.apply_named(&to_instance(&eval.fields));
            let index = self.register_node(
                &eval.name,
                CompactNode {
                    name: eval.name.clone(),
                    kind,
                    instance: DataHandle::new(DataSource::GlobalInstanceData, i as u16),
                    template,
                    bindings: None,
                },
            )?;
            self.pending.push((BindingOwner::Node(index), &eval.bindings));
        }
        Ok(NodeRange::new(begin, defs.len()))
    }

    fn compile_tasks(
        &mut self,
        owner: &str,
        defs: &'d [TaskDefinition],
        owner_state: Option<usize>,
        instance: impl Fn(usize) -> DataHandle,
    ) -> Result<NodeRange, CompileError> {
        if defs.len() > MAX_TASKS_PER_GROUP {
            return Err(CompileError::TooManyTasks {
                tree: self.def.name.clone(),
                owner: owner.to_owned(),
                max: MAX_TASKS_PER_GROUP,
            });
        }
        let begin = self.nodes.len();
        for (i, task) in defs.iter().enumerate() {
            let task_kind = self.resolve_task_kind(&task.kind, owner_state)?;
            let mut flags = task.flags;
            // Transition requests are only honored from TriggerTransitions.
            if matches!(task_kind, TaskKind::RequestTransition { .. }) {
                flags.affects_transitions = true;
            }
            let kind = NodeKind::Task(TaskNode {
                kind: task_kind,
                flags,
            });
            let mut template = kind.default_fields();
            template.apply_named(&to_instance(&task.fields));
            let index = self.register_node(
                &task.name,
                CompactNode {
                    name: task.name.clone(),
                    kind,
                    instance: instance(i),
                    template,
                    bindings: None,
                },
            )?;
            self.pending.push((BindingOwner::Node(index), &task.bindings));
        }
        Ok(NodeRange::new(begin, defs.len()))
    }

    fn resolve_task_kind(
        &mut self,
        kind: &TaskKindDefinition,
        owner_state: Option<usize>,
    ) -> Result<TaskKind, CompileError> {
        Ok(match kind {
            TaskKindDefinition::Run {
                enter_status,
                ticks,
                complete_with,
            } => TaskKind::Run {
                enter_status: *enter_status,
                ticks: *ticks,
                complete_with: *complete_with,
            },
            TaskKindDefinition::Delay { duration } => TaskKind::Delay {
                duration: *duration,
            },
            TaskKindDefinition::SendEvent { tag, payload, on } => TaskKind::SendEvent {
                tag: tag.clone(),
                payload: payload.clone(),
                on: *on,
            },
            TaskKindDefinition::RequestTransition { target, priority } => {
                let (target, fallback) = self.resolve_target(target, owner_state)?;
                TaskKind::RequestTransition {
                    target,
                    priority: *priority,
                    fallback,
                }
            }
            TaskKindDefinition::StopTree { status, on } => TaskKind::StopTree {
                status: *status,
                on: *on,
            },
            TaskKindDefinition::BroadcastDelegate { dispatcher, on } => {
                TaskKind::BroadcastDelegate {
                    dispatcher: self.intern_delegate(dispatcher),
                    on: *on,
                }
            }
            TaskKindDefinition::ListenDelegate {
                dispatcher,
                finish_with,
            } => TaskKind::ListenDelegate {
                dispatcher: self.intern_delegate(dispatcher),
                finish_with: *finish_with,
            },
        })
    }

    fn compile_conditions(
        &mut self,
        owner: &str,
        defs: &'d [ConditionDefinition],
    ) -> Result<NodeRange, CompileError> {
        let indents: Vec<u8> = defs.iter().map(|c| c.indent).collect();
        let deltas = self.expression_deltas(owner, &indents)?;
        let begin = self.nodes.len();
        for (i, cond) in defs.iter().enumerate() {
            let kind = NodeKind::Condition(ConditionNode {
                kind: cond.kind.clone(),
                operand: if i == 0 {
                    ExpressionOperand::Copy
                } else {
                    cond.operand
                },
                delta_indent: deltas[i],
                evaluation_mode: cond.mode,
                invert: cond.invert,
                state_change_events: cond.state_change_events,
                state_change_on_reselect: cond.state_change_on_reselect,
            });
            let mut template = kind.default_fields();
            template.apply_named(&to_instance(&cond.fields));
            let instance = self.shared_handle();
            let index = self.register_node(
                &cond.name,
                CompactNode {
                    name: cond.name.clone(),
                    kind,
                    instance,
                    template,
                    bindings: None,
                },
            )?;
            self.pending.push((BindingOwner::Node(index), &cond.bindings));
        }
        Ok(NodeRange::new(begin, defs.len()))
    }

    fn compile_considerations(
        &mut self,
        owner: &str,
        defs: &'d [ConsiderationDefinition],
    ) -> Result<NodeRange, CompileError> {
        let indents: Vec<u8> = defs.iter().map(|c| c.indent).collect();
        let deltas = self.expression_deltas(owner, &indents)?;
        let begin = self.nodes.len();
        for (i, cons) in defs.iter().enumerate() {
            let kind = NodeKind::Consideration(ConsiderationNode {
                kind: cons.kind,
                operand: if i == 0 {
                    ExpressionOperand::Copy
                } else {
                    cons.operand
                },
                delta_indent: deltas[i],
            });
            let mut template = kind.default_fields();
            template.apply_named(&to_instance(&cons.fields));
            let instance = self.shared_handle();
            let index = self.register_node(
                &cons.name,
                CompactNode {
                    name: cons.name.clone(),
                    kind,
                    instance,
                    template,
                    bindings: None,
                },
            )?;
            self.pending.push((BindingOwner::Node(index), &cons.bindings));
        }
        Ok(NodeRange::new(begin, defs.len()))
    }

    /// Each item stores how nesting changes after it; the last closes back to zero.
    fn expression_deltas(&self, owner: &str, indents: &[u8]) -> Result<Vec<i8>, CompileError> {
        if let Some(bad) = indents
            .iter()
            .copied()
            .find(|i| *i as usize > MAX_EXPRESSION_INDENT)
        {
            return Err(CompileError::BadIndent {
                tree: self.def.name.clone(),
                owner: owner.to_owned(),
                indent: bad,
                max: MAX_EXPRESSION_INDENT,
            });
        }
        Ok(indents
            .iter()
            .enumerate()
            .map(|(i, current)| {
                let next = indents.get(i + 1).copied().unwrap_or(0);
                next as i8 - *current as i8
            })
            .collect())
    }

    // ── States ────────────────────────────────

    fn compile_state(&mut self, index: usize) -> Result<CompactState, CompileError> {
        let flat = &self.flat[index];
        let def = flat.def;
        let parent = flat.parent;
        let depth = flat.depth;
        let state_type = flat.state_type;
        let end = flat.end;
        let handle = StateHandle::new(index as u16);

        let instance_begin = match self.states.get(parent.index()) {
            Some(p) if parent.is_valid() => p.instance_begin + p.instance_num,
            _ => 0,
        };
        let has_event_slot = def.required_event.is_some();
        let task_base = instance_begin + 1 + u16::from(has_event_slot);
        let instance_num = 1 + u16::from(has_event_slot) + def.tasks.len() as u16;

        let tasks = self.compile_tasks(&def.name, &def.tasks, Some(index), |i| {
            DataHandle::for_state(DataSource::ActiveInstanceData, task_base + i as u16, handle)
        })?;
        let enter_conditions = self.compile_conditions(&def.name, &def.enter_conditions)?;
        let considerations = self.compile_considerations(&def.name, &def.considerations)?;

        let transitions_begin = self.transitions.len();
        for transition in &def.transitions {
            let compiled = self.compile_transition(index, transition)?;
            self.transitions.push(compiled);
        }
        let transitions = NodeRange::new(transitions_begin, def.transitions.len());

        let (linked_state, linked_asset, parameter_template) = self.resolve_link(def, state_type)?;

        let parameter_source = if state_type == StateType::Subtree {
            DataSource::SubtreeParameterData
        } else {
            DataSource::StateParameterData
        };

        let flags = self.task_flags(tasks);
        let compiled_transitions = &self.transitions[transitions.range()];
        let enabled_transitions = || compiled_transitions.iter().filter(|t| t.enabled);
        let has_state_change_conditions = self.nodes[enter_conditions.range()].iter().any(|n| {
            n.kind
                .as_condition()
                .is_some_and(|c| c.state_change_events)
        });

        if !def.parameter_bindings.is_empty() {
            self.pending
                .push((BindingOwner::StateParameters(index), &def.parameter_bindings));
        }

        Ok(CompactState {
            name: def.name.clone(),
            tag: def.tag.clone(),
            parent,
            children_begin: (index + 1) as u16,
            children_end: end as u16,
            next_sibling: end as u16,
            depth: depth as u8,
            state_type,
            selection_behavior: def.selection,
            enabled: def.enabled,
            tasks,
            enter_conditions,
            considerations,
            transitions,
            weight: def.weight,
            linked_state,
            linked_asset,
            parameter_template,
            parameter_handle: DataHandle::for_state(parameter_source, instance_begin, handle),
            parameter_bindings: None,
            event_handle: if has_event_slot {
                DataHandle::for_state(DataSource::StateEvent, instance_begin + 1, handle)
            } else {
                DataHandle::NONE
            },
            required_event: def.required_event.clone(),
            check_prerequisites_when_activating_child_directly: def
                .check_prerequisites_when_activating_child_directly,
            consume_event_on_select: def.consume_event_on_select,
            instance_begin,
            instance_num,
            custom_tick_rate: def.custom_tick_rate,
            task_completion: def.task_completion,
            completion_mask: flags.completion_mask,
            has_transition_tasks: flags.transition_tasks,
            has_state_change_conditions,
            has_tick_tasks: flags.tick_tasks,
            has_tick_on_event_tasks: flags.tick_on_event_tasks,
            has_tick_transitions: enabled_transitions()
                .any(|t| t.trigger.contains(TransitionTrigger::ON_TICK)),
            has_event_transitions: enabled_transitions()
                .any(|t| t.trigger.contains(TransitionTrigger::ON_EVENT)),
            has_delegate_transitions: enabled_transitions()
                .any(|t| t.trigger.contains(TransitionTrigger::ON_DELEGATE)),
            has_succeeded_transitions: enabled_transitions()
                .any(|t| t.trigger.contains(TransitionTrigger::ON_STATE_SUCCEEDED)),
            has_failed_transitions: enabled_transitions()
                .any(|t| t.trigger.contains(TransitionTrigger::ON_STATE_FAILED)),
            has_completed_transitions: enabled_transitions()
                .any(|t| t.trigger == TransitionTrigger::ON_STATE_COMPLETED),
        })
    }

    fn resolve_link(
        &self,
        def: &StateDefinition,
        state_type: StateType,
    ) -> Result<(StateHandle, Option<AssetId>, InstanceStruct), CompileError> {
        let own = to_instance(&def.parameters);
        match state_type {
            StateType::Linked => {
                let name = def.linked_subtree.as_deref().ok_or_else(|| {
                    CompileError::MissingLinkTarget {
                        tree: self.def.name.clone(),
                        state: def.name.clone(),
                    }
                })?;
                let target = self
                    .state_names
                    .get(name)
                    .copied()
                    .filter(|h| self.flat[h.index()].state_type == StateType::Subtree)
                    .ok_or_else(|| CompileError::UnknownSubtree {
                        tree: self.def.name.clone(),
                        state: def.name.clone(),
                        subtree: name.to_owned(),
                    })?;
                // Same layout as the subtree root's parameters, which read them.
                let mut params = to_instance(&self.flat[target.index()].def.parameters);
                params.apply_overrides(&own);
                Ok((target, None, params))
            }
            StateType::LinkedAsset => {
                let name = def.linked_asset.as_deref().ok_or_else(|| {
                    CompileError::MissingLinkTarget {
                        tree: self.def.name.clone(),
                        state: def.name.clone(),
                    }
                })?;
                let asset = self.assets.get(name).copied().ok_or_else(|| {
                    CompileError::UnknownAsset {
                        tree: self.def.name.clone(),
                        state: def.name.clone(),
                        asset: name.to_owned(),
                    }
                })?;
                let mut params = to_instance(&self.library.trees[asset.index()].parameters);
                params.apply_overrides(&own);
                Ok((StateHandle::INVALID, Some(asset), params))
            }
            _ => Ok((StateHandle::INVALID, None, own)),
        }
    }

    fn compile_transition(
        &mut self,
        owner: usize,
        def: &'d TransitionDefinition,
    ) -> Result<CompactTransition, CompileError> {
        let trigger = match def.trigger {
            TriggerDefinition::OnStateSucceeded => TransitionTrigger::ON_STATE_SUCCEEDED,
            TriggerDefinition::OnStateFailed => TransitionTrigger::ON_STATE_FAILED,
            TriggerDefinition::OnStateCompleted => TransitionTrigger::ON_STATE_COMPLETED,
            TriggerDefinition::OnTick => TransitionTrigger::ON_TICK,
            TriggerDefinition::OnEvent => TransitionTrigger::ON_EVENT,
            TriggerDefinition::OnDelegate => TransitionTrigger::ON_DELEGATE,
        };
        let (target, fallback) = self.resolve_target(&def.target, Some(owner))?;
        let owner_name = self.flat[owner].def.name.clone();
        let conditions = self.compile_conditions(&owner_name, &def.conditions)?;
        let required_delegate = def.delegate.as_deref().map(|d| self.intern_delegate(d));
        Ok(CompactTransition {
            trigger,
            target,
            fallback,
            priority: def.priority,
            delay: def.delay,
            required_event: def.event.clone().unwrap_or_default(),
            required_delegate,
            conditions,
            consume_event_on_select: def.consume_event,
            enabled: def.enabled,
        })
    }

    fn resolve_target(
        &self,
        target: &TransitionTarget,
        owner: Option<usize>,
    ) -> Result<(StateHandle, SelectionFallback), CompileError> {
        let owner_name = || {
            owner
                .map(|i| self.flat[i].def.name.clone())
                .unwrap_or_else(|| self.def.name.clone())
        };
        match target {
            TransitionTarget::GotoState(name) => self
                .state_names
                .get(name.as_str())
                .map(|h| (*h, SelectionFallback::None))
                .ok_or_else(|| CompileError::UnknownState {
                    tree: self.def.name.clone(),
                    from: owner_name(),
                    target: name.clone(),
                }),
            TransitionTarget::NextState | TransitionTarget::NextSelectableState => {
                let next = owner.and_then(|i| {
                    let flat = &self.flat[i];
                    let parent = self.flat.get(flat.parent.index()).filter(|_| flat.parent.is_valid())?;
                    (flat.end < parent.end).then(|| StateHandle::new(flat.end as u16))
                });
                let next = next.ok_or_else(|| CompileError::NoNextState {
                    tree: self.def.name.clone(),
                    state: owner_name(),
                })?;
                let fallback = if matches!(target, TransitionTarget::NextSelectableState) {
                    SelectionFallback::NextSelectableSibling
                } else {
                    SelectionFallback::None
                };
                Ok((next, fallback))
            }
            TransitionTarget::Succeeded => Ok((StateHandle::SUCCEEDED, SelectionFallback::None)),
            TransitionTarget::Failed => Ok((StateHandle::FAILED, SelectionFallback::None)),
            TransitionTarget::Stopped => Ok((StateHandle::STOPPED, SelectionFallback::None)),
            TransitionTarget::None => Ok((StateHandle::INVALID, SelectionFallback::None)),
        }
    }

    fn intern_delegate(&mut self, name: &str) -> u16 {
        intern(&mut self.delegate_names, name)
    }

    fn task_flags(&self, tasks: NodeRange) -> TaskGroupFlags {
        let mut flags = TaskGroupFlags::default();
        for (slot, node) in self.nodes[tasks.range()].iter().enumerate() {
            let Some(task) = node.kind.as_task() else {
                continue;
            };
            if !task.flags.enabled {
                continue;
            }
            if task.flags.considered_for_completion {
                flags.completion_mask |= 1 << slot;
            }
            flags.transition_tasks |= task.flags.affects_transitions;
            flags.tick_tasks |= task.flags.should_call_tick;
            flags.tick_on_event_tasks |= task.flags.tick_only_on_events;
        }
        flags
    }

    // ── Bindings ──────────────────────────────

    fn compile_bindings(
        &mut self,
        owner: BindingOwner,
        bindings: &[BindingDefinition],
    ) -> Result<(), CompileError> {
        if bindings.is_empty() {
            return Ok(());
        }
        let (owner_name, template) = match owner {
            BindingOwner::Node(i) => (self.nodes[i].name.clone(), self.nodes[i].template.clone()),
            BindingOwner::StateParameters(i) => (
                self.states[i].name.clone(),
                self.states[i].parameter_template.clone(),
            ),
        };

        let mut batch = CopyBatch::default();
        for binding in bindings {
            let target_property =
                template
                    .index_of(&binding.target)
                    .ok_or_else(|| CompileError::UnknownField {
                        tree: self.def.name.clone(),
                        owner: owner_name.clone(),
                        field: binding.target.clone(),
                    })? as u16;
            let (mut source, mut source_property) =
                self.resolve_source(&owner_name, &binding.source)?;
            if let Some(function) = binding.function {
                let node = self.add_function(&owner_name, &binding.target, function, source, source_property);
                batch.functions.push(node as u16);
                source = self.nodes[node].instance;
                source_property = FUNCTION_OUTPUT;
            }
            batch.copies.push(PropertyCopy {
                source,
                source_property,
                target_property,
            });
        }

        let index = self.batches.len() as u16;
        self.batches.push(batch);
        match owner {
            BindingOwner::Node(i) => self.nodes[i].bindings = Some(index),
            BindingOwner::StateParameters(i) => self.states[i].parameter_bindings = Some(index),
        }
        Ok(())
    }

    fn add_function(
        &mut self,
        owner: &str,
        target: &str,
        function: FunctionKind,
        source: DataHandle,
        source_property: u16,
    ) -> usize {
        let kind = NodeKind::Function(function);
        let template = kind.default_fields();
        let input = self.batches.len() as u16;
        self.batches.push(CopyBatch {
            copies: vec![PropertyCopy {
                source,
                source_property,
                target_property: FUNCTION_INPUT,
            }],
            functions: Vec::new(),
        });
        let instance = self.shared_handle();
        self.nodes.push(CompactNode {
            name: format!("{}.{}", owner, target),
            kind,
            instance,
            template,
            bindings: Some(input),
        });
        self.nodes.len() - 1
    }

    fn resolve_source(&mut self, owner: &str, path: &str) -> Result<(DataHandle, u16), CompileError> {
        let unknown = || CompileError::UnknownBindingSource {
            tree: self.def.name.clone(),
            owner: owner.to_owned(),
            path: path.to_owned(),
        };
        let parts: Vec<&str> = path.split('.').collect();
        let field_of = |fields: &[String], field: &str| fields.iter().position(|f| f == field);

        let resolved = match parts.as_slice() {
            ["Context", data, field] => self
                .def
                .context_data
                .iter()
                .position(|d| d.name == *data)
                .and_then(|i| {
                    field_of(&self.def.context_data[i].fields, field)
                        .map(|f| (DataHandle::new(DataSource::ContextData, i as u16), f as u16))
                }),
            ["External", data, field] => self
                .def
                .external_data
                .iter()
                .position(|d| d.name == *data)
                .and_then(|i| {
                    field_of(&self.def.external_data[i].fields, field)
                        .map(|f| (DataHandle::new(DataSource::ExternalData, i as u16), f as u16))
                }),
            ["Params", field] => to_instance(&self.def.parameters)
                .index_of(field)
                .map(|f| (DataHandle::GLOBAL_PARAMETERS, f as u16)),
            ["StateParams", state, field] => self.state_names.get(state).and_then(|h| {
                let s = &self.states[h.index()];
                s.parameter_template
                    .index_of(field)
                    .map(|f| (s.parameter_handle, f as u16))
            }),
            ["Event", property] => StateTreeEvent::property_index(property)
                .map(|p| (DataHandle::new(DataSource::TransitionEvent, 0), p)),
            ["StateEvent", state, property] => self.state_names.get(state).and_then(|h| {
                let s = &self.states[h.index()];
                let p = StateTreeEvent::property_index(property)?;
                s.event_handle.is_valid().then_some((s.event_handle, p))
            }),
            ["ExternalParam", name] => {
                let index = intern(&mut self.external_parameter_names, name);
                Some((
                    DataHandle::new(DataSource::ExternalGlobalParameterData, index),
                    0,
                ))
            }
            ["Node", name, field] => self.node_names.get(*name).and_then(|i| {
                let node = &self.nodes[*i];
                node.template
                    .index_of(field)
                    .map(|f| (node.instance, f as u16))
            }),
            _ => None,
        };
        resolved.ok_or_else(unknown)
    }

    fn duplicate(&self, kind: &'static str, name: &str) -> CompileError {
        CompileError::DuplicateName {
            tree: self.def.name.clone(),
            kind,
            name: name.to_owned(),
        }
    }
}

/// Field positions of the `input`/`output` pair every property function carries.
const FUNCTION_INPUT: u16 = 0;
const FUNCTION_OUTPUT: u16 = 1;

#[derive(Default)]
struct TaskGroupFlags {
    completion_mask: u32,
    transition_tasks: bool,
    tick_tasks: bool,
    tick_on_event_tasks: bool,
}

fn intern(names: &mut Vec<String>, name: &str) -> u16 {
    match names.iter().position(|n| n == name) {
        Some(i) => i as u16,
        None => {
            names.push(name.to_owned());
            (names.len() - 1) as u16
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{ConditionDefinition, TransitionDefinition};
    use crate::node::ConditionKind;
    use crate::status::TaskStatus;

    fn compile_one(tree: TreeDefinition) -> StateTree {
        let lib = TreeLibrary::compile(&LibraryDefinition::single(tree)).unwrap();
        lib.trees.into_iter().next().unwrap()
    }

    fn sample() -> TreeDefinition {
        TreeDefinition::new(
            "Sample",
            StateDefinition::new("Root")
                .child(
                    StateDefinition::new("A")
                        .task(TaskDefinition::run_forever("a1"))
                        .task(TaskDefinition::run_forever("a2"))
                        .child(StateDefinition::new("A1").task(TaskDefinition::run_forever("a11")))
                        .transition(TransitionDefinition::on_tick(TransitionTarget::NextState)),
                )
                .child(StateDefinition::new("B")),
        )
        .subtree(StateDefinition::new("Sub").task(TaskDefinition::run_forever("s1")))
    }

    #[test]
    fn states_are_depth_first_with_sibling_links() {
        let tree = compile_one(sample());
        let names: Vec<&str> = tree.states.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["Root", "A", "A1", "B", "Sub"]);
        assert_eq!(tree.states[1].next_sibling, 3);
        assert_eq!(
            tree.children(StateHandle::ROOT),
            vec![StateHandle::new(1), StateHandle::new(3)]
        );
        assert_eq!(tree.states[2].depth, 2);
    }

    #[test]
    fn subtree_roots_are_parentless_frames() {
        let tree = compile_one(sample());
        let sub = &tree.states[4];
        assert_eq!(sub.state_type, StateType::Subtree);
        assert!(!sub.parent.is_valid());
        assert_eq!(sub.depth, 0);
        assert_eq!(sub.parameter_handle.source, DataSource::SubtreeParameterData);
        let roots: Vec<u16> = tree.frames.iter().map(|f| f.root_state.raw()).collect();
        assert_eq!(roots, [0, 4]);
        assert!(tree.frames[0].owns_global_tasks);
        assert!(!tree.frames[1].owns_global_tasks);
    }

    #[test]
    fn instance_slots_follow_parent_run() {
        let tree = compile_one(sample());
        // Root: [params]; A: [params][a1][a2]; A1: [params][a11]
        assert_eq!(tree.states[0].instance_begin, 0);
        assert_eq!(tree.states[0].instance_num, 1);
        assert_eq!(tree.states[1].instance_begin, 1);
        assert_eq!(tree.states[1].instance_num, 3);
        assert_eq!(tree.states[2].instance_begin, 4);
        let a2 = &tree.nodes[tree.states[1].tasks.begin as usize + 1];
        assert_eq!(a2.instance.source, DataSource::ActiveInstanceData);
        assert_eq!(a2.instance.index, 3);
        assert_eq!(tree.states[4].instance_begin, 0);
    }

    #[test]
    fn next_state_resolves_to_sibling() {
        let tree = compile_one(sample());
        let t = &tree.transitions[tree.states[1].transitions.begin as usize];
        assert_eq!(t.target, StateHandle::new(3));
        assert!(tree.states[1].has_tick_transitions);
    }

    #[test]
    fn next_state_without_sibling_is_an_error() {
        let def = TreeDefinition::new(
            "T",
            StateDefinition::new("Root").child(
                StateDefinition::new("Only")
                    .transition(TransitionDefinition::on_tick(TransitionTarget::NextState)),
            ),
        );
        let err = TreeLibrary::compile(&LibraryDefinition::single(def)).unwrap_err();
        assert!(matches!(err, CompileError::NoNextState { .. }));
    }

    #[test]
    fn unknown_goto_target_is_an_error() {
        let def = TreeDefinition::new(
            "T",
            StateDefinition::new("Root")
                .transition(TransitionDefinition::on_tick(TransitionTarget::state("Nope"))),
        );
        let err = TreeLibrary::compile(&LibraryDefinition::single(def)).unwrap_err();
        assert!(matches!(err, CompileError::UnknownState { .. }));
    }

    #[test]
    fn condition_indents_become_deltas() {
        let def = TreeDefinition::new(
            "T",
            StateDefinition::new("Root")
                .enter_condition(ConditionDefinition::always(true))
                .enter_condition(ConditionDefinition::always(true).indent(1))
                .enter_condition(ConditionDefinition::always(false).indent(1)),
        );
        let tree = compile_one(def);
        let deltas: Vec<(ExpressionOperand, i8)> = tree.nodes
            [tree.states[0].enter_conditions.range()]
        .iter()
        .map(|n| {
            let c = n.kind.as_condition().unwrap();
            (c.operand, c.delta_indent)
        })
        .collect();
        assert_eq!(
            deltas,
            [
                (ExpressionOperand::Copy, 1),
                (ExpressionOperand::And, 0),
                (ExpressionOperand::And, -1)
            ]
        );
    }

    #[test]
    fn indent_beyond_stack_is_rejected() {
        let def = TreeDefinition::new(
            "T",
            StateDefinition::new("Root").enter_condition(ConditionDefinition::always(true).indent(5)),
        );
        let err = TreeLibrary::compile(&LibraryDefinition::single(def)).unwrap_err();
        assert!(matches!(err, CompileError::BadIndent { indent: 5, .. }));
    }

    #[test]
    fn bindings_with_functions_append_nodes() {
        let def = TreeDefinition::new(
            "T",
            StateDefinition::new("Root").enter_condition(
                ConditionDefinition::new(ConditionKind::IsTrue)
                    .binding(BindingDefinition::new("value", "Params.flag").through(FunctionKind::Not)),
            ),
        )
        .parameter("flag", false);
        let tree = compile_one(def);
        let cond = &tree.nodes[tree.states[0].enter_conditions.begin as usize];
        let batch = tree.batch(cond.bindings).unwrap();
        assert_eq!(batch.functions.len(), 1);
        let function = &tree.nodes[batch.functions[0] as usize];
        assert!(matches!(function.kind, NodeKind::Function(FunctionKind::Not)));
        assert_eq!(batch.copies[0].source, function.instance);
        assert_eq!(tree.num_shared_instances, 2);
    }

    #[test]
    fn unknown_binding_source_is_an_error() {
        let def = TreeDefinition::new(
            "T",
            StateDefinition::new("Root")
                .task(TaskDefinition::run_forever("t").binding(BindingDefinition::new("ticks", "Params.missing"))),
        );
        let err = TreeLibrary::compile(&LibraryDefinition::single(def)).unwrap_err();
        assert!(matches!(err, CompileError::UnknownBindingSource { .. }));
    }

    #[test]
    fn linked_asset_takes_target_parameter_layout() {
        let child = TreeDefinition::new("Child", StateDefinition::new("CRoot"))
            .parameter("speed", 1.0f64)
            .parameter("armed", false);
        let parent = TreeDefinition::new(
            "Parent",
            StateDefinition::new("Root")
                .child(StateDefinition::linked_asset("Use", "Child").parameter("speed", 4.0f64)),
        );
        let lib = TreeLibrary::compile(&LibraryDefinition {
            trees: vec![parent, child],
        })
        .unwrap();
        let use_state = &lib.trees[0].states[1];
        assert_eq!(use_state.linked_asset, Some(AssetId(1)));
        assert_eq!(
            use_state.parameter_template,
            lib.trees[1].default_parameters.clone().with("speed", 4.0f64)
        );
    }

    #[test]
    fn completion_mask_skips_background_tasks() {
        let mut background = TaskDefinition::run_for("bg", 1, TaskStatus::Succeeded);
        background.flags.considered_for_completion = false;
        let def = TreeDefinition::new(
            "T",
            StateDefinition::new("Root")
                .task(TaskDefinition::run_forever("main"))
                .task(background),
        );
        let tree = compile_one(def);
        assert_eq!(tree.states[0].completion_mask, 0b01);
    }
}
