//! Instance data resolution and property copies.

use statetree_core::{
    AssetId, DataHandle, DataSource, InstanceStruct, NodeKind, StateTree, Value,
};

use super::{nodes, ExecutionContext, FrameSet};
use crate::events::SharedEvent;
use crate::frame::{find_frame_index, FrameId, ParameterRef};
use crate::storage::{InstanceSlot, TemporaryInstance};

/// Where the data behind a [`DataHandle`] currently lives.
#[derive(Debug, Clone)]
pub(crate) enum InstanceRef {
    /// Slot in the storage's instance list.
    Slot(usize),
    /// Data of a state that is selected but not entered yet.
    Temporary(usize),
    Shared(AssetId, usize),
    GlobalParameters,
    Context(usize),
    External(usize),
    Event(Option<SharedEvent>),
    Value(Value),
}

/// How missing sources are handled by [`ExecutionContext::copy_batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CopyMode {
    /// Skip properties whose source is unavailable.
    Active,
    /// Fail the whole copy when any source is unavailable.
    Validated,
}

impl<'a> ExecutionContext<'a> {
    pub(crate) fn resolve(&mut self, set: FrameSet, frame_index: usize, handle: DataHandle) -> Option<InstanceRef> {
        let frame = self.frames(set).get(frame_index)?;
        let tree_id = frame.tree;
        let frame_id = frame.frame_id;
        let external_base = frame.external_data_base;
        let global_base = frame.global_instance_base;
        let global_parameters = frame.global_parameters;
        let state_parameters = frame.state_parameters;
        let tree = self.tree(tree_id)?;
        let index = handle.index as usize;

        match handle.source {
            DataSource::None => None,
            DataSource::ContextData => Some(InstanceRef::Context(index)),
            DataSource::ExternalData => external_base.map(|base| InstanceRef::External(base + index)),
            DataSource::GlobalInstanceData => match global_base {
                Some(base) => Some(InstanceRef::Slot(base + index)),
                None => self.temporary(frame_id, tree, handle),
            },
            DataSource::StateEvent => {
                if set == FrameSet::Selection {
                    let depth = tree.state(handle.state)?.depth as usize;
                    let captured = self
                        .selection
                        .events
                        .get(frame_index)
                        .and_then(|events| events.get(depth))
                        .cloned();
                    if captured.is_some() {
                        return Some(InstanceRef::Event(captured));
                    }
                }
                self.resolve_state_slot(set, frame_index, tree, handle)
            }
            DataSource::ActiveInstanceData | DataSource::StateParameterData => {
                self.resolve_state_slot(set, frame_index, tree, handle)
            }
            DataSource::SharedInstanceData => {
                let shared = self.storage.shared_instances(tree_id, tree);
                (index < shared.len()).then_some(InstanceRef::Shared(tree_id, index))
            }
            DataSource::GlobalParameterData => self.resolve_parameters(set, global_parameters),
            DataSource::SubtreeParameterData => self.resolve_parameters(set, state_parameters),
            DataSource::TransitionEvent => Some(InstanceRef::Event(self.transition_event.clone())),
            DataSource::ExternalGlobalParameterData => tree
                .external_parameter_name(handle.index)
                .and_then(|name| self.external_parameters.get(name))
                .map(|value| InstanceRef::Value(value.clone())),
        }
    }

    /// Entered states read their own slots; states still being selected
    /// read temporaries keyed by frame id.
    fn resolve_state_slot(
        &mut self,
        set: FrameSet,
        frame_index: usize,
        tree: &StateTree,
        handle: DataHandle,
    ) -> Option<InstanceRef> {
        let frame = self.frames(set).get(frame_index)?;
        let entered = frame
            .active_states
            .index_of(handle.state)
            .is_some_and(|i| i < frame.num_currently_active_states);
        match (entered, frame.active_instance_base) {
            (true, Some(base)) => Some(InstanceRef::Slot(base + handle.index as usize)),
            _ => {
                let frame_id = frame.frame_id;
                self.temporary(frame_id, tree, handle)
            }
        }
    }

    fn resolve_parameters(&mut self, set: FrameSet, parameters: ParameterRef) -> Option<InstanceRef> {
        match parameters {
            ParameterRef::None => None,
            ParameterRef::Global => Some(InstanceRef::GlobalParameters),
            ParameterRef::Slot { frame, handle } => {
                let (owner_set, owner_index) = find_frame_index(self.frames(set), frame)
                    .map(|i| (set, i))
                    .or_else(|| {
                        find_frame_index(self.frames(FrameSet::Active), frame)
                            .map(|i| (FrameSet::Active, i))
                    })?;
                self.resolve(owner_set, owner_index, handle)
            }
        }
    }

    fn temporary(&mut self, frame_id: FrameId, tree: &StateTree, handle: DataHandle) -> Option<InstanceRef> {
        if let Some(index) = self.storage.find_temporary(frame_id, handle) {
            return Some(InstanceRef::Temporary(index));
        }
        let (owner_node, data) = match handle.source {
            DataSource::StateEvent => (None, InstanceSlot::Event(None)),
            DataSource::StateParameterData | DataSource::SubtreeParameterData => (
                None,
                InstanceSlot::Data(tree.state(handle.state)?.parameter_template.clone()),
            ),
            _ => {
                let node = tree.nodes.iter().position(|n| n.instance == handle)?;
                (
                    Some(node as u16),
                    InstanceSlot::Data(tree.nodes[node].template.clone()),
                )
            }
        };
        self.storage.temporaries.push(TemporaryInstance {
            frame_id,
            handle,
            owner_node,
            data,
        });
        Some(InstanceRef::Temporary(self.storage.temporaries.len() - 1))
    }

    // ── Access ──────────────────────────────

    pub(crate) fn instance(&self, target: &InstanceRef) -> Option<&InstanceStruct> {
        match target {
            InstanceRef::Slot(i) => self.storage.instances.get(*i)?.as_struct(),
            InstanceRef::Temporary(i) => self.storage.temporaries.get(*i)?.data.as_struct(),
            InstanceRef::Shared(asset, i) => self.storage.shared.get(asset)?.get(*i),
            InstanceRef::GlobalParameters => Some(&self.storage.global_parameters),
            InstanceRef::Context(_)
            | InstanceRef::External(_)
            | InstanceRef::Event(_)
            | InstanceRef::Value(_) => None,
        }
    }

    pub(crate) fn instance_mut(&mut self, target: &InstanceRef) -> Option<&mut InstanceStruct> {
        match target {
            InstanceRef::Slot(i) => self.storage.instances.get_mut(*i)?.as_struct_mut(),
            InstanceRef::Temporary(i) => self.storage.temporaries.get_mut(*i)?.data.as_struct_mut(),
            InstanceRef::Shared(asset, i) => self.storage.shared.get_mut(asset)?.get_mut(*i),
            InstanceRef::GlobalParameters => Some(&mut self.storage.global_parameters),
            InstanceRef::Context(_)
            | InstanceRef::External(_)
            | InstanceRef::Event(_)
            | InstanceRef::Value(_) => None,
        }
    }

    /// Reads one property of the data behind `handle`. Context and external
    /// data are addressed by the field order of their descriptors.
    pub(crate) fn read_property(
        &mut self,
        set: FrameSet,
        frame_index: usize,
        handle: DataHandle,
        property: u16,
    ) -> Option<Value> {
        let tree = self.frame_tree(set, frame_index)?;
        let source = self.resolve(set, frame_index, handle)?;
        let property_index = property as usize;
        match source {
            InstanceRef::Context(i) => {
                let desc = tree.context_data.get(i)?;
                let field = desc.fields.get(property_index)?;
                let root = self.root_tree()?;
                let index = root.context_data.iter().position(|d| d.name == desc.name)?;
                self.context_data.get(index)?.as_ref()?.get_named(field).cloned()
            }
            InstanceRef::External(i) => {
                let desc = tree.external_data.get(handle.index as usize)?;
                let field = desc.fields.get(property_index)?;
                self.external_data.view(i)?.get_named(field).cloned()
            }
            InstanceRef::Value(value) => Some(value),
            InstanceRef::Event(event) => event?.property(property),
            InstanceRef::Slot(i) => match self.storage.instances.get(i)? {
                InstanceSlot::Data(data) => data.get(property_index).cloned(),
                InstanceSlot::Event(event) => event.as_ref()?.property(property),
            },
            InstanceRef::Temporary(i) => match &self.storage.temporaries.get(i)?.data {
                InstanceSlot::Data(data) => data.get(property_index).cloned(),
                InstanceSlot::Event(event) => event.as_ref()?.property(property),
            },
            other => self.instance(&other)?.get(property_index).cloned(),
        }
    }

    // ── Copies ──────────────────────────────

    /// Runs the property functions of `batch`, then copies every bound
    /// source into `target`. Returns false when the copy could not be
    /// completed under `mode`.
    pub(crate) fn copy_batch(
        &mut self,
        set: FrameSet,
        frame_index: usize,
        target: &InstanceRef,
        batch: Option<u16>,
        mode: CopyMode,
    ) -> bool {
        let Some(tree) = self.frame_tree(set, frame_index) else {
            return false;
        };
        let Some(batch) = tree.batch(batch) else {
            return true;
        };
        for &function in &batch.functions {
            self.run_function(set, frame_index, function as usize);
        }

        let mut values = Vec::with_capacity(batch.copies.len());
        for copy in &batch.copies {
            match self.read_property(set, frame_index, copy.source, copy.source_property) {
                Some(value) => values.push((copy.target_property as usize, value)),
                None if mode == CopyMode::Validated => {
                    tracing::debug!(tree = %tree.name, source = ?copy.source.source, "binding source unavailable");
                    return false;
                }
                None => {
                    tracing::debug!(tree = %tree.name, source = ?copy.source.source, "skipping unavailable binding source");
                }
            }
        }

        let Some(data) = self.instance_mut(target) else {
            return values.is_empty();
        };
        for (property, value) in values {
            data.set(property, value);
        }
        true
    }

    /// Copies the bindings of node `node_index` into its instance data.
    pub(crate) fn copy_node_bindings(
        &mut self,
        set: FrameSet,
        frame_index: usize,
        node_index: usize,
        mode: CopyMode,
    ) -> bool {
        let Some(tree) = self.frame_tree(set, frame_index) else {
            return false;
        };
        let Some(node) = tree.node(node_index) else {
            return false;
        };
        if node.bindings.is_none() {
            return true;
        }
        let Some(target) = self.resolve(set, frame_index, node.instance) else {
            return false;
        };
        self.copy_batch(set, frame_index, &target, node.bindings, mode)
    }

    fn run_function(&mut self, set: FrameSet, frame_index: usize, node_index: usize) {
        let Some(tree) = self.frame_tree(set, frame_index) else {
            return;
        };
        let Some(node) = tree.node(node_index) else {
            return;
        };
        let NodeKind::Function(function) = &node.kind else {
            return;
        };
        let Some(target) = self.resolve(set, frame_index, node.instance) else {
            return;
        };
        self.copy_batch(set, frame_index, &target, node.bindings, CopyMode::Active);
        if let Some(data) = self.instance_mut(&target) {
            nodes::compute_function(function, data);
        }
    }

    /// Clears object references copied into `target` by `batch`, so a
    /// condition does not keep objects alive between evaluations.
    pub(crate) fn reset_bound_objects(&mut self, target: &InstanceRef, batch: Option<u16>, tree: &StateTree) {
        let Some(batch) = tree.batch(batch) else {
            return;
        };
        let Some(data) = self.instance_mut(target) else {
            return;
        };
        for copy in &batch.copies {
            let index = copy.target_property as usize;
            if data.get(index).is_some_and(Value::is_object) {
                data.set(index, Value::NULL_OBJECT);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use statetree_core::{
        BindingDefinition, ConditionDefinition, DataDesc, DataHandle, DataSource,
        InstanceStruct, LibraryDefinition, StateDefinition, StateHandle, TaskDefinition,
        TreeDefinition, TreeLibrary, Value,
    };
    use statetree_core::node::FunctionKind;

    use super::*;
    use crate::context::ExecutionContext;
    use crate::storage::InstanceStorage;

    fn library() -> TreeLibrary {
        let def = TreeDefinition::new(
            "T",
            StateDefinition::new("Root").child(
                StateDefinition::new("A")
                    .task(
                        TaskDefinition::run_forever("work")
                            .field("speed", 0.0)
                            .binding(BindingDefinition::new("speed", "Params.speed")),
                    )
                    .enter_condition(
                        ConditionDefinition::new(statetree_core::node::ConditionKind::IsTrue)
                            .binding(
                                BindingDefinition::new("value", "Params.enabled")
                                    .through(FunctionKind::Not),
                            ),
                    ),
            ),
        )
        .parameter("speed", 2.5)
        .parameter("enabled", false)
        .context(DataDesc::new("Actor", &["health"], true));
        TreeLibrary::compile(&LibraryDefinition::single(def)).unwrap()
    }

    #[test]
    fn parameters_and_context_resolve_in_running_tree() {
        let lib = library();
        let mut storage = InstanceStorage::new();
        let mut ctx = ExecutionContext::new(&lib, AssetId(0), &mut storage);
        ctx.set_context_data("Actor", InstanceStruct::new().with("health", 75))
            .unwrap();
        ctx.start(None, None);

        let speed = ctx.read_property(FrameSet::Active, 0, DataHandle::GLOBAL_PARAMETERS, 0);
        assert_eq!(speed, Some(Value::Float(2.5)));
        let health = ctx.read_property(
            FrameSet::Active,
            0,
            DataHandle::new(DataSource::ContextData, 0),
            0,
        );
        assert_eq!(health, Some(Value::Int(75)));
        let unknown = ctx.read_property(
            FrameSet::Active,
            0,
            DataHandle::new(DataSource::ContextData, 4),
            0,
        );
        assert!(unknown.is_none());
    }

    #[test]
    fn task_bindings_copy_parameters() {
        let lib = library();
        let tree = &lib[AssetId(0)];
        let mut storage = InstanceStorage::new();
        let mut ctx = ExecutionContext::new(&lib, AssetId(0), &mut storage);
        ctx.set_context_data("Actor", InstanceStruct::new().with("health", 1))
            .unwrap();
        ctx.start(None, None);
        assert_eq!(ctx.active_state_names(), vec!["Root", "A"]);

        let a = tree.find_state("A").unwrap();
        let node = tree.state(a).unwrap().tasks.begin as usize;
        let handle = tree.nodes[node].instance;
        assert_eq!(handle.state, a);
        let slot = ctx.resolve(FrameSet::Active, 0, handle).unwrap();
        let data = ctx.instance(&slot).unwrap();
        assert_eq!(data.f64_named("speed"), Some(2.5));
        assert!(handle.state != StateHandle::INVALID);
    }

    #[test]
    fn unset_external_parameter_reads_nothing() {
        let lib = library();
        let mut storage = InstanceStorage::new();
        let mut ctx = ExecutionContext::new(&lib, AssetId(0), &mut storage);
        ctx.set_context_data("Actor", InstanceStruct::new().with("health", 1))
            .unwrap();
        ctx.start(None, None);
        let missing = ctx.read_property(
            FrameSet::Active,
            0,
            DataHandle::new(DataSource::ExternalGlobalParameterData, 0),
            0,
        );
        assert!(missing.is_none());
    }
}
