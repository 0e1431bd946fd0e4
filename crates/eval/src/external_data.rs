//! External data: per-asset inputs supplied by the owner through a collector.

use std::collections::HashMap;

use statetree_core::{AssetId, DataDesc, InstanceStruct, StateTree};

/// Supplies the external data a tree declares. `out` is aligned with
/// `descs`; leave an entry `None` when the item is not available. Return
/// false to abort the operation that needed the data.
pub trait ExternalDataCollector {
    fn collect(
        &mut self,
        tree: &StateTree,
        descs: &[DataDesc],
        out: &mut [Option<InstanceStruct>],
    ) -> bool;
}

impl<F> ExternalDataCollector for F
where
    F: FnMut(&StateTree, &[DataDesc], &mut [Option<InstanceStruct>]) -> bool,
{
    fn collect(
        &mut self,
        tree: &StateTree,
        descs: &[DataDesc],
        out: &mut [Option<InstanceStruct>],
    ) -> bool {
        self(tree, descs, out)
    }
}

/// Collected views, one run per asset, cached until invalidated.
#[derive(Debug, Clone, Default)]
pub struct ExternalDataCache {
    views: Vec<Option<InstanceStruct>>,
    bases: HashMap<AssetId, usize>,
}

impl ExternalDataCache {
    pub fn base(&self, asset: AssetId) -> Option<usize> {
        self.bases.get(&asset).copied()
    }

    pub fn view(&self, index: usize) -> Option<&InstanceStruct> {
        self.views.get(index).and_then(Option::as_ref)
    }

    pub fn invalidate(&mut self) {
        self.views.clear();
        self.bases.clear();
    }

    /// Collects the external data of `tree`, reusing a previous collection.
    /// Returns the base index of the asset's views, or `None` when the
    /// collector failed or a required item is missing or incompatible. A
    /// failed collection leaves the cache as it was.
    pub fn collect(
        &mut self,
        asset: AssetId,
        tree: &StateTree,
        collector: Option<&mut (dyn ExternalDataCollector + '_)>,
    ) -> Option<usize> {
        if let Some(base) = self.base(asset) {
            return Some(base);
        }
        let base = self.views.len();
        if tree.external_data.is_empty() {
            self.bases.insert(asset, base);
            return Some(base);
        }

        let mut out = vec![None; tree.external_data.len()];
        let collected = match collector {
            Some(collector) => collector.collect(tree, &tree.external_data, &mut out),
            None => true,
        };
        if !collected {
            tracing::debug!(tree = %tree.name, "external data collector aborted");
            return None;
        }
        for (desc, item) in tree.external_data.iter().zip(&out) {
            if !is_compatible(desc, item.as_ref()) {
                tracing::debug!(tree = %tree.name, data = %desc.name, "missing or incompatible external data");
                return None;
            }
        }

        self.views.extend(out);
        self.bases.insert(asset, base);
        Some(base)
    }
}

fn is_compatible(desc: &DataDesc, item: Option<&InstanceStruct>) -> bool {
    match item {
        Some(data) => desc.fields.iter().all(|f| data.index_of(f).is_some()),
        None => !desc.required,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use statetree_core::{LibraryDefinition, StateDefinition, TreeDefinition, TreeLibrary};

    fn tree(required: bool) -> StateTree {
        let def = TreeDefinition::new("T", StateDefinition::new("Root"))
            .external(DataDesc::new("Sensor", &["range"], required));
        TreeLibrary::compile(&LibraryDefinition::single(def))
            .unwrap()
            .trees
            .remove(0)
    }

    #[test]
    fn missing_required_item_fails_and_rolls_back() {
        let tree = tree(true);
        let mut cache = ExternalDataCache::default();
        let mut nothing = |_: &StateTree, _: &[DataDesc], _: &mut [Option<InstanceStruct>]| true;
        assert_eq!(cache.collect(AssetId(0), &tree, Some(&mut nothing as &mut dyn ExternalDataCollector)), None);
        assert_eq!(cache.base(AssetId(0)), None);
    }

    #[test]
    fn optional_item_may_be_absent() {
        let tree = tree(false);
        let mut cache = ExternalDataCache::default();
        assert_eq!(cache.collect(AssetId(0), &tree, None), Some(0));
        assert!(cache.view(0).is_none());
    }

    #[test]
    fn collected_views_are_cached_per_asset() {
        let tree = tree(true);
        let mut cache = ExternalDataCache::default();
        let mut calls = 0;
        let mut sensor = |_: &StateTree, _: &[DataDesc], out: &mut [Option<InstanceStruct>]| {
            calls += 1;
            out[0] = Some(InstanceStruct::new().with("range", 4.0f64));
            true
        };
        assert_eq!(cache.collect(AssetId(0), &tree, Some(&mut sensor as &mut dyn ExternalDataCollector)), Some(0));
        assert_eq!(cache.collect(AssetId(0), &tree, Some(&mut sensor as &mut dyn ExternalDataCollector)), Some(0));
        assert_eq!(calls, 1);
        assert_eq!(cache.view(0).and_then(|v| v.f64_named("range")), Some(4.0));
    }

    #[test]
    fn item_without_declared_field_is_incompatible() {
        let tree = tree(false);
        let mut cache = ExternalDataCache::default();
        let mut wrong = |_: &StateTree, _: &[DataDesc], out: &mut [Option<InstanceStruct>]| {
            out[0] = Some(InstanceStruct::new().with("distance", 1i64));
            true
        };
        assert_eq!(cache.collect(AssetId(0), &tree, Some(&mut wrong as &mut dyn ExternalDataCollector)), None);
    }
}
