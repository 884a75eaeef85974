//! # Sub-models and the composite model
//!
//! A [`SubModel`] is the opaque fitted state of one coordinate. The driver
//! never inspects it beyond the storage descriptors it reports; only the
//! coordinate that produced it ever downcasts it back.
//!
//! A [`CompositeModel`] maps coordinate ids to sub-models and is immutable:
//! replacing one entry yields a new composite that structurally shares all
//! other entries (the sub-models sit behind `Arc`), so a reader holding an
//! earlier snapshot keeps seeing a consistent model.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::data::CoordinateId;
use crate::store::StorageDescriptor;

/// Opaque fitted parameter block produced and consumed by exactly one
/// coordinate.
pub trait SubModel: Any + Send + Sync + fmt::Debug {
    /// Downcast support for the owning coordinate.
    fn as_any(&self) -> &dyn Any;

    /// The storage blocks this value owns on the substrate. The driver
    /// pins each on materialization and releases each exactly once when
    /// the value is superseded.
    fn storage(&self) -> Vec<StorageDescriptor>;

    /// One-line description for logs.
    fn summary(&self) -> String;
}

/// Immutable `coordinate_id -> sub-model` mapping with functional update.
#[derive(Debug, Clone, Default)]
pub struct CompositeModel {
    entries: BTreeMap<CoordinateId, Arc<dyn SubModel>>,
}

impl CompositeModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(
        entries: impl IntoIterator<Item = (CoordinateId, Arc<dyn SubModel>)>,
    ) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn SubModel>> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Functional update: a new composite with `id` bound to `model` and
    /// every other entry shared with `self`.
    pub fn with_entry(&self, id: &str, model: Arc<dyn SubModel>) -> Self {
        let mut entries = self.entries.clone();
        entries.insert(id.to_owned(), model);
        Self { entries }
    }

    pub fn ids(&self) -> impl Iterator<Item = &CoordinateId> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StorageKind;

    #[derive(Debug)]
    struct Stub(f64);

    impl SubModel for Stub {
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn storage(&self) -> Vec<StorageDescriptor> {
            vec![StorageDescriptor {
                kind: StorageKind::Broadcast,
                approx_bytes: 8,
            }]
        }
        fn summary(&self) -> String {
            format!("stub({})", self.0)
        }
    }

    fn value(model: &CompositeModel, id: &str) -> f64 {
        model
            .get(id)
            .unwrap()
            .as_any()
            .downcast_ref::<Stub>()
            .unwrap()
            .0
    }

    #[test]
    fn with_entry_shares_unchanged_entries() {
        let base = CompositeModel::from_entries(vec![
            ("a".to_owned(), Arc::new(Stub(1.0)) as Arc<dyn SubModel>),
            ("b".to_owned(), Arc::new(Stub(2.0)) as Arc<dyn SubModel>),
        ]);
        let updated = base.with_entry("a", Arc::new(Stub(10.0)));

        assert_eq!(value(&updated, "a"), 10.0);
        assert_eq!(value(&updated, "b"), 2.0);
        // The old snapshot is untouched and "b" is the same allocation.
        assert_eq!(value(&base, "a"), 1.0);
        assert!(Arc::ptr_eq(base.get("b").unwrap(), updated.get("b").unwrap()));
    }

    #[test]
    fn contains_and_ids() {
        let model =
            CompositeModel::from_entries(vec![("x".to_owned(), Arc::new(Stub(0.0)) as _)]);
        assert!(model.contains("x"));
        assert!(!model.contains("y"));
        assert_eq!(model.ids().collect::<Vec<_>>(), vec!["x"]);
    }
}
