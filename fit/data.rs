//! # Training and Validation Data Containers
//!
//! This module defines the record-level data containers consumed by the
//! fitting core. Records are held in a fixed number of shards so that bulk
//! work (scoring, residual passes) can run shard-parallel while record
//! identity stays stable across the whole run.
//!
//! Data loading and feature parsing live outside this crate; callers hand
//! over already-validated records.

use ahash::AHashMap;
use ndarray::Array1;

/// Globally unique identifier of a single record.
pub type RecordId = u64;

/// Name of an independently-optimizable parameter block.
pub type CoordinateId = String;

/// One observation: response, prior weight, feature vector, and the entity
/// keys that per-entity coordinates group by.
#[derive(Debug, Clone)]
pub struct DataPoint {
    pub label: f64,
    pub weight: f64,
    /// Dense feature vector. Coordinates may restrict themselves to a
    /// subset of these columns.
    pub features: Array1<f64>,
    /// Grouping keys, one per random-effect namespace (e.g. "user" ->
    /// "u123"). Records may lack a key for a given namespace.
    pub entities: AHashMap<String, String>,
}

impl DataPoint {
    pub fn new(label: f64, weight: f64, features: Array1<f64>) -> Self {
        Self {
            label,
            weight,
            features,
            entities: AHashMap::new(),
        }
    }

    pub fn with_entity(mut self, namespace: &str, entity: &str) -> Self {
        self.entities.insert(namespace.to_owned(), entity.to_owned());
        self
    }
}

/// A sharded collection of `(RecordId, DataPoint)` pairs.
///
/// Shard assignment is `hash(record_id) % num_shards`, the same rule
/// [`crate::score::Score`] uses, so a score computed from this data lands
/// in a compatible layout.
#[derive(Debug, Clone)]
pub struct DataSet {
    shards: Vec<Vec<(RecordId, DataPoint)>>,
    num_features: usize,
    len: usize,
}

pub(crate) fn shard_of(record: RecordId, num_shards: usize) -> usize {
    // Cheap multiplicative mix; record ids are frequently sequential.
    (record.wrapping_mul(0x9E37_79B9_7F4A_7C15) % num_shards as u64) as usize
}

impl DataSet {
    /// Distribute records over `num_shards` shards.
    pub fn from_records(
        records: impl IntoIterator<Item = (RecordId, DataPoint)>,
        num_shards: usize,
    ) -> Self {
        let num_shards = num_shards.max(1);
        let mut shards = vec![Vec::new(); num_shards];
        let mut num_features = 0;
        let mut len = 0;
        for (id, point) in records {
            num_features = num_features.max(point.features.len());
            shards[shard_of(id, num_shards)].push((id, point));
            len += 1;
        }
        Self {
            shards,
            num_features,
            len,
        }
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Borrow the shards for parallel traversal.
    pub fn shards(&self) -> &[Vec<(RecordId, DataPoint)>] {
        &self.shards
    }

    /// Iterate all records in shard order.
    pub fn iter(&self) -> impl Iterator<Item = &(RecordId, DataPoint)> {
        self.shards.iter().flat_map(|s| s.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn point(label: f64) -> DataPoint {
        DataPoint::new(label, 1.0, array![1.0, 2.0])
    }

    #[test]
    fn sharding_is_stable_and_total() {
        let data = DataSet::from_records((0..100).map(|i| (i, point(i as f64))), 4);
        assert_eq!(data.num_shards(), 4);
        assert_eq!(data.len(), 100);
        assert_eq!(data.num_features(), 2);
        let mut seen: Vec<RecordId> = data.iter().map(|(id, _)| *id).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn zero_shards_clamps_to_one() {
        let data = DataSet::from_records(vec![(7, point(0.5))], 0);
        assert_eq!(data.num_shards(), 1);
        assert_eq!(data.len(), 1);
    }

    #[test]
    fn entity_keys_round_trip() {
        let p = point(1.0).with_entity("user", "u1");
        assert_eq!(p.entities.get("user").map(String::as_str), Some("u1"));
        assert!(p.entities.get("item").is_none());
    }
}
