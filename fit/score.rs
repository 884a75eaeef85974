//! # Scores
//!
//! A [`Score`] is an immutable `record_id -> f64` mapping holding one
//! coordinate's prediction contribution for every record it touched.
//! Scores combine by pointwise sum, which is commutative and associative,
//! so the driver can fold any subset of coordinates' scores in any order
//! to form an offset or a full-model score.
//!
//! Storage is sharded by `hash(record_id) % num_shards` and shared behind
//! an `Arc`, so cloning a score (e.g. into a cache entry) never copies the
//! entries.

use ahash::AHashMap;
use rayon::prelude::*;
use std::sync::Arc;

use crate::data::{RecordId, shard_of};

/// Immutable sharded record-to-contribution map.
#[derive(Debug, Clone)]
pub struct Score {
    shards: Arc<Vec<AHashMap<RecordId, f64>>>,
}

impl Score {
    /// Build a score from raw entries, distributing over `num_shards`.
    /// Duplicate record ids sum, matching the combine semantics.
    pub fn from_entries(
        entries: impl IntoIterator<Item = (RecordId, f64)>,
        num_shards: usize,
    ) -> Self {
        let num_shards = num_shards.max(1);
        let mut shards = vec![AHashMap::new(); num_shards];
        for (id, value) in entries {
            *shards[shard_of(id, num_shards)].entry(id).or_insert(0.0) += value;
        }
        Self {
            shards: Arc::new(shards),
        }
    }

    /// An empty score in the given layout; the identity for [`combine`].
    ///
    /// [`combine`]: Score::combine
    pub fn empty(num_shards: usize) -> Self {
        Self {
            shards: Arc::new(vec![AHashMap::new(); num_shards.max(1)]),
        }
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.is_empty())
    }

    pub fn get(&self, record: RecordId) -> Option<f64> {
        self.shards[shard_of(record, self.shards.len())]
            .get(&record)
            .copied()
    }

    /// Pointwise sum. Keys present on only one side pass through unchanged.
    ///
    /// When both sides share a shard layout the sum runs shard-parallel;
    /// otherwise the right side is folded into the left layout.
    pub fn combine(&self, other: &Score) -> Score {
        if self.shards.len() == other.shards.len() {
            let shards: Vec<AHashMap<RecordId, f64>> = self
                .shards
                .par_iter()
                .zip(other.shards.par_iter())
                .map(|(a, b)| {
                    let (big, small) = if a.len() >= b.len() { (a, b) } else { (b, a) };
                    let mut out = big.clone();
                    for (&id, &v) in small {
                        *out.entry(id).or_insert(0.0) += v;
                    }
                    out
                })
                .collect();
            return Score {
                shards: Arc::new(shards),
            };
        }
        let mut shards: Vec<AHashMap<RecordId, f64>> = self.shards.as_ref().clone();
        let n = shards.len();
        for shard in other.shards.iter() {
            for (&id, &v) in shard {
                *shards[shard_of(id, n)].entry(id).or_insert(0.0) += v;
            }
        }
        Score {
            shards: Arc::new(shards),
        }
    }

    /// Approximate resident size, used for substrate accounting only.
    pub fn approx_bytes(&self) -> usize {
        self.len() * (std::mem::size_of::<RecordId>() + std::mem::size_of::<f64>())
    }

    /// Iterate all `(record, value)` entries in shard order.
    pub fn iter(&self) -> impl Iterator<Item = (RecordId, f64)> + '_ {
        self.shards
            .iter()
            .flat_map(|s| s.iter().map(|(&id, &v)| (id, v)))
    }
}

/// Pointwise equality, independent of shard layout. An absent key reads
/// as 0.0, the same convention consumers use, so an explicit zero entry
/// equals no entry at all.
impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.iter().all(|(id, v)| other.get(id).unwrap_or(0.0) == v)
            && other.iter().all(|(id, v)| self.get(id).unwrap_or(0.0) == v)
    }
}
