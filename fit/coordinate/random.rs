//! Random-effect coordinate: a keyed collection of per-entity linear
//! blocks, one per distinct value of a grouping key (e.g. per user).
//! Entities are fitted independently, so the refit runs entity-parallel.
//!
//! The sub-model holds partitioned storage (the per-entity blocks) and
//! broadcast storage (the entity index every worker needs for lookups),
//! so superseding it releases both kinds.

use ahash::AHashMap;
use ndarray::{Array1, Array2};
use rayon::prelude::*;
use std::any::Any;
use std::sync::Arc;

use crate::data::{DataSet, RecordId};
use crate::model::SubModel;
use crate::optimizer::BlockOptimizer;
use crate::score::Score;
use crate::store::{StorageDescriptor, StorageKind};

use super::{
    Coordinate, CoordinateError, OptimizerDiagnostics, UpdateOutcome, downcast_model,
    select_columns,
};

#[derive(Debug, Clone)]
pub struct RandomEffectConfig {
    /// Which entity key in [`crate::data::DataPoint::entities`] this
    /// coordinate groups by.
    pub namespace: String,
    /// Columns of the feature space this block uses; `None` means all.
    pub feature_subset: Option<Vec<usize>>,
    /// L2 penalty strength, applied per entity block.
    pub l2: f64,
}

/// The fitted per-entity blocks.
#[derive(Debug, Clone)]
pub struct RandomEffectModel {
    pub blocks: AHashMap<String, Array1<f64>>,
    block_dim: usize,
}

impl RandomEffectModel {
    pub fn empty(block_dim: usize) -> Self {
        Self {
            blocks: AHashMap::new(),
            block_dim,
        }
    }

    pub fn block_dim(&self) -> usize {
        self.block_dim
    }
}

impl SubModel for RandomEffectModel {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn storage(&self) -> Vec<StorageDescriptor> {
        let block_bytes: usize = self
            .blocks
            .values()
            .map(|b| b.len() * std::mem::size_of::<f64>())
            .sum();
        let index_bytes: usize = self.blocks.keys().map(String::len).sum();
        vec![
            StorageDescriptor {
                kind: StorageKind::Partitioned,
                approx_bytes: block_bytes,
            },
            // Entity index is replicated to every worker for lookups.
            StorageDescriptor {
                kind: StorageKind::Broadcast,
                approx_bytes: index_bytes,
            },
        ]
    }

    fn summary(&self) -> String {
        format!(
            "random effect ({} entities x {} weights)",
            self.blocks.len(),
            self.block_dim
        )
    }
}

/// One entity's slice of the training data, grouped once at construction.
struct EntityGroup {
    records: Vec<(RecordId, Array1<f64>, f64, f64)>,
}

pub struct RandomEffectCoordinate {
    config: RandomEffectConfig,
    optimizer: Arc<dyn BlockOptimizer>,
    groups: Vec<(String, EntityGroup)>,
    block_dim: usize,
}

impl RandomEffectCoordinate {
    /// Groups `data` by the configured entity key. Records without the key
    /// belong to no entity; they are ignored during refits and score zero.
    pub fn new(
        data: &DataSet,
        config: RandomEffectConfig,
        optimizer: Arc<dyn BlockOptimizer>,
    ) -> Self {
        let block_dim = match &config.feature_subset {
            Some(subset) => subset.len(),
            None => data.num_features(),
        };
        let mut by_entity: AHashMap<String, EntityGroup> = AHashMap::new();
        for (id, point) in data.iter() {
            let Some(entity) = point.entities.get(&config.namespace) else {
                continue;
            };
            let x = select_columns(&point.features, &config.feature_subset);
            by_entity
                .entry(entity.clone())
                .or_insert_with(|| EntityGroup {
                    records: Vec::new(),
                })
                .records
                .push((*id, x, point.label, point.weight));
        }
        let mut groups: Vec<(String, EntityGroup)> = by_entity.into_iter().collect();
        // Deterministic fit order regardless of hash-map iteration.
        groups.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            config,
            optimizer,
            groups,
            block_dim,
        }
    }

    pub fn num_entities(&self) -> usize {
        self.groups.len()
    }

    fn refit(
        &self,
        current: &dyn SubModel,
        offset: Option<&Score>,
    ) -> Result<UpdateOutcome, CoordinateError> {
        let current = downcast_model::<RandomEffectModel>(current, "random effect")?;
        let fitted: Result<Vec<(String, Array1<f64>)>, CoordinateError> = self
            .groups
            .par_iter()
            .map(|(entity, group)| {
                let n = group.records.len();
                let mut design = Array2::zeros((n, self.block_dim));
                let mut residuals = Array1::zeros(n);
                let mut weights = Array1::zeros(n);
                for (row, (id, x, label, weight)) in group.records.iter().enumerate() {
                    design.row_mut(row).assign(x);
                    let off = offset.and_then(|s| s.get(*id)).unwrap_or(0.0);
                    residuals[row] = label - off;
                    weights[row] = *weight;
                }
                let start = current
                    .blocks
                    .get(entity)
                    .cloned()
                    .unwrap_or_else(|| Array1::zeros(self.block_dim));
                let block = self
                    .optimizer
                    .fit(&design, &residuals, &weights, &start, self.config.l2)?;
                Ok((entity.clone(), block))
            })
            .collect();
        let blocks: AHashMap<String, Array1<f64>> = fitted?.into_iter().collect();

        let tracker_bytes = blocks.len() * std::mem::size_of::<f64>();
        let diagnostics = OptimizerDiagnostics::with_storage(
            format!(
                "random effect '{}': {} entities, {} weights each, optimizer={}",
                self.config.namespace,
                blocks.len(),
                self.block_dim,
                self.optimizer.name()
            ),
            // Per-entity convergence table pinned by the tracker.
            vec![StorageDescriptor {
                kind: StorageKind::Partitioned,
                approx_bytes: tracker_bytes,
            }],
        );
        Ok(UpdateOutcome {
            model: Box::new(RandomEffectModel {
                blocks,
                block_dim: self.block_dim,
            }),
            diagnostics: Some(diagnostics),
        })
    }
}

impl Coordinate for RandomEffectCoordinate {
    fn initialize_model(&self, _seed: u64) -> Result<Box<dyn SubModel>, CoordinateError> {
        let blocks = self
            .groups
            .iter()
            .map(|(entity, _)| (entity.clone(), Array1::zeros(self.block_dim)))
            .collect();
        Ok(Box::new(RandomEffectModel {
            blocks,
            block_dim: self.block_dim,
        }))
    }

    fn update_model(&self, current: &dyn SubModel) -> Result<UpdateOutcome, CoordinateError> {
        self.refit(current, None)
    }

    fn update_model_with_offset(
        &self,
        current: &dyn SubModel,
        offset: &Score,
    ) -> Result<UpdateOutcome, CoordinateError> {
        self.refit(current, Some(offset))
    }

    fn score(&self, model: &dyn SubModel, data: &DataSet) -> Result<Score, CoordinateError> {
        let model = downcast_model::<RandomEffectModel>(model, "random effect")?;
        let entries: Vec<(RecordId, f64)> = data
            .shards()
            .par_iter()
            .flat_map_iter(|shard| {
                shard.iter().map(|(id, point)| {
                    let value = point
                        .entities
                        .get(&self.config.namespace)
                        .and_then(|entity| model.blocks.get(entity))
                        .map(|block| {
                            select_columns(&point.features, &self.config.feature_subset)
                                .dot(block)
                        })
                        .unwrap_or(0.0);
                    (*id, value)
                })
            })
            .collect();
        Ok(Score::from_entries(entries, data.num_shards()))
    }

    fn regularization_term(&self, model: &dyn SubModel) -> Result<f64, CoordinateError> {
        let model = downcast_model::<RandomEffectModel>(model, "random effect")?;
        Ok(0.5
            * self.config.l2
            * model
                .blocks
                .values()
                .map(|block| block.dot(block))
                .sum::<f64>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataPoint;
    use crate::optimizer::GradientDescentOptimizer;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    /// Two entities with different slopes: u1 has label = 1*x, u2 = 3*x.
    fn grouped_data() -> DataSet {
        let mut records = Vec::new();
        for i in 0..6u64 {
            let x = (i + 1) as f64;
            records.push((
                i,
                DataPoint::new(x, 1.0, array![x]).with_entity("user", "u1"),
            ));
            records.push((
                100 + i,
                DataPoint::new(3.0 * x, 1.0, array![x]).with_entity("user", "u2"),
            ));
        }
        // One record with no "user" key at all.
        records.push((999, DataPoint::new(5.0, 1.0, array![1.0])));
        DataSet::from_records(records, 3)
    }

    fn coordinate(data: &DataSet, l2: f64) -> RandomEffectCoordinate {
        RandomEffectCoordinate::new(
            data,
            RandomEffectConfig {
                namespace: "user".to_owned(),
                feature_subset: None,
                l2,
            },
            Arc::new(GradientDescentOptimizer {
                steps: 400,
                learning_rate: 0.02,
            }),
        )
    }

    #[test]
    fn groups_ignore_records_without_the_key() {
        let data = grouped_data();
        let coord = coordinate(&data, 0.0);
        assert_eq!(coord.num_entities(), 2);
    }

    #[test]
    fn per_entity_fits_are_independent() {
        let data = grouped_data();
        let coord = coordinate(&data, 0.0);
        let init = coord.initialize_model(0).unwrap();
        let outcome = coord.update_model(init.as_ref()).unwrap();
        let model = outcome
            .model
            .as_any()
            .downcast_ref::<RandomEffectModel>()
            .unwrap();
        assert_abs_diff_eq!(model.blocks["u1"][0], 1.0, epsilon = 1e-4);
        assert_abs_diff_eq!(model.blocks["u2"][0], 3.0, epsilon = 1e-4);
    }

    #[test]
    fn keyless_and_unseen_records_score_zero() {
        let data = grouped_data();
        let coord = coordinate(&data, 0.0);
        let mut model = RandomEffectModel::empty(1);
        model.blocks.insert("u1".to_owned(), array![2.0]);
        let score = coord.score(&model, &data).unwrap();
        assert_abs_diff_eq!(score.get(0).unwrap(), 2.0); // u1, x=1
        assert_abs_diff_eq!(score.get(100).unwrap(), 0.0); // u2 has no block
        assert_abs_diff_eq!(score.get(999).unwrap(), 0.0); // no key
    }

    #[test]
    fn storage_reports_both_kinds() {
        let mut model = RandomEffectModel::empty(2);
        model.blocks.insert("u1".to_owned(), array![1.0, 2.0]);
        let kinds: Vec<StorageKind> = model.storage().iter().map(|d| d.kind).collect();
        assert!(kinds.contains(&StorageKind::Partitioned));
        assert!(kinds.contains(&StorageKind::Broadcast));
    }

    #[test]
    fn regularization_sums_over_entities() {
        let data = grouped_data();
        let coord = coordinate(&data, 2.0);
        let mut model = RandomEffectModel::empty(1);
        model.blocks.insert("u1".to_owned(), array![3.0]);
        model.blocks.insert("u2".to_owned(), array![4.0]);
        assert_abs_diff_eq!(coord.regularization_term(&model).unwrap(), 25.0);
    }
}
