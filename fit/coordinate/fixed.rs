//! Fixed-effect coordinate: one global linear block shared by every
//! record. Its sub-model is a single dense weight vector, broadcast to
//! all workers when materialized.

use ndarray::{Array1, Array2};
use rayon::prelude::*;
use std::any::Any;
use std::sync::Arc;

use crate::data::DataSet;
use crate::model::SubModel;
use crate::optimizer::BlockOptimizer;
use crate::score::Score;
use crate::store::{StorageDescriptor, StorageKind};

use super::{
    Coordinate, CoordinateError, OptimizerDiagnostics, UpdateOutcome, downcast_model,
    select_columns,
};

#[derive(Debug, Clone)]
pub struct FixedEffectConfig {
    /// Columns of the feature space this block uses; `None` means all.
    pub feature_subset: Option<Vec<usize>>,
    /// L2 penalty strength.
    pub l2: f64,
}

impl Default for FixedEffectConfig {
    fn default() -> Self {
        Self {
            feature_subset: None,
            l2: 1.0,
        }
    }
}

/// The fitted global block.
#[derive(Debug, Clone)]
pub struct FixedEffectModel {
    pub weights: Array1<f64>,
}

impl SubModel for FixedEffectModel {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn storage(&self) -> Vec<StorageDescriptor> {
        vec![StorageDescriptor {
            kind: StorageKind::Broadcast,
            approx_bytes: self.weights.len() * std::mem::size_of::<f64>(),
        }]
    }

    fn summary(&self) -> String {
        format!("fixed effect ({} weights)", self.weights.len())
    }
}

pub struct FixedEffectCoordinate {
    data: Arc<DataSet>,
    config: FixedEffectConfig,
    optimizer: Arc<dyn BlockOptimizer>,
}

impl FixedEffectCoordinate {
    pub fn new(
        data: Arc<DataSet>,
        config: FixedEffectConfig,
        optimizer: Arc<dyn BlockOptimizer>,
    ) -> Self {
        Self {
            data,
            config,
            optimizer,
        }
    }

    fn block_dim(&self) -> usize {
        match &self.config.feature_subset {
            Some(subset) => subset.len(),
            None => self.data.num_features(),
        }
    }

    fn refit(&self, current: &dyn SubModel, offset: Option<&Score>) -> Result<UpdateOutcome, CoordinateError> {
        let current = downcast_model::<FixedEffectModel>(current, "fixed effect")?;
        let n = self.data.len();
        let dim = self.block_dim();

        let mut design = Array2::zeros((n, dim));
        let mut residuals = Array1::zeros(n);
        let mut weights = Array1::zeros(n);
        for (row, (id, point)) in self.data.iter().enumerate() {
            design
                .row_mut(row)
                .assign(&select_columns(&point.features, &self.config.feature_subset));
            let off = offset.and_then(|s| s.get(*id)).unwrap_or(0.0);
            residuals[row] = point.label - off;
            weights[row] = point.weight;
        }

        let fitted = self
            .optimizer
            .fit(&design, &residuals, &weights, &current.weights, self.config.l2)?;
        let diagnostics = OptimizerDiagnostics::new(format!(
            "fixed effect: {} records, {} weights, optimizer={}",
            n,
            dim,
            self.optimizer.name()
        ));
        Ok(UpdateOutcome {
            model: Box::new(FixedEffectModel { weights: fitted }),
            diagnostics: Some(diagnostics),
        })
    }
}

impl Coordinate for FixedEffectCoordinate {
    fn initialize_model(&self, _seed: u64) -> Result<Box<dyn SubModel>, CoordinateError> {
        Ok(Box::new(FixedEffectModel {
            weights: Array1::zeros(self.block_dim()),
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
        let model = downcast_model::<FixedEffectModel>(model, "fixed effect")?;
        let entries: Vec<(u64, f64)> = data
            .shards()
            .par_iter()
            .flat_map_iter(|shard| {
                shard.iter().map(|(id, point)| {
                    let x = select_columns(&point.features, &self.config.feature_subset);
                    (*id, x.dot(&model.weights))
                })
            })
            .collect();
        Ok(Score::from_entries(entries, data.num_shards()))
    }

    fn regularization_term(&self, model: &dyn SubModel) -> Result<f64, CoordinateError> {
        let model = downcast_model::<FixedEffectModel>(model, "fixed effect")?;
        Ok(0.5 * self.config.l2 * model.weights.dot(&model.weights))
    }
}
