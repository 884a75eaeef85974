//! # Coordinates
//!
//! A coordinate owns one named, independently-optimizable block of the
//! composite model's parameters and the logic to initialize, refit, score
//! and regularize it. The driver sees only this trait; the concrete kind
//! (one global block, or a keyed collection of per-entity blocks) never
//! leaks through it.
//!
//! Coordinates are stateless strategies: the mutable-by-replacement state
//! is the [`SubModel`] they produce, held by the driver's composite model.

pub mod fixed;
pub mod random;

use thiserror::Error;

use crate::data::DataSet;
use crate::model::SubModel;
use crate::optimizer::OptimizerError;
use crate::score::Score;
use crate::store::StorageDescriptor;

pub use fixed::{FixedEffectConfig, FixedEffectCoordinate, FixedEffectModel};
pub use random::{RandomEffectConfig, RandomEffectCoordinate, RandomEffectModel};

#[derive(Error, Debug)]
pub enum CoordinateError {
    /// The driver handed this coordinate a sub-model produced by a
    /// different coordinate kind.
    #[error("coordinate expected a {expected} sub-model, got {found}")]
    SubModelTypeMismatch {
        expected: &'static str,
        found: String,
    },
    #[error(transparent)]
    Optimizer(#[from] OptimizerError),
}

/// Optimizer state captured during one block update, reported to the
/// driver for logging. May pin partitioned storage of its own (e.g.
/// per-entity convergence tables); the driver releases that right after
/// logging the summary.
#[derive(Debug, Clone)]
pub struct OptimizerDiagnostics {
    summary: String,
    storage: Vec<StorageDescriptor>,
}

impl OptimizerDiagnostics {
    pub fn new(summary: String) -> Self {
        Self {
            summary,
            storage: Vec::new(),
        }
    }

    pub fn with_storage(summary: String, storage: Vec<StorageDescriptor>) -> Self {
        Self { summary, storage }
    }

    /// Human-readable one-liner for the run log.
    pub fn summary(&self) -> &str {
        &self.summary
    }

    /// Storage the tracker pinned while fitting; released by the driver.
    pub fn storage(&self) -> &[StorageDescriptor] {
        &self.storage
    }
}

/// Result of one block update.
pub struct UpdateOutcome {
    pub model: Box<dyn SubModel>,
    pub diagnostics: Option<OptimizerDiagnostics>,
}

/// The capability contract every coordinate kind implements.
pub trait Coordinate: Send + Sync {
    /// A fresh sub-model. Deterministic given `seed`; no side effects
    /// beyond allocating the block.
    fn initialize_model(&self, seed: u64) -> Result<Box<dyn SubModel>, CoordinateError>;

    /// Refit this block with no offset. Called only when this is the sole
    /// coordinate of the run.
    fn update_model(&self, current: &dyn SubModel) -> Result<UpdateOutcome, CoordinateError>;

    /// Refit this block against residual targets after subtracting
    /// `offset`, the combined score of every other coordinate.
    fn update_model_with_offset(
        &self,
        current: &dyn SubModel,
        offset: &Score,
    ) -> Result<UpdateOutcome, CoordinateError>;

    /// Score `data` under `model`. Pure; no mutation of either.
    fn score(&self, model: &dyn SubModel, data: &DataSet) -> Result<Score, CoordinateError>;

    /// Non-negative regularization penalty of `model`.
    fn regularization_term(&self, model: &dyn SubModel) -> Result<f64, CoordinateError>;
}

/// Pick a coordinate's columns out of the full feature vector.
pub(crate) fn select_columns(
    features: &ndarray::Array1<f64>,
    subset: &Option<Vec<usize>>,
) -> ndarray::Array1<f64> {
    match subset {
        Some(cols) => cols.iter().map(|&c| features[c]).collect(),
        None => features.clone(),
    }
}

/// Downcast a sub-model to this coordinate's concrete type.
pub(crate) fn downcast_model<'a, T: 'static>(
    model: &'a dyn SubModel,
    expected: &'static str,
) -> Result<&'a T, CoordinateError> {
    model
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| CoordinateError::SubModelTypeMismatch {
            expected,
            found: model.summary(),
        })
}
