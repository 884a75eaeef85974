//! # mosaic
//!
//! Fits composite statistical models whose parameters are partitioned
//! into named, independently-optimizable coordinates (a global
//! fixed-effect block, per-entity random-effect blocks) by block
//! coordinate descent: each iteration updates every coordinate in turn
//! against the combined contribution of all the others.
//!
//! The heart of the crate is [`descent::CoordinateDescent`], which owns
//! the cross-coordinate orchestration contract: score caching with an
//! explicit pin/release discipline ([`store::Substrate`]), the running
//! objective, and validation-based best-model selection. Model families
//! plug in through the [`coordinate::Coordinate`] trait.

pub mod coordinate;
pub mod data;
pub mod descent;
pub mod evaluator;
pub mod model;
pub mod objective;
pub mod optimizer;
pub mod score;
pub mod store;
pub mod timer;

pub use coordinate::{
    Coordinate, CoordinateError, FixedEffectConfig, FixedEffectCoordinate, FixedEffectModel,
    OptimizerDiagnostics, RandomEffectConfig, RandomEffectCoordinate, RandomEffectModel,
    UpdateOutcome,
};
pub use data::{CoordinateId, DataPoint, DataSet, RecordId};
pub use descent::{
    CoordinateDescent, DescentError, FitOutcome, IterationSummary, ValidationBundle,
};
pub use evaluator::{EvaluationRecord, Evaluator, MeanAbsoluteErrorEvaluator, RmseEvaluator};
pub use model::{CompositeModel, SubModel};
pub use objective::{LossFunction, ObjectiveFunctionValue, RegularizationMap, SquaredLoss};
pub use optimizer::{BlockOptimizer, GradientDescentOptimizer, OptimizerError};
pub use score::Score;
pub use store::{
    ReleaseEvent, ResourceHandle, StorageDescriptor, StorageKind, StoreError, Substrate,
};
pub use timer::Timer;
