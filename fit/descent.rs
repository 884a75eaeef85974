//! # The block coordinate descent driver
//!
//! This module owns the whole cross-coordinate orchestration contract: the
//! outer iteration loop, per-coordinate update sequencing, the score-cache
//! lifecycle, the running objective, and best-model tracking.
//!
//! The control flow is strictly sequential. At every point between
//! protocol steps exactly one train score (and one validation score, when
//! configured) is pinned per coordinate, and a replacement value is always
//! pinned before the value it supersedes is released. Any failure inside a
//! coordinate call aborts the run with the original error; already-pinned
//! caches are deliberately left for the enclosing process to reclaim.

use std::sync::Arc;
use thiserror::Error;

use crate::coordinate::{Coordinate, CoordinateError, UpdateOutcome};
use crate::data::{CoordinateId, DataSet};
use crate::evaluator::{EvaluationRecord, Evaluator};
use crate::model::{CompositeModel, SubModel};
use crate::objective::{LossFunction, ObjectiveFunctionValue, RegularizationMap};
use crate::score::Score;
use crate::store::{ResourceHandle, StorageDescriptor, StorageKind, StoreError, Substrate};
use crate::timer::Timer;

#[derive(Error, Debug)]
pub enum DescentError {
    #[error("no coordinates were supplied")]
    NoCoordinates,
    #[error("duplicate coordinate id '{0}'")]
    DuplicateCoordinateId(String),
    #[error("validation data supplied with no evaluators")]
    NoEvaluators,
    #[error("num_iterations must be positive")]
    ZeroIterations,
    #[error("initial model is missing an entry for coordinate '{0}'")]
    MissingCoordinateEntry(String),
    #[error(transparent)]
    Coordinate(#[from] CoordinateError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Held-out data plus the metrics to compute on it. Only the first
/// evaluator ranks models; the rest are carried for reporting.
pub struct ValidationBundle<'a> {
    pub data: &'a DataSet,
    pub evaluators: Vec<Box<dyn Evaluator + 'a>>,
}

/// What one iteration left behind: the objective after its final block
/// update and, when validation is configured, the full-model evaluation
/// after the final coordinate.
#[derive(Debug, Clone)]
pub struct IterationSummary {
    pub iteration: usize,
    pub objective: ObjectiveFunctionValue,
    pub validation: Option<EvaluationRecord>,
    pub seconds: f64,
}

/// The selected model and the per-iteration trail that produced it.
#[derive(Debug)]
pub struct FitOutcome {
    pub model: CompositeModel,
    pub summaries: Vec<IterationSummary>,
}

/// Per-coordinate cached state between protocol steps.
struct CoordinateCache {
    model_handles: Vec<ResourceHandle>,
    train_score: Score,
    train_handle: ResourceHandle,
    validation: Option<(Score, ResourceHandle)>,
}

/// The coordinate descent orchestrator. See the module docs for the
/// protocol; construction wires in the collaborators, [`run`] and
/// [`run_with_seed`] execute it.
///
/// [`run`]: CoordinateDescent::run
/// [`run_with_seed`]: CoordinateDescent::run_with_seed
pub struct CoordinateDescent<'a> {
    coordinates: Vec<(CoordinateId, Box<dyn Coordinate + 'a>)>,
    training_data: &'a DataSet,
    loss: &'a dyn LossFunction,
    validation: Option<ValidationBundle<'a>>,
    substrate: &'a Substrate,
}

impl<'a> CoordinateDescent<'a> {
    /// The coordinate order given here is preserved for the whole run and
    /// fixes the update order of every iteration.
    pub fn new(
        coordinates: Vec<(CoordinateId, Box<dyn Coordinate + 'a>)>,
        training_data: &'a DataSet,
        loss: &'a dyn LossFunction,
        substrate: &'a Substrate,
    ) -> Self {
        Self {
            coordinates,
            training_data,
            loss,
            validation: None,
            substrate,
        }
    }

    /// Configure validation-based best-model tracking. Without this the
    /// run always returns the final iteration's model.
    pub fn with_validation(mut self, bundle: ValidationBundle<'a>) -> Self {
        self.validation = Some(bundle);
        self
    }

    fn check_configuration(&self, num_iterations: usize) -> Result<(), DescentError> {
        if self.coordinates.is_empty() {
            return Err(DescentError::NoCoordinates);
        }
        if num_iterations == 0 {
            return Err(DescentError::ZeroIterations);
        }
        for (i, (id, _)) in self.coordinates.iter().enumerate() {
            if self.coordinates[..i].iter().any(|(other, _)| other == id) {
                return Err(DescentError::DuplicateCoordinateId(id.clone()));
            }
        }
        if let Some(bundle) = &self.validation {
            if bundle.evaluators.is_empty() {
                return Err(DescentError::NoEvaluators);
            }
        }
        Ok(())
    }

    /// Initialize every coordinate's sub-model from `seed` (in coordinate
    /// order), assemble the composite, and run the iterative form.
    pub fn run_with_seed(
        &self,
        num_iterations: usize,
        seed: u64,
    ) -> Result<FitOutcome, DescentError> {
        self.check_configuration(num_iterations)?;
        log::info!(
            "initializing {} coordinate(s) from seed {seed}",
            self.coordinates.len()
        );
        let mut model = CompositeModel::new();
        for (id, coordinate) in &self.coordinates {
            let sub = coordinate.initialize_model(seed)?;
            log::debug!("initialized '{id}': {}", sub.summary());
            model = model.with_entry(id, Arc::from(sub));
        }
        self.run(num_iterations, model)
    }

    /// Run `num_iterations` full passes of block coordinate descent from
    /// `initial`. Returns the best validated model if validation is
    /// configured, else the final iteration's model.
    pub fn run(
        &self,
        num_iterations: usize,
        initial: CompositeModel,
    ) -> Result<FitOutcome, DescentError> {
        self.check_configuration(num_iterations)?;
        // Fail fast on a malformed initial model, before any coordinate
        // operation runs.
        for (id, _) in &self.coordinates {
            if !initial.contains(id) {
                return Err(DescentError::MissingCoordinateEntry(id.clone()));
            }
        }

        let run_timer = Timer::start();
        let mut model = initial;
        let mut caches = self.materialize_initial_state(&model)?;
        let mut regularization: RegularizationMap = RegularizationMap::new();
        for (id, coordinate) in &self.coordinates {
            let sub = model
                .get(id)
                .ok_or_else(|| DescentError::MissingCoordinateEntry(id.clone()))?;
            regularization.insert(id.clone(), coordinate.regularization_term(sub.as_ref())?);
        }

        let mut best_model: Option<CompositeModel> = None;
        let mut best_metric: Option<f64> = None;
        let mut summaries = Vec::with_capacity(num_iterations);

        for iteration in 0..num_iterations {
            let mut iteration_timer = Timer::start();
            log::info!("iteration {} of {num_iterations}", iteration + 1);

            let mut current_evaluation: Option<EvaluationRecord> = None;
            let mut objective = ObjectiveFunctionValue {
                loss: 0.0,
                regularization: 0.0,
            };

            for index in 0..self.coordinates.len() {
                let (id, coordinate) = &self.coordinates[index];
                log::debug!("updating coordinate '{id}'");

                // (a) Fit against the residual left by all other
                // coordinates' current contributions.
                let old_sub = model
                    .get(id)
                    .ok_or_else(|| DescentError::MissingCoordinateEntry(id.clone()))?
                    .clone();
                let outcome = if self.coordinates.len() == 1 {
                    coordinate.update_model(old_sub.as_ref())?
                } else {
                    let partial = self.combine_excluding(&caches, index);
                    coordinate.update_model_with_offset(old_sub.as_ref(), &partial)?
                };
                let UpdateOutcome { model: new_sub, diagnostics } = outcome;
                let new_sub: Arc<dyn SubModel> = Arc::from(new_sub);

                // (b) Pin the replacement, then free the superseded
                // sub-model's storage: broadcast first, then partitioned.
                let new_handles = self.pin_model(id, new_sub.as_ref());
                self.release_ordered(std::mem::replace(
                    &mut caches[index].model_handles,
                    new_handles,
                ))?;

                // (c) Optimizer diagnostics: log, then drop their storage.
                if let Some(diagnostics) = diagnostics {
                    log::info!("'{id}' optimizer state: {}", diagnostics.summary());
                    for descriptor in diagnostics.storage() {
                        let handle =
                            self.substrate.pin(&format!("diagnostics/{id}"), *descriptor);
                        self.substrate.release(handle)?;
                    }
                }

                // (d) Functional composite update; other entries shared.
                model = model.with_entry(id, new_sub.clone());

                // (e) Refresh this coordinate's cached train score only.
                let score = coordinate.score(new_sub.as_ref(), self.training_data)?;
                let handle = self.pin_score(&format!("train_score/{id}"), &score);
                let old_handle = caches[index].train_handle;
                caches[index].train_score = score;
                caches[index].train_handle = handle;
                self.substrate.release(old_handle)?;

                // (f) Refresh this coordinate's regularization term.
                regularization
                    .insert(id.clone(), coordinate.regularization_term(new_sub.as_ref())?);

                // (g) Training objective over the full current score.
                let full_score = self.combine_train(&caches);
                objective = ObjectiveFunctionValue {
                    loss: self.loss.evaluate(&full_score),
                    regularization: regularization.values().sum(),
                };
                log::info!("objective after '{id}': {objective}");

                // (h) Full-model validation metric after this update. Only
                // the first evaluator runs per update; the others would
                // cost a full pass each for a number nothing ranks on.
                if let Some(bundle) = &self.validation {
                    let score = coordinate.score(new_sub.as_ref(), bundle.data)?;
                    let handle =
                        self.pin_score(&format!("validation_score/{id}"), &score);
                    let previous = caches[index].validation.replace((score, handle));
                    if let Some((_, old_handle)) = previous {
                        self.substrate.release(old_handle)?;
                    }
                    let full_validation =
                        self.combine_validation(&caches, bundle.data.num_shards());
                    let evaluator = &bundle.evaluators[0];
                    let metric = evaluator.evaluate(&full_validation);
                    log::info!("validation {} after '{id}': {metric:.6e}", evaluator.name());
                    current_evaluation = Some(EvaluationRecord {
                        evaluator: evaluator.name().to_owned(),
                        metric,
                    });
                }
            }

            // (i) Only the evaluation after the final coordinate ranks the
            // iteration's full model.
            match (&self.validation, &current_evaluation) {
                (Some(bundle), Some(current)) => {
                    let evaluator = &bundle.evaluators[0];
                    let improved = match best_metric {
                        None => true,
                        Some(best) => evaluator.better_than(current.metric, best),
                    };
                    if improved {
                        log::info!(
                            "iteration {}: new best {} = {:.6e}",
                            iteration + 1,
                            current.evaluator,
                            current.metric
                        );
                        best_metric = Some(current.metric);
                        best_model = Some(model.clone());
                    } else {
                        log::info!(
                            "iteration {}: {} = {:.6e} does not beat best",
                            iteration + 1,
                            current.evaluator,
                            current.metric
                        );
                    }
                }
                _ => {
                    log::debug!("no validation configured; best-model tracking skipped");
                }
            }

            iteration_timer.stop();
            summaries.push(IterationSummary {
                iteration,
                objective,
                validation: current_evaluation,
                seconds: iteration_timer.seconds(),
            });
        }

        let selected = match best_model {
            Some(best) => {
                log::info!("returning best validated model");
                best
            }
            None => {
                log::info!("returning final iteration's model");
                model
            }
        };
        if let Some(bundle) = &self.validation {
            self.report_final_metrics(&selected, bundle)?;
        }
        log::debug!(
            "run finished in {:.3}s; {} value(s) still pinned (~{} bytes)",
            run_timer.seconds(),
            self.substrate.live_handles(),
            self.substrate.pinned_bytes()
        );
        Ok(FitOutcome {
            model: selected,
            summaries,
        })
    }

    /// Score the selected model against every configured evaluator, not
    /// just the ranking one. Runs once, after selection, so the full
    /// metric suite costs one validation pass per coordinate total.
    fn report_final_metrics(
        &self,
        selected: &CompositeModel,
        bundle: &ValidationBundle<'a>,
    ) -> Result<(), DescentError> {
        let mut combined: Option<Score> = None;
        for (id, coordinate) in &self.coordinates {
            let sub = selected
                .get(id)
                .ok_or_else(|| DescentError::MissingCoordinateEntry(id.clone()))?;
            let score = coordinate.score(sub.as_ref(), bundle.data)?;
            combined = Some(match combined {
                Some(acc) => acc.combine(&score),
                None => score,
            });
        }
        let full = combined.unwrap_or_else(|| Score::empty(bundle.data.num_shards()));
        for evaluator in &bundle.evaluators {
            log::info!(
                "selected model {}: {:.6e}",
                evaluator.name(),
                evaluator.evaluate(&full)
            );
        }
        Ok(())
    }

    /// Pin every coordinate's initial sub-model and compute + pin its
    /// initial train (and validation) score.
    fn materialize_initial_state(
        &self,
        model: &CompositeModel,
    ) -> Result<Vec<CoordinateCache>, DescentError> {
        let mut caches = Vec::with_capacity(self.coordinates.len());
        for (id, coordinate) in &self.coordinates {
            let sub = model
                .get(id)
                .ok_or_else(|| DescentError::MissingCoordinateEntry(id.clone()))?;
            let model_handles = self.pin_model(id, sub.as_ref());
            let train_score = coordinate.score(sub.as_ref(), self.training_data)?;
            let train_handle = self.pin_score(&format!("train_score/{id}"), &train_score);
            let validation = match &self.validation {
                Some(bundle) => {
                    let score = coordinate.score(sub.as_ref(), bundle.data)?;
                    let handle =
                        self.pin_score(&format!("validation_score/{id}"), &score);
                    Some((score, handle))
                }
                None => None,
            };
            caches.push(CoordinateCache {
                model_handles,
                train_score,
                train_handle,
                validation,
            });
        }
        Ok(caches)
    }

    fn pin_model(&self, id: &str, sub: &dyn SubModel) -> Vec<ResourceHandle> {
        sub.storage()
            .into_iter()
            .map(|descriptor| self.substrate.pin(&format!("model/{id}"), descriptor))
            .collect()
    }

    fn pin_score(&self, label: &str, score: &Score) -> ResourceHandle {
        self.substrate.pin(
            label,
            StorageDescriptor {
                kind: StorageKind::Partitioned,
                approx_bytes: score.approx_bytes(),
            },
        )
    }

    /// Release a superseded sub-model's storage, broadcast handles before
    /// partitioned ones, each exactly once.
    fn release_ordered(&self, handles: Vec<ResourceHandle>) -> Result<(), StoreError> {
        for kind in [StorageKind::Broadcast, StorageKind::Partitioned] {
            for handle in handles.iter().filter(|h| h.kind() == kind) {
                self.substrate.release(*handle)?;
            }
        }
        Ok(())
    }

    /// The offset for coordinate `excluded`: every other coordinate's
    /// cached train score, combined.
    fn combine_excluding(&self, caches: &[CoordinateCache], excluded: usize) -> Score {
        let mut combined: Option<Score> = None;
        for (index, cache) in caches.iter().enumerate() {
            if index == excluded {
                continue;
            }
            combined = Some(match combined {
                Some(acc) => acc.combine(&cache.train_score),
                None => cache.train_score.clone(),
            });
        }
        combined.unwrap_or_else(|| Score::empty(self.training_data.num_shards()))
    }

    /// The full-model train score: every coordinate's cached score,
    /// combined.
    fn combine_train(&self, caches: &[CoordinateCache]) -> Score {
        let mut combined: Option<Score> = None;
        for cache in caches {
            combined = Some(match combined {
                Some(acc) => acc.combine(&cache.train_score),
                None => cache.train_score.clone(),
            });
        }
        combined.unwrap_or_else(|| Score::empty(self.training_data.num_shards()))
    }

    /// The full-model validation score. Every coordinate holds a cached
    /// validation score whenever a validation bundle is configured.
    fn combine_validation(&self, caches: &[CoordinateCache], num_shards: usize) -> Score {
        let mut combined: Option<Score> = None;
        for (score, _) in caches.iter().filter_map(|c| c.validation.as_ref()) {
            combined = Some(match combined {
                Some(acc) => acc.combine(score),
                None => score.clone(),
            });
        }
        combined.unwrap_or_else(|| Score::empty(num_shards))
    }
}
