//! # Objective function values
//!
//! After every block update the driver recombines all cached scores into
//! the full-model score and reports the training objective: the data loss
//! under the configured [`LossFunction`] plus the sum of every
//! coordinate's regularization term.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::data::{CoordinateId, DataSet};
use crate::score::Score;

/// Per-coordinate regularization terms, summed into the objective.
pub type RegularizationMap = BTreeMap<CoordinateId, f64>;

/// The training objective after one block update.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ObjectiveFunctionValue {
    pub loss: f64,
    pub regularization: f64,
}

impl ObjectiveFunctionValue {
    pub fn total(&self) -> f64 {
        self.loss + self.regularization
    }
}

impl fmt::Display for ObjectiveFunctionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "loss = {:.6e}, regularization = {:.6e}, total = {:.6e}",
            self.loss,
            self.regularization,
            self.total()
        )
    }
}

/// Data-loss collaborator evaluated on the full-model score. The concrete
/// formula is outside the orchestration contract.
pub trait LossFunction: Send + Sync {
    fn evaluate(&self, score: &Score) -> f64;
}

/// Weighted mean squared error against the training labels. Records the
/// score never touched are treated as predicted 0.
#[derive(Debug)]
pub struct SquaredLoss {
    labels: Vec<(u64, f64, f64)>,
    total_weight: f64,
}

impl SquaredLoss {
    pub fn from_data(data: &DataSet) -> Self {
        let labels: Vec<(u64, f64, f64)> = data
            .iter()
            .map(|(id, point)| (*id, point.label, point.weight))
            .collect();
        let total_weight = labels.iter().map(|(_, _, w)| w).sum();
        Self {
            labels,
            total_weight,
        }
    }
}

impl LossFunction for SquaredLoss {
    fn evaluate(&self, score: &Score) -> f64 {
        if self.total_weight == 0.0 {
            return 0.0;
        }
        let weighted_sq: f64 = self
            .labels
            .iter()
            .map(|(id, label, weight)| {
                let predicted = score.get(*id).unwrap_or(0.0);
                let diff = predicted - label;
                weight * diff * diff
            })
            .sum();
        weighted_sq / self.total_weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataPoint;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn data() -> DataSet {
        DataSet::from_records(
            vec![
                (1, DataPoint::new(1.0, 1.0, array![0.0])),
                (2, DataPoint::new(2.0, 3.0, array![0.0])),
            ],
            2,
        )
    }

    #[test]
    fn squared_loss_is_weighted_mean() {
        let loss = SquaredLoss::from_data(&data());
        let score = Score::from_entries(vec![(1, 2.0), (2, 2.0)], 2);
        // ((1 * 1^2) + (3 * 0^2)) / 4
        assert_abs_diff_eq!(loss.evaluate(&score), 0.25);
    }

    #[test]
    fn unscored_records_predict_zero() {
        let loss = SquaredLoss::from_data(&data());
        let score = Score::empty(2);
        // ((1 * 1^2) + (3 * 2^2)) / 4
        assert_abs_diff_eq!(loss.evaluate(&score), 3.25);
    }

    #[test]
    fn objective_total_and_display() {
        let value = ObjectiveFunctionValue {
            loss: 1.5,
            regularization: 0.5,
        };
        assert_abs_diff_eq!(value.total(), 2.0);
        assert!(value.to_string().contains("total"));
    }
}
