//! # Evaluators
//!
//! An evaluator turns a full-model score into a single validation metric
//! and defines which direction of that metric is better. The driver ranks
//! candidate models with `better_than(current, best)`; the comparison is
//! strict, so a tie keeps the previously recorded best.

use ahash::AHashMap;
use serde::Serialize;

use crate::data::{DataSet, RecordId};
use crate::score::Score;

/// A named validation metric recorded for one model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationRecord {
    pub evaluator: String,
    pub metric: f64,
}

/// Pluggable validation metric with a better-than ordering.
pub trait Evaluator: Send + Sync {
    /// Metric of the full-model score against the held-out labels.
    fn evaluate(&self, score: &Score) -> f64;

    /// Strict ranking: is metric `a` better than metric `b`?
    fn better_than(&self, a: f64, b: f64) -> bool;

    /// Name used in logs and [`EvaluationRecord`]s.
    fn name(&self) -> &str;
}

fn label_table(data: &DataSet) -> AHashMap<RecordId, f64> {
    data.iter().map(|(id, point)| (*id, point.label)).collect()
}

/// Root mean squared error; lower is better.
#[derive(Debug)]
pub struct RmseEvaluator {
    labels: AHashMap<RecordId, f64>,
}

impl RmseEvaluator {
    pub fn from_data(data: &DataSet) -> Self {
        Self {
            labels: label_table(data),
        }
    }
}

impl Evaluator for RmseEvaluator {
    fn evaluate(&self, score: &Score) -> f64 {
        if self.labels.is_empty() {
            return 0.0;
        }
        let sum_sq: f64 = self
            .labels
            .iter()
            .map(|(id, label)| {
                let diff = score.get(*id).unwrap_or(0.0) - label;
                diff * diff
            })
            .sum();
        (sum_sq / self.labels.len() as f64).sqrt()
    }

    fn better_than(&self, a: f64, b: f64) -> bool {
        a < b
    }

    fn name(&self) -> &str {
        "RMSE"
    }
}

/// Mean absolute error; lower is better.
#[derive(Debug)]
pub struct MeanAbsoluteErrorEvaluator {
    labels: AHashMap<RecordId, f64>,
}

impl MeanAbsoluteErrorEvaluator {
    pub fn from_data(data: &DataSet) -> Self {
        Self {
            labels: label_table(data),
        }
    }
}

impl Evaluator for MeanAbsoluteErrorEvaluator {
    fn evaluate(&self, score: &Score) -> f64 {
        if self.labels.is_empty() {
            return 0.0;
        }
        let sum_abs: f64 = self
            .labels
            .iter()
            .map(|(id, label)| (score.get(*id).unwrap_or(0.0) - label).abs())
            .sum();
        sum_abs / self.labels.len() as f64
    }

    fn better_than(&self, a: f64, b: f64) -> bool {
        a < b
    }

    fn name(&self) -> &str {
        "MAE"
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
                (2, DataPoint::new(-1.0, 1.0, array![0.0])),
            ],
            2,
        )
    }

    #[test]
    fn rmse_of_exact_predictions_is_zero() {
        let eval = RmseEvaluator::from_data(&data());
        let score = Score::from_entries(vec![(1, 1.0), (2, -1.0)], 2);
        assert_abs_diff_eq!(eval.evaluate(&score), 0.0);
    }

    #[test]
    fn rmse_counts_missing_predictions_as_zero() {
        let eval = RmseEvaluator::from_data(&data());
        assert_abs_diff_eq!(eval.evaluate(&Score::empty(2)), 1.0);
    }

    #[test]
    fn lower_rmse_ranks_better_and_ties_do_not() {
        let eval = RmseEvaluator::from_data(&data());
        assert!(eval.better_than(0.5, 1.0));
        assert!(!eval.better_than(1.0, 0.5));
        assert!(!eval.better_than(1.0, 1.0));
    }

    #[test]
    fn mae_is_the_mean_absolute_gap() {
        let eval = MeanAbsoluteErrorEvaluator::from_data(&data());
        let score = Score::from_entries(vec![(1, 2.0), (2, -1.0)], 2);
        assert_abs_diff_eq!(eval.evaluate(&score), 0.5);
    }
}
