//! # Single-block optimizers
//!
//! How one parameter block converges is not the driver's concern; it is
//! hidden behind [`BlockOptimizer`], a narrow collaborator consumed by the
//! concrete coordinates. The implementation shipped here is a plain
//! deterministic gradient descent on the L2-penalized weighted squared
//! error, which is enough for the linear coordinates in this crate.

use ndarray::{Array1, Array2};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OptimizerError {
    #[error("design matrix has {rows} rows but {targets} targets")]
    ShapeMismatch { rows: usize, targets: usize },
}

/// Fits one parameter block against fixed residual targets.
pub trait BlockOptimizer: Send + Sync {
    /// Returns updated weights for the block. `design` is row-per-record,
    /// `residuals` the targets after subtracting the offset, `weights` the
    /// per-record prior weights, `l2` the ridge penalty strength.
    fn fit(
        &self,
        design: &Array2<f64>,
        residuals: &Array1<f64>,
        weights: &Array1<f64>,
        current: &Array1<f64>,
        l2: f64,
    ) -> Result<Array1<f64>, OptimizerError>;

    /// Short name for diagnostics.
    fn name(&self) -> &'static str;
}

/// Fixed-step gradient descent on the penalized weighted least-squares
/// objective. Deterministic given identical inputs.
#[derive(Debug, Clone)]
pub struct GradientDescentOptimizer {
    pub steps: usize,
    pub learning_rate: f64,
}

impl Default for GradientDescentOptimizer {
    fn default() -> Self {
        Self {
            steps: 50,
            learning_rate: 0.1,
        }
    }
}

impl BlockOptimizer for GradientDescentOptimizer {
    fn fit(
        &self,
        design: &Array2<f64>,
        residuals: &Array1<f64>,
        weights: &Array1<f64>,
        current: &Array1<f64>,
        l2: f64,
    ) -> Result<Array1<f64>, OptimizerError> {
        let rows = design.nrows();
        if rows != residuals.len() || rows != weights.len() {
            return Err(OptimizerError::ShapeMismatch {
                rows,
                targets: residuals.len(),
            });
        }
        let total_weight: f64 = weights.sum();
        if rows == 0 || total_weight == 0.0 {
            return Ok(current.clone());
        }
        let mut beta = current.clone();
        for _ in 0..self.steps {
            // grad = X^T W (X beta - r) / sum(W) + l2 * beta
            let fitted = design.dot(&beta);
            let weighted_error = (&fitted - residuals) * weights;
            let mut grad = design.t().dot(&weighted_error) / total_weight;
            grad = grad + &beta * l2;
            beta = beta - grad * self.learning_rate;
        }
        Ok(beta)
    }

    fn name(&self) -> &'static str {
        "gradient_descent"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};

    #[test]
    fn recovers_a_simple_linear_fit() {
        // y = 2x, no penalty: the minimizer is beta = 2.
        let design = Array2::from_shape_vec((4, 1), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let residuals = array![2.0, 4.0, 6.0, 8.0];
        let weights = array![1.0, 1.0, 1.0, 1.0];
        let opt = GradientDescentOptimizer {
            steps: 500,
            learning_rate: 0.05,
        };
        let beta = opt
            .fit(&design, &residuals, &weights, &array![0.0], 0.0)
            .unwrap();
        assert_abs_diff_eq!(beta[0], 2.0, epsilon = 1e-6);
    }

    #[test]
    fn l2_penalty_shrinks_toward_zero() {
        let design = Array2::from_shape_vec((2, 1), vec![1.0, 1.0]).unwrap();
        let residuals = array![1.0, 1.0];
        let weights = array![1.0, 1.0];
        let opt = GradientDescentOptimizer {
            steps: 500,
            learning_rate: 0.1,
        };
        let free = opt
            .fit(&design, &residuals, &weights, &array![0.0], 0.0)
            .unwrap();
        let ridge = opt
            .fit(&design, &residuals, &weights, &array![0.0], 1.0)
            .unwrap();
        assert!(ridge[0] < free[0]);
        assert!(ridge[0] > 0.0);
    }

    #[test]
    fn empty_block_returns_current_weights() {
        let design = Array2::zeros((0, 2));
        let opt = GradientDescentOptimizer::default();
        let beta = opt
            .fit(
                &design,
                &Array1::zeros(0),
                &Array1::zeros(0),
                &array![1.5, -0.5],
                0.1,
            )
            .unwrap();
        assert_eq!(beta, array![1.5, -0.5]);
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let design = Array2::zeros((3, 1));
        let opt = GradientDescentOptimizer::default();
        let err = opt
            .fit(
                &design,
                &Array1::zeros(2),
                &Array1::zeros(3),
                &array![0.0],
                0.0,
            )
            .unwrap_err();
        assert!(matches!(err, OptimizerError::ShapeMismatch { .. }));
    }
}
