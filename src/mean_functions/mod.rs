//! Mean functions `f(x)` modelling the non-linear covariate effect.
//!
//! The training loop only needs forward evaluation and the gradient of a loss
//! w.r.t. the flat parameter vector given the gradient of that loss w.r.t. the
//! outputs (back-propagation). Any approximator implementing [MeanFunction] can be
//! trained with the NNGP-based GLS loss.
//!
//! The following mean functions are implemented:
//! * [Mlp]: feed-forward neural network,
//! * [PolynomialMean]: polynomial regression (constant, linear, quadratic) also used
//!   as the ordinary least squares non-spatial baseline.
mod mlp;
mod polynomial;

pub use mlp::*;
pub use polynomial::*;

use crate::errors::Result;
use linfa::Float;
use ndarray::{Array1, ArrayBase, Data, Ix1, Ix2};
use std::fmt;

/// A trait for trainable mean functions
pub trait MeanFunction<F: Float>: Clone + fmt::Debug + fmt::Display + Send + Sync {
    /// Number of input covariates
    fn n_inputs(&self) -> usize;

    /// Predict mean values at `x` (n, n_inputs), returns a (n,) vector
    fn predict(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array1<F>;

    /// Flat vector of trainable parameters
    fn parameters(&self) -> Array1<F>;

    /// Set trainable parameters from a flat vector of the same length as [MeanFunction::parameters]
    fn set_parameters(&mut self, params: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<()>;

    /// Gradient of a loss w.r.t. parameters given `dloss_dpred`, the (n,) gradient of the
    /// loss w.r.t. predictions at `x` (n, n_inputs)
    fn gradient(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        dloss_dpred: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Array1<F>;
}
