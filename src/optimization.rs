//! Optimizers: bounded COBYLA minimization used to estimate covariance parameters
//! and Adam steps used to train the mean function.

use linfa::Float;
use ndarray::{Array1, ArrayBase, Data, Ix1, arr1};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// COBYLA settings used for covariance parameters estimation
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct CobylaParams {
    /// Initial trust region radius
    pub rhobeg: f64,
    /// Relative tolerance on objective value
    pub ftol_rel: f64,
    /// Max number of objective evaluations
    pub maxeval: usize,
}

impl Default for CobylaParams {
    fn default() -> Self {
        CobylaParams {
            rhobeg: 0.5,
            ftol_rel: 1e-4,
            maxeval: 200,
        }
    }
}

/// Minimize `objfn` within `bounds` starting from `param0` with COBYLA.
/// Returns the best objective value (infinity on failure) and the parameters.
pub(crate) fn optimize_params<ObjF>(
    objfn: ObjF,
    param0: &[f64],
    bounds: &[(f64, f64)],
    cobyla: CobylaParams,
) -> (f64, Array1<f64>)
where
    ObjF: Fn(&[f64]) -> f64,
{
    use cobyla::{Func, StopTols, minimize};

    let cons: Vec<&dyn Func<()>> = vec![];

    match minimize(
        |x: &[f64], _u: &mut ()| objfn(x),
        param0,
        bounds,
        &cons,
        (),
        cobyla.maxeval,
        cobyla::RhoBeg::All(cobyla.rhobeg),
        Some(StopTols {
            ftol_rel: cobyla.ftol_rel,
            ..StopTols::default()
        }),
    ) {
        Ok((_, x_opt, fval)) => {
            let params_opt = arr1(&x_opt);
            let fval = if f64::is_nan(fval) {
                f64::INFINITY
            } else {
                fval
            };
            (fval, params_opt)
        }
        Err((status, x_opt, _)) => {
            log::warn!("ERROR Cobyla optimizer in theta estimation status={status:?}");
            (f64::INFINITY, arr1(&x_opt))
        }
    }
}

/// Adam first order optimizer state for a flat parameter vector.
///
/// Kingma, D. P., & Ba, J. (2015). Adam: A method for stochastic optimization.
#[derive(Clone, Debug)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(deserialize = "F: Deserialize<'de>"))
)]
pub struct Adam<F: Float> {
    learning_rate: F,
    beta1: F,
    beta2: F,
    eps: F,
    m: Array1<F>,
    v: Array1<F>,
    t: i32,
}

impl<F: Float> Adam<F> {
    /// Optimizer for `n_params` parameters with the usual (0.9, 0.999, 1e-8) settings
    pub fn new(n_params: usize, learning_rate: F) -> Self {
        Adam {
            learning_rate,
            beta1: F::cast(0.9),
            beta2: F::cast(0.999),
            eps: F::cast(1e-8),
            m: Array1::zeros(n_params),
            v: Array1::zeros(n_params),
            t: 0,
        }
    }

    /// Learning rate
    pub fn learning_rate(&self) -> F {
        self.learning_rate
    }

    /// Number of steps done
    pub fn steps(&self) -> usize {
        self.t as usize
    }

    /// Update `params` in place given the loss `grad`
    pub fn step(
        &mut self,
        params: &mut Array1<F>,
        grad: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) {
        self.t += 1;
        let one = F::one();
        let bc1 = one - self.beta1.powi(self.t);
        let bc2 = one - self.beta2.powi(self.t);
        for ((p, m), (v, &g)) in params
            .iter_mut()
            .zip(self.m.iter_mut())
            .zip(self.v.iter_mut().zip(grad.iter()))
        {
            *m = self.beta1 * *m + (one - self.beta1) * g;
            *v = self.beta2 * *v + (one - self.beta2) * g * g;
            let m_hat = *m / bc1;
            let v_hat = *v / bc2;
            *p -= self.learning_rate * m_hat / (v_hat.sqrt() + self.eps);
        }
    }
}
