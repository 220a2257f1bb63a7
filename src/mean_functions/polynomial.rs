use super::MeanFunction;
use crate::errors::{NnglsError, Result};
use linfa::Float;
use linfa_linalg::{cholesky::*, triangular::*};
use ndarray::{Array1, Array2, ArrayBase, Axis, Data, Ix1, Ix2, concatenate, s};
use paste::paste;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;

/// A trait for polynomial regression basis
pub trait RegressionBasis<F: Float>:
    Clone + Copy + Default + fmt::Display + fmt::Debug + Send + Sync
{
    /// Regression factors at the given `x` data points specified as (n, nx) matrix.
    fn value(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array2<F>;

    /// Number of regression factors for `nx` input components
    fn n_factors(&self, nx: usize) -> usize;
}

/// A constant basis
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(into = "String"),
    serde(try_from = "String")
)]
pub struct ConstantBasis();

impl<F: Float> RegressionBasis<F> for ConstantBasis {
    /// regr(x) = [1, ..., 1].T
    fn value(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array2<F> {
        Array2::<F>::ones((x.nrows(), 1))
    }

    fn n_factors(&self, _nx: usize) -> usize {
        1
    }
}

/// An affine basis
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(into = "String"),
    serde(try_from = "String")
)]
pub struct LinearBasis();

impl<F: Float> RegressionBasis<F> for LinearBasis {
    /// regr(x) = [ 1, x_1, ..., x_n ].T
    fn value(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array2<F> {
        concatenate![Axis(1), Array2::ones((x.nrows(), 1)), x.to_owned()]
    }

    fn n_factors(&self, nx: usize) -> usize {
        nx + 1
    }
}

/// A 2-degree polynomial basis
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(into = "String"),
    serde(try_from = "String")
)]
pub struct QuadraticBasis();

impl<F: Float> RegressionBasis<F> for QuadraticBasis {
    /// regr(x) = [ 1, { x_i, i = 1,...,n }, { x_i * x_j,  (i,j) = 1,...,n  , j >= i } ].T
    fn value(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array2<F> {
        let mut res = concatenate![Axis(1), Array2::ones((x.nrows(), 1)), x.to_owned()];
        for k in 0..x.ncols() {
            let part = x.slice(s![.., k..]).to_owned() * x.slice(s![.., k..k + 1]);
            res = concatenate![Axis(1), res, part]
        }
        res
    }

    fn n_factors(&self, nx: usize) -> usize {
        1 + nx + nx * (nx + 1) / 2
    }
}

macro_rules! declare_basis_util_impls {
    ($regr:ident) => {
        paste! {
            impl fmt::Display for [<$regr Basis>] {
                fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                    write!(f, "{}Basis", stringify!($regr))
                }
            }

            impl From<[<$regr Basis>]> for String {
                fn from(_item: [<$regr Basis>]) -> Self {
                    [<$regr Basis>]().to_string()
                }
            }

            impl TryFrom<String> for [<$regr Basis>] {
                type Error = &'static str;
                fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
                    if s == stringify!([<$regr Basis>]) {
                        Ok(Self::default())
                    } else {
                        Err(concat!("Bad string value, should be \'", stringify!([<$regr Basis>]), "\'"))
                    }
                }
            }
        }
    };
}

declare_basis_util_impls!(Constant);
declare_basis_util_impls!(Linear);
declare_basis_util_impls!(Quadratic);

/// Polynomial regression `f(x) = regr(x) . beta`
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(
        serialize = "F: Serialize, B: Serialize",
        deserialize = "F: Deserialize<'de>, B: Deserialize<'de>"
    ))
)]
pub struct PolynomialMean<F: Float, B: RegressionBasis<F>> {
    basis: B,
    n_inputs: usize,
    beta: Array1<F>,
}

/// Ordinary linear regression `f(x) = beta_0 + sum beta_i x_i`
pub type LinearMean<F> = PolynomialMean<F, LinearBasis>;

impl<F: Float, B: RegressionBasis<F>> PolynomialMean<F, B> {
    /// Zero coefficients for `n_inputs` covariates
    pub fn new(basis: B, n_inputs: usize) -> Self {
        PolynomialMean {
            basis,
            n_inputs,
            beta: Array1::zeros(basis.n_factors(n_inputs)),
        }
    }

    /// Ordinary least squares fit of `y` on `x`: solves `(P^T P) beta = P^T y` with `P = regr(x)`
    /// using a Cholesky factorization.
    pub fn fit_ols(
        basis: B,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        y: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Result<Self> {
        if x.nrows() != y.len() {
            return Err(NnglsError::InvalidConfigError(format!(
                "covariates rows ({}) should match responses length ({})",
                x.nrows(),
                y.len()
            )));
        }
        let p = basis.value(x);
        if p.nrows() < p.ncols() {
            return Err(NnglsError::InvalidConfigError(format!(
                "not enough observations ({}) for {} regression factors",
                p.nrows(),
                p.ncols()
            )));
        }
        let mut ptp = p.t().dot(&p);
        // tiny ridge for collinear designs
        let scale = ptp.diag().iter().fold(F::zero(), |acc, &v| acc.max(v));
        ptp.diag_mut()
            .mapv_inplace(|v| v + F::cast(1e-12) * scale.max(F::one()));
        let pty = p.t().dot(y).insert_axis(Axis(1));
        let chol = ptp.cholesky()?;
        let z = chol.solve_triangular(&pty, UPLO::Lower)?;
        let beta = chol.t().solve_triangular(&z, UPLO::Upper)?;
        Ok(PolynomialMean {
            basis,
            n_inputs: x.ncols(),
            beta: beta.remove_axis(Axis(1)),
        })
    }

    /// Regression coefficients
    pub fn beta(&self) -> &Array1<F> {
        &self.beta
    }
}

impl<F: Float, B: RegressionBasis<F>> fmt::Display for PolynomialMean<F, B> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PolynomialMean({}, beta={})", self.basis, self.beta)
    }
}

impl<F: Float, B: RegressionBasis<F>> MeanFunction<F> for PolynomialMean<F, B> {
    fn n_inputs(&self) -> usize {
        self.n_inputs
    }

    fn predict(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array1<F> {
        self.basis.value(x).dot(&self.beta)
    }

    fn parameters(&self) -> Array1<F> {
        self.beta.to_owned()
    }

    fn set_parameters(&mut self, params: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<()> {
        if params.len() != self.beta.len() {
            return Err(NnglsError::InvalidConfigError(format!(
                "expected {} parameters, got {}",
                self.beta.len(),
                params.len()
            )));
        }
        self.beta.assign(params);
        Ok(())
    }

    fn gradient(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        dloss_dpred: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Array1<F> {
        self.basis.value(x).t().dot(dloss_dpred)
    }
}
