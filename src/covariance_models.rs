//! A module for stationary isotropic covariance models of the spatial random effect.
//!
//! The covariance between two observations separated by a distance `d` reads
//!
//! `C(d) = sigma2 * rho(d / phi) + tau2 * [same observation]`
//!
//! where `rho` is the kernel correlation (`rho(0) = 1`), `sigma2` the process variance,
//! `phi` the range and `tau2` the nugget variance.
//!
//! The following kernels are implemented:
//! * exponential (default),
//! * squared exponential,
//! * matern 3/2,
//! * matern 5/2.

use crate::errors::{NnglsError, Result};
use linfa::Float;
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;

/// Covariance parameters, a.k.a. theta: (process variance, range, nugget variance)
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct CovParams<F: Float> {
    sigma2: F,
    phi: F,
    tau2: F,
}

impl<F: Float> CovParams<F> {
    /// Constructor, all of `sigma2`, `phi` and `tau2` have to be positive finite values
    pub fn new(sigma2: F, phi: F, tau2: F) -> Result<Self> {
        for (name, v) in [("sigma2", sigma2), ("phi", phi), ("tau2", tau2)] {
            if !(v > F::zero()) || !v.is_finite() {
                return Err(NnglsError::InvalidConfigError(format!(
                    "covariance parameter `{name}` should be positive and finite, got {v}"
                )));
            }
        }
        Ok(CovParams { sigma2, phi, tau2 })
    }

    /// Build from a `[sigma2, phi, tau2]` array
    pub fn from_array(theta: &Array1<F>) -> Result<Self> {
        if theta.len() != 3 {
            return Err(NnglsError::InvalidConfigError(format!(
                "theta should have 3 components (sigma2, phi, tau2), got {}",
                theta.len()
            )));
        }
        Self::new(theta[0], theta[1], theta[2])
    }

    /// Process variance
    pub fn sigma2(&self) -> F {
        self.sigma2
    }

    /// Range parameter
    pub fn phi(&self) -> F {
        self.phi
    }

    /// Nugget variance
    pub fn tau2(&self) -> F {
        self.tau2
    }

    /// Total variance of one observation `sigma2 + tau2`
    pub fn sill(&self) -> F {
        self.sigma2 + self.tau2
    }

    /// As a `[sigma2, phi, tau2]` array
    pub fn to_array(&self) -> Array1<F> {
        Array1::from(vec![self.sigma2, self.phi, self.tau2])
    }
}

impl<F: Float> fmt::Display for CovParams<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "(sigma2={}, phi={}, tau2={})",
            self.sigma2, self.phi, self.tau2
        )
    }
}

/// A trait for using a covariance model in NNGP computations
pub trait CovarianceModel<F: Float>:
    Clone + Copy + Default + fmt::Display + Send + Sync
{
    /// Kernel correlation at the scaled distance `h = d / phi`, with `rho(0) = 1`
    fn correlation(&self, h: F) -> F;

    /// Covariance of one observation with itself or another observation at distance `d`.
    /// The nugget only contributes at `d == 0`.
    fn covariance(&self, d: F, theta: &CovParams<F>) -> F {
        let c = theta.sigma2 * self.correlation(d / theta.phi);
        if d == F::zero() { c + theta.tau2 } else { c }
    }

    /// Covariance between two distinct observations at distance `d`:
    /// no nugget even when their coordinates are identical.
    fn cross_covariance(&self, d: F, theta: &CovParams<F>) -> F {
        theta.sigma2 * self.correlation(d / theta.phi)
    }

    /// Covariance matrix among distinct observations located at `coords` rows (n, dim).
    /// The nugget is added on the diagonal only.
    fn covariance_matrix(
        &self,
        coords: &ArrayBase<impl Data<Elem = F>, Ix2>,
        theta: &CovParams<F>,
    ) -> Array2<F> {
        let n = coords.nrows();
        let mut cov = Array2::zeros((n, n));
        for i in 0..n {
            cov[[i, i]] = theta.sill();
            for j in 0..i {
                let d = euclidean(&coords.row(i), &coords.row(j));
                let c = self.cross_covariance(d, theta);
                cov[[i, j]] = c;
                cov[[j, i]] = c;
            }
        }
        cov
    }
}

/// Euclidean distance between two points
pub fn euclidean<F: Float>(
    a: &ArrayBase<impl Data<Elem = F>, ndarray::Ix1>,
    b: &ArrayBase<impl Data<Elem = F>, ndarray::Ix1>,
) -> F {
    squared_euclidean(a, b).sqrt()
}

/// Squared euclidean distance between two points
pub fn squared_euclidean<F: Float>(
    a: &ArrayBase<impl Data<Elem = F>, ndarray::Ix1>,
    b: &ArrayBase<impl Data<Elem = F>, ndarray::Ix1>,
) -> F {
    a.iter()
        .zip(b.iter())
        .fold(F::zero(), |acc, (&u, &v)| acc + (u - v) * (u - v))
}

macro_rules! declare_cov_model {
    ($name:ident, $label:literal) => {
        impl From<$name> for String {
            fn from(_item: $name) -> String {
                $label.to_string()
            }
        }

        impl TryFrom<String> for $name {
            type Error = &'static str;
            fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
                if s == $label {
                    Ok(Self::default())
                } else {
                    Err(concat!(
                        "Bad string value for ",
                        stringify!($name),
                        ", should be \'",
                        $label,
                        "\'"
                    ))
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, $label)
            }
        }
    };
}

/// Exponential covariance model: `rho(h) = exp(-h)`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(into = "String"),
    serde(try_from = "String")
)]
pub struct ExponentialCov();

declare_cov_model!(ExponentialCov, "Exponential");

impl<F: Float> CovarianceModel<F> for ExponentialCov {
    fn correlation(&self, h: F) -> F {
        F::exp(-h)
    }
}

/// Squared exponential covariance model: `rho(h) = exp(-h^2 / 2)`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(into = "String"),
    serde(try_from = "String")
)]
pub struct SquaredExponentialCov();

declare_cov_model!(SquaredExponentialCov, "SquaredExponential");

impl<F: Float> CovarianceModel<F> for SquaredExponentialCov {
    fn correlation(&self, h: F) -> F {
        F::exp(F::cast(-0.5) * h * h)
    }
}

/// Matern 3/2 covariance model: `rho(h) = (1 + sqrt(3) h) exp(-sqrt(3) h)`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(into = "String"),
    serde(try_from = "String")
)]
pub struct Matern32Cov();

declare_cov_model!(Matern32Cov, "Matern32");

impl<F: Float> CovarianceModel<F> for Matern32Cov {
    fn correlation(&self, h: F) -> F {
        let a = F::cast(3.).sqrt() * h;
        (F::one() + a) * F::exp(-a)
    }
}

/// Matern 5/2 covariance model: `rho(h) = (1 + sqrt(5) h + 5/3 h^2) exp(-sqrt(5) h)`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(into = "String"),
    serde(try_from = "String")
)]
pub struct Matern52Cov();

declare_cov_model!(Matern52Cov, "Matern52");

impl<F: Float> CovarianceModel<F> for Matern52Cov {
    fn correlation(&self, h: F) -> F {
        let a = F::cast(5.).sqrt() * h;
        (F::one() + a + a * a / F::cast(3.)) * F::exp(-a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use paste::paste;

    #[test]
    fn test_cov_params_rejects_non_positive() {
        assert!(CovParams::new(1., 1., 0.1).is_ok());
        assert!(CovParams::new(0., 1., 0.1).is_err());
        assert!(CovParams::new(1., -1., 0.1).is_err());
        assert!(CovParams::new(1., 1., 0.).is_err());
        assert!(CovParams::new(f64::NAN, 1., 0.1).is_err());
        assert!(CovParams::new(1., f64::INFINITY, 0.1).is_err());
        assert!(CovParams::from_array(&array![1., 2.]).is_err());
    }

    macro_rules! test_cov_model {
        ($cov:ident) => {
            paste! {
                #[test]
                fn [<test_ $cov:snake _at_zero_and_decreasing>]() {
                    let model = [<$cov Cov>]::default();
                    for theta in [
                        CovParams::new(1., 3. / f64::sqrt(2.), 0.01).unwrap(),
                        CovParams::new(2.5, 0.1, 1e-6).unwrap(),
                        CovParams::new(0.3, 10., 0.5).unwrap(),
                    ] {
                        assert_abs_diff_eq!(
                            model.covariance(0., &theta),
                            theta.sigma2() + theta.tau2(),
                            epsilon = 1e-12
                        );
                        assert_abs_diff_eq!(
                            model.cross_covariance(0., &theta),
                            theta.sigma2(),
                            epsilon = 1e-12
                        );
                        let mut prev = model.covariance(0., &theta);
                        for i in 1..200 {
                            let d = i as f64 * 0.05 * theta.phi();
                            let c = model.covariance(d, &theta);
                            assert!(c < prev, "not decreasing at d={d}");
                            assert!(c > 0.);
                            prev = c;
                        }
                    }
                }

                #[test]
                fn [<test_ $cov:snake _string_roundtrip>]() {
                    let s: String = [<$cov Cov>]::default().into();
                    assert_eq!(s, [<$cov Cov>]::default().to_string());
                    assert!([<$cov Cov>]::try_from(s).is_ok());
                    assert!([<$cov Cov>]::try_from("Foo".to_string()).is_err());
                }
            }
        };
    }

    test_cov_model!(Exponential);
    test_cov_model!(SquaredExponential);
    test_cov_model!(Matern32);
    test_cov_model!(Matern52);

    #[test]
    fn test_exponential_value() {
        let theta = CovParams::new(2., 0.5, 0.1).unwrap();
        let c: f64 = ExponentialCov().covariance(1., &theta);
        assert_abs_diff_eq!(c, 2. * f64::exp(-2.), epsilon = 1e-12);
    }

    #[test]
    fn test_covariance_matrix_nugget_on_diagonal_only() {
        // two distinct observations at the same location
        let coords = array![[0., 0.], [0., 0.], [3., 4.]];
        let theta = CovParams::new(1., 5., 0.2).unwrap();
        let cov = ExponentialCov().covariance_matrix(&coords, &theta);
        assert_abs_diff_eq!(cov[[0, 0]], 1.2, epsilon = 1e-12);
        assert_abs_diff_eq!(cov[[0, 1]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(cov[[0, 2]], f64::exp(-1.), epsilon = 1e-12);
        assert_abs_diff_eq!(cov[[2, 0]], cov[[0, 2]], epsilon = 1e-15);
    }
}
