//! Covariance parameters (theta) estimation from mean function residuals.
//!
//! Estimators implement [ThetaEstimator] and are called at the start of training and at
//! the re-estimation epochs. Whatever the residuals, an estimator returns valid (positive)
//! parameters: on degenerate inputs it falls back to the current value.
//!
//! Available strategies:
//! * [VecchiaMle] (default): maximization of the NNGP (Vecchia) likelihood with COBYLA,
//! * [Variogram]: method of moments fit of the empirical semivariogram,
//! * [FixedTheta]: no estimation, theta stays at its initial value.

use crate::covariance_models::{CovParams, CovarianceModel};
use crate::decorrelation::{JitterPolicy, NngpFactor};
use crate::errors::{NnglsError, Result};
use crate::neighbors::NeighborGraph;
use crate::optimization::{CobylaParams, optimize_params};
use linfa::Float;
use log::{debug, warn};
use ndarray::{Array1, ArrayBase, Data, Ix1, Ix2};
use ndarray_rand::rand::{Rng, SeedableRng};
use ndarray_stats::QuantileExt;
use rand_xoshiro::Xoshiro256Plus;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::fmt;

/// A trait for covariance parameters estimation strategies
pub trait ThetaEstimator<F: Float>: Clone + fmt::Debug + fmt::Display + Send + Sync {
    /// Estimate theta for `residuals` observed at `coords` rows whose Vecchia
    /// conditioning sets are given by `graph`, starting from `current`.
    fn estimate<C: CovarianceModel<F>>(
        &self,
        model: &C,
        residuals: &ArrayBase<impl Data<Elem = F>, Ix1>,
        coords: &ArrayBase<impl Data<Elem = F> + Sync, Ix2>,
        graph: &NeighborGraph<F>,
        current: &CovParams<F>,
        jitter: &JitterPolicy,
    ) -> Result<CovParams<F>>;
}

fn to_f64<F: Float>(v: F) -> f64 {
    num_traits::ToPrimitive::to_f64(&v).unwrap_or(f64::NAN)
}

/// Empirical variance of values, `None` when not positive finite
pub(crate) fn variance<F: Float>(values: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().map(|v| to_f64(*v)).sum::<f64>() / n;
    let var = values
        .iter()
        .map(|v| (to_f64(*v) - mean).powi(2))
        .sum::<f64>()
        / n;
    (var > 0. && var.is_finite()).then_some(var)
}

/// Diagonal length of the bounding box of the points
pub(crate) fn bounding_box_diameter<F: Float>(coords: &ArrayBase<impl Data<Elem = F>, Ix2>) -> f64 {
    coords
        .columns()
        .into_iter()
        .map(|col| match (col.min(), col.max()) {
            (Ok(lo), Ok(hi)) => to_f64(*hi - *lo).powi(2),
            _ => 0.,
        })
        .sum::<f64>()
        .sqrt()
}

/// Mean distance of each non root node to its nearest prior neighbor
fn mean_nearest_distance<F: Float>(graph: &NeighborGraph<F>) -> f64 {
    let dists: Vec<f64> = (0..graph.len())
        .filter_map(|i| graph.distances(i).first().map(|d| to_f64(*d)))
        .collect();
    if dists.is_empty() {
        0.
    } else {
        dists.iter().sum::<f64>() / dists.len() as f64
    }
}

/// Search space of (sigma2, phi, tau2) in log10 scale derived from the residuals
/// variance and the spatial extent of the data. `None` when data are degenerate.
fn log10_bounds<F: Float>(
    var: f64,
    coords: &ArrayBase<impl Data<Elem = F>, Ix2>,
    graph: &NeighborGraph<F>,
) -> Option<[(f64, f64); 3]> {
    let diam = bounding_box_diameter(coords);
    if !(diam > 0.) || !diam.is_finite() {
        return None;
    }
    let nn = mean_nearest_distance(graph);
    let phi_lo = if nn > 0. { 0.1 * nn } else { 1e-3 * diam };
    let phi_up = 2. * diam;
    Some([
        ((var * 1e-3).log10(), (var * 10.).log10()),
        (phi_lo.log10(), phi_up.log10().max(phi_lo.log10() + 1.)),
        ((var * 1e-6).log10(), (var * 10.).log10()),
    ])
}

fn clamp_into(x: f64, (lo, up): (f64, f64)) -> f64 {
    if x.is_finite() { x.clamp(lo, up) } else { 0.5 * (lo + up) }
}

/// Starting theta when none is given: 90% of the residuals variance as process variance,
/// 10% as nugget and a range of a tenth of the domain diameter.
pub fn initial_guess<F: Float>(
    residuals: &ArrayBase<impl Data<Elem = F>, Ix1>,
    coords: &ArrayBase<impl Data<Elem = F>, Ix2>,
) -> Result<CovParams<F>> {
    let var = variance(residuals).unwrap_or(1.);
    let diam = bounding_box_diameter(coords);
    let phi = if diam > 0. && diam.is_finite() {
        0.1 * diam
    } else {
        1.
    };
    CovParams::new(F::cast(0.9 * var), F::cast(phi), F::cast(0.1 * var))
}

fn check_residuals<F: Float>(n_res: usize, graph: &NeighborGraph<F>, n_coords: usize) -> Result<()> {
    if n_res != graph.len() || n_coords != graph.len() {
        return Err(NnglsError::InvalidConfigError(format!(
            "residuals ({n_res}), coordinates ({n_coords}) and graph ({}) sizes should match",
            graph.len()
        )));
    }
    Ok(())
}

/// Vecchia maximum likelihood estimation.
///
/// Minimizes the NNGP negative log-likelihood of the residuals over
/// `log10(sigma2, phi, tau2)` within bounds derived from the residuals variance
/// and the data extent, starting from the current theta.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct VecchiaMle {
    /// Optimizer settings
    pub cobyla: CobylaParams,
}

impl fmt::Display for VecchiaMle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "VecchiaMle")
    }
}

impl<F: Float> ThetaEstimator<F> for VecchiaMle {
    fn estimate<C: CovarianceModel<F>>(
        &self,
        model: &C,
        residuals: &ArrayBase<impl Data<Elem = F>, Ix1>,
        coords: &ArrayBase<impl Data<Elem = F> + Sync, Ix2>,
        graph: &NeighborGraph<F>,
        current: &CovParams<F>,
        jitter: &JitterPolicy,
    ) -> Result<CovParams<F>> {
        check_residuals(residuals.len(), graph, coords.nrows())?;
        let Some(var) = variance(residuals) else {
            warn!("Degenerate residuals (null variance), keep theta = {current}");
            return Ok(*current);
        };
        let Some(bounds) = log10_bounds(var, coords, graph) else {
            warn!("Degenerate coordinates, keep theta = {current}");
            return Ok(*current);
        };

        let objfn = |x: &[f64]| -> f64 {
            if x.iter().any(|v| !v.is_finite()) {
                return f64::INFINITY;
            }
            let Ok(theta) = CovParams::new(
                F::cast(10f64.powf(x[0])),
                F::cast(10f64.powf(x[1])),
                F::cast(10f64.powf(x[2])),
            ) else {
                return f64::INFINITY;
            };
            match NngpFactor::new(graph, coords, model, &theta, jitter)
                .and_then(|factor| factor.neg_log_likelihood(residuals))
            {
                Ok(nll) if nll.is_finite() => to_f64(nll),
                _ => f64::INFINITY,
            }
        };

        let x0: Vec<f64> = current
            .to_array()
            .iter()
            .zip(bounds.iter())
            .map(|(v, b)| clamp_into(to_f64(*v).log10(), *b))
            .collect();
        let f0 = objfn(&x0);
        let (fmin, xopt) = optimize_params(&objfn, &x0, &bounds, self.cobyla);
        debug!("Vecchia MLE: nll {f0} -> {fmin} at log10 theta = {xopt}");

        let best = if fmin.is_finite() && !(fmin > f0) {
            xopt
        } else if f0.is_finite() {
            Array1::from(x0)
        } else {
            warn!("Vecchia likelihood not computable, keep theta = {current}");
            return Ok(*current);
        };
        Ok(CovParams::new(
            F::cast(10f64.powf(best[0])),
            F::cast(10f64.powf(best[1])),
            F::cast(10f64.powf(best[2])),
        )
        .unwrap_or(*current))
    }
}

/// Empirical semivariogram (method of moments) estimation.
///
/// Semivariances `(r_i - r_j)^2 / 2` are computed on the neighbor graph edges and on
/// `n_random_pairs` random pairs, averaged in `n_bins` distance classes up to half the
/// largest pair distance, then `tau2 + sigma2 * (1 - rho(h / phi))` is fitted by
/// weighted least squares (weights are class counts).
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct Variogram {
    /// Number of distance classes
    pub n_bins: usize,
    /// Number of random pairs added to the graph edges
    pub n_random_pairs: usize,
    /// Seed of the random pairs generator
    pub seed: u64,
    /// Optimizer settings
    pub cobyla: CobylaParams,
}

impl Default for Variogram {
    fn default() -> Self {
        Variogram {
            n_bins: 15,
            n_random_pairs: 20000,
            seed: 42,
            cobyla: CobylaParams::default(),
        }
    }
}

impl fmt::Display for Variogram {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Variogram(n_bins={})", self.n_bins)
    }
}

/// One distance class of an empirical semivariogram
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VariogramBin {
    /// Mean pair distance of the class
    pub distance: f64,
    /// Mean semivariance of the class
    pub semivariance: f64,
    /// Number of pairs in the class
    pub count: usize,
}

impl Variogram {
    /// Empirical semivariogram classes (empty classes are skipped)
    pub fn empirical<F: Float>(
        &self,
        residuals: &ArrayBase<impl Data<Elem = F>, Ix1>,
        coords: &ArrayBase<impl Data<Elem = F>, Ix2>,
        graph: &NeighborGraph<F>,
    ) -> Vec<VariogramBin> {
        let n = residuals.len();
        let mut pairs: Vec<(f64, f64)> = graph
            .edges()
            .map(|(i, j, d)| (to_f64(d), 0.5 * to_f64(residuals[i] - residuals[j]).powi(2)))
            .collect();
        if n > 1 {
            let mut rng = Xoshiro256Plus::seed_from_u64(self.seed);
            for _ in 0..self.n_random_pairs {
                let i = rng.gen_range(0..n);
                let j = rng.gen_range(0..n);
                if i != j {
                    let d = crate::covariance_models::euclidean(&coords.row(i), &coords.row(j));
                    pairs.push((to_f64(d), 0.5 * to_f64(residuals[i] - residuals[j]).powi(2)));
                }
            }
        }
        let max_dist = 0.5 * pairs.iter().map(|p| p.0).fold(0., f64::max);
        if !(max_dist > 0.) || self.n_bins == 0 {
            return vec![];
        }
        let width = max_dist / self.n_bins as f64;
        let mut sums = vec![(0., 0., 0usize); self.n_bins];
        for (d, g) in pairs.into_iter().filter(|(d, _)| *d <= max_dist) {
            let b = ((d / width) as usize).min(self.n_bins - 1);
            sums[b].0 += d;
            sums[b].1 += g;
            sums[b].2 += 1;
        }
        sums.into_iter()
            .filter(|s| s.2 > 0)
            .map(|(d, g, c)| VariogramBin {
                distance: d / c as f64,
                semivariance: g / c as f64,
                count: c,
            })
            .collect()
    }
}

impl<F: Float> ThetaEstimator<F> for Variogram {
    fn estimate<C: CovarianceModel<F>>(
        &self,
        model: &C,
        residuals: &ArrayBase<impl Data<Elem = F>, Ix1>,
        coords: &ArrayBase<impl Data<Elem = F> + Sync, Ix2>,
        graph: &NeighborGraph<F>,
        current: &CovParams<F>,
        _jitter: &JitterPolicy,
    ) -> Result<CovParams<F>> {
        check_residuals(residuals.len(), graph, coords.nrows())?;
        let (Some(var), Some(bounds)) = (
            variance(residuals),
            variance(residuals).and_then(|v| log10_bounds(v, coords, graph)),
        ) else {
            warn!("Degenerate residuals or coordinates, keep theta = {current}");
            return Ok(*current);
        };
        let bins = self.empirical(residuals, coords, graph);
        if bins.len() < 3 {
            warn!("Not enough semivariogram classes ({}), keep theta = {current}", bins.len());
            return Ok(*current);
        }

        let total: f64 = bins.iter().map(|b| b.count as f64).sum();
        let objfn = |x: &[f64]| -> f64 {
            let (s2, phi, t2) = (10f64.powf(x[0]), 10f64.powf(x[1]), 10f64.powf(x[2]));
            let sse: f64 = bins
                .iter()
                .map(|b| {
                    let rho = to_f64(model.correlation(F::cast(b.distance / phi)));
                    let g = t2 + s2 * (1. - rho);
                    b.count as f64 * (b.semivariance - g).powi(2)
                })
                .sum();
            let sse = sse / (total * var * var);
            if sse.is_finite() { sse } else { f64::INFINITY }
        };
        let x0: Vec<f64> = current
            .to_array()
            .iter()
            .zip(bounds.iter())
            .map(|(v, b)| clamp_into(to_f64(*v).log10(), *b))
            .collect();
        let (fmin, xopt) = optimize_params(&objfn, &x0, &bounds, self.cobyla);
        debug!("Variogram fit: weighted sse {fmin} at log10 theta = {xopt}");
        if !fmin.is_finite() {
            warn!("Semivariogram fit failed, keep theta = {current}");
            return Ok(*current);
        }
        Ok(CovParams::new(
            F::cast(10f64.powf(xopt[0])),
            F::cast(10f64.powf(xopt[1])),
            F::cast(10f64.powf(xopt[2])),
        )
        .unwrap_or(*current))
    }
}

/// No estimation: theta is kept at its current value
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct FixedTheta;

impl fmt::Display for FixedTheta {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "FixedTheta")
    }
}

impl<F: Float> ThetaEstimator<F> for FixedTheta {
    fn estimate<C: CovarianceModel<F>>(
        &self,
        _model: &C,
        residuals: &ArrayBase<impl Data<Elem = F>, Ix1>,
        coords: &ArrayBase<impl Data<Elem = F> + Sync, Ix2>,
        graph: &NeighborGraph<F>,
        current: &CovParams<F>,
        _jitter: &JitterPolicy,
    ) -> Result<CovParams<F>> {
        check_residuals(residuals.len(), graph, coords.nrows())?;
        Ok(*current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covariance_models::ExponentialCov;
    use crate::simulation::sample_exact_field;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};
    use ndarray_rand::RandomExt;
    use ndarray_rand::rand_distr::Uniform;

    fn setup(n: usize, theta: &CovParams<f64>, seed: u64) -> (Array2<f64>, Array1<f64>) {
        let mut rng = Xoshiro256Plus::seed_from_u64(seed);
        let coords = Array2::random_using((n, 2), Uniform::new(0., 10.), &mut rng);
        let field = sample_exact_field(&ExponentialCov(), theta, &coords, &mut rng).unwrap();
        (coords, field)
    }

    #[test]
    fn test_degenerate_residuals_keep_positive_theta() {
        let coords = array![[0., 0.], [1., 0.], [0., 1.], [1., 1.]];
        let graph = NeighborGraph::build(&coords, 2).unwrap();
        let current = CovParams::new(1., 2., 0.1).unwrap();
        let zeros = Array1::<f64>::zeros(4);
        let jitter = JitterPolicy::default();
        let theta = VecchiaMle::default()
            .estimate(&ExponentialCov(), &zeros, &coords, &graph, &current, &jitter)
            .unwrap();
        assert_eq!(theta, current);
        let theta = Variogram::default()
            .estimate(&ExponentialCov(), &zeros, &coords, &graph, &current, &jitter)
            .unwrap();
        assert_eq!(theta, current);

        // all points at the same location
        let same = Array2::<f64>::zeros((4, 2));
        let graph = NeighborGraph::build(&same, 2).unwrap();
        let theta = VecchiaMle::default()
            .estimate(&ExponentialCov(), &array![1., -1., 2., 0.], &same, &graph, &current, &jitter)
            .unwrap();
        assert_eq!(theta, current);
    }

    #[test]
    fn test_estimators_check_sizes() {
        let coords = array![[0., 0.], [1., 0.], [0., 1.]];
        let graph = NeighborGraph::build(&coords, 2).unwrap();
        let current = CovParams::new(1., 2., 0.1).unwrap();
        let res = FixedTheta.estimate(
            &ExponentialCov(),
            &array![1., 2.],
            &coords,
            &graph,
            &current,
            &JitterPolicy::default(),
        );
        assert!(matches!(res, Err(NnglsError::InvalidConfigError(_))));
    }

    #[test]
    fn test_vecchia_mle_improves_likelihood() {
        let truth = CovParams::new(1., 1.5, 0.05).unwrap();
        let (coords, field) = setup(400, &truth, 0);
        let graph = NeighborGraph::build(&coords, 10).unwrap();
        let jitter = JitterPolicy::default();
        let start = CovParams::new(0.2, 0.2, 0.5).unwrap();
        let theta = VecchiaMle::default()
            .estimate(&ExponentialCov(), &field, &coords, &graph, &start, &jitter)
            .unwrap();
        let nll = |t: &CovParams<f64>| {
            NngpFactor::new(&graph, &coords, &ExponentialCov(), t, &jitter)
                .unwrap()
                .neg_log_likelihood(&field)
                .unwrap()
        };
        assert!(nll(&theta) < nll(&start));
        assert!(theta.sigma2() > 0. && theta.phi() > 0. && theta.tau2() > 0.);
        assert!(theta.sill() > 0.3 && theta.sill() < 5.);
    }

    #[test]
    fn test_variogram_estimation() {
        let truth = CovParams::new(1., 1.5, 0.05).unwrap();
        let (coords, field) = setup(400, &truth, 1);
        let graph = NeighborGraph::build(&coords, 10).unwrap();
        let v = Variogram::default();
        let bins = v.empirical(&field, &coords, &graph);
        assert!(bins.len() >= 3);
        assert!(bins.windows(2).all(|w| w[0].distance < w[1].distance));
        let theta = v
            .estimate(
                &ExponentialCov(),
                &field,
                &coords,
                &graph,
                &initial_guess(&field, &coords).unwrap(),
                &JitterPolicy::default(),
            )
            .unwrap();
        assert!(theta.sigma2() > 0. && theta.phi() > 0. && theta.tau2() > 0.);
        assert!(theta.sill() < 10. * variance(&field).unwrap());
    }

    #[test]
    fn test_initial_guess() {
        let coords = array![[0., 0.], [3., 4.]];
        let theta = initial_guess(&array![1., -1.], &coords).unwrap();
        assert_abs_diff_eq!(theta.sigma2(), 0.9, epsilon = 1e-12);
        assert_abs_diff_eq!(theta.tau2(), 0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(theta.phi(), 0.5, epsilon = 1e-12);
        let theta = initial_guess(&array![1., 1.], &coords).unwrap();
        assert!(theta.tau2() > 0.);
    }
}
