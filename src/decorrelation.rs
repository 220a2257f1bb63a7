//! NNGP decorrelation engine.
//!
//! For each observation `i` with neighbor set `N(i)` the conditional distribution of
//! `z_i` given `z_N(i)` under the covariance model is Gaussian with mean `b_i^T z_N(i)`
//! and variance `v_i`, where
//!
//! * `C_NN b_i = c_iN` (neighbor covariance matrix, neighbor/target cross covariance),
//! * `v_i = C(0) - c_iN^T b_i`.
//!
//! The transform `z_i' = (z_i - b_i^T z_N(i)) / sqrt(v_i)` maps a field following the
//! model into approximately i.i.d. standard normal values. In matrix form
//! `z' = D^{-1/2} (I - B) z` where `B` is the strictly lower triangular sparse matrix of
//! weights, so `D^{-1/2} (I - B)` is a sparse Cholesky-like factor of the precision
//! matrix of the Vecchia approximation.

use crate::covariance_models::{CovParams, CovarianceModel};
use crate::errors::{NnglsError, Result};
use crate::neighbors::NeighborGraph;
use linfa::Float;
use linfa_linalg::{cholesky::*, triangular::*};
use log::warn;
use ndarray::{Array1, Array2, ArrayBase, Axis, Data, Ix1, Ix2};
use rayon::prelude::*;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// Ridge policy used when a conditional covariance system is not positive definite.
///
/// The first attempt is made without ridge, then up to `max_retries` attempts add
/// `initial * C(0) * growth^r` (r = 0, 1, ...) to the diagonal.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct JitterPolicy {
    /// Relative ridge of the first retry
    pub initial: f64,
    /// Multiplicative growth between retries
    pub growth: f64,
    /// Number of retries before giving up
    pub max_retries: usize,
}

impl Default for JitterPolicy {
    fn default() -> Self {
        JitterPolicy {
            initial: 1e-8,
            growth: 100.,
            max_retries: 3,
        }
    }
}

impl JitterPolicy {
    /// Ridge added at the given attempt (attempt 0 has no ridge)
    pub fn ridge<F: Float>(&self, attempt: usize, scale: F) -> F {
        if attempt == 0 {
            F::zero()
        } else {
            F::cast(self.initial * self.growth.powi(attempt as i32 - 1)) * scale
        }
    }
}

/// Solve the conditional system of one target point given its neighbors.
///
/// `neighbor_coords` are the (m, dim) neighbor locations and `target_dists` the m
/// distances between the target and its neighbors. Returns the weights `b` and the
/// (unchecked) conditional variance `v`. `index` is only used for error reporting.
pub(crate) fn conditional_weights<F: Float, C: CovarianceModel<F>>(
    model: &C,
    theta: &CovParams<F>,
    neighbor_coords: &ArrayBase<impl Data<Elem = F>, Ix2>,
    target_dists: &[F],
    jitter: &JitterPolicy,
    index: usize,
) -> Result<(Array1<F>, F)> {
    let m = target_dists.len();
    if m == 0 {
        return Ok((Array1::zeros(0), theta.sill()));
    }
    let c_nn = model.covariance_matrix(neighbor_coords, theta);
    let c_in = Array2::from_shape_fn((m, 1), |(j, _)| {
        model.cross_covariance(target_dists[j], theta)
    });

    let mut last_err = String::new();
    for attempt in 0..=jitter.max_retries {
        let ridge = jitter.ridge(attempt, theta.sill());
        if attempt > 0 {
            warn!("Conditional covariance of observation {index} is singular ({last_err}), retry with ridge {ridge}");
        }
        let mut mat = c_nn.to_owned();
        mat.diag_mut().mapv_inplace(|v| v + ridge);
        let chol = match mat.cholesky() {
            Ok(l) => l,
            Err(e) => {
                last_err = e.to_string();
                continue;
            }
        };
        let b = chol
            .solve_triangular(&c_in, UPLO::Lower)
            .and_then(|y| chol.t().solve_triangular(&y, UPLO::Upper));
        match b {
            Ok(b) if b.iter().all(|v| v.is_finite()) => {
                let b = b.remove_axis(Axis(1));
                let v = theta.sill() - b.dot(&c_in.column(0));
                return Ok((b, v));
            }
            Ok(_) => last_err = "non finite weights".to_string(),
            Err(e) => last_err = e.to_string(),
        }
    }
    Err(NnglsError::NumericalError {
        index,
        message: format!(
            "conditional covariance still singular after {} jitter retries: {last_err}",
            jitter.max_retries
        ),
    })
}

/// Conditional weights and variances of every node of a neighbor graph for a given theta
#[derive(Clone, Debug)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(deserialize = "F: Deserialize<'de>"))
)]
pub struct NngpFactor<F: Float> {
    theta: CovParams<F>,
    offsets: Vec<usize>,
    indices: Vec<usize>,
    weights: Vec<F>,
    cond_var: Array1<F>,
}

impl<F: Float> NngpFactor<F> {
    /// Compute conditional weights of all `graph` nodes located at `coords` (n, dim).
    ///
    /// # Errors
    ///
    /// * [NnglsError::InvalidConfigError] when graph and coordinates sizes mismatch,
    /// * [NnglsError::DataError] on missing neighbors or non positive conditional variance,
    /// * [NnglsError::NumericalError] when a conditional system remains singular.
    pub fn new<C: CovarianceModel<F>>(
        graph: &NeighborGraph<F>,
        coords: &ArrayBase<impl Data<Elem = F> + Sync, Ix2>,
        model: &C,
        theta: &CovParams<F>,
        jitter: &JitterPolicy,
    ) -> Result<Self> {
        if graph.len() != coords.nrows() {
            return Err(NnglsError::InvalidConfigError(format!(
                "neighbor graph size ({}) should match coordinates count ({})",
                graph.len(),
                coords.nrows()
            )));
        }
        graph.validate()?;

        let solved: Vec<Result<(Array1<F>, F)>> = (0..graph.len())
            .into_par_iter()
            .map(|i| {
                let nbr_coords = coords.select(Axis(0), graph.neighbors(i));
                conditional_weights(model, theta, &nbr_coords, graph.distances(i), jitter, i)
            })
            .collect();

        let mut weights = Vec::with_capacity(graph.n_edges());
        let mut cond_var = Array1::zeros(graph.len());
        // sequential scan so that the reported error is the lowest failing index
        for (i, res) in solved.into_iter().enumerate() {
            let (b, v) = res?;
            if !(v > F::epsilon()) {
                return Err(NnglsError::DataError {
                    index: i,
                    message: format!(
                        "non positive conditional variance {v} (duplicate coordinates?)"
                    ),
                });
            }
            weights.extend(b.iter());
            cond_var[i] = v;
        }

        Ok(NngpFactor {
            theta: *theta,
            offsets: graph.offsets().to_vec(),
            indices: graph.edges().map(|(_, j, _)| j).collect(),
            weights,
            cond_var,
        })
    }

    /// Covariance parameters the factor was computed with
    pub fn theta(&self) -> &CovParams<F> {
        &self.theta
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.cond_var.len()
    }

    /// Whether the factor has no node
    pub fn is_empty(&self) -> bool {
        self.cond_var.is_empty()
    }

    /// Neighbor indices of node `i`
    pub fn neighbors(&self, i: usize) -> &[usize] {
        &self.indices[self.offsets[i]..self.offsets[i + 1]]
    }

    /// Conditional weights `b_i` of node `i`
    pub fn weights(&self, i: usize) -> &[F] {
        &self.weights[self.offsets[i]..self.offsets[i + 1]]
    }

    /// Conditional variances `v_i`
    pub fn conditional_variances(&self) -> &Array1<F> {
        &self.cond_var
    }

    /// Decorrelated value of node `i` where `z(j)` gives the value of node `j`
    pub fn decorrelate_node(&self, i: usize, z: impl Fn(usize) -> F) -> F {
        let pred = self
            .neighbors(i)
            .iter()
            .zip(self.weights(i))
            .fold(F::zero(), |acc, (&j, &b)| acc + b * z(j));
        (z(i) - pred) / self.cond_var[i].sqrt()
    }

    /// Apply the decorrelating transform to a (n,) vector (responses or residuals)
    pub fn decorrelate(&self, z: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<Array1<F>> {
        self.check_len(z.len())?;
        Ok(Array1::from_shape_fn(self.len(), |i| {
            self.decorrelate_node(i, |j| z[j])
        }))
    }

    /// Decorrelated values of the `batch` nodes only (minibatch transform).
    ///
    /// `nodes` is the sorted list of the batch nodes and of all their neighbors and `z`
    /// holds the values at those nodes, so only the residuals a minibatch depends on
    /// have to be computed.
    pub fn decorrelate_subset(
        &self,
        batch: &[usize],
        nodes: &[usize],
        z: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Result<Array1<F>> {
        if nodes.len() != z.len() {
            return Err(NnglsError::InvalidConfigError(format!(
                "subset nodes ({}) and values ({}) lengths should match",
                nodes.len(),
                z.len()
            )));
        }
        if let Some(&i) = batch.iter().find(|&&i| i >= self.len()) {
            return Err(NnglsError::InvalidConfigError(format!(
                "node index {i} out of range (size {})",
                self.len()
            )));
        }
        let at = |j: usize| {
            nodes.binary_search(&j).map(|p| z[p]).map_err(|_| {
                NnglsError::InvalidConfigError(format!("node {j} missing from subset nodes"))
            })
        };
        batch
            .iter()
            .map(|&i| {
                let mut pred = F::zero();
                for (&j, &b) in self.neighbors(i).iter().zip(self.weights(i)) {
                    pred += b * at(j)?;
                }
                Ok((at(i)? - pred) / self.cond_var[i].sqrt())
            })
            .collect()
    }

    /// Apply the adjoint of the decorrelating transform, `(I - B)^T D^{-1/2} g`.
    /// Used to back-propagate a gradient w.r.t. decorrelated values onto raw values.
    pub fn adjoint(&self, g: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<Array1<F>> {
        self.check_len(g.len())?;
        let mut out = Array1::zeros(self.len());
        for i in 0..self.len() {
            let gi = g[i] / self.cond_var[i].sqrt();
            out[i] += gi;
            for (&j, &b) in self.neighbors(i).iter().zip(self.weights(i)) {
                out[j] -= b * gi;
            }
        }
        Ok(out)
    }

    /// Negative log-likelihood of `z` under the NNGP (Vecchia) approximation
    pub fn neg_log_likelihood(&self, z: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<F> {
        let e = self.decorrelate(z)?;
        let n = F::cast(self.len());
        let two_pi = F::cast(2. * std::f64::consts::PI);
        let quad = e.mapv(|v| v * v).sum();
        let logdet = self.cond_var.mapv(|v| v.ln()).sum();
        Ok(F::cast(0.5) * (quad + logdet + n * two_pi.ln()))
    }

    fn check_len(&self, n: usize) -> Result<()> {
        if n != self.len() {
            return Err(NnglsError::InvalidConfigError(format!(
                "vector length ({n}) should match factor size ({})",
                self.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covariance_models::ExponentialCov;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};
    use ndarray_rand::RandomExt;
    use ndarray_rand::rand::SeedableRng;
    use ndarray_rand::rand_distr::Uniform;
    use rand_xoshiro::Xoshiro256Plus;

    #[test]
    fn test_single_neighbor_weights() {
        let theta = CovParams::new(1., 1., 0.1).unwrap();
        let nbr = array![[1., 0.]];
        let (b, v) = conditional_weights(
            &ExponentialCov(),
            &theta,
            &nbr,
            &[1.],
            &JitterPolicy::default(),
            1,
        )
        .unwrap();
        let c = f64::exp(-1.);
        assert_abs_diff_eq!(b[0], c / 1.1, epsilon = 1e-12);
        assert_abs_diff_eq!(v, 1.1 - c * c / 1.1, epsilon = 1e-12);
    }

    #[test]
    fn test_root_has_marginal_variance() {
        let coords = array![[0., 0.], [1., 0.], [0., 2.]];
        let graph = NeighborGraph::build(&coords, 2).unwrap();
        let theta = CovParams::new(2., 1., 0.5).unwrap();
        let factor =
            NngpFactor::new(&graph, &coords, &ExponentialCov(), &theta, &JitterPolicy::default())
                .unwrap();
        assert_abs_diff_eq!(factor.conditional_variances()[0], 2.5, epsilon = 1e-12);
        assert!(factor.weights(0).is_empty());
        assert_eq!(factor.weights(2).len(), 2);
    }

    #[test]
    fn test_full_conditioning_matches_exact_likelihood_factor() {
        // with k >= n - 1, the NNGP factor is exact: (I - B)^T D^-1 (I - B) = C^-1
        let mut rng = Xoshiro256Plus::seed_from_u64(0);
        let coords = Array2::random_using((6, 2), Uniform::new(0., 3.), &mut rng);
        let theta = CovParams::new(1.3, 0.8, 0.2).unwrap();
        let model = ExponentialCov();
        let graph = NeighborGraph::build(&coords, 5).unwrap();
        let factor =
            NngpFactor::new(&graph, &coords, &model, &theta, &JitterPolicy::default()).unwrap();
        let cov = model.covariance_matrix(&coords, &theta);

        // columns of the factor applied to C should give orthonormal-like rows:
        // L C L^T = I with L = D^-1/2 (I - B)
        let mut l = Array2::<f64>::zeros((6, 6));
        for i in 0..6 {
            let e = Array1::from_shape_fn(6, |j| if i == j { 1. } else { 0. });
            l.column_mut(i).assign(&factor.decorrelate(&e).unwrap());
        }
        let id = l.dot(&cov).dot(&l.t());
        assert_abs_diff_eq!(id, Array2::eye(6), epsilon = 1e-8);
    }

    #[test]
    fn test_adjoint_is_transpose() {
        let mut rng = Xoshiro256Plus::seed_from_u64(1);
        let coords = Array2::random_using((40, 2), Uniform::new(0., 5.), &mut rng);
        let theta = CovParams::new(1., 1.5, 0.05).unwrap();
        let graph = NeighborGraph::build(&coords, 6).unwrap();
        let factor =
            NngpFactor::new(&graph, &coords, &ExponentialCov(), &theta, &JitterPolicy::default())
                .unwrap();
        let z = Array1::random_using(40, Uniform::new(-1., 1.), &mut rng);
        let g = Array1::random_using(40, Uniform::new(-1., 1.), &mut rng);
        // <L z, g> == <z, L^T g>
        let lhs = factor.decorrelate(&z).unwrap().dot(&g);
        let rhs = z.dot(&factor.adjoint(&g).unwrap());
        assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-10);
    }

    #[test]
    fn test_subset_transform_matches_full_transform() {
        let mut rng = Xoshiro256Plus::seed_from_u64(2);
        let coords = Array2::random_using((30, 2), Uniform::new(0., 5.), &mut rng);
        let theta = CovParams::new(1., 1., 0.1).unwrap();
        let graph = NeighborGraph::build(&coords, 4).unwrap();
        let factor =
            NngpFactor::new(&graph, &coords, &ExponentialCov(), &theta, &JitterPolicy::default())
                .unwrap();
        let z = Array1::random_using(30, Uniform::new(-1., 1.), &mut rng);
        let full = factor.decorrelate(&z).unwrap();

        let batch = [29, 3, 0];
        let mut nodes: Vec<usize> = batch
            .iter()
            .flat_map(|&i| std::iter::once(i).chain(factor.neighbors(i).iter().cloned()))
            .collect();
        nodes.sort_unstable();
        nodes.dedup();
        assert!(nodes.len() < 30);
        let zn = z.select(Axis(0), &nodes);
        let sub = factor.decorrelate_subset(&batch, &nodes, &zn).unwrap();
        assert_abs_diff_eq!(sub, array![full[29], full[3], full[0]], epsilon = 1e-14);

        // whole node set is the full transform
        let all: Vec<usize> = (0..30).collect();
        let sub = factor.decorrelate_subset(&all, &all, &z).unwrap();
        assert_abs_diff_eq!(sub, full, epsilon = 1e-14);

        assert!(factor.decorrelate_subset(&[30], &all, &z).is_err());
        assert!(factor.decorrelate_subset(&batch, &nodes, &z).is_err());
        // a neighbor of node 29 is missing
        let missing = factor.neighbors(29)[0];
        let partial: Vec<usize> = nodes.iter().cloned().filter(|&j| j != missing).collect();
        let zp = z.select(Axis(0), &partial);
        assert!(factor.decorrelate_subset(&batch, &partial, &zp).is_err());
    }

    #[test]
    fn test_singular_neighbors_solved_with_jitter() {
        // identical neighbors: C_NN = [[1, 1], [1, 1]] is singular
        let nbr_coords = array![[0., 0.], [0., 0.]];
        let theta = CovParams::new(1., 1., 1e-20).unwrap();
        let c = f64::exp(-1.);
        let (b, v) = conditional_weights(
            &ExponentialCov(),
            &theta,
            &nbr_coords,
            &[1., 1.],
            &JitterPolicy::default(),
            7,
        )
        .unwrap();
        assert_abs_diff_eq!(b, array![c / 2., c / 2.], epsilon = 1e-8);
        assert_abs_diff_eq!(v, 1. - c * c, epsilon = 1e-8);

        let no_retry = JitterPolicy {
            max_retries: 0,
            ..JitterPolicy::default()
        };
        let res = conditional_weights(
            &ExponentialCov(),
            &theta,
            &nbr_coords,
            &[1., 1.],
            &no_retry,
            7,
        );
        assert!(matches!(res, Err(NnglsError::NumericalError { index: 7, .. })));
    }

    #[test]
    fn test_duplicate_coordinates_with_tiny_nugget() {
        let coords = array![[0., 0.], [0., 0.]];
        let graph = NeighborGraph::build(&coords, 1).unwrap();
        let theta = CovParams::new(1., 1., 1e-20).unwrap();
        let res = NngpFactor::new(
            &graph,
            &coords,
            &ExponentialCov(),
            &theta,
            &JitterPolicy::default(),
        );
        assert!(matches!(res, Err(NnglsError::DataError { index: 1, .. })));
    }

    #[test]
    fn test_size_mismatch() {
        let coords = array![[0., 0.], [1., 0.]];
        let graph = NeighborGraph::build(&coords, 1).unwrap();
        let theta = CovParams::new(1., 1., 0.1).unwrap();
        let factor =
            NngpFactor::new(&graph, &coords, &ExponentialCov(), &theta, &JitterPolicy::default())
                .unwrap();
        assert!(factor.decorrelate(&array![1., 2., 3.]).is_err());
        let other = array![[0., 0.], [1., 0.], [2., 0.]];
        assert!(
            NngpFactor::new(&graph, &other, &ExponentialCov(), &theta, &JitterPolicy::default())
                .is_err()
        );
    }

    #[test]
    fn test_jitter_ridge_grows_geometrically() {
        let jitter = JitterPolicy::default();
        assert_eq!(jitter.ridge(0, 1.), 0.);
        assert_abs_diff_eq!(jitter.ridge(1, 2.), 2e-8, epsilon = 1e-20);
        assert_abs_diff_eq!(jitter.ridge(3, 1.), 1e-4, epsilon = 1e-16);
    }
}
