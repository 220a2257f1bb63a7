//! Synthetic spatial datasets: Friedman mean function plus a gaussian random field
//! observed at uniformly drawn locations, and random partitioning helpers.

use crate::covariance_models::{CovParams, CovarianceModel};
use crate::data::SpatialData;
use crate::decorrelation::{JitterPolicy, NngpFactor};
use crate::errors::{NnglsError, Result};
use crate::neighbors::NeighborGraph;
use linfa::Float;
use linfa_linalg::cholesky::*;
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2};
use ndarray_rand::RandomExt;
use ndarray_rand::rand::seq::SliceRandom;
use ndarray_rand::rand::{Rng, SeedableRng};
use ndarray_rand::rand_distr::{StandardNormal, Uniform};
use rand_xoshiro::Xoshiro256Plus;

/// Friedman function on the first five covariates (in [0, 1]):
/// `10 sin(pi x1 x2) + 20 (x3 - 0.5)^2 + 10 x4 + 5 x5`
pub fn friedman5<F: Float>(x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array1<F>> {
    if x.ncols() < 5 {
        return Err(NnglsError::InvalidConfigError(format!(
            "friedman function needs 5 covariates, got {}",
            x.ncols()
        )));
    }
    let pi = F::cast(std::f64::consts::PI);
    Ok(x
        .rows()
        .into_iter()
        .map(|r| {
            F::cast(10.) * (pi * r[0] * r[1]).sin()
                + F::cast(20.) * (r[2] - F::cast(0.5)).powi(2)
                + F::cast(10.) * r[3]
                + F::cast(5.) * r[4]
        })
        .collect())
}

fn standard_normal<F: Float, R: Rng>(n: usize, rng: &mut R) -> Array1<F> {
    Array1::<f64>::random_using(n, StandardNormal, rng).mapv(|v| F::cast(v))
}

/// Draw a gaussian field at `coords` with the exact covariance matrix (Cholesky),
/// only meant for small datasets.
pub fn sample_exact_field<F: Float, C: CovarianceModel<F>, R: Rng>(
    model: &C,
    theta: &CovParams<F>,
    coords: &ArrayBase<impl Data<Elem = F>, Ix2>,
    rng: &mut R,
) -> Result<Array1<F>> {
    let cov = model.covariance_matrix(coords, theta);
    let chol = cov.cholesky()?;
    Ok(chol.dot(&standard_normal::<F, R>(coords.nrows(), rng)))
}

/// Draw a gaussian field at `coords` under the NNGP approximation given by `graph`:
/// `z_i = b_i^T z_N(i) + sqrt(v_i) eps_i` in index order.
pub fn sample_nngp_field<F: Float, C: CovarianceModel<F>, R: Rng>(
    model: &C,
    theta: &CovParams<F>,
    coords: &ArrayBase<impl Data<Elem = F> + Sync, Ix2>,
    graph: &NeighborGraph<F>,
    rng: &mut R,
) -> Result<Array1<F>> {
    let factor = NngpFactor::new(graph, coords, model, theta, &JitterPolicy::default())?;
    let eps = standard_normal::<F, R>(coords.nrows(), rng);
    let mut z = Array1::zeros(coords.nrows());
    for i in 0..z.len() {
        let pred = factor
            .neighbors(i)
            .iter()
            .zip(factor.weights(i))
            .fold(F::zero(), |acc, (&j, &b)| acc + b * z[j]);
        z[i] = pred + factor.conditional_variances()[i].sqrt() * eps[i];
    }
    Ok(z)
}

/// Gaussian field sampling method
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldSampling {
    /// Exact Cholesky draw, O(n^3)
    Exact,
    /// Sequential NNGP draw with the given number of neighbors
    Nngp(usize),
}

/// Simulate `n` observations `y = friedman5(x) + w(s)` with `x` uniform in [0, 1]^5,
/// locations `s` uniform in [0, domain]^2 and `w` a gaussian field of covariance `theta`
/// (the nugget being the observation noise).
pub fn simulate<F: Float, C: CovarianceModel<F>>(
    n: usize,
    model: &C,
    theta: &CovParams<F>,
    domain: F,
    sampling: FieldSampling,
    seed: u64,
) -> Result<SpatialData<F>> {
    let mut rng = Xoshiro256Plus::seed_from_u64(seed);
    let x = Array2::<f64>::random_using((n, 5), Uniform::new(0., 1.), &mut rng).mapv(F::cast);
    let coords =
        Array2::<f64>::random_using((n, 2), Uniform::new(0., 1.), &mut rng).mapv(|v| F::cast(v) * domain);
    let field = match sampling {
        FieldSampling::Exact => sample_exact_field(model, theta, &coords, &mut rng)?,
        FieldSampling::Nngp(k) => {
            let graph = NeighborGraph::build(&coords, k)?;
            sample_nngp_field(model, theta, &coords, &graph, &mut rng)?
        }
    };
    let y = friedman5(&x)? + field;
    SpatialData::new(x, coords, y)
}

/// Randomly split `data` into (training, validation, testing) partitions with
/// `valid_ratio` and `test_ratio` of the observations in the last two.
pub fn train_valid_test_split<F: Float>(
    data: &SpatialData<F>,
    valid_ratio: f64,
    test_ratio: f64,
    seed: u64,
) -> Result<(SpatialData<F>, SpatialData<F>, SpatialData<F>)> {
    let n = data.len();
    let n_valid = (valid_ratio * n as f64).round() as usize;
    let n_test = (test_ratio * n as f64).round() as usize;
    if !(0. ..1.).contains(&valid_ratio)
        || !(0. ..1.).contains(&test_ratio)
        || n_valid == 0
        || n_test == 0
        || n_valid + n_test >= n
    {
        return Err(NnglsError::InvalidConfigError(format!(
            "bad split ratios (valid={valid_ratio}, test={test_ratio}) for {n} observations"
        )));
    }
    let mut indices: Vec<usize> = (0..n).collect();
    indices.shuffle(&mut Xoshiro256Plus::seed_from_u64(seed));
    let (valid, rest) = indices.split_at(n_valid);
    let (test, train) = rest.split_at(n_test);
    Ok((data.select(train), data.select(valid), data.select(test)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covariance_models::ExponentialCov;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_friedman5() {
        let x = array![[0.5, 1., 0.5, 0., 0.], [0., 0., 0., 1., 1.]];
        let y = friedman5(&x).unwrap();
        assert_abs_diff_eq!(y, array![10., 20. * 0.25 + 15.], epsilon = 1e-12);
        assert!(friedman5(&array![[1., 2.]]).is_err());
    }

    #[test]
    fn test_field_variances() {
        let theta = CovParams::new(2., 1., 0.5).unwrap();
        let coords = array![[0., 0.], [0.3, 0.], [5., 5.]];
        let graph = NeighborGraph::build(&coords, 2).unwrap();
        let mut rng = Xoshiro256Plus::seed_from_u64(0);
        let n_rep = 4000;
        let mut exact = Array2::<f64>::zeros((n_rep, 3));
        let mut nngp = Array2::<f64>::zeros((n_rep, 3));
        for r in 0..n_rep {
            exact.row_mut(r).assign(
                &sample_exact_field(&ExponentialCov(), &theta, &coords, &mut rng).unwrap(),
            );
            nngp.row_mut(r).assign(
                &sample_nngp_field(&ExponentialCov(), &theta, &coords, &graph, &mut rng).unwrap(),
            );
        }
        // with k = n - 1 both samplers follow the same distribution of sill 2.5
        for s in [&exact, &nngp] {
            let var = s.mapv(|v| v * v).mean_axis(ndarray::Axis(0)).unwrap();
            assert_abs_diff_eq!(var, array![2.5, 2.5, 2.5], epsilon = 0.2);
        }
    }

    #[test]
    fn test_simulate_and_split() {
        let theta = CovParams::new(1., 1., 0.1).unwrap();
        let data = simulate(100, &ExponentialCov(), &theta, 10., FieldSampling::Nngp(10), 0)
            .unwrap();
        assert_eq!(data.len(), 100);
        assert_eq!(data.n_covariates(), 5);
        assert!(data.coords().iter().all(|&v| (0. ..=10.).contains(&v)));
        let again = simulate(100, &ExponentialCov(), &theta, 10., FieldSampling::Nngp(10), 0)
            .unwrap();
        assert_eq!(data, again);

        let (train, valid, test) = train_valid_test_split(&data, 0.2, 0.2, 1).unwrap();
        assert_eq!((train.len(), valid.len(), test.len()), (60, 20, 20));
        assert!(train_valid_test_split(&data, 0.6, 0.5, 1).is_err());
        assert!(train_valid_test_split(&data, 0., 0.2, 1).is_err());
    }
}
