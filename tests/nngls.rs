use approx::assert_abs_diff_eq;
use ndarray::{Array1, Array2};
use ndarray_rand::RandomExt;
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand_distr::Uniform;
use nngls::simulation::sample_exact_field;
use nngls::{
    CovParams, CovarianceModel, ExponentialCov, FixedTheta, LinearBasis, LinearMean, Matern52Cov,
    Nngls, NnglsError, SpatialData,
};
use rand_xoshiro::Xoshiro256Plus;

fn dataset<C: CovarianceModel<f64>>(
    kernel: &C,
    n: usize,
    theta: &CovParams<f64>,
    seed: u64,
) -> SpatialData<f64> {
    let mut rng = Xoshiro256Plus::seed_from_u64(seed);
    let x = Array2::random_using((n, 3), Uniform::new(0., 1.), &mut rng);
    let coords = Array2::random_using((n, 2), Uniform::new(0., 5.), &mut rng);
    let w = sample_exact_field(kernel, theta, &coords, &mut rng).unwrap();
    let y: Array1<f64> = x.column(0).mapv(|v| 3. * v) + x.column(2).mapv(|v| v * v) + w;
    SpatialData::new(x, coords, y).unwrap()
}

#[test]
fn test_predictions_interpolate_training_data_without_nugget() {
    let theta = CovParams::new(1., 1., 1e-10).unwrap();
    let data = dataset(&ExponentialCov(), 150, &theta, 0);
    let model = Nngls::params(
        LinearMean::new(LinearBasis(), 3),
        ExponentialCov(),
        FixedTheta,
    )
    .theta_init(theta)
    .neighbor_size(8)
    .max_epochs(5)
    .fit(&data, None)
    .expect("NN-GLS fitted");
    assert_eq!(model.history().len(), 5);

    let (pred, var) = model.predict_valvar(&data.x(), &data.coords()).unwrap();
    assert_abs_diff_eq!(pred, data.y(), epsilon = 1e-5);
    assert!(var.iter().all(|&v| v < 1e-5));

    // mean function part is what the trained mean function gives
    let spatial = model.predict_spatial(&data.x(), &data.coords()).unwrap();
    assert_abs_diff_eq!(spatial.mean, model.predict_mean(&data.x()), epsilon = 1e-12);
    assert_abs_diff_eq!(
        spatial.random_effect,
        data.y().to_owned() - &spatial.mean,
        epsilon = 1e-5
    );
}

#[test]
fn test_fit_rejects_inconsistent_validation_data() {
    let theta = CovParams::new(1., 1., 0.1).unwrap();
    let train = dataset(&Matern52Cov(), 40, &theta, 1);
    let valid = SpatialData::new(
        Array2::zeros((10, 2)),
        Array2::zeros((10, 2)),
        Array1::zeros(10),
    )
    .unwrap();
    let res = Nngls::params(
        LinearMean::new(LinearBasis(), 3),
        Matern52Cov(),
        FixedTheta,
    )
    .theta_init(theta)
    .fit(&train, Some(&valid));
    assert!(matches!(res, Err(NnglsError::InvalidConfigError(_))));
}

#[cfg(feature = "persistent")]
#[test]
fn test_save_load() {
    let theta = CovParams::new(1., 1., 0.1).unwrap();
    let data = dataset(&Matern52Cov(), 60, &theta, 2);
    let model = Nngls::params(
        LinearMean::new(LinearBasis(), 3),
        Matern52Cov(),
        FixedTheta,
    )
    .theta_init(theta)
    .neighbor_size(5)
    .max_epochs(3)
    .fit(&data, None)
    .expect("NN-GLS fitted");

    let filepath = std::env::temp_dir().join("nngls_save_load.json");
    model.save(&filepath).expect("NN-GLS saved");
    let loaded: Nngls<f64, LinearMean<f64>, Matern52Cov, FixedTheta> =
        Nngls::load(&filepath).expect("NN-GLS loaded");
    assert_eq!(loaded.history().len(), 3);
    assert_eq!(loaded.fit_params().neighbor_size(), 5);

    let xtest = Array2::from_elem((4, 3), 0.5);
    let ctest = ndarray::array![[0., 0.], [1., 2.], [2.5, 2.5], [10., 10.]];
    let (expected, expected_var) = model.predict_valvar(&xtest, &ctest).unwrap();
    let (actual, actual_var) = loaded.predict_valvar(&xtest, &ctest).unwrap();
    assert_abs_diff_eq!(expected, actual, epsilon = 1e-10);
    assert_abs_diff_eq!(expected_var, actual_var, epsilon = 1e-10);
}
