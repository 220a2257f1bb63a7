use crate::covariance_models::{CovParams, CovarianceModel};
use crate::data::SpatialData;
use crate::errors::{NnglsError, Result};
use crate::estimation::ThetaEstimator;
use crate::kriging::{Kriging, SpatialPrediction};
use crate::mean_functions::MeanFunction;
use crate::parameters::{NNGLS_LOG, NnglsParams, NnglsValidParams};
use crate::training::{GlsTrainer, TrainingHistory, residuals};
use env_logger::{Builder, Env};
use linfa::{Float, ParamGuard};
use log::info;
use ndarray::{Array1, ArrayBase, Data, Ix2};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

#[cfg(feature = "persistent")]
use serde::de::DeserializeOwned;
#[cfg(feature = "persistent")]
use std::{fs::File, io::BufReader, path::Path};

/// Neural network generalized least squares (NN-GLS) model.
///
/// Observations are modelled as `y(s) = f(x(s)) + w(s) + eps(s)` where
/// * `f` is a non-linear mean function of the covariates `x` (typically a neural network),
/// * `w` is a gaussian random field over the locations `s` with covariance
///   `sigma2 * rho(d / phi)`,
/// * `eps` is a white noise of variance `tau2` (nugget).
///
/// `f` is trained with a generalized least squares loss whose covariance is approximated by
/// a nearest neighbor gaussian process (NNGP), which keeps the cost linear in the number of
/// observations. Covariance parameters `theta = (sigma2, phi, tau2)` are periodically
/// re-estimated from the residuals during training.
///
/// Predictions at new locations add the NNGP kriging of the training residuals to the
/// mean function prediction.
///
/// # Example
///
/// ```no_run
/// use nngls::{Activation, ExponentialCov, Mlp, Nngls, VecchiaMle};
/// use nngls::simulation::{FieldSampling, simulate, train_valid_test_split};
/// use nngls::CovParams;
///
/// let theta = CovParams::new(1., 3. / 2f64.sqrt(), 0.01).unwrap();
/// let data = simulate(1000, &ExponentialCov(), &theta, 10., FieldSampling::Nngp(20), 0).unwrap();
/// let (train, valid, test) = train_valid_test_split(&data, 0.2, 0.2, 1).unwrap();
///
/// let mlp = Mlp::new(5, &[32], Activation::Relu, 42).unwrap();
/// let model = Nngls::params(mlp, ExponentialCov(), VecchiaMle::default())
///     .neighbor_size(20)
///     .fit(&train, Some(&valid))
///     .expect("NN-GLS trained");
/// let pred = model.predict(&test.x(), &test.coords()).expect("predictions");
/// ```
#[derive(Clone, Debug)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(
        serialize = "F: Serialize, M: Serialize, C: Serialize, E: Serialize",
        deserialize = "F: Deserialize<'de>, M: Deserialize<'de>, C: Deserialize<'de>, E: Deserialize<'de>"
    ))
)]
pub struct Nngls<F: Float, M: MeanFunction<F>, C: CovarianceModel<F>, E: ThetaEstimator<F>> {
    /// Trained mean function
    mean: M,
    /// Kriging of the training residuals
    kriging: Kriging<F, C>,
    /// Training data
    training_data: SpatialData<F>,
    /// Per epoch records
    history: TrainingHistory<F>,
    /// Parameters used to fit this model
    params: NnglsValidParams<F, M, C, E>,
}

impl<F: Float, M: MeanFunction<F>, C: CovarianceModel<F>, E: ThetaEstimator<F>> fmt::Display
    for Nngls<F, M, C, E>
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "NN-GLS(mean={}, kernel={}, theta={}, k={})",
            self.mean,
            self.params.kernel(),
            self.theta(),
            self.params.neighbor_size()
        )
    }
}

impl<F: Float, M: MeanFunction<F>, C: CovarianceModel<F>, E: ThetaEstimator<F>> Nngls<F, M, C, E> {
    /// NN-GLS parameters given the mean function to train, the covariance kernel and
    /// the theta estimation strategy
    pub fn params(mean: M, kernel: C, estimator: E) -> NnglsParams<F, M, C, E> {
        NnglsParams::new(mean, kernel, estimator)
    }

    /// Trained mean function
    pub fn mean_function(&self) -> &M {
        &self.mean
    }

    /// Covariance parameters
    pub fn theta(&self) -> &CovParams<F> {
        self.kriging.theta()
    }

    /// Training records
    pub fn history(&self) -> &TrainingHistory<F> {
        &self.history
    }

    /// Training data
    pub fn training_data(&self) -> &SpatialData<F> {
        &self.training_data
    }

    /// Training residuals `y - f(x)`
    pub fn residuals(&self) -> &Array1<F> {
        self.kriging.residuals()
    }

    /// Parameters used to fit the model
    pub fn fit_params(&self) -> &NnglsValidParams<F, M, C, E> {
        &self.params
    }

    /// Kriging predictor of the spatial random effect
    pub fn kriging(&self) -> &Kriging<F, C> {
        &self.kriging
    }

    /// Mean function predictions `f(x)` only, without spatial correction
    pub fn predict_mean(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array1<F> {
        self.mean.predict(x)
    }

    /// Predictions at new covariates `x` (m, p) observed at `coords` (m, d)
    pub fn predict(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        coords: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<Array1<F>> {
        self.predict_spatial(x, coords).map(|p| p.total)
    }

    /// Predictions and predictive variances at new covariates `x` observed at `coords`
    pub fn predict_valvar(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        coords: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<(Array1<F>, Array1<F>)> {
        self.predict_spatial(x, coords)
            .map(|p| (p.total, p.variance))
    }

    /// Mean function, random effect and total predictions with predictive variances
    pub fn predict_spatial(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        coords: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<SpatialPrediction<F>> {
        if x.ncols() != self.mean.n_inputs() {
            return Err(NnglsError::InvalidConfigError(format!(
                "expected {} covariates, got {}",
                self.mean.n_inputs(),
                x.ncols()
            )));
        }
        self.kriging.predict_spatial(self.mean.predict(x), coords)
    }
}

#[cfg(feature = "persistent")]
impl<F: Float, M: MeanFunction<F>, C: CovarianceModel<F>, E: ThetaEstimator<F>> Nngls<F, M, C, E>
where
    Self: Serialize + DeserializeOwned,
{
    /// Save the model as JSON in the given file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load a model from the given JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let model = serde_json::from_reader(reader)?;
        Ok(model)
    }
}

impl<F: Float, M: MeanFunction<F>, C: CovarianceModel<F>, E: ThetaEstimator<F>>
    NnglsValidParams<F, M, C, E>
{
    /// Train the mean function on `train` with the NNGP GLS loss, early stopping being
    /// driven by the `valid` GLS loss when given (training loss otherwise).
    pub fn fit(
        &self,
        train: &SpatialData<F>,
        valid: Option<&SpatialData<F>>,
    ) -> Result<Nngls<F, M, C, E>> {
        let env = Env::new().filter_or(NNGLS_LOG, "info");
        let mut builder = Builder::from_env(env);
        let builder = builder.target(env_logger::Target::Stdout);
        builder.try_init().ok();

        let now = Instant::now();
        let outcome = GlsTrainer::new(self, train, valid)?.run()?;
        info!(
            "NN-GLS trained in {} epochs ({:?}), theta = {}, elapsed = {}ms",
            outcome.history.len(),
            outcome.history.termination(),
            outcome.state.theta(),
            now.elapsed().as_millis()
        );
        let res = residuals(&outcome.mean, &train.x(), &train.y());
        let kriging = Kriging::new(
            *self.kernel(),
            *outcome.state.theta(),
            &train.coords(),
            &res,
            self.neighbor_size(),
        )?
        .with_search(self.search())
        .with_jitter(*self.jitter());
        Ok(Nngls {
            mean: outcome.mean,
            kriging,
            training_data: train.clone(),
            history: outcome.history,
            params: self.clone(),
        })
    }
}

impl<F: Float, M: MeanFunction<F>, C: CovarianceModel<F>, E: ThetaEstimator<F>>
    NnglsParams<F, M, C, E>
{
    /// Check parameters then train, see [NnglsValidParams::fit]
    pub fn fit(
        self,
        train: &SpatialData<F>,
        valid: Option<&SpatialData<F>>,
    ) -> Result<Nngls<F, M, C, E>> {
        self.check()?.fit(train, valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covariance_models::ExponentialCov;
    use crate::estimation::FixedTheta;
    use crate::mean_functions::{LinearBasis, LinearMean};
    use crate::metrics::rmse;
    use crate::simulation::sample_exact_field;
    use ndarray::Array2;
    use ndarray_rand::RandomExt;
    use ndarray_rand::rand::SeedableRng;
    use ndarray_rand::rand_distr::Uniform;
    use rand_xoshiro::Xoshiro256Plus;

    fn spatial_linear_data(n: usize, seed: u64) -> SpatialData<f64> {
        let mut rng = Xoshiro256Plus::seed_from_u64(seed);
        let x = Array2::random_using((n, 2), Uniform::new(0., 1.), &mut rng);
        let coords = Array2::random_using((n, 2), Uniform::new(0., 10.), &mut rng);
        let theta = CovParams::new(1., 2., 0.01).unwrap();
        let w = sample_exact_field(&ExponentialCov(), &theta, &coords, &mut rng).unwrap();
        let y = x.column(0).mapv(|v| 2. * v) - x.column(1).mapv(|v| v) + w;
        SpatialData::new(x, coords, y).unwrap()
    }

    #[test]
    fn test_nngls_linear_mean_with_spatial_effect() {
        let data = spatial_linear_data(400, 0);
        let train = data.select(&(0..300).collect::<Vec<_>>());
        let test = data.select(&(300..400).collect::<Vec<_>>());
        let model = Nngls::params(
            LinearMean::new(LinearBasis(), 2),
            ExponentialCov(),
            FixedTheta,
        )
        .theta_init(CovParams::new(1., 2., 0.01).unwrap())
        .neighbor_size(10)
        .learning_rate(0.05)
        .max_epochs(100)
        .fit(&train, None)
        .expect("NN-GLS fitted");
        assert_eq!(model.theta(), &CovParams::new(1., 2., 0.01).unwrap());
        assert_eq!(model.residuals().len(), 300);

        let pred = model.predict_spatial(&test.x(), &test.coords()).unwrap();
        assert!(pred.variance.iter().all(|&v| v >= 0.));
        let spatial_rmse = rmse(&pred.total, &test.y()).unwrap();
        let mean_only_rmse = rmse(&pred.mean, &test.y()).unwrap();
        // kriging the residuals captures most of the spatial effect
        assert!(spatial_rmse < mean_only_rmse);

        // at training locations predictions are close to the observations
        let fitted = model.predict(&train.x(), &train.coords()).unwrap();
        assert!(rmse(&fitted, &train.y()).unwrap() < 0.2);

        let bad_x = Array2::<f64>::zeros((2, 3));
        assert!(model.predict(&bad_x, &test.coords()).is_err());
    }

    #[test]
    fn test_nngls_params_are_checked() {
        let data = spatial_linear_data(20, 1);
        let res = Nngls::params(
            LinearMean::new(LinearBasis(), 2),
            ExponentialCov(),
            FixedTheta,
        )
        .batch_size(0)
        .fit(&data, None);
        assert!(matches!(res, Err(NnglsError::InvalidConfigError(_))));
        let res = Nngls::params(
            LinearMean::new(LinearBasis(), 3),
            ExponentialCov(),
            FixedTheta,
        )
        .fit(&data, None);
        assert!(matches!(res, Err(NnglsError::InvalidConfigError(_))));
    }
}
