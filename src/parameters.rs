use crate::covariance_models::{CovParams, CovarianceModel};
use crate::decorrelation::JitterPolicy;
use crate::errors::{NnglsError, Result};
use crate::estimation::ThetaEstimator;
use crate::mean_functions::MeanFunction;
use crate::neighbors::NeighborSearch;
use linfa::{Float, ParamGuard};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// Default number of nearest neighbors of the Vecchia conditioning sets
pub const NNGLS_NEIGHBOR_SIZE: usize = 20;
/// Default max number of training epochs
pub const NNGLS_MAX_EPOCHS: usize = 1000;
/// Environment variable used to set the log level (default "info")
pub const NNGLS_LOG: &str = "NNGLS_LOG";

/// A set of validated NN-GLS parameters.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(
        serialize = "F: Serialize, M: Serialize, C: Serialize, E: Serialize",
        deserialize = "F: Deserialize<'de>, M: Deserialize<'de>, C: Deserialize<'de>, E: Deserialize<'de>"
    ))
)]
pub struct NnglsValidParams<F: Float, M: MeanFunction<F>, C: CovarianceModel<F>, E: ThetaEstimator<F>>
{
    /// Mean function to be trained, its current parameters are the starting point
    pub(crate) mean: M,
    /// Covariance kernel of the spatial random effect
    pub(crate) kernel: C,
    /// Covariance parameters estimation strategy
    pub(crate) estimator: E,
    /// Initial covariance parameters, estimated from OLS residuals when not given
    pub(crate) theta_init: Option<CovParams<F>>,
    /// Number of nearest neighbors
    pub(crate) neighbor_size: usize,
    /// Nearest neighbors search strategy
    pub(crate) search: NeighborSearch,
    /// Ridge policy of conditional systems
    pub(crate) jitter: JitterPolicy,
    /// First epoch at which theta is re-estimated
    pub(crate) update_init: usize,
    /// Number of epochs between two theta re-estimations
    pub(crate) update_step: usize,
    /// Minimal loss decrease counted as an improvement
    pub(crate) min_delta: F,
    /// Number of epochs without improvement before stopping
    pub(crate) patience: usize,
    /// Max number of epochs
    pub(crate) max_epochs: usize,
    /// Adam learning rate
    pub(crate) learning_rate: F,
    /// Minibatch size
    pub(crate) batch_size: usize,
    /// Seed of the minibatches shuffling
    pub(crate) seed: u64,
}

impl<F: Float, M: MeanFunction<F>, C: CovarianceModel<F>, E: ThetaEstimator<F>>
    NnglsValidParams<F, M, C, E>
{
    /// Get mean function
    pub fn mean(&self) -> &M {
        &self.mean
    }

    /// Get covariance kernel
    pub fn kernel(&self) -> &C {
        &self.kernel
    }

    /// Get theta estimator
    pub fn estimator(&self) -> &E {
        &self.estimator
    }

    /// Get initial theta if any
    pub fn theta_init(&self) -> Option<&CovParams<F>> {
        self.theta_init.as_ref()
    }

    /// Get number of nearest neighbors
    pub fn neighbor_size(&self) -> usize {
        self.neighbor_size
    }

    /// Get neighbors search strategy
    pub fn search(&self) -> NeighborSearch {
        self.search
    }

    /// Get jitter policy
    pub fn jitter(&self) -> &JitterPolicy {
        &self.jitter
    }

    /// Get first re-estimation epoch
    pub fn update_init(&self) -> usize {
        self.update_init
    }

    /// Get number of epochs between re-estimations
    pub fn update_step(&self) -> usize {
        self.update_step
    }

    /// Get early stopping minimal improvement
    pub fn min_delta(&self) -> F {
        self.min_delta
    }

    /// Get early stopping patience
    pub fn patience(&self) -> usize {
        self.patience
    }

    /// Get max number of epochs
    pub fn max_epochs(&self) -> usize {
        self.max_epochs
    }

    /// Get learning rate
    pub fn learning_rate(&self) -> F {
        self.learning_rate
    }

    /// Get minibatch size
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Get random seed
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Whether theta is re-estimated at the start of the given (0-based) epoch
    pub fn is_reestimation_epoch(&self, epoch: usize) -> bool {
        epoch >= self.update_init && (epoch - self.update_init) % self.update_step == 0
    }
}

#[derive(Clone, Debug)]
/// The set of hyperparameters that can be specified for the training of
/// the [NN-GLS model](crate::Nngls).
pub struct NnglsParams<F: Float, M: MeanFunction<F>, C: CovarianceModel<F>, E: ThetaEstimator<F>>(
    NnglsValidParams<F, M, C, E>,
);

impl<F: Float, M: MeanFunction<F>, C: CovarianceModel<F>, E: ThetaEstimator<F>>
    NnglsParams<F, M, C, E>
{
    /// A constructor for NN-GLS parameters given the mean function to train,
    /// the covariance kernel and the theta estimator
    pub fn new(mean: M, kernel: C, estimator: E) -> NnglsParams<F, M, C, E> {
        Self(NnglsValidParams {
            mean,
            kernel,
            estimator,
            theta_init: None,
            neighbor_size: NNGLS_NEIGHBOR_SIZE,
            search: NeighborSearch::default(),
            jitter: JitterPolicy::default(),
            update_init: 10,
            update_step: 10,
            min_delta: F::cast(1e-3),
            patience: 20,
            max_epochs: NNGLS_MAX_EPOCHS,
            learning_rate: F::cast(1e-2),
            batch_size: 50,
            seed: 42,
        })
    }

    /// A constructor for NN-GLS parameters from validated parameters
    pub fn new_from_valid(params: &NnglsValidParams<F, M, C, E>) -> Self {
        Self(params.clone())
    }

    /// Set mean function (and its starting parameters).
    pub fn mean(mut self, mean: M) -> Self {
        self.0.mean = mean;
        self
    }

    /// Set covariance kernel.
    pub fn kernel(mut self, kernel: C) -> Self {
        self.0.kernel = kernel;
        self
    }

    /// Set theta estimator.
    pub fn estimator(mut self, estimator: E) -> Self {
        self.0.estimator = estimator;
        self
    }

    /// Set initial covariance parameters.
    ///
    /// When not set, theta is initialized by the estimator applied to ordinary
    /// least squares residuals.
    pub fn theta_init(mut self, theta: CovParams<F>) -> Self {
        self.0.theta_init = Some(theta);
        self
    }

    /// Set the number of nearest neighbors, should be positive
    pub fn neighbor_size(mut self, k: usize) -> Self {
        self.0.neighbor_size = k;
        self
    }

    /// Set the nearest neighbors search strategy
    pub fn search(mut self, search: NeighborSearch) -> Self {
        self.0.search = search;
        self
    }

    /// Set the ridge policy used when conditional systems are singular
    pub fn jitter(mut self, jitter: JitterPolicy) -> Self {
        self.0.jitter = jitter;
        self
    }

    /// Set the first epoch of theta re-estimation
    pub fn update_init(mut self, epoch: usize) -> Self {
        self.0.update_init = epoch;
        self
    }

    /// Set the number of epochs between theta re-estimations, should be positive
    pub fn update_step(mut self, step: usize) -> Self {
        self.0.update_step = step;
        self
    }

    /// Set the minimal loss decrease counted as an improvement by early stopping
    pub fn min_delta(mut self, min_delta: F) -> Self {
        self.0.min_delta = min_delta;
        self
    }

    /// Set the number of epochs without improvement tolerated before stopping
    pub fn patience(mut self, patience: usize) -> Self {
        self.0.patience = patience;
        self
    }

    /// Set the max number of epochs
    pub fn max_epochs(mut self, max_epochs: usize) -> Self {
        self.0.max_epochs = max_epochs;
        self
    }

    /// Set Adam learning rate
    pub fn learning_rate(mut self, lr: F) -> Self {
        self.0.learning_rate = lr;
        self
    }

    /// Set minibatch size
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.0.batch_size = batch_size;
        self
    }

    /// Set the seed of minibatches shuffling
    pub fn seed(mut self, seed: u64) -> Self {
        self.0.seed = seed;
        self
    }
}

impl<F: Float, M: MeanFunction<F>, C: CovarianceModel<F>, E: ThetaEstimator<F>>
    From<NnglsValidParams<F, M, C, E>> for NnglsParams<F, M, C, E>
{
    fn from(valid: NnglsValidParams<F, M, C, E>) -> Self {
        NnglsParams(valid)
    }
}

impl<F: Float, M: MeanFunction<F>, C: CovarianceModel<F>, E: ThetaEstimator<F>> ParamGuard
    for NnglsParams<F, M, C, E>
{
    type Checked = NnglsValidParams<F, M, C, E>;
    type Error = NnglsError;

    fn check_ref(&self) -> Result<&Self::Checked> {
        let p = &self.0;
        for (name, value) in [
            ("neighbor_size", p.neighbor_size),
            ("update_step", p.update_step),
            ("patience", p.patience),
            ("max_epochs", p.max_epochs),
            ("batch_size", p.batch_size),
        ] {
            if value == 0 {
                return Err(NnglsError::InvalidConfigError(format!(
                    "`{name}` should be a positive integer"
                )));
            }
        }
        if !(p.learning_rate > F::zero()) || !p.learning_rate.is_finite() {
            return Err(NnglsError::InvalidConfigError(format!(
                "`learning_rate` should be positive, got {}",
                p.learning_rate
            )));
        }
        if !(p.min_delta >= F::zero()) || !p.min_delta.is_finite() {
            return Err(NnglsError::InvalidConfigError(format!(
                "`min_delta` should be non negative, got {}",
                p.min_delta
            )));
        }
        if !(p.jitter.initial > 0.) || !(p.jitter.growth > 1.) || !p.jitter.growth.is_finite() {
            return Err(NnglsError::InvalidConfigError(format!(
                "jitter should have a positive initial ridge and a growth > 1, got {:?}",
                p.jitter
            )));
        }
        Ok(&self.0)
    }

    fn check(self) -> Result<Self::Checked> {
        self.check_ref()?;
        Ok(self.0)
    }
}
