//! Generalized least squares training of a mean function with NNGP spatial effects.
//!
//! The GLS loss of residuals `r = y - f(x)` is the mean of squared decorrelated
//! residuals `e = D^{-1/2} (I - B) r` (see [crate::decorrelation]). Minibatch losses only
//! decorrelate the batch nodes, which reads residuals of the batch nodes and of their
//! neighbors.
//!
//! Training runs an epoch state machine:
//!
//! * `Init`: theta is given or estimated from ordinary least squares residuals,
//! * `Accumulate`: shuffled minibatches of the GLS loss feed the Adam optimizer,
//! * `Reestimate`: at scheduled epochs theta is re-estimated from the full training
//!   residuals and conditional weights are rebuilt before the epoch minibatches,
//! * `Stopped`: no validation loss improvement during `patience` epochs, or max epochs reached.
//!
//! After a re-estimation the best checkpoint is evaluated again under the new weights,
//! so early stopping only compares losses computed with the same theta.
//!
//! The conditional weights in use live in a [CovarianceState] which is only mutated
//! through an exclusive borrow between epochs, so a minibatch never mixes weights of
//! two different thetas.

use crate::covariance_models::{CovParams, CovarianceModel};
use crate::data::SpatialData;
use crate::decorrelation::{JitterPolicy, NngpFactor};
use crate::errors::{NnglsError, Result};
use crate::estimation::{ThetaEstimator, initial_guess};
use crate::mean_functions::{LinearBasis, LinearMean, MeanFunction};
use crate::neighbors::NeighborGraph;
use crate::optimization::Adam;
use crate::parameters::NnglsValidParams;
use linfa::Float;
use log::{debug, info};
use ndarray::{Array1, ArrayBase, Axis, Data, Ix1, Ix2};
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand::seq::SliceRandom;
use rand_xoshiro::Xoshiro256Plus;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Phase of the training state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum TrainingPhase {
    /// Initial theta set, no epoch run yet
    Init,
    /// Epoch with minibatch updates only
    Accumulate,
    /// Epoch starting with theta re-estimation
    Reestimate,
    /// Training is over
    Stopped,
}

impl fmt::Display for TrainingPhase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            TrainingPhase::Init => "Init",
            TrainingPhase::Accumulate => "Accumulate",
            TrainingPhase::Reestimate => "Reestimate",
            TrainingPhase::Stopped => "Stopped",
        };
        write!(f, "{s}")
    }
}

/// Why training stopped, both being normal terminations
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum TerminationReason {
    /// Monitored loss did not improve during `patience` epochs
    EarlyStopping,
    /// `max_epochs` epochs were run
    MaxEpochs,
}

/// Losses and theta at the end of one epoch
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(deserialize = "F: Deserialize<'de>"))
)]
pub struct EpochRecord<F: Float> {
    /// Epoch index (0-based)
    pub epoch: usize,
    /// Phase of the epoch
    pub phase: TrainingPhase,
    /// GLS loss on the whole training set
    pub train_loss: F,
    /// GLS loss on the validation set if any
    pub valid_loss: Option<F>,
    /// Covariance parameters in use during the epoch
    pub theta: CovParams<F>,
}

/// Per epoch training records
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(deserialize = "F: Deserialize<'de>"))
)]
pub struct TrainingHistory<F: Float> {
    initial: Option<EpochRecord<F>>,
    records: Vec<EpochRecord<F>>,
    termination: Option<TerminationReason>,
    best_epoch: Option<usize>,
}

impl<F: Float> Default for TrainingHistory<F> {
    fn default() -> Self {
        TrainingHistory {
            initial: None,
            records: vec![],
            termination: None,
            best_epoch: None,
        }
    }
}

impl<F: Float> TrainingHistory<F> {
    /// Losses of the untrained mean function under the initial theta (`Init` phase,
    /// `epoch` is 0 as no epoch was run yet)
    pub fn initial(&self) -> Option<&EpochRecord<F>> {
        self.initial.as_ref()
    }

    /// Epoch records in order
    pub fn records(&self) -> &[EpochRecord<F>] {
        &self.records
    }

    /// Number of epochs run
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no epoch was run
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Termination reason, `None` while training is running
    pub fn termination(&self) -> Option<TerminationReason> {
        self.termination
    }

    /// Epoch whose mean function parameters were kept
    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    /// Training losses of all epochs
    pub fn train_losses(&self) -> Array1<F> {
        self.records.iter().map(|r| r.train_loss).collect()
    }

    /// Validation losses of all epochs if a validation set was given
    pub fn valid_losses(&self) -> Option<Array1<F>> {
        self.records.iter().map(|r| r.valid_loss).collect()
    }
}

/// Covariance parameters with the conditional weights of the training and validation
/// neighbor graphs computed for them. `generation` counts theta updates.
#[derive(Clone, Debug)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(deserialize = "F: Deserialize<'de>"))
)]
pub struct CovarianceState<F: Float> {
    theta: CovParams<F>,
    train: NngpFactor<F>,
    valid: Option<NngpFactor<F>>,
    generation: usize,
}

/// Locations of one partition with their neighbor graph
type Located<'a, F, D> = (&'a NeighborGraph<F>, &'a ArrayBase<D, Ix2>);

impl<F: Float> CovarianceState<F> {
    /// Compute conditional weights of the training (and validation) graphs for `theta`
    pub fn new<C: CovarianceModel<F>, D: Data<Elem = F> + Sync>(
        model: &C,
        theta: CovParams<F>,
        train: Located<F, D>,
        valid: Option<Located<F, D>>,
        jitter: &JitterPolicy,
    ) -> Result<Self> {
        let train = NngpFactor::new(train.0, train.1, model, &theta, jitter)?;
        let valid = valid
            .map(|(graph, coords)| NngpFactor::new(graph, coords, model, &theta, jitter))
            .transpose()?;
        Ok(CovarianceState {
            theta,
            train,
            valid,
            generation: 0,
        })
    }

    /// Switch to a new theta. All conditional weights are computed before anything is
    /// replaced: on error the state is left unchanged.
    pub fn update<C: CovarianceModel<F>, D: Data<Elem = F> + Sync>(
        &mut self,
        model: &C,
        theta: CovParams<F>,
        train: Located<F, D>,
        valid: Option<Located<F, D>>,
        jitter: &JitterPolicy,
    ) -> Result<()> {
        let next = Self::new(model, theta, train, valid, jitter)?;
        self.theta = next.theta;
        self.train = next.train;
        self.valid = next.valid;
        self.generation += 1;
        Ok(())
    }

    /// Current covariance parameters
    pub fn theta(&self) -> &CovParams<F> {
        &self.theta
    }

    /// Conditional weights of the training graph
    pub fn train_factor(&self) -> &NngpFactor<F> {
        &self.train
    }

    /// Conditional weights of the validation graph
    pub fn valid_factor(&self) -> Option<&NngpFactor<F>> {
        self.valid.as_ref()
    }

    /// Number of theta updates since creation
    pub fn generation(&self) -> usize {
        self.generation
    }
}

/// Mean of squared decorrelated residuals over all nodes
pub fn gls_loss<F: Float>(
    factor: &NngpFactor<F>,
    residuals: &ArrayBase<impl Data<Elem = F>, Ix1>,
) -> Result<F> {
    let e = factor.decorrelate(residuals)?;
    Ok(e.mapv(|v| v * v).sum() / F::cast(e.len().max(1)))
}

/// Sorted union of the `batch` nodes and of their neighbors: the residuals needed to
/// decorrelate the batch
pub fn batch_nodes<F: Float>(factor: &NngpFactor<F>, batch: &[usize]) -> Vec<usize> {
    let mut nodes: Vec<usize> = batch
        .iter()
        .flat_map(|&i| std::iter::once(i).chain(factor.neighbors(i).iter().cloned()))
        .collect();
    nodes.sort_unstable();
    nodes.dedup();
    nodes
}

/// GLS loss of a minibatch and its gradient w.r.t. mean function predictions.
///
/// `nodes` are given by [batch_nodes] and `residuals` (same length) are the residuals at
/// those nodes. With `e_i = (r_i - sum_j b_ij r_j) / s_i`, the loss is the mean of `e_i^2`
/// over the batch and, as `r = y - f`, its gradient w.r.t. `f` is `-2 e_i / (|B| s_i)` at
/// `i` and `2 e_i b_ij / (|B| s_i)` at each neighbor `j`.
pub fn gls_batch_loss<F: Float>(
    factor: &NngpFactor<F>,
    batch: &[usize],
    nodes: &[usize],
    residuals: &ArrayBase<impl Data<Elem = F>, Ix1>,
) -> Result<(F, Array1<F>)> {
    let e = factor.decorrelate_subset(batch, nodes, residuals)?;
    let pos = |j: usize| {
        nodes.binary_search(&j).map_err(|_| {
            NnglsError::InvalidConfigError(format!("node {j} missing from batch nodes"))
        })
    };
    let size = F::cast(batch.len().max(1));
    let scale = F::cast(2.) / size;
    let mut grad = Array1::zeros(nodes.len());
    for (&i, &ei) in batch.iter().zip(e.iter()) {
        let g = scale * ei / factor.conditional_variances()[i].sqrt();
        grad[pos(i)?] -= g;
        for (&j, &b) in factor.neighbors(i).iter().zip(factor.weights(i)) {
            grad[pos(j)?] += g * b;
        }
    }
    Ok((e.mapv(|v| v * v).sum() / size, grad))
}

/// Training and validation GLS losses of `mean` under the conditional weights of `state`
fn evaluate<F: Float, M: MeanFunction<F>>(
    mean: &M,
    state: &CovarianceState<F>,
    train: &SpatialData<F>,
    valid: Option<&SpatialData<F>>,
) -> Result<(F, Option<F>)> {
    let train_loss = gls_loss(
        state.train_factor(),
        &residuals(mean, &train.x(), &train.y()),
    )?;
    let valid_loss = match (valid, state.valid_factor()) {
        (Some(v), Some(factor)) => Some(gls_loss(factor, &residuals(mean, &v.x(), &v.y()))?),
        _ => None,
    };
    Ok((train_loss, valid_loss))
}

/// Residuals `y - f(x)`
pub(crate) fn residuals<F: Float, M: MeanFunction<F>>(
    mean: &M,
    x: &ArrayBase<impl Data<Elem = F>, Ix2>,
    y: &ArrayBase<impl Data<Elem = F>, Ix1>,
) -> Array1<F> {
    y - &mean.predict(x)
}

#[derive(Clone, Debug)]
struct Checkpoint<F: Float, M: MeanFunction<F>> {
    epoch: usize,
    loss: F,
    mean: M,
    state: CovarianceState<F>,
}

/// Result of a training run
#[derive(Clone, Debug)]
pub struct TrainingOutcome<F: Float, M: MeanFunction<F>> {
    /// Trained mean function (best epoch parameters)
    pub mean: M,
    /// Covariance state of the best epoch
    pub state: CovarianceState<F>,
    /// Neighbor graph of the training locations
    pub train_graph: NeighborGraph<F>,
    /// Per epoch records
    pub history: TrainingHistory<F>,
}

/// NN-GLS trainer.
///
/// Holds the committed state (mean function, optimizer, covariance state, shuffling
/// generator) which only changes at the end of a successful epoch.
pub struct GlsTrainer<'a, F, M, C, E>
where
    F: Float,
    M: MeanFunction<F>,
    C: CovarianceModel<F>,
    E: ThetaEstimator<F>,
{
    params: &'a NnglsValidParams<F, M, C, E>,
    train: &'a SpatialData<F>,
    train_graph: NeighborGraph<F>,
    valid: Option<(&'a SpatialData<F>, NeighborGraph<F>)>,
    mean: M,
    adam: Adam<F>,
    state: CovarianceState<F>,
    rng: Xoshiro256Plus,
    phase: TrainingPhase,
    best: Option<Checkpoint<F, M>>,
    wait: usize,
    history: TrainingHistory<F>,
}

impl<'a, F, M, C, E> GlsTrainer<'a, F, M, C, E>
where
    F: Float,
    M: MeanFunction<F>,
    C: CovarianceModel<F>,
    E: ThetaEstimator<F>,
{
    /// Build neighbor graphs and the initial covariance state (`Init` phase)
    pub fn new(
        params: &'a NnglsValidParams<F, M, C, E>,
        train: &'a SpatialData<F>,
        valid: Option<&'a SpatialData<F>>,
    ) -> Result<Self> {
        let mean = params.mean().clone();
        if train.n_covariates() != mean.n_inputs() {
            return Err(NnglsError::InvalidConfigError(format!(
                "mean function expects {} covariates, training data have {}",
                mean.n_inputs(),
                train.n_covariates()
            )));
        }
        if valid.is_some_and(|v| {
            v.n_covariates() != train.n_covariates() || v.spatial_dim() != train.spatial_dim()
        }) {
            return Err(NnglsError::InvalidConfigError(
                "validation and training data dimensions should match".to_string(),
            ));
        }

        let k = params.neighbor_size();
        let train_graph = NeighborGraph::build_with(&train.coords(), k, params.search())?;
        let valid = valid
            .map(|v| {
                NeighborGraph::build_with(&v.coords(), k, params.search()).map(|g| (v, g))
            })
            .transpose()?;

        let theta = match params.theta_init() {
            Some(theta) => *theta,
            None => {
                let ols = LinearMean::fit_ols(LinearBasis(), &train.x(), &train.y())?;
                let res = residuals(&ols, &train.x(), &train.y());
                let start = initial_guess(&res, &train.coords())?;
                params.estimator().estimate(
                    params.kernel(),
                    &res,
                    &train.coords(),
                    &train_graph,
                    &start,
                    params.jitter(),
                )?
            }
        };
        info!("Initial theta = {theta} ({})", params.estimator());

        let train_coords = train.coords();
        let valid_coords = valid.as_ref().map(|(v, _)| v.coords());
        let state = CovarianceState::new(
            params.kernel(),
            theta,
            (&train_graph, &train_coords),
            valid
                .as_ref()
                .zip(valid_coords.as_ref())
                .map(|((_, g), c)| (g, c)),
            params.jitter(),
        )?;

        let valid_data = valid.as_ref().map(|(v, _)| *v);
        let (train_loss, valid_loss) = evaluate(&mean, &state, train, valid_data)?;
        info!("Initial train loss = {train_loss}, valid loss = {valid_loss:?}");
        let history = TrainingHistory {
            initial: Some(EpochRecord {
                epoch: 0,
                phase: TrainingPhase::Init,
                train_loss,
                valid_loss,
                theta,
            }),
            ..TrainingHistory::default()
        };

        let adam = Adam::new(mean.parameters().len(), params.learning_rate());
        Ok(GlsTrainer {
            params,
            train,
            train_graph,
            valid,
            mean,
            adam,
            state,
            rng: Xoshiro256Plus::seed_from_u64(params.seed()),
            phase: TrainingPhase::Init,
            best: None,
            wait: 0,
            history,
        })
    }

    /// Current phase
    pub fn phase(&self) -> TrainingPhase {
        self.phase
    }

    /// Committed mean function
    pub fn mean(&self) -> &M {
        &self.mean
    }

    /// Committed covariance state
    pub fn state(&self) -> &CovarianceState<F> {
        &self.state
    }

    /// Records of the epochs run so far
    pub fn history(&self) -> &TrainingHistory<F> {
        &self.history
    }

    /// Neighbor graph of the training locations
    pub fn train_graph(&self) -> &NeighborGraph<F> {
        &self.train_graph
    }

    /// Run one epoch and commit its results. Returns the phase of the epoch
    /// (`Stopped` when training was already over).
    ///
    /// On error nothing is committed: the mean function, the optimizer and the
    /// covariance state stay as they were at the end of the previous epoch.
    pub fn step(&mut self) -> Result<TrainingPhase> {
        if self.phase == TrainingPhase::Stopped {
            return Ok(TrainingPhase::Stopped);
        }
        let now = Instant::now();
        let epoch = self.history.len();
        let mut mean = self.mean.clone();
        let mut adam = self.adam.clone();
        let mut state = self.state.clone();
        let mut rng = self.rng.clone();
        let (x, y, coords) = (self.train.x(), self.train.y(), self.train.coords());
        let valid_coords = self.valid.as_ref().map(|(v, _)| v.coords());
        let valid_located = self
            .valid
            .as_ref()
            .zip(valid_coords.as_ref())
            .map(|((_, g), c)| (g, c));

        let phase = if self.params.is_reestimation_epoch(epoch) {
            let res = residuals(&mean, &x, &y);
            let theta = self.params.estimator().estimate(
                self.params.kernel(),
                &res,
                &coords,
                &self.train_graph,
                state.theta(),
                self.params.jitter(),
            )?;
            info!("Epoch {epoch}: theta re-estimated {} -> {theta}", state.theta());
            state.update(
                self.params.kernel(),
                theta,
                (&self.train_graph, &coords),
                valid_located,
                self.params.jitter(),
            )?;
            TrainingPhase::Reestimate
        } else {
            TrainingPhase::Accumulate
        };

        let mut order: Vec<usize> = (0..self.train.len()).collect();
        order.shuffle(&mut rng);
        let mut weights = mean.parameters();
        for batch in order.chunks(self.params.batch_size()) {
            let nodes = batch_nodes(state.train_factor(), batch);
            let xb = x.select(Axis(0), &nodes);
            let res = residuals(&mean, &xb, &y.select(Axis(0), &nodes));
            let (_, dpred) = gls_batch_loss(state.train_factor(), batch, &nodes, &res)?;
            let grad = mean.gradient(&xb, &dpred);
            adam.step(&mut weights, &grad);
            mean.set_parameters(&weights)?;
        }

        let valid_data = self.valid.as_ref().map(|(v, _)| *v);
        let (train_loss, valid_loss) = evaluate(&mean, &state, self.train, valid_data)?;
        debug!(
            "Epoch {epoch} ({phase}): train loss = {train_loss}, valid loss = {valid_loss:?} in {}ms",
            now.elapsed().as_millis()
        );

        // losses of different thetas are not comparable: the best checkpoint is
        // evaluated again under the re-estimated covariance state
        let rebased = match (&self.best, phase) {
            (Some(best), TrainingPhase::Reestimate) => {
                let (t, v) = evaluate(&best.mean, &state, self.train, valid_data)?;
                debug!(
                    "Best epoch {} loss rebased {} -> {}",
                    best.epoch,
                    best.loss,
                    v.unwrap_or(t)
                );
                Some(Checkpoint {
                    epoch: best.epoch,
                    loss: v.unwrap_or(t),
                    mean: best.mean.clone(),
                    state: state.clone(),
                })
            }
            _ => None,
        };

        // commit
        let monitored = valid_loss.unwrap_or(train_loss);
        let improved = match rebased.as_ref().or(self.best.as_ref()) {
            None => monitored.is_finite(),
            Some(best) => best.loss - monitored > self.params.min_delta(),
        };
        if improved {
            self.best = Some(Checkpoint {
                epoch,
                loss: monitored,
                mean: mean.clone(),
                state: state.clone(),
            });
            self.wait = 0;
        } else {
            if rebased.is_some() {
                self.best = rebased;
            }
            self.wait += 1;
        }
        self.history.records.push(EpochRecord {
            epoch,
            phase,
            train_loss,
            valid_loss,
            theta: *state.theta(),
        });
        self.mean = mean;
        self.adam = adam;
        self.state = state;
        self.rng = rng;
        self.phase = phase;

        if self.wait >= self.params.patience() {
            info!("Early stopping at epoch {epoch}");
            self.stop(TerminationReason::EarlyStopping);
        } else if epoch + 1 >= self.params.max_epochs() {
            info!("Max epochs reached ({})", self.params.max_epochs());
            self.stop(TerminationReason::MaxEpochs);
        }
        Ok(phase)
    }

    fn stop(&mut self, reason: TerminationReason) {
        self.phase = TrainingPhase::Stopped;
        self.history.termination = Some(reason);
        self.history.best_epoch = self.best.as_ref().map(|b| b.epoch);
    }

    /// Run epochs until stopped, then restore the best epoch mean function and theta
    pub fn run(mut self) -> Result<TrainingOutcome<F, M>> {
        while self.step()? != TrainingPhase::Stopped {}
        let (mean, state) = match self.best.take() {
            Some(best) => {
                info!(
                    "Restore epoch {} parameters (loss = {}, theta = {})",
                    best.epoch,
                    best.loss,
                    best.state.theta()
                );
                (best.mean, best.state)
            }
            None => (self.mean, self.state),
        };
        Ok(TrainingOutcome {
            mean,
            state,
            train_graph: self.train_graph,
            history: self.history,
        })
    }
}
