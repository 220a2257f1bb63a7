//! Prediction of the spatial random effect at new locations.
//!
//! The residuals of the training observations are kriged from the `k` nearest
//! training locations of each new location, reusing the conditional systems (and
//! their jitter policy) of the NNGP approximation.

use crate::covariance_models::{CovParams, CovarianceModel};
use crate::decorrelation::{JitterPolicy, conditional_weights};
use crate::errors::{NnglsError, Result};
use crate::neighbors::{NeighborSearch, QueryNeighbors};
use linfa::Float;
use ndarray::{Array1, Array2, ArrayBase, Axis, Data, Ix1, Ix2};
use rayon::prelude::*;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// Predictions at new locations
#[derive(Clone, Debug, PartialEq)]
pub struct SpatialPrediction<F: Float> {
    /// Mean function part `f(x)`
    pub mean: Array1<F>,
    /// Spatial random effect part `b^T r_N`
    pub random_effect: Array1<F>,
    /// Total prediction, mean plus random effect
    pub total: Array1<F>,
    /// Predictive variance `C(0) - c^T b`, clamped at zero
    pub variance: Array1<F>,
}

/// NNGP kriging of a spatial random effect.
///
/// Given residuals `r` of the training observations, the value at a new location
/// is predicted from its `k` nearest training locations `N` as `b^T r_N` where `b`
/// solves `C_NN b = c` (`c` being the cross covariances between the new location and
/// its neighbors), with predictive variance `C(0) - c^T b`.
#[derive(Clone, Debug)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(
        serialize = "F: Serialize, C: Serialize",
        deserialize = "F: Deserialize<'de>, C: Deserialize<'de>"
    ))
)]
pub struct Kriging<F: Float, C: CovarianceModel<F>> {
    model: C,
    theta: CovParams<F>,
    coords: Array2<F>,
    residuals: Array1<F>,
    neighbor_size: usize,
    search: NeighborSearch,
    jitter: JitterPolicy,
}

impl<F: Float, C: CovarianceModel<F>> Kriging<F, C> {
    /// Kriging from training `coords` (n, d) and `residuals` (n,)
    pub fn new(
        model: C,
        theta: CovParams<F>,
        coords: &ArrayBase<impl Data<Elem = F>, Ix2>,
        residuals: &ArrayBase<impl Data<Elem = F>, Ix1>,
        neighbor_size: usize,
    ) -> Result<Self> {
        if coords.nrows() != residuals.len() {
            return Err(NnglsError::InvalidConfigError(format!(
                "coordinates ({}) and residuals ({}) counts should match",
                coords.nrows(),
                residuals.len()
            )));
        }
        if neighbor_size == 0 {
            return Err(NnglsError::InvalidConfigError(
                "neighbor size should be a positive integer".to_string(),
            ));
        }
        Ok(Kriging {
            model,
            theta,
            coords: coords.to_owned(),
            residuals: residuals.to_owned(),
            neighbor_size,
            search: NeighborSearch::default(),
            jitter: JitterPolicy::default(),
        })
    }

    /// Set the nearest neighbors search strategy
    pub fn with_search(mut self, search: NeighborSearch) -> Self {
        self.search = search;
        self
    }

    /// Set the ridge policy of the conditional systems
    pub fn with_jitter(mut self, jitter: JitterPolicy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Covariance parameters
    pub fn theta(&self) -> &CovParams<F> {
        &self.theta
    }

    /// Training residuals
    pub fn residuals(&self) -> &Array1<F> {
        &self.residuals
    }

    /// Predict the random effect and its variance at `coords` (m, d)
    pub fn predict_valvar(
        &self,
        coords: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<(Array1<F>, Array1<F>)> {
        let query = QueryNeighbors::build(&self.coords, coords, self.neighbor_size, self.search)?;
        let solved: Vec<Result<(F, F)>> = (0..query.len())
            .into_par_iter()
            .map(|i| {
                let nbrs = query.neighbors(i);
                let nbr_coords = self.coords.select(Axis(0), nbrs);
                let (b, v) = conditional_weights(
                    &self.model,
                    &self.theta,
                    &nbr_coords,
                    query.distances(i),
                    &self.jitter,
                    i,
                )?;
                let value = nbrs
                    .iter()
                    .zip(b.iter())
                    .fold(F::zero(), |acc, (&j, &bj)| acc + bj * self.residuals[j]);
                Ok((value, v.max(F::zero())))
            })
            .collect();

        let mut values = Array1::zeros(query.len());
        let mut variances = Array1::zeros(query.len());
        for (i, res) in solved.into_iter().enumerate() {
            let (value, var) = res?;
            values[i] = value;
            variances[i] = var;
        }
        Ok((values, variances))
    }

    /// Predict the random effect at `coords` (m, d)
    pub fn predict(&self, coords: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array1<F>> {
        self.predict_valvar(coords).map(|(v, _)| v)
    }

    /// Combine mean function predictions at new locations with the kriged random effect
    pub fn predict_spatial(
        &self,
        mean: Array1<F>,
        coords: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<SpatialPrediction<F>> {
        if mean.len() != coords.nrows() {
            return Err(NnglsError::InvalidConfigError(format!(
                "mean predictions ({}) and coordinates ({}) counts should match",
                mean.len(),
                coords.nrows()
            )));
        }
        let (random_effect, variance) = self.predict_valvar(coords)?;
        let total = &mean + &random_effect;
        Ok(SpatialPrediction {
            mean,
            random_effect,
            total,
            variance,
        })
    }
}
