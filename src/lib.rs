//! This library implements neural network generalized least squares (NN-GLS) regression
//! for geospatial data: an observed outcome is decomposed into a non-linear covariate effect,
//! estimated by a neural network, and a spatially correlated random effect modelled by a
//! [Nearest Neighbor Gaussian Process](https://arxiv.org/abs/1406.7343) (NNGP).
//!
//! The core machinery is the NNGP (a.k.a. Vecchia) approximation of the spatial covariance:
//! * [neighbors]: every observation is conditioned on its nearest previously indexed
//!   observations, which defines a sparse directed acyclic graph,
//! * [decorrelation]: per observation conditional weights and variances give a sparse
//!   triangular factor of the precision matrix used to decorrelate residuals,
//! * [training]: decorrelated residuals define a GLS loss used to train the mean function
//!   while covariance parameters are periodically re-estimated ([estimation]),
//! * [kriging]: predictions at new locations add the NNGP kriging of training residuals.
//!
//! NN-GLS is implemented by [Nngls] parameterized by [NnglsParams].
//!
//! Reference:
//!
//! Zhan, W., & Datta, A. (2024). Neural networks for geospatial data.
//! Journal of the American Statistical Association.
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]
mod algorithm;
pub mod covariance_models;
mod data;
pub mod decorrelation;
mod errors;
pub mod estimation;
pub mod kriging;
pub mod mean_functions;
pub mod metrics;
pub mod neighbors;
pub mod optimization;
mod parameters;
pub mod simulation;
pub mod training;

pub use algorithm::*;
pub use covariance_models::{
    CovParams, CovarianceModel, ExponentialCov, Matern32Cov, Matern52Cov, SquaredExponentialCov,
};
pub use data::*;
pub use errors::*;
pub use estimation::{FixedTheta, ThetaEstimator, Variogram, VecchiaMle};
pub use kriging::{Kriging, SpatialPrediction};
pub use mean_functions::{
    Activation, ConstantBasis, LinearBasis, LinearMean, MeanFunction, Mlp, PolynomialMean,
    QuadraticBasis,
};
pub use neighbors::{NeighborGraph, NeighborSearch};
pub use parameters::*;
