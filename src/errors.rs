use thiserror::Error;

/// A result type for NN-GLS algorithms
pub type Result<T> = std::result::Result<T, NnglsError>;

/// An error when building neighbor graphs, decorrelating, training or predicting
#[derive(Error, Debug)]
pub enum NnglsError {
    /// When configuration is invalid (bad theta, k = 0, mismatched array lengths, ...)
    #[error("Invalid configuration: {0}")]
    InvalidConfigError(String),
    /// When a conditional covariance system stays singular after all jitter retries
    #[error("Numerical error at observation {index}: {message}")]
    NumericalError {
        /// Offending observation index
        index: usize,
        /// Details
        message: String,
    },
    /// When data are degenerate (duplicate coordinates, missing neighbors, non finite values)
    #[error("Data error at observation {index}: {message}")]
    DataError {
        /// Offending observation index
        index: usize,
        /// Details
        message: String,
    },
    /// When linear algebra computation fails
    #[error(transparent)]
    LinalgError(#[from] linfa_linalg::LinalgError),
    /// When a linfa error occurs
    #[error(transparent)]
    LinfaError(#[from] linfa::error::Error),
    /// When error during saving
    #[cfg(feature = "persistent")]
    #[error("Save error: {0}")]
    SaveError(#[from] serde_json::Error),
    /// When error during loading
    #[error("Load IO error")]
    LoadIoError(#[from] std::io::Error),
}
