use crate::errors::{NnglsError, Result};
use linfa::Float;
use ndarray::{Array1, Array2, ArrayBase, ArrayView1, ArrayView2, Axis, Data, Ix1, Ix2};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// Observations of one partition (training, validation or testing):
/// covariates `x` (n, p), locations `coords` (n, d) and responses `y` (n,)
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(deserialize = "F: Deserialize<'de>"))
)]
pub struct SpatialData<F: Float> {
    x: Array2<F>,
    coords: Array2<F>,
    y: Array1<F>,
}

fn check_finite<'a, F: Float>(
    name: &str,
    rows: impl Iterator<Item = ArrayView1<'a, F>>,
) -> Result<()> {
    for (i, row) in rows.enumerate() {
        if row.iter().any(|v| !v.is_finite()) {
            return Err(NnglsError::DataError {
                index: i,
                message: format!("non finite {name} value"),
            });
        }
    }
    Ok(())
}

impl<F: Float> SpatialData<F> {
    /// Constructor
    ///
    /// # Errors
    ///
    /// * [NnglsError::InvalidConfigError] when row counts differ or there are no coordinates columns,
    /// * [NnglsError::DataError] with the first offending row on a non finite value.
    pub fn new(
        x: ArrayBase<impl Data<Elem = F>, Ix2>,
        coords: ArrayBase<impl Data<Elem = F>, Ix2>,
        y: ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Result<Self> {
        if x.nrows() != y.len() || coords.nrows() != y.len() {
            return Err(NnglsError::InvalidConfigError(format!(
                "covariates ({}), coordinates ({}) and responses ({}) counts should match",
                x.nrows(),
                coords.nrows(),
                y.len()
            )));
        }
        if coords.ncols() == 0 {
            return Err(NnglsError::InvalidConfigError(
                "coordinates should have at least one column".to_string(),
            ));
        }
        check_finite("covariate", x.rows().into_iter())?;
        check_finite("coordinate", coords.rows().into_iter())?;
        if let Some(i) = y.iter().position(|v| !v.is_finite()) {
            return Err(NnglsError::DataError {
                index: i,
                message: "non finite response value".to_string(),
            });
        }
        Ok(SpatialData {
            x: x.to_owned(),
            coords: coords.to_owned(),
            y: y.to_owned(),
        })
    }

    /// Covariates (n, p)
    pub fn x(&self) -> ArrayView2<'_, F> {
        self.x.view()
    }

    /// Locations (n, d)
    pub fn coords(&self) -> ArrayView2<'_, F> {
        self.coords.view()
    }

    /// Responses (n,)
    pub fn y(&self) -> ArrayView1<'_, F> {
        self.y.view()
    }

    /// Number of observations
    pub fn len(&self) -> usize {
        self.y.len()
    }

    /// Whether there is no observation
    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }

    /// Number of covariates
    pub fn n_covariates(&self) -> usize {
        self.x.ncols()
    }

    /// Dimension of the location space
    pub fn spatial_dim(&self) -> usize {
        self.coords.ncols()
    }

    /// Sub dataset made of the given rows, in the given order
    pub fn select(&self, indices: &[usize]) -> Self {
        SpatialData {
            x: self.x.select(Axis(0), indices),
            coords: self.coords.select(Axis(0), indices),
            y: self.y.select(Axis(0), indices),
        }
    }
}
