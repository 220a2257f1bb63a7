//! A module for metrics to evaluate predictions against observed values
use crate::errors::{NnglsError, Result};
use linfa::Float;
use ndarray::{ArrayBase, Data, Ix1};

fn check_lengths(n_pred: usize, n_obs: usize) -> Result<()> {
    if n_pred != n_obs || n_obs == 0 {
        return Err(NnglsError::InvalidConfigError(format!(
            "predictions ({n_pred}) and observations ({n_obs}) should have the same non zero length"
        )));
    }
    Ok(())
}

/// Mean squared error
pub fn mse<F: Float>(
    pred: &ArrayBase<impl Data<Elem = F>, Ix1>,
    obs: &ArrayBase<impl Data<Elem = F>, Ix1>,
) -> Result<F> {
    check_lengths(pred.len(), obs.len())?;
    Ok((pred - obs).mapv(|v| v * v).sum() / F::cast(obs.len()))
}

/// Root mean squared error
pub fn rmse<F: Float>(
    pred: &ArrayBase<impl Data<Elem = F>, Ix1>,
    obs: &ArrayBase<impl Data<Elem = F>, Ix1>,
) -> Result<F> {
    mse(pred, obs).map(|v| v.sqrt())
}

/// Q2 predictive coefficient `1 - PRESS / TSS`: 1 for perfect predictions,
/// 0 for predicting the observations mean
pub fn q2<F: Float>(
    pred: &ArrayBase<impl Data<Elem = F>, Ix1>,
    obs: &ArrayBase<impl Data<Elem = F>, Ix1>,
) -> Result<F> {
    check_lengths(pred.len(), obs.len())?;
    let mean = obs.sum() / F::cast(obs.len());
    let press = (pred - obs).mapv(|v| v * v).sum();
    let tss = obs.mapv(|v| (v - mean) * (v - mean)).sum();
    Ok(F::one() - press / tss)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_metrics() {
        let obs = array![1., 2., 3., 4.];
        let pred = array![1., 2., 3., 6.];
        assert_abs_diff_eq!(mse(&pred, &obs).unwrap(), 1.);
        assert_abs_diff_eq!(rmse(&pred, &obs).unwrap(), 1.);
        assert_abs_diff_eq!(q2(&obs, &obs).unwrap(), 1.);
        assert_abs_diff_eq!(q2(&array![2.5, 2.5, 2.5, 2.5], &obs).unwrap(), 0.);
        assert!(mse(&array![1.], &obs).is_err());
    }
}
