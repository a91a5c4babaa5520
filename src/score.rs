//! Factor-score estimation: closed-form weight matrices given the fitted
//! loadings, factor correlations and uniquenesses.

use crate::constants::EIGENVALUE_FLOOR;
use crate::error::FaError;
use crate::extract::sorted_eigh;
use crate::post::structure_matrix;
use ndarray::{Array1, Array2};
use ndarray_linalg::Inverse;
use serde::{Deserialize, Serialize};

/// Score-weighting scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScoreMethod {
    /// Thurstone regression weights W = Σ⁻¹·S.
    Regression,
    /// Bartlett weighted least squares, W = Ψ⁻¹Λ·(ΛᵀΨ⁻¹Λ)⁻¹.
    Bartlett,
    /// Anderson–Rubin weights yielding uncorrelated unit-variance scores.
    AndersonRubin,
}

/// Computes the p×m score-weight matrix for the chosen method.
pub fn score_weights(
    method: ScoreMethod,
    corr: &Array2<f64>,
    loadings: &Array2<f64>,
    phi: Option<&Array2<f64>>,
    uniquenesses: &Array1<f64>,
) -> Result<Array2<f64>, FaError> {
    match method {
        ScoreMethod::Regression => {
            let structure = structure_matrix(loadings, phi);
            let corr_inv = corr
                .inv()
                .map_err(|_| FaError::Singular { stage: "scoring" })?;
            Ok(corr_inv.dot(&structure))
        }
        ScoreMethod::Bartlett => {
            let weighted = psi_inverse_weighted(loadings, uniquenesses);
            let mid = loadings.t().dot(&weighted);
            let mid_inv = mid
                .inv()
                .map_err(|_| FaError::Singular { stage: "scoring" })?;
            Ok(weighted.dot(&mid_inv))
        }
        ScoreMethod::AndersonRubin => {
            let weighted = psi_inverse_weighted(loadings, uniquenesses);
            let mid = weighted.t().dot(corr).dot(&weighted);
            let mid_inv_sqrt = symmetric_inverse_sqrt(&mid)?;
            Ok(weighted.dot(&mid_inv_sqrt))
        }
    }
}

/// Scores for (already centered/standardized) data rows: Z·W.
pub fn factor_scores(z: &Array2<f64>, weights: &Array2<f64>) -> Array2<f64> {
    z.dot(weights)
}

/// Covariance of the estimated scores, WᵀΣW.
pub fn score_covariance(corr: &Array2<f64>, weights: &Array2<f64>) -> Array2<f64> {
    weights.t().dot(corr).dot(weights)
}

/// Ψ⁻¹Λ: loading rows scaled by reciprocal uniquenesses.
fn psi_inverse_weighted(loadings: &Array2<f64>, uniquenesses: &Array1<f64>) -> Array2<f64> {
    let mut weighted = loadings.clone();
    for (i, mut row) in weighted.rows_mut().into_iter().enumerate() {
        let inv = 1.0 / uniquenesses[i];
        row.mapv_inplace(|v| v * inv);
    }
    weighted
}

/// Inverse square root of a symmetric positive semi-definite matrix, with
/// eigenvalues floored before the reciprocal root.
fn symmetric_inverse_sqrt(matrix: &Array2<f64>) -> Result<Array2<f64>, FaError> {
    let m = matrix.nrows();
    let (vals, vecs) = sorted_eigh(matrix, "scoring")?;
    let mut out = Array2::zeros((m, m));
    for k in 0..m {
        let coeff = 1.0 / vals[k].max(EIGENVALUE_FLOOR).sqrt();
        for i in 0..m {
            for j in 0..m {
                out[[i, j]] += coeff * vecs[[i, k]] * vecs[[j, k]];
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn one_factor_model() -> (Array2<f64>, Array2<f64>, Array1<f64>) {
        // Σ implied exactly by a single factor with loadings 0.8/0.7/0.6.
        let loadings = array![[0.8], [0.7], [0.6]];
        let mut corr = loadings.dot(&loadings.t());
        for i in 0..3 {
            corr[[i, i]] = 1.0;
        }
        let uniq = array![1.0 - 0.64, 1.0 - 0.49, 1.0 - 0.36];
        (corr, loadings, uniq)
    }

    #[test]
    fn bartlett_weights_are_conditionally_unbiased() {
        // WᵀΛ = I is the defining property of Bartlett weights.
        let (_, loadings, uniq) = one_factor_model();
        let w = score_weights(ScoreMethod::Bartlett, &Array2::eye(3), &loadings, None, &uniq)
            .unwrap();
        let wl = w.t().dot(&loadings);
        assert_abs_diff_eq!(wl[[0, 0]], 1.0, epsilon = 1e-10);
    }

    #[test]
    fn anderson_rubin_scores_have_unit_variance() {
        let (corr, loadings, uniq) = one_factor_model();
        let w =
            score_weights(ScoreMethod::AndersonRubin, &corr, &loadings, None, &uniq).unwrap();
        let cov = score_covariance(&corr, &w);
        assert_abs_diff_eq!(cov[[0, 0]], 1.0, epsilon = 1e-8);
    }

    #[test]
    fn regression_score_variance_is_below_one() {
        let (corr, loadings, uniq) = one_factor_model();
        let w = score_weights(ScoreMethod::Regression, &corr, &loadings, None, &uniq).unwrap();
        let cov = score_covariance(&corr, &w);
        // Regression scores shrink toward the mean.
        assert!(cov[[0, 0]] > 0.0 && cov[[0, 0]] < 1.0);
    }

    #[test]
    fn scores_are_linear_in_the_data() {
        let (corr, loadings, uniq) = one_factor_model();
        let w = score_weights(ScoreMethod::Regression, &corr, &loadings, None, &uniq).unwrap();
        let z = array![[1.0, 0.5, -0.5], [0.0, 0.0, 0.0]];
        let s = factor_scores(&z, &w);
        assert_eq!(s.dim(), (2, 1));
        assert_abs_diff_eq!(s[[1, 0]], 0.0, epsilon = 1e-12);
    }
}
