//! Initial-communality estimation via squared multiple correlations.

use crate::extract::sorted_eigh;
use ndarray::{Array1, Array2};
use ndarray_linalg::Inverse;

/// Initial communalities plus how they were obtained.
#[derive(Debug, Clone)]
pub struct SmcEstimate {
    /// Per-variable squared multiple correlation, clamped to [0, 1].
    pub communalities: Array1<f64>,
    /// True when inversion was unusable and the estimate degraded to the
    /// squared maximum absolute correlation per variable.
    pub fallback: bool,
}

/// Estimates initial communalities as h²ᵢ = 1 − 1/(Σ⁻¹)ᵢᵢ.
///
/// Singular matrices are handled with an eigendecomposition-based
/// pseudo-inverse; if even that yields an unusable diagonal the estimator
/// falls back to the squared maximum absolute correlation of each variable,
/// which the caller must surface as a structured warning.
pub fn smc(corr: &Array2<f64>) -> SmcEstimate {
    if let Some(diag) = inverse_diagonal(corr) {
        let communalities = diag.mapv(|d| (1.0 - 1.0 / d).clamp(0.0, 1.0));
        return SmcEstimate {
            communalities,
            fallback: false,
        };
    }
    log::warn!("correlation matrix not invertible; using squared-max-correlation communalities");
    SmcEstimate {
        communalities: squared_max_correlation(corr),
        fallback: true,
    }
}

/// Diagonal of the inverse (or pseudo-inverse) correlation matrix, or `None`
/// when no usable diagonal can be produced.
fn inverse_diagonal(corr: &Array2<f64>) -> Option<Array1<f64>> {
    if let Ok(inv) = corr.inv() {
        let diag = inv.diag().to_owned();
        if diag.iter().all(|d| d.is_finite() && *d > 0.0) {
            return Some(diag);
        }
    }
    pseudo_inverse_diagonal(corr)
}

fn pseudo_inverse_diagonal(corr: &Array2<f64>) -> Option<Array1<f64>> {
    let p = corr.nrows();
    let (vals, vecs) = sorted_eigh(corr, "smc").ok()?;
    let largest = vals.iter().cloned().fold(0.0f64, f64::max);
    if largest <= 0.0 {
        return None;
    }
    // Reciprocals only for eigenvalues carrying signal; the rest are dropped
    // exactly as a pseudo-inverse does.
    let cutoff = largest * p as f64 * f64::EPSILON;
    let mut diag = Array1::zeros(p);
    for i in 0..p {
        let mut acc = 0.0;
        for (k, &val) in vals.iter().enumerate() {
            if val > cutoff {
                let v = vecs[[i, k]];
                acc += v * v / val;
            }
        }
        diag[i] = acc;
    }
    if diag.iter().all(|d| d.is_finite() && *d > 0.0) {
        Some(diag)
    } else {
        None
    }
}

/// Squared maximum absolute off-diagonal correlation per variable.
pub(crate) fn squared_max_correlation(corr: &Array2<f64>) -> Array1<f64> {
    let p = corr.nrows();
    Array1::from_shape_fn(p, |i| {
        let mut max_abs = 0.0f64;
        for j in 0..p {
            if j != i {
                max_abs = max_abs.max(corr[[i, j]].abs());
            }
        }
        (max_abs * max_abs).clamp(0.0, 1.0)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn identity_matrix_has_zero_smc() {
        let corr = Array2::eye(3);
        let est = smc(&corr);
        assert!(!est.fallback);
        for &h in est.communalities.iter() {
            assert_abs_diff_eq!(h, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn two_variable_smc_equals_r_squared() {
        let corr = array![[1.0, 0.6], [0.6, 1.0]];
        let est = smc(&corr);
        assert!(!est.fallback);
        assert_abs_diff_eq!(est.communalities[0], 0.36, epsilon = 1e-10);
        assert_abs_diff_eq!(est.communalities[1], 0.36, epsilon = 1e-10);
    }

    #[test]
    fn singular_matrix_stays_finite() {
        // Perfectly collinear pair: rank-deficient.
        let corr = array![
            [1.0, 1.0, 0.3],
            [1.0, 1.0, 0.3],
            [0.3, 0.3, 1.0]
        ];
        let est = smc(&corr);
        for &h in est.communalities.iter() {
            assert!(h.is_finite());
            assert!((0.0..=1.0).contains(&h));
        }
    }

    #[test]
    fn fallback_uses_squared_max_correlation() {
        let corr = array![[1.0, 0.5, -0.8], [0.5, 1.0, 0.2], [-0.8, 0.2, 1.0]];
        let fallback = squared_max_correlation(&corr);
        assert_abs_diff_eq!(fallback[0], 0.64, epsilon = 1e-12);
        assert_abs_diff_eq!(fallback[1], 0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(fallback[2], 0.64, epsilon = 1e-12);
    }
}
