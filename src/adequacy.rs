//! Sampling-adequacy diagnostics computed alongside extraction.
//!
//! These read only the immutable correlation matrix, so the orchestration
//! layer evaluates them concurrently with the factor work. A singular or
//! otherwise degenerate matrix yields `None`; the caller records a warning
//! instead of failing the analysis.

use ndarray::{Array1, Array2};
use ndarray_linalg::{Determinant, Inverse};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};

/// Kaiser–Meyer–Olkin measures plus Bartlett's test of sphericity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adequacy {
    /// Overall KMO measure of sampling adequacy.
    pub kmo_overall: f64,
    /// Per-variable measures of sampling adequacy.
    pub kmo_per_variable: Array1<f64>,
    /// Bartlett sphericity chi-square statistic.
    pub bartlett_chi2: f64,
    /// Degrees of freedom, p(p−1)/2.
    pub bartlett_df: f64,
    /// Upper-tail p-value of the chi-square statistic.
    pub bartlett_p: f64,
}

/// Computes KMO/MSA and Bartlett's sphericity test, or `None` when the
/// correlation matrix does not support them.
pub fn adequacy(corr: &Array2<f64>, n_obs: usize) -> Option<Adequacy> {
    let p = corr.nrows();
    if p < 2 || n_obs < 2 {
        return None;
    }
    let inv = corr.inv().ok()?;

    let mut r2_total = 0.0;
    let mut a2_total = 0.0;
    let mut r2_row = vec![0.0; p];
    let mut a2_row = vec![0.0; p];
    for i in 0..p {
        for j in 0..p {
            if i == j {
                continue;
            }
            let denom = inv[[i, i]] * inv[[j, j]];
            if denom <= 0.0 {
                return None;
            }
            let anti_image = -inv[[i, j]] / denom.sqrt();
            let r = corr[[i, j]];
            r2_total += r * r;
            a2_total += anti_image * anti_image;
            r2_row[i] += r * r;
            a2_row[i] += anti_image * anti_image;
        }
    }
    if r2_total + a2_total == 0.0 {
        // Identity correlations: KMO is undefined.
        return None;
    }
    let kmo_overall = r2_total / (r2_total + a2_total);
    let kmo_per_variable = Array1::from_shape_fn(p, |i| {
        let denom = r2_row[i] + a2_row[i];
        if denom > 0.0 {
            r2_row[i] / denom
        } else {
            0.0
        }
    });

    let (sign, ln_det) = corr.sln_det().ok()?;
    if sign <= 0.0 {
        return None;
    }
    let pf = p as f64;
    let nf = n_obs as f64;
    let bartlett_chi2 = -((nf - 1.0) - (2.0 * pf + 5.0) / 6.0) * ln_det;
    let bartlett_df = pf * (pf - 1.0) / 2.0;
    let chi = ChiSquared::new(bartlett_df).ok()?;
    let bartlett_p = 1.0 - chi.cdf(bartlett_chi2.max(0.0));

    Some(Adequacy {
        kmo_overall,
        kmo_per_variable,
        bartlett_chi2,
        bartlett_df,
        bartlett_p,
    })
}
