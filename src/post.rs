//! Post-processing of a factor solution: sign standardization, explained-
//! variance ordering, and communality/uniqueness finalization.

use crate::constants::{HEYWOOD_TOL, UNIQUENESS_FLOOR};
use ndarray::{Array1, Array2, Axis};

/// Standardizes factor signs in place: each factor's largest-magnitude
/// loading ends positive; when positive and negative peaks tie, the column
/// sum must be non-negative. Reflections propagate into the transform's
/// columns and Φ's rows and columns. Idempotent.
pub fn standardize_signs(
    loadings: &mut Array2<f64>,
    mut transform: Option<&mut Array2<f64>>,
    mut phi: Option<&mut Array2<f64>>,
) -> Vec<usize> {
    let m = loadings.ncols();
    let mut flipped = Vec::new();
    for j in 0..m {
        let col = loadings.column(j);
        let max_abs = col.iter().fold(0.0f64, |a, v| a.max(v.abs()));
        if max_abs == 0.0 {
            continue;
        }
        let tie_tol = max_abs * 1e-12;
        let mut positive_peak = false;
        let mut negative_peak = false;
        for &v in col.iter() {
            if (v.abs() - max_abs).abs() <= tie_tol {
                if v > 0.0 {
                    positive_peak = true;
                } else {
                    negative_peak = true;
                }
            }
        }
        let flip = if positive_peak && negative_peak {
            col.sum() < 0.0
        } else {
            negative_peak
        };
        if flip {
            loadings.column_mut(j).mapv_inplace(|v| -v);
            if let Some(t) = transform.as_deref_mut() {
                t.column_mut(j).mapv_inplace(|v| -v);
            }
            if let Some(ph) = phi.as_deref_mut() {
                ph.column_mut(j).mapv_inplace(|v| -v);
                ph.row_mut(j).mapv_inplace(|v| -v);
            }
            flipped.push(j);
        }
    }
    flipped
}

/// Variance attributed to each factor: sum of squared loadings per column,
/// or the Φ-weighted quadratic form diag(ΛᵀΛΦ) for correlated factors.
pub fn factor_variances(loadings: &Array2<f64>, phi: Option<&Array2<f64>>) -> Array1<f64> {
    match phi {
        None => loadings.map_axis(Axis(0), |col| col.iter().map(|v| v * v).sum()),
        Some(ph) => {
            let ltl = loadings.t().dot(loadings);
            ltl.dot(ph).diag().to_owned()
        }
    }
}

/// Reorders factors descending by explained variance (stable: ties keep the
/// original column order). The permutation propagates into the transform's
/// columns and Φ's rows and columns; it is also returned.
pub fn reorder_factors(
    loadings: &mut Array2<f64>,
    transform: Option<&mut Array2<f64>>,
    phi: Option<&mut Array2<f64>>,
) -> Vec<usize> {
    let variances = factor_variances(loadings, phi.as_deref());
    let mut order: Vec<usize> = (0..variances.len()).collect();
    order.sort_by(|&a, &b| {
        variances[b]
            .partial_cmp(&variances[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    if order.iter().enumerate().all(|(new, &old)| new == old) {
        return order;
    }

    let permute_columns = |mtx: &Array2<f64>, order: &[usize]| -> Array2<f64> {
        let mut out = Array2::zeros(mtx.raw_dim());
        for (new, &old) in order.iter().enumerate() {
            out.column_mut(new).assign(&mtx.column(old));
        }
        out
    };

    let permuted = permute_columns(loadings, &order);
    *loadings = permuted;
    if let Some(t) = transform {
        let permuted = permute_columns(t, &order);
        *t = permuted;
    }
    if let Some(ph) = phi {
        let cols = permute_columns(ph, &order);
        let mut out = Array2::zeros(cols.raw_dim());
        for (new, &old) in order.iter().enumerate() {
            out.row_mut(new).assign(&cols.row(old));
        }
        *ph = out;
    }
    order
}

/// Structure matrix S = Λ·Φ (pattern itself for orthogonal solutions).
/// Always recomputed, never stored.
pub fn structure_matrix(loadings: &Array2<f64>, phi: Option<&Array2<f64>>) -> Array2<f64> {
    match phi {
        Some(ph) => loadings.dot(ph),
        None => loadings.clone(),
    }
}

/// Finalized communalities and uniquenesses.
#[derive(Debug, Clone)]
pub struct Communality {
    /// Shared variance per variable, clamped to [0, 1].
    pub communality: Array1<f64>,
    /// 1 − communality, floored above zero.
    pub uniqueness: Array1<f64>,
    /// Variables clamped from above the total variance.
    pub heywood: Vec<usize>,
}

/// Computes final communalities as the pattern–structure row products
/// (plain squared loadings for orthogonal solutions) and uniquenesses as
/// their floored complements.
pub fn finalize_communalities(
    loadings: &Array2<f64>,
    phi: Option<&Array2<f64>>,
) -> Communality {
    let p = loadings.nrows();
    let structure = structure_matrix(loadings, phi);
    let mut communality = Array1::zeros(p);
    let mut uniqueness = Array1::zeros(p);
    let mut heywood = Vec::new();
    for i in 0..p {
        let mut h: f64 = loadings
            .row(i)
            .iter()
            .zip(structure.row(i).iter())
            .map(|(a, b)| a * b)
            .sum();
        if h > 1.0 {
            if h > 1.0 + HEYWOOD_TOL {
                heywood.push(i);
            }
            h = 1.0;
        }
        if h < 0.0 {
            h = 0.0;
        }
        communality[i] = h;
        uniqueness[i] = (1.0 - h).max(UNIQUENESS_FLOOR);
    }
    Communality {
        communality,
        uniqueness,
        heywood,
    }
}

/// Proportion of total variance explained by each factor and the running
/// cumulative proportions.
pub fn explained_proportions(
    loadings: &Array2<f64>,
    phi: Option<&Array2<f64>>,
) -> (Array1<f64>, Array1<f64>) {
    let total = loadings.nrows() as f64;
    let proportion = factor_variances(loadings, phi).mapv(|v| v / total);
    let mut cumulative = proportion.clone();
    let mut running = 0.0;
    for c in cumulative.iter_mut() {
        running += *c;
        *c = running;
    }
    (proportion, cumulative)
}
