//! Factor extraction: principal components, principal-axis, MINRES and
//! maximum likelihood behind one contract.
//!
//! All four strategies take the correlation matrix and a factor count and
//! produce an unrotated p×m loadings matrix with communalities bounded by
//! each variable's total variance. PCA is a single eigendecomposition; the
//! other three iterate and stop softly at their iteration cap with
//! `converged = false`.

use crate::constants::{EIGENVALUE_FLOOR, HEYWOOD_TOL, ML_PSI_UPPER, ML_STEP_CAP, PSI_LOWER};
use crate::error::FaError;
use ndarray::{Array1, Array2};
use ndarray_linalg::{Eigh, UPLO};
use serde::{Deserialize, Serialize};

/// Extraction strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtractionMethod {
    /// Principal components: one eigendecomposition, no common-factor model.
    Pca,
    /// Iterative principal-axis factoring.
    Paf,
    /// Minimum-residual optimization over uniquenesses.
    MinRes,
    /// Maximum-likelihood optimization over uniquenesses.
    Ml,
}

/// Output of one extraction run.
#[derive(Debug, Clone)]
pub struct Extraction {
    /// Unrotated loadings, p×m.
    pub loadings: Array2<f64>,
    /// Row sums of squared loadings, clamped to the variable's variance.
    pub communalities: Array1<f64>,
    /// Whether the iteration met its tolerance before the cap.
    pub converged: bool,
    /// Iterations performed (0 for PCA).
    pub iterations: usize,
    /// Variables whose communalities exceeded total variance and were
    /// clamped.
    pub heywood: Vec<usize>,
}

/// Runs the selected extraction strategy.
///
/// `initial` seeds the iterative methods with communality estimates
/// (typically SMC); PCA ignores it.
pub fn extract(
    method: ExtractionMethod,
    corr: &Array2<f64>,
    n_factors: usize,
    initial: &Array1<f64>,
    max_iter: usize,
    tol: f64,
) -> Result<Extraction, FaError> {
    let p = corr.nrows();
    if n_factors == 0 {
        return Err(FaError::ZeroFactors);
    }
    if n_factors > p {
        return Err(FaError::TooManyFactors {
            requested: n_factors,
            max: p,
        });
    }
    if corr.ncols() != p || initial.len() != p {
        return Err(FaError::DimensionMismatch(format!(
            "correlation is {}x{}, initial communalities have length {}",
            p,
            corr.ncols(),
            initial.len()
        )));
    }
    match method {
        ExtractionMethod::Pca => principal_components(corr, n_factors),
        ExtractionMethod::Paf => principal_axis(corr, n_factors, initial, max_iter, tol),
        ExtractionMethod::MinRes => minres(corr, n_factors, initial, max_iter, tol),
        ExtractionMethod::Ml => maximum_likelihood(corr, n_factors, initial, max_iter, tol),
    }
}

/// Symmetric eigendecomposition with eigenpairs sorted descending.
pub(crate) fn sorted_eigh(
    matrix: &Array2<f64>,
    stage: &'static str,
) -> Result<(Array1<f64>, Array2<f64>), FaError> {
    let (vals, vecs) = matrix
        .eigh(UPLO::Upper)
        .map_err(|e| FaError::Backend { stage, source: e })?;
    let p = vals.len();
    let mut order: Vec<usize> = (0..p).collect();
    order.sort_by(|&a, &b| vals[b].partial_cmp(&vals[a]).unwrap_or(std::cmp::Ordering::Equal));
    let sorted_vals = Array1::from_shape_fn(p, |i| vals[order[i]]);
    let mut sorted_vecs = Array2::zeros((p, p));
    for (new, &old) in order.iter().enumerate() {
        sorted_vecs.column_mut(new).assign(&vecs.column(old));
    }
    Ok((sorted_vals, sorted_vecs))
}

/// Builds p×m loadings from the top-m eigenpairs, flooring each radicand at
/// `floor` before the square root.
fn loadings_from_top(
    vals: &Array1<f64>,
    vecs: &Array2<f64>,
    n_factors: usize,
    floor: f64,
) -> Array2<f64> {
    let p = vecs.nrows();
    let mut loadings = Array2::zeros((p, n_factors));
    for j in 0..n_factors {
        let root = vals[j].max(floor).sqrt();
        for i in 0..p {
            loadings[[i, j]] = vecs[[i, j]] * root;
        }
    }
    loadings
}

/// Clamps rows whose squared sums exceed the (unit) variable variance and
/// reports the communalities. Overshoots past `HEYWOOD_TOL` are flagged.
fn finalize_loadings(loadings: &mut Array2<f64>) -> (Array1<f64>, Vec<usize>) {
    let p = loadings.nrows();
    let mut communalities = Array1::zeros(p);
    let mut heywood = Vec::new();
    for i in 0..p {
        let ss: f64 = loadings.row(i).iter().map(|v| v * v).sum();
        if ss > 1.0 {
            if ss > 1.0 + HEYWOOD_TOL {
                heywood.push(i);
            }
            let shrink = (1.0 / ss).sqrt();
            loadings.row_mut(i).mapv_inplace(|v| v * shrink);
            communalities[i] = 1.0;
        } else {
            communalities[i] = ss;
        }
    }
    (communalities, heywood)
}

fn principal_components(corr: &Array2<f64>, n_factors: usize) -> Result<Extraction, FaError> {
    let (vals, vecs) = sorted_eigh(corr, "principal components")?;
    let mut loadings = loadings_from_top(&vals, &vecs, n_factors, EIGENVALUE_FLOOR);
    let (communalities, heywood) = finalize_loadings(&mut loadings);
    Ok(Extraction {
        loadings,
        communalities,
        converged: true,
        iterations: 0,
        heywood,
    })
}

fn principal_axis(
    corr: &Array2<f64>,
    n_factors: usize,
    initial: &Array1<f64>,
    max_iter: usize,
    tol: f64,
) -> Result<Extraction, FaError> {
    let p = corr.nrows();
    let mut h = initial.mapv(|v| v.clamp(0.0, 1.0));
    let budget = max_iter.max(1);
    let mut loadings = Array2::zeros((p, n_factors));
    let mut converged = false;
    let mut iterations = 0;
    for iter in 1..=budget {
        let mut reduced = corr.clone();
        for i in 0..p {
            reduced[[i, i]] = h[i];
        }
        let (vals, vecs) = sorted_eigh(&reduced, "principal axis")?;
        // Negative eigenvalues of the reduced matrix contribute nothing.
        loadings = loadings_from_top(&vals, &vecs, n_factors, 0.0);
        let mut delta = 0.0f64;
        for i in 0..p {
            let hi: f64 = loadings
                .row(i)
                .iter()
                .map(|v| v * v)
                .sum::<f64>()
                .min(1.0);
            delta = delta.max((hi - h[i]).abs());
            h[i] = hi;
        }
        iterations = iter;
        if delta < tol {
            converged = true;
            break;
        }
    }
    if !converged {
        log::debug!("principal-axis stopped at the {iterations}-iteration cap");
    }
    let (communalities, heywood) = finalize_loadings(&mut loadings);
    Ok(Extraction {
        loadings,
        communalities,
        converged,
        iterations,
        heywood,
    })
}

/// Residual objective for MINRES at a given uniqueness vector: sum of squared
/// off-diagonal residuals between the correlation matrix and the fitted
/// common part ΛΛᵀ.
fn minres_objective(
    corr: &Array2<f64>,
    psi: &Array1<f64>,
    n_factors: usize,
) -> Result<(f64, Array2<f64>, Array1<f64>), FaError> {
    let p = corr.nrows();
    let mut reduced = corr.clone();
    for i in 0..p {
        reduced[[i, i]] -= psi[i];
    }
    let (vals, vecs) = sorted_eigh(&reduced, "minres")?;
    let loadings = loadings_from_top(&vals, &vecs, n_factors, 0.0);
    let model = loadings.dot(&loadings.t());
    let mut f = 0.0;
    for i in 1..p {
        for j in 0..i {
            let r = corr[[i, j]] - model[[i, j]];
            f += r * r;
        }
    }
    Ok((f, loadings, model.diag().to_owned()))
}

fn minres(
    corr: &Array2<f64>,
    n_factors: usize,
    initial: &Array1<f64>,
    max_iter: usize,
    tol: f64,
) -> Result<Extraction, FaError> {
    let p = corr.nrows();
    let upper = initial
        .iter()
        .cloned()
        .fold(f64::NEG_INFINITY, f64::max)
        .max(1.0);
    let mut psi = initial.mapv(|h| (1.0 - h).clamp(PSI_LOWER, upper));
    let budget = max_iter.max(1);
    let (mut f, mut loadings, mut model_diag) = minres_objective(corr, &psi, n_factors)?;
    let mut converged = false;
    let mut iterations = 0;
    let mut alpha: f64 = 1.0;
    for iter in 1..=budget {
        // d/dψᵢ of the residual sum: diagonal of (ΛΛᵀ + diag(ψ) − Σ).
        let grad = Array1::from_shape_fn(p, |i| model_diag[i] + psi[i] - corr[[i, i]]);
        let grad_max = grad.iter().fold(0.0f64, |a, g| a.max(g.abs()));
        if grad_max < tol {
            converged = true;
            break;
        }
        alpha = (alpha * 2.0).min(1e3);
        let mut accepted = false;
        let mut next_psi = psi.clone();
        for _ in 0..20 {
            let cand =
                Array1::from_shape_fn(p, |i| (psi[i] - alpha * grad[i]).clamp(PSI_LOWER, upper));
            let (fc, lc, mc) = minres_objective(corr, &cand, n_factors)?;
            if fc < f {
                next_psi = cand;
                f = fc;
                loadings = lc;
                model_diag = mc;
                accepted = true;
                break;
            }
            alpha *= 0.5;
        }
        iterations = iter;
        if !accepted {
            // No descent direction left within step precision.
            converged = true;
            break;
        }
        let delta = next_psi
            .iter()
            .zip(psi.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f64, f64::max);
        psi = next_psi;
        if delta < tol {
            converged = true;
            break;
        }
    }
    if !converged {
        log::debug!("minres stopped at the {iterations}-iteration cap, objective {f:.6e}");
    }
    let (_, final_loadings, _) = minres_objective(corr, &psi, n_factors)?;
    loadings = final_loadings;
    let (communalities, heywood) = finalize_loadings(&mut loadings);
    Ok(Extraction {
        loadings,
        communalities,
        converged,
        iterations,
        heywood,
    })
}

/// Likelihood-ratio discrepancy for ML at a given uniqueness vector, from
/// the eigenvalues of diag(ψ)^{-1/2}·Σ·diag(ψ)^{-1/2}: the (ln e − e) sum
/// over all eigenvalues minus the same sum over the retained ones, negated
/// and offset by the non-retained count. Equals Σ (e − ln e − 1) over the
/// non-retained eigenvalues, which is zero at a perfect fit.
fn ml_objective(
    corr: &Array2<f64>,
    psi: &Array1<f64>,
    n_factors: usize,
) -> Result<(f64, Array1<f64>, Array2<f64>), FaError> {
    let p = corr.nrows();
    let scale = psi.mapv(|v| 1.0 / v.sqrt());
    let mut scaled = corr.clone();
    for i in 0..p {
        for j in 0..p {
            scaled[[i, j]] *= scale[i] * scale[j];
        }
    }
    let (vals, vecs) = sorted_eigh(&scaled, "maximum likelihood")?;
    let mut total = 0.0;
    let mut retained = 0.0;
    for (i, &v) in vals.iter().enumerate() {
        let e = v.max(EIGENVALUE_FLOOR);
        let term = e.ln() - e;
        total += term;
        if i < n_factors {
            retained += term;
        }
    }
    let f = -(total - retained) - (p - n_factors) as f64;
    Ok((f, vals, vecs))
}

/// Analytic gradient of the ML discrepancy with respect to ψ:
/// gⱼ = −(1/ψⱼ)·Σ over non-retained eigenpairs of (eᵢ − 1)·v²ⱼᵢ.
fn ml_gradient(
    psi: &Array1<f64>,
    vals: &Array1<f64>,
    vecs: &Array2<f64>,
    n_factors: usize,
) -> Array1<f64> {
    let p = psi.len();
    Array1::from_shape_fn(p, |j| {
        let mut acc = 0.0;
        for i in n_factors..p {
            let e = vals[i].max(EIGENVALUE_FLOOR);
            let v = vecs[[j, i]];
            acc += (e - 1.0) * v * v;
        }
        -acc / psi[j]
    })
}

fn maximum_likelihood(
    corr: &Array2<f64>,
    n_factors: usize,
    initial: &Array1<f64>,
    max_iter: usize,
    tol: f64,
) -> Result<Extraction, FaError> {
    let p = corr.nrows();
    let mut psi = initial.mapv(|h| (1.0 - h).clamp(PSI_LOWER, ML_PSI_UPPER));
    let budget = max_iter.max(1);
    let (mut f, mut vals, mut vecs) = ml_objective(corr, &psi, n_factors)?;
    let mut converged = false;
    let mut iterations = 0;
    let mut alpha: f64 = 1.0;
    for iter in 1..=budget {
        let grad = ml_gradient(&psi, &vals, &vecs, n_factors);
        let grad_max = grad.iter().fold(0.0f64, |a, g| a.max(g.abs()));
        if grad_max < tol {
            converged = true;
            break;
        }
        alpha = (alpha * 2.0).min(1e3);
        let mut accepted = false;
        let mut next_psi = psi.clone();
        for _ in 0..20 {
            let cand = Array1::from_shape_fn(p, |i| {
                let step = (alpha * grad[i]).clamp(-ML_STEP_CAP, ML_STEP_CAP);
                (psi[i] - step).clamp(PSI_LOWER, ML_PSI_UPPER)
            });
            let (fc, vc, ec) = ml_objective(corr, &cand, n_factors)?;
            if fc < f {
                next_psi = cand;
                f = fc;
                vals = vc;
                vecs = ec;
                accepted = true;
                break;
            }
            alpha *= 0.5;
        }
        iterations = iter;
        if !accepted {
            converged = true;
            break;
        }
        let delta = next_psi
            .iter()
            .zip(psi.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f64, f64::max);
        psi = next_psi;
        if delta < tol {
            converged = true;
            break;
        }
    }
    if !converged {
        log::debug!("ml stopped at the {iterations}-iteration cap, discrepancy {f:.6e}");
    }
    // Λ = diag(√ψ)·V·diag(√max(e − 1, 0)); the −1 offset is the ML
    // normalization on the ψ-scaled metric.
    let mut loadings = Array2::zeros((p, n_factors));
    for j in 0..n_factors {
        let root = (vals[j].max(EIGENVALUE_FLOOR) - 1.0).max(0.0).sqrt();
        for i in 0..p {
            loadings[[i, j]] = psi[i].sqrt() * vecs[[i, j]] * root;
        }
    }
    let (communalities, heywood) = finalize_loadings(&mut loadings);
    Ok(Extraction {
        loadings,
        communalities,
        converged,
        iterations,
        heywood,
    })
}
