//! Gradient-projection factor rotation.
//!
//! One optimizer serves every criterion: the objective and its gradient with
//! respect to the rotated loadings are pluggable per criterion, and the
//! constraint manifold (orthonormal transform vs. unit-norm columns) decides
//! the tangent projection and the per-trial re-normalization. Non-convergence
//! is soft: the best transform found is returned with `converged = false`.

use crate::error::FaError;
use ndarray::{Array1, Array2, Axis};
use ndarray_linalg::{Inverse, QR};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::Normal;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Rotation criterion: the objective/gradient pair driving the search.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Criterion {
    /// Orthomax with γ = 1.
    Varimax,
    /// Orthomax with γ = 0.
    Quartimax,
    /// Orthomax family with an explicit weight.
    Orthomax { gamma: f64 },
    /// Oblique oblimin family with weight γ.
    Oblimin { gamma: f64 },
    /// Oblimin with γ = 0.
    Quartimin,
    /// Oblique geomin with smoothing offset δ.
    Geomin { delta: f64 },
}

impl Criterion {
    /// Whether the criterion rotates on the oblique (correlated-factor)
    /// manifold.
    pub fn is_oblique(&self) -> bool {
        matches!(
            self,
            Criterion::Oblimin { .. } | Criterion::Quartimin | Criterion::Geomin { .. }
        )
    }

    /// Objective value and gradient with respect to the rotated loadings.
    /// Lower objective is better for every criterion.
    pub fn objective_and_gradient(&self, loadings: &Array2<f64>) -> (f64, Array2<f64>) {
        match *self {
            Criterion::Varimax => orthomax(loadings, 1.0),
            Criterion::Quartimax => orthomax(loadings, 0.0),
            Criterion::Orthomax { gamma } => orthomax(loadings, gamma),
            Criterion::Oblimin { gamma } => oblimin(loadings, gamma),
            Criterion::Quartimin => oblimin(loadings, 0.0),
            Criterion::Geomin { delta } => geomin(loadings, delta),
        }
    }
}

/// Orthomax family: the fourth-power concentration of each column, centered
/// by γ times the column mean of squared loadings.
fn orthomax(loadings: &Array2<f64>, gamma: f64) -> (f64, Array2<f64>) {
    let p = loadings.nrows() as f64;
    let l2 = loadings.mapv(|v| v * v);
    let col_mean = l2.sum_axis(Axis(0)) / p;
    let mut centered = l2.clone();
    for j in 0..centered.ncols() {
        let cm = gamma * col_mean[j];
        centered.column_mut(j).mapv_inplace(|v| v - cm);
    }
    let f = -(&l2 * &centered).sum() / 4.0;
    let gq = -(loadings * &centered);
    (f, gq)
}

/// Oblimin family: cross-factor products of squared loadings, row-centered
/// by γ/p when γ ≠ 0. γ = 0 is quartimin.
fn oblimin(loadings: &Array2<f64>, gamma: f64) -> (f64, Array2<f64>) {
    let p = loadings.nrows() as f64;
    let l2 = loadings.mapv(|v| v * v);
    let row_sum = l2.sum_axis(Axis(1));
    let mut cross = Array2::from_shape_fn(loadings.raw_dim(), |(i, j)| row_sum[i] - l2[[i, j]]);
    if gamma != 0.0 {
        let col_mean = cross.sum_axis(Axis(0)) / p;
        for j in 0..cross.ncols() {
            let cm = gamma * col_mean[j];
            cross.column_mut(j).mapv_inplace(|v| v - cm);
        }
    }
    let f = (&l2 * &cross).sum() / 4.0;
    let gq = loadings * &cross;
    (f, gq)
}

/// Geomin: sum of row geometric means of squared loadings, smoothed by δ.
fn geomin(loadings: &Array2<f64>, delta: f64) -> (f64, Array2<f64>) {
    let k = loadings.ncols() as f64;
    let l2 = loadings.mapv(|v| v * v + delta);
    let pro: Array1<f64> = l2.map_axis(Axis(1), |row| {
        (row.iter().map(|v| v.ln()).sum::<f64>() / k).exp()
    });
    let f = pro.sum();
    let gq = Array2::from_shape_fn(loadings.raw_dim(), |(i, j)| {
        (2.0 / k) * (loadings[[i, j]] / l2[[i, j]]) * pro[i]
    });
    (f, gq)
}

/// Result of a rotation search.
#[derive(Debug, Clone)]
pub struct Rotation {
    /// Rotated (pattern) loadings, p×m.
    pub loadings: Array2<f64>,
    /// Transformation matrix T, m×m.
    pub transform: Array2<f64>,
    /// Factor correlations Φ = TᵀT; present only for oblique criteria.
    pub phi: Option<Array2<f64>>,
    /// Final criterion value.
    pub objective: f64,
    /// Whether the projected gradient dropped below tolerance.
    pub converged: bool,
    /// Outer iterations performed.
    pub iterations: usize,
}

/// Rotates `unrotated` loadings under `criterion`.
///
/// `restarts` additional random-orthonormal starting transforms are searched
/// besides the identity start; the lowest-objective result wins. Restarts are
/// deterministically seeded from `seed` and evaluated in parallel.
///
/// Rotation of a single-factor solution is undefined and rejected.
pub fn rotate(
    unrotated: &Array2<f64>,
    criterion: Criterion,
    eps: f64,
    max_iter: usize,
    restarts: usize,
    seed: Option<u64>,
) -> Result<Rotation, FaError> {
    let m = unrotated.ncols();
    if m < 2 {
        return Err(FaError::RotationUndefined);
    }
    if unrotated.nrows() == 0 {
        return Err(FaError::EmptyInput);
    }

    let mut starts: Vec<Array2<f64>> = vec![Array2::eye(m)];
    if restarts > 0 {
        let base_seed = seed.unwrap_or_else(|| rand::thread_rng().gen());
        for r in 0..restarts {
            starts.push(random_orthonormal(m, base_seed.wrapping_add(r as u64 + 1))?);
        }
    }

    let run = |t0: Array2<f64>| -> Result<Rotation, FaError> {
        if criterion.is_oblique() {
            gpa_oblique(unrotated, t0, &criterion, eps, max_iter)
        } else {
            gpa_orthogonal(unrotated, t0, &criterion, eps, max_iter)
        }
    };
    let runs: Vec<Result<Rotation, FaError>> = if starts.len() > 1 {
        starts.into_par_iter().map(run).collect()
    } else {
        starts.into_iter().map(run).collect()
    };

    let mut best: Option<Rotation> = None;
    let mut first_err: Option<FaError> = None;
    for outcome in runs {
        match outcome {
            Ok(rot) => {
                let better = best
                    .as_ref()
                    .map_or(true, |b| rot.objective < b.objective);
                if better {
                    best = Some(rot);
                }
            }
            Err(e) => {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
    }
    best.ok_or_else(|| first_err.unwrap_or(FaError::Singular { stage: "rotation" }))
}

/// Random orthonormal m×m matrix: QR of a seeded Gaussian draw.
fn random_orthonormal(m: usize, seed: u64) -> Result<Array2<f64>, FaError> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).expect("unit normal is well-formed");
    let gauss = Array2::from_shape_fn((m, m), |_| rng.sample(normal));
    let (q, _r) = gauss.qr().map_err(|e| FaError::Backend {
        stage: "rotation start",
        source: e,
    })?;
    Ok(q)
}

fn frobenius(matrix: &Array2<f64>) -> f64 {
    matrix.iter().map(|v| v * v).sum::<f64>().sqrt()
}

/// Gradient projection on the orthogonal manifold (TᵀT = I). Candidate
/// transforms are re-orthogonalized with a QR factorization each trial.
fn gpa_orthogonal(
    a: &Array2<f64>,
    t0: Array2<f64>,
    criterion: &Criterion,
    eps: f64,
    max_iter: usize,
) -> Result<Rotation, FaError> {
    let mut t = t0;
    let mut loadings = a.dot(&t);
    let (mut f, mut gq) = criterion.objective_and_gradient(&loadings);
    let mut g = a.t().dot(&gq);
    let mut alpha = 1.0;
    let mut converged = false;
    let mut iterations = 0;
    for iter in 1..=max_iter {
        // Tangent projection: remove T times the symmetric part of TᵀG.
        let tg = t.t().dot(&g);
        let sym = (&tg + &tg.t()) * 0.5;
        let gp = &g - &t.dot(&sym);
        let s = frobenius(&gp);
        if s < eps {
            converged = true;
            break;
        }
        iterations = iter;
        alpha *= 2.0;
        let mut cand_t = t.clone();
        let mut cand_l = loadings.clone();
        let mut cand_f = f;
        let mut cand_gq = gq.clone();
        for trial in 0..11 {
            let x = &t - &(&gp * alpha);
            let (q, _r) = x.qr().map_err(|e| FaError::Backend {
                stage: "rotation",
                source: e,
            })?;
            let l = a.dot(&q);
            let (ft, gqt) = criterion.objective_and_gradient(&l);
            cand_t = q;
            cand_l = l;
            cand_f = ft;
            cand_gq = gqt;
            if ft < f - 0.5 * s * s * alpha {
                break;
            }
            if trial < 10 {
                alpha *= 0.5;
            }
        }
        t = cand_t;
        loadings = cand_l;
        f = cand_f;
        gq = cand_gq;
        g = a.t().dot(&gq);
    }
    if !converged {
        log::debug!("orthogonal rotation hit the {iterations}-iteration budget");
    }
    Ok(Rotation {
        loadings,
        transform: t,
        phi: None,
        objective: f,
        converged,
        iterations,
    })
}

/// Gradient projection on the oblique manifold (unit-norm columns of T, no
/// orthogonality). Pattern loadings are A·(Tᵀ)⁻¹ and Φ = TᵀT.
fn gpa_oblique(
    a: &Array2<f64>,
    t0: Array2<f64>,
    criterion: &Criterion,
    eps: f64,
    max_iter: usize,
) -> Result<Rotation, FaError> {
    let mut t = t0;
    let mut t_inv = t
        .inv()
        .map_err(|_| FaError::Singular { stage: "rotation" })?;
    let mut loadings = a.dot(&t_inv.t());
    let (mut f, mut gq) = criterion.objective_and_gradient(&loadings);
    let mut g = -(loadings.t().dot(&gq).dot(&t_inv)).reversed_axes();
    let mut alpha = 1.0;
    let mut converged = false;
    let mut iterations = 0;
    for iter in 1..=max_iter {
        // Tangent projection: strip each column's radial component.
        let tg = t.t().dot(&g);
        let gp = &g - &t.dot(&Array2::from_diag(&tg.diag().to_owned()));
        let s = frobenius(&gp);
        if s < eps {
            converged = true;
            break;
        }
        iterations = iter;
        alpha *= 2.0;
        let mut candidate: Option<(Array2<f64>, Array2<f64>, Array2<f64>, f64, Array2<f64>)> =
            None;
        for trial in 0..11 {
            let mut x = &t - &(&gp * alpha);
            for mut col in x.columns_mut() {
                let norm = col.iter().map(|v| v * v).sum::<f64>().sqrt();
                if norm > 0.0 {
                    col.mapv_inplace(|v| v / norm);
                }
            }
            let x_inv = match x.inv() {
                Ok(inv) => inv,
                Err(_) => {
                    // Degenerate candidate; shrink the step and retry.
                    alpha *= 0.5;
                    continue;
                }
            };
            let l = a.dot(&x_inv.t());
            let (ft, gqt) = criterion.objective_and_gradient(&l);
            let sufficient = ft < f - 0.5 * s * s * alpha;
            candidate = Some((x, x_inv, l, ft, gqt));
            if sufficient {
                break;
            }
            if trial < 10 {
                alpha *= 0.5;
            }
        }
        let Some((x, x_inv, l, ft, gqt)) = candidate else {
            // Every trial collapsed to a singular transform.
            break;
        };
        t = x;
        t_inv = x_inv;
        loadings = l;
        f = ft;
        gq = gqt;
        g = -(loadings.t().dot(&gq).dot(&t_inv)).reversed_axes();
    }
    if !converged {
        log::debug!("oblique rotation hit the {iterations}-iteration budget");
    }
    let phi = t.t().dot(&t);
    Ok(Rotation {
        loadings,
        transform: t,
        phi: Some(phi),
        objective: f,
        converged,
        iterations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    /// A clean two-block loading pattern rotated 45° away from simple
    /// structure, so the rotation has real work to do.
    fn entangled_loadings() -> Array2<f64> {
        let simple = array![
            [0.8, 0.0],
            [0.75, 0.1],
            [0.85, 0.05],
            [0.0, 0.8],
            [0.1, 0.75],
            [0.05, 0.85]
        ];
        let c = std::f64::consts::FRAC_1_SQRT_2;
        let mix = array![[c, -c], [c, c]];
        simple.dot(&mix)
    }

    #[test]
    fn varimax_recovers_simple_structure() {
        let a = entangled_loadings();
        let rot = rotate(&a, Criterion::Varimax, 1e-5, 1000, 0, None).unwrap();
        assert!(rot.converged);
        // Each variable loads mostly on one factor.
        for i in 0..6 {
            let big = rot.loadings.row(i).iter().fold(0.0f64, |m, v| m.max(v.abs()));
            let small = rot.loadings.row(i).iter().fold(f64::MAX, |m, v| m.min(v.abs()));
            assert!(big > 0.6, "row {i}");
            assert!(small < 0.2, "row {i}");
        }
    }

    #[test]
    fn orthogonal_transform_is_orthonormal() {
        let a = entangled_loadings();
        let rot = rotate(&a, Criterion::Quartimax, 1e-5, 1000, 0, None).unwrap();
        let tt = rot.transform.t().dot(&rot.transform);
        for i in 0..2 {
            for j in 0..2 {
                let expect = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(tt[[i, j]], expect, epsilon = 1e-6);
            }
        }
        assert!(rot.phi.is_none());
    }

    #[test]
    fn rotating_a_rotated_solution_is_stable() {
        let a = entangled_loadings();
        let first = rotate(&a, Criterion::Varimax, 1e-5, 1000, 0, None).unwrap();
        let second = rotate(&first.loadings, Criterion::Varimax, 1e-5, 1000, 0, None).unwrap();
        assert!(second.converged);
        for (x, y) in first.loadings.iter().zip(second.loadings.iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-4);
        }
    }

    #[test]
    fn quartimin_produces_phi_consistent_with_transform() {
        let a = entangled_loadings();
        let rot = rotate(&a, Criterion::Quartimin, 1e-5, 1000, 0, None).unwrap();
        let phi = rot.phi.as_ref().unwrap();
        let expected = rot.transform.t().dot(&rot.transform);
        for (x, y) in phi.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-10);
        }
        // Unit self-correlations.
        for j in 0..2 {
            assert_abs_diff_eq!(phi[[j, j]], 1.0, epsilon = 1e-8);
        }
    }

    #[test]
    fn single_factor_rotation_is_rejected() {
        let a = array![[0.8], [0.7], [0.6]];
        assert!(matches!(
            rotate(&a, Criterion::Varimax, 1e-5, 1000, 0, None),
            Err(FaError::RotationUndefined)
        ));
    }

    #[test]
    fn restarts_do_not_worsen_the_objective() {
        let a = entangled_loadings();
        let plain = rotate(&a, Criterion::Varimax, 1e-5, 1000, 0, Some(11)).unwrap();
        let multi = rotate(&a, Criterion::Varimax, 1e-5, 1000, 4, Some(11)).unwrap();
        assert!(multi.objective <= plain.objective + 1e-10);
    }

    #[test]
    fn geomin_runs_and_returns_phi() {
        let a = entangled_loadings();
        let rot = rotate(&a, Criterion::Geomin { delta: 0.01 }, 1e-5, 1000, 0, None).unwrap();
        assert!(rot.phi.is_some());
        assert!(rot.loadings.iter().all(|v| v.is_finite()));
    }
}
