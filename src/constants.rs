//! Numerical compatibility constants.
//!
//! Every flooring/clamping threshold used by the extraction and rotation
//! paths lives here. These values match the reference statistical packages
//! and are not caller-tunable; changing one changes results.

/// Floor applied to near-zero eigenvalues before they are used as a
/// square-root radicand in the principal-components path, and to scaled
/// eigenvalues before logarithms in the maximum-likelihood objective.
pub const EIGENVALUE_FLOOR: f64 = 100.0 * f64::EPSILON;

/// Lower bound kept on finalized uniquenesses.
pub const UNIQUENESS_FLOOR: f64 = 1e-9;

/// Rotation convergence tolerance on the Frobenius norm of the projected
/// gradient.
pub const ROTATION_EPS: f64 = 1e-5;

/// Rotation outer-iteration budget.
pub const ROTATION_MAX_ITER: usize = 1000;

/// Lower bound on uniquenesses during MINRES and ML optimization.
pub const PSI_LOWER: f64 = 0.005;

/// Upper bound on uniquenesses during ML optimization.
pub const ML_PSI_UPPER: f64 = 0.995;

/// Largest per-coordinate uniqueness update allowed in one ML descent step.
pub const ML_STEP_CAP: f64 = 0.1;

/// Tolerated drift of a computed correlation diagonal away from 1 before the
/// diagonal is rewritten in place.
pub const DIAGONAL_DRIFT_TOL: f64 = 1e-8;

/// Excess over the variable's total variance before a communality counts as
/// a Heywood case (smaller excesses are silently clamped as round-off).
pub const HEYWOOD_TOL: f64 = 1e-8;

/// Standard deviations at or below this magnitude are treated as zero and
/// replaced by 1.0 when standardizing columns.
pub const SCALE_SANITIZATION_THRESHOLD: f64 = 1e-9;

/// Default iteration cap for the iterative extraction methods.
pub const DEFAULT_MAX_ITER: usize = 100;

/// Default convergence tolerance for the iterative extraction methods.
pub const DEFAULT_TOL: f64 = 1e-6;
