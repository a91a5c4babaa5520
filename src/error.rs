//! Error and warning taxonomy.
//!
//! Invalid input aborts with a typed error. Numerical degeneracy is surfaced
//! as a stage-tagged error by the component that hit it; the orchestration
//! layer decides whether to abort or to downgrade to a partial result.
//! Non-convergence is never an error: it is reported through convergence
//! flags and [`FaWarning`]s on the result.

use ndarray_linalg::error::LinalgError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Typed, stage-specific failures.
#[derive(Debug, Error)]
pub enum FaError {
    /// The input table has zero rows or zero columns.
    #[error("input table has zero observations or zero variables")]
    EmptyInput,

    /// Fewer than two observations were supplied.
    #[error("at least 2 observations are required, got {0}")]
    TooFewObservations(usize),

    /// The input contains NaN or infinite values.
    #[error("input contains non-finite values; remove missing data upstream")]
    NonFiniteInput,

    /// Mismatched dimensions between related inputs.
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// A factor count of zero was requested.
    #[error("requested factor count must be at least 1")]
    ZeroFactors,

    /// More factors were requested than the data can support.
    #[error("requested {requested} factors but at most {max} are available")]
    TooManyFactors { requested: usize, max: usize },

    /// A linear-algebra primitive (eigendecomposition, QR) failed.
    #[error("linear-algebra backend failure during {stage}: {source}")]
    Backend {
        stage: &'static str,
        #[source]
        source: LinalgError,
    },

    /// A matrix that must be invertible was singular.
    #[error("singular matrix encountered during {stage}")]
    Singular { stage: &'static str },

    /// Rotation was requested for a single-factor solution.
    #[error("rotation is undefined for a single-factor solution")]
    RotationUndefined,

    /// A persisted or assembled model failed validation.
    #[error("invalid factor model: {0}")]
    ModelInvalid(String),

    /// Reading or writing a persisted model failed.
    #[error("model i/o failed: {0}")]
    ModelIo(String),
}

/// Non-fatal conditions attached to an otherwise usable result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FaWarning {
    /// The inverse-correlation SMC estimate was unusable; initial
    /// communalities fell back to the squared maximum absolute correlation.
    SmcFallback,
    /// The eigenvalue criterion selected zero factors; one was retained.
    KaiserPromoted { threshold: f64 },
    /// A communality exceeded the variable's total variance and was clamped.
    HeywoodCase { variable: usize },
    /// Extraction stopped at its iteration cap without meeting tolerance.
    ExtractionNotConverged { iterations: usize },
    /// Rotation stopped at its iteration budget; the best transform found
    /// was kept.
    RotationNotConverged { iterations: usize },
    /// Rotation was requested but skipped for a single-factor solution.
    RotationSkipped,
    /// Rotation failed; the unrotated solution was kept.
    RotationFailed { reason: String },
    /// Factor scores were requested but could not be computed.
    ScoringSkipped { reason: String },
    /// Sampling-adequacy diagnostics were omitted (singular or degenerate
    /// correlation matrix).
    AdequacyOmitted,
}

impl fmt::Display for FaWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaWarning::SmcFallback => write!(
                f,
                "initial communalities fell back to squared maximum correlations"
            ),
            FaWarning::KaiserPromoted { threshold } => write!(
                f,
                "no eigenvalue exceeded {threshold}; retaining a single factor"
            ),
            FaWarning::HeywoodCase { variable } => {
                write!(f, "Heywood case: communality clamped for variable {variable}")
            }
            FaWarning::ExtractionNotConverged { iterations } => {
                write!(f, "extraction did not converge within {iterations} iterations")
            }
            FaWarning::RotationNotConverged { iterations } => {
                write!(f, "rotation did not converge within {iterations} iterations")
            }
            FaWarning::RotationSkipped => {
                write!(f, "rotation skipped: single-factor solution")
            }
            FaWarning::RotationFailed { reason } => {
                write!(f, "rotation failed, unrotated solution kept: {reason}")
            }
            FaWarning::ScoringSkipped { reason } => {
                write!(f, "factor scores skipped: {reason}")
            }
            FaWarning::AdequacyOmitted => {
                write!(f, "sampling-adequacy diagnostics omitted")
            }
        }
    }
}
