//! Analysis orchestration: options, the extraction/rotation/scoring
//! pipeline, the assembled result, and fitted-model persistence.

use crate::adequacy::{adequacy, Adequacy};
use crate::constants::{DEFAULT_MAX_ITER, DEFAULT_TOL, ROTATION_EPS, ROTATION_MAX_ITER};
use crate::corr::{correlation_from_data, validate_correlation, validate_table};
use crate::error::{FaError, FaWarning};
use crate::extract::{extract, sorted_eigh, ExtractionMethod};
use crate::post;
use crate::rotate::{rotate, Criterion};
use crate::score::{factor_scores, score_covariance, score_weights, ScoreMethod};
use crate::smc::smc;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// How many factors to retain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FactorCount {
    /// Retain exactly this many factors.
    Fixed(usize),
    /// Retain one factor per correlation eigenvalue above the threshold
    /// (the classic criterion uses 1.0).
    Kaiser { threshold: f64 },
}

/// Rotation request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RotationSpec {
    /// Criterion to optimize.
    pub criterion: Criterion,
    /// Additional random-orthonormal starts beyond the identity start.
    pub restarts: usize,
    /// Seed for the restart draws; random when `None`.
    pub seed: Option<u64>,
}

/// Analysis options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorOptions {
    /// Standardize columns when computing factor scores. The factor model
    /// itself is always fit on the correlation metric.
    pub standardize: bool,
    /// Factor retention rule.
    pub factor_count: FactorCount,
    /// Extraction strategy.
    pub extraction: ExtractionMethod,
    /// Optional rotation of the extracted solution.
    pub rotation: Option<RotationSpec>,
    /// Optional factor-score estimation.
    pub scoring: Option<ScoreMethod>,
    /// Iteration cap for the iterative extraction methods.
    pub max_iter: usize,
    /// Convergence tolerance for the iterative extraction methods.
    pub tolerance: f64,
}

impl Default for FactorOptions {
    fn default() -> Self {
        Self {
            standardize: true,
            factor_count: FactorCount::Kaiser { threshold: 1.0 },
            extraction: ExtractionMethod::MinRes,
            rotation: None,
            scoring: None,
            max_iter: DEFAULT_MAX_ITER,
            tolerance: DEFAULT_TOL,
        }
    }
}

/// Complete output of one analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorResult {
    /// Extraction strategy that produced the solution.
    pub extraction: ExtractionMethod,
    /// Observations behind the correlation matrix.
    pub n_obs: usize,
    /// Number of observed variables.
    pub n_variables: usize,
    /// Number of retained factors.
    pub n_factors: usize,
    /// Final (rotated, or unrotated copy) pattern loadings, p×m.
    pub loadings: Array2<f64>,
    /// Structure matrix Λ·Φ (equals the loadings when factors are
    /// uncorrelated).
    pub structure: Array2<f64>,
    /// Unrotated loadings as extracted.
    pub unrotated: Array2<f64>,
    /// Initial (SMC) communalities.
    pub initial_communalities: Array1<f64>,
    /// Final communalities.
    pub communalities: Array1<f64>,
    /// Final uniquenesses.
    pub uniquenesses: Array1<f64>,
    /// All p eigenvalues of the correlation matrix, descending.
    pub eigenvalues: Array1<f64>,
    /// Rotation transform T when a rotation was applied.
    pub rotation_matrix: Option<Array2<f64>>,
    /// Factor correlations for oblique rotations.
    pub phi: Option<Array2<f64>>,
    /// Proportion of total variance explained per factor.
    pub proportion_variance: Array1<f64>,
    /// Cumulative explained proportions.
    pub cumulative_variance: Array1<f64>,
    /// Whether extraction met its tolerance.
    pub extraction_converged: bool,
    /// Extraction iterations performed.
    pub extraction_iterations: usize,
    /// Rotation convergence, when a rotation ran.
    pub rotation_converged: Option<bool>,
    /// Rotation iterations, when a rotation ran.
    pub rotation_iterations: Option<usize>,
    /// Column means of the source table (absent for matrix input).
    pub means: Option<Array1<f64>>,
    /// Sanitized column standard deviations (absent for matrix input).
    pub std_devs: Option<Array1<f64>>,
    /// Factor scores, n×m, when requested and computable.
    pub scores: Option<Array2<f64>>,
    /// Score-weight matrix, p×m.
    pub score_weights: Option<Array2<f64>>,
    /// Covariance of the estimated scores, m×m.
    pub score_covariance: Option<Array2<f64>>,
    /// Sampling-adequacy diagnostics, when computable.
    pub adequacy: Option<Adequacy>,
    /// Non-fatal conditions encountered along the way.
    pub warnings: Vec<FaWarning>,
}

/// Fits a factor model to an observations-by-variables table.
pub fn fit(data: ArrayView2<f64>, options: &FactorOptions) -> Result<FactorResult, FaError> {
    validate_table(&data)?;
    let ci = correlation_from_data(&data)?;
    if ci.diagonal_corrected {
        log::debug!("correlation diagonal drifted past tolerance and was rewritten");
    }
    let mut result = fit_matrix(&ci.matrix, ci.n_obs, options)?;

    if let Some(method) = options.scoring {
        match score_weights(
            method,
            &ci.matrix,
            &result.loadings,
            result.phi.as_ref(),
            &result.uniquenesses,
        ) {
            Ok(weights) => {
                let mut z = data.to_owned();
                z -= &ci.means;
                if options.standardize {
                    z /= &ci.std_devs;
                }
                result.scores = Some(factor_scores(&z, &weights));
                result.score_covariance = Some(score_covariance(&ci.matrix, &weights));
                result.score_weights = Some(weights);
            }
            Err(e) => {
                log::warn!("factor scoring failed: {e}");
                result.warnings.push(FaWarning::ScoringSkipped {
                    reason: e.to_string(),
                });
            }
        }
    }

    result.means = Some(ci.means);
    result.std_devs = Some(ci.std_devs);
    Ok(result)
}

/// Fits a factor model directly to a correlation matrix.
///
/// Factor scores cannot be computed without the observation-level table; a
/// scoring request is downgraded to a warning.
pub fn fit_correlation(
    mut corr: Array2<f64>,
    n_obs: usize,
    options: &FactorOptions,
) -> Result<FactorResult, FaError> {
    if n_obs < 2 {
        return Err(FaError::TooFewObservations(n_obs));
    }
    validate_correlation(&mut corr)?;
    let mut result = fit_matrix(&corr, n_obs, options)?;
    if options.scoring.is_some() {
        result.warnings.push(FaWarning::ScoringSkipped {
            reason: "factor scores require the observation-level table".to_string(),
        });
    }
    Ok(result)
}

/// Core pipeline over an already validated correlation matrix.
fn fit_matrix(
    corr: &Array2<f64>,
    n_obs: usize,
    options: &FactorOptions,
) -> Result<FactorResult, FaError> {
    let p = corr.nrows();
    let mut warnings = Vec::new();

    let (eigenvalues, _) = sorted_eigh(corr, "correlation eigenvalues")?;

    let n_factors = match options.factor_count {
        FactorCount::Fixed(k) => {
            if k == 0 {
                return Err(FaError::ZeroFactors);
            }
            if k > p {
                return Err(FaError::TooManyFactors {
                    requested: k,
                    max: p,
                });
            }
            k
        }
        FactorCount::Kaiser { threshold } => {
            let count = eigenvalues.iter().filter(|&&v| v > threshold).count();
            if count == 0 {
                warnings.push(FaWarning::KaiserPromoted { threshold });
                1
            } else {
                count
            }
        }
    };

    // The diagnostics read the same immutable matrix the factor work does,
    // so both run behind one join barrier with disjoint outputs.
    let (smc_estimate, adequacy_out) =
        rayon::join(|| smc(corr), || adequacy(corr, n_obs));
    if smc_estimate.fallback {
        warnings.push(FaWarning::SmcFallback);
    }
    if adequacy_out.is_none() {
        warnings.push(FaWarning::AdequacyOmitted);
    }

    let extraction = extract(
        options.extraction,
        corr,
        n_factors,
        &smc_estimate.communalities,
        options.max_iter,
        options.tolerance,
    )?;
    if !extraction.converged {
        warnings.push(FaWarning::ExtractionNotConverged {
            iterations: extraction.iterations,
        });
    }
    for &variable in &extraction.heywood {
        warnings.push(FaWarning::HeywoodCase { variable });
    }

    let mut unrotated = extraction.loadings;
    post::standardize_signs(&mut unrotated, None, None);

    let mut loadings = unrotated.clone();
    let mut rotation_matrix: Option<Array2<f64>> = None;
    let mut phi: Option<Array2<f64>> = None;
    let mut rotation_converged = None;
    let mut rotation_iterations = None;
    if let Some(spec) = &options.rotation {
        if n_factors < 2 {
            warnings.push(FaWarning::RotationSkipped);
        } else {
            match rotate(
                &unrotated,
                spec.criterion,
                ROTATION_EPS,
                ROTATION_MAX_ITER,
                spec.restarts,
                spec.seed,
            ) {
                Ok(rot) => {
                    if !rot.converged {
                        warnings.push(FaWarning::RotationNotConverged {
                            iterations: rot.iterations,
                        });
                    }
                    loadings = rot.loadings;
                    rotation_matrix = Some(rot.transform);
                    phi = rot.phi;
                    rotation_converged = Some(rot.converged);
                    rotation_iterations = Some(rot.iterations);
                }
                Err(e) => {
                    log::warn!("rotation failed, keeping the unrotated solution: {e}");
                    warnings.push(FaWarning::RotationFailed {
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    post::standardize_signs(&mut loadings, rotation_matrix.as_mut(), phi.as_mut());
    post::reorder_factors(&mut loadings, rotation_matrix.as_mut(), phi.as_mut());

    let finalized = post::finalize_communalities(&loadings, phi.as_ref());
    for &variable in &finalized.heywood {
        if !warnings.contains(&FaWarning::HeywoodCase { variable }) {
            warnings.push(FaWarning::HeywoodCase { variable });
        }
    }
    let structure = post::structure_matrix(&loadings, phi.as_ref());
    let (proportion_variance, cumulative_variance) =
        post::explained_proportions(&loadings, phi.as_ref());

    Ok(FactorResult {
        extraction: options.extraction,
        n_obs,
        n_variables: p,
        n_factors,
        loadings,
        structure,
        unrotated,
        initial_communalities: smc_estimate.communalities,
        communalities: finalized.communality,
        uniquenesses: finalized.uniqueness,
        eigenvalues,
        rotation_matrix,
        phi,
        proportion_variance,
        cumulative_variance,
        extraction_converged: extraction.converged,
        extraction_iterations: extraction.iterations,
        rotation_converged,
        rotation_iterations,
        means: None,
        std_devs: None,
        scores: None,
        score_weights: None,
        score_covariance: None,
        adequacy: adequacy_out,
        warnings,
    })
}

/// A fitted model reduced to what scoring new observations needs. Can be
/// persisted to disk and reloaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorModel {
    loadings: Array2<f64>,
    phi: Option<Array2<f64>>,
    uniquenesses: Array1<f64>,
    means: Array1<f64>,
    scale: Array1<f64>,
    weights: Array2<f64>,
}

impl FactorModel {
    /// Builds a scoring model from a fitted result. Requires the result to
    /// carry column moments and score weights (i.e. it came from [`fit`]
    /// with scoring enabled).
    pub fn from_result(result: &FactorResult) -> Result<Self, FaError> {
        let means = result
            .means
            .clone()
            .ok_or_else(|| FaError::ModelInvalid("column means are unavailable".to_string()))?;
        let scale = result.std_devs.clone().ok_or_else(|| {
            FaError::ModelInvalid("column standard deviations are unavailable".to_string())
        })?;
        let weights = result.score_weights.clone().ok_or_else(|| {
            FaError::ModelInvalid("score weights were not computed".to_string())
        })?;
        Ok(Self {
            loadings: result.loadings.clone(),
            phi: result.phi.clone(),
            uniquenesses: result.uniquenesses.clone(),
            means,
            scale,
            weights,
        })
    }

    /// Final pattern loadings.
    pub fn loadings(&self) -> &Array2<f64> {
        &self.loadings
    }

    /// Factor correlations, when the model came from an oblique rotation.
    pub fn phi(&self) -> Option<&Array2<f64>> {
        self.phi.as_ref()
    }

    /// Final uniquenesses.
    pub fn uniquenesses(&self) -> &Array1<f64> {
        &self.uniquenesses
    }

    /// Scores new observations with the stored weights. Rows are centered
    /// and scaled with the training moments, then projected.
    pub fn score(&self, mut data: Array2<f64>) -> Result<Array2<f64>, FaError> {
        let p = self.means.len();
        if data.ncols() != p {
            return Err(FaError::DimensionMismatch(format!(
                "model expects {} variables, data has {}",
                p,
                data.ncols()
            )));
        }
        if data.iter().any(|v| !v.is_finite()) {
            return Err(FaError::NonFiniteInput);
        }
        for mut row in data.axis_iter_mut(Axis(0)) {
            ndarray::Zip::from(row.view_mut())
                .and(self.means.view())
                .and(self.scale.view())
                .for_each(|value, &mean, &scale| {
                    *value = (*value - mean) / scale;
                });
        }
        Ok(data.dot(&self.weights))
    }

    /// Saves the model with bincode.
    pub fn save_model<P: AsRef<Path>>(&self, path: P) -> Result<(), FaError> {
        let file = File::create(path.as_ref())
            .map_err(|e| FaError::ModelIo(format!("create {:?}: {e}", path.as_ref())))?;
        let mut writer = BufWriter::new(file);
        bincode::serde::encode_into_std_write(self, &mut writer, bincode::config::standard())
            .map_err(|e| FaError::ModelIo(format!("serialize model: {e}")))?;
        Ok(())
    }

    /// Loads and validates a model previously written by [`save_model`].
    ///
    /// [`save_model`]: FactorModel::save_model
    pub fn load_model<P: AsRef<Path>>(path: P) -> Result<Self, FaError> {
        let file = File::open(path.as_ref())
            .map_err(|e| FaError::ModelIo(format!("open {:?}: {e}", path.as_ref())))?;
        let mut reader = BufReader::new(file);
        let model: FactorModel =
            bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())
                .map_err(|e| FaError::ModelIo(format!("deserialize model: {e}")))?;

        let p = model.loadings.nrows();
        let m = model.loadings.ncols();
        if model.means.len() != p || model.scale.len() != p || model.uniquenesses.len() != p {
            return Err(FaError::ModelInvalid(
                "inconsistent variable dimensions".to_string(),
            ));
        }
        if model.weights.dim() != (p, m) {
            return Err(FaError::ModelInvalid(
                "weight matrix does not match the loadings".to_string(),
            ));
        }
        if let Some(ph) = &model.phi {
            if ph.dim() != (m, m) {
                return Err(FaError::ModelInvalid(
                    "factor-correlation matrix does not match the loadings".to_string(),
                ));
            }
        }
        if model.scale.iter().any(|&s| !s.is_finite() || s <= 0.0) {
            return Err(FaError::ModelInvalid(
                "scale vector must be positive and finite".to_string(),
            ));
        }
        if model.weights.iter().any(|w| !w.is_finite()) {
            return Err(FaError::ModelInvalid(
                "weight matrix contains non-finite values".to_string(),
            ));
        }
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    /// Observations driven by two correlated latent factors.
    fn two_factor_data(n: usize, seed: u64) -> Array2<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut data = Array2::zeros((n, 6));
        for i in 0..n {
            let g1: f64 = rng.gen_range(-1.0..1.0);
            let g2: f64 = 0.3 * g1 + 0.7 * rng.gen_range(-1.0..1.0);
            for j in 0..6 {
                let shared = if j < 3 { g1 } else { g2 };
                data[[i, j]] = shared + 0.4 * rng.gen_range(-1.0..1.0);
            }
        }
        data
    }

    #[test]
    fn kaiser_retains_the_dominant_factors() {
        let data = two_factor_data(400, 3);
        let options = FactorOptions {
            extraction: ExtractionMethod::Paf,
            ..FactorOptions::default()
        };
        let result = fit(data.view(), &options).unwrap();
        assert_eq!(result.n_factors, 2);
        assert_eq!(result.eigenvalues.len(), 6);
        assert!(result.eigenvalues[0] >= result.eigenvalues[1]);
    }

    #[test]
    fn scoring_produces_weights_scores_and_covariance() {
        let data = two_factor_data(300, 5);
        let options = FactorOptions {
            factor_count: FactorCount::Fixed(2),
            extraction: ExtractionMethod::MinRes,
            scoring: Some(ScoreMethod::Regression),
            ..FactorOptions::default()
        };
        let result = fit(data.view(), &options).unwrap();
        let scores = result.scores.as_ref().unwrap();
        assert_eq!(scores.dim(), (300, 2));
        let cov = result.score_covariance.as_ref().unwrap();
        for j in 0..2 {
            assert!(cov[[j, j]] > 0.0 && cov[[j, j]] <= 1.0 + 1e-8);
        }
    }

    #[test]
    fn correlation_input_skips_scoring_with_a_warning() {
        let data = two_factor_data(300, 9);
        let ci = crate::corr::correlation_from_data(&data.view()).unwrap();
        let options = FactorOptions {
            factor_count: FactorCount::Fixed(2),
            scoring: Some(ScoreMethod::Bartlett),
            ..FactorOptions::default()
        };
        let result = fit_correlation(ci.matrix, ci.n_obs, &options).unwrap();
        assert!(result.scores.is_none());
        assert!(result
            .warnings
            .iter()
            .any(|w| matches!(w, FaWarning::ScoringSkipped { .. })));
    }

    #[test]
    fn model_round_trips_through_disk() {
        let data = two_factor_data(250, 13);
        let options = FactorOptions {
            factor_count: FactorCount::Fixed(2),
            extraction: ExtractionMethod::Paf,
            rotation: Some(RotationSpec {
                criterion: Criterion::Varimax,
                restarts: 0,
                seed: Some(1),
            }),
            scoring: Some(ScoreMethod::Bartlett),
            ..FactorOptions::default()
        };
        let result = fit(data.view(), &options).unwrap();
        let model = FactorModel::from_result(&result).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("factor_model.bin");
        model.save_model(&path).unwrap();
        let loaded = FactorModel::load_model(&path).unwrap();

        let fresh = two_factor_data(10, 99);
        let a = model.score(fresh.clone()).unwrap();
        let b = loaded.score(fresh).unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 0.0);
        }
    }

    #[test]
    fn zero_factor_request_is_rejected() {
        let data = two_factor_data(100, 21);
        let options = FactorOptions {
            factor_count: FactorCount::Fixed(0),
            ..FactorOptions::default()
        };
        assert!(matches!(
            fit(data.view(), &options),
            Err(FaError::ZeroFactors)
        ));
    }

    #[test]
    fn model_rejects_mismatched_data() {
        let data = two_factor_data(150, 31);
        let options = FactorOptions {
            factor_count: FactorCount::Fixed(2),
            scoring: Some(ScoreMethod::Regression),
            ..FactorOptions::default()
        };
        let result = fit(data.view(), &options).unwrap();
        let model = FactorModel::from_result(&result).unwrap();
        let narrow = Array2::zeros((5, 4));
        assert!(matches!(
            model.score(narrow),
            Err(FaError::DimensionMismatch(_))
        ));
    }
}
