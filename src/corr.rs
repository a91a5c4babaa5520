//! Correlation-matrix assembly from an observations-by-variables table.

use crate::constants::{DIAGONAL_DRIFT_TOL, SCALE_SANITIZATION_THRESHOLD};
use crate::error::FaError;
use ndarray::{Array1, Array2, ArrayView2, Axis};

/// A validated correlation matrix together with the column moments it was
/// built from. The matrix is immutable once computed.
#[derive(Debug, Clone)]
pub struct CorrelationInput {
    /// Pearson correlation matrix, unit diagonal.
    pub matrix: Array2<f64>,
    /// Column means of the source table.
    pub means: Array1<f64>,
    /// Sanitized column standard deviations (near-zero values replaced by
    /// 1.0 so constant columns do not poison the scaling).
    pub std_devs: Array1<f64>,
    /// Number of observations in the source table.
    pub n_obs: usize,
    /// Whether any diagonal entry drifted past tolerance and was rewritten.
    pub diagonal_corrected: bool,
}

/// Rejects tables the engine cannot analyze.
pub fn validate_table(data: &ArrayView2<f64>) -> Result<(), FaError> {
    let (n, p) = data.dim();
    if n == 0 || p == 0 {
        return Err(FaError::EmptyInput);
    }
    if n < 2 {
        return Err(FaError::TooFewObservations(n));
    }
    if data.iter().any(|v| !v.is_finite()) {
        return Err(FaError::NonFiniteInput);
    }
    Ok(())
}

/// Builds the Pearson correlation matrix and column moments of `data`.
pub fn correlation_from_data(data: &ArrayView2<f64>) -> Result<CorrelationInput, FaError> {
    validate_table(data)?;
    let n = data.nrows();
    let p = data.ncols();

    let means = data
        .mean_axis(Axis(0))
        .ok_or(FaError::EmptyInput)?;
    let mut centered = data.to_owned();
    centered -= &means;

    let denom = (n - 1) as f64;
    let raw_std = centered.map_axis(Axis(0), |col| {
        (col.iter().map(|v| v * v).sum::<f64>() / denom).sqrt()
    });
    let std_devs = raw_std.mapv(|s| {
        if s.abs() > SCALE_SANITIZATION_THRESHOLD {
            s
        } else {
            1.0
        }
    });
    centered /= &std_devs;

    let mut matrix = centered.t().dot(&centered);
    matrix /= denom;

    let mut diagonal_corrected = false;
    for i in 0..p {
        if (matrix[[i, i]] - 1.0).abs() > DIAGONAL_DRIFT_TOL {
            diagonal_corrected = true;
        }
        matrix[[i, i]] = 1.0;
    }

    Ok(CorrelationInput {
        matrix,
        means,
        std_devs,
        n_obs: n,
        diagonal_corrected,
    })
}

/// Validates a caller-supplied correlation matrix, rewriting drifted
/// diagonals in place.
pub fn validate_correlation(matrix: &mut Array2<f64>) -> Result<bool, FaError> {
    let (rows, cols) = matrix.dim();
    if rows == 0 {
        return Err(FaError::EmptyInput);
    }
    if rows != cols {
        return Err(FaError::DimensionMismatch(format!(
            "correlation matrix must be square, got {rows}x{cols}"
        )));
    }
    if matrix.iter().any(|v| !v.is_finite()) {
        return Err(FaError::NonFiniteInput);
    }
    let mut corrected = false;
    for i in 0..rows {
        if (matrix[[i, i]] - 1.0).abs() > DIAGONAL_DRIFT_TOL {
            corrected = true;
        }
        matrix[[i, i]] = 1.0;
    }
    Ok(corrected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn correlation_of_perfectly_related_columns() {
        let data = array![[1.0, 2.0], [2.0, 4.0], [3.0, 6.0], [4.0, 8.0]];
        let ci = correlation_from_data(&data.view()).unwrap();
        assert_abs_diff_eq!(ci.matrix[[0, 1]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(ci.matrix[[0, 0]], 1.0, epsilon = 0.0);
        assert_eq!(ci.n_obs, 4);
    }

    #[test]
    fn constant_column_yields_zero_correlation() {
        let data = array![[1.0, 5.0], [2.0, 5.0], [3.0, 5.0]];
        let ci = correlation_from_data(&data.view()).unwrap();
        assert_abs_diff_eq!(ci.matrix[[0, 1]], 0.0, epsilon = 1e-12);
        // The sanitized scale for the constant column is 1.0.
        assert_abs_diff_eq!(ci.std_devs[1], 1.0, epsilon = 0.0);
    }

    #[test]
    fn rejects_nan_and_short_tables() {
        let nan = array![[1.0, f64::NAN], [2.0, 3.0]];
        assert!(matches!(
            validate_table(&nan.view()),
            Err(FaError::NonFiniteInput)
        ));
        let short = array![[1.0, 2.0]];
        assert!(matches!(
            validate_table(&short.view()),
            Err(FaError::TooFewObservations(1))
        ));
    }

    #[test]
    fn caller_matrix_diagonal_is_rewritten() {
        let mut m = array![[1.0 + 1e-6, 0.3], [0.3, 1.0]];
        let corrected = validate_correlation(&mut m).unwrap();
        assert!(corrected);
        assert_eq!(m[[0, 0]], 1.0);
    }
}
