//! 2x2 covariance matrix utilities using nalgebra
//!
//! Provides the inversion and factorization steps needed by the mixture
//! codec and evaluators, with error handling for singular and
//! non-positive-definite inputs.

use nalgebra::Matrix2;
use thiserror::Error;

/// Error when matrix inversion fails due to singular matrix
#[derive(Error, Debug, Clone, PartialEq)]
#[error("singular matrix: determinant={determinant:.6e}")]
pub struct SingularMatrixError {
    /// The determinant value (zero or near-zero)
    pub determinant: f64,
}

/// Error when a matrix has no Cholesky factorization
#[derive(Error, Debug, Clone, PartialEq)]
#[error("matrix is not symmetric positive definite: pivot={pivot:.6e}, asymmetry={asymmetry:.6e}")]
pub struct NotPositiveDefiniteError {
    /// First non-positive pivot encountered (or NaN)
    pub pivot: f64,
    /// Absolute difference between the off-diagonal entries
    pub asymmetry: f64,
}

/// Threshold for considering a determinant as zero
const DETERMINANT_EPSILON: f64 = 1e-10;

/// Relative tolerance on `|m01 - m10|` for a matrix to count as symmetric
const SYMMETRY_TOLERANCE: f64 = 1e-9;

/// Invert a 2x2 matrix with error handling for singular matrices
///
/// # Arguments
/// * `matrix` - The 2x2 matrix to invert
///
/// # Returns
/// * `Ok(Matrix2<f64>)` - The inverse matrix
/// * `Err(SingularMatrixError)` - If matrix is singular
pub fn invert_matrix(matrix: &Matrix2<f64>) -> Result<Matrix2<f64>, SingularMatrixError> {
    let det = matrix.determinant();

    if !det.is_finite() || det.abs() < DETERMINANT_EPSILON {
        return Err(SingularMatrixError { determinant: det });
    }

    matrix
        .try_inverse()
        .ok_or(SingularMatrixError { determinant: det })
}

/// Upper-triangular Cholesky factor `U` with `UᵗU = matrix`
///
/// The diagonal of `U` is strictly positive, which makes the factor unique.
///
/// # Arguments
/// * `matrix` - Symmetric positive definite 2x2 matrix
///
/// # Returns
/// * `Ok(Matrix2<f64>)` - `[[u00, u01], [0, u11]]`
/// * `Err(NotPositiveDefiniteError)` - If the matrix is asymmetric or a pivot is not positive
pub fn upper_cholesky(matrix: &Matrix2<f64>) -> Result<Matrix2<f64>, NotPositiveDefiniteError> {
    let m00 = matrix[(0, 0)];
    let m01 = matrix[(0, 1)];
    let m11 = matrix[(1, 1)];

    let asymmetry = (m01 - matrix[(1, 0)]).abs();
    let scale = m00.abs().max(m11.abs()).max(1.0);
    if !(asymmetry <= SYMMETRY_TOLERANCE * scale) {
        return Err(NotPositiveDefiniteError {
            pivot: m00,
            asymmetry,
        });
    }

    if !(m00 > 0.0) {
        return Err(NotPositiveDefiniteError {
            pivot: m00,
            asymmetry,
        });
    }
    let u00 = m00.sqrt();
    let u01 = m01 / u00;

    let schur = m11 - u01 * u01;
    if !(schur > 0.0) {
        return Err(NotPositiveDefiniteError {
            pivot: schur,
            asymmetry,
        });
    }

    Ok(Matrix2::new(u00, u01, 0.0, schur.sqrt()))
}

/// Create a 2x2 diagonal matrix
///
/// # Arguments
/// * `d0` - First diagonal entry
/// * `d1` - Second diagonal entry
pub fn diagonal_matrix(d0: f64, d1: f64) -> Matrix2<f64> {
    Matrix2::new(d0, 0.0, 0.0, d1)
}

/// Check whether a matrix is symmetric with both eigenvalues positive
pub fn is_symmetric_positive_definite(matrix: &Matrix2<f64>) -> bool {
    upper_cholesky(matrix).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_inversion_identity() {
        let identity = Matrix2::identity();
        let inverse = invert_matrix(&identity).unwrap();

        assert_relative_eq!(inverse[(0, 0)], 1.0, epsilon = 1e-10);
        assert_relative_eq!(inverse[(0, 1)], 0.0, epsilon = 1e-10);
        assert_relative_eq!(inverse[(1, 0)], 0.0, epsilon = 1e-10);
        assert_relative_eq!(inverse[(1, 1)], 1.0, epsilon = 1e-10);
    }

    #[test]
    fn test_inversion_roundtrip() {
        let matrix = Matrix2::new(2.0, 1.0, 1.0, 3.0);
        let inverse = invert_matrix(&matrix).unwrap();

        let product = matrix * inverse;

        assert_relative_eq!(product[(0, 0)], 1.0, epsilon = 1e-10);
        assert_relative_eq!(product[(0, 1)], 0.0, epsilon = 1e-10);
        assert_relative_eq!(product[(1, 0)], 0.0, epsilon = 1e-10);
        assert_relative_eq!(product[(1, 1)], 1.0, epsilon = 1e-10);
    }

    #[test]
    fn test_singular_matrix_error() {
        let matrix = Matrix2::new(1.0, 2.0, 2.0, 4.0);

        let err = invert_matrix(&matrix).unwrap_err();
        assert!(err.determinant.abs() < 1e-9);
    }

    #[test]
    fn test_nan_matrix_is_singular() {
        let matrix = Matrix2::new(f64::NAN, 0.0, 0.0, 1.0);
        assert!(invert_matrix(&matrix).is_err());
    }

    #[test]
    fn test_upper_cholesky_reconstructs() {
        let matrix = Matrix2::new(4.0, 1.2, 1.2, 2.5);
        let u = upper_cholesky(&matrix).unwrap();

        assert_eq!(u[(1, 0)], 0.0);
        assert!(u[(0, 0)] > 0.0 && u[(1, 1)] > 0.0);

        let product = u.transpose() * u;
        assert_relative_eq!(product, matrix, epsilon = 1e-12);
    }

    #[test]
    fn test_upper_cholesky_rejects_indefinite() {
        // Eigenvalues 3 and -1
        let matrix = Matrix2::new(1.0, 2.0, 2.0, 1.0);
        let err = upper_cholesky(&matrix).unwrap_err();
        assert!(err.pivot <= 0.0);

        assert!(upper_cholesky(&Matrix2::new(-1.0, 0.0, 0.0, 1.0)).is_err());
        assert!(upper_cholesky(&Matrix2::zeros()).is_err());
    }

    #[test]
    fn test_upper_cholesky_rejects_asymmetric() {
        let matrix = Matrix2::new(2.0, 0.5, -0.5, 2.0);
        let err = upper_cholesky(&matrix).unwrap_err();
        assert_relative_eq!(err.asymmetry, 1.0);
    }

    #[test]
    fn test_diagonal_matrix() {
        let d = diagonal_matrix(2.0, 3.0);
        assert_eq!(d, Matrix2::new(2.0, 0.0, 0.0, 3.0));
        assert!(is_symmetric_positive_definite(&d));
        assert!(!is_symmetric_positive_definite(&diagonal_matrix(2.0, 0.0)));
    }
}
