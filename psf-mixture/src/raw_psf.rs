//! Raw PSF reconstruction from calibration eigenimages
//!
//! A calibration bundle stores `K` eigenimages, each flattened column-major
//! into one column of an `(rnrow * rncol) x K` matrix, and a polynomial
//! coefficient tensor of shape `(nrow_b, ncol_b, K)`. The PSF at frame
//! location `(row, col)` is
//!
//! ```text
//! w_k   = Σ_i Σ_j coeff[i, j, k] · ((row - 1) · RCS)^i · ((col - 1) · RCS)^j
//! psf   = Σ_k w_k · eigenimage_k
//! ```
//!
//! where `row` and `col` follow the calibration's 1-based frame convention.

use ndarray::{Array1, Array2, Array3};
use serde::{Deserialize, Serialize};

use crate::error::{PsfFitError, Result};

/// Scale applied to frame coordinates before raising them to polynomial powers
pub const ROW_COL_SCALE: f64 = 0.001;

/// Immutable calibration bundle describing a spatially varying PSF.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPsfComponents {
    /// Column-major flattened eigenimages, shape `(rnrow * rncol, K)`
    eigenimages: Array2<f64>,
    /// Rows of each eigenimage
    rnrow: usize,
    /// Columns of each eigenimage
    rncol: usize,
    /// Polynomial coefficients, shape `(nrow_b, ncol_b, K)`
    coefficients: Array3<f64>,
}

impl RawPsfComponents {
    /// Bundle calibration arrays after checking their shapes agree.
    ///
    /// # Errors
    /// `ShapeMismatch` when the eigenimage rows are not `rnrow * rncol`, the
    /// eigenimage and coefficient depths differ, or any dimension is zero.
    pub fn new(
        eigenimages: Array2<f64>,
        rnrow: usize,
        rncol: usize,
        coefficients: Array3<f64>,
    ) -> Result<Self> {
        let (n_pixels, k_tot) = eigenimages.dim();
        let (nrow_b, ncol_b, depth) = coefficients.dim();

        if rnrow == 0 || rncol == 0 || n_pixels != rnrow * rncol {
            return Err(PsfFitError::ShapeMismatch(format!(
                "eigenimages have {n_pixels} rows, expected {rnrow} x {rncol} = {}",
                rnrow * rncol
            )));
        }
        if k_tot == 0 || depth != k_tot {
            return Err(PsfFitError::ShapeMismatch(format!(
                "eigenimages have {k_tot} columns but coefficient tensor depth is {depth}"
            )));
        }
        if nrow_b == 0 || ncol_b == 0 {
            return Err(PsfFitError::ShapeMismatch(format!(
                "coefficient tensor needs at least one polynomial term, got ({nrow_b}, {ncol_b})"
            )));
        }

        Ok(Self {
            eigenimages,
            rnrow,
            rncol,
            coefficients,
        })
    }

    /// Number of eigenimages
    pub fn n_eigen(&self) -> usize {
        self.eigenimages.ncols()
    }

    /// Shape `(rnrow, rncol)` of reconstructed images
    pub fn image_shape(&self) -> (usize, usize) {
        (self.rnrow, self.rncol)
    }

    /// Flattened eigenimage matrix
    pub fn eigenimages(&self) -> &Array2<f64> {
        &self.eigenimages
    }

    /// Polynomial coefficient tensor
    pub fn coefficients(&self) -> &Array3<f64> {
        &self.coefficients
    }

    /// Polynomial weight of each eigenimage at frame location `(row, col)`.
    pub fn eigen_weights(&self, row: f64, col: f64) -> Array1<f64> {
        let (nrow_b, ncol_b, k_tot) = self.coefficients.dim();
        let rrow = (row - 1.0) * ROW_COL_SCALE;
        let rcol = (col - 1.0) * ROW_COL_SCALE;

        let mut weights = Array1::zeros(k_tot);
        for i in 0..nrow_b {
            let row_term = rrow.powi(i as i32);
            for j in 0..ncol_b {
                let term = row_term * rcol.powi(j as i32);
                for k in 0..k_tot {
                    weights[k] += self.coefficients[[i, j, k]] * term;
                }
            }
        }
        weights
    }

    /// Reconstruct the `rnrow x rncol` PSF image at frame location `(row, col)`.
    ///
    /// Pixel `(r, c)` reads flat index `r + c * rnrow` of every eigenimage.
    pub fn reconstruct(&self, row: f64, col: f64) -> Array2<f64> {
        let weights = self.eigen_weights(row, col);
        let rnrow = self.rnrow;

        Array2::from_shape_fn((self.rnrow, self.rncol), |(r, c)| {
            let flat = r + c * rnrow;
            weights
                .iter()
                .enumerate()
                .fold(0.0, |acc, (k, w)| acc + w * self.eigenimages[[flat, k]])
        })
    }
}

/// Reconstruct the raw PSF at `(row, col)`; free-function form of
/// [`RawPsfComponents::reconstruct`].
pub fn reconstruct(row: f64, col: f64, components: &RawPsfComponents) -> Array2<f64> {
    components.reconstruct(row, col)
}
