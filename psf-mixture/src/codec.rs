//! Unconstrained reparameterization of Gaussian-mixture parameters
//!
//! Each component is stored as a block of [`BLOCK_SIZE`] reals:
//!
//! ```text
//! [mu_x, mu_y, ln U00, U01, ln U11, ln(w - WEIGHT_MIN)]
//! ```
//!
//! where `U` is the upper Cholesky factor of `sigma - SIGMA_MIN`. Any finite
//! vector decodes to a valid mixture: positive-definite covariances with
//! eigenvalues above the floor and weights strictly above [`WEIGHT_MIN`].

use nalgebra::{Matrix2, Scalar, Vector2};
use serde::{Deserialize, Serialize};

use crate::error::{PsfFitError, Result};
use crate::matrix2::{diagonal_matrix, upper_cholesky};
use crate::scalar::{constant, PsfScalar};

/// Number of unconstrained values per mixture component
pub const BLOCK_SIZE: usize = 6;

/// Diagonal of the covariance floor `SIGMA_MIN = diag(0.25, 0.25)`
pub const SIGMA_MIN_DIAGONAL: f64 = 0.25;

/// Floor on component weights
pub const WEIGHT_MIN: f64 = 0.05;

/// Covariance floor subtracted before factorization
pub fn sigma_min() -> Matrix2<f64> {
    diagonal_matrix(SIGMA_MIN_DIAGONAL, SIGMA_MIN_DIAGONAL)
}

/// Means, covariances and (unnormalized) weights of a 2D Gaussian mixture.
///
/// Generic over the scalar so the decoder can emit dual numbers; the
/// default `f64` form is what fitters return.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixtureParams<T: Scalar = f64> {
    /// Component means
    pub mu_vec: Vec<Vector2<T>>,
    /// Component covariance matrices
    pub sigma_vec: Vec<Matrix2<T>>,
    /// Component weights, not required to sum to one
    pub weight_vec: Vec<T>,
}

impl<T: Scalar> MixtureParams<T> {
    /// Number of components
    pub fn len(&self) -> usize {
        self.mu_vec.len()
    }

    /// True when the mixture has no components
    pub fn is_empty(&self) -> bool {
        self.mu_vec.is_empty()
    }

    fn check_lengths(&self) -> Result<()> {
        let k = self.mu_vec.len();
        if k == 0 || self.sigma_vec.len() != k || self.weight_vec.len() != k {
            return Err(PsfFitError::ShapeMismatch(format!(
                "mixture needs K >= 1 with equal lengths, got {} means, {} covariances, {} weights",
                k,
                self.sigma_vec.len(),
                self.weight_vec.len()
            )));
        }
        Ok(())
    }
}

impl MixtureParams<f64> {
    /// Total weight of all components
    pub fn total_weight(&self) -> f64 {
        self.weight_vec.iter().sum()
    }
}

/// Map constrained mixture parameters to an unconstrained vector of length `6K`.
///
/// # Errors
/// * `ShapeMismatch` - empty mixture or sequences of different lengths
/// * `NonPositiveDefinite` - `sigma - SIGMA_MIN` has no Cholesky factor
/// * `WeightBelowFloor` - `weight <= WEIGHT_MIN`
pub fn encode(params: &MixtureParams) -> Result<Vec<f64>> {
    params.check_lengths()?;

    let floor = sigma_min();
    let mut out = Vec::with_capacity(params.len() * BLOCK_SIZE);

    for (k, ((mu, sigma), &weight)) in params
        .mu_vec
        .iter()
        .zip(&params.sigma_vec)
        .zip(&params.weight_vec)
        .enumerate()
    {
        let u = upper_cholesky(&(sigma - floor))
            .map_err(|_| PsfFitError::NonPositiveDefinite { component: k })?;

        let weight_offset = weight - WEIGHT_MIN;
        if !(weight_offset > 0.0) {
            return Err(PsfFitError::WeightBelowFloor {
                component: k,
                weight,
                floor: WEIGHT_MIN,
            });
        }

        out.extend_from_slice(&[
            mu.x,
            mu.y,
            u[(0, 0)].ln(),
            u[(0, 1)],
            u[(1, 1)].ln(),
            weight_offset.ln(),
        ]);
    }

    Ok(out)
}

/// Map an unconstrained vector back to mixture parameters.
///
/// Rebuilds `sigma = UᵗU + SIGMA_MIN` from the stored factor directly, so the
/// path contains only exponentials, products and sums and differentiates
/// cleanly with dual numbers.
///
/// # Errors
/// * `InvalidVectorLength` - length is zero or not a multiple of [`BLOCK_SIZE`]
pub fn decode<T: PsfScalar>(par: &[T]) -> Result<MixtureParams<T>> {
    if par.is_empty() || par.len() % BLOCK_SIZE != 0 {
        return Err(PsfFitError::InvalidVectorLength {
            len: par.len(),
            block: BLOCK_SIZE,
        });
    }

    let k_tot = par.len() / BLOCK_SIZE;
    let mut mu_vec = Vec::with_capacity(k_tot);
    let mut sigma_vec = Vec::with_capacity(k_tot);
    let mut weight_vec = Vec::with_capacity(k_tot);

    let floor: T = constant(SIGMA_MIN_DIAGONAL);
    let weight_floor: T = constant(WEIGHT_MIN);

    for block in par.chunks_exact(BLOCK_SIZE) {
        mu_vec.push(Vector2::new(block[0], block[1]));

        let u00 = block[2].exp();
        let u01 = block[3];
        let u11 = block[4].exp();

        let s00 = u00 * u00 + floor;
        let s01 = u00 * u01;
        let s11 = u01 * u01 + u11 * u11 + floor;
        sigma_vec.push(Matrix2::new(s00, s01, s01, s11));

        weight_vec.push(block[5].exp() + weight_floor);
    }

    Ok(MixtureParams {
        mu_vec,
        sigma_vec,
        weight_vec,
    })
}
