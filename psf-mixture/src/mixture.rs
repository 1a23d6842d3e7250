//! Gaussian-mixture density evaluation
//!
//! The generic functions here accept any [`PsfScalar`], so the same code
//! renders plain `f64` images and carries dual-number derivatives through
//! the least-squares objective.

use nalgebra::{Matrix2, Vector2};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::codec::{decode, MixtureParams};
use crate::error::Result;
use crate::image::pixel_locations;
use crate::matrix2::invert_matrix;
use crate::scalar::{constant, PsfScalar};

/// ln(2π), the normalization constant of a 2D Gaussian
const LOG_TWO_PI: f64 = 1.837_877_066_409_345_5;

/// Log density of a 2D Gaussian at `x`.
///
/// `-½(x-μ)ᵗΣ⁻¹(x-μ) - ½ ln|Σ| - ln(2π)` with the 2x2 inverse written out in
/// closed form. A singular or indefinite covariance yields NaN or infinity
/// rather than an error.
pub fn log_gaussian_density<T: PsfScalar>(
    x: &Vector2<f64>,
    mean: &Vector2<T>,
    covariance: &Matrix2<T>,
) -> T {
    let d0 = constant::<T>(x.x) - mean.x;
    let d1 = constant::<T>(x.y) - mean.y;

    let s00 = covariance[(0, 0)];
    let s01 = covariance[(0, 1)];
    let s10 = covariance[(1, 0)];
    let s11 = covariance[(1, 1)];

    let det = s00 * s11 - s01 * s10;
    let quad = (s11 * d0 * d0 - (s01 + s10) * d0 * d1 + s00 * d1 * d1) / det;

    let half = constant::<T>(0.5);
    -(half * quad) - half * det.ln() - constant::<T>(LOG_TWO_PI)
}

/// Mixture density `Σ_k w_k N(x; μ_k, Σ_k)` at `x`.
pub fn density<T: PsfScalar>(x: &Vector2<f64>, params: &MixtureParams<T>) -> T {
    params
        .mu_vec
        .iter()
        .zip(&params.sigma_vec)
        .zip(&params.weight_vec)
        .fold(T::zero(), |acc, ((mu, sigma), &weight)| {
            acc + weight * log_gaussian_density(x, mu, sigma).exp()
        })
}

/// Decode an unconstrained vector and evaluate the mixture on a coordinate grid.
///
/// The output has the same shape as `locations`.
pub fn render<T: PsfScalar>(par: &[T], locations: &Array2<Vector2<f64>>) -> Result<Array2<T>> {
    let params = decode(par)?;
    Ok(render_params(&params, locations))
}

/// Evaluate already-decoded mixture parameters on a coordinate grid.
pub fn render_params<T: PsfScalar>(
    params: &MixtureParams<T>,
    locations: &Array2<Vector2<f64>>,
) -> Array2<T> {
    locations.map(|x| density(x, params))
}

/// A fitted PSF component prepared for repeated analytic evaluation.
///
/// Caches the inverse covariance and log-determinant so evaluation at a
/// sub-pixel offset costs one quadratic form and one exponential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PsfComponent {
    /// Component mean in centered pixel coordinates
    pub mean: Vector2<f64>,
    /// Covariance matrix
    pub covariance: Matrix2<f64>,
    /// Inverse of `covariance`
    pub precision: Matrix2<f64>,
    /// ln |covariance|
    pub log_det: f64,
    /// Component weight
    pub weight: f64,
}

impl PsfComponent {
    /// Prepare a single component.
    ///
    /// # Errors
    /// Returns `Singular` when the covariance cannot be inverted.
    pub fn new(mean: Vector2<f64>, covariance: Matrix2<f64>, weight: f64) -> Result<Self> {
        let precision = invert_matrix(&covariance)?;
        Ok(Self {
            mean,
            covariance,
            precision,
            log_det: covariance.determinant().ln(),
            weight,
        })
    }

    /// Prepare every component of a fitted mixture.
    pub fn from_params(params: &MixtureParams) -> Result<Vec<Self>> {
        params
            .mu_vec
            .iter()
            .zip(&params.sigma_vec)
            .zip(&params.weight_vec)
            .map(|((mu, sigma), &weight)| Self::new(*mu, *sigma, weight))
            .collect()
    }

    /// Weighted density of this component at `x`.
    pub fn evaluate(&self, x: &Vector2<f64>) -> f64 {
        let d = x - self.mean;
        let quad = d.dot(&(self.precision * d));
        self.weight * (-0.5 * quad - 0.5 * self.log_det).exp() / (2.0 * PI)
    }
}

/// Fitted PSF value at `x`, summed over components.
pub fn evaluate_psf(components: &[PsfComponent], x: &Vector2<f64>) -> f64 {
    components.iter().map(|c| c.evaluate(x)).sum()
}

/// Render a fitted PSF on a centered `rows x cols` grid with its center
/// displaced by a sub-pixel `offset`.
pub fn render_psf(
    components: &[PsfComponent],
    rows: usize,
    cols: usize,
    offset: &Vector2<f64>,
) -> Array2<f64> {
    pixel_locations(rows, cols).map(|x| evaluate_psf(components, &(x - offset)))
}

/// Sum of the rendered PSF, a quick check of how much flux a grid captures.
pub fn rendered_flux(components: &[PsfComponent], rows: usize, cols: usize) -> f64 {
    render_psf(components, rows, cols, &Vector2::zeros()).sum()
}
