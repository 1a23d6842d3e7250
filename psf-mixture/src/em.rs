//! Legacy three-component EM fit of a PSF image
//!
//! The image is normalized into a probability mass over grid cells and a
//! fixed three-component Gaussian mixture is fit by EM on that weighted
//! grid. Convergence is judged on the mean squared error between the
//! mixture density and the pixel mass rather than on the likelihood, and a
//! final closed-form scale aligns the fitted density with the target under
//! squared error.

use nalgebra::{Matrix2, Vector2};
use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::f64::consts::SQRT_2;

use crate::codec::MixtureParams;
use crate::config::EmConfig;
use crate::error::{PsfFitError, Result};
use crate::image::{
    clamp_negative, intensity_covariance, pixel_locations, total_intensity, validate_image,
};
use crate::matrix2::diagonal_matrix;
use crate::mixture::log_gaussian_density;

/// Number of components of the EM mixture
pub const EM_COMPONENTS: usize = 3;

/// Mutable Gaussian-mixture state evaluated and updated by EM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaussianMixture {
    /// Component means
    pub means: Vec<Vector2<f64>>,
    /// Component covariances
    pub covariances: Vec<Matrix2<f64>>,
    /// Component weights
    pub weights: Vec<f64>,
}

impl GaussianMixture {
    /// Build a mixture after checking the component sequences agree in length.
    pub fn new(
        means: Vec<Vector2<f64>>,
        covariances: Vec<Matrix2<f64>>,
        weights: Vec<f64>,
    ) -> Result<Self> {
        if means.is_empty() || covariances.len() != means.len() || weights.len() != means.len() {
            return Err(PsfFitError::ShapeMismatch(format!(
                "mixture needs equal non-zero lengths, got {} means, {} covariances, {} weights",
                means.len(),
                covariances.len(),
                weights.len()
            )));
        }
        Ok(Self {
            means,
            covariances,
            weights,
        })
    }

    /// Number of components
    pub fn n_components(&self) -> usize {
        self.means.len()
    }

    /// `ln π_k + ln N(x; μ_k, Σ_k)` for every component.
    fn weighted_log_densities(&self, x: &Vector2<f64>) -> Vec<f64> {
        self.means
            .iter()
            .zip(&self.covariances)
            .zip(&self.weights)
            .map(|((mean, covariance), weight)| {
                weight.ln() + log_gaussian_density(x, mean, covariance)
            })
            .collect()
    }

    /// Posterior responsibility of each component at each point, shape `(n, K)`.
    ///
    /// Normalized with log-sum-exp so far-away points do not underflow. A
    /// degenerate component produces NaN rows, which the fit reports as
    /// divergence.
    pub fn responsibilities(&self, points: &[Vector2<f64>]) -> Array2<f64> {
        let k_tot = self.n_components();
        let mut resp = Array2::zeros((points.len(), k_tot));

        for (n, x) in points.iter().enumerate() {
            let logs = self.weighted_log_densities(x);
            let max = logs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let norm: f64 = logs.iter().map(|l| (l - max).exp()).sum();
            for (k, l) in logs.iter().enumerate() {
                resp[[n, k]] = (l - max).exp() / norm;
            }
        }

        resp
    }

    /// Mixture density renormalized by the total weight, `Σ π_k N_k(x) / Σ π_k`.
    pub fn mixture_density(&self, points: &[Vector2<f64>]) -> Array1<f64> {
        let total_weight: f64 = self.weights.iter().sum();
        points
            .iter()
            .map(|x| {
                self.weighted_log_densities(x)
                    .iter()
                    .map(|l| l.exp())
                    .sum::<f64>()
                    / total_weight
            })
            .collect()
    }
}

/// Result of [`fit_em`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmFit {
    /// Fitted mixture over the normalized pixel mass
    pub mixture: GaussianMixture,
    /// Least-squares scale from the mixture density to the pixel mass
    pub scale: f64,
    /// Iterations performed
    pub iterations: usize,
    /// True when the error change fell below tolerance
    pub converged: bool,
    /// Final mean squared error between density and pixel mass
    pub mean_squared_error: f64,
    /// Sum of the clamped input image
    pub total_mass: f64,
}

impl EmFit {
    /// Fitted mixture in the units of the input image.
    ///
    /// Weights are `π_k / Σπ · scale · total_mass`. They are not floored,
    /// so the result may fall outside the codec's weight domain.
    pub fn mixture_params(&self) -> MixtureParams {
        let total_weight: f64 = self.mixture.weights.iter().sum();
        let factor = self.scale * self.total_mass / total_weight;

        MixtureParams {
            mu_vec: self.mixture.means.clone(),
            sigma_vec: self.mixture.covariances.clone(),
            weight_vec: self.mixture.weights.iter().map(|w| w * factor).collect(),
        }
    }
}

/// Fixed starting mixture of the legacy fit.
///
/// The second mean is the negated first mean; both are the origin, so the
/// first two components start at the same place with different spreads.
pub fn initial_mixture(
    target: &ArrayView2<f64>,
    locations: &Array2<Vector2<f64>>,
) -> Result<GaussianMixture> {
    let origin = Vector2::zeros();
    Ok(GaussianMixture {
        means: vec![origin, -origin, Vector2::new(0.2, 0.2)],
        covariances: vec![
            diagonal_matrix(SQRT_2, SQRT_2),
            diagonal_matrix(2.0, 2.0),
            intensity_covariance(target, locations)?,
        ],
        weights: vec![1.0 / EM_COMPONENTS as f64; EM_COMPONENTS],
    })
}

/// Re-estimate weights, means and covariances from mass-weighted responsibilities.
///
/// Weights are always replaced, so they keep summing to one. The mean and
/// covariance of a component whose new weight is at or below `min_weight`
/// keep their previous values.
fn maximization_step(
    gmm: &mut GaussianMixture,
    resp: &Array2<f64>,
    points: &[Vector2<f64>],
    mass: &[f64],
    min_weight: f64,
    iteration: usize,
) -> Result<()> {
    let k_tot = gmm.n_components();

    let mut component_mass = vec![0.0; k_tot];
    for (n, &p) in mass.iter().enumerate() {
        for (k, m) in component_mass.iter_mut().enumerate() {
            *m += resp[[n, k]] * p;
        }
    }
    let total: f64 = component_mass.iter().sum();

    for k in 0..k_tot {
        let weight = component_mass[k] / total;
        if !weight.is_finite() {
            return Err(PsfFitError::NumericalDivergence { iteration });
        }
        gmm.weights[k] = weight;
        if weight <= min_weight {
            log::warn!(
                "EM component {} collapsed at iteration {} (weight {:.3e} <= {:.1e}); keeping previous mean and covariance",
                k,
                iteration,
                weight,
                min_weight
            );
            continue;
        }

        let mut mean = Vector2::zeros();
        for (n, x) in points.iter().enumerate() {
            mean += x * (resp[[n, k]] * mass[n]);
        }
        mean /= component_mass[k];

        let mut covariance = Matrix2::zeros();
        for (n, x) in points.iter().enumerate() {
            let d = x - mean;
            covariance += d * d.transpose() * (resp[[n, k]] * mass[n]);
        }
        covariance /= component_mass[k];

        gmm.means[k] = mean;
        gmm.covariances[k] = covariance;
    }

    Ok(())
}

/// Fit the fixed three-component mixture to `image` by EM.
///
/// # Errors
/// * `InvalidArgument` - empty image, non-finite pixels, or no positive mass
/// * `NumericalDivergence` - the error or a component weight became NaN
///
/// Exhausting `config.max_iterations` logs a warning and still returns the
/// fit with `converged == false`.
pub fn fit_em(image: &ArrayView2<f64>, config: &EmConfig) -> Result<EmFit> {
    config.validate()?;
    validate_image(image)?;

    let image = clamp_negative(image);
    let total_mass = total_intensity(&image.view());
    if !(total_mass > 0.0) {
        return Err(PsfFitError::InvalidArgument(
            "PSF image has no positive mass".to_string(),
        ));
    }

    let target = &image / total_mass;
    let (rows, cols) = target.dim();
    let locations = pixel_locations(rows, cols);
    let points: Vec<Vector2<f64>> = locations.iter().cloned().collect();
    let mass: Vec<f64> = target.iter().cloned().collect();
    let n_points = points.len() as f64;

    let mut gmm = initial_mixture(&target.view(), &locations)?;

    let mut last_err = f64::INFINITY;
    let mut err_diff = f64::INFINITY;
    let mut iterations = 0;
    let mut converged = false;
    let mut fit = Array1::zeros(points.len());

    for iteration in 1..=config.max_iterations {
        iterations = iteration;

        let resp = gmm.responsibilities(&points);
        maximization_step(
            &mut gmm,
            &resp,
            &points,
            &mass,
            config.min_component_weight,
            iteration,
        )?;

        fit = gmm.mixture_density(&points);
        let err = fit
            .iter()
            .zip(&mass)
            .map(|(f, p)| (f - p).powi(2))
            .sum::<f64>()
            / n_points;

        if err.is_nan() {
            return Err(PsfFitError::NumericalDivergence { iteration });
        }

        err_diff = (err - last_err).abs();
        last_err = err;
        log::debug!(
            "EM iteration {}: mse={:.6e}, change={:.3e}",
            iteration,
            err,
            err_diff
        );

        if err_diff < config.tolerance {
            converged = true;
            break;
        }
    }

    if !converged {
        log::warn!(
            "EM reached the maximum of {} iterations without meeting tolerance {:e} (last change {:.3e})",
            config.max_iterations,
            config.tolerance,
            err_diff
        );
    }

    let fit_dot_target: f64 = fit.iter().zip(&mass).map(|(f, p)| f * p).sum();
    let fit_dot_fit: f64 = fit.iter().map(|f| f * f).sum();
    if !(fit_dot_fit > 0.0) {
        return Err(PsfFitError::NumericalDivergence {
            iteration: iterations,
        });
    }
    let scale = fit_dot_target / fit_dot_fit;

    log::debug!(
        "EM PSF fit finished: iterations={}, converged={}, mse={:.6e}, scale={:.6}",
        iterations,
        converged,
        last_err,
        scale
    );

    Ok(EmFit {
        mixture: gmm,
        scale,
        iterations,
        converged,
        mean_squared_error: last_err,
        total_mass,
    })
}
