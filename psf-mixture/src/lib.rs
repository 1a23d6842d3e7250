//! psf-mixture - Gaussian-mixture models of point spread functions
//!
//! This crate fits small images of a PSF with a weighted sum of 2D
//! Gaussians and renders the fitted model back onto pixel grids:
//!
//! - **Codec** - bijection between mixtures and unconstrained parameter vectors
//! - **Mixture** - density and image rendering, generic over dual numbers
//! - **Raw PSF** - reconstruction from eigenimages and polynomial coefficients
//! - **Least squares** - argmin-driven fit over the codec vector
//! - **EM** - legacy fixed three-component fit
//!
//! # Example
//!
//! ```text
//! use psf_mixture::{fit_psf, FitStrategy, LeastSquaresConfig, PsfComponent};
//!
//! let strategy = FitStrategy::LeastSquares(LeastSquaresConfig::with_components(2));
//! let fit = fit_psf(&image.view(), &strategy)?;
//!
//! // Evaluate the fitted PSF at a sub-pixel offset
//! let components = PsfComponent::from_params(&fit.params())?;
//! let stamp = render_psf(&components, 15, 15, &Vector2::new(0.3, -0.1));
//! ```

pub mod codec;
pub mod config;
pub mod em;
pub mod error;
pub mod image;
pub mod least_squares;
pub mod matrix2;
pub mod mixture;
pub mod raw_psf;
pub mod scalar;
pub mod strategy;

// Re-export commonly used types
pub use codec::{decode, encode, MixtureParams, BLOCK_SIZE, SIGMA_MIN_DIAGONAL, WEIGHT_MIN};
pub use config::{EmConfig, LeastSquaresConfig, OptimizerMethod};
pub use em::{fit_em, EmFit, GaussianMixture, EM_COMPONENTS};
pub use error::{PsfFitError, Result};
pub use image::pixel_locations;
pub use least_squares::{
    default_initial_params, fit_least_squares, fit_raw_psf, LeastSquaresFit, OptimizerReport,
};
pub use mixture::{density, evaluate_psf, render, render_params, render_psf, PsfComponent};
pub use raw_psf::{reconstruct, RawPsfComponents};
pub use scalar::PsfScalar;
pub use strategy::{fit_psf, FitStrategy, PsfFit};
