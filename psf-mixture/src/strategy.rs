//! Selection between the least-squares and EM fitters

use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

use crate::codec::MixtureParams;
use crate::config::{EmConfig, LeastSquaresConfig};
use crate::em::{fit_em, EmFit};
use crate::error::Result;
use crate::least_squares::{fit_least_squares, LeastSquaresFit};

/// Which fitter to run, with its configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FitStrategy {
    /// Least-squares fit over the unconstrained codec vector
    LeastSquares(LeastSquaresConfig),
    /// Legacy fixed three-component EM fit
    Em(EmConfig),
}

impl Default for FitStrategy {
    fn default() -> Self {
        FitStrategy::LeastSquares(LeastSquaresConfig::default())
    }
}

impl FitStrategy {
    /// Short label used in logs
    pub fn name(&self) -> &'static str {
        match self {
            FitStrategy::LeastSquares(_) => "least-squares",
            FitStrategy::Em(_) => "em",
        }
    }
}

/// Output of [`fit_psf`], tagged by the fitter that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PsfFit {
    /// Least-squares mixture with optimizer report
    LeastSquares(LeastSquaresFit),
    /// Three-component EM mixture over the normalized image
    Em(EmFit),
}

impl PsfFit {
    /// Fitted mixture in image units
    pub fn params(&self) -> MixtureParams {
        match self {
            PsfFit::LeastSquares(fit) => fit.params.clone(),
            PsfFit::Em(fit) => fit.mixture_params(),
        }
    }

    /// Whether the fitter met its tolerance
    pub fn converged(&self) -> bool {
        match self {
            PsfFit::LeastSquares(fit) => fit.report.converged,
            PsfFit::Em(fit) => fit.converged,
        }
    }
}

/// Fit `image` with the fitter named by `strategy`, using its default start.
pub fn fit_psf(image: &ArrayView2<f64>, strategy: &FitStrategy) -> Result<PsfFit> {
    log::debug!("Fitting PSF image with {} strategy", strategy.name());
    match strategy {
        FitStrategy::LeastSquares(config) => {
            fit_least_squares(image, None, config).map(PsfFit::LeastSquares)
        }
        FitStrategy::Em(config) => fit_em(image, config).map(PsfFit::Em),
    }
}
