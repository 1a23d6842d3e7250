//! Least-squares Gaussian-mixture fit of a PSF image
//!
//! Minimizes `Σ_pixels (image - render(θ))²` over the unconstrained vector
//! `θ` of the [`codec`](crate::codec) with an argmin solver. Because every
//! `θ` decodes to a valid mixture, the search needs no bounds.

use std::sync::{Arc, Mutex};

use argmin::core::observers::{Observe, ObserverMode};
use argmin::core::{
    CostFunction, Error as ArgminError, Executor, Gradient, State, TerminationReason,
    TerminationStatus, KV,
};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::neldermead::NelderMead;
use argmin::solver::quasinewton::LBFGS;
use nalgebra::Vector2;
use ndarray::{Array2, ArrayView2, Zip};
use serde::{Deserialize, Serialize};

use crate::codec::{decode, encode, MixtureParams};
use crate::config::{LeastSquaresConfig, OptimizerMethod};
use crate::error::{PsfFitError, Result};
use crate::image::{clamp_negative, intensity_centroid, pixel_locations, validate_image};
use crate::matrix2::diagonal_matrix;
use crate::mixture::density;
use crate::raw_psf::RawPsfComponents;
use crate::scalar::{constant, forward_gradient, PsfScalar};

type LbfgsSolver = LBFGS<MoreThuenteLineSearch<Vec<f64>, Vec<f64>, f64>, Vec<f64>, Vec<f64>, f64>;

/// Diagnostics of one optimizer run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerReport {
    /// Minimizer that produced the fit
    pub method: OptimizerMethod,
    /// Iterations performed
    pub iterations: u64,
    /// True when the solver met its tolerance
    pub converged: bool,
    /// Solver termination reason
    pub termination: String,
    /// Objective at the starting point
    pub initial_cost: f64,
    /// Objective at the returned point
    pub best_cost: f64,
    /// Best objective after each iteration
    pub cost_history: Vec<f64>,
}

/// Fitted mixture together with the optimizer diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeastSquaresFit {
    /// Fitted mixture parameters
    pub params: MixtureParams,
    /// Optimizer diagnostics
    pub report: OptimizerReport,
}

/// Sum of squared pixel residuals as a function of the unconstrained vector.
#[derive(Clone, Copy)]
struct SquaredResidual<'a> {
    image: &'a Array2<f64>,
    locations: &'a Array2<Vector2<f64>>,
}

impl SquaredResidual<'_> {
    fn objective<T: PsfScalar>(&self, par: &[T]) -> Result<T> {
        let params = decode(par)?;

        let mut total = T::zero();
        Zip::from(self.image)
            .and(self.locations)
            .for_each(|&pixel, x| {
                let residual = constant::<T>(pixel) - density(x, &params);
                total += residual * residual;
            });

        Ok(total)
    }
}

impl CostFunction for SquaredResidual<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, p: &Self::Param) -> std::result::Result<Self::Output, ArgminError> {
        let value = self.objective(p.as_slice())?;
        // Overflowing weights can give inf * 0; keep simplex ordering well defined
        Ok(if value.is_nan() { f64::INFINITY } else { value })
    }
}

impl Gradient for SquaredResidual<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, p: &Self::Param) -> std::result::Result<Self::Gradient, ArgminError> {
        let (_, grad) = forward_gradient(p, |dual| self.objective(dual))?;
        Ok(grad)
    }
}

/// Records the best cost after every iteration and optionally logs progress.
struct IterationObserver {
    history: Arc<Mutex<Vec<f64>>>,
    verbose: bool,
}

impl<I> Observe<I> for IterationObserver
where
    I: State<Param = Vec<f64>, Float = f64>,
{
    fn observe_iter(&mut self, state: &I, _kv: &KV) -> std::result::Result<(), ArgminError> {
        let best_cost = state.get_best_cost();
        if let Ok(mut history) = self.history.lock() {
            history.push(best_cost);
        }

        if self.verbose {
            log::info!(
                "iteration {}: objective={:.6e} best={:.6e}",
                state.get_iter(),
                state.get_cost(),
                best_cost
            );
            if let Some(Ok(params)) = state.get_best_param().map(|p| decode(p.as_slice())) {
                log_components(&params);
            }
        }

        Ok(())
    }
}

fn log_components(params: &MixtureParams) {
    for (k, ((mu, sigma), weight)) in params
        .mu_vec
        .iter()
        .zip(&params.sigma_vec)
        .zip(&params.weight_vec)
        .enumerate()
    {
        log::info!(
            "  component {}: mu=({:.4}, {:.4}) sigma=[[{:.4}, {:.4}], [{:.4}, {:.4}]] weight={:.4}",
            k,
            mu.x,
            mu.y,
            sigma[(0, 0)],
            sigma[(0, 1)],
            sigma[(1, 0)],
            sigma[(1, 1)],
            weight
        );
    }
}

fn optimizer_error(err: ArgminError) -> PsfFitError {
    PsfFitError::Optimizer(err.to_string())
}

/// Best point, iteration count and termination details of a finished run.
struct RunSummary {
    best_param: Vec<f64>,
    best_cost: f64,
    iterations: u64,
    converged: bool,
    termination: String,
}

fn summarize<S>(state: &S) -> Result<RunSummary>
where
    S: State<Param = Vec<f64>, Float = f64>,
{
    let best_param = state
        .get_best_param()
        .cloned()
        .ok_or_else(|| PsfFitError::Optimizer("solver returned no best parameter".to_string()))?;

    let (converged, termination) = match state.get_termination_status() {
        TerminationStatus::Terminated(reason) => (
            matches!(
                reason,
                TerminationReason::SolverConverged | TerminationReason::TargetCostReached
            ),
            format!("{reason:?}"),
        ),
        TerminationStatus::NotTerminated => (false, "NotTerminated".to_string()),
    };

    Ok(RunSummary {
        best_param,
        best_cost: state.get_best_cost(),
        iterations: state.get_iter(),
        converged,
        termination,
    })
}

/// Start point plus one vertex displaced by `step` along each axis.
fn initial_simplex(x0: &[f64], step: f64) -> Vec<Vec<f64>> {
    let mut simplex = Vec::with_capacity(x0.len() + 1);
    simplex.push(x0.to_vec());
    for i in 0..x0.len() {
        let mut vertex = x0.to_vec();
        vertex[i] += step;
        simplex.push(vertex);
    }
    simplex
}

fn run_nelder_mead(
    problem: SquaredResidual<'_>,
    x0: &[f64],
    config: &LeastSquaresConfig,
    observer: IterationObserver,
) -> Result<RunSummary> {
    let solver = NelderMead::new(initial_simplex(x0, config.simplex_step))
        .with_sd_tolerance(config.tolerance)
        .map_err(optimizer_error)?;

    let result = Executor::new(problem, solver)
        .configure(|state| state.max_iters(config.max_iterations))
        .add_observer(observer, ObserverMode::Always)
        .run()
        .map_err(optimizer_error)?;

    summarize(result.state())
}

fn run_lbfgs(
    problem: SquaredResidual<'_>,
    x0: &[f64],
    config: &LeastSquaresConfig,
    observer: IterationObserver,
) -> Result<RunSummary> {
    let linesearch = MoreThuenteLineSearch::new();
    let solver: LbfgsSolver = LBFGS::new(linesearch, config.lbfgs_memory)
        .with_tolerance_grad(config.tolerance)
        .map_err(optimizer_error)?;

    let result = Executor::new(problem, solver)
        .configure(|state| state.param(x0.to_vec()).max_iters(config.max_iterations))
        .add_observer(observer, ObserverMode::Always)
        .run()
        .map_err(optimizer_error)?;

    summarize(result.state())
}

/// Starting mixture used when the caller supplies none.
///
/// All `k` means sit at the intensity centroid; component `k` (1-based)
/// gets covariance `diag(√(2k), √(2k))` and every weight is `1/K`.
///
/// # Errors
/// `ShapeMismatch` when `locations` does not have the shape of `image`.
pub fn default_initial_params(
    image: &ArrayView2<f64>,
    locations: &Array2<Vector2<f64>>,
    k_tot: usize,
) -> Result<MixtureParams> {
    let centroid = intensity_centroid(image, locations)?;

    let sigma_vec = (1..=k_tot)
        .map(|k| {
            let spread = (2.0 * k as f64).sqrt();
            diagonal_matrix(spread, spread)
        })
        .collect();

    Ok(MixtureParams {
        mu_vec: vec![centroid; k_tot],
        sigma_vec,
        weight_vec: vec![1.0 / k_tot as f64; k_tot],
    })
}

/// Fit a `config.components`-Gaussian mixture to `image` by least squares.
///
/// Negative pixels are clamped to zero with a warning. When
/// `initial_params` is `None` the start point comes from
/// [`default_initial_params`]; otherwise it must have `config.components`
/// components. Reaching `config.max_iterations` is not an error: the best
/// point found is returned with `report.converged == false`.
pub fn fit_least_squares(
    image: &ArrayView2<f64>,
    initial_params: Option<&MixtureParams>,
    config: &LeastSquaresConfig,
) -> Result<LeastSquaresFit> {
    config.validate()?;
    validate_image(image)?;

    let image = clamp_negative(image);
    let (rows, cols) = image.dim();
    let locations = pixel_locations(rows, cols);

    let initial = match initial_params {
        Some(params) => {
            if params.len() != config.components {
                return Err(PsfFitError::InvalidArgument(format!(
                    "initial parameters have {} components, config expects {}",
                    params.len(),
                    config.components
                )));
            }
            params.clone()
        }
        None => default_initial_params(&image.view(), &locations, config.components)?,
    };
    let x0 = encode(&initial)?;

    let problem = SquaredResidual {
        image: &image,
        locations: &locations,
    };
    let initial_cost = problem.objective(x0.as_slice())?;

    log::debug!(
        "Least-squares PSF fit: method={}, K={}, image={}x{}, initial cost={:.6e}",
        config.method.name(),
        config.components,
        rows,
        cols,
        initial_cost
    );

    let history = Arc::new(Mutex::new(Vec::new()));
    let observer = IterationObserver {
        history: Arc::clone(&history),
        verbose: config.verbose,
    };

    let summary = match config.method {
        OptimizerMethod::NelderMead => run_nelder_mead(problem, &x0, config, observer)?,
        OptimizerMethod::Lbfgs => run_lbfgs(problem, &x0, config, observer)?,
    };

    if !summary.converged {
        log::warn!(
            "{} stopped after {} iterations without meeting tolerance {:e} ({})",
            config.method.name(),
            summary.iterations,
            config.tolerance,
            summary.termination
        );
    }

    let cost_history = history
        .lock()
        .map(|h| h.clone())
        .unwrap_or_default();

    let params = decode(summary.best_param.as_slice())?;

    log::debug!(
        "Least-squares PSF fit finished: iterations={}, converged={}, cost {:.6e} -> {:.6e}",
        summary.iterations,
        summary.converged,
        initial_cost,
        summary.best_cost
    );

    Ok(LeastSquaresFit {
        params,
        report: OptimizerReport {
            method: config.method,
            iterations: summary.iterations,
            converged: summary.converged,
            termination: summary.termination,
            initial_cost,
            best_cost: summary.best_cost,
            cost_history,
        },
    })
}

/// Reconstruct the raw PSF at frame location `(row, col)` and fit it.
pub fn fit_raw_psf(
    components: &RawPsfComponents,
    row: f64,
    col: f64,
    initial_params: Option<&MixtureParams>,
    config: &LeastSquaresConfig,
) -> Result<LeastSquaresFit> {
    let image = components.reconstruct(row, col);
    fit_least_squares(&image.view(), initial_params, config)
}
