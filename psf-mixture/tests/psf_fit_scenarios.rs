//! End-to-end PSF fitting scenarios

use approx::assert_relative_eq;
use nalgebra::{Matrix2, Vector2};
use ndarray::{Array1, Array2, Array3};
use psf_mixture::{
    evaluate_psf, fit_least_squares, fit_psf, fit_raw_psf, pixel_locations, render_params,
    render_psf, EmConfig, FitStrategy, LeastSquaresConfig, MixtureParams, PsfComponent, PsfFit,
    RawPsfComponents,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn elliptical_gaussian() -> MixtureParams {
    MixtureParams {
        mu_vec: vec![Vector2::new(0.25, -0.15)],
        sigma_vec: vec![Matrix2::new(1.8, 0.3, 0.3, 1.2)],
        weight_vec: vec![20.0],
    }
}

fn relative_error(model: &Array2<f64>, image: &Array2<f64>) -> f64 {
    let residual: f64 = model
        .iter()
        .zip(image.iter())
        .map(|(m, p)| (m - p).powi(2))
        .sum();
    let norm: f64 = image.iter().map(|p| p * p).sum();
    (residual / norm).sqrt()
}

#[test]
fn test_two_component_fit_of_point_source() {
    init_logging();

    let mut image = Array2::zeros((5, 5));
    image[[2, 2]] = 10.0;

    let config = LeastSquaresConfig::with_components(2);
    let fit = fit_least_squares(&image.view(), None, &config).unwrap();

    println!(
        "point source fit: {} iterations, cost {:.4e} -> {:.4e}",
        fit.report.iterations, fit.report.initial_cost, fit.report.best_cost
    );

    assert_eq!(fit.params.len(), 2);
    assert!(fit.report.best_cost < fit.report.initial_cost);
    assert!(fit.params.weight_vec.iter().all(|&w| w > 0.05));

    // The covariance floor caps the peak density, so the fit spends more
    // total weight than the single bright pixel holds
    let total_weight = fit.params.total_weight();
    assert!(
        total_weight > 10.0 && total_weight < 16.0,
        "total weight {total_weight}"
    );

    let dominant = (0..2)
        .max_by(|&a, &b| fit.params.weight_vec[a].total_cmp(&fit.params.weight_vec[b]))
        .unwrap();
    assert!(fit.params.mu_vec[dominant].norm() < 0.5);

    // The fitted model still peaks on the central pixel
    let model = render_params(&fit.params, &pixel_locations(5, 5));
    let (peak_index, _) = model
        .indexed_iter()
        .fold(((0, 0), f64::NEG_INFINITY), |best, (idx, &v)| {
            if v > best.1 {
                (idx, v)
            } else {
                best
            }
        });
    assert_eq!(peak_index, (2, 2));
}

#[test]
fn test_negative_pixels_do_not_change_fit() {
    init_logging();

    let clean = render_params(&elliptical_gaussian(), &pixel_locations(9, 9));
    let mut noisy = clean.clone();
    noisy[[0, 0]] = -0.4;
    noisy[[8, 1]] = -1e-3;
    let mut zeroed = clean;
    zeroed[[0, 0]] = 0.0;
    zeroed[[8, 1]] = 0.0;

    let config = LeastSquaresConfig {
        components: 1,
        max_iterations: 300,
        ..LeastSquaresConfig::default()
    };
    let a = fit_least_squares(&noisy.view(), None, &config).unwrap();
    let b = fit_least_squares(&zeroed.view(), None, &config).unwrap();

    assert_eq!(a, b);
}

#[test]
fn test_least_squares_model_evaluates_at_sub_pixel_offsets() {
    init_logging();

    let truth = elliptical_gaussian();
    let image = render_params(&truth, &pixel_locations(11, 11));

    let config = LeastSquaresConfig {
        components: 1,
        tolerance: 1e-12,
        max_iterations: 20_000,
        ..LeastSquaresConfig::default()
    };
    let fit = fit_psf(&image.view(), &FitStrategy::LeastSquares(config)).unwrap();
    assert!(matches!(fit, PsfFit::LeastSquares(_)));

    let fitted = PsfComponent::from_params(&fit.params()).unwrap();
    let exact = PsfComponent::from_params(&truth).unwrap();
    for x in [
        Vector2::new(0.0, 0.0),
        Vector2::new(0.37, -0.81),
        Vector2::new(-1.25, 0.5),
    ] {
        assert_relative_eq!(
            evaluate_psf(&fitted, &x),
            evaluate_psf(&exact, &x),
            epsilon = 1e-2
        );
    }
}

#[test]
fn test_em_strategy_reproduces_image() {
    init_logging();

    let image = render_params(&elliptical_gaussian(), &pixel_locations(15, 15));
    let fit = fit_psf(&image.view(), &FitStrategy::Em(EmConfig::default())).unwrap();

    let PsfFit::Em(em) = &fit else {
        panic!("expected an EM fit");
    };
    assert_relative_eq!(em.total_mass, image.sum(), epsilon = 1e-12);

    let params = fit.params();
    assert_eq!(params.len(), 3);
    assert_relative_eq!(
        params.total_weight(),
        em.scale * em.total_mass,
        max_relative = 1e-12
    );

    let components = PsfComponent::from_params(&params).unwrap();
    let model = render_psf(&components, 15, 15, &Vector2::zeros());
    let error = relative_error(&model, &image);
    assert!(error < 0.05, "relative model error {error}");
}

#[test]
fn test_raw_psf_reconstruct_and_fit() {
    init_logging();

    let truth = elliptical_gaussian();
    let (rnrow, rncol) = (9, 9);
    let stamp = render_params(&truth, &pixel_locations(rnrow, rncol));

    // Eigenimage 0 is the stamp, eigenimage 1 a flat pedestal whose weight
    // vanishes at frame row 1
    let flat: Array1<f64> = stamp.t().iter().cloned().collect();
    let mut eigenimages = Array2::zeros((rnrow * rncol, 2));
    eigenimages.column_mut(0).assign(&flat);
    eigenimages.column_mut(1).fill(1.0);

    let mut coefficients = Array3::zeros((2, 1, 2));
    coefficients[[0, 0, 0]] = 1.0;
    coefficients[[1, 0, 1]] = 1.0;

    let components = RawPsfComponents::new(eigenimages, rnrow, rncol, coefficients).unwrap();
    let reconstructed = components.reconstruct(1.0, 640.0);
    for (a, b) in reconstructed.iter().zip(stamp.iter()) {
        assert_relative_eq!(*a, *b, epsilon = 1e-14);
    }

    let config = LeastSquaresConfig {
        components: 1,
        tolerance: 1e-12,
        max_iterations: 20_000,
        ..LeastSquaresConfig::default()
    };
    let fit = fit_raw_psf(&components, 1.0, 640.0, None, &config).unwrap();
    assert_relative_eq!(fit.params.mu_vec[0], truth.mu_vec[0], epsilon = 1e-2);
    assert_relative_eq!(fit.params.weight_vec[0], truth.weight_vec[0], epsilon = 5e-2);
}
