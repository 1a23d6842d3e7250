//! Differentiable scalar abstraction
//!
//! The codec and the mixture evaluator are written once against
//! [`PsfScalar`], which is implemented both by `f64` and by the forward-mode
//! dual number [`Dual64`]. Evaluating with `f64` gives plain values;
//! evaluating with `Dual64` carries one directional derivative alongside.

use nalgebra::Scalar;
use num_dual::{Dual64, DualNum};

/// Scalar type accepted by the codec and mixture evaluator.
///
/// Blanket-implemented for every copyable `DualNum<f64>` that nalgebra can
/// store, in particular `f64` and `Dual64`.
pub trait PsfScalar: DualNum<f64> + Scalar + Copy {}

impl<T> PsfScalar for T where T: DualNum<f64> + Scalar + Copy {}

/// Lift a constant into the scalar type.
#[inline]
pub fn constant<T: PsfScalar>(value: f64) -> T {
    T::from(value)
}

/// Value and gradient of `f` at `x` by forward-mode differentiation.
///
/// Runs one dual-number pass per coordinate, seeding the derivative part of
/// coordinate `i` with one and all others with zero.
pub fn forward_gradient<F, E>(x: &[f64], f: F) -> Result<(f64, Vec<f64>), E>
where
    F: Fn(&[Dual64]) -> Result<Dual64, E>,
{
    let mut value = f64::NAN;
    let mut grad = Vec::with_capacity(x.len());
    let mut seeded: Vec<Dual64> = x.iter().map(|&v| Dual64::new(v, 0.0)).collect();

    for i in 0..x.len() {
        seeded[i] = Dual64::new(x[i], 1.0);
        let out = f(&seeded)?;
        seeded[i] = Dual64::new(x[i], 0.0);

        value = out.re;
        grad.push(out.eps);
    }

    Ok((value, grad))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::convert::Infallible;

    fn rosenbrock<T: PsfScalar>(p: &[T]) -> T {
        let one = constant::<T>(1.0);
        let a = one - p[0];
        let b = p[1] - p[0] * p[0];
        a * a + constant::<T>(100.0) * b * b
    }

    #[test]
    fn test_constant_lifts_into_both_types() {
        let plain: f64 = constant(2.5);
        let dual: Dual64 = constant(2.5);
        assert_eq!(plain, 2.5);
        assert_eq!(dual.re, 2.5);
        assert_eq!(dual.eps, 0.0);
    }

    #[test]
    fn test_forward_gradient_matches_analytic() {
        let x = [-1.2, 1.0];
        let (value, grad) =
            forward_gradient(&x, |p| Ok::<_, Infallible>(rosenbrock(p))).unwrap();

        assert_relative_eq!(value, rosenbrock(&x), epsilon = 1e-12);
        // d/dx = -2(1-x) - 400x(y-x²), d/dy = 200(y-x²)
        let expected_dx = -2.0 * (1.0 - x[0]) - 400.0 * x[0] * (x[1] - x[0] * x[0]);
        let expected_dy = 200.0 * (x[1] - x[0] * x[0]);
        assert_relative_eq!(grad[0], expected_dx, epsilon = 1e-9);
        assert_relative_eq!(grad[1], expected_dy, epsilon = 1e-9);
    }

    #[test]
    fn test_forward_gradient_through_exp_and_ln() {
        let x = [0.3, 2.0];
        let (value, grad) = forward_gradient(&x, |p| {
            Ok::<_, Infallible>(p[0].exp() * p[1].ln() + p[1].sqrt())
        })
        .unwrap();

        assert_relative_eq!(value, 0.3f64.exp() * 2.0f64.ln() + 2.0f64.sqrt(), epsilon = 1e-12);
        assert_relative_eq!(grad[0], 0.3f64.exp() * 2.0f64.ln(), epsilon = 1e-12);
        assert_relative_eq!(grad[1], 0.3f64.exp() / 2.0 + 0.5 / 2.0f64.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn test_forward_gradient_propagates_errors() {
        let result = forward_gradient(&[1.0], |_| Err::<Dual64, _>("boom"));
        assert_eq!(result.unwrap_err(), "boom");
    }
}
