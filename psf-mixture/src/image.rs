//! PSF image preprocessing and intensity moments
//!
//! Pixel `(i, j)` of an `rows x cols` image sits at the centered coordinate
//! `(i - (rows - 1) / 2, j - (cols - 1) / 2)`. The first coordinate is the
//! row offset and the second the column offset, so an odd-sized image has
//! its central pixel at the origin.

use nalgebra::{Matrix2, Vector2};
use ndarray::{Array2, ArrayView2, Zip};

use crate::error::{PsfFitError, Result};

/// Reject empty images and images with non-finite pixels.
pub fn validate_image(image: &ArrayView2<f64>) -> Result<()> {
    if image.is_empty() {
        return Err(PsfFitError::InvalidArgument(format!(
            "PSF image must be non-empty, got shape {:?}",
            image.shape()
        )));
    }

    if let Some(((row, col), value)) = image.indexed_iter().find(|(_, v)| !v.is_finite()) {
        return Err(PsfFitError::InvalidArgument(format!(
            "PSF image has non-finite pixel {value} at ({row}, {col})"
        )));
    }

    Ok(())
}

/// Copy of `image` with negative pixels replaced by zero.
///
/// Logs a warning with the number of clamped pixels when any were negative.
pub fn clamp_negative(image: &ArrayView2<f64>) -> Array2<f64> {
    let mut n_negative = 0usize;
    let mut min_value = 0.0f64;

    let clamped = image.mapv(|v| {
        if v < 0.0 {
            n_negative += 1;
            min_value = min_value.min(v);
            0.0
        } else {
            v
        }
    });

    if n_negative > 0 {
        log::warn!(
            "Clamped {} negative PSF pixels to zero (minimum value {:.4e})",
            n_negative,
            min_value
        );
    }

    clamped
}

/// Centered coordinate of every pixel of a `rows x cols` image.
pub fn pixel_locations(rows: usize, cols: usize) -> Array2<Vector2<f64>> {
    let row_center = (rows as f64 - 1.0) / 2.0;
    let col_center = (cols as f64 - 1.0) / 2.0;

    Array2::from_shape_fn((rows, cols), |(i, j)| {
        Vector2::new(i as f64 - row_center, j as f64 - col_center)
    })
}

/// Total intensity (sum of all pixels)
pub fn total_intensity(image: &ArrayView2<f64>) -> f64 {
    image.sum()
}

fn check_grid(image: &ArrayView2<f64>, locations: &Array2<Vector2<f64>>) -> Result<()> {
    if image.shape() != locations.shape() {
        return Err(PsfFitError::ShapeMismatch(format!(
            "image shape {:?} does not match coordinate grid shape {:?}",
            image.shape(),
            locations.shape()
        )));
    }
    Ok(())
}

/// Intensity-weighted centroid in centered coordinates.
///
/// Returns the origin for an image with no positive flux.
///
/// # Errors
/// `ShapeMismatch` if `locations` and `image` differ in shape.
pub fn intensity_centroid(
    image: &ArrayView2<f64>,
    locations: &Array2<Vector2<f64>>,
) -> Result<Vector2<f64>> {
    check_grid(image, locations)?;

    let mut m1 = Vector2::zeros();
    Zip::from(image).and(locations).for_each(|&intensity, x| {
        m1 += x * intensity;
    });

    let m00 = total_intensity(image);
    if m00 < f64::EPSILON {
        return Ok(Vector2::zeros());
    }

    Ok(m1 / m00)
}

/// Intensity-weighted central second moment matrix.
///
/// Returns the zero matrix for an image with no positive flux.
///
/// # Errors
/// `ShapeMismatch` if `locations` and `image` differ in shape.
pub fn intensity_covariance(
    image: &ArrayView2<f64>,
    locations: &Array2<Vector2<f64>>,
) -> Result<Matrix2<f64>> {
    let centroid = intensity_centroid(image, locations)?;

    let mut m2 = Matrix2::zeros();
    Zip::from(image).and(locations).for_each(|&intensity, x| {
        let d = x - centroid;
        m2 += d * d.transpose() * intensity;
    });

    let m00 = total_intensity(image);
    if m00 < f64::EPSILON {
        return Ok(Matrix2::zeros());
    }

    Ok(m2 / m00)
}
