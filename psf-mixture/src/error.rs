use thiserror::Error;

use crate::matrix2::SingularMatrixError;

/// Errors produced while encoding, evaluating or fitting PSF mixtures.
#[derive(Error, Debug)]
pub enum PsfFitError {
    /// `sigma - sigma_min` of a component is not symmetric positive definite.
    #[error("covariance of component {component} is not positive definite above the floor")]
    NonPositiveDefinite {
        /// Index of the offending component.
        component: usize,
    },

    /// A component weight is at or below the weight floor.
    #[error("weight {weight:.6e} of component {component} is not above the floor {floor}")]
    WeightBelowFloor {
        /// Index of the offending component.
        component: usize,
        /// Supplied weight.
        weight: f64,
        /// Weight floor.
        floor: f64,
    },

    /// Unconstrained vector length is not a positive multiple of the block size.
    #[error("unconstrained vector length {len} is not a positive multiple of {block}")]
    InvalidVectorLength {
        /// Supplied length.
        len: usize,
        /// Values per component.
        block: usize,
    },

    /// Array shapes that have to agree do not.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration validation failure.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Covariance could not be inverted.
    #[error(transparent)]
    Singular(#[from] SingularMatrixError),

    /// The fit produced a NaN and was aborted.
    #[error("numerical divergence: fit error became NaN at iteration {iteration}")]
    NumericalDivergence {
        /// Iteration at which the NaN appeared (1-based).
        iteration: usize,
    },

    /// The optimizer backend failed.
    #[error("optimizer failed: {0}")]
    Optimizer(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PsfFitError>;
