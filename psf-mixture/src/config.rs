use serde::{Deserialize, Serialize};

use crate::codec::WEIGHT_MIN;
use crate::error::{PsfFitError, Result};

/// Minimizer driving the least-squares fit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OptimizerMethod {
    /// Derivative-free downhill simplex
    #[default]
    NelderMead,
    /// Limited-memory BFGS with forward-mode gradients
    Lbfgs,
}

impl OptimizerMethod {
    /// Human-readable method name for reports and logs
    pub fn name(&self) -> &'static str {
        match self {
            OptimizerMethod::NelderMead => "Nelder-Mead",
            OptimizerMethod::Lbfgs => "L-BFGS",
        }
    }
}

/// Configuration for the least-squares mixture fit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeastSquaresConfig {
    /// Number of Gaussian components K
    pub components: usize,
    /// Nelder-Mead: simplex cost standard deviation; L-BFGS: gradient norm
    pub tolerance: f64,
    /// Iteration ceiling for the optimizer
    pub max_iterations: u64,
    /// Which minimizer to run
    pub method: OptimizerMethod,
    /// Offset along each axis used to build the initial simplex
    pub simplex_step: f64,
    /// History size for L-BFGS
    pub lbfgs_memory: usize,
    /// Log objective and parameters at every iteration
    pub verbose: bool,
}

impl Default for LeastSquaresConfig {
    fn default() -> Self {
        Self {
            components: 2,
            tolerance: 1e-8,
            max_iterations: 5000,
            method: OptimizerMethod::NelderMead,
            simplex_step: 0.5,
            lbfgs_memory: 7,
            verbose: false,
        }
    }
}

impl LeastSquaresConfig {
    /// Default configuration with `components` Gaussians
    pub fn with_components(components: usize) -> Self {
        Self {
            components,
            ..Self::default()
        }
    }

    /// Check ranges of all fields
    pub fn validate(&self) -> Result<()> {
        if self.components == 0 {
            return Err(PsfFitError::InvalidConfig(
                "components must be at least 1".to_string(),
            ));
        }
        if 1.0 / self.components as f64 <= WEIGHT_MIN {
            return Err(PsfFitError::InvalidConfig(format!(
                "components must stay below {} so the default weight 1/K clears the weight floor {}, got {}",
                (1.0 / WEIGHT_MIN).round(),
                WEIGHT_MIN,
                self.components
            )));
        }
        if !(self.tolerance > 0.0) || !self.tolerance.is_finite() {
            return Err(PsfFitError::InvalidConfig(format!(
                "tolerance must be positive and finite, got {}",
                self.tolerance
            )));
        }
        if self.max_iterations == 0 {
            return Err(PsfFitError::InvalidConfig(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if !(self.simplex_step > 0.0) || !self.simplex_step.is_finite() {
            return Err(PsfFitError::InvalidConfig(format!(
                "simplex_step must be positive and finite, got {}",
                self.simplex_step
            )));
        }
        if self.lbfgs_memory == 0 {
            return Err(PsfFitError::InvalidConfig(
                "lbfgs_memory must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for the legacy three-component EM fit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmConfig {
    /// Stop once the change in mean squared error drops below this
    pub tolerance: f64,
    /// Iteration ceiling
    pub max_iterations: usize,
    /// Components whose updated weight falls to or below this are not updated
    pub min_component_weight: f64,
}

impl Default for EmConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-9,
            max_iterations: 500,
            min_component_weight: 1e-6,
        }
    }
}

impl EmConfig {
    /// Check ranges of all fields
    pub fn validate(&self) -> Result<()> {
        if !(self.tolerance > 0.0) || !self.tolerance.is_finite() {
            return Err(PsfFitError::InvalidConfig(format!(
                "tolerance must be positive and finite, got {}",
                self.tolerance
            )));
        }
        if self.max_iterations == 0 {
            return Err(PsfFitError::InvalidConfig(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if !(self.min_component_weight >= 0.0) || self.min_component_weight >= 1.0 {
            return Err(PsfFitError::InvalidConfig(format!(
                "min_component_weight must lie in [0, 1), got {}",
                self.min_component_weight
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(LeastSquaresConfig::default().validate().is_ok());
        assert!(EmConfig::default().validate().is_ok());
        assert_eq!(LeastSquaresConfig::default().method, OptimizerMethod::NelderMead);
    }

    #[test]
    fn test_invalid_least_squares_config() {
        let config = LeastSquaresConfig::with_components(0);
        assert!(matches!(config.validate(), Err(PsfFitError::InvalidConfig(_))));

        let config = LeastSquaresConfig {
            tolerance: -1.0,
            ..LeastSquaresConfig::default()
        };
        assert!(config.validate().is_err());

        let config = LeastSquaresConfig {
            simplex_step: f64::NAN,
            ..LeastSquaresConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_component_count_limited_by_weight_floor() {
        assert!(LeastSquaresConfig::with_components(19).validate().is_ok());
        let err = LeastSquaresConfig::with_components(20).validate().unwrap_err();
        assert!(matches!(err, PsfFitError::InvalidConfig(_)));
    }

    #[test]
    fn test_invalid_em_config() {
        let config = EmConfig {
            max_iterations: 0,
            ..EmConfig::default()
        };
        assert!(config.validate().is_err());

        let config = EmConfig {
            min_component_weight: 1.5,
            ..EmConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = LeastSquaresConfig {
            components: 3,
            method: OptimizerMethod::Lbfgs,
            ..LeastSquaresConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: LeastSquaresConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.components, 3);
        assert_eq!(parsed.method, OptimizerMethod::Lbfgs);
        assert_eq!(parsed.method.name(), "L-BFGS");
    }
}
