use gram_core::{GramError, Result};
use serde::{Deserialize, Serialize};

/// Per-iteration learning rate rule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LrSchedule {
    Fixed,
    /// Trust-region heuristic on the mean KL divergence of the last update: the learning rate
    /// shrinks by `factor` when the KL exceeds `desired_kl * 1.5` and grows by `factor` when it
    /// falls below `desired_kl / 1.5`, always staying within `[min_lr, max_lr]`.
    Adaptive {
        desired_kl: f32,
        factor: f64,
        min_lr: f64,
        max_lr: f64,
    },
}

impl Default for LrSchedule {
    fn default() -> Self {
        Self::adaptive(0.01)
    }
}

impl LrSchedule {
    pub fn adaptive(desired_kl: f32) -> Self {
        Self::Adaptive {
            desired_kl,
            factor: 1.5,
            min_lr: 1e-5,
            max_lr: 1e-2,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let Self::Adaptive {
            desired_kl,
            factor,
            min_lr,
            max_lr,
        } = *self
        else {
            return Ok(());
        };
        if !(desired_kl > 0.) || !desired_kl.is_finite() {
            return Err(GramError::Config(format!(
                "desired_kl must be positive, got {desired_kl}"
            )));
        }
        if !(factor > 1.) || !factor.is_finite() {
            return Err(GramError::Config(format!(
                "lr schedule factor must be greater than 1, got {factor}"
            )));
        }
        if !(min_lr > 0.) || !(min_lr <= max_lr) || !max_lr.is_finite() {
            return Err(GramError::Config(format!(
                "lr bounds must satisfy 0 < min_lr <= max_lr, got [{min_lr}, {max_lr}]"
            )));
        }
        Ok(())
    }

    /// Rejects a starting learning rate the schedule would clamp on its first step.
    pub fn check_learning_rate(&self, learning_rate: f64) -> Result<()> {
        match *self {
            Self::Adaptive { min_lr, max_lr, .. } if !(min_lr..=max_lr).contains(&learning_rate) => {
                Err(GramError::Config(format!(
                    "learning_rate {learning_rate} lies outside the schedule bounds [{min_lr}, {max_lr}]"
                )))
            }
            _ => Ok(()),
        }
    }

    pub fn next_lr(&self, learning_rate: f64, kl: f32) -> f64 {
        match *self {
            Self::Fixed => learning_rate,
            Self::Adaptive {
                desired_kl,
                factor,
                min_lr,
                max_lr,
            } => {
                if kl > desired_kl * 1.5 {
                    (learning_rate / factor).max(min_lr)
                } else if kl < desired_kl / 1.5 && kl > 0. {
                    (learning_rate * factor).min(max_lr)
                } else {
                    learning_rate
                }
            }
        }
    }
}
