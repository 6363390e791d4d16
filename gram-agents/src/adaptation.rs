use crate::{actor_critic::ActorCritic, policy::PolicyInput};
use gram_core::{GramError, Result, storage::RolloutStorage};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptationConfig {
    pub num_learning_epochs: usize,
    pub num_mini_batches: usize,
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        Self {
            num_learning_epochs: 5,
            num_mini_batches: 4,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdaptationStats {
    pub loss: f32,
    pub num_batches: usize,
}

/// Supervised fine-tuning of the adaptation module on rollouts collected through it.
pub struct AdaptationTrainer {
    pub config: AdaptationConfig,
}

impl AdaptationTrainer {
    pub fn new(config: AdaptationConfig) -> Self {
        Self { config }
    }

    pub fn update(
        &self,
        actor_critic: &mut ActorCritic,
        storage: &RolloutStorage,
    ) -> Result<AdaptationStats> {
        if !actor_critic.has_adaptation_module() {
            return Err(GramError::Config(format!(
                "{} has no adaptation module to fine-tune",
                actor_critic.algorithm()
            )));
        }
        let mut stats = AdaptationStats::default();
        let batches = storage.mini_batch_generator(
            self.config.num_mini_batches,
            self.config.num_learning_epochs,
        )?;
        for batch in batches {
            let batch = batch?;
            let loss = actor_critic.adaptation_loss(&PolicyInput::from(&batch))?;
            let value = loss.to_scalar::<f32>()?;
            if !value.is_finite() {
                return Err(GramError::NumericalInstability(format!(
                    "non-finite adaptation loss ({value}) after {} mini-batches",
                    stats.num_batches
                )));
            }
            actor_critic.update_adaptation(&loss)?;
            let n = stats.num_batches as f32;
            stats.loss = (stats.loss * n + value) / (n + 1.);
            stats.num_batches += 1;
        }
        Ok(stats)
    }
}
