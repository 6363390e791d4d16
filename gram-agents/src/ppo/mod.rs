pub mod hooks;
pub mod losses;
pub mod lr_schedule;

use crate::policy::{PolicyInput, TrainablePolicy};
use gram_core::{GramError, Result, storage::RolloutStorage};
use hooks::{EmptyPpoHooks, HookResult, PpoHooks, process_hook_result};
use losses::{LossCoefficients, PpoLosses, compute_losses};
use lr_schedule::LrSchedule;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PpoConfig {
    pub num_learning_epochs: usize,
    pub num_mini_batches: usize,
    pub gamma: f32,
    pub lambda: f32,
    pub normalize_advantages: bool,
    pub coefficients: LossCoefficients,
    pub lr_schedule: LrSchedule,
}

impl Default for PpoConfig {
    fn default() -> Self {
        Self {
            num_learning_epochs: 5,
            num_mini_batches: 4,
            gamma: 0.99,
            lambda: 0.95,
            normalize_advantages: true,
            coefficients: LossCoefficients::default(),
            lr_schedule: LrSchedule::default(),
        }
    }
}

impl PpoConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_learning_epochs == 0 || self.num_mini_batches == 0 {
            return Err(GramError::Config(
                "ppo needs at least one epoch and one mini-batch".to_owned(),
            ));
        }
        if !(0. ..=1.).contains(&self.gamma) || !(0. ..=1.).contains(&self.lambda) {
            return Err(GramError::Config(format!(
                "gamma and lambda must lie in [0, 1], got {} and {}",
                self.gamma, self.lambda
            )));
        }
        if !(self.coefficients.clip_param > 0.) {
            return Err(GramError::Config("clip_param must be positive".to_owned()));
        }
        self.lr_schedule.validate()
    }
}

/// Running means over the mini-batches of one update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateStats {
    pub surrogate_loss: f32,
    pub value_loss: f32,
    pub entropy: f32,
    pub adaptation_loss: Option<f32>,
    pub consistency_loss: Option<f32>,
    pub kl: f32,
    pub learning_rate: f64,
    pub num_batches: usize,
}

impl UpdateStats {
    fn record(&mut self, losses: &PpoLosses, kl: f32) -> Result<()> {
        let n = self.num_batches as f32;
        let running = |mean: f32, value: f32| (mean * n + value) / (n + 1.);
        self.surrogate_loss = running(self.surrogate_loss, losses.surrogate.to_scalar::<f32>()?);
        self.value_loss = running(self.value_loss, losses.value.to_scalar::<f32>()?);
        self.entropy = running(self.entropy, losses.entropy.to_scalar::<f32>()?);
        if let Some(adaptation) = &losses.adaptation {
            let value = adaptation.to_scalar::<f32>()?;
            self.adaptation_loss = Some(running(self.adaptation_loss.unwrap_or(0.), value));
        }
        if let Some(consistency) = &losses.consistency {
            let value = consistency.to_scalar::<f32>()?;
            self.consistency_loss = Some(running(self.consistency_loss.unwrap_or(0.), value));
        }
        self.kl = running(self.kl, kl);
        self.num_batches += 1;
        Ok(())
    }
}

/// Clipped PPO over a full rollout, generic over the policy being optimized.
pub struct Ppo {
    pub config: PpoConfig,
    pub hooks: Box<dyn PpoHooks>,
}

impl Ppo {
    pub fn new(config: PpoConfig) -> Self {
        Self {
            config,
            hooks: Box::new(EmptyPpoHooks),
        }
    }

    pub fn with_hooks(mut self, hooks: impl PpoHooks + 'static) -> Self {
        self.hooks = Box::new(hooks);
        self
    }

    /// Computes returns and advantages in place, bootstrapping with `last_values`.
    pub fn prepare(&self, storage: &mut RolloutStorage, last_values: &[f32]) -> Result<()> {
        storage.compute_returns_and_advantages(last_values, self.config.gamma, self.config.lambda)?;
        if self.config.normalize_advantages {
            storage.normalize_advantages()?;
        }
        Ok(())
    }

    /// Losses of the current policy on one mini-batch. Both the actor-critic and the adversary
    /// go through here.
    pub fn batch_losses<P: TrainablePolicy>(
        &self,
        policy: &P,
        batch: &gram_core::storage::MiniBatch,
    ) -> Result<PpoLosses> {
        let evaluation = policy.evaluate(&PolicyInput::from(batch), &batch.actions)?;
        compute_losses(&self.config.coefficients, &evaluation, batch)
    }

    /// Runs `num_learning_epochs x num_mini_batches` optimizer steps on a storage whose returns
    /// were computed by [`Ppo::prepare`], then applies the learning rate schedule.
    ///
    /// A non-finite KL or loss aborts the update before the offending step is applied.
    pub fn update<P: TrainablePolicy>(
        &mut self,
        policy: &mut P,
        storage: &RolloutStorage,
    ) -> Result<UpdateStats> {
        let mut stats = UpdateStats {
            learning_rate: policy.learning_rate(),
            ..Default::default()
        };
        process_hook_result!(self.hooks.before_learning_hook(storage), stats);
        let batches = storage.mini_batch_generator(
            self.config.num_mini_batches,
            self.config.num_learning_epochs,
        )?;
        for batch in batches {
            let batch = batch?;
            let losses = self.batch_losses(policy, &batch)?;
            let kl = losses.kl.to_scalar::<f32>()?;
            if !kl.is_finite() {
                return Err(GramError::NumericalInstability(format!(
                    "non-finite kl divergence ({kl}) after {} mini-batches",
                    stats.num_batches
                )));
            }
            let total = losses.total.to_scalar::<f32>()?;
            if !total.is_finite() {
                return Err(GramError::NumericalInstability(format!(
                    "non-finite loss ({total}) after {} mini-batches",
                    stats.num_batches
                )));
            }
            policy.update(&losses.total)?;
            stats.record(&losses, kl)?;
            match self.hooks.batch_hook(&losses, kl)? {
                HookResult::Continue => {}
                HookResult::Break => break,
            }
        }
        let learning_rate = self
            .config
            .lr_schedule
            .next_lr(policy.learning_rate(), stats.kl);
        policy.set_learning_rate(learning_rate);
        stats.learning_rate = learning_rate;
        Ok(stats)
    }
}
