use super::{
    gae::compute_gae,
    mini_batching::{FlatRollout, MiniBatchGenerator},
};
use crate::error::{GramError, Result};
use candle_core::{Device, Tensor};

fn batch_dim(tensor: &Tensor) -> usize {
    tensor.dims().first().copied().unwrap_or(0)
}

/// One timestep recorded for every parallel instance.
#[derive(Debug, Clone)]
pub struct Transition {
    /// `[num_envs, observation_size]`
    pub observations: Tensor,
    /// Ground-truth context features, the privileged critic input and adaptation target source.
    pub contexts: Option<Tensor>,
    /// Observation/action history fed to the adaptation module.
    pub histories: Option<Tensor>,
    pub actions: Tensor,
    pub action_means: Tensor,
    pub action_stds: Tensor,
    pub rewards: Vec<f32>,
    pub dones: Vec<bool>,
    pub values: Vec<f32>,
    pub log_probs: Vec<f32>,
}

/// Fixed-horizon buffer of transitions for `num_envs` parallel instances.
#[derive(Debug)]
pub struct RolloutStorage {
    horizon: usize,
    num_envs: usize,
    device: Device,
    observations: Vec<Tensor>,
    contexts: Vec<Tensor>,
    histories: Vec<Tensor>,
    actions: Vec<Tensor>,
    action_means: Vec<Tensor>,
    action_stds: Vec<Tensor>,
    rewards: Vec<f32>,
    dones: Vec<bool>,
    values: Vec<f32>,
    log_probs: Vec<f32>,
    advantages: Option<Vec<f32>>,
    returns: Option<Vec<f32>>,
}

impl RolloutStorage {
    pub fn new(horizon: usize, num_envs: usize, device: Device) -> Self {
        Self {
            horizon,
            num_envs,
            device,
            observations: Vec::with_capacity(horizon),
            contexts: vec![],
            histories: vec![],
            actions: Vec::with_capacity(horizon),
            action_means: Vec::with_capacity(horizon),
            action_stds: Vec::with_capacity(horizon),
            rewards: Vec::with_capacity(horizon * num_envs),
            dones: Vec::with_capacity(horizon * num_envs),
            values: Vec::with_capacity(horizon * num_envs),
            log_probs: Vec::with_capacity(horizon * num_envs),
            advantages: None,
            returns: None,
        }
    }

    pub fn horizon(&self) -> usize {
        self.horizon
    }

    pub fn num_envs(&self) -> usize {
        self.num_envs
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Number of recorded timesteps.
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.horizon
    }

    pub fn rewards(&self) -> &[f32] {
        &self.rewards
    }

    pub fn dones(&self) -> &[bool] {
        &self.dones
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn advantages(&self) -> Option<&[f32]> {
        self.advantages.as_deref()
    }

    pub fn returns(&self) -> Option<&[f32]> {
        self.returns.as_deref()
    }

    fn check_len(&self, what: &'static str, len: usize) -> Result<()> {
        if len != self.num_envs {
            return Err(GramError::ShapeMismatch {
                what,
                expected: vec![self.num_envs],
                actual: vec![len],
            });
        }
        Ok(())
    }

    pub fn add_transition(&mut self, transition: Transition) -> Result<()> {
        if self.is_full() {
            return Err(GramError::StorageOverflow {
                horizon: self.horizon,
            });
        }
        self.check_len("transition observations", batch_dim(&transition.observations))?;
        self.check_len("transition actions", batch_dim(&transition.actions))?;
        self.check_len("transition rewards", transition.rewards.len())?;
        self.check_len("transition dones", transition.dones.len())?;
        self.check_len("transition values", transition.values.len())?;
        self.check_len("transition log probs", transition.log_probs.len())?;
        let step = self.len();
        let consistent = |stored: &[Tensor], new: &Option<Tensor>| match new {
            Some(_) => stored.len() == step,
            None => stored.is_empty(),
        };
        if !consistent(self.contexts.as_slice(), &transition.contexts)
            || !consistent(self.histories.as_slice(), &transition.histories)
        {
            return Err(GramError::Config(
                "transitions must either all carry contexts and histories or none".to_owned(),
            ));
        }
        if let Some(contexts) = &transition.contexts {
            self.check_len("transition contexts", batch_dim(&contexts))?;
        }
        if let Some(histories) = &transition.histories {
            self.check_len("transition histories", batch_dim(&histories))?;
        }
        self.contexts.extend(transition.contexts);
        self.histories.extend(transition.histories);
        self.observations.push(transition.observations);
        self.actions.push(transition.actions);
        self.action_means.push(transition.action_means);
        self.action_stds.push(transition.action_stds);
        self.rewards.extend(transition.rewards);
        self.dones.extend(transition.dones);
        self.values.extend(transition.values);
        self.log_probs.extend(transition.log_probs);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.observations.clear();
        self.contexts.clear();
        self.histories.clear();
        self.actions.clear();
        self.action_means.clear();
        self.action_stds.clear();
        self.rewards.clear();
        self.dones.clear();
        self.values.clear();
        self.log_probs.clear();
        self.advantages = None;
        self.returns = None;
    }

    fn ensure_full(&self) -> Result<()> {
        if !self.is_full() {
            return Err(GramError::StorageUnderfilled {
                filled: self.len(),
                horizon: self.horizon,
            });
        }
        Ok(())
    }

    /// Runs GAE over the stored horizon, bootstrapping the final step with `last_values`.
    pub fn compute_returns_and_advantages(
        &mut self,
        last_values: &[f32],
        gamma: f32,
        lambda: f32,
    ) -> Result<()> {
        self.ensure_full()?;
        self.check_len("bootstrap values", last_values.len())?;
        let (advantages, returns) = compute_gae(
            &self.rewards,
            &self.values,
            &self.dones,
            last_values,
            gamma,
            lambda,
        );
        self.advantages = Some(advantages);
        self.returns = Some(returns);
        Ok(())
    }

    pub fn normalize_advantages(&mut self) -> Result<()> {
        let Some(advantages) = self.advantages.as_mut() else {
            return Err(GramError::Config(
                "advantages must be computed before normalization".to_owned(),
            ));
        };
        let n = advantages.len() as f32;
        let mean = advantages.iter().sum::<f32>() / n;
        let variance = advantages.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / n;
        let std = variance.sqrt() + 1e-8;
        for x in advantages.iter_mut() {
            *x = (*x - mean) / std;
        }
        Ok(())
    }

    fn flatten(&self) -> Result<FlatRollout> {
        let n = self.rewards.len();
        let cat = |tensors: &[Tensor]| Tensor::cat(tensors, 0);
        let cat_opt = |tensors: &[Tensor]| (!tensors.is_empty()).then(|| cat(tensors)).transpose();
        let from_vec = |v: &[f32]| Tensor::from_slice(v, n, &self.device);
        Ok(FlatRollout {
            observations: cat(&self.observations)?,
            contexts: cat_opt(&self.contexts)?,
            histories: cat_opt(&self.histories)?,
            actions: cat(&self.actions)?,
            old_means: cat(&self.action_means)?,
            old_stds: cat(&self.action_stds)?,
            old_log_probs: from_vec(&self.log_probs)?,
            old_values: from_vec(&self.values)?,
            advantages: self.advantages.as_deref().map(from_vec).transpose()?,
            returns: self.returns.as_deref().map(from_vec).transpose()?,
        })
    }

    pub fn mini_batch_generator(
        &self,
        num_mini_batches: usize,
        num_epochs: usize,
    ) -> Result<MiniBatchGenerator> {
        self.ensure_full()?;
        MiniBatchGenerator::new(
            self.flatten()?,
            self.rewards.len(),
            num_mini_batches,
            num_epochs,
        )
    }
}
