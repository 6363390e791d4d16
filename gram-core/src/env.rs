use crate::{
    context::Context,
    error::{GramError, Result},
};
use candle_core::Tensor;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentDescription {
    pub observation_size: usize,
    pub action_size: usize,
    /// Number of actuated joints, which sizes the frozen joint one-hot.
    pub num_joints: usize,
    pub max_episode_length: usize,
}

impl EnvironmentDescription {
    pub fn context_size(&self) -> usize {
        Context::feature_size(self.num_joints)
    }
}

/// Result of stepping every instance of a vectorized environment once.
///
/// Instances that finished their episode are reset by the environment, so `observations` holds
/// the first observation of the next episode for them.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub observations: Tensor,
    pub rewards: Vec<f32>,
    pub terminated: Vec<bool>,
    /// Episode hit its time limit.
    pub truncated: Vec<bool>,
}

impl StepResult {
    pub fn dones(&self) -> Vec<bool> {
        self.terminated
            .iter()
            .zip(&self.truncated)
            .map(|(terminated, truncated)| *terminated || *truncated)
            .collect()
    }

    pub fn validate(&self, num_envs: usize, observation_size: usize) -> Result<()> {
        if self.observations.dims() != [num_envs, observation_size] {
            return Err(GramError::Environment(format!(
                "malformed observation batch: expected {:?}, got {:?}",
                [num_envs, observation_size],
                self.observations.dims()
            )));
        }
        for (name, len) in [
            ("rewards", self.rewards.len()),
            ("terminated", self.terminated.len()),
            ("truncated", self.truncated.len()),
        ] {
            if len != num_envs {
                return Err(GramError::Environment(format!(
                    "malformed {name}: expected {num_envs} entries, got {len}"
                )));
            }
        }
        if self.rewards.iter().any(|r| !r.is_finite()) {
            return Err(GramError::Environment("non-finite reward".to_owned()));
        }
        let observations: Vec<f32> = self.observations.flatten_all()?.to_vec1()?;
        if observations.iter().any(|o| !o.is_finite()) {
            return Err(GramError::Environment("non-finite observation".to_owned()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TerrainSettings {
    pub roughness_cm: f32,
    /// Positive values incline, negative values decline.
    pub slope_degrees: f32,
}

impl TerrainSettings {
    pub fn is_flat(&self) -> bool {
        self.roughness_cm == 0. && self.slope_degrees == 0.
    }
}

/// A batch of parallel simulation instances stepped in lockstep.
pub trait VecEnv {
    fn num_envs(&self) -> usize;

    fn env_description(&self) -> EnvironmentDescription;

    /// Resets every instance and returns the `[num_envs, observation_size]` observations.
    fn reset(&mut self) -> Result<Tensor>;

    fn step(&mut self, actions: &Tensor) -> Result<StepResult>;

    fn contexts(&self) -> Result<Vec<Context>>;

    /// Overrides the dynamics of the given instances. Takes effect on the next step.
    fn set_contexts(&mut self, env_ids: &[usize], contexts: &[Context]) -> Result<()>;

    fn set_terrain(&mut self, terrain: TerrainSettings) -> Result<()> {
        if terrain.is_flat() {
            Ok(())
        } else {
            Err(GramError::Environment(
                "environment does not support terrain settings".to_owned(),
            ))
        }
    }
}

impl<E: VecEnv + ?Sized> VecEnv for Box<E> {
    fn num_envs(&self) -> usize {
        (**self).num_envs()
    }

    fn env_description(&self) -> EnvironmentDescription {
        (**self).env_description()
    }

    fn reset(&mut self) -> Result<Tensor> {
        (**self).reset()
    }

    fn step(&mut self, actions: &Tensor) -> Result<StepResult> {
        (**self).step(actions)
    }

    fn contexts(&self) -> Result<Vec<Context>> {
        (**self).contexts()
    }

    fn set_contexts(&mut self, env_ids: &[usize], contexts: &[Context]) -> Result<()> {
        (**self).set_contexts(env_ids, contexts)
    }

    fn set_terrain(&mut self, terrain: TerrainSettings) -> Result<()> {
        (**self).set_terrain(terrain)
    }
}
