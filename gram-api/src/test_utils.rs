//! Small deterministic environments for exercising the runner without a simulator.

use candle_core::{Device, Tensor};
use gram_core::{
    GramError, Result,
    context::Context,
    env::{EnvironmentDescription, StepResult, TerrainSettings, VecEnv},
};
use rand::{Rng, SeedableRng, rngs::StdRng};

const DT: f32 = 0.1;
const POSITION_LIMIT: f32 = 5.;

/// `num_joints` independent point masses driven towards the origin. The context scales their
/// mass, damping and actuation, biases the commands and may freeze one of them.
pub struct PointMassEnv {
    num_envs: usize,
    num_joints: usize,
    max_episode_length: usize,
    positions: Vec<f32>,
    velocities: Vec<f32>,
    steps: Vec<usize>,
    contexts: Vec<Context>,
    terrain: TerrainSettings,
    rng: StdRng,
    device: Device,
}

impl PointMassEnv {
    pub fn new(num_envs: usize, num_joints: usize, max_episode_length: usize, seed: u64) -> Self {
        Self {
            num_envs,
            num_joints,
            max_episode_length,
            positions: vec![0.; num_envs * num_joints],
            velocities: vec![0.; num_envs * num_joints],
            steps: vec![0; num_envs],
            contexts: vec![Context::nominal(); num_envs],
            terrain: TerrainSettings::default(),
            rng: StdRng::seed_from_u64(seed),
            device: Device::Cpu,
        }
    }

    pub fn terrain(&self) -> TerrainSettings {
        self.terrain
    }

    fn reset_env(&mut self, env: usize) {
        let joints = env * self.num_joints..(env + 1) * self.num_joints;
        for idx in joints {
            self.positions[idx] = self.rng.random_range(-1.0f32..1.0);
            self.velocities[idx] = 0.;
        }
        self.steps[env] = 0;
    }

    fn observations(&self) -> Result<Tensor> {
        let obs: Vec<f32> = (0..self.num_envs)
            .flat_map(|env| {
                let joints = env * self.num_joints..(env + 1) * self.num_joints;
                self.positions[joints.clone()]
                    .iter()
                    .chain(&self.velocities[joints])
                    .copied()
                    .collect::<Vec<_>>()
            })
            .collect();
        Ok(Tensor::from_vec(
            obs,
            (self.num_envs, 2 * self.num_joints),
            &self.device,
        )?)
    }
}

impl VecEnv for PointMassEnv {
    fn num_envs(&self) -> usize {
        self.num_envs
    }

    fn env_description(&self) -> EnvironmentDescription {
        EnvironmentDescription {
            observation_size: 2 * self.num_joints,
            action_size: self.num_joints,
            num_joints: self.num_joints,
            max_episode_length: self.max_episode_length,
        }
    }

    fn reset(&mut self) -> Result<Tensor> {
        for env in 0..self.num_envs {
            self.reset_env(env);
        }
        self.observations()
    }

    fn step(&mut self, actions: &Tensor) -> Result<StepResult> {
        let actions: Vec<Vec<f32>> = actions.to_vec2()?;
        if actions.len() != self.num_envs {
            return Err(GramError::ShapeMismatch {
                what: "point mass actions",
                expected: vec![self.num_envs, self.num_joints],
                actual: vec![actions.len()],
            });
        }
        let slope_force = -self.terrain.slope_degrees.to_radians().sin();
        let mut rewards = Vec::with_capacity(self.num_envs);
        let mut terminated = Vec::with_capacity(self.num_envs);
        let mut truncated = Vec::with_capacity(self.num_envs);
        for (env, action) in actions.iter().enumerate() {
            let context = &self.contexts[env];
            let mass = 1. + 0.1 * context.added_mass;
            let damping = (0.1 * context.friction_mult).clamp(0., 1.);
            let mut cost = 0.;
            let mut out_of_bounds = false;
            for joint in 0..self.num_joints {
                let idx = env * self.num_joints + joint;
                let command = if context.frozen_joint == Some(joint) {
                    0.
                } else {
                    context.motor_strength_mult * (action[joint].clamp(-1., 1.) + context.joint_bias)
                };
                let bump = if self.terrain.roughness_cm > 0. {
                    self.rng.random_range(-1.0f32..1.0) * 0.01 * self.terrain.roughness_cm
                } else {
                    0.
                };
                let force = command + slope_force + bump;
                self.velocities[idx] = self.velocities[idx] * (1. - damping) + force / mass * DT;
                self.positions[idx] += self.velocities[idx] * DT;
                cost += self.positions[idx].powi(2);
                out_of_bounds |= self.positions[idx].abs() > POSITION_LIMIT;
            }
            self.steps[env] += 1;
            rewards.push(1. - cost / self.num_joints as f32);
            terminated.push(out_of_bounds);
            truncated.push(!out_of_bounds && self.steps[env] >= self.max_episode_length);
        }
        for env in 0..self.num_envs {
            if terminated[env] || truncated[env] {
                self.reset_env(env);
            }
        }
        Ok(StepResult {
            observations: self.observations()?,
            rewards,
            terminated,
            truncated,
        })
    }

    fn contexts(&self) -> Result<Vec<Context>> {
        Ok(self.contexts.clone())
    }

    fn set_contexts(&mut self, env_ids: &[usize], contexts: &[Context]) -> Result<()> {
        if env_ids.len() != contexts.len() {
            return Err(GramError::ShapeMismatch {
                what: "context assignment",
                expected: vec![env_ids.len()],
                actual: vec![contexts.len()],
            });
        }
        for (&env, context) in env_ids.iter().zip(contexts) {
            let Some(slot) = self.contexts.get_mut(env) else {
                return Err(GramError::Environment(format!(
                    "env id {env} out of range for {} instances",
                    self.num_envs
                )));
            };
            *slot = context.clone();
        }
        Ok(())
    }

    fn set_terrain(&mut self, terrain: TerrainSettings) -> Result<()> {
        self.terrain = terrain;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Failure {
    /// `step` returns an environment error.
    Error,
    /// `step` returns NaN observations.
    NanObservations,
}

/// Wraps an environment and breaks it after `fail_after` successful steps.
pub struct FailingEnv<E> {
    pub inner: E,
    pub fail_after: usize,
    pub failure: Failure,
    steps: usize,
}

impl<E: VecEnv> FailingEnv<E> {
    pub fn new(inner: E, fail_after: usize, failure: Failure) -> Self {
        Self {
            inner,
            fail_after,
            failure,
            steps: 0,
        }
    }
}

impl<E: VecEnv> VecEnv for FailingEnv<E> {
    fn num_envs(&self) -> usize {
        self.inner.num_envs()
    }

    fn env_description(&self) -> EnvironmentDescription {
        self.inner.env_description()
    }

    fn reset(&mut self) -> Result<Tensor> {
        self.inner.reset()
    }

    fn step(&mut self, actions: &Tensor) -> Result<StepResult> {
        let mut result = self.inner.step(actions)?;
        self.steps += 1;
        if self.steps <= self.fail_after {
            return Ok(result);
        }
        match self.failure {
            Failure::Error => Err(GramError::Environment(format!(
                "simulator crashed at step {}",
                self.steps
            ))),
            Failure::NanObservations => {
                result.observations = (result.observations * f64::NAN)?;
                Ok(result)
            }
        }
    }

    fn contexts(&self) -> Result<Vec<Context>> {
        self.inner.contexts()
    }

    fn set_contexts(&mut self, env_ids: &[usize], contexts: &[Context]) -> Result<()> {
        self.inner.set_contexts(env_ids, contexts)
    }

    fn set_terrain(&mut self, terrain: TerrainSettings) -> Result<()> {
        self.inner.set_terrain(terrain)
    }
}
