use crate::{
    checkpoint::{self, Checkpointer, FINAL_TAG},
    config::{TRAIN_CONFIG_FILE, TrainConfig},
    episodes::{EpisodeTracker, mean},
};
use candle_core::Device;
use gram_agents::{ActorCritic, ActorCriticBuilder, PolicyInput, actor_critic::ActorCriticDims};
use gram_core::{
    GramError, Result,
    context::{Context, ContextOverrides, ContextRanges, contexts_to_tensor},
    env::{TerrainSettings, VecEnv},
    history::ObservationHistory,
    rng::{self, with_rng},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentRegime {
    #[default]
    InDistribution,
    OutOfDistribution,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    /// Directory of a training run, holding `config.json` and `checkpoints/`.
    pub run_dir: PathBuf,
    pub checkpoint: String,
    pub regime: DeploymentRegime,
    pub overrides: ContextOverrides,
    pub terrain: TerrainSettings,
    pub num_steps: usize,
    pub seed: u64,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            run_dir: PathBuf::new(),
            checkpoint: FINAL_TAG.to_owned(),
            regime: DeploymentRegime::InDistribution,
            overrides: ContextOverrides::default(),
            terrain: TerrainSettings::default(),
            num_steps: 1000,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    pub ranges: ContextRanges,
    pub num_steps: usize,
    pub mean_step_reward: f32,
    pub episode_returns: Vec<f32>,
    pub episode_lengths: Vec<usize>,
    pub mean_episode_return: Option<f32>,
    pub mean_episode_length: Option<f32>,
}

/// Ranges a trained run is deployed under: the training ID or OOD ranges with `overrides`
/// applied on top.
pub fn deployment_ranges(
    train_config: &TrainConfig,
    regime: DeploymentRegime,
    overrides: &ContextOverrides,
) -> ContextRanges {
    let base = match regime {
        DeploymentRegime::InDistribution => train_config.id_ranges(),
        DeploymentRegime::OutOfDistribution => train_config.ood_ranges.clone(),
    };
    overrides.apply(&base)
}

/// Rolls out the deterministic policy on its deployment path for `num_steps` steps. Instances
/// draw a fresh context from `ranges` at the start of every episode.
pub fn evaluate_policy<E: VecEnv>(
    actor_critic: &mut ActorCritic,
    env: &mut E,
    ranges: &ContextRanges,
    terrain: TerrainSettings,
    num_steps: usize,
) -> Result<EvalReport> {
    let description = env.env_description();
    let num_envs = env.num_envs();
    let num_joints = description.num_joints;
    ranges.validate(num_joints)?;
    actor_critic.set_latent_source(actor_critic.deployment_source())?;
    let device = actor_critic.device().clone();
    let history_len = if actor_critic.has_adaptation_module() {
        actor_critic.dims().history_size / (description.observation_size + description.action_size)
    } else {
        0
    };

    env.set_terrain(terrain)?;
    let sample = |env_ids: &[usize]| -> Vec<Context> {
        with_rng(|rng| env_ids.iter().map(|_| ranges.sample(rng, num_joints)).collect())
    };
    let all: Vec<usize> = (0..num_envs).collect();
    let mut contexts = sample(&all);
    env.set_contexts(&all, &contexts)?;
    let mut observations = env.reset()?;
    let mut history = ObservationHistory::new(
        num_envs,
        history_len,
        description.observation_size,
        description.action_size,
    );
    let mut episodes = EpisodeTracker::new(num_envs);
    let mut reward_sum = 0f32;

    for _ in 0..num_steps {
        let input = PolicyInput {
            observations: observations.clone(),
            contexts: Some(contexts_to_tensor(&contexts, num_joints, &device)?),
            histories: if history_len > 0 {
                Some(history.as_tensor(&device)?)
            } else {
                None
            },
        };
        let actions = actor_critic.act_inference(&input)?;
        let step = env.step(&actions)?;
        step.validate(num_envs, description.observation_size)?;
        let dones = step.dones();
        reward_sum += step.rewards.iter().sum::<f32>();
        episodes.record(&step.rewards, &dones);
        if history_len > 0 {
            history.push(&observations, &actions)?;
        }
        let done_ids: Vec<usize> = dones
            .iter()
            .enumerate()
            .filter_map(|(env, done)| done.then_some(env))
            .collect();
        if !done_ids.is_empty() {
            history.reset_envs(&done_ids);
            let fresh = sample(&done_ids);
            env.set_contexts(&done_ids, &fresh)?;
            for (&id, context) in done_ids.iter().zip(fresh) {
                contexts[id] = context;
            }
        }
        observations = step.observations;
    }

    let (episode_returns, episode_lengths) = episodes.drain();
    let total_steps = (num_steps * num_envs).max(1);
    Ok(EvalReport {
        ranges: ranges.clone(),
        num_steps,
        mean_step_reward: reward_sum / total_steps as f32,
        mean_episode_return: mean(episode_returns.iter().copied()),
        mean_episode_length: mean(episode_lengths.iter().map(|len| *len as f32)),
        episode_returns,
        episode_lengths,
    })
}

/// Rebuilds the actor-critic of a training run and loads the checkpoint in `checkpoint_dir`.
pub fn load_actor_critic<E: VecEnv>(
    train_config: &TrainConfig,
    env: &E,
    checkpoint_dir: &Path,
    device: &Device,
) -> Result<ActorCritic> {
    let description = env.env_description();
    let dims = ActorCriticDims::new(&description, train_config.policy.history_len);
    let mut actor_critic =
        ActorCriticBuilder::new(train_config.algorithm, train_config.policy.clone(), dims)
            .build(device)?;
    checkpoint::load(checkpoint_dir, &mut actor_critic, None)?;
    Ok(actor_critic)
}

/// Evaluates a checkpoint of the run in `config.run_dir` under the requested regime.
pub fn evaluate_run<E: VecEnv>(config: &EvalConfig, env: &mut E) -> Result<EvalReport> {
    let train_config_path = config.run_dir.join(TRAIN_CONFIG_FILE);
    let raw = std::fs::read_to_string(&train_config_path)?;
    let train_config: TrainConfig = serde_json::from_str(&raw).map_err(|err| {
        GramError::Config(format!("{}: {err}", train_config_path.display()))
    })?;
    rng::seed(config.seed);
    let device = if train_config.use_cuda {
        Device::cuda_if_available(0)?
    } else {
        Device::Cpu
    };
    let checkpoint_dir = Checkpointer::new(&config.run_dir).checkpoint_dir(&config.checkpoint);
    let mut actor_critic = load_actor_critic(&train_config, env, &checkpoint_dir, &device)?;
    let ranges = deployment_ranges(&train_config, config.regime, &config.overrides);
    tracing::info!(
        run = %config.run_dir.display(),
        checkpoint = %config.checkpoint,
        regime = ?config.regime,
        "evaluating"
    );
    evaluate_policy(
        &mut actor_critic,
        env,
        &ranges,
        config.terrain,
        config.num_steps,
    )
}
