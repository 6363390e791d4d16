// config + runner + checkpoints + evaluation entry points
pub mod checkpoint;
pub mod config;
pub mod episodes;
pub mod evaluation;
pub mod hooks;
pub mod logging;
pub mod runner;
#[cfg(feature = "test-utils")]
pub mod test_utils;

use anyhow::Context as _;
use candle_core::Device;
use checkpoint::Checkpointer;
use config::{TRAIN_CONFIG_FILE, TrainConfig};
use evaluation::{EvalConfig, EvalReport};
use gram_core::{env::VecEnv, rng};
use hooks::{LoggingHooks, RunnerHooks};
use runner::{OnPolicyRunner, TrainSummary};

pub fn select_device(use_cuda: bool) -> anyhow::Result<Device> {
    if use_cuda {
        Ok(Device::cuda_if_available(0)?)
    } else {
        Ok(Device::Cpu)
    }
}

/// Trains `config.algorithm` on `env`, logging through `tracing`, and writes the config copy and
/// checkpoints into [`TrainConfig::run_dir`].
pub fn train<E: VecEnv>(config: &TrainConfig, env: E) -> anyhow::Result<TrainSummary> {
    train_with_hooks(config, env, LoggingHooks::default())
}

pub fn train_with_hooks<E: VecEnv, H: RunnerHooks>(
    config: &TrainConfig,
    env: E,
    hooks: H,
) -> anyhow::Result<TrainSummary> {
    config
        .validate(env.env_description().num_joints)
        .context("invalid train config")?;
    if config.ood_ratio > 0. && !config.algorithm.uses_adversary() {
        tracing::warn!(
            algorithm = %config.algorithm,
            ood_ratio = config.ood_ratio,
            "variant has no adversary, every iteration collects in distribution"
        );
    }
    rng::seed(config.seed);
    let device = select_device(config.use_cuda)?;
    let run_dir = config.run_dir();
    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("creating run directory {}", run_dir.display()))?;
    config.save(run_dir.join(TRAIN_CONFIG_FILE))?;
    tracing::info!(run_dir = %run_dir.display(), algorithm = %config.algorithm, seed = config.seed, "run configured");
    let mut runner = OnPolicyRunner::new(config, env, hooks, device)
        .context("building runner")?
        .with_checkpointer(Checkpointer::new(run_dir));
    let summary = runner.run().context("training")?;
    Ok(summary)
}

/// Loads a trained checkpoint and rolls it out deterministically under `config.regime`.
pub fn evaluate<E: VecEnv>(config: &EvalConfig, env: &mut E) -> anyhow::Result<EvalReport> {
    let report = evaluation::evaluate_run(config, env).with_context(|| {
        format!(
            "evaluating checkpoint {} of {}",
            config.checkpoint,
            config.run_dir.display()
        )
    })?;
    tracing::info!(
        mean_step_reward = report.mean_step_reward,
        episodes = report.episode_returns.len(),
        mean_episode_return = report.mean_episode_return,
        "evaluation finished"
    );
    Ok(report)
}
