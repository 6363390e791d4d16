//! The on-policy runner: collects rollouts and dispatches updates according to the
//! [`RunnerContext`] schedule.
//!
//! RL iterations alternate between in-distribution collection, where contexts are resampled from
//! the ID ranges whenever an episode ends, and out-of-distribution collection, where the
//! adversary picks one context per instance for the whole rollout. Both are followed by a PPO
//! update of the actor-critic. Variants with an adaptation module may then fine-tune it on
//! rollouts collected through the adaptive path.

mod schedule;

pub use schedule::{RunnerContext, RunnerPhase};

use crate::{
    checkpoint::{Checkpointer, FINAL_TAG, iteration_tag},
    config::TrainConfig,
    episodes::{EpisodeTracker, mean},
    hooks::{CollectStats, RunnerHooks},
};
use candle_core::{Device, Tensor};
use gram_agents::{
    ActionSample, ActorCritic, ActorCriticBuilder, Adversary, LatentSource, PolicyInput, Ppo,
    TrainablePolicy, UpdateStats,
    actor_critic::ActorCriticDims,
    adaptation::AdaptationTrainer,
};
use gram_core::{
    GramError, Result,
    context::{Context, ContextRanges, contexts_to_tensor},
    env::{EnvironmentDescription, VecEnv},
    history::ObservationHistory,
    rng::with_rng,
    storage::{RolloutStorage, Transition},
};
use std::path::PathBuf;

#[derive(Debug, Clone, Default)]
pub struct TrainSummary {
    pub iterations: usize,
    pub adaptation_iterations: usize,
    pub last_update: Option<UpdateStats>,
    pub final_checkpoint: Option<PathBuf>,
}

/// The adversary's pending one-step episode, completed once the OOD rollout it chose is done.
struct AdversaryChoice {
    states: Tensor,
    sample: ActionSample,
}

pub struct OnPolicyRunner<E: VecEnv, H: RunnerHooks> {
    pub env: E,
    pub actor_critic: ActorCritic,
    pub adversary: Option<Adversary>,
    pub ppo: Ppo,
    pub adversary_ppo: Ppo,
    pub adaptation_trainer: AdaptationTrainer,
    pub context: RunnerContext,
    pub hooks: H,
    checkpointer: Option<Checkpointer>,
    save_interval: usize,
    bootstrap_timeouts: bool,
    id_ranges: ContextRanges,
    description: EnvironmentDescription,
    device: Device,
    storage: RolloutStorage,
    adversary_storage: RolloutStorage,
    history: ObservationHistory,
    episodes: EpisodeTracker,
    observations: Tensor,
    contexts: Vec<Context>,
    contexts_are_ood: bool,
    pending_choice: Option<AdversaryChoice>,
    performance: Vec<f32>,
    last_values: Vec<f32>,
    last_update: Option<UpdateStats>,
}

impl<E: VecEnv, H: RunnerHooks> OnPolicyRunner<E, H> {
    /// Builds the networks for `config.algorithm`, resets `env` and assigns every instance an
    /// in-distribution context.
    pub fn new(config: &TrainConfig, mut env: E, hooks: H, device: Device) -> Result<Self> {
        let description = env.env_description();
        let num_envs = env.num_envs();
        if num_envs == 0 {
            return Err(GramError::Config(
                "environment has no instances".to_owned(),
            ));
        }
        config.validate(description.num_joints)?;
        let dims = ActorCriticDims::new(&description, config.policy.history_len);
        let actor_critic = ActorCriticBuilder::new(config.algorithm, config.policy.clone(), dims)
            .build(&device)?;
        let adversary = config
            .algorithm
            .uses_adversary()
            .then(|| Adversary::new(&config.adversary, config.ood_ranges.clone(), &device))
            .transpose()?;
        let context = RunnerContext::new(
            config.algorithm,
            config.max_iterations,
            config.finetune_iterations,
            config.ood_ratio,
        );
        let observations = env.reset()?;
        let mut runner = Self {
            actor_critic,
            adversary,
            ppo: Ppo::new(config.ppo.clone()),
            adversary_ppo: Ppo::new(config.adversary.ppo.clone()),
            adaptation_trainer: AdaptationTrainer::new(config.adaptation.clone()),
            context,
            hooks,
            checkpointer: None,
            save_interval: config.run.save_interval,
            bootstrap_timeouts: config.bootstrap_timeouts,
            id_ranges: config.id_ranges(),
            description,
            storage: RolloutStorage::new(config.num_steps_per_env, num_envs, device.clone()),
            adversary_storage: RolloutStorage::new(
                config.adversary.update_interval,
                num_envs,
                device.clone(),
            ),
            history: ObservationHistory::new(
                num_envs,
                config.policy.history_len,
                description.observation_size,
                description.action_size,
            ),
            episodes: EpisodeTracker::new(num_envs),
            observations,
            contexts: vec![Context::nominal(); num_envs],
            contexts_are_ood: false,
            pending_choice: None,
            performance: vec![0.; num_envs],
            last_values: vec![0.; num_envs],
            last_update: None,
            device,
            env,
        };
        let all: Vec<usize> = (0..num_envs).collect();
        runner.resample_contexts(&all)?;
        Ok(runner)
    }

    pub fn with_checkpointer(mut self, checkpointer: Checkpointer) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    pub fn num_envs(&self) -> usize {
        self.contexts.len()
    }

    /// The contexts currently applied to each instance.
    pub fn contexts(&self) -> &[Context] {
        &self.contexts
    }

    pub fn storage(&self) -> &RolloutStorage {
        &self.storage
    }

    /// Mean per-step reward of every instance over the last rollout.
    pub fn performance(&self) -> &[f32] {
        &self.performance
    }

    pub fn run(&mut self) -> Result<TrainSummary> {
        if self.hooks.init_hook(&self.context) {
            self.context.finish();
        }
        while !self.context.is_finished() {
            let phase = self.context.phase;
            let stop = self.run_phase(phase)?;
            self.context.advance();
            if phase == RunnerPhase::UpdateRobust
                && self.save_interval > 0
                && self.context.iteration % self.save_interval == 0
            {
                self.save(&iteration_tag(self.context.iteration))?;
            }
            if stop {
                self.context.finish();
            }
        }
        let final_checkpoint = self.save(FINAL_TAG)?;
        self.hooks.shutdown_hook(&self.context)?;
        Ok(TrainSummary {
            iterations: self.context.iteration,
            adaptation_iterations: self.context.adaptation_iteration,
            last_update: self.last_update.clone(),
            final_checkpoint,
        })
    }

    /// Executes one phase and returns whether a hook asked to stop.
    pub fn run_phase(&mut self, phase: RunnerPhase) -> Result<bool> {
        match phase {
            RunnerPhase::CollectId => self.collect_id(),
            RunnerPhase::CollectOod => self.collect_ood(),
            RunnerPhase::UpdateRobust => self.update_robust(),
            RunnerPhase::CollectAdapt => self.collect_adapt(),
            RunnerPhase::UpdateAdapt => self.update_adapt(),
            RunnerPhase::Finished => Ok(true),
        }
    }

    fn save(&self, tag: &str) -> Result<Option<PathBuf>> {
        self.checkpointer
            .as_ref()
            .map(|checkpointer| {
                checkpointer.save(
                    tag,
                    &self.actor_critic,
                    self.adversary.as_ref(),
                    &self.context,
                )
            })
            .transpose()
    }

    fn apply_contexts(&mut self, env_ids: &[usize], contexts: Vec<Context>) -> Result<()> {
        self.env.set_contexts(env_ids, &contexts)?;
        for (&env, context) in env_ids.iter().zip(contexts) {
            self.contexts[env] = context;
        }
        Ok(())
    }

    fn resample_contexts(&mut self, env_ids: &[usize]) -> Result<()> {
        let num_joints = self.description.num_joints;
        let contexts = with_rng(|rng| {
            env_ids
                .iter()
                .map(|_| self.id_ranges.sample(rng, num_joints))
                .collect()
        });
        self.apply_contexts(env_ids, contexts)
    }

    /// Switching back from an OOD rollout puts every instance back on ID contexts.
    fn restore_id_contexts(&mut self) -> Result<()> {
        if self.contexts_are_ood {
            let all: Vec<usize> = (0..self.num_envs()).collect();
            self.resample_contexts(&all)?;
            self.contexts_are_ood = false;
        }
        Ok(())
    }

    fn policy_input(&self) -> Result<PolicyInput> {
        let histories = if self.actor_critic.has_adaptation_module() {
            Some(self.history.as_tensor(&self.device)?)
        } else {
            None
        };
        Ok(PolicyInput {
            observations: self.observations.clone(),
            contexts: Some(contexts_to_tensor(
                &self.contexts,
                self.description.num_joints,
                &self.device,
            )?),
            histories,
        })
    }

    fn collect_id(&mut self) -> Result<bool> {
        let source = if self.context.algorithm.adaptive_id_collection() {
            LatentSource::Adaptation
        } else {
            LatentSource::Context
        };
        self.actor_critic.set_latent_source(source)?;
        self.restore_id_contexts()?;
        self.collect()
    }

    fn collect_ood(&mut self) -> Result<bool> {
        self.actor_critic.set_latent_source(LatentSource::Context)?;
        let Some(adversary) = &self.adversary else {
            return Err(GramError::Config(format!(
                "{} has no adversary to collect out-of-distribution rollouts",
                self.context.algorithm
            )));
        };
        let states = adversary.state(&self.contexts, &self.performance)?;
        let sample = adversary.act(&PolicyInput::observations(states.clone()))?;
        let contexts = adversary.contexts_from_actions(&sample.actions, self.description.num_joints)?;
        let all: Vec<usize> = (0..self.num_envs()).collect();
        self.apply_contexts(&all, contexts)?;
        self.contexts_are_ood = true;
        self.pending_choice = Some(AdversaryChoice { states, sample });
        let stop = self.collect()?;
        let adversary_stop = self.complete_adversary_episode()?;
        Ok(stop || adversary_stop)
    }

    fn collect_adapt(&mut self) -> Result<bool> {
        self.actor_critic.set_latent_source(LatentSource::Adaptation)?;
        self.restore_id_contexts()?;
        self.collect()
    }

    /// Fills the rollout storage with `horizon` steps of every instance.
    fn collect(&mut self) -> Result<bool> {
        self.storage.clear();
        let num_envs = self.num_envs();
        let horizon = self.storage.horizon();
        let gamma = self.ppo.config.gamma;
        let track_history = self.actor_critic.has_adaptation_module();
        let mut reward_sums = vec![0f32; num_envs];
        for _ in 0..horizon {
            let input = self.policy_input()?;
            let sample = self.actor_critic.act(&input)?;
            let step = self.env.step(&sample.actions)?;
            step.validate(num_envs, self.description.observation_size)?;
            let values: Vec<f32> = sample.values.to_vec1()?;
            let dones = step.dones();
            let mut rewards = step.rewards.clone();
            for (env, reward) in step.rewards.iter().enumerate() {
                reward_sums[env] += reward;
                if self.bootstrap_timeouts && step.truncated[env] && !step.terminated[env] {
                    rewards[env] += gamma * values[env];
                }
            }
            self.episodes.record(&step.rewards, &dones);
            if track_history {
                self.history.push(&input.observations, &sample.actions)?;
            }
            self.storage.add_transition(Transition {
                observations: input.observations,
                contexts: input.contexts,
                histories: input.histories,
                log_probs: sample.log_probs.to_vec1()?,
                actions: sample.actions,
                action_means: sample.means,
                action_stds: sample.stds,
                rewards,
                dones: dones.clone(),
                values,
            })?;
            let done_ids: Vec<usize> = dones
                .iter()
                .enumerate()
                .filter_map(|(env, done)| done.then_some(env))
                .collect();
            if !done_ids.is_empty() {
                self.history.reset_envs(&done_ids);
                // an adversarial context holds for the whole rollout
                if !self.contexts_are_ood {
                    self.resample_contexts(&done_ids)?;
                }
            }
            self.observations = step.observations;
        }
        self.last_values = self.actor_critic.values(&self.policy_input()?)?.to_vec1()?;
        self.performance = reward_sums
            .into_iter()
            .map(|sum| sum / horizon as f32)
            .collect();
        let (returns, lengths) = self.episodes.drain();
        let stats = CollectStats {
            num_steps: horizon * num_envs,
            mean_step_reward: mean(self.performance.iter().copied()).unwrap_or(0.),
            completed_episodes: returns.len(),
            mean_episode_return: mean(returns.into_iter()),
            mean_episode_length: mean(lengths.into_iter().map(|len| len as f32)),
        };
        tracing::debug!(phase = ?self.context.phase, ?stats, "rollout collected");
        Ok(self.hooks.post_collect_hook(&self.context, &stats))
    }

    /// Rewards the adversary's choice with the negative mean per-step reward it caused and
    /// updates the adversary once `update_interval` choices are stored.
    fn complete_adversary_episode(&mut self) -> Result<bool> {
        let Some(choice) = self.pending_choice.take() else {
            return Ok(false);
        };
        let num_envs = self.num_envs();
        self.adversary_storage.add_transition(Transition {
            observations: choice.states,
            contexts: None,
            histories: None,
            log_probs: choice.sample.log_probs.to_vec1()?,
            values: choice.sample.values.to_vec1()?,
            actions: choice.sample.actions,
            action_means: choice.sample.means,
            action_stds: choice.sample.stds,
            rewards: self.performance.iter().map(|p| -p).collect(),
            dones: vec![true; num_envs],
        })?;
        if !self.adversary_storage.is_full() {
            return Ok(false);
        }
        let Some(adversary) = self.adversary.as_mut() else {
            return Ok(false);
        };
        self.adversary_ppo
            .prepare(&mut self.adversary_storage, &vec![0.; num_envs])?;
        let stats = self
            .adversary_ppo
            .update(adversary, &self.adversary_storage)?;
        self.adversary_storage.clear();
        Ok(self.hooks.post_adversary_hook(&self.context, &stats))
    }

    fn update_robust(&mut self) -> Result<bool> {
        self.ppo.prepare(&mut self.storage, &self.last_values)?;
        let stats = self.ppo.update(&mut self.actor_critic, &self.storage)?;
        let stop = self.hooks.post_update_hook(&self.context, &stats);
        self.last_update = Some(stats);
        Ok(stop)
    }

    fn update_adapt(&mut self) -> Result<bool> {
        let stats = self
            .adaptation_trainer
            .update(&mut self.actor_critic, &self.storage)?;
        Ok(self.hooks.post_adaptation_hook(&self.context, &stats))
    }
}
