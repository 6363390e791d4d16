use candle_core::Device;
use gram_agents::{
    ActorCriticBuilder, ActorCriticConfig, AdversaryConfig, AlgorithmKind, PpoConfig, UpdateStats,
    actor_critic::ActorCriticDims, adaptation::AdaptationConfig,
};
use gram_api::{
    checkpoint::{self, Checkpointer, FINAL_TAG, iteration_tag},
    config::{RunConfig, TRAIN_CONFIG_FILE, TrainConfig},
    evaluation::{DeploymentRegime, EvalConfig},
    hooks::{CollectStats, EmptyRunnerHooks, RunnerHooks},
    logging::init_tracing,
    runner::{OnPolicyRunner, RunnerContext, RunnerPhase},
    test_utils::{Failure, FailingEnv, PointMassEnv},
    train, train_with_hooks,
};
use gram_core::{
    GramError,
    context::{ContextOverrides, ContextRange, FrozenJointMode},
    env::{TerrainSettings, VecEnv},
    rng,
};
use std::path::Path;

const NUM_ENVS: usize = 4;
const NUM_JOINTS: usize = 2;
const EPISODE_LENGTH: usize = 10;

fn env(seed: u64) -> PointMassEnv {
    PointMassEnv::new(NUM_ENVS, NUM_JOINTS, EPISODE_LENGTH, seed)
}

fn small_config(algorithm: AlgorithmKind, log_root: &Path) -> TrainConfig {
    TrainConfig {
        algorithm,
        max_iterations: 4,
        finetune_iterations: if algorithm.has_adaptation_module() { 2 } else { 0 },
        seed: 7,
        num_steps_per_env: 8,
        ood_ratio: 0.5,
        policy: ActorCriticConfig {
            actor_hidden_dims: vec![16],
            critic_hidden_dims: vec![16],
            encoder_hidden_dims: vec![8],
            adaptation_hidden_dims: vec![16],
            latent_dim: 4,
            history_len: 3,
            ..Default::default()
        },
        ppo: PpoConfig {
            num_learning_epochs: 2,
            num_mini_batches: 2,
            ..Default::default()
        },
        adaptation: AdaptationConfig {
            num_learning_epochs: 2,
            num_mini_batches: 2,
        },
        adversary: AdversaryConfig {
            hidden_dims: vec![8],
            update_interval: 2,
            ..Default::default()
        },
        run: RunConfig {
            log_root: log_root.to_path_buf(),
            experiment_name: "test".to_owned(),
            run_name: None,
            save_interval: 2,
        },
        ..Default::default()
    }
}

#[derive(Default)]
struct RecordingHooks {
    collected: Vec<RunnerPhase>,
    robust_updates: Vec<UpdateStats>,
    adversary_updates: usize,
    adaptation_updates: usize,
    stop_after_updates: Option<usize>,
}

impl RunnerHooks for RecordingHooks {
    fn post_collect_hook(&mut self, context: &RunnerContext, stats: &CollectStats) -> bool {
        assert_eq!(stats.num_steps, 8 * NUM_ENVS);
        self.collected.push(context.phase);
        false
    }

    fn post_update_hook(&mut self, _context: &RunnerContext, stats: &UpdateStats) -> bool {
        self.robust_updates.push(stats.clone());
        self.stop_after_updates == Some(self.robust_updates.len())
    }

    fn post_adversary_hook(&mut self, _context: &RunnerContext, _stats: &UpdateStats) -> bool {
        self.adversary_updates += 1;
        false
    }

    fn post_adaptation_hook(
        &mut self,
        _context: &RunnerContext,
        stats: &gram_agents::adaptation::AdaptationStats,
    ) -> bool {
        assert!(stats.loss.is_finite());
        self.adaptation_updates += 1;
        false
    }
}

impl RunnerHooks for &mut RecordingHooks {
    fn post_collect_hook(&mut self, context: &RunnerContext, stats: &CollectStats) -> bool {
        (**self).post_collect_hook(context, stats)
    }

    fn post_update_hook(&mut self, context: &RunnerContext, stats: &UpdateStats) -> bool {
        (**self).post_update_hook(context, stats)
    }

    fn post_adversary_hook(&mut self, context: &RunnerContext, stats: &UpdateStats) -> bool {
        (**self).post_adversary_hook(context, stats)
    }

    fn post_adaptation_hook(
        &mut self,
        context: &RunnerContext,
        stats: &gram_agents::adaptation::AdaptationStats,
    ) -> bool {
        (**self).post_adaptation_hook(context, stats)
    }
}

#[test]
fn every_variant_trains_end_to_end() -> anyhow::Result<()> {
    init_tracing();
    for algorithm in AlgorithmKind::ALL {
        let dir = tempfile::tempdir()?;
        let config = small_config(algorithm, dir.path());
        let mut hooks = RecordingHooks::default();
        let summary = train_with_hooks(&config, env(1), &mut hooks)?;

        assert_eq!(summary.iterations, 4, "{algorithm}");
        let expected_finetune = if algorithm.has_adaptation_module() { 2 } else { 0 };
        assert_eq!(summary.adaptation_iterations, expected_finetune, "{algorithm}");
        assert_eq!(hooks.robust_updates.len(), 4);
        assert_eq!(hooks.adaptation_updates, expected_finetune);
        // iterations 1 and 3 are OOD, the adversary updates after every second one
        let ood = hooks
            .collected
            .iter()
            .filter(|phase| **phase == RunnerPhase::CollectOod)
            .count();
        if algorithm.uses_adversary() {
            assert_eq!(ood, 2, "{algorithm}");
            assert_eq!(hooks.adversary_updates, 1, "{algorithm}");
        } else {
            assert_eq!(ood, 0, "{algorithm}");
            assert_eq!(hooks.adversary_updates, 0, "{algorithm}");
        }
        for stats in &hooks.robust_updates {
            assert_eq!(stats.num_batches, 4);
            assert_eq!(
                stats.adaptation_loss.is_some(),
                algorithm.trains_adaptation_jointly()
            );
            assert_eq!(
                stats.consistency_loss.is_some(),
                algorithm.consistency_regularized()
            );
        }

        let run_dir = config.run_dir();
        assert!(run_dir.join(TRAIN_CONFIG_FILE).is_file());
        let checkpointer = Checkpointer::new(&run_dir);
        for tag in [iteration_tag(2), iteration_tag(4), FINAL_TAG.to_owned()] {
            let metadata = checkpoint::load_metadata(&checkpointer.checkpoint_dir(&tag))?;
            assert_eq!(metadata.algorithm, algorithm);
            assert_eq!(metadata.has_adaptation_module, algorithm.has_adaptation_module());
            assert_eq!(metadata.has_adversary, algorithm.uses_adversary());
        }
        assert_eq!(
            summary.final_checkpoint,
            Some(checkpointer.checkpoint_dir(FINAL_TAG))
        );
    }
    Ok(())
}

#[test]
fn hooks_can_stop_training() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = small_config(AlgorithmKind::Gram, dir.path());
    let mut hooks = RecordingHooks {
        stop_after_updates: Some(1),
        ..Default::default()
    };
    let summary = train_with_hooks(&config, env(1), &mut hooks)?;
    assert_eq!(summary.iterations, 1);
    assert_eq!(summary.adaptation_iterations, 0);
    assert!(summary.final_checkpoint.is_some_and(|dir| dir.is_dir()));
    Ok(())
}

#[test]
fn training_is_reproducible() -> anyhow::Result<()> {
    let run = || -> anyhow::Result<UpdateStats> {
        let dir = tempfile::tempdir()?;
        let config = small_config(AlgorithmKind::GramModular, dir.path());
        let summary = train(&config, env(5))?;
        summary
            .last_update
            .ok_or_else(|| anyhow::anyhow!("no update"))
    };
    let first = run()?;
    let second = run()?;
    assert!((first.surrogate_loss - second.surrogate_loss).abs() < 1e-5);
    assert!((first.value_loss - second.value_loss).abs() < 1e-5);
    assert!((first.kl - second.kl).abs() < 1e-6);
    Ok(())
}

#[test]
fn adversarial_contexts_hold_for_the_whole_rollout() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = small_config(AlgorithmKind::RobustRl, dir.path());
    // longer than an episode, so instances reset mid-rollout
    config.num_steps_per_env = 3 * EPISODE_LENGTH;
    // disjoint from the ID mass range
    config.ood_ranges.added_mass = ContextRange { min: 5., max: 9. };
    rng::seed(config.seed);
    let mut runner = OnPolicyRunner::new(&config, env(2), EmptyRunnerHooks, Device::Cpu)?;
    let id_ranges = config.id_ranges();
    assert!(runner.contexts().iter().all(|c| id_ranges.contains(c)));

    runner.run_phase(RunnerPhase::CollectOod)?;
    assert!(runner.storage().is_full());
    assert!(
        runner
            .contexts()
            .iter()
            .all(|c| config.ood_ranges.contains(c) && c.added_mass >= 5.)
    );
    assert_eq!(runner.contexts(), runner.env.contexts()?.as_slice());
    assert_eq!(runner.performance().len(), NUM_ENVS);

    runner.run_phase(RunnerPhase::UpdateRobust)?;
    runner.run_phase(RunnerPhase::CollectId)?;
    assert!(runner.contexts().iter().all(|c| id_ranges.contains(c)));
    Ok(())
}

#[test]
fn invalid_config_fails_before_anything_is_written() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = small_config(AlgorithmKind::RobustRl, dir.path());
    config.finetune_iterations = 3;
    let err = train(&config, env(0)).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<GramError>(),
        Some(GramError::Config(_))
    ));
    assert!(!config.run_dir().exists());

    let mut config = small_config(AlgorithmKind::Gram, dir.path());
    config.ood_ranges.frozen_joint = FrozenJointMode::Joints(vec![NUM_JOINTS]);
    assert!(train(&config, env(0)).is_err());
    Ok(())
}

#[test]
fn environment_failures_abort_training() -> anyhow::Result<()> {
    for (failure, message) in [
        (Failure::Error, "simulator crashed"),
        (Failure::NanObservations, "non-finite observation"),
    ] {
        let dir = tempfile::tempdir()?;
        let config = small_config(AlgorithmKind::Gram, dir.path());
        let err = train(&config, FailingEnv::new(env(0), 12, failure)).unwrap_err();
        assert!(format!("{err:#}").contains(message), "{err:#}");
        assert!(
            !Checkpointer::new(config.run_dir())
                .checkpoint_dir(FINAL_TAG)
                .exists()
        );
    }
    Ok(())
}

#[test]
fn trained_checkpoints_evaluate_under_both_regimes() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = small_config(AlgorithmKind::Gram, dir.path());
    train(&config, env(3))?;

    let eval = |regime, overrides: ContextOverrides| {
        let eval_config = EvalConfig {
            run_dir: config.run_dir(),
            regime,
            overrides,
            terrain: TerrainSettings {
                roughness_cm: 2.,
                slope_degrees: 5.,
            },
            num_steps: 3 * EPISODE_LENGTH,
            seed: 11,
            ..Default::default()
        };
        let mut env = env(9);
        let report = gram_api::evaluate(&eval_config, &mut env);
        assert_eq!(env.terrain(), eval_config.terrain);
        report
    };

    let id = eval(DeploymentRegime::InDistribution, ContextOverrides::default())?;
    assert_eq!(id.ranges, config.id_ranges());
    assert_eq!(id.episode_returns.len(), 3 * NUM_ENVS);
    assert!(id.episode_lengths.iter().all(|len| *len == EPISODE_LENGTH));
    assert!(id.mean_step_reward.is_finite());
    assert_eq!(
        id,
        eval(DeploymentRegime::InDistribution, ContextOverrides::default())?
    );

    let fixed_mass = ContextOverrides {
        added_mass: Some(ContextRange { min: 8., max: 8. }),
        frozen_joint: Some(FrozenJointMode::None),
        ..Default::default()
    };
    let ood = eval(DeploymentRegime::OutOfDistribution, fixed_mass)?;
    assert_eq!(ood.ranges.added_mass, ContextRange { min: 8., max: 8. });
    assert_eq!(ood.ranges.friction_mult, config.ood_ranges.friction_mult);
    assert_eq!(ood.ranges.frozen_joint, FrozenJointMode::None);

    let missing = EvalConfig {
        run_dir: config.run_dir(),
        checkpoint: "iter_999999".to_owned(),
        ..Default::default()
    };
    assert!(gram_api::evaluate(&missing, &mut env(0)).is_err());
    Ok(())
}

#[test]
fn checkpoints_only_load_into_matching_networks() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = small_config(AlgorithmKind::ContextualRl, dir.path());
    train(&config, env(4))?;
    let checkpoint_dir = Checkpointer::new(config.run_dir()).checkpoint_dir(FINAL_TAG);
    let description = env(0).env_description();

    let dims = ActorCriticDims::new(&description, config.policy.history_len);
    let mut same = ActorCriticBuilder::new(config.algorithm, config.policy.clone(), dims)
        .build(&Device::Cpu)?;
    let metadata = checkpoint::load(&checkpoint_dir, &mut same, None)?;
    assert_eq!(metadata.iteration, 4);
    assert_eq!(metadata.adaptation_iteration, 2);

    let mut other = ActorCriticBuilder::new(AlgorithmKind::Gram, config.policy.clone(), dims)
        .build(&Device::Cpu)?;
    assert!(matches!(
        checkpoint::load(&checkpoint_dir, &mut other, None),
        Err(GramError::Checkpoint(_))
    ));

    let longer = ActorCriticDims::new(&description, config.policy.history_len + 1);
    let mut resized = ActorCriticBuilder::new(config.algorithm, config.policy.clone(), longer)
        .build(&Device::Cpu)?;
    assert!(matches!(
        checkpoint::load(&checkpoint_dir, &mut resized, None),
        Err(GramError::Checkpoint(_))
    ));
    Ok(())
}
