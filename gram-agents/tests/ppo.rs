use candle_core::{Device, Tensor};
use gram_agents::{
    ActorCritic, ActorCriticBuilder, ActorCriticConfig, Adversary, AdversaryConfig,
    AlgorithmKind, Ppo, PpoConfig, TrainablePolicy,
    actor_critic::ActorCriticDims,
    adaptation::{AdaptationConfig, AdaptationTrainer},
    policy::PolicyInput,
    ppo::{hooks::KlEarlyStop, losses::compute_losses, lr_schedule::LrSchedule},
};
use gram_core::{
    GramError, Result,
    context::ContextRanges,
    rng,
    storage::{RolloutStorage, Transition},
};

const NUM_ENVS: usize = 6;
const HORIZON: usize = 4;

fn dims() -> ActorCriticDims {
    ActorCriticDims {
        observation_size: 4,
        action_size: 2,
        context_size: 6,
        history_size: 12,
    }
}

fn actor_critic(algorithm: AlgorithmKind) -> Result<ActorCritic> {
    rng::seed(1);
    let config = ActorCriticConfig {
        actor_hidden_dims: vec![16],
        critic_hidden_dims: vec![16],
        encoder_hidden_dims: vec![8],
        adaptation_hidden_dims: vec![8],
        latent_dim: 3,
        history_len: 2,
        ..Default::default()
    };
    ActorCriticBuilder::new(algorithm, config, dims()).build(&Device::Cpu)
}

fn input(step: usize) -> Result<PolicyInput> {
    let device = Device::Cpu;
    let offset = step as f64 * 0.1;
    let ramp = |cols: usize| -> Result<Tensor> {
        let n = NUM_ENVS * cols;
        Ok(Tensor::arange(0f32, n as f32, &device)?
            .affine(1. / n as f64, offset)?
            .reshape((NUM_ENVS, cols))?)
    };
    Ok(PolicyInput {
        observations: ramp(4)?,
        contexts: Some(ramp(6)?),
        histories: Some(ramp(12)?),
    })
}

fn rollout<P: TrainablePolicy>(
    policy: &P,
    inputs: impl Fn(usize) -> Result<PolicyInput>,
    rewards: impl Fn(usize, usize) -> f32,
    single_step: bool,
) -> Result<RolloutStorage> {
    let mut storage = RolloutStorage::new(HORIZON, NUM_ENVS, Device::Cpu);
    for step in 0..HORIZON {
        let input = inputs(step)?;
        let sample = policy.act(&input)?;
        storage.add_transition(Transition {
            observations: input.observations,
            contexts: input.contexts,
            histories: input.histories,
            actions: sample.actions,
            action_means: sample.means,
            action_stds: sample.stds,
            rewards: (0..NUM_ENVS).map(|env| rewards(step, env)).collect(),
            dones: vec![single_step || step == HORIZON - 1; NUM_ENVS],
            values: sample.values.to_vec1()?,
            log_probs: sample.log_probs.to_vec1()?,
        })?;
    }
    Ok(storage)
}

#[test]
fn update_runs_for_every_variant() -> Result<()> {
    for algorithm in AlgorithmKind::ALL {
        let mut ac = actor_critic(algorithm)?;
        let mut storage = rollout(&ac, input, |step, env| (step + env) as f32 * 0.1, false)?;
        let mut ppo = Ppo::new(PpoConfig {
            num_learning_epochs: 2,
            num_mini_batches: 3,
            ..Default::default()
        });
        ppo.prepare(&mut storage, &[0.; NUM_ENVS])?;
        let stats = ppo.update(&mut ac, &storage)?;
        assert_eq!(stats.num_batches, 6);
        assert!(stats.kl.is_finite() && stats.kl >= 0.);
        assert_eq!(stats.learning_rate, ac.learning_rate());
        assert_eq!(
            stats.adaptation_loss.is_some(),
            algorithm.trains_adaptation_jointly()
        );
        assert_eq!(
            stats.consistency_loss.is_some(),
            algorithm.consistency_regularized()
        );
    }
    Ok(())
}

#[test]
fn adversary_and_policy_share_the_loss_path() -> Result<()> {
    rng::seed(4);
    let adversary = Adversary::new(
        &AdversaryConfig::default(),
        ContextRanges::out_of_distribution(),
        &Device::Cpu,
    )?;
    let states = |step: usize| -> Result<PolicyInput> {
        let state = Tensor::arange(0f32, (NUM_ENVS * 5) as f32, &Device::Cpu)?
            .affine(0.05, step as f64)?
            .reshape((NUM_ENVS, 5))?;
        Ok(PolicyInput::observations(state))
    };
    let mut storage = rollout(&adversary, states, |_, env| -(env as f32), true)?;

    let shared = PpoConfig::default();
    let policy_ppo = Ppo::new(shared.clone());
    let adversary_ppo = Ppo::new(AdversaryConfig {
        ppo: shared,
        ..Default::default()
    }
    .ppo);
    policy_ppo.prepare(&mut storage, &[0.; NUM_ENVS])?;
    for batch in storage.mini_batch_generator(2, 1)? {
        let batch = batch?;
        let through_policy = policy_ppo.batch_losses(&adversary, &batch)?;
        let through_adversary = adversary_ppo.batch_losses(&adversary, &batch)?;
        let direct = compute_losses(
            &adversary_ppo.config.coefficients,
            &adversary.evaluate(&PolicyInput::from(&batch), &batch.actions)?,
            &batch,
        )?;
        for losses in [&through_adversary, &direct] {
            assert_eq!(
                through_policy.total.to_scalar::<f32>()?.to_bits(),
                losses.total.to_scalar::<f32>()?.to_bits()
            );
            assert_eq!(
                through_policy.surrogate.to_scalar::<f32>()?.to_bits(),
                losses.surrogate.to_scalar::<f32>()?.to_bits()
            );
        }
    }
    Ok(())
}

#[test]
fn single_step_adversary_advantages_are_reward_minus_value() -> Result<()> {
    rng::seed(9);
    let adversary = Adversary::new(
        &AdversaryConfig::default(),
        ContextRanges::out_of_distribution(),
        &Device::Cpu,
    )?;
    let states = |_: usize| -> Result<PolicyInput> {
        Ok(PolicyInput::observations(Tensor::ones(
            (NUM_ENVS, 5),
            candle_core::DType::F32,
            &Device::Cpu,
        )?))
    };
    let mut storage = rollout(&adversary, states, |step, _| step as f32, true)?;
    let ppo = Ppo::new(PpoConfig {
        normalize_advantages: false,
        ..Default::default()
    });
    ppo.prepare(&mut storage, &[1e3; NUM_ENVS])?;
    let advantages = storage.advantages().unwrap_or_default().to_vec();
    for (idx, advantage) in advantages.iter().enumerate() {
        let expected = storage.rewards()[idx] - storage.values()[idx];
        assert_eq!(*advantage, expected);
    }
    Ok(())
}

#[test]
fn non_finite_loss_aborts_before_the_step() -> Result<()> {
    let mut ac = actor_critic(AlgorithmKind::RobustRl)?;
    let mut storage = rollout(
        &ac,
        input,
        |step, _| if step == 2 { f32::NAN } else { 1. },
        false,
    )?;
    let mut ppo = Ppo::new(PpoConfig::default());
    ppo.prepare(&mut storage, &[0.; NUM_ENVS])?;
    let fixed = input(0)?;
    let before: Vec<Vec<f32>> = ac.act_inference(&fixed)?.to_vec2()?;
    let learning_rate = ac.learning_rate();
    let err = ppo.update(&mut ac, &storage).unwrap_err();
    assert!(matches!(err, GramError::NumericalInstability(_)));
    let after: Vec<Vec<f32>> = ac.act_inference(&fixed)?.to_vec2()?;
    assert_eq!(before, after);
    assert_eq!(learning_rate, ac.learning_rate());
    Ok(())
}

#[test]
fn non_finite_kl_aborts_before_the_step() -> Result<()> {
    let mut ac = actor_critic(AlgorithmKind::Gram)?;
    let mut storage = RolloutStorage::new(HORIZON, NUM_ENVS, Device::Cpu);
    for step in 0..HORIZON {
        let input = input(step)?;
        let sample = ac.act(&input)?;
        storage.add_transition(Transition {
            observations: input.observations,
            contexts: input.contexts,
            histories: input.histories,
            actions: sample.actions,
            action_means: sample.means,
            // a collapsed behaviour distribution makes the kl infinite, the loss stays finite
            action_stds: sample.stds.zeros_like()?,
            rewards: vec![1.; NUM_ENVS],
            dones: vec![step == HORIZON - 1; NUM_ENVS],
            values: sample.values.to_vec1()?,
            log_probs: sample.log_probs.to_vec1()?,
        })?;
    }
    let mut ppo = Ppo::new(PpoConfig::default());
    ppo.prepare(&mut storage, &[0.; NUM_ENVS])?;
    let batch = storage.mini_batch_generator(1, 1)?.next().unwrap()?;
    let losses = ppo.batch_losses(&ac, &batch)?;
    assert!(losses.total.to_scalar::<f32>()?.is_finite());
    assert!(!losses.kl.to_scalar::<f32>()?.is_finite());

    let fixed = input(0)?;
    let before: Vec<Vec<f32>> = ac.act_inference(&fixed)?.to_vec2()?;
    let learning_rate = ac.learning_rate();
    match ppo.update(&mut ac, &storage) {
        Err(GramError::NumericalInstability(message)) => assert!(message.contains("kl")),
        other => panic!("expected a numerical instability, got {other:?}"),
    }
    let after: Vec<Vec<f32>> = ac.act_inference(&fixed)?.to_vec2()?;
    assert_eq!(before, after);
    assert_eq!(learning_rate, ac.learning_rate());
    Ok(())
}

#[test]
fn kl_early_stop_ends_the_update() -> Result<()> {
    let mut ac = actor_critic(AlgorithmKind::ContextualRl)?;
    let mut storage = rollout(&ac, input, |step, _| step as f32, false)?;
    let mut ppo = Ppo::new(PpoConfig {
        lr_schedule: LrSchedule::Fixed,
        ..Default::default()
    })
    .with_hooks(KlEarlyStop { target_kl: -1. });
    ppo.prepare(&mut storage, &[0.; NUM_ENVS])?;
    let learning_rate = ac.learning_rate();
    let stats = ppo.update(&mut ac, &storage)?;
    assert_eq!(stats.num_batches, 1);
    assert_eq!(ac.learning_rate(), learning_rate);
    Ok(())
}

#[test]
fn adaptation_trainer_needs_an_adaptation_module() -> Result<()> {
    let trainer = AdaptationTrainer::new(AdaptationConfig {
        num_learning_epochs: 20,
        num_mini_batches: 2,
    });

    let mut robust = actor_critic(AlgorithmKind::RobustRl)?;
    let storage = rollout(&robust, input, |_, _| 0., false)?;
    assert!(matches!(
        trainer.update(&mut robust, &storage),
        Err(GramError::Config(_))
    ));

    let mut contextual = actor_critic(AlgorithmKind::ContextualRl)?;
    let storage = rollout(&contextual, input, |_, _| 0., false)?;
    let first = trainer.update(&mut contextual, &storage)?;
    let second = trainer.update(&mut contextual, &storage)?;
    assert_eq!(first.num_batches, 40);
    assert!(second.loss < first.loss);
    Ok(())
}
