//! Adversary choosing out-of-distribution contexts.
//!
//! Its state is an instance's current context normalized to the OOD ranges, optionally followed
//! by the main policy's mean per-step reward in that instance. Its action is a Gaussian delta,
//! one component per continuous context parameter, mapped into the OOD ranges, so a chosen
//! context can never leave them. Each choice is a one-step episode rewarded with the negative
//! mean per-step reward the main policy then collected under it.

use crate::{
    policy::{ActionSample, PolicyEvaluation, PolicyInput, TrainablePolicy},
    ppo::{PpoConfig, losses::LossCoefficients},
};
use candle_core::{DType, Device, Tensor};
use candle_nn::{Init, Module, VarBuilder, VarMap};
use gram_core::{
    GramError, Result,
    context::{Context, ContextRanges, NUM_CONTINUOUS_PARAMS},
    nn::{ActivationKind, DiagGaussian, Mlp, OptimizerWithMaxGrad, build_mlp, reinit_vars},
    rng::RNG,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdversaryConfig {
    pub hidden_dims: Vec<usize>,
    pub activation: ActivationKind,
    pub init_noise_std: f32,
    pub learning_rate: f64,
    pub max_grad_norm: Option<f32>,
    /// The adversary is updated once per this many OOD iterations.
    pub update_interval: usize,
    pub use_performance_signal: bool,
    pub ppo: PpoConfig,
}

impl Default for AdversaryConfig {
    fn default() -> Self {
        Self {
            hidden_dims: vec![64, 64],
            activation: ActivationKind::Elu,
            init_noise_std: 0.5,
            learning_rate: 1e-3,
            max_grad_norm: Some(1.),
            update_interval: 5,
            use_performance_signal: true,
            ppo: PpoConfig {
                num_learning_epochs: 5,
                num_mini_batches: 1,
                normalize_advantages: true,
                coefficients: LossCoefficients {
                    adaptation_coef: 0.,
                    consistency_coef: 0.,
                    ..Default::default()
                },
                ..Default::default()
            },
        }
    }
}

impl AdversaryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.update_interval == 0 {
            return Err(GramError::Config(
                "adversary update_interval must be positive".to_owned(),
            ));
        }
        if !(self.init_noise_std > 0.) || !(self.learning_rate > 0.) {
            return Err(GramError::Config(
                "adversary init_noise_std and learning_rate must be positive".to_owned(),
            ));
        }
        self.ppo.validate()?;
        self.ppo.lr_schedule.check_learning_rate(self.learning_rate)
    }
}

pub struct Adversary {
    actor: Mlp,
    critic: Mlp,
    log_std: Tensor,
    varmap: VarMap,
    optimizer: OptimizerWithMaxGrad,
    ranges: ContextRanges,
    use_performance_signal: bool,
    device: Device,
}

impl std::fmt::Debug for Adversary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adversary")
            .field("state_size", &self.actor.input_dim())
            .field("ranges", &self.ranges)
            .field("use_performance_signal", &self.use_performance_signal)
            .field("optimizer", &self.optimizer)
            .field("device", &self.device)
            .finish()
    }
}

impl Adversary {
    pub fn new(config: &AdversaryConfig, ranges: ContextRanges, device: &Device) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let state_size = Self::state_size_for(config.use_performance_signal);
        let actor = build_mlp(
            state_size,
            &config.hidden_dims,
            NUM_CONTINUOUS_PARAMS,
            config.activation,
            &vb,
            "adversary_actor",
        )?;
        let critic = build_mlp(
            state_size,
            &config.hidden_dims,
            1,
            config.activation,
            &vb,
            "adversary_critic",
        )?;
        let log_std = vb.get_with_hints(
            NUM_CONTINUOUS_PARAMS,
            "adversary_log_std",
            Init::Const(config.init_noise_std.ln() as f64),
        )?;
        reinit_vars(&varmap)?;
        let optimizer = OptimizerWithMaxGrad::adam(
            varmap.all_vars(),
            config.learning_rate,
            config.max_grad_norm,
        )?;
        Ok(Self {
            actor,
            critic,
            log_std,
            varmap,
            optimizer,
            ranges,
            use_performance_signal: config.use_performance_signal,
            device: device.clone(),
        })
    }

    fn state_size_for(use_performance_signal: bool) -> usize {
        NUM_CONTINUOUS_PARAMS + usize::from(use_performance_signal)
    }

    pub fn state_size(&self) -> usize {
        Self::state_size_for(self.use_performance_signal)
    }

    pub fn ranges(&self) -> &ContextRanges {
        &self.ranges
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn varmap_mut(&mut self) -> &mut VarMap {
        &mut self.varmap
    }

    /// `[contexts.len(), state_size]` adversary state.
    pub fn state(&self, contexts: &[Context], performance: &[f32]) -> Result<Tensor> {
        if self.use_performance_signal && performance.len() != contexts.len() {
            return Err(GramError::ShapeMismatch {
                what: "adversary performance signal",
                expected: vec![contexts.len()],
                actual: vec![performance.len()],
            });
        }
        let state: Vec<f32> = contexts
            .iter()
            .enumerate()
            .flat_map(|(idx, context)| {
                let normalized = self.ranges.normalize(context);
                let performance = self
                    .use_performance_signal
                    .then(|| performance[idx]);
                normalized.into_iter().chain(performance)
            })
            .collect();
        Ok(Tensor::from_vec(
            state,
            (contexts.len(), self.state_size()),
            &self.device,
        )?)
    }

    /// Maps sampled deltas to contexts inside the adversary's ranges.
    pub fn contexts_from_actions(&self, actions: &Tensor, num_joints: usize) -> Result<Vec<Context>> {
        let actions: Vec<Vec<f32>> = actions.to_vec2()?;
        RNG.with_borrow_mut(|rng| {
            actions
                .iter()
                .map(|deltas| self.ranges.from_deltas(deltas, rng, num_joints))
                .collect()
        })
    }

    fn distribution(&self, states: &Tensor) -> Result<DiagGaussian> {
        Ok(DiagGaussian::new(self.actor.forward(states)?, &self.log_std)?)
    }
}

impl TrainablePolicy for Adversary {
    fn act(&self, input: &PolicyInput) -> Result<ActionSample> {
        let distribution = self.distribution(&input.observations)?;
        let actions = distribution.sample()?;
        Ok(ActionSample {
            log_probs: distribution.log_prob(&actions)?.detach(),
            means: distribution.mean().detach(),
            stds: distribution.std()?.detach(),
            values: self.values(input)?.detach(),
            actions,
        })
    }

    fn evaluate(&self, input: &PolicyInput, actions: &Tensor) -> Result<PolicyEvaluation> {
        let distribution = self.distribution(&input.observations)?;
        Ok(PolicyEvaluation {
            log_probs: distribution.log_prob(actions)?,
            entropy: distribution.entropy()?,
            values: self.values(input)?,
            distribution,
            adaptation_loss: None,
            consistency_loss: None,
        })
    }

    fn values(&self, input: &PolicyInput) -> Result<Tensor> {
        Ok(self.critic.forward(&input.observations)?.squeeze(1)?)
    }

    fn update(&mut self, loss: &Tensor) -> Result<()> {
        Ok(self.optimizer.backward_step(loss)?)
    }

    fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    fn set_learning_rate(&mut self, learning_rate: f64) {
        self.optimizer.set_learning_rate(learning_rate)
    }
}
