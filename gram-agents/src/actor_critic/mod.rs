//! Actor-critic with a context encoder, an adaptation module and a privileged critic.
//!
//! The actor is conditioned on the observation and a latent. The latent comes either from the
//! context encoder applied to the ground-truth context (robust path) or from the adaptation
//! module applied to the observation/action history (adaptive path). Which sub-networks exist
//! and which auxiliary losses are active is decided by the [`AlgorithmKind`].

mod builder;

pub use builder::{ActorCriticBuilder, ActorCriticConfig, ActorCriticDims, StdType};

use crate::{
    algorithm::AlgorithmKind,
    policy::{ActionSample, PolicyEvaluation, PolicyInput, TrainablePolicy},
    ppo::losses::mse,
};
use candle_core::{Device, Tensor};
use candle_nn::{Module, VarMap};
use gram_core::{
    GramError, Result,
    nn::{DiagGaussian, Mlp, OptimizerWithMaxGrad},
};

const MIN_LOG_STD: f32 = -5.;
const MAX_LOG_STD: f32 = 2.;

/// Where the actor's latent comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatentSource {
    Context,
    Adaptation,
}

#[derive(Debug)]
pub(crate) enum StdHead {
    StateIndependent(Tensor),
    StateDependent { head: Mlp, offset: f32 },
}

pub struct ActorCritic {
    algorithm: AlgorithmKind,
    dims: ActorCriticDims,
    context_encoder: Option<Mlp>,
    adaptation_module: Option<Mlp>,
    actor: Mlp,
    adaptive_actor: Option<Mlp>,
    critic: Mlp,
    std_head: StdHead,
    latent_source: LatentSource,
    policy_varmap: VarMap,
    adaptation_varmap: VarMap,
    optimizer: OptimizerWithMaxGrad,
    adaptation_optimizer: Option<OptimizerWithMaxGrad>,
    device: Device,
}

impl std::fmt::Debug for ActorCritic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorCritic")
            .field("algorithm", &self.algorithm)
            .field("dims", &self.dims)
            .field("latent_source", &self.latent_source)
            .field("has_adaptation_module", &self.adaptation_module.is_some())
            .field("optimizer", &self.optimizer)
            .field("device", &self.device)
            .finish()
    }
}

fn required<'a>(tensor: &'a Option<Tensor>, what: &str) -> Result<&'a Tensor> {
    tensor
        .as_ref()
        .ok_or_else(|| GramError::Config(format!("policy input is missing {what}")))
}

impl ActorCritic {
    pub fn algorithm(&self) -> AlgorithmKind {
        self.algorithm
    }

    pub fn dims(&self) -> ActorCriticDims {
        self.dims
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn has_adaptation_module(&self) -> bool {
        self.adaptation_module.is_some()
    }

    pub fn latent_source(&self) -> LatentSource {
        self.latent_source
    }

    pub fn set_latent_source(&mut self, source: LatentSource) -> Result<()> {
        if source == LatentSource::Adaptation && self.adaptation_module.is_none() {
            return Err(GramError::Config(format!(
                "{} has no adaptation module",
                self.algorithm
            )));
        }
        self.latent_source = source;
        Ok(())
    }

    /// The path used at deployment: adaptive when an adaptation module exists, robust otherwise.
    pub fn deployment_source(&self) -> LatentSource {
        if self.adaptation_module.is_some() {
            LatentSource::Adaptation
        } else {
            LatentSource::Context
        }
    }

    pub fn policy_varmap(&self) -> &VarMap {
        &self.policy_varmap
    }

    pub fn policy_varmap_mut(&mut self) -> &mut VarMap {
        &mut self.policy_varmap
    }

    pub fn adaptation_varmap(&self) -> &VarMap {
        &self.adaptation_varmap
    }

    pub fn adaptation_varmap_mut(&mut self) -> &mut VarMap {
        &mut self.adaptation_varmap
    }

    fn context_latent(&self, input: &PolicyInput) -> Result<Option<Tensor>> {
        let Some(encoder) = &self.context_encoder else {
            return Ok(None);
        };
        let contexts = required(&input.contexts, "contexts")?;
        Ok(Some(encoder.forward(contexts)?))
    }

    fn adaptation_latent(&self, input: &PolicyInput) -> Result<Option<Tensor>> {
        let Some(adaptation_module) = &self.adaptation_module else {
            return Ok(None);
        };
        let histories = required(&input.histories, "histories")?;
        Ok(Some(adaptation_module.forward(histories)?))
    }

    fn actor_input(&self, observations: &Tensor, latent: Option<Tensor>) -> Result<Tensor> {
        match latent {
            Some(latent) => Ok(Tensor::cat(&[observations, &latent], 1)?),
            None => Ok(observations.clone()),
        }
    }

    fn distribution_for(&self, input: &PolicyInput, source: LatentSource) -> Result<DiagGaussian> {
        let (latent, actor) = match source {
            LatentSource::Context => (self.context_latent(input)?, &self.actor),
            LatentSource::Adaptation => (
                self.adaptation_latent(input)?,
                self.adaptive_actor.as_ref().unwrap_or(&self.actor),
            ),
        };
        let actor_input = self.actor_input(&input.observations, latent)?;
        let mean = actor.forward(&actor_input)?;
        let log_std = match &self.std_head {
            StdHead::StateIndependent(log_std) => log_std.clone(),
            StdHead::StateDependent { head, offset } => head
                .forward(&actor_input)?
                .affine(1., *offset as f64)?
                .clamp(MIN_LOG_STD, MAX_LOG_STD)?,
        };
        Ok(DiagGaussian::new(mean, &log_std)?)
    }

    pub fn distribution(&self, input: &PolicyInput) -> Result<DiagGaussian> {
        self.distribution_for(input, self.latent_source)
    }

    /// Deterministic action: the mean of the current path's distribution.
    pub fn act_inference(&self, input: &PolicyInput) -> Result<Tensor> {
        Ok(self.distribution(input)?.mean().detach())
    }

    /// Regression of the adaptation latent onto the (detached) context encoder latent.
    pub fn adaptation_loss(&self, input: &PolicyInput) -> Result<Tensor> {
        let (Some(target), Some(predicted)) =
            (self.context_latent(input)?, self.adaptation_latent(input)?)
        else {
            return Err(GramError::Config(format!(
                "{} has no adaptation module",
                self.algorithm
            )));
        };
        mse(&predicted, &target.detach())
    }

    /// Pulls the adaptive path's action mean towards the (detached) robust path's.
    fn consistency_loss(&self, input: &PolicyInput) -> Result<Tensor> {
        let robust = self.distribution_for(input, LatentSource::Context)?;
        let adaptive = self.distribution_for(input, LatentSource::Adaptation)?;
        mse(adaptive.mean(), &robust.mean().detach())
    }

    pub fn update_adaptation(&mut self, loss: &Tensor) -> Result<()> {
        let Some(optimizer) = self.adaptation_optimizer.as_mut() else {
            return Err(GramError::Config(format!(
                "{} has no adaptation module",
                self.algorithm
            )));
        };
        Ok(optimizer.backward_step(loss)?)
    }
}

impl TrainablePolicy for ActorCritic {
    fn act(&self, input: &PolicyInput) -> Result<ActionSample> {
        let distribution = self.distribution(input)?;
        let actions = distribution.sample()?;
        let log_probs = distribution.log_prob(&actions)?.detach();
        Ok(ActionSample {
            log_probs,
            means: distribution.mean().detach(),
            stds: distribution.std()?.detach(),
            values: self.values(input)?.detach(),
            actions,
        })
    }

    fn evaluate(&self, input: &PolicyInput, actions: &Tensor) -> Result<PolicyEvaluation> {
        let distribution = self.distribution(input)?;
        let adaptation_loss = self
            .algorithm
            .trains_adaptation_jointly()
            .then(|| self.adaptation_loss(input))
            .transpose()?;
        let consistency_loss = self
            .algorithm
            .consistency_regularized()
            .then(|| self.consistency_loss(input))
            .transpose()?;
        Ok(PolicyEvaluation {
            log_probs: distribution.log_prob(actions)?,
            entropy: distribution.entropy()?,
            values: self.values(input)?,
            distribution,
            adaptation_loss,
            consistency_loss,
        })
    }

    fn values(&self, input: &PolicyInput) -> Result<Tensor> {
        let contexts = required(&input.contexts, "contexts")?;
        let critic_input = Tensor::cat(&[&input.observations, contexts], 1)?;
        Ok(self.critic.forward(&critic_input)?.squeeze(1)?)
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
