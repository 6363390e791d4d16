use super::{ActorCritic, LatentSource, StdHead};
use crate::algorithm::AlgorithmKind;
use candle_core::{DType, Device};
use candle_nn::{Init, VarBuilder, VarMap};
use gram_core::{
    GramError, Result,
    env::EnvironmentDescription,
    nn::{ActivationKind, OptimizerWithMaxGrad, build_mlp, reinit_vars},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StdType {
    /// One learned log-std per action dimension.
    #[default]
    StateIndependent,
    /// Log-std predicted from the actor input.
    StateDependent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActorCriticConfig {
    pub actor_hidden_dims: Vec<usize>,
    pub critic_hidden_dims: Vec<usize>,
    pub encoder_hidden_dims: Vec<usize>,
    pub adaptation_hidden_dims: Vec<usize>,
    pub latent_dim: usize,
    /// Number of past (observation, action) steps the adaptation module sees.
    pub history_len: usize,
    pub activation: ActivationKind,
    pub init_noise_std: f32,
    pub std_type: StdType,
    pub learning_rate: f64,
    pub adaptation_learning_rate: f64,
    pub max_grad_norm: Option<f32>,
}

impl Default for ActorCriticConfig {
    fn default() -> Self {
        Self {
            actor_hidden_dims: vec![512, 256, 128],
            critic_hidden_dims: vec![512, 256, 128],
            encoder_hidden_dims: vec![64, 32],
            adaptation_hidden_dims: vec![256, 128],
            latent_dim: 8,
            history_len: 16,
            activation: ActivationKind::Elu,
            init_noise_std: 1.,
            std_type: StdType::StateIndependent,
            learning_rate: 1e-3,
            adaptation_learning_rate: 1e-3,
            max_grad_norm: Some(1.),
        }
    }
}

impl ActorCriticConfig {
    pub fn validate(&self) -> Result<()> {
        if self.latent_dim == 0 {
            return Err(GramError::Config("latent_dim must be positive".to_owned()));
        }
        if !(self.init_noise_std > 0.) {
            return Err(GramError::Config(format!(
                "init_noise_std must be positive, got {}",
                self.init_noise_std
            )));
        }
        for (name, lr) in [
            ("learning_rate", self.learning_rate),
            ("adaptation_learning_rate", self.adaptation_learning_rate),
        ] {
            if !(lr > 0.) {
                return Err(GramError::Config(format!("{name} must be positive, got {lr}")));
            }
        }
        Ok(())
    }
}

/// Input and output sizes of the actor-critic networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorCriticDims {
    pub observation_size: usize,
    pub action_size: usize,
    pub context_size: usize,
    pub history_size: usize,
}

impl ActorCriticDims {
    pub fn new(env_description: &EnvironmentDescription, history_len: usize) -> Self {
        Self {
            observation_size: env_description.observation_size,
            action_size: env_description.action_size,
            context_size: env_description.context_size(),
            history_size: history_len
                * (env_description.observation_size + env_description.action_size),
        }
    }
}

pub struct ActorCriticBuilder {
    pub algorithm: AlgorithmKind,
    pub config: ActorCriticConfig,
    pub dims: ActorCriticDims,
}

impl ActorCriticBuilder {
    pub fn new(algorithm: AlgorithmKind, config: ActorCriticConfig, dims: ActorCriticDims) -> Self {
        Self {
            algorithm,
            config,
            dims,
        }
    }

    /// Builds the networks and re-draws their weights from the seeded generator.
    pub fn build(self, device: &Device) -> Result<ActorCritic> {
        let Self {
            algorithm,
            config,
            dims,
        } = self;
        config.validate()?;
        let policy_varmap = VarMap::new();
        let adaptation_varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&policy_varmap, DType::F32, device);
        let adaptation_vb = VarBuilder::from_varmap(&adaptation_varmap, DType::F32, device);
        let activation = config.activation;

        let context_encoder = algorithm
            .context_conditioned()
            .then(|| {
                build_mlp(
                    dims.context_size,
                    &config.encoder_hidden_dims,
                    config.latent_dim,
                    activation,
                    &vb,
                    "encoder",
                )
            })
            .transpose()?;
        let adaptation_module = algorithm
            .has_adaptation_module()
            .then(|| {
                build_mlp(
                    dims.history_size,
                    &config.adaptation_hidden_dims,
                    config.latent_dim,
                    activation,
                    &adaptation_vb,
                    "adaptation",
                )
            })
            .transpose()?;
        let actor_input = if algorithm.context_conditioned() {
            dims.observation_size + config.latent_dim
        } else {
            dims.observation_size
        };
        let actor = build_mlp(
            actor_input,
            &config.actor_hidden_dims,
            dims.action_size,
            activation,
            &vb,
            "actor",
        )?;
        let adaptive_actor = algorithm
            .separate_adaptive_actor()
            .then(|| {
                build_mlp(
                    actor_input,
                    &config.actor_hidden_dims,
                    dims.action_size,
                    activation,
                    &vb,
                    "adaptive_actor",
                )
            })
            .transpose()?;
        let critic = build_mlp(
            dims.observation_size + dims.context_size,
            &config.critic_hidden_dims,
            1,
            activation,
            &vb,
            "critic",
        )?;
        let init_log_std = config.init_noise_std.ln();
        let std_head = match config.std_type {
            StdType::StateIndependent => StdHead::StateIndependent(vb.get_with_hints(
                dims.action_size,
                "log_std",
                Init::Const(init_log_std as f64),
            )?),
            StdType::StateDependent => StdHead::StateDependent {
                head: build_mlp(actor_input, &[], dims.action_size, activation, &vb, "std")?,
                offset: init_log_std,
            },
        };

        reinit_vars(&policy_varmap)?;
        reinit_vars(&adaptation_varmap)?;

        let mut optimized_vars = policy_varmap.all_vars();
        if algorithm.trains_adaptation_jointly() {
            optimized_vars.extend(adaptation_varmap.all_vars());
        }
        let optimizer =
            OptimizerWithMaxGrad::adam(optimized_vars, config.learning_rate, config.max_grad_norm)?;
        let adaptation_optimizer = adaptation_module
            .is_some()
            .then(|| {
                OptimizerWithMaxGrad::adam(
                    adaptation_varmap.all_vars(),
                    config.adaptation_learning_rate,
                    config.max_grad_norm,
                )
            })
            .transpose()?;

        Ok(ActorCritic {
            algorithm,
            dims,
            context_encoder,
            adaptation_module,
            actor,
            adaptive_actor,
            critic,
            std_head,
            latent_source: LatentSource::Context,
            policy_varmap,
            adaptation_varmap,
            optimizer,
            adaptation_optimizer,
            device: device.clone(),
        })
    }
}
