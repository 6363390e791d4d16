use candle_core::Tensor;
use gram_core::{Result, nn::DiagGaussian, storage::MiniBatch};

/// Everything a policy may condition on. `contexts` and `histories` are only read by the
/// sub-networks that need them.
#[derive(Debug, Clone)]
pub struct PolicyInput {
    pub observations: Tensor,
    pub contexts: Option<Tensor>,
    pub histories: Option<Tensor>,
}

impl PolicyInput {
    pub fn observations(observations: Tensor) -> Self {
        Self {
            observations,
            contexts: None,
            histories: None,
        }
    }
}

impl From<&MiniBatch> for PolicyInput {
    fn from(batch: &MiniBatch) -> Self {
        Self {
            observations: batch.observations.clone(),
            contexts: batch.contexts.clone(),
            histories: batch.histories.clone(),
        }
    }
}

/// Detached output of acting once on a batch.
#[derive(Debug, Clone)]
pub struct ActionSample {
    pub actions: Tensor,
    pub log_probs: Tensor,
    pub means: Tensor,
    pub stds: Tensor,
    pub values: Tensor,
}

/// Differentiable re-evaluation of stored actions under the current parameters.
#[derive(Debug, Clone)]
pub struct PolicyEvaluation {
    pub distribution: DiagGaussian,
    pub log_probs: Tensor,
    pub values: Tensor,
    /// Per-sample entropy.
    pub entropy: Tensor,
    pub adaptation_loss: Option<Tensor>,
    pub consistency_loss: Option<Tensor>,
}

/// The capability the PPO engine needs from anything it optimizes.
pub trait TrainablePolicy {
    fn act(&self, input: &PolicyInput) -> Result<ActionSample>;

    fn evaluate(&self, input: &PolicyInput, actions: &Tensor) -> Result<PolicyEvaluation>;

    fn values(&self, input: &PolicyInput) -> Result<Tensor>;

    /// Backpropagates `loss` and takes one optimizer step.
    fn update(&mut self, loss: &Tensor) -> Result<()>;

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, learning_rate: f64);
}
