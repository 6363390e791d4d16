use crate::policy::PolicyEvaluation;
use candle_core::Tensor;
use gram_core::{
    Result,
    storage::MiniBatch,
    tensors::{AdaptationLoss, EntropyBonus, Logp, LogpDiff, PolicyLoss, ValueLoss, ValuesPred},
};
use serde::{Deserialize, Serialize};
use std::ops::Deref;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossCoefficients {
    pub clip_param: f32,
    pub value_loss_coef: f32,
    pub entropy_coef: f32,
    pub adaptation_coef: f32,
    pub consistency_coef: f32,
    pub use_clipped_value_loss: bool,
}

impl Default for LossCoefficients {
    fn default() -> Self {
        Self {
            clip_param: 0.2,
            value_loss_coef: 1.,
            entropy_coef: 0.01,
            adaptation_coef: 1.,
            consistency_coef: 0.1,
            use_clipped_value_loss: true,
        }
    }
}

pub fn mse(predicted: &Tensor, target: &Tensor) -> Result<Tensor> {
    Ok((predicted - target)?.sqr()?.mean_all()?)
}

/// `-mean(min(ratio * adv, clip(ratio, 1 - eps, 1 + eps) * adv))`
pub fn surrogate_loss(ratio: &Tensor, advantages: &Tensor, clip_param: f32) -> Result<PolicyLoss> {
    let clip_adv = (ratio.clamp(1. - clip_param, 1. + clip_param)? * advantages)?;
    let loss = Tensor::minimum(&(ratio * advantages)?, &clip_adv)?
        .neg()?
        .mean_all()?;
    Ok(PolicyLoss(loss))
}

/// Squared error to the returns, optionally clipped around the values seen at collection time.
pub fn value_loss(
    values: &ValuesPred,
    old_values: &Tensor,
    returns: &Tensor,
    clip_param: Option<f32>,
) -> Result<ValueLoss> {
    let unclipped = (values.deref() - returns)?.sqr()?;
    let loss = match clip_param {
        Some(clip_param) => {
            let clipped_values =
                (old_values + (values.deref() - old_values)?.clamp(-clip_param, clip_param)?)?;
            let clipped = (clipped_values - returns)?.sqr()?;
            Tensor::maximum(&unclipped, &clipped)?.mean_all()?
        }
        None => unclipped.mean_all()?,
    };
    Ok(ValueLoss(loss))
}

/// Every loss term of one mini-batch. Scalars are 0-dimensional tensors.
#[derive(Debug)]
pub struct PpoLosses {
    pub surrogate: PolicyLoss,
    pub value: ValueLoss,
    pub entropy: EntropyBonus,
    pub adaptation: Option<AdaptationLoss>,
    pub consistency: Option<Tensor>,
    pub total: Tensor,
    /// Mean `KL(old || new)`, detached.
    pub kl: Tensor,
}

/// The single loss path shared by the actor-critic and the adversary.
pub fn compute_losses(
    coefficients: &LossCoefficients,
    evaluation: &PolicyEvaluation,
    batch: &MiniBatch,
) -> Result<PpoLosses> {
    let advantages = batch.advantages()?;
    let returns = batch.returns()?;
    let logp = Logp(evaluation.log_probs.clone());
    let logp_diff = LogpDiff((logp.deref() - &batch.old_log_probs)?);
    let ratio = logp_diff.exp()?;
    let surrogate = surrogate_loss(&ratio, advantages, coefficients.clip_param)?;
    let value = value_loss(
        &ValuesPred(evaluation.values.clone()),
        &batch.old_values,
        returns,
        coefficients
            .use_clipped_value_loss
            .then_some(coefficients.clip_param),
    )?;
    let entropy = EntropyBonus(evaluation.entropy.mean_all()?);

    let mut total = ((surrogate.deref() + value.affine(coefficients.value_loss_coef as f64, 0.)?)?
        - entropy.affine(coefficients.entropy_coef as f64, 0.)?)?;
    let adaptation = evaluation.adaptation_loss.clone().map(AdaptationLoss);
    if let Some(adaptation) = &adaptation {
        total = (total + adaptation.affine(coefficients.adaptation_coef as f64, 0.)?)?;
    }
    let consistency = evaluation.consistency_loss.clone();
    if let Some(consistency) = &consistency {
        total = (total + consistency.affine(coefficients.consistency_coef as f64, 0.)?)?;
    }
    let kl = evaluation
        .distribution
        .kl_from(&batch.old_means, &batch.old_stds)?
        .mean_all()?
        .detach();
    Ok(PpoLosses {
        surrogate,
        value,
        entropy,
        adaptation,
        consistency,
        total,
        kl,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use candle_core::Device;

    #[test]
    fn clipping_is_inactive_inside_the_trust_region() -> Result<()> {
        let device = Device::Cpu;
        let ratio = Tensor::new(&[0.85f32, 1., 1.1, 1.19], &device)?;
        let advantages = Tensor::new(&[1.5f32, -2., 0.3, -0.7], &device)?;
        let clipped = surrogate_loss(&ratio, &advantages, 0.2)?.to_scalar::<f32>()?;
        let unclipped = (&ratio * &advantages)?.neg()?.mean_all()?.to_scalar::<f32>()?;
        assert_eq!(clipped, unclipped);
        Ok(())
    }

    #[test]
    fn clipping_caps_positive_advantage_gains() -> Result<()> {
        let device = Device::Cpu;
        let ratio = Tensor::new(&[2f32], &device)?;
        let advantages = Tensor::new(&[1f32], &device)?;
        let loss = surrogate_loss(&ratio, &advantages, 0.2)?.to_scalar::<f32>()?;
        assert!((loss + 1.2).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn clipped_value_loss_takes_the_pessimistic_term() -> Result<()> {
        let device = Device::Cpu;
        let values = ValuesPred(Tensor::new(&[0.9f32], &device)?);
        let old_values = Tensor::new(&[0f32], &device)?;
        let returns = Tensor::new(&[1f32], &device)?;
        // unclipped (0.9 - 1)^2 = 0.01, clipped (0.2 - 1)^2 = 0.64
        let clipped = value_loss(&values, &old_values, &returns, Some(0.2))?.to_scalar::<f32>()?;
        let unclipped = value_loss(&values, &old_values, &returns, None)?.to_scalar::<f32>()?;
        assert!((clipped - 0.64).abs() < 1e-5);
        assert!((unclipped - 0.01).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn matching_latents_have_zero_adaptation_loss() -> Result<()> {
        let device = Device::Cpu;
        let latent = Tensor::new(&[[0.5f32, -1.25, 3.], [7., 0., -2.]], &device)?;
        assert_eq!(mse(&latent, &latent.clone())?.to_scalar::<f32>()?, 0.);
        let other = (&latent + 1.)?;
        assert!((mse(&latent, &other)?.to_scalar::<f32>()? - 1.).abs() < 1e-6);
        Ok(())
    }
}
