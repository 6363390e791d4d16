use crate::rng::RNG;
use candle_core::{Result, Tensor};
use rand::Rng;
use rand_distr::StandardNormal;
use std::f32;

/// Gaussian with a diagonal covariance over a batch of actions, `[batch, action_size]`.
#[derive(Debug, Clone)]
pub struct DiagGaussian {
    mean: Tensor,
    log_std: Tensor,
}

impl DiagGaussian {
    /// `log_std` is either per action dimension or per sample and gets broadcast to `mean`.
    pub fn new(mean: Tensor, log_std: &Tensor) -> Result<Self> {
        let log_std = log_std.broadcast_as(mean.shape())?.contiguous()?;
        Ok(Self { mean, log_std })
    }

    pub fn from_mean_std(mean: Tensor, std: &Tensor) -> Result<Self> {
        let log_std = std.log()?;
        Self::new(mean, &log_std)
    }

    pub fn mean(&self) -> &Tensor {
        &self.mean
    }

    pub fn log_std(&self) -> &Tensor {
        &self.log_std
    }

    pub fn std(&self) -> Result<Tensor> {
        self.log_std.exp()
    }

    /// Reparameterized sample `mean + std * eps` with `eps` drawn from the seeded generator.
    pub fn sample(&self) -> Result<Tensor> {
        let noise: Vec<f32> = RNG.with_borrow_mut(|rng| {
            (0..self.mean.elem_count())
                .map(|_| rng.sample::<f32, _>(StandardNormal))
                .collect()
        });
        let noise = Tensor::from_vec(noise, self.mean.shape(), self.mean.device())?;
        let action = (&self.mean + self.std()?.mul(&noise)?)?;
        Ok(action.detach())
    }

    /// Log-density of `actions`, summed over action dimensions.
    pub fn log_prob(&self, actions: &Tensor) -> Result<Tensor> {
        let var = self.std()?.sqr()?;
        let log_sqrt_2pi = f32::ln(f32::sqrt(2f32 * f32::consts::PI)) as f64;
        let log_probs = ((actions - &self.mean)?.sqr()? / (2. * var)?)?
            .neg()?
            .sub(&self.log_std)?
            .affine(1., -log_sqrt_2pi)?;
        log_probs.sum(1)
    }

    pub fn entropy(&self) -> Result<Tensor> {
        let log_2pi_plus_1_div_2 = 0.5 * ((2. * f32::consts::PI).ln() + 1.) as f64;
        self.log_std.affine(1., log_2pi_plus_1_div_2)?.sum(1)
    }

    /// `KL(old || self)` per sample, where `old` is given by its mean and standard deviation.
    pub fn kl_from(&self, old_mean: &Tensor, old_std: &Tensor) -> Result<Tensor> {
        let std = self.std()?;
        let log_ratio = (&self.log_std - old_std.log()?)?;
        let numerator = (old_std.sqr()? + (old_mean - &self.mean)?.sqr()?)?;
        let denominator = (std.sqr()? * 2.)?;
        let kl = (log_ratio + (numerator / denominator)?)?.affine(1., -0.5)?;
        kl.sum(1)
    }
}
