use crate::{
    error::{GramError, Result},
    rng::RNG,
};
use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;

/// Flattened `(time x instance)` view of a full rollout, rows laid out as `t * num_envs + env`.
#[derive(Debug, Clone)]
pub struct FlatRollout {
    pub observations: Tensor,
    pub contexts: Option<Tensor>,
    pub histories: Option<Tensor>,
    pub actions: Tensor,
    pub old_means: Tensor,
    pub old_stds: Tensor,
    pub old_log_probs: Tensor,
    pub old_values: Tensor,
    pub advantages: Option<Tensor>,
    pub returns: Option<Tensor>,
}

#[derive(Debug, Clone)]
pub struct MiniBatch {
    /// Rows of the flattened rollout this batch was gathered from.
    pub indices: Vec<usize>,
    pub observations: Tensor,
    pub contexts: Option<Tensor>,
    pub histories: Option<Tensor>,
    pub actions: Tensor,
    pub old_means: Tensor,
    pub old_stds: Tensor,
    pub old_log_probs: Tensor,
    pub old_values: Tensor,
    pub advantages: Option<Tensor>,
    pub returns: Option<Tensor>,
}

impl MiniBatch {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn advantages(&self) -> Result<&Tensor> {
        self.advantages.as_ref().ok_or_else(|| {
            GramError::Config("mini-batch has no advantages, compute returns first".to_owned())
        })
    }

    pub fn returns(&self) -> Result<&Tensor> {
        self.returns.as_ref().ok_or_else(|| {
            GramError::Config("mini-batch has no returns, compute returns first".to_owned())
        })
    }
}

/// Lazy sequence of shuffled mini-batches over `num_epochs` passes of a rollout.
///
/// Each epoch reshuffles the full index space and splits it into `num_mini_batches` batches
/// whose sizes differ by at most one, so every sample is visited exactly once per epoch.
#[derive(Debug, Clone)]
pub struct MiniBatchGenerator {
    rollout: FlatRollout,
    permutation: Vec<usize>,
    num_mini_batches: usize,
    num_epochs: usize,
    epoch: usize,
    batch: usize,
    device: Device,
}

impl MiniBatchGenerator {
    pub fn new(
        rollout: FlatRollout,
        num_samples: usize,
        num_mini_batches: usize,
        num_epochs: usize,
    ) -> Result<Self> {
        if num_mini_batches == 0 || num_mini_batches > num_samples {
            return Err(GramError::Config(format!(
                "cannot split {num_samples} samples into {num_mini_batches} mini-batches"
            )));
        }
        let device = rollout.observations.device().clone();
        Ok(Self {
            rollout,
            permutation: (0..num_samples).collect(),
            num_mini_batches,
            num_epochs,
            epoch: 0,
            batch: 0,
            device,
        })
    }

    pub fn num_samples(&self) -> usize {
        self.permutation.len()
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn total_batches(&self) -> usize {
        self.num_epochs * self.num_mini_batches
    }

    /// Starts over from the first epoch. The next batch triggers a fresh shuffle.
    pub fn restart(&mut self) {
        self.epoch = 0;
        self.batch = 0;
    }

    fn batch_bounds(&self, batch: usize) -> (usize, usize) {
        let num_samples = self.num_samples();
        (
            batch * num_samples / self.num_mini_batches,
            (batch + 1) * num_samples / self.num_mini_batches,
        )
    }

    fn gather(&self, indices: Vec<usize>) -> Result<MiniBatch> {
        let idx: Vec<u32> = indices.iter().map(|i| *i as u32).collect();
        let idx = Tensor::from_vec(idx, indices.len(), &self.device)?;
        let select = |t: &Tensor| t.index_select(&idx, 0);
        let select_opt = |t: &Option<Tensor>| t.as_ref().map(select).transpose();
        let rollout = &self.rollout;
        Ok(MiniBatch {
            observations: select(&rollout.observations)?,
            contexts: select_opt(&rollout.contexts)?,
            histories: select_opt(&rollout.histories)?,
            actions: select(&rollout.actions)?,
            old_means: select(&rollout.old_means)?,
            old_stds: select(&rollout.old_stds)?,
            old_log_probs: select(&rollout.old_log_probs)?,
            old_values: select(&rollout.old_values)?,
            advantages: select_opt(&rollout.advantages)?,
            returns: select_opt(&rollout.returns)?,
            indices,
        })
    }
}

impl Iterator for MiniBatchGenerator {
    type Item = Result<MiniBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.epoch >= self.num_epochs {
            return None;
        }
        if self.batch == 0 {
            RNG.with_borrow_mut(|rng| self.permutation.shuffle(rng));
        }
        let (start, end) = self.batch_bounds(self.batch);
        let indices = self.permutation[start..end].to_vec();
        self.batch += 1;
        if self.batch == self.num_mini_batches {
            self.batch = 0;
            self.epoch += 1;
        }
        Some(self.gather(indices))
    }
}
