/// Per-instance return and length accumulators over auto-resetting environments.
#[derive(Debug, Clone)]
pub struct EpisodeTracker {
    returns: Vec<f32>,
    lengths: Vec<usize>,
    completed_returns: Vec<f32>,
    completed_lengths: Vec<usize>,
}

impl EpisodeTracker {
    pub fn new(num_envs: usize) -> Self {
        Self {
            returns: vec![0.; num_envs],
            lengths: vec![0; num_envs],
            completed_returns: vec![],
            completed_lengths: vec![],
        }
    }

    pub fn record(&mut self, rewards: &[f32], dones: &[bool]) {
        for (env, (reward, done)) in rewards.iter().zip(dones).enumerate() {
            self.returns[env] += reward;
            self.lengths[env] += 1;
            if *done {
                self.completed_returns.push(self.returns[env]);
                self.completed_lengths.push(self.lengths[env]);
                self.returns[env] = 0.;
                self.lengths[env] = 0;
            }
        }
    }

    /// Episodes completed since the last call.
    pub fn drain(&mut self) -> (Vec<f32>, Vec<usize>) {
        (
            std::mem::take(&mut self.completed_returns),
            std::mem::take(&mut self.completed_lengths),
        )
    }
}

pub(crate) fn mean(values: impl ExactSizeIterator<Item = f32>) -> Option<f32> {
    let n = values.len();
    (n > 0).then(|| values.sum::<f32>() / n as f32)
}
