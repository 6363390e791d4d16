use crate::error::{GramError, Result};
use candle_core::{Device, Tensor};

/// Rolling window of the last `history_len` (observation, action) pairs of every instance,
/// oldest first and zero padded. This is the adaptation module's input.
#[derive(Debug, Clone)]
pub struct ObservationHistory {
    num_envs: usize,
    history_len: usize,
    observation_size: usize,
    action_size: usize,
    data: Vec<f32>,
}

impl ObservationHistory {
    pub fn new(
        num_envs: usize,
        history_len: usize,
        observation_size: usize,
        action_size: usize,
    ) -> Self {
        let step_size = observation_size + action_size;
        Self {
            num_envs,
            history_len,
            observation_size,
            action_size,
            data: vec![0.; num_envs * history_len * step_size],
        }
    }

    fn step_size(&self) -> usize {
        self.observation_size + self.action_size
    }

    pub fn feature_size(&self) -> usize {
        self.history_len * self.step_size()
    }

    pub fn history_len(&self) -> usize {
        self.history_len
    }

    /// Appends one step for every instance, dropping the oldest entry.
    pub fn push(&mut self, observations: &Tensor, actions: &Tensor) -> Result<()> {
        let expected = [
            [self.num_envs, self.observation_size],
            [self.num_envs, self.action_size],
        ];
        for (what, tensor, expected) in [
            ("history observations", observations, expected[0]),
            ("history actions", actions, expected[1]),
        ] {
            if tensor.dims() != expected {
                return Err(GramError::ShapeMismatch {
                    what,
                    expected: expected.to_vec(),
                    actual: tensor.dims().to_vec(),
                });
            }
        }
        if self.history_len == 0 {
            return Ok(());
        }
        let observations: Vec<Vec<f32>> = observations.to_vec2()?;
        let actions: Vec<Vec<f32>> = actions.to_vec2()?;
        let step_size = self.step_size();
        let env_size = self.feature_size();
        for (env_idx, (obs, act)) in observations.iter().zip(&actions).enumerate() {
            let window = &mut self.data[env_idx * env_size..(env_idx + 1) * env_size];
            window.copy_within(step_size.., 0);
            let newest = &mut window[env_size - step_size..];
            newest[..self.observation_size].copy_from_slice(obs);
            newest[self.observation_size..].copy_from_slice(act);
        }
        Ok(())
    }

    /// Clears the history of instances whose episode just ended.
    pub fn reset_envs(&mut self, env_ids: &[usize]) {
        let env_size = self.feature_size();
        for env_idx in env_ids {
            self.data[env_idx * env_size..(env_idx + 1) * env_size].fill(0.);
        }
    }

    pub fn as_tensor(&self, device: &Device) -> Result<Tensor> {
        let tensor = Tensor::from_slice(&self.data, (self.num_envs, self.feature_size()), device)?;
        Ok(tensor)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn keeps_the_last_steps_oldest_first() -> Result<()> {
        let device = Device::Cpu;
        let mut history = ObservationHistory::new(2, 2, 1, 1);
        for step in 1..=3 {
            let step = step as f32;
            let observations = Tensor::from_vec(vec![step, 10. * step], (2, 1), &device)?;
            let actions = Tensor::from_vec(vec![-step, -10. * step], (2, 1), &device)?;
            history.push(&observations, &actions)?;
        }
        let data: Vec<Vec<f32>> = history.as_tensor(&device)?.to_vec2()?;
        assert_eq!(data[0], vec![2., -2., 3., -3.]);
        assert_eq!(data[1], vec![20., -20., 30., -30.]);

        history.reset_envs(&[1]);
        let data: Vec<Vec<f32>> = history.as_tensor(&device)?.to_vec2()?;
        assert_eq!(data[0], vec![2., -2., 3., -3.]);
        assert_eq!(data[1], vec![0.; 4]);
        Ok(())
    }

    #[test]
    fn rejects_wrong_batch_size() {
        let device = Device::Cpu;
        let mut history = ObservationHistory::new(3, 4, 2, 1);
        let observations = Tensor::zeros((2, 2), candle_core::DType::F32, &device).unwrap();
        let actions = Tensor::zeros((2, 1), candle_core::DType::F32, &device).unwrap();
        assert!(matches!(
            history.push(&observations, &actions),
            Err(GramError::ShapeMismatch { .. })
        ));
    }
}
