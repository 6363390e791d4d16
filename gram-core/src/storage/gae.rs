/// Generalized advantage estimation over a time-major rollout of `num_envs` instances.
///
/// `rewards`, `values` and `dones` are laid out as `t * num_envs + env`; `last_values` holds the
/// bootstrap value of the observation following the final step. Every instance is computed
/// independently:
///
/// ```text
/// delta[t]     = reward[t] + gamma * (1 - done[t]) * value[t + 1] - value[t]
/// advantage[t] = delta[t] + gamma * lambda * (1 - done[t]) * advantage[t + 1]
/// ```
///
/// Returns `(advantages, returns)` with `returns = advantages + values`.
pub fn compute_gae(
    rewards: &[f32],
    values: &[f32],
    dones: &[bool],
    last_values: &[f32],
    gamma: f32,
    lambda: f32,
) -> (Vec<f32>, Vec<f32>) {
    let num_envs = last_values.len();
    let total = rewards.len();
    debug_assert_eq!(total % num_envs.max(1), 0);
    debug_assert_eq!(values.len(), total);
    debug_assert_eq!(dones.len(), total);
    let horizon = if num_envs == 0 { 0 } else { total / num_envs };
    let mut advantages = vec![0f32; total];
    let mut returns = vec![0f32; total];
    for env in 0..num_envs {
        let mut next_advantage = 0f32;
        let mut next_value = last_values[env];
        for t in (0..horizon).rev() {
            let idx = t * num_envs + env;
            let next_non_terminal = if dones[idx] { 0f32 } else { 1. };
            let delta = rewards[idx] + gamma * next_non_terminal * next_value - values[idx];
            next_advantage = delta + gamma * lambda * next_non_terminal * next_advantage;
            advantages[idx] = next_advantage;
            returns[idx] = next_advantage + values[idx];
            next_value = values[idx];
        }
    }
    (advantages, returns)
}

#[cfg(test)]
mod test {
    use super::compute_gae;

    fn assert_close(actual: &[f32], expected: &[f32]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-4, "{actual:?} != {expected:?}");
        }
    }

    #[test]
    fn terminal_single_step_has_no_bootstrap() {
        let (advantages, returns) = compute_gae(&[2.5], &[0.75], &[true], &[100.], 0.99, 0.95);
        assert_eq!(advantages, vec![2.5 - 0.75]);
        assert_eq!(returns, vec![2.5]);
    }

    #[test]
    fn non_terminal_step_bootstraps_last_value() {
        let (advantages, _) = compute_gae(&[1.], &[0.5], &[false], &[2.], 0.9, 0.95);
        assert_close(&advantages, &[1. + 0.9 * 2. - 0.5]);
    }

    #[test]
    fn instances_are_independent() {
        // two instances, horizon 2; instance 1 terminates at t = 0
        let rewards = [1., 10., 1., 10.];
        let values = [0.; 4];
        let dones = [false, true, false, false];
        let (advantages, _) = compute_gae(&rewards, &values, &dones, &[0., 0.], 1., 1.);
        assert_close(&advantages, &[2., 10., 1., 10.]);
    }
}
