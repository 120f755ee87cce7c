/// Generalized advantage estimation over one ordered batch.
///
/// `bootstrap_value` is the value estimate of the state following the last transition and
/// is ignored if that transition is terminal. With `lambda = 1` this is the discounted
/// return minus the value estimate.
pub fn gae(
    rewards: &[f64],
    values: &[f64],
    dones: &[bool],
    bootstrap_value: f64,
    gamma: f64,
    lambda: f64,
) -> Vec<f64> {
    let n = rewards.len();
    let mut advantages = vec![0.0; n];
    let mut running = 0.0;

    for t in (0..n).rev() {
        let next_value = if t + 1 < n {
            values[t + 1]
        } else {
            bootstrap_value
        };
        let not_done = if dones[t] { 0.0 } else { 1.0 };

        let delta = rewards[t] + gamma * next_value * not_done - values[t];
        running = delta + gamma * lambda * not_done * running;
        advantages[t] = running;
    }

    advantages
}

/// Discounted returns, restarting at terminal transitions
pub fn discounted_returns(
    rewards: &[f64],
    dones: &[bool],
    bootstrap_value: f64,
    gamma: f64,
) -> Vec<f64> {
    let mut returns = vec![0.0; rewards.len()];
    let mut running = bootstrap_value;

    for t in (0..rewards.len()).rev() {
        if dones[t] {
            running = 0.0;
        }
        running = rewards[t] + gamma * running;
        returns[t] = running;
    }

    returns
}

/// Shifts to zero mean and scales to unit variance
pub fn normalize(values: &mut [f64]) {
    if values.len() < 2 {
        return;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let std = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();

    values
        .iter_mut()
        .for_each(|v| *v = (*v - mean) / (std + 1e-8));
}
