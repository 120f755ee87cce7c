use serde::{Deserialize, Serialize};

use crate::policy::network::Mlp;

/// Adam over the flat parameter vector of one network
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Adam {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    step: u64,
    m: Vec<f64>,
    v: Vec<f64>,
}

impl Adam {
    pub fn new(param_count: usize, learning_rate: f64) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            step: 0,
            m: vec![0.0; param_count],
            v: vec![0.0; param_count],
        }
    }

    pub fn steps(&self) -> u64 {
        self.step
    }

    /// Checks that the moments fit a network with `param_count` parameters
    pub fn validate(&self, param_count: usize) -> Result<(), String> {
        if self.m.len() != param_count || self.v.len() != param_count {
            return Err(format!(
                "optimizer moments of length {}/{} for {} parameters",
                self.m.len(),
                self.v.len(),
                param_count
            ));
        }
        let finite = [self.learning_rate, self.beta1, self.beta2, self.epsilon]
            .iter()
            .chain(&self.m)
            .chain(&self.v)
            .all(|x| x.is_finite());
        if !finite || self.learning_rate <= 0.0 {
            return Err("optimizer state is not finite".to_string());
        }
        Ok(())
    }

    pub fn step(&mut self, network: &mut Mlp, grads: &[f64]) {
        self.step += 1;
        let t = self.step as i32;
        let correction1 = 1.0 - self.beta1.powi(t);
        let correction2 = 1.0 - self.beta2.powi(t);

        let Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            m,
            v,
            ..
        } = self;

        network.for_each_param_mut(|i, param| {
            let g = grads[i];
            m[i] = *beta1 * m[i] + (1.0 - *beta1) * g;
            v[i] = *beta2 * v[i] + (1.0 - *beta2) * g * g;
            let m_hat = m[i] / correction1;
            let v_hat = v[i] / correction2;
            *param -= *learning_rate * m_hat / (v_hat.sqrt() + *epsilon);
        });
    }
}

/// Global L2 norm over several gradient vectors
pub fn global_norm(grads: &[&[f64]]) -> f64 {
    grads
        .iter()
        .flat_map(|g| g.iter())
        .map(|g| g * g)
        .sum::<f64>()
        .sqrt()
}

/// Scales all gradients down so that their joint norm is at most `max_norm`. Returns the
/// norm before clipping.
pub fn clip_global_norm(grads: &mut [&mut Vec<f64>], max_norm: f64) -> f64 {
    let norm = grads
        .iter()
        .flat_map(|g| g.iter())
        .map(|g| g * g)
        .sum::<f64>()
        .sqrt();

    if norm > max_norm && norm.is_finite() {
        let scale = max_norm / (norm + 1e-12);
        for g in grads.iter_mut() {
            g.iter_mut().for_each(|x| *x *= scale);
        }
    }
    norm
}
