/// The probability ratio clipped to `[1 - epsilon, 1 + epsilon]`, times the advantage
pub fn clipped_term(ratio: f64, advantage: f64, epsilon: f64) -> f64 {
    ratio.clamp(1.0 - epsilon, 1.0 + epsilon) * advantage
}

/// Per-sample clipped surrogate
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Surrogate {
    /// `min(r * A, clip(r) * A)`, to be maximised
    pub objective: f64,
    /// Derivative of the loss `-objective` with respect to the new log-probability
    pub grad_log_prob: f64,
    /// Whether the ratio left the trust region
    pub clipped: bool,
}

pub fn clipped_surrogate(ratio: f64, advantage: f64, epsilon: f64) -> Surrogate {
    let unclipped = ratio * advantage;
    let clipped = clipped_term(ratio, advantage, epsilon);

    // The unclipped branch is the active one: d(r * A)/d(log p) = r * A
    let (objective, grad_log_prob) = if unclipped <= clipped {
        (unclipped, -advantage * ratio)
    } else {
        (clipped, 0.0)
    };

    Surrogate {
        objective,
        grad_log_prob,
        clipped: (ratio - 1.0).abs() > epsilon,
    }
}

/// Derivative of the entropy with respect to the logits, given the log-probabilities
/// and the entropy itself
pub fn entropy_grad(log_probs: &[f64], entropy: f64) -> Vec<f64> {
    log_probs
        .iter()
        .map(|lp| -lp.exp() * (lp + entropy))
        .collect()
}
