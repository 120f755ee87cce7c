//! Proximal policy optimization over a drained experience buffer.

use std::fmt;

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::buffer::Transition;
use crate::cancel::CancelToken;
use crate::config::RlConfig;
use crate::error::Error;
use crate::fuzzer::Action;
use crate::policy::optim::clip_global_norm;
use crate::policy::{entropy, log_softmax, ActorCritic, Adam};

pub mod advantage;
pub mod loss;

use advantage::{gae, normalize};
use loss::{clipped_surrogate, entropy_grad};

/// Mutable training state, owned by whoever drives the training and handed to every
/// update.
#[derive(Clone, Debug)]
pub struct TrainerContext {
    /// Optimizer steps taken so far, one per minibatch
    pub training_step: u64,
    /// Completed training passes
    pub updates: u64,
    pub consecutive_divergences: usize,
    pub actor_optimizer: Adam,
    pub critic_optimizer: Adam,
    rng: StdRng,
}

impl TrainerContext {
    pub fn new(policy: &ActorCritic, learning_rate: f64, seed: u64) -> Self {
        Self {
            training_step: 0,
            updates: 0,
            consecutive_divergences: 0,
            actor_optimizer: Adam::new(policy.actor().param_count(), learning_rate),
            critic_optimizer: Adam::new(policy.critic().param_count(), learning_rate),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TrainingReport {
    pub samples: usize,
    /// Minibatch updates applied
    pub steps: usize,
    pub total_loss: f64,
    pub policy_loss: f64,
    pub value_loss: f64,
    pub entropy: f64,
    /// Mean of `old_log_prob - new_log_prob` before each step
    pub approx_kl: f64,
    pub clip_fraction: f64,
    /// Cancellation stopped the pass at an epoch boundary
    pub cancelled: bool,
    /// The pass hit a non-finite loss and was rolled back
    pub diverged: bool,
}

impl fmt::Display for TrainingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "samples: {}, steps: {}, loss: {:.4}, policy: {:.4}, value: {:.4}, entropy: {:.4}, \
             kl: {:.5}, clipped: {:.1}%",
            self.samples,
            self.steps,
            self.total_loss,
            self.policy_loss,
            self.value_loss,
            self.entropy,
            self.approx_kl,
            self.clip_fraction * 100.0
        )
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct MinibatchStats {
    total_loss: f64,
    policy_loss: f64,
    value_loss: f64,
    entropy: f64,
    approx_kl: f64,
    clip_fraction: f64,
}

#[derive(Clone, Debug)]
pub struct PpoTrainer {
    pub epochs: usize,
    pub minibatch_size: usize,
    pub clip_epsilon: f64,
    pub gamma: f64,
    pub gae_lambda: f64,
    pub value_coeff: f64,
    pub entropy_coeff: f64,
    pub max_grad_norm: f64,
    pub max_consecutive_divergences: usize,
}

impl PpoTrainer {
    pub fn new(config: &RlConfig) -> Self {
        Self {
            epochs: config.epochs,
            minibatch_size: config.minibatch_size.max(1),
            clip_epsilon: config.clip_epsilon,
            gamma: config.gamma,
            gae_lambda: config.gae_lambda,
            value_coeff: config.value_coeff,
            entropy_coeff: config.entropy_coeff,
            max_grad_norm: config.max_grad_norm,
            max_consecutive_divergences: config.max_consecutive_divergences,
        }
    }

    /// Advantages (normalized) and return targets of an ordered batch
    pub fn targets(&self, batch: &[Transition], bootstrap_value: f64) -> (Vec<f64>, Vec<f64>) {
        let rewards: Vec<f64> = batch.iter().map(|t| t.reward).collect();
        let values: Vec<f64> = batch.iter().map(|t| t.value_estimate).collect();
        let dones: Vec<bool> = batch.iter().map(|t| t.done).collect();

        let mut advantages = gae(
            &rewards,
            &values,
            &dones,
            bootstrap_value,
            self.gamma,
            self.gae_lambda,
        );
        let returns = advantages
            .iter()
            .zip(&values)
            .map(|(a, v)| a + v)
            .collect();
        normalize(&mut advantages);

        (advantages, returns)
    }

    /// Runs several epochs of clipped-surrogate updates on `batch`.
    ///
    /// A non-finite loss rolls the policy and the optimizers back to their state at the
    /// start of the pass. Once that happened `max_consecutive_divergences` times in a row
    /// the update fails with [`Error::TrainingDivergence`].
    pub fn update(
        &self,
        policy: &mut ActorCritic,
        ctx: &mut TrainerContext,
        batch: &[Transition],
        bootstrap_value: f64,
        cancel: &CancelToken,
    ) -> Result<TrainingReport, Error> {
        let mut report = TrainingReport {
            samples: batch.len(),
            ..TrainingReport::default()
        };
        if batch.is_empty() {
            return Ok(report);
        }

        let (advantages, returns) = self.targets(batch, bootstrap_value);
        let saved = (
            policy.clone(),
            ctx.actor_optimizer.clone(),
            ctx.critic_optimizer.clone(),
            ctx.training_step,
        );

        let mut indices: Vec<usize> = (0..batch.len()).collect();
        let mut sums = MinibatchStats::default();

        'epochs: for epoch in 0..self.epochs {
            if epoch > 0 && cancel.is_cancelled() {
                debug!("Training cancelled after {} epochs", epoch);
                report.cancelled = true;
                break;
            }
            indices.shuffle(&mut ctx.rng);

            for chunk in indices.chunks(self.minibatch_size) {
                match self.step(policy, ctx, batch, &advantages, &returns, chunk) {
                    Some(stats) => {
                        sums.total_loss += stats.total_loss;
                        sums.policy_loss += stats.policy_loss;
                        sums.value_loss += stats.value_loss;
                        sums.entropy += stats.entropy;
                        sums.approx_kl += stats.approx_kl;
                        sums.clip_fraction += stats.clip_fraction;
                        report.steps += 1;
                    }
                    None => {
                        report.diverged = true;
                        break 'epochs;
                    }
                }
            }
        }

        if report.diverged {
            let (saved_policy, actor_optimizer, critic_optimizer, training_step) = saved;
            *policy = saved_policy;
            ctx.actor_optimizer = actor_optimizer;
            ctx.critic_optimizer = critic_optimizer;
            ctx.training_step = training_step;
            ctx.consecutive_divergences += 1;

            warn!(
                "Non-finite loss, discarded training pass ({} of {} allowed in a row)",
                ctx.consecutive_divergences, self.max_consecutive_divergences
            );
            if ctx.consecutive_divergences >= self.max_consecutive_divergences {
                return Err(Error::TrainingDivergence {
                    consecutive: ctx.consecutive_divergences,
                });
            }
            return Ok(TrainingReport {
                samples: batch.len(),
                diverged: true,
                ..TrainingReport::default()
            });
        }

        ctx.consecutive_divergences = 0;
        ctx.updates += 1;

        if report.steps > 0 {
            let n = report.steps as f64;
            report.total_loss = sums.total_loss / n;
            report.policy_loss = sums.policy_loss / n;
            report.value_loss = sums.value_loss / n;
            report.entropy = sums.entropy / n;
            report.approx_kl = sums.approx_kl / n;
            report.clip_fraction = sums.clip_fraction / n;
        }
        info!("Training pass {}: {}", ctx.updates, report);
        Ok(report)
    }

    /// One optimizer step on the transitions at `indices`. Returns `None` without touching
    /// the parameters if the loss or the gradient is not finite.
    fn step(
        &self,
        policy: &mut ActorCritic,
        ctx: &mut TrainerContext,
        batch: &[Transition],
        advantages: &[f64],
        returns: &[f64],
        indices: &[usize],
    ) -> Option<MinibatchStats> {
        let m = indices.len() as f64;
        let mut actor_grads = vec![0.0; policy.actor().param_count()];
        let mut critic_grads = vec![0.0; policy.critic().param_count()];
        let mut stats = MinibatchStats::default();

        for &i in indices {
            let transition = &batch[i];
            let input = transition.state.as_array();
            let advantage = advantages[i];

            let actor_pass = policy.actor().forward_cached(&input);
            let log_probs = log_softmax(actor_pass.output());
            let action = transition.action.index();
            let new_log_prob = log_probs[action];

            let ratio = (new_log_prob - transition.log_prob).exp();
            let surrogate = clipped_surrogate(ratio, advantage, self.clip_epsilon);
            let h = entropy(&log_probs);
            let h_grad = entropy_grad(&log_probs, h);

            // d(-objective - c_e * H)/d(logits), averaged over the minibatch
            let logits_grad: Vec<f64> = (0..Action::COUNT)
                .map(|j| {
                    let onehot = if j == action { 1.0 } else { 0.0 };
                    let p = log_probs[j].exp();
                    (surrogate.grad_log_prob * (onehot - p) - self.entropy_coeff * h_grad[j]) / m
                })
                .collect();
            policy
                .actor()
                .backward(&actor_pass, &logits_grad, &mut actor_grads);

            let critic_pass = policy.critic().forward_cached(&input);
            let value = critic_pass.output().first().copied().unwrap_or(0.0);
            let error = value - returns[i];
            policy.critic().backward(
                &critic_pass,
                &[2.0 * self.value_coeff * error / m],
                &mut critic_grads,
            );

            stats.policy_loss -= surrogate.objective / m;
            stats.value_loss += error * error / m;
            stats.entropy += h / m;
            stats.approx_kl += (transition.log_prob - new_log_prob) / m;
            if surrogate.clipped {
                stats.clip_fraction += 1.0 / m;
            }
        }

        stats.total_loss = stats.policy_loss + self.value_coeff * stats.value_loss
            - self.entropy_coeff * stats.entropy;

        let norm = clip_global_norm(&mut [&mut actor_grads, &mut critic_grads], self.max_grad_norm);
        if !stats.total_loss.is_finite() || !norm.is_finite() {
            return None;
        }

        ctx.actor_optimizer.step(policy.actor_mut(), &actor_grads);
        ctx.critic_optimizer.step(policy.critic_mut(), &critic_grads);
        ctx.training_step += 1;

        if policy.is_finite() {
            Some(stats)
        } else {
            None
        }
    }
}
