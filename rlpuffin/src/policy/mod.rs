//! Actor-critic policy over the mutation strategies.
//!
//! The actor maps a [`StateVector`] to logits over [`Action`], the critic maps it to a
//! scalar value estimate. Both are independent [`Mlp`]s and hold the only trainable
//! parameters of the system.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::feedback::{StateVector, STATE_DIM};
use crate::fuzzer::Action;

pub mod network;
pub mod optim;

pub use network::{Activations, Mlp};
pub use optim::Adam;

/// Initial scale of the last actor layer, keeps the first distribution close to uniform
const ACTOR_OUTPUT_GAIN: f64 = 0.01;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActorCritic {
    actor: Mlp,
    critic: Mlp,
}

/// An action drawn from the policy together with the data PPO needs later
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Decision {
    pub action: Action,
    pub log_prob: f64,
    pub value: f64,
}

impl ActorCritic {
    pub fn new(hidden: &[usize], seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        Self::with_rng(hidden, &mut rng)
    }

    pub fn with_rng<R: Rng>(hidden: &[usize], rng: &mut R) -> Self {
        Self {
            actor: Mlp::new(STATE_DIM, hidden, Action::COUNT, ACTOR_OUTPUT_GAIN, rng),
            critic: Mlp::new(STATE_DIM, hidden, 1, 1.0, rng),
        }
    }

    pub fn actor(&self) -> &Mlp {
        &self.actor
    }

    pub fn critic(&self) -> &Mlp {
        &self.critic
    }

    pub fn actor_mut(&mut self) -> &mut Mlp {
        &mut self.actor
    }

    pub fn critic_mut(&mut self) -> &mut Mlp {
        &mut self.critic
    }

    pub fn logits(&self, state: &StateVector) -> Vec<f64> {
        self.actor.forward(&state.as_array())
    }

    /// Categorical distribution over [`Action::ALL`]
    pub fn distribution(&self, state: &StateVector) -> Vec<f64> {
        softmax(&self.logits(state))
    }

    pub fn value(&self, state: &StateVector) -> f64 {
        self.critic
            .forward(&state.as_array())
            .first()
            .copied()
            .unwrap_or(0.0)
    }

    pub fn log_prob(&self, state: &StateVector, action: Action) -> f64 {
        log_softmax(&self.logits(state))[action.index()]
    }

    /// Most probable action, for deterministic evaluation
    pub fn greedy(&self, state: &StateVector) -> Action {
        let logits = self.logits(state);
        let best = logits
            .iter()
            .enumerate()
            .fold(0, |best, (i, l)| if *l > logits[best] { i } else { best });
        Action::from_index(best).unwrap_or(Action::Havoc)
    }

    /// Samples an action, or takes the argmax if `greedy` is set
    pub fn act<R: Rng>(&self, state: &StateVector, rng: &mut R, greedy: bool) -> Decision {
        let log_probs = log_softmax(&self.logits(state));

        let index = if greedy {
            self.greedy(state).index()
        } else {
            let u: f64 = rng.gen();
            let mut cumulative = 0.0;
            log_probs
                .iter()
                .position(|lp| {
                    cumulative += lp.exp();
                    u < cumulative
                })
                .unwrap_or(log_probs.len() - 1)
        };

        let action = Action::from_index(index).unwrap_or(Action::Havoc);
        Decision {
            action,
            log_prob: log_probs[action.index()],
            value: self.value(state),
        }
    }

    pub fn is_finite(&self) -> bool {
        self.actor.is_finite() && self.critic.is_finite()
    }

    /// Checks the shapes of both networks: the actor maps a state to one logit per action,
    /// the critic to a single value.
    pub fn validate(&self) -> Result<(), String> {
        self.actor
            .validate(STATE_DIM, Action::COUNT)
            .map_err(|err| format!("actor: {}", err))?;
        self.critic
            .validate(STATE_DIM, 1)
            .map_err(|err| format!("critic: {}", err))?;
        if !self.is_finite() {
            return Err("policy contains non-finite parameters".to_string());
        }
        Ok(())
    }
}

pub fn log_softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let log_sum = logits.iter().map(|l| (l - max).exp()).sum::<f64>().ln() + max;
    logits.iter().map(|l| l - log_sum).collect()
}

pub fn softmax(logits: &[f64]) -> Vec<f64> {
    log_softmax(logits).into_iter().map(f64::exp).collect()
}

/// Shannon entropy of a distribution given by its log-probabilities
pub fn entropy(log_probs: &[f64]) -> f64 {
    -log_probs.iter().map(|lp| lp.exp() * lp).sum::<f64>()
}
