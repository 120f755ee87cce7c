//! Versioned JSON snapshots of the policy and its training state.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::policy::{ActorCritic, Adam};
use crate::ppo::TrainerContext;

pub const FORMAT: &str = "rlpuffin-policy";
pub const VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub format: String,
    pub version: u32,
    pub training_step: u64,
    pub updates: u64,
    pub policy: ActorCritic,
    pub actor_optimizer: Adam,
    pub critic_optimizer: Adam,
}

impl Checkpoint {
    pub fn new(policy: &ActorCritic, ctx: &TrainerContext) -> Self {
        Self {
            format: FORMAT.to_string(),
            version: VERSION,
            training_step: ctx.training_step,
            updates: ctx.updates,
            policy: policy.clone(),
            actor_optimizer: ctx.actor_optimizer.clone(),
            critic_optimizer: ctx.critic_optimizer.clone(),
        }
    }

    /// Writes next to `path` first and renames, an interrupted save keeps the old file
    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let staging = path.with_extension("json.tmp");
        let content = serde_json::to_string(self)?;
        fs::write(&staging, content)
            .and_then(|_| fs::rename(&staging, path))
            .map_err(|err| Error::Checkpoint(format!("{}: {}", path.display(), err)))
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let content = fs::read_to_string(path)
            .map_err(|err| Error::Checkpoint(format!("{}: {}", path.display(), err)))?;
        let checkpoint: Checkpoint = serde_json::from_str(&content)?;

        if checkpoint.format != FORMAT || checkpoint.version != VERSION {
            return Err(Error::Checkpoint(format!(
                "{}: unsupported checkpoint {} v{}, expected {} v{}",
                path.display(),
                checkpoint.format,
                checkpoint.version,
                FORMAT,
                VERSION
            )));
        }
        checkpoint
            .validate()
            .map_err(|err| Error::Checkpoint(format!("{}: {}", path.display(), err)))?;
        Ok(checkpoint)
    }

    fn validate(&self) -> Result<(), String> {
        self.policy.validate()?;
        self.actor_optimizer
            .validate(self.policy.actor().param_count())
            .map_err(|err| format!("actor optimizer: {}", err))?;
        self.critic_optimizer
            .validate(self.policy.critic().param_count())
            .map_err(|err| format!("critic optimizer: {}", err))
    }

    /// Restores the training context around the saved counters and optimizer moments
    pub fn restore(&self, seed: u64) -> (ActorCritic, TrainerContext) {
        let policy = self.policy.clone();
        let mut ctx = TrainerContext::new(&policy, self.actor_optimizer.learning_rate, seed);
        ctx.training_step = self.training_step;
        ctx.updates = self.updates;
        ctx.actor_optimizer = self.actor_optimizer.clone();
        ctx.critic_optimizer = self.critic_optimizer.clone();
        (policy, ctx)
    }
}
