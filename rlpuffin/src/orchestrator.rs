//! The control loop of a campaign.
//!
//! One thread drives everything: it launches the fuzzer, polls its statistics at a fixed
//! interval, turns them into feedback, lets the policy pick the next mutation strategy and
//! trains the policy whenever the experience buffer is full. Training blocks the loop;
//! the fuzzer keeps running meanwhile and the next poll picks up whatever happened, with
//! deltas taken against the last snapshot before training, so nothing observed during
//! training is lost.

use std::fmt;
use std::fs::{self, File};
use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::buffer::{ExperienceBuffer, Transition};
use crate::cancel::CancelToken;
use crate::checkpoint::Checkpoint;
use crate::config::RlConfig;
use crate::error::Error;
use crate::feedback::{Feedback, FeedbackTranslator, StateVector, StepContext, Termination};
use crate::fuzzer::{
    count_entries, FuzzerBackend, FuzzerProcess, StrategyChannel, STRATEGY_FILE_ENV,
};
use crate::metrics::{write_json, MetricsRecorder, MetricsRow, ResultsSummary, Summary};
use crate::policy::{ActorCritic, Decision};
use crate::ppo::{PpoTrainer, TrainerContext};
use crate::telemetry::{MetricsSnapshot, TelemetryReader};

pub const CHECKPOINT_FILE: &str = "checkpoint.json";
pub const RESULTS_FILE: &str = "results_summary.json";
pub const FUZZER_OUTPUT_DIR: &str = "fuzzer";
const STRATEGY_FILE: &str = "strategy";
const FUZZER_LOG: &str = "fuzzer.log";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// The fuzzer runs on its own, the loop only observes
    Baseline,
    /// The policy picks the mutation strategy and is trained online
    RlEnhanced,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Baseline => write!(f, "baseline"),
            Mode::RlEnhanced => write!(f, "rl-enhanced"),
        }
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "baseline" => Ok(Mode::Baseline),
            "rl-enhanced" => Ok(Mode::RlEnhanced),
            _ => Err(Error::Config(format!("unknown mode `{}`", s))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Starting,
    Running,
    Training,
    Stopping,
    Stopped,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StopReason {
    Terminated(Termination),
    Cancelled,
    Failed(Error),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Terminated(termination) => write!(f, "{}", termination),
            StopReason::Cancelled => write!(f, "cancelled"),
            StopReason::Failed(err) => write!(f, "failed: {}", err),
        }
    }
}

/// Everything needed to run one campaign
#[derive(Clone, Debug)]
pub struct Campaign<B> {
    pub backend: B,
    pub target: PathBuf,
    pub mode: Mode,
    pub duration: Duration,
    /// Experiment directory, receives metrics, checkpoints and the fuzzer output
    pub directory: PathBuf,
    pub config: RlConfig,
    /// Checkpoint to start the policy from instead of a fresh initialisation
    pub resume_from: Option<PathBuf>,
    /// Always take the most probable action and do not train
    pub greedy: bool,
}

impl<B: FuzzerBackend> Campaign<B> {
    pub fn output_dir(&self) -> PathBuf {
        self.directory.join(FUZZER_OUTPUT_DIR)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.directory.join(CHECKPOINT_FILE)
    }
}

#[derive(Clone, Debug)]
pub struct CampaignReport {
    pub mode: Mode,
    pub stop_reason: StopReason,
    pub summary: Summary,
    pub results: ResultsSummary,
    pub training_passes: u64,
}

/// Observed state and the decision taken in it, waiting for the reward of the next poll
#[derive(Clone, Copy, Debug)]
struct Pending {
    state: StateVector,
    decision: Decision,
}

/// Policy, training state and experience of an RL-enhanced campaign
struct Agent {
    policy: ActorCritic,
    ctx: TrainerContext,
    trainer: PpoTrainer,
    buffer: ExperienceBuffer,
    pending: Option<Pending>,
    /// Policy as of the last checkpoint, the fallback when training diverges
    last_good: ActorCritic,
    greedy: bool,
    checkpoint_every: u64,
    checkpoint_path: PathBuf,
}

impl Agent {
    fn new<B: FuzzerBackend>(campaign: &Campaign<B>) -> Result<Self, Error> {
        let config = &campaign.config;
        let seed = config.seed.unwrap_or_else(rand::random);

        let (policy, ctx) = match &campaign.resume_from {
            Some(path) => {
                let checkpoint = Checkpoint::load(path)?;
                info!(
                    "Resuming policy from {} after {} updates",
                    path.display(),
                    checkpoint.updates
                );
                checkpoint.restore(seed)
            }
            None => {
                let policy = ActorCritic::new(&config.hidden_layers, seed);
                let ctx = TrainerContext::new(&policy, config.learning_rate, seed.wrapping_add(1));
                (policy, ctx)
            }
        };

        Ok(Self {
            last_good: policy.clone(),
            policy,
            ctx,
            trainer: PpoTrainer::new(config),
            buffer: ExperienceBuffer::new(config.buffer_capacity),
            pending: None,
            greedy: campaign.greedy,
            checkpoint_every: config.checkpoint_every_updates,
            checkpoint_path: campaign.checkpoint_path(),
        })
    }

    /// Completes the pending transition with the outcome observed in `feedback`
    fn observe(&mut self, feedback: &Feedback) -> Result<(), Error> {
        if let Some(pending) = self.pending.take() {
            if self.greedy {
                return Ok(());
            }
            self.buffer.append(Transition {
                state: pending.state,
                action: pending.decision.action,
                reward: feedback.reward,
                log_prob: pending.decision.log_prob,
                value_estimate: pending.decision.value,
                done: feedback.done(),
            })?;
        }
        Ok(())
    }

    fn decide(&mut self, state: StateVector) -> Decision {
        let decision = self.policy.act(&state, self.ctx.rng(), self.greedy);
        self.pending = Some(Pending { state, decision });
        decision
    }

    /// Trains on the buffered transitions. `next_state` follows the last of them and is
    /// `None` if the episode ended there.
    fn train(
        &mut self,
        next_state: Option<StateVector>,
        cancel: &CancelToken,
    ) -> Result<(), Error> {
        let batch = self.buffer.drain();
        let bootstrap = next_state.map_or(0.0, |state| self.policy.value(&state));

        match self
            .trainer
            .update(&mut self.policy, &mut self.ctx, &batch, bootstrap, cancel)
        {
            Ok(report) => {
                if !report.diverged
                    && self.checkpoint_every > 0
                    && self.ctx.updates % self.checkpoint_every == 0
                {
                    self.checkpoint();
                }
                Ok(())
            }
            Err(err) => {
                error!("{}, rolling back to the last checkpointed policy", err);
                self.policy = self.last_good.clone();
                Err(err)
            }
        }
    }

    /// Persists the policy. A failed write is reported and the campaign goes on.
    fn checkpoint(&mut self) {
        self.last_good = self.policy.clone();
        match Checkpoint::new(&self.policy, &self.ctx).save(&self.checkpoint_path) {
            Ok(()) => debug!(
                "Saved checkpoint after {} updates to {}",
                self.ctx.updates,
                self.checkpoint_path.display()
            ),
            Err(err) => warn!("{}", err),
        }
    }
}

pub struct Orchestrator<B: FuzzerBackend> {
    campaign: Campaign<B>,
    cancel: CancelToken,
    state: LoopState,
    translator: FeedbackTranslator,
    reader: TelemetryReader,
    channel: StrategyChannel,
    agent: Option<Agent>,
    last_snapshot: Option<MetricsSnapshot>,
    read_failures: usize,
    tick: u64,
    stop_reason: Option<StopReason>,
}

impl<B: FuzzerBackend> Orchestrator<B> {
    pub fn new(campaign: Campaign<B>, cancel: CancelToken) -> Result<Self, Error> {
        campaign.config.validate()?;

        let agent = match campaign.mode {
            Mode::RlEnhanced => Some(Agent::new(&campaign)?),
            Mode::Baseline => None,
        };
        let reader = TelemetryReader::new(
            campaign.backend.stats_file(&campaign.output_dir()),
            campaign.backend.schema(),
            campaign.config.telemetry_read_attempts,
        );

        Ok(Self {
            translator: FeedbackTranslator::new(&campaign.config, campaign.duration),
            channel: StrategyChannel::new(campaign.directory.join(STRATEGY_FILE)),
            reader,
            agent,
            campaign,
            cancel,
            state: LoopState::Starting,
            last_snapshot: None,
            read_failures: 0,
            tick: 0,
            stop_reason: None,
        })
    }

    fn transition(&mut self, state: LoopState) {
        debug!("[{}] {:?} -> {:?}", self.campaign.mode, self.state, state);
        self.state = state;
    }

    /// Runs the campaign to completion. Fails if the fuzzer cannot be launched or if
    /// training diverged; in the latter case results and a checkpoint are still written.
    pub fn run(mut self) -> Result<CampaignReport, Error> {
        let mut process = match self.start() {
            Ok(process) => process,
            Err(err) => {
                error!("{}", err);
                self.transition(LoopState::Stopped);
                return Err(err);
            }
        };
        let mut recorder = MetricsRecorder::create(&self.campaign.directory)?;
        let started = Instant::now();
        self.transition(LoopState::Running);

        while self.state == LoopState::Running {
            if self.cancel.sleep(self.campaign.config.poll_interval()) {
                info!("[{}] Cancelled", self.campaign.mode);
                self.stop(StopReason::Cancelled);
                break;
            }

            let ctx = self.poll_context(started, &mut process);
            if let Err(err) = self.tick(&ctx, &mut recorder) {
                error!("{}", err);
                self.stop(StopReason::Failed(err));
            }
        }

        self.shutdown(process, recorder, started)
    }

    fn start(&mut self) -> Result<FuzzerProcess, Error> {
        let output_dir = self.campaign.output_dir();
        fs::create_dir_all(&output_dir)?;

        let strategy_file = self.agent.as_ref().map(|_| self.channel.path());
        let mut command =
            self.campaign
                .backend
                .command(&self.campaign.target, &output_dir, strategy_file);
        if let Some(path) = strategy_file {
            command.env(STRATEGY_FILE_ENV, path);
        }

        let log = File::create(self.campaign.directory.join(FUZZER_LOG))?;
        command.stdout(Stdio::from(log.try_clone()?));
        command.stderr(Stdio::from(log));

        info!(
            "[{}] Launching {} on {}",
            self.campaign.mode,
            self.campaign.backend.name(),
            self.campaign.target.display()
        );
        self.translator.reset();
        FuzzerProcess::spawn(command, self.campaign.config.shutdown_grace())
    }

    fn poll_context(&mut self, started: Instant, process: &mut FuzzerProcess) -> StepContext {
        match self.reader.read() {
            Ok(Some(snapshot)) => {
                self.read_failures = 0;
                self.last_snapshot = Some(snapshot);
            }
            Ok(None) => debug!("No statistics at {} yet", self.reader.path().display()),
            Err(err) => {
                self.read_failures += 1;
                warn!(
                    "Failed to read statistics ({} in a row): {}",
                    self.read_failures, err
                );
            }
        }

        StepContext {
            wall_elapsed: started.elapsed(),
            fuzzer_running: process.is_running(),
            consecutive_read_failures: self.read_failures,
        }
    }

    fn tick(&mut self, ctx: &StepContext, recorder: &mut MetricsRecorder) -> Result<(), Error> {
        // Only a fresh snapshot moves the environment forward
        let snapshot = match (self.read_failures, self.last_snapshot) {
            (0, Some(snapshot)) if self.translator.previous() != Some(&snapshot) => snapshot,
            _ => {
                if let Some(termination) = self
                    .translator
                    .termination(self.last_snapshot.as_ref(), ctx)
                {
                    info!("[{}] Stopping: {}", self.campaign.mode, termination);
                    self.stop(StopReason::Terminated(termination));
                }
                return Ok(());
            }
        };

        self.tick += 1;
        let feedback = self.translator.step(&snapshot, ctx);
        info!("[{}] {}", self.campaign.mode, snapshot);

        let action = match self.agent.as_mut() {
            Some(agent) => {
                agent.observe(&feedback)?;
                if agent.buffer.is_full() {
                    self.state = LoopState::Training;
                    debug!("[{}] Running -> Training", self.campaign.mode);
                    let next_state = (!feedback.done()).then_some(feedback.state);
                    agent.train(next_state, &self.cancel)?;
                    self.state = LoopState::Running;
                    debug!("[{}] Training -> Running", self.campaign.mode);
                }

                if feedback.done() {
                    None
                } else {
                    let decision = agent.decide(feedback.state);
                    let directive = self.campaign.backend.encode_strategy(decision.action);
                    if let Err(err) = self.channel.apply(decision.action, &directive) {
                        warn!("Failed to hand strategy {} to the fuzzer: {}", decision.action, err);
                    }
                    Some(decision.action)
                }
            }
            None => None,
        };

        recorder.record(MetricsRow {
            tick: self.tick,
            mode: self.campaign.mode,
            timestamp_seconds: Utc::now().timestamp_millis() as f64 / 1000.0,
            snapshot,
            reward: Some(feedback.reward),
            action,
            interesting: feedback.interesting,
        })?;

        if let Some(termination) = feedback.termination {
            info!("[{}] Stopping: {}", self.campaign.mode, termination);
            self.stop(StopReason::Terminated(termination));
        }
        Ok(())
    }

    fn stop(&mut self, reason: StopReason) {
        if self.stop_reason.is_none() {
            self.stop_reason = Some(reason);
        }
        self.transition(LoopState::Stopping);
    }

    fn shutdown(
        mut self,
        mut process: FuzzerProcess,
        recorder: MetricsRecorder,
        started: Instant,
    ) -> Result<CampaignReport, Error> {
        let mut failure = match &self.stop_reason {
            Some(StopReason::Failed(err)) => Some(err.clone()),
            _ => None,
        };

        if let Some(agent) = self.agent.as_mut() {
            if failure.is_none() && !agent.buffer.is_empty() {
                if self.campaign.config.train_on_partial_buffer {
                    info!(
                        "Training on the remaining {} transitions",
                        agent.buffer.len()
                    );
                    let next_state = agent.pending.map(|pending| pending.state);
                    if let Err(err) = agent.train(next_state, &self.cancel) {
                        failure = Some(err.clone());
                        self.stop_reason = Some(StopReason::Failed(err));
                    }
                } else {
                    debug!("Dropping {} transitions", agent.buffer.len());
                    agent.buffer.drain();
                }
            }
            if !agent.greedy {
                agent.checkpoint();
            }
        }

        if let Err(err) = process.terminate() {
            warn!("{}", err);
        }

        let summary = recorder.finish()?;
        let output_dir = self.campaign.output_dir();
        let results = ResultsSummary {
            mode: self.campaign.mode,
            target: self.campaign.target.clone(),
            crash_artifacts: count_entries(&self.campaign.backend.crash_dir(&output_dir)),
            queue_entries: count_entries(&self.campaign.backend.queue_dir(&output_dir)),
            output_dir,
            final_metrics: self.last_snapshot,
            runtime_seconds: started.elapsed().as_secs_f64(),
            termination: self
                .stop_reason
                .as_ref()
                .map(|reason| reason.to_string())
                .unwrap_or_default(),
            training_passes: self.agent.as_ref().map_or(0, |agent| agent.ctx.updates),
            summary,
        };
        write_json(&self.campaign.directory.join(RESULTS_FILE), &results)?;
        self.transition(LoopState::Stopped);

        if let Some(err) = failure {
            return Err(err);
        }

        info!(
            "[{}] Finished after {:.0}s: coverage {:.2}%, crashes {}, paths {}",
            self.campaign.mode,
            results.runtime_seconds,
            summary.final_coverage,
            summary.total_crashes,
            summary.total_paths
        );
        Ok(CampaignReport {
            mode: self.campaign.mode,
            stop_reason: self.stop_reason.unwrap_or(StopReason::Cancelled),
            training_passes: results.training_passes,
            summary,
            results,
        })
    }
}
