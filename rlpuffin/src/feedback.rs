//! The environment model: turns consecutive fuzzer snapshots into a state, a reward and a
//! termination signal.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{Normalization, RewardScales, RewardWeights, RlConfig};
use crate::telemetry::MetricsSnapshot;

pub const STATE_DIM: usize = 5;

/// Normalized view of a snapshot. Every feature lies in `[0, max_feature]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StateVector {
    pub coverage_rate: f64,
    pub crash_count: f64,
    pub exec_speed: f64,
    pub queue_size: f64,
    pub unique_paths: f64,
}

impl StateVector {
    pub fn as_array(&self) -> [f64; STATE_DIM] {
        [
            self.coverage_rate,
            self.crash_count,
            self.exec_speed,
            self.queue_size,
            self.unique_paths,
        ]
    }

    pub fn from_array(values: [f64; STATE_DIM]) -> Self {
        let [coverage_rate, crash_count, exec_speed, queue_size, unique_paths] = values;
        Self {
            coverage_rate,
            crash_count,
            exec_speed,
            queue_size,
            unique_paths,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    DurationElapsed,
    FuzzerExited,
    /// Telemetry kept failing for this many consecutive polls
    TelemetryFailed(usize),
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::DurationElapsed => write!(f, "duration elapsed"),
            Termination::FuzzerExited => write!(f, "fuzzer exited"),
            Termination::TelemetryFailed(n) => {
                write!(f, "telemetry failed {} consecutive times", n)
            }
        }
    }
}

/// What the loop knows at a poll boundary besides the snapshot itself
#[derive(Clone, Copy, Debug)]
pub struct StepContext {
    pub wall_elapsed: Duration,
    pub fuzzer_running: bool,
    pub consecutive_read_failures: usize,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Feedback {
    pub state: StateVector,
    pub reward: f64,
    /// Coverage, crashes or paths grew since the previous snapshot. Diagnostic only.
    pub interesting: bool,
    pub termination: Option<Termination>,
}

impl Feedback {
    pub fn done(&self) -> bool {
        self.termination.is_some()
    }
}

#[derive(Clone, Debug)]
pub struct FeedbackTranslator {
    weights: RewardWeights,
    scales: RewardScales,
    normalization: Normalization,
    stagnation_penalty: f64,
    reward_clip: f64,
    duration: Duration,
    retry_budget: usize,
    previous: Option<MetricsSnapshot>,
}

impl FeedbackTranslator {
    pub fn new(config: &RlConfig, duration: Duration) -> Self {
        Self {
            weights: config.reward_weights,
            scales: config.reward_scales,
            normalization: config.normalization,
            stagnation_penalty: config.stagnation_penalty,
            reward_clip: config.reward_clip,
            duration,
            retry_budget: config.telemetry_retry_budget,
            previous: None,
        }
    }

    pub fn previous(&self) -> Option<&MetricsSnapshot> {
        self.previous.as_ref()
    }

    /// Forgets the previous snapshot, the next step starts a new episode.
    pub fn reset(&mut self) {
        self.previous = None;
    }

    pub fn state(&self, snapshot: &MetricsSnapshot) -> StateVector {
        let n = &self.normalization;
        let bound = |value: f64| {
            if value.is_finite() {
                value.clamp(0.0, n.max_feature)
            } else {
                n.max_feature
            }
        };
        let log_scaled = |value: u64, reference: f64| (value as f64).ln_1p() / reference.ln_1p();
        let crashes = snapshot.unique_crashes as f64;

        StateVector {
            coverage_rate: bound(snapshot.coverage_percent / 100.0),
            crash_count: bound(crashes / (crashes + n.crash_half_saturation)),
            exec_speed: bound(snapshot.exec_per_sec / n.speed_reference),
            queue_size: bound(log_scaled(snapshot.queue_size, n.queue_reference)),
            unique_paths: bound(log_scaled(snapshot.unique_paths, n.paths_reference)),
        }
    }

    /// Weighted sum of coverage, crash and path deltas plus the current throughput.
    pub fn reward(&self, previous: &MetricsSnapshot, current: &MetricsSnapshot) -> f64 {
        let w = &self.weights;
        let coverage_delta = current.coverage_percent - previous.coverage_percent;
        let crash_delta = current.unique_crashes as f64 - previous.unique_crashes as f64;
        let path_delta = current.unique_paths as f64 - previous.unique_paths as f64;
        let speed = current.exec_per_sec / self.scales.speed_reference;

        let mut reward = self.sanitize(w.coverage * coverage_delta)
            + self.sanitize(w.crash * crash_delta)
            + self.sanitize(w.speed * speed)
            + self.sanitize(w.diversity * path_delta / self.scales.path_delta_scale);

        if coverage_delta == 0.0 && path_delta == 0.0 {
            reward -= self.stagnation_penalty;
        }

        self.sanitize(reward)
    }

    fn sanitize(&self, value: f64) -> f64 {
        if value.is_nan() {
            0.0
        } else {
            value.clamp(-self.reward_clip, self.reward_clip)
        }
    }

    pub fn is_interesting(previous: &MetricsSnapshot, current: &MetricsSnapshot) -> bool {
        current.coverage_percent > previous.coverage_percent
            || current.unique_crashes > previous.unique_crashes
            || current.unique_paths > previous.unique_paths
    }

    pub fn termination(
        &self,
        snapshot: Option<&MetricsSnapshot>,
        ctx: &StepContext,
    ) -> Option<Termination> {
        let fuzzer_elapsed = snapshot.map_or(0.0, |s| s.elapsed_seconds);
        let elapsed = fuzzer_elapsed.max(ctx.wall_elapsed.as_secs_f64());

        if elapsed > self.duration.as_secs_f64() {
            Some(Termination::DurationElapsed)
        } else if !ctx.fuzzer_running {
            Some(Termination::FuzzerExited)
        } else if ctx.consecutive_read_failures > 0
            && ctx.consecutive_read_failures >= self.retry_budget
        {
            Some(Termination::TelemetryFailed(ctx.consecutive_read_failures))
        } else {
            None
        }
    }

    /// Translates `current` against the snapshot of the previous step. The first step of
    /// an episode has no predecessor and therefore zero deltas.
    pub fn step(&mut self, current: &MetricsSnapshot, ctx: &StepContext) -> Feedback {
        let previous = self.previous.unwrap_or(*current);

        let feedback = Feedback {
            state: self.state(current),
            reward: self.reward(&previous, current),
            interesting: Self::is_interesting(&previous, current),
            termination: self.termination(Some(current), ctx),
        };

        self.previous = Some(*current);
        feedback
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(
        coverage_percent: f64,
        unique_crashes: u64,
        exec_per_sec: f64,
        unique_paths: u64,
        queue_size: u64,
        elapsed_seconds: f64,
    ) -> MetricsSnapshot {
        MetricsSnapshot {
            coverage_percent,
            unique_crashes,
            exec_per_sec,
            unique_paths,
            queue_size,
            elapsed_seconds,
        }
    }

    fn running() -> StepContext {
        StepContext {
            wall_elapsed: Duration::from_secs(1),
            fuzzer_running: true,
            consecutive_read_failures: 0,
        }
    }

    fn translator() -> FeedbackTranslator {
        FeedbackTranslator::new(&RlConfig::default(), Duration::from_secs(3600))
    }

    #[test_log::test]
    fn test_reward_of_reference_scenario() {
        let mut translator = translator();
        translator.step(&snapshot(50.0, 3, 200.0, 500, 10, 10.0), &running());
        let feedback = translator.step(&snapshot(55.0, 4, 210.0, 520, 12, 20.0), &running());

        assert!((feedback.reward - 46.0).abs() < 1e-9);
        assert!(feedback.interesting);
        assert!(!feedback.done());
    }

    #[test_log::test]
    fn test_first_step_has_zero_deltas() {
        let mut translator = translator();
        let feedback = translator.step(&snapshot(50.0, 3, 200.0, 500, 10, 10.0), &running());

        // only the throughput term remains
        assert!((feedback.reward - 0.1 * 200.0).abs() < 1e-9);
        assert!(!feedback.interesting);
        assert_eq!(translator.previous().map(|s| s.unique_paths), Some(500));

        translator.reset();
        assert!(translator.previous().is_none());
    }

    #[test_log::test]
    fn test_reward_is_monotonic_in_each_component() {
        let translator = translator();
        let base = snapshot(10.0, 1, 100.0, 100, 5, 0.0);

        let mut last = f64::NEG_INFINITY;
        for step in 0..20u64 {
            let current = snapshot(10.0 + step as f64, 1, 100.0, 100, 5, 1.0);
            let reward = translator.reward(&base, &current);
            assert!(reward >= last);
            last = reward;
        }

        let mut last = f64::NEG_INFINITY;
        for step in 0..20u64 {
            let current = snapshot(10.0, 1 + step, 100.0, 100, 5, 1.0);
            let reward = translator.reward(&base, &current);
            assert!(reward >= last);
            last = reward;
        }

        let mut last = f64::NEG_INFINITY;
        for step in 0..20u64 {
            let current = snapshot(10.0, 1, 100.0 + 50.0 * step as f64, 100, 5, 1.0);
            let reward = translator.reward(&base, &current);
            assert!(reward >= last);
            last = reward;
        }

        let mut last = f64::NEG_INFINITY;
        for step in 0..20u64 {
            let current = snapshot(10.0, 1, 100.0, 100 + 7 * step, 5, 1.0);
            let reward = translator.reward(&base, &current);
            assert!(reward >= last);
            last = reward;
        }
    }

    #[test_log::test]
    fn test_non_finite_reward_is_clamped() {
        let translator = translator();
        let base = snapshot(0.0, 0, 0.0, 0, 0, 0.0);
        let current = snapshot(0.0, 0, f64::INFINITY, 0, 0, 0.0);

        let reward = translator.reward(&base, &current);
        assert!(reward.is_finite());
        assert_eq!(reward, RlConfig::default().reward_clip);
    }

    #[test_log::test]
    fn test_stagnation_penalty() {
        let config = RlConfig {
            stagnation_penalty: 0.1,
            ..RlConfig::default()
        };
        let translator = FeedbackTranslator::new(&config, Duration::from_secs(60));
        let base = snapshot(10.0, 0, 0.0, 10, 0, 0.0);

        assert!((translator.reward(&base, &base) + 0.1).abs() < 1e-12);
        let moved = snapshot(10.0, 0, 0.0, 11, 0, 0.0);
        assert!((translator.reward(&base, &moved) - 0.5).abs() < 1e-12);
    }

    #[test_log::test]
    fn test_state_is_bounded() {
        let translator = translator();
        let max_feature = RlConfig::default().normalization.max_feature;
        let huge = snapshot(100.0, u64::MAX, 1e12, u64::MAX, u64::MAX, 1.0);

        for feature in translator.state(&huge).as_array() {
            assert!((0.0..=max_feature).contains(&feature));
        }

        let state = translator.state(&snapshot(50.0, 10, 500.0, 0, 0, 0.0));
        assert_eq!(state.coverage_rate, 0.5);
        assert_eq!(state.crash_count, 0.5);
        assert_eq!(state.exec_speed, 0.5);
        assert_eq!(state.queue_size, 0.0);
    }

    #[test_log::test]
    fn test_termination_conditions() {
        let translator = FeedbackTranslator::new(&RlConfig::default(), Duration::from_secs(20));
        let current = snapshot(1.0, 0, 1.0, 1, 1, 25.0);

        assert_eq!(
            translator.termination(Some(&current), &running()),
            Some(Termination::DurationElapsed)
        );

        let early = snapshot(1.0, 0, 1.0, 1, 1, 5.0);
        let exited = StepContext {
            fuzzer_running: false,
            ..running()
        };
        assert_eq!(
            translator.termination(Some(&early), &exited),
            Some(Termination::FuzzerExited)
        );

        let failing = StepContext {
            consecutive_read_failures: 3,
            ..running()
        };
        assert_eq!(
            translator.termination(None, &failing),
            Some(Termination::TelemetryFailed(3))
        );

        let two_failures = StepContext {
            consecutive_read_failures: 2,
            ..running()
        };
        assert_eq!(translator.termination(Some(&early), &two_failures), None);
    }
}
