// src/rl/stats.rs
//
// Run-level counters, rolling reward means, train-metrics JSONL and
// diagnostic dumps. One instance per run, shared as `Arc<Mutex<RunStats>>`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::rl::learner_client::{TrainMetrics, TrainResponse};
use crate::telemetry::{now_ms, write_json_file, JsonlSink};

pub type SharedStats = Arc<Mutex<RunStats>>;

pub const STEP_REWARD_WINDOW: usize = 1000;
pub const EPISODE_RETURN_WINDOW: usize = 100;
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(30);
pub const PROGRESS_EVERY_TRAIN_CALLS: u64 = 5;

/// Fixed-capacity ring of f64 with a running mean.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    buf: Vec<f64>,
    idx: usize,
    capacity: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            idx: 0,
            capacity,
        }
    }

    pub fn push(&mut self, v: f64) {
        if self.capacity == 0 {
            return;
        }
        if self.buf.len() < self.capacity {
            self.buf.push(v);
            return;
        }
        self.buf[self.idx] = v;
        self.idx = (self.idx + 1) % self.capacity;
    }

    pub fn mean(&self) -> f64 {
        if self.buf.is_empty() {
            return 0.0;
        }
        self.buf.iter().sum::<f64>() / self.buf.len() as f64
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LastTrain {
    pub update_step: u64,
    pub samples: u64,
    pub warnings: Vec<String>,
    pub metrics: TrainMetrics,
}

/// One line of `ppo_train_metrics.jsonl`.
#[derive(Debug, Clone, Serialize)]
pub struct TrainRecord {
    pub run_id: String,
    pub timestamp_ms: u64,
    pub battle_count: u64,
    pub train_calls: u64,
    pub update_step: u64,
    pub rollout_steps_sent: u64,
    pub rollout_len: usize,
    pub rollout_len_source: String,
    pub rollout_buffer_len: usize,
    pub episodes_finished: u64,
    pub mean_reward: f64,
    pub mean_ep_return: f64,
    pub invalid_choice_count: u64,
    pub ppo_act_http_error_count: u64,
    pub mask_zero_count: u64,
    pub samples: u64,
    pub warnings: Vec<String>,
    pub metrics: TrainMetrics,
}

#[derive(Debug)]
pub struct RunStats {
    pub run_id: String,

    pub battle_count: u64,
    pub train_calls: u64,
    pub rollout_steps_sent: u64,
    pub episodes_finished: u64,
    pub invalid_choice_count: u64,
    pub ppo_act_http_error_count: u64,
    pub mask_zero_count: u64,
    pub last_update_step: u64,

    pub applied_rollout_len: usize,
    pub applied_rollout_len_source: String,
    pub rollout_buffer_len: usize,

    recent_step_rewards: RingBuffer,
    recent_episode_returns: RingBuffer,
    pub last_train: Option<LastTrain>,

    last_log: Option<Instant>,
    last_log_train_calls: u64,

    metrics_sink: JsonlSink,
    dumps_dir: PathBuf,
}

impl RunStats {
    /// Stats writing under `run_dir` (`ppo_train_metrics.jsonl`, `dumps/`).
    pub fn new(run_id: impl Into<String>, run_dir: &Path) -> Self {
        Self {
            run_id: run_id.into(),
            battle_count: 0,
            train_calls: 0,
            rollout_steps_sent: 0,
            episodes_finished: 0,
            invalid_choice_count: 0,
            ppo_act_http_error_count: 0,
            mask_zero_count: 0,
            last_update_step: 0,
            applied_rollout_len: 0,
            applied_rollout_len_source: "unknown".to_string(),
            rollout_buffer_len: 0,
            recent_step_rewards: RingBuffer::new(STEP_REWARD_WINDOW),
            recent_episode_returns: RingBuffer::new(EPISODE_RETURN_WINDOW),
            last_train: None,
            last_log: None,
            last_log_train_calls: 0,
            metrics_sink: JsonlSink::new(run_dir.join("ppo_train_metrics.jsonl")),
            dumps_dir: run_dir.join("dumps"),
        }
    }

    pub fn shared(self) -> SharedStats {
        Arc::new(Mutex::new(self))
    }

    pub fn metrics_path(&self) -> &Path {
        self.metrics_sink.path()
    }

    pub fn dumps_dir(&self) -> &Path {
        &self.dumps_dir
    }

    pub fn set_applied_config(&mut self, rollout_len: usize, source: &str) {
        self.applied_rollout_len = rollout_len;
        self.applied_rollout_len_source = if source.trim().is_empty() {
            "unknown".to_string()
        } else {
            source.to_string()
        };
    }

    pub fn set_collector_state(&mut self, rollout_buffer_len: usize) {
        self.rollout_buffer_len = rollout_buffer_len;
    }

    pub fn on_battle_finished(&mut self) {
        self.battle_count += 1;
    }

    pub fn record_episode_return(&mut self, v: f64) {
        self.episodes_finished += 1;
        self.recent_episode_returns.push(v);
    }

    /// Step rewards of a batch actually sent to the learner.
    pub fn record_trained_batch(&mut self, step_rewards: &[f64]) {
        for r in step_rewards {
            self.recent_step_rewards.push(if r.is_finite() { *r } else { 0.0 });
        }
    }

    pub fn mean_reward(&self) -> f64 {
        self.recent_step_rewards.mean()
    }

    pub fn mean_episode_return(&self) -> f64 {
        self.recent_episode_returns.mean()
    }

    pub fn inc_invalid_choice(&mut self) {
        self.invalid_choice_count += 1;
    }

    pub fn inc_act_http_error(&mut self) {
        self.ppo_act_http_error_count += 1;
    }

    pub fn inc_mask_zero(&mut self) {
        self.mask_zero_count += 1;
    }

    pub fn record_train_response(&mut self, res: &TrainResponse) {
        self.train_calls += 1;
        self.last_update_step = self.last_update_step.max(res.update_step);
        let samples = res.sample_count();
        self.rollout_steps_sent += samples;

        let last = LastTrain {
            update_step: res.update_step,
            samples,
            warnings: res.warnings.clone(),
            metrics: res.resolved_metrics(),
        };
        let rec = TrainRecord {
            run_id: self.run_id.clone(),
            timestamp_ms: now_ms(),
            battle_count: self.battle_count,
            train_calls: self.train_calls,
            update_step: last.update_step,
            rollout_steps_sent: self.rollout_steps_sent,
            rollout_len: self.applied_rollout_len,
            rollout_len_source: self.applied_rollout_len_source.clone(),
            rollout_buffer_len: self.rollout_buffer_len,
            episodes_finished: self.episodes_finished,
            mean_reward: self.mean_reward(),
            mean_ep_return: self.mean_episode_return(),
            invalid_choice_count: self.invalid_choice_count,
            ppo_act_http_error_count: self.ppo_act_http_error_count,
            mask_zero_count: self.mask_zero_count,
            samples: last.samples,
            warnings: last.warnings.clone(),
            metrics: last.metrics,
        };
        self.last_train = Some(last);
        self.metrics_sink.log(&rec);
        self.maybe_log_progress();
    }

    /// Single-line summary with `key=value` pairs.
    pub fn progress_line(&self, tag: &str) -> String {
        let update_step = self
            .last_train
            .as_ref()
            .map(|t| t.update_step)
            .unwrap_or(self.last_update_step);
        let m = self.last_train.as_ref().map(|t| t.metrics);
        let fmt_metric = |f: fn(&TrainMetrics) -> f64| match &m {
            Some(m) => format!("{:.4}", f(m)),
            None => "na".to_string(),
        };
        let rollout_len = if self.applied_rollout_len > 0 {
            self.applied_rollout_len.to_string()
        } else {
            "na".to_string()
        };
        format!(
            "[ppo][{tag}] run_id={} battles_done={} train_calls={} update_step={} invalid_choice={} \
             ppo_act_http_error={} mask_zero={} rollout_steps_sent={} rollout_len={} rollout_len_source={} \
             rollout_buffer_len={} episodes_finished={} mean_reward={:.4} mean_ep_return={:.4} \
             entropy={} kl={} clipfrac={}",
            self.run_id,
            self.battle_count,
            self.train_calls,
            update_step,
            self.invalid_choice_count,
            self.ppo_act_http_error_count,
            self.mask_zero_count,
            self.rollout_steps_sent,
            rollout_len,
            self.applied_rollout_len_source,
            self.rollout_buffer_len,
            self.episodes_finished,
            self.mean_reward(),
            self.mean_episode_return(),
            fmt_metric(|m| m.entropy),
            fmt_metric(|m| m.approx_kl),
            fmt_metric(|m| m.clipfrac),
        )
    }

    /// Emit the progress line if 30s have passed or 5 more train calls landed.
    pub fn maybe_log_progress(&mut self) -> bool {
        let now = Instant::now();
        let due_by_time = self
            .last_log
            .map(|t| now.duration_since(t) >= PROGRESS_INTERVAL)
            .unwrap_or(true);
        let due_by_calls = self.train_calls - self.last_log_train_calls >= PROGRESS_EVERY_TRAIN_CALLS;
        if !due_by_time && !due_by_calls {
            return false;
        }
        self.last_log = Some(now);
        self.last_log_train_calls = self.train_calls;
        info!("{}", self.progress_line("progress"));
        true
    }

    pub fn log_final(&self) {
        info!("{}", self.progress_line("final"));
    }

    /// Write `<run_dir>/dumps/<file_base>`; returns the path on success.
    pub fn write_dump(&self, file_base: &str, payload: &JsonValue) -> Option<PathBuf> {
        let path = self.dumps_dir.join(file_base);
        match write_json_file(&path, payload) {
            Ok(()) => Some(path),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to write dump");
                None
            }
        }
    }
}
