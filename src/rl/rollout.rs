// src/rl/rollout.rs
//
// Rollout buffering for on-policy training.
//
// `RolloutCollector` is the synchronous core: steps, per-battle pending
// rewards, the bootstrap observation and the replay latch. `spawn_rollout_actor`
// wraps one collector in a task that owns it exclusively; battles talk to it
// through a cloneable `RolloutHandle`, so slicing a batch and posting it to the
// learner is atomic with respect to pushes from other battles.
//
// Step indices are global sequence numbers; the buffer holds
// `base_seq..base_seq + steps.len()`.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::rl::learner_client::{LearnerApi, LearnerError, RolloutBatch, TrainRequest, TrainResponse};
use crate::rl::observation::PackedObservation;
use crate::rl::stats::SharedStats;
use crate::telemetry::now_ms;

/// One learner decision awaiting (or holding) its reward.
#[derive(Debug, Clone, Serialize)]
pub struct RolloutStep {
    pub obs: PackedObservation,
    pub mask_left: Vec<u8>,
    pub mask_right: Vec<u8>,
    pub a_left: usize,
    pub a_right: usize,
    pub old_logp: f64,
    pub old_value: f64,
    pub reward: f64,
    pub done: u8,
}

/// A decision as pushed by the coordinator; reward and done come later.
#[derive(Debug, Clone)]
pub struct Decision {
    pub obs: PackedObservation,
    pub mask_left: Vec<u8>,
    pub mask_right: Vec<u8>,
    pub a_left: usize,
    pub a_right: usize,
    pub old_logp: f64,
    pub old_value: f64,
}

#[derive(Debug)]
pub struct RolloutCollector {
    steps: Vec<RolloutStep>,
    base_seq: u64,
    pending: HashMap<String, u64>,
    last_seq: HashMap<String, u64>,
    last_obs: Option<PackedObservation>,
    last_done: u8,

    rollout_len: usize,
    save_replay_every_updates: u64,
    save_next_replay_count: u64,
    update_step_count: u64,
}

impl RolloutCollector {
    pub fn new(rollout_len: usize, save_replay_every_updates: u64) -> Self {
        Self {
            steps: Vec::new(),
            base_seq: 0,
            pending: HashMap::new(),
            last_seq: HashMap::new(),
            last_obs: None,
            last_done: 0,
            rollout_len: rollout_len.max(1),
            save_replay_every_updates: save_replay_every_updates.max(1),
            save_next_replay_count: 0,
            update_step_count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn rollout_len(&self) -> usize {
        self.rollout_len
    }

    pub fn update_step(&self) -> u64 {
        self.update_step_count
    }

    pub fn has_pending(&self, battle: &str) -> bool {
        self.pending.contains_key(battle)
    }

    fn step_mut(&mut self, seq: u64) -> Option<&mut RolloutStep> {
        let idx = seq.checked_sub(self.base_seq)? as usize;
        self.steps.get_mut(idx)
    }

    pub fn push_decision(&mut self, battle: &str, d: Decision) {
        debug_assert!(
            !self.pending.contains_key(battle),
            "push_decision while battle {battle} still has a pending step"
        );
        let seq = self.base_seq + self.steps.len() as u64;
        self.last_obs = Some(d.obs.clone());
        self.last_done = 0;
        self.steps.push(RolloutStep {
            obs: d.obs,
            mask_left: d.mask_left,
            mask_right: d.mask_right,
            a_left: d.a_left,
            a_right: d.a_right,
            old_logp: d.old_logp,
            old_value: d.old_value,
            reward: 0.0,
            done: 0,
        });
        self.pending.insert(battle.to_string(), seq);
        self.last_seq.insert(battle.to_string(), seq);
    }

    /// Add `reward` to the battle's pending step and clear pending.
    pub fn apply_reward_to_previous(&mut self, battle: &str, reward: f64) {
        let Some(seq) = self.pending.remove(battle) else {
            return;
        };
        if let Some(step) = self.step_mut(seq) {
            step.reward += reward;
        }
    }

    /// Terminal reward onto the pending step, else the battle's last step
    /// still in the buffer; marks it done.
    pub fn finalize_terminal(&mut self, battle: &str, reward: f64) {
        let target = self.pending.remove(battle).or_else(|| self.last_seq.get(battle).copied());
        self.last_seq.remove(battle);
        if let Some(step) = target.and_then(|seq| self.step_mut(seq)) {
            step.reward += reward;
            step.done = 1;
        }
        self.last_done = 1;
    }

    /// Close a battle that ended without a result. Its pending step (or last
    /// buffered step) is marked done with no extra reward and the battle
    /// stops holding back flushes.
    pub fn abandon_battle(&mut self, battle: &str) -> bool {
        let target = self.pending.remove(battle).or_else(|| self.last_seq.get(battle).copied());
        self.last_seq.remove(battle);
        match target.and_then(|seq| self.step_mut(seq)) {
            Some(step) => {
                step.done = 1;
                true
            }
            None => false,
        }
    }

    pub fn set_bootstrap_obs(&mut self, obs: PackedObservation, done: bool) {
        self.last_obs = Some(obs);
        self.last_done = u8::from(done);
    }

    /// Remove and return the oldest `rollout_len` steps when a flush is allowed.
    pub fn take_batch(&mut self, caller: &str) -> Option<RolloutBatch> {
        if self.pending.contains_key(caller) {
            return None;
        }
        if self.steps.len() < self.rollout_len {
            return None;
        }
        let last_obs = self.last_obs.clone()?;
        let slice_end = self.base_seq + self.rollout_len as u64;
        if self.pending.values().any(|seq| *seq < slice_end) {
            return None;
        }

        let batch: Vec<RolloutStep> = self.steps.drain(..self.rollout_len).collect();
        self.base_seq = slice_end;
        self.last_seq.retain(|_, seq| *seq >= slice_end);

        let mut out = RolloutBatch {
            last_obs: Some(last_obs),
            last_done: self.last_done,
            ..Default::default()
        };
        for s in batch {
            out.obs.push(s.obs);
            out.mask_left.push(s.mask_left);
            out.mask_right.push(s.mask_right);
            out.a_left.push(s.a_left);
            out.a_right.push(s.a_right);
            out.old_logp.push(s.old_logp);
            out.old_value.push(s.old_value);
            out.reward.push(s.reward);
            out.done.push(s.done);
        }
        Some(out)
    }

    /// Record a successful train; bumps the replay latch by the number of
    /// update-step buckets crossed.
    pub fn complete_train(&mut self, update_step: u64) -> u64 {
        let k = self.save_replay_every_updates;
        let prev_bucket = self.update_step_count / k;
        let next_bucket = update_step / k;
        let crossed = next_bucket.saturating_sub(prev_bucket);
        self.update_step_count = update_step;
        self.save_next_replay_count += crossed;
        crossed
    }

    pub fn peek_save_next_replay(&self) -> bool {
        self.save_next_replay_count > 0
    }

    pub fn consume_save_next_replay(&mut self) -> bool {
        if self.save_next_replay_count == 0 {
            return false;
        }
        self.save_next_replay_count -= 1;
        true
    }

    pub fn restore_save_next_replay(&mut self) {
        self.save_next_replay_count += 1;
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("rollout actor is closed")]
    Closed,
    #[error("train failed: {0}")]
    Train(#[from] LearnerError),
}

#[derive(Debug, Clone, Default)]
pub struct TrainOutcome {
    pub trained: bool,
    pub response: Option<TrainResponse>,
    pub buffer_len: usize,
}

#[derive(Debug)]
pub enum RolloutCommand {
    Push {
        battle: String,
        decision: Box<Decision>,
        response: oneshot::Sender<usize>,
    },
    ApplyReward {
        battle: String,
        reward: f64,
        response: oneshot::Sender<()>,
    },
    FinalizeTerminal {
        battle: String,
        reward: f64,
        response: oneshot::Sender<()>,
    },
    Abandon {
        battle: String,
        response: oneshot::Sender<bool>,
    },
    SetBootstrap {
        obs: Box<PackedObservation>,
        done: bool,
        response: oneshot::Sender<()>,
    },
    MaybeTrain {
        battle: String,
        response: oneshot::Sender<Result<TrainOutcome, LearnerError>>,
    },
    Len {
        response: oneshot::Sender<usize>,
    },
    UpdateStep {
        response: oneshot::Sender<u64>,
    },
    PeekReplay {
        response: oneshot::Sender<bool>,
    },
    ConsumeReplay {
        response: oneshot::Sender<bool>,
    },
    RestoreReplay {
        response: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone)]
pub struct RolloutHandle {
    command_tx: mpsc::Sender<RolloutCommand>,
}

impl RolloutHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> RolloutCommand) -> Result<T, RolloutError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(make(tx))
            .await
            .map_err(|_| RolloutError::Closed)?;
        rx.await.map_err(|_| RolloutError::Closed)
    }

    /// Returns the buffer length after the push.
    pub async fn push_decision(&self, battle: &str, decision: Decision) -> Result<usize, RolloutError> {
        let battle = battle.to_string();
        self.request(|response| RolloutCommand::Push {
            battle,
            decision: Box::new(decision),
            response,
        })
        .await
    }

    pub async fn apply_reward_to_previous(&self, battle: &str, reward: f64) -> Result<(), RolloutError> {
        let battle = battle.to_string();
        self.request(|response| RolloutCommand::ApplyReward {
            battle,
            reward,
            response,
        })
        .await
    }

    pub async fn finalize_terminal(&self, battle: &str, reward: f64) -> Result<(), RolloutError> {
        let battle = battle.to_string();
        self.request(|response| RolloutCommand::FinalizeTerminal {
            battle,
            reward,
            response,
        })
        .await
    }

    /// Returns whether a buffered step was closed.
    pub async fn abandon_battle(&self, battle: &str) -> Result<bool, RolloutError> {
        let battle = battle.to_string();
        self.request(|response| RolloutCommand::Abandon { battle, response })
            .await
    }

    pub async fn set_bootstrap_obs(&self, obs: PackedObservation, done: bool) -> Result<(), RolloutError> {
        self.request(|response| RolloutCommand::SetBootstrap {
            obs: Box::new(obs),
            done,
            response,
        })
        .await
    }

    pub async fn maybe_train(&self, battle: &str) -> Result<TrainOutcome, RolloutError> {
        let battle = battle.to_string();
        let res = self
            .request(|response| RolloutCommand::MaybeTrain { battle, response })
            .await?;
        Ok(res?)
    }

    pub async fn len(&self) -> Result<usize, RolloutError> {
        self.request(|response| RolloutCommand::Len { response }).await
    }

    pub async fn update_step(&self) -> Result<u64, RolloutError> {
        self.request(|response| RolloutCommand::UpdateStep { response }).await
    }

    pub async fn peek_save_next_replay(&self) -> Result<bool, RolloutError> {
        self.request(|response| RolloutCommand::PeekReplay { response }).await
    }

    pub async fn consume_save_next_replay(&self) -> Result<bool, RolloutError> {
        self.request(|response| RolloutCommand::ConsumeReplay { response }).await
    }

    pub async fn restore_save_next_replay(&self) -> Result<(), RolloutError> {
        self.request(|response| RolloutCommand::RestoreReplay { response }).await
    }
}

/// Spawn the collector task. It exits once every handle is dropped.
pub fn spawn_rollout_actor(
    collector: RolloutCollector,
    learner: Arc<dyn LearnerApi>,
    stats: Option<SharedStats>,
) -> RolloutHandle {
    let (command_tx, command_rx) = mpsc::channel::<RolloutCommand>(256);
    tokio::spawn(run_collector(collector, learner, stats, command_rx));
    RolloutHandle { command_tx }
}

async fn run_collector(
    mut collector: RolloutCollector,
    learner: Arc<dyn LearnerApi>,
    stats: Option<SharedStats>,
    mut command_rx: mpsc::Receiver<RolloutCommand>,
) {
    while let Some(cmd) = command_rx.recv().await {
        handle_command(cmd, &mut collector, learner.as_ref(), stats.as_ref()).await;
    }
    debug!(buffered = collector.len(), "rollout actor stopped");
}

async fn handle_command(
    cmd: RolloutCommand,
    collector: &mut RolloutCollector,
    learner: &dyn LearnerApi,
    stats: Option<&SharedStats>,
) {
    match cmd {
        RolloutCommand::Push {
            battle,
            decision,
            response,
        } => {
            collector.push_decision(&battle, *decision);
            let _ = response.send(collector.len());
        }
        RolloutCommand::ApplyReward {
            battle,
            reward,
            response,
        } => {
            collector.apply_reward_to_previous(&battle, reward);
            let _ = response.send(());
        }
        RolloutCommand::FinalizeTerminal {
            battle,
            reward,
            response,
        } => {
            collector.finalize_terminal(&battle, reward);
            let _ = response.send(());
        }
        RolloutCommand::Abandon { battle, response } => {
            let closed = collector.abandon_battle(&battle);
            debug!(battle = %battle, closed, buffered = collector.len(), "battle abandoned");
            let _ = response.send(closed);
        }
        RolloutCommand::SetBootstrap { obs, done, response } => {
            collector.set_bootstrap_obs(*obs, done);
            let _ = response.send(());
        }
        RolloutCommand::MaybeTrain { battle, response } => {
            let res = maybe_train(collector, learner, stats, &battle).await;
            let _ = response.send(res);
        }
        RolloutCommand::Len { response } => {
            let _ = response.send(collector.len());
        }
        RolloutCommand::UpdateStep { response } => {
            let _ = response.send(collector.update_step());
        }
        RolloutCommand::PeekReplay { response } => {
            let _ = response.send(collector.peek_save_next_replay());
        }
        RolloutCommand::ConsumeReplay { response } => {
            let _ = response.send(collector.consume_save_next_replay());
        }
        RolloutCommand::RestoreReplay { response } => {
            collector.restore_save_next_replay();
            let _ = response.send(());
        }
    }
}

async fn maybe_train(
    collector: &mut RolloutCollector,
    learner: &dyn LearnerApi,
    stats: Option<&SharedStats>,
    battle: &str,
) -> Result<TrainOutcome, LearnerError> {
    let Some(batch) = collector.take_batch(battle) else {
        return Ok(TrainOutcome {
            trained: false,
            response: None,
            buffer_len: collector.len(),
        });
    };

    if let Some(stats) = stats {
        if let Ok(mut s) = stats.lock() {
            s.record_trained_batch(&batch.reward);
        }
    }

    let batch_len = batch.len();
    let update_step_before = collector.update_step();
    let request = TrainRequest { rollout: batch };
    // Kept for the failure dump; the request itself is consumed by the call.
    let body = serde_json::to_value(&request).unwrap_or_default();

    match learner.train(request).await {
        Ok(resp) => {
            let crossed = collector.complete_train(resp.update_step);
            info!(
                update_step = resp.update_step,
                batch_len,
                replay_latch_added = crossed,
                buffer_len = collector.len(),
                "rollout batch trained"
            );
            Ok(TrainOutcome {
                trained: true,
                response: Some(resp),
                buffer_len: collector.len(),
            })
        }
        Err(err) => {
            error!(error = %err, batch_len, update_step_before, "train call failed");
            if let Some(stats) = stats {
                let payload = serde_json::json!({
                    "reason": "train_error",
                    "error": {
                        "message": err.to_string(),
                        "kind": err.kind_label(),
                    },
                    "update_step_before": update_step_before,
                    "rollout_len": collector.rollout_len(),
                    "batch_len": batch_len,
                    "body": body,
                });
                if let Ok(s) = stats.lock() {
                    s.write_dump(&format!("train_error_{}.json", now_ms()), &payload);
                }
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rl::observation::pack_observation;
    use crate::rl::state_tracker::BattleStateTracker;

    fn decision(a: usize) -> Decision {
        Decision {
            obs: pack_observation(&BattleStateTracker::new()),
            mask_left: vec![1, 0],
            mask_right: vec![1, 0],
            a_left: a,
            a_right: 0,
            old_logp: -0.5,
            old_value: 0.1,
        }
    }

    #[test]
    fn test_reward_lands_on_pending_step() {
        let mut c = RolloutCollector::new(8, 1);
        c.push_decision("b1", decision(1));
        assert!(c.has_pending("b1"));
        c.apply_reward_to_previous("b1", 0.25);
        assert!(!c.has_pending("b1"));
        c.apply_reward_to_previous("b1", 5.0);
        assert_eq!(c.steps[0].reward, 0.25, "no pending step means no-op");
    }

    #[test]
    fn test_finalize_uses_pending_or_last_step() {
        let mut c = RolloutCollector::new(8, 1);
        c.push_decision("b1", decision(1));
        c.finalize_terminal("b1", 1.0);
        assert_eq!((c.steps[0].reward, c.steps[0].done), (1.0, 1));

        c.push_decision("b2", decision(2));
        c.apply_reward_to_previous("b2", 0.5);
        c.finalize_terminal("b2", -1.0);
        assert_eq!(c.steps[1].reward, -0.5);
        assert_eq!(c.steps[1].done, 1);
        assert_eq!(c.last_done, 1);
    }

    #[test]
    fn test_take_batch_boundary() {
        let mut c = RolloutCollector::new(4, 1);
        for i in 0..3 {
            c.push_decision("b", decision(i));
            c.apply_reward_to_previous("b", 0.0);
        }
        assert!(c.take_batch("b").is_none(), "rollout_len - 1 steps never flush");

        c.push_decision("b", decision(3));
        assert!(c.take_batch("b").is_none(), "caller's own pending step blocks the flush");
        c.apply_reward_to_previous("b", 1.0);

        let batch = c.take_batch("b").expect("flush at rollout_len");
        assert_eq!(batch.len(), 4);
        assert_eq!(batch.a_left, vec![0, 1, 2, 3]);
        assert_eq!(batch.reward[3], 1.0);
        assert!(c.is_empty());
        assert!(batch.last_obs.is_some());
    }

    #[test]
    fn test_other_battle_pending_inside_slice_blocks_flush() {
        let mut c = RolloutCollector::new(2, 1);
        c.push_decision("a", decision(0));
        c.push_decision("b", decision(1));
        c.apply_reward_to_previous("b", 0.0);
        assert!(c.take_batch("b").is_none(), "a's pending step is inside the slice");
        c.apply_reward_to_previous("a", 0.0);
        assert!(c.take_batch("b").is_some());
    }

    #[test]
    fn test_abandoned_battle_releases_flush() {
        let mut c = RolloutCollector::new(4, 1);
        c.push_decision("dead", decision(9));
        for i in 0..10 {
            c.push_decision("live", decision(i));
            c.apply_reward_to_previous("live", 0.0);
            assert!(c.take_batch("live").is_none(), "open step of a dead battle holds the head");
        }

        assert!(c.abandon_battle("dead"));
        assert!(!c.has_pending("dead"));
        let batch = c.take_batch("live").expect("flush once the dead battle is closed");
        assert_eq!(batch.done[0], 1);
        assert_eq!(batch.reward[0], 0.0);
        assert_eq!(c.len(), 7);
        assert!(!c.abandon_battle("dead"), "second abandon finds nothing");
    }

    #[test]
    fn test_sequence_numbers_survive_flush() {
        let mut c = RolloutCollector::new(2, 1);
        c.push_decision("a", decision(0));
        c.apply_reward_to_previous("a", 0.0);
        c.push_decision("b", decision(1));
        c.apply_reward_to_previous("b", 0.0);
        c.push_decision("c", decision(2));
        assert!(c.take_batch("a").is_some());
        c.apply_reward_to_previous("c", 0.75);
        assert_eq!(c.steps.len(), 1);
        assert_eq!(c.steps[0].reward, 0.75, "pending index rebased after drain");
        c.finalize_terminal("a", 1.0);
        assert_eq!(c.steps[0].done, 0, "flushed battle's step is gone, nothing to mark");
    }

    #[test]
    fn test_replay_latch_counts_bucket_crossings() {
        let mut c = RolloutCollector::new(8, 2);
        assert_eq!(c.complete_train(1), 0);
        assert!(!c.peek_save_next_replay());
        assert_eq!(c.complete_train(2), 1);
        assert_eq!(c.complete_train(7), 2);
        assert!(c.consume_save_next_replay());
        assert!(c.consume_save_next_replay());
        assert!(c.consume_save_next_replay());
        assert!(!c.consume_save_next_replay());
        c.restore_save_next_replay();
        assert!(c.peek_save_next_replay());
    }

    #[test]
    #[should_panic(expected = "pending step")]
    fn test_double_push_panics_in_debug() {
        let mut c = RolloutCollector::new(8, 1);
        c.push_decision("b", decision(0));
        c.push_decision("b", decision(1));
    }
}
