// src/rl/coordinator.rs
//
// Per-battle RL facade: turns a decision request into a choice string by way
// of the tracker, observation packer, action builder and learning service,
// and feeds the learner's own decisions into the shared rollout collector.
//
// Only p1 is ever the training side. p1 requests update the tracker and
// produce rollout steps; p2 decisions (mirror/snapshot/baseline opponents)
// are answered from the same p1-perspective tracker and only feed the
// opponent action history.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, warn};

use crate::rl::action_builder::{build_actions_for_request, BuiltActions};
use crate::rl::learner_client::{ActRequest, LearnerApi, LearnerError};
use crate::rl::observation::{observation_shapes, pack_observation};
use crate::rl::rollout::{Decision, RolloutError, RolloutHandle};
use crate::rl::stats::{RunStats, SharedStats};
use crate::rl::state_tracker::{BattleStateTracker, Side};
use crate::sim::request::ReceivedRequest;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("no legal actions (mask sums left={left} right={right})")]
    MaskZero { left: usize, right: usize },
    #[error("learner act failed: {0}")]
    Learner(#[from] LearnerError),
    #[error(transparent)]
    Rollout(#[from] RolloutError),
}

/// Policy ids acting for each side in this battle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyPair {
    pub p1_policy_id: String,
    pub p2_policy_id: String,
}

impl PolicyPair {
    pub fn for_side(&self, side: Side) -> &str {
        match side {
            Side::P1 => &self.p1_policy_id,
            Side::P2 => &self.p2_policy_id,
        }
    }
}

/// Snapshot of one decision, reused as the base of later diagnostic dumps.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionDump {
    pub reason: String,
    pub battle_id: String,
    pub turn: u32,
    pub side: Side,
    pub phase: &'static str,
    pub raw_request_json: JsonValue,
    pub built_obs_shapes: JsonValue,
    pub mask_left: Vec<u8>,
    pub mask_right: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask_left_sum: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask_right_sum: Option<usize>,
    pub chosen_action_left: i64,
    pub chosen_action_right: i64,
    pub chosen_choice_string_left: String,
    pub chosen_choice_string_right: String,
    pub legal_choice_table_left: Vec<Option<String>>,
    pub legal_choice_table_right: Vec<Option<String>>,
    #[serde(rename = "lastK_history")]
    pub last_k_history: JsonValue,
    pub league_info: JsonValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body_snippet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

pub struct RlBattleCoordinator {
    pub tracker: BattleStateTracker,
    learner: Arc<dyn LearnerApi>,
    rollout: RolloutHandle,
    policies: PolicyPair,
    stats: Option<SharedStats>,
    battle_id: String,
    last_decision: [Option<DecisionDump>; 2],
    episode_return: f64,
}

fn side_index(side: Side) -> usize {
    match side {
        Side::P1 => 0,
        Side::P2 => 1,
    }
}

impl RlBattleCoordinator {
    pub fn new(
        learner: Arc<dyn LearnerApi>,
        rollout: RolloutHandle,
        policies: PolicyPair,
        stats: Option<SharedStats>,
        battle_id: &str,
    ) -> Self {
        let battle_id = battle_id.trim();
        Self {
            tracker: BattleStateTracker::new(),
            learner,
            rollout,
            policies,
            stats,
            battle_id: if battle_id.is_empty() {
                "unknown_battle".to_string()
            } else {
                battle_id.to_string()
            },
            last_decision: [None, None],
            episode_return: 0.0,
        }
    }

    pub fn battle_id(&self) -> &str {
        &self.battle_id
    }

    pub fn policies(&self) -> &PolicyPair {
        &self.policies
    }

    pub fn episode_return(&self) -> f64 {
        self.episode_return
    }

    pub fn last_decision(&self, side: Side) -> Option<&DecisionDump> {
        self.last_decision[side_index(side)].as_ref()
    }

    pub fn ingest_spectator_line(&mut self, line: &str) {
        self.tracker.ingest_spectator_line(line);
    }

    fn with_stats<R>(&self, f: impl FnOnce(&mut RunStats) -> R) -> Option<R> {
        let stats = self.stats.as_ref()?;
        let mut guard = stats.lock().ok()?;
        Some(f(&mut guard))
    }

    fn league_info(&self, acting_policy_id: Option<&str>) -> JsonValue {
        let mut v = json!({
            "p1_policy_id": self.policies.p1_policy_id,
            "p2_policy_id": self.policies.p2_policy_id,
        });
        if let Some(id) = acting_policy_id {
            v["acting_policy_id"] = json!(id);
        }
        v
    }

    fn dump_name(&self, turn: u32, suffix: &str) -> String {
        format!("{}_turn{}_{}.json", self.battle_id, turn, suffix)
    }

    /// Base dump for a side: its last decision, or a minimal record.
    fn base_dump(&self, side: Side, turn: u32, req: &ReceivedRequest, reason: &str) -> JsonValue {
        match self.last_decision(side) {
            Some(prev) => serde_json::to_value(prev).unwrap_or_else(|_| json!({})),
            None => json!({
                "reason": reason,
                "battle_id": self.battle_id,
                "turn": turn,
                "side": side,
                "phase": req.request.phase().as_str(),
                "raw_request_json": req.raw,
            }),
        }
    }

    /// Record an engine-rejected choice for this side.
    pub fn dump_invalid_choice(&self, side: Side, turn: u32, req: &ReceivedRequest, note: JsonValue) {
        let mut payload = self.base_dump(side, turn, req, "invalid_choice");
        payload["note"] = note;
        payload["current_request_json"] = req.raw.clone();
        let name = self.dump_name(turn, "invalid_choice");
        self.with_stats(|s| {
            s.inc_invalid_choice();
            s.write_dump(&name, &payload);
        });
    }

    /// Record a policy choice that selected a disabled move.
    pub fn dump_disabled_choice(
        &self,
        side: Side,
        turn: u32,
        req: &ReceivedRequest,
        attempted_choice: &str,
        source: &str,
    ) {
        let mut payload = self.base_dump(side, turn, req, "ppo_disabled_choice");
        payload["reason"] = json!("ppo_disabled_choice");
        payload["attempted_choice"] = json!(attempted_choice);
        payload["attempted_choice_source"] = json!(source);
        payload["current_request_json"] = req.raw.clone();
        let name = self.dump_name(turn, "ppo_disabled_choice");
        self.with_stats(|s| s.write_dump(&name, &payload));
    }

    fn decision_dump(
        &self,
        reason: &str,
        side: Side,
        turn: u32,
        req: &ReceivedRequest,
        built: &BuiltActions,
        acting_policy_id: Option<&str>,
    ) -> DecisionDump {
        DecisionDump {
            reason: reason.to_string(),
            battle_id: self.battle_id.clone(),
            turn,
            side,
            phase: req.request.phase().as_str(),
            raw_request_json: req.raw.clone(),
            built_obs_shapes: observation_shapes(),
            mask_left: built.mask_left.clone(),
            mask_right: built.mask_right.clone(),
            mask_left_sum: None,
            mask_right_sum: None,
            chosen_action_left: -1,
            chosen_action_right: -1,
            chosen_choice_string_left: String::new(),
            chosen_choice_string_right: String::new(),
            legal_choice_table_left: built.table_left.clone(),
            legal_choice_table_right: built.table_right.clone(),
            last_k_history: self.tracker.history_json(),
            league_info: self.league_info(acting_policy_id),
            http_status: None,
            response_body_snippet: None,
            error_message: None,
            request_id: None,
        }
    }

    /// Choose the full choice string for one side's request.
    pub async fn choose_for_request(
        &mut self,
        side: Side,
        req: &ReceivedRequest,
        turn: u32,
        seed: Option<u32>,
    ) -> Result<String, CoordinatorError> {
        if side == Side::P1 {
            self.tracker.update_from_request(Side::P1, &req.request);

            let shaped = self.tracker.consume_shaping_reward();
            self.rollout
                .apply_reward_to_previous(&self.battle_id, shaped.reward)
                .await?;
            self.episode_return += shaped.reward;

            let outcome = self.rollout.maybe_train(&self.battle_id).await?;
            self.with_stats(|s| {
                s.set_collector_state(outcome.buffer_len);
                if let Some(resp) = &outcome.response {
                    s.record_train_response(resp);
                }
            });
        }

        let obs = pack_observation(&self.tracker);
        self.rollout.set_bootstrap_obs(obs.clone(), false).await?;

        let built = build_actions_for_request(&req.request, &self.tracker);
        let (sum_left, sum_right) = built.mask_sums();
        if sum_left == 0 || sum_right == 0 {
            let dump = self.decision_dump("mask_zero", side, turn, req, &built, None);
            let name = self.dump_name(turn, "mask_zero");
            self.with_stats(|s| {
                s.inc_mask_zero();
                if let Ok(v) = serde_json::to_value(&dump) {
                    s.write_dump(&name, &v);
                }
            });
            return Err(CoordinatorError::MaskZero {
                left: sum_left,
                right: sum_right,
            });
        }

        let policy_id = self.policies.for_side(side).to_string();
        let request_id = format!("{}:{}:{}", self.battle_id, turn, side.as_str());
        let act_req = ActRequest {
            request_id: Some(request_id.clone()),
            battle_id: Some(self.battle_id.clone()),
            turn: Some(turn),
            side: Some(side.as_str().to_string()),
            policy_id: policy_id.clone(),
            obs: obs.clone(),
            mask_left: built.mask_left.clone(),
            mask_right: built.mask_right.clone(),
            sample: true,
            seed,
        };

        let res = match self.learner.act(act_req).await {
            Ok(res) => res,
            Err(err) => {
                if let LearnerError::Http { status, body, .. } = &err {
                    let mut dump =
                        self.decision_dump("ppo_act_http_error", side, turn, req, &built, Some(&policy_id));
                    dump.mask_left_sum = Some(sum_left);
                    dump.mask_right_sum = Some(sum_right);
                    dump.legal_choice_table_left = Vec::new();
                    dump.legal_choice_table_right = Vec::new();
                    dump.http_status = Some(*status);
                    dump.response_body_snippet = Some(body.clone());
                    dump.error_message = Some(err.to_string());
                    dump.request_id = Some(request_id.clone());
                    let name = self.dump_name(turn, "ppo_act_http_error");
                    self.with_stats(|s| {
                        s.inc_act_http_error();
                        if let Ok(v) = serde_json::to_value(&dump) {
                            s.write_dump(&name, &v);
                        }
                    });
                }
                warn!(battle_id = %self.battle_id, turn, side = side.as_str(), error = %err, "act failed");
                return Err(err.into());
            }
        };

        let a_left = res.a_left;
        let mut a_right = res.a_right;
        let left_choice = built.left_choice(a_left);
        let mut right_choice = if built.expected_choices >= 2 {
            built.right_choice(a_right)
        } else {
            String::new()
        };

        // Two forced switches into the same bench slot are rejected; move the
        // right slot to another legal switch when one exists.
        if built.expected_choices >= 2
            && req.request.phase() == crate::sim::request::Phase::ForcedSwitch
            && left_choice.starts_with("switch ")
            && left_choice == right_choice
        {
            let alt = built.table_right.iter().enumerate().find(|(idx, c)| {
                built.mask_right[*idx] == 1
                    && c.as_deref()
                        .map(|s| s.starts_with("switch ") && s != left_choice)
                        .unwrap_or(false)
            });
            if let Some((idx, c)) = alt {
                debug!(battle_id = %self.battle_id, from = a_right, to = idx, "repaired duplicate forced switch");
                a_right = idx;
                right_choice = c.clone().unwrap_or(right_choice);
            }
        }

        let choice = if built.expected_choices >= 2 {
            format!("{left_choice}, {right_choice}")
        } else {
            left_choice.clone()
        };

        let mut rec = self.decision_dump("decision", side, turn, req, &built, Some(&policy_id));
        rec.chosen_action_left = a_left as i64;
        rec.chosen_action_right = a_right as i64;
        rec.chosen_choice_string_left = left_choice;
        rec.chosen_choice_string_right = right_choice;
        self.last_decision[side_index(side)] = Some(rec);

        match side {
            Side::P1 => {
                self.tracker.record_my_actions(a_left, a_right);
                let buffer_len = self
                    .rollout
                    .push_decision(
                        &self.battle_id,
                        Decision {
                            obs,
                            mask_left: built.mask_left,
                            mask_right: built.mask_right,
                            a_left,
                            a_right,
                            old_logp: res.logp,
                            old_value: res.value,
                        },
                    )
                    .await?;
                self.with_stats(|s| s.set_collector_state(buffer_len));
            }
            Side::P2 => self.tracker.record_opp_actions(a_left, a_right),
        }

        Ok(choice)
    }

    /// Release this battle's rollout state after a fatal error. No terminal
    /// reward is assigned.
    pub async fn abandon_battle(&mut self) -> Result<(), CoordinatorError> {
        let closed = self.rollout.abandon_battle(&self.battle_id).await?;
        debug!(battle_id = %self.battle_id, closed, "rollout steps closed after failure");
        Ok(())
    }

    /// Terminal bookkeeping. `winner` is the winning side, `None` for a tie.
    pub async fn finalize_battle(&mut self, winner: Option<Side>) -> Result<(), CoordinatorError> {
        let shaped = self.tracker.consume_shaping_reward();
        let terminal = match winner {
            Some(Side::P1) => 1.0,
            Some(Side::P2) => -1.0,
            None => 0.0,
        };
        self.episode_return += shaped.reward + terminal;
        self.rollout
            .finalize_terminal(&self.battle_id, shaped.reward + terminal)
            .await?;
        self.rollout
            .set_bootstrap_obs(pack_observation(&self.tracker), true)
            .await?;
        let ret = self.episode_return;
        self.with_stats(|s| s.record_episode_return(ret));
        Ok(())
    }
}
