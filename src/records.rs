//! Rows written to the run directory.
//!
//! - `battles.jsonl`: one [`BattleOutcomeRecord`] per battle, error rows
//!   included (`winner = "error"`).
//! - `replays.jsonl`: [`ReplayRecord`], enough to replay a battle exactly.
//! - `trajectories.jsonl`: one [`TrajectoryRecord`] per decision.
//! - `errors.jsonl`: one [`ErrorRow`] per failed battle.

use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

use crate::rl::league::LeagueSample;
use crate::rl::state_tracker::Side;
use crate::sim::driver::BattleResult;
use crate::sim::policy::ChoiceSource;

pub const BATTLES_FILE: &str = "battles.jsonl";
pub const REPLAYS_FILE: &str = "replays.jsonl";
pub const TRAJECTORIES_FILE: &str = "trajectories.jsonl";
pub const ERRORS_FILE: &str = "errors.jsonl";
pub const DEBUG_FILE: &str = "debug.jsonl";

const TEAM_ID_LEN: usize = 12;

pub fn sha256_hex(s: &str) -> String {
    hex::encode(Sha256::digest(s.as_bytes()))
}

/// Short team id: the first 12 hex chars of the packed team's sha256.
pub fn team_id(packed: &str) -> String {
    let mut h = sha256_hex(packed);
    h.truncate(TEAM_ID_LEN);
    h
}

/// Fields shared by every per-battle row.
#[derive(Debug, Clone, Serialize)]
pub struct BattleMeta {
    pub run_id: String,
    pub battle_index: u64,
    pub battle_id: String,
    pub format: String,
    pub seed: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlayerRecord {
    pub policy: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_hash: Option<String>,
}

impl PlayerRecord {
    pub fn new(policy: &str, packed_team: &str) -> Self {
        let hash = sha256_hex(packed_team);
        Self {
            policy: policy.to_string(),
            team_id: Some(hash[..TEAM_ID_LEN].to_string()),
            team_hash: Some(hash),
        }
    }

    pub fn policy_only(policy: &str) -> Self {
        Self {
            policy: policy.to_string(),
            team_id: None,
            team_hash: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TeamsRecord {
    pub team1_packed: String,
    pub team2_packed: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
    pub phase: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BattleOutcomeRecord {
    #[serde(flatten)]
    pub meta: BattleMeta,
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
    pub duration_ms: u64,
    pub sim_ms: u64,
    /// Winner name, `tie`, or `error`.
    pub winner: String,
    pub turns: u32,
    pub repairs: u32,
    pub p1: PlayerRecord,
    pub p2: PlayerRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teams: Option<TeamsRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub league: Option<LeagueSample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayRecord {
    #[serde(flatten)]
    pub meta: BattleMeta,
    pub start_seed: [u32; 4],
    pub expected_winner: String,
    pub expected_turns: u32,
    pub p1: PlayerRecord,
    pub p2: PlayerRecord,
    pub p1_team: String,
    pub p2_team: String,
    pub p1_choices: Vec<String>,
    pub p2_choices: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutcomeSummary {
    pub winner: String,
    pub turns: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrajectoryRecord {
    #[serde(flatten)]
    pub meta: BattleMeta,
    pub player: Side,
    pub turn: u32,
    pub step: usize,
    pub obs: JsonValue,
    pub choice: String,
    pub choice_raw: String,
    pub choice_source: ChoiceSource,
    pub done: bool,
    pub reward: f64,
    pub outcome: OutcomeSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorRow {
    pub battle_index: u64,
    pub battle_id: String,
    pub error_type: String,
    pub error: String,
}

/// `winner` column value for a finished battle.
pub fn winner_label(result: &BattleResult) -> String {
    result.winner.clone().unwrap_or_else(|| "tie".to_string())
}

/// One row per decision. Only each side's last decision is `done`, carrying
/// +1/-1/0 from that side's perspective.
pub fn trajectory_rows(meta: &BattleMeta, result: &BattleResult) -> Vec<TrajectoryRecord> {
    let last_of = |side: Side| result.decisions.iter().rposition(|d| d.side == side);
    let last = [last_of(Side::P1), last_of(Side::P2)];
    let reward_for = |side: Side| match result.winner_side {
        Some(w) if w == side => 1.0,
        Some(_) => -1.0,
        None => 0.0,
    };
    let outcome = OutcomeSummary {
        winner: winner_label(result),
        turns: result.turns,
    };

    result
        .decisions
        .iter()
        .enumerate()
        .map(|(k, d)| {
            let slot = match d.side {
                Side::P1 => 0,
                Side::P2 => 1,
            };
            let done = last[slot] == Some(k);
            TrajectoryRecord {
                meta: meta.clone(),
                player: d.side,
                turn: d.turn,
                step: k,
                obs: d.request.clone(),
                choice: d.choice_norm.clone(),
                choice_raw: d.choice_raw.clone(),
                choice_source: d.choice_source,
                done,
                reward: if done { reward_for(d.side) } else { 0.0 },
                outcome: outcome.clone(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::driver::DecisionTrace;
    use serde_json::json;

    fn meta() -> BattleMeta {
        BattleMeta {
            run_id: "r".into(),
            battle_index: 3,
            battle_id: "r-3".into(),
            format: "gen9vgc2026regf".into(),
            seed: 4,
        }
    }

    fn trace(side: Side, turn: u32) -> DecisionTrace {
        DecisionTrace {
            side,
            turn,
            request: json!({"rqid": turn}),
            choice_raw: "move 1".into(),
            choice_norm: "move 1 1".into(),
            choice_source: ChoiceSource::Local,
            policy_debug: None,
        }
    }

    fn result(winner_side: Option<Side>) -> BattleResult {
        BattleResult {
            winner: winner_side.map(|s| s.as_str().to_string()),
            winner_side,
            turns: 2,
            log: vec![],
            ms: 5,
            p1_choices: vec![],
            p2_choices: vec![],
            decisions: vec![trace(Side::P1, 1), trace(Side::P2, 1), trace(Side::P1, 2), trace(Side::P2, 2)],
            repairs: 0,
        }
    }

    #[test]
    fn test_team_id_is_sha256_prefix() {
        // sha256("abc")
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(team_id("abc"), "ba7816bf8f01");
        let p = PlayerRecord::new("ppo", "abc");
        assert_eq!(p.team_id.as_deref(), Some("ba7816bf8f01"));
    }

    #[test]
    fn test_trajectory_terminal_rewards() {
        let rows = trajectory_rows(&meta(), &result(Some(Side::P2)));
        assert_eq!(rows.len(), 4);
        let done: Vec<(bool, f64)> = rows.iter().map(|r| (r.done, r.reward)).collect();
        assert_eq!(done, vec![(false, 0.0), (false, 0.0), (true, -1.0), (true, 1.0)]);

        let tie = trajectory_rows(&meta(), &result(None));
        assert!(tie.iter().all(|r| r.reward == 0.0));
        assert_eq!(tie[3].outcome.winner, "tie");
    }

    #[test]
    fn test_outcome_row_flattens_meta() {
        let row = BattleOutcomeRecord {
            meta: meta(),
            started_at_ms: 1,
            finished_at_ms: 2,
            duration_ms: 1,
            sim_ms: 0,
            winner: "error".into(),
            turns: 0,
            repairs: 0,
            p1: PlayerRecord::policy_only("ppo"),
            p2: PlayerRecord::policy_only("fallback"),
            teams: None,
            league: None,
            error: Some(ErrorInfo {
                kind: "timeout".into(),
                message: "x".into(),
                phase: "battle".into(),
            }),
        };
        let v = serde_json::to_value(&row).unwrap();
        assert_eq!(v["battle_id"], "r-3");
        assert_eq!(v["error"]["kind"], "timeout");
        assert!(v.get("teams").is_none());
        assert!(v["p1"].get("team_id").is_none());
    }
}
