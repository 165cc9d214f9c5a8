// src/sim/driver.rs
//
// One battle against a `BattleEngine`: start/register, read spectator and
// side messages, answer each non-wait request with a normalized choice, and
// enforce the single-repair rule and the wall-clock deadline.
//
// Ready engine messages are drained before any request is answered, so the
// tracker has seen a turn's public log before that turn's decision is made.

use std::time::{Duration, Instant};

use futures_util::FutureExt;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::rl::coordinator::{CoordinatorError, RlBattleCoordinator};
use crate::rl::state_tracker::Side;
use crate::sim::choice::{
    add_target_to_rejected, choice_looks_disabled, normalize_choice, strip_target_from_rejected, RejectionKind,
};
use crate::sim::engine::{spectator_lines, split_protocol_line, BattleEngine, EngineMessage};
use crate::sim::policy::{local_choice, random_choice, ChoiceSource, PolicyMode, RemotePolicy};
use crate::sim::repair::{RepairVerdict, SideRepair};
use crate::sim::request::ReceivedRequest;
use crate::telemetry::{log_shared, now_ms, SharedSink};

pub const BATTLE_DEADLINE: Duration = Duration::from_secs(30);

/// Seed offsets used when a disabled choice is replaced by the fallback.
const DISABLED_FALLBACK_OFFSET_P1: u32 = 123;
const DISABLED_FALLBACK_OFFSET_P2: u32 = 456;

/// State snapshot reported when a battle misses its deadline.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TimeoutDetail {
    pub turns: u32,
    pub p1_req: u32,
    pub p2_req: u32,
    pub p1_choice: u32,
    pub p2_choice: u32,
    pub p1_last: Option<String>,
    pub p2_last: Option<String>,
    pub p1_choice_last: Option<String>,
    pub p2_choice_last: Option<String>,
    pub p1_err: Option<String>,
    pub p2_err: Option<String>,
}

impl std::fmt::Display for TimeoutDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(self) {
            Ok(s) => f.write_str(&s),
            Err(_) => write!(f, "turns={}", self.turns),
        }
    }
}

#[derive(Debug, Error)]
pub enum BattleError {
    #[error("Invalid choice detected for {side}: {error} (attempted '{attempted}', repairs={repairs})")]
    InvalidChoice {
        side: &'static str,
        error: String,
        attempted: String,
        repairs: u32,
    },
    #[error("PPO produced disabled choice for {side}: {choice}")]
    DisabledChoice { side: &'static str, choice: String },
    #[error("Battle timed out waiting for completion: {detail}")]
    Timeout { detail: Box<TimeoutDetail> },
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    #[error("engine error: {0}")]
    Engine(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl BattleError {
    pub fn kind(&self) -> &'static str {
        match self {
            BattleError::InvalidChoice { .. } => "invalid_choice",
            BattleError::DisabledChoice { .. } => "disabled_choice",
            BattleError::Timeout { .. } => "timeout",
            BattleError::Coordinator(_) => "coordinator",
            BattleError::Engine(_) => "engine",
            BattleError::Protocol(_) => "protocol",
        }
    }
}

fn engine_err(err: anyhow::Error) -> BattleError {
    BattleError::Engine(format!("{err:#}"))
}

/// One side's player configuration.
#[derive(Debug, Clone)]
pub struct PlayerSetup {
    pub name: String,
    pub team: String,
    pub mode: PolicyMode,
    pub remote: Option<RemotePolicy>,
    /// Fixed team-preview answer, bypassing the policy.
    pub team_preview_choice: Option<String>,
    /// Label recorded in outcome rows.
    pub policy_label: String,
}

impl PlayerSetup {
    pub fn new(name: &str, team: &str, mode: PolicyMode) -> Self {
        let policy_label = match mode {
            PolicyMode::Local => "local:battle_policy".to_string(),
            other => other.as_str().to_string(),
        };
        Self {
            name: name.to_string(),
            team: team.to_string(),
            mode,
            remote: None,
            team_preview_choice: None,
            policy_label,
        }
    }

    pub fn with_remote(mut self, remote: RemotePolicy) -> Self {
        self.policy_label = remote.label();
        self.remote = Some(remote);
        self
    }
}

#[derive(Debug, Clone)]
pub struct BattleSetup {
    pub run_id: String,
    pub battle_id: String,
    pub format_id: String,
    pub seed: u32,
    pub p1: PlayerSetup,
    pub p2: PlayerSetup,
    pub deadline: Duration,
}

impl BattleSetup {
    fn player(&self, side: Side) -> &PlayerSetup {
        match side {
            Side::P1 => &self.p1,
            Side::P2 => &self.p2,
        }
    }

    /// `seed,seed+1,seed+2,seed+3`.
    pub fn start_seed(&self) -> [u32; 4] {
        [
            self.seed,
            self.seed.wrapping_add(1),
            self.seed.wrapping_add(2),
            self.seed.wrapping_add(3),
        ]
    }
}

/// One answered request.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionTrace {
    pub side: Side,
    pub turn: u32,
    pub request: JsonValue,
    pub choice_raw: String,
    pub choice_norm: String,
    pub choice_source: ChoiceSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_debug: Option<JsonValue>,
}

#[derive(Debug, Clone)]
pub struct BattleResult {
    pub winner: Option<String>,
    pub winner_side: Option<Side>,
    pub turns: u32,
    pub log: Vec<String>,
    pub ms: u64,
    pub p1_choices: Vec<String>,
    pub p2_choices: Vec<String>,
    pub decisions: Vec<DecisionTrace>,
    pub repairs: u32,
}

struct SideDriver {
    side: Side,
    repair: SideRepair,
    current: Option<ReceivedRequest>,
    awaiting_answer: bool,
    pending_repair: Option<(RejectionKind, String, String)>,
    request_count: u32,
    choice_count: u32,
    last_summary: Option<String>,
    last_choice: Option<String>,
    last_error: Option<String>,
    choices: Vec<String>,
}

impl SideDriver {
    fn new(side: Side) -> Self {
        Self {
            side,
            repair: SideRepair::new(side.as_str()),
            current: None,
            awaiting_answer: false,
            pending_repair: None,
            request_count: 0,
            choice_count: 0,
            last_summary: None,
            last_choice: None,
            last_error: None,
            choices: Vec::new(),
        }
    }

    fn side_offset(&self) -> u32 {
        match self.side {
            Side::P1 => 1,
            Side::P2 => 2,
        }
    }
}

/// Mutable battle state, kept outside the deadline future so a timeout can
/// still report it.
struct DriverState {
    sides: [SideDriver; 2],
    turns: u32,
    winner: Option<String>,
    ended: bool,
    log: Vec<String>,
    decisions: Vec<DecisionTrace>,
}

impl DriverState {
    fn new() -> Self {
        Self {
            sides: [SideDriver::new(Side::P1), SideDriver::new(Side::P2)],
            turns: 0,
            winner: None,
            ended: false,
            log: Vec::new(),
            decisions: Vec::new(),
        }
    }

    fn timeout_detail(&self) -> TimeoutDetail {
        let [p1, p2] = &self.sides;
        TimeoutDetail {
            turns: self.turns,
            p1_req: p1.request_count,
            p2_req: p2.request_count,
            p1_choice: p1.choice_count,
            p2_choice: p2.choice_count,
            p1_last: p1.last_summary.clone(),
            p2_last: p2.last_summary.clone(),
            p1_choice_last: p1.last_choice.clone(),
            p2_choice_last: p2.last_choice.clone(),
            p1_err: p1.last_error.clone(),
            p2_err: p2.last_error.clone(),
        }
    }
}

fn side_idx(side: Side) -> usize {
    match side {
        Side::P1 => 0,
        Side::P2 => 1,
    }
}

/// Per-battle context borrowed by the event loop.
struct Ctx<'a, E: BattleEngine + ?Sized> {
    engine: &'a mut E,
    setup: &'a BattleSetup,
    coordinator: Option<&'a mut RlBattleCoordinator>,
    debug: Option<&'a SharedSink>,
}

impl<E: BattleEngine + ?Sized> Ctx<'_, E> {
    fn debug_emit(&self, evt: JsonValue) {
        let Some(sink) = self.debug else {
            return;
        };
        let mut row = json!({
            "t_ms": now_ms(),
            "run_id": self.setup.run_id,
            "battle_id": self.setup.battle_id,
        });
        if let (Some(dst), JsonValue::Object(src)) = (row.as_object_mut(), evt) {
            dst.extend(src);
        }
        log_shared(sink, &row);
    }

    fn dump_invalid(&self, st: &DriverState, side: Side) {
        let sd = &st.sides[side_idx(side)];
        if !self.setup.player(side).mode.is_rl() {
            return;
        }
        let (Some(coord), Some(req)) = (self.coordinator.as_deref(), sd.current.as_ref()) else {
            return;
        };
        coord.dump_invalid_choice(
            side,
            st.turns,
            req,
            json!({"last_error": sd.last_error, "last_choice": sd.last_choice}),
        );
    }

    fn on_spectator_line(&mut self, st: &mut DriverState, line: &str) {
        if !line.starts_with('|') {
            return;
        }
        st.log.push(line.to_string());
        if let Some(coord) = self.coordinator.as_deref_mut() {
            coord.ingest_spectator_line(line);
        }
        let parts: Vec<&str> = line.split('|').collect();
        match parts.get(1).copied() {
            Some("turn") => {
                if let Some(t) = parts.get(2).and_then(|t| t.trim().parse::<u32>().ok()) {
                    if t != st.turns {
                        for sd in st.sides.iter_mut() {
                            sd.repair.turn_advanced();
                        }
                    }
                    st.turns = t;
                }
            }
            Some("win") => {
                st.winner = parts.get(2).map(|w| w.to_string());
                st.ended = true;
            }
            Some("tie") => {
                st.winner = None;
                st.ended = true;
            }
            _ => {}
        }
    }

    fn on_side_line(&mut self, st: &mut DriverState, side: Side, line: &str) -> Result<(), BattleError> {
        let Some((cmd, rest)) = split_protocol_line(line) else {
            return Ok(());
        };
        match cmd {
            "request" => {
                let received = match ReceivedRequest::parse(rest) {
                    Ok(r) => r,
                    Err(err) => {
                        warn!(side = side.as_str(), error = %err, "unparseable request ignored");
                        return Ok(());
                    }
                };
                let summary = received.request.summary();
                let sd = &mut st.sides[side_idx(side)];
                sd.request_count += 1;
                sd.repair.request_received();
                sd.last_summary = Some(summary.clone());
                sd.awaiting_answer = !received.request.wait;
                sd.current = Some(received);
                debug!(side = side.as_str(), %summary, "request");
                self.debug_emit(json!({"type": "request", "player": side.as_str(), "summary": summary}));
            }
            "error" => {
                let sd = &mut st.sides[side_idx(side)];
                sd.last_error = Some(rest.to_string());
                match sd.repair.error_received(rest) {
                    RepairVerdict::Ignore => {}
                    RepairVerdict::Repair { kind, rejected } => {
                        sd.pending_repair = Some((kind, rejected, rest.to_string()));
                        sd.awaiting_answer = sd.current.is_some();
                        self.dump_invalid(st, side);
                    }
                    RepairVerdict::Fatal { attempted, repairs } => {
                        self.dump_invalid(st, side);
                        return Err(BattleError::InvalidChoice {
                            side: side.as_str(),
                            error: rest.to_string(),
                            attempted,
                            repairs,
                        });
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn on_message(&mut self, st: &mut DriverState, msg: EngineMessage) -> Result<(), BattleError> {
        match msg {
            EngineMessage::Update(lines) => {
                for line in spectator_lines(&lines) {
                    self.on_spectator_line(st, &line);
                }
            }
            EngineMessage::SideUpdate { side, lines } => {
                for line in &lines {
                    self.on_side_line(st, side, line)?;
                }
            }
            EngineMessage::End(_) => st.ended = true,
        }
        Ok(())
    }

    /// Raw choice, normalized choice, source and optional debug payload.
    async fn policy_choice(
        &mut self,
        side: Side,
        req: &ReceivedRequest,
        seed: u32,
        turn: u32,
    ) -> Result<(String, ChoiceSource, Option<JsonValue>), BattleError> {
        let setup = self.setup;
        let player = setup.player(side);
        if req.request.team_preview {
            if let Some(fixed) = &player.team_preview_choice {
                return Ok((fixed.trim().to_string(), ChoiceSource::Local, None));
            }
            // Team order is outside the RL action space.
            if player.mode.is_rl() {
                let d = local_choice(&req.request, seed, turn);
                return Ok((d.choice, ChoiceSource::Local, Some(d.debug)));
            }
        }
        match player.mode {
            PolicyMode::Fallback => Ok((random_choice(&req.request, seed), ChoiceSource::Fallback, None)),
            PolicyMode::Local => {
                let d = local_choice(&req.request, seed, turn);
                Ok((d.choice, ChoiceSource::Local, Some(d.debug)))
            }
            PolicyMode::Remote => match &player.remote {
                Some(remote) => {
                    let (raw, source) = remote
                        .choose(&req.raw, &req.request, &setup.format_id, turn, seed)
                        .await;
                    Ok((raw, source, None))
                }
                None => Ok((random_choice(&req.request, seed), ChoiceSource::Fallback, None)),
            },
            PolicyMode::Ppo | PolicyMode::League => {
                let coord = self
                    .coordinator
                    .as_deref_mut()
                    .ok_or_else(|| BattleError::Protocol(format!("{} uses an RL policy without a coordinator", side.as_str())))?;
                match coord.choose_for_request(side, req, turn, Some(seed)).await {
                    Ok(choice) => Ok((choice, ChoiceSource::Ppo, None)),
                    Err(err) => {
                        self.debug_emit(json!({
                            "type": "choice", "player": side.as_str(), "turn": turn,
                            "source": "ppo_error", "error": err.to_string(),
                        }));
                        Err(err.into())
                    }
                }
            }
        }
    }

    async fn answer(&mut self, st: &mut DriverState, side: Side) -> Result<(), BattleError> {
        let i = side_idx(side);
        if !st.sides[i].awaiting_answer {
            return Ok(());
        }
        let Some(req) = st.sides[i].current.clone() else {
            st.sides[i].awaiting_answer = false;
            return Ok(());
        };
        let turn = st.turns;
        let seed = self
            .setup
            .seed
            .wrapping_add(turn.wrapping_mul(17))
            .wrapping_add(st.sides[i].side_offset())
            .wrapping_add(st.sides[i].choice_count.wrapping_mul(997));

        let (raw, norm, source, policy_debug) = if let Some((kind, rejected, error)) = st.sides[i].pending_repair.take() {
            let fixed = match kind {
                RejectionKind::NeedsTarget => add_target_to_rejected(&rejected, &req.request, &error),
                RejectionKind::CantChooseTarget => strip_target_from_rejected(&rejected, &req.request, &error),
                RejectionKind::Other => None,
            };
            let (choice, source) = match fixed {
                Some(c) => (c, ChoiceSource::Repair),
                None => (
                    normalize_choice(&random_choice(&req.request, seed), &req.request),
                    ChoiceSource::Fallback,
                ),
            };
            info!(side = side.as_str(), turn, ?kind, rejected = %rejected, repaired = %choice, "choice repaired");
            (rejected, choice, source, None)
        } else {
            let (raw, mut source, policy_debug) = self.policy_choice(side, &req, seed, turn).await?;
            let mut norm = normalize_choice(&raw, &req.request);
            if norm != raw {
                debug!(side = side.as_str(), raw = %raw, normalized = %norm, "choice normalized");
            }
            if choice_looks_disabled(&raw, &req.request) || choice_looks_disabled(&norm, &req.request) {
                if self.setup.player(side).mode.is_rl() {
                    if let Some(coord) = self.coordinator.as_deref() {
                        coord.dump_disabled_choice(side, turn, &req, &norm, source.as_str());
                    }
                    return Err(BattleError::DisabledChoice {
                        side: side.as_str(),
                        choice: norm,
                    });
                }
                let offset = match side {
                    Side::P1 => DISABLED_FALLBACK_OFFSET_P1,
                    Side::P2 => DISABLED_FALLBACK_OFFSET_P2,
                };
                warn!(side = side.as_str(), choice = %norm, "policy chose a disabled move; using fallback");
                norm = normalize_choice(&random_choice(&req.request, seed.wrapping_add(offset)), &req.request);
                source = ChoiceSource::Fallback;
            }
            (raw, norm, source, policy_debug)
        };

        self.debug_emit(json!({
            "type": "choice", "player": side.as_str(), "turn": turn, "source": source.as_str(),
            "choice_raw": raw, "choice": norm, "changed": norm != raw,
        }));
        st.decisions.push(DecisionTrace {
            side,
            turn,
            request: req.raw.clone(),
            choice_raw: raw,
            choice_norm: norm.clone(),
            choice_source: source,
            policy_debug,
        });

        let sd = &mut st.sides[i];
        sd.awaiting_answer = false;
        sd.choice_count += 1;
        sd.last_choice = Some(norm.clone());
        sd.choices.push(norm.clone());
        sd.repair.choice_sent(&norm);
        self.engine
            .send(format!(">{} {}", side.as_str(), norm))
            .await
            .map_err(engine_err)
    }

    async fn drive(&mut self, st: &mut DriverState) -> Result<(), BattleError> {
        let setup = self.setup;
        let [s0, s1, s2, s3] = setup.start_seed();
        let start = json!({"formatid": setup.format_id, "seed": format!("{s0},{s1},{s2},{s3}")});
        self.engine.send(format!(">start {start}")).await.map_err(engine_err)?;
        for (side, player) in [(Side::P1, &setup.p1), (Side::P2, &setup.p2)] {
            let payload = json!({"name": player.name, "team": player.team});
            self.engine
                .send(format!(">player {} {payload}", side.as_str()))
                .await
                .map_err(engine_err)?;
        }
        self.debug_emit(json!({"type": "battle_start", "format": setup.format_id, "seed": setup.seed}));

        while !st.ended {
            let Some(msg) = self.engine.next_message().await.map_err(engine_err)? else {
                return Err(BattleError::Protocol("engine closed before the battle ended".into()));
            };
            self.on_message(st, msg)?;
            // Drain what is already available before answering.
            while !st.ended {
                let ready = self.engine.next_message().now_or_never();
                match ready {
                    Some(Ok(Some(msg))) => self.on_message(st, msg)?,
                    Some(Ok(None)) => {
                        if !st.ended {
                            return Err(BattleError::Protocol("engine closed before the battle ended".into()));
                        }
                    }
                    Some(Err(err)) => return Err(engine_err(err)),
                    None => break,
                }
            }
            if st.ended {
                break;
            }
            self.answer(st, Side::P1).await?;
            self.answer(st, Side::P2).await?;
        }
        Ok(())
    }
}

/// Run one battle to completion.
///
/// With a coordinator attached, every spectator line is forwarded to its
/// tracker, RL sides choose through it, and terminal rewards are assigned
/// once the battle ends.
pub async fn run_battle<E: BattleEngine + ?Sized>(
    engine: &mut E,
    setup: &BattleSetup,
    coordinator: Option<&mut RlBattleCoordinator>,
    debug: Option<&SharedSink>,
) -> Result<BattleResult, BattleError> {
    let started = Instant::now();
    let mut st = DriverState::new();
    let mut ctx = Ctx {
        engine,
        setup,
        coordinator,
        debug,
    };

    let outcome = tokio::time::timeout(setup.deadline, ctx.drive(&mut st)).await;
    match outcome {
        Err(_) => {
            let detail = st.timeout_detail();
            warn!(battle_id = %setup.battle_id, %detail, "battle deadline exceeded");
            return Err(BattleError::Timeout {
                detail: Box::new(detail),
            });
        }
        Ok(Err(err)) => return Err(err),
        Ok(Ok(())) => {}
    }

    let winner_side = match st.winner.as_deref() {
        Some(w) if w == setup.p1.name => Some(Side::P1),
        Some(w) if w == setup.p2.name => Some(Side::P2),
        _ => None,
    };
    if let Some(coord) = ctx.coordinator.as_deref_mut() {
        if let Err(err) = coord.finalize_battle(winner_side).await {
            warn!(battle_id = %setup.battle_id, error = %err, "terminal reward assignment failed");
        }
    }

    let ms = started.elapsed().as_millis() as u64;
    ctx.debug_emit(json!({"type": "battle_end", "winner": st.winner, "turns": st.turns, "sim_ms": ms}));

    let repairs = st.sides.iter().map(|s| s.repair.total_repairs()).sum();
    let [p1, p2] = st.sides;
    Ok(BattleResult {
        winner: st.winner,
        winner_side,
        turns: st.turns,
        log: st.log,
        ms,
        p1_choices: p1.choices,
        p2_choices: p2.choices,
        decisions: st.decisions,
        repairs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::mock_engine::{ScriptConfig, ScriptedEngine};

    fn setup(p1: PolicyMode, p2: PolicyMode, deadline: Duration) -> BattleSetup {
        BattleSetup {
            run_id: "run".into(),
            battle_id: "run-0".into(),
            format_id: "gen9vgc2026regf".into(),
            seed: 42,
            p1: PlayerSetup::new("A", "", p1),
            p2: PlayerSetup::new("B", "", p2),
            deadline,
        }
    }

    #[tokio::test]
    async fn test_scripted_battle_finishes_with_winner() {
        let mut engine = ScriptedEngine::new(ScriptConfig::default());
        let s = setup(PolicyMode::Local, PolicyMode::Fallback, BATTLE_DEADLINE);
        let result = run_battle(&mut engine, &s, None, None).await.unwrap();
        assert_eq!(result.winner.as_deref(), Some("A"));
        assert_eq!(result.winner_side, Some(Side::P1));
        assert!(result.turns >= 1);
        assert_eq!(engine.errors_sent(), 0, "no protocol errors expected");
        assert_eq!(result.repairs, 0);
        assert!(result.p1_choices[0].starts_with("team "));
        assert!(
            result.p1_choices.iter().skip(1).all(|c| c.split(", ").all(|p| p == "move 1 1")),
            "untargeted move gets the default foe target: {:?}",
            result.p1_choices
        );
    }

    #[tokio::test]
    async fn test_start_and_player_lines_first() {
        let mut engine = ScriptedEngine::new(ScriptConfig::default());
        let s = setup(PolicyMode::Fallback, PolicyMode::Fallback, BATTLE_DEADLINE);
        run_battle(&mut engine, &s, None, None).await.unwrap();
        let sent = engine.sent_commands();
        assert_eq!(sent[0], r#">start {"formatid":"gen9vgc2026regf","seed":"42,43,44,45"}"#);
        assert!(sent[1].starts_with(">player p1 "));
        assert!(sent[2].starts_with(">player p2 "));
    }

    #[tokio::test]
    async fn test_single_rejection_is_repaired() {
        let mut engine = ScriptedEngine::new(ScriptConfig {
            reject_p1_choices: 1,
            ..ScriptConfig::default()
        });
        let s = setup(PolicyMode::Local, PolicyMode::Fallback, BATTLE_DEADLINE);
        let result = run_battle(&mut engine, &s, None, None).await.unwrap();
        assert_eq!(result.repairs, 1);
        assert!(result.winner.is_some());
    }

    #[tokio::test]
    async fn test_repeated_rejection_is_fatal() {
        let mut engine = ScriptedEngine::new(ScriptConfig {
            reject_p1_choices: 2,
            ..ScriptConfig::default()
        });
        let s = setup(PolicyMode::Local, PolicyMode::Fallback, BATTLE_DEADLINE);
        let err = run_battle(&mut engine, &s, None, None).await.unwrap_err();
        match err {
            BattleError::InvalidChoice { side, repairs, .. } => {
                assert_eq!(side, "p1");
                assert_eq!(repairs, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stalled_engine_times_out_with_detail() {
        let mut engine = ScriptedEngine::new(ScriptConfig {
            stall_after_start: true,
            ..ScriptConfig::default()
        });
        let s = setup(PolicyMode::Fallback, PolicyMode::Fallback, Duration::from_millis(50));
        let err = run_battle(&mut engine, &s, None, None).await.unwrap_err();
        assert_eq!(err.kind(), "timeout");
        assert!(err.to_string().contains("\"p1_req\":0"), "{err}");
    }

    #[tokio::test]
    async fn test_rl_side_without_coordinator_is_protocol_error() {
        let mut engine = ScriptedEngine::new(ScriptConfig::default());
        let s = setup(PolicyMode::Ppo, PolicyMode::Fallback, BATTLE_DEADLINE);
        let err = run_battle(&mut engine, &s, None, None).await.unwrap_err();
        assert_eq!(err.kind(), "protocol");
    }
}
