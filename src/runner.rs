// src/runner.rs
//
// Run loop: N battles, up to `concurrency` in flight, each in its own task.
//
// The loop owns the league manager and samples the p2 opponent once per
// battle before spawning. Tasks share the rollout actor handle, the learner
// client, run stats and the JSONL sinks. A failed battle becomes an error
// row and the run moves on.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use serde::Serialize;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::RunConfig;
use crate::records::{
    team_id, trajectory_rows, winner_label, BattleMeta, BattleOutcomeRecord, ErrorInfo, ErrorRow, PlayerRecord,
    ReplayRecord, TeamsRecord, BATTLES_FILE, DEBUG_FILE, ERRORS_FILE, REPLAYS_FILE, TRAJECTORIES_FILE,
};
use crate::rl::coordinator::{PolicyPair, RlBattleCoordinator};
use crate::rl::league::{LeagueManager, LeagueSample, LEARNER_POLICY_ID};
use crate::rl::learner_client::LearnerApi;
use crate::rl::rollout::{spawn_rollout_actor, RolloutCollector, RolloutHandle};
use crate::rl::state_tracker::Side;
use crate::rl::stats::{RunStats, SharedStats};
use crate::sim::driver::{run_battle, BattleResult, BattleSetup, PlayerSetup, BATTLE_DEADLINE};
use crate::sim::engine::{BattleEngine, ProcessEngine};
use crate::sim::policy::{PolicyMode, RemotePolicy};
use crate::telemetry::{log_shared, now_ms, JsonlSink, SharedSink};

/// Builds one engine per battle.
pub type EngineFactory = Arc<dyn Fn() -> anyhow::Result<Box<dyn BattleEngine>> + Send + Sync>;

/// Spawns `cmdline` as a simulator subprocess for every battle.
pub fn process_engine_factory(cmdline: impl Into<String>) -> EngineFactory {
    let cmdline = cmdline.into();
    Arc::new(move || -> anyhow::Result<Box<dyn BattleEngine>> {
        let engine = ProcessEngine::spawn(&cmdline)?;
        Ok(Box::new(engine) as Box<dyn BattleEngine>)
    })
}

/// Packed teams, one per non-empty line; `#` starts a comment line.
pub fn load_teams(path: &Path) -> anyhow::Result<Vec<String>> {
    let text = fs::read_to_string(path).with_context(|| format!("failed to read teams file {}", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub battles: u32,
    pub p1_wins: u32,
    pub p2_wins: u32,
    pub ties: u32,
    pub errors: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tally {
    P1,
    P2,
    Tie,
    Error,
}

impl RunSummary {
    fn record(&mut self, joined: Result<Tally, JoinError>) {
        let tally = joined.unwrap_or_else(|err| {
            error!(error = %err, "battle task panicked");
            Tally::Error
        });
        self.battles += 1;
        match tally {
            Tally::P1 => self.p1_wins += 1,
            Tally::P2 => self.p2_wins += 1,
            Tally::Tie => self.ties += 1,
            Tally::Error => self.errors += 1,
        }
    }
}

#[derive(Clone)]
struct Sinks {
    battles: SharedSink,
    errors: SharedSink,
    replays: SharedSink,
    trajectories: SharedSink,
    debug: Option<SharedSink>,
}

impl Sinks {
    fn open(cfg: &RunConfig) -> Self {
        let dir = &cfg.run_dir;
        Self {
            battles: JsonlSink::new(dir.join(BATTLES_FILE)).shared(),
            errors: JsonlSink::new(dir.join(ERRORS_FILE)).shared(),
            replays: JsonlSink::enabled_if(dir.join(REPLAYS_FILE), cfg.save_replays).shared(),
            trajectories: JsonlSink::enabled_if(dir.join(TRAJECTORIES_FILE), cfg.save_trajectories).shared(),
            debug: cfg
                .demo_debug
                .then(|| JsonlSink::new(dir.join(DEBUG_FILE)).shared()),
        }
    }

    fn flush(&self) {
        let all = [&self.battles, &self.errors, &self.replays, &self.trajectories];
        for sink in all.into_iter().chain(self.debug.as_ref()) {
            if let Ok(mut s) = sink.lock() {
                s.flush();
            }
        }
    }
}

/// Everything a battle task needs besides its own job.
#[derive(Clone)]
struct TaskContext {
    run_id: String,
    format_id: String,
    save_replays: bool,
    save_trajectories: bool,
    engines: EngineFactory,
    learner: Option<Arc<dyn LearnerApi>>,
    rollout: Option<RolloutHandle>,
    stats: SharedStats,
    sinks: Sinks,
}

struct BattleJob {
    index: u64,
    setup: BattleSetup,
    policies: PolicyPair,
    league: Option<LeagueSample>,
}

pub struct Runner {
    cfg: RunConfig,
    engines: EngineFactory,
    learner: Option<Arc<dyn LearnerApi>>,
    teams: Vec<String>,
    deadline: Duration,
}

impl Runner {
    pub fn new(cfg: RunConfig, engines: EngineFactory, learner: Option<Arc<dyn LearnerApi>>) -> Self {
        Self {
            cfg,
            engines,
            learner,
            teams: Vec::new(),
            deadline: BATTLE_DEADLINE,
        }
    }

    pub fn with_teams(mut self, teams: Vec<String>) -> Self {
        self.teams = teams;
        self
    }

    /// Per-battle wall-clock limit; defaults to [`BATTLE_DEADLINE`].
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    fn team_for(&self, index: u64, side: Side) -> String {
        if self.teams.is_empty() {
            return String::new();
        }
        let offset = match side {
            Side::P1 => 0,
            Side::P2 => 1,
        };
        let n = self.teams.len() as u64;
        self.teams[((index * 2 + offset) % n) as usize].clone()
    }

    fn player_setup(&self, side: Side, mode: PolicyMode, index: u64, policy_id: &str) -> PlayerSetup {
        let mut player = PlayerSetup::new(side.as_str(), &self.team_for(index, side), mode);
        if mode == PolicyMode::Remote {
            if let Some(url) = &self.cfg.remote_url {
                player = player.with_remote(RemotePolicy::new(url.clone(), mode.as_str()));
            }
        }
        if mode.is_rl() {
            player.policy_label = format!("{}:{policy_id}", mode.as_str());
        }
        player
    }

    fn policy_id_for(mode: PolicyMode, league: Option<&LeagueSample>) -> String {
        match (mode, league) {
            (PolicyMode::League, Some(sample)) => sample.policy_id(),
            (PolicyMode::Ppo, _) | (PolicyMode::League, None) => LEARNER_POLICY_ID.to_string(),
            (other, _) => other.as_str().to_string(),
        }
    }

    pub async fn run(self) -> anyhow::Result<RunSummary> {
        let cfg = &self.cfg;
        fs::create_dir_all(&cfg.run_dir)
            .with_context(|| format!("failed to create run dir {}", cfg.run_dir.display()))?;

        let mut stats = RunStats::new(cfg.run_id.clone(), &cfg.run_dir);
        stats.set_applied_config(cfg.rollout_len.value, cfg.rollout_len.source.as_str());
        let stats = stats.shared();

        if cfg.uses_learner() && self.learner.is_none() {
            bail!("policy {} vs {} needs a learning service client", cfg.p1_policy, cfg.p2_policy);
        }
        let rollout = match (&self.learner, cfg.uses_learner()) {
            (Some(learner), true) => {
                let collector = RolloutCollector::new(cfg.rollout_len.value, cfg.save_replay_every_n_updates);
                Some(spawn_rollout_actor(collector, learner.clone(), Some(stats.clone())))
            }
            _ => None,
        };
        let mut league = match (&self.learner, cfg.p2_policy) {
            (Some(learner), PolicyMode::League) => Some(LeagueManager::new(learner.clone())),
            _ => None,
        };

        info!(
            run_id = %cfg.run_id,
            run_dir = %cfg.run_dir.display(),
            battles = cfg.battles,
            concurrency = cfg.concurrency,
            p1 = %cfg.p1_policy,
            p2 = %cfg.p2_policy,
            rollout_len = cfg.rollout_len.value,
            rollout_len_source = cfg.rollout_len.source.as_str(),
            "run starting"
        );

        let ctx = TaskContext {
            run_id: cfg.run_id.clone(),
            format_id: cfg.format_id.clone(),
            save_replays: cfg.save_replays,
            save_trajectories: cfg.save_trajectories,
            engines: self.engines.clone(),
            learner: self.learner.clone(),
            rollout,
            stats: stats.clone(),
            sinks: Sinks::open(cfg),
        };

        let mut summary = RunSummary {
            run_id: cfg.run_id.clone(),
            run_dir: cfg.run_dir.clone(),
            ..RunSummary::default()
        };
        let total = u64::from(cfg.battles);
        let window = cfg.concurrency.max(1);
        let mut in_flight = JoinSet::new();
        for index in 0..total {
            while in_flight.len() >= window {
                if let Some(joined) = in_flight.join_next().await {
                    summary.record(joined);
                }
            }

            let seed = cfg.seed.wrapping_add(index as u32).wrapping_add(1);
            let sample = match league.as_mut() {
                Some(league) => {
                    league.refresh_snapshots().await;
                    Some(league.sample_opponent(seed))
                }
                None => None,
            };
            let policies = PolicyPair {
                p1_policy_id: Self::policy_id_for(cfg.p1_policy, None),
                p2_policy_id: Self::policy_id_for(cfg.p2_policy, sample.as_ref()),
            };
            let setup = BattleSetup {
                run_id: cfg.run_id.clone(),
                battle_id: format!("{}-{index}", cfg.run_id),
                format_id: cfg.format_id.clone(),
                seed,
                p1: self.player_setup(Side::P1, cfg.p1_policy, index, &policies.p1_policy_id),
                p2: self.player_setup(Side::P2, cfg.p2_policy, index, &policies.p2_policy_id),
                deadline: self.deadline,
            };
            let job = BattleJob {
                index,
                setup,
                policies,
                league: sample,
            };
            in_flight.spawn(run_job(job, ctx.clone()));
        }
        while let Some(joined) = in_flight.join_next().await {
            summary.record(joined);
        }

        ctx.sinks.flush();
        if let Ok(s) = stats.lock() {
            s.log_final();
        }
        info!(
            battles = summary.battles,
            p1_wins = summary.p1_wins,
            p2_wins = summary.p2_wins,
            ties = summary.ties,
            errors = summary.errors,
            "run finished"
        );
        Ok(summary)
    }
}

async fn run_job(job: BattleJob, ctx: TaskContext) -> Tally {
    let started_at_ms = now_ms();
    let started = Instant::now();
    let meta = BattleMeta {
        run_id: ctx.run_id.clone(),
        battle_index: job.index,
        battle_id: job.setup.battle_id.clone(),
        format: ctx.format_id.clone(),
        seed: job.setup.seed,
    };

    let outcome = drive_one(&job, &ctx).await;

    if let Ok(mut s) = ctx.stats.lock() {
        s.on_battle_finished();
        s.maybe_log_progress();
    }

    let finished_at_ms = now_ms();
    let setup = &job.setup;
    match outcome {
        Ok(result) => {
            let p1 = PlayerRecord::new(&setup.p1.policy_label, &setup.p1.team);
            let p2 = PlayerRecord::new(&setup.p2.policy_label, &setup.p2.team);
            let row = BattleOutcomeRecord {
                meta: meta.clone(),
                started_at_ms,
                finished_at_ms,
                duration_ms: started.elapsed().as_millis() as u64,
                sim_ms: result.ms,
                winner: winner_label(&result),
                turns: result.turns,
                repairs: result.repairs,
                p1: p1.clone(),
                p2: p2.clone(),
                teams: Some(TeamsRecord {
                    team1_packed: setup.p1.team.clone(),
                    team2_packed: setup.p2.team.clone(),
                }),
                league: job.league.clone(),
                error: None,
            };
            log_shared(&ctx.sinks.battles, &row);
            info!(
                battle_id = %setup.battle_id,
                winner = %row.winner,
                turns = result.turns,
                sim_ms = result.ms,
                p2_policy = %job.policies.p2_policy_id,
                "battle finished"
            );

            if ctx.save_replays {
                write_replay(&ctx, &meta, setup, &result, p1, p2).await;
            }
            if ctx.save_trajectories {
                for row in trajectory_rows(&meta, &result) {
                    log_shared(&ctx.sinks.trajectories, &row);
                }
            }
            match result.winner_side {
                Some(Side::P1) => Tally::P1,
                Some(Side::P2) => Tally::P2,
                None => Tally::Tie,
            }
        }
        Err((phase, kind, message)) => {
            warn!(battle_id = %setup.battle_id, phase, kind, error = %message, "battle failed");
            let row = BattleOutcomeRecord {
                meta,
                started_at_ms,
                finished_at_ms,
                duration_ms: started.elapsed().as_millis() as u64,
                sim_ms: 0,
                winner: "error".to_string(),
                turns: 0,
                repairs: 0,
                p1: PlayerRecord::policy_only(&setup.p1.policy_label),
                p2: PlayerRecord::policy_only(&setup.p2.policy_label),
                teams: None,
                league: job.league.clone(),
                error: Some(ErrorInfo {
                    kind: kind.to_string(),
                    message: message.clone(),
                    phase: phase.to_string(),
                }),
            };
            log_shared(&ctx.sinks.battles, &row);
            log_shared(
                &ctx.sinks.errors,
                &ErrorRow {
                    battle_index: job.index,
                    battle_id: setup.battle_id.clone(),
                    error_type: kind.to_string(),
                    error: message,
                },
            );
            Tally::Error
        }
    }
}

/// Spawn the engine, attach a coordinator when a side is RL-driven, and run
/// the battle. Errors come back as `(phase, kind, message)`.
async fn drive_one(job: &BattleJob, ctx: &TaskContext) -> Result<BattleResult, (&'static str, &'static str, String)> {
    let setup = &job.setup;
    let mut engine = (ctx.engines)().map_err(|err| ("spawn", "engine", format!("{err:#}")))?;

    let mut coordinator = match (&ctx.learner, &ctx.rollout) {
        (Some(learner), Some(rollout)) if setup.p1.mode.is_rl() || setup.p2.mode.is_rl() => Some(RlBattleCoordinator::new(
            learner.clone(),
            rollout.clone(),
            job.policies.clone(),
            Some(ctx.stats.clone()),
            &setup.battle_id,
        )),
        _ => None,
    };

    let result = run_battle(engine.as_mut(), setup, coordinator.as_mut(), ctx.sinks.debug.as_ref()).await;
    if result.is_err() {
        if let Some(coord) = coordinator.as_mut() {
            if let Err(err) = coord.abandon_battle().await {
                warn!(battle_id = %setup.battle_id, error = %err, "failed to release rollout state");
            }
        }
    }
    result.map_err(|err| ("battle", err.kind(), err.to_string()))
}

/// Append a replay row when the latch allows it. With no learner in the run
/// every battle is saved.
async fn write_replay(
    ctx: &TaskContext,
    meta: &BattleMeta,
    setup: &BattleSetup,
    result: &BattleResult,
    p1: PlayerRecord,
    p2: PlayerRecord,
) {
    let latched = match &ctx.rollout {
        Some(rollout) => match rollout.consume_save_next_replay().await {
            Ok(v) => v,
            Err(err) => {
                warn!(error = %err, "replay latch unavailable");
                false
            }
        },
        None => true,
    };
    if !latched {
        return;
    }

    let row = ReplayRecord {
        meta: meta.clone(),
        start_seed: setup.start_seed(),
        expected_winner: winner_label(result),
        expected_turns: result.turns,
        p1,
        p2,
        p1_team: setup.p1.team.clone(),
        p2_team: setup.p2.team.clone(),
        p1_choices: result.p1_choices.clone(),
        p2_choices: result.p2_choices.clone(),
    };
    log_shared(&ctx.sinks.replays, &row);

    let written = ctx.sinks.replays.lock().map(|s| s.is_enabled()).unwrap_or(false);
    if !written {
        if let Some(rollout) = &ctx.rollout {
            if let Err(err) = rollout.restore_save_next_replay().await {
                debug!(error = %err, "replay latch restore failed");
            }
        }
    } else {
        debug!(battle_id = %meta.battle_id, p1_team = %team_id(&setup.p1.team), "replay saved");
    }
}
