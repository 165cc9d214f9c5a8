// src/bin/vgc_selfplay.rs
//
// Thin harness around the library run loop. Everything defaults from the
// environment (see `RunConfig::from_env`); flags given here win.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use vgc_selfplay::config::RunConfig;
use vgc_selfplay::logging::init_logging;
use vgc_selfplay::rl::learner_client::{LearnerApi, LearnerClient};
use vgc_selfplay::runner::{load_teams, process_engine_factory, Runner};
use vgc_selfplay::sim::policy::PolicyMode;

#[derive(Parser, Debug)]
#[command(name = "vgc_selfplay", about = "Self-play battles feeding an external PPO learner")]
struct Cli {
    /// Number of battles to run.
    #[arg(long)]
    battles: Option<u32>,

    /// Battles in flight at once.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Base seed; battle `i` uses `seed + i + 1`.
    #[arg(long)]
    seed: Option<u32>,

    #[arg(long)]
    format: Option<String>,

    /// fallback | local | remote | ppo
    #[arg(long)]
    p1: Option<PolicyMode>,

    /// fallback | local | remote | ppo | league
    #[arg(long)]
    p2: Option<PolicyMode>,

    /// Decision steps per training update (clamped to 8..=8192).
    #[arg(long)]
    rollout_len: Option<usize>,

    #[arg(long)]
    run_dir: Option<PathBuf>,

    /// Packed teams, one per line.
    #[arg(long)]
    teams: Option<PathBuf>,

    #[arg(long)]
    engine_cmd: Option<String>,

    #[arg(long)]
    ppo_url: Option<String>,
}

fn apply_cli(cfg: &mut RunConfig, cli: Cli) {
    if let Some(v) = cli.battles {
        cfg.battles = v;
    }
    if let Some(v) = cli.concurrency {
        cfg.concurrency = v.max(1);
    }
    if let Some(v) = cli.seed {
        cfg.seed = v;
    }
    if let Some(v) = cli.format {
        cfg.format_id = v;
    }
    if let Some(v) = cli.p1 {
        cfg.p1_policy = v;
    }
    if let Some(v) = cli.p2 {
        cfg.p2_policy = v;
    }
    if let Some(v) = cli.rollout_len {
        cfg.set_rollout_len_from_cli(v);
    }
    if let Some(v) = cli.run_dir {
        cfg.run_dir = v;
    }
    if let Some(v) = cli.teams {
        cfg.teams_path = Some(v);
    }
    if let Some(v) = cli.engine_cmd {
        cfg.engine_cmd = v;
    }
    if let Some(v) = cli.ppo_url {
        cfg.ppo_url = v;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let mut cfg = RunConfig::from_env();
    apply_cli(&mut cfg, Cli::parse());

    let teams = match &cfg.teams_path {
        Some(path) => load_teams(path)?,
        None => Vec::new(),
    };
    let learner: Option<Arc<dyn LearnerApi>> = cfg
        .uses_learner()
        .then(|| Arc::new(LearnerClient::new(cfg.ppo_url.clone())) as Arc<dyn LearnerApi>);
    let engines = process_engine_factory(cfg.engine_cmd.clone());

    let summary = Runner::new(cfg, engines, learner)
        .with_teams(teams)
        .run()
        .await
        .context("self-play run failed")?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
