// src/config.rs
//
// Run configuration for the self-play coordinator.
//
// Environment first: every knob has a default and an env override. A value
// that fails to parse is ignored with a warning and the default is kept. The
// binary layers a few CLI flags on top of `RunConfig::from_env()`.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use rand::Rng;
use tracing::{info, warn};

use crate::sim::engine::DEFAULT_ENGINE_CMD;
use crate::sim::policy::PolicyMode;

pub const DEFAULT_ROLLOUT_LEN: usize = 5048;
pub const MIN_ROLLOUT_LEN: usize = 8;
pub const MAX_ROLLOUT_LEN: usize = 8192;

pub const DEFAULT_PPO_URL: &str = "http://127.0.0.1:8765";
pub const DEFAULT_FORMAT: &str = "gen9vgc2026regf";

/// Where the applied rollout length came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutLenSource {
    Cli,
    Env,
    Default,
    Unknown,
}

impl RolloutLenSource {
    pub fn as_str(self) -> &'static str {
        match self {
            RolloutLenSource::Cli => "cli",
            RolloutLenSource::Env => "env",
            RolloutLenSource::Default => "default",
            RolloutLenSource::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloutLenConfig {
    pub value: usize,
    pub source: RolloutLenSource,
    pub raw: Option<String>,
}

/// Resolve the rollout length from raw `PPO_ROLLOUT_LEN` and
/// `PPO_ROLLOUT_LEN_SOURCE` values.
///
/// Unset or blank → 5048 (`default`). Otherwise the value is truncated and
/// clamped to 8..=8192; non-numeric input clamps to 8. A `cli` hint is
/// reported as `cli`, any other non-empty hint as `unknown`, and no hint as
/// `env`.
pub fn resolve_rollout_len(raw: Option<&str>, source_hint: Option<&str>) -> RolloutLenConfig {
    let raw = raw.map(str::trim).unwrap_or("");
    if raw.is_empty() {
        return RolloutLenConfig {
            value: DEFAULT_ROLLOUT_LEN,
            source: RolloutLenSource::Default,
            raw: None,
        };
    }
    let value = match raw.parse::<f64>() {
        Ok(v) if v.is_finite() => (v.trunc().max(MIN_ROLLOUT_LEN as f64).min(MAX_ROLLOUT_LEN as f64)) as usize,
        _ => MIN_ROLLOUT_LEN,
    };
    let hint = source_hint.map(|h| h.trim().to_ascii_lowercase()).unwrap_or_default();
    let source = match hint.as_str() {
        "cli" => RolloutLenSource::Cli,
        "" => RolloutLenSource::Env,
        _ => RolloutLenSource::Unknown,
    };
    RolloutLenConfig {
        value,
        source,
        raw: Some(raw.to_string()),
    }
}

/// `1`, `true` or `yes` (case-insensitive).
pub fn parse_flag(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

/// Random run id: `run-<ms>-<4 hex>`.
pub fn generate_run_id() -> String {
    let suffix: u16 = rand::thread_rng().gen();
    format!("run-{}-{suffix:04x}", crate::telemetry::now_ms())
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub format_id: String,
    /// Battle `i` uses seed `seed + i + 1`.
    pub seed: u32,
    pub battles: u32,
    pub concurrency: usize,
    pub p1_policy: PolicyMode,
    pub p2_policy: PolicyMode,
    pub ppo_url: String,
    pub remote_url: Option<String>,
    pub engine_cmd: String,
    pub teams_path: Option<PathBuf>,
    pub save_replays: bool,
    pub save_trajectories: bool,
    pub demo_debug: bool,
    pub rollout_len: RolloutLenConfig,
    pub save_replay_every_n_updates: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        let run_id = generate_run_id();
        Self {
            run_dir: PathBuf::from("runs").join(&run_id),
            run_id,
            format_id: DEFAULT_FORMAT.to_string(),
            seed: 1,
            battles: 10,
            concurrency: 1,
            p1_policy: PolicyMode::Ppo,
            p2_policy: PolicyMode::League,
            ppo_url: DEFAULT_PPO_URL.to_string(),
            remote_url: None,
            engine_cmd: DEFAULT_ENGINE_CMD.to_string(),
            teams_path: None,
            save_replays: false,
            save_trajectories: false,
            demo_debug: false,
            rollout_len: resolve_rollout_len(None, None),
            save_replay_every_n_updates: 1,
        }
    }
}

/// Parse `name` if set; warn and keep `current` on failure.
fn env_parse<T>(name: &str, current: T) -> T
where
    T: FromStr + std::fmt::Debug,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => match raw.trim().parse::<T>() {
            Ok(v) => {
                info!(var = name, value = ?v, "config override");
                v
            }
            Err(_) => {
                warn!(var = name, raw = %raw, default = ?current, "could not parse env override; using default");
                current
            }
        },
        _ => current,
    }
}

fn env_string(name: &str) -> Option<String> {
    env::var(name).ok().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn env_flag(name: &str) -> bool {
    env::var(name).map(|v| parse_flag(&v)).unwrap_or(false)
}

impl RunConfig {
    /// Defaults with environment overrides applied:
    ///
    ///   - PPO_ROLLOUT_LEN / PPO_ROLLOUT_LEN_SOURCE
    ///   - VGC_SAVE_REPLAY_EVERY_N_UPDATES  (min 1)
    ///   - VGC_PPO_URL, VGC_REMOTE_URL
    ///   - VGC_FORMAT, VGC_SEED, VGC_BATTLES, VGC_CONCURRENCY (min 1)
    ///   - VGC_P1_POLICY, VGC_P2_POLICY
    ///   - VGC_RUN_ID, VGC_RUN_DIR (default `runs/<run_id>`)
    ///   - VGC_ENGINE_CMD, VGC_TEAMS_PATH
    ///   - VGC_SAVE_REPLAYS, VGC_SAVE_TRAJECTORIES, VGC_DEMO_DEBUG
    pub fn from_env() -> Self {
        let mut cfg = RunConfig::default();

        if let Some(id) = env_string("VGC_RUN_ID") {
            cfg.run_id = id;
        }
        cfg.run_dir = env_string("VGC_RUN_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("runs").join(&cfg.run_id));

        cfg.rollout_len = resolve_rollout_len(
            env::var("PPO_ROLLOUT_LEN").ok().as_deref(),
            env::var("PPO_ROLLOUT_LEN_SOURCE").ok().as_deref(),
        );
        cfg.save_replay_every_n_updates =
            env_parse("VGC_SAVE_REPLAY_EVERY_N_UPDATES", cfg.save_replay_every_n_updates).max(1);

        if let Some(url) = env_string("VGC_PPO_URL") {
            cfg.ppo_url = url;
        }
        cfg.remote_url = env_string("VGC_REMOTE_URL");
        if let Some(format) = env_string("VGC_FORMAT") {
            cfg.format_id = format;
        }
        cfg.seed = env_parse("VGC_SEED", cfg.seed);
        cfg.battles = env_parse("VGC_BATTLES", cfg.battles);
        cfg.concurrency = env_parse("VGC_CONCURRENCY", cfg.concurrency).max(1);
        cfg.p1_policy = env_parse("VGC_P1_POLICY", cfg.p1_policy);
        cfg.p2_policy = env_parse("VGC_P2_POLICY", cfg.p2_policy);

        if let Some(cmd) = env_string("VGC_ENGINE_CMD") {
            cfg.engine_cmd = cmd;
        }
        cfg.teams_path = env_string("VGC_TEAMS_PATH").map(PathBuf::from);
        cfg.save_replays = env_flag("VGC_SAVE_REPLAYS");
        cfg.save_trajectories = env_flag("VGC_SAVE_TRAJECTORIES");
        cfg.demo_debug = env::var("VGC_DEMO_DEBUG").map(|v| v.trim() == "1").unwrap_or(false);

        cfg
    }

    /// Override the rollout length from a CLI flag; clamps like the env path.
    pub fn set_rollout_len_from_cli(&mut self, value: usize) {
        let raw = value.to_string();
        self.rollout_len = resolve_rollout_len(Some(&raw), Some("cli"));
    }

    pub fn uses_learner(&self) -> bool {
        self.p1_policy.is_rl() || self.p2_policy.is_rl()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rollout_len_default_when_unset_or_blank() {
        let c = resolve_rollout_len(None, None);
        assert_eq!(c.value, 5048);
        assert_eq!(c.source, RolloutLenSource::Default);
        let c = resolve_rollout_len(Some("   "), Some("cli"));
        assert_eq!(c.source, RolloutLenSource::Default, "blank value ignores the hint");
    }

    #[test]
    fn test_rollout_len_clamps() {
        assert_eq!(resolve_rollout_len(Some("4"), None).value, 8);
        assert_eq!(resolve_rollout_len(Some("100000"), None).value, 8192);
        assert_eq!(resolve_rollout_len(Some("64.9"), None).value, 64);
        assert_eq!(resolve_rollout_len(Some("abc"), None).value, 8, "non-numeric clamps low");
    }

    #[test]
    fn test_rollout_len_source_hint() {
        assert_eq!(resolve_rollout_len(Some("64"), None).source, RolloutLenSource::Env);
        assert_eq!(resolve_rollout_len(Some("64"), Some("CLI")).source, RolloutLenSource::Cli);
        let c = resolve_rollout_len(Some("64"), Some("powershell"));
        assert_eq!(c.source, RolloutLenSource::Unknown);
        assert_eq!(c.raw.as_deref(), Some("64"));
        assert_eq!(c.source.as_str(), "unknown");
    }

    #[test]
    fn test_cli_override_clamps() {
        let mut cfg = RunConfig::default();
        cfg.set_rollout_len_from_cli(3);
        assert_eq!(cfg.rollout_len.value, 8);
        assert_eq!(cfg.rollout_len.source, RolloutLenSource::Cli);
    }

    #[test]
    fn test_parse_flag() {
        for yes in ["1", "true", "YES", " True "] {
            assert!(parse_flag(yes), "{yes}");
        }
        for no in ["0", "", "no", "off"] {
            assert!(!parse_flag(no), "{no}");
        }
    }

    #[test]
    fn test_run_id_shape() {
        let id = generate_run_id();
        assert!(id.starts_with("run-"));
        assert_eq!(id.rsplit('-').next().map(str::len), Some(4));
    }
}
