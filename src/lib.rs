//! vgc_selfplay: self-play coordinator for doubles battles on the Showdown
//! simulator, producing rollouts for an external PPO learning service.
//!
//! The binary (`src/bin/vgc_selfplay.rs`) is a thin harness around
//! [`runner::Runner`]; all logic lives in this crate.

pub mod config;
pub mod logging;
pub mod records;
pub mod rl;
pub mod runner;
pub mod sim;
pub mod telemetry;
pub mod vocab;

// --- Re-exports for ergonomic external use ---------------------------------

pub use config::RunConfig;
pub use rl::{LearnerApi, LearnerClient, RlBattleCoordinator, RolloutHandle, Side};
pub use runner::{EngineFactory, RunSummary, Runner};
pub use sim::{run_battle, BattleError, BattleResult, BattleSetup, PlayerSetup, PolicyMode};
