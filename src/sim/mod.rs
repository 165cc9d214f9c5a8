// src/sim/mod.rs
//
// Battle protocol driver: request parsing, choice normalization and repair,
// non-RL policies, and the engine transport.

pub mod choice;
pub mod driver;
pub mod engine;
pub mod mock_engine;
pub mod policy;
pub mod repair;
pub mod request;

pub use driver::{run_battle, BattleError, BattleResult, BattleSetup, PlayerSetup};
pub use engine::{BattleEngine, EngineMessage, ProcessEngine};
pub use policy::{ChoiceSource, PolicyMode};
pub use request::{DecisionRequest, ReceivedRequest};
