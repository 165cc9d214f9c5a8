// src/rl/mod.rs
//
// RL side of the self-play loop.
//
// Key components:
// - ActionSpace / ActionBuilder: fixed 34-id space per slot, masks and
//   id -> choice tables derived from a decision request
// - BattleStateTracker: partially-observable belief state plus shaping reward
// - Observation: fixed-shape packed observation sent to the learner
// - RolloutCollector: step buffer behind an actor handle, flushes to /train
// - LearnerClient: HTTP contract of the external learning service
// - LeagueManager: opponent sampling over learner snapshots
// - RlBattleCoordinator: per-battle facade wiring the above together
// - RunStats: counters, train metrics JSONL and diagnostic dumps

pub mod action_builder;
pub mod action_space;
pub mod coordinator;
pub mod league;
pub mod learner_client;
pub mod observation;
pub mod rollout;
pub mod state_tracker;
pub mod stats;

pub use action_builder::{build_actions_for_request, BuiltActions};
pub use action_space::{decode_action, ACTIONS_PER_ACTIVE, DEFAULT_ACTION_ID};
pub use coordinator::{CoordinatorError, PolicyPair, RlBattleCoordinator};
pub use league::{LeagueManager, LeagueSample};
pub use learner_client::{LearnerApi, LearnerClient, LearnerError};
pub use observation::{pack_observation, PackedObservation};
pub use rollout::{spawn_rollout_actor, RolloutCollector, RolloutHandle};
pub use state_tracker::{BattleStateTracker, Side};
pub use stats::{RunStats, SharedStats};
