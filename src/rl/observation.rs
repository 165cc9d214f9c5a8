// src/rl/observation.rs
//
// Deterministic packing of a BattleStateTracker into the fixed-shape
// observation the learning service consumes.
//
// entity_int   [12][11] : species, status, type1, type2, item, ability,
//                         tera_type, move1..move4
// entity_float [12][11] : hp_frac, fainted, active, terastallized, boosts(7)
// global_int   [10]     : turn, weather, terrain, trick_room, tailwind_my,
//                         tailwind_opp, reflect_my, lightscreen_my,
//                         reflect_opp, lightscreen_opp
// global_float [1]      : reserved, zero
// history_int  [K][4]   : my_a1, my_a2, opp_a1, opp_a2
// history_float[K][2]   : delta_my_hp_sum, delta_opp_hp_sum

use serde::{Deserialize, Serialize};

use crate::rl::state_tracker::{BattleStateTracker, CombatantBelief, HISTORY_K, TEAM_SIZE};
use crate::vocab::{ability_id, item_id, tera_type_id};

pub const ENTITY_COUNT: usize = TEAM_SIZE * 2;
pub const ENTITY_INT_DIM: usize = 11;
pub const ENTITY_FLOAT_DIM: usize = 11;
pub const GLOBAL_INT_DIM: usize = 10;
pub const GLOBAL_FLOAT_DIM: usize = 1;
pub const HISTORY_INT_DIM: usize = 4;
pub const HISTORY_FLOAT_DIM: usize = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackedObservation {
    pub entity_int: Vec<Vec<i64>>,
    pub entity_float: Vec<Vec<f32>>,
    pub global_int: Vec<i64>,
    pub global_float: Vec<f32>,
    pub history_int: Vec<Vec<i64>>,
    pub history_float: Vec<Vec<f32>>,
}

/// Tensor shapes, as reported in diagnostic dumps.
pub fn observation_shapes() -> serde_json::Value {
    serde_json::json!({
        "entity_int": [ENTITY_COUNT, ENTITY_INT_DIM],
        "entity_float": [ENTITY_COUNT, ENTITY_FLOAT_DIM],
        "global_int": [GLOBAL_INT_DIM],
        "global_float": [GLOBAL_FLOAT_DIM],
        "history_int": [HISTORY_K, HISTORY_INT_DIM],
        "history_float": [HISTORY_K, HISTORY_FLOAT_DIM],
    })
}

fn entity_ints(m: &CombatantBelief) -> Vec<i64> {
    let mut row = vec![0i64; ENTITY_INT_DIM];
    row[0] = m.species_id as i64;
    row[1] = m.status_id as i64;
    // Types (2, 3) are never observed from requests or public lines.
    row[4] = item_id(&m.item) as i64;
    row[5] = ability_id(&m.ability) as i64;
    row[6] = tera_type_id(&m.tera_type) as i64;
    for (dst, mv) in row[7..].iter_mut().zip(m.revealed_moves.iter()) {
        *dst = *mv as i64;
    }
    row
}

fn entity_floats(m: &CombatantBelief) -> Vec<f32> {
    let mut row = vec![0f32; ENTITY_FLOAT_DIM];
    row[0] = if m.hp_frac.is_finite() { m.hp_frac } else { -1.0 };
    row[1] = if m.fainted { 1.0 } else { 0.0 };
    row[2] = if m.active { 1.0 } else { 0.0 };
    row[3] = if m.terastallized { 1.0 } else { 0.0 };
    for (dst, b) in row[4..].iter_mut().zip(m.boosts.iter()) {
        *dst = if b.is_finite() { *b } else { 0.0 };
    }
    row
}

/// Pure function of the tracker; the same state always packs identically.
pub fn pack_observation(tr: &BattleStateTracker) -> PackedObservation {
    let (entity_int, entity_float) = tr
        .my
        .iter()
        .chain(tr.opp.iter())
        .map(|m| (entity_ints(m), entity_floats(m)))
        .unzip();

    let f = &tr.field;
    let global_int = vec![
        f.turn as i64,
        f.weather_id as i64,
        f.terrain_id as i64,
        f.trick_room_turns as i64,
        f.tailwind_my as i64,
        f.tailwind_opp as i64,
        f.reflect_my as i64,
        f.lightscreen_my as i64,
        f.reflect_opp as i64,
        f.lightscreen_opp as i64,
    ];

    let mut history_int = vec![vec![0i64; HISTORY_INT_DIM]; HISTORY_K];
    let mut history_float = vec![vec![0f32; HISTORY_FLOAT_DIM]; HISTORY_K];
    for k in 0..HISTORY_K {
        let my = tr.last_actions_my.get(k).copied().unwrap_or([0, 0]);
        let opp = tr.last_actions_opp.get(k).copied().unwrap_or([0, 0]);
        history_int[k] = vec![my[0] as i64, my[1] as i64, opp[0] as i64, opp[1] as i64];

        let dmg = tr.last_damage.get(k).copied().unwrap_or([0.0, 0.0]);
        history_float[k] = vec![dmg[0] as f32, dmg[1] as f32];
    }

    PackedObservation {
        entity_int,
        entity_float,
        global_int,
        global_float: vec![0.0; GLOBAL_FLOAT_DIM],
        history_int,
        history_float,
    }
}
