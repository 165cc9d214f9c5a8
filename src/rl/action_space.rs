// src/rl/action_space.rs
//
// Fixed per-combatant discrete action space.
//
// Layout (A = 34 ids per active slot):
//   0..27  : move slot i in [1..4] x target t in [0..6]
//            id = (i - 1) * 7 + t
//   28..33 : switch to roster slot s in [1..6]
//            id = 28 + (s - 1)
//
// There is no dedicated pass id. When a slot has nothing legal to do (a
// forced slot without a bench option, or the dummy right slot in a
// single-choice turn) the builder marks DEFAULT_ACTION_ID legal and maps it
// to the literal `pass` command in that turn's lookup table.

use serde::{Deserialize, Serialize};

/// Current action-space layout version.
/// Increment when changing the id layout.
pub const ACTION_SPACE_VERSION: u32 = 1;

pub const MOVE_SLOTS: usize = 4;
pub const TARGETS: usize = 7;
pub const SWITCH_SLOTS: usize = 6;

pub const MOVE_ACTIONS: usize = MOVE_SLOTS * TARGETS;
pub const SWITCH_BASE: usize = MOVE_ACTIONS;
pub const ACTIONS_PER_ACTIVE: usize = MOVE_ACTIONS + SWITCH_SLOTS;

/// Explicit fallback id used for pass-only slots and history padding.
pub const DEFAULT_ACTION_ID: usize = 0;

/// Move target, in id order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Opp1 = 0,
    Opp2 = 1,
    Ally = 2,
    SelfTarget = 3,
    AllOpp = 4,
    All = 5,
    None = 6,
}

impl Target {
    pub const ALL: [Target; TARGETS] = [
        Target::Opp1,
        Target::Opp2,
        Target::Ally,
        Target::SelfTarget,
        Target::AllOpp,
        Target::All,
        Target::None,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(i: usize) -> Option<Self> {
        Self::ALL.get(i).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Target::Opp1 => "opp1",
            Target::Opp2 => "opp2",
            Target::Ally => "ally",
            Target::SelfTarget => "self",
            Target::AllOpp => "all_opp",
            Target::All => "all",
            Target::None => "none",
        }
    }
}

/// Decoded form of an action id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodedAction {
    Move { slot: usize, target: Target },
    Switch { slot: usize },
}

/// Encode a move slot (1-based) and target. Out-of-range slots clamp.
pub fn encode_move(slot: usize, target: Target) -> usize {
    let i0 = slot.clamp(1, MOVE_SLOTS) - 1;
    i0 * TARGETS + target.index()
}

/// Encode a switch to roster slot (1-based). Out-of-range slots clamp.
pub fn encode_switch(slot: usize) -> usize {
    SWITCH_BASE + slot.clamp(1, SWITCH_SLOTS) - 1
}

pub fn decode_move(action_id: usize) -> Option<(usize, Target)> {
    if action_id >= MOVE_ACTIONS {
        return None;
    }
    let slot = action_id / TARGETS + 1;
    let target = Target::from_index(action_id % TARGETS)?;
    Some((slot, target))
}

pub fn decode_switch(action_id: usize) -> Option<usize> {
    if !(SWITCH_BASE..SWITCH_BASE + SWITCH_SLOTS).contains(&action_id) {
        return None;
    }
    Some(action_id - SWITCH_BASE + 1)
}

pub fn decode_action(action_id: usize) -> Option<DecodedAction> {
    if let Some((slot, target)) = decode_move(action_id) {
        return Some(DecodedAction::Move { slot, target });
    }
    decode_switch(action_id).map(|slot| DecodedAction::Switch { slot })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_constants() {
        assert_eq!(MOVE_ACTIONS, 28);
        assert_eq!(SWITCH_BASE, 28);
        assert_eq!(ACTIONS_PER_ACTIVE, 34);
    }

    #[test]
    fn test_move_round_trip_all_pairs() {
        for slot in 1..=MOVE_SLOTS {
            for target in Target::ALL {
                let id = encode_move(slot, target);
                assert!(id < MOVE_ACTIONS, "move id {id} out of move range");
                assert_eq!(
                    decode_move(id),
                    Some((slot, target)),
                    "round trip failed for slot={slot} target={}",
                    target.as_str()
                );
            }
        }
    }

    #[test]
    fn test_switch_round_trip_all_slots() {
        for slot in 1..=SWITCH_SLOTS {
            let id = encode_switch(slot);
            assert_eq!(decode_switch(id), Some(slot));
            assert_eq!(decode_action(id), Some(DecodedAction::Switch { slot }));
            assert!(decode_move(id).is_none());
        }
    }

    #[test]
    fn test_ids_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for slot in 1..=MOVE_SLOTS {
            for target in Target::ALL {
                assert!(seen.insert(encode_move(slot, target)));
            }
        }
        for slot in 1..=SWITCH_SLOTS {
            assert!(seen.insert(encode_switch(slot)));
        }
        assert_eq!(seen.len(), ACTIONS_PER_ACTIVE);
    }

    #[test]
    fn test_out_of_range_decodes_to_none() {
        assert_eq!(decode_action(ACTIONS_PER_ACTIVE), None);
        assert_eq!(decode_switch(5), None);
        assert_eq!(decode_move(30), None);
    }

    #[test]
    fn test_encode_clamps_slots() {
        assert_eq!(encode_move(0, Target::Opp1), encode_move(1, Target::Opp1));
        assert_eq!(encode_move(9, Target::None), encode_move(4, Target::None));
        assert_eq!(encode_switch(7), encode_switch(6));
    }
}
