// src/rl/action_builder.rs
//
// Derives per-slot legality masks and id -> choice-string tables from a
// decision request.
//
// Slot indices are the request's own active positions (0/1); they are never
// compacted, so `forceSwitch[i]` and `active[i]` stay aligned.

use serde::Serialize;

use crate::rl::action_space::{
    encode_move, encode_switch, Target, ACTIONS_PER_ACTIVE, DEFAULT_ACTION_ID, MOVE_ACTIONS,
};
use crate::rl::state_tracker::BattleStateTracker;
use crate::sim::request::{ActiveOptions, DecisionRequest};

/// Moves whose request entry sometimes omits `target` even though the
/// engine then rejects them with "needs a target".
pub const FORCE_NEEDS_TARGET_MOVE_IDS: [&str; 9] = [
    "aurasphere",
    "shadowball",
    "darkpulse",
    "thunderbolt",
    "icebeam",
    "flamethrower",
    "energyball",
    "partingshot",
    "ragefist",
];

/// Moves that must never carry a target location.
pub const NEVER_TARGET_MOVE_IDS: [&str; 23] = [
    // protect family
    "protect",
    "detect",
    "spikyshield",
    "kingsshield",
    "banefulbunker",
    "silktrap",
    "obstruct",
    "endure",
    // guards
    "wideguard",
    "quickguard",
    "craftyshield",
    "matblock",
    // spread
    "rockslide",
    "icywind",
    "makeitrain",
    "bleakwindstorm",
    // redirection
    "followme",
    "ragepowder",
    // side / self setup
    "tailwind",
    "nastyplot",
    // auto-targeted
    "struggle",
    "recharge",
    "outrage",
];

const NEVER_TARGET_MOVE_NAMES: [&str; 10] = [
    "protect",
    "spiky shield",
    "rock slide",
    "icy wind",
    "make it rain",
    "bleakwind storm",
    "follow me",
    "rage powder",
    "tailwind",
    "nasty plot",
];

const FOE_TARGET_TYPES: [&str; 5] = ["normal", "adjacentFoe", "any", "anyAdjacentFoe", "randomNormal"];

pub fn is_force_needs_target_move(id_lower: &str) -> bool {
    FORCE_NEEDS_TARGET_MOVE_IDS.contains(&id_lower)
}

pub fn is_never_target_move(id_lower: &str, name_lower: &str) -> bool {
    NEVER_TARGET_MOVE_IDS.contains(&id_lower) || NEVER_TARGET_MOVE_NAMES.contains(&name_lower)
}

/// Target types that never take an explicit location.
pub fn is_no_target_type(t: &str) -> bool {
    !t.is_empty() && (t == "self" || t.starts_with("all") || t == "adjacentAllies" || t == "allies")
}

pub fn is_foe_target_type(t: &str) -> bool {
    FOE_TARGET_TYPES.contains(&t)
}

/// Engine target-location suffix for an abstract target.
pub fn move_target_loc(target: Target, active_index: usize, has_partner: bool, opp_has_partner: bool) -> &'static str {
    match target {
        Target::Opp1 => " 1",
        Target::Opp2 => {
            if opp_has_partner {
                " 2"
            } else {
                " 1"
            }
        }
        Target::Ally => {
            if !has_partner {
                ""
            } else if active_index == 0 {
                " -2"
            } else {
                " -1"
            }
        }
        Target::SelfTarget => {
            if active_index == 0 {
                " -1"
            } else {
                " -2"
            }
        }
        Target::AllOpp | Target::All | Target::None => "",
    }
}

/// Builder output for one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuiltActions {
    /// 1 or 2.
    pub expected_choices: usize,
    pub slot_left: usize,
    pub slot_right: usize,
    pub mask_left: Vec<u8>,
    pub mask_right: Vec<u8>,
    pub table_left: Vec<Option<String>>,
    pub table_right: Vec<Option<String>>,
}

impl BuiltActions {
    pub fn mask_sums(&self) -> (usize, usize) {
        let sum = |m: &[u8]| m.iter().filter(|x| **x != 0).count();
        (sum(&self.mask_left), sum(&self.mask_right))
    }

    /// Choice string for an id, `default` when the id has no entry.
    pub fn left_choice(&self, action_id: usize) -> String {
        lookup(&self.table_left, action_id)
    }

    pub fn right_choice(&self, action_id: usize) -> String {
        lookup(&self.table_right, action_id)
    }
}

fn lookup(table: &[Option<String>], action_id: usize) -> String {
    table
        .get(action_id)
        .and_then(|c| c.clone())
        .unwrap_or_else(|| "default".to_string())
}

struct SlotContext {
    slot_index: usize,
    forced: bool,
    pass_only: bool,
    has_partner: bool,
    opp_has_partner: bool,
}

fn allowed_targets(
    id: &str,
    name: &str,
    target_type: Option<&str>,
    has_partner: bool,
    opp_has_partner: bool,
) -> Vec<Target> {
    let foe = || {
        let mut v = vec![Target::Opp1];
        if opp_has_partner {
            v.push(Target::Opp2);
        }
        v
    };
    match target_type {
        // Missing metadata: only guess a foe target for known offenders.
        None => {
            if is_force_needs_target_move(id) {
                foe()
            } else {
                vec![Target::None]
            }
        }
        Some(t) if is_never_target_move(id, name) || is_no_target_type(t) => vec![Target::None],
        Some("adjacentAlly") | Some("ally") => {
            if has_partner {
                vec![Target::Ally]
            } else {
                Vec::new()
            }
        }
        Some("adjacentAllyOrSelf") => {
            let mut v = Vec::new();
            if has_partner {
                v.push(Target::Ally);
            }
            v.push(Target::SelfTarget);
            v
        }
        Some(t) if is_foe_target_type(t) => foe(),
        Some(_) => vec![Target::None],
    }
}

fn build_for_active(
    req: &DecisionRequest,
    active: Option<&ActiveOptions>,
    ctx: &SlotContext,
    mask: &mut [u8],
    table: &mut [Option<String>],
) {
    if ctx.forced && ctx.pass_only {
        mask[DEFAULT_ACTION_ID] = 1;
        table[DEFAULT_ACTION_ID] = Some("pass".to_string());
        return;
    }

    if !ctx.forced {
        let moves = active.map(|a| a.moves.as_slice()).unwrap_or(&[]);
        for (j, m) in moves.iter().take(4).enumerate() {
            if m.disabled {
                continue;
            }
            let slot = j + 1;
            let targets = allowed_targets(
                &m.id_lower(),
                &m.name_lower(),
                m.target_type(),
                ctx.has_partner,
                ctx.opp_has_partner,
            );
            for target in targets {
                let loc = move_target_loc(target, ctx.slot_index, ctx.has_partner, ctx.opp_has_partner);
                let id = encode_move(slot, target);
                mask[id] = 1;
                table[id] = Some(format!("move {slot}{loc}"));
            }
        }
    }

    if req.can_switch_now() {
        for slot in req.legal_switch_slots() {
            let id = encode_switch(slot);
            mask[id] = 1;
            table[id] = Some(format!("switch {slot}"));
        }
    }

    if ctx.forced {
        for a in 0..MOVE_ACTIONS {
            mask[a] = 0;
            table[a] = None;
        }
    }

    if !mask.iter().any(|x| *x == 1) {
        mask[DEFAULT_ACTION_ID] = 1;
        table[DEFAULT_ACTION_ID] = Some("pass".to_string());
    }
}

/// Masks and choice tables for both actor slots.
pub fn build_actions_for_request(req: &DecisionRequest, tracker: &BattleStateTracker) -> BuiltActions {
    let alive_positions = req.alive_active_positions();

    let mut slots_to_choose: Vec<usize> = Vec::new();
    let mut pass_only_slots: Vec<usize> = Vec::new();

    let force_flags = req.force_switch_flags();
    if !force_flags.is_empty() {
        let forced_slots: Vec<usize> = force_flags
            .iter()
            .take(2)
            .enumerate()
            .filter(|(_, f)| **f)
            .map(|(i, _)| i)
            .collect();
        // The engine may still want one choice per forced slot when fewer
        // bench options exist; the surplus slots answer `pass`.
        let available = req.legal_switch_slots().len();
        let k = forced_slots.len().min(available);
        for (i, s) in forced_slots.into_iter().enumerate() {
            slots_to_choose.push(s);
            if i >= k {
                pass_only_slots.push(s);
            }
        }
    } else if alive_positions.len() == 1 {
        slots_to_choose.extend(alive_positions.iter().copied());
    } else {
        for (i, a) in req.active_slots().iter().take(2).enumerate() {
            if a.as_ref().map(|a| a.has_moves()).unwrap_or(false) {
                slots_to_choose.push(i);
            }
        }
    }

    if slots_to_choose.is_empty() {
        slots_to_choose.push(0);
    }
    slots_to_choose.sort_unstable();

    let slot_left = slots_to_choose[0];
    let slot_right = slots_to_choose
        .get(1)
        .copied()
        .unwrap_or(if slot_left == 0 { 1 } else { 0 });
    let expected_choices = slots_to_choose.len().min(2);

    let has_partner = alive_positions.len() >= 2;
    let opp_has_partner = tracker.opp_alive_active_count() >= 2;

    let mut out = BuiltActions {
        expected_choices,
        slot_left,
        slot_right,
        mask_left: vec![0; ACTIONS_PER_ACTIVE],
        mask_right: vec![0; ACTIONS_PER_ACTIVE],
        table_left: vec![None; ACTIONS_PER_ACTIVE],
        table_right: vec![None; ACTIONS_PER_ACTIVE],
    };

    let ctx_for = |slot: usize| SlotContext {
        slot_index: slot,
        forced: req.is_forced(slot),
        pass_only: pass_only_slots.contains(&slot),
        has_partner,
        opp_has_partner,
    };

    build_for_active(
        req,
        req.active_at(slot_left),
        &ctx_for(slot_left),
        &mut out.mask_left,
        &mut out.table_left,
    );
    if expected_choices >= 2 {
        build_for_active(
            req,
            req.active_at(slot_right),
            &ctx_for(slot_right),
            &mut out.mask_right,
            &mut out.table_right,
        );
    } else {
        out.mask_right[DEFAULT_ACTION_ID] = 1;
        out.table_right[DEFAULT_ACTION_ID] = Some("pass".to_string());
    }

    out
}
