// src/rl/state_tracker.rs
//
// Per-battle belief state, from the learner's (p1) point of view.
//
// Own-side beliefs are refreshed wholesale from p1's decision requests.
// Opponent beliefs only ever come from public spectator lines, so they are a
// monotonically revealing projection: species/moves are never retracted, and
// HP/active/fainted change only on explicit events.

use std::collections::HashMap;

use serde::Serialize;

use crate::rl::action_space::DEFAULT_ACTION_ID;
use crate::sim::request::DecisionRequest;
use crate::vocab::{
    is_fainted_condition, move_id, parse_hp_fraction, species_from_details, species_id,
    status_id_from_condition, terrain_id, weather_id, STATUS_NAMES,
};

pub const TEAM_SIZE: usize = 6;
pub const HISTORY_K: usize = 4;
pub const BOOST_KEYS: [&str; 7] = ["atk", "def", "spa", "spd", "spe", "accuracy", "evasion"];

pub const TRICK_ROOM_TURNS: u32 = 5;
pub const TAILWIND_TURNS: u32 = 4;
pub const SCREEN_TURNS: u32 = 5;

/// Shaping weights: faint differential and HP differential.
pub const FAINT_WEIGHT: f64 = 1.0;
pub const HP_WEIGHT: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    P1,
    P2,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::P1 => "p1",
            Side::P2 => "p2",
        }
    }

    pub fn other(self) -> Side {
        match self {
            Side::P1 => Side::P2,
            Side::P2 => Side::P1,
        }
    }

    pub fn parse(s: &str) -> Option<Side> {
        match s.trim().to_lowercase().as_str() {
            "p1" => Some(Side::P1),
            "p2" => Some(Side::P2),
            _ => None,
        }
    }
}

/// Belief about one roster slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CombatantBelief {
    pub species_name: String,
    pub species_id: u32,
    /// In [0, 1]; -1 when never observed.
    pub hp_frac: f32,
    pub fainted: bool,
    pub active: bool,
    pub status_id: u32,
    pub revealed_moves: [u32; 4],
    pub boosts: [f32; 7],
    pub terastallized: bool,
    pub item: String,
    pub ability: String,
    pub tera_type: String,
}

impl Default for CombatantBelief {
    fn default() -> Self {
        Self {
            species_name: String::new(),
            species_id: 0,
            hp_frac: -1.0,
            fainted: false,
            active: false,
            status_id: 0,
            revealed_moves: [0; 4],
            boosts: [0.0; 7],
            terastallized: false,
            item: String::new(),
            ability: String::new(),
            tera_type: String::new(),
        }
    }
}

impl CombatantBelief {
    fn reveal_move(&mut self, name: &str) {
        let mid = move_id(name);
        if mid == 0 || self.revealed_moves.contains(&mid) {
            return;
        }
        if let Some(slot) = self.revealed_moves.iter_mut().find(|m| **m == 0) {
            *slot = mid;
        }
    }

    fn hp_snapshot(&self) -> HpSnapshot {
        HpSnapshot {
            hp: if self.fainted { 0.0 } else { self.hp_frac },
            known: self.fainted || self.hp_frac >= 0.0,
            fainted: self.fainted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct HpSnapshot {
    hp: f32,
    known: bool,
    fainted: bool,
}

impl Default for HpSnapshot {
    fn default() -> Self {
        Self {
            hp: -1.0,
            known: false,
            fainted: false,
        }
    }
}

/// Result of a shaping-reward consumption.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ShapingReward {
    pub reward: f64,
    pub hp_delta_my: f64,
    pub hp_delta_opp: f64,
    pub faint_delta: i32,
}

/// Field/side scalar state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FieldState {
    pub turn: u32,
    pub weather_id: u32,
    pub terrain_id: u32,
    pub trick_room_turns: u32,
    pub tailwind_my: u32,
    pub tailwind_opp: u32,
    pub reflect_my: u32,
    pub lightscreen_my: u32,
    pub reflect_opp: u32,
    pub lightscreen_opp: u32,
}

impl FieldState {
    fn decay(&mut self) {
        for counter in [
            &mut self.trick_room_turns,
            &mut self.tailwind_my,
            &mut self.tailwind_opp,
            &mut self.reflect_my,
            &mut self.lightscreen_my,
            &mut self.reflect_opp,
            &mut self.lightscreen_opp,
        ] {
            *counter = counter.saturating_sub(1);
        }
    }
}

/// Parsed `pXa: Name` identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Who {
    side: Side,
    pos: Option<usize>,
}

fn parse_who(who: &str) -> Option<Who> {
    let s = who.trim();
    let (head, _) = s.split_once(':')?;
    let head = head.to_lowercase();
    let side = Side::parse(head.get(..2)?)?;
    let pos = match head.get(2..) {
        Some("a") => Some(0),
        Some("b") => Some(1),
        Some("") => None,
        _ => return None,
    };
    Some(Who { side, pos })
}

/// Mutable belief state for one battle.
#[derive(Debug, Clone)]
pub struct BattleStateTracker {
    pub my: [CombatantBelief; TEAM_SIZE],
    pub opp: [CombatantBelief; TEAM_SIZE],
    pub field: FieldState,

    /// Oldest first, newest last.
    pub last_actions_my: Vec<[usize; 2]>,
    pub last_actions_opp: Vec<[usize; 2]>,
    /// `[delta_my_hp_sum, delta_opp_hp_sum]` per consumed reward.
    pub last_damage: Vec<[f64; 2]>,

    opp_slot_by_ident: HashMap<String, usize>,
    next_opp_slot: usize,
    opp_active_by_pos: [Option<usize>; 2],
    prev_snapshot: [HpSnapshot; TEAM_SIZE * 2],
}

impl Default for BattleStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn rotate_push<T>(ring: &mut Vec<T>, value: T, max_len: usize) {
    ring.push(value);
    while ring.len() > max_len {
        ring.remove(0);
    }
}

/// `p2a: Foo` and `p2b: Foo` both map to `p2: Foo`.
fn identity_key(who: &str) -> String {
    let who = who.trim();
    match who.split_once(':') {
        Some((prefix, name)) => {
            let side: String = prefix.trim().chars().take(2).collect();
            format!("{side}: {}", name.trim())
        }
        None => who.to_string(),
    }
}

impl BattleStateTracker {
    pub fn new() -> Self {
        Self {
            my: Default::default(),
            opp: Default::default(),
            field: FieldState::default(),
            last_actions_my: vec![[DEFAULT_ACTION_ID; 2]; HISTORY_K],
            last_actions_opp: vec![[DEFAULT_ACTION_ID; 2]; HISTORY_K],
            last_damage: vec![[0.0; 2]; HISTORY_K],
            opp_slot_by_ident: HashMap::new(),
            next_opp_slot: 0,
            opp_active_by_pos: [None, None],
            prev_snapshot: [HpSnapshot::default(); TEAM_SIZE * 2],
        }
    }

    pub fn opp_alive_active_count(&self) -> usize {
        self.opp.iter().filter(|m| m.active && !m.fainted).count()
    }

    /// Refresh own-side beliefs from a decision request.
    ///
    /// Requests for any side other than p1 are ignored so the opponent's
    /// private information never enters the learner's observation.
    pub fn update_from_request(&mut self, side: Side, req: &DecisionRequest) {
        if side != Side::P1 {
            return;
        }
        let mons = req.side_pokemon();

        for (belief, p) in self.my.iter_mut().zip(mons.iter()) {
            let fainted = p.is_fainted();
            belief.active = p.active;
            belief.fainted = fainted;
            belief.hp_frac = if fainted {
                0.0
            } else {
                parse_hp_fraction(&p.condition)
            };
            belief.status_id = status_id_from_condition(&p.condition);

            let species = species_from_details(&p.details);
            if !species.is_empty() && belief.species_name.is_empty() {
                belief.species_id = species_id(&species);
                belief.species_name = species;
            }

            let mut moves = [0u32; 4];
            for (slot, name) in moves.iter_mut().zip(p.moves.iter()) {
                *slot = move_id(name);
            }
            belief.revealed_moves = moves;

            belief.item = p.item.clone();
            belief.ability = p.ability_name().to_string();
            belief.tera_type = p.tera_type.clone();
            belief.terastallized = !p.terastallized.trim().is_empty();
        }

        // active[i] lines up with the i-th active entry of side.pokemon.
        let active_slots: Vec<usize> = mons
            .iter()
            .enumerate()
            .filter(|(_, p)| p.active)
            .map(|(i, _)| i)
            .collect();
        for (ai, entry) in req.active_slots().iter().take(2).enumerate() {
            let Some(entry) = entry else { continue };
            let Some(&slot) = active_slots.get(ai) else {
                continue;
            };
            if slot >= TEAM_SIZE {
                continue;
            }
            let mut boosts = [0.0f32; 7];
            for (b, key) in boosts.iter_mut().zip(BOOST_KEYS.iter()) {
                *b = entry.boosts.get(*key).copied().unwrap_or(0.0);
            }
            self.my[slot].boosts = boosts;
        }
    }

    /// Apply one public protocol line (`|tag|...`).
    pub fn ingest_spectator_line(&mut self, line: &str) {
        if !line.starts_with('|') {
            return;
        }
        let parts: Vec<&str> = line.split('|').collect();
        let tag = parts.get(1).copied().unwrap_or("");
        let arg = |i: usize| parts.get(i).copied().unwrap_or("");

        match tag {
            "turn" => {
                if let Ok(t) = arg(2).trim().parse::<u32>() {
                    self.field.turn = t;
                    self.field.decay();
                }
            }
            "-weather" => {
                let w = arg(2).trim();
                self.field.weather_id = if w.is_empty() || w.eq_ignore_ascii_case("none") {
                    0
                } else {
                    weather_id(w)
                };
            }
            "-fieldstart" => {
                let what = arg(2).trim();
                let lower = what.to_lowercase();
                if lower.contains("trick room") {
                    self.field.trick_room_turns = TRICK_ROOM_TURNS;
                } else if let Some(idx) = lower.find("terrain") {
                    // "move: Electric Terrain" names the terrain before the
                    // keyword, "terrain: Psychic" after it.
                    let after = what[idx + "terrain".len()..]
                        .trim_start_matches(|c: char| c == ':' || c.is_whitespace())
                        .trim();
                    let name = if after.is_empty() { what } else { after };
                    self.field.terrain_id = terrain_id(name);
                }
            }
            "-fieldend" => {
                let lower = arg(2).to_lowercase();
                if lower.contains("trick room") {
                    self.field.trick_room_turns = 0;
                }
                if lower.contains("terrain") {
                    self.field.terrain_id = 0;
                }
            }
            "-sidestart" | "-sideend" => {
                let is_p1 = arg(2).trim_start().starts_with("p1");
                let start = tag == "-sidestart";
                let what = arg(3).to_lowercase();
                let f = &mut self.field;
                if what.contains("tailwind") {
                    let v = if start { TAILWIND_TURNS } else { 0 };
                    if is_p1 {
                        f.tailwind_my = v;
                    } else {
                        f.tailwind_opp = v;
                    }
                }
                if what.contains("reflect") {
                    let v = if start { SCREEN_TURNS } else { 0 };
                    if is_p1 {
                        f.reflect_my = v;
                    } else {
                        f.reflect_opp = v;
                    }
                }
                if what.contains("light screen") {
                    let v = if start { SCREEN_TURNS } else { 0 };
                    if is_p1 {
                        f.lightscreen_my = v;
                    } else {
                        f.lightscreen_opp = v;
                    }
                }
            }
            "switch" | "drag" => self.on_switch(arg(2), arg(3), arg(4)),
            "faint" => {
                let who = arg(2);
                if let Some(Who { side: Side::P2, .. }) = parse_who(who) {
                    let slot = self.opp_slot_for_ident(who);
                    let m = &mut self.opp[slot];
                    m.fainted = true;
                    m.hp_frac = 0.0;
                    m.active = false;
                    for pos in self.opp_active_by_pos.iter_mut() {
                        if *pos == Some(slot) {
                            *pos = None;
                        }
                    }
                }
            }
            "-damage" | "-heal" => {
                let who = arg(2);
                if let Some(Who { side: Side::P2, .. }) = parse_who(who) {
                    let cond = arg(3);
                    let slot = self.opp_slot_for_ident(who);
                    let fainted = is_fainted_condition(cond);
                    let m = &mut self.opp[slot];
                    m.hp_frac = if fainted { 0.0 } else { parse_hp_fraction(cond) };
                    m.fainted = fainted;
                }
            }
            "move" => {
                let who = arg(2);
                if let Some(Who { side: Side::P2, .. }) = parse_who(who) {
                    let slot = self.opp_slot_for_ident(who);
                    self.opp[slot].reveal_move(arg(3));
                }
            }
            "-terastallize" => {
                let who = arg(2);
                if let Some(Who { side: Side::P2, .. }) = parse_who(who) {
                    let slot = self.opp_slot_for_ident(who);
                    let m = &mut self.opp[slot];
                    m.terastallized = true;
                    m.tera_type = arg(3).trim().to_string();
                }
            }
            "-boost" | "-unboost" => {
                let who = arg(2);
                if let Some(Who { side: Side::P2, .. }) = parse_who(who) {
                    let Some(k) = BOOST_KEYS.iter().position(|k| *k == arg(3).trim()) else {
                        return;
                    };
                    let Ok(amount) = arg(4).trim().parse::<f32>() else {
                        return;
                    };
                    let signed = if tag == "-boost" { amount } else { -amount };
                    let slot = self.opp_slot_for_ident(who);
                    let b = &mut self.opp[slot].boosts[k];
                    *b = (*b + signed).clamp(-6.0, 6.0);
                }
            }
            "-status" | "-curestatus" => {
                let who = arg(2);
                if let Some(Who { side: Side::P2, .. }) = parse_who(who) {
                    let slot = self.opp_slot_for_ident(who);
                    self.opp[slot].status_id = if tag == "-status" {
                        let key = arg(3).trim().to_lowercase();
                        STATUS_NAMES
                            .iter()
                            .position(|s| *s == key)
                            .map(|i| i as u32)
                            .unwrap_or(0)
                    } else {
                        0
                    };
                }
            }
            _ => {}
        }
    }

    fn on_switch(&mut self, who: &str, details: &str, cond: &str) {
        let Some(Who { side: Side::P2, pos }) = parse_who(who) else {
            return;
        };
        let slot = self.opp_slot_for_ident(who);
        let species = species_from_details(details);
        let fainted = is_fainted_condition(cond);
        {
            let m = &mut self.opp[slot];
            if !species.is_empty() {
                if m.species_name.is_empty() {
                    m.species_name = species.clone();
                }
                if m.species_id == 0 {
                    m.species_id = species_id(&species);
                }
            }
            m.hp_frac = if fainted { 0.0 } else { parse_hp_fraction(cond) };
            m.fainted = fainted;
        }

        // Only the occupant of this position is replaced; the partner
        // position stays active.
        if let Some(pos) = pos {
            for (p, occupant) in self.opp_active_by_pos.iter_mut().enumerate() {
                if p != pos && *occupant == Some(slot) {
                    *occupant = None;
                }
            }
            if let Some(prev) = self.opp_active_by_pos[pos] {
                if prev < TEAM_SIZE {
                    self.opp[prev].active = false;
                }
            }
            self.opp_active_by_pos[pos] = Some(slot);
            self.opp[slot].active = !fainted;
        }
    }

    /// Roster slot for an opponent, keyed by side and name so the same
    /// combatant keeps its slot in either position.
    fn opp_slot_for_ident(&mut self, who: &str) -> usize {
        let key = identity_key(who);
        if let Some(&slot) = self.opp_slot_by_ident.get(&key) {
            return slot;
        }
        // Identities past the sixth share the last slot.
        let slot = self.next_opp_slot.min(TEAM_SIZE - 1);
        if self.next_opp_slot < TEAM_SIZE {
            self.next_opp_slot += 1;
        }
        self.opp_slot_by_ident.insert(key, slot);
        slot
    }

    pub fn record_my_actions(&mut self, a_left: usize, a_right: usize) {
        rotate_push(&mut self.last_actions_my, [a_left, a_right], HISTORY_K);
    }

    pub fn record_opp_actions(&mut self, a_left: usize, a_right: usize) {
        rotate_push(&mut self.last_actions_opp, [a_left, a_right], HISTORY_K);
    }

    fn current_snapshot(&self) -> [HpSnapshot; TEAM_SIZE * 2] {
        let mut snap = [HpSnapshot::default(); TEAM_SIZE * 2];
        for (i, m) in self.my.iter().chain(self.opp.iter()).enumerate() {
            snap[i] = m.hp_snapshot();
        }
        snap
    }

    /// Shaping reward since the previous call; resets the baseline.
    ///
    /// Must be called exactly once per own-side decision, before the next
    /// action is chosen, so the reward lands on the step that caused it.
    pub fn consume_shaping_reward(&mut self) -> ShapingReward {
        let cur = self.current_snapshot();

        let mut d_my_hp = 0.0f64;
        let mut d_opp_hp = 0.0f64;
        let mut d_my_fainted = 0i32;
        let mut d_opp_fainted = 0i32;

        for (i, (prev, now)) in self.prev_snapshot.iter().zip(cur.iter()).enumerate() {
            let mine = i < TEAM_SIZE;
            if prev.fainted != now.fainted {
                let d = if now.fainted { 1 } else { -1 };
                if mine {
                    d_my_fainted += d;
                } else {
                    d_opp_fainted += d;
                }
            }
            if prev.known && now.known {
                let d = (now.hp - prev.hp) as f64;
                if mine {
                    d_my_hp += d;
                } else {
                    d_opp_hp += d;
                }
            }
        }

        self.prev_snapshot = cur;

        let faint_delta = d_opp_fainted - d_my_fainted;
        let hp_diff = d_opp_hp - d_my_hp;
        let reward = FAINT_WEIGHT * faint_delta as f64 + HP_WEIGHT * hp_diff;

        rotate_push(&mut self.last_damage, [d_my_hp, d_opp_hp], HISTORY_K);

        ShapingReward {
            reward,
            hp_delta_my: d_my_hp,
            hp_delta_opp: d_opp_hp,
            faint_delta,
        }
    }

    /// Recent history, shaped for diagnostic dumps.
    pub fn history_json(&self) -> serde_json::Value {
        serde_json::json!({
            "last_actions_my": self.last_actions_my,
            "last_actions_opp": self.last_actions_opp,
            "last_damage": self.last_damage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::request::ReceivedRequest;
    use serde_json::json;

    fn p1_request(cond_a: &str, cond_b: &str) -> DecisionRequest {
        ReceivedRequest::from_value(json!({
            "active": [{"moves": [{"move": "Tackle", "id": "tackle", "target": "normal"}],
                        "boosts": {"atk": 1, "spe": -1}}],
            "side": {"pokemon": [
                {"ident": "p1: A", "details": "Alpha, L50", "condition": cond_a, "active": true,
                 "moves": ["tackle", "protect"], "item": "Leftovers", "baseAbility": "intimidate",
                 "teraType": "Fire"},
                {"ident": "p1: B", "details": "Beta, L50", "condition": cond_b, "active": false,
                 "moves": ["spore"]}
            ]}
        }))
        .unwrap()
        .request
    }

    #[test]
    fn test_update_from_request_fills_own_side() {
        let mut t = BattleStateTracker::new();
        t.update_from_request(Side::P1, &p1_request("50/100 par", "100/100"));
        let a = &t.my[0];
        assert!(a.active);
        assert!((a.hp_frac - 0.5).abs() < 1e-6);
        assert_eq!(a.status_id, 2);
        assert_eq!(a.species_id, species_id("Alpha"));
        assert_eq!(a.revealed_moves[0], move_id("tackle"));
        assert_eq!(a.revealed_moves[2], 0);
        assert_eq!(a.boosts[0], 1.0);
        assert_eq!(a.boosts[4], -1.0);
        assert_eq!(a.item, "Leftovers");
        assert_eq!(a.ability, "intimidate");
        assert!(!t.my[1].active);
        assert_eq!(t.my[2].hp_frac, -1.0, "unfilled slots stay unknown");
    }

    #[test]
    fn test_p2_requests_are_ignored() {
        let mut t = BattleStateTracker::new();
        t.update_from_request(Side::P2, &p1_request("50/100", "100/100"));
        assert_eq!(t.my[0].hp_frac, -1.0);
        assert_eq!(t.my[0].species_id, 0);
    }

    #[test]
    fn test_turn_decays_field_counters() {
        let mut t = BattleStateTracker::new();
        t.ingest_spectator_line("|-fieldstart|move: Trick Room|[of] p2a: Foo");
        t.ingest_spectator_line("|-sidestart|p1: Alice|move: Tailwind");
        t.ingest_spectator_line("|-sidestart|p2: Bob|Reflect");
        assert_eq!(t.field.trick_room_turns, 5);
        assert_eq!(t.field.tailwind_my, 4);
        assert_eq!(t.field.reflect_opp, 5);
        t.ingest_spectator_line("|turn|2");
        assert_eq!(t.field.turn, 2);
        assert_eq!(t.field.trick_room_turns, 4);
        assert_eq!(t.field.tailwind_my, 3);
        t.ingest_spectator_line("|-sideend|p1: Alice|move: Tailwind");
        assert_eq!(t.field.tailwind_my, 0);
        for n in 3..20 {
            t.ingest_spectator_line(&format!("|turn|{n}"));
        }
        assert_eq!(t.field.trick_room_turns, 0, "counters floor at zero");
    }

    #[test]
    fn test_weather_and_terrain() {
        let mut t = BattleStateTracker::new();
        t.ingest_spectator_line("|-weather|RainDance");
        assert_eq!(t.field.weather_id, weather_id("RainDance"));
        t.ingest_spectator_line("|-weather|none");
        assert_eq!(t.field.weather_id, 0);
        t.ingest_spectator_line("|-fieldstart|move: Electric Terrain");
        assert_eq!(t.field.terrain_id, terrain_id("move: Electric Terrain"));
        t.ingest_spectator_line("|-fieldend|move: Electric Terrain");
        assert_eq!(t.field.terrain_id, 0);
    }

    #[test]
    fn test_opponent_reveals() {
        let mut t = BattleStateTracker::new();
        t.ingest_spectator_line("|switch|p2a: Foo|Foo, L50|100/100");
        t.ingest_spectator_line("|switch|p2b: Bar|Bar, L50, F|80/100");
        assert_eq!(t.opp_alive_active_count(), 2);
        assert_eq!(t.opp[0].species_id, species_id("Foo"));
        assert!((t.opp[1].hp_frac - 0.8).abs() < 1e-6);

        t.ingest_spectator_line("|move|p2a: Foo|Rock Slide|p1a: A|[spread] p1a,p1b");
        t.ingest_spectator_line("|move|p2a: Foo|Rock Slide|p1a: A");
        t.ingest_spectator_line("|move|p2a: Foo|Protect|p2a: Foo");
        assert_eq!(t.opp[0].revealed_moves[0], move_id("Rock Slide"));
        assert_eq!(t.opp[0].revealed_moves[1], move_id("Protect"));
        assert_eq!(t.opp[0].revealed_moves[2], 0, "duplicate reveals are ignored");

        t.ingest_spectator_line("|-damage|p2b: Bar|10/100");
        assert!((t.opp[1].hp_frac - 0.1).abs() < 1e-6);
        t.ingest_spectator_line("|faint|p2b: Bar");
        assert!(t.opp[1].fainted);
        assert!(!t.opp[1].active);
        assert_eq!(t.opp_alive_active_count(), 1);

        t.ingest_spectator_line("|switch|p2b: Baz|Baz, L50|100/100");
        assert_eq!(t.opp[2].species_id, species_id("Baz"));
        assert!(t.opp[0].active, "partner position stays active");
        assert_eq!(t.opp_alive_active_count(), 2);
    }

    #[test]
    fn test_own_side_events_do_not_touch_opponent() {
        let mut t = BattleStateTracker::new();
        t.ingest_spectator_line("|switch|p1a: Mine|Mine, L50|100/100");
        t.ingest_spectator_line("|faint|p1a: Mine");
        assert!(t.opp.iter().all(|m| m.species_id == 0 && !m.fainted));
    }

    #[test]
    fn test_opponent_boosts_and_tera() {
        let mut t = BattleStateTracker::new();
        t.ingest_spectator_line("|switch|p2a: Foo|Foo, L50|100/100");
        t.ingest_spectator_line("|-boost|p2a: Foo|atk|2");
        t.ingest_spectator_line("|-unboost|p2a: Foo|spe|1");
        t.ingest_spectator_line("|-terastallize|p2a: Foo|Water");
        t.ingest_spectator_line("|-status|p2a: Foo|brn");
        assert_eq!(t.opp[0].boosts[0], 2.0);
        assert_eq!(t.opp[0].boosts[4], -1.0);
        assert!(t.opp[0].terastallized);
        assert_eq!(t.opp[0].tera_type, "Water");
        assert_eq!(t.opp[0].status_id, 1);
        t.ingest_spectator_line("|-curestatus|p2a: Foo|brn");
        assert_eq!(t.opp[0].status_id, 0);
    }

    #[test]
    fn test_shaping_reward_zero_without_changes() {
        let mut t = BattleStateTracker::new();
        t.update_from_request(Side::P1, &p1_request("50/100", "100/100"));
        t.ingest_spectator_line("|switch|p2a: Foo|Foo, L50|100/100");
        let _ = t.consume_shaping_reward();
        t.ingest_spectator_line("|turn|3");
        let r = t.consume_shaping_reward();
        assert_eq!(r.reward, 0.0, "no HP/faint change must give exactly zero");
        assert_eq!(r.faint_delta, 0);
    }

    #[test]
    fn test_shaping_reward_signs() {
        let mut t = BattleStateTracker::new();
        t.update_from_request(Side::P1, &p1_request("100/100", "100/100"));
        t.ingest_spectator_line("|switch|p2a: Foo|Foo, L50|100/100");
        t.consume_shaping_reward();

        // Opponent loses half, we lose a quarter.
        t.ingest_spectator_line("|-damage|p2a: Foo|50/100");
        t.update_from_request(Side::P1, &p1_request("75/100", "100/100"));
        let r = t.consume_shaping_reward();
        assert!((r.reward - 0.1 * (-0.5 - -0.25)).abs() < 1e-6, "got {}", r.reward);

        // Opponent faints.
        t.ingest_spectator_line("|faint|p2a: Foo");
        let r = t.consume_shaping_reward();
        assert_eq!(r.faint_delta, 1);
        assert!((r.reward - (1.0 + 0.1 * -0.5)).abs() < 1e-6, "got {}", r.reward);
        assert_eq!(t.last_damage.len(), HISTORY_K);
        assert_eq!(t.last_damage[HISTORY_K - 1], [0.0, -0.5]);
    }

    #[test]
    fn test_history_initialised_with_default_action() {
        let mut t = BattleStateTracker::new();
        assert_eq!(t.last_actions_my, vec![[DEFAULT_ACTION_ID; 2]; HISTORY_K]);
        t.record_my_actions(3, 29);
        assert_eq!(t.last_actions_my.len(), HISTORY_K);
        assert_eq!(t.last_actions_my[HISTORY_K - 1], [3, 29]);
    }

    #[test]
    fn test_opponent_keeps_slot_across_positions() {
        let mut t = BattleStateTracker::new();
        t.ingest_spectator_line("|switch|p2a: Incineroar|Incineroar, L50, M|100/100");
        t.ingest_spectator_line("|switch|p2b: Rillaboom|Rillaboom, L50, M|100/100");
        t.ingest_spectator_line("|-damage|p2a: Incineroar|40/100");
        t.ingest_spectator_line("|switch|p2a: Amoonguss|Amoonguss, L50, F|100/100");
        t.ingest_spectator_line("|switch|p2b: Incineroar|Incineroar, L50, M|40/100");

        let occupied: Vec<&str> = t
            .opp
            .iter()
            .filter(|m| m.species_id != 0)
            .map(|m| m.species_name.as_str())
            .collect();
        assert_eq!(occupied, vec!["Incineroar", "Rillaboom", "Amoonguss"]);
        assert!(t.opp[0].active);
        assert!(!t.opp[1].active, "Rillaboom was replaced in position b");
        assert!((t.opp[0].hp_frac - 0.4).abs() < 1e-6);
        assert_eq!(t.opp_alive_active_count(), 2);

        t.ingest_spectator_line("|-damage|p2b: Incineroar|10/100");
        assert!((t.opp[0].hp_frac - 0.1).abs() < 1e-6, "damage lands on the original slot");
    }

    #[test]
    fn test_opponent_slots_cap_at_six() {
        let mut t = BattleStateTracker::new();
        for i in 0..8 {
            t.ingest_spectator_line(&format!("|switch|p2a: Mon{i}|Mon{i}, L50|100/100"));
        }
        assert_eq!(t.opp[5].species_id, species_id("Mon5"), "last slot keeps first occupant");
    }
}
