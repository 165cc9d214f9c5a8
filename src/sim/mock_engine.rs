//! In-process scripted simulator for tests.
//!
//! Plays a reduced doubles battle over the same message framing as the real
//! simulator: team preview, move turns with seeded damage rolls, forced
//! switches after faints and a win line once one side has nothing left.
//! Choice validation is strict about part counts, slots and duplicate
//! switches so protocol mistakes surface as `|error|` lines.

use std::collections::VecDeque;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::{json, Value as JsonValue};

use crate::rl::learner_client::BoxFuture;
use crate::rl::state_tracker::Side;
use crate::sim::engine::{BattleEngine, EngineMessage};

const ACTIVE_SLOTS: usize = 2;
const LEVEL: u32 = 50;

#[derive(Debug, Clone, PartialEq)]
pub struct ScriptedMove {
    pub name: String,
    pub id: String,
    pub target: Option<String>,
}

impl ScriptedMove {
    pub fn new(name: &str, target: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            id: crate::vocab::to_id(name),
            target: target.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScriptConfig {
    pub team_size: usize,
    pub p1_moves: Vec<ScriptedMove>,
    pub p2_moves: Vec<ScriptedMove>,
    /// Inclusive damage range dealt by each side's attacks, in HP out of 100.
    pub p1_damage: (u32, u32),
    pub p2_damage: (u32, u32),
    /// Reject this many p1 choices with a "needs a target" error.
    pub reject_p1_choices: usize,
    /// Never answer after the players register.
    pub stall_after_start: bool,
    pub max_turns: u32,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            team_size: 4,
            // No target metadata on the request entry.
            p1_moves: vec![ScriptedMove::new("Aura Sphere", None)],
            p2_moves: vec![ScriptedMove::new("Tackle", Some("normal"))],
            p1_damage: (55, 100),
            p2_damage: (1, 5),
            reject_p1_choices: 0,
            stall_after_start: false,
            max_turns: 60,
        }
    }
}

#[derive(Debug, Clone)]
struct Mon {
    name: String,
    hp: u32,
}

impl Mon {
    fn fainted(&self) -> bool {
        self.hp == 0
    }

    fn condition(&self) -> String {
        if self.fainted() {
            "0 fnt".to_string()
        } else {
            format!("{}/100", self.hp)
        }
    }

    fn details(&self) -> String {
        format!("{}, L{LEVEL}", self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Setup,
    TeamPreview,
    Moves,
    ForceSwitch,
    Ended,
}

#[derive(Debug, Default)]
struct SideState {
    name: String,
    roster: Vec<Mon>,
    registered: bool,
    choice: Option<String>,
    forced: [bool; ACTIVE_SLOTS],
}

impl SideState {
    fn alive_active_positions(&self) -> Vec<usize> {
        (0..ACTIVE_SLOTS.min(self.roster.len()))
            .filter(|&i| !self.roster[i].fainted())
            .collect()
    }

    fn bench_slots(&self) -> Vec<usize> {
        (ACTIVE_SLOTS..self.roster.len())
            .filter(|&i| !self.roster[i].fainted())
            .collect()
    }

    fn all_fainted(&self) -> bool {
        self.roster.iter().all(Mon::fainted)
    }

    fn needs_choice(&self, stage: Stage) -> bool {
        match stage {
            Stage::TeamPreview | Stage::Moves => true,
            Stage::ForceSwitch => self.forced.iter().any(|f| *f),
            Stage::Setup | Stage::Ended => false,
        }
    }
}

/// Scripted [`BattleEngine`].
pub struct ScriptedEngine {
    config: ScriptConfig,
    rng: ChaCha8Rng,
    stage: Stage,
    turn: u32,
    rqid: u64,
    sides: [SideState; 2],
    rejections_left: usize,
    outbox: VecDeque<String>,
    sent: Vec<String>,
    errors_sent: usize,
}

fn idx(side: Side) -> usize {
    match side {
        Side::P1 => 0,
        Side::P2 => 1,
    }
}

fn pos_letter(pos: usize) -> char {
    if pos == 0 {
        'a'
    } else {
        'b'
    }
}

impl ScriptedEngine {
    pub fn new(config: ScriptConfig) -> Self {
        let rejections_left = config.reject_p1_choices;
        Self {
            config,
            rng: ChaCha8Rng::seed_from_u64(0),
            stage: Stage::Setup,
            turn: 0,
            rqid: 0,
            sides: [SideState::default(), SideState::default()],
            rejections_left,
            outbox: VecDeque::new(),
            sent: Vec::new(),
            errors_sent: 0,
        }
    }

    /// Every command line received, in order.
    pub fn sent_commands(&self) -> &[String] {
        &self.sent
    }

    pub fn errors_sent(&self) -> usize {
        self.errors_sent
    }

    fn moves_for(&self, side: Side) -> &[ScriptedMove] {
        match side {
            Side::P1 => &self.config.p1_moves,
            Side::P2 => &self.config.p2_moves,
        }
    }

    fn ident(&self, side: Side, pos: usize) -> String {
        let mon = &self.sides[idx(side)].roster[pos];
        format!("{}{}: {}", side.as_str(), pos_letter(pos), mon.name)
    }

    fn switch_line(&self, side: Side, pos: usize) -> String {
        let mon = &self.sides[idx(side)].roster[pos];
        format!("|switch|{}|{}|{}", self.ident(side, pos), mon.details(), mon.condition())
    }

    fn push_update(&mut self, lines: &[String]) {
        if !lines.is_empty() {
            self.outbox.push_back(format!("update\n{}", lines.join("\n")));
        }
    }

    fn push_side(&mut self, side: Side, line: String) {
        self.outbox
            .push_back(format!("sideupdate\n{}\n{}", side.as_str(), line));
    }

    fn push_error(&mut self, side: Side, message: &str) {
        self.errors_sent += 1;
        self.push_side(side, format!("|error|{message}"));
    }

    fn side_json(&self, side: Side) -> JsonValue {
        let s = &self.sides[idx(side)];
        let move_ids: Vec<String> = self.moves_for(side).iter().map(|m| m.id.clone()).collect();
        let pokemon: Vec<JsonValue> = s
            .roster
            .iter()
            .enumerate()
            .map(|(i, m)| {
                json!({
                    "ident": format!("{}: {}", side.as_str(), m.name),
                    "details": m.details(),
                    "condition": m.condition(),
                    "active": i < ACTIVE_SLOTS,
                    "moves": move_ids,
                    "item": "",
                    "ability": "",
                    "teraType": "Normal",
                })
            })
            .collect();
        json!({"name": s.name, "id": side.as_str(), "pokemon": pokemon})
    }

    fn request_json(&mut self, side: Side) -> JsonValue {
        self.rqid += 1;
        let s = &self.sides[idx(side)];
        let mut req = match self.stage {
            Stage::TeamPreview => json!({"teamPreview": true, "maxChosenTeamSize": self.config.team_size}),
            Stage::ForceSwitch if s.forced.iter().any(|f| *f) => json!({"forceSwitch": s.forced}),
            Stage::Moves => {
                let moves: Vec<JsonValue> = self
                    .moves_for(side)
                    .iter()
                    .map(|m| {
                        let mut v = json!({"move": m.name, "id": m.id, "pp": 16, "maxpp": 16, "disabled": false});
                        if let Some(t) = &m.target {
                            v["target"] = json!(t);
                        }
                        v
                    })
                    .collect();
                let active: Vec<JsonValue> = (0..ACTIVE_SLOTS.min(s.roster.len()))
                    .map(|i| {
                        if s.roster[i].fainted() {
                            JsonValue::Null
                        } else {
                            json!({"moves": moves})
                        }
                    })
                    .collect();
                json!({"active": active, "canSwitch": !s.bench_slots().is_empty()})
            }
            _ => json!({"wait": true}),
        };
        req["side"] = self.side_json(side);
        req["rqid"] = json!(self.rqid);
        req
    }

    fn send_requests(&mut self) {
        for side in [Side::P1, Side::P2] {
            let req = self.request_json(side);
            self.push_side(side, format!("|request|{req}"));
        }
    }

    fn register_player(&mut self, side: Side, payload: &str) {
        let v: JsonValue = serde_json::from_str(payload).unwrap_or(JsonValue::Null);
        let name = v["name"].as_str().unwrap_or(side.as_str()).to_string();
        let team = v["team"].as_str().unwrap_or("");
        let mut names: Vec<String> = team
            .split(']')
            .filter_map(|entry| entry.split('|').next())
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .collect();
        names.truncate(self.config.team_size);
        while names.len() < self.config.team_size {
            names.push(format!("{}Mon{}", side.as_str().to_uppercase(), names.len() + 1));
        }
        let s = &mut self.sides[idx(side)];
        s.name = name;
        s.roster = names.into_iter().map(|name| Mon { name, hp: 100 }).collect();
        s.registered = true;

        if self.sides.iter().all(|s| s.registered) && !self.config.stall_after_start {
            self.stage = Stage::TeamPreview;
            self.send_requests();
            let lines = vec![
                format!("|player|p1|{}|", self.sides[0].name),
                format!("|player|p2|{}|", self.sides[1].name),
                "|gametype|doubles".to_string(),
                "|teampreview".to_string(),
            ];
            self.push_update(&lines);
        }
    }

    fn handle_choice(&mut self, side: Side, choice: &str) {
        if !self.sides[idx(side)].needs_choice(self.stage) || self.sides[idx(side)].choice.is_some() {
            self.push_error(side, "[Invalid choice] There's nothing to choose");
            return;
        }
        if let Err(msg) = self.validate(side, choice) {
            self.push_error(side, &msg);
            return;
        }
        self.sides[idx(side)].choice = Some(choice.to_string());

        let ready = self
            .sides
            .iter()
            .all(|s| !s.needs_choice(self.stage) || s.choice.is_some());
        if ready {
            match self.stage {
                Stage::TeamPreview => self.resolve_team_preview(),
                Stage::Moves => self.resolve_turn(),
                Stage::ForceSwitch => self.resolve_switches(),
                Stage::Setup | Stage::Ended => {}
            }
        }
    }

    fn validate(&mut self, side: Side, choice: &str) -> Result<(), String> {
        let parts: Vec<&str> = choice.split(',').map(str::trim).filter(|p| !p.is_empty()).collect();
        let s = &self.sides[idx(side)];
        match self.stage {
            Stage::TeamPreview => {
                if !choice.trim().starts_with("team ") {
                    return Err(format!("[Invalid choice] Can't {choice}: You must choose a team order"));
                }
                Ok(())
            }
            Stage::ForceSwitch => {
                let needed = s.forced.iter().filter(|f| **f).count();
                if parts.len() != needed {
                    return Err(format!("[Invalid choice] Can't make choices: expected {needed} parts"));
                }
                let bench = s.bench_slots();
                let mut used = Vec::new();
                for part in parts {
                    if part == "pass" {
                        continue;
                    }
                    let slot = part
                        .strip_prefix("switch ")
                        .and_then(|n| n.trim().parse::<usize>().ok())
                        .ok_or_else(|| format!("[Invalid choice] Can't {part}: you must switch"))?;
                    if !bench.contains(&(slot.wrapping_sub(1))) {
                        return Err(format!("[Invalid choice] Can't switch: slot {slot} cannot switch in"));
                    }
                    if used.contains(&slot) {
                        return Err(format!(
                            "[Invalid choice] Can't switch: The Pokémon in slot {slot} can only switch in once"
                        ));
                    }
                    used.push(slot);
                }
                Ok(())
            }
            Stage::Moves => {
                let needed = s.alive_active_positions().len();
                if parts.len() != needed {
                    return Err(format!(
                        "[Invalid choice] Can't make choices: expected {needed} parts, got {}",
                        parts.len()
                    ));
                }
                let move_count = self.moves_for(side).len();
                let first_move = self.moves_for(side).first().map(|m| m.name.clone()).unwrap_or_default();
                let bench = s.bench_slots();
                for part in &parts {
                    if *part == "default" {
                        continue;
                    }
                    if let Some(n) = part.strip_prefix("switch ") {
                        let slot = n.trim().parse::<usize>().unwrap_or(0);
                        if !bench.contains(&slot.wrapping_sub(1)) {
                            return Err(format!("[Invalid choice] Can't switch: slot {slot} cannot switch in"));
                        }
                        continue;
                    }
                    let mut tokens = part.split_whitespace();
                    let ok = tokens.next() == Some("move")
                        && tokens
                            .next()
                            .and_then(|n| n.parse::<usize>().ok())
                            .map(|n| n >= 1 && n <= move_count)
                            .unwrap_or(false);
                    if !ok {
                        return Err(format!("[Invalid choice] Can't {part}: unrecognized choice"));
                    }
                }
                if side == Side::P1 && self.rejections_left > 0 {
                    self.rejections_left -= 1;
                    return Err(format!("[Invalid choice] Can't move: {first_move} needs a target"));
                }
                Ok(())
            }
            Stage::Setup | Stage::Ended => Err("[Invalid choice] There's nothing to choose".to_string()),
        }
    }

    fn resolve_team_preview(&mut self) {
        for s in self.sides.iter_mut() {
            let choice = s.choice.take().unwrap_or_default();
            // Chosen slots first, then whatever the order left out.
            let mut order: Vec<usize> = choice
                .trim_start_matches("team ")
                .chars()
                .filter_map(|c| c.to_digit(10))
                .map(|d| d as usize)
                .filter(|d| *d >= 1 && *d <= s.roster.len())
                .map(|d| d - 1)
                .collect();
            order.extend(0..s.roster.len());
            let mut seen = vec![false; s.roster.len()];
            order.retain(|&i| !std::mem::replace(&mut seen[i], true));
            s.roster = order.into_iter().map(|i| s.roster[i].clone()).collect();
        }
        let mut lines = vec!["|start".to_string()];
        for side in [Side::P1, Side::P2] {
            for pos in 0..ACTIVE_SLOTS.min(self.sides[idx(side)].roster.len()) {
                lines.push(self.switch_line(side, pos));
            }
        }
        self.start_turn(lines);
    }

    fn start_turn(&mut self, mut lines: Vec<String>) {
        self.turn += 1;
        if self.turn > self.config.max_turns {
            lines.push("|tie".to_string());
            self.finish(lines, None);
            return;
        }
        lines.push(format!("|turn|{}", self.turn));
        self.stage = Stage::Moves;
        self.send_requests();
        self.push_update(&lines);
    }

    fn finish(&mut self, lines: Vec<String>, winner: Option<String>) {
        self.stage = Stage::Ended;
        self.push_update(&lines);
        self.outbox
            .push_back(format!("end\n{}", json!({"winner": winner, "turns": self.turn})));
    }

    fn pick_foe(&self, foe: Side, preferred: usize) -> Option<usize> {
        let alive = self.sides[idx(foe)].alive_active_positions();
        if alive.contains(&preferred) {
            Some(preferred)
        } else {
            alive.first().copied()
        }
    }

    fn resolve_turn(&mut self) {
        let mut lines = Vec::new();
        for side in [Side::P1, Side::P2] {
            let choice = self.sides[idx(side)].choice.take().unwrap_or_default();
            let parts: Vec<String> = choice.split(',').map(|p| p.trim().to_string()).collect();
            let positions = self.sides[idx(side)].alive_active_positions();
            for (part, pos) in parts.iter().zip(positions) {
                if self.sides[idx(side)].roster[pos].fainted() {
                    continue;
                }
                if let Some(n) = part.strip_prefix("switch ") {
                    let slot = n.trim().parse::<usize>().unwrap_or(0);
                    if slot >= 1 {
                        self.sides[idx(side)].roster.swap(pos, slot - 1);
                        lines.push(self.switch_line(side, pos));
                    }
                    continue;
                }
                let mut tokens = part.split_whitespace().skip(2);
                let preferred = tokens
                    .next()
                    .and_then(|t| t.parse::<i32>().ok())
                    .filter(|t| *t > 0)
                    .map(|t| (t - 1) as usize)
                    .unwrap_or(pos);
                let foe = side.other();
                let Some(target) = self.pick_foe(foe, preferred) else {
                    continue;
                };
                let (lo, hi) = match side {
                    Side::P1 => self.config.p1_damage,
                    Side::P2 => self.config.p2_damage,
                };
                let dmg = self.rng.gen_range(lo..=hi.max(lo));
                let move_name = self
                    .moves_for(side)
                    .first()
                    .map(|m| m.name.clone())
                    .unwrap_or_else(|| "Struggle".to_string());
                lines.push(format!(
                    "|move|{}|{}|{}",
                    self.ident(side, pos),
                    move_name,
                    self.ident(foe, target)
                ));
                let mon = &mut self.sides[idx(foe)].roster[target];
                mon.hp = mon.hp.saturating_sub(dmg);
                let condition = mon.condition();
                let fainted = mon.fainted();
                let foe_ident = self.ident(foe, target);
                lines.push(format!("|split|{}", foe.as_str()));
                lines.push(format!("|-damage|{foe_ident}|{condition}"));
                lines.push(format!("|-damage|{foe_ident}|{condition}"));
                if fainted {
                    lines.push(format!("|faint|{foe_ident}"));
                }
            }
        }

        let p1_out = self.sides[0].all_fainted();
        let p2_out = self.sides[1].all_fainted();
        if p1_out || p2_out {
            let winner = match (p1_out, p2_out) {
                (false, true) => Some(self.sides[0].name.clone()),
                (true, false) => Some(self.sides[1].name.clone()),
                _ => None,
            };
            match &winner {
                Some(w) => lines.push(format!("|win|{w}")),
                None => lines.push("|tie".to_string()),
            }
            self.finish(lines, winner);
            return;
        }

        let mut any_forced = false;
        for s in self.sides.iter_mut() {
            let mut bench = s.bench_slots().len();
            s.forced = [false; ACTIVE_SLOTS];
            for pos in 0..ACTIVE_SLOTS.min(s.roster.len()) {
                if s.roster[pos].fainted() && bench > 0 {
                    s.forced[pos] = true;
                    bench -= 1;
                    any_forced = true;
                }
            }
        }
        if any_forced {
            self.stage = Stage::ForceSwitch;
            self.push_update(&lines);
            self.send_requests();
        } else {
            self.start_turn(lines);
        }
    }

    fn resolve_switches(&mut self) {
        let mut lines = Vec::new();
        for side in [Side::P1, Side::P2] {
            let Some(choice) = self.sides[idx(side)].choice.take() else {
                continue;
            };
            let forced: Vec<usize> = (0..ACTIVE_SLOTS)
                .filter(|p| self.sides[idx(side)].forced[*p])
                .collect();
            for (part, pos) in choice.split(',').map(str::trim).zip(forced) {
                let Some(slot) = part.strip_prefix("switch ").and_then(|n| n.trim().parse::<usize>().ok()) else {
                    continue;
                };
                self.sides[idx(side)].roster.swap(pos, slot - 1);
                lines.push(self.switch_line(side, pos));
            }
            self.sides[idx(side)].forced = [false; ACTIVE_SLOTS];
        }
        self.start_turn(lines);
    }

    fn handle_line(&mut self, line: &str) {
        self.sent.push(line.to_string());
        let Some(body) = line.strip_prefix('>') else {
            return;
        };
        let (cmd, rest) = body.split_once(' ').unwrap_or((body, ""));
        match cmd {
            "start" => {
                let v: JsonValue = serde_json::from_str(rest).unwrap_or(JsonValue::Null);
                let seed = v["seed"]
                    .as_str()
                    .and_then(|s| s.split(',').next())
                    .and_then(|s| s.trim().parse::<u64>().ok())
                    .unwrap_or(0);
                self.rng = ChaCha8Rng::seed_from_u64(seed);
            }
            "player" => {
                let (who, payload) = rest.split_once(' ').unwrap_or((rest, "{}"));
                if let Some(side) = Side::parse(who) {
                    self.register_player(side, payload);
                }
            }
            other => {
                if let Some(side) = Side::parse(other) {
                    if self.stage != Stage::Ended {
                        self.handle_choice(side, rest.trim());
                    }
                }
            }
        }
    }
}

impl BattleEngine for ScriptedEngine {
    fn send(&mut self, line: String) -> BoxFuture<'_, anyhow::Result<()>> {
        self.handle_line(&line);
        Box::pin(async { Ok(()) })
    }

    fn next_message(&mut self) -> BoxFuture<'_, anyhow::Result<Option<EngineMessage>>> {
        while let Some(chunk) = self.outbox.pop_front() {
            if let Some(msg) = EngineMessage::parse(&chunk) {
                return Box::pin(async move { Ok(Some(msg)) });
            }
        }
        if self.stage == Stage::Ended {
            return Box::pin(async { Ok(None) });
        }
        Box::pin(std::future::pending())
    }
}
