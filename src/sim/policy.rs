//! Non-RL choice policies: the seeded random fallback, the local heuristic
//! scorer and the remote `/choose` service.
//!
//! All outputs are raw choice strings; the driver normalizes them against the
//! request before sending.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, warn};

use crate::sim::choice::{is_ally_target_type, move_target_arg};
use crate::sim::request::{ActiveOptions, DecisionRequest};
use crate::vocab::parse_hp_fraction;

pub const REMOTE_CHOOSE_TIMEOUT: Duration = Duration::from_millis(1500);

/// How one side picks its choices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMode {
    Fallback,
    Local,
    Remote,
    /// The learner, acting through the learning service.
    Ppo,
    /// An opponent sampled from the snapshot league (p2 only).
    League,
}

impl PolicyMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PolicyMode::Fallback => "fallback",
            PolicyMode::Local => "local",
            PolicyMode::Remote => "remote",
            PolicyMode::Ppo => "ppo",
            PolicyMode::League => "league",
        }
    }

    pub fn is_rl(self) -> bool {
        matches!(self, PolicyMode::Ppo | PolicyMode::League)
    }
}

impl fmt::Display for PolicyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fallback" | "random" => Ok(PolicyMode::Fallback),
            "local" | "battle_policy" | "heuristic" => Ok(PolicyMode::Local),
            "remote" | "python" => Ok(PolicyMode::Remote),
            "ppo" | "rl" | "learner" => Ok(PolicyMode::Ppo),
            "league" => Ok(PolicyMode::League),
            other => Err(format!("unknown policy mode '{other}'")),
        }
    }
}

/// Where a sent choice came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChoiceSource {
    Remote,
    RemoteError,
    Fallback,
    Local,
    Ppo,
    /// Rewritten after an invalid-choice rejection.
    Repair,
}

impl ChoiceSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ChoiceSource::Remote => "remote",
            ChoiceSource::RemoteError => "remote_error",
            ChoiceSource::Fallback => "fallback",
            ChoiceSource::Local => "local",
            ChoiceSource::Ppo => "ppo",
            ChoiceSource::Repair => "repair",
        }
    }
}

// ---------------------------------------------------------------------------
// LCG
// ---------------------------------------------------------------------------

/// `state = 1664525 * state + 1013904223 (mod 2^32)`, seeded with `seed || 1`.
#[derive(Debug, Clone)]
pub struct Lcg {
    state: u32,
}

impl Lcg {
    pub fn new(seed: u32) -> Self {
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    pub fn next_u32(&mut self) -> u32 {
        self.state = self.state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        self.state
    }

    /// Float in [0, 1].
    pub fn next_float(&mut self) -> f64 {
        self.next_u32() as f64 / u32::MAX as f64
    }

    /// `floor(next_float() * n)`, clamped into range.
    pub fn pick_index(&mut self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        ((self.next_float() * n as f64).floor() as usize).min(n - 1)
    }

    pub fn int_exclusive(&mut self, max: usize) -> usize {
        if max == 0 {
            return 0;
        }
        self.next_u32() as usize % max
    }
}

// ---------------------------------------------------------------------------
// Random fallback
// ---------------------------------------------------------------------------

/// Deterministic random legal-ish choice for `req`.
pub fn random_choice(req: &DecisionRequest, seed: u32) -> String {
    let mut rng = Lcg::new(seed);
    let has_partner = req.has_partner();

    if req.team_preview {
        let mut order: Vec<usize> = (1..=req.side_pokemon().len()).collect();
        for i in (1..order.len()).rev() {
            let j = rng.pick_index(i + 1);
            order.swap(i, j);
        }
        let joined: String = order.iter().map(|n| n.to_string()).collect();
        return format!("team {joined}");
    }

    let can_switch = req.can_switch_now();
    let switch_slots = req.legal_switch_slots();

    if req.force_switch.is_some() {
        let mut available = switch_slots.clone();
        let mut choices = Vec::new();
        for &forced in req.force_switch_flags() {
            if !forced {
                continue;
            }
            if can_switch && !available.is_empty() {
                let idx = rng.pick_index(available.len());
                choices.push(format!("switch {}", available.remove(idx)));
            } else {
                choices.push("pass".to_string());
            }
        }
        if !choices.is_empty() {
            return choices.join(", ");
        }
    }

    let pick_for_active = |active: Option<&ActiveOptions>, active_index: usize, rng: &mut Lcg| -> String {
        let moves: Vec<(usize, Option<&str>)> = active
            .map(|a| {
                a.moves
                    .iter()
                    .enumerate()
                    .filter(|(_, m)| !m.disabled)
                    .filter(|(_, m)| has_partner || !m.target_type().map(is_ally_target_type).unwrap_or(false))
                    .map(|(i, m)| (i + 1, m.target_type()))
                    .collect()
            })
            .unwrap_or_default();
        if !moves.is_empty() {
            let (slot, target) = moves[rng.pick_index(moves.len())];
            return format!("move {slot}{}", move_target_arg(target, active_index, has_partner));
        }
        if can_switch && !switch_slots.is_empty() {
            return format!("switch {}", switch_slots[rng.pick_index(switch_slots.len())]);
        }
        "default".to_string()
    };

    let slots = req.active_slots();
    if slots.len() <= 1 {
        return pick_for_active(req.active_at(0), 0, &mut rng);
    }

    let alive = req.alive_active_count();
    let expected = if alive > 0 { alive } else { slots.len() };
    let mut choices = Vec::new();
    for (i, slot) in slots.iter().enumerate() {
        let Some(active) = slot.as_ref() else {
            continue;
        };
        choices.push(pick_for_active(Some(active), i, &mut rng));
        if choices.len() >= expected {
            break;
        }
    }
    while choices.len() < expected {
        choices.push("default".to_string());
    }
    choices.join(", ")
}

// ---------------------------------------------------------------------------
// Local heuristic
// ---------------------------------------------------------------------------

const LOCAL_NO_TARGET_MOVES: [&str; 15] = [
    "protect",
    "detect",
    "spikyshield",
    "kingsshield",
    "banefulbunker",
    "silktrap",
    "obstruct",
    "endure",
    "wideguard",
    "quickguard",
    "craftyshield",
    "matblock",
    "tailwind",
    "followme",
    "ragepowder",
];

/// Fixed move scores; anything unlisted scores 10.
pub fn score_move(id: &str, turn: u32, hp_frac: f32) -> u32 {
    match id.to_lowercase().as_str() {
        "fakeout" if turn <= 1 => 100,
        "fakeout" => 5,
        "spore" => 80,
        "ragepowder" | "followme" => 70,
        "tailwind" if turn <= 2 => 60,
        "tailwind" => 20,
        "protect" | "detect" | "spikyshield" | "kingsshield" if hp_frac < 0.35 => 65,
        "protect" | "detect" | "spikyshield" | "kingsshield" => 5,
        "icywind" | "makeitrain" => 45,
        "rockslide" | "bleakwindstorm" => 40,
        _ => 10,
    }
}

/// Target suffix used by the heuristic; unknown types take no target.
fn local_target_arg(target: &str, active_index: usize, has_partner: bool) -> &'static str {
    match target {
        "normal" | "adjacentFoe" | "any" | "anyAdjacentFoe" | "randomNormal" => " 1",
        "adjacentAlly" | "ally" | "adjacentAllyOrSelf" => {
            if !has_partner {
                ""
            } else if active_index == 0 {
                " -2"
            } else {
                " -1"
            }
        }
        _ => "",
    }
}

#[derive(Debug, Clone)]
pub struct LocalDecision {
    pub choice: String,
    pub debug: JsonValue,
}

/// Heuristic scorer: best-scoring usable move per active, ties by slot.
pub fn local_choice(req: &DecisionRequest, seed: u32, turn: u32) -> LocalDecision {
    let mut rng = Lcg::new(seed);

    if req.team_preview {
        let order: String = (1..=req.side_pokemon().len()).map(|n| n.to_string()).collect();
        return LocalDecision {
            choice: format!("team {order}"),
            debug: json!({"mode": "teamPreview", "picked": {"order": order}}),
        };
    }

    if req.force_switch.is_some() {
        let mut available = req.legal_switch_slots();
        let mut parts = Vec::new();
        for &forced in req.force_switch_flags() {
            if !forced {
                continue;
            }
            if available.is_empty() {
                parts.push("pass".to_string());
            } else {
                let j = rng.int_exclusive(available.len());
                parts.push(format!("switch {}", available.remove(j)));
            }
        }
        return LocalDecision {
            choice: parts.join(", "),
            debug: json!({"mode": "forceSwitch", "picked": {"parts": parts}}),
        };
    }

    let hp_fracs: Vec<f32> = req
        .actives_from_side()
        .iter()
        .map(|p| parse_hp_fraction(&p.condition))
        .collect();
    let alive = req.alive_active_count();
    let has_partner = alive >= 2;
    let actives = req.actionable_actives();
    let expected = if alive > 0 { alive } else { actives.len() };

    let mut choices = Vec::new();
    let mut picked = Vec::new();
    for (i, active) in actives.iter().enumerate() {
        let hp = hp_fracs.get(i).copied().unwrap_or(1.0);
        let best = active
            .moves
            .iter()
            .enumerate()
            .filter(|(_, m)| !m.disabled && !m.id.is_empty())
            .filter(|(_, m)| has_partner || !m.target_type().map(is_ally_target_type).unwrap_or(false))
            .map(|(j, m)| (j + 1, m, score_move(&m.id, turn, hp)))
            // Highest score wins; on ties the lower slot.
            .max_by(|a, b| a.2.cmp(&b.2).then_with(|| b.0.cmp(&a.0)));

        if let Some((slot, m, score)) = best {
            let id = m.id_lower();
            let target_arg = match m.target_type() {
                Some(t) if !LOCAL_NO_TARGET_MOVES.contains(&id.as_str()) => local_target_arg(t, i, has_partner),
                _ => "",
            };
            choices.push(format!("move {slot}{target_arg}"));
            picked.push(json!({"kind": "move", "slot": slot, "id": m.id, "score": score}));
            continue;
        }

        let switches = req.legal_switch_slots();
        if !switches.is_empty() {
            let slot = switches[rng.int_exclusive(switches.len())];
            choices.push(format!("switch {slot}"));
            picked.push(json!({"kind": "switch", "slot": slot}));
            continue;
        }
        choices.push("default".to_string());
        picked.push(json!({"kind": "default"}));
    }
    choices.truncate(expected);
    picked.truncate(expected);

    LocalDecision {
        choice: choices.join(", "),
        debug: json!({"mode": "regular", "candidates": {"actives": actives.len()}, "picked": picked}),
    }
}

// ---------------------------------------------------------------------------
// Remote
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChooseRequest<'a> {
    request: &'a JsonValue,
    format: &'a str,
    turn: u32,
    policy: &'a str,
    seed: u32,
}

#[derive(Debug, Default, Deserialize)]
struct ChooseResponse {
    #[serde(default)]
    choice: Option<String>,
}

/// Client for an external `/choose` policy service.
#[derive(Debug, Clone)]
pub struct RemotePolicy {
    base_url: String,
    policy: String,
    http: reqwest::Client,
}

impl RemotePolicy {
    pub fn new(base_url: impl Into<String>, policy: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            policy: policy.into(),
            http: reqwest::Client::new(),
        }
    }

    pub fn label(&self) -> String {
        format!("remote:{}", self.policy)
    }

    async fn post_choose(&self, raw_request: &JsonValue, format: &str, turn: u32, seed: u32) -> anyhow::Result<String> {
        let url = format!("{}/choose", self.base_url);
        let body = ChooseRequest {
            request: raw_request,
            format,
            turn,
            policy: &self.policy,
            seed,
        };
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .timeout(REMOTE_CHOOSE_TIMEOUT)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("HTTP {}", status.as_u16());
        }
        let parsed: ChooseResponse = resp.json().await?;
        Ok(parsed.choice.unwrap_or_default().trim().to_string())
    }

    /// Ask the service; on error or an empty answer use the random fallback.
    pub async fn choose(
        &self,
        raw_request: &JsonValue,
        req: &DecisionRequest,
        format: &str,
        turn: u32,
        seed: u32,
    ) -> (String, ChoiceSource) {
        match self.post_choose(raw_request, format, turn, seed).await {
            Ok(choice) if !choice.is_empty() => (choice, ChoiceSource::Remote),
            Ok(_) => {
                debug!(turn, "remote policy returned an empty choice; using fallback");
                (random_choice(req, seed), ChoiceSource::Fallback)
            }
            Err(err) => {
                warn!(url = %self.base_url, error = %err, "remote policy failed; using fallback");
                (random_choice(req, seed), ChoiceSource::RemoteError)
            }
        }
    }
}
