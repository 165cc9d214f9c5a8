//! Typed view over the engine's `|request|` JSON.
//!
//! Every field is optional on the wire; missing fields deserialize to their
//! defaults so a partially-populated request never fails to parse. The raw
//! JSON is kept next to the typed form for diagnostic dumps.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::vocab::is_fainted_condition;

/// Accepts `true`, non-empty strings and non-zero numbers as true.
///
/// The engine reports `disabled` either as a bool or as the name of the
/// effect that disabled the move.
fn truthy<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Bool(b)) => b,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(Value::Number(n)) => n.as_f64().map(|x| x != 0.0).unwrap_or(false),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
        Some(Value::Null) | None => false,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MoveOption {
    #[serde(default, rename = "move")]
    pub name: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default, deserialize_with = "truthy")]
    pub disabled: bool,
    #[serde(default)]
    pub pp: Option<i64>,
}

impl MoveOption {
    pub fn id_lower(&self) -> String {
        self.id.to_lowercase()
    }

    pub fn name_lower(&self) -> String {
        self.name.to_lowercase()
    }

    /// Target type, with empty strings treated as missing.
    pub fn target_type(&self) -> Option<&str> {
        self.target.as_deref().filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActiveOptions {
    #[serde(default)]
    pub moves: Vec<MoveOption>,
    #[serde(default, rename = "canTerastallize", deserialize_with = "truthy")]
    pub can_terastallize: bool,
    #[serde(default, deserialize_with = "truthy")]
    pub trapped: bool,
    #[serde(default)]
    pub boosts: HashMap<String, f32>,
}

impl ActiveOptions {
    pub fn has_moves(&self) -> bool {
        !self.moves.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SidePokemon {
    #[serde(default)]
    pub ident: String,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub condition: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default, deserialize_with = "truthy")]
    pub fainted: bool,
    #[serde(default)]
    pub moves: Vec<String>,
    #[serde(default)]
    pub item: String,
    #[serde(default)]
    pub ability: String,
    #[serde(default, rename = "baseAbility")]
    pub base_ability: String,
    #[serde(default, rename = "teraType")]
    pub tera_type: String,
    #[serde(default)]
    pub terastallized: String,
}

impl SidePokemon {
    pub fn is_fainted(&self) -> bool {
        self.fainted || is_fainted_condition(&self.condition)
    }

    pub fn ability_name(&self) -> &str {
        if self.ability.is_empty() {
            &self.base_ability
        } else {
            &self.ability
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SideInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub pokemon: Vec<SidePokemon>,
}

/// One side's decision request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionRequest {
    #[serde(default, rename = "teamPreview", deserialize_with = "truthy")]
    pub team_preview: bool,
    #[serde(default, deserialize_with = "truthy")]
    pub wait: bool,
    #[serde(default, rename = "forceSwitch")]
    pub force_switch: Option<Vec<bool>>,
    #[serde(default)]
    pub active: Option<Vec<Option<ActiveOptions>>>,
    #[serde(default, rename = "canSwitch", deserialize_with = "truthy")]
    pub can_switch: bool,
    #[serde(default)]
    pub side: SideInfo,
    #[serde(default)]
    pub rqid: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    TeamPreview,
    ForcedSwitch,
    Normal,
    Unknown,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::TeamPreview => "team_preview",
            Phase::ForcedSwitch => "forced_switch",
            Phase::Normal => "normal",
            Phase::Unknown => "unknown",
        }
    }
}

impl DecisionRequest {
    pub fn phase(&self) -> Phase {
        if self.team_preview {
            Phase::TeamPreview
        } else if self.force_switch.is_some() {
            Phase::ForcedSwitch
        } else if self.active.is_some() {
            Phase::Normal
        } else {
            Phase::Unknown
        }
    }

    pub fn force_switch_flags(&self) -> &[bool] {
        self.force_switch.as_deref().unwrap_or(&[])
    }

    pub fn is_forced(&self, slot: usize) -> bool {
        self.force_switch_flags().get(slot).copied().unwrap_or(false)
    }

    /// Raw `active` entries, with positions preserved (None for null slots).
    pub fn active_slots(&self) -> &[Option<ActiveOptions>] {
        self.active.as_deref().unwrap_or(&[])
    }

    pub fn active_at(&self, index: usize) -> Option<&ActiveOptions> {
        self.active_slots().get(index).and_then(|a| a.as_ref())
    }

    /// Non-null active entries in position order.
    pub fn active_entries(&self) -> Vec<&ActiveOptions> {
        self.active_slots().iter().filter_map(|a| a.as_ref()).collect()
    }

    /// Active entries that expose a move list; all entries when none do.
    pub fn actionable_actives(&self) -> Vec<&ActiveOptions> {
        let all = self.active_entries();
        let with_moves: Vec<&ActiveOptions> = all.iter().copied().filter(|a| a.has_moves()).collect();
        if with_moves.is_empty() {
            all
        } else {
            with_moves
        }
    }

    pub fn side_pokemon(&self) -> &[SidePokemon] {
        &self.side.pokemon
    }

    pub fn actives_from_side(&self) -> Vec<&SidePokemon> {
        self.side.pokemon.iter().filter(|p| p.active).collect()
    }

    /// Positions (0/1) of active combatants that are not fainted.
    pub fn alive_active_positions(&self) -> Vec<usize> {
        self.actives_from_side()
            .iter()
            .take(2)
            .enumerate()
            .filter(|(_, p)| !p.is_fainted())
            .map(|(pos, _)| pos)
            .collect()
    }

    pub fn alive_active_count(&self) -> usize {
        self.actives_from_side().iter().filter(|p| !p.is_fainted()).count()
    }

    pub fn has_partner(&self) -> bool {
        self.alive_active_count() >= 2
    }

    /// 1-based roster slots that can be switched in.
    pub fn legal_switch_slots(&self) -> Vec<usize> {
        self.side
            .pokemon
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.active && !p.is_fainted())
            .map(|(i, _)| i + 1)
            .collect()
    }

    pub fn can_switch_now(&self) -> bool {
        self.can_switch || self.force_switch.is_some()
    }

    /// One-line summary used in logs and timeout detail.
    pub fn summary(&self) -> String {
        let forced = self.force_switch_flags().iter().filter(|f| **f).count();
        format!(
            "teamPreview={} wait={} forced={} active={}",
            self.team_preview,
            self.wait,
            forced,
            self.active_slots().len()
        )
    }
}

/// A request as received: typed view plus the raw JSON for dumps.
#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub raw: Value,
    pub request: DecisionRequest,
}

impl ReceivedRequest {
    pub fn parse(json: &str) -> serde_json::Result<Self> {
        let raw: Value = serde_json::from_str(json)?;
        let request = DecisionRequest::deserialize(&raw)?;
        Ok(Self { raw, request })
    }

    pub fn from_value(raw: Value) -> serde_json::Result<Self> {
        let request = DecisionRequest::deserialize(&raw)?;
        Ok(Self { raw, request })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doubles_request() -> Value {
        json!({
            "active": [
                {"moves": [
                    {"move": "Fake Out", "id": "fakeout", "target": "normal", "disabled": false, "pp": 16},
                    {"move": "Protect", "id": "protect", "target": "self", "disabled": "Taunt"}
                ], "canTerastallize": "Fire"},
                {"moves": [{"move": "Spore", "id": "spore", "target": "normal"}]}
            ],
            "side": {"name": "p1", "id": "p1", "pokemon": [
                {"ident": "p1: Incineroar", "details": "Incineroar, L50, M", "condition": "150/202", "active": true},
                {"ident": "p1: Amoonguss", "details": "Amoonguss, L50", "condition": "0 fnt", "active": true},
                {"ident": "p1: Urshifu", "details": "Urshifu, L50", "condition": "100/100", "active": false},
                {"ident": "p1: Rillaboom", "details": "Rillaboom, L50", "condition": "0 fnt", "active": false}
            ]},
            "rqid": 3
        })
    }

    #[test]
    fn test_parse_tolerates_disabled_strings() {
        let r = ReceivedRequest::from_value(doubles_request()).unwrap();
        let a0 = r.request.active_at(0).unwrap();
        assert!(!a0.moves[0].disabled);
        assert!(a0.moves[1].disabled, "string disabled reason must read as disabled");
        assert!(a0.can_terastallize);
        assert_eq!(r.request.phase(), Phase::Normal);
    }

    #[test]
    fn test_alive_positions_and_switches() {
        let r = ReceivedRequest::from_value(doubles_request()).unwrap();
        assert_eq!(r.request.alive_active_positions(), vec![0]);
        assert!(!r.request.has_partner());
        assert_eq!(r.request.legal_switch_slots(), vec![3]);
    }

    #[test]
    fn test_phase_detection() {
        let tp = ReceivedRequest::parse(r#"{"teamPreview": true, "side": {"pokemon": []}}"#).unwrap();
        assert_eq!(tp.request.phase(), Phase::TeamPreview);
        let fs = ReceivedRequest::parse(r#"{"forceSwitch": [true, false]}"#).unwrap();
        assert_eq!(fs.request.phase(), Phase::ForcedSwitch);
        assert!(fs.request.is_forced(0));
        assert!(!fs.request.is_forced(1));
        let w = ReceivedRequest::parse(r#"{"wait": true}"#).unwrap();
        assert_eq!(w.request.phase(), Phase::Unknown);
        assert!(w.request.wait);
    }

    #[test]
    fn test_summary_format() {
        let fs = ReceivedRequest::parse(r#"{"forceSwitch": [true, true]}"#).unwrap();
        assert_eq!(fs.request.summary(), "teamPreview=false wait=false forced=2 active=0");
    }
}
