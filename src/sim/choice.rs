//! Choice-string normalization against a decision request.
//!
//! Policies (local, remote, RL, fallback) produce raw choice strings that the
//! engine may reject for target-metadata reasons. [`normalize_choice`] repairs
//! the common cases before a choice is sent; the repair helpers at the bottom
//! fix a rejected choice from the engine's error text.

use crate::rl::action_builder::{is_force_needs_target_move, is_foe_target_type, is_never_target_move, is_no_target_type};
use crate::sim::request::{ActiveOptions, DecisionRequest};

pub fn is_ally_target_type(t: &str) -> bool {
    matches!(t, "adjacentAlly" | "ally" | "adjacentAllyOrSelf")
}

fn needs_target_type(t: &str) -> bool {
    is_foe_target_type(t) || is_ally_target_type(t)
}

/// Target-location suffix for a move's target type as used by choice repair.
///
/// Unknown non-empty types default to the primary foe.
pub fn move_target_arg(target: Option<&str>, active_index: usize, has_partner: bool) -> &'static str {
    let Some(t) = target.filter(|t| !t.is_empty()) else {
        return "";
    };
    if is_foe_target_type(t) {
        return " 1";
    }
    match t {
        "adjacentAllyOrSelf" => match (has_partner, active_index) {
            (true, 0) => " -2",
            (true, _) => " -1",
            (false, 0) => " -1",
            (false, _) => " -2",
        },
        "adjacentAlly" | "ally" => {
            if !has_partner {
                ""
            } else if active_index == 0 {
                " -2"
            } else {
                " -1"
            }
        }
        _ if is_no_target_type(t) => "",
        _ => " 1",
    }
}

/// `move N` or `move N T` parsed from one choice part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MovePart {
    pub slot: usize,
    pub target: Option<i32>,
}

pub fn parse_move_part(part: &str) -> Option<MovePart> {
    let mut tokens = part.split_whitespace();
    if !tokens.next()?.eq_ignore_ascii_case("move") {
        return None;
    }
    let slot: usize = tokens.next()?.parse().ok()?;
    let target = match tokens.next() {
        Some(t) => Some(t.parse::<i32>().ok()?),
        None => None,
    };
    if tokens.next().is_some() {
        return None;
    }
    Some(MovePart { slot, target })
}

fn split_parts(choice: &str) -> Vec<String> {
    choice
        .split(',')
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// First non-disabled move of `active` rendered with a valid target, if any.
fn first_legal_move_part(active: &ActiveOptions, active_index: usize, has_partner: bool) -> Option<String> {
    for (j, m) in active.moves.iter().enumerate() {
        if m.disabled {
            continue;
        }
        let slot = j + 1;
        let target = m.target_type();
        if !has_partner && matches!(target, Some("adjacentAlly") | Some("ally")) {
            continue;
        }
        let Some(t) = target else {
            if is_force_needs_target_move(&m.id_lower()) {
                return Some(format!("move {slot} 1"));
            }
            return Some(format!("move {slot}"));
        };
        if needs_target_type(t) {
            let arg = move_target_arg(Some(t), active_index, has_partner);
            if arg.is_empty() {
                continue;
            }
            return Some(format!("move {slot}{arg}"));
        }
        return Some(format!("move {slot}"));
    }
    None
}

/// Rewrite `choice` so the engine accepts it for `req`.
pub fn normalize_choice(choice: &str, req: &DecisionRequest) -> String {
    let raw = choice.trim();
    if raw.is_empty() || raw.starts_with("team ") {
        return raw.to_string();
    }
    let parts = split_parts(raw);
    if parts.is_empty() {
        return raw.to_string();
    }

    let all_actives = req.active_entries();
    if all_actives.is_empty() {
        return raw.to_string();
    }
    let mut actives = req.actionable_actives();

    let side_actives = req.actives_from_side();
    let alive_positions = req.alive_active_positions();
    let has_partner = req.has_partner();

    // One part in doubles with one survivor: it belongs to the survivor.
    if parts.len() == 1 && all_actives.len() == 2 && side_actives.len() == 2 && alive_positions.len() == 1 {
        actives = vec![all_actives[alive_positions[0]]];
    }

    let mut out = Vec::with_capacity(parts.len());
    for (i, part) in parts.iter().enumerate() {
        let Some(active) = actives.get(i).copied() else {
            out.push(part.clone());
            continue;
        };
        let Some(mp) = parse_move_part(part) else {
            out.push(part.clone());
            continue;
        };
        let active_index = if all_actives.len() == 2 {
            all_actives
                .iter()
                .position(|a| std::ptr::eq(*a, active))
                .unwrap_or(0)
        } else {
            0
        };
        let had_target = mp.target.is_some();
        let slot = mp.slot;
        let move_opt = slot.checked_sub(1).and_then(|j| active.moves.get(j));
        let target_type = move_opt.and_then(|m| m.target_type());
        let id = move_opt.map(|m| m.id_lower()).unwrap_or_default();
        let name = move_opt.map(|m| m.name_lower()).unwrap_or_default();

        if move_opt.map(|m| m.disabled).unwrap_or(false) {
            out.push(first_legal_move_part(active, active_index, has_partner).unwrap_or_else(|| "default".into()));
            continue;
        }

        let force_no_target = is_never_target_move(&id, &name);
        let force_needs_target = is_force_needs_target_move(&id);

        if force_no_target && had_target {
            out.push(format!("move {slot}"));
            continue;
        }

        let Some(t) = target_type else {
            if !force_no_target && !had_target {
                out.push(format!("move {slot} 1"));
            } else {
                out.push(part.clone());
            }
            continue;
        };

        if is_ally_target_type(t) {
            if matches!(t, "adjacentAlly" | "ally") && !has_partner {
                out.push(first_legal_move_part(active, active_index, has_partner).unwrap_or_else(|| "default".into()));
                continue;
            }
            let arg = move_target_arg(Some(t), active_index, has_partner);
            if arg.is_empty() {
                out.push(first_legal_move_part(active, active_index, has_partner).unwrap_or_else(|| "default".into()));
            } else {
                out.push(format!("move {slot}{arg}"));
            }
            continue;
        }

        let needs_target = !force_no_target && (force_needs_target || needs_target_type(t));
        if needs_target && !had_target {
            out.push(format!("move {slot}{}", move_target_arg(Some(t), active_index, has_partner)));
        } else if !needs_target && had_target {
            out.push(format!("move {slot}"));
        } else {
            out.push(part.clone());
        }
    }
    out.join(", ")
}

/// True when any move part of `choice` selects a disabled move.
pub fn choice_looks_disabled(choice: &str, req: &DecisionRequest) -> bool {
    let raw = choice.trim();
    if raw.is_empty() || raw.starts_with("team ") {
        return false;
    }
    let actives = req.actionable_actives();
    if actives.is_empty() {
        return false;
    }
    split_parts(raw)
        .iter()
        .zip(actives.iter())
        .filter_map(|(part, active)| {
            let mp = parse_move_part_prefix(part)?;
            mp.checked_sub(1).and_then(|j| active.moves.get(j))
        })
        .any(|m| m.disabled)
}

fn parse_move_part_prefix(part: &str) -> Option<usize> {
    let mut tokens = part.split_whitespace();
    if !tokens.next()?.eq_ignore_ascii_case("move") {
        return None;
    }
    tokens.next()?.parse().ok()
}

pub fn is_invalid_choice_error(err: &str) -> bool {
    err.contains("[Invalid choice]") || err.contains("[Unavailable choice]")
}

/// How a rejected choice can be repaired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    NeedsTarget,
    CantChooseTarget,
    Other,
}

pub fn classify_rejection(err: &str) -> RejectionKind {
    let lower = err.to_lowercase();
    if lower.contains("needs a target") {
        RejectionKind::NeedsTarget
    } else if lower.contains("can't choose a target") {
        RejectionKind::CantChooseTarget
    } else {
        RejectionKind::Other
    }
}

/// Move name quoted in an engine error (`Can't move: Aura Sphere needs ...`).
fn move_name_in_error(err: &str) -> Option<String> {
    let rest = err.split("Can't move:").nth(1)?;
    let end = ["needs a target", "can't choose a target"]
        .iter()
        .filter_map(|m| rest.find(m))
        .min()?;
    let name = rest[..end].trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_lowercase())
    }
}

/// Index of the part the error refers to; the first part matching `want`
/// when the error names no known move.
fn offending_part(
    parts: &[String],
    req: &DecisionRequest,
    err: &str,
    want: impl Fn(&MovePart) -> bool,
) -> Option<usize> {
    let actives = req.actionable_actives();
    if let Some(name) = move_name_in_error(err) {
        let hit = parts.iter().enumerate().position(|(i, p)| {
            let Some(mp) = parse_move_part(p) else {
                return false;
            };
            actives
                .get(i)
                .and_then(|a| mp.slot.checked_sub(1).and_then(|j| a.moves.get(j)))
                .map(|m| m.name_lower() == name || m.id_lower() == name.replace(' ', ""))
                .unwrap_or(false)
                && want(&mp)
        });
        if hit.is_some() {
            return hit;
        }
    }
    parts.iter().position(|p| parse_move_part(p).map(|mp| want(&mp)).unwrap_or(false))
}

/// Add ` 1` to the move part an engine "needs a target" error refers to.
pub fn add_target_to_rejected(choice: &str, req: &DecisionRequest, err: &str) -> Option<String> {
    let mut parts = split_parts(choice);
    let idx = offending_part(&parts, req, err, |mp| mp.target.is_none())?;
    let mp = parse_move_part(&parts[idx])?;
    parts[idx] = format!("move {} 1", mp.slot);
    Some(parts.join(", "))
}

/// Strip the target from the move part a "can't choose a target" error refers to.
pub fn strip_target_from_rejected(choice: &str, req: &DecisionRequest, err: &str) -> Option<String> {
    let mut parts = split_parts(choice);
    let idx = offending_part(&parts, req, err, |mp| mp.target.is_some())?;
    let mp = parse_move_part(&parts[idx])?;
    parts[idx] = format!("move {}", mp.slot);
    Some(parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn req(v: serde_json::Value) -> DecisionRequest {
        serde_json::from_value(v).unwrap()
    }

    fn doubles(moves_left: serde_json::Value, moves_right: serde_json::Value, right_fainted: bool) -> DecisionRequest {
        req(json!({
            "active": [{"moves": moves_left}, {"moves": moves_right}],
            "side": {"pokemon": [
                {"ident": "p1a: A", "condition": "100/100", "active": true},
                {"ident": "p1b: B", "condition": if right_fainted { "0 fnt" } else { "100/100" }, "active": true},
                {"ident": "p1: C", "condition": "100/100", "active": false},
            ]}
        }))
    }

    #[test]
    fn test_team_choice_passes_through() {
        let r = req(json!({"teamPreview": true}));
        assert_eq!(normalize_choice(" team 1234 ", &r), "team 1234");
    }

    #[test]
    fn test_disabled_move_replaced_by_first_legal() {
        let r = doubles(
            json!([
                {"move": "Protect", "id": "protect", "target": "self", "disabled": true},
                {"move": "Tackle", "id": "tackle", "target": "normal"}
            ]),
            json!([{"move": "Tackle", "id": "tackle", "target": "normal"}]),
            false,
        );
        assert_eq!(normalize_choice("move 1, move 1 2", &r), "move 2 1, move 1 2");
    }

    #[test]
    fn test_all_disabled_becomes_default() {
        let r = doubles(
            json!([{"move": "Tackle", "id": "tackle", "target": "normal", "disabled": true}]),
            json!([{"move": "Tackle", "id": "tackle", "target": "normal"}]),
            false,
        );
        assert_eq!(normalize_choice("move 1 1, move 1 1", &r), "default, move 1 1");
    }

    #[test]
    fn test_never_target_move_stripped() {
        let r = doubles(
            json!([{"move": "Rock Slide", "id": "rockslide", "target": "normal"}]),
            json!([{"move": "Protect", "id": "protect"}]),
            false,
        );
        assert_eq!(normalize_choice("move 1 1, move 1 2", &r), "move 1, move 1");
    }

    #[test]
    fn test_missing_target_metadata_adds_foe_target() {
        let r = doubles(
            json!([{"move": "Aura Sphere", "id": "aurasphere"}]),
            json!([{"move": "Tackle", "id": "tackle", "target": "normal"}]),
            false,
        );
        assert_eq!(normalize_choice("move 1, move 1", &r), "move 1 1, move 1 1");
    }

    #[test]
    fn test_ally_move_repaired_or_replaced() {
        let hh = json!([
            {"move": "Helping Hand", "id": "helpinghand", "target": "adjacentAlly"},
            {"move": "Tackle", "id": "tackle", "target": "normal"}
        ]);
        let r = doubles(hh.clone(), hh.clone(), false);
        assert_eq!(normalize_choice("move 1, move 1 1", &r), "move 1 -2, move 1 -1");

        // Partner fainted: one part, mapped onto the survivor and replaced.
        let r = doubles(hh.clone(), hh, true);
        assert_eq!(normalize_choice("move 1", &r), "move 2 1");
    }

    #[test]
    fn test_no_target_type_strips_and_foe_type_adds() {
        let r = doubles(
            json!([{"move": "Earthquake", "id": "earthquake", "target": "allAdjacent"}]),
            json!([{"move": "Tackle", "id": "tackle", "target": "normal"}]),
            false,
        );
        assert_eq!(normalize_choice("move 1 1, move 1", &r), "move 1, move 1 1");
    }

    #[test]
    fn test_switch_and_unparsed_parts_kept() {
        let r = doubles(json!([{"move": "Tackle", "id": "tackle", "target": "normal"}]), json!([]), false);
        assert_eq!(normalize_choice("switch 3, default", &r), "switch 3, default");
    }

    #[test]
    fn test_choice_looks_disabled() {
        let r = doubles(
            json!([{"move": "Tackle", "id": "tackle", "target": "normal", "disabled": "Taunt"}]),
            json!([{"move": "Tackle", "id": "tackle", "target": "normal"}]),
            false,
        );
        assert!(choice_looks_disabled("move 1 1, move 1 1", &r));
        assert!(!choice_looks_disabled("switch 3, move 1 1", &r));
        assert!(!choice_looks_disabled("team 12", &r));
    }

    #[test]
    fn test_error_classification() {
        assert!(is_invalid_choice_error("[Invalid choice] Can't move: Aura Sphere needs a target"));
        assert!(is_invalid_choice_error("[Unavailable choice] Can't switch: trapped"));
        assert!(!is_invalid_choice_error("something else"));
        assert_eq!(
            classify_rejection("[Invalid choice] Can't move: Aura Sphere needs a target"),
            RejectionKind::NeedsTarget
        );
        assert_eq!(
            classify_rejection("[Invalid choice] Can't move: Protect can't choose a target for Protect"),
            RejectionKind::CantChooseTarget
        );
        assert_eq!(classify_rejection("[Invalid choice] Can't switch"), RejectionKind::Other);
    }

    #[test]
    fn test_targeted_repairs_use_move_name() {
        let r = doubles(
            json!([{"move": "Tackle", "id": "tackle", "target": "normal"}]),
            json!([{"move": "Aura Sphere", "id": "aurasphere", "target": "any"}]),
            false,
        );
        let fixed = add_target_to_rejected(
            "move 1, move 1",
            &r,
            "[Invalid choice] Can't move: Aura Sphere needs a target",
        );
        assert_eq!(fixed.as_deref(), Some("move 1, move 1 1"));

        let stripped = strip_target_from_rejected(
            "move 1 1, move 1 2",
            &r,
            "[Invalid choice] Can't move: Nothing can't choose a target",
        );
        assert_eq!(stripped.as_deref(), Some("move 1, move 1 2"), "falls back to first targeted part");
    }

    #[test]
    fn test_move_target_arg_table() {
        assert_eq!(move_target_arg(Some("normal"), 0, true), " 1");
        assert_eq!(move_target_arg(Some("adjacentAllyOrSelf"), 1, false), " -2");
        assert_eq!(move_target_arg(Some("adjacentAlly"), 0, false), "");
        assert_eq!(move_target_arg(Some("allAdjacentFoes"), 0, true), "");
        assert_eq!(move_target_arg(Some("scripted"), 0, true), " 1");
        assert_eq!(move_target_arg(None, 0, true), "");
    }
}
