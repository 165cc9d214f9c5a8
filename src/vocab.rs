// src/vocab.rs
//
// Deterministic string -> small integer ids for open-ended identifiers
// (species, moves, items, abilities, tera types, weather, terrain).
//
// The hash and moduli are part of the observation contract: changing either
// reshuffles every embedding row on the learner side. Id 0 is reserved for
// "unknown / empty".

/// Vocabulary sizes per identifier family (ids are 1..=size, 0 = unknown).
pub mod sizes {
    pub const SPECIES: u32 = 4096;
    pub const MOVE: u32 = 2048;
    pub const ITEM: u32 = 1024;
    pub const ABILITY: u32 = 1024;
    pub const TERA_TYPE: u32 = 32;
    pub const WEATHER: u32 = 32;
    pub const TERRAIN: u32 = 32;
}

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a over UTF-16 code units.
///
/// Code units (not bytes) so non-ASCII names hash the same way the learner
/// side and existing datasets expect.
pub fn fnv1a32(s: &str) -> u32 {
    let mut h = FNV_OFFSET_BASIS;
    for unit in s.encode_utf16() {
        h ^= unit as u32;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

/// Trim + lowercase, then `(fnv1a32 % vocab) + 1`. Empty input maps to 0.
pub fn hash_to_vocab_id(raw: &str, vocab: u32) -> u32 {
    let s = raw.trim().to_lowercase();
    if s.is_empty() || vocab == 0 {
        return 0;
    }
    (fnv1a32(&s) % vocab) + 1
}

pub fn species_id(name: &str) -> u32 {
    hash_to_vocab_id(name, sizes::SPECIES)
}

pub fn move_id(name_or_id: &str) -> u32 {
    hash_to_vocab_id(name_or_id, sizes::MOVE)
}

pub fn item_id(name: &str) -> u32 {
    hash_to_vocab_id(name, sizes::ITEM)
}

pub fn ability_id(name: &str) -> u32 {
    hash_to_vocab_id(name, sizes::ABILITY)
}

pub fn tera_type_id(name: &str) -> u32 {
    hash_to_vocab_id(name, sizes::TERA_TYPE)
}

pub fn weather_id(name: &str) -> u32 {
    hash_to_vocab_id(name, sizes::WEATHER)
}

pub fn terrain_id(name: &str) -> u32 {
    hash_to_vocab_id(name, sizes::TERRAIN)
}

/// Status tokens in id order; "none" is 0.
pub const STATUS_NAMES: [&str; 7] = ["none", "brn", "par", "slp", "frz", "psn", "tox"];

/// Status id from a condition string such as `"123/300 par"` or `"0 fnt"`.
pub fn status_id_from_condition(cond: &str) -> u32 {
    for token in cond.split_whitespace() {
        let key = token.to_lowercase();
        if let Some(i) = STATUS_NAMES.iter().position(|s| *s == key) {
            return i as u32;
        }
    }
    0
}

// ---------------------------------------------------------------------------
// Condition / details parsing
// ---------------------------------------------------------------------------

/// HP fraction from a condition string.
///
/// Empty or unparseable conditions read as full health; `0 fnt` is 0.
pub fn parse_hp_fraction(condition: &str) -> f32 {
    let s = condition.trim();
    if s.is_empty() {
        return 1.0;
    }
    if s == "0 fnt" || s == "0fnt" {
        return 0.0;
    }
    let first = s.split(' ').next().unwrap_or("");
    let Some((cur, max)) = first.split_once('/') else {
        return 1.0;
    };
    let (Ok(cur), Ok(max)) = (cur.parse::<u32>(), max.parse::<u32>()) else {
        return 1.0;
    };
    if max == 0 {
        return 1.0;
    }
    (cur as f32 / max as f32).clamp(0.0, 1.0)
}

pub fn is_fainted_condition(condition: &str) -> bool {
    let s = condition.trim();
    if s.is_empty() {
        return false;
    }
    s == "0 fnt" || s == "0fnt" || s.ends_with(" fnt")
}

/// Species from a details string, e.g. `"Landorus-Therian, L50, M"`.
pub fn species_from_details(details: &str) -> String {
    let s = details.trim();
    match s.find(',') {
        Some(idx) => s[..idx].trim().to_string(),
        None => s.to_string(),
    }
}

/// Showdown-style id: lowercase alphanumerics only ("Rock Slide" -> "rockslide").
pub fn to_id(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a32_reference_vectors() {
        // Standard FNV-1a 32 test vectors.
        assert_eq!(fnv1a32(""), 0x811c9dc5);
        assert_eq!(fnv1a32("a"), 0xe40c292c);
        assert_eq!(fnv1a32("foobar"), 0xbf9cf968);
    }

    #[test]
    fn test_vocab_id_is_trimmed_and_case_insensitive() {
        let a = species_id("Incineroar");
        let b = species_id("  incineroar ");
        assert_eq!(a, b);
        assert!(a >= 1 && a <= sizes::SPECIES, "id must be in 1..=vocab");
    }

    #[test]
    fn test_empty_maps_to_unknown() {
        assert_eq!(move_id(""), 0);
        assert_eq!(move_id("   "), 0);
        assert_eq!(weather_id(""), 0);
    }

    #[test]
    fn test_ids_stay_in_range() {
        for name in ["protect", "fakeout", "rockslide", "spore", "tailwind"] {
            let id = move_id(name);
            assert!(id >= 1 && id <= sizes::MOVE, "{name} -> {id}");
        }
        let t = tera_type_id("Fairy");
        assert!(t >= 1 && t <= sizes::TERA_TYPE);
    }

    #[test]
    fn test_status_from_condition() {
        assert_eq!(status_id_from_condition("123/300 par"), 2);
        assert_eq!(status_id_from_condition("50/100 TOX"), 6);
        assert_eq!(status_id_from_condition("0 fnt"), 0);
        assert_eq!(status_id_from_condition(""), 0);
    }

    #[test]
    fn test_parse_hp_fraction() {
        assert_eq!(parse_hp_fraction(""), 1.0);
        assert_eq!(parse_hp_fraction("0 fnt"), 0.0);
        assert!((parse_hp_fraction("150/300") - 0.5).abs() < 1e-6);
        assert!((parse_hp_fraction("75/100 brn") - 0.75).abs() < 1e-6);
        assert_eq!(parse_hp_fraction("garbage"), 1.0);
        assert_eq!(parse_hp_fraction("5/0"), 1.0);
    }

    #[test]
    fn test_fainted_condition() {
        assert!(is_fainted_condition("0 fnt"));
        assert!(is_fainted_condition("0fnt"));
        assert!(is_fainted_condition("0/100 fnt"));
        assert!(!is_fainted_condition("10/100"));
        assert!(!is_fainted_condition(""));
    }

    #[test]
    fn test_species_from_details() {
        assert_eq!(species_from_details("Landorus-Therian, L50, M"), "Landorus-Therian");
        assert_eq!(species_from_details(" Amoonguss "), "Amoonguss");
        assert_eq!(species_from_details(""), "");
    }

    #[test]
    fn test_to_id() {
        assert_eq!(to_id("Rock Slide"), "rockslide");
        assert_eq!(to_id("King's Shield"), "kingsshield");
    }
}
