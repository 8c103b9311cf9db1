// ── Key/id helpers ──
//
// Converter tables speak in snake_case keys (`power_on_behavior`), the
// device model in dash-separated ids (`power-on-behavior`).

use strum::{Display, EnumString};

/// Fields that carry precision/calibration tunables.
pub const OPTION_BASES: [&str; 5] = ["illuminance", "illuminance-lux", "pressure", "temperature", "humidity"];

/// Ids that are always telemetry, whatever a schema says.
pub const TELEMETRY_IDS: [&str; 3] = ["battery", "voltage", "linkquality"];

/// Named endpoint suffixes understood in encoder keys (`state_left`).
const ENDPOINT_NAMES: &[&str] = &[
    "left", "right", "center", "top", "bottom", "default", "white", "rgb", "cct", "system", "relay",
    "usb", "l1", "l2", "l3", "l4", "l5", "l6", "l7", "l8", "s1", "s2", "s3", "s4",
];

pub fn key2id(key: &str) -> String {
    key.replace('_', "-")
}

/// Inverse of [`key2id`]. Lossy for keys that genuinely contain `-`.
pub fn id2key(id: &str) -> String {
    id.replace('-', "_")
}

/// `power-on_behavior` → `Power On Behavior`.
pub fn display_name(id: &str) -> String {
    id.split(['-', '_'])
        .filter(|token| !token.is_empty())
        .map(|token| {
            let mut chars = token.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_uppercase().chain(chars).collect()
            })
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum OptionKind {
    Precision,
    Calibration,
}

impl OptionKind {
    pub const ALL: [OptionKind; 2] = [OptionKind::Precision, OptionKind::Calibration];
}

pub fn is_option_base(id: &str) -> bool {
    OPTION_BASES.contains(&id)
}

pub fn option_id(base: &str, kind: OptionKind) -> String {
    format!("{base}-{kind}")
}

/// Split `temperature-precision` into `("temperature", Precision)`.
///
/// Only the fixed base set qualifies; anything else is an ordinary id.
pub fn parse_option_id(id: &str) -> Option<(&str, OptionKind)> {
    let (base, suffix) = id.rsplit_once('-')?;
    let kind = suffix.parse().ok()?;
    is_option_base(base).then_some((base, kind))
}

/// Split a trailing endpoint postfix off an encoder key.
///
/// `state_left` → `("state", Some("left"))`, `state_2` → `("state", Some("2"))`.
/// Keys whose last segment is not a recognised postfix are returned whole.
pub fn split_endpoint_postfix(key: &str) -> (&str, Option<&str>) {
    match key.rsplit_once('_') {
        Some((base, postfix)) if is_endpoint_postfix(postfix) => (base, Some(postfix)),
        _ => (key, None),
    }
}

fn is_endpoint_postfix(postfix: &str) -> bool {
    let numeric = !postfix.is_empty() && postfix.bytes().all(|b| b.is_ascii_digit());
    numeric || ENDPOINT_NAMES.contains(&postfix)
}
