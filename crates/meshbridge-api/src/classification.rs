// ── Vendor-independent classification ──
//
// Generic "what kind of entity is this field" hints (binary sensor,
// numeric sensor with unit, switch, ...) keyed by model. They only ever
// fill gaps the converter tables leave open.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    BinarySensor,
    Switch,
    Sensor,
    Light,
    #[serde(other)]
    Other,
}

impl Component {
    /// Components whose state is a two-valued on/off payload.
    pub fn is_binary(self) -> bool {
        matches!(self, Self::BinarySensor | Self::Switch)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    #[serde(rename = "type")]
    pub component: Component,
    #[serde(default)]
    pub value_template: Option<String>,
    #[serde(default)]
    pub payload_on: Option<serde_json::Value>,
    #[serde(default)]
    pub payload_off: Option<serde_json::Value>,
    #[serde(default)]
    pub unit_of_measurement: Option<String>,
}

impl Classification {
    /// The message field this entry describes, taken from its value template.
    pub fn field(&self) -> Option<&str> {
        self.value_template.as_deref().and_then(template_field)
    }
}

pub trait ClassificationSource: Send + Sync {
    fn classify(&self, model: &str) -> Vec<Classification>;
}

/// A plain table keyed by model works as a source.
impl ClassificationSource for HashMap<String, Vec<Classification>> {
    fn classify(&self, model: &str) -> Vec<Classification> {
        self.get(model).cloned().unwrap_or_default()
    }
}

/// Extract `<field>` from a `{{ ... value_json.<field> ... }}` template.
///
/// When a template names several fields the last one wins.
pub fn template_field(template: &str) -> Option<&str> {
    let open = template.find("{{")?;
    let close = template.rfind("}}")?;
    let body = template.get(open + 2..close)?;

    body.rmatch_indices("value_json.").find_map(|(at, needle)| {
        let rest = &body[at + needle.len()..];
        let len = rest
            .char_indices()
            .take_while(|&(i, c)| {
                if i == 0 {
                    c.is_ascii_alphabetic()
                } else {
                    c.is_ascii_alphanumeric() || c == '_'
                }
            })
            .count();
        (len > 0).then(|| &rest[..len])
    })
}
