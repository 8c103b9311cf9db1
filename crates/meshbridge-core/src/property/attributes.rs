// ── Property attributes and tags ──

use serde::{Deserialize, Deserializer, Serialize};
use strum::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DataType {
    Integer,
    Float,
    Boolean,
    #[default]
    String,
    Enum,
    Color,
}

/// Which bucket of its node a property lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PropertyKind {
    Sensor,
    Telemetry,
    Option,
}

/// What a property's value is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum TransportKind {
    /// Read/written through the converter tables over the radio link.
    Protocol,
    /// Local tunable mirroring a protocol field (precision/calibration).
    Shadow,
    /// Record handed over by the device model; holds a value, nothing more.
    Record,
    /// Bridge-level control with its own get/set.
    Custom,
}

/// Two properties are "the same kind" only if both halves match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropertyTag {
    pub kind: PropertyKind,
    pub transport: TransportKind,
}

impl PropertyTag {
    pub fn new(kind: PropertyKind, transport: TransportKind) -> Self {
        Self { kind, transport }
    }
}

// ── Attributes ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attributes {
    pub name: String,
    pub settable: bool,
    pub retained: bool,
    pub data_type: DataType,
    pub format: Option<String>,
    pub unit: Option<String>,
}

impl Attributes {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            settable: false,
            retained: true,
            data_type: DataType::String,
            format: None,
            unit: None,
        }
    }

    pub fn apply(&mut self, patch: &AttributePatch) {
        if let Some(name) = &patch.name {
            self.name.clone_from(name);
        }
        if let Some(settable) = patch.settable {
            self.settable = settable;
        }
        if let Some(retained) = patch.retained {
            self.retained = retained;
        }
        if let Some(data_type) = patch.data_type {
            self.data_type = data_type;
        }
        if patch.format.is_some() {
            self.format.clone_from(&patch.format);
        }
        if patch.unit.is_some() {
            self.unit.clone_from(&patch.unit);
        }
    }

    /// `(attribute, value)` pairs in the order they are published.
    pub fn published(&self) -> Vec<(&'static str, String)> {
        let mut out = vec![
            ("name", self.name.clone()),
            ("settable", self.settable.to_string()),
            ("retained", self.retained.to_string()),
            ("dataType", self.data_type.to_string()),
        ];
        if let Some(format) = &self.format {
            out.push(("format", format.clone()));
        }
        if let Some(unit) = &self.unit {
            out.push(("unit", unit.clone()));
        }
        out
    }
}

/// A partial set of attributes; unset fields leave the target alone.
///
/// Deserializes from device-model records and schema files, where
/// booleans may be spelled `"true"`/`"false"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "flexible_bool", skip_serializing_if = "Option::is_none")]
    pub settable: Option<bool>,
    #[serde(default, deserialize_with = "flexible_bool", skip_serializing_if = "Option::is_none")]
    pub retained: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<DataType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl AttributePatch {
    /// Layer `other` on top: its set fields win.
    pub fn merge(&mut self, other: &AttributePatch) {
        if other.name.is_some() {
            self.name.clone_from(&other.name);
        }
        if other.settable.is_some() {
            self.settable = other.settable;
        }
        if other.retained.is_some() {
            self.retained = other.retained;
        }
        if other.data_type.is_some() {
            self.data_type = other.data_type;
        }
        if other.format.is_some() {
            self.format.clone_from(&other.format);
        }
        if other.unit.is_some() {
            self.unit.clone_from(&other.unit);
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl From<&Attributes> for AttributePatch {
    fn from(attributes: &Attributes) -> Self {
        Self {
            name: Some(attributes.name.clone()),
            settable: Some(attributes.settable),
            retained: Some(attributes.retained),
            data_type: Some(attributes.data_type),
            format: attributes.format.clone(),
            unit: attributes.unit.clone(),
        }
    }
}

fn flexible_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flexible {
        Bool(bool),
        Text(String),
    }

    match Option::<Flexible>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Flexible::Bool(b)) => Ok(Some(b)),
        Some(Flexible::Text(s)) => match s.as_str() {
            "true" => Ok(Some(true)),
            "false" => Ok(Some(false)),
            other => Err(serde::de::Error::custom(format!("expected boolean, got '{other}'"))),
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn patches_layer_later_wins() {
        let mut computed = AttributePatch {
            name: Some("Temperature".into()),
            settable: Some(false),
            data_type: Some(DataType::String),
            ..AttributePatch::default()
        };
        computed.merge(&AttributePatch {
            data_type: Some(DataType::Float),
            ..AttributePatch::default()
        });

        let mut attrs = Attributes::named("temperature");
        attrs.apply(&computed);

        assert_eq!(attrs.name, "Temperature");
        assert_eq!(attrs.data_type, DataType::Float);
        assert!(attrs.retained);
    }

    #[test]
    fn patch_accepts_string_booleans() {
        let patch: AttributePatch =
            serde_json::from_value(json!({"settable": "true", "retained": false, "dataType": "enum"})).unwrap();
        assert_eq!(patch.settable, Some(true));
        assert_eq!(patch.retained, Some(false));
        assert_eq!(patch.data_type, Some(DataType::Enum));

        assert!(serde_json::from_value::<AttributePatch>(json!({"settable": "yes"})).is_err());
    }

    #[test]
    fn published_attributes_skip_unset_optionals() {
        let attrs = Attributes::named("Battery");
        let keys: Vec<_> = attrs.published().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["name", "settable", "retained", "dataType"]);
    }
}
