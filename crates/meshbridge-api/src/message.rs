// ── Raw coordinator traffic and decoded field values ──

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::device::Device;

/// Flat `key → value` map produced by decoding one message.
///
/// Insertion-ordered so that "later converter wins" merges stay stable.
pub type FieldMap = IndexMap<String, FieldValue>;

// ── FieldValue ──────────────────────────────────────────────────────

/// A single decoded field.
///
/// Numbers are kept as raw `f64` (not `serde_json::Number`) so that a
/// decoder can hand back NaN and the dispatcher can refuse it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Number(f64),
    Text(String),
    Json(serde_json::Value),
}

impl FieldValue {
    pub fn is_number(&self) -> bool {
        matches!(self, Self::Number(_))
    }

    pub fn is_nan(&self) -> bool {
        matches!(self, Self::Number(n) if n.is_nan())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Json(v) => v.as_f64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Json(v) => v.as_str(),
            _ => None,
        }
    }

    /// Read a numeric member of an object value (e.g. `x` of a color).
    pub fn member_f64(&self, key: &str) -> Option<f64> {
        match self {
            Self::Json(v) => v.get(key).and_then(serde_json::Value::as_f64),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "{s}"),
            Self::Json(serde_json::Value::String(s)) => write!(f, "{s}"),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i64> for FieldValue {
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<serde_json::Value> for FieldValue {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(ref n) => n.as_f64().map_or(Self::Json(v), Self::Number),
            serde_json::Value::String(s) => Self::Text(s),
            other => Self::Json(other),
        }
    }
}

// ── Message ─────────────────────────────────────────────────────────

/// One raw message from the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub device: Device,
    /// Source endpoint id.
    pub endpoint: u8,
    /// Cluster name, e.g. `msTemperatureMeasurement`, `genOnOff`.
    pub cluster: String,
    /// Message type, e.g. `attributeReport`, `readResponse`, `commandOn`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub linkquality: Option<u8>,
    /// Multicast group id; `0` when sent unicast.
    #[serde(default)]
    pub group_id: u16,
}

impl Message {
    pub fn new(device: Device, cluster: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            device,
            endpoint: 1,
            cluster: cluster.into(),
            kind: kind.into(),
            payload: serde_json::Value::Null,
            linkquality: None,
            group_id: 0,
        }
    }
}
