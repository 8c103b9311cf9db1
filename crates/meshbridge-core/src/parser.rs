// ── Value parsers ──
//
// Translate between the device model's string values and wire values.

use meshbridge_api::FieldValue;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BridgeError;
use crate::property::DataType;

// CIE xy → linear RGB (wide gamut D65).
const XY_TO_RGB: [[f64; 3]; 3] = [
    [1.6565, -0.3549, -0.2550],
    [-0.7072, 1.6554, 0.0362],
    [0.0517, -0.1214, 1.0116],
];
const GAMMA_THRESHOLD: f64 = 0.002_130_8;
const CHANNEL_MAX: f64 = 0.9999;

#[derive(Debug, Clone, PartialEq)]
pub enum Parser {
    Boolean { on: Value, off: Value },
    Float,
    Integer,
    /// One of a fixed set of literals; numeric choices travel as numbers.
    Choice(Vec<String>),
    Rgb2Xy,
}

/// Parser declaration as written in node schemas: `"float"` or
/// `{"type": "boolean", "on": "ON", "off": "OFF"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParserSpec {
    Name(String),
    Full {
        #[serde(rename = "type")]
        kind: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        off: Option<Value>,
    },
}

impl Parser {
    pub fn boolean(on: Option<Value>, off: Option<Value>) -> Self {
        Self::Boolean {
            on: on.unwrap_or(Value::Bool(true)),
            off: off.unwrap_or(Value::Bool(false)),
        }
    }

    pub fn choice<I, S>(choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Choice(choices.into_iter().map(Into::into).collect())
    }

    pub fn from_spec(spec: &ParserSpec) -> Result<Self, BridgeError> {
        let (kind, on, off) = match spec {
            ParserSpec::Name(kind) => (kind.as_str(), None, None),
            ParserSpec::Full { kind, on, off } => (kind.as_str(), on.clone(), off.clone()),
        };
        match kind {
            "boolean" => Ok(Self::boolean(on, off)),
            "float" => Ok(Self::Float),
            "integer" => Ok(Self::Integer),
            "rgb2xy" => Ok(Self::Rgb2Xy),
            other => Err(BridgeError::Unsupported {
                operation: "parser",
                reason: format!("unknown parser type '{other}'"),
            }),
        }
    }

    /// Data type the device model should advertise for parsed values.
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Boolean { .. } => DataType::Boolean,
            Self::Float => DataType::Float,
            Self::Integer => DataType::Integer,
            Self::Choice(_) => DataType::Enum,
            Self::Rgb2Xy => DataType::Color,
        }
    }

    pub fn to_model(&self, wire: &FieldValue) -> String {
        match self {
            Self::Boolean { on, .. } => same_value(wire, on).to_string(),
            Self::Float | Self::Integer | Self::Choice(_) => wire.to_string(),
            Self::Rgb2Xy => match (wire.member_f64("x"), wire.member_f64("y")) {
                (Some(x), Some(y)) => xy_to_rgb(x, y),
                _ => wire.to_string(),
            },
        }
    }

    pub fn to_wire(&self, value: &str) -> Result<FieldValue, BridgeError> {
        match self {
            Self::Boolean { on, off } => {
                let picked = if value == "true" { on } else { off };
                Ok(FieldValue::from(picked.clone()))
            }
            Self::Float => value
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|v| !v.is_nan())
                .map(FieldValue::Number)
                .ok_or(BridgeError::WrongFormat),
            Self::Integer => value
                .trim()
                .parse::<i64>()
                .map(FieldValue::from)
                .map_err(|_| BridgeError::WrongFormat),
            Self::Choice(choices) => {
                let value = value.trim();
                if !choices.iter().any(|c| c == value) {
                    return Err(BridgeError::WrongFormat);
                }
                Ok(value.parse::<f64>().map_or_else(|_| FieldValue::from(value), FieldValue::Number))
            }
            Self::Rgb2Xy => Ok(FieldValue::Json(serde_json::json!({ "rgb": value }))),
        }
    }
}

fn same_value(wire: &FieldValue, expected: &Value) -> bool {
    match (wire, expected) {
        (FieldValue::Bool(a), Value::Bool(b)) => a == b,
        (FieldValue::Number(a), Value::Number(b)) => b.as_f64() == Some(*a),
        (FieldValue::Text(a), Value::String(b)) => a == b,
        (FieldValue::Json(a), b) => a == b,
        _ => false,
    }
}

/// Convert a CIE xy colour to an `"R,G,B"` string with 0..=255 channels.
pub fn xy_to_rgb(x: f64, y: f64) -> String {
    let z = 1.0 - x - y;
    let channel = |row: [f64; 3]| {
        let linear = (row[0] * x + row[1] * y + row[2] * z).max(0.0);
        let encoded = if linear > GAMMA_THRESHOLD {
            1.055 * linear.powf(1.0 / 2.4) - 0.055
        } else {
            12.92 * linear
        };
        (encoded.min(CHANNEL_MAX) * 256.0).floor()
    };
    let [r, g, b] = XY_TO_RGB.map(channel);
    format!("{r},{g},{b}")
}
