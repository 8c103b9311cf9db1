// ── Static node schemas ──
//
// Hand-maintained per-model descriptions: display name, which fields are
// sensors/telemetry/options, attribute overrides, and bridge-side parsers.
// Loaded once from JSON or YAML.

use std::collections::HashMap;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::BridgeError;
use crate::parser::ParserSpec;
use crate::property::{AttributePatch, PropertyKind};

/// One property as a schema declares it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaProperty {
    pub id: String,
    #[serde(flatten)]
    pub attributes: AttributePatch,
    /// Parser the bridge applies between wire and model values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type_bridge: Option<ParserSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSchema {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub sensors: Vec<SchemaProperty>,
    pub telemetry: Vec<SchemaProperty>,
    pub options: Vec<SchemaProperty>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ignore_sensors: Vec<String>,
}

impl NodeSchema {
    pub fn bucket(&self, kind: PropertyKind) -> &[SchemaProperty] {
        match kind {
            PropertyKind::Sensor => &self.sensors,
            PropertyKind::Telemetry => &self.telemetry,
            PropertyKind::Option => &self.options,
        }
    }

    /// Find `id`, searching sensors, then telemetry, then options.
    pub fn lookup(&self, id: &str) -> Option<(PropertyKind, &SchemaProperty)> {
        [PropertyKind::Sensor, PropertyKind::Telemetry, PropertyKind::Option]
            .into_iter()
            .find_map(|kind| self.bucket(kind).iter().find(|p| p.id == id).map(|p| (kind, p)))
    }

    pub fn ignores(&self, id: &str) -> bool {
        self.ignore_sensors.iter().any(|s| s == id)
    }
}

// ── Raw file shape ──────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct RawCatalog {
    #[serde(default)]
    nodes: IndexMap<String, RawNode>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawNode {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    sensors: Vec<Value>,
    #[serde(default)]
    telemetry: Vec<Value>,
    #[serde(default)]
    options: Vec<Value>,
    #[serde(default)]
    ignore_sensors: Vec<String>,
    #[serde(default)]
    extensions: RawExtensions,
}

#[derive(Debug, Default, Deserialize)]
struct RawExtensions {
    /// `$options/<id>`, `$telemetry/<id>` or plain `<id>` (a sensor).
    #[serde(default)]
    mapping: IndexMap<String, Value>,
}

impl RawNode {
    fn resolve(mut self, model: &str) -> Result<NodeSchema, BridgeError> {
        for (key, extra) in std::mem::take(&mut self.extensions.mapping) {
            let (bucket, id) = match key.split_once('/') {
                Some(("$options", id)) => (&mut self.options, id),
                Some(("$telemetry", id)) => (&mut self.telemetry, id),
                _ => (&mut self.sensors, key.as_str()),
            };
            merge_mapping(bucket, id, extra);
        }

        let parse = |entries: Vec<Value>| -> Result<Vec<SchemaProperty>, BridgeError> {
            entries
                .into_iter()
                .map(|entry| {
                    serde_json::from_value(entry).map_err(|e| BridgeError::Schema {
                        message: format!("model '{model}': {e}"),
                    })
                })
                .collect()
        };

        Ok(NodeSchema {
            name: self.name,
            sensors: parse(self.sensors)?,
            telemetry: parse(self.telemetry)?,
            options: parse(self.options)?,
            ignore_sensors: self.ignore_sensors,
        })
    }
}

/// Merge a mapping extension into its bucket. Fields already declared on
/// the bucket entry win over the extension's.
fn merge_mapping(bucket: &mut Vec<Value>, id: &str, extra: Value) {
    let mut merged = Map::new();
    merged.insert("id".into(), Value::String(id.to_owned()));
    if let Value::Object(extra) = extra {
        merged.extend(extra);
    }

    let position = bucket.iter().position(|p| p.get("id").and_then(Value::as_str) == Some(id));
    if let Some(Value::Object(existing)) = position.and_then(|i| bucket.get(i)) {
        merged.extend(existing.clone());
    }

    match position {
        Some(i) => bucket[i] = Value::Object(merged),
        None => bucket.push(Value::Object(merged)),
    }
}

// ── Catalog ─────────────────────────────────────────────────────────

/// Every known node schema, keyed by model id.
#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
    nodes: HashMap<String, NodeSchema>,
}

impl SchemaCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load from a `.json`, `.yaml` or `.yml` file.
    pub fn load(path: &Path) -> Result<Self, BridgeError> {
        let raw = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => Self::from_yaml(&raw),
            _ => Self::from_json(&raw),
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, BridgeError> {
        let catalog: RawCatalog = serde_json::from_str(raw).map_err(|e| BridgeError::Schema { message: e.to_string() })?;
        Self::resolve(catalog)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, BridgeError> {
        let catalog: RawCatalog = serde_yaml::from_str(raw).map_err(|e| BridgeError::Schema { message: e.to_string() })?;
        Self::resolve(catalog)
    }

    fn resolve(catalog: RawCatalog) -> Result<Self, BridgeError> {
        let nodes = catalog
            .nodes
            .into_iter()
            .map(|(model, node)| node.resolve(&model).map(|schema| (model, schema)))
            .collect::<Result<_, _>>()?;
        Ok(Self { nodes })
    }

    pub fn insert(&mut self, model: impl Into<String>, schema: NodeSchema) {
        self.nodes.insert(model.into(), schema);
    }

    pub fn node(&self, model: &str) -> Option<&NodeSchema> {
        self.nodes.get(model)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::property::DataType;

    const SCHEMA: &str = r#"{
        "nodes": {
            "WSDCGQ11LM": {
                "name": "Aqara temperature sensor",
                "sensors": [
                    { "id": "temperature", "unit": "C" }
                ],
                "telemetry": [
                    { "id": "battery", "dataType": "integer" }
                ],
                "ignoreSensors": ["pressure"],
                "extensions": {
                    "mapping": {
                        "temperature": { "dataType": "float", "unit": "K" },
                        "$telemetry/voltage": { "unit": "mV" },
                        "$options/led": { "settable": "true", "dataTypeBridge": { "type": "boolean", "on": "ON", "off": "OFF" } }
                    }
                }
            }
        }
    }"#;

    #[test]
    fn extensions_merge_into_buckets() {
        let catalog = SchemaCatalog::from_json(SCHEMA).unwrap();
        let node = catalog.node("WSDCGQ11LM").unwrap();

        insta::assert_json_snapshot!(node, @r#"
        {
          "name": "Aqara temperature sensor",
          "sensors": [
            {
              "id": "temperature",
              "dataType": "float",
              "unit": "C"
            }
          ],
          "telemetry": [
            {
              "id": "battery",
              "dataType": "integer"
            },
            {
              "id": "voltage",
              "unit": "mV"
            }
          ],
          "options": [
            {
              "id": "led",
              "settable": true,
              "dataTypeBridge": {
                "type": "boolean",
                "on": "ON",
                "off": "OFF"
              }
            }
          ],
          "ignoreSensors": [
            "pressure"
          ]
        }
        "#);
    }

    #[test]
    fn lookup_prefers_sensors_then_telemetry_then_options() {
        let mut schema = NodeSchema::default();
        let entry = |id: &str, data_type| SchemaProperty {
            id: id.into(),
            attributes: AttributePatch {
                data_type: Some(data_type),
                ..AttributePatch::default()
            },
            data_type_bridge: None,
        };
        schema.options.push(entry("state", DataType::Boolean));
        schema.telemetry.push(entry("state", DataType::String));

        let (kind, found) = schema.lookup("state").unwrap();
        assert_eq!(kind, PropertyKind::Telemetry);
        assert_eq!(found.attributes.data_type, Some(DataType::String));
        assert!(schema.lookup("missing").is_none());
    }

    #[test]
    fn yaml_and_json_agree() {
        let yaml = r#"
nodes:
  WSDCGQ11LM:
    name: Aqara temperature sensor
    sensors:
      - id: temperature
        unit: "C"
    telemetry:
      - id: battery
        dataType: integer
    ignoreSensors: [pressure]
    extensions:
      mapping:
        temperature: { dataType: float, unit: K }
        $telemetry/voltage: { unit: mV }
        $options/led:
          settable: "true"
          dataTypeBridge: { type: boolean, "on": "ON", "off": "OFF" }
"#;
        let from_yaml = SchemaCatalog::from_yaml(yaml).unwrap();
        let from_json = SchemaCatalog::from_json(SCHEMA).unwrap();
        pretty_assertions::assert_eq!(from_yaml.node("WSDCGQ11LM"), from_json.node("WSDCGQ11LM"));
        assert!(from_yaml.node("WSDCGQ11LM").unwrap().ignores("pressure"));
    }

    #[test]
    fn malformed_entries_name_the_model() {
        let err = SchemaCatalog::from_json(r#"{"nodes": {"X1": {"sensors": [{"name": "no id"}]}}}"#).unwrap_err();
        assert!(err.to_string().contains("model 'X1'"), "{err}");
    }

    #[test]
    fn files_are_picked_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.json");
        std::fs::write(&path, SCHEMA).unwrap();
        assert_eq!(SchemaCatalog::load(&path).unwrap().len(), 1);
    }
}
