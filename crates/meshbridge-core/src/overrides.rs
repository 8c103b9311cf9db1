// ── Persisted per-device overrides ──
//
// One record per device identity: the data type last forced by wire
// samples for each property, plus the configure key the device was last
// configured under. Loaded once, rewritten wholesale on every change.
// The rewrite is a plain `fs::write`, so a crash mid-write can leave a
// truncated file behind.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use meshbridge_api::{FieldValue, Identity};
use serde::{Deserialize, Serialize};
use serde_json::ser::PrettyFormatter;
use tracing::debug;

use crate::error::BridgeError;
use crate::property::{AttributePatch, DataType};

#[derive(Debug, Default, Serialize, Deserialize)]
struct OverrideFile {
    #[serde(default)]
    devices: BTreeMap<Identity, DeviceOverrides>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configured: Option<u32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, AttributePatch>,
}

#[derive(Debug)]
pub struct OverrideStore {
    path: Option<PathBuf>,
    devices: DashMap<Identity, DeviceOverrides>,
    write_lock: std::sync::Mutex<()>,
}

impl OverrideStore {
    /// Load from `path`, creating an empty file if none exists yet.
    ///
    /// A file that exists but does not parse is an error, not an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, BridgeError> {
        let path = path.into();
        let file = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            if raw.trim().is_empty() {
                OverrideFile::default()
            } else {
                serde_json::from_str(&raw)?
            }
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let file = OverrideFile::default();
            std::fs::write(&path, render(&file)?)?;
            debug!(path = %path.display(), "created override store");
            file
        };

        Ok(Self {
            path: Some(path),
            devices: file.devices.into_iter().collect(),
            write_lock: std::sync::Mutex::new(()),
        })
    }

    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            devices: DashMap::new(),
            write_lock: std::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn device(&self, identity: &Identity) -> Option<DeviceOverrides> {
        self.devices.get(identity).map(|d| d.clone())
    }

    // ── Configured marker ────────────────────────────────────────────

    pub fn configured(&self, identity: &Identity) -> Option<u32> {
        self.devices.get(identity).and_then(|d| d.configured)
    }

    pub fn set_configured(&self, identity: &Identity, key: u32) -> Result<(), BridgeError> {
        {
            let mut entry = self.devices.entry(identity.clone()).or_default();
            if entry.configured == Some(key) {
                return Ok(());
            }
            entry.configured = Some(key);
        }
        self.save()
    }

    pub fn clear_configured(&self, identity: &Identity) -> Result<(), BridgeError> {
        let changed = self
            .devices
            .get_mut(identity)
            .is_some_and(|mut d| d.configured.take().is_some());
        if changed { self.save() } else { Ok(()) }
    }

    // ── Property overrides ───────────────────────────────────────────

    pub fn patch(&self, identity: &Identity, property: &str) -> AttributePatch {
        self.devices
            .get(identity)
            .and_then(|d| d.properties.get(property).cloned())
            .unwrap_or_default()
    }

    /// Record a wire sample for `property`.
    ///
    /// Numeric samples force the override to `float`. Returns the data
    /// type the override now carries, if any.
    pub fn note_sample(
        &self,
        identity: &Identity,
        property: &str,
        sample: &FieldValue,
    ) -> Result<Option<DataType>, BridgeError> {
        let (data_type, changed) = {
            let mut entry = self.devices.entry(identity.clone()).or_default();
            let patch = entry.properties.entry(property.to_owned()).or_default();
            let changed = sample.is_number() && patch.data_type != Some(DataType::Float);
            if changed {
                patch.data_type = Some(DataType::Float);
            }
            (patch.data_type, changed)
        };
        if changed {
            self.save()?;
        }
        Ok(data_type)
    }

    pub fn forget(&self, identity: &Identity) -> Result<(), BridgeError> {
        if self.devices.remove(identity).is_some() {
            self.save()?;
        }
        Ok(())
    }

    fn save(&self) -> Result<(), BridgeError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let file = OverrideFile {
            devices: self
                .devices
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        };
        std::fs::write(path, render(&file)?)?;
        Ok(())
    }
}

fn render(file: &OverrideFile) -> Result<Vec<u8>, BridgeError> {
    let mut out = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(b"    "));
    file.serialize(&mut ser)?;
    Ok(out)
}
