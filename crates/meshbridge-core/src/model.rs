// ── Device-model boundary ──
//
// Updates flowing out to the pub/sub device model, and the persisted
// node records it hands back at startup.

use indexmap::IndexMap;
use meshbridge_api::Identity;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::property::{AttributePatch, PropertyKind};

const UPDATE_CAPACITY: usize = 1024;

/// Who owns a property: the bridge device itself or one of its nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Owner {
    Device,
    Node(Identity),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelUpdate {
    // ── Nodes ────────────────────────────────────────────────────────
    NodeAdded { node: Identity },
    NodeRemoved { node: Identity },
    NodeAttribute {
        node: Identity,
        attribute: String,
        value: String,
    },
    /// `None` means "joined, interview not completed yet".
    NodeConnected { node: Identity, connected: Option<bool> },
    DeviceConnected { connected: bool },

    // ── Properties ───────────────────────────────────────────────────
    PropertyAdded {
        owner: Owner,
        kind: PropertyKind,
        property: String,
    },
    PropertyRemoved {
        owner: Owner,
        kind: PropertyKind,
        property: String,
    },
    PropertyAttribute {
        owner: Owner,
        property: String,
        attribute: &'static str,
        value: String,
    },
    ValueChanged {
        owner: Owner,
        property: String,
        value: String,
    },
}

/// Cloneable handle for publishing to the device model.
#[derive(Debug, Clone)]
pub struct ModelPublisher {
    tx: broadcast::Sender<ModelUpdate>,
}

impl ModelPublisher {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(UPDATE_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, update: ModelUpdate) {
        let _ = self.tx.send(update);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ModelUpdate> {
        self.tx.subscribe()
    }
}

impl Default for ModelPublisher {
    fn default() -> Self {
        Self::new()
    }
}

// ── Persisted records ───────────────────────────────────────────────

/// A node as the device model last persisted it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: Identity,
    #[serde(default)]
    pub attributes: IndexMap<String, String>,
    #[serde(default)]
    pub sensors: Vec<PropertyRecord>,
    #[serde(default)]
    pub telemetry: Vec<PropertyRecord>,
    #[serde(default)]
    pub options: Vec<PropertyRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertyRecord {
    pub id: String,
    #[serde(default)]
    pub attributes: AttributePatch,
    #[serde(default)]
    pub value: Option<String>,
}

impl NodeRecord {
    pub fn new(id: Identity) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    pub fn bucket(&self, kind: PropertyKind) -> &[PropertyRecord] {
        match kind {
            PropertyKind::Sensor => &self.sensors,
            PropertyKind::Telemetry => &self.telemetry,
            PropertyKind::Option => &self.options,
        }
    }

    pub fn property(&self, kind: PropertyKind, id: &str) -> Option<&PropertyRecord> {
        self.bucket(kind).iter().find(|p| p.id == id)
    }

    /// Every record with the bucket it came from.
    pub fn properties(&self) -> impl Iterator<Item = (PropertyKind, &PropertyRecord)> {
        self.sensors
            .iter()
            .map(|p| (PropertyKind::Sensor, p))
            .chain(self.options.iter().map(|p| (PropertyKind::Option, p)))
            .chain(self.telemetry.iter().map(|p| (PropertyKind::Telemetry, p)))
    }
}
