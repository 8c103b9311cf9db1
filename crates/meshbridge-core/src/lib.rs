//! Bridge core between a mesh-network coordinator and a pub/sub device model.
//!
//! This crate owns the coordinator link, the device → node mapping and the
//! property reconciliation that turns raw coordinator traffic into typed,
//! settable values:
//!
//! - **[`Supervisor`]** — Owns the coordinator link. Start, stop and soft
//!   reset are serialized through a command processor task; failed starts
//!   are retried and a silent link is soft-reset by an idle watchdog.
//!
//! - **[`DeviceRegistry`]** — Subscribes to the internal [`EventBus`] and
//!   keeps one [`Node`] per device identity, rebuilding persisted nodes once
//!   their device shows up. Also owns the bridge device's own `ip`,
//!   `permitjoin` and `soft-reset` properties.
//!
//! - **[`Node`] / [`Property`]** — Resolve a device model's properties from
//!   its converter tables, the static [`SchemaCatalog`], classification hints
//!   and persisted [`OverrideStore`] patches, then bind each one to a
//!   transport (protocol encoder, local shadow, bridge control or record).
//!
//! - **[`Bridge`]** — Facade wiring everything together for an embedding
//!   device model: lifecycle, [`ModelUpdate`] streams and get/set by owner.

pub mod bridge;
pub mod config;
pub mod controls;
pub mod error;
pub mod event;
pub mod model;
pub mod naming;
pub mod node;
pub mod overrides;
pub mod parser;
pub mod pipeline;
pub mod property;
pub mod registry;
pub mod schema;
pub mod setup;
pub mod supervisor;

#[cfg(feature = "testing")]
pub mod testing;

// ── Primary re-exports ──────────────────────────────────────────────
pub use bridge::{Bridge, BridgeParts};
pub use config::BridgeConfig;
pub use error::BridgeError;
pub use event::{BridgeEvent, EventBus};
pub use model::{ModelPublisher, ModelUpdate, NodeRecord, Owner, PropertyRecord};
pub use node::{EngineContext, Node, PropertyRequest};
pub use overrides::OverrideStore;
pub use parser::{Parser, ParserSpec};
pub use property::{AttributePatch, Attributes, DataType, Property, PropertyKind, TransportKind};
pub use registry::DeviceRegistry;
pub use schema::{NodeSchema, SchemaCatalog, SchemaProperty};
pub use setup::{ConfigureOutcome, DeviceSetup};
pub use supervisor::{LinkState, Supervisor};
