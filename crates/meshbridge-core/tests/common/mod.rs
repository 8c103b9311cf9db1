#![allow(clippy::unwrap_used, dead_code)]
// Shared harness: a bridge wired to the in-memory coordinator.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use meshbridge_api::{Classification, DecodeOptions, Error, FieldMap, FieldValue, Message};
use meshbridge_core::testing::{FakeCoordinator, FakeFactory, StaticRegistry, payload_fields};
use meshbridge_core::{Bridge, BridgeConfig, BridgeEvent, BridgeParts, NodeRecord, OverrideStore, SchemaCatalog};
use tokio::sync::broadcast;

pub const SENSOR: &str = "0x00158d0001a2b3c4";
pub const WEATHER_MODEL: &str = "lumi.weather";

// ── Harness ─────────────────────────────────────────────────────────

pub struct Harness {
    pub bridge: Bridge,
    pub coordinator: Arc<FakeCoordinator>,
    pub factory: Arc<FakeFactory>,
    pub converters: Arc<StaticRegistry>,
}

pub struct Setup {
    pub config: BridgeConfig,
    pub converters: StaticRegistry,
    pub classification: HashMap<String, Vec<Classification>>,
    pub schema: SchemaCatalog,
    pub records: Vec<NodeRecord>,
}

impl Setup {
    pub fn new(converters: StaticRegistry) -> Self {
        Self {
            config: BridgeConfig::default(),
            converters,
            classification: HashMap::new(),
            schema: SchemaCatalog::empty(),
            records: Vec::new(),
        }
    }

    pub fn build(self) -> Harness {
        let coordinator = FakeCoordinator::new();
        let factory = FakeFactory::new(Arc::clone(&coordinator));
        let converters = Arc::new(self.converters);
        let bridge = Bridge::new(BridgeParts {
            config: self.config,
            factory: Arc::clone(&factory) as _,
            converters: Arc::clone(&converters) as _,
            classification: Arc::new(self.classification),
            schema: self.schema,
            overrides: OverrideStore::in_memory(),
            records: self.records,
        });
        Harness {
            bridge,
            coordinator,
            factory,
            converters,
        }
    }
}

/// Build and start a bridge over `converters` with default settings.
pub async fn started(converters: StaticRegistry) -> Harness {
    let harness = Setup::new(converters).build();
    harness.bridge.init().await;
    assert!(harness.bridge.supervisor().is_started());
    harness
}

// ── Waiting ─────────────────────────────────────────────────────────

/// Poll `check` until it holds. Panics after roughly two seconds.
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Next bus event matching `wanted`.
pub async fn next_event(
    rx: &mut broadcast::Receiver<Arc<BridgeEvent>>,
    wanted: impl Fn(&BridgeEvent) -> bool,
) -> Arc<BridgeEvent> {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = rx.recv().await.unwrap();
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap()
}

// ── Decoders ────────────────────────────────────────────────────────

pub fn passthrough(message: &Message, _options: &DecodeOptions) -> Result<FieldMap, Error> {
    Ok(payload_fields(message))
}

/// Applies the `temperature_calibration` option the way real converters do.
pub fn calibrated(message: &Message, options: &DecodeOptions) -> Result<FieldMap, Error> {
    let mut fields = payload_fields(message);
    if let Some(raw) = fields.get("temperature").and_then(FieldValue::as_f64) {
        let offset = options.calibration("temperature").unwrap_or(0.0);
        fields.insert("temperature".into(), FieldValue::Number(raw + offset));
    }
    Ok(fields)
}
