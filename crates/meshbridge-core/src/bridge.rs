// ── Bridge facade ──
//
// Wires the supervisor, the device registry and the device-model
// publisher together and exposes what an embedding device model needs:
// lifecycle, update streams and property get/set by owner.

use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use meshbridge_api::{ClassificationSource, ConverterRegistry, CoordinatorFactory, Identity};
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tracing::{info, warn};

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::event::{BridgeEvent, EventBus};
use crate::model::{ModelPublisher, ModelUpdate, NodeRecord, Owner};
use crate::node::{EngineContext, Node};
use crate::overrides::OverrideStore;
use crate::property::Property;
use crate::registry::DeviceRegistry;
use crate::schema::SchemaCatalog;
use crate::supervisor::{LinkState, Supervisor};

/// Collaborators and persisted state a [`Bridge`] is built from.
pub struct BridgeParts {
    pub config: BridgeConfig,
    pub factory: Arc<dyn CoordinatorFactory>,
    pub converters: Arc<dyn ConverterRegistry>,
    pub classification: Arc<dyn ClassificationSource>,
    pub schema: SchemaCatalog,
    pub overrides: OverrideStore,
    /// Nodes the device model persisted last run.
    pub records: Vec<NodeRecord>,
}

/// Cheaply cloneable handle to a running bridge.
#[derive(Clone)]
pub struct Bridge {
    supervisor: Supervisor,
    registry: DeviceRegistry,
    publisher: ModelPublisher,
}

impl Bridge {
    pub fn new(parts: BridgeParts) -> Self {
        let BridgeParts {
            config,
            factory,
            converters,
            classification,
            schema,
            overrides,
            records,
        } = parts;

        let bus = EventBus::new();
        let publisher = ModelPublisher::new();
        let supervisor = Supervisor::new(config.clone(), factory, Arc::clone(&converters), bus.clone());
        let (model_synced_tx, model_synced) = watch::channel(false);

        let ctx = Arc::new(EngineContext {
            converters,
            classification,
            schema: Arc::new(schema),
            overrides: Arc::new(overrides),
            publisher: publisher.clone(),
            link: supervisor.link_state(),
            model_synced,
        });
        let registry = DeviceRegistry::new(&config, ctx, model_synced_tx, supervisor.clone(), bus);
        registry.load_records(records);

        Self {
            supervisor,
            registry,
            publisher,
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Attach the registry and bring the link up. A failed start is
    /// retried in the background.
    pub async fn init(&self) {
        info!(nodes = self.registry.len(), "initializing bridge");
        self.registry.attach().await;
        self.supervisor.start().await;
    }

    /// Stop the link and detach every property.
    pub async fn destroy(&self) {
        info!("destroying bridge");
        self.supervisor.shutdown().await;
        self.registry.detach().await;
    }

    /// The device model finished its initial sync; shadow options may
    /// now mirror their values.
    pub fn mark_model_synced(&self) {
        self.registry.mark_model_synced();
    }

    // ── Observation ──────────────────────────────────────────────────

    pub fn updates(&self) -> broadcast::Receiver<ModelUpdate> {
        self.publisher.subscribe()
    }

    /// Device-model updates as a stream. Lagged updates are dropped with
    /// a warning.
    pub fn update_stream(&self) -> impl Stream<Item = ModelUpdate> + Send + 'static {
        BroadcastStream::new(self.publisher.subscribe()).filter_map(|update| async move {
            match update {
                Ok(update) => Some(update),
                Err(e) => {
                    warn!(error = %e, "device model update stream lagged");
                    None
                }
            }
        })
    }

    pub fn link_state_stream(&self) -> WatchStream<LinkState> {
        WatchStream::new(self.supervisor.link_state())
    }

    pub fn events(&self) -> broadcast::Receiver<Arc<BridgeEvent>> {
        self.supervisor.events()
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn node(&self, identity: &Identity) -> Option<Arc<Node>> {
        self.registry.node(identity)
    }

    // ── Device-model requests ────────────────────────────────────────

    pub async fn get_property(&self, owner: &Owner, property: &str) -> Result<Option<String>, BridgeError> {
        self.resolve(owner, property)?.get().await
    }

    pub async fn set_property(&self, owner: &Owner, property: &str, value: &str) -> Result<(), BridgeError> {
        self.resolve(owner, property)?.set(value).await
    }

    /// The device model deleted a node: forget it here and on the
    /// coordinator.
    pub fn delete_node(&self, identity: &Identity) -> Result<(), BridgeError> {
        let node = self.registry.node(identity).ok_or_else(|| BridgeError::NodeNotFound {
            identity: identity.to_string(),
        })?;
        node.mark_deleted();
        self.registry.bus().emit(BridgeEvent::NodeDeleted {
            node_id: identity.clone(),
        });
        Ok(())
    }

    fn resolve(&self, owner: &Owner, property: &str) -> Result<Arc<Property>, BridgeError> {
        let found = match owner {
            Owner::Device => self.registry.bridge_property(property),
            Owner::Node(identity) => self.registry.node(identity).and_then(|n| n.property(property)),
        };
        found.ok_or_else(|| BridgeError::PropertyNotFound {
            property: property.to_owned(),
        })
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("supervisor", &self.supervisor)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
