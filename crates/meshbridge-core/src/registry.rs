// ── Device registry ──
//
// Maps device identities to nodes and drives them from bus events.
// Also owns the bridge device's own properties (ip, permitjoin,
// soft-reset). Attach subscribes to the bus; detach drops the
// subscription and unbinds every property.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use indexmap::IndexMap;
use meshbridge_api::{Device, EventKind, FieldValue, Identity, InterviewStatus, ReportTrigger};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::controls::{PermitJoinControl, SoftResetControl};
use crate::event::{BridgeEvent, EventBus};
use crate::model::{ModelUpdate, NodeRecord, Owner};
use crate::node::{EngineContext, Node};
use crate::parser::Parser;
use crate::property::{Attributes, DataType, Property, PropertyKind, PropertySpec, Transport};
use crate::setup::DeviceSetup;
use crate::supervisor::Supervisor;

/// Cheaply cloneable handle to the node registry.
#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    ctx: Arc<EngineContext>,
    supervisor: Supervisor,
    setup: DeviceSetup,
    bus: EventBus,
    nodes: DashMap<Identity, Arc<Node>>,
    bridge_properties: IndexMap<String, Arc<Property>>,
    model_synced: watch::Sender<bool>,
    attachment: Mutex<Option<Attachment>>,
}

struct Attachment {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl DeviceRegistry {
    pub fn new(
        config: &BridgeConfig,
        ctx: Arc<EngineContext>,
        model_synced: watch::Sender<bool>,
        supervisor: Supervisor,
        bus: EventBus,
    ) -> Self {
        let setup = DeviceSetup::new(
            config.configure_timeout,
            Arc::clone(&ctx.converters),
            Arc::clone(&ctx.overrides),
            supervisor.clone(),
        );
        let bridge_properties = bridge_properties(config, &ctx, &supervisor);

        Self {
            inner: Arc::new(RegistryInner {
                ctx,
                supervisor,
                setup,
                bus,
                nodes: DashMap::new(),
                bridge_properties,
                model_synced,
                attachment: Mutex::new(None),
            }),
        }
    }

    // ── Attach / detach ──────────────────────────────────────────────

    /// Publish the bridge device and start consuming bus events. Idempotent.
    pub async fn attach(&self) {
        let mut attachment = self.inner.attachment.lock().await;
        if attachment.is_some() {
            return;
        }

        for (kind, property) in self.bridge_properties() {
            self.inner.ctx.publisher.publish(ModelUpdate::PropertyAdded {
                owner: Owner::Device,
                kind,
                property: property.id().to_owned(),
            });
            property.publish_attributes();
            if let Some(value) = property.value() {
                self.inner.ctx.publisher.publish(ModelUpdate::ValueChanged {
                    owner: Owner::Device,
                    property: property.id().to_owned(),
                    value,
                });
            }
        }

        let cancel = CancellationToken::new();
        let rx = self.inner.bus.subscribe();
        let handle = tokio::spawn(event_loop_task(self.clone(), rx, cancel.clone()));
        *attachment = Some(Attachment { cancel, handle });
        debug!("device registry attached");
    }

    /// Stop consuming events and unbind every property.
    pub async fn detach(&self) {
        let attachment = self.inner.attachment.lock().await.take();
        if let Some(Attachment { cancel, handle }) = attachment {
            cancel.cancel();
            let _ = handle.await;
        }
        for property in self.inner.bridge_properties.values() {
            property.detach();
        }
        for node in self.nodes() {
            node.detach_all();
        }
        debug!("device registry detached");
    }

    // ── Nodes ────────────────────────────────────────────────────────

    /// Adopt the device model's persisted nodes.
    pub fn load_records(&self, records: Vec<NodeRecord>) {
        for record in records {
            let id = record.id.clone();
            let node = Node::persisted(record, Arc::clone(&self.inner.ctx));
            self.inner.nodes.insert(id, node);
        }
    }

    pub fn node(&self, identity: &Identity) -> Option<Arc<Node>> {
        self.inner.nodes.get(identity).map(|n| Arc::clone(&n))
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.inner.nodes.iter().map(|n| Arc::clone(n.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.nodes.is_empty()
    }

    /// Resolve the node for `device`, creating or rebuilding it as needed.
    ///
    /// A live bridge node is reused. A deleted node is replaced by a
    /// fresh one. A persisted-only node is unbound and rebuilt from its
    /// record so that no property survives across transports.
    pub fn find_or_add(&self, device: &Device) -> Arc<Node> {
        let ctx = &self.inner.ctx;
        match self.inner.nodes.entry(device.identity.clone()) {
            Entry::Occupied(mut slot) => {
                let current = Arc::clone(slot.get());
                if current.is_bridged() && !current.is_deleted() {
                    current.set_device(device.clone());
                    return current;
                }
                let record = if current.is_deleted() {
                    info!(identity = %device.identity, "replacing deleted node");
                    ctx.publisher.publish(ModelUpdate::NodeAdded {
                        node: device.identity.clone(),
                    });
                    NodeRecord::new(device.identity.clone())
                } else {
                    debug!(identity = %device.identity, "rebuilding persisted node");
                    current.snapshot()
                };
                current.detach_all();
                let node = Node::bridged(device.clone(), record, Arc::clone(ctx));
                slot.insert(Arc::clone(&node));
                node
            }
            Entry::Vacant(slot) => {
                info!(identity = %device.identity, "adding node");
                ctx.publisher.publish(ModelUpdate::NodeAdded {
                    node: device.identity.clone(),
                });
                let node = Node::bridged(device.clone(), NodeRecord::new(device.identity.clone()), Arc::clone(ctx));
                slot.insert(Arc::clone(&node));
                node
            }
        }
    }

    /// Drop a node and forget its configured marker.
    pub fn remove_node(&self, identity: &Identity) -> Option<Arc<Node>> {
        let (_, node) = self.inner.nodes.remove(identity)?;
        node.detach_all();
        self.inner.ctx.publisher.publish(ModelUpdate::NodeRemoved {
            node: identity.clone(),
        });
        if let Err(e) = self.inner.ctx.overrides.clear_configured(identity) {
            warn!(identity = %identity, error = %e, "could not clear configured marker");
        }
        info!(identity = %identity, "removed node");
        Some(node)
    }

    /// Re-run configure for every live node.
    ///
    /// Used after the event loop missed bus events: whatever joined or
    /// announced in the gap still gets configured.
    pub fn resync(&self) {
        for node in self.nodes() {
            if !node.is_bridged() || node.is_deleted() {
                continue;
            }
            if let Some(device) = node.device() {
                self.spawn_configure(&device);
            }
        }
    }

    // ── Bridge device ────────────────────────────────────────────────

    pub fn bridge_property(&self, id: &str) -> Option<Arc<Property>> {
        self.inner.bridge_properties.get(id).cloned()
    }

    pub fn bridge_properties(&self) -> Vec<(PropertyKind, Arc<Property>)> {
        self.inner
            .bridge_properties
            .values()
            .map(|p| (p.kind(), Arc::clone(p)))
            .collect()
    }

    pub fn setup(&self) -> &DeviceSetup {
        &self.inner.setup
    }

    pub fn mark_model_synced(&self) {
        self.inner.model_synced.send_replace(true);
    }

    fn set_device_connected(&self, connected: bool) {
        self.inner
            .ctx
            .publisher
            .publish(ModelUpdate::DeviceConnected { connected });
    }

    // ── Event handling ───────────────────────────────────────────────

    async fn handle(&self, event: &BridgeEvent) {
        match event {
            BridgeEvent::Started => self.on_link_started(),
            BridgeEvent::Stopped => self.set_device_connected(false),
            BridgeEvent::PermitJoin(permitted) => {
                if let Some(property) = self.bridge_property("permitjoin") {
                    property.receive(&FieldValue::Bool(*permitted));
                }
            }
            BridgeEvent::DeviceLeave { identity } => {
                let device = self.node(identity).and_then(|n| n.device());
                if let Some(device) = &device {
                    self.run_hooks(EventKind::DeviceLeave, device);
                }
                match self.node(identity) {
                    Some(node) if node.is_bridged() => node.set_connected(Some(false)),
                    _ => debug!(identity = %identity, "leave from unknown device"),
                }
            }
            BridgeEvent::DeviceJoined { device } => {
                self.run_hooks(EventKind::DeviceJoined, device);
                if let Err(e) = self.inner.ctx.overrides.clear_configured(&device.identity) {
                    warn!(identity = %device.identity, error = %e, "could not clear configured marker");
                }
                self.spawn_configure(device);
                let node = self.find_or_add(device);
                node.set_connected(interview_connected(device));
            }
            BridgeEvent::DeviceInterview { status, device } => {
                self.run_hooks(EventKind::DeviceInterview, device);
                self.spawn_configure(device);
                if *status == InterviewStatus::Failed {
                    warn!(identity = %device.identity, "interview failed, removing device");
                    self.remove_node(&device.identity);
                    self.spawn_remove_device(device.identity.clone());
                } else {
                    info!(identity = %device.identity, %status, "interview progressed");
                    let node = self.find_or_add(device);
                    node.set_connected(interview_connected(device));
                }
            }
            BridgeEvent::DeviceAnnounce { device } => {
                self.run_hooks(EventKind::DeviceAnnounce, device);
                self.spawn_configure(device);
                let node = self.find_or_add(device);
                self.spawn_reporting(device, Some(ReportTrigger::DeviceAnnounce));
                node.set_connected(interview_connected(device));
            }
            BridgeEvent::Message { message, mapped } => {
                self.run_hooks(EventKind::Message, &message.device);
                self.spawn_configure(&message.device);
                let node = self.find_or_add(&message.device);
                node.handle_message(message, mapped);
            }
            BridgeEvent::NodeDeleted { node_id } => self.on_node_deleted(node_id).await,
            BridgeEvent::StartError(_) | BridgeEvent::LinkError(_) | BridgeEvent::Exit { .. } => {}
        }
    }

    fn on_link_started(&self) {
        info!("link started, refreshing devices");
        self.set_device_connected(true);
        self.inner.setup.clear_failed();

        let Some(coordinator) = self.inner.supervisor.coordinator() else {
            return;
        };
        let own = coordinator.coordinator().map(|d| d.identity);
        let devices: Vec<Device> = coordinator
            .devices()
            .into_iter()
            .filter(|d| Some(&d.identity) != own.as_ref())
            .collect();

        let mut nodes = Vec::with_capacity(devices.len());
        for device in &devices {
            nodes.push(self.find_or_add(device));
        }

        let registry = self.clone();
        tokio::spawn(async move {
            let passes = devices.iter().zip(&nodes).map(|(device, node)| {
                let registry = registry.clone();
                async move {
                    registry.inner.setup.configure_if_needed(device).await;
                    if let Err(e) = registry.inner.setup.setup_reporting_if_needed(device, None).await {
                        warn!(identity = %device.identity, error = %e, "reporting setup failed");
                    }
                    node.set_connected(Some(true));
                }
            });
            futures_util::future::join_all(passes).await;
        });

        for node in self.nodes() {
            node.pull_protocol();
        }
        if let Some(permitjoin) = self.bridge_property("permitjoin") {
            permitjoin.spawn_pull();
        }
    }

    async fn on_node_deleted(&self, identity: &Identity) {
        if let Some(coordinator) = self.inner.supervisor.coordinator() {
            if let Err(e) = coordinator.remove_device(identity).await {
                warn!(identity = %identity, error = %e, "could not remove device from coordinator");
            }
        }
        self.remove_node(identity);
    }

    /// Registry-wide hook first, then the model's own.
    fn run_hooks(&self, kind: EventKind, device: &Device) {
        let converters = &self.inner.ctx.converters;
        if let Err(e) = converters.on_event(kind, device) {
            warn!(identity = %device.identity, %kind, error = %e, "event hook failed");
        }
        let hook = converters.find_by_device(device).and_then(|m| m.on_event.clone());
        if let Some(hook) = hook {
            if let Err(e) = hook.on_event(kind, device) {
                warn!(identity = %device.identity, %kind, error = %e, "model event hook failed");
            }
        }
    }

    fn spawn_configure(&self, device: &Device) {
        let registry = self.clone();
        let device = device.clone();
        tokio::spawn(async move {
            registry.inner.setup.configure_if_needed(&device).await;
        });
    }

    fn spawn_reporting(&self, device: &Device, trigger: Option<ReportTrigger>) {
        let registry = self.clone();
        let device = device.clone();
        tokio::spawn(async move {
            if let Err(e) = registry.inner.setup.setup_reporting_if_needed(&device, trigger).await {
                warn!(identity = %device.identity, error = %e, "reporting setup failed");
            }
        });
    }

    fn spawn_remove_device(&self, identity: Identity) {
        let Some(coordinator) = self.inner.supervisor.coordinator() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = coordinator.remove_device(&identity).await {
                warn!(identity = %identity, error = %e, "could not remove device from coordinator");
            }
        });
    }

    pub(crate) fn bus(&self) -> &EventBus {
        &self.inner.bus
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("nodes", &self.inner.nodes.len())
            .field("bridge_properties", &self.inner.bridge_properties.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// `Some(true)` once the interview completed, unknown before that.
fn interview_connected(device: &Device) -> Option<bool> {
    device.interview_completed.then_some(true)
}

async fn event_loop_task(
    registry: DeviceRegistry,
    mut rx: broadcast::Receiver<Arc<BridgeEvent>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Ok(event) => registry.handle(&event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "registry fell behind the event bus, resyncing nodes");
                    registry.resync();
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

// ── Bridge device properties ─────────────────────────────────────────

fn bridge_properties(
    config: &BridgeConfig,
    ctx: &EngineContext,
    supervisor: &Supervisor,
) -> IndexMap<String, Arc<Property>> {
    let build = |id: &str, kind, attributes, value, parser, transport| {
        Property::new(
            PropertySpec {
                id: id.to_owned(),
                owner: Owner::Device,
                kind,
                attributes,
                value,
                wire: None,
                parser,
                transport,
            },
            ctx.publisher.clone(),
            None,
        )
    };

    let mut properties = IndexMap::new();

    if let Some(ip) = &config.connection_ip {
        let attributes = Attributes::named("Ip address");
        properties.insert(
            "ip".to_owned(),
            build("ip", PropertyKind::Telemetry, attributes, Some(ip.clone()), None, Transport::Record),
        );
    }

    let mut permitjoin = Attributes::named("Permit Join");
    permitjoin.settable = true;
    permitjoin.data_type = DataType::Boolean;
    properties.insert(
        "permitjoin".to_owned(),
        build(
            "permitjoin",
            PropertyKind::Option,
            permitjoin,
            None,
            Some(Parser::boolean(None, None)),
            Transport::Custom(Arc::new(PermitJoinControl::new(supervisor.clone()))),
        ),
    );

    let mut soft_reset = Attributes::named("Soft reset");
    soft_reset.settable = true;
    soft_reset.retained = false;
    soft_reset.data_type = DataType::Boolean;
    properties.insert(
        "soft-reset".to_owned(),
        build(
            "soft-reset",
            PropertyKind::Option,
            soft_reset,
            None,
            Some(Parser::boolean(None, None)),
            Transport::Custom(Arc::new(SoftResetControl::new(supervisor.clone()))),
        ),
    );

    properties
}
