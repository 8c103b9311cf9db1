// ── Nodes ──
//
// One node per device identity. A node owns three insertion-ordered
// buckets of properties and reconciles them against the converter
// tables, the static schema, the classification source and whatever the
// device model persisted last time.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use indexmap::IndexMap;
use meshbridge_api::{
    Classification, ClassificationSource, Component, ConverterRegistry, DecodeOptions, Device,
    FieldValue, Identity, MappedDevice, Message,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::model::{ModelPublisher, ModelUpdate, NodeRecord, Owner, PropertyRecord};
use crate::naming::{
    OptionKind, TELEMETRY_IDS, display_name, id2key, is_option_base, key2id, option_id,
    parse_option_id, split_endpoint_postfix,
};
use crate::overrides::OverrideStore;
use crate::parser::Parser;
use crate::pipeline;
use crate::property::{
    AttributePatch, Attributes, DataType, PropertyKind, PropertySpec, ProtocolTransport, Property,
    ShadowTransport, Transport, TransportKind,
};
use crate::schema::{SchemaCatalog, SchemaProperty};
use crate::supervisor::LinkState;

/// Fields whose values are events, not state.
const NON_RETAINED: [&str; 4] = ["click", "action", "side", "angle"];
const PRECISION_CHOICES: [&str; 3] = ["0", "1", "2"];

/// Services every node resolves its properties against.
pub struct EngineContext {
    pub converters: Arc<dyn ConverterRegistry>,
    pub classification: Arc<dyn ClassificationSource>,
    pub schema: Arc<SchemaCatalog>,
    pub overrides: Arc<OverrideStore>,
    pub publisher: ModelPublisher,
    pub link: watch::Receiver<LinkState>,
    /// Flips to `true` once the device model finished its initial sync.
    pub model_synced: watch::Receiver<bool>,
}

impl EngineContext {
    fn link_started(&self) -> bool {
        *self.link.borrow() == LinkState::Started
    }
}

/// Optional inputs to [`Node::get_or_create`].
#[derive(Debug, Clone, Default)]
pub struct PropertyRequest {
    /// Bucket the caller expects; schema and telemetry rules may override it.
    pub kind: Option<PropertyKind>,
    /// A fresh wire sample that triggered the call.
    pub value: Option<FieldValue>,
    /// Schema entry to use instead of looking the id up.
    pub mapping: Option<SchemaProperty>,
    pub classification: Option<Classification>,
    pub settable: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Binding {
    /// Built from a coordinator device.
    Bridge,
    /// Only known from the device model's persisted record.
    Persisted,
}

type Bucket = IndexMap<String, Arc<Property>>;

struct NodeState {
    binding: Binding,
    device: Option<Device>,
    model_id: Option<String>,
    mapped: Option<Arc<MappedDevice>>,
    record: NodeRecord,
    sensors: Bucket,
    telemetry: Bucket,
    options: Bucket,
    deleted: bool,
    connected: Option<bool>,
}

impl NodeState {
    fn bucket(&self, kind: PropertyKind) -> &Bucket {
        match kind {
            PropertyKind::Sensor => &self.sensors,
            PropertyKind::Telemetry => &self.telemetry,
            PropertyKind::Option => &self.options,
        }
    }

    fn bucket_mut(&mut self, kind: PropertyKind) -> &mut Bucket {
        match kind {
            PropertyKind::Sensor => &mut self.sensors,
            PropertyKind::Telemetry => &mut self.telemetry,
            PropertyKind::Option => &mut self.options,
        }
    }

    fn find(&self, id: &str) -> Option<Arc<Property>> {
        [PropertyKind::Sensor, PropertyKind::Telemetry, PropertyKind::Option]
            .into_iter()
            .find_map(|kind| self.bucket(kind).get(id).cloned())
    }

    fn all(&self) -> impl Iterator<Item = &Arc<Property>> {
        self.sensors
            .values()
            .chain(self.telemetry.values())
            .chain(self.options.values())
    }
}

// ── Node ─────────────────────────────────────────────────────────────

pub struct Node {
    id: Identity,
    ctx: Arc<EngineContext>,
    this: Weak<Node>,
    state: Mutex<NodeState>,
}

impl Node {
    /// A node known only from the device model's records.
    pub fn persisted(record: NodeRecord, ctx: Arc<EngineContext>) -> Arc<Self> {
        let node = Self::build(record, Binding::Persisted, ctx);
        node.adopt_record();
        node
    }

    /// A node backed by a coordinator device, seeded with `record`.
    pub fn bridged(device: Device, record: NodeRecord, ctx: Arc<EngineContext>) -> Arc<Self> {
        let node = Self::build(record, Binding::Bridge, ctx);
        node.adopt_record();
        node.set_device(device);
        node
    }

    fn build(record: NodeRecord, binding: Binding, ctx: Arc<EngineContext>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id: record.id.clone(),
            ctx,
            this: this.clone(),
            state: Mutex::new(NodeState {
                binding,
                device: None,
                model_id: None,
                mapped: None,
                record,
                sensors: IndexMap::new(),
                telemetry: IndexMap::new(),
                options: IndexMap::new(),
                deleted: false,
                connected: None,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Turn the persisted record into value-only properties. Option ids
    /// become shadow options straight away, whichever bucket holds them.
    fn adopt_record(&self) {
        let record = self.state().record.clone();
        for (kind, entry) in record.properties() {
            if self.state().find(&entry.id).is_some() {
                debug!(node = %self.id, property = %entry.id, "duplicate id in persisted record");
                continue;
            }
            let property = self.record_property(kind, entry);
            self.state().bucket_mut(kind).insert(entry.id.clone(), property);
            if let Some((base, option)) = parse_option_id(&entry.id) {
                // Takes over the record property and its value.
                self.get_or_create_option(base, option);
            }
        }
    }

    fn record_property(&self, kind: PropertyKind, entry: &PropertyRecord) -> Arc<Property> {
        let mut attributes = Attributes::named(display_name(&entry.id));
        attributes.apply(&entry.attributes);
        Property::new(
            PropertySpec {
                id: entry.id.clone(),
                owner: self.owner(),
                kind,
                attributes,
                value: entry.value.clone(),
                wire: None,
                parser: None,
                transport: Transport::Record,
            },
            self.ctx.publisher.clone(),
            Some(Arc::clone(&self.ctx.overrides)),
        )
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn id(&self) -> &Identity {
        &self.id
    }

    fn owner(&self) -> Owner {
        Owner::Node(self.id.clone())
    }

    pub fn device(&self) -> Option<Device> {
        self.state().device.clone()
    }

    pub fn model_id(&self) -> Option<String> {
        self.state().model_id.clone()
    }

    pub fn mapped(&self) -> Option<Arc<MappedDevice>> {
        self.state().mapped.clone()
    }

    pub fn is_bridged(&self) -> bool {
        self.state().binding == Binding::Bridge
    }

    pub fn is_deleted(&self) -> bool {
        self.state().deleted
    }

    pub fn mark_deleted(&self) {
        self.state().deleted = true;
    }

    pub fn connected(&self) -> Option<bool> {
        self.state().connected
    }

    pub fn property(&self, id: &str) -> Option<Arc<Property>> {
        self.state().find(id)
    }

    /// Property ids of one bucket, in insertion order.
    pub fn property_ids(&self, kind: PropertyKind) -> Vec<String> {
        self.state().bucket(kind).keys().cloned().collect()
    }

    pub fn properties(&self) -> Vec<Arc<Property>> {
        self.state().all().cloned().collect()
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    pub fn set_connected(&self, connected: Option<bool>) {
        self.state().connected = connected;
        self.ctx.publisher.publish(ModelUpdate::NodeConnected {
            node: self.id.clone(),
            connected,
        });
    }

    /// Unbind every property from its transport.
    pub fn detach_all(&self) {
        for property in self.state().all() {
            property.detach();
        }
    }

    /// Current state as a device-model record.
    pub fn snapshot(&self) -> NodeRecord {
        let state = self.state();
        let bucket = |kind: PropertyKind| -> Vec<PropertyRecord> {
            state
                .bucket(kind)
                .values()
                .map(|p| PropertyRecord {
                    id: p.id().to_owned(),
                    attributes: AttributePatch::from(&p.attributes()),
                    value: p.value(),
                })
                .collect()
        };
        NodeRecord {
            id: self.id.clone(),
            attributes: state.record.attributes.clone(),
            sensors: bucket(PropertyKind::Sensor),
            telemetry: bucket(PropertyKind::Telemetry),
            options: bucket(PropertyKind::Option),
        }
    }

    /// Pull every readable protocol property once.
    pub fn pull_protocol(&self) {
        let readable: Vec<_> = self
            .state()
            .all()
            .filter(|p| p.tag().transport == TransportKind::Protocol && p.can_get())
            .cloned()
            .collect();
        for property in readable {
            property.spawn_pull();
        }
    }

    fn publish_attribute(&self, attribute: &str, value: String) {
        self.ctx.publisher.publish(ModelUpdate::NodeAttribute {
            node: self.id.clone(),
            attribute: attribute.to_owned(),
            value,
        });
    }

    // ── Model resolution ─────────────────────────────────────────────

    /// Attach a device snapshot. The first snapshot that carries a model
    /// id resolves the model and eagerly creates its properties.
    pub fn set_device(&self, device: Device) {
        let mut state = self.state();
        state.binding = Binding::Bridge;

        let Some(model_id) = device.model_id.clone() else {
            state.device = Some(device);
            return;
        };
        if let Some(current) = &state.model_id {
            if *current != model_id {
                warn!(node = %self.id, current = %current, reported = %model_id, "device reported a different model, keeping the first");
            }
            state.device = Some(device);
            return;
        }

        let mapped = self.ctx.converters.find_by_device(&device);
        state.model_id = Some(model_id.clone());
        state.device = Some(device);
        state.mapped.clone_from(&mapped);
        drop(state);

        let Some(mapped) = mapped else {
            warn!(node = %self.id, model = %model_id, "no converter for model");
            self.publish_attribute("name", format!("Unknown model({model_id})"));
            return;
        };

        let schema = self.ctx.schema.node(&mapped.model).cloned();
        let name = schema
            .as_ref()
            .and_then(|s| s.name.clone())
            .unwrap_or_else(|| format!("{} ({})", mapped.vendor, mapped.model));
        info!(node = %self.id, model = %mapped.model, "resolved device model");
        self.publish_attribute("name", name);

        if let Some(schema) = &schema {
            for kind in [PropertyKind::Option, PropertyKind::Telemetry, PropertyKind::Sensor] {
                for entry in schema.bucket(kind) {
                    self.get_or_create(
                        &entry.id,
                        PropertyRequest {
                            kind: Some(kind),
                            mapping: Some(entry.clone()),
                            ..PropertyRequest::default()
                        },
                    );
                }
            }
        }

        for classification in self.ctx.classification.classify(&mapped.model) {
            let Some(field) = classification.field() else {
                continue;
            };
            let id = key2id(field);
            self.get_or_create(
                &id,
                PropertyRequest {
                    classification: Some(classification.clone()),
                    ..PropertyRequest::default()
                },
            );
        }

        for encoder in mapped.encoders.iter().filter(|e| e.exposes_attributes()) {
            for key in &encoder.keys {
                self.get_or_create(&key2id(key), PropertyRequest::default());
            }
        }
    }

    // ── Property resolution ──────────────────────────────────────────

    /// Find or (re)build the protocol-bound property `id`.
    ///
    /// Returns `None` when the model is unknown or the schema ignores `id`.
    #[allow(clippy::too_many_lines)]
    pub fn get_or_create(&self, id: &str, request: PropertyRequest) -> Option<Arc<Property>> {
        let mut state = self.state();
        let mapped = state.mapped.clone()?;
        let device = state.device.clone()?;
        let schema = self.ctx.schema.node(&mapped.model);

        if schema.is_some_and(|s| s.ignores(id)) {
            debug!(node = %self.id, property = id, "property ignored by schema");
            return None;
        }

        let mut kind = request.kind;
        let mapping = request.mapping.or_else(|| {
            let (found, entry) = schema?.lookup(id)?;
            kind.get_or_insert(found);
            Some(entry.clone())
        });
        if TELEMETRY_IDS.contains(&id) {
            kind = Some(PropertyKind::Telemetry);
        }

        let existing = state.find(id);
        if let Some(property) = &existing {
            let same_kind = kind.is_none_or(|k| k == property.kind());
            if property.tag().transport == TransportKind::Protocol && same_kind {
                return Some(Arc::clone(property));
            }
        }
        let kind = kind.unwrap_or(PropertyKind::Sensor);

        // Computed presentation.
        let key = mapped
            .encoders
            .iter()
            .flat_map(|e| e.keys.iter())
            .find(|k| key2id(k) == id)
            .cloned()
            .unwrap_or_else(|| id2key(id));
        let encoder = mapped.encoder_for(split_endpoint_postfix(&key).0);
        let mut computed = AttributePatch {
            name: Some(display_name(id)),
            settable: Some(
                request
                    .settable
                    .unwrap_or_else(|| encoder.is_some_and(|e| e.codec().can_set())),
            ),
            ..AttributePatch::default()
        };
        let mut parser = None;
        match id {
            "selftest" => {
                computed.settable = Some(true);
                computed.retained = Some(false);
                computed.data_type = Some(DataType::Boolean);
            }
            "color" => {
                computed.data_type = Some(DataType::Color);
                computed.format = Some("rgb".into());
                parser = Some(Parser::Rgb2Xy);
            }
            _ if NON_RETAINED.contains(&id) => computed.retained = Some(false),
            _ => {}
        }

        // Classification only fills gaps.
        let classification = request.classification.or_else(|| {
            self.ctx
                .classification
                .classify(&mapped.model)
                .into_iter()
                .find(|c| c.field().map(key2id).as_deref() == Some(id))
        });
        if let Some(classification) = &classification {
            if computed.data_type.is_none() {
                computed.data_type = Some(if classification.component.is_binary() {
                    if parser.is_none() {
                        parser = Some(Parser::boolean(
                            classification.payload_on.clone(),
                            classification.payload_off.clone(),
                        ));
                    }
                    DataType::Boolean
                } else if classification.component == Component::Sensor
                    && classification.unit_of_measurement.is_some()
                {
                    DataType::Float
                } else {
                    DataType::String
                });
            }
            if computed.unit.is_none() {
                computed.unit.clone_from(&classification.unit_of_measurement);
            }
        }

        if let Some(spec) = mapping.as_ref().and_then(|m| m.data_type_bridge.as_ref()) {
            match Parser::from_spec(spec) {
                Ok(schema_parser) => {
                    computed.data_type = Some(schema_parser.data_type());
                    parser = Some(schema_parser);
                }
                Err(e) => warn!(node = %self.id, property = id, error = %e, "ignoring schema parser"),
            }
        }

        if let Some(value) = &request.value {
            if let Err(e) = self.ctx.overrides.note_sample(&self.id, id, value) {
                warn!(node = %self.id, property = id, error = %e, "could not persist property override");
            }
        }

        let mut patch = computed;
        patch.merge(&self.ctx.overrides.patch(&self.id, id));
        if let Some(mapping) = &mapping {
            patch.merge(&mapping.attributes);
        }

        let (mut attributes, value, wire) = match existing {
            Some(prior) => {
                prior.detach();
                state.bucket_mut(prior.kind()).shift_remove(id);
                self.ctx.publisher.publish(ModelUpdate::PropertyRemoved {
                    owner: self.owner(),
                    kind: prior.kind(),
                    property: id.to_owned(),
                });
                debug!(node = %self.id, property = id, from = ?prior.tag(), "rebuilding property");
                (prior.attributes(), prior.value(), prior.wire())
            }
            None => match state.record.property(kind, id) {
                Some(record) => {
                    let mut attributes = Attributes::named(display_name(id));
                    attributes.apply(&record.attributes);
                    (attributes, record.value.clone(), None)
                }
                None => (Attributes::named(display_name(id)), None, None),
            },
        };
        attributes.apply(&patch);

        let transport = ProtocolTransport::new(&key, device, &mapped, self.ctx.link.clone());
        let property = Property::new(
            PropertySpec {
                id: id.to_owned(),
                owner: self.owner(),
                kind,
                attributes,
                value,
                wire,
                parser,
                transport: Transport::Protocol(transport),
            },
            self.ctx.publisher.clone(),
            Some(Arc::clone(&self.ctx.overrides)),
        );
        state.bucket_mut(kind).insert(id.to_owned(), Arc::clone(&property));
        drop(state);

        self.ctx.publisher.publish(ModelUpdate::PropertyAdded {
            owner: self.owner(),
            kind,
            property: id.to_owned(),
        });
        property.publish_attributes();
        if self.ctx.link_started() {
            property.spawn_pull();
        }
        Some(property)
    }

    /// Find or build the `<base>-<kind>` shadow option.
    ///
    /// Declines (returns `None`) when a property bound to something else
    /// than a record already holds the id.
    pub fn get_or_create_option(&self, base: &str, kind: OptionKind) -> Option<Arc<Property>> {
        let id = option_id(base, kind);
        let mut state = self.state();

        let persisted = match state.find(&id) {
            Some(existing) => match existing.tag().transport {
                TransportKind::Shadow => return Some(existing),
                TransportKind::Record => {
                    existing.detach();
                    state.bucket_mut(existing.kind()).shift_remove(&id);
                    existing.value()
                }
                TransportKind::Protocol | TransportKind::Custom => {
                    debug!(node = %self.id, property = %id, "id already bound, not adding option");
                    return None;
                }
            },
            None => state.record.property(PropertyKind::Option, &id).and_then(|r| r.value.clone()),
        };

        let mut attributes = Attributes::named(format!("{} {kind}", display_name(base)));
        attributes.settable = true;
        attributes.retained = true;
        let (parser, initial) = match kind {
            OptionKind::Precision => {
                attributes.data_type = DataType::Enum;
                attributes.format = Some(PRECISION_CHOICES.join(","));
                let precision = persisted
                    .as_deref()
                    .and_then(|v| v.trim().parse::<u8>().ok())
                    .filter(|p| *p <= 2)
                    .unwrap_or_else(|| default_precision(base));
                (Parser::choice(PRECISION_CHOICES), f64::from(precision))
            }
            OptionKind::Calibration => {
                attributes.data_type = DataType::Float;
                let offset = persisted
                    .as_deref()
                    .and_then(|v| v.trim().parse::<f64>().ok())
                    .filter(|v| v.is_finite())
                    .unwrap_or(0.0);
                (Parser::Float, offset)
            }
        };

        let property = Property::new(
            PropertySpec {
                id: id.clone(),
                owner: self.owner(),
                kind: PropertyKind::Option,
                attributes,
                value: None,
                wire: None,
                parser: Some(parser),
                transport: Transport::Shadow(ShadowTransport::new(self.this.clone())),
            },
            self.ctx.publisher.clone(),
            Some(Arc::clone(&self.ctx.overrides)),
        );
        state.options.insert(id.clone(), Arc::clone(&property));
        drop(state);

        self.ctx.publisher.publish(ModelUpdate::PropertyAdded {
            owner: self.owner(),
            kind: PropertyKind::Option,
            property: id,
        });
        property.publish_attributes();
        property.receive(&FieldValue::Number(initial));
        Some(property)
    }

    // ── Message path ─────────────────────────────────────────────────

    /// Decode `message` and push every field into its property.
    pub fn handle_message(&self, message: &Message, mapped: &MappedDevice) {
        let options = self.decode_options();
        let fields = pipeline::convert(mapped, message, &options);
        let synced = *self.ctx.model_synced.borrow();

        for (key, value) in fields {
            if value.is_nan() {
                debug!(node = %self.id, key = %key, "skipping NaN field");
                continue;
            }
            let id = key2id(&key);
            let Some(property) = self.get_or_create(
                &id,
                PropertyRequest {
                    value: Some(value.clone()),
                    ..PropertyRequest::default()
                },
            ) else {
                continue;
            };

            if synced && is_option_base(&id) {
                for option in OptionKind::ALL {
                    if let Some(shadow) = self.get_or_create_option(&id, option) {
                        if let Some(transport) = shadow.shadow() {
                            transport.mirror(message);
                        }
                    }
                }
            }

            property.absorb(&value);
        }
    }

    /// Re-run the message path for a mirrored sample after an option changed.
    pub fn replay(&self, sample: &Arc<Message>) {
        match self.ctx.converters.find_by_device(&sample.device) {
            Some(mapped) => self.handle_message(sample, &mapped),
            None => warn!(node = %self.id, "cannot replay sample, model no longer mapped"),
        }
    }

    /// Shadow option values keyed the way decoders read them.
    fn decode_options(&self) -> DecodeOptions {
        let mut options = DecodeOptions::new();
        for property in self.state().options.values() {
            if property.tag().transport != TransportKind::Shadow {
                continue;
            }
            if let Some(wire) = property.wire() {
                options.insert(id2key(property.id()), wire);
            }
        }
        options
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("binding", &state.binding)
            .field("model_id", &state.model_id)
            .field("deleted", &state.deleted)
            .finish_non_exhaustive()
    }
}

fn default_precision(base: &str) -> u8 {
    match base {
        "temperature" | "humidity" => 2,
        "pressure" => 1,
        _ => 0,
    }
}
