// ── Properties ──
//
// One typed value on a node (or on the bridge device itself), bound to
// a transport. Values are held in model form (the string the device
// model publishes); the last wire value is kept alongside for encoders
// and shadow options.

mod attributes;
mod transport;

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use meshbridge_api::FieldValue;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use attributes::{AttributePatch, Attributes, DataType, PropertyKind, PropertyTag, TransportKind};
pub use transport::{Control, ProtocolTransport, ShadowTransport, Transport};

use crate::error::BridgeError;
use crate::model::{ModelPublisher, ModelUpdate, Owner};
use crate::overrides::OverrideStore;
use crate::parser::Parser;

pub struct Property {
    id: String,
    owner: Owner,
    tag: PropertyTag,
    attributes: watch::Sender<Attributes>,
    value: watch::Sender<Option<String>>,
    wire: ArcSwapOption<FieldValue>,
    parser: Option<Parser>,
    transport: Transport,
    publisher: ModelPublisher,
    overrides: Option<Arc<OverrideStore>>,
    detached: CancellationToken,
}

/// Everything needed to build a [`Property`].
pub struct PropertySpec {
    pub id: String,
    pub owner: Owner,
    pub kind: PropertyKind,
    pub attributes: Attributes,
    pub value: Option<String>,
    pub wire: Option<FieldValue>,
    pub parser: Option<Parser>,
    pub transport: Transport,
}

impl Property {
    pub fn new(spec: PropertySpec, publisher: ModelPublisher, overrides: Option<Arc<OverrideStore>>) -> Arc<Self> {
        let tag = PropertyTag::new(spec.kind, spec.transport.kind());
        let (attributes, _) = watch::channel(spec.attributes);
        let (value, _) = watch::channel(spec.value);
        Arc::new(Self {
            id: spec.id,
            owner: spec.owner,
            tag,
            attributes,
            value,
            wire: ArcSwapOption::new(spec.wire.map(Arc::new)),
            parser: spec.parser,
            transport: spec.transport,
            publisher,
            overrides,
            detached: CancellationToken::new(),
        })
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    pub fn tag(&self) -> PropertyTag {
        self.tag
    }

    pub fn kind(&self) -> PropertyKind {
        self.tag.kind
    }

    pub fn attributes(&self) -> Attributes {
        self.attributes.borrow().clone()
    }

    pub fn value(&self) -> Option<String> {
        self.value.borrow().clone()
    }

    /// Last value as it travelled over the wire.
    pub fn wire(&self) -> Option<FieldValue> {
        self.wire.load_full().map(|w| (*w).clone())
    }

    pub fn parser(&self) -> Option<&Parser> {
        self.parser.as_ref()
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn shadow(&self) -> Option<&ShadowTransport> {
        match &self.transport {
            Transport::Shadow(shadow) => Some(shadow),
            _ => None,
        }
    }

    pub fn can_get(&self) -> bool {
        match &self.transport {
            Transport::Protocol(protocol) => protocol.can_get(),
            Transport::Shadow(_) | Transport::Custom(_) => true,
            Transport::Record => false,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.value.subscribe()
    }

    pub fn is_detached(&self) -> bool {
        self.detached.is_cancelled()
    }

    /// Unbind from the transport. In-flight pulls are abandoned.
    pub fn detach(&self) {
        self.detached.cancel();
    }

    // ── Publishing ───────────────────────────────────────────────────

    pub fn publish_attributes(&self) {
        let published = self.attributes.borrow().published();
        for (attribute, value) in published {
            self.publish_attribute(attribute, value);
        }
    }

    fn publish_attribute(&self, attribute: &'static str, value: String) {
        self.publisher.publish(ModelUpdate::PropertyAttribute {
            owner: self.owner.clone(),
            property: self.id.clone(),
            attribute,
            value,
        });
    }

    /// Accept a wire value: convert it to model form and publish it.
    pub fn receive(&self, raw: &FieldValue) {
        let value = match &self.parser {
            Some(parser) => parser.to_model(raw),
            None => raw.to_string(),
        };
        self.wire.store(Some(Arc::new(raw.clone())));
        self.value.send_replace(Some(value.clone()));
        self.publisher.publish(ModelUpdate::ValueChanged {
            owner: self.owner.clone(),
            property: self.id.clone(),
            value,
        });
    }

    /// Accept fresh protocol data: record the sample in the override
    /// store (which may change the data type) and then publish it.
    pub fn absorb(&self, raw: &FieldValue) {
        if let (Some(overrides), Owner::Node(node)) = (&self.overrides, &self.owner) {
            match overrides.note_sample(node, &self.id, raw) {
                Ok(Some(data_type)) => self.retype(data_type),
                Ok(None) => {}
                Err(e) => warn!(node = %node, property = %self.id, error = %e, "could not persist property override"),
            }
        }
        self.receive(raw);
    }

    fn retype(&self, data_type: DataType) {
        let changed = self.attributes.send_if_modified(|attributes| {
            if attributes.data_type == data_type {
                return false;
            }
            attributes.data_type = data_type;
            true
        });
        if changed {
            debug!(property = %self.id, %data_type, "data type changed by wire sample");
            self.publish_attribute("dataType", data_type.to_string());
        }
    }

    // ── Get / set ────────────────────────────────────────────────────

    /// Refresh the value from its source and return what is known now.
    ///
    /// Protocol reads are answered asynchronously by a later message, so
    /// the returned value may predate the read.
    pub async fn get(&self) -> Result<Option<String>, BridgeError> {
        match &self.transport {
            Transport::Protocol(protocol) => protocol.read(self.wire()).await?,
            Transport::Shadow(_) => {
                let current = self.wire().unwrap_or(FieldValue::Number(0.0));
                self.receive(&current);
            }
            Transport::Custom(control) => {
                if let Some(current) = control.read().await? {
                    self.receive(&current);
                }
            }
            Transport::Record => {}
        }
        Ok(self.value())
    }

    /// Write a model value through the transport.
    pub async fn set(&self, value: &str) -> Result<(), BridgeError> {
        let wire = self.to_wire(value)?;
        match &self.transport {
            Transport::Protocol(protocol) => match protocol.write(&wire).await? {
                Some(echoed) => self.absorb(&echoed),
                None => {
                    self.receive(&wire);
                    protocol.confirm(&wire).await?;
                }
            },
            Transport::Shadow(shadow) => {
                if shadow.sample().is_none() {
                    return Err(BridgeError::AwaitingSample);
                }
                self.receive(&wire);
                shadow.replay()?;
            }
            Transport::Custom(control) => {
                control.write(&wire).await?;
                self.receive(&wire);
            }
            Transport::Record => self.receive(&wire),
        }
        Ok(())
    }

    fn to_wire(&self, value: &str) -> Result<FieldValue, BridgeError> {
        if let Some(parser) = &self.parser {
            return parser.to_wire(value);
        }
        match self.attributes.borrow().data_type {
            DataType::Integer | DataType::Float => value
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(FieldValue::Number)
                .ok_or(BridgeError::WrongFormat),
            DataType::Boolean => match value {
                "true" => Ok(FieldValue::Bool(true)),
                "false" => Ok(FieldValue::Bool(false)),
                _ => Err(BridgeError::WrongFormat),
            },
            DataType::String | DataType::Enum | DataType::Color => Ok(FieldValue::from(value)),
        }
    }

    /// Pull the value once in the background, unless detached first.
    pub fn spawn_pull(self: &Arc<Self>) {
        if !self.can_get() {
            return;
        }
        let property = Arc::clone(self);
        tokio::spawn(async move {
            let detached = property.detached.clone();
            tokio::select! {
                biased;
                () = detached.cancelled() => {}
                result = property.get() => {
                    if let Err(e) = result {
                        debug!(property = %property.id, error = %e, "initial pull failed");
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for Property {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Property")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("tag", &self.tag)
            .field("value", &*self.value.borrow())
            .finish_non_exhaustive()
    }
}
