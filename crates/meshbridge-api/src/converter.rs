// ── Converter registry contract ──
//
// Per-model encode/decode tables. The registry is pure lookup: the
// bridge never mutates a `MappedDevice`, it only runs its routines.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use strum::Display;

use crate::device::{Device, Endpoint};
use crate::error::Error;
use crate::message::{FieldMap, FieldValue, Message};

/// Coordinator events a model's hook can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "camelCase")]
pub enum EventKind {
    DeviceLeave,
    DeviceJoined,
    DeviceInterview,
    DeviceAnnounce,
    Message,
}

/// Why a reporting setup pass is being attempted.
///
/// `None` at the call site means the bulk pass after the link comes up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "camelCase")]
pub enum ReportTrigger {
    DeviceAnnounce,
    Message,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelMeta {
    /// Bumped by the registry whenever the model's configure routine changes.
    pub configure_key: Option<u32>,
}

// ── Decoding ────────────────────────────────────────────────────────

/// Tunables handed to decoders, e.g. `temperature_precision`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodeOptions {
    values: FieldMap,
}

impl DecodeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: FieldValue) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.values.get(key)
    }

    /// Decimal places requested for `<base>_precision`, if any.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::as_conversions)]
    pub fn precision(&self, base: &str) -> Option<u32> {
        self.get(&format!("{base}_precision"))
            .and_then(FieldValue::as_f64)
            .filter(|p| p.is_finite() && *p >= 0.0)
            .map(|p| p as u32)
    }

    /// Offset requested for `<base>_calibration`, if any.
    pub fn calibration(&self, base: &str) -> Option<f64> {
        self.get(&format!("{base}_calibration"))
            .and_then(FieldValue::as_f64)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

pub trait Decode: Send + Sync {
    fn decode(&self, message: &Message, options: &DecodeOptions) -> Result<FieldMap, Error>;
}

impl<F> Decode for F
where
    F: Fn(&Message, &DecodeOptions) -> Result<FieldMap, Error> + Send + Sync,
{
    fn decode(&self, message: &Message, options: &DecodeOptions) -> Result<FieldMap, Error> {
        self(message, options)
    }
}

/// One wire → field converter, selected by `(cluster, type)`.
#[derive(Clone)]
pub struct Decoder {
    pub cluster: String,
    pub types: Vec<String>,
    decode: Arc<dyn Decode>,
}

impl Decoder {
    pub fn new<I, S>(cluster: impl Into<String>, types: I, decode: impl Decode + 'static) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cluster: cluster.into(),
            types: types.into_iter().map(Into::into).collect(),
            decode: Arc::new(decode),
        }
    }

    pub fn matches(&self, cluster: &str, kind: &str) -> bool {
        self.cluster == cluster && self.types.iter().any(|t| t == kind)
    }

    pub fn decode(&self, message: &Message, options: &DecodeOptions) -> Result<FieldMap, Error> {
        self.decode.decode(message, options)
    }
}

impl fmt::Debug for Decoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decoder")
            .field("cluster", &self.cluster)
            .field("types", &self.types)
            .finish_non_exhaustive()
    }
}

// ── Encoding ────────────────────────────────────────────────────────

/// Context for an encoder call.
#[derive(Debug, Clone)]
pub struct EncodeMeta {
    pub device: Device,
    /// `{key: value}` for the value being read or written.
    pub state: FieldMap,
}

#[async_trait]
pub trait Encode: Send + Sync {
    fn can_get(&self) -> bool;

    fn can_set(&self) -> bool;

    /// Ask the device to report `key`. The answer arrives as a regular message.
    async fn get(&self, _endpoint: &Endpoint, _key: &str, _meta: &EncodeMeta) -> Result<(), Error> {
        Err(Error::Unsupported("get"))
    }

    /// Write `value`. May return the resulting state if the device echoed it.
    async fn set(
        &self,
        _endpoint: &Endpoint,
        _key: &str,
        _value: &FieldValue,
        _meta: &EncodeMeta,
    ) -> Result<Option<FieldMap>, Error> {
        Err(Error::Unsupported("set"))
    }
}

/// One field → wire converter, selected by key.
#[derive(Clone)]
pub struct Encoder {
    pub keys: Vec<String>,
    /// `Some(vec![])` marks an encoder that exposes no attributes of its own.
    pub attributes: Option<Vec<String>>,
    codec: Arc<dyn Encode>,
}

impl Encoder {
    pub fn new<I, S>(keys: I, codec: impl Encode + 'static) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
            attributes: None,
            codec: Arc::new(codec),
        }
    }

    pub fn with_attributes(mut self, attributes: Vec<String>) -> Self {
        self.attributes = Some(attributes);
        self
    }

    pub fn handles(&self, key: &str) -> bool {
        self.keys.iter().any(|k| k == key)
    }

    pub fn exposes_attributes(&self) -> bool {
        self.attributes.as_ref().is_none_or(|a| !a.is_empty())
    }

    pub fn codec(&self) -> &Arc<dyn Encode> {
        &self.codec
    }
}

impl fmt::Debug for Encoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Encoder")
            .field("keys", &self.keys)
            .field("attributes", &self.attributes)
            .finish_non_exhaustive()
    }
}

// ── Setup routines ──────────────────────────────────────────────────

#[async_trait]
pub trait Configure: Send + Sync {
    async fn configure(&self, device: &Device, coordinator_endpoint: &Endpoint) -> Result<(), Error>;
}

#[async_trait]
pub trait Reporting: Send + Sync {
    fn should_setup(&self, device: &Device, trigger: Option<ReportTrigger>) -> bool;

    async fn setup(&self, device: &Device, coordinator_endpoint: &Endpoint) -> Result<(), Error>;
}

pub trait EventHook: Send + Sync {
    fn on_event(&self, kind: EventKind, device: &Device) -> Result<(), Error>;
}

// ── MappedDevice ────────────────────────────────────────────────────

/// Everything the registry knows about one device model.
#[derive(Clone)]
pub struct MappedDevice {
    pub model: String,
    pub vendor: String,
    pub decoders: Vec<Decoder>,
    pub encoders: Vec<Encoder>,
    /// Named endpoints (`left`, `right`, `l1`, `default`, ...).
    pub endpoints: Option<HashMap<String, u8>>,
    pub configure: Option<Arc<dyn Configure>>,
    pub meta: ModelMeta,
    pub on_event: Option<Arc<dyn EventHook>>,
    pub reporting: Option<Arc<dyn Reporting>>,
}

impl MappedDevice {
    pub fn new(model: impl Into<String>, vendor: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            vendor: vendor.into(),
            decoders: Vec::new(),
            encoders: Vec::new(),
            endpoints: None,
            configure: None,
            meta: ModelMeta::default(),
            on_event: None,
            reporting: None,
        }
    }

    pub fn with_decoder(mut self, decoder: Decoder) -> Self {
        self.decoders.push(decoder);
        self
    }

    pub fn with_encoder(mut self, encoder: Encoder) -> Self {
        self.encoders.push(encoder);
        self
    }

    pub fn with_endpoints(mut self, endpoints: HashMap<String, u8>) -> Self {
        self.endpoints = Some(endpoints);
        self
    }

    pub fn with_configure(mut self, key: u32, configure: impl Configure + 'static) -> Self {
        self.configure = Some(Arc::new(configure));
        self.meta.configure_key = Some(key);
        self
    }

    pub fn with_reporting(mut self, reporting: impl Reporting + 'static) -> Self {
        self.reporting = Some(Arc::new(reporting));
        self
    }

    pub fn with_event_hook(mut self, hook: impl EventHook + 'static) -> Self {
        self.on_event = Some(Arc::new(hook));
        self
    }

    /// Decoders for `(cluster, type)`, in registration order.
    pub fn decoders_for<'a>(
        &'a self,
        cluster: &'a str,
        kind: &'a str,
    ) -> impl Iterator<Item = &'a Decoder> + 'a {
        self.decoders.iter().filter(move |d| d.matches(cluster, kind))
    }

    pub fn encoder_for(&self, key: &str) -> Option<&Encoder> {
        self.encoders.iter().find(|e| e.handles(key))
    }

    pub fn endpoint_id(&self, name: &str) -> Option<u8> {
        self.endpoints.as_ref()?.get(name).copied()
    }
}

impl fmt::Debug for MappedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedDevice")
            .field("model", &self.model)
            .field("vendor", &self.vendor)
            .field("decoders", &self.decoders)
            .field("encoders", &self.encoders)
            .field("endpoints", &self.endpoints)
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

// ── Registry ────────────────────────────────────────────────────────

pub trait ConverterRegistry: Send + Sync {
    fn find_by_device(&self, device: &Device) -> Option<Arc<MappedDevice>>;

    /// Registry-wide hook run before any model-specific one.
    fn on_event(&self, _kind: EventKind, _device: &Device) -> Result<(), Error> {
        Ok(())
    }
}
