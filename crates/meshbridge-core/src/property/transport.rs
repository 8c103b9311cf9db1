// ── Property transports ──
//
// What a property's get/set talk to: the converter tables over the
// radio link, a local shadow of a protocol field, a bridge-level
// control, or nothing at all (records handed over by the device model).

use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use meshbridge_api::{Device, EncodeMeta, Encoder, Endpoint, FieldMap, FieldValue, MappedDevice, Message};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::attributes::TransportKind;
use crate::error::BridgeError;
use crate::naming::split_endpoint_postfix;
use crate::node::Node;
use crate::supervisor::LinkState;

pub enum Transport {
    Protocol(ProtocolTransport),
    Shadow(ShadowTransport),
    Record,
    Custom(Arc<dyn Control>),
}

impl Transport {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Protocol(_) => TransportKind::Protocol,
            Self::Shadow(_) => TransportKind::Shadow,
            Self::Record => TransportKind::Record,
            Self::Custom(_) => TransportKind::Custom,
        }
    }
}

/// A bridge-level get/set handler (permit join, soft reset).
#[async_trait]
pub trait Control: Send + Sync {
    /// Fetch the current value. `None` means "nothing to read".
    async fn read(&self) -> Result<Option<FieldValue>, BridgeError> {
        Ok(None)
    }

    async fn write(&self, value: &FieldValue) -> Result<(), BridgeError>;
}

// ── Protocol ────────────────────────────────────────────────────────

/// Binding of one property to an encoder on one device endpoint.
pub struct ProtocolTransport {
    /// Encoder key with any endpoint postfix stripped.
    key: String,
    device: Device,
    endpoint: Option<Endpoint>,
    encoder: Option<Encoder>,
    link: watch::Receiver<LinkState>,
}

impl ProtocolTransport {
    pub fn new(
        full_key: &str,
        device: Device,
        mapped: &MappedDevice,
        link: watch::Receiver<LinkState>,
    ) -> Self {
        let (key, postfix) = split_endpoint_postfix(full_key);
        let endpoint = postfix
            .and_then(|postfix| match postfix_endpoint(&device, mapped, postfix) {
                Ok(endpoint) => Some(endpoint),
                Err(reason) => {
                    warn!(identity = %device.identity, key = full_key, %reason, "falling back to default endpoint");
                    None
                }
            })
            .or_else(|| default_endpoint(&device, mapped));

        Self {
            key: key.to_owned(),
            encoder: mapped.encoder_for(key).cloned(),
            device,
            endpoint,
            link,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    pub fn can_get(&self) -> bool {
        self.encoder.as_ref().is_some_and(|e| e.codec().can_get())
    }

    pub fn can_set(&self) -> bool {
        self.encoder.as_ref().is_some_and(|e| e.codec().can_set())
    }

    /// Ask the device to report this key. Wire failures are only logged:
    /// the answer, if any, arrives later as a regular message.
    pub async fn read(&self, current: Option<FieldValue>) -> Result<(), BridgeError> {
        let (encoder, endpoint) = self.prepare("get", self.can_get())?;
        let meta = self.meta(current);
        if let Err(e) = encoder.codec().get(endpoint, &self.key, &meta).await {
            warn!(identity = %self.device.identity, key = %self.key, error = %e, "read request failed");
        }
        Ok(())
    }

    /// Write `value`; returns the value the device echoed back for this key.
    pub async fn write(&self, value: &FieldValue) -> Result<Option<FieldValue>, BridgeError> {
        let (encoder, endpoint) = self.prepare("set", self.can_set())?;
        let meta = self.meta(Some(value.clone()));
        let echoed = encoder
            .codec()
            .set(endpoint, &self.key, value, &meta)
            .await
            .map_err(|e| BridgeError::from_wire(&e))?;
        Ok(echoed.and_then(|mut state| state.shift_remove(&self.key)))
    }

    /// Follow-up read after a write the device did not echo.
    pub async fn confirm(&self, value: &FieldValue) -> Result<(), BridgeError> {
        if !self.can_get() {
            return Ok(());
        }
        let (encoder, endpoint) = self.prepare("get", true)?;
        let meta = self.meta(Some(value.clone()));
        encoder
            .codec()
            .get(endpoint, &self.key, &meta)
            .await
            .map_err(|e| BridgeError::from_wire(&e))
    }

    fn prepare(&self, operation: &'static str, supported: bool) -> Result<(&Encoder, &Endpoint), BridgeError> {
        if *self.link.borrow() != LinkState::Started {
            return Err(BridgeError::not_connected());
        }
        let encoder = self.encoder.as_ref().ok_or_else(|| BridgeError::Unsupported {
            operation,
            reason: format!("no converter for '{}'", self.key),
        })?;
        if !supported {
            return Err(BridgeError::Unsupported {
                operation,
                reason: format!("converter for '{}' cannot {operation}", self.key),
            });
        }
        let endpoint = self.endpoint.as_ref().ok_or_else(|| BridgeError::Unsupported {
            operation,
            reason: format!("device '{}' exposes no endpoints", self.device.identity),
        })?;
        Ok((encoder, endpoint))
    }

    fn meta(&self, value: Option<FieldValue>) -> EncodeMeta {
        let mut state = FieldMap::new();
        state.insert(
            self.key.clone(),
            value.unwrap_or(FieldValue::Json(serde_json::Value::Null)),
        );
        EncodeMeta {
            device: self.device.clone(),
            state,
        }
    }
}

fn postfix_endpoint(device: &Device, mapped: &MappedDevice, postfix: &str) -> Result<Endpoint, String> {
    let id = match postfix.parse::<u8>() {
        Ok(id) => id,
        Err(_) if mapped.endpoints.is_none() => {
            return Err(format!("postfix '{postfix}' is given but the model defines no endpoints"));
        }
        Err(_) => mapped
            .endpoint_id(postfix)
            .ok_or_else(|| format!("postfix '{postfix}' is given but the model has no such endpoint"))?,
    };
    device
        .endpoint(id)
        .ok_or_else(|| format!("device does not expose endpoint {id}"))
}

fn default_endpoint(device: &Device, mapped: &MappedDevice) -> Option<Endpoint> {
    mapped
        .endpoint_id("default")
        .and_then(|id| device.endpoint(id))
        .or_else(|| device.first_endpoint())
}

// ── Shadow ──────────────────────────────────────────────────────────

/// Local tunable that re-runs its node's last protocol sample on change.
pub struct ShadowTransport {
    node: Weak<Node>,
    sample: ArcSwapOption<Message>,
}

impl ShadowTransport {
    pub fn new(node: Weak<Node>) -> Self {
        Self {
            node,
            sample: ArcSwapOption::empty(),
        }
    }

    pub fn mirror(&self, message: &Message) {
        self.sample.store(Some(Arc::new(message.clone())));
    }

    pub fn sample(&self) -> Option<Arc<Message>> {
        self.sample.load_full()
    }

    pub fn replay(&self) -> Result<(), BridgeError> {
        let sample = self.sample().ok_or(BridgeError::AwaitingSample)?;
        match self.node.upgrade() {
            Some(node) => node.replay(&sample),
            None => debug!("shadow outlived its node, nothing to replay"),
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use meshbridge_api::{DeviceType, Encode};

    use super::*;

    struct Passive;

    #[async_trait]
    impl Encode for Passive {
        fn can_get(&self) -> bool {
            true
        }

        fn can_set(&self) -> bool {
            false
        }
    }

    fn device(endpoints: Vec<u8>) -> Device {
        let mut device = Device::new("0x0017880100000001", DeviceType::Router);
        device.endpoints = endpoints;
        device
    }

    fn transport(key: &str, device: Device, mapped: &MappedDevice) -> ProtocolTransport {
        let (_tx, rx) = watch::channel(LinkState::Started);
        ProtocolTransport::new(key, device, mapped, rx)
    }

    #[test]
    fn named_postfix_resolves_through_model_endpoints() {
        let mapped = MappedDevice::new("QBKG12LM", "Xiaomi")
            .with_encoder(Encoder::new(["state"], Passive))
            .with_endpoints(HashMap::from([("left".to_owned(), 2), ("right".to_owned(), 3)]));

        let t = transport("state_right", device(vec![1, 2, 3]), &mapped);
        assert_eq!(t.key(), "state");
        assert_eq!(t.endpoint().unwrap().id, 3);
        assert!(t.can_get());
        assert!(!t.can_set());
    }

    #[test]
    fn numeric_postfix_picks_device_endpoint() {
        let mapped = MappedDevice::new("TS0002", "TuYa");
        let t = transport("state_2", device(vec![1, 2]), &mapped);
        assert_eq!(t.endpoint().unwrap().id, 2);
    }

    #[test]
    fn unresolvable_postfix_falls_back_to_default() {
        let mapped = MappedDevice::new("TS0002", "TuYa")
            .with_endpoints(HashMap::from([("default".to_owned(), 2)]));
        let t = transport("state_left", device(vec![1, 2]), &mapped);
        assert_eq!(t.key(), "state");
        assert_eq!(t.endpoint().unwrap().id, 2);

        let bare = MappedDevice::new("TS0002", "TuYa");
        let t = transport("state_7", device(vec![4, 5]), &bare);
        assert_eq!(t.endpoint().unwrap().id, 4);
    }

    #[tokio::test]
    async fn requests_need_a_started_link() {
        let mapped = MappedDevice::new("TS0002", "TuYa").with_encoder(Encoder::new(["state"], Passive));
        let (tx, rx) = watch::channel(LinkState::Idle);
        let t = ProtocolTransport::new("state", device(vec![1]), &mapped, rx);

        assert!(t.read(None).await.unwrap_err().is_connection());

        tx.send_replace(LinkState::Started);
        assert!(t.read(None).await.is_ok());
        assert!(matches!(
            t.write(&FieldValue::from("ON")).await,
            Err(BridgeError::Unsupported { operation: "set", .. })
        ));
    }

    #[test]
    fn shadow_replay_waits_for_a_sample() {
        let shadow = ShadowTransport::new(Weak::new());
        assert!(matches!(shadow.replay(), Err(BridgeError::AwaitingSample)));

        shadow.mirror(&Message::new(device(vec![1]), "msTemperatureMeasurement", "attributeReport"));
        assert!(shadow.replay().is_ok());
    }
}
