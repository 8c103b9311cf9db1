#![allow(clippy::unwrap_used)]
// Default behaviour of the collaborator traits.

use std::sync::Arc;

use async_trait::async_trait;
use meshbridge_api::{
    Coordinator, CoordinatorEvent, CoordinatorFactory, ConverterRegistry, Device, DeviceType, Encode,
    EncodeMeta, Endpoint, Error, EventKind, FieldMap, FieldValue, Identity, MappedDevice, ResetMode,
};
use pretty_assertions::assert_eq;
use tokio::sync::broadcast;

struct Fixed {
    devices: Vec<Device>,
    events: broadcast::Sender<CoordinatorEvent>,
}

impl Fixed {
    fn new(devices: Vec<Device>) -> Self {
        let (events, _) = broadcast::channel(4);
        Self { devices, events }
    }
}

#[async_trait]
impl Coordinator for Fixed {
    async fn start(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn stop_adapter(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn reset(&self, _mode: ResetMode) -> Result<(), Error> {
        Ok(())
    }

    async fn permit_join(&self, _permit: bool) -> Result<(), Error> {
        Ok(())
    }

    async fn permit_join_state(&self) -> Result<bool, Error> {
        Ok(false)
    }

    fn devices(&self) -> Vec<Device> {
        self.devices.clone()
    }

    async fn remove_device(&self, identity: &Identity) -> Result<(), Error> {
        Err(Error::DeviceNotFound {
            identity: identity.to_string(),
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }
}

fn network() -> Vec<Device> {
    vec![
        Device::new("0x00158d0001a2b3c4", DeviceType::EndDevice),
        Device::new("0x00124b0000000000", DeviceType::Coordinator),
        Device::new("0x00158d0002c3d4e5", DeviceType::Router),
    ]
}

// ── Coordinator ─────────────────────────────────────────────────────

#[test]
fn coordinator_record_is_found_by_type() {
    let coordinator = Fixed::new(network());

    let own = coordinator.coordinator().unwrap();

    assert_eq!(own.identity.as_str(), "0x00124b0000000000");
    assert_eq!(coordinator.devices_by_type(DeviceType::Router).len(), 1);
    assert!(coordinator.devices_by_type(DeviceType::GreenPower).is_empty());
}

#[test]
fn devices_are_looked_up_by_identity() {
    let coordinator = Fixed::new(network());

    let found = coordinator.device_by_identity(&Identity::new("0x00158d0002c3d4e5"));

    assert_eq!(found.map(|d| d.device_type), Some(DeviceType::Router));
    assert!(coordinator.device_by_identity(&Identity::new("0x01")).is_none());
}

#[tokio::test]
async fn groups_are_unsupported_by_default() {
    let coordinator = Fixed::new(Vec::new());

    assert!(coordinator.group_by_id(7).is_none());
    assert!(matches!(
        coordinator.create_group(7).await,
        Err(Error::Unsupported("create_group"))
    ));
    assert!(coordinator.coordinator().is_none());
}

#[test]
fn closures_build_coordinators() {
    let factory = || -> Result<Arc<dyn Coordinator>, Error> { Ok(Arc::new(Fixed::new(network()))) };

    let built = factory.create().unwrap();

    assert_eq!(built.devices().len(), 3);
}

// ── Converters ──────────────────────────────────────────────────────

struct Silent;

#[async_trait]
impl Encode for Silent {
    fn can_get(&self) -> bool {
        false
    }

    fn can_set(&self) -> bool {
        false
    }
}

struct Empty;

impl ConverterRegistry for Empty {
    fn find_by_device(&self, _device: &Device) -> Option<Arc<MappedDevice>> {
        None
    }
}

#[tokio::test]
async fn encoders_refuse_what_they_do_not_implement() {
    let device = Device::new("0x00158d0001a2b3c4", DeviceType::EndDevice);
    let endpoint = Endpoint::new(device.identity.clone(), 1);
    let meta = EncodeMeta {
        device,
        state: FieldMap::new(),
    };

    let read = Silent.get(&endpoint, "state", &meta).await;
    let write = Silent.set(&endpoint, "state", &FieldValue::from("ON"), &meta).await;

    assert!(matches!(read, Err(Error::Unsupported("get"))));
    assert!(matches!(write, Err(Error::Unsupported("set"))));
}

#[test]
fn registry_hooks_default_to_success() {
    let device = Device::new("0x00158d0001a2b3c4", DeviceType::EndDevice);

    assert!(Empty.on_event(EventKind::DeviceAnnounce, &device).is_ok());
    assert!(Empty.find_by_device(&device).is_none());
}
