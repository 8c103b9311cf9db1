// ── Coordinator contract ──
//
// The radio stack (join, routing, interview) lives behind this trait.
// The bridge owns exactly one live instance at a time and rebuilds it
// through a `CoordinatorFactory` on every (re)connect.

use std::sync::Arc;

use async_trait::async_trait;
use strum::Display;
use tokio::sync::broadcast;

use crate::device::{Device, DeviceType, Group, Identity, InterviewStatus};
use crate::error::Error;
use crate::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ResetMode {
    Soft,
    Hard,
}

/// Everything a coordinator can report to its owner.
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    Error(String),
    AdapterDisconnected,
    /// Leave notifications carry only the identity: the device record may
    /// already be gone.
    DeviceLeave { identity: Identity },
    DeviceJoined { device: Device },
    DeviceInterview { status: InterviewStatus, device: Device },
    DeviceAnnounce { device: Device },
    Message(Message),
}

#[async_trait]
pub trait Coordinator: Send + Sync {
    async fn start(&self) -> Result<(), Error>;

    async fn stop(&self) -> Result<(), Error>;

    /// Stop only the radio adapter, leaving the device database untouched.
    ///
    /// Used when tearing down a link that may never have finished starting.
    async fn stop_adapter(&self) -> Result<(), Error>;

    async fn reset(&self, mode: ResetMode) -> Result<(), Error>;

    async fn permit_join(&self, permit: bool) -> Result<(), Error>;

    async fn permit_join_state(&self) -> Result<bool, Error>;

    fn devices(&self) -> Vec<Device>;

    fn devices_by_type(&self, device_type: DeviceType) -> Vec<Device> {
        self.devices()
            .into_iter()
            .filter(|d| d.device_type == device_type)
            .collect()
    }

    fn device_by_identity(&self, identity: &Identity) -> Option<Device> {
        self.devices().into_iter().find(|d| &d.identity == identity)
    }

    fn group_by_id(&self, _id: u16) -> Option<Group> {
        None
    }

    async fn create_group(&self, _id: u16) -> Result<Group, Error> {
        Err(Error::Unsupported("create_group"))
    }

    /// Remove the device from the coordinator's database.
    async fn remove_device(&self, identity: &Identity) -> Result<(), Error>;

    fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent>;

    /// The coordinator's own device record.
    fn coordinator(&self) -> Option<Device> {
        self.devices_by_type(DeviceType::Coordinator).into_iter().next()
    }
}

/// Builds a fresh coordinator for each link establishment.
pub trait CoordinatorFactory: Send + Sync {
    fn create(&self) -> Result<Arc<dyn Coordinator>, Error>;
}

impl<F> CoordinatorFactory for F
where
    F: Fn() -> Result<Arc<dyn Coordinator>, Error> + Send + Sync,
{
    fn create(&self) -> Result<Arc<dyn Coordinator>, Error> {
        self()
    }
}
