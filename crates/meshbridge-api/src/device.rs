// ── Device identity and coordinator-owned device records ──
//
// Devices are owned by the coordinator. The bridge only ever sees
// snapshots of them; mutations go back through `Coordinator` calls.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Manufacturer codes that mark Xiaomi/Aqara hardware.
const XIAOMI_MANUFACTURER_CODES: [u16; 2] = [4151, 4447];

// ── Identity ────────────────────────────────────────────────────────

/// Stable per-device address (IEEE/EUI-64), normalized to lowercase `0x…` hex.
///
/// This is the dedup key for nodes: one identity, at most one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String")]
pub struct Identity(String);

impl Identity {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Identity {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

impl From<String> for Identity {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ── Device ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString)]
pub enum DeviceType {
    Coordinator,
    Router,
    EndDevice,
    GreenPower,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum InterviewStatus {
    Started,
    Successful,
    Failed,
}

/// Snapshot of a coordinator-owned device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub identity: Identity,
    #[serde(default)]
    pub network_address: u16,
    #[serde(default)]
    pub device_type: DeviceType,
    /// Model string reported during interview; `None` until known.
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub manufacturer_name: Option<String>,
    #[serde(default)]
    pub manufacturer_code: Option<u16>,
    #[serde(default)]
    pub interviewing: bool,
    #[serde(default)]
    pub interview_completed: bool,
    /// Endpoint ids in the order the device reported them.
    #[serde(default)]
    pub endpoints: Vec<u8>,
}

impl Device {
    pub fn new(identity: impl Into<Identity>, device_type: DeviceType) -> Self {
        Self {
            identity: identity.into(),
            network_address: 0,
            device_type,
            model_id: None,
            manufacturer_name: None,
            manufacturer_code: None,
            interviewing: false,
            interview_completed: false,
            endpoints: vec![1],
        }
    }

    /// Look up an endpoint by id, if the device exposes it.
    pub fn endpoint(&self, id: u8) -> Option<Endpoint> {
        self.endpoints
            .contains(&id)
            .then(|| Endpoint::new(self.identity.clone(), id))
    }

    pub fn first_endpoint(&self) -> Option<Endpoint> {
        self.endpoints
            .first()
            .map(|id| Endpoint::new(self.identity.clone(), *id))
    }

    /// Xiaomi/Aqara hardware, excluding their own router dongle and
    /// Trust-branded rebadges that share the manufacturer code.
    pub fn is_xiaomi(&self) -> bool {
        if self.model_id.as_deref() == Some("lumi.router") {
            return false;
        }
        let code_matches = self
            .manufacturer_code
            .is_some_and(|code| XIAOMI_MANUFACTURER_CODES.contains(&code));
        let rebadged = self
            .manufacturer_name
            .as_deref()
            .is_some_and(|name| name.starts_with("Trust"));
        code_matches && !rebadged
    }
}

// ── Endpoint / Group ────────────────────────────────────────────────

/// Addressable application endpoint on a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub device: Identity,
    pub id: u8,
}

impl Endpoint {
    pub fn new(device: Identity, id: u8) -> Self {
        Self { device, id }
    }
}

/// Coordinator-managed multicast group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: u16,
    pub members: Vec<Endpoint>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn xiaomi(model: &str) -> Device {
        let mut device = Device::new("0x00158D0001A2B3C4", DeviceType::Router);
        device.model_id = Some(model.into());
        device.manufacturer_code = Some(4151);
        device
    }

    #[test]
    fn identity_normalizes_case() {
        let id: Identity = "0x00158D0001A2B3C4".parse().unwrap();
        assert_eq!(id.as_str(), "0x00158d0001a2b3c4");
    }

    #[test]
    fn endpoint_lookup_respects_reported_list() {
        let mut device = Device::new("0x01", DeviceType::EndDevice);
        device.endpoints = vec![1, 2];
        assert_eq!(device.endpoint(2).unwrap().id, 2);
        assert!(device.endpoint(3).is_none());
        assert_eq!(device.first_endpoint().unwrap().id, 1);
    }

    #[test]
    fn xiaomi_detection_excludes_router_dongle_and_rebadges() {
        assert!(xiaomi("lumi.plug").is_xiaomi());
        assert!(!xiaomi("lumi.router").is_xiaomi());

        let mut trust = xiaomi("lumi.plug");
        trust.manufacturer_name = Some("Trust International".into());
        assert!(!trust.is_xiaomi());
    }

    #[test]
    fn interview_status_parses_lowercase() {
        let status: InterviewStatus = "successful".parse().unwrap();
        assert_eq!(status, InterviewStatus::Successful);
        assert_eq!(InterviewStatus::Failed.to_string(), "failed");
    }
}
