// ── Device configuration and reporting setup ──
//
// Opportunistic, best-effort passes run when devices join, announce,
// finish their interview or when the link comes up. Neither pass is
// fatal to the caller.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use meshbridge_api::{ConverterRegistry, Device, Identity, ReportTrigger};
use tracing::{debug, info, warn};

use crate::error::BridgeError;
use crate::overrides::OverrideStore;
use crate::supervisor::Supervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigureOutcome {
    Skipped,
    Configured,
    Failed,
}

pub struct DeviceSetup {
    configure_timeout: Duration,
    converters: Arc<dyn ConverterRegistry>,
    overrides: Arc<OverrideStore>,
    supervisor: Supervisor,
    /// Identities with a configure routine in flight.
    configuring: DashSet<Identity>,
    /// Identities with a reporting setup in flight.
    reporting: DashSet<Identity>,
    /// Identities whose last reporting setup failed. Cleared on link start.
    failed: DashSet<Identity>,
}

/// Removes an identity from an in-flight set when dropped.
struct InFlight<'a> {
    set: &'a DashSet<Identity>,
    identity: Identity,
}

impl<'a> InFlight<'a> {
    fn claim(set: &'a DashSet<Identity>, identity: &Identity) -> Option<Self> {
        set.insert(identity.clone()).then(|| Self {
            set,
            identity: identity.clone(),
        })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.identity);
    }
}

impl DeviceSetup {
    pub fn new(
        configure_timeout: Duration,
        converters: Arc<dyn ConverterRegistry>,
        overrides: Arc<OverrideStore>,
        supervisor: Supervisor,
    ) -> Self {
        Self {
            configure_timeout,
            converters,
            overrides,
            supervisor,
            configuring: DashSet::new(),
            reporting: DashSet::new(),
            failed: DashSet::new(),
        }
    }

    /// Run the model's configure routine unless the device is already
    /// configured under the current key or a run is in flight.
    pub async fn configure_if_needed(&self, device: &Device) -> ConfigureOutcome {
        let Some(mapped) = self.converters.find_by_device(device) else {
            return ConfigureOutcome::Skipped;
        };
        let Some(configure) = mapped.configure.clone() else {
            return ConfigureOutcome::Skipped;
        };
        let key = mapped.meta.configure_key.unwrap_or_default();
        if device.interviewing || self.overrides.configured(&device.identity) == Some(key) {
            return ConfigureOutcome::Skipped;
        }
        let Some(_in_flight) = InFlight::claim(&self.configuring, &device.identity) else {
            debug!(identity = %device.identity, "configure already in flight");
            return ConfigureOutcome::Skipped;
        };
        let Some(endpoint) = self.supervisor.coordinator_endpoint() else {
            warn!(identity = %device.identity, "no coordinator endpoint, cannot configure");
            return ConfigureOutcome::Failed;
        };

        info!(identity = %device.identity, model = %mapped.model, "configuring device");
        match tokio::time::timeout(self.configure_timeout, configure.configure(device, &endpoint)).await {
            Ok(Ok(())) => {
                if let Err(e) = self.overrides.set_configured(&device.identity, key) {
                    warn!(identity = %device.identity, error = %e, "could not persist configured marker");
                }
                info!(identity = %device.identity, "device configured");
                ConfigureOutcome::Configured
            }
            Ok(Err(e)) => {
                warn!(identity = %device.identity, error = %e, "failed to configure device");
                ConfigureOutcome::Failed
            }
            Err(_) => {
                warn!(
                    identity = %device.identity,
                    timeout_secs = self.configure_timeout.as_secs(),
                    "configure timed out"
                );
                ConfigureOutcome::Failed
            }
        }
    }

    /// Set up attribute reporting when the model asks for it.
    ///
    /// Returns whether a setup pass ran. A device whose last setup failed
    /// is skipped until [`clear_failed`](Self::clear_failed).
    pub async fn setup_reporting_if_needed(
        &self,
        device: &Device,
        trigger: Option<ReportTrigger>,
    ) -> Result<bool, BridgeError> {
        let Some(reporting) = self
            .converters
            .find_by_device(device)
            .and_then(|m| m.reporting.clone())
        else {
            return Ok(false);
        };
        if self.failed.contains(&device.identity) {
            debug!(identity = %device.identity, "reporting setup failed earlier, waiting for link restart");
            return Ok(false);
        }
        if !reporting.should_setup(device, trigger) {
            return Ok(false);
        }
        let Some(_in_flight) = InFlight::claim(&self.reporting, &device.identity) else {
            debug!(identity = %device.identity, "reporting setup already in flight");
            return Ok(false);
        };
        let endpoint = self
            .supervisor
            .coordinator_endpoint()
            .ok_or_else(BridgeError::not_connected)?;

        debug!(identity = %device.identity, ?trigger, "setting up reporting");
        match reporting.setup(device, &endpoint).await {
            Ok(()) => {
                self.failed.remove(&device.identity);
                Ok(true)
            }
            Err(e) => {
                warn!(identity = %device.identity, error = %e, "reporting setup failed");
                self.failed.insert(device.identity.clone());
                Err(BridgeError::Unknown {
                    message: format!("Failed to setup reporting for device '{}'", device.identity),
                })
            }
        }
    }

    pub fn is_configuring(&self, identity: &Identity) -> bool {
        self.configuring.contains(identity)
    }

    pub fn has_failed(&self, identity: &Identity) -> bool {
        self.failed.contains(identity)
    }

    pub fn clear_failed(&self) {
        self.failed.clear();
    }
}
