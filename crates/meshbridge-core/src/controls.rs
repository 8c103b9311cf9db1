// ── Bridge-level controls ──
//
// Properties of the bridge device itself that talk to the supervisor
// instead of a node's converter tables.

use std::sync::Arc;

use async_trait::async_trait;
use meshbridge_api::{Coordinator, FieldValue};
use tracing::{info, warn};

use crate::error::BridgeError;
use crate::property::Control;
use crate::supervisor::Supervisor;

/// `permitjoin`: whether the coordinator accepts new devices.
pub struct PermitJoinControl {
    supervisor: Supervisor,
}

impl PermitJoinControl {
    pub fn new(supervisor: Supervisor) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl Control for PermitJoinControl {
    async fn read(&self) -> Result<Option<FieldValue>, BridgeError> {
        let coordinator = started(&self.supervisor)?;
        let permitted = coordinator.permit_join_state().await?;
        Ok(Some(FieldValue::Bool(permitted)))
    }

    async fn write(&self, value: &FieldValue) -> Result<(), BridgeError> {
        let coordinator = started(&self.supervisor)?;
        let permit = matches!(value, FieldValue::Bool(true));
        info!(permit, "changing permit join");
        coordinator
            .permit_join(permit)
            .await
            .map_err(|e| BridgeError::update_failed(e.to_string()))
    }
}

/// `soft-reset`: writing any value restarts the coordinator link.
pub struct SoftResetControl {
    supervisor: Supervisor,
}

impl SoftResetControl {
    pub fn new(supervisor: Supervisor) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl Control for SoftResetControl {
    async fn write(&self, _value: &FieldValue) -> Result<(), BridgeError> {
        started(&self.supervisor)?;
        let supervisor = self.supervisor.clone();
        tokio::spawn(async move {
            if let Err(e) = supervisor.soft_reset().await {
                warn!(error = %e, "requested soft reset failed");
            }
        });
        Ok(())
    }
}

fn started(supervisor: &Supervisor) -> Result<Arc<dyn Coordinator>, BridgeError> {
    if !supervisor.is_started() {
        return Err(BridgeError::not_connected());
    }
    supervisor.coordinator().ok_or_else(BridgeError::not_connected)
}
