// ── Internal event bus ──
//
// The supervisor publishes link lifecycle and admitted coordinator
// traffic here; the registry subscribes on attach and drops its
// receiver on detach.

use std::sync::Arc;

use meshbridge_api::{Device, Identity, InterviewStatus, MappedDevice, Message};
use tokio::sync::broadcast;

const BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum BridgeEvent {
    // ── Link lifecycle ───────────────────────────────────────────────
    Started,
    Stopped,
    StartError(String),
    /// Non-fatal error reported by (or while talking to) the coordinator.
    LinkError(String),
    PermitJoin(bool),
    /// Automatic recovery is exhausted; the embedding process should exit.
    Exit { reason: String, code: i32 },

    // ── Device traffic ───────────────────────────────────────────────
    DeviceLeave { identity: Identity },
    DeviceJoined { device: Device },
    DeviceInterview { status: InterviewStatus, device: Device },
    DeviceAnnounce { device: Device },
    /// A message that survived the filter, with the model that decodes it.
    Message {
        message: Arc<Message>,
        mapped: Arc<MappedDevice>,
    },

    // ── Device-model requests ────────────────────────────────────────
    NodeDeleted { node_id: Identity },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Arc<BridgeEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, event: BridgeEvent) {
        // No subscribers is not an error: nothing is attached yet.
        let _ = self.tx.send(Arc::new(event));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<BridgeEvent>> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
