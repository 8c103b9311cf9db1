// ── In-memory collaborators ──
//
// A scriptable coordinator, a converter registry keyed by model id and
// a few converter doubles. Enabled by the `testing` feature for this
// crate's integration tests and for embedders exercising their device
// model without a radio.

#![allow(clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use meshbridge_api::{
    Configure, ConverterRegistry, Coordinator, CoordinatorEvent, CoordinatorFactory, Device,
    DeviceType, Encode, EncodeMeta, Endpoint, Error, EventKind, FieldMap, FieldValue, Identity,
    MappedDevice, Message, ReportTrigger, Reporting, ResetMode,
};
use tokio::sync::broadcast;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Coordinator ──────────────────────────────────────────────────────

pub const COORDINATOR_IDENTITY: &str = "0x00124b0000000000";

#[derive(Default)]
struct FakeState {
    devices: Vec<Device>,
    removed: Vec<Identity>,
    resets: Vec<ResetMode>,
    permit_join_calls: Vec<bool>,
    start_delay: Duration,
    stop_delay: Duration,
}

/// Coordinator double. Counts lifecycle calls and lets tests inject
/// events and failures.
pub struct FakeCoordinator {
    state: Mutex<FakeState>,
    events: broadcast::Sender<CoordinatorEvent>,
    starts: AtomicUsize,
    stops: AtomicUsize,
    adapter_stops: AtomicUsize,
    failing_starts: AtomicUsize,
    failing_stop: AtomicBool,
    permit_join: AtomicBool,
}

impl FakeCoordinator {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let mut coordinator = Device::new(COORDINATOR_IDENTITY, DeviceType::Coordinator);
        coordinator.interview_completed = true;
        Arc::new(Self {
            state: Mutex::new(FakeState {
                devices: vec![coordinator],
                ..FakeState::default()
            }),
            events,
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            adapter_stops: AtomicUsize::new(0),
            failing_starts: AtomicUsize::new(0),
            failing_stop: AtomicBool::new(false),
            permit_join: AtomicBool::new(false),
        })
    }

    pub fn add_device(&self, device: Device) {
        let mut state = lock(&self.state);
        state.devices.retain(|d| d.identity != device.identity);
        state.devices.push(device);
    }

    /// Deliver an event to the current subscribers.
    pub fn emit(&self, event: CoordinatorEvent) {
        let _ = self.events.send(event);
    }

    pub fn emit_message(&self, message: Message) {
        self.emit(CoordinatorEvent::Message(message));
    }

    /// Make the next `count` starts fail.
    pub fn fail_next_starts(&self, count: usize) {
        self.failing_starts.store(count, Ordering::SeqCst);
    }

    pub fn fail_stop(&self, failing: bool) {
        self.failing_stop.store(failing, Ordering::SeqCst);
    }

    pub fn set_start_delay(&self, delay: Duration) {
        lock(&self.state).start_delay = delay;
    }

    pub fn set_stop_delay(&self, delay: Duration) {
        lock(&self.state).stop_delay = delay;
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn adapter_stops(&self) -> usize {
        self.adapter_stops.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> Vec<ResetMode> {
        lock(&self.state).resets.clone()
    }

    pub fn removed(&self) -> Vec<Identity> {
        lock(&self.state).removed.clone()
    }

    pub fn permit_join_calls(&self) -> Vec<bool> {
        lock(&self.state).permit_join_calls.clone()
    }

    pub fn subscribers(&self) -> usize {
        self.events.receiver_count()
    }
}

#[async_trait]
impl Coordinator for FakeCoordinator {
    async fn start(&self) -> Result<(), Error> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let delay = lock(&self.state).start_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .failing_starts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Adapter("serial port not found".into()));
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), Error> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        let delay = lock(&self.state).stop_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing_stop.load(Ordering::SeqCst) {
            return Err(Error::Adapter("adapter refused to stop".into()));
        }
        Ok(())
    }

    async fn stop_adapter(&self) -> Result<(), Error> {
        self.adapter_stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reset(&self, mode: ResetMode) -> Result<(), Error> {
        lock(&self.state).resets.push(mode);
        Ok(())
    }

    async fn permit_join(&self, permit: bool) -> Result<(), Error> {
        lock(&self.state).permit_join_calls.push(permit);
        self.permit_join.store(permit, Ordering::SeqCst);
        Ok(())
    }

    async fn permit_join_state(&self) -> Result<bool, Error> {
        Ok(self.permit_join.load(Ordering::SeqCst))
    }

    fn devices(&self) -> Vec<Device> {
        lock(&self.state).devices.clone()
    }

    async fn remove_device(&self, identity: &Identity) -> Result<(), Error> {
        let mut state = lock(&self.state);
        state.devices.retain(|d| d.identity != *identity);
        state.removed.push(identity.clone());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }
}

/// Hands out the same [`FakeCoordinator`] on every (re)connect.
pub struct FakeFactory {
    coordinator: Arc<FakeCoordinator>,
    creations: AtomicUsize,
}

impl FakeFactory {
    pub fn new(coordinator: Arc<FakeCoordinator>) -> Arc<Self> {
        Arc::new(Self {
            coordinator,
            creations: AtomicUsize::new(0),
        })
    }

    pub fn creations(&self) -> usize {
        self.creations.load(Ordering::SeqCst)
    }
}

impl CoordinatorFactory for FakeFactory {
    fn create(&self) -> Result<Arc<dyn Coordinator>, Error> {
        self.creations.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::clone(&self.coordinator) as Arc<dyn Coordinator>)
    }
}

// ── Converter registry ───────────────────────────────────────────────

/// Models keyed by the device's reported model id.
#[derive(Default)]
pub struct StaticRegistry {
    models: HashMap<String, Arc<MappedDevice>>,
    events: Mutex<Vec<(EventKind, Identity)>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model_id: impl Into<String>, mapped: MappedDevice) -> Self {
        self.models.insert(model_id.into(), Arc::new(mapped));
        self
    }

    /// Registry-wide hook invocations seen so far.
    pub fn events(&self) -> Vec<(EventKind, Identity)> {
        lock(&self.events).clone()
    }
}

impl ConverterRegistry for StaticRegistry {
    fn find_by_device(&self, device: &Device) -> Option<Arc<MappedDevice>> {
        self.models.get(device.model_id.as_deref()?).cloned()
    }

    fn on_event(&self, kind: EventKind, device: &Device) -> Result<(), Error> {
        lock(&self.events).push((kind, device.identity.clone()));
        Ok(())
    }
}

// ── Converter doubles ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum EncoderCall {
    Get { endpoint: u8, key: String },
    Set { endpoint: u8, key: String, value: FieldValue },
}

#[derive(Default)]
struct EncoderScript {
    calls: Mutex<Vec<EncoderCall>>,
    echo: AtomicBool,
    reject: Mutex<Option<String>>,
}

/// Encoder that records every call. Sets succeed without echo unless
/// told otherwise.
#[derive(Clone, Default)]
pub struct ScriptedEncoder {
    script: Arc<EncoderScript>,
    read_only: bool,
}

impl ScriptedEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// An encoder that can only read.
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }

    /// Echo written values back as the resulting state.
    pub fn echo(&self, echo: bool) {
        self.script.echo.store(echo, Ordering::SeqCst);
    }

    /// Reject the next writes as out of range with `detail`.
    pub fn reject_with(&self, detail: Option<&str>) {
        *lock(&self.script.reject) = detail.map(str::to_owned);
    }

    pub fn calls(&self) -> Vec<EncoderCall> {
        lock(&self.script.calls).clone()
    }
}

#[async_trait]
impl Encode for ScriptedEncoder {
    fn can_get(&self) -> bool {
        true
    }

    fn can_set(&self) -> bool {
        !self.read_only
    }

    async fn get(&self, endpoint: &Endpoint, key: &str, _meta: &EncodeMeta) -> Result<(), Error> {
        lock(&self.script.calls).push(EncoderCall::Get {
            endpoint: endpoint.id,
            key: key.to_owned(),
        });
        Ok(())
    }

    async fn set(
        &self,
        endpoint: &Endpoint,
        key: &str,
        value: &FieldValue,
        _meta: &EncodeMeta,
    ) -> Result<Option<FieldMap>, Error> {
        lock(&self.script.calls).push(EncoderCall::Set {
            endpoint: endpoint.id,
            key: key.to_owned(),
            value: value.clone(),
        });
        if let Some(detail) = lock(&self.script.reject).clone() {
            return Err(Error::OutOfRange { detail });
        }
        if self.script.echo.load(Ordering::SeqCst) {
            let mut state = FieldMap::new();
            state.insert(key.to_owned(), value.clone());
            return Ok(Some(state));
        }
        Ok(None)
    }
}

/// Configure routine that counts runs and can be slowed down or failed.
#[derive(Clone, Default)]
pub struct CountingConfigure {
    runs: Arc<AtomicUsize>,
    delay: Duration,
    failing: Arc<AtomicBool>,
}

impl CountingConfigure {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Configure for CountingConfigure {
    async fn configure(&self, _device: &Device, _coordinator_endpoint: &Endpoint) -> Result<(), Error> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Converter {
                message: "bind failed".into(),
            });
        }
        Ok(())
    }
}

/// Reporting setup that counts runs and records triggers.
#[derive(Clone, Default)]
pub struct CountingReporting {
    triggers: Arc<Mutex<Vec<Option<ReportTrigger>>>>,
    runs: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
}

impl CountingReporting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn triggers(&self) -> Vec<Option<ReportTrigger>> {
        lock(&self.triggers).clone()
    }
}

#[async_trait]
impl Reporting for CountingReporting {
    fn should_setup(&self, _device: &Device, trigger: Option<ReportTrigger>) -> bool {
        lock(&self.triggers).push(trigger);
        true
    }

    async fn setup(&self, _device: &Device, _coordinator_endpoint: &Endpoint) -> Result<(), Error> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Request("configure reporting not acknowledged".into()));
        }
        Ok(())
    }
}

// ── Builders ─────────────────────────────────────────────────────────

/// An interviewed end device reporting `model_id`.
pub fn end_device(identity: &str, model_id: &str) -> Device {
    let mut device = Device::new(identity, DeviceType::EndDevice);
    device.model_id = Some(model_id.to_owned());
    device.interview_completed = true;
    device
}

/// An attribute report from `device` carrying `payload`.
pub fn report(device: &Device, cluster: &str, payload: serde_json::Value) -> Message {
    let mut message = Message::new(device.clone(), cluster, "attributeReport");
    message.payload = payload;
    message.linkquality = Some(120);
    message
}

/// Decoder output taken straight from the payload's top-level members.
pub fn payload_fields(message: &Message) -> FieldMap {
    match &message.payload {
        serde_json::Value::Object(members) => members
            .iter()
            .map(|(key, value)| (key.clone(), FieldValue::from(value.clone())))
            .collect(),
        _ => FieldMap::new(),
    }
}
