// ── Connection supervisor ──
//
// Owns the coordinator link: builds a fresh coordinator on every
// (re)connect, retries failed starts, soft-resets an idle link, and
// republishes coordinator traffic on the event bus. Start, stop and
// soft reset are serialized through a single command processor task.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use meshbridge_api::{
    Coordinator, CoordinatorEvent, CoordinatorFactory, ConverterRegistry, Endpoint, ResetMode,
};
use strum::Display;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::event::{BridgeEvent, EventBus};
use crate::pipeline::{self, Admission};

const COMMAND_CHANNEL_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum LinkState {
    Idle,
    Starting,
    Started,
    /// The last start failed; a retry is pending.
    Error,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkCommand {
    Start,
    Stop,
    SoftReset,
    AdapterDisconnected,
    WatchdogExpired,
    RetryDue,
}

struct LinkEnvelope {
    command: LinkCommand,
    response_tx: Option<oneshot::Sender<Result<(), BridgeError>>>,
}

impl LinkEnvelope {
    fn notify(command: LinkCommand) -> Self {
        Self {
            command,
            response_tx: None,
        }
    }
}

struct LinkHandle {
    coordinator: Arc<dyn Coordinator>,
}

// ── Supervisor ───────────────────────────────────────────────────────

/// Cheaply cloneable handle to the link supervisor.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    config: BridgeConfig,
    factory: Arc<dyn CoordinatorFactory>,
    converters: Arc<dyn ConverterRegistry>,
    bus: EventBus,
    link: ArcSwapOption<LinkHandle>,
    state: watch::Sender<LinkState>,
    /// Idle watchdog deadline; `None` while disarmed.
    watchdog: watch::Sender<Option<Instant>>,
    last_message: watch::Sender<Option<DateTime<Utc>>>,
    command_tx: mpsc::Sender<LinkEnvelope>,
    command_rx: Mutex<Option<mpsc::Receiver<LinkEnvelope>>>,
    cancel: CancellationToken,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(
        config: BridgeConfig,
        factory: Arc<dyn CoordinatorFactory>,
        converters: Arc<dyn ConverterRegistry>,
        bus: EventBus,
    ) -> Self {
        let (state, _) = watch::channel(LinkState::Idle);
        let (watchdog, _) = watch::channel(None);
        let (last_message, _) = watch::channel(None);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);

        Self {
            inner: Arc::new(SupervisorInner {
                config,
                factory,
                converters,
                bus,
                link: ArcSwapOption::empty(),
                state,
                watchdog,
                last_message,
                command_tx,
                command_rx: Mutex::new(Some(command_rx)),
                cancel: CancellationToken::new(),
                task_handles: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Spawn the command processor and the idle watchdog. Idempotent.
    pub async fn launch(&self) {
        let Some(rx) = self.inner.command_rx.lock().await.take() else {
            return;
        };
        let mut handles = self.inner.task_handles.lock().await;
        handles.push(tokio::spawn(command_processor_task(Arc::clone(&self.inner), rx)));
        handles.push(tokio::spawn(watchdog_task(Arc::clone(&self.inner))));
        debug!("link supervisor launched");
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Bring the link up. Failures are reported on the bus and retried,
    /// never returned.
    pub async fn start(&self) {
        if let Err(e) = self.request(LinkCommand::Start).await {
            debug!(error = %e, "start did not complete");
        }
    }

    /// Take the link down, waiting for an in-flight start first.
    ///
    /// Waiting longer than the retry interval is fatal: an exit event is
    /// emitted and the timeout returned.
    pub async fn stop(&self) -> Result<(), BridgeError> {
        let mut state = self.inner.state.subscribe();
        if *state.borrow_and_update() == LinkState::Starting {
            let budget = self.inner.config.retry_interval;
            let settled = tokio::time::timeout(budget, state.wait_for(|s| *s != LinkState::Starting))
                .await
                .is_ok();
            if !settled {
                let err = BridgeError::Timeout {
                    timeout_secs: budget.as_secs(),
                };
                error!(error = %err, "coordinator did not settle before stop");
                self.inner.bus.emit(BridgeEvent::Exit {
                    reason: "Timeout error on stop coordinator".into(),
                    code: 1,
                });
                return Err(err);
            }
        }
        self.request(LinkCommand::Stop).await
    }

    pub async fn soft_reset(&self) -> Result<(), BridgeError> {
        self.request(LinkCommand::SoftReset).await
    }

    /// Stop the link and every background task.
    pub async fn shutdown(&self) {
        if let Err(e) = self.stop().await {
            warn!(error = %e, "stop during shutdown failed");
        }
        self.inner.cancel.cancel();
        let mut handles = self.inner.task_handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
        debug!("link supervisor shut down");
    }

    async fn request(&self, command: LinkCommand) -> Result<(), BridgeError> {
        self.launch().await;
        let (tx, rx) = oneshot::channel();
        self.inner
            .command_tx
            .send(LinkEnvelope {
                command,
                response_tx: Some(tx),
            })
            .await
            .map_err(|_| BridgeError::Internal("link supervisor is not running".into()))?;
        rx.await
            .map_err(|_| BridgeError::Internal("link supervisor dropped the request".into()))?
    }

    // ── Observation ──────────────────────────────────────────────────

    pub fn link_state(&self) -> watch::Receiver<LinkState> {
        self.inner.state.subscribe()
    }

    pub fn state(&self) -> LinkState {
        *self.inner.state.borrow()
    }

    pub fn is_started(&self) -> bool {
        self.state() == LinkState::Started
    }

    pub fn events(&self) -> broadcast::Receiver<Arc<BridgeEvent>> {
        self.inner.bus.subscribe()
    }

    /// The live coordinator, if a link was ever established.
    pub fn coordinator(&self) -> Option<Arc<dyn Coordinator>> {
        self.inner.link.load_full().map(|l| Arc::clone(&l.coordinator))
    }

    /// Endpoint on the coordinator that devices report to.
    pub fn coordinator_endpoint(&self) -> Option<Endpoint> {
        self.coordinator()?
            .coordinator()?
            .endpoint(self.inner.config.coordinator_endpoint)
    }

    /// When the last admitted message arrived.
    pub fn last_message(&self) -> watch::Receiver<Option<DateTime<Utc>>> {
        self.inner.last_message.subscribe()
    }

    pub fn watchdog_deadline(&self) -> Option<Instant> {
        *self.inner.watchdog.borrow()
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("state", &self.state())
            .field("watchdog", &self.watchdog_deadline())
            .finish_non_exhaustive()
    }
}

impl SupervisorInner {
    fn set_state(&self, state: LinkState) {
        self.state.send_replace(state);
    }

    fn arm_watchdog(&self) {
        self.watchdog.send_replace(Some(Instant::now() + self.config.idle_timeout));
    }

    fn disarm_watchdog(&self) {
        self.watchdog.send_replace(None);
    }

    /// Push the watchdog deadline out, if it is armed.
    fn touch(&self) {
        let idle = self.config.idle_timeout;
        self.watchdog.send_if_modified(|deadline| match deadline {
            Some(at) => {
                *at = Instant::now() + idle;
                true
            }
            None => false,
        });
    }

    async fn notify(&self, command: LinkCommand) {
        if self.command_tx.send(LinkEnvelope::notify(command)).await.is_err() {
            debug!(?command, "link supervisor gone, dropping command");
        }
    }

    /// Republish one coordinator event on the bus.
    async fn forward(&self, coordinator: &dyn Coordinator, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::Error(message) => {
                warn!(error = %message, "coordinator error");
                self.bus.emit(BridgeEvent::LinkError(message));
            }
            CoordinatorEvent::AdapterDisconnected => {
                warn!("adapter disconnected");
                self.notify(LinkCommand::AdapterDisconnected).await;
            }
            CoordinatorEvent::DeviceLeave { identity } => self.bus.emit(BridgeEvent::DeviceLeave { identity }),
            CoordinatorEvent::DeviceJoined { device } => self.bus.emit(BridgeEvent::DeviceJoined { device }),
            CoordinatorEvent::DeviceInterview { status, device } => {
                self.bus.emit(BridgeEvent::DeviceInterview { status, device });
            }
            CoordinatorEvent::DeviceAnnounce { device } => self.bus.emit(BridgeEvent::DeviceAnnounce { device }),
            CoordinatorEvent::Message(message) => {
                let own = coordinator.coordinator().map(|d| d.identity);
                if let Admission::Admit(mapped) = pipeline::admit(&message, own.as_ref(), self.converters.as_ref()) {
                    self.touch();
                    self.last_message.send_replace(Some(Utc::now()));
                    self.bus.emit(BridgeEvent::Message {
                        message: Arc::new(message),
                        mapped,
                    });
                }
            }
        }
    }
}

// ── Command processor ────────────────────────────────────────────────

/// State owned by the command processor task alone.
#[derive(Default)]
struct LinkActor {
    retry: Option<CancellationToken>,
    pump: Option<CancellationToken>,
    /// Set by an explicit stop, cleared by the next explicit start.
    halted: bool,
}

impl LinkActor {
    async fn handle(&mut self, inner: &Arc<SupervisorInner>, command: LinkCommand) -> Result<(), BridgeError> {
        if self.halted && command != LinkCommand::Start && command != LinkCommand::Stop {
            debug!(?command, "link stopped, ignoring queued command");
            return match command {
                LinkCommand::SoftReset => Err(BridgeError::not_connected()),
                _ => Ok(()),
            };
        }
        match command {
            LinkCommand::Start => {
                self.halted = false;
                self.establish(inner).await
            }
            LinkCommand::RetryDue => self.establish(inner).await,
            LinkCommand::Stop => {
                let result = self.stop(inner).await;
                self.halted = result.is_ok();
                result
            }
            LinkCommand::SoftReset => self.soft_reset(inner).await,
            LinkCommand::AdapterDisconnected => {
                inner.disarm_watchdog();
                inner.set_state(LinkState::Idle);
                inner.bus.emit(BridgeEvent::Stopped);
                self.establish(inner).await
            }
            LinkCommand::WatchdogExpired => {
                if *inner.state.borrow() != LinkState::Started {
                    return Ok(());
                }
                warn!(idle_secs = inner.config.idle_timeout.as_secs(), "no traffic from coordinator, soft resetting");
                self.soft_reset(inner).await
            }
        }
    }

    async fn establish(&mut self, inner: &Arc<SupervisorInner>) -> Result<(), BridgeError> {
        if matches!(*inner.state.borrow(), LinkState::Starting | LinkState::Started) {
            debug!("coordinator already starting or started");
            return Ok(());
        }

        self.teardown(inner).await;
        self.cancel_retry();
        inner.set_state(LinkState::Starting);
        info!("starting coordinator");

        match self.connect(inner).await {
            Ok(()) => {
                inner.bus.emit(BridgeEvent::PermitJoin(false));
                inner.set_state(LinkState::Started);
                inner.bus.emit(BridgeEvent::Started);
                inner.arm_watchdog();
                info!("coordinator started");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, retry_secs = inner.config.retry_interval.as_secs(), "coordinator start failed");
                inner.bus.emit(BridgeEvent::LinkError(e.to_string()));
                self.schedule_retry(inner);
                inner.disarm_watchdog();
                inner.set_state(LinkState::Error);
                inner.bus.emit(BridgeEvent::Stopped);
                inner.bus.emit(BridgeEvent::StartError(e.to_string()));
                Err(e.into())
            }
        }
    }

    async fn connect(&mut self, inner: &Arc<SupervisorInner>) -> Result<(), meshbridge_api::Error> {
        let coordinator = inner.factory.create()?;
        inner.link.store(Some(Arc::new(LinkHandle {
            coordinator: Arc::clone(&coordinator),
        })));

        // Subscribe before starting so no early event is missed.
        let pump = inner.cancel.child_token();
        tokio::spawn(pump_task(
            Arc::clone(inner),
            Arc::clone(&coordinator),
            coordinator.subscribe(),
            pump.clone(),
        ));
        self.pump = Some(pump);

        coordinator.start().await?;
        coordinator.permit_join(false).await
    }

    async fn teardown(&mut self, inner: &SupervisorInner) {
        if let Some(pump) = self.pump.take() {
            pump.cancel();
        }
        if let Some(link) = inner.link.swap(None) {
            if let Err(e) = link.coordinator.stop_adapter().await {
                warn!(error = %e, "failed to stop previous adapter");
            }
        }
    }

    async fn stop(&mut self, inner: &SupervisorInner) -> Result<(), BridgeError> {
        self.cancel_retry();
        let started = *inner.state.borrow() == LinkState::Started;
        let Some(link) = inner.link.load_full().filter(|_| started) else {
            inner.set_state(LinkState::Idle);
            return Ok(());
        };

        match link.coordinator.stop().await {
            Ok(()) => {
                if let Some(pump) = self.pump.take() {
                    pump.cancel();
                }
                inner.disarm_watchdog();
                inner.set_state(LinkState::Idle);
                inner.bus.emit(BridgeEvent::Stopped);
                info!("coordinator stopped");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "coordinator stop failed");
                inner.bus.emit(BridgeEvent::LinkError(e.to_string()));
                inner.bus.emit(BridgeEvent::Exit {
                    reason: e.to_string(),
                    code: 1,
                });
                Err(e.into())
            }
        }
    }

    async fn soft_reset(&mut self, inner: &Arc<SupervisorInner>) -> Result<(), BridgeError> {
        info!("soft resetting coordinator");
        inner.disarm_watchdog();
        inner.set_state(LinkState::Idle);
        inner.bus.emit(BridgeEvent::Stopped);

        if let Some(link) = inner.link.load_full() {
            if let Err(e) = link.coordinator.reset(ResetMode::Soft).await {
                warn!(error = %e, "soft reset request failed");
            }
        }

        if let Err(e) = self.establish(inner).await {
            error!(error = %e, "restart after soft reset failed");
            inner.bus.emit(BridgeEvent::Exit {
                reason: e.to_string(),
                code: 1,
            });
            return Err(e);
        }
        Ok(())
    }

    fn schedule_retry(&mut self, inner: &Arc<SupervisorInner>) {
        self.cancel_retry();
        let token = inner.cancel.child_token();
        let cancel = token.clone();
        let delay = inner.config.retry_interval;
        let tx = inner.command_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    let _ = tx.send(LinkEnvelope::notify(LinkCommand::RetryDue)).await;
                }
            }
        });
        self.retry = Some(token);
    }

    fn cancel_retry(&mut self) {
        if let Some(retry) = self.retry.take() {
            retry.cancel();
        }
    }
}

async fn command_processor_task(inner: Arc<SupervisorInner>, mut rx: mpsc::Receiver<LinkEnvelope>) {
    let cancel = inner.cancel.clone();
    let mut actor = LinkActor::default();

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            envelope = rx.recv() => {
                let Some(envelope) = envelope else { break };
                let result = actor.handle(&inner, envelope.command).await;
                match envelope.response_tx {
                    Some(tx) => {
                        let _ = tx.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            debug!(command = ?envelope.command, error = %e, "background link command failed");
                        }
                    }
                }
            }
        }
    }

    actor.cancel_retry();
    if let Some(pump) = actor.pump.take() {
        pump.cancel();
    }
}

// ── Background tasks ─────────────────────────────────────────────────

/// Fire a soft reset when the armed deadline passes without traffic.
async fn watchdog_task(inner: Arc<SupervisorInner>) {
    let cancel = inner.cancel.clone();
    let mut deadline_rx = inner.watchdog.subscribe();

    loop {
        let deadline = *deadline_rx.borrow_and_update();
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            changed = deadline_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            () = sleep_until(deadline) => {
                inner.disarm_watchdog();
                inner.notify(LinkCommand::WatchdogExpired).await;
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Forward one coordinator's events until the link is torn down.
async fn pump_task(
    inner: Arc<SupervisorInner>,
    coordinator: Arc<dyn Coordinator>,
    mut rx: broadcast::Receiver<CoordinatorEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Ok(event) => inner.forward(coordinator.as_ref(), event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "coordinator event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
