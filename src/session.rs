//! Connection supervision.
//!
//! [`SessionLifecycleController::run`] drives an explicit state machine:
//!
//! ```text
//! Idle -> Connecting -> Open -> Closed(reason) -> (policy) -> Connecting ...
//!                                              \-> Halt
//! ```
//!
//! Each transport session delivers its events on one channel per kind. A
//! single loop drains them, so events are never handled in parallel; only
//! suspension points inside a handler let the streams interleave.

use crate::error::SessionError;
use crate::pair_code::{PairingFlow, PendingPairing};
use crate::router::{EventRouter, SessionHandle};
use crate::store::{CredentialStore, MetadataCache};
use crate::transport::{TransportAuth, TransportFactory};
use crate::types::events::{ConnectionStatus, ConnectionUpdate, DisconnectReason, EventStreams};
use log::{debug, error, info, warn};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    Closed(Option<DisconnectReason>),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Open => write!(f, "open"),
            SessionState::Closed(Some(reason)) => write!(f, "closed: {reason}"),
            SessionState::Closed(None) => write!(f, "closed"),
        }
    }
}

/// Published on every state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Closed transitions since the session was last open.
    pub retry_count: u32,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            retry_count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Retry,
    RetryWithBackoff(Duration),
    Halt,
}

/// Decides what happens after the connection closes.
pub trait ReconnectPolicy: Send + Sync {
    /// `retry_count` already includes the closure being decided on.
    fn decide(&self, reason: Option<DisconnectReason>, retry_count: u32) -> ReconnectDecision;
}

/// Reconnects immediately after every closure, logouts included.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysRetry;

impl ReconnectPolicy for AlwaysRetry {
    fn decide(&self, _reason: Option<DisconnectReason>, _retry_count: u32) -> ReconnectDecision {
        ReconnectDecision::Retry
    }
}

/// Reconnects immediately unless the account was logged out.
#[derive(Debug, Default, Clone, Copy)]
pub struct HaltOnLogout;

impl ReconnectPolicy for HaltOnLogout {
    fn decide(&self, reason: Option<DisconnectReason>, _retry_count: u32) -> ReconnectDecision {
        if reason.is_some_and(|r| r.is_logged_out()) {
            ReconnectDecision::Halt
        } else {
            ReconnectDecision::Retry
        }
    }
}

/// Doubles the delay on each consecutive closure, up to `max`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
    pub halt_on_logout: bool,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            halt_on_logout: false,
        }
    }
}

impl ReconnectPolicy for ExponentialBackoff {
    fn decide(&self, reason: Option<DisconnectReason>, retry_count: u32) -> ReconnectDecision {
        if self.halt_on_logout && reason.is_some_and(|r| r.is_logged_out()) {
            return ReconnectDecision::Halt;
        }
        let exponent = retry_count.saturating_sub(1).min(16);
        let delay = self.base.saturating_mul(1u32 << exponent).min(self.max);
        ReconnectDecision::RetryWithBackoff(delay)
    }
}

/// Why [`SessionLifecycleController::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    Shutdown,
    Halted(Option<DisconnectReason>),
}

/// A transport session that has been created but not yet driven.
pub struct ActiveSession {
    handle: SessionHandle,
    streams: EventStreams,
    pairing_task: Option<JoinHandle<()>>,
}

impl ActiveSession {
    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }
}

enum SessionEnd {
    Shutdown,
    Closed(Option<DisconnectReason>),
}

pub struct SessionLifecycleController {
    credentials: Arc<CredentialStore>,
    cache: Arc<MetadataCache>,
    factory: Arc<dyn TransportFactory>,
    router: EventRouter,
    policy: Arc<dyn ReconnectPolicy>,
    pairing: Option<PairingFlow>,
    retry_count: AtomicU32,
    status_tx: watch::Sender<SessionStatus>,
    qr_tx: watch::Sender<Option<String>>,
    pairing_tx: Arc<watch::Sender<Option<PendingPairing>>>,
    shutdown: Notify,
    is_running: AtomicBool,
}

impl SessionLifecycleController {
    pub fn new(
        credentials: Arc<CredentialStore>,
        cache: Arc<MetadataCache>,
        factory: Arc<dyn TransportFactory>,
        router: EventRouter,
    ) -> Self {
        Self {
            credentials,
            cache,
            factory,
            router,
            policy: Arc::new(AlwaysRetry),
            pairing: None,
            retry_count: AtomicU32::new(0),
            status_tx: watch::channel(SessionStatus::default()).0,
            qr_tx: watch::channel(None).0,
            pairing_tx: Arc::new(watch::channel(None).0),
            shutdown: Notify::new(),
            is_running: AtomicBool::new(false),
        }
    }

    pub fn with_reconnect_policy(mut self, policy: Arc<dyn ReconnectPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_pairing(mut self, pairing: PairingFlow) -> Self {
        self.pairing = Some(pairing);
        self
    }

    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    /// The most recent QR string, cleared once the session opens.
    pub fn qr_codes(&self) -> watch::Receiver<Option<String>> {
        self.qr_tx.subscribe()
    }

    pub fn pairing(&self) -> watch::Receiver<Option<PendingPairing>> {
        self.pairing_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Asks [`run`](Self::run) to disconnect and return. A request made while
    /// the loop is not running is kept and ends the next run immediately.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    fn publish(&self, state: SessionState) {
        let status = SessionStatus {
            state,
            retry_count: self.retry_count.load(Ordering::SeqCst),
        };
        debug!(target: "Session", "State -> {} (retries: {})", status.state, status.retry_count);
        self.status_tx.send_replace(status);
    }

    /// Loads the credentials and creates a transport session bound to them.
    /// Returns as soon as the transport exists; connection progress arrives
    /// as events.
    pub async fn start(&self) -> Result<ActiveSession, SessionError> {
        let credentials = self.credentials.snapshot().await;
        let registered = credentials.registered;
        let auth = TransportAuth {
            credentials,
            keys: self.credentials.clone(),
            message_loader: self.cache.clone(),
        };

        self.publish(SessionState::Connecting);
        let (transport, streams) = self.factory.create_transport(auth).await?;
        let handle = SessionHandle::new(transport, self.cache.clone());

        let pairing_task = if registered {
            None
        } else {
            self.spawn_pairing(&handle)
        };

        Ok(ActiveSession {
            handle,
            streams,
            pairing_task,
        })
    }

    fn spawn_pairing(&self, handle: &SessionHandle) -> Option<JoinHandle<()>> {
        let flow = self.pairing.clone()?;
        if let Err(e) = flow.validate() {
            error!(
                target: "Session/PairCode",
                "Invalid pairing configuration: {e}. Pairing aborted, the session stays unauthenticated."
            );
            return None;
        }

        let transport = handle.transport().clone();
        let pairing_tx = self.pairing_tx.clone();
        Some(tokio::spawn(async move {
            match flow.request_code(transport.as_ref()).await {
                Ok(pending) => {
                    if let Some(code) = &pending.code {
                        info!(target: "Session/PairCode", "Pairing code: {code}");
                        info!(
                            target: "Session/PairCode",
                            "Enter it on your phone under Linked Devices > Link with phone number instead"
                        );
                    }
                    pairing_tx.send_replace(Some(pending));
                }
                Err(e) => {
                    error!(target: "Session/PairCode", "Failed to request pairing code: {e}");
                }
            }
        }))
    }

    /// Supervises sessions until shut down or halted by the reconnect policy.
    pub async fn run(&self) -> Result<SessionExit, SessionError> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(SessionError::AlreadyRunning);
        }
        let _running = scopeguard::guard((), |_| {
            self.is_running.store(false, Ordering::SeqCst);
        });

        loop {
            let started = tokio::select! {
                biased;
                _ = self.shutdown.notified() => None,
                started = self.start() => Some(started),
            };
            let reason = match started {
                None => return Ok(self.finish_shutdown()),
                Some(Ok(active)) => match self.drive(active).await {
                    SessionEnd::Shutdown => return Ok(self.finish_shutdown()),
                    SessionEnd::Closed(reason) => reason,
                },
                Some(Err(SessionError::Transport(e))) => {
                    error!(target: "Session", "Failed to create transport: {e:?}");
                    None
                }
                Some(Err(e)) => return Err(e),
            };

            let retry_count = self.retry_count.fetch_add(1, Ordering::SeqCst) + 1;
            self.publish(SessionState::Closed(reason));
            match reason {
                Some(reason) if reason.is_logged_out() => {
                    warn!(target: "Session", "Session logged out. Please re-authenticate.");
                }
                Some(reason) => info!(target: "Session", "Connection closed: {reason}"),
                None => info!(target: "Session", "Connection closed"),
            }

            match self.policy.decide(reason, retry_count) {
                ReconnectDecision::Retry => {
                    info!(target: "Session", "Reconnecting (attempt {retry_count})");
                }
                ReconnectDecision::RetryWithBackoff(delay) => {
                    info!(target: "Session", "Reconnecting in {delay:?} (attempt {retry_count})");
                    tokio::select! {
                        biased;
                        _ = self.shutdown.notified() => return Ok(self.finish_shutdown()),
                        _ = sleep(delay) => {}
                    }
                }
                ReconnectDecision::Halt => {
                    warn!(target: "Session", "Reconnect policy halted the session");
                    if reason.is_some_and(|r| r.is_logged_out())
                        && let Err(e) = self.credentials.clear().await
                    {
                        error!(target: "Session", "Failed to clear stale credentials: {e}");
                    }
                    return Ok(SessionExit::Halted(reason));
                }
            }
        }
    }

    fn finish_shutdown(&self) -> SessionExit {
        info!(target: "Session", "Session loop shutting down");
        self.publish(SessionState::Idle);
        SessionExit::Shutdown
    }

    async fn drive(&self, active: ActiveSession) -> SessionEnd {
        let ActiveSession {
            handle,
            mut streams,
            pairing_task,
        } = active;
        let _pairing = scopeguard::guard(pairing_task, |task| {
            if let Some(task) = task {
                task.abort();
            }
        });

        let end = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => break SessionEnd::Shutdown,
                update = streams.connection.recv() => match update {
                    Some(update) => {
                        if let Some(end) = self.on_connection_update(&handle, update) {
                            break end;
                        }
                    }
                    None => {
                        warn!(target: "Session", "Transport dropped its event channels");
                        break SessionEnd::Closed(None);
                    }
                },
                Some(update) = streams.creds.recv() => {
                    let registered = update.registered == Some(true);
                    if let Err(e) = self.router.route_credentials(update).await {
                        error!(target: "Session", "Failed to persist credentials: {e}");
                    }
                    if registered {
                        self.pairing_tx.send_replace(None);
                    }
                }
                Some(updates) = streams.contacts.recv() => self.router.route_contacts(updates),
                Some(update) = streams.group_participants.recv() => {
                    self.router.route_group_participants(&handle, update).await;
                }
                Some(upsert) = streams.messages.recv() => {
                    self.router.route_messages(&handle, upsert).await;
                }
            }
        };

        // Credential changes queued behind the closing update must survive
        // into the next session.
        while let Ok(update) = streams.creds.try_recv() {
            if let Err(e) = self.router.route_credentials(update).await {
                error!(target: "Session", "Failed to persist credentials: {e}");
            }
        }
        if matches!(end, SessionEnd::Closed(_)) {
            self.drain_queued(&handle, &mut streams).await;
        }

        handle.transport().disconnect().await;
        end
    }

    /// Routes events the transport queued before it reported the closure.
    /// The biased loop takes the close first, but these were emitted earlier.
    async fn drain_queued(&self, handle: &SessionHandle, streams: &mut EventStreams) {
        let mut drained = 0usize;
        while let Ok(updates) = streams.contacts.try_recv() {
            self.router.route_contacts(updates);
            drained += 1;
        }
        while let Ok(update) = streams.group_participants.try_recv() {
            self.router.route_group_participants(handle, update).await;
            drained += 1;
        }
        while let Ok(upsert) = streams.messages.try_recv() {
            self.router.route_messages(handle, upsert).await;
            drained += 1;
        }
        if drained > 0 {
            debug!(target: "Session", "Routed {drained} events queued before the closure");
        }
    }

    fn on_connection_update(
        &self,
        handle: &SessionHandle,
        update: ConnectionUpdate,
    ) -> Option<SessionEnd> {
        if let Some(qr) = update.qr {
            info!(target: "Session", "QR code received, scan it or use the pairing code: {qr}");
            self.qr_tx.send_replace(Some(qr));
        }

        match update.status {
            Some(ConnectionStatus::Open) => {
                self.retry_count.store(0, Ordering::SeqCst);
                self.publish(SessionState::Open);
                self.qr_tx.send_replace(None);
                self.pairing_tx.send_replace(None);
                match handle.user() {
                    Some(me) => info!(
                        target: "Session",
                        "Connected as {} ({})",
                        me.name.as_deref().unwrap_or("unnamed"),
                        me.id
                    ),
                    None => info!(target: "Session", "Connected"),
                }
                None
            }
            Some(ConnectionStatus::Connecting) => {
                self.publish(SessionState::Connecting);
                None
            }
            Some(ConnectionStatus::Closed) => Some(SessionEnd::Closed(update.last_disconnect)),
            None => None,
        }
    }
}
