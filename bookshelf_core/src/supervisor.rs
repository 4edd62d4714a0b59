//! Supervision of the single shared database session.
//!
//! A [`ConnectionSupervisor`] establishes one session through a [`Connector`], publishes it to
//! every [`ConnectionHandle`] and re-establishes it in the background whenever a loss is
//! reported. Holders never cache the session itself: each statement fetches the current one
//! through the handle, so a reconnection swaps the session underneath all of them.

use std::fmt;
use std::ops::{ControlFlow, Deref};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{BoxError, BrokerError, BrokerResult};

/// Lifecycle of the supervised connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SupervisorState::Disconnected => "disconnected",
            SupervisorState::Connecting => "connecting",
            SupervisorState::Connected => "connected",
        })
    }
}

/// How the delay between reconnection attempts evolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Always wait the base backoff.
    Fixed,
    /// Double the base backoff after every failed attempt, capped at `max`.
    Exponential { max: Duration },
}

/// Reconnection settings of a [`ConnectionSupervisor`]. Retries are never abandoned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub backoff: Duration,
    pub strategy: BackoffStrategy,
    /// Upper bound for a single handshake, initial or not.
    pub connect_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(10),
            strategy: BackoffStrategy::Fixed,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    pub fn fixed(backoff: Duration) -> Self {
        Self {
            backoff,
            ..Self::default()
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Delay before reconnection attempt number `attempt` (0-based) of one outage.
    pub fn delay(&self, attempt: u32) -> Duration {
        match self.strategy {
            BackoffStrategy::Fixed => self.backoff,
            BackoffStrategy::Exponential { max } => {
                let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
                self.backoff.saturating_mul(factor).min(max)
            }
        }
    }
}

/// A live database session as seen by the broker.
///
/// The broker only needs to issue transaction control statements and to tell connection
/// failures apart from ordinary statement failures; everything else is backend specific.
#[async_trait::async_trait]
pub trait Session: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Run one or more statements without parameters.
    async fn batch_execute(&self, sql: &str) -> Result<(), Self::Error>;

    /// True when `error` means the session itself is gone.
    fn is_disconnect(error: &Self::Error) -> bool;

    fn is_closed(&self) -> bool;

    /// Forcibly close the session. In-flight statements fail.
    fn close(&self);
}

/// Establishes sessions. Called once by `start` and again after every loss.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    type Session: Session;

    /// Open a new session. Asynchronous failures of the session must be reported through
    /// `monitor`.
    async fn connect(&self, monitor: LossMonitor) -> Result<Self::Session, BoxError>;

    /// Human readable target for logs. Must not contain credentials.
    fn describe(&self) -> String;
}

#[derive(Debug)]
struct LossEvent {
    generation: u64,
    reason: String,
}

/// Reports the loss of one particular session to its supervisor.
#[derive(Debug, Clone)]
pub struct LossMonitor {
    generation: u64,
    tx: mpsc::UnboundedSender<LossEvent>,
}

impl LossMonitor {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn report(&self, reason: impl Into<String>) {
        // The receiver only goes away with the supervisor, at which point nobody cares.
        let _ = self.tx.send(LossEvent {
            generation: self.generation,
            reason: reason.into(),
        });
    }
}

#[derive(Debug, thiserror::Error)]
#[error("connect timed out after {0:?}")]
struct ConnectTimeout(Duration);

/// An installed session together with its generation and statement gate.
pub struct SessionSlot<S> {
    session: S,
    generation: u64,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl<S: Session> SessionSlot<S> {
    fn new(session: S, generation: u64) -> Self {
        Self {
            session,
            generation,
            gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Wait for exclusive use of the session.
    pub async fn lease(self: &Arc<Self>) -> SessionLease<S> {
        let gate = self.gate.clone().lock_owned().await;
        SessionLease {
            slot: self.clone(),
            _gate: gate,
        }
    }
}

/// Exclusive use of a session. Statements issued through one lease are never interleaved with
/// statements of another.
pub struct SessionLease<S> {
    slot: Arc<SessionSlot<S>>,
    _gate: OwnedMutexGuard<()>,
}

impl<S: Session> SessionLease<S> {
    pub fn generation(&self) -> u64 {
        self.slot.generation
    }
}

impl<S> Deref for SessionLease<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.slot.session
    }
}

struct Shared<S> {
    current: Mutex<Option<Arc<SessionSlot<S>>>>,
    state: watch::Sender<SupervisorState>,
    losses: mpsc::UnboundedSender<LossEvent>,
    generation: AtomicU64,
    reconnect_attempts: AtomicU64,
}

/// Shared reference to the supervised session. Cheap to clone; hand one to every repository.
pub struct ConnectionHandle<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for ConnectionHandle<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<S> fmt::Debug for ConnectionHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("state", &*self.shared.state.borrow())
            .field("generation", &self.shared.generation.load(Ordering::Relaxed))
            .finish()
    }
}

impl<S: Session> ConnectionHandle<S> {
    fn new(losses: mpsc::UnboundedSender<LossEvent>) -> Self {
        let (state, _) = watch::channel(SupervisorState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                current: Mutex::new(None),
                state,
                losses,
                generation: AtomicU64::new(0),
                reconnect_attempts: AtomicU64::new(0),
            }),
        }
    }

    /// The currently installed session, or `ConnectionUnavailable` while reconnecting.
    pub fn current(&self) -> BrokerResult<Arc<SessionSlot<S>>> {
        self.lock().clone().ok_or_else(BrokerError::unavailable)
    }

    /// Lease the current session for the duration of one or more statements.
    pub async fn lease(&self) -> BrokerResult<SessionLease<S>> {
        let slot = self.current()?;
        Ok(slot.lease().await)
    }

    pub fn state(&self) -> SupervisorState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.shared.state.subscribe()
    }

    /// Resolve once the supervisor reaches `target`.
    pub async fn wait_for(&self, target: SupervisorState) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|state| *state == target).await;
    }

    /// Reconnection attempts made since the supervisor was created.
    pub fn reconnect_attempts(&self) -> u64 {
        self.shared.reconnect_attempts.load(Ordering::Relaxed)
    }

    /// Report that the session of `generation` failed. Reports for replaced sessions are ignored.
    pub fn report_loss(&self, generation: u64, reason: impl Into<String>) {
        let _ = self.shared.losses.send(LossEvent {
            generation,
            reason: reason.into(),
        });
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<SessionSlot<S>>>> {
        self.shared
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn next_monitor(&self) -> LossMonitor {
        LossMonitor {
            generation: self.shared.generation.fetch_add(1, Ordering::Relaxed) + 1,
            tx: self.shared.losses.clone(),
        }
    }

    fn install(&self, slot: SessionSlot<S>) {
        *self.lock() = Some(Arc::new(slot));
        self.set_state(SupervisorState::Connected);
    }

    fn clear(&self) -> Option<Arc<SessionSlot<S>>> {
        self.lock().take()
    }

    fn clear_if_current(&self, generation: u64) -> Option<Arc<SessionSlot<S>>> {
        let mut current = self.lock();
        if current.as_ref().map(|slot| slot.generation) == Some(generation) {
            current.take()
        } else {
            None
        }
    }

    fn set_state(&self, state: SupervisorState) {
        let previous = self.shared.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "supervisor state changed");
        }
    }
}

struct Watcher {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Owns the shared session and keeps it alive.
pub struct ConnectionSupervisor<C: Connector> {
    connector: Arc<C>,
    policy: ReconnectPolicy,
    handle: ConnectionHandle<C::Session>,
    losses: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<LossEvent>>>,
    watcher: Option<Watcher>,
}

impl<C: Connector> ConnectionSupervisor<C> {
    pub fn new(connector: C, policy: ReconnectPolicy) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            connector: Arc::new(connector),
            policy,
            handle: ConnectionHandle::new(tx),
            losses: Arc::new(tokio::sync::Mutex::new(rx)),
            watcher: None,
        }
    }

    pub fn handle(&self) -> ConnectionHandle<C::Session> {
        self.handle.clone()
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn state(&self) -> SupervisorState {
        self.handle.state()
    }

    /// Establish the initial session and start watching it.
    ///
    /// A failed initial handshake is returned as [`BrokerError::Connection`] and is not retried.
    /// Calling `start` again while running returns the existing handle.
    pub async fn start(&mut self) -> BrokerResult<ConnectionHandle<C::Session>> {
        if self.watcher.is_some() {
            return Ok(self.handle.clone());
        }
        info!(target_db = %self.connector.describe(), "starting connection supervisor");
        self.handle.set_state(SupervisorState::Connecting);
        if let Err(e) = establish(&*self.connector, &self.policy, &self.handle).await {
            self.handle.set_state(SupervisorState::Disconnected);
            error!(error = %e.describe(), "initial connection failed");
            return Err(e);
        }

        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(watch_loop(
            self.connector.clone(),
            self.policy.clone(),
            self.handle.clone(),
            self.losses.clone(),
            stop_rx,
        ));
        self.watcher = Some(Watcher { stop, task });
        Ok(self.handle.clone())
    }

    /// Stop the watcher and close the current session. Stopping twice is a no-op.
    pub async fn stop(&mut self) -> BrokerResult<()> {
        let Some(watcher) = self.watcher.take() else {
            debug!("connection supervisor already stopped");
            return Ok(());
        };
        let _ = watcher.stop.send(());
        if let Err(e) = watcher.task.await {
            error!(error = %e, "connection watcher terminated abnormally");
        }
        if let Some(slot) = self.handle.clear() {
            slot.session.close();
        }
        self.handle.set_state(SupervisorState::Disconnected);
        info!("connection supervisor stopped");
        Ok(())
    }
}

#[async_trait::async_trait]
impl<C: Connector> crate::Daemon for ConnectionSupervisor<C> {
    type Error = BrokerError;

    fn name(&self) -> &str {
        "connection-supervisor"
    }

    async fn start(&mut self) -> BrokerResult<()> {
        ConnectionSupervisor::start(self).await.map(|_| ())
    }

    async fn stop(&mut self) -> BrokerResult<()> {
        ConnectionSupervisor::stop(self).await
    }
}

async fn establish<C: Connector>(
    connector: &C,
    policy: &ReconnectPolicy,
    handle: &ConnectionHandle<C::Session>,
) -> BrokerResult<u64> {
    let monitor = handle.next_monitor();
    let generation = monitor.generation();
    let session = match tokio::time::timeout(policy.connect_timeout, connector.connect(monitor)).await
    {
        Ok(Ok(session)) => session,
        Ok(Err(source)) => return Err(BrokerError::Connection { source }),
        Err(_) => return Err(BrokerError::connection(ConnectTimeout(policy.connect_timeout))),
    };
    handle.install(SessionSlot::new(session, generation));
    Ok(generation)
}

async fn watch_loop<C: Connector>(
    connector: Arc<C>,
    policy: ReconnectPolicy,
    handle: ConnectionHandle<C::Session>,
    losses: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<LossEvent>>>,
    mut stop: oneshot::Receiver<()>,
) {
    let mut losses = losses.lock().await;
    loop {
        tokio::select! {
            _ = &mut stop => break,
            event = losses.recv() => {
                let Some(event) = event else { break };
                let Some(lost) = handle.clear_if_current(event.generation) else {
                    debug!(generation = event.generation, "ignoring loss report for a replaced session");
                    continue;
                };
                handle.set_state(SupervisorState::Disconnected);
                warn!(generation = event.generation, reason = %event.reason, "connection lost");
                lost.session.close();
                drop(lost);
                if reconnect(&*connector, &policy, &handle, &mut stop).await.is_break() {
                    break;
                }
            }
        }
    }
    debug!("connection watcher stopped");
}

async fn reconnect<C: Connector>(
    connector: &C,
    policy: &ReconnectPolicy,
    handle: &ConnectionHandle<C::Session>,
    stop: &mut oneshot::Receiver<()>,
) -> ControlFlow<()> {
    let mut attempt: u32 = 0;
    loop {
        let delay = policy.delay(attempt);
        debug!(?delay, "waiting before reconnecting");
        tokio::select! {
            _ = &mut *stop => return ControlFlow::Break(()),
            _ = tokio::time::sleep(delay) => {}
        }

        attempt = attempt.saturating_add(1);
        let total = handle
            .shared
            .reconnect_attempts
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        #[cfg(feature = "metrics")]
        metrics::counter!("broker_reconnect_attempts_total", 1);
        handle.set_state(SupervisorState::Connecting);
        info!(attempt, total, target_db = %connector.describe(), "reconnecting");

        let outcome = tokio::select! {
            _ = &mut *stop => return ControlFlow::Break(()),
            outcome = establish(connector, policy, handle) => outcome,
        };
        match outcome {
            Ok(generation) => {
                info!(attempt, generation, "connection re-established");
                return ControlFlow::Continue(());
            }
            Err(e) => {
                warn!(attempt, error = %e.describe(), "reconnect attempt failed");
                handle.set_state(SupervisorState::Disconnected);
            }
        }
    }
}
