use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use relay_bus::{Bus, FrameSink, TopicRouter};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EndpointConfig;
use crate::transport::{Connection, ConnectionId, TransportEvent};

/// Observable phase of the relay connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Not searching; no connection is wanted.
    Idle,
    /// A connection attempt is in flight.
    Scanning,
    Open,
    /// The current socket failed; a `Closed` follows.
    Error,
    /// The socket went away. While searching this is immediately followed by
    /// another `Scanning`.
    Closed,
}

/// When and how often to retry after the relay socket goes away.
///
/// The default retries immediately and forever, which suits a peer on the
/// same machine.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Consecutive failed attempts tolerated before searching stops.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn exponential(initial_delay: Duration, max_delay: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            initial_delay,
            multiplier: 2.0,
            max_delay,
            max_attempts,
        }
    }

    /// Delay before the next attempt given the number of consecutive failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let ceiling = self.max_delay.max(self.initial_delay);
        let factor = self.multiplier.max(1.0).powi(failures.min(64) as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        if !millis.is_finite() || millis >= ceiling.as_millis() as f64 {
            ceiling
        } else {
            Duration::from_millis(millis as u64)
        }
    }

    pub fn exhausted(&self, failures: u32) -> bool {
        self.max_attempts.is_some_and(|max| failures >= max)
    }
}

struct ControllerState {
    searching: bool,
    next_id: ConnectionId,
    current: Option<Connection>,
    current_opened: bool,
    /// Connection that `stop()` released; it finishes closing in the background.
    closing: Option<Connection>,
    shut_down: bool,
    failures: u32,
    retry_pending: bool,
    attempts: u64,
}

struct Inner {
    endpoint: EndpointConfig,
    policy: ReconnectPolicy,
    router: TopicRouter,
    state: Mutex<ControllerState>,
    phase: watch::Sender<ConnectionPhase>,
    events: mpsc::UnboundedSender<(ConnectionId, TransportEvent)>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

/// Owns the relay socket and decides when to (re)connect it.
///
/// All socket events are handled on one task, so phase transitions are
/// serialized. Inbound frames are dispatched on that task as well.
#[derive(Clone)]
pub struct ReconnectController {
    inner: Arc<Inner>,
}

impl ReconnectController {
    /// Must be called from within a Tokio runtime.
    pub fn new(endpoint: EndpointConfig, policy: ReconnectPolicy, router: TopicRouter) -> Self {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (phase, _) = watch::channel(ConnectionPhase::Idle);
        let (shutdown, shutdown_rx) = oneshot::channel();
        let inner = Arc::new(Inner {
            endpoint,
            policy,
            router,
            state: Mutex::new(ControllerState {
                searching: false,
                next_id: 1,
                current: None,
                current_opened: false,
                closing: None,
                shut_down: false,
                failures: 0,
                retry_pending: false,
                attempts: 0,
            }),
            phase,
            events,
            shutdown: Mutex::new(Some(shutdown)),
            event_task: Mutex::new(None),
        });
        let task = tokio::spawn(event_loop(Arc::downgrade(&inner), events_rx, shutdown_rx));
        *inner.event_task.lock() = Some(task);
        Self { inner }
    }

    /// Bus whose publishes go out over this controller's current connection.
    pub fn bus(&self) -> Bus {
        Bus::new(self.inner.router.clone(), Arc::new(self.clone()))
    }

    pub fn router(&self) -> &TopicRouter {
        &self.inner.router
    }

    pub fn start(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.searching || state.shut_down {
                return;
            }
            state.searching = true;
            state.failures = 0;
        }
        info!(target = "relay.controller", url = %self.inner.endpoint.url, "searching for relay");
        self.inner.search();
    }

    /// Stops searching and closes the active connection. An attempt that is
    /// still handshaking is closed once it opens. The released connection no
    /// longer blocks a later `start()`.
    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            state.searching = false;
            if let Some(connection) = state.current.take() {
                connection.close();
                state.closing = Some(connection);
            }
        }
        info!(target = "relay.controller", "stopped searching");
        self.inner.set_phase(ConnectionPhase::Idle);
    }

    /// Stops searching, drops every connection and ends the event task.
    /// The controller cannot be started again afterwards.
    pub async fn shutdown(&self) {
        self.stop();
        {
            let mut state = self.inner.state.lock();
            state.shut_down = true;
            if let Some(connection) = state.closing.take() {
                connection.close();
            }
        }
        if let Some(signal) = self.inner.shutdown.lock().take() {
            let _ = signal.send(());
        }
        let task = self.inner.event_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        debug!(target = "relay.controller", "controller shut down");
    }

    /// Flips the searching flag the way the connection button does. Returns
    /// the new value.
    pub fn toggle(&self) -> bool {
        if self.is_searching() {
            self.stop();
            false
        } else {
            self.start();
            true
        }
    }

    pub fn is_searching(&self) -> bool {
        self.inner.state.lock().searching
    }

    pub fn phase(&self) -> ConnectionPhase {
        *self.inner.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<ConnectionPhase> {
        self.inner.phase.subscribe()
    }

    /// Number of connections created so far.
    pub fn attempts(&self) -> u64 {
        self.inner.state.lock().attempts
    }
}

impl FrameSink for ReconnectController {
    fn send_text(&self, text: String) -> bool {
        let state = self.inner.state.lock();
        match state.current.as_ref() {
            Some(connection) => connection.send(text),
            None => false,
        }
    }
}

impl Inner {
    fn set_phase(&self, phase: ConnectionPhase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            debug!(target = "relay.controller", ?previous, ?phase, "phase changed");
        }
    }

    /// Creates a connection unless one is already outstanding or searching
    /// has been switched off.
    fn search(&self) {
        let mut state = self.state.lock();
        if !state.searching || state.shut_down || state.current.is_some() {
            return;
        }
        let id = state.next_id;
        state.next_id += 1;
        state.attempts += 1;
        state.current_opened = false;
        state.current = Some(Connection::spawn(id, &self.endpoint, self.events.clone()));
        drop(state);
        debug!(target = "relay.controller", id, "connection attempt started");
        self.set_phase(ConnectionPhase::Scanning);
    }

    fn handle(self: &Arc<Self>, id: ConnectionId, event: TransportEvent) {
        let mut state = self.state.lock();
        if state.closing.as_ref().map(Connection::id) == Some(id) {
            match event {
                TransportEvent::Opened => {
                    if let Some(connection) = state.closing.as_ref() {
                        connection.close();
                    }
                }
                TransportEvent::Closed => {
                    state.closing = None;
                    debug!(target = "relay.controller", id, "released connection closed");
                }
                _ => {}
            }
            return;
        }
        if state.current.as_ref().map(Connection::id) != Some(id) {
            debug!(target = "relay.controller", id, ?event, "ignoring event from stale connection");
            return;
        }

        match event {
            TransportEvent::Opened => {
                state.current_opened = true;
                state.failures = 0;
                if !state.searching {
                    if let Some(connection) = state.current.as_ref() {
                        connection.close();
                    }
                    return;
                }
                drop(state);
                info!(target = "relay.controller", id, "relay connected");
                self.set_phase(ConnectionPhase::Open);
            }
            TransportEvent::Message(text) => {
                drop(state);
                self.router.dispatch_text(&text);
            }
            TransportEvent::Errored(reason) => {
                let searching = state.searching;
                drop(state);
                warn!(target = "relay.controller", id, error = %reason, "relay connection error");
                if searching {
                    self.set_phase(ConnectionPhase::Error);
                }
            }
            TransportEvent::Closed => {
                state.current = None;
                if !state.current_opened {
                    state.failures = state.failures.saturating_add(1);
                }
                if !state.searching {
                    drop(state);
                    self.set_phase(ConnectionPhase::Idle);
                    return;
                }
                if self.policy.exhausted(state.failures) {
                    state.searching = false;
                    let failures = state.failures;
                    drop(state);
                    warn!(target = "relay.controller", failures, "giving up on relay after repeated failures");
                    self.set_phase(ConnectionPhase::Closed);
                    return;
                }
                let delay = self.policy.delay_for(state.failures);
                let schedule = !state.retry_pending;
                state.retry_pending = true;
                drop(state);
                self.set_phase(ConnectionPhase::Closed);
                if schedule {
                    self.schedule_retry(delay);
                }
            }
        }
    }

    /// Reconnects on a separate task so a fast failure loop never recurses
    /// inside the event handler.
    fn schedule_retry(self: &Arc<Self>, delay: Duration) {
        let this = Arc::clone(self);
        debug!(target = "relay.controller", delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        tokio::spawn(async move {
            if delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(delay).await;
            }
            this.state.lock().retry_pending = false;
            this.search();
        });
    }
}

async fn event_loop(
    inner: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<(ConnectionId, TransportEvent)>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        let (id, event) = tokio::select! {
            _ = &mut shutdown => break,
            next = events.recv() => match next {
                Some(next) => next,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle(id, event);
    }
    debug!(target = "relay.controller", "event loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_retries_immediately_forever() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(50), Duration::ZERO);
        assert!(!policy.exhausted(u32::MAX));
    }

    #[test]
    fn exponential_policy_doubles_up_to_ceiling() {
        let policy = ReconnectPolicy::exponential(
            Duration::from_millis(100),
            Duration::from_millis(1_000),
            Some(4),
        );
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(1_000));
        assert!(!policy.exhausted(3));
        assert!(policy.exhausted(4));
    }

    #[test]
    fn ceiling_never_drops_below_initial_delay() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(500),
            multiplier: 1.0,
            max_delay: Duration::ZERO,
            max_attempts: None,
        };
        assert_eq!(policy.delay_for(7), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn sends_are_dropped_until_a_connection_opens() {
        let controller = ReconnectController::new(
            EndpointConfig::default(),
            ReconnectPolicy::default(),
            TopicRouter::new(),
        );
        assert_eq!(controller.phase(), ConnectionPhase::Idle);
        assert!(!controller.send_text("{\"target\":\"x\",\"message\":1}".into()));
        assert_eq!(controller.attempts(), 0);
    }
}
