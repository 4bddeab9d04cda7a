//! Realtime channel manager.
//!
//! Owns at most one live connection per session and re-establishes it
//! across transient failures:
//!
//! ```text
//! Disconnected --open--> Connecting --handshake ok--> Connected
//!                            |                            |
//!                       failure|                   transport drop
//!                            v                            v
//!                        Reconnecting <-------------------+
//!                            |  backoff elapsed
//!                            +--------> Connecting
//! any state --close--> Disconnected
//! ```

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chat_sync_core::{Session, config::ChannelConfig};
use serde::Serialize;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{self, Instant, Interval, MissedTickBehavior},
};
use uuid::Uuid;

use crate::{
    Backoff,
    protocol::{ClientEvent, ServerEvent},
    transport::{ChannelError, Connector, Link},
};

/// Time allowed for a link or supervisor to wind down before it is aborted.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events delivered to the single consumer, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The connection state changed.
    State(ConnectionState),
    /// A reconnect attempt will start after `delay`.
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// An event pushed by the server.
    Inbound(ServerEvent),
    /// The retry budget is spent; the channel stays Disconnected until the
    /// next `open`.
    GaveUp { attempts: u32 },
    /// The server refused the session credential. Not retried.
    Unauthorized { reason: String },
}

struct Shared {
    state: watch::Sender<ConnectionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientEvent>>>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(?previous, ?state, "Channel state changed");
            self.emit(ChannelEvent::State(state));
        }
    }

    fn emit(&self, event: ChannelEvent) {
        // The consumer may have gone away; events are then dropped.
        let _ = self.events.send(event);
    }

    fn set_outbound(&self, sender: Option<mpsc::UnboundedSender<ClientEvent>>) {
        *self.outbound.lock().unwrap_or_else(PoisonError::into_inner) = sender;
    }
}

struct ActiveChannel {
    session: Session,
    channel_id: Uuid,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Realtime channel manager.
///
/// The only owner of the connection. Consumers observe it through
/// [`ChannelManager::take_events`] and [`ChannelManager::watch_state`] and
/// write to it through [`ChannelManager::send`].
pub struct ChannelManager {
    connector: Arc<dyn Connector>,
    policy: ChannelConfig,
    shared: Arc<Shared>,
    active: tokio::sync::Mutex<Option<ActiveChannel>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
}

impl ChannelManager {
    /// Create a manager in the `Disconnected` state.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, policy: ChannelConfig) -> Self {
        let (manager, events_rx) = Self::with_events(connector, policy);
        *manager
            .events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(events_rx);
        manager
    }

    /// Create a manager and hand out its event receiver right away.
    #[must_use]
    pub fn with_events(
        connector: Arc<dyn Connector>,
        policy: ChannelConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let manager = Self {
            connector,
            policy,
            shared: Arc::new(Shared {
                state: state_tx,
                outbound: Mutex::new(None),
                events: events_tx,
            }),
            active: tokio::sync::Mutex::new(None),
            events_rx: Mutex::new(None),
        };
        (manager, events_rx)
    }

    /// Take the event receiver (can only be called once).
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Receiver that tracks the connection state.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Open the channel for `session`.
    ///
    /// A no-op while a connection for the same session is being kept
    /// alive. A different session tears the old connection down first.
    pub async fn open(&self, session: Session) {
        let mut active = self.active.lock().await;

        if let Some(current) = active.as_ref() {
            if current.session == session && !current.task.is_finished() {
                tracing::debug!(channel_id = %current.channel_id, "Channel already open");
                return;
            }
        }

        if let Some(previous) = active.take() {
            self.stop(previous).await;
        }

        let channel_id = Uuid::new_v4();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let supervisor = Supervisor {
            connector: Arc::clone(&self.connector),
            session: session.clone(),
            shared: Arc::clone(&self.shared),
            backoff: Backoff::new(self.policy.backoff_min(), self.policy.backoff_max()),
            connect_timeout: self.policy.connect_timeout(),
            max_retries: self.policy.max_retries,
            ping_interval: self.policy.ping_interval(),
            channel_id,
        };

        tracing::info!(%channel_id, user = session.username(), "Opening channel");
        self.shared.set_state(ConnectionState::Connecting);
        let task = tokio::spawn(supervisor.run(shutdown_rx));

        *active = Some(ActiveChannel {
            session,
            channel_id,
            shutdown: shutdown_tx,
            task,
        });
    }

    /// Queue an outbound event on the live connection.
    ///
    /// # Errors
    /// Returns `ChannelError::NotReady` unless the channel is Connected.
    /// Queuing and retrying is up to the caller.
    pub fn send(&self, event: ClientEvent) -> Result<(), ChannelError> {
        if self.state() != ConnectionState::Connected {
            return Err(ChannelError::NotReady);
        }
        let outbound = self
            .shared
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let sender = outbound.as_ref().ok_or(ChannelError::NotReady)?;
        sender.send(event).map_err(|_| ChannelError::NotReady)
    }

    /// Release the connection and move to `Disconnected`.
    ///
    /// Completes even if the transport is mid-failure: a supervisor that
    /// does not wind down within the grace period is aborted.
    pub async fn close(&self) {
        let previous = self.active.lock().await.take();
        match previous {
            Some(previous) => self.stop(previous).await,
            None => {
                self.shared.set_outbound(None);
                self.shared.set_state(ConnectionState::Disconnected);
            }
        }
    }

    async fn stop(&self, mut active: ActiveChannel) {
        let _ = active.shutdown.send(());
        if tokio::time::timeout(CLOSE_GRACE * 2, &mut active.task)
            .await
            .is_err()
        {
            tracing::warn!(channel_id = %active.channel_id, "Channel did not close in time, aborting");
            active.task.abort();
            let _ = active.task.await;
        }
        self.shared.set_outbound(None);
        self.shared.set_state(ConnectionState::Disconnected);
        tracing::info!(channel_id = %active.channel_id, "Channel closed");
    }
}

struct Supervisor {
    connector: Arc<dyn Connector>,
    session: Session,
    shared: Arc<Shared>,
    backoff: Backoff,
    connect_timeout: Duration,
    max_retries: Option<u32>,
    ping_interval: Option<Duration>,
    channel_id: Uuid,
}

enum PumpExit {
    Shutdown,
    Dropped,
}

impl Supervisor {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        let channel_id = self.channel_id;
        let mut failures: u32 = 0;

        loop {
            self.shared.set_state(ConnectionState::Connecting);

            let attempt = tokio::select! {
                _ = &mut shutdown => return,
                result = tokio::time::timeout(
                    self.connect_timeout,
                    self.connector.connect(&self.session),
                ) => result.unwrap_or(Err(ChannelError::Timeout)),
            };

            match attempt {
                Ok(link) => {
                    self.backoff.reset();
                    failures = 0;
                    tracing::info!(%channel_id, "Channel connected");
                    match self.pump(link, &mut shutdown).await {
                        PumpExit::Shutdown => return,
                        PumpExit::Dropped => {
                            tracing::warn!(%channel_id, "Transport dropped");
                        }
                    }
                }
                Err(ChannelError::Unauthorized(reason)) => {
                    tracing::warn!(%channel_id, %reason, "Channel credential rejected");
                    self.shared.set_state(ConnectionState::Disconnected);
                    self.shared.emit(ChannelEvent::Unauthorized { reason });
                    return;
                }
                Err(e) => {
                    tracing::warn!(%channel_id, error = %e, "Channel connect failed");
                }
            }

            failures = failures.saturating_add(1);
            if self.max_retries.is_some_and(|max| failures > max) {
                tracing::warn!(%channel_id, attempts = failures, "Retry budget exhausted");
                self.shared.set_state(ConnectionState::Disconnected);
                self.shared.emit(ChannelEvent::GaveUp { attempts: failures });
                return;
            }

            self.shared.set_state(ConnectionState::Reconnecting);
            let delay = self.backoff.next_delay();
            tracing::debug!(
                %channel_id,
                attempt = failures,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Reconnect scheduled"
            );
            self.shared.emit(ChannelEvent::ReconnectScheduled {
                attempt: failures,
                delay,
            });

            tokio::select! {
                _ = &mut shutdown => return,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn pump(&self, mut link: Link, shutdown: &mut oneshot::Receiver<()>) -> PumpExit {
        let outbound = link.sender();
        // The sender must be in place before anyone observes Connected.
        self.shared.set_outbound(Some(outbound.clone()));
        self.shared.set_state(ConnectionState::Connected);

        let mut keepalive = self.ping_interval.map(|period| {
            let mut ticks = time::interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticks
        });

        let exit = loop {
            tokio::select! {
                biased;
                _ = &mut *shutdown => break PumpExit::Shutdown,
                event = link.recv() => match event {
                    Some(event) => self.shared.emit(ChannelEvent::Inbound(event)),
                    None => break PumpExit::Dropped,
                },
                () = next_tick(keepalive.as_mut()) => {
                    if outbound.send(ClientEvent::Ping).is_err() {
                        break PumpExit::Dropped;
                    }
                }
            }
        };

        self.shared.set_outbound(None);
        if matches!(exit, PumpExit::Shutdown) {
            link.close(CLOSE_GRACE).await;
        }
        exit
    }
}

/// Resolves on the next keepalive tick, never when keepalive is off.
async fn next_tick(ticks: Option<&mut Interval>) {
    match ticks {
        Some(ticks) => {
            ticks.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockConnector, Step};

    fn session(token: &str) -> Session {
        Session::new(token, "alice").unwrap()
    }

    fn policy() -> ChannelConfig {
        ChannelConfig {
            backoff_min_ms: 100,
            backoff_max_ms: 1_000,
            connect_timeout_ms: 1_000,
            max_retries: None,
            ping_interval_ms: None,
        }
    }

    async fn next_state(events: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> ConnectionState {
        loop {
            match events.recv().await {
                Some(ChannelEvent::State(state)) => return state,
                Some(_) => {}
                None => panic!("event stream ended"),
            }
        }
    }

    #[tokio::test]
    async fn test_send_before_connected_is_not_ready() {
        let (connector, _remotes) = MockConnector::refusing();
        let manager = ChannelManager::new(connector, policy());
        assert!(matches!(
            manager.send(ClientEvent::Ping),
            Err(ChannelError::NotReady)
        ));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_and_receive_in_order() {
        let (connector, mut remotes) = MockConnector::accepting();
        let manager = ChannelManager::new(connector, policy());
        let mut events = manager.take_events().unwrap();
        assert!(manager.take_events().is_none());

        manager.open(session("t1")).await;
        assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
        assert_eq!(next_state(&mut events).await, ConnectionState::Connected);

        let mut remote = remotes.recv().await.unwrap();
        remote.push(ServerEvent::Pong);
        remote.push(ServerEvent::Error {
            message: "first".into(),
        });
        assert_eq!(events.recv().await, Some(ChannelEvent::Inbound(ServerEvent::Pong)));
        assert_eq!(
            events.recv().await,
            Some(ChannelEvent::Inbound(ServerEvent::Error {
                message: "first".into()
            }))
        );

        manager.send(ClientEvent::Ping).unwrap();
        assert_eq!(remote.next_event().await, Some(ClientEvent::Ping));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_pings_while_connected() {
        let (connector, mut remotes) = MockConnector::accepting();
        let policy = ChannelConfig {
            ping_interval_ms: Some(1_000),
            ..policy()
        };
        let manager = ChannelManager::new(connector, policy);
        let mut events = manager.take_events().unwrap();

        manager.open(session("t1")).await;
        assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
        assert_eq!(next_state(&mut events).await, ConnectionState::Connected);
        let mut remote = remotes.recv().await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(remote.drain().is_empty());

        tokio::time::sleep(Duration::from_millis(1_600)).await;
        assert_eq!(remote.drain(), vec![ClientEvent::Ping, ClientEvent::Ping]);
    }

    #[tokio::test]
    async fn test_with_events_hands_out_receiver_once() {
        let (connector, _remotes) = MockConnector::refusing();
        let (manager, _events) = ChannelManager::with_events(connector, policy());
        assert!(manager.take_events().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_same_session_is_idempotent() {
        let (connector, _remotes) = MockConnector::accepting();
        let manager = ChannelManager::new(Arc::clone(&connector) as Arc<dyn Connector>, policy());
        let mut events = manager.take_events().unwrap();

        manager.open(session("t1")).await;
        assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
        assert_eq!(next_state(&mut events).await, ConnectionState::Connected);

        manager.open(session("t1")).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(connector.connect_count(), 1);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_other_session_replaces_connection() {
        let (connector, mut remotes) = MockConnector::accepting();
        let manager = ChannelManager::new(Arc::clone(&connector) as Arc<dyn Connector>, policy());
        let mut events = manager.take_events().unwrap();

        manager.open(session("t1")).await;
        assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
        assert_eq!(next_state(&mut events).await, ConnectionState::Connected);
        let mut first = remotes.recv().await.unwrap();

        manager.open(session("t2")).await;
        assert_eq!(next_state(&mut events).await, ConnectionState::Disconnected);
        assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
        assert_eq!(next_state(&mut events).await, ConnectionState::Connected);

        // The first link is gone before the second is used.
        assert_eq!(first.next_event().await, None);
        assert_eq!(connector.tokens(), vec!["t1".to_string(), "t2".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_then_resets_after_connect() {
        let (connector, mut remotes) = MockConnector::accepting();
        connector.script([Step::Refuse, Step::Refuse, Step::Refuse]);
        let manager = ChannelManager::new(connector, policy());
        let mut events = manager.take_events().unwrap();

        manager.open(session("t1")).await;

        let mut delays = Vec::new();
        while delays.len() < 3 {
            if let Some(ChannelEvent::ReconnectScheduled { delay, .. }) = events.recv().await {
                delays.push(delay);
            }
        }
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );

        assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
        assert_eq!(next_state(&mut events).await, ConnectionState::Connected);

        // A drop after a successful connect starts over at the minimum.
        drop(remotes.recv().await.unwrap());
        assert_eq!(next_state(&mut events).await, ConnectionState::Reconnecting);
        assert_eq!(
            events.recv().await,
            Some(ChannelEvent::ReconnectScheduled {
                attempt: 1,
                delay: Duration::from_millis(100)
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_retry_budget() {
        let (connector, _remotes) = MockConnector::refusing();
        let mut policy = policy();
        policy.max_retries = Some(2);
        let manager = ChannelManager::new(connector, policy);
        let mut events = manager.take_events().unwrap();

        manager.open(session("t1")).await;
        loop {
            match events.recv().await {
                Some(ChannelEvent::GaveUp { attempts }) => {
                    assert_eq!(attempts, 3);
                    break;
                }
                Some(_) => {}
                None => panic!("event stream ended"),
            }
        }
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_is_not_retried() {
        let (connector, _remotes) = MockConnector::accepting();
        connector.script([Step::Reject]);
        let manager = ChannelManager::new(Arc::clone(&connector) as Arc<dyn Connector>, policy());
        let mut events = manager.take_events().unwrap();

        manager.open(session("bad")).await;
        loop {
            if let Some(ChannelEvent::Unauthorized { .. }) = events.recv().await {
                break;
            }
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(connector.connect_count(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_while_reconnecting() {
        let (connector, _remotes) = MockConnector::refusing();
        let manager = ChannelManager::new(connector, policy());
        let mut events = manager.take_events().unwrap();

        manager.open(session("t1")).await;
        loop {
            if next_state(&mut events).await == ConnectionState::Reconnecting {
                break;
            }
        }

        manager.close().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(next_state(&mut events).await, ConnectionState::Disconnected);
        assert!(matches!(
            manager.send(ClientEvent::Ping),
            Err(ChannelError::NotReady)
        ));
    }
}
