//! Synchronization engine.
//!
//! One actor task per conversation scope owns the timeline and is its only
//! writer. User commands and channel events are both funneled into that
//! task, so no two mutations of a scope ever interleave. The presentation
//! layer reads published snapshots and never touches the timeline itself.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
};

use chat_sync_channel::{
    ChannelError, ChannelEvent, ChannelManager, ClientEvent, ConnectionState, Connector,
    ServerEvent,
};
use chat_sync_core::{
    CredentialStore, MergeOutcome, Message, MessageId, MessageStore, Session, SyncConfig,
    Timeline, message::validate_text,
};
use chrono::Utc;
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
};
use tokio_stream::wrappers::WatchStream;

use crate::{IdGenerator, Notice, SnapshotWriter, SyncError};

const NOTICE_CAPACITY: usize = 64;

/// Read-only timeline snapshot handed to the presentation layer.
pub type TimelineSnapshot = Arc<[Message]>;

enum Command {
    Send {
        text: String,
        reply: oneshot::Sender<Result<Message, SyncError>>,
    },
    Flush(oneshot::Sender<Result<(), SyncError>>),
    Teardown(oneshot::Sender<Result<(), SyncError>>),
}

/// Restore the persisted session or report that login is needed.
///
/// # Errors
/// Returns `SyncError::AuthRequired` if no usable token is stored and
/// `SyncError::StorageUnavailable` if the credential store cannot be read.
pub async fn restore_session<C>(store: &C) -> Result<Session, SyncError>
where
    C: CredentialStore + ?Sized,
{
    Session::restore(store).await?.ok_or(SyncError::AuthRequired)
}

/// Handle to a running sync engine for one scope.
///
/// Dropping the handle stops the engine the same way [`SyncEngine::teardown`]
/// does, without waiting for it.
pub struct SyncEngine {
    scope: String,
    username: String,
    commands: mpsc::UnboundedSender<Command>,
    timeline: watch::Receiver<TimelineSnapshot>,
    state: watch::Receiver<ConnectionState>,
    notices: broadcast::Sender<Notice>,
    first_notices: Mutex<Option<broadcast::Receiver<Notice>>>,
    task: JoinHandle<()>,
}

impl SyncEngine {
    /// Start syncing `scope` for `session`.
    ///
    /// The persisted snapshot is loaded before this returns, so
    /// [`SyncEngine::timeline`] shows history right away. A failed load is
    /// reported as [`Notice::StorageUnavailable`] and the engine starts
    /// from an empty timeline. The channel is opened in the background.
    pub async fn initialize(
        scope: impl Into<String>,
        session: Session,
        store: Arc<dyn MessageStore>,
        connector: Arc<dyn Connector>,
        config: &SyncConfig,
    ) -> Self {
        let scope = scope.into();
        let (notices, first_notices) = broadcast::channel(NOTICE_CAPACITY);

        let restored = match store.load(&scope).await {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!(%scope, error = %e, "Failed to load snapshot, starting empty");
                let _ = notices.send(Notice::StorageUnavailable(e.to_string()));
                Vec::new()
            }
        };
        let timeline = Timeline::from_messages(restored);
        tracing::info!(
            %scope,
            messages = timeline.len(),
            pending = timeline.pending().len(),
            "Timeline restored"
        );

        let (timeline_tx, timeline_rx) = watch::channel(snapshot_of(&timeline));
        let (channel, events) = ChannelManager::with_events(connector, config.channel.clone());
        let state = channel.watch_state();
        let writer = SnapshotWriter::spawn(
            store,
            scope.clone(),
            config.store.save_debounce(),
            notices.clone(),
        );

        let username = session.username().to_string();
        channel.open(session).await;

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let actor = Actor {
            scope: scope.clone(),
            username: username.clone(),
            ids: IdGenerator::new(timeline.max_id()),
            timeline,
            in_flight: HashSet::new(),
            channel,
            writer,
            timeline_tx,
            notices: notices.clone(),
        };
        let task = tokio::spawn(actor.run(commands_rx, events));

        Self {
            scope,
            username,
            commands,
            timeline: timeline_rx,
            state,
            notices,
            first_notices: Mutex::new(Some(first_notices)),
            task,
        }
    }

    /// Conversation scope.
    #[must_use]
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Author stamped on outgoing messages.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Compose a message and send it optimistically.
    ///
    /// The message is in the timeline as `Pending` when this returns. If
    /// the channel is not connected it stays queued and goes out on the
    /// next connect.
    ///
    /// # Errors
    /// Returns `SyncError::InvalidMessage` for blank text (nothing changes)
    /// and `SyncError::Closed` after teardown.
    pub async fn compose_and_send(&self, text: impl Into<String>) -> Result<Message, SyncError> {
        let text = text.into();
        validate_text(&text)?;
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send { text, reply })
            .map_err(|_| SyncError::Closed)?;
        rx.await.map_err(|_| SyncError::Closed)?
    }

    /// Current timeline, sorted by `(timestamp, id)`.
    #[must_use]
    pub fn timeline(&self) -> TimelineSnapshot {
        Arc::clone(&self.timeline.borrow())
    }

    /// Stream of timeline snapshots, starting with the current one.
    #[must_use]
    pub fn timeline_stream(&self) -> WatchStream<TimelineSnapshot> {
        WatchStream::new(self.timeline.clone())
    }

    /// Current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that tracks the connection state.
    #[must_use]
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Subscribe to user-facing notices.
    ///
    /// The first subscriber also sees notices raised during
    /// [`SyncEngine::initialize`]; later ones only see new notices.
    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.first_notices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_else(|| self.notices.subscribe())
    }

    /// Wait until every change made so far is durably saved.
    ///
    /// # Errors
    /// Returns `SyncError::StorageUnavailable` if the latest save failed and
    /// `SyncError::Closed` after teardown.
    pub async fn flush(&self) -> Result<(), SyncError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Flush(reply))
            .map_err(|_| SyncError::Closed)?;
        rx.await.map_err(|_| SyncError::Closed)?
    }

    /// Stop the engine: flush pending saves, close the channel, stop
    /// consuming events. Persisted state is kept.
    ///
    /// # Errors
    /// Returns `SyncError::StorageUnavailable` if the final flush failed.
    /// The engine is stopped either way.
    pub async fn teardown(self) -> Result<(), SyncError> {
        let (reply, rx) = oneshot::channel();
        let result = if self.commands.send(Command::Teardown(reply)).is_ok() {
            rx.await.unwrap_or(Err(SyncError::Closed))
        } else {
            Ok(())
        };
        if let Err(e) = self.task.await {
            tracing::warn!(scope = %self.scope, error = %e, "Sync engine task failed");
        }
        result
    }
}

fn snapshot_of(timeline: &Timeline) -> TimelineSnapshot {
    timeline.iter().cloned().collect()
}

struct Actor {
    scope: String,
    username: String,
    ids: IdGenerator,
    timeline: Timeline,
    /// Pending ids already handed to the current connection.
    in_flight: HashSet<MessageId>,
    channel: ChannelManager,
    writer: SnapshotWriter,
    timeline_tx: watch::Sender<TimelineSnapshot>,
    notices: broadcast::Sender<Notice>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) {
        let teardown_reply = loop {
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Some(event) => self.on_channel_event(event),
                    // The manager lives in this task; this cannot end first.
                    None => break None,
                },
                command = commands.recv() => match command {
                    Some(Command::Send { text, reply }) => {
                        let _ = reply.send(self.compose(text));
                    }
                    Some(Command::Flush(reply)) => self.writer.flush_into(reply),
                    Some(Command::Teardown(reply)) => break Some(reply),
                    None => break None,
                },
            }
        };

        let result = self.shutdown().await;
        if let Some(reply) = teardown_reply {
            let _ = reply.send(result);
        }
    }

    fn compose(&mut self, text: String) -> Result<Message, SyncError> {
        let now = Utc::now();
        let msg = Message::outgoing(self.ids.next_at(now), text, self.username.as_str(), now)?;
        let msg = self.insert_outgoing(msg);
        tracing::debug!(scope = %self.scope, id = %msg.id, "Message composed");

        self.commit();
        self.send_pending();
        Ok(msg)
    }

    /// Insert a locally minted message, minting a fresh id for as long as
    /// the current one is already in the timeline.
    fn insert_outgoing(&mut self, mut msg: Message) -> Message {
        while self.timeline.merge(msg.clone()) != MergeOutcome::Inserted {
            let taken = msg.id;
            msg.id = self.ids.next_at(msg.timestamp);
            tracing::warn!(scope = %self.scope, %taken, id = %msg.id, "Message id already in use, minted another");
        }
        msg
    }

    /// Move a pending message to a fresh id so another author's message
    /// can take its old one. The message is sent again under the new id.
    fn rekey_pending(&mut self, id: MessageId) {
        let Some(msg) = self.timeline.remove(id) else {
            return;
        };
        self.in_flight.remove(&id);
        let new_id = self.ids.next_at(Utc::now());
        let msg = self.insert_outgoing(Message { id: new_id, ..msg });
        tracing::warn!(scope = %self.scope, old = %id, new = %msg.id, "Pending message id claimed by another author, re-keyed");
    }

    fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::State(ConnectionState::Connected) => {
                tracing::info!(scope = %self.scope, "Channel connected, replaying pending");
                self.send_pending();
            }
            ChannelEvent::State(state) => {
                // Whatever was handed to the old link may never have left.
                self.in_flight.clear();
                tracing::debug!(scope = %self.scope, ?state, "Channel state");
            }
            ChannelEvent::ReconnectScheduled { attempt, delay } => {
                tracing::debug!(
                    scope = %self.scope,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Offline, reconnect scheduled"
                );
            }
            ChannelEvent::Inbound(event) => self.on_inbound(event),
            ChannelEvent::GaveUp { attempts } => {
                tracing::warn!(scope = %self.scope, attempts, "Channel gave up");
                let _ = self.notices.send(Notice::Offline { attempts });
            }
            ChannelEvent::Unauthorized { reason } => {
                tracing::warn!(scope = %self.scope, %reason, "Session rejected by server");
                let _ = self.notices.send(Notice::AuthRequired(reason));
            }
        }
    }

    fn on_inbound(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Message(payload) => {
                let id = payload.id;
                self.ids.observe(id);
                if let Err(e) = validate_text(&payload.text) {
                    tracing::warn!(scope = %self.scope, %id, author = %payload.author, error = %e, "Skipping invalid inbound message");
                    return;
                }

                // Same id, different author: not an echo of ours.
                let conflict = self
                    .timeline
                    .get(id)
                    .is_some_and(|m| m.is_pending() && m.author != payload.author);
                if conflict {
                    self.rekey_pending(id);
                }

                let outcome = self.timeline.merge(payload.into_received());
                tracing::debug!(scope = %self.scope, %id, ?outcome, "Inbound message");
                if outcome.changed() {
                    self.in_flight.remove(&id);
                    self.commit();
                }
                if conflict {
                    self.send_pending();
                }
            }
            ServerEvent::Ack { id } => {
                if self.timeline.acknowledge(id) {
                    tracing::debug!(scope = %self.scope, %id, "Message acknowledged");
                    self.in_flight.remove(&id);
                    self.commit();
                } else {
                    tracing::debug!(scope = %self.scope, %id, "Ignoring ack for unknown or settled id");
                }
            }
            ServerEvent::Error { message } => {
                tracing::warn!(scope = %self.scope, %message, "Server reported an error");
            }
            ServerEvent::Pong => {}
        }
    }

    /// Hand every pending message not yet on this connection to the
    /// channel, in id order. Stops at the first refusal so later messages
    /// never overtake earlier ones.
    fn send_pending(&mut self) {
        for msg in self.timeline.pending() {
            if self.in_flight.contains(&msg.id) {
                continue;
            }
            match self.channel.send(ClientEvent::Message((&msg).into())) {
                Ok(()) => {
                    self.in_flight.insert(msg.id);
                }
                Err(ChannelError::NotReady) => {
                    tracing::debug!(scope = %self.scope, id = %msg.id, "Channel not ready, message stays pending");
                    break;
                }
                Err(e) => {
                    let err = SyncError::from(e);
                    tracing::warn!(scope = %self.scope, id = %msg.id, error = %err, "Send failed, message stays pending");
                    break;
                }
            }
        }
    }

    /// Publish the timeline and queue it for saving.
    fn commit(&self) {
        let snapshot = snapshot_of(&self.timeline);
        self.writer.save(snapshot.to_vec());
        self.timeline_tx.send_replace(snapshot);
    }

    async fn shutdown(self) -> Result<(), SyncError> {
        tracing::info!(scope = %self.scope, "Tearing down sync engine");
        self.channel.close().await;

        let result = self.writer.flush().await;
        let generation = self.writer.retire();
        self.writer.shutdown().await;
        tracing::info!(scope = %self.scope, generation, "Sync engine stopped");
        result
    }
}
