//! Scripted in-process connector for tests.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU32, Ordering},
    },
};

use async_trait::async_trait;
use chat_sync_core::Session;
use tokio::sync::mpsc;

use crate::{
    protocol::{ClientEvent, ServerEvent},
    transport::{ChannelError, Connector, Link},
};

/// Outcome of one connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Handshake succeeds; a [`RemoteEnd`] is handed to the test.
    Accept,
    /// Transport-level failure.
    Refuse,
    /// Credential rejected.
    Reject,
}

/// Server side of an accepted mock link.
///
/// Dropping it drops the connection from the client's point of view.
pub struct RemoteEnd {
    received: mpsc::UnboundedReceiver<ClientEvent>,
    push: mpsc::UnboundedSender<ServerEvent>,
}

impl RemoteEnd {
    /// Push an event to the client.
    pub fn push(&self, event: ServerEvent) {
        let _ = self.push.send(event);
    }

    /// Next event the client sent, or `None` once the client closed.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.received.recv().await
    }

    /// Events the client sent so far, without waiting.
    pub fn drain(&mut self) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.received.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Connector that follows a script, then falls back to a default step.
pub struct MockConnector {
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    remotes: mpsc::UnboundedSender<RemoteEnd>,
    connects: AtomicU32,
    tokens: Mutex<Vec<String>>,
}

impl MockConnector {
    /// Connector that accepts unless scripted otherwise.
    #[must_use]
    pub fn accepting() -> (Arc<Self>, mpsc::UnboundedReceiver<RemoteEnd>) {
        Self::with_fallback(Step::Accept)
    }

    /// Connector that refuses unless scripted otherwise.
    #[must_use]
    pub fn refusing() -> (Arc<Self>, mpsc::UnboundedReceiver<RemoteEnd>) {
        Self::with_fallback(Step::Refuse)
    }

    fn with_fallback(fallback: Step) -> (Arc<Self>, mpsc::UnboundedReceiver<RemoteEnd>) {
        let (remotes_tx, remotes_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            remotes: remotes_tx,
            connects: AtomicU32::new(0),
            tokens: Mutex::new(Vec::new()),
        });
        (connector, remotes_rx)
    }

    /// Queue steps for the next attempts.
    pub fn script(&self, steps: impl IntoIterator<Item = Step>) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(steps);
    }

    /// Number of connect attempts so far.
    #[must_use]
    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Session tokens presented, in attempt order.
    #[must_use]
    pub fn tokens(&self) -> Vec<String> {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, session: &Session) -> Result<Link, ChannelError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(session.token().to_string());

        let step = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(self.fallback);

        match step {
            Step::Accept => {
                let (out_tx, out_rx) = mpsc::unbounded_channel();
                let (in_tx, in_rx) = mpsc::unbounded_channel();
                let remote = RemoteEnd {
                    received: out_rx,
                    push: in_tx,
                };
                self.remotes
                    .send(remote)
                    .map_err(|_| ChannelError::Transport("test harness gone".into()))?;
                Ok(Link::new(out_tx, in_rx, Vec::new()))
            }
            Step::Refuse => Err(ChannelError::Transport("connection refused".into())),
            Step::Reject => Err(ChannelError::Unauthorized("401 Unauthorized".into())),
        }
    }
}
