//! Transport seam between the channel manager and a concrete connection.

use async_trait::async_trait;
use chat_sync_core::Session;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::protocol::{ClientEvent, ServerEvent};

/// Channel error.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel not ready")]
    NotReady,
    #[error("Transport failure: {0}")]
    Transport(String),
    #[error("Handshake timed out")]
    Timeout,
    #[error("Authentication rejected: {0}")]
    Unauthorized(String),
}

/// An established connection.
///
/// Outbound events are queued on `outbound`; inbound events arrive on
/// `inbound` in transport order. The inbound side yielding `None` means the
/// transport dropped. I/O tasks backing the link are aborted on drop.
pub struct Link {
    outbound: mpsc::UnboundedSender<ClientEvent>,
    inbound: mpsc::UnboundedReceiver<ServerEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl Link {
    /// Create a link from its queues and the tasks that service them.
    #[must_use]
    pub fn new(
        outbound: mpsc::UnboundedSender<ClientEvent>,
        inbound: mpsc::UnboundedReceiver<ServerEvent>,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            tasks,
        }
    }

    /// Handle for queuing outbound events.
    #[must_use]
    pub fn sender(&self) -> mpsc::UnboundedSender<ClientEvent> {
        self.outbound.clone()
    }

    /// Next inbound event, or `None` once the transport is gone.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.inbound.recv().await
    }

    /// Close gracefully: stop accepting outbound events and give the I/O
    /// tasks a moment to flush and send a close frame.
    pub async fn close(mut self, grace: std::time::Duration) {
        self.inbound.close();
        let (closed_tx, _) = mpsc::unbounded_channel();
        // Replacing the sender drops ours; writer tasks see the queue end.
        self.outbound = closed_tx;
        for task in &mut self.tasks {
            if tokio::time::timeout(grace, &mut *task).await.is_err() {
                task.abort();
            }
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Opens links for a session.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Perform the handshake, attaching the session credential.
    async fn connect(&self, session: &Session) -> Result<Link, ChannelError>;
}
