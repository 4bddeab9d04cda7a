//! Coalescing snapshot writer.
//!
//! The engine hands every new snapshot to a dedicated task. Snapshots
//! queued while a write is pending collapse into one write of the latest.
//! Each snapshot is tagged with the writer generation at the time it was
//! queued; bumping the generation (on teardown) turns everything still
//! queued into a no-op.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chat_sync_core::{Message, MessageStore};
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
};

use crate::{Notice, SyncError};

type FlushReply = oneshot::Sender<Result<(), SyncError>>;

enum PersistCmd {
    Save {
        generation: u64,
        messages: Vec<Message>,
    },
    Flush(FlushReply),
}

/// Handle to the writer task for one scope.
pub struct SnapshotWriter {
    commands: mpsc::UnboundedSender<PersistCmd>,
    generation: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl SnapshotWriter {
    /// Spawn the writer task.
    ///
    /// Failed saves are logged and reported on `notices`.
    #[must_use]
    pub fn spawn(
        store: Arc<dyn MessageStore>,
        scope: String,
        debounce: Duration,
        notices: broadcast::Sender<Notice>,
    ) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let generation = Arc::new(AtomicU64::new(0));
        let worker = Worker {
            store,
            scope,
            debounce,
            notices,
            generation: Arc::clone(&generation),
            last_error: None,
        };
        Self {
            commands,
            generation,
            task: tokio::spawn(worker.run(rx)),
        }
    }

    /// Current generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Queue a full snapshot under the current generation.
    pub fn save(&self, messages: Vec<Message>) {
        let cmd = PersistCmd::Save {
            generation: self.generation(),
            messages,
        };
        if self.commands.send(cmd).is_err() {
            tracing::warn!("Snapshot writer is gone, dropping save");
        }
    }

    /// Ask for a reply once everything queued so far is written.
    ///
    /// The reply carries the outcome of the most recent write attempt.
    pub fn flush_into(&self, reply: FlushReply) {
        if let Err(mpsc::error::SendError(PersistCmd::Flush(reply))) =
            self.commands.send(PersistCmd::Flush(reply))
        {
            let _ = reply.send(Err(SyncError::Closed));
        }
    }

    /// Wait until everything queued so far is written.
    ///
    /// # Errors
    /// Returns `SyncError::StorageUnavailable` if the latest write failed.
    pub async fn flush(&self) -> Result<(), SyncError> {
        let (tx, rx) = oneshot::channel();
        self.flush_into(tx);
        rx.await.unwrap_or(Err(SyncError::Closed))
    }

    /// Invalidate every snapshot queued under the current generation.
    pub fn retire(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Stop accepting saves and wait for the task to finish.
    pub async fn shutdown(self) {
        drop(self.commands);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Snapshot writer task failed");
        }
    }
}

struct Worker {
    store: Arc<dyn MessageStore>,
    scope: String,
    debounce: Duration,
    notices: broadcast::Sender<Notice>,
    generation: Arc<AtomicU64>,
    last_error: Option<String>,
}

#[derive(Default)]
struct Batch {
    latest: Option<(u64, Vec<Message>)>,
    coalesced: usize,
    waiters: Vec<FlushReply>,
}

impl Batch {
    fn absorb(&mut self, cmd: PersistCmd) {
        match cmd {
            PersistCmd::Save {
                generation,
                messages,
            } => {
                if self.latest.replace((generation, messages)).is_some() {
                    self.coalesced += 1;
                }
            }
            PersistCmd::Flush(reply) => self.waiters.push(reply),
        }
    }
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PersistCmd>) {
        while let Some(cmd) = rx.recv().await {
            let mut batch = Batch::default();
            batch.absorb(cmd);

            // Give a burst of sends a chance to land in the same write,
            // unless someone is already waiting on it.
            if batch.latest.is_some() && batch.waiters.is_empty() && !self.debounce.is_zero() {
                tokio::time::sleep(self.debounce).await;
            }
            while let Ok(cmd) = rx.try_recv() {
                batch.absorb(cmd);
            }

            if let Some((generation, messages)) = batch.latest {
                self.write(generation, &messages, batch.coalesced).await;
            }

            for waiter in batch.waiters {
                let result = self
                    .last_error
                    .clone()
                    .map_or(Ok(()), |e| Err(SyncError::StorageUnavailable(e)));
                let _ = waiter.send(result);
            }
        }
        tracing::debug!(scope = %self.scope, "Snapshot writer stopped");
    }

    async fn write(&mut self, generation: u64, messages: &[Message], coalesced: usize) {
        let current = self.generation.load(Ordering::SeqCst);
        if generation != current {
            tracing::debug!(
                scope = %self.scope,
                generation,
                current,
                "Discarding stale snapshot"
            );
            return;
        }

        match self.store.save(&self.scope, messages).await {
            Ok(()) => {
                tracing::debug!(
                    scope = %self.scope,
                    count = messages.len(),
                    coalesced,
                    "Snapshot saved"
                );
                self.last_error = None;
            }
            Err(e) => {
                tracing::warn!(scope = %self.scope, error = %e, "Failed to save snapshot");
                let reason = e.to_string();
                let _ = self.notices.send(Notice::StorageUnavailable(reason.clone()));
                self.last_error = Some(reason);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chat_sync_core::{MessageId, StorageError};
    use chrono::DateTime;
    use tokio::sync::{Notify, Semaphore};

    fn msg(id: u64) -> Message {
        Message::outgoing(
            MessageId(id),
            "hi",
            "alice",
            DateTime::from_timestamp(i64::try_from(id).unwrap(), 0).unwrap(),
        )
        .unwrap()
    }

    /// Store whose saves wait for a permit, recording what was written.
    struct GatedStore {
        gate: Semaphore,
        started: Notify,
        saved: Mutex<Vec<Vec<Message>>>,
        fail: bool,
    }

    impl GatedStore {
        fn new(permits: usize, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                gate: Semaphore::new(permits),
                started: Notify::new(),
                saved: Mutex::new(Vec::new()),
                fail,
            })
        }

        fn open() -> Arc<Self> {
            Self::new(1_000, false)
        }

        fn saved(&self) -> Vec<Vec<Message>> {
            self.saved.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageStore for GatedStore {
        async fn load(&self, _scope: &str) -> Result<Vec<Message>, StorageError> {
            Ok(Vec::new())
        }

        async fn save(&self, _scope: &str, messages: &[Message]) -> Result<(), StorageError> {
            self.started.notify_one();
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| StorageError::Internal(e.to_string()))?;
            if self.fail {
                return Err(StorageError::Internal("disk full".into()));
            }
            self.saved.lock().unwrap().push(messages.to_vec());
            Ok(())
        }
    }

    fn writer(
        store: &Arc<GatedStore>,
        debounce: Duration,
    ) -> (SnapshotWriter, broadcast::Receiver<Notice>) {
        let (notices, rx) = broadcast::channel(8);
        let store = Arc::clone(store) as Arc<dyn MessageStore>;
        (
            SnapshotWriter::spawn(store, "global".into(), debounce, notices),
            rx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_into_latest_snapshot() {
        let store = GatedStore::open();
        let (writer, _notices) = writer(&store, Duration::from_millis(50));

        writer.save(vec![msg(1)]);
        writer.save(vec![msg(1), msg(2)]);
        writer.save(vec![msg(1), msg(2), msg(3)]);
        tokio_test::assert_ok!(writer.flush().await);

        assert_eq!(store.saved(), vec![vec![msg(1), msg(2), msg(3)]]);
        writer.shutdown().await;
    }

    #[tokio::test]
    async fn test_flush_without_saves_is_ok() {
        let store = GatedStore::open();
        let (writer, _notices) = writer(&store, Duration::ZERO);
        tokio_test::assert_ok!(writer.flush().await);
        assert!(store.saved().is_empty());
    }

    #[tokio::test]
    async fn test_retired_generation_is_not_written() {
        let store = GatedStore::new(0, false);
        let (writer, _notices) = writer(&store, Duration::ZERO);

        // First save is in flight and blocked on the gate.
        writer.save(vec![msg(1)]);
        store.started.notified().await;

        writer.save(vec![msg(1), msg(2)]);
        assert_eq!(writer.retire(), 1);
        store.gate.add_permits(1_000);

        tokio_test::assert_ok!(writer.flush().await);
        assert_eq!(store.saved(), vec![vec![msg(1)]]);

        // Saves under the new generation go through again.
        writer.save(vec![msg(3)]);
        tokio_test::assert_ok!(writer.flush().await);
        assert_eq!(store.saved().last(), Some(&vec![msg(3)]));
    }

    #[tokio::test]
    async fn test_failed_save_is_reported() {
        let store = GatedStore::new(1_000, true);
        let (writer, mut notices) = writer(&store, Duration::ZERO);

        writer.save(vec![msg(1)]);
        let err = tokio_test::assert_err!(writer.flush().await);
        assert!(matches!(err, SyncError::StorageUnavailable(_)));
        assert!(matches!(
            notices.recv().await.unwrap(),
            Notice::StorageUnavailable(reason) if reason.contains("disk full")
        ));
    }
}
