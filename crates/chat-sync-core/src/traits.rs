//! Core traits for durable storage.

use async_trait::async_trait;
use thiserror::Error;

use crate::Message;

/// Storage error.
///
/// Every variant is treated as "storage unavailable" by the sync engine:
/// reported, never fatal.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Corrupt data under key {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Durable snapshot store for conversation scopes.
///
/// There is no append API: callers always replace the full snapshot.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Load the snapshot saved for `scope`, in stored order.
    ///
    /// Returns an empty vector if nothing was ever saved.
    async fn load(&self, scope: &str) -> Result<Vec<Message>, StorageError>;

    /// Replace the snapshot for `scope`.
    ///
    /// Must be atomic: a concurrent `load` sees either the old or the new
    /// snapshot, never a mix.
    async fn save(&self, scope: &str, messages: &[Message]) -> Result<(), StorageError>;
}

/// Durable keys for the session token and display username.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Load `(token, username)` if a token is stored.
    async fn load_session(&self) -> Result<Option<(String, String)>, StorageError>;

    /// Persist token and username.
    async fn save_session(&self, token: &str, username: &str) -> Result<(), StorageError>;

    /// Remove both keys (logout).
    async fn clear_session(&self) -> Result<(), StorageError>;
}
