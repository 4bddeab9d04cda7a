//! In-memory storage.

use std::{collections::HashMap, sync::RwLock};

use async_trait::async_trait;
use chat_sync_core::{CredentialStore, Message, MessageStore, StorageError};

/// In-memory storage implementation.
///
/// Useful for tests and ephemeral sessions.
/// Data is lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshots: RwLock<HashMap<String, Vec<Message>>>,
    session: RwLock<Option<(String, String)>>,
}

impl MemoryStore {
    /// Create a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn load(&self, scope: &str) -> Result<Vec<Message>, StorageError> {
        Ok(self
            .snapshots
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .get(scope)
            .cloned()
            .unwrap_or_default())
    }

    async fn save(&self, scope: &str, messages: &[Message]) -> Result<(), StorageError> {
        self.snapshots
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .insert(scope.to_string(), messages.to_vec());
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn load_session(&self) -> Result<Option<(String, String)>, StorageError> {
        Ok(self
            .session
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .clone())
    }

    async fn save_session(&self, token: &str, username: &str) -> Result<(), StorageError> {
        *self
            .session
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))? =
            Some((token.to_string(), username.to_string()));
        Ok(())
    }

    async fn clear_session(&self) -> Result<(), StorageError> {
        *self
            .session
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))? = None;
        Ok(())
    }
}
