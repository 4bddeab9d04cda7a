//! Engine errors and user-facing notices.

use chat_sync_channel::ChannelError;
use chat_sync_core::{MessageError, StorageError};
use thiserror::Error;

/// Sync engine error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("Channel not ready")]
    ChannelNotReady,
    #[error("Transport failure: {0}")]
    TransportFailure(String),
    #[error("Invalid message: {0}")]
    InvalidMessage(#[from] MessageError),
    #[error("Authentication required")]
    AuthRequired,
    #[error("Sync engine is closed")]
    Closed,
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        Self::StorageUnavailable(err.to_string())
    }
}

impl From<ChannelError> for SyncError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::NotReady => Self::ChannelNotReady,
            ChannelError::Unauthorized(_) => Self::AuthRequired,
            ChannelError::Transport(reason) => Self::TransportFailure(reason),
            ChannelError::Timeout => Self::TransportFailure(err.to_string()),
        }
    }
}

/// Non-fatal conditions worth showing to the user.
///
/// Transient reconnects are not notices; they show through the
/// connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// A load or save failed; the in-memory timeline stays authoritative.
    StorageUnavailable(String),
    /// The reconnect budget is spent. Pending messages wait for the next
    /// `initialize`.
    Offline { attempts: u32 },
    /// The server rejected the session; the user has to log in again.
    AuthRequired(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_error_mapping() {
        assert_eq!(
            SyncError::from(ChannelError::NotReady),
            SyncError::ChannelNotReady
        );
        assert_eq!(
            SyncError::from(ChannelError::Unauthorized("401".into())),
            SyncError::AuthRequired
        );
        assert!(matches!(
            SyncError::from(ChannelError::Timeout),
            SyncError::TransportFailure(_)
        ));
    }

    #[test]
    fn test_storage_error_keeps_reason() {
        let err = SyncError::from(StorageError::Internal("disk full".into()));
        assert_eq!(err.to_string(), "Storage unavailable: Storage error: disk full");
    }
}
