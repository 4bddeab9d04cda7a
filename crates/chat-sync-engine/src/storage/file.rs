//! File-backed durable storage.
//!
//! One file per key under a root directory:
//!
//! ```text
//! <root>/messages/<scope>.json   full snapshot, JSON array of messages
//! <root>/session/token
//! <root>/session/username
//! ```
//!
//! Every write goes to a temp file in the target directory and is renamed
//! into place, so readers see either the old or the new contents.

use std::{
    fmt::Write as _,
    fs,
    io::{self, Write as _},
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use chat_sync_core::{CredentialStore, Message, MessageStore, StorageError};

const MESSAGES_DIR: &str = "messages";
const SESSION_DIR: &str = "session";
const TOKEN_KEY: &str = "token";
const USERNAME_KEY: &str = "username";

/// File-backed storage implementation.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `root`. Directories are created lazily.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path of the snapshot file for `scope`.
    #[must_use]
    pub fn snapshot_path(&self, scope: &str) -> PathBuf {
        self.root
            .join(MESSAGES_DIR)
            .join(format!("{}.json", scope_file_stem(scope)))
    }

    fn session_path(&self, key: &str) -> PathBuf {
        self.root.join(SESSION_DIR).join(key)
    }
}

#[async_trait]
impl MessageStore for FileStore {
    async fn load(&self, scope: &str) -> Result<Vec<Message>, StorageError> {
        let path = self.snapshot_path(scope);
        let key = scope.to_string();
        blocking(move || {
            let Some(bytes) = read_optional(&path)? else {
                return Ok(Vec::new());
            };
            serde_json::from_slice(&bytes).map_err(|source| StorageError::Corrupt { key, source })
        })
        .await
    }

    async fn save(&self, scope: &str, messages: &[Message]) -> Result<(), StorageError> {
        let path = self.snapshot_path(scope);
        let bytes = serde_json::to_vec(messages)
            .map_err(|e| StorageError::Internal(format!("Failed to encode snapshot: {e}")))?;
        blocking(move || atomic_write(&path, &bytes)).await
    }
}

#[async_trait]
impl CredentialStore for FileStore {
    async fn load_session(&self) -> Result<Option<(String, String)>, StorageError> {
        let token_path = self.session_path(TOKEN_KEY);
        let username_path = self.session_path(USERNAME_KEY);
        blocking(move || {
            let Some(token) = read_optional(&token_path)? else {
                return Ok(None);
            };
            let username = read_optional(&username_path)?.unwrap_or_default();
            Ok(Some((utf8(TOKEN_KEY, token)?, utf8(USERNAME_KEY, username)?)))
        })
        .await
    }

    async fn save_session(&self, token: &str, username: &str) -> Result<(), StorageError> {
        let token_path = self.session_path(TOKEN_KEY);
        let username_path = self.session_path(USERNAME_KEY);
        let (token, username) = (token.to_string(), username.to_string());
        blocking(move || {
            atomic_write(&username_path, username.as_bytes())?;
            atomic_write(&token_path, token.as_bytes())
        })
        .await
    }

    async fn clear_session(&self) -> Result<(), StorageError> {
        let token_path = self.session_path(TOKEN_KEY);
        let username_path = self.session_path(USERNAME_KEY);
        blocking(move || {
            // Token first: without it there is no session, whatever happens next.
            remove_optional(&token_path)?;
            remove_optional(&username_path)
        })
        .await
    }
}

async fn blocking<T, F>(f: F) -> Result<T, StorageError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StorageError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Internal(format!("Storage task failed: {e}")))?
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StorageError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn remove_optional(path: &Path) -> Result<(), StorageError> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

fn utf8(key: &str, bytes: Vec<u8>) -> Result<String, StorageError> {
    String::from_utf8(bytes).map_err(|e| StorageError::Internal(format!("{key} is not UTF-8: {e}")))
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    let dir = path
        .parent()
        .ok_or_else(|| StorageError::Internal(format!("{} has no parent", path.display())))?;
    fs::create_dir_all(dir)?;

    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(data)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| StorageError::Io(e.error))?;
    Ok(())
}

/// Escape a scope key into a file name: `[A-Za-z0-9_-]` pass through,
/// every other byte becomes `%XX`.
fn scope_file_stem(scope: &str) -> String {
    if scope.is_empty() {
        return "%".to_string();
    }
    let mut out = String::with_capacity(scope.len());
    for byte in scope.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            out.push(char::from(byte));
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
    out
}
