//! Authenticated session context.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::traits::{CredentialStore, StorageError};

/// Identity and credential supplied by the login flow.
///
/// The sync core only reads it: the token is attached to channel and REST
/// calls, the username stamps outgoing messages.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    token: String,
    username: String,
}

impl Session {
    /// Create a session from a token and display name.
    ///
    /// Returns `None` when the token is blank: such a session cannot
    /// authenticate anything.
    #[must_use]
    pub fn new(token: impl Into<String>, username: impl Into<String>) -> Option<Self> {
        let token = token.into();
        if token.trim().is_empty() {
            return None;
        }
        Some(Self {
            token,
            username: username.into(),
        })
    }

    /// Opaque credential.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Display identity of the local user.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Value for an `Authorization` header.
    #[must_use]
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }

    /// Restore the persisted session.
    ///
    /// `Ok(None)` means no usable token is stored and the user has to go
    /// through login first.
    ///
    /// # Errors
    /// Returns error if the credential store cannot be read.
    pub async fn restore<C>(store: &C) -> Result<Option<Self>, StorageError>
    where
        C: CredentialStore + ?Sized,
    {
        Ok(store
            .load_session()
            .await?
            .and_then(|(token, username)| Self::new(token, username)))
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("token", &"<redacted>")
            .field("username", &self.username)
            .finish()
    }
}
