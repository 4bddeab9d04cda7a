//! Core abstractions for chat synchronization.
//!
//! This crate provides the fundamental building blocks:
//! - `Message` - Typed chat message with direction and delivery state
//! - `Timeline` - Ordered, deduplicated message log
//! - `Session` - Authenticated identity read by the sync core
//! - `SyncConfig` - Layered configuration
//! - Storage traits

pub mod config;
pub mod message;
pub mod session;
pub mod timeline;
pub mod traits;

pub use config::SyncConfig;
pub use message::{DeliveryState, Direction, Message, MessageError, MessageId};
pub use session::Session;
pub use timeline::{MergeOutcome, Timeline};
pub use traits::{CredentialStore, MessageStore, StorageError};
