//! Realtime channel for chat synchronization.
//!
//! Provides:
//! - Wire protocol (named JSON events)
//! - `Connector` seam and `Link` connection handle
//! - `ChannelManager` lifecycle with reconnect-with-backoff
//! - WebSocket connector (feature: websocket)

pub mod backoff;
pub mod manager;
pub mod protocol;
pub mod transport;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use backoff::Backoff;
pub use manager::{ChannelEvent, ChannelManager, ConnectionState};
pub use protocol::{ClientEvent, MessagePayload, ServerEvent};
pub use transport::{ChannelError, Connector, Link};

#[cfg(feature = "websocket")]
pub use websocket::WsConnector;
