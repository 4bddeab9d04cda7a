//! WebSocket connector.

use async_trait::async_trait;
use chat_sync_core::Session;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self, Message,
        client::IntoClientRequest,
        http::{HeaderValue, StatusCode, header::AUTHORIZATION},
    },
};

use crate::{
    protocol::{ClientEvent, ServerEvent},
    transport::{ChannelError, Connector, Link},
};

/// Connects to the chat server over WebSocket.
///
/// The session token travels as `Authorization: Bearer <token>` on the
/// upgrade request; frames are JSON text.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    /// Create a connector for `url` (`ws://` or `wss://`).
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, session: &Session) -> Result<Link, ChannelError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ChannelError::Transport(format!("Invalid channel URL: {e}")))?;
        let auth = HeaderValue::from_str(&session.bearer())
            .map_err(|e| ChannelError::Unauthorized(format!("Unusable token: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        let (stream, _response) = connect_async(request).await.map_err(handshake_error)?;
        let (mut sink, mut source) = stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientEvent>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<ServerEvent>();

        // Forward queued events to the socket; close it once the queue ends.
        let writer = tokio::spawn(async move {
            while let Some(event) = out_rx.recv().await {
                let json = match event.encode() {
                    Ok(j) => j,
                    Err(e) => {
                        tracing::error!("Failed to serialize event: {e}");
                        continue;
                    }
                };
                if sink.send(Message::Text(json.into())).await.is_err() {
                    return;
                }
            }
            let _ = sink.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                let text = match frame {
                    Ok(Message::Text(t)) => t.as_str().to_owned(),
                    Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                        Ok(s) => s,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::warn!("WebSocket error: {e}");
                        break;
                    }
                };

                match ServerEvent::decode(&text) {
                    Ok(event) => {
                        if in_tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("Invalid server event: {e}"),
                }
            }
        });

        Ok(Link::new(out_tx, in_rx, vec![writer, reader]))
    }
}

fn handshake_error(err: tungstenite::Error) -> ChannelError {
    match err {
        tungstenite::Error::Http(response)
            if matches!(
                response.status(),
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
            ) =>
        {
            ChannelError::Unauthorized(response.status().to_string())
        }
        other => ChannelError::Transport(other.to_string()),
    }
}
