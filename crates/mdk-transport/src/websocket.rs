//! WebSocket connector backed by `tokio-tungstenite`.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt, future};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::trace;

use crate::connector::{Connection, Connector};
use crate::error::{TransportError, TransportResult};

/// Dials a `ws://` or `wss://` backend URL.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    /// Creates a connector for `url`.
    pub fn new(url: impl Into<String>) -> TransportResult<Self> {
        let url = url.into();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(TransportError::ConfigurationError(format!(
                "WebSocket URL must start with ws:// or wss://, got {url}"
            )));
        }
        Ok(Self {
            url,
            connect_timeout: Duration::from_secs(10),
        })
    }

    /// Set connection establishment timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// The URL being dialed.
    pub fn url(&self) -> &str {
        &self.url
    }
}

fn inbound_frame(
    item: Result<WsMessage, tokio_tungstenite::tungstenite::Error>,
) -> Option<TransportResult<String>> {
    match item {
        Ok(WsMessage::Text(text)) => Some(Ok(text.to_string())),
        Ok(WsMessage::Binary(data)) => Some(
            String::from_utf8(data.to_vec())
                .map_err(|e| TransportError::ConnectionLost(format!("non UTF-8 frame: {e}"))),
        ),
        Ok(WsMessage::Close(_)) => Some(Err(TransportError::ConnectionLost(
            "WebSocket closed".to_string(),
        ))),
        Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_)) => {
            trace!("Skipping control frame");
            None
        }
        Err(e) => Some(Err(TransportError::ConnectionLost(e.to_string()))),
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> TransportResult<Connection> {
        let (stream, _response) =
            tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()))
                .await
                .map_err(|_| TransportError::ConnectionTimeout {
                    endpoint: self.url.clone(),
                    timeout: self.connect_timeout,
                })?
                .map_err(|e| {
                    TransportError::ConnectionFailed(format!(
                        "WebSocket connection to {} failed: {e}",
                        self.url
                    ))
                })?;

        let (writer, reader) = stream.split();
        let sink = writer
            .sink_map_err(|e| TransportError::SendFailed(e.to_string()))
            .with(|frame: String| future::ready(Ok::<_, TransportError>(WsMessage::Text(frame.into()))));
        let stream = reader.filter_map(|item| future::ready(inbound_frame(item)));

        Ok(Connection::new(sink, stream))
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_websocket_urls() {
        assert!(WebSocketConnector::new("http://localhost:52690").is_err());
        assert!(WebSocketConnector::new("localhost").is_err());
    }

    #[test]
    fn accepts_ws_and_wss() {
        let plain = WebSocketConnector::new("ws://localhost:52690/ws").unwrap();
        assert_eq!(plain.endpoint(), "ws://localhost:52690/ws");
        assert!(WebSocketConnector::new("wss://mdk.example.com/ws").is_ok());
    }

    #[test]
    fn control_frames_are_skipped() {
        assert!(inbound_frame(Ok(WsMessage::Ping(Vec::new().into()))).is_none());
        assert!(inbound_frame(Ok(WsMessage::Pong(Vec::new().into()))).is_none());
    }

    #[test]
    fn close_frame_ends_the_connection() {
        assert!(matches!(
            inbound_frame(Ok(WsMessage::Close(None))),
            Some(Err(TransportError::ConnectionLost(_)))
        ));
    }

    #[test]
    fn text_and_binary_frames_become_strings() {
        let text = inbound_frame(Ok(WsMessage::Text("{}".into())));
        assert!(matches!(text, Some(Ok(frame)) if frame == "{}"));

        let binary = inbound_frame(Ok(WsMessage::Binary(b"{\"a\":1}".to_vec().into())));
        assert!(matches!(binary, Some(Ok(frame)) if frame == "{\"a\":1}"));
    }

    #[tokio::test]
    async fn unreachable_backend_fails_to_connect() {
        let connector = WebSocketConnector::new("ws://127.0.0.1:1/ws")
            .unwrap()
            .with_connect_timeout(Duration::from_secs(2));
        assert!(connector.connect().await.is_err());
    }
}
