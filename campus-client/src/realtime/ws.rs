//! Websocket change transport over tokio-tungstenite.
//!
//! One socket per channel. After the handshake the client sends
//! `{"type":"subscribe","table":..,"event":..,"filter":..}`; the server then
//! pushes `{eventType, table, record, oldRecord}` text frames. Other text
//! frames (acks, heartbeats) are skipped.

use async_trait::async_trait;
use campus_core::{ChangeEvent, ChangeStream, ChangeTransport, ChannelSpec, RealtimeError};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::config::{AuthConfig, ClientConfig};

#[derive(Debug, Clone)]
pub struct WsTransport {
    endpoint: String,
    auth: AuthConfig,
}

impl WsTransport {
    pub fn new(config: &ClientConfig) -> Self {
        Self::with_settings(&config.realtime_endpoint, config.auth.clone())
    }

    pub fn with_settings(endpoint: &str, auth: AuthConfig) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            auth,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ChangeTransport for WsTransport {
    async fn connect(&self, spec: &ChannelSpec) -> Result<ChangeStream, RealtimeError> {
        let mut request = self
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(connect_error)?;
        let headers = request.headers_mut();
        if let Some(api_key) = &self.auth.api_key {
            headers.insert(HeaderName::from_static("apikey"), header_value(api_key)?);
        }
        if let Some(token) = &self.auth.access_token {
            headers.insert(
                HeaderName::from_static("authorization"),
                header_value(&format!("Bearer {}", token))?,
            );
        }

        let (mut socket, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(connect_error)?;
        socket
            .send(Message::Text(subscribe_frame(spec).to_string()))
            .await
            .map_err(|e| RealtimeError::Protocol {
                reason: e.to_string(),
            })?;

        let stream = futures_util::stream::unfold(socket, |mut socket| async move {
            loop {
                let item = match socket.next().await? {
                    Ok(Message::Text(text)) => decode_frame(&text),
                    Ok(Message::Close(_)) => return None,
                    Ok(_) => None,
                    Err(err) => Some(Err(RealtimeError::Protocol {
                        reason: err.to_string(),
                    })),
                };
                if let Some(item) = item {
                    return Some((item, socket));
                }
            }
        });
        Ok(stream.boxed())
    }
}

fn connect_error(err: impl std::fmt::Display) -> RealtimeError {
    RealtimeError::Connect {
        reason: err.to_string(),
    }
}

fn header_value(value: &str) -> Result<HeaderValue, RealtimeError> {
    HeaderValue::from_str(value).map_err(connect_error)
}

fn subscribe_frame(spec: &ChannelSpec) -> Value {
    json!({
        "type": "subscribe",
        "table": spec.table,
        "event": spec.event,
        "filter": spec.row_filter.as_ref().map(|f| f.to_string()),
    })
}

/// `None` for frames that are not change payloads.
fn decode_frame(text: &str) -> Option<Result<ChangeEvent, RealtimeError>> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            return Some(Err(RealtimeError::Decode {
                reason: err.to_string(),
            }))
        }
    };
    if value.get("eventType").is_none() {
        debug!(frame = %text, "Skipping control frame");
        return None;
    }
    Some(
        serde_json::from_value(value).map_err(|e| RealtimeError::Decode {
            reason: e.to_string(),
        }),
    )
}
