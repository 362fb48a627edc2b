use async_trait::async_trait;
use fieldlink::connection::ControlFrame;
use fieldlink::{Credentials, PushChannel, PushEvent, PushLink, SyncError};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

/// [`PushChannel`] over a WebSocket carrying JSON text frames.
///
/// Outbound: [`ControlFrame`] objects. Inbound: `{"topic": .., "payload": ..}`
/// events; anything else is skipped.
pub struct WsPushChannel {
    url: String,
}

impl WsPushChannel {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl PushChannel for WsPushChannel {
    async fn open(&self, credentials: &Credentials) -> Result<Box<dyn PushLink>, SyncError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| SyncError::ClientRejected {
                status: 0,
                message: format!("invalid push url: {}", e),
            })?;

        let bearer = HeaderValue::from_str(&format!("Bearer {}", credentials.access_token))
            .map_err(|e| SyncError::ClientRejected {
                status: 0,
                message: format!("invalid access token: {}", e),
            })?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, response) = connect_async(request).await.map_err(classify)?;
        info!(url = %self.url, status = %response.status(), "Push channel open");

        Ok(Box::new(WsLink { stream }))
    }
}

struct WsLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl PushLink for WsLink {
    async fn send(&mut self, frame: &ControlFrame) -> Result<(), SyncError> {
        let text = serde_json::to_string(frame).map_err(|e| SyncError::ClientRejected {
            status: 0,
            message: format!("unencodable frame: {}", e),
        })?;
        self.stream.send(Message::Text(text)).await.map_err(classify)
    }

    async fn next_event(&mut self) -> Option<Result<PushEvent, SyncError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => match serde_json::from_str::<PushEvent>(&text) {
                    Ok(event) => return Some(Ok(event)),
                    Err(e) => debug!(error = %e, "Skipping non-event message"),
                },
                Ok(Message::Close(frame)) => {
                    debug!(frame = ?frame, "Server closed push channel");
                    return None;
                }
                // Pongs are queued by tungstenite itself
                Ok(_) => {}
                Err(e) => return Some(Err(classify(e))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "Error closing push channel");
        }
    }
}

fn classify(e: tungstenite::Error) -> SyncError {
    match e {
        tungstenite::Error::Http(response) => {
            let status = response.status().as_u16();
            SyncError::from_status(status, format!("handshake rejected with status {}", status))
        }
        other => SyncError::NetworkUnavailable(other.to_string()),
    }
}
