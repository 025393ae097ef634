//! Token fetch and socket transport
//!
//! [`Connector`] is the seam between [`StreamConnection`] and the network:
//! one call per attempt to fetch an ephemeral token, one to open a socket
//! with it. [`WsConnector`] is the production implementation over reqwest
//! and tokio-tungstenite.
//!
//! # Connection Flow
//!
//! 1. `fetch_token()` - POST the token endpoint with the API key header
//! 2. `open()` - connect the socket with the token, wait for `session_started`
//! 3. `Socket::send()` / `Socket::recv()` - exchange JSON text frames
//! 4. `Socket::close()` - send a normal close frame
//!
//! [`StreamConnection`]: super::StreamConnection

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::{Client, StatusCode};
use std::sync::{Once, OnceLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        protocol::frame::coding::CloseCode,
        protocol::CloseFrame,
        Error as WsError, Message,
    },
    MaybeTlsStream, WebSocketStream,
};

use super::protocol::{ServerMessage, TokenResponse, API_KEY_HEADER, REALTIME_STT_URL, TOKEN_URL};
use super::StreamingError;

/// Timeout for the token request
const TOKEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection timeout for the WebSocket handshake
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for waiting for session_started
const SESSION_TIMEOUT: Duration = Duration::from_secs(5);

/// Realtime model requested on the socket
pub const DEFAULT_MODEL_ID: &str = "scribe_v2_realtime";

/// What a live socket produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// A text frame
    Text(String),
    /// Close frame or end of stream; `clean` only for a normal close code
    Closed { clean: bool, reason: String },
    /// Transport failure or a fatal close
    Failed(StreamingError),
}

/// One open socket to the backend
#[async_trait]
pub trait Socket: Send {
    async fn send(&mut self, text: String) -> Result<(), StreamingError>;

    /// Next event; must be cancellation-safe
    async fn recv(&mut self) -> SocketEvent;

    async fn close(&mut self);
}

/// Opens sockets to the backend
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Exchange the long-lived credential for a short-lived token
    async fn fetch_token(&self) -> Result<String, StreamingError>;

    async fn open(&self, token: &str) -> Result<Box<dyn Socket>, StreamingError>;
}

/// Global HTTP client for reuse across requests (avoids TLS handshake overhead)
static HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

fn get_http_client() -> &'static Client {
    HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(TOKEN_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                log::warn!("Failed to build tuned HTTP client, using defaults: {}", e);
                Client::new()
            })
    })
}

/// rustls needs a process-wide crypto provider before the first TLS handshake
fn ensure_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        // Err means the host already installed one
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Production connector: reqwest token request + tokio-tungstenite socket
#[derive(Debug, Clone)]
pub struct WsConnector {
    api_key: String,
    token_url: String,
    socket_url: String,
    model_id: String,
}

impl WsConnector {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            token_url: TOKEN_URL.to_string(),
            socket_url: REALTIME_STT_URL.to_string(),
            model_id: DEFAULT_MODEL_ID.to_string(),
        }
    }

    /// Build from `ELEVENLABS_API_KEY`
    pub fn from_env() -> Result<Self, StreamingError> {
        crate::config::get_api_key()
            .map(Self::new)
            .ok_or(StreamingError::MissingApiKey)
    }

    /// Point at different endpoints (staging, local mock server)
    pub fn with_endpoints(
        mut self,
        token_url: impl Into<String>,
        socket_url: impl Into<String>,
    ) -> Self {
        self.token_url = token_url.into();
        self.socket_url = socket_url.into();
        self
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn fetch_token(&self) -> Result<String, StreamingError> {
        if self.api_key.is_empty() {
            return Err(StreamingError::MissingApiKey);
        }

        let response = get_http_client()
            .post(&self.token_url)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(|e| StreamingError::ConnectionFailed(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(StreamingError::AuthenticationFailed(format!(
                "Token endpoint rejected credentials ({})",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            log::warn!("Token endpoint error ({}): {}", status.as_u16(), error_text);
            return Err(StreamingError::TokenRejected(format!(
                "Token endpoint returned {}",
                status.as_u16()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| StreamingError::TokenRejected(e.to_string()))?;
        log::debug!("Fetched single-use token");
        Ok(body.token)
    }

    async fn open(&self, token: &str) -> Result<Box<dyn Socket>, StreamingError> {
        ensure_crypto_provider();

        let request = format!(
            "{}?model_id={}&token={}",
            self.socket_url, self.model_id, token
        )
        .into_client_request()
        .map_err(|e| StreamingError::ConnectionFailed(e.to_string()))?;

        log::info!("Connecting to realtime speech-to-text socket...");

        let (stream, _response) = timeout(
            CONNECTION_TIMEOUT,
            connect_async_with_config(
                request, None, true, // disable_nagle (we want low latency)
            ),
        )
        .await
        .map_err(|_| StreamingError::ConnectionFailed("Connection timeout".to_string()))?
        .map_err(handshake_error)?;

        let mut socket = WsSocket { stream };
        socket.await_session_started().await?;
        Ok(Box::new(socket))
    }
}

fn handshake_error(e: WsError) -> StreamingError {
    match &e {
        WsError::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
            StreamingError::AuthenticationFailed(format!(
                "Socket handshake rejected ({})",
                response.status()
            ))
        }
        _ => StreamingError::ConnectionFailed(e.to_string()),
    }
}

/// Map a close frame to a socket event
fn close_event(frame: Option<CloseFrame<'_>>) -> SocketEvent {
    match frame {
        None => SocketEvent::Closed {
            clean: false,
            reason: "Closed without status".to_string(),
        },
        Some(frame) => match frame.code {
            CloseCode::Normal => SocketEvent::Closed {
                clean: true,
                reason: frame.reason.to_string(),
            },
            CloseCode::Policy => {
                SocketEvent::Failed(StreamingError::AuthenticationFailed(frame.reason.to_string()))
            }
            code => SocketEvent::Closed {
                clean: false,
                reason: format!("{} ({})", frame.reason, u16::from(code)),
            },
        },
    }
}

struct WsSocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsSocket {
    /// Wait for session_started, surfacing auth errors that arrive first
    async fn await_session_started(&mut self) -> Result<(), StreamingError> {
        timeout(SESSION_TIMEOUT, async {
            loop {
                match self.recv().await {
                    SocketEvent::Text(text) => match ServerMessage::parse(&text) {
                        Ok(ServerMessage::SessionStarted { session_id }) => {
                            log::info!("Session started: {:?}", session_id);
                            return Ok(());
                        }
                        Ok(ServerMessage::AuthError { error }) => {
                            return Err(StreamingError::AuthenticationFailed(error));
                        }
                        Ok(ServerMessage::Error { error }) => {
                            return Err(StreamingError::ConnectionFailed(error));
                        }
                        Ok(_) => {
                            log::debug!("Ignoring message while waiting for session_started");
                        }
                        Err(e) => {
                            log::warn!("Failed to parse message: {}", e);
                        }
                    },
                    SocketEvent::Closed { reason, .. } => {
                        return Err(StreamingError::Disconnected(format!(
                            "Connection closed before session started: {}",
                            reason
                        )));
                    }
                    SocketEvent::Failed(e) => return Err(e),
                }
            }
        })
        .await
        .map_err(|_| StreamingError::ConnectionFailed("Session start timeout".to_string()))?
    }
}

#[async_trait]
impl Socket for WsSocket {
    async fn send(&mut self, text: String) -> Result<(), StreamingError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| StreamingError::SendFailed(e.to_string()))
    }

    async fn recv(&mut self) -> SocketEvent {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return SocketEvent::Text(text),
                Some(Ok(Message::Close(frame))) => return close_event(frame),
                Some(Ok(_)) => {} // Ignore ping/pong/binary
                Some(Err(e)) => {
                    return SocketEvent::Failed(StreamingError::ProtocolError(e.to_string()))
                }
                None => {
                    return SocketEvent::Closed {
                        clean: false,
                        reason: "Stream ended".to_string(),
                    }
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            log::debug!("Error closing WebSocket: {}", e);
        }
    }
}
