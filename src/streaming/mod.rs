//! Streaming transcription module for real-time speech-to-text
//!
//! One [`StreamConnection`] per audio source owns its socket, its frame
//! buffer and its dedup state. Frames pushed while offline wait in a
//! [`FrameRingBuffer`] and are sent in order once the socket is back.
//!
//! # Architecture
//!
//! ```text
//! Audio frames ──▶ StreamConnection::send_audio()
//!                        │ connected?
//!              no ◀──────┴──────▶ yes
//!               │                  │
//!        FrameRingBuffer ──flush──▶ outbound queue ──▶ Socket
//!                                                        │
//!                                    ConnectionEvent ◀── dedup ◀── transcripts
//! ```
//!
//! # Reconnect Strategy
//!
//! - Retryable failures back off exponentially with jitter, up to a bounded
//!   number of attempts, then give up with a terminal error
//! - Authentication failures are fatal and never retried
//! - A clean close or `disconnect()` never reconnects

mod connection;
mod dedup;
mod frame_buffer;
mod protocol;
mod reconnect;
mod state;
mod transport;

pub use connection::{ConnectionConfig, ConnectionEvent, ConnectionEvents, StreamConnection};
pub use dedup::FinalDedup;
pub use frame_buffer::{AudioFrame, FrameRingBuffer};
pub use protocol::{ClientMessage, ServerMessage, TokenResponse, REALTIME_STT_URL, TOKEN_URL};
pub use reconnect::ReconnectPolicy;
pub use state::{reduce, ConnectionState, Effect, Event, Phase};
pub use transport::{Connector, Socket, SocketEvent, WsConnector};

/// Errors that can occur during streaming transcription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamingError {
    /// API key not configured
    MissingApiKey,
    /// Failed to fetch a token or establish the socket
    ConnectionFailed(String),
    /// Credentials rejected by the token endpoint or the socket
    AuthenticationFailed(String),
    /// Token endpoint answered, but not with a usable token
    TokenRejected(String),
    /// Malformed or unexpected data from the backend
    ProtocolError(String),
    /// Connection was closed unexpectedly
    Disconnected(String),
    /// Failed to send audio data
    SendFailed(String),
    /// The circuit breaker guarding the backend is open
    CircuitOpen(String),
}

impl StreamingError {
    /// Fatal errors are reported once and never retried
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StreamingError::MissingApiKey
                | StreamingError::AuthenticationFailed(_)
                | StreamingError::TokenRejected(_)
        )
    }
}

impl std::fmt::Display for StreamingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamingError::MissingApiKey => {
                write!(
                    f,
                    "Speech-to-text API key not configured. Set ELEVENLABS_API_KEY environment variable."
                )
            }
            StreamingError::ConnectionFailed(e) => {
                write!(f, "Failed to connect to speech-to-text backend: {}", e)
            }
            StreamingError::AuthenticationFailed(e) => {
                write!(f, "Authentication failed: {}", e)
            }
            StreamingError::TokenRejected(e) => {
                write!(f, "Token request failed: {}", e)
            }
            StreamingError::ProtocolError(e) => {
                write!(f, "WebSocket protocol error: {}", e)
            }
            StreamingError::Disconnected(e) => {
                write!(f, "WebSocket disconnected: {}", e)
            }
            StreamingError::SendFailed(e) => {
                write!(f, "Failed to send audio: {}", e)
            }
            StreamingError::CircuitOpen(service) => {
                write!(f, "Circuit breaker open for {}", service)
            }
        }
    }
}

impl std::error::Error for StreamingError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streaming_error_display() {
        let err = StreamingError::MissingApiKey;
        assert!(err.to_string().contains("ELEVENLABS_API_KEY"));

        let err = StreamingError::ConnectionFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));

        let err = StreamingError::AuthenticationFailed("invalid key".to_string());
        assert!(err.to_string().contains("invalid key"));

        let err = StreamingError::CircuitOpen("stt".to_string());
        assert!(err.to_string().contains("stt"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(StreamingError::MissingApiKey.is_fatal());
        assert!(StreamingError::AuthenticationFailed("401".to_string()).is_fatal());
        assert!(StreamingError::TokenRejected("500".to_string()).is_fatal());
        assert!(!StreamingError::ConnectionFailed("reset".to_string()).is_fatal());
        assert!(!StreamingError::Disconnected("eof".to_string()).is_fatal());
        assert!(!StreamingError::CircuitOpen("stt".to_string()).is_fatal());
    }
}
