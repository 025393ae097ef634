//! Realtime speech-to-text protocol types
//!
//! JSON envelopes exchanged with the streaming STT backend, plus the
//! single-use token response.
//!
//! # Protocol Overview
//!
//! 1. POST the token endpoint with the long-lived API key in a header
//! 2. Connect to the socket URL with the returned token as a query parameter
//! 3. Receive `session_started`
//! 4. Stream audio via `input_audio_chunk` (base64 PCM16, `commit: false`)
//! 5. Receive `partial_transcript` while speaking and `committed_transcript`
//!    once an utterance is final
//! 6. `error` / `auth_error` report failures

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

/// Token issuing endpoint
pub const TOKEN_URL: &str = "https://api.elevenlabs.io/v1/single-use-token/realtime_scribe";

/// Streaming socket endpoint
pub const REALTIME_STT_URL: &str = "wss://api.elevenlabs.io/v1/speech-to-text/realtime";

/// Header carrying the long-lived API key on the token request
pub const API_KEY_HEADER: &str = "xi-api-key";

/// Response body of the token endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub token: String,
}

// ============================================================================
// Client Messages (sent TO the backend)
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "message_type")]
pub enum ClientMessage {
    /// Append audio to the current utterance
    #[serde(rename = "input_audio_chunk")]
    InputAudioChunk {
        /// Base64-encoded PCM16 audio
        audio_base64: String,
        /// Force the backend to finalize the utterance
        commit: bool,
        sample_rate: u32,
    },
}

impl ClientMessage {
    /// Create an audio chunk message from raw PCM16LE bytes
    pub fn audio_chunk(pcm: &[u8], sample_rate: u32) -> Self {
        Self::InputAudioChunk {
            audio_base64: STANDARD.encode(pcm),
            commit: false,
            sample_rate,
        }
    }
}

// ============================================================================
// Server Messages (received FROM the backend)
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "message_type")]
pub enum ServerMessage {
    /// Socket accepted and session configured
    #[serde(rename = "session_started")]
    SessionStarted {
        #[serde(default)]
        session_id: Option<String>,
    },

    /// Interim hypothesis for the current utterance
    #[serde(rename = "partial_transcript")]
    PartialTranscript {
        #[serde(default)]
        text: String,
    },

    /// Final text for an utterance
    #[serde(rename = "committed_transcript")]
    CommittedTranscript {
        #[serde(default)]
        text: String,
    },

    /// Backend-side failure; retryable
    #[serde(rename = "error")]
    Error {
        #[serde(default, alias = "message")]
        error: String,
    },

    /// Credential rejected; fatal
    #[serde(rename = "auth_error")]
    AuthError {
        #[serde(default, alias = "message")]
        error: String,
    },

    /// Catch-all for message types we don't handle
    /// This prevents deserialization failures for unknown types
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    /// Parse a text frame from the socket
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Transcript text and finality, if this is a transcript message
    pub fn transcript(&self) -> Option<(&str, bool)> {
        match self {
            ServerMessage::PartialTranscript { text } => Some((text, false)),
            ServerMessage::CommittedTranscript { text } => Some((text, true)),
            _ => None,
        }
    }
}
