//! Crash-tolerant streaming speech-to-text client
//!
//! The host process may be suspended or killed at any moment, so everything
//! that has to outlive it (transcript segments, the session-active flag,
//! circuit breaker state) goes to a [`storage::DurableStore`] at every
//! meaningful change and is reloaded once at startup.
//!
//! - [`streaming`]: one reconnecting [`streaming::StreamConnection`] per
//!   audio source, with a drop-oldest frame buffer and final-transcript dedup
//! - [`transcript`]: ordered, debounced, durable segment log and crash recovery
//! - [`circuit`]: per-dependency circuit breakers with durable recovery timers
//! - [`pipeline`]: wires sources, log and breakers into one session

pub mod circuit;
pub mod config;
pub mod metrics;
pub mod pipeline;
pub mod scheduler;
pub mod storage;
pub mod streaming;
pub mod transcript;

pub use circuit::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitError, CircuitState};
pub use config::ResilienceConfig;
pub use pipeline::{start_circuit_breakers, SourceEvent, TranscriptionSession};
pub use storage::{DurableStore, FileStore, MemoryStore};
pub use streaming::{
    AudioFrame, ConnectionEvent, ConnectionState, ReconnectPolicy, StreamConnection, StreamingError,
};
pub use transcript::{DurableSegmentLog, StartupOutcome, TranscriptSegment};
