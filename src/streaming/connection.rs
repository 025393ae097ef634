//! One logical streaming channel per audio source
//!
//! [`StreamConnection`] runs the effects of the connection reducer: it
//! fetches tokens, opens sockets, arms backoff timers, moves frames between
//! the ring buffer and the live socket, and reports everything to its owner
//! as [`ConnectionEvent`]s on a channel.
//!
//! # Concurrency
//!
//! All mutable state lives in one `Inner` behind a std mutex that is never
//! held across an `.await`. Background work (the socket pump, backoff timers,
//! in-flight attempts) is tagged with a generation number; anything that
//! completes under an older generation is discarded.

use futures_util::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::dedup::FinalDedup;
use super::frame_buffer::{AudioFrame, FrameRingBuffer};
use super::protocol::{ClientMessage, ServerMessage};
use super::reconnect::ReconnectPolicy;
use super::state::{reduce, ConnectionState, Effect, Event, Phase};
use super::transport::{Connector, Socket, SocketEvent};
use super::StreamingError;
use crate::circuit::CircuitBreakerRegistry;
use crate::metrics::{ConnectionMetrics, ConnectionStats, ErrorRecord};
use crate::transcript::TranscriptSegment;

/// Extra room in the outbound queue beyond the ring buffer capacity, so a
/// full buffer can always be flushed in one go on connect
const OUTBOUND_HEADROOM: usize = 32;

/// How long `disconnect()` waits for the socket to close
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Label attached to every transcript segment from this source
    pub source_label: String,
    pub sample_rate: u32,
    /// Frames held while offline
    pub buffer_capacity: usize,
    /// Identical finals within this window are dropped
    pub dedup_window_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            source_label: "microphone".to_string(),
            sample_rate: 16000,
            buffer_capacity: 100,
            dedup_window_ms: 1000,
        }
    }
}

impl ConnectionConfig {
    pub fn for_source(source_label: impl Into<String>) -> Self {
        Self {
            source_label: source_label.into(),
            ..Default::default()
        }
    }
}

/// Everything a connection reports to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Socket is up and buffered frames were flushed
    Connected,
    StateChanged(ConnectionState),
    Transcript(TranscriptSegment),
    /// `can_retry == false` means the connection has stopped for good
    Error { message: String, can_retry: bool },
}

/// Receiver half handed out by [`StreamConnection::new`]
pub type ConnectionEvents = mpsc::UnboundedReceiver<ConnectionEvent>;

struct Inner {
    phase: Phase,
    buffer: FrameRingBuffer,
    dedup: FinalDedup,
    /// Queue feeding the live socket; `None` while offline
    outbound: Option<mpsc::Sender<AudioFrame>>,
    socket_cancel: Option<CancellationToken>,
    socket_task: Option<JoinHandle<()>>,
    retry_timer: Option<JoinHandle<()>>,
    /// Bumped per attempt and on disconnect
    generation: u64,
    breaker: Option<(Arc<CircuitBreakerRegistry>, String)>,
    metrics: ConnectionMetrics,
}

struct Shared {
    config: ConnectionConfig,
    policy: ReconnectPolicy,
    connector: Arc<dyn Connector>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    inner: Mutex<Inner>,
}

/// Streaming connection for a single audio source
///
/// Created at session start and `disconnect()`ed at session end. Dropping
/// the handle has the same effect as `disconnect()` minus waiting for the
/// socket to close.
pub struct StreamConnection {
    shared: Arc<Shared>,
}

impl StreamConnection {
    pub fn new(
        config: ConnectionConfig,
        policy: ReconnectPolicy,
        connector: Arc<dyn Connector>,
    ) -> (Self, ConnectionEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Inner {
            phase: Phase::Disconnected,
            buffer: FrameRingBuffer::new(config.buffer_capacity),
            dedup: FinalDedup::new(Duration::from_millis(config.dedup_window_ms)),
            outbound: None,
            socket_cancel: None,
            socket_task: None,
            retry_timer: None,
            generation: 0,
            breaker: None,
            metrics: ConnectionMetrics::new(config.source_label.clone()),
        };
        let connection = Self {
            shared: Arc::new(Shared {
                config,
                policy,
                connector,
                events,
                inner: Mutex::new(inner),
            }),
        };
        (connection, rx)
    }

    /// Guard every attempt with the breaker registered as `service_id`
    pub fn with_circuit_breaker(
        self,
        registry: Arc<CircuitBreakerRegistry>,
        service_id: impl Into<String>,
    ) -> Self {
        self.shared.lock().breaker = Some((registry, service_id.into()));
        self
    }

    pub fn source_label(&self) -> &str {
        &self.shared.config.source_label
    }

    /// Start connecting. No-op while connecting, connected or reconnecting,
    /// and after `disconnect()`.
    ///
    /// Returns once the first attempt has either connected or failed; any
    /// retries run in the background. The attempt itself runs on its own
    /// task, so dropping this future does not strand the connection.
    pub async fn connect(&self) {
        let attempt = {
            let mut inner = self.shared.lock();
            if inner.phase == Phase::Closed {
                log::warn!(
                    "StreamConnection[{}]: connect() after disconnect() ignored",
                    self.shared.config.source_label
                );
                return;
            }
            self.shared.apply(&mut inner, Event::ConnectRequested)
        };

        if let Some(generation) = attempt {
            let task = tokio::spawn(run_attempt(Arc::clone(&self.shared), generation));
            if let Err(e) = task.await {
                log::warn!(
                    "StreamConnection[{}]: connection attempt task failed: {}",
                    self.shared.config.source_label,
                    e
                );
            }
        }
    }

    /// Queue one frame. Never blocks.
    ///
    /// While connected, buffered frames go out first (oldest first), then
    /// `frame`. Otherwise `frame` is parked in the ring buffer.
    pub fn send_audio(&self, frame: AudioFrame) {
        let mut guard = self.shared.lock();
        let inner = &mut *guard;
        let mut frame = frame;

        if inner.phase == Phase::Connected && drain_buffer(inner) {
            if let Some(tx) = &inner.outbound {
                match tx.try_send(frame) {
                    Ok(()) => return,
                    Err(e) => frame = e.into_inner(),
                }
            }
        }

        inner.metrics.frame_buffered();
        inner.buffer.add(frame);
    }

    /// Stop for good: cancel any pending retry, close the socket cleanly,
    /// and drop buffered frames and dedup state
    pub async fn disconnect(&self) {
        let socket_task = {
            let mut inner = self.shared.lock();
            if inner.phase == Phase::Closed {
                return;
            }
            self.shared.apply(&mut inner, Event::DisconnectRequested);
            inner.socket_task.take()
        };
        log::info!(
            "StreamConnection[{}]: disconnected",
            self.shared.config.source_label
        );

        if let Some(task) = socket_task {
            if tokio::time::timeout(CLOSE_TIMEOUT, task).await.is_err() {
                log::warn!(
                    "StreamConnection[{}]: socket did not close within {:?}",
                    self.shared.config.source_label,
                    CLOSE_TIMEOUT
                );
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().phase.public()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Frames currently parked in the ring buffer
    pub fn buffered_frames(&self) -> usize {
        self.shared.lock().buffer.len()
    }

    pub fn stats(&self) -> ConnectionStats {
        let inner = self.shared.lock();
        inner
            .metrics
            .snapshot(inner.buffer.dropped(), inner.dedup.suppressed())
    }

    /// Recent errors, newest first
    pub fn recent_errors(&self) -> Vec<ErrorRecord> {
        self.shared.lock().metrics.errors()
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        // Ensure timers and the socket task don't outlive the handle
        let mut inner = self.shared.lock();
        if inner.phase != Phase::Closed {
            self.shared.apply(&mut inner, Event::DisconnectRequested);
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: ConnectionEvent) {
        // Owner dropped the receiver; nothing left to tell
        let _ = self.events.send(event);
    }

    /// Run `event` through the reducer and execute the resulting effects.
    /// Returns the generation of a newly started attempt, which the caller
    /// must drive with `run_attempt()`.
    fn apply(self: &Arc<Self>, inner: &mut Inner, event: Event) -> Option<u64> {
        let before = inner.phase.public();
        let (next, effects) = reduce(&inner.phase, event, &self.policy);
        inner.phase = next;

        let after = inner.phase.public();
        if before != after {
            log::info!(
                "StreamConnection[{}]: {} -> {}",
                self.config.source_label,
                before,
                after
            );
            self.emit(ConnectionEvent::StateChanged(after));
        }

        let mut attempt = None;
        for effect in effects {
            match effect {
                Effect::StartAttempt => {
                    inner.generation += 1;
                    inner.metrics.attempt_started();
                    attempt = Some(inner.generation);
                }
                Effect::ScheduleRetry { attempt: retry } => self.schedule_retry(inner, retry),
                Effect::CancelRetry => {
                    if let Some(timer) = inner.retry_timer.take() {
                        timer.abort();
                        log::debug!(
                            "StreamConnection[{}]: pending retry cancelled",
                            self.config.source_label
                        );
                    }
                }
                Effect::CloseSocket => {
                    inner.outbound = None;
                    if let Some(cancel) = inner.socket_cancel.take() {
                        cancel.cancel();
                    }
                }
                Effect::FlushBuffer => {
                    let pending = inner.buffer.len();
                    if drain_buffer(inner) && pending > 0 {
                        log::info!(
                            "StreamConnection[{}]: flushed {} buffered frames",
                            self.config.source_label,
                            pending
                        );
                    }
                }
                Effect::ClearBuffers => {
                    inner.buffer.clear();
                    inner.dedup.reset();
                    inner.generation += 1;
                }
                Effect::NotifyConnected => {
                    inner.metrics.connected();
                    self.emit(ConnectionEvent::Connected);
                }
                Effect::ReportError { message, can_retry } => {
                    if can_retry {
                        log::warn!(
                            "StreamConnection[{}]: {} (will retry)",
                            self.config.source_label,
                            message
                        );
                    } else {
                        log::error!("StreamConnection[{}]: {}", self.config.source_label, message);
                    }
                    inner.metrics.record_error(&message, can_retry);
                    self.emit(ConnectionEvent::Error { message, can_retry });
                }
            }
        }
        attempt
    }

    fn schedule_retry(self: &Arc<Self>, inner: &mut Inner, attempt: u32) {
        let delay = self.policy.delay(attempt);
        inner.metrics.retry_scheduled();
        log::info!(
            "StreamConnection[{}]: retrying in {:?} (attempt {}/{})",
            self.config.source_label,
            delay,
            attempt + 1,
            self.policy.max_attempts
        );

        let shared = Arc::clone(self);
        let generation = inner.generation;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let attempt = {
                let mut inner = shared.lock();
                if inner.generation != generation {
                    return;
                }
                // Running now; disconnect() must not abort the attempt mid-flight
                inner.retry_timer = None;
                shared.apply(&mut inner, Event::RetryFired)
            };
            if let Some(generation) = attempt {
                run_attempt(shared, generation).await;
            }
        });

        if let Some(previous) = inner.retry_timer.replace(timer) {
            previous.abort();
        }
    }

    /// Breaker check, token fetch and socket open for one attempt
    async fn open_socket(
        &self,
        breaker: Option<(Arc<CircuitBreakerRegistry>, String)>,
    ) -> Result<Box<dyn Socket>, StreamingError> {
        if let Some((registry, service_id)) = &breaker {
            if !registry.allow_request(service_id).await {
                return Err(StreamingError::CircuitOpen(service_id.clone()));
            }
        }

        let result = match self.connector.fetch_token().await {
            Ok(token) => self.connector.open(&token).await,
            Err(e) => Err(e),
        };

        if let Some((registry, service_id)) = &breaker {
            match &result {
                Ok(_) => registry.record_success(service_id).await,
                Err(_) => registry.record_failure(service_id).await,
            }
        }
        result
    }

    fn start_socket(self: &Arc<Self>, inner: &mut Inner, generation: u64, socket: Box<dyn Socket>) {
        let (tx, rx) = mpsc::channel(self.config.buffer_capacity.max(1) + OUTBOUND_HEADROOM);
        let cancel = CancellationToken::new();
        inner.outbound = Some(tx);
        inner.socket_cancel = Some(cancel.clone());
        inner.socket_task = Some(tokio::spawn(pump_socket(
            Arc::clone(self),
            generation,
            socket,
            rx,
            cancel,
        )));
    }

    /// Handle one inbound text frame; returns an event if the socket must end
    fn handle_message(&self, generation: u64, text: &str) -> Option<Event> {
        let message = match ServerMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                log::warn!(
                    "StreamConnection[{}]: failed to parse message: {}",
                    self.config.source_label,
                    e
                );
                return None;
            }
        };

        if let Some((text, is_final)) = message.transcript() {
            self.forward_transcript(generation, text, is_final);
            return None;
        }

        match message {
            ServerMessage::SessionStarted { session_id } => {
                log::debug!(
                    "StreamConnection[{}]: session {:?}",
                    self.config.source_label,
                    session_id
                );
                None
            }
            ServerMessage::Error { error } => Some(Event::SocketFailed {
                message: format!("Server error: {}", error),
                fatal: false,
            }),
            ServerMessage::AuthError { error } => Some(Event::SocketFailed {
                message: StreamingError::AuthenticationFailed(error).to_string(),
                fatal: true,
            }),
            ServerMessage::PartialTranscript { .. }
            | ServerMessage::CommittedTranscript { .. }
            | ServerMessage::Unknown => {
                log::debug!(
                    "StreamConnection[{}]: ignoring unknown message type",
                    self.config.source_label
                );
                None
            }
        }
    }

    fn forward_transcript(&self, generation: u64, text: &str, is_final: bool) {
        if text.trim().is_empty() {
            return;
        }

        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        if is_final && !inner.dedup.admit(text, tokio::time::Instant::now()) {
            return;
        }
        inner.metrics.transcript_emitted();

        let timestamp = chrono::Utc::now().timestamp_millis();
        let source_label = self.config.source_label.clone();
        let segment = if is_final {
            TranscriptSegment::final_text(text, timestamp, source_label)
        } else {
            TranscriptSegment::partial(text, timestamp, source_label)
        };
        self.emit(ConnectionEvent::Transcript(segment));
    }
}

/// Move buffered frames onto the live socket queue, oldest first.
/// Returns false if offline or the queue could not take all of them.
fn drain_buffer(inner: &mut Inner) -> bool {
    let Inner {
        outbound, buffer, ..
    } = inner;
    let Some(tx) = outbound.as_ref() else {
        return false;
    };

    let mut frames = buffer.flush().into_iter();
    while let Some(frame) = frames.next() {
        if let Err(e) = tx.try_send(frame) {
            // Put back what didn't fit, order preserved
            buffer.add(e.into_inner());
            for frame in frames {
                buffer.add(frame);
            }
            return false;
        }
    }
    true
}

/// Drive one connection attempt to completion
///
/// Boxed because a failed attempt arms a timer whose task runs the next one.
fn run_attempt(shared: Arc<Shared>, generation: u64) -> BoxFuture<'static, ()> {
    async move {
        let breaker = shared.lock().breaker.clone();
        let outcome = shared.open_socket(breaker).await;

        let stale_socket = {
            let mut inner = shared.lock();
            let current = inner.generation == generation
                && matches!(inner.phase, Phase::Connecting { .. });

            match outcome {
                Ok(socket) if current => {
                    shared.start_socket(&mut inner, generation, socket);
                    shared.apply(&mut inner, Event::AttemptSucceeded);
                    None
                }
                Err(e) if current => {
                    shared.apply(
                        &mut inner,
                        Event::AttemptFailed {
                            message: e.to_string(),
                            fatal: e.is_fatal(),
                        },
                    );
                    None
                }
                Ok(socket) => Some(socket),
                Err(_) => None,
            }
        };

        if let Some(mut socket) = stale_socket {
            log::debug!(
                "StreamConnection[{}]: closing socket from superseded attempt",
                shared.config.source_label
            );
            socket.close().await;
        }
    }
    .boxed()
}

fn encode_frame(config: &ConnectionConfig, frame: &AudioFrame) -> Option<String> {
    let message = ClientMessage::audio_chunk(frame.as_bytes(), config.sample_rate);
    match serde_json::to_string(&message) {
        Ok(json) => Some(json),
        Err(e) => {
            log::warn!(
                "StreamConnection[{}]: failed to encode frame: {}",
                config.source_label,
                e
            );
            None
        }
    }
}

/// Own the live socket: send queued frames, forward inbound messages, and
/// report how the socket ended
async fn pump_socket(
    shared: Arc<Shared>,
    generation: u64,
    mut socket: Box<dyn Socket>,
    mut outbound: mpsc::Receiver<AudioFrame>,
    cancel: CancellationToken,
) {
    let ended = loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                socket.close().await;
                return;
            }

            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    socket.close().await;
                    return;
                };
                let Some(json) = encode_frame(&shared.config, &frame) else {
                    continue;
                };
                if let Err(e) = socket.send(json).await {
                    break Event::SocketFailed {
                        message: e.to_string(),
                        fatal: e.is_fatal(),
                    };
                }
                shared.lock().metrics.frames_sent(1);
            }

            event = socket.recv() => match event {
                SocketEvent::Text(text) => {
                    if let Some(end) = shared.handle_message(generation, &text) {
                        break end;
                    }
                }
                SocketEvent::Closed { clean, reason } => {
                    break Event::SocketClosed { clean, message: reason };
                }
                SocketEvent::Failed(e) => {
                    break Event::SocketFailed {
                        message: e.to_string(),
                        fatal: e.is_fatal(),
                    };
                }
            },
        }
    };

    socket.close().await;

    let mut inner = shared.lock();
    if inner.generation == generation {
        inner.socket_task = None;
        inner.socket_cancel = None;
        inner.outbound = None;
        shared.apply(&mut inner, ended);
    }
}
