//! Session orchestration
//!
//! A [`TranscriptionSession`] owns one [`StreamConnection`] per audio source
//! and one shared [`DurableSegmentLog`]. Transcript events from every source
//! are pumped into the log and re-published to the host, tagged with their
//! source. Startup decides between recovering an interrupted session and
//! starting fresh; `stop()` is the graceful path that clears the flag.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::circuit::CircuitBreakerRegistry;
use crate::config::ResilienceConfig;
use crate::scheduler::{drive_alarms, TokioScheduler};
use crate::storage::{DurableStore, FileStore};
use crate::streaming::{
    AudioFrame, ConnectionConfig, ConnectionEvent, ConnectionEvents, ConnectionState, Connector,
    StreamConnection,
};
use crate::transcript::{DurableSegmentLog, SessionRecovery, StartupOutcome};

/// How long `stop()` waits for a source's event pump to drain
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A connection event tagged with the source it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEvent {
    pub source_label: String,
    pub event: ConnectionEvent,
}

pub type SessionEvents = mpsc::UnboundedReceiver<SourceEvent>;

struct Source {
    connection: StreamConnection,
    pump: JoinHandle<()>,
}

/// Create the breaker registry for `config`, restore persisted breaker state
/// and start delivering recovery alarms
///
/// Call once at process start.
pub async fn start_circuit_breakers(
    config: &ResilienceConfig,
    store: Arc<dyn DurableStore>,
) -> (Arc<CircuitBreakerRegistry>, JoinHandle<()>) {
    let (scheduler, alarms) = TokioScheduler::new();
    let registry = Arc::new(CircuitBreakerRegistry::new(store, scheduler));

    for breaker in &config.circuit_breakers {
        registry.register(breaker.clone()).await;
    }
    registry.rehydrate().await;

    let driver = tokio::spawn(drive_alarms(Arc::clone(&registry), alarms));
    (registry, driver)
}

pub struct TranscriptionSession {
    config: ResilienceConfig,
    connector: Arc<dyn Connector>,
    registry: Option<Arc<CircuitBreakerRegistry>>,
    recovery: SessionRecovery,
    sources: HashMap<String, Source>,
    session_id: Option<Uuid>,
    events: mpsc::UnboundedSender<SourceEvent>,
}

impl TranscriptionSession {
    pub fn new(
        config: ResilienceConfig,
        store: Arc<dyn DurableStore>,
        connector: Arc<dyn Connector>,
    ) -> (Self, SessionEvents) {
        let log = DurableSegmentLog::new(Arc::clone(&store), config.segment_log.clone());
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                connector,
                registry: None,
                recovery: SessionRecovery::new(store, log),
                sources: HashMap::new(),
                session_id: None,
                events,
            },
            rx,
        )
    }

    /// Session persisted to a [`FileStore`] under `config.state_dir`
    pub fn open(config: ResilienceConfig, connector: Arc<dyn Connector>) -> (Self, SessionEvents) {
        let store: Arc<dyn DurableStore> = Arc::new(FileStore::from_config(&config));
        Self::new(config, store, connector)
    }

    /// Guard connection attempts with `config.stt_breaker_id` in `registry`
    pub fn with_circuit_breakers(mut self, registry: Arc<CircuitBreakerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Recover an interrupted session if the active flag was left set,
    /// otherwise begin a fresh one
    pub async fn start(&mut self) -> StartupOutcome {
        let outcome = self.recovery.recover_on_startup().await;
        let session_id = match &outcome {
            StartupOutcome::Recovered { session_id, .. } => {
                let id = session_id.unwrap_or_else(Uuid::new_v4);
                self.recovery.resume_session(id).await;
                id
            }
            StartupOutcome::Fresh => self.recovery.begin_session().await,
        };
        self.session_id = Some(session_id);
        outcome
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    pub fn log(&self) -> &DurableSegmentLog {
        self.recovery.log()
    }

    /// Open a connection for `source_label` and start pumping its events.
    /// A label that is already active is left alone.
    pub async fn add_source(&mut self, source_label: &str) {
        if self.sources.contains_key(source_label) {
            log::warn!("Session: source {} already active", source_label);
            return;
        }

        let config = ConnectionConfig {
            source_label: source_label.to_string(),
            ..self.config.connection.clone()
        };
        let (mut connection, events) = StreamConnection::new(
            config,
            self.config.reconnect.clone(),
            Arc::clone(&self.connector),
        );
        if let (Some(registry), Some(service_id)) = (&self.registry, &self.config.stt_breaker_id) {
            connection = connection.with_circuit_breaker(Arc::clone(registry), service_id.clone());
        }

        let pump = tokio::spawn(pump_events(
            source_label.to_string(),
            events,
            self.recovery.log().clone(),
            self.events.clone(),
        ));

        connection.connect().await;
        log::info!(
            "Session: source {} added ({})",
            source_label,
            connection.state()
        );
        self.sources
            .insert(source_label.to_string(), Source { connection, pump });
    }

    /// Push one frame for `source_label`; false if the source is unknown
    pub fn send_audio(&self, source_label: &str, frame: AudioFrame) -> bool {
        match self.sources.get(source_label) {
            Some(source) => {
                source.connection.send_audio(frame);
                true
            }
            None => false,
        }
    }

    pub fn source_state(&self, source_label: &str) -> Option<ConnectionState> {
        self.sources
            .get(source_label)
            .map(|source| source.connection.state())
    }

    pub fn connection(&self, source_label: &str) -> Option<&StreamConnection> {
        self.sources
            .get(source_label)
            .map(|source| &source.connection)
    }

    pub fn sources(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.sources.keys().cloned().collect();
        labels.sort();
        labels
    }

    /// Disconnect one source; its transcripts stay in the log
    pub async fn remove_source(&mut self, source_label: &str) {
        if let Some(source) = self.sources.remove(source_label) {
            close_source(source_label, source).await;
        }
    }

    /// Graceful stop: disconnect every source, write the log through and
    /// clear the session-active flag
    pub async fn stop(&mut self) {
        for (label, source) in self.sources.drain() {
            close_source(&label, source).await;
        }
        self.recovery.end_session().await;
        self.session_id = None;
    }
}

async fn close_source(source_label: &str, source: Source) {
    let Source { connection, pump } = source;
    connection.disconnect().await;
    // Last handle gone; the pump ends once background tasks release theirs
    drop(connection);

    let abort = pump.abort_handle();
    if tokio::time::timeout(PUMP_DRAIN_TIMEOUT, pump).await.is_err() {
        log::warn!("Session: event pump for {} did not drain in time", source_label);
        abort.abort();
    }
}

/// Forward one connection's events to the log and the host
async fn pump_events(
    source_label: String,
    mut events: ConnectionEvents,
    log: DurableSegmentLog,
    out: mpsc::UnboundedSender<SourceEvent>,
) {
    while let Some(event) = events.recv().await {
        if let ConnectionEvent::Transcript(segment) = &event {
            log.add(segment.clone());
        }
        let _ = out.send(SourceEvent {
            source_label: source_label.clone(),
            event,
        });
    }
    log::debug!("Session: event pump for {} exiting", source_label);
}
