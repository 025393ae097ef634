//! Integration tests for TranscriptionSession
//!
//! ```bash
//! cargo test --test session_pipeline
//! ```

mod common;

use common::MockConnector;
use resilient_stt::config::{ResilienceConfig, STT_SERVICE_ID};
use resilient_stt::pipeline::{start_circuit_breakers, SessionEvents, TranscriptionSession};
use resilient_stt::storage::MemoryStore;
use resilient_stt::streaming::{AudioFrame, ConnectionEvent, ConnectionState};
use resilient_stt::{CircuitState, StartupOutcome};
use std::sync::Arc;
use std::time::Duration;

fn transcripts(events: &mut SessionEvents) -> Vec<(String, String)> {
    std::iter::from_fn(|| events.try_recv().ok())
        .filter_map(|e| match e.event {
            ConnectionEvent::Transcript(segment) if segment.is_final => {
                Some((e.source_label, segment.text))
            }
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn two_sources_share_one_log() {
    let store = Arc::new(MemoryStore::new());
    let connector = MockConnector::new();
    let (mut session, mut events) =
        TranscriptionSession::new(ResilienceConfig::default(), store, connector.clone());

    assert_eq!(session.start().await, StartupOutcome::Fresh);
    assert!(session.session_id().is_some());

    session.add_source("microphone").await;
    session.add_source("system").await;
    assert_eq!(session.sources(), vec!["microphone", "system"]);
    assert_eq!(session.source_state("system"), Some(ConnectionState::Connected));

    connector.server(0).committed("hi there");
    tokio::time::sleep(Duration::from_millis(5)).await;
    connector.server(1).committed("welcome to the call");
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(session.send_audio("microphone", AudioFrame::new(vec![1, 2])));
    assert!(!session.send_audio("camera", AudioFrame::new(vec![1, 2])));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(connector.server(0).audio(), vec![vec![1, 2]]);

    let mut forwarded = transcripts(&mut events);
    forwarded.sort();
    assert_eq!(
        forwarded,
        vec![
            ("microphone".to_string(), "hi there".to_string()),
            ("system".to_string(), "welcome to the call".to_string()),
        ]
    );

    let logged: Vec<_> = session
        .log()
        .segments()
        .into_iter()
        .map(|s| s.source_label)
        .collect();
    assert_eq!(logged.len(), 2);
    assert!(logged.contains(&"microphone".to_string()));
    assert!(logged.contains(&"system".to_string()));

    session.stop().await;
    assert!(session.sources().is_empty());
    assert!(session.session_id().is_none());
}

#[tokio::test(start_paused = true)]
async fn removed_source_keeps_its_transcripts() {
    let store = Arc::new(MemoryStore::new());
    let connector = MockConnector::new();
    let (mut session, _events) =
        TranscriptionSession::new(ResilienceConfig::default(), store, connector.clone());

    session.start().await;
    session.add_source("microphone").await;
    connector.server(0).committed("keep me");
    tokio::time::sleep(Duration::from_millis(10)).await;

    session.remove_source("microphone").await;
    assert_eq!(session.source_state("microphone"), None);
    assert_eq!(session.log().final_text(), "keep me");
}

#[tokio::test(start_paused = true)]
async fn crash_without_stop_is_recovered_next_run() {
    let store = Arc::new(MemoryStore::new());

    let first_id = {
        let connector = MockConnector::new();
        let (mut session, _events) = TranscriptionSession::new(
            ResilienceConfig::default(),
            store.clone(),
            connector.clone(),
        );
        session.start().await;
        session.add_source("microphone").await;
        connector.server(0).committed("before the crash");
        // Past the debounce window so the log reaches the store
        tokio::time::sleep(Duration::from_secs(3)).await;
        session.session_id()
        // Dropped here without stop()
    };

    let (mut session, _events) =
        TranscriptionSession::new(ResilienceConfig::default(), store.clone(), MockConnector::new());
    assert_eq!(
        session.start().await,
        StartupOutcome::Recovered {
            session_id: first_id,
            segments: 1,
        }
    );
    assert_eq!(session.session_id(), first_id);
    assert_eq!(session.log().final_text(), "before the crash");

    // A graceful stop this time: the run after starts fresh
    session.stop().await;
    let (mut next, _events) =
        TranscriptionSession::new(ResilienceConfig::default(), store, MockConnector::new());
    assert_eq!(next.start().await, StartupOutcome::Fresh);
    assert!(next.log().is_empty());
}

#[tokio::test(start_paused = true)]
async fn breakers_from_config_guard_every_source() {
    let store = Arc::new(MemoryStore::new());
    let mut config = ResilienceConfig::default();
    config.circuit_breakers[0].failure_threshold = 1;

    let (registry, driver) = start_circuit_breakers(&config, store.clone()).await;
    assert_eq!(
        registry.state(STT_SERVICE_ID).await,
        Some(CircuitState::Closed)
    );

    let connector = MockConnector::always_failing(
        resilient_stt::StreamingError::ConnectionFailed("refused".to_string()),
    );
    let (session, _events) = TranscriptionSession::new(config, store, connector.clone());
    let mut session = session.with_circuit_breakers(registry.clone());
    session.start().await;
    session.add_source("microphone").await;
    session.add_source("system").await;

    // The first failure opens the shared breaker; the second source fails fast
    assert_eq!(connector.opens(), 1);
    assert_eq!(
        registry.state(STT_SERVICE_ID).await,
        Some(CircuitState::Open)
    );

    session.stop().await;
    driver.abort();
}

#[tokio::test]
async fn file_backed_session_uses_configured_state_dir() {
    let dir = tempfile::tempdir().unwrap();
    let config = ResilienceConfig {
        state_dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    };

    {
        let connector = MockConnector::new();
        let (mut session, _events) = TranscriptionSession::open(config.clone(), connector.clone());
        session.start().await;
        session.add_source("microphone").await;
        connector.server(0).committed("on disk");
        tokio::time::sleep(Duration::from_millis(10)).await;
        session.log().flush().await;
    }
    assert!(dir.path().join("transcript_segments.json").exists());

    let (mut session, _events) = TranscriptionSession::open(config, MockConnector::new());
    assert!(matches!(
        session.start().await,
        StartupOutcome::Recovered { segments: 1, .. }
    ));
    assert_eq!(session.log().final_text(), "on disk");
}
