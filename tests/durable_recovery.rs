//! Integration tests for restart survival
//!
//! A "restart" drops every in-memory object and rebuilds it on top of the
//! same durable store, the way a host process would after being killed.
//!
//! ```bash
//! cargo test --test durable_recovery
//! ```

mod common;

use common::ManualScheduler;
use resilient_stt::circuit::{
    recovery_alarm_name, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState,
};
use resilient_stt::storage::{DurableStore, FileStore, MemoryStore};
use resilient_stt::transcript::{
    DurableSegmentLog, SegmentLogConfig, SessionRecovery, StartupOutcome, TranscriptSegment,
};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn session(store: Arc<dyn DurableStore>) -> SessionRecovery {
    let log = DurableSegmentLog::new(Arc::clone(&store), SegmentLogConfig::default());
    SessionRecovery::new(store, log)
}

/// Two sources interleaving out of arrival order
fn interleaved() -> Vec<TranscriptSegment> {
    vec![
        TranscriptSegment::final_text("good morning", 1_000, "microphone"),
        TranscriptSegment::final_text("hello from the call", 3_000, "system"),
        TranscriptSegment::final_text("can you hear me", 2_000, "microphone"),
        TranscriptSegment::partial("and the agen", 4_000, "system"),
    ]
}

// ============================================================================
// Transcript log
// ============================================================================

#[tokio::test(start_paused = true)]
async fn interrupted_session_recovers_identical_log() {
    let store = Arc::new(MemoryStore::new());

    let before = {
        let first = session(store.clone());
        assert_eq!(first.recover_on_startup().await, StartupOutcome::Fresh);
        first.begin_session().await;
        for segment in interleaved() {
            first.log().add(segment);
        }
        // Debounced write lands; the process then dies without end_session()
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!first.log().is_dirty());
        first.log().segments()
    };

    let timestamps: Vec<i64> = before.iter().map(|s| s.timestamp).collect();
    assert_eq!(timestamps, vec![1_000, 2_000, 3_000, 4_000]);

    let second = session(store);
    match second.recover_on_startup().await {
        StartupOutcome::Recovered {
            session_id,
            segments,
        } => {
            assert!(session_id.is_some());
            assert_eq!(segments, 4);
        }
        StartupOutcome::Fresh => panic!("Expected recovery"),
    }
    assert_eq!(second.log().segments(), before);
}

#[tokio::test(start_paused = true)]
async fn graceful_stop_starts_next_run_empty() {
    let store = Arc::new(MemoryStore::new());

    {
        let first = session(store.clone());
        first.begin_session().await;
        for segment in interleaved() {
            first.log().add(segment);
        }
        first.end_session().await;
    }

    let second = session(store);
    assert_eq!(second.recover_on_startup().await, StartupOutcome::Fresh);
    assert!(second.log().is_empty());
}

#[tokio::test(start_paused = true)]
async fn debounce_coalesces_writes() {
    let store = Arc::new(MemoryStore::new());
    let log = DurableSegmentLog::new(store.clone(), SegmentLogConfig { debounce_ms: 2000 });

    for i in 0..5 {
        log.add(TranscriptSegment::final_text(format!("line {}", i), i, "mic"));
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    // Each add() pushed the deadline back; nothing written yet
    assert!(log.is_dirty());
    assert!(store.get("transcript_segments").await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(1600)).await;
    assert!(!log.is_dirty());
    assert!(store.get("transcript_segments").await.unwrap().is_some());
}

#[tokio::test]
async fn file_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let store: Arc<dyn DurableStore> = Arc::new(FileStore::new(dir.path()));
        let first = session(store);
        first.begin_session().await;
        first
            .log()
            .add(TranscriptSegment::final_text("persisted", 10, "microphone"));
        first.log().flush().await;
    }

    let store: Arc<dyn DurableStore> = Arc::new(FileStore::new(dir.path()));
    let second = session(store);
    assert!(matches!(
        second.recover_on_startup().await,
        StartupOutcome::Recovered { segments: 1, .. }
    ));
    assert_eq!(second.log().final_text(), "persisted");
}

// ============================================================================
// Circuit breaker
// ============================================================================

fn stt_config() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        service_id: "stt".to_string(),
        failure_threshold: 3,
        recovery_timeout_ms: 30_000,
        half_open_success_threshold: 1,
    }
}

async fn registry(
    store: Arc<MemoryStore>,
    scheduler: Arc<ManualScheduler>,
    now: Arc<AtomicI64>,
) -> CircuitBreakerRegistry {
    let registry = CircuitBreakerRegistry::new(store, scheduler)
        .with_clock(move || now.load(Ordering::SeqCst));
    registry.register(stt_config()).await;
    registry
        .register(CircuitBreakerConfig::new("text_generation"))
        .await;
    registry
}

#[tokio::test]
async fn breaker_walks_only_legal_edges() {
    let store = Arc::new(MemoryStore::new());
    let scheduler = Arc::new(ManualScheduler::default());
    let now = Arc::new(AtomicI64::new(1_000));
    let registry = registry(store, scheduler.clone(), now.clone()).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    registry.on_state_change(move |change| {
        sink.lock().unwrap().push((change.from, change.to));
    });

    for _ in 0..3 {
        assert!(registry.allow_request("stt").await);
        registry.record_failure("stt").await;
    }
    assert_eq!(registry.state("stt").await, Some(CircuitState::Open));
    assert!(!registry.allow_request("stt").await);
    assert_eq!(
        scheduler.armed(&recovery_alarm_name("stt")),
        Some(Duration::from_millis(30_000))
    );

    // Recovery alarm → HALF_OPEN; a failed trial re-opens and re-arms
    now.store(31_000, Ordering::SeqCst);
    registry.handle_alarm(&recovery_alarm_name("stt")).await;
    assert_eq!(registry.state("stt").await, Some(CircuitState::HalfOpen));
    assert!(registry.allow_request("stt").await);
    registry.record_failure("stt").await;
    assert_eq!(registry.state("stt").await, Some(CircuitState::Open));
    assert!(scheduler.armed(&recovery_alarm_name("stt")).is_some());

    // Second window: a successful trial closes
    now.store(61_000, Ordering::SeqCst);
    registry.handle_alarm(&recovery_alarm_name("stt")).await;
    assert!(registry.allow_request("stt").await);
    registry.record_success("stt").await;
    assert_eq!(registry.state("stt").await, Some(CircuitState::Closed));

    use CircuitState::*;
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            (Closed, Open),
            (Open, HalfOpen),
            (HalfOpen, Open),
            (Open, HalfOpen),
            (HalfOpen, Closed),
        ]
    );

    // The other dependency was never touched
    assert_eq!(
        registry.state("text_generation").await,
        Some(CircuitState::Closed)
    );
}

#[tokio::test]
async fn open_window_survives_restart_and_alarm_is_rearmed() {
    let store = Arc::new(MemoryStore::new());
    let now = Arc::new(AtomicI64::new(1_000));

    {
        let scheduler = Arc::new(ManualScheduler::default());
        let first = registry(store.clone(), scheduler, now.clone()).await;
        for _ in 0..3 {
            first.record_failure("stt").await;
        }
        assert_eq!(first.state("stt").await, Some(CircuitState::Open));
    }

    // Restart 10s into the 30s window
    now.store(11_000, Ordering::SeqCst);
    let scheduler = Arc::new(ManualScheduler::default());
    let second = registry(store, scheduler.clone(), now.clone()).await;
    second.rehydrate().await;

    assert_eq!(second.state("stt").await, Some(CircuitState::Open));
    assert!(!second.allow_request("stt").await);
    assert_eq!(
        scheduler.armed(&recovery_alarm_name("stt")),
        Some(Duration::from_millis(20_000))
    );

    second.handle_alarm(&recovery_alarm_name("stt")).await;
    assert_eq!(second.state("stt").await, Some(CircuitState::HalfOpen));
}

#[tokio::test]
async fn overdue_recovery_fires_immediately_on_rehydrate() {
    let store = Arc::new(MemoryStore::new());
    let now = Arc::new(AtomicI64::new(1_000));

    {
        let scheduler = Arc::new(ManualScheduler::default());
        let first = registry(store.clone(), scheduler, now.clone()).await;
        for _ in 0..3 {
            first.record_failure("stt").await;
        }
    }

    // Host was down longer than the recovery timeout
    now.store(120_000, Ordering::SeqCst);
    let scheduler = Arc::new(ManualScheduler::default());
    let second = registry(store, scheduler.clone(), now).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    second.on_state_change(move |change| {
        sink.lock().unwrap().push((change.service_id.clone(), change.to));
    });
    second.rehydrate().await;

    assert_eq!(second.state("stt").await, Some(CircuitState::HalfOpen));
    assert_eq!(scheduler.armed_count(), 0);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![("stt".to_string(), CircuitState::HalfOpen)]
    );
}
