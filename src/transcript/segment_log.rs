//! Ordered, durably persisted transcript log
//!
//! Segments from every source are kept in ascending timestamp order. Each
//! `add()` marks the log dirty and (re)arms a single debounce timer; when it
//! expires the whole log is written to the durable store as one JSON value.
//! `flush()` writes through immediately and is what a graceful stop calls.
//!
//! Durable writes never block `add()` and their failures are only logged:
//! the in-memory log keeps serving reads either way.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::segment::TranscriptSegment;
use crate::storage::DurableStore;

/// Durable key holding the serialized segment list
pub const SEGMENTS_KEY: &str = "transcript_segments";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentLogConfig {
    /// Quiet period after the last `add()` before the log is written
    pub debounce_ms: u64,
}

impl Default for SegmentLogConfig {
    fn default() -> Self {
        Self { debounce_ms: 2000 }
    }
}

#[derive(Default)]
struct LogState {
    segments: Vec<TranscriptSegment>,
    dirty: bool,
    /// Bumped on every in-memory change; a write only clears `dirty` if no
    /// change raced it
    revision: u64,
    pending: Option<JoinHandle<()>>,
}

struct LogShared {
    store: Arc<dyn DurableStore>,
    debounce: Duration,
    state: StdMutex<LogState>,
    /// Serializes durable writes: at most one in flight
    write_lock: tokio::sync::Mutex<()>,
}

impl LogShared {
    fn state(&self) -> MutexGuard<'_, LogState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn flush(&self) {
        let _write = self.write_lock.lock().await;

        let (json, revision) = {
            let state = self.state();
            if !state.dirty {
                return;
            }
            match serde_json::to_string(&state.segments) {
                Ok(json) => (json, state.revision),
                Err(e) => {
                    log::warn!("SegmentLog: failed to serialize segments: {}", e);
                    return;
                }
            }
        };

        match self.store.set(SEGMENTS_KEY, &json).await {
            Ok(()) => {
                let mut state = self.state();
                if state.revision == revision {
                    state.dirty = false;
                }
                log::debug!("SegmentLog: persisted {} bytes", json.len());
            }
            Err(e) => {
                log::warn!("SegmentLog: durable write failed, keeping in memory: {}", e);
            }
        }
    }
}

/// Cloneable handle to the process-wide transcript log
#[derive(Clone)]
pub struct DurableSegmentLog {
    shared: Arc<LogShared>,
}

impl DurableSegmentLog {
    pub fn new(store: Arc<dyn DurableStore>, config: SegmentLogConfig) -> Self {
        Self {
            shared: Arc::new(LogShared {
                store,
                debounce: Duration::from_millis(config.debounce_ms),
                state: StdMutex::new(LogState::default()),
                write_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Insert a segment in timestamp order and schedule a debounced write
    ///
    /// The segment supersedes the latest segment from the same source if that
    /// one is still partial. Must be called from within a tokio runtime for
    /// the debounced write to be scheduled; outside one, only `flush()` persists.
    pub fn add(&self, segment: TranscriptSegment) {
        let mut state = self.shared.state();

        if let Some(idx) = state
            .segments
            .iter()
            .rposition(|s| s.source_label == segment.source_label)
        {
            if !state.segments[idx].is_final {
                state.segments.remove(idx);
            }
        }

        let at = state
            .segments
            .partition_point(|s| s.timestamp <= segment.timestamp);
        state.segments.insert(at, segment);
        state.dirty = true;
        state.revision += 1;

        self.schedule_write(&mut state);
    }

    fn schedule_write(&self, state: &mut LogState) {
        if let Some(pending) = state.pending.take() {
            pending.abort();
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                log::warn!("SegmentLog: no async runtime, debounced write not scheduled");
                return;
            }
        };

        let shared = Arc::downgrade(&self.shared);
        let debounce = self.shared.debounce;
        state.pending = Some(runtime.spawn(async move {
            tokio::time::sleep(debounce).await;
            let Some(shared) = shared.upgrade() else {
                return;
            };
            // Detach before writing so a concurrent add() re-arms instead of
            // aborting an in-flight write
            shared.state().pending = None;
            shared.flush().await;
        }));
    }

    /// Write the log through to the durable store now (no-op if clean)
    pub async fn flush(&self) {
        if let Some(pending) = self.shared.state().pending.take() {
            pending.abort();
        }
        self.shared.flush().await;
    }

    /// Empty the log and remove its durable entry
    pub async fn clear(&self) {
        let _write = self.shared.write_lock.lock().await;
        {
            let mut state = self.shared.state();
            if let Some(pending) = state.pending.take() {
                pending.abort();
            }
            state.segments.clear();
            state.dirty = false;
            state.revision += 1;
        }

        if let Err(e) = self.shared.store.remove(SEGMENTS_KEY).await {
            log::warn!("SegmentLog: failed to remove durable log: {}", e);
        }
    }

    /// Replace the in-memory log with the durable copy
    ///
    /// Returns the number of segments recovered. A missing or unreadable
    /// durable entry leaves the log empty.
    pub async fn load(&self) -> usize {
        let _write = self.shared.write_lock.lock().await;

        let loaded: Vec<TranscriptSegment> = match self.shared.store.get(SEGMENTS_KEY).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(segments) => segments,
                Err(e) => {
                    log::warn!("SegmentLog: durable log is corrupt, starting empty: {}", e);
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                log::warn!("SegmentLog: failed to read durable log: {}", e);
                Vec::new()
            }
        };

        let mut state = self.shared.state();
        if let Some(pending) = state.pending.take() {
            pending.abort();
        }
        state.segments = loaded;
        state.segments.sort_by_key(|s| s.timestamp);
        state.dirty = false;
        state.revision += 1;

        log::info!("SegmentLog: loaded {} segments", state.segments.len());
        state.segments.len()
    }

    /// Copy of all segments, in timestamp order
    pub fn segments(&self) -> Vec<TranscriptSegment> {
        self.shared.state().segments.clone()
    }

    /// Final segments joined by newlines
    pub fn final_text(&self) -> String {
        self.shared
            .state()
            .segments
            .iter()
            .filter(|s| s.is_final)
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn len(&self) -> usize {
        self.shared.state().segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.state().segments.is_empty()
    }

    /// True if the in-memory log has changes not yet written
    pub fn is_dirty(&self) -> bool {
        self.shared.state().dirty
    }
}
