//! Session-active flag and crash recovery
//!
//! A durable flag is set when a session starts and removed on graceful stop.
//! Finding it still set at startup means the host died mid-session, so the
//! durable log is reloaded instead of discarded. The flag and the log
//! snapshot are both written eagerly; recovery never depends on an in-memory
//! timer having fired.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::segment_log::DurableSegmentLog;
use crate::storage::{set_json, DurableStore};

/// Durable key of the session-active flag
pub const SESSION_ACTIVE_KEY: &str = "transcript_session_active";

/// Value stored under [`SESSION_ACTIVE_KEY`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMarker {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
}

/// What `recover_on_startup()` found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupOutcome {
    /// Previous session ended abnormally; its log was reloaded
    Recovered {
        /// `None` if the flag was set but its marker was unreadable
        session_id: Option<Uuid>,
        segments: usize,
    },
    /// No interrupted session; the log starts empty
    Fresh,
}

pub struct SessionRecovery {
    store: Arc<dyn DurableStore>,
    log: DurableSegmentLog,
}

impl SessionRecovery {
    pub fn new(store: Arc<dyn DurableStore>, log: DurableSegmentLog) -> Self {
        Self { store, log }
    }

    pub fn log(&self) -> &DurableSegmentLog {
        &self.log
    }

    /// Decide at process start whether to rehydrate the transcript log
    pub async fn recover_on_startup(&self) -> StartupOutcome {
        let raw = match self.store.get(SESSION_ACTIVE_KEY).await {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("Session: could not read active flag, starting fresh: {}", e);
                None
            }
        };

        let Some(raw) = raw else {
            log::info!("Session: no interrupted session, starting fresh");
            return StartupOutcome::Fresh;
        };

        let session_id = match serde_json::from_str::<SessionMarker>(&raw) {
            Ok(marker) => Some(marker.session_id),
            Err(e) => {
                log::warn!("Session: active flag unreadable ({}), recovering anyway", e);
                None
            }
        };

        let segments = self.log.load().await;
        log::info!(
            "Session: recovered interrupted session {:?} with {} segments",
            session_id,
            segments
        );
        StartupOutcome::Recovered {
            session_id,
            segments,
        }
    }

    /// Start a fresh session: empty the log and set the active flag
    pub async fn begin_session(&self) -> Uuid {
        self.log.clear().await;

        let marker = SessionMarker {
            session_id: Uuid::new_v4(),
            started_at: Utc::now(),
        };
        if let Err(e) = set_json(self.store.as_ref(), SESSION_ACTIVE_KEY, &marker).await {
            log::warn!("Session: failed to set active flag: {}", e);
        }
        log::info!("Session: started {}", marker.session_id);
        marker.session_id
    }

    /// Mark the current session (fresh or recovered) active again without clearing the log
    pub async fn resume_session(&self, session_id: Uuid) {
        let marker = SessionMarker {
            session_id,
            started_at: Utc::now(),
        };
        if let Err(e) = set_json(self.store.as_ref(), SESSION_ACTIVE_KEY, &marker).await {
            log::warn!("Session: failed to set active flag: {}", e);
        }
    }

    /// Graceful stop: write the log through, then clear the active flag
    pub async fn end_session(&self) {
        self.log.flush().await;
        if let Err(e) = self.store.remove(SESSION_ACTIVE_KEY).await {
            log::warn!("Session: failed to clear active flag: {}", e);
        }
        log::info!("Session: ended ({} segments)", self.log.len());
    }

    pub async fn is_active(&self) -> bool {
        matches!(self.store.get(SESSION_ACTIVE_KEY).await, Ok(Some(_)))
    }
}
