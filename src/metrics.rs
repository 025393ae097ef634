//! Per-connection diagnostics
//!
//! Counts attempts, frames and transcripts for one streaming connection and
//! keeps a short error history. Owned by the connection, behind its lock.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Maximum number of errors to retain in history
const MAX_ERROR_HISTORY: usize = 20;

/// Record of an error reported by a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Epoch milliseconds when the error was reported
    pub timestamp: i64,
    /// Human-readable error message
    pub message: String,
    /// Whether the connection was going to retry
    pub can_retry: bool,
}

/// Point-in-time view of a connection's counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub source_label: String,
    /// Connection attempts started (initial and automatic)
    pub attempts: u64,
    /// Successful connects
    pub connects: u64,
    /// Backoff timers armed
    pub retries_scheduled: u64,
    /// Frames handed to a live socket
    pub frames_sent: u64,
    /// Frames parked in the ring buffer while offline
    pub frames_buffered: u64,
    /// Frames evicted from the ring buffer
    pub frames_dropped: u64,
    /// Transcript events forwarded to the consumer
    pub transcripts: u64,
    /// Duplicate finals suppressed
    pub finals_suppressed: u64,
    /// Most recent error, if any
    pub last_error: Option<ErrorRecord>,
}

/// Collects counters and error history for one connection
#[derive(Debug)]
pub struct ConnectionMetrics {
    stats: ConnectionStats,
    /// History of errors (newest first)
    errors: VecDeque<ErrorRecord>,
}

impl ConnectionMetrics {
    pub fn new(source_label: impl Into<String>) -> Self {
        Self {
            stats: ConnectionStats {
                source_label: source_label.into(),
                ..Default::default()
            },
            errors: VecDeque::with_capacity(MAX_ERROR_HISTORY),
        }
    }

    pub fn attempt_started(&mut self) {
        self.stats.attempts += 1;
        log::debug!(
            "Metrics[{}]: attempt {} started",
            self.stats.source_label,
            self.stats.attempts
        );
    }

    pub fn connected(&mut self) {
        self.stats.connects += 1;
    }

    pub fn retry_scheduled(&mut self) {
        self.stats.retries_scheduled += 1;
    }

    pub fn frames_sent(&mut self, count: u64) {
        let before = self.stats.frames_sent;
        self.stats.frames_sent += count;
        // Log every 50 frames to avoid spam
        if before / 50 != self.stats.frames_sent / 50 {
            log::debug!(
                "Metrics[{}]: {} frames sent",
                self.stats.source_label,
                self.stats.frames_sent
            );
        }
    }

    pub fn frame_buffered(&mut self) {
        self.stats.frames_buffered += 1;
    }

    pub fn transcript_emitted(&mut self) {
        self.stats.transcripts += 1;
    }

    /// Record an error reported to the consumer
    pub fn record_error(&mut self, message: &str, can_retry: bool) {
        let error = ErrorRecord {
            timestamp: chrono::Utc::now().timestamp_millis(),
            message: message.to_string(),
            can_retry,
        };

        // Add to front (newest first)
        self.errors.push_front(error);

        // Trim if over limit
        while self.errors.len() > MAX_ERROR_HISTORY {
            self.errors.pop_back();
        }
    }

    /// Recent errors, newest first
    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.errors.iter().cloned().collect()
    }

    /// Snapshot the counters; buffer and dedup counters live with their owners
    pub fn snapshot(&self, frames_dropped: u64, finals_suppressed: u64) -> ConnectionStats {
        ConnectionStats {
            frames_dropped,
            finals_suppressed,
            last_error: self.errors.front().cloned(),
            ..self.stats.clone()
        }
    }
}
