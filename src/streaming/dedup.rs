//! Final-transcript deduplication
//!
//! The backend may emit more than one final-style event for the same
//! utterance. A final whose text matches the previous final and arrives
//! within the window is suppressed. Partials are never filtered.
//!
//! Scope is one connection, i.e. one audio source: identical text from two
//! different sources is not deduplicated.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct FinalDedup {
    window: Duration,
    /// Last admitted final and when it arrived
    last: Option<(String, Instant)>,
    suppressed: u64,
}

impl FinalDedup {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: None,
            suppressed: 0,
        }
    }

    /// Returns true if this final should be forwarded
    pub fn admit(&mut self, text: &str, now: Instant) -> bool {
        if let Some((last_text, at)) = &self.last {
            if last_text == text && now.saturating_duration_since(*at) < self.window {
                self.suppressed += 1;
                log::trace!(
                    "FinalDedup: suppressed duplicate final ({} chars, {} total)",
                    text.len(),
                    self.suppressed
                );
                return false;
            }
        }
        self.last = Some((text.to_string(), now));
        true
    }

    /// Number of finals suppressed since creation or last reset
    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }

    pub fn reset(&mut self) {
        self.last = None;
        self.suppressed = 0;
    }
}
