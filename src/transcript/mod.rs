//! Durable transcript storage
//!
//! [`DurableSegmentLog`] collects segments from all sources in timestamp
//! order and persists them with debounced writes. [`SessionRecovery`] pairs
//! it with a durable "session active" flag so a host that was killed
//! mid-session comes back with its transcript intact.

mod segment_log;
mod segment;
mod session;

pub use segment_log::{DurableSegmentLog, SegmentLogConfig, SEGMENTS_KEY};
pub use segment::TranscriptSegment;
pub use session::{SessionMarker, SessionRecovery, StartupOutcome, SESSION_ACTIVE_KEY};
