use serde::{Deserialize, Serialize};

/// One unit of recognized text
///
/// Partial segments are interim and get superseded by a later partial or the
/// final for the same utterance; final segments are terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub text: String,
    pub is_final: bool,
    /// Wall-clock epoch milliseconds at which the segment arrived
    pub timestamp: i64,
    /// Audio source this segment came from (e.g. "microphone", "system")
    pub source_label: String,
}

impl TranscriptSegment {
    pub fn partial(
        text: impl Into<String>,
        timestamp: i64,
        source_label: impl Into<String>,
    ) -> Self {
        Self {
            text: text.into(),
            is_final: false,
            timestamp,
            source_label: source_label.into(),
        }
    }

    pub fn final_text(
        text: impl Into<String>,
        timestamp: i64,
        source_label: impl Into<String>,
    ) -> Self {
        Self {
            text: text.into(),
            is_final: true,
            timestamp,
            source_label: source_label.into(),
        }
    }
}
