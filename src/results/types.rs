use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-frame classification scores returned by the inference backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub session_id: String,

    /// Sequence number of the frame this result answers
    pub sequence: u64,

    /// Ordered class scores (logits)
    pub values: Vec<f32>,

    /// When the result arrived
    pub received_at: DateTime<Utc>,
}

impl ClassificationResult {
    /// Index of the highest score; NaN scores never win.
    pub fn argmax(&self) -> Option<usize> {
        self.values
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_nan())
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(i, _)| i)
    }

    pub fn top_score(&self) -> Option<f32> {
        self.argmax().map(|i| self.values[i])
    }
}
