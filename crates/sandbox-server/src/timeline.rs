use std::collections::VecDeque;

use chrono::Utc;
use sandbox_proto::CallRecord;
use tokio::sync::Mutex;

/// Oldest records are dropped past this many entries.
const MAX_RECORDS: usize = 100_000;

/// Start/end wall-clock time of every handled RPC, in arrival order of
/// completion. Share via `Arc<CallTimeline>`.
pub struct CallTimeline {
    records: Mutex<VecDeque<CallRecord>>,
    capacity: usize,
}

impl Default for CallTimeline {
    fn default() -> Self {
        Self::with_capacity(MAX_RECORDS)
    }
}

impl CallTimeline {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    pub async fn record(&self, function: &str, start: f64, end: f64) {
        let mut records = self.records.lock().await;
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(CallRecord {
            function: function.to_string(),
            start,
            end,
        });
    }

    pub async fn snapshot(&self) -> Vec<CallRecord> {
        self.records.lock().await.iter().cloned().collect()
    }
}

/// Current time as fractional Unix seconds.
pub fn unix_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
