//! Read-only queue statistics for the operational dashboard.
use serde::{Deserialize, Serialize};

/// A snapshot of the four partition sizes of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
    /// `completed / total * 100`, or `0` for an empty queue.
    pub success_rate: f64,
}

impl QueueStats {
    pub fn new(pending: u64, processing: u64, completed: u64, failed: u64) -> Self {
        let total = pending + processing + completed + failed;
        let success_rate = if total == 0 {
            0.0
        } else {
            completed as f64 / total as f64 * 100.0
        };
        Self {
            pending,
            processing,
            completed,
            failed,
            total,
            success_rate,
        }
    }
}

impl Default for QueueStats {
    fn default() -> Self {
        Self::new(0, 0, 0, 0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_queue_has_zero_success_rate() {
        let stats = QueueStats::default();

        assert_eq!(stats.total, 0);
        assert_eq!(stats.success_rate, 0.0);
    }

    #[test]
    fn success_rate_is_completed_over_all_partitions() {
        let stats = QueueStats::new(1, 1, 6, 2);

        assert_eq!(stats.total, 10);
        assert_eq!(stats.success_rate, 60.0);
    }

    #[test]
    fn serializes_for_the_dashboard() {
        let value = serde_json::to_value(QueueStats::new(0, 0, 1, 0)).unwrap();

        assert_eq!(
            value,
            serde_json::json!({
                "pending": 0,
                "processing": 0,
                "completed": 1,
                "failed": 0,
                "total": 1,
                "successRate": 100.0,
            })
        );
    }
}
