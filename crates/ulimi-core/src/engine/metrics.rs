//! Observability types attached to engine outputs.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Phase markers recorded per sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnginePhase {
    Queued,
    Scheduled,
    MigrationBegin,
    MigrationDone,
    Finished,
}

/// Timestamped phase marker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EngineEvent {
    pub phase: EnginePhase,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
}

impl EngineEvent {
    pub fn now(phase: EnginePhase) -> Self {
        Self { phase, timestamp: unix_timestamp() }
    }
}

pub fn unix_timestamp() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0)
}

/// Scheduler occupancy snapshot, taken once per response batch.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub num_waiting: usize,
    pub num_running: usize,
    pub num_locked: usize,
    pub free_gpu_blocks: usize,
    pub total_gpu_blocks: usize,
}

/// Metrics bundle attached to every inference output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsInfo {
    pub new_token_timestamp: f64,
    pub events: Vec<EngineEvent>,
    pub stats: SchedulerStats,
}

impl MetricsInfo {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_serialize() {
        let info = MetricsInfo {
            new_token_timestamp: 1.5,
            events: vec![EngineEvent::now(EnginePhase::Queued)],
            stats: SchedulerStats { num_running: 2, ..Default::default() },
        };
        let value = info.to_json();
        assert_eq!(value["stats"]["num_running"], 2);
    }
}
