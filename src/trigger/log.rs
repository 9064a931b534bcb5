//! Append-only trigger log: one record per dispatch attempt.

use crate::trigger::TriggerType;
use crate::{InstanceId, ProviderId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOutcome {
    Success,
    Error,
    RateLimited,
    Deduped,
}

impl TriggerOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerOutcome::Success => "success",
            TriggerOutcome::Error => "error",
            TriggerOutcome::RateLimited => "rate_limited",
            TriggerOutcome::Deduped => "deduped",
        }
    }
}

impl std::fmt::Display for TriggerOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerLogRecord {
    pub instance_id: InstanceId,
    pub chat_id: String,
    pub trigger_type: TriggerType,
    pub provider_id: Option<ProviderId>,
    pub run_id: Option<String>,
    pub latency_ms: u64,
    pub outcome: TriggerOutcome,
    pub trace_id: String,
    /// Event ids that made up this trigger, in arrival order.
    pub event_ids: Vec<String>,
    pub error: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Fire-and-forget persistence of trigger outcomes.
///
/// `write` must not block the dispatch path. Sinks that persist remotely
/// should hand the record to a background task.
pub trait TriggerLogSink: Send + Sync + 'static {
    fn write(&self, record: TriggerLogRecord);
}

/// Emits every record as a structured `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTriggerLog;

impl TriggerLogSink for TracingTriggerLog {
    fn write(&self, record: TriggerLogRecord) {
        tracing::info!(
            target: "dispatchbot::trigger_log",
            instance_id = %record.instance_id,
            chat_id = %record.chat_id,
            trigger_type = %record.trigger_type,
            provider_id = record.provider_id.as_deref().unwrap_or("-"),
            run_id = record.run_id.as_deref().unwrap_or("-"),
            latency_ms = record.latency_ms,
            outcome = %record.outcome,
            trace_id = %record.trace_id,
            error = record.error.as_deref().unwrap_or(""),
            "trigger logged"
        );
    }
}

/// Keeps records in memory. Cloning shares the same buffer.
#[derive(Debug, Default, Clone)]
pub struct MemoryTriggerLog {
    records: Arc<Mutex<Vec<TriggerLogRecord>>>,
}

impl MemoryTriggerLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TriggerLogRecord> {
        self.records.lock().clone()
    }

    pub fn outcomes(&self) -> Vec<TriggerOutcome> {
        self.records.lock().iter().map(|record| record.outcome).collect()
    }
}

impl TriggerLogSink for MemoryTriggerLog {
    fn write(&self, record: TriggerLogRecord) {
        self.records.lock().push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_log_clones_share_records() {
        let log = MemoryTriggerLog::new();
        let writer = log.clone();
        writer.write(TriggerLogRecord {
            instance_id: "inst-1".into(),
            chat_id: "c1".into(),
            trigger_type: TriggerType::Dm,
            provider_id: Some("prov-1".into()),
            run_id: None,
            latency_ms: 12,
            outcome: TriggerOutcome::Success,
            trace_id: "trc_test".into(),
            event_ids: vec!["e1".into()],
            error: None,
            created_at: chrono::Utc::now(),
        });
        assert_eq!(log.outcomes(), vec![TriggerOutcome::Success]);
    }

    #[test]
    fn outcome_wire_names() {
        let encoded = serde_json::to_string(&TriggerOutcome::RateLimited).expect("serialize");
        assert_eq!(encoded, "\"rate_limited\"");
    }
}
