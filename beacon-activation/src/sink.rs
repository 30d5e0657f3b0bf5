use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use beacon_core::logging::AUDIT_TARGET;

use crate::audit::AuditRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditSeverity {
    Info,
    Warn,
}

/// Structured record handed to the external telemetry exporter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub severity: AuditSeverity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub attributes: BTreeMap<String, String>,
}

impl From<&AuditRecord> for AuditEvent {
    fn from(record: &AuditRecord) -> Self {
        let old_enabled = record.old_enabled();
        let new_enabled = record.new_enabled();
        let switched_off = new_enabled != Some(true) && old_enabled == Some(true);
        let severity = if switched_off || new_enabled.is_none() {
            AuditSeverity::Warn
        } else {
            AuditSeverity::Info
        };

        let mut attributes = BTreeMap::new();
        attributes.insert("audit.id".into(), record.id.to_string());
        attributes.insert("operation".into(), record.operation.as_str().into());
        attributes.insert("object_pattern".into(), record.object_pattern.clone());
        attributes.insert("telemetry_kind".into(), record.telemetry_kind.as_str().into());
        attributes.insert("tenant_id".into(), record.tenant_id.clone());
        attributes.insert("actor".into(), record.actor.clone());
        if let Some(enabled) = old_enabled {
            attributes.insert("old_enabled".into(), enabled.to_string());
        }
        if let Some(enabled) = new_enabled {
            attributes.insert("new_enabled".into(), enabled.to_string());
        }
        if let Some(session_id) = &record.session.session_id {
            attributes.insert("session_id".into(), session_id.clone());
        }
        if let Some(client) = &record.session.client {
            attributes.insert("client".into(), client.clone());
        }

        let message = format!(
            "activation {} {} {} for tenant {} by {}",
            record.operation.as_str().to_ascii_lowercase(),
            record.telemetry_kind,
            record.object_pattern,
            record.tenant_id,
            record.actor
        );

        Self {
            severity,
            message,
            timestamp: record.changed_at,
            attributes,
        }
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("audit channel is full")]
    Full,
    #[error("audit channel is closed")]
    Closed,
    #[error("audit sink rejected event: {0}")]
    Rejected(String),
}

/// Destination for audit events.
///
/// Events reach the sink directly, never through the activation engine, so
/// rule changes stay observable while all other telemetry is switched off.
pub trait AuditSink: Send + Sync {
    fn emit(&self, event: &AuditEvent) -> Result<(), SinkError>;
}

/// Writes audit events to the `beacon::audit` tracing target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: &AuditEvent) -> Result<(), SinkError> {
        let attributes = serde_json::to_string(&event.attributes)
            .map_err(|err| SinkError::Rejected(err.to_string()))?;
        match event.severity {
            AuditSeverity::Info => {
                info!(target: AUDIT_TARGET, timestamp = %event.timestamp, %attributes, "{}", event.message)
            }
            AuditSeverity::Warn => {
                warn!(target: AUDIT_TARGET, timestamp = %event.timestamp, %attributes, "{}", event.message)
            }
        }
        Ok(())
    }
}

/// Hands events to an exporter task over a bounded channel.
///
/// Delivery is at most once: a full or closed channel drops the event.
#[derive(Debug, Clone)]
pub struct ChannelAuditSink {
    sender: mpsc::Sender<AuditEvent>,
}

impl ChannelAuditSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AuditEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

impl AuditSink for ChannelAuditSink {
    fn emit(&self, event: &AuditEvent) -> Result<(), SinkError> {
        self.sender.try_send(event.clone()).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

/// Forwards every event to each inner sink; one failing sink does not stop the others.
#[derive(Default, Clone)]
pub struct FanoutAuditSink {
    sinks: Vec<std::sync::Arc<dyn AuditSink>>,
}

impl FanoutAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: std::sync::Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl AuditSink for FanoutAuditSink {
    fn emit(&self, event: &AuditEvent) -> Result<(), SinkError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(err) = sink.emit(event) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::audit::AuditOperation;
    use crate::testing::audit_record;

    #[test]
    fn disabling_is_reported_as_warning() {
        let record = audit_record(AuditOperation::Update, Some(true), Some(false));
        let event = AuditEvent::from(&record);
        assert_eq!(event.severity, AuditSeverity::Warn);
        assert_eq!(event.attributes["old_enabled"], "true");
        assert_eq!(event.attributes["new_enabled"], "false");
        assert_eq!(event.attributes["operation"], "UPDATE");
        assert_eq!(event.attributes["actor"], "alice");
    }

    #[test]
    fn inserts_are_informational() {
        let record = audit_record(AuditOperation::Insert, None, Some(true));
        let event = AuditEvent::from(&record);
        assert_eq!(event.severity, AuditSeverity::Info);
        assert!(!event.attributes.contains_key("old_enabled"));
        assert!(event.message.contains("insert"));
    }

    #[tokio::test]
    async fn channel_sink_drops_when_full() {
        let (sink, mut receiver) = ChannelAuditSink::new(1);
        let event = AuditEvent::from(&audit_record(AuditOperation::Insert, None, Some(true)));
        sink.emit(&event).expect("first event fits");
        assert!(matches!(sink.emit(&event), Err(SinkError::Full)));
        assert_eq!(receiver.recv().await, Some(event));
    }

    #[tokio::test]
    async fn fanout_reaches_every_sink_and_reports_first_failure() {
        let (healthy, mut receiver) = ChannelAuditSink::new(4);
        let (closed, closed_receiver) = ChannelAuditSink::new(4);
        drop(closed_receiver);
        let fanout = FanoutAuditSink::new()
            .with(std::sync::Arc::new(closed))
            .with(std::sync::Arc::new(healthy));

        let event = AuditEvent::from(&audit_record(AuditOperation::Delete, Some(false), None));
        assert!(matches!(fanout.emit(&event), Err(SinkError::Closed)));
        assert_eq!(receiver.recv().await, Some(event));
    }
}
