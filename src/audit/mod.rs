//! Audit trail: one event per consequential decision the reconciler makes
//! (a publish, a skip, a breaker trip), independent of the Prometheus
//! counters in `observability` which exist for alerting, not forensics.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub action: String,
    pub tenant: Option<String>,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    pub reason: String,
    pub success: bool,
    pub error: Option<String>,
    pub dry_run: bool,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(action: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            tenant: None,
            before: None,
            after: None,
            reason: reason.into(),
            success: true,
            error: None,
            dry_run: false,
            timestamp: Utc::now(),
        }
    }

    pub fn tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn before(mut self, value: serde_json::Value) -> Self {
        self.before = Some(value);
        self
    }

    pub fn after(mut self, value: serde_json::Value) -> Self {
        self.after = Some(value);
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }
}

pub trait AuditSink: Send + Sync {
    fn emit(&self, event: &AuditEvent) -> Result<()>;
}

/// Default sink: serialize the event as structured JSON at info level. A
/// future sink could ship these to an external audit log instead.
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn emit(&self, event: &AuditEvent) -> Result<()> {
        let json = serde_json::to_string(event)?;
        info!(target: "quotawarden::audit", "{json}");
        Ok(())
    }
}

pub type SharedAuditSink = Arc<dyn AuditSink>;

pub fn default_sink() -> SharedAuditSink {
    Arc::new(LogAuditSink)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CapturingSink {
        events: std::sync::Mutex<Vec<AuditEvent>>,
    }

    impl AuditSink for CapturingSink {
        fn emit(&self, event: &AuditEvent) -> Result<()> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    #[test]
    fn builder_sets_fields() {
        let event = AuditEvent::new("publish", "scheduled tick")
            .tenant("t1")
            .dry_run(true);
        assert_eq!(event.tenant.as_deref(), Some("t1"));
        assert!(event.dry_run);
        assert!(event.success);
    }

    #[test]
    fn before_after_builders_set_pre_post_values() {
        let event = AuditEvent::new("limit_computed", "tick")
            .before(serde_json::json!({"ingestion_rate": 100.0}))
            .after(serde_json::json!({"ingestion_rate": 200.0}));
        assert_eq!(event.before.unwrap()["ingestion_rate"], 100.0);
        assert_eq!(event.after.unwrap()["ingestion_rate"], 200.0);
    }

    #[test]
    fn failed_marks_event_unsuccessful_with_error() {
        let event = AuditEvent::new("publish", "cas retry").failed("conflict");
        assert!(!event.success);
        assert_eq!(event.error.as_deref(), Some("conflict"));
    }

    #[test]
    fn custom_sink_captures_emitted_events() {
        let sink = CapturingSink {
            events: std::sync::Mutex::new(Vec::new()),
        };
        sink.emit(&AuditEvent::new("reconcile", "tick")).unwrap();
        assert_eq!(sink.events.lock().unwrap().len(), 1);
    }
}
