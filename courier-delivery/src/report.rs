//! Delivery outcome reporting.
//!
//! The engine pushes two streams outward: per-job status updates for
//! whoever owns the job, and account-level webhook events. Both go
//! through trait objects so embedders decide where they land; the
//! engine itself never blocks on a slow consumer.

use chrono::{DateTime, Utc};
use courier_common::EmailAddress;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::job::JobId;

/// Final state of a job. Exactly one of these is reported per job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    /// Accepted by the destination server.
    Sent,
    /// Permanently rejected.
    Bounced,
    /// Retries exhausted on transient failures.
    Failed,
    /// Never attempted: the recipient is suppressed.
    Suppressed,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusUpdate {
    pub job_id: JobId,
    pub status: TerminalStatus,
    pub timestamp: DateTime<Utc>,
    /// Classifier detail or error text for non-success outcomes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Opaque id correlating this delivery with engagement tracking.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracking_id: Option<String>,
}

/// Webhook event names follow the `email.<outcome>` convention.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookEvent {
    pub event_type: &'static str,
    pub account_id: String,
    pub job_id: JobId,
    pub recipient: EmailAddress,
    pub timestamp: DateTime<Utc>,
}

impl WebhookEvent {
    pub const SENT: &'static str = "email.sent";
    pub const BOUNCED: &'static str = "email.bounced";
    pub const COMPLAINT: &'static str = "email.complaint";
}

pub trait StatusSink: Send + Sync {
    fn record(&self, update: StatusUpdate);
}

pub trait WebhookSink: Send + Sync {
    fn emit(&self, event: WebhookEvent);
}

/// Logs everything it receives. The default sink for the standalone
/// binary, where no external consumer is wired up.
#[derive(Debug, Default)]
pub struct LogSink;

impl StatusSink for LogSink {
    fn record(&self, update: StatusUpdate) {
        info!(
            job_id = %update.job_id,
            status = ?update.status,
            detail = update.detail.as_deref().unwrap_or(""),
            "job finalized"
        );
    }
}

impl WebhookSink for LogSink {
    fn emit(&self, event: WebhookEvent) {
        info!(
            event = event.event_type,
            account = %event.account_id,
            recipient = %event.recipient,
            "webhook event"
        );
    }
}

/// Collects everything in memory. Used by tests and embedders that
/// poll rather than push.
#[derive(Debug, Default)]
pub struct MemorySink {
    updates: Mutex<Vec<StatusUpdate>>,
    events: Mutex<Vec<WebhookEvent>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn updates(&self) -> Vec<StatusUpdate> {
        self.updates.lock().clone()
    }

    #[must_use]
    pub fn events(&self) -> Vec<WebhookEvent> {
        self.events.lock().clone()
    }

    #[must_use]
    pub fn status_of(&self, job_id: JobId) -> Option<TerminalStatus> {
        self.updates
            .lock()
            .iter()
            .find(|u| u.job_id == job_id)
            .map(|u| u.status)
    }
}

impl StatusSink for MemorySink {
    fn record(&self, update: StatusUpdate) {
        self.updates.lock().push(update);
    }
}

impl WebhookSink for MemorySink {
    fn emit(&self, event: WebhookEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_collects_in_order() {
        let sink = MemorySink::new();
        let first = JobId::generate();
        let second = JobId::generate();

        sink.record(StatusUpdate {
            job_id: first,
            status: TerminalStatus::Sent,
            timestamp: Utc::now(),
            detail: None,
            tracking_id: Some("trk-1".into()),
        });
        sink.record(StatusUpdate {
            job_id: second,
            status: TerminalStatus::Bounced,
            timestamp: Utc::now(),
            detail: Some("user unknown".into()),
            tracking_id: None,
        });

        let updates = sink.updates();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].job_id, first);
        assert_eq!(sink.status_of(second), Some(TerminalStatus::Bounced));
    }

    #[test]
    fn status_updates_serialize_with_snake_case_labels() {
        let update = StatusUpdate {
            job_id: JobId::generate(),
            status: TerminalStatus::Suppressed,
            timestamp: Utc::now(),
            detail: None,
            tracking_id: None,
        };
        let json = serde_json::to_string(&update).unwrap();
        assert!(json.contains("\"suppressed\""));
        assert!(!json.contains("tracking_id"));
    }
}
