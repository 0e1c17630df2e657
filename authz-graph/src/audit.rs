// Audit records for graph mutations
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

pub const AUDIT_EVENT_TYPE: &str = "authz";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditAction {
    CreateObjectType,
    UpdateObjectType,
    DeleteObjectType,
    CreateEdgeType,
    UpdateEdgeType,
    DeleteEdgeType,
    CreateObject,
    UpdateObject,
    DeleteObject,
    CreateEdge,
    UpdateEdge,
    DeleteEdge,
    DeleteEdgesOnObject,
    CreateOrganization,
    UpdateOrganization,
    MigrateObject,
    MigrateEdgeType,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::CreateObjectType => "CreateObjectType",
            AuditAction::UpdateObjectType => "UpdateObjectType",
            AuditAction::DeleteObjectType => "DeleteObjectType",
            AuditAction::CreateEdgeType => "CreateEdgeType",
            AuditAction::UpdateEdgeType => "UpdateEdgeType",
            AuditAction::DeleteEdgeType => "DeleteEdgeType",
            AuditAction::CreateObject => "CreateObject",
            AuditAction::UpdateObject => "UpdateObject",
            AuditAction::DeleteObject => "DeleteObject",
            AuditAction::CreateEdge => "CreateEdge",
            AuditAction::UpdateEdge => "UpdateEdge",
            AuditAction::DeleteEdge => "DeleteEdge",
            AuditAction::DeleteEdgesOnObject => "DeleteEdgesOnObject",
            AuditAction::CreateOrganization => "CreateOrganization",
            AuditAction::UpdateOrganization => "UpdateOrganization",
            AuditAction::MigrateObject => "MigrateObject",
            AuditAction::MigrateEdgeType => "MigrateEdgeType",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub subject: String,
    pub action: String,
    pub data: serde_json::Value,
}

impl AuditEntry {
    pub fn new(action: AuditAction, subject: &str, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type: AUDIT_EVENT_TYPE.to_string(),
            subject: subject.to_string(),
            action: action.as_str().to_string(),
            data,
        }
    }
}

/// Receives audit records. Records never gate a request: the service logs
/// a failed `record` and carries on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> Result<()>;
}

/// Writes each record as a structured `info` event on the `audit` target
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, entry: AuditEntry) -> Result<()> {
        info!(
            target: "audit",
            id = %entry.id,
            subject = %entry.subject,
            action = %entry.action,
            data = %entry.data,
            "{}",
            entry.event_type
        );
        Ok(())
    }
}

/// Keeps records in memory, for tests and the admin CLI
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }

    pub fn actions(&self) -> Vec<String> {
        self.entries.lock().iter().map(|e| e.action.clone()).collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, entry: AuditEntry) -> Result<()> {
        self.entries.lock().push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_sink_keeps_order() {
        let sink = MemoryAuditSink::new();
        sink.record(AuditEntry::new(AuditAction::CreateObject, "alice", json!({"ID": 1})))
            .await
            .unwrap();
        sink.record(AuditEntry::new(AuditAction::DeleteObject, "alice", json!({"ID": 1})))
            .await
            .unwrap();

        assert_eq!(sink.actions(), vec!["CreateObject", "DeleteObject"]);
        assert!(sink.entries().iter().all(|e| e.event_type == AUDIT_EVENT_TYPE));
    }
}
