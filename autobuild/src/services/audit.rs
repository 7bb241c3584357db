//! Audit trail for changes autobuild makes outside of builds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::constants::executor::SYSTEM_INITIATOR_ID;
use crate::database::{BuildReason, Database, Workspace};

pub const ACTION_WORKSPACE_DORMANT: &str = "workspace.dormant";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub action: String,
    pub reason: BuildReason,
    pub initiator_id: Uuid,
    pub success: bool,
    pub old_state: Workspace,
    pub new_state: Workspace,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn workspace_dormant(
        old_state: Workspace,
        new_state: Workspace,
        success: bool,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workspace_id: new_state.id,
            action: ACTION_WORKSPACE_DORMANT.to_string(),
            reason: BuildReason::Dormancy,
            initiator_id: SYSTEM_INITIATOR_ID,
            success,
            old_state,
            new_state,
            created_at: at,
        }
    }
}

/// Records audit entries. Must not block the caller.
pub trait Auditor: Send + Sync {
    fn audit(&self, entry: AuditEntry);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditor;

impl Auditor for TracingAuditor {
    fn audit(&self, entry: AuditEntry) {
        info!(
            workspace_id = %entry.workspace_id,
            action = %entry.action,
            success = entry.success,
            "audit"
        );
    }
}

/// Persists entries to `audit_logs` on a background task.
#[derive(Clone)]
pub struct DatabaseAuditor {
    database: Arc<Database>,
}

impl DatabaseAuditor {
    pub fn new(database: Arc<Database>) -> Self {
        Self { database }
    }
}

impl Auditor for DatabaseAuditor {
    fn audit(&self, entry: AuditEntry) {
        let database = self.database.clone();
        tokio::spawn(async move {
            if let Err(e) = database.store_audit_log(&entry).await {
                error!("Failed to persist audit entry for {}: {}", entry.workspace_id, e);
            }
        });
    }
}
