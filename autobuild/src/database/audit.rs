//! Audit log persistence.

use anyhow::Result;
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use super::Database;
use crate::services::audit::AuditEntry;

impl Database {
    pub async fn store_audit_log(&self, entry: &AuditEntry) -> Result<()> {
        debug!("Storing audit log {} for workspace {}", entry.id, entry.workspace_id);

        match sqlx::query(
            r#"
            INSERT INTO audit_logs (
                id, workspace_id, action, reason, initiator_id, success,
                old_state, new_state, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.id)
        .bind(entry.workspace_id)
        .bind(&entry.action)
        .bind(entry.reason.as_str())
        .bind(entry.initiator_id)
        .bind(entry.success)
        .bind(serde_json::to_string(&entry.old_state)?)
        .bind(serde_json::to_string(&entry.new_state)?)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::error!("Failed to store audit log {}: {}", entry.id, e);
                Err(e.into())
            }
        }
    }

    /// Actions recorded for a workspace, newest first.
    pub async fn get_audit_actions(&self, workspace_id: Uuid) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT action FROM audit_logs WHERE workspace_id = ? ORDER BY created_at DESC",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get("action").map_err(Into::into))
            .collect()
    }
}
