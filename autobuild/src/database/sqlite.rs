//! SQLite implementation of `Store` and `StoreTx`.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{Sqlite, Transaction};
use tracing::{debug, error};
use uuid::Uuid;

use super::records::*;
use super::rows::*;
use super::{Database, Store, StoreTx};
use crate::constants::provisioners::STALE_INTERVAL_SECONDS;

/// Candidate pre-filter. Over-selects on purpose: every row is re-checked
/// under the workspace lock. Timestamps are compared through julianday since
/// they are stored as RFC 3339 text.
const ELIGIBLE_FOR_TRANSITION: &str = r#"
    SELECT w.id
    FROM workspaces w
    JOIN workspace_builds b ON b.workspace_id = w.id
        AND b.build_number = (
            SELECT MAX(build_number) FROM workspace_builds WHERE workspace_id = w.id
        )
    JOIN provisioner_jobs j ON j.id = b.job_id
    JOIN templates t ON t.id = w.template_id
    JOIN users u ON u.id = w.owner_id
    WHERE w.deleted = 0 AND (
        (b.transition = 'start' AND u.status = 'suspended')
        OR (
            b.transition = 'start'
            AND b.deadline IS NOT NULL
            AND julianday(b.deadline) <= julianday(?1)
        )
        OR (
            b.transition = 'stop'
            AND w.autostart_schedule IS NOT NULL
            AND w.autostart_schedule != ''
            AND (w.next_start_at IS NULL OR julianday(w.next_start_at) <= julianday(?1))
        )
        OR (b.transition = 'start' AND j.status = 'failed' AND t.failure_ttl_ms > 0)
        OR (
            w.dormant_at IS NULL
            AND t.time_til_dormant_ms > 0
            AND (julianday(?1) - julianday(w.last_used_at)) * 86400000.0
                >= t.time_til_dormant_ms - 1000
        )
        OR (
            w.dormant_at IS NOT NULL
            AND w.deleting_at IS NOT NULL
            AND t.time_til_dormant_autodelete_ms > 0
            AND julianday(w.deleting_at) <= julianday(?1)
        )
    )
"#;

#[async_trait]
impl Store for Database {
    async fn get_workspaces_eligible_for_transition(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Workspace>> {
        let query = format!(
            "SELECT {} FROM workspaces WHERE id IN ({}) ORDER BY created_at",
            WORKSPACE_COLUMNS, ELIGIBLE_FOR_TRANSITION
        );
        let rows = match sqlx::query(&query).bind(now).fetch_all(&self.pool).await {
            Ok(rows) => rows,
            Err(e) => {
                error!("Failed to query workspaces eligible for transition: {}", e);
                return Err(e.into());
            }
        };

        let workspaces = rows
            .iter()
            .map(workspace_from_row)
            .collect::<Result<Vec<_>>>()?;
        debug!("{} workspaces possibly eligible at {}", workspaces.len(), now);
        Ok(workspaces)
    }

    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteTx { tx }))
    }
}

pub struct SqliteTx {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl StoreTx for SqliteTx {
    async fn get_workspace_by_id(&mut self, id: Uuid) -> Result<Workspace> {
        let query = format!("SELECT {} FROM workspaces WHERE id = ?", WORKSPACE_COLUMNS);
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or_else(|| anyhow!("workspace {} not found", id))?;
        workspace_from_row(&row)
    }

    async fn get_workspaces_by_template_id(&mut self, template_id: Uuid) -> Result<Vec<Workspace>> {
        let query = format!(
            "SELECT {} FROM workspaces WHERE template_id = ? AND deleted = 0",
            WORKSPACE_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(template_id)
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter().map(workspace_from_row).collect()
    }

    async fn update_workspace_next_start_at(
        &mut self,
        id: Uuid,
        next_start_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query("UPDATE workspaces SET next_start_at = ? WHERE id = ?")
            .bind(next_start_at)
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn update_workspace_dormant_deleting_at(
        &mut self,
        id: Uuid,
        dormant_at: Option<DateTime<Utc>>,
    ) -> Result<Workspace> {
        let mut workspace = self.get_workspace_by_id(id).await?;
        let template = self.get_template_by_id(workspace.template_id).await?;
        let deleting_at = deleting_at_for(dormant_at, &template);

        sqlx::query("UPDATE workspaces SET dormant_at = ?, deleting_at = ? WHERE id = ?")
            .bind(dormant_at)
            .bind(deleting_at)
            .bind(id)
            .execute(&mut *self.tx)
            .await?;

        workspace.dormant_at = dormant_at;
        workspace.deleting_at = deleting_at;
        Ok(workspace)
    }

    async fn get_user_by_id(&mut self, id: Uuid) -> Result<User> {
        let query = format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS);
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or_else(|| anyhow!("user {} not found", id))?;
        user_from_row(&row)
    }

    async fn update_user_quiet_hours_schedule(&mut self, id: Uuid, schedule: &str) -> Result<User> {
        let result = sqlx::query("UPDATE users SET quiet_hours_schedule = ? WHERE id = ?")
            .bind(schedule)
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("user {} not found", id));
        }
        self.get_user_by_id(id).await
    }

    async fn get_template_by_id(&mut self, id: Uuid) -> Result<Template> {
        let query = format!("SELECT {} FROM templates WHERE id = ?", TEMPLATE_COLUMNS);
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or_else(|| anyhow!("template {} not found", id))?;
        template_from_row(&row)
    }

    async fn update_template_schedule(&mut self, template: &Template) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE templates SET
                require_active_version = ?, allow_user_autostart = ?, allow_user_autostop = ?,
                default_ttl_ms = ?, activity_bump_ms = ?, failure_ttl_ms = ?,
                time_til_dormant_ms = ?, time_til_dormant_autodelete_ms = ?,
                autostop_requirement_days_of_week = ?, autostop_requirement_weeks = ?,
                autostart_allowed_days = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(template.require_active_version)
        .bind(template.allow_user_autostart)
        .bind(template.allow_user_autostop)
        .bind(template.default_ttl_ms)
        .bind(template.activity_bump_ms)
        .bind(template.failure_ttl_ms)
        .bind(template.time_til_dormant_ms)
        .bind(template.time_til_dormant_autodelete_ms)
        .bind(i64::from(template.autostop_requirement_days_of_week))
        .bind(template.autostop_requirement_weeks)
        .bind(i64::from(template.autostart_allowed_days))
        .bind(template.updated_at)
        .bind(template.id)
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("template {} not found", template.id));
        }
        Ok(())
    }

    async fn get_template_version_by_id(&mut self, id: Uuid) -> Result<TemplateVersion> {
        let query = format!(
            "SELECT {} FROM template_versions WHERE id = ?",
            TEMPLATE_VERSION_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or_else(|| anyhow!("template version {} not found", id))?;
        template_version_from_row(&row)
    }

    async fn get_latest_workspace_build_by_workspace_id(
        &mut self,
        workspace_id: Uuid,
    ) -> Result<WorkspaceBuild> {
        let query = format!(
            "SELECT {} FROM workspace_builds WHERE workspace_id = ? ORDER BY build_number DESC LIMIT 1",
            BUILD_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(workspace_id)
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or_else(|| anyhow!("workspace {} has no builds", workspace_id))?;
        build_from_row(&row)
    }

    async fn insert_workspace_build(&mut self, build: &WorkspaceBuild) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workspace_builds (
                id, workspace_id, build_number, transition, reason, template_version_id,
                job_id, initiator_id, created_at, deadline, max_deadline, parameters
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(build.id)
        .bind(build.workspace_id)
        .bind(build.build_number)
        .bind(build.transition.as_str())
        .bind(build.reason.as_str())
        .bind(build.template_version_id)
        .bind(build.job_id)
        .bind(build.initiator_id)
        .bind(build.created_at)
        .bind(build.deadline)
        .bind(build.max_deadline)
        .bind(serde_json::to_string(&build.parameters)?)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn update_workspace_build_deadline(
        &mut self,
        id: Uuid,
        deadline: Option<DateTime<Utc>>,
        max_deadline: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query("UPDATE workspace_builds SET deadline = ?, max_deadline = ? WHERE id = ?")
            .bind(deadline)
            .bind(max_deadline)
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn get_provisioner_job_by_id(&mut self, id: Uuid) -> Result<ProvisionerJob> {
        let query = format!("SELECT {} FROM provisioner_jobs WHERE id = ?", JOB_COLUMNS);
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or_else(|| anyhow!("provisioner job {} not found", id))?;
        job_from_row(&row)
    }

    async fn insert_provisioner_job(&mut self, job: &ProvisionerJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO provisioner_jobs (id, status, initiator_id, created_at, completed_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.id)
        .bind(job.status.as_str())
        .bind(job.initiator_id)
        .bind(job.created_at)
        .bind(job.completed_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn has_available_provisioner(&mut self, at: DateTime<Utc>) -> Result<bool> {
        let cutoff = at - Duration::seconds(STALE_INTERVAL_SECONDS);
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM provisioner_daemons WHERE julianday(last_seen_at) >= julianday(?)",
        )
        .bind(cutoff)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(count > 0)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

pub(super) fn deleting_at_for(
    dormant_at: Option<DateTime<Utc>>,
    template: &Template,
) -> Option<DateTime<Utc>> {
    dormant_at
        .filter(|_| template.time_til_dormant_autodelete_ms > 0)
        .map(|at| at + Duration::milliseconds(template.time_til_dormant_autodelete_ms))
}

// Seeding helpers used by embedders and integration tests.
impl Database {
    pub async fn insert_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (id, username, status, quiet_hours_schedule) VALUES (?, ?, ?, ?)",
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(user.status.as_str())
        .bind(&user.quiet_hours_schedule)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_template(&self, template: &Template) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO templates (
                id, name, active_version_id, require_active_version, allow_user_autostart,
                allow_user_autostop, default_ttl_ms, activity_bump_ms, failure_ttl_ms,
                time_til_dormant_ms, time_til_dormant_autodelete_ms,
                autostop_requirement_days_of_week, autostop_requirement_weeks,
                autostart_allowed_days, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(template.id)
        .bind(&template.name)
        .bind(template.active_version_id)
        .bind(template.require_active_version)
        .bind(template.allow_user_autostart)
        .bind(template.allow_user_autostop)
        .bind(template.default_ttl_ms)
        .bind(template.activity_bump_ms)
        .bind(template.failure_ttl_ms)
        .bind(template.time_til_dormant_ms)
        .bind(template.time_til_dormant_autodelete_ms)
        .bind(i64::from(template.autostop_requirement_days_of_week))
        .bind(template.autostop_requirement_weeks)
        .bind(i64::from(template.autostart_allowed_days))
        .bind(template.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_template_version(&self, version: &TemplateVersion) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO template_versions (id, template_id, name, message, required_parameters)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(version.id)
        .bind(version.template_id)
        .bind(&version.name)
        .bind(&version.message)
        .bind(serde_json::to_string(&version.required_parameters)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_workspace(&self, workspace: &Workspace) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workspaces (
                id, owner_id, template_id, name, deleted, autostart_schedule, ttl_ms,
                automatic_updates, last_used_at, dormant_at, deleting_at, next_start_at, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(workspace.id)
        .bind(workspace.owner_id)
        .bind(workspace.template_id)
        .bind(&workspace.name)
        .bind(workspace.deleted)
        .bind(&workspace.autostart_schedule)
        .bind(workspace.ttl_ms)
        .bind(workspace.automatic_updates.as_str())
        .bind(workspace.last_used_at)
        .bind(workspace.dormant_at)
        .bind(workspace.deleting_at)
        .bind(workspace.next_start_at)
        .bind(workspace.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert a build together with its provisioner job.
    pub async fn insert_build_with_job(
        &self,
        build: &WorkspaceBuild,
        job: &ProvisionerJob,
    ) -> Result<()> {
        let mut tx = self.begin().await?;
        tx.insert_provisioner_job(job).await?;
        tx.insert_workspace_build(build).await?;
        tx.commit().await
    }

    pub async fn upsert_provisioner_daemon(
        &self,
        id: Uuid,
        name: &str,
        last_seen_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO provisioner_daemons (id, name, last_seen_at) VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET name = excluded.name, last_seen_at = excluded.last_seen_at
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(last_seen_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All builds of a workspace, oldest first.
    pub async fn list_workspace_builds(&self, workspace_id: Uuid) -> Result<Vec<WorkspaceBuild>> {
        let query = format!(
            "SELECT {} FROM workspace_builds WHERE workspace_id = ? ORDER BY build_number",
            BUILD_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(workspace_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(build_from_row).collect()
    }
}
