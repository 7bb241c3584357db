//! Datastore layer for the autobuild scheduler.
//!
//! The executor talks to persistence through two narrow traits:
//! - `Store` - the candidate pre-filter and transaction entry point
//! - `StoreTx` - transactional reads and the few updates autobuild issues
//!
//! Two implementations ship with the crate:
//! - `Database` - SQLite via sqlx (`sqlite` submodule)
//! - `MemoryStore` - in-process, for tests and embedders (`memory` submodule)
//!
//! Submodules:
//! - `records` - All record types (entities)
//! - `rows` - Row to record mapping for SQLite
//! - `leases` - Lease rows backing cross-instance named locks
//! - `audit` - Audit log persistence

mod audit;
mod leases;
mod memory;
mod records;
mod rows;
mod sqlite;

pub use leases::LeaseLocks;
pub use memory::MemoryStore;
pub use records::*;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite, SqlitePool};
use std::path::Path;
use tracing::{error, info};
use uuid::Uuid;

/// Entry point into the datastore
#[async_trait]
pub trait Store: Send + Sync {
    /// Workspaces that may need a lifecycle transition at `now`.
    ///
    /// May over-select; every candidate is re-checked inside a transaction.
    async fn get_workspaces_eligible_for_transition(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Workspace>>;

    /// Open a transaction. Dropping it without `commit` rolls back.
    async fn begin(&self) -> Result<Box<dyn StoreTx>>;
}

/// Reads and writes scoped to one transaction
#[async_trait]
pub trait StoreTx: Send {
    async fn get_workspace_by_id(&mut self, id: Uuid) -> Result<Workspace>;

    async fn get_workspaces_by_template_id(&mut self, template_id: Uuid) -> Result<Vec<Workspace>>;

    async fn update_workspace_next_start_at(
        &mut self,
        id: Uuid,
        next_start_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Set or clear `dormant_at`, deriving `deleting_at` from the template's
    /// auto-delete TTL. Returns the updated workspace.
    async fn update_workspace_dormant_deleting_at(
        &mut self,
        id: Uuid,
        dormant_at: Option<DateTime<Utc>>,
    ) -> Result<Workspace>;

    async fn get_user_by_id(&mut self, id: Uuid) -> Result<User>;

    async fn update_user_quiet_hours_schedule(&mut self, id: Uuid, schedule: &str) -> Result<User>;

    async fn get_template_by_id(&mut self, id: Uuid) -> Result<Template>;

    /// Persist the schedule columns of `template`.
    async fn update_template_schedule(&mut self, template: &Template) -> Result<()>;

    async fn get_template_version_by_id(&mut self, id: Uuid) -> Result<TemplateVersion>;

    async fn get_latest_workspace_build_by_workspace_id(
        &mut self,
        workspace_id: Uuid,
    ) -> Result<WorkspaceBuild>;

    async fn insert_workspace_build(&mut self, build: &WorkspaceBuild) -> Result<()>;

    async fn update_workspace_build_deadline(
        &mut self,
        id: Uuid,
        deadline: Option<DateTime<Utc>>,
        max_deadline: Option<DateTime<Utc>>,
    ) -> Result<()>;

    async fn get_provisioner_job_by_id(&mut self, id: Uuid) -> Result<ProvisionerJob>;

    async fn insert_provisioner_job(&mut self, job: &ProvisionerJob) -> Result<()>;

    /// Whether any provisioner daemon checked in recently enough to take a job.
    async fn has_available_provisioner(&mut self, at: DateTime<Utc>) -> Result<bool>;

    async fn commit(self: Box<Self>) -> Result<()>;
}

pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Expose pool for integration test queries
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn new(database_path: &str) -> Result<Self> {
        info!("Opening database at {}", database_path);

        if let Some(parent) = Path::new(database_path).parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                error!("Failed to create parent directory {:?}: {}", parent, e);
                return Err(e.into());
            }
        }

        let database_url = format!("sqlite:{}?mode=rwc", database_path);
        let pool = match SqlitePool::connect(&database_url).await {
            Ok(pool) => pool,
            Err(e) => {
                error!("Failed to connect to database {}: {}", database_url, e);
                return Err(e.into());
            }
        };

        let database = Self { pool };
        database.initialize_tables().await?;

        info!("Database initialized");
        Ok(database)
    }

    async fn initialize_tables(&self) -> Result<()> {
        let statements: [(&str, &str); 12] = [
            (
                "users",
                r#"
                CREATE TABLE IF NOT EXISTS users (
                    id BLOB PRIMARY KEY,
                    username TEXT NOT NULL,
                    status TEXT NOT NULL,
                    quiet_hours_schedule TEXT NOT NULL DEFAULT ''
                )
                "#,
            ),
            (
                "templates",
                r#"
                CREATE TABLE IF NOT EXISTS templates (
                    id BLOB PRIMARY KEY,
                    name TEXT NOT NULL,
                    active_version_id BLOB NOT NULL,
                    require_active_version BOOLEAN NOT NULL DEFAULT 0,
                    allow_user_autostart BOOLEAN NOT NULL DEFAULT 1,
                    allow_user_autostop BOOLEAN NOT NULL DEFAULT 1,
                    default_ttl_ms INTEGER NOT NULL DEFAULT 0,
                    activity_bump_ms INTEGER NOT NULL DEFAULT 0,
                    failure_ttl_ms INTEGER NOT NULL DEFAULT 0,
                    time_til_dormant_ms INTEGER NOT NULL DEFAULT 0,
                    time_til_dormant_autodelete_ms INTEGER NOT NULL DEFAULT 0,
                    autostop_requirement_days_of_week INTEGER NOT NULL DEFAULT 0,
                    autostop_requirement_weeks INTEGER NOT NULL DEFAULT 1,
                    autostart_allowed_days INTEGER NOT NULL DEFAULT 127,
                    updated_at DATETIME NOT NULL
                )
                "#,
            ),
            (
                "template_versions",
                r#"
                CREATE TABLE IF NOT EXISTS template_versions (
                    id BLOB PRIMARY KEY,
                    template_id BLOB NOT NULL,
                    name TEXT NOT NULL,
                    message TEXT NOT NULL DEFAULT '',
                    required_parameters TEXT NOT NULL DEFAULT '[]'
                )
                "#,
            ),
            (
                "workspaces",
                r#"
                CREATE TABLE IF NOT EXISTS workspaces (
                    id BLOB PRIMARY KEY,
                    owner_id BLOB NOT NULL,
                    template_id BLOB NOT NULL,
                    name TEXT NOT NULL,
                    deleted BOOLEAN NOT NULL DEFAULT 0,
                    autostart_schedule TEXT,
                    ttl_ms INTEGER,
                    automatic_updates TEXT NOT NULL DEFAULT 'never',
                    last_used_at DATETIME NOT NULL,
                    dormant_at DATETIME,
                    deleting_at DATETIME,
                    next_start_at DATETIME,
                    created_at DATETIME NOT NULL
                )
                "#,
            ),
            (
                "workspaces template index",
                "CREATE INDEX IF NOT EXISTS idx_workspaces_template ON workspaces(template_id)",
            ),
            (
                "workspace_builds",
                r#"
                CREATE TABLE IF NOT EXISTS workspace_builds (
                    id BLOB PRIMARY KEY,
                    workspace_id BLOB NOT NULL,
                    build_number INTEGER NOT NULL,
                    transition TEXT NOT NULL,
                    reason TEXT NOT NULL,
                    template_version_id BLOB NOT NULL,
                    job_id BLOB NOT NULL,
                    initiator_id BLOB NOT NULL,
                    created_at DATETIME NOT NULL,
                    deadline DATETIME,
                    max_deadline DATETIME,
                    parameters TEXT NOT NULL DEFAULT '[]',
                    UNIQUE (workspace_id, build_number)
                )
                "#,
            ),
            (
                "provisioner_jobs",
                r#"
                CREATE TABLE IF NOT EXISTS provisioner_jobs (
                    id BLOB PRIMARY KEY,
                    status TEXT NOT NULL,
                    initiator_id BLOB NOT NULL,
                    created_at DATETIME NOT NULL,
                    completed_at DATETIME
                )
                "#,
            ),
            (
                "provisioner_daemons",
                r#"
                CREATE TABLE IF NOT EXISTS provisioner_daemons (
                    id BLOB PRIMARY KEY,
                    name TEXT NOT NULL,
                    last_seen_at DATETIME NOT NULL
                )
                "#,
            ),
            (
                "resource_leases",
                r#"
                CREATE TABLE IF NOT EXISTS resource_leases (
                    resource TEXT PRIMARY KEY,
                    holder TEXT NOT NULL,
                    expires_at DATETIME NOT NULL
                )
                "#,
            ),
            (
                "audit_logs",
                r#"
                CREATE TABLE IF NOT EXISTS audit_logs (
                    id BLOB PRIMARY KEY,
                    workspace_id BLOB NOT NULL,
                    action TEXT NOT NULL,
                    reason TEXT NOT NULL,
                    initiator_id BLOB NOT NULL,
                    success BOOLEAN NOT NULL,
                    old_state TEXT NOT NULL,
                    new_state TEXT NOT NULL,
                    created_at DATETIME NOT NULL
                )
                "#,
            ),
            (
                "audit_logs workspace index",
                "CREATE INDEX IF NOT EXISTS idx_audit_workspace ON audit_logs(workspace_id, created_at DESC)",
            ),
            (
                "builds workspace index",
                "CREATE INDEX IF NOT EXISTS idx_builds_workspace ON workspace_builds(workspace_id, build_number DESC)",
            ),
        ];

        for (name, sql) in statements {
            if let Err(e) = sqlx::query(sql).execute(&self.pool).await {
                error!("Failed to create {}: {}", name, e);
                return Err(e.into());
            }
        }
        info!("Database tables initialized");
        Ok(())
    }
}
