//! Row to record mapping for SQLite.

use anyhow::{Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::records::*;

pub(super) const USER_COLUMNS: &str = "id, username, status, quiet_hours_schedule";

pub(super) const TEMPLATE_COLUMNS: &str = r#"
    id, name, active_version_id, require_active_version, allow_user_autostart,
    allow_user_autostop, default_ttl_ms, activity_bump_ms, failure_ttl_ms,
    time_til_dormant_ms, time_til_dormant_autodelete_ms,
    autostop_requirement_days_of_week, autostop_requirement_weeks,
    autostart_allowed_days, updated_at
"#;

pub(super) const TEMPLATE_VERSION_COLUMNS: &str =
    "id, template_id, name, message, required_parameters";

pub(super) const WORKSPACE_COLUMNS: &str = r#"
    id, owner_id, template_id, name, deleted, autostart_schedule, ttl_ms,
    automatic_updates, last_used_at, dormant_at, deleting_at, next_start_at, created_at
"#;

pub(super) const BUILD_COLUMNS: &str = r#"
    id, workspace_id, build_number, transition, reason, template_version_id,
    job_id, initiator_id, created_at, deadline, max_deadline, parameters
"#;

pub(super) const JOB_COLUMNS: &str = "id, status, initiator_id, created_at, completed_at";

fn day_mask(row: &SqliteRow, column: &str) -> Result<u8> {
    let raw: i64 = row.try_get(column)?;
    u8::try_from(raw).with_context(|| format!("{} out of range: {}", column, raw))
}

pub(super) fn user_from_row(row: &SqliteRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        quiet_hours_schedule: row.try_get("quiet_hours_schedule")?,
    })
}

pub(super) fn template_from_row(row: &SqliteRow) -> Result<Template> {
    Ok(Template {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        active_version_id: row.try_get("active_version_id")?,
        require_active_version: row.try_get("require_active_version")?,
        allow_user_autostart: row.try_get("allow_user_autostart")?,
        allow_user_autostop: row.try_get("allow_user_autostop")?,
        default_ttl_ms: row.try_get("default_ttl_ms")?,
        activity_bump_ms: row.try_get("activity_bump_ms")?,
        failure_ttl_ms: row.try_get("failure_ttl_ms")?,
        time_til_dormant_ms: row.try_get("time_til_dormant_ms")?,
        time_til_dormant_autodelete_ms: row.try_get("time_til_dormant_autodelete_ms")?,
        autostop_requirement_days_of_week: day_mask(row, "autostop_requirement_days_of_week")?,
        autostop_requirement_weeks: row.try_get("autostop_requirement_weeks")?,
        autostart_allowed_days: day_mask(row, "autostart_allowed_days")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(super) fn template_version_from_row(row: &SqliteRow) -> Result<TemplateVersion> {
    let required: String = row.try_get("required_parameters")?;
    Ok(TemplateVersion {
        id: row.try_get("id")?,
        template_id: row.try_get("template_id")?,
        name: row.try_get("name")?,
        message: row.try_get("message")?,
        required_parameters: serde_json::from_str(&required)
            .context("Failed to decode required_parameters")?,
    })
}

pub(super) fn workspace_from_row(row: &SqliteRow) -> Result<Workspace> {
    Ok(Workspace {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        template_id: row.try_get("template_id")?,
        name: row.try_get("name")?,
        deleted: row.try_get("deleted")?,
        autostart_schedule: row.try_get("autostart_schedule")?,
        ttl_ms: row.try_get("ttl_ms")?,
        automatic_updates: row.try_get::<String, _>("automatic_updates")?.parse()?,
        last_used_at: row.try_get("last_used_at")?,
        dormant_at: row.try_get("dormant_at")?,
        deleting_at: row.try_get("deleting_at")?,
        next_start_at: row.try_get("next_start_at")?,
        created_at: row.try_get("created_at")?,
    })
}

pub(super) fn build_from_row(row: &SqliteRow) -> Result<WorkspaceBuild> {
    let parameters: String = row.try_get("parameters")?;
    Ok(WorkspaceBuild {
        id: row.try_get("id")?,
        workspace_id: row.try_get("workspace_id")?,
        build_number: row.try_get("build_number")?,
        transition: row.try_get::<String, _>("transition")?.parse()?,
        reason: row.try_get::<String, _>("reason")?.parse()?,
        template_version_id: row.try_get("template_version_id")?,
        job_id: row.try_get("job_id")?,
        initiator_id: row.try_get("initiator_id")?,
        created_at: row.try_get("created_at")?,
        deadline: row.try_get("deadline")?,
        max_deadline: row.try_get("max_deadline")?,
        parameters: serde_json::from_str(&parameters)
            .context("Failed to decode build parameters")?,
    })
}

pub(super) fn job_from_row(row: &SqliteRow) -> Result<ProvisionerJob> {
    Ok(ProvisionerJob {
        id: row.try_get("id")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        initiator_id: row.try_get("initiator_id")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}
