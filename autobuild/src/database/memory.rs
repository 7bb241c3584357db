//! In-process datastore.
//!
//! Transactions buffer their writes and apply them on commit. Reads are
//! read-committed: each call sees the transaction's own writes over the
//! committed state as it is at that moment, including commits made by other
//! transactions after `begin`. Build numbers are
//! unique per workspace, so two transactions racing to create the same build
//! conflict at commit like they would against SQLite.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use super::records::*;
use super::sqlite::deleting_at_for;
use super::{Store, StoreTx};
use crate::constants::provisioners::STALE_INTERVAL_SECONDS;

#[derive(Default)]
struct MemoryState {
    users: HashMap<Uuid, User>,
    templates: HashMap<Uuid, Template>,
    versions: HashMap<Uuid, TemplateVersion>,
    workspaces: HashMap<Uuid, Workspace>,
    builds: HashMap<Uuid, WorkspaceBuild>,
    jobs: HashMap<Uuid, ProvisionerJob>,
    provisioners: HashMap<Uuid, DateTime<Utc>>,
    fail_commits_for: HashSet<Uuid>,
}

impl MemoryState {
    fn latest_build(&self, workspace_id: Uuid) -> Option<&WorkspaceBuild> {
        self.builds
            .values()
            .filter(|b| b.workspace_id == workspace_id)
            .max_by_key(|b| b.build_number)
    }

    fn possibly_eligible(&self, workspace: &Workspace, now: DateTime<Utc>) -> bool {
        if workspace.deleted {
            return false;
        }
        let Some(build) = self.latest_build(workspace.id) else {
            return false;
        };
        let (Some(job), Some(template), Some(user)) = (
            self.jobs.get(&build.job_id),
            self.templates.get(&workspace.template_id),
            self.users.get(&workspace.owner_id),
        ) else {
            return false;
        };
        let started = build.transition == WorkspaceTransition::Start;

        (started && user.status == UserStatus::Suspended)
            || (started && build.deadline.is_some_and(|d| d <= now))
            || (build.transition == WorkspaceTransition::Stop
                && workspace
                    .autostart_schedule
                    .as_deref()
                    .is_some_and(|s| !s.is_empty())
                && workspace.next_start_at.map_or(true, |at| at <= now))
            || (started && job.failed() && template.failure_ttl_ms > 0)
            || (!workspace.is_dormant()
                && template.time_til_dormant_ms > 0
                && now - workspace.last_used_at
                    >= Duration::milliseconds(template.time_til_dormant_ms))
            || (workspace.is_dormant()
                && template.time_til_dormant_autodelete_ms > 0
                && workspace.deleting_at.is_some_and(|d| d <= now))
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_user(&self, user: User) {
        self.state.lock().users.insert(user.id, user);
    }

    pub fn insert_template(&self, template: Template) {
        self.state.lock().templates.insert(template.id, template);
    }

    pub fn insert_template_version(&self, version: TemplateVersion) {
        self.state.lock().versions.insert(version.id, version);
    }

    pub fn insert_workspace(&self, workspace: Workspace) {
        self.state.lock().workspaces.insert(workspace.id, workspace);
    }

    pub fn insert_build_with_job(&self, build: WorkspaceBuild, job: ProvisionerJob) {
        let mut state = self.state.lock();
        state.jobs.insert(job.id, job);
        state.builds.insert(build.id, build);
    }

    pub fn upsert_provisioner_daemon(&self, id: Uuid, last_seen_at: DateTime<Utc>) {
        self.state.lock().provisioners.insert(id, last_seen_at);
    }

    /// Make every commit touching `workspace_id` fail.
    pub fn fail_commits_for(&self, workspace_id: Uuid) {
        self.state.lock().fail_commits_for.insert(workspace_id);
    }

    pub fn workspace(&self, id: Uuid) -> Option<Workspace> {
        self.state.lock().workspaces.get(&id).cloned()
    }

    pub fn user(&self, id: Uuid) -> Option<User> {
        self.state.lock().users.get(&id).cloned()
    }

    pub fn template(&self, id: Uuid) -> Option<Template> {
        self.state.lock().templates.get(&id).cloned()
    }

    pub fn job(&self, id: Uuid) -> Option<ProvisionerJob> {
        self.state.lock().jobs.get(&id).cloned()
    }

    /// All builds of a workspace, oldest first.
    pub fn builds(&self, workspace_id: Uuid) -> Vec<WorkspaceBuild> {
        let state = self.state.lock();
        let mut builds: Vec<_> = state
            .builds
            .values()
            .filter(|b| b.workspace_id == workspace_id)
            .cloned()
            .collect();
        builds.sort_by_key(|b| b.build_number);
        builds
    }

    pub fn latest_build(&self, workspace_id: Uuid) -> Option<WorkspaceBuild> {
        self.state.lock().latest_build(workspace_id).cloned()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_workspaces_eligible_for_transition(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Workspace>> {
        let state = self.state.lock();
        let mut workspaces: Vec<_> = state
            .workspaces
            .values()
            .filter(|w| state.possibly_eligible(w, now))
            .cloned()
            .collect();
        workspaces.sort_by_key(|w| w.created_at);
        Ok(workspaces)
    }

    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        Ok(Box::new(MemoryTx {
            state: self.state.clone(),
            pending: Pending::default(),
        }))
    }
}

#[derive(Default)]
struct Pending {
    users: HashMap<Uuid, User>,
    templates: HashMap<Uuid, Template>,
    workspaces: HashMap<Uuid, Workspace>,
    builds: HashMap<Uuid, WorkspaceBuild>,
    jobs: HashMap<Uuid, ProvisionerJob>,
}

impl Pending {
    fn touched_workspaces(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.workspaces
            .keys()
            .copied()
            .chain(self.builds.values().map(|b| b.workspace_id))
    }
}

struct MemoryTx {
    state: Arc<Mutex<MemoryState>>,
    pending: Pending,
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn get_workspace_by_id(&mut self, id: Uuid) -> Result<Workspace> {
        if let Some(workspace) = self.pending.workspaces.get(&id) {
            return Ok(workspace.clone());
        }
        self.state
            .lock()
            .workspaces
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow!("workspace {} not found", id))
    }

    async fn get_workspaces_by_template_id(&mut self, template_id: Uuid) -> Result<Vec<Workspace>> {
        let state = self.state.lock();
        let mut merged: HashMap<Uuid, Workspace> = state
            .workspaces
            .iter()
            .filter(|(_, w)| w.template_id == template_id)
            .map(|(id, w)| (*id, w.clone()))
            .collect();
        for (id, workspace) in &self.pending.workspaces {
            if workspace.template_id == template_id {
                merged.insert(*id, workspace.clone());
            }
        }
        let mut workspaces: Vec<_> = merged.into_values().filter(|w| !w.deleted).collect();
        workspaces.sort_by_key(|w| w.created_at);
        Ok(workspaces)
    }

    async fn update_workspace_next_start_at(
        &mut self,
        id: Uuid,
        next_start_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut workspace = self.get_workspace_by_id(id).await?;
        workspace.next_start_at = next_start_at;
        self.pending.workspaces.insert(id, workspace);
        Ok(())
    }

    async fn update_workspace_dormant_deleting_at(
        &mut self,
        id: Uuid,
        dormant_at: Option<DateTime<Utc>>,
    ) -> Result<Workspace> {
        let mut workspace = self.get_workspace_by_id(id).await?;
        let template = self.get_template_by_id(workspace.template_id).await?;
        workspace.dormant_at = dormant_at;
        workspace.deleting_at = deleting_at_for(dormant_at, &template);
        self.pending.workspaces.insert(id, workspace.clone());
        Ok(workspace)
    }

    async fn get_user_by_id(&mut self, id: Uuid) -> Result<User> {
        if let Some(user) = self.pending.users.get(&id) {
            return Ok(user.clone());
        }
        self.state
            .lock()
            .users
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow!("user {} not found", id))
    }

    async fn update_user_quiet_hours_schedule(&mut self, id: Uuid, schedule: &str) -> Result<User> {
        let mut user = self.get_user_by_id(id).await?;
        user.quiet_hours_schedule = schedule.to_string();
        self.pending.users.insert(id, user.clone());
        Ok(user)
    }

    async fn get_template_by_id(&mut self, id: Uuid) -> Result<Template> {
        if let Some(template) = self.pending.templates.get(&id) {
            return Ok(template.clone());
        }
        self.state
            .lock()
            .templates
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow!("template {} not found", id))
    }

    async fn update_template_schedule(&mut self, template: &Template) -> Result<()> {
        // Only the schedule columns change.
        let mut stored = self.get_template_by_id(template.id).await?;
        stored.require_active_version = template.require_active_version;
        stored.allow_user_autostart = template.allow_user_autostart;
        stored.allow_user_autostop = template.allow_user_autostop;
        stored.default_ttl_ms = template.default_ttl_ms;
        stored.activity_bump_ms = template.activity_bump_ms;
        stored.failure_ttl_ms = template.failure_ttl_ms;
        stored.time_til_dormant_ms = template.time_til_dormant_ms;
        stored.time_til_dormant_autodelete_ms = template.time_til_dormant_autodelete_ms;
        stored.autostop_requirement_days_of_week = template.autostop_requirement_days_of_week;
        stored.autostop_requirement_weeks = template.autostop_requirement_weeks;
        stored.autostart_allowed_days = template.autostart_allowed_days;
        stored.updated_at = template.updated_at;
        self.pending.templates.insert(stored.id, stored);
        Ok(())
    }

    async fn get_template_version_by_id(&mut self, id: Uuid) -> Result<TemplateVersion> {
        self.state
            .lock()
            .versions
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow!("template version {} not found", id))
    }

    async fn get_latest_workspace_build_by_workspace_id(
        &mut self,
        workspace_id: Uuid,
    ) -> Result<WorkspaceBuild> {
        let committed = self.state.lock().latest_build(workspace_id).cloned();
        let pending = self
            .pending
            .builds
            .values()
            .filter(|b| b.workspace_id == workspace_id)
            .max_by_key(|b| b.build_number)
            .cloned();

        let latest = match (committed, pending) {
            (Some(committed), Some(pending)) => {
                let committed = self.pending.builds.get(&committed.id).cloned().unwrap_or(committed);
                if pending.build_number >= committed.build_number {
                    Some(pending)
                } else {
                    Some(committed)
                }
            }
            (committed, pending) => pending.or(committed),
        };
        latest.ok_or_else(|| anyhow!("workspace {} has no builds", workspace_id))
    }

    async fn insert_workspace_build(&mut self, build: &WorkspaceBuild) -> Result<()> {
        self.pending.builds.insert(build.id, build.clone());
        Ok(())
    }

    async fn update_workspace_build_deadline(
        &mut self,
        id: Uuid,
        deadline: Option<DateTime<Utc>>,
        max_deadline: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut build = match self.pending.builds.get(&id) {
            Some(build) => build.clone(),
            None => self
                .state
                .lock()
                .builds
                .get(&id)
                .cloned()
                .ok_or_else(|| anyhow!("workspace build {} not found", id))?,
        };
        build.deadline = deadline;
        build.max_deadline = max_deadline;
        self.pending.builds.insert(id, build);
        Ok(())
    }

    async fn get_provisioner_job_by_id(&mut self, id: Uuid) -> Result<ProvisionerJob> {
        if let Some(job) = self.pending.jobs.get(&id) {
            return Ok(job.clone());
        }
        self.state
            .lock()
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow!("provisioner job {} not found", id))
    }

    async fn insert_provisioner_job(&mut self, job: &ProvisionerJob) -> Result<()> {
        self.pending.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn has_available_provisioner(&mut self, at: DateTime<Utc>) -> Result<bool> {
        let cutoff = at - Duration::seconds(STALE_INTERVAL_SECONDS);
        Ok(self
            .state
            .lock()
            .provisioners
            .values()
            .any(|last_seen| *last_seen >= cutoff))
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTx { state, pending } = *self;
        let mut state = state.lock();

        if let Some(id) = pending
            .touched_workspaces()
            .find(|id| state.fail_commits_for.contains(id))
        {
            bail!("commit rejected for workspace {}", id);
        }

        for build in pending.builds.values() {
            let conflict = state.builds.values().any(|existing| {
                existing.id != build.id
                    && existing.workspace_id == build.workspace_id
                    && existing.build_number == build.build_number
            });
            if conflict {
                bail!(
                    "build number {} already exists for workspace {}",
                    build.build_number,
                    build.workspace_id
                );
            }
        }

        state.users.extend(pending.users);
        state.templates.extend(pending.templates);
        state.workspaces.extend(pending.workspaces);
        state.builds.extend(pending.builds);
        state.jobs.extend(pending.jobs);
        Ok(())
    }
}
