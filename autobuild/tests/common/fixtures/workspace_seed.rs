//! One workspace with everything it references

use autobuild::database::{
    BuildReason, MemoryStore, ProvisionerJob, ProvisionerJobStatus, Template, TemplateVersion,
    User, UserStatus, Workspace, WorkspaceBuild, WorkspaceTransition,
};
use autobuild::schedule::ALL_DAYS;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct WorkspaceSeed {
    pub user: User,
    pub template: Template,
    pub version: TemplateVersion,
    pub workspace: Workspace,
    pub build: WorkspaceBuild,
    pub job: ProvisionerJob,
}

impl WorkspaceSeed {
    /// Started at `started_at` by its owner
    pub fn running(started_at: DateTime<Utc>, deadline: Option<DateTime<Utc>>) -> Self {
        let mut seed = Self::base(started_at);
        seed.build.transition = WorkspaceTransition::Start;
        seed.build.deadline = deadline;
        seed
    }

    /// Stopped at `stopped_at` by its owner
    pub fn stopped(stopped_at: DateTime<Utc>) -> Self {
        let mut seed = Self::base(stopped_at);
        seed.build.transition = WorkspaceTransition::Stop;
        seed
    }

    fn base(at: DateTime<Utc>) -> Self {
        let user = User {
            id: Uuid::new_v4(),
            username: "alice".to_string(),
            status: UserStatus::Active,
            quiet_hours_schedule: String::new(),
        };
        let template_id = Uuid::new_v4();
        let version = TemplateVersion {
            id: Uuid::new_v4(),
            template_id,
            name: "v1".to_string(),
            message: "initial".to_string(),
            required_parameters: Vec::new(),
        };
        let template = Template {
            id: template_id,
            name: "docker".to_string(),
            active_version_id: version.id,
            allow_user_autostart: true,
            allow_user_autostop: true,
            activity_bump_ms: 3_600_000,
            autostop_requirement_weeks: 1,
            autostart_allowed_days: ALL_DAYS,
            updated_at: at - Duration::days(30),
            ..Default::default()
        };
        let workspace = Workspace {
            id: Uuid::new_v4(),
            owner_id: user.id,
            template_id,
            name: "dev".to_string(),
            last_used_at: at,
            created_at: at - Duration::days(1),
            ..Default::default()
        };
        let job = ProvisionerJob {
            id: Uuid::new_v4(),
            status: ProvisionerJobStatus::Succeeded,
            initiator_id: user.id,
            created_at: at,
            completed_at: Some(at),
        };
        let build = WorkspaceBuild {
            id: Uuid::new_v4(),
            workspace_id: workspace.id,
            build_number: 1,
            transition: WorkspaceTransition::Start,
            reason: BuildReason::Initiator,
            template_version_id: version.id,
            job_id: job.id,
            initiator_id: user.id,
            created_at: at,
            deadline: None,
            max_deadline: None,
            parameters: Vec::new(),
        };

        Self {
            user,
            template,
            version,
            workspace,
            build,
            job,
        }
    }

    pub fn insert(&self, store: &MemoryStore) {
        store.insert_user(self.user.clone());
        store.insert_template_version(self.version.clone());
        store.insert_template(self.template.clone());
        store.insert_workspace(self.workspace.clone());
        store.insert_build_with_job(self.build.clone(), self.job.clone());
    }
}

/// Register a provisioner daemon last seen at `at`.
pub fn seed_provisioner(store: &MemoryStore, at: DateTime<Utc>) {
    store.upsert_provisioner_daemon(Uuid::new_v4(), at);
}
