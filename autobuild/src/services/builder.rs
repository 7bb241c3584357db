//! Build creation for lifecycle transitions.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::database::{
    BuildReason, ProvisionerJob, ProvisionerJobStatus, StoreTx, TemplateVersion, Workspace,
    WorkspaceBuild, WorkspaceTransition,
};

#[derive(Debug, Clone, Copy)]
pub struct BuildRequest<'a> {
    pub workspace: &'a Workspace,
    pub last_build: &'a WorkspaceBuild,
    pub transition: WorkspaceTransition,
    pub reason: BuildReason,
    /// Move a starting workspace to the template's active version when the
    /// previous parameters allow it
    pub use_active_version: bool,
    pub initiator_id: Uuid,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub build: WorkspaceBuild,
    pub job: ProvisionerJob,
    /// Set when the build moved the workspace to a new template version
    pub updated_to: Option<TemplateVersion>,
}

#[async_trait]
pub trait WorkspaceBuilder: Send + Sync {
    /// Insert the build and its pending job inside `tx`.
    async fn build(&self, tx: &mut dyn StoreTx, request: BuildRequest<'_>) -> Result<BuildOutcome>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StandardBuilder;

impl StandardBuilder {
    async fn pick_version(
        &self,
        tx: &mut dyn StoreTx,
        request: &BuildRequest<'_>,
    ) -> Result<(Uuid, Option<TemplateVersion>)> {
        let pinned = request.last_build.template_version_id;
        if request.transition != WorkspaceTransition::Start || !request.use_active_version {
            return Ok((pinned, None));
        }

        let template = tx.get_template_by_id(request.workspace.template_id).await?;
        if template.active_version_id == pinned {
            return Ok((pinned, None));
        }

        let active = tx.get_template_version_by_id(template.active_version_id).await?;
        let supplied: HashSet<&str> = request
            .last_build
            .parameters
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        let missing: Vec<&str> = active
            .required_parameters
            .iter()
            .map(String::as_str)
            .filter(|name| !supplied.contains(name))
            .collect();

        if !missing.is_empty() {
            warn!(
                "Workspace {} stays on version {}: active version {} requires {:?}",
                request.workspace.id, pinned, active.id, missing
            );
            return Ok((pinned, None));
        }

        Ok((active.id, Some(active)))
    }
}

#[async_trait]
impl WorkspaceBuilder for StandardBuilder {
    async fn build(&self, tx: &mut dyn StoreTx, request: BuildRequest<'_>) -> Result<BuildOutcome> {
        let (template_version_id, updated_to) = self.pick_version(tx, &request).await?;

        let job = ProvisionerJob {
            id: Uuid::new_v4(),
            status: ProvisionerJobStatus::Pending,
            initiator_id: request.initiator_id,
            created_at: request.now,
            completed_at: None,
        };
        let build = WorkspaceBuild {
            id: Uuid::new_v4(),
            workspace_id: request.workspace.id,
            build_number: request.last_build.build_number + 1,
            transition: request.transition,
            reason: request.reason,
            template_version_id,
            job_id: job.id,
            initiator_id: request.initiator_id,
            created_at: request.now,
            deadline: None,
            max_deadline: None,
            parameters: request.last_build.parameters.clone(),
        };

        tx.insert_provisioner_job(&job).await?;
        tx.insert_workspace_build(&build).await?;
        debug!(
            "Created build #{} ({}) for workspace {}",
            build.build_number, build.transition, request.workspace.id
        );

        Ok(BuildOutcome {
            build,
            job,
            updated_to,
        })
    }
}
