//! Tick-driven lifecycle executor.
//!
//! Each tick selects candidate workspaces, evaluates them concurrently under
//! a bounded worker budget, and reports per-tick statistics. A workspace is
//! evaluated under its named lock and inside one transaction; side effects
//! outside the datastore (job hand-off, notifications) only happen after the
//! transaction committed.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::eligibility::{next_transition, truncate_minute, EvaluationInput};
use crate::constants::executor::{
    LOCK_PREFIX, MAX_CONCURRENT_EVALUATIONS, NOTIFICATION_SOURCE, SYSTEM_INITIATOR_ID,
};
use crate::database::{
    AutomaticUpdates, BuildReason, Store, TemplateVersion, Workspace, WorkspaceTransition,
};
use crate::resource_lock::ResourceLocks;
use crate::schedule::{
    calculate_autostop, next_allowed_autostart, CalculateAutostopParams, TemplateScheduleStore,
    UserQuietHoursScheduleStore,
};
use crate::services::{
    AuditEntry, Auditor, BuildOutcome, BuildRequest, JobQueue, Notification,
    NotificationTemplate, NotificationsEnqueuer, WorkspaceBuilder,
};
use crate::swappable::Swappable;

/// Outcome of one tick
#[derive(Debug, Default)]
pub struct Stats {
    pub elapsed: std::time::Duration,
    pub transitions: HashMap<Uuid, WorkspaceTransition>,
    pub errors: HashMap<Uuid, anyhow::Error>,
}

/// Everything the executor talks to
pub struct Collaborators {
    pub store: Arc<dyn Store>,
    pub locks: Arc<dyn ResourceLocks>,
    pub builder: Arc<dyn WorkspaceBuilder>,
    pub job_queue: Arc<dyn JobQueue>,
    pub notifier: Arc<dyn NotificationsEnqueuer>,
    pub template_schedule_store: Swappable<dyn TemplateScheduleStore>,
    pub user_quiet_hours_store: Swappable<dyn UserQuietHoursScheduleStore>,
    pub auditor: Swappable<dyn Auditor>,
}

pub struct ExecutorOptions {
    pub max_concurrent_evaluations: usize,
    /// Receives statistics after every tick
    pub stats: Option<mpsc::Sender<Stats>>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            max_concurrent_evaluations: MAX_CONCURRENT_EVALUATIONS,
            stats: None,
        }
    }
}

struct ExecutorInner {
    collaborators: Collaborators,
    options: ExecutorOptions,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

/// What a committed evaluation still has to do outside the transaction
struct Committed {
    transition: Option<WorkspaceTransition>,
    build: Option<BuildOutcome>,
    dormant: bool,
}

impl Executor {
    pub fn new(
        collaborators: Collaborators,
        options: ExecutorOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                collaborators,
                options,
                cancel,
            }),
        }
    }

    pub fn update_template_schedule_store(&self, store: Arc<dyn TemplateScheduleStore>) {
        info!("Template schedule store replaced");
        self.inner.collaborators.template_schedule_store.store(store);
    }

    pub fn update_user_quiet_hours_store(&self, store: Arc<dyn UserQuietHoursScheduleStore>) {
        info!("User quiet hours store replaced");
        self.inner.collaborators.user_quiet_hours_store.store(store);
    }

    pub fn update_auditor(&self, auditor: Arc<dyn Auditor>) {
        self.inner.collaborators.auditor.store(auditor);
    }

    /// Consume ticks until the channel closes or the executor is cancelled.
    pub fn run(&self, mut ticks: mpsc::Receiver<DateTime<Utc>>) -> JoinHandle<()> {
        let executor = self.clone();
        tokio::spawn(async move {
            info!("Lifecycle executor started");
            loop {
                let tick = tokio::select! {
                    _ = executor.inner.cancel.cancelled() => break,
                    tick = ticks.recv() => match tick {
                        Some(tick) => tick,
                        None => break,
                    },
                };

                let stats = executor.run_once(tick).await;
                if executor.inner.cancel.is_cancelled() {
                    break;
                }
                if let Some(sender) = &executor.inner.options.stats {
                    tokio::select! {
                        _ = executor.inner.cancel.cancelled() => break,
                        sent = sender.send(stats) => {
                            if sent.is_err() {
                                debug!("Stats receiver dropped");
                            }
                        }
                    }
                }
            }
            info!("Lifecycle executor stopped");
        })
    }

    /// Evaluate every candidate workspace for one tick.
    #[instrument(skip_all, fields(tick = %tick))]
    pub async fn run_once(&self, tick: DateTime<Utc>) -> Stats {
        let started = Instant::now();
        let now = truncate_minute(tick);

        let candidates = match self
            .inner
            .collaborators
            .store
            .get_workspaces_eligible_for_transition(now)
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                error!("Failed to query workspaces eligible for transition: {}", e);
                return Stats {
                    elapsed: started.elapsed(),
                    ..Default::default()
                };
            }
        };
        debug!("{} candidate workspaces", candidates.len());

        let semaphore = Arc::new(Semaphore::new(
            self.inner.options.max_concurrent_evaluations.max(1),
        ));
        let results = Arc::new(Mutex::new(Stats::default()));
        let mut tasks = Vec::with_capacity(candidates.len());

        for workspace in candidates {
            let task = {
                let executor = self.clone();
                let semaphore = semaphore.clone();
                let results = results.clone();
                let workspace_id = workspace.id;
                tokio::spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return;
                    };
                    let outcome = tokio::select! {
                        _ = executor.inner.cancel.cancelled() => return,
                        outcome = executor.evaluate_workspace(workspace_id, now) => outcome,
                    };

                    let mut results = results.lock();
                    match outcome {
                        Ok(Some(transition)) => {
                            results.transitions.insert(workspace_id, transition);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            error!("Failed to evaluate workspace {}: {:#}", workspace_id, e);
                            results.errors.insert(workspace_id, e);
                        }
                    }
                })
            };
            tasks.push(task);
        }

        for result in join_all(tasks).await {
            if let Err(e) = result {
                error!("Workspace evaluation task failed: {}", e);
            }
        }

        let mut stats = std::mem::take(&mut *results.lock());
        stats.elapsed = started.elapsed();
        if !stats.transitions.is_empty() || !stats.errors.is_empty() {
            info!(
                "Tick {} done in {:?}: {} transitions, {} errors",
                now,
                stats.elapsed,
                stats.transitions.len(),
                stats.errors.len()
            );
        } else {
            debug!("Tick {} done in {:?}, nothing to do", now, stats.elapsed);
        }
        stats
    }

    /// One unit of work. `Ok(None)` means skipped or nothing to build.
    #[instrument(skip_all, fields(workspace_id = %workspace_id))]
    async fn evaluate_workspace(
        &self,
        workspace_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkspaceTransition>> {
        let collaborators = &self.inner.collaborators;

        let key = format!("{}:{}", LOCK_PREFIX, workspace_id);
        let Some(_guard) = collaborators.locks.try_lock(&key).await? else {
            debug!("Workspace {} is being evaluated elsewhere, skipping", workspace_id);
            return Ok(None);
        };

        let template_schedule_store = collaborators.template_schedule_store.load();
        let user_quiet_hours_store = collaborators.user_quiet_hours_store.load();
        let auditor = collaborators.auditor.load();

        let mut tx = collaborators.store.begin().await?;

        let workspace = tx.get_workspace_by_id(workspace_id).await?;
        if workspace.deleted {
            return Ok(None);
        }
        let user = tx.get_user_by_id(workspace.owner_id).await?;
        let build = tx
            .get_latest_workspace_build_by_workspace_id(workspace.id)
            .await?;
        let job = tx.get_provisioner_job_by_id(build.job_id).await?;
        let policy = template_schedule_store
            .get(tx.as_mut(), workspace.template_id)
            .await
            .context("resolve template schedule")?;

        let mut dirty = false;
        if let Some(raw) = autostart_schedule(&workspace) {
            if workspace.next_start_at.map_or(true, |at| at < now) {
                let next = next_allowed_autostart(now, raw, &policy);
                if next != workspace.next_start_at {
                    tx.update_workspace_next_start_at(workspace.id, next).await?;
                    dirty = true;
                }
            }
        }

        let decision = next_transition(&EvaluationInput {
            user: &user,
            workspace: &workspace,
            build: &build,
            job: &job,
            policy: &policy,
            now,
        });
        let Some(decision) = decision else {
            if dirty {
                tx.commit().await.context("commit next start")?;
            }
            return Ok(None);
        };

        if decision.transition.is_some() && !tx.has_available_provisioner(now).await? {
            debug!("No provisioner available for workspace {}, skipping", workspace.id);
            return Ok(None);
        }

        let mut outcome = None;
        if let Some(transition) = decision.transition {
            let built = collaborators
                .builder
                .build(
                    tx.as_mut(),
                    BuildRequest {
                        workspace: &workspace,
                        last_build: &build,
                        transition,
                        reason: decision.reason,
                        use_active_version: policy.require_active_version
                            || workspace.automatic_updates == AutomaticUpdates::Always,
                        initiator_id: SYSTEM_INITIATOR_ID,
                        now,
                    },
                )
                .await
                .context("create build")?;

            if transition == WorkspaceTransition::Start {
                let autostop = calculate_autostop(
                    tx.as_mut(),
                    CalculateAutostopParams {
                        template_schedule_store: template_schedule_store.as_ref(),
                        user_quiet_hours_store: user_quiet_hours_store.as_ref(),
                        now,
                        workspace: &workspace,
                    },
                )
                .await
                .context("calculate autostop")?;
                tx.update_workspace_build_deadline(
                    built.build.id,
                    autostop.deadline,
                    autostop.max_deadline,
                )
                .await?;

                if decision.reason == BuildReason::Autostart {
                    if let Some(raw) = autostart_schedule(&workspace) {
                        let next = next_allowed_autostart(now, raw, &policy);
                        tx.update_workspace_next_start_at(workspace.id, next).await?;
                    }
                }
            }
            outcome = Some(built);
        }

        let mut dormant_state = None;
        if decision.reason == BuildReason::Dormancy {
            match tx
                .update_workspace_dormant_deleting_at(workspace.id, Some(now))
                .await
            {
                Ok(updated) => dormant_state = Some(updated),
                Err(e) => {
                    auditor.audit(AuditEntry::workspace_dormant(
                        workspace.clone(),
                        workspace.clone(),
                        false,
                        now,
                    ));
                    return Err(e.context("mark workspace dormant"));
                }
            }
        }

        let committed = tx.commit().await;
        if let Some(updated) = &dormant_state {
            auditor.audit(AuditEntry::workspace_dormant(
                workspace.clone(),
                updated.clone(),
                committed.is_ok(),
                now,
            ));
        }
        committed.context("commit transition")?;

        if let Some(transition) = decision.transition {
            info!(
                "Workspace {} ({}) transitioned: {} ({})",
                workspace.name, workspace.id, transition, decision.reason
            );
        } else {
            info!("Workspace {} ({}) marked dormant", workspace.name, workspace.id);
        }

        self.after_commit(
            &workspace,
            policy.time_til_dormant,
            Committed {
                transition: decision.transition,
                build: outcome,
                dormant: dormant_state.is_some(),
            },
            now,
        )
        .await;

        Ok(decision.transition)
    }

    /// Best-effort side effects of an already committed evaluation.
    async fn after_commit(
        &self,
        workspace: &Workspace,
        time_til_dormant: Duration,
        committed: Committed,
        now: DateTime<Utc>,
    ) {
        let collaborators = &self.inner.collaborators;

        if let Some(outcome) = &committed.build {
            if let Err(e) = collaborators.job_queue.post_job(&outcome.job).await {
                warn!(
                    "Failed to post {:?} job {} for workspace {}: {}",
                    committed.transition, outcome.job.id, workspace.id, e
                );
            }
        }

        if committed.dormant {
            let labels = HashMap::from([
                ("name".to_string(), workspace.name.clone()),
                ("reason".to_string(), "inactivity exceeded the dormancy threshold".to_string()),
                ("timeTilDormant".to_string(), humanize(time_til_dormant)),
            ]);
            self.notify(workspace, NotificationTemplate::WorkspaceDormant, labels, now)
                .await;
        }

        if let Some(version) = committed.build.as_ref().and_then(|b| b.updated_to.as_ref()) {
            self.notify(
                workspace,
                NotificationTemplate::WorkspaceAutoUpdated,
                auto_update_labels(workspace, version),
                now,
            )
            .await;
        }
    }

    async fn notify(
        &self,
        workspace: &Workspace,
        template: NotificationTemplate,
        labels: HashMap<String, String>,
        now: DateTime<Utc>,
    ) {
        let notification = Notification {
            timestamp: now,
            template,
            user_id: workspace.owner_id,
            labels,
            source: NOTIFICATION_SOURCE.to_string(),
            targets: vec![workspace.id, workspace.owner_id, workspace.template_id],
        };
        if let Err(e) = self.inner.collaborators.notifier.enqueue(&notification).await {
            warn!(
                "Failed to enqueue {:?} notification for workspace {}: {}",
                template, workspace.id, e
            );
        }
    }
}

fn autostart_schedule(workspace: &Workspace) -> Option<&str> {
    workspace
        .autostart_schedule
        .as_deref()
        .filter(|raw| !raw.is_empty())
}

fn auto_update_labels(workspace: &Workspace, version: &TemplateVersion) -> HashMap<String, String> {
    HashMap::from([
        ("name".to_string(), workspace.name.clone()),
        ("template_version_name".to_string(), version.name.clone()),
        ("template_version_message".to_string(), version.message.clone()),
    ])
}

/// Largest whole unit, e.g. "7 days" or "90 minutes".
fn humanize(duration: Duration) -> String {
    let plural = |n: i64, unit: &str| {
        if n == 1 {
            format!("1 {}", unit)
        } else {
            format!("{} {}s", n, unit)
        }
    };
    if duration.num_days() > 0 && duration == Duration::days(duration.num_days()) {
        plural(duration.num_days(), "day")
    } else if duration.num_hours() > 0 && duration == Duration::hours(duration.num_hours()) {
        plural(duration.num_hours(), "hour")
    } else {
        plural(duration.num_minutes(), "minute")
    }
}
