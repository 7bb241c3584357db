//! Executor wired to the in-memory store and recording collaborators

use anyhow::Result;
use async_trait::async_trait;
use autobuild::database::{MemoryStore, ProvisionerJob};
use autobuild::lifecycle::{Collaborators, Executor, ExecutorOptions};
use autobuild::schedule::{
    EnterpriseTemplateScheduleStore, EnterpriseUserQuietHoursScheduleStore, TemplateScheduleStore,
    UserQuietHoursScheduleStore,
};
use autobuild::services::{
    AuditEntry, Auditor, ChannelJobQueue, Notification, NotificationTemplate,
    NotificationsEnqueuer, StandardBuilder, WorkspaceBuilder,
};
use autobuild::{LocalResourceLocks, ResourceLocks, Store, Swappable};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::test_data::schedules::QUIET_HOURS_MIDNIGHT;

#[derive(Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }

    pub fn of(&self, template: NotificationTemplate) -> Vec<Notification> {
        self.sent()
            .into_iter()
            .filter(|n| n.template == template)
            .collect()
    }
}

#[async_trait]
impl NotificationsEnqueuer for RecordingNotifier {
    async fn enqueue(&self, notification: &Notification) -> Result<()> {
        self.sent.lock().push(notification.clone());
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct RecordingAuditor {
    entries: Arc<Mutex<Vec<AuditEntry>>>,
}

impl RecordingAuditor {
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }
}

impl Auditor for RecordingAuditor {
    fn audit(&self, entry: AuditEntry) {
        self.entries.lock().push(entry);
    }
}

pub struct Harness {
    pub store: MemoryStore,
    pub executor: Executor,
    pub locks: Arc<LocalResourceLocks>,
    pub notifications: RecordingNotifier,
    pub audits: RecordingAuditor,
    pub cancel: CancellationToken,
    jobs: mpsc::UnboundedReceiver<ProvisionerJob>,
}

impl Harness {
    pub fn new(store: MemoryStore) -> Self {
        Self::build(
            store,
            Arc::new(LocalResourceLocks::new()),
            Arc::new(StandardBuilder),
            ExecutorOptions::default(),
        )
    }

    pub fn build(
        store: MemoryStore,
        locks: Arc<LocalResourceLocks>,
        builder: Arc<dyn WorkspaceBuilder>,
        options: ExecutorOptions,
    ) -> Self {
        let (job_queue, jobs) = ChannelJobQueue::new();
        let notifications = RecordingNotifier::default();
        let audits = RecordingAuditor::default();
        let cancel = CancellationToken::new();

        let (template, quiet_hours) = policy_stores();
        let auditor: Arc<dyn Auditor> = Arc::new(audits.clone());

        let executor = Executor::new(
            Collaborators {
                store: Arc::new(store.clone()),
                locks: locks.clone(),
                builder,
                job_queue: Arc::new(job_queue),
                notifier: Arc::new(notifications.clone()),
                template_schedule_store: template,
                user_quiet_hours_store: quiet_hours,
                auditor: Swappable::new(auditor),
            },
            options,
            cancel.clone(),
        );

        Self {
            store,
            executor,
            locks,
            notifications,
            audits,
            cancel,
            jobs,
        }
    }

    /// Jobs handed to the queue so far
    pub fn posted_jobs(&mut self) -> Vec<ProvisionerJob> {
        let mut jobs = Vec::new();
        while let Ok(job) = self.jobs.try_recv() {
            jobs.push(job);
        }
        jobs
    }
}

/// Enterprise policy stores with midnight UTC default quiet hours
pub fn policy_stores() -> (
    Swappable<dyn TemplateScheduleStore>,
    Swappable<dyn UserQuietHoursScheduleStore>,
) {
    let quiet_hours: Arc<dyn UserQuietHoursScheduleStore> = Arc::new(
        EnterpriseUserQuietHoursScheduleStore::new(QUIET_HOURS_MIDNIGHT, true)
            .expect("default quiet hours are valid"),
    );
    let quiet_hours = Swappable::new(quiet_hours);
    let template: Arc<dyn TemplateScheduleStore> =
        Arc::new(EnterpriseTemplateScheduleStore::new(quiet_hours.clone()));
    (Swappable::new(template), quiet_hours)
}

/// Executor over any store and lock backend, with a recording auditor
pub fn executor_for(
    store: Arc<dyn Store>,
    locks: Arc<dyn ResourceLocks>,
) -> (Executor, RecordingAuditor, mpsc::UnboundedReceiver<ProvisionerJob>) {
    let (job_queue, jobs) = ChannelJobQueue::new();
    let audits = RecordingAuditor::default();
    let (template, quiet_hours) = policy_stores();
    let auditor: Arc<dyn Auditor> = Arc::new(audits.clone());

    let executor = Executor::new(
        Collaborators {
            store,
            locks,
            builder: Arc::new(StandardBuilder),
            job_queue: Arc::new(job_queue),
            notifier: Arc::new(RecordingNotifier::default()),
            template_schedule_store: template,
            user_quiet_hours_store: quiet_hours,
            auditor: Swappable::new(auditor),
        },
        ExecutorOptions::default(),
        CancellationToken::new(),
    );
    (executor, audits, jobs)
}
