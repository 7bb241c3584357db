use anyhow::{anyhow, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use autobuild::config::{Config, LockBackend};
use autobuild::schedule::{
    BaselineTemplateScheduleStore, BaselineUserQuietHoursScheduleStore,
    EnterpriseTemplateScheduleStore, EnterpriseUserQuietHoursScheduleStore, TemplateScheduleStore,
    UserQuietHoursScheduleStore,
};
use autobuild::services::{
    Auditor, ChannelJobQueue, DatabaseAuditor, HttpJobQueue, JobQueue, NoopNotifier,
    NotificationsEnqueuer, StandardBuilder, WebhookNotifier,
};
use autobuild::{
    Collaborators, ConfigManager, Database, Executor, ExecutorOptions, LocalResourceLocks,
    ResourceLocks, Swappable,
};

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::from_default_env()
        .add_directive("autobuild=info".parse()?)
        .add_directive("tokio_cron_scheduler=warn".parse()?)
        .add_directive("reqwest=warn".parse()?)
        .add_directive("sqlx=warn".parse()?);

    fmt().with_env_filter(env_filter).init();

    info!("Starting autobuild lifecycle scheduler");

    let config_manager = ConfigManager::from_env().await?;
    let config = config_manager.get_current_config();

    let database = Arc::new(Database::new(&config.database_path).await?);

    let locks: Arc<dyn ResourceLocks> = match config.locks.backend {
        LockBackend::Local => Arc::new(LocalResourceLocks::new()),
        LockBackend::Database => {
            let lease = chrono::Duration::seconds(i64::try_from(config.locks.lease_seconds)?);
            Arc::new(database.lease_locks(lease))
        }
    };
    info!("Using {:?} resource locks", config.locks.backend);

    let (template_schedule_store, user_quiet_hours_store) = policy_stores(&config)?;

    let job_queue: Arc<dyn JobQueue> = match &config.job_queue.url {
        Some(url) => Arc::new(HttpJobQueue::new(url.clone())?),
        None => {
            warn!("No job queue URL configured, provisioner jobs stay in process");
            let (queue, mut jobs) = ChannelJobQueue::new();
            tokio::spawn(async move {
                while let Some(job) = jobs.recv().await {
                    debug!("Provisioner job {} queued in process", job.id);
                }
            });
            Arc::new(queue)
        }
    };

    let notifier: Arc<dyn NotificationsEnqueuer> = if config.notifications.webhook_url.is_empty() {
        warn!("No notification webhook configured, owner notifications are disabled");
        Arc::new(NoopNotifier)
    } else {
        Arc::new(WebhookNotifier::new(config.notifications.webhook_url.clone())?)
    };

    let auditor: Arc<dyn Auditor> = Arc::new(DatabaseAuditor::new(database.clone()));

    let cancel = CancellationToken::new();
    let executor = Executor::new(
        Collaborators {
            store: database.clone(),
            locks,
            builder: Arc::new(StandardBuilder),
            job_queue,
            notifier,
            template_schedule_store,
            user_quiet_hours_store,
            auditor: Swappable::new(auditor),
        },
        ExecutorOptions {
            max_concurrent_evaluations: config.max_concurrent_evaluations,
            stats: None,
        },
        cancel.clone(),
    );

    // One pending tick at most; a tick arriving while the previous one still
    // runs is dropped.
    let (tick_sender, tick_receiver) = mpsc::channel(1);
    let executor_handle = executor.run(tick_receiver);

    let mut scheduler = JobScheduler::new()
        .await
        .map_err(|e| anyhow!("Failed to create JobScheduler: {}", e))?;
    let tick_job = Job::new_async(config.tick_schedule.as_str(), move |_uuid, _scheduler| {
        let tick_sender = tick_sender.clone();
        Box::pin(async move {
            match tick_sender.try_send(Utc::now()) {
                Ok(()) => {}
                Err(TrySendError::Full(tick)) => {
                    warn!("Previous tick still running, dropping tick {}", tick);
                }
                Err(TrySendError::Closed(_)) => debug!("Executor stopped, tick ignored"),
            }
        })
    })
    .map_err(|e| anyhow!("Failed to create tick job for '{}': {}", config.tick_schedule, e))?;
    scheduler
        .add(tick_job)
        .await
        .map_err(|e| anyhow!("Failed to add tick job to scheduler: {}", e))?;
    scheduler
        .start()
        .await
        .map_err(|e| anyhow!("Failed to start scheduler: {}", e))?;
    info!("Ticking on '{}'", config.tick_schedule);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    cancel.cancel();
    if let Err(e) = scheduler.shutdown().await {
        warn!("Failed to shut down scheduler cleanly: {}", e);
    }
    if let Err(e) = executor_handle.await {
        warn!("Executor task ended abnormally: {}", e);
    }

    info!("Autobuild stopped");
    Ok(())
}

type PolicyStores = (
    Swappable<dyn TemplateScheduleStore>,
    Swappable<dyn UserQuietHoursScheduleStore>,
);

/// Pick policy stores by entitlement.
fn policy_stores(config: &Config) -> Result<PolicyStores> {
    let quiet_hours: Arc<dyn UserQuietHoursScheduleStore> = if config.entitlements.quiet_hours {
        Arc::new(EnterpriseUserQuietHoursScheduleStore::new(
            &config.quiet_hours.default_schedule,
            config.quiet_hours.allow_user_custom,
        )?)
    } else {
        Arc::new(BaselineUserQuietHoursScheduleStore)
    };
    let quiet_hours = Swappable::new(quiet_hours);

    let template: Arc<dyn TemplateScheduleStore> =
        if config.entitlements.advanced_template_scheduling {
            Arc::new(EnterpriseTemplateScheduleStore::new(quiet_hours.clone()))
        } else {
            Arc::new(BaselineTemplateScheduleStore)
        };

    info!(
        "Policy stores: advanced template scheduling {}, quiet hours {}",
        config.entitlements.advanced_template_scheduling, config.entitlements.quiet_hours
    );
    Ok((Swappable::new(template), quiet_hours))
}
