pub mod audit;
pub mod builder;
pub mod job_queue;
pub mod notifications;

pub use audit::{AuditEntry, Auditor, DatabaseAuditor, TracingAuditor};
pub use builder::{BuildOutcome, BuildRequest, StandardBuilder, WorkspaceBuilder};
pub use job_queue::{ChannelJobQueue, HttpJobQueue, JobQueue};
pub use notifications::{
    NoopNotifier, Notification, NotificationTemplate, NotificationsEnqueuer, WebhookNotifier,
};
