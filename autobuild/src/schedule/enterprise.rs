//! Enterprise policy stores.
//!
//! These replace the baseline stores when advanced template scheduling and
//! quiet hours are entitled. The template store honours every schedule
//! column of the template and keeps existing workspaces consistent when the
//! policy changes. The quiet hours store resolves per-user daily schedules.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::autostop::compute_autostop;
use super::cron::Schedule;
use super::template::{
    AutostartRequirement, AutostopRequirement, TemplateScheduleStore, TemplateSchedulePolicy,
};
use super::user_quiet_hours::{UserQuietHoursSchedule, UserQuietHoursScheduleStore};
use crate::constants::autostop::POLICY_UPDATE_GRACE_HOURS;
use crate::database::{ProvisionerJobStatus, StoreTx, Template, WorkspaceTransition};
use crate::errors::PolicyError;
use crate::swappable::Swappable;

pub struct EnterpriseTemplateScheduleStore {
    user_quiet_hours_store: Swappable<dyn UserQuietHoursScheduleStore>,
}

impl EnterpriseTemplateScheduleStore {
    /// `user_quiet_hours_store` is consulted when a changed autostop
    /// requirement forces running builds to be recalculated.
    pub fn new(user_quiet_hours_store: Swappable<dyn UserQuietHoursScheduleStore>) -> Self {
        Self {
            user_quiet_hours_store,
        }
    }

    fn resolve(template: &Template) -> TemplateSchedulePolicy {
        TemplateSchedulePolicy {
            user_autostart_enabled: template.allow_user_autostart,
            user_autostop_enabled: template.allow_user_autostop,
            default_ttl: Duration::milliseconds(template.default_ttl_ms),
            activity_bump: Duration::milliseconds(template.activity_bump_ms),
            autostop_requirement: AutostopRequirement {
                days_of_week: template.autostop_requirement_days_of_week,
                weeks: template.autostop_requirement_weeks,
            },
            autostart_requirement: AutostartRequirement {
                days_of_week: template.autostart_allowed_days,
            },
            failure_ttl: Duration::milliseconds(template.failure_ttl_ms),
            time_til_dormant: Duration::milliseconds(template.time_til_dormant_ms),
            time_til_dormant_autodelete: Duration::milliseconds(
                template.time_til_dormant_autodelete_ms,
            ),
            require_active_version: template.require_active_version,
        }
    }

    fn apply(template: &mut Template, policy: &TemplateSchedulePolicy) {
        template.allow_user_autostart = policy.user_autostart_enabled;
        template.allow_user_autostop = policy.user_autostop_enabled;
        template.default_ttl_ms = policy.default_ttl.num_milliseconds();
        template.activity_bump_ms = policy.activity_bump.num_milliseconds();
        template.autostop_requirement_days_of_week = policy.autostop_requirement.days_of_week;
        template.autostop_requirement_weeks = policy.autostop_requirement.weeks;
        template.autostart_allowed_days = policy.autostart_requirement.days_of_week;
        template.failure_ttl_ms = policy.failure_ttl.num_milliseconds();
        template.time_til_dormant_ms = policy.time_til_dormant.num_milliseconds();
        template.time_til_dormant_autodelete_ms = policy.time_til_dormant_autodelete.num_milliseconds();
        template.require_active_version = policy.require_active_version;
    }

    /// Re-derive `deleting_at` for every dormant workspace of the template.
    async fn update_dormant_workspaces(
        &self,
        tx: &mut dyn StoreTx,
        template_id: Uuid,
    ) -> Result<(), PolicyError> {
        for workspace in tx.get_workspaces_by_template_id(template_id).await? {
            if workspace.deleted || !workspace.is_dormant() {
                continue;
            }
            tx.update_workspace_dormant_deleting_at(workspace.id, workspace.dormant_at)
                .await?;
        }
        Ok(())
    }

    /// Recalculate deadlines of running builds under the new requirement.
    async fn update_running_builds(
        &self,
        tx: &mut dyn StoreTx,
        template_id: Uuid,
        policy: &TemplateSchedulePolicy,
        now: DateTime<Utc>,
    ) -> Result<(), PolicyError> {
        let quiet_hours_store = self.user_quiet_hours_store.load();
        let grace = now + Duration::hours(POLICY_UPDATE_GRACE_HOURS);

        for workspace in tx.get_workspaces_by_template_id(template_id).await? {
            if workspace.deleted {
                continue;
            }
            let build = tx
                .get_latest_workspace_build_by_workspace_id(workspace.id)
                .await?;
            if build.transition != WorkspaceTransition::Start {
                continue;
            }
            let job = tx.get_provisioner_job_by_id(build.job_id).await?;
            if job.status != ProvisionerJobStatus::Succeeded {
                continue;
            }

            let quiet_hours = if policy.autostop_requirement.is_enabled() {
                quiet_hours_store.get(tx, workspace.owner_id).await?.schedule
            } else {
                None
            };

            let autostop = compute_autostop(
                policy,
                quiet_hours.as_ref(),
                now,
                workspace.ttl(),
                workspace.autostart_schedule.as_deref(),
            )
            .map_err(|e| PolicyError::Store(e.into()))?;

            let mut deadline = match (build.deadline, autostop.deadline) {
                (Some(old), Some(new)) if old < new => Some(old),
                (_, new) => new,
            };
            let mut max_deadline = autostop.max_deadline;

            // Never stop a running workspace sooner than the grace period.
            if let Some(value) = deadline.filter(|value| *value < grace) {
                debug!("Raising deadline {} of workspace {} to grace period", value, workspace.id);
                deadline = Some(grace);
            }
            if max_deadline.is_some_and(|value| value < grace) {
                max_deadline = Some(grace);
            }
            if let (Some(value), Some(max)) = (deadline, max_deadline) {
                if value > max {
                    deadline = Some(max);
                }
            }

            tx.update_workspace_build_deadline(build.id, deadline, max_deadline)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TemplateScheduleStore for EnterpriseTemplateScheduleStore {
    async fn get(
        &self,
        tx: &mut dyn StoreTx,
        template_id: Uuid,
    ) -> Result<TemplateSchedulePolicy, PolicyError> {
        let template = tx.get_template_by_id(template_id).await?;
        Ok(Self::resolve(&template))
    }

    #[instrument(skip(self, tx, policy))]
    async fn set(
        &self,
        tx: &mut dyn StoreTx,
        template_id: Uuid,
        policy: &TemplateSchedulePolicy,
        now: DateTime<Utc>,
    ) -> Result<TemplateSchedulePolicy, PolicyError> {
        policy.autostop_requirement.validate()?;

        let mut template = tx.get_template_by_id(template_id).await?;
        let current = Self::resolve(&template);
        if current == *policy {
            return Ok(current);
        }

        Self::apply(&mut template, policy);
        template.updated_at = now;
        tx.update_template_schedule(&template).await?;
        info!("Updated schedule policy of template {}", template.name);

        if current.time_til_dormant_autodelete != policy.time_til_dormant_autodelete {
            self.update_dormant_workspaces(tx, template_id).await?;
        }
        if current.autostop_requirement != policy.autostop_requirement {
            self.update_running_builds(tx, template_id, policy, now).await?;
        }

        Ok(Self::resolve(&template))
    }
}

pub struct EnterpriseUserQuietHoursScheduleStore {
    default_schedule: String,
    user_can_set: bool,
}

impl EnterpriseUserQuietHoursScheduleStore {
    pub fn new(default_schedule: &str, user_can_set: bool) -> Result<Self, PolicyError> {
        let store = Self {
            default_schedule: default_schedule.to_string(),
            user_can_set,
        };
        // Reject a broken default at startup instead of on first use.
        store.parse(default_schedule)?;
        Ok(store)
    }

    fn parse(&self, raw_schedule: &str) -> Result<UserQuietHoursSchedule, PolicyError> {
        let (raw, user_set) = if raw_schedule.trim().is_empty() || !self.user_can_set {
            (self.default_schedule.as_str(), false)
        } else {
            (raw_schedule, true)
        };

        let schedule = Schedule::daily(raw)?;
        if schedule.time_of_day().is_none() {
            return Err(PolicyError::InvalidQuietHours(format!(
                "{raw:?} must name exactly one time of day"
            )));
        }
        if schedule.min() != Duration::hours(24) {
            return Err(PolicyError::InvalidQuietHours(format!(
                "{raw:?} must occur exactly once per day"
            )));
        }

        Ok(UserQuietHoursSchedule {
            schedule: Some(schedule),
            user_set,
            user_can_set: self.user_can_set,
        })
    }
}

#[async_trait]
impl UserQuietHoursScheduleStore for EnterpriseUserQuietHoursScheduleStore {
    async fn get(
        &self,
        tx: &mut dyn StoreTx,
        user_id: Uuid,
    ) -> Result<UserQuietHoursSchedule, PolicyError> {
        let user = tx.get_user_by_id(user_id).await?;
        match self.parse(&user.quiet_hours_schedule) {
            Ok(resolved) => Ok(resolved),
            Err(e) => {
                // A stored schedule that no longer parses falls back to the default.
                warn!("Ignoring quiet hours of user {}: {}", user.username, e);
                self.parse("")
            }
        }
    }

    async fn set(
        &self,
        tx: &mut dyn StoreTx,
        user_id: Uuid,
        raw_schedule: &str,
    ) -> Result<UserQuietHoursSchedule, PolicyError> {
        if !self.user_can_set {
            return Err(PolicyError::NotEntitled("custom quiet hours"));
        }
        let resolved = self.parse(raw_schedule)?;
        tx.update_user_quiet_hours_schedule(user_id, raw_schedule.trim())
            .await?;
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quiet_hours_default_used_when_unset() {
        let store = EnterpriseUserQuietHoursScheduleStore::new("CRON_TZ=UTC 0 0 * * *", true).unwrap();
        let resolved = store.parse("").unwrap();
        assert!(!resolved.user_set);
        assert_eq!(resolved.schedule.unwrap().to_string(), "CRON_TZ=UTC 0 0 * * *");
    }

    #[test]
    fn test_quiet_hours_user_schedule() {
        let store = EnterpriseUserQuietHoursScheduleStore::new("CRON_TZ=UTC 0 0 * * *", true).unwrap();
        let resolved = store.parse("CRON_TZ=Europe/Paris 30 1 * * *").unwrap();
        assert!(resolved.user_set);
        assert!(resolved.user_can_set);
    }

    #[test]
    fn test_quiet_hours_user_schedule_ignored_when_not_allowed() {
        let store = EnterpriseUserQuietHoursScheduleStore::new("CRON_TZ=UTC 0 0 * * *", false).unwrap();
        let resolved = store.parse("CRON_TZ=Europe/Paris 30 1 * * *").unwrap();
        assert!(!resolved.user_set);
        assert_eq!(resolved.schedule.unwrap().location(), chrono_tz::Tz::UTC);
    }

    #[test]
    fn test_quiet_hours_rejects_multiple_times() {
        let store = EnterpriseUserQuietHoursScheduleStore::new("CRON_TZ=UTC 0 0 * * *", true).unwrap();
        assert!(matches!(
            store.parse("0 0,12 * * *"),
            Err(PolicyError::InvalidQuietHours(_))
        ));
        assert!(matches!(
            store.parse("0 0 * * 1"),
            Err(PolicyError::QuietHoursParse(_))
        ));
    }

    #[test]
    fn test_invalid_default_rejected() {
        assert!(EnterpriseUserQuietHoursScheduleStore::new("*/30 * * * *", true).is_err());
    }

    #[test]
    fn test_enterprise_resolves_all_template_fields() {
        let template = Template {
            allow_user_autostart: false,
            allow_user_autostop: true,
            default_ttl_ms: 3_600_000,
            failure_ttl_ms: 7_200_000,
            time_til_dormant_ms: 86_400_000,
            time_til_dormant_autodelete_ms: 172_800_000,
            autostop_requirement_days_of_week: 0b0100_0000,
            autostop_requirement_weeks: 2,
            autostart_allowed_days: 0b0011_1110,
            require_active_version: true,
            ..Default::default()
        };
        let policy = EnterpriseTemplateScheduleStore::resolve(&template);
        assert!(!policy.user_autostart_enabled);
        assert_eq!(policy.failure_ttl, Duration::hours(2));
        assert_eq!(policy.time_til_dormant, Duration::days(1));
        assert_eq!(policy.time_til_dormant_autodelete, Duration::days(2));
        assert_eq!(policy.autostop_requirement.weeks, 2);
        assert!(policy.require_active_version);

        let mut round_trip = Template::default();
        EnterpriseTemplateScheduleStore::apply(&mut round_trip, &policy);
        assert_eq!(EnterpriseTemplateScheduleStore::resolve(&round_trip), policy);
    }
}
