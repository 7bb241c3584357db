//! Template schedule policy and its baseline store.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc, Weekday};
use tracing::debug;
use uuid::Uuid;

use crate::constants::autostop::MAX_REQUIREMENT_WEEKS;
use crate::database::{StoreTx, Template};
use crate::errors::PolicyError;

/// Every day of the week, bit 0 is Sunday
pub const ALL_DAYS: u8 = 0b0111_1111;

/// Bit for `day` in a days-of-week mask
pub fn weekday_bit(day: Weekday) -> u8 {
    1 << day.num_days_from_sunday()
}

/// Days on which a running workspace must be restarted, every `weeks` weeks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutostopRequirement {
    pub days_of_week: u8,
    /// 0 and 1 both mean every week
    pub weeks: i64,
}

impl Default for AutostopRequirement {
    fn default() -> Self {
        Self {
            days_of_week: 0,
            weeks: 1,
        }
    }
}

impl AutostopRequirement {
    pub fn is_enabled(&self) -> bool {
        self.days_of_week != 0
    }

    pub fn allows(&self, day: Weekday) -> bool {
        self.days_of_week & weekday_bit(day) != 0
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.days_of_week & 0b1000_0000 != 0 {
            return Err(PolicyError::InvalidAutostopRequirement(
                "days of week must not set bit 7".to_string(),
            ));
        }
        if !(0..=MAX_REQUIREMENT_WEEKS).contains(&self.weeks) {
            return Err(PolicyError::InvalidAutostopRequirement(format!(
                "weeks must be between 0 and {}",
                MAX_REQUIREMENT_WEEKS
            )));
        }
        Ok(())
    }
}

/// Days on which autostart may fire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutostartRequirement {
    pub days_of_week: u8,
}

impl Default for AutostartRequirement {
    fn default() -> Self {
        Self {
            days_of_week: ALL_DAYS,
        }
    }
}

impl AutostartRequirement {
    pub fn allows(&self, day: Weekday) -> bool {
        self.days_of_week & weekday_bit(day) != 0
    }
}

/// Resolved scheduling policy of a template
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateSchedulePolicy {
    pub user_autostart_enabled: bool,
    pub user_autostop_enabled: bool,
    pub default_ttl: Duration,
    pub activity_bump: Duration,
    pub autostop_requirement: AutostopRequirement,
    pub autostart_requirement: AutostartRequirement,
    pub failure_ttl: Duration,
    pub time_til_dormant: Duration,
    pub time_til_dormant_autodelete: Duration,
    pub require_active_version: bool,
}

impl Default for TemplateSchedulePolicy {
    fn default() -> Self {
        Self {
            user_autostart_enabled: true,
            user_autostop_enabled: true,
            default_ttl: Duration::zero(),
            activity_bump: Duration::hours(1),
            autostop_requirement: AutostopRequirement::default(),
            autostart_requirement: AutostartRequirement::default(),
            failure_ttl: Duration::zero(),
            time_til_dormant: Duration::zero(),
            time_til_dormant_autodelete: Duration::zero(),
            require_active_version: false,
        }
    }
}

#[async_trait]
pub trait TemplateScheduleStore: Send + Sync {
    async fn get(
        &self,
        tx: &mut dyn StoreTx,
        template_id: Uuid,
    ) -> Result<TemplateSchedulePolicy, PolicyError>;

    /// Persist `policy` for the template and return what `get` now resolves.
    async fn set(
        &self,
        tx: &mut dyn StoreTx,
        template_id: Uuid,
        policy: &TemplateSchedulePolicy,
        now: DateTime<Utc>,
    ) -> Result<TemplateSchedulePolicy, PolicyError>;
}

/// Permissive store: only the default TTL and activity bump are honoured.
#[derive(Debug, Default, Clone, Copy)]
pub struct BaselineTemplateScheduleStore;

impl BaselineTemplateScheduleStore {
    fn resolve(template: &Template) -> TemplateSchedulePolicy {
        TemplateSchedulePolicy {
            default_ttl: Duration::milliseconds(template.default_ttl_ms),
            activity_bump: Duration::milliseconds(template.activity_bump_ms),
            ..TemplateSchedulePolicy::default()
        }
    }
}

#[async_trait]
impl TemplateScheduleStore for BaselineTemplateScheduleStore {
    async fn get(
        &self,
        tx: &mut dyn StoreTx,
        template_id: Uuid,
    ) -> Result<TemplateSchedulePolicy, PolicyError> {
        let template = tx.get_template_by_id(template_id).await?;
        Ok(Self::resolve(&template))
    }

    async fn set(
        &self,
        tx: &mut dyn StoreTx,
        template_id: Uuid,
        policy: &TemplateSchedulePolicy,
        now: DateTime<Utc>,
    ) -> Result<TemplateSchedulePolicy, PolicyError> {
        let mut template = tx.get_template_by_id(template_id).await?;
        let default_ttl_ms = policy.default_ttl.num_milliseconds();
        let activity_bump_ms = policy.activity_bump.num_milliseconds();

        if template.default_ttl_ms == default_ttl_ms && template.activity_bump_ms == activity_bump_ms {
            return Ok(Self::resolve(&template));
        }

        debug!("Updating default TTL of template {}", template_id);
        template.default_ttl_ms = default_ttl_ms;
        template.activity_bump_ms = activity_bump_ms;
        template.updated_at = now;
        tx.update_template_schedule(&template).await?;
        Ok(Self::resolve(&template))
    }
}
