//! Per-user quiet hours and the baseline store.
//!
//! Quiet hours are a daily schedule with a single time of day. Compliance
//! restarts driven by a template's autostop requirement land on that time.

use async_trait::async_trait;
use uuid::Uuid;

use super::cron::Schedule;
use crate::database::StoreTx;
use crate::errors::PolicyError;

/// Resolved quiet hours of one user
#[derive(Debug, Clone, Default)]
pub struct UserQuietHoursSchedule {
    /// `None` when quiet hours are not entitled, so no max deadline applies
    pub schedule: Option<Schedule>,
    /// Whether the schedule comes from the user rather than the deployment default
    pub user_set: bool,
    pub user_can_set: bool,
}

#[async_trait]
pub trait UserQuietHoursScheduleStore: Send + Sync {
    async fn get(
        &self,
        tx: &mut dyn StoreTx,
        user_id: Uuid,
    ) -> Result<UserQuietHoursSchedule, PolicyError>;

    /// Store the user's raw schedule. An empty string restores the default.
    async fn set(
        &self,
        tx: &mut dyn StoreTx,
        user_id: Uuid,
        raw_schedule: &str,
    ) -> Result<UserQuietHoursSchedule, PolicyError>;
}

/// No quiet hours: workspaces never get a max deadline.
#[derive(Debug, Default, Clone, Copy)]
pub struct BaselineUserQuietHoursScheduleStore;

#[async_trait]
impl UserQuietHoursScheduleStore for BaselineUserQuietHoursScheduleStore {
    async fn get(
        &self,
        _tx: &mut dyn StoreTx,
        _user_id: Uuid,
    ) -> Result<UserQuietHoursSchedule, PolicyError> {
        Ok(UserQuietHoursSchedule::default())
    }

    async fn set(
        &self,
        _tx: &mut dyn StoreTx,
        _user_id: Uuid,
        _raw_schedule: &str,
    ) -> Result<UserQuietHoursSchedule, PolicyError> {
        Err(PolicyError::NotEntitled("custom quiet hours"))
    }
}
