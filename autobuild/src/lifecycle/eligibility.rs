//! Pure lifecycle decisions.
//!
//! Given a workspace's current state and its resolved template policy, decide
//! the single next transition. Nothing here reads a clock or the datastore;
//! the caller passes the tick.
//!
//! # Priority
//!
//! Rules are checked in [`EligibilityRule::PRIORITY`] order and the first
//! match wins:
//!
//! 1. autostop
//! 2. autostart
//! 3. failed build stop
//! 4. dormancy
//! 5. dormant auto-delete
//!
//! A workspace that is both past its deadline and due for autostart is
//! stopped, a failed workspace is stopped before it is considered for
//! dormancy, and so on.

use chrono::{DateTime, Duration, Timelike, Utc};

use crate::constants::executor::FAILED_DELETE_RETRY_HOURS;
use crate::database::{
    BuildReason, ProvisionerJob, User, UserStatus, Workspace, WorkspaceBuild, WorkspaceTransition,
};
use crate::schedule::{next_autostart, TemplateSchedulePolicy};

/// Everything a decision depends on
#[derive(Debug, Clone, Copy)]
pub struct EvaluationInput<'a> {
    pub user: &'a User,
    pub workspace: &'a Workspace,
    pub build: &'a WorkspaceBuild,
    pub job: &'a ProvisionerJob,
    pub policy: &'a TemplateSchedulePolicy,
    /// Current tick, truncated to the minute
    pub now: DateTime<Utc>,
}

/// Outcome of a matching rule.
///
/// `transition` is `None` only for dormancy of a workspace that is not
/// running: nothing is built but the workspace is still marked dormant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub transition: Option<WorkspaceTransition>,
    pub reason: BuildReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EligibilityRule {
    Autostop,
    Autostart,
    FailedStop,
    DormantStop,
    Delete,
}

impl EligibilityRule {
    /// Evaluation order, highest priority first
    pub const PRIORITY: [EligibilityRule; 5] = [
        EligibilityRule::Autostop,
        EligibilityRule::Autostart,
        EligibilityRule::FailedStop,
        EligibilityRule::DormantStop,
        EligibilityRule::Delete,
    ];

    pub fn evaluate(self, input: &EvaluationInput<'_>) -> Option<Decision> {
        match self {
            Self::Autostop => is_eligible_for_autostop(input).then_some(Decision {
                transition: Some(WorkspaceTransition::Stop),
                reason: BuildReason::Autostop,
            }),
            Self::Autostart => is_eligible_for_autostart(input).then_some(Decision {
                transition: Some(WorkspaceTransition::Start),
                reason: BuildReason::Autostart,
            }),
            Self::FailedStop => is_eligible_for_failed_stop(input).then_some(Decision {
                transition: Some(WorkspaceTransition::Stop),
                reason: BuildReason::Autostop,
            }),
            Self::DormantStop => is_eligible_for_dormant_stop(input).then(|| Decision {
                transition: (input.build.transition == WorkspaceTransition::Start)
                    .then_some(WorkspaceTransition::Stop),
                reason: BuildReason::Dormancy,
            }),
            Self::Delete => is_eligible_for_delete(input).then_some(Decision {
                transition: Some(WorkspaceTransition::Delete),
                reason: BuildReason::Autodelete,
            }),
        }
    }
}

/// The next lifecycle decision, or `None` when the workspace is not eligible.
pub fn next_transition(input: &EvaluationInput<'_>) -> Option<Decision> {
    EligibilityRule::PRIORITY
        .iter()
        .find_map(|rule| rule.evaluate(input))
}

pub fn is_eligible_for_autostop(input: &EvaluationInput<'_>) -> bool {
    if input.build.transition != WorkspaceTransition::Start {
        return false;
    }
    if input.user.status == UserStatus::Suspended {
        return true;
    }
    !input.job.failed()
        && !input.workspace.is_dormant()
        && input.build.deadline.is_some_and(|deadline| input.now >= deadline)
}

pub fn is_eligible_for_autostart(input: &EvaluationInput<'_>) -> bool {
    if input.user.status != UserStatus::Active
        || input.job.failed()
        || input.workspace.is_dormant()
        || input.build.transition != WorkspaceTransition::Stop
        || !input.policy.user_autostart_enabled
    {
        return false;
    }

    let Some(raw) = input
        .workspace
        .autostart_schedule
        .as_deref()
        .filter(|raw| !raw.is_empty())
    else {
        return false;
    };

    match next_autostart(input.build.created_at, raw, input.policy) {
        Some((next, true)) => truncate_minute(next) <= input.now,
        _ => false,
    }
}

pub fn is_eligible_for_failed_stop(input: &EvaluationInput<'_>) -> bool {
    let failure_ttl = input.policy.failure_ttl;
    failure_ttl > Duration::zero()
        && input.job.failed()
        && input.build.transition == WorkspaceTransition::Start
        && input
            .job
            .completed_at
            .is_some_and(|completed| input.now - completed > failure_ttl)
}

pub fn is_eligible_for_dormant_stop(input: &EvaluationInput<'_>) -> bool {
    let time_til_dormant = input.policy.time_til_dormant;
    !input.workspace.is_dormant()
        && time_til_dormant > Duration::zero()
        && input.now - input.workspace.last_used_at > time_til_dormant
}

pub fn is_eligible_for_delete(input: &EvaluationInput<'_>) -> bool {
    let Some(deleting_at) = input.workspace.deleting_at else {
        return false;
    };
    if !input.workspace.is_dormant()
        || input.policy.time_til_dormant_autodelete <= Duration::zero()
        || input.now <= deleting_at
    {
        return false;
    }

    // Back off after a failed delete.
    if input.build.transition == WorkspaceTransition::Delete && input.job.failed() {
        return input.job.completed_at.is_some_and(|completed| {
            input.now - completed > Duration::hours(FAILED_DELETE_RETRY_HOURS)
        });
    }
    true
}

/// Drop seconds and sub-seconds.
pub fn truncate_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    at - Duration::seconds(i64::from(at.second())) - Duration::nanoseconds(i64::from(at.nanosecond()))
}
