//! Database record types (entities).
//!
//! Durations are stored as whole milliseconds, matching the on-disk schema.
//! Optional timestamps are `None` where the datastore holds NULL.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Enumerations
// ============================================================================

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(anyhow!("unknown {} {:?}", stringify!($name), other)),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceTransition {
    #[default]
    Start,
    Stop,
    Delete,
}

string_enum!(WorkspaceTransition {
    Start => "start",
    Stop => "stop",
    Delete => "delete",
});

/// Why a build was created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildReason {
    #[default]
    Initiator,
    Autostart,
    Autostop,
    Autodelete,
    Dormancy,
}

string_enum!(BuildReason {
    Initiator => "initiator",
    Autostart => "autostart",
    Autostop => "autostop",
    Autodelete => "autodelete",
    Dormancy => "dormancy",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionerJobStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

string_enum!(ProvisionerJobStatus {
    Pending => "pending",
    Running => "running",
    Succeeded => "succeeded",
    Failed => "failed",
    Canceled => "canceled",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    #[default]
    Active,
    Dormant,
    Suspended,
}

string_enum!(UserStatus {
    Active => "active",
    Dormant => "dormant",
    Suspended => "suspended",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutomaticUpdates {
    #[default]
    Never,
    Always,
}

string_enum!(AutomaticUpdates {
    Never => "never",
    Always => "always",
});

// ============================================================================
// Entities
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub status: UserStatus,
    /// Empty when the user never set their own quiet hours
    pub quiet_hours_schedule: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: Uuid,
    pub name: String,
    pub active_version_id: Uuid,
    pub require_active_version: bool,
    pub allow_user_autostart: bool,
    pub allow_user_autostop: bool,
    pub default_ttl_ms: i64,
    pub activity_bump_ms: i64,
    pub failure_ttl_ms: i64,
    pub time_til_dormant_ms: i64,
    pub time_til_dormant_autodelete_ms: i64,
    pub autostop_requirement_days_of_week: u8,
    pub autostop_requirement_weeks: i64,
    pub autostart_allowed_days: u8,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateVersion {
    pub id: Uuid,
    pub template_id: Uuid,
    pub name: String,
    pub message: String,
    /// Parameters a build must supply for this version
    pub required_parameters: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub template_id: Uuid,
    pub name: String,
    pub deleted: bool,
    pub autostart_schedule: Option<String>,
    pub ttl_ms: Option<i64>,
    pub automatic_updates: AutomaticUpdates,
    pub last_used_at: DateTime<Utc>,
    pub dormant_at: Option<DateTime<Utc>>,
    pub deleting_at: Option<DateTime<Utc>>,
    pub next_start_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Workspace {
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_ms.map(Duration::milliseconds)
    }

    pub fn is_dormant(&self) -> bool {
        self.dormant_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildParameter {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceBuild {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub build_number: i32,
    pub transition: WorkspaceTransition,
    pub reason: BuildReason,
    pub template_version_id: Uuid,
    pub job_id: Uuid,
    pub initiator_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub max_deadline: Option<DateTime<Utc>>,
    pub parameters: Vec<BuildParameter>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvisionerJob {
    pub id: Uuid,
    pub status: ProvisionerJobStatus,
    pub initiator_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProvisionerJob {
    pub fn failed(&self) -> bool {
        self.status == ProvisionerJobStatus::Failed
    }
}
