//! Shared test utilities:
//! - Seeded workspaces over the in-memory store
//! - An executor harness with recording collaborators
//! - A mock webhook server
//! - Common timestamps and schedules

// Not every test binary uses every fixture
#![allow(dead_code)]
#![allow(unused_imports)]

pub mod harness;
pub mod mock_webhook;
pub mod test_data;
pub mod workspace_seed;

pub use harness::{executor_for, Harness, RecordingAuditor, RecordingNotifier};
pub use mock_webhook::MockWebhookServer;
pub use test_data::*;
pub use workspace_seed::{seed_provisioner, WorkspaceSeed};
