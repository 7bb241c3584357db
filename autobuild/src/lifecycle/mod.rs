//! Workspace lifecycle: pure eligibility decisions and the executor that acts
//! on them.

pub mod eligibility;
pub mod executor;

pub use eligibility::{next_transition, truncate_minute, Decision, EligibilityRule, EvaluationInput};
pub use executor::{Collaborators, Executor, ExecutorOptions, Stats};
