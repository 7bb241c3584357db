pub mod config;
pub mod constants;
pub mod database;
pub mod errors;
pub mod lifecycle;
pub mod resource_lock;
pub mod schedule;
pub mod services;
pub mod swappable;

// Re-export commonly used types
pub use config::{Config, ConfigManager};
pub use database::{Database, LeaseLocks, MemoryStore, Store, StoreTx};
pub use lifecycle::{Collaborators, Executor, ExecutorOptions, Stats};
pub use resource_lock::{LocalResourceLocks, ResourceGuard, ResourceLocks};
pub use schedule::{Schedule, TemplateSchedulePolicy};
pub use swappable::Swappable;
