//! Business rule: a workspace gets at most one transition per tick, no
//! matter how many executors evaluate it.

mod common;

use anyhow::Result;
use async_trait::async_trait;
use autobuild::database::{MemoryStore, StoreTx, WorkspaceTransition};
use autobuild::lifecycle::ExecutorOptions;
use autobuild::services::{BuildOutcome, BuildRequest, StandardBuilder, WorkspaceBuilder};
use autobuild::LocalResourceLocks;
use chrono::Duration;
use common::fixtures::*;
use std::sync::Arc;
use tokio::sync::Notify;

/// Parks inside the transaction until released
struct GatedBuilder {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl WorkspaceBuilder for GatedBuilder {
    async fn build(&self, tx: &mut dyn StoreTx, request: BuildRequest<'_>) -> Result<BuildOutcome> {
        self.entered.notify_one();
        self.release.notified().await;
        StandardBuilder.build(tx, request).await
    }
}

fn due_for_autostop(store: &MemoryStore) -> WorkspaceSeed {
    let now = times::now();
    let seed = WorkspaceSeed::running(now - Duration::hours(8), Some(now));
    seed.insert(store);
    seed_provisioner(store, now);
    seed
}

#[tokio::test]
async fn test_concurrent_executors_build_once() {
    let store = MemoryStore::new();
    let seed = due_for_autostop(&store);
    let locks = Arc::new(LocalResourceLocks::new());

    let first = Harness::build(
        store.clone(),
        locks.clone(),
        Arc::new(StandardBuilder),
        ExecutorOptions::default(),
    );
    let second = Harness::build(
        store.clone(),
        locks.clone(),
        Arc::new(StandardBuilder),
        ExecutorOptions::default(),
    );

    let now = times::now();
    let (a, b) = tokio::join!(first.executor.run_once(now), second.executor.run_once(now));

    assert_eq!(a.transitions.len() + b.transitions.len(), 1);
    assert!(a.errors.is_empty() && b.errors.is_empty());

    let builds = store.builds(seed.workspace.id);
    assert_eq!(builds.len(), 2);
    assert_eq!(builds[1].transition, WorkspaceTransition::Stop);
}

#[tokio::test]
async fn test_lock_denied_while_evaluation_in_flight() {
    let store = MemoryStore::new();
    let seed = due_for_autostop(&store);
    let locks = Arc::new(LocalResourceLocks::new());
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());

    let gated = Harness::build(
        store.clone(),
        locks.clone(),
        Arc::new(GatedBuilder {
            entered: entered.clone(),
            release: release.clone(),
        }),
        ExecutorOptions::default(),
    );
    let other = Harness::build(
        store.clone(),
        locks.clone(),
        Arc::new(StandardBuilder),
        ExecutorOptions::default(),
    );

    let now = times::now();
    let executor = gated.executor.clone();
    let in_flight = tokio::spawn(async move { executor.run_once(now).await });

    entered.notified().await;
    assert!(locks.is_locked(&format!("autobuild:{}", seed.workspace.id)));

    let denied = other.executor.run_once(now).await;
    assert!(denied.transitions.is_empty());
    assert!(denied.errors.is_empty());

    release.notify_one();
    let stats = in_flight.await.unwrap();
    assert_eq!(
        stats.transitions.get(&seed.workspace.id),
        Some(&WorkspaceTransition::Stop)
    );
    assert_eq!(store.builds(seed.workspace.id).len(), 2);
    assert_eq!(locks.held_count(), 0);
}

#[tokio::test]
async fn test_store_rejects_duplicate_build_without_shared_locks() {
    let store = MemoryStore::new();
    let seed = due_for_autostop(&store);
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());

    // Separate lock tables, so only the datastore can arbitrate.
    let gated = Harness::build(
        store.clone(),
        Arc::new(LocalResourceLocks::new()),
        Arc::new(GatedBuilder {
            entered: entered.clone(),
            release: release.clone(),
        }),
        ExecutorOptions::default(),
    );
    let other = Harness::new(store.clone());

    let now = times::now();
    let executor = gated.executor.clone();
    let in_flight = tokio::spawn(async move { executor.run_once(now).await });
    entered.notified().await;

    let winner = other.executor.run_once(now).await;
    assert_eq!(winner.transitions.len(), 1);

    release.notify_one();
    let loser = in_flight.await.unwrap();
    assert!(loser.transitions.is_empty());
    assert!(loser.errors.contains_key(&seed.workspace.id));

    assert_eq!(store.builds(seed.workspace.id).len(), 2);
}
