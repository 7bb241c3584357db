//! SQLite datastore, lease locks and audit log against a temporary database.

mod common;

use autobuild::database::{Database, ProvisionerJobStatus, Store, StoreTx, WorkspaceTransition};
use autobuild::services::AuditEntry;
use autobuild::ResourceLocks;
use chrono::Duration;
use common::fixtures::*;
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

async fn open_database() -> (TempDir, Database) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("autobuild.db");
    let database = Database::new(path.to_str().unwrap()).await.unwrap();
    (dir, database)
}

async fn insert_seed(database: &Database, seed: &WorkspaceSeed) {
    database.insert_user(&seed.user).await.unwrap();
    database.insert_template_version(&seed.version).await.unwrap();
    database.insert_template(&seed.template).await.unwrap();
    database.insert_workspace(&seed.workspace).await.unwrap();
    database
        .insert_build_with_job(&seed.build, &seed.job)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_seeded_records_read_back() {
    let (_dir, database) = open_database().await;
    let now = times::now();
    let mut seed = WorkspaceSeed::running(now - Duration::hours(1), Some(now + Duration::hours(7)));
    seed.workspace.autostart_schedule = Some(schedules::CHICAGO_8PM.to_string());
    seed.workspace.ttl_ms = Some(8 * durations::HOUR_MS);
    insert_seed(&database, &seed).await;

    let mut tx = database.begin().await.unwrap();
    assert_eq!(tx.get_workspace_by_id(seed.workspace.id).await.unwrap(), seed.workspace);
    assert_eq!(tx.get_user_by_id(seed.user.id).await.unwrap(), seed.user);
    assert_eq!(tx.get_template_by_id(seed.template.id).await.unwrap(), seed.template);
    assert_eq!(
        tx.get_template_version_by_id(seed.version.id).await.unwrap(),
        seed.version
    );
    assert_eq!(
        tx.get_latest_workspace_build_by_workspace_id(seed.workspace.id)
            .await
            .unwrap(),
        seed.build
    );
    assert_eq!(tx.get_provisioner_job_by_id(seed.job.id).await.unwrap(), seed.job);
}

#[tokio::test]
async fn test_prefilter_selects_due_workspaces() {
    let (_dir, database) = open_database().await;
    let now = times::now();

    let due = WorkspaceSeed::running(now - Duration::hours(8), Some(now));
    let not_due = WorkspaceSeed::running(now - Duration::hours(1), Some(now + Duration::hours(1)));
    let mut deleted = WorkspaceSeed::running(now - Duration::hours(8), Some(now));
    deleted.workspace.deleted = true;
    let mut idle = WorkspaceSeed::stopped(now - Duration::days(10));
    idle.template.time_til_dormant_ms = 7 * durations::DAY_MS;
    for seed in [&due, &not_due, &deleted, &idle] {
        insert_seed(&database, seed).await;
    }

    let candidates = database
        .get_workspaces_eligible_for_transition(now)
        .await
        .unwrap();
    let mut ids: Vec<Uuid> = candidates.iter().map(|w| w.id).collect();
    ids.sort();
    let mut expected = vec![due.workspace.id, idle.workspace.id];
    expected.sort();
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn test_dropped_transaction_rolls_back() {
    let (_dir, database) = open_database().await;
    let now = times::now();
    let seed = WorkspaceSeed::stopped(now);
    insert_seed(&database, &seed).await;

    {
        let mut tx = database.begin().await.unwrap();
        tx.update_workspace_next_start_at(seed.workspace.id, Some(now))
            .await
            .unwrap();
    }
    let mut tx = database.begin().await.unwrap();
    assert_eq!(
        tx.get_workspace_by_id(seed.workspace.id)
            .await
            .unwrap()
            .next_start_at,
        None
    );
    tx.update_workspace_next_start_at(seed.workspace.id, Some(now))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let mut tx = database.begin().await.unwrap();
    assert_eq!(
        tx.get_workspace_by_id(seed.workspace.id)
            .await
            .unwrap()
            .next_start_at,
        Some(now)
    );
}

#[tokio::test]
async fn test_dormancy_derives_deleting_at() {
    let (_dir, database) = open_database().await;
    let now = times::now();
    let mut seed = WorkspaceSeed::stopped(now - Duration::days(8));
    seed.template.time_til_dormant_autodelete_ms = 30 * durations::DAY_MS;
    insert_seed(&database, &seed).await;

    let mut tx = database.begin().await.unwrap();
    let updated = tx
        .update_workspace_dormant_deleting_at(seed.workspace.id, Some(now))
        .await
        .unwrap();
    assert_eq!(updated.dormant_at, Some(now));
    assert_eq!(updated.deleting_at, Some(now + Duration::days(30)));

    let cleared = tx
        .update_workspace_dormant_deleting_at(seed.workspace.id, None)
        .await
        .unwrap();
    assert_eq!(cleared.dormant_at, None);
    assert_eq!(cleared.deleting_at, None);
}

#[tokio::test]
async fn test_provisioner_availability_uses_heartbeat() {
    let (_dir, database) = open_database().await;
    let now = times::now();
    let daemon = Uuid::new_v4();

    let mut tx = database.begin().await.unwrap();
    assert!(!tx.has_available_provisioner(now).await.unwrap());
    drop(tx);

    database
        .upsert_provisioner_daemon(daemon, "provisioner-1", now - Duration::minutes(5))
        .await
        .unwrap();
    let mut tx = database.begin().await.unwrap();
    assert!(!tx.has_available_provisioner(now).await.unwrap());
    drop(tx);

    database
        .upsert_provisioner_daemon(daemon, "provisioner-1", now - Duration::seconds(30))
        .await
        .unwrap();
    let mut tx = database.begin().await.unwrap();
    assert!(tx.has_available_provisioner(now).await.unwrap());
}

#[tokio::test]
async fn test_lease_is_exclusive_until_released() {
    let (_dir, database) = open_database().await;
    let first = database.lease_locks(Duration::minutes(5));
    let second = database.lease_locks(Duration::minutes(5));
    assert_ne!(first.holder(), second.holder());

    let guard = first.try_lock("autobuild:one").await.unwrap().unwrap();
    assert_eq!(guard.resource(), "autobuild:one");
    assert!(second.try_lock("autobuild:one").await.unwrap().is_none());
    // Other resources are independent.
    assert!(second.try_lock("autobuild:two").await.unwrap().is_some());

    drop(guard);

    // Release runs on a spawned task.
    let mut acquired = None;
    for _ in 0..50 {
        if let Some(guard) = second.try_lock("autobuild:one").await.unwrap() {
            acquired = Some(guard);
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(acquired.is_some());
}

#[tokio::test]
async fn test_expired_lease_can_be_taken_over() {
    let (_dir, database) = open_database().await;
    // A lease that is already expired when written
    let crashed = database.lease_locks(Duration::seconds(-1));
    let survivor = database.lease_locks(Duration::minutes(5));

    let stale = crashed.try_lock("autobuild:one").await.unwrap().unwrap();
    let taken = survivor.try_lock("autobuild:one").await.unwrap();
    assert!(taken.is_some());

    // The stale holder's release does not drop the new lease.
    drop(stale);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let third = database.lease_locks(Duration::minutes(5));
    assert!(third.try_lock("autobuild:one").await.unwrap().is_none());
}

#[tokio::test]
async fn test_audit_log_round_trip() {
    let (_dir, database) = open_database().await;
    let now = times::now();
    let seed = WorkspaceSeed::stopped(now - Duration::days(8));
    let mut dormant = seed.workspace.clone();
    dormant.dormant_at = Some(now);

    database
        .store_audit_log(&AuditEntry::workspace_dormant(
            seed.workspace.clone(),
            dormant,
            true,
            now,
        ))
        .await
        .unwrap();

    let actions = database.get_audit_actions(seed.workspace.id).await.unwrap();
    assert_eq!(actions, vec!["workspace.dormant".to_string()]);
    assert!(database
        .get_audit_actions(Uuid::new_v4())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_executor_against_sqlite() {
    let (_dir, database) = open_database().await;
    let now = times::now();
    let seed = WorkspaceSeed::running(now - Duration::hours(8), Some(now));
    insert_seed(&database, &seed).await;
    database
        .upsert_provisioner_daemon(Uuid::new_v4(), "provisioner-1", now)
        .await
        .unwrap();

    let locks = Arc::new(database.lease_locks(Duration::minutes(5)));
    let database = Arc::new(database);
    let (executor, _audits, mut jobs) = executor_for(database.clone(), locks);

    let stats = executor.run_once(now).await;
    assert!(stats.errors.is_empty(), "{:?}", stats.errors);
    assert_eq!(
        stats.transitions.get(&seed.workspace.id),
        Some(&WorkspaceTransition::Stop)
    );

    let builds = database.list_workspace_builds(seed.workspace.id).await.unwrap();
    assert_eq!(builds.len(), 2);
    assert_eq!(builds[1].transition, WorkspaceTransition::Stop);

    let job = jobs.try_recv().unwrap();
    assert_eq!(job.id, builds[1].job_id);
    assert_eq!(job.status, ProvisionerJobStatus::Pending);

    // Nothing left to do on the next tick.
    let stats = executor.run_once(now + Duration::minutes(1)).await;
    assert!(stats.transitions.is_empty());
}

#[tokio::test]
async fn test_dormancy_is_persisted_with_sqlite() {
    let (_dir, database) = open_database().await;
    let now = times::now();
    let mut seed = WorkspaceSeed::stopped(now - Duration::days(8));
    seed.template.time_til_dormant_ms = 7 * durations::DAY_MS;
    insert_seed(&database, &seed).await;

    let database = Arc::new(database);
    let (executor, audits, _jobs) =
        executor_for(database.clone(), Arc::new(autobuild::LocalResourceLocks::new()));

    let stats = executor.run_once(now).await;
    assert!(stats.errors.is_empty(), "{:?}", stats.errors);

    let mut tx = database.begin().await.unwrap();
    let workspace = tx.get_workspace_by_id(seed.workspace.id).await.unwrap();
    assert_eq!(workspace.dormant_at, Some(now));
    assert_eq!(audits.entries().len(), 1);
    assert!(audits.entries()[0].success);
}
