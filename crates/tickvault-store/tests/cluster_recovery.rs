// Cluster scenarios: two peers on one database file, stale-heartbeat
// failover, first-check-in self-recovery, and standalone startup recovery.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use rusqlite::Connection;
use tickvault_store::{
    JobDetail, JobStore, Key, StoreConfig, Trigger, TriggerState, RECOVERY_TRIGGER_GROUP,
};

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn open_peer(db: &Path, instance: &str, checkin_interval_ms: i64) -> JobStore {
    let cfg = StoreConfig {
        instance_id: instance.to_string(),
        is_clustered: true,
        cluster_checkin_interval_ms: checkin_interval_ms,
        data_source: db.to_string_lossy().into_owned(),
        ..StoreConfig::default()
    };
    JobStore::open(cfg).unwrap()
}

fn recoverable_job(group: &str, name: &str) -> JobDetail {
    let mut j = JobDetail::new(Key::new(group, name), "demo::ReplayJob");
    j.durable = true;
    j.stateful = true;
    j.requests_recovery = true;
    j
}

fn table_count(db: &Path, sql: &str) -> i64 {
    let conn = Connection::open(db).unwrap();
    conn.query_row(sql, [], |row| row.get(0)).unwrap()
}

#[test]
fn stale_peer_is_recovered_by_live_peer() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("cluster.db");
    let now = now_ms();

    // Peer A checks in with a tiny interval so it goes stale fast.
    let a = open_peer(&db, "node-a", 20);
    a.scheduler_started().unwrap();

    let j = recoverable_job("g", "replay");
    let t = Trigger::one_shot(Key::new("g", "t"), j.key.clone(), now - 100);
    a.store_job(&j, false).unwrap();
    a.store_trigger(&t, false).unwrap();

    let acquired = a.acquire_next_trigger(now).unwrap().unwrap();
    let scheduled = acquired.next_fire_time_ms.unwrap();
    assert_eq!(
        a.trigger_state(&t.key).unwrap(),
        Some(TriggerState::Acquired)
    );

    // A dies here (no more check-ins). Wait past interval × failure factor.
    std::thread::sleep(Duration::from_millis(250));

    let b = open_peer(&db, "node-b", 5_000);
    let recovered = b.do_checkin().unwrap();
    assert!(recovered, "B should have detected and recovered A");

    // (a) A's fired-trigger rows are gone.
    assert_eq!(
        table_count(&db, "SELECT COUNT(*) FROM fired_triggers WHERE instance_id = 'node-a'"),
        0
    );
    // (b) A recovery trigger exists with the original fire time.
    let names = b.trigger_names(RECOVERY_TRIGGER_GROUP).unwrap();
    assert_eq!(names.len(), 1);
    assert!(names[0].starts_with("recover_node-a_"));
    let recovery = b
        .retrieve_trigger(&Key::new(RECOVERY_TRIGGER_GROUP, names[0].clone()))
        .unwrap()
        .unwrap();
    assert_eq!(recovery.next_fire_time_ms, Some(scheduled));
    assert_eq!(recovery.job_key, j.key);
    // (c) The original trigger is back to WAITING.
    assert_eq!(
        b.trigger_state(&t.key).unwrap(),
        Some(TriggerState::Waiting)
    );
    // (d) A's scheduler-state row is gone; B's is present.
    assert_eq!(
        table_count(&db, "SELECT COUNT(*) FROM scheduler_state WHERE instance_id = 'node-a'"),
        0
    );
    assert_eq!(
        table_count(&db, "SELECT COUNT(*) FROM scheduler_state WHERE instance_id = 'node-b'"),
        1
    );

    // The recovery firing announces itself as such.
    let reacquired = b.acquire_next_trigger(now_ms() + 1_000).unwrap().unwrap();
    if reacquired.key.group == RECOVERY_TRIGGER_GROUP {
        let bundle = b.trigger_fired(&reacquired).unwrap().unwrap();
        assert!(bundle.recovering);
    }
}

#[test]
fn two_peers_never_acquire_the_same_trigger() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("cluster.db");
    let now = now_ms();

    let a = open_peer(&db, "node-a", 5_000);
    let b = open_peer(&db, "node-b", 5_000);

    let j = recoverable_job("g", "shared");
    a.store_job(&j, false).unwrap();
    for name in ["t1", "t2"] {
        let t = Trigger::one_shot(Key::new("g", name), j.key.clone(), now - 100);
        a.store_trigger(&t, false).unwrap();
    }

    let first = a.acquire_next_trigger(now).unwrap().unwrap();
    let second = b.acquire_next_trigger(now).unwrap().unwrap();
    assert_ne!(first.key, second.key, "each trigger goes to one peer only");
    assert!(a.acquire_next_trigger(now).unwrap().is_none());
}

#[test]
fn first_checkin_recovers_own_stale_row() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("cluster.db");
    let now = now_ms();

    // First incarnation of node-a acquires work, then "crashes".
    let a1 = open_peer(&db, "node-a", 5_000);
    a1.scheduler_started().unwrap();
    let j = recoverable_job("g", "replay");
    let t = Trigger::one_shot(Key::new("g", "t"), j.key.clone(), now - 100);
    a1.store_job(&j, false).unwrap();
    a1.store_trigger(&t, false).unwrap();
    a1.acquire_next_trigger(now).unwrap().unwrap();
    drop(a1);

    // Second incarnation under the same instance id. Its heartbeat is
    // fresh, so only the first-check-in rule can recover the old work.
    let a2 = open_peer(&db, "node-a", 5_000);
    let recovered = a2.do_checkin().unwrap();
    assert!(recovered, "own stale row must be treated as a failed peer");

    assert_eq!(
        a2.trigger_state(&t.key).unwrap(),
        Some(TriggerState::Waiting)
    );
    assert_eq!(a2.trigger_names(RECOVERY_TRIGGER_GROUP).unwrap().len(), 1);
    assert_eq!(
        table_count(&db, "SELECT COUNT(*) FROM fired_triggers"),
        0
    );
    // Our own state row survives (it was refreshed, not deleted).
    assert_eq!(
        table_count(&db, "SELECT COUNT(*) FROM scheduler_state WHERE instance_id = 'node-a'"),
        1
    );

    // The second check-in is no longer "first": nothing new to recover.
    assert!(!a2.do_checkin().unwrap());
    assert_eq!(a2.trigger_names(RECOVERY_TRIGGER_GROUP).unwrap().len(), 1);
}

#[test]
fn standalone_restart_resets_in_flight_work() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("solo.db");
    let now = now_ms();

    let cfg = StoreConfig {
        instance_id: "solo".to_string(),
        data_source: db.to_string_lossy().into_owned(),
        ..StoreConfig::default()
    };
    let first = JobStore::open(cfg.clone()).unwrap();

    let j = recoverable_job("g", "replay");
    let t = Trigger::one_shot(Key::new("g", "t"), j.key.clone(), now - 100);
    first.store_job(&j, false).unwrap();
    first.store_trigger(&t, false).unwrap();
    first.acquire_next_trigger(now).unwrap().unwrap();

    // Volatile definitions that must not survive the restart.
    let mut vol_job = JobDetail::new(Key::new("g", "ephemeral"), "demo::TempJob");
    vol_job.volatile = true;
    let mut vol_trigger =
        Trigger::one_shot(Key::new("g", "vt"), vol_job.key.clone(), now + 60_000);
    vol_trigger.volatile = true;
    first.store_job_and_trigger(&vol_job, &vol_trigger).unwrap();
    drop(first);

    let second = JobStore::open(cfg).unwrap();
    second.scheduler_started().unwrap();

    assert_eq!(
        second.trigger_state(&t.key).unwrap(),
        Some(TriggerState::Waiting)
    );
    assert_eq!(second.trigger_names(RECOVERY_TRIGGER_GROUP).unwrap().len(), 1);
    assert_eq!(table_count(&db, "SELECT COUNT(*) FROM fired_triggers"), 0);
    assert!(second.retrieve_job(&vol_job.key).unwrap().is_none());
    assert!(second.retrieve_trigger(&vol_trigger.key).unwrap().is_none());
}

#[test]
fn healthy_peer_is_left_alone() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("cluster.db");

    let a = open_peer(&db, "node-a", 5_000);
    a.scheduler_started().unwrap();

    let b = open_peer(&db, "node-b", 5_000);
    assert!(!b.do_checkin().unwrap(), "a fresh heartbeat is not a failure");
    assert_eq!(
        table_count(&db, "SELECT COUNT(*) FROM scheduler_state"),
        2
    );
}
