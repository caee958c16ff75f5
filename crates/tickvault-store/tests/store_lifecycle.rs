// End-to-end lifecycle scenarios against a real database file: store,
// acquire, fire, complete, pause/resume, misfire handling.

use chrono::Utc;
use tickvault_store::{
    Calendar, CompletedInstruction, JobDetail, JobStore, Key, MisfirePolicy, StoreConfig,
    StoreError, Trigger, TriggerPayload, TriggerState,
};

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn open_store(dir: &tempfile::TempDir, instance: &str) -> JobStore {
    let cfg = StoreConfig {
        instance_id: instance.to_string(),
        data_source: dir
            .path()
            .join("store.db")
            .to_string_lossy()
            .into_owned(),
        misfire_threshold_ms: 5_000,
        ..StoreConfig::default()
    };
    JobStore::open(cfg).unwrap()
}

fn job(group: &str, name: &str) -> JobDetail {
    JobDetail::new(Key::new(group, name), "demo::PrintJob")
}

fn repeating(key: Key, job_key: Key, start: i64, interval: i64) -> Trigger {
    Trigger::new(
        key,
        job_key,
        start,
        TriggerPayload::Simple {
            repeat_interval_ms: interval,
            repeat_count: -1,
            times_triggered: 0,
        },
    )
}

#[test]
fn happy_path_fire_once_and_auto_complete() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, "node-1");
    let now = now_ms();

    let j = job("g", "j1");
    let t = Trigger::one_shot(Key::new("g", "t1"), j.key.clone(), now + 1_000);
    store.store_job(&j, false).unwrap();
    store.store_trigger(&t, false).unwrap();

    let acquired = store
        .acquire_next_trigger(now + 1_500)
        .unwrap()
        .expect("trigger should be acquirable");
    assert_eq!(acquired.key, t.key);
    assert!(acquired.fire_instance_id.is_some());
    assert_eq!(
        store.trigger_state(&t.key).unwrap(),
        Some(TriggerState::Acquired)
    );

    let bundle = store
        .trigger_fired(&acquired)
        .unwrap()
        .expect("fired bundle");
    assert_eq!(bundle.scheduled_fire_time_ms, now + 1_000);
    assert_eq!(bundle.prev_fire_time_ms, Some(now + 1_000));
    assert_eq!(bundle.next_fire_time_ms, None);
    assert!(!bundle.recovering);
    assert_eq!(
        store.trigger_state(&t.key).unwrap(),
        Some(TriggerState::Executing)
    );

    store
        .triggered_job_complete(&bundle.trigger, &bundle.job, CompletedInstruction::NoInstruction)
        .unwrap();

    // Exhausted one-shot trigger is gone, and the non-durable job with it.
    assert!(store.retrieve_trigger(&t.key).unwrap().is_none());
    assert!(store.retrieve_job(&j.key).unwrap().is_none());
}

#[test]
fn job_round_trip_preserves_payload_and_flags() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, "node-1");

    let mut j = job("g", "payload");
    j.durable = true;
    j.stateful = true;
    j.requests_recovery = true;
    j.description = Some("keeps state".to_string());
    j.data
        .insert("retries".to_string(), serde_json::Value::from(3));
    j.data.insert(
        "target".to_string(),
        serde_json::Value::String("eu-west".to_string()),
    );

    store.store_job(&j, false).unwrap();
    let loaded = store.retrieve_job(&j.key).unwrap().unwrap();
    assert_eq!(loaded, j);
}

#[test]
fn duplicate_job_without_replace_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, "node-1");

    let j = job("g", "dup");
    store.store_job(&j, false).unwrap();
    let err = store.store_job(&j, false).unwrap_err();
    assert!(matches!(err, StoreError::ObjectAlreadyExists { .. }));
    assert_eq!(err.code(), "OBJECT_ALREADY_EXISTS");
}

#[test]
fn store_trigger_with_replace_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, "node-1");
    let now = now_ms();

    let mut j = job("g", "j");
    j.durable = true;
    store.store_job(&j, false).unwrap();

    let t = repeating(Key::new("g", "t"), j.key.clone(), now + 60_000, 10_000);
    store.store_trigger(&t, true).unwrap();
    store.store_trigger(&t, true).unwrap();

    assert_eq!(store.num_triggers().unwrap(), 1);
    let loaded = store.retrieve_trigger(&t.key).unwrap().unwrap();
    assert_eq!(loaded.payload, t.payload);
    assert_eq!(loaded.next_fire_time_ms, Some(now + 60_000));
}

#[test]
fn volatile_job_with_nonvolatile_trigger_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, "node-1");
    let now = now_ms();

    let mut j = job("g", "volatile");
    j.volatile = true;
    let t = Trigger::one_shot(Key::new("g", "t"), j.key.clone(), now + 1_000);

    let err = store.store_job_and_trigger(&j, &t).unwrap_err();
    assert_eq!(err.code(), "CLIENT_ERROR");
    // The whole transaction rolled back: no job row either.
    assert!(store.retrieve_job(&j.key).unwrap().is_none());
    assert!(store.retrieve_trigger(&t.key).unwrap().is_none());
}

#[test]
fn paused_group_catches_new_triggers() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, "node-1");
    let now = now_ms();

    let mut j = job("g", "j");
    j.durable = true;
    store.store_job(&j, false).unwrap();

    store.pause_trigger_group("g").unwrap();
    assert_eq!(store.paused_trigger_groups().unwrap(), vec!["g"]);

    let t = Trigger::one_shot(Key::new("g", "t2"), j.key.clone(), now + 60_000);
    store.store_trigger(&t, false).unwrap();
    assert_eq!(
        store.trigger_state(&t.key).unwrap(),
        Some(TriggerState::Paused)
    );

    store.resume_trigger_group("g").unwrap();
    assert_eq!(
        store.trigger_state(&t.key).unwrap(),
        Some(TriggerState::Waiting)
    );
    assert!(store.paused_trigger_groups().unwrap().is_empty());
}

#[test]
fn stateful_job_blocks_sibling_triggers_while_executing() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, "node-1");
    let now = now_ms();

    let mut j = job("g", "stateful");
    j.durable = true;
    j.stateful = true;
    store.store_job(&j, false).unwrap();

    let ta = repeating(Key::new("g", "ta"), j.key.clone(), now - 100, 60_000);
    let tb = repeating(Key::new("g", "tb"), j.key.clone(), now + 30_000, 60_000);
    store.store_trigger(&ta, false).unwrap();
    store.store_trigger(&tb, false).unwrap();

    let acquired = store.acquire_next_trigger(now).unwrap().unwrap();
    assert_eq!(acquired.key, ta.key);

    let bundle = store.trigger_fired(&acquired).unwrap().unwrap();
    assert_eq!(
        store.trigger_state(&ta.key).unwrap(),
        Some(TriggerState::Executing)
    );
    assert_eq!(
        store.trigger_state(&tb.key).unwrap(),
        Some(TriggerState::Blocked)
    );

    store
        .triggered_job_complete(&bundle.trigger, &bundle.job, CompletedInstruction::NoInstruction)
        .unwrap();
    assert_eq!(
        store.trigger_state(&ta.key).unwrap(),
        Some(TriggerState::Waiting)
    );
    assert_eq!(
        store.trigger_state(&tb.key).unwrap(),
        Some(TriggerState::Waiting)
    );
}

#[test]
fn stateful_completion_persists_mutated_payload() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, "node-1");
    let now = now_ms();

    let mut j = job("g", "counter");
    j.durable = true;
    j.stateful = true;
    j.data
        .insert("count".to_string(), serde_json::Value::from(0));
    store.store_job(&j, false).unwrap();

    let t = repeating(Key::new("g", "t"), j.key.clone(), now - 100, 60_000);
    store.store_trigger(&t, false).unwrap();

    let acquired = store.acquire_next_trigger(now).unwrap().unwrap();
    let bundle = store.trigger_fired(&acquired).unwrap().unwrap();

    // The job mutates its payload during the run.
    let mut done = bundle.job.clone();
    done.data
        .insert("count".to_string(), serde_json::Value::from(1));
    store
        .triggered_job_complete(&bundle.trigger, &done, CompletedInstruction::NoInstruction)
        .unwrap();

    let reloaded = store.retrieve_job(&j.key).unwrap().unwrap();
    assert_eq!(reloaded.data["count"], serde_json::Value::from(1));
}

#[test]
fn misfired_fire_now_trigger_is_recovered_and_reacquirable() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, "node-1");
    let now = now_ms();

    let mut j = job("g", "late");
    j.durable = true;
    store.store_job(&j, false).unwrap();

    let mut t = Trigger::one_shot(Key::new("g", "t"), j.key.clone(), now - 60_000);
    t.misfire_policy = MisfirePolicy::FireNow;
    store.store_trigger(&t, false).unwrap();

    let more = store.recover_misfires().unwrap();
    assert!(!more);

    let recovered = store.retrieve_trigger(&t.key).unwrap().unwrap();
    let next = recovered.next_fire_time_ms.unwrap();
    assert!(next >= now, "fire-now should move the fire time to now");
    assert_eq!(
        store.trigger_state(&t.key).unwrap(),
        Some(TriggerState::Waiting)
    );

    // A second pass finds nothing: the policy applied exactly once.
    store.recover_misfires().unwrap();
    let again = store.retrieve_trigger(&t.key).unwrap().unwrap();
    assert_eq!(again.next_fire_time_ms, Some(next));

    let acquired = store.acquire_next_trigger(now_ms() + 1_000).unwrap();
    assert_eq!(acquired.unwrap().key, t.key);
}

#[test]
fn do_nothing_trigger_is_skipped_by_misfire_scan() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, "node-1");
    let now = now_ms();

    let mut j = job("g", "late");
    j.durable = true;
    store.store_job(&j, false).unwrap();

    let mut t = repeating(Key::new("g", "t"), j.key.clone(), now - 600_000, 60_000);
    t.misfire_policy = MisfirePolicy::DoNothing;
    store.store_trigger(&t, false).unwrap();
    let stored_next = store
        .retrieve_trigger(&t.key)
        .unwrap()
        .unwrap()
        .next_fire_time_ms;

    store.recover_misfires().unwrap();
    let after = store.retrieve_trigger(&t.key).unwrap().unwrap();
    assert_eq!(after.next_fire_time_ms, stored_next);
}

#[test]
fn replace_trigger_requires_same_job() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, "node-1");
    let now = now_ms();

    let mut j1 = job("g", "j1");
    j1.durable = true;
    let mut j2 = job("g", "j2");
    j2.durable = true;
    store.store_job(&j1, false).unwrap();
    store.store_job(&j2, false).unwrap();

    let t = Trigger::one_shot(Key::new("g", "t"), j1.key.clone(), now + 60_000);
    store.store_trigger(&t, false).unwrap();

    let wrong_job = Trigger::one_shot(Key::new("g", "t"), j2.key.clone(), now + 120_000);
    assert!(matches!(
        store.replace_trigger(&t.key, &wrong_job),
        Err(StoreError::Client(_))
    ));

    let replacement = Trigger::one_shot(Key::new("g", "t"), j1.key.clone(), now + 120_000);
    assert!(store.replace_trigger(&t.key, &replacement).unwrap());
    let loaded = store.retrieve_trigger(&t.key).unwrap().unwrap();
    assert_eq!(loaded.next_fire_time_ms, Some(now + 120_000));
    assert_eq!(store.num_triggers().unwrap(), 1);

    // Replacing a missing trigger reports not-found.
    assert!(!store
        .replace_trigger(&Key::new("g", "ghost"), &replacement)
        .unwrap());
}

#[test]
fn calendar_removal_blocked_while_referenced() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, "node-1");
    let now = now_ms();

    let cal = Calendar::WeeklyDays {
        excluded_days: vec![5, 6],
    };
    store.store_calendar("weekdays", &cal, false, false).unwrap();

    let mut j = job("g", "j");
    j.durable = true;
    store.store_job(&j, false).unwrap();
    let mut t = repeating(Key::new("g", "t"), j.key.clone(), now + 60_000, 60_000);
    t.calendar_name = Some("weekdays".to_string());
    store.store_trigger(&t, false).unwrap();

    let err = store.remove_calendar("weekdays").unwrap_err();
    assert_eq!(err.code(), "CLIENT_ERROR");

    assert!(store.remove_trigger(&t.key).unwrap());
    assert!(store.remove_calendar("weekdays").unwrap());
    assert!(store.retrieve_calendar("weekdays").unwrap().is_none());
}

#[test]
fn trigger_referencing_unknown_calendar_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, "node-1");
    let now = now_ms();

    let mut j = job("g", "j");
    j.durable = true;
    store.store_job(&j, false).unwrap();

    let mut t = Trigger::one_shot(Key::new("g", "t"), j.key.clone(), now + 60_000);
    t.calendar_name = Some("nope".to_string());
    let err = store.store_trigger(&t, false).unwrap_err();
    assert_eq!(err.code(), "CLIENT_ERROR");
}

#[test]
fn remove_trigger_cascades_nondurable_job() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, "node-1");
    let now = now_ms();

    let j = job("g", "fragile");
    let t = Trigger::one_shot(Key::new("g", "t"), j.key.clone(), now + 60_000);
    store.store_job_and_trigger(&j, &t).unwrap();

    assert!(store.remove_trigger(&t.key).unwrap());
    assert!(store.retrieve_job(&j.key).unwrap().is_none());
}

#[test]
fn durable_job_survives_losing_last_trigger() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, "node-1");
    let now = now_ms();

    let mut j = job("g", "sturdy");
    j.durable = true;
    store.store_job(&j, false).unwrap();
    let t = Trigger::one_shot(Key::new("g", "t"), j.key.clone(), now + 60_000);
    store.store_trigger(&t, false).unwrap();

    assert!(store.remove_trigger(&t.key).unwrap());
    assert!(store.retrieve_job(&j.key).unwrap().is_some());
}

#[test]
fn acquire_returns_none_when_nothing_is_due() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, "node-1");
    let now = now_ms();

    let mut j = job("g", "j");
    j.durable = true;
    store.store_job(&j, false).unwrap();
    let t = Trigger::one_shot(Key::new("g", "t"), j.key.clone(), now + 600_000);
    store.store_trigger(&t, false).unwrap();

    assert!(store.acquire_next_trigger(now + 1_000).unwrap().is_none());
}

#[test]
fn release_acquired_trigger_returns_it_to_waiting() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, "node-1");
    let now = now_ms();

    let mut j = job("g", "j");
    j.durable = true;
    store.store_job(&j, false).unwrap();
    let t = Trigger::one_shot(Key::new("g", "t"), j.key.clone(), now - 100);
    store.store_trigger(&t, false).unwrap();

    let acquired = store.acquire_next_trigger(now).unwrap().unwrap();
    store.release_acquired_trigger(&acquired).unwrap();
    assert_eq!(
        store.trigger_state(&t.key).unwrap(),
        Some(TriggerState::Waiting)
    );
    // Reacquirable immediately.
    assert!(store.acquire_next_trigger(now).unwrap().is_some());
}

#[test]
fn introspection_counts_and_names() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, "node-1");
    let now = now_ms();

    let mut j1 = job("alpha", "j1");
    j1.durable = true;
    let mut j2 = job("beta", "j2");
    j2.durable = true;
    store.store_job(&j1, false).unwrap();
    store.store_job(&j2, false).unwrap();
    store
        .store_trigger(
            &Trigger::one_shot(Key::new("alpha", "t1"), j1.key.clone(), now + 60_000),
            false,
        )
        .unwrap();

    assert_eq!(store.num_jobs().unwrap(), 2);
    assert_eq!(store.num_triggers().unwrap(), 1);
    assert_eq!(store.job_group_names().unwrap(), vec!["alpha", "beta"]);
    assert_eq!(store.job_names("alpha").unwrap(), vec!["j1"]);
    assert_eq!(store.trigger_group_names().unwrap(), vec!["alpha"]);
    assert_eq!(store.trigger_names("alpha").unwrap(), vec!["t1"]);
    assert_eq!(store.triggers_for_job(&j1.key).unwrap().len(), 1);
}

#[test]
fn paused_trigger_fired_after_acquisition_returns_none() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, "node-1");
    let now = now_ms();

    let mut j = job("g", "j");
    j.durable = true;
    store.store_job(&j, false).unwrap();
    let t = Trigger::one_shot(Key::new("g", "t"), j.key.clone(), now - 100);
    store.store_trigger(&t, false).unwrap();

    let acquired = store.acquire_next_trigger(now).unwrap().unwrap();
    // Someone deletes the trigger between acquisition and firing.
    store.remove_trigger(&t.key).unwrap();
    assert!(store.trigger_fired(&acquired).unwrap().is_none());
}
