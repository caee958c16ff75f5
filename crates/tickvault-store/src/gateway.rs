//! CRUD primitives over the store's tables. Pure SQL plumbing: every
//! function takes the caller's connection and runs inside the caller's
//! transaction and lock scope.
//!
//! Conditional updates (`UPDATE … WHERE state = old`) act as single-row
//! compare-and-swap: when two peers race on the same trigger the database
//! picks exactly one winner, reported through the changed-row count.

use std::str::FromStr;

use rusqlite::{params, Connection, OptionalExtension};
use tickvault_core::calendar::Calendar;
use tickvault_core::error::Result;
use tickvault_core::types::{
    FiredTriggerRecord, JobDataMap, JobDetail, Key, MisfirePolicy, SchedulerStateRecord, Trigger,
    TriggerPayload, TriggerState,
};

use crate::db::{row_to_fired_record, row_to_job, row_to_scheduler_state};

// --- jobs -----------------------------------------------------------------

const JOB_COLUMNS: &str = "job_group, job_name, description, job_class, is_durable, \
     is_volatile, is_stateful, requests_recovery, job_data";

pub fn insert_job(conn: &Connection, job: &JobDetail) -> Result<()> {
    conn.execute(
        "INSERT INTO job_details
         (job_group, job_name, description, job_class, is_durable,
          is_volatile, is_stateful, requests_recovery, job_data)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            job.key.group,
            job.key.name,
            job.description,
            job.job_class,
            job.durable as i32,
            job.volatile as i32,
            job.stateful as i32,
            job.requests_recovery as i32,
            serde_json::to_string(&job.data)?,
        ],
    )?;
    Ok(())
}

pub fn update_job(conn: &Connection, job: &JobDetail) -> Result<usize> {
    let n = conn.execute(
        "UPDATE job_details
         SET description = ?3, job_class = ?4, is_durable = ?5, is_volatile = ?6,
             is_stateful = ?7, requests_recovery = ?8, job_data = ?9
         WHERE job_group = ?1 AND job_name = ?2",
        params![
            job.key.group,
            job.key.name,
            job.description,
            job.job_class,
            job.durable as i32,
            job.volatile as i32,
            job.stateful as i32,
            job.requests_recovery as i32,
            serde_json::to_string(&job.data)?,
        ],
    )?;
    Ok(n)
}

/// Re-persist just the payload of a stateful job after a run.
pub fn update_job_data(conn: &Connection, key: &Key, data: &JobDataMap) -> Result<usize> {
    let n = conn.execute(
        "UPDATE job_details SET job_data = ?3 WHERE job_group = ?1 AND job_name = ?2",
        params![key.group, key.name, serde_json::to_string(data)?],
    )?;
    Ok(n)
}

pub fn job_exists(conn: &Connection, key: &Key) -> Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM job_details WHERE job_group = ?1 AND job_name = ?2",
        params![key.group, key.name],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

pub fn select_job(conn: &Connection, key: &Key) -> Result<Option<JobDetail>> {
    let job = conn
        .query_row(
            &format!(
                "SELECT {JOB_COLUMNS} FROM job_details
                 WHERE job_group = ?1 AND job_name = ?2"
            ),
            params![key.group, key.name],
            row_to_job,
        )
        .optional()?;
    Ok(job)
}

pub fn delete_job(conn: &Connection, key: &Key) -> Result<usize> {
    let n = conn.execute(
        "DELETE FROM job_details WHERE job_group = ?1 AND job_name = ?2",
        params![key.group, key.name],
    )?;
    Ok(n)
}

pub fn count_jobs(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM job_details", [], |row| row.get(0))?)
}

pub fn select_job_group_names(conn: &Connection) -> Result<Vec<String>> {
    select_strings(conn, "SELECT DISTINCT job_group FROM job_details ORDER BY job_group")
}

pub fn select_job_names_in_group(conn: &Connection, group: &str) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT job_name FROM job_details WHERE job_group = ?1 ORDER BY job_name")?;
    let names = stmt
        .query_map([group], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
}

pub fn select_volatile_job_keys(conn: &Connection) -> Result<Vec<Key>> {
    select_keys_stmt(
        conn,
        "SELECT job_group, job_name FROM job_details WHERE is_volatile = 1",
        params![],
    )
}

// --- triggers -------------------------------------------------------------

const TRIGGER_COLUMNS: &str = "trigger_group, trigger_name, job_group, job_name, description, \
     is_volatile, calendar_name, priority, misfire_policy, trigger_kind, start_time, end_time, \
     next_fire_time, prev_fire_time, trigger_data";

pub fn insert_trigger(conn: &Connection, trigger: &Trigger, state: TriggerState) -> Result<()> {
    conn.execute(
        "INSERT INTO triggers
         (trigger_group, trigger_name, job_group, job_name, description, is_volatile,
          calendar_name, priority, misfire_policy, trigger_kind, start_time, end_time,
          next_fire_time, prev_fire_time, trigger_data, state)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            trigger.key.group,
            trigger.key.name,
            trigger.job_key.group,
            trigger.job_key.name,
            trigger.description,
            trigger.volatile as i32,
            trigger.calendar_name,
            trigger.priority,
            trigger.misfire_policy.to_string(),
            trigger.payload.kind(),
            trigger.start_time_ms,
            trigger.end_time_ms,
            trigger.next_fire_time_ms,
            trigger.prev_fire_time_ms,
            serde_json::to_string(&trigger.data)?,
            state.to_string(),
        ],
    )?;
    insert_trigger_payload(conn, trigger)
}

fn insert_trigger_payload(conn: &Connection, trigger: &Trigger) -> Result<()> {
    match &trigger.payload {
        TriggerPayload::Simple {
            repeat_interval_ms,
            repeat_count,
            times_triggered,
        } => {
            conn.execute(
                "INSERT INTO simple_triggers
                 (trigger_group, trigger_name, repeat_interval, repeat_count, times_triggered)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    trigger.key.group,
                    trigger.key.name,
                    repeat_interval_ms,
                    repeat_count,
                    times_triggered,
                ],
            )?;
        }
        TriggerPayload::Cron {
            expression,
            time_zone,
        } => {
            conn.execute(
                "INSERT INTO cron_triggers (trigger_group, trigger_name, expression, time_zone)
                 VALUES (?1, ?2, ?3, ?4)",
                params![trigger.key.group, trigger.key.name, expression, time_zone],
            )?;
        }
        TriggerPayload::Blob { data } => {
            conn.execute(
                "INSERT INTO blob_triggers (trigger_group, trigger_name, blob_data)
                 VALUES (?1, ?2, ?3)",
                params![trigger.key.group, trigger.key.name, data],
            )?;
        }
    }
    Ok(())
}

/// Rewrite a trigger row (and its variant row) in place, setting `state`.
pub fn update_trigger(conn: &Connection, trigger: &Trigger, state: TriggerState) -> Result<usize> {
    let n = conn.execute(
        "UPDATE triggers
         SET job_group = ?3, job_name = ?4, description = ?5, is_volatile = ?6,
             calendar_name = ?7, priority = ?8, misfire_policy = ?9, trigger_kind = ?10,
             start_time = ?11, end_time = ?12, next_fire_time = ?13, prev_fire_time = ?14,
             trigger_data = ?15, state = ?16
         WHERE trigger_group = ?1 AND trigger_name = ?2",
        params![
            trigger.key.group,
            trigger.key.name,
            trigger.job_key.group,
            trigger.job_key.name,
            trigger.description,
            trigger.volatile as i32,
            trigger.calendar_name,
            trigger.priority,
            trigger.misfire_policy.to_string(),
            trigger.payload.kind(),
            trigger.start_time_ms,
            trigger.end_time_ms,
            trigger.next_fire_time_ms,
            trigger.prev_fire_time_ms,
            serde_json::to_string(&trigger.data)?,
            state.to_string(),
        ],
    )?;
    delete_trigger_payload(conn, &trigger.key)?;
    insert_trigger_payload(conn, trigger)?;
    Ok(n)
}

fn delete_trigger_payload(conn: &Connection, key: &Key) -> Result<()> {
    for table in ["simple_triggers", "cron_triggers", "blob_triggers"] {
        conn.execute(
            &format!("DELETE FROM {table} WHERE trigger_group = ?1 AND trigger_name = ?2"),
            params![key.group, key.name],
        )?;
    }
    Ok(())
}

pub fn delete_trigger(conn: &Connection, key: &Key) -> Result<usize> {
    delete_trigger_payload(conn, key)?;
    let n = conn.execute(
        "DELETE FROM triggers WHERE trigger_group = ?1 AND trigger_name = ?2",
        params![key.group, key.name],
    )?;
    Ok(n)
}

pub fn trigger_exists(conn: &Connection, key: &Key) -> Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM triggers WHERE trigger_group = ?1 AND trigger_name = ?2",
        params![key.group, key.name],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

pub fn select_trigger(conn: &Connection, key: &Key) -> Result<Option<Trigger>> {
    let base = conn
        .query_row(
            &format!(
                "SELECT {TRIGGER_COLUMNS} FROM triggers
                 WHERE trigger_group = ?1 AND trigger_name = ?2"
            ),
            params![key.group, key.name],
            |row| {
                Ok((
                    Key::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
                    Key::new(row.get::<_, String>(2)?, row.get::<_, String>(3)?),
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, i32>(5)? != 0,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, i32>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, String>(9)?,
                    row.get::<_, i64>(10)?,
                    row.get::<_, Option<i64>>(11)?,
                    row.get::<_, Option<i64>>(12)?,
                    row.get::<_, Option<i64>>(13)?,
                    row.get::<_, String>(14)?,
                ))
            },
        )
        .optional()?;

    let Some((
        key,
        job_key,
        description,
        volatile,
        calendar_name,
        priority,
        misfire_str,
        kind,
        start_time_ms,
        end_time_ms,
        next_fire_time_ms,
        prev_fire_time_ms,
        data_json,
    )) = base
    else {
        return Ok(None);
    };

    let payload = select_trigger_payload(conn, &key, &kind)?;
    Ok(Some(Trigger {
        key,
        job_key,
        description,
        volatile,
        calendar_name,
        priority,
        misfire_policy: MisfirePolicy::from_str(&misfire_str).unwrap_or(MisfirePolicy::Smart),
        start_time_ms,
        end_time_ms,
        next_fire_time_ms,
        prev_fire_time_ms,
        payload,
        data: serde_json::from_str(&data_json).unwrap_or_default(),
        fire_instance_id: None,
    }))
}

fn select_trigger_payload(conn: &Connection, key: &Key, kind: &str) -> Result<TriggerPayload> {
    let payload = match kind {
        "simple" => conn.query_row(
            "SELECT repeat_interval, repeat_count, times_triggered FROM simple_triggers
             WHERE trigger_group = ?1 AND trigger_name = ?2",
            params![key.group, key.name],
            |row| {
                Ok(TriggerPayload::Simple {
                    repeat_interval_ms: row.get(0)?,
                    repeat_count: row.get(1)?,
                    times_triggered: row.get(2)?,
                })
            },
        )?,
        "cron" => conn.query_row(
            "SELECT expression, time_zone FROM cron_triggers
             WHERE trigger_group = ?1 AND trigger_name = ?2",
            params![key.group, key.name],
            |row| {
                Ok(TriggerPayload::Cron {
                    expression: row.get(0)?,
                    time_zone: row.get(1)?,
                })
            },
        )?,
        _ => conn.query_row(
            "SELECT blob_data FROM blob_triggers
             WHERE trigger_group = ?1 AND trigger_name = ?2",
            params![key.group, key.name],
            |row| Ok(TriggerPayload::Blob { data: row.get(0)? }),
        )?,
    };
    Ok(payload)
}

pub fn select_trigger_state(conn: &Connection, key: &Key) -> Result<Option<TriggerState>> {
    let state: Option<String> = conn
        .query_row(
            "SELECT state FROM triggers WHERE trigger_group = ?1 AND trigger_name = ?2",
            params![key.group, key.name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(state.and_then(|s| TriggerState::from_str(&s).ok()))
}

pub fn update_trigger_state(conn: &Connection, key: &Key, state: TriggerState) -> Result<usize> {
    let n = conn.execute(
        "UPDATE triggers SET state = ?3 WHERE trigger_group = ?1 AND trigger_name = ?2",
        params![key.group, key.name, state.to_string()],
    )?;
    Ok(n)
}

/// CAS: move the trigger to `new` only if it currently sits in one of
/// `from`. The returned row count is the race outcome.
pub fn update_trigger_state_from(
    conn: &Connection,
    key: &Key,
    new: TriggerState,
    from: &[TriggerState],
) -> Result<usize> {
    let n = conn.execute(
        &format!(
            "UPDATE triggers SET state = ?3
             WHERE trigger_group = ?1 AND trigger_name = ?2 AND state IN ({})",
            state_list(from)
        ),
        params![key.group, key.name, new.to_string()],
    )?;
    Ok(n)
}

pub fn update_trigger_group_states_from(
    conn: &Connection,
    group: &str,
    new: TriggerState,
    from: &[TriggerState],
) -> Result<usize> {
    let n = conn.execute(
        &format!(
            "UPDATE triggers SET state = ?2
             WHERE trigger_group = ?1 AND state IN ({})",
            state_list(from)
        ),
        params![group, new.to_string()],
    )?;
    Ok(n)
}

pub fn update_trigger_states_for_job(
    conn: &Connection,
    job_key: &Key,
    new: TriggerState,
) -> Result<usize> {
    let n = conn.execute(
        "UPDATE triggers SET state = ?3 WHERE job_group = ?1 AND job_name = ?2",
        params![job_key.group, job_key.name, new.to_string()],
    )?;
    Ok(n)
}

pub fn update_trigger_states_for_job_from(
    conn: &Connection,
    job_key: &Key,
    new: TriggerState,
    from: &[TriggerState],
) -> Result<usize> {
    let n = conn.execute(
        &format!(
            "UPDATE triggers SET state = ?3
             WHERE job_group = ?1 AND job_name = ?2 AND state IN ({})",
            state_list(from)
        ),
        params![job_key.group, job_key.name, new.to_string()],
    )?;
    Ok(n)
}

/// Table-wide variant of the CAS update, used by startup recovery to put
/// every in-flight trigger back into a runnable state.
pub fn update_trigger_states_from(
    conn: &Connection,
    new: TriggerState,
    from: &[TriggerState],
) -> Result<usize> {
    let n = conn.execute(
        &format!(
            "UPDATE triggers SET state = ?1 WHERE state IN ({})",
            state_list(from)
        ),
        params![new.to_string()],
    )?;
    Ok(n)
}

pub fn select_trigger_keys_in_state(conn: &Connection, state: TriggerState) -> Result<Vec<Key>> {
    select_keys_stmt(
        conn,
        "SELECT trigger_group, trigger_name FROM triggers WHERE state = ?1",
        params![state.to_string()],
    )
}

/// States are internal constants, so inlining them is injection-safe.
fn state_list(states: &[TriggerState]) -> String {
    states
        .iter()
        .map(|s| format!("'{s}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn select_trigger_keys_for_job(conn: &Connection, job_key: &Key) -> Result<Vec<Key>> {
    select_keys_stmt(
        conn,
        "SELECT trigger_group, trigger_name FROM triggers
         WHERE job_group = ?1 AND job_name = ?2",
        params![job_key.group, job_key.name],
    )
}

pub fn count_triggers_for_job(conn: &Connection, job_key: &Key) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM triggers WHERE job_group = ?1 AND job_name = ?2",
        params![job_key.group, job_key.name],
        |row| row.get(0),
    )?)
}

/// States of every trigger attached to a job. Used to decide whether a
/// freshly stored trigger of a stateful job must start blocked.
pub fn select_trigger_states_for_job(
    conn: &Connection,
    job_key: &Key,
) -> Result<Vec<TriggerState>> {
    let mut stmt =
        conn.prepare("SELECT state FROM triggers WHERE job_group = ?1 AND job_name = ?2")?;
    let states = stmt
        .query_map(params![job_key.group, job_key.name], |row| {
            row.get::<_, String>(0)
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(states
        .into_iter()
        .filter_map(|s| TriggerState::from_str(&s).ok())
        .collect())
}

pub fn count_triggers(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM triggers", [], |row| row.get(0))?)
}

pub fn select_trigger_group_names(conn: &Connection) -> Result<Vec<String>> {
    select_strings(
        conn,
        "SELECT DISTINCT trigger_group FROM triggers ORDER BY trigger_group",
    )
}

pub fn select_trigger_names_in_group(conn: &Connection, group: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT trigger_name FROM triggers WHERE trigger_group = ?1 ORDER BY trigger_name")?;
    let names = stmt
        .query_map([group], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
}

/// Acquisition candidates: WAITING triggers due no later than
/// `no_later_than_ms`, soonest first, higher priority breaking ties.
pub fn select_next_trigger_keys(
    conn: &Connection,
    no_later_than_ms: i64,
    limit: usize,
) -> Result<Vec<Key>> {
    select_keys_stmt(
        conn,
        "SELECT trigger_group, trigger_name FROM triggers
         WHERE state = 'waiting' AND next_fire_time IS NOT NULL AND next_fire_time <= ?1
         ORDER BY next_fire_time ASC, priority DESC
         LIMIT ?2",
        params![no_later_than_ms, limit as i64],
    )
}

/// WAITING triggers whose fire time slipped past the misfire horizon.
/// Do-nothing triggers are left alone — they simply fire late.
pub fn select_misfired_trigger_keys(
    conn: &Connection,
    before_ms: i64,
    limit: usize,
) -> Result<Vec<Key>> {
    select_keys_stmt(
        conn,
        "SELECT trigger_group, trigger_name FROM triggers
         WHERE state = 'waiting' AND next_fire_time IS NOT NULL AND next_fire_time < ?1
           AND misfire_policy != 'do_nothing'
         ORDER BY next_fire_time ASC, priority DESC
         LIMIT ?2",
        params![before_ms, limit as i64],
    )
}

pub fn select_trigger_keys_for_calendar(conn: &Connection, calendar_name: &str) -> Result<Vec<Key>> {
    select_keys_stmt(
        conn,
        "SELECT trigger_group, trigger_name FROM triggers WHERE calendar_name = ?1",
        params![calendar_name],
    )
}

pub fn count_triggers_for_calendar(conn: &Connection, calendar_name: &str) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM triggers WHERE calendar_name = ?1",
        params![calendar_name],
        |row| row.get(0),
    )?)
}

pub fn select_volatile_trigger_keys(conn: &Connection) -> Result<Vec<Key>> {
    select_keys_stmt(
        conn,
        "SELECT trigger_group, trigger_name FROM triggers WHERE is_volatile = 1",
        params![],
    )
}

// --- calendars ------------------------------------------------------------

pub fn insert_calendar(conn: &Connection, name: &str, calendar: &Calendar) -> Result<()> {
    conn.execute(
        "INSERT INTO calendars (calendar_name, calendar) VALUES (?1, ?2)",
        params![name, serde_json::to_string(calendar)?],
    )?;
    Ok(())
}

pub fn update_calendar(conn: &Connection, name: &str, calendar: &Calendar) -> Result<usize> {
    let n = conn.execute(
        "UPDATE calendars SET calendar = ?2 WHERE calendar_name = ?1",
        params![name, serde_json::to_string(calendar)?],
    )?;
    Ok(n)
}

pub fn calendar_exists(conn: &Connection, name: &str) -> Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM calendars WHERE calendar_name = ?1",
        params![name],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

pub fn select_calendar(conn: &Connection, name: &str) -> Result<Option<Calendar>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT calendar FROM calendars WHERE calendar_name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    match raw {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

pub fn delete_calendar(conn: &Connection, name: &str) -> Result<usize> {
    let n = conn.execute(
        "DELETE FROM calendars WHERE calendar_name = ?1",
        params![name],
    )?;
    Ok(n)
}

pub fn count_calendars(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM calendars", [], |row| row.get(0))?)
}

pub fn select_calendar_names(conn: &Connection) -> Result<Vec<String>> {
    select_strings(
        conn,
        "SELECT calendar_name FROM calendars ORDER BY calendar_name",
    )
}

// --- paused trigger groups ------------------------------------------------

pub fn insert_paused_group(conn: &Connection, group: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO paused_trigger_groups (trigger_group) VALUES (?1)",
        params![group],
    )?;
    Ok(())
}

pub fn delete_paused_group(conn: &Connection, group: &str) -> Result<usize> {
    let n = conn.execute(
        "DELETE FROM paused_trigger_groups WHERE trigger_group = ?1",
        params![group],
    )?;
    Ok(n)
}

pub fn delete_all_paused_groups(conn: &Connection) -> Result<usize> {
    let n = conn.execute("DELETE FROM paused_trigger_groups", [])?;
    Ok(n)
}

pub fn is_group_paused(conn: &Connection, group: &str) -> Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM paused_trigger_groups WHERE trigger_group = ?1",
        params![group],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

pub fn select_paused_groups(conn: &Connection) -> Result<Vec<String>> {
    select_strings(
        conn,
        "SELECT trigger_group FROM paused_trigger_groups ORDER BY trigger_group",
    )
}

// --- fired triggers -------------------------------------------------------

const FIRED_COLUMNS: &str = "entry_id, instance_id, trigger_group, trigger_name, job_group, \
     job_name, is_stateful, requests_recovery, fired_time, priority, state";

pub fn insert_fired_trigger(conn: &Connection, rec: &FiredTriggerRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO fired_triggers
         (entry_id, instance_id, trigger_group, trigger_name, job_group, job_name,
          is_stateful, requests_recovery, fired_time, priority, state)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            rec.entry_id,
            rec.instance_id,
            rec.trigger_key.group,
            rec.trigger_key.name,
            rec.job_key.group,
            rec.job_key.name,
            rec.is_stateful as i32,
            rec.requests_recovery as i32,
            rec.fired_time_ms,
            rec.priority,
            rec.state.to_string(),
        ],
    )?;
    Ok(())
}

pub fn update_fired_trigger_state(
    conn: &Connection,
    entry_id: &str,
    state: TriggerState,
) -> Result<usize> {
    let n = conn.execute(
        "UPDATE fired_triggers SET state = ?2 WHERE entry_id = ?1",
        params![entry_id, state.to_string()],
    )?;
    Ok(n)
}

pub fn delete_fired_trigger(conn: &Connection, entry_id: &str) -> Result<usize> {
    let n = conn.execute(
        "DELETE FROM fired_triggers WHERE entry_id = ?1",
        params![entry_id],
    )?;
    Ok(n)
}

pub fn delete_fired_triggers_of_instance(conn: &Connection, instance_id: &str) -> Result<usize> {
    let n = conn.execute(
        "DELETE FROM fired_triggers WHERE instance_id = ?1",
        params![instance_id],
    )?;
    Ok(n)
}

pub fn select_fired_triggers_of_instance(
    conn: &Connection,
    instance_id: &str,
) -> Result<Vec<FiredTriggerRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {FIRED_COLUMNS} FROM fired_triggers WHERE instance_id = ?1 ORDER BY fired_time"
    ))?;
    let recs = stmt
        .query_map([instance_id], row_to_fired_record)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(recs)
}

// --- scheduler state ------------------------------------------------------

pub fn insert_scheduler_state(conn: &Connection, rec: &SchedulerStateRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO scheduler_state (instance_id, last_checkin_time, checkin_interval)
         VALUES (?1, ?2, ?3)",
        params![rec.instance_id, rec.last_checkin_ms, rec.checkin_interval_ms],
    )?;
    Ok(())
}

pub fn update_scheduler_state_checkin(
    conn: &Connection,
    instance_id: &str,
    now_ms: i64,
) -> Result<usize> {
    let n = conn.execute(
        "UPDATE scheduler_state SET last_checkin_time = ?2 WHERE instance_id = ?1",
        params![instance_id, now_ms],
    )?;
    Ok(n)
}

pub fn delete_scheduler_state(conn: &Connection, instance_id: &str) -> Result<usize> {
    let n = conn.execute(
        "DELETE FROM scheduler_state WHERE instance_id = ?1",
        params![instance_id],
    )?;
    Ok(n)
}

pub fn select_scheduler_states(conn: &Connection) -> Result<Vec<SchedulerStateRecord>> {
    let mut stmt = conn.prepare(
        "SELECT instance_id, last_checkin_time, checkin_interval FROM scheduler_state",
    )?;
    let recs = stmt
        .query_map([], row_to_scheduler_state)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(recs)
}

// --- shared helpers -------------------------------------------------------

fn select_strings(conn: &Connection, sql: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let values = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(values)
}

fn select_keys_stmt<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<Key>> {
    let mut stmt = conn.prepare(sql)?;
    let keys = stmt
        .query_map(params, |row| {
            Ok(Key::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(keys)
}
