use std::str::FromStr;

use rusqlite::{Connection, Result, Row};
use tickvault_core::types::{FiredTriggerRecord, JobDetail, Key, SchedulerStateRecord, TriggerState};

use crate::lock::{CALENDAR_ACCESS, STATE_ACCESS, TRIGGER_ACCESS};

/// Initialise the store schema. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    create_job_tables(conn)?;
    create_trigger_tables(conn)?;
    create_calendar_tables(conn)?;
    create_cluster_tables(conn)?;
    seed_lock_rows(conn)?;
    Ok(())
}

fn create_job_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS job_details (
            job_group           TEXT    NOT NULL,
            job_name            TEXT    NOT NULL,
            description         TEXT,
            job_class           TEXT    NOT NULL,
            is_durable          INTEGER NOT NULL DEFAULT 0,
            is_volatile         INTEGER NOT NULL DEFAULT 0,
            is_stateful         INTEGER NOT NULL DEFAULT 0,
            requests_recovery   INTEGER NOT NULL DEFAULT 0,
            job_data            TEXT    NOT NULL DEFAULT '{}',  -- JSON map
            PRIMARY KEY (job_group, job_name)
        );",
    )
}

fn create_trigger_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS triggers (
            trigger_group   TEXT    NOT NULL,
            trigger_name    TEXT    NOT NULL,
            job_group       TEXT    NOT NULL,
            job_name        TEXT    NOT NULL,
            description     TEXT,
            is_volatile     INTEGER NOT NULL DEFAULT 0,
            calendar_name   TEXT,
            priority        INTEGER NOT NULL DEFAULT 5,
            misfire_policy  TEXT    NOT NULL DEFAULT 'smart',
            trigger_kind    TEXT    NOT NULL,
            start_time      INTEGER NOT NULL,
            end_time        INTEGER,
            next_fire_time  INTEGER,            -- epoch ms, NULL when exhausted
            prev_fire_time  INTEGER,
            trigger_data    TEXT    NOT NULL DEFAULT '{}',
            state           TEXT    NOT NULL DEFAULT 'waiting',
            PRIMARY KEY (trigger_group, trigger_name),
            FOREIGN KEY (job_group, job_name)
                REFERENCES job_details (job_group, job_name)
        );

        -- The acquisition query: state equality plus next_fire_time range.
        CREATE INDEX IF NOT EXISTS idx_triggers_state_next_fire
            ON triggers (state, next_fire_time);
        CREATE INDEX IF NOT EXISTS idx_triggers_job
            ON triggers (job_group, job_name);
        CREATE INDEX IF NOT EXISTS idx_triggers_calendar
            ON triggers (calendar_name);

        CREATE TABLE IF NOT EXISTS simple_triggers (
            trigger_group   TEXT    NOT NULL,
            trigger_name    TEXT    NOT NULL,
            repeat_interval INTEGER NOT NULL,
            repeat_count    INTEGER NOT NULL,
            times_triggered INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (trigger_group, trigger_name),
            FOREIGN KEY (trigger_group, trigger_name)
                REFERENCES triggers (trigger_group, trigger_name)
        );

        CREATE TABLE IF NOT EXISTS cron_triggers (
            trigger_group   TEXT NOT NULL,
            trigger_name    TEXT NOT NULL,
            expression      TEXT NOT NULL,
            time_zone       TEXT,
            PRIMARY KEY (trigger_group, trigger_name),
            FOREIGN KEY (trigger_group, trigger_name)
                REFERENCES triggers (trigger_group, trigger_name)
        );

        CREATE TABLE IF NOT EXISTS blob_triggers (
            trigger_group   TEXT NOT NULL,
            trigger_name    TEXT NOT NULL,
            blob_data       BLOB NOT NULL,
            PRIMARY KEY (trigger_group, trigger_name),
            FOREIGN KEY (trigger_group, trigger_name)
                REFERENCES triggers (trigger_group, trigger_name)
        );

        CREATE TABLE IF NOT EXISTS paused_trigger_groups (
            trigger_group TEXT NOT NULL PRIMARY KEY
        );",
    )
}

fn create_calendar_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS calendars (
            calendar_name TEXT NOT NULL PRIMARY KEY,
            calendar      TEXT NOT NULL               -- JSON-encoded Calendar
        );",
    )
}

fn create_cluster_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS fired_triggers (
            entry_id            TEXT    NOT NULL PRIMARY KEY,
            instance_id         TEXT    NOT NULL,
            trigger_group       TEXT    NOT NULL,
            trigger_name        TEXT    NOT NULL,
            job_group           TEXT    NOT NULL,
            job_name            TEXT    NOT NULL,
            is_stateful         INTEGER NOT NULL DEFAULT 0,
            requests_recovery   INTEGER NOT NULL DEFAULT 0,
            fired_time          INTEGER NOT NULL,
            priority            INTEGER NOT NULL,
            state               TEXT    NOT NULL
        );

        -- One in-flight record per trigger per instance.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_fired_instance_trigger
            ON fired_triggers (instance_id, trigger_group, trigger_name);
        CREATE INDEX IF NOT EXISTS idx_fired_instance
            ON fired_triggers (instance_id);

        CREATE TABLE IF NOT EXISTS scheduler_state (
            instance_id         TEXT    NOT NULL PRIMARY KEY,
            last_checkin_time   INTEGER NOT NULL,
            checkin_interval    INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS locks (
            lock_name TEXT NOT NULL PRIMARY KEY
        );",
    )
}

fn seed_lock_rows(conn: &Connection) -> Result<()> {
    for name in [TRIGGER_ACCESS, STATE_ACCESS, CALENDAR_ACCESS] {
        conn.execute(
            "INSERT OR IGNORE INTO locks (lock_name) VALUES (?1)",
            [name],
        )?;
    }
    Ok(())
}

// --- row mappers ----------------------------------------------------------

/// Column order from the job SELECT in `gateway::select_job`.
pub(crate) fn row_to_job(row: &Row<'_>) -> rusqlite::Result<JobDetail> {
    let data: String = row.get(8)?;
    Ok(JobDetail {
        key: Key::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
        description: row.get(2)?,
        job_class: row.get(3)?,
        durable: row.get::<_, i32>(4)? != 0,
        volatile: row.get::<_, i32>(5)? != 0,
        stateful: row.get::<_, i32>(6)? != 0,
        requests_recovery: row.get::<_, i32>(7)? != 0,
        data: serde_json::from_str(&data).unwrap_or_default(),
    })
}

pub(crate) fn row_to_fired_record(row: &Row<'_>) -> rusqlite::Result<FiredTriggerRecord> {
    let state_str: String = row.get(10)?;
    Ok(FiredTriggerRecord {
        entry_id: row.get(0)?,
        instance_id: row.get(1)?,
        trigger_key: Key::new(row.get::<_, String>(2)?, row.get::<_, String>(3)?),
        job_key: Key::new(row.get::<_, String>(4)?, row.get::<_, String>(5)?),
        is_stateful: row.get::<_, i32>(6)? != 0,
        requests_recovery: row.get::<_, i32>(7)? != 0,
        fired_time_ms: row.get(8)?,
        priority: row.get(9)?,
        state: TriggerState::from_str(&state_str).unwrap_or(TriggerState::Acquired),
    })
}

pub(crate) fn row_to_scheduler_state(row: &Row<'_>) -> rusqlite::Result<SchedulerStateRecord> {
    Ok(SchedulerStateRecord {
        instance_id: row.get(0)?,
        last_checkin_ms: row.get(1)?,
        checkin_interval_ms: row.get(2)?,
    })
}
