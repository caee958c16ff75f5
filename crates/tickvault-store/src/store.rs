use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use chrono::Utc;
use rusqlite::Connection;
use tracing::{debug, info, instrument, warn};

use tickvault_core::calendar::Calendar;
use tickvault_core::config::StoreConfig;
use tickvault_core::error::{Result, StoreError};
use tickvault_core::schedule;
use tickvault_core::types::{JobDetail, Key, Trigger, TriggerState};

use crate::conn::{self, DbPool};
use crate::db;
use crate::gateway;
use crate::lock::{
    DbRowLockHandler, InProcessLockHandler, LockHandler, CALENDAR_ACCESS, TRIGGER_ACCESS,
};

/// Callback into the upstream scheduler: the earliest pending fire time may
/// have moved, so its waiting loop should re-plan.
pub trait SchedulerSignaler: Send + Sync {
    fn signal_scheduling_change(&self, candidate_next_fire_ms: Option<i64>);
}

/// Default signaler for embedders that poll instead of listening.
pub struct NoopSignaler;

impl SchedulerSignaler for NoopSignaler {
    fn signal_scheduling_change(&self, _candidate_next_fire_ms: Option<i64>) {}
}

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Durable, cluster-safe backing store for a time-based job scheduler.
///
/// Every public operation borrows a pooled connection, takes the lock its
/// contract requires, runs inside one transaction, and commits or rolls
/// back — peers in other processes coordinate purely through the database.
pub struct JobStore {
    pub(crate) pool: DbPool,
    pub(crate) cfg: StoreConfig,
    pub(crate) instance_id: String,
    pub(crate) locks: Arc<dyn LockHandler>,
    pub(crate) signaler: Arc<dyn SchedulerSignaler>,
    /// True until this instance's first successful check-in; the first
    /// check-in treats our own stale state row as a failed peer.
    pub(crate) first_checkin: AtomicBool,
}

impl JobStore {
    /// Open (and if necessary create) the store described by `cfg`.
    pub fn open(cfg: StoreConfig) -> Result<Self> {
        cfg.validate()?;
        let instance_id = cfg.resolve_instance_id();
        let pool = conn::open_pool(&cfg.data_source)?;

        {
            let conn = pool.get().map_err(|e| StoreError::Pool(e.to_string()))?;
            db::init_db(&conn)?;
        }

        let locks: Arc<dyn LockHandler> = if cfg.use_db_locks {
            Arc::new(DbRowLockHandler::new(cfg.select_with_lock_sql.clone()))
        } else {
            Arc::new(InProcessLockHandler::new())
        };

        info!(
            instance_id = %instance_id,
            clustered = cfg.is_clustered,
            db_locks = cfg.use_db_locks,
            "job store opened"
        );
        Ok(Self {
            pool,
            cfg,
            instance_id,
            locks,
            signaler: Arc::new(NoopSignaler),
            first_checkin: AtomicBool::new(true),
        })
    }

    /// Install the upstream scheduler's signaler.
    pub fn with_signaler(mut self, signaler: Arc<dyn SchedulerSignaler>) -> Self {
        self.signaler = signaler;
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn config(&self) -> &StoreConfig {
        &self.cfg
    }

    /// Release resources. Pending transactions on other threads run to
    /// completion; the pool drains on drop.
    pub fn shutdown(&self) {
        info!(instance_id = %self.instance_id, "job store shut down");
    }

    // --- transaction envelope ---------------------------------------------

    /// Run `work` in its own write transaction, optionally under a named
    /// lock. Commits on success; rolls back on error; the lock is always
    /// released and the connection always returned.
    pub(crate) fn execute_in_lock<T>(
        &self,
        lock: Option<&str>,
        work: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        let conn = self
            .pool
            .get()
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        conn::begin(&conn, true)?;

        let mut owner = false;
        let inner = match lock {
            Some(name) => self.locks.obtain(&conn, name).and_then(|owned| {
                owner = owned;
                work(&conn)
            }),
            None => work(&conn),
        };

        let outcome = match inner {
            Ok(value) => conn::commit(&conn).map(|()| value),
            Err(e) => {
                if let Err(rb) = conn::rollback(&conn) {
                    warn!(error = %rb, "rollback failed after inner error");
                }
                Err(e)
            }
        };

        if let Some(name) = lock {
            if let Err(e) = self.locks.release(&conn, name, owner) {
                warn!(error = %e, lock = name, "lock release failed");
            }
        }
        outcome
    }

    /// Run `work` in a read-only transaction with no lock.
    pub(crate) fn execute_read<T>(
        &self,
        work: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        let conn = self
            .pool
            .get()
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        conn::begin(&conn, false)?;
        let inner = work(&conn);
        match inner {
            Ok(value) => conn::commit(&conn).map(|()| value),
            Err(e) => {
                if let Err(rb) = conn::rollback(&conn) {
                    warn!(error = %rb, "rollback failed after read error");
                }
                Err(e)
            }
        }
    }

    /// Lock choice for plain inserts: serialize when configured to, or when
    /// the caller asked to replace existing rows.
    fn insert_lock(&self, replacing: bool) -> Option<&'static str> {
        if self.cfg.lock_on_insert || replacing {
            Some(TRIGGER_ACCESS)
        } else {
            None
        }
    }

    // --- job / trigger storage --------------------------------------------

    /// Store a job and its first trigger in one transaction.
    #[instrument(skip(self, job, trigger), fields(job = %job.key, trigger = %trigger.key))]
    pub fn store_job_and_trigger(&self, job: &JobDetail, trigger: &Trigger) -> Result<()> {
        let lock = self.insert_lock(false);
        let next = self.execute_in_lock(lock, |conn| {
            if job.volatile && !trigger.volatile {
                return Err(StoreError::Client(
                    "cannot associate a non-volatile trigger with a volatile job".into(),
                ));
            }
            self.store_job_inner(conn, job, false)?;
            self.store_trigger_inner(conn, trigger, Some(job), false, TriggerState::Waiting, false)
        })?;
        self.signaler.signal_scheduling_change(next);
        Ok(())
    }

    #[instrument(skip(self, job), fields(job = %job.key))]
    pub fn store_job(&self, job: &JobDetail, replace: bool) -> Result<()> {
        let lock = self.insert_lock(replace);
        self.execute_in_lock(lock, |conn| self.store_job_inner(conn, job, replace))
    }

    pub fn retrieve_job(&self, key: &Key) -> Result<Option<JobDetail>> {
        self.execute_read(|conn| gateway::select_job(conn, key))
    }

    /// Remove a job and every trigger referencing it.
    #[instrument(skip(self), fields(job = %key))]
    pub fn remove_job(&self, key: &Key) -> Result<bool> {
        self.execute_in_lock(Some(TRIGGER_ACCESS), |conn| {
            for trigger_key in gateway::select_trigger_keys_for_job(conn, key)? {
                gateway::delete_trigger(conn, &trigger_key)?;
            }
            Ok(gateway::delete_job(conn, key)? > 0)
        })
    }

    #[instrument(skip(self, trigger), fields(trigger = %trigger.key))]
    pub fn store_trigger(&self, trigger: &Trigger, replace: bool) -> Result<()> {
        let lock = self.insert_lock(replace);
        let next = self.execute_in_lock(lock, |conn| {
            self.store_trigger_inner(conn, trigger, None, replace, TriggerState::Waiting, false)
        })?;
        self.signaler.signal_scheduling_change(next);
        Ok(())
    }

    pub fn retrieve_trigger(&self, key: &Key) -> Result<Option<Trigger>> {
        self.execute_read(|conn| gateway::select_trigger(conn, key))
    }

    /// Remove a trigger; a non-durable job left without triggers goes too.
    #[instrument(skip(self), fields(trigger = %key))]
    pub fn remove_trigger(&self, key: &Key) -> Result<bool> {
        self.execute_in_lock(Some(TRIGGER_ACCESS), |conn| {
            self.remove_trigger_inner(conn, key)
        })
    }

    /// Swap a trigger for a new one atomically. The replacement must
    /// reference the same job.
    #[instrument(skip(self, new_trigger), fields(old = %key, new = %new_trigger.key))]
    pub fn replace_trigger(&self, key: &Key, new_trigger: &Trigger) -> Result<bool> {
        let (found, next) = self.execute_in_lock(Some(TRIGGER_ACCESS), |conn| {
            let Some(old) = gateway::select_trigger(conn, key)? else {
                return Ok((false, None));
            };
            if old.job_key != new_trigger.job_key {
                return Err(StoreError::Client(
                    "replacement trigger must reference the same job".into(),
                ));
            }
            gateway::delete_trigger(conn, key)?;
            let next = self.store_trigger_inner(
                conn,
                new_trigger,
                None,
                false,
                TriggerState::Waiting,
                false,
            )?;
            Ok((true, next))
        })?;
        if found {
            self.signaler.signal_scheduling_change(next);
        }
        Ok(found)
    }

    // --- shared inner bodies (run inside the caller's envelope) -----------

    fn store_job_inner(&self, conn: &Connection, job: &JobDetail, replace: bool) -> Result<()> {
        let exists = gateway::job_exists(conn, &job.key)?;
        if exists {
            if !replace {
                return Err(StoreError::ObjectAlreadyExists {
                    kind: "job",
                    key: job.key.to_string(),
                });
            }
            gateway::update_job(conn, job)?;
            debug!(job = %job.key, "job replaced");
        } else {
            gateway::insert_job(conn, job)?;
            debug!(job = %job.key, "job stored");
        }
        Ok(())
    }

    /// Store a trigger row in the state the state machine dictates.
    /// Returns the trigger's first fire time for scheduling-change signals.
    ///
    /// `force_state` bypasses the paused-group and blocked-job checks; the
    /// cluster recovery path uses it to enqueue recovery triggers WAITING.
    pub(crate) fn store_trigger_inner(
        &self,
        conn: &Connection,
        trigger: &Trigger,
        job: Option<&JobDetail>,
        replace: bool,
        state: TriggerState,
        force_state: bool,
    ) -> Result<Option<i64>> {
        schedule::validate(trigger)?;

        let exists = gateway::trigger_exists(conn, &trigger.key)?;
        if exists && !replace {
            return Err(StoreError::ObjectAlreadyExists {
                kind: "trigger",
                key: trigger.key.to_string(),
            });
        }

        let owned_job;
        let job = match job {
            Some(j) => j,
            None => {
                owned_job = gateway::select_job(conn, &trigger.job_key)?.ok_or_else(|| {
                    StoreError::JobDoesNotExist {
                        key: trigger.job_key.to_string(),
                    }
                })?;
                &owned_job
            }
        };
        if job.volatile && !trigger.volatile {
            return Err(StoreError::Client(
                "cannot associate a non-volatile trigger with a volatile job".into(),
            ));
        }

        let calendar = match &trigger.calendar_name {
            Some(name) => Some(gateway::select_calendar(conn, name)?.ok_or_else(|| {
                StoreError::Client(format!("trigger references unknown calendar: {name}"))
            })?),
            None => None,
        };

        let state = if force_state {
            state
        } else {
            let paused = gateway::is_group_paused(conn, &trigger.key.group)?;
            let blocked = job.stateful
                && gateway::select_trigger_states_for_job(conn, &job.key)?
                    .contains(&TriggerState::Executing);
            match (paused, blocked) {
                (true, true) => TriggerState::PausedBlocked,
                (true, false) => TriggerState::Paused,
                (false, true) => TriggerState::Blocked,
                (false, false) => state,
            }
        };

        let mut trigger = trigger.clone();
        if trigger.prev_fire_time_ms.is_none() {
            trigger.next_fire_time_ms =
                schedule::compute_first_fire_time(&trigger, calendar.as_ref())?;
            if trigger.next_fire_time_ms.is_none() {
                return Err(StoreError::Client(format!(
                    "trigger {} will never fire",
                    trigger.key
                )));
            }
        }

        if exists {
            gateway::update_trigger(conn, &trigger, state)?;
            debug!(trigger = %trigger.key, state = %state, "trigger replaced");
        } else {
            gateway::insert_trigger(conn, &trigger, state)?;
            debug!(trigger = %trigger.key, state = %state, "trigger stored");
        }
        Ok(trigger.next_fire_time_ms)
    }

    pub(crate) fn remove_trigger_inner(&self, conn: &Connection, key: &Key) -> Result<bool> {
        let Some(trigger) = gateway::select_trigger(conn, key)? else {
            return Ok(false);
        };
        gateway::delete_trigger(conn, key)?;

        // Cascade: a non-durable job with no remaining triggers goes too.
        if let Some(job) = gateway::select_job(conn, &trigger.job_key)? {
            if !job.durable && gateway::count_triggers_for_job(conn, &job.key)? == 0 {
                gateway::delete_job(conn, &job.key)?;
                debug!(job = %job.key, "non-durable job cascaded with last trigger");
            }
        }
        Ok(true)
    }

    // --- calendars --------------------------------------------------------

    #[instrument(skip(self, calendar))]
    pub fn store_calendar(
        &self,
        name: &str,
        calendar: &Calendar,
        replace: bool,
        update_triggers: bool,
    ) -> Result<()> {
        let lock = if self.cfg.lock_on_insert || update_triggers {
            Some(TRIGGER_ACCESS)
        } else {
            None
        };
        self.execute_in_lock(lock, |conn| {
            let exists = gateway::calendar_exists(conn, name)?;
            if exists && !replace {
                return Err(StoreError::ObjectAlreadyExists {
                    kind: "calendar",
                    key: name.to_string(),
                });
            }
            if exists {
                gateway::update_calendar(conn, name, calendar)?;
            } else {
                gateway::insert_calendar(conn, name, calendar)?;
            }

            if exists && update_triggers {
                for key in gateway::select_trigger_keys_for_calendar(conn, name)? {
                    let Some(mut trigger) = gateway::select_trigger(conn, &key)? else {
                        continue;
                    };
                    let state = gateway::select_trigger_state(conn, &key)?
                        .unwrap_or(TriggerState::Waiting);
                    schedule::realign_to_calendar(&mut trigger, calendar)?;
                    let state = if trigger.next_fire_time_ms.is_none() {
                        TriggerState::Complete
                    } else {
                        state
                    };
                    gateway::update_trigger(conn, &trigger, state)?;
                }
            }
            Ok(())
        })
    }

    pub fn retrieve_calendar(&self, name: &str) -> Result<Option<Calendar>> {
        self.execute_read(|conn| gateway::select_calendar(conn, name))
    }

    /// Remove a calendar. Fails while any trigger still references it.
    #[instrument(skip(self))]
    pub fn remove_calendar(&self, name: &str) -> Result<bool> {
        self.execute_in_lock(Some(CALENDAR_ACCESS), |conn| {
            if gateway::count_triggers_for_calendar(conn, name)? > 0 {
                return Err(StoreError::Client(format!(
                    "calendar {name} is still referenced by triggers"
                )));
            }
            Ok(gateway::delete_calendar(conn, name)? > 0)
        })
    }

    // --- introspection ----------------------------------------------------

    pub fn num_jobs(&self) -> Result<i64> {
        self.execute_read(gateway::count_jobs)
    }

    pub fn num_triggers(&self) -> Result<i64> {
        self.execute_read(gateway::count_triggers)
    }

    pub fn num_calendars(&self) -> Result<i64> {
        self.execute_read(gateway::count_calendars)
    }

    pub fn job_group_names(&self) -> Result<Vec<String>> {
        self.execute_read(gateway::select_job_group_names)
    }

    pub fn trigger_group_names(&self) -> Result<Vec<String>> {
        self.execute_read(gateway::select_trigger_group_names)
    }

    pub fn calendar_names(&self) -> Result<Vec<String>> {
        self.execute_read(gateway::select_calendar_names)
    }

    pub fn job_names(&self, group: &str) -> Result<Vec<String>> {
        self.execute_read(|conn| gateway::select_job_names_in_group(conn, group))
    }

    pub fn trigger_names(&self, group: &str) -> Result<Vec<String>> {
        self.execute_read(|conn| gateway::select_trigger_names_in_group(conn, group))
    }

    pub fn triggers_for_job(&self, job_key: &Key) -> Result<Vec<Trigger>> {
        self.execute_read(|conn| {
            let mut triggers = Vec::new();
            for key in gateway::select_trigger_keys_for_job(conn, job_key)? {
                if let Some(t) = gateway::select_trigger(conn, &key)? {
                    triggers.push(t);
                }
            }
            Ok(triggers)
        })
    }

    pub fn trigger_state(&self, key: &Key) -> Result<Option<TriggerState>> {
        self.execute_read(|conn| gateway::select_trigger_state(conn, key))
    }

    pub fn paused_trigger_groups(&self) -> Result<Vec<String>> {
        self.execute_read(gateway::select_paused_groups)
    }

    // --- pause / resume ---------------------------------------------------

    #[instrument(skip(self), fields(trigger = %key))]
    pub fn pause_trigger(&self, key: &Key) -> Result<()> {
        self.execute_in_lock(Some(TRIGGER_ACCESS), |conn| {
            self.pause_trigger_inner(conn, key)
        })
    }

    #[instrument(skip(self), fields(trigger = %key))]
    pub fn resume_trigger(&self, key: &Key) -> Result<()> {
        self.execute_in_lock(Some(TRIGGER_ACCESS), |conn| {
            self.resume_trigger_inner(conn, key)
        })?;
        self.signaler.signal_scheduling_change(None);
        Ok(())
    }

    /// Pause every trigger in `group` and mark the group so later stores
    /// into it start out PAUSED.
    #[instrument(skip(self))]
    pub fn pause_trigger_group(&self, group: &str) -> Result<()> {
        self.execute_in_lock(Some(TRIGGER_ACCESS), |conn| {
            self.pause_trigger_group_inner(conn, group)
        })
    }

    #[instrument(skip(self))]
    pub fn resume_trigger_group(&self, group: &str) -> Result<()> {
        self.execute_in_lock(Some(TRIGGER_ACCESS), |conn| {
            self.resume_trigger_group_inner(conn, group)
        })?;
        self.signaler.signal_scheduling_change(None);
        Ok(())
    }

    #[instrument(skip(self), fields(job = %job_key))]
    pub fn pause_job(&self, job_key: &Key) -> Result<()> {
        self.execute_in_lock(Some(TRIGGER_ACCESS), |conn| {
            for key in gateway::select_trigger_keys_for_job(conn, job_key)? {
                self.pause_trigger_inner(conn, &key)?;
            }
            Ok(())
        })
    }

    #[instrument(skip(self), fields(job = %job_key))]
    pub fn resume_job(&self, job_key: &Key) -> Result<()> {
        self.execute_in_lock(Some(TRIGGER_ACCESS), |conn| {
            for key in gateway::select_trigger_keys_for_job(conn, job_key)? {
                self.resume_trigger_inner(conn, &key)?;
            }
            Ok(())
        })?;
        self.signaler.signal_scheduling_change(None);
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn pause_job_group(&self, group: &str) -> Result<()> {
        self.execute_in_lock(Some(TRIGGER_ACCESS), |conn| {
            for job_name in gateway::select_job_names_in_group(conn, group)? {
                let job_key = Key::new(group, job_name);
                for key in gateway::select_trigger_keys_for_job(conn, &job_key)? {
                    self.pause_trigger_inner(conn, &key)?;
                }
            }
            Ok(())
        })
    }

    #[instrument(skip(self))]
    pub fn resume_job_group(&self, group: &str) -> Result<()> {
        self.execute_in_lock(Some(TRIGGER_ACCESS), |conn| {
            for job_name in gateway::select_job_names_in_group(conn, group)? {
                let job_key = Key::new(group, job_name);
                for key in gateway::select_trigger_keys_for_job(conn, &job_key)? {
                    self.resume_trigger_inner(conn, &key)?;
                }
            }
            Ok(())
        })?;
        self.signaler.signal_scheduling_change(None);
        Ok(())
    }

    /// Pause every trigger group in the store.
    #[instrument(skip(self))]
    pub fn pause_all(&self) -> Result<()> {
        self.execute_in_lock(Some(TRIGGER_ACCESS), |conn| {
            for group in gateway::select_trigger_group_names(conn)? {
                self.pause_trigger_group_inner(conn, &group)?;
            }
            Ok(())
        })
    }

    /// Resume every trigger group and clear all paused-group markers.
    #[instrument(skip(self))]
    pub fn resume_all(&self) -> Result<()> {
        self.execute_in_lock(Some(TRIGGER_ACCESS), |conn| {
            for group in gateway::select_trigger_group_names(conn)? {
                self.resume_trigger_group_inner(conn, &group)?;
            }
            gateway::delete_all_paused_groups(conn)?;
            Ok(())
        })?;
        self.signaler.signal_scheduling_change(None);
        Ok(())
    }

    fn pause_trigger_inner(&self, conn: &Connection, key: &Key) -> Result<()> {
        match gateway::select_trigger_state(conn, key)? {
            Some(TriggerState::Waiting) => {
                gateway::update_trigger_state(conn, key, TriggerState::Paused)?;
            }
            Some(TriggerState::Blocked) => {
                gateway::update_trigger_state(conn, key, TriggerState::PausedBlocked)?;
            }
            // Executing, acquired, complete, error, already paused, or gone:
            // nothing to pause.
            _ => {}
        }
        Ok(())
    }

    /// Un-pause one trigger, applying its misfire policy if its fire time
    /// slipped past the threshold while paused.
    pub(crate) fn resume_trigger_inner(&self, conn: &Connection, key: &Key) -> Result<()> {
        let state = gateway::select_trigger_state(conn, key)?;
        let blocked = match state {
            Some(TriggerState::Paused) => false,
            Some(TriggerState::PausedBlocked) => true,
            _ => return Ok(()),
        };
        let new_state = if blocked {
            TriggerState::Blocked
        } else {
            TriggerState::Waiting
        };

        let Some(mut trigger) = gateway::select_trigger(conn, key)? else {
            return Ok(());
        };
        let now = now_ms();
        let misfired = trigger
            .next_fire_time_ms
            .is_some_and(|next| next <= now - self.cfg.misfire_threshold_ms);
        if misfired {
            let calendar = match &trigger.calendar_name {
                Some(name) => gateway::select_calendar(conn, name)?,
                None => None,
            };
            schedule::apply_misfire(&mut trigger, calendar.as_ref(), now)?;
            let state = if trigger.next_fire_time_ms.is_none() {
                TriggerState::Complete
            } else {
                new_state
            };
            gateway::update_trigger(conn, &trigger, state)?;
            debug!(trigger = %key, "misfire policy applied on resume");
        } else {
            gateway::update_trigger_state(conn, key, new_state)?;
        }
        Ok(())
    }

    fn pause_trigger_group_inner(&self, conn: &Connection, group: &str) -> Result<()> {
        gateway::update_trigger_group_states_from(
            conn,
            group,
            TriggerState::Paused,
            &[TriggerState::Waiting],
        )?;
        gateway::update_trigger_group_states_from(
            conn,
            group,
            TriggerState::PausedBlocked,
            &[TriggerState::Blocked],
        )?;
        gateway::insert_paused_group(conn, group)?;
        debug!(group, "trigger group paused");
        Ok(())
    }

    fn resume_trigger_group_inner(&self, conn: &Connection, group: &str) -> Result<()> {
        gateway::delete_paused_group(conn, group)?;
        for name in gateway::select_trigger_names_in_group(conn, group)? {
            self.resume_trigger_inner(conn, &Key::new(group, name))?;
        }
        debug!(group, "trigger group resumed");
        Ok(())
    }
}
