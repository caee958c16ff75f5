//! Cluster coordination: the check-in heartbeat, failed-peer recovery, and
//! this instance's own startup recovery. Also hosts the periodic loops a
//! deployment spawns alongside its scheduler.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use tickvault_core::config::CHECKIN_FAILURE_FACTOR;
use tickvault_core::error::{Result, StoreError};
use tickvault_core::types::{
    FiredTriggerRecord, Key, MisfirePolicy, SchedulerStateRecord, Trigger, TriggerState,
    DATA_RECOVERING_FIRE_TIME, DATA_RECOVERING_TRIGGER_GROUP, DATA_RECOVERING_TRIGGER_NAME,
    RECOVERY_TRIGGER_GROUP,
};

use crate::conn;
use crate::gateway;
use crate::lock::{STATE_ACCESS, TRIGGER_ACCESS};
use crate::store::{now_ms, JobStore};

/// Pause between misfire passes when a full batch was just handled.
const MISFIRE_RESCAN_DELAY_MS: u64 = 50;

impl JobStore {
    /// Run once when the owning scheduler starts. Clustered stores join
    /// the cluster with a first check-in (which recovers this instance's
    /// own stale work); standalone stores recover directly.
    #[instrument(skip(self))]
    pub fn scheduler_started(&self) -> Result<()> {
        if self.cfg.is_clustered {
            self.do_checkin()?;
        } else {
            self.execute_in_lock(Some(TRIGGER_ACCESS), |conn| self.recover_jobs_inner(conn))?;
        }
        Ok(())
    }

    /// Periodic cluster heartbeat. Writes this instance's check-in time
    /// and, when peers have gone stale, recovers their in-flight work.
    /// Returns whether any recovery ran.
    ///
    /// `STATE_ACCESS` serializes detection so only one live peer recovers
    /// a given failed instance; `TRIGGER_ACCESS` is taken only when there
    /// is actually something to recover.
    #[instrument(skip(self))]
    pub fn do_checkin(&self) -> Result<bool> {
        let conn = self
            .pool
            .get()
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        conn::begin(&conn, true)?;

        let mut state_owner = false;
        let mut trigger_owner = false;
        let mut recovered = false;

        let inner: Result<()> = (|| {
            state_owner = self.locks.obtain(&conn, STATE_ACCESS)?;
            let failed = self.cluster_check_in_inner(&conn)?;
            if !failed.is_empty() {
                trigger_owner = self.locks.obtain(&conn, TRIGGER_ACCESS)?;
                self.cluster_recover_inner(&conn, &failed)?;
                recovered = true;
            }
            Ok(())
        })();

        let outcome = match inner {
            Ok(()) => conn::commit(&conn).map(|()| recovered),
            Err(e) => {
                if let Err(rb) = conn::rollback(&conn) {
                    warn!(error = %rb, "rollback failed in do_checkin");
                }
                Err(e)
            }
        };

        if let Err(e) = self.locks.release(&conn, TRIGGER_ACCESS, trigger_owner) {
            warn!(error = %e, "trigger lock release failed in do_checkin");
        }
        if let Err(e) = self.locks.release(&conn, STATE_ACCESS, state_owner) {
            warn!(error = %e, "state lock release failed in do_checkin");
        }

        if outcome.is_ok() {
            self.first_checkin.store(false, Ordering::SeqCst);
            if recovered {
                self.signaler.signal_scheduling_change(None);
            }
        }
        outcome
    }

    /// Detect failed peers and record this instance's heartbeat.
    fn cluster_check_in_inner(&self, conn: &Connection) -> Result<Vec<SchedulerStateRecord>> {
        let now = now_ms();
        let first = self.first_checkin.load(Ordering::SeqCst);
        let mut failed = Vec::new();

        for rec in gateway::select_scheduler_states(conn)? {
            if rec.instance_id == self.instance_id {
                // A pre-existing row under our own id means a prior run of
                // this instance died without cleaning up. Recover it once.
                if first {
                    info!(instance = %rec.instance_id, "recovering own stale state row");
                    failed.push(rec);
                }
                continue;
            }
            let deadline = rec.last_checkin_ms
                + rec.checkin_interval_ms.saturating_mul(CHECKIN_FAILURE_FACTOR);
            if now > deadline {
                warn!(
                    instance = %rec.instance_id,
                    late_ms = now - rec.last_checkin_ms,
                    "peer missed its check-in deadline"
                );
                failed.push(rec);
            }
        }

        // Heartbeat upsert.
        let updated = gateway::update_scheduler_state_checkin(conn, &self.instance_id, now)?;
        if updated == 0 {
            gateway::insert_scheduler_state(
                conn,
                &SchedulerStateRecord {
                    instance_id: self.instance_id.clone(),
                    last_checkin_ms: now,
                    checkin_interval_ms: self.cfg.cluster_checkin_interval_ms,
                },
            )?;
        }
        Ok(failed)
    }

    /// Take over the in-flight work of each failed instance: synthesize
    /// recovery triggers for recoverable jobs, put the original triggers
    /// back in play, and drop the dead instance's records.
    fn cluster_recover_inner(
        &self,
        conn: &Connection,
        failed: &[SchedulerStateRecord],
    ) -> Result<()> {
        for state_rec in failed {
            let instance = &state_rec.instance_id;
            let fired = gateway::select_fired_triggers_of_instance(conn, instance)?;
            let mut recovered = 0;

            for rec in &fired {
                if self.create_recovery_trigger(conn, rec)? {
                    recovered += 1;
                }
                // The original trigger goes back to runnable (or plain
                // paused) so some live peer can pick it up.
                gateway::update_trigger_state_from(
                    conn,
                    &rec.trigger_key,
                    TriggerState::Waiting,
                    &[
                        TriggerState::Acquired,
                        TriggerState::Blocked,
                        TriggerState::Executing,
                    ],
                )?;
                gateway::update_trigger_state_from(
                    conn,
                    &rec.trigger_key,
                    TriggerState::Paused,
                    &[TriggerState::PausedBlocked],
                )?;
                if rec.is_stateful {
                    // The job is no longer executing anywhere: unblock its
                    // other triggers.
                    gateway::update_trigger_states_for_job_from(
                        conn,
                        &rec.job_key,
                        TriggerState::Waiting,
                        &[TriggerState::Blocked],
                    )?;
                    gateway::update_trigger_states_for_job_from(
                        conn,
                        &rec.job_key,
                        TriggerState::Paused,
                        &[TriggerState::PausedBlocked],
                    )?;
                }
            }

            gateway::delete_fired_triggers_of_instance(conn, instance)?;
            // Our own row was just refreshed by the heartbeat; only dead
            // peers lose their state row.
            if instance != &self.instance_id {
                gateway::delete_scheduler_state(conn, instance)?;
            }
            info!(
                instance = %instance,
                in_flight = fired.len(),
                recovered,
                "failed scheduler instance recovered"
            );
        }
        Ok(())
    }

    /// Synthesize a one-shot WAITING trigger replaying `rec`'s firing.
    /// Returns false when the job is gone or does not request recovery.
    fn create_recovery_trigger(&self, conn: &Connection, rec: &FiredTriggerRecord) -> Result<bool> {
        if !rec.requests_recovery {
            return Ok(false);
        }
        let Some(job) = gateway::select_job(conn, &rec.job_key)? else {
            debug!(job = %rec.job_key, "job vanished; skipping recovery trigger");
            return Ok(false);
        };
        if !job.requests_recovery {
            return Ok(false);
        }

        let key = Key::new(
            RECOVERY_TRIGGER_GROUP,
            format!("recover_{}_{}", rec.instance_id, rec.entry_id),
        );
        let mut trigger = Trigger::one_shot(key, rec.job_key.clone(), rec.fired_time_ms);
        trigger.priority = rec.priority;
        trigger.misfire_policy = MisfirePolicy::FireNow;
        trigger.data.insert(
            DATA_RECOVERING_TRIGGER_GROUP.to_string(),
            serde_json::Value::String(rec.trigger_key.group.clone()),
        );
        trigger.data.insert(
            DATA_RECOVERING_TRIGGER_NAME.to_string(),
            serde_json::Value::String(rec.trigger_key.name.clone()),
        );
        trigger.data.insert(
            DATA_RECOVERING_FIRE_TIME.to_string(),
            serde_json::Value::from(rec.fired_time_ms),
        );

        self.store_trigger_inner(conn, &trigger, Some(&job), false, TriggerState::Waiting, true)?;
        info!(trigger = %trigger.key, job = %job.key, "recovery trigger enqueued");
        Ok(true)
    }

    /// Standalone startup recovery: reset this instance's in-flight state,
    /// replay recoverable work, drop volatile definitions, and run one
    /// misfire pass.
    pub(crate) fn recover_jobs_inner(&self, conn: &Connection) -> Result<()> {
        // Anything left ACQUIRED/BLOCKED/EXECUTING by the previous run of
        // this process is no longer in flight.
        let reset = gateway::update_trigger_states_from(
            conn,
            TriggerState::Waiting,
            &[
                TriggerState::Acquired,
                TriggerState::Blocked,
                TriggerState::Executing,
            ],
        )? + gateway::update_trigger_states_from(
            conn,
            TriggerState::Paused,
            &[TriggerState::PausedBlocked],
        )?;
        if reset > 0 {
            info!(count = reset, "in-flight triggers reset to runnable states");
        }

        let fired = gateway::select_fired_triggers_of_instance(conn, &self.instance_id)?;
        let mut recovered = 0;
        for rec in &fired {
            if self.create_recovery_trigger(conn, rec)? {
                recovered += 1;
            }
        }
        gateway::delete_fired_triggers_of_instance(conn, &self.instance_id)?;
        if !fired.is_empty() {
            info!(in_flight = fired.len(), recovered, "own fired-trigger records replayed");
        }

        // Exhausted triggers from the previous run are garbage now.
        for key in gateway::select_trigger_keys_in_state(conn, TriggerState::Complete)? {
            self.remove_trigger_inner(conn, &key)?;
        }

        self.clean_volatile_inner(conn)?;
        self.recover_misfired_jobs_inner(conn)?;
        Ok(())
    }

    /// Volatile jobs and triggers do not survive a restart.
    fn clean_volatile_inner(&self, conn: &Connection) -> Result<()> {
        let mut dropped = 0;
        for key in gateway::select_volatile_trigger_keys(conn)? {
            dropped += gateway::delete_trigger(conn, &key)?;
        }
        for key in gateway::select_volatile_job_keys(conn)? {
            for trigger_key in gateway::select_trigger_keys_for_job(conn, &key)? {
                dropped += gateway::delete_trigger(conn, &trigger_key)?;
            }
            dropped += gateway::delete_job(conn, &key)?;
        }
        if dropped > 0 {
            info!(count = dropped, "volatile definitions dropped");
        }
        Ok(())
    }
}

/// Periodic check-in loop for clustered deployments. Ticks at the
/// configured check-in interval until `shutdown` broadcasts `true`.
pub struct ClusterManager {
    store: Arc<JobStore>,
}

impl ClusterManager {
    pub fn new(store: Arc<JobStore>) -> Self {
        Self { store }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let period = self.store.config().cluster_checkin_interval_ms.max(1) as u64;
        let mut interval = tokio::time::interval(Duration::from_millis(period));
        info!(period_ms = period, "cluster manager started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.store.do_checkin() {
                        Ok(true) => debug!("check-in recovered failed peers"),
                        Ok(false) => {}
                        Err(e) => error!("cluster check-in failed: {e}"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("cluster manager shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Periodic misfire scan. Re-runs promptly while full batches keep coming
/// back, then settles to one pass per misfire threshold.
pub struct MisfireScanner {
    store: Arc<JobStore>,
}

impl MisfireScanner {
    pub fn new(store: Arc<JobStore>) -> Self {
        Self { store }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("misfire scanner started");
        loop {
            let delay = match self.store.recover_misfires() {
                Ok(true) => Duration::from_millis(MISFIRE_RESCAN_DELAY_MS),
                Ok(false) => {
                    Duration::from_millis(self.store.config().misfire_threshold_ms.max(1) as u64)
                }
                Err(e) => {
                    error!("misfire recovery failed: {e}");
                    Duration::from_millis(self.store.config().misfire_threshold_ms.max(1) as u64)
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("misfire scanner shutting down");
                        break;
                    }
                }
            }
        }
    }
}
