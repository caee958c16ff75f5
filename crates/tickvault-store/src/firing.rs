//! Trigger acquisition and the firing state machine: WAITING → ACQUIRED →
//! EXECUTING and back, misfire recovery, and completion handling.

use rusqlite::Connection;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use tickvault_core::error::{Result, StoreError};
use tickvault_core::schedule;
use tickvault_core::types::{
    CompletedInstruction, FiredBundle, FiredTriggerRecord, JobDetail, Trigger, TriggerState,
    RECOVERY_TRIGGER_GROUP,
};

use crate::conn;
use crate::gateway;
use crate::lock::TRIGGER_ACCESS;
use crate::store::{now_ms, JobStore};

/// Candidates fetched per acquisition round. Losing the row CAS to a peer
/// moves on to the next candidate instead of giving up.
const ACQUIRE_CANDIDATES: usize = 5;
/// Re-select rounds before reporting that nothing is acquirable.
const ACQUIRE_ROUNDS: usize = 3;

impl JobStore {
    /// Reserve the next trigger due no later than `no_later_than_ms` for
    /// this instance. Returns `None` when nothing is eligible.
    #[instrument(skip(self))]
    pub fn acquire_next_trigger(&self, no_later_than_ms: i64) -> Result<Option<Trigger>> {
        self.execute_in_lock(Some(TRIGGER_ACCESS), |conn| {
            self.acquire_next_trigger_inner(conn, no_later_than_ms)
        })
    }

    fn acquire_next_trigger_inner(
        &self,
        conn: &Connection,
        no_later_than_ms: i64,
    ) -> Result<Option<Trigger>> {
        for _ in 0..ACQUIRE_ROUNDS {
            let candidates =
                gateway::select_next_trigger_keys(conn, no_later_than_ms, ACQUIRE_CANDIDATES)?;
            if candidates.is_empty() {
                return Ok(None);
            }
            for key in candidates {
                // Single-row CAS: exactly one peer wins this trigger.
                let won = gateway::update_trigger_state_from(
                    conn,
                    &key,
                    TriggerState::Acquired,
                    &[TriggerState::Waiting],
                )? == 1;
                if !won {
                    continue;
                }
                let Some(mut trigger) = gateway::select_trigger(conn, &key)? else {
                    continue;
                };
                let Some(job) = gateway::select_job(conn, &trigger.job_key)? else {
                    warn!(trigger = %key, "acquired trigger references a missing job");
                    gateway::update_trigger_state(conn, &key, TriggerState::Error)?;
                    continue;
                };

                let entry_id = Uuid::new_v4().to_string();
                gateway::insert_fired_trigger(
                    conn,
                    &FiredTriggerRecord {
                        entry_id: entry_id.clone(),
                        instance_id: self.instance_id.clone(),
                        trigger_key: trigger.key.clone(),
                        job_key: job.key.clone(),
                        state: TriggerState::Acquired,
                        is_stateful: job.stateful,
                        requests_recovery: job.requests_recovery,
                        fired_time_ms: trigger.next_fire_time_ms.unwrap_or_else(now_ms),
                        priority: trigger.priority,
                    },
                )?;
                trigger.fire_instance_id = Some(entry_id);
                debug!(trigger = %trigger.key, "trigger acquired");
                return Ok(Some(trigger));
            }
        }
        Ok(None)
    }

    /// Give back a trigger this instance acquired but will not fire.
    #[instrument(skip(self, trigger), fields(trigger = %trigger.key))]
    pub fn release_acquired_trigger(&self, trigger: &Trigger) -> Result<()> {
        self.execute_in_lock(Some(TRIGGER_ACCESS), |conn| {
            gateway::update_trigger_state_from(
                conn,
                &trigger.key,
                TriggerState::Waiting,
                &[TriggerState::Acquired],
            )?;
            if let Some(entry_id) = &trigger.fire_instance_id {
                gateway::delete_fired_trigger(conn, entry_id)?;
            }
            Ok(())
        })
    }

    /// The scheduler is about to run the trigger's job. Moves the trigger
    /// to EXECUTING, advances its schedule, and hands back everything the
    /// job run needs. Returns `None` if the trigger was paused, replaced,
    /// or deleted since acquisition.
    ///
    /// A concurrently removed job is special-cased: the fired-trigger
    /// cleanup is captured, the transaction still commits, and the error
    /// is rethrown afterwards.
    #[instrument(skip(self, trigger), fields(trigger = %trigger.key))]
    pub fn trigger_fired(&self, trigger: &Trigger) -> Result<Option<FiredBundle>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        conn::begin(&conn, true)?;

        let mut owner = false;
        let inner = self.locks.obtain(&conn, TRIGGER_ACCESS).and_then(|owned| {
            owner = owned;
            self.trigger_fired_inner(&conn, trigger)
        });

        let outcome = match inner {
            Ok(bundle) => conn::commit(&conn).map(|()| bundle),
            Err(e @ StoreError::JobDoesNotExist { .. }) => {
                // Partial success: commit the bookkeeping (fired-record
                // deletion), then surface the error.
                match conn::commit(&conn) {
                    Ok(()) => Err(e),
                    Err(commit_err) => Err(commit_err),
                }
            }
            Err(e) => {
                if let Err(rb) = conn::rollback(&conn) {
                    warn!(error = %rb, "rollback failed in trigger_fired");
                }
                Err(e)
            }
        };

        if let Err(e) = self.locks.release(&conn, TRIGGER_ACCESS, owner) {
            warn!(error = %e, "lock release failed in trigger_fired");
        }
        outcome
    }

    fn trigger_fired_inner(
        &self,
        conn: &Connection,
        trigger: &Trigger,
    ) -> Result<Option<FiredBundle>> {
        // Raced with a pause or delete since acquisition?
        if gateway::select_trigger_state(conn, &trigger.key)? != Some(TriggerState::Acquired) {
            return Ok(None);
        }

        let Some(job) = gateway::select_job(conn, &trigger.job_key)? else {
            if let Some(entry_id) = &trigger.fire_instance_id {
                gateway::delete_fired_trigger(conn, entry_id)?;
            }
            return Err(StoreError::JobDoesNotExist {
                key: trigger.job_key.to_string(),
            });
        };

        let calendar = match &trigger.calendar_name {
            Some(name) => match gateway::select_calendar(conn, name)? {
                Some(c) => Some(c),
                // Calendar vanished: the firing cannot be honored.
                None => return Ok(None),
            },
            None => None,
        };

        let mut fired = trigger.clone();
        let scheduled_fire_time_ms = fired.next_fire_time_ms.unwrap_or_else(now_ms);

        if let Some(entry_id) = &fired.fire_instance_id {
            gateway::update_fired_trigger_state(conn, entry_id, TriggerState::Executing)?;
        }

        schedule::triggered(&mut fired, calendar.as_ref())?;
        gateway::update_trigger(conn, &fired, TriggerState::Executing)?;

        if job.stateful {
            // Hold the job's other triggers until this run completes.
            gateway::update_trigger_states_for_job_from(
                conn,
                &job.key,
                TriggerState::Blocked,
                &[TriggerState::Waiting, TriggerState::Acquired],
            )?;
            gateway::update_trigger_states_for_job_from(
                conn,
                &job.key,
                TriggerState::PausedBlocked,
                &[TriggerState::Paused],
            )?;
        }

        let recovering = fired.key.group == RECOVERY_TRIGGER_GROUP;
        info!(
            trigger = %fired.key,
            job = %job.key,
            recovering,
            "trigger fired"
        );
        Ok(Some(FiredBundle {
            prev_fire_time_ms: fired.prev_fire_time_ms,
            next_fire_time_ms: fired.next_fire_time_ms,
            calendar,
            recovering,
            fire_time_ms: now_ms(),
            scheduled_fire_time_ms,
            trigger: fired,
            job,
        }))
    }

    /// The job run finished; apply the completion instruction, unblock
    /// stateful siblings, persist mutated payloads, and drop the
    /// fired-trigger record.
    #[instrument(skip(self, trigger, job), fields(trigger = %trigger.key, job = %job.key))]
    pub fn triggered_job_complete(
        &self,
        trigger: &Trigger,
        job: &JobDetail,
        instruction: CompletedInstruction,
    ) -> Result<()> {
        self.execute_in_lock(Some(TRIGGER_ACCESS), |conn| {
            match instruction {
                CompletedInstruction::NoInstruction => {
                    if trigger.next_fire_time_ms.is_none() {
                        // The schedule is exhausted. Check the stored row
                        // too so a concurrently replaced trigger (with
                        // fires left) survives.
                        if let Some(stored) = gateway::select_trigger(conn, &trigger.key)? {
                            if stored.next_fire_time_ms.is_none() {
                                self.remove_trigger_inner(conn, &trigger.key)?;
                                debug!(trigger = %trigger.key, "exhausted trigger removed");
                            }
                        }
                    } else {
                        gateway::update_trigger_state_from(
                            conn,
                            &trigger.key,
                            TriggerState::Waiting,
                            &[TriggerState::Executing],
                        )?;
                    }
                }
                CompletedInstruction::DeleteTrigger => {
                    self.remove_trigger_inner(conn, &trigger.key)?;
                }
                CompletedInstruction::SetComplete => {
                    gateway::update_trigger_state(conn, &trigger.key, TriggerState::Complete)?;
                }
                CompletedInstruction::SetError => {
                    warn!(trigger = %trigger.key, "trigger marked ERROR by job");
                    gateway::update_trigger_state(conn, &trigger.key, TriggerState::Error)?;
                }
                CompletedInstruction::SetAllJobTriggersComplete => {
                    gateway::update_trigger_states_for_job(
                        conn,
                        &trigger.job_key,
                        TriggerState::Complete,
                    )?;
                }
                CompletedInstruction::SetAllJobTriggersError => {
                    warn!(job = %trigger.job_key, "all job triggers marked ERROR");
                    gateway::update_trigger_states_for_job(
                        conn,
                        &trigger.job_key,
                        TriggerState::Error,
                    )?;
                }
            }

            if job.stateful {
                gateway::update_job_data(conn, &job.key, &job.data)?;
                gateway::update_trigger_states_for_job_from(
                    conn,
                    &job.key,
                    TriggerState::Waiting,
                    &[TriggerState::Blocked],
                )?;
                gateway::update_trigger_states_for_job_from(
                    conn,
                    &job.key,
                    TriggerState::Paused,
                    &[TriggerState::PausedBlocked],
                )?;
            }

            if let Some(entry_id) = &trigger.fire_instance_id {
                gateway::delete_fired_trigger(conn, entry_id)?;
            }
            Ok(())
        })?;
        self.signaler.signal_scheduling_change(None);
        Ok(())
    }

    /// One misfire-recovery pass. Returns true when a full batch was
    /// processed and the caller should come back promptly.
    #[instrument(skip(self))]
    pub fn recover_misfires(&self) -> Result<bool> {
        let (handled, more) = self.execute_in_lock(Some(TRIGGER_ACCESS), |conn| {
            self.recover_misfired_jobs_inner(conn)
        })?;
        if handled > 0 {
            self.signaler.signal_scheduling_change(None);
        }
        Ok(more)
    }

    /// Apply misfire policies to up to one batch of overdue WAITING
    /// triggers. Returns `(handled, more_to_do)`.
    pub(crate) fn recover_misfired_jobs_inner(
        &self,
        conn: &Connection,
    ) -> Result<(usize, bool)> {
        let limit = self.cfg.max_misfires_to_handle_at_a_time.max(1);
        let now = now_ms();
        let horizon = now - self.cfg.misfire_threshold_ms;

        // One extra row tells us whether a full batch remains behind.
        let keys = gateway::select_misfired_trigger_keys(conn, horizon, limit + 1)?;
        let more = keys.len() > limit;
        let mut handled = 0;

        for key in keys.into_iter().take(limit) {
            let Some(mut trigger) = gateway::select_trigger(conn, &key)? else {
                continue;
            };
            let calendar = match &trigger.calendar_name {
                Some(name) => gateway::select_calendar(conn, name)?,
                None => None,
            };
            schedule::apply_misfire(&mut trigger, calendar.as_ref(), now)?;
            let state = if trigger.next_fire_time_ms.is_none() {
                TriggerState::Complete
            } else {
                TriggerState::Waiting
            };
            gateway::update_trigger(conn, &trigger, state)?;
            handled += 1;
            debug!(trigger = %key, new_state = %state, "misfire handled");
        }

        if handled > 0 {
            info!(handled, more, "misfired triggers recovered");
        }
        Ok((handled, more))
    }
}
