use std::str::FromStr;

use chrono::{FixedOffset, TimeZone, Utc};
use cron::Schedule as CronSchedule;
use tracing::warn;

use crate::calendar::Calendar;
use crate::error::{Result, StoreError};
use crate::types::{MisfirePolicy, Trigger, TriggerPayload, REPEAT_FOREVER};

/// Bound on calendar-skip recomputations per advance.
const MAX_CALENDAR_SKIPS: usize = 400;

/// Validate the variant payload without touching the database. Called by
/// the store before any trigger row is written.
pub fn validate(trigger: &Trigger) -> Result<()> {
    match &trigger.payload {
        TriggerPayload::Simple {
            repeat_interval_ms,
            repeat_count,
            ..
        } => {
            if *repeat_count != 0 && *repeat_interval_ms < 1 {
                return Err(StoreError::InvalidSchedule(
                    "repeating trigger needs a positive repeat interval".into(),
                ));
            }
            if *repeat_count < REPEAT_FOREVER {
                return Err(StoreError::InvalidSchedule(format!(
                    "bad repeat count: {repeat_count}"
                )));
            }
            Ok(())
        }
        TriggerPayload::Cron {
            expression,
            time_zone,
        } => {
            CronSchedule::from_str(expression)
                .map_err(|e| StoreError::InvalidSchedule(format!("bad cron expression: {e}")))?;
            if let Some(tz) = time_zone {
                FixedOffset::from_str(tz).map_err(|e| {
                    StoreError::InvalidSchedule(format!("bad time-zone offset {tz}: {e}"))
                })?;
            }
            Ok(())
        }
        TriggerPayload::Blob { .. } => Ok(()),
    }
}

/// First fire time of a trigger that has never fired, honoring its
/// calendar. `None` means the trigger will never fire.
pub fn compute_first_fire_time(trigger: &Trigger, cal: Option<&Calendar>) -> Result<Option<i64>> {
    let first = match &trigger.payload {
        TriggerPayload::Simple { .. } => Some(trigger.start_time_ms),
        TriggerPayload::Cron { .. } => cron_next(trigger, trigger.start_time_ms - 1)?,
        // Opaque payload: trust whatever the caller scheduled.
        TriggerPayload::Blob { .. } => trigger
            .next_fire_time_ms
            .or(Some(trigger.start_time_ms)),
    };
    let first = match first {
        Some(t) if past_end(trigger, t) => None,
        other => other,
    };
    skip_excluded(trigger, cal, first)
}

/// The first fire time strictly after `after_ms`, ignoring calendars.
/// `None` when the schedule is exhausted.
pub fn next_fire_after(trigger: &Trigger, after_ms: i64) -> Result<Option<i64>> {
    let candidate = match &trigger.payload {
        TriggerPayload::Simple {
            repeat_interval_ms,
            repeat_count,
            ..
        } => {
            let start = trigger.start_time_ms;
            if after_ms < start {
                Some(start)
            } else if *repeat_count == 0 || *repeat_interval_ms < 1 {
                None
            } else {
                // First multiple of the interval strictly after `after_ms`.
                let n = (after_ms - start) / repeat_interval_ms + 1;
                if *repeat_count != REPEAT_FOREVER && n > *repeat_count as i64 {
                    None
                } else {
                    Some(start + n * repeat_interval_ms)
                }
            }
        }
        TriggerPayload::Cron { .. } => cron_next(trigger, after_ms)?,
        TriggerPayload::Blob { .. } => None,
    };
    Ok(candidate.filter(|t| !past_end(trigger, *t)))
}

/// Record a firing: previous fire time becomes the scheduled time, the
/// repeat counter advances, and the next fire time is recomputed with
/// calendar exclusions applied.
pub fn triggered(trigger: &mut Trigger, cal: Option<&Calendar>) -> Result<()> {
    let fired_at = trigger.next_fire_time_ms;
    trigger.prev_fire_time_ms = fired_at;

    if let TriggerPayload::Simple {
        repeat_count,
        times_triggered,
        ..
    } = &mut trigger.payload
    {
        *times_triggered += 1;
        if *repeat_count != REPEAT_FOREVER && *times_triggered > *repeat_count {
            trigger.next_fire_time_ms = None;
            return Ok(());
        }
    }

    let next = match fired_at {
        Some(t) => next_fire_after(trigger, t)?,
        None => None,
    };
    trigger.next_fire_time_ms = skip_excluded(trigger, cal, next)?;
    Ok(())
}

/// Apply the trigger's misfire policy at `now_ms`. Leaves the trigger in
/// WAITING semantics; a resulting `None` next fire time means the caller
/// should mark it COMPLETE.
pub fn apply_misfire(trigger: &mut Trigger, cal: Option<&Calendar>, now_ms: i64) -> Result<()> {
    match resolve_smart(trigger) {
        MisfirePolicy::FireNow => {
            let t = cal.map_or(now_ms, |c| c.next_included_time(now_ms));
            trigger.next_fire_time_ms = Some(t);
        }
        MisfirePolicy::RescheduleNext => {
            let next = next_fire_after(trigger, now_ms)?;
            trigger.next_fire_time_ms = skip_excluded(trigger, cal, next)?;
        }
        MisfirePolicy::DoNothing => {}
        MisfirePolicy::Smart => unreachable!("smart policy resolves to a concrete one"),
    }
    Ok(())
}

/// Re-align an existing next fire time after its calendar changed.
pub fn realign_to_calendar(trigger: &mut Trigger, cal: &Calendar) -> Result<()> {
    if let Some(next) = trigger.next_fire_time_ms {
        if !cal.is_time_included(next) {
            trigger.next_fire_time_ms = skip_excluded(trigger, Some(cal), Some(next))?;
        }
    }
    Ok(())
}

/// Concrete policy for a trigger whose configured policy may be Smart.
fn resolve_smart(trigger: &Trigger) -> MisfirePolicy {
    if trigger.misfire_policy != MisfirePolicy::Smart {
        return trigger.misfire_policy;
    }
    match &trigger.payload {
        TriggerPayload::Simple { repeat_count: 0, .. } => MisfirePolicy::FireNow,
        TriggerPayload::Simple { .. } => MisfirePolicy::RescheduleNext,
        TriggerPayload::Cron { .. } => MisfirePolicy::FireNow,
        TriggerPayload::Blob { .. } => MisfirePolicy::FireNow,
    }
}

/// Walk `candidate` forward until the calendar admits it (or the schedule
/// runs out). Bounded so a degenerate calendar cannot spin forever.
fn skip_excluded(
    trigger: &Trigger,
    cal: Option<&Calendar>,
    candidate: Option<i64>,
) -> Result<Option<i64>> {
    let Some(cal) = cal else {
        return Ok(candidate);
    };
    let mut next = candidate;
    for _ in 0..MAX_CALENDAR_SKIPS {
        match next {
            Some(t) if !cal.is_time_included(t) => {
                next = next_fire_after(trigger, t)?;
            }
            other => return Ok(other),
        }
    }
    warn!(trigger = %trigger.key, "calendar excluded every candidate fire time");
    Ok(None)
}

fn past_end(trigger: &Trigger, ts_ms: i64) -> bool {
    trigger.end_time_ms.is_some_and(|end| ts_ms >= end)
}

fn cron_next(trigger: &Trigger, after_ms: i64) -> Result<Option<i64>> {
    let TriggerPayload::Cron {
        expression,
        time_zone,
    } = &trigger.payload
    else {
        return Ok(None);
    };
    let schedule = CronSchedule::from_str(expression)
        .map_err(|e| StoreError::InvalidSchedule(format!("bad cron expression: {e}")))?;

    let next = match time_zone {
        Some(tz) => {
            let offset = FixedOffset::from_str(tz).map_err(|e| {
                StoreError::InvalidSchedule(format!("bad time-zone offset {tz}: {e}"))
            })?;
            let after = offset
                .timestamp_millis_opt(after_ms)
                .single()
                .ok_or_else(|| StoreError::InvalidSchedule("timestamp out of range".into()))?;
            schedule.after(&after).next().map(|d| d.timestamp_millis())
        }
        None => {
            let after = Utc
                .timestamp_millis_opt(after_ms)
                .single()
                .ok_or_else(|| StoreError::InvalidSchedule("timestamp out of range".into()))?;
            schedule.after(&after).next().map(|d| d.timestamp_millis())
        }
    };
    Ok(next)
}
