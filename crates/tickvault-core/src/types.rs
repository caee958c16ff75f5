use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Default trigger priority when none is given.
pub const DEFAULT_PRIORITY: i32 = 5;
/// `repeat_count` value meaning "repeat indefinitely".
pub const REPEAT_FOREVER: i32 = -1;
/// Group that synthesized recovery triggers are stored under.
pub const RECOVERY_TRIGGER_GROUP: &str = "recovering_triggers";

/// Payload keys set on recovery triggers so job code can tell it is being
/// re-run on behalf of a crashed peer.
pub const DATA_RECOVERING_TRIGGER_GROUP: &str = "recovering_trigger_group";
pub const DATA_RECOVERING_TRIGGER_NAME: &str = "recovering_trigger_name";
pub const DATA_RECOVERING_FIRE_TIME: &str = "recovering_scheduled_fire_time";

/// `(group, name)` identity shared by jobs and triggers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key {
    pub group: String,
    pub name: String,
}

impl Key {
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

/// Lifecycle state of a trigger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerState {
    /// Eligible for acquisition once its fire time arrives.
    Waiting,
    /// Reserved by one scheduler instance, not yet firing.
    Acquired,
    /// The associated job is running.
    Executing,
    /// No further fire times; kept for inspection until removed.
    Complete,
    /// Paused by a client; will not be acquired.
    Paused,
    /// Held back because a sibling trigger of a stateful job is executing.
    Blocked,
    /// Blocked and paused at the same time.
    PausedBlocked,
    /// The job signalled an unrecoverable error.
    Error,
}

impl std::fmt::Display for TriggerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TriggerState::Waiting => "waiting",
            TriggerState::Acquired => "acquired",
            TriggerState::Executing => "executing",
            TriggerState::Complete => "complete",
            TriggerState::Paused => "paused",
            TriggerState::Blocked => "blocked",
            TriggerState::PausedBlocked => "paused_blocked",
            TriggerState::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TriggerState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(TriggerState::Waiting),
            "acquired" => Ok(TriggerState::Acquired),
            "executing" => Ok(TriggerState::Executing),
            "complete" => Ok(TriggerState::Complete),
            "paused" => Ok(TriggerState::Paused),
            "blocked" => Ok(TriggerState::Blocked),
            "paused_blocked" => Ok(TriggerState::PausedBlocked),
            "error" => Ok(TriggerState::Error),
            other => Err(format!("unknown trigger state: {other}")),
        }
    }
}

/// What to do with a trigger whose fire time slipped past the misfire
/// threshold while it sat in WAITING.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MisfirePolicy {
    /// Pick a sensible policy from the trigger variant at recovery time.
    Smart,
    /// Fire immediately, then continue on the normal schedule.
    FireNow,
    /// Skip the missed runs; next fire is the first slot after now.
    RescheduleNext,
    /// Ignore the misfire entirely — fire late and let the schedule catch up.
    /// Triggers with this policy are skipped by the misfire scan.
    DoNothing,
}

impl std::fmt::Display for MisfirePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MisfirePolicy::Smart => "smart",
            MisfirePolicy::FireNow => "fire_now",
            MisfirePolicy::RescheduleNext => "reschedule_next",
            MisfirePolicy::DoNothing => "do_nothing",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for MisfirePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "smart" => Ok(MisfirePolicy::Smart),
            "fire_now" => Ok(MisfirePolicy::FireNow),
            "reschedule_next" => Ok(MisfirePolicy::RescheduleNext),
            "do_nothing" => Ok(MisfirePolicy::DoNothing),
            other => Err(format!("unknown misfire policy: {other}")),
        }
    }
}

/// Instruction handed to `triggered_job_complete` once a job run finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletedInstruction {
    /// No special handling — trigger returns to WAITING, or is removed if
    /// it has no further fire times.
    NoInstruction,
    /// Remove the trigger (cascades to a non-durable orphaned job).
    DeleteTrigger,
    /// Mark this trigger COMPLETE.
    SetComplete,
    /// Mark this trigger ERROR.
    SetError,
    /// Mark every trigger of the job COMPLETE.
    SetAllJobTriggersComplete,
    /// Mark every trigger of the job ERROR.
    SetAllJobTriggersError,
}

/// Opaque key-value payload carried by jobs and triggers.
pub type JobDataMap = BTreeMap<String, serde_json::Value>;

/// A persisted job definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetail {
    pub key: Key,
    pub description: Option<String>,
    /// Reference to the job implementation the scheduler will run.
    pub job_class: String,
    /// Survives having no triggers.
    pub durable: bool,
    /// Discarded on scheduler restart.
    pub volatile: bool,
    /// Payload is re-persisted after each run and sibling triggers are
    /// blocked while the job executes.
    pub stateful: bool,
    /// Re-fire on a live peer if the owning instance crashes mid-run.
    pub requests_recovery: bool,
    pub data: JobDataMap,
}

impl JobDetail {
    pub fn new(key: Key, job_class: impl Into<String>) -> Self {
        Self {
            key,
            description: None,
            job_class: job_class.into(),
            durable: false,
            volatile: false,
            stateful: false,
            requests_recovery: false,
            data: JobDataMap::new(),
        }
    }
}

/// Variant-specific part of a trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerPayload {
    /// Fixed-interval repetition. `repeat_count` of [`REPEAT_FOREVER`]
    /// repeats indefinitely; `0` fires exactly once.
    Simple {
        repeat_interval_ms: i64,
        repeat_count: i32,
        times_triggered: i32,
    },
    /// Cron-expression schedule, evaluated in the given fixed UTC offset
    /// (`"+02:00"` style) or UTC when absent.
    Cron {
        expression: String,
        time_zone: Option<String>,
    },
    /// Opaque payload owned by the caller; the store treats it as a
    /// one-shot at whatever `next_fire_time` says.
    Blob { data: Vec<u8> },
}

impl TriggerPayload {
    /// Tag stored in the `trigger_kind` column.
    pub fn kind(&self) -> &'static str {
        match self {
            TriggerPayload::Simple { .. } => "simple",
            TriggerPayload::Cron { .. } => "cron",
            TriggerPayload::Blob { .. } => "blob",
        }
    }

}

/// A persisted trigger. State lives in its table row, not here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub key: Key,
    pub job_key: Key,
    pub description: Option<String>,
    pub volatile: bool,
    pub calendar_name: Option<String>,
    pub priority: i32,
    pub misfire_policy: MisfirePolicy,
    pub start_time_ms: i64,
    pub end_time_ms: Option<i64>,
    pub next_fire_time_ms: Option<i64>,
    pub prev_fire_time_ms: Option<i64>,
    pub payload: TriggerPayload,
    /// Payload handed to the job alongside the job's own data map.
    pub data: JobDataMap,
    /// Entry id of this trigger's fired-trigger record while it is
    /// acquired or executing. Set by `acquire_next_trigger`.
    pub fire_instance_id: Option<String>,
}

impl Trigger {
    pub fn new(key: Key, job_key: Key, start_time_ms: i64, payload: TriggerPayload) -> Self {
        Self {
            key,
            job_key,
            description: None,
            volatile: false,
            calendar_name: None,
            priority: DEFAULT_PRIORITY,
            misfire_policy: MisfirePolicy::Smart,
            start_time_ms,
            end_time_ms: None,
            next_fire_time_ms: Some(start_time_ms),
            prev_fire_time_ms: None,
            payload,
            data: JobDataMap::new(),
            fire_instance_id: None,
        }
    }

    /// One-shot simple trigger firing at `fire_time_ms`.
    pub fn one_shot(key: Key, job_key: Key, fire_time_ms: i64) -> Self {
        Self::new(
            key,
            job_key,
            fire_time_ms,
            TriggerPayload::Simple {
                repeat_interval_ms: 0,
                repeat_count: 0,
                times_triggered: 0,
            },
        )
    }
}

/// Everything the scheduler needs to actually run a fired trigger.
#[derive(Debug, Clone)]
pub struct FiredBundle {
    pub job: JobDetail,
    pub trigger: Trigger,
    pub calendar: Option<crate::calendar::Calendar>,
    /// True when this firing replays work lost to a crashed instance.
    pub recovering: bool,
    pub fire_time_ms: i64,
    pub scheduled_fire_time_ms: i64,
    pub prev_fire_time_ms: Option<i64>,
    pub next_fire_time_ms: Option<i64>,
}

/// Durable evidence that one instance has in-flight work for a trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct FiredTriggerRecord {
    pub entry_id: String,
    pub instance_id: String,
    pub trigger_key: Key,
    pub job_key: Key,
    pub state: TriggerState,
    pub is_stateful: bool,
    pub requests_recovery: bool,
    pub fired_time_ms: i64,
    pub priority: i32,
}

/// One scheduler peer's heartbeat row.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerStateRecord {
    pub instance_id: String,
    pub last_checkin_ms: i64,
    pub checkin_interval_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn trigger_state_round_trip() {
        for s in [
            TriggerState::Waiting,
            TriggerState::Acquired,
            TriggerState::Executing,
            TriggerState::Complete,
            TriggerState::Paused,
            TriggerState::Blocked,
            TriggerState::PausedBlocked,
            TriggerState::Error,
        ] {
            assert_eq!(TriggerState::from_str(&s.to_string()).unwrap(), s);
        }
    }

    #[test]
    fn unknown_state_is_rejected() {
        assert!(TriggerState::from_str("pending").is_err());
    }

    #[test]
    fn misfire_policy_round_trip() {
        for p in [
            MisfirePolicy::Smart,
            MisfirePolicy::FireNow,
            MisfirePolicy::RescheduleNext,
            MisfirePolicy::DoNothing,
        ] {
            assert_eq!(MisfirePolicy::from_str(&p.to_string()).unwrap(), p);
        }
    }

    #[test]
    fn payload_kind_tags() {
        let t = Trigger::one_shot(Key::new("g", "t"), Key::new("g", "j"), 0);
        assert_eq!(t.payload.kind(), "simple");
        let c = TriggerPayload::Cron {
            expression: "0 0 * * * *".into(),
            time_zone: None,
        };
        assert_eq!(c.kind(), "cron");
    }

    #[test]
    fn one_shot_starts_at_fire_time() {
        let t = Trigger::one_shot(Key::new("g", "t"), Key::new("g", "j"), 42);
        assert_eq!(t.next_fire_time_ms, Some(42));
        assert_eq!(t.prev_fire_time_ms, None);
    }
}
