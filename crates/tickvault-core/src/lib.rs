//! `tickvault-core` — domain model for the tickvault job store.
//!
//! # Overview
//!
//! Jobs are units of work identified by `(group, name)`; triggers are
//! fireable schedules attached to exactly one job. The store crate drives
//! trigger rows through their lifecycle; this crate owns the vocabulary:
//! keys, job and trigger records, trigger states, calendars, misfire
//! policies, and the pure schedule math that computes fire times.
//!
//! # Trigger variants
//!
//! | Variant  | Behaviour                                              |
//! |----------|--------------------------------------------------------|
//! | `Simple` | Fixed interval, bounded or unbounded repeat count      |
//! | `Cron`   | Cron expression, optional fixed UTC-offset time zone   |
//! | `Blob`   | Opaque payload; treated as a one-shot by the store     |

pub mod calendar;
pub mod config;
pub mod error;
pub mod schedule;
pub mod types;

pub use calendar::Calendar;
pub use config::{StoreConfig, AUTO_INSTANCE_ID, CHECKIN_FAILURE_FACTOR};
pub use error::{Result, StoreError};
pub use types::{
    CompletedInstruction, FiredBundle, FiredTriggerRecord, JobDataMap, JobDetail, Key,
    MisfirePolicy, SchedulerStateRecord, Trigger, TriggerPayload, TriggerState,
    DEFAULT_PRIORITY, RECOVERY_TRIGGER_GROUP, REPEAT_FOREVER,
};
