//! `tickvault-store` — durable, clustered persistence for a job scheduler.
//!
//! # Overview
//!
//! The [`JobStore`] translates scheduler calls (store a job, pause a
//! trigger, hand me the next trigger to fire, this job finished) into
//! single-transaction units of work against a fixed set of SQLite tables.
//! Multiple scheduler instances may share one database file; correctness
//! under concurrent peers rests on three pieces:
//!
//! | Piece            | Mechanism                                          |
//! |------------------|----------------------------------------------------|
//! | Named locks      | Row writes in the `locks` table, held to commit    |
//! | State CAS        | `UPDATE … WHERE state = old` row counts            |
//! | Check-in         | Heartbeat rows; stale peers get their work recovered |
//!
//! Every public operation follows the same envelope: borrow a pooled
//! connection, begin, obtain the lock the contract requires, do the work,
//! commit or roll back, always release the lock and return the connection.

pub mod cluster;
pub mod conn;
pub mod db;
pub mod firing;
pub mod gateway;
pub mod lock;
pub mod store;

pub use cluster::{ClusterManager, MisfireScanner};
pub use lock::{
    DbRowLockHandler, InProcessLockHandler, LockHandler, CALENDAR_ACCESS, STATE_ACCESS,
    TRIGGER_ACCESS,
};
pub use store::{JobStore, NoopSignaler, SchedulerSignaler};

pub use tickvault_core::{
    Calendar, CompletedInstruction, FiredBundle, JobDataMap, JobDetail, Key, MisfirePolicy,
    Result, StoreConfig, StoreError, Trigger, TriggerPayload, TriggerState,
    RECOVERY_TRIGGER_GROUP,
};
