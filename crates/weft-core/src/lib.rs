//! # weft-core
//!
//! Core types for the Weft task-orchestration engine.
//!
//! A plan is a set of steps woven together by dependency edges. The
//! scheduler walks the plan batch by batch, the dispatcher bounds how many
//! steps of each resource category run at once, and every component writes
//! what it saw into a shared memory store.
//!
//! ## Core Paradigm
//!
//! - Steps are immutable once a plan is compiled
//! - Task status only moves forward (a failed task may retry)
//! - Memory records are append-only; indexes are always rebuildable
//! - Task-level failures never escape as errors, only plan-level ones do

pub mod config;
mod error;
pub mod fail_open;
mod record;
mod types;

pub use config::{
    CategoryConfig, ClassifierRuleConfig, DependencyFailurePolicy, MemoryConfig,
    ResourcesConfig, RetryConfig, SchedulerConfig, WeftConfig,
};
pub use error::{Result, WeftError};
pub use record::{MemoryRecord, RecordType};
pub use types::*;
