//! # weft-orchestrator
//!
//! Execution side of Weft.
//!
//! - [`Scheduler`] walks a compiled plan batch by batch
//! - [`ResourceDispatcher`] bounds concurrency per resource category
//! - [`HandlerRegistry`] maps categories to the handlers that run steps
//! - [`ErrorRecovery`] classifies failures, decides retries and learns fixes
//! - [`TaskList`] snapshots a run so it can be resumed

pub mod aggregator;
pub mod dispatcher;
pub mod executor;
pub mod handler;
pub mod recovery;
pub mod scheduler;
pub mod task_list;

pub use aggregator::ResultAggregator;
pub use dispatcher::{CategoryStats, ResourceDispatcher, SlotRequest};
pub use executor::{ExecutorAdapter, TaskExecutor};
pub use handler::{CommandHandler, HandlerFactory, HandlerRegistry, NoopHandler, ResourceHandler};
pub use recovery::{
    error_signature, normalize_message, signature_tag, ErrorCategory, ErrorClassifier,
    ErrorRecovery, RecoveryDecision, RetryDecision, RetryStrategy, Severity,
};
pub use scheduler::{Scheduler, DISPATCHER_STATS_TAG};
pub use task_list::{TaskEntry, TaskList, TaskListMetadata};
