//! # weft-memory
//!
//! Durable, concurrency-safe memory for Weft orchestration.
//!
//! This crate provides:
//! - One append-only JSON file per record, grouped by record type
//! - A rebuildable per-type index (`{ids, counts, tags}`)
//! - A bounded LRU + TTL cache in front of the files
//! - Lazy, restartable queries

mod cache;
mod index;
mod query;
mod store;

pub use cache::RecordCache;
pub use index::TypeIndex;
pub use query::{RecordFilter, RecordQuery};
pub use store::{CacheStats, MemoryStore};
