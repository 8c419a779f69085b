//! Lazy record queries

use chrono::{DateTime, Utc};
use tracing::warn;

use weft_core::{MemoryRecord, RecordType};

use crate::store::MemoryStore;

/// Which records a query yields
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFilter {
    pub id: Option<String>,
    pub category: Option<String>,
    /// Every tag listed must be present on the record
    pub tags: Vec<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub newest_first: bool,
}

impl RecordFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn newest_first(mut self) -> Self {
        self.newest_first = true;
        self
    }

    pub fn matches(&self, record: &MemoryRecord) -> bool {
        if self.id.as_ref().is_some_and(|id| *id != record.id) {
            return false;
        }
        if self
            .category
            .as_ref()
            .is_some_and(|category| *category != record.category)
        {
            return false;
        }
        if self.since.is_some_and(|since| record.timestamp < since) {
            return false;
        }
        self.tags.iter().all(|tag| record.has_tag(tag))
    }
}

/// A finite, restartable cursor over one record type
///
/// The id list is captured when the query is created; records are loaded
/// one at a time as the cursor advances, cache first.
pub struct RecordQuery {
    store: MemoryStore,
    record_type: RecordType,
    filter: RecordFilter,
    ids: Vec<String>,
    position: usize,
    yielded: usize,
}

impl RecordQuery {
    pub(crate) fn new(
        store: MemoryStore,
        record_type: RecordType,
        filter: RecordFilter,
        mut ids: Vec<String>,
    ) -> Self {
        if filter.newest_first {
            ids.reverse();
        }
        Self {
            store,
            record_type,
            filter,
            ids,
            position: 0,
            yielded: 0,
        }
    }

    pub fn record_type(&self) -> RecordType {
        self.record_type
    }

    pub async fn next(&mut self) -> Option<MemoryRecord> {
        if self.filter.limit.is_some_and(|limit| self.yielded >= limit) {
            return None;
        }

        while self.position < self.ids.len() {
            let id = self.ids[self.position].clone();
            self.position += 1;

            match self.store.load(self.record_type, &id).await {
                Ok(record) if self.filter.matches(&record) => {
                    self.yielded += 1;
                    return Some(record);
                }
                Ok(_) => {}
                Err(e) => warn!("Skipping {} record {}: {}", self.record_type, id, e),
            }
        }
        None
    }

    /// Rewind to the first record
    pub fn restart(&mut self) {
        self.position = 0;
        self.yielded = 0;
    }

    /// Drain the remaining records
    pub async fn collect(mut self) -> Vec<MemoryRecord> {
        let mut records = Vec::new();
        while let Some(record) = self.next().await {
            records.push(record);
        }
        records
    }
}
