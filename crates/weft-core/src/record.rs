//! Memory record types shared by the store and its writers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of memory record
///
/// Episodic records describe what happened, semantic records what is known,
/// procedural records how to do something (learned fixes live here).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    Episodic,
    Semantic,
    Procedural,
}

impl RecordType {
    pub const ALL: [RecordType; 3] = [Self::Episodic, Self::Semantic, Self::Procedural];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Episodic => "episodic",
            Self::Semantic => "semantic",
            Self::Procedural => "procedural",
        }
    }
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecordType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "episodic" => Ok(Self::Episodic),
            "semantic" => Ok(Self::Semantic),
            "procedural" => Ok(Self::Procedural),
            _ => Err(format!("Invalid record type: {}", s)),
        }
    }
}

/// An append-only memory entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub record_type: RecordType,
    pub timestamp: DateTime<Utc>,
    pub content: serde_json::Value,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl MemoryRecord {
    pub fn new(
        record_type: RecordType,
        category: impl Into<String>,
        content: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            record_type,
            timestamp: Utc::now(),
            content,
            category: category.into(),
            tags: Vec::new(),
        }
    }

    pub fn episodic(category: impl Into<String>, content: serde_json::Value) -> Self {
        Self::new(RecordType::Episodic, category, content)
    }

    pub fn semantic(category: impl Into<String>, content: serde_json::Value) -> Self {
        Self::new(RecordType::Semantic, category, content)
    }

    pub fn procedural(category: impl Into<String>, content: serde_json::Value) -> Self {
        Self::new(RecordType::Procedural, category, content)
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// File name of the durable copy
    pub fn filename(&self) -> String {
        format!("{}.json", self.id)
    }
}
