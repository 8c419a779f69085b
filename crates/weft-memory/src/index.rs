//! Secondary index, one file per record type
//!
//! The index is derived data. Record files are the source of truth and an
//! index that disagrees with them is thrown away and rebuilt.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use weft_core::{MemoryRecord, RecordType, Result, WeftError};

/// On-disk shape of `index/<type>.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeIndex {
    /// Record ids in insertion order
    pub ids: Vec<String>,
    /// Record count per category
    pub counts: BTreeMap<String, usize>,
    /// Ids carrying each tag, in insertion order
    ///
    /// `None` for index files written without it; such an index cannot
    /// answer tag lookups and is rebuilt on open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, Vec<String>>>,
}

impl Default for TypeIndex {
    fn default() -> Self {
        Self {
            ids: Vec::new(),
            counts: BTreeMap::new(),
            tags: Some(BTreeMap::new()),
        }
    }
}

impl TypeIndex {
    /// Build from already-loaded records, oldest first
    pub fn from_records(records: &mut [MemoryRecord]) -> Self {
        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        let mut index = Self::default();
        for record in records.iter() {
            index.insert(record);
        }
        index
    }

    pub fn insert(&mut self, record: &MemoryRecord) {
        self.ids.push(record.id.clone());
        *self.counts.entry(record.category.clone()).or_default() += 1;
        if let Some(tags) = &mut self.tags {
            for tag in &record.tags {
                let ids = tags.entry(tag.clone()).or_default();
                if ids.last() != Some(&record.id) {
                    ids.push(record.id.clone());
                }
            }
        }
    }

    /// Ids carrying every tag in `tags`, in insertion order
    ///
    /// `None` when there is nothing to narrow by or no tag map to use.
    pub fn ids_with_tags(&self, tags: &[String]) -> Option<Vec<String>> {
        let by_tag = self.tags.as_ref()?;
        let (first, rest) = tags.split_first()?;
        let Some(candidates) = by_tag.get(first) else {
            return Some(Vec::new());
        };
        let others: Vec<HashSet<&String>> = rest
            .iter()
            .map(|tag| {
                by_tag
                    .get(tag)
                    .map(|ids| ids.iter().collect::<HashSet<_>>())
                    .unwrap_or_default()
            })
            .collect();
        Some(
            candidates
                .iter()
                .filter(|id| others.iter().all(|set| set.contains(id)))
                .cloned()
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Counts must add up to the id list and tags may only name listed ids
    pub fn is_consistent(&self) -> bool {
        if self.counts.values().sum::<usize>() != self.ids.len() {
            return false;
        }
        let Some(tags) = &self.tags else {
            return true;
        };
        let known: HashSet<&String> = self.ids.iter().collect();
        tags.values().flatten().all(|id| known.contains(id))
    }
}

pub fn index_path(root: &Path, record_type: RecordType) -> PathBuf {
    root.join("index")
        .join(format!("{}.json", record_type.as_str()))
}

pub async fn read_index(path: &Path) -> Result<TypeIndex> {
    let content = tokio::fs::read_to_string(path).await?;
    let index: TypeIndex = serde_json::from_str(&content)
        .map_err(|e| WeftError::IndexCorruption(format!("{}: {}", path.display(), e)))?;
    if !index.is_consistent() {
        return Err(WeftError::IndexCorruption(format!(
            "{}: counts or tags do not match its {} ids",
            path.display(),
            index.ids.len()
        )));
    }
    Ok(index)
}

/// Replace the index file atomically (temp file + rename)
pub async fn write_index(path: &Path, index: &TypeIndex, generation: u64) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension(format!("json.{}.tmp", generation));
    tokio::fs::write(&tmp, serde_json::to_vec_pretty(index)?).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_from_records_orders_by_timestamp() {
        let mut older = MemoryRecord::episodic("scheduler", json!(1));
        let newer = MemoryRecord::episodic("recovery", json!(2));
        older.timestamp = newer.timestamp - chrono::Duration::seconds(5);

        let mut records = vec![newer.clone(), older.clone()];
        let index = TypeIndex::from_records(&mut records);

        assert_eq!(index.ids, vec![older.id, newer.id]);
        assert_eq!(index.counts["scheduler"], 1);
        assert!(index.is_consistent());
    }

    #[tokio::test]
    async fn test_index_file_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = index_path(dir.path(), RecordType::Semantic);

        let mut index = TypeIndex::default();
        index.insert(&MemoryRecord::semantic("facts", json!("x")));
        write_index(&path, &index, 1).await.unwrap();

        assert_eq!(read_index(&path).await.unwrap(), index);
    }

    #[test]
    fn test_ids_with_tags() {
        let a = MemoryRecord::procedural("recovery", json!(1)).with_tags(["sig:1", "transient"]);
        let b = MemoryRecord::procedural("recovery", json!(2)).with_tags(["sig:2", "transient"]);
        let c = MemoryRecord::procedural("recovery", json!(3)).with_tag("sig:1");
        let mut index = TypeIndex::default();
        for record in [&a, &b, &c] {
            index.insert(record);
        }

        let tags = |t: &[&str]| t.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(
            index.ids_with_tags(&tags(&["sig:1"])),
            Some(vec![a.id.clone(), c.id.clone()])
        );
        assert_eq!(
            index.ids_with_tags(&tags(&["sig:1", "transient"])),
            Some(vec![a.id.clone()])
        );
        assert_eq!(index.ids_with_tags(&tags(&["nope"])), Some(Vec::new()));
        assert_eq!(index.ids_with_tags(&[]), None);
        assert!(index.is_consistent());
    }

    #[tokio::test]
    async fn test_index_without_tag_map_reads_as_none() {
        let dir = TempDir::new().unwrap();
        let path = index_path(dir.path(), RecordType::Procedural);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, r#"{"ids": ["a"], "counts": {"x": 1}}"#)
            .await
            .unwrap();

        let index = read_index(&path).await.unwrap();
        assert!(index.tags.is_none());
        assert_eq!(index.ids_with_tags(&["t".to_string()]), None);
    }

    #[tokio::test]
    async fn test_inconsistent_counts_are_corruption() {
        let dir = TempDir::new().unwrap();
        let path = index_path(dir.path(), RecordType::Episodic);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, r#"{"ids": ["a", "b"], "counts": {"x": 1}}"#)
            .await
            .unwrap();

        assert!(matches!(
            read_index(&path).await.unwrap_err(),
            WeftError::IndexCorruption(_)
        ));
    }
}
