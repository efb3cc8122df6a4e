//! Append-only segment vector store.
//!
//! Persists `(id, vector, metadata)` triples under one directory per
//! repository. Every write (`add`, `replace`, `delete`) appends a numbered
//! JSON segment file;
//! opening the store replays segments in order, so the latest write for an
//! id wins. [`VectorStore::optimize`] merges the segment set into a single
//! query-efficient segment and reclaims space left by overwritten and
//! deleted ids without changing query results.
//!
//! Single-process, single-writer: readers may run concurrently with each
//! other, but the caller must not run `optimize` concurrently with writers.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::embedding::cosine_similarity;
use crate::error::PulseError;
use crate::models::{SearchHit, SearchOptions, VectorRecord};

const SEGMENT_PREFIX: &str = "seg-";
const SEGMENT_SUFFIX: &str = ".json";

/// One on-disk segment: records to upsert followed by ids to delete.
#[derive(Debug, Serialize, Deserialize)]
struct Segment {
    #[serde(default)]
    records: Vec<VectorRecord>,
    #[serde(default)]
    deletes: Vec<String>,
}

#[derive(Debug)]
struct StoredRecord {
    /// Monotonic insertion sequence; breaks similarity ties in favor of
    /// earlier insertion.
    seq: u64,
    record: VectorRecord,
}

#[derive(Debug)]
pub struct VectorStore {
    dir: PathBuf,
    records: HashMap<String, StoredRecord>,
    next_segment: u64,
    next_seq: u64,
    closed: bool,
}

impl VectorStore {
    /// Open (or create) the store at `dir`, replaying existing segments.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| PulseError::Storage(format!("cannot create {}: {}", dir.display(), e)))?;

        let mut segment_numbers: Vec<u64> = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(num) = parse_segment_number(&name) {
                segment_numbers.push(num);
            }
        }
        segment_numbers.sort_unstable();

        let mut store = Self {
            dir: dir.to_path_buf(),
            records: HashMap::new(),
            next_segment: segment_numbers.last().map(|n| n + 1).unwrap_or(0),
            next_seq: 0,
            closed: false,
        };

        for num in segment_numbers {
            let path = store.segment_path(num);
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("cannot read segment {}", path.display()))?;
            let segment: Segment = serde_json::from_str(&content)
                .with_context(|| format!("corrupt segment {}", path.display()))?;
            store.apply(segment);
        }

        Ok(store)
    }

    fn apply(&mut self, segment: Segment) {
        for record in segment.records {
            let seq = self.next_seq;
            self.next_seq += 1;
            self.records
                .insert(record.id.clone(), StoredRecord { seq, record });
        }
        for id in &segment.deletes {
            self.records.remove(id);
        }
    }

    fn segment_path(&self, num: u64) -> PathBuf {
        self.dir
            .join(format!("{}{:08}{}", SEGMENT_PREFIX, num, SEGMENT_SUFFIX))
    }

    /// Atomically write a segment file, then apply it to the live view.
    fn append_segment(&mut self, segment: Segment) -> Result<()> {
        self.ensure_open()?;
        let num = self.next_segment;
        let path = self.segment_path(num);
        let tmp = path.with_extension("json.tmp");

        let json = serde_json::to_string(&segment)
            .map_err(|e| PulseError::Storage(format!("segment encode failed: {}", e)))?;
        std::fs::write(&tmp, json)
            .map_err(|e| PulseError::Storage(format!("segment write failed: {}", e)))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| PulseError::Storage(format!("segment rename failed: {}", e)))?;

        self.next_segment += 1;
        self.apply(segment);
        Ok(())
    }

    /// Insert or overwrite records by id.
    pub fn add(&mut self, records: Vec<VectorRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.append_segment(Segment {
            records,
            deletes: Vec::new(),
        })
    }

    /// Upsert `records` and delete `stale_ids` in a single segment write,
    /// so one file's old and new documents are never persisted half-swapped.
    /// Ids that reappear in `records` are dropped from the delete set.
    pub fn replace(&mut self, records: Vec<VectorRecord>, stale_ids: Vec<String>) -> Result<()> {
        if records.is_empty() && stale_ids.is_empty() {
            return Ok(());
        }
        let deletes: Vec<String> = stale_ids
            .into_iter()
            .filter(|id| !records.iter().any(|r| &r.id == id))
            .collect();
        self.append_segment(Segment { records, deletes })
    }

    /// Remove records by id. Unknown ids are ignored.
    pub fn delete(&mut self, ids: Vec<String>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.append_segment(Segment {
            records: Vec::new(),
            deletes: ids,
        })
    }

    /// Nearest-neighbor query: up to `limit` records with similarity ≥
    /// `score_threshold`, descending by similarity, ties broken by
    /// insertion order. An empty result is not an error.
    pub fn search(&self, vector: &[f32], opts: SearchOptions) -> Vec<SearchHit> {
        let mut scored: Vec<(f32, u64, &VectorRecord)> = self
            .records
            .values()
            .map(|s| (cosine_similarity(vector, &s.record.vector), s.seq, &s.record))
            .filter(|(score, _, _)| *score >= opts.score_threshold)
            .collect();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.cmp(&b.1))
        });
        scored.truncate(opts.limit);

        scored
            .into_iter()
            .map(|(score, _, record)| SearchHit {
                id: record.id.clone(),
                score,
                metadata: record.metadata.clone(),
            })
            .collect()
    }

    /// Look up the stored vector for `id` and run the same search. Excludes
    /// nothing by default; callers filter out self-matches.
    pub fn search_by_document_id(&self, id: &str, opts: SearchOptions) -> Result<Vec<SearchHit>> {
        let stored = self
            .records
            .get(id)
            .ok_or_else(|| anyhow::anyhow!("document not found: {}", id))?;
        let vector = stored.record.vector.clone();
        Ok(self.search(&vector, opts))
    }

    /// Direct lookup by id.
    pub fn get(&self, id: &str) -> Option<&VectorRecord> {
        self.records.get(id).map(|s| &s.record)
    }

    /// Bulk listing in insertion order, capped at `limit` to bound memory.
    pub fn get_all(&self, limit: Option<usize>) -> Vec<&VectorRecord> {
        let mut all: Vec<&StoredRecord> = self.records.values().collect();
        all.sort_by_key(|s| s.seq);
        let cap = limit.unwrap_or(all.len());
        all.into_iter().take(cap).map(|s| &s.record).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Merge all segments into one and drop overwritten/deleted content.
    /// Query results are unchanged; only storage layout and cost change.
    /// Must not run concurrently with writers or readers of this path.
    pub fn optimize(&mut self) -> Result<OptimizeReport> {
        self.ensure_open()?;

        let mut old_segments: Vec<PathBuf> = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if parse_segment_number(&name).is_some() {
                old_segments.push(entry.path());
            }
        }

        let mut live: Vec<&StoredRecord> = self.records.values().collect();
        live.sort_by_key(|s| s.seq);
        let records: Vec<VectorRecord> = live.iter().map(|s| s.record.clone()).collect();

        // Write the merged segment first; only then remove the old ones.
        // A crash in between leaves duplicates that replay resolves.
        let merged_num = self.next_segment;
        let path = self.segment_path(merged_num);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string(&Segment {
            records,
            deletes: Vec::new(),
        })
        .map_err(|e| PulseError::Storage(format!("segment encode failed: {}", e)))?;
        std::fs::write(&tmp, json)
            .map_err(|e| PulseError::Storage(format!("segment write failed: {}", e)))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| PulseError::Storage(format!("segment rename failed: {}", e)))?;
        self.next_segment += 1;

        let segments_before = old_segments.len();
        for old in &old_segments {
            std::fs::remove_file(old)
                .map_err(|e| PulseError::Storage(format!("segment removal failed: {}", e)))?;
        }

        Ok(OptimizeReport {
            segments_before: segments_before as u32,
            segments_after: 1,
            live_records: self.records.len() as u32,
        })
    }

    /// Release the store. Idempotent; writes are already flushed per
    /// segment, so this only marks the handle closed.
    pub fn close(&mut self) {
        self.closed = true;
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(PulseError::Closed.into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OptimizeReport {
    pub segments_before: u32,
    pub segments_after: u32,
    pub live_records: u32,
}

fn parse_segment_number(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentKind, DocumentMetadata};
    use tempfile::TempDir;

    fn meta(file: &str) -> DocumentMetadata {
        DocumentMetadata {
            file_path: file.to_string(),
            kind: DocumentKind::Function,
            name: "f".to_string(),
            start_line: 1,
            end_line: 2,
            language: "rust".to_string(),
            imports: vec![],
            snippet: String::new(),
        }
    }

    fn record(id: &str, vector: Vec<f32>) -> VectorRecord {
        VectorRecord {
            id: id.to_string(),
            vector,
            metadata: meta("a.rs"),
        }
    }

    fn opts(limit: usize, threshold: f32) -> SearchOptions {
        SearchOptions {
            limit,
            score_threshold: threshold,
        }
    }

    #[test]
    fn test_add_and_search_ordering() {
        let tmp = TempDir::new().unwrap();
        let mut store = VectorStore::open(tmp.path()).unwrap();
        store
            .add(vec![
                record("a", vec![1.0, 0.0]),
                record("b", vec![0.7, 0.7]),
                record("c", vec![0.0, 1.0]),
            ])
            .unwrap();

        let hits = store.search(&[1.0, 0.0], opts(10, -1.0));
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn test_search_respects_limit_and_threshold() {
        let tmp = TempDir::new().unwrap();
        let mut store = VectorStore::open(tmp.path()).unwrap();
        store
            .add(vec![
                record("a", vec![1.0, 0.0]),
                record("b", vec![0.9, 0.1]),
                record("c", vec![0.0, 1.0]),
            ])
            .unwrap();

        let hits = store.search(&[1.0, 0.0], opts(1, 0.5));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");

        let hits = store.search(&[1.0, 0.0], opts(10, 0.5));
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.score >= 0.5));
    }

    #[test]
    fn test_search_ties_broken_by_insertion_order() {
        let tmp = TempDir::new().unwrap();
        let mut store = VectorStore::open(tmp.path()).unwrap();
        store.add(vec![record("early", vec![1.0, 0.0])]).unwrap();
        store.add(vec![record("late", vec![1.0, 0.0])]).unwrap();

        let hits = store.search(&[1.0, 0.0], opts(10, 0.0));
        // Identical similarity: earlier insertion wins
        assert_eq!(hits[0].id, "early");
        assert_eq!(hits[1].id, "late");
    }

    #[test]
    fn test_duplicate_id_replaces() {
        let tmp = TempDir::new().unwrap();
        let mut store = VectorStore::open(tmp.path()).unwrap();
        store.add(vec![record("a", vec![1.0, 0.0])]).unwrap();
        store.add(vec![record("a", vec![0.0, 1.0])]).unwrap();

        assert_eq!(store.len(), 1);
        let hits = store.search(&[0.0, 1.0], opts(1, 0.9));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");
    }

    #[test]
    fn test_delete_removes_records() {
        let tmp = TempDir::new().unwrap();
        let mut store = VectorStore::open(tmp.path()).unwrap();
        store
            .add(vec![record("a", vec![1.0, 0.0]), record("b", vec![0.0, 1.0])])
            .unwrap();
        store.delete(vec!["a".to_string()]).unwrap();

        assert_eq!(store.len(), 1);
        assert!(store.get("a").is_none());
        assert!(store.get("b").is_some());
    }

    fn segment_count(dir: &std::path::Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| parse_segment_number(&e.file_name().to_string_lossy()).is_some())
            .count()
    }

    #[test]
    fn test_replace_swaps_in_one_segment() {
        let tmp = TempDir::new().unwrap();
        let mut store = VectorStore::open(tmp.path()).unwrap();
        store
            .add(vec![
                record("f#0", vec![1.0, 0.0]),
                record("f#1", vec![0.0, 1.0]),
            ])
            .unwrap();

        let before = segment_count(tmp.path());
        store
            .replace(
                vec![record("f#0", vec![0.5, 0.5]), record("f#2", vec![0.0, 1.0])],
                vec!["f#0".to_string(), "f#1".to_string()],
            )
            .unwrap();
        // The swap is a single durable write, not a delete plus an add
        assert_eq!(segment_count(tmp.path()), before + 1);

        assert_eq!(store.len(), 2);
        assert!(store.get("f#1").is_none());
        assert!(store.get("f#2").is_some());
        // Overlapping id survives with the new vector
        let hits = store.search(&[0.5, 0.5], opts(1, 0.99));
        assert_eq!(hits[0].id, "f#0");
    }

    #[test]
    fn test_replace_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let mut store = VectorStore::open(tmp.path()).unwrap();
            store.add(vec![record("old#0", vec![1.0, 0.0])]).unwrap();
            store
                .replace(
                    vec![record("new#0", vec![0.0, 1.0])],
                    vec!["old#0".to_string()],
                )
                .unwrap();
        }

        let store = VectorStore::open(tmp.path()).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.get("old#0").is_none());
        assert!(store.get("new#0").is_some());
    }

    #[test]
    fn test_persistence_across_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let mut store = VectorStore::open(tmp.path()).unwrap();
            store
                .add(vec![record("a", vec![1.0, 0.0]), record("b", vec![0.0, 1.0])])
                .unwrap();
            store.delete(vec!["b".to_string()]).unwrap();
        }

        let store = VectorStore::open(tmp.path()).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.get("a").is_some());
        assert!(store.get("b").is_none());
    }

    #[test]
    fn test_optimize_preserves_query_results() {
        let tmp = TempDir::new().unwrap();
        let mut store = VectorStore::open(tmp.path()).unwrap();
        store.add(vec![record("a", vec![1.0, 0.0])]).unwrap();
        store.add(vec![record("b", vec![0.8, 0.2])]).unwrap();
        store.add(vec![record("a", vec![0.9, 0.1])]).unwrap();
        store.delete(vec!["b".to_string()]).unwrap();
        store.add(vec![record("c", vec![0.0, 1.0])]).unwrap();

        let before: Vec<(String, f32)> = store
            .search(&[1.0, 0.0], opts(10, -1.0))
            .into_iter()
            .map(|h| (h.id, h.score))
            .collect();

        let report = store.optimize().unwrap();
        assert_eq!(report.segments_after, 1);
        assert!(report.segments_before > 1);

        let after: Vec<(String, f32)> = store
            .search(&[1.0, 0.0], opts(10, -1.0))
            .into_iter()
            .map(|h| (h.id, h.score))
            .collect();
        assert_eq!(before, after);

        // And after reopening from the merged segment
        drop(store);
        let store = VectorStore::open(tmp.path()).unwrap();
        let reopened: Vec<(String, f32)> = store
            .search(&[1.0, 0.0], opts(10, -1.0))
            .into_iter()
            .map(|h| (h.id, h.score))
            .collect();
        assert_eq!(before, reopened);
    }

    #[test]
    fn test_get_all_caps_results() {
        let tmp = TempDir::new().unwrap();
        let mut store = VectorStore::open(tmp.path()).unwrap();
        store
            .add(vec![
                record("a", vec![1.0, 0.0]),
                record("b", vec![0.0, 1.0]),
                record("c", vec![0.5, 0.5]),
            ])
            .unwrap();

        assert_eq!(store.get_all(None).len(), 3);
        let capped = store.get_all(Some(2));
        assert_eq!(capped.len(), 2);
        // Insertion order
        assert_eq!(capped[0].id, "a");
        assert_eq!(capped[1].id, "b");
    }

    #[test]
    fn test_search_by_document_id() {
        let tmp = TempDir::new().unwrap();
        let mut store = VectorStore::open(tmp.path()).unwrap();
        store
            .add(vec![
                record("a", vec![1.0, 0.0]),
                record("b", vec![0.9, 0.1]),
            ])
            .unwrap();

        let hits = store.search_by_document_id("a", opts(10, 0.0)).unwrap();
        // Self-match included by default; callers filter
        assert_eq!(hits[0].id, "a");
        assert!(hits.iter().any(|h| h.id == "b"));

        assert!(store.search_by_document_id("missing", opts(10, 0.0)).is_err());
    }

    #[test]
    fn test_close_idempotent_and_blocks_writes() {
        let tmp = TempDir::new().unwrap();
        let mut store = VectorStore::open(tmp.path()).unwrap();
        store.close();
        store.close();
        assert!(store.add(vec![record("a", vec![1.0])]).is_err());
    }

    #[test]
    fn test_empty_store_search_is_empty() {
        let tmp = TempDir::new().unwrap();
        let store = VectorStore::open(tmp.path()).unwrap();
        assert!(store.search(&[1.0, 0.0], opts(10, 0.0)).is_empty());
    }
}
