//! Core data models used throughout RepoPulse.
//!
//! These types represent the documents, vector records, indexer state, and
//! metrics rows that flow through the indexing and analytics pipeline.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Structural kind of an indexed code chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Function,
    Class,
    Module,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Function => "function",
            DocumentKind::Class => "class",
            DocumentKind::Module => "module",
        }
    }
}

/// Structural metadata attached to every document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub file_path: String,
    pub kind: DocumentKind,
    pub name: String,
    pub start_line: u32,
    pub end_line: u32,
    pub language: String,
    pub imports: Vec<String>,
    pub snippet: String,
}

/// One indexable unit of code produced by the scanner.
///
/// Owned by the scanner at creation, immutable thereafter; a re-scan
/// supersedes documents rather than mutating them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Stable id derived from file path + structural position
    /// (`"src/lib.rs#0"`, `"src/lib.rs#1"`, ...).
    pub id: String,
    /// Text used for embedding; may be truncated for very large chunks.
    pub content: String,
    pub metadata: DocumentMetadata,
}

/// An `(id, vector, metadata)` triple persisted by the vector store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    #[serde(with = "crate::embedding::b64_vector")]
    pub vector: Vec<f32>,
    pub metadata: DocumentMetadata,
}

/// A nearest-neighbor search hit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
    pub metadata: DocumentMetadata,
}

/// Options for similarity queries.
#[derive(Debug, Clone, Copy)]
pub struct SearchOptions {
    pub limit: usize,
    pub score_threshold: f32,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            score_threshold: 0.0,
        }
    }
}

/// Cheap, stable signature of file content used to detect changes without
/// re-embedding unchanged files. The content hash is authoritative; size and
/// mtime are carried for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFingerprint {
    pub content_hash: String,
    pub size: u64,
    pub modified: i64,
}

/// Per-file entry in the persisted indexer state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub fingerprint: FileFingerprint,
    pub document_ids: Vec<String>,
}

pub const STATE_VERSION: u32 = 1;

/// Durable snapshot of the last successful indexing run.
///
/// Invariant: after a successful run this exactly reflects the vector
/// store's contents — no orphaned records, no missing files. Replaced
/// atomically at the end of a run, never partially written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerState {
    pub version: u32,
    pub repository_path: String,
    pub indexed_at: i64,
    /// Relative file path → fingerprint + produced document ids.
    /// BTreeMap keeps the serialized state deterministic.
    pub files: BTreeMap<String, FileEntry>,
}

impl IndexerState {
    pub fn new(repository_path: String) -> Self {
        Self {
            version: STATE_VERSION,
            repository_path,
            indexed_at: 0,
            files: BTreeMap::new(),
        }
    }

    pub fn document_count(&self) -> usize {
        self.files.values().map(|f| f.document_ids.len()).sum()
    }
}

/// Per (file, author) commit activity, derived from one pass over git log.
/// Ephemeral — recomputed on demand, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAuthorContribution {
    pub file_path: String,
    pub author: String,
    pub commit_count: u32,
    pub last_commit: i64,
}

/// Per-file change-frequency summary aggregated from contributions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeFrequency {
    pub commit_count: u32,
    pub author_count: u32,
    pub last_modified: i64,
}

/// Per-file derived metrics. Change-frequency fields are absent when git
/// history is unavailable.
#[derive(Debug, Clone, Serialize)]
pub struct CodeMetadata {
    pub file_path: String,
    pub lines_of_code: u32,
    pub num_functions: u32,
    pub num_imports: u32,
    pub commit_count: Option<u32>,
    pub author_count: Option<u32>,
    pub last_modified: Option<i64>,
}

/// What triggered an indexing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTrigger {
    Index,
    Update,
}

impl RunTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunTrigger::Index => "index",
            RunTrigger::Update => "update",
        }
    }
}

/// One indexing run's recorded result. Append-only; never mutated after
/// creation; subject to retention-based deletion.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub id: String,
    pub created_at: i64,
    pub repository_path: String,
    pub trigger: String,
    pub files_scanned: u32,
    pub documents_indexed: u32,
    pub vectors_stored: u32,
    pub duration_ms: u64,
}

/// A file ranked by risk: `commit_count × lines_of_code / max(author_count, 1)`.
#[derive(Debug, Clone, Serialize)]
pub struct Hotspot {
    pub file_path: String,
    pub risk_score: f64,
    pub commit_count: u32,
    pub lines_of_code: u32,
    pub author_count: u32,
    pub reason: String,
}

/// A non-fatal per-file scan failure.
#[derive(Debug, Clone)]
pub struct ScanError {
    pub path: String,
    pub reason: String,
}

/// Run statistics for one repository scan.
#[derive(Debug, Clone, Default)]
pub struct ScanStats {
    pub files_scanned: u32,
    pub files_skipped: u32,
    pub errors: Vec<ScanError>,
}

/// Statistics reported by `index()` / `update()`.
#[derive(Debug, Clone, Default)]
pub struct IndexReport {
    pub files_scanned: u32,
    pub files_added: u32,
    pub files_changed: u32,
    pub files_removed: u32,
    pub files_unchanged: u32,
    pub documents_indexed: u32,
    pub vectors_stored: u32,
    pub documents_failed: u32,
    pub scan_errors: Vec<ScanError>,
    pub embedding_errors: Vec<String>,
    pub duration_ms: u64,
}

/// Counts already known to the indexer; no git calls on this path.
#[derive(Debug, Clone)]
pub struct BasicStats {
    pub repository_path: String,
    pub files_indexed: u32,
    pub documents_indexed: u32,
    pub vectors_stored: u32,
    /// Bytes on disk across state, segments, and the metrics database.
    pub storage_bytes: u64,
    pub indexed_at: i64,
}

/// Basic counts enriched with repository-wide change-frequency data.
#[derive(Debug, Clone)]
pub struct IndexStats {
    pub basic: BasicStats,
    /// None when the repository has no readable git history.
    pub total_commits: Option<u32>,
    pub distinct_authors: Option<u32>,
    pub last_commit: Option<i64>,
}
