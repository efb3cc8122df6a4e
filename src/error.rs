//! Typed error conditions exposed by the library surface.
//!
//! Orchestration code returns `anyhow::Result`; these variants are attached
//! where callers need to recognize a specific condition (e.g. the CLI maps
//! [`PulseError::NotIndexed`] to a "run `rpulse index` first" hint).
//! Per-file scan errors and per-document embedding failures are never
//! surfaced as `Err` — they are absorbed into run statistics.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PulseError {
    /// No prior indexer state exists for the repository. The caller must run
    /// a full index first; never retried automatically.
    #[error("repository not indexed: {repo}. Run `rpulse index` first.")]
    NotIndexed { repo: PathBuf },

    /// The indexer was opened with `skip_embedder` and an embedding-dependent
    /// operation was invoked.
    #[error("embedder unavailable: indexer was opened in read-only mode (skip_embedder)")]
    EmbedderUnavailable,

    /// The indexer has been closed; no further operations are valid.
    #[error("indexer is closed")]
    Closed,

    /// The vector store or metrics store is unavailable or failed mid-write.
    /// Fatal for the current run; prior state is left untouched so the run
    /// is fully retryable.
    #[error("storage failure: {0}")]
    Storage(String),

    /// Git history could not be read. Change-frequency fields are omitted;
    /// never fatal for indexing.
    #[error("git history unavailable: {0}")]
    VcsUnavailable(String),
}
