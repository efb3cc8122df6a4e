//! Metrics collection: joins scanner output with change-frequency data into
//! per-file [`CodeMetadata`].
//!
//! Lines-of-code are computed by re-reading files from disk rather than from
//! the (possibly truncated) document snippets, in bounded-concurrency
//! batches so large repositories don't exhaust file descriptors. The batch
//! size comes from `metrics.read_batch_size` (default 50).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::task::JoinSet;

use crate::models::{ChangeFrequency, CodeMetadata, DocumentKind};
use crate::scanner::ScannedFile;

/// Per-file aggregate of scanner output, before the metrics join.
#[derive(Debug, Clone)]
pub struct FileSummary {
    pub file_path: String,
    pub num_functions: u32,
    pub num_imports: u32,
}

/// Group scanned documents by file.
pub fn summarize_documents(files: &[ScannedFile]) -> Vec<FileSummary> {
    files
        .iter()
        .map(|file| {
            let num_functions = file
                .documents
                .iter()
                .filter(|d| d.metadata.kind == DocumentKind::Function)
                .count() as u32;
            let num_imports = file
                .documents
                .first()
                .map(|d| d.metadata.imports.len() as u32)
                .unwrap_or(0);
            FileSummary {
                file_path: file.path.clone(),
                num_functions,
                num_imports,
            }
        })
        .collect()
}

pub struct MetricsCollector {
    repo_root: PathBuf,
    read_batch_size: usize,
}

impl MetricsCollector {
    pub fn new(repo_root: &Path, read_batch_size: usize) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            read_batch_size: read_batch_size.max(1),
        }
    }

    /// Join file summaries with change-frequency data and disk-derived line
    /// counts. `frequency` is `None` when git history is unavailable; the
    /// corresponding fields are simply omitted.
    pub async fn collect(
        &self,
        files: &[FileSummary],
        frequency: Option<&HashMap<String, ChangeFrequency>>,
    ) -> Vec<CodeMetadata> {
        let line_counts = self.count_lines(files).await;

        files
            .iter()
            .map(|summary| {
                let freq = frequency.and_then(|map| map.get(&summary.file_path));
                CodeMetadata {
                    file_path: summary.file_path.clone(),
                    lines_of_code: line_counts
                        .get(&summary.file_path)
                        .copied()
                        .unwrap_or(0),
                    num_functions: summary.num_functions,
                    num_imports: summary.num_imports,
                    commit_count: freq.map(|f| f.commit_count),
                    author_count: freq.map(|f| f.author_count),
                    last_modified: freq.map(|f| f.last_modified),
                }
            })
            .collect()
    }

    /// Count lines per file with at most `read_batch_size` concurrent reads.
    /// A file that disappeared since the scan counts as zero lines.
    async fn count_lines(&self, files: &[FileSummary]) -> HashMap<String, u32> {
        let mut counts = HashMap::with_capacity(files.len());

        for batch in files.chunks(self.read_batch_size) {
            let mut set = JoinSet::new();
            for summary in batch {
                let rel = summary.file_path.clone();
                let abs = self.repo_root.join(&summary.file_path);
                set.spawn(async move {
                    let lines = match tokio::fs::read_to_string(&abs).await {
                        Ok(content) => content.lines().count() as u32,
                        Err(_) => 0,
                    };
                    (rel, lines)
                });
            }
            while let Some(joined) = set.join_next().await {
                if let Ok((path, lines)) = joined {
                    counts.insert(path, lines);
                }
            }
        }

        counts
    }
}
