//! Orchestrates the indexing pipeline: scan, diff against persisted state,
//! embed added/changed files, apply vector-store mutations, and persist the
//! new state atomically. Also the query surface the CLI talks to.
//!
//! The durable state file is only replaced after every store mutation has
//! succeeded, so a crash or storage failure mid-run leaves the previous
//! state intact and the next run simply redoes the remaining work.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tokio::task::JoinSet;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::config::{Config, StoragePaths};
use crate::embedding::{embed_query, embed_texts};
use crate::error::PulseError;
use crate::history::{summarize, ChangeFrequencyAnalyzer};
use crate::metrics::{summarize_documents, MetricsCollector};
use crate::metrics_store::{MetricsStore, TrendPoint};
use crate::models::{
    BasicStats, CodeMetadata, FileEntry, Hotspot, IndexReport, IndexStats, IndexerState,
    RunTrigger, SearchHit, SearchOptions, Snapshot, VectorRecord,
};
use crate::scanner::{ScannedFile, Scanner};
use crate::vector_store::{OptimizeReport, VectorStore};

/// Options controlling how an indexer is opened.
#[derive(Debug, Clone, Copy, Default)]
pub struct InitOptions {
    /// Open without an embedding provider. Query-by-text and indexing are
    /// rejected; state inspection, similar-by-id, and analytics still work.
    pub skip_embedder: bool,
    /// Fail with `NotIndexed` instead of starting fresh when no state file
    /// exists for the repository.
    pub require_existing: bool,
}

#[derive(Debug)]
pub struct RepositoryIndexer {
    repo: PathBuf,
    repo_key: String,
    config: Config,
    paths: StoragePaths,
    state: Option<IndexerState>,
    vectors: VectorStore,
    metrics: MetricsStore,
    skip_embedder: bool,
    closed: bool,
}

impl RepositoryIndexer {
    pub async fn open(repo: &Path, config: Config, options: InitOptions) -> Result<Self> {
        let paths = config.storage_paths(repo)?;
        let repo_canonical = repo
            .canonicalize()
            .with_context(|| format!("cannot resolve repository path: {}", repo.display()))?;
        let repo_key = repo_canonical.to_string_lossy().to_string();

        let state = if paths.state_file.exists() {
            let content = std::fs::read_to_string(&paths.state_file)
                .map_err(|e| PulseError::Storage(format!("cannot read state file: {}", e)))?;
            let state: IndexerState = serde_json::from_str(&content)
                .map_err(|e| PulseError::Storage(format!("corrupt state file: {}", e)))?;
            Some(state)
        } else if options.require_existing {
            return Err(PulseError::NotIndexed {
                repo: repo.to_path_buf(),
            }
            .into());
        } else {
            None
        };

        // Fail fast on a broken embedder configuration; skipped on the
        // read-only path so analytical commands start without one.
        if !options.skip_embedder {
            crate::embedding::create_provider(&config.embedding)?;
        }

        std::fs::create_dir_all(&paths.root)
            .map_err(|e| PulseError::Storage(format!("cannot create storage dir: {}", e)))?;
        let vectors = VectorStore::open(&paths.vectors_dir)?;
        let metrics = MetricsStore::open(&paths.metrics_db).await?;

        Ok(Self {
            repo: repo_canonical,
            repo_key,
            config,
            paths,
            state,
            vectors,
            metrics,
            skip_embedder: options.skip_embedder,
            closed: false,
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(PulseError::Closed.into());
        }
        Ok(())
    }

    fn ensure_embedder(&self) -> Result<()> {
        if self.skip_embedder {
            return Err(PulseError::EmbedderUnavailable.into());
        }
        Ok(())
    }

    /// Full indexing run. Internally identical to `update`: unchanged files
    /// are detected by fingerprint and skipped either way.
    pub async fn index(&mut self) -> Result<IndexReport> {
        self.run(RunTrigger::Index).await
    }

    /// Incremental run: re-embed only files whose content changed since the
    /// last successful run.
    pub async fn update(&mut self) -> Result<IndexReport> {
        self.run(RunTrigger::Update).await
    }

    /// Scan and diff without writing anything: reports what a run would do.
    /// Works without an embedding provider.
    pub async fn preview(&self) -> Result<IndexReport> {
        self.ensure_open()?;
        let started = std::time::Instant::now();

        let scanner = Scanner::new(&self.repo, &self.config.scanner)?;
        let outcome = scanner.scan()?;
        let old_state = self
            .state
            .clone()
            .unwrap_or_else(|| IndexerState::new(self.repo_key.clone()));
        let diff = partition_scan(&outcome.files, &old_state);

        let mut report = IndexReport {
            files_scanned: outcome.stats.files_scanned,
            files_unchanged: diff.unchanged.len() as u32,
            files_removed: diff.removed.len() as u32,
            scan_errors: outcome.stats.errors.clone(),
            ..Default::default()
        };
        for (_, changed) in &diff.to_embed {
            if *changed {
                report.files_changed += 1;
            } else {
                report.files_added += 1;
            }
        }
        report.duration_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }

    async fn run(&mut self, trigger: RunTrigger) -> Result<IndexReport> {
        self.ensure_open()?;
        self.ensure_embedder()?;
        let started = std::time::Instant::now();

        let scanner = Scanner::new(&self.repo, &self.config.scanner)?;
        let outcome = scanner.scan()?;

        let old_state = self
            .state
            .clone()
            .unwrap_or_else(|| IndexerState::new(self.repo_key.clone()));

        let diff = partition_scan(&outcome.files, &old_state);
        let unchanged = diff.unchanged;
        let to_embed = diff.to_embed;
        let removed = diff.removed;

        let mut report = IndexReport {
            files_scanned: outcome.stats.files_scanned,
            files_unchanged: unchanged.len() as u32,
            files_removed: removed.len() as u32,
            scan_errors: outcome.stats.errors.clone(),
            ..Default::default()
        };

        let embedded = self.embed_files(&to_embed, &mut report).await;

        // All mutations before the state write; a failure here leaves the
        // previous state file authoritative.
        let mut new_state = match self
            .apply_mutations(&old_state, &unchanged, &removed, &embedded, &mut report)
        {
            Ok(state) => state,
            Err(e) => {
                return Err(e.context(format!(
                    "aborted after storing {} of {} embedded files ({} documents); \
                     the previous index state is still authoritative",
                    report.files_added + report.files_changed,
                    embedded.len(),
                    report.vectors_stored,
                )))
            }
        };

        new_state.indexed_at = Utc::now().timestamp();
        self.write_state(&new_state).map_err(|e| {
            e.context(format!(
                "vector writes for {} files committed but the state file could not \
                 be replaced; the next run re-embeds them",
                report.files_added + report.files_changed,
            ))
        })?;
        self.state = Some(new_state);

        report.duration_ms = started.elapsed().as_millis() as u64;
        if let Err(e) = self.record_metrics(trigger, &outcome.files, &report).await {
            return Err(e.context(
                "index state and vectors committed successfully; only the metrics snapshot failed",
            ));
        }

        Ok(report)
    }

    /// Apply the diff to the vector store and build the replacement state.
    /// Counters in `report` are incremented only after the corresponding
    /// write succeeds, so a failed run still reports what got stored.
    fn apply_mutations(
        &mut self,
        old_state: &IndexerState,
        unchanged: &[&ScannedFile],
        removed: &[String],
        embedded: &[(&ScannedFile, bool, Option<Vec<VectorRecord>>)],
        report: &mut IndexReport,
    ) -> Result<IndexerState> {
        let mut new_state = IndexerState::new(self.repo_key.clone());
        for file in unchanged {
            if let Some(entry) = old_state.files.get(&file.path) {
                new_state.files.insert(file.path.clone(), entry.clone());
            }
        }
        for path in removed {
            if let Some(entry) = old_state.files.get(path) {
                self.vectors
                    .delete(entry.document_ids.clone())
                    .with_context(|| format!("removing vectors for {}", path))?;
            }
        }
        for (file, changed, records) in embedded {
            match records {
                Some(records) => {
                    // One segment write per file: its old and new documents
                    // are never persisted half-swapped.
                    let stale = if *changed {
                        old_state
                            .files
                            .get(&file.path)
                            .map(|entry| entry.document_ids.clone())
                            .unwrap_or_default()
                    } else {
                        Vec::new()
                    };
                    self.vectors
                        .replace(records.clone(), stale)
                        .with_context(|| format!("storing vectors for {}", file.path))?;
                    if *changed {
                        report.files_changed += 1;
                    } else {
                        report.files_added += 1;
                    }
                    report.documents_indexed += records.len() as u32;
                    report.vectors_stored += records.len() as u32;
                    new_state.files.insert(
                        file.path.clone(),
                        FileEntry {
                            fingerprint: file.fingerprint.clone(),
                            document_ids: records.iter().map(|r| r.id.clone()).collect(),
                        },
                    );
                }
                // Embedding failed: the file keeps its previous entry (and
                // vectors) so the next run retries it.
                None => {
                    report.documents_failed += file.documents.len() as u32;
                    if let Some(entry) = old_state.files.get(&file.path) {
                        new_state.files.insert(file.path.clone(), entry.clone());
                    }
                }
            }
        }
        Ok(new_state)
    }

    /// Embed added/changed files with a bounded number of in-flight tasks.
    /// A per-file failure is recorded in the report, never propagated.
    async fn embed_files<'a>(
        &self,
        to_embed: &[(&'a ScannedFile, bool)],
        report: &mut IndexReport,
    ) -> Vec<(&'a ScannedFile, bool, Option<Vec<VectorRecord>>)> {
        let limit = self.config.embedding.effective_concurrency();
        let batch_size = self.config.embedding.batch_size.max(1);
        let mut results: HashMap<usize, Result<Vec<Vec<f32>>>> = HashMap::new();
        let mut set = JoinSet::new();

        for (idx, (file, _)) in to_embed.iter().enumerate() {
            let config = self.config.embedding.clone();
            let texts: Vec<String> = file.documents.iter().map(|d| d.content.clone()).collect();
            set.spawn(async move {
                let result = async {
                    let mut vectors = Vec::with_capacity(texts.len());
                    for chunk in texts.chunks(batch_size) {
                        vectors.extend(embed_texts(&config, chunk).await?);
                    }
                    Ok::<_, anyhow::Error>(vectors)
                }
                .await;
                (idx, result)
            });

            if set.len() >= limit {
                if let Some(Ok((idx, result))) = set.join_next().await {
                    results.insert(idx, result);
                }
            }
        }
        while let Some(joined) = set.join_next().await {
            if let Ok((idx, result)) = joined {
                results.insert(idx, result);
            }
        }

        to_embed
            .iter()
            .enumerate()
            .map(|(idx, (file, changed))| match results.remove(&idx) {
                Some(Ok(vectors)) => {
                    let records = file
                        .documents
                        .iter()
                        .zip(vectors)
                        .map(|(doc, vector)| VectorRecord {
                            id: doc.id.clone(),
                            vector,
                            metadata: doc.metadata.clone(),
                        })
                        .collect();
                    (*file, *changed, Some(records))
                }
                Some(Err(e)) => {
                    report
                        .embedding_errors
                        .push(format!("{}: {}", file.path, e));
                    (*file, *changed, None)
                }
                None => {
                    report
                        .embedding_errors
                        .push(format!("{}: embedding task lost", file.path));
                    (*file, *changed, None)
                }
            })
            .collect()
    }

    fn write_state(&self, state: &IndexerState) -> Result<()> {
        let json = serde_json::to_string_pretty(state)?;
        let tmp = self.paths.state_file.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .map_err(|e| PulseError::Storage(format!("cannot write state file: {}", e)))?;
        std::fs::rename(&tmp, &self.paths.state_file)
            .map_err(|e| PulseError::Storage(format!("cannot replace state file: {}", e)))?;
        Ok(())
    }

    /// Record a snapshot with per-file metrics. Change-frequency data is
    /// best-effort: a repository without usable git history still gets
    /// structural metrics.
    async fn record_metrics(
        &self,
        trigger: RunTrigger,
        files: &[ScannedFile],
        report: &IndexReport,
    ) -> Result<()> {
        let summaries = summarize_documents(files);

        let analyzer = ChangeFrequencyAnalyzer::new(&self.repo, &self.config.history);
        let frequency = match analyzer.collect().await {
            Ok(contributions) => Some(summarize(&contributions)),
            Err(_) => None,
        };

        let collector = MetricsCollector::new(&self.repo, self.config.metrics.read_batch_size);
        let metadata = collector.collect(&summaries, frequency.as_ref()).await;

        let snapshot = Snapshot {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now().timestamp(),
            repository_path: self.repo_key.clone(),
            trigger: trigger.as_str().to_string(),
            files_scanned: report.files_scanned,
            documents_indexed: report.documents_indexed,
            vectors_stored: self.vectors.len() as u32,
            duration_ms: report.duration_ms,
        };
        self.metrics.record_snapshot(&snapshot, &metadata).await
    }

    /// Semantic search by free text. Requires an embedding provider.
    pub async fn search(&self, query: &str, opts: SearchOptions) -> Result<Vec<SearchHit>> {
        self.ensure_open()?;
        self.ensure_embedder()?;
        if self.state.is_none() {
            bail!(PulseError::NotIndexed {
                repo: self.repo.clone()
            });
        }
        let vector = embed_query(&self.config.embedding, query).await?;
        Ok(self.vectors.search(&vector, opts))
    }

    /// Nearest neighbors of an already-indexed document. Works without an
    /// embedding provider.
    pub fn similar(&self, document_id: &str, opts: SearchOptions) -> Result<Vec<SearchHit>> {
        self.ensure_open()?;
        self.vectors.search_by_document_id(document_id, opts)
    }

    pub fn list_documents(&self, limit: Option<usize>) -> Result<Vec<VectorRecord>> {
        self.ensure_open()?;
        Ok(self
            .vectors
            .get_all(limit)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Merge vector segments. Search results are identical before and after.
    pub fn optimize(&mut self) -> Result<OptimizeReport> {
        self.ensure_open()?;
        self.vectors.optimize()
    }

    /// Counts the indexer already knows. Never touches git.
    pub fn get_basic_stats(&self) -> Result<BasicStats> {
        self.ensure_open()?;
        let state = self.state.as_ref().ok_or_else(|| PulseError::NotIndexed {
            repo: self.repo.clone(),
        })?;
        Ok(BasicStats {
            repository_path: state.repository_path.clone(),
            files_indexed: state.files.len() as u32,
            documents_indexed: state.document_count() as u32,
            vectors_stored: self.vectors.len() as u32,
            storage_bytes: self.storage_bytes(),
            indexed_at: state.indexed_at,
        })
    }

    /// On-disk footprint of this repository's storage directory.
    fn storage_bytes(&self) -> u64 {
        WalkDir::new(&self.paths.root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter_map(|e| e.metadata().ok())
            .filter(|m| m.is_file())
            .map(|m| m.len())
            .sum()
    }

    /// Basic stats enriched with repository-wide git activity. History
    /// fields come back `None` when git is unavailable.
    pub async fn get_stats(&self) -> Result<IndexStats> {
        let basic = self.get_basic_stats()?;

        let analyzer = ChangeFrequencyAnalyzer::new(&self.repo, &self.config.history);
        match analyzer.collect().await {
            Ok(contributions) => {
                let authors: BTreeSet<&str> =
                    contributions.iter().map(|c| c.author.as_str()).collect();
                let frequency = summarize(&contributions);
                let total_commits: u32 = frequency.values().map(|f| f.commit_count).sum();
                let last_commit = frequency.values().map(|f| f.last_modified).max();
                Ok(IndexStats {
                    basic,
                    total_commits: Some(total_commits),
                    distinct_authors: Some(authors.len() as u32),
                    last_commit,
                })
            }
            Err(_) => Ok(IndexStats {
                basic,
                total_commits: None,
                distinct_authors: None,
                last_commit: None,
            }),
        }
    }

    pub async fn hotspots(&self, limit: i64) -> Result<Vec<Hotspot>> {
        self.ensure_open()?;
        self.metrics.hotspots(None, &self.repo_key, limit).await
    }

    pub async fn most_active(&self, limit: i64) -> Result<Vec<CodeMetadata>> {
        self.ensure_open()?;
        self.metrics.most_active(None, &self.repo_key, limit).await
    }

    pub async fn largest_files(&self, limit: i64) -> Result<Vec<CodeMetadata>> {
        self.ensure_open()?;
        self.metrics
            .largest_files(None, &self.repo_key, limit)
            .await
    }

    pub async fn concentrated_ownership(&self, limit: i64) -> Result<Vec<CodeMetadata>> {
        self.ensure_open()?;
        self.metrics
            .concentrated_ownership(None, &self.repo_key, limit)
            .await
    }

    pub async fn file_trend(&self, file_path: &str, limit: i64) -> Result<Vec<TrendPoint>> {
        self.ensure_open()?;
        self.metrics
            .file_trend(&self.repo_key, file_path, limit)
            .await
    }

    pub async fn snapshot_summary(&self, snapshot_id: Option<&str>) -> Result<Snapshot> {
        self.ensure_open()?;
        self.metrics
            .snapshot_summary(snapshot_id, &self.repo_key)
            .await
    }

    pub async fn list_snapshots(&self, limit: i64) -> Result<Vec<Snapshot>> {
        self.ensure_open()?;
        self.metrics.list_snapshots(&self.repo_key, limit).await
    }

    pub async fn prune_snapshots(&self) -> Result<u64> {
        self.ensure_open()?;
        self.metrics
            .prune(self.config.metrics.retention_days)
            .await
    }

    pub fn storage_root(&self) -> &Path {
        &self.paths.root
    }

    /// Flush and mark closed. Further mutations and queries fail with
    /// `Closed`. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.vectors.close();
        self.metrics.close().await;
        self.closed = true;
    }
}

struct ScanDiff<'a> {
    unchanged: Vec<&'a ScannedFile>,
    /// `(file, changed)` — `changed` is false for files new to the index.
    to_embed: Vec<(&'a ScannedFile, bool)>,
    removed: Vec<String>,
}

/// Partition a scan against the previous run's fingerprints.
fn partition_scan<'a>(files: &'a [ScannedFile], old_state: &IndexerState) -> ScanDiff<'a> {
    let mut unchanged = Vec::new();
    let mut to_embed = Vec::new();
    let scanned_paths: BTreeSet<&str> = files.iter().map(|f| f.path.as_str()).collect();

    for file in files {
        match old_state.files.get(&file.path) {
            Some(entry) if entry.fingerprint == file.fingerprint => unchanged.push(file),
            Some(_) => to_embed.push((file, true)),
            None => to_embed.push((file, false)),
        }
    }
    let removed: Vec<String> = old_state
        .files
        .keys()
        .filter(|path| !scanned_paths.contains(path.as_str()))
        .cloned()
        .collect();

    ScanDiff {
        unchanged,
        to_embed,
        removed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_repo(files: &[(&str, &str)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (name, content) in files {
            let path = dir.path().join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(path, content).unwrap();
        }
        dir
    }

    fn test_config(storage: &TempDir) -> Config {
        let mut config = Config::default();
        config.storage.root = storage.path().join("store");
        config.embedding.dims = 64;
        config
    }

    const FILE_A: &str = "fn alpha() {\n    let lantern = 1;\n    lantern\n}\n";
    const FILE_B: &str = "fn beta() {\n    let meridian = 2;\n    meridian\n}\n";

    #[tokio::test]
    async fn test_index_is_idempotent() {
        let repo = write_repo(&[("a.rs", FILE_A), ("b.rs", FILE_B)]);
        let storage = TempDir::new().unwrap();

        let mut indexer =
            RepositoryIndexer::open(repo.path(), test_config(&storage), InitOptions::default())
                .await
                .unwrap();

        let first = indexer.index().await.unwrap();
        assert_eq!(first.files_scanned, 2);
        assert_eq!(first.files_added, 2);
        assert!(first.vectors_stored >= 2);

        let second = indexer.update().await.unwrap();
        assert_eq!(second.files_unchanged, 2);
        assert_eq!(second.files_added, 0);
        assert_eq!(second.files_changed, 0);
        assert_eq!(second.vectors_stored, 0);
        indexer.close().await;
    }

    #[tokio::test]
    async fn test_preview_reports_diff_without_writing() {
        let repo = write_repo(&[("a.rs", FILE_A), ("b.rs", FILE_B)]);
        let storage = TempDir::new().unwrap();

        let mut indexer =
            RepositoryIndexer::open(repo.path(), test_config(&storage), InitOptions::default())
                .await
                .unwrap();

        let report = indexer.preview().await.unwrap();
        assert_eq!(report.files_added, 2);
        assert_eq!(report.vectors_stored, 0);
        assert!(indexer.list_documents(None).unwrap().is_empty());
        assert!(indexer.get_basic_stats().is_err());

        indexer.index().await.unwrap();
        fs::remove_file(repo.path().join("b.rs")).unwrap();

        let report = indexer.preview().await.unwrap();
        assert_eq!(report.files_removed, 1);
        assert_eq!(report.files_unchanged, 1);
        // Preview did not apply the deletion
        assert_eq!(indexer.get_basic_stats().unwrap().files_indexed, 2);
        indexer.close().await;
    }

    #[tokio::test]
    async fn test_update_reembeds_only_changed_file() {
        let repo = write_repo(&[("a.rs", FILE_A), ("b.rs", FILE_B)]);
        let storage = TempDir::new().unwrap();

        let mut indexer =
            RepositoryIndexer::open(repo.path(), test_config(&storage), InitOptions::default())
                .await
                .unwrap();
        indexer.index().await.unwrap();

        fs::write(
            repo.path().join("b.rs"),
            "fn beta() {\n    let changed = 3;\n    changed\n}\n",
        )
        .unwrap();

        let report = indexer.update().await.unwrap();
        assert_eq!(report.files_changed, 1);
        assert_eq!(report.files_unchanged, 1);
        assert_eq!(report.files_added, 0);
        indexer.close().await;
    }

    #[tokio::test]
    async fn test_update_removes_deleted_file() {
        let repo = write_repo(&[("a.rs", FILE_A), ("b.rs", FILE_B)]);
        let storage = TempDir::new().unwrap();

        let mut indexer =
            RepositoryIndexer::open(repo.path(), test_config(&storage), InitOptions::default())
                .await
                .unwrap();
        indexer.index().await.unwrap();

        fs::remove_file(repo.path().join("b.rs")).unwrap();
        let report = indexer.update().await.unwrap();
        assert_eq!(report.files_removed, 1);
        assert_eq!(report.files_unchanged, 1);

        let remaining = indexer.list_documents(None).unwrap();
        assert!(remaining.iter().all(|r| !r.id.starts_with("b.rs#")));
        indexer.close().await;
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let repo = write_repo(&[("a.rs", FILE_A)]);
        let storage = TempDir::new().unwrap();
        let config = test_config(&storage);

        let mut indexer =
            RepositoryIndexer::open(repo.path(), config.clone(), InitOptions::default())
                .await
                .unwrap();
        indexer.index().await.unwrap();
        indexer.close().await;

        let mut reopened = RepositoryIndexer::open(
            repo.path(),
            config,
            InitOptions {
                require_existing: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let stats = reopened.get_basic_stats().unwrap();
        assert_eq!(stats.files_indexed, 1);
        assert!(stats.storage_bytes > 0);

        let report = reopened.update().await.unwrap();
        assert_eq!(report.files_unchanged, 1);
        reopened.close().await;
    }

    #[tokio::test]
    async fn test_require_existing_rejects_fresh_repo() {
        let repo = write_repo(&[("a.rs", FILE_A)]);
        let storage = TempDir::new().unwrap();

        let err = RepositoryIndexer::open(
            repo.path(),
            test_config(&storage),
            InitOptions {
                require_existing: true,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PulseError>(),
            Some(PulseError::NotIndexed { .. })
        ));
    }

    #[tokio::test]
    async fn test_search_finds_matching_file() {
        let repo = write_repo(&[("a.rs", FILE_A), ("b.rs", FILE_B)]);
        let storage = TempDir::new().unwrap();

        let mut indexer =
            RepositoryIndexer::open(repo.path(), test_config(&storage), InitOptions::default())
                .await
                .unwrap();
        indexer.index().await.unwrap();

        // The hash provider maps identical text to identical vectors, so
        // querying with a file's own content scores it at 1.0.
        let hits = indexer
            .search(
                FILE_A,
                SearchOptions {
                    limit: 5,
                    score_threshold: 0.9,
                },
            )
            .await
            .unwrap();
        assert!(!hits.is_empty());
        assert!(hits[0].metadata.file_path.ends_with("a.rs"));
        indexer.close().await;
    }

    #[tokio::test]
    async fn test_skip_embedder_blocks_text_search() {
        let repo = write_repo(&[("a.rs", FILE_A)]);
        let storage = TempDir::new().unwrap();
        let config = test_config(&storage);

        let mut indexer =
            RepositoryIndexer::open(repo.path(), config.clone(), InitOptions::default())
                .await
                .unwrap();
        indexer.index().await.unwrap();
        indexer.close().await;

        let mut readonly = RepositoryIndexer::open(
            repo.path(),
            config,
            InitOptions {
                skip_embedder: true,
                require_existing: true,
            },
        )
        .await
        .unwrap();

        let err = readonly
            .search("anything", SearchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PulseError>(),
            Some(PulseError::EmbedderUnavailable)
        ));

        // Inspection paths still work without an embedder
        assert!(readonly.get_basic_stats().is_ok());
        assert!(!readonly.list_documents(None).unwrap().is_empty());
        readonly.close().await;
    }

    #[tokio::test]
    async fn test_close_blocks_further_use() {
        let repo = write_repo(&[("a.rs", FILE_A)]);
        let storage = TempDir::new().unwrap();

        let mut indexer =
            RepositoryIndexer::open(repo.path(), test_config(&storage), InitOptions::default())
                .await
                .unwrap();
        indexer.index().await.unwrap();
        indexer.close().await;
        indexer.close().await; // idempotent

        let err = indexer.update().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PulseError>(),
            Some(PulseError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_storage_failure_reports_progress_and_keeps_no_state() {
        let repo = write_repo(&[("a.rs", FILE_A), ("b.rs", FILE_B)]);
        let storage = TempDir::new().unwrap();
        let config = test_config(&storage);
        let paths = config.storage_paths(repo.path()).unwrap();

        let mut indexer = RepositoryIndexer::open(repo.path(), config, InitOptions::default())
            .await
            .unwrap();

        // A plain file where the segment directory should be makes every
        // vector write fail
        fs::remove_dir_all(&paths.vectors_dir).unwrap();
        fs::write(&paths.vectors_dir, "in the way").unwrap();

        let err = indexer.index().await.unwrap_err();
        let chain = format!("{:#}", err);
        assert!(chain.contains("storing 0 of 2 embedded files"), "{}", chain);
        assert!(
            chain.contains("previous index state is still authoritative"),
            "{}",
            chain
        );
        assert!(!paths.state_file.exists());
        indexer.close().await;
    }

    #[tokio::test]
    async fn test_changed_file_swap_is_one_segment_write() {
        let repo = write_repo(&[("a.rs", FILE_A), ("b.rs", FILE_B)]);
        let storage = TempDir::new().unwrap();
        let config = test_config(&storage);
        let paths = config.storage_paths(repo.path()).unwrap();

        let mut indexer = RepositoryIndexer::open(repo.path(), config, InitOptions::default())
            .await
            .unwrap();
        indexer.index().await.unwrap();

        let count_segments = || {
            fs::read_dir(&paths.vectors_dir)
                .unwrap()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().starts_with("seg-"))
                .count()
        };
        let before = count_segments();

        fs::write(
            repo.path().join("b.rs"),
            "fn beta() {\n    let replaced = 4;\n    replaced\n}\n",
        )
        .unwrap();
        let report = indexer.update().await.unwrap();
        assert_eq!(report.files_changed, 1);
        assert_eq!(count_segments(), before + 1);
        indexer.close().await;
    }

    #[tokio::test]
    async fn test_snapshot_recorded_per_run() {
        let repo = write_repo(&[("a.rs", FILE_A)]);
        let storage = TempDir::new().unwrap();

        let mut indexer =
            RepositoryIndexer::open(repo.path(), test_config(&storage), InitOptions::default())
                .await
                .unwrap();
        indexer.index().await.unwrap();
        indexer.update().await.unwrap();

        let snapshots = indexer.list_snapshots(10).await.unwrap();
        assert_eq!(snapshots.len(), 2);
        // Structural metrics exist even without git history
        let largest = indexer.largest_files(10).await.unwrap();
        assert_eq!(largest.len(), 1);
        assert_eq!(largest[0].lines_of_code, 4);
        assert!(largest[0].commit_count.is_none());
        indexer.close().await;
    }
}
