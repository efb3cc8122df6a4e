//! Embedded relational store for indexing snapshots and per-file metrics.
//!
//! SQLite via sqlx: an append-only `snapshots` table (one row per indexing
//! run) and a `file_metrics` table keyed by snapshot id with cascade
//! deletion. Analytical queries — most-active, largest, concentrated
//! ownership, hotspots, per-file trend — run against the latest snapshot
//! for a repository unless a specific snapshot id is given.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;

use crate::error::PulseError;
use crate::models::{CodeMetadata, Hotspot, Snapshot};

#[derive(Debug)]
pub struct MetricsStore {
    pool: SqlitePool,
}

/// One row of a file's history across snapshots.
#[derive(Debug, Clone)]
pub struct TrendPoint {
    pub snapshot_id: String,
    pub created_at: i64,
    pub lines_of_code: u32,
    pub commit_count: Option<u32>,
    pub author_count: Option<u32>,
}

impl MetricsStore {
    /// Open (or create) the metrics database and run idempotent migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PulseError::Storage(format!("cannot create {}: {}", parent.display(), e)))?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| PulseError::Storage(format!("cannot open metrics store: {}", e)))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS snapshots (
                id TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                repository_path TEXT NOT NULL,
                trigger_kind TEXT NOT NULL,
                files_scanned INTEGER NOT NULL,
                documents_indexed INTEGER NOT NULL,
                vectors_stored INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS file_metrics (
                snapshot_id TEXT NOT NULL,
                file_path TEXT NOT NULL,
                lines_of_code INTEGER NOT NULL,
                num_functions INTEGER NOT NULL,
                num_imports INTEGER NOT NULL,
                commit_count INTEGER,
                author_count INTEGER,
                last_modified INTEGER,
                PRIMARY KEY (snapshot_id, file_path),
                FOREIGN KEY (snapshot_id) REFERENCES snapshots(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Latest-snapshot resolution per repository path
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_snapshots_repo_created
             ON snapshots(repository_path, created_at DESC)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_file_metrics_path
             ON file_metrics(file_path)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Append one snapshot and its per-file rows in a single transaction.
    pub async fn record_snapshot(
        &self,
        snapshot: &Snapshot,
        metadata: &[CodeMetadata],
    ) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| PulseError::Storage(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO snapshots
                (id, created_at, repository_path, trigger_kind,
                 files_scanned, documents_indexed, vectors_stored, duration_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&snapshot.id)
        .bind(snapshot.created_at)
        .bind(&snapshot.repository_path)
        .bind(&snapshot.trigger)
        .bind(snapshot.files_scanned as i64)
        .bind(snapshot.documents_indexed as i64)
        .bind(snapshot.vectors_stored as i64)
        .bind(snapshot.duration_ms as i64)
        .execute(&mut *tx)
        .await?;

        for m in metadata {
            sqlx::query(
                r#"
                INSERT INTO file_metrics
                    (snapshot_id, file_path, lines_of_code, num_functions,
                     num_imports, commit_count, author_count, last_modified)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&snapshot.id)
            .bind(&m.file_path)
            .bind(m.lines_of_code as i64)
            .bind(m.num_functions as i64)
            .bind(m.num_imports as i64)
            .bind(m.commit_count.map(|v| v as i64))
            .bind(m.author_count.map(|v| v as i64))
            .bind(m.last_modified)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit()
            .await
            .map_err(|e| PulseError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Newest snapshot id for a repository path, if any.
    pub async fn latest_snapshot_id(&self, repository_path: &str) -> Result<Option<String>> {
        let id = sqlx::query_scalar(
            "SELECT id FROM snapshots WHERE repository_path = ?
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(repository_path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    /// Resolve an explicit snapshot id, or fall back to the newest snapshot
    /// for the repository.
    async fn resolve_snapshot(
        &self,
        snapshot_id: Option<&str>,
        repository_path: &str,
    ) -> Result<String> {
        match snapshot_id {
            Some(id) => Ok(id.to_string()),
            None => self
                .latest_snapshot_id(repository_path)
                .await?
                .ok_or_else(|| anyhow::anyhow!("no snapshots recorded for {}", repository_path)),
        }
    }

    /// Summary of one snapshot, or of the newest one for the repository
    /// when no id is given.
    pub async fn snapshot_summary(
        &self,
        snapshot_id: Option<&str>,
        repository_path: &str,
    ) -> Result<Snapshot> {
        let id = self.resolve_snapshot(snapshot_id, repository_path).await?;
        self.get_snapshot(&id).await
    }

    pub async fn get_snapshot(&self, id: &str) -> Result<Snapshot> {
        let row = sqlx::query(
            "SELECT id, created_at, repository_path, trigger_kind,
                    files_scanned, documents_indexed, vectors_stored, duration_ms
             FROM snapshots WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .with_context(|| format!("snapshot not found: {}", id))?;

        Ok(Snapshot {
            id: row.get("id"),
            created_at: row.get("created_at"),
            repository_path: row.get("repository_path"),
            trigger: row.get("trigger_kind"),
            files_scanned: row.get::<i64, _>("files_scanned") as u32,
            documents_indexed: row.get::<i64, _>("documents_indexed") as u32,
            vectors_stored: row.get::<i64, _>("vectors_stored") as u32,
            duration_ms: row.get::<i64, _>("duration_ms") as u64,
        })
    }

    pub async fn list_snapshots(&self, repository_path: &str, limit: i64) -> Result<Vec<Snapshot>> {
        let rows = sqlx::query(
            "SELECT id, created_at, repository_path, trigger_kind,
                    files_scanned, documents_indexed, vectors_stored, duration_ms
             FROM snapshots WHERE repository_path = ?
             ORDER BY created_at DESC LIMIT ?",
        )
        .bind(repository_path)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| Snapshot {
                id: row.get("id"),
                created_at: row.get("created_at"),
                repository_path: row.get("repository_path"),
                trigger: row.get("trigger_kind"),
                files_scanned: row.get::<i64, _>("files_scanned") as u32,
                documents_indexed: row.get::<i64, _>("documents_indexed") as u32,
                vectors_stored: row.get::<i64, _>("vectors_stored") as u32,
                duration_ms: row.get::<i64, _>("duration_ms") as u64,
            })
            .collect())
    }

    /// Files ordered by commit count, descending.
    pub async fn most_active(
        &self,
        snapshot_id: Option<&str>,
        repository_path: &str,
        limit: i64,
    ) -> Result<Vec<CodeMetadata>> {
        let id = self.resolve_snapshot(snapshot_id, repository_path).await?;
        let rows = sqlx::query(
            "SELECT * FROM file_metrics WHERE snapshot_id = ?
             ORDER BY COALESCE(commit_count, 0) DESC, file_path ASC LIMIT ?",
        )
        .bind(&id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_metadata).collect())
    }

    /// Files ordered by lines of code, descending.
    pub async fn largest_files(
        &self,
        snapshot_id: Option<&str>,
        repository_path: &str,
        limit: i64,
    ) -> Result<Vec<CodeMetadata>> {
        let id = self.resolve_snapshot(snapshot_id, repository_path).await?;
        let rows = sqlx::query(
            "SELECT * FROM file_metrics WHERE snapshot_id = ?
             ORDER BY lines_of_code DESC, file_path ASC LIMIT ?",
        )
        .bind(&id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_metadata).collect())
    }

    /// Files touched by the fewest distinct authors but still changing
    /// often — concentrated-ownership risk.
    pub async fn concentrated_ownership(
        &self,
        snapshot_id: Option<&str>,
        repository_path: &str,
        limit: i64,
    ) -> Result<Vec<CodeMetadata>> {
        let id = self.resolve_snapshot(snapshot_id, repository_path).await?;
        let rows = sqlx::query(
            "SELECT * FROM file_metrics
             WHERE snapshot_id = ? AND commit_count IS NOT NULL
             ORDER BY COALESCE(author_count, 0) ASC,
                      COALESCE(commit_count, 0) DESC, file_path ASC
             LIMIT ?",
        )
        .bind(&id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_metadata).collect())
    }

    /// Files ranked by `commit_count × lines_of_code / max(author_count, 1)`,
    /// descending.
    pub async fn hotspots(
        &self,
        snapshot_id: Option<&str>,
        repository_path: &str,
        limit: i64,
    ) -> Result<Vec<Hotspot>> {
        let id = self.resolve_snapshot(snapshot_id, repository_path).await?;
        let rows = sqlx::query(
            "SELECT file_path, lines_of_code,
                    COALESCE(commit_count, 0) AS commit_count,
                    COALESCE(author_count, 0) AS author_count,
                    CAST(COALESCE(commit_count, 0) AS REAL) * lines_of_code
                        / MAX(COALESCE(author_count, 0), 1) AS risk_score
             FROM file_metrics WHERE snapshot_id = ?
             ORDER BY risk_score DESC, file_path ASC LIMIT ?",
        )
        .bind(&id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let commit_count = row.get::<i64, _>("commit_count") as u32;
                let lines_of_code = row.get::<i64, _>("lines_of_code") as u32;
                let author_count = row.get::<i64, _>("author_count") as u32;
                Hotspot {
                    file_path: row.get("file_path"),
                    risk_score: row.get("risk_score"),
                    commit_count,
                    lines_of_code,
                    author_count,
                    reason: format!(
                        "{} commits by {} author{} across {} lines",
                        commit_count,
                        author_count.max(1),
                        if author_count.max(1) == 1 { "" } else { "s" },
                        lines_of_code
                    ),
                }
            })
            .collect())
    }

    /// One file's metadata history across snapshots, newest first.
    pub async fn file_trend(
        &self,
        repository_path: &str,
        file_path: &str,
        limit: i64,
    ) -> Result<Vec<TrendPoint>> {
        let rows = sqlx::query(
            "SELECT fm.snapshot_id, s.created_at, fm.lines_of_code,
                    fm.commit_count, fm.author_count
             FROM file_metrics fm
             JOIN snapshots s ON s.id = fm.snapshot_id
             WHERE s.repository_path = ? AND fm.file_path = ?
             ORDER BY s.created_at DESC LIMIT ?",
        )
        .bind(repository_path)
        .bind(file_path)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| TrendPoint {
                snapshot_id: row.get("snapshot_id"),
                created_at: row.get("created_at"),
                lines_of_code: row.get::<i64, _>("lines_of_code") as u32,
                commit_count: row.get::<Option<i64>, _>("commit_count").map(|v| v as u32),
                author_count: row.get::<Option<i64>, _>("author_count").map(|v| v as u32),
            })
            .collect())
    }

    /// Delete snapshots older than the retention horizon. Cascades to their
    /// file_metrics rows. Returns the number of snapshots deleted.
    pub async fn prune(&self, retention_days: u32) -> Result<u64> {
        let cutoff = chrono::Utc::now().timestamp() - (retention_days as i64) * 86400;
        let result = sqlx::query("DELETE FROM snapshots WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn row_to_metadata(row: &sqlx::sqlite::SqliteRow) -> CodeMetadata {
    CodeMetadata {
        file_path: row.get("file_path"),
        lines_of_code: row.get::<i64, _>("lines_of_code") as u32,
        num_functions: row.get::<i64, _>("num_functions") as u32,
        num_imports: row.get::<i64, _>("num_imports") as u32,
        commit_count: row.get::<Option<i64>, _>("commit_count").map(|v| v as u32),
        author_count: row.get::<Option<i64>, _>("author_count").map(|v| v as u32),
        last_modified: row.get("last_modified"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn snapshot(repo: &str, created_at: i64) -> Snapshot {
        Snapshot {
            id: Uuid::new_v4().to_string(),
            created_at,
            repository_path: repo.to_string(),
            trigger: "index".to_string(),
            files_scanned: 3,
            documents_indexed: 9,
            vectors_stored: 9,
            duration_ms: 42,
        }
    }

    fn metadata(
        file: &str,
        loc: u32,
        commits: Option<u32>,
        authors: Option<u32>,
    ) -> CodeMetadata {
        CodeMetadata {
            file_path: file.to_string(),
            lines_of_code: loc,
            num_functions: 1,
            num_imports: 0,
            commit_count: commits,
            author_count: authors,
            last_modified: commits.map(|_| 1700000000),
        }
    }

    async fn open_store(tmp: &TempDir) -> MetricsStore {
        MetricsStore::open(&tmp.path().join("metrics.sqlite"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_record_and_resolve_latest() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;

        let older = snapshot("/repo", 100);
        let newer = snapshot("/repo", 200);
        store.record_snapshot(&older, &[]).await.unwrap();
        store.record_snapshot(&newer, &[]).await.unwrap();

        let latest = store.latest_snapshot_id("/repo").await.unwrap().unwrap();
        assert_eq!(latest, newer.id);
        assert!(store
            .latest_snapshot_id("/other")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_snapshot_summary_by_id_and_latest() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;

        let older = snapshot("/repo", 100);
        let newer = snapshot("/repo", 200);
        store.record_snapshot(&older, &[]).await.unwrap();
        store.record_snapshot(&newer, &[]).await.unwrap();

        // No id falls back to the newest snapshot
        let latest = store.snapshot_summary(None, "/repo").await.unwrap();
        assert_eq!(latest.id, newer.id);
        assert_eq!(latest.created_at, 200);

        // An explicit id wins over recency
        let by_id = store
            .snapshot_summary(Some(older.id.as_str()), "/repo")
            .await
            .unwrap();
        assert_eq!(by_id.id, older.id);
        assert_eq!(by_id.files_scanned, 3);

        assert!(store
            .snapshot_summary(Some("no-such-snapshot"), "/repo")
            .await
            .is_err());
        assert!(store.snapshot_summary(None, "/empty").await.is_err());
    }

    #[tokio::test]
    async fn test_hotspot_scoring_branches() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;

        let snap = snapshot("/repo", 100);
        store
            .record_snapshot(
                &snap,
                &[
                    // 20 × 500 / 2 = 5000
                    metadata("shared.rs", 500, Some(20), Some(2)),
                    // author_count 0 → max(0, 1) = 1 → 20 × 500 / 1 = 10000
                    metadata("orphan.rs", 500, Some(20), Some(0)),
                ],
            )
            .await
            .unwrap();

        let hotspots = store.hotspots(None, "/repo", 10).await.unwrap();
        assert_eq!(hotspots[0].file_path, "orphan.rs");
        assert!((hotspots[0].risk_score - 10000.0).abs() < 1e-9);
        assert_eq!(hotspots[1].file_path, "shared.rs");
        assert!((hotspots[1].risk_score - 5000.0).abs() < 1e-9);
        assert!(hotspots[0].reason.contains("20 commits"));
    }

    #[tokio::test]
    async fn test_most_active_and_largest_ordering() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;

        let snap = snapshot("/repo", 100);
        store
            .record_snapshot(
                &snap,
                &[
                    metadata("busy.rs", 10, Some(30), Some(3)),
                    metadata("quiet.rs", 900, Some(1), Some(1)),
                    metadata("nohistory.rs", 50, None, None),
                ],
            )
            .await
            .unwrap();

        let active = store.most_active(None, "/repo", 10).await.unwrap();
        assert_eq!(active[0].file_path, "busy.rs");
        // Files without history sort last
        assert_eq!(active[2].file_path, "nohistory.rs");

        let largest = store.largest_files(None, "/repo", 2).await.unwrap();
        assert_eq!(largest.len(), 2);
        assert_eq!(largest[0].file_path, "quiet.rs");
    }

    #[tokio::test]
    async fn test_concentrated_ownership_ordering() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;

        let snap = snapshot("/repo", 100);
        store
            .record_snapshot(
                &snap,
                &[
                    metadata("two_authors.rs", 10, Some(9), Some(2)),
                    metadata("solo_busy.rs", 10, Some(20), Some(1)),
                    metadata("solo_quiet.rs", 10, Some(2), Some(1)),
                    metadata("nohistory.rs", 10, None, None),
                ],
            )
            .await
            .unwrap();

        let owned = store
            .concentrated_ownership(None, "/repo", 10)
            .await
            .unwrap();
        let order: Vec<&str> = owned.iter().map(|m| m.file_path.as_str()).collect();
        // Fewest authors first, then most commits; no-history rows excluded
        assert_eq!(order, vec!["solo_busy.rs", "solo_quiet.rs", "two_authors.rs"]);
    }

    #[tokio::test]
    async fn test_file_trend_across_snapshots() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;

        let first = snapshot("/repo", 100);
        let second = snapshot("/repo", 200);
        store
            .record_snapshot(&first, &[metadata("a.rs", 100, Some(5), Some(1))])
            .await
            .unwrap();
        store
            .record_snapshot(&second, &[metadata("a.rs", 150, Some(8), Some(2))])
            .await
            .unwrap();

        let trend = store.file_trend("/repo", "a.rs", 10).await.unwrap();
        assert_eq!(trend.len(), 2);
        // Newest first
        assert_eq!(trend[0].snapshot_id, second.id);
        assert_eq!(trend[0].lines_of_code, 150);
        assert_eq!(trend[1].lines_of_code, 100);
    }

    #[tokio::test]
    async fn test_prune_cascades_file_metrics() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;

        let ancient = snapshot("/repo", 1000); // far past any retention horizon
        let recent = snapshot("/repo", chrono::Utc::now().timestamp());
        store
            .record_snapshot(&ancient, &[metadata("a.rs", 10, Some(1), Some(1))])
            .await
            .unwrap();
        store
            .record_snapshot(&recent, &[metadata("a.rs", 10, Some(1), Some(1))])
            .await
            .unwrap();

        let deleted = store.prune(90).await.unwrap();
        assert_eq!(deleted, 1);

        // Cascade removed the old snapshot's rows; recent trend remains
        let trend = store.file_trend("/repo", "a.rs", 10).await.unwrap();
        assert_eq!(trend.len(), 1);
        assert_eq!(trend[0].snapshot_id, recent.id);
    }

    #[tokio::test]
    async fn test_get_snapshot_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;

        let snap = snapshot("/repo", 123);
        store.record_snapshot(&snap, &[]).await.unwrap();

        let loaded = store.get_snapshot(&snap.id).await.unwrap();
        assert_eq!(loaded.created_at, 123);
        assert_eq!(loaded.trigger, "index");
        assert_eq!(loaded.files_scanned, 3);
        assert!(store.get_snapshot("nope").await.is_err());
    }
}
