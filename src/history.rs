//! Change-frequency analysis from git history.
//!
//! One batched `git log` traversal (bounded by `history.max_commits`)
//! produces per-(file, author) [`FileAuthorContribution`] rows. The cost is
//! O(history size) and independent of repository file count — the
//! alternative of one `git log` per file is O(files × history) and was the
//! motivating bottleneck. A missing git binary or a non-git directory
//! degrades to "no change-frequency data" rather than failing indexing.

use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

use crate::config::HistoryConfig;
use crate::error::PulseError;
use crate::models::{ChangeFrequency, FileAuthorContribution};

/// Field separator used in the git log format string; unlikely to appear in
/// author names.
const UNIT_SEP: char = '\x1f';

pub struct ChangeFrequencyAnalyzer {
    repo: PathBuf,
    config: HistoryConfig,
}

impl ChangeFrequencyAnalyzer {
    pub fn new(repo: &Path, config: &HistoryConfig) -> Self {
        Self {
            repo: repo.to_path_buf(),
            config: config.clone(),
        }
    }

    /// Run the single bounded log traversal and aggregate contributions.
    ///
    /// Errors are always [`PulseError::VcsUnavailable`]; callers omit
    /// change-frequency fields and continue.
    pub async fn collect(&self) -> Result<Vec<FileAuthorContribution>, PulseError> {
        let max_count = self.config.max_commits.to_string();
        let format = format!("%H{}%an{}%ct", UNIT_SEP, UNIT_SEP);

        let output = Command::new("git")
            .args(["log", "--max-count", &max_count, "--name-only"])
            .arg(format!("--format={}", format))
            .current_dir(&self.repo)
            .output();

        let output = tokio::time::timeout(Duration::from_secs(self.config.timeout_secs), output)
            .await
            .map_err(|_| PulseError::VcsUnavailable("git log timed out".to_string()))?
            .map_err(|e| PulseError::VcsUnavailable(format!("cannot run git: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PulseError::VcsUnavailable(stderr.trim().to_string()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_log(&stdout))
    }
}

/// Parse `git log --name-only` output with `%H<US>%an<US>%ct` headers.
///
/// Header lines carry the unit separator; every other non-empty line is a
/// file path touched by the current commit.
fn parse_log(log: &str) -> Vec<FileAuthorContribution> {
    struct Entry {
        commit_count: u32,
        last_commit: i64,
    }

    let mut current: Option<(String, i64)> = None; // (author, timestamp)
    let mut by_pair: HashMap<(String, String), Entry> = HashMap::new();

    for line in log.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }

        if line.contains(UNIT_SEP) {
            let mut parts = line.split(UNIT_SEP);
            let _sha = parts.next();
            let author = parts.next().unwrap_or("unknown").to_string();
            let timestamp = parts
                .next()
                .and_then(|t| t.trim().parse::<i64>().ok())
                .unwrap_or(0);
            current = Some((author, timestamp));
            continue;
        }

        let Some((author, timestamp)) = &current else {
            continue;
        };

        let key = (line.to_string(), author.clone());
        let entry = by_pair.entry(key).or_insert(Entry {
            commit_count: 0,
            last_commit: i64::MIN,
        });
        entry.commit_count += 1;
        entry.last_commit = entry.last_commit.max(*timestamp);
    }

    let mut contributions: Vec<FileAuthorContribution> = by_pair
        .into_iter()
        .map(|((file_path, author), entry)| FileAuthorContribution {
            file_path,
            author,
            commit_count: entry.commit_count,
            last_commit: entry.last_commit,
        })
        .collect();

    contributions.sort_by(|a, b| {
        a.file_path
            .cmp(&b.file_path)
            .then_with(|| a.author.cmp(&b.author))
    });
    contributions
}

/// Aggregate contributions into per-file change frequency: commit count is
/// the sum over contributions, author count the number of distinct
/// contributors, last-modified the max commit time.
pub fn summarize(contributions: &[FileAuthorContribution]) -> HashMap<String, ChangeFrequency> {
    let mut authors_per_file: HashMap<&str, HashSet<&str>> = HashMap::new();
    let mut summary: HashMap<String, ChangeFrequency> = HashMap::new();

    for c in contributions {
        authors_per_file
            .entry(&c.file_path)
            .or_default()
            .insert(&c.author);

        let entry = summary
            .entry(c.file_path.clone())
            .or_insert(ChangeFrequency {
                commit_count: 0,
                author_count: 0,
                last_modified: i64::MIN,
            });
        entry.commit_count += c.commit_count;
        entry.last_modified = entry.last_modified.max(c.last_commit);
    }

    for (file, freq) in summary.iter_mut() {
        freq.author_count = authors_per_file
            .get(file.as_str())
            .map(|a| a.len() as u32)
            .unwrap_or(0);
    }

    summary
}
