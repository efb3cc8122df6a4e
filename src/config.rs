use anyhow::{Context, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Root directory under which per-repository storage lives.
    /// Each repository gets a subdirectory keyed by a hash of its
    /// canonical path, so the index can be located from any cwd.
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

fn default_storage_root() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".repopulse"),
        None => PathBuf::from(".repopulse"),
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScannerConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    /// Language allow-list by name (e.g. `["rust", "python"]`).
    /// Empty means every recognized language is indexed.
    #[serde(default)]
    pub languages: Vec<String>,
    /// Upper bound on embedded content per document, in characters.
    #[serde(default = "default_max_document_chars")]
    pub max_document_chars: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            languages: Vec::new(),
            max_document_chars: default_max_document_chars(),
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}
fn default_max_document_chars() -> usize {
    8000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `hash` (deterministic, offline) or `openai`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Bounded worker count for embedding batches. Unset means derive
    /// from available CPU parallelism.
    #[serde(default)]
    pub concurrency: Option<usize>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: default_dims(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            concurrency: None,
        }
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_dims() -> usize {
    256
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    /// Effective worker count: explicit config wins, otherwise capped
    /// CPU-derived so low-memory hosts don't fan out.
    pub fn effective_concurrency(&self) -> usize {
        match self.concurrency {
            Some(n) if n > 0 => n,
            _ => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2)
                .min(4),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HistoryConfig {
    /// Upper bound on commits traversed in one git log pass.
    #[serde(default = "default_max_commits")]
    pub max_commits: usize,
    #[serde(default = "default_history_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_commits: default_max_commits(),
            timeout_secs: default_history_timeout_secs(),
        }
    }
}

fn default_max_commits() -> usize {
    1000
}
fn default_history_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    /// Concurrent disk reads when computing lines-of-code.
    #[serde(default = "default_read_batch_size")]
    pub read_batch_size: usize,
    /// Snapshots older than this are eligible for `rpulse prune`.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            read_batch_size: default_read_batch_size(),
            retention_days: default_retention_days(),
        }
    }
}

fn default_read_batch_size() -> usize {
    50
}
fn default_retention_days() -> u32 {
    90
}

/// Resolved on-disk locations for one repository's index.
#[derive(Debug, Clone)]
pub struct StoragePaths {
    pub root: PathBuf,
    pub state_file: PathBuf,
    pub vectors_dir: PathBuf,
    pub metrics_db: PathBuf,
}

impl Config {
    /// Map a repository path to its storage root. A pure function of the
    /// canonical repository path plus the configured root, so multiple
    /// repositories served from one process never cross-contaminate.
    pub fn storage_paths(&self, repo: &Path) -> Result<StoragePaths> {
        let canonical = repo
            .canonicalize()
            .with_context(|| format!("cannot resolve repository path: {}", repo.display()))?;
        let key = short_hash(&canonical.to_string_lossy());
        let root = self.storage.root.join(key);
        Ok(StoragePaths {
            state_file: root.join("state.json"),
            vectors_dir: root.join("vectors"),
            metrics_db: root.join("metrics.sqlite"),
            root,
        })
    }
}

fn short_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())[..12].to_string()
}

/// Load configuration. A missing file at the default location falls back to
/// defaults; an explicitly requested file must exist.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p)
                .with_context(|| format!("Failed to read config file: {}", p.display()))?;
            toml::from_str(&content).with_context(|| "Failed to parse config file")?
        }
        None => {
            let default_path = Path::new("repopulse.toml");
            if default_path.exists() {
                let content = std::fs::read_to_string(default_path)
                    .with_context(|| "Failed to read repopulse.toml")?;
                toml::from_str(&content).with_context(|| "Failed to parse repopulse.toml")?
            } else {
                Config::default()
            }
        }
    };

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    match config.embedding.provider.as_str() {
        "hash" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be hash or openai.",
            other
        ),
    }
    if config.embedding.provider == "openai" && config.embedding.model.is_none() {
        anyhow::bail!("embedding.model must be specified when provider is 'openai'");
    }
    if config.scanner.max_document_chars == 0 {
        anyhow::bail!("scanner.max_document_chars must be > 0");
    }
    if config.history.max_commits == 0 {
        anyhow::bail!("history.max_commits must be > 0");
    }
    if config.metrics.read_batch_size == 0 {
        anyhow::bail!("metrics.read_batch_size must be > 0");
    }
    if config.metrics.retention_days == 0 {
        anyhow::bail!("metrics.retention_days must be >= 1");
    }
    Ok(())
}
