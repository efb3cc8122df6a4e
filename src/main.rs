//! # RepoPulse CLI (`rpulse`)
//!
//! The `rpulse` binary indexes a source repository for semantic search and
//! reports change-frequency analytics derived from its git history.
//!
//! ## Usage
//!
//! ```bash
//! rpulse --repo /path/to/repo <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rpulse index` | Build (or rebuild) the semantic index |
//! | `rpulse update` | Re-embed only files that changed since the last run |
//! | `rpulse search "<query>"` | Semantic search over indexed documents |
//! | `rpulse similar <id>` | Nearest neighbors of an indexed document |
//! | `rpulse list` | List indexed documents |
//! | `rpulse optimize` | Merge vector store segments |
//! | `rpulse stats` | Index counts plus repository-wide git activity |
//! | `rpulse hotspots` | Files ranked by churn × size / ownership |
//! | `rpulse most-active` | Files with the most commits |
//! | `rpulse largest` | Files with the most lines |
//! | `rpulse ownership` | Frequently changed files with few authors |
//! | `rpulse trend <file>` | One file's metrics across snapshots |
//! | `rpulse snapshot [ID]` | Summary of one snapshot (latest by default) |
//! | `rpulse snapshots` | Recorded indexing runs |
//! | `rpulse prune` | Delete snapshots past the retention horizon |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use repopulse::config::{load_config, Config};
use repopulse::indexer::{InitOptions, RepositoryIndexer};
use repopulse::models::{IndexReport, SearchHit, SearchOptions};
use repopulse::stats_fmt::{format_bytes, format_ts_iso, format_ts_relative};

/// RepoPulse — a semantically searchable, incrementally updated index over a
/// source repository and its git history.
#[derive(Parser)]
#[command(
    name = "rpulse",
    about = "RepoPulse — semantic code search with change-frequency analytics",
    version
)]
struct Cli {
    /// Path to configuration file (TOML). Defaults to `./repopulse.toml`
    /// when present, otherwise built-in defaults are used.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Repository to operate on.
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build (or rebuild) the semantic index for the repository.
    ///
    /// Scans the tree, embeds every indexable document, and records a
    /// metrics snapshot. Re-running skips unchanged files.
    Index {
        /// Show what would be indexed without writing anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Incrementally update the index.
    ///
    /// Only files whose content changed since the last successful run are
    /// re-embedded. Requires a prior `rpulse index`.
    Update {
        /// Show the pending diff without writing anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Semantic search over indexed documents.
    Search {
        /// The search query string.
        query: String,

        /// Maximum number of results to return.
        #[arg(long, default_value_t = 10)]
        limit: usize,

        /// Minimum similarity score (0.0 to 1.0).
        #[arg(long, default_value_t = 0.0)]
        threshold: f32,
    },

    /// Nearest neighbors of an already-indexed document.
    ///
    /// Works without an embedding provider since the stored vector is
    /// reused as the query.
    Similar {
        /// Document id (e.g. `src/lib.rs#0`).
        id: String,

        /// Maximum number of results to return.
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// List indexed documents.
    List {
        /// Maximum number of documents to list.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Merge vector store segments into one.
    ///
    /// Reclaims space left by superseded and deleted records. Search
    /// results are identical before and after.
    Optimize,

    /// Index counts plus repository-wide git activity.
    Stats {
        /// Skip git entirely and report only counts the index already knows.
        #[arg(long)]
        basic: bool,
    },

    /// Files ranked by `commits × lines / authors` from the latest snapshot.
    Hotspots {
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },

    /// Files with the most commits in the analyzed history window.
    MostActive {
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },

    /// Files with the most lines of code.
    Largest {
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },

    /// Frequently changed files touched by few distinct authors.
    Ownership {
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },

    /// One file's metrics across recorded snapshots, newest first.
    Trend {
        /// Repository-relative file path.
        file: String,

        #[arg(long, default_value_t = 10)]
        limit: i64,
    },

    /// Summary of one recorded snapshot, the latest when no id is given.
    Snapshot {
        /// Snapshot id as printed by `rpulse snapshots`.
        id: Option<String>,
    },

    /// Recorded indexing runs, newest first.
    Snapshots {
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },

    /// Delete snapshots older than the configured retention horizon.
    Prune,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Index { dry_run } => run_index(&cli.repo, config, false, dry_run).await,
        Commands::Update { dry_run } => run_index(&cli.repo, config, true, dry_run).await,
        Commands::Search {
            query,
            limit,
            threshold,
        } => run_search(&cli.repo, config, &query, limit, threshold).await,
        Commands::Similar { id, limit } => run_similar(&cli.repo, config, &id, limit).await,
        Commands::List { limit } => run_list(&cli.repo, config, limit).await,
        Commands::Optimize => run_optimize(&cli.repo, config).await,
        Commands::Stats { basic } => run_stats(&cli.repo, config, basic).await,
        Commands::Hotspots { limit } => run_hotspots(&cli.repo, config, limit).await,
        Commands::MostActive { limit } => run_most_active(&cli.repo, config, limit).await,
        Commands::Largest { limit } => run_largest(&cli.repo, config, limit).await,
        Commands::Ownership { limit } => run_ownership(&cli.repo, config, limit).await,
        Commands::Trend { file, limit } => run_trend(&cli.repo, config, &file, limit).await,
        Commands::Snapshot { id } => run_snapshot(&cli.repo, config, id.as_deref()).await,
        Commands::Snapshots { limit } => run_snapshots(&cli.repo, config, limit).await,
        Commands::Prune => run_prune(&cli.repo, config).await,
    }
}

async fn run_index(
    repo: &PathBuf,
    config: Config,
    incremental: bool,
    dry_run: bool,
) -> anyhow::Result<()> {
    let options = InitOptions {
        require_existing: incremental,
        skip_embedder: dry_run,
    };
    let mut indexer = RepositoryIndexer::open(repo, config, options).await?;
    let report = if dry_run {
        indexer.preview().await?
    } else if incremental {
        indexer.update().await?
    } else {
        indexer.index().await?
    };
    print_report(&report, dry_run);
    indexer.close().await;
    Ok(())
}

fn print_report(report: &IndexReport, dry_run: bool) {
    if dry_run {
        println!("Dry run, nothing written ({} ms)", report.duration_ms);
    } else {
        println!("Indexing complete ({} ms)", report.duration_ms);
    }
    println!();
    println!("  Files scanned:   {}", report.files_scanned);
    println!("  Added:           {}", report.files_added);
    println!("  Changed:         {}", report.files_changed);
    println!("  Removed:         {}", report.files_removed);
    println!("  Unchanged:       {}", report.files_unchanged);
    println!();
    println!("  Documents:       {}", report.documents_indexed);
    println!("  Vectors stored:  {}", report.vectors_stored);
    if report.documents_failed > 0 {
        println!("  Failed:          {}", report.documents_failed);
    }
    for err in &report.embedding_errors {
        println!("  embed error: {}", err);
    }
    for err in &report.scan_errors {
        println!("  scan error: {}: {}", err.path, err.reason);
    }
}

async fn run_search(
    repo: &PathBuf,
    config: Config,
    query: &str,
    limit: usize,
    threshold: f32,
) -> anyhow::Result<()> {
    let options = InitOptions {
        require_existing: true,
        ..Default::default()
    };
    let mut indexer = RepositoryIndexer::open(repo, config, options).await?;
    let hits = indexer
        .search(
            query,
            SearchOptions {
                limit,
                score_threshold: threshold,
            },
        )
        .await?;
    print_hits(&hits);
    indexer.close().await;
    Ok(())
}

async fn run_similar(
    repo: &PathBuf,
    config: Config,
    id: &str,
    limit: usize,
) -> anyhow::Result<()> {
    let options = InitOptions {
        skip_embedder: true,
        require_existing: true,
    };
    let mut indexer = RepositoryIndexer::open(repo, config, options).await?;
    let hits = indexer.similar(
        id,
        SearchOptions {
            limit,
            ..Default::default()
        },
    )?;
    print_hits(&hits);
    indexer.close().await;
    Ok(())
}

fn print_hits(hits: &[SearchHit]) {
    if hits.is_empty() {
        println!("No results.");
        return;
    }
    for (i, hit) in hits.iter().enumerate() {
        println!(
            "{}. [{:.2}] {} / {} ({})",
            i + 1,
            hit.score,
            hit.metadata.file_path,
            hit.metadata.name,
            hit.metadata.kind.as_str()
        );
        println!(
            "    lines {}-{}, {}",
            hit.metadata.start_line, hit.metadata.end_line, hit.metadata.language
        );
        println!(
            "    excerpt: \"{}\"",
            hit.metadata.snippet.replace('\n', " ")
        );
        println!("    id: {}", hit.id);
        println!();
    }
}

async fn run_list(repo: &PathBuf, config: Config, limit: Option<usize>) -> anyhow::Result<()> {
    let options = InitOptions {
        skip_embedder: true,
        require_existing: true,
    };
    let mut indexer = RepositoryIndexer::open(repo, config, options).await?;
    let records = indexer.list_documents(limit)?;
    for record in &records {
        println!(
            "{}  {} ({}, lines {}-{})",
            record.id,
            record.metadata.name,
            record.metadata.kind.as_str(),
            record.metadata.start_line,
            record.metadata.end_line
        );
    }
    println!();
    println!("{} documents", records.len());
    indexer.close().await;
    Ok(())
}

async fn run_optimize(repo: &PathBuf, config: Config) -> anyhow::Result<()> {
    let options = InitOptions {
        skip_embedder: true,
        require_existing: true,
    };
    let mut indexer = RepositoryIndexer::open(repo, config, options).await?;
    let report = indexer.optimize()?;
    println!(
        "Optimized: {} segments -> {}, {} live records",
        report.segments_before, report.segments_after, report.live_records
    );
    indexer.close().await;
    Ok(())
}

async fn run_stats(repo: &PathBuf, config: Config, basic: bool) -> anyhow::Result<()> {
    let options = InitOptions {
        skip_embedder: true,
        require_existing: true,
    };
    let mut indexer = RepositoryIndexer::open(repo, config, options).await?;

    println!("RepoPulse — Index Stats");
    println!("=======================");
    println!();

    if basic {
        let stats = indexer.get_basic_stats()?;
        print_basic(&stats);
    } else {
        let stats = indexer.get_stats().await?;
        print_basic(&stats.basic);
        println!();
        match stats.total_commits {
            Some(commits) => {
                println!("  Commits:     {}", commits);
                println!("  Authors:     {}", stats.distinct_authors.unwrap_or(0));
                if let Some(ts) = stats.last_commit {
                    println!("  Last commit: {}", format_ts_relative(ts));
                }
            }
            None => println!("  (no readable git history)"),
        }
    }
    indexer.close().await;
    Ok(())
}

fn print_basic(stats: &repopulse::models::BasicStats) {
    println!("  Repository:  {}", stats.repository_path);
    println!("  Files:       {}", stats.files_indexed);
    println!("  Documents:   {}", stats.documents_indexed);
    println!("  Vectors:     {}", stats.vectors_stored);
    println!("  Storage:     {}", format_bytes(stats.storage_bytes));
    println!("  Indexed:     {}", format_ts_relative(stats.indexed_at));
}

async fn run_hotspots(repo: &PathBuf, config: Config, limit: i64) -> anyhow::Result<()> {
    let mut indexer = open_readonly(repo, config).await?;
    let hotspots = indexer.hotspots(limit).await?;
    if hotspots.is_empty() {
        println!("No results.");
    }
    for (i, spot) in hotspots.iter().enumerate() {
        println!("{}. [{:.0}] {}", i + 1, spot.risk_score, spot.file_path);
        println!("    {}", spot.reason);
    }
    indexer.close().await;
    Ok(())
}

async fn run_most_active(repo: &PathBuf, config: Config, limit: i64) -> anyhow::Result<()> {
    let mut indexer = open_readonly(repo, config).await?;
    let files = indexer.most_active(limit).await?;
    for (i, m) in files.iter().enumerate() {
        println!(
            "{}. {} ({} commits, {} authors)",
            i + 1,
            m.file_path,
            m.commit_count.unwrap_or(0),
            m.author_count.unwrap_or(0)
        );
    }
    indexer.close().await;
    Ok(())
}

async fn run_largest(repo: &PathBuf, config: Config, limit: i64) -> anyhow::Result<()> {
    let mut indexer = open_readonly(repo, config).await?;
    let files = indexer.largest_files(limit).await?;
    for (i, m) in files.iter().enumerate() {
        println!(
            "{}. {} ({} lines, {} functions)",
            i + 1,
            m.file_path,
            m.lines_of_code,
            m.num_functions
        );
    }
    indexer.close().await;
    Ok(())
}

async fn run_ownership(repo: &PathBuf, config: Config, limit: i64) -> anyhow::Result<()> {
    let mut indexer = open_readonly(repo, config).await?;
    let files = indexer.concentrated_ownership(limit).await?;
    for (i, m) in files.iter().enumerate() {
        println!(
            "{}. {} ({} author{}, {} commits)",
            i + 1,
            m.file_path,
            m.author_count.unwrap_or(0),
            if m.author_count.unwrap_or(0) == 1 { "" } else { "s" },
            m.commit_count.unwrap_or(0)
        );
    }
    indexer.close().await;
    Ok(())
}

async fn run_trend(repo: &PathBuf, config: Config, file: &str, limit: i64) -> anyhow::Result<()> {
    let mut indexer = open_readonly(repo, config).await?;
    let points = indexer.file_trend(file, limit).await?;
    if points.is_empty() {
        println!("No snapshots include {}", file);
    }
    for point in &points {
        println!(
            "{}  {} lines, {} commits, {} authors",
            format_ts_iso(point.created_at),
            point.lines_of_code,
            point.commit_count.unwrap_or(0),
            point.author_count.unwrap_or(0)
        );
    }
    indexer.close().await;
    Ok(())
}

async fn run_snapshot(repo: &PathBuf, config: Config, id: Option<&str>) -> anyhow::Result<()> {
    let mut indexer = open_readonly(repo, config).await?;
    let snap = indexer.snapshot_summary(id).await?;
    println!("Snapshot {}", snap.id);
    println!();
    println!("  Recorded:    {}", format_ts_iso(snap.created_at));
    println!("  Trigger:     {}", snap.trigger);
    println!("  Files:       {}", snap.files_scanned);
    println!("  Documents:   {}", snap.documents_indexed);
    println!("  Vectors:     {}", snap.vectors_stored);
    println!("  Duration:    {} ms", snap.duration_ms);
    indexer.close().await;
    Ok(())
}

async fn run_snapshots(repo: &PathBuf, config: Config, limit: i64) -> anyhow::Result<()> {
    let mut indexer = open_readonly(repo, config).await?;
    let snapshots = indexer.list_snapshots(limit).await?;
    for snap in &snapshots {
        println!(
            "{}  {}  {} files, {} documents, {} ms  [{}]",
            format_ts_iso(snap.created_at),
            snap.trigger,
            snap.files_scanned,
            snap.documents_indexed,
            snap.duration_ms,
            snap.id
        );
    }
    indexer.close().await;
    Ok(())
}

async fn run_prune(repo: &PathBuf, config: Config) -> anyhow::Result<()> {
    let mut indexer = open_readonly(repo, config).await?;
    let deleted = indexer.prune_snapshots().await?;
    println!("Pruned {} snapshot{}", deleted, if deleted == 1 { "" } else { "s" });
    indexer.close().await;
    Ok(())
}

async fn open_readonly(repo: &PathBuf, config: Config) -> anyhow::Result<RepositoryIndexer> {
    RepositoryIndexer::open(
        repo,
        config,
        InitOptions {
            skip_embedder: true,
            require_existing: true,
        },
    )
    .await
}
