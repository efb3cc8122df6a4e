//! # RepoPulse
//!
//! A semantically searchable, incrementally updated index over a source
//! repository and its git history.
//!
//! RepoPulse scans a repository into structural documents (functions,
//! classes, modules), embeds them into a local vector store, and keeps the
//! index current by fingerprinting files so that only added or changed
//! content is re-embedded. Alongside search it records per-file metrics in
//! an embedded SQLite database and derives risk analytics ("hotspots") from
//! commit activity.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌──────────────┐
//! │ Scanner  │──▶│  Indexer   │──▶│ Vector Store │
//! │ files→doc│   │ diff+embed │   │ JSON segments│
//! └──────────┘   └─────┬─────┘   └──────────────┘
//!                      │
//!        ┌─────────────┤
//!        ▼             ▼
//! ┌────────────┐  ┌──────────────┐
//! │ git log    │  │ Metrics Store│
//! │ (history)  │  │   (SQLite)   │
//! └────────────┘  └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! rpulse index                  # build the index for the cwd
//! rpulse update                 # re-embed only what changed
//! rpulse search "parse config"
//! rpulse hotspots               # highest-risk files by churn × size
//! rpulse stats
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and storage path resolution |
//! | [`models`] | Core data types |
//! | [`error`] | Typed failure taxonomy |
//! | [`scanner`] | Repository walk and document extraction |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`vector_store`] | Segment-based persistent vector store |
//! | [`history`] | Single-pass git log analysis |
//! | [`metrics`] | Per-file metrics collection |
//! | [`metrics_store`] | SQLite snapshot and analytics store |
//! | [`indexer`] | Orchestration and query surface |

pub mod config;
pub mod embedding;
pub mod error;
pub mod history;
pub mod indexer;
pub mod metrics;
pub mod metrics_store;
pub mod models;
pub mod scanner;
pub mod stats_fmt;
pub mod vector_store;
