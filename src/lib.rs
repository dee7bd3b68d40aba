//! # commit-sync - Repository Synchronization & Commit Ingestion
//!
//! Clones and pulls git repositories, walks their history across all
//! branches, classifies each commit, deduplicates contributors and stores
//! everything in a relational database, reporting progress as a typed event
//! stream.
//!
//! ## Key Features
//!
//! - **Background runs**: clone, pull and analyze never block the caller;
//!   each run reports `started`, monotonic `progress` and one `completed`
//! - **Incremental ingestion**: already stored commits are skipped, so
//!   re-running an analysis is idempotent and resumes after a failure
//! - **Bounded batches**: commits are written in size-tiered transactions
//!   with a per-commit fallback that truncates pathological file lists
//! - **Stall detection**: an idle watchdog flags transfers that stop moving
//! - **Run serialization**: one run per repository, across processes too
//!
//! ## Architecture
//!
//! ```text
//!   SyncEngine ── start_clone / start_pull / start_analyze / sync
//!       │
//!       ├── SourceConnector ── TransferTracker ── IdleWatchdog
//!       │
//!       └── IngestionCoordinator
//!              ├── GitWalker (history, file stats, branch labels)
//!              ├── classify (commit type, test files, timestamps)
//!              ├── ContributorResolver
//!              └── BatchWriter ── CommitStore (SQLite)
//!
//!   ProgressReporter ── EventSink (broadcast channel / memory)
//! ```
//!
//! ## Usage Example
//!
//! ```no_run
//! use commit_sync::{Config, SyncEngine};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = SyncEngine::with_config(Config::new()?)?;
//!     let repo = engine
//!         .register_repository("app", None, Some("https://github.com/acme/app".into()))
//!         .await?;
//!
//!     let outcome = engine.sync(&repo, None).await?;
//!     println!("Stored {} new commits", outcome.analysis.commits_persisted);
//!     Ok(())
//! }
//! ```

/// Commit message, file path and timestamp classification
pub mod classify;

/// Configuration management with environment variable support
pub mod config;

/// Background run orchestration and per-repository locking
pub mod engine;

/// Error types and utilities
pub mod error;

/// Clone, pull and history walking
pub mod git;

/// Commit ingestion state machine and batch persistence
pub mod ingest;

/// Platform-specific default paths
pub mod paths;

/// Typed progress events and event sinks
pub mod progress;

/// Relational store abstraction and SQLite implementation
pub mod store;

/// Records shared between the engine and the store
pub mod types;

pub use config::Config;
pub use engine::{RunHandle, SyncEngine, SyncOutcome};
pub use error::SyncError;
pub use progress::{EventSink, SyncEvent};
