//! Git repository operations for commit ingestion
//!
//! Provides clone/pull against remotes with transfer progress, and a
//! newest-first walk over every branch with per-file change statistics.

/// Clone and pull against remotes
pub mod connector;
/// Transfer-phase progress mapping and the idle watchdog
pub mod transfer;
/// Git history walking and commit extraction
pub mod walker;

pub use connector::{CloneOutcome, PullOutcome, SourceConnector, validate_source_url};
pub use transfer::{ActivityClock, IdleWatchdog, TransferStage, TransferTracker};
pub use walker::{BranchLabels, CommitInfo, FileStat, GitWalker};
