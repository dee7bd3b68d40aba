// SQLite is the default (embedded) relational backend
pub mod sqlite;
pub use sqlite::{SqliteSession, SqliteStore};

use crate::error::StoreError;
use crate::types::{BranchBackfill, Contributor, NewContributor, PendingCommit};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Storage operations the ingestion engine issues during one run
///
/// A session is owned by exactly one run; implementations are not required
/// to be shareable across threads.
pub trait CommitStore: Send {
    /// All contributors currently stored, used to seed the resolver cache
    fn load_contributors(&mut self) -> Result<Vec<Contributor>, StoreError>;

    /// Persist a new contributor and return it with its generated id
    fn insert_contributor(&mut self, contributor: &NewContributor)
    -> Result<Contributor, StoreError>;

    /// Hashes already stored for a repository, mapped to whether the stored
    /// row carries a branch label
    fn known_commits(&mut self, repository_id: i64) -> Result<HashMap<String, bool>, StoreError>;

    /// Insert every commit and its files in one transaction
    ///
    /// Either all rows become visible or none do. Returns the generated
    /// commit ids in batch order.
    fn insert_batch(&mut self, commits: &[PendingCommit]) -> Result<Vec<i64>, StoreError>;

    /// Insert one commit with at most `file_cap` of its files, in its own
    /// transaction
    fn insert_commit(&mut self, commit: &PendingCommit, file_cap: usize)
    -> Result<i64, StoreError>;

    /// Set the branch label on stored commits that have none; returns how
    /// many rows changed
    fn backfill_branches(
        &mut self,
        repository_id: i64,
        backfills: &[BranchBackfill],
    ) -> Result<usize, StoreError>;

    /// Record the completion time of a successful analyze run
    fn mark_analyzed(&mut self, repository_id: i64, at: DateTime<Utc>) -> Result<(), StoreError>;
}

/// Factory for per-run store sessions
pub trait StoreProvider: Send + Sync + 'static {
    type Session: CommitStore + 'static;

    /// Open a fresh session; each run acquires its own and drops it when done
    fn open_session(&self) -> Result<Self::Session, StoreError>;
}
