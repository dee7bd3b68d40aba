//! Bounded, transactional commit batches with a per-record fallback

use crate::error::{IngestError, StoreError};
use crate::store::CommitStore;
use crate::types::{BranchBackfill, PendingCommit};

/// What a single flush wrote
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Commits that are now durable
    pub persisted: usize,
    /// The batch transaction failed and records were written one by one
    pub degraded: bool,
    /// Commits written with a truncated file list
    pub truncated: usize,
    /// Commits that turned out to be stored already
    pub skipped_duplicates: usize,
    /// Stored commits that received a branch label
    pub backfilled: usize,
}

/// Accumulates pending commits and writes them in one transaction
///
/// When the batch transaction fails, every commit is retried on its own with
/// at most `file_cap` files so a single pathological commit cannot block the
/// rest. Commits are never dropped by the fallback.
pub struct BatchWriter {
    repository_id: i64,
    batch_size: usize,
    file_cap: usize,
    pending: Vec<PendingCommit>,
    backfills: Vec<BranchBackfill>,
}

impl BatchWriter {
    pub fn new(repository_id: i64, batch_size: usize, file_cap: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            repository_id,
            batch_size,
            file_cap,
            pending: Vec::with_capacity(batch_size),
            backfills: Vec::new(),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Queue a commit; returns true once the batch is full
    pub fn push(&mut self, commit: PendingCommit) -> bool {
        self.pending.push(commit);
        self.is_full()
    }

    /// Queue a branch label for an already stored commit
    pub fn push_backfill(&mut self, backfill: BranchBackfill) -> bool {
        self.backfills.push(backfill);
        self.is_full()
    }

    pub fn is_full(&self) -> bool {
        self.pending.len() + self.backfills.len() >= self.batch_size
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.backfills.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Write everything queued so far; the buffer is empty afterwards
    pub fn flush<S: CommitStore + ?Sized>(
        &mut self,
        store: &mut S,
    ) -> Result<FlushOutcome, IngestError> {
        let commits = std::mem::take(&mut self.pending);
        let backfills = std::mem::take(&mut self.backfills);
        let mut outcome = FlushOutcome::default();

        if !commits.is_empty() {
            match store.insert_batch(&commits) {
                Ok(ids) => outcome.persisted = ids.len(),
                Err(e) => {
                    tracing::warn!(
                        "{}",
                        IngestError::BatchWriteFailure {
                            attempted: commits.len(),
                            failed: commits.len(),
                            reason: format!("{}; retrying commits individually", e),
                        }
                    );
                    outcome.degraded = true;
                    self.write_individually(store, &commits, &mut outcome)?;
                }
            }
        }

        if !backfills.is_empty() {
            outcome.backfilled = store
                .backfill_branches(self.repository_id, &backfills)
                .map_err(|e| IngestError::BatchWriteFailure {
                    attempted: backfills.len(),
                    failed: backfills.len(),
                    reason: format!("branch backfill failed: {}", e),
                })?;
        }

        tracing::debug!(
            "Flushed batch: {} persisted, {} backfilled, degraded={}",
            outcome.persisted,
            outcome.backfilled,
            outcome.degraded
        );
        Ok(outcome)
    }

    fn write_individually<S: CommitStore + ?Sized>(
        &self,
        store: &mut S,
        commits: &[PendingCommit],
        outcome: &mut FlushOutcome,
    ) -> Result<(), IngestError> {
        let mut failures: Vec<String> = Vec::new();

        for commit in commits {
            match store.insert_commit(commit, self.file_cap) {
                Ok(_) => {
                    outcome.persisted += 1;
                    if commit.files.len() > self.file_cap {
                        outcome.truncated += 1;
                        tracing::warn!(
                            "Commit {} stored with {} of {} files",
                            commit.sha,
                            self.file_cap,
                            commit.files.len()
                        );
                    }
                }
                Err(StoreError::Duplicate(_)) => {
                    tracing::debug!("Commit {} is already stored", commit.sha);
                    outcome.skipped_duplicates += 1;
                }
                Err(e) => {
                    tracing::warn!("Failed to store commit {}: {}", commit.sha, e);
                    failures.push(format!("{}: {}", commit.sha, e));
                }
            }
        }

        if let Some(first) = failures.first() {
            return Err(IngestError::BatchWriteFailure {
                attempted: commits.len(),
                failed: failures.len(),
                reason: first.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteSession;
    use crate::types::{
        Contributor, CommitType, NewContributor, NewRepository, PendingFile,
    };
    use chrono::DateTime;
    use std::collections::HashMap;

    /// Store whose batch transaction rejects very large commits
    struct FlakyStore {
        inner: SqliteSession,
        max_files_per_batch_commit: usize,
        failing_sha: Option<String>,
    }

    impl CommitStore for FlakyStore {
        fn load_contributors(&mut self) -> Result<Vec<Contributor>, StoreError> {
            self.inner.load_contributors()
        }

        fn insert_contributor(
            &mut self,
            contributor: &NewContributor,
        ) -> Result<Contributor, StoreError> {
            self.inner.insert_contributor(contributor)
        }

        fn known_commits(
            &mut self,
            repository_id: i64,
        ) -> Result<HashMap<String, bool>, StoreError> {
            self.inner.known_commits(repository_id)
        }

        fn insert_batch(&mut self, commits: &[PendingCommit]) -> Result<Vec<i64>, StoreError> {
            if commits
                .iter()
                .any(|c| c.files.len() > self.max_files_per_batch_commit)
            {
                return Err(StoreError::Query("statement too large".to_string()));
            }
            self.inner.insert_batch(commits)
        }

        fn insert_commit(
            &mut self,
            commit: &PendingCommit,
            file_cap: usize,
        ) -> Result<i64, StoreError> {
            if self.failing_sha.as_deref() == Some(commit.sha.as_str()) {
                return Err(StoreError::Query("disk I/O error".to_string()));
            }
            self.inner.insert_commit(commit, file_cap)
        }

        fn backfill_branches(
            &mut self,
            repository_id: i64,
            backfills: &[BranchBackfill],
        ) -> Result<usize, StoreError> {
            self.inner.backfill_branches(repository_id, backfills)
        }

        fn mark_analyzed(
            &mut self,
            repository_id: i64,
            at: chrono::DateTime<chrono::Utc>,
        ) -> Result<(), StoreError> {
            self.inner.mark_analyzed(repository_id, at)
        }
    }

    fn flaky_store() -> (FlakyStore, i64, i64) {
        let mut inner = SqliteSession::open_in_memory().unwrap();
        let repo = inner
            .insert_repository(&NewRepository {
                name: "big".to_string(),
                path: "/tmp/big".to_string(),
                url: None,
            })
            .unwrap();
        let author = inner
            .insert_contributor(&NewContributor::with_defaults("Ada", "ada@example.com"))
            .unwrap();
        (
            FlakyStore {
                inner,
                max_files_per_batch_commit: 5_000,
                failing_sha: None,
            },
            repo.id,
            author.id,
        )
    }

    fn commit(repository_id: i64, contributor_id: i64, sha: &str, files: usize) -> PendingCommit {
        PendingCommit {
            sha: sha.to_string(),
            repository_id,
            contributor_id,
            message: "chore: bulk".to_string(),
            committed_at: DateTime::from_timestamp(1_650_000_000, 0).unwrap(),
            author_name: "Ada".to_string(),
            author_email: "ada@example.com".to_string(),
            files_changed: files as u64,
            lines_added: files as u64,
            lines_deleted: 0,
            commit_type: CommitType::Other,
            is_merge: false,
            branch_name: Some("main".to_string()),
            files: (0..files)
                .map(|i| PendingFile {
                    path: format!("gen/{}.json", i),
                    file_type: ".json".to_string(),
                    lines_added: 1,
                    lines_deleted: 0,
                    is_test_file: false,
                })
                .collect(),
        }
    }

    #[test]
    fn test_push_reports_full_batch() {
        let mut writer = BatchWriter::new(1, 2, 100);
        assert!(!writer.push(commit(1, 1, "a", 0)));
        assert!(writer.push(commit(1, 1, "b", 0)));
        assert_eq!(writer.len(), 2);
    }

    #[test]
    fn test_clean_batch_is_single_transaction() {
        let (mut store, repo, author) = flaky_store();
        let mut writer = BatchWriter::new(repo, 10, 100);
        writer.push(commit(repo, author, "a", 3));
        writer.push(commit(repo, author, "b", 2));

        let outcome = writer.flush(&mut store).unwrap();
        assert_eq!(outcome.persisted, 2);
        assert!(!outcome.degraded);
        assert!(writer.is_empty());
        assert_eq!(store.inner.commit_file_count(repo).unwrap(), 5);
    }

    #[test]
    fn test_oversized_commit_falls_back_without_loss() {
        let (mut store, repo, author) = flaky_store();
        let mut writer = BatchWriter::new(repo, 10, 100);
        writer.push(commit(repo, author, "small-1", 2));
        writer.push(commit(repo, author, "huge", 10_000));
        writer.push(commit(repo, author, "small-2", 1));

        let outcome = writer.flush(&mut store).unwrap();
        assert!(outcome.degraded);
        assert_eq!(outcome.persisted, 3);
        assert_eq!(outcome.truncated, 1);
        assert_eq!(store.inner.commit_count(repo).unwrap(), 3);

        let huge = store.inner.find_commit(repo, "huge").unwrap().unwrap();
        assert_eq!(huge.files_changed, 10_000);
        assert_eq!(store.inner.commit_files(huge.id).unwrap().len(), 100);

        let small = store.inner.find_commit(repo, "small-1").unwrap().unwrap();
        assert_eq!(store.inner.commit_files(small.id).unwrap().len(), 2);
    }

    #[test]
    fn test_fallback_treats_duplicates_as_stored() {
        let (mut store, repo, author) = flaky_store();
        store.inner.insert_batch(&[commit(repo, author, "a", 1)]).unwrap();

        let mut writer = BatchWriter::new(repo, 10, 100);
        writer.push(commit(repo, author, "a", 1));
        writer.push(commit(repo, author, "b", 1));

        let outcome = writer.flush(&mut store).unwrap();
        assert!(outcome.degraded);
        assert_eq!(outcome.persisted, 1);
        assert_eq!(outcome.skipped_duplicates, 1);
        assert_eq!(store.inner.commit_count(repo).unwrap(), 2);
    }

    #[test]
    fn test_fallback_failure_reports_counts_and_keeps_others() {
        let (mut store, repo, author) = flaky_store();
        store.failing_sha = Some("bad".to_string());

        let mut writer = BatchWriter::new(repo, 10, 100);
        writer.push(commit(repo, author, "huge", 6_000));
        writer.push(commit(repo, author, "bad", 1));
        writer.push(commit(repo, author, "good", 1));

        match writer.flush(&mut store) {
            Err(IngestError::BatchWriteFailure {
                attempted, failed, ..
            }) => {
                assert_eq!(attempted, 3);
                assert_eq!(failed, 1);
            }
            other => panic!("expected batch failure, got {:?}", other),
        }
        assert_eq!(store.inner.commit_count(repo).unwrap(), 2);
    }

    #[test]
    fn test_backfills_are_applied_on_flush() {
        let (mut store, repo, author) = flaky_store();
        let mut unlabeled = commit(repo, author, "a", 0);
        unlabeled.branch_name = None;
        store.inner.insert_batch(&[unlabeled]).unwrap();

        let mut writer = BatchWriter::new(repo, 10, 100);
        writer.push_backfill(BranchBackfill {
            sha: "a".to_string(),
            branch_name: "main".to_string(),
        });
        let outcome = writer.flush(&mut store).unwrap();
        assert_eq!(outcome.backfilled, 1);
        assert_eq!(outcome.persisted, 0);
    }
}
