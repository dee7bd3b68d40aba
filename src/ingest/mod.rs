//! Commit ingestion: one analyze run over one repository
//!
//! The [`IngestionCoordinator`] walks the history, skips commits that are
//! already stored, annotates the rest (classification, contributor, sanitized
//! timestamp) and persists them through the [`BatchWriter`]. It is fully
//! synchronous and meant to run on a blocking worker.

/// Transactional batches with per-record fallback
pub mod batch;
/// Run-scoped contributor cache
pub mod contributors;

pub use batch::{BatchWriter, FlushOutcome};
pub use contributors::ContributorResolver;

use crate::classify::{classify_commit_type, file_type, is_test_file, sanitize_timestamp};
use crate::config::IngestionConfig;
use crate::error::{ConnectorError, IngestError, SyncError};
use crate::git::{CommitInfo, GitWalker};
use crate::progress::ProgressReporter;
use crate::store::CommitStore;
use crate::types::{BranchBackfill, PendingCommit, PendingFile};
use chrono::Utc;
use serde::Serialize;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// Lowest percentage of the walk phase
const WALK_FLOOR: u64 = 5;
/// Highest percentage reported before finalizing
const WALK_CEILING: u64 = 95;
/// Scale of the pseudo-progress curve used without a commit estimate
const PSEUDO_SCALE: u64 = 1_000;

/// States of an analyze run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Counting,
    Walking,
    Batching,
    Finalizing,
    Completed,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }
}

/// What to analyze
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyzeRequest {
    pub repository_id: i64,
    pub path: PathBuf,
    /// Cap on commits visited; `None` walks the whole history
    pub max_commits: Option<usize>,
}

/// Counters of a finished (or failed) analyze run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AnalyzeSummary {
    /// Commit estimate used for progress, if one was available
    pub estimated_total: Option<usize>,
    pub commits_visited: usize,
    pub commits_persisted: usize,
    /// Already stored commits that needed no work
    pub commits_skipped: usize,
    pub branches_backfilled: usize,
    pub contributors_created: usize,
    pub degraded_batches: usize,
    pub truncated_commits: usize,
    /// Commits recorded without file statistics
    pub stats_errors: usize,
}

/// Batch size and progress cadence for a history of a given size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlan {
    pub batch_size: usize,
    pub progress_interval: usize,
}

impl BatchPlan {
    /// Tiered by the estimated commit count; `fixed_batch_size` overrides the
    /// batch size but not the progress cadence
    pub fn for_total(total: Option<usize>, fixed_batch_size: Option<usize>) -> Self {
        let (batch_size, progress_interval) = match total {
            Some(t) if t < 1_000 => (50, 10),
            Some(t) if t < 10_000 => (200, 50),
            Some(t) if t < 50_000 => (500, 200),
            Some(_) => (1_000, 500),
            None => (200, 50),
        };
        Self {
            batch_size: fixed_batch_size.unwrap_or(batch_size).max(1),
            progress_interval,
        }
    }
}

/// Percentage of the walk phase after `visited` commits
pub fn walk_percent(visited: usize, total: Option<usize>) -> u8 {
    let visited = visited as u64;
    let span = WALK_CEILING - WALK_FLOOR;
    let value = match total {
        Some(total) if total > 0 => {
            let total = total as u64;
            WALK_FLOOR + visited.min(total) * span / total
        }
        // Approaches the ceiling without ever reaching it
        _ => WALK_FLOOR + visited * span / (visited + PSEUDO_SCALE),
    };
    value.min(WALK_CEILING) as u8
}

/// Drives one analyze run against one store session
pub struct IngestionCoordinator<'s, S: CommitStore + ?Sized> {
    store: &'s mut S,
    config: IngestionConfig,
    reporter: ProgressReporter,
    cancel: CancellationToken,
    state: RunState,
    summary: AnalyzeSummary,
}

impl<'s, S: CommitStore + ?Sized> IngestionCoordinator<'s, S> {
    pub fn new(
        store: &'s mut S,
        config: &IngestionConfig,
        reporter: ProgressReporter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            config: config.clone(),
            reporter,
            cancel,
            state: RunState::Idle,
            summary: AnalyzeSummary::default(),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn summary(&self) -> &AnalyzeSummary {
        &self.summary
    }

    /// Run the analysis and emit the terminal event
    ///
    /// On failure, batches that were already committed stay in the store and
    /// are skipped by the next run.
    pub fn run(&mut self, request: &AnalyzeRequest) -> Result<AnalyzeSummary, SyncError> {
        self.reporter.started(format!(
            "Analyzing repository {} at {}",
            request.repository_id,
            request.path.display()
        ));

        match self.execute(request) {
            Ok(()) => {
                self.transition(RunState::Completed);
                let summary = self.summary.clone();
                tracing::info!(
                    "Analysis of {} complete: {} new commits, {} skipped, {} backfilled",
                    request.path.display(),
                    summary.commits_persisted,
                    summary.commits_skipped,
                    summary.branches_backfilled
                );
                self.reporter.completed(
                    true,
                    format!(
                        "Analysis complete. Processed {} commits.",
                        summary.commits_persisted
                    ),
                    None,
                    summary.commits_persisted as u64,
                );
                Ok(summary)
            }
            Err(err) => {
                self.transition(RunState::Failed);
                tracing::error!("Analysis of {} failed: {}", request.path.display(), err);
                let message = if err.is_cancelled() {
                    "Analysis cancelled"
                } else {
                    "Analysis failed"
                };
                self.reporter.completed(
                    false,
                    message,
                    Some(err.to_user_string()),
                    self.summary.commits_persisted as u64,
                );
                Err(err)
            }
        }
    }

    fn execute(&mut self, request: &AnalyzeRequest) -> Result<(), SyncError> {
        self.transition(RunState::Counting);
        let walker = GitWalker::open(&request.path)?;
        self.reporter
            .progress("Counting commits", 1, 0, None, "Estimating history size");

        let max_commits = request.max_commits.or(self.config.max_commits);
        let estimate = walker.estimate_commit_count(self.config.count_cap);
        let total = estimate.map(|t| max_commits.map_or(t, |max| t.min(max)));
        self.summary.estimated_total = total;

        let plan = BatchPlan::for_total(total, self.config.batch_size);
        tracing::debug!(
            "Estimated {:?} commits; batch size {}, progress every {}",
            total,
            plan.batch_size,
            plan.progress_interval
        );

        let labels = if self.config.label_branches {
            match walker.branch_labels() {
                Ok(labels) => Some(labels),
                Err(e) => {
                    tracing::warn!("Branch labelling unavailable: {}", e.message());
                    None
                }
            }
        } else {
            None
        };

        let known = self.store.known_commits(request.repository_id)?;
        let mut resolver =
            ContributorResolver::seed(&mut *self.store, self.config.infer_contributor_attributes)?;
        let mut writer = BatchWriter::new(
            request.repository_id,
            plan.batch_size,
            self.config.fallback_file_cap,
        );

        self.transition(RunState::Walking);
        self.reporter.progress(
            "Walking history",
            WALK_FLOOR as u8,
            0,
            total.map(|t| t as u64),
            format!("{} commits already stored", known.len()),
        );

        let history = walker
            .commits(max_commits, labels.as_ref())
            .map_err(ConnectorError::from)?;

        for item in history {
            if self.cancel.is_cancelled() {
                return Err(IngestError::Cancelled.into());
            }

            let info = item.map_err(ConnectorError::from)?;
            self.summary.commits_visited += 1;

            match known.get(&info.hash) {
                None => {
                    let pending = self.annotate(&info, request.repository_id, &mut resolver)?;
                    writer.push(pending);
                }
                Some(false) if info.branch.is_some() => {
                    writer.push_backfill(BranchBackfill {
                        sha: info.hash.clone(),
                        branch_name: info.branch.clone().unwrap_or_default(),
                    });
                }
                Some(_) => self.summary.commits_skipped += 1,
            }

            if writer.is_full() {
                self.flush(&mut writer, total)?;
            } else if self.summary.commits_visited % plan.progress_interval == 0 {
                self.report_walk(total);
            }
        }

        self.summary.contributors_created = resolver.created();

        self.transition(RunState::Finalizing);
        if !writer.is_empty() {
            self.flush(&mut writer, total)?;
        }
        self.store.mark_analyzed(request.repository_id, Utc::now())?;

        self.reporter.progress(
            "Finalizing",
            100,
            self.summary.commits_visited as u64,
            total.map(|t| t as u64),
            format!("Stored {} new commits", self.summary.commits_persisted),
        );
        Ok(())
    }

    fn annotate(
        &mut self,
        info: &CommitInfo,
        repository_id: i64,
        resolver: &mut ContributorResolver,
    ) -> Result<PendingCommit, SyncError> {
        if let Some(reason) = &info.stats_error {
            tracing::warn!(
                "{}",
                IngestError::CorruptCommitData {
                    sha: info.hash.clone(),
                    reason: reason.clone(),
                }
            );
            self.summary.stats_errors += 1;
        }

        let contributor_id = resolver
            .resolve(&mut *self.store, &info.author_name, &info.author_email)?
            .id;

        let files: Vec<PendingFile> = info
            .file_stats
            .iter()
            .map(|stat| PendingFile {
                path: stat.path.clone(),
                file_type: file_type(&stat.path),
                lines_added: stat.added,
                lines_deleted: stat.deleted,
                is_test_file: is_test_file(&stat.path),
            })
            .collect();

        Ok(PendingCommit {
            sha: info.hash.clone(),
            repository_id,
            contributor_id,
            message: info.message.trim().to_string(),
            committed_at: sanitize_timestamp(info.commit_time),
            author_name: info.author_name.clone(),
            author_email: info.author_email.clone(),
            files_changed: files.len() as u64,
            lines_added: info.lines_added(),
            lines_deleted: info.lines_deleted(),
            commit_type: classify_commit_type(&info.message),
            is_merge: info.is_merge(),
            branch_name: info.branch.clone(),
            files,
        })
    }

    // Progress is only reported after the batch is durable
    fn flush(&mut self, writer: &mut BatchWriter, total: Option<usize>) -> Result<(), SyncError> {
        let previous = self.state;
        self.transition(RunState::Batching);

        let outcome = writer.flush(&mut *self.store)?;
        self.summary.commits_persisted += outcome.persisted;
        self.summary.commits_skipped += outcome.skipped_duplicates;
        self.summary.branches_backfilled += outcome.backfilled;
        self.summary.truncated_commits += outcome.truncated;
        if outcome.degraded {
            self.summary.degraded_batches += 1;
        }

        self.report_walk(total);
        self.transition(previous);
        Ok(())
    }

    fn report_walk(&self, total: Option<usize>) {
        let visited = self.summary.commits_visited;
        let message = match total {
            Some(total) => format!(
                "Processed {}/{} commits ({} stored)",
                visited, total, self.summary.commits_persisted
            ),
            None => format!(
                "Processed {} commits ({} stored)",
                visited, self.summary.commits_persisted
            ),
        };
        self.reporter.progress(
            "Walking history",
            walk_percent(visited, total),
            visited as u64,
            total.map(|t| t as u64),
            message,
        );
    }

    fn transition(&mut self, next: RunState) {
        if self.state != next {
            tracing::debug!("Run {}: {:?} -> {:?}", self.reporter.run_id(), self.state, next);
            self.state = next;
        }
    }
}
