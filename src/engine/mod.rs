//! Background run orchestration for clone, pull and analyze
//!
//! [`SyncEngine`] is the trigger surface: every `start_*` call returns a
//! [`RunHandle`] immediately and the work happens on a detached task. The
//! outcome is observable through the event sink (one `started`, monotonic
//! `progress`, exactly one `completed`) and, optionally, by awaiting the
//! handle.

/// Filesystem-based locking for cross-process coordination
pub mod fs_lock;
/// Per-repository run serialization
pub mod run_lock;

pub use run_lock::{RunLockGuard, RunLocks};

use crate::config::Config;
use crate::error::{ConnectorError, IngestError, SyncError, ValidationError};
use crate::git::{
    ActivityClock, CloneOutcome, IdleWatchdog, PullOutcome, SourceConnector, TransferTracker,
};
use crate::ingest::{AnalyzeRequest, AnalyzeSummary, IngestionCoordinator};
use crate::paths::PlatformPaths;
use crate::progress::{BroadcastSink, EventSink, Operation, ProgressReporter, RunId, SyncEvent};
use crate::store::{SqliteSession, SqliteStore, StoreProvider};
use crate::types::{NewRepository, Repository};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Handle to one background run
///
/// Dropping the handle detaches the run; it still completes and still
/// emits its terminal event.
#[derive(Debug)]
pub struct RunHandle<T> {
    run_id: RunId,
    operation: Operation,
    cancel: CancellationToken,
    join: JoinHandle<Result<T, SyncError>>,
}

impl<T> RunHandle<T> {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Ask the run to stop at its next checkpoint
    ///
    /// Batches that were already committed stay in the store.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the run to end
    pub async fn wait(self) -> Result<T, SyncError> {
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(IngestError::WorkerFailed(e.to_string()).into()),
        }
    }
}

/// What a full sync did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    /// Head of the fresh checkout when the repository had to be cloned
    pub cloned_head: Option<String>,
    /// Commits fast-forwarded by the pull step
    pub commits_pulled: Option<usize>,
    pub analysis: AnalyzeSummary,
}

/// Everything a blocking run body needs
pub struct RunContext<P> {
    pub reporter: ProgressReporter,
    pub cancel: CancellationToken,
    pub config: Arc<Config>,
    pub provider: Arc<P>,
    activity: Arc<ActivityClock>,
}

impl<P> RunContext<P> {
    /// Tracker feeding transfer callbacks into this run's reporter
    pub fn tracker(&self) -> TransferTracker {
        TransferTracker::new(
            self.reporter.clone(),
            self.activity.clone(),
            self.cancel.clone(),
        )
    }
}

/// The synchronization engine
///
/// Runs against different repositories proceed in parallel up to
/// `runtime.max_concurrent_runs`; runs against the same repository are
/// serialized.
pub struct SyncEngine<P: StoreProvider = SqliteStore> {
    config: Arc<Config>,
    provider: Arc<P>,
    sink: Arc<dyn EventSink>,
    broadcast: Option<BroadcastSink>,
    connector: SourceConnector,
    runs: Arc<Semaphore>,
    locks: RunLocks,
    next_run_id: Arc<AtomicU64>,
}

impl<P: StoreProvider> Clone for SyncEngine<P> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            provider: self.provider.clone(),
            sink: self.sink.clone(),
            broadcast: self.broadcast.clone(),
            connector: self.connector.clone(),
            runs: self.runs.clone(),
            locks: self.locks.clone(),
            next_run_id: self.next_run_id.clone(),
        }
    }
}

impl SyncEngine<SqliteStore> {
    /// Engine with configuration from the default file and environment
    pub fn new() -> Result<Self, SyncError> {
        Self::with_config(Config::new()?)
    }

    /// Engine backed by the configured SQLite database, publishing events
    /// on a broadcast channel (see [`SyncEngine::subscribe`])
    pub fn with_config(config: Config) -> Result<Self, SyncError> {
        config.validate()?;
        tracing::info!(
            "Initializing sync engine with database {}",
            config.store.database_path.display()
        );

        let store = SqliteStore::from_config(&config.store);
        store.initialize()?;

        let sink = BroadcastSink::new(config.runtime.event_capacity);
        let mut engine = Self::with_provider(config, store, Arc::new(sink.clone()));
        engine.broadcast = Some(sink);
        Ok(engine)
    }

    /// Register a repository the engine can later sync
    ///
    /// A repository given only by URL gets a checkout under the clone root.
    pub async fn register_repository(
        &self,
        name: &str,
        path: Option<PathBuf>,
        url: Option<String>,
    ) -> Result<Repository, SyncError> {
        if name.trim().is_empty() {
            return Err(ValidationError::Empty("repository name".to_string()).into());
        }
        if let Some(url) = &url {
            self.connector.validate_url(url)?;
        }
        let path = match (path, &url) {
            (Some(path), _) => PlatformPaths::absolute(&path),
            (None, Some(_)) => self.clone_destination(name),
            (None, None) => {
                return Err(ValidationError::InvalidValue(
                    "repository".to_string(),
                    "either a path or a URL is required".to_string(),
                )
                .into());
            }
        };

        let new = NewRepository {
            name: name.trim().to_string(),
            path: path.to_string_lossy().into_owned(),
            url,
        };
        self.with_session(move |session| Ok(session.insert_repository(&new)?))
            .await
    }

    pub async fn get_repository(&self, id: i64) -> Result<Repository, SyncError> {
        self.with_session(move |session| {
            session
                .get_repository(id)?
                .ok_or_else(|| ValidationError::RepositoryNotFound(id).into())
        })
        .await
    }

    /// Active repositories in registration order
    pub async fn list_repositories(&self) -> Result<Vec<Repository>, SyncError> {
        self.with_session(|session| Ok(session.list_repositories()?))
            .await
    }

    /// Sync a registered repository by id
    pub async fn sync_repository(
        &self,
        id: i64,
        max_commits: Option<usize>,
    ) -> Result<SyncOutcome, SyncError> {
        let repository = self.get_repository(id).await?;
        self.sync(&repository, max_commits).await
    }

    async fn with_session<T, F>(&self, f: F) -> Result<T, SyncError>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteSession) -> Result<T, SyncError> + Send + 'static,
    {
        let provider = self.provider.clone();
        tokio::task::spawn_blocking(move || {
            let mut session = provider.open_session()?;
            f(&mut session)
        })
        .await
        .map_err(|e| IngestError::WorkerFailed(e.to_string()))?
    }
}

impl<P: StoreProvider> SyncEngine<P> {
    /// Engine over any store provider and event sink
    pub fn with_provider(config: Config, provider: P, sink: Arc<dyn EventSink>) -> Self {
        let permits = config.runtime.max_concurrent_runs.max(1);
        Self {
            connector: SourceConnector::new(&config.connector),
            locks: RunLocks::new(config.runtime.lock_dir.clone()),
            runs: Arc::new(Semaphore::new(permits)),
            config: Arc::new(config),
            provider: Arc::new(provider),
            sink,
            broadcast: None,
            next_run_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Receive every event published after this call
    ///
    /// `None` when the engine publishes to a caller-supplied sink.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<SyncEvent>> {
        self.broadcast.as_ref().map(BroadcastSink::subscribe)
    }

    /// Checkout location for a repository cloned by name
    pub fn clone_destination(&self, name: &str) -> PathBuf {
        let safe: String = name
            .trim()
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        PlatformPaths::absolute(&self.config.connector.clone_root.join(safe))
    }

    /// Clone `url` into `dest` on a background worker
    ///
    /// The URL is validated before anything starts; an invalid URL returns an
    /// error here and emits no events.
    pub fn start_clone(
        &self,
        url: &str,
        dest: &Path,
    ) -> Result<RunHandle<CloneOutcome>, SyncError> {
        self.connector.validate_url(url)?;

        let url = url.trim().to_string();
        let dest = PlatformPaths::absolute(dest);
        let connector = self.connector.clone();
        let context = format!("Cloning {} into {}", url, dest.display());

        Ok(self.launch(Operation::Clone, context, dest.clone(), move |ctx| {
            let outcome = connector.clone_repository(&url, &dest, &ctx.tracker())?;
            ctx.reporter.completed(
                true,
                format!("Cloned {} into {}", url, dest.display()),
                None,
                0,
            );
            Ok(outcome)
        }))
    }

    /// Fast-forward the checkout at `path` on a background worker
    pub fn start_pull(&self, path: &Path) -> RunHandle<PullOutcome> {
        let path = PlatformPaths::absolute(path);
        let connector = self.connector.clone();
        let context = format!("Pulling {}", path.display());

        self.launch(Operation::Pull, context, path.clone(), move |ctx| {
            let outcome = connector.pull(&path, &ctx.tracker())?;
            ctx.reporter.completed(
                true,
                outcome.message.clone(),
                None,
                outcome.commits_pulled as u64,
            );
            Ok(outcome)
        })
    }

    /// Pull and wait for the result
    pub async fn pull(&self, path: &Path) -> Result<PullOutcome, SyncError> {
        self.start_pull(path).wait().await
    }

    /// Ingest the history of the checkout at `path` on a background worker
    pub fn start_analyze(
        &self,
        repository_id: i64,
        path: &Path,
        max_commits: Option<usize>,
    ) -> RunHandle<AnalyzeSummary> {
        let request = AnalyzeRequest {
            repository_id,
            path: PlatformPaths::absolute(path),
            max_commits,
        };
        let context = format!(
            "Analyzing repository {} at {}",
            repository_id,
            request.path.display()
        );

        self.launch(Operation::Analyze, context, request.path.clone(), move |ctx| {
            let mut session = ctx.provider.open_session()?;
            let mut coordinator = IngestionCoordinator::new(
                &mut session,
                &ctx.config.ingestion,
                ctx.reporter.clone(),
                ctx.cancel.clone(),
            );
            coordinator.run(&request)
        })
    }

    /// Bring a repository up to date and analyze it
    ///
    /// Clones when the location is not yet a checkout and a URL is known,
    /// pulls when it is a checkout with a remote, then analyzes. A failed
    /// pull is logged and the local history is analyzed anyway.
    pub async fn sync(
        &self,
        repository: &Repository,
        max_commits: Option<usize>,
    ) -> Result<SyncOutcome, SyncError> {
        let path = PathBuf::from(&repository.path);
        let mut outcome = SyncOutcome::default();

        match (checkout_state(&path), repository.url.as_deref()) {
            (CheckoutState::Missing, Some(url)) => {
                tracing::info!("{} has no checkout yet, cloning", repository.name);
                let cloned = self.start_clone(url, &path)?.wait().await?;
                outcome.cloned_head = cloned.head;
            }
            (CheckoutState::Missing, None) => {
                return Err(ConnectorError::NotAVersionControlledDirectory(
                    path.display().to_string(),
                )
                .into());
            }
            (CheckoutState::Local, _) => {
                tracing::debug!("{} has no remote, skipping pull", repository.name);
            }
            (CheckoutState::Tracked, _) => match self.pull(&path).await {
                Ok(pulled) => outcome.commits_pulled = Some(pulled.commits_pulled),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => tracing::warn!(
                    "Pull of {} failed, analyzing local history: {}",
                    repository.name,
                    e
                ),
            },
        }

        outcome.analysis = self
            .start_analyze(repository.id, &path, max_commits)
            .wait()
            .await?;
        Ok(outcome)
    }

    fn next_run_id(&self) -> RunId {
        self.next_run_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Spawn one run: `started` is published before this returns, the body
    /// runs on a blocking worker once a run slot and the repository lock are
    /// held, and a failure always ends in a terminal event
    fn launch<T, F>(
        &self,
        operation: Operation,
        context: String,
        lock_path: PathBuf,
        work: F,
    ) -> RunHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(RunContext<P>) -> Result<T, SyncError> + Send + 'static,
    {
        let run_id = self.next_run_id();
        let cancel = CancellationToken::new();
        let reporter = ProgressReporter::new(run_id, operation, self.sink.clone());
        reporter.started(context);

        let engine = self.clone();
        let token = cancel.clone();
        let join = tokio::spawn(async move {
            let result = engine
                .drive(operation, &lock_path, reporter.clone(), token, work)
                .await;
            if let Err(err) = &result {
                // No-op when the body already published its terminal event
                let verb = match operation {
                    Operation::Clone => "Clone",
                    Operation::Pull => "Pull",
                    Operation::Analyze => "Analysis",
                };
                let state = if err.is_cancelled() {
                    "cancelled"
                } else {
                    "failed"
                };
                tracing::error!("Run {} ({:?}) {}: {}", reporter.run_id(), operation, state, err);
                reporter.completed(
                    false,
                    format!("{} {}", verb, state),
                    Some(err.to_user_string()),
                    0,
                );
            }
            result
        });

        RunHandle {
            run_id,
            operation,
            cancel,
            join,
        }
    }

    async fn drive<T, F>(
        &self,
        operation: Operation,
        lock_path: &Path,
        reporter: ProgressReporter,
        cancel: CancellationToken,
        work: F,
    ) -> Result<T, SyncError>
    where
        T: Send + 'static,
        F: FnOnce(RunContext<P>) -> Result<T, SyncError> + Send + 'static,
    {
        let cancelled = || -> SyncError {
            match operation {
                Operation::Analyze => IngestError::Cancelled.into(),
                Operation::Clone | Operation::Pull => ConnectorError::Cancelled.into(),
            }
        };

        let _permit = tokio::select! {
            permit = self.runs.clone().acquire_owned() => {
                permit.map_err(|e| IngestError::WorkerFailed(e.to_string()))?
            }
            _ = cancel.cancelled() => return Err(cancelled()),
        };
        let _lock = tokio::select! {
            guard = self.locks.acquire(lock_path, self.config.runtime.lock_timeout()) => guard?,
            _ = cancel.cancelled() => return Err(cancelled()),
        };

        let activity = Arc::new(ActivityClock::new());
        let watchdog = matches!(operation, Operation::Clone | Operation::Pull).then(|| {
            IdleWatchdog::spawn(
                reporter.clone(),
                activity.clone(),
                self.config.connector.idle_timeout(),
            )
        });

        let ctx = RunContext {
            reporter,
            cancel,
            config: self.config.clone(),
            provider: self.provider.clone(),
            activity,
        };
        let result = tokio::task::spawn_blocking(move || work(ctx))
            .await
            .map_err(|e| IngestError::WorkerFailed(e.to_string()))?;

        drop(watchdog);
        result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckoutState {
    Missing,
    /// A working checkout without any remote
    Local,
    Tracked,
}

fn checkout_state(path: &Path) -> CheckoutState {
    match git2::Repository::open(path) {
        Ok(repo) if !repo.is_bare() => match repo.remotes() {
            Ok(remotes) if !remotes.is_empty() => CheckoutState::Tracked,
            _ => CheckoutState::Local,
        },
        _ => CheckoutState::Missing,
    }
}

#[cfg(test)]
mod tests;
