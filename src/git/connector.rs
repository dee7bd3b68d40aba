//! Clone and pull against remote repositories
//!
//! All operations are blocking and are meant to run on a blocking worker.
//! Progress flows through the [`TransferTracker`]; failures come back as a
//! [`ConnectorError`] from the closed taxonomy.

use super::transfer::TransferTracker;
use crate::config::ConnectorConfig;
use crate::error::ConnectorError;
use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{
    BranchType, Cred, CredentialType, ErrorClass, ErrorCode, FetchOptions, Oid, RemoteCallbacks,
    Repository, StatusOptions,
};
use std::path::{Path, PathBuf};

/// Result of a successful clone
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneOutcome {
    pub path: PathBuf,
    /// Checked-out commit, `None` for an empty remote
    pub head: Option<String>,
}

/// Result of a successful pull
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullOutcome {
    pub commits_pulled: usize,
    pub message: String,
    /// Branch tip after the pull
    pub head: String,
}

/// Check that a clone source looks like a git hosting URL
///
/// Accepts URLs that mention one of `allowed_hosts` or end in `.git`. No
/// network access happens here.
pub fn validate_source_url(url: &str, allowed_hosts: &[String]) -> Result<(), ConnectorError> {
    let invalid = |reason: &str| ConnectorError::InvalidSourceUrl {
        url: url.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(invalid("URL is empty"));
    }
    if trimmed.chars().any(char::is_whitespace) {
        return Err(invalid("URL contains whitespace"));
    }

    let lower = trimmed.to_lowercase();
    let known_host = allowed_hosts
        .iter()
        .any(|host| !host.is_empty() && lower.contains(&host.to_lowercase()));
    let vcs_suffix = lower.trim_end_matches('/').ends_with(".git");

    if known_host || vcs_suffix {
        Ok(())
    } else {
        Err(invalid(
            "URL doesn't appear to be a git repository (unknown host and no .git suffix)",
        ))
    }
}

/// Clone/pull driver configured from [`ConnectorConfig`]
#[derive(Debug, Clone)]
pub struct SourceConnector {
    allowed_hosts: Vec<String>,
    credential_attempts: u32,
}

impl SourceConnector {
    pub fn new(config: &ConnectorConfig) -> Self {
        Self {
            allowed_hosts: config.allowed_hosts.clone(),
            credential_attempts: config.credential_attempts,
        }
    }

    pub fn validate_url(&self, url: &str) -> Result<(), ConnectorError> {
        validate_source_url(url, &self.allowed_hosts)
    }

    /// Clone `url` into `dest`, replacing anything already there
    pub fn clone_repository(
        &self,
        url: &str,
        dest: &Path,
        tracker: &TransferTracker,
    ) -> Result<CloneOutcome, ConnectorError> {
        self.validate_url(url)?;
        if tracker.is_cancelled() {
            return Err(ConnectorError::Cancelled);
        }

        prepare_destination(dest)?;
        tracker.begin(format!("Cloning {}", url));
        tracing::info!("Cloning {} into {}", url, dest.display());

        let mut checkout = CheckoutBuilder::new();
        checkout.progress(|_, current, total| tracker.on_checkout(current, total));

        let result = RepoBuilder::new()
            .fetch_options(self.fetch_options(tracker))
            .with_checkout(checkout)
            .clone(url.trim(), dest);

        let repo = match result {
            Ok(repo) => repo,
            Err(e) => {
                let err = ConnectorError::from_git(e);
                tracing::warn!("Clone of {} failed: {}", url, err);
                // Leave no half-written checkout behind
                if let Err(io) = std::fs::remove_dir_all(dest) {
                    tracing::debug!("Could not remove {}: {}", dest.display(), io);
                }
                return Err(err);
            }
        };

        let head = repo
            .head()
            .ok()
            .and_then(|head| head.target())
            .map(|oid| oid.to_string());

        tracing::info!("Cloned {} into {}", url, dest.display());
        Ok(CloneOutcome {
            path: dest.to_path_buf(),
            head,
        })
    }

    /// Fetch the upstream of the checked-out branch and fast-forward to it
    pub fn pull(
        &self,
        path: &Path,
        tracker: &TransferTracker,
    ) -> Result<PullOutcome, ConnectorError> {
        if !path.exists() {
            return Err(ConnectorError::PathNotFound(path.display().to_string()));
        }

        let repo = Repository::open(path).map_err(|_| {
            ConnectorError::NotAVersionControlledDirectory(path.display().to_string())
        })?;
        if repo.is_bare() {
            return Err(ConnectorError::NotAVersionControlledDirectory(
                path.display().to_string(),
            ));
        }

        let head = repo.head().map_err(|e| {
            ConnectorError::Failure(format!("cannot resolve HEAD: {}", e.message()))
        })?;
        if !head.is_branch() {
            return Err(ConnectorError::Failure(
                "HEAD is detached; check out a branch before pulling".to_string(),
            ));
        }
        let branch_ref = head
            .name()
            .ok_or_else(|| ConnectorError::Failure("branch name is not valid UTF-8".to_string()))?
            .to_string();
        let branch_name = head.shorthand().unwrap_or(&branch_ref).to_string();
        let local_oid = head
            .target()
            .ok_or_else(|| ConnectorError::Failure(format!("branch '{}' has no target", branch_name)))?;

        let remote_name = remote_for(&repo, &branch_ref, path)?;
        ensure_clean(&repo, path)?;

        if tracker.is_cancelled() {
            return Err(ConnectorError::Cancelled);
        }

        tracker.begin(format!("Fetching {} from {}", branch_name, remote_name));
        tracing::info!("Fetching {} for {}", remote_name, path.display());
        {
            let mut remote = repo.find_remote(&remote_name)?;
            let mut options = self.fetch_options(tracker);
            remote.fetch(&[] as &[&str], Some(&mut options), None)?;
        }

        let upstream_oid = upstream_target(&repo, &branch_name, &remote_name)?;
        let incoming = count_incoming(&repo, local_oid, upstream_oid)?;

        if incoming == 0 {
            tracing::info!("{} is already up to date", path.display());
            return Ok(PullOutcome {
                commits_pulled: 0,
                message: "Already up to date".to_string(),
                head: local_oid.to_string(),
            });
        }

        if !repo.graph_descendant_of(upstream_oid, local_oid)? {
            return Err(ConnectorError::MergeConflict(format!(
                "branch '{}' has diverged from {}/{}; a fast-forward is not possible",
                branch_name, remote_name, branch_name
            )));
        }

        let target = repo.find_commit(upstream_oid)?;
        let mut checkout = CheckoutBuilder::new();
        checkout
            .safe()
            .progress(|_, current, total| tracker.on_checkout(current, total));
        repo.checkout_tree(target.as_object(), Some(&mut checkout))?;
        repo.find_reference(&branch_ref)?.set_target(
            upstream_oid,
            &format!("pull: fast-forward to {}", upstream_oid),
        )?;

        tracing::info!(
            "Fast-forwarded {} by {} commits to {}",
            branch_name,
            incoming,
            upstream_oid
        );
        Ok(PullOutcome {
            commits_pulled: incoming,
            message: format!("Pulled {} new commits", incoming),
            head: upstream_oid.to_string(),
        })
    }

    fn fetch_options<'a>(&self, tracker: &'a TransferTracker) -> FetchOptions<'a> {
        let mut callbacks = RemoteCallbacks::new();
        callbacks.transfer_progress(|stats| tracker.on_transfer(&stats));
        callbacks.sideband_progress(|data| tracker.on_sideband(data));

        let max_attempts = self.credential_attempts;
        let mut attempts = 0u32;
        callbacks.credentials(move |url, username, allowed| {
            attempts += 1;
            if attempts > max_attempts {
                return Err(git2::Error::new(
                    ErrorCode::Auth,
                    ErrorClass::Http,
                    format!("authentication failed after {} attempts", max_attempts),
                ));
            }
            credentials_for(url, username, allowed)
        });

        let mut options = FetchOptions::new();
        options.remote_callbacks(callbacks);
        options
    }
}

// Agent keys for SSH, the configured credential helper for HTTPS, then the
// platform default (Negotiate/NTLM)
fn credentials_for(
    url: &str,
    username: Option<&str>,
    allowed: CredentialType,
) -> Result<Cred, git2::Error> {
    if allowed.contains(CredentialType::SSH_KEY) {
        return Cred::ssh_key_from_agent(username.unwrap_or("git"));
    }

    if allowed.contains(CredentialType::USER_PASS_PLAINTEXT)
        && let Ok(config) = git2::Config::open_default()
        && let Ok(cred) = Cred::credential_helper(&config, url, username)
    {
        return Ok(cred);
    }

    if allowed.contains(CredentialType::DEFAULT) {
        return Cred::default();
    }

    Err(git2::Error::new(
        ErrorCode::Auth,
        ErrorClass::Http,
        format!("no usable credentials for {}", url),
    ))
}

fn prepare_destination(dest: &Path) -> Result<(), ConnectorError> {
    let io_failure = |action: &str, e: std::io::Error| {
        ConnectorError::Failure(format!("failed to {} {}: {}", action, dest.display(), e))
    };

    if dest.exists() {
        tracing::info!("Removing existing directory {}", dest.display());
        if dest.is_dir() {
            std::fs::remove_dir_all(dest).map_err(|e| io_failure("remove", e))?;
        } else {
            std::fs::remove_file(dest).map_err(|e| io_failure("remove", e))?;
        }
    }

    if let Some(parent) = dest.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| io_failure("create parent of", e))?;
    }
    Ok(())
}

// The branch's configured upstream remote, else "origin", else the first one
fn remote_for(repo: &Repository, branch_ref: &str, path: &Path) -> Result<String, ConnectorError> {
    if let Ok(buf) = repo.branch_upstream_remote(branch_ref)
        && let Some(name) = buf.as_str()
    {
        return Ok(name.to_string());
    }

    let remotes = repo.remotes()?;
    let names: Vec<&str> = remotes.iter().flatten().collect();
    if names.contains(&"origin") {
        return Ok("origin".to_string());
    }
    names
        .first()
        .map(|name| name.to_string())
        .ok_or_else(|| ConnectorError::NoRemoteConfigured(path.display().to_string()))
}

fn ensure_clean(repo: &Repository, path: &Path) -> Result<(), ConnectorError> {
    let mut options = StatusOptions::new();
    options
        .include_untracked(false)
        .include_ignored(false)
        .exclude_submodules(true);

    let modified = repo.statuses(Some(&mut options))?.len();
    if modified > 0 {
        return Err(ConnectorError::DirtyWorkingTree(format!(
            "{} modified paths in {}",
            modified,
            path.display()
        )));
    }
    Ok(())
}

fn upstream_target(
    repo: &Repository,
    branch_name: &str,
    remote_name: &str,
) -> Result<Oid, ConnectorError> {
    if let Ok(local) = repo.find_branch(branch_name, BranchType::Local)
        && let Ok(upstream) = local.upstream()
        && let Some(oid) = upstream.get().target()
    {
        return Ok(oid);
    }

    let tracking = format!("refs/remotes/{}/{}", remote_name, branch_name);
    repo.refname_to_id(&tracking).map_err(|_| {
        ConnectorError::Failure(format!(
            "no upstream branch for '{}' on remote '{}'",
            branch_name, remote_name
        ))
    })
}

// Commits reachable from the upstream tip but not from the local tip
fn count_incoming(repo: &Repository, local: Oid, upstream: Oid) -> Result<usize, ConnectorError> {
    if local == upstream {
        return Ok(0);
    }
    let mut revwalk = repo.revwalk()?;
    revwalk.push(upstream)?;
    revwalk.hide(local)?;
    Ok(revwalk.filter(|oid| oid.is_ok()).count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::test_support::TestRepo;
    use crate::git::transfer::ActivityClock;
    use crate::progress::{MemorySink, Operation, ProgressReporter, SyncEvent};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn hosts() -> Vec<String> {
        ConnectorConfig::default().allowed_hosts
    }

    fn tracker(operation: Operation) -> (TransferTracker, MemorySink) {
        let sink = MemorySink::new();
        let reporter = ProgressReporter::new(1, operation, Arc::new(sink.clone()));
        let tracker = TransferTracker::new(
            reporter,
            Arc::new(ActivityClock::new()),
            CancellationToken::new(),
        );
        (tracker, sink)
    }

    fn connector() -> SourceConnector {
        SourceConnector::new(&ConnectorConfig::default())
    }

    #[test]
    fn test_validate_source_url() {
        assert!(validate_source_url("https://github.com/user/repo", &hosts()).is_ok());
        assert!(validate_source_url("git@gitlab.com:team/app.git", &hosts()).is_ok());
        assert!(validate_source_url("https://git.example.org/app.git/", &hosts()).is_ok());
        assert!(validate_source_url("/srv/mirrors/app.git", &hosts()).is_ok());

        for bad in ["", "   ", "https://example.com/page", "not a url.git"] {
            assert!(
                matches!(
                    validate_source_url(bad, &hosts()),
                    Err(ConnectorError::InvalidSourceUrl { .. })
                ),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_clone_rejects_invalid_url_before_touching_disk() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("clone");
        let (tracker, sink) = tracker(Operation::Clone);

        let err = connector()
            .clone_repository("https://example.com/page", &dest, &tracker)
            .unwrap_err();
        assert!(matches!(err, ConnectorError::InvalidSourceUrl { .. }));
        assert!(!dest.exists());
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_clone_local_remote_replaces_destination() {
        let upstream = TestRepo::init_named("origin.git");
        let tip = upstream.commit(&[("README.md", "hi\n")], "init", 1_600_000_000);

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("work");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("stale.txt"), "old").unwrap();

        let (tracker, sink) = tracker(Operation::Clone);
        let outcome = connector()
            .clone_repository(upstream.url(), &dest, &tracker)
            .unwrap();

        assert_eq!(outcome.head, Some(tip.to_string()));
        assert!(dest.join("README.md").exists());
        assert!(!dest.join("stale.txt").exists());

        let percents: Vec<u8> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                SyncEvent::Progress { percent, .. } => Some(percent),
                _ => None,
            })
            .collect();
        assert_eq!(percents.first(), Some(&20));
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_clone_missing_remote_fails() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.git");
        let dest = dir.path().join("work");
        let (tracker, _sink) = tracker(Operation::Clone);

        let result =
            connector().clone_repository(missing.to_str().unwrap(), &dest, &tracker);
        assert!(result.is_err());
        assert!(!dest.exists());
    }

    #[test]
    fn test_pull_fast_forwards_new_commits() {
        let upstream = TestRepo::init_named("origin.git");
        upstream.commit(&[("a.txt", "a\n")], "init", 1_600_000_000);

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("work");
        let (clone_tracker, _) = tracker(Operation::Clone);
        connector()
            .clone_repository(upstream.url(), &dest, &clone_tracker)
            .unwrap();

        let (pull_tracker, _) = tracker(Operation::Pull);
        let unchanged = connector().pull(&dest, &pull_tracker).unwrap();
        assert_eq!(unchanged.commits_pulled, 0);
        assert_eq!(unchanged.message, "Already up to date");

        upstream.commit(&[("b.txt", "b\n")], "second", 1_600_000_100);
        let tip = upstream.commit(&[("c.txt", "c\n")], "third", 1_600_000_200);

        let (pull_tracker, _) = tracker(Operation::Pull);
        let outcome = connector().pull(&dest, &pull_tracker).unwrap();
        assert_eq!(outcome.commits_pulled, 2);
        assert_eq!(outcome.head, tip.to_string());
        assert!(dest.join("c.txt").exists());
    }

    #[test]
    fn test_pull_rejects_dirty_tree() {
        let upstream = TestRepo::init_named("origin.git");
        upstream.commit(&[("a.txt", "a\n")], "init", 1_600_000_000);

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("work");
        let (clone_tracker, _) = tracker(Operation::Clone);
        connector()
            .clone_repository(upstream.url(), &dest, &clone_tracker)
            .unwrap();
        std::fs::write(dest.join("a.txt"), "edited\n").unwrap();

        let (pull_tracker, _) = tracker(Operation::Pull);
        assert!(matches!(
            connector().pull(&dest, &pull_tracker),
            Err(ConnectorError::DirtyWorkingTree(_))
        ));
    }

    #[test]
    fn test_pull_reports_divergence_as_conflict() {
        let upstream = TestRepo::init_named("origin.git");
        upstream.commit(&[("a.txt", "a\n")], "init", 1_600_000_000);

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("work");
        let (clone_tracker, _) = tracker(Operation::Clone);
        connector()
            .clone_repository(upstream.url(), &dest, &clone_tracker)
            .unwrap();

        upstream.commit(&[("remote.txt", "r\n")], "remote", 1_600_000_100);
        TestRepo::open(&dest).commit(&[("local.txt", "l\n")], "local", 1_600_000_200);

        let (pull_tracker, _) = tracker(Operation::Pull);
        assert!(matches!(
            connector().pull(&dest, &pull_tracker),
            Err(ConnectorError::MergeConflict(_))
        ));
    }

    #[test]
    fn test_pull_error_taxonomy() {
        let (tracker, _) = tracker(Operation::Pull);
        assert!(matches!(
            connector().pull(Path::new("/nonexistent/commit-sync"), &tracker),
            Err(ConnectorError::PathNotFound(_))
        ));

        let plain = TempDir::new().unwrap();
        assert!(matches!(
            connector().pull(plain.path(), &tracker),
            Err(ConnectorError::NotAVersionControlledDirectory(_))
        ));

        let local_only = TestRepo::init();
        local_only.commit(&[("a.txt", "a\n")], "init", 1_600_000_000);
        assert!(matches!(
            connector().pull(local_only.path(), &tracker),
            Err(ConnectorError::NoRemoteConfigured(_))
        ));
    }
}
