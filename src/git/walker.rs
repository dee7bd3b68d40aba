use crate::error::ConnectorError;
use git2::{BranchType, Commit, DiffFindOptions, DiffOptions, Oid, Patch, Repository, Revwalk, Sort};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Per-file change statistics of a commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    /// Path after the change (the old path for deletions)
    pub path: String,
    pub added: u64,
    pub deleted: u64,
}

/// Information about a git commit
#[derive(Debug, Clone)]
pub struct CommitInfo {
    /// Full commit SHA hash (40 characters)
    pub hash: String,
    /// Number of parents; more than one marks a merge
    pub parent_count: usize,
    /// Author's name
    pub author_name: String,
    /// Author's email address
    pub author_email: String,
    /// Raw commit message
    pub message: String,
    /// Commit timestamp (Unix epoch seconds, unsanitized)
    pub commit_time: i64,
    /// Changes against the first parent (or the empty tree for root commits)
    pub file_stats: Vec<FileStat>,
    /// Set when the diff could not be computed; `file_stats` is then empty
    pub stats_error: Option<String>,
    /// Highest-priority branch whose first-parent chain contains this commit
    pub branch: Option<String>,
}

impl CommitInfo {
    pub fn is_merge(&self) -> bool {
        self.parent_count > 1
    }

    pub fn lines_added(&self) -> u64 {
        self.file_stats.iter().map(|f| f.added).sum()
    }

    pub fn lines_deleted(&self) -> u64 {
        self.file_stats.iter().map(|f| f.deleted).sum()
    }
}

/// Branch label of every commit on some branch's first-parent chain
#[derive(Debug, Default)]
pub struct BranchLabels {
    names: Vec<String>,
    by_commit: HashMap<Oid, usize>,
}

impl BranchLabels {
    pub fn get(&self, oid: &Oid) -> Option<&str> {
        self.by_commit.get(oid).map(|idx| self.names[*idx].as_str())
    }

    pub fn len(&self) -> usize {
        self.by_commit.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_commit.is_empty()
    }

    /// Branch names in priority order
    pub fn branches(&self) -> &[String] {
        &self.names
    }
}

/// Git repository walker for extracting commit information
pub struct GitWalker {
    repo: Repository,
    repo_path: PathBuf,
}

impl GitWalker {
    /// Open the working copy rooted at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ConnectorError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConnectorError::PathNotFound(path.display().to_string()));
        }

        let repo = Repository::open(path).map_err(|e| {
            tracing::debug!("Failed to open {}: {}", path.display(), e.message());
            ConnectorError::NotAVersionControlledDirectory(path.display().to_string())
        })?;

        tracing::info!("Opened git repository at: {}", path.display());

        Ok(Self {
            repo,
            repo_path: path.to_path_buf(),
        })
    }

    /// Get the repository root path
    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Get the current branch name, or None if detached HEAD
    pub fn current_branch(&self) -> Option<String> {
        let head = self.repo.head().ok()?;
        if !head.is_branch() {
            return None;
        }
        head.shorthand().map(|s| s.to_string())
    }

    /// Check if repository has any commits
    pub fn has_commits(&self) -> bool {
        self.repo.head().is_ok()
    }

    /// Approximate number of commits reachable from any branch
    ///
    /// Asks the `git` binary first; without it the history is walked once,
    /// stopping at `cap`. Returns `None` when neither works. The value only
    /// drives progress percentages.
    pub fn estimate_commit_count(&self, cap: usize) -> Option<usize> {
        if let Some(count) = self.native_commit_count() {
            return Some(count);
        }

        match self.capped_commit_count(cap) {
            Ok(count) => Some(count),
            Err(e) => {
                tracing::warn!("Commit count unavailable: {}", e.message());
                None
            }
        }
    }

    fn native_commit_count(&self) -> Option<usize> {
        let output = Command::new("git")
            .args(["rev-list", "--all", "--count"])
            .current_dir(&self.repo_path)
            .output()
            .ok()?;

        if !output.status.success() {
            return None;
        }
        String::from_utf8(output.stdout).ok()?.trim().parse().ok()
    }

    fn capped_commit_count(&self, cap: usize) -> Result<usize, git2::Error> {
        let revwalk = self.all_branches_walk()?;
        Ok(revwalk.take(cap).take_while(Result::is_ok).count())
    }

    /// Label commits with the branch whose first-parent chain reaches them
    ///
    /// Branches are visited in priority order (checked-out branch, local
    /// branches, remote-tracking branches); a commit keeps the first label
    /// it receives.
    pub fn branch_labels(&self) -> Result<BranchLabels, git2::Error> {
        let mut tips: Vec<(String, Oid)> = Vec::new();
        let head_branch = self.current_branch();

        if let Some(name) = &head_branch
            && let Some(oid) = self.repo.head()?.target()
        {
            tips.push((name.clone(), oid));
        }

        for kind in [BranchType::Local, BranchType::Remote] {
            let mut branches = Vec::new();
            for branch in self.repo.branches(Some(kind))? {
                let (branch, _) = branch?;
                let Some(name) = branch.name()?.map(str::to_string) else {
                    continue;
                };
                if head_branch.as_deref() == Some(name.as_str()) || name.ends_with("/HEAD") {
                    continue;
                }
                if let Some(oid) = branch.get().target() {
                    branches.push((name, oid));
                }
            }
            branches.sort();
            tips.extend(branches);
        }

        let mut labels = BranchLabels::default();
        for (name, tip) in tips {
            let idx = labels.names.len();
            labels.names.push(name);

            let mut oid = tip;
            while !labels.by_commit.contains_key(&oid) {
                labels.by_commit.insert(oid, idx);
                let commit = match self.repo.find_commit(oid) {
                    Ok(commit) => commit,
                    Err(e) => {
                        tracing::warn!("Stopping branch chain at unreadable commit {}: {}", oid, e);
                        break;
                    }
                };
                match commit.parent_id(0) {
                    Ok(parent) => oid = parent,
                    Err(_) => break,
                }
            }
        }

        tracing::debug!(
            "Labelled {} commits across {} branches",
            labels.len(),
            labels.names.len()
        );
        Ok(labels)
    }

    /// Stream commits from all branches, newest first
    pub fn commits<'a>(
        &'a self,
        max_count: Option<usize>,
        labels: Option<&'a BranchLabels>,
    ) -> Result<HistoryIter<'a>, git2::Error> {
        Ok(HistoryIter {
            walker: self,
            source: WalkSource::Sorted(self.all_branches_walk()?),
            yielded: HashSet::new(),
            labels,
            remaining: max_count.unwrap_or(usize::MAX),
        })
    }

    /// Branch, remote-tracking and detached-HEAD tips
    fn walk_tips(&self) -> Result<Vec<Oid>, git2::Error> {
        let mut tips = Vec::new();
        for glob in ["refs/heads/*", "refs/remotes/*"] {
            for reference in self.repo.references_glob(glob)? {
                // Symbolic refs such as origin/HEAD repeat another tip
                if let Some(oid) = reference?.target() {
                    tips.push(oid);
                }
            }
        }
        if self.repo.head_detached().unwrap_or(false)
            && let Some(oid) = self.repo.head()?.target()
        {
            tips.push(oid);
        }
        Ok(tips)
    }

    /// Every readable commit reachable from the tips, newest first
    ///
    /// Unreadable commits are skipped along with the ancestry that is only
    /// reachable through them. Commits in `exclude` are left out.
    fn tolerant_walk(&self, exclude: &HashSet<Oid>) -> Result<Vec<Oid>, git2::Error> {
        let mut pending = self.walk_tips()?;
        let mut seen = HashSet::new();
        let mut found: Vec<(i64, Oid)> = Vec::new();

        while let Some(oid) = pending.pop() {
            if !seen.insert(oid) {
                continue;
            }
            match self.repo.find_commit(oid) {
                Ok(commit) => {
                    pending.extend(commit.parent_ids());
                    if !exclude.contains(&oid) {
                        found.push((commit.time().seconds(), oid));
                    }
                }
                Err(e) => {
                    tracing::warn!("Skipping unreadable commit {}: {}", oid, e.message());
                }
            }
        }

        found.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(found.into_iter().map(|(_, oid)| oid).collect())
    }

    fn all_branches_walk(&self) -> Result<Revwalk<'_>, git2::Error> {
        let mut revwalk = self.repo.revwalk()?;
        revwalk.set_sorting(Sort::TIME)?;
        revwalk.push_glob("refs/heads/*")?;
        revwalk.push_glob("refs/remotes/*")?;
        // Detached HEAD is not covered by the globs; an unborn HEAD has nothing to add
        if self.repo.head_detached().unwrap_or(false) {
            revwalk.push_head()?;
        }
        Ok(revwalk)
    }

    /// Extract detailed information from a commit
    fn extract_commit_info(&self, commit: &Commit<'_>, labels: Option<&BranchLabels>) -> CommitInfo {
        let author = commit.author();
        let (file_stats, stats_error) = match self.file_stats(commit) {
            Ok(stats) => (stats, None),
            Err(e) => {
                tracing::warn!(
                    "Recording commit {} without file statistics: {}",
                    commit.id(),
                    e.message()
                );
                (Vec::new(), Some(e.message().to_string()))
            }
        };

        CommitInfo {
            hash: commit.id().to_string(),
            parent_count: commit.parent_count(),
            author_name: String::from_utf8_lossy(author.name_bytes()).into_owned(),
            author_email: String::from_utf8_lossy(author.email_bytes()).into_owned(),
            message: String::from_utf8_lossy(commit.message_bytes()).into_owned(),
            commit_time: commit.time().seconds(),
            file_stats,
            stats_error,
            branch: labels.and_then(|l| l.get(&commit.id())).map(str::to_string),
        }
    }

    /// Added/deleted line counts per path against the first parent
    fn file_stats(&self, commit: &Commit<'_>) -> Result<Vec<FileStat>, git2::Error> {
        let tree = commit.tree()?;
        let parent_tree = if commit.parent_count() > 0 {
            Some(commit.parent(0)?.tree()?)
        } else {
            None
        };

        let mut diff_opts = DiffOptions::new();
        diff_opts.context_lines(0).ignore_whitespace(false);

        let mut diff =
            self.repo
                .diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), Some(&mut diff_opts))?;
        diff.find_similar(Some(DiffFindOptions::new().renames(true)))?;

        let mut stats = Vec::with_capacity(diff.deltas().len());
        for (idx, delta) in diff.deltas().enumerate() {
            let Some(path) = delta.new_file().path().or_else(|| delta.old_file().path()) else {
                continue;
            };

            // Binary files have no line statistics
            let (added, deleted) = match Patch::from_diff(&diff, idx)? {
                Some(patch) => {
                    let (_, added, deleted) = patch.line_stats()?;
                    (added as u64, deleted as u64)
                }
                None => (0, 0),
            };

            stats.push(FileStat {
                path: path.to_string_lossy().replace('\\', "/"),
                added,
                deleted,
            });
        }

        Ok(stats)
    }
}

enum WalkSource<'a> {
    Sorted(Revwalk<'a>),
    Recovered(std::vec::IntoIter<Oid>),
}

/// Lazy, newest-first stream of commits
///
/// A failing revwalk (a missing or corrupt commit object) does not end the
/// stream: the walk is rebuilt from the branch tips, skipping whatever cannot
/// be read, and continues with the commits not yet yielded.
pub struct HistoryIter<'a> {
    walker: &'a GitWalker,
    source: WalkSource<'a>,
    yielded: HashSet<Oid>,
    labels: Option<&'a BranchLabels>,
    remaining: usize,
}

impl HistoryIter<'_> {
    fn next_oid(&mut self) -> Option<Result<Oid, git2::Error>> {
        loop {
            match &mut self.source {
                WalkSource::Recovered(oids) => return oids.next().map(Ok),
                WalkSource::Sorted(revwalk) => match revwalk.next()? {
                    Ok(oid) => return Some(Ok(oid)),
                    Err(e) => {
                        tracing::warn!(
                            "History walk failed ({}), continuing with readable commits",
                            e.message()
                        );
                        match self.walker.tolerant_walk(&self.yielded) {
                            Ok(oids) => self.source = WalkSource::Recovered(oids.into_iter()),
                            Err(rebuild) => {
                                tracing::warn!("Could not rebuild history walk: {}", rebuild);
                                return Some(Err(e));
                            }
                        }
                    }
                },
            }
        }
    }
}

impl Iterator for HistoryIter<'_> {
    type Item = Result<CommitInfo, git2::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.remaining > 0 {
            let oid = match self.next_oid()? {
                Ok(oid) => oid,
                Err(e) => return Some(Err(e)),
            };

            let commit = match self.walker.repo.find_commit(oid) {
                Ok(commit) => commit,
                Err(e) => {
                    tracing::warn!("Skipping unreadable commit {}: {}", oid, e.message());
                    continue;
                }
            };

            self.yielded.insert(oid);
            self.remaining -= 1;
            return Some(Ok(self.walker.extract_commit_info(&commit, self.labels)));
        }
        None
    }
}
