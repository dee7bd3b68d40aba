//! Records exchanged between the ingestion engine and the relational store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default role assigned to newly seen contributors
pub const DEFAULT_ROLE: &str = "developer";
/// Default team and experience level for newly seen contributors
pub const DEFAULT_UNKNOWN: &str = "unknown";

/// A tracked repository, owned by the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    pub name: String,
    /// Local checkout location
    pub path: String,
    /// Remote URL, when the repository was cloned
    pub url: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set by the engine after every successful analyze run
    pub last_analyzed: Option<DateTime<Utc>>,
    pub is_active: bool,
}

/// Fields needed to register a repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRepository {
    pub name: String,
    pub path: String,
    pub url: Option<String>,
}

/// A unique author identity, keyed by email
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contributor {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub role: String,
    pub team: String,
    pub experience_level: String,
}

/// A contributor that has not been persisted yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewContributor {
    pub name: String,
    pub email: String,
    pub role: String,
    pub team: String,
    pub experience_level: String,
}

impl NewContributor {
    /// New contributor carrying the `developer`/`unknown` defaults
    pub fn with_defaults(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            role: DEFAULT_ROLE.to_string(),
            team: DEFAULT_UNKNOWN.to_string(),
            experience_level: DEFAULT_UNKNOWN.to_string(),
        }
    }
}

/// Commit classification derived from the commit message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitType {
    Test,
    Bugfix,
    Refactor,
    Documentation,
    Feature,
    Other,
}

impl CommitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitType::Test => "test",
            CommitType::Bugfix => "bugfix",
            CommitType::Refactor => "refactor",
            CommitType::Documentation => "documentation",
            CommitType::Feature => "feature",
            CommitType::Other => "other",
        }
    }

    /// Inverse of [`CommitType::as_str`]; unknown labels map to `Other`
    pub fn from_label(label: &str) -> Self {
        match label {
            "test" => CommitType::Test,
            "bugfix" => CommitType::Bugfix,
            "refactor" => CommitType::Refactor,
            "documentation" => CommitType::Documentation,
            "feature" => CommitType::Feature,
            _ => CommitType::Other,
        }
    }
}

impl fmt::Display for CommitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file touched by a commit, ready to be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFile {
    pub path: String,
    /// Final extension including the dot, empty when there is none
    pub file_type: String,
    pub lines_added: u64,
    pub lines_deleted: u64,
    pub is_test_file: bool,
}

/// A fully annotated commit waiting in the current batch
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCommit {
    pub sha: String,
    pub repository_id: i64,
    pub contributor_id: i64,
    pub message: String,
    pub committed_at: DateTime<Utc>,
    pub author_name: String,
    pub author_email: String,
    /// Number of files touched, kept even when `files` is truncated on write
    pub files_changed: u64,
    pub lines_added: u64,
    pub lines_deleted: u64,
    pub commit_type: CommitType,
    pub is_merge: bool,
    pub branch_name: Option<String>,
    pub files: Vec<PendingFile>,
}

/// A branch label to set on an already stored commit that has none
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchBackfill {
    pub sha: String,
    pub branch_name: String,
}

/// A commit row as read back from the store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredCommit {
    pub id: i64,
    pub sha: String,
    pub repository_id: i64,
    pub contributor_id: i64,
    pub message: String,
    pub committed_at: DateTime<Utc>,
    pub author_name: String,
    pub author_email: String,
    pub files_changed: u64,
    pub lines_added: u64,
    pub lines_deleted: u64,
    pub commit_type: CommitType,
    pub is_merge: bool,
    pub branch_name: Option<String>,
}

/// A commit file row as read back from the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredCommitFile {
    pub id: i64,
    pub commit_id: i64,
    pub file_path: String,
    pub file_type: String,
    pub lines_added: u64,
    pub lines_deleted: u64,
    pub is_test_file: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_type_labels_roundtrip() {
        for kind in [
            CommitType::Test,
            CommitType::Bugfix,
            CommitType::Refactor,
            CommitType::Documentation,
            CommitType::Feature,
            CommitType::Other,
        ] {
            assert_eq!(CommitType::from_label(kind.as_str()), kind);
        }
        assert_eq!(CommitType::from_label("chore"), CommitType::Other);
    }

    #[test]
    fn test_commit_type_serializes_lowercase() {
        let json = serde_json::to_string(&CommitType::Documentation).unwrap();
        assert_eq!(json, "\"documentation\"");
    }

    #[test]
    fn test_new_contributor_defaults() {
        let c = NewContributor::with_defaults("Ada", "ada@example.com");
        assert_eq!(c.role, "developer");
        assert_eq!(c.team, "unknown");
        assert_eq!(c.experience_level, "unknown");
    }
}
