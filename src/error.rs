/// Centralized error types for commit-sync using thiserror
///
/// Connector failures are translated into a small closed taxonomy so that
/// observers always see a recognizable cause instead of a raw libgit2 message.
use git2::{ErrorClass, ErrorCode};
use thiserror::Error;

/// Main error type for the synchronization engine
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Connector error: {0}")]
    Connector(#[from] ConnectorError),

    #[error("Ingestion error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Failures of clone/pull against a remote or a local checkout
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    #[error("Invalid source URL '{url}': {reason}")]
    InvalidSourceUrl { url: String, reason: String },

    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Not a git working directory: {0}")]
    NotAVersionControlledDirectory(String),

    #[error("No remote configured for repository at {0}")]
    NoRemoteConfigured(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailure(String),

    #[error("Network failure: {0}")]
    NetworkFailure(String),

    #[error("Merge conflict: {0}")]
    MergeConflict(String),

    #[error("Working tree has uncommitted changes: {0}")]
    DirtyWorkingTree(String),

    #[error("Git operation failed: {0}")]
    Failure(String),

    #[error("Operation was cancelled")]
    Cancelled,
}

/// Errors raised while walking history and writing batches
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Corrupt data for commit {sha}: {reason}")]
    CorruptCommitData { sha: String, reason: String },

    #[error("Failed to persist {failed} of {attempted} commits: {reason}")]
    BatchWriteFailure {
        attempted: usize,
        failed: usize,
        reason: String,
    },

    #[error("Another synchronization run holds the lock for {0}")]
    RunInProgress(String),

    #[error("Ingestion was cancelled")]
    Cancelled,

    #[error("Background worker failed: {0}")]
    WorkerFailed(String),
}

/// Errors from the relational store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to open database '{path}': {reason}")]
    OpenFailed { path: String, reason: String },

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Database query failed: {0}")]
    Query(String),
}

/// Errors related to configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration file: {0}")]
    LoadFailed(String),

    #[error("Failed to parse configuration: {0}")]
    ParseFailed(String),

    #[error("Invalid configuration value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Failed to save configuration: {0}")]
    SaveFailed(String),

    #[error("Configuration file not found: {0}")]
    FileNotFound(String),
}

/// Errors related to input validation
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Repository not found: {0}")]
    RepositoryNotFound(i64),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("Empty {0}")]
    Empty(String),
}

impl ConnectorError {
    /// Translate a libgit2 error into the connector taxonomy
    pub fn from_git(err: git2::Error) -> Self {
        let message = err.message().to_string();
        let lower = message.to_lowercase();

        match (err.code(), err.class()) {
            (ErrorCode::Auth, _) => ConnectorError::AuthenticationFailure(message),
            (ErrorCode::User, _) => ConnectorError::Cancelled,
            (ErrorCode::Certificate, _) => ConnectorError::NetworkFailure(message),
            (ErrorCode::MergeConflict | ErrorCode::Conflict, _) => {
                ConnectorError::MergeConflict(message)
            }
            (ErrorCode::Uncommitted | ErrorCode::IndexDirty, _) => {
                ConnectorError::DirtyWorkingTree(message)
            }
            (ErrorCode::NotFastForward, _) => ConnectorError::MergeConflict(message),
            (_, ErrorClass::Net | ErrorClass::Http | ErrorClass::Ssl | ErrorClass::Ssh)
                if lower.contains("auth") || lower.contains("401") || lower.contains("403") =>
            {
                ConnectorError::AuthenticationFailure(message)
            }
            (_, ErrorClass::Net | ErrorClass::Http | ErrorClass::Ssl | ErrorClass::Ssh) => {
                ConnectorError::NetworkFailure(message)
            }
            (ErrorCode::NotFound, ErrorClass::Repository) => {
                ConnectorError::NotAVersionControlledDirectory(message)
            }
            _ => ConnectorError::Failure(message),
        }
    }
}

impl From<git2::Error> for ConnectorError {
    fn from(err: git2::Error) -> Self {
        ConnectorError::from_git(err)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _)
                if code.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || code.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
            {
                StoreError::Duplicate(err.to_string())
            }
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(err.to_string()),
            _ => StoreError::Query(err.to_string()),
        }
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        SyncError::Store(err.into())
    }
}

impl From<git2::Error> for SyncError {
    fn from(err: git2::Error) -> Self {
        SyncError::Connector(err.into())
    }
}

// Conversion from anyhow::Error to SyncError
impl From<anyhow::Error> for SyncError {
    fn from(err: anyhow::Error) -> Self {
        SyncError::Other(format!("{:#}", err))
    }
}

impl SyncError {
    /// Create a new error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        SyncError::Other(msg.into())
    }

    /// Convert to a user-facing error string suitable for terminal events
    pub fn to_user_string(&self) -> String {
        match self {
            SyncError::Connector(err) => err.to_string(),
            SyncError::Ingest(err) => err.to_string(),
            other => other.to_string(),
        }
    }

    /// Check if this is a user error (bad input) vs system error
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            SyncError::Validation(_)
                | SyncError::Config(ConfigError::InvalidValue { .. })
                | SyncError::Connector(
                    ConnectorError::InvalidSourceUrl { .. }
                        | ConnectorError::PathNotFound(_)
                        | ConnectorError::NotAVersionControlledDirectory(_)
                        | ConnectorError::NoRemoteConfigured(_)
                        | ConnectorError::DirtyWorkingTree(_)
                )
        )
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Connector(ConnectorError::NetworkFailure(_))
                | SyncError::Ingest(IngestError::RunInProgress(_))
                | SyncError::Io(_)
        )
    }

    /// True when the run stopped because it was cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            SyncError::Connector(ConnectorError::Cancelled)
                | SyncError::Ingest(IngestError::Cancelled)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::Connector(ConnectorError::PathNotFound("/repo".to_string()));
        assert_eq!(err.to_string(), "Connector error: Path not found: /repo");
    }

    #[test]
    fn test_user_string_drops_layer_prefix() {
        let err = SyncError::Connector(ConnectorError::NoRemoteConfigured("/repo".to_string()));
        assert_eq!(
            err.to_user_string(),
            "No remote configured for repository at /repo"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: SyncError = io_err.into();
        assert!(matches!(err, SyncError::Io(_)));
    }

    #[test]
    fn test_error_from_anyhow() {
        let err: SyncError = anyhow::anyhow!("test error").into();
        assert!(matches!(err, SyncError::Other(_)));
    }

    #[test]
    fn test_git_auth_error_translation() {
        let raw = git2::Error::new(ErrorCode::Auth, ErrorClass::Http, "remote authentication required");
        assert!(matches!(
            ConnectorError::from_git(raw),
            ConnectorError::AuthenticationFailure(_)
        ));
    }

    #[test]
    fn test_git_network_error_translation() {
        let raw = git2::Error::new(ErrorCode::GenericError, ErrorClass::Net, "failed to resolve address");
        assert!(matches!(
            ConnectorError::from_git(raw),
            ConnectorError::NetworkFailure(_)
        ));

        let http_auth =
            git2::Error::new(ErrorCode::GenericError, ErrorClass::Http, "unexpected http status code: 401");
        assert!(matches!(
            ConnectorError::from_git(http_auth),
            ConnectorError::AuthenticationFailure(_)
        ));
    }

    #[test]
    fn test_git_conflict_and_user_translation() {
        let conflict = git2::Error::new(ErrorCode::Conflict, ErrorClass::Checkout, "1 conflict prevents checkout");
        assert!(matches!(
            ConnectorError::from_git(conflict),
            ConnectorError::MergeConflict(_)
        ));

        let aborted = git2::Error::new(ErrorCode::User, ErrorClass::Callback, "transfer aborted");
        assert_eq!(ConnectorError::from_git(aborted), ConnectorError::Cancelled);
    }

    #[test]
    fn test_git_unknown_error_is_connector_failure() {
        let raw = git2::Error::new(ErrorCode::GenericError, ErrorClass::Odb, "object corrupted");
        assert!(matches!(ConnectorError::from_git(raw), ConnectorError::Failure(_)));
    }

    #[test]
    fn test_is_user_error() {
        let user_err = SyncError::Connector(ConnectorError::InvalidSourceUrl {
            url: "foo".to_string(),
            reason: "not a git URL".to_string(),
        });
        assert!(user_err.is_user_error());

        let system_err = SyncError::Io(std::io::Error::other("disk"));
        assert!(!system_err.is_user_error());
    }

    #[test]
    fn test_is_retryable() {
        let retryable = SyncError::Connector(ConnectorError::NetworkFailure("reset".to_string()));
        assert!(retryable.is_retryable());

        let not_retryable = SyncError::Connector(ConnectorError::MergeConflict("x".to_string()));
        assert!(!not_retryable.is_retryable());
    }

    #[test]
    fn test_batch_write_failure_display() {
        let err = IngestError::BatchWriteFailure {
            attempted: 10,
            failed: 1,
            reason: "disk full".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to persist 1 of 10 commits: disk full"
        );
    }

    #[test]
    fn test_cancelled_detection() {
        assert!(SyncError::Ingest(IngestError::Cancelled).is_cancelled());
        assert!(SyncError::Connector(ConnectorError::Cancelled).is_cancelled());
        assert!(!SyncError::other("boom").is_cancelled());
    }

    #[test]
    fn test_rusqlite_no_rows_is_not_found() {
        let err: StoreError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
