//! SQLite implementation of the commit store
//!
//! One [`SqliteSession`] wraps one connection and is used by exactly one run.
//! The schema is created on open when missing; there is no migration layer.

use super::{CommitStore, StoreProvider};
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::types::{
    BranchBackfill, CommitType, Contributor, NewContributor, NewRepository, PendingCommit,
    PendingFile, Repository, StoredCommit, StoredCommitFile,
};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS repositories (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    name          TEXT NOT NULL UNIQUE,
    path          TEXT NOT NULL,
    url           TEXT,
    created_at    TEXT NOT NULL,
    last_analyzed TEXT,
    is_active     INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS contributors (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    name             TEXT NOT NULL,
    email            TEXT NOT NULL UNIQUE,
    role             TEXT,
    team             TEXT,
    experience_level TEXT,
    created_at       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS commits (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    sha            TEXT NOT NULL,
    repository_id  INTEGER NOT NULL REFERENCES repositories(id),
    contributor_id INTEGER NOT NULL REFERENCES contributors(id),
    message        TEXT,
    commit_date    TEXT NOT NULL,
    author_name    TEXT,
    author_email   TEXT,
    files_changed  INTEGER NOT NULL DEFAULT 0 CHECK (files_changed >= 0),
    lines_added    INTEGER NOT NULL DEFAULT 0 CHECK (lines_added >= 0),
    lines_deleted  INTEGER NOT NULL DEFAULT 0 CHECK (lines_deleted >= 0),
    commit_type    TEXT,
    branch_name    TEXT,
    is_merge       INTEGER NOT NULL DEFAULT 0,
    created_at     TEXT NOT NULL,
    UNIQUE (repository_id, sha)
);

CREATE TABLE IF NOT EXISTS commit_files (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    commit_id     INTEGER NOT NULL REFERENCES commits(id) ON DELETE CASCADE,
    file_path     TEXT NOT NULL,
    file_type     TEXT,
    lines_added   INTEGER NOT NULL DEFAULT 0 CHECK (lines_added >= 0),
    lines_deleted INTEGER NOT NULL DEFAULT 0 CHECK (lines_deleted >= 0),
    is_test_file  INTEGER NOT NULL DEFAULT 0,
    created_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_commits_repository_date ON commits (repository_id, commit_date);
CREATE INDEX IF NOT EXISTS idx_commits_contributor ON commits (contributor_id);
CREATE INDEX IF NOT EXISTS idx_commit_files_commit ON commit_files (commit_id);
"#;

const INSERT_COMMIT: &str = "INSERT INTO commits (
        sha, repository_id, contributor_id, message, commit_date, author_name, author_email,
        files_changed, lines_added, lines_deleted, commit_type, branch_name, is_merge, created_at
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)";

const INSERT_COMMIT_FILE: &str = "INSERT INTO commit_files (
        commit_id, file_path, file_type, lines_added, lines_deleted, is_test_file, created_at
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)";

const SELECT_COMMIT: &str = "SELECT id, sha, repository_id, contributor_id, message, commit_date,
        author_name, author_email, files_changed, lines_added, lines_deleted, commit_type,
        is_merge, branch_name
    FROM commits";

const SELECT_REPOSITORY: &str =
    "SELECT id, name, path, url, created_at, last_analyzed, is_active FROM repositories";

/// Provider that opens a new SQLite connection per run
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: Duration::from_secs(5),
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            path: config.database_path.clone(),
            busy_timeout: Duration::from_millis(config.busy_timeout_ms),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a session and make sure the schema exists
    pub fn initialize(&self) -> Result<(), StoreError> {
        self.open_session().map(|_| ())
    }
}

impl StoreProvider for SqliteStore {
    type Session = SqliteSession;

    fn open_session(&self) -> Result<SqliteSession, StoreError> {
        SqliteSession::open(&self.path, self.busy_timeout)
    }
}

/// A single connection to the commit database
pub struct SqliteSession {
    conn: Connection,
}

impl SqliteSession {
    /// Open (and bootstrap) the database file at `path`
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self, StoreError> {
        let open_failed = |reason: String| StoreError::OpenFailed {
            path: path.display().to_string(),
            reason,
        };

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| open_failed(e.to_string()))?;
        }

        let conn = Connection::open(path).map_err(|e| open_failed(e.to_string()))?;
        conn.busy_timeout(busy_timeout)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;

        tracing::debug!("Opened commit database at {}", path.display());
        Self::bootstrap(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::bootstrap(Connection::open_in_memory()?)
    }

    fn bootstrap(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Register a repository for tracking
    pub fn insert_repository(&mut self, repo: &NewRepository) -> Result<Repository, StoreError> {
        let now = Utc::now();
        self.conn.execute(
            "INSERT INTO repositories (name, path, url, created_at, is_active)
             VALUES (?1, ?2, ?3, ?4, 1)",
            params![repo.name, repo.path, repo.url, now],
        )?;
        let id = self.conn.last_insert_rowid();
        tracing::info!("Registered repository '{}' (id {})", repo.name, id);

        Ok(Repository {
            id,
            name: repo.name.clone(),
            path: repo.path.clone(),
            url: repo.url.clone(),
            created_at: now,
            last_analyzed: None,
            is_active: true,
        })
    }

    pub fn get_repository(&self, id: i64) -> Result<Option<Repository>, StoreError> {
        let sql = format!("{} WHERE id = ?1", SELECT_REPOSITORY);
        Ok(self
            .conn
            .query_row(&sql, params![id], repository_from_row)
            .optional()?)
    }

    /// All active repositories, oldest first
    pub fn list_repositories(&self) -> Result<Vec<Repository>, StoreError> {
        let sql = format!("{} WHERE is_active = 1 ORDER BY id", SELECT_REPOSITORY);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], repository_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn commit_count(&self, repository_id: i64) -> Result<u64, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM commits WHERE repository_id = ?1",
            params![repository_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn commit_file_count(&self, repository_id: i64) -> Result<u64, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM commit_files f
             JOIN commits c ON c.id = f.commit_id
             WHERE c.repository_id = ?1",
            params![repository_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn contributor_count(&self) -> Result<u64, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM contributors", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Commits of a repository, newest first
    pub fn commits(&self, repository_id: i64) -> Result<Vec<StoredCommit>, StoreError> {
        let sql = format!(
            "{} WHERE repository_id = ?1 ORDER BY commit_date DESC, id DESC",
            SELECT_COMMIT
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![repository_id], commit_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn find_commit(
        &self,
        repository_id: i64,
        sha: &str,
    ) -> Result<Option<StoredCommit>, StoreError> {
        let sql = format!("{} WHERE repository_id = ?1 AND sha = ?2", SELECT_COMMIT);
        Ok(self
            .conn
            .query_row(&sql, params![repository_id, sha], commit_from_row)
            .optional()?)
    }

    pub fn commit_files(&self, commit_id: i64) -> Result<Vec<StoredCommitFile>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, commit_id, file_path, file_type, lines_added, lines_deleted, is_test_file
             FROM commit_files WHERE commit_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![commit_id], |row| {
            Ok(StoredCommitFile {
                id: row.get(0)?,
                commit_id: row.get(1)?,
                file_path: row.get(2)?,
                file_type: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                lines_added: row.get::<_, i64>(4)? as u64,
                lines_deleted: row.get::<_, i64>(5)? as u64,
                is_test_file: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

impl CommitStore for SqliteSession {
    fn load_contributors(&mut self) -> Result<Vec<Contributor>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, email, role, team, experience_level FROM contributors",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Contributor {
                id: row.get(0)?,
                name: row.get(1)?,
                email: row.get(2)?,
                role: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                team: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                experience_level: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn insert_contributor(
        &mut self,
        contributor: &NewContributor,
    ) -> Result<Contributor, StoreError> {
        self.conn.execute(
            "INSERT INTO contributors (name, email, role, team, experience_level, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                contributor.name,
                contributor.email,
                contributor.role,
                contributor.team,
                contributor.experience_level,
                Utc::now()
            ],
        )?;

        Ok(Contributor {
            id: self.conn.last_insert_rowid(),
            name: contributor.name.clone(),
            email: contributor.email.clone(),
            role: contributor.role.clone(),
            team: contributor.team.clone(),
            experience_level: contributor.experience_level.clone(),
        })
    }

    fn known_commits(&mut self, repository_id: i64) -> Result<HashMap<String, bool>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT sha, branch_name IS NOT NULL FROM commits WHERE repository_id = ?1",
        )?;
        let rows = stmt.query_map(params![repository_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?))
        })?;
        Ok(rows.collect::<Result<HashMap<_, _>, _>>()?)
    }

    fn insert_batch(&mut self, commits: &[PendingCommit]) -> Result<Vec<i64>, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now();
        let mut ids = Vec::with_capacity(commits.len());

        for commit in commits {
            ids.push(insert_commit_row(&tx, commit, now)?);
        }
        for (commit, id) in commits.iter().zip(&ids) {
            insert_file_rows(&tx, *id, &commit.files, now)?;
        }

        tx.commit()?;
        Ok(ids)
    }

    fn insert_commit(
        &mut self,
        commit: &PendingCommit,
        file_cap: usize,
    ) -> Result<i64, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now();
        let id = insert_commit_row(&tx, commit, now)?;
        let kept = commit.files.len().min(file_cap);
        insert_file_rows(&tx, id, &commit.files[..kept], now)?;
        tx.commit()?;
        Ok(id)
    }

    fn backfill_branches(
        &mut self,
        repository_id: i64,
        backfills: &[BranchBackfill],
    ) -> Result<usize, StoreError> {
        if backfills.is_empty() {
            return Ok(0);
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut changed = 0;
        {
            let mut stmt = tx.prepare_cached(
                "UPDATE commits SET branch_name = ?1
                 WHERE repository_id = ?2 AND sha = ?3 AND branch_name IS NULL",
            )?;
            for backfill in backfills {
                changed += stmt.execute(params![backfill.branch_name, repository_id, backfill.sha])?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    fn mark_analyzed(&mut self, repository_id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        let updated = self.conn.execute(
            "UPDATE repositories SET last_analyzed = ?1 WHERE id = ?2",
            params![at, repository_id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("repository {}", repository_id)));
        }
        Ok(())
    }
}

fn insert_commit_row(
    conn: &Connection,
    commit: &PendingCommit,
    now: DateTime<Utc>,
) -> Result<i64, StoreError> {
    let mut stmt = conn.prepare_cached(INSERT_COMMIT)?;
    stmt.execute(params![
        commit.sha,
        commit.repository_id,
        commit.contributor_id,
        commit.message,
        commit.committed_at,
        commit.author_name,
        commit.author_email,
        commit.files_changed as i64,
        commit.lines_added as i64,
        commit.lines_deleted as i64,
        commit.commit_type.as_str(),
        commit.branch_name,
        commit.is_merge,
        now,
    ])?;
    Ok(conn.last_insert_rowid())
}

fn insert_file_rows(
    conn: &Connection,
    commit_id: i64,
    files: &[PendingFile],
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let mut stmt = conn.prepare_cached(INSERT_COMMIT_FILE)?;
    for file in files {
        stmt.execute(params![
            commit_id,
            file.path,
            file.file_type,
            file.lines_added as i64,
            file.lines_deleted as i64,
            file.is_test_file,
            now,
        ])?;
    }
    Ok(())
}

fn repository_from_row(row: &Row<'_>) -> rusqlite::Result<Repository> {
    Ok(Repository {
        id: row.get(0)?,
        name: row.get(1)?,
        path: row.get(2)?,
        url: row.get(3)?,
        created_at: row.get(4)?,
        last_analyzed: row.get(5)?,
        is_active: row.get(6)?,
    })
}

fn commit_from_row(row: &Row<'_>) -> rusqlite::Result<StoredCommit> {
    Ok(StoredCommit {
        id: row.get(0)?,
        sha: row.get(1)?,
        repository_id: row.get(2)?,
        contributor_id: row.get(3)?,
        message: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        committed_at: row.get(5)?,
        author_name: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
        author_email: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
        files_changed: row.get::<_, i64>(8)? as u64,
        lines_added: row.get::<_, i64>(9)? as u64,
        lines_deleted: row.get::<_, i64>(10)? as u64,
        commit_type: CommitType::from_label(&row.get::<_, Option<String>>(11)?.unwrap_or_default()),
        is_merge: row.get(12)?,
        branch_name: row.get(13)?,
    })
}
