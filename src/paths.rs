/// Centralized platform-specific path computation
///
/// Provides consistent path handling across Windows, macOS, and Linux following
/// XDG Base Directory specification on Unix-like systems.
use std::path::{Path, PathBuf};

/// Folder name used under every platform base directory
const APP_FOLDER: &str = "commit-sync";

/// Platform-agnostic path utilities
pub struct PlatformPaths;

impl PlatformPaths {
    /// Get the appropriate data directory for the current platform
    ///
    /// - Windows: %LOCALAPPDATA%
    /// - macOS: ~/Library/Application Support
    /// - Linux/Unix: $XDG_DATA_HOME or ~/.local/share
    pub fn data_dir() -> PathBuf {
        if cfg!(target_os = "windows") {
            std::env::var("LOCALAPPDATA")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("."))
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .map(|home| PathBuf::from(home).join("Library/Application Support"))
                .unwrap_or_else(|_| PathBuf::from("."))
        } else {
            // Linux/Unix - follow XDG Base Directory specification
            std::env::var("XDG_DATA_HOME")
                .map(PathBuf::from)
                .or_else(|_| {
                    std::env::var("HOME").map(|home| PathBuf::from(home).join(".local/share"))
                })
                .unwrap_or_else(|_| PathBuf::from("."))
        }
    }

    /// Get the appropriate config directory for the current platform
    ///
    /// - Windows: %APPDATA%
    /// - macOS: ~/Library/Application Support
    /// - Linux/Unix: $XDG_CONFIG_HOME or ~/.config
    pub fn config_dir() -> PathBuf {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("."))
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .map(|home| PathBuf::from(home).join("Library/Application Support"))
                .unwrap_or_else(|_| PathBuf::from("."))
        } else {
            std::env::var("XDG_CONFIG_HOME")
                .map(PathBuf::from)
                .or_else(|_| std::env::var("HOME").map(|home| PathBuf::from(home).join(".config")))
                .unwrap_or_else(|_| PathBuf::from("."))
        }
    }

    /// Returns: {data_dir}/commit-sync
    pub fn project_data_dir() -> PathBuf {
        Self::data_dir().join(APP_FOLDER)
    }

    /// Returns: {config_dir}/commit-sync
    pub fn project_config_dir() -> PathBuf {
        Self::config_dir().join(APP_FOLDER)
    }

    /// Get default SQLite database path
    ///
    /// Returns: {data_dir}/commit-sync/commits.db
    pub fn default_database_path() -> PathBuf {
        Self::project_data_dir().join("commits.db")
    }

    /// Get default directory that remote repositories are cloned into
    ///
    /// Returns: {data_dir}/commit-sync/repositories
    pub fn default_clone_root() -> PathBuf {
        Self::project_data_dir().join("repositories")
    }

    /// Get the directory holding cross-process run lock files
    ///
    /// Returns: {data_dir}/commit-sync/locks
    pub fn default_lock_dir() -> PathBuf {
        Self::project_data_dir().join("locks")
    }

    /// Get default config file path
    ///
    /// Returns: {config_dir}/commit-sync/config.toml
    pub fn default_config_path() -> PathBuf {
        Self::project_config_dir().join("config.toml")
    }

    /// Make a path absolute without touching the filesystem
    ///
    /// Unlike `canonicalize`, this works for paths that do not exist yet
    /// (clone destinations), so it is used to key per-repository locks.
    pub fn absolute(path: &Path) -> PathBuf {
        std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
    }
}
