//! Commit and file classification heuristics
//!
//! Pure, table-driven functions: commit messages map to a [`CommitType`] by
//! keyword match in a fixed priority order, file paths map to a test/production
//! flag, and raw VCS timestamps are clamped into a sane calendar range.

use crate::types::{CommitType, DEFAULT_ROLE, DEFAULT_UNKNOWN};
use chrono::{DateTime, Datelike, Utc};
use regex::RegexSet;
use std::path::Path;
use std::sync::LazyLock;

/// Keyword table, evaluated top to bottom; the first matching row wins.
pub const COMMIT_TYPE_KEYWORDS: &[(CommitType, &[&str])] = &[
    (
        CommitType::Test,
        &["test", "spec", "unit test", "integration test"],
    ),
    (CommitType::Bugfix, &["fix", "bug", "hotfix", "patch"]),
    (CommitType::Refactor, &["refactor", "cleanup", "optimize"]),
    (CommitType::Documentation, &["doc", "readme", "comment"]),
    (
        CommitType::Feature,
        &["feat", "feature", "add", "implement"],
    ),
];

/// Case-insensitive path patterns that mark a test file
pub const TEST_FILE_PATTERNS: &[&str] = &[
    r"\.test\.",
    r"\.spec\.",
    r"(^|/)tests?/",
    r"(^|/)__tests__/",
    r"_test\.",
    r"_spec\.",
    r"(^|/)test_[^/]*\.py$",
    r"Test\.java$",
    r"Tests?\.cs$",
];

static TEST_FILE_SET: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new(TEST_FILE_PATTERNS.iter().map(|p| format!("(?i){}", p)))
        .expect("test file patterns are valid regexes")
});

/// Lowest accepted commit year
pub const MIN_COMMIT_YEAR: i32 = 1970;
/// Highest accepted commit year
pub const MAX_COMMIT_YEAR: i32 = 2100;

/// Classify a commit message into a commit type
pub fn classify_commit_type(message: &str) -> CommitType {
    let lower = message.to_lowercase();
    COMMIT_TYPE_KEYWORDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| lower.contains(k)))
        .map(|(kind, _)| *kind)
        .unwrap_or(CommitType::Other)
}

/// Determine whether a path names a test file
pub fn is_test_file(path: &str) -> bool {
    // Normalize Windows separators so directory patterns still apply
    let normalized = path.replace('\\', "/");
    TEST_FILE_SET.is_match(&normalized)
}

/// Final extension of a path including the leading dot (`.py`), or an
/// empty string for extension-less files and dotfiles
pub fn file_type(path: &str) -> String {
    Path::new(path)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default()
}

/// Convert raw commit seconds into a timestamp within [1970, 2100]
///
/// Values that cannot be represented or fall before 1970 clamp to the UNIX
/// epoch; values after 2100 clamp to the current instant.
pub fn sanitize_timestamp(raw_seconds: i64) -> DateTime<Utc> {
    sanitize_timestamp_at(raw_seconds, Utc::now())
}

/// [`sanitize_timestamp`] with an explicit "now" for the upper clamp
pub fn sanitize_timestamp_at(raw_seconds: i64, now: DateTime<Utc>) -> DateTime<Utc> {
    match DateTime::<Utc>::from_timestamp(raw_seconds, 0) {
        Some(ts) if ts.year() < MIN_COMMIT_YEAR => DateTime::UNIX_EPOCH,
        Some(ts) if ts.year() > MAX_COMMIT_YEAR => now,
        Some(ts) => ts,
        None if raw_seconds < 0 => DateTime::UNIX_EPOCH,
        None => now,
    }
}

/// Guess a contributor role from the local part of an email address
pub fn infer_role(email: &str) -> &'static str {
    let local = local_part(email);
    if ["qa", "quality", "testing"].iter().any(|k| local.contains(k)) {
        "tester"
    } else {
        DEFAULT_ROLE
    }
}

/// Guess a contributor team from the local part of an email address
pub fn infer_team(email: &str) -> &'static str {
    let local = local_part(email);
    [
        ("frontend", "frontend"),
        ("backend", "backend"),
        ("mobile", "mobile"),
        ("devops", "devops"),
    ]
    .iter()
    .find(|(keyword, _)| local.contains(keyword))
    .map(|(_, team)| *team)
    .unwrap_or(DEFAULT_UNKNOWN)
}

fn local_part(email: &str) -> String {
    email
        .split('@')
        .next()
        .unwrap_or_default()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_classify_examples() {
        assert_eq!(classify_commit_type("fix: null pointer"), CommitType::Bugfix);
        assert_eq!(classify_commit_type("add new widget"), CommitType::Feature);
        assert_eq!(classify_commit_type("refactor cleanup"), CommitType::Refactor);
        assert_eq!(classify_commit_type("random change"), CommitType::Other);
    }

    #[test]
    fn test_classify_priority_order() {
        // test beats bugfix
        assert_eq!(classify_commit_type("Fix flaky unit test"), CommitType::Test);
        // bugfix beats feature
        assert_eq!(classify_commit_type("add patch for overflow"), CommitType::Bugfix);
        // refactor beats documentation
        assert_eq!(classify_commit_type("Refactor docs generator"), CommitType::Refactor);
        // documentation beats feature
        assert_eq!(classify_commit_type("add README section"), CommitType::Documentation);
    }

    #[test]
    fn test_classify_is_case_insensitive() {
        assert_eq!(classify_commit_type("HOTFIX prod"), CommitType::Bugfix);
        assert_eq!(classify_commit_type("Implement OAuth"), CommitType::Feature);
        assert_eq!(classify_commit_type(""), CommitType::Other);
    }

    #[test]
    fn test_is_test_file_examples() {
        assert!(is_test_file("tests/test_api.py"));
        assert!(!is_test_file("src/api.py"));
        assert!(is_test_file("Component.test.jsx"));
    }

    #[test]
    fn test_is_test_file_true_cases() {
        for path in [
            "test_example.py",
            "example.test.js",
            "ExampleTest.java",
            "example_spec.rb",
            "tests/test_helper.py",
            "__tests__/component.test.jsx",
            "pkg/server_test.go",
            "src/app.spec.ts",
            "crates/core/tests/integration.rs",
            "src\\test\\Foo.cs",
        ] {
            assert!(is_test_file(path), "{} should be a test file", path);
        }
    }

    #[test]
    fn test_is_test_file_false_cases() {
        for path in [
            "example.py",
            "component.js",
            "style.css",
            "README.md",
            "config.json",
            "src/contest/results.rs",
        ] {
            assert!(!is_test_file(path), "{} should not be a test file", path);
        }
    }

    #[test]
    fn test_file_type() {
        assert_eq!(file_type("src/main.py"), ".py");
        assert_eq!(file_type("archive.tar.gz"), ".gz");
        assert_eq!(file_type("Makefile"), "");
        assert_eq!(file_type(".gitignore"), "");
    }

    #[test]
    fn test_sanitize_timestamp_in_range() {
        let ts = sanitize_timestamp(1_704_067_200);
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_sanitize_timestamp_too_early_clamps_to_epoch() {
        let year_1900 = Utc.with_ymd_and_hms(1900, 6, 1, 0, 0, 0).unwrap().timestamp();
        assert_eq!(sanitize_timestamp(year_1900), DateTime::UNIX_EPOCH);
    }

    #[test]
    fn test_sanitize_timestamp_too_late_clamps_to_now() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let year_2200 = Utc.with_ymd_and_hms(2200, 1, 1, 0, 0, 0).unwrap().timestamp();
        assert_eq!(sanitize_timestamp_at(year_2200, now), now);
    }

    #[test]
    fn test_sanitize_timestamp_unrepresentable() {
        let now = Utc::now();
        assert_eq!(sanitize_timestamp_at(i64::MIN, now), DateTime::UNIX_EPOCH);
        assert_eq!(sanitize_timestamp_at(i64::MAX, now), now);
    }

    #[test]
    fn test_infer_role_from_email() {
        for (email, expected) in [
            ("test@example.com", "developer"),
            ("qa@company.com", "tester"),
            ("quality@company.com", "tester"),
            ("testing@company.com", "tester"),
            ("admin@company.com", "developer"),
        ] {
            assert_eq!(infer_role(email), expected, "email {}", email);
        }
    }

    #[test]
    fn test_infer_team_from_email() {
        for (email, expected) in [
            ("frontend@company.com", "frontend"),
            ("backend@company.com", "backend"),
            ("mobile@company.com", "mobile"),
            ("devops@company.com", "devops"),
            ("user@company.com", "unknown"),
        ] {
            assert_eq!(infer_team(email), expected, "email {}", email);
        }
    }
}
