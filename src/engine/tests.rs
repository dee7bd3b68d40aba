use super::*;
use crate::git::test_support::TestRepo;
use crate::progress::MemorySink;
use crate::store::CommitStore;
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.store.database_path = dir.path().join("commits.db");
    config.connector.clone_root = dir.path().join("clones");
    config.runtime.lock_dir = dir.path().join("locks");
    config.runtime.lock_timeout_secs = 1;
    config
}

fn engine(dir: &TempDir) -> (SyncEngine<SqliteStore>, MemorySink) {
    let config = test_config(dir);
    let store = SqliteStore::from_config(&config.store);
    store.initialize().unwrap();
    let sink = MemorySink::new();
    let engine = SyncEngine::with_provider(config, store, Arc::new(sink.clone()));
    (engine, sink)
}

fn upstream_with_history(commits: usize) -> TestRepo {
    let upstream = TestRepo::init_named("origin.git");
    for i in 0..commits {
        let name = format!("src/file{}.rs", i);
        let body = format!("// {}\n", i);
        upstream.commit(
            &[(name.as_str(), body.as_str())],
            &format!("add feature {}", i),
            1_600_000_000 + i as i64 * 60,
        );
    }
    upstream
}

fn assert_well_formed(events: &[SyncEvent]) {
    assert!(matches!(events.first(), Some(SyncEvent::Started { .. })));
    assert!(matches!(events.last(), Some(SyncEvent::Completed { .. })));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

    let percents: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            SyncEvent::Progress { percent, .. } => Some(*percent),
            _ => None,
        })
        .collect();
    assert!(
        percents.windows(2).all(|w| w[0] <= w[1]),
        "percentages went backwards: {:?}",
        percents
    );
}

fn terminal(events: &[SyncEvent]) -> (bool, String, Option<String>, u64) {
    match events.last() {
        Some(SyncEvent::Completed {
            success,
            message,
            error,
            count_processed,
            ..
        }) => (*success, message.clone(), error.clone(), *count_processed),
        other => panic!("expected a completed event, got {:?}", other),
    }
}

#[tokio::test]
async fn test_invalid_clone_url_fails_without_events() {
    let dir = TempDir::new().unwrap();
    let (engine, sink) = engine(&dir);

    let result = engine.start_clone("https://example.com/page", &dir.path().join("x"));
    assert!(matches!(
        result,
        Err(SyncError::Connector(ConnectorError::InvalidSourceUrl { .. }))
    ));
    assert!(sink.events().is_empty());
}

#[tokio::test]
async fn test_clone_runs_in_background_and_reports() {
    let upstream = upstream_with_history(3);
    let dir = TempDir::new().unwrap();
    let (engine, sink) = engine(&dir);
    let dest = dir.path().join("checkout");

    let handle = engine.start_clone(upstream.url(), &dest).unwrap();
    let run_id = handle.run_id();
    assert_eq!(handle.operation(), Operation::Clone);
    let outcome = handle.wait().await.unwrap();

    assert!(outcome.head.is_some());
    assert!(dest.join("src/file2.rs").exists());

    let events = sink.events_for(run_id);
    assert_well_formed(&events);
    let (success, _, error, _) = terminal(&events);
    assert!(success);
    assert!(error.is_none());
}

#[tokio::test]
async fn test_analyze_failure_emits_translated_error() {
    let dir = TempDir::new().unwrap();
    let (engine, sink) = engine(&dir);
    let plain = dir.path().join("plain");
    std::fs::create_dir_all(&plain).unwrap();

    let handle = engine.start_analyze(1, &plain, None);
    let run_id = handle.run_id();
    let err = handle.wait().await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Connector(ConnectorError::NotAVersionControlledDirectory(_))
    ));

    let events = sink.events_for(run_id);
    assert_well_formed(&events);
    let (success, message, error, _) = terminal(&events);
    assert!(!success);
    assert_eq!(message, "Analysis failed");
    assert!(error.unwrap().contains("Not a git working directory"));
}

#[tokio::test]
async fn test_cancel_before_start_ends_run() {
    let local = TestRepo::init();
    local.commit(&[("a.txt", "a\n")], "init", 1_600_000_000);
    let dir = TempDir::new().unwrap();
    let (engine, sink) = engine(&dir);

    let handle = engine.start_analyze(1, local.path(), None);
    let run_id = handle.run_id();
    handle.cancel();
    let err = handle.wait().await.unwrap_err();
    assert!(err.is_cancelled());

    let events = sink.events_for(run_id);
    assert_well_formed(&events);
    let (success, message, _, _) = terminal(&events);
    assert!(!success);
    assert_eq!(message, "Analysis cancelled");
}

#[tokio::test]
async fn test_register_repository_validation() {
    let dir = TempDir::new().unwrap();
    let (engine, _sink) = engine(&dir);

    assert!(matches!(
        engine.register_repository("  ", Some(dir.path().into()), None).await,
        Err(SyncError::Validation(ValidationError::Empty(_)))
    ));
    assert!(matches!(
        engine.register_repository("none", None, None).await,
        Err(SyncError::Validation(ValidationError::InvalidValue(..)))
    ));
    assert!(matches!(
        engine
            .register_repository("bad", None, Some("https://example.com/x".to_string()))
            .await,
        Err(SyncError::Connector(ConnectorError::InvalidSourceUrl { .. }))
    ));

    let by_url = engine
        .register_repository("my app", None, Some("https://github.com/me/app".to_string()))
        .await
        .unwrap();
    assert!(by_url.path.ends_with("my_app"));
    assert!(by_url.path.contains("clones"));

    let listed = engine.list_repositories().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, by_url.id);

    assert!(matches!(
        engine.get_repository(999).await,
        Err(SyncError::Validation(ValidationError::RepositoryNotFound(999)))
    ));
}

#[tokio::test]
async fn test_sync_clones_then_pulls() {
    let upstream = upstream_with_history(4);
    let dir = TempDir::new().unwrap();
    let (engine, _sink) = engine(&dir);

    let repository = engine
        .register_repository("origin", None, Some(upstream.url().to_string()))
        .await
        .unwrap();

    let first = engine.sync_repository(repository.id, None).await.unwrap();
    assert!(first.cloned_head.is_some());
    assert_eq!(first.commits_pulled, None);
    assert_eq!(first.analysis.commits_persisted, 4);

    upstream.commit(&[("src/fix.rs", "fix\n")], "fix crash", 1_700_000_000);

    let second = engine.sync_repository(repository.id, None).await.unwrap();
    assert_eq!(second.cloned_head, None);
    assert_eq!(second.commits_pulled, Some(1));
    assert_eq!(second.analysis.commits_persisted, 1);
    assert_eq!(second.analysis.commits_skipped, 4);

    let refreshed = engine.get_repository(repository.id).await.unwrap();
    assert!(refreshed.last_analyzed.is_some());
}

#[tokio::test]
async fn test_sync_local_checkout_skips_pull() {
    let local = TestRepo::init();
    local.commit(&[("a.txt", "a\n")], "init", 1_600_000_000);
    local.commit(&[("b.txt", "b\n")], "add docs", 1_600_000_100);
    let dir = TempDir::new().unwrap();
    let (engine, _sink) = engine(&dir);

    let repository = engine
        .register_repository("local", Some(local.path().to_path_buf()), None)
        .await
        .unwrap();
    let outcome = engine.sync(&repository, None).await.unwrap();
    assert_eq!(outcome.commits_pulled, None);
    assert_eq!(outcome.analysis.commits_persisted, 2);
}

#[tokio::test]
async fn test_sync_without_checkout_or_url_fails() {
    let dir = TempDir::new().unwrap();
    let (engine, _sink) = engine(&dir);
    let repository = engine
        .register_repository("ghost", Some(dir.path().join("ghost")), None)
        .await
        .unwrap();

    let err = engine.sync(&repository, None).await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Connector(ConnectorError::NotAVersionControlledDirectory(_))
    ));
}

#[tokio::test]
async fn test_concurrent_analyze_of_one_repository_is_serialized() {
    let local = TestRepo::init();
    for i in 0..20 {
        let name = format!("f{}.txt", i);
        local.commit(&[(name.as_str(), "x\n")], "add file", 1_600_000_000 + i);
    }
    let dir = TempDir::new().unwrap();
    let (engine, sink) = engine(&dir);
    let repository = engine
        .register_repository("local", Some(local.path().to_path_buf()), None)
        .await
        .unwrap();

    let a = engine.start_analyze(repository.id, local.path(), None);
    let b = engine.start_analyze(repository.id, local.path(), None);
    assert_ne!(a.run_id(), b.run_id());
    let (a_id, b_id) = (a.run_id(), b.run_id());

    let first = a.wait().await.unwrap();
    let second = b.wait().await.unwrap();

    // One of them saw the other's commits already stored
    assert_eq!(first.commits_persisted + second.commits_persisted, 20);
    let mut session = engine.provider.open_session().unwrap();
    assert_eq!(session.known_commits(repository.id).unwrap().len(), 20);
    assert_eq!(session.commit_count(repository.id).unwrap(), 20);

    assert_well_formed(&sink.events_for(a_id));
    assert_well_formed(&sink.events_for(b_id));
    assert_eq!(engine.locks.active(), 0);
}

#[tokio::test]
async fn test_broadcast_engine_publishes_to_subscribers() {
    let local = TestRepo::init();
    local.commit(&[("a.txt", "a\n")], "init", 1_600_000_000);
    let dir = TempDir::new().unwrap();
    let engine = SyncEngine::with_config(test_config(&dir)).unwrap();
    let mut events = engine.subscribe().unwrap();

    let repository = engine
        .register_repository("local", Some(local.path().to_path_buf()), None)
        .await
        .unwrap();
    let handle = engine.start_analyze(repository.id, local.path(), None);
    let run_id = handle.run_id();
    handle.wait().await.unwrap();

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    assert!(received.iter().all(|e| e.run_id() == run_id));
    assert_well_formed(&received);
}

#[test]
fn test_clone_destination_is_sanitized() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let store = SqliteStore::from_config(&config.store);
    let engine = SyncEngine::with_provider(config, store, Arc::new(MemorySink::new()));

    let dest = engine.clone_destination("team/app name");
    assert!(dest.ends_with("team_app_name"));
    assert!(dest.starts_with(dir.path()));
}
