use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use commit_sync::{Config, SyncEngine, SyncEvent};
use std::path::PathBuf;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

/// Clone, pull and ingest git history into a relational store
///
/// Progress events are written to stdout as JSON lines; logs go to stderr.
#[derive(Parser, Debug)]
#[command(name = "commit-sync", version, about)]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database file, overriding the configuration
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage tracked repositories
    Repo {
        #[command(subcommand)]
        action: RepoAction,
    },
    /// Clone a remote into a local directory
    Clone { url: String, dest: PathBuf },
    /// Fast-forward a local checkout from its remote
    Pull { path: PathBuf },
    /// Ingest the history of a registered repository
    Analyze {
        repository_id: i64,
        /// Checkout to walk instead of the registered location
        #[arg(long)]
        path: Option<PathBuf>,
        #[arg(long)]
        max_commits: Option<usize>,
    },
    /// Clone or pull a registered repository, then analyze it
    Sync {
        repository_id: i64,
        #[arg(long)]
        max_commits: Option<usize>,
    },
}

#[derive(Subcommand, Debug)]
enum RepoAction {
    /// Register a repository by local path, remote URL or both
    Add {
        name: String,
        #[arg(long)]
        path: Option<PathBuf>,
        #[arg(long)]
        url: Option<String>,
    },
    /// List active repositories
    List,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => {
            let mut config = Config::from_file(path)?;
            config.apply_env_overrides();
            config
        }
        None => Config::new()?,
    };
    if let Some(database) = &cli.database {
        config.store.database_path = database.clone();
    }
    config.validate()?;
    Ok(config)
}

// Prints events until every sender is gone
async fn print_events(mut events: broadcast::Receiver<SyncEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!("Failed to serialize event: {}", e),
            },
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("Event printer lagged, {} events skipped", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn execute(engine: &SyncEngine, command: Command) -> Result<()> {
    match command {
        Command::Repo { action } => match action {
            RepoAction::Add { name, path, url } => {
                let repository = engine.register_repository(&name, path, url).await?;
                println!("{}", serde_json::to_string(&repository)?);
            }
            RepoAction::List => {
                for repository in engine.list_repositories().await? {
                    println!("{}", serde_json::to_string(&repository)?);
                }
            }
        },
        Command::Clone { url, dest } => {
            let outcome = engine.start_clone(&url, &dest)?.wait().await?;
            tracing::info!(
                "Cloned into {} at {}",
                outcome.path.display(),
                outcome.head.as_deref().unwrap_or("an empty history")
            );
        }
        Command::Pull { path } => {
            let outcome = engine.pull(&path).await?;
            tracing::info!("{}", outcome.message);
        }
        Command::Analyze {
            repository_id,
            path,
            max_commits,
        } => {
            let path = match path {
                Some(path) => path,
                None => PathBuf::from(engine.get_repository(repository_id).await?.path),
            };
            let summary = engine
                .start_analyze(repository_id, &path, max_commits)
                .wait()
                .await?;
            tracing::info!(
                "Visited {} commits, stored {}",
                summary.commits_visited,
                summary.commits_persisted
            );
        }
        Command::Sync {
            repository_id,
            max_commits,
        } => {
            let outcome = engine.sync_repository(repository_id, max_commits).await?;
            tracing::info!(
                "Sync complete: {} commits pulled, {} stored",
                outcome.commits_pulled.unwrap_or(0),
                outcome.analysis.commits_persisted
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs on stderr; stdout carries the event stream
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli).context("Failed to load configuration")?;
    tracing::debug!(
        "commit-sync {} ({}, built {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_COMMIT_HASH"),
        env!("BUILD_TIMESTAMP")
    );

    let engine = SyncEngine::with_config(config)?;
    let printer = engine.subscribe().map(|events| tokio::spawn(print_events(events)));

    let result = execute(&engine, cli.command).await;

    drop(engine);
    if let Some(printer) = printer {
        // Watchdog tasks may still hold a sender briefly
        if tokio::time::timeout(std::time::Duration::from_secs(2), printer)
            .await
            .is_err()
        {
            tracing::debug!("Event printer did not drain in time");
        }
    }
    result
}
