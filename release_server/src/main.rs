//! releasetrack — operations CLI for release tracking.
//!
//! Applies the schema and drives the reconciliation services against
//! PostgreSQL: binding commit lists and repository refs to releases, and
//! safe deletion.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use diesel_async::pooled_connection::deadpool::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;
use serde::de::DeserializeOwned;

use releasetrack_server::cache::InMemoryReleaseCache;
use releasetrack_server::config::ReleaseConfig;
use releasetrack_server::lock::PgLockManager;
use releasetrack_server::models::commit::{CommitRef, CommitSubmission};
use releasetrack_server::queue::PgTaskQueue;
use releasetrack_server::store::{PgReleaseStore, ReleaseStore};
use releasetrack_server::{metrics, migration, Backends, Collaborators, ReleaseServices};

#[derive(Parser)]
#[command(name = "releasetrack", about = "Release tracking and commit reconciliation")]
struct Cli {
    /// PostgreSQL connection URL
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Log output format (`json` or `text`)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    log_format: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply the release tracking schema
    Migrate,
    /// Bind a JSON list of commits to a release
    SetCommits {
        #[arg(long)]
        release_id: i64,
        #[arg(long)]
        file: PathBuf,
    },
    /// Set repository head commits of a release from a JSON list of refs
    SetRefs {
        #[arg(long)]
        release_id: i64,
        #[arg(long)]
        file: PathBuf,
        /// Queue a commit fetch from the VCS provider afterwards
        #[arg(long)]
        fetch: bool,
        #[arg(long)]
        user_id: Option<i64>,
    },
    /// Delete a release unless issues or health data reference it
    Delete {
        #[arg(long)]
        release_id: i64,
    },
}

fn init_tracing(log_format: &str) {
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_format);
    metrics::init_metrics();

    let mut config = ReleaseConfig::from_env();
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }

    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(&config.database_url);
    let pool = Pool::builder(manager)
        .max_size(config.db_max_connections)
        .build()
        .context("building database pool")?;

    if let Command::Migrate = cli.command {
        let mut conn = pool.get().await.context("connecting to database")?;
        migration::run_migration(&mut conn).await?;
        return Ok(());
    }

    let store = Arc::new(PgReleaseStore::new(pool.clone()));
    let backends = Backends {
        store: store.clone(),
        locks: Arc::new(PgLockManager::new(pool.clone())),
        cache: Arc::new(InMemoryReleaseCache::new()),
        queue: Arc::new(PgTaskQueue::new(pool)),
    };
    let services = ReleaseServices::new(&config, backends, Collaborators::default());

    match cli.command {
        Command::Migrate => {}
        Command::SetCommits { release_id, file } => {
            let commits: Vec<CommitSubmission> = read_json(&file)?;
            let release = store.get_release(release_id).await.context("loading release")?;
            let outcome = services.commits.set_commits(&release, commits).await?;
            tracing::info!(
                release_id,
                commit_count = ?outcome.release.commit_count,
                last_commit_id = ?outcome.release.last_commit_id,
                "Done"
            );
        }
        Command::SetRefs {
            release_id,
            file,
            fetch,
            user_id,
        } => {
            let refs: Vec<CommitRef> = read_json(&file)?;
            let release = store.get_release(release_id).await.context("loading release")?;
            services
                .commits
                .set_refs(&release, refs, user_id, fetch)
                .await?;
            tracing::info!(release_id, fetch, "Refs set");
        }
        Command::Delete { release_id } => {
            let release = store.get_release(release_id).await.context("loading release")?;
            services.releases.safe_delete(&release).await?;
        }
    }
    Ok(())
}
