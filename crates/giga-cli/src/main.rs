use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use giga_adapters::{ChangeFeedSource, FixtureChangeFeed};
use giga_storage::{MemoryStore, Store, TaskRunStore};
use giga_sync::{
    connect_store, delta_sharing_source, maybe_build_scheduler, run_sync_once_from_env, SyncConfig,
    SyncOrchestrator, SyncRequest, TaskLockRegistry,
};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "giga-cli")]
#[command(about = "School master data sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, clap::Args)]
struct SourceArgs {
    /// Read changes from a fixture bundle instead of the Delta Sharing server.
    #[arg(long)]
    fixture: Option<PathBuf>,
    /// Use an in-process store seeded with one country per fixture table.
    #[arg(long, requires = "fixture")]
    in_memory: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync the given countries (ISO3 codes).
    Sync {
        #[arg(long = "country", required = true, num_args = 1..)]
        countries: Vec<String>,
        /// Bypass the recent-run suppression and hourly lock bucket.
        #[arg(long)]
        force: bool,
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Sync every table the change feed lists.
    SyncAll {
        #[arg(long)]
        force: bool,
        #[command(flatten)]
        source: SourceArgs,
    },
    Migrate,
    /// Run the cron scheduler until interrupted.
    Schedule,
    Serve,
    /// List recent task runs.
    Tasks {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Soft-delete a stuck task run so its lock name can be reused.
    Unlock { run_id: Uuid },
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("GIGA_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_tracing() {
    tracing_subscriber::fmt().with_env_filter(env_filter()).init();
}

/// Two-letter code for a fixture country, taken from the first characters of its table name.
fn fixture_country_code(iso3: &str) -> String {
    iso3.chars().take(2).collect()
}

async fn fixture_memory_store(feed: &FixtureChangeFeed) -> Result<Arc<MemoryStore>> {
    let store = Arc::new(MemoryStore::new());
    for table in feed.list_tables().await? {
        let iso3 = table.iso3();
        store.add_country(&iso3, &fixture_country_code(&iso3), &iso3).await;
    }
    Ok(store)
}

async fn fixture_orchestrator(
    config: &SyncConfig,
    path: &Path,
    in_memory: bool,
) -> Result<SyncOrchestrator> {
    let feed = FixtureChangeFeed::from_path(path)
        .with_context(|| format!("loading fixture {}", path.display()))?;
    let store: Arc<dyn Store> = if in_memory {
        fixture_memory_store(&feed).await?
    } else {
        connect_store(config).await?
    };
    let feed: Arc<dyn ChangeFeedSource> = Arc::new(feed);
    Ok(SyncOrchestrator::new(store, feed, config))
}

async fn run_sync(config: &SyncConfig, source: &SourceArgs, request: SyncRequest) -> Result<()> {
    let summary = match &source.fixture {
        Some(path) => {
            fixture_orchestrator(config, path, source.in_memory)
                .await?
                .run(&request)
                .await
        }
        None => run_sync_once_from_env(&request).await?,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    let command = cli.command.unwrap_or(Commands::SyncAll {
        force: false,
        source: SourceArgs {
            fixture: None,
            in_memory: false,
        },
    });
    match command {
        Commands::Sync {
            countries,
            force,
            source,
        } => {
            run_sync(&config, &source, SyncRequest::countries(countries).forced(force)).await?;
        }
        Commands::SyncAll { force, source } => {
            run_sync(&config, &source, SyncRequest::all().forced(force)).await?;
        }
        Commands::Migrate => {
            let store = connect_store(&config).await?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let store = connect_store(&config).await?;
            let orchestrator = Arc::new(SyncOrchestrator::new(
                store,
                delta_sharing_source(&config)?,
                &config,
            ));
            let Some(mut sched) = maybe_build_scheduler(orchestrator, &config).await? else {
                bail!("scheduler disabled; set GIGA_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Serve => {
            giga_web::serve(&config).await?;
        }
        Commands::Tasks { limit } => {
            let store = connect_store(&config).await?;
            for run in store.list_task_runs(limit.max(1)).await? {
                println!(
                    "{}  {:<9}  {}  {}{}",
                    run.id,
                    run.status.as_str(),
                    run.created_at.format("%Y-%m-%d %H:%M:%S"),
                    run.name,
                    if run.deleted_at.is_some() { "  (unlocked)" } else { "" }
                );
            }
        }
        Commands::Unlock { run_id } => {
            let store = connect_store(&config).await?;
            if TaskLockRegistry::new(store).unlock(run_id).await? {
                println!("unlocked {run_id}");
            } else {
                bail!("no live task run {run_id}");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use giga_storage::CountryStore;

    use super::*;

    #[test]
    fn fixture_codes_take_whole_characters() {
        assert_eq!(fixture_country_code("BRA"), "BR");
        assert_eq!(fixture_country_code("K"), "K");
        assert_eq!(fixture_country_code(""), "");
        assert_eq!(fixture_country_code("ÉCU"), "ÉC");
    }

    #[tokio::test]
    async fn in_memory_stores_seed_one_country_per_fixture_table() {
        let path = concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../../fixtures/school-master/sample/bundle.json"
        );
        let feed = FixtureChangeFeed::from_path(path).expect("fixture");
        let store = fixture_memory_store(&feed).await.expect("store");

        let brazil = store.find_country_by_iso3("BRA").await.expect("lookup").expect("country");
        assert_eq!(brazil.code, "BR");
        assert!(store.find_country_by_iso3("KEN").await.expect("lookup").is_some());
    }
}
