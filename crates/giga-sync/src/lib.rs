//! Incremental school master data sync: locks, cursors, change-feed reading, staging,
//! reconciliation and the orchestrator that sequences them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use giga_adapters::{ChangeFeedSource, DeltaSharingClient, DeltaSharingProfile};
use giga_storage::{HttpClientConfig, HttpFetcher, PgStore, PoolConfig};

mod config;
mod cursor;
mod lock;
mod orchestrator;
mod reader;
mod reconcile;
mod staging;

pub use config::{SyncConfig, MAX_RECONCILE_CHUNK, MIN_RECONCILE_CHUNK};
pub use cursor::VersionCursorStore;
pub use lock::{LockAcquisition, TaskLockRegistry, RECENT_RUN_HOURS};
pub use orchestrator::{
    lock_name, maybe_build_scheduler, SyncOrchestrator, SyncOutcome, SyncRequest, SyncSummary,
    TableSyncOutcome, TableSyncStatus, JOB_NAME,
};
pub use reader::{normalize_changes, ChangeFeedReader, FeedRead};
pub use reconcile::{ReconcileError, ReconcileReport, ReconciliationEngine};
pub use staging::{StagingIngestor, DEFAULT_STAGING_BATCH};

pub async fn connect_store(config: &SyncConfig) -> Result<Arc<PgStore>> {
    let store = PgStore::connect(&config.database_url, PoolConfig::default())
        .await
        .context("connecting to the primary database")?;
    Ok(Arc::new(store))
}

/// Delta Sharing source described by the configured profile file.
pub fn delta_sharing_source(config: &SyncConfig) -> Result<Arc<dyn ChangeFeedSource>> {
    let profile = DeltaSharingProfile::from_file(&config.profile_path).with_context(|| {
        format!("loading delta sharing profile {}", config.profile_path.display())
    })?;
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?;
    Ok(Arc::new(DeltaSharingClient::new(
        http,
        profile,
        config.share_name.clone(),
        config.schema_name.clone(),
    )))
}

pub async fn run_sync_once_from_env(request: &SyncRequest) -> Result<SyncSummary> {
    let config = SyncConfig::from_env();
    let store = connect_store(&config).await?;
    let source = delta_sharing_source(&config)?;
    let orchestrator = SyncOrchestrator::new(store, source, &config);
    Ok(orchestrator.run(request).await)
}
