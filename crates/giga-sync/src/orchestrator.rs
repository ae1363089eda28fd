//! One sync invocation: lock, read each country's feed, stage, reconcile, release.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use giga_adapters::{ChangeFeedSource, TableRef};
use giga_core::{Country, TaskRun};
use giga_storage::{CountryStore, Store};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::cursor::VersionCursorStore;
use crate::lock::{LockAcquisition, TaskLockRegistry};
use crate::reader::{ChangeFeedReader, FeedRead};
use crate::reconcile::{ReconcileReport, ReconciliationEngine};
use crate::staging::StagingIngestor;

pub const JOB_NAME: &str = "school_master_sync";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncRequest {
    /// ISO3 codes; `None` syncs every table the feed lists.
    pub countries: Option<Vec<String>>,
    pub force: bool,
}

impl SyncRequest {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn countries(codes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            countries: Some(codes.into_iter().map(Into::into).collect()),
            force: false,
        }
    }

    pub fn forced(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

/// Hour-bucketed name, or second-bucketed when forced, plus the sorted country ids.
pub fn lock_name(now: DateTime<Utc>, country_ids: Option<&[i64]>, force: bool) -> String {
    let bucket = if force {
        now.format("%Y%m%d%H%M%S").to_string()
    } else {
        now.format("%Y%m%d%H").to_string()
    };
    match country_ids {
        Some(ids) if !ids.is_empty() => {
            let ids: Vec<String> = ids.iter().map(i64::to_string).collect();
            format!("{JOB_NAME}_{bucket}_{}", ids.join("_"))
        }
        _ => format!("{JOB_NAME}_{bucket}"),
    }
}

fn lock_description(country_ids: Option<&[i64]>) -> String {
    match country_ids {
        Some(ids) => format!("School master sync for countries {ids:?}"),
        None => "School master sync for all countries".to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableSyncStatus {
    UpToDate,
    Staged,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSyncOutcome {
    pub iso3: String,
    pub table: String,
    pub status: TableSyncStatus,
    pub previous_version: Option<i64>,
    pub version: Option<i64>,
    pub fetched: usize,
    pub staged: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncOutcome {
    Completed,
    Skipped { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub run_id: Uuid,
    pub lock_name: String,
    pub outcome: SyncOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tables: Vec<TableSyncOutcome>,
    pub published: ReconcileReport,
    pub deleted: ReconcileReport,
    pub pruned: u64,
}

impl SyncSummary {
    fn skipped(run_id: Uuid, lock_name: String, started_at: DateTime<Utc>, reason: String) -> Self {
        Self {
            run_id,
            lock_name,
            outcome: SyncOutcome::Skipped { reason },
            started_at,
            finished_at: Utc::now(),
            tables: Vec::new(),
            published: ReconcileReport::default(),
            deleted: ReconcileReport::default(),
            pruned: 0,
        }
    }

    pub fn failed_tables(&self) -> usize {
        self.tables
            .iter()
            .filter(|t| t.status == TableSyncStatus::Failed)
            .count()
    }
}

pub struct SyncOrchestrator {
    store: Arc<dyn Store>,
    locks: TaskLockRegistry,
    cursors: VersionCursorStore,
    reader: ChangeFeedReader,
    staging: StagingIngestor,
    reconciler: ReconciliationEngine,
}

impl SyncOrchestrator {
    pub fn new(store: Arc<dyn Store>, source: Arc<dyn ChangeFeedSource>, config: &SyncConfig) -> Self {
        let locks = TaskLockRegistry::new(store.clone());
        Self {
            cursors: VersionCursorStore::new(store.clone()),
            reader: ChangeFeedReader::new(source),
            staging: StagingIngestor::new(store.clone(), config.staging_batch_size),
            reconciler: ReconciliationEngine::new(
                store.clone(),
                locks.clone(),
                config.reconcile_chunk_size,
            ),
            locks,
            store,
        }
    }

    pub fn locks(&self) -> &TaskLockRegistry {
        &self.locks
    }

    /// Never fails: every problem is logged, written to the run log when a run exists,
    /// and reflected in the summary.
    pub async fn run(&self, request: &SyncRequest) -> SyncSummary {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let scoped = match &request.countries {
            Some(codes) => match self.resolve_countries(codes).await {
                Ok(countries) if countries.is_empty() => {
                    let name = lock_name(started_at, None, request.force);
                    warn!(?codes, "no known countries in sync request");
                    return SyncSummary::skipped(run_id, name, started_at, "no known countries".into());
                }
                Ok(countries) => Some(countries),
                Err(err) => {
                    let name = lock_name(started_at, None, request.force);
                    error!(error = %err, "resolving sync scope failed");
                    return SyncSummary::skipped(run_id, name, started_at, format!("{err:#}"));
                }
            },
            None => None,
        };
        let country_ids: Option<Vec<i64>> =
            scoped.as_ref().map(|cs| cs.iter().map(|c| c.id).collect());
        let name = lock_name(started_at, country_ids.as_deref(), request.force);
        let description = lock_description(country_ids.as_deref());

        let mut run = match self
            .locks
            .acquire(run_id, &name, &description, !request.force)
            .await
        {
            LockAcquisition::Acquired(run) => run,
            LockAcquisition::Unavailable(err) => {
                error!(lock = %name, error = %err, "could not acquire task lock; skipping run");
                return SyncSummary::skipped(run_id, name, started_at, format!("lock storage unavailable: {err}"));
            }
            other => {
                let reason = other.skip_reason().unwrap_or_default();
                info!(lock = %name, %reason, "sync skipped");
                return SyncSummary::skipped(run_id, name, started_at, reason);
            }
        };

        let span = info_span!("sync_run", run_id = %run_id, lock = %name);
        let mut summary = self
            .run_locked(&mut run, scoped, country_ids.as_deref())
            .instrument(span)
            .await;
        summary.started_at = started_at;

        self.locks
            .append_log(
                &mut run,
                &format!(
                    "Finished: {} tables, {} failed, {} published ({} failed), {} deleted ({} failed)",
                    summary.tables.len(),
                    summary.failed_tables(),
                    summary.published.processed,
                    summary.published.failed,
                    summary.deleted.processed,
                    summary.deleted.failed
                ),
            )
            .await;
        self.locks.release(&mut run).await;
        summary.finished_at = Utc::now();
        summary
    }

    async fn run_locked(
        &self,
        run: &mut TaskRun,
        scoped: Option<Vec<Country>>,
        country_ids: Option<&[i64]>,
    ) -> SyncSummary {
        self.locks.append_log(run, "Started school master sync").await;

        let targets = match scoped {
            Some(countries) => countries
                .into_iter()
                .map(|c| {
                    let table = self.reader.source().table_for_iso3(&c.iso3_format);
                    (c, table)
                })
                .collect(),
            None => self.discover_targets(run).await,
        };

        let mut tables = Vec::with_capacity(targets.len());
        for (country, table) in &targets {
            let span = info_span!("sync_table", country = %country.iso3_format, table = %table);
            let outcome = self.sync_table(run, country, table).instrument(span).await;
            tables.push(outcome);
        }

        let published = match self.reconciler.reconcile_published(country_ids, run).await {
            Ok(report) => report,
            Err(err) => {
                self.log_error(run, &format!("Published reconciliation aborted: {err}")).await;
                ReconcileReport::default()
            }
        };
        let deleted = match self.reconciler.reconcile_deleted(country_ids, run).await {
            Ok(report) => report,
            Err(err) => {
                self.log_error(run, &format!("Deleted reconciliation aborted: {err}")).await;
                ReconcileReport::default()
            }
        };
        let pruned = match self.staging.prune_superseded(country_ids).await {
            Ok(pruned) => pruned,
            Err(err) => {
                self.log_error(run, &format!("Pruning superseded staged rows failed: {err}")).await;
                0
            }
        };

        SyncSummary {
            run_id: run.id,
            lock_name: run.name.clone(),
            outcome: SyncOutcome::Completed,
            started_at: run.created_at,
            finished_at: Utc::now(),
            tables,
            published,
            deleted,
            pruned,
        }
    }

    async fn resolve_countries(&self, codes: &[String]) -> Result<Vec<Country>> {
        let mut countries = Vec::with_capacity(codes.len());
        for code in codes {
            match self
                .store
                .find_country_by_iso3(code)
                .await
                .with_context(|| format!("looking up country {code}"))?
            {
                Some(country) => countries.push(country),
                None => warn!(iso3 = %code, "unknown country; not syncing it"),
            }
        }
        countries.sort_by_key(|c| c.id);
        countries.dedup_by_key(|c| c.id);
        Ok(countries)
    }

    /// Maps every table the feed lists to a local country by ISO3 code.
    async fn discover_targets(&self, run: &mut TaskRun) -> Vec<(Country, TableRef)> {
        let listed = match self.reader.source().list_tables().await {
            Ok(tables) => tables,
            Err(err) => {
                self.log_error(run, &format!("Listing feed tables failed: {err}")).await;
                return Vec::new();
            }
        };
        let mut targets = Vec::with_capacity(listed.len());
        for table in listed {
            match self.store.find_country_by_iso3(&table.iso3()).await {
                Ok(Some(country)) => targets.push((country, table)),
                Ok(None) => warn!(table = %table, "feed table has no matching country"),
                Err(err) => {
                    self.log_error(run, &format!("Country lookup for {table} failed: {err}"))
                        .await;
                }
            }
        }
        targets
    }

    async fn sync_table(&self, run: &mut TaskRun, country: &Country, table: &TableRef) -> TableSyncOutcome {
        let mut outcome = TableSyncOutcome {
            iso3: country.iso3_format.clone(),
            table: table.to_string(),
            status: TableSyncStatus::Failed,
            previous_version: None,
            version: None,
            fetched: 0,
            staged: 0,
            error: None,
        };

        let cursor = match self.cursors.get_cursor(country.id).await {
            Ok(cursor) => cursor,
            Err(err) => {
                let message = format!("Reading cursor for {} failed: {err}", country.iso3_format);
                self.log_error(run, &message).await;
                outcome.error = Some(message);
                return outcome;
            }
        };
        outcome.previous_version = cursor;

        let (version, fetched, rows) = match self.reader.read(table, country.id, cursor).await {
            Ok(FeedRead::UpToDate { version }) => {
                outcome.status = TableSyncStatus::UpToDate;
                outcome.version = Some(version);
                self.locks
                    .append_log(run, &format!("{table}: up to date at version {version}"))
                    .await;
                return outcome;
            }
            Ok(FeedRead::Changes { version, fetched, rows }) => (version, fetched, rows),
            Err(err) => {
                let message = format!("Reading {table} failed: {err}");
                self.log_error(run, &message).await;
                outcome.error = Some(message);
                return outcome;
            }
        };
        outcome.fetched = fetched;

        match self.staging.stage(&rows).await {
            Ok(staged) => outcome.staged = staged,
            Err(err) => {
                let message = format!("Staging {table} failed: {err}");
                self.log_error(run, &message).await;
                outcome.error = Some(message);
                return outcome;
            }
        }

        if let Err(err) = self.cursors.set_cursor(country.id, version).await {
            let message = format!("Advancing cursor for {table} to {version} failed: {err}");
            self.log_error(run, &message).await;
            outcome.error = Some(message);
            return outcome;
        }

        outcome.status = TableSyncStatus::Staged;
        outcome.version = Some(version);
        self.locks
            .append_log(
                run,
                &format!(
                    "{table}: fetched {fetched} changes, staged {} rows, cursor {:?} -> {version}",
                    outcome.staged, cursor
                ),
            )
            .await;
        outcome
    }

    async fn log_error(&self, run: &mut TaskRun, message: &str) {
        error!(run_id = %run.id, "{message}");
        self.locks.append_log(run, message).await;
    }
}

/// Builds the cron scheduler when enabled; each tick syncs every country.
pub async fn maybe_build_scheduler(
    orchestrator: Arc<SyncOrchestrator>,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let orchestrator = orchestrator.clone();
        Box::pin(async move {
            let summary = orchestrator.run(&SyncRequest::all()).await;
            info!(
                lock = %summary.lock_name,
                outcome = ?summary.outcome,
                tables = summary.tables.len(),
                failed_tables = summary.failed_tables(),
                "scheduled sync finished"
            );
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
