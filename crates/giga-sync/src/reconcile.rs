//! Applies staged rows to schools and their versioned static snapshots.
//!
//! Rows are read in id-ordered chunks; each row is applied in its own storage
//! transaction. A failing row is logged with its raw data, left in staging for the next
//! pass and does not stop the chunk.

use std::sync::Arc;

use chrono::Utc;
use giga_core::{
    RowError, SchoolStaticAttributes, SchoolUpsert, StagedMasterRow, StagedStatus, TaskRun,
};
use giga_storage::{
    DeletedChange, DeletedOutcome, PublishedChange, PublishedOutcome, SchoolStore, StagingStore,
    Store, StoreError, StoreResult,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

use crate::config::{MAX_RECONCILE_CHUNK, MIN_RECONCILE_CHUNK};
use crate::lock::TaskLockRegistry;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Row(#[from] RowError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub processed: usize,
    pub failed: usize,
    pub schools_created: usize,
    pub schools_updated: usize,
    pub statics_created: usize,
    pub soft_deleted: usize,
    pub already_absent: usize,
}

pub struct ReconciliationEngine {
    store: Arc<dyn Store>,
    locks: TaskLockRegistry,
    chunk_size: usize,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<dyn Store>, locks: TaskLockRegistry, chunk_size: usize) -> Self {
        Self {
            store,
            locks,
            chunk_size: chunk_size.clamp(MIN_RECONCILE_CHUNK, MAX_RECONCILE_CHUNK),
        }
    }

    pub async fn reconcile_published(
        &self,
        countries: Option<&[i64]>,
        run: &mut TaskRun,
    ) -> StoreResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let mut after_id = 0i64;
        loop {
            let chunk = self
                .store
                .staged_chunk(StagedStatus::Published, countries, after_id, self.chunk_size as i64)
                .await?;
            let Some(last) = chunk.last() else { break };
            after_id = last.id;

            for staged in &chunk {
                report.processed += 1;
                match self.apply_published(staged).await {
                    Ok(outcome) => {
                        if outcome.school_created {
                            report.schools_created += 1;
                        } else {
                            report.schools_updated += 1;
                        }
                        if outcome.static_created {
                            report.statics_created += 1;
                        }
                    }
                    Err(err) => {
                        report.failed += 1;
                        self.record_failure(run, staged, &err).await;
                    }
                }
            }
            self.locks
                .append_log(
                    run,
                    &format!(
                        "Reconciled {} published rows ({} failed)",
                        report.processed, report.failed
                    ),
                )
                .await;
            if chunk.len() < self.chunk_size {
                break;
            }
        }
        info!(?report, "published rows reconciled");
        Ok(report)
    }

    pub async fn reconcile_deleted(
        &self,
        countries: Option<&[i64]>,
        run: &mut TaskRun,
    ) -> StoreResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let mut after_id = 0i64;
        loop {
            let chunk = self
                .store
                .staged_chunk(StagedStatus::Deleted, countries, after_id, self.chunk_size as i64)
                .await?;
            let Some(last) = chunk.last() else { break };
            after_id = last.id;

            for staged in &chunk {
                report.processed += 1;
                match self.apply_deleted(staged).await {
                    Ok(DeletedOutcome { school_id: Some(_) }) => report.soft_deleted += 1,
                    Ok(DeletedOutcome { school_id: None }) => report.already_absent += 1,
                    Err(err) => {
                        report.failed += 1;
                        self.record_failure(run, staged, &err).await;
                    }
                }
            }
            self.locks
                .append_log(
                    run,
                    &format!(
                        "Reconciled {} deleted rows ({} failed)",
                        report.processed, report.failed
                    ),
                )
                .await;
            if chunk.len() < self.chunk_size {
                break;
            }
        }
        info!(?report, "deleted rows reconciled");
        Ok(report)
    }

    async fn apply_published(&self, staged: &StagedMasterRow) -> Result<PublishedOutcome, ReconcileError> {
        let change = PublishedChange {
            staged_id: staged.id,
            school: SchoolUpsert::from_row(staged.country_id, &staged.row)?,
            version: staged.version,
            attributes: SchoolStaticAttributes::from_row(&staged.row),
        };
        Ok(self.store.apply_published(&change).await?)
    }

    async fn apply_deleted(&self, staged: &StagedMasterRow) -> Result<DeletedOutcome, ReconcileError> {
        let change = DeletedChange {
            staged_id: staged.id,
            country_id: staged.country_id,
            giga_id_school: staged.school_id_giga.clone(),
            deleted_at: Utc::now(),
        };
        Ok(self.store.apply_deleted(&change).await?)
    }

    async fn record_failure(&self, run: &mut TaskRun, staged: &StagedMasterRow, err: &ReconcileError) {
        let dump = serde_json::to_string(&staged.row)
            .unwrap_or_else(|e| format!("<unserializable row: {e}>"));
        error!(
            staged_id = staged.id,
            school_id_giga = %staged.school_id_giga,
            country_id = staged.country_id,
            version = staged.version,
            error = %err,
            row = %dump,
            "failed to reconcile staged row"
        );
        self.locks
            .append_log(
                run,
                &format!(
                    "Error reconciling staged row {} ({}, {}): {err}. Data: {dump}",
                    staged.id,
                    staged.school_id_giga,
                    staged.status.as_str()
                ),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use giga_core::{NewStagedRow, RecordStatus, SchoolMasterRow};
    use giga_storage::{MemoryStore, SchoolStore, StagingStore};
    use uuid::Uuid;

    use super::*;

    struct Harness {
        store: Arc<MemoryStore>,
        engine: ReconciliationEngine,
        run: TaskRun,
        country_id: i64,
    }

    async fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let country = store.add_country("Brazil", "BR", "BRA").await;
        let locks = TaskLockRegistry::new(store.clone());
        Harness {
            engine: ReconciliationEngine::new(store.clone(), locks, MIN_RECONCILE_CHUNK),
            store,
            run: TaskRun::running(Uuid::new_v4(), "test", "test", Utc::now()),
            country_id: country.id,
        }
    }

    fn published(country_id: i64, key: &str, version: i64, name: &str) -> NewStagedRow {
        let mut row = SchoolMasterRow::new(key);
        row.school_name = Some(name.to_string());
        row.download_speed_contracted = Some(10.0);
        row.connectivity = Some("TRUE".to_string());
        NewStagedRow {
            country_id,
            version,
            status: StagedStatus::Published,
            row,
        }
    }

    fn deleted(country_id: i64, key: &str, version: i64) -> NewStagedRow {
        NewStagedRow {
            country_id,
            version,
            status: StagedStatus::Deleted,
            row: SchoolMasterRow::new(key),
        }
    }

    #[tokio::test]
    async fn new_keys_create_a_school_and_its_snapshot() {
        let mut h = harness().await;
        h.store
            .insert_staged(&[published(h.country_id, "S1", 12, "B")])
            .await
            .expect("stage");

        let report = h
            .engine
            .reconcile_published(None, &mut h.run)
            .await
            .expect("reconcile");
        assert_eq!(report.schools_created, 1);
        assert_eq!(report.statics_created, 1);
        assert_eq!(h.store.count_staged(None).await.expect("count"), 0);

        let schools = h.store.find_schools(h.country_id, "S1").await.expect("schools");
        assert_eq!(schools.len(), 1);
        assert_eq!(schools[0].name, "B");
        let statics = h.store.school_statics(schools[0].id).await.expect("statics");
        assert_eq!(statics.len(), 1);
        assert_eq!(schools[0].last_school_static_id, Some(statics[0].id));
        assert_eq!(statics[0].attributes.download_speed_contracted, Some(10_000_000));
        assert_eq!(statics[0].attributes.connectivity, Some(true));
    }

    #[tokio::test]
    async fn replaying_a_version_is_idempotent() {
        let mut h = harness().await;
        let row = published(h.country_id, "S1", 12, "B");
        h.store.insert_staged(&[row.clone()]).await.expect("stage");
        h.engine.reconcile_published(None, &mut h.run).await.expect("first");

        h.store.insert_staged(&[row]).await.expect("replay");
        let second = h.engine.reconcile_published(None, &mut h.run).await.expect("second");
        assert_eq!(second.schools_created, 0);
        assert_eq!(second.statics_created, 0);

        let schools = h.store.find_schools(h.country_id, "S1").await.expect("schools");
        assert_eq!(schools.len(), 1);
        let statics = h.store.school_statics(schools[0].id).await.expect("statics");
        assert_eq!(statics.len(), 1);
        assert_eq!(schools[0].last_school_static_id, Some(statics[0].id));

        let third = h.engine.reconcile_published(None, &mut h.run).await.expect("third");
        assert_eq!(third.processed, 0);
    }

    #[tokio::test]
    async fn newer_versions_append_snapshots_and_move_the_pointer() {
        let mut h = harness().await;
        h.store.insert_staged(&[published(h.country_id, "S1", 10, "A")]).await.expect("stage");
        h.engine.reconcile_published(None, &mut h.run).await.expect("v10");
        h.store.insert_staged(&[published(h.country_id, "S1", 12, "B")]).await.expect("stage");
        h.engine.reconcile_published(None, &mut h.run).await.expect("v12");

        let schools = h.store.find_schools(h.country_id, "S1").await.expect("schools");
        assert_eq!(schools.len(), 1);
        assert_eq!(schools[0].name, "B");
        let statics = h.store.school_statics(schools[0].id).await.expect("statics");
        let versions: Vec<_> = statics.iter().map(|s| s.version).collect();
        assert_eq!(versions, vec![10, 12]);
        assert_eq!(schools[0].last_school_static_id, Some(statics[1].id));
    }

    #[tokio::test]
    async fn failing_rows_stay_staged_and_do_not_block_the_chunk() {
        let mut h = harness().await;
        h.store
            .insert_staged(&[
                published(h.country_id, "BAD", 3, "   "),
                published(h.country_id, "GOOD", 3, "Escola"),
            ])
            .await
            .expect("stage");

        let report = h.engine.reconcile_published(None, &mut h.run).await.expect("reconcile");
        assert_eq!(report.processed, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.schools_created, 1);

        let remaining = h.store.staged_rows().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].school_id_giga, "BAD");
        assert!(h.run.log.contains("Error reconciling staged row"));
        assert!(h.run.log.contains("\"school_id_giga\":\"BAD\""));
    }

    #[tokio::test]
    async fn deletes_soft_delete_existing_schools_and_keep_history() {
        let mut h = harness().await;
        h.store.insert_staged(&[published(h.country_id, "S1", 10, "A")]).await.expect("stage");
        h.engine.reconcile_published(None, &mut h.run).await.expect("publish");

        h.store.insert_staged(&[deleted(h.country_id, "S1", 11)]).await.expect("stage");
        let report = h.engine.reconcile_deleted(None, &mut h.run).await.expect("delete");
        assert_eq!(report.soft_deleted, 1);
        assert_eq!(h.store.count_staged(None).await.expect("count"), 0);

        let schools = h.store.find_schools(h.country_id, "S1").await.expect("schools");
        assert_eq!(schools[0].status, RecordStatus::Deleted);
        assert!(schools[0].deleted_at.is_some());
        assert_eq!(h.store.school_statics(schools[0].id).await.expect("statics").len(), 1);
    }

    #[tokio::test]
    async fn deletes_for_unknown_schools_just_consume_the_row() {
        let mut h = harness().await;
        h.store.insert_staged(&[deleted(h.country_id, "GHOST", 2)]).await.expect("stage");
        let report = h.engine.reconcile_deleted(None, &mut h.run).await.expect("delete");
        assert_eq!(report.already_absent, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(h.store.count_staged(None).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn country_filter_limits_the_pass() {
        let mut h = harness().await;
        let other = h.store.add_country("Kenya", "KE", "KEN").await;
        h.store
            .insert_staged(&[
                published(h.country_id, "S1", 1, "A"),
                published(other.id, "K1", 1, "B"),
            ])
            .await
            .expect("stage");

        let report = h
            .engine
            .reconcile_published(Some(&[other.id]), &mut h.run)
            .await
            .expect("reconcile");
        assert_eq!(report.processed, 1);
        let remaining = h.store.staged_rows().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].country_id, h.country_id);
    }

    #[tokio::test]
    async fn chunks_page_past_retained_rows() {
        let mut h = harness().await;
        let rows: Vec<_> = (0..250)
            .map(|i| {
                let name = if i % 50 == 0 { "" } else { "ok" };
                published(h.country_id, &format!("S{i}"), 1, name)
            })
            .collect();
        h.store.insert_staged(&rows).await.expect("stage");

        let report = h.engine.reconcile_published(None, &mut h.run).await.expect("reconcile");
        assert_eq!(report.processed, 250);
        assert_eq!(report.failed, 5);
        assert_eq!(h.store.count_staged(None).await.expect("count"), 5);
    }
}
