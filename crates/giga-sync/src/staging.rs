use std::collections::BTreeSet;
use std::sync::Arc;

use giga_core::NewStagedRow;
use giga_storage::{StagingStore, Store, StoreResult};
use tracing::debug;

pub const DEFAULT_STAGING_BATCH: usize = 5000;

/// Appends normalized rows to the staging queue in bounded batches.
pub struct StagingIngestor {
    store: Arc<dyn Store>,
    batch_size: usize,
}

impl StagingIngestor {
    pub fn new(store: Arc<dyn Store>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    /// Inserts `rows`, then drops staged rows the new ones supersede for the same
    /// countries. Returns the number inserted.
    pub async fn stage(&self, rows: &[NewStagedRow]) -> StoreResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut inserted = 0u64;
        for batch in rows.chunks(self.batch_size) {
            inserted += self.store.insert_staged(batch).await?;
            debug!(batch = batch.len(), inserted, "staged batch");
        }
        let countries: Vec<i64> = rows
            .iter()
            .map(|r| r.country_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        self.prune_superseded(Some(&countries)).await?;
        Ok(inserted)
    }

    pub async fn prune_superseded(&self, countries: Option<&[i64]>) -> StoreResult<u64> {
        self.store.delete_superseded_staged(countries).await
    }
}

#[cfg(test)]
mod tests {
    use giga_core::{SchoolMasterRow, StagedStatus};
    use giga_storage::MemoryStore;

    use super::*;

    fn staged(country_id: i64, key: &str, version: i64, name: &str) -> NewStagedRow {
        let mut row = SchoolMasterRow::new(key);
        row.school_name = Some(name.to_string());
        NewStagedRow {
            country_id,
            version,
            status: StagedStatus::Published,
            row,
        }
    }

    #[tokio::test]
    async fn batches_cover_every_row() {
        let store = Arc::new(MemoryStore::new());
        let ingestor = StagingIngestor::new(store.clone(), 2);
        let rows: Vec<_> = (0..5).map(|i| staged(1, &format!("S{i}"), 3, "x")).collect();

        assert_eq!(ingestor.stage(&rows).await.expect("stage"), 5);
        assert_eq!(store.staged_rows().await.len(), 5);
    }

    #[tokio::test]
    async fn restaging_a_key_keeps_only_the_newest_version() {
        let store = Arc::new(MemoryStore::new());
        let ingestor = StagingIngestor::new(store.clone(), DEFAULT_STAGING_BATCH);
        ingestor.stage(&[staged(1, "S1", 10, "A")]).await.expect("first");
        ingestor.stage(&[staged(1, "S1", 12, "B")]).await.expect("second");
        ingestor.stage(&[staged(2, "S1", 4, "other country")]).await.expect("third");

        let rows = store.staged_rows().await;
        assert_eq!(rows.len(), 2);
        let brazil: Vec<_> = rows.iter().filter(|r| r.country_id == 1).collect();
        assert_eq!(brazil.len(), 1);
        assert_eq!(brazil[0].version, 12);
        assert_eq!(brazil[0].row.school_name.as_deref(), Some("B"));
    }
}
