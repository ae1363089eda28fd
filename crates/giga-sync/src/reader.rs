//! Fetches one country's changes since its cursor and normalizes them for staging.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use giga_adapters::{ChangeFeedSource, ChangeRecord, FeedError, TableRef};
use giga_core::{ChangeType, NewStagedRow};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub enum FeedRead {
    /// The feed has nothing past the cursor; no change data was fetched.
    UpToDate { version: i64 },
    Changes {
        version: i64,
        fetched: usize,
        rows: Vec<NewStagedRow>,
    },
}

pub struct ChangeFeedReader {
    source: Arc<dyn ChangeFeedSource>,
}

impl ChangeFeedReader {
    pub fn new(source: Arc<dyn ChangeFeedSource>) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &Arc<dyn ChangeFeedSource> {
        &self.source
    }

    /// Reads `(cursor, current]`, or a full snapshot at the current version when the
    /// country has never been synced.
    pub async fn read(
        &self,
        table: &TableRef,
        country_id: i64,
        cursor: Option<i64>,
    ) -> Result<FeedRead, FeedError> {
        let current = self.source.current_version(table).await?;
        let records = match cursor {
            Some(cursor) if cursor >= current => {
                debug!(table = %table, cursor, current, "feed up to date");
                return Ok(FeedRead::UpToDate { version: current });
            }
            Some(cursor) => self.source.changes(table, cursor + 1, current).await?,
            None => self.source.snapshot(table, current).await?,
        };
        let fetched = records.len();
        let rows = normalize_changes(records, country_id, current);
        info!(table = %table, ?cursor, version = current, fetched, normalized = rows.len(), "read change feed");
        Ok(FeedRead::Changes {
            version: current,
            fetched,
            rows,
        })
    }
}

fn change_rank(change_type: ChangeType) -> u8 {
    match change_type {
        ChangeType::UpdatePreimage => 0,
        _ => 1,
    }
}

fn by_commit(a: &ChangeRecord, b: &ChangeRecord) -> Ordering {
    (a.commit_version, a.commit_timestamp, change_rank(a.change_type)).cmp(&(
        b.commit_version,
        b.commit_timestamp,
        change_rank(b.change_type),
    ))
}

/// Orders by commit, keeps the last change per natural key, drops change types that
/// do not stage, and stamps every row with the country and the feed's new version.
pub fn normalize_changes(
    mut records: Vec<ChangeRecord>,
    country_id: i64,
    version: i64,
) -> Vec<NewStagedRow> {
    // Stable sort: unversioned rows first, preimages before their postimage.
    records.sort_by(by_commit);

    let mut last_index: HashMap<String, usize> = HashMap::with_capacity(records.len());
    for (idx, record) in records.iter().enumerate() {
        last_index.insert(record.row.school_id_giga.clone(), idx);
    }

    records
        .into_iter()
        .enumerate()
        .filter(|(idx, record)| last_index.get(&record.row.school_id_giga) == Some(idx))
        .filter_map(|(_, record)| {
            record.change_type.staged_status().map(|status| NewStagedRow {
                country_id,
                version,
                status,
                row: record.row,
            })
        })
        .collect()
}
