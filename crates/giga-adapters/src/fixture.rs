//! File-backed change feed used for offline runs and tests.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use giga_core::{ChangeType, StagedStatus};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::{read_json_file, ChangeFeedSource, ChangeRecord, FeedError, ImpliedMeta, TableRef};

const FIXTURE_SHARE: &str = "fixture";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub fixture_id: String,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    pub tables: Vec<FixtureTable>,
}

/// One country table: its current version and every change row, carrying the
/// `_change_type`, `_commit_version` and `_commit_timestamp` columns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureTable {
    pub name: String,
    pub current_version: i64,
    #[serde(default)]
    pub changes: Vec<Map<String, JsonValue>>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    read_json_file(path)
}

#[derive(Debug, Default)]
struct FixtureState {
    bundle: FixtureBundle,
    failing: HashSet<String>,
}

/// Serves a [`FixtureBundle`] through [`ChangeFeedSource`]. Table data can be edited
/// between runs, and `fetch_count` counts change/snapshot reads.
#[derive(Debug, Default)]
pub struct FixtureChangeFeed {
    state: Mutex<FixtureState>,
    fetches: AtomicUsize,
}

impl FixtureChangeFeed {
    pub fn new(bundle: FixtureBundle) -> Self {
        Self {
            state: Mutex::new(FixtureState {
                bundle,
                failing: HashSet::new(),
            }),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load_fixture_bundle(path)?))
    }

    fn lock(&self) -> MutexGuard<'_, FixtureState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Appends a change row and raises the table version to at least `version`.
    pub fn push_change(&self, table: &str, version: i64, mut columns: Map<String, JsonValue>) {
        columns.insert(crate::COMMIT_VERSION_COLUMN.to_string(), version.into());
        let mut state = self.lock();
        let tables = &mut state.bundle.tables;
        let idx = match tables.iter().position(|t| t.name.eq_ignore_ascii_case(table)) {
            Some(idx) => idx,
            None => {
                tables.push(FixtureTable {
                    name: table.to_ascii_lowercase(),
                    ..FixtureTable::default()
                });
                tables.len() - 1
            }
        };
        let entry = &mut tables[idx];
        entry.current_version = entry.current_version.max(version);
        entry.changes.push(columns);
    }

    /// Makes every read of `table` fail until cleared.
    pub fn set_failing(&self, table: &str, failing: bool) {
        let mut state = self.lock();
        let name = table.to_ascii_lowercase();
        if failing {
            state.failing.insert(name);
        } else {
            state.failing.remove(&name);
        }
    }

    fn table(&self, table: &TableRef) -> Result<FixtureTable, FeedError> {
        let state = self.lock();
        let name = table.name.to_ascii_lowercase();
        if state.failing.contains(&name) {
            return Err(FeedError::Protocol(format!("{table}: injected failure")));
        }
        state
            .bundle
            .tables
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(&name))
            .cloned()
            .ok_or_else(|| FeedError::UnknownTable(table.to_string()))
    }

    fn share_schema(&self) -> String {
        self.lock()
            .bundle
            .schema
            .clone()
            .unwrap_or_else(|| "school-master".to_string())
    }
}

fn decode_all(table: FixtureTable) -> Result<Vec<ChangeRecord>, FeedError> {
    let mut records = Vec::with_capacity(table.changes.len());
    for columns in table.changes {
        if let Some(record) = ChangeRecord::from_columns(columns, ImpliedMeta::default())? {
            records.push(record);
        }
    }
    Ok(records)
}

#[async_trait]
impl ChangeFeedSource for FixtureChangeFeed {
    fn table_for_iso3(&self, iso3: &str) -> TableRef {
        TableRef::new(FIXTURE_SHARE, self.share_schema(), iso3.trim().to_ascii_lowercase())
    }

    async fn list_tables(&self) -> Result<Vec<TableRef>, FeedError> {
        let schema = self.share_schema();
        Ok(self
            .lock()
            .bundle
            .tables
            .iter()
            .map(|t| TableRef::new(FIXTURE_SHARE, schema.clone(), t.name.to_ascii_lowercase()))
            .collect())
    }

    async fn current_version(&self, table: &TableRef) -> Result<i64, FeedError> {
        Ok(self.table(table)?.current_version)
    }

    async fn changes(
        &self,
        table: &TableRef,
        from_version: i64,
        to_version: i64,
    ) -> Result<Vec<ChangeRecord>, FeedError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let records = decode_all(self.table(table)?)?;
        Ok(records
            .into_iter()
            .filter(|r| {
                r.commit_version
                    .is_some_and(|v| v >= from_version && v <= to_version)
            })
            .collect())
    }

    async fn snapshot(&self, table: &TableRef, version: i64) -> Result<Vec<ChangeRecord>, FeedError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let mut records: Vec<_> = decode_all(self.table(table)?)?
            .into_iter()
            .filter(|r| r.commit_version.unwrap_or(i64::MIN) <= version)
            .collect();
        records.sort_by_key(|r| (r.commit_version, r.commit_timestamp));

        let mut live = BTreeMap::new();
        for record in records {
            match record.change_type.staged_status() {
                Some(StagedStatus::Published) => {
                    live.insert(record.row.school_id_giga.clone(), record.row);
                }
                Some(StagedStatus::Deleted) => {
                    live.remove(&record.row.school_id_giga);
                }
                None => {}
            }
        }
        Ok(live
            .into_values()
            .map(|row| ChangeRecord {
                commit_version: Some(version),
                commit_timestamp: None,
                change_type: ChangeType::Insert,
                row,
            })
            .collect())
    }
}
