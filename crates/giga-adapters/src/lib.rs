//! Change-feed source contracts + the Delta Sharing and fixture implementations.

use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use giga_core::{lenient, ChangeType, SchoolMasterRow, NATURAL_KEY_COLUMN};
use giga_storage::FetchError;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

mod delta_sharing;
mod fixture;
mod parquet_rows;

pub use delta_sharing::{parse_actions, DeltaSharingClient, DeltaSharingProfile, FileAction, FileKind};
pub use fixture::{load_fixture_bundle, FixtureBundle, FixtureChangeFeed, FixtureTable};
pub use parquet_rows::{batch_to_columns, decode_parquet};

pub const CHANGE_TYPE_COLUMN: &str = "_change_type";
pub const COMMIT_VERSION_COLUMN: &str = "_commit_version";
pub const COMMIT_TIMESTAMP_COLUMN: &str = "_commit_timestamp";

/// Fully qualified `share.schema.table` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub share: String,
    pub schema: String,
    pub name: String,
}

impl TableRef {
    pub fn new(share: impl Into<String>, schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            share: share.into(),
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Country tables are named after the lowercase ISO3 code.
    pub fn iso3(&self) -> String {
        self.name.to_ascii_uppercase()
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.share, self.schema, self.name)
    }
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("share credentials expired at {0}")]
    CredentialsExpired(DateTime<Utc>),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("decoding parquet: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error("decoding arrow data: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),
    #[error("row {key}: {source}")]
    Coercion {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown table {0}")]
    UnknownTable(String),
}

/// One row-level change, already projected onto the typed row.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub commit_version: Option<i64>,
    pub commit_timestamp: Option<DateTime<Utc>>,
    pub change_type: ChangeType,
    pub row: SchoolMasterRow,
}

/// Commit metadata implied by the file a row came from, used when the row lacks its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImpliedMeta {
    pub change_type: Option<ChangeType>,
    pub version: Option<i64>,
    pub timestamp_ms: Option<i64>,
}

impl ChangeRecord {
    /// Splits commit metadata out of a decoded column map and projects the rest onto
    /// [`SchoolMasterRow`]. Rows without a natural key yield `Ok(None)`.
    pub fn from_columns(
        mut columns: Map<String, JsonValue>,
        implied: ImpliedMeta,
    ) -> Result<Option<Self>, FeedError> {
        let change_type = match columns.remove(CHANGE_TYPE_COLUMN) {
            Some(JsonValue::String(raw)) => ChangeType::parse(&raw),
            _ => implied.change_type.unwrap_or(ChangeType::Unknown),
        };
        let commit_version = match columns.remove(COMMIT_VERSION_COLUMN) {
            Some(JsonValue::Number(n)) => n.as_i64(),
            Some(JsonValue::String(s)) => s.trim().parse().ok(),
            _ => None,
        }
        .or(implied.version);
        let commit_timestamp = match columns.remove(COMMIT_TIMESTAMP_COLUMN) {
            Some(JsonValue::String(s)) => lenient::parse_timestamp(s.trim()),
            Some(JsonValue::Number(n)) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            _ => None,
        }
        .or_else(|| {
            implied
                .timestamp_ms
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        });

        let key = match columns.get(NATURAL_KEY_COLUMN) {
            Some(JsonValue::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            Some(JsonValue::Number(n)) => n.to_string(),
            _ => return Ok(None),
        };
        columns.insert(NATURAL_KEY_COLUMN.to_string(), JsonValue::String(key.clone()));

        let row: SchoolMasterRow = serde_json::from_value(JsonValue::Object(columns))
            .map_err(|source| FeedError::Coercion { key, source })?;
        Ok(Some(Self {
            commit_version,
            commit_timestamp,
            change_type,
            row,
        }))
    }
}

#[async_trait]
pub trait ChangeFeedSource: Send + Sync {
    /// Table holding the feed for one country.
    fn table_for_iso3(&self, iso3: &str) -> TableRef;

    async fn list_tables(&self) -> Result<Vec<TableRef>, FeedError>;

    async fn current_version(&self, table: &TableRef) -> Result<i64, FeedError>;

    /// Row changes committed in `from_version..=to_version`.
    async fn changes(
        &self,
        table: &TableRef,
        from_version: i64,
        to_version: i64,
    ) -> Result<Vec<ChangeRecord>, FeedError>;

    /// Full table contents at `version`, each row reported as an insert at that version.
    async fn snapshot(&self, table: &TableRef, version: i64) -> Result<Vec<ChangeRecord>, FeedError>;
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn columns(value: JsonValue) -> Map<String, JsonValue> {
        match value {
            JsonValue::Object(map) => map,
            _ => unreachable!("test helper takes objects"),
        }
    }

    #[test]
    fn commit_metadata_is_split_from_row_columns() {
        let record = ChangeRecord::from_columns(
            columns(json!({
                "_change_type": "update_postimage",
                "_commit_version": 12,
                "_commit_timestamp": "2024-05-01T00:00:00Z",
                "school_id_giga": "S1",
                "school_name": "B",
            })),
            ImpliedMeta::default(),
        )
        .expect("record")
        .expect("has key");
        assert_eq!(record.change_type, ChangeType::UpdatePostimage);
        assert_eq!(record.commit_version, Some(12));
        assert!(record.commit_timestamp.is_some());
        assert_eq!(record.row.school_name.as_deref(), Some("B"));
    }

    #[test]
    fn implied_metadata_fills_gaps() {
        let record = ChangeRecord::from_columns(
            columns(json!({ "school_id_giga": "S1" })),
            ImpliedMeta {
                change_type: Some(ChangeType::Delete),
                version: Some(7),
                timestamp_ms: Some(1_714_521_600_000),
            },
        )
        .expect("record")
        .expect("has key");
        assert_eq!(record.change_type, ChangeType::Delete);
        assert_eq!(record.commit_version, Some(7));
        assert_eq!(
            record.commit_timestamp.map(|t| t.timestamp_millis()),
            Some(1_714_521_600_000)
        );
    }

    #[test]
    fn rows_without_a_key_are_skipped() {
        let none = ChangeRecord::from_columns(
            columns(json!({ "school_id_giga": "  ", "school_name": "x" })),
            ImpliedMeta::default(),
        )
        .expect("no error");
        assert!(none.is_none());
    }

    #[test]
    fn coercion_failures_name_the_row() {
        let err = ChangeRecord::from_columns(
            columns(json!({ "school_id_giga": "S9", "num_students": "many" })),
            ImpliedMeta::default(),
        )
        .expect_err("bad count");
        assert!(err.to_string().starts_with("row S9"));
    }

    #[test]
    fn table_refs_render_as_dotted_paths() {
        let table = TableRef::new("gold", "school-master", "bra");
        assert_eq!(table.to_string(), "gold.school-master.bra");
        assert_eq!(table.iso3(), "BRA");
    }
}
