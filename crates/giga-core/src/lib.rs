//! Core domain model for the Giga school master data sync.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod normalize;
mod row;

pub use normalize::{mbps_to_bps, normalize_text, parse_flag, SchoolStaticAttributes, BPS_PER_MBPS};
pub use row::{lenient, SchoolMasterRow, NATURAL_KEY_COLUMN};

/// Data-source partition. One change-feed table exists per country, keyed by ISO3 code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Country {
    pub id: i64,
    pub name: String,
    pub code: String,
    pub iso3_format: String,
    pub latest_school_master_data_version: Option<i64>,
}

/// Status a staged row carries into reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StagedStatus {
    Published,
    Deleted,
}

impl StagedStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Published => "PUBLISHED",
            Self::Deleted => "DELETED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PUBLISHED" => Some(Self::Published),
            "DELETED" => Some(Self::Deleted),
            _ => None,
        }
    }
}

/// Row-level change type reported by the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Insert,
    UpdatePreimage,
    UpdatePostimage,
    Remove,
    Delete,
    Unknown,
}

impl ChangeType {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "insert" => Self::Insert,
            "update_preimage" => Self::UpdatePreimage,
            "update_postimage" => Self::UpdatePostimage,
            "remove" => Self::Remove,
            "delete" => Self::Delete,
            _ => Self::Unknown,
        }
    }

    /// Staged status for the four change types the pipeline ingests; `None` for the rest.
    pub fn staged_status(self) -> Option<StagedStatus> {
        match self {
            Self::Insert | Self::UpdatePostimage => Some(StagedStatus::Published),
            Self::Remove | Self::Delete => Some(StagedStatus::Deleted),
            Self::UpdatePreimage | Self::Unknown => None,
        }
    }
}

/// Normalized change row ready to be staged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewStagedRow {
    pub country_id: i64,
    pub version: i64,
    pub status: StagedStatus,
    pub row: SchoolMasterRow,
}

impl NewStagedRow {
    pub fn school_id_giga(&self) -> &str {
        &self.row.school_id_giga
    }
}

/// Row sitting in the staging queue, waiting for reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedMasterRow {
    pub id: i64,
    pub country_id: i64,
    pub school_id_giga: String,
    pub version: i64,
    pub status: StagedStatus,
    pub row: SchoolMasterRow,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle tag for soft-deletable entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Active,
    Deleted,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Deleted => "deleted",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(Self::Active),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct School {
    pub id: i64,
    pub country_id: i64,
    pub giga_id_school: String,
    pub external_id: Option<String>,
    pub name: String,
    pub admin1: Option<String>,
    pub admin2: Option<String>,
    pub education_level: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub last_school_static_id: Option<i64>,
    pub status: RecordStatus,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// Denormalized school fields written by a published reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchoolUpsert {
    pub country_id: i64,
    pub giga_id_school: String,
    pub external_id: Option<String>,
    pub name: String,
    pub admin1: Option<String>,
    pub admin2: Option<String>,
    pub education_level: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl SchoolUpsert {
    pub fn from_row(country_id: i64, row: &SchoolMasterRow) -> Result<Self, RowError> {
        let giga_id_school = normalize_text(Some(&row.school_id_giga))
            .ok_or(RowError::MissingField("school_id_giga"))?;
        let name = normalize_text(row.school_name.as_deref())
            .ok_or(RowError::MissingField("school_name"))?;
        Ok(Self {
            country_id,
            giga_id_school,
            external_id: normalize_text(row.school_id_govt.as_deref()),
            name,
            admin1: normalize_text(row.admin1.as_deref()),
            admin2: normalize_text(row.admin2.as_deref()),
            education_level: normalize_text(row.education_level.as_deref()),
            latitude: row.latitude,
            longitude: row.longitude,
        })
    }
}

/// Immutable, versioned snapshot of a school's detailed attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchoolStatic {
    pub id: i64,
    pub school_id: i64,
    pub version: i64,
    pub attributes: SchoolStaticAttributes,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RowError {
    #[error("required field `{0}` is blank or missing")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Running,
    Completed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// Durable record of one run of a named background job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub status: TaskStatus,
    pub log: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl TaskRun {
    pub fn running(id: Uuid, name: impl Into<String>, description: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: name.into(),
            description: description.into(),
            status: TaskStatus::Running,
            log: String::new(),
            created_at: now,
            completed_at: None,
            deleted_at: None,
        }
    }

    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// Formats one progress line for a task run log.
pub fn task_log_line(at: DateTime<Utc>, text: &str) -> String {
    format!("[{}] {}\n", at.format("%Y-%m-%d %H:%M:%S"), text.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_types_map_to_staged_status() {
        assert_eq!(ChangeType::parse("insert").staged_status(), Some(StagedStatus::Published));
        assert_eq!(
            ChangeType::parse("UPDATE_POSTIMAGE").staged_status(),
            Some(StagedStatus::Published)
        );
        assert_eq!(ChangeType::parse("remove").staged_status(), Some(StagedStatus::Deleted));
        assert_eq!(ChangeType::parse("delete").staged_status(), Some(StagedStatus::Deleted));
        assert_eq!(ChangeType::parse("update_preimage").staged_status(), None);
        assert_eq!(ChangeType::parse("truncate"), ChangeType::Unknown);
    }

    #[test]
    fn school_upsert_requires_a_name() {
        let mut row = SchoolMasterRow::new("S1");
        row.school_name = Some("   ".into());
        assert_eq!(
            SchoolUpsert::from_row(1, &row),
            Err(RowError::MissingField("school_name"))
        );

        row.school_name = Some("Escola A".into());
        row.admin1 = Some("".into());
        let upsert = SchoolUpsert::from_row(1, &row).expect("upsert");
        assert_eq!(upsert.name, "Escola A");
        assert_eq!(upsert.admin1, None);
    }

    #[test]
    fn log_lines_are_timestamped() {
        let at = DateTime::parse_from_rfc3339("2026-10-18T09:30:00Z")
            .expect("ts")
            .with_timezone(&Utc);
        assert_eq!(task_log_line(at, "started\n"), "[2026-10-18 09:30:00] started\n");
    }
}
