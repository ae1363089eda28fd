//! Storage contracts shared by the Postgres and in-process backends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use giga_core::{
    Country, NewStagedRow, School, SchoolStatic, SchoolStaticAttributes, SchoolUpsert,
    StagedMasterRow, StagedStatus, TaskRun,
};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("unique constraint `{0}` violated")]
    UniqueViolation(String),
    #[error("invalid stored value: {0}")]
    Invalid(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Maps a Postgres `unique_violation` (SQLSTATE 23505) to [`StoreError::UniqueViolation`].
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.code().as_deref() == Some("23505") {
                let constraint = db_err.constraint().unwrap_or("unknown").to_string();
                return Self::UniqueViolation(constraint);
            }
        }
        Self::Database(err)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Work order for reconciling one PUBLISHED staged row.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedChange {
    pub staged_id: i64,
    pub school: SchoolUpsert,
    pub version: i64,
    pub attributes: SchoolStaticAttributes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishedOutcome {
    pub school_id: i64,
    pub school_created: bool,
    pub static_id: i64,
    pub static_created: bool,
}

/// Work order for reconciling one DELETED staged row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedChange {
    pub staged_id: i64,
    pub country_id: i64,
    pub giga_id_school: String,
    pub deleted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletedOutcome {
    pub school_id: Option<i64>,
}

#[async_trait]
pub trait TaskRunStore: Send + Sync {
    /// Latest non-deleted run registered under `name`, whatever its status.
    async fn find_live_task_run(&self, name: &str) -> StoreResult<Option<TaskRun>>;

    /// A non-deleted RUNNING run with this description created at or after `since`.
    async fn find_running_since(
        &self,
        description: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Option<TaskRun>>;

    /// Inserts a run. Fails with [`StoreError::UniqueViolation`] when a live run with the
    /// same name already exists, whatever its status. The existence check and the insert
    /// are serialized per name.
    async fn insert_task_run(&self, run: &TaskRun) -> StoreResult<TaskRun>;

    async fn complete_task_run(&self, id: Uuid, completed_at: DateTime<Utc>) -> StoreResult<()>;

    async fn append_task_log(&self, id: Uuid, line: &str) -> StoreResult<()>;

    async fn get_task_run(&self, id: Uuid) -> StoreResult<Option<TaskRun>>;

    async fn list_task_runs(&self, limit: i64) -> StoreResult<Vec<TaskRun>>;

    /// Returns whether a live run was marked deleted.
    async fn soft_delete_task_run(&self, id: Uuid, deleted_at: DateTime<Utc>) -> StoreResult<bool>;
}

#[async_trait]
pub trait CountryStore: Send + Sync {
    async fn find_country_by_iso3(&self, iso3: &str) -> StoreResult<Option<Country>>;

    async fn get_country(&self, id: i64) -> StoreResult<Option<Country>>;

    async fn set_school_master_version(&self, country_id: i64, version: i64) -> StoreResult<()>;
}

#[async_trait]
pub trait StagingStore: Send + Sync {
    async fn insert_staged(&self, rows: &[NewStagedRow]) -> StoreResult<u64>;

    /// Next page of staged rows with `id > after_id`, ordered by id.
    async fn staged_chunk(
        &self,
        status: StagedStatus,
        countries: Option<&[i64]>,
        after_id: i64,
        limit: i64,
    ) -> StoreResult<Vec<StagedMasterRow>>;

    /// Keeps only the highest `(version, created_at)` staged row per country and natural key.
    async fn delete_superseded_staged(&self, countries: Option<&[i64]>) -> StoreResult<u64>;

    async fn count_staged(&self, country_id: Option<i64>) -> StoreResult<i64>;
}

#[async_trait]
pub trait SchoolStore: Send + Sync {
    /// Atomically upserts the school, creates-or-fetches the `(school, version)` snapshot,
    /// repoints the school at a newly created snapshot and consumes the staged row.
    async fn apply_published(&self, change: &PublishedChange) -> StoreResult<PublishedOutcome>;

    /// Atomically soft-deletes the active school for the key, if any, and consumes the
    /// staged row.
    async fn apply_deleted(&self, change: &DeletedChange) -> StoreResult<DeletedOutcome>;

    /// Every school ever created for the key, oldest first.
    async fn find_schools(&self, country_id: i64, giga_id_school: &str) -> StoreResult<Vec<School>>;

    async fn school_statics(&self, school_id: i64) -> StoreResult<Vec<SchoolStatic>>;
}

/// Everything the sync pipeline needs from storage.
pub trait Store: TaskRunStore + CountryStore + StagingStore + SchoolStore {}

impl<T> Store for T where T: TaskRunStore + CountryStore + StagingStore + SchoolStore {}
