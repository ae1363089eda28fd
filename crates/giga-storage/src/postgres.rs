//! PostgreSQL backend.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use giga_core::{
    Country, NewStagedRow, RecordStatus, School, SchoolMasterRow, SchoolStatic,
    SchoolStaticAttributes, StagedMasterRow, StagedStatus, TaskRun, TaskStatus,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::debug;
use uuid::Uuid;

use crate::store::{
    CountryStore, DeletedChange, DeletedOutcome, PublishedChange, PublishedOutcome, SchoolStore,
    StagingStore, StoreError, StoreResult, TaskRunStore,
};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, config: PoolConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

/// Reported when a live run already holds the name.
const LIVE_NAME_CONSTRAINT: &str = "task_runs_live_name";

const TASK_RUN_COLUMNS: &str =
    "id, name, description, status, log, created_at, completed_at, deleted_at";

fn task_run_from_row(row: &PgRow) -> StoreResult<TaskRun> {
    let status: String = row.try_get("status")?;
    Ok(TaskRun {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        status: TaskStatus::parse(&status)
            .ok_or_else(|| StoreError::Invalid(format!("task run status {status:?}")))?,
        log: row.try_get("log")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

fn country_from_row(row: &PgRow) -> StoreResult<Country> {
    Ok(Country {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        code: row.try_get("code")?,
        iso3_format: row.try_get("iso3_format")?,
        latest_school_master_data_version: row.try_get("latest_school_master_data_version")?,
    })
}

fn staged_from_row(row: &PgRow) -> StoreResult<StagedMasterRow> {
    let status: String = row.try_get("status")?;
    let Json(data): Json<SchoolMasterRow> = row.try_get("data")?;
    Ok(StagedMasterRow {
        id: row.try_get("id")?,
        country_id: row.try_get("country_id")?,
        school_id_giga: row.try_get("school_id_giga")?,
        version: row.try_get("version")?,
        status: StagedStatus::parse(&status)
            .ok_or_else(|| StoreError::Invalid(format!("staged row status {status:?}")))?,
        row: data,
        created_at: row.try_get("created_at")?,
    })
}

fn school_from_row(row: &PgRow) -> StoreResult<School> {
    let status: String = row.try_get("status")?;
    Ok(School {
        id: row.try_get("id")?,
        country_id: row.try_get("country_id")?,
        giga_id_school: row.try_get("giga_id_school")?,
        external_id: row.try_get("external_id")?,
        name: row.try_get("name")?,
        admin1: row.try_get("admin1")?,
        admin2: row.try_get("admin2")?,
        education_level: row.try_get("education_level")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        last_school_static_id: row.try_get("last_school_static_id")?,
        status: RecordStatus::parse(&status)
            .ok_or_else(|| StoreError::Invalid(format!("school status {status:?}")))?,
        deleted_at: row.try_get("deleted_at")?,
        created_at: row.try_get("created_at")?,
        modified_at: row.try_get("modified_at")?,
    })
}

#[async_trait]
impl TaskRunStore for PgStore {
    async fn find_live_task_run(&self, name: &str) -> StoreResult<Option<TaskRun>> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_RUN_COLUMNS} FROM task_runs
              WHERE name = $1 AND deleted_at IS NULL
              ORDER BY created_at DESC
              LIMIT 1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(task_run_from_row).transpose()
    }

    async fn find_running_since(
        &self,
        description: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Option<TaskRun>> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_RUN_COLUMNS} FROM task_runs
              WHERE description = $1
                AND status = 'RUNNING'
                AND deleted_at IS NULL
                AND created_at >= $2
              ORDER BY created_at DESC
              LIMIT 1"
        ))
        .bind(description)
        .bind(since)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(task_run_from_row).transpose()
    }

    async fn insert_task_run(&self, run: &TaskRun) -> StoreResult<TaskRun> {
        let mut tx = self.pool.begin().await?;
        // Held until commit, so the existence check and the insert see the same state.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&run.name)
            .execute(&mut *tx)
            .await?;
        if run.is_live() {
            let taken: bool = sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM task_runs WHERE name = $1 AND deleted_at IS NULL)",
            )
            .bind(&run.name)
            .fetch_one(&mut *tx)
            .await?;
            if taken {
                return Err(StoreError::UniqueViolation(LIVE_NAME_CONSTRAINT.to_string()));
            }
        }

        let row = sqlx::query(&format!(
            "INSERT INTO task_runs ({TASK_RUN_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING {TASK_RUN_COLUMNS}"
        ))
        .bind(run.id)
        .bind(&run.name)
        .bind(&run.description)
        .bind(run.status.as_str())
        .bind(&run.log)
        .bind(run.created_at)
        .bind(run.completed_at)
        .bind(run.deleted_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(StoreError::from_sqlx)?;
        tx.commit().await?;
        task_run_from_row(&row)
    }

    async fn complete_task_run(&self, id: Uuid, completed_at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE task_runs
               SET status = 'COMPLETED',
                   completed_at = $2
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(completed_at)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)?;
        Ok(())
    }

    async fn append_task_log(&self, id: Uuid, line: &str) -> StoreResult<()> {
        sqlx::query("UPDATE task_runs SET log = log || $2 WHERE id = $1")
            .bind(id)
            .bind(line)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_task_run(&self, id: Uuid) -> StoreResult<Option<TaskRun>> {
        let row = sqlx::query(&format!("SELECT {TASK_RUN_COLUMNS} FROM task_runs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_run_from_row).transpose()
    }

    async fn list_task_runs(&self, limit: i64) -> StoreResult<Vec<TaskRun>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_RUN_COLUMNS} FROM task_runs ORDER BY created_at DESC LIMIT $1"
        ))
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_run_from_row).collect()
    }

    async fn soft_delete_task_run(&self, id: Uuid, deleted_at: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE task_runs SET deleted_at = $2 WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(deleted_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl CountryStore for PgStore {
    async fn find_country_by_iso3(&self, iso3: &str) -> StoreResult<Option<Country>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, code, iso3_format, latest_school_master_data_version
              FROM countries
             WHERE UPPER(iso3_format) = UPPER($1)
            "#,
        )
        .bind(iso3.trim())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(country_from_row).transpose()
    }

    async fn get_country(&self, id: i64) -> StoreResult<Option<Country>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, code, iso3_format, latest_school_master_data_version
              FROM countries
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(country_from_row).transpose()
    }

    async fn set_school_master_version(&self, country_id: i64, version: i64) -> StoreResult<()> {
        sqlx::query("UPDATE countries SET latest_school_master_data_version = $2 WHERE id = $1")
            .bind(country_id)
            .bind(version)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StagingStore for PgStore {
    async fn insert_staged(&self, rows: &[NewStagedRow]) -> StoreResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO school_master_staging (country_id, school_id_giga, version, status, data) ",
        );
        qb.push_values(rows, |mut b, row| {
            b.push_bind(row.country_id)
                .push_bind(row.school_id_giga().to_string())
                .push_bind(row.version)
                .push_bind(row.status.as_str())
                .push_bind(Json(row.row.clone()));
        });
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn staged_chunk(
        &self,
        status: StagedStatus,
        countries: Option<&[i64]>,
        after_id: i64,
        limit: i64,
    ) -> StoreResult<Vec<StagedMasterRow>> {
        let rows = sqlx::query(
            r#"
            SELECT id, country_id, school_id_giga, version, status, data, created_at
              FROM school_master_staging
             WHERE status = $1
               AND id > $2
               AND ($3::BIGINT[] IS NULL OR country_id = ANY($3))
             ORDER BY id
             LIMIT $4
            "#,
        )
        .bind(status.as_str())
        .bind(after_id)
        .bind(countries.map(<[i64]>::to_vec))
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(staged_from_row).collect()
    }

    async fn delete_superseded_staged(&self, countries: Option<&[i64]>) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM school_master_staging s
             USING (
                   SELECT id,
                          ROW_NUMBER() OVER (
                              PARTITION BY country_id, school_id_giga
                              ORDER BY version DESC, created_at DESC, id DESC
                          ) AS rank
                     FROM school_master_staging
                    WHERE ($1::BIGINT[] IS NULL OR country_id = ANY($1))
                   ) ranked
             WHERE s.id = ranked.id
               AND ranked.rank > 1
            "#,
        )
        .bind(countries.map(<[i64]>::to_vec))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn count_staged(&self, country_id: Option<i64>) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM school_master_staging WHERE ($1::BIGINT IS NULL OR country_id = $1)",
        )
        .bind(country_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

#[async_trait]
impl SchoolStore for PgStore {
    async fn apply_published(&self, change: &PublishedChange) -> StoreResult<PublishedOutcome> {
        let school = &change.school;
        let mut tx = self.pool.begin().await?;

        // xmax = 0 only for freshly inserted tuples.
        let (school_id, school_created): (i64, bool) = sqlx::query_as(
            r#"
            INSERT INTO schools (
                country_id, giga_id_school, external_id, name, admin1, admin2,
                education_level, latitude, longitude, status, created_at, modified_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'active', NOW(), NOW())
            ON CONFLICT (country_id, giga_id_school) WHERE status = 'active'
            DO UPDATE SET external_id = EXCLUDED.external_id,
                          name = EXCLUDED.name,
                          admin1 = EXCLUDED.admin1,
                          admin2 = EXCLUDED.admin2,
                          education_level = EXCLUDED.education_level,
                          latitude = EXCLUDED.latitude,
                          longitude = EXCLUDED.longitude,
                          modified_at = NOW()
            RETURNING id, (xmax = 0) AS inserted
            "#,
        )
        .bind(school.country_id)
        .bind(&school.giga_id_school)
        .bind(&school.external_id)
        .bind(&school.name)
        .bind(&school.admin1)
        .bind(&school.admin2)
        .bind(&school.education_level)
        .bind(school.latitude)
        .bind(school.longitude)
        .fetch_one(&mut *tx)
        .await
        .map_err(StoreError::from_sqlx)?;

        let inserted: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO school_statics (school_id, version, attributes, created_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (school_id, version) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(school_id)
        .bind(change.version)
        .bind(Json(&change.attributes))
        .fetch_optional(&mut *tx)
        .await
        .map_err(StoreError::from_sqlx)?;

        let (static_id, static_created) = match inserted {
            Some((static_id,)) => {
                sqlx::query(
                    "UPDATE schools SET last_school_static_id = $2, modified_at = NOW() WHERE id = $1",
                )
                .bind(school_id)
                .bind(static_id)
                .execute(&mut *tx)
                .await?;
                (static_id, true)
            }
            None => {
                let static_id: i64 = sqlx::query_scalar(
                    "SELECT id FROM school_statics WHERE school_id = $1 AND version = $2",
                )
                .bind(school_id)
                .bind(change.version)
                .fetch_one(&mut *tx)
                .await?;
                (static_id, false)
            }
        };

        sqlx::query("DELETE FROM school_master_staging WHERE id = $1")
            .bind(change.staged_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(
            staged_id = change.staged_id,
            school_id, school_created, static_id, static_created, "applied published row"
        );
        Ok(PublishedOutcome {
            school_id,
            school_created,
            static_id,
            static_created,
        })
    }

    async fn apply_deleted(&self, change: &DeletedChange) -> StoreResult<DeletedOutcome> {
        let mut tx = self.pool.begin().await?;
        let school_id: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE schools
               SET status = 'deleted',
                   deleted_at = $3,
                   modified_at = NOW()
             WHERE country_id = $1
               AND giga_id_school = $2
               AND status = 'active'
            RETURNING id
            "#,
        )
        .bind(change.country_id)
        .bind(&change.giga_id_school)
        .bind(change.deleted_at)
        .fetch_optional(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM school_master_staging WHERE id = $1")
            .bind(change.staged_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(DeletedOutcome { school_id })
    }

    async fn find_schools(&self, country_id: i64, giga_id_school: &str) -> StoreResult<Vec<School>> {
        let rows = sqlx::query(
            r#"
            SELECT id, country_id, giga_id_school, external_id, name, admin1, admin2,
                   education_level, latitude, longitude, last_school_static_id, status,
                   deleted_at, created_at, modified_at
              FROM schools
             WHERE country_id = $1 AND giga_id_school = $2
             ORDER BY id
            "#,
        )
        .bind(country_id)
        .bind(giga_id_school)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(school_from_row).collect()
    }

    async fn school_statics(&self, school_id: i64) -> StoreResult<Vec<SchoolStatic>> {
        let rows = sqlx::query(
            r#"
            SELECT id, school_id, version, attributes, created_at
              FROM school_statics
             WHERE school_id = $1
             ORDER BY version
            "#,
        )
        .bind(school_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> StoreResult<SchoolStatic> {
                let Json(attributes): Json<SchoolStaticAttributes> = row.try_get("attributes")?;
                Ok(SchoolStatic {
                    id: row.try_get("id")?,
                    school_id: row.try_get("school_id")?,
                    version: row.try_get("version")?,
                    attributes,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}
