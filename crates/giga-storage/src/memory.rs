//! In-process backend with the same constraint semantics as the Postgres schema.
//!
//! Used for dry runs against fixture feeds and as the test double for the pipeline.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use giga_core::{
    Country, NewStagedRow, RecordStatus, School, SchoolStatic, StagedMasterRow, StagedStatus,
    TaskRun, TaskStatus,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::store::{
    CountryStore, DeletedChange, DeletedOutcome, PublishedChange, PublishedOutcome, SchoolStore,
    StagingStore, StoreError, StoreResult, TaskRunStore,
};

#[derive(Debug, Default)]
struct MemoryState {
    countries: BTreeMap<i64, Country>,
    staged: BTreeMap<i64, StagedMasterRow>,
    schools: BTreeMap<i64, School>,
    statics: BTreeMap<i64, SchoolStatic>,
    task_runs: Vec<TaskRun>,
    sequence: i64,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.sequence += 1;
        self.sequence
    }

    fn active_school_mut(&mut self, country_id: i64, giga_id_school: &str) -> Option<&mut School> {
        self.schools.values_mut().find(|s| {
            s.country_id == country_id
                && s.giga_id_school == giga_id_school
                && s.status == RecordStatus::Active
        })
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    task_runs_down: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a country the way external provisioning would.
    pub async fn add_country(&self, name: &str, code: &str, iso3: &str) -> Country {
        let mut state = self.state.lock().await;
        let id = state.next_id();
        let country = Country {
            id,
            name: name.to_string(),
            code: code.to_string(),
            iso3_format: iso3.to_string(),
            latest_school_master_data_version: None,
        };
        state.countries.insert(id, country.clone());
        country
    }

    pub async fn staged_rows(&self) -> Vec<StagedMasterRow> {
        self.state.lock().await.staged.values().cloned().collect()
    }

    /// While set, every task run operation fails with [`StoreError::Unavailable`].
    pub fn set_task_runs_unavailable(&self, down: bool) {
        self.task_runs_down.store(down, Ordering::SeqCst);
    }

    fn task_runs_reachable(&self) -> StoreResult<()> {
        if self.task_runs_down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("task_runs".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskRunStore for MemoryStore {
    async fn find_live_task_run(&self, name: &str) -> StoreResult<Option<TaskRun>> {
        self.task_runs_reachable()?;
        let state = self.state.lock().await;
        Ok(state
            .task_runs
            .iter()
            .filter(|r| r.name == name && r.is_live())
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn find_running_since(
        &self,
        description: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Option<TaskRun>> {
        self.task_runs_reachable()?;
        let state = self.state.lock().await;
        Ok(state
            .task_runs
            .iter()
            .filter(|r| {
                r.description == description
                    && r.status == TaskStatus::Running
                    && r.is_live()
                    && r.created_at >= since
            })
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn insert_task_run(&self, run: &TaskRun) -> StoreResult<TaskRun> {
        self.task_runs_reachable()?;
        let mut state = self.state.lock().await;
        let clash = run.is_live()
            && state.task_runs.iter().any(|r| r.is_live() && r.name == run.name);
        if clash || state.task_runs.iter().any(|r| r.id == run.id) {
            return Err(StoreError::UniqueViolation("task_runs_live_name".into()));
        }
        state.task_runs.push(run.clone());
        Ok(run.clone())
    }

    async fn complete_task_run(&self, id: Uuid, completed_at: DateTime<Utc>) -> StoreResult<()> {
        self.task_runs_reachable()?;
        let mut state = self.state.lock().await;
        if let Some(run) = state.task_runs.iter_mut().find(|r| r.id == id) {
            run.status = TaskStatus::Completed;
            run.completed_at = Some(completed_at);
        }
        Ok(())
    }

    async fn append_task_log(&self, id: Uuid, line: &str) -> StoreResult<()> {
        self.task_runs_reachable()?;
        let mut state = self.state.lock().await;
        if let Some(run) = state.task_runs.iter_mut().find(|r| r.id == id) {
            run.log.push_str(line);
        }
        Ok(())
    }

    async fn get_task_run(&self, id: Uuid) -> StoreResult<Option<TaskRun>> {
        self.task_runs_reachable()?;
        let state = self.state.lock().await;
        Ok(state.task_runs.iter().find(|r| r.id == id).cloned())
    }

    async fn list_task_runs(&self, limit: i64) -> StoreResult<Vec<TaskRun>> {
        self.task_runs_reachable()?;
        let state = self.state.lock().await;
        let mut runs = state.task_runs.clone();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs.truncate(limit.max(1) as usize);
        Ok(runs)
    }

    async fn soft_delete_task_run(&self, id: Uuid, deleted_at: DateTime<Utc>) -> StoreResult<bool> {
        self.task_runs_reachable()?;
        let mut state = self.state.lock().await;
        match state.task_runs.iter_mut().find(|r| r.id == id && r.is_live()) {
            Some(run) => {
                run.deleted_at = Some(deleted_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl CountryStore for MemoryStore {
    async fn find_country_by_iso3(&self, iso3: &str) -> StoreResult<Option<Country>> {
        let state = self.state.lock().await;
        Ok(state
            .countries
            .values()
            .find(|c| c.iso3_format.eq_ignore_ascii_case(iso3.trim()))
            .cloned())
    }

    async fn get_country(&self, id: i64) -> StoreResult<Option<Country>> {
        Ok(self.state.lock().await.countries.get(&id).cloned())
    }

    async fn set_school_master_version(&self, country_id: i64, version: i64) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if let Some(country) = state.countries.get_mut(&country_id) {
            country.latest_school_master_data_version = Some(version);
        }
        Ok(())
    }
}

#[async_trait]
impl StagingStore for MemoryStore {
    async fn insert_staged(&self, rows: &[NewStagedRow]) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        for row in rows {
            let id = state.next_id();
            state.staged.insert(
                id,
                StagedMasterRow {
                    id,
                    country_id: row.country_id,
                    school_id_giga: row.school_id_giga().to_string(),
                    version: row.version,
                    status: row.status,
                    row: row.row.clone(),
                    created_at: now,
                },
            );
        }
        Ok(rows.len() as u64)
    }

    async fn staged_chunk(
        &self,
        status: StagedStatus,
        countries: Option<&[i64]>,
        after_id: i64,
        limit: i64,
    ) -> StoreResult<Vec<StagedMasterRow>> {
        let state = self.state.lock().await;
        Ok(state
            .staged
            .range((after_id + 1)..)
            .map(|(_, row)| row)
            .filter(|row| row.status == status)
            .filter(|row| countries.map_or(true, |ids| ids.contains(&row.country_id)))
            .take(limit.max(1) as usize)
            .cloned()
            .collect())
    }

    async fn delete_superseded_staged(&self, countries: Option<&[i64]>) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        let mut keep: HashMap<(i64, String), (i64, DateTime<Utc>, i64)> = HashMap::new();
        for row in state.staged.values() {
            if !countries.map_or(true, |ids| ids.contains(&row.country_id)) {
                continue;
            }
            let rank = (row.version, row.created_at, row.id);
            keep.entry((row.country_id, row.school_id_giga.clone()))
                .and_modify(|best| {
                    if rank > *best {
                        *best = rank;
                    }
                })
                .or_insert(rank);
        }
        let before = state.staged.len();
        state.staged.retain(|id, row| {
            match keep.get(&(row.country_id, row.school_id_giga.clone())) {
                Some(best) => best.2 == *id,
                None => true,
            }
        });
        Ok((before - state.staged.len()) as u64)
    }

    async fn count_staged(&self, country_id: Option<i64>) -> StoreResult<i64> {
        let state = self.state.lock().await;
        Ok(state
            .staged
            .values()
            .filter(|row| country_id.map_or(true, |id| row.country_id == id))
            .count() as i64)
    }
}

#[async_trait]
impl SchoolStore for MemoryStore {
    async fn apply_published(&self, change: &PublishedChange) -> StoreResult<PublishedOutcome> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let upsert = &change.school;

        let existing = state
            .active_school_mut(upsert.country_id, &upsert.giga_id_school)
            .map(|school| {
                school.external_id = upsert.external_id.clone();
                school.name = upsert.name.clone();
                school.admin1 = upsert.admin1.clone();
                school.admin2 = upsert.admin2.clone();
                school.education_level = upsert.education_level.clone();
                school.latitude = upsert.latitude;
                school.longitude = upsert.longitude;
                school.modified_at = now;
                school.id
            });
        let (school_id, school_created) = match existing {
            Some(id) => (id, false),
            None => {
                let id = state.next_id();
                state.schools.insert(
                    id,
                    School {
                        id,
                        country_id: upsert.country_id,
                        giga_id_school: upsert.giga_id_school.clone(),
                        external_id: upsert.external_id.clone(),
                        name: upsert.name.clone(),
                        admin1: upsert.admin1.clone(),
                        admin2: upsert.admin2.clone(),
                        education_level: upsert.education_level.clone(),
                        latitude: upsert.latitude,
                        longitude: upsert.longitude,
                        last_school_static_id: None,
                        status: RecordStatus::Active,
                        deleted_at: None,
                        created_at: now,
                        modified_at: now,
                    },
                );
                (id, true)
            }
        };

        let existing_static = state
            .statics
            .values()
            .find(|s| s.school_id == school_id && s.version == change.version)
            .map(|s| s.id);
        let (static_id, static_created) = match existing_static {
            Some(id) => (id, false),
            None => {
                let id = state.next_id();
                state.statics.insert(
                    id,
                    SchoolStatic {
                        id,
                        school_id,
                        version: change.version,
                        attributes: change.attributes.clone(),
                        created_at: now,
                    },
                );
                if let Some(school) = state.schools.get_mut(&school_id) {
                    school.last_school_static_id = Some(id);
                }
                (id, true)
            }
        };

        state.staged.remove(&change.staged_id);
        Ok(PublishedOutcome {
            school_id,
            school_created,
            static_id,
            static_created,
        })
    }

    async fn apply_deleted(&self, change: &DeletedChange) -> StoreResult<DeletedOutcome> {
        let mut state = self.state.lock().await;
        let school_id = state
            .active_school_mut(change.country_id, &change.giga_id_school)
            .map(|school| {
                school.status = RecordStatus::Deleted;
                school.deleted_at = Some(change.deleted_at);
                school.modified_at = change.deleted_at;
                school.id
            });
        state.staged.remove(&change.staged_id);
        Ok(DeletedOutcome { school_id })
    }

    async fn find_schools(&self, country_id: i64, giga_id_school: &str) -> StoreResult<Vec<School>> {
        let state = self.state.lock().await;
        Ok(state
            .schools
            .values()
            .filter(|s| s.country_id == country_id && s.giga_id_school == giga_id_school)
            .cloned()
            .collect())
    }

    async fn school_statics(&self, school_id: i64) -> StoreResult<Vec<SchoolStatic>> {
        let state = self.state.lock().await;
        let mut statics: Vec<_> = state
            .statics
            .values()
            .filter(|s| s.school_id == school_id)
            .cloned()
            .collect();
        statics.sort_by_key(|s| s.version);
        Ok(statics)
    }
}
