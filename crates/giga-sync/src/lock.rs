//! Named run locks backed by the `task_runs` uniqueness constraint.

use std::sync::Arc;

use chrono::{Duration, Utc};
use giga_core::{task_log_line, TaskRun, TaskStatus};
use giga_storage::{Store, StoreError, TaskRunStore};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// A RUNNING run with the same description younger than this suppresses new runs.
pub const RECENT_RUN_HOURS: i64 = 12;

#[derive(Debug)]
pub enum LockAcquisition {
    Acquired(TaskRun),
    /// A live run with the same name exists, whatever its status.
    AlreadyRegistered,
    /// A RUNNING run with the same description started within the recent-run window.
    RecentlyRun(TaskRun),
    /// Storage failed; the caller skips rather than risk a duplicate run.
    Unavailable(StoreError),
}

impl LockAcquisition {
    pub fn skip_reason(&self) -> Option<String> {
        match self {
            Self::Acquired(_) => None,
            Self::AlreadyRegistered => Some("already registered".to_string()),
            Self::RecentlyRun(run) => Some(format!("run {} still RUNNING since {}", run.id, run.created_at)),
            Self::Unavailable(err) => Some(format!("lock storage unavailable: {err}")),
        }
    }
}

#[derive(Clone)]
pub struct TaskLockRegistry {
    store: Arc<dyn Store>,
}

impl TaskLockRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn acquire(
        &self,
        run_id: Uuid,
        name: &str,
        description: &str,
        suppress_if_recent: bool,
    ) -> LockAcquisition {
        match self.store.find_live_task_run(name).await {
            Ok(Some(existing)) => {
                debug!(name, existing = %existing.id, "task already registered");
                return LockAcquisition::AlreadyRegistered;
            }
            Ok(None) => {}
            Err(err) => return LockAcquisition::Unavailable(err),
        }

        let now = Utc::now();
        if suppress_if_recent {
            let since = now - Duration::hours(RECENT_RUN_HOURS);
            match self.store.find_running_since(description, since).await {
                Ok(Some(recent)) => return LockAcquisition::RecentlyRun(recent),
                Ok(None) => {}
                Err(err) => return LockAcquisition::Unavailable(err),
            }
        }

        match self
            .store
            .insert_task_run(&TaskRun::running(run_id, name, description, now))
            .await
        {
            Ok(run) => LockAcquisition::Acquired(run),
            Err(StoreError::UniqueViolation(_)) => LockAcquisition::AlreadyRegistered,
            Err(err) => LockAcquisition::Unavailable(err),
        }
    }

    /// Marks the run COMPLETED. A storage failure is logged; the run stays RUNNING and
    /// needs an unlock.
    pub async fn release(&self, run: &mut TaskRun) {
        let now = Utc::now();
        if let Err(err) = self.store.complete_task_run(run.id, now).await {
            error!(run_id = %run.id, error = %err, "failed to release task lock");
            return;
        }
        run.status = TaskStatus::Completed;
        run.completed_at = Some(now);
    }

    pub async fn append_log(&self, run: &mut TaskRun, text: &str) {
        let line = task_log_line(Utc::now(), text);
        if let Err(err) = self.store.append_task_log(run.id, &line).await {
            warn!(run_id = %run.id, error = %err, "failed to persist task log line");
        }
        run.log.push_str(&line);
    }

    /// Administrative clear of a stuck run so its name can be reused.
    pub async fn unlock(&self, run_id: Uuid) -> Result<bool, StoreError> {
        self.store.soft_delete_task_run(run_id, Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use giga_storage::{MemoryStore, TaskRunStore};

    use super::*;

    fn registry() -> (Arc<MemoryStore>, TaskLockRegistry) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), TaskLockRegistry::new(store))
    }

    #[tokio::test]
    async fn concurrent_acquires_yield_one_lock() {
        let (_, locks) = registry();
        let (a, b) = tokio::join!(
            locks.acquire(Uuid::new_v4(), "sync_2024050110", "sync", false),
            locks.acquire(Uuid::new_v4(), "sync_2024050110", "sync", false),
        );
        let acquired = [&a, &b]
            .iter()
            .filter(|r| matches!(r, LockAcquisition::Acquired(_)))
            .count();
        assert_eq!(acquired, 1);
        assert!([&a, &b]
            .iter()
            .any(|r| matches!(r, LockAcquisition::AlreadyRegistered)));
    }

    #[tokio::test]
    async fn completed_names_are_not_reused() {
        let (_, locks) = registry();
        let LockAcquisition::Acquired(mut run) = locks.acquire(Uuid::new_v4(), "n", "d", false).await
        else {
            panic!("first acquire should succeed");
        };
        locks.release(&mut run).await;
        assert_eq!(run.status, TaskStatus::Completed);
        assert!(matches!(
            locks.acquire(Uuid::new_v4(), "n", "d", false).await,
            LockAcquisition::AlreadyRegistered
        ));
    }

    #[tokio::test]
    async fn recent_running_description_suppresses_unless_forced() {
        let (_, locks) = registry();
        let first = locks.acquire(Uuid::new_v4(), "job_2024050110", "job all", true).await;
        assert!(matches!(first, LockAcquisition::Acquired(_)));

        let suppressed = locks.acquire(Uuid::new_v4(), "job_2024050111", "job all", true).await;
        assert!(matches!(suppressed, LockAcquisition::RecentlyRun(_)));
        assert!(suppressed.skip_reason().is_some());

        let forced = locks.acquire(Uuid::new_v4(), "job_20240501110102", "job all", false).await;
        assert!(matches!(forced, LockAcquisition::Acquired(_)));
    }

    #[tokio::test]
    async fn running_runs_past_the_window_do_not_suppress() {
        let (store, locks) = registry();
        let stale = Utc::now() - Duration::hours(RECENT_RUN_HOURS + 1);
        store
            .insert_task_run(&TaskRun::running(Uuid::new_v4(), "job_old", "job all", stale))
            .await
            .expect("seed stale run");
        assert!(matches!(
            locks.acquire(Uuid::new_v4(), "job_new", "job all", true).await,
            LockAcquisition::Acquired(_)
        ));

        let recent = Utc::now() - Duration::hours(RECENT_RUN_HOURS - 1);
        store
            .insert_task_run(&TaskRun::running(Uuid::new_v4(), "job_mid", "job other", recent))
            .await
            .expect("seed recent run");
        assert!(matches!(
            locks.acquire(Uuid::new_v4(), "job_newer", "job other", true).await,
            LockAcquisition::RecentlyRun(_)
        ));
    }

    #[tokio::test]
    async fn storage_outage_is_reported_not_acquired() {
        let (store, locks) = registry();
        store.set_task_runs_unavailable(true);

        let result = locks.acquire(Uuid::new_v4(), "n", "d", true).await;
        assert!(matches!(result, LockAcquisition::Unavailable(StoreError::Unavailable(_))));
        assert!(result.skip_reason().is_some_and(|r| r.contains("unavailable")));

        let forced = locks.acquire(Uuid::new_v4(), "n", "d", false).await;
        assert!(matches!(forced, LockAcquisition::Unavailable(_)));
    }

    #[tokio::test]
    async fn log_lines_are_timestamped_and_persisted() {
        let (store, locks) = registry();
        let LockAcquisition::Acquired(mut run) = locks.acquire(Uuid::new_v4(), "n", "d", false).await
        else {
            panic!("acquire");
        };
        locks.append_log(&mut run, "Staged 3 rows").await;
        let stored = store.get_task_run(run.id).await.expect("read").expect("run");
        assert!(stored.log.starts_with('['));
        assert!(stored.log.ends_with("Staged 3 rows\n"));
        assert_eq!(stored.log, run.log);
    }

    #[tokio::test]
    async fn unlock_frees_the_name() {
        let (_, locks) = registry();
        let LockAcquisition::Acquired(run) = locks.acquire(Uuid::new_v4(), "stuck", "d", false).await
        else {
            panic!("acquire");
        };
        assert!(locks.unlock(run.id).await.expect("unlock"));
        assert!(matches!(
            locks.acquire(Uuid::new_v4(), "stuck", "d", false).await,
            LockAcquisition::Acquired(_)
        ));
    }
}
