//! Read-mostly status API over sync runs and per-country cursors.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Path, Query},
    http::{request::Parts, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use giga_core::TaskRun;
use giga_storage::{
    CountryStore, PgStore, PoolConfig, StagingStore, Store, StoreError, TaskRunStore,
};
use giga_sync::{SyncConfig, TaskLockRegistry};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

/// Request header that forces a read onto the primary database.
pub const DB_ROUTE_HEADER: &str = "x-db-route";

const DEFAULT_RUN_LIMIT: i64 = 20;
const MAX_RUN_LIMIT: i64 = 500;

#[derive(Clone)]
pub struct AppState {
    pub primary: Arc<dyn Store>,
    pub replica: Option<Arc<dyn Store>>,
}

impl AppState {
    pub fn new(primary: Arc<dyn Store>, replica: Option<Arc<dyn Store>>) -> Self {
        Self { primary, replica }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DbRoute {
    Primary,
    Replica,
}

/// Safe methods read from the replica unless the caller asks for the primary.
pub fn route_for(method: &Method, headers: &HeaderMap) -> DbRoute {
    let forced_primary = headers
        .get(DB_ROUTE_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("primary"));
    let safe = *method == Method::GET || *method == Method::HEAD || *method == Method::OPTIONS;
    if safe && !forced_primary {
        DbRoute::Replica
    } else {
        DbRoute::Primary
    }
}

/// Database handle chosen for one request. It lives in the request's extractor value
/// and is dropped with it.
pub struct RequestDb {
    pub route: DbRoute,
    pub store: Arc<dyn Store>,
}

impl FromRequestParts<Arc<AppState>> for RequestDb {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let wanted = route_for(&parts.method, &parts.headers);
        Ok(match (wanted, &state.replica) {
            (DbRoute::Replica, Some(replica)) => Self {
                route: DbRoute::Replica,
                store: replica.clone(),
            },
            _ => Self {
                route: DbRoute::Primary,
                store: state.primary.clone(),
            },
        })
    }
}

#[derive(Debug)]
enum ApiError {
    NotFound(String),
    Store(StoreError),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::NotFound(what) => {
                (StatusCode::NOT_FOUND, Json(json!({ "error": format!("{what} not found") })))
                    .into_response()
            }
            Self::Store(err) => {
                error!(error = %err, "status api storage error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": err.to_string() })),
                )
                    .into_response()
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RunsQuery {
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct SyncStatus {
    pub country_id: i64,
    pub iso3: String,
    pub name: String,
    pub version: Option<i64>,
    pub staged_rows: i64,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/task-runs", get(task_runs_handler))
        .route("/api/task-runs/{id}", get(task_run_handler))
        .route("/api/task-runs/{id}/unlock", post(unlock_handler))
        .route("/api/countries/{iso3}/sync-status", get(sync_status_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &SyncConfig) -> anyhow::Result<()> {
    let primary = PgStore::connect(&config.database_url, PoolConfig::default()).await?;
    let replica: Option<Arc<dyn Store>> = match &config.database_replica_url {
        Some(url) => Some(Arc::new(PgStore::connect(url, PoolConfig::default()).await?)),
        None => None,
    };
    let state = AppState::new(Arc::new(primary), replica);
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "status api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn task_runs_handler(
    db: RequestDb,
    Query(query): Query<RunsQuery>,
) -> Result<Json<Vec<TaskRun>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_RUN_LIMIT).clamp(1, MAX_RUN_LIMIT);
    Ok(Json(db.store.list_task_runs(limit).await?))
}

async fn task_run_handler(db: RequestDb, Path(id): Path<Uuid>) -> Result<Json<TaskRun>, ApiError> {
    db.store
        .get_task_run(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("task run {id}")))
}

async fn unlock_handler(
    db: RequestDb,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if TaskLockRegistry::new(db.store).unlock(id).await? {
        info!(run_id = %id, at = %Utc::now(), "task run unlocked");
        Ok(Json(json!({ "unlocked": true, "id": id })))
    } else {
        Err(ApiError::NotFound(format!("live task run {id}")))
    }
}

async fn sync_status_handler(
    db: RequestDb,
    Path(iso3): Path<String>,
) -> Result<Json<SyncStatus>, ApiError> {
    let country = db
        .store
        .find_country_by_iso3(&iso3)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("country {iso3}")))?;
    let staged_rows = db.store.count_staged(Some(country.id)).await?;
    Ok(Json(SyncStatus {
        country_id: country.id,
        iso3: country.iso3_format,
        name: country.name,
        version: country.latest_school_master_data_version,
        staged_rows,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use giga_core::{NewStagedRow, SchoolMasterRow, StagedStatus};
    use giga_storage::{CountryStore, MemoryStore, StagingStore, TaskRunStore};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct Stores {
        primary: Arc<MemoryStore>,
        replica: Arc<MemoryStore>,
    }

    fn stores() -> Stores {
        Stores {
            primary: Arc::new(MemoryStore::new()),
            replica: Arc::new(MemoryStore::new()),
        }
    }

    fn router(stores: &Stores, with_replica: bool) -> Router {
        let replica: Option<Arc<dyn Store>> = if with_replica {
            Some(stores.replica.clone())
        } else {
            None
        };
        app(AppState::new(stores.primary.clone(), replica))
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn seed_run(store: &MemoryStore, name: &str) -> TaskRun {
        store
            .insert_task_run(&TaskRun::running(Uuid::new_v4(), name, "sync", Utc::now()))
            .await
            .unwrap()
    }

    #[test]
    fn writes_and_forced_reads_route_to_primary() {
        let mut headers = HeaderMap::new();
        assert_eq!(route_for(&Method::GET, &headers), DbRoute::Replica);
        assert_eq!(route_for(&Method::POST, &headers), DbRoute::Primary);
        headers.insert(DB_ROUTE_HEADER, "PRIMARY".parse().unwrap());
        assert_eq!(route_for(&Method::GET, &headers), DbRoute::Primary);
    }

    #[tokio::test]
    async fn health_is_ok() {
        let resp = router(&stores(), false)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn reads_use_the_replica_unless_told_otherwise() {
        let s = stores();
        seed_run(&s.primary, "primary-only").await;
        let app = router(&s, true);

        let from_replica = app
            .clone()
            .oneshot(Request::builder().uri("/api/task-runs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(from_replica.status(), StatusCode::OK);
        assert_eq!(body_json(from_replica).await, json!([]));

        let from_primary = app
            .oneshot(
                Request::builder()
                    .uri("/api/task-runs?limit=5")
                    .header(DB_ROUTE_HEADER, "primary")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let runs = body_json(from_primary).await;
        assert_eq!(runs.as_array().map(Vec::len), Some(1));
        assert_eq!(runs[0]["name"], "primary-only");
    }

    #[tokio::test]
    async fn without_a_replica_reads_hit_the_primary() {
        let s = stores();
        let run = seed_run(&s.primary, "n").await;
        let resp = router(&s, false)
            .oneshot(
                Request::builder()
                    .uri(format!("/api/task-runs/{}", run.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "RUNNING");
    }

    #[tokio::test]
    async fn unknown_runs_are_not_found() {
        let resp = router(&stores(), false)
            .oneshot(
                Request::builder()
                    .uri(format!("/api/task-runs/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unlock_soft_deletes_on_the_primary() {
        let s = stores();
        let run = seed_run(&s.primary, "stuck").await;
        let app = router(&s, true);

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/task-runs/{}/unlock", run.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let stored = s.primary.get_task_run(run.id).await.unwrap().unwrap();
        assert!(stored.deleted_at.is_some());

        let again = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/task-runs/{}/unlock", run.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn sync_status_reports_cursor_and_backlog() {
        let s = stores();
        let country = s.primary.add_country("Brazil", "BR", "BRA").await;
        s.primary.set_school_master_version(country.id, 12).await.unwrap();
        s.primary
            .insert_staged(&[NewStagedRow {
                country_id: country.id,
                version: 12,
                status: StagedStatus::Published,
                row: SchoolMasterRow::new("S1"),
            }])
            .await
            .unwrap();

        let resp = router(&s, false)
            .oneshot(
                Request::builder()
                    .uri("/api/countries/bra/sync-status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let status = body_json(resp).await;
        assert_eq!(status["version"], 12);
        assert_eq!(status["staged_rows"], 1);
        assert_eq!(status["iso3"], "BRA");
    }
}
