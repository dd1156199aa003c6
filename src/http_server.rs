use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::validate_request::ValidateRequestHeaderLayer;

use crate::error::{Result, StoreError};
use crate::store::Store;
use crate::Keystore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub start_time: Instant,
}

pub fn router(state: AppState, auth: Option<(String, String)>) -> Router {
    let mut app = Router::new()
        .route("/v1/status", get(status))
        .route("/v1/uptime", get(uptime))
        .route("/v1/db/:db/create", post(create_buckets))
        .route("/v1/db/:db/buckets", get(list_buckets))
        .route("/v1/db/:db/stats", get(stats))
        .route("/v1/db/:db", delete(delete_database))
        .route("/v1/db/:db/haskeys", post(has_keys))
        .route("/v1/db/:db/move", post(move_keys))
        .route("/v1/db/:db/movetop", post(move_top))
        .route("/v1/db/:db/bucket/:bucket/update", post(update_bucket))
        .route("/v1/db/:db/bucket/:bucket/all", get(get_all))
        .route("/v1/db/:db/bucket/:bucket/some", post(get_some))
        .route(
            "/v1/db/:db/bucket/:bucket/keys",
            get(list_keys).delete(delete_keys),
        )
        .route("/v1/db/:db/bucket/:bucket/count", get(count_keys))
        .route("/v1/db/:db/bucket/:bucket/haskey/:key", get(has_key))
        .route("/v1/db/:db/bucket/:bucket/pop", post(pop_front))
        .route("/v1/db/:db/bucket/:bucket", delete(delete_bucket))
        .with_state(state);

    if let Some((user, pass)) = auth {
        app = app.layer(ValidateRequestHeaderLayer::basic(&user, &pass));
    }

    // Outermost so preflight requests are answered before auth.
    app.layer(CorsLayer::permissive())
}

pub async fn serve(addr: SocketAddr, state: AppState, auth: Option<(String, String)>) -> Result<()> {
    let app = router(state, auth);
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "http api listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/* =========================
API TYPES
========================= */

#[derive(Serialize)]
struct StatusResponse {
    hostname: String,
    uptime_seconds: u64,
    open_databases: usize,
}

#[derive(Serialize)]
struct UptimeResponse {
    uptime_seconds: u64,
}

#[derive(Serialize)]
struct Message {
    message: String,
}

#[derive(Deserialize)]
struct HasKeysRequest {
    buckets: Vec<String>,
    keys: Vec<String>,
}

#[derive(Deserialize)]
struct MoveRequest {
    from_bucket: String,
    to_bucket: String,
    keys: Vec<String>,
}

#[derive(Deserialize)]
struct MoveTopRequest {
    from_bucket: String,
    to_bucket: String,
    n: i64,
}

#[derive(Serialize)]
struct MovedResponse {
    moved: Vec<String>,
}

#[derive(Serialize)]
struct CountResponse {
    count: usize,
}

#[derive(Deserialize)]
struct PopQuery {
    n: i64,
}

/* =========================
ERROR MAPPING
========================= */

struct ApiError {
    status: StatusCode,
    message: String,
}

type ApiResult<T> = std::result::Result<T, ApiError>;

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::BucketNotFound(_) | StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::InvalidName(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::warn!(status = %self.status, "{}", self.message);
        }
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> ApiError {
    ApiError {
        status: StatusCode::BAD_REQUEST,
        message: message.into(),
    }
}

fn positive_n(n: i64) -> ApiResult<usize> {
    if n < 1 {
        return Err(bad_request("n must be a positive integer"));
    }
    Ok(n as usize)
}

/// Run a store call on the blocking pool; it takes file locks and does
/// disk I/O, which must stay off the async workers.
async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(e) => Err(ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("worker task failed: {e}"),
        }),
    }
}

/* =========================
HANDLERS
========================= */

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        hostname: hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string()),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        open_databases: state.store.open_handles(),
    })
}

async fn uptime(State(state): State<AppState>) -> Json<UptimeResponse> {
    Json(UptimeResponse {
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

async fn create_buckets(
    State(state): State<AppState>,
    Path(db): Path<String>,
    Json(buckets): Json<Vec<String>>,
) -> ApiResult<Json<Message>> {
    let message = format!("created {} buckets", buckets.len());
    blocking(move || state.store.create_buckets(&db, &buckets)).await?;
    Ok(Json(Message { message }))
}

async fn list_buckets(
    State(state): State<AppState>,
    Path(db): Path<String>,
) -> ApiResult<Json<Vec<String>>> {
    let buckets = blocking(move || state.store.list_buckets(&db)).await?;
    Ok(Json(buckets))
}

async fn stats(
    State(state): State<AppState>,
    Path(db): Path<String>,
) -> ApiResult<Json<BTreeMap<String, usize>>> {
    let counts = blocking(move || state.store.stats(&db)).await?;
    Ok(Json(counts))
}

async fn delete_database(
    State(state): State<AppState>,
    Path(db): Path<String>,
) -> ApiResult<Json<Message>> {
    let message = format!("deleted database {db}");
    blocking(move || state.store.delete_database(&db)).await?;
    Ok(Json(Message { message }))
}

async fn has_keys(
    State(state): State<AppState>,
    Path(db): Path<String>,
    Json(req): Json<HasKeysRequest>,
) -> ApiResult<Json<BTreeMap<String, bool>>> {
    let found = blocking(move || state.store.has_keys(&db, &req.buckets, &req.keys)).await?;
    Ok(Json(found))
}

async fn move_keys(
    State(state): State<AppState>,
    Path(db): Path<String>,
    Json(req): Json<MoveRequest>,
) -> ApiResult<Json<MovedResponse>> {
    let moved = blocking(move || {
        state
            .store
            .move_keys(&db, &req.from_bucket, &req.to_bucket, &req.keys)
    })
    .await?;
    Ok(Json(MovedResponse { moved }))
}

async fn move_top(
    State(state): State<AppState>,
    Path(db): Path<String>,
    Json(req): Json<MoveTopRequest>,
) -> ApiResult<Json<Keystore>> {
    let n = positive_n(req.n)?;
    let moved = blocking(move || {
        state
            .store
            .move_top(&db, &req.from_bucket, &req.to_bucket, n)
    })
    .await?;
    Ok(Json(moved))
}

async fn update_bucket(
    State(state): State<AppState>,
    Path((db, bucket)): Path<(String, String)>,
    Json(entries): Json<Keystore>,
) -> ApiResult<Json<Message>> {
    let message = format!("updated {} keys in {bucket}", entries.len());
    blocking(move || state.store.put(&db, &bucket, &entries)).await?;
    Ok(Json(Message { message }))
}

async fn get_all(
    State(state): State<AppState>,
    Path((db, bucket)): Path<(String, String)>,
) -> ApiResult<Json<Keystore>> {
    let entries = blocking(move || state.store.get_all(&db, &bucket)).await?;
    Ok(Json(entries))
}

async fn get_some(
    State(state): State<AppState>,
    Path((db, bucket)): Path<(String, String)>,
    Json(keys): Json<Vec<String>>,
) -> ApiResult<Json<Keystore>> {
    let entries = blocking(move || state.store.get_some(&db, &bucket, &keys)).await?;
    Ok(Json(entries))
}

async fn list_keys(
    State(state): State<AppState>,
    Path((db, bucket)): Path<(String, String)>,
) -> ApiResult<Json<Vec<String>>> {
    let keys = blocking(move || state.store.list_keys(&db, &bucket)).await?;
    Ok(Json(keys))
}

async fn delete_keys(
    State(state): State<AppState>,
    Path((db, bucket)): Path<(String, String)>,
    Json(keys): Json<Vec<String>>,
) -> ApiResult<Json<Message>> {
    let message = format!("deleted {} keys in {bucket}", keys.len());
    blocking(move || state.store.delete_keys(&db, &bucket, &keys)).await?;
    Ok(Json(Message { message }))
}

async fn count_keys(
    State(state): State<AppState>,
    Path((db, bucket)): Path<(String, String)>,
) -> ApiResult<Json<CountResponse>> {
    let count = blocking(move || state.store.count_keys(&db, &bucket)).await?;
    Ok(Json(CountResponse { count }))
}

async fn has_key(
    State(state): State<AppState>,
    Path((db, bucket, key)): Path<(String, String, String)>,
) -> ApiResult<Json<bool>> {
    let exists = blocking(move || state.store.has_key(&db, &bucket, &key)).await?;
    Ok(Json(exists))
}

async fn pop_front(
    State(state): State<AppState>,
    Path((db, bucket)): Path<(String, String)>,
    Query(query): Query<PopQuery>,
) -> ApiResult<Json<Keystore>> {
    let n = positive_n(query.n)?;
    let popped = blocking(move || state.store.pop_front(&db, &bucket, n)).await?;
    Ok(Json(popped))
}

async fn delete_bucket(
    State(state): State<AppState>,
    Path((db, bucket)): Path<(String, String)>,
) -> ApiResult<Json<Message>> {
    let message = format!("deleted bucket {bucket}");
    blocking(move || state.store.delete_bucket(&db, &bucket)).await?;
    Ok(Json(Message { message }))
}
