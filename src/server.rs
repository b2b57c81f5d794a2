//! Upload API (axum).
//!
//! The ingestion endpoint of the pipeline: clients upload card images into
//! object storage through it, and read back objects, records and search
//! results. Writes go through the [`NotifyingObjectStore`](crate::object_store::NotifyingObjectStore)
//! built by the pipeline, so an upload under the watched prefix is what
//! starts extraction.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/` | List top-level folders |
//! | `GET`  | `/{folder}` | List objects in a folder |
//! | `GET`  | `/{folder}/{item}` | Download an object |
//! | `PUT`  | `/{folder}/{item}` | Upload an object (body = bytes) |
//! | `GET`  | `/_search?q=&limit=` | Cached full-text search |
//! | `GET`  | `/_records/{image_id}` | Extracted record by image id |
//! | `GET`  | `/_health` | Health check and cache counters (unauthenticated) |
//!
//! # Authorization
//!
//! Every route except `/_health` requires a signed request (see
//! [`signing`](crate::signing)). A missing, malformed, unknown, stale or
//! wrong signature is answered with `403`.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "object not found: cards/a.jpg" } }
//! ```
//!
//! Object-store failures keep their status: validation → 400, missing → 404,
//! and a remote backend's own 4xx/5xx are passed through unchanged.

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, HeaderName, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::error::{ErrorClass, PipelineError};
use crate::models::ImageId;
use crate::object_store::{detect_content_type, ObjectStore, ObjectStoreError};
use crate::search::{SearchService, DEFAULT_LIMIT};
use crate::signing;
use crate::store::RecordStore;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    objects: Arc<dyn ObjectStore>,
    records: Arc<dyn RecordStore>,
    search: Arc<SearchService>,
    /// key_id → secret
    credentials: Arc<HashMap<String, String>>,
    max_skew_secs: i64,
}

impl AppState {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        records: Arc<dyn RecordStore>,
        search: Arc<SearchService>,
        credentials: HashMap<String, String>,
        max_skew_secs: i64,
    ) -> Self {
        Self {
            objects,
            records,
            search,
            credentials: Arc::new(credentials),
            max_skew_secs,
        }
    }
}

/// Resolve `[[server.credentials]]` into a key_id → secret map.
pub fn resolve_credentials(config: &ServerConfig) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    for cred in &config.credentials {
        map.insert(cred.key_id.clone(), cred.resolve_secret()?);
    }
    Ok(map)
}

/// Build the router. Exposed separately so tests can serve it on any listener.
pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handle_list_folders))
        .route("/_health", get(handle_health))
        .route("/_search", get(handle_search))
        .route("/_records/{image_id}", get(handle_get_record))
        .route("/{folder}", get(handle_list_folder))
        .route(
            "/{folder}/{item}",
            get(handle_get_object).put(handle_put_object),
        )
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the upload API until `shutdown` flips to `true`.
pub async fn run_server(
    config: &ServerConfig,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    if state.credentials.is_empty() {
        tracing::warn!("no [[server.credentials]] configured; every signed route will return 403");
    }
    let app = router(state, config.max_upload_bytes);
    let listener = tokio::net::TcpListener::bind(&config.bind).await?;
    tracing::info!(bind = %config.bind, "upload API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn forbidden(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::FORBIDDEN,
        code: "forbidden",
        message: message.into(),
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

impl From<ObjectStoreError> for AppError {
    fn from(e: ObjectStoreError) -> Self {
        let status =
            StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let code = match e {
            ObjectStoreError::NotFound(_) => "not_found",
            ObjectStoreError::InvalidKey { .. } => "bad_request",
            ObjectStoreError::Upstream { .. } => "upstream_error",
            ObjectStoreError::Io(_) | ObjectStoreError::Request(_) => "internal",
        };
        AppError {
            status,
            code,
            message: e.to_string(),
        }
    }
}

impl From<PipelineError> for AppError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::ObjectStore(inner) => inner.into(),
            other => {
                let (status, code) = match other.class() {
                    ErrorClass::Permanent => (StatusCode::BAD_REQUEST, "bad_request"),
                    ErrorClass::Transient => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
                    ErrorClass::Fatal => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
                };
                AppError {
                    status,
                    code,
                    message: other.to_string(),
                }
            }
        }
    }
}

// ============ Authorization ============

fn authorize(
    state: &AppState,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), AppError> {
    let header_str = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    let auth = header_str(header::AUTHORIZATION.as_str())
        .ok_or_else(|| forbidden("missing Authorization header"))?;
    let (key_id, signature) = signing::parse_api_authorization(auth)
        .ok_or_else(|| forbidden("malformed Authorization header"))?;
    let date = header_str(signing::DATE_HEADER)
        .ok_or_else(|| forbidden(format!("missing {} header", signing::DATE_HEADER)))?;

    let signed_at = DateTime::parse_from_rfc3339(date)
        .map_err(|_| forbidden(format!("{} must be RFC 3339", signing::DATE_HEADER)))?
        .with_timezone(&Utc);
    let skew = (Utc::now() - signed_at).num_seconds().abs();
    if skew > state.max_skew_secs {
        return Err(forbidden("request timestamp outside allowed clock skew"));
    }

    let secret = state
        .credentials
        .get(&key_id)
        .ok_or_else(|| forbidden("unknown credential"))?;
    let query = uri.query().unwrap_or("");
    if !signing::verify_api_request(
        secret,
        method.as_str(),
        uri.path(),
        query,
        date,
        body,
        &signature,
    ) {
        tracing::warn!(key_id = %key_id, path = uri.path(), "signature mismatch");
        return Err(forbidden("signature does not match"));
    }
    Ok(())
}

// ============ GET /_health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    cache: CacheStats,
}

#[derive(Serialize)]
struct CacheStats {
    hits: u64,
    misses: u64,
    entries: u64,
    bytes: u64,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let cache = state.search.cache();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        cache: CacheStats {
            hits: cache.hits(),
            misses: cache.misses(),
            entries: cache.entry_count(),
            bytes: cache.weighted_size(),
        },
    })
}

// ============ GET / ============

#[derive(Serialize)]
struct FolderList {
    folders: Vec<String>,
}

async fn handle_list_folders(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Json<FolderList>, AppError> {
    authorize(&state, &method, &uri, &headers, b"")?;
    let folders = state.objects.list_folders().await?;
    Ok(Json(FolderList { folders }))
}

// ============ GET /{folder} ============

#[derive(Serialize)]
struct ObjectList {
    folder: String,
    objects: Vec<crate::object_store::ObjectMeta>,
}

async fn handle_list_folder(
    State(state): State<AppState>,
    Path(folder): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Json<ObjectList>, AppError> {
    authorize(&state, &method, &uri, &headers, b"")?;
    let objects = state.objects.list(&format!("{}/", folder)).await?;
    Ok(Json(ObjectList { folder, objects }))
}

// ============ GET /{folder}/{item} ============

async fn handle_get_object(
    State(state): State<AppState>,
    Path((folder, item)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    authorize(&state, &method, &uri, &headers, b"")?;
    let data = state.objects.get(&format!("{}/{}", folder, item)).await?;
    let headers = [
        (header::CONTENT_TYPE, data.meta.content_type.clone()),
        (header::CONTENT_LENGTH, data.bytes.len().to_string()),
        (
            HeaderName::from_static("timestamp"),
            data.meta.last_modified.to_rfc3339(),
        ),
    ];
    Ok((headers, data.bytes).into_response())
}

// ============ PUT /{folder}/{item} ============

#[derive(Serialize)]
struct PutResponse {
    key: String,
    size: u64,
    content_type: String,
    image_id: ImageId,
}

async fn handle_put_object(
    State(state): State<AppState>,
    Path((folder, item)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<PutResponse>, AppError> {
    authorize(&state, &method, &uri, &headers, &body)?;
    if body.is_empty() {
        return Err(bad_request("request body must not be empty"));
    }

    let key = format!("{}/{}", folder, item);
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| detect_content_type(&key));

    let meta = state.objects.put(&key, body.to_vec(), &content_type).await?;
    let location = crate::models::ObjectLocation::new(state.objects.bucket(), key.as_str());
    tracing::info!(key = %key, size = meta.size, "object uploaded");

    Ok(Json(PutResponse {
        key,
        size: meta.size,
        content_type: meta.content_type,
        image_id: ImageId::for_location(&location),
    }))
}

// ============ GET /_search ============

#[derive(Deserialize)]
struct SearchParams {
    q: Option<String>,
    limit: Option<usize>,
}

async fn handle_search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    authorize(&state, &method, &uri, &headers, b"")?;
    let query = params.q.unwrap_or_default();
    if query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let bytes = state
        .search
        .search_json(&query, params.limit.unwrap_or(DEFAULT_LIMIT))
        .await?;
    Ok((
        [(header::CONTENT_TYPE, "application/json")],
        bytes.as_ref().clone(),
    )
        .into_response())
}

// ============ GET /_records/{image_id} ============

async fn handle_get_record(
    State(state): State<AppState>,
    Path(image_id): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Json<crate::models::ExtractedRecord>, AppError> {
    authorize(&state, &method, &uri, &headers, b"")?;
    let id = ImageId(image_id);
    state
        .records
        .get_record(&id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(format!("no record for image id {}", id)))
}
