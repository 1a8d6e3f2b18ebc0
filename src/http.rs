use crate::cache::{CacheStore, LatestTable};
use crate::config::ServiceConfig;
use crate::error::SheetError;
use crate::ingest::Ingestor;
use crate::query::{PageRequest, QueryEngine};
use crate::retention;
use crate::store::Store;
use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, warn};

const BAD_FORMAT_MESSAGE: &str =
    "file format error: at least 1 header row and 1 data row required";

#[derive(Clone)]
pub struct AppState {
    store: Store,
    pointer: LatestTable,
    ingestor: Ingestor,
    engine: QueryEngine,
}

impl AppState {
    pub fn new(store: Store, cache: Arc<dyn CacheStore>, config: &ServiceConfig) -> Self {
        let pointer = LatestTable::new(cache.clone(), config.cache_ttl);
        Self {
            ingestor: Ingestor::new(store.clone(), pointer.clone()),
            engine: QueryEngine::new(
                store.clone(),
                cache,
                config.cache_ttl,
                config.fallback_to_newest,
            ),
            store,
            pointer,
        }
    }
}

pub fn build_router(state: AppState, config: &ServiceConfig) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(
            "/upload",
            post(upload_handler).layer(DefaultBodyLimit::max(config.upload_limit_bytes)),
        )
        .route("/data", get(data_handler))
        .route("/admin/prune", post(prune_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    message: &'static str,
    table_name: String,
}

#[derive(Debug, Serialize)]
struct PruneResponse {
    dropped: Vec<String>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Error returned by every handler.
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<SheetError> for ApiError {
    fn from(err: SheetError) -> Self {
        let status = if err.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        let (message, detail) = match &err {
            SheetError::MissingFile => ("please upload a file".to_string(), None),
            SheetError::BadFormat(_) | SheetError::Spreadsheet(_) => {
                (BAD_FORMAT_MESSAGE.to_string(), Some(err.to_string()))
            }
            SheetError::NoLatestTable => (err.to_string(), None),
            SheetError::Failed { context, source } => {
                (context.to_string(), Some(source.to_string()))
            }
            other => ("internal server error".to_string(), Some(other.to_string())),
        };
        if status.is_server_error() {
            error!(error = %err, "request failed");
        } else {
            warn!(error = %err, "request rejected");
        }
        ApiError {
            status,
            body: ErrorBody {
                message,
                error: detail,
            },
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn upload_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut file: Option<Vec<u8>> = None;
    while let Some(field) = multipart.next_field().await.map_err(|e| ApiError {
        status: e.status(),
        body: ErrorBody {
            message: "failed to read upload".to_string(),
            error: Some(e.body_text()),
        },
    })? {
        if field.name() != Some("file") {
            continue;
        }
        let bytes = field.bytes().await.map_err(|e| ApiError {
            status: e.status(),
            body: ErrorBody {
                message: "failed to read upload".to_string(),
                error: Some(e.body_text()),
            },
        })?;
        file = Some(bytes.to_vec());
    }

    let bytes = file.ok_or(SheetError::MissingFile)?;
    let receipt = state.ingestor.ingest(bytes).await?;
    Ok(Json(UploadResponse {
        message: "upload succeeded",
        table_name: receipt.table_name,
    }))
}

#[derive(Debug, Deserialize)]
struct DataParams {
    page: Option<String>,
    limit: Option<String>,
    search: Option<String>,
}

async fn data_handler(
    State(state): State<AppState>,
    Query(params): Query<DataParams>,
) -> Result<Response, ApiError> {
    let req = PageRequest::from_params(
        params.page.as_deref(),
        params.limit.as_deref(),
        params.search.as_deref(),
    );
    let page = state.engine.query(&req).await?;
    // Cached bodies go out byte for byte.
    Ok(([(header::CONTENT_TYPE, "application/json")], page.body).into_response())
}

#[derive(Debug, Deserialize)]
struct PruneParams {
    keep: usize,
}

async fn prune_handler(
    State(state): State<AppState>,
    Query(params): Query<PruneParams>,
) -> Result<Json<PruneResponse>, ApiError> {
    let dropped = retention::prune(&state.store, &state.pointer, params.keep).await?;
    Ok(Json(PruneResponse { dropped }))
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
