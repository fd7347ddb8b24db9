//! Thin HTTP façade over the instance manager.
//!
//! Routes are project-scoped: `{project}` resolves through
//! [`InstanceManager::acquire`] to a database handle that lives for the
//! request and is released when the handler returns. Engine calls are
//! synchronous, so every handler hops onto the blocking pool. Errors map
//! onto the status table in the error module docs; bodies are
//! `{"error": <kind>, "message": <human string>}`.

mod instances;

pub use instances::{InstanceHandle, InstanceManager, InstanceManagerConfig, ManagerStats};

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::task;
use tower_http::{cors::{Any, CorsLayer}, trace::TraceLayer};
use tracing::info;

use crate::db::Isolation;
use crate::error::DbError;
use crate::wal::SharedFlusher;

type AppState = Arc<ServerState>;

/// Shared state behind every handler.
#[derive(Debug)]
pub struct ServerState {
    /// The multi-tenant front door.
    pub manager: Arc<InstanceManager>,
}

/// Builds the full REST router.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_headers(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ]);

    Router::new()
        .route("/health", get(health))
        .route(
            "/v1/projects/:project/databases/:db/collections",
            post(create_collection).get(list_collections),
        )
        .route(
            "/v1/projects/:project/databases/:db/collections/:name",
            patch(patch_collection).delete(delete_collection).get(get_collection),
        )
        .route(
            "/v1/projects/:project/databases/:db/collections/:name/rules",
            patch(patch_rules),
        )
        .route(
            "/v1/projects/:project/databases/:db/documents/:collection",
            post(insert_document).get(list_documents),
        )
        .route(
            "/v1/projects/:project/databases/:db/documents/:collection/:id",
            get(get_document)
                .put(put_document)
                .patch(patch_document)
                .delete(delete_document),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Binds `addr` and serves until ctrl-c, then shuts the engine down:
/// instances close (checkpointing), and the shared flusher stops.
pub async fn serve(manager: Arc<InstanceManager>, addr: SocketAddr) -> std::io::Result<()> {
    let state = Arc::new(ServerState {
        manager: Arc::clone(&manager),
    });
    let router = build_router(state);
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "bundoc listening");

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.shutdown();
    SharedFlusher::global().stop();
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(err) => tracing::error!(%err, "failed to listen for shutdown signal"),
    }
}

struct AppError(DbError);

impl From<DbError> for AppError {
    fn from(err: DbError) -> Self {
        Self(err)
    }
}

impl From<task::JoinError> for AppError {
    fn from(err: task::JoinError) -> Self {
        Self(DbError::Io(std::io::Error::other(err.to_string())))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self.0 {
            DbError::InvalidDocument(_) => (StatusCode::BAD_REQUEST, "invalid_document"),
            DbError::SchemaViolation(_) => (StatusCode::BAD_REQUEST, "schema_violation"),
            DbError::InvalidReferenceSchema(_) => {
                (StatusCode::BAD_REQUEST, "invalid_reference_schema")
            }
            DbError::InvalidArgument(_) => (StatusCode::BAD_REQUEST, "invalid_argument"),
            DbError::CollectionNotFound(_) => (StatusCode::NOT_FOUND, "collection_not_found"),
            DbError::DocumentNotFound(_) => (StatusCode::NOT_FOUND, "document_not_found"),
            DbError::CollectionExists(_) => (StatusCode::CONFLICT, "collection_exists"),
            DbError::DuplicateKey(_) => (StatusCode::CONFLICT, "duplicate_key"),
            DbError::ReferenceTargetNotFound { .. } => {
                (StatusCode::CONFLICT, "reference_target_not_found")
            }
            DbError::ReferenceRestrictViolation { .. } => {
                (StatusCode::CONFLICT, "reference_restrict_violation")
            }
            DbError::TooManyRequests(_) => (StatusCode::TOO_MANY_REQUESTS, "too_many_requests"),
            DbError::InsufficientStorage(_) => {
                (StatusCode::INSUFFICIENT_STORAGE, "insufficient_storage")
            }
            DbError::BufferPoolExhausted => {
                (StatusCode::SERVICE_UNAVAILABLE, "buffer_pool_exhausted")
            }
            DbError::Timeout => (StatusCode::REQUEST_TIMEOUT, "timeout"),
            DbError::FlusherStopped => (StatusCode::SERVICE_UNAVAILABLE, "flusher_stopped"),
            DbError::TransactionInactive => {
                (StatusCode::INTERNAL_SERVER_ERROR, "transaction_inactive")
            }
            DbError::Corruption(_) | DbError::ReadOnly(_) | DbError::Io(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        let body = Json(ErrorBody {
            error: kind,
            message: self.0.to_string(),
        });
        (status, body).into_response()
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    instances: usize,
    active: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.manager.stats();
    Json(HealthResponse {
        status: "ok",
        instances: stats.instances,
        active: stats.active,
    })
}

#[derive(Debug, Deserialize)]
struct CreateCollectionBody {
    name: String,
    #[serde(default)]
    schema: Option<Value>,
    #[serde(default)]
    rules: Option<BTreeMap<String, String>>,
}

async fn create_collection(
    State(state): State<AppState>,
    Path((project, _db)): Path<(String, String)>,
    Json(body): Json<CreateCollectionBody>,
) -> Result<Response, AppError> {
    let manager = Arc::clone(&state.manager);
    task::spawn_blocking(move || -> Result<(), DbError> {
        let handle = manager.acquire(&project)?;
        handle.db().create_collection(&body.name, body.schema, body.rules)
    })
    .await??;
    Ok(StatusCode::CREATED.into_response())
}

#[derive(Debug, Serialize)]
struct CollectionList {
    collections: Vec<String>,
}

async fn list_collections(
    State(state): State<AppState>,
    Path((project, _db)): Path<(String, String)>,
) -> Result<Json<CollectionList>, AppError> {
    let manager = Arc::clone(&state.manager);
    let collections = task::spawn_blocking(move || -> Result<Vec<String>, DbError> {
        let handle = manager.acquire(&project)?;
        Ok(handle.db().list_collections())
    })
    .await??;
    Ok(Json(CollectionList { collections }))
}

#[derive(Debug, Serialize)]
struct CollectionInfo {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    schema: Option<Value>,
    rules: BTreeMap<String, String>,
}

async fn get_collection(
    State(state): State<AppState>,
    Path((project, _db, name)): Path<(String, String, String)>,
) -> Result<Json<CollectionInfo>, AppError> {
    let manager = Arc::clone(&state.manager);
    let info = task::spawn_blocking(move || -> Result<CollectionInfo, DbError> {
        let handle = manager.acquire(&project)?;
        let (schema, rules) = handle.db().describe_collection(&name)?;
        Ok(CollectionInfo { name, schema, rules })
    })
    .await??;
    Ok(Json(info))
}

#[derive(Debug, Deserialize)]
struct PatchCollectionBody {
    #[serde(default)]
    schema: Option<Value>,
}

async fn patch_collection(
    State(state): State<AppState>,
    Path((project, _db, name)): Path<(String, String, String)>,
    Json(body): Json<PatchCollectionBody>,
) -> Result<Response, AppError> {
    let manager = Arc::clone(&state.manager);
    task::spawn_blocking(move || -> Result<(), DbError> {
        let handle = manager.acquire(&project)?;
        let schema = match body.schema {
            Some(Value::Null) | None => None,
            Some(schema) => Some(schema),
        };
        handle.db().set_schema(&name, schema)
    })
    .await??;
    Ok(StatusCode::OK.into_response())
}

#[derive(Debug, Deserialize)]
struct PatchRulesBody {
    rules: BTreeMap<String, String>,
}

async fn patch_rules(
    State(state): State<AppState>,
    Path((project, _db, name)): Path<(String, String, String)>,
    Json(body): Json<PatchRulesBody>,
) -> Result<Response, AppError> {
    let manager = Arc::clone(&state.manager);
    task::spawn_blocking(move || -> Result<(), DbError> {
        let handle = manager.acquire(&project)?;
        handle.db().set_rules(&name, body.rules)
    })
    .await??;
    Ok(StatusCode::OK.into_response())
}

async fn delete_collection(
    State(state): State<AppState>,
    Path((project, _db, name)): Path<(String, String, String)>,
) -> Result<Response, AppError> {
    let manager = Arc::clone(&state.manager);
    task::spawn_blocking(move || -> Result<(), DbError> {
        let handle = manager.acquire(&project)?;
        handle.db().drop_collection(&name)
    })
    .await??;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn insert_document(
    State(state): State<AppState>,
    Path((project, _db, collection)): Path<(String, String, String)>,
    Json(body): Json<Value>,
) -> Result<Response, AppError> {
    let manager = Arc::clone(&state.manager);
    let doc = task::spawn_blocking(move || -> Result<Value, DbError> {
        let handle = manager.acquire(&project)?;
        let deadline = manager.deadline();
        let mut tx = handle.db().begin(Isolation::ReadCommitted).with_deadline(deadline);
        let doc = tx.insert(&collection, body)?;
        tx.commit()?;
        Ok(doc.to_value())
    })
    .await??;
    Ok((StatusCode::CREATED, Json(doc)).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct DocumentList {
    documents: Vec<Value>,
    truncated: bool,
}

async fn list_documents(
    State(state): State<AppState>,
    Path((project, _db, collection)): Path<(String, String, String)>,
    Query(params): Query<ListParams>,
) -> Result<Json<DocumentList>, AppError> {
    let manager = Arc::clone(&state.manager);
    let list = task::spawn_blocking(move || -> Result<DocumentList, DbError> {
        let handle = manager.acquire(&project)?;
        let deadline = manager.deadline();
        let scan_cap = manager.scan_cap();
        let cap = match (params.limit, scan_cap) {
            (Some(limit), 0) => limit,
            (Some(limit), cap) => limit.min(cap),
            (None, cap) => cap,
        };
        let mut tx = handle.db().begin(Isolation::ReadCommitted).with_deadline(deadline);
        let (docs, truncated) = tx.list(&collection, cap)?;
        tx.commit()?;
        Ok(DocumentList {
            documents: docs.iter().map(|d| d.to_value()).collect(),
            truncated,
        })
    })
    .await??;
    Ok(Json(list))
}

async fn get_document(
    State(state): State<AppState>,
    Path((project, _db, collection, id)): Path<(String, String, String, String)>,
) -> Result<Json<Value>, AppError> {
    let manager = Arc::clone(&state.manager);
    let doc = task::spawn_blocking(move || -> Result<Value, DbError> {
        let handle = manager.acquire(&project)?;
        let deadline = manager.deadline();
        let mut tx = handle.db().begin(Isolation::ReadCommitted).with_deadline(deadline);
        let doc = tx.find_by_id(&collection, &id)?;
        tx.commit()?;
        Ok(doc.to_value())
    })
    .await??;
    Ok(Json(doc))
}

async fn put_document(
    State(state): State<AppState>,
    Path((project, _db, collection, id)): Path<(String, String, String, String)>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, AppError> {
    let manager = Arc::clone(&state.manager);
    let doc = task::spawn_blocking(move || -> Result<Value, DbError> {
        let handle = manager.acquire(&project)?;
        let deadline = manager.deadline();
        let mut tx = handle.db().begin(Isolation::ReadCommitted).with_deadline(deadline);
        let doc = tx.update(&collection, &id, body)?;
        tx.commit()?;
        Ok(doc.to_value())
    })
    .await??;
    Ok(Json(doc))
}

async fn patch_document(
    State(state): State<AppState>,
    Path((project, _db, collection, id)): Path<(String, String, String, String)>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, AppError> {
    let manager = Arc::clone(&state.manager);
    let doc = task::spawn_blocking(move || -> Result<Value, DbError> {
        let handle = manager.acquire(&project)?;
        let deadline = manager.deadline();
        let mut tx = handle.db().begin(Isolation::ReadCommitted).with_deadline(deadline);
        let doc = tx.patch(&collection, &id, body)?;
        tx.commit()?;
        Ok(doc.to_value())
    })
    .await??;
    Ok(Json(doc))
}

async fn delete_document(
    State(state): State<AppState>,
    Path((project, _db, collection, id)): Path<(String, String, String, String)>,
) -> Result<Response, AppError> {
    let manager = Arc::clone(&state.manager);
    task::spawn_blocking(move || -> Result<(), DbError> {
        let handle = manager.acquire(&project)?;
        let deadline = manager.deadline();
        let mut tx = handle.db().begin(Isolation::ReadCommitted).with_deadline(deadline);
        tx.delete(&collection, &id)?;
        tx.commit()
    })
    .await??;
    Ok(StatusCode::NO_CONTENT.into_response())
}
