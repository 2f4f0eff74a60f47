//! HTTP surface: streaming chat over SSE plus the small JSON side doors
//! (contact, feedback, correction, corpus sync and listing, health).
//!
//! Every non-streaming failure is a JSON envelope `{"error": {"code",
//! "message"}}` with a matching status code; the chat stream reports its
//! failures in-band as terminal `error` events instead.

use anyhow::{Context, Result};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures_util::stream::Stream;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::corpus;
use crate::models::{ContactInfo, CorrectionData, FeedbackData};
use crate::orchestrator::{ChatOrchestrator, ChatRequest};
use crate::services::Services;
use crate::state::BreakerState;
use crate::vector_store::MetadataFilter;

struct AppState {
    services: Arc<Services>,
    orchestrator: ChatOrchestrator,
}

/// Error envelope returned by all non-streaming endpoints.
struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal",
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": { "code": self.code, "message": self.message }
        });
        (self.status, Json(body)).into_response()
    }
}

pub fn build_router(services: Arc<Services>) -> Router {
    let state = Arc::new(AppState {
        orchestrator: ChatOrchestrator::new(services.clone()),
        services,
    });
    Router::new()
        .route("/chat", post(chat))
        .route("/contact", post(contact))
        .route("/feedback", post(feedback))
        .route("/correction", post(correction))
        .route("/sync", post(sync))
        .route("/sync/delete", post(sync_delete))
        .route("/documents", get(documents))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the process is terminated.
pub async fn serve(services: Arc<Services>) -> Result<()> {
    let bind = services.config.server.bind.clone();
    let router = build_router(services);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!(addr = %bind, "listening");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("Server terminated")?;
    Ok(())
}

/// Client identity: first hop of `x-forwarded-for` when present (the
/// expected deployment sits behind a proxy), else the socket peer.
fn client_ip(headers: &HeaderMap, peer: &SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| peer.ip().to_string())
}

async fn chat(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let ip = client_ip(&headers, &peer);
    let rx = state.orchestrator.handle_stream_chat(request, ip);
    let stream = ReceiverStream::new(rx).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default().event(event.event_name()).data(data))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContactRequest {
    name: String,
    email: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
}

async fn contact(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<ContactRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let ip = client_ip(&headers, &peer);
    let contact = ContactInfo {
        name: request.name,
        email: request.email,
        message: request.message,
        session_id: request.session_id,
        created_at: Utc::now(),
    };
    state
        .services
        .hitl
        .submit_contact(&contact, &ip)
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeedbackRequest {
    #[serde(default)]
    rating: Option<u8>,
    #[serde(default)]
    session_id: Option<String>,
}

async fn feedback(
    State(state): State<Arc<AppState>>,
    Json(request): Json<FeedbackRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let feedback = FeedbackData {
        rating: request.rating,
        session_id: request.session_id,
        created_at: Utc::now(),
    };
    state
        .services
        .hitl
        .submit_feedback(&feedback)
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CorrectionRequest {
    original_query: String,
    original_response: String,
    correction_message: String,
    #[serde(default)]
    session_id: Option<String>,
}

async fn correction(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CorrectionRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let correction = CorrectionData {
        original_query: request.original_query,
        original_response: request.original_response,
        correction_message: request.correction_message,
        session_id: request.session_id,
        created_at: Utc::now(),
    };
    state
        .services
        .hitl
        .submit_correction(&correction)
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
struct SyncRequest {
    dir: PathBuf,
}

async fn sync(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SyncRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let report = corpus::sync_dir(&state.services, &request.dir)
        .await
        .map_err(|e| ApiError::internal(format!("{:#}", e)))?;
    Ok(Json(json!({
        "notes": report.notes,
        "chunks": report.chunks,
    })))
}

#[derive(Debug, Deserialize)]
struct DeleteRequest {
    path: String,
}

async fn sync_delete(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DeleteRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if request.path.trim().is_empty() {
        return Err(ApiError::bad_request("path must not be empty"));
    }
    let removed = corpus::delete_path(&state.services, &request.path)
        .await
        .map_err(|e| ApiError::internal(format!("{:#}", e)))?;
    Ok(Json(json!({ "removed": removed })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentsQuery {
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    doc_type: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    keyword: Option<String>,
}

fn documents_filter(query: &DocumentsQuery) -> Option<MetadataFilter> {
    let mut filter = MetadataFilter::new();
    if let Some(category) = &query.category {
        filter.insert("category".to_string(), category.clone());
    }
    if let Some(doc_type) = &query.doc_type {
        filter.insert("type".to_string(), doc_type.clone());
    }
    if let Some(source) = &query.source {
        filter.insert("source".to_string(), source.clone());
    }
    if let Some(keyword) = &query.keyword {
        filter.insert("keyword".to_string(), keyword.clone());
    }
    (!filter.is_empty()).then_some(filter)
}

async fn documents(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DocumentsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let filter = documents_filter(&query);
    let listed = corpus::list_documents(&state.services, filter.as_ref())
        .await
        .map_err(|e| ApiError::internal(format!("{:#}", e)))?;
    let items: Vec<serde_json::Value> = listed
        .iter()
        .map(|d| {
            json!({
                "id": d.id,
                "title": d.metadata.title,
                "category": d.metadata.category,
                "source": d.metadata.source,
                "chunkIndex": d.metadata.chunk_index,
            })
        })
        .collect();
    Ok(Json(json!({ "count": items.len(), "documents": items })))
}

async fn health(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, ApiError> {
    let indexed = state
        .services
        .vector_store
        .count()
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    let breaker = match state.services.state.breaker_state() {
        BreakerState::Closed => "closed",
        BreakerState::Open => "open",
        BreakerState::HalfOpen => "half_open",
    };
    let feedback: serde_json::Map<String, serde_json::Value> = state
        .services
        .hitl
        .feedback_totals()
        .await
        .into_iter()
        .map(|(bucket, count)| (bucket, json!(count)))
        .collect();
    Ok(Json(json!({
        "status": "ok",
        "indexed_chunks": indexed,
        "sparse_vocabulary": state.services.sparse.vocab_size(),
        "state_backend": if state.services.state.is_remote() { "remote" } else { "memory" },
        "state_breaker": breaker,
        "feedback": feedback,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarded_header_wins_over_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        assert_eq!(client_ip(&headers, &peer), "203.0.113.9");
    }

    #[test]
    fn peer_address_is_fallback() {
        let headers = HeaderMap::new();
        let peer: SocketAddr = "192.0.2.4:1234".parse().unwrap();
        assert_eq!(client_ip(&headers, &peer), "192.0.2.4");
    }

    #[test]
    fn documents_filter_from_query_params() {
        assert!(documents_filter(&DocumentsQuery::default()).is_none());

        let query = DocumentsQuery {
            category: Some("work".into()),
            doc_type: Some("note".into()),
            source: None,
            keyword: None,
        };
        let filter = documents_filter(&query).unwrap();
        assert_eq!(filter.get("category").map(String::as_str), Some("work"));
        assert_eq!(filter.get("type").map(String::as_str), Some("note"));
        assert!(!filter.contains_key("source"));
    }

    #[test]
    fn error_envelope_shape() {
        let err = ApiError::bad_request("missing field");
        let body = json!({
            "error": { "code": err.code, "message": err.message }
        });
        assert_eq!(body["error"]["code"], "bad_request");
    }
}
