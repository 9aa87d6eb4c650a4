//! REST API
//!
//! Accepts oracle response batches and serves the resulting feed states,
//! their history, rejections and service health.

use crate::{
    database::{AggregateRecord, RejectionRecord},
    error::{Result, ServiceError},
    service::{HealthReport, QuoteService},
    types::{UpdateRequest, UpdateSummary},
};
use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use quote_consensus::{FeedId, PipelineError, StoredState};
use serde::{Deserialize, Serialize};
use std::{str::FromStr, sync::Arc};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

/// Default page size of the history endpoints
const DEFAULT_LIMIT: i64 = 100;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<QuoteService>,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Update endpoint
        .route("/api/v1/updates", post(submit_update))

        // Feed endpoints
        .route("/api/v1/feeds", get(get_feeds))
        .route("/api/v1/feeds/:feed_id", get(get_feed))
        .route("/api/v1/feeds/:feed_id/history", get(get_feed_history))
        .route("/api/v1/rejections", get(get_rejections))

        // Health endpoints
        .route("/api/v1/health", get(health_check))

        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// UPDATE ENDPOINT
// ============================================================================

/// POST /api/v1/updates
///
/// Submit a batch of signed oracle responses
///
/// Body: `{"responses": [...], "bundle": "0x...", "feeds": ["<feed id>", ...]}`
async fn submit_update(
    State(state): State<AppState>,
    Json(request): Json<UpdateRequest>,
) -> Result<Json<UpdateResponse>> {
    info!(
        "Received update with {} responses{}",
        request.responses.len(),
        if request.bundle.is_some() { " and a bundle" } else { "" }
    );

    let summary = state.service.submit(request).await?;

    Ok(Json(UpdateResponse {
        success: true,
        data: summary,
        timestamp: chrono::Utc::now().timestamp(),
    }))
}

// ============================================================================
// FEED ENDPOINTS
// ============================================================================

/// GET /api/v1/feeds
///
/// Latest accepted state of every feed
async fn get_feeds(State(state): State<AppState>) -> Json<FeedsResponse> {
    let feeds = state.service.feeds().await;

    Json(FeedsResponse {
        success: true,
        count: feeds.len(),
        data: feeds,
    })
}

/// GET /api/v1/feeds/:feed_id
///
/// Latest accepted state of one feed
///
/// Example: GET /api/v1/feeds/0x3f2a...
async fn get_feed(
    State(state): State<AppState>,
    Path(feed_id): Path<String>,
) -> Result<Json<FeedResponse>> {
    let feed_id = FeedId::from_str(&feed_id)?;
    let feed = state.service.latest(&feed_id).await?;

    Ok(Json(FeedResponse {
        success: true,
        data: feed,
        timestamp: chrono::Utc::now().timestamp(),
    }))
}

/// GET /api/v1/feeds/:feed_id/history
///
/// Accepted aggregates of a feed, newest first
///
/// Query params: ?limit=100
async fn get_feed_history(
    State(state): State<AppState>,
    Path(feed_id): Path<String>,
    Query(params): Query<LimitQuery>,
) -> Result<Json<HistoryResponse>> {
    let feed_id = FeedId::from_str(&feed_id)?;
    let history = state
        .service
        .history(&feed_id, params.limit.unwrap_or(DEFAULT_LIMIT))
        .await?;

    Ok(Json(HistoryResponse {
        success: true,
        count: history.len(),
        data: history,
    }))
}

/// GET /api/v1/rejections
///
/// Most recent rejected feed updates
///
/// Query params: ?limit=100
async fn get_rejections(
    State(state): State<AppState>,
    Query(params): Query<LimitQuery>,
) -> Result<Json<RejectionsResponse>> {
    let rejections = state
        .service
        .rejections(params.limit.unwrap_or(DEFAULT_LIMIT))
        .await?;

    Ok(Json(RejectionsResponse {
        success: true,
        count: rejections.len(),
        data: rejections,
    }))
}

// ============================================================================
// HEALTH ENDPOINTS
// ============================================================================

/// GET /api/v1/health
///
/// System health check
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let report = state.service.health().await;

    Json(HealthResponse {
        success: report.is_healthy(),
        data: report,
        timestamp: chrono::Utc::now().timestamp(),
    })
}

// ============================================================================
// REQUEST/RESPONSE TYPES
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct UpdateResponse {
    pub success: bool,
    pub data: UpdateSummary,
    pub timestamp: i64,
}

#[derive(Debug, Serialize)]
pub struct FeedResponse {
    pub success: bool,
    pub data: StoredState,
    pub timestamp: i64,
}

#[derive(Debug, Serialize)]
pub struct FeedsResponse {
    pub success: bool,
    pub data: Vec<StoredState>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub success: bool,
    pub data: Vec<AggregateRecord>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct RejectionsResponse {
    pub success: bool,
    pub data: Vec<RejectionRecord>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub success: bool,
    pub data: HealthReport,
    pub timestamp: i64,
}

// ============================================================================
// ERROR HANDLING
// ============================================================================

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServiceError::InvalidRequest(_)
            | ServiceError::InvalidKey(_)
            | ServiceError::InvalidBundle(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) | ServiceError::Pipeline(PipelineError::UnknownQueue(_)) => {
                StatusCode::NOT_FOUND
            }
            ServiceError::DatabaseError(_)
            | ServiceError::RedisError(_)
            | ServiceError::SerializationError(_)
            | ServiceError::CorruptRecord(_)
            | ServiceError::UnstorableValue(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }

        let body = Json(serde_json::json!({
            "success": false,
            "error": self.to_string(),
        }));

        (status, body).into_response()
    }
}
