//! HTTP routes.
//!
//! The game client only uses `/start_session`, `/end_session` and `/roll`;
//! the `/api` routes are for operators and the read side.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;

use dicelog_domain::{CommandKind, SessionId, StatsScope};
use dicelog_shared::{
    CriticalCounts, CurrentSessionResponse, DeadLetterDto, DeadLetterQuery, ErrorResponse,
    PlayerAverage, QueueStatus,
    RequeueResponse, RollDto, SessionAverage, SessionRollsResponse, SessionStartedResponse,
    SessionStatsQuery, StatsScopeQuery, StatusResponse,
};

use crate::app::App;
use crate::infrastructure::ports::{QueueError, RepoError};
use crate::use_cases::commands::SubmitError;
use crate::use_cases::session::SessionCoordinatorError;

/// Create all HTTP routes.
pub fn routes() -> Router<Arc<App>> {
    Router::new()
        .route("/", get(health))
        .route("/api/health", get(health))
        .route("/start_session", post(start_session))
        .route("/end_session", post(end_session))
        .route("/roll", post(roll))
        .route("/api/sessions/current", get(current_session))
        .route("/api/sessions/{id}/rolls", get(session_rolls))
        .route("/api/stats/sessions", get(session_averages))
        .route("/api/stats/players", get(player_averages))
        .route("/api/stats/criticals", get(critical_rolls))
        .route("/api/queues", get(queue_status))
        .route("/api/queues/{queue}/dead_letters", get(list_dead_letters))
        .route(
            "/api/queues/{queue}/dead_letters/requeue",
            post(requeue_dead_letters),
        )
}

async fn health() -> &'static str {
    "OK"
}

// =============================================================================
// Game client
// =============================================================================

async fn start_session(
    State(app): State<Arc<App>>,
) -> Result<Json<SessionStartedResponse>, ApiError> {
    let id = app.coordinator.start_session().await?;
    Ok(Json(SessionStartedResponse::new(id.get())))
}

async fn end_session(State(app): State<Arc<App>>) -> Result<Json<StatusResponse>, ApiError> {
    app.producer.submit_end_session().await?;
    Ok(Json(StatusResponse::queued()))
}

/// The body is taken raw: the client sends either JSON or URL-encoded JSON,
/// with whatever content type.
async fn roll(State(app): State<Arc<App>>, body: String) -> Result<Json<StatusResponse>, ApiError> {
    app.producer.submit_roll(&body).await?;
    Ok(Json(StatusResponse::success()))
}

// =============================================================================
// Sessions
// =============================================================================

async fn current_session(State(app): State<Arc<App>>) -> Json<CurrentSessionResponse> {
    let session_id = app.coordinator.current_session_id().await;
    Json(CurrentSessionResponse {
        session_id: session_id.map(|id| id.get()),
    })
}

async fn session_rolls(
    State(app): State<Arc<App>>,
    Path(id): Path<i64>,
) -> Result<Json<SessionRollsResponse>, ApiError> {
    let session_id = SessionId::new(id);
    let session = app
        .repositories
        .sessions
        .get_session(session_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Session {} not found", id)))?;

    let rolls = app.repositories.rolls.list_session_rolls(session_id).await?;

    Ok(Json(SessionRollsResponse {
        session_id: session.id.get(),
        start_time: session.start_time.to_rfc3339(),
        end_time: session.end_time.map(|t| t.to_rfc3339()),
        rolls: rolls.into_iter().map(RollDto::from).collect(),
    }))
}

// =============================================================================
// Statistics
// =============================================================================

async fn session_averages(
    State(app): State<Arc<App>>,
    Query(query): Query<SessionStatsQuery>,
) -> Result<Json<Vec<SessionAverage>>, ApiError> {
    let rows = app
        .repositories
        .stats
        .average_by_session(query.by_player)
        .await?;
    Ok(Json(rows))
}

async fn player_averages(
    State(app): State<Arc<App>>,
    Query(query): Query<StatsScopeQuery>,
) -> Result<Json<Vec<PlayerAverage>>, ApiError> {
    let scope = parse_scope(&query)?;
    let rows = app.repositories.stats.average_by_player(scope).await?;
    Ok(Json(rows))
}

async fn critical_rolls(
    State(app): State<Arc<App>>,
    Query(query): Query<StatsScopeQuery>,
) -> Result<Json<Vec<CriticalCounts>>, ApiError> {
    let scope = parse_scope(&query)?;
    let rows = app.repositories.stats.critical_rolls_by_player(scope).await?;
    Ok(Json(rows))
}

fn parse_scope(query: &StatsScopeQuery) -> Result<StatsScope, ApiError> {
    query
        .session
        .as_deref()
        .unwrap_or("all")
        .parse()
        .map_err(|e: dicelog_domain::DomainError| ApiError::BadRequest(e.to_string()))
}

// =============================================================================
// Queues
// =============================================================================

async fn queue_status(State(app): State<Arc<App>>) -> Result<Json<Vec<QueueStatus>>, ApiError> {
    let mut statuses = Vec::new();
    for queue in app.queues.all() {
        statuses.push(QueueStatus {
            queue: queue.kind().to_string(),
            depth: queue.depth().await?,
            dead_letters: queue.dead_letter_count().await?,
        });
    }
    Ok(Json(statuses))
}

const DEFAULT_DEAD_LETTER_LIMIT: usize = 50;

fn parse_queue(queue: &str) -> Result<CommandKind, ApiError> {
    queue
        .parse()
        .map_err(|_| ApiError::NotFound(format!("Unknown queue: {}", queue)))
}

async fn list_dead_letters(
    State(app): State<Arc<App>>,
    Path(queue): Path<String>,
    Query(query): Query<DeadLetterQuery>,
) -> Result<Json<Vec<DeadLetterDto>>, ApiError> {
    let kind = parse_queue(&queue)?;
    let limit = query.limit.unwrap_or(DEFAULT_DEAD_LETTER_LIMIT);

    let dead = app.queues.get(kind).list_dead_letters(limit).await?;
    Ok(Json(
        dead.into_iter()
            .map(|envelope| DeadLetterDto {
                id: envelope.id.to_string(),
                payload: envelope.payload_json,
                attempts: envelope.attempts,
                error: envelope.error_message,
                failed_at: envelope.updated_at.to_rfc3339(),
            })
            .collect(),
    ))
}

async fn requeue_dead_letters(
    State(app): State<Arc<App>>,
    Path(queue): Path<String>,
) -> Result<Json<RequeueResponse>, ApiError> {
    let kind = parse_queue(&queue)?;

    let requeued = app.queues.get(kind).requeue_dead_letters().await?;
    tracing::info!(queue = %kind, requeued, "Requeued dead letters");
    Ok(Json(RequeueResponse { requeued }))
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    QueueUnavailable,
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::QueueUnavailable => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Queue unavailable".to_string(),
            ),
            ApiError::Internal(detail) => {
                tracing::error!(error = %detail, "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse::new(message))).into_response()
    }
}

impl From<SubmitError> for ApiError {
    fn from(e: SubmitError) -> Self {
        match e {
            SubmitError::NoActiveSession => ApiError::BadRequest(e.to_string()),
            SubmitError::MalformedPayload(reason) => ApiError::BadRequest(reason.to_string()),
            SubmitError::BrokerUnavailable(_) => ApiError::QueueUnavailable,
            SubmitError::Serialization(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<SessionCoordinatorError> for ApiError {
    fn from(e: SessionCoordinatorError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<RepoError> for ApiError {
    fn from(e: RepoError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        tracing::error!(error = %e, "Queue operation failed");
        ApiError::QueueUnavailable
    }
}
