mod config;
mod sse;

use axum::http::{HeaderName, HeaderValue};
use axum::middleware;
use axum::response::Response as AxumResponse;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{Method, StatusCode, header},
    routing::{get, post},
};
pub use config::{AppConfig, ConfigError, DEFAULT_EVENT_BUFFER};
use roomies_shared::api;
use roomies_shared::domain::Period;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info_span;
use uuid::Uuid;

use crate::engine::{Engine, EngineError, TaskAward};
use crate::storage::models::{Badge, LedgerEntry};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub engine: Engine,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: AppConfig, engine: Engine) -> Self {
        Self {
            config,
            engine,
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelled on shutdown; long-lived streams end when it fires.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

#[derive(Clone, Debug)]
struct ReqId(pub String);

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/users/{id}/points", get(api_user_ledger))
        .route("/users/{id}/points/award", post(api_award_points))
        .route("/users/{id}/points/deduct", post(api_deduct_points))
        .route("/users/{id}/badges", get(api_user_badges))
        .route(
            "/users/{id}/challenges/{challenge_id}/complete",
            post(api_complete_challenge),
        )
        .route("/tasks/{id}/complete", post(api_complete_task))
        .route("/households/{id}/leaderboard", get(api_leaderboard))
        .route("/households/{id}/analytics", get(api_analytics))
        .route("/households/{id}/events", get(sse::household_events))
        .route("/broker/metrics", get(api_broker_metrics));

    // Trace with request context (method, path, request_id)
    let trace = TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
        let request_id = req
            .extensions()
            .get::<ReqId>()
            .map(|r| r.0.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        info_span!(
            "request",
            method = %req.method(),
            path = %req.uri().path(),
            request_id = %request_id,
        )
    });

    let app = Router::new()
        .route("/healthz", get(health))
        .nest(api::API_V1_PREFIX, api)
        .with_state(state.clone())
        .layer(trace)
        .layer(middleware::from_fn(add_security_headers))
        .layer(middleware::from_fn(add_request_id));

    // Optionally add CORS for dev if configured
    if let Some(origin) = &state.config.dev_cors_origin {
        let hv = header::HeaderValue::from_str(origin)
            .unwrap_or(header::HeaderValue::from_static("http://localhost:5173"));
        let cors = CorsLayer::new()
            .allow_origin(hv)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE]);
        app.layer(cors)
    } else {
        app
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn add_request_id(
    mut req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Result<AxumResponse, AppError> {
    let hdr = HeaderName::from_static("x-request-id");
    // Use provided x-request-id if present, else generate
    let rid = req
        .headers()
        .get(&hdr)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    req.extensions_mut().insert(ReqId(rid.clone()));
    let mut resp = next.run(req).await;
    if let Ok(hv) = HeaderValue::from_str(&rid) {
        resp.headers_mut().insert(hdr, hv);
    }
    Ok(resp)
}

async fn add_security_headers(
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Result<AxumResponse, AppError> {
    let path = req.uri().path().to_string();
    let mut resp = next.run(req).await;

    let headers = resp.headers_mut();
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("no-referrer"),
    );
    headers.insert(
        HeaderName::from_static("cross-origin-resource-policy"),
        HeaderValue::from_static("same-origin"),
    );

    // Everything served here is live state
    if path == "/healthz" || path.starts_with("/api/") {
        headers.insert(
            HeaderName::from_static("cache-control"),
            HeaderValue::from_static("no-store, no-cache, must-revalidate, private"),
        );
    }

    Ok(resp)
}

fn badge_dto(b: Badge) -> api::BadgeDto {
    api::BadgeDto {
        type_key: b.type_key,
        name: b.name,
        description: b.description,
        icon_key: b.icon_key,
        earned_at: b.earned_at.and_utc().to_rfc3339(),
    }
}

fn ledger_dto(e: LedgerEntry) -> api::LedgerEntryDto {
    api::LedgerEntryDto {
        delta: e.delta,
        balance_after: e.balance_after,
        reason: e.reason,
        task_id: e.task_id,
        created_at: e.created_at.and_utc().to_rfc3339(),
    }
}

async fn api_award_points(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<api::PointsReq>,
) -> Result<Json<api::PointsResp>, AppError> {
    let new_total = state.engine.ledger.award(&id, body.delta, &body.reason).await?;
    Ok(Json(api::PointsResp {
        user_id: id,
        new_total,
    }))
}

async fn api_deduct_points(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<api::PointsReq>,
) -> Result<Json<api::PointsResp>, AppError> {
    let new_total = state
        .engine
        .ledger
        .deduct(&id, body.delta, &body.reason)
        .await?;
    Ok(Json(api::PointsResp {
        user_id: id,
        new_total,
    }))
}

#[derive(Deserialize)]
struct PageOpts {
    page: Option<usize>,
    per_page: Option<usize>,
}

async fn api_user_ledger(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(p): Query<PageOpts>,
) -> Result<Json<Vec<api::LedgerEntryDto>>, AppError> {
    let rows = state
        .engine
        .ledger
        .history(&id, p.page.unwrap_or(1), p.per_page.unwrap_or(100))
        .await?;
    Ok(Json(rows.into_iter().map(ledger_dto).collect()))
}

async fn api_complete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<api::CompleteTaskReq>,
) -> Result<Json<api::CompleteTaskResp>, AppError> {
    let outcome = state
        .engine
        .ledger
        .complete_task(&id, &body.user_id, body.completed_at)
        .await?;
    let resp = match outcome {
        TaskAward::Awarded {
            new_total, badges, ..
        } => api::CompleteTaskResp {
            task_id: id,
            awarded: true,
            new_total: Some(new_total),
            badges: badges.into_iter().map(badge_dto).collect(),
        },
        TaskAward::AlreadyCompleted => api::CompleteTaskResp {
            task_id: id,
            awarded: false,
            new_total: None,
            badges: Vec::new(),
        },
    };
    Ok(Json(resp))
}

#[derive(Deserialize)]
struct ChallengePath {
    id: String,
    challenge_id: String,
}

async fn api_complete_challenge(
    State(state): State<AppState>,
    Path(p): Path<ChallengePath>,
) -> Result<Json<api::ChallengeResp>, AppError> {
    let (recorded, badges) = state
        .engine
        .ledger
        .record_challenge(&p.id, &p.challenge_id)
        .await?;
    Ok(Json(api::ChallengeResp {
        user_id: p.id,
        challenge_id: p.challenge_id,
        recorded,
        badges: badges.into_iter().map(badge_dto).collect(),
    }))
}

async fn api_user_badges(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<api::BadgeDto>>, AppError> {
    let rows = state.engine.badges.list_badges(&id).await?;
    Ok(Json(rows.into_iter().map(badge_dto).collect()))
}

#[derive(Deserialize)]
struct LeaderboardQuery {
    period: Option<String>,
}

async fn api_leaderboard(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<LeaderboardQuery>,
) -> Result<Json<api::LeaderboardDto>, AppError> {
    let period = match q.period.as_deref() {
        None => Period::Week,
        Some(s) => s
            .parse::<Period>()
            .map_err(|e| AppError::bad_request(e.to_string()))?,
    };
    let entries = state.engine.leaderboard.rank(&id, period).await?;
    Ok(Json(api::LeaderboardDto {
        household_id: id,
        period,
        entries,
    }))
}

async fn api_analytics(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<api::AnalyticsSnapshotDto>, AppError> {
    Ok(Json(state.engine.analytics.snapshot(&id).await?))
}

async fn api_broker_metrics(State(state): State<AppState>) -> Json<api::BrokerMetricsDto> {
    Json(state.engine.broker.metrics())
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl AppError {
    fn bad_request<T: Into<String>>(msg: T) -> Self {
        Self::BadRequest(msg.into())
    }
    fn not_found<T: Into<String>>(msg: T) -> Self {
        Self::NotFound(msg.into())
    }
    fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<EngineError> for AppError {
    fn from(value: EngineError) -> Self {
        match value {
            EngineError::Validation(m) => AppError::bad_request(m),
            e @ (EngineError::UserNotFound(_)
            | EngineError::HouseholdNotFound(_)
            | EngineError::TaskNotFound(_)) => AppError::not_found(e.to_string()),
            e @ EngineError::Conflict(_) => AppError::Conflict(e.to_string()),
            e @ EngineError::Storage(_) => AppError::internal(e),
        }
    }
}

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, msg, kind, detail) = match self {
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, m, "bad_request", None),
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, m, "not_found", None),
            AppError::Conflict(m) => (StatusCode::CONFLICT, m, "conflict", None),
            // Do not leak internal error details to clients, but log them
            AppError::Internal(m) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error".into(),
                "internal",
                Some(m),
            ),
        };
        if let Some(detail) = detail {
            tracing::error!(status = %status, kind = kind, message = %msg, detail = %detail, "request failed");
        } else {
            tracing::warn!(status = %status, kind = kind, message = %msg, "request failed");
        }
        let body = axum::Json(ErrorBody { error: msg });
        (status, body).into_response()
    }
}
