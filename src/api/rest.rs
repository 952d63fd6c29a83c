// =============================================================================
// REST API Endpoints - Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Health is public; every other endpoint
// requires a valid Bearer token checked via the `AuthBearer` extractor.
//
// Trade errors map onto HTTP statuses:
//   Validation -> 400, NotFound -> 404, AlreadyClosed -> 409,
//   OrderPlacement / PriceFetch -> 502. Exit price failures surface as
//   OrderPlacement.
//
// CORS is configured permissively; tighten `allow_origin` in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::error::TradeError;
use crate::execution::TradeStatusView;
use crate::position_store::{PositionRecord, TradeProposal};
use crate::runtime_config::RuntimeConfig;
use crate::types::AccountMode;

// =============================================================================
// Router construction
// =============================================================================

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/trades", post(open_trade).get(list_trades))
        .route("/api/v1/trades/history", get(trade_history))
        .route("/api/v1/trades/:id", get(trade_status))
        .route("/api/v1/trades/:id/close", post(close_trade))
        .route("/api/v1/config", get(get_config))
        // ── WebSocket ───────────────────────────────────────────────
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Error mapping
// =============================================================================

pub struct ApiError(TradeError);

impl From<TradeError> for ApiError {
    fn from(err: TradeError) -> Self {
        Self(err)
    }
}

pub fn status_for(err: &TradeError) -> StatusCode {
    match err {
        TradeError::Validation(_) => StatusCode::BAD_REQUEST,
        TradeError::NotFound(_) => StatusCode::NOT_FOUND,
        TradeError::AlreadyClosed(_) => StatusCode::CONFLICT,
        TradeError::OrderPlacement { .. } | TradeError::PriceFetch { .. } => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.0.to_string(),
            "retryable": self.0.is_retryable(),
        });
        (status_for(&self.0), Json(body)).into_response()
    }
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    open_trades: usize,
    monitors: usize,
    account_mode: AccountMode,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let account_mode = state.runtime_config.read().account_mode;
    let open_trades = state.executor.store().active_ids().await.len();
    let resp = HealthResponse {
        status: "ok",
        uptime_secs: state.uptime_secs(),
        open_trades,
        monitors: state.scheduler.active_count(),
        account_mode,
        server_time: chrono::Utc::now().timestamp_millis(),
    };
    Json(resp)
}

// =============================================================================
// Trades (authenticated)
// =============================================================================

async fn open_trade(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(proposal): Json<TradeProposal>,
) -> Result<(StatusCode, Json<PositionRecord>), ApiError> {
    info!(symbol = %proposal.symbol, strategy = %proposal.strategy, "open requested via API");
    let record = state.open_and_monitor(&proposal).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn list_trades(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> Json<Vec<TradeStatusView>> {
    Json(state.executor.open_trades().await)
}

async fn trade_history(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> Json<Vec<PositionRecord>> {
    Json(state.executor.history())
}

async fn trade_status(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(trade_id): Path<String>,
) -> Result<Json<TradeStatusView>, ApiError> {
    Ok(Json(state.executor.status(&trade_id).await?))
}

async fn close_trade(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(trade_id): Path<String>,
) -> Result<Json<PositionRecord>, ApiError> {
    info!(trade_id = %trade_id, "manual close requested via API");
    Ok(Json(state.force_close(&trade_id).await?))
}

// =============================================================================
// Config (authenticated)
// =============================================================================

async fn get_config(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> Json<RuntimeConfig> {
    Json(state.runtime_config.read().clone())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{proposal, MockGateway};
    use crate::types::{CloseReason, PositionStatus};

    fn auth() -> AuthBearer {
        AuthBearer("test".into())
    }

    fn state(gw: Arc<MockGateway>) -> Arc<AppState> {
        Arc::new(AppState::new(RuntimeConfig::default(), gw, None))
    }

    #[test]
    fn trade_errors_map_to_statuses() {
        assert_eq!(status_for(&TradeError::Validation("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&TradeError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&TradeError::AlreadyClosed("x".into())), StatusCode::CONFLICT);
        let placement = TradeError::OrderPlacement {
            context: "entry".into(),
            source: anyhow::anyhow!("rejected"),
        };
        assert_eq!(status_for(&placement), StatusCode::BAD_GATEWAY);
        assert_eq!(ApiError::from(placement).into_response().status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test(start_paused = true)]
    async fn open_status_close_round_trip() {
        let gw = MockGateway::with_price(100.0);
        let st = state(gw.clone());

        let (code, Json(record)) = open_trade(
            auth(),
            State(st.clone()),
            Json(proposal("long", 100.0, 110.0, 95.0, 50.0)),
        )
        .await
        .ok()
        .unwrap();
        assert_eq!(code, StatusCode::CREATED);

        let Json(open) = list_trades(auth(), State(st.clone())).await;
        assert_eq!(open.len(), 1);

        gw.set_price(102.0);
        let Json(view) = trade_status(auth(), State(st.clone()), Path(record.trade_id.clone()))
            .await
            .ok()
            .unwrap();
        assert_eq!(view.current_price, Some(102.0));

        let Json(closed) = close_trade(auth(), State(st.clone()), Path(record.trade_id.clone()))
            .await
            .ok()
            .unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(closed.close_reason, Some(CloseReason::Manual));

        let again = close_trade(auth(), State(st.clone()), Path(record.trade_id.clone())).await;
        let status = again.err().unwrap().into_response().status();
        assert_eq!(status, StatusCode::CONFLICT);

        let Json(history) = trade_history(auth(), State(st)).await;
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn invalid_proposal_is_bad_request() {
        let st = state(MockGateway::with_price(100.0));
        let res = open_trade(
            auth(),
            State(st),
            Json(proposal("flat", 100.0, 110.0, 95.0, 50.0)),
        )
        .await;
        assert_eq!(res.err().unwrap().into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_trade_is_not_found() {
        let st = state(MockGateway::with_price(100.0));
        let res = trade_status(auth(), State(st), Path("missing".into())).await;
        assert_eq!(res.err().unwrap().into_response().status(), StatusCode::NOT_FOUND);
    }
}
