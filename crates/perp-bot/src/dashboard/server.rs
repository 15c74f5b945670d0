//! Dashboard HTTP API.
//!
//! Endpoints (all JSON, port 8080 by default):
//! - `GET /api/state` - latest context, decision, market data, interval
//! - `GET /api/history` - every advisor turn this run
//! - `GET/POST /api/loop_interval` - read/write the cycle interval
//! - `POST /api/close_all` - market-close every open position
//! - `POST /api/set_leverage` - change leverage for one symbol
//!
//! `GET /` serves the static dashboard page from `web/` when present.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::services::ServeDir;
use tracing::{error, info, warn};

use perp_common::Side;

use crate::exchange::Exchange;
use crate::types::{Decision, DecisionAction};

use super::state::DashboardState;

#[derive(Clone)]
struct AppState {
    dashboard: Arc<DashboardState>,
    exchange: Arc<dyn Exchange>,
}

/// Build the router and serve it on `port` in a background task.
pub fn spawn_server(
    port: u16,
    dashboard: Arc<DashboardState>,
    exchange: Arc<dyn Exchange>,
) -> tokio::task::JoinHandle<()> {
    let state = AppState {
        dashboard,
        exchange,
    };

    let app = Router::new()
        .route("/api/state", get(get_state))
        .route("/api/history", get(get_history))
        .route("/api/loop_interval", get(get_interval).post(set_interval))
        .route("/api/close_all", post(close_all))
        .route("/api/set_leverage", post(set_leverage))
        .fallback_service(ServeDir::new("web").append_index_html_on_directories(true))
        .with_state(state);

    tokio::spawn(async move {
        let addr = format!("0.0.0.0:{port}");
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(addr, error = %e, "dashboard bind failed");
                return;
            }
        };
        info!("dashboard listening on http://localhost:{port}");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "dashboard server stopped");
        }
    })
}

async fn get_state(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.dashboard.state_payload().await)
}

async fn get_history(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.dashboard.history().await)
}

async fn get_interval(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "loop_interval_seconds": state.dashboard.loop_interval_secs().await,
    }))
}

#[derive(Deserialize)]
struct IntervalRequest {
    loop_interval_seconds: u64,
}

async fn set_interval(
    State(state): State<AppState>,
    Json(req): Json<IntervalRequest>,
) -> impl IntoResponse {
    match state
        .dashboard
        .set_loop_interval_secs(req.loop_interval_seconds)
        .await
    {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ok",
                "loop_interval_seconds": req.loop_interval_seconds,
            })),
        ),
        Err(message) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": message })),
        ),
    }
}

/// Close every open position at market. Operator panic button.
async fn close_all(State(state): State<AppState>) -> impl IntoResponse {
    let positions = state.exchange.positions().await;
    let mut closed = 0usize;
    let mut errors = Vec::new();

    for p in positions {
        let action = match p.side {
            Side::Long => DecisionAction::CloseLong,
            Side::Short => DecisionAction::CloseShort,
        };
        let decision = Decision {
            symbol: p.symbol.clone(),
            action,
            reasoning: "operator close_all".into(),
            ..Default::default()
        };
        match state.exchange.execute_decision(&decision).await {
            Ok(()) => closed += 1,
            Err(e) => {
                warn!(symbol = %p.symbol, error = %e, "close_all failed for position");
                errors.push(format!("{}: {e}", p.symbol));
            }
        }
    }

    let mut body = serde_json::json!({ "status": "ok", "closed": closed });
    if !errors.is_empty() {
        body["errors"] = serde_json::json!(errors);
    }
    Json(body)
}

#[derive(Deserialize)]
struct SetLeverageRequest {
    symbol: String,
    leverage: u32,
}

async fn set_leverage(
    State(state): State<AppState>,
    Json(req): Json<SetLeverageRequest>,
) -> impl IntoResponse {
    if req.symbol.is_empty() || req.leverage == 0 {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "symbol and positive leverage required" })),
        );
    }

    match state
        .exchange
        .set_leverage(&req.symbol, req.leverage)
        .await
    {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "status": "ok" }))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}
