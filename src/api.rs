//! Operational HTTP/WebSocket surface: health, depth, statistics, and a
//! market-data stream.
//!
//! Order flow is FIX-only; this router is read-only. Market data reaches
//! WebSocket subscribers through a broadcast topic the matching thread
//! never waits on: the engine event drain (in the binary) publishes
//! snapshots, subscribers poll their own receivers.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Extension, Path, Query,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::engine::{MarketDataSnapshot, MatchingEngine};
use crate::gateway::Gateway;

/// Shared state for the API handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<MatchingEngine>,
    pub gateway: Arc<Gateway>,
    pub market_data_tx: broadcast::Sender<MarketDataSnapshot>,
}

/// Builds app state plus the market-data topic the event drain publishes
/// into.
pub fn create_app_state(engine: Arc<MatchingEngine>, gateway: Arc<Gateway>) -> AppState {
    let (market_data_tx, _) = broadcast::channel(64);
    AppState {
        engine,
        gateway,
        market_data_tx,
    }
}

/// Builds the router. Returns `Router<()>` for `axum::serve`.
pub fn create_router(state: AppState) -> Router<()> {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/symbols", get(symbols))
        .route("/depth/{symbol}", get(depth))
        .route("/ws/market-data", get(ws_market_data))
        .layer(Extension(state))
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn stats(Extension(state): Extension<AppState>) -> Response {
    #[derive(serde::Serialize)]
    struct Out {
        engine: crate::engine::StatisticsSnapshot,
        active_sessions: usize,
        open_orders: usize,
    }
    (
        StatusCode::OK,
        Json(Out {
            engine: state.engine.statistics(),
            active_sessions: state.gateway.session_count(),
            open_orders: state.gateway.open_order_count(),
        }),
    )
        .into_response()
}

async fn symbols(Extension(state): Extension<AppState>) -> Response {
    let mut symbols = state.engine.symbols();
    symbols.sort();
    (StatusCode::OK, Json(symbols)).into_response()
}

#[derive(serde::Deserialize)]
struct DepthParams {
    levels: Option<usize>,
}

async fn depth(
    Extension(state): Extension<AppState>,
    Path(symbol): Path<String>,
    Query(params): Query<DepthParams>,
) -> Response {
    #[derive(serde::Serialize)]
    struct Out {
        symbol: String,
        bids: Vec<(Decimal, u64)>,
        asks: Vec<(Decimal, u64)>,
    }
    let levels = params.levels.unwrap_or(5).clamp(1, 100);
    match state.engine.depth(&symbol, levels) {
        Some((bids, asks)) => (
            StatusCode::OK,
            Json(Out {
                symbol,
                bids,
                asks,
            }),
        )
            .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "unknown symbol" })),
        )
            .into_response(),
    }
}

/// On connect, send one snapshot per known symbol, then stream broadcast
/// updates until the subscriber goes away.
async fn ws_market_data(
    Extension(state): Extension<AppState>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| handle_market_data_socket(state, socket))
}

async fn handle_market_data_socket(state: AppState, mut socket: WebSocket) {
    for symbol in state.engine.symbols() {
        if let Some(snapshot) = state.engine.market_data(&symbol) {
            if send_snapshot(&mut socket, &snapshot).await.is_err() {
                return;
            }
        }
    }

    let mut rx = state.market_data_tx.subscribe();
    loop {
        tokio::select! {
            update = rx.recv() => {
                match update {
                    Ok(snapshot) => {
                        if send_snapshot(&mut socket, &snapshot).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            inbound = socket.recv() => match inbound {
                Some(Ok(_)) => {}
                _ => break,
            },
        }
    }
}

async fn send_snapshot(
    socket: &mut WebSocket,
    snapshot: &MarketDataSnapshot,
) -> Result<(), axum::Error> {
    let json = match serde_json::to_string(snapshot) {
        Ok(s) => s,
        Err(_) => return Ok(()),
    };
    socket.send(Message::Text(json.into())).await
}
