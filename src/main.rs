use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod book;
mod config;
mod engine;
mod error;
mod matcher;
mod order;
mod settle;
mod store;

use crate::config::load_config;
use crate::engine::Engine;
use crate::error::ApiError;
use crate::order::{Market, Order, Side, Trade};

#[derive(Clone)]
struct AppState {
    engine: Engine,
    db: sqlx::PgPool,
    command_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct PlaceOrderRequest {
    id: Uuid,
    owner_id: Uuid,
    market: String,
    side: String,
    #[serde(default)]
    price: i64,
    quantity: i64,
    #[serde(default)]
    is_market: bool,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct OrderCreateResponse {
    order_id: Uuid,
    owner_id: Uuid,
    market: String,
    side: Side,
    quantity: i64,
    filled: bool,
    remaining: i64,
    resting: bool,
    trades: Vec<Trade>,
    received_at: DateTime<Utc>,
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn create_order(
    State(state): State<AppState>,
    Json(req): Json<PlaceOrderRequest>,
) -> Result<(StatusCode, Json<OrderCreateResponse>), ApiError> {
    let side = Side::parse(&req.side)?;
    let order = Order {
        id: req.id,
        owner_id: req.owner_id,
        market: req.market.trim().to_string(),
        side,
        price: req.price,
        quantity: req.quantity,
        remaining: req.quantity,
        is_market: req.is_market,
        created_at: req.created_at.unwrap_or_else(Utc::now),
    };

    let res = state.engine.place(order, state.command_timeout).await?;
    let remaining = res.taker_remaining();
    let resting = res.remainder.is_some() && !req.is_market;
    Ok((
        StatusCode::CREATED,
        Json(OrderCreateResponse {
            order_id: req.id,
            owner_id: req.owner_id,
            market: req.market,
            side,
            quantity: req.quantity,
            filled: res.order_filled,
            remaining,
            resting,
            trades: res.trades,
            received_at: Utc::now(),
        }),
    ))
}

async fn cancel_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let was_live = state.engine.cancel(order_id, state.command_timeout).await?;
    if !was_live {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "order not found"));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<store::OrderRecord>, ApiError> {
    match store::fetch_order(&state.db, order_id).await? {
        Some(rec) => Ok(Json(rec)),
        None => Err(ApiError::new(StatusCode::NOT_FOUND, "order not found")),
    }
}

#[derive(Debug, Deserialize)]
struct BalancesQuery {
    owner_id: Uuid,
}

async fn get_balances(
    State(state): State<AppState>,
    Query(q): Query<BalancesQuery>,
) -> Result<Json<Vec<store::AssetBalance>>, ApiError> {
    Ok(Json(store::owner_balances(&state.db, q.owner_id).await?))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = Arc::new(load_config()?);
    let market = Market::parse(&cfg.engine.market)
        .map_err(|e| anyhow::anyhow!("ENGINE_MARKET: {e}"))?;

    let db = store::connect(&cfg.database).await?;

    // The book must be whole before the loop accepts its first command.
    let book = store::bootstrap_book(&db, &market)
        .await
        .map_err(|e| anyhow::anyhow!("bootstrap: {e}"))?;
    let engine = Engine::start(book, Some(db.clone()), market.clone(), cfg.engine.queue_capacity);

    let state = AppState {
        engine,
        db,
        command_timeout: Duration::from_millis(cfg.engine.command_timeout_ms),
    };

    let allowed_headers = [AUTHORIZATION, CONTENT_TYPE, ACCEPT];
    let allowed_methods = [Method::GET, Method::POST, Method::DELETE, Method::OPTIONS];
    let cors = if cfg.api.cors_origins.iter().any(|x| x == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(allowed_methods)
            .allow_headers(allowed_headers)
    } else {
        let origins: Vec<HeaderValue> = cfg
            .api
            .cors_origins
            .iter()
            .filter_map(|origin| HeaderValue::from_str(origin).ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(allowed_methods)
            .allow_headers(allowed_headers)
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/orders", post(create_order))
        .route("/orders/{order_id}", get(get_order).delete(cancel_order))
        .route("/balances", get(get_balances))
        .layer(cors)
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", cfg.api.host, cfg.api.port)
        .parse()
        .context("invalid API_HOST/API_PORT")?;
    tracing::info!(market = %market.symbol, addr = %addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
