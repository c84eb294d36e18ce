use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::book::OrderBook;
use crate::config::DatabaseConfig;
use crate::error::EngineError;
use crate::order::{Market, Order, OrderStatus, Side, FIXED_SCALE};

pub(crate) async fn connect(cfg: &DatabaseConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .min_connections(cfg.min_pool_size)
        .max_connections(cfg.max_pool_size)
        .acquire_timeout(Duration::from_secs(cfg.acquire_timeout_seconds))
        .max_lifetime(Duration::from_secs(cfg.max_lifetime_seconds))
        .connect(&cfg.url)
        .await
        .context("failed to connect to postgres")
}

/// Scaled i64 -> NUMERIC(20,8). All in-memory amounts carry 8 implied
/// fractional digits, so this is exact.
pub(crate) fn to_db_amount(v: i64) -> Decimal {
    Decimal::from_i128_with_scale(v as i128, FIXED_SCALE)
}

/// NUMERIC(20,8) -> scaled i64, refusing any value the engine could not
/// round-trip (out of i64 range, or finer than 8 fractional digits).
pub(crate) fn from_db_amount(d: Decimal) -> Result<i64, EngineError> {
    let mut scaled = d;
    scaled.rescale(FIXED_SCALE);
    let v = i64::try_from(scaled.mantissa())
        .map_err(|_| EngineError::Invariant(format!("stored amount {d} exceeds engine range")))?;
    if to_db_amount(v) != d {
        return Err(EngineError::Invariant(format!("stored amount {d} loses precision at scale {FIXED_SCALE}")));
    }
    Ok(v)
}

fn order_from_row(row: &PgRow) -> Result<Order, EngineError> {
    let side: String = row.get("side");
    let status: String = row.get("status");
    let status = OrderStatus::parse(&status)?;
    if !matches!(status, OrderStatus::Open | OrderStatus::Partial) {
        return Err(EngineError::Invariant(format!(
            "terminal order {} returned by live-order query",
            row.get::<uuid::Uuid, _>("id")
        )));
    }
    Ok(Order {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        market: row.get("market"),
        side: Side::parse(&side)?,
        price: from_db_amount(row.get("price"))?,
        quantity: from_db_amount(row.get("quantity"))?,
        remaining: from_db_amount(row.get("remaining"))?,
        // Market orders never rest, so every recovered order is a limit.
        is_market: false,
        created_at: row.get("created_at"),
    })
}

/// All OPEN/PARTIAL orders in canonical book order: asks by price ascending,
/// bids by price descending, ties broken by created_at then id so time
/// priority survives a restart.
pub(crate) async fn load_open_orders(db: &PgPool, market: Option<&str>) -> Result<Vec<Order>, EngineError> {
    let mut out = Vec::new();
    for (side, order_by) in [
        ("SELL", "price ASC, created_at ASC, id ASC"),
        ("BUY", "price DESC, created_at ASC, id ASC"),
    ] {
        let sql = format!(
            "SELECT id, owner_id, market, side, price, quantity, remaining, status, created_at \
             FROM orders \
             WHERE status IN ('OPEN', 'PARTIAL') AND side = $1 AND ($2::text IS NULL OR market = $2) \
             ORDER BY {order_by}"
        );
        let rows = sqlx::query(&sql).bind(side).bind(market).fetch_all(db).await?;
        for r in rows {
            out.push(order_from_row(&r)?);
        }
    }
    Ok(out)
}

/// Rebuild the in-memory book from durable storage. Runs once, before the
/// command loop starts consuming.
pub(crate) async fn bootstrap_book(db: &PgPool, market: &Market) -> Result<OrderBook, EngineError> {
    let orders = load_open_orders(db, Some(&market.symbol)).await?;
    let mut book = OrderBook::new();
    for o in orders {
        book.add(o)?;
    }
    tracing::info!(
        market = %market.symbol,
        orders = book.len(),
        best_bid = ?book.best_bid(),
        best_ask = ?book.best_ask(),
        "book_reloaded"
    );
    Ok(book)
}

/// Durable view of one order as the read endpoints expose it.
#[derive(Debug, Serialize)]
pub(crate) struct OrderRecord {
    pub(crate) id: Uuid,
    pub(crate) owner_id: Uuid,
    pub(crate) market: String,
    pub(crate) side: Side,
    pub(crate) price: i64,
    pub(crate) quantity: i64,
    pub(crate) remaining: i64,
    pub(crate) status: OrderStatus,
    pub(crate) created_at: DateTime<Utc>,
}

pub(crate) async fn fetch_order(db: &PgPool, id: Uuid) -> Result<Option<OrderRecord>, EngineError> {
    let row = sqlx::query(
        "SELECT id, owner_id, market, side, price, quantity, remaining, status, created_at \
         FROM orders WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(db)
    .await?;
    let Some(r) = row else {
        return Ok(None);
    };
    let side: String = r.get("side");
    let status: String = r.get("status");
    Ok(Some(OrderRecord {
        id: r.get("id"),
        owner_id: r.get("owner_id"),
        market: r.get("market"),
        side: Side::parse(&side)?,
        price: from_db_amount(r.get("price"))?,
        quantity: from_db_amount(r.get("quantity"))?,
        remaining: from_db_amount(r.get("remaining"))?,
        status: OrderStatus::parse(&status)?,
        created_at: r.get("created_at"),
    }))
}

#[derive(Debug, Serialize)]
pub(crate) struct AssetBalance {
    pub(crate) asset: String,
    pub(crate) balance: i64,
}

/// Per-asset balances for one owner. The stored account balance is not
/// authoritative; balances are the signed sum of ledger entries.
pub(crate) async fn owner_balances(db: &PgPool, owner_id: Uuid) -> Result<Vec<AssetBalance>, EngineError> {
    let rows = sqlx::query(
        r#"
        SELECT a.asset, COALESCE(SUM(e.amount), 0) AS balance
        FROM accounts a
        LEFT JOIN ledger_entries e ON e.account_id = a.id
        WHERE a.owner_id = $1
        GROUP BY a.asset
        ORDER BY a.asset
        "#,
    )
    .bind(owner_id)
    .fetch_all(db)
    .await?;
    let mut out = Vec::with_capacity(rows.len());
    for r in rows {
        out.push(AssetBalance {
            asset: r.get("asset"),
            balance: from_db_amount(r.get("balance"))?,
        });
    }
    Ok(out)
}

/// Idempotent schema bootstrap for the DB-backed tests.
#[cfg(test)]
pub(crate) async fn init_schema(db: &PgPool) -> Result<(), EngineError> {
    let sql: String = include_str!("../schema.sql")
        .lines()
        .filter(|l| !l.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n");
    for stmt in sql.split(';') {
        if stmt.trim().is_empty() {
            continue;
        }
        sqlx::query(stmt).execute(db).await?;
    }
    Ok(())
}
