use std::collections::{BTreeMap, HashMap};

use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::error::EngineError;
use crate::matcher::MatchResult;
use crate::order::{checked_notional, derive_status, Market, Order, OrderStatus, Side, Trade};
use crate::store::{from_db_amount, to_db_amount};

/// One signed ledger amount destined for an (owner, asset) account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LedgerPost<'a> {
    pub(crate) owner_id: Uuid,
    pub(crate) asset: &'a str,
    pub(crate) amount: i64,
}

/// The four entries settling one trade: the buyer pays notional in the quote
/// asset and receives the base quantity; the seller mirrors. Sums to zero per
/// asset by construction.
pub(crate) fn trade_ledger_posts<'a>(
    market: &'a Market,
    taker_side: Side,
    taker_owner: Uuid,
    maker_owner: Uuid,
    price: i64,
    quantity: i64,
) -> Result<[LedgerPost<'a>; 4], EngineError> {
    if quantity <= 0 {
        return Err(EngineError::Invariant(format!("trade with non-positive quantity {quantity}")));
    }
    let notional = checked_notional(price, quantity)
        .filter(|n| *n > 0)
        .ok_or_else(|| EngineError::Invariant(format!("notional {price} * {quantity} out of range")))?;
    let (buyer, seller) = match taker_side {
        Side::Buy => (taker_owner, maker_owner),
        Side::Sell => (maker_owner, taker_owner),
    };
    Ok([
        LedgerPost { owner_id: buyer, asset: &market.quote, amount: -notional },
        LedgerPost { owner_id: buyer, asset: &market.base, amount: quantity },
        LedgerPost { owner_id: seller, asset: &market.base, amount: -quantity },
        LedgerPost { owner_id: seller, asset: &market.quote, amount: notional },
    ])
}

struct LockedOrder {
    owner_id: Uuid,
    side: Side,
    quantity: i64,
    remaining: i64,
}

/// Persist one Place command atomically: upsert the incoming order with its
/// post-match state, insert every trade with its balanced ledger, then bring
/// each touched maker row up to date. Any failure rolls the whole command
/// back and surfaces to the command loop.
pub(crate) async fn settle_place(
    db: &PgPool,
    market: &Market,
    taker: &Order,
    result: &MatchResult,
) -> Result<(), EngineError> {
    let taker_remaining = result.taker_remaining();
    let taker_status = taker.settlement_status(taker_remaining);

    let mut tx = db.begin().await?;

    // Row locks are taken in ascending id order to stay deadlock-free against
    // concurrent reader transactions. The taker's id is part of the locked set
    // and must be covered before its upsert, which would otherwise grab the
    // taker's row lock out of sequence.
    let mut touched: Vec<Uuid> = result.trades.iter().map(|t| t.maker_order_id).collect();
    touched.push(taker.id);
    touched.sort();
    touched.dedup();
    let locked = lock_orders(&mut tx, &touched).await?;

    upsert_order(&mut tx, taker, taker_remaining, taker_status).await?;

    for trade in &result.trades {
        let maker = locked.get(&trade.maker_order_id).ok_or_else(|| {
            EngineError::Invariant(format!("maker order {} missing from storage", trade.maker_order_id))
        })?;
        if maker.side != taker.side.opposite() {
            return Err(EngineError::Invariant(format!(
                "maker order {} on {} side matched a {} taker",
                trade.maker_order_id,
                maker.side.as_str(),
                taker.side.as_str()
            )));
        }
        insert_trade(&mut tx, trade).await?;
        let posts = trade_ledger_posts(
            market,
            taker.side,
            taker.owner_id,
            maker.owner_id,
            trade.price,
            trade.quantity,
        )?;
        post_ledger(&mut tx, trade.id, &posts).await?;
    }

    let mut fills: BTreeMap<Uuid, i64> = BTreeMap::new();
    for t in &result.trades {
        *fills.entry(t.maker_order_id).or_insert(0) += t.quantity;
    }
    for (maker_id, filled) in &fills {
        let row = locked
            .get(maker_id)
            .ok_or_else(|| EngineError::Invariant(format!("maker order {maker_id} missing from storage")))?;
        let new_remaining = row.remaining - filled;
        if new_remaining < 0 {
            return Err(EngineError::Invariant(format!(
                "maker order {maker_id} remaining {} cannot absorb fill {filled}",
                row.remaining
            )));
        }
        let status = derive_status(row.quantity, new_remaining);
        write_order_state(&mut tx, *maker_id, new_remaining, status).await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Durably cancel an order that is still OPEN or PARTIAL. Returns whether the
/// order was live; cancelling a terminal or unknown order is a no-op.
pub(crate) async fn settle_cancel(db: &PgPool, order_id: Uuid) -> Result<bool, EngineError> {
    let mut tx = db.begin().await?;
    let res = sqlx::query("UPDATE orders SET status = 'CANCELLED' WHERE id = $1 AND status IN ('OPEN', 'PARTIAL')")
        .bind(order_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(res.rows_affected() > 0)
}

async fn upsert_order(
    tx: &mut Transaction<'_, Postgres>,
    order: &Order,
    remaining: i64,
    status: OrderStatus,
) -> Result<(), EngineError> {
    // Conflicts only ever update the mutable pair; the guard keeps a reused id
    // with different immutable fields from silently rewriting history.
    let res = sqlx::query(
        r#"
        INSERT INTO orders (id, owner_id, market, side, price, quantity, remaining, status, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (id) DO UPDATE SET remaining = EXCLUDED.remaining, status = EXCLUDED.status
        WHERE orders.owner_id = EXCLUDED.owner_id
          AND orders.market = EXCLUDED.market
          AND orders.side = EXCLUDED.side
          AND orders.price = EXCLUDED.price
          AND orders.quantity = EXCLUDED.quantity
        "#,
    )
    .bind(order.id)
    .bind(order.owner_id)
    .bind(&order.market)
    .bind(order.side.as_str())
    .bind(to_db_amount(order.price))
    .bind(to_db_amount(order.quantity))
    .bind(to_db_amount(remaining))
    .bind(status.as_str())
    .bind(order.created_at)
    .execute(&mut **tx)
    .await?;
    if res.rows_affected() == 0 {
        return Err(EngineError::Invariant(format!(
            "order {} conflicts with an existing row under different immutable fields",
            order.id
        )));
    }
    Ok(())
}

async fn write_order_state(
    tx: &mut Transaction<'_, Postgres>,
    order_id: Uuid,
    remaining: i64,
    status: OrderStatus,
) -> Result<(), EngineError> {
    sqlx::query("UPDATE orders SET remaining = $2, status = $3 WHERE id = $1")
        .bind(order_id)
        .bind(to_db_amount(remaining))
        .bind(status.as_str())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn lock_orders(
    tx: &mut Transaction<'_, Postgres>,
    ids: &[Uuid],
) -> Result<HashMap<Uuid, LockedOrder>, EngineError> {
    let rows = sqlx::query(
        "SELECT id, owner_id, side, quantity, remaining FROM orders WHERE id = ANY($1) ORDER BY id FOR UPDATE",
    )
    .bind(ids)
    .fetch_all(&mut **tx)
    .await?;

    let mut out = HashMap::with_capacity(rows.len());
    for r in rows {
        let id: Uuid = r.get("id");
        let side: String = r.get("side");
        out.insert(
            id,
            LockedOrder {
                owner_id: r.get("owner_id"),
                side: Side::parse(&side)?,
                quantity: from_db_amount(r.get("quantity"))?,
                remaining: from_db_amount(r.get("remaining"))?,
            },
        );
    }
    Ok(out)
}

async fn insert_trade(tx: &mut Transaction<'_, Postgres>, trade: &Trade) -> Result<(), EngineError> {
    sqlx::query(
        r#"
        INSERT INTO trades (id, taker_order_id, maker_order_id, price, quantity, traded_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(trade.id)
    .bind(trade.taker_order_id)
    .bind(trade.maker_order_id)
    .bind(to_db_amount(trade.price))
    .bind(to_db_amount(trade.quantity))
    .bind(trade.executed_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn post_ledger(
    tx: &mut Transaction<'_, Postgres>,
    trade_id: Uuid,
    posts: &[LedgerPost<'_>; 4],
) -> Result<(), EngineError> {
    let ledger_id = Uuid::new_v4();
    sqlx::query("INSERT INTO ledgers (id, ref_type, ref_id) VALUES ($1, 'trade', $2)")
        .bind(ledger_id)
        .bind(trade_id)
        .execute(&mut **tx)
        .await?;
    for post in posts {
        let account_id = ensure_account(tx, post.owner_id, post.asset).await?;
        sqlx::query("INSERT INTO ledger_entries (ledger_id, account_id, amount) VALUES ($1, $2, $3)")
            .bind(ledger_id)
            .bind(account_id)
            .bind(to_db_amount(post.amount))
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

/// Resolve the account for (owner, asset), creating it with a zero stored
/// balance on first reference. Authoritative balances are ledger sums.
async fn ensure_account(
    tx: &mut Transaction<'_, Postgres>,
    owner_id: Uuid,
    asset: &str,
) -> Result<i64, EngineError> {
    let row = sqlx::query(
        r#"
        INSERT INTO accounts (owner_id, asset, balance) VALUES ($1, $2, 0)
        ON CONFLICT (owner_id, asset) DO UPDATE SET owner_id = EXCLUDED.owner_id
        RETURNING id
        "#,
    )
    .bind(owner_id)
    .bind(asset)
    .fetch_one(&mut **tx)
    .await?;
    Ok(row.get("id"))
}
