use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout_at, Instant};
use uuid::Uuid;

use crate::book::OrderBook;
use crate::error::EngineError;
use crate::matcher::{self, MatchResult};
use crate::order::{validate_order, Market, Order};
use crate::settle;

enum Command {
    Place {
        order: Order,
        reply: oneshot::Sender<Result<MatchResult, EngineError>>,
    },
    Cancel {
        order_id: Uuid,
        reply: oneshot::Sender<Result<bool, EngineError>>,
    },
}

/// Cloneable handle to the single-writer matching loop. Validation fails
/// fast here; everything that mutates the book happens on the loop task.
#[derive(Clone)]
pub(crate) struct Engine {
    cmd_tx: mpsc::Sender<Command>,
    market: Market,
}

impl Engine {
    /// Spawn the loop that owns `book` and return its handle. Without a pool
    /// the kernel runs match-only (settlement and durable cancel skipped),
    /// which is how the in-memory tests drive it.
    pub(crate) fn start(book: OrderBook, db: Option<PgPool>, market: Market, queue_capacity: usize) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(queue_capacity.max(1));
        let worker = EngineLoop {
            book,
            db,
            market: market.clone(),
            cmd_rx,
        };
        tokio::spawn(worker.run());
        Engine { cmd_tx, market }
    }

    /// Submit an order and wait for its match outcome. A deadline that fires
    /// before the command is enqueued aborts it; once enqueued the command
    /// runs to completion even if the caller stops waiting.
    pub(crate) async fn place(&self, order: Order, deadline: Duration) -> Result<MatchResult, EngineError> {
        validate_order(&order, &self.market)?;
        let deadline = Instant::now() + deadline;
        let (reply, rx) = oneshot::channel();
        match timeout_at(deadline, self.cmd_tx.send(Command::Place { order, reply })).await {
            Err(_) => return Err(EngineError::Deadline),
            Ok(Err(_)) => return Err(EngineError::Unavailable),
            Ok(Ok(())) => {}
        }
        match timeout_at(deadline, rx).await {
            Err(_) => Err(EngineError::Deadline),
            Ok(Err(_)) => Err(EngineError::Unavailable),
            Ok(Ok(res)) => res,
        }
    }

    /// Cancel a resting order. Returns false when the order was not live.
    pub(crate) async fn cancel(&self, order_id: Uuid, deadline: Duration) -> Result<bool, EngineError> {
        if order_id.is_nil() {
            return Err(EngineError::Validation("order id is required".to_string()));
        }
        let deadline = Instant::now() + deadline;
        let (reply, rx) = oneshot::channel();
        match timeout_at(deadline, self.cmd_tx.send(Command::Cancel { order_id, reply })).await {
            Err(_) => return Err(EngineError::Deadline),
            Ok(Err(_)) => return Err(EngineError::Unavailable),
            Ok(Ok(())) => {}
        }
        match timeout_at(deadline, rx).await {
            Err(_) => Err(EngineError::Deadline),
            Ok(Err(_)) => Err(EngineError::Unavailable),
            Ok(Ok(res)) => res,
        }
    }
}

/// Single consumer of the command queue; exclusively owns the order book.
/// Dequeue order is the canonical linearization of the engine: one command is
/// matched and settled before the next is observed.
struct EngineLoop {
    book: OrderBook,
    db: Option<PgPool>,
    market: Market,
    cmd_rx: mpsc::Receiver<Command>,
}

impl EngineLoop {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::Place { order, reply } => {
                    let res = self.handle_place(order).await;
                    if reply.send(res).is_err() {
                        tracing::debug!("place_reply_dropped caller_gone=true");
                    }
                }
                Command::Cancel { order_id, reply } => {
                    let res = self.handle_cancel(order_id).await;
                    if reply.send(res).is_err() {
                        tracing::debug!("cancel_reply_dropped caller_gone=true");
                    }
                }
            }
        }
        tracing::info!(market = %self.market.symbol, "engine_stopped");
    }

    async fn handle_place(&mut self, order: Order) -> Result<MatchResult, EngineError> {
        if self.book.contains(&order.id) {
            return Err(EngineError::Validation(format!("order {} already in book", order.id)));
        }
        let incoming = order.clone();
        let result = match matcher::submit(&mut self.book, order) {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(order_id = %incoming.id, market = %self.market.symbol, error = %e, "match_failed");
                return Err(e);
            }
        };
        if let Some(db) = &self.db {
            if let Err(e) = settle::settle_place(db, &self.market, &incoming, &result).await {
                // The match already mutated the book; a failed commit leaves
                // memory ahead of disk until the next restart rebuilds it.
                tracing::error!(
                    order_id = %incoming.id,
                    market = %self.market.symbol,
                    trades = result.trades.len(),
                    error = %e,
                    "settle_failed book_ahead_of_disk=true"
                );
                return Err(e);
            }
        }
        Ok(result)
    }

    async fn handle_cancel(&mut self, order_id: Uuid) -> Result<bool, EngineError> {
        let resting = self.book.order(&order_id).map(|o| o.remaining);
        let db_live = match &self.db {
            Some(db) => settle::settle_cancel(db, order_id).await?,
            None => false,
        };
        let removed = self.book.cancel(&order_id);
        if removed {
            tracing::debug!(order_id = %order_id, remaining = resting.unwrap_or(0), "order_cancelled");
        }
        Ok(db_live || removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::order::{Side, DEFAULT_MARKET};

    const WAIT: Duration = Duration::from_secs(5);

    fn market() -> Market {
        Market::parse(DEFAULT_MARKET).unwrap()
    }

    fn engine() -> Engine {
        Engine::start(OrderBook::new(), None, market(), 64)
    }

    fn limit(side: Side, price: i64, qty: i64) -> Order {
        Order {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            market: DEFAULT_MARKET.to_string(),
            side,
            price,
            quantity: qty,
            remaining: qty,
            is_market: false,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn place_round_trip_reports_full_fill() {
        let eng = engine();
        let sell = limit(Side::Sell, 100, 1);
        let sell_id = sell.id;
        let rested = eng.place(sell, WAIT).await.unwrap();
        assert!(!rested.order_filled);
        assert!(rested.trades.is_empty());

        let res = eng.place(limit(Side::Buy, 100, 1), WAIT).await.unwrap();
        assert!(res.order_filled);
        assert_eq!(res.trades.len(), 1);
        assert_eq!(res.trades[0].maker_order_id, sell_id);

        // Both sides are gone from the book.
        assert!(!eng.cancel(sell_id, WAIT).await.unwrap());
    }

    #[tokio::test]
    async fn cancel_is_live_once() {
        let eng = engine();
        let buy = limit(Side::Buy, 99, 5);
        let id = buy.id;
        eng.place(buy, WAIT).await.unwrap();

        assert!(eng.cancel(id, WAIT).await.unwrap());
        assert!(!eng.cancel(id, WAIT).await.unwrap());
    }

    #[tokio::test]
    async fn cancel_unknown_order_returns_false() {
        let eng = engine();
        assert!(!eng.cancel(Uuid::new_v4(), WAIT).await.unwrap());
        assert!(matches!(
            eng.cancel(Uuid::nil(), WAIT).await,
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn market_order_remainder_never_rests() {
        let eng = engine();
        let mut taker = limit(Side::Sell, 0, 4);
        taker.is_market = true;
        let id = taker.id;

        let res = eng.place(taker, WAIT).await.unwrap();
        assert!(!res.order_filled);
        assert_eq!(res.taker_remaining(), 4);
        assert!(!eng.cancel(id, WAIT).await.unwrap());
    }

    #[tokio::test]
    async fn validation_fails_before_enqueue() {
        let eng = engine();

        let mut zero_qty = limit(Side::Buy, 100, 1);
        zero_qty.quantity = 0;
        zero_qty.remaining = 0;
        assert!(matches!(eng.place(zero_qty, WAIT).await, Err(EngineError::Validation(_))));

        let mut wrong_market = limit(Side::Buy, 100, 1);
        wrong_market.market = "ETH-USD".to_string();
        assert!(matches!(eng.place(wrong_market, WAIT).await, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn duplicate_resting_id_is_rejected() {
        let eng = engine();
        let order = limit(Side::Buy, 95, 2);
        let dup = order.clone();
        eng.place(order, WAIT).await.unwrap();
        assert!(matches!(eng.place(dup, WAIT).await, Err(EngineError::Validation(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_fires_while_waiting_for_reply() {
        // Handle wired to a queue nobody consumes: the send succeeds but no
        // reply ever arrives.
        let (cmd_tx, _cmd_rx) = mpsc::channel(8);
        let eng = Engine { cmd_tx, market: market() };

        let res = eng.place(limit(Side::Buy, 100, 1), Duration::from_millis(50)).await;
        assert!(matches!(res, Err(EngineError::Deadline)));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_fires_while_queue_is_full() {
        let (cmd_tx, _cmd_rx) = mpsc::channel(1);
        let eng = Engine { cmd_tx, market: market() };

        // First command occupies the only slot; the second blocks on send.
        let first = eng.place(limit(Side::Buy, 100, 1), Duration::from_millis(50)).await;
        assert!(matches!(first, Err(EngineError::Deadline)));
        let second = eng.place(limit(Side::Buy, 101, 1), Duration::from_millis(50)).await;
        assert!(matches!(second, Err(EngineError::Deadline)));
    }

    #[tokio::test]
    async fn closed_engine_is_unavailable() {
        let (cmd_tx, cmd_rx) = mpsc::channel(1);
        drop(cmd_rx);
        let eng = Engine { cmd_tx, market: market() };
        assert!(matches!(
            eng.place(limit(Side::Buy, 100, 1), WAIT).await,
            Err(EngineError::Unavailable)
        ));
    }
}

// DB-backed end-to-end coverage. Run against a provisioned Postgres:
//   DATABASE_URL=postgres://... cargo test -- --ignored
#[cfg(test)]
mod db_tests {
    use super::*;
    use chrono::Utc;
    use sqlx::postgres::PgPoolOptions;
    use sqlx::Row;

    use crate::order::Side;
    use crate::store;

    const WAIT: Duration = Duration::from_secs(10);

    async fn test_pool() -> PgPool {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must point at a test database");
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(&url)
            .await
            .expect("connect test postgres");
        store::init_schema(&pool).await.expect("init schema");
        pool
    }

    fn unique_market() -> Market {
        let tag = Uuid::new_v4().simple().to_string()[..8].to_uppercase();
        Market::parse(&format!("T{tag}-USD")).unwrap()
    }

    fn limit_for(market: &Market, side: Side, price: i64, qty: i64) -> Order {
        Order {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            market: market.symbol.clone(),
            side,
            price,
            quantity: qty,
            remaining: qty,
            is_market: false,
            created_at: Utc::now(),
        }
    }

    async fn order_state(db: &PgPool, id: Uuid) -> (String, i64) {
        let row = sqlx::query("SELECT status, remaining FROM orders WHERE id = $1")
            .bind(id)
            .fetch_one(db)
            .await
            .unwrap();
        let status: String = row.get("status");
        let remaining = store::from_db_amount(row.get("remaining")).unwrap();
        (status, remaining)
    }

    #[tokio::test]
    #[ignore]
    async fn full_fill_persists_orders_trade_and_balanced_ledger() {
        let db = test_pool().await;
        let market = unique_market();
        let eng = Engine::start(OrderBook::new(), Some(db.clone()), market.clone(), 64);

        let sell = limit_for(&market, Side::Sell, 100, 1);
        let buy = limit_for(&market, Side::Buy, 100, 1);
        let (sell_id, buy_id) = (sell.id, buy.id);
        let (seller, buyer) = (sell.owner_id, buy.owner_id);

        eng.place(sell, WAIT).await.unwrap();
        let res = eng.place(buy, WAIT).await.unwrap();
        assert!(res.order_filled);
        let trade_id = res.trades[0].id;

        assert_eq!(order_state(&db, sell_id).await, ("FILLED".to_string(), 0));
        assert_eq!(order_state(&db, buy_id).await, ("FILLED".to_string(), 0));

        // One ledger header for the trade, four entries, zero-sum per asset.
        let entries = sqlx::query(
            r#"
            SELECT a.owner_id, a.asset, e.amount
            FROM ledgers l
            JOIN ledger_entries e ON e.ledger_id = l.id
            JOIN accounts a ON a.id = e.account_id
            WHERE l.ref_type = 'trade' AND l.ref_id = $1
            "#,
        )
        .bind(trade_id)
        .fetch_all(&db)
        .await
        .unwrap();
        assert_eq!(entries.len(), 4);

        let mut by_owner_asset = std::collections::HashMap::new();
        let mut sums = std::collections::HashMap::new();
        for r in &entries {
            let owner: Uuid = r.get("owner_id");
            let asset: String = r.get("asset");
            let amount = store::from_db_amount(r.get("amount")).unwrap();
            by_owner_asset.insert((owner, asset.clone()), amount);
            *sums.entry(asset).or_insert(0i64) += amount;
        }
        assert!(sums.values().all(|s| *s == 0));
        assert_eq!(by_owner_asset[&(buyer, market.quote.clone())], -100);
        assert_eq!(by_owner_asset[&(buyer, market.base.clone())], 1);
        assert_eq!(by_owner_asset[&(seller, market.base.clone())], -1);
        assert_eq!(by_owner_asset[&(seller, market.quote.clone())], 100);
    }

    #[tokio::test]
    #[ignore]
    async fn partial_fill_updates_maker_remaining() {
        let db = test_pool().await;
        let market = unique_market();
        let eng = Engine::start(OrderBook::new(), Some(db.clone()), market.clone(), 64);

        let maker = limit_for(&market, Side::Buy, 105, 2);
        let maker_id = maker.id;
        eng.place(maker, WAIT).await.unwrap();

        let res = eng.place(limit_for(&market, Side::Sell, 104, 1), WAIT).await.unwrap();
        assert!(res.order_filled);
        assert_eq!(res.trades[0].price, 105);

        assert_eq!(order_state(&db, maker_id).await, ("PARTIAL".to_string(), 1));
    }

    #[tokio::test]
    #[ignore]
    async fn cancel_is_durable_and_not_repeatable() {
        let db = test_pool().await;
        let market = unique_market();
        let eng = Engine::start(OrderBook::new(), Some(db.clone()), market.clone(), 64);

        let order = limit_for(&market, Side::Buy, 99, 5);
        let id = order.id;
        eng.place(order, WAIT).await.unwrap();

        assert!(eng.cancel(id, WAIT).await.unwrap());
        assert_eq!(order_state(&db, id).await.0, "CANCELLED");
        assert!(!eng.cancel(id, WAIT).await.unwrap());
    }

    #[tokio::test]
    #[ignore]
    async fn recovery_rebuilds_identical_book() {
        let db = test_pool().await;
        let market = unique_market();
        let eng = Engine::start(OrderBook::new(), Some(db.clone()), market.clone(), 64);

        // Two bids at one level (FIFO order matters), one deeper bid, two asks.
        // Explicitly staggered timestamps: time priority across restart rides
        // on created_at, and consecutive wall-clock reads can collide.
        let base = Utc::now();
        let mut b1 = limit_for(&market, Side::Buy, 100, 1);
        let mut b2 = limit_for(&market, Side::Buy, 100, 2);
        let mut b3 = limit_for(&market, Side::Buy, 98, 3);
        let mut a1 = limit_for(&market, Side::Sell, 110, 1);
        let mut a2 = limit_for(&market, Side::Sell, 112, 2);
        for (i, o) in [&mut b1, &mut b2, &mut b3, &mut a1, &mut a2].into_iter().enumerate() {
            o.created_at = base + chrono::Duration::milliseconds(i as i64);
        }
        let bid_level = vec![b1.id, b2.id];
        let (deep_bid, ask_ids) = (b3.id, vec![a1.id, a2.id]);
        for o in [b1, b2, b3, a1, a2] {
            eng.place(o, WAIT).await.unwrap();
        }

        let recovered = store::bootstrap_book(&db, &market).await.unwrap();
        assert_eq!(recovered.best_bid(), Some(100));
        assert_eq!(recovered.best_ask(), Some(110));
        assert_eq!(
            recovered.levels(Side::Buy),
            vec![(100, bid_level), (98, vec![deep_bid])]
        );
        assert_eq!(
            recovered.levels(Side::Sell),
            vec![(110, vec![ask_ids[0]]), (112, vec![ask_ids[1]])]
        );
    }
}
