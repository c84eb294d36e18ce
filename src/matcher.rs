use chrono::Utc;
use uuid::Uuid;

use crate::book::OrderBook;
use crate::error::EngineError;
use crate::order::{Order, Side, Trade};

#[derive(Debug, Clone)]
pub(crate) struct MatchResult {
    pub(crate) trades: Vec<Trade>,
    pub(crate) order_filled: bool,
    /// Unfilled portion: rested on the book for limit orders, returned
    /// without resting for market orders (rejected-for-liquidity).
    pub(crate) remainder: Option<Order>,
}

impl MatchResult {
    pub(crate) fn taker_remaining(&self) -> i64 {
        self.remainder.as_ref().map(|o| o.remaining).unwrap_or(0)
    }
}

fn crosses(taker_side: Side, limit: i64, best_opposite: i64) -> bool {
    match taker_side {
        Side::Buy => best_opposite <= limit,
        Side::Sell => best_opposite >= limit,
    }
}

/// Match an incoming order against the opposite side under price-time
/// priority. Mutates the book: consumed makers are reduced or popped, and a
/// limit remainder is rested on its own side. Performs no I/O.
pub(crate) fn submit(book: &mut OrderBook, mut order: Order) -> Result<MatchResult, EngineError> {
    let against = order.side.opposite();
    let mut trades = Vec::new();

    while order.remaining > 0 {
        let Some(best) = book.best_price(against) else {
            break;
        };
        if !order.is_market && !crosses(order.side, order.price, best) {
            break;
        }
        let (maker_id, maker_remaining) = match book.front(against) {
            Some(maker) => (maker.id, maker.remaining),
            None => {
                return Err(EngineError::Invariant(format!(
                    "price {best} listed on {} side with no resting order",
                    against.as_str()
                )))
            }
        };

        // Execution is always at the maker's resting price.
        let qty = order.remaining.min(maker_remaining);
        trades.push(Trade {
            id: Uuid::new_v4(),
            taker_order_id: order.id,
            maker_order_id: maker_id,
            price: best,
            quantity: qty,
            executed_at: Utc::now(),
        });
        order.remaining -= qty;
        book.fill_front(against, qty)?;
    }

    if order.remaining == 0 {
        return Ok(MatchResult { trades, order_filled: true, remainder: None });
    }
    if !order.is_market {
        book.add(order.clone())?;
    }
    Ok(MatchResult { trades, order_filled: false, remainder: Some(order) })
}
