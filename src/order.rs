use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

/// Implied fractional digits for every price, quantity and ledger amount.
/// In-memory values are scaled i64 (ticks / base smallest units); the
/// NUMERIC(20,8) columns carry the same values divided by 10^8.
pub(crate) const FIXED_SCALE: u32 = 8;

pub(crate) const DEFAULT_MARKET: &str = "BTC-USD";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub(crate) enum Side {
    Buy,
    Sell,
}

impl Side {
    pub(crate) fn parse(s: &str) -> Result<Self, EngineError> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            other => Err(EngineError::Validation(format!("invalid side: {other:?}"))),
        }
    }

    pub(crate) fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub(crate) enum OrderStatus {
    Open,
    Partial,
    Filled,
    Cancelled,
}

impl OrderStatus {
    pub(crate) fn parse(s: &str) -> Result<Self, EngineError> {
        match s {
            "OPEN" => Ok(OrderStatus::Open),
            "PARTIAL" => Ok(OrderStatus::Partial),
            "FILLED" => Ok(OrderStatus::Filled),
            "CANCELLED" => Ok(OrderStatus::Cancelled),
            other => Err(EngineError::Invariant(format!("unknown order status in storage: {other:?}"))),
        }
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Open => "OPEN",
            OrderStatus::Partial => "PARTIAL",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }
}

/// Status of a live (non-cancelled) order from its fill progress.
pub(crate) fn derive_status(quantity: i64, remaining: i64) -> OrderStatus {
    if remaining == 0 {
        OrderStatus::Filled
    } else if remaining == quantity {
        OrderStatus::Open
    } else {
        OrderStatus::Partial
    }
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct Order {
    pub(crate) id: Uuid,
    pub(crate) owner_id: Uuid,
    pub(crate) market: String,
    pub(crate) side: Side,
    /// Integer price in ticks. Meaningful only when `is_market` is false.
    pub(crate) price: i64,
    pub(crate) quantity: i64,
    pub(crate) remaining: i64,
    pub(crate) is_market: bool,
    pub(crate) created_at: DateTime<Utc>,
}

impl Order {
    /// Durable status for this order after matching left `remaining` unfilled.
    ///
    /// Market orders never rest; the schema has no is_market column, so an
    /// unfilled market remainder is stored terminal (CANCELLED) to keep
    /// recovery from resurrecting it.
    pub(crate) fn settlement_status(&self, remaining: i64) -> OrderStatus {
        if remaining == 0 {
            OrderStatus::Filled
        } else if self.is_market {
            OrderStatus::Cancelled
        } else {
            derive_status(self.quantity, remaining)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct Trade {
    pub(crate) id: Uuid,
    pub(crate) taker_order_id: Uuid,
    pub(crate) maker_order_id: Uuid,
    /// Execution price, always the maker's resting price.
    pub(crate) price: i64,
    pub(crate) quantity: i64,
    pub(crate) executed_at: DateTime<Utc>,
}

/// Trading pair resolved into its base and quote assets, e.g. "BTC-USD".
#[derive(Debug, Clone)]
pub(crate) struct Market {
    pub(crate) symbol: String,
    pub(crate) base: String,
    pub(crate) quote: String,
}

impl Market {
    pub(crate) fn parse(symbol: &str) -> Result<Self, EngineError> {
        let symbol = symbol.trim();
        let (base, quote) = symbol
            .split_once('-')
            .ok_or_else(|| EngineError::Validation(format!("invalid market symbol: {symbol:?}")))?;
        if base.is_empty() || quote.is_empty() || base == quote {
            return Err(EngineError::Validation(format!("invalid market symbol: {symbol:?}")));
        }
        Ok(Market {
            symbol: symbol.to_string(),
            base: base.to_string(),
            quote: quote.to_string(),
        })
    }
}

/// Notional in quote smallest units. None when price * quantity overflows i64,
/// which the persistence boundary could not round-trip.
pub(crate) fn checked_notional(price: i64, quantity: i64) -> Option<i64> {
    price.checked_mul(quantity)
}

pub(crate) fn validate_order(order: &Order, market: &Market) -> Result<(), EngineError> {
    if order.id.is_nil() {
        return Err(EngineError::Validation("order id is required".to_string()));
    }
    if order.owner_id.is_nil() {
        return Err(EngineError::Validation("owner id is required".to_string()));
    }
    if order.market != market.symbol {
        return Err(EngineError::Validation(format!(
            "unknown market {:?}, engine serves {:?}",
            order.market, market.symbol
        )));
    }
    if order.quantity <= 0 {
        return Err(EngineError::Validation("quantity must be positive".to_string()));
    }
    if order.remaining != order.quantity {
        return Err(EngineError::Validation("remaining must equal quantity on submission".to_string()));
    }
    if !order.is_market && order.price <= 0 {
        return Err(EngineError::Validation("limit orders require a positive price".to_string()));
    }
    if !order.is_market && checked_notional(order.price, order.quantity).is_none() {
        return Err(EngineError::Validation("price * quantity overflows notional range".to_string()));
    }
    Ok(())
}
