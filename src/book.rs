use std::collections::{BTreeMap, HashMap};

use slab::Slab;
use uuid::Uuid;

use crate::error::EngineError;
use crate::order::{Order, Side};

struct Node {
    order: Order,
    prev: Option<usize>,
    next: Option<usize>,
}

/// FIFO queue of resting orders at one price, as head/tail indices into the
/// book's node arena. Exists only while non-empty.
#[derive(Default)]
struct Level {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

/// Per-market limit order book.
///
/// Two price-keyed ladders (bids best = highest key, asks best = lowest key)
/// over intrusive doubly-linked queues in a slab arena. The id index resolves
/// straight to the queue node, so cancellation unlinks in O(1) without
/// scanning the level.
pub(crate) struct OrderBook {
    bids: BTreeMap<i64, Level>,
    asks: BTreeMap<i64, Level>,
    nodes: Slab<Node>,
    by_id: HashMap<Uuid, usize>,
}

impl OrderBook {
    pub(crate) fn new() -> Self {
        Self {
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            nodes: Slab::new(),
            by_id: HashMap::new(),
        }
    }

    fn ladder(&self, side: Side) -> &BTreeMap<i64, Level> {
        match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        }
    }

    fn ladder_mut(&mut self, side: Side) -> &mut BTreeMap<i64, Level> {
        match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.by_id.len()
    }

    pub(crate) fn contains(&self, id: &Uuid) -> bool {
        self.by_id.contains_key(id)
    }

    pub(crate) fn order(&self, id: &Uuid) -> Option<&Order> {
        self.by_id.get(id).map(|idx| &self.nodes[*idx].order)
    }

    pub(crate) fn best_bid(&self) -> Option<i64> {
        self.bids.keys().next_back().copied()
    }

    pub(crate) fn best_ask(&self) -> Option<i64> {
        self.asks.keys().next().copied()
    }

    pub(crate) fn best_price(&self, side: Side) -> Option<i64> {
        match side {
            Side::Buy => self.best_bid(),
            Side::Sell => self.best_ask(),
        }
    }

    /// Oldest order at the best price on `side`.
    pub(crate) fn front(&self, side: Side) -> Option<&Order> {
        let price = self.best_price(side)?;
        let head = self.ladder(side).get(&price)?.head?;
        Some(&self.nodes[head].order)
    }

    /// Rest a live order at the tail of its (side, price) level, creating the
    /// level if absent.
    pub(crate) fn add(&mut self, order: Order) -> Result<(), EngineError> {
        if self.by_id.contains_key(&order.id) {
            return Err(EngineError::Validation(format!("order {} already in book", order.id)));
        }
        if order.remaining <= 0 || order.remaining > order.quantity {
            return Err(EngineError::Invariant(format!(
                "order {} rested with remaining={} quantity={}",
                order.id, order.remaining, order.quantity
            )));
        }
        let id = order.id;
        let side = order.side;
        let price = order.price;

        let idx = self.nodes.insert(Node { order, prev: None, next: None });
        let level = self.ladder_mut(side).entry(price).or_default();
        let prev_tail = level.tail;
        if level.head.is_none() {
            level.head = Some(idx);
        }
        level.tail = Some(idx);
        level.len += 1;
        if let Some(tail) = prev_tail {
            self.nodes[tail].next = Some(idx);
            self.nodes[idx].prev = Some(tail);
        }
        self.by_id.insert(id, idx);
        Ok(())
    }

    /// Remove a resting order. Unknown ids are a no-op returning false.
    pub(crate) fn cancel(&mut self, id: &Uuid) -> bool {
        let Some(idx) = self.by_id.remove(id) else {
            return false;
        };
        self.unlink(idx);
        self.nodes.remove(idx);
        true
    }

    /// Consume `qty` from the head of the best level on `side`. Pops the head
    /// when it reaches zero and drops the level with its last order.
    pub(crate) fn fill_front(&mut self, side: Side, qty: i64) -> Result<(), EngineError> {
        let head = self
            .best_price(side)
            .and_then(|price| self.ladder(side).get(&price))
            .and_then(|level| level.head)
            .ok_or_else(|| EngineError::Invariant(format!("fill on empty {} side", side.as_str())))?;

        let node = &mut self.nodes[head];
        if qty <= 0 || qty > node.order.remaining {
            return Err(EngineError::Invariant(format!(
                "fill of {} against order {} with remaining {}",
                qty, node.order.id, node.order.remaining
            )));
        }
        node.order.remaining -= qty;
        if node.order.remaining == 0 {
            let id = node.order.id;
            self.by_id.remove(&id);
            self.unlink(head);
            self.nodes.remove(head);
        }
        Ok(())
    }

    fn unlink(&mut self, idx: usize) {
        let (side, price, prev, next) = {
            let n = &self.nodes[idx];
            (n.order.side, n.order.price, n.prev, n.next)
        };
        if let Some(p) = prev {
            self.nodes[p].next = next;
        }
        if let Some(n) = next {
            self.nodes[n].prev = prev;
        }
        let ladder = self.ladder_mut(side);
        let mut now_empty = false;
        if let Some(level) = ladder.get_mut(&price) {
            if level.head == Some(idx) {
                level.head = next;
            }
            if level.tail == Some(idx) {
                level.tail = prev;
            }
            level.len -= 1;
            now_empty = level.len == 0;
        }
        // Levels never exist empty.
        if now_empty {
            ladder.remove(&price);
        }
    }

    /// Price levels on `side`, best first, each with its queue in FIFO order.
    #[cfg(test)]
    pub(crate) fn levels(&self, side: Side) -> Vec<(i64, Vec<Uuid>)> {
        let mut out = Vec::new();
        let prices: Vec<i64> = match side {
            Side::Buy => self.bids.keys().rev().copied().collect(),
            Side::Sell => self.asks.keys().copied().collect(),
        };
        for price in prices {
            let level = &self.ladder(side)[&price];
            let mut ids = Vec::with_capacity(level.len);
            let mut cur = level.head;
            while let Some(idx) = cur {
                ids.push(self.nodes[idx].order.id);
                cur = self.nodes[idx].next;
            }
            out.push((price, ids));
        }
        out
    }
}
