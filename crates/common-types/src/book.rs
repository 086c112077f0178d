//! Price-time priority order book.
//!
//! Orders live in an arena keyed by [`OrderId`]; the per-side price maps hold
//! id queues in FIFO arrival order, and a user index supports ownership
//! queries. Bids iterate highest price first, asks lowest first; within one
//! price level the earliest `created_seq` is always at the front.

use crate::{Address, Order, OrderId, Price, Side, TradeId};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

pub type PriceLevel = VecDeque<OrderId>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBook {
    orders: HashMap<OrderId, Order>,
    bids: BTreeMap<Reverse<Price>, PriceLevel>,
    asks: BTreeMap<Price, PriceLevel>,
    user_orders: HashMap<Address, BTreeSet<OrderId>>,
    next_trade_id: u64,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a resting order on its side's queue. The order must carry
    /// remaining quantity; filled or cancelled orders never rest.
    pub fn insert(&mut self, order: Order) {
        debug_assert!(order.remaining > 0);
        let id = order.id;
        match order.side {
            Side::Buy => self.bids.entry(Reverse(order.price)).or_default().push_back(id),
            Side::Sell => self.asks.entry(order.price).or_default().push_back(id),
        }
        self.user_orders.entry(order.user).or_default().insert(id);
        self.orders.insert(id, order);
    }

    /// Take an order off the book, dropping its price level and user index
    /// entries when they empty out.
    pub fn remove(&mut self, id: OrderId) -> Option<Order> {
        let order = self.orders.remove(&id)?;
        match order.side {
            Side::Buy => {
                if let Some(level) = self.bids.get_mut(&Reverse(order.price)) {
                    level.retain(|queued| *queued != id);
                    if level.is_empty() {
                        self.bids.remove(&Reverse(order.price));
                    }
                }
            }
            Side::Sell => {
                if let Some(level) = self.asks.get_mut(&order.price) {
                    level.retain(|queued| *queued != id);
                    if level.is_empty() {
                        self.asks.remove(&order.price);
                    }
                }
            }
        }
        if let Some(owned) = self.user_orders.get_mut(&order.user) {
            owned.remove(&id);
            if owned.is_empty() {
                self.user_orders.remove(&order.user);
            }
        }
        Some(order)
    }

    pub fn get(&self, id: OrderId) -> Option<&Order> {
        self.orders.get(&id)
    }

    pub fn get_mut(&mut self, id: OrderId) -> Option<&mut Order> {
        self.orders.get_mut(&id)
    }

    pub fn best_bid(&self) -> Option<&Order> {
        self.bids
            .values()
            .next()
            .and_then(|level| level.front())
            .and_then(|id| self.orders.get(id))
    }

    pub fn best_ask(&self) -> Option<&Order> {
        self.asks
            .values()
            .next()
            .and_then(|level| level.front())
            .and_then(|id| self.orders.get(id))
    }

    /// Resting orders on `side` that cross `limit`, in (best price, earliest
    /// seq) order: asks priced at or under the limit, bids at or over it.
    pub fn matchable(&self, side: Side, limit: Price) -> Vec<OrderId> {
        let mut crossing = Vec::new();
        match side {
            Side::Sell => {
                for (price, level) in &self.asks {
                    if *price > limit {
                        break;
                    }
                    crossing.extend(level.iter().copied());
                }
            }
            Side::Buy => {
                for (price, level) in &self.bids {
                    if price.0 < limit {
                        break;
                    }
                    crossing.extend(level.iter().copied());
                }
            }
        }
        crossing
    }

    pub fn user_orders(&self, user: &Address) -> Vec<OrderId> {
        self.user_orders
            .get(user)
            .map(|owned| owned.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn allocate_trade_id(&mut self) -> TradeId {
        let id = TradeId(self.next_trade_id);
        self.next_trade_id += 1;
        id
    }

    pub fn bid_count(&self) -> usize {
        self.bids.values().map(VecDeque::len).sum()
    }

    pub fn ask_count(&self) -> usize {
        self.asks.values().map(VecDeque::len).sum()
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}
