//! Matching engine library.
//!
//! This crate implements price-time priority matching for limit orders over
//! the shared [`common_types::OrderBook`] structure. It is intentionally
//! minimal and free of networking, ledger and persistence concerns.
//!
//! Key properties
//! - Deterministic: given the same input sequence, produces the same trades
//! - Price-time priority: best price first; FIFO within each price level
//! - Trades execute at the maker's price; a taker crossing at a better price
//!   gets the difference of its reservation back via [`MatchOutcome::releases`]
//! - A user's own resting orders are never matched against
//!
use common_types::{Amount, Asset, Address, Order, OrderBook, OrderId, Side, Trade};
use thiserror::Error;

/// Internal miscounts surfaced by the walk. Every notional here was bounded
/// by a product already validated at reservation time, so any of these means
/// the book and the ledger have diverged and the executor must halt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MatchError {
    #[error("notional overflow while filling order {0}")]
    NotionalOverflow(OrderId),
    #[error("reservation underflow on order {0}")]
    ReservationUnderflow(OrderId),
}

/// Everything one incoming order produced: the trades in execution order and
/// the reservation amounts to hand back to the ledger (taker price
/// improvement and floor residue on fully filled buys).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MatchOutcome {
    pub trades: Vec<Trade>,
    pub releases: Vec<(Address, Asset, Amount)>,
}

/// Core trait for processing orders against an order book.
///
/// The taker is mutated in place to reflect fills; resting makers are updated
/// on the book and removed once fully filled. The caller decides whether a
/// residual taker rests.
pub trait MatchingEngine {
    fn match_order(&mut self, taker: &mut Order) -> Result<MatchOutcome, MatchError>;
}

impl MatchingEngine for OrderBook {
    fn match_order(&mut self, taker: &mut Order) -> Result<MatchOutcome, MatchError> {
        let mut outcome = MatchOutcome::default();

        for maker_id in self.matchable(taker.side.opposite(), taker.price) {
            if taker.remaining == 0 {
                break;
            }
            let Some((maker_user, maker_price, maker_remaining)) =
                self.get(maker_id).map(|m| (m.user, m.price, m.remaining))
            else {
                continue;
            };
            if maker_user == taker.user {
                continue;
            }

            let fill = taker.remaining.min(maker_remaining);
            let notional = maker_price
                .checked_notional(fill)
                .ok_or(MatchError::NotionalOverflow(maker_id))?;

            let (buyer, seller) = match taker.side {
                Side::Buy => (taker.user, maker_user),
                Side::Sell => (maker_user, taker.user),
            };
            outcome.trades.push(Trade {
                id: self.allocate_trade_id(),
                buyer,
                seller,
                price: maker_price,
                quantity: fill,
                taker_order_id: taker.id,
                maker_order_id: maker_id,
            });

            apply_fill(taker, fill, notional, &mut outcome.releases)?;
            let mut maker_done = false;
            if let Some(maker) = self.get_mut(maker_id) {
                apply_fill(maker, fill, notional, &mut outcome.releases)?;
                maker_done = maker.remaining == 0;
            }
            if maker_done {
                self.remove(maker_id);
            }
        }

        Ok(outcome)
    }
}

/// Update one side of a fill: quantities, reservation slice, and any amount
/// the ledger should release back.
///
/// A buy order's reservation slice for a fill is `floor(limit * fill)`; the
/// trade only consumes `floor(trade_price * fill)`, so the taker-side gap is
/// released immediately and whatever floor residue is left comes back when
/// the order fully fills. Sell reservations are in A and carry no residue.
fn apply_fill(
    order: &mut Order,
    fill: Amount,
    notional: Amount,
    releases: &mut Vec<(Address, Asset, Amount)>,
) -> Result<(), MatchError> {
    let slice = match order.side {
        Side::Buy => order
            .price
            .checked_notional(fill)
            .ok_or(MatchError::NotionalOverflow(order.id))?,
        Side::Sell => fill,
    };
    if order.side == Side::Buy && slice > notional {
        releases.push((order.user, Asset::B, slice - notional));
    }
    order.reserved_remaining = order
        .reserved_remaining
        .checked_sub(slice)
        .ok_or(MatchError::ReservationUnderflow(order.id))?;
    order.fill(fill);
    if order.remaining == 0 && order.reserved_remaining > 0 {
        let residue = std::mem::take(&mut order.reserved_remaining);
        releases.push((order.user, order.liability_asset(), residue));
    }
    Ok(())
}
