//! Execution plane: the serialized request executor and its HTTP surface.
//!
//! The [`Executor`] is the sole mutator of the ledger, the order book and the
//! pre-settlement part of the message store. It drains the incoming queue in
//! strict FIFO order, runs every handler to completion before the next
//! message, and never suspends on I/O - its only awaits are channel sends.
//! Settlement work is emitted to the outgoing queue; the compensation channel
//! feeds failed-withdrawal credits back in.

use std::collections::HashSet;
use std::sync::Arc;

use common_types::health::{Agent, Heartbeats};
use common_types::{
    Asset, CancelRequest, Compensation, DepositEvent, IncomingItem, MessageId, MessageStatus,
    MessageStore, Order, OrderBook, OrderId, OrderRequest, OrderStatus, OutgoingIntent,
    SettleIntent, StateSnapshot, Side, Trade, TradeId, WithdrawIntent, WithdrawRequest, Request,
    Amount,
};
use matching_engine::{MatchError, MatchingEngine};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub mod api;
pub mod auth;
pub mod ledger;

use ledger::{Ledger, LedgerError};

/// Conditions that stop the executor. Everything here means the in-memory
/// state can no longer be trusted (or nobody is left to hand work to), so the
/// process must exit rather than keep trading.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("ledger invariant violated: {0}")]
    Ledger(#[from] LedgerError),
    #[error("matching invariant violated: {0}")]
    Match(#[from] MatchError),
    #[error("outgoing queue closed")]
    OutgoingClosed,
}

pub struct Executor {
    incoming: mpsc::Receiver<IncomingItem>,
    compensation: mpsc::Receiver<Compensation>,
    outgoing: mpsc::Sender<OutgoingIntent>,
    store: Arc<MessageStore>,
    heartbeats: Arc<Heartbeats>,
    ledger: Ledger,
    book: OrderBook,
    trades: Vec<Trade>,
    seen_deposits: HashSet<(String, u32)>,
    next_order_id: u64,
    next_seq: u64,
}

impl Executor {
    pub fn new(
        incoming: mpsc::Receiver<IncomingItem>,
        compensation: mpsc::Receiver<Compensation>,
        outgoing: mpsc::Sender<OutgoingIntent>,
        store: Arc<MessageStore>,
        heartbeats: Arc<Heartbeats>,
    ) -> Self {
        Self {
            incoming,
            compensation,
            outgoing,
            store,
            heartbeats,
            ledger: Ledger::new(),
            book: OrderBook::new(),
            trades: Vec::new(),
            seen_deposits: HashSet::new(),
            next_order_id: 1,
            next_seq: 1,
        }
    }

    /// Drive the executor until the incoming queue closes or an invariant
    /// breaks. Compensations are drained ahead of requests so a failed
    /// withdrawal is restored before any later message spends against it.
    pub async fn run(mut self) -> Result<(), ExecutorError> {
        info!("executor started");
        let mut compensation_open = true;
        loop {
            tokio::select! {
                biased;
                compensation = self.compensation.recv(), if compensation_open => {
                    match compensation {
                        Some(credit) => self.handle_compensation(credit),
                        None => compensation_open = false,
                    }
                }
                item = self.incoming.recv() => {
                    match item {
                        Some((message_id, request)) => self.handle(message_id, request).await?,
                        None => break,
                    }
                }
            }
            self.heartbeats.beat(Agent::Executor);
        }
        info!("executor stopped");
        Ok(())
    }

    /// Apply one message end to end. Recoverable conditions land on the
    /// message as `Rejected`; only internal miscounts propagate.
    pub async fn handle(&mut self, id: MessageId, request: Request) -> Result<(), ExecutorError> {
        match request {
            Request::Deposit(event) => self.handle_deposit(id, event),
            Request::Order(order) => self.handle_order(id, order).await?,
            Request::Cancel(cancel) => self.handle_cancel(id, cancel)?,
            Request::Withdraw(withdraw) => self.handle_withdraw(id, withdraw).await?,
        }
        Ok(())
    }

    fn handle_deposit(&mut self, id: MessageId, event: DepositEvent) {
        if event.amount == 0 {
            self.reject(id, "amount must be positive");
            return;
        }
        let key = (event.tx_hash.clone(), event.event_index);
        if !self.seen_deposits.insert(key) {
            debug!(
                tx_hash = %event.tx_hash,
                event_index = event.event_index,
                "duplicate deposit event ignored"
            );
            self.store.advance(id, MessageStatus::SettlementConfirmed);
            return;
        }
        self.ledger.credit(event.user, event.asset, event.amount);
        self.store.record_tx_hash(id, &event.tx_hash);
        self.store.advance(id, MessageStatus::SettlementConfirmed);
        info!(
            user = %event.user,
            asset = ?event.asset,
            amount = %event.amount,
            ledger_seq = event.ledger_seq,
            "deposit credited"
        );
    }

    async fn handle_order(&mut self, id: MessageId, request: OrderRequest) -> Result<(), ExecutorError> {
        if request.price.0 == 0 || request.quantity == 0 {
            self.reject(id, "price and quantity must be positive");
            return Ok(());
        }
        let (reserve_asset, reserve_amount) = match request.side {
            Side::Buy => match request.price.checked_notional(request.quantity) {
                Some(notional) if notional > 0 => (Asset::B, notional),
                Some(_) => {
                    self.reject(id, "order notional rounds to zero");
                    return Ok(());
                }
                None => {
                    self.reject(id, "order notional out of range");
                    return Ok(());
                }
            },
            Side::Sell => (Asset::A, request.quantity),
        };
        match self.ledger.reserve(request.user, reserve_asset, reserve_amount) {
            Ok(()) => {}
            Err(error @ LedgerError::InsufficientAvailable { .. }) => {
                self.reject(id, &error.to_string());
                return Ok(());
            }
            Err(error) => return Err(error.into()),
        }

        let order_id = OrderId(self.next_order_id);
        self.next_order_id += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        let mut order = Order::new(
            order_id,
            request.user,
            request.side,
            request.price,
            request.quantity,
            reserve_amount,
            seq,
        );
        self.store.record_order(id, order_id);
        self.store.advance(id, MessageStatus::Accepted);

        let outcome = self.book.match_order(&mut order)?;
        let mut settles = Vec::with_capacity(outcome.trades.len());
        for trade in &outcome.trades {
            let notional = self.apply_trade(trade)?;
            settles.push(SettleIntent {
                buyer: trade.buyer,
                seller: trade.seller,
                asset_sold: Asset::A,
                amount_sold: trade.quantity,
                asset_bought: Asset::B,
                amount_bought: notional,
                trade_id: trade.id,
                message_id: id,
            });
        }
        for (user, asset, amount) in &outcome.releases {
            self.ledger.release(*user, *asset, *amount)?;
        }
        if !outcome.trades.is_empty() {
            let trade_ids: Vec<TradeId> = outcome.trades.iter().map(|t| t.id).collect();
            self.store.record_trades(id, &trade_ids);
        }
        for settle in settles {
            self.outgoing
                .send(OutgoingIntent::Settle(settle))
                .await
                .map_err(|_| ExecutorError::OutgoingClosed)?;
        }

        let trades = outcome.trades.len();
        let remaining = order.remaining;
        if order.remaining > 0 {
            self.book.insert(order);
        }
        info!(
            order_id = order_id.0,
            user = %request.user,
            side = ?request.side,
            trades,
            remaining = %remaining,
            "order processed"
        );
        Ok(())
    }

    /// Both ledger legs of one trade. Returns the B notional so the settle
    /// intent carries exactly what the ledger moved.
    fn apply_trade(&mut self, trade: &Trade) -> Result<Amount, ExecutorError> {
        let notional = trade
            .price
            .checked_notional(trade.quantity)
            .ok_or(MatchError::NotionalOverflow(trade.maker_order_id))?;
        self.ledger.consume(trade.seller, Asset::A, trade.quantity)?;
        self.ledger.credit(trade.seller, Asset::B, notional);
        self.ledger.consume(trade.buyer, Asset::B, notional)?;
        self.ledger.credit(trade.buyer, Asset::A, trade.quantity);
        self.trades.push(*trade);
        debug!(
            trade_id = trade.id.0,
            buyer = %trade.buyer,
            seller = %trade.seller,
            price = %trade.price,
            quantity = %trade.quantity,
            "trade executed"
        );
        Ok(notional)
    }

    fn handle_cancel(&mut self, id: MessageId, request: CancelRequest) -> Result<(), ExecutorError> {
        match self.book.get(request.order_id).map(|order| order.user) {
            None => {
                self.reject(id, &format!("order not found: {}", request.order_id.0));
                return Ok(());
            }
            Some(owner) if owner != request.user => {
                self.reject(id, "order does not belong to requester");
                return Ok(());
            }
            Some(_) => {}
        }
        if let Some(mut order) = self.book.remove(request.order_id) {
            let released = std::mem::take(&mut order.reserved_remaining);
            self.ledger.release(order.user, order.liability_asset(), released)?;
            order.status = OrderStatus::Cancelled;
            self.store.record_order(id, order.id);
            self.store.advance(id, MessageStatus::SettlementConfirmed);
            info!(order_id = order.id.0, user = %order.user, "order cancelled");
        }
        Ok(())
    }

    async fn handle_withdraw(&mut self, id: MessageId, request: WithdrawRequest) -> Result<(), ExecutorError> {
        if request.amount == 0 {
            self.reject(id, "amount must be positive");
            return Ok(());
        }
        match self.ledger.debit(request.user, request.asset, request.amount) {
            Ok(()) => {}
            Err(error @ LedgerError::InsufficientAvailable { .. }) => {
                self.reject(id, &error.to_string());
                return Ok(());
            }
            Err(error) => return Err(error.into()),
        }
        self.outgoing
            .send(OutgoingIntent::Withdraw(WithdrawIntent {
                user: request.user,
                asset: request.asset,
                amount: request.amount,
                message_id: id,
            }))
            .await
            .map_err(|_| ExecutorError::OutgoingClosed)?;
        self.store.advance(id, MessageStatus::SettlementPending);
        info!(
            user = %request.user,
            asset = ?request.asset,
            amount = %request.amount,
            "withdrawal queued"
        );
        Ok(())
    }

    pub fn handle_compensation(&mut self, credit: Compensation) {
        self.ledger.credit(credit.user, credit.asset, credit.amount);
        warn!(
            message_id = %credit.message_id,
            user = %credit.user,
            asset = ?credit.asset,
            amount = %credit.amount,
            "balance restored after failed withdrawal"
        );
    }

    fn reject(&self, id: MessageId, reason: &str) {
        self.store.advance(id, MessageStatus::Rejected(reason.to_string()));
        debug!(message_id = %id, reason, "message rejected");
    }

    /// Pluggable snapshot hook: the executor's full state in one serializable
    /// value.
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            accounts: self.ledger.snapshot_accounts(),
            book: self.book.clone(),
            trades: self.trades.clone(),
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn book(&self) -> &OrderBook {
        &self.book
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }
}
