//! Message lifecycle records and the shared message store.
//!
//! Every externally originated request (order, cancel, withdrawal, deposit)
//! gets a [`Message`] keyed by [`MessageId`]. API handlers read the store;
//! the executor writes the pre-settlement transitions and the outgoing
//! processor writes the post-accept ones, so the writers never contend on a
//! field. Status moves are forward-only.

use crate::{unix_now, Address, MessageId, OrderId, TradeId};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Order,
    Cancel,
    Withdrawal,
    Deposit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    Received,
    Accepted,
    Rejected(String),
    SettlementPending,
    SettlementConfirmed,
    SettlementFailed(String),
}

impl MessageStatus {
    /// Position in the status DAG; transitions only ever increase it.
    pub fn rank(&self) -> u8 {
        match self {
            MessageStatus::Received => 0,
            MessageStatus::Accepted | MessageStatus::Rejected(_) => 1,
            MessageStatus::SettlementPending => 2,
            MessageStatus::SettlementConfirmed | MessageStatus::SettlementFailed(_) => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessageStatus::Rejected(_)
                | MessageStatus::SettlementConfirmed
                | MessageStatus::SettlementFailed(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub kind: MessageKind,
    pub user: Address,
    pub status: MessageStatus,
    pub created_at: u64,
    pub processed_at: Option<u64>,
    pub order_id: Option<OrderId>,
    pub trade_ids: Vec<TradeId>,
    pub tx_hash: Option<String>,
    /// Settle intents still in flight for an order message; the message
    /// confirms when this reaches zero.
    pub pending_settlements: u32,
}

impl Message {
    pub fn new(kind: MessageKind, user: Address) -> Self {
        Self {
            id: MessageId::generate(),
            kind,
            user,
            status: MessageStatus::Received,
            created_at: unix_now(),
            processed_at: None,
            order_id: None,
            trade_ids: Vec::new(),
            tx_hash: None,
            pending_settlements: 0,
        }
    }
}

/// Store keyed by message id. Reads are lock-free snapshots; writes go
/// through the transition methods below so a message never moves backward.
#[derive(Debug, Default)]
pub struct MessageStore {
    inner: DashMap<MessageId, Message>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, message: Message) {
        self.inner.insert(message.id, message);
    }

    pub fn get(&self, id: MessageId) -> Option<Message> {
        self.inner.get(&id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Move a message forward in the status DAG. Transitions to an equal or
    /// lower rank, or out of a terminal state, are dropped; returns whether
    /// the transition was applied.
    pub fn advance(&self, id: MessageId, status: MessageStatus) -> bool {
        let Some(mut message) = self.inner.get_mut(&id) else {
            return false;
        };
        if message.status.is_terminal() || status.rank() <= message.status.rank() {
            return false;
        }
        message.status = status;
        message.processed_at = Some(unix_now());
        true
    }

    pub fn record_order(&self, id: MessageId, order_id: OrderId) {
        if let Some(mut message) = self.inner.get_mut(&id) {
            message.order_id = Some(order_id);
        }
    }

    /// Attach the trades produced by an order message and arm the settlement
    /// countdown.
    pub fn record_trades(&self, id: MessageId, trade_ids: &[TradeId]) {
        if let Some(mut message) = self.inner.get_mut(&id) {
            message.trade_ids.extend_from_slice(trade_ids);
            message.pending_settlements += trade_ids.len() as u32;
        }
    }

    pub fn record_tx_hash(&self, id: MessageId, tx_hash: &str) {
        if let Some(mut message) = self.inner.get_mut(&id) {
            message.tx_hash = Some(tx_hash.to_string());
        }
    }

    /// One settle intent of an order message landed on chain. The last one
    /// confirms the message.
    pub fn settlement_succeeded(&self, id: MessageId, tx_hash: &str) {
        let confirm = {
            let Some(mut message) = self.inner.get_mut(&id) else {
                return;
            };
            message.tx_hash = Some(tx_hash.to_string());
            message.pending_settlements = message.pending_settlements.saturating_sub(1);
            message.pending_settlements == 0
        };
        if confirm {
            self.advance(id, MessageStatus::SettlementConfirmed);
        }
    }
}
