//! Shared data model for the duskpool venue.
//!
//! Everything the agents exchange lives here: identifiers, fixed-point
//! amounts, orders and trades, the message lifecycle records, the order book
//! and the queue payload types. All monetary arithmetic is integer at a fixed
//! 7-decimal scale; decimal strings only exist at the API boundary.

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod book;
pub mod health;
pub mod message;

pub use book::OrderBook;
pub use message::{Message, MessageKind, MessageStatus, MessageStore};

// --- Financial primitives ---

/// Token amount in base units at 7-decimal scale.
pub type Amount = u128;

/// Base units per whole token.
pub const SCALE: u128 = 10_000_000;

/// Fractional digits accepted from decimal strings.
pub const DECIMALS: u32 = 7;

/// Limit price as an integer numerator over the implicit [`SCALE`]
/// denominator, in units of B per unit of A.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct Price(pub u128);

impl Price {
    /// B-side value of `quantity` units of A at this price, floored to base
    /// units. `None` when the product overflows.
    pub fn checked_notional(&self, quantity: Amount) -> Option<Amount> {
        self.0.checked_mul(quantity).map(|raw| raw / SCALE)
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_units(self.0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnitsError {
    #[error("not a decimal number: {0}")]
    Malformed(String),
    #[error("negative amounts are not allowed: {0}")]
    Negative(String),
    #[error("more than {DECIMALS} fractional digits: {0}")]
    TooManyDecimals(String),
    #[error("amount out of range: {0}")]
    OutOfRange(String),
}

/// Parse a decimal string into base units. At most [`DECIMALS`] fractional
/// digits are accepted; anything finer is a rejection, not a rounding.
pub fn parse_units(s: &str) -> Result<Amount, UnitsError> {
    use rust_decimal::Decimal;
    use std::str::FromStr;

    let decimal = Decimal::from_str(s).map_err(|_| UnitsError::Malformed(s.to_string()))?;
    if decimal.is_sign_negative() {
        return Err(UnitsError::Negative(s.to_string()));
    }
    if decimal.scale() > DECIMALS {
        return Err(UnitsError::TooManyDecimals(s.to_string()));
    }
    let mantissa = decimal.mantissa() as u128;
    let factor = 10u128.pow(DECIMALS - decimal.scale());
    mantissa
        .checked_mul(factor)
        .ok_or_else(|| UnitsError::OutOfRange(s.to_string()))
}

/// Render base units as a decimal string with trailing zeros trimmed.
pub fn format_units(amount: Amount) -> String {
    let whole = amount / SCALE;
    let frac = amount % SCALE;
    if frac == 0 {
        whole.to_string()
    } else {
        let digits = format!("{frac:07}");
        format!("{whole}.{}", digits.trim_end_matches('0'))
    }
}

// --- Identifiers ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct OrderId(pub u64);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct TradeId(pub u64);

impl fmt::Display for TradeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct MessageId(pub uuid::Uuid);

impl MessageId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        uuid::Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// On-chain identity: a 32-byte ed25519 public key, hex in transit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub [u8; 32]);

impl Address {
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let raw: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(raw))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Address::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// --- Core state & order properties ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Asset {
    A,
    B,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
}

/// A limit order. `reserved_remaining` tracks the unconsumed part of the
/// ledger reservation backing it (B for buys, A for sells), so cancellations
/// and rounding residue release exactly what was locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub user: Address,
    pub side: Side,
    pub price: Price,
    pub quantity: Amount,
    pub remaining: Amount,
    pub reserved_remaining: Amount,
    pub created_seq: u64,
    pub status: OrderStatus,
}

impl Order {
    pub fn new(
        id: OrderId,
        user: Address,
        side: Side,
        price: Price,
        quantity: Amount,
        reserved: Amount,
        created_seq: u64,
    ) -> Self {
        Self {
            id,
            user,
            side,
            price,
            quantity,
            remaining: quantity,
            reserved_remaining: reserved,
            created_seq,
            status: OrderStatus::Open,
        }
    }

    /// Record a fill; `Filled` exactly when nothing remains.
    pub fn fill(&mut self, quantity: Amount) {
        self.remaining -= quantity;
        self.status = if self.remaining == 0 {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
    }

    /// Which asset this order's reservation locks.
    pub fn liability_asset(&self) -> Asset {
        match self.side {
            Side::Buy => Asset::B,
            Side::Sell => Asset::A,
        }
    }
}

/// An executed trade. Immutable once created; executes at the maker's price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    pub buyer: Address,
    pub seller: Address,
    pub price: Price,
    pub quantity: Amount,
    pub taker_order_id: OrderId,
    pub maker_order_id: OrderId,
}

// --- Balances ---

/// Per-user, per-asset balance. `available` is the total on-platform amount;
/// `liabilities` is the slice reserved by resting orders; the spendable part
/// is `available - liabilities`. Invariant at every observable point:
/// `liabilities <= available + pending_deposits`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserBalance {
    pub available: Amount,
    pub liabilities: Amount,
    pub pending_deposits: Amount,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    pub asset_a: UserBalance,
    pub asset_b: UserBalance,
}

impl UserAccount {
    pub fn balance(&self, asset: Asset) -> &UserBalance {
        match asset {
            Asset::A => &self.asset_a,
            Asset::B => &self.asset_b,
        }
    }

    pub fn balance_mut(&mut self, asset: Asset) -> &mut UserBalance {
        match asset {
            Asset::A => &mut self.asset_a,
            Asset::B => &mut self.asset_b,
        }
    }
}

// --- Queue payloads ---

/// Deposit observed on chain. `(tx_hash, event_index)` is the dedup key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositEvent {
    pub tx_hash: String,
    pub event_index: u32,
    pub user: Address,
    pub asset: Asset,
    pub amount: Amount,
    pub ledger_seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub user: Address,
    pub side: Side,
    pub price: Price,
    pub quantity: Amount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub user: Address,
    pub order_id: OrderId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawRequest {
    pub user: Address,
    pub asset: Asset,
    pub amount: Amount,
}

/// Tagged incoming payload; the executor dispatches on this exhaustively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Order(OrderRequest),
    Cancel(CancelRequest),
    Withdraw(WithdrawRequest),
    Deposit(DepositEvent),
}

/// Item carried by the incoming queue.
pub type IncomingItem = (MessageId, Request);

/// Chain settlement of one trade: the seller's A against the buyer's B.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettleIntent {
    pub buyer: Address,
    pub seller: Address,
    pub asset_sold: Asset,
    pub amount_sold: Amount,
    pub asset_bought: Asset,
    pub amount_bought: Amount,
    pub trade_id: TradeId,
    pub message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawIntent {
    pub user: Address,
    pub asset: Asset,
    pub amount: Amount,
    pub message_id: MessageId,
}

/// Action queued for on-chain submission by the outgoing processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutgoingIntent {
    Settle(SettleIntent),
    Withdraw(WithdrawIntent),
}

/// Credit flowing back from the outgoing processor after a withdrawal failed
/// on chain terminally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compensation {
    pub user: Address,
    pub asset: Asset,
    pub amount: Amount,
    pub message_id: MessageId,
}

// --- State snapshot ---

/// Output of the pluggable snapshot hook; enough to reconstruct executor
/// state. Accounts are sorted by address so snapshots compare bytewise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub accounts: Vec<(Address, UserAccount)>,
    pub book: OrderBook,
    pub trades: Vec<Trade>,
}

/// Seconds since the unix epoch.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
