//! End-to-end executor scenarios: deposits, matching, cancellation,
//! withdrawal compensation and the ledger invariant, driven through the same
//! message plumbing the service uses.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common_types::health::Heartbeats;
use common_types::{
    Address, Amount, Asset, CancelRequest, Compensation, DepositEvent, IncomingItem, Message,
    MessageId, MessageKind, MessageStatus, MessageStore, OrderRequest, OrderStatus, OutgoingIntent,
    Price, Request, SettleIntent, Side, WithdrawIntent, WithdrawRequest, SCALE,
};
use execution_plane::Executor;
use settlement_plane::{ChainSubmitter, OutgoingProcessor, RetryPolicy, SubmitError};
use tokio::sync::mpsc;

fn units(n: u64) -> Amount {
    n as Amount * SCALE
}

fn price(s: &str) -> Price {
    Price(common_types::parse_units(s).expect("valid price"))
}

fn addr(tag: u8) -> Address {
    Address([tag; 32])
}

struct Harness {
    executor: Executor,
    store: Arc<MessageStore>,
    outgoing_rx: mpsc::Receiver<OutgoingIntent>,
    compensation_tx: mpsc::Sender<Compensation>,
    compensation_rx: mpsc::Receiver<Compensation>,
    _incoming_tx: mpsc::Sender<IncomingItem>,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(MessageStore::new());
        let heartbeats = Arc::new(Heartbeats::default());
        let (incoming_tx, incoming_rx) = mpsc::channel(64);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(64);
        // The executor gets its own (idle) compensation receiver; the tests
        // drain the processor-facing channel and feed credits in directly.
        let (compensation_tx, compensation_rx) = mpsc::channel(64);
        let (_idle_tx, idle_rx) = mpsc::channel(1);
        let executor = Executor::new(incoming_rx, idle_rx, outgoing_tx, store.clone(), heartbeats);
        Self {
            executor,
            store,
            outgoing_rx,
            compensation_tx,
            compensation_rx,
            _incoming_tx: incoming_tx,
        }
    }

    /// Record a message and run its handler to completion.
    async fn submit(&mut self, kind: MessageKind, user: Address, request: Request) -> MessageId {
        let message = Message::new(kind, user);
        let id = message.id;
        self.store.insert(message);
        self.executor.handle(id, request).await.expect("handler succeeded");
        assert!(self.executor.ledger().invariant_holds());
        id
    }

    async fn deposit(&mut self, user: Address, asset: Asset, amount: Amount, tx: &str, index: u32) -> MessageId {
        let event = DepositEvent {
            tx_hash: tx.to_string(),
            event_index: index,
            user,
            asset,
            amount,
            ledger_seq: 1,
        };
        self.submit(MessageKind::Deposit, user, Request::Deposit(event)).await
    }

    async fn order(&mut self, user: Address, side: Side, limit: Price, quantity: Amount) -> MessageId {
        let request = OrderRequest { user, side, price: limit, quantity };
        self.submit(MessageKind::Order, user, Request::Order(request)).await
    }

    fn status(&self, id: MessageId) -> MessageStatus {
        self.store.get(id).expect("message stored").status
    }

    fn available(&self, user: Address, asset: Asset) -> Amount {
        self.executor.ledger().available(&user, asset)
    }

    fn liabilities(&self, user: Address, asset: Asset) -> Amount {
        self.executor.ledger().liabilities(&user, asset)
    }
}

struct TerminalFailSubmitter;

#[async_trait]
impl ChainSubmitter for TerminalFailSubmitter {
    async fn submit_settlement(&self, _settle: &SettleIntent) -> Result<String, SubmitError> {
        Err(SubmitError::Terminal("contract call reverted".into()))
    }

    async fn submit_withdrawal(&self, _withdraw: &WithdrawIntent) -> Result<String, SubmitError> {
        Err(SubmitError::Terminal("contract call reverted".into()))
    }
}

#[tokio::test]
async fn simple_match_moves_both_ledgers_and_emits_one_settle() {
    let mut h = Harness::new();
    let seller = addr(1);
    let buyer = addr(2);

    h.deposit(seller, Asset::A, units(100), "h1", 0).await;
    h.deposit(buyer, Asset::B, units(300), "h2", 0).await;

    let sell_id = h.order(seller, Side::Sell, price("2.0"), units(100)).await;
    let buy_id = h.order(buyer, Side::Buy, price("2.5"), units(100)).await;

    assert_eq!(h.status(sell_id), MessageStatus::Accepted);
    assert_eq!(h.status(buy_id), MessageStatus::Accepted);

    let trades = h.executor.trades();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].price, price("2.0"));
    assert_eq!(trades[0].quantity, units(100));
    assert_eq!(trades[0].buyer, buyer);
    assert_eq!(trades[0].seller, seller);

    // Seller: -100 A (both sides), +200 B. Buyer: -200 B, +100 A, and the
    // 50 B reserved above the maker price released back.
    assert_eq!(h.available(seller, Asset::A), 0);
    assert_eq!(h.available(seller, Asset::B), units(200));
    assert_eq!(h.liabilities(seller, Asset::A), 0);
    assert_eq!(h.available(buyer, Asset::A), units(100));
    assert_eq!(h.available(buyer, Asset::B), units(100));
    assert_eq!(h.liabilities(buyer, Asset::B), 0);

    let intent = h.outgoing_rx.try_recv().expect("one settle intent");
    match intent {
        OutgoingIntent::Settle(settle) => {
            assert_eq!(settle.amount_sold, units(100));
            assert_eq!(settle.amount_bought, units(200));
            assert_eq!(settle.buyer, buyer);
            assert_eq!(settle.seller, seller);
            assert_eq!(settle.message_id, buy_id);
        }
        other => panic!("expected a settle intent, got {other:?}"),
    }
    assert!(h.outgoing_rx.try_recv().is_err());

    let buy_message = h.store.get(buy_id).unwrap();
    assert_eq!(buy_message.trade_ids.len(), 1);
    assert!(h.executor.book().is_empty());
}

#[tokio::test]
async fn partial_fill_rests_the_maker_with_reduced_liability() {
    let mut h = Harness::new();
    let maker = addr(1);
    let taker = addr(2);

    h.deposit(maker, Asset::A, units(100), "h1", 0).await;
    h.deposit(taker, Asset::B, units(80), "h2", 0).await;

    let maker_id = h.order(maker, Side::Sell, price("2.0"), units(100)).await;
    let taker_id = h.order(taker, Side::Buy, price("2.0"), units(40)).await;

    assert_eq!(h.status(taker_id), MessageStatus::Accepted);

    let trades = h.executor.trades();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].quantity, units(40));

    let maker_order_id = h.store.get(maker_id).unwrap().order_id.expect("maker resting");
    let resting = h.executor.book().get(maker_order_id).expect("maker on book");
    assert_eq!(resting.remaining, units(60));
    assert_eq!(resting.status, OrderStatus::PartiallyFilled);
    assert_eq!(h.liabilities(maker, Asset::A), units(60));

    // Taker fully filled: nothing rests, nothing stays reserved.
    assert_eq!(h.liabilities(taker, Asset::B), 0);
    assert_eq!(h.available(taker, Asset::A), units(40));
    assert_eq!(h.available(taker, Asset::B), 0);
}

#[tokio::test]
async fn cancel_releases_the_full_liability() {
    let mut h = Harness::new();
    let user = addr(1);

    h.deposit(user, Asset::A, units(50), "h1", 0).await;
    let order_id_msg = h.order(user, Side::Sell, price("3.0"), units(50)).await;
    assert_eq!(h.liabilities(user, Asset::A), units(50));

    let order_id = h.store.get(order_id_msg).unwrap().order_id.expect("resting order");
    let cancel_id = h
        .submit(
            MessageKind::Cancel,
            user,
            Request::Cancel(CancelRequest { user, order_id }),
        )
        .await;

    assert_eq!(h.status(cancel_id), MessageStatus::SettlementConfirmed);
    assert_eq!(h.liabilities(user, Asset::A), 0);
    assert_eq!(h.available(user, Asset::A), units(50));
    assert!(h.executor.book().is_empty());
    assert!(h.outgoing_rx.try_recv().is_err());
}

#[tokio::test]
async fn cancel_of_foreign_or_unknown_orders_is_rejected() {
    let mut h = Harness::new();
    let owner = addr(1);
    let intruder = addr(2);

    h.deposit(owner, Asset::A, units(10), "h1", 0).await;
    let msg = h.order(owner, Side::Sell, price("1.0"), units(10)).await;
    let order_id = h.store.get(msg).unwrap().order_id.unwrap();

    let foreign = h
        .submit(
            MessageKind::Cancel,
            intruder,
            Request::Cancel(CancelRequest { user: intruder, order_id }),
        )
        .await;
    assert!(matches!(h.status(foreign), MessageStatus::Rejected(_)));
    assert!(h.executor.book().get(order_id).is_some());

    let missing = h
        .submit(
            MessageKind::Cancel,
            owner,
            Request::Cancel(CancelRequest { user: owner, order_id: common_types::OrderId(999) }),
        )
        .await;
    assert!(matches!(h.status(missing), MessageStatus::Rejected(_)));
}

#[tokio::test]
async fn insufficient_funds_rejects_and_leaves_the_book_untouched() {
    let mut h = Harness::new();
    let broke = addr(3);

    let id = h.order(broke, Side::Buy, price("1.0"), units(1)).await;

    match h.status(id) {
        MessageStatus::Rejected(reason) => assert!(reason.contains("insufficient")),
        other => panic!("expected rejection, got {other:?}"),
    }
    assert!(h.executor.book().is_empty());
    assert!(h.executor.trades().is_empty());
    assert!(h.outgoing_rx.try_recv().is_err());
    assert_eq!(h.liabilities(broke, Asset::B), 0);
}

#[tokio::test]
async fn duplicate_deposit_events_credit_exactly_once() {
    let mut h = Harness::new();
    let user = addr(1);

    let first = h.deposit(user, Asset::A, units(10), "h", 0).await;
    let second = h.deposit(user, Asset::A, units(10), "h", 0).await;

    assert_eq!(h.available(user, Asset::A), units(10));
    assert_eq!(h.status(first), MessageStatus::SettlementConfirmed);
    assert_eq!(h.status(second), MessageStatus::SettlementConfirmed);

    // A different event index on the same transaction is a distinct deposit.
    h.deposit(user, Asset::A, units(10), "h", 1).await;
    assert_eq!(h.available(user, Asset::A), units(20));
}

#[tokio::test]
async fn failed_withdrawal_is_compensated_back_to_available() {
    let mut h = Harness::new();
    let user = addr(1);

    h.deposit(user, Asset::B, units(50), "h1", 0).await;
    let withdraw_id = h
        .submit(
            MessageKind::Withdrawal,
            user,
            Request::Withdraw(WithdrawRequest { user, asset: Asset::B, amount: units(30) }),
        )
        .await;

    assert_eq!(h.status(withdraw_id), MessageStatus::SettlementPending);
    assert_eq!(h.available(user, Asset::B), units(20));

    let intent = h.outgoing_rx.try_recv().expect("withdraw intent queued");
    let processor = OutgoingProcessor::new(
        mpsc::channel(1).1,
        h.compensation_tx.clone(),
        Box::new(TerminalFailSubmitter),
        h.store.clone(),
        Arc::new(Heartbeats::default()),
        RetryPolicy {
            max_retries: 0,
            backoff_initial: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(1),
        },
    );
    processor.process(intent).await;

    assert!(matches!(h.status(withdraw_id), MessageStatus::SettlementFailed(_)));

    let credit = h.compensation_rx.try_recv().expect("compensating credit");
    h.executor.handle_compensation(credit);
    assert_eq!(h.available(user, Asset::B), units(50));
    assert!(h.executor.ledger().invariant_holds());
}

#[tokio::test]
async fn withdrawals_cannot_spend_reserved_funds() {
    let mut h = Harness::new();
    let user = addr(1);

    h.deposit(user, Asset::B, units(100), "h1", 0).await;
    h.order(user, Side::Buy, price("1.0"), units(80)).await;

    let too_much = h
        .submit(
            MessageKind::Withdrawal,
            user,
            Request::Withdraw(WithdrawRequest { user, asset: Asset::B, amount: units(30) }),
        )
        .await;
    assert!(matches!(h.status(too_much), MessageStatus::Rejected(_)));

    let fits = h
        .submit(
            MessageKind::Withdrawal,
            user,
            Request::Withdraw(WithdrawRequest { user, asset: Asset::B, amount: units(20) }),
        )
        .await;
    assert_eq!(h.status(fits), MessageStatus::SettlementPending);
}

#[tokio::test]
async fn taker_price_improvement_releases_the_reservation_gap() {
    let mut h = Harness::new();
    let seller = addr(1);
    let buyer = addr(2);

    h.deposit(seller, Asset::A, units(10), "h1", 0).await;
    h.deposit(buyer, Asset::B, units(25), "h2", 0).await;

    h.order(seller, Side::Sell, price("2.0"), units(10)).await;
    h.order(buyer, Side::Buy, price("2.5"), units(10)).await;

    // Reserved 25 B at the limit, paid 20 B at the maker price; the gap must
    // be spendable again immediately.
    assert_eq!(h.available(buyer, Asset::B), units(5));
    assert_eq!(h.liabilities(buyer, Asset::B), 0);
}

#[tokio::test]
async fn orders_crossing_multiple_levels_settle_in_price_order() {
    let mut h = Harness::new();
    let buyer = addr(9);

    for (tag, limit) in [(1u8, "2.2"), (2, "2.0"), (3, "2.1")] {
        let seller = addr(tag);
        h.deposit(seller, Asset::A, units(10), &format!("h{tag}"), 0).await;
        h.order(seller, Side::Sell, price(limit), units(10)).await;
    }
    h.deposit(buyer, Asset::B, units(100), "hb", 0).await;
    let taker_id = h.order(buyer, Side::Buy, price("2.2"), units(30)).await;

    let trades = h.executor.trades();
    assert_eq!(trades.len(), 3);
    let prices: Vec<Price> = trades.iter().map(|t| t.price).collect();
    assert_eq!(prices, vec![price("2.0"), price("2.1"), price("2.2")]);

    let mut settle_ids = Vec::new();
    while let Ok(intent) = h.outgoing_rx.try_recv() {
        if let OutgoingIntent::Settle(settle) = intent {
            assert_eq!(settle.message_id, taker_id);
            settle_ids.push(settle.trade_id);
        }
    }
    let trade_ids: Vec<_> = trades.iter().map(|t| t.id).collect();
    assert_eq!(settle_ids, trade_ids);
    // 10 * (2.0 + 2.1 + 2.2) = 63 B spent out of 100.
    assert_eq!(h.available(buyer, Asset::B), units(37));
    assert_eq!(h.available(buyer, Asset::A), units(30));
}

#[tokio::test]
async fn identical_input_sequences_produce_identical_state() {
    async fn run_sequence() -> (common_types::StateSnapshot, Vec<common_types::Trade>) {
        let mut h = Harness::new();
        let u1 = addr(1);
        let u2 = addr(2);
        let u3 = addr(3);

        h.deposit(u1, Asset::A, units(100), "h1", 0).await;
        h.deposit(u2, Asset::B, units(300), "h2", 0).await;
        h.deposit(u3, Asset::B, units(5), "h3", 0).await;

        h.order(u1, Side::Sell, price("2.0"), units(60)).await;
        h.order(u2, Side::Buy, price("2.5"), units(40)).await;
        // Rejected: u3 cannot cover this.
        h.order(u3, Side::Buy, price("2.0"), units(40)).await;
        h.order(u2, Side::Buy, price("1.9"), units(10)).await;
        let msg = h.order(u1, Side::Sell, price("3.0"), units(30)).await;
        let order_id = h.store.get(msg).unwrap().order_id.unwrap();
        h.submit(
            MessageKind::Cancel,
            u1,
            Request::Cancel(CancelRequest { user: u1, order_id }),
        )
        .await;

        (h.executor.snapshot(), h.executor.trades().to_vec())
    }

    let (snapshot_a, trades_a) = run_sequence().await;
    let (snapshot_b, trades_b) = run_sequence().await;
    assert_eq!(snapshot_a, snapshot_b);
    assert_eq!(trades_a, trades_b);
}
