//! Deposit event ingestion.
//!
//! Polls an [`EventSource`] for contract deposit events strictly after the
//! current cursor, turns each into a `Deposit` message on the incoming queue
//! and advances the cursor only once the enqueue succeeded. Delivery is
//! at-least-once by design; the executor's `(tx_hash, event_index)` dedup key
//! makes replays harmless.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common_types::health::{Agent, Heartbeats};
use common_types::{DepositEvent, IncomingItem, Message, MessageKind, MessageStore, Request};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub mod rpc;

/// Position of the last consumed event in the chain's event stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventCursor {
    pub ledger_seq: u64,
    pub event_index: u32,
}

impl EventCursor {
    /// Cursor that makes the next poll deliver everything from
    /// `ledger_seq` (inclusive) onwards.
    pub fn starting_at(ledger_seq: u64) -> Self {
        Self {
            ledger_seq: ledger_seq.saturating_sub(1),
            event_index: u32::MAX,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("chain rpc error: {0}")]
    Rpc(String),
}

/// Where deposit events come from. Implementations fetch events strictly
/// after `cursor` in `(ledger_seq, event_index)` order.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn deposit_events(
        &self,
        after: EventCursor,
        limit: usize,
    ) -> Result<Vec<DepositEvent>, SourceError>;
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Source(SourceError),
    #[error("incoming queue closed")]
    QueueClosed,
}

pub struct DepositIngestor {
    source: Box<dyn EventSource>,
    incoming: mpsc::Sender<IncomingItem>,
    store: Arc<MessageStore>,
    heartbeats: Arc<Heartbeats>,
    cursor: EventCursor,
    poll_interval: Duration,
    batch_limit: usize,
}

impl DepositIngestor {
    pub fn new(
        source: Box<dyn EventSource>,
        incoming: mpsc::Sender<IncomingItem>,
        store: Arc<MessageStore>,
        heartbeats: Arc<Heartbeats>,
        cursor: EventCursor,
        poll_interval: Duration,
        batch_limit: usize,
    ) -> Self {
        Self {
            source,
            incoming,
            store,
            heartbeats,
            cursor,
            poll_interval,
            batch_limit,
        }
    }

    pub fn cursor(&self) -> EventCursor {
        self.cursor
    }

    /// Poll on the configured interval until the incoming queue closes.
    /// Source errors are logged and retried on the next tick.
    pub async fn run(mut self) {
        info!(
            ledger_seq = self.cursor.ledger_seq,
            "deposit ingestor started"
        );
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.poll_once().await {
                Ok(delivered) => {
                    if delivered > 0 {
                        debug!(delivered, ledger_seq = self.cursor.ledger_seq, "deposit events enqueued");
                    }
                }
                Err(PollError::QueueClosed) => break,
                Err(PollError::Source(error)) => {
                    warn!(error = %error, "event poll failed, retrying next tick");
                }
            }
            self.heartbeats.beat(Agent::Ingestor);
        }
        info!("deposit ingestor stopped");
    }

    /// One fetch-and-enqueue round. The cursor only moves past an event once
    /// its message is safely on the incoming queue.
    pub async fn poll_once(&mut self) -> Result<usize, PollError> {
        let events = self
            .source
            .deposit_events(self.cursor, self.batch_limit)
            .await
            .map_err(PollError::Source)?;

        let mut delivered = 0;
        for event in events {
            let position = EventCursor {
                ledger_seq: event.ledger_seq,
                event_index: event.event_index,
            };
            if position <= self.cursor {
                // Source replayed something we already consumed.
                continue;
            }
            let message = Message::new(MessageKind::Deposit, event.user);
            let message_id = message.id;
            self.store.insert(message);
            self.incoming
                .send((message_id, Request::Deposit(event)))
                .await
                .map_err(|_| PollError::QueueClosed)?;
            self.cursor = position;
            delivered += 1;
        }
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_types::{Address, Asset};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct StubSource {
        batches: Mutex<VecDeque<Result<Vec<DepositEvent>, SourceError>>>,
    }

    impl StubSource {
        fn new(batches: Vec<Result<Vec<DepositEvent>, SourceError>>) -> Self {
            Self {
                batches: Mutex::new(batches.into()),
            }
        }
    }

    #[async_trait]
    impl EventSource for StubSource {
        async fn deposit_events(
            &self,
            _after: EventCursor,
            _limit: usize,
        ) -> Result<Vec<DepositEvent>, SourceError> {
            self.batches
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn event(ledger_seq: u64, event_index: u32, tx: &str) -> DepositEvent {
        DepositEvent {
            tx_hash: tx.to_string(),
            event_index,
            user: Address([1; 32]),
            asset: Asset::A,
            amount: 100,
            ledger_seq,
        }
    }

    fn ingestor(
        source: StubSource,
        cursor: EventCursor,
        queue_depth: usize,
    ) -> (DepositIngestor, mpsc::Receiver<IncomingItem>, Arc<MessageStore>) {
        let (tx, rx) = mpsc::channel(queue_depth);
        let store = Arc::new(MessageStore::new());
        let ingestor = DepositIngestor::new(
            Box::new(source),
            tx,
            store.clone(),
            Arc::new(Heartbeats::default()),
            cursor,
            Duration::from_millis(10),
            100,
        );
        (ingestor, rx, store)
    }

    #[tokio::test]
    async fn events_are_enqueued_and_the_cursor_advances() {
        let source = StubSource::new(vec![Ok(vec![
            event(10, 0, "h1"),
            event(10, 1, "h1"),
            event(11, 0, "h2"),
        ])]);
        let (mut ingestor, mut rx, store) = ingestor(source, EventCursor::default(), 8);

        let delivered = ingestor.poll_once().await.unwrap();
        assert_eq!(delivered, 3);
        assert_eq!(ingestor.cursor(), EventCursor { ledger_seq: 11, event_index: 0 });

        let (id, request) = rx.recv().await.unwrap();
        assert!(store.get(id).is_some());
        assert!(matches!(request, Request::Deposit(ref e) if e.tx_hash == "h1"));
    }

    #[tokio::test]
    async fn events_at_or_below_the_cursor_are_dropped() {
        let cursor = EventCursor { ledger_seq: 10, event_index: 1 };
        let source = StubSource::new(vec![Ok(vec![
            event(10, 0, "old"),
            event(10, 1, "old"),
            event(10, 2, "new"),
        ])]);
        let (mut ingestor, mut rx, _store) = ingestor(source, cursor, 8);

        let delivered = ingestor.poll_once().await.unwrap();
        assert_eq!(delivered, 1);
        let (_, request) = rx.recv().await.unwrap();
        assert!(matches!(request, Request::Deposit(ref e) if e.tx_hash == "new"));
    }

    #[tokio::test]
    async fn source_errors_leave_the_cursor_in_place() {
        let cursor = EventCursor { ledger_seq: 5, event_index: 3 };
        let source = StubSource::new(vec![Err(SourceError::Rpc("boom".into()))]);
        let (mut ingestor, _rx, _store) = ingestor(source, cursor, 8);

        assert!(matches!(ingestor.poll_once().await, Err(PollError::Source(_))));
        assert_eq!(ingestor.cursor(), cursor);
    }

    #[test]
    fn starting_cursor_includes_the_first_ledger() {
        let cursor = EventCursor::starting_at(100);
        let first = EventCursor { ledger_seq: 100, event_index: 0 };
        assert!(first > cursor);
        assert!(EventCursor { ledger_seq: 99, event_index: 7 } < cursor);
    }
}
