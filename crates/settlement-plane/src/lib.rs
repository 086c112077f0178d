//! Settlement plane: the outgoing processor.
//!
//! Drains the outgoing queue one intent at a time and effects each on chain
//! through a [`ChainSubmitter`]. Submission is strictly sequential so the
//! admin account's transaction ordering stays trivial. Transient chain
//! failures are retried with bounded exponential backoff; terminal outcomes
//! are recorded on the message store, and a terminally failed withdrawal
//! sends a compensating credit back to the executor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common_types::health::{Agent, Heartbeats};
use common_types::{
    Compensation, MessageStatus, MessageStore, OutgoingIntent, SettleIntent, WithdrawIntent,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

pub mod rpc;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// Network-level trouble: worth retrying.
    #[error("transient chain error: {0}")]
    Transient(String),
    /// The chain itself refused the transaction: retrying cannot help.
    #[error("terminal chain error: {0}")]
    Terminal(String),
}

/// Thin abstraction over transaction construction and submission. The
/// processor only ever sees a transaction hash or a classified failure.
#[async_trait]
pub trait ChainSubmitter: Send + Sync {
    async fn submit_settlement(&self, settle: &SettleIntent) -> Result<String, SubmitError>;
    async fn submit_withdrawal(&self, withdraw: &WithdrawIntent) -> Result<String, SubmitError>;
}

#[async_trait]
impl<T: ChainSubmitter + ?Sized> ChainSubmitter for Arc<T> {
    async fn submit_settlement(&self, settle: &SettleIntent) -> Result<String, SubmitError> {
        (**self).submit_settlement(settle).await
    }

    async fn submit_withdrawal(&self, withdraw: &WithdrawIntent) -> Result<String, SubmitError> {
        (**self).submit_withdrawal(withdraw).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_initial: Duration,
    pub backoff_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_initial: Duration::from_millis(250),
            backoff_cap: Duration::from_secs(10),
        }
    }
}

pub struct OutgoingProcessor {
    outgoing: mpsc::Receiver<OutgoingIntent>,
    compensation: mpsc::Sender<Compensation>,
    submitter: Box<dyn ChainSubmitter>,
    store: Arc<MessageStore>,
    heartbeats: Arc<Heartbeats>,
    retry: RetryPolicy,
}

impl OutgoingProcessor {
    pub fn new(
        outgoing: mpsc::Receiver<OutgoingIntent>,
        compensation: mpsc::Sender<Compensation>,
        submitter: Box<dyn ChainSubmitter>,
        store: Arc<MessageStore>,
        heartbeats: Arc<Heartbeats>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            outgoing,
            compensation,
            submitter,
            store,
            heartbeats,
            retry,
        }
    }

    pub async fn run(mut self) {
        info!("outgoing processor started");
        while let Some(intent) = self.outgoing.recv().await {
            self.process(intent).await;
            self.heartbeats.beat(Agent::Processor);
        }
        info!("outgoing processor stopped");
    }

    pub async fn process(&self, intent: OutgoingIntent) {
        match intent {
            OutgoingIntent::Settle(settle) => self.process_settle(settle).await,
            OutgoingIntent::Withdraw(withdraw) => self.process_withdraw(withdraw).await,
        }
    }

    async fn process_settle(&self, settle: SettleIntent) {
        match self
            .submit_with_retry(|| self.submitter.submit_settlement(&settle))
            .await
        {
            Ok(tx_hash) => {
                self.store.settlement_succeeded(settle.message_id, &tx_hash);
                info!(trade_id = settle.trade_id.0, %tx_hash, "trade settled on chain");
            }
            Err(failure) => {
                // The off-chain ledger already reflects this trade; the
                // failed chain leg is retried out-of-band by an operator.
                error!(trade_id = settle.trade_id.0, error = %failure, "settlement failed");
                self.store.advance(
                    settle.message_id,
                    MessageStatus::SettlementFailed(failure.to_string()),
                );
            }
        }
    }

    async fn process_withdraw(&self, withdraw: WithdrawIntent) {
        match self
            .submit_with_retry(|| self.submitter.submit_withdrawal(&withdraw))
            .await
        {
            Ok(tx_hash) => {
                self.store.record_tx_hash(withdraw.message_id, &tx_hash);
                self.store
                    .advance(withdraw.message_id, MessageStatus::SettlementConfirmed);
                info!(user = %withdraw.user, %tx_hash, "withdrawal settled on chain");
            }
            Err(failure) => {
                error!(user = %withdraw.user, error = %failure, "withdrawal failed, compensating");
                let credit = Compensation {
                    user: withdraw.user,
                    asset: withdraw.asset,
                    amount: withdraw.amount,
                    message_id: withdraw.message_id,
                };
                if self.compensation.send(credit).await.is_err() {
                    error!(
                        message_id = %withdraw.message_id,
                        "executor gone, compensating credit dropped"
                    );
                }
                self.store.advance(
                    withdraw.message_id,
                    MessageStatus::SettlementFailed(failure.to_string()),
                );
            }
        }
    }

    /// Run one submission with the configured retry budget. Transient errors
    /// back off exponentially up to the cap; exhausting the budget turns the
    /// last transient error terminal.
    async fn submit_with_retry<F, Fut>(&self, mut attempt: F) -> Result<String, SubmitError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<String, SubmitError>>,
    {
        let mut backoff = self.retry.backoff_initial;
        let mut attempts = 0u32;
        loop {
            match attempt().await {
                Ok(tx_hash) => return Ok(tx_hash),
                Err(SubmitError::Transient(reason)) if attempts < self.retry.max_retries => {
                    attempts += 1;
                    warn!(attempts, %reason, backoff_ms = backoff.as_millis() as u64, "transient chain failure, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.retry.backoff_cap);
                }
                Err(SubmitError::Transient(reason)) => {
                    return Err(SubmitError::Terminal(format!("retry budget exhausted: {reason}")));
                }
                Err(terminal) => return Err(terminal),
            }
        }
    }
}

/// Submitter that never reaches a chain; stands in when no admin key is
/// configured and in tests.
#[derive(Debug, Default)]
pub struct MockSubmitter {
    submitted: std::sync::Mutex<Vec<OutgoingIntent>>,
}

impl MockSubmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&self) -> Vec<OutgoingIntent> {
        self.submitted.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ChainSubmitter for MockSubmitter {
    async fn submit_settlement(&self, settle: &SettleIntent) -> Result<String, SubmitError> {
        if let Ok(mut submitted) = self.submitted.lock() {
            submitted.push(OutgoingIntent::Settle(settle.clone()));
        }
        Ok(format!("mock-settle-{}", settle.trade_id.0))
    }

    async fn submit_withdrawal(&self, withdraw: &WithdrawIntent) -> Result<String, SubmitError> {
        if let Ok(mut submitted) = self.submitted.lock() {
            submitted.push(OutgoingIntent::Withdraw(withdraw.clone()));
        }
        Ok(format!("mock-withdraw-{}", withdraw.message_id))
    }
}
