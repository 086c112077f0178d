//! Chain RPC event source.
//!
//! Fetches the orderbook contract's deposit events from the chain RPC.
//! Individual events that fail to decode are logged and skipped, matching
//! the at-least-once posture: a skipped event never wedges the cursor.

use crate::{EventCursor, EventSource, SourceError};
use async_trait::async_trait;
use common_types::{Address, Asset, DepositEvent};
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

pub struct RpcEventSource {
    client: reqwest::Client,
    rpc_url: String,
    contract_id: String,
}

#[derive(Deserialize)]
struct RawDepositEvent {
    tx_hash: String,
    event_index: u32,
    user: String,
    asset: String,
    amount: String,
    ledger_seq: u64,
}

impl RpcEventSource {
    pub fn new(rpc_url: String, contract_id: String) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            rpc_url,
            contract_id,
        })
    }
}

fn decode(raw: RawDepositEvent) -> Option<DepositEvent> {
    let user = Address::from_hex(&raw.user).ok()?;
    let asset = match raw.asset.as_str() {
        "a" => Asset::A,
        "b" => Asset::B,
        _ => return None,
    };
    let amount = raw.amount.parse().ok()?;
    Some(DepositEvent {
        tx_hash: raw.tx_hash,
        event_index: raw.event_index,
        user,
        asset,
        amount,
        ledger_seq: raw.ledger_seq,
    })
}

#[async_trait]
impl EventSource for RpcEventSource {
    async fn deposit_events(
        &self,
        after: EventCursor,
        limit: usize,
    ) -> Result<Vec<DepositEvent>, SourceError> {
        let url = format!(
            "{}/contracts/{}/deposit-events",
            self.rpc_url, self.contract_id
        );
        let response = self
            .client
            .get(url)
            .query(&[
                ("after_ledger", after.ledger_seq.to_string()),
                ("after_index", after.event_index.to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await
            .map_err(|error| SourceError::Rpc(error.to_string()))?
            .error_for_status()
            .map_err(|error| SourceError::Rpc(error.to_string()))?;

        let raw_events: Vec<RawDepositEvent> = response
            .json()
            .await
            .map_err(|error| SourceError::Rpc(error.to_string()))?;

        Ok(raw_events
            .into_iter()
            .filter_map(|raw| {
                let tx_hash = raw.tx_hash.clone();
                let decoded = decode(raw);
                if decoded.is_none() {
                    warn!(%tx_hash, "skipping undecodable deposit event");
                }
                decoded
            })
            .collect())
    }
}
