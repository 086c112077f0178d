//! Chain RPC submitter.
//!
//! Builds the canonical JSON payload for a contract call, signs it with the
//! admin key and POSTs it to the chain RPC. Transport trouble and 5xx
//! responses are transient; anything the chain itself refuses is terminal.

use crate::{ChainSubmitter, SubmitError};
use async_trait::async_trait;
use common_types::{SettleIntent, WithdrawIntent};
use ed25519_dalek::{Signer, SigningKey};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcSetupError {
    #[error("admin secret key is not 32 hex-encoded bytes")]
    BadAdminKey,
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}

pub struct RpcSubmitter {
    client: reqwest::Client,
    rpc_url: String,
    contract_id: String,
    admin_key: SigningKey,
}

#[derive(Deserialize)]
struct SubmitResponse {
    status: String,
    #[serde(default)]
    hash: String,
    #[serde(default)]
    error: Option<String>,
}

impl RpcSubmitter {
    pub fn new(
        rpc_url: String,
        contract_id: String,
        admin_secret_hex: &str,
    ) -> Result<Self, RpcSetupError> {
        let seed: [u8; 32] = hex::decode(admin_secret_hex)
            .map_err(|_| RpcSetupError::BadAdminKey)?
            .try_into()
            .map_err(|_| RpcSetupError::BadAdminKey)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            rpc_url,
            contract_id,
            admin_key: SigningKey::from_bytes(&seed),
        })
    }

    pub fn admin_public_key(&self) -> String {
        hex::encode(self.admin_key.verifying_key().to_bytes())
    }

    async fn submit(&self, op: &str, args: serde_json::Value) -> Result<String, SubmitError> {
        let payload = json!({
            "contract_id": self.contract_id,
            "op": op,
            "args": args,
        });
        let canonical = payload.to_string();
        let signature = self.admin_key.sign(canonical.as_bytes());
        let envelope = json!({
            "payload": payload,
            "admin": self.admin_public_key(),
            "signature": hex::encode(signature.to_bytes()),
        });

        let response = self
            .client
            .post(format!("{}/transactions", self.rpc_url))
            .json(&envelope)
            .send()
            .await
            .map_err(|error| SubmitError::Transient(error.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(SubmitError::Transient(format!("chain rpc returned {status}")));
        }
        if !status.is_success() {
            return Err(SubmitError::Terminal(format!("chain rpc rejected submission: {status}")));
        }

        let body: SubmitResponse = response
            .json()
            .await
            .map_err(|error| SubmitError::Transient(error.to_string()))?;
        match body.status.as_str() {
            "success" => Ok(body.hash),
            other => Err(SubmitError::Terminal(format!(
                "transaction failed on chain: {}",
                body.error.unwrap_or_else(|| other.to_string())
            ))),
        }
    }
}

#[async_trait]
impl ChainSubmitter for RpcSubmitter {
    async fn submit_settlement(&self, settle: &SettleIntent) -> Result<String, SubmitError> {
        self.submit(
            "settle",
            json!({
                "buyer": settle.buyer.to_string(),
                "seller": settle.seller.to_string(),
                "asset_sold": settle.asset_sold,
                "amount_sold": settle.amount_sold.to_string(),
                "asset_bought": settle.asset_bought,
                "amount_bought": settle.amount_bought.to_string(),
                "trade_id": settle.trade_id.0,
            }),
        )
        .await
    }

    async fn submit_withdrawal(&self, withdraw: &WithdrawIntent) -> Result<String, SubmitError> {
        self.submit(
            "withdraw",
            json!({
                "user": withdraw.user.to_string(),
                "asset": withdraw.asset,
                "amount": withdraw.amount.to_string(),
            }),
        )
        .await
    }
}
