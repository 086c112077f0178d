//! Configuration loader for the duskpool service.
//!
//! This crate centralizes runtime settings for all agents. It provides sane
//! defaults and supports overrides via an optional `config.toml` file and
//! environment variables prefixed with `DUSKPOOL_` (nested fields separated
//! using `__`). For example, `DUSKPOOL_API__LISTEN_ADDR=0.0.0.0:8080`.
//!
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
/// Top-level settings consumed by the service binary.
pub struct Settings {
    pub chain: Chain,
    pub api: Api,
    pub outgoing: Outgoing,
    pub ingestor: Ingestor,
}

#[derive(Debug, Deserialize, Clone)]
/// Chain RPC endpoint, contract and signing authority.
pub struct Chain {
    pub rpc_url: String,
    pub orderbook_contract_id: String,
    /// Hex-encoded ed25519 seed for the admin keypair. When absent the
    /// service runs with the mock submitter and never reaches the chain.
    pub admin_secret_key: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
/// HTTP listener and request authentication window.
pub struct Api {
    pub listen_addr: String,
    pub timestamp_skew_window_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
/// Retry budget for outgoing chain submissions.
pub struct Outgoing {
    pub retry_max: u32,
    pub backoff_initial_ms: u64,
    pub backoff_cap_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
/// Deposit event polling cadence.
pub struct Ingestor {
    pub poll_interval_ms: u64,
    pub start_ledger: u64,
    pub batch_limit: u32,
}

impl Settings {
    /// Load settings from defaults, `config.toml` (optional), and environment.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .set_default("chain.rpc_url", "http://127.0.0.1:8899")?
            .set_default("chain.orderbook_contract_id", "")?
            .set_default("api.listen_addr", "127.0.0.1:9090")?
            .set_default("api.timestamp_skew_window_seconds", 300)?
            .set_default("outgoing.retry_max", 5)?
            .set_default("outgoing.backoff_initial_ms", 250)?
            .set_default("outgoing.backoff_cap_ms", 10_000)?
            .set_default("ingestor.poll_interval_ms", 2_000)?
            .set_default("ingestor.start_ledger", 0)?
            .set_default("ingestor.batch_limit", 100)?
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("DUSKPOOL")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        config.try_deserialize()
    }
}
