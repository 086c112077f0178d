//! Service binary: wires the executor, outgoing processor, deposit ingestor
//! and HTTP API together around the three channels they share.

use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chain_ingestor::rpc::RpcEventSource;
use chain_ingestor::{DepositIngestor, EventCursor};
use common_types::health::Heartbeats;
use common_types::MessageStore;
use configuration::Settings;
use execution_plane::api::{self, ApiContext};
use execution_plane::Executor;
use settlement_plane::rpc::RpcSubmitter;
use settlement_plane::{ChainSubmitter, MockSubmitter, OutgoingProcessor, RetryPolicy};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_writer(std::io::stdout)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let settings = Settings::load()?;
    info!("--- duskpool starting ---");

    let store = Arc::new(MessageStore::new());
    let heartbeats = Arc::new(Heartbeats::default());
    let (incoming_tx, incoming_rx) = mpsc::channel(1024);
    let (outgoing_tx, outgoing_rx) = mpsc::channel(1024);
    let (compensation_tx, compensation_rx) = mpsc::channel(64);

    let executor = Executor::new(
        incoming_rx,
        compensation_rx,
        outgoing_tx,
        store.clone(),
        heartbeats.clone(),
    );

    let submitter: Box<dyn ChainSubmitter> = match settings.chain.admin_secret_key.as_deref() {
        Some(secret) => {
            let rpc = RpcSubmitter::new(
                settings.chain.rpc_url.clone(),
                settings.chain.orderbook_contract_id.clone(),
                secret,
            )?;
            info!(admin = %rpc.admin_public_key(), "using chain rpc submitter");
            Box::new(rpc)
        }
        None => {
            warn!("no admin secret key configured, using mock submitter");
            Box::new(MockSubmitter::new())
        }
    };
    let processor = OutgoingProcessor::new(
        outgoing_rx,
        compensation_tx,
        submitter,
        store.clone(),
        heartbeats.clone(),
        RetryPolicy {
            max_retries: settings.outgoing.retry_max,
            backoff_initial: Duration::from_millis(settings.outgoing.backoff_initial_ms),
            backoff_cap: Duration::from_millis(settings.outgoing.backoff_cap_ms),
        },
    );

    let source = RpcEventSource::new(
        settings.chain.rpc_url.clone(),
        settings.chain.orderbook_contract_id.clone(),
    )?;
    let ingestor = DepositIngestor::new(
        Box::new(source),
        incoming_tx.clone(),
        store.clone(),
        heartbeats.clone(),
        EventCursor::starting_at(settings.ingestor.start_ledger),
        Duration::from_millis(settings.ingestor.poll_interval_ms),
        settings.ingestor.batch_limit as usize,
    );

    let mut executor_task = tokio::spawn(executor.run());
    let processor_task = tokio::spawn(processor.run());
    let ingestor_task = tokio::spawn(ingestor.run());

    let ctx = ApiContext {
        incoming: incoming_tx,
        store,
        heartbeats,
        skew_window_secs: settings.api.timestamp_skew_window_seconds,
    };
    let listen_addr: SocketAddr = settings.api.listen_addr.parse()?;
    let api_task = tokio::spawn(warp::serve(api::routes(ctx)).run(listen_addr));
    info!(%listen_addr, "duskpool started");

    tokio::select! {
        result = &mut executor_task => {
            match result {
                Ok(Ok(())) => info!("executor finished"),
                Ok(Err(executor_error)) => {
                    // A corrupt ledger must never keep trading; exit so the
                    // supervisor restarts from a clean snapshot.
                    error!(error = %executor_error, "executor halted on internal error");
                    std::process::exit(1);
                }
                Err(join_error) => {
                    error!(error = %join_error, "executor task panicked");
                    std::process::exit(1);
                }
            }
        }
        _ = signal::ctrl_c() => {
            info!("ctrl-c received, shutting down");
        }
    }

    api_task.abort();
    ingestor_task.abort();
    processor_task.abort();
    executor_task.abort();
    Ok(())
}
