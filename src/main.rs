use pongbot::app::{App, AppContext, AppSettings};
use pongbot::config::{Config, LoggingConfig};
use pongbot::ledger::Ledger;
use pongbot::onchain::abi;
use pongbot::onchain::{AlloyChainClient, AlloyPushConnector, ChainClient};
use pongbot::store::StateStore;

use alloy::signers::local::PrivateKeySigner;
use anyhow::Context;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const CONFIG_PATH: &str = "pongbot.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let config = if Path::new(CONFIG_PATH).exists() {
        Config::load(Path::new(CONFIG_PATH))?
    } else {
        Config::from_env()?
    };

    init_logging(&config.logging)?;
    info!("pongbot v{} starting", env!("CARGO_PKG_VERSION"));

    if let Err(e) = config.validate() {
        error!(error = %e, "invalid configuration");
        return Err(e.into());
    }

    for (signature, ok) in abi::verify_topic_hashes() {
        if !ok {
            anyhow::bail!("precomputed hash for {signature} does not match its keccak256");
        }
    }

    // --- Chain ---
    let signer: PrivateKeySigner = config
        .chain
        .private_key
        .parse()
        .context("PRIVATE_KEY is not a valid secp256k1 key")?;
    let contract = config.contract_address()?;
    let chain = AlloyChainClient::connect(&config.chain.http_url, signer, contract)
        .await
        .context("failed to build HTTP provider")?;

    let pinger = chain
        .pinger()
        .await
        .context("failed to connect to contract")?;
    info!(contract = %contract, pinger = %pinger, wallet = %chain.wallet_address(), "contract reachable");

    // --- State ---
    let store = StateStore::open(&config.store.data_dir)?;
    let ledger = Ledger::load(store, config.chain.starting_block)?.into_shared();

    // --- Run ---
    let ctx = AppContext::new(Arc::new(chain), config.rate_limit(), ledger);
    let connector = Arc::new(AlloyPushConnector::new(config.chain.ws_url.clone(), contract));
    let app = App::new(ctx, connector, AppSettings::from(&config));

    tokio::select! {
        _ = app.run() => {}
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for shutdown signal")?;
            info!("shutdown signal received, exiting");
        }
    }
    Ok(())
}

/// Console output (text or JSON), plus a per-run log file when
/// `logging.dir` is set.
fn init_logging(logging: &LoggingConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let file_layer = match &logging.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log dir {}", dir.display()))?;
            let name = format!(
                "pongbot_{}.log",
                chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
            );
            let file = std::fs::File::create(dir.join(name))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false),
            )
        }
        None => None,
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer);

    if logging.json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
    Ok(())
}
