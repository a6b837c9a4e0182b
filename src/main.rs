//! HTLC Atomic-Swap Resolver
//!
//! Runs the swap engine behind an HTTP control surface:
//! 1. Loads configuration from the environment (optionally `.env`)
//! 2. Connects the store (Postgres, or in-memory without `DATABASE_URL`)
//! 3. Builds chain clients (live endpoints or in-process simulations)
//! 4. Resumes watchers for every order still active in the store
//! 5. Serves the API until SIGINT/SIGTERM

use std::str::FromStr;
use std::sync::Arc;

use alloy::primitives::{Address as AccountAddress, B256};
use bitcoin::secp256k1::{rand::rngs::OsRng, SecretKey};
use bitcoin::Amount;
use eyre::{eyre, WrapErr};
use tracing::{info, warn};

use resolver::api::{self, AppState};
use resolver::chains::esplora::EsploraClient;
use resolver::chains::evm::EvmEscrowClient;
use resolver::chains::failover::EndpointSet;
use resolver::chains::simulated::{SimulatedAccountChain, SimulatedUtxoChain};
use resolver::chains::{AccountChainClient, UtxoChainClient};
use resolver::config::{ChainMode, Config};
use resolver::coordinator::{AccountEscrows, EscrowCoordinator, UtxoEscrowSettings, UtxoEscrows};
use resolver::metrics::Metrics;
use resolver::signer::{LocalKeySigner, UtxoSigner};
use resolver::store::{MemoryStore, PgStore, SwapStore};
use resolver::SwapEngine;

/// Wallet balance given to the resolver key in simulated mode
const SIMULATED_WALLET_SATS: u64 = 10 * 100_000_000;

fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    info!("Starting swap resolver");

    let config = Config::load()?;
    info!(
        chain_mode = ?config.chain_mode,
        network = %config.utxo.network,
        refund_auth = %config.utxo.refund_auth,
        evm_chain_id = config.evm.chain_id,
        "Configuration loaded"
    );

    let store: Arc<dyn SwapStore> = match &config.database.url {
        Some(url) => {
            let store = PgStore::connect(url).await?;
            info!("Connected to database");
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL not set, using in-memory store; state is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    let mut signer = LocalKeySigner::new(config.utxo.network);
    let resolver_key = match &config.utxo.private_key {
        Some(wif) => signer.add_wif(wif).wrap_err("Invalid BTC_PRIVATE_KEY")?,
        None => signer.add_key(SecretKey::new(&mut OsRng)),
    };
    let wallet = signer.wallet_address(&resolver_key)?;
    info!(pubkey = %resolver_key, wallet = %wallet, "UTXO signer ready");
    let signer: Arc<dyn UtxoSigner> = Arc::new(signer);

    let mut endpoints = Vec::new();
    let (utxo_client, account_client): (Arc<dyn UtxoChainClient>, Arc<dyn AccountChainClient>) =
        match config.chain_mode {
            ChainMode::Live => {
                let esplora = Arc::new(EndpointSet::new(
                    "esplora",
                    config.utxo.esplora_urls.clone(),
                    config.engine.failover_threshold,
                )?);
                let rpc = Arc::new(EndpointSet::new(
                    "evm",
                    config.evm.rpc_urls.clone(),
                    config.engine.failover_threshold,
                )?);
                endpoints.push(esplora.clone());
                endpoints.push(rpc.clone());

                let private_key = config
                    .evm
                    .private_key
                    .as_deref()
                    .ok_or_else(|| eyre!("EVM_PRIVATE_KEY is required in live mode"))?;
                let utxo = EsploraClient::new(esplora).map_err(|e| eyre!("{}", e))?;
                let account = EvmEscrowClient::new(rpc, &config.evm.escrow_factory, private_key)?;
                (Arc::new(utxo), Arc::new(account))
            }
            ChainMode::Simulated => {
                let factory = AccountAddress::from_str(&config.evm.escrow_factory)
                    .wrap_err("Invalid EVM_ESCROW_FACTORY")?;
                let init_code_hash = B256::from_str(&config.evm.escrow_init_code_hash)
                    .wrap_err("Invalid EVM_ESCROW_INIT_CODE_HASH")?;
                let utxo = SimulatedUtxoChain::new();
                utxo.fund_address(&wallet, SIMULATED_WALLET_SATS);
                info!(
                    balance = %Amount::from_sat(SIMULATED_WALLET_SATS),
                    "Simulated chains ready"
                );
                (
                    Arc::new(utxo),
                    Arc::new(SimulatedAccountChain::new(factory, init_code_hash)),
                )
            }
        };

    let settings = UtxoEscrowSettings {
        network: config.utxo.network,
        refund_auth: config.utxo.refund_auth,
        address_scheme: config.utxo.address_scheme,
        fee_target_blocks: config.utxo.fee_target_blocks,
    };
    let coordinator = Arc::new(EscrowCoordinator::new(
        UtxoEscrows::new(utxo_client, signer, settings),
        AccountEscrows::new(account_client),
        Arc::new(config.amount_limits()),
    ));

    let metrics = Arc::new(Metrics::new());
    let engine = SwapEngine::new(
        store.clone(),
        coordinator,
        metrics,
        config.watcher_config(),
        config.engine_config(),
    );

    let resumed = engine.resume().await?;
    info!(resumed, "Engine ready");

    let state = AppState {
        engine: engine.clone(),
        store,
        endpoints,
    };

    let result = api::start_server(
        &config.api.bind_address,
        config.api.port,
        state,
        wait_for_shutdown_signal(),
    )
    .await;

    engine.stop_watchers();
    if let Err(e) = &result {
        tracing::error!(error = %e, "API server error");
    }

    info!("Swap resolver stopped");
    result
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,swap_resolver=debug,resolver=debug"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
    }
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }
}
