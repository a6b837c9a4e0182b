use eyre::{eyre, Result, WrapErr};
use std::env;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use bitcoin::Network;

use crate::chains::failover::{parse_endpoint_urls, validate_endpoint_url};
use crate::engine::EngineConfig;
use crate::htlc::{AddressScheme, RefundAuth};
use crate::policy::AmountLimits;
use crate::recovery::RetryConfig;
use crate::watcher::WatcherConfig;

/// Main configuration for the resolver
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub chain_mode: ChainMode,
    pub utxo: UtxoConfig,
    pub evm: EvmConfig,
    pub engine: EngineSettings,
    pub api: ApiConfig,
}

/// Which chain clients the binary talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainMode {
    /// Esplora and EVM JSON-RPC endpoints
    Live,
    /// In-process simulated chains (dry runs)
    Simulated,
}

impl FromStr for ChainMode {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "live" => Ok(ChainMode::Live),
            "simulated" | "sim" => Ok(ChainMode::Simulated),
            other => Err(eyre!("CHAIN_MODE must be 'live' or 'simulated', got '{}'", other)),
        }
    }
}

/// Database configuration. No URL means the in-memory store.
#[derive(Clone, Default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &self.url.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// UTXO chain configuration
#[derive(Clone)]
pub struct UtxoConfig {
    pub network: Network,
    /// Esplora base URLs, primary first
    pub esplora_urls: Vec<String>,
    /// Resolver wallet key (WIF)
    pub private_key: Option<String>,
    pub confirmations: u32,
    pub fee_target_blocks: u16,
    pub refund_auth: RefundAuth,
    pub address_scheme: AddressScheme,
}

/// Custom Debug that redacts private_key to prevent accidental log leakage.
impl fmt::Debug for UtxoConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UtxoConfig")
            .field("network", &self.network)
            .field("esplora_urls", &self.esplora_urls)
            .field("private_key", &"<redacted>")
            .field("confirmations", &self.confirmations)
            .field("fee_target_blocks", &self.fee_target_blocks)
            .field("refund_auth", &self.refund_auth)
            .field("address_scheme", &self.address_scheme)
            .finish()
    }
}

/// EVM escrow chain configuration
#[derive(Clone)]
pub struct EvmConfig {
    /// JSON-RPC URLs, primary first
    pub rpc_urls: Vec<String>,
    pub chain_id: u64,
    pub escrow_factory: String,
    /// keccak256 of the escrow proxy init code, for CREATE2 address derivation
    pub escrow_init_code_hash: String,
    pub private_key: Option<String>,
    pub confirmations: u32,
}

/// Custom Debug that redacts private_key to prevent accidental log leakage.
impl fmt::Debug for EvmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvmConfig")
            .field("rpc_urls", &self.rpc_urls)
            .field("chain_id", &self.chain_id)
            .field("escrow_factory", &self.escrow_factory)
            .field("escrow_init_code_hash", &self.escrow_init_code_hash)
            .field("private_key", &"<redacted>")
            .field("confirmations", &self.confirmations)
            .finish()
    }
}

/// Watcher, retry and policy settings
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub poll_interval_ms: u64,
    pub watch_max_retries: u32,
    pub retry_delay_ms: u64,
    pub stuck_tx_secs: u64,
    pub fee_bump_percent: u32,
    pub failover_threshold: u32,
    pub auto_refund: bool,
    pub min_fill_amount: u128,
    pub max_order_amount: Option<u128>,
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_address: String,
    pub port: u16,
}

/// Default functions
fn default_network() -> Network {
    Network::Regtest
}

fn default_confirmations() -> u32 {
    1
}

fn default_fee_target_blocks() -> u16 {
    6
}

fn default_poll_interval() -> u64 {
    5000
}

fn default_watch_max_retries() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    2000
}

fn default_stuck_tx_secs() -> u64 {
    1800
}

fn default_fee_bump_percent() -> u32 {
    20
}

fn default_failover_threshold() -> u32 {
    3
}

fn default_api_port() -> u16 {
    9090
}

fn parse_var<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: fmt::Display,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| eyre!("{} is invalid: {}", name, e)),
        _ => Ok(None),
    }
}

fn optional_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env")
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Self> {
        let database = DatabaseConfig {
            url: optional_var("DATABASE_URL"),
        };

        let chain_mode = parse_var("CHAIN_MODE")?.unwrap_or(ChainMode::Live);

        let utxo = UtxoConfig {
            network: parse_var::<Network>("BTC_NETWORK")?.unwrap_or_else(default_network),
            esplora_urls: optional_var("ESPLORA_URL")
                .map(|raw| parse_endpoint_urls(&raw))
                .unwrap_or_default(),
            private_key: optional_var("BTC_PRIVATE_KEY"),
            confirmations: parse_var("UTXO_CONFIRMATIONS")?.unwrap_or_else(default_confirmations),
            fee_target_blocks: parse_var("FEE_TARGET_BLOCKS")?
                .unwrap_or_else(default_fee_target_blocks),
            refund_auth: parse_var("HTLC_REFUND_AUTH")?.unwrap_or_default(),
            address_scheme: parse_var("HTLC_ADDRESS_SCHEME")?.unwrap_or_default(),
        };

        let evm = EvmConfig {
            rpc_urls: optional_var("EVM_RPC_URL")
                .map(|raw| parse_endpoint_urls(&raw))
                .unwrap_or_default(),
            chain_id: parse_var("EVM_CHAIN_ID")?.unwrap_or(31337),
            escrow_factory: optional_var("EVM_ESCROW_FACTORY").unwrap_or_default(),
            escrow_init_code_hash: optional_var("EVM_ESCROW_INIT_CODE_HASH").unwrap_or_default(),
            private_key: optional_var("EVM_PRIVATE_KEY"),
            confirmations: parse_var("EVM_CONFIRMATIONS")?.unwrap_or_else(default_confirmations),
        };

        let engine = EngineSettings {
            poll_interval_ms: parse_var("POLL_INTERVAL_MS")?.unwrap_or_else(default_poll_interval),
            watch_max_retries: parse_var("WATCH_MAX_RETRIES")?
                .unwrap_or_else(default_watch_max_retries),
            retry_delay_ms: parse_var("RETRY_DELAY_MS")?.unwrap_or_else(default_retry_delay),
            stuck_tx_secs: parse_var("STUCK_TX_SECS")?.unwrap_or_else(default_stuck_tx_secs),
            fee_bump_percent: parse_var("FEE_BUMP_PERCENT")?
                .unwrap_or_else(default_fee_bump_percent),
            failover_threshold: parse_var("FAILOVER_THRESHOLD")?
                .unwrap_or_else(default_failover_threshold),
            auto_refund: parse_var("AUTO_REFUND")?.unwrap_or(true),
            min_fill_amount: parse_var("MIN_FILL_AMOUNT")?.unwrap_or(0),
            max_order_amount: parse_var("MAX_ORDER_AMOUNT")?,
        };

        let api = ApiConfig {
            bind_address: optional_var("API_BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_var("API_PORT")?.unwrap_or_else(default_api_port),
        };

        let config = Config {
            database,
            chain_mode,
            utxo,
            evm,
            engine,
            api,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.chain_mode == ChainMode::Live {
            if self.utxo.esplora_urls.is_empty() {
                return Err(eyre!("ESPLORA_URL is required in live mode"));
            }
            for url in &self.utxo.esplora_urls {
                validate_endpoint_url(url).wrap_err("ESPLORA_URL")?;
            }
            if self.evm.rpc_urls.is_empty() {
                return Err(eyre!("EVM_RPC_URL is required in live mode"));
            }
            for url in &self.evm.rpc_urls {
                validate_endpoint_url(url).wrap_err("EVM_RPC_URL")?;
            }
            if self.utxo.private_key.is_none() {
                return Err(eyre!("BTC_PRIVATE_KEY is required in live mode"));
            }

            let key = self.evm.private_key.as_deref().unwrap_or_default();
            if key.len() != 66 || !key.starts_with("0x") {
                return Err(eyre!("EVM_PRIVATE_KEY must be 66 chars (0x + 64 hex chars)"));
            }
        }

        // Escrow addresses are derived locally in both modes
        if self.evm.escrow_factory.len() != 42 || !self.evm.escrow_factory.starts_with("0x") {
            return Err(eyre!(
                "EVM_ESCROW_FACTORY must be a valid hex address (42 chars with 0x prefix)"
            ));
        }
        if self.evm.escrow_init_code_hash.len() != 66
            || !self.evm.escrow_init_code_hash.starts_with("0x")
        {
            return Err(eyre!(
                "EVM_ESCROW_INIT_CODE_HASH must be 66 chars (0x + 64 hex chars)"
            ));
        }

        if self.utxo.confirmations == 0 || self.evm.confirmations == 0 {
            return Err(eyre!("confirmation thresholds must be at least 1"));
        }
        if self.utxo.fee_target_blocks == 0 {
            return Err(eyre!("FEE_TARGET_BLOCKS must be at least 1"));
        }
        if self.engine.poll_interval_ms == 0 {
            return Err(eyre!("POLL_INTERVAL_MS must be positive"));
        }
        if self.engine.fee_bump_percent == 0 || self.engine.fee_bump_percent > 100 {
            return Err(eyre!("FEE_BUMP_PERCENT must be between 1 and 100"));
        }
        if self.engine.failover_threshold == 0 {
            return Err(eyre!("FAILOVER_THRESHOLD must be at least 1"));
        }
        if let Some(max) = self.engine.max_order_amount {
            if max < self.engine.min_fill_amount {
                return Err(eyre!(
                    "MAX_ORDER_AMOUNT ({}) is below MIN_FILL_AMOUNT ({})",
                    max,
                    self.engine.min_fill_amount
                ));
            }
        }

        Ok(())
    }

    pub fn retry_config(&self) -> RetryConfig {
        let initial_backoff = Duration::from_millis(self.engine.retry_delay_ms);
        RetryConfig {
            max_retries: self.engine.watch_max_retries,
            initial_backoff,
            max_backoff: initial_backoff.max(Duration::from_secs(60)),
            fee_bump_percent: self.engine.fee_bump_percent,
            ..Default::default()
        }
    }

    pub fn watcher_config(&self) -> WatcherConfig {
        WatcherConfig {
            poll_interval: Duration::from_millis(self.engine.poll_interval_ms),
            utxo_confirmations: self.utxo.confirmations,
            account_confirmations: self.evm.confirmations,
            stuck_after_secs: self.engine.stuck_tx_secs,
            retry: self.retry_config(),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            auto_refund: self.engine.auto_refund,
        }
    }

    pub fn amount_limits(&self) -> AmountLimits {
        AmountLimits {
            min_fill: self.engine.min_fill_amount,
            max_order: self.engine.max_order_amount,
        }
    }
}
