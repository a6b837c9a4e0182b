//! Shared harness for the integration tests
//!
//! Builds an engine over the in-process simulated chains. The signer holds
//! both the resolver key and the maker key, and both wallets start funded, so
//! either chain can play the source leg.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address as AccountAddress, B256};
use bitcoin::secp256k1::SecretKey;
use bitcoin::{Network, PublicKey};

use resolver::chains::simulated::{SimulatedAccountChain, SimulatedUtxoChain};
use resolver::chains::AccountChainClient;
use resolver::coordinator::{AccountEscrows, EscrowCoordinator, UtxoEscrowSettings, UtxoEscrows};
use resolver::htlc::{AddressScheme, RefundAuth};
use resolver::merkle::MerkleLeafSet;
use resolver::metrics::Metrics;
use resolver::policy::AcceptAll;
use resolver::recovery::RetryConfig;
use resolver::signer::{LocalKeySigner, UtxoSigner};
use resolver::store::{MemoryStore, SwapStore};
use resolver::types::{ChainKind, FillMode, LegTerms, OrderId, SwapRecord, SwapStatus};
use resolver::watcher::WatcherConfig;
use resolver::{EngineConfig, InitiateParams, SwapEngine};

pub const MAKER_EVM: &str = "0x00000000000000000000000000000000000000aa";
pub const RESOLVER_EVM: &str = "0x00000000000000000000000000000000000000bb";
pub const TOKEN: &str = "0x00000000000000000000000000000000000000cc";
pub const FACTORY: &str = "0x0000000000000000000000000000000000000f00";
pub const MAKER_SIGNATURE: &str = "0xdeadbeef";

/// Starting balance of each simulated wallet
pub const WALLET_SATS: u64 = 5 * 100_000_000;

pub struct Harness {
    pub engine: Arc<SwapEngine>,
    pub store: Arc<MemoryStore>,
    pub utxo: Arc<SimulatedUtxoChain>,
    pub account: Arc<SimulatedAccountChain>,
    pub resolver_key: PublicKey,
    pub maker_key: PublicKey,
}

/// Watcher settings that keep tests fast
pub fn fast_watcher_config() -> WatcherConfig {
    WatcherConfig {
        poll_interval: Duration::from_millis(50),
        utxo_confirmations: 1,
        account_confirmations: 1,
        stuck_after_secs: 3_600,
        retry: RetryConfig {
            max_retries: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            ..RetryConfig::default()
        },
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::build(fast_watcher_config(), |chain| chain as Arc<dyn AccountChainClient>)
    }

    pub fn with_watcher_config(config: WatcherConfig) -> Self {
        Self::build(config, |chain| chain as Arc<dyn AccountChainClient>)
    }

    /// UTXO escrows whose refunds are presigned and relayable by anyone
    pub fn with_refund_auth(refund_auth: RefundAuth) -> Self {
        Self::build_with(fast_watcher_config(), refund_auth, |chain| {
            chain as Arc<dyn AccountChainClient>
        })
    }

    /// `wrap` may put a decorator in front of the account chain the engine talks to
    pub fn build<F>(watcher_config: WatcherConfig, wrap: F) -> Self
    where
        F: FnOnce(Arc<SimulatedAccountChain>) -> Arc<dyn AccountChainClient>,
    {
        Self::build_with(watcher_config, RefundAuth::Sender, wrap)
    }

    pub fn build_with<F>(watcher_config: WatcherConfig, refund_auth: RefundAuth, wrap: F) -> Self
    where
        F: FnOnce(Arc<SimulatedAccountChain>) -> Arc<dyn AccountChainClient>,
    {
        let mut signer = LocalKeySigner::new(Network::Regtest);
        let resolver_key = signer.add_key(SecretKey::from_slice(&[0x11; 32]).unwrap());
        let maker_key = signer.add_key(SecretKey::from_slice(&[0x22; 32]).unwrap());

        let utxo = Arc::new(SimulatedUtxoChain::new());
        for key in [&resolver_key, &maker_key] {
            utxo.fund_address(&signer.wallet_address(key).unwrap(), WALLET_SATS);
        }
        let account = Arc::new(SimulatedAccountChain::new(
            FACTORY.parse::<AccountAddress>().unwrap(),
            B256::repeat_byte(0x11),
        ));

        let settings = UtxoEscrowSettings {
            network: Network::Regtest,
            refund_auth,
            address_scheme: AddressScheme::P2wsh,
            fee_target_blocks: 6,
        };
        let signer: Arc<dyn UtxoSigner> = Arc::new(signer);
        let coordinator = Arc::new(EscrowCoordinator::new(
            UtxoEscrows::new(utxo.clone(), signer, settings),
            AccountEscrows::new(wrap(account.clone())),
            Arc::new(AcceptAll),
        ));

        let store = Arc::new(MemoryStore::new());
        let engine = SwapEngine::new(
            store.clone() as Arc<dyn SwapStore>,
            coordinator,
            Arc::new(Metrics::new()),
            watcher_config,
            EngineConfig::default(),
        );

        Self {
            engine,
            store,
            utxo,
            account,
            resolver_key,
            maker_key,
        }
    }

    /// Maker sells a token on the account chain for BTC
    pub fn account_to_utxo(&self, token_amount: u128, sats: u64) -> InitiateParams {
        InitiateParams {
            src: LegTerms {
                chain: ChainKind::Account,
                asset: TOKEN.to_string(),
                amount: token_amount,
                sender: MAKER_EVM.to_string(),
                recipient: RESOLVER_EVM.to_string(),
            },
            dst: LegTerms {
                chain: ChainKind::Utxo,
                asset: "btc".to_string(),
                amount: sats as u128,
                sender: self.resolver_key.to_string(),
                recipient: self.maker_key.to_string(),
            },
            allow_multiple_fills: false,
            parts: 0,
            src_timelock_secs: 600,
            dst_timelock_secs: 300,
            safety_deposit: 0,
            maker_signature: MAKER_SIGNATURE.to_string(),
            secret: None,
            hashlock: None,
        }
    }

    /// Maker sells BTC for the account chain's native asset
    pub fn utxo_to_account(&self, sats: u64, wei: u128) -> InitiateParams {
        InitiateParams {
            src: LegTerms {
                chain: ChainKind::Utxo,
                asset: "btc".to_string(),
                amount: sats as u128,
                sender: self.maker_key.to_string(),
                recipient: self.resolver_key.to_string(),
            },
            dst: LegTerms {
                chain: ChainKind::Account,
                asset: "eth".to_string(),
                amount: wei,
                sender: RESOLVER_EVM.to_string(),
                recipient: MAKER_EVM.to_string(),
            },
            allow_multiple_fills: false,
            parts: 0,
            src_timelock_secs: 600,
            dst_timelock_secs: 300,
            safety_deposit: 0,
            maker_signature: MAKER_SIGNATURE.to_string(),
            secret: None,
            hashlock: None,
        }
    }

    pub async fn record(&self, order_id: &OrderId) -> SwapRecord {
        self.engine.get_record(order_id).await.unwrap()
    }

    pub async fn status(&self, order_id: &OrderId) -> SwapStatus {
        self.engine.get_status(order_id).await.unwrap().status
    }

    /// Poll the stored status until it equals `expected`
    pub async fn wait_for_status(&self, order_id: &OrderId, expected: SwapStatus, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.status(order_id).await;
            if status == expected {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "order {} stuck in {} waiting for {}",
                    order_id, status, expected
                );
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

/// Committed leaf set of a multi-fill order
pub fn leaves_of(record: &SwapRecord) -> MerkleLeafSet {
    match &record.order.fill_mode {
        FillMode::Multiple { leaves } => leaves.clone(),
        FillMode::Single => panic!("order {} is single-fill", record.order.id),
    }
}
