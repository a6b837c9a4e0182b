//! Chain client interfaces consumed by the engine
//!
//! - [`UtxoChainClient`]: script-only chain, implemented over Esplora REST
//! - [`AccountChainClient`]: escrow-contract chain, implemented over EVM JSON-RPC
//!
//! Both have in-process simulated implementations in [`simulated`] used by
//! tests and by the binary's dry-run mode.

pub mod esplora;
pub mod evm;
pub mod failover;
pub mod simulated;

use alloy::primitives::Address as AccountAddress;
use async_trait::async_trait;
use bitcoin::{Address, Amount, OutPoint, Transaction, Txid};

use crate::error::ChainError;
use crate::types::{HashLock, OrderId, Secret, Side};

// ============================================================================
// UTXO chain
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub value: Amount,
    pub confirmations: u32,
}

/// A transaction touching a watched address
#[derive(Debug, Clone)]
pub struct ChainTx {
    pub txid: Txid,
    pub tx: Transaction,
    /// None while in the mempool
    pub block_height: Option<u32>,
}

impl ChainTx {
    pub fn confirmations(&self, tip: u32) -> u32 {
        match self.block_height {
            Some(h) if tip >= h => tip - h + 1,
            _ => 0,
        }
    }
}

#[async_trait]
pub trait UtxoChainClient: Send + Sync {
    async fn get_spendable_outputs(&self, address: &Address) -> Result<Vec<Utxo>, ChainError>;

    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, ChainError>;

    /// Confirmed and mempool transactions paying to or spending from `address`
    async fn get_tx_history(&self, address: &Address) -> Result<Vec<ChainTx>, ChainError>;

    async fn get_height(&self) -> Result<u32, ChainError>;

    /// Median time past of the tip, the clock CLTV timestamps are checked against
    async fn get_median_time(&self) -> Result<u32, ChainError>;

    /// Fee rate in sat/vB for confirmation within `target_blocks`
    async fn get_fee_estimate(&self, target_blocks: u16) -> Result<u64, ChainError>;
}

// ============================================================================
// Account chain
// ============================================================================

/// Immutable escrow parameters. The escrow address is a function of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscrowParams {
    pub side: Side,
    pub order_hash: OrderId,
    pub hashlock: HashLock,
    /// Party refunded on cancel
    pub maker: AccountAddress,
    /// Party paid on withdraw
    pub taker: AccountAddress,
    pub token: AccountAddress,
    pub amount: u128,
    pub safety_deposit: u128,
    pub cancellation_at: u64,
    pub deployed_at: u64,
    /// Maker authorization, required for source escrows
    pub maker_signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscrowDeployment {
    pub tx_hash: String,
    pub escrow: AccountAddress,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EscrowStatus {
    pub funded: bool,
    pub withdrawn: bool,
    pub cancelled: bool,
    /// Secret presented to a successful withdraw
    pub revealed_secret: Option<Secret>,
    pub confirmations: u32,
}

#[async_trait]
pub trait AccountChainClient: Send + Sync {
    /// Address the factory deploys the escrow for `params` to
    async fn escrow_address(&self, params: &EscrowParams) -> Result<AccountAddress, ChainError>;

    async fn deploy_escrow(&self, params: &EscrowParams) -> Result<EscrowDeployment, ChainError>;

    async fn withdraw_escrow(
        &self,
        escrow: AccountAddress,
        secret: &Secret,
    ) -> Result<String, ChainError>;

    async fn cancel_escrow(&self, escrow: AccountAddress) -> Result<String, ChainError>;

    /// `NotFound` when nothing is deployed at `escrow`
    async fn get_escrow_status(&self, escrow: AccountAddress) -> Result<EscrowStatus, ChainError>;
}
