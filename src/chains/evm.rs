//! Account chain client for HTLC escrow contracts
//!
//! Escrows are clones deployed by a factory with CREATE2, salted by the hash
//! of their immutables. Anyone holding the immutables can recompute the
//! address without asking the factory, which is what lets the watcher follow
//! escrows it did not deploy.
//!
//! # Transaction Building
//!
//! Uses Alloy's `ProviderBuilder::with_recommended_fillers()` to populate
//! nonce, gas limit and EIP-1559 fee fields.

use std::sync::Arc;

use alloy::network::EthereumWallet;
use alloy::primitives::{keccak256, Address, Bytes, FixedBytes, B256, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use alloy::sol_types::SolValue;
use async_trait::async_trait;
use eyre::{Result, WrapErr};
use std::str::FromStr;
use tracing::{debug, info};

use super::failover::EndpointSet;
use super::{AccountChainClient, EscrowDeployment, EscrowParams, EscrowStatus};
use crate::error::ChainError;
use crate::types::{Secret, Side};

sol! {
    /// Escrow immutables; the CREATE2 salt is keccak256 of their ABI encoding
    struct Immutables {
        bytes32 orderHash;
        bytes32 hashlock;
        address maker;
        address taker;
        address token;
        uint256 amount;
        uint256 safetyDeposit;
        uint64 cancellationAt;
        uint64 deployedAt;
    }

    #[sol(rpc)]
    contract EscrowFactory {
        /// Deploy a source escrow, pulling the maker's tokens with their signature
        function createSrcEscrow(Immutables calldata immutables, bytes calldata makerSignature) external payable returns (address escrow);

        /// Deploy a destination escrow funded by the caller
        function createDstEscrow(Immutables calldata immutables) external payable returns (address escrow);

        function addressOfEscrow(Immutables calldata immutables) external view returns (address);
    }

    #[sol(rpc)]
    contract HtlcEscrow {
        /// Pays the taker if sha256(secret) matches the hashlock
        function withdraw(bytes32 secret) external;

        /// Refunds the maker after cancellationAt
        function cancel() external;

        function state() external view returns (
            bool funded,
            bool withdrawn,
            bool cancelled,
            bytes32 revealedSecret,
            uint256 fundedAtBlock
        );
    }
}

impl From<&EscrowParams> for Immutables {
    fn from(p: &EscrowParams) -> Self {
        Immutables {
            orderHash: FixedBytes::from(p.order_hash.0),
            hashlock: FixedBytes::from(p.hashlock.0),
            maker: p.maker,
            taker: p.taker,
            token: p.token,
            amount: U256::from(p.amount),
            safetyDeposit: U256::from(p.safety_deposit),
            cancellationAt: p.cancellation_at,
            deployedAt: p.deployed_at,
        }
    }
}

/// keccak256 of the ABI-encoded immutables
pub fn immutables_hash(params: &EscrowParams) -> B256 {
    keccak256(Immutables::from(params).abi_encode())
}

/// CREATE2 address of the escrow for `params`
pub fn escrow_address(factory: Address, init_code_hash: B256, params: &EscrowParams) -> Address {
    factory.create2(immutables_hash(params), init_code_hash)
}

pub fn parse_account_address(raw: &str) -> Result<Address, String> {
    Address::from_str(raw).map_err(|e| format!("invalid account address {}: {}", raw, e))
}

/// Escrow client over JSON-RPC
pub struct EvmEscrowClient {
    endpoints: Arc<EndpointSet>,
    factory: Address,
    signer: PrivateKeySigner,
}

impl EvmEscrowClient {
    pub fn new(endpoints: Arc<EndpointSet>, factory: &str, private_key: &str) -> Result<Self> {
        let factory = Address::from_str(factory).wrap_err("Invalid escrow factory address")?;
        let signer: PrivateKeySigner = private_key.parse().wrap_err("Invalid private key")?;

        info!(
            resolver_address = %signer.address(),
            factory = %factory,
            "EVM escrow client initialized"
        );

        Ok(Self {
            endpoints,
            factory,
            signer,
        })
    }

    /// The resolver's own account address
    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn endpoints(&self) -> &Arc<EndpointSet> {
        &self.endpoints
    }

    fn rpc_url(&self) -> Result<reqwest::Url, ChainError> {
        self.endpoints
            .current()
            .parse()
            .map_err(|e| ChainError::Rejected(format!("Invalid RPC URL: {}", e)))
    }

    /// Classify an RPC error, counting transport failures towards failover
    fn classify(&self, context: &str, e: impl std::fmt::Display) -> ChainError {
        let err = ChainError::classify(format!("{}: {}", context, e));
        match &err {
            ChainError::Transport(_) => {
                self.endpoints.record_failure();
            }
            _ => self.endpoints.record_success(),
        }
        err
    }
}

#[async_trait]
impl AccountChainClient for EvmEscrowClient {
    async fn escrow_address(&self, params: &EscrowParams) -> Result<Address, ChainError> {
        let provider = ProviderBuilder::new().on_http(self.rpc_url()?);
        let factory = EscrowFactory::new(self.factory, &provider);
        Ok(factory
            .addressOfEscrow(Immutables::from(params))
            .call()
            .await
            .map_err(|e| self.classify("Failed to compute escrow address", e))?
            ._0)
    }

    async fn deploy_escrow(&self, params: &EscrowParams) -> Result<EscrowDeployment, ChainError> {
        let wallet = EthereumWallet::from(self.signer.clone());
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(wallet)
            .on_http(self.rpc_url()?);

        let factory = EscrowFactory::new(self.factory, &provider);
        let immutables = Immutables::from(params);
        let escrow = self.escrow_address(params).await?;

        // Destination escrows are funded with the resolver's own value
        let call_value = match params.side {
            Side::Source => U256::from(params.safety_deposit),
            Side::Destination => U256::from(params.safety_deposit.saturating_add(
                if params.token == Address::ZERO {
                    params.amount
                } else {
                    0
                },
            )),
        };

        debug!(
            escrow = %escrow,
            side = %params.side,
            "Submitting escrow deployment"
        );

        let pending_tx = match params.side {
            Side::Source => factory
                .createSrcEscrow(immutables, Bytes::from(params.maker_signature.clone()))
                .value(call_value)
                .send()
                .await
                .map_err(|e| self.classify("Failed to send createSrcEscrow", e))?,
            Side::Destination => factory
                .createDstEscrow(immutables)
                .value(call_value)
                .send()
                .await
                .map_err(|e| self.classify("Failed to send createDstEscrow", e))?,
        };

        let tx_hash = *pending_tx.tx_hash();
        info!(tx_hash = %tx_hash, escrow = %escrow, "Escrow deployment sent");

        let receipt = pending_tx
            .get_receipt()
            .await
            .map_err(|e| self.classify("Failed to get receipt", e))?;

        if !receipt.status() {
            return Err(ChainError::Rejected(format!(
                "Escrow deployment {} reverted",
                tx_hash
            )));
        }
        self.endpoints.record_success();

        Ok(EscrowDeployment {
            tx_hash: format!("0x{:x}", tx_hash),
            escrow,
        })
    }

    async fn withdraw_escrow(&self, escrow: Address, secret: &Secret) -> Result<String, ChainError> {
        let wallet = EthereumWallet::from(self.signer.clone());
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(wallet)
            .on_http(self.rpc_url()?);

        let contract = HtlcEscrow::new(escrow, &provider);
        let pending_tx = contract
            .withdraw(FixedBytes::from(secret.0))
            .send()
            .await
            .map_err(|e| self.classify("Failed to send withdraw", e))?;

        let tx_hash = *pending_tx.tx_hash();
        let receipt = pending_tx
            .get_receipt()
            .await
            .map_err(|e| self.classify("Failed to get receipt", e))?;
        if !receipt.status() {
            return Err(ChainError::Rejected(format!("Withdraw {} reverted", tx_hash)));
        }

        info!(tx_hash = %tx_hash, escrow = %escrow, "Escrow withdrawn");
        Ok(format!("0x{:x}", tx_hash))
    }

    async fn cancel_escrow(&self, escrow: Address) -> Result<String, ChainError> {
        let wallet = EthereumWallet::from(self.signer.clone());
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(wallet)
            .on_http(self.rpc_url()?);

        let contract = HtlcEscrow::new(escrow, &provider);
        let pending_tx = contract
            .cancel()
            .send()
            .await
            .map_err(|e| self.classify("Failed to send cancel", e))?;

        let tx_hash = *pending_tx.tx_hash();
        let receipt = pending_tx
            .get_receipt()
            .await
            .map_err(|e| self.classify("Failed to get receipt", e))?;
        if !receipt.status() {
            return Err(ChainError::Rejected(format!("Cancel {} reverted", tx_hash)));
        }

        info!(tx_hash = %tx_hash, escrow = %escrow, "Escrow cancelled");
        Ok(format!("0x{:x}", tx_hash))
    }

    async fn get_escrow_status(&self, escrow: Address) -> Result<EscrowStatus, ChainError> {
        let provider = ProviderBuilder::new().on_http(self.rpc_url()?);
        let code = provider
            .get_code_at(escrow)
            .await
            .map_err(|e| self.classify("Failed to get escrow code", e))?;
        if code.is_empty() {
            self.endpoints.record_success();
            return Err(ChainError::NotFound(format!("no escrow deployed at {}", escrow)));
        }
        let contract = HtlcEscrow::new(escrow, &provider);

        let state = contract
            .state()
            .call()
            .await
            .map_err(|e| self.classify("Failed to query escrow state", e))?;
        let tip = provider
            .get_block_number()
            .await
            .map_err(|e| self.classify("Failed to get block number", e))?;
        self.endpoints.record_success();

        let funded_at = u64::try_from(state.fundedAtBlock).unwrap_or(u64::MAX);
        let confirmations = if state.funded && tip >= funded_at {
            u32::try_from(tip - funded_at + 1).unwrap_or(u32::MAX)
        } else {
            0
        };
        let revealed_secret = (state.revealedSecret != FixedBytes::ZERO)
            .then(|| Secret(state.revealedSecret.0));

        Ok(EscrowStatus {
            funded: state.funded,
            withdrawn: state.withdrawn,
            cancelled: state.cancelled,
            revealed_secret,
            confirmations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HashLock, OrderId};

    fn params() -> EscrowParams {
        EscrowParams {
            side: Side::Source,
            order_hash: OrderId([1u8; 32]),
            hashlock: HashLock([2u8; 32]),
            maker: Address::repeat_byte(0x11),
            taker: Address::repeat_byte(0x22),
            token: Address::repeat_byte(0x33),
            amount: 1_000,
            safety_deposit: 10,
            cancellation_at: 1_800_000_000,
            deployed_at: 1_799_990_000,
            maker_signature: vec![],
        }
    }

    #[test]
    fn test_escrow_address_is_deterministic() {
        let factory = Address::repeat_byte(0xfa);
        let init = B256::repeat_byte(0x01);
        assert_eq!(
            escrow_address(factory, init, &params()),
            escrow_address(factory, init, &params())
        );
    }

    #[test]
    fn test_escrow_address_depends_on_deployed_at() {
        let factory = Address::repeat_byte(0xfa);
        let init = B256::repeat_byte(0x01);
        let mut other = params();
        other.deployed_at += 1;
        assert_ne!(
            escrow_address(factory, init, &params()),
            escrow_address(factory, init, &other)
        );
    }

    #[test]
    fn test_signature_not_part_of_address() {
        let factory = Address::repeat_byte(0xfa);
        let init = B256::repeat_byte(0x01);
        let mut signed = params();
        signed.maker_signature = vec![1, 2, 3];
        assert_eq!(
            escrow_address(factory, init, &params()),
            escrow_address(factory, init, &signed)
        );
    }

    #[test]
    fn test_parse_account_address() {
        assert!(parse_account_address("0x0000000000000000000000000000000000000001").is_ok());
        assert!(parse_account_address("0x1234").is_err());
    }
}
