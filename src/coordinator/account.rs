//! Escrow contracts on the account chain
//!
//! The factory deploys one escrow clone per leg at a CREATE2 address derived
//! from the escrow immutables. Withdraw and cancel are permissionless calls
//! gated by the contract (hashlock and cancellation time), so the resolver
//! never needs the maker's key on this chain.

use std::sync::Arc;

use alloy::primitives::Address as AccountAddress;
use tracing::info;

use super::{broadcast_error, EscrowTerms, Observation, ObservedSpend, SpendBroadcast};
use crate::chains::evm::parse_account_address;
use crate::chains::{AccountChainClient, EscrowParams};
use crate::error::{ChainError, SwapError, SwapResult};
use crate::types::{now_secs, BroadcastAttempt, Escrow, Secret, SpendKind};

/// Asset names meaning the chain's native currency
const NATIVE_ASSETS: [&str; 3] = ["", "native", "eth"];

pub fn parse_address(raw: &str) -> SwapResult<AccountAddress> {
    parse_account_address(raw.trim()).map_err(SwapError::Validation)
}

pub fn parse_token(raw: &str) -> SwapResult<AccountAddress> {
    if NATIVE_ASSETS.contains(&raw.trim().to_lowercase().as_str()) {
        return Ok(AccountAddress::ZERO);
    }
    parse_address(raw)
}

pub struct AccountEscrows {
    client: Arc<dyn AccountChainClient>,
}

impl AccountEscrows {
    pub fn new(client: Arc<dyn AccountChainClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<dyn AccountChainClient> {
        &self.client
    }

    pub fn params_for(&self, terms: &EscrowTerms, deployed_at: u64) -> SwapResult<EscrowParams> {
        Ok(EscrowParams {
            side: terms.side,
            order_hash: terms.order_id,
            hashlock: terms.hashlock,
            maker: parse_address(&terms.sender)?,
            taker: parse_address(&terms.recipient)?,
            token: parse_token(&terms.asset)?,
            amount: terms.amount,
            safety_deposit: terms.safety_deposit,
            cancellation_at: terms.cancellation_at,
            deployed_at,
            maker_signature: terms.maker_signature.clone(),
        })
    }

    /// Deploy the escrow for `terms`, or adopt the one already at its address.
    ///
    /// The immutables commit to the order's creation time rather than the
    /// wall clock, so every attempt for the same leg targets one address.
    pub async fn deploy(&self, terms: EscrowTerms) -> SwapResult<Escrow> {
        let params = self.params_for(&terms, terms.created_at)?;
        let address = self.client.escrow_address(&params).await?;

        match self.client.get_escrow_status(address).await {
            Ok(status) if status.funded => {
                info!(escrow = %address, side = %terms.side, "Adopting escrow already deployed");
                // The deployment hash is not part of contract state
                return Ok(terms.into_escrow(
                    address.to_string(),
                    BroadcastAttempt {
                        txid: address.to_string(),
                        fee_rate: 0,
                        raw_tx: None,
                        broadcast_at: now_secs(),
                    },
                ));
            }
            Ok(_) => {
                return Err(SwapError::Failed(format!(
                    "escrow {} exists but was never funded",
                    address
                )))
            }
            Err(ChainError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let deployment = self
            .client
            .deploy_escrow(&params)
            .await
            .map_err(broadcast_error)?;
        Ok(terms.into_escrow(
            deployment.escrow.to_string(),
            BroadcastAttempt {
                txid: deployment.tx_hash,
                fee_rate: 0,
                raw_tx: None,
                broadcast_at: now_secs(),
            },
        ))
    }

    /// None when the escrow was already withdrawn by someone else
    pub async fn withdraw(
        &self,
        escrow: &Escrow,
        secret: &Secret,
    ) -> SwapResult<Option<SpendBroadcast>> {
        let address = parse_address(&escrow.address)?;
        let status = self.client.get_escrow_status(address).await?;
        if status.withdrawn {
            return Ok(None);
        }
        if status.cancelled {
            return Err(SwapError::Failed(format!(
                "escrow {} was cancelled",
                escrow.address
            )));
        }
        let tx_hash = self
            .client
            .withdraw_escrow(address, secret)
            .await
            .map_err(broadcast_error)?;
        Ok(Some(SpendBroadcast {
            txid: tx_hash,
            fee_rate: 0,
            raw_tx: None,
        }))
    }

    /// None when the escrow was already cancelled by someone else
    pub async fn cancel(&self, escrow: &Escrow) -> SwapResult<Option<SpendBroadcast>> {
        let address = parse_address(&escrow.address)?;
        let status = self.client.get_escrow_status(address).await?;
        if status.cancelled {
            return Ok(None);
        }
        if status.withdrawn {
            return Err(SwapError::Failed(format!(
                "escrow {} was withdrawn",
                escrow.address
            )));
        }
        let tx_hash = self
            .client
            .cancel_escrow(address)
            .await
            .map_err(broadcast_error)?;
        Ok(Some(SpendBroadcast {
            txid: tx_hash,
            fee_rate: 0,
            raw_tx: None,
        }))
    }

    pub async fn observe(&self, escrow: &Escrow) -> SwapResult<Observation> {
        let status = self
            .client
            .get_escrow_status(parse_address(&escrow.address)?)
            .await?;
        let spend = if status.withdrawn {
            Some(ObservedSpend {
                kind: SpendKind::Redeem,
                txid: None,
                secret: status.revealed_secret,
                confirmed: true,
            })
        } else if status.cancelled {
            Some(ObservedSpend {
                kind: SpendKind::Refund,
                txid: None,
                secret: None,
                confirmed: true,
            })
        } else {
            None
        };
        Ok(Observation {
            funded: status.funded,
            funding_txid: status
                .funded
                .then(|| escrow.funding.latest().map(|a| a.txid.clone()))
                .flatten(),
            confirmations: status.confirmations,
            spend,
        })
    }
}
