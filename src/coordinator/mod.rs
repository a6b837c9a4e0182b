//! Escrow coordinator
//!
//! Deploys, withdraws and cancels the two escrows of a fill. Mechanics are
//! picked by the leg's chain family, so either chain can be the source or
//! the destination of a swap:
//!
//! - [`utxo::UtxoEscrows`]: HTLC outputs funded from the resolver keyring
//! - [`account::AccountEscrows`]: escrow contracts deployed through the factory
//!
//! Escrow addresses are deterministic in both cases (P2WSH of the HTLC
//! script, CREATE2 of the escrow immutables).

pub mod account;
pub mod utxo;

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{ChainError, SwapError, SwapResult};
use crate::policy::ProfitabilityPolicy;
use crate::types::{
    now_secs, BroadcastAttempt, BroadcastSet, ChainKind, Escrow, EscrowOutcome, FillState,
    HashLock, Order, OrderId, PendingSpend, Secret, Side, SpendKind, TxRef,
};

pub use account::AccountEscrows;
pub use utxo::{UtxoEscrowSettings, UtxoEscrows};

/// Everything needed to deploy one escrow
#[derive(Debug, Clone)]
pub struct EscrowTerms {
    pub side: Side,
    pub chain: ChainKind,
    pub order_id: OrderId,
    pub hashlock: HashLock,
    pub amount: u128,
    pub cancellation_at: u64,
    pub sender: String,
    pub recipient: String,
    pub asset: String,
    pub safety_deposit: u128,
    /// Maker authorization, only presented for source escrows
    pub maker_signature: Vec<u8>,
    /// Order creation time, fixed across deployment attempts
    pub created_at: u64,
}

impl EscrowTerms {
    pub fn for_fill(order: &Order, fill: &FillState, side: Side) -> SwapResult<Self> {
        let leg = order.leg(side);
        let (amount, maker_signature) = match side {
            Side::Source => (fill.amount, decode_signature(&order.maker_signature)?),
            Side::Destination => (order.dst_amount_for(fill.amount), Vec::new()),
        };
        Ok(Self {
            side,
            chain: leg.chain,
            order_id: order.id,
            hashlock: fill.hashlock,
            amount,
            cancellation_at: order.timelocks.cancellation_at(side),
            sender: leg.sender.clone(),
            recipient: leg.recipient.clone(),
            asset: leg.asset.clone(),
            safety_deposit: order.safety_deposit,
            maker_signature,
            created_at: order.created_at,
        })
    }

    /// Escrow record for a just-broadcast deployment
    pub fn into_escrow(self, address: String, funding: BroadcastAttempt) -> Escrow {
        Escrow {
            side: self.side,
            chain: self.chain,
            address,
            amount: self.amount,
            hashlock: self.hashlock,
            cancellation_at: self.cancellation_at,
            sender: self.sender,
            recipient: self.recipient,
            deployed_at: funding.broadcast_at,
            funding: BroadcastSet::single(funding),
            confirmations: 0,
            outcome: EscrowOutcome::Open,
            utxo: None,
        }
    }
}

fn decode_signature(raw: &str) -> SwapResult<Vec<u8>> {
    hex::decode(raw.trim().trim_start_matches("0x"))
        .map_err(|e| SwapError::Validation(format!("maker signature is not hex: {}", e)))
}

/// A spend (withdraw, cancel, or a replacement of either) that was broadcast
#[derive(Debug, Clone)]
pub struct SpendBroadcast {
    pub txid: String,
    pub fee_rate: u64,
    pub raw_tx: Option<String>,
}

impl SpendBroadcast {
    fn into_attempt(self) -> BroadcastAttempt {
        BroadcastAttempt {
            txid: self.txid,
            fee_rate: self.fee_rate,
            raw_tx: self.raw_tx,
            broadcast_at: now_secs(),
        }
    }
}

/// Which transaction of an escrow a fee bump replaces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BumpTarget {
    Funding,
    Spend,
}

/// A spend of an escrow seen on chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedSpend {
    pub kind: SpendKind,
    /// Unknown when read from contract state
    pub txid: Option<String>,
    /// Preimage candidate carried by a redeem. Not validated.
    pub secret: Option<Secret>,
    pub confirmed: bool,
}

/// What the chain currently says about an escrow
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observation {
    /// A funding transaction of the escrow is known to the chain
    pub funded: bool,
    /// Member of the funding set that confirmed
    pub funding_txid: Option<String>,
    pub confirmations: u32,
    pub spend: Option<ObservedSpend>,
}

/// Map a client error from a state-changing call to the engine taxonomy
pub fn broadcast_error(e: ChainError) -> SwapError {
    match e {
        ChainError::Unauthorized(msg) => SwapError::InsufficientSignatureOrAllowance(msg),
        ChainError::Rejected(msg) => SwapError::BroadcastFailed(msg),
        other => SwapError::Chain(other),
    }
}

pub struct EscrowCoordinator {
    utxo: UtxoEscrows,
    account: AccountEscrows,
    policy: Arc<dyn ProfitabilityPolicy>,
}

impl EscrowCoordinator {
    pub fn new(
        utxo: UtxoEscrows,
        account: AccountEscrows,
        policy: Arc<dyn ProfitabilityPolicy>,
    ) -> Self {
        Self {
            utxo,
            account,
            policy,
        }
    }

    pub fn utxo(&self) -> &UtxoEscrows {
        &self.utxo
    }

    pub fn account(&self) -> &AccountEscrows {
        &self.account
    }

    /// Check an identity string against the leg's chain family
    pub fn validate_identity(&self, chain: ChainKind, identity: &str) -> SwapResult<()> {
        match chain {
            ChainKind::Utxo => utxo::parse_pubkey(identity).map(|_| ()),
            ChainKind::Account => account::parse_address(identity).map(|_| ()),
        }
    }

    /// Ask the profitability policy about a fill of `amount`
    pub fn evaluate(&self, order: &Order, amount: u128) -> SwapResult<()> {
        let evaluation = self.policy.evaluate(order, amount);
        if evaluation.profitable {
            return Ok(());
        }
        let reason = evaluation
            .reason
            .unwrap_or_else(|| "rejected by policy".to_string());
        warn!(order_id = %order.id, amount = %amount, reason = %reason, "Order not profitable");
        Err(SwapError::NotProfitable { reason })
    }

    /// Lock the maker's funds for `fill` using their authorization
    pub async fn deploy_source(&self, order: &Order, fill: &FillState) -> SwapResult<Escrow> {
        self.evaluate(order, fill.amount)?;
        self.deploy(EscrowTerms::for_fill(order, fill, Side::Source)?)
            .await
    }

    /// Lock the resolver's funds for the counter leg of `fill`
    pub async fn deploy_destination(&self, order: &Order, fill: &FillState) -> SwapResult<Escrow> {
        self.deploy(EscrowTerms::for_fill(order, fill, Side::Destination)?)
            .await
    }

    async fn deploy(&self, terms: EscrowTerms) -> SwapResult<Escrow> {
        let order_id = terms.order_id;
        let side = terms.side;
        let escrow = match terms.chain {
            ChainKind::Utxo => self.utxo.deploy(terms).await?,
            ChainKind::Account => self.account.deploy(terms).await?,
        };
        info!(
            order_id = %order_id,
            side = %side,
            chain = %escrow.chain,
            address = %escrow.address,
            txid = ?escrow.funding.effective_txid(),
            "Escrow deployed"
        );
        Ok(escrow)
    }

    /// Pay the recipient with `secret`. Repeated calls return the first result.
    pub async fn withdraw(&self, escrow: &mut Escrow, secret: &Secret) -> SwapResult<Option<TxRef>> {
        match &escrow.outcome {
            EscrowOutcome::Withdrawn { tx } => return Ok(tx.clone()),
            EscrowOutcome::Refunded { .. } => {
                return Err(SwapError::Failed(format!(
                    "{} escrow {} was already refunded",
                    escrow.side, escrow.address
                )))
            }
            EscrowOutcome::Open => {}
        }

        let broadcast = match escrow.chain {
            ChainKind::Utxo => Some(self.utxo.withdraw(escrow, secret).await?),
            ChainKind::Account => self.account.withdraw(escrow, secret).await?,
        };
        Ok(self.record_spend(escrow, SpendKind::Redeem, broadcast))
    }

    /// Return the escrow to its sender. Only valid once its own timelock passed.
    pub async fn cancel(&self, escrow: &mut Escrow) -> SwapResult<Option<TxRef>> {
        match &escrow.outcome {
            EscrowOutcome::Refunded { tx } => return Ok(tx.clone()),
            EscrowOutcome::Withdrawn { .. } => {
                return Err(SwapError::Failed(format!(
                    "{} escrow {} was already withdrawn",
                    escrow.side, escrow.address
                )))
            }
            EscrowOutcome::Open => {}
        }
        if now_secs() < escrow.cancellation_at {
            return Err(SwapError::NotReady(format!(
                "{} escrow timelock expires at {}",
                escrow.side, escrow.cancellation_at
            )));
        }

        let broadcast = match escrow.chain {
            ChainKind::Utxo => Some(self.utxo.cancel(escrow).await?),
            ChainKind::Account => self.account.cancel(escrow).await?,
        };
        Ok(self.record_spend(escrow, SpendKind::Refund, broadcast))
    }

    fn record_spend(
        &self,
        escrow: &mut Escrow,
        kind: SpendKind,
        broadcast: Option<SpendBroadcast>,
    ) -> Option<TxRef> {
        let tx = broadcast
            .as_ref()
            .map(|b| TxRef::new(escrow.chain, b.txid.clone()));
        if let (Some(b), Some(details)) = (broadcast, escrow.utxo.as_mut()) {
            details.spend = Some(PendingSpend {
                kind,
                broadcasts: BroadcastSet::single(b.into_attempt()),
            });
        }
        escrow.outcome = match kind {
            SpendKind::Redeem => EscrowOutcome::Withdrawn { tx: tx.clone() },
            SpendKind::Refund => EscrowOutcome::Refunded { tx: tx.clone() },
        };
        tx
    }

    /// Rebroadcast `target` at `fee_rate`, adding the replacement to its conflict set.
    ///
    /// Returns None when there is nothing to replace (already confirmed, or
    /// the chain prices transactions itself).
    pub async fn replace(
        &self,
        escrow: &mut Escrow,
        target: BumpTarget,
        fee_rate: u64,
        secret: Option<&Secret>,
    ) -> SwapResult<Option<TxRef>> {
        if escrow.chain == ChainKind::Account {
            return Ok(None);
        }
        let broadcast = match target {
            BumpTarget::Funding => {
                if escrow.funding.is_confirmed() {
                    return Ok(None);
                }
                let b = self.utxo.rebuild_funding(escrow, fee_rate).await?;
                let txid = b.txid.clone();
                escrow.funding.attempts.push(b.into_attempt());
                self.utxo.attach_presigned_refund(escrow, &txid, fee_rate);
                Some(txid)
            }
            BumpTarget::Spend => {
                let Some(kind) = escrow
                    .utxo
                    .as_ref()
                    .and_then(|u| u.spend.as_ref())
                    .filter(|s| !s.broadcasts.is_confirmed())
                    .map(|s| s.kind)
                else {
                    return Ok(None);
                };
                let b = self.utxo.respend(escrow, kind, fee_rate, secret).await?;
                let txid = b.txid.clone();
                if let Some(spend) = escrow.utxo.as_mut().and_then(|u| u.spend.as_mut()) {
                    spend.broadcasts.attempts.push(b.into_attempt());
                }
                let tx = Some(TxRef::new(escrow.chain, txid.clone()));
                escrow.outcome = match kind {
                    SpendKind::Redeem => EscrowOutcome::Withdrawn { tx },
                    SpendKind::Refund => EscrowOutcome::Refunded { tx },
                };
                Some(txid)
            }
        };
        Ok(broadcast.map(|txid| TxRef::new(escrow.chain, txid)))
    }

    /// Read the escrow's on-chain state
    pub async fn observe(&self, escrow: &Escrow) -> SwapResult<Observation> {
        match escrow.chain {
            ChainKind::Utxo => self.utxo.observe(escrow).await,
            ChainKind::Account => self.account.observe(escrow).await,
        }
    }
}
