//! Failure and recovery handling
//!
//! - timeout refunds of legs still locked after their timelock
//! - fee-bump replacement of stuck UTXO broadcasts
//! - retry policy for transient chain errors ([`retry`])
//!
//! Node failover lives with the clients in `chains::failover`.

pub mod retry;

use tracing::{info, warn};

use crate::coordinator::{BumpTarget, EscrowCoordinator};
use crate::error::{SwapError, SwapResult};
use crate::types::{BroadcastSet, Escrow, EscrowOutcome, FillState, Secret, Side, TxRef};

pub use retry::RetryConfig;

/// Outcome of one refund pass over a fill
#[derive(Debug, Default)]
pub struct RefundProgress {
    /// Transactions broadcast in this pass
    pub broadcast: Vec<TxRef>,
    /// Legs still open after this pass
    pub pending: Vec<Side>,
    /// First hard error hit, if any
    pub error: Option<SwapError>,
}

impl RefundProgress {
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty() && self.error.is_none()
    }
}

/// Every refund or claim transaction recorded on a fill's legs
pub fn closing_refs(fill: &FillState) -> Vec<TxRef> {
    [fill.dst.as_ref(), fill.src.as_ref()]
        .into_iter()
        .flatten()
        .filter_map(|e| match &e.outcome {
            EscrowOutcome::Refunded { tx } | EscrowOutcome::Withdrawn { tx } => tx.clone(),
            EscrowOutcome::Open => None,
        })
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct RecoveryHandler {
    config: RetryConfig,
}

impl RecoveryHandler {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Next fee rate for a conflict set, or None at the ceiling
    pub fn bump_rate(&self, set: &BroadcastSet) -> Option<u64> {
        let base = set.attempts.first()?.fee_rate;
        let current = set.latest()?.fee_rate;
        self.config
            .replacement_fee_rate(base, current, set.attempts.len() as u32)
    }

    /// Replace a stuck funding or spend with a higher-fee conflict.
    ///
    /// Returns the replacement, or None if there was nothing to bump or the
    /// fee ceiling was reached.
    pub async fn bump_stuck(
        &self,
        coordinator: &EscrowCoordinator,
        escrow: &mut Escrow,
        target: BumpTarget,
        secret: Option<&Secret>,
    ) -> SwapResult<Option<TxRef>> {
        let set = match target {
            BumpTarget::Funding => Some(&escrow.funding),
            BumpTarget::Spend => escrow
                .utxo
                .as_ref()
                .and_then(|u| u.spend.as_ref())
                .map(|s| &s.broadcasts),
        };
        let Some(set) = set.filter(|s| !s.is_confirmed()) else {
            return Ok(None);
        };
        let Some(fee_rate) = self.bump_rate(set) else {
            warn!(
                address = %escrow.address,
                side = %escrow.side,
                attempts = set.attempts.len(),
                "Fee ceiling reached, not bumping"
            );
            return Ok(None);
        };

        let replacement = coordinator
            .replace(escrow, target, fee_rate, secret)
            .await?;
        if let Some(tx) = &replacement {
            info!(
                address = %escrow.address,
                side = %escrow.side,
                target = ?target,
                fee_rate,
                txid = %tx.txid,
                "Broadcast fee-bumped replacement"
            );
        }
        Ok(replacement)
    }

    /// Close every leg of an expired fill that is still open.
    ///
    /// The destination leg expires first and is handled first. When the
    /// maker already withdrew the destination leg the secret is public, so the
    /// source leg is claimed with it rather than refunded.
    pub async fn refund_expired(
        &self,
        coordinator: &EscrowCoordinator,
        fill: &mut FillState,
    ) -> RefundProgress {
        let mut progress = RefundProgress::default();
        let secret = fill.secret;

        for side in [Side::Destination, Side::Source] {
            let dst_withdrawn = matches!(
                fill.dst.as_ref().map(|e| &e.outcome),
                Some(EscrowOutcome::Withdrawn { .. })
            );
            let Some(escrow) = fill.escrow_mut(side).filter(|e| e.is_open()) else {
                continue;
            };

            let result = match (side, secret) {
                (Side::Source, Some(secret)) if dst_withdrawn => {
                    coordinator.withdraw(escrow, &secret).await
                }
                _ => coordinator.cancel(escrow).await,
            };

            match result {
                Ok(tx) => progress.broadcast.extend(tx),
                Err(SwapError::NotReady(reason)) => {
                    info!(side = %side, reason = %reason, "Leg not refundable yet");
                    progress.pending.push(side);
                }
                Err(e) => {
                    warn!(side = %side, error = %e, "Failed to close leg");
                    progress.pending.push(side);
                    progress.error.get_or_insert(e);
                }
            }
        }
        progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BroadcastAttempt;

    fn attempt(txid: &str, fee_rate: u64) -> BroadcastAttempt {
        BroadcastAttempt {
            txid: txid.to_string(),
            fee_rate,
            raw_tx: None,
            broadcast_at: 0,
        }
    }

    #[test]
    fn test_bump_rate_strictly_increases() {
        let handler = RecoveryHandler::default();
        let mut set = BroadcastSet::single(attempt("a", 10));
        assert_eq!(handler.bump_rate(&set), Some(12));
        set.attempts.push(attempt("b", 12));
        assert_eq!(handler.bump_rate(&set), Some(14));
    }

    #[test]
    fn test_bump_rate_ceiling() {
        let handler = RecoveryHandler::default();
        let mut set = BroadcastSet::single(attempt("a", 10));
        set.attempts.push(attempt("b", 30));
        assert_eq!(handler.bump_rate(&set), None);
        assert_eq!(handler.bump_rate(&BroadcastSet::default()), None);
    }
}
