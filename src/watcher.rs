//! Chain watcher
//!
//! One polling task per monitored order. Each pass reads both escrows of the
//! active fill and turns what the chains say into [`ChainEvent`]s for the
//! engine. The watcher never broadcasts anything itself.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::coordinator::{BumpTarget, EscrowCoordinator, Observation};
use crate::error::SwapResult;
use crate::hashlock;
use crate::metrics::Metrics;
use crate::recovery::RetryConfig;
use crate::store::SwapStore;
use crate::types::{
    now_secs, ChainKind, Escrow, FillState, OrderId, Secret, Side, SpendKind, SwapRecord,
    SwapStatus,
};

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub poll_interval: Duration,
    pub utxo_confirmations: u32,
    pub account_confirmations: u32,
    /// Age after which an unconfirmed broadcast is reported as stuck
    pub stuck_after_secs: u64,
    /// Backoff and give-up policy for failing polls
    pub retry: RetryConfig,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            utxo_confirmations: 1,
            account_confirmations: 1,
            stuck_after_secs: 1800,
            retry: RetryConfig::default(),
        }
    }
}

impl WatcherConfig {
    pub fn required_confirmations(&self, chain: ChainKind) -> u32 {
        match chain {
            ChainKind::Utxo => self.utxo_confirmations,
            ChainKind::Account => self.account_confirmations,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// Source escrow reached the confirmation threshold
    SrcFunded {
        confirmations: u32,
        txid: Option<String>,
    },
    DstFunded {
        confirmations: u32,
        txid: Option<String>,
    },
    /// A spend carried a preimage that matches the fill's hashlock
    SecretRevealed { side: Side, secret: Secret },
    LegWithdrawn {
        side: Side,
        txid: Option<String>,
        confirmed: bool,
    },
    LegRefunded {
        side: Side,
        txid: Option<String>,
        confirmed: bool,
    },
    TimelockExpired,
    BroadcastStuck { side: Side, target: BumpTarget },
    /// Polling gave up after repeated errors
    WatchFailed { error: String },
}

impl EventKind {
    /// Events that only track an escrow's closing transaction
    pub fn tracks_spend(&self) -> bool {
        matches!(
            self,
            EventKind::LegWithdrawn { .. }
                | EventKind::LegRefunded { .. }
                | EventKind::BroadcastStuck { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainEvent {
    pub order_id: OrderId,
    pub fill_index: u32,
    pub kind: EventKind,
}

pub struct ChainWatcher {
    coordinator: Arc<EscrowCoordinator>,
    metrics: Arc<Metrics>,
    config: WatcherConfig,
}

impl ChainWatcher {
    pub fn new(
        coordinator: Arc<EscrowCoordinator>,
        metrics: Arc<Metrics>,
        config: WatcherConfig,
    ) -> Self {
        Self {
            coordinator,
            metrics,
            config,
        }
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    /// One pass over the active fill of `record`
    pub async fn poll(&self, record: &SwapRecord) -> SwapResult<Vec<ChainEvent>> {
        let Some(fill) = record.state.active_fill() else {
            return Ok(Vec::new());
        };
        // Failed fills are still followed until their refunds confirm
        if fill.status.is_terminal() && fill.unsettled_escrows().next().is_none() {
            return Ok(Vec::new());
        }

        let mut kinds = Vec::new();
        for side in [Side::Source, Side::Destination] {
            let Some(escrow) = fill.escrow(side) else {
                continue;
            };
            let observation = match self.coordinator.observe(escrow).await {
                Ok(o) => o,
                Err(e) => {
                    self.metrics.record_rpc_error(escrow.chain, &e);
                    return Err(e);
                }
            };
            self.escrow_events(fill, escrow, &observation, &mut kinds);
        }

        // A claim that broke off halfway is resumed with the known secret
        if fill.status == SwapStatus::SecretRevealed
            && fill.src.as_ref().is_some_and(|e| e.is_open())
        {
            if let Some(secret) = fill.secret {
                kinds.push(EventKind::SecretRevealed {
                    side: Side::Source,
                    secret,
                });
            }
        }

        // Expired fills keep reporting until every leg is closed
        let refundable = fill.status.is_locked()
            || (fill.status == SwapStatus::Expired && fill.open_escrows().next().is_some());
        if refundable && now_secs() >= record.state.expires_at {
            kinds.push(EventKind::TimelockExpired);
        }

        Ok(kinds
            .into_iter()
            .map(|kind| ChainEvent {
                order_id: record.order.id,
                fill_index: fill.index,
                kind,
            })
            .collect())
    }

    fn escrow_events(
        &self,
        fill: &FillState,
        escrow: &Escrow,
        observation: &Observation,
        kinds: &mut Vec<EventKind>,
    ) {
        let side = escrow.side;
        let required = self.config.required_confirmations(escrow.chain);

        if observation.funded && observation.confirmations >= required {
            let confirmations = observation.confirmations;
            let txid = observation.funding_txid.clone();
            match side {
                // A locked fill without a destination escrow still needs one
                Side::Source
                    if fill.status == SwapStatus::Initiated
                        || (fill.status == SwapStatus::SrcLocked && fill.dst.is_none()) =>
                {
                    kinds.push(EventKind::SrcFunded {
                        confirmations,
                        txid,
                    });
                }
                Side::Destination if fill.status == SwapStatus::SrcLocked => {
                    kinds.push(EventKind::DstFunded {
                        confirmations,
                        txid,
                    });
                }
                _ => {}
            }
        }

        if let Some(spend) = &observation.spend {
            let pending_resolved = escrow
                .utxo
                .as_ref()
                .and_then(|u| u.spend.as_ref())
                .map(|s| s.broadcasts.is_confirmed())
                .unwrap_or(!escrow.is_open());
            let report = escrow.is_open() || (spend.confirmed && !pending_resolved);

            match spend.kind {
                SpendKind::Redeem => {
                    if let Some(secret) = spend.secret {
                        if !hashlock::validate(&secret, &fill.hashlock) {
                            warn!(
                                address = %escrow.address,
                                side = %side,
                                txid = ?spend.txid,
                                "Ignoring spend with a preimage that does not match the hashlock"
                            );
                            return;
                        }
                        if fill.secret.is_none() {
                            kinds.push(EventKind::SecretRevealed { side, secret });
                        }
                    }
                    if report {
                        kinds.push(EventKind::LegWithdrawn {
                            side,
                            txid: spend.txid.clone(),
                            confirmed: spend.confirmed,
                        });
                    }
                }
                SpendKind::Refund => {
                    if report {
                        kinds.push(EventKind::LegRefunded {
                            side,
                            txid: spend.txid.clone(),
                            confirmed: spend.confirmed,
                        });
                    }
                }
            }
            if spend.confirmed {
                return;
            }
        }

        if escrow.chain == ChainKind::Utxo {
            if let Some(target) = self.stuck_target(escrow, observation) {
                kinds.push(EventKind::BroadcastStuck { side, target });
            }
        }
    }

    fn stuck_target(&self, escrow: &Escrow, observation: &Observation) -> Option<BumpTarget> {
        let now = now_secs();
        let stale = |at: u64| now.saturating_sub(at) >= self.config.stuck_after_secs;

        if escrow.is_open() {
            let unconfirmed = !escrow.funding.is_confirmed() && observation.confirmations == 0;
            return escrow
                .funding
                .latest()
                .filter(|a| unconfirmed && stale(a.broadcast_at))
                .map(|_| BumpTarget::Funding);
        }
        escrow
            .utxo
            .as_ref()
            .and_then(|u| u.spend.as_ref())
            .filter(|s| !s.broadcasts.is_confirmed())
            .and_then(|s| s.broadcasts.latest())
            .filter(|a| stale(a.broadcast_at))
            .map(|_| BumpTarget::Spend)
    }

    /// Poll `order_id` until its record is finished, sending events to `events`.
    ///
    /// Consecutive poll failures back off per the retry policy. Once retries
    /// run out (or the error is not retryable) a `WatchFailed` event is sent
    /// and the task ends.
    pub async fn run(
        self: Arc<Self>,
        order_id: OrderId,
        store: Arc<dyn SwapStore>,
        events: mpsc::Sender<ChainEvent>,
    ) {
        info!(order_id = %order_id, "Watcher started");
        let mut failures: u32 = 0;

        loop {
            let result = match store.get(&order_id).await {
                Ok(Some(record)) if record.is_finished() => {
                    debug!(order_id = %order_id, "Order finished, stopping watcher");
                    break;
                }
                Ok(Some(record)) => self.poll(&record).await,
                Ok(None) => {
                    warn!(order_id = %order_id, "Order no longer in store, stopping watcher");
                    break;
                }
                Err(e) => Err(e.into()),
            };

            match result {
                Ok(batch) => {
                    failures = 0;
                    for event in batch {
                        if events.send(event).await.is_err() {
                            debug!(order_id = %order_id, "Event receiver dropped");
                            return;
                        }
                    }
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                Err(e) => {
                    failures += 1;
                    if !e.is_retryable() || !self.config.retry.should_retry(failures) {
                        error!(
                            order_id = %order_id,
                            error = %e,
                            attempts = failures,
                            "Watcher giving up"
                        );
                        let fill_index = store
                            .get(&order_id)
                            .await
                            .ok()
                            .flatten()
                            .and_then(|r| r.state.active_fill().map(|f| f.index))
                            .unwrap_or(0);
                        let _ = events
                            .send(ChainEvent {
                                order_id,
                                fill_index,
                                kind: EventKind::WatchFailed {
                                    error: e.to_string(),
                                },
                            })
                            .await;
                        break;
                    }
                    let backoff = self.config.retry.backoff_for_attempt(failures - 1);
                    warn!(
                        order_id = %order_id,
                        error = %e,
                        attempt = failures,
                        ?backoff,
                        "Watcher poll failed, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
        info!(order_id = %order_id, "Watcher stopped");
    }
}
