//! Swap engine
//!
//! The public face of the resolver: initiate, fund, claim, refund, status and
//! watch. Every mutating operation takes the order's lock, loads the record,
//! applies its change through the state machine and persists before the lock
//! is released. All mutating operations are idempotent; repeating one after
//! it succeeded returns the stored result without touching the chains.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bitcoin::secp256k1::rand::{rngs::OsRng, RngCore};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::coordinator::EscrowCoordinator;
use crate::error::{SwapError, SwapResult};
use crate::hashlock::{self, HashLockManager};
use crate::merkle::{self, MerkleProof, MAX_LEAVES};
use crate::metrics::Metrics;
use crate::orders::{self, OrderLocks};
use crate::recovery::{closing_refs, RecoveryHandler, RefundProgress};
use crate::store::SwapStore;
use crate::types::{
    now_secs, BroadcastAttempt, BroadcastSet, ChainKind, EscrowOutcome, FillMode, FillState,
    HashLock, LegTerms, OperationResult, Order, OrderId, PendingSpend, Secret, Side, SpendKind,
    SwapRecord, SwapState, SwapStatus, Timelocks, TxRef,
};
use crate::watcher::{ChainEvent, ChainWatcher, EventKind, WatcherConfig};

/// Upper bound on poll/apply rounds in one synchronous pass
const MAX_SYNC_ROUNDS: usize = 8;

/// Buffered events per watcher before the poller waits on the engine
const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Refund expired fills without waiting for an explicit refund call
    pub auto_refund: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { auto_refund: true }
    }
}

/// Parameters of a new swap order
#[derive(Debug, Clone, Deserialize)]
pub struct InitiateParams {
    pub src: LegTerms,
    pub dst: LegTerms,
    #[serde(default)]
    pub allow_multiple_fills: bool,
    /// Number of committed secrets for a multi-fill order
    #[serde(default)]
    pub parts: usize,
    /// Source leg lifetime from now, in seconds
    pub src_timelock_secs: u64,
    /// Destination leg lifetime from now, in seconds. Must not exceed the source's.
    pub dst_timelock_secs: u64,
    #[serde(default, with = "crate::types::amount_serde")]
    pub safety_deposit: u128,
    #[serde(default)]
    pub maker_signature: String,
    /// Maker-supplied secret; generated when absent
    #[serde(default)]
    pub secret: Option<Secret>,
    /// Commitment to a secret the maker keeps to themselves
    #[serde(default)]
    pub hashlock: Option<HashLock>,
}

/// Result of `initiate_swap`
///
/// `secrets` holds whatever was generated or supplied (empty when only a
/// hashlock was given). They go back to the maker and are not stored.
#[derive(Debug, Clone, Serialize)]
pub struct Initiated {
    pub order_id: OrderId,
    pub hashlock: HashLock,
    pub secrets: Vec<Secret>,
}

pub struct SwapEngine {
    store: Arc<dyn SwapStore>,
    hashlocks: HashLockManager,
    coordinator: Arc<EscrowCoordinator>,
    watcher: Arc<ChainWatcher>,
    recovery: RecoveryHandler,
    locks: OrderLocks,
    metrics: Arc<Metrics>,
    config: EngineConfig,
    watchers: Mutex<HashMap<OrderId, JoinHandle<()>>>,
}

impl SwapEngine {
    pub fn new(
        store: Arc<dyn SwapStore>,
        coordinator: Arc<EscrowCoordinator>,
        metrics: Arc<Metrics>,
        watcher_config: WatcherConfig,
        config: EngineConfig,
    ) -> Arc<Self> {
        let recovery = RecoveryHandler::new(watcher_config.retry.clone());
        let watcher = Arc::new(ChainWatcher::new(
            coordinator.clone(),
            metrics.clone(),
            watcher_config,
        ));
        Arc::new(Self {
            hashlocks: HashLockManager::new(store.clone()),
            store,
            coordinator,
            watcher,
            recovery,
            locks: OrderLocks::new(),
            metrics,
            config,
            watchers: Mutex::new(HashMap::new()),
        })
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn coordinator(&self) -> &Arc<EscrowCoordinator> {
        &self.coordinator
    }

    // ========================================================================
    // Initiation
    // ========================================================================

    pub async fn initiate_swap(&self, params: InitiateParams) -> SwapResult<Initiated> {
        self.validate_params(&params)?;

        let now = now_secs();
        let timelocks = Timelocks {
            src_cancellation_at: now + params.src_timelock_secs,
            dst_cancellation_at: now + params.dst_timelock_secs,
        };

        let (hashlock, fill_mode, secrets) = if params.allow_multiple_fills {
            let (secrets, leaves) = hashlock::generate_set(params.parts)?;
            (leaves.root, FillMode::Multiple { leaves }, secrets)
        } else if let Some(hashlock) = params.hashlock {
            (hashlock, FillMode::Single, Vec::new())
        } else {
            let secret = params.secret.unwrap_or_else(hashlock::generate_secret);
            (hashlock::hash(&secret), FillMode::Single, vec![secret])
        };

        let mut salt = [0u8; 32];
        OsRng.fill_bytes(&mut salt);
        let order = Order {
            id: Order::compute_id(
                &params.src,
                &params.dst,
                &hashlock,
                params.allow_multiple_fills,
                &timelocks,
                params.safety_deposit,
                &salt,
            ),
            src: params.src,
            dst: params.dst,
            hashlock,
            fill_mode,
            timelocks,
            safety_deposit: params.safety_deposit,
            maker_signature: params.maker_signature,
            salt: OrderId(salt),
            created_at: now,
        };

        self.coordinator.evaluate(&order, order.total_amount())?;

        if order.allows_multiple_fills() {
            self.hashlocks.reserve_all(&secrets).await?;
        } else {
            self.hashlocks.reserve_hash(&order.hashlock).await?;
        }

        let record = SwapRecord {
            state: SwapState::new(&order),
            order,
        };
        self.store.put(&record).await?;
        self.metrics.swaps_initiated_total.inc();

        info!(
            order_id = %record.order.id,
            src_chain = %record.order.src.chain,
            dst_chain = %record.order.dst.chain,
            src_amount = %record.order.src.amount,
            dst_amount = %record.order.dst.amount,
            multi_fill = record.order.allows_multiple_fills(),
            "Swap initiated"
        );

        Ok(Initiated {
            order_id: record.order.id,
            hashlock: record.order.hashlock,
            secrets,
        })
    }

    fn validate_params(&self, params: &InitiateParams) -> SwapResult<()> {
        if params.src.amount == 0 || params.dst.amount == 0 {
            return Err(SwapError::Validation(
                "both legs need a positive amount".to_string(),
            ));
        }
        if params.src.chain == params.dst.chain {
            return Err(SwapError::Validation(format!(
                "both legs are on the {} chain",
                params.src.chain
            )));
        }
        for leg in [&params.src, &params.dst] {
            if leg.chain == ChainKind::Utxo && u64::try_from(leg.amount).is_err() {
                return Err(SwapError::Validation(format!(
                    "amount {} does not fit in satoshis",
                    leg.amount
                )));
            }
            self.coordinator.validate_identity(leg.chain, &leg.sender)?;
            self.coordinator.validate_identity(leg.chain, &leg.recipient)?;
        }
        if params.dst_timelock_secs == 0 {
            return Err(SwapError::Validation(
                "destination timelock must be in the future".to_string(),
            ));
        }
        if params.dst_timelock_secs > params.src_timelock_secs {
            return Err(SwapError::Validation(format!(
                "destination timelock ({}s) must not outlast the source timelock ({}s)",
                params.dst_timelock_secs, params.src_timelock_secs
            )));
        }
        if params.allow_multiple_fills {
            if !(2..=MAX_LEAVES).contains(&params.parts) {
                return Err(SwapError::Validation(format!(
                    "multi-fill orders need between 2 and {} parts, got {}",
                    MAX_LEAVES, params.parts
                )));
            }
            if params.secret.is_some() || params.hashlock.is_some() {
                return Err(SwapError::Validation(
                    "multi-fill orders generate their own secrets".to_string(),
                ));
            }
        } else if params.secret.is_some() && params.hashlock.is_some() {
            return Err(SwapError::Validation(
                "give either a secret or a hashlock, not both".to_string(),
            ));
        }
        Ok(())
    }

    // ========================================================================
    // Funding
    // ========================================================================

    /// Fund the whole remaining order
    pub async fn fund(&self, order_id: &OrderId) -> SwapResult<OperationResult> {
        self.fund_fill(order_id, None).await
    }

    /// Fund a fill of `amount` (source units) of a multi-fill order
    pub async fn fund_partial(&self, order_id: &OrderId, amount: u128) -> SwapResult<OperationResult> {
        self.fund_fill(order_id, Some(amount)).await
    }

    async fn fund_fill(
        &self,
        order_id: &OrderId,
        requested: Option<u128>,
    ) -> SwapResult<OperationResult> {
        let _guard = self.locks.acquire(order_id).await;
        let mut record = self.load(order_id).await?;

        let in_flight = match record.state.active_fill() {
            Some(fill) if !fill.status.is_terminal() => {
                if requested.is_some_and(|amount| amount != fill.amount) {
                    return Err(SwapError::NotReady(format!(
                        "fill {} of {} is still in progress",
                        fill.index, fill.amount
                    )));
                }
                if let Some(result) = &fill.fund_result {
                    return Ok(result.clone());
                }
                true
            }
            Some(fill) if fill.status != SwapStatus::Completed || record.is_finished() => {
                return fill.fund_result.clone().ok_or_else(|| {
                    SwapError::Failed(
                        record
                            .state
                            .last_error
                            .clone()
                            .unwrap_or_else(|| "order was never funded".to_string()),
                    )
                });
            }
            _ => false,
        };

        if !in_flight {
            let remaining = record
                .order
                .total_amount()
                .saturating_sub(record.state.filled_amount);
            let fill = self.new_fill(&record, requested.unwrap_or(remaining))?;
            let now = now_secs();
            record.state.fills.push(fill);
            record.state.status = SwapStatus::Initiated;
            record.state.updated_at = now;
            self.store.put(&record).await?;
        }

        let fill = active_fill(&record)?;
        if fill.src.is_none() {
            match self.coordinator.deploy_source(&record.order, fill).await {
                Ok(escrow) => {
                    let fill = active_fill_mut(&mut record)?;
                    let refs = escrow.funding_ref().into_iter().collect();
                    fill.set_escrow(escrow);
                    fill.fund_result = Some(OperationResult::ok(refs));
                    fill.updated_at = now_secs();
                }
                Err(e) => {
                    warn!(order_id = %order_id, error = %e, "Source escrow deployment failed");
                    if !in_flight {
                        record.state.fills.pop();
                        record.state.status = record
                            .state
                            .active_fill()
                            .map(|f| f.status)
                            .unwrap_or(SwapStatus::Initiated);
                    }
                    record.state.last_error = Some(e.to_string());
                    self.store.put(&record).await?;
                    return Err(e);
                }
            }
        }

        if let Err(e) = self.sync_locked(&mut record).await {
            warn!(order_id = %order_id, error = %e, "Post-funding sync failed, watcher will retry");
        }
        self.persist(&record).await?;

        active_fill(&record)?
            .fund_result
            .clone()
            .ok_or_else(|| SwapError::Failed("fund result missing after deployment".to_string()))
    }

    fn new_fill(&self, record: &SwapRecord, amount: u128) -> SwapResult<FillState> {
        let order = &record.order;
        let total = order.total_amount();
        if amount == 0 {
            return Err(SwapError::Validation(
                "nothing left to fill on this order".to_string(),
            ));
        }
        if now_secs() >= record.state.expires_at {
            return Err(SwapError::Timeout(format!(
                "order expired at {}",
                record.state.expires_at
            )));
        }

        let (index, hashlock) = match &order.fill_mode {
            FillMode::Single => {
                if amount != total {
                    return Err(SwapError::Validation(format!(
                        "single-fill order must be filled in full ({}), got {}",
                        total, amount
                    )));
                }
                (0, order.hashlock)
            }
            FillMode::Multiple { leaves } => {
                let index = merkle::select_fill_leaf(leaves, total, &record.state, amount)?;
                let secret_hash = leaves.secret_hash(index).ok_or_else(|| {
                    SwapError::Validation(format!("leaf {} out of range", index))
                })?;
                let proof = leaves.proof(index)?;
                let leaf = merkle::leaf_hash(index, &secret_hash);
                if !merkle::verify_proof(&order.hashlock, &leaf, &proof) {
                    return Err(SwapError::Failed(
                        "leaf set does not match the order hashlock".to_string(),
                    ));
                }
                debug!(order_id = %order.id, index, amount = %amount, "Selected fill leaf");
                (index, secret_hash)
            }
        };

        Ok(FillState {
            index,
            amount,
            hashlock,
            status: SwapStatus::Initiated,
            src: None,
            dst: None,
            secret: None,
            fund_result: None,
            claim_result: None,
            refund_result: None,
            updated_at: now_secs(),
        })
    }

    // ========================================================================
    // Claim
    // ========================================================================

    /// Reveal `secret` and withdraw both legs of the fill it unlocks
    pub async fn claim(
        &self,
        order_id: &OrderId,
        secret: Secret,
        proof: Option<MerkleProof>,
    ) -> SwapResult<OperationResult> {
        let _guard = self.locks.acquire(order_id).await;
        let mut record = self.load(order_id).await?;

        let position = claimed_fill(&record, &secret, proof.as_ref())?;
        let fill = &record.state.fills[position];
        if !hashlock::validate(&secret, &fill.hashlock) {
            return Err(SwapError::SecretMismatch);
        }
        if let Some(result) = &fill.claim_result {
            return Ok(result.clone());
        }

        match fill.status {
            SwapStatus::DstLocked | SwapStatus::SecretRevealed => {}
            SwapStatus::Initiated | SwapStatus::SrcLocked => {
                return Err(SwapError::NotReady(format!(
                    "fill {} is {}; both legs must be locked first",
                    fill.index, fill.status
                )))
            }
            SwapStatus::Expired | SwapStatus::Refunded => {
                return Err(SwapError::Timeout(format!(
                    "fill {} is {}",
                    fill.index, fill.status
                )))
            }
            SwapStatus::Failed => {
                return Err(SwapError::Failed(
                    record
                        .state
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "order failed".to_string()),
                ))
            }
            SwapStatus::Completed => return Ok(OperationResult::ok(closing_refs(fill))),
        }
        if fill.status == SwapStatus::DstLocked && now_secs() >= record.state.expires_at {
            return Err(SwapError::Timeout(format!(
                "destination timelock passed at {}",
                record.state.expires_at
            )));
        }

        active_fill_mut(&mut record)?.secret = Some(secret);
        self.advance(&mut record.state, SwapStatus::SecretRevealed)?;
        // The secret is on record before anything reveals it on chain
        self.store.put(&record).await?;

        let error = self.complete_fill(&mut record).await;
        if error.is_none() {
            if let Err(e) = self.sync_locked(&mut record).await {
                warn!(order_id = %order_id, error = %e, "Post-claim sync failed, watcher will retry");
            }
        }
        self.settle_fill(&mut record)?;
        self.persist(&record).await?;

        let fill = &record.state.fills[position];
        match (&fill.claim_result, error) {
            (Some(result), _) => Ok(result.clone()),
            (None, Some(e)) => Err(e),
            // Broadcast, not confirmed yet
            (None, None) => Ok(OperationResult {
                success: false,
                tx_refs: closing_refs(fill),
            }),
        }
    }

    /// Withdraw every open leg of the active fill with its known secret.
    /// Returns the first hard error.
    async fn complete_fill(&self, record: &mut SwapRecord) -> Option<SwapError> {
        let order_id = record.order.id;
        let fill = record.state.active_fill_mut()?;
        let secret = fill.secret?;

        let mut first_error = None;
        for side in [Side::Destination, Side::Source] {
            let Some(escrow) = fill.escrow_mut(side).filter(|e| e.is_open()) else {
                continue;
            };
            let chain = escrow.chain;
            match self.coordinator.withdraw(escrow, &secret).await {
                Ok(tx) => {
                    info!(
                        order_id = %order_id,
                        side = %side,
                        txid = ?tx.as_ref().map(|t| t.txid.as_str()),
                        "Leg withdrawn"
                    );
                }
                // The maker's own key is needed to redeem a UTXO destination leg
                Err(SwapError::InsufficientSignatureOrAllowance(reason))
                    if side == Side::Destination =>
                {
                    info!(order_id = %order_id, reason = %reason, "Destination leg left for the maker to redeem");
                }
                Err(e) => {
                    warn!(order_id = %order_id, side = %side, error = %e, "Withdrawal failed");
                    self.metrics.record_rpc_error(chain, &e);
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = &first_error {
            record.state.last_error = Some(e.to_string());
        }
        first_error
    }

    // ========================================================================
    // Refund
    // ========================================================================

    /// Return locked funds of an expired (or failed) fill to their senders
    pub async fn refund(&self, order_id: &OrderId) -> SwapResult<OperationResult> {
        let _guard = self.locks.acquire(order_id).await;
        let mut record = self.load(order_id).await?;

        let fill = record
            .state
            .active_fill()
            .ok_or_else(|| SwapError::NotReady("order has not been funded".to_string()))?;
        if let Some(result) = &fill.refund_result {
            return Ok(result.clone());
        }

        let now = now_secs();
        let expires_at = record.state.expires_at;
        let src_deployed = fill.src.is_some();
        let closed = closing_refs(fill);
        let status = fill.status;
        match status {
            SwapStatus::SrcLocked | SwapStatus::DstLocked if now >= expires_at => {
                self.advance(&mut record.state, SwapStatus::Expired)?;
            }
            SwapStatus::Initiated if now >= expires_at && src_deployed => {
                record.state.last_error =
                    Some("source escrow never confirmed before expiry".to_string());
                self.advance(&mut record.state, SwapStatus::Failed)?;
            }
            SwapStatus::Initiated | SwapStatus::SrcLocked | SwapStatus::DstLocked => {
                return Err(SwapError::NotReady(format!(
                    "timelock expires at {}",
                    expires_at
                )))
            }
            SwapStatus::Expired | SwapStatus::Failed => {}
            SwapStatus::Refunded => return Ok(OperationResult::ok(closed)),
            from @ (SwapStatus::SecretRevealed | SwapStatus::Completed) => {
                return Err(SwapError::InvalidTransition {
                    from,
                    to: SwapStatus::Refunded,
                })
            }
        }

        let progress = self.refund_legs(&mut record).await;
        if progress.error.is_none() {
            if let Err(e) = self.sync_locked(&mut record).await {
                warn!(order_id = %order_id, error = %e, "Post-refund sync failed, watcher will retry");
            }
        }
        self.settle_fill(&mut record)?;
        if let Some(fill) = record.state.active_fill_mut() {
            // Failed fills close out without a status change
            if fill.status == SwapStatus::Failed
                && fill.refund_result.is_none()
                && fill.open_escrows().next().is_none()
                && fill.unsettled_escrows().next().is_none()
            {
                fill.refund_result = Some(OperationResult::ok(closing_refs(fill)));
            }
        }
        self.persist(&record).await?;

        let fill = active_fill(&record)?;
        if let Some(result) = &fill.refund_result {
            return Ok(result.clone());
        }
        match progress.error {
            Some(e) if progress.broadcast.is_empty() => Err(e),
            _ => Ok(OperationResult {
                success: false,
                tx_refs: closing_refs(fill),
            }),
        }
    }

    async fn refund_legs(&self, record: &mut SwapRecord) -> RefundProgress {
        let order_id = record.order.id;
        let Some(fill) = record.state.active_fill_mut() else {
            return RefundProgress::default();
        };
        let progress = self.recovery.refund_expired(&self.coordinator, fill).await;
        for tx in &progress.broadcast {
            info!(order_id = %order_id, chain = %tx.chain, txid = %tx.txid, "Refund broadcast");
        }
        if let Some(e) = &progress.error {
            record.state.last_error = Some(e.to_string());
        }
        progress
    }

    // ========================================================================
    // Status and monitoring
    // ========================================================================

    pub async fn get_status(&self, order_id: &OrderId) -> SwapResult<SwapState> {
        Ok(self.load(order_id).await?.state)
    }

    pub async fn get_record(&self, order_id: &OrderId) -> SwapResult<SwapRecord> {
        self.load(order_id).await
    }

    /// Start a watcher task for the order. Returns false if one is already running.
    pub async fn watch(self: &Arc<Self>, order_id: &OrderId) -> SwapResult<bool> {
        let record = self.load(order_id).await?;
        if record.is_finished() {
            return Ok(false);
        }

        let mut watchers = self.lock_watchers();
        watchers.retain(|_, handle| !handle.is_finished());
        if watchers.contains_key(order_id) {
            return Ok(false);
        }

        let (events_tx, mut events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let producer = tokio::spawn(self.watcher.clone().run(
            *order_id,
            self.store.clone(),
            events_tx,
        ));

        let engine = Arc::clone(self);
        let id = *order_id;
        self.metrics.active_watchers.inc();
        let handle = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if let Err(e) = engine.apply_event(&event).await {
                    warn!(order_id = %id, error = %e, "Failed to apply chain event");
                }
            }
            let _ = producer.await;
            engine.metrics.active_watchers.dec();
            engine.lock_watchers().remove(&id);
        });
        watchers.insert(*order_id, handle);
        Ok(true)
    }

    /// Start watchers for every active order, e.g. after a restart
    pub async fn resume(self: &Arc<Self>) -> SwapResult<usize> {
        let active = self.store.list_active().await?;
        let results = join_all(active.iter().map(|order_id| self.watch(order_id))).await;
        let mut started = 0;
        for result in results {
            if result? {
                started += 1;
            }
        }
        info!(count = started, "Resumed watchers for active orders");
        Ok(started)
    }

    /// Number of orders with a live watcher task
    pub fn watcher_count(&self) -> usize {
        let mut watchers = self.lock_watchers();
        watchers.retain(|_, handle| !handle.is_finished());
        watchers.len()
    }

    pub fn stop_watchers(&self) {
        let mut watchers = self.lock_watchers();
        for (_, handle) in watchers.drain() {
            handle.abort();
        }
        self.metrics.active_watchers.set(0);
    }

    /// One watcher pass plus event application, without a background task
    pub async fn sync(&self, order_id: &OrderId) -> SwapResult<SwapState> {
        let _guard = self.locks.acquire(order_id).await;
        let mut record = self.load(order_id).await?;
        let result = self.sync_locked(&mut record).await;
        if matches!(result, Ok(true)) || result.is_err() {
            self.persist(&record).await?;
        }
        result?;
        Ok(record.state)
    }

    /// Apply one event from a watcher task
    pub async fn apply_event(&self, event: &ChainEvent) -> SwapResult<()> {
        let _guard = self.locks.acquire(&event.order_id).await;
        let mut record = self.load(&event.order_id).await?;
        if self.apply_to_record(&mut record, event).await? {
            self.persist(&record).await?;
        }
        Ok(())
    }

    async fn sync_locked(&self, record: &mut SwapRecord) -> SwapResult<bool> {
        let mut any_change = false;
        for _ in 0..MAX_SYNC_ROUNDS {
            let events = self.watcher.poll(record).await?;
            let mut changed = false;
            for event in &events {
                changed |= self.apply_to_record(record, event).await?;
            }
            any_change |= changed;
            if !changed {
                break;
            }
        }
        Ok(any_change)
    }

    async fn apply_to_record(&self, record: &mut SwapRecord, event: &ChainEvent) -> SwapResult<bool> {
        let order_id = record.order.id;
        let Some(fill) = record.state.active_fill() else {
            return Ok(false);
        };
        if fill.index != event.fill_index || (fill.status.is_terminal() && !event.kind.tracks_spend()) {
            debug!(order_id = %order_id, event = ?event.kind, "Ignoring event for inactive fill");
            return Ok(false);
        }
        let status = fill.status;

        let mut changed = match &event.kind {
            EventKind::SrcFunded {
                confirmations,
                txid,
            } => {
                let mut changed =
                    mark_funded(record, Side::Source, *confirmations, txid.as_deref());
                changed |= self.advance(&mut record.state, SwapStatus::SrcLocked)?;
                let needs_dst = record
                    .state
                    .active_fill()
                    .is_some_and(|f| f.status == SwapStatus::SrcLocked && f.dst.is_none());
                if needs_dst {
                    changed |= self.lock_destination(record).await;
                }
                changed
            }
            EventKind::DstFunded {
                confirmations,
                txid,
            } => {
                let changed =
                    mark_funded(record, Side::Destination, *confirmations, txid.as_deref());
                self.advance(&mut record.state, SwapStatus::DstLocked)? || changed
            }
            EventKind::SecretRevealed { side, secret } => {
                let fill = active_fill_mut(record)?;
                if !hashlock::validate(secret, &fill.hashlock) {
                    warn!(order_id = %order_id, side = %side, "Ignoring revealed secret that does not match");
                    return Ok(false);
                }
                let mut changed = fill.secret.is_none();
                if changed {
                    fill.secret = Some(*secret);
                    info!(order_id = %order_id, side = %side, "Secret revealed on chain");
                }
                if status == SwapStatus::DstLocked {
                    changed |= self.advance(&mut record.state, SwapStatus::SecretRevealed)?;
                }
                if record.state.status == SwapStatus::SecretRevealed {
                    let before = record.state.last_error.clone();
                    let error = self.complete_fill(record).await;
                    changed |= error.is_none() || record.state.last_error != before;
                }
                changed
            }
            EventKind::LegWithdrawn {
                side,
                txid,
                confirmed,
            } => record_leg_spend(record, *side, SpendKind::Redeem, txid.as_deref(), *confirmed),
            EventKind::LegRefunded {
                side,
                txid,
                confirmed,
            } => {
                let mut changed =
                    record_leg_spend(record, *side, SpendKind::Refund, txid.as_deref(), *confirmed);
                // A leg can only be refunded after its timelock, which is never before expiry
                if status.is_locked() {
                    changed |= self.advance(&mut record.state, SwapStatus::Expired)?;
                }
                changed
            }
            EventKind::TimelockExpired => {
                let mut changed = if status.is_locked() {
                    self.advance(&mut record.state, SwapStatus::Expired)?
                } else {
                    false
                };
                if self.config.auto_refund && record.state.status == SwapStatus::Expired {
                    let progress = self.refund_legs(record).await;
                    changed |= !progress.broadcast.is_empty() || progress.error.is_some();
                }
                changed
            }
            EventKind::BroadcastStuck { side, target } => {
                let fill = active_fill_mut(record)?;
                let secret = fill.secret;
                let Some(escrow) = fill.escrow_mut(*side) else {
                    return Ok(false);
                };
                let chain = escrow.chain;
                match self
                    .recovery
                    .bump_stuck(&self.coordinator, escrow, *target, secret.as_ref())
                    .await
                {
                    Ok(Some(_)) => {
                        self.metrics.fee_bumps_total.inc();
                        true
                    }
                    Ok(None) => false,
                    Err(e) => {
                        warn!(order_id = %order_id, side = %side, error = %e, "Fee bump failed");
                        self.metrics.record_rpc_error(chain, &e);
                        record.state.last_error = Some(e.to_string());
                        true
                    }
                }
            }
            EventKind::WatchFailed { error } => {
                record.state.last_error = Some(error.clone());
                self.advance(&mut record.state, SwapStatus::Failed)?
            }
        };

        changed |= self.settle_fill(record)?;
        Ok(changed)
    }

    /// Deploy the destination escrow of the active fill.
    ///
    /// One attempt per call. A failed attempt is retried on the next
    /// `SrcFunded` the watcher reports, and deployment adopts an escrow an
    /// earlier attempt already funded.
    async fn lock_destination(&self, record: &mut SwapRecord) -> bool {
        let order_id = record.order.id;
        let result = {
            let Some(fill) = record.state.active_fill() else {
                return false;
            };
            self.coordinator
                .deploy_destination(&record.order, fill)
                .await
        };

        match result {
            Ok(escrow) => match record.state.active_fill_mut() {
                Some(fill) => {
                    fill.set_escrow(escrow);
                    true
                }
                None => false,
            },
            Err(e) => {
                warn!(order_id = %order_id, error = %e, "Failed to lock destination leg");
                self.metrics.record_rpc_error(record.order.dst.chain, &e);
                let message = e.to_string();
                let changed = record.state.last_error.as_deref() != Some(message.as_str());
                record.state.last_error = Some(message);
                changed
            }
        }
    }

    /// Move the active fill to its terminal state once its legs are closed
    /// and every closing transaction confirmed
    fn settle_fill(&self, record: &mut SwapRecord) -> SwapResult<bool> {
        let Some(fill) = record.state.active_fill() else {
            return Ok(false);
        };
        if fill.unsettled_escrows().next().is_some() {
            return Ok(false);
        }
        let src_outcome = fill.src.as_ref().map(|e| e.outcome.clone());

        match (fill.status, src_outcome) {
            (SwapStatus::SecretRevealed, Some(EscrowOutcome::Withdrawn { .. })) => {
                let refs = closing_refs(fill);
                let amount = fill.amount;
                self.advance(&mut record.state, SwapStatus::Completed)?;
                record.state.filled_amount = record.state.filled_amount.saturating_add(amount);
                let fill = active_fill_mut(record)?;
                fill.claim_result.get_or_insert(OperationResult::ok(refs));
                info!(
                    order_id = %record.order.id,
                    filled = %record.state.filled_amount,
                    total = %record.order.total_amount(),
                    "Fill completed"
                );
                Ok(true)
            }
            (SwapStatus::SecretRevealed, Some(EscrowOutcome::Refunded { .. })) => {
                record.state.last_error =
                    Some("source leg was refunded before it could be claimed".to_string());
                self.advance(&mut record.state, SwapStatus::Failed)
            }
            (SwapStatus::Expired, _) if fill.open_escrows().next().is_none() => {
                let refs = closing_refs(fill);
                self.advance(&mut record.state, SwapStatus::Refunded)?;
                active_fill_mut(record)?
                    .refund_result
                    .get_or_insert(OperationResult::ok(refs));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn advance(&self, state: &mut SwapState, to: SwapStatus) -> SwapResult<bool> {
        let changed = orders::transition(state, to)?;
        if changed {
            self.metrics.record_transition(to);
        }
        Ok(changed)
    }

    async fn load(&self, order_id: &OrderId) -> SwapResult<SwapRecord> {
        self.store
            .get(order_id)
            .await?
            .ok_or_else(|| SwapError::UnknownOrder(order_id.to_hex()))
    }

    /// Save the record, archiving it once no further fill is possible.
    /// Must be the last store write of an operation.
    async fn persist(&self, record: &SwapRecord) -> SwapResult<()> {
        self.store.put(record).await?;
        if record.is_finished() {
            self.store.archive(&record.order.id).await?;
            info!(order_id = %record.order.id, status = %record.state.status, "Order archived");
        }
        Ok(())
    }

    fn lock_watchers(&self) -> MutexGuard<'_, HashMap<OrderId, JoinHandle<()>>> {
        self.watchers.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn active_fill(record: &SwapRecord) -> SwapResult<&FillState> {
    record
        .state
        .active_fill()
        .ok_or_else(|| SwapError::NotReady(format!("order {} has no fill", record.order.id)))
}

fn active_fill_mut(record: &mut SwapRecord) -> SwapResult<&mut FillState> {
    let order_id = record.order.id;
    record
        .state
        .active_fill_mut()
        .ok_or_else(|| SwapError::NotReady(format!("order {} has no fill", order_id)))
}

/// Position in `fills` of the fill a claim with `secret` unlocks
fn claimed_fill(
    record: &SwapRecord,
    secret: &Secret,
    proof: Option<&MerkleProof>,
) -> SwapResult<usize> {
    match &record.order.fill_mode {
        FillMode::Single => {
            if !hashlock::validate(secret, &record.order.hashlock) {
                return Err(SwapError::SecretMismatch);
            }
            record
                .state
                .fills
                .len()
                .checked_sub(1)
                .ok_or_else(|| SwapError::NotReady("order has not been funded".to_string()))
        }
        FillMode::Multiple { .. } => {
            let proof = proof.ok_or_else(|| {
                SwapError::Validation("claims on multi-fill orders need a Merkle proof".to_string())
            })?;
            if !merkle::verify_secret(&record.order.hashlock, secret, proof) {
                return Err(SwapError::SecretMismatch);
            }
            record
                .state
                .fills
                .iter()
                .rposition(|f| f.index == proof.index)
                .ok_or_else(|| {
                    SwapError::NotReady(format!("leaf {} has not been funded", proof.index))
                })
        }
    }
}

fn mark_funded(record: &mut SwapRecord, side: Side, confirmations: u32, txid: Option<&str>) -> bool {
    let order_id = record.order.id;
    let Some(escrow) = record
        .state
        .active_fill_mut()
        .and_then(|f| f.escrow_mut(side))
    else {
        return false;
    };
    let mut changed = escrow.confirmations != confirmations;
    escrow.confirmations = confirmations;
    if let Some(txid) = txid {
        if escrow.funding.confirmed.is_none() {
            changed |= escrow.funding.resolve(txid);
        } else if !escrow.funding.resolve(txid) {
            warn!(order_id = %order_id, side = %side, txid, "Funding confirmed a different conflict member");
        }
    }
    changed
}

/// Record a spend of one leg seen on chain. Returns whether anything changed.
fn record_leg_spend(
    record: &mut SwapRecord,
    side: Side,
    kind: SpendKind,
    txid: Option<&str>,
    confirmed: bool,
) -> bool {
    let Some(escrow) = record
        .state
        .active_fill_mut()
        .and_then(|f| f.escrow_mut(side))
    else {
        return false;
    };
    let chain = escrow.chain;
    let outcome = |tx: Option<TxRef>| match kind {
        SpendKind::Redeem => EscrowOutcome::Withdrawn { tx },
        SpendKind::Refund => EscrowOutcome::Refunded { tx },
    };

    let mut changed = false;
    if escrow.is_open() {
        escrow.outcome = outcome(txid.map(|t| TxRef::new(chain, t)));
        changed = true;
    }

    if let (Some(txid), Some(details)) = (txid, escrow.utxo.as_mut()) {
        let spend = details.spend.get_or_insert_with(|| PendingSpend {
            kind,
            broadcasts: BroadcastSet::default(),
        });
        if spend.kind != kind {
            if !confirmed {
                return changed;
            }
            // A conflicting spend of the other path won the race
            warn!(side = %side, txid, kind = ?kind, "Leg closed by a conflicting spend");
            *spend = PendingSpend {
                kind,
                broadcasts: BroadcastSet::default(),
            };
        }
        if !spend.broadcasts.contains(txid) {
            spend.broadcasts.attempts.push(BroadcastAttempt {
                txid: txid.to_string(),
                fee_rate: 0,
                raw_tx: None,
                broadcast_at: now_secs(),
            });
            changed = true;
        }
        if confirmed && !spend.broadcasts.is_confirmed() {
            spend.broadcasts.resolve(txid);
            escrow.outcome = outcome(Some(TxRef::new(chain, txid)));
            changed = true;
        }
    }
    changed
}
