//! Common types for swap orders, escrows and swap state
//!
//! `Order` is immutable once created. `SwapState` is the mutable lifecycle
//! record and is only ever written through the order state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::hash::{bytes32_from_hex, bytes32_to_hex, keccak256};
use crate::merkle::MerkleLeafSet;

/// Current unix time in seconds
pub fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

// ============================================================================
// Identifiers and secrets
// ============================================================================

macro_rules! bytes32_newtype {
    ($name:ident) => {
        impl $name {
            pub fn from_hex(s: &str) -> Result<Self, String> {
                bytes32_from_hex(s).map(Self)
            }

            pub fn to_hex(&self) -> String {
                bytes32_to_hex(&self.0)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

/// Order hash: keccak256 over the canonical order encoding
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OrderId(pub [u8; 32]);
bytes32_newtype!(OrderId);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OrderId({})", self.to_hex())
    }
}

/// 32-byte preimage. Never printed.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Secret(pub [u8; 32]);
bytes32_newtype!(Secret);

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Commitment to one secret (sha256) or to a secret set (Merkle root)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HashLock(pub [u8; 32]);
bytes32_newtype!(HashLock);

impl fmt::Display for HashLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for HashLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashLock({})", self.to_hex())
    }
}

// ============================================================================
// Chains and legs
// ============================================================================

/// Chain family. Selects escrow mechanics in the coordinator and watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainKind {
    /// Script-only ledger, escrows are HTLC outputs
    Utxo,
    /// Contract ledger, escrows are deployed escrow contracts
    Account,
}

impl ChainKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainKind::Utxo => "utxo",
            ChainKind::Account => "account",
        }
    }
}

impl fmt::Display for ChainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Maker's leg, funded with the maker's asset
    Source,
    /// Resolver's leg, funded by the resolver to the maker
    Destination,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Source => "src",
            Side::Destination => "dst",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terms of one leg of the swap
///
/// Identities are chain-specific strings: hex compressed public keys on the
/// UTXO chain, 0x-prefixed addresses on the account chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegTerms {
    pub chain: ChainKind,
    /// Token address on the account chain, `"btc"` on the UTXO chain
    pub asset: String,
    #[serde(with = "amount_serde")]
    pub amount: u128,
    pub sender: String,
    pub recipient: String,
}

/// Absolute cancellation deadlines (unix seconds)
///
/// The destination leg is funded by the resolver and must expire no later
/// than the source leg, so a late reveal never strands the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timelocks {
    pub src_cancellation_at: u64,
    pub dst_cancellation_at: u64,
}

impl Timelocks {
    pub fn cancellation_at(&self, side: Side) -> u64 {
        match side {
            Side::Source => self.src_cancellation_at,
            Side::Destination => self.dst_cancellation_at,
        }
    }

    pub fn is_expired(&self, side: Side, now: u64) -> bool {
        now >= self.cancellation_at(side)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FillMode {
    Single,
    Multiple { leaves: MerkleLeafSet },
}

// ============================================================================
// Order
// ============================================================================

/// Swap intent. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub src: LegTerms,
    pub dst: LegTerms,
    pub hashlock: HashLock,
    pub fill_mode: FillMode,
    pub timelocks: Timelocks,
    #[serde(with = "amount_serde")]
    pub safety_deposit: u128,
    /// Maker authorization presented to the source escrow factory (hex)
    pub maker_signature: String,
    pub salt: OrderId,
    pub created_at: u64,
}

impl Order {
    /// Canonical order hash
    ///
    /// Fields are length-prefixed so distinct orders can't collide through
    /// concatenation ambiguity.
    #[allow(clippy::too_many_arguments)]
    pub fn compute_id(
        src: &LegTerms,
        dst: &LegTerms,
        hashlock: &HashLock,
        allow_multiple_fills: bool,
        timelocks: &Timelocks,
        safety_deposit: u128,
        salt: &[u8; 32],
    ) -> OrderId {
        let mut data = Vec::with_capacity(512);
        for leg in [src, dst] {
            data.push(match leg.chain {
                ChainKind::Utxo => 0u8,
                ChainKind::Account => 1u8,
            });
            for field in [&leg.asset, &leg.sender, &leg.recipient] {
                data.extend_from_slice(&(field.len() as u32).to_be_bytes());
                data.extend_from_slice(field.as_bytes());
            }
            data.extend_from_slice(&leg.amount.to_be_bytes());
        }
        data.extend_from_slice(&hashlock.0);
        data.push(allow_multiple_fills as u8);
        data.extend_from_slice(&timelocks.src_cancellation_at.to_be_bytes());
        data.extend_from_slice(&timelocks.dst_cancellation_at.to_be_bytes());
        data.extend_from_slice(&safety_deposit.to_be_bytes());
        data.extend_from_slice(salt);
        OrderId(keccak256(&data))
    }

    pub fn allows_multiple_fills(&self) -> bool {
        matches!(self.fill_mode, FillMode::Multiple { .. })
    }

    /// Total order size, denominated in the source asset
    pub fn total_amount(&self) -> u128 {
        self.src.amount
    }

    pub fn leg(&self, side: Side) -> &LegTerms {
        match side {
            Side::Source => &self.src,
            Side::Destination => &self.dst,
        }
    }

    /// Destination amount owed for a source fill, pro rata
    pub fn dst_amount_for(&self, src_fill: u128) -> u128 {
        if src_fill >= self.src.amount {
            return self.dst.amount;
        }
        // u128 multiplication can overflow for 18-decimal tokens; split it
        let whole = self.dst.amount / self.src.amount;
        let rem = self.dst.amount % self.src.amount;
        whole * src_fill + rem.saturating_mul(src_fill) / self.src.amount
    }
}

// ============================================================================
// Status
// ============================================================================

/// Lifecycle status of one fill (and, in aggregate, of the order)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapStatus {
    Initiated,
    SrcLocked,
    DstLocked,
    SecretRevealed,
    Completed,
    Expired,
    Refunded,
    Failed,
}

impl SwapStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwapStatus::Initiated => "initiated",
            SwapStatus::SrcLocked => "src_locked",
            SwapStatus::DstLocked => "dst_locked",
            SwapStatus::SecretRevealed => "secret_revealed",
            SwapStatus::Completed => "completed",
            SwapStatus::Expired => "expired",
            SwapStatus::Refunded => "refunded",
            SwapStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SwapStatus::Completed | SwapStatus::Refunded | SwapStatus::Failed
        )
    }

    /// Legs may be locked on chain in these states
    pub fn is_locked(&self) -> bool {
        matches!(self, SwapStatus::SrcLocked | SwapStatus::DstLocked)
    }
}

impl fmt::Display for SwapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SwapStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initiated" => Ok(SwapStatus::Initiated),
            "src_locked" => Ok(SwapStatus::SrcLocked),
            "dst_locked" => Ok(SwapStatus::DstLocked),
            "secret_revealed" => Ok(SwapStatus::SecretRevealed),
            "completed" => Ok(SwapStatus::Completed),
            "expired" => Ok(SwapStatus::Expired),
            "refunded" => Ok(SwapStatus::Refunded),
            "failed" => Ok(SwapStatus::Failed),
            other => Err(format!("unknown swap status: {}", other)),
        }
    }
}

// ============================================================================
// Escrows and transactions
// ============================================================================

/// Reference to a broadcast transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRef {
    pub chain: ChainKind,
    pub txid: String,
}

impl TxRef {
    pub fn new(chain: ChainKind, txid: impl Into<String>) -> Self {
        Self {
            chain,
            txid: txid.into(),
        }
    }
}

/// One broadcast of a transaction, original or fee-bumped replacement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastAttempt {
    pub txid: String,
    /// sat/vB on the UTXO chain, 0 where the client prices the tx itself
    pub fee_rate: u64,
    /// Raw transaction hex, kept for UTXO rebroadcast
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_tx: Option<String>,
    pub broadcast_at: u64,
}

/// Conflict set of an original transaction and its replacements
///
/// Whichever member confirms first wins; the rest are discarded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastSet {
    pub attempts: Vec<BroadcastAttempt>,
    pub confirmed: Option<String>,
}

impl BroadcastSet {
    pub fn single(attempt: BroadcastAttempt) -> Self {
        Self {
            attempts: vec![attempt],
            confirmed: None,
        }
    }

    pub fn latest(&self) -> Option<&BroadcastAttempt> {
        self.attempts.last()
    }

    pub fn contains(&self, txid: &str) -> bool {
        self.attempts.iter().any(|a| a.txid == txid)
    }

    /// Confirmed txid if known, otherwise the newest attempt
    pub fn effective_txid(&self) -> Option<&str> {
        self.confirmed
            .as_deref()
            .or_else(|| self.latest().map(|a| a.txid.as_str()))
    }

    /// Record the winner. Returns false if a different member already won.
    pub fn resolve(&mut self, txid: &str) -> bool {
        match &self.confirmed {
            Some(existing) => existing == txid,
            None if self.contains(txid) => {
                self.confirmed = Some(txid.to_string());
                true
            }
            None => false,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed.is_some()
    }
}

/// Wallet input spent by a UTXO funding transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingInput {
    pub txid: String,
    pub vout: u32,
    pub value: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpendKind {
    Redeem,
    Refund,
}

/// An in-flight spend of an HTLC output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSpend {
    pub kind: SpendKind,
    pub broadcasts: BroadcastSet,
}

/// UTXO-specific escrow details
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoEscrow {
    /// Witness script (hex)
    pub script: String,
    /// Output index of the HTLC in the funding transaction
    pub vout: u32,
    /// Wallet inputs of the funding tx, kept so it can be rebuilt at a higher fee
    pub inputs: Vec<FundingInput>,
    #[serde(default)]
    pub spend: Option<PendingSpend>,
    /// Signed refunds anyone may relay after the timelock, one per funding attempt
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub presigned_refunds: Vec<PresignedRefund>,
}

impl UtxoEscrow {
    pub fn presigned_refund(&self, funding_txid: &str) -> Option<&PresignedRefund> {
        self.presigned_refunds
            .iter()
            .find(|r| r.funding_txid == funding_txid)
    }
}

/// Refund transaction signed by the sender while the escrow was being funded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresignedRefund {
    /// Funding transaction the refund spends
    pub funding_txid: String,
    pub fee_rate: u64,
    pub raw_tx: String,
}

/// Terminal outcome of an escrow. Withdrawn and refunded are exclusive.
///
/// The transaction is unknown when the spend was observed through contract
/// state rather than broadcast by this engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum EscrowOutcome {
    Open,
    Withdrawn { tx: Option<TxRef> },
    Refunded { tx: Option<TxRef> },
}

/// Locked value on one chain for one fill
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escrow {
    pub side: Side,
    pub chain: ChainKind,
    /// Deterministic escrow address (contract address or P2WSH address)
    pub address: String,
    #[serde(with = "amount_serde")]
    pub amount: u128,
    pub hashlock: HashLock,
    pub cancellation_at: u64,
    pub sender: String,
    pub recipient: String,
    pub deployed_at: u64,
    pub funding: BroadcastSet,
    pub confirmations: u32,
    pub outcome: EscrowOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utxo: Option<UtxoEscrow>,
}

impl Escrow {
    pub fn is_open(&self) -> bool {
        matches!(self.outcome, EscrowOutcome::Open)
    }

    /// Closed, and the closing transaction is final on chain.
    ///
    /// Account-chain calls only return once their receipt succeeded, so a
    /// closed account leg is always settled. A UTXO leg waits for one member
    /// of its spend conflict set to confirm.
    pub fn is_settled(&self) -> bool {
        match (&self.outcome, &self.utxo) {
            (EscrowOutcome::Open, _) => false,
            (_, Some(details)) => details
                .spend
                .as_ref()
                .is_some_and(|s| s.broadcasts.is_confirmed()),
            (_, None) => true,
        }
    }

    pub fn funding_ref(&self) -> Option<TxRef> {
        self.funding
            .effective_txid()
            .map(|txid| TxRef::new(self.chain, txid))
    }
}

// ============================================================================
// Swap state
// ============================================================================

/// Result of a mutating operation; stored so re-invocation returns it unchanged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub success: bool,
    pub tx_refs: Vec<TxRef>,
}

impl OperationResult {
    pub fn ok(tx_refs: Vec<TxRef>) -> Self {
        Self {
            success: true,
            tx_refs,
        }
    }
}

/// Lifecycle of one fill (exactly one for single-fill orders)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillState {
    /// Merkle leaf index authorizing this fill, 0 for single-fill orders
    pub index: u32,
    #[serde(with = "amount_serde")]
    pub amount: u128,
    /// Hashlock of this fill's escrows (the leaf secret's hash for partial fills)
    pub hashlock: HashLock,
    pub status: SwapStatus,
    pub src: Option<Escrow>,
    pub dst: Option<Escrow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<Secret>,
    #[serde(default)]
    pub fund_result: Option<OperationResult>,
    #[serde(default)]
    pub claim_result: Option<OperationResult>,
    #[serde(default)]
    pub refund_result: Option<OperationResult>,
    pub updated_at: u64,
}

impl FillState {
    pub fn escrow(&self, side: Side) -> Option<&Escrow> {
        match side {
            Side::Source => self.src.as_ref(),
            Side::Destination => self.dst.as_ref(),
        }
    }

    pub fn escrow_mut(&mut self, side: Side) -> Option<&mut Escrow> {
        match side {
            Side::Source => self.src.as_mut(),
            Side::Destination => self.dst.as_mut(),
        }
    }

    pub fn set_escrow(&mut self, escrow: Escrow) {
        match escrow.side {
            Side::Source => self.src = Some(escrow),
            Side::Destination => self.dst = Some(escrow),
        }
    }

    /// Escrows still holding value
    pub fn open_escrows(&self) -> impl Iterator<Item = &Escrow> {
        self.src
            .iter()
            .chain(self.dst.iter())
            .filter(|e| e.is_open())
    }

    /// Closed escrows whose closing transaction is not final yet
    pub fn unsettled_escrows(&self) -> impl Iterator<Item = &Escrow> {
        self.src
            .iter()
            .chain(self.dst.iter())
            .filter(|e| !e.is_open() && !e.is_settled())
    }
}

/// Mutable lifecycle record for one order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapState {
    pub order_id: OrderId,
    /// Status of the active (latest) fill
    pub status: SwapStatus,
    pub fills: Vec<FillState>,
    #[serde(with = "amount_serde")]
    pub filled_amount: u128,
    pub created_at: u64,
    pub expires_at: u64,
    pub updated_at: u64,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl SwapState {
    pub fn new(order: &Order) -> Self {
        let now = now_secs();
        Self {
            order_id: order.id,
            status: SwapStatus::Initiated,
            fills: Vec::new(),
            filled_amount: 0,
            created_at: now,
            expires_at: order.timelocks.dst_cancellation_at,
            updated_at: now,
            last_error: None,
        }
    }

    pub fn active_fill(&self) -> Option<&FillState> {
        self.fills.last()
    }

    pub fn active_fill_mut(&mut self) -> Option<&mut FillState> {
        self.fills.last_mut()
    }

    pub fn fill_by_index(&self, index: u32) -> Option<&FillState> {
        self.fills.iter().find(|f| f.index == index)
    }
}

/// Unit of persistence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapRecord {
    pub order: Order,
    pub state: SwapState,
}

impl SwapRecord {
    /// No further fill can happen, every fill is terminal and every closing
    /// transaction is final
    pub fn is_finished(&self) -> bool {
        let Some(fill) = self.state.active_fill() else {
            return false;
        };
        if !fill.status.is_terminal() || fill.unsettled_escrows().next().is_some() {
            return false;
        }
        fill.status != SwapStatus::Completed
            || self.state.filled_amount >= self.order.total_amount()
    }
}

/// Serialize u128 amounts as decimal strings (JSON numbers lose precision)
pub mod amount_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leg(chain: ChainKind, amount: u128) -> LegTerms {
        LegTerms {
            chain,
            asset: "0x0000000000000000000000000000000000000001".to_string(),
            amount,
            sender: "a".to_string(),
            recipient: "b".to_string(),
        }
    }

    #[test]
    fn test_status_as_str_round_trip() {
        for status in [
            SwapStatus::Initiated,
            SwapStatus::SrcLocked,
            SwapStatus::DstLocked,
            SwapStatus::SecretRevealed,
            SwapStatus::Completed,
            SwapStatus::Expired,
            SwapStatus::Refunded,
            SwapStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<SwapStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(SwapStatus::Completed.is_terminal());
        assert!(SwapStatus::Refunded.is_terminal());
        assert!(SwapStatus::Failed.is_terminal());
        assert!(!SwapStatus::Expired.is_terminal());
        assert!(!SwapStatus::SecretRevealed.is_terminal());
    }

    #[test]
    fn test_secret_is_redacted() {
        let secret = Secret([7u8; 32]);
        assert_eq!(format!("{}", secret), "<redacted>");
        assert!(!format!("{:?}", secret).contains("0707"));
    }

    #[test]
    fn test_order_id_depends_on_salt() {
        let src = leg(ChainKind::Account, 100);
        let dst = leg(ChainKind::Utxo, 50);
        let tl = Timelocks {
            src_cancellation_at: 20,
            dst_cancellation_at: 10,
        };
        let hl = HashLock([1u8; 32]);
        let a = Order::compute_id(&src, &dst, &hl, false, &tl, 0, &[0u8; 32]);
        let b = Order::compute_id(&src, &dst, &hl, false, &tl, 0, &[1u8; 32]);
        let a2 = Order::compute_id(&src, &dst, &hl, false, &tl, 0, &[0u8; 32]);
        assert_ne!(a, b);
        assert_eq!(a, a2);
    }

    #[test]
    fn test_dst_amount_pro_rata() {
        let order = Order {
            id: OrderId([0u8; 32]),
            src: leg(ChainKind::Account, 100),
            dst: leg(ChainKind::Utxo, 50_000),
            hashlock: HashLock([0u8; 32]),
            fill_mode: FillMode::Single,
            timelocks: Timelocks {
                src_cancellation_at: 2,
                dst_cancellation_at: 1,
            },
            safety_deposit: 0,
            maker_signature: String::new(),
            salt: OrderId([0u8; 32]),
            created_at: 0,
        };
        assert_eq!(order.dst_amount_for(50), 25_000);
        assert_eq!(order.dst_amount_for(100), 50_000);
        assert_eq!(order.dst_amount_for(1), 500);
    }

    #[test]
    fn test_broadcast_set_first_confirmed_wins() {
        let mut set = BroadcastSet::single(BroadcastAttempt {
            txid: "aa".to_string(),
            fee_rate: 2,
            raw_tx: None,
            broadcast_at: 0,
        });
        set.attempts.push(BroadcastAttempt {
            txid: "bb".to_string(),
            fee_rate: 3,
            raw_tx: None,
            broadcast_at: 1,
        });
        assert_eq!(set.effective_txid(), Some("bb"));
        assert!(set.resolve("aa"));
        assert!(!set.resolve("bb"));
        assert!(!set.resolve("cc"));
        assert_eq!(set.effective_txid(), Some("aa"));
    }

    #[test]
    fn test_utxo_leg_settles_on_confirmed_spend() {
        let attempt = |txid: &str| BroadcastAttempt {
            txid: txid.to_string(),
            fee_rate: 2,
            raw_tx: None,
            broadcast_at: 0,
        };
        let mut escrow = Escrow {
            side: Side::Destination,
            chain: ChainKind::Utxo,
            address: "bcrt1q".to_string(),
            amount: 1,
            hashlock: HashLock([0u8; 32]),
            cancellation_at: 0,
            sender: "a".to_string(),
            recipient: "b".to_string(),
            deployed_at: 0,
            funding: BroadcastSet::single(attempt("ff")),
            confirmations: 1,
            outcome: EscrowOutcome::Open,
            utxo: Some(UtxoEscrow {
                script: String::new(),
                vout: 0,
                inputs: Vec::new(),
                spend: None,
                presigned_refunds: Vec::new(),
            }),
        };
        assert!(!escrow.is_settled());

        escrow.outcome = EscrowOutcome::Refunded {
            tx: Some(TxRef::new(ChainKind::Utxo, "aa")),
        };
        if let Some(details) = escrow.utxo.as_mut() {
            details.spend = Some(PendingSpend {
                kind: SpendKind::Refund,
                broadcasts: BroadcastSet::single(attempt("aa")),
            });
        }
        assert!(!escrow.is_open());
        assert!(!escrow.is_settled());

        if let Some(spend) = escrow.utxo.as_mut().and_then(|u| u.spend.as_mut()) {
            spend.broadcasts.resolve("aa");
        }
        assert!(escrow.is_settled());

        escrow.utxo = None;
        assert!(escrow.is_settled());
    }

    #[test]
    fn test_amount_serializes_as_string() {
        let l = leg(ChainKind::Account, u128::MAX);
        let json = serde_json::to_value(&l).unwrap();
        assert_eq!(json["amount"], u128::MAX.to_string());
        let back: LegTerms = serde_json::from_value(json).unwrap();
        assert_eq!(back.amount, u128::MAX);
    }
}
