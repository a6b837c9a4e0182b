//! Error taxonomy for the swap engine
//!
//! `SwapError` is what callers of the engine see. `ChainError` is what the
//! chain clients return; it carries enough classification for the retry
//! policy to decide between backoff, fee bump, and giving up.

use thiserror::Error;

use crate::types::SwapStatus;

/// Errors surfaced by engine operations
#[derive(Debug, Clone, Error)]
pub enum SwapError {
    /// Malformed parameters, rejected before any state is created
    #[error("validation failed: {0}")]
    Validation(String),

    /// Profitability policy rejected the order or fill
    #[error("not profitable: {reason}")]
    NotProfitable { reason: String },

    #[error("secret has already been used")]
    SecretReused,

    #[error("secret does not match the committed hashlock")]
    SecretMismatch,

    /// Maker authorization (signature or allowance) rejected by the escrow chain
    #[error("insufficient signature or allowance: {0}")]
    InsufficientSignatureOrAllowance(String),

    #[error("insufficient funds: need {needed} sat, have {available} sat")]
    InsufficientFunds { needed: u64, available: u64 },

    #[error("broadcast failed: {0}")]
    BroadcastFailed(String),

    /// Timelock passed before the swap could complete
    #[error("swap timed out: {0}")]
    Timeout(String),

    #[error("unknown order: {0}")]
    UnknownOrder(String),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: SwapStatus, to: SwapStatus },

    /// Operation is valid for the order but its preconditions are not met yet
    #[error("not ready: {0}")]
    NotReady(String),

    #[error("order failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("store error: {0}")]
    Store(String),
}

impl SwapError {
    /// Short machine-readable kind, used as a metrics label and in API bodies
    pub fn kind(&self) -> &'static str {
        match self {
            SwapError::Validation(_) => "validation",
            SwapError::NotProfitable { .. } => "not_profitable",
            SwapError::SecretReused => "secret_reused",
            SwapError::SecretMismatch => "secret_mismatch",
            SwapError::InsufficientSignatureOrAllowance(_) => "insufficient_signature_or_allowance",
            SwapError::InsufficientFunds { .. } => "insufficient_funds",
            SwapError::BroadcastFailed(_) => "broadcast_failed",
            SwapError::Timeout(_) => "timeout",
            SwapError::UnknownOrder(_) => "unknown_order",
            SwapError::InvalidTransition { .. } => "invalid_transition",
            SwapError::NotReady(_) => "not_ready",
            SwapError::Failed(_) => "failed",
            SwapError::Chain(_) => "chain",
            SwapError::Store(_) => "store",
        }
    }

    /// Whether re-invoking the same operation later can succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            SwapError::Chain(e) => e.is_retryable(),
            SwapError::BroadcastFailed(_)
            | SwapError::InsufficientFunds { .. }
            | SwapError::NotReady(_)
            | SwapError::Store(_) => true,
            _ => false,
        }
    }
}

/// Errors returned by chain clients
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    /// Network, timeout, rate limit or 5xx from the node
    #[error("transport error: {0}")]
    Transport(String),

    /// Node or contract rejected the transaction or call
    #[error("rejected: {0}")]
    Rejected(String),

    /// Replacement fee too low or mempool min fee not met
    #[error("fee too low: {0}")]
    FeeTooLow(String),

    /// Signature or allowance check failed in the escrow contract
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl ChainError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChainError::Transport(_) | ChainError::FeeTooLow(_))
    }

    /// Classify a raw node/contract error message
    ///
    /// Node error strings are not standardized, so this matches on the
    /// phrases bitcoind, esplora and geth-style nodes actually return.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        if lower.contains("timeout")
            || lower.contains("timed out")
            || lower.contains("connection")
            || lower.contains("network")
            || lower.contains("rate limit")
            || lower.contains("too many requests")
            || lower.contains("503")
            || lower.contains("502")
            || lower.contains("temporarily unavailable")
        {
            return ChainError::Transport(message);
        }

        if lower.contains("insufficient fee")
            || lower.contains("min relay fee")
            || lower.contains("mempool min fee")
            || lower.contains("underpriced")
        {
            return ChainError::FeeTooLow(message);
        }

        if lower.contains("invalid signature")
            || lower.contains("allowance")
            || lower.contains("unauthorized")
            || lower.contains("not authorized")
        {
            return ChainError::Unauthorized(message);
        }

        if lower.contains("insufficient funds") || lower.contains("insufficient balance") {
            return ChainError::InsufficientFunds(message);
        }

        if lower.contains("not found") || lower.contains("404") {
            return ChainError::NotFound(message);
        }

        ChainError::Rejected(message)
    }
}

/// Errors from a `SwapStore` backend
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("corrupt record for order {order_id}: {reason}")]
    Corrupt { order_id: String, reason: String },
}

impl From<StoreError> for SwapError {
    fn from(e: StoreError) -> Self {
        SwapError::Store(e.to_string())
    }
}

pub type SwapResult<T> = std::result::Result<T, SwapError>;
