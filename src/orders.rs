//! Order state machine
//!
//! ```text
//! initiated -> src_locked -> dst_locked -> secret_revealed -> completed
//! {src_locked, dst_locked} -> expired -> refunded
//! any non-terminal -> failed
//! ```
//!
//! Transitions apply to the active fill; the order's aggregate status mirrors
//! it. Every writer holds the order's lock from [`OrderLocks`] for the whole
//! read-modify-write, so transitions for one order are serialized while
//! different orders never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

use crate::error::{SwapError, SwapResult};
use crate::types::{now_secs, OrderId, SwapState, SwapStatus};

/// What applying a transition amounts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Apply,
    /// Already in the target state
    NoOp,
    /// Target is behind the current state (late or duplicate event)
    Stale,
}

/// Position along the lifecycle; expiry branches off after the locked states
fn rank(status: SwapStatus) -> u8 {
    match status {
        SwapStatus::Initiated => 0,
        SwapStatus::SrcLocked => 1,
        SwapStatus::DstLocked => 2,
        SwapStatus::SecretRevealed | SwapStatus::Expired => 3,
        SwapStatus::Completed | SwapStatus::Refunded => 4,
        SwapStatus::Failed => 5,
    }
}

fn is_edge(from: SwapStatus, to: SwapStatus) -> bool {
    use SwapStatus::*;
    matches!(
        (from, to),
        (Initiated, SrcLocked)
            | (SrcLocked, DstLocked)
            | (DstLocked, SecretRevealed)
            | (SecretRevealed, Completed)
            | (SrcLocked, Expired)
            | (DstLocked, Expired)
            | (Expired, Refunded)
    )
}

/// Classify `from -> to` without applying it
pub fn check_transition(from: SwapStatus, to: SwapStatus) -> SwapResult<Transition> {
    if from == to {
        return Ok(Transition::NoOp);
    }
    if from.is_terminal() {
        return Ok(Transition::Stale);
    }
    if to == SwapStatus::Failed || is_edge(from, to) {
        return Ok(Transition::Apply);
    }
    if rank(to) < rank(from) {
        return Ok(Transition::Stale);
    }
    Err(SwapError::InvalidTransition { from, to })
}

/// Move the active fill to `to`. Returns whether anything changed.
pub fn transition(state: &mut SwapState, to: SwapStatus) -> SwapResult<bool> {
    let order_id = state.order_id;
    let fill = state
        .active_fill_mut()
        .ok_or_else(|| SwapError::NotReady(format!("order {} has no fill", order_id)))?;
    let from = fill.status;

    match check_transition(from, to)? {
        Transition::NoOp => Ok(false),
        Transition::Stale => {
            debug!(
                order_id = %order_id,
                current = %from,
                ignored = %to,
                "Ignoring stale transition"
            );
            Ok(false)
        }
        Transition::Apply => {
            let now = now_secs();
            fill.status = to;
            fill.updated_at = now;
            let index = fill.index;
            state.status = to;
            state.updated_at = now;
            info!(
                order_id = %order_id,
                fill = index,
                from = %from,
                to = %to,
                "Swap status changed"
            );
            Ok(true)
        }
    }
}

/// Per-order async mutexes
///
/// The guard is owned so it can be held across awaits and is released on
/// drop, including on early return through `?`. Entries nobody holds or waits
/// on are pruned on the next acquire, so finished orders do not pile up.
#[derive(Debug, Default)]
pub struct OrderLocks {
    locks: Mutex<HashMap<OrderId, Arc<tokio::sync::Mutex<()>>>>,
}

impl OrderLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, order_id: &OrderId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            // Holders and waiters keep a clone; the map's own is the only one left when idle
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(*order_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
