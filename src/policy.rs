//! Profitability policy
//!
//! Pricing is out of scope for the engine; it only asks a policy whether an
//! order (or one fill of it) is worth resolving. Evaluation must not have side
//! effects, it runs before any secret is reserved or escrow deployed.

use crate::types::Order;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub profitable: bool,
    pub reason: Option<String>,
}

impl Evaluation {
    pub fn accept() -> Self {
        Self {
            profitable: true,
            reason: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            profitable: false,
            reason: Some(reason.into()),
        }
    }
}

pub trait ProfitabilityPolicy: Send + Sync {
    fn evaluate(&self, order: &Order, fill_amount: u128) -> Evaluation;
}

/// Accepts everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl ProfitabilityPolicy for AcceptAll {
    fn evaluate(&self, _order: &Order, _fill_amount: u128) -> Evaluation {
        Evaluation::accept()
    }
}

/// Bounds on fill and order size, in source-asset units
#[derive(Debug, Clone, Copy, Default)]
pub struct AmountLimits {
    pub min_fill: u128,
    /// None means unbounded
    pub max_order: Option<u128>,
}

impl ProfitabilityPolicy for AmountLimits {
    fn evaluate(&self, order: &Order, fill_amount: u128) -> Evaluation {
        if fill_amount < self.min_fill {
            return Evaluation::reject(format!(
                "fill {} below minimum {}",
                fill_amount, self.min_fill
            ));
        }
        if let Some(max) = self.max_order {
            if order.total_amount() > max {
                return Evaluation::reject(format!(
                    "order size {} above maximum {}",
                    order.total_amount(),
                    max
                ));
            }
        }
        Evaluation::accept()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChainKind, FillMode, HashLock, LegTerms, OrderId, Timelocks};

    fn order(amount: u128) -> Order {
        let leg = |chain| LegTerms {
            chain,
            asset: "btc".to_string(),
            amount,
            sender: "s".to_string(),
            recipient: "r".to_string(),
        };
        Order {
            id: OrderId([0u8; 32]),
            src: leg(ChainKind::Utxo),
            dst: leg(ChainKind::Account),
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
        }
    }

    #[test]
    fn test_accept_all() {
        assert!(AcceptAll.evaluate(&order(1), 1).profitable);
    }

    #[test]
    fn test_amount_limits() {
        let limits = AmountLimits {
            min_fill: 10,
            max_order: Some(1_000),
        };
        assert!(limits.evaluate(&order(500), 10).profitable);

        let small = limits.evaluate(&order(500), 9);
        assert!(!small.profitable);
        assert!(small.reason.unwrap().contains("below minimum"));

        assert!(!limits.evaluate(&order(1_001), 100).profitable);
    }
}
