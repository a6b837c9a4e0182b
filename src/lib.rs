//! HTLC atomic-swap resolver - Library interface
//!
//! Coordinates hash-time-locked swaps between a UTXO chain (HTLC scripts)
//! and an account chain (escrow contracts). Re-exports internal modules for
//! use by the binary and integration tests.

pub mod api;
pub mod chains;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod hash;
pub mod hashlock;
pub mod htlc;
pub mod merkle;
pub mod metrics;
pub mod orders;
pub mod policy;
pub mod recovery;
pub mod signer;
pub mod store;
pub mod types;
pub mod watcher;

pub use engine::{EngineConfig, InitiateParams, Initiated, SwapEngine};
pub use error::{ChainError, SwapError, SwapResult};
