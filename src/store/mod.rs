//! Persistence for swap records and the used-secrets set
//!
//! The engine never holds process-wide maps of its own; everything shared
//! between order tasks goes through a `SwapStore`. Writers are serialized per
//! order id by the state machine, so implementations only need atomicity for
//! `reserve_secret`.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::types::{HashLock, OrderId, SwapRecord};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait SwapStore: Send + Sync {
    /// Look up a record, active or archived
    async fn get(&self, order_id: &OrderId) -> Result<Option<SwapRecord>, StoreError>;

    /// Insert or replace an active record
    async fn put(&self, record: &SwapRecord) -> Result<(), StoreError>;

    /// Remove an active record without archiving it. Returns whether it existed.
    async fn delete(&self, order_id: &OrderId) -> Result<bool, StoreError>;

    /// Move a record to history. Returns whether it was active.
    async fn archive(&self, order_id: &OrderId) -> Result<bool, StoreError>;

    /// Atomically add a secret hash to the used set. Returns false if it was already there.
    async fn reserve_secret(&self, secret_hash: &HashLock) -> Result<bool, StoreError>;

    /// Ids of all non-archived records
    async fn list_active(&self) -> Result<Vec<OrderId>, StoreError>;
}
