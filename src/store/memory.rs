use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use super::SwapStore;
use crate::error::StoreError;
use crate::types::{HashLock, OrderId, SwapRecord};

/// In-process store. State is lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    active: RwLock<HashMap<OrderId, SwapRecord>>,
    history: RwLock<HashMap<OrderId, SwapRecord>>,
    used_secrets: Mutex<HashSet<HashLock>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn history_len(&self) -> usize {
        self.history.read().await.len()
    }
}

#[async_trait]
impl SwapStore for MemoryStore {
    async fn get(&self, order_id: &OrderId) -> Result<Option<SwapRecord>, StoreError> {
        if let Some(record) = self.active.read().await.get(order_id) {
            return Ok(Some(record.clone()));
        }
        Ok(self.history.read().await.get(order_id).cloned())
    }

    async fn put(&self, record: &SwapRecord) -> Result<(), StoreError> {
        self.active
            .write()
            .await
            .insert(record.order.id, record.clone());
        Ok(())
    }

    async fn delete(&self, order_id: &OrderId) -> Result<bool, StoreError> {
        Ok(self.active.write().await.remove(order_id).is_some())
    }

    async fn archive(&self, order_id: &OrderId) -> Result<bool, StoreError> {
        let mut active = self.active.write().await;
        match active.remove(order_id) {
            Some(record) => {
                self.history.write().await.insert(*order_id, record);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn reserve_secret(&self, secret_hash: &HashLock) -> Result<bool, StoreError> {
        Ok(self.used_secrets.lock().await.insert(*secret_hash))
    }

    async fn list_active(&self) -> Result<Vec<OrderId>, StoreError> {
        Ok(self.active.read().await.keys().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;

    fn record(id: u8) -> SwapRecord {
        let order = Order {
            id: OrderId([id; 32]),
            src: LegTerms {
                chain: ChainKind::Account,
                asset: "0x0000000000000000000000000000000000000001".to_string(),
                amount: 100,
                sender: "maker".to_string(),
                recipient: "resolver".to_string(),
            },
            dst: LegTerms {
                chain: ChainKind::Utxo,
                asset: "btc".to_string(),
                amount: 10_000,
                sender: "resolver".to_string(),
                recipient: "maker".to_string(),
            },
            hashlock: HashLock([9u8; 32]),
            fill_mode: FillMode::Single,
            timelocks: Timelocks {
                src_cancellation_at: 200,
                dst_cancellation_at: 100,
            },
            safety_deposit: 0,
            maker_signature: String::new(),
            salt: OrderId([0u8; 32]),
            created_at: 0,
        };
        let state = SwapState::new(&order);
        SwapRecord { order, state }
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();
        let r = record(1);
        store.put(&r).await.unwrap();
        assert_eq!(store.get(&r.order.id).await.unwrap(), Some(r.clone()));
        assert!(store.delete(&r.order.id).await.unwrap());
        assert!(store.get(&r.order.id).await.unwrap().is_none());
        assert!(!store.delete(&r.order.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_archive_keeps_record_readable() {
        let store = MemoryStore::new();
        let r = record(2);
        store.put(&r).await.unwrap();
        assert!(store.archive(&r.order.id).await.unwrap());
        assert!(store.list_active().await.unwrap().is_empty());
        assert!(store.get(&r.order.id).await.unwrap().is_some());
        assert_eq!(store.history_len().await, 1);
        assert!(!store.archive(&r.order.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_reserve_secret_once() {
        let store = MemoryStore::new();
        let h = HashLock([3u8; 32]);
        assert!(store.reserve_secret(&h).await.unwrap());
        assert!(!store.reserve_secret(&h).await.unwrap());
    }
}
