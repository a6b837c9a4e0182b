//! Secret generation, hashlock derivation and one-time-use enforcement
//!
//! The hashlock digest is SHA-256 on both chains. The UTXO script checks it
//! with `OP_SHA256` and the escrow contract with its `sha256` precompile, so
//! there is no secondary short-hash step on either side.

use std::sync::Arc;

use bitcoin::secp256k1::rand::{rngs::OsRng, RngCore};
use tracing::{debug, warn};

use crate::error::{SwapError, SwapResult};
use crate::hash::{ct_eq, sha256};
use crate::merkle::MerkleLeafSet;
use crate::store::SwapStore;
use crate::types::{HashLock, Secret};

/// Fresh 32-byte secret from the OS CSPRNG
pub fn generate_secret() -> Secret {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    Secret(bytes)
}

pub fn hash(secret: &Secret) -> HashLock {
    HashLock(sha256(&secret.0))
}

/// Recompute the hash and compare in constant time
pub fn validate(secret: &Secret, hashlock: &HashLock) -> bool {
    ct_eq(&hash(secret).0, &hashlock.0)
}

/// Enforces that a secret is committed to at most one order
///
/// The used-secrets set lives in the injected store, keyed by the secret's
/// hash so the plaintext is never persisted before it is revealed.
#[derive(Clone)]
pub struct HashLockManager {
    store: Arc<dyn SwapStore>,
}

impl HashLockManager {
    pub fn new(store: Arc<dyn SwapStore>) -> Self {
        Self { store }
    }

    /// Mark `secret` as used. A second reservation fails with `SecretReused`.
    pub async fn reserve(&self, secret: &Secret) -> SwapResult<()> {
        self.reserve_hash(&hash(secret)).await
    }

    /// Reserve a commitment whose secret is held by someone else
    pub async fn reserve_hash(&self, hashlock: &HashLock) -> SwapResult<()> {
        if self.store.reserve_secret(hashlock).await? {
            debug!(hashlock = %hashlock, "Secret reserved");
            Ok(())
        } else {
            warn!(hashlock = %hashlock, "Rejected reuse of a previously committed secret");
            Err(SwapError::SecretReused)
        }
    }

    /// Reserve every secret of a set, stopping at the first reused one
    pub async fn reserve_all(&self, secrets: &[Secret]) -> SwapResult<()> {
        for secret in secrets {
            self.reserve(secret).await?;
        }
        Ok(())
    }
}

/// Generate `count` secrets and the Merkle leaf set committing to them.
/// Nothing is reserved yet.
pub fn generate_set(count: usize) -> SwapResult<(Vec<Secret>, MerkleLeafSet)> {
    let secrets: Vec<Secret> = (0..count).map(|_| generate_secret()).collect();
    let leaves = MerkleLeafSet::from_secret_hashes(secrets.iter().map(hash).collect())?;
    Ok((secrets, leaves))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use tokio_test::assert_ok;

    #[test]
    fn test_hash_round_trip() {
        for _ in 0..32 {
            let s = generate_secret();
            assert!(validate(&s, &hash(&s)));
        }
    }

    #[test]
    fn test_other_secret_fails_validation() {
        let s = generate_secret();
        let mut other = s;
        other.0[0] ^= 1;
        assert!(!validate(&other, &hash(&s)));
    }

    #[test]
    fn test_generated_secrets_differ() {
        assert_ne!(generate_secret(), generate_secret());
    }

    #[test]
    fn test_generate_set_bounds() {
        assert!(generate_set(1).is_err());
        assert!(generate_set(crate::merkle::MAX_LEAVES + 1).is_err());
        let (secrets, leaves) = generate_set(3).unwrap();
        assert_eq!(secrets.len(), 3);
        assert_eq!(leaves.secret_hash(2), Some(hash(&secrets[2])));
    }

    #[tokio::test]
    async fn test_reserved_hash_blocks_secret() {
        let manager = HashLockManager::new(Arc::new(MemoryStore::new()));
        let s = generate_secret();
        manager.reserve_hash(&hash(&s)).await.unwrap();
        assert!(matches!(
            manager.reserve(&s).await,
            Err(SwapError::SecretReused)
        ));
    }

    #[test]
    fn test_reserve_twice_is_rejected() {
        let manager = HashLockManager::new(Arc::new(MemoryStore::new()));
        let s = generate_secret();
        tokio_test::block_on(async {
            assert_ok!(manager.reserve(&s).await);
            assert!(matches!(
                manager.reserve(&s).await,
                Err(SwapError::SecretReused)
            ));
        });
    }

    #[tokio::test]
    async fn test_reserve_all_marks_every_secret() {
        let manager = HashLockManager::new(Arc::new(MemoryStore::new()));
        let (secrets, leaves) = generate_set(4).unwrap();
        assert_eq!(leaves.len(), 4);
        manager.reserve_all(&secrets).await.unwrap();
        for s in &secrets {
            assert!(matches!(
                manager.reserve(s).await,
                Err(SwapError::SecretReused)
            ));
        }
    }
}
