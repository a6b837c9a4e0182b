//! Partial-fill Merkle engine
//!
//! An order that allows multiple fills commits to N secrets. Leaf `i` is
//! `keccak256(u64_be(i) || sha256(secret_i))` and the order hashlock is the
//! root of the tree over those leaves. Internal nodes hash the sorted pair of
//! children, an odd node at the end of a level is promoted unchanged. This is
//! the same layout the escrow contracts verify on the account chain.
//!
//! A fill bringing the cumulative filled amount to `F` of a total `T` uses
//! leaf `floor((N-1)(F-1)/T)`; the fill that completes the order always uses
//! the last leaf. Each leaf authorizes at most one fill.

use serde::{Deserialize, Serialize};

use crate::error::{SwapError, SwapResult};
use crate::hash::keccak256;
use crate::types::{HashLock, Secret, SwapState};

/// Largest secret set an order may commit to
pub const MAX_LEAVES: usize = 1024;

pub type Node = [u8; 32];

/// Committed secret hashes of a multi-fill order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleLeafSet {
    pub secret_hashes: Vec<HashLock>,
    pub root: HashLock,
}

impl MerkleLeafSet {
    pub fn from_secret_hashes(secret_hashes: Vec<HashLock>) -> SwapResult<Self> {
        if secret_hashes.len() < 2 {
            return Err(SwapError::Validation(
                "a multi-fill order needs at least 2 secrets".to_string(),
            ));
        }
        if secret_hashes.len() > MAX_LEAVES {
            return Err(SwapError::Validation(format!(
                "a multi-fill order may commit to at most {} secrets",
                MAX_LEAVES
            )));
        }
        let leaves = leaves_for(&secret_hashes);
        let root = HashLock(root(&leaves));
        Ok(Self {
            secret_hashes,
            root,
        })
    }

    pub fn len(&self) -> usize {
        self.secret_hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secret_hashes.is_empty()
    }

    pub fn leaves(&self) -> Vec<Node> {
        leaves_for(&self.secret_hashes)
    }

    pub fn secret_hash(&self, index: u32) -> Option<HashLock> {
        self.secret_hashes.get(index as usize).copied()
    }

    pub fn proof(&self, index: u32) -> SwapResult<MerkleProof> {
        build_proof(&self.leaves(), index)
    }
}

/// Inclusion proof for one leaf
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub index: u32,
    #[serde(with = "hex_nodes")]
    pub nodes: Vec<Node>,
}

/// Leaf digest binding a secret hash to its index
pub fn leaf_hash(index: u32, secret_hash: &HashLock) -> Node {
    let mut data = [0u8; 40];
    data[..8].copy_from_slice(&(index as u64).to_be_bytes());
    data[8..].copy_from_slice(&secret_hash.0);
    keccak256(&data)
}

fn leaves_for(secret_hashes: &[HashLock]) -> Vec<Node> {
    secret_hashes
        .iter()
        .enumerate()
        .map(|(i, h)| leaf_hash(i as u32, h))
        .collect()
}

fn hash_pair(a: &Node, b: &Node) -> Node {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(lo);
    data[32..].copy_from_slice(hi);
    keccak256(&data)
}

fn next_level(level: &[Node]) -> Vec<Node> {
    level
        .chunks(2)
        .map(|pair| match pair {
            [a, b] => hash_pair(a, b),
            [a] => *a,
            _ => unreachable!("chunks(2) yields one or two elements"),
        })
        .collect()
}

/// Root over the given leaves. Empty input hashes to all zeros.
pub fn root(leaves: &[Node]) -> Node {
    if leaves.is_empty() {
        return [0u8; 32];
    }
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        level = next_level(&level);
    }
    level[0]
}

pub fn build_proof(leaves: &[Node], index: u32) -> SwapResult<MerkleProof> {
    let mut idx = index as usize;
    if idx >= leaves.len() {
        return Err(SwapError::Validation(format!(
            "leaf index {} out of range for {} leaves",
            index,
            leaves.len()
        )));
    }

    let mut nodes = Vec::new();
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        let sibling = idx ^ 1;
        if sibling < level.len() {
            nodes.push(level[sibling]);
        }
        level = next_level(&level);
        idx /= 2;
    }

    Ok(MerkleProof { index, nodes })
}

pub fn verify_proof(root: &HashLock, leaf: &Node, proof: &MerkleProof) -> bool {
    let computed = proof
        .nodes
        .iter()
        .fold(*leaf, |acc, sibling| hash_pair(&acc, sibling));
    crate::hash::ct_eq(&computed, &root.0)
}

/// Verify that `secret` is the committed secret at `proof.index`
pub fn verify_secret(root: &HashLock, secret: &Secret, proof: &MerkleProof) -> bool {
    let secret_hash = crate::hashlock::hash(secret);
    verify_proof(root, &leaf_hash(proof.index, &secret_hash), proof)
}

/// Leaf index authorizing a fill that brings the cumulative amount to `cumulative`
pub fn leaf_index(leaf_count: usize, total: u128, cumulative: u128) -> SwapResult<u32> {
    if leaf_count == 0 {
        return Err(SwapError::Validation("empty leaf set".to_string()));
    }
    if total == 0 || cumulative == 0 || cumulative > total {
        return Err(SwapError::Validation(format!(
            "cumulative fill {} outside (0, {}]",
            cumulative, total
        )));
    }

    let last = (leaf_count - 1) as u128;
    if cumulative == total {
        return Ok(last as u32);
    }

    // (N-1)(F-1) can't overflow for N <= MAX_LEAVES unless F is near u128::MAX
    let idx = match last.checked_mul(cumulative - 1) {
        Some(product) => product / total,
        None => (cumulative - 1) / (total / last.max(1)).max(1),
    };
    Ok(idx.min(last) as u32)
}

/// Pick the leaf for the next fill of `amount` and reject replays of consumed leaves
pub fn select_fill_leaf(
    leaves: &MerkleLeafSet,
    total: u128,
    state: &SwapState,
    amount: u128,
) -> SwapResult<u32> {
    if amount == 0 {
        return Err(SwapError::Validation("fill amount must be positive".to_string()));
    }
    let cumulative = state
        .filled_amount
        .checked_add(amount)
        .filter(|c| *c <= total)
        .ok_or_else(|| {
            SwapError::Validation(format!(
                "fill of {} exceeds remaining {}",
                amount,
                total.saturating_sub(state.filled_amount)
            ))
        })?;

    let idx = leaf_index(leaves.len(), total, cumulative)?;
    if is_consumed(state, idx) {
        return Err(SwapError::Validation(format!(
            "leaf {} already consumed; fill size must reach the next leaf",
            idx
        )));
    }
    // Leaf indices are non-decreasing in cumulative fill, so anything at or
    // below an earlier fill's leaf is a replay even if that fill failed.
    if let Some(max_used) = state.fills.iter().map(|f| f.index).max() {
        if idx < max_used {
            return Err(SwapError::Validation(format!(
                "leaf {} precedes already used leaf {}",
                idx, max_used
            )));
        }
    }
    Ok(idx)
}

pub fn is_consumed(state: &SwapState, index: u32) -> bool {
    state.fills.iter().any(|f| f.index == index)
}

mod hex_nodes {
    use super::Node;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(nodes: &[Node], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(nodes.iter().map(crate::hash::bytes32_to_hex))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Node>, D::Error> {
        let raw = Vec::<String>::deserialize(deserializer)?;
        raw.iter()
            .map(|s| crate::hash::bytes32_from_hex(s).map_err(serde::de::Error::custom))
            .collect()
    }
}
