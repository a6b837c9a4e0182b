//! Hash primitives shared by both chains
//!
//! - `sha256` is the hashlock digest. Both the HTLC script (`OP_SHA256`) and
//!   the escrow contract validate secrets against it.
//! - `keccak256` is used for order hashes, Merkle nodes and CREATE2 address
//!   derivation, matching the account chain.

use bitcoin::hashes::{sha256, Hash};
use tiny_keccak::{Hasher, Keccak};

/// Compute keccak256 hash of data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// Compute sha256 hash of data
pub fn sha256(data: &[u8]) -> [u8; 32] {
    sha256::Hash::hash(data).to_byte_array()
}

/// Convert bytes32 to 0x-prefixed hex string
pub fn bytes32_to_hex(bytes: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Parse a bytes32 from hex, with or without 0x prefix
pub fn bytes32_from_hex(s: &str) -> Result<[u8; 32], String> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(s).map_err(|e| format!("invalid hex: {}", e))?;
    bytes
        .try_into()
        .map_err(|v: Vec<u8>| format!("expected 32 bytes, got {}", v.len()))
}

/// Constant-time equality for 32-byte digests
pub fn ct_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keccak256_empty() {
        let hash = keccak256(&[]);
        assert_eq!(
            hex::encode(hash),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_sha256_empty() {
        assert_eq!(
            hex::encode(sha256(&[])),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_bytes32_hex_round_trip() {
        let bytes = [0xabu8; 32];
        let hex = bytes32_to_hex(&bytes);
        assert!(hex.starts_with("0x"));
        assert_eq!(bytes32_from_hex(&hex).unwrap(), bytes);
        assert_eq!(bytes32_from_hex(&hex[2..]).unwrap(), bytes);
    }

    #[test]
    fn test_bytes32_from_hex_wrong_length() {
        assert!(bytes32_from_hex("0xabcd").is_err());
        assert!(bytes32_from_hex("zz").is_err());
    }

    #[test]
    fn test_ct_eq() {
        assert!(ct_eq(&[1u8; 32], &[1u8; 32]));
        let mut other = [1u8; 32];
        other[31] = 2;
        assert!(!ct_eq(&[1u8; 32], &other));
    }
}
