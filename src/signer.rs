//! Local key material for the UTXO chain
//!
//! The resolver wallet is a keyring of secp256k1 keys. Each key controls a
//! P2WPKH wallet address and can sign HTLC branches naming its public key.

use std::collections::HashMap;

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{All, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{
    Address, Amount, CompressedPublicKey, Network, PrivateKey, PublicKey, Transaction, Witness,
};
use thiserror::Error;

use crate::error::SwapError;
use crate::htlc::spend;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignerError {
    #[error("no signing key for {0}")]
    UnknownKey(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("signing failed: {0}")]
    Signing(String),
}

impl From<SignerError> for SwapError {
    fn from(e: SignerError) -> Self {
        match e {
            SignerError::UnknownKey(_) => SwapError::InsufficientSignatureOrAllowance(e.to_string()),
            SignerError::InvalidKey(_) => SwapError::Validation(e.to_string()),
            SignerError::Signing(_) => SwapError::Failed(e.to_string()),
        }
    }
}

pub trait UtxoSigner: Send + Sync {
    fn network(&self) -> Network;

    fn has_key(&self, pubkey: &PublicKey) -> bool;

    /// P2WPKH address controlled by `pubkey`
    fn wallet_address(&self, pubkey: &PublicKey) -> Result<Address, SignerError>;

    /// Sign input `index` of `tx`, spending a P2WPKH output of `pubkey` worth `value`
    fn sign_p2wpkh_input(
        &self,
        pubkey: &PublicKey,
        tx: &mut Transaction,
        index: usize,
        value: Amount,
    ) -> Result<(), SignerError>;

    /// Signature over an HTLC input sighash
    fn sign_htlc_input(
        &self,
        pubkey: &PublicKey,
        sighash: &[u8; 32],
    ) -> Result<bitcoin::ecdsa::Signature, SignerError>;
}

/// P2WPKH address of any compressed key, no secret needed
pub fn p2wpkh_address(pubkey: &PublicKey, network: Network) -> Result<Address, SignerError> {
    let compressed = CompressedPublicKey::try_from(*pubkey)
        .map_err(|e| SignerError::InvalidKey(e.to_string()))?;
    Ok(Address::p2wpkh(&compressed, network))
}

/// In-process keyring
pub struct LocalKeySigner {
    secp: Secp256k1<All>,
    network: Network,
    keys: HashMap<PublicKey, SecretKey>,
}

impl std::fmt::Debug for LocalKeySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKeySigner")
            .field("network", &self.network)
            .field("keys", &self.keys.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl LocalKeySigner {
    pub fn new(network: Network) -> Self {
        Self {
            secp: Secp256k1::new(),
            network,
            keys: HashMap::new(),
        }
    }

    /// Add a key and return its compressed public key
    pub fn add_key(&mut self, secret: SecretKey) -> PublicKey {
        let pubkey = PublicKey::new(secret.public_key(&self.secp));
        self.keys.insert(pubkey, secret);
        pubkey
    }

    pub fn add_wif(&mut self, wif: &str) -> Result<PublicKey, SignerError> {
        let key = PrivateKey::from_wif(wif.trim()).map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        Ok(self.add_key(key.inner))
    }

    fn secret(&self, pubkey: &PublicKey) -> Result<&SecretKey, SignerError> {
        self.keys
            .get(pubkey)
            .ok_or_else(|| SignerError::UnknownKey(pubkey.to_string()))
    }
}

impl UtxoSigner for LocalKeySigner {
    fn network(&self) -> Network {
        self.network
    }

    fn has_key(&self, pubkey: &PublicKey) -> bool {
        self.keys.contains_key(pubkey)
    }

    fn wallet_address(&self, pubkey: &PublicKey) -> Result<Address, SignerError> {
        p2wpkh_address(pubkey, self.network)
    }

    fn sign_p2wpkh_input(
        &self,
        pubkey: &PublicKey,
        tx: &mut Transaction,
        index: usize,
        value: Amount,
    ) -> Result<(), SignerError> {
        let secret = self.secret(pubkey)?;
        let script_pubkey = self.wallet_address(pubkey)?.script_pubkey();
        let sighash = SighashCache::new(&*tx)
            .p2wpkh_signature_hash(index, &script_pubkey, value, EcdsaSighashType::All)
            .map_err(|e| SignerError::Signing(e.to_string()))?;
        let signature = spend::sign(&self.secp, secret, &sighash.to_byte_array());
        let input = tx
            .input
            .get_mut(index)
            .ok_or_else(|| SignerError::Signing(format!("input {} out of range", index)))?;
        input.witness = Witness::from_slice(&[signature.to_vec(), pubkey.to_bytes()]);
        Ok(())
    }

    fn sign_htlc_input(
        &self,
        pubkey: &PublicKey,
        sighash: &[u8; 32],
    ) -> Result<bitcoin::ecdsa::Signature, SignerError> {
        Ok(spend::sign(&self.secp, self.secret(pubkey)?, sighash))
    }
}
