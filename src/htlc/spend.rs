//! Spending transactions and witnesses for HTLC outputs
//!
//! Witness stacks (P2WSH, script last):
//! - redeem: `<recipient_sig> <preimage> 0x01 <script>`
//! - refund: `<sender_sig> <empty> <script>`

use bitcoin::absolute::LockTime;
use bitcoin::blockdata::script::{Builder, PushBytesBuf, Script, ScriptBuf};
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{Message, Secp256k1, SecretKey, Signing};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, Sequence, Transaction, TxIn, TxOut, Witness};

use super::{AddressScheme, HtlcError, ProofMaterial, SpendPath};
use crate::types::Secret;

/// Outputs below this are not relayed
pub const DUST_LIMIT: u64 = 546;

/// Virtual size of a one-input one-output redeem spend, with margin
pub const REDEEM_VSIZE: u64 = 150;

/// Virtual size of a one-input one-output refund spend, with margin
pub const REFUND_VSIZE: u64 = 140;

/// scriptSig for the given address scheme (empty for native P2WSH)
pub fn script_sig(script: &Script, scheme: AddressScheme) -> Result<ScriptBuf, HtlcError> {
    match scheme {
        AddressScheme::P2wsh => Ok(ScriptBuf::new()),
        AddressScheme::P2shP2wsh => {
            let program = ScriptBuf::new_p2wsh(&script.wscript_hash());
            let push = PushBytesBuf::try_from(program.to_bytes())
                .map_err(|e| HtlcError::Template(e.to_string()))?;
            Ok(Builder::new().push_slice(push).into_script())
        }
    }
}

/// Parameters of a spend of one HTLC output
#[derive(Debug, Clone)]
pub struct SpendRequest {
    pub outpoint: OutPoint,
    pub value: Amount,
    pub destination: ScriptBuf,
    pub fee_rate: u64,
    pub path: SpendPath,
    /// Script timelock; refund transactions must carry it as their lock_time
    pub timelock: u32,
    pub script_sig: ScriptBuf,
}

impl SpendRequest {
    pub fn fee(&self) -> Amount {
        let vsize = match self.path {
            SpendPath::Redeem => REDEEM_VSIZE,
            SpendPath::Refund => REFUND_VSIZE,
        };
        Amount::from_sat(self.fee_rate.saturating_mul(vsize))
    }

    /// Unsigned spending transaction, opted in to replacement
    pub fn unsigned_tx(&self) -> Result<Transaction, HtlcError> {
        let fee = self.fee();
        let out_value = self
            .value
            .checked_sub(fee)
            .filter(|v| v.to_sat() >= DUST_LIMIT)
            .ok_or_else(|| {
                HtlcError::Template(format!(
                    "output of {} sat cannot cover fee of {} sat",
                    self.value.to_sat(),
                    fee.to_sat()
                ))
            })?;

        let lock_time = match self.path {
            SpendPath::Redeem => LockTime::ZERO,
            SpendPath::Refund => LockTime::from_consensus(self.timelock),
        };

        Ok(Transaction {
            version: Version::TWO,
            lock_time,
            input: vec![TxIn {
                previous_output: self.outpoint,
                script_sig: self.script_sig.clone(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: out_value,
                script_pubkey: self.destination.clone(),
            }],
        })
    }
}

/// BIP143 sighash of input `index` spending an HTLC output
pub fn sighash(
    tx: &Transaction,
    index: usize,
    script: &Script,
    value: Amount,
) -> Result<[u8; 32], HtlcError> {
    let hash = SighashCache::new(tx)
        .p2wsh_signature_hash(index, script, value, EcdsaSighashType::All)
        .map_err(|e| HtlcError::Sighash(e.to_string()))?;
    Ok(hash.to_byte_array())
}

pub fn sign<C: Signing>(
    secp: &Secp256k1<C>,
    key: &SecretKey,
    sighash: &[u8; 32],
) -> bitcoin::ecdsa::Signature {
    bitcoin::ecdsa::Signature {
        signature: secp.sign_ecdsa(&Message::from_digest(*sighash), key),
        sighash_type: EcdsaSighashType::All,
    }
}

pub fn redeem_witness(sig: &bitcoin::ecdsa::Signature, secret: &Secret, script: &Script) -> Witness {
    Witness::from_slice(&[
        sig.to_vec(),
        secret.0.to_vec(),
        vec![1u8],
        script.to_bytes(),
    ])
}

pub fn refund_witness(sig: &bitcoin::ecdsa::Signature, script: &Script) -> Witness {
    Witness::from_slice(&[sig.to_vec(), Vec::new(), script.to_bytes()])
}

/// Which branch a witness selects, if it looks like an HTLC spend at all
pub fn spend_path(witness: &Witness) -> Option<SpendPath> {
    let n = witness.len();
    if n < 2 {
        return None;
    }
    match witness.nth(n - 2) {
        Some([1]) if n == 4 => Some(SpendPath::Redeem),
        Some([]) if n == 3 => Some(SpendPath::Refund),
        _ => None,
    }
}

/// Witness script (last stack item)
pub fn witness_script(witness: &Witness) -> Option<ScriptBuf> {
    witness.last().map(|s| ScriptBuf::from_bytes(s.to_vec()))
}

/// Preimage candidate carried by a redeem witness. Not validated.
pub fn extract_secret(witness: &Witness) -> Option<Secret> {
    if spend_path(witness)? != SpendPath::Redeem {
        return None;
    }
    let preimage: [u8; 32] = witness.nth(1)?.try_into().ok()?;
    Some(Secret(preimage))
}

/// Rebuild the proof material a witness presents, for [`super::validate`]
pub fn proof_from_witness(
    witness: &Witness,
    sighash: [u8; 32],
    current_time: u32,
) -> Option<ProofMaterial> {
    let decode_sig = |bytes: &[u8]| {
        bitcoin::ecdsa::Signature::from_slice(bytes)
            .ok()
            .map(|s| s.signature)
    };
    match spend_path(witness)? {
        SpendPath::Redeem => Some(ProofMaterial::Redeem {
            secret: extract_secret(witness)?,
            signature: decode_sig(witness.nth(0)?)?,
            sighash,
        }),
        SpendPath::Refund => Some(ProofMaterial::Refund {
            current_time,
            signature: Some(decode_sig(witness.nth(0)?)?),
            sighash,
        }),
    }
}
