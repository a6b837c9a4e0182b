//! HTLC script construction, parsing and local validation
//!
//! Script layout (witness script of a P2WSH output):
//!
//! ```text
//! OP_IF
//!     OP_SHA256 <hashlock> OP_EQUALVERIFY <recipient> OP_CHECKSIG
//! OP_ELSE
//!     <timelock> OP_CHECKLOCKTIMEVERIFY OP_DROP <sender> OP_CHECKSIG
//! OP_ENDIF
//! ```
//!
//! The refund branch always needs the sender's signature, so the script alone
//! never lets a third party pick where refunded value goes. With
//! [`RefundAuth::AnyoneAfterTimeout`] the sender signs the refund transaction
//! (`SIGHASH_ALL`, paying the sender's wallet) as soon as the escrow is funded
//! and the signed transaction is kept with the escrow. Anyone holding it can
//! broadcast it once the timelock passes, even if the sender key is gone, but
//! cannot change its outputs.

pub mod spend;

use std::fmt;
use std::str::FromStr;

use bitcoin::blockdata::opcodes::all::{
    OP_CHECKSIG, OP_CLTV, OP_DROP, OP_ELSE, OP_ENDIF, OP_EQUALVERIFY, OP_IF, OP_SHA256,
};
use bitcoin::blockdata::script::{read_scriptint, Builder, Instruction, Script, ScriptBuf};
use bitcoin::secp256k1::{ecdsa, Message, Secp256k1, Verification};
use bitcoin::{Address, Network, PublicKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::SwapError;
use crate::hashlock;
use crate::types::{HashLock, Secret};

/// Locktimes below this are block heights, at or above it unix timestamps
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Largest timelock that fits the 4-byte script number CLTV reads
pub const MAX_TIMELOCK: u32 = i32::MAX as u32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HtlcError {
    #[error("script does not match the HTLC template: {0}")]
    Template(String),

    #[error("invalid public key: {0}")]
    PublicKey(String),

    #[error("invalid timelock {0}")]
    Timelock(i64),

    #[error("sighash computation failed: {0}")]
    Sighash(String),
}

impl From<HtlcError> for SwapError {
    fn from(e: HtlcError) -> Self {
        SwapError::Validation(e.to_string())
    }
}

/// Who may broadcast the refund after the timelock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundAuth {
    /// The sender signs the refund when it is needed
    #[default]
    Sender,
    /// The refund is signed up front and can be relayed by anyone
    AnyoneAfterTimeout,
}

impl FromStr for RefundAuth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sender" => Ok(RefundAuth::Sender),
            "anyone" | "anyone_after_timeout" => Ok(RefundAuth::AnyoneAfterTimeout),
            other => Err(format!("unknown refund authorization '{}'", other)),
        }
    }
}

impl fmt::Display for RefundAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefundAuth::Sender => f.write_str("sender"),
            RefundAuth::AnyoneAfterTimeout => f.write_str("anyone_after_timeout"),
        }
    }
}

/// Hashed-script address schemes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressScheme {
    #[default]
    P2wsh,
    P2shP2wsh,
}

impl FromStr for AddressScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "p2wsh" => Ok(AddressScheme::P2wsh),
            "p2sh-p2wsh" | "p2sh_p2wsh" => Ok(AddressScheme::P2shP2wsh),
            other => Err(format!("unknown address scheme '{}'", other)),
        }
    }
}

/// Inputs to the HTLC script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtlcParams {
    pub hashlock: HashLock,
    pub recipient: PublicKey,
    pub sender: PublicKey,
    /// Absolute locktime (block height or unix time)
    pub timelock: u32,
}

impl HtlcParams {
    pub fn build(&self) -> ScriptBuf {
        Builder::new()
            .push_opcode(OP_IF)
            .push_opcode(OP_SHA256)
            .push_slice(self.hashlock.0)
            .push_opcode(OP_EQUALVERIFY)
            .push_key(&self.recipient)
            .push_opcode(OP_CHECKSIG)
            .push_opcode(OP_ELSE)
            .push_int(self.timelock as i64)
            .push_opcode(OP_CLTV)
            .push_opcode(OP_DROP)
            .push_key(&self.sender)
            .push_opcode(OP_CHECKSIG)
            .push_opcode(OP_ENDIF)
            .into_script()
    }

    /// Recover the parameters of a script built by [`HtlcParams::build`]
    pub fn parse(script: &Script) -> Result<Self, HtlcError> {
        let items = script
            .instructions()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| HtlcError::Template(e.to_string()))?;

        let op = |i: usize, expected: bitcoin::opcodes::Opcode| -> Result<(), HtlcError> {
            match items.get(i) {
                Some(Instruction::Op(o)) if *o == expected => Ok(()),
                other => Err(HtlcError::Template(format!(
                    "expected {:?} at {}, found {:?}",
                    expected, i, other
                ))),
            }
        };
        let push = |i: usize| -> Result<&[u8], HtlcError> {
            match items.get(i) {
                Some(Instruction::PushBytes(b)) => Ok(b.as_bytes()),
                other => Err(HtlcError::Template(format!(
                    "expected push at {}, found {:?}",
                    i, other
                ))),
            }
        };
        let key = |bytes: &[u8]| {
            PublicKey::from_slice(bytes).map_err(|e| HtlcError::PublicKey(e.to_string()))
        };

        op(0, OP_IF)?;
        op(1, OP_SHA256)?;
        let hashlock: [u8; 32] = push(2)?
            .try_into()
            .map_err(|_| HtlcError::Template("hashlock must be 32 bytes".to_string()))?;
        op(3, OP_EQUALVERIFY)?;
        let recipient = key(push(4)?)?;
        op(5, OP_CHECKSIG)?;
        op(6, OP_ELSE)?;
        let raw_timelock = read_scriptint(push(7)?)
            .map_err(|e| HtlcError::Template(format!("timelock is not a script number: {}", e)))?;
        let timelock =
            u32::try_from(raw_timelock).map_err(|_| HtlcError::Timelock(raw_timelock))?;
        op(8, OP_CLTV)?;
        op(9, OP_DROP)?;
        let sender = key(push(10)?)?;
        op(11, OP_CHECKSIG)?;
        op(12, OP_ENDIF)?;
        if items.len() != 13 {
            return Err(HtlcError::Template("trailing instructions".to_string()));
        }

        Ok(Self {
            hashlock: HashLock(hashlock),
            recipient,
            sender,
            timelock,
        })
    }
}

/// Funding address of an HTLC script
pub fn derive_address(script: &Script, scheme: AddressScheme, network: Network) -> Address {
    match scheme {
        AddressScheme::P2wsh => Address::p2wsh(script, network),
        AddressScheme::P2shP2wsh => Address::p2shwsh(script, network),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpendPath {
    Redeem,
    Refund,
}

/// Material a spender presents for one branch
#[derive(Debug, Clone)]
pub enum ProofMaterial {
    Redeem {
        secret: Secret,
        signature: ecdsa::Signature,
        sighash: [u8; 32],
    },
    Refund {
        /// Chain time (or height) the spend is evaluated at
        current_time: u32,
        signature: Option<ecdsa::Signature>,
        sighash: [u8; 32],
    },
}

impl ProofMaterial {
    pub fn path(&self) -> SpendPath {
        match self {
            ProofMaterial::Redeem { .. } => SpendPath::Redeem,
            ProofMaterial::Refund { .. } => SpendPath::Refund,
        }
    }
}

/// Local pre-check: would `proof` satisfy `path` of `script`?
///
/// Chain consensus re-validates independently; this is what the watcher
/// and tests rely on before acting on a spend.
pub fn validate<C: Verification>(
    secp: &Secp256k1<C>,
    script: &Script,
    path: SpendPath,
    proof: &ProofMaterial,
) -> bool {
    if proof.path() != path {
        return false;
    }
    let Ok(params) = HtlcParams::parse(script) else {
        return false;
    };

    match proof {
        ProofMaterial::Redeem {
            secret,
            signature,
            sighash,
        } => {
            hashlock::validate(secret, &params.hashlock)
                && verify_sig(secp, sighash, signature, &params.recipient)
        }
        ProofMaterial::Refund {
            current_time,
            signature,
            sighash,
        } => {
            timelock_reached(params.timelock, *current_time)
                && signature
                    .as_ref()
                    .is_some_and(|sig| verify_sig(secp, sighash, sig, &params.sender))
        }
    }
}

/// CLTV semantics: both values must be the same kind (height vs time)
pub fn timelock_reached(timelock: u32, current: u32) -> bool {
    let same_kind = (timelock < LOCKTIME_THRESHOLD) == (current < LOCKTIME_THRESHOLD);
    same_kind && current >= timelock
}

fn verify_sig<C: Verification>(
    secp: &Secp256k1<C>,
    sighash: &[u8; 32],
    signature: &ecdsa::Signature,
    key: &PublicKey,
) -> bool {
    let msg = Message::from_digest(*sighash);
    secp.verify_ecdsa(&msg, signature, &key.inner).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::SecretKey;

    pub(crate) fn keypair(seed: u8) -> (SecretKey, PublicKey) {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[seed; 32]).unwrap();
        let pk = PublicKey::new(sk.public_key(&secp));
        (sk, pk)
    }

    fn params() -> (HtlcParams, Secret, SecretKey, SecretKey) {
        let secret = hashlock::generate_secret();
        let (recipient_sk, recipient) = keypair(1);
        let (sender_sk, sender) = keypair(2);
        (
            HtlcParams {
                hashlock: hashlock::hash(&secret),
                recipient,
                sender,
                timelock: 1_700_000_000,
            },
            secret,
            recipient_sk,
            sender_sk,
        )
    }

    fn sign(sk: &SecretKey, sighash: [u8; 32]) -> ecdsa::Signature {
        Secp256k1::new().sign_ecdsa(&Message::from_digest(sighash), sk)
    }

    #[test]
    fn test_build_parse_round_trip() {
        let (mut p, _, _, _) = params();
        for timelock in [1_700_000_000, MAX_TIMELOCK, 800_000] {
            p.timelock = timelock;
            assert_eq!(HtlcParams::parse(&p.build()).unwrap(), p);
        }
    }

    #[test]
    fn test_parse_rejects_foreign_script() {
        use bitcoin::blockdata::opcodes::all::OP_PUSHNUM_1;

        let script = Builder::new().push_opcode(OP_PUSHNUM_1).into_script();
        assert!(HtlcParams::parse(&script).is_err());

        // Refund branch that commits to no signature
        let (p, _, _, _) = params();
        let unsigned = Builder::new()
            .push_opcode(OP_IF)
            .push_opcode(OP_SHA256)
            .push_slice(p.hashlock.0)
            .push_opcode(OP_EQUALVERIFY)
            .push_key(&p.recipient)
            .push_opcode(OP_CHECKSIG)
            .push_opcode(OP_ELSE)
            .push_int(p.timelock as i64)
            .push_opcode(OP_CLTV)
            .push_opcode(OP_DROP)
            .push_key(&p.sender)
            .push_opcode(OP_DROP)
            .push_opcode(OP_PUSHNUM_1)
            .push_opcode(OP_ENDIF)
            .into_script();
        assert!(HtlcParams::parse(&unsigned).is_err());
    }

    #[test]
    fn test_parse_rejects_oversized_timelock() {
        let (p, _, _, _) = params();
        let mut script = p.build().to_bytes();
        // Widen the 4-byte timelock push that follows OP_ELSE to 5 bytes
        let at = 72;
        assert_eq!(script[at - 1], OP_ELSE.to_u8());
        assert_eq!(script[at], 0x04);
        script[at] = 0x05;
        script.insert(at + 5, 0x00);
        assert!(HtlcParams::parse(Script::from_bytes(&script)).is_err());
    }

    #[test]
    fn test_script_layout() {
        let (p, _, _, _) = params();
        let asm = p.build().to_asm_string();
        assert!(asm.starts_with("OP_IF OP_SHA256"));
        assert!(asm.contains("OP_CLTV OP_DROP"));
        assert!(asm.ends_with("OP_CHECKSIG OP_ENDIF"));
    }

    #[test]
    fn test_derive_address_is_deterministic() {
        let (p, _, _, _) = params();
        let a = derive_address(&p.build(), AddressScheme::P2wsh, Network::Regtest);
        let b = derive_address(&p.build(), AddressScheme::P2wsh, Network::Regtest);
        assert_eq!(a, b);
        assert!(a.to_string().starts_with("bcrt1q"));
        let wrapped = derive_address(&p.build(), AddressScheme::P2shP2wsh, Network::Regtest);
        assert_ne!(a, wrapped);
    }

    #[test]
    fn test_redeem_path_requires_secret_and_recipient_sig() {
        let secp = Secp256k1::new();
        let (p, secret, recipient_sk, sender_sk) = params();
        let script = p.build();
        let sighash = [42u8; 32];

        let good = ProofMaterial::Redeem {
            secret,
            signature: sign(&recipient_sk, sighash),
            sighash,
        };
        assert!(validate(&secp, &script, SpendPath::Redeem, &good));
        // The same material never satisfies the other branch
        assert!(!validate(&secp, &script, SpendPath::Refund, &good));

        let wrong_secret = ProofMaterial::Redeem {
            secret: hashlock::generate_secret(),
            signature: sign(&recipient_sk, sighash),
            sighash,
        };
        assert!(!validate(&secp, &script, SpendPath::Redeem, &wrong_secret));

        let wrong_signer = ProofMaterial::Redeem {
            secret,
            signature: sign(&sender_sk, sighash),
            sighash,
        };
        assert!(!validate(&secp, &script, SpendPath::Redeem, &wrong_signer));
    }

    #[test]
    fn test_refund_path_requires_timelock_and_sender_sig() {
        let secp = Secp256k1::new();
        let (p, _, recipient_sk, sender_sk) = params();
        let script = p.build();
        let sighash = [7u8; 32];

        let at = |t: u32, sk: &SecretKey| ProofMaterial::Refund {
            current_time: t,
            signature: Some(sign(sk, sighash)),
            sighash,
        };

        assert!(!validate(&secp, &script, SpendPath::Refund, &at(p.timelock - 1, &sender_sk)));
        assert!(validate(&secp, &script, SpendPath::Refund, &at(p.timelock, &sender_sk)));
        assert!(validate(&secp, &script, SpendPath::Refund, &at(p.timelock + 60, &sender_sk)));
        assert!(!validate(&secp, &script, SpendPath::Refund, &at(p.timelock, &recipient_sk)));
        assert!(!validate(
            &secp,
            &script,
            SpendPath::Redeem,
            &at(p.timelock, &sender_sk)
        ));

        let unsigned = ProofMaterial::Refund {
            current_time: p.timelock,
            signature: None,
            sighash,
        };
        assert!(!validate(&secp, &script, SpendPath::Refund, &unsigned));
    }

    #[test]
    fn test_timelock_kinds_do_not_mix() {
        assert!(!timelock_reached(100, 1_700_000_000));
        assert!(timelock_reached(100, 101));
        assert!(!timelock_reached(1_700_000_000, 100));
    }

    #[test]
    fn test_refund_auth_from_str() {
        assert_eq!("sender".parse::<RefundAuth>().unwrap(), RefundAuth::Sender);
        assert_eq!(
            "anyone".parse::<RefundAuth>().unwrap(),
            RefundAuth::AnyoneAfterTimeout
        );
        assert!("nobody".parse::<RefundAuth>().is_err());
    }
}
