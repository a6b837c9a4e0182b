//! HTLC escrows on the UTXO chain
//!
//! Funding spends P2WPKH outputs of the leg sender's wallet key into the HTLC
//! output (vout 0) plus change. Coin selection is largest-first. Every input
//! signals replaceability so a stuck funding or spend can be fee-bumped.

use std::str::FromStr;
use std::sync::Arc;

use bitcoin::consensus::encode::{deserialize_hex, serialize_hex};
use bitcoin::script::ScriptBuf;
use bitcoin::{
    absolute::LockTime, transaction::Version, Address, Amount, Network, OutPoint, PublicKey,
    Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use tracing::{debug, info, warn};

use super::{broadcast_error, EscrowTerms, Observation, ObservedSpend, SpendBroadcast};
use crate::chains::{ChainTx, Utxo, UtxoChainClient};
use crate::error::{SwapError, SwapResult};
use crate::htlc::spend::{self, SpendRequest, DUST_LIMIT};
use crate::htlc::{
    derive_address, AddressScheme, HtlcParams, RefundAuth, SpendPath, LOCKTIME_THRESHOLD,
    MAX_TIMELOCK,
};
use crate::signer::{p2wpkh_address, UtxoSigner};
use crate::types::{
    now_secs, BroadcastAttempt, Escrow, FundingInput, PresignedRefund, Secret, SpendKind,
    UtxoEscrow,
};

const TX_OVERHEAD_VBYTES: u64 = 11;
const P2WPKH_INPUT_VBYTES: u64 = 68;
const HTLC_OUTPUT_VBYTES: u64 = 43;
const CHANGE_OUTPUT_VBYTES: u64 = 31;

/// Deployment-wide HTLC settings
#[derive(Debug, Clone, Copy)]
pub struct UtxoEscrowSettings {
    pub network: Network,
    pub refund_auth: RefundAuth,
    pub address_scheme: AddressScheme,
    pub fee_target_blocks: u16,
}

/// Escrow record of an HTLC funded by `funding`
fn htlc_escrow(
    terms: EscrowTerms,
    address: &Address,
    script: &ScriptBuf,
    funding: BroadcastAttempt,
    inputs: Vec<FundingInput>,
) -> Escrow {
    let mut escrow = terms.into_escrow(address.to_string(), funding);
    escrow.utxo = Some(UtxoEscrow {
        script: script.to_hex_string(),
        vout: 0,
        inputs,
        spend: None,
        presigned_refunds: Vec::new(),
    });
    escrow
}

pub fn parse_pubkey(raw: &str) -> SwapResult<PublicKey> {
    let key = PublicKey::from_str(raw.trim())
        .map_err(|e| SwapError::Validation(format!("invalid public key {}: {}", raw, e)))?;
    if !key.compressed {
        return Err(SwapError::Validation(format!(
            "public key {} must be compressed",
            raw
        )));
    }
    Ok(key)
}

/// Absolute timestamp locktime for a cancellation deadline
pub fn timestamp_locktime(cancellation_at: u64) -> SwapResult<u32> {
    u32::try_from(cancellation_at)
        .ok()
        .filter(|t| (LOCKTIME_THRESHOLD..=MAX_TIMELOCK).contains(t))
        .ok_or_else(|| {
            SwapError::Validation(format!(
                "cancellation time {} is not a valid timestamp locktime",
                cancellation_at
            ))
        })
}

pub fn funding_fee(inputs: usize, fee_rate: u64, with_change: bool) -> u64 {
    let mut vbytes = TX_OVERHEAD_VBYTES + P2WPKH_INPUT_VBYTES * inputs as u64 + HTLC_OUTPUT_VBYTES;
    if with_change {
        vbytes += CHANGE_OUTPUT_VBYTES;
    }
    fee_rate.saturating_mul(vbytes)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinSelection {
    pub inputs: Vec<Utxo>,
    pub fee: u64,
    /// Zero when the excess was below dust and went to the fee
    pub change: u64,
}

/// Largest-first selection covering `amount` plus fee at `fee_rate`
pub fn select_coins(mut utxos: Vec<Utxo>, amount: u64, fee_rate: u64) -> SwapResult<CoinSelection> {
    utxos.sort_by(|a, b| b.value.cmp(&a.value));
    let available: u64 = utxos.iter().map(|u| u.value.to_sat()).sum();

    let mut total = 0u64;
    for n in 1..=utxos.len() {
        total += utxos[n - 1].value.to_sat();
        if let Some(split) = split_change(total, amount, n, fee_rate) {
            utxos.truncate(n);
            return Ok(CoinSelection {
                inputs: utxos,
                fee: split.0,
                change: split.1,
            });
        }
    }

    Err(SwapError::InsufficientFunds {
        needed: amount.saturating_add(funding_fee(utxos.len().max(1), fee_rate, true)),
        available,
    })
}

/// (fee, change) for `inputs` inputs worth `total`, or None if they don't cover
fn split_change(total: u64, amount: u64, inputs: usize, fee_rate: u64) -> Option<(u64, u64)> {
    let with_change = funding_fee(inputs, fee_rate, true);
    if let Some(change) = total.checked_sub(amount.saturating_add(with_change)) {
        if change >= DUST_LIMIT {
            return Some((with_change, change));
        }
    }
    let without_change = funding_fee(inputs, fee_rate, false);
    total
        .checked_sub(amount.saturating_add(without_change))
        .map(|excess| (without_change + excess, 0))
}

/// Which address scheme `escrow.address` was derived with
fn scheme_of(escrow: &Escrow, script: &ScriptBuf, network: Network) -> AddressScheme {
    if derive_address(script, AddressScheme::P2shP2wsh, network).to_string() == escrow.address {
        AddressScheme::P2shP2wsh
    } else {
        AddressScheme::P2wsh
    }
}

fn sats(amount: u128) -> SwapResult<u64> {
    u64::try_from(amount)
        .map_err(|_| SwapError::Validation(format!("amount {} exceeds the UTXO supply range", amount)))
}

fn parse_txid(raw: &str) -> SwapResult<Txid> {
    Txid::from_str(raw).map_err(|e| SwapError::Failed(format!("corrupt txid {}: {}", raw, e)))
}

pub struct UtxoEscrows {
    client: Arc<dyn UtxoChainClient>,
    signer: Arc<dyn UtxoSigner>,
    settings: UtxoEscrowSettings,
}

impl UtxoEscrows {
    pub fn new(
        client: Arc<dyn UtxoChainClient>,
        signer: Arc<dyn UtxoSigner>,
        settings: UtxoEscrowSettings,
    ) -> Self {
        Self {
            client,
            signer,
            settings,
        }
    }

    pub fn client(&self) -> &Arc<dyn UtxoChainClient> {
        &self.client
    }

    pub fn settings(&self) -> &UtxoEscrowSettings {
        &self.settings
    }

    /// HTLC script and funding address for an escrow
    pub fn htlc_for(&self, terms: &EscrowTerms) -> SwapResult<(HtlcParams, ScriptBuf, Address)> {
        let params = HtlcParams {
            hashlock: terms.hashlock,
            recipient: parse_pubkey(&terms.recipient)?,
            sender: parse_pubkey(&terms.sender)?,
            timelock: timestamp_locktime(terms.cancellation_at)?,
        };
        let script = params.build();
        let address = derive_address(&script, self.settings.address_scheme, self.settings.network);
        Ok((params, script, address))
    }

    fn escrow_script(&self, escrow: &Escrow) -> SwapResult<(ScriptBuf, HtlcParams)> {
        let details = escrow
            .utxo
            .as_ref()
            .ok_or_else(|| SwapError::Failed(format!("escrow {} has no script", escrow.address)))?;
        let script = ScriptBuf::from_hex(&details.script)
            .map_err(|e| SwapError::Failed(format!("corrupt escrow script: {}", e)))?;
        let params = HtlcParams::parse(&script)?;
        Ok((script, params))
    }

    fn require_key(&self, pubkey: &PublicKey, role: &str) -> SwapResult<()> {
        if self.signer.has_key(pubkey) {
            Ok(())
        } else {
            Err(SwapError::InsufficientSignatureOrAllowance(format!(
                "no signing key for {} {}",
                role, pubkey
            )))
        }
    }

    pub async fn deploy(&self, terms: EscrowTerms) -> SwapResult<Escrow> {
        let (params, script, address) = self.htlc_for(&terms)?;
        let amount = sats(terms.amount)?;
        if amount < DUST_LIMIT {
            return Err(SwapError::Validation(format!(
                "escrow amount {} sat is below dust",
                amount
            )));
        }
        self.require_key(&params.sender, "utxo sender")?;

        let wallet = self.signer.wallet_address(&params.sender)?;
        if let Some((funding, inputs)) = self.existing_funding(&wallet, &address, amount).await? {
            info!(
                address = %address,
                txid = %funding.txid,
                "Adopting HTLC funding already on chain"
            );
            let (funding_txid, fee_rate) = (funding.txid.clone(), funding.fee_rate);
            let mut escrow = htlc_escrow(terms, &address, &script, funding, inputs);
            self.attach_presigned_refund(&mut escrow, &funding_txid, fee_rate);
            return Ok(escrow);
        }

        let utxos = self.client.get_spendable_outputs(&wallet).await?;
        let fee_rate = self
            .client
            .get_fee_estimate(self.settings.fee_target_blocks)
            .await?;
        let selection = select_coins(utxos, amount, fee_rate)?;
        let inputs: Vec<FundingInput> = selection
            .inputs
            .iter()
            .map(|u| FundingInput {
                txid: u.outpoint.txid.to_string(),
                vout: u.outpoint.vout,
                value: u.value.to_sat(),
            })
            .collect();

        debug!(
            address = %address,
            amount,
            fee = selection.fee,
            change = selection.change,
            inputs = inputs.len(),
            "Funding HTLC"
        );

        let broadcast = self
            .fund(&params.sender, &inputs, &address, amount, selection.change, fee_rate)
            .await?;

        let funding_txid = broadcast.txid.clone();
        let mut escrow = htlc_escrow(
            terms,
            &address,
            &script,
            BroadcastAttempt {
                txid: broadcast.txid,
                fee_rate,
                raw_tx: broadcast.raw_tx,
                broadcast_at: now_secs(),
            },
            inputs,
        );
        self.attach_presigned_refund(&mut escrow, &funding_txid, fee_rate);
        Ok(escrow)
    }

    /// A wallet transaction already paying `amount` into `htlc`.
    ///
    /// The HTLC address is a function of the escrow terms, so a deployment
    /// whose broadcast went through before an error finds its own funding
    /// here instead of paying the address twice.
    async fn existing_funding(
        &self,
        wallet: &Address,
        htlc: &Address,
        amount: u64,
    ) -> SwapResult<Option<(BroadcastAttempt, Vec<FundingInput>)>> {
        let htlc_script = htlc.script_pubkey();
        let history = self.client.get_tx_history(htlc).await?;
        let spent = |txid: &Txid| {
            history.iter().any(|t| {
                t.tx.input
                    .iter()
                    .any(|i| i.previous_output == OutPoint::new(*txid, 0))
            })
        };
        let candidates: Vec<&ChainTx> = history
            .iter()
            .filter(|t| {
                t.tx.output
                    .first()
                    .is_some_and(|o| o.script_pubkey == htlc_script && o.value.to_sat() == amount)
                    && !spent(&t.txid)
            })
            .collect();
        if candidates.is_empty() {
            return Ok(None);
        }

        let wallet_history = self.client.get_tx_history(wallet).await?;
        let wallet_script = wallet.script_pubkey();
        let prevout = |outpoint: &OutPoint| {
            wallet_history
                .iter()
                .find(|t| t.txid == outpoint.txid)
                .and_then(|t| t.tx.output.get(outpoint.vout as usize))
                .filter(|o| o.script_pubkey == wallet_script)
                .map(|o| o.value.to_sat())
        };

        for candidate in candidates {
            let inputs: Option<Vec<FundingInput>> = candidate
                .tx
                .input
                .iter()
                .map(|i| {
                    prevout(&i.previous_output).map(|value| FundingInput {
                        txid: i.previous_output.txid.to_string(),
                        vout: i.previous_output.vout,
                        value,
                    })
                })
                .collect();
            // Someone else paid the address
            let Some(inputs) = inputs.filter(|i| !i.is_empty()) else {
                continue;
            };
            let spent: u64 = inputs.iter().map(|i| i.value).sum();
            let paid: u64 = candidate.tx.output.iter().map(|o| o.value.to_sat()).sum();
            let vsize = candidate.tx.vsize().max(1) as u64;
            return Ok(Some((
                BroadcastAttempt {
                    txid: candidate.txid.to_string(),
                    fee_rate: spent.saturating_sub(paid) / vsize,
                    raw_tx: Some(serialize_hex(&candidate.tx)),
                    broadcast_at: now_secs(),
                },
                inputs,
            )));
        }
        Ok(None)
    }

    /// Sign the refund of `funding_txid` up front when refunds may be relayed
    /// by anyone. None for the sender-only family.
    pub fn presign_refund(
        &self,
        escrow: &Escrow,
        funding_txid: &str,
        fee_rate: u64,
    ) -> SwapResult<Option<PresignedRefund>> {
        if self.settings.refund_auth != RefundAuth::AnyoneAfterTimeout {
            return Ok(None);
        }
        let tx = self.sign_spend(escrow, funding_txid, SpendPath::Refund, None, fee_rate)?;
        Ok(Some(PresignedRefund {
            funding_txid: funding_txid.to_string(),
            fee_rate,
            raw_tx: serialize_hex(&tx),
        }))
    }

    /// Keep a presigned refund of a just-broadcast funding with the escrow.
    ///
    /// The funding is already out, so a signing failure only costs the
    /// relayable refund; the sender key can still refund later.
    pub fn attach_presigned_refund(&self, escrow: &mut Escrow, funding_txid: &str, fee_rate: u64) {
        match self.presign_refund(escrow, funding_txid, fee_rate) {
            Ok(Some(refund)) => {
                if let Some(details) = escrow.utxo.as_mut() {
                    details.presigned_refunds.push(refund);
                }
            }
            Ok(None) => {}
            Err(e) => warn!(
                address = %escrow.address,
                funding_txid,
                error = %e,
                "Could not presign refund"
            ),
        }
    }

    async fn fund(
        &self,
        sender: &PublicKey,
        inputs: &[FundingInput],
        htlc: &Address,
        amount: u64,
        change: u64,
        fee_rate: u64,
    ) -> SwapResult<SpendBroadcast> {
        let wallet = self.signer.wallet_address(sender)?;
        let mut output = vec![TxOut {
            value: Amount::from_sat(amount),
            script_pubkey: htlc.script_pubkey(),
        }];
        if change > 0 {
            output.push(TxOut {
                value: Amount::from_sat(change),
                script_pubkey: wallet.script_pubkey(),
            });
        }
        let input = inputs
            .iter()
            .map(|i| {
                Ok(TxIn {
                    previous_output: OutPoint::new(parse_txid(&i.txid)?, i.vout),
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Witness::new(),
                })
            })
            .collect::<SwapResult<Vec<_>>>()?;

        let mut tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input,
            output,
        };
        for (index, i) in inputs.iter().enumerate() {
            self.signer
                .sign_p2wpkh_input(sender, &mut tx, index, Amount::from_sat(i.value))?;
        }

        let txid = self.client.broadcast(&tx).await.map_err(broadcast_error)?;
        Ok(SpendBroadcast {
            txid: txid.to_string(),
            fee_rate,
            raw_tx: Some(serialize_hex(&tx)),
        })
    }

    /// Funding transaction over the same inputs at a higher fee rate
    pub async fn rebuild_funding(&self, escrow: &Escrow, fee_rate: u64) -> SwapResult<SpendBroadcast> {
        let (_, params) = self.escrow_script(escrow)?;
        let inputs = escrow
            .utxo
            .as_ref()
            .map(|u| u.inputs.clone())
            .unwrap_or_default();
        let amount = sats(escrow.amount)?;
        let total: u64 = inputs.iter().map(|i| i.value).sum();
        let (_, change) = split_change(total, amount, inputs.len(), fee_rate).ok_or(
            SwapError::InsufficientFunds {
                needed: amount.saturating_add(funding_fee(inputs.len(), fee_rate, false)),
                available: total,
            },
        )?;
        let htlc = Address::from_str(&escrow.address)
            .map_err(|e| SwapError::Failed(format!("corrupt escrow address: {}", e)))?
            .require_network(self.settings.network)
            .map_err(|e| SwapError::Failed(format!("escrow address network: {}", e)))?;
        self.require_key(&params.sender, "utxo sender")?;
        self.fund(&params.sender, &inputs, &htlc, amount, change, fee_rate)
            .await
    }

    /// Signed spend of the HTLC output created by `funding_txid`
    fn sign_spend(
        &self,
        escrow: &Escrow,
        funding_txid: &str,
        path: SpendPath,
        secret: Option<&Secret>,
        fee_rate: u64,
    ) -> SwapResult<Transaction> {
        let (script, params) = self.escrow_script(escrow)?;
        let vout = escrow.utxo.as_ref().map(|u| u.vout).unwrap_or(0);
        let value = Amount::from_sat(sats(escrow.amount)?);

        // Each branch pays the key that signs it
        let key = match path {
            SpendPath::Redeem => params.recipient,
            SpendPath::Refund => params.sender,
        };
        self.require_key(&key, "htlc spender")?;

        let request = SpendRequest {
            outpoint: OutPoint::new(parse_txid(funding_txid)?, vout),
            value,
            destination: p2wpkh_address(&key, self.settings.network)?.script_pubkey(),
            fee_rate,
            path,
            timelock: params.timelock,
            script_sig: spend::script_sig(&script, scheme_of(escrow, &script, self.settings.network))?,
        };
        let mut tx = request.unsigned_tx()?;
        let sighash = spend::sighash(&tx, 0, &script, value)?;
        let signature = self.signer.sign_htlc_input(&key, &sighash)?;

        tx.input[0].witness = match path {
            SpendPath::Redeem => {
                let secret = secret.ok_or_else(|| {
                    SwapError::NotReady("redeem requires the secret".to_string())
                })?;
                spend::redeem_witness(&signature, secret, &script)
            }
            SpendPath::Refund => spend::refund_witness(&signature, &script),
        };
        Ok(tx)
    }

    async fn broadcast_spend(
        &self,
        tx: &Transaction,
        path: SpendPath,
        fee_rate: u64,
    ) -> SwapResult<SpendBroadcast> {
        let txid = self.client.broadcast(tx).await.map_err(broadcast_error)?;
        debug!(txid = %txid, path = ?path, fee_rate, "HTLC spend broadcast");
        Ok(SpendBroadcast {
            txid: txid.to_string(),
            fee_rate,
            raw_tx: Some(serialize_hex(tx)),
        })
    }

    async fn spend(
        &self,
        escrow: &Escrow,
        path: SpendPath,
        secret: Option<&Secret>,
        fee_rate: u64,
    ) -> SwapResult<SpendBroadcast> {
        let funding_txid = escrow
            .funding
            .effective_txid()
            .ok_or_else(|| SwapError::NotReady(format!("escrow {} is not funded", escrow.address)))?;
        let tx = self.sign_spend(escrow, funding_txid, path, secret, fee_rate)?;
        self.broadcast_spend(&tx, path, fee_rate).await
    }

    pub async fn withdraw(&self, escrow: &Escrow, secret: &Secret) -> SwapResult<SpendBroadcast> {
        let fee_rate = self
            .client
            .get_fee_estimate(self.settings.fee_target_blocks)
            .await?;
        self.spend(escrow, SpendPath::Redeem, Some(secret), fee_rate)
            .await
    }

    pub async fn cancel(&self, escrow: &Escrow) -> SwapResult<SpendBroadcast> {
        // CLTV is checked against median time past, which trails wall clock
        let median_time = self.client.get_median_time().await?;
        let (_, params) = self.escrow_script(escrow)?;
        if median_time < params.timelock {
            return Err(SwapError::NotReady(format!(
                "chain time {} has not reached timelock {}",
                median_time, params.timelock
            )));
        }

        let presigned = escrow
            .utxo
            .as_ref()
            .zip(escrow.funding.effective_txid())
            .and_then(|(details, txid)| details.presigned_refund(txid));
        if let Some(refund) = presigned {
            let tx: Transaction = deserialize_hex(&refund.raw_tx)
                .map_err(|e| SwapError::Failed(format!("corrupt presigned refund: {}", e)))?;
            return self
                .broadcast_spend(&tx, SpendPath::Refund, refund.fee_rate)
                .await;
        }

        let fee_rate = self
            .client
            .get_fee_estimate(self.settings.fee_target_blocks)
            .await?;
        self.spend(escrow, SpendPath::Refund, None, fee_rate).await
    }

    /// Replacement of the escrow's pending spend at `fee_rate`
    pub async fn respend(
        &self,
        escrow: &Escrow,
        kind: SpendKind,
        fee_rate: u64,
        secret: Option<&Secret>,
    ) -> SwapResult<SpendBroadcast> {
        let path = match kind {
            SpendKind::Redeem => SpendPath::Redeem,
            SpendKind::Refund => SpendPath::Refund,
        };
        self.spend(escrow, path, secret, fee_rate).await
    }

    pub async fn observe(&self, escrow: &Escrow) -> SwapResult<Observation> {
        let address = Address::from_str(&escrow.address)
            .map_err(|e| SwapError::Failed(format!("corrupt escrow address: {}", e)))?
            .require_network(self.settings.network)
            .map_err(|e| SwapError::Failed(format!("escrow address network: {}", e)))?;
        let script_pubkey = address.script_pubkey();
        let vout = escrow.utxo.as_ref().map(|u| u.vout).unwrap_or(0);

        let history = self.client.get_tx_history(&address).await?;
        let tip = self.client.get_height().await?;

        let mut observation = Observation::default();
        for entry in &history {
            let txid = entry.txid.to_string();
            let pays_htlc = entry
                .tx
                .output
                .iter()
                .any(|o| o.script_pubkey == script_pubkey);
            if pays_htlc && escrow.funding.contains(&txid) {
                observation.funded = true;
                if entry.block_height.is_some() {
                    observation.confirmations = entry.confirmations(tip);
                    observation.funding_txid = Some(txid.clone());
                }
            }

            for input in &entry.tx.input {
                let prev = input.previous_output;
                if prev.vout != vout || !escrow.funding.contains(&prev.txid.to_string()) {
                    continue;
                }
                let kind = match spend::spend_path(&input.witness) {
                    Some(SpendPath::Redeem) => SpendKind::Redeem,
                    Some(SpendPath::Refund) => SpendKind::Refund,
                    None => continue,
                };
                let candidate = ObservedSpend {
                    kind,
                    txid: Some(txid.clone()),
                    secret: spend::extract_secret(&input.witness),
                    confirmed: entry.block_height.is_some(),
                };
                // A confirmed spend beats any mempool conflict
                let replace = match &observation.spend {
                    None => true,
                    Some(existing) => !existing.confirmed && candidate.confirmed,
                };
                if replace {
                    observation.spend = Some(candidate);
                }
            }
        }
        Ok(observation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    fn utxo(n: u8, sats: u64) -> Utxo {
        Utxo {
            outpoint: OutPoint::new(Txid::from_byte_array([n; 32]), 0),
            value: Amount::from_sat(sats),
            confirmations: 1,
        }
    }

    #[test]
    fn test_select_largest_first() {
        let selection = select_coins(
            vec![utxo(1, 5_000), utxo(2, 50_000), utxo(3, 20_000)],
            30_000,
            2,
        )
        .unwrap();
        assert_eq!(selection.inputs.len(), 1);
        assert_eq!(selection.inputs[0].value.to_sat(), 50_000);
        assert_eq!(selection.fee, funding_fee(1, 2, true));
        assert_eq!(selection.change, 50_000 - 30_000 - selection.fee);
    }

    #[test]
    fn test_select_multiple_inputs() {
        let selection =
            select_coins(vec![utxo(1, 20_000), utxo(2, 15_000)], 30_000, 1).unwrap();
        assert_eq!(selection.inputs.len(), 2);
        let total: u64 = selection.inputs.iter().map(|u| u.value.to_sat()).sum();
        assert_eq!(total, 30_000 + selection.fee + selection.change);
    }

    #[test]
    fn test_dust_change_goes_to_fee() {
        let fee = funding_fee(1, 1, false);
        let selection = select_coins(vec![utxo(1, 10_000 + fee + 100)], 10_000, 1).unwrap();
        assert_eq!(selection.change, 0);
        assert_eq!(selection.fee, fee + 100);
    }

    #[test]
    fn test_insufficient_funds() {
        let err = select_coins(vec![utxo(1, 1_000)], 10_000, 1).unwrap_err();
        assert!(matches!(
            err,
            SwapError::InsufficientFunds {
                available: 1_000,
                ..
            }
        ));
        assert!(select_coins(vec![], 1, 1).is_err());
    }

    #[test]
    fn test_timestamp_locktime() {
        assert_eq!(timestamp_locktime(1_800_000_000).unwrap(), 1_800_000_000);
        assert!(timestamp_locktime(800_000).is_err());
        assert!(timestamp_locktime(u64::from(u32::MAX) + 1).is_err());
        // Past 2038 the CLTV operand no longer fits a 4-byte script number
        assert!(timestamp_locktime(u64::from(MAX_TIMELOCK) + 1).is_err());
    }

    #[test]
    fn test_parse_pubkey() {
        let hex = "02c6047f9441ed7d6d3045406e95c07cd85c778e4b8cef3ca7abac09b95c709ee5";
        assert!(parse_pubkey(hex).is_ok());
        assert!(parse_pubkey("02abcd").is_err());
        let uncompressed = "04c6047f9441ed7d6d3045406e95c07cd85c778e4b8cef3ca7abac09b95c709ee51ae168fea63dc339a3c58419466ceaeef7f632653266d0e1236431a950cfe52a";
        assert!(parse_pubkey(uncompressed).is_err());
    }
}
