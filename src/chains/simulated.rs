//! In-process simulated chains
//!
//! Used by the integration tests and by `CHAIN_MODE=simulated`. The UTXO
//! simulation tracks outputs, mempool replacement and locktime finality but
//! does not execute scripts; the account simulation mirrors the escrow
//! contract's checks (maker authorization, hashlock, cancellation time).

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use alloy::primitives::{Address as AccountAddress, B256};
use async_trait::async_trait;
use bitcoin::{Address, Amount, OutPoint, ScriptBuf, Transaction, TxOut, Txid};
use tracing::debug;

use super::evm::escrow_address;
use super::{
    AccountChainClient, ChainTx, EscrowDeployment, EscrowParams, EscrowStatus, Utxo,
    UtxoChainClient,
};
use crate::error::ChainError;
use crate::hash::keccak256;
use crate::hashlock;
use crate::htlc::LOCKTIME_THRESHOLD;
use crate::types::{now_secs, Secret, Side};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// UTXO chain
// ============================================================================

#[derive(Debug, Clone)]
struct OutputEntry {
    txout: TxOut,
    spent_by: Option<Txid>,
}

#[derive(Debug, Clone)]
struct TxEntry {
    tx: Transaction,
    height: Option<u32>,
    fee: u64,
}

#[derive(Debug)]
struct UtxoState {
    height: u32,
    median_time: Option<u32>,
    outputs: HashMap<OutPoint, OutputEntry>,
    txs: HashMap<Txid, TxEntry>,
    order: Vec<Txid>,
    auto_mine: bool,
    fail_next: u32,
    broadcasts: u64,
    fee_rate: u64,
    faucet_nonce: u32,
}

pub struct SimulatedUtxoChain {
    state: Mutex<UtxoState>,
}

impl Default for SimulatedUtxoChain {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedUtxoChain {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(UtxoState {
                height: 100,
                median_time: None,
                outputs: HashMap::new(),
                txs: HashMap::new(),
                order: Vec::new(),
                auto_mine: true,
                fail_next: 0,
                broadcasts: 0,
                fee_rate: 2,
                faucet_nonce: 0,
            }),
        }
    }

    /// Create a confirmed output paying `sats` to `address`
    pub fn fund_address(&self, address: &Address, sats: u64) -> OutPoint {
        let mut s = lock(&self.state);
        s.faucet_nonce += 1;
        let tx = Transaction {
            version: bitcoin::transaction::Version::ONE,
            lock_time: bitcoin::absolute::LockTime::from_consensus(s.faucet_nonce),
            input: vec![],
            output: vec![TxOut {
                value: Amount::from_sat(sats),
                script_pubkey: address.script_pubkey(),
            }],
        };
        let txid = tx.compute_txid();
        let outpoint = OutPoint::new(txid, 0);
        s.height += 1;
        let height = s.height;
        s.outputs.insert(
            outpoint,
            OutputEntry {
                txout: tx.output[0].clone(),
                spent_by: None,
            },
        );
        s.txs.insert(
            txid,
            TxEntry {
                tx,
                height: Some(height),
                fee: 0,
            },
        );
        s.order.push(txid);
        outpoint
    }

    /// Mine `blocks` blocks; the first one includes the whole mempool
    pub fn mine(&self, blocks: u32) {
        let mut s = lock(&self.state);
        for i in 0..blocks {
            s.height += 1;
            if i == 0 {
                let height = s.height;
                for entry in s.txs.values_mut() {
                    if entry.height.is_none() {
                        entry.height = Some(height);
                    }
                }
            }
        }
    }

    /// When off, broadcasts stay in the mempool until [`Self::mine`]
    pub fn set_auto_mine(&self, enabled: bool) {
        lock(&self.state).auto_mine = enabled;
    }

    /// Fail the next `n` client calls with a transport error
    pub fn fail_next(&self, n: u32) {
        lock(&self.state).fail_next = n;
    }

    pub fn set_fee_rate(&self, sat_per_vb: u64) {
        lock(&self.state).fee_rate = sat_per_vb;
    }

    /// Override the chain clock used for timestamp locktimes
    pub fn set_median_time(&self, time: Option<u32>) {
        lock(&self.state).median_time = time;
    }

    /// Number of accepted broadcasts
    pub fn broadcast_count(&self) -> u64 {
        lock(&self.state).broadcasts
    }

    pub fn mempool_len(&self) -> usize {
        lock(&self.state)
            .txs
            .values()
            .filter(|t| t.height.is_none())
            .count()
    }

    pub fn is_confirmed(&self, txid: &Txid) -> bool {
        lock(&self.state)
            .txs
            .get(txid)
            .is_some_and(|t| t.height.is_some())
    }

    pub fn balance(&self, address: &Address) -> u64 {
        let script = address.script_pubkey();
        lock(&self.state)
            .outputs
            .values()
            .filter(|o| o.spent_by.is_none() && o.txout.script_pubkey == script)
            .map(|o| o.txout.value.to_sat())
            .sum()
    }

    fn take_failure(s: &mut UtxoState) -> Result<(), ChainError> {
        if s.fail_next > 0 {
            s.fail_next -= 1;
            return Err(ChainError::Transport(
                "connection reset by peer (simulated)".to_string(),
            ));
        }
        Ok(())
    }

    fn chain_time(s: &UtxoState) -> u32 {
        s.median_time.unwrap_or_else(|| now_secs() as u32)
    }

    /// Remove a mempool tx and everything spending its outputs
    fn evict(s: &mut UtxoState, txid: Txid) {
        let Some(entry) = s.txs.remove(&txid) else {
            return;
        };
        s.order.retain(|t| *t != txid);
        for input in &entry.tx.input {
            if let Some(prev) = s.outputs.get_mut(&input.previous_output) {
                if prev.spent_by == Some(txid) {
                    prev.spent_by = None;
                }
            }
        }
        for vout in 0..entry.tx.output.len() as u32 {
            if let Some(out) = s.outputs.remove(&OutPoint::new(txid, vout)) {
                if let Some(child) = out.spent_by {
                    Self::evict(s, child);
                }
            }
        }
    }

    fn touches(s: &UtxoState, entry: &TxEntry, script: &ScriptBuf) -> bool {
        entry.tx.output.iter().any(|o| o.script_pubkey == *script)
            || entry.tx.input.iter().any(|i| {
                s.outputs
                    .get(&i.previous_output)
                    .is_some_and(|o| o.txout.script_pubkey == *script)
            })
    }
}

#[async_trait]
impl UtxoChainClient for SimulatedUtxoChain {
    async fn get_spendable_outputs(&self, address: &Address) -> Result<Vec<Utxo>, ChainError> {
        let mut s = lock(&self.state);
        Self::take_failure(&mut s)?;
        let script = address.script_pubkey();
        let tip = s.height;
        Ok(s.outputs
            .iter()
            .filter(|(_, o)| o.spent_by.is_none() && o.txout.script_pubkey == script)
            .map(|(outpoint, o)| {
                let confirmations = s
                    .txs
                    .get(&outpoint.txid)
                    .and_then(|t| t.height)
                    .map(|h| tip - h + 1)
                    .unwrap_or(0);
                Utxo {
                    outpoint: *outpoint,
                    value: o.txout.value,
                    confirmations,
                }
            })
            .collect())
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, ChainError> {
        let mut s = lock(&self.state);
        Self::take_failure(&mut s)?;
        let txid = tx.compute_txid();
        if s.txs.contains_key(&txid) {
            return Ok(txid);
        }

        let lock_time = tx.lock_time.to_consensus_u32();
        if lock_time != 0 {
            let now = if lock_time >= LOCKTIME_THRESHOLD {
                Self::chain_time(&s)
            } else {
                s.height
            };
            if lock_time > now {
                return Err(ChainError::Rejected("non-final".to_string()));
            }
        }

        let mut input_value = 0u64;
        let mut conflicts = Vec::new();
        for input in &tx.input {
            let prev = s.outputs.get(&input.previous_output).ok_or_else(|| {
                ChainError::Rejected("bad-txns-inputs-missingorspent".to_string())
            })?;
            input_value += prev.txout.value.to_sat();
            if let Some(spender) = prev.spent_by {
                match s.txs.get(&spender) {
                    Some(t) if t.height.is_none() => conflicts.push(spender),
                    _ => {
                        return Err(ChainError::Rejected(
                            "bad-txns-inputs-missingorspent".to_string(),
                        ))
                    }
                }
            }
        }
        let output_value: u64 = tx.output.iter().map(|o| o.value.to_sat()).sum();
        let fee = input_value.checked_sub(output_value).ok_or_else(|| {
            ChainError::Rejected("bad-txns-in-belowout".to_string())
        })?;

        let vsize = tx.vsize().max(1) as u64;
        for conflict in &conflicts {
            let old = &s.txs[conflict];
            let old_rate = old.fee / (old.tx.vsize().max(1) as u64);
            if fee / vsize <= old_rate || fee <= old.fee {
                return Err(ChainError::FeeTooLow(
                    "insufficient fee, rejecting replacement".to_string(),
                ));
            }
        }
        for conflict in conflicts {
            debug!(replaced = %conflict, by = %txid, "Simulated mempool replacement");
            Self::evict(&mut s, conflict);
        }

        for input in &tx.input {
            if let Some(prev) = s.outputs.get_mut(&input.previous_output) {
                prev.spent_by = Some(txid);
            }
        }
        for (vout, out) in tx.output.iter().enumerate() {
            s.outputs.insert(
                OutPoint::new(txid, vout as u32),
                OutputEntry {
                    txout: out.clone(),
                    spent_by: None,
                },
            );
        }
        let height = if s.auto_mine {
            s.height += 1;
            Some(s.height)
        } else {
            None
        };
        s.txs.insert(
            txid,
            TxEntry {
                tx: tx.clone(),
                height,
                fee,
            },
        );
        s.order.push(txid);
        s.broadcasts += 1;
        Ok(txid)
    }

    async fn get_tx_history(&self, address: &Address) -> Result<Vec<ChainTx>, ChainError> {
        let mut s = lock(&self.state);
        Self::take_failure(&mut s)?;
        let script = address.script_pubkey();
        Ok(s.order
            .iter()
            .filter_map(|txid| s.txs.get(txid).map(|e| (txid, e)))
            .filter(|(_, e)| Self::touches(&s, e, &script))
            .map(|(txid, e)| ChainTx {
                txid: *txid,
                tx: e.tx.clone(),
                block_height: e.height,
            })
            .collect())
    }

    async fn get_height(&self) -> Result<u32, ChainError> {
        let mut s = lock(&self.state);
        Self::take_failure(&mut s)?;
        Ok(s.height)
    }

    async fn get_median_time(&self) -> Result<u32, ChainError> {
        let mut s = lock(&self.state);
        Self::take_failure(&mut s)?;
        Ok(Self::chain_time(&s))
    }

    async fn get_fee_estimate(&self, _target_blocks: u16) -> Result<u64, ChainError> {
        let mut s = lock(&self.state);
        Self::take_failure(&mut s)?;
        Ok(s.fee_rate)
    }
}

// ============================================================================
// Account chain
// ============================================================================

#[derive(Debug, Clone)]
struct SimEscrow {
    params: EscrowParams,
    funded_block: u64,
    withdrawn: bool,
    cancelled: bool,
    revealed: Option<Secret>,
}

#[derive(Debug, Default)]
struct AccountState {
    block: u64,
    escrows: HashMap<AccountAddress, SimEscrow>,
    fail_next: u32,
    tx_count: u64,
}

pub struct SimulatedAccountChain {
    factory: AccountAddress,
    init_code_hash: B256,
    state: Mutex<AccountState>,
}

impl SimulatedAccountChain {
    pub fn new(factory: AccountAddress, init_code_hash: B256) -> Self {
        Self {
            factory,
            init_code_hash,
            state: Mutex::new(AccountState {
                block: 1_000,
                ..Default::default()
            }),
        }
    }

    pub fn factory(&self) -> AccountAddress {
        self.factory
    }

    pub fn init_code_hash(&self) -> B256 {
        self.init_code_hash
    }

    pub fn mine(&self, blocks: u64) {
        lock(&self.state).block += blocks;
    }

    pub fn fail_next(&self, n: u32) {
        lock(&self.state).fail_next = n;
    }

    /// Number of successful state-changing transactions
    pub fn tx_count(&self) -> u64 {
        lock(&self.state).tx_count
    }

    fn next_tx_hash(s: &mut AccountState) -> String {
        s.tx_count += 1;
        s.block += 1;
        let mut seed = [0u8; 16];
        seed[..8].copy_from_slice(&s.tx_count.to_be_bytes());
        seed[8..].copy_from_slice(&s.block.to_be_bytes());
        format!("0x{}", hex::encode(keccak256(&seed)))
    }

    fn take_failure(s: &mut AccountState) -> Result<(), ChainError> {
        if s.fail_next > 0 {
            s.fail_next -= 1;
            return Err(ChainError::Transport(
                "request timed out (simulated)".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl AccountChainClient for SimulatedAccountChain {
    async fn escrow_address(&self, params: &EscrowParams) -> Result<AccountAddress, ChainError> {
        Ok(escrow_address(self.factory, self.init_code_hash, params))
    }

    async fn deploy_escrow(&self, params: &EscrowParams) -> Result<EscrowDeployment, ChainError> {
        let mut s = lock(&self.state);
        Self::take_failure(&mut s)?;
        if params.side == Side::Source && params.maker_signature.is_empty() {
            return Err(ChainError::Unauthorized(
                "invalid maker signature or allowance".to_string(),
            ));
        }
        let escrow = escrow_address(self.factory, self.init_code_hash, params);
        if s.escrows.contains_key(&escrow) {
            return Err(ChainError::Rejected("escrow already deployed".to_string()));
        }
        let tx_hash = Self::next_tx_hash(&mut s);
        let funded_block = s.block;
        s.escrows.insert(
            escrow,
            SimEscrow {
                params: params.clone(),
                funded_block,
                withdrawn: false,
                cancelled: false,
                revealed: None,
            },
        );
        Ok(EscrowDeployment { tx_hash, escrow })
    }

    async fn withdraw_escrow(
        &self,
        escrow: AccountAddress,
        secret: &Secret,
    ) -> Result<String, ChainError> {
        let mut s = lock(&self.state);
        Self::take_failure(&mut s)?;
        let entry = s
            .escrows
            .get(&escrow)
            .ok_or_else(|| ChainError::NotFound(format!("escrow {} not found", escrow)))?;
        if entry.withdrawn || entry.cancelled {
            return Err(ChainError::Rejected("escrow already settled".to_string()));
        }
        if !hashlock::validate(secret, &entry.params.hashlock) {
            return Err(ChainError::Rejected("invalid secret".to_string()));
        }
        if now_secs() >= entry.params.cancellation_at {
            return Err(ChainError::Rejected("escrow cancellation period started".to_string()));
        }
        let tx_hash = Self::next_tx_hash(&mut s);
        if let Some(entry) = s.escrows.get_mut(&escrow) {
            entry.withdrawn = true;
            entry.revealed = Some(*secret);
        }
        Ok(tx_hash)
    }

    async fn cancel_escrow(&self, escrow: AccountAddress) -> Result<String, ChainError> {
        let mut s = lock(&self.state);
        Self::take_failure(&mut s)?;
        let entry = s
            .escrows
            .get(&escrow)
            .ok_or_else(|| ChainError::NotFound(format!("escrow {} not found", escrow)))?;
        if entry.withdrawn || entry.cancelled {
            return Err(ChainError::Rejected("escrow already settled".to_string()));
        }
        if now_secs() < entry.params.cancellation_at {
            return Err(ChainError::Rejected("timelock not expired".to_string()));
        }
        let tx_hash = Self::next_tx_hash(&mut s);
        if let Some(entry) = s.escrows.get_mut(&escrow) {
            entry.cancelled = true;
        }
        Ok(tx_hash)
    }

    async fn get_escrow_status(&self, escrow: AccountAddress) -> Result<EscrowStatus, ChainError> {
        let mut s = lock(&self.state);
        Self::take_failure(&mut s)?;
        let entry = s
            .escrows
            .get(&escrow)
            .ok_or_else(|| ChainError::NotFound(format!("escrow {} not found", escrow)))?;
        Ok(EscrowStatus {
            funded: true,
            withdrawn: entry.withdrawn,
            cancelled: entry.cancelled,
            revealed_secret: entry.revealed,
            confirmations: (s.block - entry.funded_block + 1) as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderId;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};
    use bitcoin::{CompressedPublicKey, Network, Sequence, TxIn, Witness};

    fn address(seed: u8) -> Address {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[seed; 32]).unwrap();
        let pk = CompressedPublicKey(sk.public_key(&secp));
        Address::p2wpkh(&pk, Network::Regtest)
    }

    fn spend(outpoint: OutPoint, value: u64, to: &Address) -> Transaction {
        Transaction {
            version: bitcoin::transaction::Version::TWO,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(value),
                script_pubkey: to.script_pubkey(),
            }],
        }
    }

    #[tokio::test]
    async fn test_fund_and_spend() {
        let chain = SimulatedUtxoChain::new();
        let a = address(1);
        let b = address(2);
        let op = chain.fund_address(&a, 10_000);
        assert_eq!(chain.balance(&a), 10_000);

        let txid = chain.broadcast(&spend(op, 9_000, &b)).await.unwrap();
        assert!(chain.is_confirmed(&txid));
        assert_eq!(chain.balance(&a), 0);
        assert_eq!(chain.balance(&b), 9_000);
        assert_eq!(chain.get_tx_history(&a).await.unwrap().len(), 2);
        assert_eq!(chain.broadcast_count(), 1);
    }

    #[tokio::test]
    async fn test_replacement_needs_higher_fee() {
        let chain = SimulatedUtxoChain::new();
        chain.set_auto_mine(false);
        let a = address(1);
        let b = address(2);
        let op = chain.fund_address(&a, 10_000);

        let first = chain.broadcast(&spend(op, 9_000, &b)).await.unwrap();
        let same_fee = chain.broadcast(&spend(op, 9_000, &address(3))).await;
        assert!(matches!(same_fee, Err(ChainError::FeeTooLow(_))));

        let second = chain.broadcast(&spend(op, 8_000, &b)).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(chain.mempool_len(), 1);
        chain.mine(1);
        assert!(chain.is_confirmed(&second));
        assert!(!chain.is_confirmed(&first));
    }

    #[tokio::test]
    async fn test_confirmed_spend_cannot_be_replaced() {
        let chain = SimulatedUtxoChain::new();
        let a = address(1);
        let op = chain.fund_address(&a, 10_000);
        chain.broadcast(&spend(op, 9_000, &a)).await.unwrap();
        assert!(chain.broadcast(&spend(op, 5_000, &a)).await.is_err());
    }

    #[tokio::test]
    async fn test_non_final_rejected() {
        let chain = SimulatedUtxoChain::new();
        chain.set_median_time(Some(1_700_000_000));
        let a = address(1);
        let op = chain.fund_address(&a, 10_000);
        let mut tx = spend(op, 9_000, &a);
        tx.lock_time = bitcoin::absolute::LockTime::from_consensus(1_700_000_100);
        assert!(matches!(
            chain.broadcast(&tx).await,
            Err(ChainError::Rejected(_))
        ));
        chain.set_median_time(Some(1_700_000_100));
        assert!(chain.broadcast(&tx).await.is_ok());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let chain = SimulatedUtxoChain::new();
        chain.fail_next(2);
        assert!(chain.get_height().await.is_err());
        assert!(chain.get_height().await.is_err());
        assert!(chain.get_height().await.is_ok());
    }

    fn escrow_params(side: Side, secret: &Secret, cancellation_at: u64) -> EscrowParams {
        EscrowParams {
            side,
            order_hash: OrderId([1u8; 32]),
            hashlock: hashlock::hash(secret),
            maker: AccountAddress::repeat_byte(1),
            taker: AccountAddress::repeat_byte(2),
            token: AccountAddress::repeat_byte(3),
            amount: 100,
            safety_deposit: 0,
            cancellation_at,
            deployed_at: now_secs(),
            maker_signature: vec![0xaa],
        }
    }

    #[tokio::test]
    async fn test_account_escrow_withdraw() {
        let chain = SimulatedAccountChain::new(AccountAddress::repeat_byte(9), B256::ZERO);
        let secret = hashlock::generate_secret();
        let deployed = chain
            .deploy_escrow(&escrow_params(Side::Source, &secret, now_secs() + 600))
            .await
            .unwrap();

        let wrong = hashlock::generate_secret();
        assert!(chain.withdraw_escrow(deployed.escrow, &wrong).await.is_err());
        chain.withdraw_escrow(deployed.escrow, &secret).await.unwrap();
        let status = chain.get_escrow_status(deployed.escrow).await.unwrap();
        assert!(status.withdrawn);
        assert_eq!(status.revealed_secret, Some(secret));
        assert!(chain.cancel_escrow(deployed.escrow).await.is_err());
    }

    #[tokio::test]
    async fn test_account_escrow_requires_signature() {
        let chain = SimulatedAccountChain::new(AccountAddress::repeat_byte(9), B256::ZERO);
        let mut params = escrow_params(Side::Source, &hashlock::generate_secret(), 1);
        params.maker_signature.clear();
        assert!(matches!(
            chain.deploy_escrow(&params).await,
            Err(ChainError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_account_cancel_after_timeout() {
        let chain = SimulatedAccountChain::new(AccountAddress::repeat_byte(9), B256::ZERO);
        let secret = hashlock::generate_secret();
        let live = chain
            .deploy_escrow(&escrow_params(Side::Destination, &secret, now_secs() + 600))
            .await
            .unwrap();
        assert!(chain.cancel_escrow(live.escrow).await.is_err());

        let mut params = escrow_params(Side::Destination, &secret, now_secs().saturating_sub(1));
        params.order_hash = OrderId([2u8; 32]);
        let expired = chain.deploy_escrow(&params).await.unwrap();
        chain.cancel_escrow(expired.escrow).await.unwrap();
        assert!(chain
            .get_escrow_status(expired.escrow)
            .await
            .unwrap()
            .cancelled);
        assert!(!chain.get_escrow_status(live.escrow).await.unwrap().cancelled);
    }
}
