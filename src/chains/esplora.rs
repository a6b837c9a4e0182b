//! UTXO chain client over the Esplora REST API
//!
//! Endpoints used:
//! - `GET  /address/:addr/utxo`
//! - `GET  /address/:addr/txs` and `GET /tx/:txid/hex`
//! - `GET  /blocks/tip/height`, `GET /blocks/tip/hash`, `GET /block/:hash`
//! - `GET  /fee-estimates`
//! - `POST /tx`

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::{Address, Amount, OutPoint, Transaction, Txid};
use serde::Deserialize;
use tracing::debug;

use super::failover::EndpointSet;
use super::{ChainTx, Utxo, UtxoChainClient};
use crate::error::ChainError;

/// Fee rate used when the node returns no estimate for any target
const FALLBACK_FEE_RATE: u64 = 2;

#[derive(Debug, Deserialize)]
struct TxStatus {
    confirmed: bool,
    block_height: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct EsploraUtxo {
    txid: String,
    vout: u32,
    value: u64,
    status: TxStatus,
}

#[derive(Debug, Deserialize)]
struct EsploraTx {
    txid: String,
    status: TxStatus,
}

#[derive(Debug, Deserialize)]
struct EsploraBlock {
    mediantime: u32,
}

pub struct EsploraClient {
    http: reqwest::Client,
    endpoints: Arc<EndpointSet>,
}

impl EsploraClient {
    pub fn new(endpoints: Arc<EndpointSet>) -> Result<Self, ChainError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| ChainError::Transport(e.to_string()))?;
        Ok(Self { http, endpoints })
    }

    pub fn endpoints(&self) -> &Arc<EndpointSet> {
        &self.endpoints
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoints.current(), path)
    }

    /// Map a reqwest error, counting transport failures towards failover
    fn transport(&self, e: reqwest::Error) -> ChainError {
        self.endpoints.record_failure();
        ChainError::Transport(e.to_string())
    }

    async fn check(&self, resp: reqwest::Response) -> Result<reqwest::Response, ChainError> {
        let status = resp.status();
        if status.is_success() {
            self.endpoints.record_success();
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        if status.is_server_error() {
            self.endpoints.record_failure();
            return Err(ChainError::Transport(format!("HTTP {}: {}", status, body)));
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ChainError::NotFound(body));
        }
        Err(ChainError::classify(body))
    }

    async fn get_text(&self, path: &str) -> Result<String, ChainError> {
        let resp = self
            .http
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| self.transport(e))?;
        self.check(resp)
            .await?
            .text()
            .await
            .map_err(|e| self.transport(e))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ChainError> {
        let resp = self
            .http
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| self.transport(e))?;
        self.check(resp)
            .await?
            .json::<T>()
            .await
            .map_err(|e| ChainError::Rejected(format!("Malformed response from {}: {}", path, e)))
    }

    async fn get_raw_tx(&self, txid: &str) -> Result<Transaction, ChainError> {
        let raw = self.get_text(&format!("/tx/{}/hex", txid)).await?;
        let bytes = hex::decode(raw.trim())
            .map_err(|e| ChainError::Rejected(format!("Invalid tx hex for {}: {}", txid, e)))?;
        bitcoin::consensus::deserialize(&bytes)
            .map_err(|e| ChainError::Rejected(format!("Undecodable tx {}: {}", txid, e)))
    }
}

fn parse_txid(raw: &str) -> Result<Txid, ChainError> {
    raw.trim()
        .parse()
        .map_err(|e| ChainError::Rejected(format!("Invalid txid {}: {}", raw, e)))
}

#[async_trait]
impl UtxoChainClient for EsploraClient {
    async fn get_spendable_outputs(&self, address: &Address) -> Result<Vec<Utxo>, ChainError> {
        let tip = self.get_height().await?;
        let utxos: Vec<EsploraUtxo> = self.get_json(&format!("/address/{}/utxo", address)).await?;
        utxos
            .into_iter()
            .map(|u| {
                let confirmations = match (u.status.confirmed, u.status.block_height) {
                    (true, Some(h)) if tip >= h => tip - h + 1,
                    _ => 0,
                };
                Ok(Utxo {
                    outpoint: OutPoint::new(parse_txid(&u.txid)?, u.vout),
                    value: Amount::from_sat(u.value),
                    confirmations,
                })
            })
            .collect()
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, ChainError> {
        let resp = self
            .http
            .post(self.url("/tx"))
            .body(serialize_hex(tx))
            .send()
            .await
            .map_err(|e| self.transport(e))?;
        let txid = self
            .check(resp)
            .await?
            .text()
            .await
            .map_err(|e| self.transport(e))?;
        debug!(txid = %txid.trim(), "Transaction broadcast");
        parse_txid(&txid)
    }

    async fn get_tx_history(&self, address: &Address) -> Result<Vec<ChainTx>, ChainError> {
        let txs: Vec<EsploraTx> = self.get_json(&format!("/address/{}/txs", address)).await?;
        let mut history = Vec::with_capacity(txs.len());
        for entry in txs {
            let tx = self.get_raw_tx(&entry.txid).await?;
            history.push(ChainTx {
                txid: parse_txid(&entry.txid)?,
                tx,
                block_height: entry
                    .status
                    .confirmed
                    .then_some(entry.status.block_height)
                    .flatten(),
            });
        }
        Ok(history)
    }

    async fn get_height(&self) -> Result<u32, ChainError> {
        let raw = self.get_text("/blocks/tip/height").await?;
        raw.trim()
            .parse()
            .map_err(|e| ChainError::Rejected(format!("Invalid tip height {}: {}", raw, e)))
    }

    async fn get_median_time(&self) -> Result<u32, ChainError> {
        let hash = self.get_text("/blocks/tip/hash").await?;
        let block: EsploraBlock = self.get_json(&format!("/block/{}", hash.trim())).await?;
        Ok(block.mediantime)
    }

    async fn get_fee_estimate(&self, target_blocks: u16) -> Result<u64, ChainError> {
        let estimates: HashMap<String, f64> = self.get_json("/fee-estimates").await?;
        // Closest target that confirms at least as fast as requested
        let rate = estimates
            .iter()
            .filter_map(|(k, v)| k.parse::<u16>().ok().map(|t| (t, *v)))
            .filter(|(t, _)| *t <= target_blocks.max(1))
            .max_by_key(|(t, _)| *t)
            .map(|(_, v)| v);
        Ok(rate
            .map(|r| r.ceil() as u64)
            .unwrap_or(FALLBACK_FEE_RATE)
            .max(1))
    }
}
