//! Deposit detection: block orchestration, per-transaction output matching and input tracing.

mod cancel;
mod tx_cache;

pub use cancel::{cancel_pair, CancelHandle, CancelToken};

use crate::chain::ChainReader;
use crate::error::IndexError;
use crate::script::{resolve_address, ScriptError, WatchedAddress};
use bitcoin::{Block, BlockHash, Network, Transaction, TxIn, Txid};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use tx_cache::TxCache;

/// One payment to the watched address.
///
/// Equality compares all fields, `txid` and `vout` included, so two payments of the same
/// amount from the same senders stay distinct.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseResult {
    /// Satoshis, exactly as in the output.
    pub value: u64,
    /// Addresses of the outputs spent by the paying transaction, in input order. Inputs
    /// whose spent script has no address are left out; duplicates are kept.
    pub from: Vec<String>,
    pub to: String,
    pub txid: Txid,
    pub vout: u32,
}

#[derive(Clone, Debug)]
pub struct IndexerConfig {
    pub network: Network,
    pub watched_address: String,
    /// Upper bound on transactions of one block (and previous transactions of one input
    /// set) fetched at the same time. 1 = strictly sequential.
    pub max_concurrent_fetches: usize,
}

impl IndexerConfig {
    pub fn new(network: Network, watched_address: impl Into<String>) -> Self {
        Self {
            network,
            watched_address: watched_address.into(),
            max_concurrent_fetches: 1,
        }
    }

    pub fn with_concurrency(mut self, max_concurrent_fetches: usize) -> Self {
        self.max_concurrent_fetches = max_concurrent_fetches;
        self
    }
}

/// Finds payments to one address. Holds only immutable configuration, so one instance can
/// serve concurrent calls and several instances can share a reader.
pub struct Indexer<R> {
    reader: R,
    network: Network,
    watched: WatchedAddress,
    concurrency: usize,
}

impl<R: ChainReader> Indexer<R> {
    /// Fails with `InvalidWatchedAddress` if the address does not decode for the network.
    pub fn new(reader: R, config: IndexerConfig) -> Result<Self, IndexError> {
        let watched = WatchedAddress::parse(&config.watched_address, config.network)?;
        Ok(Self {
            reader,
            network: config.network,
            watched,
            concurrency: config.max_concurrent_fetches.max(1),
        })
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn watched_address(&self) -> &WatchedAddress {
        &self.watched
    }

    pub fn reader(&self) -> &R {
        &self.reader
    }

    /// Height of the node's best block: how far a caller can index.
    pub async fn latest_block(&self) -> Result<u64, IndexError> {
        Ok(self.reader.tip_height().await?)
    }

    /// All payments to the watched address in the block at `height`, in block order then
    /// output order. Any failure discards the whole block.
    pub async fn parse_block(&self, height: u64) -> Result<Vec<ParseResult>, IndexError> {
        self.parse_block_with_cancel(height, &CancelToken::never())
            .await
    }

    pub async fn parse_block_with_cancel(
        &self,
        height: u64,
        cancel: &CancelToken,
    ) -> Result<Vec<ParseResult>, IndexError> {
        let block = cancel.guard(self.reader.block_at(height)).await??;
        let results = self.parse_fetched_block(block, cancel).await?;
        info!(height, matches = results.len(), "block parsed");
        Ok(results)
    }

    pub async fn parse_block_by_hash(
        &self,
        hash: &BlockHash,
    ) -> Result<Vec<ParseResult>, IndexError> {
        let cancel = CancelToken::never();
        let block = self.reader.block_by_hash(hash).await?;
        let results = self.parse_fetched_block(block, &cancel).await?;
        info!(%hash, matches = results.len(), "block parsed");
        Ok(results)
    }

    /// Payments to the watched address made by one transaction, in output order.
    pub async fn parse_transaction(&self, txid: &Txid) -> Result<Vec<ParseResult>, IndexError> {
        let cache = TxCache::default();
        self.parse_tx(txid, &cache, &CancelToken::never()).await
    }

    async fn parse_fetched_block(
        &self,
        block: Block,
        cancel: &CancelToken,
    ) -> Result<Vec<ParseResult>, IndexError> {
        let txids: Vec<Txid> = block.txdata.iter().map(Transaction::compute_txid).collect();
        let cache = TxCache::seeded(block.txdata);
        let per_tx: Vec<Vec<ParseResult>> = stream::iter(txids.iter())
            .map(|txid| self.parse_tx(txid, &cache, cancel))
            .buffered(self.concurrency)
            .try_collect()
            .await?;
        Ok(per_tx.into_iter().flatten().collect())
    }

    async fn parse_tx(
        &self,
        txid: &Txid,
        cache: &TxCache,
        cancel: &CancelToken,
    ) -> Result<Vec<ParseResult>, IndexError> {
        let tx = cancel
            .guard(cache.get_or_fetch(&self.reader, txid))
            .await?
            .map_err(|source| IndexError::TxFetch {
                txid: *txid,
                source,
            })?;

        let mut results = Vec::new();
        let mut traced: Option<Vec<String>> = None;
        for (vout, output) in tx.output.iter().enumerate() {
            let address = match resolve_address(&output.script_pubkey, self.network) {
                Ok(address) => address,
                Err(ScriptError::Unparsable(pattern)) => {
                    debug!(%txid, vout, %pattern, "skipping output without address");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if address != self.watched.encoded() {
                continue;
            }
            // Same input set for every matching output; trace it once.
            if traced.is_none() {
                traced = Some(self.trace_from(&tx, cache, cancel).await?);
            }
            let from = traced.clone().unwrap_or_default();
            debug!(%txid, vout, value = output.value.to_sat(), senders = from.len(), "deposit found");
            results.push(ParseResult {
                value: output.value.to_sat(),
                from,
                to: address,
                txid: *txid,
                vout: vout as u32,
            });
        }
        Ok(results)
    }

    /// Addresses of the outputs `tx` spends, in input order.
    async fn trace_from(
        &self,
        tx: &Transaction,
        cache: &TxCache,
        cancel: &CancelToken,
    ) -> Result<Vec<String>, IndexError> {
        let traced: Vec<Option<String>> = stream::iter(tx.input.iter())
            .map(|input| self.trace_input(input, cache, cancel))
            .buffered(self.concurrency)
            .try_collect()
            .await?;
        Ok(traced.into_iter().flatten().collect())
    }

    async fn trace_input(
        &self,
        input: &TxIn,
        cache: &TxCache,
        cancel: &CancelToken,
    ) -> Result<Option<String>, IndexError> {
        let outpoint = input.previous_output;
        // Coinbase: nothing was spent.
        if outpoint.is_null() {
            return Ok(None);
        }
        let prev = cancel
            .guard(cache.get_or_fetch(&self.reader, &outpoint.txid))
            .await?
            .map_err(|source| IndexError::PrevTxFetch {
                txid: outpoint.txid,
                source,
            })?;
        let spent = prev
            .output
            .get(outpoint.vout as usize)
            .ok_or_else(|| IndexError::MalformedPrevTx {
                txid: outpoint.txid,
                vout: outpoint.vout,
                outputs: prev.output.len(),
            })?;
        match resolve_address(&spent.script_pubkey, self.network) {
            Ok(address) => Ok(Some(address)),
            Err(ScriptError::Unparsable(pattern)) => {
                debug!(prev_txid = %outpoint.txid, vout = outpoint.vout, %pattern, "input spends output without address");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}
