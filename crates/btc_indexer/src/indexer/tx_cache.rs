//! Transaction lookups memoized for the length of one indexer call.

use crate::chain::{ChainError, ChainReader};
use bitcoin::{Transaction, Txid};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Keyed by txid. Never outlives the call that built it, so nothing goes stale across
/// blocks.
#[derive(Default)]
pub(crate) struct TxCache {
    entries: Mutex<HashMap<Txid, Arc<Transaction>>>,
}

impl TxCache {
    /// Pre-populated with a block's own transactions.
    pub(crate) fn seeded(txs: impl IntoIterator<Item = Transaction>) -> Self {
        let entries = txs
            .into_iter()
            .map(|tx| (tx.compute_txid(), Arc::new(tx)))
            .collect();
        Self {
            entries: Mutex::new(entries),
        }
    }

    fn lookup(&self, txid: &Txid) -> Option<Arc<Transaction>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(txid)
            .cloned()
    }

    pub(crate) async fn get_or_fetch<R: ChainReader + ?Sized>(
        &self,
        reader: &R,
        txid: &Txid,
    ) -> Result<Arc<Transaction>, ChainError> {
        if let Some(tx) = self.lookup(txid) {
            debug!(%txid, "tx cache hit");
            return Ok(tx);
        }
        let tx = Arc::new(reader.transaction(txid).await?);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(*txid)
            .or_insert_with(|| Arc::clone(&tx));
        Ok(tx)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
