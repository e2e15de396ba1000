//! The chain reader seam: everything the indexer needs from a full node.

use crate::chain::cache::CacheError;
use crate::error::ErrorKind;
use async_trait::async_trait;
use bitcoin::{Block, BlockHash, Transaction, Txid};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("chain unavailable: {0}")]
    Unavailable(String),
    #[error("no block at height {0}")]
    HeightNotFound(u64),
    #[error("block {0} not found")]
    BlockNotFound(BlockHash),
    #[error("transaction {0} not found")]
    TxNotFound(Txid),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("decode: {0}")]
    Decode(String),
    #[error("cache: {0}")]
    Cache(#[from] CacheError),
    #[error("config: {0}")]
    Config(String),
}

impl ChainError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChainError::Unavailable(_) | ChainError::Cache(_) | ChainError::Config(_) => {
                ErrorKind::ChainUnavailable
            }
            ChainError::HeightNotFound(_) => ErrorKind::HeightNotFound,
            ChainError::BlockNotFound(_) => ErrorKind::BlockNotFound,
            ChainError::TxNotFound(_) => ErrorKind::TxNotFound,
            ChainError::Rpc { .. } => ErrorKind::Rpc,
            ChainError::Decode(_) => ErrorKind::Decode,
        }
    }

    /// The node could not be reached or answered with a transport-level failure; the same
    /// call may succeed later. Configuration errors (bad URL, rejected credentials) are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChainError::Unavailable(_) | ChainError::Cache(_))
    }
}

impl From<reqwest::Error> for ChainError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ChainError::Unavailable(format!("timed out: {}", e))
        } else {
            ChainError::Unavailable(e.to_string())
        }
    }
}

/// Read access to a full node. Every call is a fresh lookup; implementations hold no
/// indexing state.
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Height of the current best block.
    async fn tip_height(&self) -> Result<u64, ChainError>;

    async fn block_hash(&self, height: u64) -> Result<BlockHash, ChainError>;

    async fn block_by_hash(&self, hash: &BlockHash) -> Result<Block, ChainError>;

    async fn transaction(&self, txid: &Txid) -> Result<Transaction, ChainError>;

    /// Block at `height` on the node's best chain.
    async fn block_at(&self, height: u64) -> Result<Block, ChainError> {
        let hash = self.block_hash(height).await?;
        self.block_by_hash(&hash).await
    }
}

#[async_trait]
impl<R: ChainReader + ?Sized> ChainReader for Arc<R> {
    async fn tip_height(&self) -> Result<u64, ChainError> {
        (**self).tip_height().await
    }

    async fn block_hash(&self, height: u64) -> Result<BlockHash, ChainError> {
        (**self).block_hash(height).await
    }

    async fn block_by_hash(&self, hash: &BlockHash) -> Result<Block, ChainError> {
        (**self).block_by_hash(hash).await
    }

    async fn transaction(&self, txid: &Txid) -> Result<Transaction, ChainError> {
        (**self).transaction(txid).await
    }

    async fn block_at(&self, height: u64) -> Result<Block, ChainError> {
        (**self).block_at(height).await
    }
}
