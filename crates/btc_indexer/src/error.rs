//! Indexer error kinds.

use crate::chain::ChainError;
use crate::script::ScriptError;
use bitcoin::Txid;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Flat tag for [`IndexError`] and [`ChainError`], so callers can branch without matching
/// on nested sources or messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ChainUnavailable,
    HeightNotFound,
    BlockNotFound,
    TxNotFound,
    TxFetch,
    PrevTxFetch,
    MalformedPrevTx,
    Rpc,
    Decode,
    Script,
    InvalidWatchedAddress,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ChainUnavailable => "chain_unavailable",
            ErrorKind::HeightNotFound => "height_not_found",
            ErrorKind::BlockNotFound => "block_not_found",
            ErrorKind::TxNotFound => "tx_not_found",
            ErrorKind::TxFetch => "tx_fetch",
            ErrorKind::PrevTxFetch => "prev_tx_fetch",
            ErrorKind::MalformedPrevTx => "malformed_prev_tx",
            ErrorKind::Rpc => "rpc",
            ErrorKind::Decode => "decode",
            ErrorKind::Script => "script",
            ErrorKind::InvalidWatchedAddress => "invalid_watched_address",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Any failure that aborts an indexer call. Unparsable scripts never show up here: they are
/// skipped where they are resolved.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("fetch transaction {txid}: {source}")]
    TxFetch {
        txid: Txid,
        #[source]
        source: ChainError,
    },
    #[error("fetch previous transaction {txid}: {source}")]
    PrevTxFetch {
        txid: Txid,
        #[source]
        source: ChainError,
    },
    #[error("previous transaction {txid} has {outputs} outputs but an input spends index {vout}")]
    MalformedPrevTx {
        txid: Txid,
        vout: u32,
        outputs: usize,
    },
    #[error("script: {0}")]
    Script(#[from] ScriptError),
    #[error("invalid watched address {address:?}: {reason}")]
    InvalidWatchedAddress { address: String, reason: String },
    #[error("cancelled")]
    Cancelled,
}

impl IndexError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IndexError::Chain(e) => e.kind(),
            IndexError::TxFetch { .. } => ErrorKind::TxFetch,
            IndexError::PrevTxFetch { .. } => ErrorKind::PrevTxFetch,
            IndexError::MalformedPrevTx { .. } => ErrorKind::MalformedPrevTx,
            IndexError::Script(_) => ErrorKind::Script,
            IndexError::InvalidWatchedAddress { .. } => ErrorKind::InvalidWatchedAddress,
            IndexError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// True when the failure came from the transport rather than from chain data, i.e. the
    /// same call may succeed later. Fetch errors are judged by their wrapped cause.
    pub fn is_retryable(&self) -> bool {
        match self {
            IndexError::Chain(e)
            | IndexError::TxFetch { source: e, .. }
            | IndexError::PrevTxFetch { source: e, .. } => e.is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    #[test]
    fn kind_follows_chain_source() {
        let err = IndexError::from(ChainError::HeightNotFound(900_000));
        assert_eq!(err.kind(), ErrorKind::HeightNotFound);
        assert!(!err.is_retryable());
    }

    #[test]
    fn fetch_errors_keep_their_own_kind() {
        let txid = Txid::all_zeros();
        let err = IndexError::PrevTxFetch {
            txid,
            source: ChainError::Unavailable("connection refused".to_string()),
        };
        assert_eq!(err.kind(), ErrorKind::PrevTxFetch);
        assert!(err.is_retryable());

        let err = IndexError::TxFetch {
            txid,
            source: ChainError::TxNotFound(txid),
        };
        assert_eq!(err.kind(), ErrorKind::TxFetch);
        assert!(!err.is_retryable());
    }

    #[test]
    fn rejected_credentials_are_not_retryable() {
        let err = IndexError::from(ChainError::Config("rpc credentials rejected".to_string()));
        assert_eq!(err.kind(), ErrorKind::ChainUnavailable);
        assert!(!err.is_retryable());
    }

    #[test]
    fn kind_display_is_snake_case() {
        assert_eq!(ErrorKind::MalformedPrevTx.to_string(), "malformed_prev_tx");
        assert_eq!(
            serde_json::to_string(&ErrorKind::ChainUnavailable).unwrap(),
            "\"chain_unavailable\""
        );
    }
}
