//! btc_indexer: directional deposit indexer for Bitcoin.
//!
//! Scans a block for outputs paying a single watched address and, for each payment, traces
//! the transaction's inputs back to the outputs they spend to recover the sending addresses.
//! Read-only; talks to a full node over JSON-RPC.

pub mod chain;
pub mod digest;
pub mod error;
pub mod indexer;
pub mod script;

pub use bitcoin;

pub use chain::{parse_network, Cache, ChainError, ChainReader, RpcClient, RpcConfig};
pub use digest::block_digest;
pub use error::{ErrorKind, IndexError};
pub use indexer::{cancel_pair, CancelHandle, CancelToken, Indexer, IndexerConfig, ParseResult};
pub use script::{classify, resolve_address, ScriptError, ScriptType, WatchedAddress};
