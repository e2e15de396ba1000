//! Chain data access: reader trait, Bitcoin Core JSON-RPC client, response cache, network names.

mod cache;
mod network;
mod reader;
pub mod rpc;

pub use cache::{Cache, CacheError};
pub use network::{parse_network, NetworkError};
pub use reader::{ChainError, ChainReader};
pub use rpc::{RpcClient, RpcConfig};
