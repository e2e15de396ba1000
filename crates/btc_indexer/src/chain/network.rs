//! Normalization of user-supplied network names.

use bitcoin::Network;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("unknown network: {0}")]
    Unknown(String),
}

/// Parse a network name. Accepts the `bitcoin` crate names (`bitcoin`, `testnet`, `signet`,
/// `regtest`) plus the common aliases `mainnet`/`main` and `test`/`testnet3`. Case-insensitive.
pub fn parse_network(name: &str) -> Result<Network, NetworkError> {
    let s = name.trim().to_ascii_lowercase();
    match s.as_str() {
        "mainnet" | "main" => Ok(Network::Bitcoin),
        "test" | "testnet3" => Ok(Network::Testnet),
        other => Network::from_str(other).map_err(|_| NetworkError::Unknown(name.to_string())),
    }
}
