//! Locking-script classification and address resolution.

use crate::error::IndexError;
use bitcoin::address::NetworkUnchecked;
use bitcoin::opcodes::all::{OP_CHECKMULTISIG, OP_CHECKMULTISIGVERIFY};
use bitcoin::script::Instruction;
use bitcoin::{Address, Network, Script};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

///
/// Recognised patterns of a locking script (`scriptPubKey`).
///
/// Only the first five have a canonical address encoding; everything else resolves to
/// [`ScriptError::Unparsable`].
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScriptType {
    Pay2PublicKeyHash,
    Pay2ScriptHash,
    Pay2WitnessPublicKeyHash,
    Pay2WitnessScriptHash,
    Pay2Taproot,
    Pay2PublicKey,
    Pay2MultiSig,
    OpReturn,
    /// Witness program of a version (or length) with no defined address type.
    WitnessProgram,
    NotRecognised,
}

impl ScriptType {
    pub fn has_address(self) -> bool {
        matches!(
            self,
            ScriptType::Pay2PublicKeyHash
                | ScriptType::Pay2ScriptHash
                | ScriptType::Pay2WitnessPublicKeyHash
                | ScriptType::Pay2WitnessScriptHash
                | ScriptType::Pay2Taproot
        )
    }
}

impl fmt::Display for ScriptType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ScriptType::Pay2PublicKeyHash => write!(f, "Pay2PublicKeyHash"),
            ScriptType::Pay2ScriptHash => write!(f, "Pay2ScriptHash"),
            ScriptType::Pay2WitnessPublicKeyHash => write!(f, "Pay2WitnessPublicKeyHash"),
            ScriptType::Pay2WitnessScriptHash => write!(f, "Pay2WitnessScriptHash"),
            ScriptType::Pay2Taproot => write!(f, "Pay2Taproot"),
            ScriptType::Pay2PublicKey => write!(f, "Pay2PublicKey"),
            ScriptType::Pay2MultiSig => write!(f, "Pay2MultiSig"),
            ScriptType::OpReturn => write!(f, "OpReturn"),
            ScriptType::WitnessProgram => write!(f, "WitnessProgram"),
            ScriptType::NotRecognised => write!(f, "NotRecognised"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    /// No canonical address for this script. Expected and frequent; callers skip.
    #[error("unparsable script ({0})")]
    Unparsable(ScriptType),
    #[error("address encoding: {0}")]
    Encode(String),
}

/// Classify a locking script.
pub fn classify(script: &Script) -> ScriptType {
    if script.is_p2pkh() {
        ScriptType::Pay2PublicKeyHash
    } else if script.is_p2sh() {
        ScriptType::Pay2ScriptHash
    } else if script.is_p2wpkh() {
        ScriptType::Pay2WitnessPublicKeyHash
    } else if script.is_p2wsh() {
        ScriptType::Pay2WitnessScriptHash
    } else if script.is_p2tr() {
        ScriptType::Pay2Taproot
    } else if script.is_witness_program() {
        ScriptType::WitnessProgram
    } else if script.is_op_return() {
        ScriptType::OpReturn
    } else if script.is_p2pk() {
        ScriptType::Pay2PublicKey
    } else if is_bare_multisig(script) {
        ScriptType::Pay2MultiSig
    } else {
        ScriptType::NotRecognised
    }
}

/// Address string for a locking script on `network`.
pub fn resolve_address(script: &Script, network: Network) -> Result<String, ScriptError> {
    let pattern = classify(script);
    if !pattern.has_address() {
        return Err(ScriptError::Unparsable(pattern));
    }
    Address::from_script(script, network)
        .map(|a| a.to_string())
        .map_err(|e| ScriptError::Encode(e.to_string()))
}

/// Well-formed script ending in OP_CHECKMULTISIG[VERIFY].
fn is_bare_multisig(script: &Script) -> bool {
    let mut last = None;
    for instruction in script.instructions() {
        match instruction {
            Ok(i) => last = Some(i),
            Err(_) => return false,
        }
    }
    matches!(
        last,
        Some(Instruction::Op(op)) if op == OP_CHECKMULTISIG || op == OP_CHECKMULTISIGVERIFY
    )
}

/// The address an indexer watches, validated against its network once at construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchedAddress {
    address: Address,
    encoded: String,
}

impl WatchedAddress {
    /// Decode `s` for `network`. The address must have a script form the resolver can map
    /// back to it, otherwise no output could ever match.
    pub fn parse(s: &str, network: Network) -> Result<Self, IndexError> {
        let invalid = |reason: String| IndexError::InvalidWatchedAddress {
            address: s.to_string(),
            reason,
        };
        let unchecked: Address<NetworkUnchecked> =
            s.trim().parse().map_err(|e: bitcoin::address::ParseError| invalid(e.to_string()))?;
        let address = unchecked
            .require_network(network)
            .map_err(|e| invalid(e.to_string()))?;
        let encoded = resolve_address(&address.script_pubkey(), network)
            .map_err(|e| invalid(e.to_string()))?;
        Ok(Self { address, encoded })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Canonical string form, the value resolved output addresses are compared with.
    pub fn encoded(&self) -> &str {
        &self.encoded
    }
}

impl fmt::Display for WatchedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}
