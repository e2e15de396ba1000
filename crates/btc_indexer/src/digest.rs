//! SHA-256 digest of a block's results, for checking that re-indexing a height reproduced
//! the same output.

use crate::indexer::ParseResult;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DigestError {
    #[error("serialize: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct BlockRecord<'a> {
    height: u64,
    results: &'a [ParseResult],
}

/// Normalize JSON for hashing: sorted keys, no whitespace.
///
/// Keys are sorted explicitly: serde_json keeps insertion order when its `preserve_order`
/// feature is enabled anywhere in the dependency graph.
pub fn normalize_for_hash(value: &serde_json::Value) -> Result<String, DigestError> {
    Ok(serde_json::to_string(&sort_json_keys(value))?)
}

fn sort_json_keys(v: &serde_json::Value) -> serde_json::Value {
    match v {
        serde_json::Value::Object(m) => {
            let sorted: BTreeMap<&String, serde_json::Value> =
                m.iter().map(|(k, v)| (k, sort_json_keys(v))).collect();
            serde_json::Value::Object(
                sorted
                    .into_iter()
                    .map(|(k, v)| (k.clone(), v))
                    .collect(),
            )
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.iter().map(sort_json_keys).collect())
        }
        other => other.clone(),
    }
}

/// Hex SHA-256 over the normalized `{height, results}` record. Result order is part of the
/// digest.
pub fn block_digest(height: u64, results: &[ParseResult]) -> Result<String, DigestError> {
    let json = serde_json::to_value(BlockRecord { height, results })?;
    let normalized = normalize_for_hash(&json)?;
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}
