//! Bitcoin Core JSON-RPC client with per-call timeout, optional rate limiting, transport
//! retries and an optional response cache.

use crate::chain::cache::Cache;
use crate::chain::reader::{ChainError, ChainReader};
use async_trait::async_trait;
use bitcoin::consensus::Decodable;
use bitcoin::{Block, BlockHash, Transaction, Txid};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use url::Url;

const DEFAULT_RPC_URL: &str = "http://127.0.0.1:8332";
const TIMEOUT_MS: u64 = 30_000;
const RETRY_BACKOFF_MS: u64 = 500;

/// Bitcoin Core `RPC_INVALID_ADDRESS_OR_KEY`: unknown block or transaction.
const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5;
/// Bitcoin Core `RPC_INVALID_PARAMETER`: `getblockhash` past the tip.
const RPC_INVALID_PARAMETER: i64 = -8;

#[derive(Clone, Debug)]
pub struct RpcConfig {
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub timeout_ms: u64,
    /// Minimum spacing between outgoing requests; 0 disables.
    pub rate_limit_ms: u64,
    /// Extra attempts after a transport failure. RPC-level errors are never retried.
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    /// Answer only from the cache.
    pub offline: bool,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_RPC_URL.to_string(),
            user: None,
            password: None,
            timeout_ms: TIMEOUT_MS,
            rate_limit_ms: 0,
            max_retries: 0,
            retry_backoff_ms: RETRY_BACKOFF_MS,
            offline: false,
        }
    }
}

/// The RPC calls the reader issues.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RpcCall {
    BlockCount,
    BlockHash(u64),
    /// `getblock <hash> 0`: raw serialized block.
    Block(BlockHash),
    /// `getrawtransaction <txid> false`: raw serialized transaction.
    RawTransaction(Txid),
}

impl RpcCall {
    pub fn method(&self) -> &'static str {
        match self {
            RpcCall::BlockCount => "getblockcount",
            RpcCall::BlockHash(_) => "getblockhash",
            RpcCall::Block(_) => "getblock",
            RpcCall::RawTransaction(_) => "getrawtransaction",
        }
    }

    pub fn params(&self) -> serde_json::Value {
        match self {
            RpcCall::BlockCount => serde_json::json!([]),
            RpcCall::BlockHash(height) => serde_json::json!([height]),
            RpcCall::Block(hash) => serde_json::json!([hash.to_string(), 0]),
            RpcCall::RawTransaction(txid) => serde_json::json!([txid.to_string(), false]),
        }
    }

    /// Cache key for calls whose answer is immutable; None for height and tip lookups,
    /// which move with the chain.
    fn cache_key(&self) -> Option<String> {
        match self {
            RpcCall::Block(_) | RpcCall::RawTransaction(_) => {
                let req = serde_json::json!({ "method": self.method(), "params": self.params() });
                Some(Cache::key_for(&req.to_string()))
            }
            RpcCall::BlockCount | RpcCall::BlockHash(_) => None,
        }
    }

    /// Map a node error to a chain error, using the call to tell "not found" apart from
    /// other failures.
    pub fn map_error(&self, err: RpcErrorObject) -> ChainError {
        match (self, err.code) {
            (RpcCall::BlockHash(height), RPC_INVALID_PARAMETER) => {
                ChainError::HeightNotFound(*height)
            }
            (RpcCall::Block(hash), RPC_INVALID_ADDRESS_OR_KEY) => ChainError::BlockNotFound(*hash),
            (RpcCall::RawTransaction(txid), RPC_INVALID_ADDRESS_OR_KEY) => {
                ChainError::TxNotFound(*txid)
            }
            _ => ChainError::Rpc {
                code: err.code,
                message: err.message,
            },
        }
    }
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
}

/// JSON-RPC 1.0 response envelope as returned by Bitcoin Core.
#[derive(Clone, Debug, Deserialize)]
pub struct RpcResponse {
    pub result: Option<serde_json::Value>,
    pub error: Option<RpcErrorObject>,
    pub id: Option<serde_json::Value>,
}

impl RpcResponse {
    pub fn into_result<T: DeserializeOwned>(self, call: &RpcCall) -> Result<T, ChainError> {
        if let Some(err) = self.error {
            return Err(call.map_error(err));
        }
        let value = self.result.unwrap_or(serde_json::Value::Null);
        serde_json::from_value(value)
            .map_err(|e| ChainError::Decode(format!("{} result: {}", call.method(), e)))
    }

    fn is_success(&self) -> bool {
        self.error.is_none() && self.result.is_some()
    }
}

/// Decode a hex-encoded consensus object (block or transaction) as returned with verbosity 0.
pub fn decode_hex<T: Decodable>(what: &str, raw: &str) -> Result<T, ChainError> {
    let bytes = hex::decode(raw.trim()).map_err(|e| ChainError::Decode(format!("{}: {}", what, e)))?;
    bitcoin::consensus::deserialize(&bytes)
        .map_err(|e| ChainError::Decode(format!("{}: {}", what, e)))
}

/// Chain reader backed by a Bitcoin Core node. The node needs `txindex=1` to serve
/// previous transactions that are no longer in the mempool.
pub struct RpcClient {
    config: RpcConfig,
    url: Url,
    client: Option<reqwest::Client>,
    cache: Option<Cache>,
    last_request: Mutex<Option<Instant>>,
    request_count: AtomicU64,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(config: RpcConfig, cache: Option<Cache>) -> Result<Self, ChainError> {
        let url = Url::parse(&config.url)
            .map_err(|e| ChainError::Config(format!("invalid rpc url {:?}: {}", config.url, e)))?;
        let client = if config.offline {
            None
        } else {
            Some(
                reqwest::Client::builder()
                    .use_rustls_tls()
                    .timeout(Duration::from_millis(config.timeout_ms))
                    .build()?,
            )
        };
        Ok(Self {
            config,
            url,
            client,
            cache,
            last_request: Mutex::new(None),
            request_count: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
        })
    }

    /// Requests actually sent to the node (cache hits excluded).
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    /// Reserve the next send slot, at least `rate_limit_ms` after the previously reserved one,
    /// and wait for it. The slot is taken under the lock so concurrent callers queue up.
    async fn rate_limit(&self) {
        if self.config.rate_limit_ms == 0 {
            return;
        }
        let min_gap = Duration::from_millis(self.config.rate_limit_ms);
        let slot = {
            let mut last = self.last_request.lock().unwrap_or_else(PoisonError::into_inner);
            let now = Instant::now();
            let next = match *last {
                Some(prev) => (prev + min_gap).max(now),
                None => now,
            };
            *last = Some(next);
            next
        };
        tokio::time::sleep_until(tokio::time::Instant::from_std(slot)).await;
    }

    async fn call<T: DeserializeOwned>(&self, call: &RpcCall) -> Result<T, ChainError> {
        let cache_key = call.cache_key();
        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            if let Some(cached) = cache.get_json(key)? {
                debug!(key = %key, method = call.method(), "cache hit");
                let response: RpcResponse = serde_json::from_str(&cached)
                    .map_err(|e| ChainError::Decode(format!("cached {}: {}", call.method(), e)))?;
                return response.into_result(call);
            }
        }
        if self.config.offline {
            return Err(ChainError::Unavailable(format!(
                "offline mode: no cached response for {}",
                call.method()
            )));
        }

        let (response, body) = self.send(call).await?;
        if response.is_success() {
            if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
                if let Err(e) = cache.set_json(key, call.method(), &body) {
                    warn!(error = %e, method = call.method(), "cache write failed");
                }
            }
        }
        response.into_result(call)
    }

    async fn send(&self, call: &RpcCall) -> Result<(RpcResponse, String), ChainError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| ChainError::Unavailable("no http client in offline mode".to_string()))?;

        let request = RpcRequest {
            jsonrpc: "1.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method: call.method(),
            params: call.params(),
        };
        let mut last_err = None;
        for attempt in 0..=self.config.max_retries {
            self.rate_limit().await;
            let mut builder = client.post(self.url.clone()).json(&request);
            if let Some(user) = &self.config.user {
                builder = builder.basic_auth(user, self.config.password.as_ref());
            }
            match builder.send().await {
                Ok(r) => {
                    let status = r.status();
                    let body = r.text().await?;
                    self.request_count.fetch_add(1, Ordering::Relaxed);
                    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                        return Err(ChainError::Config(format!(
                            "rpc credentials rejected (http status {})",
                            status.as_u16()
                        )));
                    }
                    // Bitcoin Core reports RPC errors as HTTP 404/500 with a JSON body.
                    if let Ok(response) = serde_json::from_str::<RpcResponse>(&body) {
                        return Ok((response, body));
                    }
                    let snippet: String = body.chars().take(200).collect();
                    last_err = Some(ChainError::Unavailable(format!(
                        "http status {}: {}",
                        status.as_u16(),
                        snippet
                    )));
                    if !status.is_server_error() {
                        break;
                    }
                }
                Err(e) => {
                    last_err = Some(ChainError::from(e));
                }
            }
            if attempt < self.config.max_retries {
                let ms = self.config.retry_backoff_ms * (1 << attempt.min(16));
                warn!(attempt, ms, method = call.method(), "retry after transport error");
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
        }
        Err(last_err.unwrap_or_else(|| ChainError::Unavailable("no attempt made".to_string())))
    }
}

#[async_trait]
impl ChainReader for RpcClient {
    async fn tip_height(&self) -> Result<u64, ChainError> {
        self.call(&RpcCall::BlockCount).await
    }

    async fn block_hash(&self, height: u64) -> Result<BlockHash, ChainError> {
        let hash: String = self.call(&RpcCall::BlockHash(height)).await?;
        hash.parse()
            .map_err(|e| ChainError::Decode(format!("block hash {:?}: {}", hash, e)))
    }

    async fn block_by_hash(&self, hash: &BlockHash) -> Result<Block, ChainError> {
        let raw: String = self.call(&RpcCall::Block(*hash)).await?;
        decode_hex("block", &raw)
    }

    async fn transaction(&self, txid: &Txid) -> Result<Transaction, ChainError> {
        let raw: String = self.call(&RpcCall::RawTransaction(*txid)).await?;
        decode_hex("transaction", &raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use bitcoin::absolute::LockTime;
    use bitcoin::hashes::Hash;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, ScriptBuf, TxOut};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use tempfile::NamedTempFile;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn sample_tx() -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![TxOut {
                value: Amount::from_sat(5_000),
                script_pubkey: ScriptBuf::from_bytes(
                    hex::decode("76a91412ab8dc588ca9d5787dde7eb29569da63c3a238c88ac").unwrap(),
                ),
            }],
        }
    }

    #[test]
    fn params_follow_bitcoin_core_signatures() {
        let txid = Txid::all_zeros();
        assert_eq!(RpcCall::BlockHash(100).params(), serde_json::json!([100]));
        assert_eq!(
            RpcCall::RawTransaction(txid).params(),
            serde_json::json!([txid.to_string(), false])
        );
        assert_eq!(
            RpcCall::Block(BlockHash::all_zeros()).params()[1],
            serde_json::json!(0)
        );
        assert_eq!(RpcCall::BlockCount.method(), "getblockcount");
    }

    #[test]
    fn only_immutable_calls_are_cacheable() {
        assert!(RpcCall::BlockCount.cache_key().is_none());
        assert!(RpcCall::BlockHash(1).cache_key().is_none());
        assert!(RpcCall::Block(BlockHash::all_zeros()).cache_key().is_some());
        assert!(RpcCall::RawTransaction(Txid::all_zeros())
            .cache_key()
            .is_some());
    }

    #[test]
    fn not_found_codes_depend_on_call() {
        let err = |code| RpcErrorObject {
            code,
            message: "x".to_string(),
        };
        let txid = Txid::all_zeros();
        assert!(matches!(
            RpcCall::BlockHash(7).map_error(err(-8)),
            ChainError::HeightNotFound(7)
        ));
        assert!(matches!(
            RpcCall::RawTransaction(txid).map_error(err(-5)),
            ChainError::TxNotFound(t) if t == txid
        ));
        assert!(matches!(
            RpcCall::Block(BlockHash::all_zeros()).map_error(err(-5)),
            ChainError::BlockNotFound(_)
        ));
        assert_eq!(
            RpcCall::RawTransaction(txid).map_error(err(-1)).kind(),
            ErrorKind::Rpc
        );
    }

    #[test]
    fn decode_hex_rejects_garbage() {
        let err = decode_hex::<Transaction>("transaction", "zz").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Decode);
        let err = decode_hex::<Transaction>("transaction", "0100").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Decode);
    }

    #[test]
    fn new_rejects_invalid_url() {
        let config = RpcConfig {
            url: "not a url".to_string(),
            ..Default::default()
        };
        let err = RpcClient::new(config, None).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::ChainUnavailable);
    }

    #[tokio::test]
    async fn offline_without_cache_is_unavailable() {
        let config = RpcConfig {
            offline: true,
            ..Default::default()
        };
        let client = RpcClient::new(config, None).unwrap();
        let err = client.tip_height().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChainUnavailable);
        assert_eq!(client.request_count(), 0);
    }

    #[tokio::test]
    async fn offline_serves_cached_transaction() {
        let tmp = NamedTempFile::new().unwrap();
        let cache = Cache::open(tmp.path()).unwrap();
        let tx = sample_tx();
        let txid = tx.compute_txid();
        let call = RpcCall::RawTransaction(txid);
        let body = serde_json::json!({
            "result": bitcoin::consensus::encode::serialize_hex(&tx),
            "error": null,
            "id": 1
        })
        .to_string();
        cache
            .set_json(&call.cache_key().unwrap(), call.method(), &body)
            .unwrap();

        let config = RpcConfig {
            offline: true,
            ..Default::default()
        };
        let client = RpcClient::new(config, Some(cache)).unwrap();
        let fetched = client.transaction(&txid).await.unwrap();
        assert_eq!(fetched, tx);
        assert_eq!(client.request_count(), 0);

        let other = Txid::all_zeros();
        let err = client.transaction(&other).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChainUnavailable);
    }

    #[tokio::test]
    async fn concurrent_requests_are_spaced() {
        let config = RpcConfig {
            rate_limit_ms: 100,
            offline: true,
            ..Default::default()
        };
        let client = RpcClient::new(config, None).unwrap();
        let start = Instant::now();
        tokio::join!(client.rate_limit(), client.rate_limit(), client.rate_limit());
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    async fn read_request(socket: &mut TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = socket.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
                let len = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + len {
                    return;
                }
            }
        }
    }

    /// Node stand-in answering each connection with the next canned `(status, body)`; the
    /// last one repeats. Returns the url and a connection counter.
    async fn stub_node(responses: Vec<(u16, &'static str)>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let i = counter.fetch_add(1, Ordering::SeqCst);
                let (status, body) = responses[i.min(responses.len() - 1)];
                read_request(&mut socket).await;
                let reply = format!(
                    "HTTP/1.1 {} Stub\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(reply.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (url, hits)
    }

    fn stub_client(url: String, max_retries: u32) -> RpcClient {
        let config = RpcConfig {
            url,
            user: Some("user".to_string()),
            password: Some("pass".to_string()),
            timeout_ms: 5_000,
            max_retries,
            retry_backoff_ms: 1,
            ..Default::default()
        };
        RpcClient::new(config, None).unwrap()
    }

    #[tokio::test]
    async fn server_error_without_json_is_retried() {
        let (url, hits) = stub_node(vec![
            (503, "Work queue depth exceeded"),
            (200, r#"{"result":840000,"error":null,"id":1}"#),
        ])
        .await;
        let client = stub_client(url, 2);
        assert_eq!(client.tip_height().await.unwrap(), 840_000);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(client.request_count(), 2);
    }

    #[tokio::test]
    async fn client_error_without_json_is_not_retried() {
        let (url, hits) = stub_node(vec![(404, "no such path")]).await;
        let client = stub_client(url, 3);
        let err = client.tip_height().await.unwrap_err();
        assert!(matches!(err, ChainError::Unavailable(_)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn json_error_on_http_500_is_decoded() {
        let (url, hits) = stub_node(vec![(
            500,
            r#"{"result":null,"error":{"code":-8,"message":"Block height out of range"},"id":1}"#,
        )])
        .await;
        let client = stub_client(url, 3);
        let err = client.block_hash(10_000_000).await.unwrap_err();
        assert!(matches!(err, ChainError::HeightNotFound(10_000_000)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejected_credentials_are_a_config_error() {
        let (url, hits) = stub_node(vec![(401, "")]).await;
        let client = stub_client(url, 3);
        let err = client.tip_height().await.unwrap_err();
        assert!(matches!(err, ChainError::Config(_)));
        assert!(!err.is_transient());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
