//! btc-indexer CLI: tip, block, tx, scan, resolve.

use btc_indexer::bitcoin::{Network, ScriptBuf, Txid};
use btc_indexer::{
    block_digest, classify, parse_network, resolve_address, Cache, ChainReader, Indexer,
    IndexerConfig, ParseResult, RpcClient, RpcConfig,
};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{error, info};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    match cli.command {
        Command::Tip => run_tip(&cli.node),
        Command::Block(args) => run_block(&cli.node, args),
        Command::Tx(args) => run_tx(&cli.node, args),
        Command::Scan(args) => run_scan(&cli.node, args),
        Command::Resolve(args) => run_resolve(&cli.node, &args),
    }
}

#[derive(Parser)]
#[command(name = "btc-indexer")]
#[command(about = "Find payments to a Bitcoin address and the addresses that funded them")]
struct Cli {
    #[command(flatten)]
    node: NodeArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct NodeArgs {
    #[arg(long, global = true, env = "BTC_INDEXER_RPC_URL", default_value = "http://127.0.0.1:8332")]
    rpc_url: String,
    #[arg(long, global = true, env = "BTC_INDEXER_RPC_USER")]
    rpc_user: Option<String>,
    #[arg(long, global = true, env = "BTC_INDEXER_RPC_PASSWORD", hide_env_values = true)]
    rpc_password: Option<String>,
    /// mainnet, testnet, signet or regtest.
    #[arg(long, global = true, default_value = "mainnet")]
    network: String,
    #[arg(long, global = true, default_value = "./data/cache")]
    cache_dir: PathBuf,
    /// Serve blocks and transactions from the cache only.
    #[arg(long, global = true)]
    offline: bool,
    /// Transactions fetched at the same time while parsing a block.
    #[arg(long, global = true, default_value_t = 1)]
    concurrency: usize,
    #[arg(long, global = true, default_value_t = 30_000)]
    timeout_ms: u64,
    /// Extra attempts on transport failures.
    #[arg(long, global = true, default_value_t = 0)]
    retries: u32,
}

#[derive(Subcommand)]
enum Command {
    /// Print the node's best block height.
    Tip,
    /// Print the payments to an address in one block.
    Block(BlockArgs),
    /// Print the payments to an address made by one transaction.
    Tx(TxArgs),
    /// Parse a range of heights, one JSON line per block.
    Scan(ScanArgs),
    /// Classify a hex scriptPubKey and print its address.
    Resolve(ResolveArgs),
}

#[derive(Args)]
struct BlockArgs {
    #[arg(long)]
    height: u64,
    #[arg(long)]
    address: String,
}

#[derive(Args)]
struct TxArgs {
    #[arg(long)]
    txid: Txid,
    #[arg(long)]
    address: String,
}

#[derive(Args)]
struct ScanArgs {
    #[arg(long)]
    from: u64,
    /// Last height, inclusive. Defaults to the tip.
    #[arg(long)]
    to: Option<u64>,
    #[arg(long)]
    address: String,
}

#[derive(Args)]
struct ResolveArgs {
    #[arg(long)]
    script: String,
}

#[derive(Serialize)]
struct BlockLine<'a> {
    height: u64,
    digest: String,
    results: &'a [ParseResult],
}

fn cache_path(cache_dir: &Path) -> PathBuf {
    cache_dir.join("rpc_cache.sqlite")
}

impl NodeArgs {
    fn network(&self) -> Result<Network, Box<dyn std::error::Error>> {
        Ok(parse_network(&self.network)?)
    }

    fn client(&self) -> Result<RpcClient, Box<dyn std::error::Error>> {
        let cache = Cache::open(cache_path(&self.cache_dir))?;
        let config = RpcConfig {
            url: self.rpc_url.clone(),
            user: self.rpc_user.clone(),
            password: self.rpc_password.clone(),
            timeout_ms: self.timeout_ms,
            max_retries: self.retries,
            offline: self.offline,
            ..Default::default()
        };
        Ok(RpcClient::new(config, Some(cache))?)
    }

    fn indexer(&self, address: &str) -> Result<Indexer<RpcClient>, Box<dyn std::error::Error>> {
        let config = IndexerConfig::new(self.network()?, address).with_concurrency(self.concurrency);
        Ok(Indexer::new(self.client()?, config)?)
    }
}

fn run_tip(node: &NodeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let client = node.client()?;
    let rt = tokio::runtime::Runtime::new()?;
    let tip = rt.block_on(async { client.tip_height().await })?;
    println!("{}", tip);
    Ok(())
}

fn run_block(node: &NodeArgs, args: BlockArgs) -> Result<(), Box<dyn std::error::Error>> {
    let indexer = node.indexer(&args.address)?;
    let rt = tokio::runtime::Runtime::new()?;
    let results = rt.block_on(async { indexer.parse_block(args.height).await })?;
    info!(
        height = args.height,
        matches = results.len(),
        requests = indexer.reader().request_count(),
        "block complete"
    );
    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}

fn run_tx(node: &NodeArgs, args: TxArgs) -> Result<(), Box<dyn std::error::Error>> {
    let indexer = node.indexer(&args.address)?;
    let rt = tokio::runtime::Runtime::new()?;
    let results = rt.block_on(async { indexer.parse_transaction(&args.txid).await })?;
    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}

fn run_scan(node: &NodeArgs, args: ScanArgs) -> Result<(), Box<dyn std::error::Error>> {
    let indexer = node.indexer(&args.address)?;
    let rt = tokio::runtime::Runtime::new()?;
    let to = match args.to {
        Some(to) => to,
        None => rt.block_on(async { indexer.latest_block().await })?,
    };
    info!(from = args.from, to, address = %indexer.watched_address(), "scan start");
    let mut total = 0usize;
    for height in args.from..=to {
        let results = match rt.block_on(async { indexer.parse_block(height).await }) {
            Ok(r) => r,
            Err(e) => {
                error!(height, kind = %e.kind(), retryable = e.is_retryable(), error = %e, "scan stopped");
                return Err(e.into());
            }
        };
        total += results.len();
        let line = BlockLine {
            height,
            digest: block_digest(height, &results)?,
            results: &results,
        };
        println!("{}", serde_json::to_string(&line)?);
    }
    info!(
        matches = total,
        requests = indexer.reader().request_count(),
        "scan complete"
    );
    Ok(())
}

fn run_resolve(node: &NodeArgs, args: &ResolveArgs) -> Result<(), Box<dyn std::error::Error>> {
    let network = node.network()?;
    let script = ScriptBuf::from_bytes(hex::decode(args.script.trim())?);
    let kind = classify(&script);
    match resolve_address(&script, network) {
        Ok(address) => println!("{}\t{}", kind, address),
        Err(e) => println!("{}\tunparsable ({})", kind, e),
    }
    Ok(())
}
