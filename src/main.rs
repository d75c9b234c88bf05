use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::LevelFilter;
use simple_logger::SimpleLogger;
use tokio::signal;

use ledger_node::api::run_api;
use ledger_node::config::{self, DiscoveryConfig, NodeConfig};
use ledger_node::node::Node;
use ledger_node::sync::HttpSync;
use ledger_node::wallet::Wallet;

#[derive(Parser)]
#[command(version, about, long_about = "Proof-of-work ledger node")]
struct Args {
    /// Address the HTTP API listens on and peers are discovered around.
    #[arg(long, default_value_t = config::DEFAULT_HOST)]
    host: Ipv4Addr,
    #[arg(short, long, default_value_t = config::DEFAULT_PORT)]
    port: u16,
    /// Leading zero hex digits a block hash must have.
    #[arg(short, long, default_value_t = config::MINING_DIFFICULTY)]
    difficulty: usize,
    #[arg(long, default_value_t = config::MINING_REWARD)]
    reward: f64,
    /// Seconds between the end of one mining round and the start of the next.
    #[arg(long, default_value_t = config::MINING_TIMER_SECS)]
    mining_interval: u64,
    /// Seconds between peer discovery and chain sync rounds.
    #[arg(long, default_value_t = config::NEIGHBOR_SYNC_TIMER_SECS)]
    sync_interval: u64,
    /// Timeout in milliseconds for every request to a peer.
    #[arg(long, default_value_t = config::PEER_TIMEOUT_MS)]
    peer_timeout: u64,
    /// Largest nonce tried per mining attempt.
    #[arg(long, default_value_t = u64::from(u32::MAX))]
    max_nonce: u64,
    #[arg(long, default_value_t = *config::NEIGHBOR_IP_RANGE.start())]
    neighbor_ip_start: u8,
    #[arg(long, default_value_t = *config::NEIGHBOR_IP_RANGE.end())]
    neighbor_ip_end: u8,
    #[arg(long, default_value_t = *config::BLOCKCHAIN_PORT_RANGE.start())]
    port_range_start: u16,
    #[arg(long, default_value_t = *config::BLOCKCHAIN_PORT_RANGE.end())]
    port_range_end: u16,
    /// Do not start the mining loop at boot. It can be started with GET /mine/start.
    #[arg(long)]
    idle: bool,
    #[arg(long, default_value_t = LevelFilter::Info)]
    log_level: LevelFilter,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    SimpleLogger::new()
        .with_level(LevelFilter::Warn)
        .with_module_level("ledger_node", args.log_level)
        .init()
        .expect("simple_logger init failed");

    let miner = Wallet::new();
    log::info!("Miner public key: {}", miner.public_key().to_hex());
    log::info!("Miner blockchain address: {}", miner.blockchain_address());

    let discovery = DiscoveryConfig {
        host: args.host,
        port: args.port,
        ip_range: args.neighbor_ip_start..=args.neighbor_ip_end,
        port_range: args.port_range_start..=args.port_range_end,
        timeout: Duration::from_millis(args.peer_timeout),
    };
    let sync = match HttpSync::new(discovery) {
        Ok(sync) => sync,
        Err(error) => {
            log::error!("Failed to create peer client: {}", error);
            exit(1);
        }
    };

    let node_config = NodeConfig {
        difficulty: args.difficulty,
        mining_reward: args.reward,
        max_nonce: args.max_nonce,
        mining_interval: Duration::from_secs(args.mining_interval),
        sync_interval: Duration::from_secs(args.sync_interval),
        mine_on_start: !args.idle,
        ..NodeConfig::default()
    };
    let node = match Node::with_proof_of_work(node_config, miner.blockchain_address(), Arc::new(sync)) {
        Ok(node) => Arc::new(node),
        Err(error) => {
            log::error!("Failed to create node: {}", error);
            exit(1);
        }
    };

    let token = node.shutdown_token();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                log::info!("Shutdown signal received");
                token.cancel();
            }
            Err(error) => log::error!("Failed to listen for shutdown signal: {}", error),
        }
    });

    node.start().await;

    let address = SocketAddr::V4(SocketAddrV4::new(args.host, args.port));
    if let Err(error) = run_api(address, node).await {
        log::error!("{}", error);
        exit(1);
    }
    log::debug!("Done!");
}
