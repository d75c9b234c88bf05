//! Node configuration and its defaults.

use std::net::Ipv4Addr;
use std::ops::RangeInclusive;
use std::time::Duration;

pub const DEFAULT_HOST: Ipv4Addr = Ipv4Addr::LOCALHOST;
pub const DEFAULT_PORT: u16 = 5000;
pub const MINING_DIFFICULTY: usize = 3;
pub const MINING_REWARD: f64 = 1.0;
pub const MINING_TIMER_SECS: u64 = 20;
pub const NEIGHBOR_SYNC_TIMER_SECS: u64 = 20;
pub const PEER_TIMEOUT_MS: u64 = 3000;
/// Attempts (each with a fresh timestamp) before a mining round gives up.
pub const MAX_MINING_ATTEMPTS: u32 = 3;
pub const NEIGHBOR_IP_RANGE: RangeInclusive<u8> = 0..=1;
pub const BLOCKCHAIN_PORT_RANGE: RangeInclusive<u16> = 5000..=5004;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub difficulty: usize,
    pub mining_reward: f64,
    pub max_nonce: u64,
    pub max_mining_attempts: u32,
    pub mining_interval: Duration,
    pub sync_interval: Duration,
    /// Start the mining loop as part of `Node::start`.
    pub mine_on_start: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            difficulty: MINING_DIFFICULTY,
            mining_reward: MINING_REWARD,
            max_nonce: u64::from(u32::MAX),
            max_mining_attempts: MAX_MINING_ATTEMPTS,
            mining_interval: Duration::from_secs(MINING_TIMER_SECS),
            sync_interval: Duration::from_secs(NEIGHBOR_SYNC_TIMER_SECS),
            mine_on_start: true,
        }
    }
}

/// Where to look for sibling nodes and how long to wait for them.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub host: Ipv4Addr,
    pub port: u16,
    /// Offsets added to the last octet of `host`.
    pub ip_range: RangeInclusive<u8>,
    pub port_range: RangeInclusive<u16>,
    pub timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST,
            port: DEFAULT_PORT,
            ip_range: NEIGHBOR_IP_RANGE,
            port_range: BLOCKCHAIN_PORT_RANGE,
            timeout: Duration::from_millis(PEER_TIMEOUT_MS),
        }
    }
}
