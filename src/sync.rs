use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddrV4};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::DiscoveryConfig;
use crate::types::{Block, ChainResponse, TransactionRequest};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Peer {0} unreachable: {1}")]
    PeerUnreachable(String, String),
    #[error("Peer {0} answered with status {1}")]
    UnexpectedStatus(String, u16),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Connection timeout")]
    ConnectionTimeout,
    #[error("HTTP client error: {0}")]
    ClientError(#[from] reqwest::Error),
}

/// Everything the node says to, or asks of, its peers.
///
/// All calls are best-effort from the caller's point of view: the node logs
/// failures and carries on.
#[async_trait]
pub trait SyncLayer: Send + Sync {
    /// Fetch a peer's full chain.
    async fn fetch_chain(&self, peer: &str) -> Result<Vec<Block>, SyncError>;

    /// Forward a signed transaction so the peer admits it to its own pool.
    async fn relay_transaction(&self, peer: &str, request: &TransactionRequest) -> Result<(), SyncError>;

    /// Ask a peer to empty its pool after we mined a block.
    async fn clear_pool(&self, peer: &str) -> Result<(), SyncError>;

    /// Ask a peer to run conflict resolution against its own peers.
    async fn request_consensus(&self, peer: &str) -> Result<(), SyncError>;

    /// Find reachable sibling nodes.
    async fn discover_peers(&self) -> Result<Vec<String>, SyncError>;
}

/// Peer traffic over the node's own HTTP API.
pub struct HttpSync {
    client: reqwest::Client,
    discovery: DiscoveryConfig,
}

impl HttpSync {
    pub fn new(discovery: DiscoveryConfig) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .connect_timeout(discovery.timeout)
            .timeout(discovery.timeout)
            .build()?;
        Ok(Self { client, discovery })
    }

    fn endpoint(peer: &str, path: &str) -> String {
        format!("http://{}{}", peer, path)
    }

    async fn send(&self, peer: &str, request: reqwest::RequestBuilder) -> Result<reqwest::Response, SyncError> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SyncError::ConnectionTimeout
            } else {
                SyncError::PeerUnreachable(peer.to_string(), e.to_string())
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::UnexpectedStatus(peer.to_string(), status.as_u16()));
        }
        Ok(response)
    }

    /// Addresses to probe: every port of the range on every host offset,
    /// minus our own listen address.
    pub fn candidates(&self) -> Vec<SocketAddrV4> {
        let [a, b, c, d] = self.discovery.host.octets();
        let mut candidates = Vec::new();
        for port in self.discovery.port_range.clone() {
            for offset in self.discovery.ip_range.clone() {
                let Some(last) = d.checked_add(offset) else {
                    continue;
                };
                let ip = Ipv4Addr::new(a, b, c, last);
                if ip == self.discovery.host && port == self.discovery.port {
                    continue;
                }
                candidates.push(SocketAddrV4::new(ip, port));
            }
        }
        candidates
    }
}

#[async_trait]
impl SyncLayer for HttpSync {
    async fn fetch_chain(&self, peer: &str) -> Result<Vec<Block>, SyncError> {
        let request = self.client.get(Self::endpoint(peer, "/"));
        let response = self.send(peer, request).await?;
        let body: ChainResponse = response
            .json()
            .await
            .map_err(|e| SyncError::SerializationError(e.to_string()))?;
        Ok(body.chain)
    }

    async fn relay_transaction(&self, peer: &str, request: &TransactionRequest) -> Result<(), SyncError> {
        let builder = self.client.put(Self::endpoint(peer, "/transactions")).json(request);
        self.send(peer, builder).await?;
        Ok(())
    }

    async fn clear_pool(&self, peer: &str) -> Result<(), SyncError> {
        let builder = self.client.delete(Self::endpoint(peer, "/transactions"));
        self.send(peer, builder).await?;
        Ok(())
    }

    async fn request_consensus(&self, peer: &str) -> Result<(), SyncError> {
        let builder = self.client.put(Self::endpoint(peer, "/consensus"));
        self.send(peer, builder).await?;
        Ok(())
    }

    async fn discover_peers(&self) -> Result<Vec<String>, SyncError> {
        let mut peers = Vec::new();
        for address in self.candidates() {
            match timeout(self.discovery.timeout, TcpStream::connect(address)).await {
                Ok(Ok(_)) => peers.push(address.to_string()),
                Ok(Err(e)) => log::trace!("No node at {}: {}", address, e),
                Err(_) => log::trace!("Probe of {} timed out", address),
            }
        }
        Ok(peers)
    }
}

/// No-operation implementation for single-node use and testing.
#[derive(Debug, Clone, Default)]
pub struct NoopSync;

#[async_trait]
impl SyncLayer for NoopSync {
    async fn fetch_chain(&self, peer: &str) -> Result<Vec<Block>, SyncError> {
        Err(SyncError::PeerUnreachable(
            peer.to_string(),
            "no-op sync has no peers".to_string(),
        ))
    }

    async fn relay_transaction(&self, _peer: &str, _request: &TransactionRequest) -> Result<(), SyncError> {
        Ok(())
    }

    async fn clear_pool(&self, _peer: &str) -> Result<(), SyncError> {
        Ok(())
    }

    async fn request_consensus(&self, _peer: &str) -> Result<(), SyncError> {
        Ok(())
    }

    async fn discover_peers(&self) -> Result<Vec<String>, SyncError> {
        Ok(vec![])
    }
}
