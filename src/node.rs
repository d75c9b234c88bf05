use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::consensus::{ConsensusEngine, ConsensusError, ProofOfWork};
use crate::ledger::{valid_chain, Chain, LedgerError};
use crate::mempool::Mempool;
use crate::schedule::spawn_periodic;
use crate::sync::SyncLayer;
use crate::types::{
    format_hex, Block, CryptoError, PublicKey, RequestError, Transaction, TransactionRequest,
    TransactionSignature, COINBASE_SENDER,
};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Signature verification failed for transaction from {0}")]
    SignatureInvalid(String),
    #[error("Insufficient balance for transaction from {address}: has {balance}, sends {value}")]
    InsufficientBalance {
        address: String,
        balance: f64,
        value: f64,
    },
    #[error("Request error: {0}")]
    RequestError(#[from] RequestError),
    #[error("Ledger error: {0}")]
    LedgerError(#[from] LedgerError),
    #[error("Consensus error: {0}")]
    ConsensusError(#[from] ConsensusError),
    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
    #[error("Mining task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),
}

/// Chain and mempool. They change together, so they share one lock.
#[derive(Debug)]
struct LedgerState {
    chain: Chain,
    mempool: Mempool,
}

/// A single ledger node.
///
/// Owns the chain and mempool behind one read/write lock and the peer list
/// behind another. Mining, admission, pool clearing and chain replacement
/// take the write lock; queries take the read lock. Peer traffic never
/// happens while the chain lock is held.
pub struct Node {
    config: NodeConfig,
    miner_address: String,
    consensus: Arc<dyn ConsensusEngine>,
    sync: Arc<dyn SyncLayer>,
    state: RwLock<LedgerState>,
    peers: RwLock<Vec<String>>,
    mining: AtomicBool,
    shutdown: CancellationToken,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        miner_address: impl Into<String>,
        consensus: Arc<dyn ConsensusEngine>,
        sync: Arc<dyn SyncLayer>,
    ) -> Result<Self, NodeError> {
        Ok(Node {
            config,
            miner_address: miner_address.into(),
            consensus,
            sync,
            state: RwLock::new(LedgerState {
                chain: Chain::new()?,
                mempool: Mempool::new(),
            }),
            peers: RwLock::new(Vec::new()),
            mining: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    /// Node using leading-zero proof of work at the configured difficulty.
    pub fn with_proof_of_work(
        config: NodeConfig,
        miner_address: impl Into<String>,
        sync: Arc<dyn SyncLayer>,
    ) -> Result<Self, NodeError> {
        let consensus = Arc::new(ProofOfWork::new(config.difficulty, config.max_nonce));
        Self::new(config, miner_address, consensus, sync)
    }

    pub fn miner_address(&self) -> &str {
        &self.miner_address
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_mining(&self) -> bool {
        self.mining.load(Ordering::SeqCst)
    }

    pub async fn chain(&self) -> Vec<Block> {
        self.state.read().await.chain.blocks().to_vec()
    }

    pub async fn chain_len(&self) -> usize {
        self.state.read().await.chain.len()
    }

    pub async fn transaction_pool(&self) -> Vec<Transaction> {
        self.state.read().await.mempool.snapshot()
    }

    pub async fn calculate_total_amount(&self, address: &str) -> f64 {
        self.state.read().await.chain.calculate_total_amount(address)
    }

    pub async fn peers(&self) -> Vec<String> {
        self.peers.read().await.clone()
    }

    pub async fn set_peers(&self, peers: Vec<String>) {
        *self.peers.write().await = peers;
    }

    pub async fn refresh_peers(&self) {
        match self.sync.discover_peers().await {
            Ok(peers) => {
                log::debug!("Neighbors: {:?}", peers);
                self.set_peers(peers).await;
            }
            Err(e) => log::warn!("Peer discovery failed: {}", e),
        }
    }

    fn admit(
        state: &mut LedgerState,
        sender: &str,
        recipient: &str,
        value: f64,
        public_key: Option<&PublicKey>,
        signature: Option<&TransactionSignature>,
    ) -> Result<(), NodeError> {
        let transaction = Transaction::new(sender, recipient, value);

        if transaction.is_coinbase() {
            state.mempool.push_front(transaction);
            return Ok(());
        }

        let verified = match (public_key, signature) {
            (Some(public_key), Some(signature)) => transaction.verify_signature(public_key, signature),
            _ => false,
        };
        if !verified {
            log::warn!("Transaction from {} rejected: signature verification failed", sender);
            return Err(NodeError::SignatureInvalid(sender.to_string()));
        }

        let balance = state.chain.calculate_total_amount(sender);
        if balance < value {
            log::warn!(
                "Transaction from {} rejected: balance {} below value {}",
                sender,
                balance,
                value
            );
            return Err(NodeError::InsufficientBalance {
                address: sender.to_string(),
                balance,
                value,
            });
        }

        log::info!("Transaction admitted: {} -> {} ({})", sender, recipient, value);
        state.mempool.push_back(transaction);
        Ok(())
    }

    /// Admit a transaction to the pool.
    ///
    /// The coinbase sender skips every check and goes to the front of the
    /// pool. Anything else needs a valid signature and a confirmed balance
    /// of at least `value`, and is appended.
    pub async fn add_transaction(
        &self,
        sender: &str,
        recipient: &str,
        value: f64,
        public_key: Option<&PublicKey>,
        signature: Option<&TransactionSignature>,
    ) -> Result<(), NodeError> {
        let mut state = self.state.write().await;
        Self::admit(&mut state, sender, recipient, value, public_key, signature)
    }

    async fn add_signed(&self, request: &TransactionRequest) -> Result<(), NodeError> {
        let signed = request.decode()?;
        let transaction = &signed.transaction;
        self.add_transaction(
            &transaction.sender,
            &transaction.recipient,
            transaction.value,
            Some(&signed.public_key),
            Some(&signed.signature),
        )
        .await
    }

    /// Admit a wallet's transaction and gossip it to every peer.
    ///
    /// Relay failures are logged and never undo the local admission.
    pub async fn create_transaction(&self, request: &TransactionRequest) -> Result<(), NodeError> {
        self.add_signed(request).await?;
        for peer in self.peers().await {
            if let Err(e) = self.sync.relay_transaction(&peer, request).await {
                log::warn!("Failed to relay transaction to {}: {}", peer, e);
            }
        }
        Ok(())
    }

    /// Admit a transaction relayed by a peer, without gossiping it further.
    pub async fn relay_transaction(&self, request: &TransactionRequest) -> Result<(), NodeError> {
        self.add_signed(request).await
    }

    pub async fn clear_pool(&self) {
        self.state.write().await.mempool.clear();
    }

    async fn seal_block(&self, state: &LedgerState) -> Result<Block, NodeError> {
        let previous_hash = state.chain.last_block().calculate_hash()?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let timestamp = current_timestamp_nanos();
            let transactions = state.mempool.snapshot();
            let consensus = Arc::clone(&self.consensus);
            let abort = AbortOnDrop::default();
            let flag = Arc::clone(&abort.0);
            let mut search = tokio::task::spawn_blocking(move || {
                let sealed = consensus.seal(timestamp, &previous_hash, &transactions, &flag);
                (sealed, transactions)
            });
            let (sealed, transactions) = tokio::select! {
                joined = &mut search => joined?,
                _ = self.shutdown.cancelled() => {
                    abort.0.store(true, Ordering::SeqCst);
                    search.await?
                }
            };

            match sealed {
                Ok(nonce) => return Ok(Block::new(timestamp, nonce, previous_hash, transactions)),
                Err(ConsensusError::NonceSpaceExhausted(max_nonce))
                    if attempt < self.config.max_mining_attempts =>
                {
                    log::warn!(
                        "No nonce up to {} (attempt {}), retrying with a new timestamp",
                        max_nonce,
                        attempt
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Reward, seal, append and clear, all under one write lock. Either the
    /// block is appended or the reward is withdrawn again.
    async fn mine_locked(&self) -> Result<Block, NodeError> {
        let mut state = self.state.write().await;
        Self::admit(
            &mut state,
            COINBASE_SENDER,
            &self.miner_address,
            self.config.mining_reward,
            None,
            None,
        )?;
        log::info!("Start mining...");

        let sealed = match self.seal_block(&state).await {
            Ok(block) => state
                .chain
                .append(block.clone())
                .map(|_| block)
                .map_err(NodeError::from),
            Err(e) => Err(e),
        };
        match sealed {
            Ok(block) => {
                state.mempool.clear();
                Ok(block)
            }
            Err(e) => {
                state.mempool.pop_front();
                Err(e)
            }
        }
    }

    /// Mine one block: reward the miner, search for a nonce over the pool,
    /// append the block, clear the pool, then tell peers to clear their
    /// pools and re-run consensus.
    ///
    /// Mines even when the pool holds only the reward. If no nonce is found
    /// the reward transaction is withdrawn and the chain is left untouched.
    /// The round runs on its own task, so dropping the returned future does
    /// not interrupt it halfway; shutting the node down aborts the search.
    pub async fn mine(self: &Arc<Self>) -> Result<Block, NodeError> {
        let node = Arc::clone(self);
        let block = tokio::spawn(async move { node.mine_locked().await }).await??;
        log::info!(
            "action=mining, status=success, nonce={}, hash={}",
            block.nonce,
            format_hex(&block.calculate_hash()?)
        );

        for peer in self.peers().await {
            if let Err(e) = self.sync.clear_pool(&peer).await {
                log::warn!("Failed to clear pool on {}: {}", peer, e);
            }
            if let Err(e) = self.sync.request_consensus(&peer).await {
                log::warn!("Failed to request consensus from {}: {}", peer, e);
            }
        }
        Ok(block)
    }

    /// Longest-valid-chain fork choice.
    ///
    /// A peer chain replaces ours only if it is strictly longer than the
    /// longest seen so far and valid, so among equally long candidates the
    /// first one in peer order wins. Unreachable peers are skipped. Returns
    /// whether the local chain was replaced.
    pub async fn resolve_conflicts(&self) -> bool {
        let peers = self.peers().await;
        let mut candidates = Vec::with_capacity(peers.len());
        for peer in &peers {
            match self.sync.fetch_chain(peer).await {
                Ok(blocks) => candidates.push((peer.as_str(), blocks)),
                Err(e) => log::debug!("Skipping peer {}: {}", peer, e),
            }
        }

        let mut state = self.state.write().await;
        let mut max_length = state.chain.len();
        let mut longest = None;
        for (peer, blocks) in candidates {
            if blocks.len() > max_length && valid_chain(&blocks, self.consensus.as_ref()) {
                max_length = blocks.len();
                longest = Some((peer, blocks));
            }
        }

        match longest.map(|(peer, blocks)| (peer, Chain::from_blocks(blocks))) {
            Some((peer, Ok(chain))) => {
                state.chain.replace(chain);
                log::info!("Resolve conflicts replaced: {} blocks from {}", max_length, peer);
                true
            }
            Some((peer, Err(e))) => {
                log::warn!("Chain from {} could not be adopted: {}", peer, e);
                false
            }
            None => {
                log::info!("Resolve conflicts not replaced");
                false
            }
        }
    }

    /// Refresh the peer list, then reconcile with it.
    pub async fn sync_with_peers(&self) -> bool {
        self.refresh_peers().await;
        self.resolve_conflicts().await
    }

    /// Start the periodic mining loop. Returns `false` if it already runs.
    pub fn start_mining(self: &Arc<Self>) -> bool {
        if self.mining.swap(true, Ordering::SeqCst) {
            return false;
        }
        let node = Arc::clone(self);
        spawn_periodic(
            "mining",
            Duration::ZERO,
            self.config.mining_interval,
            self.shutdown.clone(),
            move || {
                let node = Arc::clone(&node);
                async move {
                    if let Err(e) = node.mine().await {
                        log::error!("Mining round failed: {}", e);
                    }
                }
            },
        );
        true
    }

    fn start_peer_sync(self: &Arc<Self>) {
        let node = Arc::clone(self);
        spawn_periodic(
            "peer-sync",
            self.config.sync_interval,
            self.config.sync_interval,
            self.shutdown.clone(),
            move || {
                let node = Arc::clone(&node);
                async move {
                    node.sync_with_peers().await;
                }
            },
        );
    }

    /// Boot sequence: find peers, adopt the longest valid chain among them,
    /// keep doing so periodically, and start mining unless configured idle.
    pub async fn start(self: &Arc<Self>) {
        log::info!("Finding neighbors and syncing chain...");
        self.sync_with_peers().await;
        self.start_peer_sync();
        if self.config.mine_on_start {
            log::info!("Activating mining...");
            self.start_mining();
        }
    }
}

/// Sets the shared abort flag when dropped, stopping a nonce search whose
/// waiter has gone away.
#[derive(Default)]
struct AbortOnDrop(Arc<AtomicBool>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

pub fn current_timestamp_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{NoopSync, SyncError};
    use crate::types::{Hash, SignedTransaction};
    use crate::wallet::Wallet;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockSync {
        peers: Vec<String>,
        chains: HashMap<String, Vec<Block>>,
        relayed: Mutex<Vec<String>>,
        cleared: Mutex<Vec<String>>,
        consensus_requests: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SyncLayer for MockSync {
        async fn fetch_chain(&self, peer: &str) -> Result<Vec<Block>, SyncError> {
            self.chains
                .get(peer)
                .cloned()
                .ok_or_else(|| SyncError::PeerUnreachable(peer.to_string(), "down".to_string()))
        }

        async fn relay_transaction(&self, peer: &str, _request: &TransactionRequest) -> Result<(), SyncError> {
            self.relayed.lock().unwrap().push(peer.to_string());
            Ok(())
        }

        async fn clear_pool(&self, peer: &str) -> Result<(), SyncError> {
            self.cleared.lock().unwrap().push(peer.to_string());
            Ok(())
        }

        async fn request_consensus(&self, peer: &str) -> Result<(), SyncError> {
            self.consensus_requests.lock().unwrap().push(peer.to_string());
            Err(SyncError::ConnectionTimeout)
        }

        async fn discover_peers(&self) -> Result<Vec<String>, SyncError> {
            Ok(self.peers.clone())
        }
    }

    /// Engine whose first `exhausted_attempts` seals run out of nonces and
    /// whose later seals block until released or aborted. Records every
    /// timestamp it is asked to seal.
    #[derive(Default)]
    struct ScriptedEngine {
        exhausted_attempts: usize,
        released: AtomicBool,
        timestamps: Mutex<Vec<i64>>,
    }

    impl ScriptedEngine {
        fn gated() -> Self {
            ScriptedEngine::default()
        }

        fn failing_first(exhausted_attempts: usize) -> Self {
            ScriptedEngine {
                exhausted_attempts,
                released: AtomicBool::new(true),
                ..ScriptedEngine::default()
            }
        }

        fn release(&self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    impl ConsensusEngine for ScriptedEngine {
        fn validate_block(&self, block: &Block, prev_block: &Block) -> Result<(), ConsensusError> {
            if block.previous_hash != prev_block.calculate_hash()? {
                return Err(ConsensusError::MismatchedPrevHash);
            }
            Ok(())
        }

        fn seal(
            &self,
            timestamp: i64,
            _previous_hash: &Hash,
            _transactions: &[Transaction],
            abort: &AtomicBool,
        ) -> Result<u64, ConsensusError> {
            let attempt = {
                let mut timestamps = self.timestamps.lock().unwrap();
                timestamps.push(timestamp);
                timestamps.len()
            };
            if attempt <= self.exhausted_attempts {
                return Err(ConsensusError::NonceSpaceExhausted(0));
            }
            while !self.released.load(Ordering::SeqCst) {
                if abort.load(Ordering::SeqCst) {
                    return Err(ConsensusError::SealAborted);
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            Ok(0)
        }
    }

    fn scripted_node(engine: Arc<ScriptedEngine>) -> Arc<Node> {
        Arc::new(Node::new(NodeConfig::default(), "miner", engine, Arc::new(NoopSync)).unwrap())
    }

    fn config(difficulty: usize) -> NodeConfig {
        NodeConfig {
            difficulty,
            max_nonce: u64::MAX,
            ..NodeConfig::default()
        }
    }

    fn node_with(sync: Arc<dyn SyncLayer>, miner: &str) -> Arc<Node> {
        Arc::new(Node::with_proof_of_work(config(2), miner, sync).unwrap())
    }

    fn solo_node(miner: &str) -> Arc<Node> {
        node_with(Arc::new(NoopSync), miner)
    }

    async fn chain_of_length(length: usize, miner: &str) -> Vec<Block> {
        let node = solo_node(miner);
        for _ in 1..length {
            node.mine().await.unwrap();
        }
        node.chain().await
    }

    async fn add_signed(node: &Node, signed: &SignedTransaction) -> Result<(), NodeError> {
        let transaction = &signed.transaction;
        node.add_transaction(
            &transaction.sender,
            &transaction.recipient,
            transaction.value,
            Some(&signed.public_key),
            Some(&signed.signature),
        )
        .await
    }

    fn signed(wallet: &Wallet, recipient: &str, value: f64) -> SignedTransaction {
        let (transaction, signature) = wallet.sign_transaction(recipient, value).unwrap();
        SignedTransaction {
            transaction,
            public_key: wallet.public_key().clone(),
            signature,
        }
    }

    #[tokio::test]
    async fn test_mining_clears_pool_and_extends_chain() {
        let node = solo_node("miner");
        node.add_transaction(COINBASE_SENDER, "someone", 5.0, None, None)
            .await
            .unwrap();

        let block = node.mine().await.unwrap();
        assert_eq!(node.chain_len().await, 2);
        assert!(node.transaction_pool().await.is_empty());
        assert_eq!(block.transactions[0].recipient, "miner");
        assert!(format_hex(&block.calculate_hash().unwrap()).starts_with("00"));
        assert_eq!(
            block.previous_hash,
            node.chain().await[0].calculate_hash().unwrap()
        );
    }

    #[tokio::test]
    async fn test_empty_pool_mining_at_difficulty_three() {
        let node = Arc::new(Node::with_proof_of_work(config(3), "miner", Arc::new(NoopSync)).unwrap());
        let block = node.mine().await.unwrap();
        assert!(format_hex(&block.calculate_hash().unwrap()).starts_with("000"));
        assert_eq!(block.transactions.len(), 1);
        assert!(block.transactions[0].is_coinbase());
    }

    #[tokio::test]
    async fn test_miner_balance_accumulates_rewards() {
        let node = solo_node("miner");
        assert_eq!(node.calculate_total_amount("miner").await, 0.0);
        node.mine().await.unwrap();
        assert_eq!(node.calculate_total_amount("miner").await, 1.0);
        node.mine().await.unwrap();
        assert_eq!(node.calculate_total_amount("miner").await, 2.0);
    }

    #[tokio::test]
    async fn test_admission_rules() {
        let wallet = Wallet::new();
        let node = solo_node(wallet.blockchain_address());

        let broke = signed(&wallet, "bob", 1.0);
        assert!(matches!(
            add_signed(&node, &broke).await,
            Err(NodeError::InsufficientBalance { .. })
        ));

        let mut tampered = broke.clone();
        let mut bytes = tampered.signature.to_bytes();
        bytes[5] ^= 0x01;
        tampered.signature = TransactionSignature::from_bytes(&bytes).unwrap();
        assert!(matches!(
            add_signed(&node, &tampered).await,
            Err(NodeError::SignatureInvalid(_))
        ));

        assert!(matches!(
            node.add_transaction(wallet.blockchain_address(), "bob", 1.0, None, None)
                .await,
            Err(NodeError::SignatureInvalid(_))
        ));

        node.mine().await.unwrap();
        let funded = signed(&wallet, "bob", 0.5);
        add_signed(&node, &funded).await.unwrap();
        node.add_transaction(COINBASE_SENDER, "carol", 1.0, None, None)
            .await
            .unwrap();

        let pool = node.transaction_pool().await;
        assert_eq!(pool.len(), 2);
        assert!(pool[0].is_coinbase());
        assert_eq!(pool[1], funded.transaction);
    }

    #[tokio::test]
    async fn test_pending_transactions_do_not_count_towards_balance() {
        let wallet = Wallet::new();
        let node = solo_node(wallet.blockchain_address());
        node.mine().await.unwrap();

        add_signed(&node, &signed(&wallet, "bob", 1.0)).await.unwrap();
        assert_eq!(node.calculate_total_amount("bob").await, 0.0);
        // the confirmed balance is still 1.0, so a second transfer is admitted too
        add_signed(&node, &signed(&wallet, "bob", 1.0)).await.unwrap();
        assert_eq!(node.transaction_pool().await.len(), 2);
    }

    #[tokio::test]
    async fn test_coinbase_bypasses_balance() {
        let node = solo_node("miner");
        node.add_transaction(COINBASE_SENDER, "x", 1.0, None, None)
            .await
            .unwrap();
        node.add_transaction(COINBASE_SENDER, "y", 1.0, None, None)
            .await
            .unwrap();
        let pool = node.transaction_pool().await;
        assert_eq!(pool[0].recipient, "y");
        assert_eq!(pool[1].recipient, "x");
    }

    #[tokio::test]
    async fn test_fork_choice_adopts_longest_valid_chain() {
        let short = chain_of_length(2, "a").await;
        let long = chain_of_length(5, "b").await;
        let sync = MockSync {
            peers: vec!["a".to_string(), "b".to_string(), "down".to_string()],
            chains: HashMap::from([("a".to_string(), short), ("b".to_string(), long.clone())]),
            ..MockSync::default()
        };
        let node = node_with(Arc::new(sync), "local");
        node.mine().await.unwrap();
        node.mine().await.unwrap();
        assert_eq!(node.chain_len().await, 3);

        assert!(node.sync_with_peers().await);
        assert_eq!(node.chain().await, long);
        assert!(!node.resolve_conflicts().await);
    }

    #[tokio::test]
    async fn test_fork_choice_rejects_invalid_chain() {
        let mut forged = chain_of_length(5, "b").await;
        forged[3].nonce += 1;
        let sync = MockSync {
            peers: vec!["b".to_string()],
            chains: HashMap::from([("b".to_string(), forged)]),
            ..MockSync::default()
        };
        let node = node_with(Arc::new(sync), "local");
        node.mine().await.unwrap();
        node.mine().await.unwrap();
        let before = node.chain().await;

        assert!(!node.sync_with_peers().await);
        assert_eq!(node.chain().await, before);
    }

    #[tokio::test]
    async fn test_fork_choice_tie_goes_to_first_peer() {
        let first = chain_of_length(4, "b").await;
        let second = chain_of_length(4, "c").await;
        assert_ne!(first, second);
        let sync = MockSync {
            peers: vec!["b".to_string(), "c".to_string()],
            chains: HashMap::from([("b".to_string(), first.clone()), ("c".to_string(), second)]),
            ..MockSync::default()
        };
        let node = node_with(Arc::new(sync), "local");

        assert!(node.sync_with_peers().await);
        assert_eq!(node.chain().await, first);
    }

    #[tokio::test]
    async fn test_equal_length_chain_does_not_replace() {
        let other = chain_of_length(2, "b").await;
        let sync = MockSync {
            peers: vec!["b".to_string()],
            chains: HashMap::from([("b".to_string(), other)]),
            ..MockSync::default()
        };
        let node = node_with(Arc::new(sync), "local");
        node.mine().await.unwrap();
        let before = node.chain().await;

        assert!(!node.sync_with_peers().await);
        assert_eq!(node.chain().await, before);
    }

    #[tokio::test]
    async fn test_mining_notifies_peers() {
        let sync = Arc::new(MockSync {
            peers: vec!["a".to_string(), "b".to_string()],
            ..MockSync::default()
        });
        let node = node_with(sync.clone(), "local");
        node.refresh_peers().await;

        node.mine().await.unwrap();
        assert_eq!(*sync.cleared.lock().unwrap(), vec!["a", "b"]);
        assert_eq!(*sync.consensus_requests.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_create_transaction_gossips_only_on_success() {
        let wallet = Wallet::new();
        let sync = Arc::new(MockSync {
            peers: vec!["a".to_string(), "b".to_string()],
            ..MockSync::default()
        });
        let node = node_with(sync.clone(), wallet.blockchain_address());
        node.refresh_peers().await;

        let request = wallet.transaction_request("bob", 1.0).unwrap();
        assert!(node.create_transaction(&request).await.is_err());
        assert!(sync.relayed.lock().unwrap().is_empty());

        node.mine().await.unwrap();
        node.create_transaction(&request).await.unwrap();
        assert_eq!(*sync.relayed.lock().unwrap(), vec!["a", "b"]);

        node.relay_transaction(&request).await.unwrap();
        assert_eq!(sync.relayed.lock().unwrap().len(), 2);
        assert_eq!(node.transaction_pool().await.len(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_nonce_space_leaves_state_untouched() {
        let node = Arc::new(
            Node::with_proof_of_work(
                NodeConfig {
                    difficulty: 64,
                    max_nonce: 5,
                    max_mining_attempts: 2,
                    ..NodeConfig::default()
                },
                "miner",
                Arc::new(NoopSync),
            )
            .unwrap(),
        );

        assert!(matches!(
            node.mine().await,
            Err(NodeError::ConsensusError(ConsensusError::NonceSpaceExhausted(5)))
        ));
        assert_eq!(node.chain_len().await, 1);
        assert!(node.transaction_pool().await.is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_attempt_retries_with_fresh_timestamp() {
        let engine = Arc::new(ScriptedEngine::failing_first(1));
        let node = scripted_node(Arc::clone(&engine));

        let block = node.mine().await.unwrap();
        let timestamps = engine.timestamps.lock().unwrap().clone();
        assert_eq!(timestamps.len(), 2);
        assert_eq!(block.timestamp, timestamps[1]);
        assert!(timestamps[1] >= timestamps[0]);
        assert_eq!(block.transactions.len(), 1);
        assert_eq!(node.chain_len().await, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropped_mine_call_pays_a_single_reward() {
        let engine = Arc::new(ScriptedEngine::gated());
        let node = scripted_node(Arc::clone(&engine));

        let caller = {
            let node = Arc::clone(&node);
            tokio::spawn(async move { node.mine().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());

        // the round itself carries on once the search completes
        engine.release();
        tokio::time::timeout(Duration::from_secs(5), async {
            while node.chain_len().await < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(node.transaction_pool().await.is_empty());

        node.mine().await.unwrap();
        let chain = node.chain().await;
        assert_eq!(chain.len(), 3);
        for block in &chain[1..] {
            assert_eq!(block.transactions.len(), 1);
            assert!(block.transactions[0].is_coinbase());
        }
        assert_eq!(node.calculate_total_amount("miner").await, 2.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_aborts_search_and_withdraws_reward() {
        let node = scripted_node(Arc::new(ScriptedEngine::gated()));

        let round = {
            let node = Arc::clone(&node);
            tokio::spawn(async move { node.mine().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        node.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(5), round)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            result,
            Err(NodeError::ConsensusError(ConsensusError::SealAborted))
        ));
        assert_eq!(node.chain_len().await, 1);
        assert!(node.transaction_pool().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_mining_is_serialized() {
        let node = solo_node("miner");
        let mut rounds = tokio::task::JoinSet::new();
        for _ in 0..4 {
            let node = Arc::clone(&node);
            rounds.spawn(async move { node.mine().await });
        }
        while let Some(result) = rounds.join_next().await {
            result.unwrap().unwrap();
        }

        let chain = node.chain().await;
        assert_eq!(chain.len(), 5);
        assert!(valid_chain(&chain, &ProofOfWork::new(2, u64::MAX)));
        for block in &chain[1..] {
            let rewards = block.transactions.iter().filter(|t| t.is_coinbase()).count();
            assert_eq!(rewards, 1);
        }
        assert_eq!(node.calculate_total_amount("miner").await, 4.0);
        assert!(node.transaction_pool().await.is_empty());
    }

    #[tokio::test]
    async fn test_clear_pool() {
        let node = solo_node("miner");
        node.add_transaction(COINBASE_SENDER, "x", 1.0, None, None)
            .await
            .unwrap();
        node.clear_pool().await;
        assert!(node.transaction_pool().await.is_empty());
    }

    #[tokio::test]
    async fn test_mining_loop_starts_once() {
        let node = node_with(Arc::new(NoopSync), "miner");
        assert!(!node.is_mining());
        assert!(node.start_mining());
        assert!(!node.start_mining());
        assert!(node.is_mining());
        node.shutdown();
    }
}
