use thiserror::Error;

use crate::consensus::{ConsensusEngine, ConsensusError};
use crate::types::{format_hex, Block, CryptoError};

/// Fixed timestamp of the genesis block, shared by every node.
pub const GENESIS_TIMESTAMP: i64 = 1_645_635_740_778_068_200;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
    #[error("Block validation failed: {0}")]
    BlockValidation(#[from] ConsensusError),
    #[error("Invalid chain at block {index}: {reason}")]
    InvalidChain { index: usize, reason: ConsensusError },
    #[error("Chain has no genesis block")]
    EmptyChain,
}

/// Build the genesis block.
///
/// It has nonce 0, no transactions, and links to the hash of an all-zero
/// block literal. Its own proof of work is never checked.
pub fn genesis_block() -> Result<Block, LedgerError> {
    let empty = Block::new(0, 0, [0; 32], Vec::new());
    Ok(Block::new(GENESIS_TIMESTAMP, 0, empty.calculate_hash()?, Vec::new()))
}

/// Verify every link and every proof of work of a candidate chain, starting
/// at index 1. Stops at the first failure.
pub fn validate_chain(blocks: &[Block], consensus: &dyn ConsensusEngine) -> Result<(), LedgerError> {
    if blocks.is_empty() {
        return Err(LedgerError::EmptyChain);
    }
    for (offset, pair) in blocks.windows(2).enumerate() {
        consensus
            .validate_block(&pair[1], &pair[0])
            .map_err(|reason| LedgerError::InvalidChain {
                index: offset + 1,
                reason,
            })?;
    }
    Ok(())
}

pub fn valid_chain(blocks: &[Block], consensus: &dyn ConsensusEngine) -> bool {
    match validate_chain(blocks, consensus) {
        Ok(()) => true,
        Err(e) => {
            log::debug!("Rejected candidate chain of length {}: {}", blocks.len(), e);
            false
        }
    }
}

/// The node's single canonical chain. Never empty: the first block is
/// always genesis.
#[derive(Debug, Clone, PartialEq)]
pub struct Chain {
    blocks: Vec<Block>,
}

impl Chain {
    pub fn new() -> Result<Self, LedgerError> {
        let genesis = genesis_block()?;
        log::info!(
            "Chain initialized with genesis block: {}",
            format_hex(&genesis.calculate_hash()?)
        );
        Ok(Chain { blocks: vec![genesis] })
    }

    pub fn from_blocks(blocks: Vec<Block>) -> Result<Self, LedgerError> {
        if blocks.is_empty() {
            return Err(LedgerError::EmptyChain);
        }
        Ok(Chain { blocks })
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn last_block(&self) -> &Block {
        &self.blocks[self.blocks.len() - 1]
    }

    /// Append one block that links to the current tip.
    pub fn append(&mut self, block: Block) -> Result<(), LedgerError> {
        if block.previous_hash != self.last_block().calculate_hash()? {
            return Err(ConsensusError::MismatchedPrevHash.into());
        }
        self.blocks.push(block);
        Ok(())
    }

    /// Swap the whole history for another chain.
    pub fn replace(&mut self, other: Chain) {
        self.blocks = other.blocks;
    }

    /// Confirmed balance of `address`: received minus sent over every
    /// committed transaction. Pending transactions are not counted.
    pub fn calculate_total_amount(&self, address: &str) -> f64 {
        let mut total = 0.0;
        for transaction in self.blocks.iter().flat_map(|block| block.transactions.iter()) {
            if transaction.recipient == address {
                total += transaction.value;
            }
            if transaction.sender == address {
                total -= transaction.value;
            }
        }
        total
    }
}
