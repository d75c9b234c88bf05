use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

use crate::types::{format_hex, hash_block_parts, Block, CryptoError, Hash, Transaction};

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("Mismatched previous hash")]
    MismatchedPrevHash,
    #[error("Invalid nonce: block hash does not meet difficulty {0}")]
    InvalidNonce(usize),
    #[error("Nonce space exhausted: no valid nonce up to {0}")]
    NonceSpaceExhausted(u64),
    #[error("Nonce search aborted")]
    SealAborted,
    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
}

pub trait ConsensusEngine: Send + Sync {
    /// Check `block` against its immediate predecessor.
    fn validate_block(&self, block: &Block, prev_block: &Block) -> Result<(), ConsensusError>;

    /// Search for a nonce that makes the candidate block valid. Gives up
    /// with `SealAborted` once `abort` is set.
    fn seal(
        &self,
        timestamp: i64,
        previous_hash: &Hash,
        transactions: &[Transaction],
        abort: &AtomicBool,
    ) -> Result<u64, ConsensusError>;
}

/// Leading-zero proof-of-work over the hex block hash.
///
/// A block is valid when the first `difficulty` hex digits of its hash are
/// all `'0'`. The nonce search is linear from zero and stops at `max_nonce`.
#[derive(Debug, Clone)]
pub struct ProofOfWork {
    difficulty: usize,
    max_nonce: u64,
}

impl ProofOfWork {
    pub fn new(difficulty: usize, max_nonce: u64) -> Self {
        Self { difficulty, max_nonce }
    }

    /// True when the first `difficulty` hex digits of `hash` are zero.
    pub fn meets_target(&self, hash: &Hash) -> bool {
        if self.difficulty > 2 * hash.len() {
            return false;
        }
        (0..self.difficulty).all(|digit| {
            let byte = hash[digit / 2];
            let nibble = if digit % 2 == 0 { byte >> 4 } else { byte & 0x0f };
            nibble == 0
        })
    }

    pub fn valid_proof(
        &self,
        timestamp: i64,
        nonce: u64,
        previous_hash: &Hash,
        transactions: &[Transaction],
    ) -> Result<bool, ConsensusError> {
        let hash = hash_block_parts(timestamp, nonce, previous_hash, transactions)?;
        Ok(self.meets_target(&hash))
    }
}

impl ConsensusEngine for ProofOfWork {
    fn validate_block(&self, block: &Block, prev_block: &Block) -> Result<(), ConsensusError> {
        if block.previous_hash != prev_block.calculate_hash()? {
            return Err(ConsensusError::MismatchedPrevHash);
        }
        if !self.valid_proof(
            block.timestamp,
            block.nonce,
            &block.previous_hash,
            &block.transactions,
        )? {
            return Err(ConsensusError::InvalidNonce(self.difficulty));
        }
        Ok(())
    }

    fn seal(
        &self,
        timestamp: i64,
        previous_hash: &Hash,
        transactions: &[Transaction],
        abort: &AtomicBool,
    ) -> Result<u64, ConsensusError> {
        for nonce in 0..=self.max_nonce {
            if abort.load(Ordering::Relaxed) {
                return Err(ConsensusError::SealAborted);
            }
            let hash = hash_block_parts(timestamp, nonce, previous_hash, transactions)?;
            if self.meets_target(&hash) {
                log::debug!("Nonce {} found, block hash {}", nonce, format_hex(&hash));
                return Ok(nonce);
            }
        }
        Err(ConsensusError::NonceSpaceExhausted(self.max_nonce))
    }
}
