use std::collections::VecDeque;

use crate::types::Transaction;

/// Pending transactions awaiting inclusion in the next block.
///
/// Order is significant: user transactions are appended in admission order,
/// while the miner's coinbase transaction always goes to the front.
#[derive(Debug, Default, Clone)]
pub struct Mempool {
    transactions: VecDeque<Transaction>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_front(&mut self, transaction: Transaction) {
        self.transactions.push_front(transaction);
    }

    pub fn push_back(&mut self, transaction: Transaction) {
        self.transactions.push_back(transaction);
    }

    pub fn pop_front(&mut self) -> Option<Transaction> {
        self.transactions.pop_front()
    }

    /// Deep copy of the pool in order; later pool mutations do not affect it.
    pub fn snapshot(&self) -> Vec<Transaction> {
        self.transactions.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.transactions.clear();
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions.iter()
    }
}
