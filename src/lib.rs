// src/lib.rs

pub mod types;
pub mod wallet;
pub mod mempool;
pub mod consensus;
pub mod ledger;
pub mod config;
pub mod sync;
pub mod schedule;
pub mod node;
pub mod api;
