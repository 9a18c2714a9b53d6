//! chainreport - blockchain reporting indexer
//!
//! Continuously ingests blocks from an upstream Ethereum-compatible node,
//! extracts the transactions, event logs, internal calls, and storage
//! relevant to a registered set of contract addresses, and materializes them
//! into a queryable, append-only index. Contract storage can be decoded back
//! into typed Solidity values from compiler storage layouts.

pub mod config;
pub mod database;
pub mod elasticsearch;
pub mod enricher;
pub mod error;
pub mod filter;
pub mod memorydb;
pub mod monitor;
pub mod parser;
pub mod rpc;
pub mod service;
pub mod storage;
pub mod types;

// Re-export the main entry points for convenience
pub use config::TuningConfig;
pub use database::Database;
pub use elasticsearch::ElasticsearchDatabase;
pub use error::{DatabaseError, ParseError};
pub use memorydb::MemoryDatabase;
pub use parser::{StorageDocument, StorageParser};
pub use rpc::{ChainClient, HttpChainClient};
pub use service::MonitorService;
