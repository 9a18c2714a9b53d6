//! Database contract consumed by the pipeline
//!
//! Two implementations exist: [`crate::memorydb::MemoryDatabase`] for tests
//! and embedded use, and [`crate::elasticsearch::ElasticsearchDatabase`]
//! against a document index. The core only ever talks to this trait.

use crate::error::DatabaseError;
use crate::types::{
    Block, Contract, Erc721Token, Event, QueryOptions, RawAccountState, Template,
    TokenQueryOptions, Transaction,
};
use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use std::collections::HashMap;

pub type Result<T> = std::result::Result<T, DatabaseError>;

/// Abstract store for blocks, transactions, events, contract registrations,
/// templates, storage snapshots, and token holdings.
///
/// Implementations must provide linearizable single-document updates; the
/// pipeline serializes block commits through a single writer but readers are
/// concurrent.
#[async_trait]
pub trait Database: Send + Sync {
    // ── Address registry ─────────────────────────────────────────────

    /// Register addresses for indexing. Idempotent per address; re-adding a
    /// deleted address restores its historical watermark where the backend
    /// retains history.
    async fn add_addresses(&self, addresses: Vec<Address>) -> Result<()>;

    /// Register a single address with indexing starting at `from` (its
    /// watermark starts at `from - 1`).
    async fn add_address_from(&self, address: Address, from: u64) -> Result<()>;

    async fn delete_address(&self, address: Address) -> Result<()>;

    async fn get_addresses(&self) -> Result<Vec<Address>>;

    async fn get_contract(&self, address: Address) -> Result<Contract>;

    // ── Templates ────────────────────────────────────────────────────

    async fn add_template(&self, name: &str, abi: &str, storage_layout: &str) -> Result<()>;

    async fn assign_template(&self, address: Address, name: &str) -> Result<()>;

    async fn get_contract_abi(&self, address: Address) -> Result<String>;

    async fn get_storage_layout(&self, address: Address) -> Result<String>;

    async fn get_templates(&self) -> Result<Vec<String>>;

    async fn get_template_details(&self, name: &str) -> Result<Template>;

    // ── Blocks ───────────────────────────────────────────────────────

    async fn write_block(&self, block: Block) -> Result<()>;

    async fn write_blocks(&self, blocks: Vec<Block>) -> Result<()>;

    async fn read_block(&self, number: u64) -> Result<Block>;

    /// Largest `N` such that blocks `0..=N` are all persisted with no gaps.
    async fn get_last_persisted_block_number(&self) -> Result<u64>;

    // ── Transactions ─────────────────────────────────────────────────

    async fn write_transaction(&self, transaction: Transaction) -> Result<()>;

    async fn write_transactions(&self, transactions: Vec<Transaction>) -> Result<()>;

    async fn read_transaction(&self, hash: B256) -> Result<Transaction>;

    // ── Indexing ─────────────────────────────────────────────────────

    /// Filter `blocks` for each address and persist the per-address indices,
    /// advancing each address's watermark to the highest block given.
    async fn index_blocks(&self, addresses: Vec<Address>, blocks: Vec<Block>) -> Result<()>;

    /// Persist raw storage snapshots for `block`.
    async fn index_storage(
        &self,
        snapshots: HashMap<Address, RawAccountState>,
        block: u64,
    ) -> Result<()>;

    async fn get_last_filtered(&self, address: Address) -> Result<u64>;

    /// The slot map captured for `address` at exactly `block`, if any.
    async fn get_storage(
        &self,
        address: Address,
        block: u64,
    ) -> Result<Option<HashMap<B256, String>>>;

    // ── Queries ──────────────────────────────────────────────────────

    async fn get_transactions_to_address(
        &self,
        address: Address,
        options: &QueryOptions,
    ) -> Result<Vec<B256>>;

    async fn get_transactions_internal_to_address(
        &self,
        address: Address,
        options: &QueryOptions,
    ) -> Result<Vec<B256>>;

    async fn get_events_from_address(
        &self,
        address: Address,
        options: &QueryOptions,
    ) -> Result<Vec<Event>>;

    async fn get_transactions_to_address_total(
        &self,
        address: Address,
        options: &QueryOptions,
    ) -> Result<u64>;

    async fn get_transactions_internal_to_address_total(
        &self,
        address: Address,
        options: &QueryOptions,
    ) -> Result<u64>;

    async fn get_events_from_address_total(
        &self,
        address: Address,
        options: &QueryOptions,
    ) -> Result<u64>;

    // ── Token holdings ───────────────────────────────────────────────

    /// Record that `holder`'s ERC-20 balance in `contract` became `amount`
    /// at `block`. Sparse: only called for blocks where the balance changed.
    async fn record_new_balance(
        &self,
        contract: Address,
        holder: Address,
        block: u64,
        amount: U256,
    ) -> Result<()>;

    /// Balance-change records inside the requested block range, newest first.
    async fn get_balance(
        &self,
        contract: Address,
        holder: Address,
        options: &QueryOptions,
    ) -> Result<Vec<(u64, U256)>>;

    /// Record an ERC-721 transfer: close the previous holding interval at
    /// `block - 1` and open a new one for `holder` at `block`.
    async fn record_erc721_token(
        &self,
        contract: Address,
        holder: Address,
        block: u64,
        token_id: U256,
    ) -> Result<()>;

    async fn erc721_token_by_token_id(
        &self,
        contract: Address,
        block: u64,
        token_id: U256,
    ) -> Result<Erc721Token>;

    async fn erc721_tokens_for_account_at_block(
        &self,
        contract: Address,
        holder: Address,
        block: u64,
        options: &TokenQueryOptions,
    ) -> Result<Vec<Erc721Token>>;

    async fn all_erc721_tokens_at_block(
        &self,
        contract: Address,
        block: u64,
        options: &TokenQueryOptions,
    ) -> Result<Vec<Erc721Token>>;

    async fn all_holders_at_block(
        &self,
        contract: Address,
        block: u64,
        options: &TokenQueryOptions,
    ) -> Result<Vec<Address>>;
}
