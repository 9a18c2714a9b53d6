//! In-memory database backend
//!
//! Guaranteed-fresh semantics, used by tests and embeddable deployments.
//! All state lives behind a single mutex; operations lock briefly and never
//! await while holding it.

use crate::database::{Database, Result};
use crate::error::DatabaseError;
use crate::filter::{self, TokenTransfer};
use crate::types::{
    Block, Contract, Erc721Token, Event, QueryOptions, RawAccountState, Template,
    TokenQueryOptions, Transaction,
};
use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// In-memory implementation of [`Database`].
#[derive(Default)]
pub struct MemoryDatabase {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    contracts: HashMap<Address, Contract>,
    /// Watermark history for deleted addresses, restored on re-add.
    index_history: HashMap<Address, Vec<u64>>,
    templates: HashMap<String, Template>,
    blocks: HashMap<u64, Block>,
    transactions: HashMap<B256, Transaction>,
    tx_to: HashMap<Address, Vec<B256>>,
    tx_internal: HashMap<Address, Vec<B256>>,
    events: HashMap<Address, Vec<Event>>,
    /// address -> block -> storage root
    states: HashMap<Address, BTreeMap<u64, B256>>,
    /// storage root -> slot map (content-addressed)
    dumps: HashMap<B256, HashMap<B256, String>>,
    /// (contract, holder) -> block -> balance, sparse
    balances: HashMap<(Address, Address), BTreeMap<u64, U256>>,
    /// contract -> token id -> holding intervals, oldest first
    tokens: HashMap<Address, BTreeMap<U256, Vec<Erc721Token>>>,
    last_persisted: u64,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Lock poisoning only happens if a writer panicked; state is
        // unrecoverable at that point anyway.
        self.inner.lock().expect("memory database lock poisoned")
    }
}

impl Inner {
    fn advance_last_persisted(&mut self) {
        while self.blocks.contains_key(&(self.last_persisted + 1)) {
            self.last_persisted += 1;
        }
    }

    fn index_block_for_address(&mut self, address: Address, block: &Block) -> Result<()> {
        let contract = match self.contracts.get(&address) {
            Some(c) => c.clone(),
            None => return Ok(()), // address deregistered since the batch was formed
        };
        if block.number <= contract.last_filtered {
            return Ok(()); // already indexed
        }

        let mut transactions = Vec::with_capacity(block.transactions.len());
        for hash in &block.transactions {
            let tx = self
                .transactions
                .get(hash)
                .ok_or(DatabaseError::NotFound)?;
            transactions.push(tx.clone());
        }

        let index = filter::filter_block_for_address(&transactions, address);
        self.tx_to
            .entry(address)
            .or_default()
            .extend(index.transactions);
        self.tx_internal
            .entry(address)
            .or_default()
            .extend(index.internal_transactions);
        self.events.entry(address).or_default().extend(index.events);

        for transfer in filter::token_transfers_for_contract(&transactions, address) {
            match transfer {
                TokenTransfer::Erc20 {
                    contract,
                    from,
                    to,
                    amount,
                } => {
                    if from != Address::ZERO {
                        self.apply_balance_change(contract, from, block.number, amount, false);
                    }
                    if to != Address::ZERO {
                        self.apply_balance_change(contract, to, block.number, amount, true);
                    }
                }
                TokenTransfer::Erc721 {
                    contract,
                    to,
                    token_id,
                    ..
                } => {
                    self.record_token_transfer(contract, to, block.number, token_id);
                }
            }
        }

        Ok(())
    }

    fn apply_balance_change(
        &mut self,
        contract: Address,
        holder: Address,
        block: u64,
        amount: U256,
        credit: bool,
    ) {
        let record = self.balances.entry((contract, holder)).or_default();
        let current = record
            .range(..=block)
            .next_back()
            .map(|(_, v)| *v)
            .unwrap_or(U256::ZERO);
        let updated = if credit {
            current.saturating_add(amount)
        } else {
            current.saturating_sub(amount)
        };
        record.insert(block, updated);
    }

    fn record_token_transfer(
        &mut self,
        contract: Address,
        holder: Address,
        block: u64,
        token_id: U256,
    ) {
        let intervals = self
            .tokens
            .entry(contract)
            .or_default()
            .entry(token_id)
            .or_default();
        if let Some(open) = intervals.iter_mut().find(|t| t.held_until.is_none()) {
            if open.held_from == block {
                // Re-transferred within the same block: last write wins
                open.holder = holder;
                return;
            }
            if open.held_from < block {
                open.held_until = Some(block - 1);
            }
        }
        intervals.push(Erc721Token {
            contract,
            holder,
            token: token_id.to_string(),
            held_from: block,
            held_until: None,
        });
    }

    fn template_for(&self, address: Address) -> Result<Option<&Template>> {
        let contract = self
            .contracts
            .get(&address)
            .ok_or(DatabaseError::NotFound)?;
        Ok(self.templates.get(&contract.template_name))
    }
}

/// Sort hashes the way listings are served: block descending, intra-block
/// index ascending.
fn sorted_hashes(
    inner: &Inner,
    hashes: &[B256],
    options: &QueryOptions,
) -> Vec<(u64, u64, B256)> {
    let mut rows: Vec<(u64, u64, B256)> = hashes
        .iter()
        .filter_map(|h| inner.transactions.get(h))
        .filter(|tx| options.contains(tx.block_number))
        .map(|tx| (tx.block_number, tx.index, tx.hash))
        .collect();
    rows.sort_by_key(|(block, index, _)| (Reverse(*block), *index));
    rows
}

fn paginate<T: Clone>(rows: &[T], offset: usize, page_size: usize) -> Vec<T> {
    rows.iter().skip(offset).take(page_size).cloned().collect()
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn add_addresses(&self, addresses: Vec<Address>) -> Result<()> {
        let mut inner = self.lock();
        for address in addresses {
            if inner.contracts.contains_key(&address) {
                continue;
            }
            let restored = inner
                .index_history
                .get(&address)
                .and_then(|h| h.last().copied())
                .unwrap_or(0);
            inner.contracts.insert(
                address,
                Contract {
                    address,
                    template_name: format!("0x{:x}", address),
                    creation_transaction: B256::ZERO,
                    last_filtered: restored,
                },
            );
        }
        Ok(())
    }

    async fn add_address_from(&self, address: Address, from: u64) -> Result<()> {
        let mut inner = self.lock();
        if inner.contracts.contains_key(&address) {
            return Ok(());
        }
        inner.contracts.insert(
            address,
            Contract {
                address,
                template_name: format!("0x{:x}", address),
                creation_transaction: B256::ZERO,
                last_filtered: from.saturating_sub(1),
            },
        );
        Ok(())
    }

    async fn delete_address(&self, address: Address) -> Result<()> {
        let mut inner = self.lock();
        if let Some(contract) = inner.contracts.remove(&address) {
            inner
                .index_history
                .entry(address)
                .or_default()
                .push(contract.last_filtered);
        }
        Ok(())
    }

    async fn get_addresses(&self) -> Result<Vec<Address>> {
        Ok(self.lock().contracts.keys().copied().collect())
    }

    async fn get_contract(&self, address: Address) -> Result<Contract> {
        self.lock()
            .contracts
            .get(&address)
            .cloned()
            .ok_or(DatabaseError::NotFound)
    }

    async fn add_template(&self, name: &str, abi: &str, storage_layout: &str) -> Result<()> {
        self.lock().templates.insert(
            name.to_string(),
            Template {
                template_name: name.to_string(),
                abi: abi.to_string(),
                storage_layout: storage_layout.to_string(),
            },
        );
        Ok(())
    }

    async fn assign_template(&self, address: Address, name: &str) -> Result<()> {
        let mut inner = self.lock();
        let contract = inner
            .contracts
            .get_mut(&address)
            .ok_or(DatabaseError::NotFound)?;
        contract.template_name = name.to_string();
        Ok(())
    }

    async fn get_contract_abi(&self, address: Address) -> Result<String> {
        let inner = self.lock();
        Ok(inner
            .template_for(address)?
            .map(|t| t.abi.clone())
            .unwrap_or_default())
    }

    async fn get_storage_layout(&self, address: Address) -> Result<String> {
        let inner = self.lock();
        Ok(inner
            .template_for(address)?
            .map(|t| t.storage_layout.clone())
            .unwrap_or_default())
    }

    async fn get_templates(&self) -> Result<Vec<String>> {
        Ok(self.lock().templates.keys().cloned().collect())
    }

    async fn get_template_details(&self, name: &str) -> Result<Template> {
        self.lock()
            .templates
            .get(name)
            .cloned()
            .ok_or(DatabaseError::NotFound)
    }

    async fn write_block(&self, block: Block) -> Result<()> {
        let mut inner = self.lock();
        inner.blocks.insert(block.number, block);
        inner.advance_last_persisted();
        Ok(())
    }

    async fn write_blocks(&self, blocks: Vec<Block>) -> Result<()> {
        let mut inner = self.lock();
        for block in blocks {
            inner.blocks.insert(block.number, block);
        }
        inner.advance_last_persisted();
        Ok(())
    }

    async fn read_block(&self, number: u64) -> Result<Block> {
        self.lock()
            .blocks
            .get(&number)
            .cloned()
            .ok_or(DatabaseError::NotFound)
    }

    async fn get_last_persisted_block_number(&self) -> Result<u64> {
        Ok(self.lock().last_persisted)
    }

    async fn write_transaction(&self, transaction: Transaction) -> Result<()> {
        self.lock()
            .transactions
            .insert(transaction.hash, transaction);
        Ok(())
    }

    async fn write_transactions(&self, transactions: Vec<Transaction>) -> Result<()> {
        let mut inner = self.lock();
        for tx in transactions {
            inner.transactions.insert(tx.hash, tx);
        }
        Ok(())
    }

    async fn read_transaction(&self, hash: B256) -> Result<Transaction> {
        self.lock()
            .transactions
            .get(&hash)
            .cloned()
            .ok_or(DatabaseError::NotFound)
    }

    async fn index_blocks(&self, addresses: Vec<Address>, blocks: Vec<Block>) -> Result<()> {
        let mut inner = self.lock();
        let mut blocks = blocks;
        blocks.sort_by_key(|b| b.number);
        let highest = blocks.last().map(|b| b.number).unwrap_or(0);

        for address in addresses {
            for block in &blocks {
                inner.index_block_for_address(address, block)?;
            }
            if let Some(contract) = inner.contracts.get_mut(&address) {
                contract.last_filtered = contract.last_filtered.max(highest);
            }
        }
        Ok(())
    }

    async fn index_storage(
        &self,
        snapshots: HashMap<Address, RawAccountState>,
        block: u64,
    ) -> Result<()> {
        let mut inner = self.lock();
        for (address, dump) in snapshots {
            inner
                .states
                .entry(address)
                .or_default()
                .insert(block, dump.root);
            inner.dumps.entry(dump.root).or_insert(dump.storage);
        }
        Ok(())
    }

    async fn get_last_filtered(&self, address: Address) -> Result<u64> {
        Ok(self
            .lock()
            .contracts
            .get(&address)
            .map(|c| c.last_filtered)
            .unwrap_or(0))
    }

    async fn get_storage(
        &self,
        address: Address,
        block: u64,
    ) -> Result<Option<HashMap<B256, String>>> {
        let inner = self.lock();
        let root = inner
            .states
            .get(&address)
            .and_then(|per_block| per_block.get(&block));
        Ok(root.and_then(|r| inner.dumps.get(r)).cloned())
    }

    async fn get_transactions_to_address(
        &self,
        address: Address,
        options: &QueryOptions,
    ) -> Result<Vec<B256>> {
        let inner = self.lock();
        let hashes = inner.tx_to.get(&address).cloned().unwrap_or_default();
        let rows = sorted_hashes(&inner, &hashes, options);
        Ok(paginate(&rows, options.offset(), options.page_size)
            .into_iter()
            .map(|(_, _, h)| h)
            .collect())
    }

    async fn get_transactions_internal_to_address(
        &self,
        address: Address,
        options: &QueryOptions,
    ) -> Result<Vec<B256>> {
        let inner = self.lock();
        let hashes = inner.tx_internal.get(&address).cloned().unwrap_or_default();
        let rows = sorted_hashes(&inner, &hashes, options);
        Ok(paginate(&rows, options.offset(), options.page_size)
            .into_iter()
            .map(|(_, _, h)| h)
            .collect())
    }

    async fn get_events_from_address(
        &self,
        address: Address,
        options: &QueryOptions,
    ) -> Result<Vec<Event>> {
        let inner = self.lock();
        let mut events: Vec<Event> = inner
            .events
            .get(&address)
            .map(|evs| {
                evs.iter()
                    .filter(|e| options.contains(e.block_number))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        events.sort_by_key(|e| (Reverse(e.block_number), e.index));
        Ok(paginate(&events, options.offset(), options.page_size))
    }

    async fn get_transactions_to_address_total(
        &self,
        address: Address,
        options: &QueryOptions,
    ) -> Result<u64> {
        let inner = self.lock();
        let hashes = inner.tx_to.get(&address).cloned().unwrap_or_default();
        Ok(sorted_hashes(&inner, &hashes, options).len() as u64)
    }

    async fn get_transactions_internal_to_address_total(
        &self,
        address: Address,
        options: &QueryOptions,
    ) -> Result<u64> {
        let inner = self.lock();
        let hashes = inner.tx_internal.get(&address).cloned().unwrap_or_default();
        Ok(sorted_hashes(&inner, &hashes, options).len() as u64)
    }

    async fn get_events_from_address_total(
        &self,
        address: Address,
        options: &QueryOptions,
    ) -> Result<u64> {
        let inner = self.lock();
        Ok(inner
            .events
            .get(&address)
            .map(|evs| {
                evs.iter()
                    .filter(|e| options.contains(e.block_number))
                    .count() as u64
            })
            .unwrap_or(0))
    }

    async fn record_new_balance(
        &self,
        contract: Address,
        holder: Address,
        block: u64,
        amount: U256,
    ) -> Result<()> {
        self.lock()
            .balances
            .entry((contract, holder))
            .or_default()
            .insert(block, amount);
        Ok(())
    }

    async fn get_balance(
        &self,
        contract: Address,
        holder: Address,
        options: &QueryOptions,
    ) -> Result<Vec<(u64, U256)>> {
        let inner = self.lock();
        let mut rows: Vec<(u64, U256)> = inner
            .balances
            .get(&(contract, holder))
            .map(|record| {
                record
                    .iter()
                    .filter(|(block, _)| options.contains(**block))
                    .map(|(block, amount)| (*block, *amount))
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by_key(|(block, _)| Reverse(*block));
        Ok(paginate(&rows, options.offset(), options.page_size))
    }

    async fn record_erc721_token(
        &self,
        contract: Address,
        holder: Address,
        block: u64,
        token_id: U256,
    ) -> Result<()> {
        self.lock()
            .record_token_transfer(contract, holder, block, token_id);
        Ok(())
    }

    async fn erc721_token_by_token_id(
        &self,
        contract: Address,
        block: u64,
        token_id: U256,
    ) -> Result<Erc721Token> {
        let inner = self.lock();
        inner
            .tokens
            .get(&contract)
            .and_then(|by_id| by_id.get(&token_id))
            .and_then(|intervals| intervals.iter().find(|t| t.held_at(block)))
            .cloned()
            .ok_or(DatabaseError::NotFound)
    }

    async fn erc721_tokens_for_account_at_block(
        &self,
        contract: Address,
        holder: Address,
        block: u64,
        options: &TokenQueryOptions,
    ) -> Result<Vec<Erc721Token>> {
        let all = self
            .all_erc721_tokens_at_block(contract, block, options)
            .await?;
        Ok(all.into_iter().filter(|t| t.holder == holder).collect())
    }

    async fn all_erc721_tokens_at_block(
        &self,
        contract: Address,
        block: u64,
        options: &TokenQueryOptions,
    ) -> Result<Vec<Erc721Token>> {
        let inner = self.lock();
        let mut rows: Vec<(U256, Erc721Token)> = inner
            .tokens
            .get(&contract)
            .map(|by_id| {
                by_id
                    .iter()
                    .filter(|(id, _)| options.contains_token(**id))
                    .filter_map(|(id, intervals)| {
                        intervals.iter().find(|t| t.held_at(block)).map(|t| (*id, t.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        // Listings are served in descending token id order
        rows.sort_by_key(|(id, _)| Reverse(*id));
        Ok(paginate(&rows, options.offset(), options.page_size)
            .into_iter()
            .map(|(_, t)| t)
            .collect())
    }

    async fn all_holders_at_block(
        &self,
        contract: Address,
        block: u64,
        options: &TokenQueryOptions,
    ) -> Result<Vec<Address>> {
        let inner = self.lock();
        let mut holders: Vec<Address> = inner
            .tokens
            .get(&contract)
            .map(|by_id| {
                by_id
                    .values()
                    .filter_map(|intervals| intervals.iter().find(|t| t.held_at(block)))
                    .map(|t| t.holder)
                    .collect()
            })
            .unwrap_or_default();
        holders.sort();
        holders.dedup();
        if let Some(after) = options.after {
            holders.retain(|h| *h > after);
        }
        holders.truncate(options.page_size);
        Ok(holders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InternalCall;
    use alloy_primitives::address;

    fn contract_addr() -> Address {
        address!("0000000000000000000000000000000000000001")
    }

    fn sender() -> Address {
        address!("0000000000000000000000000000000000000009")
    }

    fn topic_for(addr: Address) -> B256 {
        let mut t = [0u8; 32];
        t[12..].copy_from_slice(addr.as_slice());
        B256::from(t)
    }

    fn block(number: u64, tx_hashes: Vec<B256>) -> Block {
        Block {
            number,
            hash: B256::repeat_byte(number as u8),
            parent_hash: B256::repeat_byte(number.saturating_sub(1) as u8),
            timestamp: 1_600_000_000 + number,
            transactions: tx_hashes,
        }
    }

    fn tx(hash_byte: u8, block_number: u64, index: u64) -> Transaction {
        Transaction {
            hash: B256::repeat_byte(hash_byte),
            block_number,
            index,
            status: true,
            ..Default::default()
        }
    }

    async fn single_block_fixture(db: &MemoryDatabase) {
        db.add_addresses(vec![contract_addr()]).await.unwrap();

        // tx1: to the registered address
        let mut tx1 = tx(1, 1, 0);
        tx1.from = sender();
        tx1.to = contract_addr();
        // tx2: unrelated
        let mut tx2 = tx(2, 1, 1);
        tx2.from = sender();
        tx2.to = sender();
        // tx3: to the registered address, with one log from it and one not
        let mut tx3 = tx(3, 1, 2);
        tx3.to = contract_addr();
        tx3.events = vec![
            Event {
                block_number: 1,
                transaction_hash: tx3.hash,
                index: 0,
                address: sender(),
                ..Default::default()
            },
            Event {
                block_number: 1,
                transaction_hash: tx3.hash,
                index: 1,
                address: contract_addr(),
                ..Default::default()
            },
        ];

        let b = block(1, vec![tx1.hash, tx2.hash, tx3.hash]);
        db.write_transactions(vec![tx1, tx2, tx3]).await.unwrap();
        db.write_block(b.clone()).await.unwrap();
        db.index_blocks(vec![contract_addr()], vec![b]).await.unwrap();
    }

    #[tokio::test]
    async fn test_single_block_round_trip() {
        let db = MemoryDatabase::new();
        single_block_fixture(&db).await;

        let txs = db
            .get_transactions_to_address(contract_addr(), &QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(txs, vec![B256::repeat_byte(1), B256::repeat_byte(3)]);

        let events = db
            .get_events_from_address(contract_addr(), &QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].address, contract_addr());

        assert_eq!(db.get_last_filtered(contract_addr()).await.unwrap(), 1);
        assert_eq!(db.get_last_persisted_block_number().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_indexing_is_idempotent() {
        let db = MemoryDatabase::new();
        single_block_fixture(&db).await;

        // Re-index the same block; nothing must duplicate
        let b = db.read_block(1).await.unwrap();
        db.index_blocks(vec![contract_addr()], vec![b]).await.unwrap();

        let txs = db
            .get_transactions_to_address(contract_addr(), &QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(txs.len(), 2);
        let events = db
            .get_events_from_address(contract_addr(), &QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_and_readd_restores_watermark() {
        let db = MemoryDatabase::new();
        single_block_fixture(&db).await;
        assert_eq!(db.get_last_filtered(contract_addr()).await.unwrap(), 1);

        db.delete_address(contract_addr()).await.unwrap();
        assert_eq!(db.get_last_filtered(contract_addr()).await.unwrap(), 0);

        db.add_addresses(vec![contract_addr()]).await.unwrap();
        assert_eq!(db.get_last_filtered(contract_addr()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_add_addresses_is_idempotent() {
        let db = MemoryDatabase::new();
        db.add_addresses(vec![contract_addr()]).await.unwrap();
        db.add_addresses(vec![contract_addr()]).await.unwrap();
        assert_eq!(db.get_addresses().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_add_address_from_sets_watermark() {
        let db = MemoryDatabase::new();
        db.add_address_from(contract_addr(), 100).await.unwrap();
        assert_eq!(db.get_last_filtered(contract_addr()).await.unwrap(), 99);
    }

    #[tokio::test]
    async fn test_watermark_never_crosses_gaps() {
        let db = MemoryDatabase::new();
        let mut observed = Vec::new();
        for number in [3u64, 1, 2, 5, 4] {
            db.write_block(block(number, vec![])).await.unwrap();
            observed.push(db.get_last_persisted_block_number().await.unwrap());
        }
        // Writing 3 leaves a gap at 1; 1 closes nothing beyond itself; 2
        // closes the 1..=3 prefix; 5 waits for 4.
        assert_eq!(observed, vec![0, 1, 3, 3, 5]);
    }

    #[tokio::test]
    async fn test_internal_call_indexing() {
        let db = MemoryDatabase::new();
        db.add_addresses(vec![contract_addr()]).await.unwrap();

        let mut tx1 = tx(7, 1, 0);
        tx1.from = sender();
        tx1.to = sender();
        tx1.internal_calls = vec![InternalCall {
            from: sender(),
            to: contract_addr(),
            call_type: "CALL".into(),
            ..Default::default()
        }];
        let b = block(1, vec![tx1.hash]);
        db.write_transactions(vec![tx1]).await.unwrap();
        db.write_block(b.clone()).await.unwrap();
        db.index_blocks(vec![contract_addr()], vec![b]).await.unwrap();

        let internal = db
            .get_transactions_internal_to_address(contract_addr(), &QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(internal, vec![B256::repeat_byte(7)]);
        let direct = db
            .get_transactions_to_address(contract_addr(), &QueryOptions::default())
            .await
            .unwrap();
        assert!(direct.is_empty());
    }

    #[tokio::test]
    async fn test_listing_order_and_pagination() {
        let db = MemoryDatabase::new();
        db.add_addresses(vec![contract_addr()]).await.unwrap();

        let mut hashes = Vec::new();
        let mut blocks = Vec::new();
        let mut all_txs = Vec::new();
        let mut byte = 10u8;
        for number in 1..=3u64 {
            let mut block_hashes = Vec::new();
            for index in 0..2u64 {
                let mut t = tx(byte, number, index);
                t.to = contract_addr();
                block_hashes.push(t.hash);
                hashes.push(t.hash);
                all_txs.push(t);
                byte += 1;
            }
            blocks.push(block(number, block_hashes));
        }
        db.write_transactions(all_txs).await.unwrap();
        db.write_blocks(blocks.clone()).await.unwrap();
        db.index_blocks(vec![contract_addr()], blocks).await.unwrap();

        let opts = QueryOptions {
            page_size: 4,
            ..QueryOptions::default()
        };
        let page0 = db
            .get_transactions_to_address(contract_addr(), &opts)
            .await
            .unwrap();
        // Block 3 first, index ascending within the block
        assert_eq!(
            page0,
            vec![
                B256::repeat_byte(14),
                B256::repeat_byte(15),
                B256::repeat_byte(12),
                B256::repeat_byte(13),
            ]
        );

        let opts1 = QueryOptions {
            page_size: 4,
            page_number: 1,
            ..QueryOptions::default()
        };
        let page1 = db
            .get_transactions_to_address(contract_addr(), &opts1)
            .await
            .unwrap();
        assert_eq!(page1, vec![B256::repeat_byte(10), B256::repeat_byte(11)]);

        let total = db
            .get_transactions_to_address_total(contract_addr(), &QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(total, 6);

        // Block-range restriction
        let ranged = QueryOptions {
            begin_block_number: 2,
            end_block_number: 2,
            ..QueryOptions::default()
        };
        let in_range = db
            .get_transactions_to_address(contract_addr(), &ranged)
            .await
            .unwrap();
        assert_eq!(in_range, vec![B256::repeat_byte(12), B256::repeat_byte(13)]);
    }

    #[tokio::test]
    async fn test_erc20_balance_tracking_is_sparse() {
        let db = MemoryDatabase::new();
        let token = contract_addr();
        let holder = sender();
        db.add_addresses(vec![token]).await.unwrap();

        // Mint 100 to holder at block 1, transfer 30 away at block 3
        let mut mint = tx(1, 1, 0);
        mint.events = vec![Event {
            block_number: 1,
            transaction_hash: mint.hash,
            index: 0,
            address: token,
            topics: vec![
                crate::filter::TRANSFER_TOPIC,
                topic_for(Address::ZERO),
                topic_for(holder),
            ],
            data: U256::from(100).to_be_bytes::<32>().to_vec(),
        }];
        let b1 = block(1, vec![mint.hash]);

        let mut spend = tx(2, 3, 0);
        spend.events = vec![Event {
            block_number: 3,
            transaction_hash: spend.hash,
            index: 0,
            address: token,
            topics: vec![
                crate::filter::TRANSFER_TOPIC,
                topic_for(holder),
                topic_for(contract_addr()),
            ],
            data: U256::from(30).to_be_bytes::<32>().to_vec(),
        }];
        let b2 = block(2, vec![]);
        let b3 = block(3, vec![spend.hash]);

        db.write_transactions(vec![mint, spend]).await.unwrap();
        db.write_blocks(vec![b1.clone(), b2.clone(), b3.clone()])
            .await
            .unwrap();
        db.index_blocks(vec![token], vec![b1, b2, b3]).await.unwrap();

        let history = db
            .get_balance(token, holder, &QueryOptions::default())
            .await
            .unwrap();
        // Newest first; only blocks where the balance changed
        assert_eq!(
            history,
            vec![(3, U256::from(70)), (1, U256::from(100))]
        );
    }

    #[tokio::test]
    async fn test_erc721_transfer_sequence() {
        let db = MemoryDatabase::new();
        let contract = contract_addr();
        let token_id = U256::from(42);
        let h1 = address!("0000000000000000000000000000000000000011");
        let h2 = address!("0000000000000000000000000000000000000012");
        let h3 = address!("0000000000000000000000000000000000000013");

        db.record_erc721_token(contract, h1, 10, token_id).await.unwrap();
        db.record_erc721_token(contract, h2, 20, token_id).await.unwrap();
        db.record_erc721_token(contract, h3, 30, token_id).await.unwrap();

        let at_25 = db
            .erc721_token_by_token_id(contract, 25, token_id)
            .await
            .unwrap();
        assert_eq!(at_25.holder, h2);
        assert_eq!(at_25.held_from, 20);
        assert_eq!(at_25.held_until, Some(29));

        let at_35 = db
            .erc721_token_by_token_id(contract, 35, token_id)
            .await
            .unwrap();
        assert_eq!(at_35.holder, h3);
        assert_eq!(at_35.held_until, None);

        // Intervals form a disjoint cover from the mint onward
        let at_10 = db
            .erc721_token_by_token_id(contract, 10, token_id)
            .await
            .unwrap();
        assert_eq!(at_10.holder, h1);
        assert_eq!(at_10.held_until, Some(19));
        assert!(matches!(
            db.erc721_token_by_token_id(contract, 9, token_id).await,
            Err(DatabaseError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_erc721_listings() {
        let db = MemoryDatabase::new();
        let contract = contract_addr();
        let h1 = address!("0000000000000000000000000000000000000011");
        let h2 = address!("0000000000000000000000000000000000000012");

        db.record_erc721_token(contract, h1, 5, U256::from(1)).await.unwrap();
        db.record_erc721_token(contract, h1, 5, U256::from(2)).await.unwrap();
        db.record_erc721_token(contract, h2, 5, U256::from(3)).await.unwrap();
        // Token 2 moves to h2 later
        db.record_erc721_token(contract, h2, 8, U256::from(2)).await.unwrap();

        let all = db
            .all_erc721_tokens_at_block(contract, 6, &TokenQueryOptions::paged())
            .await
            .unwrap();
        // Descending token id
        let ids: Vec<String> = all.iter().map(|t| t.token.clone()).collect();
        assert_eq!(ids, vec!["3", "2", "1"]);

        let h1_tokens = db
            .erc721_tokens_for_account_at_block(contract, h1, 6, &TokenQueryOptions::paged())
            .await
            .unwrap();
        assert_eq!(h1_tokens.len(), 2);

        let h1_later = db
            .erc721_tokens_for_account_at_block(contract, h1, 9, &TokenQueryOptions::paged())
            .await
            .unwrap();
        assert_eq!(h1_later.len(), 1);

        let holders = db
            .all_holders_at_block(contract, 9, &TokenQueryOptions::paged())
            .await
            .unwrap();
        assert_eq!(holders, vec![h1, h2]);

        let after = TokenQueryOptions {
            after: Some(h1),
            ..TokenQueryOptions::paged()
        };
        let holders_after = db.all_holders_at_block(contract, 9, &after).await.unwrap();
        assert_eq!(holders_after, vec![h2]);

        // Token id range filter
        let ranged = TokenQueryOptions {
            begin_token_id: Some(U256::from(2)),
            end_token_id: Some(U256::from(3)),
            ..TokenQueryOptions::paged()
        };
        let in_range = db
            .all_erc721_tokens_at_block(contract, 6, &ranged)
            .await
            .unwrap();
        assert_eq!(in_range.len(), 2);
    }

    #[tokio::test]
    async fn test_templates() {
        let db = MemoryDatabase::new();
        db.add_addresses(vec![contract_addr()]).await.unwrap();

        // Template name defaults to the address string
        let contract = db.get_contract(contract_addr()).await.unwrap();
        assert_eq!(contract.template_name, format!("0x{:x}", contract_addr()));
        assert_eq!(db.get_contract_abi(contract_addr()).await.unwrap(), "");

        db.add_template("erc20", "[abi]", "{layout}").await.unwrap();
        db.assign_template(contract_addr(), "erc20").await.unwrap();
        assert_eq!(db.get_contract_abi(contract_addr()).await.unwrap(), "[abi]");
        assert_eq!(
            db.get_storage_layout(contract_addr()).await.unwrap(),
            "{layout}"
        );

        let details = db.get_template_details("erc20").await.unwrap();
        assert_eq!(details.abi, "[abi]");
        assert_eq!(db.get_templates().await.unwrap(), vec!["erc20".to_string()]);

        assert!(matches!(
            db.assign_template(sender(), "erc20").await,
            Err(DatabaseError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_storage_snapshots_content_addressed() {
        let db = MemoryDatabase::new();
        let root = B256::repeat_byte(0xaa);
        let mut slots = HashMap::new();
        slots.insert(B256::ZERO, "2a".to_string());

        let mut snapshots = HashMap::new();
        snapshots.insert(
            contract_addr(),
            RawAccountState {
                root,
                storage: slots.clone(),
            },
        );
        db.index_storage(snapshots.clone(), 5).await.unwrap();
        // Same root at a later block reuses the dump
        db.index_storage(snapshots, 6).await.unwrap();

        assert_eq!(
            db.get_storage(contract_addr(), 5).await.unwrap(),
            Some(slots.clone())
        );
        assert_eq!(
            db.get_storage(contract_addr(), 6).await.unwrap(),
            Some(slots)
        );
        assert_eq!(db.get_storage(contract_addr(), 7).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_missing_is_not_found() {
        let db = MemoryDatabase::new();
        assert!(matches!(
            db.read_block(1).await,
            Err(DatabaseError::NotFound)
        ));
        assert!(matches!(
            db.read_transaction(B256::ZERO).await,
            Err(DatabaseError::NotFound)
        ));
    }
}
