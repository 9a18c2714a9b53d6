//! Document-index database backend
//!
//! Talks to an Elasticsearch-compatible store over its REST API. Each record
//! kind lives in its own index; a single `meta/lastPersisted` document tracks
//! the gap-free watermark. Search pagination is bounded by the backend's
//! `from + size <= 1000` window.

use crate::database::{Database, Result};
use crate::error::DatabaseError;
use crate::filter::{self, TokenTransfer};
use crate::types::{
    Block, Contract, Erc721Token, Event, QueryOptions, RawAccountState, Template,
    TokenQueryOptions, Transaction,
};
use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;

pub const CONTRACT_INDEX: &str = "contract";
pub const TEMPLATE_INDEX: &str = "template";
pub const BLOCK_INDEX: &str = "block";
pub const TRANSACTION_INDEX: &str = "transaction";
pub const EVENT_INDEX: &str = "event";
pub const STATE_INDEX: &str = "state";
pub const STORAGE_INDEX: &str = "storage";
pub const TOKEN_INDEX: &str = "token";
pub const META_INDEX: &str = "meta";

const ALL_INDICES: [&str; 9] = [
    CONTRACT_INDEX,
    TEMPLATE_INDEX,
    BLOCK_INDEX,
    TRANSACTION_INDEX,
    EVENT_INDEX,
    STATE_INDEX,
    STORAGE_INDEX,
    TOKEN_INDEX,
    META_INDEX,
];

/// Search window shared by all paginated queries.
const PAGINATION_WINDOW: usize = 1000;

/// Elasticsearch-compatible implementation of [`Database`].
pub struct ElasticsearchDatabase {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct StorageEntryDoc {
    key: B256,
    value: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StorageDoc {
    storage_root: B256,
    storage_map: Vec<StorageEntryDoc>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenBalanceDoc {
    contract: Address,
    holder: Address,
    block_number: u64,
    /// Decimal string: token amounts are unbounded uint256.
    amount: String,
}

/// ERC-721 holding doc. The token id is additionally stored zero-padded to 85
/// decimal digits and split into five numeric chunks so that descending
/// string/number sorts preserve numeric order.
#[derive(Debug, Serialize, Deserialize)]
struct SortableErc721Doc {
    #[serde(flatten)]
    token: Erc721Token,
    #[serde(rename = "tokenPadded")]
    token_padded: String,
    first: u64,
    second: u64,
    third: u64,
    fourth: u64,
    fifth: u64,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    hits: SearchHits,
    #[serde(default)]
    aggregations: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct SearchHits {
    hits: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(rename = "_source")]
    source: Value,
}

fn addr_id(address: Address) -> String {
    format!("0x{:x}", address)
}

fn hash_id(hash: B256) -> String {
    format!("0x{:x}", hash)
}

/// Zero-pad a token id to 85 decimal digits (2^256 has 78) and split it into
/// five 17-digit chunks.
fn token_sort_key(token_id: U256) -> (String, [u64; 5]) {
    let padded = format!("{:0>85}", token_id.to_string());
    let mut chunks = [0u64; 5];
    for (i, chunk) in chunks.iter_mut().enumerate() {
        // 17 decimal digits always fit in a u64
        *chunk = padded[i * 17..(i + 1) * 17].parse().unwrap_or(0);
    }
    (padded, chunks)
}

/// Bool filter matching holdings that cover `block`:
/// `heldFrom <= block` and (`heldUntil >= block` or still open).
fn held_at_block_query(block: u64) -> Value {
    json!({
        "bool": {
            "must": [
                { "range": { "heldFrom": { "lte": block } } }
            ],
            "should": [
                { "range": { "heldUntil": { "gte": block } } },
                { "bool": { "must_not": { "exists": { "field": "heldUntil" } } } }
            ],
            "minimum_should_match": 1
        }
    })
}

fn block_range_query(options: &QueryOptions) -> Value {
    let mut range = json!({ "gte": options.begin_block_number });
    if options.end_block_number >= 0 {
        range["lte"] = json!(options.end_block_number);
    }
    json!({ "range": { "blockNumber": range } })
}

fn token_id_range_query(options: &TokenQueryOptions) -> Option<Value> {
    if options.begin_token_id.is_none() && options.end_token_id.is_none() {
        return None;
    }
    let mut range = json!({});
    if let Some(begin) = options.begin_token_id {
        range["gte"] = json!(token_sort_key(begin).0);
    }
    if let Some(end) = options.end_token_id {
        range["lte"] = json!(token_sort_key(end).0);
    }
    Some(json!({ "range": { "tokenPadded": range } }))
}

fn check_window(offset: usize, size: usize) -> Result<()> {
    if offset + size > PAGINATION_WINDOW {
        return Err(DatabaseError::PaginationLimitExceeded);
    }
    Ok(())
}

impl ElasticsearchDatabase {
    /// Connect to the store, creating the indices and the watermark document
    /// on first use.
    pub async fn connect(base_url: impl Into<String>) -> Result<Self> {
        let db = Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        };
        if !db.is_initialized().await? {
            db.init().await?;
        }
        Ok(db)
    }

    async fn is_initialized(&self) -> Result<bool> {
        let url = format!("{}/{}", self.base_url, META_INDEX);
        let response = self
            .client
            .head(&url)
            .send()
            .await
            .map_err(|e| DatabaseError::Fatal(format!("cannot reach document store: {}", e)))?;
        Ok(response.status().is_success())
    }

    async fn init(&self) -> Result<()> {
        tracing::info!("initialising document store indices");
        for index in ALL_INDICES {
            let url = format!("{}/{}", self.base_url, index);
            let body = if index == TRANSACTION_INDEX {
                // Internal calls must be queryable per element
                json!({ "mappings": { "properties": { "internalCalls": { "type": "nested" } } } })
            } else {
                json!({})
            };
            let response = self
                .client
                .put(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| DatabaseError::Fatal(format!("cannot create index {}: {}", index, e)))?;
            // 400 here means the index already exists
            if !response.status().is_success() && response.status().as_u16() != 400 {
                return Err(DatabaseError::Fatal(format!(
                    "index {} creation failed with {}",
                    index,
                    response.status()
                )));
            }
        }
        // Sentinel watermark document; create-only so restarts keep progress
        let _ = self
            .put_doc(META_INDEX, "lastPersisted", &json!({ "lastPersisted": 0 }), true)
            .await;
        Ok(())
    }

    async fn get_doc(&self, index: &str, id: &str) -> Result<Value> {
        let url = format!("{}/{}/_doc/{}", self.base_url, index, id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| DatabaseError::Transient(e.to_string()))?;
        if response.status().as_u16() == 404 {
            return Err(DatabaseError::NotFound);
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| DatabaseError::Transient(e.to_string()))?;
        if body.get("found").and_then(Value::as_bool) != Some(true) {
            return Err(DatabaseError::NotFound);
        }
        body.get("_source")
            .cloned()
            .ok_or_else(|| DatabaseError::Transient("document has no _source".into()))
    }

    async fn get_typed<T: serde::de::DeserializeOwned>(&self, index: &str, id: &str) -> Result<T> {
        let source = self.get_doc(index, id).await?;
        serde_json::from_value(source).map_err(|e| DatabaseError::Transient(e.to_string()))
    }

    /// Index a document. With `create_only`, an existing document is left
    /// untouched and `Validation` is returned.
    async fn put_doc(&self, index: &str, id: &str, body: &impl Serialize, create_only: bool) -> Result<()> {
        let url = if create_only {
            format!("{}/{}/_create/{}?refresh=true", self.base_url, index, id)
        } else {
            format!("{}/{}/_doc/{}?refresh=true", self.base_url, index, id)
        };
        let response = self
            .client
            .put(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| DatabaseError::Transient(e.to_string()))?;
        match response.status().as_u16() {
            409 => Err(DatabaseError::Validation("document already exists".into())),
            status if status >= 400 => Err(DatabaseError::Transient(format!(
                "indexing into {} failed with {}",
                index, status
            ))),
            _ => Ok(()),
        }
    }

    async fn update_doc(&self, index: &str, id: &str, doc: Value) -> Result<()> {
        let url = format!("{}/{}/_update/{}?refresh=true", self.base_url, index, id);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "doc": doc }))
            .send()
            .await
            .map_err(|e| DatabaseError::Transient(e.to_string()))?;
        match response.status().as_u16() {
            404 => Err(DatabaseError::NotFound),
            status if status >= 400 => Err(DatabaseError::Transient(format!(
                "update in {} failed with {}",
                index, status
            ))),
            _ => Ok(()),
        }
    }

    async fn delete_doc(&self, index: &str, id: &str) -> Result<()> {
        let url = format!("{}/{}/_doc/{}?refresh=true", self.base_url, index, id);
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| DatabaseError::Transient(e.to_string()))?;
        if response.status().is_success() || response.status().as_u16() == 404 {
            Ok(())
        } else {
            Err(DatabaseError::Transient(format!(
                "delete from {} failed with {}",
                index,
                response.status()
            )))
        }
    }

    /// Bulk-index documents and surface the first item-level failure, so a
    /// batch is only considered durable once every item is acknowledged.
    async fn bulk_create(&self, index: &str, docs: Vec<(String, Value)>) -> Result<()> {
        if docs.is_empty() {
            return Ok(());
        }
        let mut body = String::new();
        for (id, doc) in &docs {
            body.push_str(&json!({ "create": { "_id": id } }).to_string());
            body.push('\n');
            body.push_str(&doc.to_string());
            body.push('\n');
        }
        let url = format!("{}/{}/_bulk?refresh=true", self.base_url, index);
        let response = self
            .client
            .post(&url)
            .header("content-type", "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(|e| DatabaseError::Transient(e.to_string()))?;
        let result: Value = response
            .json()
            .await
            .map_err(|e| DatabaseError::Transient(e.to_string()))?;
        if result.get("errors").and_then(Value::as_bool) == Some(true) {
            for item in result
                .get("items")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                let status = item
                    .pointer("/create/status")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                // 409: the document was created by an earlier run; replays are fine
                if status >= 400 && status != 409 {
                    return Err(DatabaseError::Transient(format!(
                        "bulk item failed in {}: {}",
                        index, item
                    )));
                }
            }
        }
        Ok(())
    }

    async fn search(
        &self,
        index: &str,
        query: Value,
        from: usize,
        size: usize,
        sort: &[&str],
    ) -> Result<SearchResult> {
        let url = format!("{}/{}/_search", self.base_url, index);
        let mut body = json!({ "query": query, "from": from, "size": size });
        if !sort.is_empty() {
            body["sort"] = json!(sort);
        }
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| DatabaseError::Transient(e.to_string()))?;
        if response.status().as_u16() == 404 {
            // Searching an index that does not exist: the backend was never
            // initialised
            return Err(DatabaseError::IndexNotFound);
        }
        if !response.status().is_success() {
            return Err(DatabaseError::Transient(format!(
                "search in {} failed with {}",
                index,
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| DatabaseError::Transient(e.to_string()))
    }

    async fn count(&self, index: &str, query: Value) -> Result<u64> {
        let url = format!("{}/{}/_count", self.base_url, index);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "query": query }))
            .send()
            .await
            .map_err(|e| DatabaseError::Transient(e.to_string()))?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| DatabaseError::Transient(e.to_string()))?;
        Ok(body.get("count").and_then(Value::as_u64).unwrap_or(0))
    }

    async fn get_contract_doc(&self, address: Address) -> Result<Contract> {
        self.get_typed(CONTRACT_INDEX, &addr_id(address)).await
    }

    async fn get_template_doc(&self, name: &str) -> Result<Template> {
        self.get_typed(TEMPLATE_INDEX, name).await
    }

    /// Move the watermark forward across the now gap-free prefix.
    async fn update_last_persisted(&self) -> Result<()> {
        let mut last = self.get_last_persisted_block_number().await?;
        let before = last;
        loop {
            match self.read_block(last + 1).await {
                Ok(_) => last += 1,
                Err(DatabaseError::NotFound) => break,
                Err(e) => return Err(e),
            }
        }
        if last != before {
            self.put_doc(
                META_INDEX,
                "lastPersisted",
                &json!({ "lastPersisted": last }),
                false,
            )
            .await?;
        }
        Ok(())
    }

    async fn index_events(&self, events: &[Event]) -> Result<()> {
        let docs = events
            .iter()
            .map(|event| {
                (
                    format!("{}-{}", event.block_number, event.index),
                    serde_json::to_value(event).expect("event serializes"),
                )
            })
            .collect();
        self.bulk_create(EVENT_INDEX, docs).await
    }

    async fn apply_token_transfers(&self, transfers: Vec<TokenTransfer>, block: u64) -> Result<()> {
        // Net the fungible movements per (contract, holder) first, so each
        // holder gets exactly one balance record per block
        let mut credits: HashMap<(Address, Address), U256> = HashMap::new();
        let mut debits: HashMap<(Address, Address), U256> = HashMap::new();
        for transfer in transfers {
            match transfer {
                TokenTransfer::Erc20 {
                    contract,
                    from,
                    to,
                    amount,
                } => {
                    if from != Address::ZERO {
                        let entry = debits.entry((contract, from)).or_default();
                        *entry = entry.saturating_add(amount);
                    }
                    if to != Address::ZERO {
                        let entry = credits.entry((contract, to)).or_default();
                        *entry = entry.saturating_add(amount);
                    }
                }
                TokenTransfer::Erc721 {
                    contract,
                    to,
                    token_id,
                    ..
                } => {
                    self.record_erc721_token(contract, to, block, token_id)
                        .await?;
                }
            }
        }

        let mut touched: Vec<(Address, Address)> = credits.keys().chain(debits.keys()).copied().collect();
        touched.sort();
        touched.dedup();
        for (contract, holder) in touched {
            let options = QueryOptions {
                end_block_number: block as i64,
                page_size: 1,
                ..QueryOptions::default()
            };
            let current = self
                .get_balance(contract, holder, &options)
                .await?
                .first()
                .map(|(_, amount)| *amount)
                .unwrap_or(U256::ZERO);
            let updated = current
                .saturating_add(credits.get(&(contract, holder)).copied().unwrap_or_default())
                .saturating_sub(debits.get(&(contract, holder)).copied().unwrap_or_default());
            self.record_new_balance(contract, holder, block, updated)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Database for ElasticsearchDatabase {
    async fn add_addresses(&self, addresses: Vec<Address>) -> Result<()> {
        for address in addresses {
            let contract = Contract {
                address,
                template_name: addr_id(address),
                creation_transaction: B256::ZERO,
                last_filtered: 0,
            };
            match self
                .put_doc(CONTRACT_INDEX, &addr_id(address), &contract, true)
                .await
            {
                // Already registered; adding is idempotent
                Err(DatabaseError::Validation(_)) => continue,
                other => other?,
            }
        }
        Ok(())
    }

    async fn add_address_from(&self, address: Address, from: u64) -> Result<()> {
        let contract = Contract {
            address,
            template_name: addr_id(address),
            creation_transaction: B256::ZERO,
            last_filtered: from.saturating_sub(1),
        };
        match self
            .put_doc(CONTRACT_INDEX, &addr_id(address), &contract, true)
            .await
        {
            Err(DatabaseError::Validation(_)) => Ok(()),
            other => other,
        }
    }

    async fn delete_address(&self, address: Address) -> Result<()> {
        // Event and storage documents are left in place; the contract row
        // going away makes them unreachable through the registered set.
        self.delete_doc(CONTRACT_INDEX, &addr_id(address)).await
    }

    async fn get_addresses(&self) -> Result<Vec<Address>> {
        let result = self
            .search(
                CONTRACT_INDEX,
                json!({ "match_all": {} }),
                0,
                PAGINATION_WINDOW,
                &[],
            )
            .await?;
        let mut addresses = Vec::with_capacity(result.hits.hits.len());
        for hit in result.hits.hits {
            let contract: Contract = serde_json::from_value(hit.source)
                .map_err(|e| DatabaseError::Transient(e.to_string()))?;
            addresses.push(contract.address);
        }
        Ok(addresses)
    }

    async fn get_contract(&self, address: Address) -> Result<Contract> {
        self.get_contract_doc(address).await
    }

    async fn add_template(&self, name: &str, abi: &str, storage_layout: &str) -> Result<()> {
        let template = Template {
            template_name: name.to_string(),
            abi: abi.to_string(),
            storage_layout: storage_layout.to_string(),
        };
        self.put_doc(TEMPLATE_INDEX, name, &template, false).await
    }

    async fn assign_template(&self, address: Address, name: &str) -> Result<()> {
        // The contract row must exist before it can reference a template
        self.get_contract_doc(address).await?;
        self.update_doc(
            CONTRACT_INDEX,
            &addr_id(address),
            json!({ "templateName": name }),
        )
        .await
    }

    async fn get_contract_abi(&self, address: Address) -> Result<String> {
        let contract = self.get_contract_doc(address).await?;
        match self.get_template_doc(&contract.template_name).await {
            Ok(template) => Ok(template.abi),
            Err(DatabaseError::NotFound) => Ok(String::new()),
            Err(e) => Err(e),
        }
    }

    async fn get_storage_layout(&self, address: Address) -> Result<String> {
        let contract = self.get_contract_doc(address).await?;
        match self.get_template_doc(&contract.template_name).await {
            Ok(template) => Ok(template.storage_layout),
            Err(DatabaseError::NotFound) => Ok(String::new()),
            Err(e) => Err(e),
        }
    }

    async fn get_templates(&self) -> Result<Vec<String>> {
        let result = self
            .search(
                TEMPLATE_INDEX,
                json!({ "match_all": {} }),
                0,
                PAGINATION_WINDOW,
                &[],
            )
            .await?;
        let mut names = Vec::with_capacity(result.hits.hits.len());
        for hit in result.hits.hits {
            if let Some(name) = hit.source.get("templateName").and_then(Value::as_str) {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    async fn get_template_details(&self, name: &str) -> Result<Template> {
        self.get_template_doc(name).await
    }

    async fn write_block(&self, block: Block) -> Result<()> {
        self.put_doc(BLOCK_INDEX, &block.number.to_string(), &block, false)
            .await?;
        self.update_last_persisted().await
    }

    async fn write_blocks(&self, blocks: Vec<Block>) -> Result<()> {
        if blocks.is_empty() {
            return Ok(());
        }
        let docs = blocks
            .iter()
            .map(|b| {
                (
                    b.number.to_string(),
                    serde_json::to_value(b).expect("block serializes"),
                )
            })
            .collect();
        self.bulk_create(BLOCK_INDEX, docs).await?;
        self.update_last_persisted().await
    }

    async fn read_block(&self, number: u64) -> Result<Block> {
        self.get_typed(BLOCK_INDEX, &number.to_string()).await
    }

    async fn get_last_persisted_block_number(&self) -> Result<u64> {
        let source = self.get_doc(META_INDEX, "lastPersisted").await?;
        Ok(source
            .get("lastPersisted")
            .and_then(Value::as_u64)
            .unwrap_or(0))
    }

    async fn write_transaction(&self, transaction: Transaction) -> Result<()> {
        self.put_doc(
            TRANSACTION_INDEX,
            &hash_id(transaction.hash),
            &transaction,
            false,
        )
        .await
    }

    async fn write_transactions(&self, transactions: Vec<Transaction>) -> Result<()> {
        let docs = transactions
            .iter()
            .map(|tx| {
                (
                    hash_id(tx.hash),
                    serde_json::to_value(tx).expect("transaction serializes"),
                )
            })
            .collect();
        self.bulk_create(TRANSACTION_INDEX, docs).await
    }

    async fn read_transaction(&self, hash: B256) -> Result<Transaction> {
        self.get_typed(TRANSACTION_INDEX, &hash_id(hash)).await
    }

    async fn index_blocks(&self, addresses: Vec<Address>, blocks: Vec<Block>) -> Result<()> {
        let mut blocks = blocks;
        blocks.sort_by_key(|b| b.number);
        let highest = match blocks.last() {
            Some(b) => b.number,
            None => return Ok(()),
        };

        for block in &blocks {
            let mut transactions = Vec::with_capacity(block.transactions.len());
            for hash in &block.transactions {
                transactions.push(self.read_transaction(*hash).await?);
            }
            for address in &addresses {
                let last_filtered = self.get_last_filtered(*address).await?;
                if block.number <= last_filtered {
                    continue;
                }
                let index = filter::filter_block_for_address(&transactions, *address);
                self.index_events(&index.events).await?;
                let transfers = filter::token_transfers_for_contract(&transactions, *address);
                self.apply_token_transfers(transfers, block.number).await?;
            }
        }

        for address in addresses {
            match self
                .update_doc(
                    CONTRACT_INDEX,
                    &addr_id(address),
                    json!({ "lastFiltered": highest }),
                )
                .await
            {
                // Deregistered mid-batch
                Err(DatabaseError::NotFound) => continue,
                other => other?,
            }
        }
        Ok(())
    }

    async fn index_storage(
        &self,
        snapshots: HashMap<Address, RawAccountState>,
        block: u64,
    ) -> Result<()> {
        let mut state_docs = Vec::with_capacity(snapshots.len());
        let mut storage_docs = Vec::with_capacity(snapshots.len());
        for (address, dump) in snapshots {
            let state = crate::types::AccountState {
                address,
                block_number: block,
                storage_root: dump.root,
            };
            state_docs.push((
                format!("{}-{}", addr_id(address), block),
                serde_json::to_value(&state).expect("state serializes"),
            ));
            let storage = StorageDoc {
                storage_root: dump.root,
                storage_map: dump
                    .storage
                    .into_iter()
                    .map(|(key, value)| StorageEntryDoc { key, value })
                    .collect(),
            };
            storage_docs.push((
                hash_id(dump.root),
                serde_json::to_value(&storage).expect("storage serializes"),
            ));
        }
        self.bulk_create(STATE_INDEX, state_docs).await?;
        self.bulk_create(STORAGE_INDEX, storage_docs).await
    }

    async fn get_last_filtered(&self, address: Address) -> Result<u64> {
        match self.get_contract_doc(address).await {
            Ok(contract) => Ok(contract.last_filtered),
            Err(DatabaseError::NotFound) => Ok(0),
            Err(e) => Err(e),
        }
    }

    async fn get_storage(
        &self,
        address: Address,
        block: u64,
    ) -> Result<Option<HashMap<B256, String>>> {
        let state: crate::types::AccountState = match self
            .get_typed(STATE_INDEX, &format!("{}-{}", addr_id(address), block))
            .await
        {
            Ok(state) => state,
            Err(DatabaseError::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };
        let storage: StorageDoc = match self
            .get_typed(STORAGE_INDEX, &hash_id(state.storage_root))
            .await
        {
            Ok(storage) => storage,
            Err(DatabaseError::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(Some(
            storage
                .storage_map
                .into_iter()
                .map(|entry| (entry.key, entry.value))
                .collect(),
        ))
    }

    async fn get_transactions_to_address(
        &self,
        address: Address,
        options: &QueryOptions,
    ) -> Result<Vec<B256>> {
        check_window(options.offset(), options.page_size)?;
        let query = json!({
            "bool": {
                "filter": [ block_range_query(options) ],
                "should": [
                    { "term": { "to": addr_id(address) } },
                    { "term": { "from": addr_id(address) } },
                    { "term": { "createdContract": addr_id(address) } }
                ],
                "minimum_should_match": 1
            }
        });
        let result = self
            .search(
                TRANSACTION_INDEX,
                query,
                options.offset(),
                options.page_size,
                &["blockNumber:desc", "index:asc"],
            )
            .await?;
        result
            .hits
            .hits
            .iter()
            .map(|hit| {
                hit.source
                    .get("hash")
                    .and_then(Value::as_str)
                    .ok_or_else(|| DatabaseError::Transient("transaction without hash".into()))
                    .and_then(|s| {
                        crate::types::decode_hex_b256(s)
                            .map_err(|e| DatabaseError::Transient(e.to_string()))
                    })
            })
            .collect()
    }

    async fn get_transactions_internal_to_address(
        &self,
        address: Address,
        options: &QueryOptions,
    ) -> Result<Vec<B256>> {
        check_window(options.offset(), options.page_size)?;
        let query = json!({
            "bool": {
                "filter": [ block_range_query(options) ],
                "must": [{
                    "nested": {
                        "path": "internalCalls",
                        "query": {
                            "bool": {
                                "should": [
                                    { "term": { "internalCalls.to": addr_id(address) } },
                                    { "term": { "internalCalls.from": addr_id(address) } }
                                ],
                                "minimum_should_match": 1
                            }
                        }
                    }
                }]
            }
        });
        let result = self
            .search(
                TRANSACTION_INDEX,
                query,
                options.offset(),
                options.page_size,
                &["blockNumber:desc", "index:asc"],
            )
            .await?;
        result
            .hits
            .hits
            .iter()
            .map(|hit| {
                hit.source
                    .get("hash")
                    .and_then(Value::as_str)
                    .ok_or_else(|| DatabaseError::Transient("transaction without hash".into()))
                    .and_then(|s| {
                        crate::types::decode_hex_b256(s)
                            .map_err(|e| DatabaseError::Transient(e.to_string()))
                    })
            })
            .collect()
    }

    async fn get_events_from_address(
        &self,
        address: Address,
        options: &QueryOptions,
    ) -> Result<Vec<Event>> {
        check_window(options.offset(), options.page_size)?;
        let query = json!({
            "bool": {
                "filter": [
                    { "term": { "address": addr_id(address) } },
                    block_range_query(options)
                ]
            }
        });
        let result = self
            .search(
                EVENT_INDEX,
                query,
                options.offset(),
                options.page_size,
                &["blockNumber:desc", "index:asc"],
            )
            .await?;
        result
            .hits
            .hits
            .into_iter()
            .map(|hit| {
                serde_json::from_value(hit.source)
                    .map_err(|e| DatabaseError::Transient(e.to_string()))
            })
            .collect()
    }

    async fn get_transactions_to_address_total(
        &self,
        address: Address,
        options: &QueryOptions,
    ) -> Result<u64> {
        let query = json!({
            "bool": {
                "filter": [ block_range_query(options) ],
                "should": [
                    { "term": { "to": addr_id(address) } },
                    { "term": { "from": addr_id(address) } },
                    { "term": { "createdContract": addr_id(address) } }
                ],
                "minimum_should_match": 1
            }
        });
        self.count(TRANSACTION_INDEX, query).await
    }

    async fn get_transactions_internal_to_address_total(
        &self,
        address: Address,
        options: &QueryOptions,
    ) -> Result<u64> {
        let query = json!({
            "bool": {
                "filter": [ block_range_query(options) ],
                "must": [{
                    "nested": {
                        "path": "internalCalls",
                        "query": {
                            "bool": {
                                "should": [
                                    { "term": { "internalCalls.to": addr_id(address) } },
                                    { "term": { "internalCalls.from": addr_id(address) } }
                                ],
                                "minimum_should_match": 1
                            }
                        }
                    }
                }]
            }
        });
        self.count(TRANSACTION_INDEX, query).await
    }

    async fn get_events_from_address_total(
        &self,
        address: Address,
        options: &QueryOptions,
    ) -> Result<u64> {
        let query = json!({
            "bool": {
                "filter": [
                    { "term": { "address": addr_id(address) } },
                    block_range_query(options)
                ]
            }
        });
        self.count(EVENT_INDEX, query).await
    }

    async fn record_new_balance(
        &self,
        contract: Address,
        holder: Address,
        block: u64,
        amount: U256,
    ) -> Result<()> {
        let doc = TokenBalanceDoc {
            contract,
            holder,
            block_number: block,
            amount: amount.to_string(),
        };
        let id = format!("{}-{}-{}", addr_id(contract), addr_id(holder), block);
        match self.put_doc(TOKEN_INDEX, &id, &doc, true).await {
            // Replayed block: the balance for this block is already recorded
            Err(DatabaseError::Validation(_)) => Ok(()),
            other => other,
        }
    }

    async fn get_balance(
        &self,
        contract: Address,
        holder: Address,
        options: &QueryOptions,
    ) -> Result<Vec<(u64, U256)>> {
        check_window(options.offset(), options.page_size)?;
        let query = json!({
            "bool": {
                "filter": [
                    { "term": { "contract": addr_id(contract) } },
                    { "term": { "holder": addr_id(holder) } },
                    { "exists": { "field": "amount" } },
                    block_range_query(options)
                ]
            }
        });
        let result = self
            .search(
                TOKEN_INDEX,
                query,
                options.offset(),
                options.page_size,
                &["blockNumber:desc"],
            )
            .await?;
        let mut balances = Vec::with_capacity(result.hits.hits.len());
        for hit in result.hits.hits {
            let doc: TokenBalanceDoc = serde_json::from_value(hit.source)
                .map_err(|e| DatabaseError::Transient(e.to_string()))?;
            let amount = U256::from_str_radix(&doc.amount, 10)
                .map_err(|e| DatabaseError::Transient(format!("bad amount: {}", e)))?;
            balances.push((doc.block_number, amount));
        }
        Ok(balances)
    }

    async fn record_erc721_token(
        &self,
        contract: Address,
        holder: Address,
        block: u64,
        token_id: U256,
    ) -> Result<()> {
        // Find the holding interval open at the previous block, if any
        let existing = match self
            .erc721_token_by_token_id(contract, block.saturating_sub(1), token_id)
            .await
        {
            Ok(token) => Some(token),
            Err(DatabaseError::NotFound) => None,
            Err(e) => return Err(e),
        };

        let (token_padded, chunks) = token_sort_key(token_id);
        let doc = SortableErc721Doc {
            token: Erc721Token {
                contract,
                holder,
                token: token_id.to_string(),
                held_from: block,
                held_until: None,
            },
            token_padded,
            first: chunks[0],
            second: chunks[1],
            third: chunks[2],
            fourth: chunks[3],
            fifth: chunks[4],
        };
        let id = format!("{}-{}-{}", addr_id(contract), token_id, block);
        match self.put_doc(TOKEN_INDEX, &id, &doc, true).await {
            Err(DatabaseError::Validation(_)) => return Ok(()), // replayed block
            other => other?,
        }

        if let Some(existing) = existing {
            let old_id = format!("{}-{}-{}", addr_id(contract), token_id, existing.held_from);
            self.update_doc(TOKEN_INDEX, &old_id, json!({ "heldUntil": block - 1 }))
                .await?;
        }
        Ok(())
    }

    async fn erc721_token_by_token_id(
        &self,
        contract: Address,
        block: u64,
        token_id: U256,
    ) -> Result<Erc721Token> {
        let query = json!({
            "bool": {
                "filter": [
                    { "term": { "contract": addr_id(contract) } },
                    { "term": { "token": token_id.to_string() } },
                    held_at_block_query(block)
                ]
            }
        });
        let result = self.search(TOKEN_INDEX, query, 0, 1, &[]).await?;
        let hit = result.hits.hits.into_iter().next().ok_or(DatabaseError::NotFound)?;
        serde_json::from_value(hit.source).map_err(|e| DatabaseError::Transient(e.to_string()))
    }

    async fn erc721_tokens_for_account_at_block(
        &self,
        contract: Address,
        holder: Address,
        block: u64,
        options: &TokenQueryOptions,
    ) -> Result<Vec<Erc721Token>> {
        check_window(options.offset(), options.page_size)?;
        let mut filters = vec![
            json!({ "term": { "contract": addr_id(contract) } }),
            json!({ "term": { "holder": addr_id(holder) } }),
            held_at_block_query(block),
        ];
        if let Some(range) = token_id_range_query(options) {
            filters.push(range);
        }
        let result = self
            .search(
                TOKEN_INDEX,
                json!({ "bool": { "filter": filters } }),
                options.offset(),
                options.page_size,
                &["first:desc", "second:desc", "third:desc", "fourth:desc", "fifth:desc"],
            )
            .await?;
        result
            .hits
            .hits
            .into_iter()
            .map(|hit| {
                serde_json::from_value(hit.source)
                    .map_err(|e| DatabaseError::Transient(e.to_string()))
            })
            .collect()
    }

    async fn all_erc721_tokens_at_block(
        &self,
        contract: Address,
        block: u64,
        options: &TokenQueryOptions,
    ) -> Result<Vec<Erc721Token>> {
        check_window(options.offset(), options.page_size)?;
        let mut filters = vec![
            json!({ "term": { "contract": addr_id(contract) } }),
            held_at_block_query(block),
        ];
        if let Some(range) = token_id_range_query(options) {
            filters.push(range);
        }
        let result = self
            .search(
                TOKEN_INDEX,
                json!({ "bool": { "filter": filters } }),
                options.offset(),
                options.page_size,
                &["first:desc", "second:desc", "third:desc", "fourth:desc", "fifth:desc"],
            )
            .await?;
        result
            .hits
            .hits
            .into_iter()
            .map(|hit| {
                serde_json::from_value(hit.source)
                    .map_err(|e| DatabaseError::Transient(e.to_string()))
            })
            .collect()
    }

    async fn all_holders_at_block(
        &self,
        contract: Address,
        block: u64,
        options: &TokenQueryOptions,
    ) -> Result<Vec<Address>> {
        if options.page_size > PAGINATION_WINDOW {
            return Err(DatabaseError::PaginationLimitExceeded);
        }
        let mut composite = json!({
            "size": options.page_size,
            "sources": [ { "holder": { "terms": { "field": "holder" } } } ]
        });
        if let Some(after) = options.after {
            composite["after"] = json!({ "holder": addr_id(after) });
        }
        let url = format!("{}/{}/_search", self.base_url, TOKEN_INDEX);
        let body = json!({
            "size": 0,
            "query": {
                "bool": {
                    "filter": [
                        { "term": { "contract": addr_id(contract) } },
                        held_at_block_query(block)
                    ]
                }
            },
            "aggs": { "holders": { "composite": composite } }
        });
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| DatabaseError::Transient(e.to_string()))?;
        let result: SearchResult = response
            .json()
            .await
            .map_err(|e| DatabaseError::Transient(e.to_string()))?;

        let buckets = result
            .aggregations
            .as_ref()
            .and_then(|aggs| aggs.pointer("/holders/buckets"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut holders = Vec::with_capacity(buckets.len());
        for bucket in buckets {
            if let Some(holder) = bucket.pointer("/key/holder").and_then(Value::as_str) {
                holders.push(
                    crate::types::decode_hex_address(holder)
                        .map_err(|e| DatabaseError::Transient(e.to_string()))?,
                );
            }
        }
        Ok(holders)
    }
}
