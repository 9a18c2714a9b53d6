//! Upstream node client
//!
//! Three transports against the same node: JSON-RPC over HTTP for block and
//! trace data, GraphQL for transaction detail (one query returns the
//! transaction, its receipt fields, and its logs together), and a WebSocket
//! `newHeads` subscription for chain-head notifications.

use crate::types::{self, Block, Header, RawAccountState};
use alloy_primitives::{Address, B256};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Upstream operations the pipeline needs.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Number of the current chain head.
    async fn current_block_number(&self) -> Result<u64>;

    /// Header and transaction hashes of one block.
    async fn block_by_number(&self, number: u64) -> Result<Block>;

    /// Transaction, receipt fields, and logs in one payload.
    async fn transaction_detail(&self, hash: B256) -> Result<TransactionDetail>;

    /// Internal-call tree from the `callTracer`.
    async fn trace_transaction(&self, hash: B256) -> Result<CallFrame>;

    /// Raw storage snapshot of a contract at a block; `None` when the node
    /// cannot produce one.
    async fn dump_account(&self, address: Address, block: u64) -> Result<Option<RawAccountState>>;

    /// Chain-head notifications. The returned channel closes when the
    /// subscription dies; the caller is expected to resubscribe.
    async fn subscribe_new_heads(&self) -> Result<mpsc::Receiver<Header>>;
}

/// Raw transaction detail as returned by the GraphQL endpoint. All
/// quantities are hex strings, decoded strictly by the enricher.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionDetail {
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub index: u64,
    #[serde(default)]
    pub nonce: String,
    #[serde(default)]
    pub from: AccountRef,
    #[serde(default)]
    pub to: Option<AccountRef>,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub gas: String,
    #[serde(default)]
    pub gas_used: String,
    #[serde(default)]
    pub cumulative_gas_used: String,
    #[serde(default)]
    pub created_contract: Option<AccountRef>,
    #[serde(default)]
    pub input_data: String,
    #[serde(default)]
    pub private_input_data: Option<String>,
    #[serde(default)]
    pub is_private: Option<bool>,
    #[serde(default)]
    pub block: BlockRef,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountRef {
    #[serde(default)]
    pub address: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BlockRef {
    #[serde(default)]
    pub number: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogEntry {
    #[serde(default)]
    pub index: u64,
    #[serde(default)]
    pub account: AccountRef,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub data: String,
}

/// One node of the `callTracer` output. Kept liberal: field availability
/// varies slightly between client implementations, and a `value` is absent
/// on delegate calls.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFrame {
    #[serde(rename = "type", default)]
    pub call_type: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub gas: Option<String>,
    #[serde(default)]
    pub gas_used: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub calls: Option<Vec<CallFrame>>,
}

/// The one GraphQL query the pipeline issues.
pub fn transaction_detail_query(hash: B256) -> String {
    format!(
        r#"query {{ transaction(hash: "0x{:x}") {{
            hash status index nonce value gas gasUsed cumulativeGasUsed
            inputData privateInputData isPrivate
            from {{ address }} to {{ address }} createdContract {{ address }}
            block {{ number }}
            logs {{ index account {{ address }} topics data }}
        }} }}"#,
        hash
    )
}

/// HTTP + WebSocket implementation of [`ChainClient`].
pub struct HttpChainClient {
    client: reqwest::Client,
    rpc_url: String,
    graphql_url: String,
    ws_url: String,
}

impl HttpChainClient {
    pub fn new(
        rpc_url: impl Into<String>,
        graphql_url: impl Into<String>,
        ws_url: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            rpc_url: rpc_url.into(),
            graphql_url: graphql_url.into(),
            ws_url: ws_url.into(),
        }
    }

    /// Make a JSON-RPC call.
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params
        });
        let response = self
            .client
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await
            .context("failed to send RPC request")?;
        let body: Value = response.json().await.context("failed to parse RPC response")?;
        if let Some(error) = body.get("error") {
            anyhow::bail!("RPC error from {}: {}", method, error);
        }
        body.get("result")
            .cloned()
            .context("RPC response missing 'result' field")
    }

    async fn graphql(&self, query: String) -> Result<Value> {
        let response = self
            .client
            .post(&self.graphql_url)
            .json(&json!({ "query": query }))
            .send()
            .await
            .context("failed to send GraphQL query")?;
        let body: Value = response
            .json()
            .await
            .context("failed to parse GraphQL response")?;
        if let Some(errors) = body.get("errors") {
            if errors.as_array().is_some_and(|a| !a.is_empty()) {
                anyhow::bail!("GraphQL errors: {}", errors);
            }
        }
        body.get("data")
            .cloned()
            .context("GraphQL response missing 'data' field")
    }
}

#[async_trait]
impl ChainClient for HttpChainClient {
    async fn current_block_number(&self) -> Result<u64> {
        let result = self
            .call("eth_getBlockByNumber", json!(["latest", false]))
            .await?;
        let number = result
            .get("number")
            .and_then(Value::as_str)
            .context("block missing 'number' field")?;
        types::decode_hex_u64(number).context("failed to parse block number")
    }

    async fn block_by_number(&self, number: u64) -> Result<Block> {
        let result = self
            .call(
                "eth_getBlockByNumber",
                json!([format!("0x{:x}", number), false]),
            )
            .await?;
        if result.is_null() {
            anyhow::bail!("block {} not available upstream", number);
        }
        parse_block_payload(&result)
    }

    async fn transaction_detail(&self, hash: B256) -> Result<TransactionDetail> {
        let data = self.graphql(transaction_detail_query(hash)).await?;
        let tx = data
            .get("transaction")
            .filter(|v| !v.is_null())
            .with_context(|| format!("no transaction detail for 0x{:x}", hash))?;
        serde_json::from_value(tx.clone()).context("malformed transaction detail")
    }

    async fn trace_transaction(&self, hash: B256) -> Result<CallFrame> {
        let result = self
            .call(
                "debug_traceTransaction",
                json!([format!("0x{:x}", hash), { "tracer": "callTracer" }]),
            )
            .await?;
        serde_json::from_value(result).context("malformed call trace")
    }

    async fn dump_account(&self, address: Address, block: u64) -> Result<Option<RawAccountState>> {
        let result = self
            .call(
                "debug_dumpAddress",
                json!([format!("0x{:x}", address), format!("0x{:x}", block)]),
            )
            .await;
        let payload = match result {
            Ok(payload) => payload,
            Err(e) => {
                // Storage dumps are best-effort; not every node exposes them
                debug!(%address, block, error = %e, "storage dump unavailable");
                return Ok(None);
            }
        };
        if payload.is_null() {
            return Ok(None);
        }
        parse_account_dump(&payload).map(Some)
    }

    async fn subscribe_new_heads(&self) -> Result<mpsc::Receiver<Header>> {
        let (ws, _) = connect_async(&self.ws_url)
            .await
            .context("failed to connect chain-head WebSocket")?;
        info!(url = %self.ws_url, "chain-head subscription connected");
        let (mut write, mut read) = ws.split();

        let subscribe = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_subscribe",
            "params": ["newHeads"]
        });
        write
            .send(Message::Text(subscribe.to_string()))
            .await
            .context("failed to send eth_subscribe")?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if let Some(header) = parse_new_head(&text) {
                            if tx.send(header).await.is_err() {
                                break; // receiver dropped, subscription abandoned
                            }
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Ok(Message::Close(_)) => {
                        warn!("chain-head subscription closed by server");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "chain-head subscription error");
                        break;
                    }
                    Ok(_) => {}
                }
            }
            // Dropping `tx` closes the channel and signals the supervisor
        });
        Ok(rx)
    }
}

/// Parse an `eth_subscription` newHeads notification. Returns `None` for the
/// subscription-id confirmation and anything else that is not a head.
pub fn parse_new_head(text: &str) -> Option<Header> {
    let value: Value = serde_json::from_str(text).ok()?;
    if value.get("method")?.as_str()? != "eth_subscription" {
        return None;
    }
    let result = value.get("params")?.get("result")?;
    let number = types::decode_hex_u64(result.get("number")?.as_str()?).ok()?;
    let hash = types::decode_hex_b256(result.get("hash")?.as_str()?).ok()?;
    let parent_hash = types::decode_hex_b256(result.get("parentHash")?.as_str()?).ok()?;
    Some(Header {
        number,
        hash,
        parent_hash,
    })
}

fn parse_block_payload(payload: &Value) -> Result<Block> {
    let field = |name: &str| -> Result<&str> {
        payload
            .get(name)
            .and_then(Value::as_str)
            .with_context(|| format!("block missing '{}' field", name))
    };
    let transactions = payload
        .get("transactions")
        .and_then(Value::as_array)
        .map(|hashes| {
            hashes
                .iter()
                .filter_map(Value::as_str)
                .map(types::decode_hex_b256)
                .collect::<Result<Vec<B256>>>()
        })
        .transpose()?
        .unwrap_or_default();
    Ok(Block {
        number: types::decode_hex_u64(field("number")?)?,
        hash: types::decode_hex_b256(field("hash")?)?,
        parent_hash: types::decode_hex_b256(field("parentHash")?)?,
        timestamp: types::decode_hex_u64(field("timestamp")?)?,
        transactions,
    })
}

fn parse_account_dump(payload: &Value) -> Result<RawAccountState> {
    let root_str = payload
        .get("root")
        .and_then(Value::as_str)
        .context("dump missing 'root' field")?;
    // Some clients return the root without a 0x prefix
    let root = types::decode_hex_b256(root_str)?;
    let mut storage = std::collections::HashMap::new();
    if let Some(slots) = payload.get("storage").and_then(Value::as_object) {
        for (slot, word) in slots {
            let key = types::decode_hex_b256(slot)
                .with_context(|| format!("bad storage slot key {}", slot))?;
            let value = word
                .as_str()
                .with_context(|| format!("bad storage value at {}", slot))?;
            storage.insert(key, value.strip_prefix("0x").unwrap_or(value).to_string());
        }
    }
    Ok(RawAccountState { root, storage })
}
