//! Core data model for the reporting index
//!
//! These structs are what the pipeline produces and the database persists.
//! Document backends store them as JSON, so every type derives serde with
//! camelCase field names; byte payloads serialize as 0x-prefixed hex.

use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A block header plus the hashes of its transactions. Immutable once ingested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub timestamp: u64,
    /// Hashes of the transactions contained in this block, in order.
    pub transactions: Vec<B256>,
}

/// A fully enriched transaction record.
///
/// `to` is the zero address for contract creations; `created_contract` is the
/// zero address for everything else.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub hash: B256,
    pub block_number: u64,
    /// Position of the transaction within its block.
    pub index: u64,
    pub from: Address,
    pub to: Address,
    pub value: u64,
    pub gas: u64,
    pub gas_used: u64,
    pub cumulative_gas_used: u64,
    pub nonce: u64,
    pub status: bool,
    pub created_contract: Address,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub private_data: Vec<u8>,
    pub is_private: bool,
    pub events: Vec<Event>,
    pub internal_calls: Vec<InternalCall>,
}

/// An event log emitted during transaction execution.
///
/// `index` is the log index within the enclosing block, so `(block_number,
/// index)` identifies an event globally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub block_number: u64,
    pub transaction_hash: B256,
    pub index: u64,
    pub address: Address,
    pub topics: Vec<B256>,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

/// A sub-call reported by the `callTracer`. Only top-level calls are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalCall {
    pub from: Address,
    pub to: Address,
    #[serde(rename = "type")]
    pub call_type: String,
    pub gas: u64,
    pub gas_used: u64,
    pub value: u64,
    #[serde(with = "hex_bytes")]
    pub input: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub output: Vec<u8>,
}

/// A registered contract address with its per-address high-water mark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contract {
    pub address: Address,
    /// Template this contract uses; defaults to the address string until
    /// assigned.
    pub template_name: String,
    pub creation_transaction: B256,
    /// Largest block number whose content has been filtered for this address.
    pub last_filtered: u64,
}

/// A reusable (abi, storage layout) pair shared by many addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub template_name: String,
    pub abi: String,
    pub storage_layout: String,
}

/// Per-address per-block pointer into the content-addressed storage dumps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountState {
    pub address: Address,
    pub block_number: u64,
    pub storage_root: B256,
}

/// A raw storage snapshot for one account, as dumped by the upstream node.
///
/// Content-addressed by `root` so unchanged snapshots deduplicate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawAccountState {
    pub root: B256,
    /// Slot hash -> 32-byte hex word (no 0x prefix).
    pub storage: HashMap<B256, String>,
}

/// One open or closed holding interval for an ERC-721 token.
///
/// `held_until == None` means currently held. Intervals for a given
/// (contract, token) never overlap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Erc721Token {
    pub contract: Address,
    pub holder: Address,
    /// Token id as a decimal string (token ids are unbounded uint256).
    pub token: String,
    pub held_from: u64,
    pub held_until: Option<u64>,
}

impl Erc721Token {
    /// Numeric token id.
    pub fn token_id(&self) -> Option<U256> {
        U256::from_str_radix(&self.token, 10).ok()
    }

    /// Whether this interval covers `block`.
    pub fn held_at(&self, block: u64) -> bool {
        self.held_from <= block && self.held_until.map_or(true, |until| block <= until)
    }
}

/// A chain-head notification from the upstream subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
}

/// Options for paginated block-range queries.
///
/// `end_block_number == -1` means an open upper bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOptions {
    pub begin_block_number: u64,
    pub end_block_number: i64,
    pub page_size: usize,
    pub page_number: usize,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            begin_block_number: 0,
            end_block_number: -1,
            page_size: 10,
            page_number: 0,
        }
    }
}

impl QueryOptions {
    /// Returns true if `block` falls inside the requested range.
    pub fn contains(&self, block: u64) -> bool {
        block >= self.begin_block_number
            && (self.end_block_number < 0 || block <= self.end_block_number as u64)
    }

    /// Offset of the first hit of the requested page.
    pub fn offset(&self) -> usize {
        self.page_size * self.page_number
    }
}

/// Options for paginated token queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenQueryOptions {
    /// Inclusive token id lower bound.
    pub begin_token_id: Option<U256>,
    /// Inclusive token id upper bound.
    pub end_token_id: Option<U256>,
    /// Resume holder listing after this address.
    pub after: Option<Address>,
    pub page_size: usize,
    pub page_number: usize,
}

impl TokenQueryOptions {
    /// Token query options with the default page geometry.
    pub fn paged() -> Self {
        Self {
            page_size: 10,
            ..Self::default()
        }
    }

    pub fn offset(&self) -> usize {
        self.page_size * self.page_number
    }

    /// Returns true if `token_id` falls inside the requested id range.
    pub fn contains_token(&self, token_id: U256) -> bool {
        self.begin_token_id.map_or(true, |b| token_id >= b)
            && self.end_token_id.map_or(true, |e| token_id <= e)
    }
}

/// Serde adapter: byte payloads as 0x-prefixed hex strings.
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        super::decode_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Pad an odd-length hex string with a leading zero.
///
/// Upstream nodes routinely return quantities without leading zeros.
pub fn pad_hex_string(s: &str) -> String {
    if !s.is_empty() && s.len() % 2 == 1 {
        format!("0{}", s)
    } else {
        s.to_string()
    }
}

/// Decode a hex string with or without 0x prefix; empty input is empty bytes.
pub fn decode_hex(s: &str) -> anyhow::Result<Vec<u8>> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.is_empty() {
        return Ok(Vec::new());
    }
    Ok(hex::decode(pad_hex_string(s))?)
}

/// Decode a 0x-prefixed hex quantity into a u64.
pub fn decode_hex_u64(s: &str) -> anyhow::Result<u64> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.is_empty() {
        anyhow::bail!("empty hex quantity");
    }
    Ok(u64::from_str_radix(s, 16)?)
}

/// Decode a 32-byte hash from hex.
pub fn decode_hex_b256(s: &str) -> anyhow::Result<B256> {
    let bytes = decode_hex(s)?;
    if bytes.len() != 32 {
        anyhow::bail!("expected 32 bytes for hash, got {}", bytes.len());
    }
    Ok(B256::from_slice(&bytes))
}

/// Decode a 20-byte address from hex. Empty input is the zero address.
pub fn decode_hex_address(s: &str) -> anyhow::Result<Address> {
    let stripped = s.strip_prefix("0x").unwrap_or(s);
    if stripped.is_empty() {
        return Ok(Address::ZERO);
    }
    let bytes = decode_hex(s)?;
    if bytes.len() != 20 {
        anyhow::bail!("expected 20 bytes for address, got {}", bytes.len());
    }
    Ok(Address::from_slice(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_hex_quantities() {
        assert_eq!(decode_hex_u64("0x10").unwrap(), 16);
        assert_eq!(decode_hex_u64("ff").unwrap(), 255);
        assert!(decode_hex_u64("0x").is_err());

        // Odd-length quantities are padded rather than rejected
        assert_eq!(decode_hex("0x1").unwrap(), vec![0x01]);
        assert_eq!(decode_hex("0x").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_decode_hex_address_empty_is_zero() {
        assert_eq!(decode_hex_address("0x").unwrap(), Address::ZERO);
        assert_eq!(decode_hex_address("").unwrap(), Address::ZERO);
        let addr = decode_hex_address("0x0742d35cc6634c0532925a3b844bc9e7595f0beb").unwrap();
        assert_eq!(
            format!("0x{:x}", addr),
            "0x0742d35cc6634c0532925a3b844bc9e7595f0beb"
        );
    }

    #[test]
    fn test_transaction_json_roundtrip() {
        let tx = Transaction {
            hash: B256::repeat_byte(1),
            block_number: 7,
            index: 2,
            from: Address::repeat_byte(9),
            to: Address::repeat_byte(1),
            value: 666,
            data: vec![0xde, 0xad],
            events: vec![Event {
                block_number: 7,
                transaction_hash: B256::repeat_byte(1),
                index: 0,
                address: Address::repeat_byte(1),
                topics: vec![B256::ZERO],
                data: vec![],
            }],
            ..Default::default()
        };
        let json = serde_json::to_string(&tx).unwrap();
        assert!(json.contains("\"blockNumber\":7"));
        assert!(json.contains("\"data\":\"0xdead\""));
        let back: Transaction = serde_json::from_str(&json).unwrap();
        assert_eq!(tx, back);
    }

    #[test]
    fn test_query_options_defaults_and_range() {
        let opts = QueryOptions::default();
        assert_eq!(opts.page_size, 10);
        assert_eq!(opts.page_number, 0);
        assert!(opts.contains(0));
        assert!(opts.contains(u64::MAX));

        let bounded = QueryOptions {
            begin_block_number: 5,
            end_block_number: 10,
            ..QueryOptions::default()
        };
        assert!(!bounded.contains(4));
        assert!(bounded.contains(5));
        assert!(bounded.contains(10));
        assert!(!bounded.contains(11));
    }

    #[test]
    fn test_erc721_held_at() {
        let open = Erc721Token {
            contract: Address::repeat_byte(1),
            holder: Address::repeat_byte(2),
            token: "5".into(),
            held_from: 20,
            held_until: None,
        };
        assert!(!open.held_at(19));
        assert!(open.held_at(20));
        assert!(open.held_at(1_000_000));

        let closed = Erc721Token {
            held_until: Some(29),
            ..open
        };
        assert!(closed.held_at(29));
        assert!(!closed.held_at(30));
    }

    #[test]
    fn test_erc721_token_id_decimal() {
        let t = Erc721Token {
            contract: Address::ZERO,
            holder: Address::ZERO,
            token: "115792089237316195423570985008687907853269984665640564039457584007913129639935"
                .into(),
            held_from: 0,
            held_until: None,
        };
        assert_eq!(t.token_id().unwrap(), U256::MAX);
    }
}
