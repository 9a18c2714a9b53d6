//! Solidity storage-layout parser
//!
//! Reconstructs typed values from raw 32-byte storage words using the layout
//! document emitted by the Solidity compiler. Handles packed primitives,
//! structs, fixed and dynamic arrays, short and long strings/bytes, and
//! mapping values for a known key.
//!
//! Parsing never mutates anything: the same document over the same storage
//! always yields the same output.

use crate::error::ParseError;
use crate::storage::StorageManager;
use alloy_primitives::{keccak256, B256, U256};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// A storage layout document: ordered entries plus the type dictionary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageDocument {
    #[serde(default)]
    pub storage: Vec<StorageEntry>,
    #[serde(default)]
    pub types: HashMap<String, TypeEntry>,
}

/// One named field at a (slot, offset) position.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageEntry {
    #[serde(default)]
    pub label: String,
    #[serde(default, deserialize_with = "u64_lenient")]
    pub offset: u64,
    #[serde(default, deserialize_with = "u64_lenient")]
    pub slot: u64,
    #[serde(rename = "type")]
    pub type_name: String,
}

/// A type dictionary entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TypeEntry {
    pub encoding: String,
    #[serde(rename = "numberOfBytes", default, deserialize_with = "u64_lenient")]
    pub number_of_bytes: u64,
    #[serde(default)]
    pub label: String,
    /// Element type of arrays.
    #[serde(default)]
    pub base: Option<String>,
    /// Key type of mappings.
    #[serde(default)]
    pub key: Option<String>,
    /// Value type of mappings.
    #[serde(default)]
    pub value: Option<String>,
    /// Struct members.
    #[serde(default)]
    pub members: Option<Vec<StorageEntry>>,
}

/// A decoded storage value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ParsedValue {
    Bool(bool),
    /// Decimal rendering of any integer width, possibly negative.
    Number(String),
    /// 0x-prefixed lowercase hex, 20 bytes.
    Address(String),
    /// 0x-prefixed hex of raw bytes.
    Bytes(String),
    Text(String),
    Array(Vec<ParsedValue>),
    Struct(Vec<StorageItem>),
}

/// One parsed top-level or struct field.
///
/// A field that failed to decode keeps its error; the rest of the document
/// still parses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageItem {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<ParsedValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Parse a layout document from its JSON source.
pub fn parse_storage_layout(raw: &str) -> Result<StorageDocument, ParseError> {
    serde_json::from_str(raw).map_err(|e| ParseError::MalformedLayout(e.to_string()))
}

/// Decoder for one account's storage under one layout document.
pub struct StorageParser<'a> {
    storage: &'a dyn StorageManager,
    document: &'a StorageDocument,
    slot_offset: B256,
}

impl<'a> StorageParser<'a> {
    pub fn new(
        storage: &'a dyn StorageManager,
        document: &'a StorageDocument,
        slot_offset: B256,
    ) -> Self {
        Self {
            storage,
            document,
            slot_offset,
        }
    }

    /// Decode every entry of the document, in document order.
    ///
    /// Mappings are skipped (they cannot be enumerated from storage alone);
    /// use [`StorageParser::parse_mapping_value`] for a known key. An entry
    /// that fails to decode is reported in place and parsing continues.
    pub fn parse_raw_storage(&self) -> Vec<StorageItem> {
        let mut out = Vec::with_capacity(self.document.storage.len());
        for entry in &self.document.storage {
            if let Some(ty) = self.document.types.get(&entry.type_name) {
                if ty.encoding == "mapping" {
                    tracing::debug!(field = %entry.label, "skipping mapping entry");
                    continue;
                }
            }
            match self.parse_entry(entry) {
                Ok(value) => out.push(StorageItem {
                    name: entry.label.clone(),
                    value: Some(value),
                    error: None,
                }),
                Err(e) => {
                    tracing::warn!(field = %entry.label, error = %e, "storage entry failed to parse");
                    out.push(StorageItem {
                        name: entry.label.clone(),
                        value: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }
        out
    }

    /// Decode the mapping value stored under `key` (already left-padded to
    /// 32 bytes) for a mapping entry.
    pub fn parse_mapping_value(
        &self,
        entry: &StorageEntry,
        key: B256,
    ) -> Result<ParsedValue, ParseError> {
        let ty = self.lookup(&entry.type_name)?;
        if ty.encoding != "mapping" {
            return Err(ParseError::MalformedLayout(format!(
                "'{}' is not a mapping",
                entry.type_name
            )));
        }
        let value_type = ty.value.clone().ok_or_else(|| {
            ParseError::MalformedLayout(format!("mapping '{}' has no value type", entry.type_name))
        })?;

        // value slot = keccak256(pad32(key) || pad32(resolved mapping slot))
        let mapping_slot = self.resolve_slot(entry.slot);
        let mut preimage = [0u8; 64];
        preimage[..32].copy_from_slice(key.as_slice());
        preimage[32..].copy_from_slice(mapping_slot.as_slice());
        let value_slot = keccak256(preimage);

        let synthetic = StorageEntry {
            label: entry.label.clone(),
            offset: 0,
            slot: 0,
            type_name: value_type,
        };
        self.with_offset(value_slot).parse_entry(&synthetic)
    }

    fn lookup(&self, type_name: &str) -> Result<&'a TypeEntry, ParseError> {
        self.document
            .types
            .get(type_name)
            .ok_or_else(|| ParseError::UnknownType(type_name.to_string()))
    }

    fn with_offset(&self, slot_offset: B256) -> StorageParser<'a> {
        StorageParser {
            storage: self.storage,
            document: self.document,
            slot_offset,
        }
    }

    /// Absolute slot for a document-relative slot number.
    fn resolve_slot(&self, slot: u64) -> B256 {
        let base = U256::from_be_bytes(self.slot_offset.0);
        B256::from(base.wrapping_add(U256::from(slot)).to_be_bytes::<32>())
    }

    fn parse_entry(&self, entry: &StorageEntry) -> Result<ParsedValue, ParseError> {
        let ty = self.lookup(&entry.type_name)?;
        match ty.encoding.as_str() {
            "inplace" => self.parse_inplace(entry, ty),
            "bytes" => self.parse_bytes_value(entry, ty),
            "dynamic_array" => Ok(ParsedValue::Array(self.parse_array(entry, ty)?)),
            "mapping" => Err(ParseError::MalformedLayout(
                "mapping values require a key".to_string(),
            )),
            other => Err(ParseError::MalformedLayout(format!(
                "unsupported encoding '{}'",
                other
            ))),
        }
    }

    fn parse_inplace(&self, entry: &StorageEntry, ty: &TypeEntry) -> Result<ParsedValue, ParseError> {
        if entry.type_name.starts_with("t_array(") {
            return Ok(ParsedValue::Array(self.parse_array(entry, ty)?));
        }
        if let Some(members) = &ty.members {
            return self.parse_struct(entry, members);
        }

        let extracted = self.extract(
            self.resolve_slot(entry.slot),
            entry.offset,
            ty.number_of_bytes,
        )?;
        let label = ty.label.as_str();
        if label.starts_with("uint") || label.starts_with("enum") {
            Ok(ParsedValue::Number(
                U256::from_be_slice(&extracted).to_string(),
            ))
        } else if label.starts_with("int") {
            Ok(ParsedValue::Number(render_signed(&extracted)))
        } else if label.starts_with("bool") {
            Ok(ParsedValue::Bool(extracted.iter().any(|b| *b != 0)))
        } else if label.starts_with("address") || label.starts_with("contract") {
            let start = extracted.len().saturating_sub(20);
            Ok(ParsedValue::Address(format!(
                "0x{}",
                hex::encode(&extracted[start..])
            )))
        } else if label.starts_with("bytes") {
            Ok(ParsedValue::Bytes(format!("0x{}", hex::encode(&extracted))))
        } else {
            Err(ParseError::UnknownType(format!(
                "{} ({})",
                entry.type_name, label
            )))
        }
    }

    fn parse_struct(
        &self,
        entry: &StorageEntry,
        members: &[StorageEntry],
    ) -> Result<ParsedValue, ParseError> {
        let base = self.resolve_slot(entry.slot);
        let inner = self.with_offset(base);
        let mut fields = Vec::with_capacity(members.len());
        for member in members {
            match inner.parse_entry(member) {
                Ok(value) => fields.push(StorageItem {
                    name: member.label.clone(),
                    value: Some(value),
                    error: None,
                }),
                Err(e) => fields.push(StorageItem {
                    name: member.label.clone(),
                    value: None,
                    error: Some(e.to_string()),
                }),
            }
        }
        Ok(ParsedValue::Struct(fields))
    }

    fn parse_array(&self, entry: &StorageEntry, ty: &TypeEntry) -> Result<Vec<ParsedValue>, ParseError> {
        let dynamic = ty.encoding == "dynamic_array";
        let size = self.array_size(entry, dynamic)?;
        let base_type = ty.base.clone().ok_or_else(|| {
            ParseError::MalformedLayout(format!("array '{}' has no base type", entry.type_name))
        })?;
        let element_bytes = self.lookup(&base_type)?.number_of_bytes;
        if element_bytes == 0 || element_bytes > 32 {
            return Err(ParseError::MalformedLayout(format!(
                "array element size {} out of range",
                element_bytes
            )));
        }

        let mut data_slot = self.resolve_slot(entry.slot);
        if dynamic {
            // Dynamic array data lives at keccak256 of the (padded) slot
            data_slot = keccak256(data_slot);
        }

        let elements = synthesize_array_entries(size, element_bytes, &base_type);
        let inner = self.with_offset(data_slot);
        elements.iter().map(|e| inner.parse_entry(e)).collect()
    }

    fn array_size(&self, entry: &StorageEntry, dynamic: bool) -> Result<u64, ParseError> {
        if dynamic {
            // Length is the uint stored at the array's own slot
            let word = self.extract(self.resolve_slot(entry.slot), 0, 32)?;
            return u64::try_from(U256::from_be_slice(&word))
                .map_err(|_| ParseError::MalformedLayout("array length out of range".to_string()));
        }

        // Static size is embedded in the type name: t_array(t_uint256)3_storage
        let name = &entry.type_name;
        let start = name.rfind(')');
        let end = name.rfind('_');
        match (start, end) {
            (Some(start), Some(end)) if start + 1 < end => name[start + 1..end]
                .parse::<u64>()
                .map_err(|_| ParseError::BadArraySize(name.clone())),
            _ => Err(ParseError::BadArraySize(name.clone())),
        }
    }

    fn parse_bytes_value(&self, entry: &StorageEntry, ty: &TypeEntry) -> Result<ParsedValue, ParseError> {
        let slot = self.resolve_slot(entry.slot);
        let word = decode_word(&self.storage.get(slot))?;

        let marker = word[31];
        let data = if marker & 1 == 0 {
            // Short form: data in-slot, length is marker / 2
            let len = (marker / 2) as usize;
            if len > 31 {
                return Err(ParseError::MalformedLayout(format!(
                    "in-slot byte length {} exceeds 31",
                    len
                )));
            }
            word[..len].to_vec()
        } else {
            // Long form: length word is 2*len + 1, data starts at keccak(slot)
            let length_word = U256::from_be_slice(&word);
            let len = u64::try_from((length_word - U256::from(1)) >> 1)
                .map_err(|_| ParseError::MalformedLayout("byte length out of range".to_string()))?
                as usize;
            let mut data = Vec::with_capacity(len);
            let data_slot = keccak256(slot);
            for i in 0..len.div_ceil(32) {
                let chunk_slot = add_slots(data_slot, i as u64);
                data.extend_from_slice(&decode_word(&self.storage.get(chunk_slot))?);
            }
            data.truncate(len);
            data
        };

        if ty.label.starts_with("string") {
            Ok(ParsedValue::Text(
                String::from_utf8_lossy(&data).into_owned(),
            ))
        } else {
            Ok(ParsedValue::Bytes(format!("0x{}", hex::encode(&data))))
        }
    }

    /// Take `number_of_bytes` right-aligned at `offset` from the word at
    /// `slot` (Solidity packs fields from the low end of the word).
    fn extract(&self, slot: B256, offset: u64, number_of_bytes: u64) -> Result<Vec<u8>, ParseError> {
        if offset + number_of_bytes > 32 {
            return Err(ParseError::MalformedLayout(format!(
                "field at offset {} with {} bytes overflows its slot",
                offset, number_of_bytes
            )));
        }
        let word = decode_word(&self.storage.get(slot))?;
        let hi = (32 - offset) as usize;
        let lo = hi - number_of_bytes as usize;
        Ok(word[lo..hi].to_vec())
    }
}

/// Build the fake entry list an array decodes through, packing consecutive
/// elements into a slot while they fit.
fn synthesize_array_entries(size: u64, element_bytes: u64, base_type: &str) -> Vec<StorageEntry> {
    let mut entries = Vec::with_capacity(size as usize);
    let mut slot = 0u64;
    let mut offset = 0u64;
    for _ in 0..size {
        entries.push(StorageEntry {
            label: String::new(),
            offset,
            slot,
            type_name: base_type.to_string(),
        });
        offset += element_bytes;
        if offset + element_bytes > 32 {
            slot += offset.div_ceil(32);
            offset = 0;
        }
    }
    entries
}

/// Decimal rendering of a signed big-endian slice, sign-extended from its
/// most significant bit.
fn render_signed(bytes: &[u8]) -> String {
    let value = U256::from_be_slice(bytes);
    let negative = bytes.first().is_some_and(|b| b & 0x80 != 0);
    if !negative {
        return value.to_string();
    }
    // Two's complement over the field width; wrapping handles 32-byte ints
    let width_bits = 8 * bytes.len();
    let modulus = if width_bits >= 256 {
        U256::ZERO
    } else {
        U256::from(1) << width_bits
    };
    format!("-{}", modulus.wrapping_sub(value))
}

fn decode_word(word: &str) -> Result<[u8; 32], ParseError> {
    let bytes = hex::decode(word)
        .map_err(|e| ParseError::MalformedLayout(format!("bad storage word: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| ParseError::MalformedLayout("storage word is not 32 bytes".to_string()))
}

fn add_slots(slot: B256, n: u64) -> B256 {
    let base = U256::from_be_bytes(slot.0);
    B256::from(base.wrapping_add(U256::from(n)).to_be_bytes::<32>())
}

fn u64_lenient<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    // The Solidity compiler emits slot/numberOfBytes as JSON strings
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(u64),
        String(String),
    }
    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => Ok(n),
        NumberOrString::String(s) => s.parse().map_err(serde::de::Error::custom),
    }
}
