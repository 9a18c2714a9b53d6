//! Read-only storage view for the layout parser
//!
//! A [`StorageManager`] exposes one account's storage at one block as a
//! mapping from slot hash to a 32-byte hex word. Missing slots read as the
//! zero word, per EVM convention.

use alloy_primitives::B256;
use std::collections::HashMap;

/// The 64-character zero word returned for unset slots.
pub const ZERO_WORD: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Slot-level read access scoped to a single parse.
pub trait StorageManager {
    /// The 32-byte word at `slot`, as 64 lowercase hex characters without a
    /// 0x prefix. Unset slots return the zero word.
    fn get(&self, slot: B256) -> String;
}

/// Storage manager backed by a snapshot map.
#[derive(Debug, Default, Clone)]
pub struct AccountStorage {
    entries: HashMap<B256, String>,
}

impl AccountStorage {
    pub fn new(entries: HashMap<B256, String>) -> Self {
        Self { entries }
    }
}

impl StorageManager for AccountStorage {
    fn get(&self, slot: B256) -> String {
        match self.entries.get(&slot) {
            Some(word) => normalize_word(word),
            None => ZERO_WORD.to_string(),
        }
    }
}

/// Left-pad a stored hex word to a full 32 bytes and strip any 0x prefix.
fn normalize_word(word: &str) -> String {
    let s = word.strip_prefix("0x").unwrap_or(word).to_lowercase();
    if s.len() >= 64 {
        s
    } else {
        format!("{}{}", "0".repeat(64 - s.len()), s)
    }
}
