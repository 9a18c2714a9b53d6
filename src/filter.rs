//! Per-address filtering of blocks
//!
//! Decides which transactions and event logs are relevant for a registered
//! contract address, and extracts ERC-20 / ERC-721 token movements from
//! Transfer logs. Both standards share the same event signature; the number
//! of indexed topics tells them apart.
//!
//! Everything here is pure: running the filter twice over the same block
//! yields identical results.

use crate::types::{Event, Transaction};
use alloy_primitives::{b256, Address, B256, U256};

/// keccak256("Transfer(address,address,uint256)")
pub const TRANSFER_TOPIC: B256 =
    b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef");

/// The transactions and events of one block that are relevant for one address.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AddressIndex {
    /// Hashes of transactions sent to, sent from, or creating the address.
    pub transactions: Vec<B256>,
    /// Hashes of transactions containing an internal call touching the address.
    pub internal_transactions: Vec<B256>,
    /// Events emitted by the address.
    pub events: Vec<Event>,
}

impl AddressIndex {
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
            && self.internal_transactions.is_empty()
            && self.events.is_empty()
    }
}

/// A token movement derived from a Transfer log of a registered contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenTransfer {
    Erc20 {
        contract: Address,
        from: Address,
        to: Address,
        amount: U256,
    },
    Erc721 {
        contract: Address,
        from: Address,
        to: Address,
        token_id: U256,
    },
}

/// Whether a transaction directly touches `address` (sender, recipient, or
/// created contract).
pub fn transaction_touches(tx: &Transaction, address: Address) -> bool {
    tx.to == address || tx.from == address || tx.created_contract == address
}

/// Whether any internal call of the transaction touches `address`.
pub fn internal_calls_touch(tx: &Transaction, address: Address) -> bool {
    tx.internal_calls
        .iter()
        .any(|call| call.from == address || call.to == address)
}

/// Filter one block's transactions for a single address.
///
/// Transaction order within the block is preserved.
pub fn filter_block_for_address(transactions: &[Transaction], address: Address) -> AddressIndex {
    let mut index = AddressIndex::default();
    for tx in transactions {
        if transaction_touches(tx, address) {
            index.transactions.push(tx.hash);
        }
        if internal_calls_touch(tx, address) {
            index.internal_transactions.push(tx.hash);
        }
        for event in &tx.events {
            if event.address == address {
                index.events.push(event.clone());
            }
        }
    }
    index
}

/// Extract token movements emitted by `contract` across the block's
/// transactions.
///
/// Reverted transactions carry no logs, but the status flag is checked anyway
/// so a lenient upstream cannot smuggle transfers in.
pub fn token_transfers_for_contract(
    transactions: &[Transaction],
    contract: Address,
) -> Vec<TokenTransfer> {
    let mut transfers = Vec::new();
    for tx in transactions {
        if !tx.status {
            continue;
        }
        for event in &tx.events {
            if event.address != contract {
                continue;
            }
            if let Some(transfer) = parse_transfer_event(event) {
                transfers.push(transfer);
            }
        }
    }
    transfers
}

/// Parse a single log as a token transfer, if it is one.
///
/// ERC-20 `Transfer` has two indexed arguments (3 topics, amount in data);
/// ERC-721 indexes the token id as well (4 topics).
pub fn parse_transfer_event(event: &Event) -> Option<TokenTransfer> {
    if event.topics.first() != Some(&TRANSFER_TOPIC) {
        return None;
    }
    match event.topics.len() {
        3 => {
            let amount = if event.data.len() >= 32 {
                U256::from_be_slice(&event.data[0..32])
            } else {
                U256::ZERO
            };
            Some(TokenTransfer::Erc20 {
                contract: event.address,
                from: address_from_topic(event.topics[1]),
                to: address_from_topic(event.topics[2]),
                amount,
            })
        }
        4 => Some(TokenTransfer::Erc721 {
            contract: event.address,
            from: address_from_topic(event.topics[1]),
            to: address_from_topic(event.topics[2]),
            token_id: U256::from_be_bytes(event.topics[3].0),
        }),
        _ => None,
    }
}

/// An indexed address topic is the address left-padded to 32 bytes.
fn address_from_topic(topic: B256) -> Address {
    Address::from_slice(&topic.as_slice()[12..])
}
