//! Transaction enrichment
//!
//! Assembles a complete [`Transaction`] record for a hash: one GraphQL query
//! for the transaction, its receipt fields, and its logs, then a
//! `callTracer` trace for the internal calls. Hex is decoded strictly; any
//! malformed quantity aborts the enrichment so the enclosing block is
//! retried rather than persisted half-decoded.

use crate::rpc::{CallFrame, ChainClient, TransactionDetail};
use crate::types::{self, Event, InternalCall, Transaction};
use alloy_primitives::B256;
use anyhow::{Context, Result};
use std::sync::Arc;

/// Builds full transaction records from upstream data. Stateless with
/// respect to the database.
pub struct TransactionEnricher {
    client: Arc<dyn ChainClient>,
}

impl TransactionEnricher {
    pub fn new(client: Arc<dyn ChainClient>) -> Self {
        Self { client }
    }

    pub async fn enrich(&self, hash: B256) -> Result<Transaction> {
        let detail = self
            .client
            .transaction_detail(hash)
            .await
            .with_context(|| format!("failed to fetch detail for 0x{:x}", hash))?;
        let mut tx = assemble_transaction(&detail)
            .with_context(|| format!("failed to decode detail for 0x{:x}", hash))?;

        let trace = self
            .client
            .trace_transaction(hash)
            .await
            .with_context(|| format!("failed to trace 0x{:x}", hash))?;
        tx.internal_calls = top_level_calls(&trace)
            .with_context(|| format!("failed to decode trace for 0x{:x}", hash))?;
        Ok(tx)
    }
}

/// Decode the GraphQL payload into a transaction record (without internal
/// calls).
pub fn assemble_transaction(detail: &TransactionDetail) -> Result<Transaction> {
    let hash = types::decode_hex_b256(&detail.hash).context("bad transaction hash")?;
    let block_number =
        types::decode_hex_u64(&detail.block.number).context("bad enclosing block number")?;

    let mut events = Vec::with_capacity(detail.logs.len());
    for log in &detail.logs {
        let mut topics = Vec::with_capacity(log.topics.len());
        for topic in &log.topics {
            topics.push(types::decode_hex_b256(topic).context("bad log topic")?);
        }
        events.push(Event {
            block_number,
            transaction_hash: hash,
            index: log.index,
            address: types::decode_hex_address(&log.account.address).context("bad log address")?,
            topics,
            data: types::decode_hex(&log.data).context("bad log data")?,
        });
    }

    Ok(Transaction {
        hash,
        block_number,
        index: detail.index,
        from: types::decode_hex_address(&detail.from.address).context("bad sender")?,
        // Contract creations have no recipient; the zero address stands in
        to: types::decode_hex_address(
            detail.to.as_ref().map(|a| a.address.as_str()).unwrap_or(""),
        )
        .context("bad recipient")?,
        value: types::decode_hex_u64(&detail.value).context("bad value")?,
        gas: types::decode_hex_u64(&detail.gas).context("bad gas")?,
        gas_used: types::decode_hex_u64(&detail.gas_used).context("bad gasUsed")?,
        cumulative_gas_used: types::decode_hex_u64(&detail.cumulative_gas_used)
            .context("bad cumulativeGasUsed")?,
        nonce: types::decode_hex_u64(&detail.nonce).context("bad nonce")?,
        status: detail.status == "0x1",
        created_contract: types::decode_hex_address(
            detail
                .created_contract
                .as_ref()
                .map(|a| a.address.as_str())
                .unwrap_or(""),
        )
        .context("bad created contract")?,
        data: types::decode_hex(&detail.input_data).context("bad input data")?,
        private_data: types::decode_hex(detail.private_input_data.as_deref().unwrap_or(""))
            .context("bad private input data")?,
        is_private: detail.is_private.unwrap_or(false),
        events,
        internal_calls: Vec::new(),
    })
}

/// Decode the top-level calls of a trace. Nested sub-calls are not indexed.
pub fn top_level_calls(frame: &CallFrame) -> Result<Vec<InternalCall>> {
    let calls = match &frame.calls {
        Some(calls) => calls,
        None => return Ok(Vec::new()),
    };
    let mut decoded = Vec::with_capacity(calls.len());
    for call in calls {
        decoded.push(InternalCall {
            from: types::decode_hex_address(call.from.as_deref().unwrap_or(""))
                .context("bad call sender")?,
            to: types::decode_hex_address(call.to.as_deref().unwrap_or(""))
                .context("bad call recipient")?,
            call_type: call.call_type.clone().unwrap_or_default(),
            gas: decode_optional_u64(call.gas.as_deref()).context("bad call gas")?,
            gas_used: decode_optional_u64(call.gas_used.as_deref()).context("bad call gasUsed")?,
            // Delegate and static calls report no value
            value: decode_optional_u64(call.value.as_deref()).context("bad call value")?,
            input: types::decode_hex(call.input.as_deref().unwrap_or(""))
                .context("bad call input")?,
            output: types::decode_hex(call.output.as_deref().unwrap_or(""))
                .context("bad call output")?,
        });
    }
    Ok(decoded)
}

fn decode_optional_u64(value: Option<&str>) -> Result<u64> {
    match value {
        None | Some("") | Some("0x") => Ok(0),
        Some(s) => types::decode_hex_u64(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{AccountRef, BlockRef, LogEntry};
    use alloy_primitives::{address, Address};

    fn detail() -> TransactionDetail {
        TransactionDetail {
            hash: format!("0x{}", "01".repeat(32)),
            status: "0x1".into(),
            index: 2,
            nonce: "0x5".into(),
            from: AccountRef {
                address: "0x0000000000000000000000000000000000000009".into(),
            },
            to: Some(AccountRef {
                address: "0x0000000000000000000000000000000000000001".into(),
            }),
            value: "0x29a".into(),
            gas: "0x5208".into(),
            gas_used: "0x5208".into(),
            cumulative_gas_used: "0xa410".into(),
            created_contract: None,
            input_data: "0xdeadbeef".into(),
            private_input_data: None,
            is_private: None,
            block: BlockRef {
                number: "0x7".into(),
            },
            logs: vec![LogEntry {
                index: 3,
                account: AccountRef {
                    address: "0x0000000000000000000000000000000000000001".into(),
                },
                topics: vec![format!("0x{}", "aa".repeat(32))],
                data: "0x00".into(),
            }],
        }
    }

    #[test]
    fn test_assemble_transaction() {
        let tx = assemble_transaction(&detail()).unwrap();
        assert_eq!(tx.hash, B256::repeat_byte(1));
        assert_eq!(tx.block_number, 7);
        assert_eq!(tx.index, 2);
        assert_eq!(tx.value, 666);
        assert!(tx.status);
        assert_eq!(tx.to, address!("0000000000000000000000000000000000000001"));
        assert_eq!(tx.created_contract, Address::ZERO);
        assert_eq!(tx.data, vec![0xde, 0xad, 0xbe, 0xef]);

        assert_eq!(tx.events.len(), 1);
        assert_eq!(tx.events[0].block_number, 7);
        assert_eq!(tx.events[0].transaction_hash, tx.hash);
        assert_eq!(tx.events[0].index, 3);
    }

    #[test]
    fn test_contract_creation_has_zero_recipient() {
        let mut d = detail();
        d.to = None;
        d.created_contract = Some(AccountRef {
            address: "0x0000000000000000000000000000000000000042".into(),
        });
        let tx = assemble_transaction(&d).unwrap();
        assert_eq!(tx.to, Address::ZERO);
        assert_eq!(
            tx.created_contract,
            address!("0000000000000000000000000000000000000042")
        );
    }

    #[test]
    fn test_malformed_hex_aborts_enrichment() {
        let mut d = detail();
        d.value = "0xzz".into();
        assert!(assemble_transaction(&d).is_err());

        let mut d = detail();
        d.logs[0].topics[0] = "0x1234".into(); // not 32 bytes
        assert!(assemble_transaction(&d).is_err());
    }

    #[test]
    fn test_top_level_calls_only() {
        let nested = CallFrame {
            call_type: Some("CALL".into()),
            from: Some("0x0000000000000000000000000000000000000001".into()),
            to: Some("0x0000000000000000000000000000000000000002".into()),
            value: Some("0x1".into()),
            ..Default::default()
        };
        let child = CallFrame {
            call_type: Some("DELEGATECALL".into()),
            from: Some("0x0000000000000000000000000000000000000009".into()),
            to: Some("0x0000000000000000000000000000000000000001".into()),
            gas: Some("0x100".into()),
            gas_used: Some("0x80".into()),
            value: None, // delegate calls carry no value
            input: Some("0xabcd".into()),
            calls: Some(vec![nested]),
            ..Default::default()
        };
        let root = CallFrame {
            call_type: Some("CALL".into()),
            calls: Some(vec![child]),
            ..Default::default()
        };

        let calls = top_level_calls(&root).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].call_type, "DELEGATECALL");
        assert_eq!(calls[0].value, 0);
        assert_eq!(calls[0].gas, 0x100);
        assert_eq!(calls[0].input, vec![0xab, 0xcd]);
    }

    #[test]
    fn test_trace_without_calls() {
        let root = CallFrame::default();
        assert!(top_level_calls(&root).unwrap().is_empty());
    }
}
