//! Raw event rows and bare ABI decoding.
//!
//! `RawEvent` is the materialized row shape the store hands to the stream;
//! `decode_events` turns raw log events into named-argument form using the
//! declaring source's ABI. Richer envelopes (full block/transaction objects,
//! typed handler payloads) belong to the downstream runtime.

use std::collections::HashMap;
use std::str::FromStr;

use alloy_dyn_abi::{DynSolType, DynSolValue, Specifier};
use alloy_json_abi::Event as AbiEvent;
use alloy_primitives::B256;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::SyncError;
use crate::source::Source;

// ─── Raw events ──────────────────────────────────────────────────────────────

/// The minimal payload needed to decode a log event later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogPayload {
    pub data: String,
    pub topic0: Option<String>,
    pub topic1: Option<String>,
    pub topic2: Option<String>,
    pub topic3: Option<String>,
}

impl LogPayload {
    pub fn topics(&self) -> Vec<&str> {
        [&self.topic0, &self.topic1, &self.topic2, &self.topic3]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .collect()
    }
}

/// A materialized event row, ordered globally by `checkpoint`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    pub filter_id: String,
    pub checkpoint: String,
    pub chain_id: u64,
    pub block_number: u64,
    pub block_hash: String,
    /// `None` for block events.
    pub log_index: Option<u64>,
    pub transaction_hash: Option<String>,
    /// Log payload; `None` for block events.
    pub data: Option<LogPayload>,
}

// ─── Decoded events ──────────────────────────────────────────────────────────

/// A decoded event delivered to the downstream layer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DecodedEvent {
    #[serde(rename_all = "camelCase")]
    Log {
        chain_id: u64,
        contract_name: String,
        event_name: String,
        checkpoint: String,
        block_number: u64,
        log_index: u64,
        transaction_hash: String,
        args: Value,
    },
    #[serde(rename_all = "camelCase")]
    Block {
        chain_id: u64,
        source_name: String,
        checkpoint: String,
        block_number: u64,
    },
}

/// Decode a batch of raw events against their declaring sources' ABIs.
///
/// Raw events whose filter id has no declaring source, or whose `topic0` has
/// no ABI item, are skipped with a warning; an ABI item that fails to decode
/// its payload is a data error.
pub fn decode_events(sources: &[Source], raws: &[RawEvent]) -> Result<Vec<DecodedEvent>, SyncError> {
    let by_filter: HashMap<String, &Source> =
        sources.iter().map(|s| (s.filter_id(), s)).collect();

    // Per-filter-id memo of event selector → ABI item, built once per call.
    let mut selector_cache: HashMap<String, HashMap<B256, &AbiEvent>> = HashMap::new();

    let mut out = Vec::with_capacity(raws.len());
    for raw in raws {
        let Some(source) = by_filter.get(&raw.filter_id) else {
            warn!(filter_id = %raw.filter_id, "event has no declaring source, skipping");
            continue;
        };

        let Some(payload) = &raw.data else {
            out.push(DecodedEvent::Block {
                chain_id: raw.chain_id,
                source_name: source.name.clone(),
                checkpoint: raw.checkpoint.clone(),
                block_number: raw.block_number,
            });
            continue;
        };

        let selectors = selector_cache
            .entry(raw.filter_id.clone())
            .or_insert_with(|| abi_events_by_selector(source));

        let Some(topic0) = payload.topic0.as_deref().and_then(parse_b256) else {
            warn!(checkpoint = %raw.checkpoint, "log event without topic0, skipping");
            continue;
        };
        let Some(event) = selectors.get(&topic0) else {
            warn!(
                checkpoint = %raw.checkpoint,
                topic0 = %payload.topic0.as_deref().unwrap_or_default(),
                "no ABI event for selector, skipping"
            );
            continue;
        };

        let args = decode_log_args(event, payload, &raw.checkpoint)?;
        out.push(DecodedEvent::Log {
            chain_id: raw.chain_id,
            contract_name: source.name.clone(),
            event_name: event.name.clone(),
            checkpoint: raw.checkpoint.clone(),
            block_number: raw.block_number,
            log_index: raw.log_index.unwrap_or(0),
            transaction_hash: raw.transaction_hash.clone().unwrap_or_default(),
            args,
        });
    }
    Ok(out)
}

fn abi_events_by_selector(source: &Source) -> HashMap<B256, &AbiEvent> {
    source
        .abi
        .iter()
        .flat_map(|abi| abi.events.values().flatten())
        .map(|event| (event.selector(), event))
        .collect()
}

fn parse_b256(s: &str) -> Option<B256> {
    B256::from_str(s).ok()
}

fn decode_log_args(
    event: &AbiEvent,
    payload: &LogPayload,
    checkpoint: &str,
) -> Result<Value, SyncError> {
    let decode_err = |reason: String| SyncError::Decode {
        checkpoint: checkpoint.to_string(),
        reason,
    };

    let topics: Vec<B256> = payload.topics().into_iter().filter_map(parse_b256).collect();
    let data = hex::decode(payload.data.trim_start_matches("0x"))
        .map_err(|e| decode_err(format!("invalid data hex: {e}")))?;

    // Indexed params live in the topics (after the selector for named
    // events); the rest are ABI-encoded as a tuple in the data.
    let mut next_topic = if event.anonymous { 0 } else { 1 };
    let mut body_types = Vec::new();
    for input in &event.inputs {
        if !input.indexed {
            body_types.push(input.resolve().map_err(|e| decode_err(e.to_string()))?);
        }
    }
    let mut body_values = if body_types.is_empty() {
        Vec::new()
    } else {
        match DynSolType::Tuple(body_types)
            .abi_decode(&data)
            .map_err(|e| decode_err(e.to_string()))?
        {
            DynSolValue::Tuple(values) => values,
            other => vec![other],
        }
    }
    .into_iter();

    let mut args = serde_json::Map::new();
    for (i, input) in event.inputs.iter().enumerate() {
        let value = if input.indexed {
            let topic = topics
                .get(next_topic)
                .ok_or_else(|| decode_err(format!("missing topic for parameter {}", input.name)))?;
            next_topic += 1;
            let ty = input.resolve().map_err(|e| decode_err(e.to_string()))?;
            decode_topic(&ty, topic).map_err(decode_err)?
        } else {
            body_values
                .next()
                .ok_or_else(|| decode_err(format!("missing value for parameter {}", input.name)))?
        };
        let name = if input.name.is_empty() {
            format!("arg{i}")
        } else {
            input.name.clone()
        };
        args.insert(name, normalize(value));
    }
    Ok(Value::Object(args))
}

/// Decode one indexed topic (always 32 bytes).
///
/// Reference types (string, bytes, arrays, tuples) are stored as the keccak
/// of their encoding; the original value is unrecoverable, so the raw hash
/// is returned as bytes.
fn decode_topic(ty: &DynSolType, topic: &B256) -> Result<DynSolValue, String> {
    match ty {
        DynSolType::String
        | DynSolType::Bytes
        | DynSolType::Array(_)
        | DynSolType::FixedArray(..)
        | DynSolType::Tuple(_) => Ok(DynSolValue::Bytes(topic.to_vec())),
        _ => ty.abi_decode(topic.as_slice()).map_err(|e| e.to_string()),
    }
}

/// Convert a decoded ABI value into plain JSON: numbers as decimal strings,
/// byte values as lowercase `0x` hex.
fn normalize(value: DynSolValue) -> Value {
    match value {
        DynSolValue::Bool(b) => Value::Bool(b),
        DynSolValue::Int(i, _) => Value::String(i.to_string()),
        DynSolValue::Uint(u, _) => Value::String(u.to_string()),
        DynSolValue::Address(a) => Value::String(format!("0x{}", hex::encode(a))),
        DynSolValue::FixedBytes(word, size) => {
            Value::String(format!("0x{}", hex::encode(&word[..size])))
        }
        DynSolValue::Bytes(bytes) => Value::String(format!("0x{}", hex::encode(bytes))),
        DynSolValue::String(s) => Value::String(s),
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) => {
            Value::Array(items.into_iter().map(normalize).collect())
        }
        DynSolValue::Tuple(items) => Value::Array(items.into_iter().map(normalize).collect()),
        other => {
            warn!(?other, "unsupported ABI value, encoding as null");
            Value::Null
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{AddressCriteria, Filter, LogFilter, TopicCriteria};

    const TRANSFER_SELECTOR: &str =
        "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

    fn erc20_source() -> Source {
        let abi: alloy_json_abi::JsonAbi = serde_json::from_str(
            r#"[{
                "type": "event",
                "name": "Transfer",
                "anonymous": false,
                "inputs": [
                    {"name": "from", "type": "address", "indexed": true},
                    {"name": "to", "type": "address", "indexed": true},
                    {"name": "value", "type": "uint256", "indexed": false}
                ]
            }]"#,
        )
        .unwrap();
        Source {
            name: "ERC20".into(),
            network_name: "mainnet".into(),
            filter: Filter::Log(LogFilter {
                chain_id: 1,
                from_block: 0,
                to_block: None,
                address: AddressCriteria::Single("0xaaaa".into()),
                topics: [
                    TopicCriteria::Exact(TRANSFER_SELECTOR.into()),
                    TopicCriteria::Any,
                    TopicCriteria::Any,
                    TopicCriteria::Any,
                ],
            }),
            abi: Some(abi),
        }
    }

    fn topic_address(addr: &str) -> String {
        format!("0x000000000000000000000000{}", addr.trim_start_matches("0x"))
    }

    fn transfer_raw(source: &Source) -> RawEvent {
        RawEvent {
            filter_id: source.filter_id(),
            checkpoint: "0".repeat(75),
            chain_id: 1,
            block_number: 3,
            block_hash: "0xabc".into(),
            log_index: Some(0),
            transaction_hash: Some("0x111".into()),
            data: Some(LogPayload {
                // value = 1000
                data: format!("0x{:064x}", 1000),
                topic0: Some(TRANSFER_SELECTOR.into()),
                topic1: Some(topic_address("1111111111111111111111111111111111111111")),
                topic2: Some(topic_address("2222222222222222222222222222222222222222")),
                topic3: None,
            }),
        }
    }

    #[test]
    fn decodes_transfer_args() {
        let source = erc20_source();
        let events = decode_events(&[source.clone()], &[transfer_raw(&source)]).unwrap();
        assert_eq!(events.len(), 1);
        let DecodedEvent::Log { event_name, args, contract_name, .. } = &events[0] else {
            panic!("expected log event");
        };
        assert_eq!(event_name, "Transfer");
        assert_eq!(contract_name, "ERC20");
        assert_eq!(args["from"], "0x1111111111111111111111111111111111111111");
        assert_eq!(args["to"], "0x2222222222222222222222222222222222222222");
        assert_eq!(args["value"], "1000");
    }

    #[test]
    fn block_event_passes_through() {
        let mut source = erc20_source();
        source.abi = None;
        let raw = RawEvent {
            data: None,
            log_index: None,
            transaction_hash: None,
            ..transfer_raw(&source)
        };
        let events = decode_events(&[source], &[raw]).unwrap();
        let DecodedEvent::Block { block_number, .. } = &events[0] else {
            panic!("expected block event");
        };
        assert_eq!(*block_number, 3);
    }

    #[test]
    fn unknown_selector_skipped() {
        let source = erc20_source();
        let mut raw = transfer_raw(&source);
        raw.data.as_mut().unwrap().topic0 = Some(format!("0x{}", "ee".repeat(32)));
        let events = decode_events(&[source], &[raw]).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn unknown_filter_id_skipped() {
        let source = erc20_source();
        let mut raw = transfer_raw(&source);
        raw.filter_id = "event{}".into();
        let events = decode_events(&[source], &[raw]).unwrap();
        assert!(events.is_empty());
    }
}
