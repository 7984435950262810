//! Wire record shapes and hex quantity parsing.

use super::RpcError;
use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One event log emitted by the watched contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub address: Address,
    pub block_number: u64,
    pub tx_hash: B256,
    pub topics: Vec<B256>,
}

/// Transaction detail for one involved transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRecord {
    pub hash: B256,
    pub block_number: u64,
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptRecord {
    pub tx_hash: B256,
    pub block_number: u64,
    pub success: bool,
    pub gas_used: u64,
}

pub fn quantity(value: u64) -> String {
    format!("0x{value:x}")
}

fn malformed(method: &str, reason: impl Into<String>) -> RpcError {
    RpcError::MalformedResponse {
        method: method.to_string(),
        reason: reason.into(),
    }
}

/// Parse a `0x`-prefixed hex quantity into a u64.
pub fn parse_quantity(value: &Value, method: &str) -> Result<u64, RpcError> {
    let raw = value
        .as_str()
        .ok_or_else(|| malformed(method, format!("expected hex string, got {value}")))?;
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    u64::from_str_radix(digits, 16)
        .map_err(|err| malformed(method, format!("bad hex quantity {raw}: {err}")))
}

pub fn parse_u256(value: &Value, method: &str) -> Result<U256, RpcError> {
    let raw = value
        .as_str()
        .ok_or_else(|| malformed(method, format!("expected hex string, got {value}")))?;
    raw.parse::<U256>()
        .map_err(|err| malformed(method, format!("bad u256 {raw}: {err}")))
}

pub fn parse_address(value: &Value, method: &str) -> Result<Address, RpcError> {
    let raw = value
        .as_str()
        .ok_or_else(|| malformed(method, format!("expected address string, got {value}")))?;
    raw.parse::<Address>()
        .map_err(|err| malformed(method, format!("bad address {raw}: {err}")))
}

pub fn parse_b256(value: &Value, method: &str) -> Result<B256, RpcError> {
    let raw = value
        .as_str()
        .ok_or_else(|| malformed(method, format!("expected hash string, got {value}")))?;
    raw.parse::<B256>()
        .map_err(|err| malformed(method, format!("bad hash {raw}: {err}")))
}

pub fn parse_log(value: &Value, method: &str) -> Result<LogRecord, RpcError> {
    let field = |name: &str| {
        value
            .get(name)
            .ok_or_else(|| malformed(method, format!("log missing {name}")))
    };
    let topics = match value.get("topics") {
        Some(Value::Array(raw)) => raw
            .iter()
            .map(|topic| parse_b256(topic, method))
            .collect::<Result<Vec<_>, _>>()?,
        _ => Vec::new(),
    };
    Ok(LogRecord {
        address: parse_address(field("address")?, method)?,
        block_number: parse_quantity(field("blockNumber")?, method)?,
        tx_hash: parse_b256(field("transactionHash")?, method)?,
        topics,
    })
}

pub fn parse_transaction(value: &Value, method: &str) -> Result<TxRecord, RpcError> {
    let field = |name: &str| {
        value
            .get(name)
            .ok_or_else(|| malformed(method, format!("transaction missing {name}")))
    };
    let to = match value.get("to") {
        None | Some(Value::Null) => None,
        Some(raw) => Some(parse_address(raw, method)?),
    };
    Ok(TxRecord {
        hash: parse_b256(field("hash")?, method)?,
        block_number: parse_quantity(field("blockNumber")?, method)?,
        from: parse_address(field("from")?, method)?,
        to,
        value: parse_u256(field("value")?, method)?,
    })
}

pub fn parse_receipt(value: &Value, method: &str) -> Result<ReceiptRecord, RpcError> {
    let field = |name: &str| {
        value
            .get(name)
            .ok_or_else(|| malformed(method, format!("receipt missing {name}")))
    };
    Ok(ReceiptRecord {
        tx_hash: parse_b256(field("transactionHash")?, method)?,
        block_number: parse_quantity(field("blockNumber")?, method)?,
        success: parse_quantity(field("status")?, method)? == 1,
        gas_used: parse_quantity(field("gasUsed")?, method)?,
    })
}
