//! Best-effort decoding of revert payloads returned by `eth_call` / `eth_estimateGas`
//! and by the EntryPoint's `UserOperationRevertReason` event.
//!
//! Decoding never fails: anything that cannot be interpreted degrades to
//! [`DecodedRevert::RawSelector`] or [`DecodedRevert::Undecodable`] with the raw bytes kept.

use crate::bindings::v07::{FailedOp, FailedOpWithRevert};
use crate::bindings::{PanicCode, RevertString};
use ethers::abi::AbiDecode;
use ethers::contract::EthError;
use ethers::types::{Bytes, U256};
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodedRevert {
    /// `revert("...")` / `require(cond, "...")`
    Reason(String),
    Panic(U256),
    /// EntryPoint validation failure (`FailedOp` / `FailedOpWithRevert`).
    FailedOp {
        op_index: U256,
        reason: String,
        inner: Option<String>,
    },
    /// Unknown custom error; only the selector is meaningful.
    RawSelector([u8; 4]),
    Undecodable,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RevertInfo {
    pub decoded: DecodedRevert,
    pub raw_data: Bytes,
}

impl RevertInfo {
    pub fn selector(&self) -> Option<[u8; 4]> {
        selector_of(&self.raw_data)
    }

    /// Human-readable reason if one could be decoded.
    pub fn reason(&self) -> Option<String> {
        match &self.decoded {
            DecodedRevert::Reason(s) => Some(s.clone()),
            DecodedRevert::FailedOp { reason, inner, .. } => Some(match inner {
                Some(inner) => format!("{reason} ({inner})"),
                None => reason.clone(),
            }),
            DecodedRevert::Panic(code) => Some(format!("panic code {code:#x}")),
            DecodedRevert::RawSelector(_) | DecodedRevert::Undecodable => None,
        }
    }
}

impl fmt::Display for RevertInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(reason) = self.reason() {
            return f.write_str(&reason);
        }
        match &self.decoded {
            DecodedRevert::RawSelector(sel) => write!(f, "custom error 0x{}", hex::encode(sel)),
            _ if self.raw_data.is_empty() => f.write_str("no revert data"),
            _ => write!(f, "undecodable revert data 0x{}", hex::encode(&self.raw_data)),
        }
    }
}

fn selector_of(data: &[u8]) -> Option<[u8; 4]> {
    if data.len() < 4 {
        return None;
    }
    let mut sel = [0u8; 4];
    sel.copy_from_slice(&data[..4]);
    Some(sel)
}

pub fn decode_revert(data: &[u8]) -> RevertInfo {
    let raw_data = Bytes::from(data.to_vec());
    let Some(selector) = selector_of(data) else {
        return RevertInfo {
            decoded: DecodedRevert::Undecodable,
            raw_data,
        };
    };
    let body = &data[4..];

    let decoded = if selector == RevertString::selector() {
        match RevertString::decode(data) {
            Ok(err) => DecodedRevert::Reason(err.reason),
            Err(_) => match lossy_error_string(body) {
                Some(reason) => DecodedRevert::Reason(reason),
                None => DecodedRevert::RawSelector(selector),
            },
        }
    } else if let Ok(panic) = PanicCode::decode(data) {
        DecodedRevert::Panic(panic.code)
    } else if let Ok(failed) = FailedOp::decode(data) {
        DecodedRevert::FailedOp {
            op_index: failed.op_index,
            reason: failed.reason,
            inner: None,
        }
    } else if let Ok(failed) = FailedOpWithRevert::decode(data) {
        DecodedRevert::FailedOp {
            op_index: failed.op_index,
            reason: failed.reason,
            inner: Some(decode_revert(&failed.inner).to_string()),
        }
    } else {
        DecodedRevert::RawSelector(selector)
    };

    if let DecodedRevert::RawSelector(sel) = &decoded {
        tracing::debug!(selector = %hex::encode(sel), len = data.len(), "revert payload not decoded");
    }

    RevertInfo { decoded, raw_data }
}

/// Some nodes truncate or mangle the padding of `Error(string)`; read the bytes
/// after the offset and length words.
fn lossy_error_string(body: &[u8]) -> Option<String> {
    if body.len() <= 64 {
        return None;
    }
    let tail = &body[64..];
    let end = tail.iter().rposition(|b| *b != 0).map(|i| i + 1).unwrap_or(0);
    if end == 0 {
        return None;
    }
    tracing::warn!("Error(string) payload is not valid ABI; using lossy utf8 tail");
    Some(String::from_utf8_lossy(&tail[..end]).into_owned())
}
