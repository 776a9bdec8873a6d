use crate::error::{Result, UserOpError};
use crate::pipeline::RunOutcome;
use crate::types::{EntryPointVersion, Receipt, UserOperation};
use ethers::types::{Address, Bytes, H256, U256};
use serde_json::{json, Value};

pub fn fmt_address(addr: Address) -> String {
    format!("0x{}", hex::encode(addr.as_bytes()))
}

pub fn fmt_h256(h: H256) -> String {
    format!("0x{}", hex::encode(h.as_bytes()))
}

/// JSON-RPC "quantity" encoding.
pub fn fmt_u256(v: U256) -> String {
    if v.is_zero() {
        "0x0".to_string()
    } else {
        format!("0x{:x}", v)
    }
}

pub fn fmt_bytes(b: &Bytes) -> String {
    format!("0x{}", hex::encode(b.as_ref()))
}

/// The operation as the EntryPoint of `version` sees it: unpacked fields for v0.6,
/// `accountGasLimits` / `gasFees` slots for v0.7.
pub fn user_op_to_json(op: &UserOperation, version: EntryPointVersion) -> Result<Value> {
    Ok(match version {
        EntryPointVersion::V0_6 => json!({
            "sender": fmt_address(op.sender),
            "nonce": fmt_u256(op.nonce),
            "initCode": fmt_bytes(&op.init_code),
            "callData": fmt_bytes(&op.call_data),
            "callGasLimit": fmt_u256(op.call_gas_limit),
            "verificationGasLimit": fmt_u256(op.verification_gas_limit),
            "preVerificationGas": fmt_u256(op.pre_verification_gas),
            "maxFeePerGas": fmt_u256(op.max_fee_per_gas),
            "maxPriorityFeePerGas": fmt_u256(op.max_priority_fee_per_gas),
            "paymasterAndData": fmt_bytes(&op.paymaster_and_data),
            "signature": fmt_bytes(&op.signature),
        }),
        EntryPointVersion::V0_7 => json!({
            "sender": fmt_address(op.sender),
            "nonce": fmt_u256(op.nonce),
            "initCode": fmt_bytes(&op.init_code),
            "callData": fmt_bytes(&op.call_data),
            "accountGasLimits": format!("0x{}", hex::encode(op.account_gas_limits()?)),
            "preVerificationGas": fmt_u256(op.pre_verification_gas),
            "gasFees": format!("0x{}", hex::encode(op.gas_fees()?)),
            "paymasterAndData": fmt_bytes(&op.paymaster_and_data),
            "signature": fmt_bytes(&op.signature),
        }),
    })
}

pub fn receipt_to_json(receipt: &Receipt) -> Value {
    let ops: Vec<Value> = receipt
        .user_ops
        .iter()
        .map(|o| {
            json!({
                "userOpHash": fmt_h256(o.user_op_hash),
                "sender": fmt_address(o.sender),
                "nonce": fmt_u256(o.nonce),
                "success": o.success,
                "actualGasCost": fmt_u256(o.actual_gas_cost),
                "actualGasUsed": fmt_u256(o.actual_gas_used),
            })
        })
        .collect();
    json!({
        "txHash": fmt_h256(receipt.tx_hash),
        "blockNumber": receipt.block_number,
        "gasUsed": receipt.gas_used.map(fmt_u256),
        "userOps": ops,
    })
}

pub fn outcome_to_json(outcome: &RunOutcome, version: EntryPointVersion) -> Result<Value> {
    let op = user_op_to_json(outcome.operation(), version)?;
    let user_op_hash = fmt_h256(outcome.user_op_hash());
    Ok(match outcome {
        RunOutcome::DryRun { estimate, .. } => json!({
            "status": "dryRun",
            "userOpHash": user_op_hash,
            "userOp": op,
            "handleOpsGas": fmt_u256(estimate.handle_ops_gas),
            "requiredPrefund": fmt_u256(estimate.required_prefund),
            "senderBalance": fmt_u256(estimate.sender_balance),
        }),
        RunOutcome::Submitted { handle, .. } => json!({
            "status": "submitted",
            "userOpHash": user_op_hash,
            "txHash": fmt_h256(handle.tx_hash),
            "txNonce": fmt_u256(handle.sender_nonce),
            "gasPrice": fmt_u256(handle.gas_price),
            "userOp": op,
        }),
        RunOutcome::Confirmed { receipt, .. } => json!({
            "status": "confirmed",
            "userOpHash": user_op_hash,
            "txHash": fmt_h256(receipt.tx_hash),
            "receipt": receipt_to_json(receipt),
            "userOp": op,
        }),
    })
}

/// `{"error": <kind>, "reason": <best reason>}`
pub fn error_to_json(err: &UserOpError) -> Value {
    let mut v = json!({
        "error": err.kind().as_str(),
        "reason": err.reason(),
    });
    if let UserOpError::ExecutionReverted {
        tx_hash,
        revert: Some(info),
    } = err
    {
        v["revertData"] = json!(fmt_bytes(&info.raw_data));
        if let Some(h) = tx_hash {
            v["txHash"] = json!(fmt_h256(*h));
        }
    }
    v
}

/// Decimal, or hex with a `0x` prefix.
pub fn parse_u256(s: &str) -> anyhow::Result<U256> {
    let s = s.trim();
    match s.strip_prefix("0x") {
        Some("") => Ok(U256::zero()),
        Some(hex_digits) => Ok(U256::from_str_radix(hex_digits, 16)?),
        None => Ok(U256::from_dec_str(s)?),
    }
}

pub fn parse_h256(s: &str) -> anyhow::Result<H256> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(s)?;
    if bytes.len() != 32 {
        anyhow::bail!("expected 32-byte hex, got {} bytes", bytes.len());
    }
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    Ok(H256(arr))
}
