use crate::builder::SignedUserOperation;
use crate::contracts::{CallError, ChainApi, EntryPointApi};
use crate::error::{Result, UserOpError};
use crate::revert::decode_revert;
use crate::types::GasEstimate;
use ethers::types::{Address, U256};
use std::sync::Arc;

/// Simulates `handleOps` for a signed operation before anything is broadcast.
#[derive(Clone)]
pub struct PreflightEstimator {
    entry_point: Arc<dyn EntryPointApi>,
    chain: Arc<dyn ChainApi>,
    min_balance: U256,
}

impl PreflightEstimator {
    pub fn new(entry_point: Arc<dyn EntryPointApi>, chain: Arc<dyn ChainApi>) -> Self {
        Self {
            entry_point,
            chain,
            min_balance: U256::zero(),
        }
    }

    /// Floor on the sender balance regardless of the computed prefund.
    pub fn with_min_balance(mut self, min_balance: U256) -> Self {
        self.min_balance = min_balance;
        self
    }

    /// Balance check, then a `handleOps` gas estimate. Either failure aborts the run
    /// before any transaction is sent.
    pub async fn estimate(&self, signed: &SignedUserOperation, beneficiary: Address) -> Result<GasEstimate> {
        let op = signed.operation();
        let required_prefund = op.required_prefund(self.entry_point.version());

        let sender_balance = self
            .chain
            .balance(op.sender)
            .await
            .map_err(|e| UserOpError::Rpc(format!("eth_getBalance failed: {e}")))?;

        if op.has_paymaster() {
            tracing::debug!(sender = %op.sender, "paymaster set; skipping sender balance check");
        } else {
            let required = required_prefund.max(self.min_balance);
            if sender_balance < required {
                tracing::warn!(
                    sender = %op.sender,
                    balance = %sender_balance,
                    required = %required,
                    "sender cannot cover prefund"
                );
                return Err(UserOpError::InsufficientFunds {
                    balance: sender_balance,
                    required,
                });
            }
        }

        let handle_ops_gas = self
            .entry_point
            .estimate_handle_ops(std::slice::from_ref(op), beneficiary)
            .await
            .map_err(|e| match e {
                CallError::Reverted(data) => {
                    let revert = decode_revert(&data);
                    tracing::warn!(reason = %revert, "handleOps simulation reverted");
                    UserOpError::ExecutionReverted {
                        tx_hash: None,
                        revert: Some(revert),
                    }
                }
                other => UserOpError::Rpc(format!("handleOps estimate failed: {other}")),
            })?;

        tracing::info!(
            user_op_hash = %format!("{:#x}", signed.user_op_hash()),
            gas = %handle_ops_gas,
            prefund = %required_prefund,
            balance = %sender_balance,
            "preflight ok"
        );

        Ok(GasEstimate {
            handle_ops_gas,
            required_prefund,
            sender_balance,
        })
    }
}
