//! `handleOps` broadcast and receipt tracking.

use crate::bindings::v07::{UserOperationEventFilter, UserOperationRevertReasonFilter};
use crate::builder::SignedUserOperation;
use crate::contracts::{CallError, ChainApi, EntryPointApi, TxOverrides};
use crate::error::{Result, UserOpError};
use crate::revert::{decode_revert, RevertInfo};
use crate::types::{Receipt, TransactionHandle, UserOpOutcome, UserOperation};
use ethers::contract::{parse_log, EthEvent};
use ethers::types::{Address, TransactionReceipt, H256, U256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Smallest gas price increase a node accepts for a same-nonce replacement.
pub const MIN_REPLACEMENT_BUMP_BPS: u64 = 1_000;

/// Gas price for a transaction that replaces one sent at `previous`: raised by
/// `bump_bps`, never by less than the replacement minimum, and always by at least 1 wei.
pub fn replacement_gas_price(previous: U256, bump_bps: u64) -> U256 {
    let bps = bump_bps.max(MIN_REPLACEMENT_BUMP_BPS);
    let bumped = previous.saturating_mul(U256::from(10_000 + bps)) / U256::from(10_000u64);
    bumped.max(previous.saturating_add(U256::one()))
}

#[derive(Clone)]
pub struct Submitter {
    entry_point: Arc<dyn EntryPointApi>,
    chain: Arc<dyn ChainApi>,
    poll_interval: Duration,
    confirmations: u64,
}

impl Submitter {
    pub fn new(entry_point: Arc<dyn EntryPointApi>, chain: Arc<dyn ChainApi>) -> Self {
        Self {
            entry_point,
            chain,
            poll_interval: Duration::from_secs(2),
            confirmations: 1,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Blocks the receipt must be buried under before it counts; 1 = included.
    pub fn with_confirmations(mut self, confirmations: u64) -> Self {
        self.confirmations = confirmations.max(1);
        self
    }

    /// Broadcasts one `handleOps` transaction carrying `ops`. Does not wait for it.
    /// With `overrides.replace` set the broadcast reuses that outer nonce.
    pub async fn submit(
        &self,
        ops: &[SignedUserOperation],
        beneficiary: Address,
        overrides: TxOverrides,
    ) -> Result<TransactionHandle> {
        if ops.is_empty() {
            return Err(UserOpError::EmptyBatch);
        }
        let wire: Vec<UserOperation> = ops.iter().map(|s| s.operation().clone()).collect();

        let sent = self
            .entry_point
            .handle_ops(&wire, beneficiary, overrides)
            .await
            .map_err(|e| match e {
                CallError::Reverted(data) => UserOpError::ExecutionReverted {
                    tx_hash: None,
                    revert: Some(decode_revert(&data)),
                },
                other => UserOpError::SubmissionRejected(other.to_string()),
            })?;

        let user_op_hashes = ops.iter().map(|s| s.user_op_hash()).collect();
        tracing::info!(
            tx_hash = %format!("{:#x}", sent.tx_hash),
            nonce = %sent.nonce,
            gas_price = %sent.gas_price,
            replacement = overrides.replace.is_some(),
            ops = ops.len(),
            "handleOps sent"
        );
        Ok(TransactionHandle {
            tx_hash: sent.tx_hash,
            sender_nonce: sent.nonce,
            gas_price: sent.gas_price,
            user_op_hashes,
        })
    }

    /// Single receipt lookup; `Ok(None)` means not (yet) included.
    pub async fn lookup(&self, handle: &TransactionHandle) -> Result<Option<Receipt>> {
        let receipt = self
            .chain
            .transaction_receipt(handle.tx_hash)
            .await
            .map_err(|e| UserOpError::Rpc(format!("eth_getTransactionReceipt failed: {e}")))?;
        match receipt {
            Some(r) => self.interpret(handle, &r).map(Some),
            None => Ok(None),
        }
    }

    /// Polls until the transaction is included with the configured depth.
    /// `timeout` of zero waits indefinitely; cancelling `cancel` stops the wait
    /// without touching the transaction.
    pub async fn await_confirmation(
        &self,
        handle: &TransactionHandle,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Receipt> {
        let start = Instant::now();
        let tx_hash = handle.tx_hash;

        let poll = async {
            loop {
                match self.chain.transaction_receipt(tx_hash).await {
                    Ok(Some(receipt)) => {
                        if self.deep_enough(&receipt).await {
                            return self.interpret(handle, &receipt);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(tx_hash = %format!("{tx_hash:#x}"), error = %e, "receipt poll failed; retrying");
                    }
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };

        let waited = async {
            if timeout.is_zero() {
                Ok(poll.await)
            } else {
                tokio::time::timeout(timeout, poll).await
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(tx_hash = %format!("{tx_hash:#x}"), "confirmation wait cancelled");
                Err(UserOpError::ConfirmationCancelled { tx_hash })
            }
            res = waited => match res {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(tx_hash = %format!("{tx_hash:#x}"), timeout = ?timeout, "receipt not seen in time");
                    Err(UserOpError::ConfirmationTimeout { tx_hash, waited: start.elapsed() })
                }
            },
        }
    }

    async fn deep_enough(&self, receipt: &TransactionReceipt) -> bool {
        let Some(mined_at) = receipt.block_number else {
            return false;
        };
        if self.confirmations <= 1 {
            return true;
        }
        match self.chain.block_number().await {
            Ok(head) => head + 1 >= mined_at.as_u64() + self.confirmations,
            Err(e) => {
                tracing::warn!(error = %e, "eth_blockNumber failed");
                false
            }
        }
    }

    /// A receipt is only success when the transaction succeeded and every
    /// operation of ours that the EntryPoint reported on succeeded too.
    fn interpret(&self, handle: &TransactionHandle, receipt: &TransactionReceipt) -> Result<Receipt> {
        let tx_hash = handle.tx_hash;
        if receipt.status.map(|s| s.as_u64()) == Some(0) {
            return Err(UserOpError::ExecutionReverted {
                tx_hash: Some(tx_hash),
                revert: None,
            });
        }

        let user_ops: Vec<UserOpOutcome> = parse_user_op_events(self.entry_point.address(), receipt)
            .into_iter()
            .filter(|o| handle.user_op_hashes.contains(&o.user_op_hash))
            .collect();

        for hash in &handle.user_op_hashes {
            if !user_ops.iter().any(|o| &o.user_op_hash == hash) {
                tracing::warn!(user_op_hash = %format!("{hash:#x}"), "no UserOperationEvent in receipt");
            }
        }

        if let Some(failed) = user_ops.iter().find(|o| !o.success) {
            tracing::warn!(
                user_op_hash = %format!("{:#x}", failed.user_op_hash),
                reason = %failed.revert.as_ref().map(|r| r.to_string()).unwrap_or_default(),
                "user operation reverted inside handleOps"
            );
            return Err(UserOpError::ExecutionReverted {
                tx_hash: Some(tx_hash),
                revert: failed.revert.clone(),
            });
        }

        let block_number = receipt.block_number.map(|n| n.as_u64()).unwrap_or_default();
        tracing::info!(
            tx_hash = %format!("{tx_hash:#x}"),
            block = block_number,
            gas_used = ?receipt.gas_used,
            "handleOps confirmed"
        );
        Ok(Receipt {
            tx_hash,
            block_number,
            gas_used: receipt.gas_used,
            user_ops,
        })
    }
}

/// `UserOperationEvent`s emitted by `entry_point`, with revert reasons attached
/// from the matching `UserOperationRevertReason` events.
pub fn parse_user_op_events(entry_point: Address, receipt: &TransactionReceipt) -> Vec<UserOpOutcome> {
    let op_topic = UserOperationEventFilter::signature();
    let reason_topic = UserOperationRevertReasonFilter::signature();

    let mut outcomes = Vec::new();
    let mut reasons: HashMap<H256, RevertInfo> = HashMap::new();

    for log in receipt.logs.iter().filter(|l| l.address == entry_point) {
        let Some(topic0) = log.topics.first() else { continue };

        if *topic0 == op_topic {
            match parse_log::<UserOperationEventFilter>(log.clone()) {
                Ok(event) => outcomes.push(UserOpOutcome {
                    user_op_hash: H256::from(event.user_op_hash),
                    sender: event.sender,
                    nonce: event.nonce,
                    success: event.success,
                    actual_gas_cost: event.actual_gas_cost,
                    actual_gas_used: event.actual_gas_used,
                    revert: None,
                }),
                Err(e) => tracing::warn!(error = %e, "malformed UserOperationEvent"),
            }
        } else if *topic0 == reason_topic {
            if let Ok(event) = parse_log::<UserOperationRevertReasonFilter>(log.clone()) {
                reasons.insert(H256::from(event.user_op_hash), decode_revert(&event.revert_reason));
            }
        }
    }

    for outcome in &mut outcomes {
        outcome.revert = reasons.remove(&outcome.user_op_hash);
    }
    outcomes
}
