use crate::revert::RevertInfo;
use ethers::types::{Address, H256, U256};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Failure taxonomy for one UserOperation pipeline run.
///
/// Every variant maps to a stable [`ErrorKind`] so callers (and the CLI's `--json`
/// output) can branch on the kind without parsing messages.
#[derive(Debug, Error)]
pub enum UserOpError {
    /// A gas quantity does not fit into its 128-bit half of a packed slot.
    #[error("{field} value {value} does not fit in 128 bits")]
    ValueOverflow { field: &'static str, value: U256 },

    #[error("nonce unavailable for {sender:#x}: {reason}")]
    NonceUnavailable { sender: Address, reason: String },

    #[error("an operation for {sender:#x} (key {key}) is still pending confirmation")]
    NoncePending { sender: Address, key: U256 },

    #[error("userOpHash mismatch: local {local:#x}, entryPoint {authoritative:#x} (tuple schema does not match the deployed EntryPoint)")]
    HashMismatch { local: H256, authoritative: H256 },

    #[error("signature rejected by account: {0}")]
    SignatureFormatInvalid(String),

    #[error("signer {signer:#x} is not the account owner {owner:#x}")]
    OwnerMismatch { owner: Address, signer: Address },

    #[error("insufficient funds: balance {balance} < required {required}")]
    InsufficientFunds { balance: U256, required: U256 },

    #[error("execution reverted{}", fmt_revert(.revert))]
    ExecutionReverted {
        tx_hash: Option<H256>,
        revert: Option<RevertInfo>,
    },

    #[error("handleOps needs at least one operation")]
    EmptyBatch,

    #[error("submission rejected: {0}")]
    SubmissionRejected(String),

    #[error("transaction {tx_hash:#x} not confirmed after {waited:?}")]
    ConfirmationTimeout { tx_hash: H256, waited: Duration },

    #[error("confirmation wait for {tx_hash:#x} cancelled")]
    ConfirmationCancelled { tx_hash: H256 },

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("rpc error: {0}")]
    Rpc(String),
}

fn fmt_revert(revert: &Option<RevertInfo>) -> String {
    match revert {
        Some(info) => format!(": {info}"),
        None => String::new(),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    ValueOverflow,
    NonceUnavailable,
    NoncePending,
    HashMismatch,
    SignatureFormatInvalid,
    OwnerMismatch,
    InsufficientFunds,
    ExecutionReverted,
    EmptyBatch,
    SubmissionRejected,
    ConfirmationTimeout,
    ConfirmationCancelled,
    Signing,
    Rpc,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValueOverflow => "ValueOverflow",
            ErrorKind::NonceUnavailable => "NonceUnavailable",
            ErrorKind::NoncePending => "NoncePending",
            ErrorKind::HashMismatch => "HashMismatch",
            ErrorKind::SignatureFormatInvalid => "SignatureFormatInvalid",
            ErrorKind::OwnerMismatch => "OwnerMismatch",
            ErrorKind::InsufficientFunds => "InsufficientFunds",
            ErrorKind::ExecutionReverted => "ExecutionReverted",
            ErrorKind::EmptyBatch => "EmptyBatch",
            ErrorKind::SubmissionRejected => "SubmissionRejected",
            ErrorKind::ConfirmationTimeout => "ConfirmationTimeout",
            ErrorKind::ConfirmationCancelled => "ConfirmationCancelled",
            ErrorKind::Signing => "Signing",
            ErrorKind::Rpc => "Rpc",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl UserOpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UserOpError::ValueOverflow { .. } => ErrorKind::ValueOverflow,
            UserOpError::NonceUnavailable { .. } => ErrorKind::NonceUnavailable,
            UserOpError::NoncePending { .. } => ErrorKind::NoncePending,
            UserOpError::HashMismatch { .. } => ErrorKind::HashMismatch,
            UserOpError::SignatureFormatInvalid(_) => ErrorKind::SignatureFormatInvalid,
            UserOpError::OwnerMismatch { .. } => ErrorKind::OwnerMismatch,
            UserOpError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            UserOpError::ExecutionReverted { .. } => ErrorKind::ExecutionReverted,
            UserOpError::EmptyBatch => ErrorKind::EmptyBatch,
            UserOpError::SubmissionRejected(_) => ErrorKind::SubmissionRejected,
            UserOpError::ConfirmationTimeout { .. } => ErrorKind::ConfirmationTimeout,
            UserOpError::ConfirmationCancelled { .. } => ErrorKind::ConfirmationCancelled,
            UserOpError::Signing(_) => ErrorKind::Signing,
            UserOpError::Rpc(_) => ErrorKind::Rpc,
        }
    }

    /// Transient failures. Only the submission/confirmation pair is retried
    /// automatically by the pipeline; `NonceUnavailable` is left to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::NonceUnavailable
                | ErrorKind::SubmissionRejected
                | ErrorKind::ConfirmationTimeout
        )
    }

    /// Best human-readable reason, preferring decoded revert strings over raw bytes.
    pub fn reason(&self) -> String {
        match self {
            UserOpError::ExecutionReverted {
                revert: Some(info), ..
            } => info.to_string(),
            other => other.to_string(),
        }
    }
}

pub type Result<T, E = UserOpError> = std::result::Result<T, E>;
