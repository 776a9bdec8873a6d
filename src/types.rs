use crate::error::Result;
use crate::packing::pack_pair;
use crate::revert::RevertInfo;
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// EntryPoint ABI generation. Fixes the UserOperation tuple schema, the selectors
/// derived from it, and the local hash algorithm.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryPointVersion {
    /// Unpacked layout: five separate uint256 gas/fee fields.
    #[serde(rename = "v0.6")]
    V0_6,
    /// Packed layout: `accountGasLimits` and `gasFees` as bytes32.
    #[default]
    #[serde(rename = "v0.7")]
    V0_7,
}

impl fmt::Display for EntryPointVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryPointVersion::V0_6 => f.write_str("v0.6"),
            EntryPointVersion::V0_7 => f.write_str("v0.7"),
        }
    }
}

impl FromStr for EntryPointVersion {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().trim_start_matches('v') {
            "0.6" | "06" => Ok(EntryPointVersion::V0_6),
            "0.7" | "07" => Ok(EntryPointVersion::V0_7),
            other => Err(format!("unsupported EntryPoint version: {other}")),
        }
    }
}

/// ERC-4337 UserOperation in its logical (unpacked) form.
///
/// The wire form depends on [`EntryPointVersion`]; see
/// [`bindings`](crate::bindings).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

impl UserOperation {
    /// `verificationGasLimit || callGasLimit`
    pub fn account_gas_limits(&self) -> Result<[u8; 32]> {
        pack_pair(
            ("verificationGasLimit", self.verification_gas_limit),
            ("callGasLimit", self.call_gas_limit),
        )
    }

    /// `maxPriorityFeePerGas || maxFeePerGas`
    pub fn gas_fees(&self) -> Result<[u8; 32]> {
        pack_pair(
            ("maxPriorityFeePerGas", self.max_priority_fee_per_gas),
            ("maxFeePerGas", self.max_fee_per_gas),
        )
    }

    pub fn has_paymaster(&self) -> bool {
        !self.paymaster_and_data.is_empty()
    }

    /// Worst-case amount the EntryPoint may charge the sender for this operation.
    pub fn required_prefund(&self, version: EntryPointVersion) -> U256 {
        let verification = match version {
            EntryPointVersion::V0_6 if self.has_paymaster() => {
                self.verification_gas_limit.saturating_mul(U256::from(3))
            }
            _ => self.verification_gas_limit,
        };
        self.call_gas_limit
            .saturating_add(verification)
            .saturating_add(self.pre_verification_gas)
            .saturating_mul(self.max_fee_per_gas)
    }
}

/// What the caller wants the account to do.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Intent {
    pub target: Address,
    pub value: U256,
    pub data: Bytes,
    /// Factory address followed by its calldata; only for the first operation of an
    /// undeployed account.
    pub init_code: Bytes,
    pub paymaster_and_data: Bytes,
}

impl Intent {
    pub fn new(target: Address, value: U256, data: Bytes) -> Self {
        Self {
            target,
            value,
            data,
            ..Default::default()
        }
    }

    pub fn with_init_code(mut self, init_code: Bytes) -> Self {
        self.init_code = init_code;
        self
    }

    pub fn with_paymaster_and_data(mut self, paymaster_and_data: Bytes) -> Self {
        self.paymaster_and_data = paymaster_and_data;
        self
    }
}

/// Concrete gas limits and fees for one build.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GasValues {
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeeSource {
    Fixed {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
    /// `eth_gasPrice * multiplier_bps / 10_000`, applied to both fee fields.
    Network { multiplier_bps: u64 },
}

pub const DEFAULT_MAX_FEE_PER_GAS: u64 = 2_000_000_000;
pub const DEFAULT_MAX_PRIORITY_FEE_PER_GAS: u64 = 1_000_000_000;

/// Where gas values come from. The builder only packs what this yields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GasPolicy {
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub fees: FeeSource,
    /// Fee increase per retry, in basis points.
    pub bump_bps: u64,
}

impl Default for GasPolicy {
    fn default() -> Self {
        Self {
            call_gas_limit: U256::from(100_000u64),
            verification_gas_limit: U256::from(100_000u64),
            pre_verification_gas: U256::from(30_000u64),
            fees: FeeSource::Fixed {
                max_fee_per_gas: U256::from(DEFAULT_MAX_FEE_PER_GAS),
                max_priority_fee_per_gas: U256::from(DEFAULT_MAX_PRIORITY_FEE_PER_GAS),
            },
            bump_bps: 1_250,
        }
    }
}

/// Recoverable ECDSA signature components over a userOpHash.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SignatureParts {
    pub r: [u8; 32],
    pub s: [u8; 32],
    pub v: u8,
}

/// Result of a successful preflight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GasEstimate {
    /// Gas the outer `handleOps` transaction is expected to use.
    pub handle_ops_gas: U256,
    pub required_prefund: U256,
    pub sender_balance: U256,
}

/// A broadcast `handleOps` transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionHandle {
    pub tx_hash: H256,
    /// Outer transaction nonce of the submitting EOA; a replacement reuses it.
    pub sender_nonce: U256,
    pub gas_price: U256,
    pub user_op_hashes: Vec<H256>,
}

/// Per-operation result read from the EntryPoint's `UserOperationEvent`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserOpOutcome {
    pub user_op_hash: H256,
    pub sender: Address,
    pub nonce: U256,
    pub success: bool,
    pub actual_gas_cost: U256,
    pub actual_gas_used: U256,
    pub revert: Option<RevertInfo>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: H256,
    pub block_number: u64,
    pub gas_used: Option<U256>,
    pub user_ops: Vec<UserOpOutcome>,
}
