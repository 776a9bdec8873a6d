//! Typed ABI bindings for the EntryPoint generations, the smart account and its
//! factory, plus the two Solidity built-in revert shapes.

use crate::error::{Result, UserOpError};
use crate::types::UserOperation;
use ethers::contract::EthError;
use ethers::types::U256;

pub mod v06 {
    use ethers::contract::abigen;

    abigen!(
        EntryPointV06,
        r#"[
            struct UserOperation {address sender;uint256 nonce;bytes initCode;bytes callData;uint256 callGasLimit;uint256 verificationGasLimit;uint256 preVerificationGas;uint256 maxFeePerGas;uint256 maxPriorityFeePerGas;bytes paymasterAndData;bytes signature;}
            function handleOps(UserOperation[] calldata ops,address payable beneficiary) external
            function getUserOpHash(UserOperation calldata userOp) external view returns (bytes32)
            function getNonce(address sender, uint192 key) external view returns (uint256 nonce)
            error FailedOp(uint256 opIndex, string reason)
            event UserOperationRevertReason(bytes32 indexed userOpHash,address indexed sender,uint256 nonce,bytes revertReason)
            event UserOperationEvent(bytes32 indexed userOpHash,address indexed sender,address indexed paymaster,uint256 nonce,bool success,uint256 actualGasCost,uint256 actualGasUsed)
        ]"#
    );
}

pub mod v07 {
    use ethers::contract::abigen;

    abigen!(
        EntryPointV07,
        r#"[
            struct PackedUserOperation {address sender;uint256 nonce;bytes initCode;bytes callData;bytes32 accountGasLimits;uint256 preVerificationGas;bytes32 gasFees;bytes paymasterAndData;bytes signature;}
            function handleOps(PackedUserOperation[] calldata ops,address payable beneficiary) external
            function getUserOpHash(PackedUserOperation calldata userOp) external view returns (bytes32)
            function getNonce(address sender, uint192 key) external view returns (uint256 nonce)
            error FailedOp(uint256 opIndex, string reason)
            error FailedOpWithRevert(uint256 opIndex, string reason, bytes inner)
            event UserOperationRevertReason(bytes32 indexed userOpHash,address indexed sender,uint256 nonce,bytes revertReason)
            event UserOperationEvent(bytes32 indexed userOpHash,address indexed sender,address indexed paymaster,uint256 nonce,bool success,uint256 actualGasCost,uint256 actualGasUsed)
        ]"#
    );
}

pub mod account {
    use ethers::contract::abigen;

    abigen!(
        SmartAccount,
        r#"[
            function owner() external view returns (address)
            function nonce() external view returns (uint256)
            function execute(address dest, uint256 value, bytes func) external
            function isValidSignature(bytes32 hash, bytes signature) external view returns (bytes4)
        ]"#
    );

    abigen!(
        AccountFactory,
        r#"[
            function createAccount(address owner, bytes32 salt) external returns (address)
        ]"#
    );
}

/// `Error(string)`, emitted by `revert("...")` and `require`.
#[derive(Clone, Debug, Default, Eq, PartialEq, EthError)]
#[etherror(name = "Error", abi = "Error(string)")]
pub struct RevertString {
    pub reason: String,
}

/// `Panic(uint256)`, emitted by compiler-inserted checks.
#[derive(Clone, Debug, Default, Eq, PartialEq, EthError)]
#[etherror(name = "Panic", abi = "Panic(uint256)")]
pub struct PanicCode {
    pub code: U256,
}

impl From<&UserOperation> for v06::UserOperation {
    fn from(op: &UserOperation) -> Self {
        Self {
            sender: op.sender,
            nonce: op.nonce,
            init_code: op.init_code.clone(),
            call_data: op.call_data.clone(),
            call_gas_limit: op.call_gas_limit,
            verification_gas_limit: op.verification_gas_limit,
            pre_verification_gas: op.pre_verification_gas,
            max_fee_per_gas: op.max_fee_per_gas,
            max_priority_fee_per_gas: op.max_priority_fee_per_gas,
            paymaster_and_data: op.paymaster_and_data.clone(),
            signature: op.signature.clone(),
        }
    }
}

/// Fails only when a `uint128` half of a packed field does not fit.
impl TryFrom<&UserOperation> for v07::PackedUserOperation {
    type Error = UserOpError;

    fn try_from(op: &UserOperation) -> Result<Self> {
        Ok(Self {
            sender: op.sender,
            nonce: op.nonce,
            init_code: op.init_code.clone(),
            call_data: op.call_data.clone(),
            account_gas_limits: op.account_gas_limits()?,
            pre_verification_gas: op.pre_verification_gas,
            gas_fees: op.gas_fees()?,
            paymaster_and_data: op.paymaster_and_data.clone(),
            signature: op.signature.clone(),
        })
    }
}
