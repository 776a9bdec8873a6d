//! On-chain collaborators behind narrow capability traits.
//!
//! The EntryPoint and the smart account are black boxes: this crate only needs the
//! handful of calls listed here. ABI version differences (packed vs unpacked tuple)
//! are resolved against the generated [`bindings`](crate::bindings), so switching
//! versions never forks call sites.

use crate::bindings::account::{CreateAccountCall, ExecuteCall, SmartAccount};
use crate::bindings::{v06, v07};
use crate::types::{EntryPointVersion, UserOperation};
use async_trait::async_trait;
use ethers::abi::AbiEncode;
use ethers::contract::{ContractError, FunctionCall};
use ethers::providers::{Middleware, MiddlewareError};
use ethers::types::{Address, BlockNumber, Bytes, TransactionReceipt, H256, U256};
use std::sync::Arc;

/// ERC-1271 `isValidSignature` success value.
pub const ERC1271_MAGIC_VALUE: [u8; 4] = [0x16, 0x26, 0xba, 0x7e];

/// Low-level outcome of a failed call, before it is classified by a pipeline stage.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    /// The node reported a revert; payload may be empty if it was not forwarded.
    #[error("call reverted (0x{})", hex::encode(.0))]
    Reverted(Bytes),
    #[error("{0}")]
    Transport(String),
    #[error("malformed return data: {0}")]
    Malformed(String),
}

impl CallError {
    pub fn from_middleware<E: MiddlewareError>(err: E) -> Self {
        match err.as_error_response().and_then(|resp| resp.as_revert_data()) {
            Some(data) => CallError::Reverted(data),
            None => CallError::Transport(err.to_string()),
        }
    }

    pub fn from_contract<M: Middleware>(err: ContractError<M>) -> Self {
        match err {
            ContractError::Revert(data) => CallError::Reverted(data),
            ContractError::MiddlewareError { e } => Self::from_middleware(e),
            ContractError::ProviderError { e } => Self::from_middleware(e),
            other @ (ContractError::DecodingError(_)
            | ContractError::AbiError(_)
            | ContractError::DetokenizationError(_)) => CallError::Malformed(other.to_string()),
            other => CallError::Transport(other.to_string()),
        }
    }
}

/// Outer-transaction settings for one `handleOps` broadcast.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxOverrides {
    pub gas_limit: Option<U256>,
    /// Reuse an earlier broadcast's nonce so this one replaces it.
    pub replace: Option<Replacement>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Replacement {
    pub nonce: U256,
    pub gas_price: U256,
}

/// What the node accepted for a `handleOps` broadcast.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SentTransaction {
    pub tx_hash: H256,
    pub nonce: U256,
    pub gas_price: U256,
}

/// Relay contract surface: `{getNonce, getUserOpHash, handleOps}` plus the gas
/// estimate of `handleOps`.
#[async_trait]
pub trait EntryPointApi: Send + Sync {
    fn address(&self) -> Address;

    fn version(&self) -> EntryPointVersion;

    fn chain_id(&self) -> u64;

    async fn get_nonce(&self, sender: Address, key: U256) -> Result<U256, CallError>;

    async fn get_user_op_hash(&self, op: &UserOperation) -> Result<H256, CallError>;

    async fn estimate_handle_ops(
        &self,
        ops: &[UserOperation],
        beneficiary: Address,
    ) -> Result<U256, CallError>;

    /// Broadcasts `handleOps` without waiting for inclusion. Without a
    /// replacement the next pending nonce and the node's gas price are used.
    async fn handle_ops(
        &self,
        ops: &[UserOperation],
        beneficiary: Address,
        overrides: TxOverrides,
    ) -> Result<SentTransaction, CallError>;
}

/// Smart account surface: `{owner, execute, isValidSignature}` plus the legacy
/// account-held `nonce()`.
#[async_trait]
pub trait AccountApi: Send + Sync {
    async fn owner(&self, account: Address) -> Result<Address, CallError>;

    async fn nonce(&self, account: Address) -> Result<U256, CallError>;

    async fn is_valid_signature(
        &self,
        account: Address,
        hash: H256,
        signature: &Bytes,
    ) -> Result<[u8; 4], CallError>;

    /// Calldata for `execute(address dest, uint256 value, bytes func)`.
    fn encode_execute(&self, target: Address, value: U256, data: &Bytes) -> Bytes {
        ExecuteCall {
            dest: target,
            value,
            func: data.clone(),
        }
        .encode()
        .into()
    }
}

/// Plain chain reads the pipeline needs outside the two contracts.
#[async_trait]
pub trait ChainApi: Send + Sync {
    async fn balance(&self, address: Address) -> Result<U256, CallError>;

    async fn is_deployed(&self, address: Address) -> Result<bool, CallError>;

    async fn gas_price(&self) -> Result<U256, CallError>;

    async fn block_number(&self) -> Result<u64, CallError>;

    async fn transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> Result<Option<TransactionReceipt>, CallError>;
}

/// `factory || createAccount(owner, salt)`
pub fn encode_init_code(factory: Address, owner: Address, salt: H256) -> Bytes {
    let create = CreateAccountCall { owner, salt: salt.0 }.encode();
    let mut v = Vec::with_capacity(20 + create.len());
    v.extend_from_slice(factory.as_bytes());
    v.extend_from_slice(&create);
    Bytes::from(v)
}

/// EntryPoint reached through an ethers middleware. `M` must be able to sign when
/// `handle_ops` is used (e.g. `SignerMiddleware`).
#[derive(Debug, Clone)]
pub struct EntryPointContract<M> {
    address: Address,
    version: EntryPointVersion,
    chain_id: u64,
    from: Option<Address>,
    client: Arc<M>,
}

impl<M: Middleware + 'static> EntryPointContract<M> {
    pub fn new(address: Address, version: EntryPointVersion, chain_id: u64, client: Arc<M>) -> Self {
        Self {
            address,
            version,
            chain_id,
            from: None,
            client,
        }
    }

    /// Account the `handleOps` transaction (and its estimate) is sent from.
    pub fn with_from(mut self, from: Address) -> Self {
        self.from = Some(from);
        self
    }

    fn v06(&self) -> v06::EntryPointV06<M> {
        v06::EntryPointV06::new(self.address, self.client.clone())
    }

    fn v07(&self) -> v07::EntryPointV07<M> {
        v07::EntryPointV07::new(self.address, self.client.clone())
    }

    fn handle_ops_call(
        &self,
        ops: &[UserOperation],
        beneficiary: Address,
    ) -> Result<FunctionCall<Arc<M>, M, ()>, CallError> {
        let mut call = match self.version {
            EntryPointVersion::V0_6 => self
                .v06()
                .handle_ops(ops.iter().map(v06::UserOperation::from).collect(), beneficiary),
            EntryPointVersion::V0_7 => {
                let packed = ops
                    .iter()
                    .map(v07::PackedUserOperation::try_from)
                    .collect::<crate::error::Result<Vec<_>>>()
                    .map_err(|e| CallError::Malformed(e.to_string()))?;
                self.v07().handle_ops(packed, beneficiary)
            }
        };
        if let Some(from) = self.from {
            call = call.from(from);
        }
        Ok(call)
    }

    fn sender(&self) -> Result<Address, CallError> {
        self.from
            .or_else(|| self.client.default_sender())
            .ok_or_else(|| CallError::Transport("no sender configured for handleOps".to_string()))
    }
}

#[async_trait]
impl<M: Middleware + 'static> EntryPointApi for EntryPointContract<M> {
    fn address(&self) -> Address {
        self.address
    }

    fn version(&self) -> EntryPointVersion {
        self.version
    }

    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn get_nonce(&self, sender: Address, key: U256) -> Result<U256, CallError> {
        let call = match self.version {
            EntryPointVersion::V0_6 => self.v06().get_nonce(sender, key),
            EntryPointVersion::V0_7 => self.v07().get_nonce(sender, key),
        };
        call.call().await.map_err(CallError::from_contract)
    }

    async fn get_user_op_hash(&self, op: &UserOperation) -> Result<H256, CallError> {
        let call = match self.version {
            EntryPointVersion::V0_6 => self.v06().get_user_op_hash(op.into()),
            EntryPointVersion::V0_7 => {
                let packed = v07::PackedUserOperation::try_from(op)
                    .map_err(|e| CallError::Malformed(e.to_string()))?;
                self.v07().get_user_op_hash(packed)
            }
        };
        call.call().await.map(H256::from).map_err(CallError::from_contract)
    }

    async fn estimate_handle_ops(
        &self,
        ops: &[UserOperation],
        beneficiary: Address,
    ) -> Result<U256, CallError> {
        self.handle_ops_call(ops, beneficiary)?
            .estimate_gas()
            .await
            .map_err(CallError::from_contract)
    }

    async fn handle_ops(
        &self,
        ops: &[UserOperation],
        beneficiary: Address,
        overrides: TxOverrides,
    ) -> Result<SentTransaction, CallError> {
        let (nonce, gas_price) = match overrides.replace {
            Some(r) => (r.nonce, r.gas_price),
            None => {
                let nonce = self
                    .client
                    .get_transaction_count(self.sender()?, Some(BlockNumber::Pending.into()))
                    .await
                    .map_err(CallError::from_middleware)?;
                let gas_price = self
                    .client
                    .get_gas_price()
                    .await
                    .map_err(CallError::from_middleware)?;
                (nonce, gas_price)
            }
        };

        let mut call = self
            .handle_ops_call(ops, beneficiary)?
            .legacy()
            .nonce(nonce)
            .gas_price(gas_price);
        if let Some(gas) = overrides.gas_limit {
            call = call.gas(gas);
        }
        let pending = call.send().await.map_err(CallError::from_contract)?;
        Ok(SentTransaction {
            tx_hash: pending.tx_hash(),
            nonce,
            gas_price,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AccountContract<M> {
    client: Arc<M>,
}

impl<M: Middleware + 'static> AccountContract<M> {
    pub fn new(client: Arc<M>) -> Self {
        Self { client }
    }

    fn at(&self, account: Address) -> SmartAccount<M> {
        SmartAccount::new(account, self.client.clone())
    }
}

#[async_trait]
impl<M: Middleware + 'static> AccountApi for AccountContract<M> {
    async fn owner(&self, account: Address) -> Result<Address, CallError> {
        self.at(account)
            .owner()
            .call()
            .await
            .map_err(CallError::from_contract)
    }

    async fn nonce(&self, account: Address) -> Result<U256, CallError> {
        self.at(account)
            .nonce()
            .call()
            .await
            .map_err(CallError::from_contract)
    }

    async fn is_valid_signature(
        &self,
        account: Address,
        hash: H256,
        signature: &Bytes,
    ) -> Result<[u8; 4], CallError> {
        self.at(account)
            .is_valid_signature(hash.0, signature.clone())
            .call()
            .await
            .map_err(CallError::from_contract)
    }
}

#[derive(Debug, Clone)]
pub struct RpcChain<M> {
    client: Arc<M>,
}

impl<M: Middleware + 'static> RpcChain<M> {
    pub fn new(client: Arc<M>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<M: Middleware + 'static> ChainApi for RpcChain<M> {
    async fn balance(&self, address: Address) -> Result<U256, CallError> {
        self.client
            .get_balance(address, None)
            .await
            .map_err(CallError::from_middleware)
    }

    async fn is_deployed(&self, address: Address) -> Result<bool, CallError> {
        let code = self
            .client
            .get_code(address, None)
            .await
            .map_err(CallError::from_middleware)?;
        Ok(!code.as_ref().is_empty())
    }

    async fn gas_price(&self) -> Result<U256, CallError> {
        self.client
            .get_gas_price()
            .await
            .map_err(CallError::from_middleware)
    }

    async fn block_number(&self) -> Result<u64, CallError> {
        self.client
            .get_block_number()
            .await
            .map(|n| n.as_u64())
            .map_err(CallError::from_middleware)
    }

    async fn transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> Result<Option<TransactionReceipt>, CallError> {
        self.client
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(CallError::from_middleware)
    }
}
