//! In-memory node standing in for the EntryPoint, the account and the chain.

use crate::bindings::v07::{UserOperationEventFilter, UserOperationRevertReasonFilter};
use crate::contracts::{
    AccountApi, CallError, ChainApi, EntryPointApi, SentTransaction, TxOverrides, ERC1271_MAGIC_VALUE,
};
use crate::hasher::local_user_op_hash;
use crate::types::{EntryPointVersion, UserOperation};
use async_trait::async_trait;
use ethers::abi::{self, Token};
use ethers::contract::EthEvent;
use ethers::signers::LocalWallet;
use ethers::types::{Address, Bytes, Log, TransactionReceipt, H256, U256, U64};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// Anvil account #0.
pub const TEST_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
pub const TEST_SIGNER: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";
pub const TEST_SENDER: &str = "0xf244000000000000000000000000000000067da0";
pub const TEST_ENTRY_POINT: &str = "0x0000000071727De22E5E9d8BAf0edAc6f37da032";

pub fn test_wallet() -> LocalWallet {
    TEST_KEY.parse().unwrap()
}

pub fn user_op_event_log(
    entry_point: Address,
    user_op_hash: H256,
    sender: Address,
    nonce: U256,
    success: bool,
) -> Log {
    Log {
        address: entry_point,
        topics: vec![
            UserOperationEventFilter::signature(),
            user_op_hash,
            H256::from(sender),
            H256::zero(),
        ],
        data: Bytes::from(abi::encode(&[
            Token::Uint(nonce),
            Token::Bool(success),
            Token::Uint(U256::from(21_000u64) * U256::exp10(9)),
            Token::Uint(U256::from(21_000u64)),
        ])),
        ..Default::default()
    }
}

fn revert_reason_log(entry_point: Address, user_op_hash: H256, sender: Address, nonce: U256, reason: &Bytes) -> Log {
    Log {
        address: entry_point,
        topics: vec![
            UserOperationRevertReasonFilter::signature(),
            user_op_hash,
            H256::from(sender),
        ],
        data: Bytes::from(abi::encode(&[Token::Uint(nonce), Token::Bytes(reason.to_vec())])),
        ..Default::default()
    }
}

#[derive(Debug)]
pub struct MockState {
    pub nonces: HashMap<(Address, U256), U256>,
    pub balances: HashMap<Address, U256>,
    pub undeployed: HashSet<Address>,
    pub owner: Address,
    pub signature_valid: bool,
    pub gas_price: U256,
    pub head: u64,

    pub nonce_error: Option<CallError>,
    pub hash_override: Option<H256>,
    pub estimate_error: Option<CallError>,
    pub estimate_calls: usize,

    /// Submissions to refuse before accepting.
    pub reject_submissions: usize,
    /// Submissions to accept but never include.
    pub drop_submissions: usize,
    /// Dropped submissions still consume the nonce (e.g. mined on a node we can't see).
    pub dropped_consume_nonce: bool,
    pub auto_mine: bool,
    /// When set, every mined operation fails with this revert payload.
    pub op_revert: Option<Bytes>,

    pub submitted: Vec<Vec<UserOperation>>,
    /// Every broadcast the node accepted, in order.
    pub sent: Vec<SentTransaction>,
    /// Next outer nonce of the submitting EOA, counting pending transactions.
    pub next_tx_nonce: U256,
    /// Pending outer transactions by nonce: (hash, gas price).
    pub mempool: HashMap<U256, (H256, U256)>,
    pub receipts: HashMap<H256, TransactionReceipt>,
}

#[derive(Debug)]
pub struct MockNode {
    entry_point: Address,
    version: EntryPointVersion,
    chain_id: u64,
    sender: Address,
    state: Mutex<MockState>,
}

impl MockNode {
    pub fn new_arc() -> Arc<Self> {
        Self::with_version(EntryPointVersion::V0_7)
    }

    pub fn with_version(version: EntryPointVersion) -> Arc<Self> {
        let sender: Address = TEST_SENDER.parse().unwrap();
        let mut balances = HashMap::new();
        balances.insert(sender, U256::exp10(18));
        Arc::new(Self {
            entry_point: TEST_ENTRY_POINT.parse().unwrap(),
            version,
            chain_id: 31_337,
            sender,
            state: Mutex::new(MockState {
                nonces: HashMap::new(),
                balances,
                undeployed: HashSet::new(),
                owner: TEST_SIGNER.parse().unwrap(),
                signature_valid: true,
                gas_price: U256::exp10(9),
                head: 100,
                nonce_error: None,
                hash_override: None,
                estimate_error: None,
                estimate_calls: 0,
                reject_submissions: 0,
                drop_submissions: 0,
                dropped_consume_nonce: false,
                auto_mine: true,
                op_revert: None,
                submitted: Vec::new(),
                sent: Vec::new(),
                next_tx_nonce: U256::from(5u64),
                mempool: HashMap::new(),
                receipts: HashMap::new(),
            }),
        })
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn sender(&self) -> Address {
        self.sender
    }

    pub fn entry_point_address(&self) -> Address {
        self.entry_point
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn set_nonce(&self, sender: Address, key: U256, value: U256) {
        self.state().nonces.insert((sender, key), value);
    }

    pub fn set_balance(&self, address: Address, value: U256) {
        self.state().balances.insert(address, value);
    }

    pub fn submitted_nonces(&self) -> Vec<U256> {
        self.state()
            .submitted
            .iter()
            .flat_map(|batch| batch.iter().map(|op| op.nonce))
            .collect()
    }

    fn consume_nonce(state: &mut MockState, op: &UserOperation) {
        let key = op.nonce >> 64;
        state.nonces.insert((op.sender, key), op.nonce + U256::one());
    }

    fn mine(&self, state: &mut MockState, tx_hash: H256, ops: &[UserOperation]) {
        state.head += 1;
        let mut logs = Vec::new();
        for op in ops {
            Self::consume_nonce(state, op);
            let hash = local_user_op_hash(op, self.version, self.entry_point, self.chain_id).unwrap();
            if let Some(reason) = &state.op_revert {
                logs.push(revert_reason_log(self.entry_point, hash, op.sender, op.nonce, reason));
            }
            logs.push(user_op_event_log(
                self.entry_point,
                hash,
                op.sender,
                op.nonce,
                state.op_revert.is_none(),
            ));
        }
        let receipt = TransactionReceipt {
            transaction_hash: tx_hash,
            block_number: Some(U64::from(state.head)),
            status: Some(U64::one()),
            gas_used: Some(U256::from(120_000u64)),
            logs,
            ..Default::default()
        };
        state.receipts.insert(tx_hash, receipt);
    }
}

#[async_trait]
impl EntryPointApi for MockNode {
    fn address(&self) -> Address {
        self.entry_point
    }

    fn version(&self) -> EntryPointVersion {
        self.version
    }

    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn get_nonce(&self, sender: Address, key: U256) -> Result<U256, CallError> {
        let state = self.state();
        if let Some(err) = &state.nonce_error {
            return Err(err.clone());
        }
        Ok(state.nonces.get(&(sender, key)).copied().unwrap_or(key << 64))
    }

    async fn get_user_op_hash(&self, op: &UserOperation) -> Result<H256, CallError> {
        if let Some(h) = self.state().hash_override {
            return Ok(h);
        }
        local_user_op_hash(op, self.version, self.entry_point, self.chain_id)
            .map_err(|e| CallError::Malformed(e.to_string()))
    }

    async fn estimate_handle_ops(&self, ops: &[UserOperation], _beneficiary: Address) -> Result<U256, CallError> {
        let mut state = self.state();
        state.estimate_calls += 1;
        if let Some(err) = &state.estimate_error {
            return Err(err.clone());
        }
        Ok(U256::from(150_000u64) * U256::from(ops.len()))
    }

    async fn handle_ops(
        &self,
        ops: &[UserOperation],
        _beneficiary: Address,
        overrides: TxOverrides,
    ) -> Result<SentTransaction, CallError> {
        let mut state = self.state();
        if state.reject_submissions > 0 {
            state.reject_submissions -= 1;
            return Err(CallError::Transport("transaction pool is full".to_string()));
        }

        let (nonce, gas_price) = match overrides.replace {
            Some(r) => {
                if let Some((_, pending_price)) = state.mempool.get(&r.nonce) {
                    // Nodes want at least +10% on a same-nonce replacement.
                    if r.gas_price * U256::from(10u64) < *pending_price * U256::from(11u64) {
                        return Err(CallError::Transport(
                            "replacement transaction underpriced".to_string(),
                        ));
                    }
                } else if r.nonce >= state.next_tx_nonce {
                    return Err(CallError::Transport("nonce too high".to_string()));
                }
                (r.nonce, r.gas_price)
            }
            None => {
                let nonce = state.next_tx_nonce;
                state.next_tx_nonce = nonce + U256::one();
                (nonce, state.gas_price)
            }
        };

        state.submitted.push(ops.to_vec());
        let tx_hash = H256::from_low_u64_be(state.submitted.len() as u64);
        let sent = SentTransaction {
            tx_hash,
            nonce,
            gas_price,
        };
        state.sent.push(sent);

        if state.drop_submissions > 0 {
            state.drop_submissions -= 1;
            state.mempool.insert(nonce, (tx_hash, gas_price));
            if state.dropped_consume_nonce {
                for op in ops {
                    Self::consume_nonce(&mut state, op);
                }
            }
        } else if state.auto_mine {
            state.mempool.remove(&nonce);
            self.mine(&mut state, tx_hash, ops);
        } else {
            state.mempool.insert(nonce, (tx_hash, gas_price));
        }
        Ok(sent)
    }
}

#[async_trait]
impl AccountApi for MockNode {
    async fn owner(&self, _account: Address) -> Result<Address, CallError> {
        Ok(self.state().owner)
    }

    async fn nonce(&self, account: Address) -> Result<U256, CallError> {
        Ok(self
            .state()
            .nonces
            .get(&(account, U256::zero()))
            .copied()
            .unwrap_or_default())
    }

    async fn is_valid_signature(&self, _account: Address, _hash: H256, _signature: &Bytes) -> Result<[u8; 4], CallError> {
        if self.state().signature_valid {
            Ok(ERC1271_MAGIC_VALUE)
        } else {
            Ok([0xff; 4])
        }
    }
}

#[async_trait]
impl ChainApi for MockNode {
    async fn balance(&self, address: Address) -> Result<U256, CallError> {
        Ok(self.state().balances.get(&address).copied().unwrap_or_default())
    }

    async fn is_deployed(&self, address: Address) -> Result<bool, CallError> {
        Ok(!self.state().undeployed.contains(&address))
    }

    async fn gas_price(&self) -> Result<U256, CallError> {
        Ok(self.state().gas_price)
    }

    async fn block_number(&self) -> Result<u64, CallError> {
        Ok(self.state().head)
    }

    async fn transaction_receipt(&self, tx_hash: H256) -> Result<Option<TransactionReceipt>, CallError> {
        Ok(self.state().receipts.get(&tx_hash).cloned())
    }
}
