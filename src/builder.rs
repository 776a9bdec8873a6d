use crate::bindings::v07::PackedUserOperation;
use crate::contracts::{AccountApi, ChainApi};
use crate::error::{Result, UserOpError};
use crate::types::{EntryPointVersion, FeeSource, GasPolicy, GasValues, Intent, UserOperation};
use ethers::types::{Address, Bytes, H256, U256};
use std::sync::Arc;

const BPS: u64 = 10_000;

/// A fully populated operation whose signature is still empty.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnsignedUserOperation {
    op: UserOperation,
}

impl UnsignedUserOperation {
    pub fn operation(&self) -> &UserOperation {
        &self.op
    }

    /// Attaches the signature produced over `user_op_hash`. The hash travels with the
    /// operation so submission and receipt lookup never recompute it.
    pub fn into_signed(self, signature: Bytes, user_op_hash: H256) -> SignedUserOperation {
        let mut op = self.op;
        op.signature = signature;
        SignedUserOperation { op, user_op_hash }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedUserOperation {
    op: UserOperation,
    user_op_hash: H256,
}

impl SignedUserOperation {
    pub fn operation(&self) -> &UserOperation {
        &self.op
    }

    pub fn user_op_hash(&self) -> H256 {
        self.user_op_hash
    }

    pub fn into_operation(self) -> UserOperation {
        self.op
    }
}

#[derive(Clone)]
pub struct OperationBuilder {
    sender: Address,
    version: EntryPointVersion,
    account: Arc<dyn AccountApi>,
}

impl OperationBuilder {
    pub fn new(sender: Address, version: EntryPointVersion, account: Arc<dyn AccountApi>) -> Self {
        Self {
            sender,
            version,
            account,
        }
    }

    pub fn sender(&self) -> Address {
        self.sender
    }

    /// Pure: no network access. `nonce` must come straight from the resolver.
    pub fn build(&self, intent: &Intent, nonce: U256, gas: &GasValues) -> Result<UnsignedUserOperation> {
        let call_data = self
            .account
            .encode_execute(intent.target, intent.value, &intent.data);

        let op = UserOperation {
            sender: self.sender,
            nonce,
            init_code: intent.init_code.clone(),
            call_data,
            call_gas_limit: gas.call_gas_limit,
            verification_gas_limit: gas.verification_gas_limit,
            pre_verification_gas: gas.pre_verification_gas,
            max_fee_per_gas: gas.max_fee_per_gas,
            max_priority_fee_per_gas: gas.max_priority_fee_per_gas,
            paymaster_and_data: intent.paymaster_and_data.clone(),
            signature: Bytes::default(),
        };

        // Surfaces packing overflow at build time.
        if self.version == EntryPointVersion::V0_7 {
            PackedUserOperation::try_from(&op)?;
        }

        tracing::debug!(
            sender = %self.sender,
            nonce = %nonce,
            target = %intent.target,
            value = %intent.value,
            call_data_len = op.call_data.len(),
            "built user operation"
        );
        Ok(UnsignedUserOperation { op })
    }
}

fn scale_bps(value: U256, bps: u64) -> U256 {
    value.saturating_mul(U256::from(bps)) / U256::from(BPS)
}

/// Gas values for submission attempt `attempt` (0 = first). Each retry raises both
/// fee fields by `bump_bps`.
pub async fn resolve_gas(policy: &GasPolicy, chain: &dyn ChainApi, attempt: u32) -> Result<GasValues> {
    let (mut max_fee, mut priority_fee) = match policy.fees {
        FeeSource::Fixed {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        } => (max_fee_per_gas, max_priority_fee_per_gas),
        FeeSource::Network { multiplier_bps } => {
            let gas_price = chain
                .gas_price()
                .await
                .map_err(|e| UserOpError::Rpc(format!("eth_gasPrice failed: {e}")))?;
            let fee = scale_bps(gas_price, multiplier_bps.max(1));
            (fee, fee)
        }
    };

    for _ in 0..attempt {
        max_fee = scale_bps(max_fee, BPS + policy.bump_bps);
        priority_fee = scale_bps(priority_fee, BPS + policy.bump_bps);
    }

    if priority_fee > max_fee {
        priority_fee = max_fee;
    }

    Ok(GasValues {
        call_gas_limit: policy.call_gas_limit,
        verification_gas_limit: policy.verification_gas_limit,
        pre_verification_gas: policy.pre_verification_gas,
        max_fee_per_gas: max_fee,
        max_priority_fee_per_gas: priority_fee,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockNode;

    fn gas() -> GasValues {
        GasValues {
            call_gas_limit: U256::from(100_000u64),
            verification_gas_limit: U256::from(100_000u64),
            pre_verification_gas: U256::from(30_000u64),
            max_fee_per_gas: U256::from(2_000_000_000u64),
            max_priority_fee_per_gas: U256::from(1_000_000_000u64),
        }
    }

    fn builder(version: EntryPointVersion) -> OperationBuilder {
        OperationBuilder::new(Address::repeat_byte(0xf2), version, MockNode::new_arc())
    }

    #[test]
    fn builds_with_empty_signature_and_intent_fields() {
        let intent = Intent::new(Address::repeat_byte(0xde), U256::from(5u64), Bytes::from(vec![1, 2, 3]))
            .with_paymaster_and_data(Bytes::from(vec![0x99; 20]));
        let unsigned = builder(EntryPointVersion::V0_7)
            .build(&intent, U256::from(4u64), &gas())
            .unwrap();
        let op = unsigned.operation();
        assert_eq!(op.sender, Address::repeat_byte(0xf2));
        assert_eq!(op.nonce, U256::from(4u64));
        assert!(op.signature.is_empty());
        assert!(op.init_code.is_empty());
        assert_eq!(op.paymaster_and_data.len(), 20);
        assert_eq!(op.call_gas_limit, U256::from(100_000u64));
        assert_eq!(&op.call_data[..4], &ethers::utils::id("execute(address,uint256,bytes)"));
    }

    #[test]
    fn is_deterministic() {
        let intent = Intent::new(Address::repeat_byte(0xde), U256::one(), Bytes::default());
        let b = builder(EntryPointVersion::V0_7);
        assert_eq!(
            b.build(&intent, U256::zero(), &gas()).unwrap(),
            b.build(&intent, U256::zero(), &gas()).unwrap()
        );
    }

    #[test]
    fn overflow_fails_at_build_time_for_packed_layout() {
        let intent = Intent::new(Address::repeat_byte(0xde), U256::zero(), Bytes::default());
        let mut g = gas();
        g.verification_gas_limit = U256::one() << 128;
        let err = builder(EntryPointVersion::V0_7)
            .build(&intent, U256::zero(), &g)
            .unwrap_err();
        assert!(matches!(
            err,
            UserOpError::ValueOverflow {
                field: "verificationGasLimit",
                ..
            }
        ));
        assert!(builder(EntryPointVersion::V0_6).build(&intent, U256::zero(), &g).is_ok());
    }

    #[test]
    fn signing_keeps_hash_alongside() {
        let intent = Intent::new(Address::repeat_byte(0xde), U256::zero(), Bytes::default());
        let unsigned = builder(EntryPointVersion::V0_7)
            .build(&intent, U256::zero(), &gas())
            .unwrap();
        let signed = unsigned.into_signed(Bytes::from(vec![7; 65]), H256::repeat_byte(3));
        assert_eq!(signed.user_op_hash(), H256::repeat_byte(3));
        assert_eq!(signed.operation().signature.len(), 65);
    }

    #[tokio::test]
    async fn fixed_fees_bump_per_attempt() {
        let node = MockNode::new_arc();
        let policy = GasPolicy::default();
        let first = resolve_gas(&policy, node.as_ref(), 0).await.unwrap();
        assert_eq!(first.max_fee_per_gas, U256::from(2_000_000_000u64));
        assert_eq!(first.max_priority_fee_per_gas, U256::from(1_000_000_000u64));

        let second = resolve_gas(&policy, node.as_ref(), 1).await.unwrap();
        assert_eq!(second.max_fee_per_gas, U256::from(2_250_000_000u64));
        assert_eq!(second.max_priority_fee_per_gas, U256::from(1_125_000_000u64));
        assert_eq!(second.call_gas_limit, first.call_gas_limit);
    }

    #[tokio::test]
    async fn network_fees_scale_gas_price() {
        let node = MockNode::new_arc();
        node.state().gas_price = U256::from(10_000_000_000u64);
        let policy = GasPolicy {
            fees: FeeSource::Network { multiplier_bps: 15_000 },
            ..GasPolicy::default()
        };
        let g = resolve_gas(&policy, node.as_ref(), 0).await.unwrap();
        assert_eq!(g.max_fee_per_gas, U256::from(15_000_000_000u64));
        assert_eq!(g.max_priority_fee_per_gas, g.max_fee_per_gas);
    }
}
