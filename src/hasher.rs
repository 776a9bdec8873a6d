//! userOpHash computation.
//!
//! The EntryPoint's `getUserOpHash` is the only hash that is ever signed. The local
//! algorithm is kept as a cross-check (a divergence means the tuple schema is wrong
//! for the deployed contract) and for offline use.

use crate::contracts::EntryPointApi;
use crate::error::{Result, UserOpError};
use crate::types::{EntryPointVersion, UserOperation};
use ethers::abi::{self, Token};
use ethers::types::{Address, H256, U256};
use ethers::utils::keccak256;
use std::sync::Arc;

fn hashed(bytes: &[u8]) -> Token {
    Token::FixedBytes(keccak256(bytes).to_vec())
}

/// `abi.encode` of every field except the signature, with the dynamic byte fields
/// replaced by their keccak256.
pub fn pack_for_hash(op: &UserOperation, version: EntryPointVersion) -> Result<Vec<u8>> {
    let tokens = match version {
        EntryPointVersion::V0_6 => vec![
            Token::Address(op.sender),
            Token::Uint(op.nonce),
            hashed(&op.init_code),
            hashed(&op.call_data),
            Token::Uint(op.call_gas_limit),
            Token::Uint(op.verification_gas_limit),
            Token::Uint(op.pre_verification_gas),
            Token::Uint(op.max_fee_per_gas),
            Token::Uint(op.max_priority_fee_per_gas),
            hashed(&op.paymaster_and_data),
        ],
        EntryPointVersion::V0_7 => vec![
            Token::Address(op.sender),
            Token::Uint(op.nonce),
            hashed(&op.init_code),
            hashed(&op.call_data),
            Token::FixedBytes(op.account_gas_limits()?.to_vec()),
            Token::Uint(op.pre_verification_gas),
            Token::FixedBytes(op.gas_fees()?.to_vec()),
            hashed(&op.paymaster_and_data),
        ],
    };
    Ok(abi::encode(&tokens))
}

/// `keccak256(abi.encode(keccak256(pack_for_hash(op)), entryPoint, chainId))`
pub fn local_user_op_hash(
    op: &UserOperation,
    version: EntryPointVersion,
    entry_point: Address,
    chain_id: u64,
) -> Result<H256> {
    let inner = keccak256(pack_for_hash(op, version)?);
    let outer = abi::encode(&[
        Token::FixedBytes(inner.to_vec()),
        Token::Address(entry_point),
        Token::Uint(U256::from(chain_id)),
    ]);
    Ok(H256::from(keccak256(outer)))
}

#[derive(Clone)]
pub struct CanonicalHasher {
    entry_point: Arc<dyn EntryPointApi>,
}

impl CanonicalHasher {
    pub fn new(entry_point: Arc<dyn EntryPointApi>) -> Self {
        Self { entry_point }
    }

    /// Offline hash, bound to the configured EntryPoint address and chain id.
    pub fn local(&self, op: &UserOperation) -> Result<H256> {
        local_user_op_hash(
            op,
            self.entry_point.version(),
            self.entry_point.address(),
            self.entry_point.chain_id(),
        )
    }

    pub async fn authoritative(&self, op: &UserOperation) -> Result<H256> {
        self.entry_point
            .get_user_op_hash(op)
            .await
            .map_err(|e| UserOpError::Rpc(format!("entryPoint.getUserOpHash failed: {e}")))
    }

    /// The hash to sign. Any divergence between the local and EntryPoint results is
    /// fatal; the signature field of `op` is ignored by both.
    pub async fn hash(&self, op: &UserOperation) -> Result<H256> {
        let local = self.local(op)?;
        let authoritative = self.authoritative(op).await?;
        if local != authoritative {
            tracing::error!(
                local = %format!("{local:#x}"),
                entry_point = %format!("{authoritative:#x}"),
                version = %self.entry_point.version(),
                "userOpHash mismatch"
            );
            return Err(UserOpError::HashMismatch {
                local,
                authoritative,
            });
        }
        tracing::debug!(user_op_hash = %format!("{authoritative:#x}"), "userOpHash verified");
        Ok(authoritative)
    }
}
