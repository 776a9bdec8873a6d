//! ECDSA signing of userOpHashes and the account-specific byte layout of the result.

use crate::builder::{SignedUserOperation, UnsignedUserOperation};
use crate::contracts::{AccountApi, CallError, ERC1271_MAGIC_VALUE};
use crate::error::{Result, UserOpError};
use crate::types::SignatureParts;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, Signature, H256, U256};
use ethers::utils::hash_message;
use serde::Deserialize;
use std::sync::Arc;

/// Key material able to sign a 32-byte digest without further hashing.
pub trait HashSigner: Send + Sync {
    fn signer_address(&self) -> Address;

    fn sign_digest(&self, digest: H256) -> Result<Signature>;
}

impl HashSigner for LocalWallet {
    fn signer_address(&self) -> Address {
        Signer::address(self)
    }

    fn sign_digest(&self, digest: H256) -> Result<Signature> {
        self.sign_hash(digest)
            .map_err(|e| UserOpError::Signing(e.to_string()))
    }
}

/// What digest the account's validation logic recovers from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SignatureScheme {
    /// The userOpHash itself.
    #[default]
    RawDigest,
    /// EIP-191 `"\x19Ethereum Signed Message:\n32" || userOpHash`.
    EthSignedMessage,
}

impl SignatureScheme {
    pub fn digest(&self, user_op_hash: H256) -> H256 {
        match self {
            SignatureScheme::RawDigest => user_op_hash,
            SignatureScheme::EthSignedMessage => hash_message(user_op_hash.as_bytes()),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SignatureLayout {
    /// `r || s || v`
    #[default]
    Rsv,
    /// `v || r || s`
    Vrs,
}

/// Byte layout the account contract expects in `signature`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SignatureFormat {
    pub scheme: SignatureScheme,
    pub layout: SignatureLayout,
    /// Added to the recovery id: 27 gives v in {27, 28}, 0 gives {0, 1}.
    pub v_offset: u8,
}

impl Default for SignatureFormat {
    fn default() -> Self {
        Self {
            scheme: SignatureScheme::RawDigest,
            layout: SignatureLayout::Rsv,
            v_offset: 27,
        }
    }
}

impl SignatureFormat {
    pub fn validate(&self) -> Result<()> {
        if self.v_offset != 27 && self.v_offset != 0 {
            return Err(UserOpError::SignatureFormatInvalid(format!(
                "vOffset must be 27 or 0, got {}",
                self.v_offset
            )));
        }
        Ok(())
    }
}

fn word(value: U256) -> [u8; 32] {
    let mut out = [0u8; 32];
    value.to_big_endian(&mut out);
    out
}

/// Accepts v as a bare parity, 27/28 or an EIP-155 value; anything else is rejected.
impl TryFrom<Signature> for SignatureParts {
    type Error = UserOpError;

    fn try_from(sig: Signature) -> Result<Self> {
        let recovery_id = sig
            .recovery_id()
            .map_err(|e| UserOpError::Signing(format!("invalid v {}: {e}", sig.v)))?;
        Ok(SignatureParts {
            r: word(sig.r),
            s: word(sig.s),
            v: 27 + recovery_id.to_byte(),
        })
    }
}

/// Serializes `parts` as 65 bytes in the order and v encoding of `format`.
pub fn pack_signature(parts: &SignatureParts, format: &SignatureFormat) -> Bytes {
    let v = parts.v.saturating_sub(27).saturating_add(format.v_offset);
    let mut out = Vec::with_capacity(65);
    match format.layout {
        SignatureLayout::Rsv => {
            out.extend_from_slice(&parts.r);
            out.extend_from_slice(&parts.s);
            out.push(v);
        }
        SignatureLayout::Vrs => {
            out.push(v);
            out.extend_from_slice(&parts.r);
            out.extend_from_slice(&parts.s);
        }
    }
    Bytes::from(out)
}

#[derive(Clone)]
pub struct OperationSigner {
    signer: Arc<dyn HashSigner>,
    format: SignatureFormat,
}

impl OperationSigner {
    pub fn new(signer: Arc<dyn HashSigner>, format: SignatureFormat) -> Self {
        Self { signer, format }
    }

    pub fn address(&self) -> Address {
        self.signer.signer_address()
    }

    pub fn format(&self) -> SignatureFormat {
        self.format
    }

    /// Signs exactly `user_op_hash` (or its EIP-191 digest, per the scheme). The
    /// signature is checked to recover to this signer before it is returned.
    pub fn sign(&self, user_op_hash: H256) -> Result<SignatureParts> {
        let digest = self.format.scheme.digest(user_op_hash);
        let sig = self.signer.sign_digest(digest)?;

        let recovered = sig
            .recover(digest)
            .map_err(|e| UserOpError::Signing(format!("signature does not recover: {e}")))?;
        if recovered != self.address() {
            return Err(UserOpError::Signing(format!(
                "signature recovers to {recovered:#x}, expected {:#x}",
                self.address()
            )));
        }
        SignatureParts::try_from(sig)
    }

    pub fn sign_operation(
        &self,
        unsigned: UnsignedUserOperation,
        user_op_hash: H256,
    ) -> Result<SignedUserOperation> {
        let parts = self.sign(user_op_hash)?;
        Ok(unsigned.into_signed(pack_signature(&parts, &self.format), user_op_hash))
    }

    /// Fails with `OwnerMismatch` when the account reports a different owner.
    pub async fn ensure_owner(&self, account: &dyn AccountApi, sender: Address) -> Result<()> {
        let owner = account.owner(sender).await.map_err(|e| match e {
            CallError::Reverted(_) => {
                UserOpError::Rpc(format!("account {sender:#x} has no owner() accessor"))
            }
            other => UserOpError::Rpc(format!("owner() failed: {other}")),
        })?;
        if owner != self.address() {
            return Err(UserOpError::OwnerMismatch {
                owner,
                signer: self.address(),
            });
        }
        Ok(())
    }

    /// Asks the account whether it accepts `signature` for `user_op_hash` (ERC-1271).
    pub async fn precheck(&self, account: &dyn AccountApi, signed: &SignedUserOperation) -> Result<()> {
        let op = signed.operation();
        let magic = account
            .is_valid_signature(op.sender, signed.user_op_hash(), &op.signature)
            .await
            .map_err(|e| UserOpError::SignatureFormatInvalid(format!("isValidSignature failed: {e}")))?;
        if magic != ERC1271_MAGIC_VALUE {
            return Err(UserOpError::SignatureFormatInvalid(format!(
                "isValidSignature returned 0x{}",
                hex::encode(magic)
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_wallet, MockNode, TEST_SIGNER};

    fn signer(format: SignatureFormat) -> OperationSigner {
        OperationSigner::new(Arc::new(test_wallet()), format)
    }

    fn recover(parts: &SignatureParts, digest: H256) -> Address {
        Signature {
            r: U256::from_big_endian(&parts.r),
            s: U256::from_big_endian(&parts.s),
            v: parts.v as u64,
        }
        .recover(digest)
        .unwrap()
    }

    /// Reports v the way a chain-aware signer does: `chain_id * 2 + 35 + parity`.
    struct Eip155Signer {
        inner: LocalWallet,
        chain_id: u64,
    }

    impl HashSigner for Eip155Signer {
        fn signer_address(&self) -> Address {
            Signer::address(&self.inner)
        }

        fn sign_digest(&self, digest: H256) -> Result<Signature> {
            let mut sig = self.inner.sign_digest(digest)?;
            sig.v = self.chain_id * 2 + 35 + (sig.v - 27);
            Ok(sig)
        }
    }

    #[test]
    fn eip155_v_is_normalised() {
        let s = OperationSigner::new(
            Arc::new(Eip155Signer {
                inner: test_wallet(),
                chain_id: 31_337,
            }),
            SignatureFormat::default(),
        );
        let hash = H256::repeat_byte(0x5a);
        let parts = s.sign(hash).unwrap();
        assert!(parts.v == 27 || parts.v == 28);
        assert_eq!(parts, signer(SignatureFormat::default()).sign(hash).unwrap());
        assert_eq!(recover(&parts, hash), s.address());
    }

    #[test]
    fn out_of_range_v_is_rejected() {
        let valid = test_wallet().sign_digest(H256::repeat_byte(0x01)).unwrap();
        for v in [2u64, 26, 29, 34] {
            let err = SignatureParts::try_from(Signature { v, ..valid }).unwrap_err();
            assert!(matches!(err, UserOpError::Signing(_)), "v = {v}");
        }
        let parity = SignatureParts::try_from(Signature { v: valid.v - 27, ..valid }).unwrap();
        assert_eq!(parity.v as u64, valid.v);
    }

    #[test]
    fn raw_digest_signature_recovers_to_signer() {
        let s = signer(SignatureFormat::default());
        assert_eq!(s.address(), TEST_SIGNER.parse::<Address>().unwrap());
        let hash = H256::repeat_byte(0x5a);
        let parts = s.sign(hash).unwrap();
        assert!(parts.v == 27 || parts.v == 28);
        assert_eq!(recover(&parts, hash), s.address());
    }

    #[test]
    fn signing_is_deterministic() {
        let s = signer(SignatureFormat::default());
        let hash = H256::repeat_byte(0x01);
        assert_eq!(s.sign(hash).unwrap(), s.sign(hash).unwrap());
        assert_ne!(s.sign(hash).unwrap(), s.sign(H256::repeat_byte(0x02)).unwrap());
    }

    #[test]
    fn eth_signed_message_signs_prefixed_digest() {
        let s = signer(SignatureFormat {
            scheme: SignatureScheme::EthSignedMessage,
            ..Default::default()
        });
        let hash = H256::repeat_byte(0x77);
        let parts = s.sign(hash).unwrap();
        assert_eq!(recover(&parts, hash_message(hash.as_bytes())), s.address());
        assert_ne!(parts, signer(SignatureFormat::default()).sign(hash).unwrap());
    }

    #[test]
    fn packs_rsv_and_vrs_layouts() {
        let parts = SignatureParts {
            r: [0x11; 32],
            s: [0x22; 32],
            v: 28,
        };
        let rsv = pack_signature(&parts, &SignatureFormat::default());
        assert_eq!(rsv.len(), 65);
        assert_eq!(rsv[0], 0x11);
        assert_eq!(rsv[32], 0x22);
        assert_eq!(rsv[64], 28);

        let vrs = pack_signature(
            &parts,
            &SignatureFormat {
                layout: SignatureLayout::Vrs,
                v_offset: 0,
                ..Default::default()
            },
        );
        assert_eq!(vrs[0], 1);
        assert_eq!(vrs[1], 0x11);
        assert_eq!(vrs[64], 0x22);
    }

    #[test]
    fn format_deserializes_from_camel_case() {
        let f: SignatureFormat =
            serde_json::from_str(r#"{"scheme":"ethSignedMessage","layout":"vrs"}"#).unwrap();
        assert_eq!(f.scheme, SignatureScheme::EthSignedMessage);
        assert_eq!(f.layout, SignatureLayout::Vrs);
        assert_eq!(f.v_offset, 27);
        f.validate().unwrap();

        let bad = SignatureFormat {
            v_offset: 1,
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(UserOpError::SignatureFormatInvalid(_))));
    }

    #[tokio::test]
    async fn owner_check() {
        let node = MockNode::new_arc();
        let s = signer(SignatureFormat::default());
        let sender = Address::repeat_byte(0xf2);
        s.ensure_owner(node.as_ref(), sender).await.unwrap();

        node.state().owner = Address::repeat_byte(0x01);
        let err = s.ensure_owner(node.as_ref(), sender).await.unwrap_err();
        assert!(matches!(err, UserOpError::OwnerMismatch { .. }));
    }

    #[tokio::test]
    async fn erc1271_precheck() {
        let node = MockNode::new_arc();
        let s = signer(SignatureFormat::default());
        let unsigned = crate::builder::OperationBuilder::new(
            Address::repeat_byte(0xf2),
            crate::types::EntryPointVersion::V0_7,
            node.clone(),
        )
        .build(
            &crate::types::Intent::default(),
            U256::zero(),
            &crate::types::GasValues::default(),
        )
        .unwrap();
        let signed = s.sign_operation(unsigned, H256::repeat_byte(9)).unwrap();
        s.precheck(node.as_ref(), &signed).await.unwrap();

        node.state().signature_valid = false;
        let err = s.precheck(node.as_ref(), &signed).await.unwrap_err();
        assert!(matches!(err, UserOpError::SignatureFormatInvalid(_)));
    }
}
