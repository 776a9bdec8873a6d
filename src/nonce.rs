use crate::contracts::{AccountApi, CallError, ChainApi, EntryPointApi};
use crate::error::{Result, UserOpError};
use ethers::types::{Address, U256};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Where the anti-replay counter lives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NonceSource {
    /// `EntryPoint.getNonce(sender, key)` (keyed 2D nonce).
    #[default]
    EntryPoint,
    /// Legacy account-held `nonce()`; has no key space.
    Account,
}

/// Reads the current nonce. Never caches: every build must call [`NonceResolver::resolve`].
#[derive(Clone)]
pub struct NonceResolver {
    source: NonceSource,
    entry_point: Arc<dyn EntryPointApi>,
    account: Arc<dyn AccountApi>,
    chain: Arc<dyn ChainApi>,
}

impl NonceResolver {
    pub fn new(
        source: NonceSource,
        entry_point: Arc<dyn EntryPointApi>,
        account: Arc<dyn AccountApi>,
        chain: Arc<dyn ChainApi>,
    ) -> Self {
        Self {
            source,
            entry_point,
            account,
            chain,
        }
    }

    pub fn source(&self) -> NonceSource {
        self.source
    }

    pub async fn resolve(&self, sender: Address, key: U256) -> Result<U256> {
        let unavailable = |reason: String| UserOpError::NonceUnavailable { sender, reason };

        let nonce = match self.source {
            NonceSource::EntryPoint => {
                if key.bits() > 192 {
                    return Err(unavailable(format!("nonce key {key:#x} exceeds 192 bits")));
                }
                self.entry_point
                    .get_nonce(sender, key)
                    .await
                    .map_err(|e| unavailable(format!("entryPoint.getNonce failed: {e}")))?
            }
            NonceSource::Account => {
                if !key.is_zero() {
                    return Err(unavailable(
                        "account-held nonce has no key space; use key 0".to_string(),
                    ));
                }
                let deployed = self
                    .chain
                    .is_deployed(sender)
                    .await
                    .map_err(|e| unavailable(format!("eth_getCode failed: {e}")))?;
                if !deployed {
                    return Err(unavailable("account is not deployed".to_string()));
                }
                self.account
                    .nonce(sender)
                    .await
                    .map_err(|e| match e {
                        CallError::Reverted(_) => unavailable("account.nonce() reverted".to_string()),
                        other => unavailable(format!("account.nonce() failed: {other}")),
                    })?
            }
        };

        tracing::debug!(sender = %sender, key = %key, nonce = %nonce, source = ?self.source, "resolved nonce");
        Ok(nonce)
    }

    /// Like [`resolve`](Self::resolve), but an undeployed account that ships its own
    /// `initCode` starts at nonce 0.
    pub async fn resolve_for_build(
        &self,
        sender: Address,
        key: U256,
        init_code_present: bool,
    ) -> Result<U256> {
        match self.resolve(sender, key).await {
            Ok(n) => Ok(n),
            Err(err @ UserOpError::NonceUnavailable { .. }) if init_code_present => {
                let deployed = self.chain.is_deployed(sender).await.unwrap_or(true);
                if deployed {
                    return Err(err);
                }
                tracing::info!(sender = %sender, "account not deployed; using nonce 0 with initCode");
                Ok(U256::zero())
            }
            Err(err) => Err(err),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LockMode {
    /// Queue behind the in-flight operation.
    #[default]
    Wait,
    /// Return `NoncePending` immediately.
    FailFast,
}

type SlotMap = HashMap<(Address, U256), Arc<Mutex<()>>>;

/// At most one unconfirmed operation per `(sender, key)`. A slot lives in the map
/// only while someone holds or waits for it.
#[derive(Debug, Default)]
pub struct NonceLocks {
    slots: Arc<StdMutex<SlotMap>>,
}

/// Held for the whole build-submit-confirm run; dropping it releases the slot.
#[derive(Debug)]
pub struct NonceGuard {
    pub sender: Address,
    pub key: U256,
    slots: Arc<StdMutex<SlotMap>>,
    slot: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl NonceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, sender: Address, key: U256, mode: LockMode) -> Result<NonceGuard> {
        let slot = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((sender, key))
            .or_default()
            .clone();

        let guard = match mode {
            LockMode::Wait => slot.clone().lock_owned().await,
            LockMode::FailFast => slot
                .clone()
                .try_lock_owned()
                .map_err(|_| UserOpError::NoncePending { sender, key })?,
        };

        Ok(NonceGuard {
            sender,
            key,
            slots: self.slots.clone(),
            slot,
            guard: Some(guard),
        })
    }
}

impl Drop for NonceGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the map and this guard still point at the slot: nobody is queued.
        if Arc::strong_count(&self.slot) == 2 {
            slots.remove(&(self.sender, self.key));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockNode;
    use std::time::Duration;

    fn resolver(node: &Arc<MockNode>, source: NonceSource) -> NonceResolver {
        NonceResolver::new(source, node.clone(), node.clone(), node.clone())
    }

    #[tokio::test]
    async fn reads_keyed_entrypoint_nonce() {
        let node = MockNode::new_arc();
        let sender = Address::repeat_byte(0xaa);
        node.set_nonce(sender, U256::from(7u64), U256::from(3u64));

        let r = resolver(&node, NonceSource::EntryPoint);
        assert_eq!(r.resolve(sender, U256::zero()).await.unwrap(), U256::zero());
        assert_eq!(r.resolve(sender, U256::from(7u64)).await.unwrap(), U256::from(3u64));
    }

    #[tokio::test]
    async fn rereads_on_every_call() {
        let node = MockNode::new_arc();
        let sender = Address::repeat_byte(0xaa);
        let r = resolver(&node, NonceSource::EntryPoint);
        assert_eq!(r.resolve(sender, U256::zero()).await.unwrap(), U256::zero());
        node.set_nonce(sender, U256::zero(), U256::from(1u64));
        assert_eq!(r.resolve(sender, U256::zero()).await.unwrap(), U256::one());
    }

    #[tokio::test]
    async fn query_failure_is_nonce_unavailable() {
        let node = MockNode::new_arc();
        node.state().nonce_error = Some(CallError::Transport("connection reset".into()));
        let err = resolver(&node, NonceSource::EntryPoint)
            .resolve(Address::repeat_byte(0xaa), U256::zero())
            .await
            .unwrap_err();
        assert!(matches!(err, UserOpError::NonceUnavailable { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn oversized_key_rejected() {
        let node = MockNode::new_arc();
        let err = resolver(&node, NonceSource::EntryPoint)
            .resolve(Address::repeat_byte(0xaa), U256::one() << 192)
            .await
            .unwrap_err();
        assert!(matches!(err, UserOpError::NonceUnavailable { .. }));
    }

    #[tokio::test]
    async fn account_source_requires_deployment() {
        let node = MockNode::new_arc();
        let sender = Address::repeat_byte(0xbb);
        node.state().undeployed.insert(sender);
        let r = resolver(&node, NonceSource::Account);

        let err = r.resolve(sender, U256::zero()).await.unwrap_err();
        assert!(matches!(err, UserOpError::NonceUnavailable { .. }));

        assert_eq!(
            r.resolve_for_build(sender, U256::zero(), true).await.unwrap(),
            U256::zero()
        );
        assert!(r.resolve_for_build(sender, U256::zero(), false).await.is_err());
    }

    #[tokio::test]
    async fn account_source_reads_account_counter() {
        let node = MockNode::new_arc();
        let sender = Address::repeat_byte(0xbb);
        node.set_nonce(sender, U256::zero(), U256::from(12u64));
        let r = resolver(&node, NonceSource::Account);
        assert_eq!(r.resolve(sender, U256::zero()).await.unwrap(), U256::from(12u64));
        assert!(r.resolve(sender, U256::one()).await.is_err());
    }

    #[tokio::test]
    async fn fail_fast_lock_reports_pending() {
        let locks = NonceLocks::new();
        let sender = Address::repeat_byte(0xaa);
        let held = locks
            .acquire(sender, U256::zero(), LockMode::FailFast)
            .await
            .unwrap();

        let err = locks
            .acquire(sender, U256::zero(), LockMode::FailFast)
            .await
            .unwrap_err();
        assert!(matches!(err, UserOpError::NoncePending { .. }));

        // Different key is an independent queue.
        locks
            .acquire(sender, U256::one(), LockMode::FailFast)
            .await
            .unwrap();

        drop(held);
        locks
            .acquire(sender, U256::zero(), LockMode::FailFast)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn wait_lock_queues_until_release() {
        let locks = Arc::new(NonceLocks::new());
        let sender = Address::repeat_byte(0xaa);
        let held = locks.acquire(sender, U256::zero(), LockMode::Wait).await.unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire(sender, U256::zero(), LockMode::Wait).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        let guard = waiter.await.unwrap().unwrap();
        assert_eq!(guard.sender, sender);
    }

    fn slot_count(locks: &NonceLocks) -> usize {
        locks.slots.lock().unwrap().len()
    }

    #[tokio::test]
    async fn released_slots_are_pruned() {
        let locks = Arc::new(NonceLocks::new());
        for byte in 1..=50u8 {
            let guard = locks
                .acquire(Address::repeat_byte(byte), U256::zero(), LockMode::FailFast)
                .await
                .unwrap();
            assert_eq!(slot_count(&locks), 1);
            drop(guard);
        }
        assert_eq!(slot_count(&locks), 0);

        // A queued waiter keeps the slot alive across the holder's release.
        let sender = Address::repeat_byte(0xaa);
        let held = locks.acquire(sender, U256::zero(), LockMode::Wait).await.unwrap();
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire(sender, U256::zero(), LockMode::Wait).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        assert_eq!(slot_count(&locks), 1);

        let next = waiter.await.unwrap().unwrap();
        let err = locks
            .acquire(sender, U256::zero(), LockMode::FailFast)
            .await
            .unwrap_err();
        assert!(matches!(err, UserOpError::NoncePending { .. }));
        drop(next);
        assert_eq!(slot_count(&locks), 0);
    }
}
