//! Resolve nonce, build, hash, sign, preflight, submit, confirm.
//!
//! One run holds the `(sender, key)` lock from nonce resolution until the receipt
//! (or, with `wait = false`, hands the lock to the caller inside
//! [`RunOutcome::Submitted`]). Only submission rejections and confirmation
//! timeouts are retried, and every retry re-resolves the nonce and re-signs.
//! A retry after a timeout replaces the stuck `handleOps` transaction: same outer
//! nonce, higher gas price.

use crate::builder::{resolve_gas, OperationBuilder, SignedUserOperation};
use crate::contracts::{AccountApi, ChainApi, EntryPointApi, Replacement, TxOverrides};
use crate::error::{Result, UserOpError};
use crate::hasher::CanonicalHasher;
use crate::nonce::{LockMode, NonceGuard, NonceLocks, NonceResolver, NonceSource};
use crate::preflight::PreflightEstimator;
use crate::signer::OperationSigner;
use crate::submitter::{replacement_gas_price, Submitter};
use crate::types::{GasEstimate, GasPolicy, Intent, Receipt, TransactionHandle, UserOperation};
use ethers::types::{Address, H256, U256};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub sender: Address,
    /// Receives the EntryPoint's gas refund.
    pub beneficiary: Address,
    pub nonce_source: NonceSource,
    pub nonce_key: U256,
    pub lock_mode: LockMode,
    pub gas: GasPolicy,
    pub min_balance: U256,
    /// Headroom on the estimated `handleOps` gas, in basis points.
    pub handle_ops_gas_buffer_bps: u64,
    pub max_retries: u32,
    pub confirmation_timeout: Duration,
    pub confirmations: u64,
    pub poll_interval: Duration,
    pub check_owner: bool,
    /// Ask the account (ERC-1271) to validate the signature before simulating.
    pub check_signature: bool,
}

impl PipelineConfig {
    pub fn new(sender: Address, beneficiary: Address) -> Self {
        Self {
            sender,
            beneficiary,
            nonce_source: NonceSource::EntryPoint,
            nonce_key: U256::zero(),
            lock_mode: LockMode::Wait,
            gas: GasPolicy::default(),
            min_balance: U256::zero(),
            handle_ops_gas_buffer_bps: 2_000,
            max_retries: 2,
            confirmation_timeout: Duration::from_secs(120),
            confirmations: 1,
            poll_interval: Duration::from_secs(2),
            check_owner: true,
            check_signature: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RunOptions {
    /// Stop after preflight; nothing is broadcast.
    pub dry_run: bool,
    pub wait: bool,
    pub cancel: CancellationToken,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            wait: true,
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    DryRun {
        op: UserOperation,
        user_op_hash: H256,
        estimate: GasEstimate,
    },
    /// Broadcast but not awaited. `pending` keeps the nonce slot reserved until it
    /// is passed to [`UserOpPipeline::confirm`] or dropped.
    Submitted {
        op: UserOperation,
        user_op_hash: H256,
        handle: TransactionHandle,
        pending: NonceGuard,
    },
    Confirmed {
        op: UserOperation,
        user_op_hash: H256,
        handle: TransactionHandle,
        receipt: Receipt,
    },
}

impl RunOutcome {
    pub fn operation(&self) -> &UserOperation {
        match self {
            RunOutcome::DryRun { op, .. }
            | RunOutcome::Submitted { op, .. }
            | RunOutcome::Confirmed { op, .. } => op,
        }
    }

    pub fn user_op_hash(&self) -> H256 {
        match self {
            RunOutcome::DryRun { user_op_hash, .. }
            | RunOutcome::Submitted { user_op_hash, .. }
            | RunOutcome::Confirmed { user_op_hash, .. } => *user_op_hash,
        }
    }
}

pub struct UserOpPipeline {
    account: Arc<dyn AccountApi>,
    chain: Arc<dyn ChainApi>,
    resolver: NonceResolver,
    builder: OperationBuilder,
    hasher: CanonicalHasher,
    signer: OperationSigner,
    preflight: PreflightEstimator,
    submitter: Submitter,
    locks: Arc<NonceLocks>,
    config: PipelineConfig,
}

impl UserOpPipeline {
    pub fn new(
        entry_point: Arc<dyn EntryPointApi>,
        account: Arc<dyn AccountApi>,
        chain: Arc<dyn ChainApi>,
        signer: OperationSigner,
        config: PipelineConfig,
    ) -> Self {
        let resolver = NonceResolver::new(
            config.nonce_source,
            entry_point.clone(),
            account.clone(),
            chain.clone(),
        );
        let builder = OperationBuilder::new(config.sender, entry_point.version(), account.clone());
        let hasher = CanonicalHasher::new(entry_point.clone());
        let preflight = PreflightEstimator::new(entry_point.clone(), chain.clone())
            .with_min_balance(config.min_balance);
        let submitter = Submitter::new(entry_point, chain.clone())
            .with_poll_interval(config.poll_interval)
            .with_confirmations(config.confirmations);

        Self {
            account,
            chain,
            resolver,
            builder,
            hasher,
            signer,
            preflight,
            submitter,
            locks: Arc::new(NonceLocks::new()),
            config,
        }
    }

    /// Shares nonce slots with other pipelines for the same accounts.
    pub fn with_locks(mut self, locks: Arc<NonceLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn locks(&self) -> &Arc<NonceLocks> {
        &self.locks
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn resolver(&self) -> &NonceResolver {
        &self.resolver
    }

    pub fn hasher(&self) -> &CanonicalHasher {
        &self.hasher
    }

    /// Fresh nonce, gas for `attempt`, build, authoritative hash, signature.
    pub async fn prepare(&self, intent: &Intent, attempt: u32) -> Result<SignedUserOperation> {
        let sender = self.config.sender;
        let nonce = self
            .resolver
            .resolve_for_build(sender, self.config.nonce_key, !intent.init_code.is_empty())
            .await?;
        let gas = resolve_gas(&self.config.gas, self.chain.as_ref(), attempt).await?;
        let unsigned = self.builder.build(intent, nonce, &gas)?;
        let user_op_hash = self.hasher.hash(unsigned.operation()).await?;
        let signed = self.signer.sign_operation(unsigned, user_op_hash)?;

        if self.config.check_signature {
            self.signer.precheck(self.account.as_ref(), &signed).await?;
        }

        tracing::info!(
            sender = %sender,
            nonce = %nonce,
            attempt,
            user_op_hash = %format!("{user_op_hash:#x}"),
            "user operation signed"
        );
        Ok(signed)
    }

    pub async fn run(&self, intent: &Intent, opts: &RunOptions) -> Result<RunOutcome> {
        let cfg = &self.config;
        let guard = self
            .locks
            .acquire(cfg.sender, cfg.nonce_key, cfg.lock_mode)
            .await?;

        if cfg.check_owner && intent.init_code.is_empty() {
            self.signer
                .ensure_owner(self.account.as_ref(), cfg.sender)
                .await?;
        }

        let mut attempt = 0u32;
        let mut replace: Option<Replacement> = None;
        // Broadcasts a replacement superseded; any of them may still be the one mined.
        let mut superseded: Vec<(SignedUserOperation, TransactionHandle)> = Vec::new();
        loop {
            let signed = self.prepare(intent, attempt).await?;
            let estimate = self.preflight.estimate(&signed, cfg.beneficiary).await?;

            if opts.dry_run {
                return Ok(RunOutcome::DryRun {
                    user_op_hash: signed.user_op_hash(),
                    op: signed.into_operation(),
                    estimate,
                });
            }

            let gas_limit = estimate
                .handle_ops_gas
                .saturating_mul(U256::from(10_000 + cfg.handle_ops_gas_buffer_bps))
                / U256::from(10_000u64);
            let overrides = TxOverrides {
                gas_limit: Some(gas_limit),
                replace,
            };

            let handle = match self
                .submitter
                .submit(std::slice::from_ref(&signed), cfg.beneficiary, overrides)
                .await
            {
                Ok(handle) => handle,
                Err(err @ UserOpError::SubmissionRejected(_)) if attempt < cfg.max_retries => {
                    if let Some(r) = replace.as_mut() {
                        r.gas_price = replacement_gas_price(r.gas_price, cfg.gas.bump_bps);
                    }
                    tracing::warn!(attempt, error = %err, "submission rejected; rebuilding");
                    attempt += 1;
                    continue;
                }
                Err(err) => return Err(err),
            };

            if !opts.wait {
                return Ok(RunOutcome::Submitted {
                    user_op_hash: signed.user_op_hash(),
                    op: signed.into_operation(),
                    handle,
                    pending: guard,
                });
            }

            match self
                .submitter
                .await_confirmation(&handle, cfg.confirmation_timeout, &opts.cancel)
                .await
            {
                Ok(receipt) => {
                    return Ok(RunOutcome::Confirmed {
                        user_op_hash: signed.user_op_hash(),
                        op: signed.into_operation(),
                        handle,
                        receipt,
                    })
                }
                Err(err @ UserOpError::ConfirmationTimeout { .. }) if attempt < cfg.max_retries => {
                    // Late inclusion wins over a resubmit.
                    let mut candidates = vec![(&signed, &handle)];
                    candidates.extend(superseded.iter().rev().map(|(op, sent)| (op, sent)));
                    for (op, sent) in candidates {
                        if let Some(receipt) = self.submitter.lookup(sent).await? {
                            return Ok(RunOutcome::Confirmed {
                                user_op_hash: op.user_op_hash(),
                                op: op.operation().clone(),
                                handle: sent.clone(),
                                receipt,
                            });
                        }
                    }
                    let current = self
                        .resolver
                        .resolve_for_build(cfg.sender, cfg.nonce_key, !intent.init_code.is_empty())
                        .await?;
                    if current != signed.operation().nonce {
                        tracing::error!(
                            tx_hash = %format!("{:#x}", handle.tx_hash),
                            submitted_nonce = %signed.operation().nonce,
                            current_nonce = %current,
                            "nonce advanced without a visible receipt; not resubmitting"
                        );
                        return Err(err);
                    }
                    let next = Replacement {
                        nonce: handle.sender_nonce,
                        gas_price: replacement_gas_price(handle.gas_price, cfg.gas.bump_bps),
                    };
                    tracing::warn!(
                        attempt,
                        error = %err,
                        tx_nonce = %next.nonce,
                        gas_price = %next.gas_price,
                        "not included; replacing with bumped fees"
                    );
                    replace = Some(next);
                    superseded.push((signed, handle));
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Waits for a transaction returned by a `wait = false` run, then frees its slot.
    pub async fn confirm(
        &self,
        handle: &TransactionHandle,
        pending: NonceGuard,
        cancel: &CancellationToken,
    ) -> Result<Receipt> {
        let receipt = self
            .submitter
            .await_confirmation(handle, self.config.confirmation_timeout, cancel)
            .await;
        drop(pending);
        receipt
    }
}
