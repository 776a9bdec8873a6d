use crate::nonce::NonceSource;
use crate::signer::SignatureFormat;
use crate::types::{
    EntryPointVersion, FeeSource, GasPolicy, DEFAULT_MAX_FEE_PER_GAS,
    DEFAULT_MAX_PRIORITY_FEE_PER_GAS,
};
use anyhow::{anyhow, bail, Context, Result};
use ethers::types::{Address, U256};
use serde::Deserialize;
use std::{env, fs, path::Path};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRaw {
    pub chain_id: u64,
    pub rpc: String,
    #[serde(default)]
    pub rpc_env_var: Option<String>,
    pub entry_point: String,
    #[serde(default)]
    pub entry_point_version: EntryPointVersion,
    pub account: String,
    #[serde(default)]
    pub beneficiary: Option<String>,
    #[serde(default)]
    pub factory: Option<String>,
    #[serde(default)]
    pub nonce_source: NonceSource,
    #[serde(default)]
    pub signature: SignatureFormat,
    #[serde(default)]
    pub gas: GasRaw,
    /// Decimal or 0x-hex wei.
    #[serde(default)]
    pub min_balance_wei: Option<String>,
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
}

fn default_confirmations() -> u64 {
    1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GasRaw {
    pub call_gas_limit: u64,
    pub verification_gas_limit: u64,
    pub pre_verification_gas: u64,
    pub max_fee_per_gas: Option<u64>,
    pub max_priority_fee_per_gas: Option<u64>,
    /// When set, fees follow `eth_gasPrice` instead of the fixed values.
    pub multiplier_bps: Option<u64>,
    pub bump_bps: u64,
}

impl Default for GasRaw {
    fn default() -> Self {
        let policy = GasPolicy::default();
        Self {
            call_gas_limit: policy.call_gas_limit.as_u64(),
            verification_gas_limit: policy.verification_gas_limit.as_u64(),
            pre_verification_gas: policy.pre_verification_gas.as_u64(),
            max_fee_per_gas: None,
            max_priority_fee_per_gas: None,
            multiplier_bps: None,
            bump_bps: policy.bump_bps,
        }
    }
}

impl GasRaw {
    pub fn to_policy(&self) -> GasPolicy {
        let fees = match self.multiplier_bps {
            Some(multiplier_bps) => FeeSource::Network { multiplier_bps },
            None => FeeSource::Fixed {
                max_fee_per_gas: U256::from(self.max_fee_per_gas.unwrap_or(DEFAULT_MAX_FEE_PER_GAS)),
                max_priority_fee_per_gas: U256::from(
                    self.max_priority_fee_per_gas
                        .unwrap_or(DEFAULT_MAX_PRIORITY_FEE_PER_GAS),
                ),
            },
        };
        GasPolicy {
            call_gas_limit: U256::from(self.call_gas_limit),
            verification_gas_limit: U256::from(self.verification_gas_limit),
            pre_verification_gas: U256::from(self.pre_verification_gas),
            fees,
            bump_bps: self.bump_bps,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Deployment {
    pub chain_id: u64,
    pub rpc_url: String,
    pub entry_point: Address,
    pub entry_point_version: EntryPointVersion,
    pub account: Address,
    pub beneficiary: Option<Address>,
    pub factory: Option<Address>,
    pub nonce_source: NonceSource,
    pub signature: SignatureFormat,
    pub gas: GasPolicy,
    pub min_balance: U256,
    pub confirmations: u64,
}

pub fn load_deployment(path: &Path, rpc_override: Option<String>) -> Result<Deployment> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read deployment json at {}", path.display()))?;
    parse_deployment(&raw, rpc_override)
        .with_context(|| format!("invalid deployment json at {}", path.display()))
}

pub fn parse_deployment(json: &str, rpc_override: Option<String>) -> Result<Deployment> {
    let raw: DeploymentRaw = serde_json::from_str(json).context("failed to parse deployment json")?;

    let rpc_url = if let Some(rpc) = rpc_override {
        rpc
    } else if let Some(env_var) = raw.rpc_env_var.clone() {
        env::var(&env_var).unwrap_or(raw.rpc.clone())
    } else {
        raw.rpc.clone()
    };

    let entry_point = parse_addr(&raw.entry_point).context("invalid entryPoint address")?;
    let account = parse_addr(&raw.account).context("invalid account address")?;
    let beneficiary = raw
        .beneficiary
        .as_deref()
        .map(parse_addr)
        .transpose()
        .context("invalid beneficiary address")?;
    let factory = raw
        .factory
        .as_deref()
        .map(parse_addr)
        .transpose()
        .context("invalid factory address")?;

    let min_balance = match raw.min_balance_wei.as_deref() {
        Some(s) => crate::encoding::parse_u256(s).context("invalid minBalanceWei")?,
        None => U256::zero(),
    };

    if raw.confirmations == 0 {
        bail!("confirmations must be at least 1");
    }
    raw.signature.validate()?;

    Ok(Deployment {
        chain_id: raw.chain_id,
        rpc_url,
        entry_point,
        entry_point_version: raw.entry_point_version,
        account,
        beneficiary,
        factory,
        nonce_source: raw.nonce_source,
        signature: raw.signature,
        gas: raw.gas.to_policy(),
        min_balance,
        confirmations: raw.confirmations,
    })
}

fn parse_addr(s: &str) -> Result<Address> {
    s.parse::<Address>().map_err(|e| anyhow!("{e}"))
}
