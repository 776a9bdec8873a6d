use aa_userop::config::{load_deployment, Deployment};
use aa_userop::contracts::{encode_init_code, AccountContract, EntryPointContract, RpcChain};
use aa_userop::encoding::{self, error_to_json, outcome_to_json, parse_h256, parse_u256};
use aa_userop::nonce::LockMode;
use aa_userop::signer::OperationSigner;
use aa_userop::types::{FeeSource, Intent};
use aa_userop::{PipelineConfig, RunOptions, RunOutcome, UserOpError, UserOpPipeline};
use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use ethers::providers::{Http, Middleware, Provider};
use ethers::middleware::SignerMiddleware;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "aa-userop", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build, sign, simulate and submit a UserOperation via handleOps.
    Send(SendArgs),

    /// Build and sign a UserOperation; print it with its userOpHash without sending.
    Hash(HashArgs),

    /// Print the account's current nonce for a key.
    Nonce(NonceArgs),
}

impl Command {
    fn json(&self) -> bool {
        match self {
            Command::Send(a) => a.common.json,
            Command::Hash(a) => a.common.json,
            Command::Nonce(a) => a.common.json,
        }
    }
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Deployment file (EntryPoint, account, signature format, gas policy).
    #[arg(long, env = "AA_USEROP_DEPLOYMENT", default_value = "deployments/local.json")]
    deployment: PathBuf,

    /// Override the chain RPC URL (otherwise uses deployment JSON).
    #[arg(long, env = "AA_USEROP_RPC_URL")]
    rpc: Option<String>,

    /// Account owner private key. Also pays for the handleOps transaction.
    ///
    /// Recommended: set via env var AA_USEROP_OWNER_PRIVATE_KEY.
    #[arg(long, env = "AA_USEROP_OWNER_PRIVATE_KEY", hide_env_values = true)]
    owner_private_key: String,

    /// Override the account address from the deployment file.
    #[arg(long, env = "AA_USEROP_ACCOUNT")]
    account: Option<String>,

    /// 192-bit nonce key (decimal or 0x-hex).
    #[arg(long, default_value = "0")]
    nonce_key: String,

    /// Print a single JSON object to stdout; logs stay on stderr.
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug)]
struct IntentArgs {
    /// Call target.
    #[arg(long)]
    to: String,

    /// Wei to send (decimal or 0x-hex).
    #[arg(long, default_value = "0")]
    value: String,

    /// Calldata for the target.
    #[arg(long, default_value = "0x")]
    data: String,

    /// Deploy the account in this operation via the deployment's factory, with
    /// this CREATE2 salt (bytes32 hex).
    #[arg(long)]
    deploy_salt: Option<String>,

    /// Raw paymasterAndData; a sponsored operation skips the balance check.
    #[arg(long)]
    paymaster_and_data: Option<String>,

    /// Fees from eth_gasPrice in basis points (e.g. 15000 = 1.5x) instead of
    /// the deployment's fixed fees.
    #[arg(long, env = "AA_USEROP_GAS_MULTIPLIER_BPS")]
    gas_multiplier_bps: Option<u64>,
}

#[derive(Args, Debug)]
struct SendArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[command(flatten)]
    intent: IntentArgs,

    /// Receives the handleOps refund (defaults to the owner EOA).
    #[arg(long, env = "AA_USEROP_BENEFICIARY")]
    beneficiary: Option<String>,

    /// Build, sign and simulate only.
    #[arg(long)]
    dry_run: bool,

    /// Do not wait for the receipt.
    #[arg(long)]
    no_wait: bool,

    /// Max seconds to wait for the receipt. Use 0 to disable timeout.
    #[arg(long, default_value_t = 180)]
    max_wait_seconds: u64,

    /// Resubmissions after a rejection or timeout.
    #[arg(long, default_value_t = 2)]
    max_retries: u32,

    /// Fail with NoncePending instead of queueing behind an in-flight operation.
    #[arg(long)]
    fail_fast: bool,

    /// Ask the account to validate the signature (ERC-1271) before simulating.
    #[arg(long)]
    check_signature: bool,
}

#[derive(Args, Debug)]
struct HashArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[command(flatten)]
    intent: IntentArgs,
}

#[derive(Args, Debug)]
struct NonceArgs {
    #[command(flatten)]
    common: CommonArgs,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json = cli.cmd.json();

    let res = match cli.cmd {
        Command::Send(args) => cmd_send(args).await,
        Command::Hash(args) => cmd_hash(args).await,
        Command::Nonce(args) => cmd_nonce(args).await,
    };

    if let Err(err) = res {
        if json {
            println!("{}", failure_json(&err));
        } else {
            eprintln!("error: {err:#}");
        }
        std::process::exit(1);
    }
}

fn failure_json(err: &anyhow::Error) -> serde_json::Value {
    match err.downcast_ref::<UserOpError>() {
        Some(e) => error_to_json(e),
        None => serde_json::json!({ "error": "Config", "reason": format!("{err:#}") }),
    }
}

struct Session {
    deployment: Deployment,
    owner: Address,
    pipeline: UserOpPipeline,
}

async fn connect(
    common: &CommonArgs,
    intent: Option<&IntentArgs>,
    tweak: impl FnOnce(&mut PipelineConfig) -> Result<()>,
) -> Result<Session> {
    let dep = load_deployment(&common.deployment, common.rpc.clone())?;

    let provider =
        Provider::<Http>::try_from(dep.rpc_url.as_str())?.interval(Duration::from_millis(350));
    let chain_id = provider.get_chainid().await?.as_u64();
    if chain_id != dep.chain_id {
        return Err(anyhow!(
            "chainId mismatch: deployment has {}, RPC returned {}",
            dep.chain_id,
            chain_id
        ));
    }

    let wallet = LocalWallet::from_str(&common.owner_private_key)
        .context("invalid owner private key")?
        .with_chain_id(chain_id);
    let owner = wallet.address();
    let client = Arc::new(SignerMiddleware::new(provider, wallet.clone()));

    let account = match &common.account {
        Some(a) => Address::from_str(a).context("invalid --account address")?,
        None => dep.account,
    };

    let mut config = PipelineConfig::new(account, owner);
    config.nonce_source = dep.nonce_source;
    config.nonce_key = parse_u256(&common.nonce_key).context("invalid --nonce-key")?;
    config.gas = dep.gas;
    config.min_balance = dep.min_balance;
    config.confirmations = dep.confirmations;
    if let Some(b) = dep.beneficiary {
        config.beneficiary = b;
    }
    if let Some(bps) = intent.and_then(|i| i.gas_multiplier_bps) {
        config.gas.fees = FeeSource::Network { multiplier_bps: bps };
    }
    tweak(&mut config)?;

    tracing::info!(
        chain_id,
        entry_point = %dep.entry_point,
        version = %dep.entry_point_version,
        account = %account,
        owner = %owner,
        "connected"
    );

    let entry_point = EntryPointContract::new(
        dep.entry_point,
        dep.entry_point_version,
        chain_id,
        client.clone(),
    )
    .with_from(owner);
    let pipeline = UserOpPipeline::new(
        Arc::new(entry_point),
        Arc::new(AccountContract::new(client.clone())),
        Arc::new(RpcChain::new(client)),
        OperationSigner::new(Arc::new(wallet), dep.signature),
        config,
    );

    Ok(Session {
        deployment: dep,
        owner,
        pipeline,
    })
}

fn build_intent(args: &IntentArgs, dep: &Deployment, owner: Address) -> Result<Intent> {
    let target = Address::from_str(&args.to).context("invalid --to address")?;
    let value = parse_u256(&args.value).context("invalid --value")?;
    let data = Bytes::from_str(&args.data).context("invalid --data hex")?;
    let mut intent = Intent::new(target, value, data);

    if let Some(salt) = &args.deploy_salt {
        let factory = dep
            .factory
            .ok_or_else(|| anyhow!("--deploy-salt needs a factory in the deployment file"))?;
        let salt = parse_h256(salt).context("invalid --deploy-salt")?;
        intent = intent.with_init_code(encode_init_code(factory, owner, salt));
    }
    if let Some(pm) = &args.paymaster_and_data {
        intent = intent
            .with_paymaster_and_data(Bytes::from_str(pm).context("invalid --paymaster-and-data hex")?);
    }
    Ok(intent)
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted; abandoning confirmation wait");
            trigger.cancel();
        }
    });
    token
}

async fn cmd_send(args: SendArgs) -> Result<()> {
    let beneficiary = args
        .beneficiary
        .as_deref()
        .map(Address::from_str)
        .transpose()
        .context("invalid --beneficiary address")?;

    let session = connect(&args.common, Some(&args.intent), |c| {
        if let Some(b) = beneficiary {
            c.beneficiary = b;
        }
        c.max_retries = args.max_retries;
        c.confirmation_timeout = Duration::from_secs(args.max_wait_seconds);
        c.check_signature = args.check_signature;
        if args.fail_fast {
            c.lock_mode = LockMode::FailFast;
        }
        Ok(())
    })
    .await?;

    let intent = build_intent(&args.intent, &session.deployment, session.owner)?;
    let opts = RunOptions {
        dry_run: args.dry_run,
        wait: !args.no_wait,
        cancel: cancel_on_ctrl_c(),
    };

    let outcome = session.pipeline.run(&intent, &opts).await?;
    let version = session.deployment.entry_point_version;

    if args.common.json {
        println!("{}", outcome_to_json(&outcome, version)?);
        return Ok(());
    }

    match &outcome {
        RunOutcome::DryRun { op, estimate, .. } => {
            println!("dry run: not sending");
            println!("userOpHash: {}", encoding::fmt_h256(outcome.user_op_hash()));
            println!("handleOps gas estimate: {}", estimate.handle_ops_gas);
            println!("required prefund: {} wei (balance {})", estimate.required_prefund, estimate.sender_balance);
            println!(
                "{}",
                serde_json::to_string_pretty(&encoding::user_op_to_json(op, version)?)?
            );
        }
        RunOutcome::Submitted { handle, .. } => {
            println!("userOpHash: {}", encoding::fmt_h256(outcome.user_op_hash()));
            println!(
                "handleOps tx: {} (nonce {}, gas price {})",
                encoding::fmt_h256(handle.tx_hash),
                handle.sender_nonce,
                handle.gas_price
            );
            println!("not waiting for receipt (--no-wait)");
        }
        RunOutcome::Confirmed { receipt, .. } => {
            println!("userOpHash: {}", encoding::fmt_h256(outcome.user_op_hash()));
            println!("handleOps tx: {}", encoding::fmt_h256(receipt.tx_hash));
            println!("included in block {}", receipt.block_number);
            for op in &receipt.user_ops {
                println!(
                    "  op {} success={} actualGasCost={}",
                    encoding::fmt_h256(op.user_op_hash),
                    op.success,
                    op.actual_gas_cost
                );
            }
        }
    }
    Ok(())
}

async fn cmd_hash(args: HashArgs) -> Result<()> {
    let session = connect(&args.common, Some(&args.intent), |_| Ok(())).await?;
    let intent = build_intent(&args.intent, &session.deployment, session.owner)?;

    let signed = session.pipeline.prepare(&intent, 0).await?;
    let version = session.deployment.entry_point_version;
    let out = serde_json::json!({
        "userOpHash": encoding::fmt_h256(signed.user_op_hash()),
        "entryPoint": encoding::fmt_address(session.deployment.entry_point),
        "entryPointVersion": version.to_string(),
        "userOp": encoding::user_op_to_json(signed.operation(), version)?,
    });
    if args.common.json {
        println!("{out}");
    } else {
        println!("{}", serde_json::to_string_pretty(&out)?);
    }
    Ok(())
}

async fn cmd_nonce(args: NonceArgs) -> Result<()> {
    let session = connect(&args.common, None, |_| Ok(())).await?;
    let cfg = session.pipeline.config();
    let nonce = session
        .pipeline
        .resolver()
        .resolve(cfg.sender, cfg.nonce_key)
        .await?;
    if args.common.json {
        println!(
            "{}",
            serde_json::json!({
                "account": encoding::fmt_address(cfg.sender),
                "key": encoding::fmt_u256(cfg.nonce_key),
                "nonce": encoding::fmt_u256(nonce),
            })
        );
    } else {
        println!("{nonce}");
    }
    Ok(())
}
