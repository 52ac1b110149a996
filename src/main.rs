use aa_signer::address::AddressResolver;
use aa_signer::builder::GasPolicy;
use aa_signer::config::{load_deployment, Deployment};
use aa_signer::contracts::{EntryPoint, VerifyingPaymaster};
use aa_signer::encoding;
use aa_signer::funding;
use aa_signer::paymaster::{PaymasterAuthorizer, PaymasterSigner, DEFAULT_VALIDITY_WINDOW};
use aa_signer::relay::RelayClient;
use aa_signer::sender::{DirectSender, OperationSender, RelaySender};
use aa_signer::types::{Call, GasLimits};
use aa_signer::AaSigner;
use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use ethers::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

type Client = SignerMiddleware<Provider<Http>, LocalWallet>;

// In --json mode stdout carries a single JSON object; human-readable lines go to stderr.
macro_rules! outln {
    ($machine_mode:expr, $($arg:tt)*) => {{
        if $machine_mode {
            eprintln!($($arg)*);
        } else {
            println!($($arg)*);
        }
    }};
}

#[derive(Parser, Debug)]
#[command(name = "aa-signer", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the owner, counterfactual smart account address and deployment status.
    Account(AccountArgs),

    /// Build, sign and send a UserOperation that executes one call from the smart account.
    Send(SendArgs),

    /// Print the entry-point deposit of an address (defaults to the smart account).
    Balance(BalanceArgs),

    /// Deposit ETH into the entry point for the smart account or the paymaster.
    Deposit(DepositArgs),

    /// Send ETH to the smart account so its native balance reaches a target.
    Fund(FundArgs),

    /// Stake the verifying paymaster in the entry point.
    Stake(StakeArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Deployment artifact (entry point, factory, paymaster, relay).
    #[arg(long, default_value = "deployments/local.json", env = "AA_DEPLOYMENT")]
    deployment: PathBuf,

    /// Override the chain RPC URL (otherwise uses deployment JSON).
    #[arg(long, env = "AA_RPC_URL")]
    rpc: Option<String>,

    /// Smart account owner private key.
    #[arg(long, env = "AA_OWNER_PRIVATE_KEY", hide_env_values = true)]
    owner_private_key: Option<String>,

    /// Key that sends native transactions (handleOps, deposits, funding).
    ///
    /// Defaults to the owner key.
    #[arg(long, env = "AA_RELAYER_PRIVATE_KEY", hide_env_values = true)]
    relayer_private_key: Option<String>,

    /// CREATE2 salt for the smart account.
    #[arg(long, default_value_t = 0, env = "AA_SALT")]
    salt: u64,

    /// Print a single JSON object to stdout; all other output goes to stderr.
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug)]
struct AccountArgs {
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Transport {
    /// Call entryPoint.handleOps from the relayer key.
    Direct,
    /// Submit through the relay's eth_sendUserOperation.
    Relay,
}

#[derive(Args, Debug)]
struct SendArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Call target.
    #[arg(long)]
    to: String,

    /// Value in ETH (decimal string).
    #[arg(long, default_value = "0")]
    value: String,

    /// Call data (hex).
    #[arg(long, default_value = "0x")]
    data: String,

    #[arg(long, value_enum, default_value_t = Transport::Relay)]
    transport: Transport,

    /// Relay RPC URL (overrides the deployment's `relay`).
    #[arg(long, env = "AA_RELAY_URL")]
    relay: Option<String>,

    /// Receiver of the handleOps gas refund (direct transport). Defaults to the relayer.
    #[arg(long)]
    beneficiary: Option<String>,

    /// Sponsor gas with the deployment's verifying paymaster.
    #[arg(long, default_value_t = false)]
    paymaster: bool,

    /// Paymaster signer private key (required with --paymaster).
    #[arg(long, env = "AA_PAYMASTER_PRIVATE_KEY", hide_env_values = true)]
    paymaster_private_key: Option<String>,

    /// Seconds the paymaster sponsorship stays valid.
    #[arg(
        long,
        default_value_t = DEFAULT_VALIDITY_WINDOW,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    paymaster_window: u64,

    /// Fixed callGasLimit (skips relay estimation when all three limits are set).
    #[arg(long)]
    call_gas: Option<u64>,

    /// Fixed verificationGasLimit.
    #[arg(long)]
    verification_gas: Option<u64>,

    /// Fixed preVerificationGas.
    #[arg(long)]
    pre_verification_gas: Option<u64>,

    /// Gas price multiplier in basis points (e.g. 15000 = 1.5x).
    ///
    /// Applied to maxFeePerGas and maxPriorityFeePerGas.
    #[arg(
        long,
        default_value_t = 10000,
        env = "AA_GAS_MULTIPLIER_BPS",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    gas_multiplier_bps: u64,

    /// Send type-0 transactions for handleOps (direct transport).
    #[arg(long, default_value_t = false)]
    legacy: bool,

    /// Build, authorize and sign, then print the operation instead of sending it.
    #[arg(long)]
    dry_run: bool,

    /// Max seconds to wait for the receipt.
    #[arg(long, default_value_t = 120)]
    max_wait_seconds: u64,
}

#[derive(Args, Debug)]
struct BalanceArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Address to query (defaults to the smart account).
    #[arg(long)]
    address: Option<String>,
}

#[derive(Args, Debug)]
struct DepositArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Deposit for the deployment's paymaster instead of the smart account.
    #[arg(long, default_value_t = false)]
    paymaster: bool,

    /// Amount in ETH.
    #[arg(long, default_value = "0")]
    amount: String,

    /// Top the deposit up to this many ETH instead; skip when already met.
    #[arg(long)]
    min: Option<String>,
}

#[derive(Args, Debug)]
struct FundArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Target native balance in ETH.
    #[arg(long)]
    min: String,
}

#[derive(Args, Debug)]
struct StakeArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Stake in ETH.
    #[arg(long)]
    amount: String,

    /// Unstake delay in seconds.
    #[arg(long, default_value_t = 86400)]
    unstake_delay: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        // Always write logs to stderr so stdout can be used for script-friendly outputs.
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Command::Account(args) => cmd_account(args).await,
        Command::Send(args) => cmd_send(args).await,
        Command::Balance(args) => cmd_balance(args).await,
        Command::Deposit(args) => cmd_deposit(args).await,
        Command::Fund(args) => cmd_fund(args).await,
        Command::Stake(args) => cmd_stake(args).await,
    }
}

/// Deployment, node connection and signing client shared by every command.
struct Session {
    dep: Deployment,
    client: Arc<Client>,
    owner: Option<LocalWallet>,
}

impl Session {
    async fn open(common: &CommonArgs) -> Result<Self> {
        let dep = load_deployment(&common.deployment, common.rpc.clone())?;

        let provider = Provider::<Http>::try_from(dep.rpc_url.as_str())
            .with_context(|| format!("invalid RPC URL {}", dep.rpc_url))?
            .interval(Duration::from_millis(350));

        let chain_id = provider
            .get_chainid()
            .await
            .context("failed to fetch chainId")?
            .as_u64();
        dep.ensure_chain_id(chain_id)?;

        let owner = common
            .owner_private_key
            .as_deref()
            .map(|k| parse_wallet(k, chain_id).context("invalid owner private key"))
            .transpose()?;
        let relayer = match common.relayer_private_key.as_deref() {
            Some(k) => parse_wallet(k, chain_id).context("invalid relayer private key")?,
            None => owner
                .clone()
                .ok_or_else(|| anyhow!("set AA_OWNER_PRIVATE_KEY or AA_RELAYER_PRIVATE_KEY"))?,
        };

        let client = Arc::new(SignerMiddleware::new(provider, relayer));
        Ok(Self { dep, client, owner })
    }

    fn owner(&self) -> Result<LocalWallet> {
        self.owner
            .clone()
            .ok_or_else(|| anyhow!("owner key required: set AA_OWNER_PRIVATE_KEY"))
    }

    fn resolver(&self) -> AddressResolver<Client> {
        match &self.dep.proxy {
            Some(template) => AddressResolver::Create2(template.clone()),
            None => AddressResolver::Factory(self.client.clone()),
        }
    }

    fn paymaster(&self) -> Result<Address> {
        self.dep
            .verifying_paymaster
            .ok_or_else(|| anyhow!("deployment has no verifyingPaymaster"))
    }

    async fn smart_account(&self, salt: u64) -> Result<Address> {
        let owner = self.owner()?;
        self.resolver()
            .resolve(self.dep.account_factory, owner.address(), U256::from(salt))
            .await
            .context("failed to resolve smart account address")
    }
}

async fn cmd_account(args: AccountArgs) -> Result<()> {
    let machine_mode = args.common.json;
    let session = Session::open(&args.common).await?;
    let owner = session.owner()?.address();
    let account = session.smart_account(args.common.salt).await?;

    let code = session
        .client
        .get_code(account, None)
        .await
        .context("eth_getCode failed")?;
    let deployed = !code.as_ref().is_empty();

    if machine_mode {
        let out = serde_json::json!({
            "owner": encoding::fmt_address(owner),
            "smartAccount": encoding::fmt_address(account),
            "deployed": deployed,
            "salt": args.common.salt,
        });
        println!("{}", out);
    }

    outln!(machine_mode, "chainId:        {}", session.dep.chain_id);
    outln!(machine_mode, "entryPoint:     {:?}", session.dep.entry_point);
    outln!(machine_mode, "factory:        {:?}", session.dep.account_factory);
    outln!(machine_mode, "owner:          {:?}", owner);
    outln!(machine_mode, "smartAccount:   {:?}", account);
    outln!(machine_mode, "isDeployed:     {}", deployed);

    Ok(())
}

async fn cmd_send(args: SendArgs) -> Result<()> {
    let machine_mode = args.common.json;
    let session = Session::open(&args.common).await?;
    let dep = &session.dep;
    let config = dep.client_config(U256::from(args.common.salt));
    let receipt_timeout = Duration::from_secs(args.max_wait_seconds);

    let to = parse_addr(&args.to).context("invalid --to address")?;
    let value = ethers::utils::parse_ether(&args.value)
        .with_context(|| format!("invalid --value: {}", args.value))?;
    let data = encoding::parse_hex_bytes(&args.data).context("invalid --data")?;
    let call = Call::new(to).value(value).data(data);

    let relay_url = args.relay.clone().or_else(|| dep.relay_url.clone());
    let relay = relay_url.map(RelayClient::new);

    let gas = gas_policy(&args, relay.clone())?;

    let sender = match args.transport {
        Transport::Relay => {
            let relay = relay
                .clone()
                .ok_or_else(|| anyhow!("relay transport needs --relay or deployment `relay`"))?;
            // Fails here, before anything is built, if the relay does not serve our entry point.
            OperationSender::Relay(
                RelaySender::connect(relay, dep.entry_point, receipt_timeout)
                    .await
                    .context("relay rejected configuration")?,
            )
        }
        Transport::Direct => {
            let beneficiary = match args.beneficiary.as_deref() {
                Some(b) => parse_addr(b).context("invalid --beneficiary address")?,
                None => session.client.address(),
            };
            OperationSender::Direct(
                DirectSender::new(session.client.clone(), dep.entry_point, beneficiary)?
                    .with_receipt_timeout(receipt_timeout)
                    .with_legacy_transactions(args.legacy),
            )
        }
    };

    let paymaster = if args.paymaster {
        let key = args
            .paymaster_private_key
            .as_deref()
            .ok_or_else(|| anyhow!("--paymaster needs AA_PAYMASTER_PRIVATE_KEY"))?;
        let wallet = parse_wallet(key, dep.chain_id).context("invalid paymaster private key")?;
        Some(
            PaymasterAuthorizer::new(
                session.client.clone(),
                session.paymaster()?,
                PaymasterSigner::new(wallet),
            )?
            .with_window(args.paymaster_window)?,
        )
    } else {
        None
    };

    let mut aa = AaSigner::new(
        session.client.clone(),
        config,
        session.owner()?,
        session.resolver(),
        sender,
        gas,
    )?;

    let account = aa.get_address().await?;
    outln!(machine_mode, "owner:        {:?}", aa.owner());
    outln!(machine_mode, "smartAccount: {:?}", account);
    if let Some(pm) = paymaster.as_ref() {
        outln!(
            machine_mode,
            "paymaster:    {:?} (signer {:?}, window {}s)",
            pm.address(),
            pm.signer_address(),
            pm.window()
        );
    }

    if args.dry_run {
        let op = aa.build_signed(&call, paymaster.as_ref()).await?;

        // The entry point's own hash must match what the owner signed.
        let entry_point = EntryPoint::new(dep.entry_point, session.client.clone())?;
        match entry_point.get_user_op_hash(&op).await {
            Ok(onchain) if onchain == op.user_op_hash() => {
                tracing::debug!(user_op_hash = ?onchain, "userOpHash matches entry point")
            }
            Ok(onchain) => bail!(
                "userOpHash mismatch: local {:?}, entry point {:?}",
                op.user_op_hash(),
                onchain
            ),
            Err(e) => tracing::warn!(error = %e, "could not cross-check userOpHash"),
        }

        let out = serde_json::json!({
            "userOpHash": encoding::fmt_h256(op.user_op_hash()),
            "entryPoint": encoding::fmt_address(dep.entry_point),
            "userOperation": encoding::user_op_to_json(&op),
        });
        if machine_mode {
            println!("{}", out);
        } else {
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        return Ok(());
    }

    let receipt = aa.send_transaction(&call, paymaster.as_ref()).await?;

    if machine_mode {
        let out = serde_json::json!({
            "userOpHash": encoding::fmt_h256(receipt.user_op_hash),
            "transactionHash": receipt.transaction_hash.map(encoding::fmt_h256),
            "success": receipt.success,
            "receipt": receipt.raw,
        });
        println!("{}", out);
    }
    outln!(machine_mode, "userOpHash:   {:?}", receipt.user_op_hash);
    if let Some(tx) = receipt.transaction_hash {
        outln!(machine_mode, "txHash:       {:?}", tx);
    }
    outln!(machine_mode, "success:      {}", receipt.success);

    if !receipt.success {
        bail!("user operation was included but its call reverted");
    }
    Ok(())
}

async fn cmd_balance(args: BalanceArgs) -> Result<()> {
    let machine_mode = args.common.json;
    let session = Session::open(&args.common).await?;

    let target = match args.address.as_deref() {
        Some(a) => parse_addr(a).context("invalid --address")?,
        None => session.smart_account(args.common.salt).await?,
    };

    let entry_point = EntryPoint::new(session.dep.entry_point, session.client.clone())?;
    let deposit = entry_point.balance_of(target).await?;
    let native = session
        .client
        .get_balance(target, None)
        .await
        .context("eth_getBalance failed")?;

    if machine_mode {
        let out = serde_json::json!({
            "address": encoding::fmt_address(target),
            "deposit": deposit.to_string(),
            "balance": native.to_string(),
        });
        println!("{}", out);
    }
    outln!(machine_mode, "address:  {:?}", target);
    outln!(
        machine_mode,
        "deposit:  {} ETH",
        ethers::utils::format_ether(deposit)
    );
    outln!(
        machine_mode,
        "balance:  {} ETH",
        ethers::utils::format_ether(native)
    );
    Ok(())
}

async fn cmd_deposit(args: DepositArgs) -> Result<()> {
    let machine_mode = args.common.json;
    let session = Session::open(&args.common).await?;

    let target = if args.paymaster {
        session.paymaster()?
    } else {
        session.smart_account(args.common.salt).await?
    };
    let amount = ethers::utils::parse_ether(&args.amount)
        .with_context(|| format!("invalid --amount: {}", args.amount))?;
    let min = args
        .min
        .as_deref()
        .map(|m| ethers::utils::parse_ether(m).with_context(|| format!("invalid --min: {m}")))
        .transpose()?;

    if min.is_none() && amount.is_zero() {
        bail!("nothing to deposit: pass --amount or --min");
    }

    let entry_point = EntryPoint::new(session.dep.entry_point, session.client.clone())?;
    let receipt = if args.paymaster && min.is_none() {
        // the paymaster forwards to entryPoint.depositTo(this)
        let paymaster = VerifyingPaymaster::new(target, session.client.clone())?;
        Some(paymaster.deposit(amount).await?)
    } else {
        funding::deposit(&entry_point, target, amount, min).await?
    };
    let deposit = entry_point.balance_of(target).await?;

    if machine_mode {
        let out = serde_json::json!({
            "address": encoding::fmt_address(target),
            "transactionHash": receipt.as_ref().map(|r| encoding::fmt_h256(r.transaction_hash)),
            "deposit": deposit.to_string(),
        });
        println!("{}", out);
    }
    match receipt {
        Some(r) => outln!(machine_mode, "deposited:  tx {:?}", r.transaction_hash),
        None => outln!(machine_mode, "deposit already sufficient"),
    }
    outln!(
        machine_mode,
        "deposit of {:?}: {} ETH",
        target,
        ethers::utils::format_ether(deposit)
    );
    Ok(())
}

async fn cmd_fund(args: FundArgs) -> Result<()> {
    let machine_mode = args.common.json;
    let session = Session::open(&args.common).await?;

    let account = session.smart_account(args.common.salt).await?;
    let target = ethers::utils::parse_ether(&args.min)
        .with_context(|| format!("invalid --min: {}", args.min))?;

    let receipt = funding::fund_native(session.client.clone(), account, target).await?;

    if machine_mode {
        let out = serde_json::json!({
            "smartAccount": encoding::fmt_address(account),
            "transactionHash": receipt.as_ref().map(|r| encoding::fmt_h256(r.transaction_hash)),
        });
        println!("{}", out);
    }
    match receipt {
        Some(r) => outln!(machine_mode, "funded {:?}: tx {:?}", account, r.transaction_hash),
        None => outln!(machine_mode, "{:?} already holds at least {} ETH", account, args.min),
    }
    Ok(())
}

async fn cmd_stake(args: StakeArgs) -> Result<()> {
    let machine_mode = args.common.json;
    let session = Session::open(&args.common).await?;

    let amount = ethers::utils::parse_ether(&args.amount)
        .with_context(|| format!("invalid --amount: {}", args.amount))?;
    let paymaster = VerifyingPaymaster::new(session.paymaster()?, session.client.clone())?;
    let receipt = paymaster.add_stake(args.unstake_delay, amount).await?;

    if machine_mode {
        let out = serde_json::json!({
            "paymaster": encoding::fmt_address(paymaster.address()),
            "transactionHash": encoding::fmt_h256(receipt.transaction_hash),
        });
        println!("{}", out);
    }
    outln!(
        machine_mode,
        "staked {} ETH for {:?} (unstake delay {}s): tx {:?}",
        args.amount,
        paymaster.address(),
        args.unstake_delay,
        receipt.transaction_hash
    );
    Ok(())
}

fn gas_policy(args: &SendArgs, relay: Option<RelayClient>) -> Result<GasPolicy> {
    let policy = match (args.call_gas, args.verification_gas, args.pre_verification_gas) {
        (Some(call), Some(verification), Some(pre)) => GasPolicy::fixed(GasLimits {
            call_gas_limit: U256::from(call),
            verification_gas_limit: U256::from(verification),
            pre_verification_gas: U256::from(pre),
        }),
        (None, None, None) => GasPolicy::relay(relay.ok_or_else(|| {
            anyhow!("gas estimation needs a relay; pass --relay or all three gas limits")
        })?),
        _ => bail!("--call-gas, --verification-gas and --pre-verification-gas go together"),
    };
    Ok(policy.with_fee_multiplier_bps(args.gas_multiplier_bps))
}

fn parse_wallet(key: &str, chain_id: u64) -> Result<LocalWallet> {
    let wallet: LocalWallet = key.trim().parse().map_err(|e| anyhow!("{e}"))?;
    Ok(wallet.with_chain_id(chain_id))
}

fn parse_addr(s: &str) -> Result<Address> {
    Ok(aa_signer::error::parse_address("address", s)?)
}
