//! The `strand` binary.
//!
//! Exit codes: 0 success, 1 configuration error, 2 runtime error, 3 ledger
//! inconsistency.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use strand_crypto::RawKey;
use strand_ledger::Ledger;
use strand_node::{Node, NodeConfig, NullSender};
use strand_types::{address, LedgerError, U256};
use strand_wallet::service::NullLink;
use strand_wallet::Wallets;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Node and wallet for the Strand ledger.
#[derive(Parser)]
#[command(name = "strand", version, about)]
struct Cli {
    /// Data directory; falls back to $STRAND_DATA, then ~/.strand.
    #[arg(long, env = "STRAND_DATA")]
    data: Option<PathBuf>,
    /// Configuration file; defaults to <data>/config.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the node (and the local wallet service).
    Daemon,
    /// Create a wallet, optionally from a hex seed.
    WalletCreate {
        #[arg(long)]
        seed: Option<String>,
    },
    /// Import a wallet from a hex seed.
    WalletImport {
        #[arg(long)]
        seed: String,
    },
    /// Create an account in a wallet.
    AccountCreate {
        #[arg(long)]
        wallet: Option<u32>,
    },
    /// Ask a running daemon to restart its bootstrap schedule.
    BootstrapRestart,
    /// Print node status.
    Status,
}

const EXIT_CONFIG: u8 = 1;
const EXIT_RUNTIME: u8 = 2;
const EXIT_INCONSISTENT: u8 = 3;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("STRAND_LOG")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            let code = classify(&e);
            ExitCode::from(code)
        }
    }
}

fn classify(error: &anyhow::Error) -> u8 {
    if let Some(ledger) = error.downcast_ref::<LedgerError>() {
        return match ledger {
            LedgerError::Inconsistent(_) => EXIT_INCONSISTENT,
            LedgerError::Version { .. } => EXIT_CONFIG,
            _ => EXIT_RUNTIME,
        };
    }
    if error.downcast_ref::<ConfigError>().is_some() {
        return EXIT_CONFIG;
    }
    EXIT_RUNTIME
}

/// Configuration failures exit with code 1.
#[derive(Debug)]
struct ConfigError(String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ConfigError {}

fn data_dir(cli: &Cli) -> PathBuf {
    cli.data.clone().unwrap_or_else(|| {
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".strand")
    })
}

fn load_config(cli: &Cli) -> anyhow::Result<NodeConfig> {
    let data = data_dir(cli);
    std::fs::create_dir_all(&data)
        .map_err(|e| ConfigError(format!("cannot create {}: {e}", data.display())))?;

    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| data.join("config.toml"));
    let mut config = if path.exists() {
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError(format!("cannot read {}: {e}", path.display())))?;
        toml::from_str::<NodeConfig>(&text)
            .map_err(|e| ConfigError(format!("bad config {}: {e}", path.display())))?
    } else {
        NodeConfig::default()
    };
    config.data_path = data;
    Ok(config)
}

fn parse_seed(seed: &str) -> anyhow::Result<RawKey> {
    let parsed = U256::from_hex(seed)
        .map_err(|_| ConfigError("seed must be 64 hex characters".into()))?;
    Ok(RawKey::from_bytes(parsed.0))
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    match &cli.command {
        Command::Daemon => daemon(config),
        Command::WalletCreate { seed } => {
            let seed = seed.as_deref().map(parse_seed).transpose()?;
            with_wallets(&config, |wallets| {
                let wallet_id = wallets.create_wallet(seed)?;
                let wallet = wallets.wallet(wallet_id).expect("created wallet");
                let account = wallet.selected_account().expect("first account");
                println!("wallet: {wallet_id}");
                println!("account: {}", address::encode(&account));
                Ok(())
            })
        }
        Command::WalletImport { seed } => {
            let seed = parse_seed(seed)?;
            with_wallets(&config, |wallets| {
                let wallet_id = wallets.create_wallet(Some(seed))?;
                println!("wallet: {wallet_id}");
                Ok(())
            })
        }
        Command::AccountCreate { wallet } => with_wallets(&config, |wallets| {
            let wallet_id = (*wallet)
                .or_else(|| wallets.wallet_ids().first().copied())
                .ok_or(strand_types::WalletError::AccountGet)?;
            let wallet = wallets
                .wallet(wallet_id)
                .ok_or(strand_types::WalletError::AccountGet)?;
            wallet.attempt_password("")?;
            let account_id = wallet.create_account()?;
            let account = wallet.account(account_id).expect("created account");
            wallets.store_wallet(wallet_id, &wallet)?;
            println!("account: {}", address::encode(&account));
            Ok(())
        }),
        Command::BootstrapRestart => {
            let marker = config.data_path.join("bootstrap_restart");
            std::fs::write(&marker, b"")
                .map_err(|e| anyhow::anyhow!("cannot write control file: {e}"))?;
            println!("bootstrap restart requested");
            Ok(())
        }
        Command::Status => {
            let ledger = Ledger::open(config.ledger_path())?;
            let txn = ledger.begin_read()?;
            let status = serde_json::json!({
                "accounts": ledger.account_count(&txn)?.to_string(),
                "schema_version": ledger.version(&txn)?.to_string(),
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
    }
}

fn with_wallets<F>(config: &NodeConfig, f: F) -> anyhow::Result<()>
where
    F: FnOnce(&Arc<Wallets>) -> Result<(), strand_types::WalletError>,
{
    let ledger = Arc::new(Ledger::open(
        config.data_path.join("wallet.redb"),
    )?);
    let wallets = Wallets::open(ledger, Arc::new(NullLink))
        .map_err(|e| anyhow::anyhow!("wallet store: {e}"))?;
    let result = f(&wallets).map_err(|e| anyhow::anyhow!("{e}"));
    wallets.stop();
    result
}

fn daemon(config: NodeConfig) -> anyhow::Result<()> {
    let node = Node::new(config.clone(), Arc::new(NullSender), None, None)?;
    node.start()?;
    info!(target: "cli", "daemon up; ctrl-c to stop");

    // Watch for the bootstrap-restart control file.
    let marker = config.data_path.join("bootstrap_restart");
    let node_l = node.clone();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let mut poll = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = poll.tick() => {
                    if marker.exists() {
                        let _ = std::fs::remove_file(&marker);
                        node_l.bootstrap_restart();
                        info!(target: "cli", "bootstrap schedule restarted");
                    }
                }
            }
        }
    });

    node.stop();
    Ok(())
}
