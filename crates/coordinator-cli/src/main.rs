//! Match coordinator
//!
//! Runs one player's side of the match-start handshake: waits for both
//! players in the lobby, initializes or joins the match on the ledger, and
//! exits once the match is ready, printing its clock as JSON.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use ledger_bridge::{LedgerConfig, RpcLedger};
use match_coordinator::{
    CoordinationOutcome, CoordinationSession, DetectionPath, HttpLobby, IdentityContext, Role,
};
use serde::Serialize;
use solana_sdk::{
    pubkey::Pubkey,
    signature::{read_keypair_file, Keypair},
    signer::Signer,
};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Transport {
    /// Push notifications with polling as backstop
    Auto,
    /// Polling only
    Poll,
}

#[derive(Parser, Debug)]
#[command(name = "match-coordinator")]
#[command(about = "Coordinate the start of a two-player staked match", long_about = None)]
struct Args {
    /// Lobby match token
    #[arg(long)]
    match_token: String,

    /// Lobby session token (bearer credential)
    #[arg(long, env = "MATCH_SESSION_TOKEN", hide_env_values = true)]
    session_token: String,

    /// Wallet keypair file, or a base58-encoded secret key
    #[arg(long)]
    keypair: String,

    /// Lobby HTTP base URL
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    lobby_url: String,

    /// Lobby WebSocket base URL
    #[arg(long, default_value = "ws://127.0.0.1:8080")]
    lobby_ws_url: String,

    /// Ledger JSON-RPC URL
    #[arg(long, default_value = "http://127.0.0.1:8899")]
    rpc_url: String,

    /// Ledger WebSocket URL
    #[arg(long, default_value = "ws://127.0.0.1:8900")]
    ws_url: String,

    /// Game program id
    #[arg(long)]
    program_id: String,

    /// Stake token mint
    #[arg(long)]
    mint: String,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Lobby transport
    #[arg(long, value_enum, default_value = "auto")]
    lobby_transport: Transport,

    /// Ledger transport for convergence detection
    #[arg(long, value_enum, default_value = "auto")]
    ledger_transport: Transport,

    /// Give up after this many seconds (overrides the config file)
    #[arg(long)]
    max_wait_secs: Option<u64>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Printed to stdout when the match is ready
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Summary {
    match_token: String,
    role: Role,
    leader: String,
    follower: String,
    start_ts: i64,
    end_ts: i64,
    detected_by: DetectionPath,
}

impl Summary {
    fn new(match_token: &str, outcome: &CoordinationOutcome) -> Self {
        Self {
            match_token: match_token.to_string(),
            role: outcome.role,
            leader: outcome.pair.lower().to_string(),
            follower: outcome.pair.higher().to_string(),
            start_ts: outcome.clock.start_ts,
            end_ts: outcome.clock.end_ts,
            detected_by: outcome.detected_by,
        }
    }
}

fn load_keypair(source: &str) -> Result<Keypair> {
    if Path::new(source).exists() {
        return read_keypair_file(source).map_err(|e| anyhow!("reading keypair {source}: {e}"));
    }
    let bytes = bs58::decode(source)
        .into_vec()
        .context("keypair is neither a file nor base58")?;
    Keypair::from_bytes(&bytes).map_err(|e| anyhow!("invalid secret key: {e}"))
}

fn parse_pubkey(label: &str, value: &str) -> Result<Pubkey> {
    Pubkey::from_str(value).with_context(|| format!("invalid {label}: {value}"))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut file_config = config::load(args.config.as_deref())?;
    if args.max_wait_secs.is_some() {
        file_config.coordinator.max_wait_secs = args.max_wait_secs;
    }
    let coordinator = file_config.coordinator;

    let keypair = load_keypair(&args.keypair)?;
    let wallet = keypair.pubkey();
    let program_id = parse_pubkey("program id", &args.program_id)?;
    let mint = parse_pubkey("mint", &args.mint)?;

    tracing::info!("Starting match coordinator");
    tracing::info!("  Match: {}", args.match_token);
    tracing::info!("  Wallet: {}", wallet);
    tracing::info!("  Lobby: {} ({:?})", args.lobby_url, args.lobby_transport);
    tracing::info!("  Ledger RPC: {} ({:?})", args.rpc_url, args.ledger_transport);
    tracing::info!("  Program: {}", program_id);

    let mut ledger_config = LedgerConfig::new(&args.rpc_url, &args.ws_url, program_id, mint);
    ledger_config.commitment = file_config.commitment;
    ledger_config.confirm_poll_interval = coordinator.confirm_poll_interval();
    ledger_config.confirm_max_polls = coordinator.confirm_max_polls;
    let ledger = Arc::new(RpcLedger::new(ledger_config, Arc::new(keypair))?);

    let lobby = Arc::new(HttpLobby::new(
        &args.lobby_url,
        &args.lobby_ws_url,
        &args.match_token,
        &args.session_token,
    )?);
    let context = IdentityContext::new(wallet, args.session_token.clone(), &args.match_token)?;

    let mut session = CoordinationSession::builder(context, ledger, lobby, program_id)
        .config(coordinator)
        .lobby_push(args.lobby_transport == Transport::Auto)
        .ledger_push(args.ledger_transport == Transport::Auto)
        .build()?;

    let mut status = session.status();
    let reporter = tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let text = status.borrow_and_update().to_string();
            tracing::info!("Status: {}", text);
        }
    });

    let outcome = tokio::select! {
        result = session.run() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, abandoning coordination");
            reporter.abort();
            return Ok(());
        }
    };
    reporter.abort();
    let outcome = outcome?;

    if let Some(Err(e)) = &outcome.join {
        tracing::error!("Match is ready but the stake deposit failed: {}", e);
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&Summary::new(&args.match_token, &outcome))?
    );
    Ok(())
}
