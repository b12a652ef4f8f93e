//! WISP CLI
//!
//! Peer-to-peer file transfer over negotiated SOCKS5 bytestreams

mod config;
mod progress;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;
use wisp_core::signal::tcp::{SignalServer, TcpSignaling};
use wisp_core::{
    ExitStatus, FileReceiver, FileSender, ReceiveRequest, RelaySettings, SendRequest,
};
use wisp_transport::{ProxyConfig, ProxyServer};

use config::Config;
use progress::{ProgressDisplay, format_bytes, format_duration};

/// WISP - peer-to-peer file transfer
#[derive(Parser)]
#[command(name = "wisp")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Signaling account options shared by `send` and `receive`
#[derive(Args)]
struct Account {
    /// Own identity (user@domain/resource)
    #[arg(long = "as", value_name = "IDENTITY")]
    identity: Option<String>,

    /// Account password
    #[arg(long)]
    password: Option<String>,

    /// Signaling server (host:port)
    #[arg(long)]
    server: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a file to a peer
    Send {
        /// File to send
        file: PathBuf,

        /// Recipient identity
        to: String,

        #[command(flatten)]
        account: Account,

        /// Local relay port (0 picks a free port)
        #[arg(long)]
        relay_port: Option<u16>,

        /// Do not offer the local relay
        #[arg(long)]
        no_relay: bool,

        /// Description sent with the offer
        #[arg(long)]
        description: Option<String>,

        /// MIME type sent with the offer
        #[arg(long)]
        mime_type: Option<String>,
    },

    /// Receive files from peers
    Receive {
        #[command(flatten)]
        account: Account,

        /// Output directory
        #[arg(short, long, default_value = ".")]
        output: PathBuf,

        /// Exit after the first accepted transfer
        #[arg(long)]
        once: bool,
    },

    /// Run a SOCKS5 pairing proxy
    Proxy {
        /// Listen address
        #[arg(short, long, default_value = "0.0.0.0:7777")]
        bind: SocketAddr,

        /// Identity peers list this proxy under
        #[arg(long)]
        identity: String,
    },

    /// Run a signaling server
    SignalServer {
        /// Listen address
        #[arg(short, long, default_value = "0.0.0.0:5299")]
        bind: SocketAddr,

        /// Account as identity=password (repeatable; none means open)
        #[arg(long = "account", value_name = "ID=PASSWORD")]
        accounts: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load_or_default(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    config.validate()?;

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    tracing::debug!(
        version = env!("CARGO_PKG_VERSION"),
        protocol = wisp_core::PROTOCOL_VERSION,
        config = %config_path.display(),
        "Starting"
    );

    let status = match cli.command {
        Commands::Send {
            file,
            to,
            account,
            relay_port,
            no_relay,
            description,
            mime_type,
        } => {
            let mut request = SendRequest::new(file, to);
            request.description = description;
            request.mime_type = mime_type;
            send(request, account, relay_port, no_relay, &config).await?
        }
        Commands::Receive {
            account,
            output,
            once,
        } => receive(output, account, once, &config).await?,
        Commands::Proxy { bind, identity } => {
            run_proxy(bind, identity).await?;
            ExitStatus::Success
        }
        Commands::SignalServer { bind, accounts } => {
            run_signal_server(bind, &accounts).await?;
            ExitStatus::Success
        }
    };

    Ok(exit_code(status))
}

fn exit_code(status: ExitStatus) -> ExitCode {
    u8::try_from(status.code()).map_or(ExitCode::FAILURE, ExitCode::from)
}

/// Resolve the signaling client from flags, falling back to the config file
fn signaling(account: Account, config: &Config) -> anyhow::Result<Arc<TcpSignaling>> {
    let identity = account
        .identity
        .or_else(|| config.signaling.identity.clone())
        .context("no identity: pass --as or set signaling.identity")?;
    let password = account.password.or_else(|| config.signaling.password.clone());
    let server = account
        .server
        .unwrap_or_else(|| config.signaling.server.clone());

    Ok(Arc::new(TcpSignaling::new(server, identity, password)))
}

/// Send one file
async fn send(
    mut request: SendRequest,
    account: Account,
    relay_port: Option<u16>,
    no_relay: bool,
    config: &Config,
) -> anyhow::Result<ExitStatus> {
    let signaling = signaling(account, config)?;

    request.config = config.transfer_config();
    request.proxies = config.proxy_candidates();
    if config.relay.enabled && !no_relay {
        let mut bind = config.relay_bind_addr()?;
        if let Some(port) = relay_port {
            bind.set_port(port);
        }
        request.relay = Some(RelaySettings {
            bind,
            advertise: config.relay.advertise.clone(),
        });
    }

    let size = std::fs::metadata(&request.file)
        .with_context(|| format!("cannot read {}", request.file.display()))?
        .len();
    println!("File: {}", request.file.display());
    println!("Size: {}", format_bytes(size));
    println!("Recipient: {}", request.to);

    tracing::info!(
        file = %request.file.display(),
        to = %request.to,
        relay = request.relay.is_some(),
        proxies = request.proxies.len(),
        "Sending"
    );

    let (display, progress) = ProgressDisplay::start("Sending");
    let started = Instant::now();
    let status = FileSender::new(request, signaling)
        .with_progress(progress)
        .with_status(display.status_fn())
        .send()
        .await;
    display.finish().await;

    if status.is_success() {
        println!(
            "Sent {} in {}",
            format_bytes(size),
            format_duration(started.elapsed())
        );
    }
    Ok(status)
}

/// Receive files until interrupted (or after one transfer with `once`)
async fn receive(
    output: PathBuf,
    account: Account,
    once: bool,
    config: &Config,
) -> anyhow::Result<ExitStatus> {
    let signaling = signaling(account, config)?;

    let mut request = ReceiveRequest::new(output);
    request.policy = Arc::new(config.accept_policy());
    request.max_transfers = once.then_some(1);
    request.config = config.transfer_config();

    println!("Output directory: {}", request.output_dir.display());
    if let Some(max) = config.policy.max_file_size {
        println!("Size limit: {}", format_bytes(max));
    }
    if !once {
        println!("Press Ctrl+C to stop");
    }

    let (display, progress) = ProgressDisplay::start("Receiving");
    let status = FileReceiver::new(request, signaling)
        .with_progress(progress)
        .with_status(display.status_fn())
        .with_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .receive()
        .await;
    display.finish().await;

    Ok(status)
}

/// Run the pairing proxy until interrupted
async fn run_proxy(bind: SocketAddr, identity: String) -> anyhow::Result<()> {
    let proxy = ProxyServer::bind_with_config(bind, ProxyConfig::default()).await?;
    let addr = proxy.local_addr();

    println!("WISP proxy {identity}");
    println!("Listen: {addr}");
    println!();
    println!("Add to sender configs:");
    println!("  [[proxies]]");
    println!("  host = \"{identity}\"");
    println!("  address = \"{}\"", addr.ip());
    println!("  port = {}", addr.port());
    println!();
    println!("Press Ctrl+C to stop");

    tokio::select! {
        result = proxy.run() => result?,
        _ = tokio::signal::ctrl_c() => println!("\nShutting down..."),
    }
    Ok(())
}

/// Run the signaling server until interrupted
async fn run_signal_server(bind: SocketAddr, accounts: &[String]) -> anyhow::Result<()> {
    let accounts = parse_accounts(accounts)?;
    let open = accounts.is_empty();
    let server = SignalServer::bind(bind, accounts).await?;

    println!("WISP signal server");
    println!("Listen: {}", server.local_addr());
    if open {
        println!("Accounts: open (any identity may log in)");
    }
    println!("Press Ctrl+C to stop");

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => println!("\nShutting down..."),
    }
    Ok(())
}

/// Parse `identity=password` pairs
fn parse_accounts(raw: &[String]) -> anyhow::Result<HashMap<String, String>> {
    raw.iter()
        .map(|entry| {
            let (identity, password) = entry
                .split_once('=')
                .with_context(|| format!("account '{entry}' is not identity=password"))?;
            if identity.is_empty() {
                anyhow::bail!("account '{entry}' has an empty identity");
            }
            Ok((identity.to_string(), password.to_string()))
        })
        .collect()
}
