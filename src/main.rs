#![forbid(unsafe_code)]

//! `agent-link` — resident bridge between an orchestration server and
//! local AI-agent CLIs.
//!
//! Pairs with the server over HTTP, keeps a WebSocket session alive, and
//! runs agent processes on the server's behalf, streaming their output
//! back as ordered log entries.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_link::compact::CompactionPolicy;
use agent_link::config::{store_refresh_token, ClientConfig, RunnerOverrides};
use agent_link::log_buffer::LogBuffer;
use agent_link::protocol::ControlMessage;
use agent_link::runner::discovery::find_agents_on_path;
use agent_link::supervisor::Supervisor;
use agent_link::transport::{TransportHandle, TransportOptions, TransportTiming, WsTransport};
use agent_link::{auth, AppError, Result};

/// Capacity of the transport→supervisor control channel.
const CONTROL_QUEUE: usize = 64;

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-link", about = "Remote agent bridge client", version, long_about = None)]
struct Cli {
    /// Orchestration server base URL (e.g. https://server.example).
    #[arg(long)]
    server: Option<String>,

    /// One-time pairing code issued by the server.
    #[arg(long)]
    pairing_code: Option<String>,

    /// Force a specific agent backend (codex, gemini, claude).
    #[arg(long)]
    agent: Option<String>,

    /// List agent CLIs found on PATH and exit.
    #[arg(long)]
    list: bool,

    /// Run without a server connection (local spawns only).
    #[arg(long)]
    no_connect: bool,

    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Extra arguments passed to spawned agents (after `--`).
    #[arg(last = true)]
    agent_args: Vec<String>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

#[allow(clippy::too_many_lines)] // Bootstrap is a linear sequence of wiring steps.
async fn run(args: Cli) -> Result<()> {
    if args.list {
        let discovered = find_agents_on_path();
        if discovered.is_empty() {
            return Err(AppError::Config("no agent CLIs found on PATH".into()));
        }
        for agent in discovered {
            info!(name = %agent.name, path = %agent.path, "agent available");
        }
        return Ok(());
    }

    // ── Load configuration ──────────────────────────────
    let config_path = match args.config {
        Some(path) => path,
        None => ClientConfig::default_path()?,
    };
    let mut config = ClientConfig::load_or_default(&config_path);
    if let Some(server) = args.server {
        config.server_url = Some(server);
    }

    // ── Pairing ─────────────────────────────────────────
    if let Some(code) = &args.pairing_code {
        let Some(server_url) = config.server_url.clone() else {
            return Err(AppError::Config(
                "pairing requires --server (or a configured server url)".into(),
            ));
        };
        let label = hostname::get().map_or_else(
            |_| "agent-link".to_owned(),
            |name| name.to_string_lossy().into_owned(),
        );
        let credentials = auth::pair(&server_url, code, &label).await?;
        config.client_id = credentials.client_id.clone();
        store_refresh_token(&credentials.refresh_token).await?;
        info!(client_id = %config.client_id, "paired with server");
    }

    config.save(&config_path)?;
    config.load_credentials().await;
    info!(client_id = %config.client_id, "configuration loaded");

    // ── Shared state ────────────────────────────────────
    let buffer = Arc::new(Mutex::new(LogBuffer::default()));
    let (control_tx, mut control_rx) = mpsc::channel::<ControlMessage>(CONTROL_QUEUE);

    // ── Transport ───────────────────────────────────────
    let transport = match (
        args.no_connect,
        config.server_url.clone(),
        config.refresh_token.clone(),
    ) {
        (true, _, _) => {
            info!("running without a server connection");
            TransportHandle::disconnected()
        }
        (false, None, _) => {
            warn!("no server configured; running disconnected (pair with --server and --pairing-code)");
            TransportHandle::disconnected()
        }
        (false, Some(_), None) => {
            warn!("no credentials stored; running disconnected (pair with --pairing-code)");
            TransportHandle::disconnected()
        }
        (false, Some(server_url), Some(refresh_token)) => {
            WsTransport::connect(TransportOptions {
                server_url: server_url.clone(),
                client_id: config.client_id.clone(),
                token_provider: auth::token_provider(server_url, refresh_token),
                log_buffer: Arc::clone(&buffer),
                control_tx: control_tx.clone(),
                timing: TransportTiming::default(),
            })
        }
    };

    // ── Supervisor ──────────────────────────────────────
    let supervisor = Supervisor::new(
        transport.clone(),
        Arc::clone(&buffer),
        RunnerOverrides::from_env(),
        CompactionPolicy::from_env(),
        args.agent.or_else(|| config.agent_binary.clone()),
        args.agent_args,
    );

    let ct = CancellationToken::new();
    let signal_ct = ct.clone();
    drop(tokio::spawn(async move {
        shutdown_signal().await;
        signal_ct.cancel();
    }));

    info!("agent-link ready");

    // ── Control loop ────────────────────────────────────
    loop {
        tokio::select! {
            message = control_rx.recv() => {
                match message {
                    Some(message) => supervisor.handle_control(message).await,
                    None => break,
                }
            }
            () = ct.cancelled() => break,
        }
    }

    drop(control_tx);
    info!("shutdown signal received");
    supervisor.shutdown().await;
    transport.close();
    // Give exit monitors a moment to report before the runtime drops.
    tokio::time::sleep(Duration::from_millis(200)).await;
    info!("agent-link shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
