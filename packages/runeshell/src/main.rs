use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

mod agent;
mod auth;
mod config;
mod hub;
mod term;

use crate::agent::AgentClient;
use crate::auth::TokenManager;
use crate::config::{AgentConfig, AuthMode, HubConfig};
use crate::hub::{AppState, Hub};
use crate::term::LocalSessionManager;

#[derive(Parser)]
#[command(name = "runeshell")]
#[command(about = "Terminal multiplexing hub for tmux sessions", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the hub: WebSocket broker plus the admin API
    Hub(HubArgs),
    /// Run the agent loop against a hub
    Agent(AgentArgs),
    /// Run hub and agent together in one process
    Run(RunArgs),
    /// Disable web input for an agent (admin token required)
    Lock(LockArgs),
    /// Re-enable web input for an agent (admin token required)
    Unlock(LockArgs),
}

#[derive(Args)]
struct HubArgs {
    /// Listen address
    #[arg(long, default_value = "127.0.0.1:8081")]
    addr: SocketAddr,
    #[arg(long, value_enum, default_value_t = AuthMode::Token)]
    auth_mode: AuthMode,
    /// Allow only tailnet peers (loopback or 100.64.0.0/10)
    #[arg(long)]
    tailnet_only: bool,
    /// Token signing secret
    #[arg(long, default_value = "dev-secret")]
    token_secret: String,
    /// Admin token for the lock/token/sessions endpoints
    #[arg(long, default_value = "dev-admin")]
    admin_token: String,
    /// Client token ttl in seconds (token mode)
    #[arg(long, default_value_t = 60)]
    token_ttl: u64,
    #[arg(long, default_value = "agent1")]
    agent_id: String,
    #[arg(long, default_value = "agent-secret")]
    agent_secret: String,
}

#[derive(Args)]
struct AgentArgs {
    /// Hub agent WebSocket URL
    #[arg(long, default_value = "ws://localhost:8081/ws/agent")]
    hub: String,
    #[arg(long, default_value = "agent1")]
    agent_id: String,
    #[arg(long, default_value = "agent-secret")]
    agent_secret: String,
    /// Do not kill tmux sessions on disconnect
    #[arg(long)]
    keep_sessions: bool,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    hub: HubArgs,
    /// Do not kill tmux sessions on disconnect
    #[arg(long)]
    keep_sessions: bool,
}

#[derive(Args)]
struct LockArgs {
    /// Hub base URL
    #[arg(long, default_value = "http://127.0.0.1:8081")]
    hub: String,
    #[arg(long, default_value = "dev-admin")]
    admin_token: String,
    #[arg(long, default_value = "agent1")]
    agent_id: String,
    /// Session the lock applies to
    #[arg(long)]
    session: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Commands::Hub(args) => serve_hub(args).await,
        Commands::Agent(args) => run_agent(args).await,
        Commands::Run(args) => run_combined(args).await,
        Commands::Lock(args) => set_lock(args, "none").await,
        Commands::Unlock(args) => set_lock(args, "web").await,
    }
}

/// Token that fires on ctrl-c; everything hangs off it.
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutting down");
            trigger.cancel();
        }
    });
    cancel
}

fn hub_state(args: &HubArgs) -> AppState {
    AppState {
        hub: Arc::new(Hub::new()),
        tokens: Arc::new(TokenManager::new(&args.token_secret)),
        config: Arc::new(HubConfig {
            auth_mode: args.auth_mode,
            tailnet_only: args.tailnet_only,
            admin_token: args.admin_token.clone(),
            token_ttl_secs: args.token_ttl,
            agent_secrets: HashMap::from([(args.agent_id.clone(), args.agent_secret.clone())]),
        }),
    }
}

async fn serve(addr: SocketAddr, state: AppState, cancel: CancellationToken) -> Result<()> {
    let router = hub::router(state);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "hub listening");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(cancel.cancelled_owned())
    .await
    .context("serving hub")
}

async fn serve_hub(args: HubArgs) -> Result<()> {
    let state = hub_state(&args);
    serve(args.addr, state, shutdown_token()).await
}

fn local_agent(hub_url: String, agent_id: String, agent_secret: String, keep_sessions: bool) -> AgentClient {
    let manager = Arc::new(LocalSessionManager {
        kill_on_close: !keep_sessions,
        ..Default::default()
    });
    AgentClient::new(
        AgentConfig {
            hub_url,
            agent_id,
            agent_secret,
            retry: Duration::from_secs(2),
        },
        manager,
    )
}

async fn run_agent(args: AgentArgs) -> Result<()> {
    let client = local_agent(args.hub, args.agent_id, args.agent_secret, args.keep_sessions);
    client.run_with_retry(shutdown_token()).await;
    Ok(())
}

async fn run_combined(args: RunArgs) -> Result<()> {
    let cancel = shutdown_token();
    let state = hub_state(&args.hub);
    let addr = args.hub.addr;

    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move { serve(addr, state, server_cancel).await });

    let client = local_agent(
        format!("ws://{addr}/ws/agent"),
        args.hub.agent_id.clone(),
        args.hub.agent_secret.clone(),
        args.keep_sessions,
    );
    client.run_with_retry(cancel).await;

    match server.await {
        Ok(result) => result,
        Err(err) => Err(anyhow::anyhow!(err)).context("hub task"),
    }
}

async fn set_lock(args: LockArgs, writer: &str) -> Result<()> {
    let url = format!("{}/api/lock", args.hub.trim_end_matches('/'));
    let response = reqwest::Client::new()
        .post(&url)
        .bearer_auth(&args.admin_token)
        .json(&serde_json::json!({
            "agent_id": args.agent_id,
            "session_id": args.session,
            "writer": writer,
        }))
        .send()
        .await
        .with_context(|| format!("posting to {url}"))?;
    if !response.status().is_success() {
        anyhow::bail!("lock request failed: {}", response.status());
    }
    info!(agent = %args.agent_id, writer, "lock updated");
    Ok(())
}
