//! # remoting-echo
//!
//! Wires two in-memory peers, registers an echo processor on the server and
//! issues one sync, one async and one oneway call from the client.
//!
//! Usage: `remoting-echo [--config remoting.toml]`. Log level via `RUST_LOG`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use remoting::{
    MemoryNetwork, ProcessContext, RemotingCommand, RemotingConfig, RemotingService,
    RequestProcessor, RpcHook,
};
use tokio::sync::oneshot;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const ECHO: i32 = 1;

/// Echo round trips between two in-memory remoting peers
#[derive(Parser, Debug)]
#[command(name = "remoting-echo")]
#[command(about = "Sync, async and oneway echo calls over the in-memory transport")]
struct Args {
    /// TOML configuration file; defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address the echo server binds
    #[arg(long, default_value = "127.0.0.1:8888")]
    server: String,

    /// Address the client binds
    #[arg(long, default_value = "127.0.0.1:9999")]
    client: String,

    /// Per-call timeout in milliseconds; the configured default when omitted
    #[arg(short, long)]
    timeout_ms: Option<u64>,

    /// Body sent by the echo calls
    #[arg(short, long, default_value = "hello world")]
    message: String,
}

/// Sends the request straight back
struct EchoProcessor;

#[async_trait]
impl RequestProcessor for EchoProcessor {
    async fn process_request(
        &self,
        _ctx: &ProcessContext,
        mut request: RemotingCommand,
    ) -> anyhow::Result<Option<RemotingCommand>> {
        request.mark_response();
        Ok(Some(request))
    }
}

struct LoggingHook;

impl RpcHook for LoggingHook {
    fn do_before_request(&self, remote_addr: &str, request: &RemotingCommand) {
        info!(remote = remote_addr, code = request.code, "-> request");
    }

    fn do_after_response(
        &self,
        remote_addr: &str,
        _request: &RemotingCommand,
        response: &RemotingCommand,
    ) {
        info!(remote = remote_addr, code = response.code, "<- response");
    }
}

fn load_config(path: Option<&Path>) -> Result<RemotingConfig> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            RemotingConfig::from_toml_str(&raw)
                .with_context(|| format!("parsing {}", path.display()))
        }
        None => Ok(RemotingConfig::default()),
    }
}

fn body_text(command: &RemotingCommand) -> String {
    command
        .body
        .as_ref()
        .map(|body| String::from_utf8_lossy(body).into_owned())
        .unwrap_or_default()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(args.config.as_deref())?;
    let timeout = args.timeout_ms.map(Duration::from_millis);
    let network = MemoryNetwork::from_config(&config);

    let (server_transport, server_events) = network.bind(&args.server)?;
    let server = RemotingService::new(config.clone(), Arc::new(server_transport), server_events)?;
    server.register_processor(ECHO, Arc::new(EchoProcessor), None);
    server.start()?;

    let (client_transport, client_events) = network.bind(&args.client)?;
    let client = RemotingService::new(config, Arc::new(client_transport), client_events)?;
    client.register_rpc_hook(Arc::new(LoggingHook));
    client.start()?;

    let request = RemotingCommand::create_request(ECHO, None).with_body(args.message.clone());
    let response = client.invoke_sync(&args.server, request, timeout).await?;
    info!(body = %body_text(&response), code = response.code, "Sync echo");

    let (tx, rx) = oneshot::channel();
    let request = RemotingCommand::create_request(ECHO, None).with_body(args.message.clone());
    client
        .invoke_async(&args.server, request, timeout, move |outcome| {
            let _ = tx.send(outcome);
        })
        .await?;
    let outcome = rx.await.context("async callback dropped")?;
    let response = outcome.result?;
    info!(
        body = %body_text(&response),
        elapsed_ms = outcome.elapsed.as_millis(),
        "Async echo"
    );

    let request = RemotingCommand::create_request(ECHO, None).with_body(args.message);
    client.invoke_oneway(&args.server, request).await?;
    info!("Oneway sent");

    info!(
        client = %serde_json::to_string(&client.stats())?,
        server = %serde_json::to_string(&server.stats())?,
        "Stats"
    );

    client.shutdown();
    server.shutdown();
    Ok(())
}
