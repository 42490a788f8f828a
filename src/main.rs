//! CLI for relayq
//!
//! Subcommands:
//! - `server`: run a broker server
//! - `client`: connect as a named service, optionally send one request or
//!   echo requests back (useful for smoke tests)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{error, info};

use relayq::broker::MessageOptions;
use relayq::client::{BrokerClient, HandlerReply, RequestOutcome, handler_fn};
use relayq::config::{Settings, load_config, load_config_from};
use relayq::persistence::SledStore;
use relayq::transport::BrokerServer;
use relayq::utils::logging;

#[derive(Parser)]
#[command(name = "relayq", version, about)]
struct Cli {
    /// Configuration file stem (default: config/default)
    #[arg(long, global = true)]
    config: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the broker server
    Server,
    /// Connect to a broker as a named service
    Client {
        /// Logical name to register under (overrides client.id)
        #[arg(long)]
        id: Option<String>,
        /// Send one request to this receiver, print the reply and exit
        #[arg(long)]
        receiver: Option<String>,
        /// JSON payload of the request
        #[arg(long, default_value = "{}")]
        data: String,
        /// Reply timeout; 0 sends without waiting
        #[arg(long)]
        timeout_ms: Option<u64>,
        #[arg(long)]
        ttl_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let settings = match cli.config.as_deref() {
        Some(path) => load_config_from(path),
        None => load_config(),
    };
    let settings = match settings {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Invalid configuration: {e}");
            std::process::exit(2);
        }
    };
    logging::init(&settings.log_level);

    let result = match cli.command {
        Command::Server => run_server(settings).await,
        Command::Client {
            id,
            receiver,
            data,
            timeout_ms,
            ttl_ms,
        } => run_client(settings, id, receiver, &data, timeout_ms, ttl_ms).await,
    };
    if let Err(e) = result {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run_server(settings: Settings) -> anyhow::Result<()> {
    let storage = SledStore::open(&settings.server.storage_path)
        .with_context(|| format!("opening storage at {}", settings.server.storage_path))?;
    let server = BrokerServer::bind(&settings.server, Arc::new(storage)).await?;

    tokio::select! {
        _ = server.run() => {
            error!("Broker server exited unexpectedly.");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }
    server.shutdown();
    Ok(())
}

async fn run_client(
    settings: Settings,
    id: Option<String>,
    receiver: Option<String>,
    data: &str,
    timeout_ms: Option<u64>,
    ttl_ms: Option<u64>,
) -> anyhow::Result<()> {
    let mut client_settings = settings.client;
    if let Some(id) = id {
        client_settings.id = id;
    }

    let echo = handler_fn(|data: Value, options: MessageOptions| async move {
        info!("Handling request: {data}");
        Ok::<_, anyhow::Error>(HandlerReply { data, options })
    });
    let client = BrokerClient::connect(client_settings, echo)?;
    if !client.wait_connected(Duration::from_secs(5)).await {
        anyhow::bail!("could not reach broker at {}", client.url());
    }

    let Some(receiver) = receiver else {
        info!("Serving requests as '{}'; Ctrl-C to stop", client.id());
        tokio::signal::ctrl_c().await?;
        client.shutdown();
        return Ok(());
    };

    let data: Value = serde_json::from_str(data).context("--data is not valid JSON")?;
    let options = MessageOptions {
        ttl: ttl_ms,
        ..MessageOptions::default()
    };
    let timeout = timeout_ms.map(Duration::from_millis);
    match client.request(&receiver, data, options, timeout).await? {
        RequestOutcome::Enqueued => {
            // Give the outbound queue a moment to flush before exiting.
            tokio::time::sleep(Duration::from_millis(100)).await;
            info!("Request sent to '{receiver}'");
        }
        RequestOutcome::Replied(reply) => {
            println!("{}", serde_json::json!({ "status": reply.status, "data": reply.data }));
        }
    }
    client.shutdown();
    Ok(())
}
