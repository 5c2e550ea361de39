use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;

use navlink::config::{self, NavlinkConfig};
use navlink::logging;
use navlink::mcp_client::{McpClientService, McpError};

#[derive(Parser)]
#[command(name = "navlink")]
#[command(about = "Drive the robot navigation tool server over MCP")]
#[command(version)]
struct Cli {
    /// Config file (default: $NAVLINK_CONFIG, then <config dir>/navlink/config.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the server command from the config
    #[arg(long, global = true)]
    server: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the tools the server advertises
    Tools,
    /// Call one tool and print its output
    Call {
        /// Tool name, e.g. navigate_to_location
        tool: String,

        /// Arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,

        /// Fail on the first transient error instead of backing off
        #[arg(long)]
        no_retry: bool,
    },
    /// Stay connected and report reconnections until Ctrl-C
    Watch {
        /// Seconds between status lines
        #[arg(long, default_value = "5")]
        every: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut cfg = config::load_or_default(cli.config.as_deref()).context("loading config")?;
    if let Some(command) = cli.server {
        cfg.server.command = command;
    }
    logging::init_tracing("navlink", &cfg.logging)?;

    let client = cfg.build_client();
    let outcome = run(&client, &cfg, cli.command).await;
    client.shutdown().await;

    outcome.map_err(|e| match e.downcast::<McpError>() {
        Ok(mcp) => anyhow::anyhow!(mcp.user_message()),
        Err(other) => other,
    })
}

async fn run(client: &McpClientService, cfg: &NavlinkConfig, command: Commands) -> Result<()> {
    client.connect().await?;

    match command {
        Commands::Tools => {
            for tool in client.list_tools() {
                println!("{:<28} {}", tool.name, tool.description);
            }
        }
        Commands::Call {
            tool,
            args,
            no_retry,
        } => {
            let arguments: Value =
                serde_json::from_str(&args).context("--args must be a JSON object")?;
            if !arguments.is_object() {
                anyhow::bail!("--args must be a JSON object");
            }

            let result = if no_retry {
                client.call_tool(&tool, arguments).await?
            } else {
                client.call_tool_with_retry(&tool, arguments).await?
            };
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Watch { every } => watch(client, cfg, Duration::from_secs(every.max(1))).await?,
    }

    Ok(())
}

async fn watch(client: &McpClientService, cfg: &NavlinkConfig, every: Duration) -> Result<()> {
    tracing::info!(
        command = %cfg.server.command,
        heartbeat_ms = cfg.client.heartbeat_interval_ms,
        "watching tool server"
    );

    let mut ticker = tokio::time::interval(every);
    let mut last_generation = 0;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, shutting down");
                return Ok(());
            }
            _ = ticker.tick() => {
                match client.connection_info() {
                    Some(info) => {
                        if info.generation != last_generation {
                            println!("{}", serde_json::to_string(&info)?);
                            last_generation = info.generation;
                        }
                    }
                    None => println!("{{\"state\":\"{:?}\"}}", client.state()),
                }
            }
        }
    }
}
