//! Command-line interface.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use piko_cluster::Node;

use crate::config::Config;
use crate::server::Server;

#[derive(Parser)]
#[command(name = "piko")]
#[command(about = "Piko reverse proxy", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a Piko server node.
    Server {
        /// Path to a TOML or JSON config file.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Inspect a running node through its admin API.
    Status {
        /// Base URL of the node's admin API.
        #[arg(short, long, default_value = "http://127.0.0.1:8002")]
        server: String,

        #[command(subcommand)]
        command: StatusCommand,
    },
}

#[derive(Subcommand)]
pub enum StatusCommand {
    /// Show the node's view of the cluster.
    Nodes,
    /// Show connected upstream listeners by endpoint.
    Endpoints,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Server { config } => run_server(config).await,
            Command::Status { server, command } => match command {
                StatusCommand::Nodes => status_nodes(&server).await,
                StatusCommand::Endpoints => status_endpoints(&server).await,
            },
        }
    }
}

async fn run_server(config_path: Option<PathBuf>) -> Result<()> {
    let config = match config_path {
        Some(path) if path.exists() => Config::from_file(&path)?,
        Some(path) => {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            Config::default()
        }
        None => Config::default(),
    };

    let server = Server::start(config).await?;
    tokio::signal::ctrl_c().await?;
    server.shutdown().await;
    Ok(())
}

async fn status_nodes(server: &str) -> Result<()> {
    let url = format!("{server}/piko/v1/status/cluster/nodes");
    let nodes: Vec<Node> = get_json(&url).await?;
    println!("{}", serde_json::to_string_pretty(&nodes)?);
    Ok(())
}

async fn status_endpoints(server: &str) -> Result<()> {
    let url = format!("{server}/piko/v1/status/proxy/endpoints");
    let endpoints: HashMap<String, Vec<String>> = get_json(&url).await?;
    println!("{}", serde_json::to_string_pretty(&endpoints)?);
    Ok(())
}

async fn get_json<T: serde::de::DeserializeOwned>(url: &str) -> Result<T> {
    let response = reqwest::Client::new().get(url).send().await?;
    if !response.status().is_success() {
        anyhow::bail!("request failed: {}", response.status());
    }
    Ok(response.json().await?)
}
