use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use meshkv::{ChangeKind, MeshEvents, MeshNode, NodeConfig};

/// Eventually-consistent key/value node. Writes replicate to every peer in
/// the mesh; reads are served from local state.
#[derive(Parser, Debug)]
#[command(name = "meshkv")]
struct Cli {
    /// Unique identifier for this node
    node_id: String,

    /// UDP port to listen on
    port: u16,

    /// Host of a bootstrap peer to join through
    bootstrap_host: Option<String>,

    /// Port of the bootstrap peer
    bootstrap_port: Option<u16>,
}

/// Prints replication events to the console so a user at the prompt can see
/// remote changes arrive.
struct ConsoleEvents;

impl MeshEvents for ConsoleEvents {
    fn on_state_change(&self, key: &str, value: Option<&Value>, change: ChangeKind) {
        if change == ChangeKind::Merge {
            match value {
                Some(value) => println!("<< {key} = {value}"),
                None => println!("<< {key} deleted"),
            }
        }
    }

    fn on_peer_discovered(&self, node_id: &str, addr: std::net::SocketAddr) {
        println!("<< peer {node_id} joined from {addr}");
    }

    fn on_peer_failed(&self, node_id: &str) {
        println!("<< peer {node_id} is unreachable");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let node = MeshNode::new(
        NodeConfig::new(cli.node_id, cli.port),
        Arc::new(ConsoleEvents),
    );

    if let (Some(host), Some(port)) = (&cli.bootstrap_host, cli.bootstrap_port) {
        node.add_bootstrap_peer(host, port)?;
    } else if cli.bootstrap_host.is_some() {
        anyhow::bail!("bootstrap host given without a port");
    }

    node.start().await?;
    println!(
        "node {} listening on udp port {} — commands: set, get, delete, list, status, quit",
        node.node_id(),
        node.status().port
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut parts = line.trim().splitn(3, ' ');
        match (parts.next().unwrap_or(""), parts.next(), parts.next()) {
            ("", _, _) => {}
            ("set", Some(key), Some(raw)) => {
                let value = raw
                    .parse::<Value>()
                    .unwrap_or_else(|_| Value::String(raw.to_string()));
                node.set(key, value);
                println!("ok");
            }
            ("get", Some(key), None) => match node.get(key) {
                Some(value) => println!("{value}"),
                None => println!("(nil)"),
            },
            ("delete", Some(key), None) => {
                node.delete(key);
                println!("ok");
            }
            ("list", None, None) => {
                let entries = node.list();
                if entries.is_empty() {
                    println!("(empty)");
                }
                for (key, value) in entries {
                    println!("{key} = {value}");
                }
            }
            ("status", None, None) => {
                println!("{}", serde_json::to_string_pretty(&node.status())?);
            }
            ("quit", None, None) => break,
            _ => println!("usage: set <key> <value> | get <key> | delete <key> | list | status | quit"),
        }
    }

    node.stop().await;
    Ok(())
}
