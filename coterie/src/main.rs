//! Coterie node CLI: runs a peer in either the server (election-eligible)
//! or client role atop the coordination substrate in `coterie-core`.
//!
//! CLI shape grounded in `roj-node-rs/src/main.rs`: a `clap::Parser` args
//! struct, a `--log-level` flag mapped onto `tracing::Level`, and a
//! `FmtSubscriber` with `with_target(false)`.

mod chat;

use clap::{Parser, Subcommand};
use coterie_core::PeerKind;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(author, version, about = "Peer-to-peer group membership and coordination node", long_about = None)]
struct Args {
    #[command(subcommand)]
    role: Role,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Run as a server: election-eligible, participates in fault detection.
    Server,
    /// Run as a client: joins the group via discovery, chats through the leader.
    Client {
        /// Display name announced to the group.
        username: Option<String>,
        /// Chat group to join.
        group: Option<String>,
        /// Legacy raw-broadcast mode instead of the formatted prompt.
        #[arg(long)]
        simple: bool,
    },
}

#[tokio::main]
async fn main() -> coterie_core::Result<()> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).with_target(false).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    match args.role {
        Role::Server => run_server().await,
        Role::Client { username, group, simple } => run_client(username, group, simple).await,
    }
}

async fn run_server() -> coterie_core::Result<()> {
    let (node, handle) = chat::bootstrap_with_backoff(PeerKind::Server, None).await?;
    let node = Arc::new(node);
    info!("coterie server {} starting on {}", node.node_id, node.self_ip);

    chat::install_server_text_handler(&node);
    coterie_core::node::run(node, handle).await;
    Ok(())
}

async fn run_client(username: Option<String>, group: Option<String>, simple: bool) -> coterie_core::Result<()> {
    let username = username.unwrap_or_else(|| format!("User_{}", &short_uuid()));
    let client_id = format!("{username}_{}", short_uuid());

    let (node, handle) = chat::bootstrap_with_backoff(PeerKind::Client, Some(username.clone())).await?;
    let node = Arc::new(node);
    info!("coterie client {client_id} starting on {}", node.self_ip);

    chat::install_client_display(&node);
    chat::spawn_node(node.clone(), handle);

    chat::run_interactive(node, client_id, username, group, simple).await;
    Ok(())
}

fn short_uuid() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}
