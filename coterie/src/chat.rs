//! Chat layer: the thin collaborator that sits on top of the coordination
//! substrate. `join`/`status`/free-text messaging are explicitly out of
//! core scope for `coterie-core`; this module supplements that scope from
//! `original_source/Server.py`/`Client.py` as a consumer of the core's
//! public API, wired in via `Node::set_external_text_handler` rather than
//! by adding new variants to the core's wire catalog.

use coterie_core::config::{RECONNECT_BACKOFF_BASE, RECONNECT_MAX_ATTEMPTS};
use coterie_core::node::{run, Node, RunHandle};
use coterie_core::{PeerKind, Result};
use std::io::BufRead;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Bootstrap a node, retrying with exponential backoff (`2^attempt`s, up to
/// `RECONNECT_MAX_ATTEMPTS`) the way `Client._attempt_reconnection` does.
pub async fn bootstrap_with_backoff(kind: PeerKind, hostname: Option<String>) -> Result<(Node, RunHandle)> {
    let mut attempt = 0u32;
    loop {
        match Node::bootstrap(kind, hostname.clone()).await {
            Ok(pair) => return Ok(pair),
            Err(e) if attempt < RECONNECT_MAX_ATTEMPTS => {
                attempt += 1;
                let backoff = Duration::from_secs(RECONNECT_BACKOFF_BASE.pow(attempt));
                warn!(
                    "chat: bind failed ({e}), reconnect attempt {attempt}/{RECONNECT_MAX_ATTEMPTS} in {backoff:?}"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Install the server-side handler for `join`/`status`/free-text chat
/// commands (spec §1's chat surface, grounded in `Server.py`'s
/// `multicast_receiver`).
pub fn install_server_text_handler(node: &Arc<Node>) {
    let handler_node = node.clone();
    node.set_external_text_handler(move |line, src| {
        handle_server_text(&handler_node, line, src);
    });
}

fn handle_server_text(node: &Arc<Node>, line: &str, src: SocketAddr) {
    let line = line.trim();

    if line == "join" || line.starts_with("join:") {
        let client_id = line
            .strip_prefix("join:")
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}:{}", src.ip(), src.port()));
        info!("chat: {client_id} at {src} wants to join");

        let reply = match node.election.current_leader() {
            Some(id) => {
                let name = node.group.get(id).map(|p| p.hostname).unwrap_or_else(|| id.to_string());
                format!("\nWelcome {client_id}! Current Leader: {name} (ID: {id})")
            }
            None => format!("\nWelcome {client_id}! Current Leader: No leader elected"),
        };
        unicast_reply(node, &reply, src);
        return;
    }

    if line == "status" {
        let (servers, clients) = node.group.count_by_kind();
        let reply = format!("\nSystem Status - Servers: {servers}, Clients: {clients}");
        unicast_reply(node, &reply, src);
        return;
    }

    if line.starts_with('[') {
        // Advanced-mode formatted message: "[username]: text".
        info!("chat: message from {src}: {line}");
        let reply = format!("\nYour message was received by {}!", node.hostname);
        unicast_reply(node, &reply, src);
        return;
    }

    // Simple-mode raw broadcast: relayed to the group, nothing to ack.
    info!("chat: relayed message from {src}: {line}");
}

fn unicast_reply(node: &Arc<Node>, reply: &str, src: SocketAddr) {
    let bus = node.bus.clone();
    let reply = reply.to_string();
    tokio::spawn(async move {
        let _ = bus.send_to(reply.as_bytes(), src).await;
    });
}

/// Install the client-side handler that prints anything the core doesn't
/// own to the terminal (welcome replies, status replies, relayed chat).
pub fn install_client_display(node: &Arc<Node>) {
    node.set_external_text_handler(move |line, src| {
        println!("\n{line} (from {src})");
    });
}

/// Drive the interactive session: send the initial `join`, spawn a
/// blocking stdin reader (the teacher's `std::thread::spawn` + channel
/// pattern from `roj-node-rs/src/main.rs`), and relay typed lines.
pub async fn run_interactive(node: Arc<Node>, client_id: String, username: String, group: Option<String>, simple: bool) {
    let join_msg = format!("join:{client_id}");
    let _ = node.bus.broadcast(join_msg.as_bytes()).await;

    if let Some(group) = &group {
        info!("chat: requested group {group}");
    }

    if simple {
        println!("Starting client in simple mode (legacy MulticastSender functionality)");
        println!("\nSimple chat mode active for {username}");
        println!("Type 'exit' to quit");
        println!("{}", "-".repeat(30));
    } else {
        println!("Starting client in advanced mode (enhanced ChatClient functionality)");
        println!("\nWelcome to the distributed chat system, {username}!");
        println!("Available commands:");
        println!("  - Type any message to send it");
        println!("  - '/status' to get system status");
        println!("  - '/quit' to exit");
        println!("{}", "-".repeat(50));
    }

    let (line_tx, mut line_rx) = tokio::sync::mpsc::channel::<String>(16);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if line_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    while let Some(line) = line_rx.recv().await {
        let input = line.trim();
        if simple {
            if input.eq_ignore_ascii_case("exit") {
                break;
            }
            if !input.is_empty() {
                let _ = node.bus.broadcast(input.as_bytes()).await;
            }
        } else {
            if input.eq_ignore_ascii_case("/quit") {
                break;
            } else if input.eq_ignore_ascii_case("/status") {
                let _ = node.bus.broadcast(b"status").await;
            } else if !input.is_empty() {
                let formatted = format!("[{username}]: {input}");
                let _ = node.bus.broadcast(formatted.as_bytes()).await;
            }
        }
    }

    println!("Client {username} disconnected");
}

/// Spawn the node's background tasks (dispatcher, cleanup, discovery,
/// election, fault detector, reliable messaging) and wait for them.
pub fn spawn_node(node: Arc<Node>, handle: RunHandle) {
    tokio::spawn(async move {
        run(node, handle).await;
    });
}
