//! PeerLink client
//!
//! Interactive client for a two-party virtual LAN: discovers the public
//! address via STUN, registers with the rendezvous service, punches a
//! UDP path to a peer and bridges raw IPv4 frames through a virtual
//! adapter. Applications then reach the peer at its 10.0.0.x address
//! with ordinary TCP/UDP/ICMP, including LAN discovery via broadcast
//! and multicast.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use peerlink_core::{Engine, EngineConfig};

/// PeerLink - peer-to-peer virtual LAN
#[derive(Parser)]
#[command(name = "peerlink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Rendezvous service WebSocket URL
    #[arg(short, long, default_value = "wss://rendezvous.peerlink.dev")]
    server: String,

    /// Username to register with the rendezvous service (prompted if omitted)
    #[arg(short, long)]
    username: Option<String>,

    /// Local UDP port for the tunnel (0 = any)
    #[arg(short, long, default_value_t = 0)]
    port: u16,

    /// STUN server host
    #[arg(long, default_value = "stun.l.google.com")]
    stun_server: String,

    /// STUN server port
    #[arg(long, default_value_t = 19302)]
    stun_port: u16,

    /// Virtual adapter name (platform default if omitted)
    #[arg(long)]
    adapter: Option<String>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    let username = match cli.username {
        Some(username) => username,
        None => {
            println!("Enter your username:");
            stdin
                .next_line()
                .await?
                .map(|line| line.trim().to_string())
                .unwrap_or_default()
        }
    };
    if username.is_empty() {
        anyhow::bail!("username cannot be empty");
    }

    let mut config = EngineConfig {
        server_url: cli.server,
        username,
        listen_port: cli.port,
        stun_server: cli.stun_server,
        stun_port: cli.stun_port,
        ..Default::default()
    };
    if let Some(adapter) = cli.adapter {
        config.tun_name = adapter;
    }

    let engine = Engine::new(config);
    engine
        .initialize()
        .await
        .context("failed to initialize the application")?;

    info!("system initialized successfully, type /help for commands");

    loop {
        tokio::select! {
            line = stdin.next_line() => {
                let Ok(Some(line)) = line else { break };
                if !handle_command(&engine, line.trim()) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down...");
                break;
            }
        }
    }

    engine.shutdown().await;
    info!("application exiting, goodbye");
    Ok(())
}

/// Run one interactive command; returns false when the client should exit
fn handle_command(engine: &Arc<Engine>, line: &str) -> bool {
    match line {
        "" => {}
        "/quit" | "/exit" => return false,
        "/help" => print_help(),
        "/disconnect" => {
            let engine = Arc::clone(engine);
            tokio::spawn(async move { engine.stop_connection().await });
        }
        "/accept" => engine.accept_incoming_request(),
        "/reject" => engine.reject_incoming_request(),
        "/status" => print_status(engine),
        "/ip" => print_ips(engine),
        "/logs" => {
            let enabled = engine.toggle_traffic_logging();
            println!(
                "Traffic logging {}",
                if enabled { "enabled" } else { "disabled" }
            );
        }
        _ => {
            if let Some(peer) = line.strip_prefix("/connect ") {
                let peer = peer.trim();
                if peer.is_empty() {
                    println!("Usage: /connect <username>");
                } else {
                    engine.connect_to_peer(peer);
                }
            } else {
                println!("Unknown command: {} (try /help)", line);
            }
        }
    }
    true
}

fn print_help() {
    println!("Commands:");
    println!("  /connect <username> - Connect to a peer");
    println!("  /disconnect - Disconnect from the current peer");
    println!("  /accept - Accept an incoming connection request");
    println!("  /reject - Reject an incoming connection request");
    println!("  /status - Display connection status");
    println!("  /ip - Show the virtual IP addresses");
    println!("  /logs - Toggle traffic logging (default: disabled)");
    println!("  /quit or /exit - Exit the application");
    println!();
    println!("When connected, use standard network tools like ping or connect");
    println!("to services on the other peer using the virtual IP addresses.");
}

fn print_status(engine: &Arc<Engine>) {
    let status = engine.status();
    println!("State: {}", status.state);
    if status.connected {
        println!("Role: {}", if status.is_host { "Host" } else { "Client" });
        if let Some(endpoint) = status.peer_endpoint {
            println!("Peer endpoint: {}", endpoint);
        }
        println!("Unacknowledged messages: {}", status.pending_acks);
    } else {
        println!("Not connected");
    }
    if let Some(public) = status.public_endpoint {
        println!("Public endpoint: {}", public);
    }
}

fn print_ips(engine: &Arc<Engine>) {
    let status = engine.status();
    match (status.local_virtual_ip, status.peer_virtual_ip) {
        (Some(local), Some(peer)) => {
            println!("Your virtual IP: {}", local);
            println!("Peer virtual IP: {}", peer);
        }
        _ => println!("Not connected"),
    }
}
