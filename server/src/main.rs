//! Relaymesh Server - standalone relay mesh node

use anyhow::{Context, Result};
use clap::Parser;
use relaymesh_server::config::Config;
use relaymesh_server::host::{HostBindings, MainLoop, PacketListener};
use relaymesh_server::protocol::{NetworkPacket, PacketBody};
use relaymesh_server::NetworkManager;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author = "Florian Schüller <schuellerf@gmail.com>")]
#[command(version)]
#[command(about = "Relaymesh server - encrypted server-to-server relay node", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "relaymesh.toml")]
    config: String,
}

/// Writes every relayed packet to the log
struct LogListener;

impl PacketListener for LogListener {
    fn on_packet(&self, origin: &str, packet: NetworkPacket) {
        match packet.body {
            PacketBody::Chat(chat) => info!("[{}] <{}> {}", origin, chat.player, chat.message),
            PacketBody::DiscordChat(chat) => info!("[{}] [Discord] <{}> {}", origin, chat.user, chat.message),
            PacketBody::Command(command) => info!("[{}] command: {}", origin, command.command),
            PacketBody::EventJoin(event) => info!("[{}] {} joined", origin, event.player),
            PacketBody::EventLeave(event) => info!("[{}] {} left", origin, event.player),
            PacketBody::EventDeath(event) => match event.extra.get("message").and_then(|m| m.as_str()) {
                Some(message) => info!("[{}] {}", origin, message),
                None => info!("[{}] {} died", origin, event.player),
            },
            PacketBody::PlayerListSnapshot(list) => {
                info!("[{}] {} online: {}", origin, list.players.len(), list.players.join(", "))
            }
            other => info!("[{}] {:?}", origin, other),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("Starting Relaymesh server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::load(&args.config)
        .context("Failed to load configuration")?;

    info!("Loaded configuration from: {}", args.config);

    // Host main context
    let (main_loop, driver) = MainLoop::new();
    tokio::spawn(driver.run());

    let host = HostBindings::new(
        Arc::new(main_loop),
        Arc::new(LogListener),
        Arc::new(Vec::<String>::new),
    );
    let manager = Arc::new(NetworkManager::new(config.network, host));
    manager.start().await;

    let network = manager.config();
    if network.enabled {
        info!(
            "Server {} on port {} with {} configured peer(s)",
            network.server_id,
            network.port,
            network.servers.len()
        );
    }

    // Console input
    let console = manager.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => handle_console_line(&console, line.trim()),
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read console input: {}", e);
                    break;
                }
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    manager.shutdown().await;
    info!("Relaymesh server stopped");
    Ok(())
}

fn handle_console_line(manager: &NetworkManager, line: &str) {
    if line.is_empty() {
        return;
    }

    let mut parts = line.splitn(3, ' ');
    match parts.next() {
        Some("/peers") => {
            let peers = manager.connected_servers();
            info!("{} connected: {}", peers.len(), peers.join(", "));
        }
        Some("/list") => match parts.next() {
            Some(server_id) if manager.request_player_list(server_id) => {}
            Some(server_id) => warn!("Not connected to {}", server_id),
            None => warn!("Usage: /list <server>"),
        },
        Some("/cmd") => match (parts.next(), parts.next()) {
            (Some(server_id), Some(command)) => {
                if !manager.send_to(server_id, PacketBody::command(command)) {
                    warn!("Not connected to {}", server_id);
                }
            }
            _ => warn!("Usage: /cmd <server> <command>"),
        },
        _ => {
            let sent = manager.send(PacketBody::chat("Console", line), None);
            info!("Relayed chat to {} server(s)", sent);
        }
    }
}
