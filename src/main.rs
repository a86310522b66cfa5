//! meshchat - Real-time room chat over a peer mesh

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rand::Rng;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use meshchat::config::{load_config, ChatConfig, TransportKind};
use meshchat::network::{
    BrokerTransport, ChatEvent, ChatTransport, SessionConfig, TransportFault, WebSocketRelay,
};
use meshchat::protocol::MessageKind;

#[derive(Parser)]
#[command(name = "meshchat")]
#[command(about = "Real-time room chat over a peer mesh")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a room and chat
    Join {
        /// Signaling server URL (e.g., wss://example.com)
        #[arg(short, long)]
        server: Option<String>,

        /// Room ID to join
        #[arg(short, long)]
        room: String,

        /// Your display name
        #[arg(short, long)]
        name: Option<String>,

        /// Peer id to join as (random if omitted)
        #[arg(long)]
        peer_id: Option<String>,

        /// Message transport: mesh or broker
        #[arg(short, long)]
        transport: Option<TransportKind>,

        /// Send a single message and exit (non-interactive mode)
        #[arg(short = 'm', long)]
        message: Option<String>,

        /// Seconds to wait for replies in non-interactive mode
        #[arg(long, default_value = "5")]
        timeout: u64,
    },

    /// Show how many members a room has
    Peers {
        /// Signaling server URL (e.g., wss://example.com)
        #[arg(short, long)]
        server: Option<String>,

        /// Room ID to query
        #[arg(short, long)]
        room: String,
    },

    /// List rooms on the signaling server
    Rooms {
        /// Signaling server URL (e.g., wss://example.com)
        #[arg(short, long)]
        server: Option<String>,
    },
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

/// Stored config, falling back to defaults when none is saved
fn base_config() -> ChatConfig {
    match load_config() {
        Ok(config) => config,
        Err(e) => {
            info!("Using default configuration ({})", e);
            ChatConfig::default()
        }
    }
}

fn relay_for(config: &ChatConfig) -> WebSocketRelay {
    WebSocketRelay::new(config.signaling_url.clone()).with_join_timeout(config.join_timeout())
}

fn build_transport(
    config: &ChatConfig,
) -> Result<(Box<dyn ChatTransport>, mpsc::UnboundedReceiver<ChatEvent>)> {
    let relay = Arc::new(relay_for(config));
    let session_config = SessionConfig::from(config);

    match config.transport {
        TransportKind::Broker => {
            let (transport, events) = BrokerTransport::new(relay, session_config);
            Ok((Box::new(transport), events))
        }
        #[cfg(feature = "webrtc")]
        TransportKind::Mesh => {
            let connector = Arc::new(meshchat::network::RtcConnector::new(
                config.ice_servers.clone(),
            ));
            let (transport, events) =
                meshchat::network::MeshTransport::new(relay, connector, session_config);
            Ok((Box::new(transport), events))
        }
        #[cfg(not(feature = "webrtc"))]
        TransportKind::Mesh => {
            anyhow::bail!("Mesh transport needs the `webrtc` feature; rebuild with it or pass --transport broker")
        }
    }
}

/// Parse `NdM` dice notation
fn parse_dice(notation: &str) -> Option<(u32, u32)> {
    let (count, sides) = notation.trim().to_ascii_lowercase().split_once('d').map(|(c, s)| {
        let count = if c.is_empty() { Ok(1) } else { c.parse::<u32>() };
        (count, s.parse::<u32>())
    })?;
    match (count, sides) {
        (Ok(count), Ok(sides)) if (1..=100).contains(&count) && (2..=1000).contains(&sides) => {
            Some((count, sides))
        }
        _ => None,
    }
}

fn roll_dice(count: u32, sides: u32, rng: &mut impl Rng) -> String {
    let rolls: Vec<u32> = (0..count).map(|_| rng.gen_range(1..=sides)).collect();
    let total: u32 = rolls.iter().sum();
    let faces: Vec<String> = rolls.iter().map(|r| r.to_string()).collect();
    format!("rolled {}d{}: {} = {}", count, sides, faces.join(" + "), total)
}

fn print_event(event: &ChatEvent, local_peer_id: &str) {
    match event {
        ChatEvent::Message(msg) => match msg.kind {
            MessageKind::Text if msg.sender_id == local_peer_id => {}
            MessageKind::Text => println!("{}: {}", msg.sender_display_name, msg.body),
            MessageKind::DiceRoll => println!("🎲 {} {}", msg.sender_display_name, msg.body),
            MessageKind::System => println!("* {}", msg.body),
        },
        ChatEvent::PeerConnected(peer) => println!("→ {} connected", peer),
        ChatEvent::PeerDisconnected(peer) => println!("← {} disconnected", peer),
        ChatEvent::Error(TransportFault::SignalingUnavailable(reason)) => {
            println!("⚠️  Signaling unavailable: {}", reason)
        }
        ChatEvent::Error(fault) => warn!("{}", fault),
    }
}

/// Handle one line of input, returning false when the user quits
async fn handle_input(transport: &dyn ChatTransport, line: &str) -> Result<bool> {
    match line.split_once(' ').map_or((line, ""), |(c, rest)| (c, rest.trim())) {
        ("/quit", _) => return Ok(false),
        ("/peers", _) => {
            let peers = transport.connected_peers().await;
            if peers.is_empty() {
                println!("No peers connected.");
            } else {
                println!("Connected peers ({}):", peers.len());
                for peer in peers {
                    println!("  - {}", peer);
                }
            }
        }
        ("/roll", notation) => {
            let notation = if notation.is_empty() { "1d6" } else { notation };
            match parse_dice(notation) {
                Some((count, sides)) => {
                    let body = roll_dice(count, sides, &mut rand::thread_rng());
                    transport.send_message(&body, MessageKind::DiceRoll).await?;
                }
                None => println!("Usage: /roll NdM (e.g. /roll 2d6)"),
            }
        }
        _ => {
            transport.send_message(line, MessageKind::Text).await?;
        }
    }
    Ok(true)
}

async fn run_join(
    config: ChatConfig,
    room_id: String,
    peer_id: String,
    message: Option<String>,
    timeout_secs: u64,
) -> Result<()> {
    config.validate()?;
    info!(
        "Joining room {} via {} ({:?} transport)",
        room_id, config.signaling_url, config.transport
    );

    let (mut transport, mut events) = build_transport(&config)?;
    transport
        .connect(&room_id, &peer_id, &config.display_name)
        .await?;

    if let Some(session) = transport.session() {
        println!("\nJoined room: {}", session.room_id);
        println!("Your peer ID: {}", session.local_peer_id);
        if session.is_host {
            println!("You are the first member of this room.");
        }
    }

    // Non-interactive mode: send one message and print what arrives
    if let Some(body) = message {
        println!("📤 Sending: {}", body);
        transport.send_message(&body, MessageKind::Text).await?;

        println!("⏳ Waiting for replies (timeout: {}s)...", timeout_secs);
        let deadline = tokio::time::sleep(Duration::from_secs(timeout_secs));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                Some(event) = events.recv() => print_event(&event, &peer_id),
            }
        }

        transport.disconnect().await;
        return Ok(());
    }

    println!("\n💬 Type a message and press Enter to send.");
    println!("Commands: /roll NdM, /peers, /quit\n");

    let stdin = tokio::io::stdin();
    let mut stdin_reader = BufReader::new(stdin).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
            Some(event) = events.recv() => print_event(&event, &peer_id),
            line_result = stdin_reader.next_line() => {
                match line_result {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match handle_input(transport.as_ref(), line).await {
                            Ok(true) => {}
                            Ok(false) => break,
                            Err(e) => warn!("Failed to send: {}", e),
                        }
                    }
                    Ok(None) => {
                        info!("stdin closed");
                        break;
                    }
                    Err(e) => {
                        warn!("stdin error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    transport.disconnect().await;
    Ok(())
}

async fn run_peers(config: ChatConfig, room_id: String) -> Result<()> {
    let count = relay_for(&config).peer_count(&room_id).await?;
    println!("Room {}: {} peer(s)", room_id, count);
    Ok(())
}

async fn run_rooms(config: ChatConfig) -> Result<()> {
    info!("Listing rooms on {}", config.signaling_url);

    let rooms = relay_for(&config).list_rooms().await?;
    if rooms.is_empty() {
        println!("No rooms available.");
    } else {
        println!("Available rooms:");
        for room in rooms {
            println!("  {} ({}/{} peers)", room.id, room.peer_count, room.max_peers);
        }
    }
    Ok(())
}

fn with_server(mut config: ChatConfig, server: Option<String>) -> ChatConfig {
    if let Some(server) = server {
        config.signaling_url = server;
    }
    config
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let config = base_config();

    match cli.command {
        Commands::Join {
            server,
            room,
            name,
            peer_id,
            transport,
            message,
            timeout,
        } => {
            let mut config = with_server(config, server);
            if let Some(name) = name {
                config.display_name = name;
            }
            if let Some(transport) = transport {
                config.transport = transport;
            }
            let peer_id = peer_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            run_join(config, room, peer_id, message, timeout).await?;
        }
        Commands::Peers { server, room } => {
            run_peers(with_server(config, server), room).await?;
        }
        Commands::Rooms { server } => {
            run_rooms(with_server(config, server)).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_parse_dice() {
        assert_eq!(parse_dice("2d6"), Some((2, 6)));
        assert_eq!(parse_dice("d20"), Some((1, 20)));
        assert_eq!(parse_dice(" 3D8 "), Some((3, 8)));
        assert_eq!(parse_dice("0d6"), None);
        assert_eq!(parse_dice("2d1"), None);
        assert_eq!(parse_dice("six"), None);
    }

    #[test]
    fn test_roll_dice_within_range() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let body = roll_dice(3, 6, &mut rng);
            let total: u32 = body.rsplit(" = ").next().unwrap().parse().unwrap();
            assert!((3..=18).contains(&total), "{}", body);
            assert!(body.starts_with("rolled 3d6: "));
        }
    }
}
