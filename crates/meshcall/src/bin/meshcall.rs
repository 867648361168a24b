//! Mesh call command-line client
//!
//! Joins a room, publishes synthetic audio/video, and logs the roster and
//! chat. Lines typed on stdin are posted to the room chat; `/screen` toggles
//! a synthetic screen share and `/quit` or Ctrl+C leaves the call.
//!
//! # Usage
//!
//! ```bash
//! # Join "standup" as Alice
//! cargo run --bin meshcall -- --room standup --name Alice
//!
//! # Custom signaling server and STUN list
//! cargo run --bin meshcall -- \
//!   --signaling-url wss://calls.example.com \
//!   --room standup --name Bob \
//!   --stun-servers stun:stun.l.google.com:19302,stun:stun1.l.google.com:19302
//!
//! # TURN relay
//! cargo run --bin meshcall -- --room standup --name Carol \
//!   --turn-servers turn:turn.example.com:3478:carol:secret
//! ```

use anyhow::{bail, Context};
use clap::Parser;
use meshcall::config::DEFAULT_SIGNALING_URL;
use meshcall::media::{spawn_sample_pump, MediaKind};
use meshcall::{CallSession, LocalMedia, MeshCallConfig, SyntheticDevices, TurnServerConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Mesh call client
///
/// Joins a room on the signaling server and connects to every participant.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Signaling server base URL
    #[arg(
        long,
        default_value = DEFAULT_SIGNALING_URL,
        env = "MESHCALL_SIGNALING_URL"
    )]
    signaling_url: String,

    /// Room to join
    #[arg(short, long, env = "MESHCALL_ROOM")]
    room: String,

    /// Display name announced to the room
    #[arg(short, long, env = "MESHCALL_NAME")]
    name: String,

    /// STUN servers (comma-separated)
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "stun:stun.l.google.com:19302,stun:stun1.l.google.com:19302"
    )]
    stun_servers: Vec<String>,

    /// TURN servers (comma-separated, format: turn:host:port:username:password)
    #[arg(long, value_delimiter = ',')]
    turn_servers: Vec<String>,

    /// Do not publish audio
    #[arg(long)]
    no_audio: bool,

    /// Do not publish video
    #[arg(long)]
    no_video: bool,

    /// Fixed delay before the signaling socket redials, in milliseconds
    #[arg(long, default_value_t = 1500, env = "MESHCALL_RECONNECT_DELAY_MS")]
    reconnect_delay_ms: u64,

    /// Restarts allowed per peer before giving up
    #[arg(long, default_value_t = 3, env = "MESHCALL_MAX_RESTARTS")]
    max_restarts: u32,
}

/// Parse TURN server string (format: turn:host:port:username:password or turns:host:port:username:password)
fn parse_turn_server(s: &str) -> anyhow::Result<TurnServerConfig> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() < 5 {
        bail!(
            "Invalid TURN server format: '{}'. Expected: turn:host:port:username:password",
            s
        );
    }

    let protocol = parts[0];
    if protocol != "turn" && protocol != "turns" {
        bail!(
            "Invalid TURN protocol: '{}'. Expected 'turn' or 'turns'",
            protocol
        );
    }

    // Password may contain colons
    Ok(TurnServerConfig {
        url: format!("{}:{}:{}", protocol, parts[1], parts[2]),
        username: parts[3].to_string(),
        credential: parts[4..].join(":"),
    })
}

fn build_config_from_args(args: &Args) -> anyhow::Result<MeshCallConfig> {
    let mut config = MeshCallConfig::new(&args.signaling_url, &args.room, &args.name);
    config.stun_servers = args.stun_servers.clone();
    config.options.signaling_reconnect_delay_ms = args.reconnect_delay_ms;
    config.options.max_restart_attempts = args.max_restarts;

    for turn_str in &args.turn_servers {
        let turn = parse_turn_server(turn_str).context("Failed to parse TURN server")?;
        info!("Adding TURN server: {} (user: {})", turn.url, turn.username);
        config.turn_servers.push(turn);
    }

    let config = config.with_turn_from_env();
    config.validate()?;
    Ok(config)
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing();

    info!(version = env!("CARGO_PKG_VERSION"), "meshcall starting");

    let config = build_config_from_args(&args)?;

    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel::<()>();
    let shutting_down = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutting_down);
    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            eprintln!("Shutdown already in progress, forcing exit");
            std::process::exit(1);
        }
        let _ = shutdown_tx.send(());
    })
    .context("Failed to set Ctrl+C handler")?;

    let media = LocalMedia::new();
    let devices = SyntheticDevices::new(&format!("{}-{}", args.room, args.name));
    let report = media.acquire(&devices, !args.no_audio, !args.no_video).await;
    for e in &report.errors {
        warn!("{}", e);
    }
    if !report.is_usable() {
        warn!("Joining without local media; waiting for peers to call");
    }
    // Idle while their kind has no published track
    let pumps = [MediaKind::Audio, MediaKind::Video]
        .map(|kind| spawn_sample_pump(kind, media.subscribe()));

    let call = CallSession::websocket(&config, media.subscribe())?;

    let mut snapshots = call.subscribe();
    let mut chat = call.subscribe_chat();
    let mut chat_seen = 0;
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Ctrl+C received, leaving call");
                break;
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                info!(
                    state = %snapshot.connection_state,
                    participants = snapshot.participants.len(),
                    "Call updated"
                );
                for p in &snapshot.participants {
                    info!(
                        "  {} ({}) {} stream={}",
                        p.name.as_deref().unwrap_or("unnamed"),
                        p.peer_id,
                        p.connection_state,
                        p.has_stream()
                    );
                }
                if let Some(error) = &snapshot.error {
                    warn!("Server error: {}", error);
                }
            }
            changed = chat.changed() => {
                if changed.is_err() {
                    break;
                }
                let log = chat.borrow_and_update().clone();
                for message in log.iter().skip(chat_seen) {
                    info!("[chat] {}: {}", message.sender, message.message);
                }
                chat_seen = log.len();
            }
            line = stdin.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) if line.trim() == "/quit" => break,
                    Ok(Some(line)) if line.trim() == "/screen" => {
                        if !media.stop_screen_share() {
                            if let Err(e) = media.start_screen_share(&devices).await {
                                warn!("Screen share failed: {}", e);
                            }
                        }
                    }
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => {
                        if !call.send_chat(&line).await? {
                            info!("Chat message will be sent once signaling reconnects");
                        }
                    }
                    // stdin closed; keep the call running until Ctrl+C
                    Ok(None) => stdin_open = false,
                    Err(e) => {
                        warn!("Failed to read stdin, chat input disabled: {}", e);
                        stdin_open = false;
                    }
                }
            }
        }
    }

    if let Err(e) = call.shutdown().await {
        warn!("Call session ended early: {}", e);
    }
    media.stop();
    for pump in pumps {
        pump.abort();
    }

    info!("meshcall stopped");
    Ok(())
}
