//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p lockstep_server -- [--config server.json] [--addr 0.0.0.0:40000]
//!       [--tick-hz 60] [--room-kind plain|ticking|lockstep] [--sync-type 1000]...
//!
//! The server accepts connections, manages rooms and steps every room on a
//! fixed-rate loop. Set `RUST_LOG=debug` for per-message logs.

use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use lockstep_server::server::{Server, ServerEvent};
use lockstep_shared::agent::Endpoint;
use lockstep_shared::config::{NetConfig, RoomKind};
use tracing::{info, warn};

fn parse_room_kind(s: &str) -> Option<RoomKind> {
    match s {
        "plain" => Some(RoomKind::Plain),
        "ticking" => Some(RoomKind::Ticking),
        "lockstep" => Some(RoomKind::Lockstep),
        _ => None,
    }
}

fn parse_args() -> anyhow::Result<NetConfig> {
    let args: Vec<String> = env::args().collect();

    // The config file is the base; flags override it.
    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => NetConfig::from_file(Path::new(&args[i + 1]))?,
        _ => NetConfig::default(),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().unwrap_or(60);
                i += 2;
            }
            "--room-kind" if i + 1 < args.len() => {
                match parse_room_kind(&args[i + 1]) {
                    Some(kind) => cfg.room_kind = kind,
                    None => warn!(value = %args[i + 1], "unknown room kind, keeping {:?}", cfg.room_kind),
                }
                i += 2;
            }
            "--sync-type" if i + 1 < args.len() => {
                match args[i + 1].parse() {
                    Ok(type_id) => cfg.sync_message_types.push(type_id),
                    Err(_) => warn!(value = %args[i + 1], "invalid sync type id"),
                }
                i += 2;
            }
            "--peer-timeout-ms" if i + 1 < args.len() => {
                cfg.peer_timeout_ms = args[i + 1].parse().unwrap_or(cfg.peer_timeout_ms);
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(cfg)
}

fn log_event(event: &ServerEvent) {
    match event {
        ServerEvent::PlayerConnected { player, endpoint } => {
            info!(player_id = %player, %endpoint, "event: player connected")
        }
        ServerEvent::PlayerDisconnected { player, reason } => {
            info!(player_id = %player, ?reason, "event: player disconnected")
        }
        ServerEvent::RoomCreated { room, host } => {
            info!(%room, ?host, "event: room created")
        }
        ServerEvent::PlayerJoinedRoom { room, player } => {
            info!(%room, player_id = %player, "event: player joined room")
        }
        ServerEvent::PlayerLeftRoom { room, player } => {
            info!(%room, player_id = %player, "event: player left room")
        }
        ServerEvent::RoomDissolved { room } => info!(%room, "event: room dissolved"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args().context("parse arguments")?;
    info!(
        addr = %cfg.server_addr,
        tick_hz = cfg.tick_hz,
        room_kind = ?cfg.room_kind,
        sync_types = ?cfg.sync_message_types,
        "Starting server"
    );

    let tick_interval = cfg.tick_interval();
    let mut server = Server::new(cfg).await.context("create server")?;
    info!(local = %server.local_addr()?, "Server listening");

    let mut next_tick = tokio::time::Instant::now();
    let mut since_report = Duration::ZERO;
    loop {
        server.step(tick_interval).await?;

        for event in server.drain_events() {
            log_event(&event);
        }

        since_report += tick_interval;
        if since_report >= Duration::from_secs(5) {
            since_report = Duration::ZERO;
            let metrics = server.metrics();
            info!(
                players = server.player_count(),
                rooms = server.room_count(),
                %metrics,
                "status"
            );
        }

        next_tick += tick_interval;
        tokio::time::sleep_until(next_tick).await;
    }
}
