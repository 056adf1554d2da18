//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p lockstep_client -- [--config client.json] [--addr 127.0.0.1:40000]
//!       [--host | --join <room>] [--input-type 1000]
//!
//! The client connects, optionally hosts or joins a room, and with
//! `--input-type` sends a counter as a sync input on every step.
//!
//! Console commands:
//!   host          - Host a new room
//!   join <room>   - Join a room by id
//!   leave         - Leave the current room
//!   rooms         - Request the room list
//!   info          - Request the current room's snapshot
//!   status        - Show client status
//!   quit          - Disconnect and exit

use std::env;
use std::io::{BufRead, Write};
use std::path::Path;

use anyhow::Context;
use lockstep_client::client::{Client, ClientEvent};
use lockstep_shared::agent::Endpoint;
use lockstep_shared::config::NetConfig;
use lockstep_shared::message::RoomId;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy)]
enum RoomPlan {
    None,
    Host,
    Join(RoomId),
}

struct Args {
    cfg: NetConfig,
    plan: RoomPlan,
    input_type: Option<u32>,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = env::args().collect();
    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => NetConfig::from_file(Path::new(&args[i + 1]))?,
        _ => NetConfig::default(),
    };
    let mut plan = RoomPlan::None;
    let mut input_type = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--bind" if i + 1 < args.len() => {
                cfg.bind_addr = args[i + 1].clone();
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().unwrap_or(60);
                i += 2;
            }
            "--host" => {
                plan = RoomPlan::Host;
                i += 1;
            }
            "--join" if i + 1 < args.len() => {
                let room = args[i + 1].parse().context("--join expects a room id")?;
                plan = RoomPlan::Join(RoomId(room));
                i += 2;
            }
            "--input-type" if i + 1 < args.len() => {
                input_type = Some(args[i + 1].parse().context("--input-type expects a type id")?);
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(Args {
        cfg,
        plan,
        input_type,
    })
}

/// Runs one console command. Returns `false` when the client should exit.
fn exec_console(client: &mut Client, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some("host") => {
            client.request_host_room();
        }
        Some("join") => match parts.next().and_then(|s| s.parse().ok()) {
            Some(id) => {
                client.request_join_room(RoomId(id));
            }
            None => println!("usage: join <room>"),
        },
        Some("leave") => {
            client.request_leave_room();
        }
        Some("rooms") => {
            client.request_room_list();
        }
        Some("info") => {
            client.request_room_info();
        }
        Some("status") => {
            println!("state: {:?}", client.state());
            println!("room: {:?}", client.room());
            println!("game time: {}", client.game_time());
            println!("net: {}", client.metrics());
        }
        Some("quit") => return false,
        Some(other) => println!("unknown command: {other}"),
        None => {}
    }
    true
}

fn report(event: &ClientEvent) {
    match event {
        ClientEvent::RoomListReceived(list) => {
            println!("{} room(s):", list.entries.len());
            for e in &list.entries {
                println!("  {} host={:?} players={}", e.room_id, e.host, e.player_count);
            }
        }
        other => info!(event = ?other, "client event"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let Args {
        cfg,
        plan,
        input_type,
    } = parse_args().context("parse arguments")?;
    info!(server = %cfg.server_addr, ?plan, "Starting client");

    let tick_interval = cfg.tick_interval();
    let mut client = Client::new(cfg).await.context("create client")?;
    if let Some(ty) = input_type {
        client.register_function(ty, |c: &mut Client, origin, counter: u32| {
            debug!(sender = %origin.sender, game_time = ?origin.game_time, counter, local_time = c.game_time(), "input");
        });
    }
    client.connect();

    // Set up console input channel.
    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            if stdin.lock().read_line(&mut line).is_err() {
                break;
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    let mut counter: u32 = 0;
    let mut next_tick = tokio::time::Instant::now();
    'main: loop {
        while let Ok(line) = console_rx.try_recv() {
            if !exec_console(&mut client, &line) {
                break 'main;
            }
        }

        client.step(tick_interval).await?;

        for event in client.drain_events() {
            if let ClientEvent::Connected(_) = event {
                match plan {
                    RoomPlan::Host => {
                        client.request_host_room();
                    }
                    RoomPlan::Join(room) => {
                        client.request_join_room(room);
                    }
                    RoomPlan::None => {}
                }
            }
            report(&event);
        }

        if let Some(ty) = input_type {
            if client.room().is_some() {
                counter = counter.wrapping_add(1);
                client.send_to_room(ty, &counter);
            }
        }

        next_tick += tick_interval;
        tokio::time::sleep_until(next_tick).await;
    }

    client.disconnect();
    client.step(tick_interval).await?;
    info!("Client exited");
    Ok(())
}
