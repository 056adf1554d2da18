//! Configuration.
//!
//! Loads transport configuration from JSON strings/files. Every field has a
//! default so a config file only needs the values it changes.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::queue::DEFAULT_QUEUE_CAPACITY;

/// Behaviour attached to rooms created by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    /// Membership and relay only.
    #[default]
    Plain,
    /// Adds a fixed-interval tick advancing the room's game time.
    Ticking,
    /// Ticking, and sync messages are aggregated and re-emitted per tick.
    Lockstep,
}

/// Root configuration shared by client/server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Server address. The server binds it; clients send to it.
    pub server_addr: String,
    /// Local bind address for clients.
    pub bind_addr: String,
    /// Rate at which the driver steps the agent.
    pub tick_hz: u32,
    /// Slots in each of the send and receive queues.
    pub queue_capacity: usize,
    /// Logical milliseconds between room ticks.
    pub room_tick_interval_ms: u32,
    /// Kind of room created by `HostRoom`.
    pub room_kind: RoomKind,
    /// Application message types aggregated by lockstep rooms.
    pub sync_message_types: Vec<u32>,
    /// Players silent for longer than this are disconnected. 0 disables.
    pub peer_timeout_ms: u64,
    /// Client heartbeat period while connected.
    pub heartbeat_interval_ms: u64,
    /// Client resend period for an unanswered connect request.
    pub connect_retry_ms: u64,
    /// Whether clients may host/join/leave rooms themselves.
    pub users_can_manage_rooms: bool,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:40000".to_string(),
            bind_addr: "0.0.0.0:0".to_string(),
            tick_hz: 60,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            room_tick_interval_ms: 20,
            room_kind: RoomKind::Plain,
            sync_message_types: Vec::new(),
            peer_timeout_ms: 10_000,
            heartbeat_interval_ms: 1_000,
            connect_retry_ms: 500,
            users_can_manage_rooms: true,
        }
    }
}

impl NetConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Reads and parses a JSON config file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("parse config {}", path.display()))
    }

    /// Wall-clock period of one agent step.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_hz.max(1)))
    }
}
