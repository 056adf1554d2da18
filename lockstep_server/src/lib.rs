//! `lockstep_server`
//!
//! Server-side systems:
//! - Connection handshake and the player table
//! - Room lifecycle (host, join, leave, dissolve)
//! - Ticking and lockstep rooms driven by logical time
//!
//! The server is stepped by an external driver; see `main.rs` for the
//! fixed-rate loop used by the standalone binary.

pub mod player;
pub mod room;
pub mod server;

pub use player::Player;
pub use room::{LockstepBuffer, Room, RoomSend, TickPolicy};
pub use server::{DisconnectReason, Server, ServerEvent, SessionError};
