//! `lockstep_client`
//!
//! Client-side systems:
//! - Connection handshake with retry and heartbeat
//! - Room requests and room snapshot tracking
//! - Application payloads to and from the current room
//! - Game time from ticking rooms

pub mod client;

pub use client::{Client, ClientEvent, ConnectionState, MessageOrigin};
