//! `lockstep_shared`
//!
//! Transport pieces used by both client and server.
//!
//! Design goals:
//! - Every frame is integrity-checked; nothing on network input panics.
//! - Bounded queues between the socket and the tick thread, drop on overflow.
//! - Protocol state is mutated only from an explicit, externally driven step.
//! - No `unsafe`.

pub mod agent;
pub mod arena;
pub mod config;
pub mod event;
pub mod message;
pub mod metrics;
pub mod payload;
pub mod pump;
pub mod queue;
pub mod registry;
pub mod sequence;
pub mod wire;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::agent::{drain_inbound, Agent, Endpoint};
    pub use crate::arena::{Arena, Handle};
    pub use crate::config::*;
    pub use crate::event::*;
    pub use crate::message::*;
    pub use crate::metrics::{MetricsSnapshot, NetMetrics};
    pub use crate::payload::*;
    pub use crate::registry::{Dispatch, FunctionRegistry};
    pub use crate::sequence::SequenceState;
    pub use crate::wire::{WireMessage, MAX_CONTENT_SIZE, MAX_MESSAGE_SIZE};
}
