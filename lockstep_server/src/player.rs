//! Connection records.

use std::net::SocketAddr;
use std::time::Duration;

use lockstep_shared::{
    message::{MessageIndex, PlayerId, RoomId},
    sequence::SequenceState,
};

/// One connected remote endpoint.
#[derive(Debug, Clone)]
pub struct Player {
    pub id: PlayerId,
    pub endpoint: SocketAddr,
    pub sequence: SequenceState,
    pub room: Option<RoomId>,
    /// Server clock value at the last accepted message.
    pub last_activity: Duration,
}

impl Player {
    pub fn new(id: PlayerId, endpoint: SocketAddr, now: Duration) -> Self {
        Self {
            id,
            endpoint,
            sequence: SequenceState::new(),
            room: None,
            last_activity: now,
        }
    }

    /// Index of the last accepted incoming frame.
    pub fn receive_index(&self) -> MessageIndex {
        self.sequence.last_received()
    }

    pub fn idle_for(&self, now: Duration) -> Duration {
        now.saturating_sub(self.last_activity)
    }
}
