//! Per-peer message indices.
//!
//! Each side numbers its outgoing frames from 1 and remembers the highest
//! index it accepted from the other side. A frame whose index is not newer
//! than that is stale: a duplicate, a replay or an out-of-order arrival.

use crate::message::MessageIndex;

/// Send and receive counters for one remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceState {
    next_send: MessageIndex,
    last_received: MessageIndex,
}

impl Default for SequenceState {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceState {
    pub fn new() -> Self {
        Self {
            next_send: 1,
            last_received: 0,
        }
    }

    /// Returns the index for the next outgoing frame and advances the counter.
    /// Sticks at `u32::MAX`; the peer refuses anything after that as stale.
    pub fn next_send_index(&mut self) -> MessageIndex {
        let index = self.next_send;
        self.next_send = self.next_send.saturating_add(1);
        index
    }

    /// Index the next outgoing frame will carry.
    pub fn peek_send_index(&self) -> MessageIndex {
        self.next_send
    }

    /// Highest index accepted so far (0 before the first frame).
    pub fn last_received(&self) -> MessageIndex {
        self.last_received
    }

    /// Accepts `incoming` if it is newer than anything seen before.
    pub fn accept(&mut self, incoming: MessageIndex) -> bool {
        if incoming <= self.last_received {
            return false;
        }
        self.last_received = incoming;
        true
    }
}
