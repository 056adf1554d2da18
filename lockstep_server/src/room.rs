//! Rooms.
//!
//! A [`Room`] is a host plus an ordered member list. Time and aggregation
//! behaviour are optional strategies composed into it:
//! - [`TickPolicy`]: advances an authoritative `game_time` on fixed intervals
//!   of logical time and broadcasts one `AdvanceTime` per step that crosses
//!   at least one tick.
//! - [`LockstepBuffer`]: holds sync-type messages until the next tick, then
//!   re-emits them to every member stamped with the new game time.
//!
//! Rooms never touch the socket. Everything they want delivered is appended
//! to an outbox of [`RoomSend`]s which the server turns into frames.

use std::collections::HashSet;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use lockstep_shared::{
    config::{NetConfig, RoomKind},
    message::{is_application_type, MessageType, PlayerId, RoomId},
    payload::{
        to_bytes, RelayedPayload, RoomListEntry, RoomSnapshot, TimedPayload, MAX_ROOM_MEMBERS,
        TIMED_PAYLOAD_OVERHEAD,
    },
    wire::MAX_CONTENT_SIZE,
};
use tracing::{debug, trace, warn};

/// A message a room wants delivered to one player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSend {
    pub to: PlayerId,
    pub type_id: u32,
    pub content: Bytes,
}

/// Fixed-interval logical clock.
#[derive(Debug, Clone)]
pub struct TickPolicy {
    interval: Duration,
    accumulator: Duration,
    game_time: u32,
}

impl TickPolicy {
    pub fn new(interval_ms: u32) -> Self {
        Self {
            interval: Duration::from_millis(u64::from(interval_ms.max(1))),
            accumulator: Duration::ZERO,
            game_time: 0,
        }
    }

    pub fn interval_ms(&self) -> u32 {
        self.interval.as_millis() as u32
    }

    pub fn game_time(&self) -> u32 {
        self.game_time
    }

    /// Adds `elapsed` and returns how many tick boundaries were crossed.
    fn accumulate(&mut self, elapsed: Duration) -> u32 {
        self.accumulator += elapsed;
        let mut ticks = 0;
        while self.accumulator >= self.interval {
            self.accumulator -= self.interval;
            ticks += 1;
        }
        ticks
    }

    /// Moves game time forward by one interval and returns the new value.
    fn tick(&mut self) -> u32 {
        self.game_time = self.game_time.wrapping_add(self.interval_ms());
        self.game_time
    }
}

/// One buffered sync message; its bytes live in [`LockstepBuffer`]'s data region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncRecord {
    pub type_id: u32,
    pub sender: PlayerId,
    pub len: usize,
}

/// Per-tick scratch buffer for sync messages.
#[derive(Debug, Clone, Default)]
pub struct LockstepBuffer {
    sync_types: HashSet<u32>,
    data: BytesMut,
    records: Vec<SyncRecord>,
}

impl LockstepBuffer {
    pub fn new(sync_types: impl IntoIterator<Item = u32>) -> Self {
        Self {
            sync_types: sync_types.into_iter().collect(),
            data: BytesMut::new(),
            records: Vec::new(),
        }
    }

    pub fn is_sync_type(&self, type_id: u32) -> bool {
        self.sync_types.contains(&type_id)
    }

    pub fn add_sync_type(&mut self, type_id: u32) {
        self.sync_types.insert(type_id);
    }

    pub fn records(&self) -> &[SyncRecord] {
        &self.records
    }

    fn push(&mut self, sender: PlayerId, type_id: u32, content: &[u8]) {
        self.data.extend_from_slice(content);
        self.records.push(SyncRecord {
            type_id,
            sender,
            len: content.len(),
        });
    }

    /// Re-emits every record, in submission order, to every member.
    fn flush(&mut self, game_time: u32, members: &[PlayerId], out: &mut Vec<RoomSend>) {
        let mut data = self.data.split().freeze();
        for record in self.records.drain(..) {
            let chunk = data.split_to(record.len);
            let timed = TimedPayload {
                game_time,
                sender: record.sender,
                type_id: record.type_id,
                data: chunk,
            };
            let content = to_bytes(&timed);
            for &to in members {
                out.push(RoomSend {
                    to,
                    type_id: MessageType::GenericGameplayWithTime.id(),
                    content: content.clone(),
                });
            }
        }
    }
}

/// A session of players sharing a host.
#[derive(Debug, Clone)]
pub struct Room {
    id: RoomId,
    host: Option<PlayerId>,
    members: Vec<PlayerId>,
    active: bool,
    joinable: bool,
    tick: Option<TickPolicy>,
    lockstep: Option<LockstepBuffer>,
}

impl Room {
    /// A room with neither tick nor aggregation: application messages are
    /// relayed to the other members as they arrive.
    pub fn plain(id: RoomId) -> Self {
        Self {
            id,
            host: None,
            members: Vec::new(),
            active: true,
            joinable: true,
            tick: None,
            lockstep: None,
        }
    }

    /// Builds a room of the kind `config` selects.
    pub fn from_config(id: RoomId, config: &NetConfig) -> Self {
        let room = Self::plain(id);
        match config.room_kind {
            RoomKind::Plain => room,
            RoomKind::Ticking => room.with_tick(config.room_tick_interval_ms),
            RoomKind::Lockstep => room
                .with_tick(config.room_tick_interval_ms)
                .with_lockstep(config.sync_message_types.iter().copied()),
        }
    }

    pub fn with_tick(mut self, interval_ms: u32) -> Self {
        self.tick = Some(TickPolicy::new(interval_ms));
        self
    }

    /// Buffers the given types until the next tick. Without a tick policy
    /// the buffer is flushed on every advance.
    pub fn with_lockstep(mut self, sync_types: impl IntoIterator<Item = u32>) -> Self {
        self.lockstep = Some(LockstepBuffer::new(sync_types));
        self
    }

    pub fn id(&self) -> RoomId {
        self.id
    }

    pub fn host(&self) -> Option<PlayerId> {
        self.host
    }

    pub fn members(&self) -> &[PlayerId] {
        &self.members
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn contains(&self, player: PlayerId) -> bool {
        self.members.contains(&player)
    }

    pub fn is_host(&self, player: PlayerId) -> bool {
        self.host == Some(player)
    }

    pub fn tick_policy(&self) -> Option<&TickPolicy> {
        self.tick.as_ref()
    }

    pub fn lockstep(&self) -> Option<&LockstepBuffer> {
        self.lockstep.as_ref()
    }

    pub fn lockstep_mut(&mut self) -> Option<&mut LockstepBuffer> {
        self.lockstep.as_mut()
    }

    /// Authoritative game time; zero for rooms without a tick policy.
    pub fn game_time(&self) -> u32 {
        self.tick.as_ref().map_or(0, TickPolicy::game_time)
    }

    pub fn set_joinable(&mut self, joinable: bool) {
        self.joinable = joinable;
    }

    pub fn can_be_joined(&self) -> bool {
        self.active && self.joinable && self.members.len() < MAX_ROOM_MEMBERS
    }

    /// Appends `player`. The first member of a hostless room becomes host.
    pub fn add_member(&mut self, player: PlayerId) -> bool {
        if !self.can_be_joined() || self.contains(player) {
            return false;
        }
        self.members.push(player);
        if self.host.is_none() {
            self.host = Some(player);
        }
        true
    }

    /// Removes `player` from the member list. The host field is left as is so
    /// the caller can tell a host departure apart.
    pub fn remove_member(&mut self, player: PlayerId) -> bool {
        let before = self.members.len();
        self.members.retain(|&m| m != player);
        self.members.len() != before
    }

    /// Marks the room dissolved and returns the members that were still in it.
    pub fn dissolve(&mut self) -> Vec<PlayerId> {
        self.active = false;
        self.joinable = false;
        self.host = None;
        if let Some(buffer) = self.lockstep.as_mut() {
            buffer.data.clear();
            buffer.records.clear();
        }
        std::mem::take(&mut self.members)
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            room_id: self.id,
            host: self.host,
            members: self.members.clone(),
        }
    }

    pub fn list_entry(&self) -> RoomListEntry {
        RoomListEntry {
            room_id: self.id,
            host: self.host,
            player_count: self.members.len() as u32,
        }
    }

    /// Offers a message the server's registry did not handle.
    ///
    /// Sync types are buffered; other application types are relayed to every
    /// other member. Returns `false` if the room has no use for the message.
    pub fn handle_message(
        &mut self,
        sender: PlayerId,
        type_id: u32,
        content: &[u8],
        out: &mut Vec<RoomSend>,
    ) -> bool {
        if !self.active || !self.contains(sender) {
            return false;
        }

        if let Some(buffer) = self.lockstep.as_mut() {
            if buffer.is_sync_type(type_id) {
                if content.len() + TIMED_PAYLOAD_OVERHEAD > MAX_CONTENT_SIZE {
                    warn!(room = %self.id, %sender, type_id, "sync message too large to re-emit, dropping");
                    return true;
                }
                trace!(room = %self.id, %sender, type_id, len = content.len(), "sync message buffered");
                buffer.push(sender, type_id, content);
                return true;
            }
        }

        if !is_application_type(type_id) {
            return false;
        }
        let relayed = to_bytes(&RelayedPayload {
            sender,
            type_id,
            data: Bytes::copy_from_slice(content),
        });
        if relayed.len() > MAX_CONTENT_SIZE {
            warn!(room = %self.id, %sender, type_id, "relayed message too large, dropping");
            return true;
        }
        for &to in self.members.iter().filter(|&&m| m != sender) {
            out.push(RoomSend {
                to,
                type_id: MessageType::GenericGameplay.id(),
                content: relayed.clone(),
            });
        }
        true
    }

    /// Advances logical time. Returns the number of ticks that elapsed.
    pub fn advance(&mut self, elapsed: Duration, out: &mut Vec<RoomSend>) -> u32 {
        if !self.active {
            return 0;
        }
        let Room {
            id,
            members,
            tick,
            lockstep,
            ..
        } = self;
        let members: &[PlayerId] = members;

        let Some(tick) = tick.as_mut() else {
            if let Some(buffer) = lockstep.as_mut() {
                buffer.flush(0, members, out);
            }
            return 0;
        };

        let ticks = tick.accumulate(elapsed);
        if ticks == 0 {
            return 0;
        }
        // Buffered input belongs to the first tick crossed; members learn
        // only the final time, however many ticks a long step covered.
        let first = tick.tick();
        if let Some(buffer) = lockstep.as_mut() {
            buffer.flush(first, members, out);
        }
        for _ in 1..ticks {
            tick.tick();
        }
        let advance = Bytes::copy_from_slice(&tick.game_time().to_le_bytes());
        for &to in members {
            out.push(RoomSend {
                to,
                type_id: MessageType::AdvanceTime.id(),
                content: advance.clone(),
            });
        }
        if ticks > 1 {
            debug!(room = %id, ticks, game_time = tick.game_time(), "room caught up several ticks");
        }
        ticks
    }
}
