//! Typed message payloads.
//!
//! Payloads are packed field by field in little-endian order. Nothing here
//! reinterprets memory; every read is bounds-checked and a short buffer is a
//! [`PayloadError`], never a panic.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::message::{PlayerId, RoomId};

/// Upper bound on members in one room (and in one snapshot).
pub const MAX_ROOM_MEMBERS: usize = 64;

/// Upper bound on entries in a `RoomList` reply.
pub const MAX_ROOMS_IN_LIST: usize = 32;

/// Payload decode failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("payload too short: needed {needed} more bytes, {available} available")]
    TooShort { needed: usize, available: usize },
    #[error("payload lists {count} entries, maximum is {max}")]
    TooManyEntries { count: usize, max: usize },
}

/// A value that can travel as frame content.
pub trait NetPayload: Sized {
    fn encode(&self, buf: &mut BytesMut);
    fn decode(content: &[u8]) -> Result<Self, PayloadError>;
}

/// Encodes a payload into an owned buffer.
pub fn to_bytes<P: NetPayload>(payload: &P) -> Bytes {
    let mut buf = BytesMut::new();
    payload.encode(&mut buf);
    buf.freeze()
}

/// Bounds-checked cursor over frame content.
pub struct PayloadReader<'a> {
    buf: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize) -> Result<(), PayloadError> {
        if self.buf.remaining() < n {
            return Err(PayloadError::TooShort {
                needed: n,
                available: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn u32(&mut self) -> Result<u32, PayloadError> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8], PayloadError> {
        self.need(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    /// Length-prefixed count, rejected above `max`.
    pub fn count(&mut self, max: usize) -> Result<usize, PayloadError> {
        let count = self.u32()? as usize;
        if count > max {
            return Err(PayloadError::TooManyEntries { count, max });
        }
        Ok(count)
    }

    pub fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }
}

/// Messages without data. Accepts any content (including the empty-content pad).
impl NetPayload for () {
    fn encode(&self, _buf: &mut BytesMut) {}

    fn decode(_content: &[u8]) -> Result<Self, PayloadError> {
        Ok(())
    }
}

impl NetPayload for u32 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(*self);
    }

    fn decode(content: &[u8]) -> Result<Self, PayloadError> {
        PayloadReader::new(content).u32()
    }
}

impl NetPayload for PlayerId {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.0);
    }

    fn decode(content: &[u8]) -> Result<Self, PayloadError> {
        u32::decode(content).map(PlayerId)
    }
}

impl NetPayload for RoomId {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.0);
    }

    fn decode(content: &[u8]) -> Result<Self, PayloadError> {
        u32::decode(content).map(RoomId)
    }
}

/// Raw application bytes.
impl NetPayload for Bytes {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(self);
    }

    fn decode(content: &[u8]) -> Result<Self, PayloadError> {
        Ok(Bytes::copy_from_slice(content))
    }
}

/// Room id, host and the full ordered member list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub room_id: RoomId,
    pub host: Option<PlayerId>,
    pub members: Vec<PlayerId>,
}

impl RoomSnapshot {
    pub fn contains(&self, player: PlayerId) -> bool {
        self.members.contains(&player)
    }

    fn encode_fields(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.room_id.0);
        buf.put_u32_le(self.host.unwrap_or(PlayerId::NONE).0);
        buf.put_u32_le(self.members.len() as u32);
        for m in &self.members {
            buf.put_u32_le(m.0);
        }
    }

    fn read_fields(r: &mut PayloadReader<'_>) -> Result<Self, PayloadError> {
        let room_id = RoomId(r.u32()?);
        let host = PlayerId(r.u32()?);
        let count = r.count(MAX_ROOM_MEMBERS)?;
        let mut members = Vec::with_capacity(count);
        for _ in 0..count {
            members.push(PlayerId(r.u32()?));
        }
        Ok(Self {
            room_id,
            host: (!host.is_none()).then_some(host),
            members,
        })
    }
}

impl NetPayload for RoomSnapshot {
    fn encode(&self, buf: &mut BytesMut) {
        self.encode_fields(buf);
    }

    fn decode(content: &[u8]) -> Result<Self, PayloadError> {
        Self::read_fields(&mut PayloadReader::new(content))
    }
}

/// A member joined or left; carries the room state after the change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberChange {
    pub room: RoomSnapshot,
    pub player: PlayerId,
}

impl NetPayload for MemberChange {
    fn encode(&self, buf: &mut BytesMut) {
        self.room.encode_fields(buf);
        buf.put_u32_le(self.player.0);
    }

    fn decode(content: &[u8]) -> Result<Self, PayloadError> {
        let mut r = PayloadReader::new(content);
        let room = RoomSnapshot::read_fields(&mut r)?;
        let player = PlayerId(r.u32()?);
        Ok(Self { room, player })
    }
}

/// One row of a `RoomList` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomListEntry {
    pub room_id: RoomId,
    pub host: Option<PlayerId>,
    pub player_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomList {
    pub entries: Vec<RoomListEntry>,
}

impl NetPayload for RoomList {
    fn encode(&self, buf: &mut BytesMut) {
        let count = self.entries.len().min(MAX_ROOMS_IN_LIST);
        buf.put_u32_le(count as u32);
        for e in &self.entries[..count] {
            buf.put_u32_le(e.room_id.0);
            buf.put_u32_le(e.host.unwrap_or(PlayerId::NONE).0);
            buf.put_u32_le(e.player_count);
        }
    }

    fn decode(content: &[u8]) -> Result<Self, PayloadError> {
        let mut r = PayloadReader::new(content);
        let count = r.count(MAX_ROOMS_IN_LIST)?;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let room_id = RoomId(r.u32()?);
            let host = PlayerId(r.u32()?);
            let player_count = r.u32()?;
            entries.push(RoomListEntry {
                room_id,
                host: (!host.is_none()).then_some(host),
                player_count,
            });
        }
        Ok(Self { entries })
    }
}

/// Application message relayed by a room (`GenericGameplay`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayedPayload {
    pub sender: PlayerId,
    pub type_id: u32,
    pub data: Bytes,
}

impl NetPayload for RelayedPayload {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.sender.0);
        buf.put_u32_le(self.type_id);
        buf.put_slice(&self.data);
    }

    fn decode(content: &[u8]) -> Result<Self, PayloadError> {
        let mut r = PayloadReader::new(content);
        let sender = PlayerId(r.u32()?);
        let type_id = r.u32()?;
        Ok(Self {
            sender,
            type_id,
            data: Bytes::copy_from_slice(r.rest()),
        })
    }
}

/// Application message re-emitted at a tick boundary (`GenericGameplayWithTime`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedPayload {
    pub game_time: u32,
    pub sender: PlayerId,
    pub type_id: u32,
    pub data: Bytes,
}

/// Bytes a [`TimedPayload`] adds in front of the application data.
pub const TIMED_PAYLOAD_OVERHEAD: usize = 12;

impl NetPayload for TimedPayload {
    fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(TIMED_PAYLOAD_OVERHEAD + self.data.len());
        buf.put_u32_le(self.game_time);
        buf.put_u32_le(self.sender.0);
        buf.put_u32_le(self.type_id);
        buf.put_slice(&self.data);
    }

    fn decode(content: &[u8]) -> Result<Self, PayloadError> {
        let mut r = PayloadReader::new(content);
        let game_time = r.u32()?;
        let sender = PlayerId(r.u32()?);
        let type_id = r.u32()?;
        Ok(Self {
            game_time,
            sender,
            type_id,
            data: Bytes::copy_from_slice(r.rest()),
        })
    }
}
