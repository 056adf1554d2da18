//! Message identifiers.
//!
//! The type-id space is an open `u32` range:
//! - `1..100` are framework control messages handled by the agents.
//! - `GenericGameplay` / `GenericGameplayWithTime` wrap application payloads
//!   relayed or re-emitted by rooms.
//! - `FIRST_APPLICATION_TYPE..` is free for the embedding application.

use serde::{Deserialize, Serialize};

/// Per-sender sequence number carried by every frame.
pub type MessageIndex = u32;

/// First type id available to the embedding application.
pub const FIRST_APPLICATION_TYPE: u32 = 1000;

/// Identifies a connected player. Assigned by the server in ascending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PlayerId(pub u32);

impl PlayerId {
    /// Placeholder used where no player is meant (e.g. a room without host).
    pub const NONE: PlayerId = PlayerId(0);

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl std::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifies a room. Assigned by the server in ascending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoomId(pub u32);

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "room#{}", self.0)
    }
}

/// Framework message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    // ─── Connection ───
    RequestConnect = 1,
    Connected = 2,
    ErrorAlreadyConnected = 3,
    Disconnect = 4,
    Heartbeat = 5,

    // ─── Rooms ───
    HostRoom = 10,
    JoinRoom = 11,
    RoomJoined = 12,
    UserJoinedRoom = 13,
    GetRoomInfo = 14,
    RoomInfo = 15,
    GetRooms = 16,
    RoomList = 17,
    LeaveRoom = 18,
    UserLeftRoom = 19,
    RoomDissolved = 20,
    ErrorRoomNotFound = 21,
    ErrorNotInRoom = 22,

    // ─── Time ───
    AdvanceTime = 30,

    // ─── Gameplay wrappers ───
    GenericGameplay = 100,
    GenericGameplayWithTime = 101,
}

impl MessageType {
    pub const fn id(self) -> u32 {
        self as u32
    }

    pub fn from_id(id: u32) -> Option<Self> {
        use MessageType::*;
        Some(match id {
            1 => RequestConnect,
            2 => Connected,
            3 => ErrorAlreadyConnected,
            4 => Disconnect,
            5 => Heartbeat,
            10 => HostRoom,
            11 => JoinRoom,
            12 => RoomJoined,
            13 => UserJoinedRoom,
            14 => GetRoomInfo,
            15 => RoomInfo,
            16 => GetRooms,
            17 => RoomList,
            18 => LeaveRoom,
            19 => UserLeftRoom,
            20 => RoomDissolved,
            21 => ErrorRoomNotFound,
            22 => ErrorNotInRoom,
            30 => AdvanceTime,
            100 => GenericGameplay,
            101 => GenericGameplayWithTime,
            _ => return None,
        })
    }

    /// True for the `Error_*` replies.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            MessageType::ErrorAlreadyConnected
                | MessageType::ErrorRoomNotFound
                | MessageType::ErrorNotInRoom
        )
    }
}

impl From<MessageType> for u32 {
    fn from(t: MessageType) -> u32 {
        t.id()
    }
}

/// True if `type_id` belongs to the application range.
pub fn is_application_type(type_id: u32) -> bool {
    type_id >= FIRST_APPLICATION_TYPE
}
