//! Client agent.
//!
//! Connects to a server, issues room requests and exchanges application
//! payloads with the rest of its room. Like the server it is stepped by the
//! embedding application; nothing here blocks.
//!
//! Application messages arrive wrapped by the room:
//! - `GenericGameplay` for messages relayed as they arrive,
//! - `GenericGameplayWithTime` for sync messages re-emitted on a tick.
//! Both are unwrapped and dispatched under the original type id, with the
//! sender and (for the latter) the game time passed as [`MessageOrigin`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use lockstep_shared::{
    agent::{Agent, Endpoint},
    config::NetConfig,
    event::{EventHook, EventQueue},
    message::{is_application_type, MessageType, PlayerId, RoomId},
    metrics::MetricsSnapshot,
    payload::{
        to_bytes, MemberChange, NetPayload, RelayedPayload, RoomList, RoomSnapshot, TimedPayload,
    },
    registry::{Dispatch, FunctionRegistry},
    sequence::SequenceState,
    wire::WireMessage,
};
use tracing::{debug, info, trace, warn};

/// Connection state as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected(PlayerId),
}

/// Connection and room changes observed by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected(PlayerId),
    Disconnected,
    RoomJoined(RoomSnapshot),
    PlayerJoinedRoom { room: RoomSnapshot, player: PlayerId },
    PlayerLeftRoom { room: RoomSnapshot, player: PlayerId },
    RoomInfo(RoomSnapshot),
    RoomListReceived(RoomList),
    /// The room was dissolved because its host left.
    Kicked(RoomId),
    /// The server refused a request.
    Error(MessageType),
}

/// Who sent an application message, and the game time it was stamped with.
///
/// Control messages from the server carry `PlayerId::NONE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageOrigin {
    pub sender: PlayerId,
    pub game_time: Option<u32>,
}

impl MessageOrigin {
    const SERVER: MessageOrigin = MessageOrigin {
        sender: PlayerId::NONE,
        game_time: None,
    };
}

pub type ClientRegistry = FunctionRegistry<Client, MessageOrigin>;

/// Client endpoint.
pub struct Client {
    agent: Agent,
    config: NetConfig,
    server: SocketAddr,

    state: ConnectionState,
    sequence: SequenceState,
    room: Option<RoomSnapshot>,
    room_list: Option<RoomList>,
    game_time: u32,

    /// Logical clock, advanced only by `step`.
    clock: Duration,
    last_connect_attempt: Duration,
    last_send: Duration,

    registry: Arc<ClientRegistry>,
    events: EventQueue<ClientEvent>,
}

impl Client {
    /// Binds to `config.bind_addr`; the server is `config.server_addr`.
    pub async fn new(config: NetConfig) -> anyhow::Result<Self> {
        let bind: SocketAddr = config
            .bind_addr
            .parse()
            .with_context(|| format!("parse bind address {:?}", config.bind_addr))?;
        let server: SocketAddr = config
            .server_addr
            .parse()
            .with_context(|| format!("parse server address {:?}", config.server_addr))?;
        Self::bind(bind, server, config).await
    }

    pub async fn bind(bind: SocketAddr, server: SocketAddr, config: NetConfig) -> anyhow::Result<Self> {
        let agent = Agent::bind(bind, &config, "client")
            .await
            .context("bind client socket")?;
        debug!(local = %agent.local_addr()?, %server, "client bound");
        Ok(Self {
            agent,
            config,
            server,
            state: ConnectionState::Disconnected,
            sequence: SequenceState::new(),
            room: None,
            room_list: None,
            game_time: 0,
            clock: Duration::ZERO,
            last_connect_attempt: Duration::ZERO,
            last_send: Duration::ZERO,
            registry: Arc::new(Self::control_registry()),
            events: EventQueue::new(),
        })
    }

    fn control_registry() -> ClientRegistry {
        let mut reg = ClientRegistry::new();
        reg.register(MessageType::Connected.id(), |c: &mut Client, _, id: PlayerId| {
            c.on_connected(id)
        });
        reg.register(MessageType::ErrorAlreadyConnected.id(), |c: &mut Client, _, id: PlayerId| {
            c.on_already_connected(id)
        });
        reg.register(MessageType::RoomJoined.id(), |c: &mut Client, _, snap: RoomSnapshot| {
            c.on_room_joined(snap)
        });
        reg.register(MessageType::UserJoinedRoom.id(), |c: &mut Client, _, change: MemberChange| {
            c.on_member_change(change, true)
        });
        reg.register(MessageType::UserLeftRoom.id(), |c: &mut Client, _, change: MemberChange| {
            c.on_member_change(change, false)
        });
        reg.register(MessageType::RoomInfo.id(), |c: &mut Client, _, snap: RoomSnapshot| {
            c.on_room_info(snap)
        });
        reg.register(MessageType::RoomList.id(), |c: &mut Client, _, list: RoomList| {
            c.on_room_list(list)
        });
        reg.register(MessageType::RoomDissolved.id(), |c: &mut Client, _, room: RoomId| {
            c.on_room_dissolved(room)
        });
        reg.register(MessageType::ErrorRoomNotFound.id(), |c: &mut Client, _, room: RoomId| {
            debug!(%room, "room not found");
            c.events.push(ClientEvent::Error(MessageType::ErrorRoomNotFound));
        });
        reg.register(MessageType::ErrorNotInRoom.id(), |c: &mut Client, _, (): ()| {
            c.room = None;
            c.events.push(ClientEvent::Error(MessageType::ErrorNotInRoom));
        });
        reg.register(MessageType::AdvanceTime.id(), |c: &mut Client, _, time: u32| {
            c.game_time = time;
        });
        reg
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.agent.local_addr()
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn player_id(&self) -> Option<PlayerId> {
        match self.state {
            ConnectionState::Connected(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, ConnectionState::Connected(_))
    }

    /// Snapshot of the current room, as last reported by the server.
    pub fn room(&self) -> Option<&RoomSnapshot> {
        self.room.as_ref()
    }

    pub fn room_list(&self) -> Option<&RoomList> {
        self.room_list.as_ref()
    }

    /// Game time of the current room, from the last tick received.
    pub fn game_time(&self) -> u32 {
        self.game_time
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.agent.metrics_snapshot()
    }

    pub fn drain_events(&mut self) -> Vec<ClientEvent> {
        self.events.drain()
    }

    pub fn set_event_hook(&mut self, hook: EventHook<ClientEvent>) {
        self.events.set_hook(hook);
    }

    /// Pauses or resumes processing of received messages.
    pub fn set_buffering(&mut self, buffering: bool) {
        self.agent.set_buffering(buffering);
    }

    /// Registers an application handler. The first registration for a type wins.
    pub fn register_function<P, F>(&mut self, type_id: u32, handler: F) -> bool
    where
        P: NetPayload + 'static,
        F: Fn(&mut Client, MessageOrigin, P) + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.registry).register(type_id, handler)
    }

    // ─── Requests ───

    /// Starts connecting. `RequestConnect` is resent every `connect_retry_ms`
    /// until the server answers.
    pub fn connect(&mut self) {
        if self.state != ConnectionState::Disconnected {
            return;
        }
        info!(server = %self.server, "connecting");
        self.state = ConnectionState::Connecting;
        self.sequence = SequenceState::new();
        self.send_request_connect();
    }

    fn send_request_connect(&mut self) {
        self.last_connect_attempt = self.clock;
        self.send_raw(MessageType::RequestConnect.id(), Bytes::new());
    }

    /// Tells the server we are leaving and forgets the session.
    pub fn disconnect(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        if self.is_connected() {
            self.send_raw(MessageType::Disconnect.id(), Bytes::new());
        }
        info!(player_id = ?self.player_id(), "disconnected");
        self.state = ConnectionState::Disconnected;
        self.room = None;
        self.game_time = 0;
        self.events.push(ClientEvent::Disconnected);
    }

    pub fn request_host_room(&mut self) -> bool {
        self.send_control(MessageType::HostRoom, &())
    }

    pub fn request_join_room(&mut self, room: RoomId) -> bool {
        self.send_control(MessageType::JoinRoom, &room)
    }

    pub fn request_leave_room(&mut self) -> bool {
        let sent = self.send_control(MessageType::LeaveRoom, &());
        if sent {
            self.room = None;
        }
        sent
    }

    pub fn request_room_info(&mut self) -> bool {
        self.send_control(MessageType::GetRoomInfo, &())
    }

    pub fn request_room_list(&mut self) -> bool {
        self.send_control(MessageType::GetRooms, &())
    }

    /// Sends an application payload to the current room.
    pub fn send_to_room<P: NetPayload>(&mut self, type_id: u32, payload: &P) -> bool {
        if !is_application_type(type_id) {
            warn!(type_id, "refusing to send a framework type id as application data");
            return false;
        }
        if self.room.is_none() {
            debug!(type_id, "not in a room, dropping application message");
            return false;
        }
        self.send_raw(type_id, to_bytes(payload))
    }

    fn send_control<P: NetPayload>(&mut self, ty: MessageType, payload: &P) -> bool {
        if !self.is_connected() {
            debug!(message = ?ty, "not connected, dropping request");
            return false;
        }
        self.send_raw(ty.id(), to_bytes(payload))
    }

    fn send_raw(&mut self, type_id: u32, content: Bytes) -> bool {
        let index = self.sequence.next_send_index();
        self.last_send = self.clock;
        self.agent.send(self.server, type_id, index, content)
    }

    // ─── Control handlers ───

    fn on_connected(&mut self, id: PlayerId) {
        if self.state != ConnectionState::Connecting {
            debug!(player_id = %id, "unexpected Connected");
            return;
        }
        info!(player_id = %id, "connected");
        self.state = ConnectionState::Connected(id);
        self.events.push(ClientEvent::Connected(id));
    }

    fn on_already_connected(&mut self, id: PlayerId) {
        if self.state == ConnectionState::Connecting && !id.is_none() {
            // Our Connected reply was lost; the server still knows us.
            debug!(player_id = %id, "already connected, adopting id");
            self.on_connected(id);
            return;
        }
        if self.player_id() == Some(id) {
            // A duplicated RequestConnect answered late.
            debug!(player_id = %id, "already connected with this id, ignoring");
            return;
        }
        self.events.push(ClientEvent::Error(MessageType::ErrorAlreadyConnected));
    }

    fn on_room_joined(&mut self, snapshot: RoomSnapshot) {
        info!(room = %snapshot.room_id, members = snapshot.members.len(), "joined room");
        if self.room.as_ref().map(|r| r.room_id) != Some(snapshot.room_id) {
            self.game_time = 0;
        }
        self.room = Some(snapshot.clone());
        self.events.push(ClientEvent::RoomJoined(snapshot));
    }

    fn on_member_change(&mut self, change: MemberChange, joined: bool) {
        let current = self.room.as_ref().map(|r| r.room_id);
        if current != Some(change.room.room_id) {
            trace!(room = %change.room.room_id, "member change for another room");
            return;
        }
        self.room = Some(change.room.clone());
        let event = if joined {
            ClientEvent::PlayerJoinedRoom {
                room: change.room,
                player: change.player,
            }
        } else {
            ClientEvent::PlayerLeftRoom {
                room: change.room,
                player: change.player,
            }
        };
        self.events.push(event);
    }

    fn on_room_info(&mut self, snapshot: RoomSnapshot) {
        self.room = Some(snapshot.clone());
        self.events.push(ClientEvent::RoomInfo(snapshot));
    }

    fn on_room_list(&mut self, list: RoomList) {
        self.room_list = Some(list.clone());
        self.events.push(ClientEvent::RoomListReceived(list));
    }

    fn on_room_dissolved(&mut self, room: RoomId) {
        if self.room.as_ref().map(|r| r.room_id) == Some(room) {
            self.room = None;
        }
        info!(%room, "room dissolved");
        self.events.push(ClientEvent::Kicked(room));
    }

    fn dispatch(&mut self, origin: MessageOrigin, type_id: u32, content: &[u8]) {
        let registry = Arc::clone(&self.registry);
        match registry.dispatch_raw(self, origin, type_id, content) {
            Dispatch::Handled => {}
            Dispatch::PayloadRejected(e) => {
                warn!(type_id, error = %e, "payload rejected");
            }
            Dispatch::Unregistered => {
                warn!(type_id, sender = %origin.sender, "unhandled message type");
            }
        }
    }

    /// Stops receiving. Queued sends are discarded.
    pub fn dispose(&mut self) {
        self.agent.dispose();
    }
}

impl Endpoint for Client {
    fn agent(&self) -> &Agent {
        &self.agent
    }

    fn agent_mut(&mut self) -> &mut Agent {
        &mut self.agent
    }

    fn process_message(&mut self, from: SocketAddr, msg: &WireMessage<'_>) {
        if from != self.server {
            trace!(%from, "dropping message from non-server endpoint");
            return;
        }
        if self.state == ConnectionState::Disconnected {
            trace!(type_id = msg.type_id, "not connected, dropping message");
            return;
        }
        if !self.sequence.accept(msg.index) {
            self.agent.metrics().record_stale();
            trace!(index = msg.index, last = self.sequence.last_received(), "dropping stale message");
            return;
        }

        if msg.type_id == MessageType::GenericGameplay.id() {
            match RelayedPayload::decode(msg.content) {
                Ok(relayed) => {
                    let origin = MessageOrigin {
                        sender: relayed.sender,
                        game_time: None,
                    };
                    self.dispatch(origin, relayed.type_id, &relayed.data);
                }
                Err(e) => warn!(error = %e, "malformed relayed message"),
            }
        } else if msg.type_id == MessageType::GenericGameplayWithTime.id() {
            match TimedPayload::decode(msg.content) {
                Ok(timed) => {
                    self.game_time = timed.game_time;
                    let origin = MessageOrigin {
                        sender: timed.sender,
                        game_time: Some(timed.game_time),
                    };
                    self.dispatch(origin, timed.type_id, &timed.data);
                }
                Err(e) => warn!(error = %e, "malformed timed message"),
            }
        } else {
            self.dispatch(MessageOrigin::SERVER, msg.type_id, msg.content);
        }
    }

    fn on_step(&mut self, elapsed: Duration) {
        self.clock += elapsed;
        match self.state {
            ConnectionState::Connecting => {
                let retry = Duration::from_millis(self.config.connect_retry_ms);
                if self.clock.saturating_sub(self.last_connect_attempt) >= retry {
                    debug!(server = %self.server, "retrying connect");
                    self.send_request_connect();
                }
            }
            ConnectionState::Connected(_) => {
                if self.config.heartbeat_interval_ms == 0 {
                    return;
                }
                let interval = Duration::from_millis(self.config.heartbeat_interval_ms);
                if self.clock.saturating_sub(self.last_send) >= interval {
                    self.send_raw(MessageType::Heartbeat.id(), Bytes::new());
                }
            }
            ConnectionState::Disconnected => {}
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("agent", &self.agent)
            .field("server", &self.server)
            .field("state", &self.state)
            .field("room", &self.room)
            .field("game_time", &self.game_time)
            .finish()
    }
}
