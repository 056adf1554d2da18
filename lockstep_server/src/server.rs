//! Server agent.
//!
//! Owns the player table and the room list and performs the connection
//! handshake. Everything here runs on the thread that calls
//! [`Endpoint::step`]; the socket task only feeds the receive queue.
//!
//! Per-frame flow for a known endpoint:
//! 1. drop the frame if its index is not newer than the last accepted one,
//! 2. dispatch through the server's function registry,
//! 3. otherwise offer it to the sender's room,
//! 4. otherwise warn and drop.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use lockstep_shared::{
    agent::{Agent, Endpoint},
    arena::{Arena, Handle},
    config::NetConfig,
    event::{EventHook, EventQueue},
    message::{MessageType, PlayerId, RoomId},
    metrics::MetricsSnapshot,
    payload::{
        to_bytes, MemberChange, NetPayload, RoomList, RoomSnapshot, MAX_ROOMS_IN_LIST,
    },
    registry::{Dispatch, FunctionRegistry},
    wire::WireMessage,
};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::player::Player;
use crate::room::{Room, RoomSend};

/// Why a player left the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Requested,
    TimedOut,
}

/// Connection and room changes observed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    PlayerConnected { player: PlayerId, endpoint: SocketAddr },
    PlayerDisconnected { player: PlayerId, reason: DisconnectReason },
    RoomCreated { room: RoomId, host: Option<PlayerId> },
    PlayerJoinedRoom { room: RoomId, player: PlayerId },
    PlayerLeftRoom { room: RoomId, player: PlayerId },
    RoomDissolved { room: RoomId },
}

/// Session-level refusals. Each maps to an `Error_*` reply where one exists.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("endpoint {0} is already connected")]
    AlreadyConnected(SocketAddr),
    #[error("{0} does not exist or refuses joins")]
    RoomNotFound(RoomId),
    #[error("player {0} is not in a room")]
    NotInRoom(PlayerId),
    #[error("unknown player {0}")]
    UnknownPlayer(PlayerId),
}

impl SessionError {
    pub fn reply_type(&self) -> Option<MessageType> {
        match self {
            SessionError::AlreadyConnected(_) => Some(MessageType::ErrorAlreadyConnected),
            SessionError::RoomNotFound(_) => Some(MessageType::ErrorRoomNotFound),
            SessionError::NotInRoom(_) => Some(MessageType::ErrorNotInRoom),
            SessionError::UnknownPlayer(_) => None,
        }
    }
}

pub type ServerRegistry = FunctionRegistry<Server, PlayerId>;

/// Authoritative server.
pub struct Server {
    agent: Agent,
    config: NetConfig,

    players: Arena<Player>,
    by_endpoint: HashMap<SocketAddr, Handle<Player>>,
    by_id: BTreeMap<PlayerId, Handle<Player>>,
    next_player_id: u32,

    rooms: Arena<Room>,
    room_index: BTreeMap<RoomId, Handle<Room>>,
    next_room_id: u32,

    /// Logical clock, advanced only by `step`.
    clock: Duration,
    registry: Arc<ServerRegistry>,
    events: EventQueue<ServerEvent>,
    outbox: Vec<RoomSend>,
}

impl Server {
    /// Binds to `config.server_addr`.
    pub async fn new(config: NetConfig) -> anyhow::Result<Self> {
        let addr: SocketAddr = config
            .server_addr
            .parse()
            .with_context(|| format!("parse server address {:?}", config.server_addr))?;
        Self::bind(addr, config).await
    }

    pub async fn bind(addr: SocketAddr, config: NetConfig) -> anyhow::Result<Self> {
        let agent = Agent::bind(addr, &config, "server")
            .await
            .context("bind server socket")?;
        info!(addr = %agent.local_addr()?, room_kind = ?config.room_kind, "server bound");
        Ok(Self {
            agent,
            config,
            players: Arena::new(),
            by_endpoint: HashMap::new(),
            by_id: BTreeMap::new(),
            next_player_id: 1,
            rooms: Arena::new(),
            room_index: BTreeMap::new(),
            next_room_id: 1,
            clock: Duration::ZERO,
            registry: Arc::new(Self::control_registry()),
            events: EventQueue::new(),
            outbox: Vec::new(),
        })
    }

    fn control_registry() -> ServerRegistry {
        let mut reg = ServerRegistry::new();
        reg.register(MessageType::HostRoom.id(), |s: &mut Server, p, (): ()| {
            s.handle_host_room(p)
        });
        reg.register(MessageType::JoinRoom.id(), |s: &mut Server, p, room: RoomId| {
            s.handle_join_room(p, room)
        });
        reg.register(MessageType::LeaveRoom.id(), |s: &mut Server, p, (): ()| {
            s.handle_leave_room(p)
        });
        reg.register(MessageType::GetRoomInfo.id(), |s: &mut Server, p, (): ()| {
            s.handle_get_room_info(p)
        });
        reg.register(MessageType::GetRooms.id(), |s: &mut Server, p, (): ()| {
            s.handle_get_rooms(p)
        });
        reg.register(MessageType::Disconnect.id(), |s: &mut Server, p, (): ()| {
            s.disconnect_player(p, DisconnectReason::Requested);
        });
        // Activity is recorded before dispatch; nothing else to do.
        reg.register(MessageType::Heartbeat.id(), |_: &mut Server, _, (): ()| {});
        reg
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.agent.local_addr()
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    /// Current logical time.
    pub fn clock(&self) -> Duration {
        self.clock
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.agent.metrics_snapshot()
    }

    /// Registers an application handler. The first registration for a type wins.
    pub fn register_function<P, F>(&mut self, type_id: u32, handler: F) -> bool
    where
        P: NetPayload + 'static,
        F: Fn(&mut Server, PlayerId, P) + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.registry).register(type_id, handler)
    }

    pub fn drain_events(&mut self) -> Vec<ServerEvent> {
        self.events.drain()
    }

    pub fn set_event_hook(&mut self, hook: EventHook<ServerEvent>) {
        self.events.set_hook(hook);
    }

    // ─── Player table ───

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn player(&self, id: PlayerId) -> Option<&Player> {
        self.by_id.get(&id).and_then(|&h| self.players.get(h))
    }

    fn player_mut(&mut self, id: PlayerId) -> Option<&mut Player> {
        let handle = *self.by_id.get(&id)?;
        self.players.get_mut(handle)
    }

    pub fn player_ids(&self) -> Vec<PlayerId> {
        self.by_id.keys().copied().collect()
    }

    fn accept_connection(&mut self, from: SocketAddr, index: u32) {
        let id = PlayerId(self.next_player_id);
        self.next_player_id += 1;
        let mut player = Player::new(id, from, self.clock);
        player.sequence.accept(index);
        let handle = self.players.insert(player);
        self.by_endpoint.insert(from, handle);
        self.by_id.insert(id, handle);

        info!(player_id = %id, %from, "player connected");
        self.send_payload(id, MessageType::Connected.id(), &id);
        self.events.push(ServerEvent::PlayerConnected {
            player: id,
            endpoint: from,
        });
    }

    /// Removes a player, dissolving its room if it was the host.
    pub fn disconnect_player(&mut self, id: PlayerId, reason: DisconnectReason) -> bool {
        if !self.by_id.contains_key(&id) {
            return false;
        }
        self.remove_player_from_room(id);
        let Some(handle) = self.by_id.remove(&id) else {
            return false;
        };
        if let Some(player) = self.players.remove(handle) {
            self.by_endpoint.remove(&player.endpoint);
            info!(player_id = %id, endpoint = %player.endpoint, ?reason, "player disconnected");
        }
        self.events.push(ServerEvent::PlayerDisconnected { player: id, reason });
        true
    }

    /// Disconnects players silent for longer than the configured timeout.
    pub fn expire_idle_players(&mut self) -> usize {
        if self.config.peer_timeout_ms == 0 {
            return 0;
        }
        let timeout = Duration::from_millis(self.config.peer_timeout_ms);
        let now = self.clock;
        let expired: Vec<PlayerId> = self
            .players
            .iter()
            .filter(|(_, p)| p.idle_for(now) > timeout)
            .map(|(_, p)| p.id)
            .collect();
        for &id in &expired {
            self.disconnect_player(id, DisconnectReason::TimedOut);
        }
        expired.len()
    }

    // ─── Sending ───

    /// Queues `content` for a player, stamping the player's next send index.
    pub fn send_to_player(&mut self, to: PlayerId, type_id: u32, content: Bytes) -> bool {
        let Some(player) = self.player_mut(to) else {
            debug!(player_id = %to, type_id, "send to unknown player");
            return false;
        };
        let index = player.sequence.next_send_index();
        let endpoint = player.endpoint;
        self.agent.send(endpoint, type_id, index, content)
    }

    pub fn send_payload<P: NetPayload>(&mut self, to: PlayerId, type_id: u32, payload: &P) -> bool {
        self.send_to_player(to, type_id, to_bytes(payload))
    }

    fn reply_error(&mut self, to: PlayerId, err: &SessionError) {
        debug!(player_id = %to, error = %err, "session error");
        let Some(reply) = err.reply_type() else {
            return;
        };
        match err {
            SessionError::RoomNotFound(room) => self.send_payload(to, reply.id(), room),
            SessionError::NotInRoom(player) => self.send_payload(to, reply.id(), player),
            _ => self.send_payload(to, reply.id(), &()),
        };
    }

    fn deliver(&mut self, sends: &mut Vec<RoomSend>) {
        for send in sends.drain(..) {
            self.send_to_player(send.to, send.type_id, send.content);
        }
    }

    // ─── Rooms ───

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn room(&self, id: RoomId) -> Option<&Room> {
        self.room_index.get(&id).and_then(|&h| self.rooms.get(h))
    }

    fn room_mut(&mut self, id: RoomId) -> Option<&mut Room> {
        let handle = *self.room_index.get(&id)?;
        self.rooms.get_mut(handle)
    }

    pub fn room_ids(&self) -> Vec<RoomId> {
        self.room_index.keys().copied().collect()
    }

    pub fn room_snapshot(&self, id: RoomId) -> Option<RoomSnapshot> {
        self.room(id).map(Room::snapshot)
    }

    pub fn game_time(&self, id: RoomId) -> Option<u32> {
        self.room(id).map(Room::game_time)
    }

    /// The room list as the `GetRooms` reply presents it.
    pub fn room_list(&self) -> RoomList {
        RoomList {
            entries: self
                .room_index
                .values()
                .filter_map(|&h| self.rooms.get(h))
                .filter(|r| r.is_active())
                .take(MAX_ROOMS_IN_LIST)
                .map(Room::list_entry)
                .collect(),
        }
    }

    /// Creates a room of the configured kind. With a host, the host is moved
    /// into it and receives `RoomJoined`.
    pub fn create_room(&mut self, host: Option<PlayerId>) -> Result<RoomId, SessionError> {
        if let Some(h) = host {
            if !self.by_id.contains_key(&h) {
                return Err(SessionError::UnknownPlayer(h));
            }
        }
        let id = RoomId(self.next_room_id);
        self.next_room_id += 1;
        let handle = self.rooms.insert(Room::from_config(id, &self.config));
        self.room_index.insert(id, handle);
        info!(room = %id, host = ?host, "room created");
        self.events.push(ServerEvent::RoomCreated { room: id, host });

        if let Some(h) = host {
            self.add_player_to_room(h, id)?;
        }
        Ok(id)
    }

    /// Moves `player` into `room`, leaving any previous room first.
    pub fn add_player_to_room(
        &mut self,
        player: PlayerId,
        room: RoomId,
    ) -> Result<RoomSnapshot, SessionError> {
        let current = self
            .player(player)
            .ok_or(SessionError::UnknownPlayer(player))?
            .room;

        if current == Some(room) {
            let snapshot = self
                .room_snapshot(room)
                .ok_or(SessionError::RoomNotFound(room))?;
            self.send_payload(player, MessageType::RoomJoined.id(), &snapshot);
            return Ok(snapshot);
        }

        if !self.room(room).is_some_and(Room::can_be_joined) {
            return Err(SessionError::RoomNotFound(room));
        }
        if current.is_some() {
            self.remove_player_from_room(player);
        }

        let target = self.room_mut(room).ok_or(SessionError::RoomNotFound(room))?;
        if !target.add_member(player) {
            return Err(SessionError::RoomNotFound(room));
        }
        let snapshot = target.snapshot();
        if let Some(p) = self.player_mut(player) {
            p.room = Some(room);
        }

        info!(room = %room, player_id = %player, members = snapshot.members.len(), "player joined room");
        self.send_payload(player, MessageType::RoomJoined.id(), &snapshot);
        let change = to_bytes(&MemberChange {
            room: snapshot.clone(),
            player,
        });
        for &member in snapshot.members.iter().filter(|&&m| m != player) {
            self.send_to_player(member, MessageType::UserJoinedRoom.id(), change.clone());
        }
        self.events.push(ServerEvent::PlayerJoinedRoom { room, player });
        Ok(snapshot)
    }

    /// Takes `player` out of its room. A departing host dissolves the room.
    /// Returns the room the player was in.
    pub fn remove_player_from_room(&mut self, player: PlayerId) -> Option<RoomId> {
        let room_id = self.player_mut(player)?.room.take()?;
        let Some(room) = self.room_mut(room_id) else {
            return Some(room_id);
        };

        if room.is_host(player) {
            room.remove_member(player);
            self.dissolve_room(room_id);
            return Some(room_id);
        }

        room.remove_member(player);
        let snapshot = room.snapshot();
        info!(room = %room_id, player_id = %player, "player left room");
        let change = to_bytes(&MemberChange {
            room: snapshot.clone(),
            player,
        });
        for &member in &snapshot.members {
            self.send_to_player(member, MessageType::UserLeftRoom.id(), change.clone());
        }
        self.events.push(ServerEvent::PlayerLeftRoom {
            room: room_id,
            player,
        });
        Some(room_id)
    }

    /// Removes a room; every remaining member gets exactly one `RoomDissolved`.
    pub fn dissolve_room(&mut self, id: RoomId) -> bool {
        let Some(handle) = self.room_index.remove(&id) else {
            return false;
        };
        let Some(mut room) = self.rooms.remove(handle) else {
            return false;
        };
        let kicked = room.dissolve();
        info!(room = %id, kicked = kicked.len(), "room dissolved");
        for member in kicked {
            let was_here = match self.player_mut(member) {
                Some(p) if p.room == Some(id) => {
                    p.room = None;
                    true
                }
                _ => false,
            };
            if was_here {
                self.send_payload(member, MessageType::RoomDissolved.id(), &id);
                self.events.push(ServerEvent::PlayerLeftRoom { room: id, player: member });
            }
        }
        self.events.push(ServerEvent::RoomDissolved { room: id });
        true
    }

    fn advance_rooms(&mut self, elapsed: Duration) {
        let mut out = std::mem::take(&mut self.outbox);
        for &handle in self.room_index.values() {
            if let Some(room) = self.rooms.get_mut(handle) {
                room.advance(elapsed, &mut out);
            }
        }
        self.deliver(&mut out);
        self.outbox = out;
    }

    // ─── Control handlers ───

    fn handle_host_room(&mut self, player: PlayerId) {
        if !self.config.users_can_manage_rooms {
            debug!(player_id = %player, "room management disabled, ignoring HostRoom");
            return;
        }
        self.remove_player_from_room(player);
        if let Err(e) = self.create_room(Some(player)) {
            self.reply_error(player, &e);
        }
    }

    fn handle_join_room(&mut self, player: PlayerId, room: RoomId) {
        if !self.config.users_can_manage_rooms {
            debug!(player_id = %player, %room, "room management disabled, ignoring JoinRoom");
            return;
        }
        if let Err(e) = self.add_player_to_room(player, room) {
            self.reply_error(player, &e);
        }
    }

    fn handle_leave_room(&mut self, player: PlayerId) {
        if !self.config.users_can_manage_rooms {
            debug!(player_id = %player, "room management disabled, ignoring LeaveRoom");
            return;
        }
        if self.remove_player_from_room(player).is_none() {
            self.reply_error(player, &SessionError::NotInRoom(player));
        }
    }

    fn handle_get_room_info(&mut self, player: PlayerId) {
        if !self.config.users_can_manage_rooms {
            debug!(player_id = %player, "room management disabled, ignoring GetRoomInfo");
            return;
        }
        let snapshot = self
            .player(player)
            .and_then(|p| p.room)
            .and_then(|r| self.room_snapshot(r));
        match snapshot {
            Some(snapshot) => {
                self.send_payload(player, MessageType::RoomInfo.id(), &snapshot);
            }
            None => self.reply_error(player, &SessionError::NotInRoom(player)),
        }
    }

    fn handle_get_rooms(&mut self, player: PlayerId) {
        if !self.config.users_can_manage_rooms {
            debug!(player_id = %player, "room management disabled, ignoring GetRooms");
            return;
        }
        let list = self.room_list();
        self.send_payload(player, MessageType::RoomList.id(), &list);
    }

    fn dispatch_to_room(&mut self, player: PlayerId, msg: &WireMessage<'_>) -> bool {
        let Some(room_id) = self.player(player).and_then(|p| p.room) else {
            return false;
        };
        let mut out = std::mem::take(&mut self.outbox);
        let handled = self
            .room_mut(room_id)
            .is_some_and(|room| room.handle_message(player, msg.type_id, msg.content, &mut out));
        self.deliver(&mut out);
        self.outbox = out;
        handled
    }

    /// Stops receiving. Queued sends are discarded.
    pub fn dispose(&mut self) {
        info!(players = self.players.len(), rooms = self.rooms.len(), "server disposed");
        self.agent.dispose();
    }
}

impl Endpoint for Server {
    fn agent(&self) -> &Agent {
        &self.agent
    }

    fn agent_mut(&mut self) -> &mut Agent {
        &mut self.agent
    }

    fn process_message(&mut self, from: SocketAddr, msg: &WireMessage<'_>) {
        let Some(&handle) = self.by_endpoint.get(&from) else {
            if msg.type_id == MessageType::RequestConnect.id() {
                self.accept_connection(from, msg.index);
            } else {
                trace!(%from, type_id = msg.type_id, "dropping message from unknown endpoint");
            }
            return;
        };
        let Some(player) = self.players.get_mut(handle) else {
            return;
        };

        // Answered regardless of index: a client restarted on the same
        // endpoint counts from 1 again.
        if msg.type_id == MessageType::RequestConnect.id() {
            let id = player.id;
            let err = SessionError::AlreadyConnected(from);
            debug!(player_id = %id, index = msg.index, error = %err, "duplicate connect");
            // The reply carries the existing id so a client whose Connected
            // reply was lost can still learn it.
            self.send_payload(id, MessageType::ErrorAlreadyConnected.id(), &id);
            return;
        }

        if !player.sequence.accept(msg.index) {
            self.agent.metrics().record_stale();
            trace!(player_id = %player.id, index = msg.index, last = player.receive_index(), "dropping stale message");
            return;
        }
        player.last_activity = self.clock;
        let id = player.id;

        let registry = Arc::clone(&self.registry);
        match registry.dispatch(self, id, msg) {
            Dispatch::Handled => {}
            Dispatch::PayloadRejected(e) => {
                warn!(player_id = %id, type_id = msg.type_id, error = %e, "payload rejected");
            }
            Dispatch::Unregistered => {
                if !self.dispatch_to_room(id, msg) {
                    warn!(player_id = %id, type_id = msg.type_id, "unhandled message type");
                }
            }
        }
    }

    fn on_step(&mut self, elapsed: Duration) {
        self.clock += elapsed;
        self.expire_idle_players();
        self.advance_rooms(elapsed);
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("agent", &self.agent)
            .field("players", &self.players.len())
            .field("rooms", &self.room_ids())
            .field("clock", &self.clock)
            .field("registry", &self.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use lockstep_shared::config::RoomKind;

    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    async fn server(config: NetConfig) -> anyhow::Result<Server> {
        Server::bind(addr(0), config).await
    }

    fn frame(type_id: MessageType, index: u32, content: &[u8]) -> WireMessage<'_> {
        WireMessage {
            type_id: type_id.id(),
            index,
            content,
        }
    }

    /// Connects `n` fake endpoints and returns their ids.
    fn connect(server: &mut Server, n: u16) -> Vec<PlayerId> {
        (0..n)
            .map(|i| {
                server.process_message(addr(50_000 + i), &frame(MessageType::RequestConnect, 1, &[0]));
                PlayerId(u32::from(i) + 1)
            })
            .collect()
    }

    fn sent_types(server: &Server, to: SocketAddr) -> Vec<u32> {
        server
            .agent
            .take_outgoing()
            .into_iter()
            .filter(|o| o.to == to)
            .map(|o| o.type_id)
            .collect()
    }

    #[tokio::test]
    async fn handshake_assigns_ascending_ids() -> anyhow::Result<()> {
        let mut s = server(NetConfig::default()).await?;
        let ids = connect(&mut s, 2);
        assert_eq!(ids, vec![PlayerId(1), PlayerId(2)]);
        assert_eq!(s.player_count(), 2);
        assert_eq!(
            s.drain_events()[0],
            ServerEvent::PlayerConnected {
                player: PlayerId(1),
                endpoint: addr(50_000)
            }
        );

        // Known endpoint, newer index: refused.
        s.agent.take_outgoing();
        s.process_message(addr(50_000), &frame(MessageType::RequestConnect, 2, &[0]));
        assert_eq!(sent_types(&s, addr(50_000)), vec![MessageType::ErrorAlreadyConnected.id()]);
        assert_eq!(s.player_count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn handshake_index_is_recorded() -> anyhow::Result<()> {
        let mut s = server(NetConfig::default()).await?;
        let ids = connect(&mut s, 1);
        assert_eq!(s.player(ids[0]).unwrap().receive_index(), 1);

        // A duplicated handshake frame cannot be replayed as traffic.
        s.agent.take_outgoing();
        s.process_message(addr(50_000), &frame(MessageType::HostRoom, 1, &[0]));
        assert_eq!(s.room_count(), 0);
        assert_eq!(s.metrics().dropped_stale, 1);

        s.process_message(addr(50_000), &frame(MessageType::RequestConnect, 1, &[0]));
        let out = s.agent.take_outgoing();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].type_id, MessageType::ErrorAlreadyConnected.id());
        assert_eq!(PlayerId::decode(&out[0].content).unwrap(), ids[0]);
        assert_eq!(s.player_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn restarted_client_connect_is_answered() -> anyhow::Result<()> {
        let mut s = server(NetConfig::default()).await?;
        let ids = connect(&mut s, 1);
        for index in 2..=20 {
            s.process_message(addr(50_000), &frame(MessageType::Heartbeat, index, &[0]));
        }
        s.agent.take_outgoing();

        // Same endpoint counting from 1 again.
        s.process_message(addr(50_000), &frame(MessageType::RequestConnect, 1, &[0]));
        let out = s.agent.take_outgoing();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, addr(50_000));
        assert_eq!(out[0].type_id, MessageType::ErrorAlreadyConnected.id());
        assert_eq!(PlayerId::decode(&out[0].content).unwrap(), ids[0]);
        assert_eq!(s.player_count(), 1);
        assert_eq!(s.player(ids[0]).unwrap().receive_index(), 20);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_endpoint_messages_are_dropped() -> anyhow::Result<()> {
        let mut s = server(NetConfig::default()).await?;
        s.process_message(addr(50_100), &frame(MessageType::HostRoom, 1, &[0]));
        assert_eq!(s.player_count(), 0);
        assert_eq!(s.room_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn stale_index_does_not_change_state() -> anyhow::Result<()> {
        let mut s = server(NetConfig::default()).await?;
        connect(&mut s, 1);
        s.process_message(addr(50_000), &frame(MessageType::HostRoom, 5, &[0]));
        assert_eq!(s.room_count(), 1);

        s.process_message(addr(50_000), &frame(MessageType::LeaveRoom, 5, &[0]));
        s.process_message(addr(50_000), &frame(MessageType::LeaveRoom, 3, &[0]));
        assert_eq!(s.room_count(), 1);
        assert_eq!(s.metrics().dropped_stale, 2);
        Ok(())
    }

    #[tokio::test]
    async fn join_sends_snapshot_to_joiner_and_members() -> anyhow::Result<()> {
        let mut s = server(NetConfig::default()).await?;
        let ids = connect(&mut s, 2);
        s.process_message(addr(50_000), &frame(MessageType::HostRoom, 2, &[0]));
        s.agent.take_outgoing();

        s.process_message(addr(50_001), &frame(MessageType::JoinRoom, 2, &1u32.to_le_bytes()));
        let snap = s.room_snapshot(RoomId(1)).unwrap();
        assert_eq!(snap.host, Some(ids[0]));
        assert_eq!(snap.members, ids);

        let out = s.agent.take_outgoing();
        let to_joiner: Vec<_> = out.iter().filter(|o| o.to == addr(50_001)).collect();
        let to_host: Vec<_> = out.iter().filter(|o| o.to == addr(50_000)).collect();
        assert_eq!(to_joiner.len(), 1);
        assert_eq!(to_joiner[0].type_id, MessageType::RoomJoined.id());
        assert_eq!(RoomSnapshot::decode(&to_joiner[0].content).unwrap(), snap);
        assert_eq!(to_host.len(), 1);
        assert_eq!(to_host[0].type_id, MessageType::UserJoinedRoom.id());
        let change = MemberChange::decode(&to_host[0].content).unwrap();
        assert_eq!(change.player, ids[1]);
        assert_eq!(change.room, snap);
        Ok(())
    }

    #[tokio::test]
    async fn join_missing_room_replies_error() -> anyhow::Result<()> {
        let mut s = server(NetConfig::default()).await?;
        connect(&mut s, 1);
        s.agent.take_outgoing();
        s.process_message(addr(50_000), &frame(MessageType::JoinRoom, 2, &9u32.to_le_bytes()));
        assert_eq!(sent_types(&s, addr(50_000)), vec![MessageType::ErrorRoomNotFound.id()]);

        s.process_message(addr(50_000), &frame(MessageType::GetRoomInfo, 3, &[0]));
        assert_eq!(sent_types(&s, addr(50_000)), vec![MessageType::ErrorNotInRoom.id()]);
        Ok(())
    }

    #[tokio::test]
    async fn host_leaving_dissolves_room_once_per_member() -> anyhow::Result<()> {
        let mut s = server(NetConfig::default()).await?;
        let ids = connect(&mut s, 3);
        s.process_message(addr(50_000), &frame(MessageType::HostRoom, 2, &[0]));
        s.process_message(addr(50_001), &frame(MessageType::JoinRoom, 2, &1u32.to_le_bytes()));
        s.process_message(addr(50_002), &frame(MessageType::JoinRoom, 2, &1u32.to_le_bytes()));
        s.agent.take_outgoing();

        s.process_message(addr(50_000), &frame(MessageType::Disconnect, 3, &[0]));
        assert_eq!(s.room_count(), 0);
        assert!(s.room_list().entries.is_empty());
        let out = s.agent.take_outgoing();
        for port in [50_001, 50_002] {
            let kicks = out
                .iter()
                .filter(|o| o.to == addr(port) && o.type_id == MessageType::RoomDissolved.id())
                .count();
            assert_eq!(kicks, 1);
        }
        assert!(s.player(ids[1]).unwrap().room.is_none());
        assert!(s.player(ids[0]).is_none());
        Ok(())
    }

    #[tokio::test]
    async fn hosting_again_leaves_previous_room() -> anyhow::Result<()> {
        let mut s = server(NetConfig::default()).await?;
        let ids = connect(&mut s, 2);
        s.process_message(addr(50_000), &frame(MessageType::HostRoom, 2, &[0]));
        s.process_message(addr(50_001), &frame(MessageType::JoinRoom, 2, &1u32.to_le_bytes()));
        s.process_message(addr(50_001), &frame(MessageType::HostRoom, 3, &[0]));

        assert_eq!(s.room_snapshot(RoomId(1)).unwrap().members, vec![ids[0]]);
        let second = s.room_snapshot(RoomId(2)).unwrap();
        assert_eq!(second.host, Some(ids[1]));
        assert_eq!(second.members, vec![ids[1]]);
        Ok(())
    }

    #[tokio::test]
    async fn room_management_switch_ignores_requests() -> anyhow::Result<()> {
        let config = NetConfig {
            users_can_manage_rooms: false,
            ..NetConfig::default()
        };
        let mut s = server(config).await?;
        let ids = connect(&mut s, 1);
        s.process_message(addr(50_000), &frame(MessageType::HostRoom, 2, &[0]));
        assert_eq!(s.room_count(), 0);

        let room = s.create_room(None)?;
        s.add_player_to_room(ids[0], room)?;
        assert_eq!(s.room_snapshot(room).unwrap().host, Some(ids[0]));

        s.agent.take_outgoing();
        s.process_message(addr(50_000), &frame(MessageType::GetRooms, 3, &[0]));
        s.process_message(addr(50_000), &frame(MessageType::GetRoomInfo, 4, &[0]));
        assert!(sent_types(&s, addr(50_000)).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn idle_players_time_out() -> anyhow::Result<()> {
        let config = NetConfig {
            peer_timeout_ms: 100,
            ..NetConfig::default()
        };
        let mut s = server(config).await?;
        connect(&mut s, 2);
        s.on_step(Duration::from_millis(60));
        s.process_message(addr(50_001), &frame(MessageType::Heartbeat, 2, &[0]));
        s.on_step(Duration::from_millis(60));

        assert_eq!(s.player_ids(), vec![PlayerId(2)]);
        assert!(s.drain_events().contains(&ServerEvent::PlayerDisconnected {
            player: PlayerId(1),
            reason: DisconnectReason::TimedOut
        }));
        Ok(())
    }

    #[tokio::test]
    async fn long_step_keeps_every_room_batch() -> anyhow::Result<()> {
        let mut s = server(NetConfig {
            room_kind: RoomKind::Lockstep,
            sync_message_types: vec![1000],
            peer_timeout_ms: 0,
            ..NetConfig::default()
        })
        .await?;
        connect(&mut s, 4);
        s.process_message(addr(50_000), &frame(MessageType::HostRoom, 2, &[0]));
        s.process_message(addr(50_001), &frame(MessageType::JoinRoom, 2, &1u32.to_le_bytes()));
        s.process_message(addr(50_002), &frame(MessageType::HostRoom, 2, &[0]));
        s.process_message(addr(50_003), &frame(MessageType::JoinRoom, 2, &2u32.to_le_bytes()));
        s.process_message(
            addr(50_002),
            &WireMessage {
                type_id: 1000,
                index: 3,
                content: b"late room input",
            },
        );
        s.agent.take_outgoing();

        s.on_step(Duration::from_secs(30));
        let out = s.agent.take_outgoing();
        for port in [50_002, 50_003] {
            let batch: Vec<_> = out
                .iter()
                .filter(|o| o.to == addr(port) && o.type_id == MessageType::GenericGameplayWithTime.id())
                .collect();
            assert_eq!(batch.len(), 1);
        }
        let advances = out
            .iter()
            .filter(|o| o.type_id == MessageType::AdvanceTime.id())
            .count();
        assert_eq!(advances, 4);
        assert_eq!(s.metrics().dropped_queue_full, 0);
        Ok(())
    }

    #[tokio::test]
    async fn registered_function_runs_before_room_fallback() -> anyhow::Result<()> {
        let mut s = server(NetConfig {
            room_kind: RoomKind::Lockstep,
            sync_message_types: vec![1000],
            ..NetConfig::default()
        })
        .await?;
        connect(&mut s, 1);
        s.process_message(addr(50_000), &frame(MessageType::HostRoom, 2, &[0]));
        assert!(s.register_function(1000, |server: &mut Server, from, value: u32| {
            server.send_payload(from, 1001, &value);
        }));
        s.agent.take_outgoing();

        s.process_message(
            addr(50_000),
            &WireMessage {
                type_id: 1000,
                index: 3,
                content: &7u32.to_le_bytes(),
            },
        );
        let out = s.agent.take_outgoing();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].type_id, 1001);
        let room = s.room(RoomId(1)).unwrap();
        assert!(room.lockstep().unwrap().records().is_empty());
        Ok(())
    }
}
