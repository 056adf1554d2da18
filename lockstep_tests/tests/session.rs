//! Connection and room lifecycle over real localhost sockets.

use lockstep_client::client::{ClientEvent, ConnectionState};
use lockstep_server::server::{DisconnectReason, ServerEvent};
use lockstep_shared::config::NetConfig;
use lockstep_shared::message::{MessageType, PlayerId, RoomId};
use lockstep_shared::payload::RoomSnapshot;
use lockstep_tests::{init_tracing, Harness};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_host_and_join_share_snapshot() -> anyhow::Result<()> {
    init_tracing();
    let mut h = Harness::new(NetConfig::default()).await?;
    h.connect_clients(2).await?;
    assert_eq!(h.clients[0].player_id(), Some(PlayerId(1)));
    assert_eq!(h.clients[1].player_id(), Some(PlayerId(2)));

    h.clients[0].request_host_room();
    h.run_until(200, |h| h.clients[0].room().is_some()).await?;
    assert_eq!(h.server.room_ids(), vec![RoomId(1)]);

    h.clients[1].request_join_room(RoomId(1));
    h.run_until(200, |h| {
        h.clients[1].room().is_some()
            && h.clients[0].room().is_some_and(|r| r.members.len() == 2)
    })
    .await?;

    let expected = RoomSnapshot {
        room_id: RoomId(1),
        host: Some(PlayerId(1)),
        members: vec![PlayerId(1), PlayerId(2)],
    };
    assert_eq!(h.clients[1].room(), Some(&expected));
    assert_eq!(h.clients[0].room(), Some(&expected));

    let host_events = h.clients[0].drain_events();
    assert!(host_events.contains(&ClientEvent::PlayerJoinedRoom {
        room: expected.clone(),
        player: PlayerId(2),
    }));
    let joiner_events = h.clients[1].drain_events();
    assert!(joiner_events.contains(&ClientEvent::RoomJoined(expected)));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn host_disconnect_dissolves_room() -> anyhow::Result<()> {
    init_tracing();
    let mut h = Harness::new(NetConfig::default()).await?;
    h.connect_clients(3).await?;

    h.clients[0].request_host_room();
    h.run_until(200, |h| h.clients[0].room().is_some()).await?;
    for i in 1..3 {
        h.clients[i].request_join_room(RoomId(1));
    }
    h.run_until(200, |h| h.clients.iter().all(|c| c.room().is_some())).await?;
    for c in &mut h.clients {
        c.drain_events();
    }

    h.clients[0].disconnect();
    h.run_until(200, |h| h.clients[1..].iter().all(|c| c.room().is_none()))
        .await?;
    // A few more steps so any duplicate notification would have arrived.
    for _ in 0..10 {
        h.step().await?;
    }

    for c in &mut h.clients[1..] {
        let kicks = c
            .drain_events()
            .into_iter()
            .filter(|e| *e == ClientEvent::Kicked(RoomId(1)))
            .count();
        assert_eq!(kicks, 1);
    }
    assert_eq!(h.server.room_count(), 0);
    assert_eq!(h.server.player_count(), 2);

    h.clients[1].request_room_list();
    h.run_until(200, |h| h.clients[1].room_list().is_some()).await?;
    assert!(h.clients[1]
        .room_list()
        .is_some_and(|l| l.entries.is_empty()));

    let events = h.server.drain_events();
    assert!(events.contains(&ServerEvent::PlayerDisconnected {
        player: PlayerId(1),
        reason: DisconnectReason::Requested,
    }));
    assert!(events.contains(&ServerEvent::RoomDissolved { room: RoomId(1) }));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_host_leave_keeps_room() -> anyhow::Result<()> {
    init_tracing();
    let mut h = Harness::new(NetConfig::default()).await?;
    h.connect_clients(2).await?;
    h.clients[0].request_host_room();
    h.run_until(200, |h| h.clients[0].room().is_some()).await?;
    h.clients[1].request_join_room(RoomId(1));
    h.run_until(200, |h| h.clients[0].room().is_some_and(|r| r.members.len() == 2))
        .await?;

    h.clients[1].request_leave_room();
    h.run_until(200, |h| h.clients[0].room().is_some_and(|r| r.members.len() == 1))
        .await?;
    assert_eq!(h.server.room_count(), 1);
    assert!(h.clients[1].room().is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn joining_missing_room_reports_error() -> anyhow::Result<()> {
    init_tracing();
    let mut h = Harness::new(NetConfig::default()).await?;
    h.connect_clients(1).await?;
    h.clients[0].drain_events();

    h.clients[0].request_join_room(RoomId(42));
    let mut events = Vec::new();
    for _ in 0..200 {
        h.step().await?;
        events.extend(h.clients[0].drain_events());
        if !events.is_empty() {
            break;
        }
    }
    assert_eq!(events, vec![ClientEvent::Error(MessageType::ErrorRoomNotFound)]);
    assert!(h.clients[0].room().is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_peer_times_out_and_heartbeat_keeps_alive() -> anyhow::Result<()> {
    init_tracing();
    let config = NetConfig {
        peer_timeout_ms: 100,
        heartbeat_interval_ms: 30,
        ..NetConfig::default()
    };
    let mut h = Harness::new(config).await?;
    h.connect_clients(2).await?;

    // Client 0 stops stepping: it is dropped from the harness.
    let silent = h.clients.remove(0);
    h.run_until(200, |h| h.server.player_count() == 1).await?;
    assert!(h.server.player(PlayerId(1)).is_none());
    assert!(h.server.player(PlayerId(2)).is_some());
    assert_eq!(h.clients[0].state(), ConnectionState::Connected(PlayerId(2)));
    drop(silent);
    Ok(())
}
