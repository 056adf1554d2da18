//! Wire-level behaviour against a live server, using raw sockets.

use lockstep_shared::config::NetConfig;
use lockstep_shared::message::{MessageType, PlayerId, RoomId};
use lockstep_shared::payload::{NetPayload, RoomList};
use lockstep_shared::wire::{self, MAX_MESSAGE_SIZE};
use lockstep_tests::{init_tracing, Harness, RawFrame, RawPeer};

async fn collect_until<F>(h: &mut Harness, peer: &RawPeer, mut done: F) -> anyhow::Result<Vec<RawFrame>>
where
    F: FnMut(&[RawFrame]) -> bool,
{
    let mut frames = Vec::new();
    for _ in 0..200 {
        h.step().await?;
        frames.extend(peer.drain());
        if done(&frames) {
            return Ok(frames);
        }
    }
    anyhow::bail!("expected frames never arrived; got {frames:?}")
}

fn has_type(frames: &[RawFrame], ty: MessageType) -> bool {
    frames.iter().any(|f| f.type_id == ty.id())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_connect_is_refused() -> anyhow::Result<()> {
    init_tracing();
    let mut h = Harness::new(NetConfig::default()).await?;
    let peer = RawPeer::bind(h.server_addr()?).await?;

    peer.send(MessageType::RequestConnect, 1, &[0]).await?;
    let frames = collect_until(&mut h, &peer, |f| has_type(f, MessageType::Connected)).await?;
    assert_eq!(PlayerId::decode(&frames[0].content)?, PlayerId(1));
    assert_eq!(frames[0].index, 1);

    peer.send(MessageType::RequestConnect, 2, &[0]).await?;
    let frames =
        collect_until(&mut h, &peer, |f| has_type(f, MessageType::ErrorAlreadyConnected)).await?;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].index, 2);
    assert_eq!(h.server.player_count(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restarted_peer_is_told_it_is_connected() -> anyhow::Result<()> {
    init_tracing();
    let mut h = Harness::new(NetConfig::default()).await?;
    let peer = RawPeer::bind(h.server_addr()?).await?;

    peer.send(MessageType::RequestConnect, 1, &[0]).await?;
    collect_until(&mut h, &peer, |f| has_type(f, MessageType::Connected)).await?;
    for index in 2..=20 {
        peer.send(MessageType::Heartbeat, index, &[0]).await?;
    }

    // Same socket, counting from 1 again.
    peer.send(MessageType::RequestConnect, 1, &[0]).await?;
    let frames =
        collect_until(&mut h, &peer, |f| has_type(f, MessageType::ErrorAlreadyConnected)).await?;
    let reply = frames
        .iter()
        .find(|f| f.type_id == MessageType::ErrorAlreadyConnected.id())
        .ok_or_else(|| anyhow::anyhow!("no ErrorAlreadyConnected"))?;
    assert_eq!(PlayerId::decode(&reply.content)?, PlayerId(1));
    assert_eq!(h.server.player_count(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_indices_do_not_change_state() -> anyhow::Result<()> {
    init_tracing();
    let mut h = Harness::new(NetConfig::default()).await?;
    let peer = RawPeer::bind(h.server_addr()?).await?;

    peer.send(MessageType::RequestConnect, 1, &[0]).await?;
    collect_until(&mut h, &peer, |f| has_type(f, MessageType::Connected)).await?;

    peer.send(MessageType::HostRoom, 10, &[0]).await?;
    collect_until(&mut h, &peer, |f| has_type(f, MessageType::RoomJoined)).await?;
    assert_eq!(h.server.room_ids(), vec![RoomId(1)]);

    // Replayed and older frames: would leave and dissolve the room if accepted.
    peer.send(MessageType::LeaveRoom, 10, &[0]).await?;
    peer.send(MessageType::LeaveRoom, 4, &[0]).await?;
    peer.send(MessageType::GetRooms, 11, &[0]).await?;
    let frames = collect_until(&mut h, &peer, |f| has_type(f, MessageType::RoomList)).await?;

    let list = frames
        .iter()
        .find(|f| f.type_id == MessageType::RoomList.id())
        .map(|f| RoomList::decode(&f.content))
        .transpose()?
        .unwrap_or_default();
    assert_eq!(list.entries.len(), 1);
    assert_eq!(list.entries[0].room_id, RoomId(1));
    assert_eq!(h.server.metrics().dropped_stale, 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_frames_are_dropped_and_counted() -> anyhow::Result<()> {
    init_tracing();
    let mut h = Harness::new(NetConfig::default()).await?;
    let peer = RawPeer::bind(h.server_addr()?).await?;

    let mut corrupt = wire::encode(MessageType::RequestConnect.id(), 1, &[0])?.to_vec();
    let last = corrupt.len() - 1;
    corrupt[last] ^= 0x55;
    peer.send_bytes(&corrupt).await?;
    peer.send_bytes(b"not a frame at all").await?;

    let mut lying = wire::encode(MessageType::RequestConnect.id(), 1, &[0])?.to_vec();
    lying[11..15].copy_from_slice(&u32::MAX.to_le_bytes());
    peer.send_bytes(&lying).await?;

    h.wait_server_inbound(3).await?;
    h.step().await?;

    assert_eq!(h.server.player_count(), 0);
    assert_eq!(h.server.metrics().dropped_invalid, 3);
    assert!(peer.drain().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversize_datagram_is_dropped() -> anyhow::Result<()> {
    init_tracing();
    let mut h = Harness::new(NetConfig::default()).await?;
    let peer = RawPeer::bind(h.server_addr()?).await?;

    peer.send_bytes(&vec![0u8; MAX_MESSAGE_SIZE + 100]).await?;
    peer.send(MessageType::RequestConnect, 1, &[0]).await?;
    collect_until(&mut h, &peer, |f| has_type(f, MessageType::Connected)).await?;

    assert_eq!(h.server.metrics().dropped_oversize, 1);
    assert_eq!(h.server.player_count(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_endpoint_cannot_host() -> anyhow::Result<()> {
    init_tracing();
    let mut h = Harness::new(NetConfig::default()).await?;
    let peer = RawPeer::bind(h.server_addr()?).await?;

    peer.send(MessageType::HostRoom, 1, &[0]).await?;
    h.wait_server_inbound(1).await?;
    h.step().await?;

    assert_eq!(h.server.room_count(), 0);
    assert_eq!(h.server.player_count(), 0);
    assert!(peer.drain().is_empty());
    Ok(())
}
