//! Socket pump.
//!
//! Moves datagrams between a UDP socket and two bounded queues:
//! - A background receive task owns the only outstanding `recv_from` and
//!   copies each datagram (with its sender) into the receive queue.
//! - Outgoing messages are queued by the tick thread and encoded and sent in
//!   one batch by [`SocketPump::flush_sends`].
//!
//! The queues are the only state shared with the receive task. Decoding and
//! dispatch happen on the tick thread after the datagrams have been taken out
//! of the queue.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::message::MessageIndex;
use crate::metrics::NetMetrics;
use crate::queue::{BoundedQueue, QueueFull};
use crate::wire::{self, MAX_MESSAGE_SIZE};

/// A raw datagram as received, not yet validated.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub from: SocketAddr,
    pub bytes: Bytes,
}

/// A message waiting to be encoded and sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub to: SocketAddr,
    pub type_id: u32,
    pub index: MessageIndex,
    pub content: Bytes,
}

/// State of the receive task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PumpStatus {
    Idle = 0,
    /// A receive is outstanding.
    Listening = 1,
    /// A completed datagram is being queued.
    Parsing = 2,
}

impl PumpStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => PumpStatus::Listening,
            2 => PumpStatus::Parsing,
            _ => PumpStatus::Idle,
        }
    }
}

struct Shared {
    receive: BoundedQueue<Datagram>,
    send: BoundedQueue<Outgoing>,
    status: AtomicU8,
    disposed: AtomicBool,
    metrics: Arc<NetMetrics>,
    log_tag: &'static str,
}

impl Shared {
    fn set_status(&self, status: PumpStatus) {
        self.status.store(status as u8, Ordering::Release);
    }
}

/// Non-blocking UDP send/receive engine.
pub struct SocketPump {
    socket: Arc<UdpSocket>,
    shared: Arc<Shared>,
    receiver: Option<JoinHandle<()>>,
    scratch: BytesMut,
}

impl SocketPump {
    /// Binds a UDP socket and starts receiving.
    pub async fn bind(
        addr: SocketAddr,
        capacity: usize,
        metrics: Arc<NetMetrics>,
        log_tag: &'static str,
    ) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("udp bind {addr}"))?;
        Ok(Self::from_socket(socket, capacity, metrics, log_tag))
    }

    /// Wraps an already bound socket and starts receiving.
    pub fn from_socket(
        socket: UdpSocket,
        capacity: usize,
        metrics: Arc<NetMetrics>,
        log_tag: &'static str,
    ) -> Self {
        let socket = Arc::new(socket);
        let shared = Arc::new(Shared {
            receive: BoundedQueue::new(capacity),
            send: BoundedQueue::new(capacity),
            status: AtomicU8::new(PumpStatus::Idle as u8),
            disposed: AtomicBool::new(false),
            metrics,
            log_tag,
        });
        let receiver = tokio::spawn(receive_loop(Arc::clone(&socket), Arc::clone(&shared)));
        Self {
            socket,
            shared,
            receiver: Some(receiver),
            scratch: BytesMut::with_capacity(MAX_MESSAGE_SIZE),
        }
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn status(&self) -> PumpStatus {
        PumpStatus::from_u8(self.shared.status.load(Ordering::Acquire))
    }

    /// Queues a message for the next flush. Drops it when the queue is full.
    pub fn enqueue_send(&self, outgoing: Outgoing) -> Result<(), QueueFull> {
        let to = outgoing.to;
        let type_id = outgoing.type_id;
        self.shared.send.push(outgoing).inspect_err(|_| {
            self.shared.metrics.record_queue_full();
            warn!(tag = self.shared.log_tag, %to, type_id, "send queue full, dropping message");
        })
    }

    /// Encodes and sends everything queued. Returns the number of datagrams sent.
    pub async fn flush_sends(&mut self) -> usize {
        let outgoing = self.shared.send.take_all();
        let mut sent = 0;
        for out in outgoing {
            if self.is_disposed() {
                break;
            }
            self.scratch.clear();
            if let Err(e) = wire::encode_into(&mut self.scratch, out.type_id, out.index, &out.content)
            {
                warn!(tag = self.shared.log_tag, to = %out.to, type_id = out.type_id, error = %e, "dropping unencodable message");
                continue;
            }
            match self.socket.send_to(&self.scratch, out.to).await {
                Ok(n) => {
                    self.shared.metrics.record_upload(n);
                    sent += 1;
                }
                Err(e) => {
                    warn!(tag = self.shared.log_tag, to = %out.to, error = %e, "udp send failed");
                }
            }
        }
        sent
    }

    /// Removes queued outgoing messages without sending them.
    pub fn take_outgoing(&self) -> Vec<Outgoing> {
        self.shared.send.take_all()
    }

    /// Removes every received datagram, oldest first.
    pub fn take_received(&self) -> Vec<Datagram> {
        self.shared.receive.take_all()
    }

    /// Returns unprocessed datagrams to the front of the receive queue.
    pub fn requeue_received(&self, rest: Vec<Datagram>) {
        self.shared.receive.requeue_front(rest);
    }

    pub fn pending_received(&self) -> usize {
        self.shared.receive.len()
    }

    pub fn pending_sends(&self) -> usize {
        self.shared.send.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    /// Stops receiving and discards anything still queued.
    pub fn dispose(&mut self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(receiver) = self.receiver.take() {
            receiver.abort();
        }
        let _ = self.shared.receive.take_all();
        let _ = self.shared.send.take_all();
        debug!(tag = self.shared.log_tag, "socket pump disposed");
    }
}

impl Drop for SocketPump {
    fn drop(&mut self) {
        self.shared.disposed.store(true, Ordering::Release);
        if let Some(receiver) = self.receiver.take() {
            receiver.abort();
        }
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, shared: Arc<Shared>) {
    // One byte of slack so oversize datagrams are detectable rather than truncated.
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE + 1];
    loop {
        shared.set_status(PumpStatus::Listening);
        let result = socket.recv_from(&mut buf).await;
        if shared.disposed.load(Ordering::Acquire) {
            break;
        }
        shared.set_status(PumpStatus::Parsing);

        match result {
            Ok((n, from)) if n > MAX_MESSAGE_SIZE => {
                shared.metrics.record_oversize();
                warn!(tag = shared.log_tag, %from, "datagram larger than the maximum message size");
            }
            Ok((n, from)) => {
                shared.metrics.record_download(n);
                let datagram = Datagram {
                    from,
                    bytes: Bytes::copy_from_slice(&buf[..n]),
                };
                if shared.receive.push(datagram).is_err() {
                    shared.metrics.record_queue_full();
                    warn!(tag = shared.log_tag, %from, "receive queue full, dropping datagram");
                } else {
                    trace!(tag = shared.log_tag, %from, len = n, "datagram queued");
                }
            }
            Err(e) => {
                // ICMP port-unreachable surfaces here on some platforms; keep listening.
                debug!(tag = shared.log_tag, error = %e, "udp receive error");
                tokio::task::yield_now().await;
            }
        }
        shared.set_status(PumpStatus::Idle);
    }
    shared.set_status(PumpStatus::Idle);
}
