//! Agent: the per-endpoint object shared by client and server.
//!
//! An [`Agent`] owns the socket pump and metrics. Protocol state lives in the
//! type that embeds it (server or client), which implements [`Endpoint`] so
//! the common per-tick drive can be written once:
//!
//! 1. roll metrics,
//! 2. drain the receive queue, decoding each frame and handing valid ones to
//!    [`Endpoint::process_message`],
//! 3. run [`Endpoint::on_step`] (timers, room ticks),
//! 4. flush queued sends.
//!
//! Nothing here spawns a loop of its own apart from the pump's receive task;
//! an external driver calls [`Endpoint::step`] at its own rate.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::config::NetConfig;
use crate::message::MessageIndex;
use crate::metrics::{MetricsSnapshot, NetMetrics};
use crate::payload::{self, NetPayload};
use crate::pump::{Datagram, Outgoing, SocketPump};
use crate::wire::{self, WireMessage, MAX_CONTENT_SIZE};

/// Transport half of an endpoint.
pub struct Agent {
    pump: SocketPump,
    metrics: Arc<NetMetrics>,
    log_tag: &'static str,
    buffering: bool,
}

impl Agent {
    /// Binds the socket and starts the receive task.
    pub async fn bind(
        addr: SocketAddr,
        config: &NetConfig,
        log_tag: &'static str,
    ) -> anyhow::Result<Self> {
        let metrics = Arc::new(NetMetrics::default());
        let pump =
            SocketPump::bind(addr, config.queue_capacity, Arc::clone(&metrics), log_tag).await?;
        debug!(tag = log_tag, addr = %pump.local_addr()?, "agent bound");
        Ok(Self {
            pump,
            metrics,
            log_tag,
            buffering: false,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.pump.local_addr()
    }

    pub fn log_tag(&self) -> &'static str {
        self.log_tag
    }

    /// Queues raw content for `to`. Returns `false` if it was dropped.
    pub fn send(&self, to: SocketAddr, type_id: u32, index: MessageIndex, content: Bytes) -> bool {
        if self.pump.is_disposed() {
            return false;
        }
        if content.len() > MAX_CONTENT_SIZE {
            self.metrics.record_oversize();
            warn!(tag = self.log_tag, %to, type_id, len = content.len(), "content too large, dropping");
            return false;
        }
        trace!(tag = self.log_tag, %to, type_id, index, "queue send");
        self.pump
            .enqueue_send(Outgoing {
                to,
                type_id,
                index,
                content,
            })
            .is_ok()
    }

    /// Packs `payload` and queues it for `to`.
    pub fn send_payload<P: NetPayload>(
        &self,
        to: SocketAddr,
        type_id: u32,
        index: MessageIndex,
        payload: &P,
    ) -> bool {
        self.send(to, type_id, index, payload::to_bytes(payload))
    }

    /// Pauses or resumes processing of the receive queue.
    ///
    /// Datagrams keep being accepted while paused.
    pub fn set_buffering(&mut self, buffering: bool) {
        if self.buffering != buffering {
            debug!(tag = self.log_tag, buffering, "receive buffering changed");
        }
        self.buffering = buffering;
    }

    pub fn is_buffering(&self) -> bool {
        self.buffering
    }

    pub fn metrics(&self) -> &Arc<NetMetrics> {
        &self.metrics
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn roll_metrics(&self, now: Instant) {
        self.metrics.roll(now);
    }

    pub fn take_received(&self) -> Vec<Datagram> {
        self.pump.take_received()
    }

    pub fn requeue_received(&self, rest: Vec<Datagram>) {
        self.pump.requeue_received(rest);
    }

    pub fn pending_received(&self) -> usize {
        self.pump.pending_received()
    }

    /// Removes queued sends without transmitting them.
    pub fn take_outgoing(&self) -> Vec<Outgoing> {
        self.pump.take_outgoing()
    }

    pub async fn flush_sends(&mut self) -> usize {
        self.pump.flush_sends().await
    }

    pub fn is_disposed(&self) -> bool {
        self.pump.is_disposed()
    }

    /// Stops the receive task and drops everything queued.
    pub fn dispose(&mut self) {
        self.pump.dispose();
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("tag", &self.log_tag)
            .field("local_addr", &self.pump.local_addr().ok())
            .field("buffering", &self.buffering)
            .field("disposed", &self.pump.is_disposed())
            .finish()
    }
}

/// A protocol endpoint driven once per tick.
#[async_trait]
pub trait Endpoint: Send {
    fn agent(&self) -> &Agent;
    fn agent_mut(&mut self) -> &mut Agent;

    /// Handles one valid frame.
    fn process_message(&mut self, from: SocketAddr, msg: &WireMessage<'_>);

    /// Per-step work after inbound processing and before the flush.
    fn on_step(&mut self, _elapsed: Duration) {}

    /// Runs one drive step. `elapsed` is the logical time since the last step.
    async fn step(&mut self, elapsed: Duration) -> anyhow::Result<()> {
        if self.agent().is_disposed() {
            return Ok(());
        }
        self.agent().roll_metrics(Instant::now());
        drain_inbound(self);
        self.on_step(elapsed);
        self.agent_mut().flush_sends().await;
        Ok(())
    }
}

/// Decodes and processes every queued datagram. Returns the number processed.
///
/// If processing switches buffering on, the unprocessed remainder goes back
/// to the front of the receive queue.
pub fn drain_inbound<E: Endpoint + ?Sized>(endpoint: &mut E) -> usize {
    if endpoint.agent().is_buffering() {
        return 0;
    }
    let mut pending = endpoint.agent().take_received().into_iter();
    let mut processed = 0;
    while let Some(datagram) = pending.next() {
        match wire::decode(&datagram.bytes) {
            Ok(msg) => {
                endpoint.process_message(datagram.from, &msg);
                processed += 1;
            }
            Err(e) => {
                endpoint.agent().metrics().record_invalid();
                trace!(tag = endpoint.agent().log_tag(), from = %datagram.from, error = %e, "dropping invalid frame");
            }
        }
        if endpoint.agent().is_disposed() {
            break;
        }
        if endpoint.agent().is_buffering() {
            let rest: Vec<Datagram> = pending.collect();
            if !rest.is_empty() {
                endpoint.agent().requeue_received(rest);
            }
            break;
        }
    }
    processed
}
