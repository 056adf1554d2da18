//! Test harness: one server and any number of clients on localhost UDP.
//!
//! Logical time and wall time are decoupled. Every harness step advances
//! each agent by [`STEP`] of logical time, then sleeps briefly so datagrams
//! have a chance to cross the loopback interface.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use lockstep_client::client::Client;
use lockstep_server::server::Server;
use lockstep_shared::agent::Endpoint;
use lockstep_shared::config::NetConfig;
use lockstep_shared::message::{MessageIndex, MessageType};
use lockstep_shared::wire::{self, MAX_MESSAGE_SIZE};
use tokio::net::UdpSocket;

/// Logical time per harness step.
pub const STEP: Duration = Duration::from_millis(5);

/// Wall-clock pause between harness steps.
const SETTLE: Duration = Duration::from_millis(2);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

pub fn localhost() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
}

/// Server bound to an ephemeral localhost port.
pub async fn bind_ephemeral(config: NetConfig) -> anyhow::Result<(Server, NetConfig)> {
    let server = Server::bind(localhost(), config.clone()).await?;
    let client_cfg = NetConfig {
        server_addr: server.local_addr()?.to_string(),
        bind_addr: localhost().to_string(),
        ..config
    };
    Ok((server, client_cfg))
}

pub struct Harness {
    pub server: Server,
    pub clients: Vec<Client>,
    client_cfg: NetConfig,
}

impl Harness {
    pub async fn new(config: NetConfig) -> anyhow::Result<Self> {
        let (server, client_cfg) = bind_ephemeral(config).await?;
        Ok(Self {
            server,
            clients: Vec::new(),
            client_cfg,
        })
    }

    pub fn server_addr(&self) -> anyhow::Result<SocketAddr> {
        self.server.local_addr()
    }

    /// Adds a client (not yet connected) and returns its index.
    pub async fn add_client(&mut self) -> anyhow::Result<usize> {
        let client = Client::new(self.client_cfg.clone())
            .await
            .context("create test client")?;
        self.clients.push(client);
        Ok(self.clients.len() - 1)
    }

    /// Steps clients first (flushing their requests), then the server.
    pub async fn step(&mut self) -> anyhow::Result<()> {
        for client in &mut self.clients {
            client.step(STEP).await?;
        }
        tokio::time::sleep(SETTLE).await;
        self.server.step(STEP).await?;
        tokio::time::sleep(SETTLE).await;
        Ok(())
    }

    /// Steps until `done` holds, failing after `max_steps`.
    pub async fn run_until<F>(&mut self, max_steps: usize, mut done: F) -> anyhow::Result<()>
    where
        F: FnMut(&Harness) -> bool,
    {
        for _ in 0..max_steps {
            if done(self) {
                return Ok(());
            }
            self.step().await?;
        }
        if done(self) {
            return Ok(());
        }
        anyhow::bail!("condition not reached after {max_steps} steps")
    }

    /// Connects every client and waits for all handshakes.
    pub async fn connect_all(&mut self) -> anyhow::Result<()> {
        for client in &mut self.clients {
            client.connect();
        }
        self.run_until(200, |h| h.clients.iter().all(Client::is_connected))
            .await
            .context("clients did not connect")
    }

    /// Adds and connects clients one at a time so ids follow client order.
    pub async fn connect_clients(&mut self, n: usize) -> anyhow::Result<()> {
        for _ in 0..n {
            let i = self.add_client().await?;
            self.clients[i].connect();
            self.run_until(200, |h| h.clients[i].is_connected())
                .await
                .context("client did not connect")?;
        }
        Ok(())
    }

    /// Blocks (in wall time) until the server has `n` datagrams queued.
    pub async fn wait_server_inbound(&self, n: usize) -> anyhow::Result<()> {
        for _ in 0..500 {
            if self.server.agent().pending_received() >= n {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        anyhow::bail!("server never received {n} datagrams")
    }
}

/// A frame as seen by a [`RawPeer`].
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub type_id: u32,
    pub index: MessageIndex,
    pub content: Bytes,
}

/// A bare socket speaking the wire format, for tests that need exact control
/// over indices and bytes.
pub struct RawPeer {
    pub socket: UdpSocket,
    pub server: SocketAddr,
}

impl RawPeer {
    pub async fn bind(server: SocketAddr) -> anyhow::Result<Self> {
        Ok(Self {
            socket: UdpSocket::bind(localhost()).await?,
            server,
        })
    }

    pub async fn send(&self, ty: MessageType, index: MessageIndex, content: &[u8]) -> anyhow::Result<()> {
        self.send_type(ty.id(), index, content).await
    }

    pub async fn send_type(&self, type_id: u32, index: MessageIndex, content: &[u8]) -> anyhow::Result<()> {
        let frame = wire::encode(type_id, index, content)?;
        self.socket.send_to(&frame, self.server).await?;
        Ok(())
    }

    pub async fn send_bytes(&self, bytes: &[u8]) -> anyhow::Result<()> {
        self.socket.send_to(bytes, self.server).await?;
        Ok(())
    }

    /// Returns every valid frame already waiting on the socket.
    pub fn drain(&self) -> Vec<RawFrame> {
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        let mut frames = Vec::new();
        while let Ok((n, _)) = self.socket.try_recv_from(&mut buf) {
            if let Ok(msg) = wire::decode(&buf[..n]) {
                frames.push(RawFrame {
                    type_id: msg.type_id,
                    index: msg.index,
                    content: Bytes::copy_from_slice(msg.content),
                });
            }
        }
        frames
    }
}
