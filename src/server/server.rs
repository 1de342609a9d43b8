//! DSU UDP server
//!
//! Answers version and list-ports requests, records pad-data subscriptions
//! and fans every normalized report out to subscribed clients. Invalid
//! datagrams are dropped without a reply.

use crate::ds3::types::{NormalizedReport, PadId, PadMeta};
use crate::server::codec::{self, Magic, MessageType, Request, MAX_PROTOCOL_VERSION};
use crate::server::report::{encode_pad_data, WireSettings};
use crate::server::subscription::SubscriptionRegistry;
use log::{debug, info};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::UdpSocket;

/// Largest datagram read in one receive
const RECV_BUFFER_LEN: usize = 1024;

/// How often the receive loop re-checks the running flag
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Socket error: {0}")]
    Io(#[from] io::Error),
}

/// Source of per-slot metadata for list-ports replies
pub trait PadInfoProvider: Send + Sync {
    fn pad_meta(&self, pad: PadId) -> PadMeta;
}

pub struct ProtocolServer {
    socket: UdpSocket,
    server_id: u32,
    running: Arc<AtomicBool>,
    registry: SubscriptionRegistry,
    pads: Arc<dyn PadInfoProvider>,
    settings: WireSettings,
}

impl ProtocolServer {
    /// Bind the socket and pick a fresh server id
    pub async fn bind(
        addr: SocketAddr,
        pads: Arc<dyn PadInfoProvider>,
        settings: WireSettings,
    ) -> Result<Self, ServerError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;

        let server_id = rand::random::<u32>();
        info!("DSU server bound to {} (id {:08X})", socket.local_addr()?, server_id);

        Ok(Self {
            socket,
            server_id,
            running: Arc::new(AtomicBool::new(true)),
            registry: SubscriptionRegistry::new(),
            pads,
            settings,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn server_id(&self) -> u32 {
        self.server_id
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Shared flag, cleared by [`ProtocolServer::stop`]
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Stop accepting datagrams; in-flight handlers and broadcasts become no-ops
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            info!("DSU server stopping");
        }
    }

    /// Receive loop. Each datagram is copied and handled on its own task.
    pub async fn run(self: Arc<Self>) {
        let mut buf = vec![0u8; RECV_BUFFER_LEN];

        while self.is_running() {
            let received = tokio::time::timeout(RECV_POLL_INTERVAL, self.socket.recv_from(&mut buf)).await;

            match received {
                Err(_) => continue,
                Ok(Ok((len, peer))) => {
                    let datagram = buf[..len].to_vec();
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.handle_datagram(&datagram, peer).await;
                    });
                }
                Ok(Err(e)) => debug!("Receive failed: {}", e),
            }
        }

        info!("DSU server stopped");
    }

    async fn handle_datagram(&self, datagram: &[u8], peer: SocketAddr) {
        if !self.is_running() {
            return;
        }

        for reply in self.respond(datagram, peer, Instant::now()) {
            if !self.is_running() {
                return;
            }
            if let Err(e) = self.socket.send_to(&reply, peer).await {
                debug!("Reply to {} failed: {}", peer, e);
            }
        }
    }

    /// Validate and dispatch one datagram, returning the replies for `peer`
    pub fn respond(&self, datagram: &[u8], peer: SocketAddr, now: Instant) -> Vec<Vec<u8>> {
        let packet = match codec::parse(datagram, Magic::Client) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Dropping datagram from {}: {}", peer, e);
                return Vec::new();
            }
        };

        let request = match Request::decode(&packet.payload) {
            Ok(request) => request,
            Err(e) => {
                debug!("Dropping request from {}: {}", peer, e);
                return Vec::new();
            }
        };

        match request {
            Request::Version => {
                let mut body = MAX_PROTOCOL_VERSION.to_le_bytes().to_vec();
                body.extend_from_slice(&[0, 0]);
                vec![self.message(MessageType::Version, &body)]
            }
            Request::ListPorts(slots) => slots
                .into_iter()
                .map(|slot| self.message(MessageType::PortInfo, &port_info(&self.pads.pad_meta(slot))))
                .collect(),
            Request::PadData {
                flags,
                slot,
                address,
            } => {
                self.registry.register(peer, flags, slot, address, now);
                Vec::new()
            }
        }
    }

    fn message(&self, message_type: MessageType, body: &[u8]) -> Vec<u8> {
        codec::message(Magic::Server, self.server_id, message_type, body)
    }

    /// Send a report to every subscribed client, returning how many sends succeeded
    pub async fn broadcast(&self, report: &NormalizedReport) -> usize {
        if !self.is_running() {
            return 0;
        }

        let recipients = self
            .registry
            .recipients(report.pad_id, &report.address, Instant::now());
        if recipients.is_empty() {
            return 0;
        }

        let Some(packet) = encode_pad_data(report, &self.settings, self.server_id) else {
            debug!("No wire layout for {:?}, report not sent", report.model);
            return 0;
        };

        let mut sent = 0;
        for client in recipients {
            if !self.is_running() {
                break;
            }
            match self.socket.send_to(&packet, client).await {
                Ok(_) => sent += 1,
                Err(e) => debug!("Pad data to {} failed: {}", client, e),
            }
        }
        sent
    }
}

/// 12-byte port-info body: slot, state, model, connection, address, battery, 0
fn port_info(meta: &PadMeta) -> Vec<u8> {
    let mut body = Vec::with_capacity(12);
    body.push(meta.pad_id as u8);
    body.push(meta.state as u8);
    body.push(meta.model as u8);
    body.push(meta.connection_type as u8);
    body.extend_from_slice(meta.address.as_bytes());
    body.push(meta.battery as u8);
    body.push(0);
    body
}
