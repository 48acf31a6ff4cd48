//! TFTP Server Implementation
//!
//! This module contains the dispatch loop that receives datagrams, routes them
//! to the transfer state machine and sends the replies, plus the background
//! work that keeps transfers alive over a lossy channel:
//!
//! - a failed send marks the transfer and hands the retransmission to a
//!   short-lived retry task;
//! - a sweeper resends the last packet of transfers that went quiet and
//!   abandons them after too many attempts.
//!
//! The registry lock is only held for map and store operations, never across
//! a network send.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};

use crate::conn::PacketConn;
use crate::protocol::{MAX_PACKET_SIZE, Packet, TftpErrorCode, TftpOpcode, peek_opcode};
use crate::store::{DirStore, Store};
use crate::transfer::{TransferConfig, TransferRegistry};

/// Receives datagrams and drives the transfer state machine
///
/// Cloning is cheap; clones share the connection and the registry.
pub struct Dispatcher<C, S> {
    conn: Arc<C>,
    registry: Arc<Mutex<TransferRegistry<S>>>,
    config: TransferConfig,
}

impl<C, S> Clone for Dispatcher<C, S> {
    fn clone(&self) -> Self {
        Self {
            conn: Arc::clone(&self.conn),
            registry: Arc::clone(&self.registry),
            config: self.config.clone(),
        }
    }
}

impl<C: PacketConn, S: Store> Dispatcher<C, S> {
    pub fn new(conn: Arc<C>, store: S, config: TransferConfig) -> Self {
        Self {
            conn,
            registry: Arc::new(Mutex::new(TransferRegistry::new(store))),
            config,
        }
    }

    /// Shared transfer registry
    pub fn registry(&self) -> &Arc<Mutex<TransferRegistry<S>>> {
        &self.registry
    }

    fn lock(&self) -> MutexGuard<'_, TransferRegistry<S>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decode one datagram and route it to the state machine
    ///
    /// Returns the reply to send, if any. Malformed datagrams are dropped.
    pub fn handle_datagram(&self, peer: SocketAddr, buf: &[u8]) -> Option<Packet> {
        let opcode = match peek_opcode(buf) {
            Ok(opcode) => opcode,
            Err(e) => {
                tracing::debug!("Dropping datagram from {}: {}", peer, e);
                return None;
            }
        };

        if TftpOpcode::from_u16(opcode).is_none() {
            tracing::debug!("Ignoring unsupported opcode {} from {}", opcode, peer);
            return None;
        }

        let packet = match Packet::decode(buf) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!("Failed to parse packet from {}: {}", peer, e);
                return None;
            }
        };

        tracing::debug!("Received {} from {}", packet, peer);

        let mut registry = self.lock();
        match packet {
            Packet::Request(request) => Some(registry.on_request(peer, &request)),
            Packet::Data(data) => match registry.on_data(peer, data) {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::debug!("{}", e);
                    Some(Packet::error(TftpErrorCode::UnknownUser))
                }
            },
            Packet::Ack(ack) => registry.on_ack(peer, ack).unwrap_or_else(|e| {
                tracing::debug!("Ignoring ACK: {}", e);
                None
            }),
            Packet::Error(error) => {
                registry.on_error(peer, &error);
                None
            }
        }
    }

    /// Main receive loop
    ///
    /// Only an unrecoverable error on the underlying connection ends the loop.
    pub async fn run(&self) -> io::Result<()> {
        // One spare byte to detect datagrams over the limit
        let mut buffer = vec![0u8; MAX_PACKET_SIZE + 1];

        loop {
            let (len, peer) = match timeout(self.config.recv_timeout, self.conn.recv_from(&mut buffer)).await {
                Ok(Ok(received)) => received,
                Ok(Err(e)) if is_transient(&e) => {
                    tracing::debug!("Transient receive error: {}", e);
                    continue;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    tracing::trace!("No datagram within {:?}", self.config.recv_timeout);
                    continue;
                }
            };

            if len > MAX_PACKET_SIZE {
                tracing::warn!("Dropping oversized datagram from {}", peer);
                continue;
            }

            // The buffer is reused; only the first `len` bytes belong to this datagram
            if let Some(reply) = self.handle_datagram(peer, &buffer[..len]) {
                self.reply(peer, reply).await;
            }
        }
    }

    /// Spawn the timeout sweeper
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(this.config.sweep_interval);
            loop {
                ticker.tick().await;
                this.sweep().await;
            }
        })
    }

    /// Resend the last packet of every silent transfer, abandoning those out of retries
    pub async fn sweep(&self) {
        let expired = self
            .lock()
            .expire(Instant::now(), self.config.timeout, self.config.max_retries);

        for transfer in expired.abandoned {
            tracing::warn!(
                "Abandoning transfer of '{}' with {} after {} retransmissions",
                transfer.filename,
                transfer.peer,
                transfer.retries
            );
        }

        for (peer, packet) in expired.resend {
            tracing::debug!("Timeout, retransmitting {} to {}", packet, peer);
            self.reply(peer, packet).await;
        }
    }

    /// Send a reply, handing it to a retry task if the send fails
    async fn reply(&self, peer: SocketAddr, packet: Packet) {
        let bytes = match packet.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Failed to encode {} for {}: {}", packet, peer, e);
                return;
            }
        };

        if self.send(peer, &bytes).await {
            self.lock().record_sent(&peer, &packet);
            return;
        }

        // Replies outside the peer's transfer, such as an error for a stray
        // DATA block, are retried as-is
        let bound = self.lock().record_send_failure(&peer, &packet).is_some();
        let this = self.clone();
        tokio::spawn(async move { this.retransmit(peer, bytes, bound).await });
    }

    /// Retry a failed send on a bounded schedule
    ///
    /// When the packet belongs to a registered transfer, each attempt resends
    /// the transfer's recorded packet and the transfer is abandoned once the
    /// attempts run out. Otherwise the original bytes are retried on their own.
    async fn retransmit(&self, peer: SocketAddr, bytes: Vec<u8>, bound: bool) {
        for attempt in 1..=self.config.max_send_retries {
            sleep(self.config.send_retry_delay).await;

            let (bytes, pending) = if bound {
                let pending = self.lock().pending_packet(&peer);
                // Gone, or already delivered by a later send
                let Some(packet) = pending else {
                    return;
                };
                match packet.encode() {
                    Ok(bytes) => (bytes, Some(packet)),
                    Err(_) => return,
                }
            } else {
                (bytes.clone(), None)
            };

            if self.send(peer, &bytes).await {
                tracing::debug!("Resent packet to {} on attempt {}", peer, attempt);
                if let Some(packet) = pending {
                    self.lock().record_sent(&peer, &packet);
                }
                return;
            }
        }

        tracing::warn!(
            "Giving up on {} after {} failed sends",
            peer,
            self.config.max_send_retries
        );
        if bound {
            self.lock().abandon(&peer);
        }
    }

    async fn send(&self, peer: SocketAddr, bytes: &[u8]) -> bool {
        match timeout(self.config.send_timeout, self.conn.send_to(bytes, peer)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::warn!("Failed to send to {}: {}", peer, e);
                false
            }
            Err(_) => {
                tracing::warn!("Timed out sending to {}", peer);
                false
            }
        }
    }
}

/// Errors a UDP socket reports for earlier datagrams rather than for itself
fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused | io::ErrorKind::Interrupted
    )
}

/// TFTP Server configuration
#[derive(Debug, Clone)]
pub struct TftpServerConfig {
    pub bind_address: String,
    pub transfer_config: TransferConfig,
}

impl Default for TftpServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:6969".to_string(),
            transfer_config: TransferConfig::default(),
        }
    }
}

/// Main TFTP server
pub struct TftpServer<S> {
    config: TftpServerConfig,
    store: Option<S>,
    socket: Option<Arc<UdpSocket>>,
}

impl<S: Store> TftpServer<S> {
    /// Create a new TFTP server with the given configuration
    pub fn new(config: TftpServerConfig, store: S) -> Self {
        Self {
            config,
            store: Some(store),
            socket: None,
        }
    }

    /// Create a new TFTP server with default configuration
    pub fn with_defaults(store: S) -> Self {
        Self::new(TftpServerConfig::default(), store)
    }

    /// Get the server's configuration
    pub fn config(&self) -> &TftpServerConfig {
        &self.config
    }

    /// Get a mutable reference to the server's configuration
    pub fn config_mut(&mut self) -> &mut TftpServerConfig {
        &mut self.config
    }

    /// Get the local address the server is bound to (if bound)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Bind the server socket without serving yet
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let socket = UdpSocket::bind(&self.config.bind_address)
            .await
            .context("Failed to bind TFTP server socket")?;
        let local_addr = socket.local_addr().context("Failed to get local address")?;

        self.socket = Some(Arc::new(socket));
        Ok(local_addr)
    }

    /// Start the TFTP server and run the main loop
    pub async fn run(&mut self) -> Result<()> {
        if self.socket.is_none() {
            self.bind().await?;
        }

        let socket = self.socket.clone().context("Server must be bound before serving")?;
        let store = self.store.take().context("TFTP server is already running")?;

        tracing::info!("TFTP server listening on {}", socket.local_addr()?);

        let dispatcher = Dispatcher::new(socket, store, self.config.transfer_config.clone());
        let sweeper = dispatcher.spawn_sweeper();
        let result = dispatcher.run().await.context("TFTP receive loop failed");
        sweeper.abort();
        result
    }
}

/// Run a TFTP server with the given bind address and root directory
///
/// This is a convenience function that serves files from a directory.
pub async fn run_tftp_server(bind_address: String, root_directory: PathBuf) -> Result<()> {
    tracing::info!("Serving files from {}", root_directory.display());

    let config = TftpServerConfig {
        bind_address,
        ..Default::default()
    };
    TftpServer::new(config, DirStore::new(root_directory)).run().await
}
