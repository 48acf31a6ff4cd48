//! TFTP (Trivial File Transfer Protocol) Implementation
//!
//! This crate provides an RFC 1350 TFTP server core:
//! - Wire codec for RRQ, WRQ, DATA, ACK and ERROR packets
//! - Read and write transfers tracked per peer address and block number
//! - Binary (octet) and text (netascii) transfer modes
//! - Retransmission after failed sends and after silent timeouts
//! - Pluggable file storage (in memory or a confined directory)
//!
//! # Organization
//!
//! - [`Packet`] and its parts ([`TftpRequest`], [`TftpData`], [`TftpAck`],
//!   [`TftpError`]) with [`Packet::encode`], [`Packet::decode`] and [`peek_opcode`]
//! - [`TransferRegistry`] - the transfer state machine, one entry point per packet kind
//! - [`Dispatcher`] - the receive loop over any [`PacketConn`]
//! - [`TftpServer`] - binds a UDP socket and runs the dispatcher
//!
//! # Basic Server Usage
//!
//! ```rust,no_run
//! use tftp::{MemoryStore, TftpServer, TftpServerConfig, run_tftp_server};
//! use std::path::PathBuf;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // Serve a directory
//!     run_tftp_server("0.0.0.0:69".to_string(), PathBuf::from("./tftp_root")).await?;
//!
//!     // Or keep files in memory
//!     let store = MemoryStore::new().with_file("hello.txt", b"hello".to_vec());
//!     let config = TftpServerConfig {
//!         bind_address: "127.0.0.1:6969".to_string(),
//!         ..Default::default()
//!     };
//!     TftpServer::new(config, store).run().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Driving the State Machine Directly
//!
//! ```rust
//! use tftp::{MemoryStore, Packet, TftpAck, TftpRequest, TransferMode, TransferRegistry};
//!
//! let store = MemoryStore::new().with_file("boot.img", vec![0u8; 600]);
//! let mut registry = TransferRegistry::new(store);
//! let peer = "10.0.0.2:3456".parse().unwrap();
//!
//! let first = registry.on_request(peer, &TftpRequest::read_request("boot.img", TransferMode::Octet));
//! assert_eq!(first, Packet::data(1, vec![0u8; 512]));
//!
//! let second = registry.on_ack(peer, TftpAck::new(1)).unwrap();
//! assert_eq!(second, Some(Packet::data(2, vec![0u8; 88])));
//! ```

mod conn;
mod protocol;
mod server;
mod store;
mod transfer;

pub use conn::*;
pub use protocol::*;
pub use server::*;
pub use store::*;
pub use transfer::*;
