//! TFTP Transfer State Machine
//!
//! This module tracks every transfer in progress and decides the reply to each
//! inbound packet. TFTP has no connection concept, so a transfer is identified
//! by the peer's address (its TID) and validated by the block number carried in
//! each DATA or ACK packet.
//!
//! Nothing here touches the network. Every entry point takes the decoded
//! packet and returns the packet to send back, if any. The dispatch loop in
//! [`crate::server`] owns the socket and calls in while holding the registry
//! lock.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::protocol::{
    MAX_DATA_SIZE, Packet, RequestKind, TftpAck, TftpData, TftpError, TftpErrorCode, TftpRequest, TransferMode,
};
use crate::store::{Store, StoreError};

const TIMEOUT_SECS: u64 = 3;
const MAX_RETRIES: usize = 8;

/// Transfer session configuration
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Silence after which the last packet of a transfer is sent again
    pub timeout: Duration,
    /// Timeout retransmissions before a transfer is abandoned
    pub max_retries: usize,
    /// Upper bound on a single datagram send
    pub send_timeout: Duration,
    /// Delay between attempts after a failed send
    pub send_retry_delay: Duration,
    /// Failed send attempts before a transfer is abandoned
    pub max_send_retries: usize,
    /// How often the sweeper looks for timed out transfers
    pub sweep_interval: Duration,
    /// Upper bound on a single receive; the loop simply waits again
    pub recv_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(TIMEOUT_SECS),
            max_retries: MAX_RETRIES,
            send_timeout: Duration::from_secs(1),
            send_retry_delay: Duration::from_millis(100),
            max_send_retries: 5,
            sweep_interval: Duration::from_millis(500),
            recv_timeout: Duration::from_secs(30),
        }
    }
}

/// Errors raised by the state machine for packets it cannot place
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    /// No transfer for this peer expects this block
    #[error("unknown transfer: block {block} from {peer}")]
    UnknownTransfer { peer: SocketAddr, block: u16 },
}

/// Which way the file bytes flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Server sends the file (RRQ)
    Send,
    /// Server receives the file (WRQ)
    Receive,
}

/// State of one file exchange
#[derive(Debug, Clone)]
pub struct Transfer {
    pub peer: SocketAddr,
    pub direction: Direction,
    /// Store key given in the request
    pub filename: String,
    pub mode: TransferMode,
    /// Receive: last acknowledged block. Send: block awaiting its ACK.
    pub block_num: u16,
    /// Received bytes, or the whole wire image of the file being sent
    pub buffer: Vec<u8>,
    /// Exact packet to retransmit
    pub last_sent: Packet,
    pub last_activity: Instant,
    /// Timeout retransmissions since the last progress
    pub retries: usize,
    /// The last send failed and a retry task owns the retransmission
    pub pending_retransmit: bool,
    /// Blocks received, or the non-wrapping number of the block in flight.
    /// Offsets are derived from this so files over 65535 blocks still work.
    sequence: usize,
}

impl Transfer {
    fn new(peer: SocketAddr, direction: Direction, filename: String, mode: TransferMode, reply: Packet) -> Self {
        Self {
            peer,
            direction,
            filename,
            mode,
            block_num: 0,
            buffer: Vec::new(),
            last_sent: reply,
            last_activity: Instant::now(),
            retries: 0,
            pending_retransmit: false,
            sequence: 0,
        }
    }

    /// Record a reply that moved the transfer forward
    fn progress(&mut self, reply: Packet) {
        self.last_sent = reply;
        self.last_activity = Instant::now();
        self.retries = 0;
    }
}

/// Packets to resend and transfers given up by [`TransferRegistry::expire`]
#[derive(Debug, Default)]
pub struct Expired {
    pub resend: Vec<(SocketAddr, Packet)>,
    pub abandoned: Vec<Transfer>,
}

/// All transfers in progress plus the store they read from and write to
pub struct TransferRegistry<S> {
    transfers: HashMap<SocketAddr, Transfer>,
    store: S,
}

impl<S: Store> TransferRegistry<S> {
    pub fn new(store: S) -> Self {
        Self {
            transfers: HashMap::new(),
            store,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn get(&self, peer: &SocketAddr) -> Option<&Transfer> {
        self.transfers.get(peer)
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    /// Handle an RRQ or WRQ
    ///
    /// Always produces a reply: the first DATA block, ACK 0, or an error. A
    /// request from a peer that already has a transfer replaces it.
    pub fn on_request(&mut self, peer: SocketAddr, request: &TftpRequest) -> Packet {
        if let Some(old) = self.transfers.remove(&peer) {
            tracing::warn!(
                "New {} from {} replaces unfinished transfer of '{}'",
                request.kind.opcode(),
                peer,
                old.filename
            );
        }

        let mode = match request.transfer_mode() {
            Ok(mode) => mode,
            Err(e) => {
                tracing::info!("Rejecting {} from {}: {}", request.kind.opcode(), peer, e);
                return Packet::Error(TftpError::new(TftpErrorCode::IllegalOperation, e));
            }
        };

        match request.kind {
            RequestKind::Read => self.on_read_request(peer, &request.filename, mode),
            RequestKind::Write => self.on_write_request(peer, &request.filename, mode),
        }
    }

    /// Start receiving `filename` from `peer`, unless it exists or is already being written
    pub fn on_write_request(&mut self, peer: SocketAddr, filename: &str, mode: TransferMode) -> Packet {
        let exists = match self.store.contains(filename) {
            Ok(exists) => exists,
            Err(e) => return lookup_failed(peer, filename, e),
        };
        let in_flight = self
            .transfers
            .values()
            .any(|t| t.direction == Direction::Receive && t.filename == filename);

        if exists || in_flight {
            tracing::info!("WRQ for '{}' from {}: file already exists", filename, peer);
            return Packet::error(TftpErrorCode::FileAlreadyExists);
        }

        tracing::info!("Receiving '{}' from {} ({} mode)", filename, peer, mode);

        let reply = Packet::ack(0);
        let transfer = Transfer::new(peer, Direction::Receive, filename.to_string(), mode, reply.clone());
        self.transfers.insert(peer, transfer);
        reply
    }

    /// Start sending `filename` to `peer`
    pub fn on_read_request(&mut self, peer: SocketAddr, filename: &str, mode: TransferMode) -> Packet {
        let data = match self.store.get(filename) {
            Ok(Some(data)) => mode.encode_file(data),
            Ok(None) => {
                tracing::info!("RRQ for '{}' from {}: file not found", filename, peer);
                return Packet::error(TftpErrorCode::FileNotFound);
            }
            Err(e) => return lookup_failed(peer, filename, e),
        };

        tracing::info!(
            "Sending '{}' to {} ({} bytes, {} mode)",
            filename,
            peer,
            data.len(),
            mode
        );

        let end = data.len().min(MAX_DATA_SIZE);
        let reply = Packet::data(1, &data[..end]);
        let mut transfer = Transfer::new(peer, Direction::Send, filename.to_string(), mode, reply.clone());
        transfer.block_num = 1;
        transfer.sequence = 1;
        transfer.buffer = data;
        self.transfers.insert(peer, transfer);
        reply
    }

    /// Handle a DATA block written by a peer
    ///
    /// The block must be the successor of the last acknowledged one. A repeat of
    /// the last acknowledged block is acknowledged again without touching the
    /// buffer. Anything else tears the transfer down.
    pub fn on_data(&mut self, peer: SocketAddr, data: TftpData) -> Result<Option<Packet>, TransferError> {
        let unknown = TransferError::UnknownTransfer { peer, block: data.block };

        let Some(transfer) = self
            .transfers
            .get_mut(&peer)
            .filter(|t| t.direction == Direction::Receive)
        else {
            return Err(unknown);
        };

        if transfer.sequence > 0 && data.block == transfer.block_num {
            tracing::debug!("Duplicate DATA #{} from {}, acknowledging again", data.block, peer);
            transfer.last_activity = Instant::now();
            return Ok(Some(Packet::ack(data.block)));
        }

        if data.block != transfer.block_num.wrapping_add(1) {
            tracing::warn!(
                "DATA #{} from {} while expecting #{}, dropping transfer of '{}'",
                data.block,
                peer,
                transfer.block_num.wrapping_add(1),
                transfer.filename
            );
            self.transfers.remove(&peer);
            return Err(unknown);
        }

        if data.data.len() > MAX_DATA_SIZE {
            tracing::warn!("Oversized DATA #{} ({} bytes) from {}", data.block, data.data.len(), peer);
            self.transfers.remove(&peer);
            return Ok(Some(Packet::error(TftpErrorCode::IllegalOperation)));
        }

        let last = data.is_last_block();
        let reply = Packet::ack(data.block);
        transfer.buffer.extend_from_slice(&data.data);
        transfer.block_num = data.block;
        transfer.sequence += 1;
        transfer.progress(reply.clone());

        if !last {
            return Ok(Some(reply));
        }

        let Some(transfer) = self.transfers.remove(&peer) else {
            return Err(unknown);
        };
        let size = transfer.buffer.len();
        match self.store.put(&transfer.filename, transfer.mode.decode_file(transfer.buffer)) {
            Ok(()) => {
                tracing::info!("Finished receiving '{}' from {} ({} bytes)", transfer.filename, peer, size);
                Ok(Some(reply))
            }
            Err(e) => {
                tracing::warn!("Failed to store '{}' from {}: {}", transfer.filename, peer, e);
                Ok(Some(Packet::error(TftpErrorCode::DiskFull)))
            }
        }
    }

    /// Handle an ACK for a block the server sent
    ///
    /// ACKs that do not match the block in flight are reported as
    /// [`TransferError::UnknownTransfer`] and leave the transfer untouched, so a
    /// duplicate ACK cannot trigger a second copy of the next block.
    pub fn on_ack(&mut self, peer: SocketAddr, ack: TftpAck) -> Result<Option<Packet>, TransferError> {
        let Some(transfer) = self
            .transfers
            .get_mut(&peer)
            .filter(|t| t.direction == Direction::Send && t.block_num == ack.block)
        else {
            return Err(TransferError::UnknownTransfer { peer, block: ack.block });
        };

        let start = transfer.sequence.saturating_mul(MAX_DATA_SIZE);
        if start > transfer.buffer.len() {
            // The acknowledged block was short, so it was the last one
            tracing::info!(
                "Finished sending '{}' to {} ({} blocks)",
                transfer.filename,
                peer,
                transfer.sequence
            );
            self.transfers.remove(&peer);
            return Ok(None);
        }

        let end = transfer.buffer.len().min(start + MAX_DATA_SIZE);
        transfer.sequence += 1;
        transfer.block_num = transfer.block_num.wrapping_add(1);
        let reply = Packet::data(transfer.block_num, &transfer.buffer[start..end]);
        transfer.progress(reply.clone());

        Ok(Some(reply))
    }

    /// Handle an ERROR sent by a peer
    ///
    /// Errors are never answered. The transfer, if any, is left for the sweeper.
    pub fn on_error(&mut self, peer: SocketAddr, error: &TftpError) {
        match self.transfers.get(&peer) {
            Some(transfer) => tracing::warn!(
                "Received error from {} during transfer of '{}': {}",
                peer,
                transfer.filename,
                error
            ),
            None => tracing::info!("Received error from {}: {}", peer, error),
        }
    }

    /// Mark `packet` as delivered to `peer`
    ///
    /// Only counts when `packet` is the transfer's last sent packet; replies
    /// that are not part of the transfer leave it untouched.
    pub fn record_sent(&mut self, peer: &SocketAddr, packet: &Packet) {
        if let Some(transfer) = self.transfers.get_mut(peer)
            && transfer.last_sent == *packet
        {
            transfer.pending_retransmit = false;
            transfer.last_activity = Instant::now();
        }
    }

    /// Mark `packet` to `peer` as failed
    ///
    /// Returns the packet to retry when it is the last sent packet of a
    /// registered transfer, `None` otherwise.
    pub fn record_send_failure(&mut self, peer: &SocketAddr, packet: &Packet) -> Option<Packet> {
        let transfer = self
            .transfers
            .get_mut(peer)
            .filter(|t| t.last_sent == *packet)?;
        transfer.pending_retransmit = true;
        Some(transfer.last_sent.clone())
    }

    /// The packet still waiting for a successful retransmission, if any
    pub fn pending_packet(&self, peer: &SocketAddr) -> Option<Packet> {
        self.transfers
            .get(peer)
            .filter(|t| t.pending_retransmit)
            .map(|t| t.last_sent.clone())
    }

    /// Drop a transfer and discard its state
    pub fn abandon(&mut self, peer: &SocketAddr) -> Option<Transfer> {
        self.transfers.remove(peer)
    }

    /// Find transfers that have been silent for `timeout`
    ///
    /// Each one gets its last packet queued for a resend, up to `max_retries`
    /// times, after which it is removed. Transfers with a pending retransmit
    /// are skipped; their retry task decides their fate.
    pub fn expire(&mut self, now: Instant, timeout: Duration, max_retries: usize) -> Expired {
        let mut expired = Expired::default();

        let silent: Vec<SocketAddr> = self
            .transfers
            .values()
            .filter(|t| !t.pending_retransmit && now.saturating_duration_since(t.last_activity) >= timeout)
            .map(|t| t.peer)
            .collect();

        for peer in silent {
            let Some(transfer) = self.transfers.get_mut(&peer) else {
                continue;
            };

            if transfer.retries >= max_retries {
                if let Some(transfer) = self.transfers.remove(&peer) {
                    expired.abandoned.push(transfer);
                }
                continue;
            }

            transfer.retries += 1;
            transfer.last_activity = now;
            expired.resend.push((peer, transfer.last_sent.clone()));
        }

        expired
    }
}

fn lookup_failed(peer: SocketAddr, filename: &str, error: StoreError) -> Packet {
    tracing::warn!("Store lookup of '{}' for {} failed: {}", filename, peer, error);
    match error {
        StoreError::InvalidName(_) => Packet::error(TftpErrorCode::AccessViolation),
        StoreError::Io(_) => Packet::error(TftpErrorCode::NotDefined),
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;
    use crate::store::MemoryStore;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn other_peer() -> SocketAddr {
        "127.0.0.1:40001".parse().unwrap()
    }

    fn rrq(name: &str) -> TftpRequest {
        TftpRequest::read_request(name, TransferMode::Octet)
    }

    fn wrq(name: &str) -> TftpRequest {
        TftpRequest::write_request(name, TransferMode::Octet)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    /// Store whose writes always fail
    struct FullStore;

    impl Store for FullStore {
        fn get(&self, _name: &str) -> Result<Option<Vec<u8>>, StoreError> {
            Ok(None)
        }

        fn put(&mut self, _name: &str, _data: Vec<u8>) -> Result<(), StoreError> {
            Err(io::Error::other("no space left").into())
        }
    }

    #[test]
    fn test_transfer_config_default() {
        let config = TransferConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(TIMEOUT_SECS));
        assert_eq!(config.max_retries, MAX_RETRIES);
        assert!(config.send_retry_delay < config.timeout);
    }

    #[test]
    fn test_write_block_under_512_bytes_ends_transfer_at_block_1() {
        let mut registry = TransferRegistry::new(MemoryStore::new());
        let content = pattern(300);

        assert_eq!(registry.on_request(peer(), &wrq("f")), Packet::ack(0));
        assert_eq!(registry.get(&peer()).unwrap().block_num, 0);

        let reply = registry.on_data(peer(), TftpData::new(1, content.clone())).unwrap();
        assert_eq!(reply, Some(Packet::ack(1)));
        assert!(registry.is_empty());
        assert_eq!(registry.store().get("f").unwrap(), Some(content));

        // The transfer is gone, so a further block has nowhere to go
        let result = registry.on_data(peer(), TftpData::new(2, vec![7u8; 50]));
        assert_eq!(result, Err(TransferError::UnknownTransfer { peer: peer(), block: 2 }));
    }

    #[test]
    fn test_write_multi_block() {
        let mut registry = TransferRegistry::new(MemoryStore::new());
        let first = pattern(512);
        let second = vec![7u8; 50];

        assert_eq!(registry.on_request(peer(), &wrq("f")), Packet::ack(0));

        let reply = registry.on_data(peer(), TftpData::new(1, first.clone())).unwrap();
        assert_eq!(reply, Some(Packet::ack(1)));
        assert_eq!(registry.get(&peer()).unwrap().block_num, 1);
        assert_eq!(registry.store().get("f").unwrap(), None);

        let reply = registry.on_data(peer(), TftpData::new(2, second.clone())).unwrap();
        assert_eq!(reply, Some(Packet::ack(2)));
        assert!(registry.get(&peer()).is_none());

        let mut expected = first;
        expected.extend_from_slice(&second);
        assert_eq!(registry.store().get("f").unwrap(), Some(expected));
    }

    #[test]
    fn test_write_empty_final_block() {
        let mut registry = TransferRegistry::new(MemoryStore::new());
        registry.on_request(peer(), &wrq("f"));
        registry.on_data(peer(), TftpData::new(1, vec![1; 512])).unwrap();

        let reply = registry.on_data(peer(), TftpData::new(2, Vec::new())).unwrap();
        assert_eq!(reply, Some(Packet::ack(2)));
        assert_eq!(registry.store().get("f").unwrap(), Some(vec![1; 512]));
    }

    #[test]
    fn test_write_collision() {
        let store = MemoryStore::new().with_file("f", b"old".to_vec());
        let mut registry = TransferRegistry::new(store);

        let reply = registry.on_request(peer(), &wrq("f"));
        assert_eq!(reply, Packet::error(TftpErrorCode::FileAlreadyExists));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_write_collision_with_transfer_in_flight() {
        let mut registry = TransferRegistry::new(MemoryStore::new());
        assert_eq!(registry.on_request(peer(), &wrq("f")), Packet::ack(0));

        let reply = registry.on_request(other_peer(), &wrq("f"));
        assert_eq!(reply, Packet::error(TftpErrorCode::FileAlreadyExists));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_write_duplicate_data_is_reacknowledged() {
        let mut registry = TransferRegistry::new(MemoryStore::new());
        registry.on_request(peer(), &wrq("f"));
        registry.on_data(peer(), TftpData::new(1, vec![1; 512])).unwrap();

        let reply = registry.on_data(peer(), TftpData::new(1, vec![1; 512])).unwrap();
        assert_eq!(reply, Some(Packet::ack(1)));
        assert_eq!(registry.get(&peer()).unwrap().buffer.len(), 512);

        registry.on_data(peer(), TftpData::new(2, vec![2; 10])).unwrap();
        assert_eq!(registry.store().get("f").unwrap().unwrap().len(), 522);
    }

    #[test]
    fn test_write_out_of_order_data_tears_down() {
        let mut registry = TransferRegistry::new(MemoryStore::new());
        registry.on_request(peer(), &wrq("f"));

        let result = registry.on_data(peer(), TftpData::new(3, vec![1; 512]));
        assert_eq!(result, Err(TransferError::UnknownTransfer { peer: peer(), block: 3 }));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_write_oversized_block() {
        let mut registry = TransferRegistry::new(MemoryStore::new());
        registry.on_request(peer(), &wrq("f"));

        let reply = registry.on_data(peer(), TftpData::new(1, vec![0; 600])).unwrap();
        assert_eq!(reply, Some(Packet::error(TftpErrorCode::IllegalOperation)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_write_store_failure_reports_disk_full() {
        let mut registry = TransferRegistry::new(FullStore);
        registry.on_request(peer(), &wrq("f"));

        let reply = registry.on_data(peer(), TftpData::new(1, b"tail".to_vec())).unwrap();
        assert_eq!(reply, Some(Packet::error(TftpErrorCode::DiskFull)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_write_netascii_is_converted() {
        let mut registry = TransferRegistry::new(MemoryStore::new());
        let request = TftpRequest::write_request("notes.txt", TransferMode::NetAscii);
        registry.on_request(peer(), &request);

        registry.on_data(peer(), TftpData::new(1, b"a\r\nb\r\0c".to_vec())).unwrap();
        assert_eq!(registry.store().get("notes.txt").unwrap(), Some(b"a\nb\rc".to_vec()));
    }

    #[test]
    fn test_read_sequence() {
        let content = pattern(600);
        let store = MemoryStore::new().with_file("g", content.clone());
        let mut registry = TransferRegistry::new(store);

        let reply = registry.on_request(peer(), &rrq("g"));
        assert_eq!(reply, Packet::data(1, &content[..512]));
        assert_eq!(registry.get(&peer()).unwrap().direction, Direction::Send);

        let reply = registry.on_ack(peer(), TftpAck::new(1)).unwrap();
        assert_eq!(reply, Some(Packet::data(2, &content[512..])));

        let reply = registry.on_ack(peer(), TftpAck::new(2)).unwrap();
        assert_eq!(reply, None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_read_exact_block_multiple_ends_with_empty_block() {
        let store = MemoryStore::new().with_file("g", vec![9; 512]);
        let mut registry = TransferRegistry::new(store);

        assert_eq!(registry.on_request(peer(), &rrq("g")), Packet::data(1, vec![9; 512]));
        assert_eq!(registry.on_ack(peer(), TftpAck::new(1)).unwrap(), Some(Packet::data(2, Vec::new())));
        assert_eq!(registry.on_ack(peer(), TftpAck::new(2)).unwrap(), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_read_empty_file() {
        let store = MemoryStore::new().with_file("empty", Vec::new());
        let mut registry = TransferRegistry::new(store);

        assert_eq!(registry.on_request(peer(), &rrq("empty")), Packet::data(1, Vec::new()));
        assert_eq!(registry.on_ack(peer(), TftpAck::new(1)).unwrap(), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_read_miss() {
        let mut registry = TransferRegistry::new(MemoryStore::new());
        let reply = registry.on_request(peer(), &rrq("missing"));
        assert_eq!(reply, Packet::error(TftpErrorCode::FileNotFound));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_read_unsupported_mode() {
        let store = MemoryStore::new().with_file("g", vec![1]);
        let mut registry = TransferRegistry::new(store);
        let request = TftpRequest {
            kind: RequestKind::Read,
            filename: "g".into(),
            mode: "mail".into(),
        };

        match registry.on_request(peer(), &request) {
            Packet::Error(err) => assert_eq!(err.code, TftpErrorCode::IllegalOperation),
            other => panic!("unexpected reply {other:?}"),
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stale_ack_after_completion() {
        let store = MemoryStore::new().with_file("g", vec![1; 100]);
        let mut registry = TransferRegistry::new(store);

        registry.on_request(peer(), &rrq("g"));
        assert_eq!(registry.on_ack(peer(), TftpAck::new(1)).unwrap(), None);

        let result = registry.on_ack(peer(), TftpAck::new(1));
        assert_eq!(result, Err(TransferError::UnknownTransfer { peer: peer(), block: 1 }));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_ack_does_not_advance() {
        let store = MemoryStore::new().with_file("g", pattern(2000));
        let mut registry = TransferRegistry::new(store);

        registry.on_request(peer(), &rrq("g"));
        registry.on_ack(peer(), TftpAck::new(1)).unwrap();

        assert!(registry.on_ack(peer(), TftpAck::new(1)).is_err());
        assert_eq!(registry.get(&peer()).unwrap().block_num, 2);
    }

    #[test]
    fn test_ack_from_other_peer_is_unknown() {
        let store = MemoryStore::new().with_file("g", pattern(2000));
        let mut registry = TransferRegistry::new(store);
        registry.on_request(peer(), &rrq("g"));

        assert!(registry.on_ack(other_peer(), TftpAck::new(1)).is_err());
        assert!(registry.on_data(peer(), TftpData::new(2, vec![0; 3])).is_err());
    }

    #[test]
    fn test_read_wraps_block_numbers() {
        let blocks = 65536 + 2;
        let content = pattern(blocks * MAX_DATA_SIZE - 10);
        let store = MemoryStore::new().with_file("big", content.clone());
        let mut registry = TransferRegistry::new(store);

        registry.on_request(peer(), &rrq("big"));
        let mut block: u16 = 1;
        let mut received = content[..MAX_DATA_SIZE].to_vec();

        while let Some(reply) = registry.on_ack(peer(), TftpAck::new(block)).unwrap() {
            let Packet::Data(data) = reply else {
                panic!("expected DATA");
            };
            assert_eq!(data.block, block.wrapping_add(1));
            received.extend_from_slice(&data.data);
            block = data.block;
        }

        assert_eq!(block, 2);
        assert_eq!(received, content);
    }

    #[test]
    fn test_new_request_replaces_transfer() {
        let store = MemoryStore::new().with_file("g", pattern(2000));
        let mut registry = TransferRegistry::new(store);

        registry.on_request(peer(), &rrq("g"));
        registry.on_ack(peer(), TftpAck::new(1)).unwrap();

        assert_eq!(registry.on_request(peer(), &wrq("h")), Packet::ack(0));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&peer()).unwrap().direction, Direction::Receive);
    }

    #[test]
    fn test_error_from_peer_changes_nothing() {
        let store = MemoryStore::new().with_file("g", pattern(2000));
        let mut registry = TransferRegistry::new(store);
        registry.on_request(peer(), &rrq("g"));

        registry.on_error(peer(), &TftpError::with_default_message(TftpErrorCode::DiskFull));
        assert_eq!(registry.get(&peer()).unwrap().block_num, 1);
    }

    #[test]
    fn test_send_failure_bookkeeping() {
        let store = MemoryStore::new().with_file("g", pattern(700));
        let mut registry = TransferRegistry::new(store);
        let first = registry.on_request(peer(), &rrq("g"));

        assert_eq!(registry.pending_packet(&peer()), None);
        assert_eq!(registry.record_send_failure(&peer(), &first), Some(first.clone()));
        assert_eq!(registry.pending_packet(&peer()), Some(first.clone()));

        registry.record_sent(&peer(), &first);
        assert_eq!(registry.pending_packet(&peer()), None);

        assert_eq!(registry.record_send_failure(&other_peer(), &first), None);
        assert!(registry.abandon(&peer()).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unrelated_reply_does_not_touch_transfer() {
        let store = MemoryStore::new().with_file("g", pattern(700));
        let mut registry = TransferRegistry::new(store);
        let first = registry.on_request(peer(), &rrq("g"));
        let error = Packet::error(TftpErrorCode::UnknownUser);

        assert_eq!(registry.record_send_failure(&peer(), &error), None);
        assert_eq!(registry.pending_packet(&peer()), None);

        registry.record_send_failure(&peer(), &first);
        registry.record_sent(&peer(), &error);
        assert_eq!(registry.pending_packet(&peer()), Some(first));
    }

    #[test]
    fn test_expire_resends_then_abandons() {
        let store = MemoryStore::new().with_file("g", pattern(700));
        let mut registry = TransferRegistry::new(store);
        let first = registry.on_request(peer(), &rrq("g"));
        let timeout = Duration::from_secs(3);

        let expired = registry.expire(Instant::now(), timeout, 2);
        assert!(expired.resend.is_empty());
        assert!(expired.abandoned.is_empty());

        let mut now = Instant::now();
        for _ in 0..2 {
            now += timeout;
            let expired = registry.expire(now, timeout, 2);
            assert_eq!(expired.resend, vec![(peer(), first.clone())]);
        }

        now += timeout;
        let expired = registry.expire(now, timeout, 2);
        assert!(expired.resend.is_empty());
        assert_eq!(expired.abandoned.len(), 1);
        assert_eq!(expired.abandoned[0].filename, "g");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_expire_skips_pending_retransmit() {
        let mut registry = TransferRegistry::new(MemoryStore::new());
        let ack = registry.on_request(peer(), &wrq("f"));
        registry.record_send_failure(&peer(), &ack);

        let later = Instant::now() + Duration::from_secs(60);
        let expired = registry.expire(later, Duration::from_secs(3), 0);
        assert!(expired.resend.is_empty());
        assert!(expired.abandoned.is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_progress_resets_retries() {
        let store = MemoryStore::new().with_file("g", pattern(700));
        let mut registry = TransferRegistry::new(store);
        registry.on_request(peer(), &rrq("g"));

        let timeout = Duration::from_secs(3);
        registry.expire(Instant::now() + timeout, timeout, 8);
        assert_eq!(registry.get(&peer()).unwrap().retries, 1);

        registry.on_ack(peer(), TftpAck::new(1)).unwrap();
        assert_eq!(registry.get(&peer()).unwrap().retries, 0);
    }
}
