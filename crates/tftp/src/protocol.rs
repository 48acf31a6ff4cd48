//! TFTP Wire Codec
//!
//! This module contains the RFC 1350 packet types and their binary encoding.
//!
//! # Packet Layout
//!
//! All integers are big-endian. Text fields are NUL-terminated and may not
//! contain a NUL byte themselves.
//!
//! ```text
//! RRQ/WRQ | 01/02 | Filename | 0 | Mode | 0 |
//! DATA    | 03    | Block#   | Data (0..512 bytes) |
//! ACK     | 04    | Block#   |
//! ERROR   | 05    | ErrorCode | ErrMsg | 0 |
//! ```
//!
//! Encoding and decoding are exact inverses: `Packet::decode(&p.encode()?)`
//! yields `p` again for every packet that encodes successfully.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Largest datagram the server accepts. Anything bigger is treated as garbage.
pub const MAX_PACKET_SIZE: usize = 2048;

/// Maximum payload carried by a single DATA packet.
pub const MAX_DATA_SIZE: usize = 512;

/// Errors raised while decoding or encoding a packet
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// The buffer ended before a fixed-size field or a NUL terminator
    #[error("packet truncated")]
    Truncated,

    /// The opcode is not one of the five RFC 1350 packet kinds
    #[error("unknown operation {0}")]
    UnknownOperation(u16),

    /// A text field would need a NUL byte inside its own value
    #[error("{field} contains a NUL byte")]
    EmbeddedNul { field: &'static str },

    /// A text field is not valid UTF-8
    #[error("{field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },
}

/// TFTP Protocol Opcodes
///
/// These opcodes identify the type of TFTP packet being sent or received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TftpOpcode {
    /// Read Request (RRQ) - Opcode 1
    ///
    /// Client requests to read a file from the server.
    ReadRequest = 1,

    /// Write Request (WRQ) - Opcode 2
    ///
    /// Client requests to write a file to the server.
    WriteRequest = 2,

    /// Data Packet (DATA) - Opcode 3
    ///
    /// Carries one block of up to 512 bytes. A shorter block ends the transfer.
    Data = 3,

    /// Acknowledgment (ACK) - Opcode 4
    ///
    /// Acknowledges a data block. ACK 0 answers a write request.
    Acknowledgment = 4,

    /// Error Packet (ERROR) - Opcode 5
    ///
    /// Reports an error condition and terminates the transfer.
    Error = 5,
}

impl TftpOpcode {
    /// Convert a u16 value to a TftpOpcode
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpOpcode;
    ///
    /// assert_eq!(TftpOpcode::from_u16(1), Some(TftpOpcode::ReadRequest));
    /// assert_eq!(TftpOpcode::from_u16(6), None);
    /// ```
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::ReadRequest),
            2 => Some(Self::WriteRequest),
            3 => Some(Self::Data),
            4 => Some(Self::Acknowledgment),
            5 => Some(Self::Error),
            _ => None,
        }
    }

    /// Convert the opcode to its u16 representation
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Get the human-readable name of the opcode
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpOpcode;
    ///
    /// assert_eq!(TftpOpcode::WriteRequest.name(), "WRQ");
    /// assert_eq!(TftpOpcode::Acknowledgment.name(), "ACK");
    /// ```
    pub fn name(self) -> &'static str {
        match self {
            Self::ReadRequest => "RRQ",
            Self::WriteRequest => "WRQ",
            Self::Data => "DATA",
            Self::Acknowledgment => "ACK",
            Self::Error => "ERROR",
        }
    }
}

impl From<TftpOpcode> for u16 {
    fn from(opcode: TftpOpcode) -> Self {
        opcode.as_u16()
    }
}

impl fmt::Display for TftpOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// TFTP Error Codes
///
/// Codes outside 1..=7 are kept verbatim in [`TftpErrorCode::Other`] so that a
/// received error packet re-encodes to the same bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TftpErrorCode {
    /// Error code 1: Not defined, see the message
    NotDefined,

    /// Error code 2: File not found
    FileNotFound,

    /// Error code 3: Access violation
    ///
    /// Also used when a filename tries to escape the store root.
    AccessViolation,

    /// Error code 4: Disk full or allocation exceeded
    DiskFull,

    /// Error code 5: Illegal TFTP operation
    IllegalOperation,

    /// Error code 6: File already exists
    FileAlreadyExists,

    /// Error code 7: Unknown user or transfer ID
    ///
    /// Sent when a data packet does not belong to any transfer in progress.
    UnknownUser,

    /// Any other code received from a peer
    Other(u16),
}

impl TftpErrorCode {
    /// Convert a u16 value to a TftpErrorCode
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpErrorCode;
    ///
    /// assert_eq!(TftpErrorCode::from_u16(2), TftpErrorCode::FileNotFound);
    /// assert_eq!(TftpErrorCode::from_u16(99), TftpErrorCode::Other(99));
    /// ```
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => Self::NotDefined,
            2 => Self::FileNotFound,
            3 => Self::AccessViolation,
            4 => Self::DiskFull,
            5 => Self::IllegalOperation,
            6 => Self::FileAlreadyExists,
            7 => Self::UnknownUser,
            other => Self::Other(other),
        }
    }

    /// Convert the error code to its u16 representation
    pub fn as_u16(self) -> u16 {
        match self {
            Self::NotDefined => 1,
            Self::FileNotFound => 2,
            Self::AccessViolation => 3,
            Self::DiskFull => 4,
            Self::IllegalOperation => 5,
            Self::FileAlreadyExists => 6,
            Self::UnknownUser => 7,
            Self::Other(code) => code,
        }
    }

    /// Get the default error message for this error code
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpErrorCode;
    ///
    /// assert_eq!(TftpErrorCode::FileNotFound.default_message(), "File not found");
    /// assert_eq!(TftpErrorCode::Other(42).default_message(), "Unknown");
    /// ```
    pub fn default_message(self) -> &'static str {
        match self {
            Self::NotDefined => "Not defined",
            Self::FileNotFound => "File not found",
            Self::AccessViolation => "Access violation",
            Self::DiskFull => "Disk full or allocation exceeded",
            Self::IllegalOperation => "Illegal TFTP operation",
            Self::FileAlreadyExists => "File already exists",
            Self::UnknownUser => "Unknown user",
            Self::Other(_) => "Unknown",
        }
    }
}

impl From<TftpErrorCode> for u16 {
    fn from(error_code: TftpErrorCode) -> Self {
        error_code.as_u16()
    }
}

impl fmt::Display for TftpErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.default_message(), self.as_u16())
    }
}

/// TFTP Transfer Modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferMode {
    /// Binary mode: bytes are transferred as-is.
    ///
    /// Mode string: "octet"
    Octet,

    /// Text mode: line endings travel as CR-LF, a bare CR as CR-NUL.
    ///
    /// Mode string: "netascii"
    NetAscii,
}

impl TransferMode {
    /// Parse a transfer mode from a string
    ///
    /// The comparison is case-insensitive.
    ///
    /// # Examples
    /// ```
    /// use tftp::TransferMode;
    ///
    /// assert_eq!("octet".parse::<TransferMode>(), Ok(TransferMode::Octet));
    /// assert_eq!("NETASCII".parse::<TransferMode>(), Ok(TransferMode::NetAscii));
    /// assert!("mail".parse::<TransferMode>().is_err());
    /// ```
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "octet" => Some(Self::Octet),
            "netascii" => Some(Self::NetAscii),
            _ => None,
        }
    }

    /// Get the string representation of the transfer mode
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Octet => "octet",
            Self::NetAscii => "netascii",
        }
    }

    /// Bytes to put on the wire for a file read from the store
    pub fn encode_file(self, data: Vec<u8>) -> Vec<u8> {
        match self {
            Self::Octet => data,
            Self::NetAscii => convert_to_netascii(&data),
        }
    }

    /// Bytes to put in the store for data received from the wire
    pub fn decode_file(self, data: Vec<u8>) -> Vec<u8> {
        match self {
            Self::Octet => data,
            Self::NetAscii => convert_from_netascii(&data),
        }
    }
}

impl FromStr for TransferMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_opt(s).ok_or_else(|| format!("Unsupported transfer mode: {}", s))
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Direction requested by an RRQ or WRQ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// The peer reads a file from us
    Read,
    /// The peer writes a file to us
    Write,
}

impl RequestKind {
    /// Opcode of the request packet for this direction
    ///
    /// # Examples
    /// ```
    /// use tftp::{RequestKind, TftpOpcode};
    ///
    /// assert_eq!(RequestKind::Read.opcode(), TftpOpcode::ReadRequest);
    /// assert_eq!(RequestKind::Write.opcode(), TftpOpcode::WriteRequest);
    /// ```
    pub fn opcode(self) -> TftpOpcode {
        match self {
            Self::Read => TftpOpcode::ReadRequest,
            Self::Write => TftpOpcode::WriteRequest,
        }
    }
}

/// TFTP Request (RRQ/WRQ) representation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TftpRequest {
    /// Read or write
    pub kind: RequestKind,
    /// Requested filename
    pub filename: String,
    /// Transfer mode exactly as sent by the peer
    pub mode: String,
}

impl TftpRequest {
    /// Create a new read request
    ///
    /// # Examples
    /// ```
    /// use tftp::{RequestKind, TftpRequest, TransferMode};
    ///
    /// let request = TftpRequest::read_request("boot.img", TransferMode::Octet);
    /// assert_eq!(request.kind, RequestKind::Read);
    /// assert_eq!(request.mode, "octet");
    /// ```
    pub fn read_request(filename: impl Into<String>, mode: TransferMode) -> Self {
        Self {
            kind: RequestKind::Read,
            filename: filename.into(),
            mode: mode.as_str().to_string(),
        }
    }

    /// Create a new write request
    pub fn write_request(filename: impl Into<String>, mode: TransferMode) -> Self {
        Self {
            kind: RequestKind::Write,
            filename: filename.into(),
            mode: mode.as_str().to_string(),
        }
    }

    /// Parse the mode string into a supported transfer mode
    pub fn transfer_mode(&self) -> Result<TransferMode, String> {
        self.mode.parse()
    }
}

/// TFTP Data packet representation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TftpData {
    /// Block number (1-indexed, wraps at 65535)
    pub block: u16,
    /// Data payload
    pub data: Vec<u8>,
}

impl TftpData {
    /// Create a new data packet
    pub fn new(block: u16, data: impl Into<Vec<u8>>) -> Self {
        Self {
            block,
            data: data.into(),
        }
    }

    /// Check if this is the last block of a transfer
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpData;
    ///
    /// assert!(TftpData::new(1, vec![0; 100]).is_last_block());
    /// assert!(TftpData::new(1, Vec::new()).is_last_block());
    /// assert!(!TftpData::new(1, vec![0; 512]).is_last_block());
    /// ```
    pub fn is_last_block(&self) -> bool {
        self.data.len() < MAX_DATA_SIZE
    }
}

/// TFTP ACK packet representation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TftpAck {
    /// Block number being acknowledged
    pub block: u16,
}

impl TftpAck {
    /// Create an acknowledgment for `block`
    pub fn new(block: u16) -> Self {
        Self { block }
    }
}

/// TFTP Error packet representation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TftpError {
    /// Error code
    pub code: TftpErrorCode,
    /// Human-readable error message
    pub message: String,
}

impl TftpError {
    /// Create a new error packet with a custom message
    pub fn new(code: TftpErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Create a new error packet with the default message for the error code
    ///
    /// # Examples
    /// ```
    /// use tftp::{TftpError, TftpErrorCode};
    ///
    /// let error = TftpError::with_default_message(TftpErrorCode::AccessViolation);
    /// assert_eq!(error.message, "Access violation");
    /// ```
    pub fn with_default_message(code: TftpErrorCode) -> Self {
        Self::new(code, code.default_message())
    }
}

impl fmt::Display for TftpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Any of the five TFTP packets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Request(TftpRequest),
    Data(TftpData),
    Ack(TftpAck),
    Error(TftpError),
}

impl Packet {
    /// DATA packet for `block`
    ///
    /// # Examples
    /// ```
    /// use tftp::Packet;
    ///
    /// let packet = Packet::data(1, b"hello".to_vec());
    /// assert_eq!(packet.encode().unwrap(), b"\x00\x03\x00\x01hello");
    /// ```
    pub fn data(block: u16, data: impl Into<Vec<u8>>) -> Self {
        Self::Data(TftpData::new(block, data))
    }

    /// ACK packet for `block`
    ///
    /// # Examples
    /// ```
    /// use tftp::Packet;
    ///
    /// assert_eq!(Packet::ack(7).encode().unwrap(), b"\x00\x04\x00\x07");
    /// ```
    pub fn ack(block: u16) -> Self {
        Self::Ack(TftpAck::new(block))
    }

    /// Error packet carrying the default message for `code`
    pub fn error(code: TftpErrorCode) -> Self {
        Self::Error(TftpError::with_default_message(code))
    }

    /// Opcode this packet is sent with
    ///
    /// # Examples
    /// ```
    /// use tftp::{Packet, TftpOpcode};
    ///
    /// assert_eq!(Packet::ack(0).opcode(), TftpOpcode::Acknowledgment);
    /// ```
    pub fn opcode(&self) -> TftpOpcode {
        match self {
            Self::Request(req) => req.kind.opcode(),
            Self::Data(_) => TftpOpcode::Data,
            Self::Ack(_) => TftpOpcode::Acknowledgment,
            Self::Error(_) => TftpOpcode::Error,
        }
    }

    /// Decode a packet from its wire representation
    ///
    /// Bytes following the mode string of a request (RFC 2347 options) are
    /// ignored, as are bytes following the block number of an ACK.
    ///
    /// # Examples
    /// ```
    /// use tftp::{Packet, TftpAck, WireError};
    ///
    /// assert_eq!(Packet::decode(b"\x00\x04\x00\x07"), Ok(Packet::Ack(TftpAck::new(7))));
    /// assert_eq!(Packet::decode(b"\x00\x09"), Err(WireError::UnknownOperation(9)));
    /// ```
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut reader = Reader { buf };
        let opcode = reader.u16()?;
        let opcode = TftpOpcode::from_u16(opcode).ok_or(WireError::UnknownOperation(opcode))?;

        let packet = match opcode {
            TftpOpcode::ReadRequest | TftpOpcode::WriteRequest => {
                let kind = if opcode == TftpOpcode::ReadRequest {
                    RequestKind::Read
                } else {
                    RequestKind::Write
                };
                let filename = reader.string("filename")?;
                let mode = reader.string("mode")?;
                Self::Request(TftpRequest { kind, filename, mode })
            }
            TftpOpcode::Data => {
                let block = reader.u16()?;
                Self::Data(TftpData::new(block, reader.buf))
            }
            TftpOpcode::Acknowledgment => Self::Ack(TftpAck::new(reader.u16()?)),
            TftpOpcode::Error => {
                let code = TftpErrorCode::from_u16(reader.u16()?);
                let message = reader.string("message")?;
                Self::Error(TftpError { code, message })
            }
        };

        Ok(packet)
    }

    /// Encode the packet into a freshly allocated buffer
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut v = Vec::with_capacity(4 + MAX_DATA_SIZE);
        v.extend_from_slice(&self.opcode().as_u16().to_be_bytes());

        match self {
            Self::Request(req) => {
                put_string(&mut v, "filename", &req.filename)?;
                put_string(&mut v, "mode", &req.mode)?;
            }
            Self::Data(data) => {
                v.extend_from_slice(&data.block.to_be_bytes());
                v.extend_from_slice(&data.data);
            }
            Self::Ack(ack) => v.extend_from_slice(&ack.block.to_be_bytes()),
            Self::Error(err) => {
                v.extend_from_slice(&err.code.as_u16().to_be_bytes());
                put_string(&mut v, "message", &err.message)?;
            }
        }

        Ok(v)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request(req) => write!(f, "{} '{}' ({})", req.kind.opcode(), req.filename, req.mode),
            Self::Data(data) => write!(f, "DATA #{} ({} bytes)", data.block, data.data.len()),
            Self::Ack(ack) => write!(f, "ACK #{}", ack.block),
            Self::Error(err) => write!(f, "ERROR {}", err),
        }
    }
}

/// Read the opcode of a packet without decoding the rest of it
///
/// # Examples
/// ```
/// use tftp::{WireError, peek_opcode};
///
/// assert_eq!(peek_opcode(b"\x00\x03\x00\x01"), Ok(3));
/// assert_eq!(peek_opcode(b"\x00"), Err(WireError::Truncated));
/// ```
pub fn peek_opcode(buf: &[u8]) -> Result<u16, WireError> {
    Reader { buf }.u16()
}

/// Find the next null byte in a buffer starting from a given position
pub fn find_zero(buf: &[u8], start: usize) -> Option<usize> {
    buf.get(start..)?.iter().position(|&b| b == 0).map(|pos| start + pos)
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn u16(&mut self) -> Result<u16, WireError> {
        let buf: &'a [u8] = self.buf;
        let (head, rest) = buf.split_first_chunk::<2>().ok_or(WireError::Truncated)?;
        self.buf = rest;
        Ok(u16::from_be_bytes(*head))
    }

    fn string(&mut self, field: &'static str) -> Result<String, WireError> {
        let buf: &'a [u8] = self.buf;
        let end = find_zero(buf, 0).ok_or(WireError::Truncated)?;
        let s = std::str::from_utf8(&buf[..end]).map_err(|_| WireError::InvalidUtf8 { field })?;
        self.buf = &buf[end + 1..];
        Ok(s.to_string())
    }
}

fn put_string(v: &mut Vec<u8>, field: &'static str, s: &str) -> Result<(), WireError> {
    if s.as_bytes().contains(&0) {
        return Err(WireError::EmbeddedNul { field });
    }
    v.extend_from_slice(s.as_bytes());
    v.push(0);
    Ok(())
}

/// Convert file data from binary to netascii format
pub fn convert_to_netascii(data: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(data.len());
    let mut i = 0;

    while i < data.len() {
        match data[i] {
            b'\r' => {
                if data.get(i + 1) == Some(&b'\n') {
                    // CR-LF stays as CR-LF
                    result.extend_from_slice(b"\r\n");
                    i += 2;
                } else {
                    // Standalone CR becomes CR-NUL
                    result.extend_from_slice(b"\r\0");
                    i += 1;
                }
            }
            b'\n' => {
                result.extend_from_slice(b"\r\n");
                i += 1;
            }
            b => {
                result.push(b);
                i += 1;
            }
        }
    }

    result
}

/// Convert file data from netascii to binary format
pub fn convert_from_netascii(data: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(data.len());
    let mut i = 0;

    while i < data.len() {
        match (data[i], data.get(i + 1)) {
            (b'\r', Some(b'\n')) => {
                result.push(b'\n');
                i += 2;
            }
            (b'\r', Some(b'\0')) => {
                result.push(b'\r');
                i += 2;
            }
            (b, _) => {
                result.push(b);
                i += 1;
            }
        }
    }

    result
}
