//! Wire protocol between client ranks and server ranks.
//!
//! Every remote operation starts with a [`CommandHeader`] on the command tag,
//! followed by operation-specific traffic on the data, acknowledgement or
//! exchange tags. All structures are `#[repr(C)]` and moved with zerocopy.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::comm::Rank;
use crate::constants::{STATUS_FAIL, STATUS_SUCCESS};

/// Operation codes
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Write payload into a server segment
    Put = 0x01,
    /// Read from a server segment
    Get = 0x02,
    /// Acquire a named lock on the home rank
    LockAcquire = 0x03,
    /// Release a named lock on the home rank
    LockRelease = 0x05,
    /// Register as a waiter on a notification name
    SetNotify = 0x06,
    /// Deliver a notification code and clear its waiters
    ClearNotify = 0x07,
    /// Admit a peer group on the remote channel
    Accept = 0x10,
    /// A peer leaves the remote channel
    Disconnect = 0x11,
    /// Store a file description on the home rank
    RegisterFile = 0x12,
    /// Allocate space for a file on the home rank
    RequestPages = 0x13,
    /// Fetch a file description from the home rank
    RequestFile = 0x14,
    /// Leave the service loop
    Done = 0xFF,
}

impl TryFrom<i32> for Opcode {
    type Error = ProtocolError;

    fn try_from(v: i32) -> Result<Self, Self::Error> {
        Ok(match v {
            0x01 => Opcode::Put,
            0x02 => Opcode::Get,
            0x03 => Opcode::LockAcquire,
            0x05 => Opcode::LockRelease,
            0x06 => Opcode::SetNotify,
            0x07 => Opcode::ClearNotify,
            0x10 => Opcode::Accept,
            0x11 => Opcode::Disconnect,
            0x12 => Opcode::RegisterFile,
            0x13 => Opcode::RequestPages,
            0x14 => Opcode::RequestFile,
            0xFF => Opcode::Done,
            other => return Err(ProtocolError::UnknownOpcode(other)),
        })
    }
}

/// Protocol errors
///
/// Raised on the receiving side these are fatal: the peer and this rank no
/// longer agree on the shape of the address space.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown opcode {0:#x}")]
    UnknownOpcode(i32),

    #[error("Truncated {what}: expected {expected} bytes, got {actual}")]
    Truncated {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Address range [{address}, {address}+{length}) exceeds segment of {segment} bytes")]
    OutOfRange {
        address: i64,
        length: i64,
        segment: u64,
    },

    #[error("Value {value} does not fit the {field} field")]
    FieldOverflow { field: &'static str, value: u64 },

    #[error("Malformed message: {0}")]
    Malformed(String),
}

/// Fixed-shape command header
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct CommandHeader {
    pub opcode: i32,
    pub source: i32,
    pub address: i32,
    pub length: i32,
}

const _: () = assert!(std::mem::size_of::<CommandHeader>() == 16);

impl CommandHeader {
    pub fn new(opcode: Opcode, source: Rank, address: u64, length: u64) -> Result<Self, ProtocolError> {
        Ok(Self {
            opcode: opcode as i32,
            source: to_i32("source", source as u64)?,
            address: to_i32("address", address)?,
            length: to_i32("length", length)?,
        })
    }

    /// A header without address or length
    pub fn control(opcode: Opcode, source: Rank) -> Result<Self, ProtocolError> {
        Self::new(opcode, source, 0, 0)
    }

    pub fn opcode(&self) -> Result<Opcode, ProtocolError> {
        Opcode::try_from(self.opcode)
    }

    pub fn source_rank(&self) -> Result<Rank, ProtocolError> {
        usize::try_from(self.source)
            .map_err(|_| ProtocolError::Malformed(format!("negative source rank {}", self.source)))
    }

    /// Check that `[address, address+length)` lies inside a segment of `segment` bytes
    pub fn checked_range(&self, segment: u64) -> Result<(usize, usize), ProtocolError> {
        let out_of_range = || ProtocolError::OutOfRange {
            address: self.address as i64,
            length: self.length as i64,
            segment,
        };
        let address = u64::try_from(self.address).map_err(|_| out_of_range())?;
        let length = u64::try_from(self.length).map_err(|_| out_of_range())?;
        if address + length > segment {
            return Err(out_of_range());
        }
        Ok((address as usize, length as usize))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_struct("command header", bytes)
    }
}

/// Layout metadata agreed on by every rank before any traffic flows
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct InfoMsg {
    pub length: u64,
    pub total_length: u64,
    pub block_length: u64,
    pub seed: u64,
    pub dsm_type: i32,
    pub start_server: i32,
    pub end_server: i32,
    pub mixed_entries: u32,
}

const _: () = assert!(std::mem::size_of::<InfoMsg>() == 48);

/// One row of a mixed layout table
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct MixedExtentWire {
    pub length: u64,
    pub rank: u32,
    pub reserved: u32,
}

const _: () = assert!(std::mem::size_of::<MixedExtentWire>() == 16);

/// Encode an info message followed by its mixed table
pub fn encode_info(info: &InfoMsg, table: &[MixedExtentWire]) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        std::mem::size_of::<InfoMsg>() + table.len() * std::mem::size_of::<MixedExtentWire>(),
    );
    out.extend_from_slice(info.as_bytes());
    for row in table {
        out.extend_from_slice(row.as_bytes());
    }
    out
}

pub fn decode_info(bytes: &[u8]) -> Result<(InfoMsg, Vec<MixedExtentWire>), ProtocolError> {
    let head = std::mem::size_of::<InfoMsg>();
    if bytes.len() < head {
        return Err(ProtocolError::Truncated {
            what: "info message",
            expected: head,
            actual: bytes.len(),
        });
    }
    let info: InfoMsg = decode_struct("info message", &bytes[..head])?;
    let rest = &bytes[head..];
    let row = std::mem::size_of::<MixedExtentWire>();
    let expected = info.mixed_entries as usize * row;
    if rest.len() != expected {
        return Err(ProtocolError::Truncated {
            what: "mixed layout table",
            expected,
            actual: rest.len(),
        });
    }
    let table = rest
        .chunks_exact(row)
        .map(|chunk| decode_struct("mixed layout row", chunk))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((info, table))
}

/// Fixed part of a file description
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct FileDescHeader {
    pub start: u64,
    pub end: u64,
    pub length: u64,
    pub num_pages: u32,
    pub name_len: u32,
}

const _: () = assert!(std::mem::size_of::<FileDescHeader>() == 32);

/// A named region of the buffer
///
/// Paged regions list the global page indices backing the file in order;
/// contiguous regions cover `[start, end)` directly and carry no pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescription {
    pub name: String,
    pub start: u64,
    pub end: u64,
    /// Bytes requested for the file so far
    pub length: u64,
    pub pages: Vec<u32>,
}

impl FileDescription {
    pub fn contiguous(name: impl Into<String>, start: u64, length: u64) -> Self {
        Self {
            name: name.into(),
            start,
            end: start + length,
            length,
            pages: Vec::new(),
        }
    }

    pub fn is_paged(&self) -> bool {
        !self.pages.is_empty()
    }

    /// Bytes available to the file
    pub fn capacity(&self) -> u64 {
        self.end - self.start
    }

    pub fn encode(&self) -> Vec<u8> {
        let header = FileDescHeader {
            start: self.start,
            end: self.end,
            length: self.length,
            num_pages: self.pages.len() as u32,
            name_len: self.name.len() as u32,
        };
        let mut out = Vec::with_capacity(
            std::mem::size_of::<FileDescHeader>() + self.name.len() + self.pages.len() * 4,
        );
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(self.name.as_bytes());
        out.extend_from_slice(self.pages.as_slice().as_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let head = std::mem::size_of::<FileDescHeader>();
        if bytes.len() < head {
            return Err(ProtocolError::Truncated {
                what: "file description",
                expected: head,
                actual: bytes.len(),
            });
        }
        let header: FileDescHeader = decode_struct("file description", &bytes[..head])?;
        let name_end = head + header.name_len as usize;
        let expected = name_end + header.num_pages as usize * 4;
        if bytes.len() != expected {
            return Err(ProtocolError::Truncated {
                what: "file description body",
                expected,
                actual: bytes.len(),
            });
        }
        let name = std::str::from_utf8(&bytes[head..name_end])
            .map_err(|_| ProtocolError::Malformed("file name is not UTF-8".to_string()))?
            .to_string();
        let pages = bytes[name_end..]
            .chunks_exact(4)
            .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        if header.end < header.start {
            return Err(ProtocolError::Malformed(format!(
                "file '{}' ends before it starts",
                name
            )));
        }
        Ok(Self {
            name,
            start: header.start,
            end: header.end,
            length: header.length,
            pages,
        })
    }
}

/// Encode an acknowledgement value
pub fn encode_ack(value: i32) -> [u8; 4] {
    value.to_ne_bytes()
}

pub fn decode_ack(bytes: &[u8]) -> Result<i32, ProtocolError> {
    let raw: [u8; 4] = bytes.try_into().map_err(|_| ProtocolError::Truncated {
        what: "acknowledgement",
        expected: 4,
        actual: bytes.len(),
    })?;
    Ok(i32::from_ne_bytes(raw))
}

pub fn success_ack() -> [u8; 4] {
    encode_ack(STATUS_SUCCESS)
}

pub fn fail_ack() -> [u8; 4] {
    encode_ack(STATUS_FAIL)
}

/// A page allocation request: the requested byte count then the name
pub fn encode_page_request(size: u64, name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + name.len());
    out.extend_from_slice(&size.to_ne_bytes());
    out.extend_from_slice(name.as_bytes());
    out
}

pub fn decode_page_request(bytes: &[u8]) -> Result<(u64, String), ProtocolError> {
    if bytes.len() < 8 {
        return Err(ProtocolError::Truncated {
            what: "page request",
            expected: 8,
            actual: bytes.len(),
        });
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    let name = decode_name(&bytes[8..])?;
    Ok((u64::from_ne_bytes(raw), name))
}

/// Decode a lock, notify or file name
pub fn decode_name(bytes: &[u8]) -> Result<String, ProtocolError> {
    if bytes.is_empty() || bytes.len() > crate::constants::MAX_NAME_LENGTH {
        return Err(ProtocolError::Malformed(format!(
            "name of {} bytes",
            bytes.len()
        )));
    }
    String::from_utf8(bytes.to_vec())
        .map_err(|_| ProtocolError::Malformed("name is not UTF-8".to_string()))
}

fn decode_struct<T: FromBytes>(what: &'static str, bytes: &[u8]) -> Result<T, ProtocolError> {
    T::read_from_bytes(bytes).map_err(|_| ProtocolError::Truncated {
        what,
        expected: std::mem::size_of::<T>(),
        actual: bytes.len(),
    })
}

fn to_i32(field: &'static str, value: u64) -> Result<i32, ProtocolError> {
    i32::try_from(value).map_err(|_| ProtocolError::FieldOverflow { field, value })
}
