//! Message wire format
//!
//! A message queued for a receiver is a single pool allocation:
//!
//! ```text
//! +----------------+------------------------+---------------------------+
//! | header (72 B)  | payload (payload_size) | offsets (4 B per object)  |
//! +----------------+------------------------+---------------------------+
//! ```
//!
//! The payload is opaque except for the special-object records the offset
//! table points at. All integers are little-endian.
//!
//! ## Header layout
//!
//! | off | size | field                         |
//! |-----|------|-------------------------------|
//! | 0   | 4    | kind                          |
//! | 4   | 4    | flags                         |
//! | 8   | 4    | target handle                 |
//! | 12  | 4    | target token                  |
//! | 16  | 4    | code                          |
//! | 20  | 4    | payload size                  |
//! | 24  | 8    | timestamp (correlation id)    |
//! | 32  | 4    | special-object count          |
//! | 36  | 4    | sender task                   |
//! | 40  | 4    | sender process                |
//! | 44  | 4    | sender uid                    |
//! | 48  | 4    | sender gid                    |
//! | 52  | 4    | reserved                      |
//! | 56  | 8    | payload user address          |
//! | 64  | 8    | offset table user address     |

use bitflags::bitflags;
use relay_platform::{Credentials, ProcessId, TaskId};
use static_assertions::const_assert_eq;

use crate::address::{PoolOffset, UserAddr};
use crate::error::{IpcError, Result};
use crate::registry::Handle;

pub const MESSAGE_HEADER_SIZE: usize = 72;

/// Size of one embedded special-object record
pub const SPECIAL_OBJECT_SIZE: usize = 24;

/// Size of one offset table entry
pub const OFFSET_ENTRY_SIZE: usize = core::mem::size_of::<u32>();

/// Per-object bookkeeping charged against `io_data_max` besides the record
const OBJECT_OVERHEAD: usize = 8;

const_assert_eq!(MESSAGE_HEADER_SIZE % 8, 0);
const_assert_eq!(SPECIAL_OBJECT_SIZE, 8 + 16);
const_assert_eq!(OFFSET_ENTRY_SIZE, 4);

/// Payload and object limits derived from the per-message data budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageLimits {
    pub max_payload: usize,
    pub max_objects: usize,
}

impl MessageLimits {
    pub const fn from_io_data_max(io_data_max: usize) -> Self {
        // floor(io_data_max * object / stride), split so it cannot overflow
        let stride = SPECIAL_OBJECT_SIZE + OBJECT_OVERHEAD;
        let max_payload = io_data_max / stride * SPECIAL_OBJECT_SIZE
            + io_data_max % stride * SPECIAL_OBJECT_SIZE / stride;
        Self {
            max_payload,
            max_objects: max_payload / SPECIAL_OBJECT_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageKind {
    Request = 0,
    Reply = 1,
    FailedReply = 2,
    /// Kernel-generated when a service task exits
    DeathNotice = 3,
}

impl MessageKind {
    pub fn is_reply(self) -> bool {
        matches!(self, MessageKind::Reply | MessageKind::FailedReply)
    }
}

impl TryFrom<u32> for MessageKind {
    type Error = IpcError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(MessageKind::Request),
            1 => Ok(MessageKind::Reply),
            2 => Ok(MessageKind::FailedReply),
            3 => Ok(MessageKind::DeathNotice),
            _ => Err(IpcError::InvalidArgument("unknown message kind")),
        }
    }
}

bitflags! {
    /// Per-message flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MessageFlags: u32 {
        /// No reply expected
        const ONE_WAY = 1 << 0;
    }
}

/// Addressed endpoint of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Target {
    pub handle: Handle,
    /// Opaque value carried to the receiver (the dead task's id in a death notice)
    pub token: u32,
}

/// Fixed-size message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub kind: MessageKind,
    pub flags: MessageFlags,
    pub target: Target,
    pub code: u32,
    pub payload_size: u32,
    /// Stamped on requests; replies carry their request's value
    pub timestamp: u64,
    pub object_count: u32,
    pub sender_task: TaskId,
    pub sender_process: ProcessId,
    pub credentials: Credentials,
    /// User address of the payload once delivered, zero before
    pub payload_addr: UserAddr,
    /// User address of the offset table once delivered, zero before
    pub offsets_addr: UserAddr,
}

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(word)
}

fn le_u64(bytes: &[u8], at: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(word)
}

fn put_u32(bytes: &mut [u8], at: usize, value: u32) {
    bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(bytes: &mut [u8], at: usize, value: u64) {
    bytes[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

impl MessageHeader {
    pub fn encode(&self) -> [u8; MESSAGE_HEADER_SIZE] {
        let mut out = [0u8; MESSAGE_HEADER_SIZE];
        put_u32(&mut out, 0, self.kind as u32);
        put_u32(&mut out, 4, self.flags.bits());
        put_u32(&mut out, 8, self.target.handle.0);
        put_u32(&mut out, 12, self.target.token);
        put_u32(&mut out, 16, self.code);
        put_u32(&mut out, 20, self.payload_size);
        put_u64(&mut out, 24, self.timestamp);
        put_u32(&mut out, 32, self.object_count);
        put_u32(&mut out, 36, self.sender_task.0);
        put_u32(&mut out, 40, self.sender_process.0);
        put_u32(&mut out, 44, self.credentials.uid);
        put_u32(&mut out, 48, self.credentials.gid);
        put_u64(&mut out, 56, self.payload_addr.0 as u64);
        put_u64(&mut out, 64, self.offsets_addr.0 as u64);
        out
    }

    /// Decode a header from at least [`MESSAGE_HEADER_SIZE`] bytes
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < MESSAGE_HEADER_SIZE {
            return Err(IpcError::InvalidArgument("truncated message header"));
        }
        Ok(Self {
            kind: MessageKind::try_from(le_u32(bytes, 0))?,
            flags: MessageFlags::from_bits_truncate(le_u32(bytes, 4)),
            target: Target {
                handle: Handle(le_u32(bytes, 8)),
                token: le_u32(bytes, 12),
            },
            code: le_u32(bytes, 16),
            payload_size: le_u32(bytes, 20),
            timestamp: le_u64(bytes, 24),
            object_count: le_u32(bytes, 32),
            sender_task: TaskId(le_u32(bytes, 36)),
            sender_process: ProcessId(le_u32(bytes, 40)),
            credentials: Credentials {
                uid: le_u32(bytes, 44),
                gid: le_u32(bytes, 48),
            },
            payload_addr: UserAddr(le_u64(bytes, 56) as usize),
            offsets_addr: UserAddr(le_u64(bytes, 64) as usize),
        })
    }

    pub fn is_one_way(&self) -> bool {
        self.flags.contains(MessageFlags::ONE_WAY)
    }
}

const TAG_BUFFER: u32 = 1;
const TAG_DESCRIPTOR: u32 = 2;
const TAG_HANDLE: u32 = 3;

/// Kernel-interpreted record embedded in a payload
///
/// The sender writes the record in its own terms (its buffer address, its
/// descriptor, a handle it can reach); the kernel rewrites it in the
/// receiver's terms during delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialObject {
    /// Out-of-line bytes copied into the receiver's pool
    Buffer { addr: u64, len: u32 },
    /// File descriptor duplicated into the receiver
    Descriptor { fd: i32 },
    /// Service handle whose access right travels with the message
    Handle { handle: u32, token: u32, cookie: u32 },
}

impl SpecialObject {
    pub fn encode(&self) -> [u8; SPECIAL_OBJECT_SIZE] {
        let mut out = [0u8; SPECIAL_OBJECT_SIZE];
        match *self {
            SpecialObject::Buffer { addr, len } => {
                put_u32(&mut out, 0, TAG_BUFFER);
                put_u64(&mut out, 8, addr);
                put_u32(&mut out, 16, len);
            }
            SpecialObject::Descriptor { fd } => {
                put_u32(&mut out, 0, TAG_DESCRIPTOR);
                put_u32(&mut out, 8, fd as u32);
            }
            SpecialObject::Handle { handle, token, cookie } => {
                put_u32(&mut out, 0, TAG_HANDLE);
                put_u32(&mut out, 8, handle);
                put_u32(&mut out, 12, token);
                put_u32(&mut out, 16, cookie);
            }
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SPECIAL_OBJECT_SIZE {
            return Err(IpcError::InvalidArgument("truncated special object"));
        }
        match le_u32(bytes, 0) {
            TAG_BUFFER => Ok(SpecialObject::Buffer {
                addr: le_u64(bytes, 8),
                len: le_u32(bytes, 16),
            }),
            TAG_DESCRIPTOR => Ok(SpecialObject::Descriptor {
                fd: le_u32(bytes, 8) as i32,
            }),
            TAG_HANDLE => Ok(SpecialObject::Handle {
                handle: le_u32(bytes, 8),
                token: le_u32(bytes, 12),
                cookie: le_u32(bytes, 16),
            }),
            _ => Err(IpcError::InvalidArgument("unknown special object type")),
        }
    }
}

/// Check one offset against the payload and its predecessor
///
/// Offsets must leave room for a whole record and be strictly ascending by at
/// least one record.
pub fn check_object_offset(
    offset: u32,
    previous: Option<u32>,
    payload_size: usize,
) -> Result<usize> {
    let offset = offset as usize;
    if payload_size < SPECIAL_OBJECT_SIZE || offset > payload_size - SPECIAL_OBJECT_SIZE {
        return Err(IpcError::InvalidArgument("special object offset out of range"));
    }
    if let Some(previous) = previous {
        if offset < previous as usize + SPECIAL_OBJECT_SIZE {
            return Err(IpcError::InvalidArgument("special object offsets overlap"));
        }
    }
    Ok(offset)
}

/// Payload bytes with embedded special objects
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    bytes: Vec<u8>,
    offsets: Vec<u32>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opaque bytes without special objects
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            offsets: Vec::new(),
        }
    }

    /// Raw bytes and offset table as given, unchecked
    pub fn from_parts(bytes: Vec<u8>, offsets: Vec<u32>) -> Self {
        Self { bytes, offsets }
    }

    /// Append opaque bytes
    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.bytes.extend_from_slice(data);
        self
    }

    /// Append a special object and record its offset
    pub fn object(mut self, object: SpecialObject) -> Self {
        self.offsets.push(self.bytes.len() as u32);
        self.bytes.extend_from_slice(&object.encode());
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn offsets(&self) -> &[u32] {
        &self.offsets
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// A message as composed by a sender
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub kind: MessageKind,
    pub flags: MessageFlags,
    pub target: Target,
    pub code: u32,
    /// Copied from the request for replies, ignored otherwise
    pub timestamp: u64,
    pub payload: Payload,
}

impl OutboundMessage {
    /// Request to the service behind `handle`
    pub fn request(handle: Handle, code: u32, payload: Payload) -> Self {
        Self {
            kind: MessageKind::Request,
            flags: MessageFlags::empty(),
            target: Target { handle, token: 0 },
            code,
            timestamp: 0,
            payload,
        }
    }

    /// Request that expects no reply
    pub fn one_way(handle: Handle, code: u32, payload: Payload) -> Self {
        Self {
            flags: MessageFlags::ONE_WAY,
            ..Self::request(handle, code, payload)
        }
    }

    /// Reply to a delivered request
    pub fn reply(request: &MessageHeader, payload: Payload) -> Self {
        Self {
            kind: MessageKind::Reply,
            flags: MessageFlags::empty(),
            target: Target {
                handle: Handle(request.sender_task.0),
                token: request.target.token,
            },
            code: request.code,
            timestamp: request.timestamp,
            payload,
        }
    }

    /// Tell the requester the request was refused
    pub fn failed_reply(request: &MessageHeader) -> Self {
        Self {
            kind: MessageKind::FailedReply,
            ..Self::reply(request, Payload::new())
        }
    }

    /// Attach a token for the receiving service
    pub fn with_token(mut self, token: u32) -> Self {
        self.target.token = token;
        self
    }
}

/// Placement of a message inside a pool allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NodeLayout {
    pub base: PoolOffset,
    pub payload_size: usize,
    pub object_count: usize,
}

impl NodeLayout {
    pub fn new(base: PoolOffset, payload_size: usize, object_count: usize) -> Self {
        Self {
            base,
            payload_size,
            object_count,
        }
    }

    pub fn for_header(base: PoolOffset, header: &MessageHeader) -> Self {
        Self::new(base, header.payload_size as usize, header.object_count as usize)
    }

    pub fn total_size(payload_size: usize, object_count: usize) -> usize {
        MESSAGE_HEADER_SIZE + payload_size + object_count * OFFSET_ENTRY_SIZE
    }

    pub fn payload(&self) -> PoolOffset {
        self.base.add(MESSAGE_HEADER_SIZE)
    }

    pub fn offsets(&self) -> PoolOffset {
        self.payload().add(self.payload_size)
    }
}

/// Decode an offset table
pub(crate) fn decode_offsets(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(OFFSET_ENTRY_SIZE)
        .map(|chunk| le_u32(chunk, 0))
        .collect()
}

/// Encode an offset table
pub(crate) fn encode_offsets(offsets: &[u32]) -> Vec<u8> {
    offsets.iter().flat_map(|offset| offset.to_le_bytes()).collect()
}
