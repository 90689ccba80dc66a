//! Wire codec for one IPC datagram, per spec §4.7/§6.1.
//!
//! Grounded on `server/lib/flux/src/shared.rs`'s `Serialize`/`Deserialize`
//! traits over `SizedWrite`/`SizedRead` (`io::Cursor` plus a remaining-
//! capacity query) and its manual `byteorder` encode/decode style, applied
//! here to the fixed IPC header instead of that crate's signal payloads.

use crate::error::{IpcError, IpcResult};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

/// Buffer capacity spec §6.1 calls a compile-time constant; kept
/// overridable via [`crate::config`] so deployments can tune it without a
/// rebuild, matching the teacher's TOML-configuration habit elsewhere.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 4096;

/// `id == 0`, reserved for the Connecting handshake buffer.
pub const ID_CONNECTING: u32 = 0;
/// `id == 1`, reserved for the Accepting handshake buffer.
pub const ID_ACCEPTING: u32 = 1;
/// First id a data buffer may use.
pub const DATA_ID_START: u32 = 2;
/// Ids at or beyond this value are reserved to avoid wrap ambiguity (spec
/// §4.8's "reserved range `[LastBufferId, 0xFFFFFFFF]`").
pub const LAST_BUFFER_ID: u32 = 0xFFFF_FFE0;

pub mod flags {
    pub const UPDATE: u16 = 1 << 0;
    pub const COMPRESSED: u16 = 1 << 1;
    pub const RELAY: u16 = 1 << 2;
    /// Spec §9's "legacy state flags" note: any bit outside the three
    /// above is reserved-must-be-zero.
    pub const RESERVED_MASK: u16 = !(UPDATE | COMPRESSED | RELAY);
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BufferType {
    Unknown,
    KeepAlive,
    Data,
    Connecting,
    Accepting,
}

impl BufferType {
    fn from_u8(value: u8) -> BufferType {
        match value {
            1 => BufferType::KeepAlive,
            2 => BufferType::Data,
            3 => BufferType::Connecting,
            4 => BufferType::Accepting,
            _ => BufferType::Unknown,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            BufferType::Unknown => 0,
            BufferType::KeepAlive => 1,
            BufferType::Data => 2,
            BufferType::Connecting => 3,
            BufferType::Accepting => 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Header {
    pub buffer_type: BufferType,
    pub resend_count: u8,
    pub flags: u16,
    pub id: u32,
    pub relay_id: Option<u32>,
    pub updates: Vec<u32>,
}

impl Header {
    pub fn new(buffer_type: BufferType, id: u32) -> Header {
        Header {
            buffer_type,
            resend_count: 0,
            flags: 0,
            id,
            relay_id: None,
            updates: Vec::new(),
        }
    }

    pub fn has_update(&self) -> bool {
        self.flags & flags::UPDATE != 0
    }

    pub fn has_relay(&self) -> bool {
        self.flags & flags::RELAY != 0
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & flags::COMPRESSED != 0
    }
}

/// One datagram: a [`Header`] plus an opaque payload. `decompress`/
/// `compress` are left to [`crate::controller::Controller`]; this type
/// only owns the bytes and the header fields that describe them.
#[derive(Debug, Clone)]
pub struct Buffer {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Buffer {
    pub fn new(header: Header, payload: Vec<u8>) -> Buffer {
        Buffer { header, payload }
    }

    /// `store`: write this buffer's header and payload, per spec §4.7.
    /// Fails (without partial output promises) if the encoding would
    /// exceed `capacity`.
    pub fn encode(&self, capacity: usize) -> IpcResult<Vec<u8>> {
        let mut updates = self.header.updates.clone();
        if updates.len() > u8::MAX as usize {
            updates.truncate(u8::MAX as usize);
        }

        let mut out = Vec::with_capacity(capacity.min(self.payload.len() + 16));
        out.write_u8(self.header.buffer_type.to_u8())?;
        out.write_u8(self.header.resend_count)?;

        let mut flags = self.header.flags & !flags::RESERVED_MASK;
        if self.header.relay_id.is_some() {
            flags |= crate::buffer::flags::RELAY;
        }
        if !updates.is_empty() {
            flags |= crate::buffer::flags::UPDATE;
        }
        out.write_u16::<BigEndian>(flags)?;
        out.write_u32::<BigEndian>(self.header.id)?;

        if flags & crate::buffer::flags::RELAY != 0 {
            let relay_id = self.header.relay_id.unwrap_or(0);
            out.write_u32::<BigEndian>(relay_id)?;
        }

        if flags & crate::buffer::flags::UPDATE != 0 {
            out.write_u8(updates.len() as u8)?;
            for id in &updates {
                out.write_u32::<BigEndian>(*id)?;
            }
        }

        out.write_all(&self.payload)?;

        if out.len() > capacity {
            return Err(IpcError::ChecksumMismatch);
        }

        Ok(out)
    }

    /// `check` + deserialize: validate header size invariants and parse a
    /// raw datagram back into a [`Buffer`]. Rejects reserved flag bits per
    /// spec §9's legacy-flags note.
    pub fn decode(bytes: &[u8]) -> IpcResult<Buffer> {
        if bytes.len() < 8 {
            return Err(IpcError::ChecksumMismatch);
        }

        let mut cursor = Cursor::new(bytes);
        let buffer_type = BufferType::from_u8(cursor.read_u8()?);
        let resend_count = cursor.read_u8()?;
        let flags = cursor.read_u16::<BigEndian>()?;
        let id = cursor.read_u32::<BigEndian>()?;

        if flags & crate::buffer::flags::RESERVED_MASK != 0 {
            return Err(IpcError::ChecksumMismatch);
        }

        let relay_id = if flags & crate::buffer::flags::RELAY != 0 {
            Some(cursor.read_u32::<BigEndian>().map_err(IpcError::from)?)
        } else {
            None
        };

        let mut updates = Vec::new();
        if flags & crate::buffer::flags::UPDATE != 0 {
            let count = cursor.read_u8().map_err(IpcError::from)?;
            for _ in 0..count {
                updates.push(cursor.read_u32::<BigEndian>().map_err(IpcError::from)?);
            }
        }

        let mut payload = Vec::new();
        cursor.read_to_end(&mut payload).map_err(IpcError::from)?;

        Ok(Buffer {
            header: Header {
                buffer_type,
                resend_count,
                flags,
                id,
                relay_id,
                updates,
            },
            payload,
        })
    }
}

/// Handshake payload carried by the Connecting/Accepting buffers (spec
/// §6.1). Extended per spec §10 items 1 and 4 with a reconnect token and a
/// relay hint the core parses and carries, but never interprets.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ConnectData {
    pub base_port: u16,
    /// Random per-process token distinguishing "same peer process" from
    /// "peer process restarted at the same address" (spec §10 item 1).
    pub session_token: u32,
    /// Opaque relay hop hint (spec §10 item 4); never acted upon by this
    /// crate beyond being carried through `Controller::gateway_iterator`.
    pub relay_hint: u32,
}

impl ConnectData {
    pub const ENCODED_SIZE: usize = 2 + 4 + 4;

    pub fn encode(&self) -> IpcResult<Vec<u8>> {
        let mut out = Vec::with_capacity(Self::ENCODED_SIZE);
        out.write_u16::<BigEndian>(self.base_port)?;
        out.write_u32::<BigEndian>(self.session_token)?;
        out.write_u32::<BigEndian>(self.relay_hint)?;
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> IpcResult<ConnectData> {
        if bytes.len() < Self::ENCODED_SIZE {
            return Err(IpcError::ChecksumMismatch);
        }
        let mut cursor = Cursor::new(bytes);
        Ok(ConnectData {
            base_port: cursor.read_u16::<BigEndian>()?,
            session_token: cursor.read_u32::<BigEndian>()?,
            relay_hint: cursor.read_u32::<BigEndian>()?,
        })
    }
}

/// Total-order, overflow-safe `a < b` comparison modulo 2^32, per spec
/// §4.8's sequence number rule.
#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// Advance a data-buffer sequence id, wrapping at [`LAST_BUFFER_ID`] back
/// to [`DATA_ID_START`] rather than through the reserved handshake ids.
#[inline]
pub fn next_data_id(current: u32) -> u32 {
    if current >= LAST_BUFFER_ID {
        DATA_ID_START
    } else {
        current + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_plain_data_buffer() {
        let header = Header::new(BufferType::Data, 42);
        let buffer = Buffer::new(header, b"hello".to_vec());
        let bytes = buffer.encode(DEFAULT_MAX_BUFFER_SIZE).unwrap();
        let decoded = Buffer::decode(&bytes).unwrap();
        assert_eq!(decoded.header.buffer_type, BufferType::Data);
        assert_eq!(decoded.header.id, 42);
        assert_eq!(decoded.payload, b"hello");
    }

    #[test]
    fn round_trips_update_block_and_relay_id() {
        let mut header = Header::new(BufferType::KeepAlive, 7);
        header.updates = vec![2, 3, 4];
        header.relay_id = Some(99);
        let buffer = Buffer::new(header, Vec::new());
        let bytes = buffer.encode(DEFAULT_MAX_BUFFER_SIZE).unwrap();
        let decoded = Buffer::decode(&bytes).unwrap();
        assert_eq!(decoded.header.updates, vec![2, 3, 4]);
        assert_eq!(decoded.header.relay_id, Some(99));
    }

    #[test]
    fn rejects_reserved_flag_bits() {
        let mut bytes = vec![2u8, 0, 0, 0, 0, 0, 0, 1];
        bytes[2] = 0x80; // high flags byte, an undefined bit
        assert!(matches!(Buffer::decode(&bytes), Err(IpcError::ChecksumMismatch)));
    }

    #[test]
    fn seq_lt_handles_wraparound() {
        assert!(seq_lt(u32::MAX, 0));
        assert!(!seq_lt(0, u32::MAX));
        assert!(seq_lt(5, 10));
    }

    #[test]
    fn connect_data_round_trips() {
        let data = ConnectData {
            base_port: 5000,
            session_token: 0xdead_beef,
            relay_hint: 0,
        };
        let bytes = data.encode().unwrap();
        assert_eq!(ConnectData::decode(&bytes).unwrap(), data);
    }
}
