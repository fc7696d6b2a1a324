use bytemuck::{Pod, Zeroable};

use crate::body::{self, Fields};
use crate::entry::EntryPoint;
use crate::error::DecodeError;

/// On-disk packet header size in bytes.
pub const PACKET_HEADER_SIZE: usize = std::mem::size_of::<RawPacketHeader>();

/// Largest packet the store will allocate for: 1 GiB.
pub const MAX_PACKET_SIZE: u64 = 1 << 30;

bitflags::bitflags! {
    /// Packet flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PacketFlags: u16 {
        /// Body is LZ4-compressed with its uncompressed size prepended.
        const COMPRESSED = 0b0000_0001;
    }
}

/// On-disk packet header, native byte order.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct RawPacketHeader {
    /// Total on-disk size, header included.
    pub size: u64,
    pub global_index: u64,
    pub thread_id: u32,
    pub packet_id: u16,
    pub flags: u16,
    /// Uncompressed body length.
    pub body_len: u32,
    pub reserved: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub size: u64,
    pub global_index: u64,
    pub thread_id: u32,
    pub packet_id: u16,
    pub flags: PacketFlags,
}

impl PacketHeader {
    pub fn from_raw(raw: &RawPacketHeader) -> Self {
        Self {
            size: raw.size,
            global_index: raw.global_index,
            thread_id: raw.thread_id,
            packet_id: raw.packet_id,
            flags: PacketFlags::from_bits_truncate(raw.flags),
        }
    }
}

/// One recorded call: header plus a decompressed body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub body: Vec<u8>,
}

impl Packet {
    pub fn entry_point(&self) -> Result<EntryPoint, DecodeError> {
        EntryPoint::from_id(self.header.packet_id)
            .ok_or(DecodeError::UnknownPacket(self.header.packet_id))
    }

    /// Return value observed at capture time.
    pub fn trace_result(&self) -> i32 {
        body::read_u64(&self.body, body::RESULT_POS) as i64 as i32
    }

    /// Validated view of the body's parameters.
    pub fn fields(&self) -> Result<Fields<'_>, DecodeError> {
        Fields::top(&self.body, self.entry_point()?)
    }

    pub fn name(&self) -> &'static str {
        self.entry_point().map(EntryPoint::name).unwrap_or("<unknown>")
    }
}
