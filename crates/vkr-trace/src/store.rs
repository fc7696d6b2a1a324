//! Sequential packet stores.
//!
//! Every store yields packets strictly in file order, one at a time. Stores
//! advertise whether they can rewind; the frame loop relies on that instead
//! of assuming it.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use tracing::{debug, warn};

use crate::error::TraceError;
use crate::header::TraceHeader;
use crate::packet::{
    Packet, PacketFlags, PacketHeader, RawPacketHeader, MAX_PACKET_SIZE, PACKET_HEADER_SIZE,
};

/// Where a store currently is, for rewinding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorePosition {
    /// Byte offset of the next packet in the file.
    pub byte_offset: u64,
    /// Number of packets yielded before this point.
    pub packet_index: u64,
}

pub trait PacketSource {
    fn header(&self) -> &TraceHeader;

    /// Next packet, or `None` at a clean end of stream.
    fn next_packet(&mut self) -> Result<Option<Packet>, TraceError>;

    fn can_rewind(&self) -> bool;

    fn position(&self) -> StorePosition;

    fn seek(&mut self, _pos: StorePosition) -> Result<(), TraceError> {
        Err(TraceError::RewindUnsupported)
    }
}

// ── Shared packet decoding ──────────────────────────────────

struct PacketReader<R> {
    reader: R,
    offset: u64,
    packet_index: u64,
    last_global: Option<u64>,
}

impl<R: Read> PacketReader<R> {
    fn new(reader: R, offset: u64) -> Self {
        Self {
            reader,
            offset,
            packet_index: 0,
            last_global: None,
        }
    }

    fn position(&self) -> StorePosition {
        StorePosition {
            byte_offset: self.offset,
            packet_index: self.packet_index,
        }
    }

    /// Fill `buf`, returning how many bytes were available before EOF.
    fn fill(&mut self, buf: &mut [u8]) -> Result<usize, TraceError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TraceError::Io(e)),
            }
        }
        Ok(filled)
    }

    fn read_packet(&mut self) -> Result<Option<Packet>, TraceError> {
        let start = self.offset;
        let mut buf = [0u8; PACKET_HEADER_SIZE];
        match self.fill(&mut buf)? {
            0 => return Ok(None),
            n if n < PACKET_HEADER_SIZE => {
                return Err(TraceError::Corrupt(format!(
                    "truncated packet header at offset {start}: {n} of {PACKET_HEADER_SIZE} bytes"
                )));
            }
            _ => {}
        }
        let raw: RawPacketHeader = bytemuck::pod_read_unaligned(&buf);

        if raw.size < PACKET_HEADER_SIZE as u64 || raw.size > MAX_PACKET_SIZE {
            return Err(TraceError::Corrupt(format!(
                "packet at offset {start} declares invalid size {}",
                raw.size
            )));
        }

        let stored_len = (raw.size - PACKET_HEADER_SIZE as u64) as usize;
        let mut stored = vec![0u8; stored_len];
        let got = self.fill(&mut stored)?;
        if got < stored_len {
            return Err(TraceError::Corrupt(format!(
                "packet at offset {start} declares {} bytes but only {} are available",
                raw.size,
                PACKET_HEADER_SIZE + got
            )));
        }

        let header = PacketHeader::from_raw(&raw);
        let body = if header.flags.contains(PacketFlags::COMPRESSED) {
            lz4_flex::decompress_size_prepended(&stored)
                .map_err(|e| TraceError::Decompression(e.to_string()))?
        } else {
            stored
        };
        if body.len() != raw.body_len as usize {
            return Err(TraceError::Corrupt(format!(
                "packet at offset {start} body is {} bytes, header says {}",
                body.len(),
                raw.body_len
            )));
        }

        if let Some(last) = self.last_global {
            if header.global_index <= last {
                warn!(
                    offset = start,
                    previous = last,
                    global_index = header.global_index,
                    "packet sequence number did not increase"
                );
            }
        }
        self.last_global = Some(header.global_index);
        self.offset += raw.size;
        self.packet_index += 1;

        Ok(Some(Packet { header, body }))
    }
}

// ── File-backed store ───────────────────────────────────────

/// Streams packets from a seekable source; rewinds by seeking.
pub struct TraceStore<R = BufReader<File>> {
    header: TraceHeader,
    data_start: u64,
    packets: PacketReader<R>,
}

impl TraceStore<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TraceError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        debug!(path = %path.display(), "opened trace file");
        Self::from_reader(BufReader::new(file))
    }
}

impl<R: Read + Seek> TraceStore<R> {
    pub fn from_reader(mut reader: R) -> Result<Self, TraceError> {
        let header = TraceHeader::read(&mut reader)?;
        let data_start = header.encoded_len();
        Ok(Self {
            header,
            data_start,
            packets: PacketReader::new(reader, data_start),
        })
    }

    /// Position of the first packet.
    pub fn start(&self) -> StorePosition {
        StorePosition {
            byte_offset: self.data_start,
            packet_index: 0,
        }
    }
}

impl<R: Read + Seek> PacketSource for TraceStore<R> {
    fn header(&self) -> &TraceHeader {
        &self.header
    }

    fn next_packet(&mut self) -> Result<Option<Packet>, TraceError> {
        self.packets.read_packet()
    }

    fn can_rewind(&self) -> bool {
        true
    }

    fn position(&self) -> StorePosition {
        self.packets.position()
    }

    fn seek(&mut self, pos: StorePosition) -> Result<(), TraceError> {
        self.packets.reader.seek(SeekFrom::Start(pos.byte_offset))?;
        self.packets.offset = pos.byte_offset;
        self.packets.packet_index = pos.packet_index;
        self.packets.last_global = None;
        Ok(())
    }
}

// ── Forward-only store ──────────────────────────────────────

/// Streams packets from any reader (a pipe, stdin). Cannot rewind.
pub struct StreamStore<R> {
    header: TraceHeader,
    packets: PacketReader<R>,
}

impl<R: Read> StreamStore<R> {
    pub fn from_reader(mut reader: R) -> Result<Self, TraceError> {
        let header = TraceHeader::read(&mut reader)?;
        let data_start = header.encoded_len();
        Ok(Self {
            header,
            packets: PacketReader::new(reader, data_start),
        })
    }
}

impl<R: Read> PacketSource for StreamStore<R> {
    fn header(&self) -> &TraceHeader {
        &self.header
    }

    fn next_packet(&mut self) -> Result<Option<Packet>, TraceError> {
        self.packets.read_packet()
    }

    fn can_rewind(&self) -> bool {
        false
    }

    fn position(&self) -> StorePosition {
        self.packets.position()
    }
}

// ── In-memory store ─────────────────────────────────────────

/// Every packet read up front, so replay does no file I/O.
pub struct PreloadedStore {
    header: TraceHeader,
    packets: Vec<Packet>,
    offsets: Vec<u64>,
    end_offset: u64,
    cursor: usize,
}

impl PreloadedStore {
    pub fn load(source: &mut dyn PacketSource) -> Result<Self, TraceError> {
        let header = source.header().clone();
        let mut packets = Vec::new();
        let mut offsets = Vec::new();
        loop {
            let offset = source.position().byte_offset;
            let Some(packet) = source.next_packet()? else {
                break;
            };
            offsets.push(offset);
            packets.push(packet);
        }
        let end_offset = source.position().byte_offset;
        debug!(packets = packets.len(), "preloaded trace");
        Ok(Self {
            header,
            packets,
            offsets,
            end_offset,
            cursor: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}

impl PacketSource for PreloadedStore {
    fn header(&self) -> &TraceHeader {
        &self.header
    }

    fn next_packet(&mut self) -> Result<Option<Packet>, TraceError> {
        let packet = self.packets.get(self.cursor).cloned();
        if packet.is_some() {
            self.cursor += 1;
        }
        Ok(packet)
    }

    fn can_rewind(&self) -> bool {
        true
    }

    fn position(&self) -> StorePosition {
        StorePosition {
            byte_offset: self
                .offsets
                .get(self.cursor)
                .copied()
                .unwrap_or(self.end_offset),
            packet_index: self.cursor as u64,
        }
    }

    fn seek(&mut self, pos: StorePosition) -> Result<(), TraceError> {
        let index = pos.packet_index as usize;
        if index > self.packets.len() {
            return Err(TraceError::Corrupt(format!(
                "seek to packet {index} past end ({} packets)",
                self.packets.len()
            )));
        }
        self.cursor = index;
        Ok(())
    }
}
