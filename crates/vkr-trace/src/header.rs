use std::io::{Read, Write};

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use vkr_common::platform::{self, Endianness};

use crate::error::TraceError;

/// Trace file magic bytes: "VKTR"
pub const TRACE_MAGIC: [u8; 4] = *b"VKTR";

/// Current trace format version.
pub const FORMAT_VERSION: u16 = 1;

/// Upper bound on GPU records, so a corrupt count cannot drive a huge read.
pub const MAX_GPU_RECORDS: u32 = 64;

const NAME_LEN: usize = 16;

/// On-disk file header, native byte order of the capturing process.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct RawFileHeader {
    pub magic: [u8; 4],
    pub version: u16,
    pub pointer_size: u8,
    pub endianness: u8,
    pub arch: [u8; NAME_LEN],
    pub os: [u8; NAME_LEN],
    pub gpu_count: u32,
    pub reserved: u32,
}

/// On-disk GPU record following the file header.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct RawGpuRecord {
    /// Vendor id in the high 32 bits, device id in the low 32 bits.
    pub gpu_id: u64,
    pub driver_version: u64,
}

const RAW_HEADER_SIZE: usize = std::mem::size_of::<RawFileHeader>();
const RAW_GPU_SIZE: usize = std::mem::size_of::<RawGpuRecord>();

/// GPU the trace was captured on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub vendor_id: u32,
    pub device_id: u32,
    pub driver_version: u64,
}

impl GpuInfo {
    pub fn packed_id(&self) -> u64 {
        ((self.vendor_id as u64) << 32) | self.device_id as u64
    }

    pub fn from_packed(gpu_id: u64, driver_version: u64) -> Self {
        Self {
            vendor_id: (gpu_id >> 32) as u32,
            device_id: gpu_id as u32,
            driver_version,
        }
    }
}

/// Decoded trace file header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceHeader {
    pub version: u16,
    pub pointer_size: u8,
    #[serde(skip)]
    pub endianness: Endianness,
    pub arch: String,
    pub os: String,
    pub gpus: Vec<GpuInfo>,
}

impl TraceHeader {
    /// Header describing the running process.
    pub fn for_host(gpus: Vec<GpuInfo>) -> Self {
        Self {
            version: FORMAT_VERSION,
            pointer_size: platform::host_pointer_size(),
            endianness: platform::host_endianness(),
            arch: platform::arch_name().to_string(),
            os: platform::platform_name().to_string(),
            gpus,
        }
    }

    /// Bytes the header occupies on disk.
    pub fn encoded_len(&self) -> u64 {
        (RAW_HEADER_SIZE + self.gpus.len() * RAW_GPU_SIZE) as u64
    }

    /// Read and validate a header. Anything the replay host cannot consume is
    /// rejected here, before a single packet is looked at.
    pub fn read<R: Read>(reader: &mut R) -> Result<Self, TraceError> {
        let mut buf = [0u8; RAW_HEADER_SIZE];
        read_exact_or_corrupt(reader, &mut buf, "file header")?;
        let raw: RawFileHeader = bytemuck::pod_read_unaligned(&buf);

        if raw.magic != TRACE_MAGIC {
            return Err(TraceError::Incompatible(format!(
                "bad magic {:02x?}, expected {:02x?}",
                raw.magic, TRACE_MAGIC
            )));
        }

        // Single byte, readable before any multi-byte field is trusted.
        let endianness = Endianness::from_raw(raw.endianness).ok_or_else(|| {
            TraceError::Corrupt(format!("invalid endianness flag {}", raw.endianness))
        })?;
        if endianness != platform::host_endianness() {
            return Err(TraceError::Incompatible(format!(
                "trace is {:?}-endian, host is {:?}-endian",
                endianness,
                platform::host_endianness()
            )));
        }

        if raw.pointer_size != platform::host_pointer_size() {
            return Err(TraceError::Incompatible(format!(
                "trace pointer size is {} bytes, host pointer size is {} bytes",
                raw.pointer_size,
                platform::host_pointer_size()
            )));
        }

        if raw.version != FORMAT_VERSION {
            return Err(TraceError::Incompatible(format!(
                "unsupported trace format version {} (expected {})",
                raw.version, FORMAT_VERSION
            )));
        }

        if raw.gpu_count > MAX_GPU_RECORDS {
            return Err(TraceError::Corrupt(format!(
                "header declares {} GPU records (max {})",
                raw.gpu_count, MAX_GPU_RECORDS
            )));
        }

        let mut gpus = Vec::with_capacity(raw.gpu_count as usize);
        for _ in 0..raw.gpu_count {
            let mut rec = [0u8; RAW_GPU_SIZE];
            read_exact_or_corrupt(reader, &mut rec, "GPU record")?;
            let rec: RawGpuRecord = bytemuck::pod_read_unaligned(&rec);
            gpus.push(GpuInfo::from_packed(rec.gpu_id, rec.driver_version));
        }

        Ok(Self {
            version: raw.version,
            pointer_size: raw.pointer_size,
            endianness,
            arch: name_from_raw(&raw.arch),
            os: name_from_raw(&raw.os),
            gpus,
        })
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<(), TraceError> {
        if self.gpus.len() > MAX_GPU_RECORDS as usize {
            return Err(TraceError::Encode(format!(
                "{} GPU records exceed the format limit",
                self.gpus.len()
            )));
        }
        let raw = RawFileHeader {
            magic: TRACE_MAGIC,
            version: self.version,
            pointer_size: self.pointer_size,
            endianness: self.endianness as u8,
            arch: name_to_raw(&self.arch),
            os: name_to_raw(&self.os),
            gpu_count: self.gpus.len() as u32,
            reserved: 0,
        };
        writer.write_all(bytemuck::bytes_of(&raw))?;
        for gpu in &self.gpus {
            let rec = RawGpuRecord {
                gpu_id: gpu.packed_id(),
                driver_version: gpu.driver_version,
            };
            writer.write_all(bytemuck::bytes_of(&rec))?;
        }
        Ok(())
    }
}

fn read_exact_or_corrupt<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    what: &str,
) -> Result<(), TraceError> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => TraceError::Corrupt(format!("truncated {what}")),
        _ => TraceError::Io(e),
    })
}

fn name_from_raw(raw: &[u8; NAME_LEN]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn name_to_raw(name: &str) -> [u8; NAME_LEN] {
    let mut out = [0u8; NAME_LEN];
    let len = name.len().min(NAME_LEN);
    out[..len].copy_from_slice(&name.as_bytes()[..len]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_layout_sizes() {
        assert_eq!(RAW_HEADER_SIZE, 48);
        assert_eq!(RAW_GPU_SIZE, 16);
    }

    #[test]
    fn test_gpu_id_packing() {
        let gpu = GpuInfo {
            vendor_id: 0x10de,
            device_id: 0x2684,
            driver_version: 7,
        };
        assert_eq!(gpu.packed_id(), 0x0000_10de_0000_2684);
        assert_eq!(GpuInfo::from_packed(gpu.packed_id(), 7), gpu);
    }

    #[test]
    fn test_bad_magic_is_incompatible() {
        let mut bytes = Vec::new();
        TraceHeader::for_host(vec![]).write(&mut bytes).unwrap();
        bytes[0] = b'X';
        let err = TraceHeader::read(&mut bytes.as_slice()).unwrap_err();
        assert!(matches!(err, TraceError::Incompatible(_)));
    }

    #[test]
    fn test_truncated_header_is_corrupt() {
        let mut bytes = Vec::new();
        TraceHeader::for_host(vec![]).write(&mut bytes).unwrap();
        bytes.truncate(20);
        let err = TraceHeader::read(&mut bytes.as_slice()).unwrap_err();
        assert!(matches!(err, TraceError::Corrupt(_)));
    }

    #[test]
    fn test_long_arch_name_truncated() {
        let mut header = TraceHeader::for_host(vec![]);
        header.arch = "a-very-long-architecture-name".into();
        let mut bytes = Vec::new();
        header.write(&mut bytes).unwrap();
        let back = TraceHeader::read(&mut bytes.as_slice()).unwrap();
        assert_eq!(back.arch.len(), NAME_LEN);
    }
}
