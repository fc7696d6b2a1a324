//! Capture-side encoder.
//!
//! Produces the exact packet stream the store reads. Capture layers and the
//! test suites use it to build traces.

use std::io::Write;

use crate::body::{self, FIRST_FIELD_POS, RESULT_POS, SLOT_SIZE};
use crate::entry::{EntryPoint, Field, FieldKind};
use crate::error::TraceError;
use crate::header::TraceHeader;
use crate::packet::{PacketFlags, RawPacketHeader, MAX_PACKET_SIZE, PACKET_HEADER_SIZE};

/// Bodies smaller than this are never compressed.
const COMPRESSION_THRESHOLD: usize = 512;

/// One call argument, in descriptor order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    Value(u64),
    Values(Vec<u64>),
    Bytes(Vec<u8>),
    Records(Vec<Vec<Arg>>),
}

impl Arg {
    pub fn string(s: &str) -> Self {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        Arg::Bytes(bytes)
    }

    pub fn str_list(items: &[&str]) -> Self {
        let mut bytes = Vec::new();
        for item in items {
            bytes.extend_from_slice(item.as_bytes());
            bytes.push(0);
        }
        Arg::Bytes(bytes)
    }

    pub fn values_u32(items: &[u32]) -> Self {
        Arg::Values(items.iter().map(|&v| v as u64).collect())
    }

    pub fn record(fields: Vec<Arg>) -> Self {
        Arg::Records(vec![fields])
    }
}

/// Check that `args` have the shape `schema` describes.
pub fn check_args(schema: &'static [Field], args: &[Arg]) -> Result<(), TraceError> {
    if schema.len() != args.len() {
        return Err(TraceError::Encode(format!(
            "expected {} arguments, got {}",
            schema.len(),
            args.len()
        )));
    }
    for (field, arg) in schema.iter().zip(args) {
        let ok = match (field.kind, arg) {
            (FieldKind::Records(sub), Arg::Records(recs)) => {
                for rec in recs {
                    check_args(sub, rec)?;
                }
                true
            }
            (FieldKind::Bytes, Arg::Bytes(_)) => true,
            (kind, Arg::Values(_)) => kind.element_size() == Some(8),
            (kind, Arg::Value(_)) => kind.element_size().is_none(),
            _ => false,
        };
        if !ok {
            return Err(TraceError::Encode(format!(
                "argument `{}` does not match its field kind {:?}",
                field.name, field.kind
            )));
        }
    }
    Ok(())
}

/// Lay out a body: result slot, one slot per argument, then out-of-line data.
pub fn encode_body(result: i32, args: &[Arg]) -> Vec<u8> {
    let mut buf = vec![0u8; FIRST_FIELD_POS + args.len() * SLOT_SIZE];
    body::write_u64(&mut buf, RESULT_POS, result as i64 as u64);
    encode_struct(&mut buf, FIRST_FIELD_POS, args);
    buf
}

fn encode_struct(buf: &mut Vec<u8>, base: usize, args: &[Arg]) {
    for (i, arg) in args.iter().enumerate() {
        let pos = base + i * SLOT_SIZE;
        match arg {
            Arg::Value(v) => body::write_u64(buf, pos, *v),
            Arg::Values(values) => {
                let offset = buf.len();
                for v in values {
                    buf.extend_from_slice(&v.to_ne_bytes());
                }
                set_array(buf, pos, offset, values.len());
            }
            Arg::Bytes(bytes) => {
                let offset = buf.len();
                buf.extend_from_slice(bytes);
                set_array(buf, pos, offset, bytes.len());
            }
            Arg::Records(records) => {
                let elem = records.first().map_or(0, |r| r.len() * SLOT_SIZE);
                let offset = buf.len();
                buf.resize(offset + records.len() * elem, 0);
                for (j, rec) in records.iter().enumerate() {
                    encode_struct(buf, offset + j * elem, rec);
                }
                set_array(buf, pos, offset, records.len());
            }
        }
    }
}

fn set_array(buf: &mut [u8], pos: usize, offset: usize, count: usize) {
    body::write_u64(buf, pos, offset as u64);
    body::write_u64(buf, pos + 8, count as u64);
}

/// Writes a trace file: header first, then one packet per call.
pub struct TraceWriter<W: Write> {
    writer: W,
    next_index: u64,
    thread_id: u32,
    compress: bool,
    packets: u64,
}

impl<W: Write> TraceWriter<W> {
    pub fn new(mut writer: W, header: &TraceHeader) -> Result<Self, TraceError> {
        header.write(&mut writer)?;
        Ok(Self {
            writer,
            next_index: 1,
            thread_id: 1,
            compress: false,
            packets: 0,
        })
    }

    /// Compress bodies above the threshold when it saves space.
    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compress = enabled;
        self
    }

    pub fn set_thread_id(&mut self, thread_id: u32) {
        self.thread_id = thread_id;
    }

    pub fn packets_written(&self) -> u64 {
        self.packets
    }

    /// Encode and append one call. Returns the packet's global index.
    pub fn write_call(
        &mut self,
        entry: EntryPoint,
        result: i32,
        args: &[Arg],
    ) -> Result<u64, TraceError> {
        check_args(entry.fields(), args)?;
        let body = encode_body(result, args);
        self.write_raw(entry.id(), &body)
    }

    /// Append a packet with an arbitrary id and pre-encoded body.
    pub fn write_raw(&mut self, packet_id: u16, body: &[u8]) -> Result<u64, TraceError> {
        let compressed = if self.compress && body.len() > COMPRESSION_THRESHOLD {
            Some(lz4_flex::compress_prepend_size(body)).filter(|c| c.len() < body.len())
        } else {
            None
        };
        let (stored, flags) = match &compressed {
            Some(c) => (c.as_slice(), PacketFlags::COMPRESSED),
            None => (body, PacketFlags::empty()),
        };

        let size = (PACKET_HEADER_SIZE + stored.len()) as u64;
        if size > MAX_PACKET_SIZE {
            return Err(TraceError::Encode(format!("packet of {size} bytes is too large")));
        }
        let body_len = u32::try_from(body.len())
            .map_err(|_| TraceError::Encode(format!("body of {} bytes", body.len())))?;

        let global_index = self.next_index;
        let raw = RawPacketHeader {
            size,
            global_index,
            thread_id: self.thread_id,
            packet_id,
            flags: flags.bits(),
            body_len,
            reserved: 0,
        };
        self.writer.write_all(bytemuck::bytes_of(&raw))?;
        self.writer.write_all(stored)?;
        self.next_index += 1;
        self.packets += 1;
        Ok(global_index)
    }

    pub fn finish(mut self) -> Result<W, TraceError> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_args_rejects_wrong_arity() {
        let err = check_args(EntryPoint::CmdDraw.fields(), &[Arg::Value(1)]).unwrap_err();
        assert!(matches!(err, TraceError::Encode(_)));
    }

    #[test]
    fn test_check_args_rejects_wrong_kind() {
        let args = [Arg::Value(1), Arg::Value(2)];
        let err = check_args(EntryPoint::ResetFences.fields(), &args).unwrap_err();
        assert!(matches!(err, TraceError::Encode(msg) if msg.contains("fences")));
    }

    #[test]
    fn test_result_sign_extended() {
        let body = encode_body(-4, &[]);
        assert_eq!(body::read_u64(&body, RESULT_POS) as i64, -4);
    }
}
