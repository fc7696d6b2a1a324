//! Integration test: trace writer and packet stores
//!
//! Writes traces in memory with TraceWriter and reads them back through each
//! store flavour, including the corrupt and incompatible cases.

use std::io::Cursor;

use vkr_trace::packet::PACKET_HEADER_SIZE;
use vkr_trace::*;

fn host_header() -> TraceHeader {
    TraceHeader::for_host(vec![GpuInfo {
        vendor_id: 0x1002,
        device_id: 0x73bf,
        driver_version: 0x0020_0000,
    }])
}

fn small_trace(compress: bool) -> Vec<u8> {
    let mut w = TraceWriter::new(Vec::new(), &host_header())
        .unwrap()
        .with_compression(compress);
    w.write_call(
        EntryPoint::CreateShaderModule,
        0,
        &[Arg::Value(0xD0), Arg::Bytes(vec![0x03; 4096]), Arg::Value(0x5A)],
    )
    .unwrap();
    w.write_call(EntryPoint::CmdDraw, 0, &[
        Arg::Value(0xCB),
        Arg::Value(3),
        Arg::Value(1),
        Arg::Value(0),
        Arg::Value(0),
    ])
    .unwrap();
    w.finish().unwrap()
}

#[test]
fn test_roundtrip_through_file_store() {
    let bytes = small_trace(false);
    let mut store = TraceStore::from_reader(Cursor::new(bytes)).unwrap();
    assert_eq!(store.header().gpus.len(), 1);
    assert_eq!(store.header().gpus[0].vendor_id, 0x1002);

    let first = store.next_packet().unwrap().unwrap();
    assert_eq!(first.entry_point(), Ok(EntryPoint::CreateShaderModule));
    assert_eq!(first.header.global_index, 1);
    let fields = first.fields().unwrap();
    assert_eq!(fields.bytes("code").len(), 4096);
    assert_eq!(fields.value("module"), 0x5A);

    let second = store.next_packet().unwrap().unwrap();
    assert_eq!(second.entry_point(), Ok(EntryPoint::CmdDraw));
    assert_eq!(second.fields().unwrap().value("vertex_count"), 3);

    assert!(store.next_packet().unwrap().is_none());
}

#[test]
fn test_compressed_bodies_decompress_transparently() {
    let plain = small_trace(false);
    let packed = small_trace(true);
    assert!(packed.len() < plain.len());

    let mut store = TraceStore::from_reader(Cursor::new(packed)).unwrap();
    let first = store.next_packet().unwrap().unwrap();
    assert!(first.header.flags.contains(PacketFlags::COMPRESSED));
    assert!(first.header.size < (PACKET_HEADER_SIZE + first.body.len()) as u64);
    assert_eq!(first.fields().unwrap().bytes("code"), &[0x03; 4096][..]);
}

#[test]
fn test_pointer_size_mismatch_rejected_before_packets() {
    let mut header = host_header();
    header.pointer_size = if header.pointer_size == 8 { 4 } else { 8 };
    let mut w = TraceWriter::new(Vec::new(), &header).unwrap();
    w.write_call(EntryPoint::EndCommandBuffer, 0, &[Arg::Value(1)])
        .unwrap();
    let bytes = w.finish().unwrap();

    match TraceStore::from_reader(Cursor::new(bytes)) {
        Err(TraceError::Incompatible(msg)) => assert!(msg.contains("pointer size")),
        Err(other) => panic!("expected Incompatible, got {other:?}"),
        Ok(_) => panic!("store accepted a foreign pointer size"),
    }
}

#[test]
fn test_truncated_packet_is_corrupt() {
    let mut bytes = small_trace(false);
    bytes.truncate(bytes.len() - 10);
    let mut store = TraceStore::from_reader(Cursor::new(bytes)).unwrap();
    assert!(store.next_packet().unwrap().is_some());
    match store.next_packet() {
        Err(TraceError::Corrupt(_)) => {}
        other => panic!("expected Corrupt, got {other:?}"),
    }
}

#[test]
fn test_undersized_packet_is_corrupt() {
    let mut bytes = Vec::new();
    host_header().write(&mut bytes).unwrap();
    // A header whose declared size is smaller than the header itself.
    let mut raw = vec![0u8; PACKET_HEADER_SIZE];
    raw[..8].copy_from_slice(&4u64.to_ne_bytes());
    bytes.extend_from_slice(&raw);

    let mut store = TraceStore::from_reader(Cursor::new(bytes)).unwrap();
    assert!(matches!(store.next_packet(), Err(TraceError::Corrupt(_))));
}

#[test]
fn test_file_store_rewinds() {
    let mut store = TraceStore::from_reader(Cursor::new(small_trace(false))).unwrap();
    let start = store.position();
    assert_eq!(start, store.start());
    let first = store.next_packet().unwrap().unwrap();
    store.next_packet().unwrap();

    store.seek(start).unwrap();
    assert_eq!(store.next_packet().unwrap().unwrap(), first);
}

#[test]
fn test_stream_store_cannot_rewind() {
    let bytes = small_trace(false);
    let mut store = StreamStore::from_reader(bytes.as_slice()).unwrap();
    assert!(!store.can_rewind());
    let pos = store.position();
    store.next_packet().unwrap();
    assert!(matches!(store.seek(pos), Err(TraceError::RewindUnsupported)));
}

#[test]
fn test_preloaded_store_replays_same_sequence() {
    let mut file = TraceStore::from_reader(Cursor::new(small_trace(true))).unwrap();
    let mut store = PreloadedStore::load(&mut file).unwrap();
    assert_eq!(store.len(), 2);
    assert!(store.can_rewind());

    let start = store.position();
    let a = store.next_packet().unwrap().unwrap();
    let b = store.next_packet().unwrap().unwrap();
    assert!(store.next_packet().unwrap().is_none());

    store.seek(start).unwrap();
    assert_eq!(store.next_packet().unwrap().unwrap(), a);
    assert_eq!(store.next_packet().unwrap().unwrap(), b);
}

#[test]
fn test_unknown_packet_id_is_decode_error() {
    let mut w = TraceWriter::new(Vec::new(), &host_header()).unwrap();
    w.write_raw(0xFFFF, &[0u8; 16]).unwrap();
    let bytes = w.finish().unwrap();

    let mut store = TraceStore::from_reader(Cursor::new(bytes)).unwrap();
    let packet = store.next_packet().unwrap().unwrap();
    assert_eq!(packet.entry_point(), Err(DecodeError::UnknownPacket(0xFFFF)));
}
