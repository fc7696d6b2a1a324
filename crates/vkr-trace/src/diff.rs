//! Dirty-page differential payloads.
//!
//! A flush or unmap payload normally carries the whole range. When capture
//! only tracked the pages that changed, the payload instead starts with a
//! table of 16-byte block records:
//!
//! ```text
//! [count, total_len, DIFF_MARKER, 0]       leading record, marker at byte 8
//! [offset, len, 0, 0] * count              one per changed block
//! block data, concatenated
//! ```
//!
//! Block offsets are relative to the start of the transferred range.

use crate::error::DecodeError;

pub const DIFF_MARKER: u32 = 0x4447_5044;
pub const MARKER_OFFSET: usize = 8;
const RECORD_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffBlock<'a> {
    pub offset: u64,
    pub data: &'a [u8],
}

fn u32_at(bytes: &[u8], pos: usize) -> u32 {
    bytes
        .get(pos..pos + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_ne_bytes)
        .unwrap_or(0)
}

/// Whether `payload` carries the differential marker.
pub fn is_diff(payload: &[u8]) -> bool {
    payload.len() >= RECORD_SIZE && u32_at(payload, MARKER_OFFSET) == DIFF_MARKER
}

pub fn parse_diff(payload: &[u8]) -> Result<Vec<DiffBlock<'_>>, DecodeError> {
    if !is_diff(payload) {
        return Err(DecodeError::BadDiff("missing marker"));
    }
    let count = u32_at(payload, 0) as usize;
    let total = u32_at(payload, 4) as usize;

    let table_end = count
        .checked_add(1)
        .and_then(|n| n.checked_mul(RECORD_SIZE))
        .ok_or(DecodeError::BadDiff("block count overflows"))?;
    if table_end.checked_add(total) != Some(payload.len()) {
        return Err(DecodeError::BadDiff("length does not match block table"));
    }

    let mut blocks = Vec::with_capacity(count);
    let mut cursor = table_end;
    for i in 0..count {
        let rec = RECORD_SIZE * (i + 1);
        let offset = u32_at(payload, rec) as u64;
        let len = u32_at(payload, rec + 4) as usize;
        let end = cursor
            .checked_add(len)
            .filter(|&end| end <= payload.len())
            .ok_or(DecodeError::BadDiff("block data overruns payload"))?;
        blocks.push(DiffBlock {
            offset,
            data: &payload[cursor..end],
        });
        cursor = end;
    }
    if cursor != payload.len() {
        return Err(DecodeError::BadDiff("trailing bytes after blocks"));
    }
    Ok(blocks)
}

/// Build a differential payload holding the pages of `current` that differ
/// from `previous`. Both slices cover the same range.
pub fn encode_diff(previous: &[u8], current: &[u8], page_size: usize) -> Vec<u8> {
    let page_size = page_size.max(1);
    let mut blocks: Vec<(usize, usize)> = Vec::new();
    for start in (0..current.len()).step_by(page_size) {
        let end = (start + page_size).min(current.len());
        if previous.get(start..end) == Some(&current[start..end]) {
            continue;
        }
        match blocks.last_mut() {
            Some(last) if last.1 == start => last.1 = end,
            _ => blocks.push((start, end)),
        }
    }

    let total: usize = blocks.iter().map(|(s, e)| e - s).sum();
    let mut out = Vec::with_capacity(RECORD_SIZE * (blocks.len() + 1) + total);
    push_record(&mut out, blocks.len() as u32, total as u32, DIFF_MARKER);
    for &(s, e) in &blocks {
        push_record(&mut out, s as u32, (e - s) as u32, 0);
    }
    for &(s, e) in &blocks {
        out.extend_from_slice(&current[s..e]);
    }
    out
}

fn push_record(out: &mut Vec<u8>, a: u32, b: u32, c: u32) {
    out.extend_from_slice(&a.to_ne_bytes());
    out.extend_from_slice(&b.to_ne_bytes());
    out.extend_from_slice(&c.to_ne_bytes());
    out.extend_from_slice(&0u32.to_ne_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_changed_pages_encoded() {
        let previous = vec![0u8; 64];
        let mut current = previous.clone();
        current[5] = 1;
        current[40] = 2;
        let payload = encode_diff(&previous, &current, 16);
        assert!(is_diff(&payload));

        let blocks = parse_diff(&payload).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].offset, 0);
        assert_eq!(blocks[0].data.len(), 16);
        assert_eq!(blocks[1].offset, 32);
        assert_eq!(blocks[1].data[8], 2);
    }

    #[test]
    fn test_adjacent_pages_merge() {
        let previous = vec![0u8; 48];
        let current = vec![9u8; 48];
        let payload = encode_diff(&previous, &current, 16);
        let blocks = parse_diff(&payload).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].data.len(), 48);
    }

    #[test]
    fn test_plain_payload_is_not_diff() {
        assert!(!is_diff(&[0xAB; 64]));
        assert!(!is_diff(&[0; 4]));
    }

    #[test]
    fn test_truncated_diff_rejected() {
        let previous = vec![0u8; 32];
        let current = vec![1u8; 32];
        let mut payload = encode_diff(&previous, &current, 16);
        payload.pop();
        assert!(parse_diff(&payload).is_err());
    }
}
