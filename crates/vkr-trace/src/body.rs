//! Packet body layout.
//!
//! A body is a result slot followed by one 16-byte slot per field of the
//! entry point's descriptor. A slot holds `(value, count)` as native-endian
//! `u64`s. Scalars and handles live in `value`. Arrays, blobs and nested
//! records store an offset from the start of the body in `value` and their
//! element count in `count`; the elements themselves sit later in the body.
//! Nested records use the same slot layout, so a record array is a run of
//! `fields.len() * SLOT_SIZE` byte elements.

use crate::entry::{EntryPoint, Field, FieldKind};
use crate::error::DecodeError;

pub const SLOT_SIZE: usize = 16;
/// Position of the recorded return value.
pub const RESULT_POS: usize = 0;
/// Position of the first parameter slot.
pub const FIRST_FIELD_POS: usize = SLOT_SIZE;

pub fn read_u64(bytes: &[u8], pos: usize) -> u64 {
    bytes
        .get(pos..pos + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_ne_bytes)
        .unwrap_or(0)
}

pub fn write_u64(bytes: &mut [u8], pos: usize, value: u64) {
    if let Some(slot) = bytes.get_mut(pos..pos + 8) {
        slot.copy_from_slice(&value.to_ne_bytes());
    }
}

/// Number of bytes the fixed part of a struct occupies.
pub fn fixed_size(schema: &[Field]) -> usize {
    schema.len() * SLOT_SIZE
}

/// Check that every array of `schema` rooted at `base` lies inside `bytes`.
pub fn validate(bytes: &[u8], schema: &'static [Field], base: usize) -> Result<(), DecodeError> {
    let needed = base + fixed_size(schema);
    if bytes.len() < needed {
        return Err(DecodeError::BodyTooShort {
            len: bytes.len(),
            needed,
        });
    }

    for (i, field) in schema.iter().enumerate() {
        let Some(elem) = field.kind.element_size() else {
            continue;
        };
        let pos = base + i * SLOT_SIZE;
        let offset = read_u64(bytes, pos);
        let count = read_u64(bytes, pos + 8);
        let start = array_start(bytes.len(), field.name, offset, count, elem)?;

        if let FieldKind::Records(sub) = field.kind {
            for j in 0..count as usize {
                validate(bytes, sub, start + j * elem)?;
            }
        }
    }
    Ok(())
}

fn array_start(
    len: usize,
    field: &'static str,
    offset: u64,
    count: u64,
    elem: usize,
) -> Result<usize, DecodeError> {
    if count == 0 {
        return Ok(0);
    }
    let out_of_bounds = DecodeError::OutOfBounds {
        field,
        offset,
        count,
    };
    let size = count.checked_mul(elem as u64).ok_or(out_of_bounds.clone())?;
    let end = offset.checked_add(size).ok_or(out_of_bounds.clone())?;
    if end > len as u64 {
        return Err(out_of_bounds);
    }
    Ok(offset as usize)
}

// ── Read-only view ──────────────────────────────────────────

/// A validated view over one struct inside a body.
#[derive(Clone, Copy)]
pub struct Fields<'a> {
    bytes: &'a [u8],
    base: usize,
    schema: &'static [Field],
}

impl<'a> Fields<'a> {
    /// Validate `body` against `entry`'s layout and return its top-level view.
    pub fn top(body: &'a [u8], entry: EntryPoint) -> Result<Self, DecodeError> {
        let schema = entry.fields();
        validate(body, schema, FIRST_FIELD_POS)?;
        Ok(Self {
            bytes: body,
            base: FIRST_FIELD_POS,
            schema,
        })
    }

    /// View without validation; only for bodies already checked by [`Fields::top`].
    pub fn trusted(body: &'a [u8], entry: EntryPoint) -> Self {
        Self {
            bytes: body,
            base: FIRST_FIELD_POS,
            schema: entry.fields(),
        }
    }

    pub fn schema(&self) -> &'static [Field] {
        self.schema
    }

    pub fn base(&self) -> usize {
        self.base
    }

    /// Recorded return value (only meaningful on the top-level view).
    pub fn result(&self) -> i32 {
        read_u64(self.bytes, RESULT_POS) as i64 as i32
    }

    /// Body position of the named field's slot.
    pub fn slot_pos(&self, name: &str) -> Option<usize> {
        let idx = self.schema.iter().position(|f| f.name == name);
        debug_assert!(idx.is_some(), "no field `{name}` in layout");
        idx.map(|i| self.base + i * SLOT_SIZE)
    }

    pub fn has(&self, name: &str) -> bool {
        self.schema.iter().any(|f| f.name == name)
    }

    pub fn value(&self, name: &str) -> u64 {
        self.slot_pos(name)
            .map(|pos| read_u64(self.bytes, pos))
            .unwrap_or(0)
    }

    pub fn value_u32(&self, name: &str) -> u32 {
        self.value(name) as u32
    }

    pub fn count(&self, name: &str) -> usize {
        self.slot_pos(name)
            .map(|pos| read_u64(self.bytes, pos + 8) as usize)
            .unwrap_or(0)
    }

    fn array_range(&self, name: &str, elem: usize) -> std::ops::Range<usize> {
        let Some(pos) = self.slot_pos(name) else {
            return 0..0;
        };
        let count = read_u64(self.bytes, pos + 8) as usize;
        if count == 0 {
            return 0..0;
        }
        let start = read_u64(self.bytes, pos) as usize;
        let end = (start + count * elem).min(self.bytes.len());
        start.min(end)..end
    }

    /// Elements of a `Values`/`Handles`-style array.
    pub fn values(&self, name: &str) -> Vec<u64> {
        let range = self.array_range(name, 8);
        self.bytes[range]
            .chunks_exact(8)
            .map(|c| u64::from_ne_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect()
    }

    pub fn values_u32(&self, name: &str) -> Vec<u32> {
        self.values(name).into_iter().map(|v| v as u32).collect()
    }

    pub fn bytes(&self, name: &str) -> &'a [u8] {
        let range = self.array_range(name, 1);
        &self.bytes[range]
    }

    /// A NUL-terminated (or unterminated) string blob.
    pub fn string(&self, name: &str) -> String {
        let raw = self.bytes(name);
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        String::from_utf8_lossy(&raw[..end]).into_owned()
    }

    /// A list of names stored NUL-separated in one blob.
    pub fn str_list(&self, name: &str) -> Vec<String> {
        self.bytes(name)
            .split(|&b| b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect()
    }

    pub fn records(&self, name: &str) -> Vec<Fields<'a>> {
        let Some(idx) = self.schema.iter().position(|f| f.name == name) else {
            debug_assert!(false, "no field `{name}` in layout");
            return Vec::new();
        };
        let FieldKind::Records(sub) = self.schema[idx].kind else {
            return Vec::new();
        };
        let elem = fixed_size(sub);
        let range = self.array_range(name, elem);
        (range.start..range.end)
            .step_by(elem.max(1))
            .map(|base| Fields {
                bytes: self.bytes,
                base,
                schema: sub,
            })
            .collect()
    }
}

impl std::fmt::Debug for Fields<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for field in self.schema {
            match field.kind {
                FieldKind::Records(_) => map.entry(&field.name, &self.records(field.name)),
                FieldKind::Bytes => map.entry(&field.name, &self.bytes(field.name).len()),
                _ if field.kind.element_size().is_some() => {
                    map.entry(&field.name, &self.values(field.name))
                }
                _ => map.entry(&field.name, &self.value(field.name)),
            };
        }
        map.finish()
    }
}

/// Structural form for dumps: scalars and arrays as integers, nested records
/// as objects, text blobs as strings and other blobs as hex.
impl serde::Serialize for Fields<'_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;

        let mut map = serializer.serialize_map(Some(self.schema.len()))?;
        for field in self.schema {
            match field.kind {
                FieldKind::Records(_) => map.serialize_entry(field.name, &self.records(field.name))?,
                FieldKind::Bytes => map.serialize_entry(field.name, &Blob(self.bytes(field.name)))?,
                _ if field.kind.element_size().is_some() => {
                    map.serialize_entry(field.name, &self.values(field.name))?
                }
                _ => map.serialize_entry(field.name, &self.value(field.name))?,
            }
        }
        map.end()
    }
}

struct Blob<'a>(&'a [u8]);

impl Blob<'_> {
    fn is_text(&self) -> bool {
        !self.0.is_empty()
            && self.0.iter().any(|&b| b != 0)
            && self.0.iter().all(|&b| b == 0 || b.is_ascii_graphic() || b == b' ')
    }
}

impl serde::Serialize for Blob<'_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.is_text() {
            let names: Vec<&str> = self
                .0
                .split(|&b| b == 0)
                .filter(|s| !s.is_empty())
                .filter_map(|s| std::str::from_utf8(s).ok())
                .collect();
            return match names.as_slice() {
                [one] => serializer.serialize_str(one),
                _ => serializer.collect_seq(names),
            };
        }
        let hex: String = self.0.iter().map(|b| format!("{b:02x}")).collect();
        serializer.serialize_str(&hex)
    }
}

// ── In-place patching ───────────────────────────────────────

/// Temporarily overwrites slots of a body. Every write remembers the original
/// value and the patch puts them all back when dropped, so the body leaves a
/// handler byte-identical to how it entered, whichever way the handler exits.
pub struct BodyPatch<'a> {
    bytes: &'a mut [u8],
    saved: Vec<(usize, u64)>,
}

impl<'a> BodyPatch<'a> {
    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self {
            bytes,
            saved: Vec::new(),
        }
    }

    pub fn read(&self, pos: usize) -> u64 {
        read_u64(self.bytes, pos)
    }

    pub fn write(&mut self, pos: usize, value: u64) {
        let old = read_u64(self.bytes, pos);
        if old == value {
            return;
        }
        self.saved.push((pos, old));
        write_u64(self.bytes, pos, value);
    }

    pub fn bytes(&self) -> &[u8] {
        self.bytes
    }

    /// Number of slots currently overwritten.
    pub fn patched(&self) -> usize {
        self.saved.len()
    }
}

impl Drop for BodyPatch<'_> {
    fn drop(&mut self) {
        for &(pos, old) in self.saved.iter().rev() {
            write_u64(self.bytes, pos, old);
        }
    }
}
