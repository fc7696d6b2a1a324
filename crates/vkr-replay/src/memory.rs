//! Memory shadow and mapping emulation.
//!
//! Each trace allocation has a shadow record. Allocations normally exist on
//! the replay device right away. A pending allocation has no native memory
//! yet: mapping it hands out a host shadow buffer and writes land there until
//! the allocation is reconciled at bind time. Callers see identical behavior
//! on both paths.

use std::collections::HashMap;

use ash::vk;
use tracing::{debug, trace};
use vkr_trace::diff;

use crate::driver::{MappedRange, ReplayDriver};

pub const WHOLE_SIZE: u64 = vk::WHOLE_SIZE;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("not a tracked allocation")]
    Unknown,

    #[error("not mapped")]
    NotMapped,

    #[error("already mapped")]
    AlreadyMapped,

    #[error("range {offset}+{size} is outside the {limit}-byte {what}")]
    OutOfRange {
        what: &'static str,
        offset: u64,
        size: u64,
        limit: u64,
    },

    #[error("bad differential payload: {0}")]
    Diff(String),

    #[error("native call failed: {0:?}")]
    Native(vk::Result),

    #[error("cannot hold a {0}-byte host shadow")]
    ShadowTooLarge(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRange {
    pub offset: u64,
    pub size: u64,
}

/// Host copy of a pending allocation. It covers only the span that has been
/// mapped so far, starting at `base` within the allocation.
#[derive(Debug)]
struct Shadow {
    base: u64,
    bytes: Vec<u8>,
}

impl Shadow {
    fn end(&self) -> u64 {
        self.base + self.bytes.len() as u64
    }

    fn span(&self, offset: u64, len: usize) -> Option<std::ops::Range<usize>> {
        let start = usize::try_from(offset.checked_sub(self.base)?).ok()?;
        let end = start.checked_add(len)?;
        (end <= self.bytes.len()).then_some(start..end)
    }
}

#[derive(Debug)]
pub struct ShadowMemory {
    /// Replay device that owns (or will own) the allocation.
    pub device: u64,
    /// Trace device, for memory-type translation at reconcile time.
    pub trace_device: u64,
    /// Native allocation; `None` while pending.
    pub replay: Option<u64>,
    pub size: u64,
    /// Trace-time memory type index.
    pub memory_type: u32,
    shadow: Option<Shadow>,
    mapped: Option<MapRange>,
}

impl ShadowMemory {
    pub fn is_pending(&self) -> bool {
        self.replay.is_none()
    }

    pub fn mapped(&self) -> Option<MapRange> {
        self.mapped
    }

    pub fn has_shadow(&self) -> bool {
        self.shadow.is_some()
    }

    /// Bytes of host memory held for a pending allocation.
    pub fn shadow_len(&self) -> usize {
        self.shadow.as_ref().map_or(0, |s| s.bytes.len())
    }
}

/// One flush or invalidate range, in trace terms.
#[derive(Debug, Clone, Copy)]
pub struct HostRange<'a> {
    pub memory: u64,
    pub offset: u64,
    pub size: u64,
    pub data: &'a [u8],
}

#[derive(Default)]
pub struct MemoryEmulator {
    objects: HashMap<u64, ShadowMemory>,
    dirty_page_diff: bool,
}

impl MemoryEmulator {
    pub fn new(dirty_page_diff: bool) -> Self {
        Self {
            objects: HashMap::new(),
            dirty_page_diff,
        }
    }

    pub fn get(&self, memory: u64) -> Option<&ShadowMemory> {
        self.objects.get(&memory)
    }

    pub fn is_pending(&self, memory: u64) -> bool {
        self.objects.get(&memory).is_some_and(ShadowMemory::is_pending)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn track_allocated(
        &mut self,
        memory: u64,
        device: u64,
        trace_device: u64,
        replay: u64,
        size: u64,
        memory_type: u32,
    ) {
        self.objects.insert(
            memory,
            ShadowMemory {
                device,
                trace_device,
                replay: Some(replay),
                size,
                memory_type,
                shadow: None,
                mapped: None,
            },
        );
    }

    pub fn track_pending(
        &mut self,
        memory: u64,
        device: u64,
        trace_device: u64,
        size: u64,
        memory_type: u32,
    ) {
        debug!(memory, size, memory_type, "allocation deferred");
        self.objects.insert(
            memory,
            ShadowMemory {
                device,
                trace_device,
                replay: None,
                size,
                memory_type,
                shadow: None,
                mapped: None,
            },
        );
    }

    fn entry(&mut self, memory: u64) -> Result<&mut ShadowMemory, MemoryError> {
        self.objects.get_mut(&memory).ok_or(MemoryError::Unknown)
    }

    pub fn map(
        &mut self,
        driver: &mut dyn ReplayDriver,
        memory: u64,
        offset: u64,
        size: u64,
    ) -> Result<MapRange, MemoryError> {
        let mem = self.entry(memory)?;
        if mem.mapped.is_some() {
            return Err(MemoryError::AlreadyMapped);
        }
        let size = if size == WHOLE_SIZE {
            mem.size.saturating_sub(offset)
        } else {
            size
        };
        check_range("allocation", offset, size, mem.size)?;

        match mem.replay {
            Some(replay) => driver
                .map_memory(mem.device, replay, offset, size)
                .map_err(MemoryError::Native)?,
            None => cover(&mut mem.shadow, offset, size)?,
        }
        let range = MapRange { offset, size };
        mem.mapped = Some(range);
        trace!(memory, offset, size, pending = mem.replay.is_none(), "mapped");
        Ok(range)
    }

    /// Apply the captured payload for the active mapping, then unmap.
    pub fn unmap(
        &mut self,
        driver: &mut dyn ReplayDriver,
        memory: u64,
        data: &[u8],
    ) -> Result<(), MemoryError> {
        let diff_mode = self.dirty_page_diff;
        let mem = self.entry(memory)?;
        let range = mem.mapped.ok_or(MemoryError::NotMapped)?;
        if !data.is_empty() {
            apply_payload(driver, mem, range.offset, range.size, data, diff_mode)?;
        }
        if let Some(replay) = mem.replay {
            driver.unmap_memory(mem.device, replay);
        }
        mem.mapped = None;
        Ok(())
    }

    /// Copy each range's payload into the allocation and flush the native
    /// ranges. Returns the native flush result.
    pub fn flush(
        &mut self,
        driver: &mut dyn ReplayDriver,
        device: u64,
        ranges: &[HostRange<'_>],
    ) -> Result<vk::Result, MemoryError> {
        let diff_mode = self.dirty_page_diff;
        let mut native = Vec::new();
        for range in ranges {
            let mem = self.entry(range.memory)?;
            let size = resolve_range(mem, range.offset, range.size)?;
            if !range.data.is_empty() {
                apply_payload(driver, mem, range.offset, size, range.data, diff_mode)?;
            }
            if let Some(replay) = mem.replay {
                native.push(MappedRange {
                    memory: replay,
                    offset: range.offset,
                    size: range.size,
                });
            }
        }
        if native.is_empty() {
            return Ok(vk::Result::SUCCESS);
        }
        Ok(driver.flush_mapped(device, &native))
    }

    /// Invalidate the native ranges and read back what each range now holds.
    pub fn invalidate(
        &mut self,
        driver: &mut dyn ReplayDriver,
        device: u64,
        ranges: &[HostRange<'_>],
    ) -> Result<(vk::Result, Vec<Vec<u8>>), MemoryError> {
        let mut native = Vec::new();
        let mut sizes = Vec::with_capacity(ranges.len());
        for range in ranges {
            let mem = self.entry(range.memory)?;
            let size = resolve_range(mem, range.offset, range.size)?;
            sizes.push(size);
            if let Some(replay) = mem.replay {
                native.push(MappedRange {
                    memory: replay,
                    offset: range.offset,
                    size: range.size,
                });
            }
        }
        let result = if native.is_empty() {
            vk::Result::SUCCESS
        } else {
            driver.invalidate_mapped(device, &native)
        };

        let mut contents = Vec::with_capacity(ranges.len());
        for (range, size) in ranges.iter().zip(sizes) {
            let mem = self.entry(range.memory)?;
            let bytes = match (mem.replay, &mem.shadow) {
                (Some(replay), _) => driver
                    .read_mapped(replay, range.offset, size as usize)
                    .map_err(MemoryError::Native)?,
                (None, shadow) => {
                    let held = shadow.as_ref().and_then(|s| {
                        s.span(range.offset, size as usize)
                            .map(|span| s.bytes[span].to_vec())
                    });
                    match held {
                        Some(bytes) => bytes,
                        None => zeroed(size)?,
                    }
                }
            };
            contents.push(bytes);
        }
        Ok((result, contents))
    }

    /// Create the native allocation for a pending object and upload whatever
    /// was written to its shadow. `size` may exceed the traced size when the
    /// replay resource needs more room.
    pub fn reconcile(
        &mut self,
        driver: &mut dyn ReplayDriver,
        memory: u64,
        size: u64,
        replay_type: u32,
    ) -> Result<u64, MemoryError> {
        let mem = self.entry(memory)?;
        if let Some(replay) = mem.replay {
            return Ok(replay);
        }
        let size = size.max(mem.size);
        let replay = driver
            .allocate_memory(mem.device, size, replay_type)
            .map_err(MemoryError::Native)?;

        if let Some(shadow) = mem.shadow.take() {
            let uploaded = driver
                .map_memory(mem.device, replay, shadow.base, shadow.bytes.len() as u64)
                .and_then(|()| driver.write_mapped(replay, shadow.base, &shadow.bytes));
            driver.unmap_memory(mem.device, replay);
            if let Err(e) = uploaded {
                mem.shadow = Some(shadow);
                driver.free_memory(mem.device, replay);
                return Err(MemoryError::Native(e));
            }
        }
        if let Some(range) = mem.mapped {
            if let Err(e) = driver.map_memory(mem.device, replay, range.offset, range.size) {
                driver.free_memory(mem.device, replay);
                return Err(MemoryError::Native(e));
            }
        }

        debug!(memory, replay, size, replay_type, "reconciled deferred allocation");
        mem.replay = Some(replay);
        mem.size = size;
        Ok(replay)
    }

    /// Forget an allocation, unmapping and freeing its native memory.
    pub fn release(&mut self, driver: &mut dyn ReplayDriver, memory: u64) -> Option<ShadowMemory> {
        let mem = self.objects.remove(&memory)?;
        if let Some(replay) = mem.replay {
            if mem.mapped.is_some() {
                driver.unmap_memory(mem.device, replay);
            }
            driver.free_memory(mem.device, replay);
        }
        Some(mem)
    }

    /// Trace handles of every tracked allocation.
    pub fn tracked(&self) -> impl Iterator<Item = u64> + '_ {
        self.objects.keys().copied()
    }
}

/// Grow a pending allocation's shadow to cover `[offset, offset + size)`,
/// keeping whatever earlier mappings wrote.
fn cover(shadow: &mut Option<Shadow>, offset: u64, size: u64) -> Result<(), MemoryError> {
    let end = offset + size;
    let grown = match shadow {
        Some(s) if s.base <= offset && end <= s.end() => return Ok(()),
        Some(s) => {
            let base = s.base.min(offset);
            let mut bytes = zeroed(s.end().max(end) - base)?;
            let at = (s.base - base) as usize;
            bytes[at..at + s.bytes.len()].copy_from_slice(&s.bytes);
            Shadow { base, bytes }
        }
        None => Shadow {
            base: offset,
            bytes: zeroed(size)?,
        },
    };
    *shadow = Some(grown);
    Ok(())
}

/// Zero-filled buffer whose size came from the trace.
fn zeroed(size: u64) -> Result<Vec<u8>, MemoryError> {
    let len = usize::try_from(size).map_err(|_| MemoryError::ShadowTooLarge(size))?;
    let mut bytes = Vec::new();
    bytes
        .try_reserve_exact(len)
        .map_err(|_| MemoryError::ShadowTooLarge(size))?;
    bytes.resize(len, 0);
    Ok(bytes)
}

fn check_range(what: &'static str, offset: u64, size: u64, limit: u64) -> Result<(), MemoryError> {
    match offset.checked_add(size) {
        Some(end) if end <= limit => Ok(()),
        _ => Err(MemoryError::OutOfRange {
            what,
            offset,
            size,
            limit,
        }),
    }
}

/// Size of a flush/invalidate range, checked against the active mapping.
fn resolve_range(mem: &ShadowMemory, offset: u64, size: u64) -> Result<u64, MemoryError> {
    let map = mem.mapped.ok_or(MemoryError::NotMapped)?;
    let map_end = map.offset + map.size;
    if offset < map.offset {
        return Err(MemoryError::OutOfRange {
            what: "mapping",
            offset,
            size,
            limit: map_end,
        });
    }
    let size = if size == WHOLE_SIZE {
        map_end - offset
    } else {
        size
    };
    check_range("mapping", offset, size, map_end)?;
    Ok(size)
}

/// Write a captured payload covering `[offset, offset + size)`. A
/// differential payload only touches the blocks it lists.
fn apply_payload(
    driver: &mut dyn ReplayDriver,
    mem: &mut ShadowMemory,
    offset: u64,
    size: u64,
    data: &[u8],
    diff_mode: bool,
) -> Result<(), MemoryError> {
    if diff_mode && diff::is_diff(data) {
        let blocks = diff::parse_diff(data).map_err(|e| MemoryError::Diff(e.to_string()))?;
        for block in blocks {
            check_range("range", block.offset, block.data.len() as u64, size)?;
            write(driver, mem, offset + block.offset, block.data)?;
        }
        return Ok(());
    }
    let len = (data.len() as u64).min(size) as usize;
    write(driver, mem, offset, &data[..len])
}

fn write(
    driver: &mut dyn ReplayDriver,
    mem: &mut ShadowMemory,
    offset: u64,
    data: &[u8],
) -> Result<(), MemoryError> {
    match (mem.replay, mem.shadow.as_mut()) {
        (Some(replay), _) => driver
            .write_mapped(replay, offset, data)
            .map_err(MemoryError::Native),
        (None, Some(shadow)) => {
            let span = shadow.span(offset, data.len()).ok_or(MemoryError::OutOfRange {
                what: "shadow",
                offset,
                size: data.len() as u64,
                limit: shadow.end(),
            })?;
            shadow.bytes[span].copy_from_slice(data);
            Ok(())
        }
        (None, None) => Err(MemoryError::NotMapped),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::null_driver::NullDriver;

    const DEVICE: u64 = 0xD;

    fn pending(emu: &mut MemoryEmulator) {
        emu.track_pending(0x40, DEVICE, 0x1D, 256, 1);
    }

    #[test]
    fn test_pending_map_uses_shadow() {
        let mut driver = NullDriver::default();
        let mut emu = MemoryEmulator::new(false);
        pending(&mut emu);
        emu.map(&mut driver, 0x40, 16, WHOLE_SIZE).unwrap();
        let mem = emu.get(0x40).unwrap();
        assert!(mem.has_shadow());
        assert_eq!(mem.mapped(), Some(MapRange { offset: 16, size: 240 }));
        assert_eq!(driver.live_allocations(), 0);
    }

    #[test]
    fn test_double_map_rejected() {
        let mut driver = NullDriver::default();
        let mut emu = MemoryEmulator::new(false);
        pending(&mut emu);
        emu.map(&mut driver, 0x40, 0, 16).unwrap();
        assert_eq!(emu.map(&mut driver, 0x40, 0, 16), Err(MemoryError::AlreadyMapped));
    }

    #[test]
    fn test_flush_outside_mapping_rejected() {
        let mut driver = NullDriver::default();
        let mut emu = MemoryEmulator::new(false);
        pending(&mut emu);
        emu.map(&mut driver, 0x40, 0, 64).unwrap();
        let range = HostRange {
            memory: 0x40,
            offset: 32,
            size: 64,
            data: &[],
        };
        let err = emu.flush(&mut driver, DEVICE, &[range]).unwrap_err();
        assert!(matches!(err, MemoryError::OutOfRange { what: "mapping", .. }));
    }

    #[test]
    fn test_diff_payload_touches_only_listed_pages() {
        let mut driver = NullDriver::default();
        let mut emu = MemoryEmulator::new(true);
        pending(&mut emu);
        emu.map(&mut driver, 0x40, 0, 64).unwrap();
        let full = [7u8; 64];
        let range = HostRange {
            memory: 0x40,
            offset: 0,
            size: 64,
            data: &full,
        };
        emu.flush(&mut driver, DEVICE, &[range]).unwrap();

        let mut next = full;
        next[20] = 9;
        let payload = diff::encode_diff(&full, &next, 16);
        let range = HostRange {
            memory: 0x40,
            offset: 0,
            size: 64,
            data: &payload,
        };
        emu.flush(&mut driver, DEVICE, &[range]).unwrap();

        let read = HostRange {
            memory: 0x40,
            offset: 0,
            size: 64,
            data: &[],
        };
        let (_, contents) = emu.invalidate(&mut driver, DEVICE, &[read]).unwrap();
        assert_eq!(contents[0], next.to_vec());
    }

    #[test]
    fn test_reconcile_uploads_shadow_and_keeps_mapping() {
        let mut driver = NullDriver::default();
        let mut emu = MemoryEmulator::new(false);
        pending(&mut emu);
        emu.map(&mut driver, 0x40, 0, 32).unwrap();
        let data = [3u8; 32];
        let range = HostRange {
            memory: 0x40,
            offset: 0,
            size: 32,
            data: &data,
        };
        emu.flush(&mut driver, DEVICE, &[range]).unwrap();

        let replay = emu.reconcile(&mut driver, 0x40, 512, 1).unwrap();
        let mem = emu.get(0x40).unwrap();
        assert!(!mem.is_pending());
        assert!(!mem.has_shadow());
        assert_eq!(mem.size, 512);
        assert_eq!(driver.memory_contents(replay).unwrap()[..32], data);
        assert_eq!(driver.mapped_range(replay), Some((0, 32)));
    }

    #[test]
    fn test_pending_shadow_covers_only_the_mapping() {
        let mut driver = NullDriver::default();
        let mut emu = MemoryEmulator::new(false);
        emu.track_pending(0x42, DEVICE, 0x1D, 64 << 20, 1);
        emu.map(&mut driver, 0x42, 0, 16).unwrap();
        assert_eq!(emu.get(0x42).unwrap().shadow_len(), 16);
    }

    #[test]
    fn test_shadow_grows_and_uploads_at_its_offset() {
        let mut driver = NullDriver::default();
        let mut emu = MemoryEmulator::new(false);
        pending(&mut emu);
        emu.map(&mut driver, 0x40, 64, 32).unwrap();
        emu.unmap(&mut driver, 0x40, &[5u8; 32]).unwrap();
        emu.map(&mut driver, 0x40, 128, 16).unwrap();
        emu.unmap(&mut driver, 0x40, &[6u8; 16]).unwrap();
        assert_eq!(emu.get(0x40).unwrap().shadow_len(), 80);

        let replay = emu.reconcile(&mut driver, 0x40, 256, 1).unwrap();
        let contents = driver.memory_contents(replay).unwrap();
        assert!(contents[..64].iter().all(|&b| b == 0));
        assert!(contents[64..96].iter().all(|&b| b == 5));
        assert!(contents[96..128].iter().all(|&b| b == 0));
        assert!(contents[128..144].iter().all(|&b| b == 6));
        assert_eq!(driver.mapped_range(replay), None);
    }

    #[test]
    fn test_native_allocation_round_trip() {
        let mut driver = NullDriver::default();
        let mut emu = MemoryEmulator::new(false);
        let replay = driver.allocate_memory(DEVICE, 128, 1).unwrap();
        emu.track_allocated(0x41, DEVICE, 0x1D, replay, 128, 1);

        let full: Vec<u8> = (0..128u8).collect();
        emu.map(&mut driver, 0x41, 0, WHOLE_SIZE).unwrap();
        assert_eq!(driver.mapped_range(replay), Some((0, 128)));
        emu.unmap(&mut driver, 0x41, &full).unwrap();
        assert_eq!(driver.mapped_range(replay), None);
        assert_eq!(driver.memory_contents(replay), Some(full.as_slice()));

        emu.map(&mut driver, 0x41, 32, 64).unwrap();
        let patch = [0xAAu8; 16];
        let range = HostRange {
            memory: 0x41,
            offset: 48,
            size: 16,
            data: &patch,
        };
        assert_eq!(emu.flush(&mut driver, DEVICE, &[range]).unwrap(), vk::Result::SUCCESS);

        let read = HostRange {
            memory: 0x41,
            offset: 32,
            size: WHOLE_SIZE,
            data: &[],
        };
        let (result, contents) = emu.invalidate(&mut driver, DEVICE, &[read]).unwrap();
        assert_eq!(result, vk::Result::SUCCESS);
        let mut expected = full[32..96].to_vec();
        expected[16..32].copy_from_slice(&patch);
        assert_eq!(contents[0], expected);
        assert!(!emu.get(0x41).unwrap().has_shadow());
    }

    #[test]
    fn test_release_frees_native_memory() {
        let mut driver = NullDriver::default();
        let mut emu = MemoryEmulator::new(false);
        let replay = driver.allocate_memory(DEVICE, 128, 1).unwrap();
        emu.track_allocated(0x41, DEVICE, 0x1D, replay, 128, 1);
        emu.map(&mut driver, 0x41, 0, WHOLE_SIZE).unwrap();
        assert!(emu.release(&mut driver, 0x41).is_some());
        assert_eq!(driver.live_allocations(), 0);
        assert!(emu.is_empty());
    }
}
