//! Queue-family and memory-type index translation.
//!
//! A trace records indices into the capture device's queue-family and
//! memory-type lists. The replay device may order those lists differently or
//! offer different entries, so every index is resolved by capability flags:
//! exact match first, then the first superset, then (memory only) the first
//! host-visible coherent type.

use std::collections::HashMap;
use std::fmt;

use tracing::{debug, warn};

use crate::error::ResolveError;

/// "Ignored" queue-family sentinel (`VK_QUEUE_FAMILY_IGNORED`).
pub const QUEUE_FAMILY_IGNORED: u32 = !0;
/// `VK_QUEUE_FAMILY_EXTERNAL`.
pub const QUEUE_FAMILY_EXTERNAL: u32 = !1;
/// `VK_QUEUE_FAMILY_FOREIGN_EXT`.
pub const QUEUE_FAMILY_FOREIGN: u32 = !2;
/// No memory type selected.
pub const MEMORY_TYPE_NONE: u32 = !0;

pub const MEMORY_PROPERTY_HOST_VISIBLE: u32 = 0x2;
pub const MEMORY_PROPERTY_HOST_COHERENT: u32 = 0x4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexSpace {
    QueueFamily,
    MemoryType,
}

impl IndexSpace {
    fn is_sentinel(self, index: u32) -> bool {
        match self {
            IndexSpace::QueueFamily => matches!(
                index,
                QUEUE_FAMILY_IGNORED | QUEUE_FAMILY_EXTERNAL | QUEUE_FAMILY_FOREIGN
            ),
            IndexSpace::MemoryType => index == MEMORY_TYPE_NONE,
        }
    }
}

impl fmt::Display for IndexSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexSpace::QueueFamily => f.write_str("queue family"),
            IndexSpace::MemoryType => f.write_str("memory type"),
        }
    }
}

/// Which rule produced a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Match {
    /// Sentinel index, passed through untouched.
    Passthrough,
    Exact,
    Superset,
    /// Memory only: first host-visible, host-coherent type.
    HostFallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub index: u32,
    pub rule: Match,
}

type TableKey = (IndexSpace, u64);
type MemoKey = (IndexSpace, u64, u64, u32);

/// Per-physical-device capability tables for both sides of the replay.
#[derive(Default)]
pub struct CompatTranslator {
    trace: HashMap<TableKey, Vec<u32>>,
    replay: HashMap<TableKey, Vec<u32>>,
    memo: HashMap<MemoKey, Resolution>,
}

impl CompatTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the flags a trace-time enumeration reported. Tables only grow:
    /// a report no larger than what is already known is ignored. Returns
    /// whether the table changed.
    pub fn record_trace(&mut self, space: IndexSpace, device: u64, flags: Vec<u32>) -> bool {
        let changed = Self::record(&mut self.trace, space, device, flags);
        if changed {
            self.memo
                .retain(|&(s, trace_dev, _, _), _| !(s == space && trace_dev == device));
        }
        changed
    }

    /// Record the flags the replay device reports.
    pub fn record_replay(&mut self, space: IndexSpace, device: u64, flags: Vec<u32>) -> bool {
        let changed = Self::record(&mut self.replay, space, device, flags);
        if changed {
            self.memo
                .retain(|&(s, _, replay_dev, _), _| !(s == space && replay_dev == device));
        }
        changed
    }

    fn record(
        tables: &mut HashMap<TableKey, Vec<u32>>,
        space: IndexSpace,
        device: u64,
        flags: Vec<u32>,
    ) -> bool {
        match tables.get(&(space, device)) {
            Some(known) if known.len() >= flags.len() => false,
            _ => {
                debug!(%space, device, entries = flags.len(), "recorded capability table");
                tables.insert((space, device), flags);
                true
            }
        }
    }

    pub fn trace_flags(&self, space: IndexSpace, device: u64) -> Option<&[u32]> {
        self.trace.get(&(space, device)).map(Vec::as_slice)
    }

    pub fn replay_flags(&self, space: IndexSpace, device: u64) -> Option<&[u32]> {
        self.replay.get(&(space, device)).map(Vec::as_slice)
    }

    pub fn resolve_queue_family(
        &mut self,
        trace_device: u64,
        replay_device: u64,
        index: u32,
    ) -> Result<u32, ResolveError> {
        self.resolve(IndexSpace::QueueFamily, trace_device, replay_device, index)
            .map(|r| r.index)
    }

    pub fn resolve_memory_type(
        &mut self,
        trace_device: u64,
        replay_device: u64,
        index: u32,
    ) -> Result<u32, ResolveError> {
        self.resolve(IndexSpace::MemoryType, trace_device, replay_device, index)
            .map(|r| r.index)
    }

    /// Resolve `index` from the trace device's space into the replay device's.
    /// Results are memoized until either table grows.
    pub fn resolve(
        &mut self,
        space: IndexSpace,
        trace_device: u64,
        replay_device: u64,
        index: u32,
    ) -> Result<Resolution, ResolveError> {
        if space.is_sentinel(index) {
            return Ok(Resolution {
                index,
                rule: Match::Passthrough,
            });
        }
        let key = (space, trace_device, replay_device, index);
        if let Some(&hit) = self.memo.get(&key) {
            return Ok(hit);
        }

        let resolution = self.search(space, trace_device, replay_device, index)?;
        if resolution.index != index || resolution.rule != Match::Exact {
            debug!(
                %space,
                trace_index = index,
                replay_index = resolution.index,
                rule = ?resolution.rule,
                "translated index"
            );
        }
        self.memo.insert(key, resolution);
        Ok(resolution)
    }

    fn search(
        &self,
        space: IndexSpace,
        trace_device: u64,
        replay_device: u64,
        index: u32,
    ) -> Result<Resolution, ResolveError> {
        let trace = self
            .trace_flags(space, trace_device)
            .ok_or(ResolveError::UnknownDevice {
                space,
                device: trace_device,
            })?;
        let replay = self
            .replay_flags(space, replay_device)
            .ok_or(ResolveError::UnknownDevice {
                space,
                device: replay_device,
            })?;
        let flags = *trace
            .get(index as usize)
            .ok_or(ResolveError::IndexOutOfRange {
                space,
                index,
                len: trace.len(),
            })?;

        let exact: Vec<u32> = (0..replay.len() as u32)
            .filter(|&j| replay[j as usize] == flags)
            .collect();
        match exact.as_slice() {
            [] => {}
            [only] => {
                return Ok(Resolution {
                    index: *only,
                    rule: Match::Exact,
                })
            }
            several => {
                let chosen = if several.contains(&index) {
                    index
                } else {
                    several[0]
                };
                warn!(
                    %space,
                    trace_index = index,
                    candidates = ?several,
                    chosen,
                    "several replay indices match trace flags exactly"
                );
                return Ok(Resolution {
                    index: chosen,
                    rule: Match::Exact,
                });
            }
        }

        if let Some(j) = replay.iter().position(|&f| f & flags == flags) {
            return Ok(Resolution {
                index: j as u32,
                rule: Match::Superset,
            });
        }

        if space == IndexSpace::MemoryType {
            let host = MEMORY_PROPERTY_HOST_VISIBLE | MEMORY_PROPERTY_HOST_COHERENT;
            if let Some(j) = replay.iter().position(|&f| f & host == host) {
                return Ok(Resolution {
                    index: j as u32,
                    rule: Match::HostFallback,
                });
            }
        }

        Err(ResolveError::NoCompatibleIndex {
            space,
            index,
            flags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACE_PD: u64 = 0x100;
    const REPLAY_PD: u64 = 0x900;

    fn translator(space: IndexSpace, trace: &[u32], replay: &[u32]) -> CompatTranslator {
        let mut t = CompatTranslator::new();
        t.record_trace(space, TRACE_PD, trace.to_vec());
        t.record_replay(space, REPLAY_PD, replay.to_vec());
        t
    }

    #[test]
    fn test_exact_match_wins_over_superset() {
        // replay[0] is a superset of trace[1]; replay[2] is the exact match.
        let mut t = translator(IndexSpace::MemoryType, &[0x1, 0x6], &[0x7, 0x1, 0x6]);
        let r = t.resolve(IndexSpace::MemoryType, TRACE_PD, REPLAY_PD, 1).unwrap();
        assert_eq!(r, Resolution { index: 2, rule: Match::Exact });
    }

    #[test]
    fn test_superset_then_host_fallback() {
        let mut t = translator(IndexSpace::MemoryType, &[0x1, 0x8], &[0x6, 0x3]);
        let r = t.resolve(IndexSpace::MemoryType, TRACE_PD, REPLAY_PD, 0).unwrap();
        assert_eq!(r, Resolution { index: 1, rule: Match::Superset });
        let r = t.resolve(IndexSpace::MemoryType, TRACE_PD, REPLAY_PD, 1).unwrap();
        assert_eq!(r, Resolution { index: 0, rule: Match::HostFallback });
    }

    #[test]
    fn test_queue_family_has_no_host_fallback() {
        let mut t = translator(IndexSpace::QueueFamily, &[0x8], &[0x1, 0x2]);
        let err = t.resolve_queue_family(TRACE_PD, REPLAY_PD, 0).unwrap_err();
        assert!(matches!(err, ResolveError::NoCompatibleIndex { index: 0, flags: 0x8, .. }));
    }

    #[test]
    fn test_tie_prefers_trace_index() {
        let mut t = translator(IndexSpace::QueueFamily, &[0x3, 0x3], &[0x3, 0x3, 0x3]);
        assert_eq!(t.resolve_queue_family(TRACE_PD, REPLAY_PD, 1), Ok(1));
        let mut t = translator(IndexSpace::QueueFamily, &[0x1, 0x1, 0x1, 0x3], &[0x3, 0x3]);
        assert_eq!(t.resolve_queue_family(TRACE_PD, REPLAY_PD, 3), Ok(0));
    }

    #[test]
    fn test_sentinels_pass_through_without_tables() {
        let mut t = CompatTranslator::new();
        for idx in [QUEUE_FAMILY_IGNORED, QUEUE_FAMILY_EXTERNAL, QUEUE_FAMILY_FOREIGN] {
            assert_eq!(t.resolve_queue_family(1, 2, idx), Ok(idx));
        }
        assert_eq!(t.resolve_memory_type(1, 2, MEMORY_TYPE_NONE), Ok(MEMORY_TYPE_NONE));
    }

    #[test]
    fn test_unknown_device_before_enumeration() {
        let mut t = CompatTranslator::new();
        t.record_trace(IndexSpace::QueueFamily, TRACE_PD, vec![0x1]);
        let err = t.resolve_queue_family(TRACE_PD, REPLAY_PD, 0).unwrap_err();
        assert_eq!(
            err,
            ResolveError::UnknownDevice { space: IndexSpace::QueueFamily, device: REPLAY_PD }
        );
    }

    #[test]
    fn test_out_of_range_index() {
        let mut t = translator(IndexSpace::MemoryType, &[0x1], &[0x1]);
        let err = t.resolve_memory_type(TRACE_PD, REPLAY_PD, 4).unwrap_err();
        assert!(matches!(err, ResolveError::IndexOutOfRange { index: 4, len: 1, .. }));
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let mut t = translator(IndexSpace::MemoryType, &[0x1, 0x6, 0x7], &[0x7, 0x6, 0x1]);
        for idx in 0..3 {
            let first = t.resolve(IndexSpace::MemoryType, TRACE_PD, REPLAY_PD, idx);
            let second = t.resolve(IndexSpace::MemoryType, TRACE_PD, REPLAY_PD, idx);
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_tables_only_grow() {
        let mut t = translator(IndexSpace::MemoryType, &[0x1, 0x6], &[0x6, 0x1]);
        assert_eq!(t.resolve_memory_type(TRACE_PD, REPLAY_PD, 0), Ok(1));

        assert!(!t.record_replay(IndexSpace::MemoryType, REPLAY_PD, vec![0x1]));
        assert_eq!(t.replay_flags(IndexSpace::MemoryType, REPLAY_PD), Some(&[0x6, 0x1][..]));

        assert!(t.record_replay(IndexSpace::MemoryType, REPLAY_PD, vec![0x7, 0x6, 0x1]));
        assert_eq!(t.resolve_memory_type(TRACE_PD, REPLAY_PD, 0), Ok(2));
    }
}
