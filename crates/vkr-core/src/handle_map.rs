use std::collections::HashMap;

use vkr_trace::{ObjectKind, NULL_HANDLE};

/// Result of looking up a trace handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// The trace handle was null; the call legitimately passed no object.
    Null,
    Mapped(u64),
    /// Non-null trace handle with no live replay counterpart.
    Missing,
}

/// Trace handle -> replay handle, one table per object category.
///
/// The map never owns the native objects it names. Destroying them is the
/// destroy call's job; the map only forgets the pairing afterwards.
pub struct ObjectMap {
    tables: Vec<HashMap<u64, u64>>,
}

impl ObjectMap {
    pub fn new() -> Self {
        Self {
            tables: (0..ObjectKind::COUNT).map(|_| HashMap::new()).collect(),
        }
    }

    fn table(&self, kind: ObjectKind) -> &HashMap<u64, u64> {
        &self.tables[kind.index()]
    }

    fn table_mut(&mut self, kind: ObjectKind) -> &mut HashMap<u64, u64> {
        &mut self.tables[kind.index()]
    }

    /// Record a created object. A reused trace handle silently replaces the
    /// old pairing; the previous replay handle is returned.
    pub fn add(&mut self, kind: ObjectKind, trace: u64, replay: u64) -> Option<u64> {
        self.table_mut(kind).insert(trace, replay)
    }

    pub fn remove(&mut self, kind: ObjectKind, trace: u64) -> Option<u64> {
        self.table_mut(kind).remove(&trace)
    }

    /// Replay handle for `trace`, or [`NULL_HANDLE`] when there is none.
    /// Use [`ObjectMap::lookup`] to tell a null input from a missing one.
    pub fn remap(&self, kind: ObjectKind, trace: u64) -> u64 {
        match self.lookup(kind, trace) {
            Lookup::Mapped(replay) => replay,
            Lookup::Null | Lookup::Missing => NULL_HANDLE,
        }
    }

    pub fn lookup(&self, kind: ObjectKind, trace: u64) -> Lookup {
        if trace == NULL_HANDLE {
            return Lookup::Null;
        }
        match self.table(kind).get(&trace) {
            Some(&replay) => Lookup::Mapped(replay),
            None => Lookup::Missing,
        }
    }

    pub fn contains(&self, kind: ObjectKind, trace: u64) -> bool {
        self.table(kind).contains_key(&trace)
    }

    /// Live trace handles of one category.
    pub fn trace_handles(&self, kind: ObjectKind) -> impl Iterator<Item = u64> + '_ {
        self.table(kind).keys().copied()
    }

    pub fn len_of(&self, kind: ObjectKind) -> usize {
        self.table(kind).len()
    }

    /// Total number of live pairings across all categories.
    pub fn len(&self) -> usize {
        self.tables.iter().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.iter().all(HashMap::is_empty)
    }

    pub fn clear(&mut self) {
        for table in &mut self.tables {
            table.clear();
        }
    }
}

impl Default for ObjectMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories_are_disjoint() {
        let mut map = ObjectMap::new();
        map.add(ObjectKind::Buffer, 0x10, 0xB0);
        map.add(ObjectKind::Image, 0x10, 0x10B0);
        assert_eq!(map.remap(ObjectKind::Buffer, 0x10), 0xB0);
        assert_eq!(map.remap(ObjectKind::Image, 0x10), 0x10B0);
        assert_eq!(map.lookup(ObjectKind::Sampler, 0x10), Lookup::Missing);
    }

    #[test]
    fn test_reused_trace_handle_overwrites() {
        let mut map = ObjectMap::new();
        assert_eq!(map.add(ObjectKind::Fence, 7, 100), None);
        assert_eq!(map.add(ObjectKind::Fence, 7, 200), Some(100));
        assert_eq!(map.remap(ObjectKind::Fence, 7), 200);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_null_distinct_from_missing() {
        let map = ObjectMap::new();
        assert_eq!(map.lookup(ObjectKind::Fence, NULL_HANDLE), Lookup::Null);
        assert_eq!(map.lookup(ObjectKind::Fence, 3), Lookup::Missing);
        assert_eq!(map.remap(ObjectKind::Fence, NULL_HANDLE), NULL_HANDLE);
    }
}
