use std::collections::HashMap;

use vkr_core::{CompatTranslator, DeferPolicy, ObjectMap, ReplayConfig};
use vkr_trace::{ObjectKind, NULL_HANDLE};

use crate::memory::MemoryEmulator;

/// The trace-side objects a call's index fields are relative to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Anchor {
    pub device: Option<u64>,
    pub physical_device: Option<u64>,
}

/// A physical device as seen by both sides of the replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevicePair {
    pub trace: u64,
    pub replay: u64,
}

/// All state one replay session owns. Nothing here is global: every lookup
/// goes through the session-local trace handles.
pub struct ReplayContext {
    pub objects: ObjectMap,
    pub compat: CompatTranslator,
    pub memory: MemoryEmulator,
    /// Trace device -> trace physical device it was created from.
    devices: HashMap<u64, u64>,
    /// Trace handle -> trace device that created it.
    owners: HashMap<(ObjectKind, u64), u64>,
    /// (trace swapchain, trace image index) -> replay image index.
    acquired: HashMap<(u64, u32), u32>,
    pub compatibility_mode: bool,
    pub physical_device_index: Option<u32>,
    pub defer_allocations: DeferPolicy,
}

impl ReplayContext {
    pub fn new(config: &ReplayConfig) -> Self {
        Self {
            objects: ObjectMap::new(),
            compat: CompatTranslator::new(),
            memory: MemoryEmulator::new(config.memory.dirty_page_diff),
            devices: HashMap::new(),
            owners: HashMap::new(),
            acquired: HashMap::new(),
            compatibility_mode: config.replay.compatibility_mode,
            physical_device_index: config.replay.physical_device_index,
            defer_allocations: config.memory.defer_allocations,
        }
    }

    pub fn add_device(&mut self, device: u64, physical_device: u64) {
        self.devices.insert(device, physical_device);
    }

    pub fn remove_device(&mut self, device: u64) {
        self.devices.remove(&device);
        self.owners.retain(|_, owner| *owner != device);
    }

    pub fn set_owner(&mut self, kind: ObjectKind, handle: u64, device: u64) {
        self.owners.insert((kind, handle), device);
    }

    pub fn clear_owner(&mut self, kind: ObjectKind, handle: u64) {
        self.owners.remove(&(kind, handle));
    }

    pub fn owner(&self, kind: ObjectKind, handle: u64) -> Option<u64> {
        self.owners.get(&(kind, handle)).copied()
    }

    /// Work out which trace device and physical device `handle` belongs to.
    pub fn anchor_for(&self, kind: ObjectKind, handle: u64) -> Anchor {
        if handle == NULL_HANDLE {
            return Anchor::default();
        }
        let device = match kind {
            ObjectKind::PhysicalDevice => {
                return Anchor {
                    device: None,
                    physical_device: Some(handle),
                }
            }
            ObjectKind::Device => Some(handle),
            _ => self.owner(kind, handle),
        };
        Anchor {
            device,
            physical_device: device.and_then(|d| self.devices.get(&d).copied()),
        }
    }

    /// Trace and replay physical device behind an anchor, if both are known.
    pub fn device_pair(&self, anchor: Anchor) -> Option<DevicePair> {
        let trace = anchor.physical_device?;
        let replay = self.objects.remap(ObjectKind::PhysicalDevice, trace);
        (replay != NULL_HANDLE).then_some(DevicePair { trace, replay })
    }

    pub fn record_acquire(&mut self, swapchain: u64, trace_index: u32, replay_index: u32) {
        self.acquired.insert((swapchain, trace_index), replay_index);
    }

    pub fn acquired_index(&self, swapchain: u64, trace_index: u32) -> Option<u32> {
        self.acquired.get(&(swapchain, trace_index)).copied()
    }

    pub fn forget_swapchain(&mut self, swapchain: u64) {
        self.acquired.retain(|&(s, _), _| s != swapchain);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anchor_follows_owner_chain() {
        let mut ctx = ReplayContext::new(&ReplayConfig::default());
        ctx.objects.add(ObjectKind::PhysicalDevice, 0x10, 0x910);
        ctx.add_device(0x20, 0x10);
        ctx.set_owner(ObjectKind::CommandPool, 0x30, 0x20);

        let anchor = ctx.anchor_for(ObjectKind::CommandPool, 0x30);
        assert_eq!(anchor.device, Some(0x20));
        assert_eq!(
            ctx.device_pair(anchor),
            Some(DevicePair {
                trace: 0x10,
                replay: 0x910
            })
        );
    }

    #[test]
    fn test_unowned_handle_has_no_pair() {
        let ctx = ReplayContext::new(&ReplayConfig::default());
        let anchor = ctx.anchor_for(ObjectKind::Queue, 0x99);
        assert_eq!(anchor, Anchor::default());
        assert_eq!(ctx.device_pair(anchor), None);
    }

    #[test]
    fn test_removing_device_drops_its_owners() {
        let mut ctx = ReplayContext::new(&ReplayConfig::default());
        ctx.add_device(0x20, 0x10);
        ctx.set_owner(ObjectKind::Queue, 0x40, 0x20);
        ctx.remove_device(0x20);
        assert_eq!(ctx.owner(ObjectKind::Queue, 0x40), None);
    }
}
