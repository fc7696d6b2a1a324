//! A driver that needs no GPU.
//!
//! Handles are fabricated, memory lives on the host and every call is
//! recorded. Handles it is handed but never issued are collected as
//! "foreign": a correct dispatch core never produces any.

use std::collections::{HashMap, HashSet};

use ash::vk;
use tracing::trace;
use vkr_trace::{EntryPoint, Fields, FieldKind, NULL_HANDLE};

use crate::driver::{
    Call, DeviceIdentity, Invocation, MappedRange, MemoryRequirements, ReplayDriver,
};

const HANDLE_BASE: u64 = 0x7E00_0000_0000;
const REQUIREMENT_ALIGNMENT: u64 = 256;

/// What the fake GPU reports.
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    pub physical_devices: usize,
    pub queue_family_flags: Vec<u32>,
    pub memory_type_flags: Vec<u32>,
    pub identity: DeviceIdentity,
    pub swapchain_images: usize,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            physical_devices: 1,
            // graphics|compute|transfer, then transfer-only
            queue_family_flags: vec![0x7, 0x4],
            // device-local, host-visible|coherent, all three, visible|coherent|cached
            memory_type_flags: vec![0x1, 0x6, 0x7, 0xE],
            identity: DeviceIdentity {
                vendor_id: 0x10DE,
                device_id: 0x2684,
                driver_version: 0x0220_8000,
                api_version: vk::make_api_version(0, 1, 3, 0),
                name: "vkreplay null device".into(),
            },
            swapchain_images: 3,
        }
    }
}

/// A handle the driver was asked to use but never created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignHandle {
    pub entry: EntryPoint,
    pub field: &'static str,
    pub handle: u64,
}

struct HostAllocation {
    data: Vec<u8>,
    memory_type: u32,
    mapped: Option<(u64, u64)>,
}

struct Swapchain {
    images: Vec<u64>,
    next: usize,
}

pub struct NullDriver {
    profile: DeviceProfile,
    next_handle: u64,
    live: HashSet<u64>,
    physical_devices: Vec<u64>,
    resource_sizes: HashMap<u64, u64>,
    allocations: HashMap<u64, HostAllocation>,
    swapchains: HashMap<u64, Swapchain>,
    fail_on: HashMap<EntryPoint, vk::Result>,
    fail_next: HashMap<EntryPoint, vk::Result>,
    calls: Vec<EntryPoint>,
    foreign: Vec<ForeignHandle>,
}

impl Default for NullDriver {
    fn default() -> Self {
        Self::new(DeviceProfile::default())
    }
}

impl NullDriver {
    pub fn new(profile: DeviceProfile) -> Self {
        let mut driver = Self {
            profile,
            next_handle: HANDLE_BASE,
            live: HashSet::new(),
            physical_devices: Vec::new(),
            resource_sizes: HashMap::new(),
            allocations: HashMap::new(),
            swapchains: HashMap::new(),
            fail_on: HashMap::new(),
            fail_next: HashMap::new(),
            calls: Vec::new(),
            foreign: Vec::new(),
        };
        driver.physical_devices = (0..driver.profile.physical_devices)
            .map(|_| driver.issue())
            .collect();
        driver
    }

    /// Make every later call to `entry` return `result`.
    pub fn fail_on(&mut self, entry: EntryPoint, result: vk::Result) {
        self.fail_on.insert(entry, result);
    }

    /// Make only the next call to `entry` return `result`.
    pub fn fail_next(&mut self, entry: EntryPoint, result: vk::Result) {
        self.fail_next.insert(entry, result);
    }

    pub fn calls(&self) -> &[EntryPoint] {
        &self.calls
    }

    pub fn count_calls(&self, entry: EntryPoint) -> usize {
        self.calls.iter().filter(|&&e| e == entry).count()
    }

    pub fn foreign(&self) -> &[ForeignHandle] {
        &self.foreign
    }

    pub fn physical_devices(&self) -> &[u64] {
        &self.physical_devices
    }

    pub fn is_live(&self, handle: u64) -> bool {
        self.live.contains(&handle)
    }

    pub fn live_allocations(&self) -> usize {
        self.allocations.len()
    }

    pub fn memory_contents(&self, memory: u64) -> Option<&[u8]> {
        self.allocations.get(&memory).map(|a| a.data.as_slice())
    }

    pub fn memory_type_of(&self, memory: u64) -> Option<u32> {
        self.allocations.get(&memory).map(|a| a.memory_type)
    }

    pub fn mapped_range(&self, memory: u64) -> Option<(u64, u64)> {
        self.allocations.get(&memory).and_then(|a| a.mapped)
    }

    fn issue(&mut self) -> u64 {
        self.next_handle += 0x10;
        self.live.insert(self.next_handle);
        self.next_handle
    }

    fn all_memory_types(&self) -> u32 {
        match self.profile.memory_type_flags.len() {
            n if n >= 32 => u32::MAX,
            n => (1u32 << n) - 1,
        }
    }

    fn requirements(&self, resource: u64) -> MemoryRequirements {
        let size = self.resource_sizes.get(&resource).copied().unwrap_or(0);
        MemoryRequirements {
            size: size.div_ceil(REQUIREMENT_ALIGNMENT) * REQUIREMENT_ALIGNMENT,
            alignment: REQUIREMENT_ALIGNMENT,
            memory_type_bits: self.all_memory_types(),
        }
    }

    fn check_foreign(&mut self, entry: EntryPoint, fields: Fields<'_>) {
        for field in fields.schema() {
            let handles = match field.kind {
                FieldKind::Handle(_) | FieldKind::Destroy(_) => vec![fields.value(field.name)],
                FieldKind::Handles(_) | FieldKind::DestroyMany(_) => fields.values(field.name),
                FieldKind::Records(_) => {
                    for record in fields.records(field.name) {
                        self.check_foreign(entry, record);
                    }
                    continue;
                }
                _ => continue,
            };
            for handle in handles {
                if handle != NULL_HANDLE && !self.live.contains(&handle) {
                    self.foreign.push(ForeignHandle {
                        entry,
                        field: field.name,
                        handle,
                    });
                }
            }
        }
    }

    fn mapped(&mut self, memory: u64, offset: u64, len: u64) -> Result<&mut HostAllocation, vk::Result> {
        let alloc = self
            .allocations
            .get_mut(&memory)
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        let (start, size) = alloc.mapped.ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        let end = offset.checked_add(len).ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        if offset < start || end > start + size {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        Ok(alloc)
    }
}

impl ReplayDriver for NullDriver {
    fn name(&self) -> &'static str {
        "null"
    }

    fn invoke(&mut self, call: &Call<'_>) -> Invocation {
        let entry = call.entry;
        let fields = call.fields;
        self.calls.push(entry);
        self.check_foreign(entry, fields);
        trace!(entry = entry.name(), ?fields, "null driver call");

        if let Some(result) = self.fail_next.remove(&entry) {
            return Invocation::with_result(result);
        }
        if let Some(&result) = self.fail_on.get(&entry) {
            return Invocation::with_result(result);
        }

        match entry {
            EntryPoint::EnumeratePhysicalDevices => {
                return Invocation::created(self.physical_devices.clone())
            }
            EntryPoint::GetSwapchainImagesKhr => {
                let images = self
                    .swapchains
                    .get(&fields.value("swapchain"))
                    .map(|s| s.images.clone())
                    .unwrap_or_default();
                return Invocation::created(images);
            }
            EntryPoint::AcquireNextImageKhr => {
                let Some(swapchain) = self.swapchains.get_mut(&fields.value("swapchain")) else {
                    return Invocation::with_result(vk::Result::ERROR_SURFACE_LOST_KHR);
                };
                let index = swapchain.next;
                swapchain.next = (index + 1) % swapchain.images.len().max(1);
                return Invocation::outputs(vec![index as u64]);
            }
            EntryPoint::GetBufferMemoryRequirements => {
                let r = self.requirements(fields.value("buffer"));
                return Invocation::outputs(vec![r.size, r.alignment, u64::from(r.memory_type_bits)]);
            }
            EntryPoint::GetImageMemoryRequirements => {
                let r = self.requirements(fields.value("image"));
                return Invocation::outputs(vec![r.size, r.alignment, u64::from(r.memory_type_bits)]);
            }
            _ => {}
        }

        let mut created = Vec::new();
        for field in fields.schema() {
            match field.kind {
                FieldKind::Create(_) => created.push(self.issue()),
                FieldKind::CreateMany(_) => {
                    for _ in 0..fields.count(field.name) {
                        created.push(self.issue());
                    }
                }
                FieldKind::Destroy(_) => {
                    self.live.remove(&fields.value(field.name));
                }
                FieldKind::DestroyMany(_) => {
                    for handle in fields.values(field.name) {
                        self.live.remove(&handle);
                    }
                }
                _ => {}
            }
        }

        match entry {
            EntryPoint::CreateBuffer => {
                if let Some(&buffer) = created.first() {
                    self.resource_sizes.insert(buffer, fields.value("size"));
                }
            }
            EntryPoint::CreateImage => {
                if let Some(&image) = created.first() {
                    let texels = fields.value("width") * fields.value("height") * fields.value("depth").max(1);
                    self.resource_sizes.insert(image, texels * 4);
                }
            }
            EntryPoint::CreateSwapchainKhr => {
                if let Some(&swapchain) = created.first() {
                    let images = (0..self.profile.swapchain_images)
                        .map(|_| self.issue())
                        .collect();
                    self.swapchains.insert(swapchain, Swapchain { images, next: 0 });
                }
            }
            EntryPoint::DestroySwapchainKhr => {
                if let Some(swapchain) = self.swapchains.remove(&fields.value("swapchain")) {
                    for image in swapchain.images {
                        self.live.remove(&image);
                    }
                }
            }
            _ => {}
        }
        Invocation::created(created)
    }

    fn queue_family_flags(&mut self, _physical_device: u64) -> Vec<u32> {
        self.profile.queue_family_flags.clone()
    }

    fn memory_type_flags(&mut self, _physical_device: u64) -> Vec<u32> {
        self.profile.memory_type_flags.clone()
    }

    fn device_identity(&mut self, physical_device: u64) -> Option<DeviceIdentity> {
        self.physical_devices
            .contains(&physical_device)
            .then(|| self.profile.identity.clone())
    }

    fn buffer_memory_requirements(&mut self, _device: u64, buffer: u64) -> MemoryRequirements {
        self.requirements(buffer)
    }

    fn image_memory_requirements(&mut self, _device: u64, image: u64) -> MemoryRequirements {
        self.requirements(image)
    }

    fn allocate_memory(&mut self, _device: u64, size: u64, memory_type: u32) -> Result<u64, vk::Result> {
        if memory_type as usize >= self.profile.memory_type_flags.len() {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        let memory = self.issue();
        self.allocations.insert(
            memory,
            HostAllocation {
                data: vec![0; size as usize],
                memory_type,
                mapped: None,
            },
        );
        Ok(memory)
    }

    fn free_memory(&mut self, _device: u64, memory: u64) {
        self.allocations.remove(&memory);
        self.live.remove(&memory);
    }

    fn map_memory(&mut self, _device: u64, memory: u64, offset: u64, size: u64) -> Result<(), vk::Result> {
        let flags = &self.profile.memory_type_flags;
        let alloc = self
            .allocations
            .get_mut(&memory)
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        let host_visible = flags
            .get(alloc.memory_type as usize)
            .is_some_and(|f| f & vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() != 0);
        let in_range = offset
            .checked_add(size)
            .is_some_and(|end| end <= alloc.data.len() as u64);
        if !host_visible || !in_range || alloc.mapped.is_some() {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        alloc.mapped = Some((offset, size));
        Ok(())
    }

    fn unmap_memory(&mut self, _device: u64, memory: u64) {
        if let Some(alloc) = self.allocations.get_mut(&memory) {
            alloc.mapped = None;
        }
    }

    fn write_mapped(&mut self, memory: u64, offset: u64, data: &[u8]) -> Result<(), vk::Result> {
        let alloc = self.mapped(memory, offset, data.len() as u64)?;
        let start = offset as usize;
        alloc.data[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_mapped(&mut self, memory: u64, offset: u64, len: usize) -> Result<Vec<u8>, vk::Result> {
        let alloc = self.mapped(memory, offset, len as u64)?;
        let start = offset as usize;
        Ok(alloc.data[start..start + len].to_vec())
    }

    fn flush_mapped(&mut self, _device: u64, ranges: &[MappedRange]) -> vk::Result {
        let all_mapped = ranges
            .iter()
            .all(|r| self.allocations.get(&r.memory).is_some_and(|a| a.mapped.is_some()));
        if all_mapped {
            vk::Result::SUCCESS
        } else {
            vk::Result::ERROR_MEMORY_MAP_FAILED
        }
    }

    fn invalidate_mapped(&mut self, device: u64, ranges: &[MappedRange]) -> vk::Result {
        self.flush_mapped(device, ranges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vkr_trace::writer::{encode_body, Arg};

    #[test]
    fn test_foreign_handles_are_recorded() {
        let mut driver = NullDriver::default();
        let body = encode_body(0, &[Arg::Value(0xDEAD)]);
        let fields = Fields::top(&body, EntryPoint::EndCommandBuffer).unwrap();
        driver.invoke(&Call {
            entry: EntryPoint::EndCommandBuffer,
            fields,
        });
        assert_eq!(
            driver.foreign(),
            &[ForeignHandle {
                entry: EntryPoint::EndCommandBuffer,
                field: "command_buffer",
                handle: 0xDEAD
            }]
        );
    }

    #[test]
    fn test_injected_failure() {
        let mut driver = NullDriver::default();
        driver.fail_on(EntryPoint::CreateFence, vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        let body = encode_body(0, &[Arg::Value(0), Arg::Value(0), Arg::Value(0x1)]);
        let fields = Fields::top(&body, EntryPoint::CreateFence).unwrap();
        let inv = driver.invoke(&Call {
            entry: EntryPoint::CreateFence,
            fields,
        });
        assert_eq!(inv.result, vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        assert!(inv.created.is_empty());
        assert_eq!(driver.count_calls(EntryPoint::CreateFence), 1);
    }

    #[test]
    fn test_device_local_memory_cannot_map() {
        let mut driver = NullDriver::default();
        let memory = driver.allocate_memory(0, 64, 0).unwrap();
        assert_eq!(
            driver.map_memory(0, memory, 0, 64),
            Err(vk::Result::ERROR_MEMORY_MAP_FAILED)
        );
    }

    #[test]
    fn test_writes_outside_mapping_rejected() {
        let mut driver = NullDriver::default();
        let memory = driver.allocate_memory(0, 64, 1).unwrap();
        driver.map_memory(0, memory, 16, 16).unwrap();
        assert!(driver.write_mapped(memory, 16, &[1; 16]).is_ok());
        assert!(driver.write_mapped(memory, 8, &[1; 4]).is_err());
        assert!(driver.write_mapped(memory, 24, &[1; 16]).is_err());
        assert_eq!(driver.read_mapped(memory, 16, 4).unwrap(), vec![1; 4]);
    }
}
