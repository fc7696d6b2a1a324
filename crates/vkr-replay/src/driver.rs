//! The seam between the dispatch core and whatever executes calls.
//!
//! The dispatch core hands a driver calls whose handle and index fields
//! already hold replay-side values. Memory mapping and property queries get
//! dedicated methods because the core needs their results directly.

use ash::vk;
use vkr_trace::{EntryPoint, Fields};

/// A call ready to execute: entry point plus its remapped parameters.
pub struct Call<'a> {
    pub entry: EntryPoint,
    pub fields: Fields<'a>,
}

/// What executing a call produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub result: vk::Result,
    /// Replay handles created by the call, in the order of its create field.
    pub created: Vec<u64>,
    /// Scalar outputs (acquired image index, memory requirements, ...).
    pub outputs: Vec<u64>,
}

impl Invocation {
    pub fn ok() -> Self {
        Self::with_result(vk::Result::SUCCESS)
    }

    pub fn with_result(result: vk::Result) -> Self {
        Self {
            result,
            created: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn created(handles: Vec<u64>) -> Self {
        Self {
            result: vk::Result::SUCCESS,
            created: handles,
            outputs: Vec::new(),
        }
    }

    pub fn outputs(outputs: Vec<u64>) -> Self {
        Self {
            result: vk::Result::SUCCESS,
            created: Vec::new(),
            outputs,
        }
    }

    /// Success codes are zero or positive (`VK_INCOMPLETE`, `VK_SUBOPTIMAL_KHR`).
    pub fn succeeded(&self) -> bool {
        self.result.as_raw() >= 0
    }
}

/// Identity of a physical device, for the trace/replay GPU report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub vendor_id: u32,
    pub device_id: u32,
    pub driver_version: u32,
    pub api_version: u32,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryRequirements {
    pub size: u64,
    pub alignment: u64,
    pub memory_type_bits: u32,
}

/// A replay-side range of mapped memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRange {
    pub memory: u64,
    pub offset: u64,
    pub size: u64,
}

pub trait ReplayDriver {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Execute a generic call.
    fn invoke(&mut self, call: &Call<'_>) -> Invocation;

    /// `queue_flags` of every queue family, in index order.
    fn queue_family_flags(&mut self, physical_device: u64) -> Vec<u32>;

    /// `property_flags` of every memory type, in index order.
    fn memory_type_flags(&mut self, physical_device: u64) -> Vec<u32>;

    fn device_identity(&mut self, physical_device: u64) -> Option<DeviceIdentity>;

    fn buffer_memory_requirements(&mut self, device: u64, buffer: u64) -> MemoryRequirements;

    fn image_memory_requirements(&mut self, device: u64, image: u64) -> MemoryRequirements;

    fn allocate_memory(&mut self, device: u64, size: u64, memory_type: u32)
        -> Result<u64, vk::Result>;

    fn free_memory(&mut self, device: u64, memory: u64);

    /// Map `[offset, offset + size)`; the driver keeps the host pointer.
    fn map_memory(&mut self, device: u64, memory: u64, offset: u64, size: u64)
        -> Result<(), vk::Result>;

    fn unmap_memory(&mut self, device: u64, memory: u64);

    /// Copy `data` into a mapped allocation. `offset` is from the start of
    /// the allocation, not the mapping.
    fn write_mapped(&mut self, memory: u64, offset: u64, data: &[u8]) -> Result<(), vk::Result>;

    fn read_mapped(&mut self, memory: u64, offset: u64, len: usize) -> Result<Vec<u8>, vk::Result>;

    fn flush_mapped(&mut self, device: u64, ranges: &[MappedRange]) -> vk::Result;

    fn invalidate_mapped(&mut self, device: u64, ranges: &[MappedRange]) -> vk::Result;
}
