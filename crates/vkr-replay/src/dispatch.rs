//! Per-packet replay.
//!
//! Most calls take the generic path: remap every handle and index field the
//! entry point's layout names, invoke the driver, restore the body and commit
//! created/destroyed handles. A handful of calls need more than their layout
//! says (enumeration, memory, sparse binding, descriptor updates, swapchain
//! image indices) and get their own handler, still built on the same pieces.

use ash::vk;
use tracing::{debug, error, info, warn};

use vkr_core::compat::MEMORY_PROPERTY_HOST_VISIBLE;
use vkr_core::{DeferPolicy, IndexSpace, Lookup, Match, ReplayConfig, Resolution, ResolveError};
use vkr_trace::body::{fixed_size, FIRST_FIELD_POS, SLOT_SIZE};
use vkr_trace::entry::{DESCRIPTOR_BUFFER_INFO, DESCRIPTOR_IMAGE_INFO, WRITE_DESCRIPTOR_SET};
use vkr_trace::{BodyPatch, EntryPoint, Field, Fields, ObjectKind, Packet, NULL_HANDLE};

use crate::context::{DevicePair, ReplayContext};
use crate::driver::{Call, Invocation, MemoryRequirements, ReplayDriver};
use crate::error::{CallError, ReplayError};
use crate::memory::{HostRange, MemoryError};
use crate::remap::{elements, Remapper, Remapped};

use EntryPoint as E;

/// What happened to one packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The call reached the driver (or the memory emulator).
    Replayed { result: vk::Result, mismatch: bool },
    /// The call was not issued.
    Skipped(CallError),
}

impl Outcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Outcome::Skipped(_))
    }

    pub fn is_mismatch(&self) -> bool {
        matches!(self, Outcome::Replayed { mismatch: true, .. })
    }
}

pub struct Dispatcher<D> {
    driver: D,
    ctx: ReplayContext,
}

impl<D: ReplayDriver> Dispatcher<D> {
    pub fn new(driver: D, config: &ReplayConfig) -> Self {
        Self {
            driver,
            ctx: ReplayContext::new(config),
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn context(&self) -> &ReplayContext {
        &self.ctx
    }

    pub fn into_driver(self) -> D {
        self.driver
    }

    /// Replay one packet. Per-call failures come back as
    /// [`Outcome::Skipped`]; only failures that make the rest of the trace
    /// meaningless are errors.
    pub fn dispatch(&mut self, packet: &mut Packet) -> Result<Outcome, ReplayError> {
        let index = packet.header.global_index;
        let entry = match packet.entry_point() {
            Ok(entry) => entry,
            Err(e) => {
                error!(index, packet_id = packet.header.packet_id, error = %e, "skipping packet");
                return Ok(Outcome::Skipped(e.into()));
            }
        };
        let trace_result = packet.trace_result();
        // A creation the application itself saw fail (probing for optional
        // layers, say) is an ordinary call; only losing one that succeeded is fatal.
        let required = entry.is_mandatory() && trace_result >= 0;

        let valid = Fields::top(&packet.body, entry).map(|_| ());
        let replayed = match valid {
            Ok(()) => self.replay_call(entry, &mut packet.body),
            Err(e) => Err(CallError::from(e)),
        };

        match replayed {
            Ok(result) => {
                if required && result.as_raw() < 0 {
                    return Err(ReplayError::Device {
                        entry,
                        reason: format!("driver returned {result:?}"),
                    });
                }
                let mismatch = result.as_raw() != trace_result;
                if mismatch {
                    warn!(
                        entry = entry.name(),
                        index,
                        trace = ?vk::Result::from_raw(trace_result),
                        replay = ?result,
                        "return value differs from trace"
                    );
                }
                Ok(Outcome::Replayed { result, mismatch })
            }
            Err(e) => {
                if required {
                    return Err(ReplayError::Device {
                        entry,
                        reason: e.to_string(),
                    });
                }
                error!(entry = entry.name(), index, error = %e, "call skipped");
                Ok(Outcome::Skipped(e))
            }
        }
    }

    fn replay_call(&mut self, entry: EntryPoint, body: &mut [u8]) -> Result<vk::Result, CallError> {
        match entry {
            E::EnumeratePhysicalDevices => self.enumerate_physical_devices(body),
            E::GetPhysicalDeviceProperties => self.physical_device_properties(body),
            E::GetPhysicalDeviceQueueFamilyProperties => {
                self.record_capabilities(IndexSpace::QueueFamily, body)
            }
            E::GetPhysicalDeviceMemoryProperties => {
                self.record_capabilities(IndexSpace::MemoryType, body)
            }
            E::CreateDevice => {
                let inv = self.generic(entry, body)?;
                if inv.succeeded() {
                    let fields = Fields::trusted(body, entry);
                    self.ctx
                        .add_device(fields.value("device"), fields.value("physical_device"));
                }
                Ok(inv.result)
            }

            E::AllocateMemory => self.allocate_memory(body),
            E::FreeMemory => self.free_memory(body),
            E::MapMemory => self.map_memory(body),
            E::UnmapMemory => self.unmap_memory(body),
            E::FlushMappedMemoryRanges => self.flush_ranges(body),
            E::InvalidateMappedMemoryRanges => self.invalidate_ranges(body),
            E::BindBufferMemory | E::BindImageMemory => {
                self.reconcile_bind(entry, body)?;
                self.generic(entry, body).map(|inv| inv.result)
            }
            E::QueueBindSparse => {
                self.reconcile_sparse(body)?;
                self.generic(entry, body).map(|inv| inv.result)
            }
            E::GetBufferMemoryRequirements | E::GetImageMemoryRequirements => {
                self.memory_requirements(entry, body)
            }

            E::QueueSubmit => {
                check_submit_counts(Fields::trusted(body, entry))?;
                self.generic(entry, body).map(|inv| inv.result)
            }
            E::QueuePresentKhr => {
                let fields = Fields::trusted(body, entry);
                check_counts(fields, "swapchains", "image_indices")?;
                self.generic(entry, body).map(|inv| inv.result)
            }
            E::AcquireNextImageKhr => self.acquire_next_image(body),

            _ => self.generic(entry, body).map(|inv| inv.result),
        }
    }

    // ── Generic path ────────────────────────────────────────

    fn generic(&mut self, entry: EntryPoint, body: &mut [u8]) -> Result<Invocation, CallError> {
        let mut patch = BodyPatch::new(body);
        match entry {
            E::UpdateDescriptorSets => prune_descriptor_writes(&mut patch),
            E::QueuePresentKhr => remap_present_indices(&self.ctx, &mut patch),
            _ => {}
        }
        let remapped = Remapper::new(&mut self.ctx, &mut patch).run(entry)?;
        let invocation = self.driver.invoke(&Call {
            entry,
            fields: Fields::trusted(patch.bytes(), entry),
        });
        drop(patch);

        if invocation.succeeded() {
            self.commit(entry, &remapped, &invocation);
        }
        Ok(invocation)
    }

    fn commit(&mut self, entry: EntryPoint, remapped: &Remapped, invocation: &Invocation) {
        if let Some((kind, trace)) = &remapped.created {
            if trace.len() != invocation.created.len() {
                warn!(
                    entry = entry.name(),
                    ?kind,
                    trace = trace.len(),
                    replay = invocation.created.len(),
                    "created handle count differs from trace"
                );
            }
            for (&t, &r) in trace.iter().zip(&invocation.created) {
                if t == NULL_HANDLE || r == NULL_HANDLE {
                    continue;
                }
                if let Some(previous) = self.ctx.objects.add(*kind, t, r) {
                    debug!(?kind, trace = t, previous, replay = r, "trace handle reused");
                }
                if let Some(device) = remapped.anchor.device {
                    self.ctx.set_owner(*kind, t, device);
                }
            }
        }

        for &(kind, t) in &remapped.destroyed {
            self.ctx.objects.remove(kind, t);
            self.ctx.clear_owner(kind, t);
            match kind {
                ObjectKind::Device => self.ctx.remove_device(t),
                ObjectKind::SwapchainKhr => self.ctx.forget_swapchain(t),
                _ => {}
            }
        }
    }

    fn require(&self, kind: ObjectKind, field: &'static str, trace: u64) -> Result<u64, CallError> {
        match self.ctx.objects.lookup(kind, trace) {
            Lookup::Mapped(replay) => Ok(replay),
            Lookup::Null => Ok(NULL_HANDLE),
            Lookup::Missing => Err(CallError::UnknownHandle {
                field,
                kind,
                handle: trace,
            }),
        }
    }

    // ── Physical devices ────────────────────────────────────

    fn enumerate_physical_devices(&mut self, body: &mut [u8]) -> Result<vk::Result, CallError> {
        let entry = E::EnumeratePhysicalDevices;
        let invocation = {
            let mut patch = BodyPatch::new(body);
            Remapper::new(&mut self.ctx, &mut patch).run(entry)?;
            self.driver.invoke(&Call {
                entry,
                fields: Fields::trusted(patch.bytes(), entry),
            })
        };
        if !invocation.succeeded() {
            return Ok(invocation.result);
        }

        let replay = invocation.created;
        let Some(&first) = replay.first() else {
            warn!("replay instance reports no physical devices");
            return Ok(invocation.result);
        };
        let selected = match self.ctx.physical_device_index {
            Some(index) => Some(*replay.get(index as usize).ok_or(CallError::NoSuchGpu {
                index,
                available: replay.len(),
            })?),
            None => None,
        };

        let trace = Fields::trusted(body, entry).values("physical_devices");
        for (n, &trace_pd) in trace.iter().enumerate() {
            if trace_pd == NULL_HANDLE {
                continue;
            }
            let replay_pd = match selected {
                Some(pd) => pd,
                None => replay.get(n).copied().unwrap_or_else(|| {
                    warn!(
                        trace_index = n,
                        available = replay.len(),
                        "more physical devices in trace than on replay host, using the first"
                    );
                    first
                }),
            };
            self.ctx.objects.add(ObjectKind::PhysicalDevice, trace_pd, replay_pd);
            self.learn_replay_tables(replay_pd);
        }
        Ok(invocation.result)
    }

    fn learn_replay_tables(&mut self, physical_device: u64) {
        let families = self.driver.queue_family_flags(physical_device);
        self.ctx
            .compat
            .record_replay(IndexSpace::QueueFamily, physical_device, families);
        let types = self.driver.memory_type_flags(physical_device);
        self.ctx
            .compat
            .record_replay(IndexSpace::MemoryType, physical_device, types);
    }

    fn physical_device_properties(&mut self, body: &mut [u8]) -> Result<vk::Result, CallError> {
        let fields = Fields::trusted(body, E::GetPhysicalDeviceProperties);
        let replay_pd = self.require(
            ObjectKind::PhysicalDevice,
            "physical_device",
            fields.value("physical_device"),
        )?;
        let Some(replay) = self.driver.device_identity(replay_pd) else {
            return Ok(vk::Result::SUCCESS);
        };

        let vendor_id = fields.value_u32("vendor_id");
        let device_id = fields.value_u32("device_id");
        let driver_version = fields.value_u32("driver_version");
        if (vendor_id, device_id) != (replay.vendor_id, replay.device_id) {
            warn!(
                trace_gpu = %fields.string("device_name"),
                trace_vendor = vendor_id,
                trace_device = device_id,
                replay_gpu = %replay.name,
                replay_vendor = replay.vendor_id,
                replay_device = replay.device_id,
                "replaying on a different GPU than the trace was captured on"
            );
        } else if driver_version != replay.driver_version {
            info!(
                gpu = %replay.name,
                trace_driver = driver_version,
                replay_driver = replay.driver_version,
                "same GPU, different driver version"
            );
        } else {
            debug!(gpu = %replay.name, "replay GPU matches trace");
        }
        Ok(vk::Result::SUCCESS)
    }

    fn record_capabilities(&mut self, space: IndexSpace, body: &mut [u8]) -> Result<vk::Result, CallError> {
        let (entry, list, flag) = match space {
            IndexSpace::QueueFamily => (
                E::GetPhysicalDeviceQueueFamilyProperties,
                "families",
                "queue_flags",
            ),
            IndexSpace::MemoryType => (
                E::GetPhysicalDeviceMemoryProperties,
                "memory_types",
                "property_flags",
            ),
        };
        let fields = Fields::trusted(body, entry);
        let trace_pd = fields.value("physical_device");
        let replay_pd = self.require(ObjectKind::PhysicalDevice, "physical_device", trace_pd)?;

        let flags = fields
            .records(list)
            .iter()
            .map(|record| record.value_u32(flag))
            .collect();
        self.ctx.compat.record_trace(space, trace_pd, flags);
        self.learn_replay_tables(replay_pd);
        Ok(vk::Result::SUCCESS)
    }

    // ── Memory ──────────────────────────────────────────────

    fn allocate_memory(&mut self, body: &mut [u8]) -> Result<vk::Result, CallError> {
        let fields = Fields::trusted(body, E::AllocateMemory);
        let trace_device = fields.value("device");
        let device = self.require(ObjectKind::Device, "device", trace_device)?;
        let size = fields.value("allocation_size");
        let trace_type = fields.value_u32("memory_type_index");
        let memory = fields.value("memory");

        let resolution = if self.ctx.compatibility_mode {
            let field = "memory_type_index";
            self.ctx
                .device_pair(self.ctx.anchor_for(ObjectKind::Device, trace_device))
                .ok_or(CallError::NoDeviceContext { field })
                .and_then(|pair| {
                    self.ctx
                        .compat
                        .resolve(IndexSpace::MemoryType, pair.trace, pair.replay, trace_type)
                        .map_err(|source| CallError::Resolve { field, source })
                })
        } else {
            Ok(Resolution {
                index: trace_type,
                rule: Match::Passthrough,
            })
        };

        let defer = match (self.ctx.defer_allocations, &resolution) {
            (DeferPolicy::Never, _) => false,
            (DeferPolicy::Always, _) => true,
            (DeferPolicy::Inexact, Ok(r)) => !matches!(r.rule, Match::Exact | Match::Passthrough),
            (DeferPolicy::Inexact, Err(_)) => true,
        };
        if defer {
            if let Err(e) = &resolution {
                debug!(memory, error = %e, "no direct memory type match");
            }
            self.ctx
                .memory
                .track_pending(memory, device, trace_device, size, trace_type);
            self.ctx.set_owner(ObjectKind::DeviceMemory, memory, trace_device);
            return Ok(vk::Result::SUCCESS);
        }

        let resolution = resolution?;
        match self.driver.allocate_memory(device, size, resolution.index) {
            Ok(replay) => {
                self.ctx.objects.add(ObjectKind::DeviceMemory, memory, replay);
                self.ctx.set_owner(ObjectKind::DeviceMemory, memory, trace_device);
                self.ctx
                    .memory
                    .track_allocated(memory, device, trace_device, replay, size, trace_type);
                Ok(vk::Result::SUCCESS)
            }
            Err(result) => Ok(result),
        }
    }

    fn free_memory(&mut self, body: &mut [u8]) -> Result<vk::Result, CallError> {
        let memory = Fields::trusted(body, E::FreeMemory).value("memory");
        if memory == NULL_HANDLE {
            return Ok(vk::Result::SUCCESS);
        }
        match self.ctx.memory.release(&mut self.driver, memory) {
            Some(_) => {
                self.ctx.objects.remove(ObjectKind::DeviceMemory, memory);
                self.ctx.clear_owner(ObjectKind::DeviceMemory, memory);
                Ok(vk::Result::SUCCESS)
            }
            None => Err(unknown_memory(memory)),
        }
    }

    fn map_memory(&mut self, body: &mut [u8]) -> Result<vk::Result, CallError> {
        let fields = Fields::trusted(body, E::MapMemory);
        let memory = fields.value("memory");
        let mapped = self.ctx.memory.map(
            &mut self.driver,
            memory,
            fields.value("offset"),
            fields.value("size"),
        );
        match mapped {
            Ok(_) => Ok(vk::Result::SUCCESS),
            Err(e) => memory_failure(memory, e),
        }
    }

    fn unmap_memory(&mut self, body: &mut [u8]) -> Result<vk::Result, CallError> {
        let fields = Fields::trusted(body, E::UnmapMemory);
        let memory = fields.value("memory");
        match self
            .ctx
            .memory
            .unmap(&mut self.driver, memory, fields.bytes("data"))
        {
            Ok(()) => Ok(vk::Result::SUCCESS),
            Err(e) => memory_failure(memory, e),
        }
    }

    /// Decode the ranges of a flush or invalidate, rejecting unknown memory.
    fn host_ranges<'a>(&self, fields: Fields<'a>) -> Result<Vec<HostRange<'a>>, CallError> {
        fields
            .records("ranges")
            .iter()
            .map(|range| {
                let memory = range.value("memory");
                if self.ctx.memory.get(memory).is_none() {
                    return Err(unknown_memory(memory));
                }
                Ok(HostRange {
                    memory,
                    offset: range.value("offset"),
                    size: range.value("size"),
                    data: range.bytes("data"),
                })
            })
            .collect()
    }

    fn flush_ranges(&mut self, body: &mut [u8]) -> Result<vk::Result, CallError> {
        let fields = Fields::trusted(body, E::FlushMappedMemoryRanges);
        let device = self.require(ObjectKind::Device, "device", fields.value("device"))?;
        let ranges = self.host_ranges(fields)?;
        match self.ctx.memory.flush(&mut self.driver, device, &ranges) {
            Ok(result) => Ok(result),
            Err(e) => memory_failure(ranges.first().map_or(NULL_HANDLE, |r| r.memory), e),
        }
    }

    fn invalidate_ranges(&mut self, body: &mut [u8]) -> Result<vk::Result, CallError> {
        let fields = Fields::trusted(body, E::InvalidateMappedMemoryRanges);
        let device = self.require(ObjectKind::Device, "device", fields.value("device"))?;
        let ranges = self.host_ranges(fields)?;
        let (result, contents) = match self.ctx.memory.invalidate(&mut self.driver, device, &ranges) {
            Ok(read) => read,
            Err(e) => return memory_failure(ranges.first().map_or(NULL_HANDLE, |r| r.memory), e),
        };

        for (range, current) in ranges.iter().zip(&contents) {
            if !range.data.is_empty() && range.data != current.as_slice() {
                warn!(
                    memory = range.memory,
                    offset = range.offset,
                    len = current.len(),
                    "invalidated memory differs from trace"
                );
            }
        }
        Ok(result)
    }

    fn memory_requirements(&mut self, entry: EntryPoint, body: &mut [u8]) -> Result<vk::Result, CallError> {
        let invocation = self.generic(entry, body)?;
        if let &[size, alignment, ..] = invocation.outputs.as_slice() {
            let fields = Fields::trusted(body, entry);
            let trace_size = fields.value("size");
            let trace_alignment = fields.value("alignment");
            if size != trace_size || alignment != trace_alignment {
                warn!(
                    entry = entry.name(),
                    trace_size,
                    replay_size = size,
                    trace_alignment,
                    replay_alignment = alignment,
                    "memory requirements differ from trace"
                );
            }
        }
        Ok(invocation.result)
    }

    // ── Deferred allocations ────────────────────────────────

    fn reconcile_bind(&mut self, entry: EntryPoint, body: &mut [u8]) -> Result<(), CallError> {
        let fields = Fields::trusted(body, entry);
        let memory = fields.value("memory");
        if !self.ctx.memory.is_pending(memory) {
            return Ok(());
        }
        let (field, kind) = match entry {
            E::BindImageMemory => ("image", ObjectKind::Image),
            _ => ("buffer", ObjectKind::Buffer),
        };
        let device = self.require(ObjectKind::Device, "device", fields.value("device"))?;
        let resource = self.require(kind, field, fields.value(field))?;
        let requirements = self.requirements(kind, device, resource);
        self.reconcile(memory, fields.value("memory_offset"), requirements)
    }

    fn reconcile_sparse(&mut self, body: &mut [u8]) -> Result<(), CallError> {
        let fields = Fields::trusted(body, E::QueueBindSparse);
        let mut pending = Vec::new();
        for info in fields.records("bind_infos") {
            for (list, field, kind) in [
                ("buffer_binds", "buffer", ObjectKind::Buffer),
                ("image_opaque_binds", "image", ObjectKind::Image),
            ] {
                for bind in info.records(list) {
                    for region in bind.records("binds") {
                        let memory = region.value("memory");
                        if self.ctx.memory.is_pending(memory) {
                            pending.push((field, kind, bind.value(field), memory, region.value("memory_offset")));
                        }
                    }
                }
            }
        }
        if pending.is_empty() {
            return Ok(());
        }

        let queue = fields.value("queue");
        let trace_device = self
            .ctx
            .owner(ObjectKind::Queue, queue)
            .ok_or(CallError::NoDeviceContext { field: "queue" })?;
        let device = self.require(ObjectKind::Device, "queue", trace_device)?;
        for (field, kind, trace_resource, memory, offset) in pending {
            if !self.ctx.memory.is_pending(memory) {
                continue;
            }
            let resource = self.require(kind, field, trace_resource)?;
            let requirements = self.requirements(kind, device, resource);
            self.reconcile(memory, offset, requirements)?;
        }
        Ok(())
    }

    fn requirements(&mut self, kind: ObjectKind, device: u64, resource: u64) -> MemoryRequirements {
        match kind {
            ObjectKind::Image => self.driver.image_memory_requirements(device, resource),
            _ => self.driver.buffer_memory_requirements(device, resource),
        }
    }

    /// Give a pending allocation real memory that satisfies the resource
    /// about to be bound to it.
    fn reconcile(&mut self, memory: u64, offset: u64, requirements: MemoryRequirements) -> Result<(), CallError> {
        let shadow = self.ctx.memory.get(memory).ok_or_else(|| unknown_memory(memory))?;
        let trace_device = shadow.trace_device;
        let trace_type = shadow.memory_type;
        let needs_host = shadow.has_shadow() || shadow.mapped().is_some();
        let size = shadow.size.max(offset.saturating_add(requirements.size));

        let replay_type = if self.ctx.compatibility_mode {
            let pair = self
                .ctx
                .device_pair(self.ctx.anchor_for(ObjectKind::Device, trace_device))
                .ok_or(CallError::NoDeviceContext { field: "memory" })?;
            self.pick_memory_type(pair, trace_type, requirements.memory_type_bits, needs_host)
                .map_err(|source| CallError::Resolve {
                    field: "memory",
                    source,
                })?
        } else {
            trace_type
        };

        let replay = self
            .ctx
            .memory
            .reconcile(&mut self.driver, memory, size, replay_type)
            .map_err(|source| CallError::Memory { memory, source })?;
        self.ctx.objects.add(ObjectKind::DeviceMemory, memory, replay);
        Ok(())
    }

    /// Translated type if the resource accepts it, otherwise the first
    /// accepted type that covers the trace type's flags, otherwise the first
    /// accepted type at all.
    fn pick_memory_type(
        &mut self,
        pair: DevicePair,
        trace_type: u32,
        allowed_bits: u32,
        needs_host: bool,
    ) -> Result<u32, ResolveError> {
        let translated = self
            .ctx
            .compat
            .resolve(IndexSpace::MemoryType, pair.trace, pair.replay, trace_type);
        let replay = self
            .ctx
            .compat
            .replay_flags(IndexSpace::MemoryType, pair.replay)
            .unwrap_or(&[]);
        let usable = |j: u32| {
            j < 32
                && allowed_bits & (1 << j) != 0
                && (!needs_host
                    || replay
                        .get(j as usize)
                        .is_some_and(|f| f & MEMORY_PROPERTY_HOST_VISIBLE != 0))
        };

        if let Ok(r) = translated {
            if usable(r.index) {
                return Ok(r.index);
            }
        }
        let trace_flags = self
            .ctx
            .compat
            .trace_flags(IndexSpace::MemoryType, pair.trace)
            .and_then(|t| t.get(trace_type as usize))
            .copied();
        if let Some(flags) = trace_flags {
            if let Some(j) = (0..replay.len() as u32).find(|&j| usable(j) && replay[j as usize] & flags == flags) {
                return Ok(j);
            }
        }
        if let Some(j) = (0..replay.len() as u32).find(|&j| usable(j)) {
            return Ok(j);
        }
        translated.and(Err(ResolveError::NoCompatibleIndex {
            space: IndexSpace::MemoryType,
            index: trace_type,
            flags: trace_flags.unwrap_or(0),
        }))
    }

    // ── Presentation ────────────────────────────────────────

    fn acquire_next_image(&mut self, body: &mut [u8]) -> Result<vk::Result, CallError> {
        let invocation = self.generic(E::AcquireNextImageKhr, body)?;
        if invocation.succeeded() {
            if let Some(&replay_index) = invocation.outputs.first() {
                let fields = Fields::trusted(body, E::AcquireNextImageKhr);
                let trace_index = fields.value_u32("image_index");
                if replay_index as u32 != trace_index {
                    debug!(trace_index, replay_index, "swapchain image index differs from trace");
                }
                self.ctx
                    .record_acquire(fields.value("swapchain"), trace_index, replay_index as u32);
            }
        }
        Ok(invocation.result)
    }
}

fn unknown_memory(memory: u64) -> CallError {
    CallError::UnknownHandle {
        field: "memory",
        kind: ObjectKind::DeviceMemory,
        handle: memory,
    }
}

/// Native failures are the call's result; everything else skips the call.
fn memory_failure(memory: u64, e: MemoryError) -> Result<vk::Result, CallError> {
    match e {
        MemoryError::Unknown => Err(unknown_memory(memory)),
        MemoryError::Native(result) => Ok(result),
        source => Err(CallError::Memory { memory, source }),
    }
}

fn check_counts(fields: Fields<'_>, a: &'static str, b: &'static str) -> Result<(), CallError> {
    let (a_len, b_len) = (fields.count(a), fields.count(b));
    if a_len != b_len {
        return Err(CallError::CountMismatch { a, a_len, b, b_len });
    }
    Ok(())
}

fn check_submit_counts(fields: Fields<'_>) -> Result<(), CallError> {
    fields
        .records("submits")
        .into_iter()
        .try_for_each(|submit| check_counts(submit, "wait_semaphores", "wait_dst_stage_masks"))
}

fn slot_offset(schema: &'static [Field], name: &str) -> usize {
    let index = schema.iter().position(|f| f.name == name);
    debug_assert!(index.is_some(), "no field `{name}` in layout");
    index.unwrap_or(0) * SLOT_SIZE
}

/// Null the handle fields a write's descriptor type does not read, so stale
/// trace values in unused members never reach the remapper.
fn prune_descriptor_writes(patch: &mut BodyPatch<'_>) {
    let writes = FIRST_FIELD_POS + slot_offset(E::UpdateDescriptorSets.fields(), "writes");
    let field = |name| slot_offset(WRITE_DESCRIPTOR_SET, name);

    for write in elements(patch, writes, fixed_size(WRITE_DESCRIPTOR_SET)) {
        let ty = vk::DescriptorType::from_raw(patch.read(write + field("descriptor_type")) as i32);
        let (sampler, image_view) = match ty {
            vk::DescriptorType::SAMPLER => (true, false),
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER => (true, true),
            vk::DescriptorType::SAMPLED_IMAGE
            | vk::DescriptorType::STORAGE_IMAGE
            | vk::DescriptorType::INPUT_ATTACHMENT => (false, true),
            _ => (false, false),
        };
        let buffer = matches!(
            ty,
            vk::DescriptorType::UNIFORM_BUFFER
                | vk::DescriptorType::STORAGE_BUFFER
                | vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
                | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC
        );
        let texel = matches!(
            ty,
            vk::DescriptorType::UNIFORM_TEXEL_BUFFER | vk::DescriptorType::STORAGE_TEXEL_BUFFER
        );

        let image_info = fixed_size(DESCRIPTOR_IMAGE_INFO);
        for info in elements(patch, write + field("image_infos"), image_info) {
            if !sampler {
                patch.write(info + slot_offset(DESCRIPTOR_IMAGE_INFO, "sampler"), NULL_HANDLE);
            }
            if !image_view {
                patch.write(info + slot_offset(DESCRIPTOR_IMAGE_INFO, "image_view"), NULL_HANDLE);
            }
        }
        if !buffer {
            let buffer_info = fixed_size(DESCRIPTOR_BUFFER_INFO);
            for info in elements(patch, write + field("buffer_infos"), buffer_info) {
                patch.write(info + slot_offset(DESCRIPTOR_BUFFER_INFO, "buffer"), NULL_HANDLE);
            }
        }
        if !texel {
            for at in elements(patch, write + field("texel_buffer_views"), 8) {
                patch.write(at, NULL_HANDLE);
            }
        }
    }
}

/// Swap trace image indices for the ones the replay swapchain handed out.
/// Runs before the swapchain handles themselves are remapped.
fn remap_present_indices(ctx: &ReplayContext, patch: &mut BodyPatch<'_>) {
    let schema = E::QueuePresentKhr.fields();
    let swapchains = elements(patch, FIRST_FIELD_POS + slot_offset(schema, "swapchains"), 8);
    let indices = elements(patch, FIRST_FIELD_POS + slot_offset(schema, "image_indices"), 8);
    for (&swapchain_pos, &index_pos) in swapchains.iter().zip(&indices) {
        let swapchain = patch.read(swapchain_pos);
        let trace_index = patch.read(index_pos) as u32;
        if let Some(replay_index) = ctx.acquired_index(swapchain, trace_index) {
            patch.write(index_pos, u64::from(replay_index));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vkr_trace::writer::{encode_body, Arg};

    fn image_write(ty: u64) -> Vec<Arg> {
        vec![
            Arg::Value(0x70),
            Arg::Value(0),
            Arg::Value(0),
            Arg::Value(ty),
            Arg::Records(vec![vec![Arg::Value(0x81), Arg::Value(0x82), Arg::Value(5)]]),
            Arg::Records(vec![vec![Arg::Value(0x91), Arg::Value(0), Arg::Value(64)]]),
            Arg::Values(vec![0xA1]),
        ]
    }

    #[test]
    fn test_prune_keeps_only_consumed_members() {
        let sampled_image = vk::DescriptorType::SAMPLED_IMAGE.as_raw() as u64;
        let mut body = encode_body(
            0,
            &[
                Arg::Value(0x20),
                Arg::Records(vec![image_write(sampled_image)]),
                Arg::Records(vec![]),
            ],
        );
        let original = body.clone();
        {
            let mut patch = BodyPatch::new(&mut body);
            prune_descriptor_writes(&mut patch);
            let view = Fields::trusted(patch.bytes(), E::UpdateDescriptorSets);
            let write = view.records("writes")[0];
            let image = write.records("image_infos")[0];
            assert_eq!(image.value("sampler"), NULL_HANDLE);
            assert_eq!(image.value("image_view"), 0x82);
            assert_eq!(write.records("buffer_infos")[0].value("buffer"), NULL_HANDLE);
            assert_eq!(write.values("texel_buffer_views"), vec![NULL_HANDLE]);
        }
        assert_eq!(body, original);
    }

    #[test]
    fn test_present_indices_follow_acquire() {
        let mut ctx = ReplayContext::new(&ReplayConfig::default());
        ctx.record_acquire(0x55, 0, 2);
        let mut body = encode_body(
            0,
            &[
                Arg::Value(0x40),
                Arg::Values(vec![]),
                Arg::Values(vec![0x55]),
                Arg::Values(vec![0]),
            ],
        );
        let mut patch = BodyPatch::new(&mut body);
        remap_present_indices(&ctx, &mut patch);
        let view = Fields::trusted(patch.bytes(), E::QueuePresentKhr);
        assert_eq!(view.values("image_indices"), vec![2]);
    }

    #[test]
    fn test_submit_count_mismatch() {
        let body = encode_body(
            0,
            &[
                Arg::Value(0x40),
                Arg::Records(vec![vec![
                    Arg::Values(vec![0xA1, 0xA2]),
                    Arg::Values(vec![0x400]),
                    Arg::Values(vec![]),
                    Arg::Values(vec![]),
                ]]),
                Arg::Value(0),
            ],
        );
        let err = check_submit_counts(Fields::trusted(&body, E::QueueSubmit)).unwrap_err();
        assert_eq!(
            err,
            CallError::CountMismatch {
                a: "wait_semaphores",
                a_len: 2,
                b: "wait_dst_stage_masks",
                b_len: 1
            }
        );
    }
}
