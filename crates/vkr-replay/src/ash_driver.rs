//! Executes replayed calls on a real GPU through `ash`.
//!
//! Every handle the dispatch core hands over is already a replay-side raw
//! Vulkan handle. The driver only keeps what `ash` needs to reach the right
//! dispatch table (instance and device wrappers, the device owning each
//! queue and command buffer) plus the host pointers of mapped memory.
//! Objects still alive when the driver is dropped are destroyed in reverse
//! dependency order.

use std::collections::{HashMap, HashSet};
use std::ffi::{c_void, CStr, CString};

use ash::vk::{self, Handle};
use ash::{ext, khr};
use tracing::{debug, info, warn};
use vkr_trace::{EntryPoint, Fields, ObjectKind};

use crate::driver::{
    Call, DeviceIdentity, Invocation, MappedRange, MemoryRequirements, ReplayDriver,
};
use crate::error::DriverError;

use EntryPoint as E;

type VkResult<T> = Result<T, vk::Result>;

/// Window-system surface extensions. A headless surface replaces them all.
const WINDOW_SYSTEM_EXTENSIONS: &[&str] = &[
    "VK_KHR_win32_surface",
    "VK_KHR_xcb_surface",
    "VK_KHR_xlib_surface",
    "VK_KHR_wayland_surface",
    "VK_KHR_android_surface",
    "VK_EXT_metal_surface",
    "VK_MVK_macos_surface",
];

/// Destruction order for objects left alive at teardown.
const RELEASE_ORDER: &[ObjectKind] = &[
    ObjectKind::Framebuffer,
    ObjectKind::ImageView,
    ObjectKind::BufferView,
    ObjectKind::RenderPass,
    ObjectKind::Pipeline,
    ObjectKind::PipelineLayout,
    ObjectKind::DescriptorPool,
    ObjectKind::DescriptorSetLayout,
    ObjectKind::Sampler,
    ObjectKind::ShaderModule,
    ObjectKind::PipelineCache,
    ObjectKind::CommandPool,
    ObjectKind::Fence,
    ObjectKind::Semaphore,
    ObjectKind::SwapchainKhr,
    ObjectKind::Image,
    ObjectKind::Buffer,
    ObjectKind::DeviceMemory,
];

struct InstanceState {
    instance: ash::Instance,
    surface: khr::surface::Instance,
    headless: Option<ext::headless_surface::Instance>,
    surfaces: Vec<vk::SurfaceKHR>,
}

struct DeviceState {
    device: ash::Device,
    physical_device: u64,
    swapchain: Option<khr::swapchain::Device>,
}

struct Mapping {
    offset: u64,
    size: u64,
    ptr: *mut c_void,
}

pub struct AshDriver {
    entry: ash::Entry,
    instances: HashMap<u64, InstanceState>,
    /// physical device -> instance
    physical_devices: HashMap<u64, u64>,
    devices: HashMap<u64, DeviceState>,
    /// queue / command buffer -> device
    owners: HashMap<u64, u64>,
    /// Live device children -> device.
    children: HashMap<(ObjectKind, u64), u64>,
    mappings: HashMap<u64, Mapping>,
}

impl AshDriver {
    pub fn new() -> Result<Self, DriverError> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| DriverError::Load(e.to_string()))?;
        info!("Vulkan loader found");
        Ok(Self {
            entry,
            instances: HashMap::new(),
            physical_devices: HashMap::new(),
            devices: HashMap::new(),
            owners: HashMap::new(),
            children: HashMap::new(),
            mappings: HashMap::new(),
        })
    }

    // ── Lookups ─────────────────────────────────────────────

    fn instance(&self, raw: u64) -> VkResult<&InstanceState> {
        self.instances
            .get(&raw)
            .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)
    }

    fn instance_of(&self, physical_device: u64) -> VkResult<&InstanceState> {
        let instance = self
            .physical_devices
            .get(&physical_device)
            .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)?;
        self.instance(*instance)
    }

    fn device_state(&self, raw: u64) -> VkResult<&DeviceState> {
        self.devices.get(&raw).ok_or(vk::Result::ERROR_DEVICE_LOST)
    }

    fn device(&self, raw: u64) -> VkResult<&ash::Device> {
        self.device_state(raw).map(|s| &s.device)
    }

    /// Device of a queue or command buffer.
    fn owner(&self, raw: u64) -> VkResult<(u64, &ash::Device)> {
        let device = *self.owners.get(&raw).ok_or(vk::Result::ERROR_DEVICE_LOST)?;
        Ok((device, self.device(device)?))
    }

    fn recording(&self, f: &Fields<'_>) -> VkResult<(&ash::Device, vk::CommandBuffer)> {
        let raw = f.value("command_buffer");
        let (_, device) = self.owner(raw)?;
        Ok((device, vk::CommandBuffer::from_raw(raw)))
    }

    fn track<T: Handle>(&mut self, kind: ObjectKind, device: u64, handle: T) -> Invocation {
        let raw = handle.as_raw();
        self.children.insert((kind, raw), device);
        Invocation::created(vec![raw])
    }

    // ── Execution ───────────────────────────────────────────

    fn execute(&mut self, entry: EntryPoint, f: &Fields<'_>) -> VkResult<Invocation> {
        match entry {
            // ── Instance ────────────────────────────────────
            E::CreateInstance => self.create_instance(f),
            E::DestroyInstance => {
                self.release_instance(f.value("instance"));
                Ok(Invocation::ok())
            }
            E::EnumeratePhysicalDevices => {
                let instance = f.value("instance");
                let pds = unsafe { self.instance(instance)?.instance.enumerate_physical_devices() }?;
                let raws: Vec<u64> = pds.iter().map(|pd| pd.as_raw()).collect();
                for &pd in &raws {
                    self.physical_devices.insert(pd, instance);
                }
                debug!(count = raws.len(), "enumerated physical devices");
                Ok(Invocation::created(raws))
            }
            E::GetPhysicalDeviceFeatures => {
                let pd = f.value("physical_device");
                let instance = &self.instance_of(pd)?.instance;
                let replay = unsafe { instance.get_physical_device_features(vk::PhysicalDevice::from_raw(pd)) };
                let missing = missing_features(f.bytes("features"), &replay);
                if missing > 0 {
                    warn!(missing, "replay GPU lacks features the trace GPU reported");
                }
                Ok(Invocation::ok())
            }

            // ── Device ──────────────────────────────────────
            E::CreateDevice => self.create_device(f),
            E::DestroyDevice => {
                self.release_device(f.value("device"));
                Ok(Invocation::ok())
            }
            E::DeviceWaitIdle => done(unsafe { self.device(f.value("device"))?.device_wait_idle() }),
            E::GetDeviceQueue => {
                let raw = f.value("device");
                let queue = unsafe {
                    self.device(raw)?
                        .get_device_queue(f.value_u32("queue_family_index"), f.value_u32("queue_index"))
                };
                self.owners.insert(queue.as_raw(), raw);
                Ok(Invocation::created(vec![queue.as_raw()]))
            }
            E::QueueSubmit => self.queue_submit(f),
            E::QueueWaitIdle => {
                let queue = f.value("queue");
                let (_, device) = self.owner(queue)?;
                done(unsafe { device.queue_wait_idle(vk::Queue::from_raw(queue)) })
            }
            E::QueueBindSparse => self.queue_bind_sparse(f),

            // ── Memory ──────────────────────────────────────
            E::BindBufferMemory => done(unsafe {
                self.device(f.value("device"))?.bind_buffer_memory(
                    handle(f, "buffer"),
                    handle(f, "memory"),
                    f.value("memory_offset"),
                )
            }),
            E::BindImageMemory => done(unsafe {
                self.device(f.value("device"))?.bind_image_memory(
                    handle(f, "image"),
                    handle(f, "memory"),
                    f.value("memory_offset"),
                )
            }),
            E::GetBufferMemoryRequirements => {
                let r = self.buffer_memory_requirements(f.value("device"), f.value("buffer"));
                Ok(Invocation::outputs(vec![r.size, r.alignment, u64::from(r.memory_type_bits)]))
            }
            E::GetImageMemoryRequirements => {
                let r = self.image_memory_requirements(f.value("device"), f.value("image"));
                Ok(Invocation::outputs(vec![r.size, r.alignment, u64::from(r.memory_type_bits)]))
            }

            // ── Resources ───────────────────────────────────
            E::CreateBuffer => {
                let raw = f.value("device");
                let families = f.values_u32("queue_family_indices");
                let info = vk::BufferCreateInfo::default()
                    .flags(vk::BufferCreateFlags::from_raw(f.value_u32("flags")))
                    .size(f.value("size"))
                    .usage(vk::BufferUsageFlags::from_raw(f.value_u32("usage")))
                    .sharing_mode(vk::SharingMode::from_raw(int(f, "sharing_mode")))
                    .queue_family_indices(&families);
                let buffer = unsafe { self.device(raw)?.create_buffer(&info, None) }?;
                Ok(self.track(ObjectKind::Buffer, raw, buffer))
            }
            E::CreateBufferView => {
                let raw = f.value("device");
                let info = vk::BufferViewCreateInfo::default()
                    .buffer(handle(f, "buffer"))
                    .format(vk::Format::from_raw(int(f, "format")))
                    .offset(f.value("offset"))
                    .range(f.value("range"));
                let view = unsafe { self.device(raw)?.create_buffer_view(&info, None) }?;
                Ok(self.track(ObjectKind::BufferView, raw, view))
            }
            E::CreateImage => {
                let raw = f.value("device");
                let families = f.values_u32("queue_family_indices");
                let info = vk::ImageCreateInfo::default()
                    .flags(vk::ImageCreateFlags::from_raw(f.value_u32("flags")))
                    .image_type(vk::ImageType::from_raw(int(f, "image_type")))
                    .format(vk::Format::from_raw(int(f, "format")))
                    .extent(vk::Extent3D {
                        width: f.value_u32("width"),
                        height: f.value_u32("height"),
                        depth: f.value_u32("depth"),
                    })
                    .mip_levels(f.value_u32("mip_levels"))
                    .array_layers(f.value_u32("array_layers"))
                    .samples(vk::SampleCountFlags::from_raw(f.value_u32("samples")))
                    .tiling(vk::ImageTiling::from_raw(int(f, "tiling")))
                    .usage(vk::ImageUsageFlags::from_raw(f.value_u32("usage")))
                    .sharing_mode(vk::SharingMode::from_raw(int(f, "sharing_mode")))
                    .queue_family_indices(&families)
                    .initial_layout(vk::ImageLayout::from_raw(int(f, "initial_layout")));
                let image = unsafe { self.device(raw)?.create_image(&info, None) }?;
                Ok(self.track(ObjectKind::Image, raw, image))
            }
            E::CreateImageView => {
                let raw = f.value("device");
                let swizzle = f.values("components");
                let component = |i: usize| {
                    vk::ComponentSwizzle::from_raw(swizzle.get(i).copied().unwrap_or(0) as i32)
                };
                let info = vk::ImageViewCreateInfo::default()
                    .image(handle(f, "image"))
                    .view_type(vk::ImageViewType::from_raw(int(f, "view_type")))
                    .format(vk::Format::from_raw(int(f, "format")))
                    .components(vk::ComponentMapping {
                        r: component(0),
                        g: component(1),
                        b: component(2),
                        a: component(3),
                    })
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::from_raw(f.value_u32("aspect_mask")),
                        base_mip_level: f.value_u32("base_mip_level"),
                        level_count: f.value_u32("level_count"),
                        base_array_layer: f.value_u32("base_array_layer"),
                        layer_count: f.value_u32("layer_count"),
                    });
                let view = unsafe { self.device(raw)?.create_image_view(&info, None) }?;
                Ok(self.track(ObjectKind::ImageView, raw, view))
            }
            E::CreateSampler => {
                let raw = f.value("device");
                let info = vk::SamplerCreateInfo::default()
                    .mag_filter(vk::Filter::from_raw(int(f, "mag_filter")))
                    .min_filter(vk::Filter::from_raw(int(f, "min_filter")))
                    .mipmap_mode(vk::SamplerMipmapMode::from_raw(int(f, "mipmap_mode")))
                    .address_mode_u(vk::SamplerAddressMode::from_raw(int(f, "address_mode_u")))
                    .address_mode_v(vk::SamplerAddressMode::from_raw(int(f, "address_mode_v")))
                    .address_mode_w(vk::SamplerAddressMode::from_raw(int(f, "address_mode_w")))
                    .anisotropy_enable(flag(f, "anisotropy_enable"))
                    .max_anisotropy(float(f, "max_anisotropy"))
                    .min_lod(float(f, "min_lod"))
                    .max_lod(float(f, "max_lod"))
                    .border_color(vk::BorderColor::from_raw(int(f, "border_color")));
                let sampler = unsafe { self.device(raw)?.create_sampler(&info, None) }?;
                Ok(self.track(ObjectKind::Sampler, raw, sampler))
            }

            // ── Pipelines & descriptors ─────────────────────
            E::CreateShaderModule => {
                let raw = f.value("device");
                let code: Vec<u32> = bytemuck::pod_collect_to_vec(f.bytes("code"));
                let info = vk::ShaderModuleCreateInfo::default().code(&code);
                let module = unsafe { self.device(raw)?.create_shader_module(&info, None) }?;
                Ok(self.track(ObjectKind::ShaderModule, raw, module))
            }
            E::CreatePipelineCache => {
                let raw = f.value("device");
                let info = vk::PipelineCacheCreateInfo::default().initial_data(f.bytes("initial_data"));
                let cache = unsafe { self.device(raw)?.create_pipeline_cache(&info, None) }?;
                Ok(self.track(ObjectKind::PipelineCache, raw, cache))
            }
            E::CreateDescriptorSetLayout => {
                let raw = f.value("device");
                let records = f.records("bindings");
                let samplers: Vec<Vec<vk::Sampler>> = records
                    .iter()
                    .map(|b| handles(b, "immutable_samplers"))
                    .collect();
                let bindings: Vec<_> = records
                    .iter()
                    .zip(&samplers)
                    .map(|(b, samplers)| {
                        let binding = vk::DescriptorSetLayoutBinding::default()
                            .binding(b.value_u32("binding"))
                            .descriptor_type(vk::DescriptorType::from_raw(int(b, "descriptor_type")))
                            .descriptor_count(b.value_u32("descriptor_count"))
                            .stage_flags(vk::ShaderStageFlags::from_raw(b.value_u32("stage_flags")));
                        if samplers.is_empty() {
                            binding
                        } else {
                            binding.immutable_samplers(samplers)
                        }
                    })
                    .collect();
                let info = vk::DescriptorSetLayoutCreateInfo::default()
                    .flags(vk::DescriptorSetLayoutCreateFlags::from_raw(f.value_u32("flags")))
                    .bindings(&bindings);
                let layout = unsafe { self.device(raw)?.create_descriptor_set_layout(&info, None) }?;
                Ok(self.track(ObjectKind::DescriptorSetLayout, raw, layout))
            }
            E::CreatePipelineLayout => {
                let raw = f.value("device");
                let set_layouts: Vec<vk::DescriptorSetLayout> = handles(f, "set_layouts");
                let ranges: Vec<_> = f
                    .records("push_constant_ranges")
                    .iter()
                    .map(|r| vk::PushConstantRange {
                        stage_flags: vk::ShaderStageFlags::from_raw(r.value_u32("stage_flags")),
                        offset: r.value_u32("offset"),
                        size: r.value_u32("size"),
                    })
                    .collect();
                let info = vk::PipelineLayoutCreateInfo::default()
                    .set_layouts(&set_layouts)
                    .push_constant_ranges(&ranges);
                let layout = unsafe { self.device(raw)?.create_pipeline_layout(&info, None) }?;
                Ok(self.track(ObjectKind::PipelineLayout, raw, layout))
            }
            E::CreateDescriptorPool => {
                let raw = f.value("device");
                let sizes: Vec<_> = f
                    .records("pool_sizes")
                    .iter()
                    .map(|s| vk::DescriptorPoolSize {
                        ty: vk::DescriptorType::from_raw(int(s, "descriptor_type")),
                        descriptor_count: s.value_u32("descriptor_count"),
                    })
                    .collect();
                let info = vk::DescriptorPoolCreateInfo::default()
                    .flags(vk::DescriptorPoolCreateFlags::from_raw(f.value_u32("flags")))
                    .max_sets(f.value_u32("max_sets"))
                    .pool_sizes(&sizes);
                let pool = unsafe { self.device(raw)?.create_descriptor_pool(&info, None) }?;
                Ok(self.track(ObjectKind::DescriptorPool, raw, pool))
            }
            E::ResetDescriptorPool => done(unsafe {
                self.device(f.value("device"))?.reset_descriptor_pool(
                    handle(f, "pool"),
                    vk::DescriptorPoolResetFlags::from_raw(f.value_u32("flags")),
                )
            }),
            E::AllocateDescriptorSets => {
                let layouts: Vec<vk::DescriptorSetLayout> = handles(f, "set_layouts");
                let info = vk::DescriptorSetAllocateInfo::default()
                    .descriptor_pool(handle(f, "descriptor_pool"))
                    .set_layouts(&layouts);
                let sets = unsafe { self.device(f.value("device"))?.allocate_descriptor_sets(&info) }?;
                Ok(Invocation::created(sets.iter().map(|s| s.as_raw()).collect()))
            }
            E::FreeDescriptorSets => {
                let sets: Vec<vk::DescriptorSet> = handles(f, "descriptor_sets");
                done(unsafe {
                    self.device(f.value("device"))?
                        .free_descriptor_sets(handle(f, "descriptor_pool"), &sets)
                })
            }
            E::UpdateDescriptorSets => self.update_descriptor_sets(f),
            E::CreateComputePipelines => self.create_compute_pipelines(f),
            E::CreateGraphicsPipelines => self.create_graphics_pipelines(f),
            E::CreateRenderPass => self.create_render_pass(f),
            E::CreateFramebuffer => {
                let raw = f.value("device");
                let attachments: Vec<vk::ImageView> = handles(f, "attachments");
                let info = vk::FramebufferCreateInfo::default()
                    .render_pass(handle(f, "render_pass"))
                    .attachments(&attachments)
                    .width(f.value_u32("width"))
                    .height(f.value_u32("height"))
                    .layers(f.value_u32("layers"));
                let framebuffer = unsafe { self.device(raw)?.create_framebuffer(&info, None) }?;
                Ok(self.track(ObjectKind::Framebuffer, raw, framebuffer))
            }

            // ── Command pools & buffers ─────────────────────
            E::CreateCommandPool => {
                let raw = f.value("device");
                let info = vk::CommandPoolCreateInfo::default()
                    .flags(vk::CommandPoolCreateFlags::from_raw(f.value_u32("flags")))
                    .queue_family_index(f.value_u32("queue_family_index"));
                let pool = unsafe { self.device(raw)?.create_command_pool(&info, None) }?;
                Ok(self.track(ObjectKind::CommandPool, raw, pool))
            }
            E::ResetCommandPool => done(unsafe {
                self.device(f.value("device"))?.reset_command_pool(
                    handle(f, "command_pool"),
                    vk::CommandPoolResetFlags::from_raw(f.value_u32("flags")),
                )
            }),
            E::AllocateCommandBuffers => {
                let raw = f.value("device");
                let info = vk::CommandBufferAllocateInfo::default()
                    .command_pool(handle(f, "command_pool"))
                    .level(vk::CommandBufferLevel::from_raw(int(f, "level")))
                    .command_buffer_count(f.count("command_buffers") as u32);
                let buffers = unsafe { self.device(raw)?.allocate_command_buffers(&info) }?;
                let raws: Vec<u64> = buffers.iter().map(|b| b.as_raw()).collect();
                for &cb in &raws {
                    self.owners.insert(cb, raw);
                }
                Ok(Invocation::created(raws))
            }
            E::FreeCommandBuffers => {
                let buffers: Vec<vk::CommandBuffer> = handles(f, "command_buffers");
                unsafe {
                    self.device(f.value("device"))?
                        .free_command_buffers(handle(f, "command_pool"), &buffers)
                };
                for cb in buffers {
                    self.owners.remove(&cb.as_raw());
                }
                Ok(Invocation::ok())
            }
            E::BeginCommandBuffer => {
                let (device, cb) = self.recording(f)?;
                let info = vk::CommandBufferBeginInfo::default()
                    .flags(vk::CommandBufferUsageFlags::from_raw(f.value_u32("flags")));
                done(unsafe { device.begin_command_buffer(cb, &info) })
            }
            E::EndCommandBuffer => {
                let (device, cb) = self.recording(f)?;
                done(unsafe { device.end_command_buffer(cb) })
            }
            E::ResetCommandBuffer => {
                let (device, cb) = self.recording(f)?;
                let flags = vk::CommandBufferResetFlags::from_raw(f.value_u32("flags"));
                done(unsafe { device.reset_command_buffer(cb, flags) })
            }

            // ── Recording ───────────────────────────────────
            E::CmdBindPipeline
            | E::CmdBindDescriptorSets
            | E::CmdBindVertexBuffers
            | E::CmdBindIndexBuffer
            | E::CmdSetViewport
            | E::CmdSetScissor
            | E::CmdPushConstants
            | E::CmdDraw
            | E::CmdDrawIndexed
            | E::CmdDispatch
            | E::CmdCopyBuffer
            | E::CmdCopyBufferToImage
            | E::CmdCopyImageToBuffer
            | E::CmdPipelineBarrier
            | E::CmdBeginRenderPass
            | E::CmdEndRenderPass => {
                let (device, cb) = self.recording(f)?;
                record(device, cb, entry, f);
                Ok(Invocation::ok())
            }

            // ── Synchronization ─────────────────────────────
            E::CreateFence => {
                let raw = f.value("device");
                let info = vk::FenceCreateInfo::default()
                    .flags(vk::FenceCreateFlags::from_raw(f.value_u32("flags")));
                let fence = unsafe { self.device(raw)?.create_fence(&info, None) }?;
                Ok(self.track(ObjectKind::Fence, raw, fence))
            }
            E::ResetFences => {
                let fences: Vec<vk::Fence> = handles(f, "fences");
                done(unsafe { self.device(f.value("device"))?.reset_fences(&fences) })
            }
            E::WaitForFences => {
                let fences: Vec<vk::Fence> = handles(f, "fences");
                done(unsafe {
                    self.device(f.value("device"))?
                        .wait_for_fences(&fences, flag(f, "wait_all"), f.value("timeout"))
                })
            }
            E::GetFenceStatus => {
                let signaled = unsafe {
                    self.device(f.value("device"))?
                        .get_fence_status(handle(f, "fence"))
                }?;
                Ok(Invocation::with_result(if signaled {
                    vk::Result::SUCCESS
                } else {
                    vk::Result::NOT_READY
                }))
            }
            E::CreateSemaphore => {
                let raw = f.value("device");
                let info = vk::SemaphoreCreateInfo::default()
                    .flags(vk::SemaphoreCreateFlags::from_raw(f.value_u32("flags")));
                let semaphore = unsafe { self.device(raw)?.create_semaphore(&info, None) }?;
                Ok(self.track(ObjectKind::Semaphore, raw, semaphore))
            }

            // ── Presentation ────────────────────────────────
            E::CreateSurfaceKhr => {
                let raw = f.value("instance");
                let state = self
                    .instances
                    .get_mut(&raw)
                    .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)?;
                let headless = state
                    .headless
                    .as_ref()
                    .ok_or(vk::Result::ERROR_EXTENSION_NOT_PRESENT)?;
                let info = vk::HeadlessSurfaceCreateInfoEXT::default();
                let surface = unsafe { headless.create_headless_surface(&info, None) }?;
                state.surfaces.push(surface);
                debug!(
                    width = f.value("width"),
                    height = f.value("height"),
                    "headless surface stands in for trace window"
                );
                Ok(Invocation::created(vec![surface.as_raw()]))
            }
            E::DestroySurfaceKhr => {
                let surface = vk::SurfaceKHR::from_raw(f.value("surface"));
                if let Some(state) = self.instances.get_mut(&f.value("instance")) {
                    state.surfaces.retain(|&s| s != surface);
                    unsafe { state.surface.destroy_surface(surface, None) };
                }
                Ok(Invocation::ok())
            }
            E::GetPhysicalDeviceSurfaceSupportKhr => {
                let pd = f.value("physical_device");
                let family = f.value_u32("queue_family_index");
                let supported = unsafe {
                    self.instance_of(pd)?.surface.get_physical_device_surface_support(
                        vk::PhysicalDevice::from_raw(pd),
                        family,
                        handle(f, "surface"),
                    )
                }?;
                if !supported && f.value("supported") != 0 {
                    warn!(queue_family = family, "queue family cannot present on replay surface");
                }
                Ok(Invocation::ok())
            }
            E::CreateSwapchainKhr => {
                let raw = f.value("device");
                let families = f.values_u32("queue_family_indices");
                let info = vk::SwapchainCreateInfoKHR::default()
                    .surface(handle(f, "surface"))
                    .min_image_count(f.value_u32("min_image_count"))
                    .image_format(vk::Format::from_raw(int(f, "image_format")))
                    .image_color_space(vk::ColorSpaceKHR::from_raw(int(f, "image_color_space")))
                    .image_extent(vk::Extent2D {
                        width: f.value_u32("width"),
                        height: f.value_u32("height"),
                    })
                    .image_array_layers(f.value_u32("image_array_layers"))
                    .image_usage(vk::ImageUsageFlags::from_raw(f.value_u32("image_usage")))
                    .image_sharing_mode(vk::SharingMode::from_raw(int(f, "image_sharing_mode")))
                    .queue_family_indices(&families)
                    .pre_transform(vk::SurfaceTransformFlagsKHR::from_raw(f.value_u32("pre_transform")))
                    .composite_alpha(vk::CompositeAlphaFlagsKHR::from_raw(f.value_u32("composite_alpha")))
                    .present_mode(vk::PresentModeKHR::from_raw(int(f, "present_mode")))
                    .clipped(flag(f, "clipped"))
                    .old_swapchain(handle(f, "old_swapchain"));
                let swapchain = unsafe { swapchain_loader(self.device_state(raw)?)?.create_swapchain(&info, None) }?;
                Ok(self.track(ObjectKind::SwapchainKhr, raw, swapchain))
            }
            E::GetSwapchainImagesKhr => {
                let state = self.device_state(f.value("device"))?;
                let images = unsafe { swapchain_loader(state)?.get_swapchain_images(handle(f, "swapchain")) }?;
                Ok(Invocation::created(images.iter().map(|i| i.as_raw()).collect()))
            }
            E::AcquireNextImageKhr => {
                let state = self.device_state(f.value("device"))?;
                let (index, suboptimal) = unsafe {
                    swapchain_loader(state)?.acquire_next_image(
                        handle(f, "swapchain"),
                        f.value("timeout"),
                        handle(f, "semaphore"),
                        handle(f, "fence"),
                    )
                }?;
                let mut invocation = Invocation::outputs(vec![u64::from(index)]);
                if suboptimal {
                    invocation.result = vk::Result::SUBOPTIMAL_KHR;
                }
                Ok(invocation)
            }
            E::QueuePresentKhr => {
                let queue = f.value("queue");
                let (device, _) = self.owner(queue)?;
                let wait: Vec<vk::Semaphore> = handles(f, "wait_semaphores");
                let swapchains: Vec<vk::SwapchainKHR> = handles(f, "swapchains");
                let indices = f.values_u32("image_indices");
                let info = vk::PresentInfoKHR::default()
                    .wait_semaphores(&wait)
                    .swapchains(&swapchains)
                    .image_indices(&indices);
                let suboptimal = unsafe {
                    swapchain_loader(self.device_state(device)?)?
                        .queue_present(vk::Queue::from_raw(queue), &info)
                }?;
                Ok(Invocation::with_result(if suboptimal {
                    vk::Result::SUBOPTIMAL_KHR
                } else {
                    vk::Result::SUCCESS
                }))
            }

            // ── Destruction ─────────────────────────────────
            E::DestroyBuffer => self.destroy(ObjectKind::Buffer, f, "buffer"),
            E::DestroyBufferView => self.destroy(ObjectKind::BufferView, f, "view"),
            E::DestroyImage => self.destroy(ObjectKind::Image, f, "image"),
            E::DestroyImageView => self.destroy(ObjectKind::ImageView, f, "view"),
            E::DestroySampler => self.destroy(ObjectKind::Sampler, f, "sampler"),
            E::DestroyShaderModule => self.destroy(ObjectKind::ShaderModule, f, "module"),
            E::DestroyPipelineCache => self.destroy(ObjectKind::PipelineCache, f, "cache"),
            E::DestroyDescriptorSetLayout => self.destroy(ObjectKind::DescriptorSetLayout, f, "layout"),
            E::DestroyPipelineLayout => self.destroy(ObjectKind::PipelineLayout, f, "layout"),
            E::DestroyDescriptorPool => self.destroy(ObjectKind::DescriptorPool, f, "pool"),
            E::DestroyPipeline => self.destroy(ObjectKind::Pipeline, f, "pipeline"),
            E::DestroyRenderPass => self.destroy(ObjectKind::RenderPass, f, "render_pass"),
            E::DestroyFramebuffer => self.destroy(ObjectKind::Framebuffer, f, "framebuffer"),
            E::DestroyCommandPool => self.destroy(ObjectKind::CommandPool, f, "command_pool"),
            E::DestroyFence => self.destroy(ObjectKind::Fence, f, "fence"),
            E::DestroySemaphore => self.destroy(ObjectKind::Semaphore, f, "semaphore"),
            E::DestroySwapchainKhr => self.destroy(ObjectKind::SwapchainKhr, f, "swapchain"),

            // Answered by the dispatch core itself, or through the
            // dedicated memory methods.
            E::GetPhysicalDeviceProperties
            | E::GetPhysicalDeviceQueueFamilyProperties
            | E::GetPhysicalDeviceMemoryProperties
            | E::AllocateMemory
            | E::FreeMemory
            | E::MapMemory
            | E::UnmapMemory
            | E::FlushMappedMemoryRanges
            | E::InvalidateMappedMemoryRanges => {
                debug!(entry = entry.name(), "no native work for call");
                Ok(Invocation::ok())
            }
        }
    }

    fn create_instance(&mut self, f: &Fields<'_>) -> VkResult<Invocation> {
        let available_ext: HashSet<String> =
            unsafe { self.entry.enumerate_instance_extension_properties(None) }?
                .iter()
                .filter_map(|e| e.extension_name_as_c_str().ok())
                .map(|s| s.to_string_lossy().into_owned())
                .collect();
        let available_layers: HashSet<String> = unsafe { self.entry.enumerate_instance_layer_properties() }?
            .iter()
            .filter_map(|l| l.layer_name_as_c_str().ok())
            .map(|s| s.to_string_lossy().into_owned())
            .collect();

        let mut requested: Vec<String> = f
            .str_list("enabled_extensions")
            .into_iter()
            .filter(|name| !WINDOW_SYSTEM_EXTENSIONS.contains(&name.as_str()))
            .collect();
        let headless = ext::headless_surface::NAME.to_string_lossy().into_owned();
        if available_ext.contains(&headless) {
            for name in [khr::surface::NAME.to_string_lossy().into_owned(), headless.clone()] {
                if !requested.contains(&name) {
                    requested.push(name);
                }
            }
        } else {
            warn!("VK_EXT_headless_surface unavailable, presentation will fail");
        }
        let extensions = supported_names(requested, &available_ext, "instance extension");
        let layers = supported_names(f.str_list("enabled_layers"), &available_layers, "layer");
        let extension_ptrs: Vec<_> = extensions.iter().map(|s| s.as_ptr()).collect();
        let layer_ptrs: Vec<_> = layers.iter().map(|s| s.as_ptr()).collect();

        let app_name = CString::new(f.string("app_name")).unwrap_or_default();
        let engine_name = CString::new(f.string("engine_name")).unwrap_or_default();
        let api_version = match f.value_u32("api_version") {
            0 => vk::make_api_version(0, 1, 0, 0),
            v => v,
        };
        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(f.value_u32("app_version"))
            .engine_name(&engine_name)
            .engine_version(f.value_u32("engine_version"))
            .api_version(api_version);
        let info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layer_ptrs)
            .enabled_extension_names(&extension_ptrs);

        let instance = unsafe { self.entry.create_instance(&info, None) }?;
        let raw = instance.handle().as_raw();
        let headless = extensions
            .iter()
            .any(|e| e.as_c_str() == ext::headless_surface::NAME)
            .then(|| ext::headless_surface::Instance::new(&self.entry, &instance));
        let surface = khr::surface::Instance::new(&self.entry, &instance);
        info!(
            app = %f.string("app_name"),
            extensions = extensions.len(),
            layers = layers.len(),
            "created Vulkan instance"
        );
        self.instances.insert(
            raw,
            InstanceState {
                instance,
                surface,
                headless,
                surfaces: Vec::new(),
            },
        );
        Ok(Invocation::created(vec![raw]))
    }

    fn create_device(&mut self, f: &Fields<'_>) -> VkResult<Invocation> {
        let pd_raw = f.value("physical_device");
        let pd = vk::PhysicalDevice::from_raw(pd_raw);
        let instance = &self.instance_of(pd_raw)?.instance;

        let available: HashSet<String> = unsafe { instance.enumerate_device_extension_properties(pd) }?
            .iter()
            .filter_map(|e| e.extension_name_as_c_str().ok())
            .map(|s| s.to_string_lossy().into_owned())
            .collect();
        let extensions = supported_names(f.str_list("enabled_extensions"), &available, "device extension");
        let extension_ptrs: Vec<_> = extensions.iter().map(|s| s.as_ptr()).collect();

        let supported = unsafe { instance.get_physical_device_features(pd) };
        let features = filter_features(f.bytes("enabled_features"), &supported);

        let queue_records = f.records("queue_create_infos");
        let priorities: Vec<Vec<f32>> = queue_records
            .iter()
            .map(|q| bytemuck::pod_collect_to_vec(q.bytes("queue_priorities")))
            .collect();
        let queue_infos: Vec<_> = queue_records
            .iter()
            .zip(&priorities)
            .map(|(q, priorities)| {
                vk::DeviceQueueCreateInfo::default()
                    .flags(vk::DeviceQueueCreateFlags::from_raw(q.value_u32("flags")))
                    .queue_family_index(q.value_u32("queue_family_index"))
                    .queue_priorities(priorities)
            })
            .collect();

        let info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_ptrs)
            .enabled_features(&features);
        let device = unsafe { instance.create_device(pd, &info, None) }?;
        let swapchain = extensions
            .iter()
            .any(|e| e.as_c_str() == khr::swapchain::NAME)
            .then(|| khr::swapchain::Device::new(instance, &device));
        let raw = device.handle().as_raw();
        info!(extensions = extensions.len(), queues = queue_infos.len(), "created Vulkan device");
        self.devices.insert(
            raw,
            DeviceState {
                device,
                physical_device: pd_raw,
                swapchain,
            },
        );
        Ok(Invocation::created(vec![raw]))
    }

    fn queue_submit(&mut self, f: &Fields<'_>) -> VkResult<Invocation> {
        let queue = f.value("queue");
        let (_, device) = self.owner(queue)?;
        struct Submit {
            wait: Vec<vk::Semaphore>,
            stages: Vec<vk::PipelineStageFlags>,
            command_buffers: Vec<vk::CommandBuffer>,
            signal: Vec<vk::Semaphore>,
        }
        let submits: Vec<Submit> = f
            .records("submits")
            .iter()
            .map(|s| Submit {
                wait: handles(s, "wait_semaphores"),
                stages: s
                    .values_u32("wait_dst_stage_masks")
                    .into_iter()
                    .map(vk::PipelineStageFlags::from_raw)
                    .collect(),
                command_buffers: handles(s, "command_buffers"),
                signal: handles(s, "signal_semaphores"),
            })
            .collect();
        let infos: Vec<_> = submits
            .iter()
            .map(|s| {
                vk::SubmitInfo::default()
                    .wait_semaphores(&s.wait)
                    .wait_dst_stage_mask(&s.stages)
                    .command_buffers(&s.command_buffers)
                    .signal_semaphores(&s.signal)
            })
            .collect();
        done(unsafe { device.queue_submit(vk::Queue::from_raw(queue), &infos, handle(f, "fence")) })
    }

    fn queue_bind_sparse(&mut self, f: &Fields<'_>) -> VkResult<Invocation> {
        let queue = f.value("queue");
        let (_, device) = self.owner(queue)?;
        struct Bind {
            wait: Vec<vk::Semaphore>,
            buffers: Vec<(vk::Buffer, Vec<vk::SparseMemoryBind>)>,
            images: Vec<(vk::Image, Vec<vk::SparseMemoryBind>)>,
            signal: Vec<vk::Semaphore>,
        }
        fn regions(record: &Fields<'_>) -> Vec<vk::SparseMemoryBind> {
            record
                .records("binds")
                .iter()
                .map(|b| vk::SparseMemoryBind {
                    resource_offset: b.value("resource_offset"),
                    size: b.value("size"),
                    memory: handle(b, "memory"),
                    memory_offset: b.value("memory_offset"),
                    flags: vk::SparseMemoryBindFlags::from_raw(b.value_u32("flags")),
                })
                .collect()
        }
        let binds: Vec<Bind> = f
            .records("bind_infos")
            .iter()
            .map(|info| Bind {
                wait: handles(info, "wait_semaphores"),
                buffers: info
                    .records("buffer_binds")
                    .iter()
                    .map(|b| (handle(b, "buffer"), regions(b)))
                    .collect(),
                images: info
                    .records("image_opaque_binds")
                    .iter()
                    .map(|b| (handle(b, "image"), regions(b)))
                    .collect(),
                signal: handles(info, "signal_semaphores"),
            })
            .collect();
        let buffer_infos: Vec<Vec<_>> = binds
            .iter()
            .map(|b| {
                b.buffers
                    .iter()
                    .map(|(buffer, regions)| {
                        vk::SparseBufferMemoryBindInfo::default().buffer(*buffer).binds(regions)
                    })
                    .collect()
            })
            .collect();
        let image_infos: Vec<Vec<_>> = binds
            .iter()
            .map(|b| {
                b.images
                    .iter()
                    .map(|(image, regions)| {
                        vk::SparseImageOpaqueMemoryBindInfo::default().image(*image).binds(regions)
                    })
                    .collect()
            })
            .collect();
        let infos: Vec<_> = binds
            .iter()
            .zip(&buffer_infos)
            .zip(&image_infos)
            .map(|((b, buffers), images)| {
                vk::BindSparseInfo::default()
                    .wait_semaphores(&b.wait)
                    .buffer_binds(buffers)
                    .image_opaque_binds(images)
                    .signal_semaphores(&b.signal)
            })
            .collect();
        done(unsafe { device.queue_bind_sparse(vk::Queue::from_raw(queue), &infos, handle(f, "fence")) })
    }

    fn update_descriptor_sets(&mut self, f: &Fields<'_>) -> VkResult<Invocation> {
        let device = self.device(f.value("device"))?;
        let records = f.records("writes");
        let images: Vec<Vec<vk::DescriptorImageInfo>> = records
            .iter()
            .map(|w| {
                w.records("image_infos")
                    .iter()
                    .map(|i| vk::DescriptorImageInfo {
                        sampler: handle(i, "sampler"),
                        image_view: handle(i, "image_view"),
                        image_layout: vk::ImageLayout::from_raw(int(i, "image_layout")),
                    })
                    .collect()
            })
            .collect();
        let buffers: Vec<Vec<vk::DescriptorBufferInfo>> = records
            .iter()
            .map(|w| {
                w.records("buffer_infos")
                    .iter()
                    .map(|b| vk::DescriptorBufferInfo {
                        buffer: handle(b, "buffer"),
                        offset: b.value("offset"),
                        range: b.value("range"),
                    })
                    .collect()
            })
            .collect();
        let texels: Vec<Vec<vk::BufferView>> = records
            .iter()
            .map(|w| handles(w, "texel_buffer_views"))
            .collect();

        let writes: Vec<_> = records
            .iter()
            .enumerate()
            .map(|(i, w)| {
                let ty = vk::DescriptorType::from_raw(int(w, "descriptor_type"));
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(handle(w, "dst_set"))
                    .dst_binding(w.value_u32("dst_binding"))
                    .dst_array_element(w.value_u32("dst_array_element"))
                    .descriptor_type(ty);
                match ty {
                    vk::DescriptorType::UNIFORM_TEXEL_BUFFER | vk::DescriptorType::STORAGE_TEXEL_BUFFER => {
                        write.texel_buffer_view(&texels[i])
                    }
                    vk::DescriptorType::UNIFORM_BUFFER
                    | vk::DescriptorType::STORAGE_BUFFER
                    | vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
                    | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC => write.buffer_info(&buffers[i]),
                    _ => write.image_info(&images[i]),
                }
            })
            .collect();
        let copies: Vec<_> = f
            .records("copies")
            .iter()
            .map(|c| {
                vk::CopyDescriptorSet::default()
                    .src_set(handle(c, "src_set"))
                    .src_binding(c.value_u32("src_binding"))
                    .src_array_element(c.value_u32("src_array_element"))
                    .dst_set(handle(c, "dst_set"))
                    .dst_binding(c.value_u32("dst_binding"))
                    .dst_array_element(c.value_u32("dst_array_element"))
                    .descriptor_count(c.value_u32("descriptor_count"))
            })
            .collect();
        unsafe { device.update_descriptor_sets(&writes, &copies) };
        Ok(Invocation::ok())
    }

    fn create_compute_pipelines(&mut self, f: &Fields<'_>) -> VkResult<Invocation> {
        let raw = f.value("device");
        let records = f.records("create_infos");
        let names: Vec<CString> = records
            .iter()
            .map(|r| CString::new(r.string("entry_point")).unwrap_or_default())
            .collect();
        let infos: Vec<_> = records
            .iter()
            .zip(&names)
            .map(|(r, name)| {
                vk::ComputePipelineCreateInfo::default()
                    .flags(vk::PipelineCreateFlags::from_raw(r.value_u32("flags")))
                    .stage(
                        vk::PipelineShaderStageCreateInfo::default()
                            .stage(vk::ShaderStageFlags::from_raw(r.value_u32("stage")))
                            .module(handle(r, "module"))
                            .name(name),
                    )
                    .layout(handle(r, "layout"))
            })
            .collect();
        let pipelines = unsafe {
            self.device(raw)?
                .create_compute_pipelines(handle(f, "pipeline_cache"), &infos, None)
        }
        .map_err(|(_, e)| e)?;
        Ok(self.track_pipelines(raw, pipelines))
    }

    fn create_graphics_pipelines(&mut self, f: &Fields<'_>) -> VkResult<Invocation> {
        let raw = f.value("device");
        let descs: Vec<GraphicsDesc> = f.records("create_infos").iter().map(GraphicsDesc::read).collect();
        let stages: Vec<Vec<_>> = descs
            .iter()
            .map(|d| {
                d.stages
                    .iter()
                    .map(|(stage, module, name)| {
                        vk::PipelineShaderStageCreateInfo::default()
                            .stage(*stage)
                            .module(*module)
                            .name(name)
                    })
                    .collect()
            })
            .collect();
        let states: Vec<GraphicsStates<'_>> = descs.iter().map(GraphicsStates::new).collect();
        let infos: Vec<_> = descs
            .iter()
            .zip(&stages)
            .zip(&states)
            .map(|((d, stages), s)| {
                vk::GraphicsPipelineCreateInfo::default()
                    .flags(d.flags)
                    .stages(stages)
                    .vertex_input_state(&s.vertex_input)
                    .input_assembly_state(&s.input_assembly)
                    .viewport_state(&s.viewport)
                    .rasterization_state(&s.rasterization)
                    .multisample_state(&s.multisample)
                    .depth_stencil_state(&s.depth_stencil)
                    .color_blend_state(&s.color_blend)
                    .dynamic_state(&s.dynamic)
                    .layout(d.layout)
                    .render_pass(d.render_pass)
                    .subpass(d.subpass)
            })
            .collect();
        let pipelines = unsafe {
            self.device(raw)?
                .create_graphics_pipelines(handle(f, "pipeline_cache"), &infos, None)
        }
        .map_err(|(_, e)| e)?;
        Ok(self.track_pipelines(raw, pipelines))
    }

    fn track_pipelines(&mut self, device: u64, pipelines: Vec<vk::Pipeline>) -> Invocation {
        let raws: Vec<u64> = pipelines.iter().map(|p| p.as_raw()).collect();
        for &p in &raws {
            self.children.insert((ObjectKind::Pipeline, p), device);
        }
        Invocation::created(raws)
    }

    fn create_render_pass(&mut self, f: &Fields<'_>) -> VkResult<Invocation> {
        let raw = f.value("device");
        let attachments: Vec<_> = f
            .records("attachments")
            .iter()
            .map(|a| vk::AttachmentDescription {
                flags: vk::AttachmentDescriptionFlags::from_raw(a.value_u32("flags")),
                format: vk::Format::from_raw(int(a, "format")),
                samples: vk::SampleCountFlags::from_raw(a.value_u32("samples")),
                load_op: vk::AttachmentLoadOp::from_raw(int(a, "load_op")),
                store_op: vk::AttachmentStoreOp::from_raw(int(a, "store_op")),
                stencil_load_op: vk::AttachmentLoadOp::from_raw(int(a, "stencil_load_op")),
                stencil_store_op: vk::AttachmentStoreOp::from_raw(int(a, "stencil_store_op")),
                initial_layout: vk::ImageLayout::from_raw(int(a, "initial_layout")),
                final_layout: vk::ImageLayout::from_raw(int(a, "final_layout")),
            })
            .collect();
        let references = |records: Vec<Fields<'_>>| -> Vec<vk::AttachmentReference> {
            records
                .iter()
                .map(|r| vk::AttachmentReference {
                    attachment: r.value_u32("attachment"),
                    layout: vk::ImageLayout::from_raw(int(r, "layout")),
                })
                .collect()
        };
        let subpass_records = f.records("subpasses");
        let refs: Vec<[Vec<vk::AttachmentReference>; 3]> = subpass_records
            .iter()
            .map(|s| {
                [
                    references(s.records("input_attachments")),
                    references(s.records("color_attachments")),
                    references(s.records("depth_stencil_attachment")),
                ]
            })
            .collect();
        let subpasses: Vec<_> = subpass_records
            .iter()
            .zip(&refs)
            .map(|(s, [input, color, depth])| {
                let subpass = vk::SubpassDescription::default()
                    .pipeline_bind_point(vk::PipelineBindPoint::from_raw(int(s, "pipeline_bind_point")))
                    .input_attachments(input)
                    .color_attachments(color);
                match depth.first() {
                    Some(depth) => subpass.depth_stencil_attachment(depth),
                    None => subpass,
                }
            })
            .collect();
        let dependencies: Vec<_> = f
            .records("dependencies")
            .iter()
            .map(|d| vk::SubpassDependency {
                src_subpass: d.value_u32("src_subpass"),
                dst_subpass: d.value_u32("dst_subpass"),
                src_stage_mask: vk::PipelineStageFlags::from_raw(d.value_u32("src_stage_mask")),
                dst_stage_mask: vk::PipelineStageFlags::from_raw(d.value_u32("dst_stage_mask")),
                src_access_mask: vk::AccessFlags::from_raw(d.value_u32("src_access_mask")),
                dst_access_mask: vk::AccessFlags::from_raw(d.value_u32("dst_access_mask")),
                dependency_flags: vk::DependencyFlags::from_raw(d.value_u32("dependency_flags")),
            })
            .collect();
        let info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);
        let render_pass = unsafe { self.device(raw)?.create_render_pass(&info, None) }?;
        Ok(self.track(ObjectKind::RenderPass, raw, render_pass))
    }

    // ── Teardown ────────────────────────────────────────────

    fn destroy(&mut self, kind: ObjectKind, f: &Fields<'_>, field: &str) -> VkResult<Invocation> {
        let raw = f.value(field);
        self.children.remove(&(kind, raw));
        let state = self.device_state(f.value("device"))?;
        destroy_child(state, kind, raw);
        Ok(Invocation::ok())
    }

    /// Destroy a device and every child still alive on it.
    fn release_device(&mut self, raw: u64) {
        let Some(state) = self.devices.remove(&raw) else {
            return;
        };
        if let Err(e) = unsafe { state.device.device_wait_idle() } {
            warn!(result = ?e, "device did not go idle before teardown");
        }
        let mut released = 0u32;
        for &kind in RELEASE_ORDER {
            let handles: Vec<u64> = self
                .children
                .iter()
                .filter(|(key, device)| key.0 == kind && **device == raw)
                .map(|(key, _)| key.1)
                .collect();
            for handle in handles {
                self.children.remove(&(kind, handle));
                if kind == ObjectKind::DeviceMemory {
                    self.mappings.remove(&handle);
                }
                destroy_child(&state, kind, handle);
                released += 1;
            }
        }
        self.owners.retain(|_, device| *device != raw);
        unsafe { state.device.destroy_device(None) };
        if released > 0 {
            info!(released, "destroyed leftover device objects");
        }
        debug!(device = raw, "destroyed Vulkan device");
    }

    fn release_instance(&mut self, raw: u64) {
        let devices: Vec<u64> = self
            .devices
            .iter()
            .filter(|(_, d)| self.physical_devices.get(&d.physical_device) == Some(&raw))
            .map(|(&device, _)| device)
            .collect();
        for device in devices {
            self.release_device(device);
        }
        let Some(state) = self.instances.remove(&raw) else {
            return;
        };
        for surface in &state.surfaces {
            unsafe { state.surface.destroy_surface(*surface, None) };
        }
        self.physical_devices.retain(|_, instance| *instance != raw);
        unsafe { state.instance.destroy_instance(None) };
        debug!(instance = raw, "destroyed Vulkan instance");
    }

    fn mapping(&self, memory: u64, offset: u64, len: usize) -> Result<*mut u8, vk::Result> {
        let m = self.mappings.get(&memory).ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        let end = offset.checked_add(len as u64).ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        if offset < m.offset || end > m.offset + m.size {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        Ok(unsafe { m.ptr.cast::<u8>().add((offset - m.offset) as usize) })
    }

    fn mapped_ranges(&self, ranges: &[MappedRange]) -> Vec<vk::MappedMemoryRange<'static>> {
        // Whole mappings sidestep nonCoherentAtomSize alignment.
        ranges
            .iter()
            .filter_map(|r| {
                self.mappings.get(&r.memory).map(|m| {
                    vk::MappedMemoryRange::default()
                        .memory(vk::DeviceMemory::from_raw(r.memory))
                        .offset(m.offset)
                        .size(vk::WHOLE_SIZE)
                })
            })
            .collect()
    }
}

impl Drop for AshDriver {
    fn drop(&mut self) {
        let devices: Vec<u64> = self.devices.keys().copied().collect();
        for device in devices {
            self.release_device(device);
        }
        let instances: Vec<u64> = self.instances.keys().copied().collect();
        for instance in instances {
            self.release_instance(instance);
        }
    }
}

impl ReplayDriver for AshDriver {
    fn name(&self) -> &'static str {
        "vulkan"
    }

    fn invoke(&mut self, call: &Call<'_>) -> Invocation {
        match self.execute(call.entry, &call.fields) {
            Ok(invocation) => invocation,
            Err(result) => Invocation::with_result(result),
        }
    }

    fn queue_family_flags(&mut self, physical_device: u64) -> Vec<u32> {
        let Ok(state) = self.instance_of(physical_device) else {
            return Vec::new();
        };
        unsafe {
            state
                .instance
                .get_physical_device_queue_family_properties(vk::PhysicalDevice::from_raw(physical_device))
        }
        .iter()
        .map(|q| q.queue_flags.as_raw())
        .collect()
    }

    fn memory_type_flags(&mut self, physical_device: u64) -> Vec<u32> {
        let Ok(state) = self.instance_of(physical_device) else {
            return Vec::new();
        };
        let props = unsafe {
            state
                .instance
                .get_physical_device_memory_properties(vk::PhysicalDevice::from_raw(physical_device))
        };
        props.memory_types[..props.memory_type_count as usize]
            .iter()
            .map(|t| t.property_flags.as_raw())
            .collect()
    }

    fn device_identity(&mut self, physical_device: u64) -> Option<DeviceIdentity> {
        let state = self.instance_of(physical_device).ok()?;
        let props = unsafe {
            state
                .instance
                .get_physical_device_properties(vk::PhysicalDevice::from_raw(physical_device))
        };
        let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        Some(DeviceIdentity {
            vendor_id: props.vendor_id,
            device_id: props.device_id,
            driver_version: props.driver_version,
            api_version: props.api_version,
            name,
        })
    }

    fn buffer_memory_requirements(&mut self, device: u64, buffer: u64) -> MemoryRequirements {
        let Ok(device) = self.device(device) else {
            return MemoryRequirements::default();
        };
        let r = unsafe { device.get_buffer_memory_requirements(vk::Buffer::from_raw(buffer)) };
        MemoryRequirements {
            size: r.size,
            alignment: r.alignment,
            memory_type_bits: r.memory_type_bits,
        }
    }

    fn image_memory_requirements(&mut self, device: u64, image: u64) -> MemoryRequirements {
        let Ok(device) = self.device(device) else {
            return MemoryRequirements::default();
        };
        let r = unsafe { device.get_image_memory_requirements(vk::Image::from_raw(image)) };
        MemoryRequirements {
            size: r.size,
            alignment: r.alignment,
            memory_type_bits: r.memory_type_bits,
        }
    }

    fn allocate_memory(&mut self, device: u64, size: u64, memory_type: u32) -> Result<u64, vk::Result> {
        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type);
        let memory = unsafe { self.device(device)?.allocate_memory(&info, None) }?;
        self.children.insert((ObjectKind::DeviceMemory, memory.as_raw()), device);
        Ok(memory.as_raw())
    }

    fn free_memory(&mut self, device: u64, memory: u64) {
        self.mappings.remove(&memory);
        self.children.remove(&(ObjectKind::DeviceMemory, memory));
        if let Ok(device) = self.device(device) {
            unsafe { device.free_memory(vk::DeviceMemory::from_raw(memory), None) };
        }
    }

    fn map_memory(&mut self, device: u64, memory: u64, offset: u64, size: u64) -> Result<(), vk::Result> {
        let ptr = unsafe {
            self.device(device)?.map_memory(
                vk::DeviceMemory::from_raw(memory),
                offset,
                size,
                vk::MemoryMapFlags::empty(),
            )
        }?;
        self.mappings.insert(memory, Mapping { offset, size, ptr });
        Ok(())
    }

    fn unmap_memory(&mut self, device: u64, memory: u64) {
        if self.mappings.remove(&memory).is_none() {
            return;
        }
        if let Ok(device) = self.device(device) {
            unsafe { device.unmap_memory(vk::DeviceMemory::from_raw(memory)) };
        }
    }

    fn write_mapped(&mut self, memory: u64, offset: u64, data: &[u8]) -> Result<(), vk::Result> {
        let dst = self.mapping(memory, offset, data.len())?;
        // SAFETY: the range was checked against the live mapping.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        Ok(())
    }

    fn read_mapped(&mut self, memory: u64, offset: u64, len: usize) -> Result<Vec<u8>, vk::Result> {
        let src = self.mapping(memory, offset, len)?;
        let mut out = vec![0u8; len];
        // SAFETY: the range was checked against the live mapping.
        unsafe { std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), len) };
        Ok(out)
    }

    fn flush_mapped(&mut self, device: u64, ranges: &[MappedRange]) -> vk::Result {
        let ranges = self.mapped_ranges(ranges);
        match self.device(device) {
            Ok(device) => result_of(unsafe { device.flush_mapped_memory_ranges(&ranges) }),
            Err(e) => e,
        }
    }

    fn invalidate_mapped(&mut self, device: u64, ranges: &[MappedRange]) -> vk::Result {
        let ranges = self.mapped_ranges(ranges);
        match self.device(device) {
            Ok(device) => result_of(unsafe { device.invalidate_mapped_memory_ranges(&ranges) }),
            Err(e) => e,
        }
    }
}

// ── Recording ───────────────────────────────────────────────

fn record(device: &ash::Device, cb: vk::CommandBuffer, entry: EntryPoint, f: &Fields<'_>) {
    let bind_point = || vk::PipelineBindPoint::from_raw(int(f, "pipeline_bind_point"));
    unsafe {
        match entry {
            E::CmdBindPipeline => device.cmd_bind_pipeline(cb, bind_point(), handle(f, "pipeline")),
            E::CmdBindDescriptorSets => {
                let sets: Vec<vk::DescriptorSet> = handles(f, "descriptor_sets");
                device.cmd_bind_descriptor_sets(
                    cb,
                    bind_point(),
                    handle(f, "layout"),
                    f.value_u32("first_set"),
                    &sets,
                    &f.values_u32("dynamic_offsets"),
                )
            }
            E::CmdBindVertexBuffers => {
                let buffers: Vec<vk::Buffer> = handles(f, "buffers");
                device.cmd_bind_vertex_buffers(
                    cb,
                    f.value_u32("first_binding"),
                    &buffers,
                    &f.values("offsets"),
                )
            }
            E::CmdBindIndexBuffer => device.cmd_bind_index_buffer(
                cb,
                handle(f, "buffer"),
                f.value("offset"),
                vk::IndexType::from_raw(int(f, "index_type")),
            ),
            E::CmdSetViewport => {
                device.cmd_set_viewport(cb, f.value_u32("first_viewport"), &viewports(f.bytes("viewports")))
            }
            E::CmdSetScissor => {
                device.cmd_set_scissor(cb, f.value_u32("first_scissor"), &rects(f.records("scissors")))
            }
            E::CmdPushConstants => device.cmd_push_constants(
                cb,
                handle(f, "layout"),
                vk::ShaderStageFlags::from_raw(f.value_u32("stage_flags")),
                f.value_u32("offset"),
                f.bytes("data"),
            ),
            E::CmdDraw => device.cmd_draw(
                cb,
                f.value_u32("vertex_count"),
                f.value_u32("instance_count"),
                f.value_u32("first_vertex"),
                f.value_u32("first_instance"),
            ),
            E::CmdDrawIndexed => device.cmd_draw_indexed(
                cb,
                f.value_u32("index_count"),
                f.value_u32("instance_count"),
                f.value_u32("first_index"),
                int(f, "vertex_offset"),
                f.value_u32("first_instance"),
            ),
            E::CmdDispatch => device.cmd_dispatch(
                cb,
                f.value_u32("group_count_x"),
                f.value_u32("group_count_y"),
                f.value_u32("group_count_z"),
            ),
            E::CmdCopyBuffer => {
                let regions: Vec<_> = f
                    .records("regions")
                    .iter()
                    .map(|r| vk::BufferCopy {
                        src_offset: r.value("src_offset"),
                        dst_offset: r.value("dst_offset"),
                        size: r.value("size"),
                    })
                    .collect();
                device.cmd_copy_buffer(cb, handle(f, "src_buffer"), handle(f, "dst_buffer"), &regions)
            }
            E::CmdCopyBufferToImage => device.cmd_copy_buffer_to_image(
                cb,
                handle(f, "src_buffer"),
                handle(f, "dst_image"),
                vk::ImageLayout::from_raw(int(f, "dst_image_layout")),
                &buffer_image_copies(f),
            ),
            E::CmdCopyImageToBuffer => device.cmd_copy_image_to_buffer(
                cb,
                handle(f, "src_image"),
                vk::ImageLayout::from_raw(int(f, "src_image_layout")),
                handle(f, "dst_buffer"),
                &buffer_image_copies(f),
            ),
            E::CmdPipelineBarrier => {
                let memory: Vec<_> = f
                    .records("memory_barriers")
                    .iter()
                    .map(|b| {
                        vk::MemoryBarrier::default()
                            .src_access_mask(vk::AccessFlags::from_raw(b.value_u32("src_access_mask")))
                            .dst_access_mask(vk::AccessFlags::from_raw(b.value_u32("dst_access_mask")))
                    })
                    .collect();
                let buffers: Vec<_> = f
                    .records("buffer_barriers")
                    .iter()
                    .map(|b| {
                        vk::BufferMemoryBarrier::default()
                            .src_access_mask(vk::AccessFlags::from_raw(b.value_u32("src_access_mask")))
                            .dst_access_mask(vk::AccessFlags::from_raw(b.value_u32("dst_access_mask")))
                            .src_queue_family_index(b.value_u32("src_queue_family_index"))
                            .dst_queue_family_index(b.value_u32("dst_queue_family_index"))
                            .buffer(handle(b, "buffer"))
                            .offset(b.value("offset"))
                            .size(b.value("size"))
                    })
                    .collect();
                let images: Vec<_> = f
                    .records("image_barriers")
                    .iter()
                    .map(|b| {
                        vk::ImageMemoryBarrier::default()
                            .src_access_mask(vk::AccessFlags::from_raw(b.value_u32("src_access_mask")))
                            .dst_access_mask(vk::AccessFlags::from_raw(b.value_u32("dst_access_mask")))
                            .old_layout(vk::ImageLayout::from_raw(int(b, "old_layout")))
                            .new_layout(vk::ImageLayout::from_raw(int(b, "new_layout")))
                            .src_queue_family_index(b.value_u32("src_queue_family_index"))
                            .dst_queue_family_index(b.value_u32("dst_queue_family_index"))
                            .image(handle(b, "image"))
                            .subresource_range(vk::ImageSubresourceRange {
                                aspect_mask: vk::ImageAspectFlags::from_raw(b.value_u32("aspect_mask")),
                                base_mip_level: b.value_u32("base_mip_level"),
                                level_count: b.value_u32("level_count"),
                                base_array_layer: b.value_u32("base_array_layer"),
                                layer_count: b.value_u32("layer_count"),
                            })
                    })
                    .collect();
                device.cmd_pipeline_barrier(
                    cb,
                    vk::PipelineStageFlags::from_raw(f.value_u32("src_stage_mask")),
                    vk::PipelineStageFlags::from_raw(f.value_u32("dst_stage_mask")),
                    vk::DependencyFlags::from_raw(f.value_u32("dependency_flags")),
                    &memory,
                    &buffers,
                    &images,
                )
            }
            E::CmdBeginRenderPass => {
                let clear_values: Vec<vk::ClearValue> =
                    bytemuck::pod_collect_to_vec::<u8, u32>(f.bytes("clear_values"))
                        .chunks_exact(4)
                        .map(|c| vk::ClearValue {
                            color: vk::ClearColorValue {
                                uint32: [c[0], c[1], c[2], c[3]],
                            },
                        })
                        .collect();
                let info = vk::RenderPassBeginInfo::default()
                    .render_pass(handle(f, "render_pass"))
                    .framebuffer(handle(f, "framebuffer"))
                    .render_area(vk::Rect2D {
                        offset: vk::Offset2D {
                            x: int(f, "area_x"),
                            y: int(f, "area_y"),
                        },
                        extent: vk::Extent2D {
                            width: f.value_u32("area_width"),
                            height: f.value_u32("area_height"),
                        },
                    })
                    .clear_values(&clear_values);
                device.cmd_begin_render_pass(cb, &info, vk::SubpassContents::from_raw(int(f, "contents")))
            }
            E::CmdEndRenderPass => device.cmd_end_render_pass(cb),
            _ => {}
        }
    }
}

fn buffer_image_copies(f: &Fields<'_>) -> Vec<vk::BufferImageCopy> {
    f.records("regions")
        .iter()
        .map(|r| vk::BufferImageCopy {
            buffer_offset: r.value("buffer_offset"),
            buffer_row_length: r.value_u32("buffer_row_length"),
            buffer_image_height: r.value_u32("buffer_image_height"),
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::from_raw(r.value_u32("aspect_mask")),
                mip_level: r.value_u32("mip_level"),
                base_array_layer: r.value_u32("base_array_layer"),
                layer_count: r.value_u32("layer_count"),
            },
            image_offset: vk::Offset3D {
                x: int(r, "offset_x"),
                y: int(r, "offset_y"),
                z: int(r, "offset_z"),
            },
            image_extent: vk::Extent3D {
                width: r.value_u32("width"),
                height: r.value_u32("height"),
                depth: r.value_u32("depth"),
            },
        })
        .collect()
}

// ── Graphics pipeline state ─────────────────────────────────

/// Owned parts of one graphics pipeline create info.
struct GraphicsDesc {
    flags: vk::PipelineCreateFlags,
    stages: Vec<(vk::ShaderStageFlags, vk::ShaderModule, CString)>,
    vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    topology: vk::PrimitiveTopology,
    primitive_restart: bool,
    viewports: Vec<vk::Viewport>,
    scissors: Vec<vk::Rect2D>,
    polygon_mode: vk::PolygonMode,
    cull_mode: vk::CullModeFlags,
    front_face: vk::FrontFace,
    line_width: f32,
    samples: vk::SampleCountFlags,
    depth_test: bool,
    depth_write: bool,
    depth_compare: vk::CompareOp,
    blend_attachments: Vec<vk::PipelineColorBlendAttachmentState>,
    dynamic_states: Vec<vk::DynamicState>,
    layout: vk::PipelineLayout,
    render_pass: vk::RenderPass,
    subpass: u32,
}

impl GraphicsDesc {
    fn read(r: &Fields<'_>) -> Self {
        Self {
            flags: vk::PipelineCreateFlags::from_raw(r.value_u32("flags")),
            stages: r
                .records("stages")
                .iter()
                .map(|s| {
                    (
                        vk::ShaderStageFlags::from_raw(s.value_u32("stage")),
                        handle(s, "module"),
                        CString::new(s.string("entry_point")).unwrap_or_default(),
                    )
                })
                .collect(),
            vertex_bindings: r
                .records("vertex_bindings")
                .iter()
                .map(|b| vk::VertexInputBindingDescription {
                    binding: b.value_u32("binding"),
                    stride: b.value_u32("stride"),
                    input_rate: vk::VertexInputRate::from_raw(int(b, "input_rate")),
                })
                .collect(),
            vertex_attributes: r
                .records("vertex_attributes")
                .iter()
                .map(|a| vk::VertexInputAttributeDescription {
                    location: a.value_u32("location"),
                    binding: a.value_u32("binding"),
                    format: vk::Format::from_raw(int(a, "format")),
                    offset: a.value_u32("offset"),
                })
                .collect(),
            topology: vk::PrimitiveTopology::from_raw(int(r, "topology")),
            primitive_restart: flag(r, "primitive_restart"),
            viewports: viewports(r.bytes("viewports")),
            scissors: rects(r.records("scissors")),
            polygon_mode: vk::PolygonMode::from_raw(int(r, "polygon_mode")),
            cull_mode: vk::CullModeFlags::from_raw(r.value_u32("cull_mode")),
            front_face: vk::FrontFace::from_raw(int(r, "front_face")),
            line_width: float(r, "line_width"),
            samples: vk::SampleCountFlags::from_raw(r.value_u32("rasterization_samples")),
            depth_test: flag(r, "depth_test_enable"),
            depth_write: flag(r, "depth_write_enable"),
            depth_compare: vk::CompareOp::from_raw(int(r, "depth_compare_op")),
            blend_attachments: r
                .records("blend_attachments")
                .iter()
                .map(|b| vk::PipelineColorBlendAttachmentState {
                    blend_enable: b.value_u32("blend_enable"),
                    src_color_blend_factor: vk::BlendFactor::from_raw(int(b, "src_color_factor")),
                    dst_color_blend_factor: vk::BlendFactor::from_raw(int(b, "dst_color_factor")),
                    color_blend_op: vk::BlendOp::from_raw(int(b, "color_op")),
                    src_alpha_blend_factor: vk::BlendFactor::from_raw(int(b, "src_alpha_factor")),
                    dst_alpha_blend_factor: vk::BlendFactor::from_raw(int(b, "dst_alpha_factor")),
                    alpha_blend_op: vk::BlendOp::from_raw(int(b, "alpha_op")),
                    color_write_mask: vk::ColorComponentFlags::from_raw(b.value_u32("color_write_mask")),
                })
                .collect(),
            dynamic_states: r
                .values("dynamic_states")
                .into_iter()
                .map(|s| vk::DynamicState::from_raw(s as i32))
                .collect(),
            layout: handle(r, "layout"),
            render_pass: handle(r, "render_pass"),
            subpass: r.value_u32("subpass"),
        }
    }
}

struct GraphicsStates<'a> {
    vertex_input: vk::PipelineVertexInputStateCreateInfo<'a>,
    input_assembly: vk::PipelineInputAssemblyStateCreateInfo<'a>,
    viewport: vk::PipelineViewportStateCreateInfo<'a>,
    rasterization: vk::PipelineRasterizationStateCreateInfo<'a>,
    multisample: vk::PipelineMultisampleStateCreateInfo<'a>,
    depth_stencil: vk::PipelineDepthStencilStateCreateInfo<'a>,
    color_blend: vk::PipelineColorBlendStateCreateInfo<'a>,
    dynamic: vk::PipelineDynamicStateCreateInfo<'a>,
}

impl<'a> GraphicsStates<'a> {
    fn new(d: &'a GraphicsDesc) -> Self {
        // Dynamic viewports and scissors are recorded with no static entries.
        let mut viewport = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        if !d.viewports.is_empty() {
            viewport = viewport.viewports(&d.viewports);
        }
        if !d.scissors.is_empty() {
            viewport = viewport.scissors(&d.scissors);
        }
        Self {
            vertex_input: vk::PipelineVertexInputStateCreateInfo::default()
                .vertex_binding_descriptions(&d.vertex_bindings)
                .vertex_attribute_descriptions(&d.vertex_attributes),
            input_assembly: vk::PipelineInputAssemblyStateCreateInfo::default()
                .topology(d.topology)
                .primitive_restart_enable(d.primitive_restart),
            viewport,
            rasterization: vk::PipelineRasterizationStateCreateInfo::default()
                .polygon_mode(d.polygon_mode)
                .cull_mode(d.cull_mode)
                .front_face(d.front_face)
                .line_width(d.line_width),
            multisample: vk::PipelineMultisampleStateCreateInfo::default()
                .rasterization_samples(d.samples),
            depth_stencil: vk::PipelineDepthStencilStateCreateInfo::default()
                .depth_test_enable(d.depth_test)
                .depth_write_enable(d.depth_write)
                .depth_compare_op(d.depth_compare),
            color_blend: vk::PipelineColorBlendStateCreateInfo::default()
                .attachments(&d.blend_attachments),
            dynamic: vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&d.dynamic_states),
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────

fn destroy_child(state: &DeviceState, kind: ObjectKind, raw: u64) {
    let d = &state.device;
    unsafe {
        match kind {
            ObjectKind::Framebuffer => d.destroy_framebuffer(vk::Framebuffer::from_raw(raw), None),
            ObjectKind::ImageView => d.destroy_image_view(vk::ImageView::from_raw(raw), None),
            ObjectKind::BufferView => d.destroy_buffer_view(vk::BufferView::from_raw(raw), None),
            ObjectKind::RenderPass => d.destroy_render_pass(vk::RenderPass::from_raw(raw), None),
            ObjectKind::Pipeline => d.destroy_pipeline(vk::Pipeline::from_raw(raw), None),
            ObjectKind::PipelineLayout => {
                d.destroy_pipeline_layout(vk::PipelineLayout::from_raw(raw), None)
            }
            // Frees the pool's descriptor sets.
            ObjectKind::DescriptorPool => {
                d.destroy_descriptor_pool(vk::DescriptorPool::from_raw(raw), None)
            }
            ObjectKind::DescriptorSetLayout => {
                d.destroy_descriptor_set_layout(vk::DescriptorSetLayout::from_raw(raw), None)
            }
            ObjectKind::Sampler => d.destroy_sampler(vk::Sampler::from_raw(raw), None),
            ObjectKind::ShaderModule => d.destroy_shader_module(vk::ShaderModule::from_raw(raw), None),
            ObjectKind::PipelineCache => {
                d.destroy_pipeline_cache(vk::PipelineCache::from_raw(raw), None)
            }
            // Frees the pool's command buffers.
            ObjectKind::CommandPool => d.destroy_command_pool(vk::CommandPool::from_raw(raw), None),
            ObjectKind::Fence => d.destroy_fence(vk::Fence::from_raw(raw), None),
            ObjectKind::Semaphore => d.destroy_semaphore(vk::Semaphore::from_raw(raw), None),
            ObjectKind::SwapchainKhr => {
                if let Some(loader) = &state.swapchain {
                    loader.destroy_swapchain(vk::SwapchainKHR::from_raw(raw), None)
                }
            }
            ObjectKind::Image => d.destroy_image(vk::Image::from_raw(raw), None),
            ObjectKind::Buffer => d.destroy_buffer(vk::Buffer::from_raw(raw), None),
            ObjectKind::DeviceMemory => d.free_memory(vk::DeviceMemory::from_raw(raw), None),
            other => debug!(kind = ?other, "not a destroyable device child"),
        }
    }
}

fn swapchain_loader(state: &DeviceState) -> VkResult<&khr::swapchain::Device> {
    state
        .swapchain
        .as_ref()
        .ok_or(vk::Result::ERROR_EXTENSION_NOT_PRESENT)
}

/// Keep the requested names the replay side supports.
fn supported_names(requested: Vec<String>, available: &HashSet<String>, what: &str) -> Vec<CString> {
    requested
        .into_iter()
        .filter(|name| {
            let keep = available.contains(name);
            if !keep {
                warn!(name = %name, "{what} unsupported on replay host, dropping");
            }
            keep
        })
        .filter_map(|name| CString::new(name).ok())
        .collect()
}

const FEATURE_COUNT: usize = std::mem::size_of::<vk::PhysicalDeviceFeatures>() / 4;

fn feature_bits(features: &vk::PhysicalDeviceFeatures) -> &[vk::Bool32] {
    // SAFETY: VkPhysicalDeviceFeatures is a plain array of VkBool32.
    unsafe {
        std::slice::from_raw_parts(
            features as *const vk::PhysicalDeviceFeatures as *const vk::Bool32,
            FEATURE_COUNT,
        )
    }
}

/// Features set in the captured `VkPhysicalDeviceFeatures` that `replay` lacks.
fn missing_features(trace: &[u8], replay: &vk::PhysicalDeviceFeatures) -> usize {
    let had: Vec<vk::Bool32> = bytemuck::pod_collect_to_vec(trace);
    had.iter()
        .zip(feature_bits(replay))
        .filter(|&(&t, &r)| t != vk::FALSE && r == vk::FALSE)
        .count()
}

/// Intersect the trace's enabled features with what the replay GPU supports.
fn filter_features(requested: &[u8], supported: &vk::PhysicalDeviceFeatures) -> vk::PhysicalDeviceFeatures {
    let wanted: Vec<vk::Bool32> = bytemuck::pod_collect_to_vec(requested);
    let mut out = vk::PhysicalDeviceFeatures::default();
    let have = feature_bits(supported);
    // SAFETY: as in `feature_bits`.
    let dst = unsafe {
        std::slice::from_raw_parts_mut(&mut out as *mut vk::PhysicalDeviceFeatures as *mut vk::Bool32, FEATURE_COUNT)
    };
    let mut dropped = 0;
    for (i, (&want, slot)) in wanted.iter().zip(dst.iter_mut()).enumerate() {
        if want != vk::FALSE && have[i] == vk::FALSE {
            dropped += 1;
        }
        *slot = want & have[i];
    }
    if dropped > 0 {
        warn!(dropped, "device features unsupported on replay GPU, disabling");
    }
    out
}

fn viewports(bytes: &[u8]) -> Vec<vk::Viewport> {
    bytemuck::pod_collect_to_vec::<u8, f32>(bytes)
        .chunks_exact(6)
        .map(|v| vk::Viewport {
            x: v[0],
            y: v[1],
            width: v[2],
            height: v[3],
            min_depth: v[4],
            max_depth: v[5],
        })
        .collect()
}

fn rects(records: Vec<Fields<'_>>) -> Vec<vk::Rect2D> {
    records
        .iter()
        .map(|r| vk::Rect2D {
            offset: vk::Offset2D {
                x: int(r, "x"),
                y: int(r, "y"),
            },
            extent: vk::Extent2D {
                width: r.value_u32("width"),
                height: r.value_u32("height"),
            },
        })
        .collect()
}

fn handle<T: Handle>(f: &Fields<'_>, name: &str) -> T {
    T::from_raw(f.value(name))
}

fn handles<T: Handle>(f: &Fields<'_>, name: &str) -> Vec<T> {
    f.values(name).into_iter().map(T::from_raw).collect()
}

/// Enum values and signed scalars are stored sign-extended.
fn int(f: &Fields<'_>, name: &str) -> i32 {
    f.value(name) as i32
}

/// Floats are stored as their IEEE-754 bits.
fn float(f: &Fields<'_>, name: &str) -> f32 {
    f32::from_bits(f.value_u32(name))
}

fn flag(f: &Fields<'_>, name: &str) -> bool {
    f.value(name) != 0
}

fn done(result: VkResult<()>) -> VkResult<Invocation> {
    result.map(|()| Invocation::ok())
}

fn result_of(result: VkResult<()>) -> vk::Result {
    match result {
        Ok(()) => vk::Result::SUCCESS,
        Err(e) => e,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_filter_drops_unsupported() {
        let supported = vk::PhysicalDeviceFeatures {
            robust_buffer_access: vk::TRUE,
            geometry_shader: vk::FALSE,
            ..Default::default()
        };
        let requested = vk::PhysicalDeviceFeatures {
            robust_buffer_access: vk::TRUE,
            geometry_shader: vk::TRUE,
            ..Default::default()
        };
        let bytes = unsafe {
            std::slice::from_raw_parts(
                &requested as *const vk::PhysicalDeviceFeatures as *const u8,
                std::mem::size_of::<vk::PhysicalDeviceFeatures>(),
            )
        };
        let out = filter_features(bytes, &supported);
        assert_eq!(out.robust_buffer_access, vk::TRUE);
        assert_eq!(out.geometry_shader, vk::FALSE);
    }

    #[test]
    fn test_missing_features_counted() {
        let replay = vk::PhysicalDeviceFeatures {
            sampler_anisotropy: vk::TRUE,
            ..Default::default()
        };
        let trace = vk::PhysicalDeviceFeatures {
            sampler_anisotropy: vk::TRUE,
            geometry_shader: vk::TRUE,
            tessellation_shader: vk::TRUE,
            ..Default::default()
        };
        let bytes: Vec<u8> = feature_bits(&trace).iter().flat_map(|b| b.to_ne_bytes()).collect();
        assert_eq!(missing_features(&bytes, &replay), 2);
        assert_eq!(missing_features(&[], &replay), 0);
    }

    #[test]
    fn test_unsupported_names_dropped() {
        let available: HashSet<String> = ["VK_KHR_swapchain".to_string()].into();
        let kept = supported_names(
            vec!["VK_KHR_swapchain".into(), "VK_NV_made_up".into()],
            &available,
            "device extension",
        );
        assert_eq!(kept, vec![CString::new("VK_KHR_swapchain").unwrap()]);
    }

    #[test]
    fn test_viewports_from_float_bytes() {
        let floats = [0.0f32, 0.0, 640.0, 480.0, 0.0, 1.0];
        let bytes: Vec<u8> = floats.iter().flat_map(|f| f.to_ne_bytes()).collect();
        let vps = viewports(&bytes);
        assert_eq!(vps.len(), 1);
        assert_eq!(vps[0].width, 640.0);
        assert_eq!(vps[0].max_depth, 1.0);
    }
}
