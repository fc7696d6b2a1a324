//! Entry-point table.
//!
//! Every replayable call has an id (the packet id on disk), a name, and a
//! field list. The field list is the call's remap descriptor: it says which
//! parameters are handles of which category, which are indices that need
//! translating to the replay device, and which hold nested structs. The body
//! layout of a packet is derived from it (see [`crate::body`]).

use serde::{Deserialize, Serialize};

use crate::handle::ObjectKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Plain scalar, copied through unchanged.
    Value,
    /// Array of plain scalars.
    Values,
    /// Opaque byte blob (strings, SPIR-V, raw structs, written memory).
    Bytes,
    /// Input handle; must remap unless null.
    Handle(ObjectKind),
    Handles(ObjectKind),
    /// Handle produced by the call; committed to the identity map on success.
    Create(ObjectKind),
    CreateMany(ObjectKind),
    /// Input handle released by the call; removed from the identity map afterwards.
    Destroy(ObjectKind),
    DestroyMany(ObjectKind),
    /// Queue-family index in the trace device's index space.
    QueueFamily,
    QueueFamilies,
    /// Memory-type index in the trace device's index space.
    MemoryType,
    /// Array of nested structs, each laid out with the given fields.
    Records(&'static [Field]),
}

impl FieldKind {
    /// Size of one array element, or `None` for single-slot scalars.
    pub fn element_size(&self) -> Option<usize> {
        match self {
            FieldKind::Value
            | FieldKind::Handle(_)
            | FieldKind::Create(_)
            | FieldKind::Destroy(_)
            | FieldKind::QueueFamily
            | FieldKind::MemoryType => None,
            FieldKind::Values
            | FieldKind::Handles(_)
            | FieldKind::CreateMany(_)
            | FieldKind::DestroyMany(_)
            | FieldKind::QueueFamilies => Some(8),
            FieldKind::Bytes => Some(1),
            FieldKind::Records(fields) => Some(fields.len() * crate::body::SLOT_SIZE),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub kind: FieldKind,
}

const fn value(name: &'static str) -> Field {
    Field { name, kind: FieldKind::Value }
}
const fn values(name: &'static str) -> Field {
    Field { name, kind: FieldKind::Values }
}
const fn bytes(name: &'static str) -> Field {
    Field { name, kind: FieldKind::Bytes }
}
const fn handle(name: &'static str, kind: ObjectKind) -> Field {
    Field { name, kind: FieldKind::Handle(kind) }
}
const fn handles(name: &'static str, kind: ObjectKind) -> Field {
    Field { name, kind: FieldKind::Handles(kind) }
}
const fn create(name: &'static str, kind: ObjectKind) -> Field {
    Field { name, kind: FieldKind::Create(kind) }
}
const fn create_many(name: &'static str, kind: ObjectKind) -> Field {
    Field { name, kind: FieldKind::CreateMany(kind) }
}
const fn destroy(name: &'static str, kind: ObjectKind) -> Field {
    Field { name, kind: FieldKind::Destroy(kind) }
}
const fn destroy_many(name: &'static str, kind: ObjectKind) -> Field {
    Field { name, kind: FieldKind::DestroyMany(kind) }
}
const fn queue_family(name: &'static str) -> Field {
    Field { name, kind: FieldKind::QueueFamily }
}
const fn queue_families(name: &'static str) -> Field {
    Field { name, kind: FieldKind::QueueFamilies }
}
const fn memory_type(name: &'static str) -> Field {
    Field { name, kind: FieldKind::MemoryType }
}
const fn records(name: &'static str, fields: &'static [Field]) -> Field {
    Field { name, kind: FieldKind::Records(fields) }
}

use ObjectKind::*;

// ── Nested struct layouts ───────────────────────────────────

pub const QUEUE_FAMILY_PROPERTIES: &[Field] = &[
    value("queue_flags"),
    value("queue_count"),
    value("timestamp_valid_bits"),
];

pub const MEMORY_TYPE: &[Field] = &[value("property_flags"), value("heap_index")];

pub const MEMORY_HEAP: &[Field] = &[value("size"), value("flags")];

pub const DEVICE_QUEUE_CREATE_INFO: &[Field] = &[
    value("flags"),
    queue_family("queue_family_index"),
    bytes("queue_priorities"),
];

pub const SUBMIT_INFO: &[Field] = &[
    handles("wait_semaphores", Semaphore),
    values("wait_dst_stage_masks"),
    handles("command_buffers", CommandBuffer),
    handles("signal_semaphores", Semaphore),
];

pub const SPARSE_MEMORY_BIND: &[Field] = &[
    value("resource_offset"),
    value("size"),
    handle("memory", DeviceMemory),
    value("memory_offset"),
    value("flags"),
];

pub const SPARSE_BUFFER_BIND: &[Field] = &[
    handle("buffer", Buffer),
    records("binds", SPARSE_MEMORY_BIND),
];

pub const SPARSE_IMAGE_OPAQUE_BIND: &[Field] = &[
    handle("image", Image),
    records("binds", SPARSE_MEMORY_BIND),
];

pub const BIND_SPARSE_INFO: &[Field] = &[
    handles("wait_semaphores", Semaphore),
    records("buffer_binds", SPARSE_BUFFER_BIND),
    records("image_opaque_binds", SPARSE_IMAGE_OPAQUE_BIND),
    handles("signal_semaphores", Semaphore),
];

pub const MAPPED_MEMORY_RANGE: &[Field] = &[
    handle("memory", DeviceMemory),
    value("offset"),
    value("size"),
    bytes("data"),
];

pub const DESCRIPTOR_SET_LAYOUT_BINDING: &[Field] = &[
    value("binding"),
    value("descriptor_type"),
    value("descriptor_count"),
    value("stage_flags"),
    handles("immutable_samplers", Sampler),
];

pub const PUSH_CONSTANT_RANGE: &[Field] = &[value("stage_flags"), value("offset"), value("size")];

pub const DESCRIPTOR_POOL_SIZE: &[Field] = &[value("descriptor_type"), value("descriptor_count")];

pub const DESCRIPTOR_IMAGE_INFO: &[Field] = &[
    handle("sampler", Sampler),
    handle("image_view", ImageView),
    value("image_layout"),
];

pub const DESCRIPTOR_BUFFER_INFO: &[Field] = &[
    handle("buffer", Buffer),
    value("offset"),
    value("range"),
];

pub const WRITE_DESCRIPTOR_SET: &[Field] = &[
    handle("dst_set", DescriptorSet),
    value("dst_binding"),
    value("dst_array_element"),
    value("descriptor_type"),
    records("image_infos", DESCRIPTOR_IMAGE_INFO),
    records("buffer_infos", DESCRIPTOR_BUFFER_INFO),
    handles("texel_buffer_views", BufferView),
];

pub const COPY_DESCRIPTOR_SET: &[Field] = &[
    handle("src_set", DescriptorSet),
    value("src_binding"),
    value("src_array_element"),
    handle("dst_set", DescriptorSet),
    value("dst_binding"),
    value("dst_array_element"),
    value("descriptor_count"),
];

pub const COMPUTE_PIPELINE_CREATE_INFO: &[Field] = &[
    value("flags"),
    value("stage"),
    handle("module", ShaderModule),
    bytes("entry_point"),
    handle("layout", PipelineLayout),
];

pub const PIPELINE_SHADER_STAGE: &[Field] = &[
    value("stage"),
    handle("module", ShaderModule),
    bytes("entry_point"),
];

pub const VERTEX_BINDING: &[Field] = &[value("binding"), value("stride"), value("input_rate")];

pub const VERTEX_ATTRIBUTE: &[Field] = &[
    value("location"),
    value("binding"),
    value("format"),
    value("offset"),
];

pub const RECT_2D: &[Field] = &[value("x"), value("y"), value("width"), value("height")];

pub const COLOR_BLEND_ATTACHMENT: &[Field] = &[
    value("blend_enable"),
    value("src_color_factor"),
    value("dst_color_factor"),
    value("color_op"),
    value("src_alpha_factor"),
    value("dst_alpha_factor"),
    value("alpha_op"),
    value("color_write_mask"),
];

pub const GRAPHICS_PIPELINE_CREATE_INFO: &[Field] = &[
    value("flags"),
    records("stages", PIPELINE_SHADER_STAGE),
    records("vertex_bindings", VERTEX_BINDING),
    records("vertex_attributes", VERTEX_ATTRIBUTE),
    value("topology"),
    value("primitive_restart"),
    bytes("viewports"),
    records("scissors", RECT_2D),
    value("polygon_mode"),
    value("cull_mode"),
    value("front_face"),
    value("line_width"),
    value("rasterization_samples"),
    value("depth_test_enable"),
    value("depth_write_enable"),
    value("depth_compare_op"),
    records("blend_attachments", COLOR_BLEND_ATTACHMENT),
    values("dynamic_states"),
    handle("layout", PipelineLayout),
    handle("render_pass", RenderPass),
    value("subpass"),
];

pub const ATTACHMENT_DESCRIPTION: &[Field] = &[
    value("flags"),
    value("format"),
    value("samples"),
    value("load_op"),
    value("store_op"),
    value("stencil_load_op"),
    value("stencil_store_op"),
    value("initial_layout"),
    value("final_layout"),
];

pub const ATTACHMENT_REFERENCE: &[Field] = &[value("attachment"), value("layout")];

pub const SUBPASS_DESCRIPTION: &[Field] = &[
    value("pipeline_bind_point"),
    records("input_attachments", ATTACHMENT_REFERENCE),
    records("color_attachments", ATTACHMENT_REFERENCE),
    records("depth_stencil_attachment", ATTACHMENT_REFERENCE),
];

pub const SUBPASS_DEPENDENCY: &[Field] = &[
    value("src_subpass"),
    value("dst_subpass"),
    value("src_stage_mask"),
    value("dst_stage_mask"),
    value("src_access_mask"),
    value("dst_access_mask"),
    value("dependency_flags"),
];

pub const BUFFER_COPY: &[Field] = &[value("src_offset"), value("dst_offset"), value("size")];

pub const BUFFER_IMAGE_COPY: &[Field] = &[
    value("buffer_offset"),
    value("buffer_row_length"),
    value("buffer_image_height"),
    value("aspect_mask"),
    value("mip_level"),
    value("base_array_layer"),
    value("layer_count"),
    value("offset_x"),
    value("offset_y"),
    value("offset_z"),
    value("width"),
    value("height"),
    value("depth"),
];

pub const MEMORY_BARRIER: &[Field] = &[value("src_access_mask"), value("dst_access_mask")];

pub const BUFFER_MEMORY_BARRIER: &[Field] = &[
    value("src_access_mask"),
    value("dst_access_mask"),
    queue_family("src_queue_family_index"),
    queue_family("dst_queue_family_index"),
    handle("buffer", Buffer),
    value("offset"),
    value("size"),
];

pub const IMAGE_MEMORY_BARRIER: &[Field] = &[
    value("src_access_mask"),
    value("dst_access_mask"),
    value("old_layout"),
    value("new_layout"),
    queue_family("src_queue_family_index"),
    queue_family("dst_queue_family_index"),
    handle("image", Image),
    value("aspect_mask"),
    value("base_mip_level"),
    value("level_count"),
    value("base_array_layer"),
    value("layer_count"),
];

// ── Entry points ────────────────────────────────────────────

macro_rules! entry_points {
    ($($variant:ident = $id:literal => $name:literal,)*) => {
        /// A replayable API call. The discriminant is the packet id on disk.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[repr(u16)]
        pub enum EntryPoint {
            $($variant = $id,)*
        }

        impl EntryPoint {
            pub const ALL: &'static [EntryPoint] = &[$(EntryPoint::$variant,)*];

            pub fn from_id(id: u16) -> Option<Self> {
                match id {
                    $($id => Some(EntryPoint::$variant),)*
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(EntryPoint::$variant => $name,)*
                }
            }
        }
    };
}

entry_points! {
    CreateInstance = 1 => "vkCreateInstance",
    DestroyInstance = 2 => "vkDestroyInstance",
    EnumeratePhysicalDevices = 3 => "vkEnumeratePhysicalDevices",
    GetPhysicalDeviceProperties = 4 => "vkGetPhysicalDeviceProperties",
    GetPhysicalDeviceFeatures = 5 => "vkGetPhysicalDeviceFeatures",
    GetPhysicalDeviceQueueFamilyProperties = 6 => "vkGetPhysicalDeviceQueueFamilyProperties",
    GetPhysicalDeviceMemoryProperties = 7 => "vkGetPhysicalDeviceMemoryProperties",
    CreateDevice = 8 => "vkCreateDevice",
    DestroyDevice = 9 => "vkDestroyDevice",
    DeviceWaitIdle = 10 => "vkDeviceWaitIdle",
    GetDeviceQueue = 11 => "vkGetDeviceQueue",
    QueueSubmit = 12 => "vkQueueSubmit",
    QueueWaitIdle = 13 => "vkQueueWaitIdle",
    QueueBindSparse = 14 => "vkQueueBindSparse",

    AllocateMemory = 20 => "vkAllocateMemory",
    FreeMemory = 21 => "vkFreeMemory",
    MapMemory = 22 => "vkMapMemory",
    UnmapMemory = 23 => "vkUnmapMemory",
    FlushMappedMemoryRanges = 24 => "vkFlushMappedMemoryRanges",
    InvalidateMappedMemoryRanges = 25 => "vkInvalidateMappedMemoryRanges",
    BindBufferMemory = 26 => "vkBindBufferMemory",
    BindImageMemory = 27 => "vkBindImageMemory",
    GetBufferMemoryRequirements = 28 => "vkGetBufferMemoryRequirements",
    GetImageMemoryRequirements = 29 => "vkGetImageMemoryRequirements",

    CreateBuffer = 40 => "vkCreateBuffer",
    DestroyBuffer = 41 => "vkDestroyBuffer",
    CreateBufferView = 42 => "vkCreateBufferView",
    DestroyBufferView = 43 => "vkDestroyBufferView",
    CreateImage = 44 => "vkCreateImage",
    DestroyImage = 45 => "vkDestroyImage",
    CreateImageView = 46 => "vkCreateImageView",
    DestroyImageView = 47 => "vkDestroyImageView",
    CreateSampler = 48 => "vkCreateSampler",
    DestroySampler = 49 => "vkDestroySampler",

    CreateShaderModule = 60 => "vkCreateShaderModule",
    DestroyShaderModule = 61 => "vkDestroyShaderModule",
    CreatePipelineCache = 62 => "vkCreatePipelineCache",
    DestroyPipelineCache = 63 => "vkDestroyPipelineCache",
    CreateDescriptorSetLayout = 64 => "vkCreateDescriptorSetLayout",
    DestroyDescriptorSetLayout = 65 => "vkDestroyDescriptorSetLayout",
    CreatePipelineLayout = 66 => "vkCreatePipelineLayout",
    DestroyPipelineLayout = 67 => "vkDestroyPipelineLayout",
    CreateDescriptorPool = 68 => "vkCreateDescriptorPool",
    DestroyDescriptorPool = 69 => "vkDestroyDescriptorPool",
    ResetDescriptorPool = 70 => "vkResetDescriptorPool",
    AllocateDescriptorSets = 71 => "vkAllocateDescriptorSets",
    FreeDescriptorSets = 72 => "vkFreeDescriptorSets",
    UpdateDescriptorSets = 73 => "vkUpdateDescriptorSets",
    CreateComputePipelines = 74 => "vkCreateComputePipelines",
    CreateGraphicsPipelines = 75 => "vkCreateGraphicsPipelines",
    DestroyPipeline = 76 => "vkDestroyPipeline",
    CreateRenderPass = 77 => "vkCreateRenderPass",
    DestroyRenderPass = 78 => "vkDestroyRenderPass",
    CreateFramebuffer = 79 => "vkCreateFramebuffer",
    DestroyFramebuffer = 80 => "vkDestroyFramebuffer",

    CreateCommandPool = 90 => "vkCreateCommandPool",
    DestroyCommandPool = 91 => "vkDestroyCommandPool",
    ResetCommandPool = 92 => "vkResetCommandPool",
    AllocateCommandBuffers = 93 => "vkAllocateCommandBuffers",
    FreeCommandBuffers = 94 => "vkFreeCommandBuffers",
    BeginCommandBuffer = 95 => "vkBeginCommandBuffer",
    EndCommandBuffer = 96 => "vkEndCommandBuffer",
    ResetCommandBuffer = 97 => "vkResetCommandBuffer",

    CmdBindPipeline = 110 => "vkCmdBindPipeline",
    CmdBindDescriptorSets = 111 => "vkCmdBindDescriptorSets",
    CmdBindVertexBuffers = 112 => "vkCmdBindVertexBuffers",
    CmdBindIndexBuffer = 113 => "vkCmdBindIndexBuffer",
    CmdSetViewport = 114 => "vkCmdSetViewport",
    CmdSetScissor = 115 => "vkCmdSetScissor",
    CmdPushConstants = 116 => "vkCmdPushConstants",
    CmdDraw = 117 => "vkCmdDraw",
    CmdDrawIndexed = 118 => "vkCmdDrawIndexed",
    CmdDispatch = 119 => "vkCmdDispatch",
    CmdCopyBuffer = 120 => "vkCmdCopyBuffer",
    CmdCopyBufferToImage = 121 => "vkCmdCopyBufferToImage",
    CmdCopyImageToBuffer = 122 => "vkCmdCopyImageToBuffer",
    CmdPipelineBarrier = 123 => "vkCmdPipelineBarrier",
    CmdBeginRenderPass = 124 => "vkCmdBeginRenderPass",
    CmdEndRenderPass = 125 => "vkCmdEndRenderPass",

    CreateFence = 140 => "vkCreateFence",
    DestroyFence = 141 => "vkDestroyFence",
    ResetFences = 142 => "vkResetFences",
    WaitForFences = 143 => "vkWaitForFences",
    GetFenceStatus = 144 => "vkGetFenceStatus",
    CreateSemaphore = 145 => "vkCreateSemaphore",
    DestroySemaphore = 146 => "vkDestroySemaphore",

    CreateSurfaceKhr = 160 => "vkCreateSurfaceKHR",
    DestroySurfaceKhr = 161 => "vkDestroySurfaceKHR",
    GetPhysicalDeviceSurfaceSupportKhr = 162 => "vkGetPhysicalDeviceSurfaceSupportKHR",
    CreateSwapchainKhr = 163 => "vkCreateSwapchainKHR",
    DestroySwapchainKhr = 164 => "vkDestroySwapchainKHR",
    GetSwapchainImagesKhr = 165 => "vkGetSwapchainImagesKHR",
    AcquireNextImageKhr = 166 => "vkAcquireNextImageKHR",
    QueuePresentKhr = 167 => "vkQueuePresentKHR",
}

impl EntryPoint {
    pub fn id(self) -> u16 {
        self as u16
    }

    /// Calls whose failure means replay cannot meaningfully begin.
    pub fn is_mandatory(self) -> bool {
        matches!(
            self,
            EntryPoint::CreateInstance | EntryPoint::CreateDevice | EntryPoint::CreateSurfaceKhr
        )
    }

    /// Presentation calls advance the frame counter.
    pub fn is_present(self) -> bool {
        self == EntryPoint::QueuePresentKhr
    }

    /// Remap descriptor: the call's parameters in body order.
    pub fn fields(self) -> &'static [Field] {
        use EntryPoint as E;
        match self {
            E::CreateInstance => const { &[
                bytes("app_name"),
                value("app_version"),
                bytes("engine_name"),
                value("engine_version"),
                value("api_version"),
                bytes("enabled_layers"),
                bytes("enabled_extensions"),
                create("instance", Instance),
            ] },
            E::DestroyInstance => const { &[destroy("instance", Instance)] },
            E::EnumeratePhysicalDevices => const { &[
                handle("instance", Instance),
                create_many("physical_devices", PhysicalDevice),
            ] },
            E::GetPhysicalDeviceProperties => const { &[
                handle("physical_device", PhysicalDevice),
                value("api_version"),
                value("driver_version"),
                value("vendor_id"),
                value("device_id"),
                value("device_type"),
                bytes("device_name"),
            ] },
            E::GetPhysicalDeviceFeatures => const { &[
                handle("physical_device", PhysicalDevice),
                bytes("features"),
            ] },
            E::GetPhysicalDeviceQueueFamilyProperties => const { &[
                handle("physical_device", PhysicalDevice),
                records("families", QUEUE_FAMILY_PROPERTIES),
            ] },
            E::GetPhysicalDeviceMemoryProperties => const { &[
                handle("physical_device", PhysicalDevice),
                records("memory_types", MEMORY_TYPE),
                records("memory_heaps", MEMORY_HEAP),
            ] },
            E::CreateDevice => const { &[
                handle("physical_device", PhysicalDevice),
                records("queue_create_infos", DEVICE_QUEUE_CREATE_INFO),
                bytes("enabled_extensions"),
                bytes("enabled_features"),
                create("device", Device),
            ] },
            E::DestroyDevice => const { &[destroy("device", Device)] },
            E::DeviceWaitIdle => const { &[handle("device", Device)] },
            E::GetDeviceQueue => const { &[
                handle("device", Device),
                queue_family("queue_family_index"),
                value("queue_index"),
                create("queue", Queue),
            ] },
            E::QueueSubmit => const { &[
                handle("queue", Queue),
                records("submits", SUBMIT_INFO),
                handle("fence", Fence),
            ] },
            E::QueueWaitIdle => const { &[handle("queue", Queue)] },
            E::QueueBindSparse => const { &[
                handle("queue", Queue),
                records("bind_infos", BIND_SPARSE_INFO),
                handle("fence", Fence),
            ] },

            // ── Memory ──────────────────────────────────────
            E::AllocateMemory => const { &[
                handle("device", Device),
                value("allocation_size"),
                memory_type("memory_type_index"),
                create("memory", DeviceMemory),
            ] },
            E::FreeMemory => const { &[handle("device", Device), destroy("memory", DeviceMemory)] },
            E::MapMemory => const { &[
                handle("device", Device),
                handle("memory", DeviceMemory),
                value("offset"),
                value("size"),
                value("flags"),
                value("data_ptr"),
            ] },
            E::UnmapMemory => const { &[
                handle("device", Device),
                handle("memory", DeviceMemory),
                bytes("data"),
            ] },
            E::FlushMappedMemoryRanges | E::InvalidateMappedMemoryRanges => const { &[
                handle("device", Device),
                records("ranges", MAPPED_MEMORY_RANGE),
            ] },
            E::BindBufferMemory => const { &[
                handle("device", Device),
                handle("buffer", Buffer),
                handle("memory", DeviceMemory),
                value("memory_offset"),
            ] },
            E::BindImageMemory => const { &[
                handle("device", Device),
                handle("image", Image),
                handle("memory", DeviceMemory),
                value("memory_offset"),
            ] },
            E::GetBufferMemoryRequirements => const { &[
                handle("device", Device),
                handle("buffer", Buffer),
                value("size"),
                value("alignment"),
                value("memory_type_bits"),
            ] },
            E::GetImageMemoryRequirements => const { &[
                handle("device", Device),
                handle("image", Image),
                value("size"),
                value("alignment"),
                value("memory_type_bits"),
            ] },

            // ── Resources ───────────────────────────────────
            E::CreateBuffer => const { &[
                handle("device", Device),
                value("flags"),
                value("size"),
                value("usage"),
                value("sharing_mode"),
                queue_families("queue_family_indices"),
                create("buffer", Buffer),
            ] },
            E::DestroyBuffer => const { &[handle("device", Device), destroy("buffer", Buffer)] },
            E::CreateBufferView => const { &[
                handle("device", Device),
                handle("buffer", Buffer),
                value("format"),
                value("offset"),
                value("range"),
                create("view", BufferView),
            ] },
            E::DestroyBufferView => const { &[handle("device", Device), destroy("view", BufferView)] },
            E::CreateImage => const { &[
                handle("device", Device),
                value("flags"),
                value("image_type"),
                value("format"),
                value("width"),
                value("height"),
                value("depth"),
                value("mip_levels"),
                value("array_layers"),
                value("samples"),
                value("tiling"),
                value("usage"),
                value("sharing_mode"),
                queue_families("queue_family_indices"),
                value("initial_layout"),
                create("image", Image),
            ] },
            E::DestroyImage => const { &[handle("device", Device), destroy("image", Image)] },
            E::CreateImageView => const { &[
                handle("device", Device),
                handle("image", Image),
                value("view_type"),
                value("format"),
                values("components"),
                value("aspect_mask"),
                value("base_mip_level"),
                value("level_count"),
                value("base_array_layer"),
                value("layer_count"),
                create("view", ImageView),
            ] },
            E::DestroyImageView => const { &[handle("device", Device), destroy("view", ImageView)] },
            E::CreateSampler => const { &[
                handle("device", Device),
                value("mag_filter"),
                value("min_filter"),
                value("mipmap_mode"),
                value("address_mode_u"),
                value("address_mode_v"),
                value("address_mode_w"),
                value("anisotropy_enable"),
                value("max_anisotropy"),
                value("min_lod"),
                value("max_lod"),
                value("border_color"),
                create("sampler", Sampler),
            ] },
            E::DestroySampler => const { &[handle("device", Device), destroy("sampler", Sampler)] },

            // ── Pipelines & descriptors ─────────────────────
            E::CreateShaderModule => const { &[
                handle("device", Device),
                bytes("code"),
                create("module", ShaderModule),
            ] },
            E::DestroyShaderModule => const { &[
                handle("device", Device),
                destroy("module", ShaderModule),
            ] },
            E::CreatePipelineCache => const { &[
                handle("device", Device),
                bytes("initial_data"),
                create("cache", PipelineCache),
            ] },
            E::DestroyPipelineCache => const { &[
                handle("device", Device),
                destroy("cache", PipelineCache),
            ] },
            E::CreateDescriptorSetLayout => const { &[
                handle("device", Device),
                value("flags"),
                records("bindings", DESCRIPTOR_SET_LAYOUT_BINDING),
                create("layout", DescriptorSetLayout),
            ] },
            E::DestroyDescriptorSetLayout => const { &[
                handle("device", Device),
                destroy("layout", DescriptorSetLayout),
            ] },
            E::CreatePipelineLayout => const { &[
                handle("device", Device),
                handles("set_layouts", DescriptorSetLayout),
                records("push_constant_ranges", PUSH_CONSTANT_RANGE),
                create("layout", PipelineLayout),
            ] },
            E::DestroyPipelineLayout => const { &[
                handle("device", Device),
                destroy("layout", PipelineLayout),
            ] },
            E::CreateDescriptorPool => const { &[
                handle("device", Device),
                value("flags"),
                value("max_sets"),
                records("pool_sizes", DESCRIPTOR_POOL_SIZE),
                create("pool", DescriptorPool),
            ] },
            E::DestroyDescriptorPool => const { &[
                handle("device", Device),
                destroy("pool", DescriptorPool),
            ] },
            E::ResetDescriptorPool => const { &[
                handle("device", Device),
                handle("pool", DescriptorPool),
                value("flags"),
            ] },
            E::AllocateDescriptorSets => const { &[
                handle("device", Device),
                handle("descriptor_pool", DescriptorPool),
                handles("set_layouts", DescriptorSetLayout),
                create_many("descriptor_sets", DescriptorSet),
            ] },
            E::FreeDescriptorSets => const { &[
                handle("device", Device),
                handle("descriptor_pool", DescriptorPool),
                destroy_many("descriptor_sets", DescriptorSet),
            ] },
            E::UpdateDescriptorSets => const { &[
                handle("device", Device),
                records("writes", WRITE_DESCRIPTOR_SET),
                records("copies", COPY_DESCRIPTOR_SET),
            ] },
            E::CreateComputePipelines => const { &[
                handle("device", Device),
                handle("pipeline_cache", PipelineCache),
                records("create_infos", COMPUTE_PIPELINE_CREATE_INFO),
                create_many("pipelines", Pipeline),
            ] },
            E::CreateGraphicsPipelines => const { &[
                handle("device", Device),
                handle("pipeline_cache", PipelineCache),
                records("create_infos", GRAPHICS_PIPELINE_CREATE_INFO),
                create_many("pipelines", Pipeline),
            ] },
            E::DestroyPipeline => const { &[handle("device", Device), destroy("pipeline", Pipeline)] },
            E::CreateRenderPass => const { &[
                handle("device", Device),
                records("attachments", ATTACHMENT_DESCRIPTION),
                records("subpasses", SUBPASS_DESCRIPTION),
                records("dependencies", SUBPASS_DEPENDENCY),
                create("render_pass", RenderPass),
            ] },
            E::DestroyRenderPass => const { &[
                handle("device", Device),
                destroy("render_pass", RenderPass),
            ] },
            E::CreateFramebuffer => const { &[
                handle("device", Device),
                handle("render_pass", RenderPass),
                handles("attachments", ImageView),
                value("width"),
                value("height"),
                value("layers"),
                create("framebuffer", Framebuffer),
            ] },
            E::DestroyFramebuffer => const { &[
                handle("device", Device),
                destroy("framebuffer", Framebuffer),
            ] },

            // ── Command pools & buffers ─────────────────────
            E::CreateCommandPool => const { &[
                handle("device", Device),
                value("flags"),
                queue_family("queue_family_index"),
                create("command_pool", CommandPool),
            ] },
            E::DestroyCommandPool => const { &[
                handle("device", Device),
                destroy("command_pool", CommandPool),
            ] },
            E::ResetCommandPool => const { &[
                handle("device", Device),
                handle("command_pool", CommandPool),
                value("flags"),
            ] },
            E::AllocateCommandBuffers => const { &[
                handle("device", Device),
                handle("command_pool", CommandPool),
                value("level"),
                create_many("command_buffers", CommandBuffer),
            ] },
            E::FreeCommandBuffers => const { &[
                handle("device", Device),
                handle("command_pool", CommandPool),
                destroy_many("command_buffers", CommandBuffer),
            ] },
            E::BeginCommandBuffer => const { &[
                handle("command_buffer", CommandBuffer),
                value("flags"),
            ] },
            E::EndCommandBuffer => const { &[handle("command_buffer", CommandBuffer)] },
            E::ResetCommandBuffer => const { &[
                handle("command_buffer", CommandBuffer),
                value("flags"),
            ] },

            // ── Recording ───────────────────────────────────
            E::CmdBindPipeline => const { &[
                handle("command_buffer", CommandBuffer),
                value("pipeline_bind_point"),
                handle("pipeline", Pipeline),
            ] },
            E::CmdBindDescriptorSets => const { &[
                handle("command_buffer", CommandBuffer),
                value("pipeline_bind_point"),
                handle("layout", PipelineLayout),
                value("first_set"),
                handles("descriptor_sets", DescriptorSet),
                values("dynamic_offsets"),
            ] },
            E::CmdBindVertexBuffers => const { &[
                handle("command_buffer", CommandBuffer),
                value("first_binding"),
                handles("buffers", Buffer),
                values("offsets"),
            ] },
            E::CmdBindIndexBuffer => const { &[
                handle("command_buffer", CommandBuffer),
                handle("buffer", Buffer),
                value("offset"),
                value("index_type"),
            ] },
            E::CmdSetViewport => const { &[
                handle("command_buffer", CommandBuffer),
                value("first_viewport"),
                bytes("viewports"),
            ] },
            E::CmdSetScissor => const { &[
                handle("command_buffer", CommandBuffer),
                value("first_scissor"),
                records("scissors", RECT_2D),
            ] },
            E::CmdPushConstants => const { &[
                handle("command_buffer", CommandBuffer),
                handle("layout", PipelineLayout),
                value("stage_flags"),
                value("offset"),
                bytes("data"),
            ] },
            E::CmdDraw => const { &[
                handle("command_buffer", CommandBuffer),
                value("vertex_count"),
                value("instance_count"),
                value("first_vertex"),
                value("first_instance"),
            ] },
            E::CmdDrawIndexed => const { &[
                handle("command_buffer", CommandBuffer),
                value("index_count"),
                value("instance_count"),
                value("first_index"),
                value("vertex_offset"),
                value("first_instance"),
            ] },
            E::CmdDispatch => const { &[
                handle("command_buffer", CommandBuffer),
                value("group_count_x"),
                value("group_count_y"),
                value("group_count_z"),
            ] },
            E::CmdCopyBuffer => const { &[
                handle("command_buffer", CommandBuffer),
                handle("src_buffer", Buffer),
                handle("dst_buffer", Buffer),
                records("regions", BUFFER_COPY),
            ] },
            E::CmdCopyBufferToImage => const { &[
                handle("command_buffer", CommandBuffer),
                handle("src_buffer", Buffer),
                handle("dst_image", Image),
                value("dst_image_layout"),
                records("regions", BUFFER_IMAGE_COPY),
            ] },
            E::CmdCopyImageToBuffer => const { &[
                handle("command_buffer", CommandBuffer),
                handle("src_image", Image),
                value("src_image_layout"),
                handle("dst_buffer", Buffer),
                records("regions", BUFFER_IMAGE_COPY),
            ] },
            E::CmdPipelineBarrier => const { &[
                handle("command_buffer", CommandBuffer),
                value("src_stage_mask"),
                value("dst_stage_mask"),
                value("dependency_flags"),
                records("memory_barriers", MEMORY_BARRIER),
                records("buffer_barriers", BUFFER_MEMORY_BARRIER),
                records("image_barriers", IMAGE_MEMORY_BARRIER),
            ] },
            E::CmdBeginRenderPass => const { &[
                handle("command_buffer", CommandBuffer),
                handle("render_pass", RenderPass),
                handle("framebuffer", Framebuffer),
                value("area_x"),
                value("area_y"),
                value("area_width"),
                value("area_height"),
                bytes("clear_values"),
                value("contents"),
            ] },
            E::CmdEndRenderPass => const { &[handle("command_buffer", CommandBuffer)] },

            // ── Synchronization ─────────────────────────────
            E::CreateFence => const { &[
                handle("device", Device),
                value("flags"),
                create("fence", Fence),
            ] },
            E::DestroyFence => const { &[handle("device", Device), destroy("fence", Fence)] },
            E::ResetFences => const { &[handle("device", Device), handles("fences", Fence)] },
            E::WaitForFences => const { &[
                handle("device", Device),
                handles("fences", Fence),
                value("wait_all"),
                value("timeout"),
            ] },
            E::GetFenceStatus => const { &[handle("device", Device), handle("fence", Fence)] },
            E::CreateSemaphore => const { &[
                handle("device", Device),
                value("flags"),
                create("semaphore", Semaphore),
            ] },
            E::DestroySemaphore => const { &[
                handle("device", Device),
                destroy("semaphore", Semaphore),
            ] },

            // ── Presentation ────────────────────────────────
            E::CreateSurfaceKhr => const { &[
                handle("instance", Instance),
                value("width"),
                value("height"),
                create("surface", SurfaceKhr),
            ] },
            E::DestroySurfaceKhr => const { &[
                handle("instance", Instance),
                destroy("surface", SurfaceKhr),
            ] },
            E::GetPhysicalDeviceSurfaceSupportKhr => const { &[
                handle("physical_device", PhysicalDevice),
                queue_family("queue_family_index"),
                handle("surface", SurfaceKhr),
                value("supported"),
            ] },
            E::CreateSwapchainKhr => const { &[
                handle("device", Device),
                handle("surface", SurfaceKhr),
                value("min_image_count"),
                value("image_format"),
                value("image_color_space"),
                value("width"),
                value("height"),
                value("image_array_layers"),
                value("image_usage"),
                value("image_sharing_mode"),
                queue_families("queue_family_indices"),
                value("pre_transform"),
                value("composite_alpha"),
                value("present_mode"),
                value("clipped"),
                handle("old_swapchain", SwapchainKhr),
                create("swapchain", SwapchainKhr),
            ] },
            E::DestroySwapchainKhr => const { &[
                handle("device", Device),
                destroy("swapchain", SwapchainKhr),
            ] },
            E::GetSwapchainImagesKhr => const { &[
                handle("device", Device),
                handle("swapchain", SwapchainKhr),
                create_many("images", Image),
            ] },
            E::AcquireNextImageKhr => const { &[
                handle("device", Device),
                handle("swapchain", SwapchainKhr),
                value("timeout"),
                handle("semaphore", Semaphore),
                handle("fence", Fence),
                value("image_index"),
            ] },
            E::QueuePresentKhr => const { &[
                handle("queue", Queue),
                handles("wait_semaphores", Semaphore),
                handles("swapchains", SwapchainKhr),
                values("image_indices"),
            ] },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_roundtrip_and_are_unique() {
        let mut seen = HashSet::new();
        for &entry in EntryPoint::ALL {
            assert!(seen.insert(entry.id()), "duplicate id {}", entry.id());
            assert_eq!(EntryPoint::from_id(entry.id()), Some(entry));
        }
        assert_eq!(EntryPoint::from_id(0), None);
    }

    #[test]
    fn test_field_names_unique_per_layout() {
        fn check(fields: &'static [Field], owner: &str) {
            let mut names = HashSet::new();
            for f in fields {
                assert!(names.insert(f.name), "{owner}: duplicate field {}", f.name);
                if let FieldKind::Records(sub) = f.kind {
                    check(sub, f.name);
                }
            }
        }
        for &entry in EntryPoint::ALL {
            check(entry.fields(), entry.name());
        }
    }

    #[test]
    fn test_at_most_one_create_field() {
        for &entry in EntryPoint::ALL {
            let creates = entry
                .fields()
                .iter()
                .filter(|f| matches!(f.kind, FieldKind::Create(_) | FieldKind::CreateMany(_)))
                .count();
            assert!(creates <= 1, "{} has {} create fields", entry.name(), creates);
        }
    }
}
