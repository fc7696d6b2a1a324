use serde::{Deserialize, Serialize};

/// The null handle. A legitimately absent optional handle is recorded as this value.
pub const NULL_HANDLE: u64 = 0;

/// Object categories. Each category has its own handle namespace, so a buffer
/// handle and an image handle with the same numeric value never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectKind {
    Instance,
    PhysicalDevice,
    Device,
    Queue,
    Semaphore,
    CommandBuffer,
    Fence,
    DeviceMemory,
    Buffer,
    Image,
    BufferView,
    ImageView,
    ShaderModule,
    PipelineCache,
    PipelineLayout,
    RenderPass,
    Pipeline,
    DescriptorSetLayout,
    Sampler,
    DescriptorPool,
    DescriptorSet,
    Framebuffer,
    CommandPool,
    SurfaceKhr,
    SwapchainKhr,
}

impl ObjectKind {
    pub const COUNT: usize = 25;

    pub const ALL: [ObjectKind; Self::COUNT] = [
        ObjectKind::Instance,
        ObjectKind::PhysicalDevice,
        ObjectKind::Device,
        ObjectKind::Queue,
        ObjectKind::Semaphore,
        ObjectKind::CommandBuffer,
        ObjectKind::Fence,
        ObjectKind::DeviceMemory,
        ObjectKind::Buffer,
        ObjectKind::Image,
        ObjectKind::BufferView,
        ObjectKind::ImageView,
        ObjectKind::ShaderModule,
        ObjectKind::PipelineCache,
        ObjectKind::PipelineLayout,
        ObjectKind::RenderPass,
        ObjectKind::Pipeline,
        ObjectKind::DescriptorSetLayout,
        ObjectKind::Sampler,
        ObjectKind::DescriptorPool,
        ObjectKind::DescriptorSet,
        ObjectKind::Framebuffer,
        ObjectKind::CommandPool,
        ObjectKind::SurfaceKhr,
        ObjectKind::SwapchainKhr,
    ];

    /// Dense index, usable for per-category tables.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Whether handles of this kind are dispatchable (pointer-sized) in Vulkan.
    pub fn is_dispatchable(self) -> bool {
        matches!(
            self,
            ObjectKind::Instance
                | ObjectKind::PhysicalDevice
                | ObjectKind::Device
                | ObjectKind::Queue
                | ObjectKind::CommandBuffer
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_is_dense() {
        for (i, kind) in ObjectKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
    }
}
