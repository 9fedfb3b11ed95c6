// Device & queue context
//
// Everything the frame loop needs from the GPU, expressed as one trait so the
// swapchain manager, synchronizer and orchestrator can run against either the
// real Vulkan device or a test double. Handles are plain `ash::vk` handles.

use ash::prelude::VkResult;
use ash::vk;
use std::time::Duration;

/// Queue families used by the swapchain images
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }
}

/// Snapshot of what the surface currently supports
#[derive(Debug, Clone, Default)]
pub struct SurfaceProperties {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// Fully resolved swapchain parameters
#[derive(Debug, Clone)]
pub struct SwapchainDesc {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub min_image_count: u32,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    /// Empty means exclusive sharing
    pub concurrent_families: Vec<u32>,
}

/// One graphics-queue submission of a pre-recorded command buffer
#[derive(Debug, Clone, Copy)]
pub struct Submission {
    pub command_buffer: vk::CommandBuffer,
    pub wait_semaphore: vk::Semaphore,
    pub wait_stage: vk::PipelineStageFlags,
    pub signal_semaphore: vk::Semaphore,
    pub fence: vk::Fence,
}

pub trait DeviceContext {
    fn queue_families(&self) -> QueueFamilies;

    // Synchronization objects
    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn create_semaphore(&self) -> VkResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    /// Returns `Err(TIMEOUT)` when the deadline passes
    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration) -> VkResult<()>;
    fn fence_signaled(&self, fence: vk::Fence) -> VkResult<bool>;
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;
    fn wait_idle(&self) -> VkResult<()>;

    // Queues
    fn submit(&self, submission: &Submission) -> VkResult<()>;
    /// `Ok(true)` means suboptimal
    fn present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> VkResult<bool>;

    // Swapchain
    fn surface_properties(&self) -> VkResult<SurfaceProperties>;
    fn create_swapchain(&self, desc: &SwapchainDesc) -> VkResult<vk::SwapchainKHR>;
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    /// `Ok((index, suboptimal))`, `Err(ERROR_OUT_OF_DATE_KHR)` when stale
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
        timeout: Duration,
    ) -> VkResult<(u32, bool)>;
    fn create_image_view(&self, image: vk::Image, format: vk::Format) -> VkResult<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);

    // Render targets
    fn create_render_pass(&self, format: vk::Format) -> VkResult<vk::RenderPass>;
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);
    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        view: vk::ImageView,
        extent: vk::Extent2D,
    ) -> VkResult<vk::Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);
    fn allocate_command_buffers(&self, count: u32) -> VkResult<Vec<vk::CommandBuffer>>;
    fn free_command_buffers(&self, buffers: &[vk::CommandBuffer]);
    /// Start recording; the buffer is resubmitted every time its image comes up
    fn begin_command_buffer(&self, buffer: vk::CommandBuffer) -> VkResult<()>;
    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> VkResult<()>;
}

/// Vulkan timeouts are nanoseconds in a u64; saturate instead of wrapping.
pub fn timeout_nanos(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)
}
