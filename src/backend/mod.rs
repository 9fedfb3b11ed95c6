// Backend module - Vulkan abstraction layer
//
// The frame loop talks to the GPU through `DeviceContext`; `VulkanDevice`
// is the real implementation, `mock` the test double.

pub mod commands;
pub mod context;
pub mod device;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod targets;
mod vulkan;

#[cfg(test)]
pub mod mock;

pub use commands::{CommandRecorder, FrameTarget};
pub use context::{DeviceContext, QueueFamilies};
pub use device::VulkanDevice;
pub use surface::SurfaceProvider;
pub use swapchain::{ChainGeneration, SwapchainManager, SwapchainPreferences};
pub use sync::FrameSynchronizer;
