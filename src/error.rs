// Frame loop errors
//
// Out-of-date and suboptimal results never show up here: the orchestrator
// absorbs them by rebuilding the swapchain. Everything in this enum ends
// the frame it happened in.

use ash::vk;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameError {
    /// Surface capability query failed or the surface went away
    #[error("Surface lost: {0}")]
    SurfaceLost(vk::Result),

    /// No acceptable surface format / present mode pair
    #[error("Unsupported surface: {0}")]
    UnsupportedSurface(String),

    #[error("Queue submission failed: {0}")]
    Submission(vk::Result),

    #[error("Presentation failed: {0}")]
    Present(vk::Result),

    #[error("Swapchain image acquisition failed: {0}")]
    Acquire(vk::Result),

    /// A GPU wait exceeded its deadline; treated like a lost device
    #[error("Timed out after {timeout:?} waiting for {what}")]
    Timeout { what: &'static str, timeout: Duration },

    #[error("Device lost")]
    DeviceLost,

    #[error("Command recording failed for image {image_index}: {reason}")]
    Recording { image_index: u32, reason: String },

    /// Programmer error: the call sequence broke a lifecycle rule
    #[error("Precondition violated: {0}")]
    PreconditionViolation(&'static str),

    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),
}

impl FrameError {
    /// Classify the result of a blocking GPU wait.
    pub(crate) fn from_wait(result: vk::Result, what: &'static str, timeout: Duration) -> Self {
        match result {
            vk::Result::TIMEOUT | vk::Result::NOT_READY => Self::Timeout { what, timeout },
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            other => Self::Vulkan(other),
        }
    }
}

pub type FrameResult<T> = std::result::Result<T, FrameError>;
