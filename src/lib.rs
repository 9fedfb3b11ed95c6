// Frame pacing for a Vulkan presentation loop
//
// Swapchain lifecycle, per-frame synchronization and the acquire/submit/
// present cycle, with the window and the command content plugged in
// through traits.

pub mod backend;
pub mod config;
pub mod error;
pub mod hot_reload;
pub mod orchestrator;

/// Default number of frames the CPU may record ahead of the GPU
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

pub use error::{FrameError, FrameResult};
pub use orchestrator::{FrameOrchestrator, FrameReport, FrameSettings, FrameState, FrameStats};
