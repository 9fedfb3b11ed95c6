// Presentable surface provider
//
// The window side of the contract: the frame loop only needs the current
// drawable size, a resize notification it can consume, and a way to idle
// while the window is minimized.

use ash::vk;

pub trait SurfaceProvider {
    /// Current drawable size in pixels; zero in either dimension while minimized
    fn drawable_size(&self) -> vk::Extent2D;

    /// Returns the pending resize notification and clears it
    fn take_resize_request(&mut self) -> bool;

    /// Block briefly for window-system activity; called in a loop while the
    /// drawable size is zero
    fn wait_events(&mut self);
}

pub fn is_zero_sized(extent: vk::Extent2D) -> bool {
    extent.width == 0 || extent.height == 0
}
