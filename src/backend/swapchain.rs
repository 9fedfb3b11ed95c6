// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen.
// A chain is rebuilt as a whole whenever the surface changes; every rebuild
// gets a new generation so stale framebuffers and command buffers can be told
// apart from current ones.

use super::context::{DeviceContext, QueueFamilies, SurfaceProperties, SwapchainDesc};
use super::surface::is_zero_sized;
use crate::error::{FrameError, FrameResult};
use ash::vk;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Version counter distinguishing successive swapchain instances
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChainGeneration(u64);

impl ChainGeneration {
    /// Before the first chain is built
    pub const NONE: Self = Self(0);

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChainGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen#{}", self.0)
    }
}

/// What the swapchain should prefer when the surface offers a choice
#[derive(Debug, Clone)]
pub struct SwapchainPreferences {
    /// Tried in order; FIFO is the fallback when none is available
    pub present_modes: Vec<vk::PresentModeKHR>,
    pub surface_format: vk::SurfaceFormatKHR,
}

impl Default for SwapchainPreferences {
    fn default() -> Self {
        Self {
            present_modes: vec![vk::PresentModeKHR::MAILBOX],
            surface_format: vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainImage {
    pub handle: vk::Image,
    pub view: vk::ImageView,
    pub index: u32,
}

/// Result of asking the chain for the next image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    Optimal(u32),
    /// Usable now, but the chain should be rebuilt after presenting
    Suboptimal(u32),
    /// Chain no longer matches the surface; nothing was acquired
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presented {
    Optimal,
    Suboptimal,
    OutOfDate,
}

/// One live swapchain and its image views.
///
/// Dropping a chain destroys the views and then the swapchain, so the caller
/// must make sure the device no longer uses any of its images.
pub struct Chain<D: DeviceContext> {
    device: Arc<D>,
    handle: vk::SwapchainKHR,
    images: Vec<SwapchainImage>,
    format: vk::Format,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
    generation: ChainGeneration,
}

impl<D: DeviceContext> Chain<D> {
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub fn images(&self) -> &[SwapchainImage] {
        &self.images
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn generation(&self) -> ChainGeneration {
        self.generation
    }
}

impl<D: DeviceContext> Drop for Chain<D> {
    fn drop(&mut self) {
        for image in &self.images {
            self.device.destroy_image_view(image.view);
        }
        self.device.destroy_swapchain(self.handle);
        log::debug!("Destroyed swapchain {} ({} images)", self.generation, self.images.len());
    }
}

pub struct SwapchainManager<D: DeviceContext> {
    device: Arc<D>,
    preferences: SwapchainPreferences,
    chain: Option<Chain<D>>,
    generation: ChainGeneration,
}

impl<D: DeviceContext> SwapchainManager<D> {
    pub fn new(device: Arc<D>, preferences: SwapchainPreferences) -> Self {
        Self {
            device,
            preferences,
            chain: None,
            generation: ChainGeneration::NONE,
        }
    }

    /// Query the surface and resolve the parameters of the next chain.
    ///
    /// The resolved extent can be zero even when `desired_extent` is not;
    /// some platforms report a zero `current_extent` for a minimized window.
    pub fn plan(
        &self,
        desired_extent: vk::Extent2D,
        families: QueueFamilies,
    ) -> FrameResult<SwapchainDesc> {
        let properties = self
            .device
            .surface_properties()
            .map_err(FrameError::SurfaceLost)?;
        resolve_swapchain(&properties, &self.preferences, desired_extent, families)
    }

    /// Build a new chain from a resolved description.
    ///
    /// Only one chain may be live; the previous one must have been torn down.
    pub fn build(&mut self, desc: &SwapchainDesc) -> FrameResult<&Chain<D>> {
        if self.chain.is_some() {
            return Err(FrameError::PreconditionViolation(
                "swapchain build while a chain is still live",
            ));
        }
        if is_zero_sized(desc.extent) {
            return Err(FrameError::PreconditionViolation(
                "swapchain build with a zero extent",
            ));
        }

        log::info!(
            "Creating swapchain: {}x{}, {:?}, {:?}, {} images requested",
            desc.extent.width,
            desc.extent.height,
            desc.surface_format.format,
            desc.present_mode,
            desc.min_image_count
        );

        let handle = self.device.create_swapchain(desc).map_err(|e| match e {
            vk::Result::ERROR_SURFACE_LOST_KHR => FrameError::SurfaceLost(e),
            other => FrameError::Vulkan(other),
        })?;

        let generation = self.generation.next();
        // From here on the chain owns the handle; an early return drops it
        let mut chain = Chain {
            device: self.device.clone(),
            handle,
            images: Vec::new(),
            format: desc.surface_format.format,
            extent: desc.extent,
            present_mode: desc.present_mode,
            generation,
        };

        let images = self.device.swapchain_images(handle)?;
        for (index, image) in images.into_iter().enumerate() {
            let view = self
                .device
                .create_image_view(image, desc.surface_format.format)?;
            chain.images.push(SwapchainImage {
                handle: image,
                view,
                index: index as u32,
            });
        }

        log::info!("Created swapchain {} with {} images", generation, chain.images.len());

        self.generation = generation;
        Ok(self.chain.insert(chain))
    }

    /// Destroy the live chain. Device must be idle with respect to it.
    pub fn teardown(&mut self) -> FrameResult<()> {
        let chain = self.chain.take().ok_or(FrameError::PreconditionViolation(
            "swapchain teardown with no live chain",
        ))?;
        log::info!("Tearing down swapchain {}", chain.generation);
        drop(chain);
        Ok(())
    }

    pub fn is_live(&self) -> bool {
        self.chain.is_some()
    }

    pub fn chain(&self) -> FrameResult<&Chain<D>> {
        self.chain
            .as_ref()
            .ok_or(FrameError::PreconditionViolation("no live swapchain"))
    }

    /// Views in image order, one per swapchain image
    pub fn image_views(&self) -> FrameResult<Vec<vk::ImageView>> {
        Ok(self.chain()?.images.iter().map(|image| image.view).collect())
    }

    /// Generation of the most recently built chain
    pub fn generation(&self) -> ChainGeneration {
        self.generation
    }

    /// Acquire next image, signaling `semaphore` when it is ready
    pub fn acquire_next_image(
        &self,
        semaphore: vk::Semaphore,
        timeout: Duration,
    ) -> FrameResult<Acquired> {
        let chain = self.chain()?;
        match self
            .device
            .acquire_next_image(chain.handle, semaphore, timeout)
        {
            Ok((index, false)) => Ok(Acquired::Optimal(index)),
            Ok((index, true)) => Ok(Acquired::Suboptimal(index)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquired::OutOfDate),
            Err(e @ vk::Result::ERROR_SURFACE_LOST_KHR) => Err(FrameError::SurfaceLost(e)),
            Err(e @ (vk::Result::TIMEOUT | vk::Result::NOT_READY)) => {
                Err(FrameError::from_wait(e, "swapchain image", timeout))
            }
            Err(e) => Err(FrameError::Acquire(e)),
        }
    }

    /// Present rendered image to screen
    pub fn present(
        &self,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> FrameResult<Presented> {
        let chain = self.chain()?;
        match self.device.present(chain.handle, image_index, wait_semaphore) {
            Ok(false) => Ok(Presented::Optimal),
            Ok(true) => Ok(Presented::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Presented::OutOfDate),
            Err(e @ vk::Result::ERROR_SURFACE_LOST_KHR) => Err(FrameError::SurfaceLost(e)),
            Err(e) => Err(FrameError::Present(e)),
        }
    }
}

/// Turn the surface's capabilities and our preferences into concrete
/// swapchain parameters.
pub fn resolve_swapchain(
    properties: &SurfaceProperties,
    preferences: &SwapchainPreferences,
    desired_extent: vk::Extent2D,
    families: QueueFamilies,
) -> FrameResult<SwapchainDesc> {
    let surface_format = choose_surface_format(&properties.formats, preferences.surface_format)
        .ok_or_else(|| FrameError::UnsupportedSurface("surface reports no formats".into()))?;
    let present_mode = choose_present_mode(&properties.present_modes, &preferences.present_modes)
        .ok_or_else(|| {
            FrameError::UnsupportedSurface(format!(
                "no usable present mode in {:?}",
                properties.present_modes
            ))
        })?;

    let caps = &properties.capabilities;
    let concurrent_families = if families.is_shared() {
        Vec::new()
    } else {
        vec![families.graphics, families.present]
    };

    Ok(SwapchainDesc {
        surface_format,
        present_mode,
        extent: choose_extent(caps, desired_extent),
        min_image_count: choose_image_count(caps),
        pre_transform: caps.current_transform,
        concurrent_families,
    })
}

/// Exact preferred format/color-space pair, else whatever comes first
pub fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    preferred: vk::SurfaceFormatKHR,
) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| f.format == preferred.format && f.color_space == preferred.color_space)
        .or_else(|| formats.first())
        .copied()
}

/// First preferred mode the surface supports, else FIFO
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: &[vk::PresentModeKHR],
) -> Option<vk::PresentModeKHR> {
    preferred
        .iter()
        .copied()
        .find(|mode| available.contains(mode))
        .or_else(|| {
            available
                .contains(&vk::PresentModeKHR::FIFO)
                .then_some(vk::PresentModeKHR::FIFO)
        })
}

/// The surface's extent when it dictates one, otherwise the desired size
/// clamped to what the surface allows
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, desired: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: desired
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: desired
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more than the minimum, capped when the surface has a maximum
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}
