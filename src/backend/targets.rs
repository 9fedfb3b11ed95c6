// Render targets
//
// The render pass and one framebuffer per swapchain image. Both depend on the
// chain's format and extent, so they live exactly as long as one chain
// generation and are destroyed before the chain itself.

use super::context::DeviceContext;
use super::swapchain::{Chain, ChainGeneration};
use crate::error::FrameResult;
use ash::vk;
use std::sync::Arc;

pub struct RenderTargets<D: DeviceContext> {
    device: Arc<D>,
    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,
    extent: vk::Extent2D,
    generation: ChainGeneration,
}

impl<D: DeviceContext> RenderTargets<D> {
    pub fn new(device: Arc<D>, chain: &Chain<D>) -> FrameResult<Self> {
        let render_pass = device.create_render_pass(chain.format())?;
        let mut targets = Self {
            device,
            render_pass,
            framebuffers: Vec::with_capacity(chain.image_count()),
            extent: chain.extent(),
            generation: chain.generation(),
        };

        for image in chain.images() {
            let framebuffer =
                targets
                    .device
                    .create_framebuffer(render_pass, image.view, chain.extent())?;
            targets.framebuffers.push(framebuffer);
        }

        log::debug!(
            "Created render pass and {} framebuffers for {}",
            targets.framebuffers.len(),
            targets.generation
        );
        Ok(targets)
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn framebuffers(&self) -> &[vk::Framebuffer] {
        &self.framebuffers
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn generation(&self) -> ChainGeneration {
        self.generation
    }
}

impl<D: DeviceContext> Drop for RenderTargets<D> {
    fn drop(&mut self) {
        // Framebuffers reference the render pass
        for &framebuffer in &self.framebuffers {
            self.device.destroy_framebuffer(framebuffer);
        }
        self.device.destroy_render_pass(self.render_pass);
    }
}
