// Command recording lifecycle
//
// One pre-recorded primary command buffer per swapchain image. The content is
// produced by a `CommandRecorder`; this module owns the buffers, begins and
// ends each one around the recorder, and guarantees that a set is either
// recorded completely or not installed.

use super::context::DeviceContext;
use super::swapchain::{Chain, ChainGeneration};
use super::targets::RenderTargets;
use crate::error::{FrameError, FrameResult};
use ash::vk;
use std::sync::Arc;

/// Everything a recorder needs to fill one image's command buffer
#[derive(Debug, Clone, Copy)]
pub struct FrameTarget {
    pub image_index: u32,
    pub image: vk::Image,
    pub framebuffer: vk::Framebuffer,
    pub render_pass: vk::RenderPass,
    pub extent: vk::Extent2D,
    pub generation: ChainGeneration,
}

/// Produces the GPU commands for one swapchain image.
///
/// Called once per image per chain generation, and again for every image
/// when the content changes. The command buffer has already been begun and is
/// ended after the call returns; only emit commands into it.
pub trait CommandRecorder {
    fn record_frame(
        &mut self,
        command_buffer: vk::CommandBuffer,
        target: &FrameTarget,
    ) -> anyhow::Result<()>;
}

/// Pair each swapchain image with its framebuffer
pub fn frame_targets<D: DeviceContext>(
    chain: &Chain<D>,
    targets: &RenderTargets<D>,
) -> Vec<FrameTarget> {
    chain
        .images()
        .iter()
        .zip(targets.framebuffers())
        .map(|(image, &framebuffer)| FrameTarget {
            image_index: image.index,
            image: image.handle,
            framebuffer,
            render_pass: targets.render_pass(),
            extent: targets.extent(),
            generation: chain.generation(),
        })
        .collect()
}

/// Recorded command buffers for one chain generation
pub struct FrameCommands<D: DeviceContext> {
    device: Arc<D>,
    buffers: Vec<vk::CommandBuffer>,
    generation: ChainGeneration,
}

impl<D: DeviceContext> FrameCommands<D> {
    /// Record every target, all or nothing. On failure the new buffers are
    /// freed and nothing else is touched.
    pub fn record_all<R: CommandRecorder + ?Sized>(
        device: Arc<D>,
        recorder: &mut R,
        targets: &[FrameTarget],
    ) -> FrameResult<Self> {
        let generation = match targets.first() {
            Some(target) => target.generation,
            None => {
                return Err(FrameError::PreconditionViolation(
                    "recording with no swapchain images",
                ))
            }
        };
        if targets.iter().any(|t| t.generation != generation) {
            return Err(FrameError::PreconditionViolation(
                "recording targets from different chain generations",
            ));
        }

        let buffers = device.allocate_command_buffers(targets.len() as u32)?;
        let commands = Self {
            device,
            buffers,
            generation,
        };

        for (target, &buffer) in targets.iter().zip(&commands.buffers) {
            commands.device.begin_command_buffer(buffer)?;
            recorder
                .record_frame(buffer, target)
                .map_err(|e| FrameError::Recording {
                    image_index: target.image_index,
                    reason: format!("{e:#}"),
                })?;
            commands.device.end_command_buffer(buffer)?;
        }

        log::debug!("Recorded {} command buffers for {}", commands.buffers.len(), generation);
        Ok(commands)
    }

    /// Command buffer for `image_index`, refusing stale generations
    pub fn buffer_for(&self, image_index: u32, generation: ChainGeneration) -> FrameResult<vk::CommandBuffer> {
        if generation != self.generation {
            return Err(FrameError::PreconditionViolation(
                "command buffer requested for a stale chain generation",
            ));
        }
        self.buffers
            .get(image_index as usize)
            .copied()
            .ok_or(FrameError::PreconditionViolation("image index has no command buffer"))
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn generation(&self) -> ChainGeneration {
        self.generation
    }
}

impl<D: DeviceContext> Drop for FrameCommands<D> {
    fn drop(&mut self) {
        if !self.buffers.is_empty() {
            self.device.free_command_buffers(&self.buffers);
        }
    }
}
