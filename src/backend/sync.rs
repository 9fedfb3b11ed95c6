// Synchronization primitives
//
// Fences and semaphores for GPU-CPU and GPU-GPU sync, one set per frame in
// flight, plus the table of which slot last rendered into each swapchain
// image. Acquisition order and slot order can diverge, so waiting on the
// slot fence alone is not enough before reusing an image.

use super::context::DeviceContext;
use crate::error::{FrameError, FrameResult};
use ash::vk;
use std::sync::Arc;
use std::time::Duration;

/// Frame synchronization - one per frame in flight
#[derive(Debug, Clone, Copy)]
pub struct FrameSlot {
    /// Signaled by the presentation engine when the acquired image is ready
    pub acquire_signal: vk::Semaphore,
    /// Signaled by the graphics queue when rendering finished
    pub present_signal: vk::Semaphore,
    /// Signaled when the slot's submission completed on the GPU
    pub cpu_fence: vk::Fence,
}

pub struct FrameSynchronizer<D: DeviceContext> {
    device: Arc<D>,
    slots: Vec<FrameSlot>,
    /// Swapchain image index -> slot whose fence guards it
    image_owners: Vec<Option<usize>>,
    fence_timeout: Duration,
    torn_down: bool,
}

impl<D: DeviceContext> FrameSynchronizer<D> {
    /// Allocate `count` slots. Fences start signaled so the first frame
    /// through each slot does not block.
    pub fn create_slots(device: Arc<D>, count: usize, fence_timeout: Duration) -> FrameResult<Self> {
        if count == 0 {
            return Err(FrameError::PreconditionViolation(
                "at least one frame in flight is required",
            ));
        }

        // Built in place so that a failure halfway releases what exists
        let mut sync = Self {
            device,
            slots: Vec::with_capacity(count),
            image_owners: Vec::new(),
            fence_timeout,
            torn_down: false,
        };
        for _ in 0..count {
            let slot = sync.create_slot()?;
            sync.slots.push(slot);
        }

        log::info!("Created {} frame slots", count);
        Ok(sync)
    }

    fn create_slot(&self) -> FrameResult<FrameSlot> {
        let acquire_signal = self.device.create_semaphore()?;
        let present_signal = match self.device.create_semaphore() {
            Ok(semaphore) => semaphore,
            Err(e) => {
                self.device.destroy_semaphore(acquire_signal);
                return Err(e.into());
            }
        };
        let cpu_fence = match self.device.create_fence(true) {
            Ok(fence) => fence,
            Err(e) => {
                self.device.destroy_semaphore(acquire_signal);
                self.device.destroy_semaphore(present_signal);
                return Err(e.into());
            }
        };
        Ok(FrameSlot {
            acquire_signal,
            present_signal,
            cpu_fence,
        })
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn is_live(&self) -> bool {
        !self.torn_down
    }

    /// Block until the slot's previous submission has completed.
    ///
    /// This is what bounds how far the CPU may run ahead of the GPU.
    pub fn wait_for_slot(&self, frame: usize) -> FrameResult<()> {
        let fence = self.slot(frame)?.cpu_fence;
        log::trace!("Waiting for frame slot {}", frame);
        self.device
            .wait_for_fence(fence, self.fence_timeout)
            .map_err(|e| FrameError::from_wait(e, "frame slot fence", self.fence_timeout))
    }

    /// Wait for the slot that last used `image_index`, if it is a different
    /// slot and its work has not completed. Returns whether it had to wait.
    pub fn wait_for_image_if_busy(&mut self, image_index: u32, frame: usize) -> FrameResult<bool> {
        self.slot(frame)?;
        let image = image_index as usize;
        if image >= self.image_owners.len() {
            self.image_owners.resize(image + 1, None);
        }

        let owner = match self.image_owners[image] {
            Some(owner) if owner != frame => owner,
            // Free, or guarded by our own fence which wait_for_slot covered
            _ => return Ok(false),
        };

        let fence = self.slots[owner].cpu_fence;
        if self.device.fence_signaled(fence)? {
            self.image_owners[image] = None;
            return Ok(false);
        }

        log::debug!(
            "Image {} still in use by frame slot {}, waiting (current slot {})",
            image_index,
            owner,
            frame
        );
        self.device
            .wait_for_fence(fence, self.fence_timeout)
            .map_err(|e| FrameError::from_wait(e, "image owner fence", self.fence_timeout))?;
        self.image_owners[image] = None;
        Ok(true)
    }

    /// Record that `image_index` is now guarded by `frame`'s fence
    pub fn mark_image_owned(&mut self, image_index: u32, frame: usize) {
        let image = image_index as usize;
        if image >= self.image_owners.len() {
            self.image_owners.resize(image + 1, None);
        }
        self.image_owners[image] = Some(frame);
    }

    pub fn image_owner(&self, image_index: u32) -> Option<usize> {
        self.image_owners.get(image_index as usize).copied().flatten()
    }

    /// Reset the slot fence right before submission, so the upcoming GPU
    /// completion is the only thing that can signal it
    pub fn reset_and_fence(&self, frame: usize) -> FrameResult<()> {
        let fence = self.slot(frame)?.cpu_fence;
        self.device.reset_fence(fence)?;
        Ok(())
    }

    /// Forget every image after a rebuild; none of the old images exist
    pub fn reset_occupancy(&mut self, image_count: usize) {
        self.image_owners.clear();
        self.image_owners.resize(image_count, None);
    }

    pub fn occupied_images(&self) -> usize {
        self.image_owners.iter().filter(|owner| owner.is_some()).count()
    }

    /// Destroy all fences and semaphores. Device must be idle.
    pub fn teardown(&mut self) -> FrameResult<()> {
        if self.torn_down {
            return Err(FrameError::PreconditionViolation(
                "frame synchronizer torn down twice",
            ));
        }
        self.destroy_slots();
        Ok(())
    }

    fn destroy_slots(&mut self) {
        for slot in self.slots.drain(..) {
            self.device.destroy_semaphore(slot.acquire_signal);
            self.device.destroy_semaphore(slot.present_signal);
            self.device.destroy_fence(slot.cpu_fence);
        }
        self.image_owners.clear();
        self.torn_down = true;
    }

    pub fn slot(&self, frame: usize) -> FrameResult<&FrameSlot> {
        if self.torn_down {
            return Err(FrameError::PreconditionViolation(
                "frame synchronizer used after teardown",
            ));
        }
        self.slots
            .get(frame)
            .ok_or(FrameError::PreconditionViolation("frame slot out of range"))
    }
}

impl<D: DeviceContext> Drop for FrameSynchronizer<D> {
    fn drop(&mut self) {
        if !self.torn_down {
            self.destroy_slots();
        }
    }
}
