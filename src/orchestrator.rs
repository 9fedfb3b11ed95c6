// =============================================================================
// FRAME ORCHESTRATOR - acquire, wait, submit, present, advance
// =============================================================================
//
// FRAME FLOW:
// 1. Wait for the frame slot's fence (bounds CPU run-ahead)
// 2. Acquire the next swapchain image
// 3. Wait for whichever slot last used that image, claim it
// 4. Reset the slot fence
// 5. Submit the pre-recorded command buffer for the image
// 6. Present, rebuild the swapchain if it went stale, advance the slot
//
// REBUILD:
// wait for a non-zero surface extent -> device idle -> destroy command buffers,
// framebuffers, render pass, swapchain -> build them again -> record.
// Frame slots survive rebuilds; only the image occupancy table is reset.
//
// =============================================================================

use crate::backend::commands::{frame_targets, CommandRecorder, FrameCommands};
use crate::backend::context::{DeviceContext, QueueFamilies, Submission, SwapchainDesc};
use crate::backend::surface::{is_zero_sized, SurfaceProvider};
use crate::backend::swapchain::{
    Acquired, ChainGeneration, Presented, SwapchainManager, SwapchainPreferences,
};
use crate::backend::sync::FrameSynchronizer;
use crate::backend::targets::RenderTargets;
use crate::error::{FrameError, FrameResult};
use crate::MAX_FRAMES_IN_FLIGHT;
use ash::vk;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct FrameSettings {
    pub frames_in_flight: usize,
    /// Longest a fence wait may block before the device is considered lost
    pub fence_timeout: Duration,
    pub acquire_timeout: Duration,
    pub swapchain: SwapchainPreferences,
}

impl Default for FrameSettings {
    fn default() -> Self {
        Self {
            frames_in_flight: MAX_FRAMES_IN_FLIGHT,
            fence_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(5),
            swapchain: SwapchainPreferences::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    /// Waiting for the slot fence and acquiring an image
    Acquiring,
    /// Waiting for the acquired image to be released by another slot
    Waiting,
    Submitting,
    Presenting,
    Rebuilding,
    /// A fatal error happened; only teardown is allowed
    Faulted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub submitted: u64,
    pub presented: u64,
    /// Frames abandoned because acquisition found the chain out of date
    pub skipped: u64,
    pub rebuilds: u64,
    pub rerecords: u64,
}

/// What happened to one `render_frame` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameReport {
    pub slot: usize,
    /// `None` when the frame was abandoned before submission
    pub image_index: Option<u32>,
    pub rebuilt: bool,
}

impl FrameReport {
    pub fn presented(&self) -> bool {
        self.image_index.is_some()
    }
}

pub struct FrameOrchestrator<D, S, R>
where
    D: DeviceContext,
    S: SurfaceProvider,
    R: CommandRecorder,
{
    device: Arc<D>,
    surface: S,
    recorder: R,
    settings: FrameSettings,
    families: QueueFamilies,

    swapchain: SwapchainManager<D>,
    sync: FrameSynchronizer<D>,
    targets: Option<RenderTargets<D>>,
    commands: Option<FrameCommands<D>>,

    /// Frames started since creation, including abandoned ones
    frame_count: u64,
    /// Which sync slot we're currently using (0 to frames_in_flight-1)
    current_frame: usize,
    state: FrameState,
    content_dirty: bool,
    stats: FrameStats,
}

impl<D, S, R> FrameOrchestrator<D, S, R>
where
    D: DeviceContext,
    S: SurfaceProvider,
    R: CommandRecorder,
{
    /// Create the frame slots, build the first swapchain and record it.
    pub fn new(device: Arc<D>, surface: S, recorder: R, settings: FrameSettings) -> FrameResult<Self> {
        let families = device.queue_families();
        let sync = FrameSynchronizer::create_slots(
            device.clone(),
            settings.frames_in_flight,
            settings.fence_timeout,
        )?;
        let swapchain = SwapchainManager::new(device.clone(), settings.swapchain.clone());

        let mut orchestrator = Self {
            device,
            surface,
            recorder,
            settings,
            families,
            swapchain,
            sync,
            targets: None,
            commands: None,
            frame_count: 0,
            current_frame: 0,
            state: FrameState::Idle,
            content_dirty: false,
            stats: FrameStats::default(),
        };
        orchestrator.build_chain()?;
        orchestrator.transition(FrameState::Idle);
        Ok(orchestrator)
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    /// Render a single frame.
    ///
    /// Out-of-date and suboptimal swapchains are handled here by rebuilding;
    /// any error returned is fatal and leaves the orchestrator `Faulted`.
    pub fn render_frame(&mut self) -> FrameResult<FrameReport> {
        self.ensure_usable()?;
        let result = self.run_frame();
        if let Err(ref e) = result {
            self.fault(e);
        }
        result
    }

    fn run_frame(&mut self) -> FrameResult<FrameReport> {
        if self.content_dirty {
            self.rerecord()?;
        }

        let frame = self.current_frame;
        let slot = *self.sync.slot(frame)?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 1-2: Wait for this slot, then acquire
        // ─────────────────────────────────────────────────────────────────────
        self.transition(FrameState::Acquiring);
        self.sync.wait_for_slot(frame)?;

        let acquired = self
            .swapchain
            .acquire_next_image(slot.acquire_signal, self.settings.acquire_timeout)?;
        let (image_index, suboptimal) = match acquired {
            Acquired::Optimal(index) => (index, false),
            Acquired::Suboptimal(index) => (index, true),
            Acquired::OutOfDate => {
                // Nothing was acquired, the slot's signals are untouched
                log::info!("Swapchain out of date on acquire, skipping frame {}", self.frame_count);
                self.stats.skipped += 1;
                self.rebuild_chain()?;
                self.advance();
                return Ok(FrameReport {
                    slot: frame,
                    image_index: None,
                    rebuilt: true,
                });
            }
        };

        // ─────────────────────────────────────────────────────────────────────
        // STEP 3: Make sure no other slot is still rendering into this image
        // ─────────────────────────────────────────────────────────────────────
        self.transition(FrameState::Waiting);
        self.sync.wait_for_image_if_busy(image_index, frame)?;
        self.sync.mark_image_owned(image_index, frame);

        // ─────────────────────────────────────────────────────────────────────
        // STEP 4-5: Reset the fence and submit
        // ─────────────────────────────────────────────────────────────────────
        self.transition(FrameState::Submitting);
        let command_buffer = self
            .commands
            .as_ref()
            .ok_or(FrameError::PreconditionViolation("no recorded command buffers"))?
            .buffer_for(image_index, self.swapchain.generation())?;

        self.sync.reset_and_fence(frame)?;
        self.device
            .submit(&Submission {
                command_buffer,
                wait_semaphore: slot.acquire_signal,
                wait_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                signal_semaphore: slot.present_signal,
                fence: slot.cpu_fence,
            })
            .map_err(|e| match e {
                vk::Result::ERROR_DEVICE_LOST => FrameError::DeviceLost,
                other => FrameError::Submission(other),
            })?;
        self.stats.submitted += 1;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 6: Present, rebuild if the chain went stale, advance
        // ─────────────────────────────────────────────────────────────────────
        self.transition(FrameState::Presenting);
        let presented = self.swapchain.present(image_index, slot.present_signal)?;
        if presented != Presented::OutOfDate {
            self.stats.presented += 1;
        }

        let resize_requested = self.surface.take_resize_request();
        let rebuild = suboptimal || resize_requested || presented != Presented::Optimal;
        if rebuild {
            log::info!(
                "Rebuilding swapchain after present (acquire suboptimal: {}, present: {:?}, resize: {})",
                suboptimal,
                presented,
                resize_requested
            );
            self.rebuild_chain()?;
        }

        self.advance();
        self.transition(FrameState::Idle);
        Ok(FrameReport {
            slot: frame,
            image_index: Some(image_index),
            rebuilt: rebuild,
        })
    }

    fn advance(&mut self) {
        self.frame_count += 1;
        self.current_frame = (self.frame_count % self.sync.slot_count() as u64) as usize;
    }

    // =========================================================================
    // REBUILD
    // =========================================================================

    /// Run the rebuild protocol outside the frame loop (e.g. fullscreen toggle)
    pub fn rebuild(&mut self) -> FrameResult<()> {
        self.ensure_usable()?;
        match self.rebuild_chain() {
            Ok(()) => {
                self.transition(FrameState::Idle);
                Ok(())
            }
            Err(e) => {
                self.fault(&e);
                Err(e)
            }
        }
    }

    fn rebuild_chain(&mut self) -> FrameResult<()> {
        self.build_chain()?;
        self.stats.rebuilds += 1;
        Ok(())
    }

    fn build_chain(&mut self) -> FrameResult<()> {
        self.transition(FrameState::Rebuilding);

        // Minimized: nothing can be built until the window and the surface
        // both have a size again
        let desc = self.wait_for_nonzero_chain()?;

        // Drain everything in flight before destroying what the GPU reads
        if self.swapchain.is_live() {
            self.wait_device_idle()?;
        }

        // Consumers before producers
        self.commands = None;
        self.targets = None;
        if self.swapchain.is_live() {
            self.swapchain.teardown()?;
        }

        let chain = self.swapchain.build(&desc)?;
        let targets = RenderTargets::new(self.device.clone(), chain)?;
        let frame_targets = frame_targets(chain, &targets);
        let image_count = chain.image_count();
        let chain_extent = chain.extent();
        let generation = chain.generation();
        self.targets = Some(targets);

        let commands =
            FrameCommands::record_all(self.device.clone(), &mut self.recorder, &frame_targets)?;
        self.commands = Some(commands);
        self.content_dirty = false;

        // None of the old images exist anymore
        self.sync.reset_occupancy(image_count);
        self.surface.take_resize_request();

        log::info!(
            "Swapchain ready: {} {}x{}, {} images",
            generation,
            chain_extent.width,
            chain_extent.height,
            image_count
        );
        Ok(())
    }

    fn wait_for_nonzero_chain(&mut self) -> FrameResult<SwapchainDesc> {
        let mut logged = false;
        loop {
            let size = self.surface.drawable_size();
            if !is_zero_sized(size) {
                let desc = self.swapchain.plan(size, self.families)?;
                if !is_zero_sized(desc.extent) {
                    return Ok(desc);
                }
            }
            if !logged {
                log::info!("Surface has no drawable area, waiting for it to be restored");
                logged = true;
            }
            self.surface.wait_events();
        }
    }

    fn wait_device_idle(&self) -> FrameResult<()> {
        self.device
            .wait_idle()
            .map_err(|e| FrameError::from_wait(e, "device idle", self.settings.fence_timeout))
    }

    // =========================================================================
    // CONTENT CHANGES
    // =========================================================================

    /// Upstream content changed: re-record every image before the next frame
    pub fn request_rerecord(&mut self) {
        self.content_dirty = true;
    }

    fn rerecord(&mut self) -> FrameResult<()> {
        let chain = self.swapchain.chain()?;
        let targets = self
            .targets
            .as_ref()
            .ok_or(FrameError::PreconditionViolation("re-record with no render targets"))?;
        let frame_targets = frame_targets(chain, targets);

        // The current buffers may still be executing
        self.wait_device_idle()?;
        let commands =
            FrameCommands::record_all(self.device.clone(), &mut self.recorder, &frame_targets)?;
        self.commands = Some(commands);
        self.content_dirty = false;
        self.stats.rerecords += 1;
        log::debug!("Re-recorded {} command buffers", frame_targets.len());
        Ok(())
    }

    // =========================================================================
    // STATE
    // =========================================================================

    fn transition(&mut self, next: FrameState) {
        if self.state != next {
            log::trace!("Frame state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    fn fault(&mut self, error: &FrameError) {
        log::error!("Frame loop faulted in {:?}: {}", self.state, error);
        self.state = FrameState::Faulted;
    }

    fn ensure_usable(&self) -> FrameResult<()> {
        if self.state == FrameState::Faulted {
            return Err(FrameError::PreconditionViolation(
                "frame loop is faulted and must be shut down",
            ));
        }
        Ok(())
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn frames_in_flight(&self) -> usize {
        self.sync.slot_count()
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    pub fn generation(&self) -> ChainGeneration {
        self.swapchain.generation()
    }

    pub fn extent(&self) -> Option<vk::Extent2D> {
        self.swapchain.chain().ok().map(|chain| chain.extent())
    }

    pub fn image_count(&self) -> usize {
        self.swapchain.chain().map(|chain| chain.image_count()).unwrap_or(0)
    }

    pub fn occupied_images(&self) -> usize {
        self.sync.occupied_images()
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    pub fn recorder(&self) -> &R {
        &self.recorder
    }

    pub fn recorder_mut(&mut self) -> &mut R {
        &mut self.recorder
    }

    // =========================================================================
    // CLEANUP
    // =========================================================================

    /// Drain the GPU and destroy everything in dependency order.
    pub fn shutdown(mut self) -> FrameResult<()> {
        self.release()
    }

    fn release(&mut self) -> FrameResult<()> {
        if !self.sync.is_live() && !self.swapchain.is_live() {
            return Ok(());
        }
        log::info!("Releasing frame resources ({:?})", self.state);

        // Resources are destroyed even when the drain fails; a lost device
        // still allows destruction
        let idle = self.wait_device_idle();

        self.commands = None;
        self.targets = None;
        if self.swapchain.is_live() {
            self.swapchain.teardown()?;
        }
        if self.sync.is_live() {
            self.sync.teardown()?;
        }
        idle
    }
}

impl<D, S, R> Drop for FrameOrchestrator<D, S, R>
where
    D: DeviceContext,
    S: SurfaceProvider,
    R: CommandRecorder,
{
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::error!("Frame resource teardown failed: {}", e);
        }
    }
}
