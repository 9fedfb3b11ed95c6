// Test doubles for the device, the surface provider and the recorder
//
// The mock GPU completes work lazily: a submitted fence stays pending until the
// CPU waits on it or the device is drained. That makes "the GPU is still busy"
// the default state, which is what the frame protocol has to cope with.
// Binary semaphore state is tracked as well, and any misuse of the
// acquire/submit/present handshake is recorded as a protocol violation.

use super::commands::{CommandRecorder, FrameTarget};
use super::context::{
    DeviceContext, QueueFamilies, Submission, SurfaceProperties, SwapchainDesc,
};
use super::surface::SurfaceProvider;
use super::swapchain::ChainGeneration;
use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FenceState {
    Signaled,
    Unsignaled,
    /// Waiting on the submission with this serial
    Pending(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferState {
    Initial,
    Recording,
    Executable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedAcquire {
    /// Next image in round-robin order
    Next,
    Image(u32),
    Suboptimal,
    OutOfDate,
    Fail(vk::Result),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedPresent {
    Suboptimal,
    OutOfDate,
    Fail(vk::Result),
}

#[derive(Debug, Clone, Copy)]
pub struct SubmitRecord {
    pub command_buffer: vk::CommandBuffer,
    pub fence: vk::Fence,
    pub wait_semaphore: vk::Semaphore,
    pub signal_semaphore: vk::Semaphore,
}

#[derive(Debug, Clone, Copy)]
pub struct PresentRecord {
    pub swapchain: vk::SwapchainKHR,
    pub image_index: u32,
}

/// Counts of objects that have been created and not yet destroyed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveObjects {
    pub fences: usize,
    pub semaphores: usize,
    pub swapchains: usize,
    pub image_views: usize,
    pub render_passes: usize,
    pub framebuffers: usize,
    pub command_buffers: usize,
}

struct MockSwapchain {
    images: Vec<vk::Image>,
    next_image: u32,
}

#[derive(Default)]
struct MockState {
    next_handle: u64,
    next_serial: u64,
    fences: HashMap<vk::Fence, FenceState>,
    /// Binary semaphore -> currently signaled
    semaphores: HashMap<vk::Semaphore, bool>,
    swapchains: HashMap<vk::SwapchainKHR, MockSwapchain>,
    image_views: HashSet<vk::ImageView>,
    render_passes: HashSet<vk::RenderPass>,
    framebuffers: HashSet<vk::Framebuffer>,
    command_buffers: HashMap<vk::CommandBuffer, BufferState>,

    properties: SurfaceProperties,
    /// Overrides `current_extent` for one surface query each
    surface_extents: VecDeque<vk::Extent2D>,
    families: Option<QueueFamilies>,
    surface_lost: bool,
    acquire_script: VecDeque<ScriptedAcquire>,
    present_script: VecDeque<ScriptedPresent>,
    fail_submit: Option<vk::Result>,
    fail_command_buffer_allocation: bool,
    fail_end_on: Option<usize>,
    ends: usize,

    submits: Vec<SubmitRecord>,
    last_submit_serial: Option<u64>,
    completed: HashSet<u64>,
    /// Image index -> serial of the submission that last rendered into it
    image_writers: HashMap<u32, u64>,
    presents: Vec<PresentRecord>,
    blocking_waits: usize,
    wait_idle_calls: usize,
    swapchain_descs: Vec<SwapchainDesc>,
    violations: Vec<String>,
}

impl MockState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn complete(&mut self, fence: vk::Fence) {
        if let Some(FenceState::Pending(serial)) = self.fences.get(&fence).copied() {
            self.completed.insert(serial);
            self.fences.insert(fence, FenceState::Signaled);
        }
    }
}

pub struct MockDevice {
    state: Mutex<MockState>,
}

impl MockDevice {
    pub fn new() -> Self {
        let state = MockState {
            properties: default_surface_properties(),
            ..MockState::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn set_surface_properties(&self, properties: SurfaceProperties) {
        self.state.lock().properties = properties;
    }

    /// `current_extent` reported by the next surface query
    pub fn script_surface_extent(&self, extent: vk::Extent2D) {
        self.state.lock().surface_extents.push_back(extent);
    }

    pub fn set_queue_families(&self, families: QueueFamilies) {
        self.state.lock().families = Some(families);
    }

    pub fn set_surface_lost(&self, lost: bool) {
        self.state.lock().surface_lost = lost;
    }

    pub fn script_acquire(&self, outcome: ScriptedAcquire) {
        self.state.lock().acquire_script.push_back(outcome);
    }

    pub fn script_present(&self, outcome: ScriptedPresent) {
        self.state.lock().present_script.push_back(outcome);
    }

    pub fn fail_next_submit(&self, result: vk::Result) {
        self.state.lock().fail_submit = Some(result);
    }

    pub fn fail_command_buffer_allocation(&self, fail: bool) {
        self.state.lock().fail_command_buffer_allocation = fail;
    }

    /// Fail the `n`th `end_command_buffer` call from now, counting from zero
    pub fn fail_command_buffer_end(&self, n: usize) {
        let mut state = self.state.lock();
        state.fail_end_on = Some(state.ends + n);
    }

    /// Command buffers that have been begun and ended
    pub fn executable_command_buffers(&self) -> usize {
        self.state
            .lock()
            .command_buffers
            .values()
            .filter(|state| **state == BufferState::Executable)
            .count()
    }

    pub fn submits(&self) -> Vec<SubmitRecord> {
        self.state.lock().submits.clone()
    }

    pub fn presents(&self) -> Vec<PresentRecord> {
        self.state.lock().presents.clone()
    }

    /// Fence waits that actually had to block on pending GPU work
    pub fn blocking_waits(&self) -> usize {
        self.state.lock().blocking_waits
    }

    pub fn wait_idle_calls(&self) -> usize {
        self.state.lock().wait_idle_calls
    }

    pub fn swapchain_descs(&self) -> Vec<SwapchainDesc> {
        self.state.lock().swapchain_descs.clone()
    }

    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }

    pub fn fence_is_signaled(&self, fence: vk::Fence) -> bool {
        self.state.lock().fences.get(&fence) == Some(&FenceState::Signaled)
    }

    /// Number of submissions still executing on the mock GPU
    pub fn pending_submissions(&self) -> usize {
        self.state
            .lock()
            .fences
            .values()
            .filter(|state| matches!(state, FenceState::Pending(_)))
            .count()
    }

    pub fn live_objects(&self) -> LiveObjects {
        let state = self.state.lock();
        LiveObjects {
            fences: state.fences.len(),
            semaphores: state.semaphores.len(),
            swapchains: state.swapchains.len(),
            image_views: state.image_views.len(),
            render_passes: state.render_passes.len(),
            framebuffers: state.framebuffers.len(),
            command_buffers: state.command_buffers.len(),
        }
    }
}

pub fn default_surface_properties() -> SurfaceProperties {
    SurfaceProperties {
        capabilities: vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            // u32::MAX: the swapchain decides the extent
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            max_image_array_layers: 1,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            ..Default::default()
        },
        formats: vec![
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ],
        present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
    }
}

impl DeviceContext for MockDevice {
    fn queue_families(&self) -> QueueFamilies {
        self.state.lock().families.unwrap_or(QueueFamilies {
            graphics: 0,
            present: 0,
        })
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let mut state = self.state.lock();
        let fence = vk::Fence::from_raw(state.handle());
        let initial = if signaled {
            FenceState::Signaled
        } else {
            FenceState::Unsignaled
        };
        state.fences.insert(fence, initial);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        if let Some(FenceState::Pending(_)) = state.fences.get(&fence) {
            state.violations.push(format!("fence {fence:?} destroyed while pending"));
        }
        state.fences.remove(&fence);
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let mut state = self.state.lock();
        let semaphore = vk::Semaphore::from_raw(state.handle());
        state.semaphores.insert(semaphore, false);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.state.lock().semaphores.remove(&semaphore);
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout: Duration) -> VkResult<()> {
        let mut state = self.state.lock();
        match state.fences.get(&fence).copied() {
            Some(FenceState::Signaled) => Ok(()),
            Some(FenceState::Pending(_)) => {
                state.blocking_waits += 1;
                state.complete(fence);
                Ok(())
            }
            // Nothing was submitted with this fence: it can never signal
            Some(FenceState::Unsignaled) => Err(vk::Result::TIMEOUT),
            None => Err(vk::Result::ERROR_UNKNOWN),
        }
    }

    fn fence_signaled(&self, fence: vk::Fence) -> VkResult<bool> {
        match self.state.lock().fences.get(&fence) {
            Some(state) => Ok(*state == FenceState::Signaled),
            None => Err(vk::Result::ERROR_UNKNOWN),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state.lock();
        match state.fences.get(&fence).copied() {
            Some(FenceState::Pending(_)) => {
                state.violations.push(format!("fence {fence:?} reset while pending"));
                Ok(())
            }
            Some(_) => {
                state.fences.insert(fence, FenceState::Unsignaled);
                Ok(())
            }
            None => Err(vk::Result::ERROR_UNKNOWN),
        }
    }

    fn wait_idle(&self) -> VkResult<()> {
        let mut state = self.state.lock();
        state.wait_idle_calls += 1;
        let pending: Vec<vk::Fence> = state
            .fences
            .iter()
            .filter(|(_, s)| matches!(s, FenceState::Pending(_)))
            .map(|(f, _)| *f)
            .collect();
        for fence in pending {
            state.complete(fence);
        }
        Ok(())
    }

    fn submit(&self, submission: &Submission) -> VkResult<()> {
        let mut state = self.state.lock();
        if let Some(result) = state.fail_submit.take() {
            return Err(result);
        }
        if state.fences.get(&submission.fence) != Some(&FenceState::Unsignaled) {
            state
                .violations
                .push(format!("submit with fence {:?} not unsignaled", submission.fence));
        }
        match state.command_buffers.get(&submission.command_buffer).copied() {
            Some(BufferState::Executable) => {}
            Some(buffer_state) => state.violations.push(format!(
                "submit of command buffer {:?} in state {:?}",
                submission.command_buffer, buffer_state
            )),
            None => state.violations.push(format!(
                "submit of unknown command buffer {:?}",
                submission.command_buffer
            )),
        }
        match state.semaphores.get(&submission.wait_semaphore).copied() {
            Some(true) => {
                state.semaphores.insert(submission.wait_semaphore, false);
            }
            _ => state.violations.push(format!(
                "submit waits on unsignaled semaphore {:?}",
                submission.wait_semaphore
            )),
        }
        if state.semaphores.get(&submission.signal_semaphore) == Some(&true) {
            state.violations.push(format!(
                "submit signals already signaled semaphore {:?}",
                submission.signal_semaphore
            ));
        }
        state.semaphores.insert(submission.signal_semaphore, true);

        state.next_serial += 1;
        let serial = state.next_serial;
        state.fences.insert(submission.fence, FenceState::Pending(serial));
        state.last_submit_serial = Some(serial);
        state.submits.push(SubmitRecord {
            command_buffer: submission.command_buffer,
            fence: submission.fence,
            wait_semaphore: submission.wait_semaphore,
            signal_semaphore: submission.signal_semaphore,
        });
        Ok(())
    }

    fn present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> VkResult<bool> {
        let mut state = self.state.lock();
        state.presents.push(PresentRecord {
            swapchain,
            image_index,
        });
        if !state.swapchains.contains_key(&swapchain) {
            state
                .violations
                .push(format!("present to destroyed swapchain {swapchain:?}"));
        }

        // The image must not still be in use by an earlier submission
        if let Some(current) = state.last_submit_serial {
            if let Some(previous) = state.image_writers.insert(image_index, current) {
                if previous != current && !state.completed.contains(&previous) {
                    state.violations.push(format!(
                        "image {image_index} reused while submission {previous} is in flight"
                    ));
                }
            }
        }

        let scripted = state.present_script.pop_front();
        if let Some(ScriptedPresent::Fail(result)) = scripted {
            return Err(result);
        }
        match state.semaphores.get(&wait_semaphore).copied() {
            Some(true) => {
                state.semaphores.insert(wait_semaphore, false);
            }
            _ => state.violations.push(format!(
                "present waits on unsignaled semaphore {wait_semaphore:?}"
            )),
        }
        match scripted {
            Some(ScriptedPresent::OutOfDate) => Err(vk::Result::ERROR_OUT_OF_DATE_KHR),
            Some(ScriptedPresent::Suboptimal) => Ok(true),
            _ => Ok(false),
        }
    }

    fn surface_properties(&self) -> VkResult<SurfaceProperties> {
        let mut state = self.state.lock();
        if state.surface_lost {
            return Err(vk::Result::ERROR_SURFACE_LOST_KHR);
        }
        let mut properties = state.properties.clone();
        if let Some(extent) = state.surface_extents.pop_front() {
            properties.capabilities.current_extent = extent;
        }
        Ok(properties)
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> VkResult<vk::SwapchainKHR> {
        let mut state = self.state.lock();
        if !state.swapchains.is_empty() {
            state
                .violations
                .push("swapchain created while another is live".to_string());
        }
        let swapchain = vk::SwapchainKHR::from_raw(state.handle());
        let images = (0..desc.min_image_count)
            .map(|_| vk::Image::from_raw(state.handle()))
            .collect();
        state.swapchains.insert(
            swapchain,
            MockSwapchain {
                images,
                next_image: 0,
            },
        );
        state.swapchain_descs.push(desc.clone());
        // Images from the previous chain no longer exist
        state.image_writers.clear();
        Ok(swapchain)
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        self.state
            .lock()
            .swapchains
            .get(&swapchain)
            .map(|chain| chain.images.clone())
            .ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state.lock();
        if state.fences.values().any(|s| matches!(s, FenceState::Pending(_))) {
            state
                .violations
                .push(format!("swapchain {swapchain:?} destroyed with GPU work in flight"));
        }
        state.swapchains.remove(&swapchain);
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
        _timeout: Duration,
    ) -> VkResult<(u32, bool)> {
        let mut state = self.state.lock();
        let scripted = state.acquire_script.pop_front();
        let (index, suboptimal) = {
            let chain = state
                .swapchains
                .get_mut(&swapchain)
                .ok_or(vk::Result::ERROR_UNKNOWN)?;
            let image_count = chain.images.len() as u32;
            let next = chain.next_image;
            match scripted {
                Some(ScriptedAcquire::OutOfDate) => return Err(vk::Result::ERROR_OUT_OF_DATE_KHR),
                Some(ScriptedAcquire::Fail(result)) => return Err(result),
                Some(ScriptedAcquire::Image(index)) => (index, false),
                Some(ScriptedAcquire::Suboptimal) => {
                    chain.next_image = (next + 1) % image_count;
                    (next, true)
                }
                Some(ScriptedAcquire::Next) | None => {
                    chain.next_image = (next + 1) % image_count;
                    (next, false)
                }
            }
        };
        if state.semaphores.get(&semaphore) == Some(&true) {
            state
                .violations
                .push(format!("acquire signals already signaled semaphore {semaphore:?}"));
        }
        state.semaphores.insert(semaphore, true);
        Ok((index, suboptimal))
    }

    fn create_image_view(&self, _image: vk::Image, _format: vk::Format) -> VkResult<vk::ImageView> {
        let mut state = self.state.lock();
        let view = vk::ImageView::from_raw(state.handle());
        state.image_views.insert(view);
        Ok(view)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.state.lock().image_views.remove(&view);
    }

    fn create_render_pass(&self, _format: vk::Format) -> VkResult<vk::RenderPass> {
        let mut state = self.state.lock();
        let render_pass = vk::RenderPass::from_raw(state.handle());
        state.render_passes.insert(render_pass);
        Ok(render_pass)
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.state.lock().render_passes.remove(&render_pass);
    }

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        view: vk::ImageView,
        _extent: vk::Extent2D,
    ) -> VkResult<vk::Framebuffer> {
        let mut state = self.state.lock();
        if !state.render_passes.contains(&render_pass) || !state.image_views.contains(&view) {
            state
                .violations
                .push("framebuffer created from a destroyed render pass or view".to_string());
        }
        let framebuffer = vk::Framebuffer::from_raw(state.handle());
        state.framebuffers.insert(framebuffer);
        Ok(framebuffer)
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.state.lock().framebuffers.remove(&framebuffer);
    }

    fn allocate_command_buffers(&self, count: u32) -> VkResult<Vec<vk::CommandBuffer>> {
        let mut state = self.state.lock();
        if state.fail_command_buffer_allocation {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        let buffers: Vec<vk::CommandBuffer> = (0..count)
            .map(|_| vk::CommandBuffer::from_raw(state.handle()))
            .collect();
        state
            .command_buffers
            .extend(buffers.iter().map(|&buffer| (buffer, BufferState::Initial)));
        Ok(buffers)
    }

    fn free_command_buffers(&self, buffers: &[vk::CommandBuffer]) {
        let mut state = self.state.lock();
        for buffer in buffers {
            state.command_buffers.remove(buffer);
        }
    }

    fn begin_command_buffer(&self, buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state.lock();
        match state.command_buffers.get(&buffer).copied() {
            None => Err(vk::Result::ERROR_UNKNOWN),
            Some(BufferState::Recording) => {
                state
                    .violations
                    .push(format!("command buffer {buffer:?} begun twice"));
                Ok(())
            }
            Some(_) => {
                state.command_buffers.insert(buffer, BufferState::Recording);
                Ok(())
            }
        }
    }

    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state.lock();
        let call = state.ends;
        state.ends += 1;
        if state.fail_end_on == Some(call) {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        match state.command_buffers.get(&buffer).copied() {
            None => Err(vk::Result::ERROR_UNKNOWN),
            Some(BufferState::Recording) => {
                state.command_buffers.insert(buffer, BufferState::Executable);
                Ok(())
            }
            Some(_) => {
                state
                    .violations
                    .push(format!("command buffer {buffer:?} ended without begin"));
                Ok(())
            }
        }
    }
}

/// Surface whose drawable size only changes when the test says so
pub struct MockSurface {
    size: vk::Extent2D,
    upcoming: VecDeque<vk::Extent2D>,
    resize_requested: bool,
    waits: usize,
}

impl MockSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            size: vk::Extent2D { width, height },
            upcoming: VecDeque::new(),
            resize_requested: false,
            waits: 0,
        }
    }

    /// Change the size immediately and raise the resize flag
    pub fn resize(&mut self, width: u32, height: u32) {
        self.size = vk::Extent2D { width, height };
        self.resize_requested = true;
    }

    /// Size delivered by the next `wait_events` call
    pub fn then_resize(&mut self, width: u32, height: u32) {
        self.upcoming.push_back(vk::Extent2D { width, height });
    }

    pub fn request_resize(&mut self) {
        self.resize_requested = true;
    }

    pub fn resize_pending(&self) -> bool {
        self.resize_requested
    }

    pub fn waits(&self) -> usize {
        self.waits
    }
}

impl SurfaceProvider for MockSurface {
    fn drawable_size(&self) -> vk::Extent2D {
        self.size
    }

    fn take_resize_request(&mut self) -> bool {
        std::mem::take(&mut self.resize_requested)
    }

    fn wait_events(&mut self) {
        self.waits += 1;
        match self.upcoming.pop_front() {
            Some(size) => {
                self.size = size;
                self.resize_requested = true;
            }
            None => panic!("surface wait with no further size change scripted"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordCall {
    pub image_index: u32,
    pub command_buffer: vk::CommandBuffer,
    pub framebuffer: vk::Framebuffer,
    pub generation: ChainGeneration,
}

#[derive(Default)]
pub struct MockRecorder {
    pub calls: Vec<RecordCall>,
    pub fail_on_image: Option<u32>,
}

impl CommandRecorder for MockRecorder {
    fn record_frame(
        &mut self,
        command_buffer: vk::CommandBuffer,
        target: &FrameTarget,
    ) -> anyhow::Result<()> {
        if self.fail_on_image == Some(target.image_index) {
            anyhow::bail!("scripted recording failure");
        }
        self.calls.push(RecordCall {
            image_index: target.image_index,
            command_buffer,
            framebuffer: target.framebuffer,
            generation: target.generation,
        });
        Ok(())
    }
}
