// =============================================================================
// FRAME PACER - winit shell around the Vulkan frame loop
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  App (winit event handling, FPS title, config hot reload)       │
// │    └── FrameOrchestrator                                        │
// │          ├── SwapchainManager  (images, rebuilds)               │
// │          ├── FrameSynchronizer (fences, semaphores, occupancy)  │
// │          └── ClearColorRecorder (pre-recorded clear pass)       │
// │                └── VulkanDevice (instance, queues, pool)        │
// └─────────────────────────────────────────────────────────────────┘
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use frame_pacer::backend::{CommandRecorder, FrameTarget, SurfaceProvider, VulkanDevice};
use frame_pacer::config::{Config, DEFAULT_CONFIG_PATH};
use frame_pacer::hot_reload::ConfigWatcher;
use frame_pacer::FrameOrchestrator;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    // Initialize logging
    init_logging(&config);
    log::info!("Starting frame pacer");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!(
        "Present mode: {}, {} frames in flight",
        config.graphics.present_mode,
        config.graphics.max_frames_in_flight
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Initialize logging, optionally into a log file with a session header
fn init_logging(config: &Config) {
    use env_logger::{Builder, Target};
    use log::LevelFilter;

    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Info);
    builder.parse_default_env();

    if config.debug.log_to_file {
        match OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "=== Frame Pacer Log ===");
                let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
                let _ = writeln!(file);
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Cannot open log file {}: {}", config.debug.log_file, e),
        }
    }

    builder.init();
}

// =============================================================================
// WINDOW SURFACE
// =============================================================================

/// The winit window as seen by the frame loop
struct WindowSurface {
    window: Arc<Window>,
    resize_requested: bool,
    poll_interval: Duration,
}

impl WindowSurface {
    fn new(window: Arc<Window>, poll_interval: Duration) -> Self {
        Self {
            window,
            resize_requested: false,
            poll_interval,
        }
    }

    fn request_resize(&mut self) {
        self.resize_requested = true;
    }
}

impl SurfaceProvider for WindowSurface {
    fn drawable_size(&self) -> vk::Extent2D {
        let size = self.window.inner_size();
        vk::Extent2D {
            width: size.width,
            height: size.height,
        }
    }

    fn take_resize_request(&mut self) -> bool {
        std::mem::take(&mut self.resize_requested)
    }

    fn wait_events(&mut self) {
        // Runs inside a winit callback, so no events are pumped here. Relies
        // on inner_size() and the surface extent being live queries, as on
        // X11 and Win32. Frames are already skipped while Resized reports a
        // zero size, so this only waits out a minimize that lands mid-rebuild.
        std::thread::sleep(self.poll_interval);
    }
}

// =============================================================================
// COMMAND RECORDING
// =============================================================================

/// Records a render pass that only clears the image.
///
/// Static content, so each command buffer is recorded once per chain
/// generation and resubmitted every frame.
struct ClearColorRecorder {
    device: Arc<VulkanDevice>,
    clear_color: vk::ClearColorValue,
}

impl ClearColorRecorder {
    fn new(device: Arc<VulkanDevice>, clear_color: vk::ClearColorValue) -> Self {
        Self { device, clear_color }
    }

    fn set_clear_color(&mut self, clear_color: vk::ClearColorValue) {
        self.clear_color = clear_color;
    }
}

impl CommandRecorder for ClearColorRecorder {
    fn record_frame(&mut self, command_buffer: vk::CommandBuffer, target: &FrameTarget) -> Result<()> {
        let device = &self.device.device;
        let clear_values = [vk::ClearValue {
            color: self.clear_color,
        }];
        let render_pass_begin = vk::RenderPassBeginInfo::default()
            .render_pass(target.render_pass)
            .framebuffer(target.framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: target.extent,
            })
            .clear_values(&clear_values);

        // The render pass clears on load and transitions to PRESENT_SRC
        unsafe {
            device.cmd_begin_render_pass(command_buffer, &render_pass_begin, vk::SubpassContents::INLINE);
            device.cmd_end_render_pass(command_buffer);
        }
        Ok(())
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

type Orchestrator = FrameOrchestrator<VulkanDevice, WindowSurface, ClearColorRecorder>;

/// IMPORTANT: Field order matters for Drop! The frame loop goes before the
/// device, the device before the window its surface belongs to.
struct App {
    orchestrator: Option<Orchestrator>,
    device: Option<Arc<VulkanDevice>>,
    window: Option<Arc<Window>>,

    config: Config,
    config_watcher: Option<ConfigWatcher>,
    is_fullscreen: bool,
    /// Set when the window is minimized (size = 0) - skip rendering
    is_minimized: bool,

    // FPS tracking
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let now = Instant::now();
        Self {
            orchestrator: None,
            device: None,
            window: None,
            config,
            config_watcher: None,
            is_fullscreen,
            is_minimized: false,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    fn init_vulkan(&mut self, window: Arc<Window>) -> Result<()> {
        log::info!("Initializing Vulkan...");

        // Enable validation layers based on config (and debug build)
        let enable_validation = cfg!(debug_assertions) && self.config.debug.validation_layers;
        let device = VulkanDevice::new(&self.config.window.title, enable_validation, &window)?;
        self.device = Some(device.clone());

        let surface = WindowSurface::new(window, self.config.minimize_poll());
        let recorder = ClearColorRecorder::new(device.clone(), self.config.clear_color());
        let orchestrator =
            FrameOrchestrator::new(device, surface, recorder, self.config.frame_settings())
                .context("Failed to set up the frame loop")?;
        self.orchestrator = Some(orchestrator);

        if self.config.debug.hot_reload {
            match ConfigWatcher::new(DEFAULT_CONFIG_PATH) {
                Ok(watcher) => self.config_watcher = Some(watcher),
                Err(e) => log::warn!("Config hot reload disabled: {:#}", e),
            }
        }

        log::info!("Vulkan initialized successfully!");
        Ok(())
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    fn render_frame(&mut self, event_loop: &ActiveEventLoop) {
        // Skip rendering if minimized
        if self.is_minimized {
            return;
        }
        self.apply_config_changes();

        let Some(orchestrator) = self.orchestrator.as_mut() else {
            return;
        };
        match orchestrator.render_frame() {
            Ok(report) => {
                if report.presented() {
                    self.update_fps();
                }
            }
            Err(e) => {
                log::error!("Fatal frame error: {}", e);
                self.shutdown();
                event_loop.exit();
            }
        }
    }

    /// Pick up clear color edits from config.toml; other settings need a restart
    fn apply_config_changes(&mut self) {
        let changed = self
            .config_watcher
            .as_ref()
            .map(|watcher| watcher.take_changed())
            .unwrap_or(false);
        if !changed {
            return;
        }

        let config = match Config::load_from_path(DEFAULT_CONFIG_PATH) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Ignoring config change: {:#}", e);
                return;
            }
        };
        if config.graphics.clear_color == self.config.graphics.clear_color {
            log::info!("Config changed; only clear_color is applied without a restart");
            return;
        }

        log::info!("Clear color changed to {:?}", config.graphics.clear_color);
        if let Some(orchestrator) = self.orchestrator.as_mut() {
            orchestrator.recorder_mut().set_clear_color(config.clear_color());
            orchestrator.request_rerecord();
        }
        self.config.graphics.clear_color = config.graphics.clear_color;
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                // Enter fullscreen (use current monitor)
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }

            if let Some(orchestrator) = self.orchestrator.as_mut() {
                orchestrator.surface_mut().request_resize();
            }
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;

            if let (Some(window), Some(orchestrator)) = (&self.window, &self.orchestrator) {
                let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
                let stats = orchestrator.stats();
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) [{}]",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                    mode
                ));
                log::debug!(
                    "Frames: {} submitted, {} presented, {} skipped, {} rebuilds",
                    stats.submitted,
                    stats.presented,
                    stats.skipped,
                    stats.rebuilds
                );
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }

    // =========================================================================
    // CLEANUP
    // =========================================================================

    /// Tear down the frame loop, then the device
    fn shutdown(&mut self) {
        if let Some(orchestrator) = self.orchestrator.take() {
            log::info!("Shutting down frame loop ({:?})", orchestrator.stats());
            if let Err(e) = orchestrator.shutdown() {
                log::error!("Frame loop shutdown failed: {}", e);
            }
        }
        self.config_watcher = None;
        self.device = None;
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        // Create window with settings from config
        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };
        self.window = Some(window.clone());

        if let Err(e) = self.init_vulkan(window) {
            log::error!("Failed to initialize Vulkan: {:?}", e);
            self.shutdown();
            event_loop.exit();
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.shutdown();
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);

                self.is_minimized = size.width == 0 || size.height == 0;
                if !self.is_minimized {
                    if let Some(orchestrator) = self.orchestrator.as_mut() {
                        orchestrator.surface_mut().request_resize();
                    }
                }
            }

            WindowEvent::RedrawRequested => self.render_frame(event_loop),

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                self.shutdown();
                                event_loop.exit();
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        self.shutdown();
        log::info!("Cleanup complete");
    }
}
