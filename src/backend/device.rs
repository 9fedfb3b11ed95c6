// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Window surface creation
// - Physical device selection (prefer discrete GPU that can present)
// - Logical device, graphics/present queues, command pool

use super::context::QueueFamilies;
use anyhow::{Context, Result};
use ash::{vk, Entry};
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::ffi::{CStr, CString};
use std::sync::Arc;
use winit::window::Window;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    _entry: Entry,
    pub instance: ash::Instance,
    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,

    pub(crate) surface_loader: ash::khr::surface::Instance,
    pub surface: vk::SurfaceKHR,

    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    pub(crate) swapchain_loader: ash::khr::swapchain::Device,

    // Queue handles
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub queue_families: QueueFamilies,

    /// Pool for the per-image command buffers. Allocation and freeing need
    /// external synchronization.
    pub(crate) command_pool: Mutex<vk::CommandPool>,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,
}

impl VulkanDevice {
    /// Create Vulkan device presenting to `window`
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging
    /// * `enable_validation` - Enable Vulkan validation layers (debug only)
    pub fn new(app_name: &str, enable_validation: bool, window: &Window) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);

        let display_handle = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let window_handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        // Step 2: Create instance with the platform's surface extensions
        let surface_extensions = ash_window::enumerate_required_extensions(display_handle)
            .context("Windowing system has no Vulkan surface support")?;
        let instance = Self::create_instance(&entry, app_name, enable_validation, surface_extensions)?;

        // Everything created from here on is destroyed again if a later step fails
        let mut unwind = Unwind::default();
        {
            let instance = instance.clone();
            unwind.push(move || unsafe { instance.destroy_instance(None) });
        }

        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if enable_validation {
            let (debug_utils, messenger) = Self::setup_debug_messenger(&entry, &instance)?;
            {
                let debug_utils = debug_utils.clone();
                unwind.push(move || unsafe {
                    debug_utils.destroy_debug_utils_messenger(messenger, None)
                });
            }
            Some((debug_utils, messenger))
        } else {
            None
        };

        // Step 4: Surface (platform-specific window connection)
        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);
        let surface = unsafe {
            ash_window::create_surface(&entry, &instance, display_handle, window_handle, None)
        }
        .context("Failed to create window surface")?;
        {
            let surface_loader = surface_loader.clone();
            unwind.push(move || unsafe { surface_loader.destroy_surface(surface, None) });
        }

        // Step 5: Pick physical device (GPU) that can present to the surface
        let (physical_device, queue_families) =
            Self::pick_physical_device(&instance, &surface_loader, surface)?;

        // Step 6: Create logical device
        let device = Self::create_logical_device(&instance, physical_device, queue_families)?;
        {
            let device = device.clone();
            unwind.push(move || unsafe { device.destroy_device(None) });
        }
        let graphics_queue = unsafe { device.get_device_queue(queue_families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(queue_families.present, 0) };
        let swapchain_loader = ash::khr::swapchain::Device::new(&instance, &device);

        // Step 7: Command pool for pre-recorded command buffers
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_families.graphics)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        // From here on Drop for VulkanDevice owns every handle
        unwind.disarm();

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        log::info!(
            "Selected GPU: {}",
            properties
                .device_name_as_c_str()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::info!(
            "Queue families: graphics {}, present {}",
            queue_families.graphics,
            queue_families.present
        );

        Ok(Arc::new(Self {
            _entry: entry,
            instance,
            debug_utils,
            surface_loader,
            surface,
            physical_device,
            device,
            swapchain_loader,
            graphics_queue,
            present_queue,
            queue_families,
            command_pool: Mutex::new(command_pool),
            properties,
        }))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        surface_extensions: &[*const std::ffi::c_char],
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = c"frame-pacer";

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        let mut extensions = surface_extensions.to_vec();
        if enable_validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }

        // Validation layers
        let layer_names = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &ash::khr::surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> Result<(vk::PhysicalDevice, QueueFamilies)> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        // Score each device
        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            if !Self::supports_swapchain(instance, device)? {
                continue;
            }
            let families = match Self::find_queue_families(instance, surface_loader, surface, device)? {
                Some(families) => families,
                None => continue,
            };

            let props = unsafe { instance.get_physical_device_properties(device) };
            let mut score = match props.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                _ => 1,
            };
            // One family for both avoids concurrent sharing of swapchain images
            if families.is_shared() {
                score += 10;
            }

            if score > best_score {
                best_score = score;
                best_device = Some((device, families));
            }
        }

        best_device.ok_or_else(|| anyhow::anyhow!("No GPU can present to this window"))
    }

    fn supports_swapchain(instance: &ash::Instance, device: vk::PhysicalDevice) -> Result<bool> {
        let extensions = unsafe { instance.enumerate_device_extension_properties(device) }?;
        Ok(extensions
            .iter()
            .any(|ext| ext.extension_name_as_c_str() == Ok(ash::khr::swapchain::NAME)))
    }

    fn find_queue_families(
        instance: &ash::Instance,
        surface_loader: &ash::khr::surface::Instance,
        surface: vk::SurfaceKHR,
        device: vk::PhysicalDevice,
    ) -> Result<Option<QueueFamilies>> {
        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(device) };

        let mut graphics = None;
        let mut present = None;
        for (index, props) in queue_families.iter().enumerate() {
            let index = index as u32;
            let can_graphics = props.queue_flags.contains(vk::QueueFlags::GRAPHICS);
            let can_present = unsafe {
                surface_loader.get_physical_device_surface_support(device, index, surface)
            }?;

            if can_graphics && can_present {
                return Ok(Some(QueueFamilies {
                    graphics: index,
                    present: index,
                }));
            }
            if can_graphics && graphics.is_none() {
                graphics = Some(index);
            }
            if can_present && present.is_none() {
                present = Some(index);
            }
        }

        Ok(graphics
            .zip(present)
            .map(|(graphics, present)| QueueFamilies { graphics, present }))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        families: QueueFamilies,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0];
        let mut family_indices = vec![families.graphics];
        if !families.is_shared() {
            family_indices.push(families.present);
        }
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = family_indices
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
            })
            .collect();

        // Required device extensions
        let extensions = [ash::khr::swapchain::NAME.as_ptr()];

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        Ok(device)
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        // Wait for device to finish
        if let Err(e) = unsafe { self.device.device_wait_idle() } {
            log::warn!("Device wait idle failed during teardown: {}", e);
        }

        // Cleanup in reverse order
        unsafe {
            self.device.destroy_command_pool(*self.command_pool.get_mut(), None);
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

/// Cleanup steps for a constructor that creates several raw handles in a row.
///
/// Dropping it runs the steps newest first; `disarm` hands ownership to
/// whatever was built from the handles instead.
#[derive(Default)]
struct Unwind {
    steps: Vec<Box<dyn FnOnce()>>,
}

impl Unwind {
    fn push(&mut self, step: impl FnOnce() + 'static) {
        self.steps.push(Box::new(step));
    }

    fn disarm(&mut self) {
        self.steps.clear();
    }
}

impl Drop for Unwind {
    fn drop(&mut self) {
        if !self.steps.is_empty() {
            log::warn!("Vulkan setup failed, destroying {} partially created objects", self.steps.len());
        }
        while let Some(step) = self.steps.pop() {
            step();
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        std::borrow::Cow::from("")
    } else {
        CStr::from_ptr((*p_callback_data).p_message).to_string_lossy()
    };

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan {:?}] {}", message_type, message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan {:?}] {}", message_type, message);
        }
        _ => {
            log::debug!("[Vulkan {:?}] {}", message_type, message);
        }
    }

    vk::FALSE
}
