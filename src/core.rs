//! Vulkan Core - instance lifecycle and physical device selection.

use ash::{vk, Entry, Instance};
use std::ffi::{CStr, CString};
use anyhow::anyhow;

use crate::device::RenderDevice;
use crate::error::RhiError;

/// Validation layers to enable with the `validation` feature.
#[cfg(feature = "validation")]
const VALIDATION_LAYERS: &[&str] = &["VK_LAYER_KHRONOS_validation"];

/// Physical device selection hints.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceCreateHints {
    /// Prefer the adapter with the most device-local memory.
    NoHint,
    Integrated,
    Discrete,
}

/// A selected adapter with its resolved queue families
/// (render, compute, copy).
#[derive(Clone)]
pub struct PhysicalDevice {
    handle: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    queue_families: [u32; 3],
}

impl PhysicalDevice {
    pub fn handle(&self) -> vk::PhysicalDevice {
        self.handle
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    /// Queue families indexed render, compute, copy.
    pub fn queue_families(&self) -> &[u32; 3] {
        &self.queue_families
    }
}

/// The process-scoped entry point for Vulkan initialization. Every other
/// object borrows it; dropping it tears the instance down.
pub struct RhiCore {
    entry: Entry,
    instance: Instance,

    #[cfg(feature = "validation")]
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
    #[cfg(feature = "validation")]
    debug_utils: Option<ash::ext::debug_utils::Instance>,
}

impl RhiCore {
    /// Load Vulkan and create the instance.
    pub fn new() -> Result<Self, anyhow::Error> {
        let entry = unsafe { Entry::load()? };
        let instance = create_instance(&entry)?;

        #[cfg(feature = "validation")]
        let (debug_utils, debug_messenger) = setup_debug_messenger(&entry, &instance)?;

        Ok(Self {
            entry,
            instance,
            #[cfg(feature = "validation")]
            debug_messenger,
            #[cfg(feature = "validation")]
            debug_utils,
        })
    }

    /// Get the entry point.
    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    /// Get a reference to the Vulkan instance.
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// Pick a physical device according to the hints.
    pub fn select_physical_device(
        &self,
        hints: DeviceCreateHints,
    ) -> Result<PhysicalDevice, anyhow::Error> {
        let physical_devices = unsafe { self.instance.enumerate_physical_devices()? };
        if physical_devices.is_empty() {
            return Err(anyhow!("No Vulkan-capable GPU found"));
        }

        let mut best: Option<PhysicalDevice> = None;
        let mut best_memory = 0u64;

        for device in physical_devices {
            let properties = unsafe { self.instance.get_physical_device_properties(device) };
            let memory_properties =
                unsafe { self.instance.get_physical_device_memory_properties(device) };

            let Some(queue_families) = find_queue_families(&self.instance, device) else {
                continue;
            };

            let device_memory: u64 = memory_properties.memory_heaps
                [..memory_properties.memory_heap_count as usize]
                .iter()
                .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
                .map(|heap| heap.size)
                .sum();

            let device_name =
                unsafe { CStr::from_ptr(properties.device_name.as_ptr()).to_string_lossy() }
                    .into_owned();
            log::info!(
                "Found GPU: {} ({:?}, {} MiB local)",
                device_name,
                properties.device_type,
                device_memory / (1024 * 1024)
            );

            let candidate = PhysicalDevice {
                handle: device,
                properties,
                memory_properties,
                queue_families,
            };

            match hints {
                DeviceCreateHints::NoHint => {
                    if best.is_none() || device_memory > best_memory {
                        best = Some(candidate);
                        best_memory = device_memory;
                    }
                }
                DeviceCreateHints::Integrated => {
                    if properties.device_type == vk::PhysicalDeviceType::INTEGRATED_GPU {
                        best = Some(candidate);
                        best_memory = device_memory;
                    }
                }
                DeviceCreateHints::Discrete => {
                    if properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
                        best = Some(candidate);
                        best_memory = device_memory;
                    }
                }
            }
        }

        best.ok_or_else(|| anyhow!("No GPU matched the device hints {:?}", hints))
    }

    /// Select a device and create the logical device on it.
    pub fn create_render_device(
        &self,
        hints: DeviceCreateHints,
        pipeline_cache_blob: Option<&[u8]>,
    ) -> Result<std::sync::Arc<RenderDevice>, anyhow::Error> {
        let physical_device = self.select_physical_device(hints)?;
        let device_name = unsafe {
            CStr::from_ptr(physical_device.properties.device_name.as_ptr()).to_string_lossy()
        }
        .into_owned();
        log::info!("Creating render device on {}", device_name);

        RenderDevice::new(self, &physical_device, pipeline_cache_blob).map_err(|e| match e {
            RhiError::Vulkan(v) => anyhow!("device creation failed: {:?}", v),
            other => anyhow!("device creation failed: {}", other),
        })
    }
}

impl Drop for RhiCore {
    fn drop(&mut self) {
        unsafe {
            #[cfg(feature = "validation")]
            if let (Some(debug_utils), Some(messenger)) = (&self.debug_utils, self.debug_messenger)
            {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

/// Resolve the (render, compute, copy) queue families.
///
/// Dedicated compute and transfer families are preferred; both fall back
/// to the graphics family.
fn find_queue_families(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
) -> Option<[u32; 3]> {
    let queue_families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    let mut graphics = None;
    let mut dedicated_compute = None;
    let mut dedicated_transfer = None;

    for (index, family) in queue_families.iter().enumerate() {
        let index = index as u32;
        let flags = family.queue_flags;

        if graphics.is_none() && flags.contains(vk::QueueFlags::GRAPHICS) {
            graphics = Some(index);
        }
        if dedicated_compute.is_none()
            && flags.contains(vk::QueueFlags::COMPUTE)
            && !flags.contains(vk::QueueFlags::GRAPHICS)
        {
            dedicated_compute = Some(index);
        }
        if dedicated_transfer.is_none()
            && flags.contains(vk::QueueFlags::TRANSFER)
            && !flags.contains(vk::QueueFlags::GRAPHICS)
            && !flags.contains(vk::QueueFlags::COMPUTE)
        {
            dedicated_transfer = Some(index);
        }
    }

    let graphics = graphics?;
    Some([
        graphics,
        dedicated_compute.unwrap_or(graphics),
        dedicated_transfer.unwrap_or(graphics),
    ])
}

/// Get required instance extensions based on platform.
fn get_required_instance_extensions() -> Vec<*const i8> {
    #[allow(unused_mut)]
    let mut extensions = vec![ash::khr::surface::NAME.as_ptr()];

    #[cfg(target_os = "windows")]
    extensions.push(ash::khr::win32_surface::NAME.as_ptr());

    #[cfg(target_os = "linux")]
    {
        extensions.push(ash::khr::xcb_surface::NAME.as_ptr());
        extensions.push(ash::khr::xlib_surface::NAME.as_ptr());
        extensions.push(ash::khr::wayland_surface::NAME.as_ptr());
    }

    #[cfg(target_os = "macos")]
    extensions.push(ash::ext::metal_surface::NAME.as_ptr());

    #[cfg(feature = "validation")]
    extensions.push(ash::ext::debug_utils::NAME.as_ptr());

    extensions
}

/// Create Vulkan instance with required extensions and validation layers.
fn create_instance(entry: &Entry) -> Result<Instance, vk::Result> {
    let app_name = CString::new("Ember").unwrap();

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 1, 0, 0))
        .engine_name(&app_name)
        .engine_version(vk::make_api_version(0, 1, 0, 0))
        .api_version(vk::API_VERSION_1_3);

    let extensions = get_required_instance_extensions();

    #[cfg(feature = "validation")]
    let layer_names: Vec<CString> = VALIDATION_LAYERS
        .iter()
        .map(|&s| CString::new(s).unwrap())
        .collect();

    #[cfg(feature = "validation")]
    let layer_pointers: Vec<*const i8> = layer_names.iter().map(|s| s.as_ptr()).collect();

    #[allow(unused_mut)]
    let mut create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extensions);

    #[cfg(feature = "validation")]
    {
        create_info = create_info.enabled_layer_names(&layer_pointers);
    }

    unsafe { entry.create_instance(&create_info, None) }
}

/// Setup debug messenger for validation layers.
#[cfg(feature = "validation")]
fn setup_debug_messenger(
    entry: &Entry,
    instance: &Instance,
) -> Result<
    (
        Option<ash::ext::debug_utils::Instance>,
        Option<vk::DebugUtilsMessengerEXT>,
    ),
    vk::Result,
> {
    let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(vulkan_debug_callback));

    let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None)? };

    Ok((Some(debug_utils), Some(messenger)))
}

/// Vulkan debug callback function.
#[cfg(feature = "validation")]
unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let callback_data = unsafe { *p_callback_data };
    let message = unsafe { CStr::from_ptr(callback_data.p_message) }.to_string_lossy();

    let type_str = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "[General]",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "[Validation]",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "[Performance]",
        _ => "[Unknown]",
    };

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("Vulkan {}: {}", type_str, message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("Vulkan {}: {}", type_str, message);
        }
        _ => {
            log::debug!("Vulkan {}: {}", type_str, message);
        }
    }

    vk::FALSE
}
