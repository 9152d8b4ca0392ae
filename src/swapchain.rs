//! Vulkan Swapchain - the presentation surface collaborator.
//!
//! The core consumes only what the swap chain produces: back-buffer
//! images, a fresh acquire semaphore per acquire (destroyed by post-frame
//! cleanup after the submission that waited on it), and a per-image
//! present semaphore the submission signals for present to wait on.

use ash::vk;
use parking_lot::Mutex;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::sync::Arc;

use crate::core::RhiCore;
use crate::error::RhiError;
use crate::image::Image;
use crate::queue::CommandQueue;
use crate::RenderDevice;

/// A presentation surface created from a platform descriptor, or adopted
/// from a pre-created Vulkan surface.
pub struct Surface {
    loader: ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
}

impl Surface {
    /// Create a surface from raw platform handles (Win32, macOS, xcb...).
    pub fn new(
        core: &RhiCore,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
    ) -> Result<Self, vk::Result> {
        let loader = ash::khr::surface::Instance::new(core.entry(), core.instance());
        let surface = unsafe {
            ash_window::create_surface(
                core.entry(),
                core.instance(),
                display_handle,
                window_handle,
                None,
            )?
        };
        Ok(Self { loader, surface })
    }

    /// Adopt an externally created surface.
    pub fn from_raw(core: &RhiCore, surface: vk::SurfaceKHR) -> Self {
        let loader = ash::khr::surface::Instance::new(core.entry(), core.instance());
        Self { loader, surface }
    }

    pub fn handle(&self) -> vk::SurfaceKHR {
        self.surface
    }

    pub(crate) fn loader(&self) -> &ash::khr::surface::Instance {
        &self.loader
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe {
            self.loader.destroy_surface(self.surface, None);
        }
    }
}

/// Swapchain configuration parameters.
pub struct SwapchainConfig {
    pub preferred_format: vk::Format,
    pub preferred_color_space: vk::ColorSpaceKHR,
    pub preferred_present_mode: vk::PresentModeKHR,
    pub num_back_buffers: u32,
    /// Fallback extent when the surface does not dictate one.
    pub extent: vk::Extent2D,
}

impl Default for SwapchainConfig {
    fn default() -> Self {
        Self {
            preferred_format: vk::Format::B8G8R8A8_SRGB,
            preferred_color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            preferred_present_mode: vk::PresentModeKHR::MAILBOX,
            num_back_buffers: 3,
            extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
        }
    }
}

/// One acquired back buffer with the semaphores attached to it.
pub(crate) struct AcquiredImage {
    pub index: u32,
    pub image: Arc<Image>,
    pub view: vk::ImageView,
    /// Fresh per acquire; the render-pass section waits on it and hands
    /// it to post-frame cleanup.
    pub acquire_semaphore: vk::Semaphore,
    /// Per-image, swapchain-owned; the section signals it, present waits.
    pub present_semaphore: vk::Semaphore,
}

/// Vulkan swapchain management.
pub struct Swapchain {
    device: ash::Device,
    surface: Surface,
    loader: ash::khr::swapchain::Device,
    swapchain: vk::SwapchainKHR,
    images: Vec<Arc<Image>>,
    views: Vec<vk::ImageView>,
    present_semaphores: Vec<vk::Semaphore>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    current_index: Mutex<u32>,
}

impl Swapchain {
    pub fn new(
        core: &RhiCore,
        device: &Arc<RenderDevice>,
        surface: Surface,
        config: SwapchainConfig,
    ) -> Result<Self, RhiError> {
        let physical_device = device.physical_device_handle();
        let capabilities = unsafe {
            surface
                .loader()
                .get_physical_device_surface_capabilities(physical_device, surface.handle())?
        };
        let formats = unsafe {
            surface
                .loader()
                .get_physical_device_surface_formats(physical_device, surface.handle())?
        };
        let present_modes = unsafe {
            surface
                .loader()
                .get_physical_device_surface_present_modes(physical_device, surface.handle())?
        };
        if formats.is_empty() || present_modes.is_empty() {
            return Err(RhiError::CreationFailed(
                "device is not suitable for presentation".into(),
            ));
        }

        let format = choose_surface_format(&formats, &config);
        let present_mode = choose_present_mode(&present_modes, &config);
        let extent = choose_extent(&capabilities, config.extent);

        let mut image_count = config.num_back_buffers.max(capabilities.min_image_count);
        if capabilities.max_image_count > 0 {
            image_count = image_count.min(capabilities.max_image_count);
        }

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.handle())
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        let loader = ash::khr::swapchain::Device::new(core.instance(), device.handle());
        let swapchain = unsafe { loader.create_swapchain(&create_info, None)? };

        let vk_images = unsafe { loader.get_swapchain_images(swapchain)? };
        let mut images = Vec::with_capacity(vk_images.len());
        let mut views = Vec::with_capacity(vk_images.len());
        let mut present_semaphores = Vec::with_capacity(vk_images.len());
        for (index, &vk_image) in vk_images.iter().enumerate() {
            let image = Image::from_swapchain_image(
                device.handle(),
                format!("swapchain.backbuffer.{index}"),
                vk_image,
                format.format,
                extent,
            );
            images.push(Arc::new(image));

            let view_info = vk::ImageViewCreateInfo::default()
                .image(vk_image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format.format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            views.push(unsafe { device.handle().create_image_view(&view_info, None)? });

            let semaphore_info = vk::SemaphoreCreateInfo::default();
            present_semaphores
                .push(unsafe { device.handle().create_semaphore(&semaphore_info, None)? });
        }

        log::info!(
            "swapchain created: {}x{} {:?} x{}",
            extent.width,
            extent.height,
            format.format,
            images.len()
        );

        Ok(Self {
            device: device.handle().clone(),
            surface,
            loader,
            swapchain,
            images,
            views,
            present_semaphores,
            format,
            extent,
            current_index: Mutex::new(0),
        })
    }

    pub fn format(&self) -> vk::Format {
        self.format.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn image(&self, index: u32) -> &Arc<Image> {
        &self.images[index as usize]
    }

    /// Acquire the next back buffer, producing the semaphore the consuming
    /// submission must wait on.
    pub(crate) fn acquire_next(&self) -> Result<AcquiredImage, vk::Result> {
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let acquire_semaphore = unsafe { self.device.create_semaphore(&semaphore_info, None)? };

        let (index, _suboptimal) = match unsafe {
            self.loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                acquire_semaphore,
                vk::Fence::null(),
            )
        } {
            Ok(ok) => ok,
            Err(e) => {
                unsafe { self.device.destroy_semaphore(acquire_semaphore, None) };
                return Err(e);
            }
        };
        *self.current_index.lock() = index;

        Ok(AcquiredImage {
            index,
            image: self.images[index as usize].clone(),
            view: self.views[index as usize],
            acquire_semaphore,
            present_semaphore: self.present_semaphores[index as usize],
        })
    }

    /// Present the most recently acquired image on the given queue.
    ///
    /// Returns `Ok(true)` when the swapchain is suboptimal and should be
    /// recreated at the caller's convenience.
    pub fn present(&self, queue: &Arc<CommandQueue>) -> Result<bool, RhiError> {
        let index = *self.current_index.lock();
        let wait_semaphores = [self.present_semaphores[index as usize]];
        let swapchains = [self.swapchain];
        let indices = [index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&indices);

        let suboptimal = unsafe { self.loader.queue_present(queue.handle(), &present_info)? };
        Ok(suboptimal)
    }

    pub fn surface(&self) -> &Surface {
        &self.surface
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            for &view in &self.views {
                self.device.destroy_image_view(view, None);
            }
            for &semaphore in &self.present_semaphores {
                self.device.destroy_semaphore(semaphore, None);
            }
            self.loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    config: &SwapchainConfig,
) -> vk::SurfaceFormatKHR {
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == config.preferred_format && f.color_space == config.preferred_color_space
        })
        .unwrap_or(formats[0])
}

fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    config: &SwapchainConfig,
) -> vk::PresentModeKHR {
    if modes.contains(&config.preferred_present_mode) {
        config.preferred_present_mode
    } else {
        // FIFO is the only mode the spec guarantees.
        vk::PresentModeKHR::FIFO
    }
}

fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    fallback: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: fallback.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: fallback.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}
