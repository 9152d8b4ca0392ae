//! Vulkan Device - logical device, queues, and resource factories.

use ash::vk;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::{Arc, OnceLock, Weak};

use crate::buffer::{Buffer, BufferDesc};
use crate::core::{PhysicalDevice, RhiCore};
use crate::defer_release::CleanupFn;
use crate::descriptor::{DescriptorSetLayout, LayoutBinding, PipelineLayout};
use crate::error::RhiError;
use crate::image::{Image, ImageDesc, ImageUsage, ImageView, ImageViewDesc, SubresourceRange};
use crate::pipeline::{GraphicPipelineDesc, Pipeline};
use crate::queue::{CommandQueue, QueueType, NUM_FRAMES};
use crate::render_pass::{RenderPass, RenderPassDesc};
use crate::ring_buffer::{HugeConstantBuffer, HUGE_CONSTANT_BUFFER_SIZE};
use crate::sampler::{Sampler, SamplerConfig};
use crate::shader::{ShaderError, ShaderModule, ShaderStage};
use crate::context::{BufferImageCopyRegion, ImageBlitRegion, SubresourceLayers};
use crate::utility::{full_mip_chain_levels, is_power_of_two};

/// Get required device extensions.
fn get_required_device_extensions() -> Vec<*const i8> {
    vec![ash::khr::swapchain::NAME.as_ptr()]
}

/// Vulkan logical device with one queue per queue type.
pub struct RenderDevice {
    physical_device: PhysicalDevice,
    device: ash::Device,
    queues: [vk::Queue; 3],

    pipeline_cache: vk::PipelineCache,
    huge_constant_buffer: OnceLock<HugeConstantBuffer>,

    /// Device-level cleanup funnel; swept into the submitting frame's
    /// slot at submit time.
    post_frame_cleanup: Mutex<Vec<CleanupFn>>,

    default_render_queue: Mutex<Weak<CommandQueue>>,
    default_copy_queue: Mutex<Weak<CommandQueue>>,
}

impl RenderDevice {
    /// Create a logical device on the selected physical device.
    ///
    /// `pipeline_cache_blob` is the previously persisted cache contents,
    /// when the host has one.
    pub fn new(
        core: &RhiCore,
        physical_device: &PhysicalDevice,
        pipeline_cache_blob: Option<&[u8]>,
    ) -> Result<Arc<Self>, RhiError> {
        let unique_families: HashSet<u32> =
            physical_device.queue_families().iter().copied().collect();

        let queue_priority = 1.0f32;
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(std::slice::from_ref(&queue_priority))
            })
            .collect();

        let extensions = get_required_device_extensions();
        let features = vk::PhysicalDeviceFeatures::default();
        let mut vulkan_13_features =
            vk::PhysicalDeviceVulkan13Features::default().synchronization2(true);

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features)
            .push_next(&mut vulkan_13_features);

        let device = unsafe {
            core.instance()
                .create_device(physical_device.handle(), &create_info, None)?
        };

        let families = physical_device.queue_families();
        let queues = [
            unsafe { device.get_device_queue(families[0], 0) },
            unsafe { device.get_device_queue(families[1], 0) },
            unsafe { device.get_device_queue(families[2], 0) },
        ];

        let cache_info = vk::PipelineCacheCreateInfo::default()
            .initial_data(pipeline_cache_blob.unwrap_or(&[]));
        let pipeline_cache = unsafe { device.create_pipeline_cache(&cache_info, None)? };

        let render_device = Arc::new(Self {
            physical_device: physical_device.clone(),
            device,
            queues,
            pipeline_cache,
            huge_constant_buffer: OnceLock::new(),
            post_frame_cleanup: Mutex::new(Vec::new()),
            default_render_queue: Mutex::new(Weak::new()),
            default_copy_queue: Mutex::new(Weak::new()),
        });

        let ring = HugeConstantBuffer::new(
            &render_device,
            HUGE_CONSTANT_BUFFER_SIZE,
            NUM_FRAMES as u64,
            render_device.min_uniform_offset_alignment(),
        )?;
        let _ = render_device.huge_constant_buffer.set(ring);

        Ok(render_device)
    }

    /// Get a reference to the logical device.
    pub fn handle(&self) -> &ash::Device {
        &self.device
    }

    pub fn physical_device_handle(&self) -> vk::PhysicalDevice {
        self.physical_device.handle()
    }

    /// Get the physical device properties.
    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        self.physical_device.properties()
    }

    /// Get the physical device memory properties.
    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        self.physical_device.memory_properties()
    }

    pub fn min_uniform_offset_alignment(&self) -> u64 {
        self.physical_device
            .properties()
            .limits
            .min_uniform_buffer_offset_alignment
    }

    pub fn queue_family(&self, queue_type: QueueType) -> u32 {
        self.physical_device.queue_families()[queue_type_index(queue_type)]
    }

    pub(crate) fn vk_queue(&self, queue_type: QueueType) -> vk::Queue {
        self.queues[queue_type_index(queue_type)]
    }

    /// Whether transfers run on a family of their own.
    pub fn is_transfer_queue_separate(&self) -> bool {
        self.queue_family(QueueType::Copy) != self.queue_family(QueueType::Render)
    }

    pub(crate) fn concurrent_queue_families(&self) -> Vec<u32> {
        if self.is_transfer_queue_separate() {
            let mut families = self.physical_device.queue_families().to_vec();
            families.sort_unstable();
            families.dedup();
            families
        } else {
            Vec::new()
        }
    }

    /// The shared render queue, created on first use.
    pub fn render_queue(self: &Arc<Self>) -> Result<Arc<CommandQueue>, RhiError> {
        cached_queue(&self.default_render_queue, self, QueueType::Render)
    }

    /// The shared copy queue; aliases the render queue when no separate
    /// transfer family exists.
    pub fn copy_queue(self: &Arc<Self>) -> Result<Arc<CommandQueue>, RhiError> {
        if !self.is_transfer_queue_separate() {
            return self.render_queue();
        }
        cached_queue(&self.default_copy_queue, self, QueueType::Copy)
    }

    /// Create a dedicated queue of the given type.
    pub fn create_command_queue(
        self: &Arc<Self>,
        queue_type: QueueType,
    ) -> Result<Arc<CommandQueue>, RhiError> {
        CommandQueue::new(self.clone(), queue_type)
    }

    pub fn huge_constant_buffer(&self) -> &HugeConstantBuffer {
        self.huge_constant_buffer
            .get()
            .expect("huge constant buffer initialized at device creation")
    }

    pub fn pipeline_cache(&self) -> vk::PipelineCache {
        self.pipeline_cache
    }

    /// The pipeline cache contents, for the host to persist across runs.
    pub fn pipeline_cache_data(&self) -> Result<Vec<u8>, vk::Result> {
        unsafe { self.device.get_pipeline_cache_data(self.pipeline_cache) }
    }

    /// Register a callable that runs once the next submitted frame's
    /// fence signals.
    pub fn add_post_frame_cleanup(&self, callback: CleanupFn) {
        self.post_frame_cleanup.lock().push(callback);
    }

    pub(crate) fn sweep_post_frame_cleanup(&self) -> Vec<CleanupFn> {
        std::mem::take(&mut *self.post_frame_cleanup.lock())
    }

    pub fn wait_idle(&self) -> Result<(), vk::Result> {
        unsafe { self.device.device_wait_idle() }
    }

    // -- Resource factories --------------------------------------------------

    /// Create a buffer, optionally filled with initial contents.
    pub fn create_buffer(
        self: &Arc<Self>,
        desc: &BufferDesc,
        initial_data: Option<&[u8]>,
    ) -> Result<Arc<Buffer>, RhiError> {
        let buffer = Arc::new(Buffer::new(self, desc)?);
        let Some(data) = initial_data else {
            return Ok(buffer);
        };

        if buffer.is_mapped() {
            buffer.write_at(0, data)?;
            return Ok(buffer);
        }

        // Device-local: stage and copy on the copy queue.
        let staging = Arc::new(Buffer::new(
            self,
            &BufferDesc::staging(data.len() as vk::DeviceSize)
                .with_name(format!("{}.staging", desc.name)),
        )?);
        staging.write_at(0, data)?;

        let queue = self.copy_queue()?;
        let list = queue.create_command_list();
        list.enqueue();
        let mut ctx = list.create_copy_context()?;
        let region = vk::BufferCopy::default().size(data.len() as vk::DeviceSize);
        ctx.copy_buffer(&staging, &buffer, std::slice::from_ref(&region));
        ctx.finish_recording()?;
        list.commit();
        queue.flush()?;

        self.add_post_frame_cleanup(Box::new(move |_| drop(staging)));
        Ok(buffer)
    }

    pub fn create_image_1d(
        self: &Arc<Self>,
        format: vk::Format,
        usage: impl Into<enumflags2::BitFlags<ImageUsage>>,
        width: u32,
        mip_levels: u32,
        array_layers: u32,
        initial_data: Option<&[u8]>,
    ) -> Result<Arc<Image>, RhiError> {
        let usage = usage.into();
        let mut desc = ImageDesc::new_1d(width, format, usage)
            .with_mip_levels(mip_levels)
            .with_array_layers(array_layers);
        if usage.contains(ImageUsage::GenMipMaps) {
            if !is_power_of_two(width) {
                return Err(RhiError::MipSizeNotPowerOfTwo {
                    width,
                    height: 1,
                    depth: 1,
                });
            }
            desc.mip_levels = full_mip_chain_levels(width);
        }
        self.internal_create_image(desc, initial_data)
    }

    pub fn create_image_2d(
        self: &Arc<Self>,
        format: vk::Format,
        usage: impl Into<enumflags2::BitFlags<ImageUsage>>,
        width: u32,
        height: u32,
        mip_levels: u32,
        array_layers: u32,
        samples: u32,
        initial_data: Option<&[u8]>,
    ) -> Result<Arc<Image>, RhiError> {
        let usage = usage.into();
        let mut desc = ImageDesc::new_2d(width, height, format, usage)
            .with_mip_levels(mip_levels)
            .with_array_layers(array_layers)
            .with_samples(samples);
        if usage.contains(ImageUsage::GenMipMaps) {
            if !is_power_of_two(width) || !is_power_of_two(height) {
                return Err(RhiError::MipSizeNotPowerOfTwo {
                    width,
                    height,
                    depth: 1,
                });
            }
            desc.mip_levels = full_mip_chain_levels(width.min(height));
        }
        self.internal_create_image(desc, initial_data)
    }

    pub fn create_image_3d(
        self: &Arc<Self>,
        format: vk::Format,
        usage: impl Into<enumflags2::BitFlags<ImageUsage>>,
        width: u32,
        height: u32,
        depth: u32,
        mip_levels: u32,
        initial_data: Option<&[u8]>,
    ) -> Result<Arc<Image>, RhiError> {
        let usage = usage.into();
        let mut desc = ImageDesc::new_3d(width, height, depth, format, usage)
            .with_mip_levels(mip_levels);
        if usage.contains(ImageUsage::GenMipMaps) {
            if !is_power_of_two(width) || !is_power_of_two(height) || !is_power_of_two(depth) {
                return Err(RhiError::MipSizeNotPowerOfTwo {
                    width,
                    height,
                    depth,
                });
            }
            desc.mip_levels = full_mip_chain_levels(width.min(height).min(depth));
        }
        self.internal_create_image(desc, initial_data)
    }

    /// Create the image, upload initial contents through a staging buffer
    /// on the copy queue, generate the mip chain if requested, and leave
    /// every subresource in the image's default state.
    #[profiling::function]
    fn internal_create_image(
        self: &Arc<Self>,
        desc: ImageDesc,
        initial_data: Option<&[u8]>,
    ) -> Result<Arc<Image>, RhiError> {
        let concurrent_families = self.concurrent_queue_families();
        let image = Arc::new(Image::new(self, &desc, &concurrent_families)?);

        // Stage the initial contents up front; everything fallible happens
        // before a recording context opens.
        let staging = match initial_data {
            None => None,
            Some(data) => {
                let texel_size = format_texel_size(desc.format).ok_or_else(|| {
                    RhiError::CreationFailed(format!(
                        "cannot upload initial data for format {:?}",
                        desc.format
                    ))
                })?;
                let upload_size = texel_size
                    * desc.extent.width as u64
                    * desc.extent.height as u64
                    * desc.extent.depth as u64;
                if (data.len() as u64) < upload_size {
                    return Err(RhiError::CreationFailed(format!(
                        "initial data holds {} bytes, image needs {}",
                        data.len(),
                        upload_size
                    )));
                }

                let staging = Arc::new(Buffer::new(
                    self,
                    &BufferDesc::staging(upload_size).with_name(format!("{}.staging", desc.name)),
                )?);
                staging.write_at(0, &data[..upload_size as usize])?;
                Some(staging)
            }
        };

        // A dedicated transfer queue cannot perform the final transition
        // into a non-transfer state; such uploads run on the render queue.
        let queue = if image.default_state().is_transfer_compatible() {
            self.copy_queue()?
        } else {
            self.render_queue()?
        };
        let list = queue.create_command_list();
        list.enqueue();
        let mut ctx = list.create_copy_context()?;

        if let Some(staging) = staging {
            ctx.copy_buffer_to_image(
                &staging,
                &image,
                &[BufferImageCopyRegion {
                    image_subresource: SubresourceLayers::default(),
                    image_extent: desc.extent,
                    ..Default::default()
                }],
            );

            if desc.usage.contains(ImageUsage::GenMipMaps) {
                let mut src_width = desc.extent.width;
                let mut src_height = desc.extent.height;
                let mut src_depth = desc.extent.depth;
                for dst_mip in 1..desc.mip_levels {
                    let src_extent = vk::Offset3D {
                        x: src_width as i32,
                        y: src_height as i32,
                        z: src_depth as i32,
                    };
                    src_width = (src_width / 2).max(1);
                    src_height = (src_height / 2).max(1);
                    src_depth = (src_depth / 2).max(1);
                    let dst_extent = vk::Offset3D {
                        x: src_width as i32,
                        y: src_height as i32,
                        z: src_depth as i32,
                    };

                    ctx.transition_image_range(
                        &image,
                        SubresourceRange::new(dst_mip - 1, 1, 0, desc.array_layers),
                        crate::ResourceState::CopySource,
                    );
                    ctx.transition_image_range(
                        &image,
                        SubresourceRange::new(dst_mip, 1, 0, desc.array_layers),
                        crate::ResourceState::CopyDest,
                    );
                    ctx.blit_image(
                        &image,
                        &image,
                        &[ImageBlitRegion {
                            src_subresource: SubresourceLayers {
                                mip_level: dst_mip - 1,
                                base_layer: 0,
                                layer_count: desc.array_layers,
                            },
                            src_offsets: [vk::Offset3D::default(), src_extent],
                            dst_subresource: SubresourceLayers {
                                mip_level: dst_mip,
                                base_layer: 0,
                                layer_count: desc.array_layers,
                            },
                            dst_offsets: [vk::Offset3D::default(), dst_extent],
                        }],
                        vk::Filter::LINEAR,
                    );
                }
            }

            // The staging buffer must survive until the copy's frame
            // retires.
            self.add_post_frame_cleanup(Box::new(move |_| drop(staging)));
        }

        ctx.transition_image(&image, image.default_state());
        ctx.finish_recording()?;
        list.commit();
        queue.flush()?;

        // Upload-once sampled images never change state again; skip the
        // per-draw tracking noise.
        if desc.usage == ImageUsage::Sampled {
            image.set_tracking_disabled(true);
        }

        Ok(image)
    }

    pub fn create_image_view(
        &self,
        image: &Arc<Image>,
        desc: &ImageViewDesc,
    ) -> Result<Arc<ImageView>, vk::Result> {
        Ok(Arc::new(ImageView::new(image.clone(), desc)?))
    }

    pub fn create_shader_module(
        self: &Arc<Self>,
        name: &str,
        spirv: &[u8],
        entry_point: &str,
        stage: ShaderStage,
    ) -> Result<Arc<ShaderModule>, ShaderError> {
        Ok(Arc::new(ShaderModule::from_spirv(
            name,
            self,
            spirv,
            entry_point,
            stage,
        )?))
    }

    pub fn create_sampler(&self, name: &str, config: &SamplerConfig) -> Result<Arc<Sampler>, vk::Result> {
        Ok(Arc::new(Sampler::new(name, &self.device, config)?))
    }

    pub fn create_descriptor_set_layout(
        &self,
        bindings: &[LayoutBinding],
    ) -> Result<Arc<DescriptorSetLayout>, vk::Result> {
        Ok(Arc::new(DescriptorSetLayout::new(&self.device, bindings)?))
    }

    pub fn create_pipeline_layout(
        &self,
        set_layouts: Vec<Arc<DescriptorSetLayout>>,
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<Arc<PipelineLayout>, vk::Result> {
        Ok(Arc::new(PipelineLayout::new(
            &self.device,
            set_layouts,
            push_constant_ranges,
        )?))
    }

    pub fn create_render_pass(
        self: &Arc<Self>,
        desc: RenderPassDesc,
    ) -> Result<Arc<RenderPass>, vk::Result> {
        Ok(Arc::new(RenderPass::new(self, desc)?))
    }

    pub fn create_graphics_pipeline(
        self: &Arc<Self>,
        desc: &GraphicPipelineDesc,
        layout: Arc<PipelineLayout>,
        render_pass: &RenderPass,
        subpass: u32,
    ) -> Result<Arc<Pipeline>, vk::Result> {
        Ok(Arc::new(Pipeline::new_graphics(
            self,
            desc,
            layout,
            render_pass,
            subpass,
        )?))
    }

    pub fn create_compute_pipeline(
        self: &Arc<Self>,
        shader: &ShaderModule,
        layout: Arc<PipelineLayout>,
    ) -> Result<Arc<Pipeline>, vk::Result> {
        Ok(Arc::new(Pipeline::new_compute(self, shader, layout)?))
    }
}

impl Drop for RenderDevice {
    fn drop(&mut self) {
        // Whatever never got swept must still run before the device dies.
        let mut leftovers = std::mem::take(&mut *self.post_frame_cleanup.lock());
        for callback in leftovers.drain(..) {
            let result =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(self)));
            if result.is_err() {
                log::error!("post-frame cleanup callback panicked during device teardown");
            }
        }

        unsafe {
            self.device.destroy_pipeline_cache(self.pipeline_cache, None);
        }
        // The ring buffer owns a vk::Buffer; it must die before the device.
        if let Some(ring) = self.huge_constant_buffer.take() {
            drop(ring);
        }
        unsafe {
            self.device.destroy_device(None);
        }
    }
}

fn queue_type_index(queue_type: QueueType) -> usize {
    match queue_type {
        QueueType::Render => 0,
        QueueType::Compute => 1,
        QueueType::Copy => 2,
    }
}

fn cached_queue(
    slot: &Mutex<Weak<CommandQueue>>,
    device: &Arc<RenderDevice>,
    queue_type: QueueType,
) -> Result<Arc<CommandQueue>, RhiError> {
    let mut weak = slot.lock();
    if let Some(queue) = weak.upgrade() {
        return Ok(queue);
    }
    let queue = CommandQueue::new(device.clone(), queue_type)?;
    *weak = Arc::downgrade(&queue);
    Ok(queue)
}

/// Bytes per texel for formats the initial-upload path understands.
fn format_texel_size(format: vk::Format) -> Option<u64> {
    match format {
        vk::Format::R8_UNORM | vk::Format::R8_SNORM | vk::Format::R8_UINT | vk::Format::R8_SINT => {
            Some(1)
        }
        vk::Format::R8G8_UNORM | vk::Format::R16_SFLOAT | vk::Format::R16_UINT | vk::Format::D16_UNORM => Some(2),
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::R8G8B8A8_UINT
        | vk::Format::R16G16_SFLOAT
        | vk::Format::R32_SFLOAT
        | vk::Format::R32_UINT
        | vk::Format::D32_SFLOAT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::A2B10G10R10_UNORM_PACK32 => Some(4),
        vk::Format::R16G16B16A16_SFLOAT | vk::Format::R32G32_SFLOAT => Some(8),
        vk::Format::R32G32B32A32_SFLOAT | vk::Format::R32G32B32A32_UINT => Some(16),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_texel_size() {
        assert_eq!(format_texel_size(vk::Format::R8G8B8A8_UNORM), Some(4));
        assert_eq!(format_texel_size(vk::Format::R16G16B16A16_SFLOAT), Some(8));
        assert_eq!(format_texel_size(vk::Format::R8_UNORM), Some(1));
        assert_eq!(format_texel_size(vk::Format::BC1_RGB_UNORM_BLOCK), None);
    }
}
