//! Vulkan Image - GPU image resource management.
//!
//! An image carries one device-global [`ResourceState`] per subresource
//! (mip level x array layer). Command lists read and update these slots
//! when they commit; everything between enqueue and retirement goes
//! through the access tracker instead.

use ash::vk;
use enumflags2::{bitflags, BitFlags};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::barrier::ResourceState;
use crate::utility::{find_memory_type, next_resource_id};

/// Declared image usages. The primary usage decides the image's default
/// state after creation.
#[bitflags]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageUsage {
    Sampled = 1 << 0,
    DepthStencil = 1 << 1,
    RenderTarget = 1 << 2,
    CubeMap = 1 << 3,
    GenMipMaps = 1 << 4,
    Staging = 1 << 5,
    Storage = 1 << 6,
}

/// An addressable slice of an image: mips x layers, one aspect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubresourceRange {
    pub base_mip: u32,
    pub level_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
}

impl SubresourceRange {
    pub fn new(base_mip: u32, level_count: u32, base_layer: u32, layer_count: u32) -> Self {
        Self {
            base_mip,
            level_count,
            base_layer,
            layer_count,
        }
    }

    /// The whole image.
    pub fn full(mip_levels: u32, array_layers: u32) -> Self {
        Self::new(0, mip_levels, 0, array_layers)
    }

    pub fn single(mip: u32, layer: u32) -> Self {
        Self::new(mip, 1, layer, 1)
    }
}

/// Image descriptor for creating GPU images.
#[derive(Debug, Clone)]
pub struct ImageDesc {
    pub name: String,
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: u32,
    pub usage: BitFlags<ImageUsage>,
}

impl ImageDesc {
    pub fn new_1d(width: u32, format: vk::Format, usage: impl Into<BitFlags<ImageUsage>>) -> Self {
        Self {
            name: String::new(),
            image_type: vk::ImageType::TYPE_1D,
            format,
            extent: vk::Extent3D { width, height: 1, depth: 1 },
            mip_levels: 1,
            array_layers: 1,
            samples: 1,
            usage: usage.into(),
        }
    }

    pub fn new_2d(
        width: u32,
        height: u32,
        format: vk::Format,
        usage: impl Into<BitFlags<ImageUsage>>,
    ) -> Self {
        Self {
            name: String::new(),
            image_type: vk::ImageType::TYPE_2D,
            format,
            extent: vk::Extent3D { width, height, depth: 1 },
            mip_levels: 1,
            array_layers: 1,
            samples: 1,
            usage: usage.into(),
        }
    }

    pub fn new_3d(
        width: u32,
        height: u32,
        depth: u32,
        format: vk::Format,
        usage: impl Into<BitFlags<ImageUsage>>,
    ) -> Self {
        Self {
            name: String::new(),
            image_type: vk::ImageType::TYPE_3D,
            format,
            extent: vk::Extent3D { width, height, depth },
            mip_levels: 1,
            array_layers: 1,
            samples: 1,
            usage: usage.into(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_mip_levels(mut self, levels: u32) -> Self {
        self.mip_levels = levels;
        self
    }

    pub fn with_array_layers(mut self, layers: u32) -> Self {
        self.array_layers = layers;
        self
    }

    pub fn with_samples(mut self, samples: u32) -> Self {
        self.samples = samples;
        self
    }

    /// Vulkan usage bits implied by the declared usage set.
    pub(crate) fn vk_usage(&self) -> vk::ImageUsageFlags {
        let mut out = vk::ImageUsageFlags::empty();
        if self.usage.contains(ImageUsage::Sampled) {
            out |= vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED;
        }
        if self.usage.contains(ImageUsage::Storage) {
            out |= vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST
                | vk::ImageUsageFlags::STORAGE;
        }
        if self.usage.contains(ImageUsage::RenderTarget) {
            out |= vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC;
        }
        if self.usage.contains(ImageUsage::DepthStencil) {
            out |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        }
        if self.usage.contains(ImageUsage::Staging) {
            out |= vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
        }
        if self.usage.contains(ImageUsage::GenMipMaps) {
            out |= vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
        }
        out
    }

    pub(crate) fn tiling(&self) -> vk::ImageTiling {
        if self.usage.contains(ImageUsage::Staging) {
            vk::ImageTiling::LINEAR
        } else {
            vk::ImageTiling::OPTIMAL
        }
    }

    pub(crate) fn memory_flags(&self) -> vk::MemoryPropertyFlags {
        if self.usage.contains(ImageUsage::Staging) {
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
        } else {
            vk::MemoryPropertyFlags::DEVICE_LOCAL
        }
    }
}

/// Infer the state an image settles into after its initial upload.
pub(crate) fn default_state_for_usage(usage: BitFlags<ImageUsage>) -> ResourceState {
    // Later entries take precedence over Sampled, matching the order the
    // usage bits contribute Vulkan flags.
    let mut state = ResourceState::General;
    if usage.contains(ImageUsage::Sampled) {
        state = ResourceState::ShaderResource;
    }
    if usage.contains(ImageUsage::Storage) {
        state = ResourceState::General;
    }
    if usage.contains(ImageUsage::RenderTarget) {
        state = ResourceState::RenderTarget;
    }
    if usage.contains(ImageUsage::DepthStencil) {
        state = ResourceState::DepthWrite;
    }
    if usage.contains(ImageUsage::Staging) {
        state = ResourceState::CopySource;
    }
    state
}

/// States reachable by an image with the given declared usage.
pub(crate) fn image_supports_state(
    usage: BitFlags<ImageUsage>,
    is_swapchain: bool,
    state: ResourceState,
) -> bool {
    match state {
        ResourceState::Undefined => true,
        ResourceState::General => usage.contains(ImageUsage::Storage),
        ResourceState::ShaderResource => usage.contains(ImageUsage::Sampled),
        ResourceState::RenderTarget => usage.contains(ImageUsage::RenderTarget) || is_swapchain,
        ResourceState::DepthWrite | ResourceState::DepthRead => {
            usage.contains(ImageUsage::DepthStencil)
        }
        ResourceState::CopySource => {
            usage.contains(ImageUsage::RenderTarget)
                || usage.contains(ImageUsage::Storage)
                || usage.contains(ImageUsage::Staging)
                || usage.contains(ImageUsage::GenMipMaps)
        }
        ResourceState::CopyDest => {
            usage.contains(ImageUsage::Sampled)
                || usage.contains(ImageUsage::Storage)
                || usage.contains(ImageUsage::Staging)
                || usage.contains(ImageUsage::GenMipMaps)
                || is_swapchain
        }
        ResourceState::Present => is_swapchain,
    }
}

/// The identity and metadata the access tracker needs, detached from the
/// owning [`Image`].
#[derive(Clone, Copy, Debug)]
pub struct ImageInfo {
    pub id: u64,
    pub handle: vk::Image,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub aspect: vk::ImageAspectFlags,
    pub usage: BitFlags<ImageUsage>,
    pub is_swapchain: bool,
    pub tracking_disabled: bool,
}

/// GPU image with memory allocation and per-subresource state slots.
pub struct Image {
    device: ash::Device,
    image: vk::Image,
    /// Null for swapchain images; the swapchain owns those.
    memory: vk::DeviceMemory,
    desc: ImageDesc,
    id: u64,
    default_state: ResourceState,
    tracking_disabled: AtomicBool,
    /// Indexed mip * array_layers + layer.
    states: Mutex<Vec<ResourceState>>,
}

impl Image {
    /// Create a new image from a descriptor. Content upload, mip chain
    /// generation and the transition into the default state are the
    /// device factory's job.
    pub fn new(
        device: &crate::RenderDevice,
        desc: &ImageDesc,
        concurrent_families: &[u32],
    ) -> Result<Self, vk::Result> {
        let memory_properties = device.memory_properties();
        let device = device.handle();

        let mut image_info = vk::ImageCreateInfo::default()
            .image_type(desc.image_type)
            .format(desc.format)
            .extent(desc.extent)
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(vk::SampleCountFlags::from_raw(desc.samples))
            .tiling(desc.tiling())
            .usage(desc.vk_usage())
            .initial_layout(vk::ImageLayout::UNDEFINED);
        if desc.usage.contains(ImageUsage::CubeMap) {
            image_info = image_info.flags(vk::ImageCreateFlags::CUBE_COMPATIBLE);
        }
        if concurrent_families.len() > 1 {
            image_info = image_info
                .sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(concurrent_families);
        } else {
            image_info = image_info.sharing_mode(vk::SharingMode::EXCLUSIVE);
        }

        let image = unsafe { device.create_image(&image_info, None)? };

        let mem_requirements = unsafe { device.get_image_memory_requirements(image) };
        let memory_type_index = find_memory_type(
            memory_properties,
            mem_requirements.memory_type_bits,
            desc.memory_flags(),
        )
        .ok_or(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)?;

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(mem_requirements.size)
            .memory_type_index(memory_type_index);

        let memory = unsafe { device.allocate_memory(&alloc_info, None)? };
        unsafe { device.bind_image_memory(image, memory, 0)? };

        let subresource_count = (desc.mip_levels * desc.array_layers) as usize;

        log::trace!("new image created: {}", desc.name);

        Ok(Self {
            device: device.clone(),
            image,
            memory,
            desc: desc.clone(),
            id: next_resource_id(),
            default_state: default_state_for_usage(desc.usage),
            tracking_disabled: AtomicBool::new(false),
            states: Mutex::new(vec![ResourceState::Undefined; subresource_count]),
        })
    }

    /// Wrap a swapchain image (does not own the image or memory).
    pub(crate) fn from_swapchain_image(
        device: &ash::Device,
        name: String,
        image: vk::Image,
        format: vk::Format,
        extent: vk::Extent2D,
    ) -> Self {
        let desc = ImageDesc {
            name,
            image_type: vk::ImageType::TYPE_2D,
            format,
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: 1,
            usage: ImageUsage::RenderTarget.into(),
        };
        Self {
            device: device.clone(),
            image,
            memory: vk::DeviceMemory::null(),
            desc,
            id: next_resource_id(),
            default_state: ResourceState::Present,
            tracking_disabled: AtomicBool::new(false),
            states: Mutex::new(vec![ResourceState::Undefined]),
        }
    }

    /// Get the raw Vulkan image handle.
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.desc.name
    }

    #[inline]
    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    pub fn format(&self) -> vk::Format {
        self.desc.format
    }

    pub fn extent(&self) -> vk::Extent3D {
        self.desc.extent
    }

    pub fn mip_levels(&self) -> u32 {
        self.desc.mip_levels
    }

    pub fn array_layers(&self) -> u32 {
        self.desc.array_layers
    }

    pub fn usage(&self) -> BitFlags<ImageUsage> {
        self.desc.usage
    }

    /// Aspect flags implied by the image format.
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        format_to_aspect_mask(self.desc.format)
    }

    /// The state the image settles into after creation.
    pub fn default_state(&self) -> ResourceState {
        self.default_state
    }

    pub fn is_swapchain_image(&self) -> bool {
        self.memory == vk::DeviceMemory::null()
    }

    /// Read-only-forever images skip state tracking entirely.
    pub fn tracking_disabled(&self) -> bool {
        self.tracking_disabled.load(Ordering::Relaxed)
    }

    pub(crate) fn set_tracking_disabled(&self, disabled: bool) {
        self.tracking_disabled.store(disabled, Ordering::Relaxed);
    }

    pub fn supports_state(&self, state: ResourceState) -> bool {
        image_supports_state(self.desc.usage, self.is_swapchain_image(), state)
    }

    pub(crate) fn tracking_info(&self) -> ImageInfo {
        ImageInfo {
            id: self.id,
            handle: self.image,
            mip_levels: self.desc.mip_levels,
            array_layers: self.desc.array_layers,
            aspect: self.aspect(),
            usage: self.desc.usage,
            is_swapchain: self.is_swapchain_image(),
            tracking_disabled: self.tracking_disabled(),
        }
    }

    /// The device-global state of one subresource between command lists.
    pub fn global_state(&self, mip: u32, layer: u32) -> ResourceState {
        let states = self.states.lock();
        states[(mip * self.desc.array_layers + layer) as usize]
    }

    pub(crate) fn set_global_state(&self, range: SubresourceRange, state: ResourceState) {
        let mut states = self.states.lock();
        for mip in range.base_mip..range.base_mip + range.level_count {
            for layer in range.base_layer..range.base_layer + range.layer_count {
                states[(mip * self.desc.array_layers + layer) as usize] = state;
            }
        }
    }

    /// Create a view over a subresource range of this image.
    pub fn create_view(
        self: &Arc<Self>,
        desc: &ImageViewDesc,
    ) -> Result<ImageView, vk::Result> {
        ImageView::new(self.clone(), desc)
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        unsafe {
            if self.memory != vk::DeviceMemory::null() {
                self.device.destroy_image(self.image, None);
                self.device.free_memory(self.memory, None);
            }
        }

        log::trace!("image destroyed: {}", self.desc.name);
    }
}

/// Image view descriptor.
#[derive(Debug, Clone)]
pub struct ImageViewDesc {
    pub view_type: vk::ImageViewType,
    pub format: vk::Format,
    pub range: SubresourceRange,
}

impl ImageViewDesc {
    /// A 2D view over the whole image in its own format.
    pub fn whole_2d(image: &Image) -> Self {
        Self {
            view_type: vk::ImageViewType::TYPE_2D,
            format: image.format(),
            range: SubresourceRange::full(image.mip_levels(), image.array_layers()),
        }
    }
}

/// A view into an image. Multiple views may alias one image.
pub struct ImageView {
    image: Arc<Image>,
    view: vk::ImageView,
    desc: ImageViewDesc,
}

impl ImageView {
    pub fn new(image: Arc<Image>, desc: &ImageViewDesc) -> Result<Self, vk::Result> {
        let aspect_mask = format_to_aspect_mask(desc.format);

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image.handle())
            .view_type(desc.view_type)
            .format(desc.format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask,
                base_mip_level: desc.range.base_mip,
                level_count: desc.range.level_count,
                base_array_layer: desc.range.base_layer,
                layer_count: desc.range.layer_count,
            });

        let view = unsafe { image.device.create_image_view(&view_info, None)? };

        Ok(Self {
            image,
            view,
            desc: desc.clone(),
        })
    }

    pub fn handle(&self) -> vk::ImageView {
        self.view
    }

    pub fn image(&self) -> &Arc<Image> {
        &self.image
    }

    pub fn range(&self) -> SubresourceRange {
        self.desc.range
    }

    pub fn format(&self) -> vk::Format {
        self.desc.format
    }

    /// Aspect flags implied by the view format.
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        format_to_aspect_mask(self.desc.format)
    }

    pub fn to_binding(
        &self,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    ) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo::default()
            .sampler(sampler)
            .image_view(self.view)
            .image_layout(layout)
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        unsafe {
            self.image.device.destroy_image_view(self.view, None);
        }
    }
}

/// Get the appropriate aspect mask for an image format.
pub(crate) fn format_to_aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state_inference() {
        assert_eq!(
            default_state_for_usage(ImageUsage::Sampled.into()),
            ResourceState::ShaderResource
        );
        assert_eq!(
            default_state_for_usage(ImageUsage::Storage.into()),
            ResourceState::General
        );
        assert_eq!(
            default_state_for_usage(ImageUsage::RenderTarget | ImageUsage::Sampled),
            ResourceState::RenderTarget
        );
        assert_eq!(
            default_state_for_usage(ImageUsage::DepthStencil.into()),
            ResourceState::DepthWrite
        );
        assert_eq!(
            default_state_for_usage(ImageUsage::Staging.into()),
            ResourceState::CopySource
        );
        assert_eq!(
            default_state_for_usage(ImageUsage::Sampled | ImageUsage::GenMipMaps),
            ResourceState::ShaderResource
        );
    }

    #[test]
    fn test_usage_constrains_states() {
        let sampled: BitFlags<ImageUsage> = ImageUsage::Sampled.into();
        assert!(image_supports_state(sampled, false, ResourceState::ShaderResource));
        assert!(image_supports_state(sampled, false, ResourceState::CopyDest));
        assert!(!image_supports_state(sampled, false, ResourceState::RenderTarget));
        assert!(!image_supports_state(sampled, false, ResourceState::Present));

        let rt: BitFlags<ImageUsage> = ImageUsage::RenderTarget.into();
        assert!(image_supports_state(rt, false, ResourceState::RenderTarget));
        assert!(image_supports_state(rt, false, ResourceState::CopySource));
        assert!(!image_supports_state(rt, false, ResourceState::DepthWrite));

        // Swapchain images may be presented and rendered to.
        assert!(image_supports_state(rt, true, ResourceState::Present));
    }

    #[test]
    fn test_aspect_from_format() {
        assert_eq!(
            format_to_aspect_mask(vk::Format::R8G8B8A8_UNORM),
            vk::ImageAspectFlags::COLOR
        );
        assert_eq!(
            format_to_aspect_mask(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            format_to_aspect_mask(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }
}
