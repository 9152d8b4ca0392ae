//! Vulkan Buffer - GPU buffer resource management.

use ash::vk;
use enumflags2::{bitflags, BitFlags};
use parking_lot::Mutex;
use std::ops::RangeBounds;

use crate::barrier::ResourceState;
use crate::utility::{find_memory_type, next_resource_id, normalize_range_u64};

/// Declared buffer usages. The set fixes which [`ResourceState`]s the
/// buffer may legally reach.
#[bitflags]
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferUsage {
    Vertex = 1 << 0,
    Index = 1 << 1,
    Uniform = 1 << 2,
    Streaming = 1 << 3,
    TransferSrc = 1 << 4,
    TransferDst = 1 << 5,
    Storage = 1 << 6,
    Indirect = 1 << 7,
}

/// Buffer descriptor for creating GPU buffers.
#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub name: String,
    /// Size of the buffer in bytes.
    pub size: vk::DeviceSize,
    pub usage: BitFlags<BufferUsage>,
}

impl BufferDesc {
    pub fn new(size: vk::DeviceSize, usage: impl Into<BitFlags<BufferUsage>>) -> Self {
        Self {
            name: String::new(),
            size,
            usage: usage.into(),
        }
    }

    /// Create a vertex buffer descriptor.
    pub fn vertex(size: vk::DeviceSize) -> Self {
        Self::new(size, BufferUsage::Vertex | BufferUsage::TransferDst)
    }

    /// Create an index buffer descriptor.
    pub fn index(size: vk::DeviceSize) -> Self {
        Self::new(size, BufferUsage::Index | BufferUsage::TransferDst)
    }

    /// Create a uniform buffer descriptor (host-visible).
    pub fn uniform(size: vk::DeviceSize) -> Self {
        Self::new(size, BufferUsage::Uniform)
    }

    /// Create a storage buffer descriptor.
    pub fn storage(size: vk::DeviceSize) -> Self {
        Self::new(size, BufferUsage::Storage | BufferUsage::TransferDst)
    }

    /// Create a staging buffer descriptor (CPU-visible transfer source).
    pub fn staging(size: vk::DeviceSize) -> Self {
        Self::new(size, BufferUsage::Streaming | BufferUsage::TransferSrc)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Add additional usage flags.
    pub fn with_additional_usage(mut self, usage: impl Into<BitFlags<BufferUsage>>) -> Self {
        self.usage |= usage.into();
        self
    }

    /// Whether the declared usage demands a host-visible allocation.
    pub fn is_host_visible(&self) -> bool {
        self.usage.contains(BufferUsage::Streaming) || self.usage.contains(BufferUsage::Uniform)
    }

    pub(crate) fn vk_usage(&self) -> vk::BufferUsageFlags {
        let mut out = vk::BufferUsageFlags::empty();
        if self.usage.contains(BufferUsage::Vertex) {
            out |= vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST;
        }
        if self.usage.contains(BufferUsage::Index) {
            out |= vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST;
        }
        if self.usage.contains(BufferUsage::Uniform) {
            out |= vk::BufferUsageFlags::UNIFORM_BUFFER;
        }
        if self.usage.contains(BufferUsage::TransferSrc) {
            out |= vk::BufferUsageFlags::TRANSFER_SRC;
        }
        if self.usage.contains(BufferUsage::TransferDst) {
            out |= vk::BufferUsageFlags::TRANSFER_DST;
        }
        if self.usage.contains(BufferUsage::Storage) {
            out |= vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST;
        }
        if self.usage.contains(BufferUsage::Indirect) {
            out |= vk::BufferUsageFlags::INDIRECT_BUFFER | vk::BufferUsageFlags::TRANSFER_DST;
        }
        out
    }
}

/// States reachable by a buffer with the given declared usage.
pub(crate) fn buffer_supports_state(usage: BitFlags<BufferUsage>, state: ResourceState) -> bool {
    match state {
        ResourceState::Undefined => true,
        ResourceState::General => usage.contains(BufferUsage::Storage),
        ResourceState::ShaderResource => {
            usage.contains(BufferUsage::Uniform) || usage.contains(BufferUsage::Storage)
        }
        ResourceState::CopySource => {
            usage.contains(BufferUsage::TransferSrc) || usage.contains(BufferUsage::Streaming)
        }
        ResourceState::CopyDest => {
            usage.contains(BufferUsage::TransferDst)
                || usage.contains(BufferUsage::Vertex)
                || usage.contains(BufferUsage::Index)
                || usage.contains(BufferUsage::Storage)
                || usage.contains(BufferUsage::Indirect)
        }
        ResourceState::RenderTarget
        | ResourceState::DepthWrite
        | ResourceState::DepthRead
        | ResourceState::Present => false,
    }
}

/// The identity and metadata the access tracker needs; detached from the
/// owning [`Buffer`] so tracker bookkeeping has no lifetime entanglement.
#[derive(Clone, Copy, Debug)]
pub struct BufferInfo {
    pub id: u64,
    pub handle: vk::Buffer,
    pub size: vk::DeviceSize,
    pub usage: BitFlags<BufferUsage>,
}

/// GPU buffer with memory allocation.
///
/// Host-visible buffers stay persistently mapped for their lifetime.
pub struct Buffer {
    device: ash::Device,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    mapped: Option<*mut u8>,
    desc: BufferDesc,
    id: u64,
    state: Mutex<ResourceState>,
}

// The mapped pointer is written through &self only via offset-checked
// copies; the Vulkan handles are immutable after creation.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    /// Create a new buffer from a descriptor.
    pub fn new(device: &crate::RenderDevice, desc: &BufferDesc) -> Result<Self, vk::Result> {
        let memory_properties = device.memory_properties();
        let device = device.handle();

        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.vk_usage())
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.create_buffer(&buffer_info, None)? };

        let mem_requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let memory_flags = if desc.is_host_visible() {
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
        } else {
            vk::MemoryPropertyFlags::DEVICE_LOCAL
        };

        let memory_type_index =
            find_memory_type(memory_properties, mem_requirements.memory_type_bits, memory_flags)
                .ok_or(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)?;

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(mem_requirements.size)
            .memory_type_index(memory_type_index);

        let memory = unsafe { device.allocate_memory(&alloc_info, None)? };
        unsafe { device.bind_buffer_memory(buffer, memory, 0)? };

        let mapped = if desc.is_host_visible() {
            let ptr = unsafe {
                device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())?
            };
            Some(ptr as *mut u8)
        } else {
            None
        };

        log::trace!("new buffer created: {}", desc.name);

        Ok(Self {
            device: device.clone(),
            buffer,
            memory,
            mapped,
            desc: desc.clone(),
            id: next_resource_id(),
            state: Mutex::new(ResourceState::Undefined),
        })
    }

    pub fn as_range<R: RangeBounds<u64>>(&self, range: R) -> Result<BufferRange<'_>, vk::Result> {
        let (offset, size) = normalize_range_u64(range, self.desc.size)?;
        Ok(BufferRange {
            buffer: self,
            offset,
            size,
        })
    }

    /// Write into a host-visible buffer through its persistent mapping.
    pub fn write_at(&self, offset: vk::DeviceSize, data: &[u8]) -> Result<(), vk::Result> {
        if data.is_empty() {
            return Ok(());
        }
        let Some(mapped) = self.mapped else {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        };
        if offset + data.len() as vk::DeviceSize > self.desc.size {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapped.add(offset as usize), data.len());
        }
        Ok(())
    }

    /// Get the raw Vulkan buffer handle.
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
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
    pub fn desc(&self) -> &BufferDesc {
        &self.desc
    }

    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.desc.size
    }

    #[inline]
    pub fn usage(&self) -> BitFlags<BufferUsage> {
        self.desc.usage
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    pub fn supports_state(&self, state: ResourceState) -> bool {
        buffer_supports_state(self.desc.usage, state)
    }

    pub(crate) fn tracking_info(&self) -> BufferInfo {
        BufferInfo {
            id: self.id,
            handle: self.buffer,
            size: self.desc.size,
            usage: self.desc.usage,
        }
    }

    /// The state the device believes the buffer is in between command lists.
    pub fn global_state(&self) -> ResourceState {
        *self.state.lock()
    }

    pub(crate) fn set_global_state(&self, state: ResourceState) {
        *self.state.lock() = state;
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            if self.mapped.is_some() {
                self.device.unmap_memory(self.memory);
            }
            self.device.destroy_buffer(self.buffer, None);
            self.device.free_memory(self.memory, None);
        }

        log::trace!("buffer destroyed: {}", self.desc.name);
    }
}

#[derive(Clone, Copy)]
pub struct BufferRange<'a> {
    buffer: &'a Buffer,
    offset: u64,
    size: u64,
}

impl<'a> BufferRange<'a> {
    #[inline]
    pub fn buffer(&self) -> &'a Buffer {
        self.buffer
    }

    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn to_binding(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo::default()
            .buffer(self.buffer.handle())
            .offset(self.offset)
            .range(self.size)
    }

    pub fn write(&self, data: &[u8]) -> Result<(), vk::Result> {
        if data.len() as u64 > self.size {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        self.buffer.write_at(self.offset, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_constrains_states() {
        let staging = BufferDesc::staging(1024);
        assert!(buffer_supports_state(staging.usage, ResourceState::CopySource));
        assert!(!buffer_supports_state(staging.usage, ResourceState::CopyDest));
        assert!(!buffer_supports_state(staging.usage, ResourceState::RenderTarget));

        let vertex = BufferDesc::vertex(1024);
        assert!(buffer_supports_state(vertex.usage, ResourceState::CopyDest));
        assert!(!buffer_supports_state(vertex.usage, ResourceState::ShaderResource));

        let storage = BufferDesc::storage(1024);
        assert!(buffer_supports_state(storage.usage, ResourceState::General));
        assert!(buffer_supports_state(storage.usage, ResourceState::ShaderResource));
    }

    #[test]
    fn test_vk_usage_mapping() {
        let desc = BufferDesc::vertex(64);
        assert!(desc.vk_usage().contains(vk::BufferUsageFlags::VERTEX_BUFFER));
        assert!(desc.vk_usage().contains(vk::BufferUsageFlags::TRANSFER_DST));
        assert!(!desc.is_host_visible());

        let desc = BufferDesc::uniform(64);
        assert!(desc.vk_usage().contains(vk::BufferUsageFlags::UNIFORM_BUFFER));
        assert!(desc.is_host_visible());
    }
}
