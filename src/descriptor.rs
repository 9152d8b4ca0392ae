//! Vulkan Descriptor - descriptor set layouts, pools, and pipeline layouts.
//!
//! Each [`DescriptorSetLayout`] owns the pool its sets come from; draw-time
//! binding allocates fresh sets there and queues stale ones for deferred
//! free once the owning frame retires.

use ash::vk;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::shader::ShaderBinding;
use crate::utility::next_resource_id;

/// Sets allocated per pool chunk before a new chunk is opened.
const SETS_PER_POOL_CHUNK: u32 = 256;

/// Layout binding information.
#[derive(Debug, Clone)]
pub struct LayoutBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    pub stage_flags: vk::ShaderStageFlags,
}

impl From<&ShaderBinding> for LayoutBinding {
    fn from(b: &ShaderBinding) -> Self {
        Self {
            binding: b.binding,
            descriptor_type: b.descriptor_type,
            count: b.count,
            stage_flags: b.stage_flags,
        }
    }
}

/// Descriptor pool for allocating descriptor sets.
pub struct DescriptorPool {
    device: ash::Device,
    pool: vk::DescriptorPool,
    max_sets: u32,
}

impl DescriptorPool {
    /// Create a new descriptor pool.
    pub fn new(
        device: &ash::Device,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<Self, vk::Result> {
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes)
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);

        let pool = unsafe { device.create_descriptor_pool(&create_info, None)? };

        Ok(Self {
            device: device.clone(),
            pool,
            max_sets,
        })
    }

    /// Allocate a single descriptor set.
    pub fn allocate(&self, layout: vk::DescriptorSetLayout) -> Result<vk::DescriptorSet, vk::Result> {
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);

        let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info)? };
        Ok(sets[0])
    }

    /// Reset the pool, freeing all allocated descriptor sets.
    pub fn reset(&self) -> Result<(), vk::Result> {
        unsafe {
            self.device
                .reset_descriptor_pool(self.pool, vk::DescriptorPoolResetFlags::empty())
        }
    }

    /// Get the raw Vulkan descriptor pool handle.
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    /// Get the maximum number of sets this pool can allocate.
    pub fn max_sets(&self) -> u32 {
        self.max_sets
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_pool(self.pool, None);
        }
    }
}

/// A descriptor set together with the pool chunk it was carved from,
/// so it can be freed individually later.
#[derive(Clone, Copy, Debug)]
pub struct AllocatedSet {
    pub set: vk::DescriptorSet,
    pub pool: vk::DescriptorPool,
}

impl AllocatedSet {
    pub(crate) fn free(self, device: &ash::Device) {
        // The set may already be gone if its chunk was dropped wholesale.
        let _ = unsafe { device.free_descriptor_sets(self.pool, &[self.set]) };
    }
}

/// Descriptor set layout with binding metadata and its own pool.
pub struct DescriptorSetLayout {
    device: ash::Device,
    layout: vk::DescriptorSetLayout,
    bindings: Vec<LayoutBinding>,
    binding_map: HashMap<u32, usize>,
    chunks: Mutex<Vec<DescriptorPool>>,
    id: u64,
}

impl DescriptorSetLayout {
    /// Create a new descriptor set layout from binding descriptions.
    pub fn new(device: &ash::Device, bindings: &[LayoutBinding]) -> Result<Self, vk::Result> {
        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(b.descriptor_type)
                    .descriptor_count(b.count)
                    .stage_flags(b.stage_flags)
            })
            .collect();

        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);

        let layout = unsafe { device.create_descriptor_set_layout(&create_info, None)? };

        let binding_map: HashMap<u32, usize> = bindings
            .iter()
            .enumerate()
            .map(|(i, b)| (b.binding, i))
            .collect();

        Ok(Self {
            device: device.clone(),
            layout,
            bindings: bindings.to_vec(),
            binding_map,
            chunks: Mutex::new(Vec::new()),
            id: next_resource_id(),
        })
    }

    /// Create a descriptor set layout for one set index of a reflection table.
    pub fn from_reflection(
        device: &ash::Device,
        shader_bindings: &[ShaderBinding],
        set_index: u32,
    ) -> Result<Self, vk::Result> {
        let bindings: Vec<LayoutBinding> = shader_bindings
            .iter()
            .filter(|b| b.set == set_index)
            .map(LayoutBinding::from)
            .collect();

        Self::new(device, &bindings)
    }

    /// Get the raw Vulkan descriptor set layout handle.
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// Layout identity, used to detect set-layout conflicts on pipeline bind.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Get binding information by binding index.
    pub fn get_binding(&self, binding: u32) -> Option<&LayoutBinding> {
        self.binding_map.get(&binding).map(|&i| &self.bindings[i])
    }

    /// Get all bindings.
    pub fn bindings(&self) -> &[LayoutBinding] {
        &self.bindings
    }

    /// Allocate a descriptor set from this layout's pool, opening a new
    /// chunk when the current one runs dry.
    pub fn allocate_set(&self) -> Result<AllocatedSet, vk::Result> {
        let mut chunks = self.chunks.lock();

        if let Some(chunk) = chunks.last() {
            match chunk.allocate(self.layout) {
                Ok(set) => {
                    return Ok(AllocatedSet {
                        set,
                        pool: chunk.handle(),
                    })
                }
                Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY)
                | Err(vk::Result::ERROR_FRAGMENTED_POOL) => {}
                Err(e) => return Err(e),
            }
        }

        let chunk = DescriptorPool::new(&self.device, SETS_PER_POOL_CHUNK, &self.pool_sizes())?;
        let set = chunk.allocate(self.layout)?;
        let pool = chunk.handle();
        chunks.push(chunk);
        Ok(AllocatedSet { set, pool })
    }

    fn pool_sizes(&self) -> Vec<vk::DescriptorPoolSize> {
        let mut by_type: HashMap<vk::DescriptorType, u32> = HashMap::new();
        for b in &self.bindings {
            *by_type.entry(b.descriptor_type).or_insert(0) += b.count.max(1);
        }
        by_type
            .into_iter()
            .map(|(ty, per_set)| vk::DescriptorPoolSize {
                ty,
                descriptor_count: per_set * SETS_PER_POOL_CHUNK,
            })
            .collect()
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        self.chunks.lock().clear();
        unsafe {
            self.device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

/// Pipeline layout over an ordered list of set layouts.
pub struct PipelineLayout {
    device: ash::Device,
    layout: vk::PipelineLayout,
    set_layouts: Vec<Arc<DescriptorSetLayout>>,
}

impl PipelineLayout {
    pub fn new(
        device: &ash::Device,
        set_layouts: Vec<Arc<DescriptorSetLayout>>,
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<Self, vk::Result> {
        let vk_layouts: Vec<vk::DescriptorSetLayout> =
            set_layouts.iter().map(|l| l.handle()).collect();

        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&vk_layouts)
            .push_constant_ranges(push_constant_ranges);

        let layout = unsafe { device.create_pipeline_layout(&layout_info, None)? };

        Ok(Self {
            device: device.clone(),
            layout,
            set_layouts,
        })
    }

    /// Get the raw Vulkan pipeline layout handle.
    pub fn handle(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn set_layouts(&self) -> &[Arc<DescriptorSetLayout>] {
        &self.set_layouts
    }

    pub fn set_layout(&self, set: u32) -> Option<&Arc<DescriptorSetLayout>> {
        self.set_layouts.get(set as usize)
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}
