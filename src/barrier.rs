//! Resource states and the barriers that move resources between them.
//!
//! Every trackable resource sits in exactly one [`ResourceState`] per
//! subresource at any point of GPU time. Each state maps to a fixed
//! (image layout, access mask, stage mask) triple; a barrier couples the
//! triple of the outgoing state to the triple of the incoming one.

use ash::vk;

/// The closed set of states a buffer or image subresource can occupy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Undefined,
    General,
    ShaderResource,
    RenderTarget,
    DepthWrite,
    DepthRead,
    CopySource,
    CopyDest,
    Present,
}

impl ResourceState {
    pub fn image_layout(self) -> vk::ImageLayout {
        match self {
            ResourceState::Undefined => vk::ImageLayout::UNDEFINED,
            ResourceState::General => vk::ImageLayout::GENERAL,
            ResourceState::ShaderResource => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ResourceState::RenderTarget => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ResourceState::DepthWrite => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ResourceState::DepthRead => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
            ResourceState::CopySource => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            ResourceState::CopyDest => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ResourceState::Present => vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }

    pub fn access_mask(self) -> vk::AccessFlags2 {
        match self {
            ResourceState::Undefined => vk::AccessFlags2::NONE,
            ResourceState::General => {
                vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE
            }
            ResourceState::ShaderResource => vk::AccessFlags2::SHADER_READ,
            ResourceState::RenderTarget => {
                vk::AccessFlags2::COLOR_ATTACHMENT_READ | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE
            }
            ResourceState::DepthWrite => {
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE
            }
            ResourceState::DepthRead => vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ,
            ResourceState::CopySource => vk::AccessFlags2::TRANSFER_READ,
            ResourceState::CopyDest => vk::AccessFlags2::TRANSFER_WRITE,
            ResourceState::Present => vk::AccessFlags2::NONE,
        }
    }

    pub fn stage_mask(self) -> vk::PipelineStageFlags2 {
        match self {
            ResourceState::Undefined => vk::PipelineStageFlags2::NONE,
            ResourceState::General => vk::PipelineStageFlags2::ALL_COMMANDS,
            ResourceState::ShaderResource => {
                vk::PipelineStageFlags2::VERTEX_SHADER
                    | vk::PipelineStageFlags2::FRAGMENT_SHADER
                    | vk::PipelineStageFlags2::COMPUTE_SHADER
            }
            ResourceState::RenderTarget => vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            ResourceState::DepthWrite | ResourceState::DepthRead => {
                vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS
            }
            ResourceState::CopySource | ResourceState::CopyDest => {
                vk::PipelineStageFlags2::TRANSFER
            }
            ResourceState::Present => vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
        }
    }

    /// Whether this state is a legal transition destination on a Copy queue.
    pub fn is_transfer_compatible(self) -> bool {
        matches!(
            self,
            ResourceState::Undefined
                | ResourceState::General
                | ResourceState::CopySource
                | ResourceState::CopyDest
        )
    }
}

/// A [`ResourceState`] together with the concrete stage/access masks the
/// recorded command actually uses.
///
/// The masks default to the state's full table entry; descriptor-driven
/// transitions narrow them to the shader stages declared on the binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateRecord {
    pub state: ResourceState,
    pub stages: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}

impl StateRecord {
    pub fn of(state: ResourceState) -> Self {
        Self {
            state,
            stages: state.stage_mask(),
            access: state.access_mask(),
        }
    }

    pub fn with_stages(state: ResourceState, stages: vk::PipelineStageFlags2) -> Self {
        Self {
            state,
            stages,
            access: state.access_mask(),
        }
    }
}

impl From<ResourceState> for StateRecord {
    fn from(state: ResourceState) -> Self {
        StateRecord::of(state)
    }
}

/// Map declared shader stages to the pipeline stages that consume a binding.
pub fn shader_stages_to_pipeline_stages(stages: vk::ShaderStageFlags) -> vk::PipelineStageFlags2 {
    let mut out = vk::PipelineStageFlags2::NONE;
    if stages.contains(vk::ShaderStageFlags::VERTEX) {
        out |= vk::PipelineStageFlags2::VERTEX_SHADER;
    }
    if stages.contains(vk::ShaderStageFlags::FRAGMENT) {
        out |= vk::PipelineStageFlags2::FRAGMENT_SHADER;
    }
    if stages.contains(vk::ShaderStageFlags::COMPUTE) {
        out |= vk::PipelineStageFlags2::COMPUTE_SHADER;
    }
    if stages.contains(vk::ShaderStageFlags::GEOMETRY) {
        out |= vk::PipelineStageFlags2::GEOMETRY_SHADER;
    }
    if stages.contains(vk::ShaderStageFlags::TESSELLATION_CONTROL) {
        out |= vk::PipelineStageFlags2::TESSELLATION_CONTROL_SHADER;
    }
    if stages.contains(vk::ShaderStageFlags::TESSELLATION_EVALUATION) {
        out |= vk::PipelineStageFlags2::TESSELLATION_EVALUATION_SHADER;
    }
    if out == vk::PipelineStageFlags2::NONE {
        out = vk::PipelineStageFlags2::ALL_COMMANDS;
    }
    out
}

/// A buffer memory barrier, held as plain data until recorded.
#[derive(Clone, Copy, Debug)]
pub struct BufferBarrier {
    pub buffer: vk::Buffer,
    pub resource_id: u64,
    pub src: StateRecord,
    pub dst: StateRecord,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
}

impl BufferBarrier {
    pub fn to_vk(&self) -> vk::BufferMemoryBarrier2<'static> {
        vk::BufferMemoryBarrier2::default()
            .src_stage_mask(self.src.stages)
            .src_access_mask(self.src.access)
            .dst_stage_mask(self.dst.stages)
            .dst_access_mask(self.dst.access)
            .src_queue_family_index(self.src_queue_family)
            .dst_queue_family_index(self.dst_queue_family)
            .buffer(self.buffer)
            .offset(self.offset)
            .size(self.size)
    }
}

/// An image memory barrier over a homogeneous subresource run.
#[derive(Clone, Copy, Debug)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub resource_id: u64,
    pub src: StateRecord,
    pub dst: StateRecord,
    pub aspect: vk::ImageAspectFlags,
    pub base_mip: u32,
    pub level_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
}

impl ImageBarrier {
    pub fn to_vk(&self) -> vk::ImageMemoryBarrier2<'static> {
        vk::ImageMemoryBarrier2::default()
            .src_stage_mask(self.src.stages)
            .src_access_mask(self.src.access)
            .dst_stage_mask(self.dst.stages)
            .dst_access_mask(self.dst.access)
            .old_layout(self.src.state.image_layout())
            .new_layout(self.dst.state.image_layout())
            .src_queue_family_index(self.src_queue_family)
            .dst_queue_family_index(self.dst_queue_family)
            .image(self.image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: self.aspect,
                base_mip_level: self.base_mip,
                level_count: self.level_count,
                base_array_layer: self.base_layer,
                layer_count: self.layer_count,
            })
    }
}

/// A batch of barriers recorded with a single `vkCmdPipelineBarrier2`.
#[derive(Default)]
pub struct BarrierBatch {
    pub buffers: Vec<BufferBarrier>,
    pub images: Vec<ImageBarrier>,
}

impl BarrierBatch {
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty() && self.images.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buffers.len() + self.images.len()
    }

    pub fn extend(&mut self, other: BarrierBatch) {
        self.buffers.extend(other.buffers);
        self.images.extend(other.images);
    }

    /// Fix the batch order: buffer barriers before image barriers, image
    /// barriers by (resource id, base mip, base layer). The GPU does not
    /// care, but tests and captures do.
    pub fn sort(&mut self) {
        self.buffers.sort_by_key(|b| b.resource_id);
        self.images
            .sort_by_key(|b| (b.resource_id, b.base_mip, b.base_layer));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_table() {
        assert_eq!(
            ResourceState::ShaderResource.image_layout(),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
        assert_eq!(
            ResourceState::RenderTarget.stage_mask(),
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT
        );
        assert_eq!(
            ResourceState::CopyDest.access_mask(),
            vk::AccessFlags2::TRANSFER_WRITE
        );
        assert_eq!(
            ResourceState::Undefined.image_layout(),
            vk::ImageLayout::UNDEFINED
        );
        assert_eq!(ResourceState::Undefined.access_mask(), vk::AccessFlags2::NONE);
    }

    #[test]
    fn test_transfer_compatibility() {
        assert!(ResourceState::CopySource.is_transfer_compatible());
        assert!(ResourceState::CopyDest.is_transfer_compatible());
        assert!(ResourceState::General.is_transfer_compatible());
        assert!(!ResourceState::RenderTarget.is_transfer_compatible());
        assert!(!ResourceState::ShaderResource.is_transfer_compatible());
        assert!(!ResourceState::Present.is_transfer_compatible());
    }

    #[test]
    fn test_shader_stage_mapping() {
        assert_eq!(
            shader_stages_to_pipeline_stages(vk::ShaderStageFlags::FRAGMENT),
            vk::PipelineStageFlags2::FRAGMENT_SHADER
        );
        assert_eq!(
            shader_stages_to_pipeline_stages(
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
            ),
            vk::PipelineStageFlags2::VERTEX_SHADER | vk::PipelineStageFlags2::FRAGMENT_SHADER
        );
        // Unknown stages fall back to a conservative mask.
        assert_eq!(
            shader_stages_to_pipeline_stages(vk::ShaderStageFlags::empty()),
            vk::PipelineStageFlags2::ALL_COMMANDS
        );
    }

    fn image_barrier(id: u64, mip: u32, layer: u32) -> ImageBarrier {
        ImageBarrier {
            image: vk::Image::null(),
            resource_id: id,
            src: ResourceState::Undefined.into(),
            dst: ResourceState::CopyDest.into(),
            aspect: vk::ImageAspectFlags::COLOR,
            base_mip: mip,
            level_count: 1,
            base_layer: layer,
            layer_count: 1,
            src_queue_family: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family: vk::QUEUE_FAMILY_IGNORED,
        }
    }

    #[test]
    fn test_batch_sort_is_deterministic() {
        let mut batch = BarrierBatch::default();
        batch.images.push(image_barrier(7, 3, 0));
        batch.images.push(image_barrier(2, 0, 1));
        batch.images.push(image_barrier(2, 0, 0));
        batch.images.push(image_barrier(7, 1, 0));
        batch.sort();

        let order: Vec<(u64, u32, u32)> = batch
            .images
            .iter()
            .map(|b| (b.resource_id, b.base_mip, b.base_layer))
            .collect();
        assert_eq!(order, vec![(2, 0, 0), (2, 0, 1), (7, 1, 0), (7, 3, 0)]);
    }
}
