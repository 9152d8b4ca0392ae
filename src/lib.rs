//! Ember RHI (Render Hardware Interface) - Pure Vulkan backend.
//!
//! A handle-based surface over the Vulkan driver that tracks resource
//! states automatically, records command lists in sections (including
//! concurrently recorded subpasses), and retires frame-scoped resources
//! once their fence signals.

pub mod barrier;
pub mod buffer;
pub mod command;
pub mod command_list;
pub mod context;
pub mod core;
pub mod descriptor;
pub mod device;
pub mod image;
pub mod pipeline;
pub mod queue;
pub mod render_pass;
pub mod ring_buffer;
pub mod sampler;
pub mod shader;
pub mod swapchain;
pub mod tracker;
mod defer_release;
mod error;
mod utility;

pub use ash::{vk, Device};
pub use barrier::{
    shader_stages_to_pipeline_stages, BarrierBatch, BufferBarrier, ImageBarrier, ResourceState,
    StateRecord,
};
pub use buffer::{Buffer, BufferDesc, BufferRange, BufferUsage};
pub use command::{CommandBufferAllocator, CommandBufferLease};
pub use command_list::{CommandList, CommandListState};
pub use context::{
    BufferImageCopyRegion, CommandContext, ImageBlitRegion, ImageCopyRegion, ImageResolveRegion,
    RenderPassContext, SubresourceLayers,
};
pub use core::{DeviceCreateHints, PhysicalDevice, RhiCore};
pub use defer_release::{CleanupFn, DeferReleaseQueue};
pub use descriptor::{
    AllocatedSet, DescriptorPool, DescriptorSetLayout, LayoutBinding, PipelineLayout,
};
pub use device::RenderDevice;
pub use error::RhiError;
pub use image::{Image, ImageDesc, ImageUsage, ImageView, ImageViewDesc, SubresourceRange};
pub use pipeline::{create_layout_from_reflection, DepthState, GraphicPipelineDesc, Pipeline};
pub use queue::{CommandQueue, QueueType, NUM_FRAMES};
pub use render_pass::{Attachment, AttachmentTarget, RenderPass, RenderPassDesc, SubpassDesc};
pub use ring_buffer::{ConstantAllocation, HugeConstantBuffer, HUGE_CONSTANT_BUFFER_SIZE};
pub use sampler::{Sampler, SamplerConfig};
pub use shader::{reflect_spirv, ShaderBinding, ShaderError, ShaderModule, ShaderReflection, ShaderStage};
pub use swapchain::{Surface, Swapchain, SwapchainConfig};
pub use tracker::AccessTracker;

#[doc(hidden)]
pub use paste::paste;
