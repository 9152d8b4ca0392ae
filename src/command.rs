//! Command buffer pools and recording leases.
//!
//! Each queue owns one [`CommandBufferAllocator`] with a pool pair per
//! frame slot: primaries for section work/pre buffers, secondaries for
//! parallel subpass recording. A lease hands out one buffer; it returns
//! to its pool in bulk when the owning frame slot retires and the pools
//! reset.

use ash::vk;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::barrier::BarrierBatch;

struct PoolState {
    pool: vk::CommandPool,
    buffers: Vec<vk::CommandBuffer>,
    next_index: usize,
}

impl PoolState {
    fn new(device: &ash::Device, queue_family: u32) -> Result<Self, vk::Result> {
        let create_info = vk::CommandPoolCreateInfo::default().queue_family_index(queue_family);
        let pool = unsafe { device.create_command_pool(&create_info, None)? };
        Ok(Self {
            pool,
            buffers: Vec::new(),
            next_index: 0,
        })
    }

    fn allocate(
        &mut self,
        device: &ash::Device,
        level: vk::CommandBufferLevel,
    ) -> Result<vk::CommandBuffer, vk::Result> {
        let index = self.next_index;
        self.next_index += 1;

        if let Some(&buffer) = self.buffers.get(index) {
            return Ok(buffer);
        }

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(level)
            .command_buffer_count(1);

        let buffers = unsafe { device.allocate_command_buffers(&alloc_info)? };
        self.buffers.push(buffers[0]);
        Ok(buffers[0])
    }

    fn reset(&mut self, device: &ash::Device) -> Result<(), vk::Result> {
        self.next_index = 0;
        unsafe { device.reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty()) }
    }
}

struct FramePools {
    /// Primary buffers: section work buffers and pre-barrier buffers.
    primary: Mutex<PoolState>,
    /// Secondary buffers for parallel-recorded subpasses. Kept apart so
    /// concurrent sub-contexts do not contend with primary allocation.
    transient: Mutex<PoolState>,
}

/// Per-queue, per-frame command buffer pools.
pub struct CommandBufferAllocator {
    device: ash::Device,
    frames: Vec<FramePools>,
    current_frame: AtomicUsize,
}

impl CommandBufferAllocator {
    pub fn new(
        device: &ash::Device,
        queue_family: u32,
        num_frames: usize,
    ) -> Result<Self, vk::Result> {
        let mut frames = Vec::with_capacity(num_frames);
        for _ in 0..num_frames {
            frames.push(FramePools {
                primary: Mutex::new(PoolState::new(device, queue_family)?),
                transient: Mutex::new(PoolState::new(device, queue_family)?),
            });
        }
        Ok(Self {
            device: device.clone(),
            frames,
            current_frame: AtomicUsize::new(0),
        })
    }

    /// Lease a command buffer from the current frame's pools.
    pub fn allocate(&self, secondary: bool) -> Result<CommandBufferLease, vk::Result> {
        let frame = &self.frames[self.current_frame.load(Ordering::Relaxed)];
        let cmd = if secondary {
            frame
                .transient
                .lock()
                .allocate(&self.device, vk::CommandBufferLevel::SECONDARY)?
        } else {
            frame
                .primary
                .lock()
                .allocate(&self.device, vk::CommandBufferLevel::PRIMARY)?
        };
        Ok(CommandBufferLease {
            device: self.device.clone(),
            cmd,
            secondary,
            ended: std::cell::Cell::new(false),
        })
    }

    /// Point allocation at the given frame slot.
    pub(crate) fn set_current_frame(&self, index: usize) {
        self.current_frame.store(index, Ordering::Relaxed);
    }

    /// Recycle every buffer of a retired frame slot. Only legal once the
    /// slot's fence has signaled.
    pub(crate) fn reset_frame(&self, index: usize) -> Result<(), vk::Result> {
        let frame = &self.frames[index];
        frame.primary.lock().reset(&self.device)?;
        frame.transient.lock().reset(&self.device)?;
        Ok(())
    }
}

impl Drop for CommandBufferAllocator {
    fn drop(&mut self) {
        for frame in &self.frames {
            unsafe {
                self.device
                    .destroy_command_pool(frame.primary.lock().pool, None);
                self.device
                    .destroy_command_pool(frame.transient.lock().pool, None);
            }
        }
    }
}

/// A leased command buffer with the recording surface the contexts use.
pub struct CommandBufferLease {
    device: ash::Device,
    cmd: vk::CommandBuffer,
    secondary: bool,
    ended: std::cell::Cell<bool>,
}

impl CommandBufferLease {
    /// Begin recording a primary buffer.
    pub fn begin(&self) -> Result<(), vk::Result> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(self.cmd, &begin_info) }
    }

    /// Begin recording a secondary buffer for one subpass of a render
    /// pass. The framebuffer is not known at record time and stays null
    /// in the inheritance info.
    pub fn begin_secondary(
        &self,
        render_pass: vk::RenderPass,
        subpass: u32,
    ) -> Result<(), vk::Result> {
        let inheritance = vk::CommandBufferInheritanceInfo::default()
            .render_pass(render_pass)
            .subpass(subpass);
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(
                vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
                    | vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE,
            )
            .inheritance_info(&inheritance);
        unsafe { self.device.begin_command_buffer(self.cmd, &begin_info) }
    }

    pub fn end(&self) -> Result<(), vk::Result> {
        self.ended.set(true);
        unsafe { self.device.end_command_buffer(self.cmd) }
    }

    pub fn is_ended(&self) -> bool {
        self.ended.get()
    }

    pub fn is_secondary(&self) -> bool {
        self.secondary
    }

    pub fn handle(&self) -> vk::CommandBuffer {
        self.cmd
    }

    // Barriers

    pub fn record_barriers(&self, batch: &BarrierBatch) {
        if batch.is_empty() {
            return;
        }
        let buffer_barriers: Vec<vk::BufferMemoryBarrier2> =
            batch.buffers.iter().map(|b| b.to_vk()).collect();
        let image_barriers: Vec<vk::ImageMemoryBarrier2> =
            batch.images.iter().map(|b| b.to_vk()).collect();
        let dep = vk::DependencyInfo::default()
            .buffer_memory_barriers(&buffer_barriers)
            .image_memory_barriers(&image_barriers);
        unsafe { self.device.cmd_pipeline_barrier2(self.cmd, &dep) }
    }

    // Pipeline and descriptor binding

    pub fn bind_pipeline(&self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        unsafe { self.device.cmd_bind_pipeline(self.cmd, bind_point, pipeline) }
    }

    pub fn bind_descriptor_sets(
        &self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        descriptor_sets: &[vk::DescriptorSet],
    ) {
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                self.cmd,
                bind_point,
                layout,
                first_set,
                descriptor_sets,
                &[],
            )
        }
    }

    // Vertex/index input

    pub fn bind_vertex_buffers(
        &self,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    ) {
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(self.cmd, first_binding, buffers, offsets)
        }
    }

    pub fn bind_index_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        unsafe {
            self.device
                .cmd_bind_index_buffer(self.cmd, buffer, offset, index_type)
        }
    }

    // Draw and dispatch

    pub fn draw(
        &self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.cmd_draw(
                self.cmd,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            )
        }
    }

    pub fn draw_indexed(
        &self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.cmd_draw_indexed(
                self.cmd,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        }
    }

    pub fn draw_indirect(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        draw_count: u32,
        stride: u32,
    ) {
        unsafe {
            self.device
                .cmd_draw_indirect(self.cmd, buffer, offset, draw_count, stride)
        }
    }

    pub fn draw_indexed_indirect(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        draw_count: u32,
        stride: u32,
    ) {
        unsafe {
            self.device
                .cmd_draw_indexed_indirect(self.cmd, buffer, offset, draw_count, stride)
        }
    }

    pub fn dispatch(&self, group_count_x: u32, group_count_y: u32, group_count_z: u32) {
        unsafe {
            self.device
                .cmd_dispatch(self.cmd, group_count_x, group_count_y, group_count_z)
        }
    }

    pub fn dispatch_indirect(&self, buffer: vk::Buffer, offset: vk::DeviceSize) {
        unsafe { self.device.cmd_dispatch_indirect(self.cmd, buffer, offset) }
    }

    // Dynamic state

    pub fn set_viewport(&self, viewport: vk::Viewport) {
        unsafe { self.device.cmd_set_viewport(self.cmd, 0, &[viewport]) }
    }

    pub fn set_scissor(&self, scissor: vk::Rect2D) {
        unsafe { self.device.cmd_set_scissor(self.cmd, 0, &[scissor]) }
    }

    pub fn set_blend_constants(&self, constants: [f32; 4]) {
        unsafe { self.device.cmd_set_blend_constants(self.cmd, &constants) }
    }

    pub fn set_stencil_reference(&self, reference: u32) {
        unsafe {
            self.device
                .cmd_set_stencil_reference(self.cmd, vk::StencilFaceFlags::FRONT_AND_BACK, reference)
        }
    }

    // Copies

    pub fn copy_buffer(&self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        unsafe { self.device.cmd_copy_buffer(self.cmd, src, dst, regions) }
    }

    pub fn copy_image(&self, src: vk::Image, dst: vk::Image, regions: &[vk::ImageCopy]) {
        unsafe {
            self.device.cmd_copy_image(
                self.cmd,
                src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                regions,
            )
        }
    }

    pub fn copy_buffer_to_image(
        &self,
        src: vk::Buffer,
        dst: vk::Image,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.device.cmd_copy_buffer_to_image(
                self.cmd,
                src,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                regions,
            )
        }
    }

    pub fn copy_image_to_buffer(
        &self,
        src: vk::Image,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.device.cmd_copy_image_to_buffer(
                self.cmd,
                src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst,
                regions,
            )
        }
    }

    pub fn blit_image(
        &self,
        src: vk::Image,
        dst: vk::Image,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    ) {
        unsafe {
            self.device.cmd_blit_image(
                self.cmd,
                src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                regions,
                filter,
            )
        }
    }

    pub fn resolve_image(&self, src: vk::Image, dst: vk::Image, regions: &[vk::ImageResolve]) {
        unsafe {
            self.device.cmd_resolve_image(
                self.cmd,
                src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                regions,
            )
        }
    }

    // Render pass orchestration (primary buffers only)

    pub fn begin_render_pass(&self, info: &vk::RenderPassBeginInfo) {
        unsafe {
            self.device.cmd_begin_render_pass(
                self.cmd,
                info,
                vk::SubpassContents::SECONDARY_COMMAND_BUFFERS,
            )
        }
    }

    pub fn next_subpass(&self) {
        unsafe {
            self.device
                .cmd_next_subpass(self.cmd, vk::SubpassContents::SECONDARY_COMMAND_BUFFERS)
        }
    }

    pub fn end_render_pass(&self) {
        unsafe { self.device.cmd_end_render_pass(self.cmd) }
    }

    pub fn execute_commands(&self, buffers: &[vk::CommandBuffer]) {
        unsafe { self.device.cmd_execute_commands(self.cmd, buffers) }
    }

    pub fn push_constants(
        &self,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        unsafe {
            self.device
                .cmd_push_constants(self.cmd, layout, stages, offset, data)
        }
    }
}
