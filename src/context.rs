//! Command contexts - the single-threaded recording API.
//!
//! Two variants share one surface: the generic context records copy and
//! compute work into a fresh section of its list; the render-pass context
//! orchestrates a pass recorded through per-subpass sub-contexts, each
//! with its own secondary command buffer and access tracker. At most one
//! context may be active per command list; dropping a context without
//! finishing it is a fatal usage error.

use ash::vk;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::barrier::{shader_stages_to_pipeline_stages, ResourceState, StateRecord};
use crate::buffer::Buffer;
use crate::command::CommandBufferLease;
use crate::command_list::{CommandList, CommandListSection, RetainedResource};
use crate::descriptor::AllocatedSet;
use crate::error::{usage_error, RhiError};
use crate::image::{Image, ImageView, SubresourceRange};
use crate::pipeline::Pipeline;
use crate::queue::CommandQueue;
use crate::render_pass::RenderPass;
use crate::sampler::Sampler;
use crate::tracker::AccessTracker;

// ---------------------------------------------------------------------------
// Copy region descriptions
//
// Aspects are deliberately absent: they derive from the image format at
// record time, so depth/stencil copies come out right without the caller
// spelling Vulkan aspect flags.

#[derive(Clone, Copy, Debug)]
pub struct SubresourceLayers {
    pub mip_level: u32,
    pub base_layer: u32,
    pub layer_count: u32,
}

impl Default for SubresourceLayers {
    fn default() -> Self {
        Self {
            mip_level: 0,
            base_layer: 0,
            layer_count: 1,
        }
    }
}

impl SubresourceLayers {
    fn to_vk(self, aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceLayers {
        vk::ImageSubresourceLayers {
            aspect_mask: aspect,
            mip_level: self.mip_level,
            base_array_layer: self.base_layer,
            layer_count: self.layer_count,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ImageCopyRegion {
    pub src_subresource: SubresourceLayers,
    pub src_offset: vk::Offset3D,
    pub dst_subresource: SubresourceLayers,
    pub dst_offset: vk::Offset3D,
    pub extent: vk::Extent3D,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BufferImageCopyRegion {
    pub buffer_offset: vk::DeviceSize,
    pub buffer_row_length: u32,
    pub buffer_image_height: u32,
    pub image_subresource: SubresourceLayers,
    pub image_offset: vk::Offset3D,
    pub image_extent: vk::Extent3D,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ImageBlitRegion {
    pub src_subresource: SubresourceLayers,
    pub src_offsets: [vk::Offset3D; 2],
    pub dst_subresource: SubresourceLayers,
    pub dst_offsets: [vk::Offset3D; 2],
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ImageResolveRegion {
    pub src_subresource: SubresourceLayers,
    pub src_offset: vk::Offset3D,
    pub dst_subresource: SubresourceLayers,
    pub dst_offset: vk::Offset3D,
    pub extent: vk::Extent3D,
}

// ---------------------------------------------------------------------------
// Deferred binding cache

/// A resource bound by (set, binding, array index), held as intent until
/// draw time.
pub(crate) enum BindingEntry {
    UniformBuffer {
        buffer: Arc<Buffer>,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    },
    StorageBuffer {
        buffer: Arc<Buffer>,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    },
    /// Sampled image, with a sampler when bound combined.
    Image {
        view: Arc<ImageView>,
        sampler: Option<Arc<Sampler>>,
    },
    StorageImage {
        view: Arc<ImageView>,
    },
    Sampler {
        sampler: Arc<Sampler>,
    },
    /// Push-style constants, copied into the huge constant buffer at
    /// resolution.
    Constants {
        data: Vec<u8>,
    },
}

#[derive(Default)]
pub(crate) struct SetCache {
    /// Identity of the layout the live set was written against; None when
    /// no set has been synthesized yet or the last pipeline conflicted.
    pub layout_id: Option<u64>,
    /// The set currently bound on the GPU for this index.
    pub live: Option<AllocatedSet>,
    pub dirty: bool,
    /// (binding, array index) -> bound resource.
    pub entries: BTreeMap<(u32, u32), BindingEntry>,
}

#[derive(Default)]
pub(crate) struct BindingCache {
    pub sets: BTreeMap<u32, SetCache>,
}

impl BindingCache {
    pub fn bind(&mut self, set: u32, binding: u32, index: u32, entry: BindingEntry) {
        let cache = self.sets.entry(set).or_default();
        cache.entries.insert((binding, index), entry);
        cache.dirty = true;
    }

    pub fn has_dirty(&self) -> bool {
        self.sets.values().any(|c| c.dirty)
    }

    /// React to a pipeline bind: evict sets the pipeline does not use and
    /// mark sets whose layout changed as conflicting. Returns the
    /// superseded descriptor sets for deferred free.
    pub fn on_pipeline_bound(&mut self, set_layout_ids: &[(u32, u64)]) -> Vec<AllocatedSet> {
        let used: HashMap<u32, u64> = set_layout_ids.iter().copied().collect();
        let mut freed = Vec::new();
        self.sets.retain(|set, cache| match used.get(set) {
            None => {
                if let Some(live) = cache.live.take() {
                    freed.push(live);
                }
                false
            }
            Some(&layout_id) => {
                if cache.layout_id != Some(layout_id) {
                    if let Some(live) = cache.live.take() {
                        freed.push(live);
                    }
                    cache.layout_id = None;
                    if !cache.entries.is_empty() {
                        cache.dirty = true;
                    }
                }
                true
            }
        });
        freed
    }
}

// ---------------------------------------------------------------------------
// Render-pass context

pub(crate) struct SubpassSlot {
    buffer: Option<CommandBufferLease>,
    tracker: AccessTracker,
    resources: HashMap<u64, RetainedResource>,
}

pub(crate) struct RenderPassShared {
    render_pass: Arc<RenderPass>,
    queue: Arc<CommandQueue>,
    /// One slot vector per subpass, grown under the mutex; a sub-context
    /// owns its reserved index until it finishes.
    slots: Vec<Mutex<Vec<SubpassSlot>>>,
}

impl RenderPassShared {
    fn reserve_slot(&self, subpass: u32) -> usize {
        let mut slots = self.slots[subpass as usize].lock();
        slots.push(SubpassSlot {
            buffer: None,
            tracker: AccessTracker::new(),
            resources: HashMap::new(),
        });
        slots.len() - 1
    }

    fn complete_slot(
        &self,
        subpass: u32,
        slot: usize,
        buffer: CommandBufferLease,
        tracker: AccessTracker,
        resources: HashMap<u64, RetainedResource>,
    ) {
        let mut slots = self.slots[subpass as usize].lock();
        let entry = &mut slots[slot];
        entry.buffer = Some(buffer);
        entry.tracker = tracker;
        entry.resources = resources;
    }
}

/// Orchestrates one render pass: derives the framebuffer, executes the
/// sub-contexts' secondary buffers subpass by subpass, and folds their
/// trackers into the section.
pub struct RenderPassContext {
    shared: Arc<RenderPassShared>,
    list: CommandList,
    clear_values: Vec<vk::ClearValue>,
    finished: bool,
}

impl RenderPassContext {
    pub(crate) fn new(
        list: CommandList,
        render_pass: Arc<RenderPass>,
        clear_values: Vec<vk::ClearValue>,
    ) -> Result<Self, RhiError> {
        activate_context(&list);

        let subpass_count = render_pass.subpass_count() as usize;
        let queue = list.queue().clone();
        Ok(Self {
            shared: Arc::new(RenderPassShared {
                render_pass,
                queue,
                slots: (0..subpass_count).map(|_| Mutex::new(Vec::new())).collect(),
            }),
            list,
            clear_values,
            finished: false,
        })
    }

    pub fn render_pass(&self) -> &Arc<RenderPass> {
        &self.shared.render_pass
    }

    /// Open a sub-context recording into the given subpass. Sub-contexts
    /// for one pass may record concurrently from different threads.
    pub fn create_render_context(&self, subpass: u32) -> Result<CommandContext, RhiError> {
        if subpass >= self.shared.render_pass.subpass_count() {
            usage_error!(
                "Subpass {} out of range for render pass {}",
                subpass,
                self.shared.render_pass.name()
            );
        }
        CommandContext::new_subpass(self.shared.clone(), subpass)
    }

    /// Finalize the pass: every sub-context must already be finished.
    pub fn finish_recording(mut self) -> Result<(), RhiError> {
        self.finished = true;

        let queue = self.shared.queue.clone();
        let device = queue.device().clone();
        let render_pass = &self.shared.render_pass;

        let work = queue.allocator().allocate(false)?;
        work.begin()?;
        let mut section = CommandListSection::new(work);

        let bundle = render_pass.make_framebuffer()?;
        for &semaphore in &bundle.wait_semaphores {
            section.wait_semaphores.push(semaphore);
            section
                .wait_stages
                .push(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT);
            device.add_post_frame_cleanup(Box::new(move |d: &crate::RenderDevice| unsafe {
                d.handle().destroy_semaphore(semaphore, None);
            }));
        }
        section.signal_semaphores = bundle.signal_semaphores.clone();
        let framebuffer = bundle.framebuffer;
        device.add_post_frame_cleanup(Box::new(move |d: &crate::RenderDevice| unsafe {
            d.handle().destroy_framebuffer(framebuffer, None);
        }));

        // The pass itself moves the attachments between layouts; the
        // tracker only needs to know what it assumes and what it leaves.
        let mut resources: HashMap<u64, RetainedResource> = HashMap::new();
        for attachment in &bundle.attachments {
            section.tracker.record_attachment(
                &attachment.image.tracking_info(),
                attachment.range,
                attachment.initial_state,
                attachment.final_state,
            );
            resources
                .entry(attachment.image.id())
                .or_insert_with(|| RetainedResource::Image(attachment.image.clone()));
        }

        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass.handle())
            .framebuffer(framebuffer)
            .render_area(render_pass.area())
            .clear_values(&self.clear_values);
        section.work_buffer.begin_render_pass(&begin_info);

        let subpass_count = render_pass.subpass_count();
        for subpass in 0..subpass_count {
            let slots = std::mem::take(&mut *self.shared.slots[subpass as usize].lock());
            let mut handles = Vec::with_capacity(slots.len());
            for slot in slots {
                let Some(buffer) = slot.buffer else {
                    usage_error!(
                        "A sub-context of subpass {} was not finished before the render pass",
                        subpass
                    );
                };
                handles.push(buffer.handle());
                section.secondary_buffers.push(buffer);
                section.tracker.merge(None, &slot.tracker);
                for (id, resource) in slot.resources {
                    resources.entry(id).or_insert(resource);
                }
            }

            if !handles.is_empty() {
                section.work_buffer.execute_commands(&handles);
            }
            if subpass + 1 < subpass_count {
                section.work_buffer.next_subpass();
            } else {
                section.work_buffer.end_render_pass();
            }
        }
        section.work_buffer.end()?;

        // Hazards between sub-contexts of one pass are the pass's subpass
        // dependencies' responsibility; nothing may be emitted in here.
        let _ = section.tracker.take_pending();

        push_section(&self.list, section, resources)?;
        self.list.inner.lock().context_active = false;
        Ok(())
    }
}

impl Drop for RenderPassContext {
    fn drop(&mut self) {
        if !self.finished && !std::thread::panicking() {
            usage_error!("Render pass context destroyed before finish_recording");
        }
    }
}

// ---------------------------------------------------------------------------
// Command context

enum ContextKind {
    Section { list: CommandList },
    Subpass {
        shared: Arc<RenderPassShared>,
        subpass: u32,
        slot: usize,
    },
}

/// Single-threaded recorder emitting GPU commands while keeping the access
/// tracker current.
pub struct CommandContext {
    kind: Option<ContextKind>,
    work: Option<CommandBufferLease>,
    tracker: AccessTracker,
    bindings: BindingCache,
    curr_pipeline: Option<Arc<Pipeline>>,
    resources: HashMap<u64, RetainedResource>,
    deferred_sets: Vec<AllocatedSet>,
    queue: Arc<CommandQueue>,
    on_copy_queue: bool,
    in_render_pass: bool,
    finished: bool,
}

impl CommandContext {
    pub(crate) fn new_generic(list: CommandList) -> Result<Self, RhiError> {
        activate_context(&list);

        let queue = list.queue().clone();
        let work = queue.allocator().allocate(false)?;
        work.begin()?;

        Ok(Self {
            kind: Some(ContextKind::Section { list }),
            work: Some(work),
            tracker: AccessTracker::new(),
            bindings: BindingCache::default(),
            curr_pipeline: None,
            resources: HashMap::new(),
            deferred_sets: Vec::new(),
            on_copy_queue: queue.is_copy_queue(),
            queue,
            in_render_pass: false,
            finished: false,
        })
    }

    pub(crate) fn new_subpass(
        shared: Arc<RenderPassShared>,
        subpass: u32,
    ) -> Result<Self, RhiError> {
        let slot = shared.reserve_slot(subpass);
        let queue = shared.queue.clone();

        let work = queue.allocator().allocate(true)?;
        work.begin_secondary(shared.render_pass.handle(), subpass)?;

        // Start from a full-area viewport and scissor; callers override.
        let area = shared.render_pass.area();
        work.set_viewport(vk::Viewport {
            x: area.offset.x as f32,
            y: area.offset.y as f32,
            width: area.extent.width as f32,
            height: area.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        });
        work.set_scissor(area);

        Ok(Self {
            kind: Some(ContextKind::Subpass {
                shared,
                subpass,
                slot,
            }),
            work: Some(work),
            tracker: AccessTracker::new(),
            bindings: BindingCache::default(),
            curr_pipeline: None,
            resources: HashMap::new(),
            deferred_sets: Vec::new(),
            on_copy_queue: queue.is_copy_queue(),
            queue,
            in_render_pass: true,
            finished: false,
        })
    }

    #[inline]
    fn cmd(&self) -> &CommandBufferLease {
        self.work.as_ref().expect("context already finished")
    }

    fn retain_buffer(&mut self, buffer: &Arc<Buffer>) {
        self.resources
            .entry(buffer.id())
            .or_insert_with(|| RetainedResource::Buffer(buffer.clone()));
    }

    fn retain_image(&mut self, image: &Arc<Image>) {
        self.resources
            .entry(image.id())
            .or_insert_with(|| RetainedResource::Image(image.clone()));
    }

    // -- Resource transitions ----------------------------------------------

    /// Transition every subresource of an image.
    pub fn transition_image(&mut self, image: &Arc<Image>, new_state: ResourceState) {
        self.transition_image_range(
            image,
            SubresourceRange::full(image.mip_levels(), image.array_layers()),
            new_state,
        );
    }

    /// Transition a subresource range of an image.
    pub fn transition_image_range(
        &mut self,
        image: &Arc<Image>,
        range: SubresourceRange,
        new_state: ResourceState,
    ) {
        self.retain_image(image);
        let on_cmd = if self.in_render_pass {
            None
        } else {
            self.work.as_ref()
        };
        self.tracker.transition_image_state(
            &image.tracking_info(),
            range,
            new_state,
            self.on_copy_queue,
            on_cmd,
        );
    }

    /// Transition a buffer.
    pub fn transition_buffer(&mut self, buffer: &Arc<Buffer>, new_state: ResourceState) {
        self.retain_buffer(buffer);
        let on_cmd = if self.in_render_pass {
            None
        } else {
            self.work.as_ref()
        };
        self.tracker
            .transition_buffer(&buffer.tracking_info(), new_state, on_cmd);
    }

    // -- Copies -------------------------------------------------------------

    pub fn copy_buffer(
        &mut self,
        src: &Arc<Buffer>,
        dst: &Arc<Buffer>,
        regions: &[vk::BufferCopy],
    ) {
        self.transition_buffer(src, ResourceState::CopySource);
        self.transition_buffer(dst, ResourceState::CopyDest);
        self.cmd().copy_buffer(src.handle(), dst.handle(), regions);
    }

    pub fn copy_image(&mut self, src: &Arc<Image>, dst: &Arc<Image>, regions: &[ImageCopyRegion]) {
        let vk_regions: Vec<vk::ImageCopy> = regions
            .iter()
            .map(|r| vk::ImageCopy {
                src_subresource: r.src_subresource.to_vk(src.aspect()),
                src_offset: r.src_offset,
                dst_subresource: r.dst_subresource.to_vk(dst.aspect()),
                dst_offset: r.dst_offset,
                extent: r.extent,
            })
            .collect();
        self.transition_image(src, ResourceState::CopySource);
        self.transition_image(dst, ResourceState::CopyDest);
        self.cmd().copy_image(src.handle(), dst.handle(), &vk_regions);
    }

    pub fn copy_buffer_to_image(
        &mut self,
        src: &Arc<Buffer>,
        dst: &Arc<Image>,
        regions: &[BufferImageCopyRegion],
    ) {
        let vk_regions: Vec<vk::BufferImageCopy> = regions
            .iter()
            .map(|r| vk::BufferImageCopy {
                buffer_offset: r.buffer_offset,
                buffer_row_length: r.buffer_row_length,
                buffer_image_height: r.buffer_image_height,
                image_subresource: r.image_subresource.to_vk(dst.aspect()),
                image_offset: r.image_offset,
                image_extent: r.image_extent,
            })
            .collect();
        self.transition_buffer(src, ResourceState::CopySource);
        self.transition_image(dst, ResourceState::CopyDest);
        self.cmd()
            .copy_buffer_to_image(src.handle(), dst.handle(), &vk_regions);
    }

    pub fn copy_image_to_buffer(
        &mut self,
        src: &Arc<Image>,
        dst: &Arc<Buffer>,
        regions: &[BufferImageCopyRegion],
    ) {
        let vk_regions: Vec<vk::BufferImageCopy> = regions
            .iter()
            .map(|r| vk::BufferImageCopy {
                buffer_offset: r.buffer_offset,
                buffer_row_length: r.buffer_row_length,
                buffer_image_height: r.buffer_image_height,
                image_subresource: r.image_subresource.to_vk(src.aspect()),
                image_offset: r.image_offset,
                image_extent: r.image_extent,
            })
            .collect();
        self.transition_image(src, ResourceState::CopySource);
        self.transition_buffer(dst, ResourceState::CopyDest);
        self.cmd()
            .copy_image_to_buffer(src.handle(), dst.handle(), &vk_regions);
    }

    pub fn blit_image(
        &mut self,
        src: &Arc<Image>,
        dst: &Arc<Image>,
        regions: &[ImageBlitRegion],
        filter: vk::Filter,
    ) {
        let vk_regions: Vec<vk::ImageBlit> = regions
            .iter()
            .map(|r| vk::ImageBlit {
                src_subresource: r.src_subresource.to_vk(src.aspect()),
                src_offsets: r.src_offsets,
                dst_subresource: r.dst_subresource.to_vk(dst.aspect()),
                dst_offsets: r.dst_offsets,
            })
            .collect();
        // Blitting one image into itself (mip generation) relies on the
        // caller transitioning the source and destination ranges; only
        // distinct images get the whole-image treatment here.
        if src.id() != dst.id() {
            self.transition_image(src, ResourceState::CopySource);
            self.transition_image(dst, ResourceState::CopyDest);
        } else {
            self.retain_image(src);
        }
        self.cmd()
            .blit_image(src.handle(), dst.handle(), &vk_regions, filter);
    }

    pub fn resolve_image(
        &mut self,
        src: &Arc<Image>,
        dst: &Arc<Image>,
        regions: &[ImageResolveRegion],
    ) {
        let vk_regions: Vec<vk::ImageResolve> = regions
            .iter()
            .map(|r| vk::ImageResolve {
                src_subresource: r.src_subresource.to_vk(src.aspect()),
                src_offset: r.src_offset,
                dst_subresource: r.dst_subresource.to_vk(dst.aspect()),
                dst_offset: r.dst_offset,
                extent: r.extent,
            })
            .collect();
        self.transition_image(src, ResourceState::CopySource);
        self.transition_image(dst, ResourceState::CopyDest);
        self.cmd()
            .resolve_image(src.handle(), dst.handle(), &vk_regions);
    }

    // -- Pipeline and descriptor binding ------------------------------------

    pub fn bind_compute_pipeline(&mut self, pipeline: &Arc<Pipeline>) {
        if pipeline.bind_point() != vk::PipelineBindPoint::COMPUTE {
            usage_error!("bind_compute_pipeline called with a graphics pipeline");
        }
        self.bind_pipeline_common(pipeline);
    }

    pub fn bind_render_pipeline(&mut self, pipeline: &Arc<Pipeline>) {
        if pipeline.bind_point() != vk::PipelineBindPoint::GRAPHICS {
            usage_error!("bind_render_pipeline called with a compute pipeline");
        }
        self.bind_pipeline_common(pipeline);
    }

    fn bind_pipeline_common(&mut self, pipeline: &Arc<Pipeline>) {
        let set_layout_ids: Vec<(u32, u64)> = pipeline
            .layout()
            .set_layouts()
            .iter()
            .enumerate()
            .map(|(i, layout)| (i as u32, layout.id()))
            .collect();
        let freed = self.bindings.on_pipeline_bound(&set_layout_ids);
        self.deferred_sets.extend(freed);

        self.cmd().bind_pipeline(pipeline.bind_point(), pipeline.handle());
        self.curr_pipeline = Some(pipeline.clone());
    }

    /// Explicit mode: bind a fully prepared descriptor set.
    pub fn bind_descriptor_set(&mut self, set: u32, descriptor_set: vk::DescriptorSet) {
        let Some(pipeline) = &self.curr_pipeline else {
            usage_error!("Cannot bind a descriptor set without a bound pipeline");
        };
        self.cmd().bind_descriptor_sets(
            pipeline.bind_point(),
            pipeline.layout().handle(),
            set,
            &[descriptor_set],
        );
        // Any cached set for this index no longer reflects GPU state.
        if let Some(cache) = self.bindings.sets.get_mut(&set) {
            if let Some(live) = cache.live.take() {
                self.deferred_sets.push(live);
            }
            cache.layout_id = None;
        }
    }

    /// Deferred mode: bind a uniform buffer range at (set, binding, index).
    pub fn bind_uniform_buffer(
        &mut self,
        set: u32,
        binding: u32,
        index: u32,
        buffer: &Arc<Buffer>,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    ) {
        self.retain_buffer(buffer);
        self.bindings.bind(
            set,
            binding,
            index,
            BindingEntry::UniformBuffer {
                buffer: buffer.clone(),
                offset,
                range,
            },
        );
    }

    pub fn bind_storage_buffer(
        &mut self,
        set: u32,
        binding: u32,
        index: u32,
        buffer: &Arc<Buffer>,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    ) {
        self.retain_buffer(buffer);
        self.bindings.bind(
            set,
            binding,
            index,
            BindingEntry::StorageBuffer {
                buffer: buffer.clone(),
                offset,
                range,
            },
        );
    }

    /// Bind a combined image sampler.
    pub fn bind_image(
        &mut self,
        set: u32,
        binding: u32,
        index: u32,
        view: &Arc<ImageView>,
        sampler: &Arc<Sampler>,
    ) {
        self.retain_image(view.image());
        self.bindings.bind(
            set,
            binding,
            index,
            BindingEntry::Image {
                view: view.clone(),
                sampler: Some(sampler.clone()),
            },
        );
    }

    /// Bind a sampled image without a sampler.
    pub fn bind_sampled_image(&mut self, set: u32, binding: u32, index: u32, view: &Arc<ImageView>) {
        self.retain_image(view.image());
        self.bindings.bind(
            set,
            binding,
            index,
            BindingEntry::Image {
                view: view.clone(),
                sampler: None,
            },
        );
    }

    pub fn bind_storage_image(&mut self, set: u32, binding: u32, index: u32, view: &Arc<ImageView>) {
        self.retain_image(view.image());
        self.bindings
            .bind(set, binding, index, BindingEntry::StorageImage { view: view.clone() });
    }

    pub fn bind_sampler(&mut self, set: u32, binding: u32, index: u32, sampler: &Arc<Sampler>) {
        self.bindings.bind(
            set,
            binding,
            index,
            BindingEntry::Sampler {
                sampler: sampler.clone(),
            },
        );
    }

    /// Bind push-style constants; the bytes land in the huge constant
    /// buffer when the next draw resolves its bindings.
    pub fn bind_constants(&mut self, set: u32, binding: u32, index: u32, data: &[u8]) {
        self.bindings.bind(
            set,
            binding,
            index,
            BindingEntry::Constants {
                data: data.to_vec(),
            },
        );
    }

    // -- Dynamic state -------------------------------------------------------

    pub fn set_viewport(&mut self, viewport: vk::Viewport) {
        self.cmd().set_viewport(viewport);
    }

    pub fn set_scissor(&mut self, scissor: vk::Rect2D) {
        self.cmd().set_scissor(scissor);
    }

    pub fn set_blend_constants(&mut self, constants: [f32; 4]) {
        self.cmd().set_blend_constants(constants);
    }

    pub fn set_stencil_reference(&mut self, reference: u32) {
        self.cmd().set_stencil_reference(reference);
    }

    // -- Vertex and index input ---------------------------------------------

    pub fn bind_vertex_buffer(&mut self, binding: u32, buffer: &Arc<Buffer>, offset: vk::DeviceSize) {
        self.retain_buffer(buffer);
        self.cmd()
            .bind_vertex_buffers(binding, &[buffer.handle()], &[offset]);
    }

    pub fn bind_index_buffer(
        &mut self,
        buffer: &Arc<Buffer>,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        self.retain_buffer(buffer);
        self.cmd().bind_index_buffer(buffer.handle(), offset, index_type);
    }

    // -- Draw and dispatch ---------------------------------------------------

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> Result<(), RhiError> {
        self.resolve_bindings()?;
        self.cmd()
            .draw(vertex_count, instance_count, first_vertex, first_instance);
        Ok(())
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> Result<(), RhiError> {
        self.resolve_bindings()?;
        self.cmd().draw_indexed(
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        );
        Ok(())
    }

    pub fn draw_indirect(
        &mut self,
        buffer: &Arc<Buffer>,
        offset: vk::DeviceSize,
        draw_count: u32,
        stride: u32,
    ) -> Result<(), RhiError> {
        self.resolve_bindings()?;
        self.retain_buffer(buffer);
        self.cmd()
            .draw_indirect(buffer.handle(), offset, draw_count, stride);
        Ok(())
    }

    pub fn draw_indexed_indirect(
        &mut self,
        buffer: &Arc<Buffer>,
        offset: vk::DeviceSize,
        draw_count: u32,
        stride: u32,
    ) -> Result<(), RhiError> {
        self.resolve_bindings()?;
        self.retain_buffer(buffer);
        self.cmd()
            .draw_indexed_indirect(buffer.handle(), offset, draw_count, stride);
        Ok(())
    }

    pub fn dispatch(
        &mut self,
        group_count_x: u32,
        group_count_y: u32,
        group_count_z: u32,
    ) -> Result<(), RhiError> {
        self.resolve_bindings()?;
        self.cmd().dispatch(group_count_x, group_count_y, group_count_z);
        Ok(())
    }

    pub fn dispatch_indirect(
        &mut self,
        buffer: &Arc<Buffer>,
        offset: vk::DeviceSize,
    ) -> Result<(), RhiError> {
        self.resolve_bindings()?;
        self.retain_buffer(buffer);
        self.cmd().dispatch_indirect(buffer.handle(), offset);
        Ok(())
    }

    // -- Deferred binding resolution ----------------------------------------

    /// Synthesize descriptor sets for every dirty or conflicting set and
    /// bind them, just in time for the draw that needed them.
    fn resolve_bindings(&mut self) -> Result<(), RhiError> {
        if !self.bindings.has_dirty() {
            return Ok(());
        }
        let Some(pipeline) = self.curr_pipeline.clone() else {
            usage_error!("Descriptor binding requires a bound pipeline");
        };

        let device = self.queue.device().clone();
        let min_align = device.min_uniform_offset_alignment();
        let bind_point = pipeline.bind_point();
        let pipe_layout = pipeline.layout().handle();

        for (&set_index, cache) in self.bindings.sets.iter_mut() {
            if !cache.dirty {
                continue;
            }
            let Some(layout) = pipeline.layout().set_layout(set_index) else {
                usage_error!("Pipeline has no descriptor set layout for set {}", set_index);
            };

            let allocated = layout.allocate_set()?;

            // Info arrays are fully reserved up front so the write records
            // can reference them without reallocation moving anything.
            let entry_count = cache.entries.len();
            let mut buffer_infos: Vec<vk::DescriptorBufferInfo> = Vec::with_capacity(entry_count);
            let mut image_infos: Vec<vk::DescriptorImageInfo> = Vec::with_capacity(entry_count);
            let mut records: Vec<(u32, u32, vk::DescriptorType, bool, usize)> =
                Vec::with_capacity(entry_count);

            for (&(binding, array_index), entry) in &cache.entries {
                let Some(layout_binding) = layout.get_binding(binding) else {
                    usage_error!(
                        "Binding {} not present in the layout of set {}",
                        binding,
                        set_index
                    );
                };
                let stages =
                    shader_stages_to_pipeline_stages(layout_binding.stage_flags);
                let descriptor_type = layout_binding.descriptor_type;

                match entry {
                    BindingEntry::UniformBuffer {
                        buffer,
                        offset,
                        range,
                    } => {
                        self.tracker.transition_buffer_with(
                            &buffer.tracking_info(),
                            StateRecord {
                                state: ResourceState::ShaderResource,
                                stages,
                                access: vk::AccessFlags2::UNIFORM_READ,
                            },
                            if self.in_render_pass { None } else { self.work.as_ref() },
                        );
                        buffer_infos.push(
                            vk::DescriptorBufferInfo::default()
                                .buffer(buffer.handle())
                                .offset(*offset)
                                .range(*range),
                        );
                        records.push((
                            binding,
                            array_index,
                            descriptor_type,
                            true,
                            buffer_infos.len() - 1,
                        ));
                    }
                    BindingEntry::StorageBuffer {
                        buffer,
                        offset,
                        range,
                    } => {
                        self.tracker.transition_buffer_with(
                            &buffer.tracking_info(),
                            StateRecord {
                                state: ResourceState::General,
                                stages,
                                access: vk::AccessFlags2::SHADER_STORAGE_READ
                                    | vk::AccessFlags2::SHADER_STORAGE_WRITE,
                            },
                            if self.in_render_pass { None } else { self.work.as_ref() },
                        );
                        buffer_infos.push(
                            vk::DescriptorBufferInfo::default()
                                .buffer(buffer.handle())
                                .offset(*offset)
                                .range(*range),
                        );
                        records.push((
                            binding,
                            array_index,
                            descriptor_type,
                            true,
                            buffer_infos.len() - 1,
                        ));
                    }
                    BindingEntry::Image { view, sampler } => {
                        // Depth and stencil views sample in the read-only
                        // depth layout; color views in shader-read-only.
                        let is_depth = view.aspect().intersects(
                            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
                        );
                        let (state, layout_vk) = if is_depth {
                            (
                                ResourceState::DepthRead,
                                vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
                            )
                        } else {
                            (
                                ResourceState::ShaderResource,
                                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                            )
                        };
                        self.tracker.transition_image(
                            &view.image().tracking_info(),
                            view.range(),
                            StateRecord {
                                state,
                                stages,
                                access: vk::AccessFlags2::SHADER_READ,
                            },
                            self.on_copy_queue,
                            if self.in_render_pass { None } else { self.work.as_ref() },
                        );
                        image_infos.push(view.to_binding(
                            sampler.as_ref().map(|s| s.handle()).unwrap_or_default(),
                            layout_vk,
                        ));
                        records.push((
                            binding,
                            array_index,
                            descriptor_type,
                            false,
                            image_infos.len() - 1,
                        ));
                    }
                    BindingEntry::StorageImage { view } => {
                        self.tracker.transition_image(
                            &view.image().tracking_info(),
                            view.range(),
                            StateRecord {
                                state: ResourceState::General,
                                stages,
                                access: vk::AccessFlags2::SHADER_STORAGE_READ
                                    | vk::AccessFlags2::SHADER_STORAGE_WRITE,
                            },
                            self.on_copy_queue,
                            if self.in_render_pass { None } else { self.work.as_ref() },
                        );
                        image_infos
                            .push(view.to_binding(vk::Sampler::null(), vk::ImageLayout::GENERAL));
                        records.push((
                            binding,
                            array_index,
                            descriptor_type,
                            false,
                            image_infos.len() - 1,
                        ));
                    }
                    BindingEntry::Sampler { sampler } => {
                        image_infos.push(
                            vk::DescriptorImageInfo::default().sampler(sampler.handle()),
                        );
                        records.push((
                            binding,
                            array_index,
                            descriptor_type,
                            false,
                            image_infos.len() - 1,
                        ));
                    }
                    BindingEntry::Constants { data } => {
                        let allocation = device.huge_constant_buffer().allocate(data, min_align)?;
                        buffer_infos.push(
                            vk::DescriptorBufferInfo::default()
                                .buffer(device.huge_constant_buffer().handle())
                                .offset(allocation.offset)
                                .range(allocation.size),
                        );
                        records.push((
                            binding,
                            array_index,
                            descriptor_type,
                            true,
                            buffer_infos.len() - 1,
                        ));
                    }
                }
            }

            let writes: Vec<vk::WriteDescriptorSet> = records
                .iter()
                .map(|&(binding, array_index, descriptor_type, is_buffer, info_index)| {
                    let write = vk::WriteDescriptorSet::default()
                        .dst_set(allocated.set)
                        .dst_binding(binding)
                        .dst_array_element(array_index)
                        .descriptor_type(descriptor_type);
                    if is_buffer {
                        write.buffer_info(std::slice::from_ref(&buffer_infos[info_index]))
                    } else {
                        write.image_info(std::slice::from_ref(&image_infos[info_index]))
                    }
                })
                .collect();

            if !writes.is_empty() {
                unsafe {
                    device.handle().update_descriptor_sets(&writes, &[]);
                }
            }

            self.work.as_ref().expect("context already finished").bind_descriptor_sets(
                bind_point,
                pipe_layout,
                set_index,
                &[allocated.set],
            );

            if let Some(previous) = cache.live.replace(allocated) {
                self.deferred_sets.push(previous);
            }
            cache.layout_id = Some(layout.id());
            cache.dirty = false;
        }

        Ok(())
    }

    // -- Finish --------------------------------------------------------------

    /// Close the context. A generic context seals its section into the
    /// list; a sub-context parks its secondary buffer for the render-pass
    /// context to execute.
    pub fn finish_recording(mut self) -> Result<(), RhiError> {
        self.finished = true;

        let work = self.work.take().expect("context finished twice");
        work.end()?;

        let tracker = std::mem::take(&mut self.tracker);
        let resources = std::mem::take(&mut self.resources);
        let deferred_sets = std::mem::take(&mut self.deferred_sets);

        match self.kind.take().expect("context finished twice") {
            ContextKind::Section { list } => {
                let mut section = CommandListSection::new(work);
                section.tracker = tracker;
                section.deferred_sets = deferred_sets;
                push_section(&list, section, resources)?;
                list.inner.lock().context_active = false;
            }
            ContextKind::Subpass {
                shared,
                subpass,
                slot,
            } => {
                shared.complete_slot(subpass, slot, work, tracker, resources);
                // Superseded sets of a sub-context outlive the pass via the
                // post-frame cleanup funnel.
                let device = self.queue.device();
                for set in deferred_sets {
                    device.add_post_frame_cleanup(Box::new(move |d: &crate::RenderDevice| {
                        set.free(d.handle());
                    }));
                }
            }
        }
        Ok(())
    }
}

impl Drop for CommandContext {
    fn drop(&mut self) {
        if !self.finished && !std::thread::panicking() {
            usage_error!("Command context destroyed before finish_recording");
        }
    }
}

fn activate_context(list: &CommandList) {
    let mut inner = list.inner.lock();
    if inner.state != crate::command_list::CommandListState::Recording {
        usage_error!("A committed command list can no longer be recorded into");
    }
    if inner.context_active {
        usage_error!("One context is already active on this command list");
    }
    inner.context_active = true;
}

/// Append a finished section to its list. When earlier sections exist, the
/// first section's tracker absorbs the new one's states and the
/// compensating barriers become the new section's pre-buffer.
pub(crate) fn push_section(
    list: &CommandList,
    mut section: CommandListSection,
    resources: HashMap<u64, RetainedResource>,
) -> Result<(), RhiError> {
    let queue = list.queue().clone();
    let mut inner = list.inner.lock();

    for (id, resource) in resources {
        inner.resources.entry(id).or_insert(resource);
    }

    if let Some(first) = inner.sections.first_mut() {
        first.tracker.merge(None, &section.tracker);
        let batch = first.tracker.take_pending();
        if !batch.is_empty() {
            let pre = queue.allocator().allocate(false)?;
            pre.begin()?;
            pre.record_barriers(&batch);
            pre.end()?;
            section.pre_buffer = Some(pre);
        }
        section.tracker.clear();
    }

    inner.sections.push(section);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constants(bytes: &[u8]) -> BindingEntry {
        BindingEntry::Constants {
            data: bytes.to_vec(),
        }
    }

    #[test]
    fn test_binding_marks_set_dirty() {
        let mut cache = BindingCache::default();
        assert!(!cache.has_dirty());

        cache.bind(0, 3, 0, constants(&[0; 16]));
        assert!(cache.has_dirty());
        assert!(cache.sets.get(&0).unwrap().dirty);
    }

    #[test]
    fn test_pipeline_conflict_forces_reallocation() {
        let mut cache = BindingCache::default();
        cache.bind(0, 3, 0, constants(&[0; 16]));

        // First pipeline: set 0 uses layout 10; pretend resolution ran.
        cache.on_pipeline_bound(&[(0, 10)]);
        let set0 = cache.sets.get_mut(&0).unwrap();
        set0.dirty = false;
        set0.layout_id = Some(10);

        // Same layout again: nothing to redo.
        cache.on_pipeline_bound(&[(0, 10)]);
        assert!(!cache.sets.get(&0).unwrap().dirty);

        // A pipeline with a different set 0 layout conflicts.
        cache.on_pipeline_bound(&[(0, 11)]);
        let set0 = cache.sets.get(&0).unwrap();
        assert!(set0.dirty);
        assert_eq!(set0.layout_id, None);
    }

    #[test]
    fn test_unused_sets_are_evicted() {
        let mut cache = BindingCache::default();
        cache.bind(0, 0, 0, constants(&[0; 4]));
        cache.bind(2, 1, 0, constants(&[0; 4]));

        // The new pipeline only has set 0.
        cache.on_pipeline_bound(&[(0, 10)]);
        assert!(cache.sets.contains_key(&0));
        assert!(!cache.sets.contains_key(&2));
    }

    #[test]
    fn test_conflict_queues_live_set_for_deferred_free() {
        let mut cache = BindingCache::default();
        cache.bind(0, 3, 0, constants(&[0; 16]));
        cache.on_pipeline_bound(&[(0, 10)]);
        {
            let set0 = cache.sets.get_mut(&0).unwrap();
            set0.dirty = false;
            set0.layout_id = Some(10);
            set0.live = Some(AllocatedSet {
                set: vk::DescriptorSet::null(),
                pool: vk::DescriptorPool::null(),
            });
        }

        let freed = cache.on_pipeline_bound(&[(0, 11)]);
        assert_eq!(freed.len(), 1);
        assert!(cache.sets.get(&0).unwrap().live.is_none());
    }
}
