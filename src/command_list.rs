//! Command lists: ordered sections plus the resources they keep alive.
//!
//! A section pairs an optional pre-barrier buffer with a work buffer and
//! the access tracker that recorded into it. Sections execute GPU-side in
//! insertion order; a section's pre-buffer runs strictly before its work
//! buffer. The first section's tracker is the aggregate the queue settles
//! against the device-global resource states when the list is drained.

use ash::vk;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::barrier::{BarrierBatch, BufferBarrier, ImageBarrier, StateRecord};
use crate::buffer::Buffer;
use crate::command::CommandBufferLease;
use crate::context::{CommandContext, RenderPassContext};
use crate::descriptor::AllocatedSet;
use crate::error::{usage_error, RhiError};
use crate::image::{Image, SubresourceRange};
use crate::queue::CommandQueue;
use crate::render_pass::RenderPass;
use crate::tracker::{coalesce_image_barriers, AccessTracker};

/// Lifecycle of a command list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandListState {
    Recording,
    Committed,
    InFlight,
    Retired,
}

/// A strong reference held until the owning frame's fence signals.
pub(crate) enum RetainedResource {
    Buffer(Arc<Buffer>),
    Image(Arc<Image>),
}

/// One recording unit: pre-barrier buffer, work buffer, tracker.
pub(crate) struct CommandListSection {
    pub pre_buffer: Option<CommandBufferLease>,
    pub work_buffer: CommandBufferLease,
    pub tracker: AccessTracker,
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub wait_stages: Vec<vk::PipelineStageFlags2>,
    pub signal_semaphores: Vec<vk::Semaphore>,
    /// Secondary buffers executed by the work buffer, kept for lifetime.
    pub secondary_buffers: Vec<CommandBufferLease>,
    /// Descriptor sets superseded during recording, freed at retirement.
    pub deferred_sets: Vec<AllocatedSet>,
}

impl CommandListSection {
    pub(crate) fn new(work_buffer: CommandBufferLease) -> Self {
        Self {
            pre_buffer: None,
            work_buffer,
            tracker: AccessTracker::new(),
            wait_semaphores: Vec::new(),
            wait_stages: Vec::new(),
            signal_semaphores: Vec::new(),
            secondary_buffers: Vec::new(),
            deferred_sets: Vec::new(),
        }
    }
}

pub(crate) struct ListState {
    pub state: CommandListState,
    pub sections: Vec<CommandListSection>,
    pub context_active: bool,
    pub resources: HashMap<u64, RetainedResource>,
}

/// Everything the queue needs to build one section's submit batch.
pub(crate) struct SectionSubmitData {
    pub pre: Option<vk::CommandBuffer>,
    pub work: vk::CommandBuffer,
    pub waits: Vec<(vk::Semaphore, vk::PipelineStageFlags2)>,
    pub signals: Vec<vk::Semaphore>,
}

/// A handle-based command list bound to one queue.
#[derive(Clone)]
pub struct CommandList {
    pub(crate) inner: Arc<Mutex<ListState>>,
    queue: Arc<CommandQueue>,
}

impl CommandList {
    pub(crate) fn new(queue: Arc<CommandQueue>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ListState {
                state: CommandListState::Recording,
                sections: Vec::new(),
                context_active: false,
                resources: HashMap::new(),
            })),
            queue,
        }
    }

    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }

    /// Register with the owning queue without committing.
    pub fn enqueue(&self) {
        self.queue.enqueue(self.clone());
    }

    pub fn state(&self) -> CommandListState {
        self.inner.lock().state
    }

    pub fn is_committed(&self) -> bool {
        self.inner.lock().state != CommandListState::Recording
    }

    /// Open a context for copy recording.
    pub fn create_copy_context(&self) -> Result<CommandContext, RhiError> {
        CommandContext::new_generic(self.clone())
    }

    /// Open a context for compute recording.
    pub fn create_compute_context(&self) -> Result<CommandContext, RhiError> {
        CommandContext::new_generic(self.clone())
    }

    /// Open a render-pass context. Per-subpass sub-contexts are created
    /// from the returned object.
    pub fn create_render_pass_context(
        &self,
        render_pass: Arc<RenderPass>,
        clear_values: Vec<vk::ClearValue>,
    ) -> Result<RenderPassContext, RhiError> {
        RenderPassContext::new(self.clone(), render_pass, clear_values)
    }

    /// Seal the list. No further recording is possible.
    pub fn commit(&self) {
        let mut inner = self.inner.lock();
        if inner.context_active {
            usage_error!("Cannot commit a command list while a context is active");
        }
        if inner.sections.is_empty() {
            usage_error!("Cannot commit a command list with no sections");
        }
        if inner.state != CommandListState::Recording {
            usage_error!("Command list committed twice");
        }
        inner.state = CommandListState::Committed;
    }

    /// Settle the aggregate tracker against the device-global resource
    /// states: compensating barriers go into the first section's
    /// pre-buffer and each touched resource adopts its final state.
    ///
    /// The queue calls this under its own mutex while draining, so global
    /// state updates happen in submission order.
    pub(crate) fn finalize_for_submit(&self) -> Result<(), RhiError> {
        let mut inner = self.inner.lock();
        debug_assert_eq!(inner.state, CommandListState::Committed);

        let ListState {
            sections, resources, ..
        } = &mut *inner;
        let Some(first) = sections.first_mut() else {
            return Ok(());
        };

        let mut batch = BarrierBatch::default();

        for (info, initial, current) in first.tracker.buffer_states() {
            let Some(RetainedResource::Buffer(buffer)) = resources.get(&info.id) else {
                continue;
            };
            let global = buffer.global_state();
            if global != initial.state {
                batch.buffers.push(BufferBarrier {
                    buffer: info.handle,
                    resource_id: info.id,
                    src: StateRecord::of(global),
                    dst: initial,
                    offset: 0,
                    size: vk::WHOLE_SIZE,
                    src_queue_family: vk::QUEUE_FAMILY_IGNORED,
                    dst_queue_family: vk::QUEUE_FAMILY_IGNORED,
                });
            }
            buffer.set_global_state(current.state);
        }

        let mut image_barriers: Vec<ImageBarrier> = Vec::new();
        for (info, mip, layer, initial, current) in first.tracker.image_subresource_states() {
            let Some(RetainedResource::Image(image)) = resources.get(&info.id) else {
                continue;
            };
            let global = image.global_state(mip, layer);
            if global != initial.state {
                image_barriers.push(ImageBarrier {
                    image: info.handle,
                    resource_id: info.id,
                    src: StateRecord::of(global),
                    dst: initial,
                    aspect: info.aspect,
                    base_mip: mip,
                    level_count: 1,
                    base_layer: layer,
                    layer_count: 1,
                    src_queue_family: vk::QUEUE_FAMILY_IGNORED,
                    dst_queue_family: vk::QUEUE_FAMILY_IGNORED,
                });
            }
            image.set_global_state(SubresourceRange::single(mip, layer), current.state);
        }
        batch.images = coalesce_image_barriers(image_barriers);

        if !batch.is_empty() {
            batch.sort();
            let pre = self.queue.allocator().allocate(false)?;
            pre.begin()?;
            pre.record_barriers(&batch);
            pre.end()?;
            first.pre_buffer = Some(pre);
        }

        inner.state = CommandListState::InFlight;
        Ok(())
    }

    pub(crate) fn submit_data(&self) -> Vec<SectionSubmitData> {
        let inner = self.inner.lock();
        inner
            .sections
            .iter()
            .map(|section| SectionSubmitData {
                pre: section.pre_buffer.as_ref().map(|b| b.handle()),
                work: section.work_buffer.handle(),
                waits: section
                    .wait_semaphores
                    .iter()
                    .copied()
                    .zip(section.wait_stages.iter().copied())
                    .collect(),
                signals: section.signal_semaphores.clone(),
            })
            .collect()
    }

    /// Drop every reference recorded during recording. Called by the
    /// frame slot once its fence has signaled.
    pub(crate) fn release_all_resources(&self) {
        let mut inner = self.inner.lock();
        let device = self.queue.device().handle().clone();
        for section in inner.sections.drain(..) {
            for set in section.deferred_sets {
                set.free(&device);
            }
        }
        inner.resources.clear();
        inner.state = CommandListState::Retired;
    }
}
