//! Automatic resource state tracking and barrier computation.
//!
//! Every command-list section owns one [`AccessTracker`]. While the
//! section records, the tracker remembers two things per touched
//! subresource: the state the section *assumed on first touch* (its
//! initial state) and the state it left the subresource in (its current
//! state). Intra-section state changes emit barriers right away; the
//! first touch never does, because only the queue knows, at submit time,
//! what state the resource is actually in. Merging a section's tracker
//! into an earlier one closes that gap: wherever the earlier tracker's
//! current state disagrees with the later section's initial state, a
//! compensating barrier is written into the later section's pre-buffer.

use ash::vk;
use std::collections::HashMap;

use crate::barrier::{BarrierBatch, BufferBarrier, ImageBarrier, ResourceState, StateRecord};
use crate::buffer::{buffer_supports_state, BufferInfo};
use crate::command::CommandBufferLease;
use crate::error::usage_error;
use crate::image::{image_supports_state, ImageInfo, SubresourceRange};

#[derive(Clone, Copy, Debug)]
struct SubStates {
    initial: StateRecord,
    current: StateRecord,
}

struct BufferEntry {
    info: BufferInfo,
    states: SubStates,
}

struct ImageEntry {
    info: ImageInfo,
    /// Indexed mip * array_layers + layer; None = untouched by this section.
    subresources: Vec<Option<SubStates>>,
}

impl ImageEntry {
    fn index(&self, mip: u32, layer: u32) -> usize {
        (mip * self.info.array_layers + layer) as usize
    }
}

/// Per-section map of the most recent recorded state per subresource,
/// plus the list of barriers waiting for a deploy target.
#[derive(Default)]
pub struct AccessTracker {
    buffers: HashMap<u64, BufferEntry>,
    images: HashMap<u64, ImageEntry>,
    pending: BarrierBatch,
}

impl AccessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty() && self.images.is_empty() && self.pending.is_empty()
    }

    /// Record a buffer transition. With a command buffer present the
    /// barrier is written immediately; otherwise it is retained as
    /// pending until [`deploy_all_barriers`](Self::deploy_all_barriers).
    pub fn transition_buffer(
        &mut self,
        info: &BufferInfo,
        new_state: ResourceState,
        on_cmd: Option<&CommandBufferLease>,
    ) {
        self.transition_buffer_with(info, StateRecord::of(new_state), on_cmd)
    }

    /// Buffer variant with explicit stage/access masks, used by descriptor
    /// binding where the consuming shader stages are known.
    pub(crate) fn transition_buffer_with(
        &mut self,
        info: &BufferInfo,
        dst: StateRecord,
        on_cmd: Option<&CommandBufferLease>,
    ) {
        if !buffer_supports_state(info.usage, dst.state) {
            usage_error!(
                "Buffer {} cannot reach state {:?} with usage {:?}",
                info.id,
                dst.state,
                info.usage
            );
        }

        let mut batch = BarrierBatch::default();
        match self.buffers.get_mut(&info.id) {
            None => {
                // First touch: the commit-time merge against the device-global
                // state supplies whatever barrier this assumption needs.
                self.buffers.insert(
                    info.id,
                    BufferEntry {
                        info: *info,
                        states: SubStates {
                            initial: dst,
                            current: dst,
                        },
                    },
                );
            }
            Some(entry) => {
                if entry.states.current.state != dst.state {
                    batch.buffers.push(BufferBarrier {
                        buffer: info.handle,
                        resource_id: info.id,
                        src: entry.states.current,
                        dst,
                        offset: 0,
                        size: vk::WHOLE_SIZE,
                        src_queue_family: vk::QUEUE_FAMILY_IGNORED,
                        dst_queue_family: vk::QUEUE_FAMILY_IGNORED,
                    });
                }
                entry.states.current = dst;
            }
        }
        self.emit(batch, on_cmd);
    }

    /// Record an image transition over a subresource range, splitting the
    /// range wherever current subresource states differ.
    ///
    /// On a Copy queue only transfer-compatible destinations are legal.
    pub fn transition_image_state(
        &mut self,
        info: &ImageInfo,
        range: SubresourceRange,
        new_state: ResourceState,
        on_transfer_queue: bool,
        on_cmd: Option<&CommandBufferLease>,
    ) {
        self.transition_image(info, range, StateRecord::of(new_state), on_transfer_queue, on_cmd)
    }

    /// Low-level variant with explicit stage/access masks, used by
    /// descriptor binding where the consuming shader stages are known.
    pub fn transition_image(
        &mut self,
        info: &ImageInfo,
        range: SubresourceRange,
        dst: StateRecord,
        on_transfer_queue: bool,
        on_cmd: Option<&CommandBufferLease>,
    ) {
        if info.tracking_disabled {
            return;
        }
        if !image_supports_state(info.usage, info.is_swapchain, dst.state) {
            usage_error!(
                "Image {} cannot reach state {:?} with usage {:?}",
                info.id,
                dst.state,
                info.usage
            );
        }
        if on_transfer_queue && !dst.state.is_transfer_compatible() {
            usage_error!(
                "Image {} transition to {:?} is not legal on a copy queue",
                info.id,
                dst.state
            );
        }

        let entry = self.images.entry(info.id).or_insert_with(|| ImageEntry {
            info: *info,
            subresources: vec![None; (info.mip_levels * info.array_layers) as usize],
        });

        let mut barriers: Vec<ImageBarrier> = Vec::new();
        for mip in range.base_mip..range.base_mip + range.level_count {
            for layer in range.base_layer..range.base_layer + range.layer_count {
                let idx = entry.index(mip, layer);
                match entry.subresources[idx] {
                    None => {
                        entry.subresources[idx] = Some(SubStates {
                            initial: dst,
                            current: dst,
                        });
                    }
                    Some(ref mut sub) => {
                        if sub.current.state != dst.state {
                            barriers.push(ImageBarrier {
                                image: info.handle,
                                resource_id: info.id,
                                src: sub.current,
                                dst,
                                aspect: info.aspect,
                                base_mip: mip,
                                level_count: 1,
                                base_layer: layer,
                                layer_count: 1,
                                src_queue_family: vk::QUEUE_FAMILY_IGNORED,
                                dst_queue_family: vk::QUEUE_FAMILY_IGNORED,
                            });
                        }
                        sub.current = dst;
                    }
                }
            }
        }

        let mut batch = BarrierBatch::default();
        batch.images = coalesce_image_barriers(barriers);
        self.emit(batch, on_cmd);
    }

    /// Record a transition the GPU performs on its own (a render pass's
    /// attachment layout handling): the section assumes `initial` at
    /// entry and leaves `final_state` behind, with no barrier of ours.
    pub(crate) fn record_attachment(
        &mut self,
        info: &ImageInfo,
        range: SubresourceRange,
        initial: ResourceState,
        final_state: ResourceState,
    ) {
        if info.tracking_disabled {
            return;
        }
        if !image_supports_state(info.usage, info.is_swapchain, final_state) {
            usage_error!(
                "Image {} cannot be an attachment in state {:?} with usage {:?}",
                info.id,
                final_state,
                info.usage
            );
        }

        let entry = self.images.entry(info.id).or_insert_with(|| ImageEntry {
            info: *info,
            subresources: vec![None; (info.mip_levels * info.array_layers) as usize],
        });
        for mip in range.base_mip..range.base_mip + range.level_count {
            for layer in range.base_layer..range.base_layer + range.layer_count {
                let idx = entry.index(mip, layer);
                match entry.subresources[idx] {
                    None => {
                        entry.subresources[idx] = Some(SubStates {
                            initial: StateRecord::of(initial),
                            current: StateRecord::of(final_state),
                        });
                    }
                    Some(ref mut sub) => {
                        sub.current = StateRecord::of(final_state);
                    }
                }
            }
        }
    }

    /// Absorb `other`'s final states. Wherever this tracker's current
    /// state disagrees with `other`'s first recorded state, emit the
    /// compensating barrier; then adopt `other`'s final states.
    ///
    /// A `None` target is only legal where barrier emission is forbidden
    /// (inside a render pass); the barriers land in the pending list and
    /// the adopted states carry the obligation up the section chain.
    pub fn merge(&mut self, on_cmd: Option<&CommandBufferLease>, other: &AccessTracker) {
        let mut batch = BarrierBatch::default();

        for (id, other_entry) in &other.buffers {
            match self.buffers.get_mut(id) {
                None => {
                    self.buffers.insert(
                        *id,
                        BufferEntry {
                            info: other_entry.info,
                            states: other_entry.states,
                        },
                    );
                }
                Some(entry) => {
                    if entry.states.current.state != other_entry.states.initial.state {
                        batch.buffers.push(BufferBarrier {
                            buffer: entry.info.handle,
                            resource_id: *id,
                            src: entry.states.current,
                            dst: other_entry.states.initial,
                            offset: 0,
                            size: vk::WHOLE_SIZE,
                            src_queue_family: vk::QUEUE_FAMILY_IGNORED,
                            dst_queue_family: vk::QUEUE_FAMILY_IGNORED,
                        });
                    }
                    entry.states.current = other_entry.states.current;
                }
            }
        }

        for (id, other_entry) in &other.images {
            let entry = self.images.entry(*id).or_insert_with(|| ImageEntry {
                info: other_entry.info,
                subresources: vec![None; other_entry.subresources.len()],
            });

            let mut barriers: Vec<ImageBarrier> = Vec::new();
            for mip in 0..other_entry.info.mip_levels {
                for layer in 0..other_entry.info.array_layers {
                    let idx = other_entry.index(mip, layer);
                    let Some(other_sub) = other_entry.subresources[idx] else {
                        continue;
                    };
                    match entry.subresources[idx] {
                        None => {
                            entry.subresources[idx] = Some(other_sub);
                        }
                        Some(ref mut sub) => {
                            if sub.current.state != other_sub.initial.state {
                                barriers.push(ImageBarrier {
                                    image: entry.info.handle,
                                    resource_id: *id,
                                    src: sub.current,
                                    dst: other_sub.initial,
                                    aspect: entry.info.aspect,
                                    base_mip: mip,
                                    level_count: 1,
                                    base_layer: layer,
                                    layer_count: 1,
                                    src_queue_family: vk::QUEUE_FAMILY_IGNORED,
                                    dst_queue_family: vk::QUEUE_FAMILY_IGNORED,
                                });
                            }
                            sub.current = other_sub.current;
                        }
                    }
                }
            }
            batch.images.extend(coalesce_image_barriers(barriers));
        }

        self.emit(batch, on_cmd);
    }

    /// Write every pending barrier into `cmd` as one batch.
    pub fn deploy_all_barriers(&mut self, cmd: &CommandBufferLease) {
        let mut batch = std::mem::take(&mut self.pending);
        if batch.is_empty() {
            return;
        }
        batch.sort();
        cmd.record_barriers(&batch);
    }

    /// Take the pending barriers without recording them.
    pub fn take_pending(&mut self) -> BarrierBatch {
        let mut batch = std::mem::take(&mut self.pending);
        batch.sort();
        batch
    }

    /// Forget all state. Used once a section's barriers have been
    /// promoted into a pre-buffer.
    pub fn clear(&mut self) {
        self.buffers.clear();
        self.images.clear();
        self.pending = BarrierBatch::default();
    }

    /// Iterate (info, initial, current) over touched buffers.
    pub(crate) fn buffer_states(
        &self,
    ) -> impl Iterator<Item = (&BufferInfo, StateRecord, StateRecord)> {
        self.buffers
            .values()
            .map(|e| (&e.info, e.states.initial, e.states.current))
    }

    /// Iterate (info, mip, layer, initial, current) over touched image
    /// subresources.
    pub(crate) fn image_subresource_states(
        &self,
    ) -> impl Iterator<Item = (&ImageInfo, u32, u32, StateRecord, StateRecord)> {
        self.images.values().flat_map(|e| {
            let info = &e.info;
            (0..info.mip_levels).flat_map(move |mip| {
                (0..info.array_layers).filter_map(move |layer| {
                    e.subresources[(mip * info.array_layers + layer) as usize]
                        .map(|sub| (info, mip, layer, sub.initial, sub.current))
                })
            })
        })
    }

    fn emit(&mut self, mut batch: BarrierBatch, on_cmd: Option<&CommandBufferLease>) {
        if batch.is_empty() {
            return;
        }
        match on_cmd {
            Some(cmd) => {
                batch.sort();
                cmd.record_barriers(&batch);
            }
            None => self.pending.extend(batch),
        }
    }
}

/// Collapse per-subresource barriers back into homogeneous runs: adjacent
/// layers within a mip first, then whole-mip runs with identical layer
/// spans and states.
pub(crate) fn coalesce_image_barriers(mut barriers: Vec<ImageBarrier>) -> Vec<ImageBarrier> {
    if barriers.len() < 2 {
        return barriers;
    }
    barriers.sort_by_key(|b| (b.resource_id, b.base_mip, b.base_layer));

    let same_transition = |a: &ImageBarrier, b: &ImageBarrier| {
        a.resource_id == b.resource_id && a.src == b.src && a.dst == b.dst && a.aspect == b.aspect
    };

    let mut layered: Vec<ImageBarrier> = Vec::with_capacity(barriers.len());
    for b in barriers {
        match layered.last_mut() {
            Some(last)
                if same_transition(last, &b)
                    && last.base_mip == b.base_mip
                    && last.base_layer + last.layer_count == b.base_layer =>
            {
                last.layer_count += b.layer_count;
            }
            _ => layered.push(b),
        }
    }

    let mut out: Vec<ImageBarrier> = Vec::with_capacity(layered.len());
    for b in layered {
        match out.last_mut() {
            Some(last)
                if same_transition(last, &b)
                    && last.base_layer == b.base_layer
                    && last.layer_count == b.layer_count
                    && last.base_mip + last.level_count == b.base_mip =>
            {
                last.level_count += b.level_count;
            }
            _ => out.push(b),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageUsage;
    use crate::buffer::BufferUsage;
    use enumflags2::BitFlags;

    fn image_info(id: u64, mips: u32, layers: u32, usage: BitFlags<ImageUsage>) -> ImageInfo {
        ImageInfo {
            id,
            handle: vk::Image::null(),
            mip_levels: mips,
            array_layers: layers,
            aspect: vk::ImageAspectFlags::COLOR,
            usage,
            is_swapchain: false,
            tracking_disabled: false,
        }
    }

    fn buffer_info(id: u64, usage: BitFlags<BufferUsage>) -> BufferInfo {
        BufferInfo {
            id,
            handle: vk::Buffer::null(),
            size: 1024,
            usage,
        }
    }

    fn render_target(id: u64) -> ImageInfo {
        image_info(id, 1, 1, ImageUsage::RenderTarget | ImageUsage::Sampled)
    }

    #[test]
    fn test_first_touch_emits_no_barrier() {
        let mut tracker = AccessTracker::new();
        let img = image_info(1, 4, 1, ImageUsage::Sampled | ImageUsage::GenMipMaps);
        tracker.transition_image_state(
            &img,
            SubresourceRange::full(4, 1),
            ResourceState::CopyDest,
            false,
            None,
        );
        assert!(tracker.take_pending().is_empty());
    }

    #[test]
    fn test_repeated_transition_is_idempotent() {
        let mut tracker = AccessTracker::new();
        let img = image_info(1, 1, 1, ImageUsage::Sampled | ImageUsage::GenMipMaps);
        let range = SubresourceRange::full(1, 1);

        tracker.transition_image_state(&img, range, ResourceState::CopyDest, false, None);
        tracker.transition_image_state(&img, range, ResourceState::CopySource, false, None);
        assert_eq!(tracker.take_pending().images.len(), 1);

        // The second transition to the same state is a no-op.
        tracker.transition_image_state(&img, range, ResourceState::CopySource, false, None);
        assert!(tracker.take_pending().is_empty());
    }

    #[test]
    fn test_range_splits_by_differing_states() {
        let mut tracker = AccessTracker::new();
        let img = image_info(1, 4, 1, ImageUsage::Sampled | ImageUsage::GenMipMaps);

        // Mip 0 diverges from the rest of the chain.
        tracker.transition_image_state(
            &img,
            SubresourceRange::single(0, 0),
            ResourceState::CopyDest,
            false,
            None,
        );
        tracker.transition_image_state(
            &img,
            SubresourceRange::new(1, 3, 0, 1),
            ResourceState::CopySource,
            false,
            None,
        );
        assert!(tracker.take_pending().is_empty());

        // Full-range transition: one barrier for mip 0, one for mips 1..4.
        tracker.transition_image_state(
            &img,
            SubresourceRange::full(4, 1),
            ResourceState::ShaderResource,
            false,
            None,
        );
        let batch = tracker.take_pending();
        assert_eq!(batch.images.len(), 2);
        let mip0 = batch.images.iter().find(|b| b.base_mip == 0).unwrap();
        assert_eq!(mip0.src.state, ResourceState::CopyDest);
        assert_eq!(mip0.level_count, 1);
        let rest = batch.images.iter().find(|b| b.base_mip == 1).unwrap();
        assert_eq!(rest.src.state, ResourceState::CopySource);
        assert_eq!(rest.level_count, 3);
    }

    #[test]
    fn test_uniform_range_coalesces_to_one_barrier() {
        let mut tracker = AccessTracker::new();
        let img = image_info(1, 9, 2, ImageUsage::Sampled | ImageUsage::GenMipMaps);
        let range = SubresourceRange::full(9, 2);

        tracker.transition_image_state(&img, range, ResourceState::CopyDest, false, None);
        tracker.transition_image_state(&img, range, ResourceState::ShaderResource, false, None);

        let batch = tracker.take_pending();
        assert_eq!(batch.images.len(), 1);
        assert_eq!(batch.images[0].level_count, 9);
        assert_eq!(batch.images[0].layer_count, 2);
    }

    #[test]
    fn test_merge_emits_compensating_barrier() {
        // Section 1 leaves the image as RenderTarget; section 2 assumed
        // ShaderResource on first touch. The merge must bridge the two.
        let mut first = AccessTracker::new();
        let img = render_target(1);
        first.transition_image_state(
            &img,
            SubresourceRange::full(1, 1),
            ResourceState::RenderTarget,
            false,
            None,
        );

        let mut second = AccessTracker::new();
        second.transition_image(
            &img,
            SubresourceRange::full(1, 1),
            StateRecord::with_stages(
                ResourceState::ShaderResource,
                vk::PipelineStageFlags2::FRAGMENT_SHADER,
            ),
            false,
            None,
        );

        first.merge(None, &second);
        let batch = first.take_pending();
        assert_eq!(batch.images.len(), 1);
        let barrier = &batch.images[0];
        assert_eq!(barrier.src.state, ResourceState::RenderTarget);
        assert_eq!(barrier.dst.state, ResourceState::ShaderResource);
        assert_eq!(
            barrier.src.stages,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT
        );
        assert_eq!(barrier.dst.stages, vk::PipelineStageFlags2::FRAGMENT_SHADER);
    }

    #[test]
    fn test_merge_after_clear_is_a_noop() {
        let mut first = AccessTracker::new();
        let img = render_target(1);
        first.transition_image_state(
            &img,
            SubresourceRange::full(1, 1),
            ResourceState::RenderTarget,
            false,
            None,
        );

        let mut second = AccessTracker::new();
        second.transition_image_state(
            &img,
            SubresourceRange::full(1, 1),
            ResourceState::ShaderResource,
            false,
            None,
        );

        first.merge(None, &second);
        let emitted = first.take_pending().len();
        assert_eq!(emitted, 1);

        second.clear();
        first.merge(None, &second);
        assert!(first.take_pending().is_empty());
    }

    #[test]
    fn test_merge_adopts_untouched_subresources() {
        let mut first = AccessTracker::new();
        let mut second = AccessTracker::new();
        let img = render_target(1);
        second.transition_image_state(
            &img,
            SubresourceRange::full(1, 1),
            ResourceState::ShaderResource,
            false,
            None,
        );

        // Nothing known about the image in `first`: adopt, emit nothing.
        first.merge(None, &second);
        assert!(first.take_pending().is_empty());

        // The adopted initial state now surfaces through iteration.
        let states: Vec<_> = first.image_subresource_states().collect();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].3.state, ResourceState::ShaderResource);
    }

    #[test]
    fn test_buffer_transitions() {
        let mut tracker = AccessTracker::new();
        let buf = buffer_info(7, BufferUsage::Storage | BufferUsage::TransferDst);

        tracker.transition_buffer(&buf, ResourceState::CopyDest, None);
        assert!(tracker.take_pending().is_empty());

        tracker.transition_buffer(&buf, ResourceState::ShaderResource, None);
        let batch = tracker.take_pending();
        assert_eq!(batch.buffers.len(), 1);
        assert_eq!(batch.buffers[0].src.state, ResourceState::CopyDest);
        assert_eq!(batch.buffers[0].dst.state, ResourceState::ShaderResource);
    }

    #[test]
    fn test_tracking_disabled_image_is_ignored() {
        let mut tracker = AccessTracker::new();
        let mut img = image_info(3, 9, 1, ImageUsage::Sampled.into());
        img.tracking_disabled = true;

        tracker.transition_image_state(
            &img,
            SubresourceRange::full(9, 1),
            ResourceState::ShaderResource,
            false,
            None,
        );
        tracker.transition_image_state(
            &img,
            SubresourceRange::full(9, 1),
            ResourceState::CopyDest,
            false,
            None,
        );
        assert!(tracker.is_empty());
    }

    #[test]
    #[should_panic]
    fn test_copy_queue_rejects_non_transfer_destination() {
        let mut tracker = AccessTracker::new();
        let img = render_target(1);
        tracker.transition_image_state(
            &img,
            SubresourceRange::full(1, 1),
            ResourceState::RenderTarget,
            true,
            None,
        );
    }

    #[test]
    #[should_panic]
    fn test_state_outside_declared_usage_is_rejected() {
        let mut tracker = AccessTracker::new();
        let buf = buffer_info(1, BufferUsage::Streaming | BufferUsage::TransferSrc);
        tracker.transition_buffer(&buf, ResourceState::CopyDest, None);
    }
}
