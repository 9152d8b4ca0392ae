//! Vulkan Queue - command list submission and frame slot rotation.
//!
//! Lists submit in enqueue order; a list that is not yet committed blocks
//! everything queued behind it. Each queue rotates N frame slots, each
//! guarded by a fence: a slot's in-flight lists release their resources
//! and its cleanup callbacks run only after that fence signals.

use ash::vk;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::command::CommandBufferAllocator;
use crate::command_list::CommandList;
use crate::defer_release::DeferReleaseQueue;
use crate::error::{usage_error, RhiError};
use crate::RenderDevice;

/// Frames in flight per queue.
pub const NUM_FRAMES: usize = 3;

/// Fence wait budget per attempt when advancing the frame index.
const FENCE_TIMEOUT_NS: u64 = 1_000_000_000;
/// Attempts before a stuck fence is treated as a GPU hang.
const FENCE_WAIT_ATTEMPTS: u32 = 3;

/// The three queue classes the device hands out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueType {
    Render,
    Compute,
    Copy,
}

struct FrameSlot {
    fence: vk::Fence,
    lists_in_flight: Vec<CommandList>,
    cleanup: DeferReleaseQueue,
}

struct QueueState {
    queued: VecDeque<CommandList>,
    frames: Vec<FrameSlot>,
    current_frame: usize,
}

/// A command queue with queued-list FIFO and rotating frame slots.
pub struct CommandQueue {
    device: Arc<RenderDevice>,
    queue_type: QueueType,
    handle: vk::Queue,
    family_index: u32,
    allocator: CommandBufferAllocator,
    state: Mutex<QueueState>,
}

impl CommandQueue {
    pub(crate) fn new(
        device: Arc<RenderDevice>,
        queue_type: QueueType,
    ) -> Result<Arc<Self>, RhiError> {
        let family_index = device.queue_family(queue_type);
        let handle = device.vk_queue(queue_type);
        let allocator = CommandBufferAllocator::new(device.handle(), family_index, NUM_FRAMES)?;

        let mut frames = Vec::with_capacity(NUM_FRAMES);
        for _ in 0..NUM_FRAMES {
            // Created signaled so the first rotation into each slot does
            // not stall.
            let fence_info =
                vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
            let fence = unsafe { device.handle().create_fence(&fence_info, None)? };
            frames.push(FrameSlot {
                fence,
                lists_in_flight: Vec::new(),
                cleanup: DeferReleaseQueue::new(),
            });
        }

        // The current slot's fence is consumed by this frame's submission;
        // unsignal it now.
        unsafe {
            device.handle().reset_fences(&[frames[0].fence])?;
        }

        Ok(Arc::new(Self {
            device,
            queue_type,
            handle,
            family_index,
            allocator,
            state: Mutex::new(QueueState {
                queued: VecDeque::new(),
                frames,
                current_frame: 0,
            }),
        }))
    }

    pub fn device(&self) -> &Arc<RenderDevice> {
        &self.device
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    pub fn handle(&self) -> vk::Queue {
        self.handle
    }

    pub fn family_index(&self) -> u32 {
        self.family_index
    }

    pub(crate) fn allocator(&self) -> &CommandBufferAllocator {
        &self.allocator
    }

    /// The frame slot new work currently records into.
    pub fn frame_index(&self) -> usize {
        self.state.lock().current_frame
    }

    pub fn is_copy_queue(&self) -> bool {
        self.queue_type == QueueType::Copy
    }

    /// Create a new list in the `Recording` state bound to this queue.
    pub fn create_command_list(self: &Arc<Self>) -> CommandList {
        CommandList::new(self.clone())
    }

    /// Push a list onto the submission FIFO.
    pub(crate) fn enqueue(&self, list: CommandList) {
        self.state.lock().queued.push_back(list);
    }

    /// Drain the prefix of committed lists into one queue submission.
    ///
    /// Lists behind a non-committed list stay queued; enqueue order is
    /// never reordered.
    pub fn submit(&self, set_fence: bool) -> Result<(), RhiError> {
        let mut state = self.state.lock();

        let mut draining = Vec::new();
        while let Some(front) = state.queued.front() {
            if !front.is_committed() {
                break;
            }
            draining.push(state.queued.pop_front().unwrap());
        }

        // Settle trackers against global state in submission order.
        for list in &draining {
            list.finalize_for_submit()?;
        }

        let per_section: Vec<_> = draining
            .iter()
            .flat_map(|list| list.submit_data())
            .collect();

        let mut cmd_infos: Vec<SmallVec<[vk::CommandBufferSubmitInfo; 2]>> = Vec::new();
        let mut wait_infos: Vec<SmallVec<[vk::SemaphoreSubmitInfo; 4]>> = Vec::new();
        let mut signal_infos: Vec<SmallVec<[vk::SemaphoreSubmitInfo; 4]>> = Vec::new();
        for section in &per_section {
            let mut cmds = SmallVec::new();
            if let Some(pre) = section.pre {
                cmds.push(vk::CommandBufferSubmitInfo::default().command_buffer(pre));
            }
            cmds.push(vk::CommandBufferSubmitInfo::default().command_buffer(section.work));
            cmd_infos.push(cmds);

            wait_infos.push(
                section
                    .waits
                    .iter()
                    .map(|&(semaphore, stage)| {
                        vk::SemaphoreSubmitInfo::default()
                            .semaphore(semaphore)
                            .stage_mask(stage)
                    })
                    .collect(),
            );
            signal_infos.push(
                section
                    .signals
                    .iter()
                    .map(|&semaphore| {
                        vk::SemaphoreSubmitInfo::default()
                            .semaphore(semaphore)
                            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                    })
                    .collect(),
            );
        }

        let submit_infos: Vec<vk::SubmitInfo2> = (0..per_section.len())
            .map(|i| {
                vk::SubmitInfo2::default()
                    .command_buffer_infos(&cmd_infos[i])
                    .wait_semaphore_infos(&wait_infos[i])
                    .signal_semaphore_infos(&signal_infos[i])
            })
            .collect();

        let fence = if set_fence {
            state.frames[state.current_frame].fence
        } else {
            vk::Fence::null()
        };

        unsafe {
            self.device
                .handle()
                .queue_submit2(self.handle, &submit_infos, fence)?;
        }

        let current = state.current_frame;
        state.frames[current].lists_in_flight.extend(draining);

        // Transient objects registered since the last submission ride on
        // this one's fence.
        state.frames[current]
            .cleanup
            .append(self.device.sweep_post_frame_cleanup());

        Ok(())
    }

    /// Submit with the frame fence, rotate the frame index, then drain
    /// the incoming slot once its fence signals.
    #[profiling::function]
    pub fn submit_frame(&self) -> Result<(), RhiError> {
        self.submit(true)?;

        let mut state = self.state.lock();
        state.current_frame = (state.current_frame + 1) % NUM_FRAMES;
        let index = state.current_frame;
        self.allocator.set_current_frame(index);

        let fence = state.frames[index].fence;
        self.wait_for_slot_fence(fence);
        unsafe {
            self.device.handle().reset_fences(&[fence])?;
        }

        // The fence signaled: everything slot `index` submitted N frames
        // ago is done. Release in order: list resources first, then the
        // cleanup callables.
        let slot = &mut state.frames[index];
        for list in slot.lists_in_flight.drain(..) {
            list.release_all_resources();
        }
        let mut cleanup = std::mem::take(&mut slot.cleanup);
        drop(state);
        cleanup.run_all(&self.device);

        self.allocator.reset_frame(index)?;

        if self.queue_type == QueueType::Render {
            self.device.huge_constant_buffer().advance_frame();
        }

        Ok(())
    }

    /// Submit everything committed without binding the frame fence.
    pub fn flush(&self) -> Result<(), RhiError> {
        self.submit(false)
    }

    /// Flush, then wait for the queue to go idle device-side.
    pub fn finish(&self) -> Result<(), RhiError> {
        self.flush()?;
        unsafe {
            self.device.handle().queue_wait_idle(self.handle)?;
        }
        Ok(())
    }

    fn wait_for_slot_fence(&self, fence: vk::Fence) {
        for attempt in 0..FENCE_WAIT_ATTEMPTS {
            let result = unsafe {
                self.device
                    .handle()
                    .wait_for_fences(&[fence], true, FENCE_TIMEOUT_NS)
            };
            match result {
                Ok(()) => return,
                Err(vk::Result::TIMEOUT) => {
                    log::warn!(
                        "frame fence wait timed out (attempt {}/{})",
                        attempt + 1,
                        FENCE_WAIT_ATTEMPTS
                    );
                }
                Err(e) => {
                    usage_error!("frame fence wait failed: {:?}", e);
                }
            }
        }
        usage_error!("frame fence never signaled; the GPU appears hung");
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        let _ = self.flush();
        unsafe {
            let _ = self.device.handle().queue_wait_idle(self.handle);
        }
        let mut state = self.state.lock();
        for slot in &mut state.frames {
            for list in slot.lists_in_flight.drain(..) {
                list.release_all_resources();
            }
            slot.cleanup.run_all(&self.device);
            unsafe {
                self.device.handle().destroy_fence(slot.fence, None);
            }
        }
    }
}
