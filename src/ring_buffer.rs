//! Persistently mapped constant ring buffer.
//!
//! One big host-visible uniform buffer, partitioned into N disjoint
//! windows that rotate with the frame index. Allocation bumps a head
//! inside the current window, so wrap-around can never overwrite data a
//! frame still in flight reads from.

use ash::vk;
use parking_lot::Mutex;

use crate::buffer::{Buffer, BufferDesc};
use crate::error::RhiError;

/// Default capacity of the device's huge constant buffer.
pub const HUGE_CONSTANT_BUFFER_SIZE: vk::DeviceSize = 32 * 1024 * 1024;

/// Pure bump-allocator arithmetic over the frame windows.
#[derive(Debug)]
pub(crate) struct RingState {
    window_size: u64,
    num_windows: u64,
    current_window: u64,
    head: u64,
}

impl RingState {
    pub(crate) fn new(capacity: u64, num_windows: u64) -> Self {
        Self {
            window_size: capacity / num_windows,
            num_windows,
            current_window: 0,
            head: 0,
        }
    }

    /// Reserve `size` bytes at `align`; returns the buffer-global offset.
    pub(crate) fn allocate(&mut self, size: u64, align: u64) -> Result<u64, RhiError> {
        let align = align.max(1);
        let head = (self.head + align - 1) / align * align;
        if head + size > self.window_size {
            return Err(RhiError::OutOfSmallPool);
        }
        self.head = head + size;
        Ok(self.current_window * self.window_size + head)
    }

    /// Rotate into the next frame window and rewind its head.
    pub(crate) fn advance_window(&mut self) {
        self.current_window = (self.current_window + 1) % self.num_windows;
        self.head = 0;
    }
}

/// The device-wide uniform ring used for push-style constants.
pub struct HugeConstantBuffer {
    buffer: Buffer,
    state: Mutex<RingState>,
    min_align: u64,
}

/// A slice of the ring handed back to descriptor binding.
#[derive(Clone, Copy, Debug)]
pub struct ConstantAllocation {
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

impl HugeConstantBuffer {
    pub fn new(
        device: &crate::RenderDevice,
        capacity: vk::DeviceSize,
        num_frames: u64,
        min_align: u64,
    ) -> Result<Self, vk::Result> {
        let desc = BufferDesc::uniform(capacity).with_name("huge_constant_buffer");
        let buffer = Buffer::new(device, &desc)?;
        Ok(Self {
            buffer,
            state: Mutex::new(RingState::new(capacity, num_frames)),
            min_align,
        })
    }

    /// Copy `data` into the ring at uniform-buffer alignment and return
    /// where it landed. Overflow is non-fatal and surfaces to the caller.
    pub fn allocate(&self, data: &[u8], align: u64) -> Result<ConstantAllocation, RhiError> {
        let size = data.len() as u64;
        let offset = self
            .state
            .lock()
            .allocate(size, align.max(self.min_align))?;
        self.buffer
            .write_at(offset, data)
            .map_err(RhiError::Vulkan)?;
        Ok(ConstantAllocation { offset, size })
    }

    pub(crate) fn advance_frame(&self) {
        self.state.lock().advance_window();
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer.handle()
    }

    pub fn capacity(&self) -> vk::DeviceSize {
        self.buffer.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_and_align() {
        let mut ring = RingState::new(1024, 2);
        assert_eq!(ring.allocate(100, 256).unwrap(), 0);
        assert_eq!(ring.allocate(100, 256).unwrap(), 256);
        assert_eq!(ring.allocate(4, 1).unwrap(), 356);
    }

    #[test]
    fn test_window_overflow_is_reported() {
        let mut ring = RingState::new(1024, 2);
        assert!(ring.allocate(512, 1).is_ok());
        // The window holds 512 bytes; the next allocation cannot fit.
        assert!(matches!(
            ring.allocate(1, 1),
            Err(RhiError::OutOfSmallPool)
        ));
    }

    #[test]
    fn test_windows_stay_disjoint() {
        let mut ring = RingState::new(1024, 2);
        assert_eq!(ring.allocate(512, 1).unwrap(), 0);

        ring.advance_window();
        // The second window starts past everything frame 0 allocated.
        assert_eq!(ring.allocate(512, 1).unwrap(), 512);

        ring.advance_window();
        // Rotation wraps back onto window 0 after its frame retired.
        assert_eq!(ring.allocate(16, 1).unwrap(), 0);
    }
}
