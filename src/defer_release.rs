//! Post-frame cleanup queues.
//!
//! Transient objects (staging buffers, acquire semaphores, framebuffers)
//! must outlive the last submission that references them. Callables
//! registered here are swept into the submitting frame's slot and run, in
//! insertion order, once that slot's fence signals.

use crate::RenderDevice;

pub type CleanupFn = Box<dyn FnOnce(&RenderDevice) + Send>;

#[derive(Default)]
pub struct DeferReleaseQueue {
    cleanup: Vec<CleanupFn>,
}

impl DeferReleaseQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, callback: CleanupFn) {
        self.cleanup.push(callback);
    }

    pub fn append(&mut self, mut callbacks: Vec<CleanupFn>) {
        self.cleanup.append(&mut callbacks);
    }

    pub fn len(&self) -> usize {
        self.cleanup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cleanup.is_empty()
    }

    /// Run every callback in insertion order.
    ///
    /// Cleanup must not fail; a panicking callback is logged and the rest
    /// still run, since skipping them would leak GPU objects.
    pub fn run_all(&mut self, device: &RenderDevice) {
        for callback in self.cleanup.drain(..) {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(device);
            }));
            if result.is_err() {
                log::error!("post-frame cleanup callback panicked; continuing");
            }
        }
    }
}
