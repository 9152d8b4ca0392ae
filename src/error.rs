//! Error types - recoverable runtime failures vs. fatal usage violations.

use ash::vk;

/// Recoverable runtime error surfaced from a public operation.
///
/// Violated API invariants (committing a list with an active context,
/// dropping an unfinished context, ...) are not represented here; those
/// are programmer errors and abort through [`usage_error!`].
#[derive(Debug)]
pub enum RhiError {
    /// A Vulkan call failed.
    Vulkan(vk::Result),
    /// The logical device was lost.
    DeviceLost,
    /// The swapchain no longer matches the surface and must be recreated.
    SwapchainOutOfDate,
    /// The huge constant buffer ran out of space in the current frame window.
    OutOfSmallPool,
    /// Mip chain generation requires power-of-two extents.
    MipSizeNotPowerOfTwo { width: u32, height: u32, depth: u32 },
    /// Resource creation failed.
    CreationFailed(String),
}

impl From<vk::Result> for RhiError {
    fn from(e: vk::Result) -> Self {
        match e {
            vk::Result::ERROR_DEVICE_LOST => RhiError::DeviceLost,
            vk::Result::ERROR_OUT_OF_DATE_KHR => RhiError::SwapchainOutOfDate,
            other => RhiError::Vulkan(other),
        }
    }
}

impl std::fmt::Display for RhiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RhiError::Vulkan(e) => write!(f, "Vulkan error: {:?}", e),
            RhiError::DeviceLost => write!(f, "Device lost"),
            RhiError::SwapchainOutOfDate => write!(f, "Swapchain out of date"),
            RhiError::OutOfSmallPool => {
                write!(f, "Constant ring buffer exhausted for this frame")
            }
            RhiError::MipSizeNotPowerOfTwo { width, height, depth } => write!(
                f,
                "Mip chain generation requires power-of-two extents, got {}x{}x{}",
                width, height, depth
            ),
            RhiError::CreationFailed(msg) => write!(f, "Resource creation failed: {}", msg),
        }
    }
}

impl std::error::Error for RhiError {}

/// Log and abort on a violated API invariant.
///
/// The contract is broken on the caller's side; there is no state left
/// worth recovering.
macro_rules! usage_error {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        panic!($($arg)*);
    }};
}

pub(crate) use usage_error;
