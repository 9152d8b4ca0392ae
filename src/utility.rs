use std::collections::Bound;
use std::ops::RangeBounds;
use std::sync::atomic::{AtomicU64, Ordering};
use ash::vk;

macro_rules! normalize_range_function {
    ($unsigned:ty) => {
        $crate::paste! {
            pub(crate) fn [<normalize_range_ $unsigned>]<R: RangeBounds<$unsigned>>(
                bounds: R,
                size: $unsigned,
            ) -> Result<($unsigned, $unsigned), vk::Result> {
                let start = match bounds.start_bound() {
                    Bound::Included(&v) => v,
                    Bound::Excluded(&v) => v.checked_add(1).ok_or(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)?,
                    Bound::Unbounded => 0,
                };
                let end_exclusive = match bounds.end_bound() {
                    Bound::Included(&v) => v.checked_add(1).ok_or(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)?,
                    Bound::Excluded(&v) => v,
                    Bound::Unbounded => size,
                };

                if start > end_exclusive {
                    return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
                }
                if end_exclusive > size {
                    return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
                }

                Ok((start, end_exclusive - start))
            }
        }
    };
}

normalize_range_function!(u64);

/// Find a suitable memory type index.
pub(crate) fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Option<u32> {
    for i in 0..memory_properties.memory_type_count {
        let memory_type = memory_properties.memory_types[i as usize];
        if (type_filter & (1 << i)) != 0 && memory_type.property_flags.contains(properties) {
            return Some(i);
        }
    }
    None
}

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Hand out a process-unique identity for a buffer or image.
///
/// The access tracker keys on this rather than the raw Vulkan handle:
/// drivers may recycle handles within a frame, identities never repeat.
pub(crate) fn next_resource_id() -> u64 {
    NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn is_power_of_two(v: u32) -> bool {
    v != 0 && (v & (v - 1)) == 0
}

/// Number of mip levels for a full chain over the smallest extent.
pub(crate) fn full_mip_chain_levels(min_extent: u32) -> u32 {
    1 + (min_extent.max(1) as f32).log2().floor() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_mip_chain_levels() {
        assert_eq!(full_mip_chain_levels(1), 1);
        assert_eq!(full_mip_chain_levels(2), 2);
        assert_eq!(full_mip_chain_levels(256), 9);
        assert_eq!(full_mip_chain_levels(1024), 11);
    }

    #[test]
    fn test_is_power_of_two() {
        assert!(is_power_of_two(1));
        assert!(is_power_of_two(256));
        assert!(!is_power_of_two(0));
        assert!(!is_power_of_two(384));
    }

    #[test]
    fn test_normalize_range() {
        assert_eq!(normalize_range_u64(.., 100).unwrap(), (0, 100));
        assert_eq!(normalize_range_u64(10..20, 100).unwrap(), (10, 10));
        assert_eq!(normalize_range_u64(10.., 100).unwrap(), (10, 90));
        assert!(normalize_range_u64(10..200, 100).is_err());
    }
}
