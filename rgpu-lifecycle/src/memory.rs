//! Memory type selection.
//!
//! Unlike a scoring allocator this picks the *first* memory type, in
//! ascending index order, that the resource accepts and that carries
//! every requested property flag. Vulkan orders memory types so that
//! earlier entries are preferred within a heap, which makes first-fit
//! a reasonable policy for one-allocation-per-buffer resources.

use ash::vk;

use crate::context::Context;

/// Return the first memory type index allowed by `type_filter` whose
/// property flags contain all of `properties`.
///
/// `type_filter` is typically `VkMemoryRequirements::memoryTypeBits`.
/// Only the first `memory_type_count` entries are considered. `None`
/// means no type qualifies; callers treat that as a hard failure rather
/// than retrying with fewer flags.
pub fn select_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Option<u32> {
    let count =
        (memory_properties.memory_type_count as usize).min(vk::MAX_MEMORY_TYPES);
    memory_properties.memory_types[..count]
        .iter()
        .enumerate()
        .find(|(i, ty)| {
            type_filter & (1u32 << i) != 0
                && ty.property_flags.contains(properties)
        })
        .map(|(i, _)| i as u32)
}

/// [`select_memory_type`] against the memory properties of `ctx`'s device.
pub fn find_memory_type(
    ctx: &Context,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Option<u32> {
    select_memory_type(ctx.device().memory_properties(), type_filter, properties)
}
