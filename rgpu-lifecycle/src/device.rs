//! The native-layer seam ([`RawDevice`]) and its `ash` implementation
//! ([`AshDevice`]).
//!
//! Every Vulkan entry point this crate calls goes through [`RawDevice`],
//! one `unsafe fn` per command with a `raw_` name where it creates,
//! destroys or manipulates a raw handle. Higher-level wrappers in sibling
//! modules call these rather than touching `ash::Device` directly, which
//! also lets the test suite substitute a call-counting device.
//!
//! The device, queue and command pool are owned by the caller. Neither
//! the trait nor [`AshDevice`] ever destroys them.

use std::ffi::c_void;

use ash::vk;

/// The device-level Vulkan commands used by buffers and command buffers.
///
/// Implementations must be callable from any thread; external
/// synchronisation requirements of the individual commands (e.g. on the
/// command pool or the queue) stay with the caller, as in Vulkan.
pub trait RawDevice: Send + Sync {
    /// The raw `VkDevice` handle, for logging and interop.
    fn raw_device(&self) -> vk::Device;

    /// Memory heaps and types reported by the physical device this
    /// device was created from.
    fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties;

    /// # Safety
    /// `create_info` must be valid. All referenced pointers must remain
    /// valid for the duration of the call.
    unsafe fn create_raw_buffer(
        &self,
        create_info: &vk::BufferCreateInfo<'_>,
    ) -> Result<vk::Buffer, vk::Result>;

    /// # Safety
    /// `buffer` must be a valid handle created from this device and not
    /// yet destroyed. No in-flight GPU work may still reference it.
    unsafe fn destroy_raw_buffer(&self, buffer: vk::Buffer);

    /// # Safety
    /// `buffer` must be a valid handle created from this device.
    unsafe fn get_raw_buffer_memory_requirements(
        &self,
        buffer: vk::Buffer,
    ) -> vk::MemoryRequirements;

    /// # Safety
    /// `allocate_info` must describe a memory type index supported by
    /// this device.
    unsafe fn allocate_raw_memory(
        &self,
        allocate_info: &vk::MemoryAllocateInfo<'_>,
    ) -> Result<vk::DeviceMemory, vk::Result>;

    /// # Safety
    /// `memory` must be a valid allocation from this device that is not
    /// mapped and to which no live buffer is still bound.
    unsafe fn free_raw_memory(&self, memory: vk::DeviceMemory);

    /// # Safety
    /// `buffer` and `memory` must be valid handles from this device and
    /// `offset` must satisfy the buffer's memory requirements.
    unsafe fn bind_raw_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result>;

    /// # Safety
    /// `memory` must be a host-visible allocation from this device that
    /// is not currently mapped. The range must lie within the allocation.
    unsafe fn map_raw_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        flags: vk::MemoryMapFlags,
    ) -> Result<*mut c_void, vk::Result>;

    /// # Safety
    /// `memory` must currently be mapped on this device.
    unsafe fn unmap_raw_memory(&self, memory: vk::DeviceMemory);

    /// # Safety
    /// Every range must reference mapped memory from this device.
    unsafe fn flush_raw_mapped_memory_ranges(
        &self,
        memory_ranges: &[vk::MappedMemoryRange<'_>],
    ) -> Result<(), vk::Result>;

    /// # Safety
    /// Every range must reference mapped memory from this device.
    unsafe fn invalidate_raw_mapped_memory_ranges(
        &self,
        memory_ranges: &[vk::MappedMemoryRange<'_>],
    ) -> Result<(), vk::Result>;

    /// # Safety
    /// `allocate_info.command_pool` must be a valid pool created from
    /// this device and externally synchronised by the caller.
    unsafe fn allocate_raw_command_buffers(
        &self,
        allocate_info: &vk::CommandBufferAllocateInfo<'_>,
    ) -> Result<Vec<vk::CommandBuffer>, vk::Result>;

    /// # Safety
    /// All handles must have been allocated from `pool`, none may be
    /// pending execution, and access to `pool` must be externally
    /// synchronised.
    unsafe fn free_raw_command_buffers(
        &self,
        pool: vk::CommandPool,
        command_buffers: &[vk::CommandBuffer],
    );

    /// # Safety
    /// `command_buffer` must not be in the recording or pending state.
    unsafe fn begin_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::CommandBufferBeginInfo<'_>,
    ) -> Result<(), vk::Result>;

    /// # Safety
    /// `command_buffer` must be in the recording state.
    unsafe fn end_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), vk::Result>;

    /// # Safety
    /// `command_buffer` must be recording. Both buffers must be valid,
    /// carry `TRANSFER_SRC` / `TRANSFER_DST` usage respectively, and every
    /// region must be in bounds for both.
    unsafe fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src_buffer: vk::Buffer,
        dst_buffer: vk::Buffer,
        regions: &[vk::BufferCopy],
    );

    /// # Safety
    /// `queue` must belong to this device and be externally synchronised.
    /// Submitted command buffers must be executable, and `fence`, when not
    /// null, must be unsignaled and not in use by another submission.
    unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> Result<(), vk::Result>;

    /// # Safety
    /// `queue` must belong to this device and be externally synchronised.
    unsafe fn queue_wait_idle(&self, queue: vk::Queue) -> Result<(), vk::Result>;

    /// # Safety
    /// `create_info` must be valid.
    unsafe fn create_raw_fence(
        &self,
        create_info: &vk::FenceCreateInfo<'_>,
    ) -> Result<vk::Fence, vk::Result>;

    /// # Safety
    /// `fence` must be a valid fence from this device that no pending
    /// submission still references.
    unsafe fn destroy_raw_fence(&self, fence: vk::Fence);

    /// # Safety
    /// Every fence must be a valid fence created from this device.
    unsafe fn wait_for_raw_fences(
        &self,
        fences: &[vk::Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> Result<(), vk::Result>;

    /// # Safety
    /// Every queue of this device must be externally synchronised for the
    /// duration of the call.
    unsafe fn device_wait_idle(&self) -> Result<(), vk::Result>;
}

/// [`RawDevice`] over an externally created `ash::Device`.
///
/// The memory properties of the physical device are queried once at
/// construction. Dropping an `AshDevice` does not destroy the device.
pub struct AshDevice {
    handle: ash::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl std::fmt::Debug for AshDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AshDevice")
            .field("handle", &self.handle.handle())
            .finish_non_exhaustive()
    }
}

impl AshDevice {
    /// # Safety
    /// `physical_device` must be derived from `instance`, and `device`
    /// must have been created from `physical_device`. The device must
    /// outlive every object created through this wrapper.
    pub unsafe fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
    ) -> Self {
        // SAFETY: Caller guarantees physical_device provenance.
        let memory_properties = unsafe {
            instance.get_physical_device_memory_properties(physical_device)
        };
        tracing::debug!(
            "Wrapping device {:?} ({} memory types)",
            device.handle(),
            memory_properties.memory_type_count
        );
        Self {
            handle: device,
            memory_properties,
        }
    }

    pub fn ash_device(&self) -> &ash::Device {
        &self.handle
    }
}

impl RawDevice for AshDevice {
    fn raw_device(&self) -> vk::Device {
        self.handle.handle()
    }

    fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    unsafe fn create_raw_buffer(
        &self,
        create_info: &vk::BufferCreateInfo<'_>,
    ) -> Result<vk::Buffer, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.handle.create_buffer(create_info, None) }
    }

    unsafe fn destroy_raw_buffer(&self, buffer: vk::Buffer) {
        // SAFETY: Caller guarantees buffer provenance and drop ordering.
        unsafe { self.handle.destroy_buffer(buffer, None) };
    }

    unsafe fn get_raw_buffer_memory_requirements(
        &self,
        buffer: vk::Buffer,
    ) -> vk::MemoryRequirements {
        // SAFETY: Caller guarantees buffer validity.
        unsafe { self.handle.get_buffer_memory_requirements(buffer) }
    }

    unsafe fn allocate_raw_memory(
        &self,
        allocate_info: &vk::MemoryAllocateInfo<'_>,
    ) -> Result<vk::DeviceMemory, vk::Result> {
        // SAFETY: Caller guarantees allocation info validity.
        unsafe { self.handle.allocate_memory(allocate_info, None) }
    }

    unsafe fn free_raw_memory(&self, memory: vk::DeviceMemory) {
        // SAFETY: Caller guarantees memory provenance and drop ordering.
        unsafe { self.handle.free_memory(memory, None) };
    }

    unsafe fn bind_raw_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees handle validity and offset constraints.
        unsafe { self.handle.bind_buffer_memory(buffer, memory, offset) }
    }

    unsafe fn map_raw_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        flags: vk::MemoryMapFlags,
    ) -> Result<*mut c_void, vk::Result> {
        // SAFETY: Caller guarantees mapping preconditions.
        unsafe { self.handle.map_memory(memory, offset, size, flags) }
    }

    unsafe fn unmap_raw_memory(&self, memory: vk::DeviceMemory) {
        // SAFETY: Caller guarantees memory is currently mapped.
        unsafe { self.handle.unmap_memory(memory) };
    }

    unsafe fn flush_raw_mapped_memory_ranges(
        &self,
        memory_ranges: &[vk::MappedMemoryRange<'_>],
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees memory range validity.
        unsafe { self.handle.flush_mapped_memory_ranges(memory_ranges) }
    }

    unsafe fn invalidate_raw_mapped_memory_ranges(
        &self,
        memory_ranges: &[vk::MappedMemoryRange<'_>],
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees memory range validity.
        unsafe { self.handle.invalidate_mapped_memory_ranges(memory_ranges) }
    }

    unsafe fn allocate_raw_command_buffers(
        &self,
        allocate_info: &vk::CommandBufferAllocateInfo<'_>,
    ) -> Result<Vec<vk::CommandBuffer>, vk::Result> {
        // SAFETY: Caller guarantees allocate_info validity and pool
        // synchronisation.
        unsafe { self.handle.allocate_command_buffers(allocate_info) }
    }

    unsafe fn free_raw_command_buffers(
        &self,
        pool: vk::CommandPool,
        command_buffers: &[vk::CommandBuffer],
    ) {
        if command_buffers.is_empty() {
            return;
        }
        // SAFETY: Caller guarantees pool/buffer provenance, idle state, and
        // external synchronisation on pool.
        unsafe { self.handle.free_command_buffers(pool, command_buffers) }
    }

    unsafe fn begin_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::CommandBufferBeginInfo<'_>,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees command_buffer state and
        // begin_info validity.
        unsafe { self.handle.begin_command_buffer(command_buffer, begin_info) }
    }

    unsafe fn end_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees command_buffer is in the recording state.
        unsafe { self.handle.end_command_buffer(command_buffer) }
    }

    unsafe fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src_buffer: vk::Buffer,
        dst_buffer: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        // SAFETY: Caller guarantees recording state, buffer validity and
        // in-bounds regions.
        unsafe {
            self.handle.cmd_copy_buffer(
                command_buffer,
                src_buffer,
                dst_buffer,
                regions,
            )
        }
    }

    unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees queue synchronisation and the validity
        // of every handle in submits.
        unsafe { self.handle.queue_submit(queue, submits, fence) }
    }

    unsafe fn queue_wait_idle(&self, queue: vk::Queue) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees queue provenance and synchronisation.
        unsafe { self.handle.queue_wait_idle(queue) }
    }

    unsafe fn create_raw_fence(
        &self,
        create_info: &vk::FenceCreateInfo<'_>,
    ) -> Result<vk::Fence, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.handle.create_fence(create_info, None) }
    }

    unsafe fn destroy_raw_fence(&self, fence: vk::Fence) {
        // SAFETY: Caller guarantees no pending submission uses fence.
        unsafe { self.handle.destroy_fence(fence, None) };
    }

    unsafe fn wait_for_raw_fences(
        &self,
        fences: &[vk::Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees fence provenance.
        unsafe { self.handle.wait_for_fences(fences, wait_all, timeout_ns) }
    }

    unsafe fn device_wait_idle(&self) -> Result<(), vk::Result> {
        let _span = tracing::debug_span!("device_wait_idle").entered();
        // SAFETY: Caller guarantees queue synchronisation.
        unsafe { self.handle.device_wait_idle() }
    }
}
