//! Device buffers with a dedicated memory allocation ([`Buffer`]).
//!
//! Each [`Buffer`] owns exactly one `VkBuffer` and the one
//! `VkDeviceMemory` bound to it at offset zero. Host-visible buffers can
//! be mapped (at most one mapping at a time), written with
//! [`write_pod`](Buffer::write_pod) or the raw
//! [`copy_unchecked_from`](Buffer::copy_unchecked_from), and read back
//! with [`read_pod`](Buffer::read_pod). Device-to-device copies go
//! through [`copy_to`](Buffer::copy_to), which records, submits and
//! waits for a one-shot command buffer before returning.
//!
//! Release order is fixed: unmap, destroy the buffer, free the memory.

use std::ffi::c_void;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use ash::vk;
use bytemuck::Pod;

use crate::context::{Context, TransferWait};
use crate::device::RawDevice;
use crate::error::{ErrorKind, ErrorPair};
use crate::memory::find_memory_type;
use crate::registry::BufferKey;

/// The native half of a [`Buffer`], shared with the registry so that
/// either side can release it exactly once.
pub(crate) struct BufferCore {
    context: Arc<Context>,
    handle: vk::Buffer,
    memory: vk::DeviceMemory,
    mapping: AtomicPtr<c_void>,
    released: AtomicBool,
}

impl BufferCore {
    /// Unmap, destroy the buffer, then free its memory. Later calls are
    /// no-ops.
    pub(crate) fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("Dropping buffer {:?}", self.handle);
        let device = self.context.device();

        let mapping = self.mapping.swap(ptr::null_mut(), Ordering::AcqRel);
        if !mapping.is_null() {
            // SAFETY: a non-null mapping means memory is currently mapped.
            unsafe { device.unmap_raw_memory(self.memory) };
        }
        // SAFETY: handle and memory were created from this device and are
        // owned by this core; `released` guarantees a single release. The
        // owner guarantees no pending GPU work references them.
        unsafe {
            device.destroy_raw_buffer(self.handle);
            device.free_raw_memory(self.memory);
        }
    }
}

/// A `VkBuffer` with its own bound `VkDeviceMemory`.
///
/// `size` is the size requested at creation; `allocation_size` is what
/// the driver asked for in its memory requirements and may be larger.
///
/// Mutating calls take `&mut self`: a single buffer is not meant to be
/// driven from several threads at once. The buffer is released on drop
/// unless [`Registry::shutdown`](crate::Registry::shutdown) released it
/// first.
pub struct Buffer {
    core: Arc<BufferCore>,
    key: Option<BufferKey>,
    size: vk::DeviceSize,
    allocation_size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    memory_flags: vk::MemoryPropertyFlags,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("handle", &self.core.handle)
            .field("size", &self.size)
            .field("allocation_size", &self.allocation_size)
            .field("mapped", &self.is_memory_mapped())
            .finish_non_exhaustive()
    }
}

impl Buffer {
    /// Create a buffer of `size` bytes and bind it to a fresh allocation
    /// from the first memory type carrying all of `properties`.
    ///
    /// On failure every handle created so far is released before
    /// returning; no partially built buffer escapes. A zero `size` fails
    /// with [`ErrorKind::FailedToCreateBuffer`] before any driver call.
    pub fn create(
        ctx: &Arc<Context>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Self, ErrorPair> {
        if size == 0 {
            tracing::debug!("zero-sized buffer with usage {usage:?} rejected");
            return Err(ErrorPair::library(ErrorKind::FailedToCreateBuffer));
        }
        let device = ctx.device();
        let create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        // SAFETY: create_info is fully initialised and has no borrowed data.
        let handle = unsafe { device.create_raw_buffer(&create_info) }
            .map_err(ErrorKind::FailedToCreateBuffer.native())?;

        // SAFETY: handle is a valid buffer created from this device.
        let reqs = unsafe { device.get_raw_buffer_memory_requirements(handle) };

        let Some(memory_type_index) =
            find_memory_type(ctx, reqs.memory_type_bits, properties)
        else {
            tracing::warn!(
                "No memory type in {:#b} has {properties:?}",
                reqs.memory_type_bits
            );
            // SAFETY: handle was created above and is not bound to memory.
            unsafe { device.destroy_raw_buffer(handle) };
            return Err(ErrorPair::library(
                ErrorKind::FailedToFindSuitableMemoryType,
            ));
        };

        let allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(reqs.size)
            .memory_type_index(memory_type_index);
        // SAFETY: memory_type_index was selected from this device's
        // memory properties.
        let memory = unsafe { device.allocate_raw_memory(&allocate_info) }
            .map_err(|e| {
                // SAFETY: handle was created above and is not bound to
                // memory yet.
                unsafe { device.destroy_raw_buffer(handle) };
                ErrorKind::FailedToAllocateBufferMemory.native()(e)
            })?;

        // SAFETY: both handles are valid and belong to this device; offset
        // zero satisfies any alignment.
        let bind_result =
            unsafe { device.bind_raw_buffer_memory(handle, memory, 0) };
        if let Err(e) = bind_result {
            // SAFETY: both handles are owned by this scope and unbound.
            unsafe {
                device.destroy_raw_buffer(handle);
                device.free_raw_memory(memory);
            }
            return Err(ErrorKind::FailedToBindBufferMemory.native()(e));
        }

        let memory_flags = device.memory_properties().memory_types
            [memory_type_index as usize]
            .property_flags;
        let core = Arc::new(BufferCore {
            context: Arc::clone(ctx),
            handle,
            memory,
            mapping: AtomicPtr::new(ptr::null_mut()),
            released: AtomicBool::new(false),
        });
        let key = ctx
            .registry()
            .map(|registry| registry.register_buffer(Arc::clone(&core)));

        tracing::debug!(
            "Created buffer {:?}: {size} bytes ({} allocated) in memory \
             type {memory_type_index}",
            handle,
            reqs.size
        );

        Ok(Self {
            core,
            key,
            size,
            allocation_size: reqs.size,
            usage,
            memory_flags,
        })
    }

    /// The size requested at creation.
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// The allocation size the driver reported for this buffer.
    pub fn allocation_size(&self) -> vk::DeviceSize {
        self.allocation_size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// Property flags of the memory type the buffer was allocated from.
    /// Always a superset of the flags requested at creation.
    pub fn memory_properties(&self) -> vk::MemoryPropertyFlags {
        self.memory_flags
    }

    pub fn raw_buffer(&self) -> vk::Buffer {
        self.core.handle
    }

    pub fn raw_memory(&self) -> vk::DeviceMemory {
        self.core.memory
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.core.context
    }

    pub fn is_memory_mapped(&self) -> bool {
        !self.core.mapping.load(Ordering::Acquire).is_null()
    }

    /// The active host mapping, if any. Covers the whole allocation.
    pub fn mapping(&self) -> Option<NonNull<c_void>> {
        NonNull::new(self.core.mapping.load(Ordering::Acquire))
    }

    /// Map the whole allocation into host memory.
    ///
    /// Does nothing if the buffer is already mapped. Memory that is not
    /// `HOST_VISIBLE` is rejected with `ERROR_MEMORY_MAP_FAILED` without
    /// calling the driver. On error the buffer stays unmapped.
    pub fn map_memory(&mut self) -> Result<(), vk::Result> {
        if self.is_memory_mapped() {
            return Ok(());
        }
        if !self
            .memory_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
        {
            tracing::warn!(
                "Refusing to map buffer {:?}: memory is not host visible",
                self.core.handle
            );
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }

        // SAFETY: memory is host visible, belongs to this device and is
        // not currently mapped.
        let mapped = unsafe {
            self.core.context.device().map_raw_memory(
                self.core.memory,
                0,
                vk::WHOLE_SIZE,
                vk::MemoryMapFlags::empty(),
            )
        }
        .inspect_err(|e| {
            tracing::warn!("Failed to map buffer {:?}: {e:?}", self.core.handle);
        })?;
        self.core.mapping.store(mapped, Ordering::Release);
        Ok(())
    }

    /// Release the host mapping. Does nothing if the buffer is not mapped.
    pub fn unmap_memory(&mut self) {
        let mapping = self.core.mapping.swap(ptr::null_mut(), Ordering::AcqRel);
        if !mapping.is_null() {
            // SAFETY: a non-null mapping means memory is currently mapped.
            unsafe { self.core.context.device().unmap_raw_memory(self.core.memory) };
        }
    }

    /// View the mapped bytes, `size()` long.
    ///
    /// Returns `None` when the buffer is not mapped.
    ///
    /// # Safety
    /// No GPU work writing to this buffer may be pending. For memory that
    /// is not `HOST_COHERENT` the host cache is not invalidated; use
    /// [`read_pod`](Self::read_pod) for such memory.
    pub unsafe fn mapped_bytes(&self) -> Option<&[u8]> {
        let mapping = self.mapping()?;
        // SAFETY: the mapping covers the whole allocation, which is at
        // least `size` bytes, and stays valid while `&self` is borrowed
        // because unmapping requires `&mut self`.
        Some(unsafe {
            std::slice::from_raw_parts(
                mapping.as_ptr().cast::<u8>(),
                self.size as usize,
            )
        })
    }

    /// Copy `size()` bytes from `src` into the buffer through a temporary
    /// mapping. The buffer is left unmapped afterwards.
    ///
    /// # Safety
    /// `src` must be valid for reads of `size()` bytes and must not
    /// overlap the mapping. No GPU work may be accessing the buffer.
    pub unsafe fn copy_unchecked_from(
        &mut self,
        src: *const u8,
    ) -> Result<(), ErrorPair> {
        self.map_memory()
            .map_err(|e| ErrorPair::native(e, ErrorKind::FailedToMapMemory))?;
        let dst = self.core.mapping.load(Ordering::Acquire).cast::<u8>();
        // SAFETY: dst is a live mapping of at least `size` bytes; the caller
        // guarantees src is readable for `size` bytes and does not overlap.
        unsafe { ptr::copy_nonoverlapping(src, dst, self.size as usize) };
        let flushed = self.flush_host_writes();
        self.unmap_memory();
        flushed
    }

    /// Copy `data` to the start of the buffer.
    ///
    /// Fails with [`ErrorKind::DataTooLarge`] if `data` is larger than
    /// `size()`. A buffer that was already mapped stays mapped, otherwise
    /// the temporary mapping is released again. Non-coherent memory is
    /// flushed.
    pub fn write_pod<T: Pod>(&mut self, data: &[T]) -> Result<(), ErrorPair> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.len() as vk::DeviceSize > self.size {
            tracing::debug!(
                "write of {} bytes rejected by {}-byte buffer {:?}",
                bytes.len(),
                self.size,
                self.core.handle
            );
            return Err(ErrorPair::library(ErrorKind::DataTooLarge));
        }

        let was_mapped = self.is_memory_mapped();
        self.map_memory()
            .map_err(|e| ErrorPair::native(e, ErrorKind::FailedToMapMemory))?;
        let dst = self.core.mapping.load(Ordering::Acquire).cast::<u8>();
        // SAFETY: dst is a live mapping of at least `size` bytes and
        // bytes.len() has been bounds-checked above. A host slice cannot
        // overlap device memory mapped for this buffer.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len()) };
        let flushed = self.flush_host_writes();
        if !was_mapped {
            self.unmap_memory();
        }
        flushed
    }

    /// Copy the start of the buffer into `out`.
    ///
    /// Same size and mapping rules as [`write_pod`](Self::write_pod).
    /// Non-coherent memory is invalidated before reading.
    pub fn read_pod<T: Pod>(&mut self, out: &mut [T]) -> Result<(), ErrorPair> {
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(out);
        if bytes.len() as vk::DeviceSize > self.size {
            return Err(ErrorPair::library(ErrorKind::DataTooLarge));
        }

        let was_mapped = self.is_memory_mapped();
        self.map_memory()
            .map_err(|e| ErrorPair::native(e, ErrorKind::FailedToMapMemory))?;
        let result = self.invalidate_host_reads().map(|()| {
            let src = self.core.mapping.load(Ordering::Acquire).cast::<u8>();
            // SAFETY: src is a live mapping of at least `size` bytes and
            // bytes.len() has been bounds-checked above.
            unsafe {
                ptr::copy_nonoverlapping(src, bytes.as_mut_ptr(), bytes.len())
            };
        });
        if !was_mapped {
            self.unmap_memory();
        }
        result
    }

    /// Copy the whole buffer into `destination` on the GPU and wait for
    /// the copy to finish.
    ///
    /// Both buffers must have the same requested size, otherwise this
    /// fails with [`ErrorKind::BufferSizeMismatch`] before any driver call.
    /// Buffers from different devices, a source without `TRANSFER_SRC`
    /// usage or a destination without `TRANSFER_DST` fail with
    /// [`ErrorKind::IncompatibleBuffers`], also without a driver call.
    /// See [`copy_to_raw_unchecked`](Self::copy_to_raw_unchecked) for the
    /// submission itself.
    pub fn copy_to(&self, destination: &mut Buffer) -> Result<(), ErrorPair> {
        if self.size != destination.size {
            tracing::debug!(
                "copy from {:?} ({} bytes) to {:?} ({} bytes) rejected",
                self.core.handle,
                self.size,
                destination.core.handle,
                destination.size
            );
            return Err(ErrorPair::library(ErrorKind::BufferSizeMismatch));
        }
        check_transfer_pair(self.context().device(), self, destination)?;
        // SAFETY: both buffers are live for the duration of this call, which
        // does not return until the copy has completed. They share the
        // context's device, carry transfer usage, and the sizes match so the
        // full-size region is in bounds for both.
        unsafe { self.copy_to_raw_unchecked(destination.raw_buffer()) }
    }

    /// Copy `size()` bytes into `destination` with a one-shot command
    /// buffer, blocking until the GPU has finished.
    ///
    /// Steps: allocate a primary command buffer from the context's pool,
    /// begin it with `ONE_TIME_SUBMIT`, record one copy, end, submit to
    /// the context's queue, wait (see [`TransferWait`]), free. The first
    /// failing step is returned; the temporary command buffer is freed on
    /// every path once allocated.
    ///
    /// # Safety
    /// `destination` must be a valid buffer from the same device with
    /// `TRANSFER_DST` usage and at least `size()` bytes, and must stay
    /// alive until this call returns.
    pub unsafe fn copy_to_raw_unchecked(
        &self,
        destination: vk::Buffer,
    ) -> Result<(), ErrorPair> {
        one_shot_copy(
            &self.core.context,
            self.core.handle,
            destination,
            self.size,
        )
    }

    /// Flush host writes over the whole allocation if the memory is not
    /// `HOST_COHERENT`. Must be called while mapped.
    fn flush_host_writes(&self) -> Result<(), ErrorPair> {
        if self.is_coherent() {
            return Ok(());
        }
        let range = self.whole_range();
        // SAFETY: memory is currently mapped and belongs to this device.
        unsafe {
            self.core
                .context
                .device()
                .flush_raw_mapped_memory_ranges(std::slice::from_ref(&range))
        }
        .map_err(ErrorKind::FailedToMapMemory.native())
    }

    fn invalidate_host_reads(&self) -> Result<(), ErrorPair> {
        if self.is_coherent() {
            return Ok(());
        }
        let range = self.whole_range();
        // SAFETY: memory is currently mapped and belongs to this device.
        unsafe {
            self.core
                .context
                .device()
                .invalidate_raw_mapped_memory_ranges(std::slice::from_ref(
                    &range,
                ))
        }
        .map_err(ErrorKind::FailedToMapMemory.native())
    }

    fn is_coherent(&self) -> bool {
        self.memory_flags
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }

    fn whole_range(&self) -> vk::MappedMemoryRange<'static> {
        vk::MappedMemoryRange::default()
            .memory(self.core.memory)
            .offset(0)
            .size(vk::WHOLE_SIZE)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let (Some(key), Some(registry)) =
            (self.key, self.core.context.registry())
        {
            registry.unregister_buffer(key);
        }
        self.core.release();
    }
}

/// Reject a copy from `src` to `dst` recorded on `device` unless both
/// buffers were created from that device and carry the transfer usage
/// the copy needs.
pub(crate) fn check_transfer_pair(
    device: &dyn RawDevice,
    src: &Buffer,
    dst: &Buffer,
) -> Result<(), ErrorPair> {
    let raw_device = device.raw_device();
    let same_device = src.context().device().raw_device() == raw_device
        && dst.context().device().raw_device() == raw_device;
    let usable = src.usage.contains(vk::BufferUsageFlags::TRANSFER_SRC)
        && dst.usage.contains(vk::BufferUsageFlags::TRANSFER_DST);
    if same_device && usable {
        return Ok(());
    }
    tracing::debug!(
        "copy from {:?} ({:?}) to {:?} ({:?}) rejected, same device: {same_device}",
        src.core.handle,
        src.usage,
        dst.core.handle,
        dst.usage
    );
    Err(ErrorPair::library(ErrorKind::IncompatibleBuffers))
}

/// A command buffer borrowed from the context's pool for one transfer.
/// Freed on drop; if a submission may still be executing, the device is
/// drained first.
struct TransientCommandBuffer<'a> {
    context: &'a Context,
    handle: vk::CommandBuffer,
    fence: vk::Fence,
    pending: bool,
}

impl TransientCommandBuffer<'_> {
    fn submit(&mut self, queue: vk::Queue) -> Result<(), ErrorPair> {
        let submit_info = vk::SubmitInfo::default()
            .command_buffers(std::slice::from_ref(&self.handle));
        // SAFETY: the command buffer is executable, the caller holds the
        // queue lock, and fence is either null or a fresh unsignaled fence.
        unsafe {
            self.context.device().queue_submit(
                queue,
                std::slice::from_ref(&submit_info),
                self.fence,
            )
        }
        .map_err(ErrorKind::FailedToSubmitCommandBuffer.native())?;
        self.pending = true;
        Ok(())
    }
}

impl Drop for TransientCommandBuffer<'_> {
    fn drop(&mut self) {
        let device = self.context.device();
        if self.pending {
            tracing::warn!(
                "Transfer command buffer {:?} may still be executing; \
                 waiting for device idle before freeing it",
                self.handle
            );
            let _queue = self.context.lock_queue();
            // SAFETY: the context's only queue is locked for the duration
            // of the wait.
            if let Err(e) = unsafe { device.device_wait_idle() } {
                tracing::error!("Device wait idle failed: {e:?}");
            }
        }
        let pool = self.context.lock_command_pool();
        // SAFETY: handle was allocated from this pool and is no longer
        // pending; the pool lock is held.
        unsafe {
            device.free_raw_command_buffers(
                *pool,
                std::slice::from_ref(&self.handle),
            )
        };
        if self.fence != vk::Fence::null() {
            // SAFETY: fence was created from this device and the submission
            // that used it has completed.
            unsafe { device.destroy_raw_fence(self.fence) };
        }
    }
}

fn one_shot_copy(
    context: &Context,
    src: vk::Buffer,
    dst: vk::Buffer,
    size: vk::DeviceSize,
) -> Result<(), ErrorPair> {
    let _span = tracing::debug_span!("one_shot_copy", size).entered();
    let device = context.device();

    let handle = {
        let pool = context.lock_command_pool();
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(*pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        // SAFETY: allocate_info references the context's pool, which is
        // locked for the duration of the call.
        unsafe { device.allocate_raw_command_buffers(&allocate_info) }
            .map_err(ErrorKind::FailedToAllocateCommandBuffer.native())?
            .into_iter()
            .next()
            .ok_or(ErrorPair::library(
                ErrorKind::FailedToAllocateCommandBuffer,
            ))?
    };
    let mut transient = TransientCommandBuffer {
        context,
        handle,
        fence: vk::Fence::null(),
        pending: false,
    };

    let begin_info = vk::CommandBufferBeginInfo::default()
        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    // SAFETY: handle was freshly allocated and is in the initial state.
    unsafe { device.begin_raw_command_buffer(handle, &begin_info) }
        .map_err(ErrorKind::FailedToBeginCommandBuffer.native())?;

    let region = vk::BufferCopy::default()
        .src_offset(0)
        .dst_offset(0)
        .size(size);
    // SAFETY: handle is recording; the caller guarantees both buffers are
    // valid with transfer usage and the region is in bounds.
    unsafe {
        device.cmd_copy_buffer(handle, src, dst, std::slice::from_ref(&region))
    };

    // SAFETY: handle is recording.
    unsafe { device.end_raw_command_buffer(handle) }
        .map_err(ErrorKind::FailedToEndCommandBuffer.native())?;

    match context.config().transfer_wait {
        TransferWait::QueueIdle => {
            let queue = context.lock_queue();
            transient.submit(*queue)?;
            let _wait = tracing::debug_span!("queue_wait_idle").entered();
            // SAFETY: queue belongs to this device and is locked.
            unsafe { device.queue_wait_idle(*queue) }
                .map_err(ErrorKind::FailedWaitingForQueueToFinish.native())?;
        }
        TransferWait::Fence { timeout_ns } => {
            let fence_info = vk::FenceCreateInfo::default();
            // SAFETY: fence_info is fully initialised.
            transient.fence = unsafe { device.create_raw_fence(&fence_info) }
                .map_err(ErrorKind::FailedToSubmitCommandBuffer.native())?;
            transient.submit(*context.lock_queue())?;
            let _wait = tracing::debug_span!("wait_for_fence").entered();
            // SAFETY: the fence was created from this device above.
            unsafe {
                device.wait_for_raw_fences(
                    std::slice::from_ref(&transient.fence),
                    true,
                    timeout_ns,
                )
            }
            .map_err(ErrorKind::FailedWaitingForQueueToFinish.native())?;
        }
    }

    transient.pending = false;
    Ok(())
}
