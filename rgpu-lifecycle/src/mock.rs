//! A call-counting stand-in for a Vulkan device, used by the unit tests.
//!
//! Handles are plain counters. Device memory is backed by host bytes, so
//! mapping hands out a real pointer and a submitted `cmd_copy_buffer`
//! actually moves bytes between allocations. Failures can be injected per
//! entry point with [`MockDevice::fail`].
//!
//! Misuse that a validation layer would flag (freeing mapped memory,
//! freeing memory a live buffer is bound to, recording outside
//! begin/end, touching unknown handles) panics.

use std::collections::{HashMap, HashSet};
use std::ffi::c_void;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ash::vk::{self, Handle};

use crate::context::{Context, ContextConfig};
use crate::device::RawDevice;
use crate::registry::Registry;

pub(crate) const ALLOCATION_GRANULARITY: vk::DeviceSize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Call {
    CreateBuffer,
    DestroyBuffer,
    GetBufferMemoryRequirements,
    AllocateMemory,
    FreeMemory,
    BindBufferMemory,
    MapMemory,
    UnmapMemory,
    FlushMappedMemoryRanges,
    InvalidateMappedMemoryRanges,
    AllocateCommandBuffers,
    FreeCommandBuffers,
    BeginCommandBuffer,
    EndCommandBuffer,
    CmdCopyBuffer,
    QueueSubmit,
    QueueWaitIdle,
    CreateFence,
    DestroyFence,
    WaitForFences,
    DeviceWaitIdle,
}

#[derive(Debug)]
struct MockBuffer {
    size: vk::DeviceSize,
    memory: Option<u64>,
}

#[derive(Debug)]
struct MockMemory {
    data: Box<[u8]>,
    mapped: bool,
}

#[derive(Debug, Default)]
struct MockCommandBuffer {
    recording: bool,
    executable: bool,
    copies: Vec<(u64, u64, vk::BufferCopy)>,
}

#[derive(Debug, Default)]
struct State {
    next_handle: u64,
    calls: HashMap<Call, usize>,
    events: Vec<Call>,
    failures: HashMap<Call, vk::Result>,
    buffers: HashMap<u64, MockBuffer>,
    memories: HashMap<u64, MockMemory>,
    command_buffers: HashMap<u64, MockCommandBuffer>,
    fences: HashSet<u64>,
    last_begin_flags: vk::CommandBufferUsageFlags,
    last_submit_fence: Option<u64>,
}

impl State {
    fn next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

static NEXT_DEVICE: AtomicU64 = AtomicU64::new(0xde71ce);

pub(crate) struct MockDevice {
    handle: vk::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    state: Mutex<State>,
}

impl MockDevice {
    /// Memory types: 0 device local, 1 host visible + coherent, 2 host
    /// visible + cached (not coherent).
    pub(crate) fn new() -> Arc<Self> {
        use vk::MemoryPropertyFlags as F;
        Self::with_memory_types(&[
            F::DEVICE_LOCAL,
            F::HOST_VISIBLE | F::HOST_COHERENT,
            F::HOST_VISIBLE | F::HOST_CACHED,
        ])
    }

    pub(crate) fn with_memory_types(
        types: &[vk::MemoryPropertyFlags],
    ) -> Arc<Self> {
        let mut memory_properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            memory_heap_count: 1,
            ..Default::default()
        };
        for (slot, &flags) in memory_properties.memory_types.iter_mut().zip(types)
        {
            *slot = vk::MemoryType {
                property_flags: flags,
                heap_index: 0,
            };
        }
        Arc::new(Self {
            handle: vk::Device::from_raw(NEXT_DEVICE.fetch_add(1, Ordering::Relaxed)),
            memory_properties,
            state: Mutex::new(State::default()),
        })
    }

    /// Make every later call to `call` fail with `result`.
    pub(crate) fn fail(&self, call: Call, result: vk::Result) {
        self.lock().failures.insert(call, result);
    }

    pub(crate) fn succeed(&self, call: Call) {
        self.lock().failures.remove(&call);
    }

    pub(crate) fn calls(&self, call: Call) -> usize {
        self.lock().calls.get(&call).copied().unwrap_or(0)
    }

    pub(crate) fn total_calls(&self) -> usize {
        self.lock().calls.values().sum()
    }

    /// Every call made so far, in order.
    pub(crate) fn events(&self) -> Vec<Call> {
        self.lock().events.clone()
    }

    pub(crate) fn clear_events(&self) {
        let mut state = self.lock();
        state.events.clear();
        state.calls.clear();
    }

    pub(crate) fn live_buffers(&self) -> usize {
        self.lock().buffers.len()
    }

    pub(crate) fn live_memory(&self) -> usize {
        self.lock().memories.len()
    }

    pub(crate) fn live_command_buffers(&self) -> usize {
        self.lock().command_buffers.len()
    }

    pub(crate) fn live_fences(&self) -> usize {
        self.lock().fences.len()
    }

    pub(crate) fn live_mappings(&self) -> usize {
        self.lock().memories.values().filter(|m| m.mapped).count()
    }

    pub(crate) fn is_live_command_buffer(&self, handle: vk::CommandBuffer) -> bool {
        self.lock().command_buffers.contains_key(&handle.as_raw())
    }

    pub(crate) fn last_begin_flags(&self) -> vk::CommandBufferUsageFlags {
        self.lock().last_begin_flags
    }

    pub(crate) fn last_submit_fence(&self) -> Option<vk::Fence> {
        self.lock().last_submit_fence.map(vk::Fence::from_raw)
    }

    /// Contents of a live allocation, bypassing any mapping.
    pub(crate) fn memory_bytes(&self, memory: vk::DeviceMemory) -> Vec<u8> {
        self.lock().memories[&memory.as_raw()].data.to_vec()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(&self, call: Call) -> MutexGuard<'_, State> {
        let mut state = self.lock();
        *state.calls.entry(call).or_default() += 1;
        state.events.push(call);
        state
    }

    fn enter_fallible(
        &self,
        call: Call,
    ) -> Result<MutexGuard<'_, State>, vk::Result> {
        let state = self.enter(call);
        match state.failures.get(&call) {
            Some(&result) => Err(result),
            None => Ok(state),
        }
    }
}

impl RawDevice for MockDevice {
    fn raw_device(&self) -> vk::Device {
        self.handle
    }

    fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    unsafe fn create_raw_buffer(
        &self,
        create_info: &vk::BufferCreateInfo<'_>,
    ) -> Result<vk::Buffer, vk::Result> {
        let mut state = self.enter_fallible(Call::CreateBuffer)?;
        let handle = state.next_handle();
        state.buffers.insert(
            handle,
            MockBuffer {
                size: create_info.size,
                memory: None,
            },
        );
        Ok(vk::Buffer::from_raw(handle))
    }

    unsafe fn destroy_raw_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.enter(Call::DestroyBuffer);
        assert!(
            state.buffers.remove(&buffer.as_raw()).is_some(),
            "destroying unknown buffer {buffer:?}"
        );
    }

    unsafe fn get_raw_buffer_memory_requirements(
        &self,
        buffer: vk::Buffer,
    ) -> vk::MemoryRequirements {
        let state = self.enter(Call::GetBufferMemoryRequirements);
        let size = state.buffers[&buffer.as_raw()].size;
        vk::MemoryRequirements {
            size: size.div_ceil(ALLOCATION_GRANULARITY) * ALLOCATION_GRANULARITY,
            alignment: ALLOCATION_GRANULARITY,
            memory_type_bits: (1u32 << self.memory_properties.memory_type_count)
                - 1,
        }
    }

    unsafe fn allocate_raw_memory(
        &self,
        allocate_info: &vk::MemoryAllocateInfo<'_>,
    ) -> Result<vk::DeviceMemory, vk::Result> {
        let mut state = self.enter_fallible(Call::AllocateMemory)?;
        assert!(
            allocate_info.memory_type_index < self.memory_properties.memory_type_count,
            "memory type index out of range"
        );
        let handle = state.next_handle();
        state.memories.insert(
            handle,
            MockMemory {
                data: vec![0; allocate_info.allocation_size as usize]
                    .into_boxed_slice(),
                mapped: false,
            },
        );
        Ok(vk::DeviceMemory::from_raw(handle))
    }

    unsafe fn free_raw_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.enter(Call::FreeMemory);
        let raw = memory.as_raw();
        assert!(
            state.buffers.values().all(|b| b.memory != Some(raw)),
            "freeing memory {memory:?} while a buffer is still bound to it"
        );
        let freed = state
            .memories
            .remove(&raw)
            .unwrap_or_else(|| panic!("freeing unknown memory {memory:?}"));
        assert!(!freed.mapped, "freeing memory {memory:?} while mapped");
    }

    unsafe fn bind_raw_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        let mut state = self.enter_fallible(Call::BindBufferMemory)?;
        assert_eq!(offset, 0);
        assert!(state.memories.contains_key(&memory.as_raw()));
        let bound = state
            .buffers
            .get_mut(&buffer.as_raw())
            .expect("binding unknown buffer");
        assert!(bound.memory.is_none(), "buffer bound twice");
        bound.memory = Some(memory.as_raw());
        Ok(())
    }

    unsafe fn map_raw_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        _size: vk::DeviceSize,
        _flags: vk::MemoryMapFlags,
    ) -> Result<*mut c_void, vk::Result> {
        let mut state = self.enter_fallible(Call::MapMemory)?;
        let mapped = state
            .memories
            .get_mut(&memory.as_raw())
            .expect("mapping unknown memory");
        assert!(!mapped.mapped, "memory {memory:?} mapped twice");
        mapped.mapped = true;
        Ok(mapped.data[offset as usize..].as_mut_ptr().cast())
    }

    unsafe fn unmap_raw_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.enter(Call::UnmapMemory);
        let mapped = state
            .memories
            .get_mut(&memory.as_raw())
            .expect("unmapping unknown memory");
        assert!(mapped.mapped, "unmapping memory {memory:?} that is not mapped");
        mapped.mapped = false;
    }

    unsafe fn flush_raw_mapped_memory_ranges(
        &self,
        memory_ranges: &[vk::MappedMemoryRange<'_>],
    ) -> Result<(), vk::Result> {
        let state = self.enter_fallible(Call::FlushMappedMemoryRanges)?;
        for range in memory_ranges {
            assert!(state.memories[&range.memory.as_raw()].mapped);
        }
        Ok(())
    }

    unsafe fn invalidate_raw_mapped_memory_ranges(
        &self,
        memory_ranges: &[vk::MappedMemoryRange<'_>],
    ) -> Result<(), vk::Result> {
        let state = self.enter_fallible(Call::InvalidateMappedMemoryRanges)?;
        for range in memory_ranges {
            assert!(state.memories[&range.memory.as_raw()].mapped);
        }
        Ok(())
    }

    unsafe fn allocate_raw_command_buffers(
        &self,
        allocate_info: &vk::CommandBufferAllocateInfo<'_>,
    ) -> Result<Vec<vk::CommandBuffer>, vk::Result> {
        let mut state = self.enter_fallible(Call::AllocateCommandBuffers)?;
        Ok((0..allocate_info.command_buffer_count)
            .map(|_| {
                let handle = state.next_handle();
                state
                    .command_buffers
                    .insert(handle, MockCommandBuffer::default());
                vk::CommandBuffer::from_raw(handle)
            })
            .collect())
    }

    unsafe fn free_raw_command_buffers(
        &self,
        _pool: vk::CommandPool,
        command_buffers: &[vk::CommandBuffer],
    ) {
        let mut state = self.enter(Call::FreeCommandBuffers);
        for cb in command_buffers {
            assert!(
                state.command_buffers.remove(&cb.as_raw()).is_some(),
                "freeing unknown command buffer {cb:?}"
            );
        }
    }

    unsafe fn begin_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::CommandBufferBeginInfo<'_>,
    ) -> Result<(), vk::Result> {
        let mut state = self.enter_fallible(Call::BeginCommandBuffer)?;
        let cb = state
            .command_buffers
            .get_mut(&command_buffer.as_raw())
            .expect("beginning unknown command buffer");
        assert!(!cb.recording, "begin while recording");
        *cb = MockCommandBuffer {
            recording: true,
            ..Default::default()
        };
        state.last_begin_flags = begin_info.flags;
        Ok(())
    }

    unsafe fn end_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), vk::Result> {
        let mut state = self.enter_fallible(Call::EndCommandBuffer)?;
        let cb = state
            .command_buffers
            .get_mut(&command_buffer.as_raw())
            .expect("ending unknown command buffer");
        assert!(cb.recording, "end while not recording");
        cb.recording = false;
        cb.executable = true;
        Ok(())
    }

    unsafe fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src_buffer: vk::Buffer,
        dst_buffer: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        let mut state = self.enter(Call::CmdCopyBuffer);
        for (buffer, is_src) in [(src_buffer, true), (dst_buffer, false)] {
            let size = state.buffers[&buffer.as_raw()].size;
            for r in regions {
                let offset = if is_src { r.src_offset } else { r.dst_offset };
                assert!(offset + r.size <= size, "copy region out of bounds");
            }
        }
        let cb = state
            .command_buffers
            .get_mut(&command_buffer.as_raw())
            .expect("recording into unknown command buffer");
        assert!(cb.recording, "cmd_copy_buffer outside begin/end");
        cb.copies.extend(
            regions
                .iter()
                .map(|r| (src_buffer.as_raw(), dst_buffer.as_raw(), *r)),
        );
    }

    unsafe fn queue_submit(
        &self,
        _queue: vk::Queue,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> Result<(), vk::Result> {
        let mut state = self.enter_fallible(Call::QueueSubmit)?;
        state.last_submit_fence = (fence != vk::Fence::null()).then(|| fence.as_raw());

        let mut copies = Vec::new();
        for submit in submits {
            // SAFETY: SubmitInfo built by the caller points at
            // command_buffer_count live handles.
            let handles = unsafe {
                std::slice::from_raw_parts(
                    submit.p_command_buffers,
                    submit.command_buffer_count as usize,
                )
            };
            for handle in handles {
                let cb = &state.command_buffers[&handle.as_raw()];
                assert!(cb.executable, "submitting a command buffer that is not executable");
                copies.extend(cb.copies.iter().copied());
            }
        }
        // Work completes immediately.
        for (src, dst, region) in copies {
            let src_memory = state.buffers[&src].memory.expect("unbound source");
            let dst_memory = state.buffers[&dst].memory.expect("unbound destination");
            let start = region.src_offset as usize;
            let bytes = state.memories[&src_memory].data
                [start..start + region.size as usize]
                .to_vec();
            let start = region.dst_offset as usize;
            state
                .memories
                .get_mut(&dst_memory)
                .expect("destination memory freed")
                .data[start..start + bytes.len()]
                .copy_from_slice(&bytes);
        }
        Ok(())
    }

    unsafe fn queue_wait_idle(&self, _queue: vk::Queue) -> Result<(), vk::Result> {
        self.enter_fallible(Call::QueueWaitIdle).map(drop)
    }

    unsafe fn create_raw_fence(
        &self,
        _create_info: &vk::FenceCreateInfo<'_>,
    ) -> Result<vk::Fence, vk::Result> {
        let mut state = self.enter_fallible(Call::CreateFence)?;
        let handle = state.next_handle();
        state.fences.insert(handle);
        Ok(vk::Fence::from_raw(handle))
    }

    unsafe fn destroy_raw_fence(&self, fence: vk::Fence) {
        let mut state = self.enter(Call::DestroyFence);
        assert!(state.fences.remove(&fence.as_raw()), "destroying unknown fence");
    }

    unsafe fn wait_for_raw_fences(
        &self,
        fences: &[vk::Fence],
        _wait_all: bool,
        _timeout_ns: u64,
    ) -> Result<(), vk::Result> {
        let state = self.enter_fallible(Call::WaitForFences)?;
        for fence in fences {
            assert!(state.fences.contains(&fence.as_raw()), "waiting on unknown fence");
        }
        Ok(())
    }

    unsafe fn device_wait_idle(&self) -> Result<(), vk::Result> {
        self.enter_fallible(Call::DeviceWaitIdle).map(drop)
    }
}

/// A mock device wrapped in a context owned by a private registry.
pub(crate) fn mock_context() -> (Arc<MockDevice>, Arc<Registry>, Arc<Context>) {
    mock_context_with_config(ContextConfig::default())
}

pub(crate) fn mock_context_with_config(
    config: ContextConfig,
) -> (Arc<MockDevice>, Arc<Registry>, Arc<Context>) {
    let device = MockDevice::new();
    let registry = Registry::new();
    let context = context_in(&registry, &device, config);
    (device, registry, context)
}

/// A context over `device` registered in `registry`.
pub(crate) fn context_in(
    registry: &Arc<Registry>,
    device: &Arc<MockDevice>,
    config: ContextConfig,
) -> Arc<Context> {
    registry.create_context(
        vk::PhysicalDevice::from_raw(0x9417),
        device.clone(),
        vk::Queue::from_raw(0x9e9e),
        vk::CommandPool::from_raw(0x9001),
        config,
    )
}
