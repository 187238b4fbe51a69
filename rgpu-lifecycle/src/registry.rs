//! The ownership arena tracking every live context, buffer and command
//! buffer.
//!
//! Each successful `create` call inserts a record under the registry's
//! mutex. Dropping a [`Buffer`] or [`CommandBuffer`] removes its record
//! and releases it; [`Registry::shutdown`] (or [`cleanup`] for the
//! process-wide registry) drains whatever is left and releases it in
//! one pass. The lock is held only while inserting, removing or
//! draining, never across driver calls made by individual objects.
//!
//! Release is idempotent per object, so an object drained by `shutdown`
//! is not released again when its handle is dropped later.
//!
//! [`Buffer`]: crate::Buffer
//! [`CommandBuffer`]: crate::CommandBuffer

use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};

use ash::vk;
use slotmap::{SlotMap, new_key_type};

use crate::buffer::BufferCore;
use crate::command::CommandBufferCore;
use crate::context::{Context, ContextConfig};
use crate::device::RawDevice;

new_key_type! {
    pub(crate) struct BufferKey;
    pub(crate) struct CommandBufferKey;
}

static GLOBAL: LazyLock<Arc<Registry>> = LazyLock::new(Registry::new);

#[derive(Default)]
struct Records {
    contexts: Vec<Arc<Context>>,
    buffers: SlotMap<BufferKey, Arc<BufferCore>>,
    command_buffers: SlotMap<CommandBufferKey, Arc<CommandBufferCore>>,
}

/// Registry of live objects, guarded by one mutex.
///
/// Most programs use the process-wide instance through
/// [`Context::create`] and [`cleanup`]. A private registry (one per
/// device, or per test) is created with [`Registry::new`] and populated
/// with [`Registry::create_context`]. Dropping a private registry
/// without calling [`shutdown`](Self::shutdown) releases nothing; each
/// object is then released when its own handle is dropped.
pub struct Registry {
    records: Mutex<Records>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let records = self.lock();
        f.debug_struct("Registry")
            .field("contexts", &records.contexts.len())
            .field("buffers", &records.buffers.len())
            .field("command_buffers", &records.command_buffers.len())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(Records::default()),
        })
    }

    /// The process-wide registry used by [`Context::create`].
    pub fn global() -> &'static Arc<Registry> {
        &GLOBAL
    }

    /// Create a context owned by this registry.
    pub fn create_context(
        self: &Arc<Self>,
        physical_device: vk::PhysicalDevice,
        device: Arc<dyn RawDevice>,
        queue: vk::Queue,
        command_pool: vk::CommandPool,
        config: ContextConfig,
    ) -> Arc<Context> {
        let context = Arc::new(Context::new(
            physical_device,
            device,
            queue,
            command_pool,
            config,
            Arc::downgrade(self),
        ));
        tracing::debug!("Registering context {:?}", context);
        self.lock().contexts.push(Arc::clone(&context));
        context
    }

    pub(crate) fn register_buffer(&self, core: Arc<BufferCore>) -> BufferKey {
        self.lock().buffers.insert(core)
    }

    pub(crate) fn unregister_buffer(
        &self,
        key: BufferKey,
    ) -> Option<Arc<BufferCore>> {
        self.lock().buffers.remove(key)
    }

    pub(crate) fn register_command_buffer(
        &self,
        core: Arc<CommandBufferCore>,
    ) -> CommandBufferKey {
        self.lock().command_buffers.insert(core)
    }

    pub(crate) fn unregister_command_buffer(
        &self,
        key: CommandBufferKey,
    ) -> Option<Arc<CommandBufferCore>> {
        self.lock().command_buffers.remove(key)
    }

    pub fn live_contexts(&self) -> usize {
        self.lock().contexts.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.lock().buffers.len()
    }

    pub fn live_command_buffers(&self) -> usize {
        self.lock().command_buffers.len()
    }

    /// Release every registered buffer and command buffer, then drop
    /// the registry's context references.
    ///
    /// The lock is taken once for the whole drain. Buffers and command
    /// buffers are released before any context reference is dropped.
    /// Objects created after this call are registered normally.
    ///
    /// # Safety
    /// - No GPU work referencing a registered object may be pending.
    /// - Surviving [`Buffer`](crate::Buffer) and
    ///   [`CommandBuffer`](crate::CommandBuffer) handles must not be used
    ///   afterwards except to be dropped.
    /// - No other thread may be using a registered object concurrently.
    pub unsafe fn shutdown(&self) {
        let mut records = self.lock();
        let buffers = records.buffers.len();
        let command_buffers = records.command_buffers.len();
        let contexts = records.contexts.len();

        for (_, buffer) in records.buffers.drain() {
            buffer.release();
        }
        for (_, command_buffer) in records.command_buffers.drain() {
            command_buffer.release();
        }
        records.contexts.clear();

        tracing::info!(
            "Registry shutdown released {buffers} buffers, \
             {command_buffers} command buffers, {contexts} contexts"
        );
    }

    fn lock(&self) -> MutexGuard<'_, Records> {
        // Records stay consistent even if a holder panicked: every
        // critical section is a single insert, remove or drain.
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Release everything registered in the process-wide registry.
///
/// Call this once, after the last use of any object from this crate and
/// before destroying the command pool, the device or the instance.
///
/// # Safety
/// See [`Registry::shutdown`].
pub unsafe fn cleanup() {
    // SAFETY: Caller upholds Registry::shutdown's contract.
    unsafe { Registry::global().shutdown() }
}
