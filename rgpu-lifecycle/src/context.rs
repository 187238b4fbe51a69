//! The shared, immutable device bundle ([`Context`]) and its
//! configuration.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use ash::vk;

use crate::device::{AshDevice, RawDevice};
use crate::registry::Registry;

/// How the one-shot transfer inside [`Buffer::copy_to`] waits for the
/// GPU.
///
/// [`Buffer::copy_to`]: crate::Buffer::copy_to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferWait {
    /// Submit without a fence and block in `vkQueueWaitIdle`.
    #[default]
    QueueIdle,
    /// Submit with a temporary fence and wait at most `timeout_ns`.
    /// A timeout fails the transfer with `vk::Result::TIMEOUT`.
    Fence { timeout_ns: u64 },
}

#[derive(Debug, Clone, Default)]
pub struct ContextConfig {
    pub transfer_wait: TransferWait,
}

/// The device handles every buffer and command buffer is created
/// against.
///
/// A context never changes after creation and is shared as
/// `Arc<Context>`. The registry it was created in keeps one reference
/// until [`Registry::shutdown`]. None of the wrapped handles are
/// destroyed by this crate.
///
/// The queue and the command pool require external synchronisation in
/// Vulkan, so every use of them made through this crate goes through
/// their mutex. Callers using the raw handles elsewhere must serialise
/// with [`lock_queue`](Self::lock_queue) /
/// [`lock_command_pool`](Self::lock_command_pool).
pub struct Context {
    physical_device: vk::PhysicalDevice,
    device: Arc<dyn RawDevice>,
    queue: Mutex<vk::Queue>,
    command_pool: Mutex<vk::CommandPool>,
    config: ContextConfig,
    registry: Weak<Registry>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("device", &self.device.raw_device())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Create a context in the process-wide registry with the default
    /// configuration.
    ///
    /// `queue` must belong to `device`, and `command_pool` must have been
    /// created from `device` for `queue`'s family. Pools that should let
    /// command buffers be re-begun after submission need
    /// `RESET_COMMAND_BUFFER`.
    pub fn create(
        physical_device: vk::PhysicalDevice,
        device: Arc<dyn RawDevice>,
        queue: vk::Queue,
        command_pool: vk::CommandPool,
    ) -> Arc<Self> {
        Self::create_with_config(
            physical_device,
            device,
            queue,
            command_pool,
            ContextConfig::default(),
        )
    }

    pub fn create_with_config(
        physical_device: vk::PhysicalDevice,
        device: Arc<dyn RawDevice>,
        queue: vk::Queue,
        command_pool: vk::CommandPool,
        config: ContextConfig,
    ) -> Arc<Self> {
        Registry::global().create_context(
            physical_device,
            device,
            queue,
            command_pool,
            config,
        )
    }

    /// Wrap an externally created `ash` device in the process-wide
    /// registry.
    ///
    /// # Safety
    /// See [`AshDevice::new`]. In addition `queue` and `command_pool`
    /// must have been created from `device`.
    pub unsafe fn from_ash(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
        queue: vk::Queue,
        command_pool: vk::CommandPool,
        config: ContextConfig,
    ) -> Arc<Self> {
        // SAFETY: Caller upholds AshDevice::new's contract.
        let device = unsafe {
            AshDevice::new(instance, physical_device, device.clone())
        };
        Self::create_with_config(
            physical_device,
            Arc::new(device),
            queue,
            command_pool,
            config,
        )
    }

    /// Used by [`Registry::create_context`]; registration happens there.
    pub(crate) fn new(
        physical_device: vk::PhysicalDevice,
        device: Arc<dyn RawDevice>,
        queue: vk::Queue,
        command_pool: vk::CommandPool,
        config: ContextConfig,
        registry: Weak<Registry>,
    ) -> Self {
        Self {
            physical_device,
            device,
            queue: Mutex::new(queue),
            command_pool: Mutex::new(command_pool),
            config,
            registry,
        }
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn device(&self) -> &dyn RawDevice {
        self.device.as_ref()
    }

    pub fn raw_queue(&self) -> vk::Queue {
        *self.lock_queue()
    }

    pub fn raw_command_pool(&self) -> vk::CommandPool {
        *self.lock_command_pool()
    }

    /// Hold the queue for a submission or wait.
    pub fn lock_queue(&self) -> MutexGuard<'_, vk::Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hold the command pool for an allocation or free.
    pub fn lock_command_pool(&self) -> MutexGuard<'_, vk::CommandPool> {
        self.command_pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// The registry this context was created in, if it is still alive.
    pub fn registry(&self) -> Option<Arc<Registry>> {
        self.registry.upgrade()
    }
}

// Verified at compile time: contexts are shared read-only across threads.
#[allow(dead_code)]
trait AssertSendSync: Send + Sync {}
impl AssertSendSync for Context {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::mock_context_with_config;

    #[test]
    fn default_config_waits_for_queue_idle() {
        assert_eq!(
            ContextConfig::default().transfer_wait,
            TransferWait::QueueIdle
        );
    }

    #[test]
    fn context_exposes_its_handles_and_registry() {
        let config = ContextConfig {
            transfer_wait: TransferWait::Fence { timeout_ns: 5 },
        };
        let (device, registry, ctx) = mock_context_with_config(config);
        assert_eq!(ctx.device().raw_device(), device.raw_device());
        assert_eq!(
            ctx.config().transfer_wait,
            TransferWait::Fence { timeout_ns: 5 }
        );
        assert!(Arc::ptr_eq(&ctx.registry().unwrap(), &registry));
        assert_eq!(registry.live_contexts(), 1);

        // Debug must not take the queue or pool locks.
        let _queue = ctx.lock_queue();
        let _pool = ctx.lock_command_pool();
        assert!(format!("{ctx:?}").starts_with("Context"));
    }
}
