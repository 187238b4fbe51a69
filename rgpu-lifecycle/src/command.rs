use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ash::vk;

use crate::buffer::{Buffer, check_transfer_pair};
use crate::context::Context;
use crate::device::RawDevice;
use crate::error::{ErrorKind, ErrorPair};
use crate::registry::CommandBufferKey;

// ---------------------------------------------------------------------------
// CommandBufferState: the recording lifecycle
// ---------------------------------------------------------------------------

/// Where a [`CommandBuffer`] is in its recording lifecycle.
///
/// ```text
/// Idle ──begin──▶ Begun ──record──▶ Recording ──end──▶ Ended ──submit──▶ Idle
///                   └────────────────end──────────────▶
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CommandBufferState {
    /// Nothing recorded. Freshly allocated or successfully submitted.
    #[default]
    Idle,
    /// Recording started, no commands recorded yet.
    Begun,
    /// At least one `record` call has run.
    Recording,
    /// Recording finalised, ready to submit.
    Ended,
}

impl CommandBufferState {
    fn check_begin(self) -> Result<(), ErrorKind> {
        match self {
            Self::Idle => Ok(()),
            Self::Begun => Err(ErrorKind::CommandBufferAlreadyBegun),
            Self::Recording => Err(ErrorKind::CommandBufferAlreadyRecording),
            Self::Ended => Err(ErrorKind::CommandBufferAlreadyEnded),
        }
    }

    fn check_record(self) -> Result<(), ErrorKind> {
        match self {
            Self::Begun | Self::Recording => Ok(()),
            Self::Idle => Err(ErrorKind::CommandBufferHasNotBegun),
            Self::Ended => Err(ErrorKind::CommandBufferAlreadyEnded),
        }
    }

    fn check_end(self) -> Result<(), ErrorKind> {
        // Same legality as recording: anything between begin and end.
        self.check_record()
    }

    fn check_submit(self) -> Result<(), ErrorKind> {
        match self {
            Self::Ended => Ok(()),
            Self::Begun | Self::Recording => {
                Err(ErrorKind::CommandBufferHasNotEnded)
            }
            Self::Idle => Err(ErrorKind::CommandBufferNothingToSubmit),
        }
    }
}

// ---------------------------------------------------------------------------
// CommandBufferCore: the native half, shared with the registry
// ---------------------------------------------------------------------------

pub(crate) struct CommandBufferCore {
    context: Arc<Context>,
    handle: vk::CommandBuffer,
    released: AtomicBool,
}

impl CommandBufferCore {
    /// Free the handle back to the context's pool. Later calls are no-ops.
    pub(crate) fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("Dropping command buffer {:?}", self.handle);
        let pool = self.context.lock_command_pool();
        // SAFETY: handle was allocated from this pool and `released`
        // guarantees it is freed once. The pool lock is held. The owner
        // guarantees the buffer is not pending execution.
        unsafe {
            self.context.device().free_raw_command_buffers(
                *pool,
                std::slice::from_ref(&self.handle),
            )
        };
    }
}

// ---------------------------------------------------------------------------
// CommandBuffer
// ---------------------------------------------------------------------------

/// A command buffer allocated from its [`Context`]'s pool, with an
/// explicit recording state.
///
/// Calls made in the wrong state fail with a state-violation
/// [`ErrorKind`] (native status `ERROR_UNKNOWN`) and leave the state as
/// it was. The handle is freed back to the pool on drop, whatever the
/// state, unless [`Registry::shutdown`](crate::Registry::shutdown)
/// freed it first.
///
/// Re-beginning a command buffer after a successful submit requires a
/// pool created with `RESET_COMMAND_BUFFER`.
pub struct CommandBuffer {
    core: Arc<CommandBufferCore>,
    key: Option<CommandBufferKey>,
    level: vk::CommandBufferLevel,
    state: CommandBufferState,
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        if let (Some(key), Some(registry)) =
            (self.key, self.core.context.registry())
        {
            registry.unregister_command_buffer(key);
        }
        self.core.release();
    }
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("handle", &self.core.handle)
            .field("level", &self.level)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl CommandBuffer {
    /// Allocate one command buffer of `level` from the context's pool.
    pub fn create(
        ctx: &Arc<Context>,
        level: vk::CommandBufferLevel,
    ) -> Result<Self, ErrorPair> {
        let handle = {
            let pool = ctx.lock_command_pool();
            let allocate_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(*pool)
                .level(level)
                .command_buffer_count(1);
            // SAFETY: allocate_info references the context's pool, which is
            // locked for the duration of the call.
            unsafe { ctx.device().allocate_raw_command_buffers(&allocate_info) }
                .map_err(ErrorKind::FailedToAllocateCommandBuffer.native())?
                .into_iter()
                .next()
                .ok_or(ErrorPair::library(
                    ErrorKind::FailedToAllocateCommandBuffer,
                ))?
        };
        tracing::debug!("Allocated {level:?} command buffer {:?}", handle);

        let core = Arc::new(CommandBufferCore {
            context: Arc::clone(ctx),
            handle,
            released: AtomicBool::new(false),
        });
        let key = ctx
            .registry()
            .map(|registry| registry.register_command_buffer(Arc::clone(&core)));

        Ok(Self {
            core,
            key,
            level,
            state: CommandBufferState::Idle,
        })
    }

    pub fn create_primary(ctx: &Arc<Context>) -> Result<Self, ErrorPair> {
        Self::create(ctx, vk::CommandBufferLevel::PRIMARY)
    }

    /// Begin recording. Only legal in [`CommandBufferState::Idle`].
    ///
    /// Secondary command buffers are begun with an empty inheritance
    /// info. If the driver rejects the call the state stays `Idle`.
    ///
    /// # Safety
    /// No earlier submission of this command buffer may still be pending
    /// on the GPU.
    pub unsafe fn begin(
        &mut self,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<(), ErrorPair> {
        self.state.check_begin().map_err(|kind| self.reject(kind))?;

        let inheritance = vk::CommandBufferInheritanceInfo::default();
        let mut begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
        if self.level == vk::CommandBufferLevel::SECONDARY {
            begin_info = begin_info.inheritance_info(&inheritance);
        }
        // SAFETY: the state check guarantees the buffer is not recording;
        // the caller guarantees it is not pending.
        unsafe {
            self.core
                .context
                .device()
                .begin_raw_command_buffer(self.core.handle, &begin_info)
        }
        .map_err(ErrorKind::FailedToBeginCommandBuffer.native())?;

        self.state = CommandBufferState::Begun;
        Ok(())
    }

    /// Run `f` once with a [`Recorder`] for this command buffer and move
    /// to [`CommandBufferState::Recording`].
    ///
    /// Only legal after [`begin`](Self::begin) and before
    /// [`end`](Self::end). The callback's return value is passed through.
    pub fn record<R>(
        &mut self,
        f: impl FnOnce(&mut Recorder<'_>) -> R,
    ) -> Result<R, ErrorPair> {
        self.state.check_record().map_err(|kind| self.reject(kind))?;

        let mut recorder = Recorder {
            device: self.core.context.device(),
            handle: self.core.handle,
        };
        let out = f(&mut recorder);
        self.state = CommandBufferState::Recording;
        Ok(out)
    }

    /// Finish recording. Legal in `Begun` and `Recording`.
    pub fn end(&mut self) -> Result<(), ErrorPair> {
        self.state.check_end().map_err(|kind| self.reject(kind))?;

        // SAFETY: the state check guarantees the buffer is recording.
        unsafe {
            self.core
                .context
                .device()
                .end_raw_command_buffer(self.core.handle)
        }
        .map_err(ErrorKind::FailedToEndCommandBuffer.native())?;

        self.state = CommandBufferState::Ended;
        Ok(())
    }

    /// Submit to `queue`, signalling `fence` on completion if given.
    ///
    /// Does not wait. On success the state returns to `Idle`; if the
    /// driver rejects the submission the state stays `Ended` and the call
    /// may be retried.
    ///
    /// # Safety
    /// - `queue` must belong to the context's device and must not be used
    ///   concurrently by another thread. For the context's own queue use
    ///   [`submit_to_context_queue`](Self::submit_to_context_queue).
    /// - `fence`, if given, must be unsignaled and not in use.
    /// - Every resource referenced by recorded commands must stay alive
    ///   until the submission has finished executing, and so must this
    ///   command buffer.
    pub unsafe fn submit(
        &mut self,
        queue: vk::Queue,
        fence: Option<vk::Fence>,
    ) -> Result<(), ErrorPair> {
        self.state.check_submit().map_err(|kind| self.reject(kind))?;

        let submit_info = vk::SubmitInfo::default()
            .command_buffers(std::slice::from_ref(&self.core.handle));
        // SAFETY: the buffer is executable per the state check; the caller
        // upholds the queue, fence and lifetime requirements.
        unsafe {
            self.core.context.device().queue_submit(
                queue,
                std::slice::from_ref(&submit_info),
                fence.unwrap_or_default(),
            )
        }
        .map_err(ErrorKind::FailedToSubmitCommandBuffer.native())?;

        self.state = CommandBufferState::Idle;
        Ok(())
    }

    /// [`submit`](Self::submit) to the context's queue, holding its lock
    /// for the duration of the call.
    ///
    /// # Safety
    /// Same as [`submit`](Self::submit), minus the queue requirements.
    pub unsafe fn submit_to_context_queue(
        &mut self,
        fence: Option<vk::Fence>,
    ) -> Result<(), ErrorPair> {
        let context = Arc::clone(&self.core.context);
        let queue = context.lock_queue();
        // SAFETY: the context's queue is locked; the caller upholds the
        // remaining requirements.
        unsafe { self.submit(*queue, fence) }
    }

    /// Begin, record `f`, end and submit in one call.
    ///
    /// The first failing step's error is returned unchanged and the
    /// remaining steps are skipped.
    ///
    /// # Safety
    /// The union of [`begin`](Self::begin)'s and
    /// [`submit`](Self::submit)'s requirements.
    pub unsafe fn perform<R>(
        &mut self,
        f: impl FnOnce(&mut Recorder<'_>) -> R,
        queue: vk::Queue,
        begin_flags: vk::CommandBufferUsageFlags,
        fence: Option<vk::Fence>,
    ) -> Result<R, ErrorPair> {
        // SAFETY: Caller upholds begin's contract.
        unsafe { self.begin(begin_flags) }?;
        let out = self.record(f)?;
        self.end()?;
        // SAFETY: Caller upholds submit's contract.
        unsafe { self.submit(queue, fence) }?;
        Ok(out)
    }

    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    pub fn level(&self) -> vk::CommandBufferLevel {
        self.level
    }

    pub fn raw_command_buffer(&self) -> vk::CommandBuffer {
        self.core.handle
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.core.context
    }

    fn reject(&self, kind: ErrorKind) -> ErrorPair {
        tracing::debug!(
            "Command buffer {:?} in state {:?}: {kind}",
            self.core.handle,
            self.state
        );
        ErrorPair::library(kind)
    }
}

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

/// Recording access to a [`CommandBuffer`] between `begin` and `end`.
///
/// Only handed out by [`CommandBuffer::record`], so every command
/// recorded through it lands in a buffer that is recording.
pub struct Recorder<'a> {
    device: &'a dyn RawDevice,
    handle: vk::CommandBuffer,
}

impl std::fmt::Debug for Recorder<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl Recorder<'_> {
    /// The command buffer being recorded, for commands this type does not
    /// wrap.
    pub fn raw_command_buffer(&self) -> vk::CommandBuffer {
        self.handle
    }

    pub fn device(&self) -> &dyn RawDevice {
        self.device
    }

    /// Record a copy between two buffers.
    ///
    /// Every region must lie within both buffers' requested sizes,
    /// otherwise nothing is recorded and
    /// [`ErrorKind::BufferSizeMismatch`] is returned. Buffers from another
    /// device, a `src` without `TRANSFER_SRC` or a `dst` without
    /// `TRANSFER_DST` usage are rejected with
    /// [`ErrorKind::IncompatibleBuffers`]. Both buffers must outlive the
    /// execution of the submission (see [`CommandBuffer::submit`]).
    pub fn copy_buffer(
        &mut self,
        src: &Buffer,
        dst: &Buffer,
        regions: &[vk::BufferCopy],
    ) -> Result<(), ErrorPair> {
        check_transfer_pair(self.device, src, dst)?;
        let in_bounds = |offset: vk::DeviceSize, size, limit| {
            offset.checked_add(size).is_some_and(|end| end <= limit)
        };
        let all_in_bounds = regions.iter().all(|r| {
            in_bounds(r.src_offset, r.size, src.size())
                && in_bounds(r.dst_offset, r.size, dst.size())
        });
        if !all_in_bounds {
            tracing::debug!(
                "copy regions {regions:?} out of bounds for {:?} -> {:?}",
                src,
                dst
            );
            return Err(ErrorPair::library(ErrorKind::BufferSizeMismatch));
        }
        // SAFETY: the buffer is recording (Recorder only exists inside
        // `record`). Both buffers are live, belong to this device with
        // transfer usage, and every region was bounds-checked above.
        unsafe {
            self.copy_raw_buffer(src.raw_buffer(), dst.raw_buffer(), regions)
        };
        Ok(())
    }

    /// Record a buffer-to-buffer copy between raw handles.
    ///
    /// # Safety
    /// `src_buffer` and `dst_buffer` must be valid handles created from
    /// the same device with `TRANSFER_SRC` / `TRANSFER_DST` usage. Regions
    /// must be in bounds.
    pub unsafe fn copy_raw_buffer(
        &mut self,
        src_buffer: vk::Buffer,
        dst_buffer: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        // SAFETY: Caller guarantees buffer validity and in-bounds regions;
        // the command buffer is recording.
        unsafe {
            self.device
                .cmd_copy_buffer(self.handle, src_buffer, dst_buffer, regions)
        }
    }
}

// ---------------------------------------------------------------------------
// Auto-trait assertions
// ---------------------------------------------------------------------------

// Verified at compile time: command buffers can move between threads.
#[allow(dead_code)]
trait AssertSend: Send {}
impl AssertSend for CommandBuffer {}
