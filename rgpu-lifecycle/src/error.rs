//! The two-level error model shared by every fallible operation.
//!
//! An [`ErrorPair`] couples the native `vk::Result` reported by the
//! driver with an [`ErrorKind`] naming the logical step that failed.
//! When the failure was detected by this crate rather than by a driver
//! call (a state violation, a size mismatch, no usable memory type) the
//! native half is `vk::Result::ERROR_UNKNOWN`.

use ash::vk;
use thiserror::Error;

/// The closed set of library-level failure reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ErrorKind {
    // Resource creation
    #[error("failed to create buffer")]
    FailedToCreateBuffer,
    #[error("failed to allocate buffer memory")]
    FailedToAllocateBufferMemory,
    #[error("failed to find a suitable memory type")]
    FailedToFindSuitableMemoryType,
    #[error("failed to bind buffer memory")]
    FailedToBindBufferMemory,

    // Command buffer lifecycle
    #[error("failed to allocate command buffer")]
    FailedToAllocateCommandBuffer,
    #[error("failed to begin command buffer")]
    FailedToBeginCommandBuffer,
    #[error("failed to end command buffer")]
    FailedToEndCommandBuffer,
    #[error("failed to submit command buffer")]
    FailedToSubmitCommandBuffer,
    #[error("command buffer has already begun")]
    CommandBufferAlreadyBegun,
    #[error("command buffer is already recording")]
    CommandBufferAlreadyRecording,
    #[error("command buffer has already ended")]
    CommandBufferAlreadyEnded,
    #[error("command buffer has not begun")]
    CommandBufferHasNotBegun,
    #[error("command buffer has not ended")]
    CommandBufferHasNotEnded,
    #[error("command buffer has nothing to submit")]
    CommandBufferNothingToSubmit,

    // Transfer
    #[error("buffer sizes do not match")]
    BufferSizeMismatch,
    #[error("buffers cannot be copied between")]
    IncompatibleBuffers,
    #[error("failed to map memory")]
    FailedToMapMemory,
    #[error("failed waiting for queue to finish")]
    FailedWaitingForQueueToFinish,
    #[error("data does not fit in buffer")]
    DataTooLarge,
}

impl ErrorKind {
    /// True for the kinds returned when a [`CommandBuffer`] call is made
    /// in the wrong state.
    ///
    /// [`CommandBuffer`]: crate::CommandBuffer
    pub fn is_state_violation(self) -> bool {
        matches!(
            self,
            Self::CommandBufferAlreadyBegun
                | Self::CommandBufferAlreadyRecording
                | Self::CommandBufferAlreadyEnded
                | Self::CommandBufferHasNotBegun
                | Self::CommandBufferHasNotEnded
                | Self::CommandBufferNothingToSubmit
        )
    }

    /// `map_err` adapter for a failing driver call: logs the failure and
    /// pairs the native status with this kind.
    pub(crate) fn native(self) -> impl FnOnce(vk::Result) -> ErrorPair {
        move |native| {
            tracing::warn!("{self}: {native:?}");
            ErrorPair::native(native, self)
        }
    }
}

/// A native status paired with the library step that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{kind} ({native:?})")]
pub struct ErrorPair {
    /// Status reported by the driver, or `ERROR_UNKNOWN` when the
    /// failure was detected without a driver call.
    pub native: vk::Result,
    pub kind: ErrorKind,
}

impl ErrorPair {
    /// An error produced by a failing driver call.
    pub fn native(native: vk::Result, kind: ErrorKind) -> Self {
        Self { native, kind }
    }

    /// An error detected by this crate without any driver call.
    pub fn library(kind: ErrorKind) -> Self {
        Self {
            native: vk::Result::ERROR_UNKNOWN,
            kind,
        }
    }

    pub fn is_state_violation(&self) -> bool {
        self.kind.is_state_violation()
    }
}

impl From<ErrorKind> for ErrorPair {
    fn from(kind: ErrorKind) -> Self {
        Self::library(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn library_errors_carry_unknown_native_status() {
        let err = ErrorPair::library(ErrorKind::BufferSizeMismatch);
        assert_eq!(err.native, vk::Result::ERROR_UNKNOWN);
        assert_eq!(err, ErrorKind::BufferSizeMismatch.into());
    }

    #[test]
    fn display_names_both_halves() {
        let err = ErrorPair::native(
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            ErrorKind::FailedToAllocateBufferMemory,
        );
        assert_eq!(
            err.to_string(),
            "failed to allocate buffer memory (ERROR_OUT_OF_DEVICE_MEMORY)"
        );
    }

    #[test]
    fn only_lifecycle_misuse_is_a_state_violation() {
        assert!(
            ErrorPair::library(ErrorKind::CommandBufferNothingToSubmit)
                .is_state_violation()
        );
        assert!(ErrorKind::CommandBufferHasNotEnded.is_state_violation());
        assert!(!ErrorKind::FailedToSubmitCommandBuffer.is_state_violation());
        assert!(!ErrorKind::BufferSizeMismatch.is_state_violation());
        assert!(!ErrorKind::IncompatibleBuffers.is_state_violation());
    }
}
