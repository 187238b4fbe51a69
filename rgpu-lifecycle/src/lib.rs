//! Lifecycle helpers for Vulkan buffers and command buffers, built on
//! [`ash`].
//!
//! The caller brings an already initialised device, queue and command
//! pool; this crate wraps them in a [`Context`] and hands out
//! [`Buffer`]s and [`CommandBuffer`]s created against it. Every
//! fallible call returns `Result<_, ErrorPair>`, where the
//! [`ErrorPair`] carries both the native `vk::Result` and the library
//! [`ErrorKind`] naming the step that failed.
//!
//! # Object hierarchy
//!
//! ```text
//! Registry (process-wide or private)
//! └── Arc<Context>  (physical device, RawDevice, queue, pool)
//!     ├── Buffer         one vk::Buffer + one vk::DeviceMemory
//!     └── CommandBuffer  one vk::CommandBuffer + recording state
//! ```
//!
//! Buffers and command buffers are released when dropped, or en masse
//! by [`cleanup`] / [`Registry::shutdown`], whichever comes first.
//!
//! # Naming conventions
//!
//! | prefix  | meaning                                   |
//! |---------|-------------------------------------------|
//! | `raw_*` | accepts or returns a raw `ash::vk` handle |

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

pub mod buffer;
pub mod command;
pub mod context;
pub mod device;
pub mod error;
pub mod memory;
pub mod registry;

#[cfg(test)]
mod mock;

pub use ash;

pub use buffer::Buffer;
pub use command::{CommandBuffer, CommandBufferState, Recorder};
pub use context::{Context, ContextConfig, TransferWait};
pub use device::{AshDevice, RawDevice};
pub use error::{ErrorKind, ErrorPair};
pub use memory::{find_memory_type, select_memory_type};
pub use registry::{Registry, cleanup};
