//! # IOS ABI
//!
//! Types shared by both sides of the guest IPC boundary: the application
//! cores (which allocate and submit requests) and the device-serving kernel
//! (which dispatches them to devices and stamps replies).
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │              Application cores (cafe_ipc)                      │
//! │   core 0 driver      core 1 driver      core 2 driver          │
//! ├────────────────────────────────────────────────────────────────┤
//! │                     IpcBufferArena                             │
//! │  [ core 0 slice ][ core 1 slice ][ core 2 slice ]              │
//! ├────────────────────────────────────────────────────────────────┤
//! │           IpcTransport  ──────►  IosRouter (cafe_kernel)       │
//! │           IpcResponseHandler ◄──  reply stamped, tag = Reply   │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Buffers are never allocated individually. Each core owns a fixed slice
//! of the arena and addresses buffers by [`BufferIndex`].

pub mod buffer;
pub mod error;
pub mod memory;
pub mod transport;

pub use buffer::{
    BufferIndex, IosCommand, IosOpenMode, IpcBuffer, IpcBufferArena, IPC_ARG_COUNT,
};
pub use error::{IosError, IosResult};
pub use memory::{IoSpan, SharedBuffer};
pub use transport::{IpcResponseHandler, IpcTransport};

/// Identifier of an emulated application core.
pub type CoreId = usize;

/// Handle returned by a successful `Open`, addressing an open device.
pub type IosHandle = i32;

/// IPC layer configuration.
#[derive(Debug, Clone)]
pub struct IpcConfig {
    /// Message buffers (and requests) per core
    pub buffer_count: usize,
    /// Number of application cores
    pub core_count: usize,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            buffer_count: 0x30,
            core_count: 3,
        }
    }
}
