//! # Cafe Kernel
//!
//! The kernel side of the guest IPC boundary: a device registry, the
//! command router that executes submitted message buffers, and the
//! transport that delivers answered buffers back to their core.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              Application cores              │
//! │     IpcDriver[0]  IpcDriver[1]  IpcDriver[2]│
//! └───────────────┬─────────────────▲───────────┘
//!            submit│                 │process_responses
//! ┌───────────────▼─────────────────┴───────────┐
//! │                 KernelIpc                   │
//! │   ┌───────────┐   ┌──────────────────────┐  │
//! │   │ IosRouter │──►│ OpenHandleTable      │  │
//! │   └─────┬─────┘   └──────────────────────┘  │
//! │         ▼                                   │
//! │   DeviceRegistry ("/dev/fsa", ...)          │
//! └─────────────────────────────────────────────┘
//! ```

pub mod ios;
pub mod ipc;

pub use ios::{DeviceFactory, DeviceRegistry, IosDevice, IosRouter, OpenHandleTable};
pub use ipc::KernelIpc;

/// How answered buffers travel back to the submitting core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Routed and answered on the submitting thread.
    Inline,
    /// Routed on a dedicated kernel worker thread.
    #[default]
    Threaded,
}

/// Kernel configuration.
#[derive(Debug, Clone, Default)]
pub struct KernelConfig {
    pub delivery: DeliveryMode,
}
