//! # Cafe Filesystem Client
//!
//! Filesystem commands issued by guest code travel through a per-client
//! command queue to the `/dev/fsa` device over the IPC request channel.
//! Device status codes are projected onto the client error model, busy
//! replies are retried, large transfers are split into chunks, and media
//! problems move the client's volume state machine.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  FsClient::submit / submit_async (FsCommand)            │
//! ├─────────────────────────────────────────────────────────┤
//! │  FsCmdBlock ──► FsCmdQueue (pending + one in flight)    │
//! ├─────────────────────────────────────────────────────────┤
//! │  IpcDriver::ios_ioctl(v)_async ──► kernel ──► /dev/fsa  │
//! ├─────────────────────────────────────────────────────────┤
//! │  AppIO worker: project status, retry, continue, deliver │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! let fs = FsContext::new(drivers, FsConfig::default())?;
//! let client = FsClient::add(&fs, 0)?;
//! let block = FsCmdBlock::new();
//! let handle = FsOut::new();
//! client.submit(&block, FsCommand::OpenFile { path, mode: "r".into(), handle: handle.clone() },
//!               FsErrorFlag::empty())?;
//! ```

mod appio;
pub mod client;
pub mod cmdblock;
pub mod command;
pub mod fsa;
pub mod message;
mod queue;
pub mod status;
pub mod volume;

pub use client::FsClient;
pub use cmdblock::{FsCancelFlags, FsCmdBlock, FsCmdBlockStatus};
pub use command::{FsCommand, FsOut};
pub use fsa::{FsDirEntry, FsReadFlag, FsStat, FsVolumeInfo, FsaCommand, FsaRequest, FsaResponse};
pub use message::{FsAsyncCallback, FsAsyncData, FsAsyncResult, FsMessageQueue};
pub use status::{FsErrorFlag, FsResult, FsStatus, FsaStatus};
pub use volume::{StateChangeCallback, VolumeState};

use std::sync::Arc;

use cafe_ipc::IpcDrivers;

use crate::appio::AppIo;

/// Name the FSA device is registered under.
pub const FSA_DEVICE_NAME: &str = "/dev/fsa";

/// Filesystem client configuration.
#[derive(Debug, Clone)]
pub struct FsConfig {
    /// Largest single read or write sent to the device
    pub max_bytes_per_request: u32,
    /// Depth of queues made by [`FsContext::message_queue`]
    pub message_queue_depth: usize,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            max_bytes_per_request: 0x10_0000,
            message_queue_depth: 16,
        }
    }
}

/// State shared by every client: the IPC drivers, the AppIO worker and
/// configuration.
pub struct FsContext {
    ipc: Arc<IpcDrivers>,
    appio: AppIo,
    config: FsConfig,
}

impl FsContext {
    pub fn new(ipc: Arc<IpcDrivers>, config: FsConfig) -> Result<Arc<Self>, FsStatus> {
        let appio = AppIo::start().map_err(|e| {
            log::error!("fs: failed to start appio worker: {}", e);
            FsStatus::FatalError
        })?;

        log::info!(
            "fs: context up, {} cores, {:#x} bytes per request",
            ipc.core_count(),
            config.max_bytes_per_request
        );

        Ok(Arc::new(Self { ipc, appio, config }))
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    pub fn ipc(&self) -> &Arc<IpcDrivers> {
        &self.ipc
    }

    pub(crate) fn appio(&self) -> &AppIo {
        &self.appio
    }

    /// A completion queue sized from the configuration.
    pub fn message_queue(&self) -> FsMessageQueue {
        FsMessageQueue::new(self.config.message_queue_depth)
    }
}

/// Internal consistency violation.
pub(crate) fn fatal(message: core::fmt::Arguments<'_>) -> ! {
    log::error!("{}", message);
    panic!("{}", message);
}
