//! Caller-facing command builders.
//!
//! An [`FsCommand`] names an operation, its parameters and where its
//! results go. Loading one into a command block produces the shim request
//! and the copy-out plan used when the device answers.

use std::sync::Arc;

use cafe_ios::IoSpan;
use spin::Mutex;

use crate::fsa::{FsDirEntry, FsReadFlag, FsStat, FsVolumeInfo, FsaRequest, FsaTransfer};
use crate::status::{FsStatus, FsaStatus};

/// A caller-owned output location filled on successful completion.
#[derive(Debug)]
pub struct FsOut<T> {
    slot: Arc<Mutex<Option<T>>>,
}

impl<T> FsOut<T> {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Removes and returns the value, if one was written.
    pub fn take(&self) -> Option<T> {
        self.slot.lock().take()
    }

    pub fn is_set(&self) -> bool {
        self.slot.lock().is_some()
    }

    pub(crate) fn set(&self, value: T) {
        *self.slot.lock() = Some(value);
    }
}

impl<T: Clone> FsOut<T> {
    pub fn get(&self) -> Option<T> {
        self.slot.lock().clone()
    }
}

impl<T> Clone for FsOut<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T> Default for FsOut<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Filesystem operation with its parameters and output locations.
#[derive(Debug, Clone)]
pub enum FsCommand {
    Mount { source: String, target: String },
    Unmount { target: String },
    GetVolumeInfo { path: String, info: FsOut<FsVolumeInfo> },
    ChangeDir { path: String },
    /// Writes the NUL-padded working directory into `path`.
    GetCwd { path: IoSpan },
    MakeDir { path: String, permission: u32 },
    Remove { path: String },
    Rename { from: String, to: String },
    OpenDir { path: String, handle: FsOut<u32> },
    ReadDir { handle: u32, entry: FsOut<FsDirEntry> },
    RewindDir { handle: u32 },
    CloseDir { handle: u32 },
    OpenFile { path: String, mode: String, handle: FsOut<u32> },
    /// Reads `size * count` bytes into `buffer`. Completes with the number
    /// of whole `size` elements read.
    ReadFile { handle: u32, buffer: IoSpan, size: u32, count: u32, pos: Option<u32> },
    /// Writes `size * count` bytes from `buffer`. Completes with the number
    /// of whole `size` elements written.
    WriteFile { handle: u32, buffer: IoSpan, size: u32, count: u32, pos: Option<u32> },
    GetPosFile { handle: u32, pos: FsOut<u32> },
    SetPosFile { handle: u32, pos: u32 },
    IsEof { handle: u32 },
    StatFile { handle: u32, stat: FsOut<FsStat> },
    CloseFile { handle: u32 },
    FlushFile { handle: u32 },
    TruncateFile { handle: u32 },
    ChangeMode { path: String, mode: u32, mask: u32 },
}

/// Where the response goes on success.
#[derive(Debug, Clone, Default)]
pub(crate) enum FsOutput {
    #[default]
    None,
    Handle(FsOut<u32>),
    Pos(FsOut<u32>),
    Stat(FsOut<FsStat>),
    DirEntry(FsOut<FsDirEntry>),
    VolumeInfo(FsOut<FsVolumeInfo>),
    Cwd(IoSpan),
}

/// Direction of a chunked transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransferKind {
    Read,
    Write,
}

/// Everything a command block needs to run one command.
pub(crate) struct LoadedCommand {
    pub request: FsaRequest,
    pub output: FsOutput,
    /// Direction, data buffer, chunk size and total bytes
    pub transfer: Option<(TransferKind, IoSpan, u32, u32)>,
}

impl FsCommand {
    /// Builds the shim request. Transfers start with the first chunk of at
    /// most `max_bytes_per_request` bytes. A transfer whose `size * count`
    /// does not fit in 32 bits is refused with `InvalidParam`.
    pub(crate) fn load(self, max_bytes_per_request: u32) -> Result<LoadedCommand, FsStatus> {
        let mut output = FsOutput::None;
        let mut transfer = None;

        let request = match self {
            FsCommand::Mount { source, target } => FsaRequest::Mount { source, target },
            FsCommand::Unmount { target } => FsaRequest::Unmount { target },
            FsCommand::GetVolumeInfo { path, info } => {
                output = FsOutput::VolumeInfo(info);
                FsaRequest::GetVolumeInfo { path }
            }
            FsCommand::ChangeDir { path } => FsaRequest::ChangeDir { path },
            FsCommand::GetCwd { path } => {
                output = FsOutput::Cwd(path);
                FsaRequest::GetCwd
            }
            FsCommand::MakeDir { path, permission } => FsaRequest::MakeDir { path, permission },
            FsCommand::Remove { path } => FsaRequest::Remove { path },
            FsCommand::Rename { from, to } => FsaRequest::Rename { from, to },
            FsCommand::OpenDir { path, handle } => {
                output = FsOutput::Handle(handle);
                FsaRequest::OpenDir { path }
            }
            FsCommand::ReadDir { handle, entry } => {
                output = FsOutput::DirEntry(entry);
                FsaRequest::ReadDir { handle }
            }
            FsCommand::RewindDir { handle } => FsaRequest::RewindDir { handle },
            FsCommand::CloseDir { handle } => FsaRequest::CloseDir { handle },
            FsCommand::OpenFile { path, mode, handle } => {
                output = FsOutput::Handle(handle);
                FsaRequest::OpenFile { path, mode }
            }
            FsCommand::ReadFile { handle, buffer, size, count, pos } => {
                let total = transfer_total(size, count)?;
                let first = first_transfer(handle, total, pos, max_bytes_per_request);
                transfer = Some((TransferKind::Read, buffer, size, total));
                FsaRequest::ReadFile(first)
            }
            FsCommand::WriteFile { handle, buffer, size, count, pos } => {
                let total = transfer_total(size, count)?;
                let first = first_transfer(handle, total, pos, max_bytes_per_request);
                transfer = Some((TransferKind::Write, buffer, size, total));
                FsaRequest::WriteFile(first)
            }
            FsCommand::GetPosFile { handle, pos } => {
                output = FsOutput::Pos(pos);
                FsaRequest::GetPosFile { handle }
            }
            FsCommand::SetPosFile { handle, pos } => FsaRequest::SetPosFile { handle, pos },
            FsCommand::IsEof { handle } => FsaRequest::IsEof { handle },
            FsCommand::StatFile { handle, stat } => {
                output = FsOutput::Stat(stat);
                FsaRequest::StatFile { handle }
            }
            FsCommand::CloseFile { handle } => FsaRequest::CloseFile { handle },
            FsCommand::FlushFile { handle } => FsaRequest::FlushFile { handle },
            FsCommand::TruncateFile { handle } => FsaRequest::TruncateFile { handle },
            FsCommand::ChangeMode { path, mode, mask } => FsaRequest::ChangeMode { path, mode, mask },
        };

        Ok(LoadedCommand {
            request,
            output,
            transfer,
        })
    }
}

fn transfer_total(size: u32, count: u32) -> Result<u32, FsStatus> {
    size.checked_mul(count).ok_or_else(|| {
        log::warn!("fs: transfer of {} x {} bytes overflows", count, size);
        FsStatus::Device(FsaStatus::InvalidParam.code())
    })
}

/// Sub-requests always carry a byte count with an element count of one.
fn first_transfer(handle: u32, total: u32, pos: Option<u32>, max: u32) -> FsaTransfer {
    FsaTransfer {
        handle,
        size: total.min(max),
        count: 1,
        pos: pos.unwrap_or(0),
        flags: if pos.is_some() {
            FsReadFlag::WITH_POS
        } else {
            FsReadFlag::empty()
        },
    }
}
