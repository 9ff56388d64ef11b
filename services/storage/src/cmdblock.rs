//! # Command Block
//!
//! The reusable unit carrying one filesystem command through the client
//! queue. A block is prepared, loaded with a command, queued, dispatched
//! and completed; it can then be prepared again.
//!
//! ```text
//!  Initialised ─prepare─► Initialised ─requeue─► QueuedCommand ─dequeue─► in flight
//!       ▲                                                                    │
//!  Cancelled ◄───────────────────── complete(ok | error) ◄───────────────────┘
//! ```
//!
//! `Cancelled` doubles as the idle state: a block is reusable once it gets
//! there.

use core::fmt;
use std::any::Any;
use std::sync::Arc;

use bitflags::bitflags;
use cafe_ios::IoSpan;
use spin::Mutex;

use crate::client::ClientShared;
use crate::command::{FsCommand, FsOutput, TransferKind};
use crate::fsa::{FsReadFlag, FsaRequest, FsaResponse, FSA_RESPONSE_LEN};
use crate::message::{FsAsyncCallback, FsAsyncData, FsAsyncResult, FsMessageQueue};
use crate::status::{FsErrorFlag, FsResult, FsStatus, FsaStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsCmdBlockStatus {
    Initialised,
    QueuedCommand,
    Cancelled,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FsCancelFlags: u32 {
        /// Cancel at the next requeue.
        const CANCELLING = 1 << 0;
    }
}

/// How a sub-completion is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Continuation {
    #[default]
    Generic,
    ChunkedRead,
    ChunkedWrite,
}

/// Progress of a chunked transfer, kept across requeues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct TransferState {
    pub bytes_done: u32,
    pub bytes_remaining: u32,
    pub chunk_size: u32,
    pub request_size: u32,
}

/// What a sub-completion of a transfer leads to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransferStep {
    /// Finish with this many whole chunks.
    Finish(u32),
    /// Issue the next sub-request.
    Continue,
}

/// Snapshot handed to the dispatcher.
pub(crate) struct Dispatch {
    pub request: FsaRequest,
    pub data: Option<IoSpan>,
    pub response: IoSpan,
}

pub(crate) struct BlockState {
    pub status: FsCmdBlockStatus,
    pub cancel: FsCancelFlags,
    pub error_mask: FsErrorFlag,
    pub client: Option<Arc<ClientShared>>,
    callback: Option<FsAsyncCallback>,
    io_msg_queue: Option<FsMessageQueue>,
    pub request: Option<FsaRequest>,
    output: FsOutput,
    data: Option<IoSpan>,
    response: Option<IoSpan>,
    pub continuation: Continuation,
    pub transfer: TransferState,
    user_data: Option<Arc<dyn Any + Send + Sync>>,
}

impl Default for BlockState {
    fn default() -> Self {
        Self {
            status: FsCmdBlockStatus::Initialised,
            cancel: FsCancelFlags::empty(),
            error_mask: FsErrorFlag::empty(),
            client: None,
            callback: None,
            io_msg_queue: None,
            request: None,
            output: FsOutput::None,
            data: None,
            response: None,
            continuation: Continuation::Generic,
            transfer: TransferState::default(),
            user_data: None,
        }
    }
}

/// A filesystem command block. Clones refer to the same block.
#[derive(Clone)]
pub struct FsCmdBlock {
    inner: Arc<Mutex<BlockState>>,
}

impl FsCmdBlock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BlockState::default())),
        }
    }

    pub fn status(&self) -> FsCmdBlockStatus {
        self.inner.lock().status
    }

    pub fn is_cancelling(&self) -> bool {
        self.inner.lock().cancel.contains(FsCancelFlags::CANCELLING)
    }

    /// Stores an opaque value on the block.
    pub fn set_user_data<T: Any + Send + Sync>(&self, value: T) {
        self.inner.lock().user_data = Some(Arc::new(value));
    }

    /// Returns the stored value if it has type `T`.
    pub fn user_data<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let data = self.inner.lock().user_data.clone()?;
        data.downcast::<T>().ok()
    }

    pub fn same_block(&self, other: &FsCmdBlock) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn lock(&self) -> spin::MutexGuard<'_, BlockState> {
        self.inner.lock()
    }

    pub(crate) fn client(&self) -> Option<Arc<ClientShared>> {
        self.inner.lock().client.clone()
    }

    /// Validates the block for a new command and binds it to `client`.
    pub(crate) fn prepare(
        &self,
        client: &Arc<ClientShared>,
        error_mask: FsErrorFlag,
        completion: FsAsyncData,
    ) -> Result<(), FsStatus> {
        let mut state = self.inner.lock();

        if state.status != FsCmdBlockStatus::Initialised && state.status != FsCmdBlockStatus::Cancelled {
            log::error!("fs: cannot prepare block in state {:?}", state.status);
            return Err(FsStatus::FatalError);
        }

        if !completion.is_valid() {
            log::error!("fs: exactly one of callback and message queue must be set");
            return Err(FsStatus::FatalError);
        }

        state.error_mask = error_mask;
        state.client = Some(client.clone());
        state.callback = completion.callback;
        state.io_msg_queue = completion.io_msg_queue;
        Ok(())
    }

    /// Installs the command and returns the continuation it runs with.
    pub(crate) fn load(
        &self,
        command: FsCommand,
        max_bytes_per_request: u32,
    ) -> Result<Continuation, FsStatus> {
        let loaded = command.load(max_bytes_per_request)?;
        if let Err(e) = loaded.request.encode() {
            log::warn!("fs: rejecting {:?}: {}", loaded.request.command(), e);
            return Err(FsStatus::Device(FsaStatus::InvalidPath.code()));
        }

        let mut state = self.inner.lock();

        state.output = loaded.output;
        state.response = None;
        state.transfer = TransferState::default();
        state.data = None;

        let continuation = match loaded.transfer {
            None => Continuation::Generic,
            Some((kind, buffer, chunk_size, total)) => {
                let request_size = loaded.request.transfer().map_or(0, |t| t.size);
                state.transfer = TransferState {
                    bytes_done: 0,
                    bytes_remaining: total,
                    chunk_size,
                    request_size,
                };
                state.data = Some(buffer);
                match kind {
                    TransferKind::Read => Continuation::ChunkedRead,
                    TransferKind::Write => Continuation::ChunkedWrite,
                }
            }
        };

        state.request = Some(loaded.request);
        Ok(continuation)
    }

    /// Builds the records for the next device call. A fresh response area
    /// is attached each time.
    pub(crate) fn dispatch(&self) -> Option<Dispatch> {
        let mut state = self.inner.lock();
        let request = state.request.clone()?;
        let response = IoSpan::zeroed(FSA_RESPONSE_LEN);
        state.response = Some(response.clone());

        let data = match (&state.data, request.transfer()) {
            (Some(buffer), Some(_)) => Some(buffer.sub_span(
                state.transfer.bytes_done as usize,
                state.transfer.request_size as usize,
            )),
            _ => None,
        };

        Some(Dispatch {
            request,
            data,
            response,
        })
    }

    /// Accounts for `bytes` transferred by the last sub-request.
    pub(crate) fn advance_transfer(&self, bytes: u32, max_bytes_per_request: u32) -> TransferStep {
        let mut state = self.inner.lock();
        let mut transfer = state.transfer;

        transfer.bytes_done = transfer.bytes_done.saturating_add(bytes);
        transfer.bytes_remaining = transfer.bytes_remaining.saturating_sub(bytes);

        if transfer.bytes_remaining == 0 || bytes < transfer.request_size {
            state.transfer = transfer;
            let chunks = transfer.bytes_done.checked_div(transfer.chunk_size).unwrap_or(0);
            return TransferStep::Finish(chunks);
        }

        transfer.request_size = transfer.bytes_remaining.min(max_bytes_per_request);
        if let Some(request) = state.request.as_mut().and_then(FsaRequest::transfer_mut) {
            request.size = transfer.request_size;
            request.count = 1;
            if request.flags.contains(FsReadFlag::WITH_POS) {
                request.pos = request.pos.wrapping_add(bytes);
            }
        }
        state.transfer = transfer;
        TransferStep::Continue
    }

    /// Marks the block idle again and clears any pending cancel.
    pub(crate) fn finish(&self) {
        let mut state = self.inner.lock();
        state.cancel.remove(FsCancelFlags::CANCELLING);
        state.status = FsCmdBlockStatus::Cancelled;
    }

    /// Writes the response to the caller's output location.
    pub(crate) fn copy_out(&self) -> Result<(), FsStatus> {
        let (command, output, response) = {
            let state = self.inner.lock();
            let command = match &state.request {
                Some(request) => request.command(),
                None => return Err(FsStatus::FatalError),
            };
            (command, state.output.clone(), state.response.clone())
        };

        if matches!(output, FsOutput::None) {
            return Ok(());
        }

        let bytes = response.map(|span| span.read()).unwrap_or_default();
        let response = FsaResponse::decode(command, &bytes).map_err(|e| {
            log::error!("fs: bad {:?} response: {}", command, e);
            FsStatus::FatalError
        })?;

        match (output, response) {
            (FsOutput::Handle(out), FsaResponse::Handle(handle)) => out.set(handle),
            (FsOutput::Pos(out), FsaResponse::Pos(pos)) => out.set(pos),
            (FsOutput::Stat(out), FsaResponse::Stat(stat)) => out.set(stat),
            (FsOutput::DirEntry(out), FsaResponse::DirEntry(entry)) => out.set(entry),
            (FsOutput::VolumeInfo(out), FsaResponse::VolumeInfo(mut info)) => {
                info.reserved = [0, 0, -1, -1];
                out.set(info);
            }
            (FsOutput::Cwd(out), FsaResponse::Cwd(path)) => {
                if !out.is_empty() {
                    let len = path.len();
                    if len >= out.len() {
                        log::error!("fs: cwd of {} bytes does not fit {} byte buffer", len, out.len());
                        return Err(FsStatus::FatalError);
                    }
                    let mut padded = path.into_bytes();
                    padded.resize(out.len(), 0);
                    out.write(&padded);
                }
            }
            (output, response) => {
                log::error!("fs: {:?} cannot be copied to {:?}", response, output);
                return Err(FsStatus::FatalError);
            }
        }

        Ok(())
    }

    /// Posts the result to the configured completion target.
    pub(crate) fn deliver(&self, result: FsResult) {
        let (callback, queue, client) = {
            let mut state = self.inner.lock();
            (state.callback.take(), state.io_msg_queue.clone(), state.client.clone())
        };

        if let Some(queue) = queue {
            if queue
                .send(FsAsyncResult {
                    block: self.clone(),
                    result,
                })
                .is_err()
            {
                crate::fatal(format_args!("fs: could not send async result message"));
            }
            return;
        }

        match (callback, client) {
            (Some(callback), Some(client)) => {
                let block = self.clone();
                if !client.context().appio().post(move || callback(&block, result)) {
                    log::error!("fs: appio gone, dropping completion");
                }
            }
            _ => log::warn!("fs: no completion target, dropping result {:?}", result),
        }
    }
}

impl Default for FsCmdBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FsCmdBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("FsCmdBlock")
            .field("status", &state.status)
            .field("command", &state.request.as_ref().map(FsaRequest::command))
            .finish()
    }
}
