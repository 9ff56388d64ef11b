//! # Client Command Queue
//!
//! Serializes a client's commands: at most one is with the device at a
//! time. Everything else waits in the pending list; busy retries and
//! transfer continuations jump to its front.
//!
//! ```text
//!  requeue ──► pending [front ... back] ──process_cmd──► in flight ──► /dev/fsa
//!                 ▲                                           │
//!                 │ busy / next chunk              handle_result (AppIO)
//!                 └───────────────────────────────────────────┤
//!                                                   complete ─┴─► deliver
//! ```
//!
//! Lock order is client, then block. Neither lock is held across an IPC
//! submission or a delivery.

use std::collections::VecDeque;
use std::sync::Arc;

use cafe_ios::{IoSpan, SharedBuffer};
use cafe_ipc::IpcCallback;

use crate::client::ClientShared;
use crate::cmdblock::{Continuation, FsCancelFlags, FsCmdBlock, FsCmdBlockStatus, TransferStep};
use crate::fsa::FsaCommand;
use crate::status::{project, FsResult, FsStatus, Projection};

/// Pending list, in-flight slot and last-dequeued marker for one client.
#[derive(Default)]
pub(crate) struct FsCmdQueue {
    pending: VecDeque<FsCmdBlock>,
    in_flight: Option<FsCmdBlock>,
    last_dequeued: Option<FsCmdBlock>,
    max_pending: usize,
}

impl FsCmdQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, block: FsCmdBlock) {
        self.pending.push_back(block);
        self.max_pending = self.max_pending.max(self.pending.len());
    }

    pub fn push_front(&mut self, block: FsCmdBlock) {
        self.pending.push_front(block);
        self.max_pending = self.max_pending.max(self.pending.len());
    }

    /// Takes the head of the pending list if nothing is in flight.
    pub fn dequeue(&mut self) -> Option<FsCmdBlock> {
        if self.in_flight.is_some() {
            return None;
        }

        let block = self.pending.pop_front()?;
        self.in_flight = Some(block.clone());
        self.last_dequeued = Some(block.clone());
        Some(block)
    }

    /// Frees the in-flight slot if `block` holds it.
    pub fn release(&mut self, block: &FsCmdBlock) -> bool {
        match &self.in_flight {
            Some(current) if current.same_block(block) => {
                self.in_flight = None;
                true
            }
            _ => false,
        }
    }

    pub fn clear_last_dequeued(&mut self, block: &FsCmdBlock) {
        if self
            .last_dequeued
            .as_ref()
            .is_some_and(|last| last.same_block(block))
        {
            self.last_dequeued = None;
        }
    }

    pub fn in_flight(&self) -> Option<&FsCmdBlock> {
        self.in_flight.as_ref()
    }

    #[cfg(test)]
    pub fn last_dequeued(&self) -> Option<&FsCmdBlock> {
        self.last_dequeued.as_ref()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending
    }
}

/// Queues `block` with `continuation`, or short-circuits it with
/// `Cancelled` if a cancel is pending.
pub(crate) fn requeue(
    client: &Arc<ClientShared>,
    block: &FsCmdBlock,
    at_front: bool,
    continuation: Continuation,
) {
    {
        let mut state = client.lock();
        let mut body = block.lock();

        if body.cancel.contains(FsCancelFlags::CANCELLING) {
            body.cancel.remove(FsCancelFlags::CANCELLING);
            body.status = FsCmdBlockStatus::Cancelled;
            drop(body);
            state.queue.clear_last_dequeued(block);
            drop(state);

            log::debug!("fs: cancelled {:?} at requeue", block);
            reply_result(client, block, Err(FsStatus::Cancelled));
            return;
        }

        body.continuation = continuation;
        body.status = FsCmdBlockStatus::QueuedCommand;
        drop(body);

        state.queue.release(block);
        if at_front {
            state.queue.push_front(block.clone());
        } else {
            state.queue.push_back(block.clone());
        }
    }

    process_cmd(client);
}

/// Dispatches the next pending command if the client is idle.
pub(crate) fn process_cmd(client: &Arc<ClientShared>) {
    let next = client.lock().queue.dequeue();

    if let Some(block) = next {
        send(client, &block);
    }
}

/// Issues the in-flight command to `/dev/fsa`. The reply is handled on the
/// AppIO worker.
fn send(client: &Arc<ClientShared>, block: &FsCmdBlock) {
    let Some(dispatch) = block.dispatch() else {
        crate::fatal(format_args!("fs: dequeued {:?} without a request", block));
    };

    let command = dispatch.request.command();
    let encoded = match dispatch.request.encode() {
        Ok(encoded) => encoded,
        Err(e) => crate::fatal(format_args!("fs: {:?} request failed to encode: {}", command, e)),
    };
    let request = IoSpan::whole(SharedBuffer::from_vec(encoded));

    let Some(driver) = client.context().ipc().driver(client.core()) else {
        crate::fatal(format_args!("fs: no ipc driver for core {}", client.core()));
    };

    let callback: IpcCallback = {
        let context = client.context().clone();
        let block = block.clone();
        Box::new(move |reply| {
            if !context.appio().post(move || handle_result(block, reply)) {
                log::error!("fs: appio gone, dropping reply {:#x}", reply);
            }
        })
    };

    log::trace!("fs: core {} dispatch {:?}", client.core(), command);

    let submitted = if command.is_vectored() {
        let data = dispatch.data.unwrap_or_else(|| IoSpan::zeroed(0));
        let (vec_in, vec_out) = match command {
            FsaCommand::WriteFile => (2, 1),
            _ => (1, 2),
        };
        driver.ios_ioctlv_async(
            client.fsa_handle(),
            command as u32,
            vec_in,
            vec_out,
            vec![request, data, dispatch.response],
            callback,
        )
    } else {
        driver.ios_ioctl_async(
            client.fsa_handle(),
            command as u32,
            Some(request),
            Some(dispatch.response),
            callback,
        )
    };

    if let Err(e) = submitted {
        log::error!("fs: could not submit {:?}: {}", command, e);
        complete(client, block, Err(FsStatus::Device(e.code())));
    }
}

/// Projects the device status of a finished command. Runs on AppIO.
pub(crate) fn handle_result(block: FsCmdBlock, reply: i32) {
    let Some(client) = block.client() else {
        crate::fatal(format_args!("fs: result for unbound {:?}", block));
    };

    if !client.is_registered() {
        log::debug!("fs: client gone, cancelling {:?}", block);
        reply_result(&client, &block, Err(FsStatus::Cancelled));
        return;
    }

    client.lock().last_error = reply;
    let (mask, continuation) = {
        let body = block.lock();
        (body.error_mask, body.continuation)
    };

    match project(reply, mask) {
        Projection::Retry => {
            log::trace!("fs: device busy, retrying {:?}", block);
            requeue(&client, &block, true, continuation);
        }
        Projection::Transition(state) => {
            log::warn!("fs: status {:#x} moves volume to {}", reply, state);
            client.enter_volume_state(state);
        }
        Projection::Drop => {
            log::debug!("fs: status {:#x} produces no reply", reply);
        }
        Projection::Unrecoverable(status) => {
            crate::fatal(format_args!("fs: unrecoverable device status {}", status));
        }
        Projection::Deliver(result) => {
            client.lock().queue.clear_last_dequeued(&block);
            reply_result(&client, &block, result);
        }
    }
}

/// Runs the block's continuation with `result`, then keeps the queue moving.
pub(crate) fn reply_result(client: &Arc<ClientShared>, block: &FsCmdBlock, result: FsResult) {
    let continuation = block.lock().continuation;

    match continuation {
        Continuation::Generic => complete(client, block, result),
        Continuation::ChunkedRead | Continuation::ChunkedWrite => {
            finish_transfer(client, block, result)
        }
    }

    process_cmd(client);
}

/// Finishes the command: idles the block, copies results out, delivers.
pub(crate) fn complete(client: &Arc<ClientShared>, block: &FsCmdBlock, result: FsResult) {
    {
        let mut state = client.lock();
        state.queue.clear_last_dequeued(block);
        state.queue.release(block);
        block.finish();
    }

    let result = match result {
        Ok(value) => block.copy_out().map(|()| value),
        Err(e) => Err(e),
    };

    block.deliver(result);
    process_cmd(client);
}

/// Accounts for one sub-transfer and either finishes or issues the next.
fn finish_transfer(client: &Arc<ClientShared>, block: &FsCmdBlock, result: FsResult) {
    let bytes = match result {
        Ok(bytes) => bytes,
        Err(_) => return complete(client, block, result),
    };

    let max = client.context().config().max_bytes_per_request;
    match block.advance_transfer(bytes, max) {
        TransferStep::Finish(chunks) => complete(client, block, Ok(chunks)),
        TransferStep::Continue => {
            let continuation = block.lock().continuation;
            requeue(client, block, true, continuation);
        }
    }
}
