//! Command completion channels.

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::cmdblock::FsCmdBlock;
use crate::status::FsResult;

/// Message posted when a command finishes.
#[derive(Debug, Clone)]
pub struct FsAsyncResult {
    pub block: FsCmdBlock,
    pub result: FsResult,
}

/// Bounded queue of completion messages. Clones share the same queue.
#[derive(Debug, Clone)]
pub struct FsMessageQueue {
    sender: Sender<FsAsyncResult>,
    receiver: Receiver<FsAsyncResult>,
}

impl FsMessageQueue {
    pub fn new(depth: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(depth);
        Self { sender, receiver }
    }

    /// Posts without blocking; a full queue hands the message back.
    pub fn send(&self, message: FsAsyncResult) -> Result<(), FsAsyncResult> {
        self.sender.try_send(message).map_err(|e| match e {
            TrySendError::Full(message) | TrySendError::Disconnected(message) => message,
        })
    }

    /// Blocks for the next message.
    pub fn recv(&self) -> Option<FsAsyncResult> {
        self.receiver.recv().ok()
    }

    pub fn try_recv(&self) -> Option<FsAsyncResult> {
        self.receiver.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.receiver.capacity()
    }
}

/// User callback, invoked once on the AppIO worker.
pub type FsAsyncCallback = Box<dyn FnOnce(&FsCmdBlock, FsResult) + Send>;

/// Where a command reports completion. Exactly one target must be set.
#[derive(Default)]
pub struct FsAsyncData {
    pub callback: Option<FsAsyncCallback>,
    pub io_msg_queue: Option<FsMessageQueue>,
}

impl FsAsyncData {
    pub fn callback(callback: impl FnOnce(&FsCmdBlock, FsResult) + Send + 'static) -> Self {
        Self {
            callback: Some(Box::new(callback)),
            io_msg_queue: None,
        }
    }

    pub fn queue(queue: FsMessageQueue) -> Self {
        Self {
            callback: None,
            io_msg_queue: Some(queue),
        }
    }

    /// True when exactly one completion target is configured.
    pub fn is_valid(&self) -> bool {
        self.callback.is_some() != self.io_msg_queue.is_some()
    }
}
