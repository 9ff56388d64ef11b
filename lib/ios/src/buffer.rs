//! # IPC Message Buffers
//!
//! The fixed-size record exchanged between an application core and the
//! kernel. A buffer carries a command tag, a target handle, argument slots
//! and two memory span references. When the kernel finishes with a buffer
//! it stamps the reply and rewrites the tag to [`IosCommand::Reply`], which
//! is the only thing distinguishing a completed response from a pending
//! request on the same channel.
//!
//! ## Argument layout
//!
//! | command | args[0] | args[1] | args[2] | args[3] | args[4] | spans |
//! |---------|---------|---------|---------|---------|---------|-------|
//! | Open    | -       | name len| mode    | -       | -       | buffer1 = name |
//! | Close   | -       | -       | -       | -       | -       | - |
//! | Ioctl   | request | -       | in len  | -       | out len | buffer1 = in, buffer2 = out |
//! | Ioctlv  | request | in count| out count| -      | -       | vectors |

use core::ops::Range;

use bitflags::bitflags;
use spin::{Mutex, MutexGuard};

use crate::error::IosError;
use crate::memory::IoSpan;
use crate::{CoreId, IosHandle, IpcConfig};

/// Number of argument slots in a message buffer.
pub const IPC_ARG_COUNT: usize = 5;

/// IOS command tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum IosCommand {
    #[default]
    Invalid = 0,
    Open = 1,
    Close = 2,
    Read = 3,
    Write = 4,
    Seek = 5,
    Ioctl = 6,
    Ioctlv = 7,
    Reply = 8,
}

bitflags! {
    /// Device open mode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IosOpenMode: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

/// Global position of a buffer within the [`IpcBufferArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferIndex(pub usize);

/// A single IPC message buffer.
#[derive(Debug, Clone, Default)]
pub struct IpcBuffer {
    /// Command tag, rewritten to `Reply` on completion
    pub command: IosCommand,
    /// Reply code or handle
    pub reply: i32,
    /// Target handle
    pub handle: IosHandle,
    pub flags: u32,
    /// Owning process
    pub process_id: u32,
    /// Typed argument slots
    pub args: [u32; IPC_ARG_COUNT],
    /// First memory span (open name, ioctl input)
    pub buffer1: Option<IoSpan>,
    /// Second memory span (ioctl output)
    pub buffer2: Option<IoSpan>,
    /// Ioctlv vectors, inputs first then outputs
    pub vectors: Vec<IoSpan>,
    /// Handle of the request this reply answers
    pub prev_handle: IosHandle,
    /// Command of the request this reply answers
    pub prev_command: IosCommand,
}

impl IpcBuffer {
    /// Clears everything a previous request left behind and stamps a new
    /// command header with an OK reply.
    pub fn stamp(&mut self, handle: IosHandle, command: IosCommand) {
        self.args = [0; IPC_ARG_COUNT];
        self.buffer1 = None;
        self.buffer2 = None;
        self.vectors.clear();
        self.command = command;
        self.handle = handle;
        self.flags = 0;
        self.process_id = 0;
        self.reply = IosError::Ok.code();
    }

    /// Returns true once the kernel has answered this buffer.
    pub fn is_reply(&self) -> bool {
        self.command == IosCommand::Reply
    }
}

/// Contiguous pool of message buffers, `buffer_count` per core.
pub struct IpcBufferArena {
    buffers: Box<[Mutex<IpcBuffer>]>,
    per_core: usize,
    cores: usize,
}

impl IpcBufferArena {
    /// Allocates the arena for every core.
    pub fn new(config: &IpcConfig) -> Self {
        let total = config.buffer_count * config.core_count;
        Self {
            buffers: (0..total).map(|_| Mutex::new(IpcBuffer::default())).collect(),
            per_core: config.buffer_count,
            cores: config.core_count,
        }
    }

    /// Buffers owned by each core.
    pub fn buffers_per_core(&self) -> usize {
        self.per_core
    }

    /// Number of cores the arena was sized for.
    pub fn core_count(&self) -> usize {
        self.cores
    }

    /// Global index range of a core's slice.
    pub fn slice(&self, core: CoreId) -> Range<usize> {
        let start = core * self.per_core;
        start..start + self.per_core
    }

    /// Core owning a global buffer index.
    pub fn owner(&self, index: BufferIndex) -> Option<CoreId> {
        if index.0 < self.buffers.len() && self.per_core > 0 {
            Some(index.0 / self.per_core)
        } else {
            None
        }
    }

    /// Locks a buffer for reading or writing.
    pub fn lock(&self, index: BufferIndex) -> Option<MutexGuard<'_, IpcBuffer>> {
        self.buffers.get(index.0).map(|buffer| buffer.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_slices_do_not_overlap() {
        let arena = IpcBufferArena::new(&IpcConfig {
            buffer_count: 4,
            core_count: 3,
        });
        assert_eq!(arena.slice(0), 0..4);
        assert_eq!(arena.slice(2), 8..12);
        assert_eq!(arena.owner(BufferIndex(5)), Some(1));
        assert_eq!(arena.owner(BufferIndex(12)), None);
        assert!(arena.lock(BufferIndex(12)).is_none());
    }

    #[test]
    fn test_stamp_clears_previous_request() {
        let mut buffer = IpcBuffer {
            args: [1, 2, 3, 4, 5],
            reply: -4,
            buffer1: Some(IoSpan::zeroed(4)),
            vectors: vec![IoSpan::zeroed(1)],
            ..IpcBuffer::default()
        };
        buffer.stamp(3, IosCommand::Ioctl);
        assert_eq!(buffer.args, [0; IPC_ARG_COUNT]);
        assert_eq!(buffer.reply, 0);
        assert_eq!(buffer.handle, 3);
        assert!(buffer.buffer1.is_none());
        assert!(buffer.vectors.is_empty());
        assert!(!buffer.is_reply());
    }
}
