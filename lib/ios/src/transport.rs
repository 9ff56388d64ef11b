//! Seams between the application cores and the kernel.

use crate::buffer::BufferIndex;
use crate::CoreId;

/// Kernel side of the boundary: accepts submitted buffers.
///
/// Submission has no synchronous result. The transport answers later by
/// handing the completed buffer index to an [`IpcResponseHandler`].
pub trait IpcTransport: Send + Sync {
    /// Hands a filled buffer owned by `core` to the kernel.
    fn submit(&self, core: CoreId, buffer: BufferIndex);
}

/// Application side of the boundary: consumes completed buffers.
pub trait IpcResponseHandler: Send + Sync {
    /// Processes buffers that the kernel has answered on behalf of `core`.
    fn process_responses(&self, core: CoreId, completed: &[BufferIndex]);
}
