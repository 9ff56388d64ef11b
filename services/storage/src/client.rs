//! # Filesystem Client
//!
//! A client is one caller's session with `/dev/fsa`: a device handle, a
//! command queue and a volume state. Commands run one at a time per client.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cafe_ios::{CoreId, IosHandle, IosOpenMode};
use spin::{Mutex, MutexGuard};

use crate::cmdblock::{FsCancelFlags, FsCmdBlock};
use crate::command::FsCommand;
use crate::message::{FsAsyncData, FsMessageQueue};
use crate::queue::{self, FsCmdQueue};
use crate::status::{FsErrorFlag, FsResult, FsStatus};
use crate::volume::{StateChangeCallback, VolumeFsm, VolumeState};
use crate::{FsContext, FSA_DEVICE_NAME};

pub(crate) struct ClientState {
    pub queue: FsCmdQueue,
    pub fsm: VolumeFsm,
    /// Last device status seen by result handling
    pub last_error: i32,
    pub notify: Option<StateChangeCallback>,
}

pub(crate) struct ClientShared {
    context: Arc<FsContext>,
    core: CoreId,
    handle: IosHandle,
    registered: AtomicBool,
    state: Mutex<ClientState>,
}

impl ClientShared {
    pub fn context(&self) -> &Arc<FsContext> {
        &self.context
    }

    pub fn core(&self) -> CoreId {
        self.core
    }

    pub fn fsa_handle(&self) -> IosHandle {
        self.handle
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock()
    }

    /// Applies a volume transition and notifies the observer.
    pub fn enter_volume_state(&self, next: VolumeState) {
        let (previous, notify) = {
            let mut state = self.state.lock();
            (state.fsm.enter(next), state.notify.clone())
        };

        match previous {
            Some(old) => {
                log::warn!("fs: client on core {} volume {} -> {}", self.core, old, next);
                if let Some(notify) = notify {
                    notify(old, next);
                }
            }
            None => log::debug!("fs: volume transition to {} ignored", next),
        }
    }
}

/// Handle to a registered filesystem client. Clones share the session.
#[derive(Clone)]
pub struct FsClient {
    shared: Arc<ClientShared>,
}

impl FsClient {
    /// Opens `/dev/fsa` from `core` and registers a new client.
    pub fn add(context: &Arc<FsContext>, core: CoreId) -> Result<Self, FsStatus> {
        let Some(driver) = context.ipc().driver(core) else {
            log::error!("fs: no ipc driver for core {}", core);
            return Err(FsStatus::FatalError);
        };

        let handle = driver.ios_open(FSA_DEVICE_NAME, IosOpenMode::empty());
        if handle < 0 {
            log::warn!("fs: could not open {}: {}", FSA_DEVICE_NAME, handle);
            return Err(FsStatus::Device(handle));
        }

        log::debug!("fs: client on core {} registered with handle {}", core, handle);

        Ok(Self {
            shared: Arc::new(ClientShared {
                context: context.clone(),
                core,
                handle,
                registered: AtomicBool::new(true),
                state: Mutex::new(ClientState {
                    queue: FsCmdQueue::new(),
                    fsm: VolumeFsm::new(),
                    last_error: 0,
                    notify: None,
                }),
            }),
        })
    }

    /// Unregisters the client and closes its device handle. Replies still
    /// outstanding finish with `Cancelled`.
    pub fn unregister(&self) -> Result<(), FsStatus> {
        if !self.shared.registered.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let Some(driver) = self.shared.context.ipc().driver(self.shared.core) else {
            return Err(FsStatus::FatalError);
        };

        let reply = driver.ios_close(self.shared.handle);
        if reply < 0 {
            log::warn!("fs: closing handle {} failed: {}", self.shared.handle, reply);
            return Err(FsStatus::Device(reply));
        }
        Ok(())
    }

    pub fn is_registered(&self) -> bool {
        self.shared.is_registered()
    }

    pub fn core(&self) -> CoreId {
        self.shared.core
    }

    pub fn fsa_handle(&self) -> IosHandle {
        self.shared.handle
    }

    pub fn volume_state(&self) -> VolumeState {
        self.shared.lock().fsm.state()
    }

    /// Last raw device status seen for this client.
    pub fn last_error(&self) -> i32 {
        self.shared.lock().last_error
    }

    /// Installs an observer called with (old, new) on every volume-state
    /// change. It runs on the AppIO worker.
    pub fn set_state_change_notification(&self, callback: Option<StateChangeCallback>) {
        self.shared.lock().notify = callback;
    }

    /// Requests cancellation of `block`. Takes effect the next time the
    /// block is requeued; a command already with the device runs to
    /// completion.
    pub fn cancel(&self, block: &FsCmdBlock) {
        block.lock().cancel.insert(FsCancelFlags::CANCELLING);
    }

    /// Commands waiting behind the in-flight one.
    pub fn pending_commands(&self) -> usize {
        self.shared.lock().queue.pending_len()
    }

    /// Deepest the pending list has been.
    pub fn max_pending_commands(&self) -> usize {
        self.shared.lock().queue.max_pending()
    }

    pub fn has_in_flight(&self) -> bool {
        self.shared.lock().queue.in_flight().is_some()
    }

    /// Queues `command` on `block`; completion goes to `completion`.
    pub fn submit_async(
        &self,
        block: &FsCmdBlock,
        command: FsCommand,
        error_mask: FsErrorFlag,
        completion: FsAsyncData,
    ) -> Result<(), FsStatus> {
        block.prepare(&self.shared, error_mask, completion)?;
        let max = self.shared.context.config().max_bytes_per_request;
        let continuation = block.load(command, max)?;
        queue::requeue(&self.shared, block, false, continuation);
        Ok(())
    }

    /// Runs `command` and blocks until it completes.
    pub fn submit(&self, block: &FsCmdBlock, command: FsCommand, error_mask: FsErrorFlag) -> FsResult {
        if self.shared.context.appio().is_current() {
            log::error!("fs: synchronous command issued from the AppIO worker");
            return Err(FsStatus::FatalError);
        }

        let queue = FsMessageQueue::new(1);
        self.submit_async(block, command, error_mask, FsAsyncData::queue(queue.clone()))?;

        match queue.recv() {
            Some(message) => message.result,
            None => Err(FsStatus::FatalError),
        }
    }
}
