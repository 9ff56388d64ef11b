//! # Kernel IPC Transport
//!
//! Accepts buffers submitted by the per-core drivers, routes each one
//! through the [`IosRouter`] and hands the answered buffer back to the
//! attached response handler.
//!
//! ## Delivery Modes
//!
//! - **Threaded**: submissions are queued to a single kernel worker, so
//!   replies arrive on a thread other than the submitter's. Matches the
//!   asynchrony real hardware shows.
//! - **Inline**: the buffer is routed and answered on the submitting
//!   thread before `submit` returns. Deterministic, useful in tests.
//!
//! ```text
//!   core N ──submit(N, idx)──► [worker queue] ──► router.dispatch(buffer)
//!                                                        │
//!   core N ◄──process_responses(N, [idx]) ◄──────────────┘
//! ```

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use cafe_ios::{
    BufferIndex, CoreId, IosCommand, IosError, IpcBufferArena, IpcResponseHandler, IpcTransport,
};
use crossbeam_channel::{Receiver, Sender};
use spin::{Mutex, RwLock};

use crate::ios::IosRouter;
use crate::{DeliveryMode, KernelConfig};

struct Shared {
    router: Arc<IosRouter>,
    arena: Arc<IpcBufferArena>,
    handler: RwLock<Option<Weak<dyn IpcResponseHandler>>>,
}

impl Shared {
    fn deliver(&self, core: CoreId, index: BufferIndex) {
        if self.arena.owner(index) != Some(core) {
            log::error!("kernel: buffer {} is not owned by core {}", index.0, core);
            panic!("kernel: buffer {} is not owned by core {}", index.0, core);
        }

        match self.arena.lock(index) {
            Some(mut buffer) => {
                self.router.dispatch(&mut buffer);
            }
            None => {
                log::error!("kernel: no buffer at {}", index.0);
                panic!("kernel: no buffer at {}", index.0);
            }
        }

        self.respond(core, index);
    }

    /// Answers the buffer with `error` without routing it.
    fn refuse(&self, core: CoreId, index: BufferIndex, error: IosError) {
        match self.arena.lock(index) {
            Some(mut buffer) => {
                buffer.prev_handle = buffer.handle;
                buffer.prev_command = buffer.command;
                buffer.reply = error.code();
                buffer.command = IosCommand::Reply;
            }
            None => {
                log::error!("kernel: no buffer at {}", index.0);
                return;
            }
        }

        self.respond(core, index);
    }

    fn respond(&self, core: CoreId, index: BufferIndex) {
        let handler = self.handler.read().as_ref().and_then(Weak::upgrade);
        match handler {
            Some(handler) => handler.process_responses(core, &[index]),
            None => log::warn!("kernel: no response handler, dropping reply for buffer {}", index.0),
        }
    }
}

/// The kernel end of the request channel.
pub struct KernelIpc {
    mode: DeliveryMode,
    shared: Arc<Shared>,
    queue: Mutex<Option<Sender<(CoreId, BufferIndex)>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl KernelIpc {
    pub fn new(config: KernelConfig, router: Arc<IosRouter>, arena: Arc<IpcBufferArena>) -> Arc<Self> {
        let shared = Arc::new(Shared {
            router,
            arena,
            handler: RwLock::new(None),
        });

        let (queue, worker) = match config.delivery {
            DeliveryMode::Inline => (None, None),
            DeliveryMode::Threaded => {
                let (sender, receiver) = crossbeam_channel::unbounded();
                let worker = spawn_worker(shared.clone(), receiver);
                (Some(sender), worker)
            }
        };

        log::info!("kernel: ipc transport up ({:?} delivery)", config.delivery);

        Arc::new(Self {
            mode: config.delivery,
            shared,
            queue: Mutex::new(queue),
            worker: Mutex::new(worker),
        })
    }

    /// Installs the handler answered buffers are returned to.
    ///
    /// Only a weak reference is kept; the handler normally owns the
    /// transport through its drivers.
    pub fn attach<H: IpcResponseHandler + 'static>(&self, handler: &Arc<H>) {
        let handler: Weak<H> = Arc::downgrade(handler);
        let handler: Weak<dyn IpcResponseHandler> = handler;
        *self.shared.handler.write() = Some(handler);
    }

    pub fn router(&self) -> &Arc<IosRouter> {
        &self.shared.router
    }

    pub fn delivery(&self) -> DeliveryMode {
        self.mode
    }
}

impl IpcTransport for KernelIpc {
    fn submit(&self, core: CoreId, buffer: BufferIndex) {
        match self.mode {
            DeliveryMode::Inline => self.shared.deliver(core, buffer),
            DeliveryMode::Threaded => {
                let sent = match self.queue.lock().as_ref() {
                    Some(queue) => queue.send((core, buffer)).is_ok(),
                    None => false,
                };
                if !sent {
                    log::error!("kernel: worker gone, failing buffer {} from core {}", buffer.0, core);
                    self.shared.refuse(core, buffer, IosError::FailInternal);
                }
            }
        }
    }
}

impl Drop for KernelIpc {
    fn drop(&mut self) {
        // Closing the queue ends the worker loop.
        self.queue.lock().take();

        if let Some(worker) = self.worker.lock().take() {
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                log::error!("kernel: ipc worker panicked");
            }
        }
    }
}

fn spawn_worker(
    shared: Arc<Shared>,
    receiver: Receiver<(CoreId, BufferIndex)>,
) -> Option<JoinHandle<()>> {
    let spawned = thread::Builder::new()
        .name("kernel-ipc".into())
        .spawn(move || {
            for (core, index) in receiver.iter() {
                shared.deliver(core, index);
            }
            log::debug!("kernel: ipc worker exiting");
        });

    match spawned {
        Ok(worker) => Some(worker),
        Err(e) => {
            log::error!("kernel: failed to spawn ipc worker: {}", e);
            None
        }
    }
}
