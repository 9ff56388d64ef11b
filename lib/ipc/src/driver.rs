//! # IPC Request Channel
//!
//! One driver per application core. The driver owns its core's slice of the
//! buffer arena and wraps every buffer in a request that can be allocated,
//! submitted to the kernel, waited on and freed.
//!
//! ## Request Lifecycle
//!
//! ```text
//!  free FIFO ──allocate──► allocated ──submit──► kernel
//!      ▲                                           │
//!      │                                   process_responses
//!      │                                           │
//!      ├──── wait_response ◄── completion event ◄──┤ (no callback)
//!      └──── free ◄──────────── callback(reply) ◄──┘ (callback)
//! ```
//!
//! `allocate` never fails because the pool is momentarily empty: the caller
//! sleeps on the free-slot condition until a request comes back.

use std::sync::Arc;

use cafe_ios::{
    BufferIndex, CoreId, IosCommand, IosError, IosHandle, IosResult, IpcBuffer, IpcBufferArena,
    IpcTransport,
};
use parking_lot::{Condvar, Mutex};

use crate::event::Event;
use crate::fifo::{FifoError, RequestFifo};

/// Completion callback, invoked on the response delivery context with the reply.
pub type IpcCallback = Box<dyn FnOnce(i32) + Send>;

/// Driver status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcDriverStatus {
    Closed,
    Initialised,
}

/// Position of a request inside its driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub usize);

/// Request bookkeeping. The buffer itself lives in the arena at the same
/// position within the core's slice.
#[derive(Default)]
struct Request {
    allocated: bool,
    extra: u32,
    callback: Option<IpcCallback>,
}

struct DriverState {
    status: IpcDriverStatus,
    requests_initialised: bool,
    requests: Vec<Request>,
    free_fifo: RequestFifo<RequestId>,
    outbound_fifo: RequestFifo<RequestId>,
    waiting_free_fifo: bool,
    requests_submitted: u64,
    requests_processed: u64,
    failed_allocate: u64,
    failed_free: u64,
}

/// Counter snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpcDriverStats {
    pub requests_submitted: u64,
    pub requests_processed: u64,
    pub failed_allocate: u64,
    pub failed_free: u64,
    pub free_count: usize,
    pub free_max_count: usize,
    pub outbound_max_count: usize,
}

/// Per-core IPC request channel.
pub struct IpcDriver {
    core_id: CoreId,
    arena: Arc<IpcBufferArena>,
    transport: Arc<dyn IpcTransport>,
    /// First global arena index of this core's slice
    base: usize,
    state: Mutex<DriverState>,
    free_slot: Condvar,
    events: Box<[Event]>,
}

impl IpcDriver {
    /// Binds a driver to its core's buffer slice.
    pub fn initialise(
        core_id: CoreId,
        arena: Arc<IpcBufferArena>,
        transport: Arc<dyn IpcTransport>,
    ) -> IosResult<Self> {
        if core_id >= arena.core_count() {
            return Err(IosError::Invalid);
        }

        let count = arena.buffers_per_core();
        let base = arena.slice(core_id).start;

        Ok(Self {
            core_id,
            arena,
            transport,
            base,
            state: Mutex::new(DriverState {
                status: IpcDriverStatus::Initialised,
                requests_initialised: false,
                requests: (0..count).map(|_| Request::default()).collect(),
                free_fifo: RequestFifo::new(count),
                outbound_fifo: RequestFifo::new(count),
                waiting_free_fifo: false,
                requests_submitted: 0,
                requests_processed: 0,
                failed_allocate: 0,
                failed_free: 0,
            }),
            free_slot: Condvar::new(),
            events: (0..count).map(|_| Event::new()).collect(),
        })
    }

    /// Resets every request and fills the free pool. Opening an open
    /// driver starts it over; the status itself is left as it was.
    pub fn open(&self) -> IosResult<()> {
        let mut state = self.state.lock();

        for request in state.requests.iter_mut() {
            request.callback = None;
            request.extra = 0;
            request.allocated = false;
        }
        state.requests_initialised = true;

        state.free_fifo.reset();
        state.outbound_fifo.reset();

        for index in 0..state.requests.len() {
            if let Err(e) = state.free_fifo.push(RequestId(index)) {
                state.failed_free += 1;
                log::warn!("ipc[{}]: could not seed request {}: {}", self.core_id, index, e);
            }
        }

        log::debug!("ipc[{}]: opened with {} requests", self.core_id, state.requests.len());
        Ok(())
    }

    /// Marks the driver closed. Outstanding requests are left untouched.
    pub fn close(&self) -> IosResult<()> {
        self.state.lock().status = IpcDriverStatus::Closed;
        Ok(())
    }

    pub fn status(&self) -> IpcDriverStatus {
        self.state.lock().status
    }

    pub fn core_id(&self) -> CoreId {
        self.core_id
    }

    /// Claims a request, blocking while the free pool is empty.
    pub fn allocate(
        &self,
        handle: IosHandle,
        command: IosCommand,
        extra: u32,
        callback: Option<IpcCallback>,
    ) -> IosResult<RequestId> {
        let mut state = self.state.lock();

        if !state.requests_initialised {
            return Err(IosError::NotReady);
        }

        let request = loop {
            match state.free_fifo.pop() {
                Ok(request) => break request,
                Err(FifoError::Empty) => {
                    state.failed_allocate += 1;
                    state.waiting_free_fifo = true;
                    log::trace!("ipc[{}]: free pool empty, waiting", self.core_id);
                    self.free_slot.wait(&mut state);
                }
                Err(FifoError::Full) => {
                    fatal(format_args!("ipc[{}]: free FIFO pop reported Full", self.core_id))
                }
            }
        };

        let slot = &mut state.requests[request.0];
        slot.allocated = true;
        slot.extra = extra;
        slot.callback = callback;
        drop(state);

        self.with_buffer(request, |buffer| buffer.stamp(handle, command));
        Ok(request)
    }

    /// Returns a request to the free pool and wakes allocators.
    ///
    /// A request this driver never handed out is rejected with
    /// `InvalidArg`; one the pool already holds fails with `QFull`.
    pub fn free(&self, request: RequestId) -> IosResult<()> {
        let mut state = self.state.lock();

        if request.0 >= state.requests.len() {
            state.failed_free += 1;
            log::warn!("ipc[{}]: free of unknown request {}", self.core_id, request.0);
            return Err(IosError::InvalidArg);
        }

        let result = state.free_fifo.push(request).map_err(|_| IosError::QFull);

        if let Some(slot) = state.requests.get_mut(request.0) {
            slot.allocated = false;
            slot.callback = None;
        }

        if result.is_err() {
            state.failed_free += 1;
            log::warn!("ipc[{}]: request {} freed twice", self.core_id, request.0);
        }

        state.waiting_free_fifo = false;
        drop(state);
        self.free_slot.notify_all();
        result
    }

    /// Hands a request to the kernel. The reply arrives through
    /// [`IpcDriver::process_responses`].
    pub fn submit(&self, request: RequestId) {
        self.event(request).reset();

        {
            let mut state = self.state.lock();
            state.requests_submitted += 1;
            if let Err(e) = state.outbound_fifo.push(request) {
                fatal(format_args!("ipc[{}]: outbound FIFO: {}", self.core_id, e));
            }
        }

        // Drain the staging queue outside the lock: an inline transport
        // re-enters process_responses on this thread.
        loop {
            let next = self.state.lock().outbound_fifo.pop();
            match next {
                Ok(request) => self
                    .transport
                    .submit(self.core_id, BufferIndex(self.base + request.0)),
                Err(_) => break,
            }
        }
    }

    /// Blocks until the request is answered, frees it and returns the reply.
    pub fn wait_response(&self, request: RequestId) -> i32 {
        self.event(request).wait();
        let reply = self.with_buffer(request, |buffer| buffer.reply);
        let _ = self.free(request);
        reply
    }

    /// Completes requests the kernel has answered.
    pub fn process_responses(&self, completed: &[BufferIndex]) {
        let count = self.events.len();

        for &index in completed {
            let request = match index.0.checked_sub(self.base) {
                Some(local) if local < count => RequestId(local),
                _ => fatal(format_args!(
                    "ipc[{}]: response buffer {} outside slice {:?}",
                    self.core_id,
                    index.0,
                    self.arena.slice(self.core_id)
                )),
            };

            let (is_reply, reply) = self.with_buffer(request, |buffer| (buffer.is_reply(), buffer.reply));
            if !is_reply {
                fatal(format_args!("ipc[{}]: buffer {} was not answered", self.core_id, index.0));
            }

            let callback = {
                let mut state = self.state.lock();
                let slot = &mut state.requests[request.0];
                if !slot.allocated {
                    fatal(format_args!(
                        "ipc[{}]: response for unallocated request {}",
                        self.core_id, request.0
                    ));
                }
                let callback = slot.callback.take();
                state.requests_processed += 1;
                callback
            };

            match callback {
                None => self.event(request).signal(),
                Some(callback) => {
                    callback(reply);
                    let _ = self.free(request);
                }
            }
        }
    }

    /// Runs `f` against the request's message buffer.
    pub fn with_buffer<R>(&self, request: RequestId, f: impl FnOnce(&mut IpcBuffer) -> R) -> R {
        let index = BufferIndex(self.base + request.0);
        match self.arena.lock(index) {
            Some(mut buffer) => f(&mut buffer),
            None => fatal(format_args!("ipc[{}]: no buffer at {}", self.core_id, index.0)),
        }
    }

    /// Caller-supplied word recorded at allocation.
    pub fn extra(&self, request: RequestId) -> u32 {
        self.state.lock().requests.get(request.0).map_or(0, |slot| slot.extra)
    }

    pub fn is_allocated(&self, request: RequestId) -> bool {
        self.state
            .lock()
            .requests
            .get(request.0)
            .is_some_and(|slot| slot.allocated)
    }

    /// True while an allocator is blocked on the free pool.
    pub fn is_waiting_free(&self) -> bool {
        self.state.lock().waiting_free_fifo
    }

    pub fn stats(&self) -> IpcDriverStats {
        let state = self.state.lock();
        IpcDriverStats {
            requests_submitted: state.requests_submitted,
            requests_processed: state.requests_processed,
            failed_allocate: state.failed_allocate,
            failed_free: state.failed_free,
            free_count: state.free_fifo.count(),
            free_max_count: state.free_fifo.max_count(),
            outbound_max_count: state.outbound_fifo.max_count(),
        }
    }

    fn event(&self, request: RequestId) -> &Event {
        match self.events.get(request.0) {
            Some(event) => event,
            None => fatal(format_args!("ipc[{}]: no request {}", self.core_id, request.0)),
        }
    }
}

/// Internal consistency violation.
fn fatal(message: core::fmt::Arguments<'_>) -> ! {
    log::error!("{}", message);
    panic!("{}", message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use cafe_ios::IpcConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records submissions without answering them.
    #[derive(Default)]
    struct Recorder {
        submitted: spin::Mutex<Vec<BufferIndex>>,
    }

    impl IpcTransport for Recorder {
        fn submit(&self, _core: CoreId, buffer: BufferIndex) {
            self.submitted.lock().push(buffer);
        }
    }

    fn driver(core: CoreId, count: usize) -> (IpcDriver, Arc<Recorder>, Arc<IpcBufferArena>) {
        let arena = Arc::new(IpcBufferArena::new(&IpcConfig {
            buffer_count: count,
            core_count: 2,
        }));
        let recorder = Arc::new(Recorder::default());
        let driver = IpcDriver::initialise(core, arena.clone(), recorder.clone()).unwrap();
        driver.open().unwrap();
        (driver, recorder, arena)
    }

    fn answer(arena: &IpcBufferArena, index: BufferIndex, reply: i32) {
        let mut buffer = arena.lock(index).unwrap();
        buffer.prev_command = buffer.command;
        buffer.reply = reply;
        buffer.command = IosCommand::Reply;
    }

    #[test]
    fn test_open_again_resets_pool() {
        let (driver, _, _) = driver(0, 4);
        let request = driver.allocate(1, IosCommand::Ioctl, 0, None).unwrap();
        assert_eq!(driver.stats().free_count, 3);

        assert_eq!(driver.open(), Ok(()));
        assert!(!driver.is_allocated(request));
        assert_eq!(driver.stats().free_count, 4);
        assert_eq!(driver.status(), IpcDriverStatus::Initialised);

        driver.close().unwrap();
        assert_eq!(driver.open(), Ok(()));
        assert_eq!(driver.status(), IpcDriverStatus::Closed);
    }

    #[test]
    fn test_allocate_before_open() {
        let arena = Arc::new(IpcBufferArena::new(&IpcConfig::default()));
        let driver = IpcDriver::initialise(0, arena, Arc::new(Recorder::default())).unwrap();
        assert_eq!(driver.status(), IpcDriverStatus::Initialised);
        assert!(matches!(
            driver.allocate(1, IosCommand::Ioctl, 0, None),
            Err(IosError::NotReady)
        ));
    }

    #[test]
    fn test_initialise_rejects_unknown_core() {
        let arena = Arc::new(IpcBufferArena::new(&IpcConfig::default()));
        assert!(IpcDriver::initialise(7, arena, Arc::new(Recorder::default())).is_err());
    }

    #[test]
    fn test_allocate_stamps_buffer() {
        let (driver, _, _) = driver(1, 4);
        let request = driver.allocate(9, IosCommand::Ioctl, 0x44, None).unwrap();
        assert!(driver.is_allocated(request));
        assert_eq!(driver.extra(request), 0x44);
        driver.with_buffer(request, |buffer| {
            assert_eq!(buffer.command, IosCommand::Ioctl);
            assert_eq!(buffer.handle, 9);
            assert_eq!(buffer.reply, 0);
        });
    }

    #[test]
    fn test_allocations_are_distinct() {
        let (driver, _, _) = driver(0, 4);
        let mut seen = Vec::new();
        for _ in 0..4 {
            let request = driver.allocate(1, IosCommand::Ioctl, 0, None).unwrap();
            assert!(!seen.contains(&request));
            seen.push(request);
        }
        for request in seen.drain(..) {
            driver.free(request).unwrap();
        }
        assert_eq!(driver.stats().free_count, 4);
        assert_eq!(driver.stats().failed_free, 0);
    }

    #[test]
    fn test_submit_uses_core_slice() {
        let (driver, recorder, _) = driver(1, 4);
        let request = driver.allocate(1, IosCommand::Close, 0, None).unwrap();
        driver.submit(request);
        assert_eq!(*recorder.submitted.lock(), vec![BufferIndex(4 + request.0)]);
        assert_eq!(driver.stats().requests_submitted, 1);
    }

    #[test]
    fn test_wait_response_frees_request() {
        let (driver, recorder, arena) = driver(0, 2);
        let request = driver.allocate(1, IosCommand::Ioctl, 0, None).unwrap();
        driver.submit(request);
        let index = recorder.submitted.lock()[0];
        answer(&arena, index, -6);
        driver.process_responses(&[index]);
        assert_eq!(driver.wait_response(request), -6);
        assert!(!driver.is_allocated(request));
        assert_eq!(driver.stats().requests_processed, 1);
    }

    #[test]
    fn test_callback_receives_reply_and_frees() {
        let (driver, recorder, arena) = driver(0, 2);
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        let request = driver
            .allocate(
                1,
                IosCommand::Ioctl,
                0,
                Some(Box::new(move |reply| {
                    assert_eq!(reply, 12);
                    seen.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();
        driver.submit(request);
        let index = recorder.submitted.lock()[0];
        answer(&arena, index, 12);
        driver.process_responses(&[index]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!driver.is_allocated(request));
        assert_eq!(driver.stats().free_count, 2);
    }

    #[test]
    fn test_allocate_blocks_until_free() {
        let (driver, _, _) = driver(0, 1);
        let driver = Arc::new(driver);
        let held = driver.allocate(1, IosCommand::Ioctl, 0, None).unwrap();

        let waiter = {
            let driver = driver.clone();
            std::thread::spawn(move || driver.allocate(2, IosCommand::Ioctl, 0, None).unwrap())
        };

        while !driver.is_waiting_free() {
            std::thread::yield_now();
        }
        driver.free(held).unwrap();

        let request = waiter.join().unwrap();
        assert!(driver.is_allocated(request));
        assert!(driver.stats().failed_allocate >= 1);
    }

    #[test]
    fn test_double_free_is_counted() {
        let (driver, _, _) = driver(0, 2);
        assert_eq!(driver.free(RequestId(0)), Err(IosError::QFull));
        assert_eq!(driver.stats().failed_free, 1);
    }

    #[test]
    fn test_free_unknown_request_is_rejected() {
        let (driver, _, _) = driver(0, 2);
        let held = driver.allocate(1, IosCommand::Ioctl, 0, None).unwrap();

        assert_eq!(driver.free(RequestId(99)), Err(IosError::InvalidArg));
        assert_eq!(driver.stats().failed_free, 1);
        assert_eq!(driver.stats().free_count, 1);

        let next = driver.allocate(1, IosCommand::Ioctl, 0, None).unwrap();
        assert_ne!(next, held);
        assert!(next.0 < 2);
    }

    #[test]
    #[should_panic]
    fn test_response_outside_slice_is_fatal() {
        let (driver, _, _) = driver(0, 2);
        driver.process_responses(&[BufferIndex(3)]);
    }

    #[test]
    #[should_panic]
    fn test_unanswered_buffer_is_fatal() {
        let (driver, recorder, _) = driver(0, 2);
        let request = driver.allocate(1, IosCommand::Ioctl, 0, None).unwrap();
        driver.submit(request);
        let index = recorder.submitted.lock()[0];
        driver.process_responses(&[index]);
    }
}
