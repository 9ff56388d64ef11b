//! # Guest IPC Driver
//!
//! The application-core half of the IPC layer. Each core owns one
//! [`IpcDriver`] over its slice of the shared buffer arena; the
//! [`IpcDrivers`] set routes completed buffers back to the owning core.
//!
//! ## Example
//!
//! ```ignore
//! let drivers = IpcDrivers::new(arena, kernel.clone())?;
//! kernel.attach(&drivers);
//! let fsa = drivers.driver(0).unwrap().ios_open("/dev/fsa", IosOpenMode::empty());
//! ```

pub mod driver;
pub mod event;
pub mod fifo;
pub mod ios;

pub use driver::{IpcCallback, IpcDriver, IpcDriverStats, IpcDriverStatus, RequestId};
pub use event::Event;
pub use fifo::{FifoError, RequestFifo};

use std::sync::Arc;

use cafe_ios::{
    BufferIndex, CoreId, IosResult, IpcBufferArena, IpcResponseHandler, IpcTransport,
};

/// One opened driver per core over a shared arena.
pub struct IpcDrivers {
    drivers: Vec<Arc<IpcDriver>>,
}

impl IpcDrivers {
    /// Initialises and opens a driver for every core the arena was sized for.
    pub fn new(
        arena: Arc<IpcBufferArena>,
        transport: Arc<dyn IpcTransport>,
    ) -> IosResult<Arc<Self>> {
        let mut drivers = Vec::with_capacity(arena.core_count());

        for core in 0..arena.core_count() {
            let driver = IpcDriver::initialise(core, arena.clone(), transport.clone())?;
            driver.open()?;
            drivers.push(Arc::new(driver));
        }

        Ok(Arc::new(Self { drivers }))
    }

    /// Driver for a core.
    pub fn driver(&self, core: CoreId) -> Option<&Arc<IpcDriver>> {
        self.drivers.get(core)
    }

    pub fn core_count(&self) -> usize {
        self.drivers.len()
    }
}

impl IpcResponseHandler for IpcDrivers {
    fn process_responses(&self, core: CoreId, completed: &[BufferIndex]) {
        match self.drivers.get(core) {
            Some(driver) => driver.process_responses(completed),
            None => {
                log::error!("ipc: responses for unknown core {}", core);
                panic!("ipc: responses for unknown core {}", core);
            }
        }
    }
}
