//! # IOS Device Layer
//!
//! Devices are capabilities addressed by name on `Open` and by handle
//! afterwards. Concrete devices are supplied by collaborators and
//! registered with a [`DeviceRegistry`] before the router starts serving.
//!
//! ```text
//!   DeviceRegistry               OpenHandleTable
//!   "/dev/fsa" → factory         1 → FsaDevice
//!   "/dev/acp" → factory         2 → AcpDevice
//!                    ╲             ╱
//!                     IosRouter::dispatch(buffer)
//! ```

pub mod handle;
pub mod router;

pub use handle::{OpenHandleTable, SharedDevice};
pub use router::IosRouter;

use std::collections::BTreeMap;

use cafe_ios::{IoSpan, IosError, IosHandle, IosOpenMode, IosResult};
use spin::RwLock;

/// A device capability.
///
/// Every operation answers with a raw reply: non-negative on success,
/// a negative IOS or device-specific code on failure.
pub trait IosDevice: Send {
    /// Called once after creation. A negative reply discards the device.
    fn open(&mut self, mode: IosOpenMode) -> i32;

    /// Called before the device is dropped.
    fn close(&mut self) -> i32 {
        IosError::Ok.code()
    }

    /// Single-buffer control request.
    fn ioctl(
        &mut self,
        request: u32,
        input: Option<&IoSpan>,
        input_len: u32,
        output: Option<&IoSpan>,
        output_len: u32,
    ) -> i32;

    /// Vectored control request: `vec_in` inputs followed by `vec_out` outputs.
    fn ioctlv(&mut self, request: u32, vec_in: u32, vec_out: u32, vectors: &[IoSpan]) -> i32;

    /// Informs the device of the handle it was registered under.
    fn set_handle(&mut self, _handle: IosHandle) {}
}

/// Creates a fresh device instance for each `Open`.
pub type DeviceFactory = Box<dyn Fn() -> Box<dyn IosDevice> + Send + Sync>;

/// Name → factory registry.
pub struct DeviceRegistry {
    factories: RwLock<BTreeMap<String, DeviceFactory>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(BTreeMap::new()),
        }
    }

    /// Registers a device factory under `name`.
    pub fn register(&self, name: &str, factory: DeviceFactory) -> IosResult<()> {
        let mut factories = self.factories.write();

        if factories.contains_key(name) {
            return Err(IosError::Exists);
        }

        factories.insert(String::from(name), factory);
        log::debug!("ios: registered device {}", name);
        Ok(())
    }

    /// Instantiates the device registered under `name`.
    pub fn create(&self, name: &str) -> Option<Box<dyn IosDevice>> {
        self.factories.read().get(name).map(|factory| factory())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
