//! Open-handle table.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use cafe_ios::IosHandle;
use spin::Mutex;

use super::IosDevice;

/// A device shared between the table and an in-progress request.
pub type SharedDevice = Arc<Mutex<Box<dyn IosDevice>>>;

/// Maps handles to open devices. Handles start at 1 and are never reused.
pub struct OpenHandleTable {
    devices: Mutex<BTreeMap<IosHandle, SharedDevice>>,
    next_handle: AtomicI32,
}

impl OpenHandleTable {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(BTreeMap::new()),
            next_handle: AtomicI32::new(1),
        }
    }

    /// Reserves the next handle without publishing a device under it.
    pub fn reserve(&self) -> IosHandle {
        self.next_handle.fetch_add(1, Ordering::SeqCst)
    }

    pub fn insert(&self, handle: IosHandle, device: Box<dyn IosDevice>) -> SharedDevice {
        let device = Arc::new(Mutex::new(device));
        self.devices.lock().insert(handle, device.clone());
        device
    }

    pub fn get(&self, handle: IosHandle) -> Option<SharedDevice> {
        self.devices.lock().get(&handle).cloned()
    }

    pub fn remove(&self, handle: IosHandle) -> Option<SharedDevice> {
        self.devices.lock().remove(&handle)
    }

    pub fn contains(&self, handle: IosHandle) -> bool {
        self.devices.lock().contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.lock().is_empty()
    }
}

impl Default for OpenHandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cafe_ios::{IoSpan, IosOpenMode};

    struct Null;

    impl IosDevice for Null {
        fn open(&mut self, _mode: IosOpenMode) -> i32 {
            0
        }

        fn ioctl(
            &mut self,
            _request: u32,
            _input: Option<&IoSpan>,
            _input_len: u32,
            _output: Option<&IoSpan>,
            _output_len: u32,
        ) -> i32 {
            0
        }

        fn ioctlv(&mut self, _request: u32, _vec_in: u32, _vec_out: u32, _vectors: &[IoSpan]) -> i32 {
            0
        }
    }

    #[test]
    fn test_handles_start_at_one() {
        let table = OpenHandleTable::new();
        assert_eq!(table.reserve(), 1);
        assert_eq!(table.reserve(), 2);
    }

    #[test]
    fn test_removed_handle_is_not_reused() {
        let table = OpenHandleTable::new();
        let first = table.reserve();
        table.insert(first, Box::new(Null));
        assert!(table.remove(first).is_some());
        assert!(table.is_empty());

        let second = table.reserve();
        assert_ne!(first, second);
        assert!(table.get(first).is_none());
    }
}
