//! # Device Command Router
//!
//! Executes one submitted message buffer against the device layer and
//! stamps the reply in place:
//!
//! - `prev_handle` / `prev_command` keep the request's handle and command
//! - `reply` holds the result code
//! - `command` becomes [`IosCommand::Reply`]
//!
//! Device calls run without the handle table locked, so a device may take
//! as long as it likes without blocking unrelated opens.

use std::sync::Arc;

use cafe_ios::{IosCommand, IosError, IosHandle, IosOpenMode, IpcBuffer};

use super::{DeviceRegistry, OpenHandleTable};

pub struct IosRouter {
    registry: Arc<DeviceRegistry>,
    handles: OpenHandleTable,
}

impl IosRouter {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self {
            registry,
            handles: OpenHandleTable::new(),
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Number of currently open handles.
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    pub fn is_open(&self, handle: IosHandle) -> bool {
        self.handles.contains(handle)
    }

    /// Executes the buffer's command and writes the reply into it.
    ///
    /// # Panics
    ///
    /// Panics on a command tag other than `Open`, `Close`, `Ioctl` or `Ioctlv`.
    pub fn dispatch(&self, buffer: &mut IpcBuffer) -> i32 {
        let handle = buffer.handle;
        let command = buffer.command;

        #[cfg(feature = "debug")]
        log::trace!("ios: dispatch {:?} handle={} args={:x?}", command, handle, buffer.args);

        let reply = match command {
            IosCommand::Open => self.open(buffer),
            IosCommand::Close => self.close(handle),
            IosCommand::Ioctl => self.ioctl(buffer),
            IosCommand::Ioctlv => self.ioctlv(buffer),
            other => {
                log::error!("ios: unsupported command {:?} on handle {}", other, handle);
                panic!("ios: unsupported command {:?}", other);
            }
        };

        buffer.prev_handle = handle;
        buffer.prev_command = command;
        buffer.reply = reply;
        buffer.command = IosCommand::Reply;
        reply
    }

    fn open(&self, buffer: &IpcBuffer) -> i32 {
        let name = match &buffer.buffer1 {
            Some(span) => {
                let len = (buffer.args[1] as usize).min(span.len());
                let bytes = span.sub_span(0, len).read();
                let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                String::from_utf8_lossy(&bytes[..end]).into_owned()
            }
            None => String::new(),
        };
        let mode = IosOpenMode::from_bits_truncate(buffer.args[2]);

        let Some(mut device) = self.registry.create(&name) else {
            log::warn!("ios: open of unknown device {:?}", name);
            return IosError::NoExists.code();
        };

        let reply = device.open(mode);
        if reply < 0 {
            log::debug!("ios: device {:?} refused open: {}", name, reply);
            return reply;
        }

        let handle = self.handles.reserve();
        device.set_handle(handle);
        self.handles.insert(handle, device);
        log::debug!("ios: opened {:?} as handle {}", name, handle);
        handle
    }

    fn close(&self, handle: IosHandle) -> i32 {
        let Some(device) = self.handles.get(handle) else {
            return IosError::InvalidHandle.code();
        };

        let reply = device.lock().close();
        self.handles.remove(handle);
        log::debug!("ios: closed handle {}", handle);
        reply
    }

    fn ioctl(&self, buffer: &IpcBuffer) -> i32 {
        let Some(device) = self.handles.get(buffer.handle) else {
            return IosError::InvalidHandle.code();
        };

        let mut device = device.lock();
        device.ioctl(
            buffer.args[0],
            buffer.buffer1.as_ref(),
            buffer.args[2],
            buffer.buffer2.as_ref(),
            buffer.args[4],
        )
    }

    fn ioctlv(&self, buffer: &IpcBuffer) -> i32 {
        let Some(device) = self.handles.get(buffer.handle) else {
            return IosError::InvalidHandle.code();
        };

        let mut device = device.lock();
        device.ioctlv(buffer.args[0], buffer.args[1], buffer.args[2], &buffer.vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ios::IosDevice;
    use cafe_ios::{IoSpan, SharedBuffer};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Echoes the request code and copies input to output.
    struct Echo {
        closes: Arc<AtomicUsize>,
    }

    impl IosDevice for Echo {
        fn open(&mut self, mode: IosOpenMode) -> i32 {
            if mode.contains(IosOpenMode::WRITE) {
                IosError::Access.code()
            } else {
                0
            }
        }

        fn close(&mut self) -> i32 {
            self.closes.fetch_add(1, Ordering::SeqCst);
            0
        }

        fn ioctl(
            &mut self,
            request: u32,
            input: Option<&IoSpan>,
            _input_len: u32,
            output: Option<&IoSpan>,
            _output_len: u32,
        ) -> i32 {
            if let (Some(input), Some(output)) = (input, output) {
                output.write(&input.read());
            }
            request as i32
        }

        fn ioctlv(&mut self, request: u32, vec_in: u32, vec_out: u32, vectors: &[IoSpan]) -> i32 {
            assert_eq!((vec_in + vec_out) as usize, vectors.len());
            request as i32 + vectors.len() as i32
        }
    }

    fn router() -> (IosRouter, Arc<AtomicUsize>) {
        let closes = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(DeviceRegistry::new());
        let counter = closes.clone();
        registry
            .register(
                "/dev/echo",
                Box::new(move || {
                    Box::new(Echo {
                        closes: counter.clone(),
                    }) as Box<dyn IosDevice>
                }),
            )
            .unwrap();
        (IosRouter::new(registry), closes)
    }

    fn open_buffer(name: &str, mode: IosOpenMode) -> IpcBuffer {
        let mut buffer = IpcBuffer::default();
        let name = SharedBuffer::from_vec(name.as_bytes().to_vec());
        buffer.stamp(0, IosCommand::Open);
        buffer.args[1] = name.len() as u32;
        buffer.args[2] = mode.bits();
        buffer.buffer1 = Some(IoSpan::whole(name));
        buffer
    }

    fn request(handle: IosHandle, command: IosCommand) -> IpcBuffer {
        let mut buffer = IpcBuffer::default();
        buffer.stamp(handle, command);
        buffer
    }

    #[test]
    fn test_open_unknown_device() {
        let (router, _) = router();
        let mut buffer = open_buffer("/dev/nothing", IosOpenMode::empty());
        assert_eq!(router.dispatch(&mut buffer), IosError::NoExists.code());
        assert_eq!(buffer.command, IosCommand::Reply);
        assert_eq!(buffer.prev_command, IosCommand::Open);
        assert_eq!(router.open_handles(), 0);
    }

    #[test]
    fn test_open_assigns_increasing_handles() {
        let (router, _) = router();
        let first = router.dispatch(&mut open_buffer("/dev/echo", IosOpenMode::READ));
        let second = router.dispatch(&mut open_buffer("/dev/echo", IosOpenMode::READ));
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert!(router.is_open(1) && router.is_open(2));
    }

    #[test]
    fn test_refused_open_is_discarded() {
        let (router, _) = router();
        let reply = router.dispatch(&mut open_buffer("/dev/echo", IosOpenMode::WRITE));
        assert_eq!(reply, IosError::Access.code());
        assert_eq!(router.open_handles(), 0);

        // The refusal does not use up a handle number.
        let handle = router.dispatch(&mut open_buffer("/dev/echo", IosOpenMode::READ));
        assert_eq!(handle, 1);
    }

    #[test]
    fn test_close_then_ioctl_is_invalid_handle() {
        let (router, closes) = router();
        let handle = router.dispatch(&mut open_buffer("/dev/echo", IosOpenMode::empty()));

        let mut close = request(handle, IosCommand::Close);
        assert_eq!(router.dispatch(&mut close), 0);
        assert_eq!(close.prev_handle, handle);
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        let mut ioctl = request(handle, IosCommand::Ioctl);
        assert_eq!(router.dispatch(&mut ioctl), IosError::InvalidHandle.code());

        let mut again = request(handle, IosCommand::Close);
        assert_eq!(router.dispatch(&mut again), IosError::InvalidHandle.code());
    }

    #[test]
    fn test_ioctl_forwards_buffers() {
        let (router, _) = router();
        let handle = router.dispatch(&mut open_buffer("/dev/echo", IosOpenMode::empty()));
        let input = IoSpan::whole(SharedBuffer::from_vec(vec![1, 2, 3]));
        let output = IoSpan::zeroed(3);

        let mut buffer = request(handle, IosCommand::Ioctl);
        buffer.args[0] = 0x21;
        buffer.args[2] = 3;
        buffer.args[4] = 3;
        buffer.buffer1 = Some(input);
        buffer.buffer2 = Some(output.clone());

        assert_eq!(router.dispatch(&mut buffer), 0x21);
        assert_eq!(buffer.reply, 0x21);
        assert_eq!(output.read(), vec![1, 2, 3]);
    }

    #[test]
    fn test_ioctlv_forwards_vectors() {
        let (router, _) = router();
        let handle = router.dispatch(&mut open_buffer("/dev/echo", IosOpenMode::empty()));

        let mut buffer = request(handle, IosCommand::Ioctlv);
        buffer.args[0] = 0x10;
        buffer.args[1] = 1;
        buffer.args[2] = 2;
        buffer.vectors = vec![IoSpan::zeroed(4), IoSpan::zeroed(4), IoSpan::zeroed(4)];

        assert_eq!(router.dispatch(&mut buffer), 0x13);
        assert_eq!(buffer.prev_command, IosCommand::Ioctlv);
    }

    #[test]
    #[should_panic]
    fn test_unknown_command_is_fatal() {
        let (router, _) = router();
        router.dispatch(&mut request(1, IosCommand::Seek));
    }

    #[test]
    fn test_duplicate_registration() {
        let registry = DeviceRegistry::new();
        registry
            .register("/dev/echo", Box::new(|| Box::new(Echo { closes: Arc::default() }) as Box<dyn IosDevice>))
            .unwrap();
        assert_eq!(
            registry.register("/dev/echo", Box::new(|| Box::new(Echo { closes: Arc::default() }) as Box<dyn IosDevice>)),
            Err(IosError::Exists)
        );
    }
}
