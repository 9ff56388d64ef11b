//! # IOS User API
//!
//! `Open`/`Close`/`Ioctl`/`Ioctlv` built on the request channel. The
//! synchronous forms allocate, submit and block on the reply; the
//! asynchronous forms attach a callback and return as soon as the request
//! is submitted.

use cafe_ios::{IoSpan, IosCommand, IosHandle, IosOpenMode, IosResult, SharedBuffer};

use crate::driver::{IpcCallback, IpcDriver, RequestId};

impl IpcDriver {
    /// Opens a device by name. Returns the handle or a negative error.
    pub fn ios_open(&self, name: &str, mode: IosOpenMode) -> i32 {
        match self.prepare_open(name, mode, None) {
            Ok(request) => self.submit_and_wait(request),
            Err(e) => e.code(),
        }
    }

    pub fn ios_open_async(
        &self,
        name: &str,
        mode: IosOpenMode,
        callback: IpcCallback,
    ) -> IosResult<()> {
        let request = self.prepare_open(name, mode, Some(callback))?;
        self.submit(request);
        Ok(())
    }

    /// Closes an open device handle.
    pub fn ios_close(&self, handle: IosHandle) -> i32 {
        match self.allocate(handle, IosCommand::Close, 0, None) {
            Ok(request) => self.submit_and_wait(request),
            Err(e) => e.code(),
        }
    }

    pub fn ios_close_async(&self, handle: IosHandle, callback: IpcCallback) -> IosResult<()> {
        let request = self.allocate(handle, IosCommand::Close, 0, Some(callback))?;
        self.submit(request);
        Ok(())
    }

    /// Issues a single-buffer device control request.
    pub fn ios_ioctl(
        &self,
        handle: IosHandle,
        request: u32,
        input: Option<IoSpan>,
        output: Option<IoSpan>,
    ) -> i32 {
        match self.prepare_ioctl(handle, request, input, output, None) {
            Ok(request) => self.submit_and_wait(request),
            Err(e) => e.code(),
        }
    }

    pub fn ios_ioctl_async(
        &self,
        handle: IosHandle,
        request: u32,
        input: Option<IoSpan>,
        output: Option<IoSpan>,
        callback: IpcCallback,
    ) -> IosResult<()> {
        let request = self.prepare_ioctl(handle, request, input, output, Some(callback))?;
        self.submit(request);
        Ok(())
    }

    /// Issues a vectored device control request. `vectors` holds
    /// `vec_in` inputs followed by `vec_out` outputs.
    pub fn ios_ioctlv(
        &self,
        handle: IosHandle,
        request: u32,
        vec_in: u32,
        vec_out: u32,
        vectors: Vec<IoSpan>,
    ) -> i32 {
        match self.prepare_ioctlv(handle, request, vec_in, vec_out, vectors, None) {
            Ok(request) => self.submit_and_wait(request),
            Err(e) => e.code(),
        }
    }

    pub fn ios_ioctlv_async(
        &self,
        handle: IosHandle,
        request: u32,
        vec_in: u32,
        vec_out: u32,
        vectors: Vec<IoSpan>,
        callback: IpcCallback,
    ) -> IosResult<()> {
        let request =
            self.prepare_ioctlv(handle, request, vec_in, vec_out, vectors, Some(callback))?;
        self.submit(request);
        Ok(())
    }

    fn submit_and_wait(&self, request: RequestId) -> i32 {
        self.submit(request);
        self.wait_response(request)
    }

    fn prepare_open(
        &self,
        name: &str,
        mode: IosOpenMode,
        callback: Option<IpcCallback>,
    ) -> IosResult<RequestId> {
        let request = self.allocate(0, IosCommand::Open, 0, callback)?;
        let name = SharedBuffer::from_vec(name.as_bytes().to_vec());
        self.with_buffer(request, |buffer| {
            buffer.args[1] = name.len() as u32;
            buffer.args[2] = mode.bits();
            buffer.buffer1 = Some(IoSpan::whole(name));
        });
        Ok(request)
    }

    fn prepare_ioctl(
        &self,
        handle: IosHandle,
        ioctl: u32,
        input: Option<IoSpan>,
        output: Option<IoSpan>,
        callback: Option<IpcCallback>,
    ) -> IosResult<RequestId> {
        let request = self.allocate(handle, IosCommand::Ioctl, 0, callback)?;
        self.with_buffer(request, |buffer| {
            buffer.args[0] = ioctl;
            buffer.args[2] = input.as_ref().map_or(0, |span| span.len() as u32);
            buffer.args[4] = output.as_ref().map_or(0, |span| span.len() as u32);
            buffer.buffer1 = input;
            buffer.buffer2 = output;
        });
        Ok(request)
    }

    fn prepare_ioctlv(
        &self,
        handle: IosHandle,
        ioctl: u32,
        vec_in: u32,
        vec_out: u32,
        vectors: Vec<IoSpan>,
        callback: Option<IpcCallback>,
    ) -> IosResult<RequestId> {
        let request = self.allocate(handle, IosCommand::Ioctlv, 0, callback)?;
        self.with_buffer(request, |buffer| {
            buffer.args[0] = ioctl;
            buffer.args[1] = vec_in;
            buffer.args[2] = vec_out;
            buffer.vectors = vectors;
        });
        Ok(request)
    }
}
