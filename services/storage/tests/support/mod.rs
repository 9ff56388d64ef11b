//! Scripted `/dev/fsa` device and full-stack harness.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use cafe_fs::fsa::FsaTransfer;
use cafe_fs::{
    FsConfig, FsContext, FsDirEntry, FsReadFlag, FsStat, FsVolumeInfo, FsaRequest, FsaResponse,
    FsaStatus, FSA_DEVICE_NAME,
};
use cafe_ios::{
    BufferIndex, CoreId, IoSpan, IosCommand, IosHandle, IosOpenMode, IpcBufferArena, IpcConfig,
    IpcResponseHandler, IpcTransport,
};
use cafe_ipc::IpcDrivers;
use cafe_kernel::{DeliveryMode, DeviceRegistry, IosDevice, IosRouter, KernelConfig, KernelIpc};
use spin::Mutex;

pub struct OpenFile {
    pub path: String,
    pub pos: u32,
}

/// In-memory volume plus failure injection.
#[derive(Default)]
pub struct FsaScript {
    pub files: BTreeMap<String, Vec<u8>>,
    pub dirs: BTreeSet<String>,
    pub cwd: String,
    pub volume: FsVolumeInfo,
    pub open_files: BTreeMap<u32, OpenFile>,
    pub open_dirs: BTreeMap<u32, VecDeque<String>>,
    pub next_handle: u32,
    /// One entry per upcoming request: `Some(status)` answers with that
    /// status instead of executing, `None` executes normally
    pub forced: VecDeque<Option<i32>>,
    /// Every request the device received
    pub log: Vec<FsaRequest>,
}

pub type SharedScript = Arc<Mutex<FsaScript>>;

impl FsaScript {
    fn execute(&mut self, request: FsaRequest, data: Option<&IoSpan>) -> (i32, FsaResponse) {
        self.log.push(request.clone());

        if let Some(Some(status)) = self.forced.pop_front() {
            return (status, FsaResponse::Empty);
        }

        match request {
            FsaRequest::OpenFile { path, .. } => {
                if !self.files.contains_key(&path) {
                    return (FsaStatus::NotFound.code(), FsaResponse::Empty);
                }
                let handle = self.allocate_handle();
                self.open_files.insert(handle, OpenFile { path, pos: 0 });
                (0, FsaResponse::Handle(handle))
            }
            FsaRequest::ReadFile(transfer) => self.read(&transfer, data),
            FsaRequest::WriteFile(transfer) => self.write(&transfer, data),
            FsaRequest::GetPosFile { handle } => match self.open_files.get(&handle) {
                Some(file) => (0, FsaResponse::Pos(file.pos)),
                None => (FsaStatus::InvalidFileHandle.code(), FsaResponse::Empty),
            },
            FsaRequest::SetPosFile { handle, pos } => match self.open_files.get_mut(&handle) {
                Some(file) => {
                    file.pos = pos;
                    (0, FsaResponse::Empty)
                }
                None => (FsaStatus::InvalidFileHandle.code(), FsaResponse::Empty),
            },
            FsaRequest::StatFile { handle } => {
                let Some(file) = self.open_files.get(&handle) else {
                    return (FsaStatus::InvalidFileHandle.code(), FsaResponse::Empty);
                };
                let size = self.files.get(&file.path).map_or(0, |data| data.len() as u32);
                let stat = FsStat {
                    size,
                    alloc_size: size.next_multiple_of(0x200),
                    entry_id: handle,
                    ..FsStat::default()
                };
                (0, FsaResponse::Stat(stat))
            }
            FsaRequest::IsEof { handle } => {
                let Some(file) = self.open_files.get(&handle) else {
                    return (FsaStatus::InvalidFileHandle.code(), FsaResponse::Empty);
                };
                let size = self.files.get(&file.path).map_or(0, |data| data.len() as u32);
                if file.pos >= size {
                    (FsaStatus::EndOfFile.code(), FsaResponse::Empty)
                } else {
                    (0, FsaResponse::Empty)
                }
            }
            FsaRequest::CloseFile { handle } => match self.open_files.remove(&handle) {
                Some(_) => (0, FsaResponse::Empty),
                None => (FsaStatus::InvalidFileHandle.code(), FsaResponse::Empty),
            },
            FsaRequest::GetCwd => (0, FsaResponse::Cwd(self.cwd.clone())),
            FsaRequest::ChangeDir { path } => {
                self.cwd = path;
                (0, FsaResponse::Empty)
            }
            FsaRequest::MakeDir { path, .. } => {
                if !self.dirs.insert(path) {
                    return (FsaStatus::AlreadyExists.code(), FsaResponse::Empty);
                }
                (0, FsaResponse::Empty)
            }
            FsaRequest::Remove { path } => {
                if self.files.remove(&path).is_some() || self.dirs.remove(&path) {
                    (0, FsaResponse::Empty)
                } else {
                    (FsaStatus::NotFound.code(), FsaResponse::Empty)
                }
            }
            FsaRequest::OpenDir { path } => {
                if !self.dirs.contains(&path) {
                    return (FsaStatus::NotFound.code(), FsaResponse::Empty);
                }
                let prefix = format!("{}/", path);
                let names = self
                    .files
                    .keys()
                    .filter_map(|name| name.strip_prefix(&prefix))
                    .map(String::from)
                    .collect();
                let handle = self.allocate_handle();
                self.open_dirs.insert(handle, names);
                (0, FsaResponse::Handle(handle))
            }
            FsaRequest::ReadDir { handle } => match self.open_dirs.get_mut(&handle) {
                Some(names) => match names.pop_front() {
                    Some(name) => (
                        0,
                        FsaResponse::DirEntry(FsDirEntry {
                            stat: FsStat::default(),
                            name,
                        }),
                    ),
                    None => (FsaStatus::EndOfDir.code(), FsaResponse::Empty),
                },
                None => (FsaStatus::InvalidDirHandle.code(), FsaResponse::Empty),
            },
            FsaRequest::CloseDir { handle } => match self.open_dirs.remove(&handle) {
                Some(_) => (0, FsaResponse::Empty),
                None => (FsaStatus::InvalidDirHandle.code(), FsaResponse::Empty),
            },
            FsaRequest::GetVolumeInfo { .. } => {
                let mut info = self.volume.clone();
                info.reserved = [7, 7, 7, 7];
                (0, FsaResponse::VolumeInfo(info))
            }
            _ => (0, FsaResponse::Empty),
        }
    }

    fn allocate_handle(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    fn position(&self, transfer: &FsaTransfer) -> Option<(String, u32)> {
        let file = self.open_files.get(&transfer.handle)?;
        let pos = if transfer.flags.contains(FsReadFlag::WITH_POS) {
            transfer.pos
        } else {
            file.pos
        };
        Some((file.path.clone(), pos))
    }

    fn read(&mut self, transfer: &FsaTransfer, data: Option<&IoSpan>) -> (i32, FsaResponse) {
        let Some((path, pos)) = self.position(transfer) else {
            return (FsaStatus::InvalidFileHandle.code(), FsaResponse::Empty);
        };
        let contents = self.files.get(&path).cloned().unwrap_or_default();
        let start = (pos as usize).min(contents.len());
        let end = (start + transfer.byte_len() as usize).min(contents.len());

        if let Some(data) = data {
            data.write(&contents[start..end]);
        }
        if !transfer.flags.contains(FsReadFlag::WITH_POS) {
            if let Some(file) = self.open_files.get_mut(&transfer.handle) {
                file.pos = end as u32;
            }
        }
        ((end - start) as i32, FsaResponse::Empty)
    }

    fn write(&mut self, transfer: &FsaTransfer, data: Option<&IoSpan>) -> (i32, FsaResponse) {
        let Some((path, pos)) = self.position(transfer) else {
            return (FsaStatus::InvalidFileHandle.code(), FsaResponse::Empty);
        };
        let bytes = data.map(IoSpan::read).unwrap_or_default();
        let len = bytes.len().min(transfer.byte_len() as usize);

        let contents = self.files.entry(path).or_default();
        let start = pos as usize;
        if contents.len() < start + len {
            contents.resize(start + len, 0);
        }
        contents[start..start + len].copy_from_slice(&bytes[..len]);

        if !transfer.flags.contains(FsReadFlag::WITH_POS) {
            if let Some(file) = self.open_files.get_mut(&transfer.handle) {
                file.pos = (start + len) as u32;
            }
        }
        (len as i32, FsaResponse::Empty)
    }
}

/// `/dev/fsa` backed by a shared script.
pub struct FakeFsa {
    script: SharedScript,
}

impl FakeFsa {
    fn answer(&self, request: &IoSpan, data: Option<&IoSpan>, response: Option<&IoSpan>) -> i32 {
        let request = match FsaRequest::decode(&request.read()) {
            Ok(request) => request,
            Err(_) => return FsaStatus::InvalidParam.code(),
        };

        let (status, reply) = self.script.lock().execute(request, data);
        if let (Some(response), Ok(bytes)) = (response, reply.encode()) {
            response.write(&bytes);
        }
        status
    }
}

impl IosDevice for FakeFsa {
    fn open(&mut self, _mode: IosOpenMode) -> i32 {
        0
    }

    fn ioctl(
        &mut self,
        _request: u32,
        input: Option<&IoSpan>,
        _input_len: u32,
        output: Option<&IoSpan>,
        _output_len: u32,
    ) -> i32 {
        match input {
            Some(input) => self.answer(input, None, output),
            None => FsaStatus::InvalidBuffer.code(),
        }
    }

    fn ioctlv(&mut self, _request: u32, _vec_in: u32, _vec_out: u32, vectors: &[IoSpan]) -> i32 {
        match vectors {
            [request, data, response] => self.answer(request, Some(data), Some(response)),
            _ => FsaStatus::InvalidParam.code(),
        }
    }
}

/// Sits between the drivers and the kernel and counts the requests each
/// device handle has outstanding. Opens are not counted.
pub struct InFlight {
    arena: Arc<IpcBufferArena>,
    kernel: Arc<KernelIpc>,
    drivers: Mutex<Weak<IpcDrivers>>,
    state: Mutex<InFlightState>,
}

#[derive(Default)]
struct InFlightState {
    pending: BTreeMap<BufferIndex, IosHandle>,
    active: BTreeMap<IosHandle, usize>,
    peak: BTreeMap<IosHandle, usize>,
}

impl InFlight {
    /// Most requests `handle` ever had outstanding at once.
    pub fn peak(&self, handle: IosHandle) -> usize {
        self.state.lock().peak.get(&handle).copied().unwrap_or(0)
    }
}

impl IpcTransport for InFlight {
    fn submit(&self, core: CoreId, buffer: BufferIndex) {
        let target = self
            .arena
            .lock(buffer)
            .filter(|b| b.command != IosCommand::Open)
            .map(|b| b.handle);

        if let Some(handle) = target {
            let mut state = self.state.lock();
            state.pending.insert(buffer, handle);
            let active = state.active.entry(handle).or_default();
            *active += 1;
            let active = *active;
            let peak = state.peak.entry(handle).or_default();
            *peak = (*peak).max(active);
        }

        self.kernel.submit(core, buffer);
    }
}

impl IpcResponseHandler for InFlight {
    fn process_responses(&self, core: CoreId, completed: &[BufferIndex]) {
        {
            let mut state = self.state.lock();
            for index in completed {
                if let Some(handle) = state.pending.remove(index) {
                    if let Some(active) = state.active.get_mut(&handle) {
                        *active -= 1;
                    }
                }
            }
        }

        let drivers = self.drivers.lock().upgrade();
        if let Some(drivers) = drivers {
            drivers.process_responses(core, completed);
        }
    }
}

pub struct Harness {
    pub script: SharedScript,
    pub kernel: Arc<KernelIpc>,
    pub in_flight: Arc<InFlight>,
    pub fs: Arc<FsContext>,
}

pub fn harness(delivery: DeliveryMode, config: FsConfig) -> Harness {
    let script: SharedScript = Arc::new(Mutex::new(FsaScript {
        cwd: String::from("/vol"),
        ..FsaScript::default()
    }));

    let registry = Arc::new(DeviceRegistry::new());
    let device_script = script.clone();
    registry
        .register(
            FSA_DEVICE_NAME,
            Box::new(move || {
                Box::new(FakeFsa {
                    script: device_script.clone(),
                }) as Box<dyn IosDevice>
            }),
        )
        .unwrap();

    let arena = Arc::new(IpcBufferArena::new(&IpcConfig::default()));
    let kernel = KernelIpc::new(
        KernelConfig { delivery },
        Arc::new(IosRouter::new(registry)),
        arena.clone(),
    );
    let in_flight = Arc::new(InFlight {
        arena: arena.clone(),
        kernel: kernel.clone(),
        drivers: Mutex::new(Weak::new()),
        state: Mutex::new(InFlightState::default()),
    });
    let drivers = IpcDrivers::new(arena, in_flight.clone()).unwrap();
    *in_flight.drivers.lock() = Arc::downgrade(&drivers);
    kernel.attach(&in_flight);

    let fs = FsContext::new(drivers, config).unwrap();
    Harness {
        script,
        kernel,
        in_flight,
        fs,
    }
}

impl Harness {
    /// Queues statuses for the next requests, in order.
    pub fn force(&self, statuses: &[Option<i32>]) {
        self.script.lock().forced.extend(statuses.iter().copied());
    }

    pub fn requests(&self) -> Vec<FsaRequest> {
        self.script.lock().log.clone()
    }

    pub fn add_file(&self, path: &str, contents: Vec<u8>) {
        self.script.lock().files.insert(path.to_string(), contents);
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.script.lock().files.get(path).cloned()
    }
}

pub fn small_requests(max_bytes_per_request: u32) -> FsConfig {
    FsConfig {
        max_bytes_per_request,
        ..FsConfig::default()
    }
}

pub fn both_modes() -> [DeliveryMode; 2] {
    [DeliveryMode::Inline, DeliveryMode::Threaded]
}

/// Polls `condition` until it holds or five seconds pass.
pub fn wait_until(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached");
        std::thread::sleep(Duration::from_millis(1));
    }
}
