//! # Status Model
//!
//! Two code spaces meet here. The FSA device answers with [`FsaStatus`]
//! codes; callers see [`FsStatus`]. [`project`] maps one onto the other and
//! decides what the command queue does with the result.
//!
//! | device status                          | outcome                         |
//! |----------------------------------------|---------------------------------|
//! | `Busy`                                 | retry at the front of the queue |
//! | `MediaNotReady`                        | volume → WrongMedia             |
//! | `WriteProtected`                       | volume → MediaError             |
//! | parameter / handle / range / resources | raw code, never masked          |
//! | `InvalidMedia`                         | dropped, nothing delivered      |
//! | `Cancelled`, `EndOfFile`, `EndOfDir`   | `Cancelled`, `End`              |
//! | category errors                        | client status, maskable         |
//! | `DataCorrupted`, `MediaError`          | unrecoverable                   |

use core::fmt;

use bitflags::bitflags;

use crate::volume::VolumeState;

/// Status codes returned by the FSA device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum FsaStatus {
    Ok = 0,
    NotInit = -0x30001,
    Busy = -0x30002,
    Cancelled = -0x30003,
    EndOfDir = -0x30004,
    EndOfFile = -0x30005,
    MaxMountpoints = -0x30010,
    MaxVolumes = -0x30011,
    MaxClients = -0x30012,
    MaxFiles = -0x30013,
    MaxDirs = -0x30014,
    AlreadyOpen = -0x30015,
    AlreadyExists = -0x30016,
    NotFound = -0x30017,
    NotEmpty = -0x30018,
    AccessError = -0x30019,
    PermissionError = -0x3001A,
    DataCorrupted = -0x3001B,
    StorageFull = -0x3001C,
    JournalFull = -0x3001D,
    LinkEntry = -0x3001E,
    UnavailableCmd = -0x3001F,
    UnsupportedCmd = -0x30020,
    InvalidParam = -0x30021,
    InvalidPath = -0x30022,
    InvalidBuffer = -0x30023,
    InvalidAlignment = -0x30024,
    InvalidClientHandle = -0x30025,
    InvalidFileHandle = -0x30026,
    InvalidDirHandle = -0x30027,
    NotFile = -0x30028,
    NotDir = -0x30029,
    FileTooBig = -0x3002A,
    OutOfRange = -0x3002B,
    OutOfResources = -0x3002C,
    MediaNotReady = -0x30040,
    MediaError = -0x30041,
    WriteProtected = -0x30042,
    InvalidMedia = -0x30043,
}

impl FsaStatus {
    const ALL: [FsaStatus; 39] = [
        FsaStatus::Ok,
        FsaStatus::NotInit,
        FsaStatus::Busy,
        FsaStatus::Cancelled,
        FsaStatus::EndOfDir,
        FsaStatus::EndOfFile,
        FsaStatus::MaxMountpoints,
        FsaStatus::MaxVolumes,
        FsaStatus::MaxClients,
        FsaStatus::MaxFiles,
        FsaStatus::MaxDirs,
        FsaStatus::AlreadyOpen,
        FsaStatus::AlreadyExists,
        FsaStatus::NotFound,
        FsaStatus::NotEmpty,
        FsaStatus::AccessError,
        FsaStatus::PermissionError,
        FsaStatus::DataCorrupted,
        FsaStatus::StorageFull,
        FsaStatus::JournalFull,
        FsaStatus::LinkEntry,
        FsaStatus::UnavailableCmd,
        FsaStatus::UnsupportedCmd,
        FsaStatus::InvalidParam,
        FsaStatus::InvalidPath,
        FsaStatus::InvalidBuffer,
        FsaStatus::InvalidAlignment,
        FsaStatus::InvalidClientHandle,
        FsaStatus::InvalidFileHandle,
        FsaStatus::InvalidDirHandle,
        FsaStatus::NotFile,
        FsaStatus::NotDir,
        FsaStatus::FileTooBig,
        FsaStatus::OutOfRange,
        FsaStatus::OutOfResources,
        FsaStatus::MediaNotReady,
        FsaStatus::MediaError,
        FsaStatus::WriteProtected,
        FsaStatus::InvalidMedia,
    ];

    pub const fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|status| status.code() == code)
    }
}

impl fmt::Display for FsaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({:#x})", self, self.code())
    }
}

/// Client-facing failure of a filesystem command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsStatus {
    Cancelled,
    End,
    Max,
    AlreadyOpen,
    Exists,
    NotFound,
    NotFile,
    NotDirectory,
    AccessError,
    PermissionError,
    FileTooBig,
    StorageFull,
    JournalFull,
    UnsupportedCmd,
    MediaNotReady,
    MediaError,
    Corrupted,
    /// Caller misuse or an internal failure of the command machinery
    FatalError,
    /// A device status passed through unchanged
    Device(i32),
}

impl FsStatus {
    pub fn code(self) -> i32 {
        match self {
            FsStatus::Cancelled => -1,
            FsStatus::End => -2,
            FsStatus::Max => -3,
            FsStatus::AlreadyOpen => -4,
            FsStatus::Exists => -5,
            FsStatus::NotFound => -6,
            FsStatus::NotFile => -7,
            FsStatus::NotDirectory => -8,
            FsStatus::AccessError => -9,
            FsStatus::PermissionError => -10,
            FsStatus::FileTooBig => -11,
            FsStatus::StorageFull => -12,
            FsStatus::JournalFull => -13,
            FsStatus::UnsupportedCmd => -14,
            FsStatus::MediaNotReady => -15,
            FsStatus::MediaError => -17,
            FsStatus::Corrupted => -18,
            FsStatus::FatalError => -0x400,
            FsStatus::Device(code) => code,
        }
    }
}

impl fmt::Display for FsStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsStatus::Cancelled => write!(f, "command cancelled"),
            FsStatus::End => write!(f, "end of file or directory"),
            FsStatus::Max => write!(f, "resource limit reached"),
            FsStatus::AlreadyOpen => write!(f, "already open"),
            FsStatus::Exists => write!(f, "already exists"),
            FsStatus::NotFound => write!(f, "not found"),
            FsStatus::NotFile => write!(f, "not a file"),
            FsStatus::NotDirectory => write!(f, "not a directory"),
            FsStatus::AccessError => write!(f, "access denied"),
            FsStatus::PermissionError => write!(f, "permission denied"),
            FsStatus::FileTooBig => write!(f, "file too big"),
            FsStatus::StorageFull => write!(f, "storage full"),
            FsStatus::JournalFull => write!(f, "journal full"),
            FsStatus::UnsupportedCmd => write!(f, "unsupported command"),
            FsStatus::MediaNotReady => write!(f, "media not ready"),
            FsStatus::MediaError => write!(f, "media error"),
            FsStatus::Corrupted => write!(f, "data corrupted"),
            FsStatus::FatalError => write!(f, "fatal error"),
            FsStatus::Device(code) => match FsaStatus::from_code(*code) {
                Some(status) => write!(f, "device status {}", status),
                None => write!(f, "device status {:#x}", code),
            },
        }
    }
}

/// Outcome of a filesystem command: a non-negative value (bytes, chunks,
/// zero) or a failure.
pub type FsResult = Result<u32, FsStatus>;

bitflags! {
    /// Error categories a caller can ask to be escalated to a fatal volume
    /// state instead of being returned.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FsErrorFlag: u32 {
        const MAX = 1 << 0;
        const ALREADY_OPEN = 1 << 1;
        const EXISTS = 1 << 2;
        const NOT_FOUND = 1 << 3;
        const NOT_FILE = 1 << 4;
        const NOT_DIR = 1 << 5;
        const ACCESS_ERROR = 1 << 6;
        const PERMISSION_ERROR = 1 << 7;
        const FILE_TOO_BIG = 1 << 8;
        const STORAGE_FULL = 1 << 9;
        const UNSUPPORTED_CMD = 1 << 10;
        const JOURNAL_FULL = 1 << 11;
        const ALL = u32::MAX;
    }
}

/// What the command queue does with a device status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    /// Hand the result to the command's completion.
    Deliver(FsResult),
    /// Put the command back at the front of the queue unchanged.
    Retry,
    /// Move the volume to a new state and deliver nothing.
    Transition(VolumeState),
    /// Deliver nothing at all.
    Drop,
    /// No recovery path exists for this status.
    Unrecoverable(FsaStatus),
}

/// Maps a device status onto a client outcome under `mask`.
pub fn project(status: i32, mask: FsErrorFlag) -> Projection {
    if status >= 0 {
        return Projection::Deliver(Ok(status as u32));
    }

    let Some(known) = FsaStatus::from_code(status) else {
        // Unknown codes fall in every category.
        return categorized(FsStatus::Device(status), FsErrorFlag::ALL, mask);
    };

    match known {
        FsaStatus::Ok => Projection::Deliver(Ok(0)),
        FsaStatus::Busy => Projection::Retry,
        FsaStatus::MediaNotReady => Projection::Transition(VolumeState::WrongMedia),
        FsaStatus::WriteProtected => Projection::Transition(VolumeState::MediaError),
        FsaStatus::InvalidMedia => Projection::Drop,
        FsaStatus::DataCorrupted | FsaStatus::MediaError => Projection::Unrecoverable(known),

        FsaStatus::NotInit
        | FsaStatus::OutOfRange
        | FsaStatus::OutOfResources
        | FsaStatus::LinkEntry
        | FsaStatus::UnavailableCmd
        | FsaStatus::InvalidParam
        | FsaStatus::InvalidPath
        | FsaStatus::InvalidBuffer
        | FsaStatus::InvalidAlignment
        | FsaStatus::InvalidClientHandle
        | FsaStatus::InvalidFileHandle
        | FsaStatus::InvalidDirHandle => Projection::Deliver(Err(FsStatus::Device(status))),
        FsaStatus::UnsupportedCmd => Projection::Deliver(Err(FsStatus::UnsupportedCmd)),

        FsaStatus::Cancelled => Projection::Deliver(Err(FsStatus::Cancelled)),
        FsaStatus::EndOfDir | FsaStatus::EndOfFile => Projection::Deliver(Err(FsStatus::End)),

        FsaStatus::MaxMountpoints
        | FsaStatus::MaxVolumes
        | FsaStatus::MaxClients
        | FsaStatus::MaxFiles
        | FsaStatus::MaxDirs => categorized(FsStatus::Max, FsErrorFlag::MAX, mask),
        FsaStatus::AlreadyOpen => categorized(FsStatus::AlreadyOpen, FsErrorFlag::ALREADY_OPEN, mask),
        FsaStatus::NotFound => categorized(FsStatus::NotFound, FsErrorFlag::NOT_FOUND, mask),
        FsaStatus::AlreadyExists | FsaStatus::NotEmpty => {
            categorized(FsStatus::Exists, FsErrorFlag::EXISTS, mask)
        }
        FsaStatus::AccessError => categorized(FsStatus::AccessError, FsErrorFlag::ACCESS_ERROR, mask),
        FsaStatus::PermissionError => {
            categorized(FsStatus::PermissionError, FsErrorFlag::PERMISSION_ERROR, mask)
        }
        FsaStatus::StorageFull => categorized(FsStatus::StorageFull, FsErrorFlag::STORAGE_FULL, mask),
        FsaStatus::JournalFull => categorized(FsStatus::JournalFull, FsErrorFlag::JOURNAL_FULL, mask),
        FsaStatus::NotFile => categorized(FsStatus::NotFile, FsErrorFlag::NOT_FILE, mask),
        FsaStatus::NotDir => categorized(FsStatus::NotDirectory, FsErrorFlag::NOT_DIR, mask),
        FsaStatus::FileTooBig => categorized(FsStatus::FileTooBig, FsErrorFlag::FILE_TOO_BIG, mask),
    }
}

fn categorized(status: FsStatus, category: FsErrorFlag, mask: FsErrorFlag) -> Projection {
    if mask.intersects(category) {
        Projection::Transition(VolumeState::Fatal)
    } else {
        Projection::Deliver(Err(status))
    }
}
